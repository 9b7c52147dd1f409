// Prometheus metrics for the autograder server

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Graded submissions (outcome: graded, rejected, failed, error)
    pub static ref GRADES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("autograder_grades_total", "Total number of grading requests by outcome"),
        &["course", "assignment", "outcome"]
    )
    .expect("metric can be created");

    pub static ref GRADE_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "autograder_grade_duration_ms",
            "Wall time of a grading request in milliseconds"
        )
        .buckets(vec![100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0, 120000.0]),
        &["course"]
    )
    .expect("metric can be created");

    pub static ref REJECTIONS: CounterVec = CounterVec::new(
        Opts::new("autograder_rejections_total", "Total submissions rejected by limits"),
        &["reason"]
    )
    .expect("metric can be created");

    pub static ref API_REQUESTS: CounterVec = CounterVec::new(
        Opts::new("autograder_api_requests_total", "Total API requests"),
        &["endpoint", "method", "status"]
    )
    .expect("metric can be created");
}

/// Register every collector with the server registry. Call once at boot.
pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(GRADES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(GRADE_DURATION.clone()))?;
    REGISTRY.register(Box::new(REJECTIONS.clone()))?;
    REGISTRY.register(Box::new(API_REQUESTS.clone()))?;
    Ok(())
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub fn record_grade(course: &str, assignment: &str, outcome: &str, duration_ms: f64) {
    GRADES_TOTAL
        .with_label_values(&[course, assignment, outcome])
        .inc();
    GRADE_DURATION.with_label_values(&[course]).observe(duration_ms);
}

pub fn record_rejection(reason: &str) {
    REJECTIONS.with_label_values(&[reason]).inc();
}

pub fn record_request(endpoint: &str, method: &str, status: u16) {
    API_REQUESTS
        .with_label_values(&[endpoint, method, &status.to_string()])
        .inc();
}
