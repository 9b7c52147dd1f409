/// Error kinds shared by every autograder crate.
///
/// **Propagation rules:**
/// - `Validation` maps to a 400-style response at the API edge
/// - `Build` failures are cached so the next quick build retries
/// - `Grader` failures still carry stdout/stderr for the student
/// - `Secure` messages may be shown to end users verbatim
/// - `Joined` collects cleanup errors that follow a primary error
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AutograderError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("submission rejected: {0}")]
    Rejection(String),

    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("image build failed for '{image}': {message}")]
    Build { image: String, message: String },

    #[error("grader failed: {message}")]
    Grader {
        message: String,
        stdout: String,
        stderr: String,
    },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("{0}")]
    Secure(String),

    #[error("lms error: {0}")]
    Lms(String),

    #[error("io error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{}", JoinedDisplay(.0))]
    Joined(Vec<AutograderError>),
}

pub type Result<T> = std::result::Result<T, AutograderError>;

struct JoinedDisplay<'a>(&'a [AutograderError]);

impl fmt::Display for JoinedDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, err) in self.0.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl AutograderError {
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        AutograderError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        AutograderError::Validation(message.into())
    }

    pub fn infra(message: impl Into<String>) -> Self {
        AutograderError::Infrastructure(message.into())
    }

    /// Combine a primary outcome with a secondary (usually cleanup) outcome.
    /// Either side may be absent; nested joins are flattened.
    pub fn join(
        primary: Option<AutograderError>,
        secondary: Option<AutograderError>,
    ) -> Option<AutograderError> {
        let mut errors = Vec::new();
        for err in [primary, secondary].into_iter().flatten() {
            match err {
                AutograderError::Joined(inner) => errors.extend(inner),
                other => errors.push(other),
            }
        }

        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(AutograderError::Joined(errors)),
        }
    }

    /// Join two results, keeping the first error as the primary one.
    pub fn join_results(primary: Result<()>, secondary: Result<()>) -> Result<()> {
        match Self::join(primary.err(), secondary.err()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, AutograderError::Secure(_))
    }

    pub fn is_validation(&self) -> bool {
        match self {
            AutograderError::Validation(_) => true,
            AutograderError::Joined(inner) => inner.iter().any(|e| e.is_validation()),
            _ => false,
        }
    }

    /// Message that can be returned to an end user.
    /// Only secure and validation errors pass through; everything else is generic.
    pub fn user_message(&self) -> String {
        match self {
            AutograderError::Secure(msg) => msg.clone(),
            AutograderError::Validation(msg) => msg.clone(),
            AutograderError::Rejection(msg) => msg.clone(),
            AutograderError::Grader { message, .. } => message.clone(),
            AutograderError::Joined(inner) => inner
                .iter()
                .find(|e| e.is_secure())
                .map(|e| e.user_message())
                .unwrap_or_else(|| "internal autograder error".to_string()),
            _ => "internal autograder error".to_string(),
        }
    }
}
