pub mod docker;
pub mod filecache;
pub mod files;
pub mod grader;
pub mod image;
pub mod limits;
pub mod lms;
pub mod lockmanager;
pub mod reconcile;
pub mod registry;
pub mod scoring;
pub mod store;
pub mod tasks;

// Re-export commonly used types for convenience
pub use docker::{ContainerOutput, ContainerRuntime, DockerRuntime, RunRequest};
pub use grader::{GradeOptions, GradeOutcome, GradingEngine};
pub use image::{AssignmentSource, BuildOptions, ImageSource};
pub use lms::{LmsAdapter, MemoryLms};
pub use lockmanager::LockManager;
pub use reconcile::UploadPlan;
pub use registry::{CourseEntry, CourseRegistry};
pub use store::{GradingResult, SubmissionStore};
pub use tasks::{TaskContext, TaskKind, TaskScheduler};
