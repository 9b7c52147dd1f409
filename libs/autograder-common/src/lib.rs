pub mod config;
pub mod error;
pub mod fileops;
pub mod filespec;
pub mod ids;
pub mod keys;
pub mod model;
pub mod policy;
pub mod timestamp;
pub mod types;

// Re-export commonly used types for convenience
pub use config::Config;
pub use error::{AutograderError, Result};
pub use fileops::FileOperation;
pub use filespec::{FileSpec, FileSpecType};
pub use ids::{validate_id, validate_user, SubmissionId};
pub use model::{Assignment, Course};
pub use policy::{LatePolicy, LatePolicyType, RejectReason, SubmissionLimit};
pub use timestamp::Timestamp;
pub use types::{GradedAssignment, GradingInfo, ScoringInfo, SubmissionHistoryItem};
