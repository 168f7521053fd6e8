//! Upload progress reporting.

pub mod progress;
pub mod progress_stream;

pub use progress::{ProgressCallback, UploadProgress};
pub use progress_stream::ProgressStream;
