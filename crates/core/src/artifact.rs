//! References to files produced by a finished generation job.

use serde::{Deserialize, Serialize};

/// A single output file reported by a worker's result store.
///
/// The scheduler never downloads the file itself; it hands these
/// references to the notification sink, which decides how to deliver
/// them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Node in the execution graph that produced the file.
    pub node_id: String,
    pub filename: String,
    /// Subdirectory under the worker's output folder (may be empty).
    pub subfolder: String,
    /// Output folder kind as reported by the worker (`output`, `temp`).
    pub folder_type: String,
    /// Fully-qualified URL the file can be fetched from.
    pub url: String,
}
