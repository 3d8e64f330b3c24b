//! Turning a claimed request into the workflow document sent to a worker.

use renderq_core::types::DbId;
use renderq_db::models::request::Request;

/// Key under which a request payload may nest its workflow graph.
const WORKFLOW_KEY: &str = "workflow";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("Request {request_id} payload is not a workflow object")]
    NotAnObject { request_id: DbId },

    #[error("Request {request_id} workflow is empty")]
    Empty { request_id: DbId },
}

/// Builds the document submitted to a worker for a request.
pub trait PayloadBuilder: Send + Sync {
    fn build(&self, request: &Request) -> Result<serde_json::Value, PayloadError>;
}

/// Submits the workflow stored on the request as-is.
///
/// Uses `payload.workflow` when present, otherwise the whole payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct StoredWorkflow;

impl PayloadBuilder for StoredWorkflow {
    fn build(&self, request: &Request) -> Result<serde_json::Value, PayloadError> {
        let workflow = request
            .payload
            .get(WORKFLOW_KEY)
            .unwrap_or(&request.payload);

        match workflow.as_object() {
            None => Err(PayloadError::NotAnObject { request_id: request.id }),
            Some(map) if map.is_empty() => Err(PayloadError::Empty { request_id: request.id }),
            Some(_) => Ok(workflow.clone()),
        }
    }
}
