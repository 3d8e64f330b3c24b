//! Parsing of the ComfyUI `/history/{prompt_id}` document.
//!
//! The document maps prompt ids to entries of the shape
//! `{"outputs": {node_id: {"images": [...], ...}}, "status": {...}}`.
//! A prompt that has not finished has no entry at all.

use std::collections::BTreeMap;

use renderq_core::artifact::ArtifactRef;
use serde::Deserialize;

use crate::api::ComfyUIApi;

/// Output collections a node may report files under.
const FILE_OUTPUT_KEYS: [&str; 4] = ["images", "gifs", "videos", "audio"];

/// Folder type used for preview files; these are not job outputs.
const PREVIEW_FOLDER_TYPE: &str = "temp";

/// Message kinds in `status.messages` that carry a failure reason.
const MSG_EXECUTION_ERROR: &str = "execution_error";
const MSG_EXECUTION_INTERRUPTED: &str = "execution_interrupted";

/// One prompt's entry in the history document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    /// Raw per-node outputs keyed by node id.
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

/// Execution status recorded alongside the outputs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryStatus {
    /// `"success"` or `"error"`.
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default)]
    pub completed: bool,
    /// `[kind, data]` pairs emitted during execution.
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
}

/// A file listed in a node output.
#[derive(Debug, Clone, Deserialize)]
struct OutputFile {
    filename: String,
    #[serde(default)]
    subfolder: String,
    #[serde(rename = "type", default = "default_folder_type")]
    folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

/// Extract the entry for `prompt_id` from a history document.
///
/// Returns `Ok(None)` when the prompt has no entry yet.
pub fn parse_history(
    document: &serde_json::Value,
    prompt_id: &str,
) -> Result<Option<HistoryEntry>, serde_json::Error> {
    match document.get(prompt_id) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(entry) => serde_json::from_value(entry.clone()).map(Some),
    }
}

impl HistoryEntry {
    /// Every non-preview file produced by any node, in node-id order.
    pub fn artifacts(&self, api: &ComfyUIApi) -> Vec<ArtifactRef> {
        let mut artifacts = Vec::new();

        for (node_id, output) in &self.outputs {
            for key in FILE_OUTPUT_KEYS {
                let Some(files) = output.get(key).and_then(serde_json::Value::as_array) else {
                    continue;
                };
                for file in files {
                    let Ok(file) = serde_json::from_value::<OutputFile>(file.clone()) else {
                        tracing::debug!(node_id = %node_id, key, "Skipping unrecognised output entry");
                        continue;
                    };
                    if file.folder_type == PREVIEW_FOLDER_TYPE {
                        continue;
                    }
                    artifacts.push(ArtifactRef {
                        node_id: node_id.clone(),
                        url: api.view_url(&file.filename, &file.subfolder, &file.folder_type),
                        filename: file.filename,
                        subfolder: file.subfolder,
                        folder_type: file.folder_type,
                    });
                }
            }
        }

        artifacts
    }

    pub fn status_str(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.status_str.as_deref())
    }

    pub fn completed(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.completed)
    }

    /// Best-effort human-readable failure reason from the status messages.
    pub fn error_reason(&self) -> Option<String> {
        let status = self.status.as_ref()?;

        for message in &status.messages {
            let kind = message.get(0).and_then(serde_json::Value::as_str);
            let data = message.get(1);
            match kind {
                Some(MSG_EXECUTION_ERROR) => {
                    let text = data
                        .and_then(|d| d.get("exception_message"))
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("execution error")
                        .trim();
                    let node_type = data
                        .and_then(|d| d.get("node_type"))
                        .and_then(serde_json::Value::as_str);
                    return Some(match node_type {
                        Some(node) => format!("{node}: {text}"),
                        None => text.to_string(),
                    });
                }
                Some(MSG_EXECUTION_INTERRUPTED) => {
                    return Some("execution interrupted".to_string());
                }
                _ => {}
            }
        }

        match status.status_str.as_deref() {
            Some("error") => Some("worker reported an execution error".to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn api() -> ComfyUIApi {
        ComfyUIApi::new("http://gpu-1:8188".into())
    }

    #[test]
    fn missing_prompt_has_no_entry() {
        assert!(parse_history(&json!({}), "abc").unwrap().is_none());
    }

    #[test]
    fn collects_output_files_across_nodes() {
        let doc = json!({
            "abc": {
                "outputs": {
                    "9": {"images": [{"filename": "a.png", "subfolder": "", "type": "output"}]},
                    "12": {"gifs": [{"filename": "b.mp4", "subfolder": "vid", "type": "output"}]}
                },
                "status": {"status_str": "success", "completed": true, "messages": []}
            }
        });
        let entry = parse_history(&doc, "abc").unwrap().unwrap();
        let artifacts = entry.artifacts(&api());

        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].node_id, "12");
        assert_eq!(artifacts[0].filename, "b.mp4");
        assert_eq!(artifacts[1].filename, "a.png");
        assert!(artifacts[1].url.starts_with("http://gpu-1:8188/view?filename=a.png"));
        assert!(entry.completed());
        assert_eq!(entry.status_str(), Some("success"));
        assert!(entry.error_reason().is_none());
    }

    #[test]
    fn preview_files_are_not_artifacts() {
        let doc = json!({
            "abc": {"outputs": {"3": {"images": [{"filename": "p.png", "subfolder": "", "type": "temp"}]}}}
        });
        let entry = parse_history(&doc, "abc").unwrap().unwrap();
        assert!(entry.artifacts(&api()).is_empty());
    }

    #[test]
    fn non_file_outputs_are_ignored() {
        let doc = json!({"abc": {"outputs": {"5": {"text": ["hello"]}}}});
        let entry = parse_history(&doc, "abc").unwrap().unwrap();
        assert!(entry.artifacts(&api()).is_empty());
    }

    #[test]
    fn execution_error_message_becomes_reason() {
        let doc = json!({
            "abc": {
                "outputs": {},
                "status": {
                    "status_str": "error",
                    "completed": false,
                    "messages": [
                        ["execution_start", {"prompt_id": "abc"}],
                        ["execution_error", {"node_type": "KSampler", "exception_message": "CUDA out of memory\n"}]
                    ]
                }
            }
        });
        let entry = parse_history(&doc, "abc").unwrap().unwrap();
        assert_eq!(
            entry.error_reason().as_deref(),
            Some("KSampler: CUDA out of memory")
        );
    }

    #[test]
    fn interruption_becomes_reason() {
        let doc = json!({
            "abc": {"status": {"status_str": "error", "messages": [["execution_interrupted", {}]]}}
        });
        let entry = parse_history(&doc, "abc").unwrap().unwrap();
        assert_eq!(entry.error_reason().as_deref(), Some("execution interrupted"));
    }

    #[test]
    fn bare_error_status_has_generic_reason() {
        let doc = json!({"abc": {"status": {"status_str": "error"}}});
        let entry = parse_history(&doc, "abc").unwrap().unwrap();
        assert_eq!(
            entry.error_reason().as_deref(),
            Some("worker reported an execution error")
        );
    }
}
