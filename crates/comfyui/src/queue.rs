//! Parsing of the ComfyUI `/queue` document.
//!
//! ComfyUI reports each queue entry as a positional array:
//! `[number, prompt_id, prompt, extra_data, outputs_to_execute]`.

use serde::Deserialize;

use crate::backend::QueueSnapshot;

/// Index of the prompt id inside a queue entry.
const PROMPT_ID_INDEX: usize = 1;

/// Raw response of `GET /queue`.
#[derive(Debug, Default, Deserialize)]
pub struct QueueResponse {
    #[serde(default)]
    pub queue_running: Vec<serde_json::Value>,
    #[serde(default)]
    pub queue_pending: Vec<serde_json::Value>,
}

impl QueueResponse {
    /// Reduce the raw entries to the prompt ids they carry.
    ///
    /// Entries without a string at the prompt-id position are skipped
    /// with a warning rather than failing the whole poll.
    pub fn into_snapshot(self) -> QueueSnapshot {
        QueueSnapshot {
            running: prompt_ids(&self.queue_running),
            pending: prompt_ids(&self.queue_pending),
        }
    }
}

fn prompt_ids(entries: &[serde_json::Value]) -> Vec<String> {
    entries
        .iter()
        .filter_map(|entry| {
            let id = entry.get(PROMPT_ID_INDEX).and_then(serde_json::Value::as_str);
            if id.is_none() {
                tracing::warn!(entry = %entry, "Skipping malformed ComfyUI queue entry");
            }
            id.map(str::to_string)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_running_and_pending_ids() {
        let raw = r#"{
            "queue_running": [[7, "run-1", {}, {}, ["9"]]],
            "queue_pending": [[8, "pend-1", {}, {}, ["9"]], [9, "pend-2", {}, {}, []]]
        }"#;
        let snapshot = serde_json::from_str::<QueueResponse>(raw)
            .unwrap()
            .into_snapshot();

        assert_eq!(snapshot.running, vec!["run-1"]);
        assert_eq!(snapshot.pending, vec!["pend-1", "pend-2"]);
        assert!(snapshot.contains("pend-2"));
        assert!(!snapshot.contains("other"));
    }

    #[test]
    fn missing_sections_mean_empty_queue() {
        let snapshot = serde_json::from_str::<QueueResponse>("{}")
            .unwrap()
            .into_snapshot();
        assert!(snapshot.running.is_empty());
        assert!(snapshot.pending.is_empty());
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let raw = r#"{"queue_running": [[1], "junk", [2, "ok", {}]], "queue_pending": []}"#;
        let snapshot = serde_json::from_str::<QueueResponse>(raw)
            .unwrap()
            .into_snapshot();
        assert_eq!(snapshot.running, vec!["ok"]);
    }
}
