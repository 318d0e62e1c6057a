//! Per-stage partial progress, persisted inside job metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Progress within a single processing stage.
///
/// Item identifiers are opaque strings (page indices, chunk UUIDs, entity
/// candidates). A retried stage consults `processed_items` to skip work the
/// previous run already finished.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageProgress {
    pub stage_name: String,
    pub total_items: usize,
    #[serde(default)]
    pub processed_items: BTreeSet<String>,
    /// item_id -> error message for items that permanently failed.
    #[serde(default)]
    pub failed_items: BTreeMap<String, String>,
    /// Last successfully processed item.
    #[serde(default)]
    pub last_item_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

impl StageProgress {
    pub fn new(stage_name: &str) -> Self {
        Self {
            stage_name: stage_name.to_string(),
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Percentage of items processed, floored, capped at 100.
    pub fn progress_pct(&self) -> u8 {
        if self.total_items == 0 {
            return 0;
        }
        let pct = self.processed_items.len() * 100 / self.total_items;
        pct.min(100) as u8
    }

    pub fn mark_done(&mut self, item_id: &str) {
        self.processed_items.insert(item_id.to_string());
        self.last_item_id = Some(item_id.to_string());
    }

    pub fn mark_failed(&mut self, item_id: &str, error: &str) {
        self.failed_items
            .insert(item_id.to_string(), error.to_string());
    }

    pub fn is_done(&self, item_id: &str) -> bool {
        self.processed_items.contains(item_id)
    }

    /// Items from `all_items` not yet processed, in their declared order.
    pub fn remaining<'a>(&self, all_items: &'a [String]) -> Vec<&'a String> {
        all_items
            .iter()
            .filter(|item| !self.processed_items.contains(*item))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_pct_floors() {
        let mut stage = StageProgress::new("embedding");
        stage.total_items = 3;
        stage.mark_done("a");
        assert_eq!(stage.progress_pct(), 33);
        stage.mark_done("b");
        assert_eq!(stage.progress_pct(), 66);
        stage.mark_done("c");
        assert_eq!(stage.progress_pct(), 100);
    }

    #[test]
    fn test_zero_items_is_zero_pct() {
        let stage = StageProgress::new("ocr");
        assert_eq!(stage.progress_pct(), 0);
    }

    #[test]
    fn test_remaining_preserves_order() {
        let mut stage = StageProgress::new("embedding");
        let items: Vec<String> = (0..5).map(|i| format!("chunk-{i}")).collect();
        stage.total_items = items.len();
        stage.mark_done("chunk-1");
        stage.mark_done("chunk-3");

        let remaining = stage.remaining(&items);
        let names: Vec<&str> = remaining.iter().map(|s| s.as_str()).collect();
        assert_eq!(names, vec!["chunk-0", "chunk-2", "chunk-4"]);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut stage = StageProgress::new("ocr");
        stage.total_items = 2;
        stage.mark_done("0");
        stage.mark_failed("1", "unreadable page");

        let json = serde_json::to_string(&stage).unwrap();
        let back: StageProgress = serde_json::from_str(&json).unwrap();
        assert!(back.is_done("0"));
        assert_eq!(back.failed_items.get("1").unwrap(), "unreadable page");
        assert_eq!(back.last_item_id.as_deref(), Some("0"));
    }
}
