//! Matter isolation layer.
//!
//! Every row in the system is scoped by `matter_id`. The database filters by
//! matter in SQL; this layer validates the identifier shape on the way in and
//! re-checks every returned row on the way out, so a bug in either layer
//! cannot silently leak data across matters.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum MatterError {
    /// Caller-supplied matter id is not a UUID. User error (400-class).
    #[error("invalid matter id: {0}")]
    InvalidMatter(String),
    /// A returned row belongs to a different matter. Server error
    /// (500-class); must never be swallowed.
    #[error("matter isolation violation: row {row_id} belongs to matter {actual}, requested {requested}")]
    LeakDetected {
        row_id: String,
        actual: String,
        requested: String,
    },
}

/// A validated matter identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatterId(String);

impl MatterId {
    /// Validate the shape of a raw matter id (lowercase hyphenated UUID).
    pub fn parse(raw: &str) -> Result<Self, MatterError> {
        let bytes = raw.as_bytes();
        let shape_ok = bytes.len() == 36
            && bytes.iter().enumerate().all(|(i, b)| match i {
                8 | 13 | 18 | 23 => *b == b'-',
                _ => b.is_ascii_hexdigit() && !b.is_ascii_uppercase(),
            });
        if !shape_ok {
            return Err(MatterError::InvalidMatter(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MatterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Implemented by every row model that carries a matter scope.
pub trait MatterScoped {
    fn matter_id(&self) -> &str;
    /// Row identity for diagnostics when a violation is detected.
    fn row_id(&self) -> &str;
}

impl MatterScoped for crate::models::ProcessingJob {
    fn matter_id(&self) -> &str {
        &self.matter_id
    }
    fn row_id(&self) -> &str {
        &self.id
    }
}

impl MatterScoped for crate::models::OcrChunk {
    fn matter_id(&self) -> &str {
        &self.matter_id
    }
    fn row_id(&self) -> &str {
        &self.id
    }
}

impl MatterScoped for crate::models::Document {
    fn matter_id(&self) -> &str {
        &self.matter_id
    }
    fn row_id(&self) -> &str {
        &self.id
    }
}

/// Re-check that every returned row belongs to the requested matter.
///
/// The query already filtered; a mismatch here means a SQL or RPC defect and
/// fails the whole read.
pub fn validate_rows<T: MatterScoped>(
    rows: Vec<T>,
    requested: &MatterId,
) -> Result<Vec<T>, MatterError> {
    for row in &rows {
        if row.matter_id() != requested.as_str() {
            error!(
                row_id = row.row_id(),
                actual = row.matter_id(),
                requested = requested.as_str(),
                "matter isolation violation in returned rows"
            );
            return Err(MatterError::LeakDetected {
                row_id: row.row_id().to_string(),
                actual: row.matter_id().to_string(),
                requested: requested.as_str().to_string(),
            });
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Document, DocumentStatus};
    use chrono::Utc;

    fn doc(id: &str, matter: &str) -> Document {
        let now = Utc::now();
        Document {
            id: id.into(),
            matter_id: matter.into(),
            title: "t".into(),
            blob_path: "p".into(),
            page_count: 1,
            status: DocumentStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_parse_accepts_uuid() {
        assert!(MatterId::parse("1f0e2ab4-9c7d-4e2f-8a61-3bb1c0de9f12").is_ok());
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        for raw in [
            "",
            "not-a-uuid",
            "1F0E2AB4-9C7D-4E2F-8A61-3BB1C0DE9F12", // uppercase
            "1f0e2ab49c7d4e2f8a613bb1c0de9f12",     // no hyphens
            "1f0e2ab4-9c7d-4e2f-8a61-3bb1c0de9f1",  // short
            "../1f0e2ab4-9c7d-4e2f-8a61-3bb1c0de",  // traversal-ish
        ] {
            assert!(MatterId::parse(raw).is_err(), "accepted {raw:?}");
        }
    }

    #[test]
    fn test_validate_rows_passes_matching() {
        let matter = MatterId::parse("1f0e2ab4-9c7d-4e2f-8a61-3bb1c0de9f12").unwrap();
        let rows = vec![doc("a", matter.as_str()), doc("b", matter.as_str())];
        assert_eq!(validate_rows(rows, &matter).unwrap().len(), 2);
    }

    #[test]
    fn test_validate_rows_detects_leak() {
        let matter = MatterId::parse("1f0e2ab4-9c7d-4e2f-8a61-3bb1c0de9f12").unwrap();
        let rows = vec![
            doc("a", matter.as_str()),
            doc("b", "9e8d7c6b-5a49-4382-9170-ffeeddccbbaa"),
        ];
        let err = validate_rows(rows, &matter).unwrap_err();
        match err {
            MatterError::LeakDetected { row_id, .. } => assert_eq!(row_id, "b"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
