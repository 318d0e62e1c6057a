//! OCR result artifacts: recognized text with positional metadata.

use serde::{Deserialize, Serialize};

/// A recognized text span with its page position.
///
/// `reading_order_index` numbers boxes in reading order. Chunk-level OCR
/// numbers within the chunk; the merge renumbers globally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrBox {
    /// 1-based page number within the whole document.
    pub page: u32,
    pub text: String,
    /// Normalized [x, y, width, height] in 0..=1 page coordinates.
    pub bbox: [f32; 4],
    pub reading_order_index: u64,
    /// Recognition confidence 0..=1, when the engine reports one.
    pub confidence: Option<f32>,
}

/// Per-page OCR output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrPage {
    /// 1-based page number within the whole document.
    pub page_number: u32,
    pub text: String,
    /// Mean token confidence for the page, when available.
    pub confidence: Option<f32>,
}

/// OCR output for one document or one page-range chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OcrArtifact {
    pub pages: Vec<OcrPage>,
    pub boxes: Vec<OcrBox>,
    pub full_text: String,
    /// Mean of page confidences, when any page reports one.
    pub overall_confidence: Option<f32>,
}

impl OcrArtifact {
    /// Recompute `overall_confidence` as the mean of page confidences.
    pub fn overall_confidence(pages: &[OcrPage]) -> Option<f32> {
        let confidences: Vec<f32> = pages.iter().filter_map(|p| p.confidence).collect();
        if confidences.is_empty() {
            return None;
        }
        Some(confidences.iter().sum::<f32>() / confidences.len() as f32)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_confidence_mean() {
        let pages = vec![
            OcrPage {
                page_number: 1,
                text: "a".into(),
                confidence: Some(0.9),
            },
            OcrPage {
                page_number: 2,
                text: "b".into(),
                confidence: Some(0.7),
            },
            OcrPage {
                page_number: 3,
                text: "c".into(),
                confidence: None,
            },
        ];
        let overall = OcrArtifact::overall_confidence(&pages).unwrap();
        assert!((overall - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_overall_confidence_absent() {
        let pages = vec![OcrPage {
            page_number: 1,
            text: "a".into(),
            confidence: None,
        }];
        assert!(OcrArtifact::overall_confidence(&pages).is_none());
    }
}
