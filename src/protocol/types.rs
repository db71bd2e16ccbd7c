//! Payload shapes shared by requests, responses and notifications.
//!
//! These structs match the analysis-server JSON field names (camelCase)
//! and only model the fields this client reads or writes. Unknown fields
//! are ignored on input so newer servers remain compatible.

use serde::{Deserialize, Serialize};

/// Severity of an analysis error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisErrorSeverity {
    Info,
    Warning,
    Error,
    /// Forward-compatible fallback for unknown severities
    #[serde(other)]
    Unknown,
}

/// A location in a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub file: String,
    pub offset: u32,
    pub length: u32,
    pub start_line: u32,
    pub start_column: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_column: Option<u32>,
}

/// An error, warning or hint produced by analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisError {
    pub severity: AnalysisErrorSeverity,
    /// Error category such as `COMPILE_TIME_ERROR` or `LINT`.
    #[serde(rename = "type")]
    pub error_type: String,
    pub location: Location,
    pub message: String,
    #[serde(default)]
    pub correction: Option<String>,
    pub code: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub has_fix: Option<bool>,
}

impl AnalysisError {
    pub fn is_error(&self) -> bool {
        self.severity == AnalysisErrorSeverity::Error
    }
}

/// Hover information for a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoverInformation {
    pub offset: u32,
    pub length: u32,
    #[serde(default)]
    pub containing_library_path: Option<String>,
    #[serde(default)]
    pub containing_library_name: Option<String>,
    #[serde(default)]
    pub dartdoc: Option<String>,
    #[serde(default)]
    pub element_description: Option<String>,
    #[serde(default)]
    pub element_kind: Option<String>,
    #[serde(default)]
    pub static_type: Option<String>,
}

/// A navigation target referenced by one or more regions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationTarget {
    pub kind: String,
    pub file_index: usize,
    pub offset: u32,
    pub length: u32,
    pub start_line: u32,
    pub start_column: u32,
}

/// A source region with navigation targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationRegion {
    pub offset: u32,
    pub length: u32,
    /// Indexes into the accompanying target list.
    pub targets: Vec<usize>,
}

/// A single text replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEdit {
    pub offset: u32,
    pub length: u32,
    pub replacement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// The edits to apply to one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFileEdit {
    pub file: String,
    /// Modification stamp the edits were computed against; `-1` means
    /// the file did not exist.
    #[serde(default)]
    pub file_stamp: i64,
    pub edits: Vec<SourceEdit>,
}

/// An overlay entry for `analysis.updateContent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentOverlay {
    /// Replace the file content with `content`.
    Add { content: String },
    /// Apply incremental edits to the current overlay.
    Change { edits: Vec<SourceEdit> },
    /// Drop the overlay and fall back to the file system.
    Remove,
}

/// Services a client can subscribe to with `server.setSubscriptions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerService {
    Log,
    Status,
}

/// Per-file services for `analysis.setSubscriptions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisService {
    ClosingLabels,
    Folding,
    Highlights,
    Implemented,
    Invalidate,
    Navigation,
    Occurrences,
    Outline,
    Overrides,
}

/// Analysis progress reported in `server.status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisStatus {
    pub is_analyzing: bool,
    #[serde(default)]
    pub analysis_target: Option<String>,
}

/// Pub activity reported in `server.status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubStatus {
    pub is_listing_packages: bool,
}

/// Kind of message shown by `server.showMessageRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Error,
    Warning,
    Info,
    Log,
}

/// A button offered by `server.showMessageRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAction {
    pub label: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_analysis_error_deserialize() {
        let error: AnalysisError = serde_json::from_value(json!({
            "severity": "ERROR",
            "type": "COMPILE_TIME_ERROR",
            "location": {
                "file": "/project/lib/main.dart",
                "offset": 10,
                "length": 3,
                "startLine": 2,
                "startColumn": 5
            },
            "message": "Undefined name 'foo'.",
            "code": "undefined_identifier",
            "hasFix": true
        }))
        .unwrap();

        assert!(error.is_error());
        assert_eq!(error.error_type, "COMPILE_TIME_ERROR");
        assert_eq!(error.location.start_line, 2);
        assert_eq!(error.location.end_line, None);
        assert_eq!(error.has_fix, Some(true));
        assert_eq!(error.correction, None);
    }

    #[test]
    fn test_unknown_severity_falls_back() {
        let severity: AnalysisErrorSeverity = serde_json::from_value(json!("FATAL")).unwrap();
        assert_eq!(severity, AnalysisErrorSeverity::Unknown);
    }

    #[test]
    fn test_content_overlay_tagging() {
        let add = serde_json::to_value(ContentOverlay::Add {
            content: "void main() {}".into(),
        })
        .unwrap();
        assert_eq!(add, json!({"type": "add", "content": "void main() {}"}));

        let remove = serde_json::to_value(ContentOverlay::Remove).unwrap();
        assert_eq!(remove, json!({"type": "remove"}));
    }
}
