//! Typed method table.
//!
//! Every protocol method is one entry in [`protocol_methods!`]: a marker
//! type, the wire name, the parameter shape and the result shape. The
//! client exposes a single generic call operation parameterized by
//! [`Method`], so adding a method is one line in the table plus its
//! payload structs.
//!
//! ```ignore
//! use analysis_client::protocol::methods::{GetErrors, FileParams};
//!
//! let result = client.call::<GetErrors>(FileParams::new("/work/lib/main.dart")).await?;
//! for error in result.errors {
//!     println!("{}: {}", error.location.start_line, error.message);
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::message::CorrelationId;
use super::types::{
    AnalysisError, AnalysisService, ContentOverlay, HoverInformation, NavigationRegion,
    NavigationTarget, ServerService, SourceEdit, SourceFileEdit,
};
use crate::error::ClientError;

/// Parameters of a protocol method.
///
/// `validate` runs before a correlation id is allocated, so a rejected
/// call never reaches the transport.
pub trait RequestParams: Serialize + Send {
    fn validate(&self) -> Result<(), ClientError> {
        Ok(())
    }
}

/// A protocol method: wire name plus parameter and result shapes.
pub trait Method {
    /// Wire name, e.g. `analysis.getErrors`.
    const NAME: &'static str;
    type Params: RequestParams;
    type Result: DeserializeOwned + Send + 'static;
}

macro_rules! protocol_methods {
    ($( $(#[$meta:meta])* $marker:ident => $name:literal ($params:ty) -> $result:ty; )*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy)]
            pub struct $marker;

            impl Method for $marker {
                const NAME: &'static str = $name;
                type Params = $params;
                type Result = $result;
            }
        )*

        /// Wire names of every method in the table.
        pub const METHOD_NAMES: &[&str] = &[$($name),*];
    };
}

protocol_methods! {
    /// `server.getVersion`
    GetVersion => "server.getVersion" (NoParams) -> VersionResult;
    /// `server.shutdown`
    Shutdown => "server.shutdown" (NoParams) -> Ack;
    /// `server.setSubscriptions`
    SetServerSubscriptions => "server.setSubscriptions" (SetServerSubscriptionsParams) -> Ack;
    /// `server.setClientCapabilities`
    SetClientCapabilities => "server.setClientCapabilities" (SetClientCapabilitiesParams) -> Ack;
    /// `server.cancelRequest`
    CancelRequest => "server.cancelRequest" (CancelRequestParams) -> Ack;
    /// `analysis.getErrors`
    GetErrors => "analysis.getErrors" (FileParams) -> GetErrorsResult;
    /// `analysis.getHover`
    GetHover => "analysis.getHover" (FileOffsetParams) -> GetHoverResult;
    /// `analysis.getNavigation`
    GetNavigation => "analysis.getNavigation" (FileRangeParams) -> GetNavigationResult;
    /// `analysis.reanalyze`
    Reanalyze => "analysis.reanalyze" (NoParams) -> Ack;
    /// `analysis.setAnalysisRoots`
    SetAnalysisRoots => "analysis.setAnalysisRoots" (SetAnalysisRootsParams) -> Ack;
    /// `analysis.setPriorityFiles`
    SetPriorityFiles => "analysis.setPriorityFiles" (SetPriorityFilesParams) -> Ack;
    /// `analysis.setSubscriptions`
    SetAnalysisSubscriptions => "analysis.setSubscriptions" (SetAnalysisSubscriptionsParams) -> Ack;
    /// `analysis.updateContent`
    UpdateContent => "analysis.updateContent" (UpdateContentParams) -> Ack;
    /// `edit.format`
    Format => "edit.format" (FormatParams) -> FormatResult;
    /// `edit.sortMembers`
    SortMembers => "edit.sortMembers" (FileParams) -> SortMembersResult;
    /// `search.findElementReferences`
    FindElementReferences => "search.findElementReferences" (FindElementReferencesParams) -> FindElementReferencesResult;
}

/// Reject paths the server would refuse: empty, relative, or containing
/// `.`/`..` components or empty segments.
pub fn validate_file_path(path: &str) -> Result<(), ClientError> {
    if path.trim().is_empty() {
        return Err(ClientError::LocalValidation(
            "file path must not be empty".to_string(),
        ));
    }

    let parsed = Path::new(path);
    if !parsed.is_absolute() {
        return Err(ClientError::LocalValidation(format!(
            "file path must be absolute: {}",
            path
        )));
    }

    // Checked on the raw text: `Path::components` folds away `.` and `//`
    let segments: Vec<&str> = path.split(std::path::is_separator).skip(1).collect();
    let last = segments.len().saturating_sub(1);
    let normalized = segments.iter().enumerate().all(|(i, segment)| match *segment {
        "." | ".." => false,
        // A single trailing separator is allowed
        "" => i == last,
        _ => true,
    });
    if !normalized {
        return Err(ClientError::LocalValidation(format!(
            "file path must be normalized: {}",
            path
        )));
    }

    Ok(())
}

fn validate_all<'a>(paths: impl IntoIterator<Item = &'a String>) -> Result<(), ClientError> {
    paths.into_iter().try_for_each(|p| validate_file_path(p))
}

/// Result type for methods that return nothing.
///
/// Accepts an absent result as well as any value the server chooses to
/// send, since void methods differ in whether they send `{}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ack;

impl<'de> Deserialize<'de> for Ack {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        IgnoredAny::deserialize(deserializer)?;
        Ok(Ack)
    }
}

/// Parameters for methods that take none; omitted on the wire.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct NoParams;

impl RequestParams for NoParams {}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VersionResult {
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetServerSubscriptionsParams {
    pub subscriptions: Vec<ServerService>,
}

impl RequestParams for SetServerSubscriptionsParams {}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetClientCapabilitiesParams {
    /// Names of the server-to-client requests this client honours.
    pub requests: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_uris: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lsp_capabilities: Option<Value>,
}

impl RequestParams for SetClientCapabilitiesParams {}

#[derive(Debug, Clone, Serialize)]
pub struct CancelRequestParams {
    pub id: CorrelationId,
}

impl RequestParams for CancelRequestParams {
    fn validate(&self) -> Result<(), ClientError> {
        if self.id.as_str().is_empty() {
            return Err(ClientError::LocalValidation(
                "request id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// A single file.
#[derive(Debug, Clone, Serialize)]
pub struct FileParams {
    pub file: String,
}

impl FileParams {
    pub fn new(file: impl Into<String>) -> Self {
        Self { file: file.into() }
    }
}

impl RequestParams for FileParams {
    fn validate(&self) -> Result<(), ClientError> {
        validate_file_path(&self.file)
    }
}

/// A file and an offset within it.
#[derive(Debug, Clone, Serialize)]
pub struct FileOffsetParams {
    pub file: String,
    pub offset: u32,
}

impl RequestParams for FileOffsetParams {
    fn validate(&self) -> Result<(), ClientError> {
        validate_file_path(&self.file)
    }
}

/// A file and a region within it.
#[derive(Debug, Clone, Serialize)]
pub struct FileRangeParams {
    pub file: String,
    pub offset: u32,
    pub length: u32,
}

impl RequestParams for FileRangeParams {
    fn validate(&self) -> Result<(), ClientError> {
        validate_file_path(&self.file)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GetErrorsResult {
    pub errors: Vec<AnalysisError>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GetHoverResult {
    pub hovers: Vec<HoverInformation>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GetNavigationResult {
    pub files: Vec<String>,
    pub targets: Vec<NavigationTarget>,
    pub regions: Vec<NavigationRegion>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetAnalysisRootsParams {
    pub included: Vec<String>,
    pub excluded: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_roots: Option<BTreeMap<String, String>>,
}

impl RequestParams for SetAnalysisRootsParams {
    fn validate(&self) -> Result<(), ClientError> {
        validate_all(&self.included)?;
        validate_all(&self.excluded)?;
        if let Some(roots) = &self.package_roots {
            validate_all(roots.keys())?;
            validate_all(roots.values())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SetPriorityFilesParams {
    pub files: Vec<String>,
}

impl RequestParams for SetPriorityFilesParams {
    fn validate(&self) -> Result<(), ClientError> {
        validate_all(&self.files)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SetAnalysisSubscriptionsParams {
    pub subscriptions: BTreeMap<AnalysisService, Vec<String>>,
}

impl RequestParams for SetAnalysisSubscriptionsParams {
    fn validate(&self) -> Result<(), ClientError> {
        validate_all(self.subscriptions.values().flatten())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateContentParams {
    pub files: BTreeMap<String, ContentOverlay>,
}

impl RequestParams for UpdateContentParams {
    fn validate(&self) -> Result<(), ClientError> {
        validate_all(self.files.keys())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatParams {
    pub file: String,
    pub selection_offset: u32,
    pub selection_length: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_length: Option<u32>,
}

impl RequestParams for FormatParams {
    fn validate(&self) -> Result<(), ClientError> {
        validate_file_path(&self.file)?;
        if self.line_length == Some(0) {
            return Err(ClientError::LocalValidation(
                "line length must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatResult {
    pub edits: Vec<SourceEdit>,
    pub selection_offset: u32,
    pub selection_length: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SortMembersResult {
    pub edit: SourceFileEdit,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FindElementReferencesParams {
    pub file: String,
    pub offset: u32,
    pub include_potential: bool,
}

impl RequestParams for FindElementReferencesParams {
    fn validate(&self) -> Result<(), ClientError> {
        validate_file_path(&self.file)
    }
}

/// `id` names the search whose results arrive as `search.results`
/// notifications; both fields are absent when no element was found.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FindElementReferencesResult {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub element: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_method_names_are_unique() {
        let mut names = METHOD_NAMES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), METHOD_NAMES.len());
        assert_eq!(GetErrors::NAME, "analysis.getErrors");
        assert_eq!(Shutdown::NAME, "server.shutdown");
    }

    #[test]
    fn test_validate_file_path() {
        assert!(validate_file_path("/project/lib/main.dart").is_ok());

        assert!(validate_file_path("/project/lib/").is_ok());

        for bad in [
            "",
            "   ",
            "lib/main.dart",
            "/project/./lib.dart",
            "/project/lib/.",
            "/project/../x.dart",
            "/project/lib/..",
            "/project//lib.dart",
        ] {
            let err = validate_file_path(bad).unwrap_err();
            assert!(
                matches!(err, ClientError::LocalValidation(_)),
                "{:?} should be rejected, got {:?}",
                bad,
                err
            );
        }
    }

    #[test]
    fn test_set_analysis_roots_validates_every_path() {
        let mut params = SetAnalysisRootsParams {
            included: vec!["/project".into()],
            excluded: vec!["/project/build".into()],
            package_roots: None,
        };
        assert!(params.validate().is_ok());

        params.package_roots = Some(BTreeMap::from([(
            "/project".to_string(),
            "relative/package_config.json".to_string(),
        )]));
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_update_content_validates_keys() {
        let params = UpdateContentParams {
            files: BTreeMap::from([("main.dart".to_string(), ContentOverlay::Remove)]),
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_ack_accepts_any_result() {
        assert_eq!(serde_json::from_value::<Ack>(Value::Null).unwrap(), Ack);
        assert_eq!(serde_json::from_value::<Ack>(json!({})).unwrap(), Ack);
    }

    #[test]
    fn test_no_params_serializes_to_null() {
        assert_eq!(serde_json::to_value(NoParams).unwrap(), Value::Null);
    }

    #[test]
    fn test_client_capabilities_shape() {
        let params = SetClientCapabilitiesParams {
            requests: vec!["openUrlRequest".into()],
            supports_uris: Some(true),
            lsp_capabilities: None,
        };
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            json!({"requests": ["openUrlRequest"], "supportsUris": true})
        );
    }

    #[test]
    fn test_analysis_subscriptions_serialize_service_keys() {
        let params = SetAnalysisSubscriptionsParams {
            subscriptions: BTreeMap::from([(
                AnalysisService::ClosingLabels,
                vec!["/project/lib/a.dart".to_string()],
            )]),
        };
        assert!(params.validate().is_ok());
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            json!({"subscriptions": {"CLOSING_LABELS": ["/project/lib/a.dart"]}})
        );
    }

    #[test]
    fn test_format_rejects_zero_line_length() {
        let params = FormatParams {
            file: "/project/lib/a.dart".into(),
            selection_offset: 0,
            selection_length: 0,
            line_length: Some(0),
        };
        assert!(params.validate().is_err());
    }
}
