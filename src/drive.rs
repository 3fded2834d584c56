//! Drive item model and path-addressed Graph URLs.

use serde::{Deserialize, Serialize};

/// Subset of a Graph `driveItem` used by transfers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    /// Item id.
    #[serde(default)]
    pub id: String,
    /// File or folder name.
    #[serde(default)]
    pub name: String,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Pre-authenticated download URL, present on file items.
    #[serde(
        rename = "@microsoft.graph.downloadUrl",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub download_url: Option<String>,
    /// Present when the item is a file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileFacet>,
    /// Present when the item is a folder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<FolderFacet>,
    /// Web URL for display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
}

impl DriveItem {
    /// Whether the item is a folder.
    #[must_use]
    pub fn is_folder(&self) -> bool {
        self.folder.is_some()
    }
}

/// File facet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFacet {
    /// MIME type reported by the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Folder facet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderFacet {
    /// Number of direct children.
    #[serde(default)]
    pub child_count: u64,
}

/// Percent-encodes each segment of a normalized drive path, keeping `/`.
#[must_use]
pub fn encode_drive_path(remote_path: &str) -> String {
    remote_path
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// `{base}/me/drive/root:{path}:` addressing an item by path.
///
/// The drive root itself is `{base}/me/drive/root`.
#[must_use]
pub fn item_url(base_url: &str, remote_path: &str) -> String {
    if remote_path == "/" || remote_path.is_empty() {
        return format!("{base_url}/me/drive/root");
    }
    format!("{base_url}/me/drive/root:{}:", encode_drive_path(remote_path))
}

/// URL of the path-addressed `createUploadSession` action.
#[must_use]
pub fn create_upload_session_url(base_url: &str, remote_path: &str) -> String {
    format!("{}/createUploadSession", item_url(base_url, remote_path))
}

/// URL of the path-addressed `content` endpoint, optionally with a conversion format.
#[must_use]
pub fn content_url(base_url: &str, remote_path: &str, format: Option<&str>) -> String {
    let url = format!("{}/content", item_url(base_url, remote_path));
    match format {
        Some(format) => format!("{url}?format={}", urlencoding::encode(format)),
        None => url,
    }
}
