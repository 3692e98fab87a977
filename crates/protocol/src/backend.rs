//! Request and response bodies of the backend REST API

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartDeviceRequest {
    pub platform: String,
    pub is_simulation: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub test_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_link: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_package: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartDeviceResponse {
    #[serde(default)]
    pub workflow_run_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelDeviceResponse {
    #[serde(default)]
    pub message: Option<String>,
}

/// Worker lifecycle status as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerConnectionStatus {
    Pending,
    Starting,
    Running,
    Stopped,
    Cancelled,
    Failed,
    #[serde(other)]
    Unknown,
}

impl WorkerConnectionStatus {
    /// The device was torn down by someone other than this client.
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            WorkerConnectionStatus::Stopped | WorkerConnectionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConnectionResponse {
    pub status: WorkerConnectionStatus,
    #[serde(default)]
    pub workflow_run_id: String,
    #[serde(default)]
    pub worker_ws_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildVersionDetail {
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub package_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildVersion {
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub uploaded_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_id: Option<String>,
    #[serde(default)]
    pub is_current: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildVersionList {
    #[serde(default)]
    pub versions: Vec<BuildVersion>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateApiKeyResponse {
    pub user_id: String,
    pub org_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub concurrency_limit: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveDeviceSession {
    pub id: String,
    #[serde(default)]
    pub org_id: String,
    /// Kept as free text; the backend may report platforms this client does not drive.
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub workflow_run_id: Option<String>,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveDeviceSessionsResponse {
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub sessions: Vec<ActiveDeviceSession>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundElementRequest {
    pub target: String,
    pub image_base64: String,
    pub width: u32,
    pub height: u32,
    pub platform: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundElementResponse {
    #[serde(default)]
    pub found: bool,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    #[serde(default)]
    pub error: Option<String>,
}
