use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// Diagnostic domains the service can classify. Each one is backed by its own
/// model artifact.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[strum(ascii_case_insensitive)]
pub enum TaskKind {
    #[serde(rename = "mammogram")]
    #[strum(to_string = "mammogram")]
    Mammogram,
    #[serde(rename = "xray", alias = "chest_xray")]
    #[strum(to_string = "xray", serialize = "chest_xray")]
    ChestXray,
    #[serde(rename = "eye", alias = "eye_defect")]
    #[strum(to_string = "eye", serialize = "eye_defect")]
    EyeDefect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Success,
    PerItemError,
}

/// One row of a batch response, in the same position as the submitted image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRecord {
    pub prediction: String,
    /// `"NN.NN%"` on success, `"N/A"` otherwise.
    pub confidence: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl InferenceRecord {
    pub fn is_success(&self) -> bool {
        self.status == ItemStatus::Success
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    pub task: TaskKind,
    pub results: Vec<InferenceRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task: TaskKind,
    pub labels: Vec<String>,
    pub resident: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
