use serde::{Deserialize, Serialize};

/// Availability report for an external tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDiag {
    pub name: String,
    pub program: String,
    pub ok: bool,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}
