//! File-based configuration loading.
//!
//! `.yaml` / `.yml` files are read as YAML, anything else as JSON.

use std::path::Path;

use super::{ConfigError, ConfigResult, GateConfig};

pub async fn from_file(path: &Path) -> ConfigResult<GateConfig> {
    let content = tokio::fs::read_to_string(path).await?;
    parse(path, &content)
}

pub fn parse(path: &Path, content: &str) -> ConfigResult<GateConfig> {
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    );

    let parsed = if is_yaml {
        serde_yaml_bw::from_str::<GateConfig>(content).map_err(|e| e.to_string())
    } else {
        serde_json::from_str::<GateConfig>(content).map_err(|e| e.to_string())
    };

    parsed.map_err(|message| ConfigError::Parse {
        path: path.display().to_string(),
        message,
    })
}
