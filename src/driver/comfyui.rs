use std::path::Path;

use async_trait::async_trait;
use serde_json::json;

use super::{Driver, DriverCapabilities};
use crate::error::Result;

/// ComfyUI node-graph server.
pub struct ComfyUiDriver;

#[async_trait]
impl Driver for ComfyUiDriver {
    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            executes_directly: true,
            attaches_to_running_instance: true,
            supports_kv_cache_restore: false,
            supports_model_unloading: true,
        }
    }

    fn build_command_line(
        &self,
        default_tokens: &[String],
        endpoint_tokens: &[String],
        port: u16,
        _kv_cache_path: Option<&Path>,
        _temp_dir: &Path,
    ) -> Result<Vec<String>> {
        let mut argv: Vec<String> = default_tokens
            .iter()
            .chain(endpoint_tokens.iter())
            .cloned()
            .collect();
        argv.push("--port".to_string());
        argv.push(port.to_string());
        Ok(argv)
    }

    async fn probe_ready(&self, client: &reqwest::Client, base_url: &str) -> bool {
        matches!(
            client.get(format!("{base_url}/system_stats")).send().await,
            Ok(resp) if resp.status().is_success()
        )
    }

    async fn unload_model(&self, client: &reqwest::Client, base_url: &str) -> bool {
        matches!(
            client
                .post(format!("{base_url}/free"))
                .json(&json!({ "unload_models": true }))
                .send()
                .await,
            Ok(resp) if resp.status().is_success()
        )
    }
}
