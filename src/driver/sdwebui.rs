use std::path::Path;

use async_trait::async_trait;

use super::{Driver, DriverCapabilities};
use crate::error::Result;

/// AUTOMATIC1111/Stable-Diffusion-WebUI launched in API mode.
pub struct SdWebUiDriver;

#[async_trait]
impl Driver for SdWebUiDriver {
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
        argv.push("--nowebui".to_string());
        Ok(argv)
    }

    async fn probe_ready(&self, client: &reqwest::Client, base_url: &str) -> bool {
        matches!(
            client.get(format!("{base_url}/sdapi/v1/memory")).send().await,
            Ok(resp) if resp.status().is_success()
        )
    }

    async fn unload_model(&self, client: &reqwest::Client, base_url: &str) -> bool {
        matches!(
            client
                .post(format!("{base_url}/sdapi/v1/unload-checkpoint"))
                .send()
                .await,
            Ok(resp) if resp.status().is_success()
        )
    }
}
