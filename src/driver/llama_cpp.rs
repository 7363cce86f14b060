use std::path::Path;

use async_trait::async_trait;
use serde_json::json;

use super::{Driver, DriverCapabilities};
use crate::error::Result;

/// A llama.cpp-compatible LLM server (`llama-server` and forks that keep its
/// `/health` and `/slots/0?action=save|restore` endpoints).
pub struct LlamaCppDriver;

#[async_trait]
impl Driver for LlamaCppDriver {
    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            executes_directly: true,
            attaches_to_running_instance: false,
            supports_kv_cache_restore: true,
            supports_model_unloading: false,
        }
    }

    fn build_command_line(
        &self,
        default_tokens: &[String],
        endpoint_tokens: &[String],
        port: u16,
        kv_cache_path: Option<&Path>,
        _temp_dir: &Path,
    ) -> Result<Vec<String>> {
        let mut argv: Vec<String> = default_tokens
            .iter()
            .chain(endpoint_tokens.iter())
            .cloned()
            .collect();
        argv.push("--port".to_string());
        argv.push(port.to_string());

        if let Some(path) = kv_cache_path {
            argv.push("--slot-save-path".to_string());
            argv.push(path.display().to_string());
        }

        Ok(argv)
    }

    async fn probe_ready(&self, client: &reqwest::Client, base_url: &str) -> bool {
        matches!(
            client.get(format!("{base_url}/health")).send().await,
            Ok(resp) if resp.status().is_success()
        )
    }

    async fn save_kv_cache(&self, client: &reqwest::Client, base_url: &str, file: &str) -> bool {
        let url = format!("{base_url}/slots/0?action=save");
        matches!(
            client.post(url).json(&json!({ "filename": file })).send().await,
            Ok(resp) if resp.status().is_success()
        )
    }

    async fn restore_kv_cache(&self, client: &reqwest::Client, base_url: &str, file: &str) -> bool {
        let url = format!("{base_url}/slots/0?action=restore");
        matches!(
            client.post(url).json(&json!({ "filename": file })).send().await,
            Ok(resp) if resp.status().is_success()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_port_and_slot_save_path() {
        let driver = LlamaCppDriver;
        let argv = driver
            .build_command_line(
                &["-m".to_string(), "model.gguf".to_string()],
                &[],
                8123,
                Some(Path::new("/tmp/infermux/kv_cache")),
                Path::new("/tmp/infermux"),
            )
            .unwrap();
        assert_eq!(
            argv,
            vec![
                "-m",
                "model.gguf",
                "--port",
                "8123",
                "--slot-save-path",
                "/tmp/infermux/kv_cache",
            ]
        );
    }

    #[test]
    fn capabilities_match_spec() {
        let caps = LlamaCppDriver.capabilities();
        assert!(caps.executes_directly);
        assert!(!caps.attaches_to_running_instance);
        assert!(caps.supports_kv_cache_restore);
        assert!(!caps.supports_model_unloading);
    }
}
