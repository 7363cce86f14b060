use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{Driver, DriverCapabilities};
use crate::error::Result;

/// An Ollama server, launched via `ollama serve`.
pub struct OllamaDriver;

#[derive(Deserialize)]
struct PsResponse {
    #[serde(default)]
    models: Vec<PsModel>,
}

#[derive(Deserialize)]
struct PsModel {
    name: String,
}

#[async_trait]
impl Driver for OllamaDriver {
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
        _port: u16,
        _kv_cache_path: Option<&Path>,
        _temp_dir: &Path,
    ) -> Result<Vec<String>> {
        let mut argv = vec!["serve".to_string()];
        argv.extend(default_tokens.iter().cloned());
        argv.extend(endpoint_tokens.iter().cloned());
        Ok(argv)
    }

    fn build_environment(&self, host: &str, port: u16) -> Option<HashMap<String, String>> {
        let mut env = HashMap::new();
        env.insert("OLLAMA_HOST".to_string(), format!("{host}:{port}"));
        Some(env)
    }

    async fn probe_ready(&self, client: &reqwest::Client, base_url: &str) -> bool {
        matches!(
            client.get(format!("{base_url}/api/version")).send().await,
            Ok(resp) if resp.status().is_success()
        )
    }

    async fn unload_model(&self, client: &reqwest::Client, base_url: &str) -> bool {
        let loaded = match client.get(format!("{base_url}/api/ps")).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<PsResponse>().await {
                Ok(parsed) => parsed.models,
                Err(_) => return false,
            },
            _ => return false,
        };

        for model in loaded {
            let ok = matches!(
                client
                    .post(format!("{base_url}/api/generate"))
                    .json(&json!({ "model": model.name, "keep_alive": 0 }))
                    .send()
                    .await,
                Ok(resp) if resp.status().is_success()
            );
            if !ok {
                return false;
            }
        }

        true
    }
}
