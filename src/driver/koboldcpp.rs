use std::path::Path;

use async_trait::async_trait;

use super::{Driver, DriverCapabilities};
use crate::error::{Error, Result};

/// KoboldCpp, launched either with a `--config <file>` (which this driver
/// rewrites with the allocated port) or with plain CLI flags.
pub struct KoboldCppDriver;

#[async_trait]
impl Driver for KoboldCppDriver {
    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            executes_directly: true,
            attaches_to_running_instance: false,
            supports_kv_cache_restore: false,
            supports_model_unloading: false,
        }
    }

    fn build_command_line(
        &self,
        default_tokens: &[String],
        endpoint_tokens: &[String],
        port: u16,
        _kv_cache_path: Option<&Path>,
        temp_dir: &Path,
    ) -> Result<Vec<String>> {
        let all_tokens: Vec<String> = default_tokens
            .iter()
            .chain(endpoint_tokens.iter())
            .cloned()
            .collect();

        let (config_path, rest) = extract_known_flags(&all_tokens);

        // `--config` overrides all other parameters, mirroring the reference
        // implementation's argparse precedence.
        if let Some(config_path) = config_path {
            if !config_path.is_file() {
                return Err(Error::SpawnFailure(
                    "koboldcpp".to_string(),
                    format!("config file '{}' does not exist", config_path.display()),
                ));
            }
            let rewritten = super::write_rewritten_kobold_config(&config_path, temp_dir, port)?;
            return Ok(vec!["--config".to_string(), rewritten.display().to_string()]);
        }

        let mut argv = rest;
        argv.push("--port".to_string());
        argv.push(port.to_string());
        Ok(argv)
    }

    async fn probe_ready(&self, client: &reqwest::Client, base_url: &str) -> bool {
        matches!(
            client
                .get(format!("{base_url}/api/v1/info/version"))
                .send()
                .await,
            Ok(resp) if resp.status().is_success()
        )
    }
}

/// Strip recognized flags (`--config`, `--port`, `--launch`, `--showgui`) out
/// of `tokens`, mirroring `argparse.parse_known_args`: recognized flags are
/// consumed, everything else passes through untouched in order.
fn extract_known_flags(tokens: &[String]) -> (Option<std::path::PathBuf>, Vec<String>) {
    let mut config_path = None;
    let mut rest = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        match tokens[i].as_str() {
            "--config" => {
                if let Some(value) = tokens.get(i + 1) {
                    config_path = Some(std::path::PathBuf::from(value));
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--port" => {
                i += if tokens.get(i + 1).is_some() { 2 } else { 1 };
            }
            "--launch" | "--showgui" => {
                i += 1;
            }
            other => {
                rest.push(other.to_string());
                i += 1;
            }
        }
    }
    (config_path, rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_port_when_no_config_flag() {
        let driver = KoboldCppDriver;
        let argv = driver
            .build_command_line(
                &["--threads".to_string(), "4".to_string()],
                &[],
                5001,
                None,
                Path::new("/tmp/infermux"),
            )
            .unwrap();
        assert_eq!(argv, vec!["--threads", "4", "--port", "5001"]);
    }

    #[test]
    fn errors_when_config_flag_points_to_missing_file() {
        let driver = KoboldCppDriver;
        let err = driver
            .build_command_line(
                &["--config".to_string(), "/nonexistent/kobold.json".to_string()],
                &[],
                5001,
                None,
                Path::new("/tmp/infermux"),
            )
            .unwrap_err();
        assert!(matches!(err, Error::SpawnFailure(..)));
    }

    #[test]
    fn rewrites_config_file_with_allocated_port() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("my.json");
        std::fs::write(&config_path, r#"{"port": 1, "launch": true, "showgui": true}"#).unwrap();

        let driver = KoboldCppDriver;
        let temp_dir = dir.path().join("temp");
        let argv = driver
            .build_command_line(
                &["--config".to_string(), config_path.display().to_string()],
                &[],
                5001,
                None,
                &temp_dir,
            )
            .unwrap();

        assert_eq!(argv[0], "--config");
        let rewritten_text = std::fs::read_to_string(&argv[1]).unwrap();
        let rewritten: serde_json::Value = serde_json::from_str(&rewritten_text).unwrap();
        assert_eq!(rewritten["port"], 5001);
        assert_eq!(rewritten["port_param"], 5001);
        assert_eq!(rewritten["launch"], false);
        assert_eq!(rewritten["showgui"], false);
    }
}
