//! Sequential warmup: ready each configured `(server, endpoint)` pair once at
//! startup, in the order listed, so the first real client request isn't the
//! one paying for a cold backend spawn.

use std::sync::Arc;

use crate::config::WarmupEntry;
use crate::error::Error;
use crate::manager::Manager;

/// Ready every warmup entry in order. A backend-key lookup failure (a typo'd
/// server/endpoint pair) is a configuration bug and aborts the rest of the
/// sequence; a transient unavailability is logged and warmup moves on.
pub async fn run(entries: &[WarmupEntry], manager: &Arc<Manager>) -> Result<(), Error> {
    for entry in entries {
        let key = format!("{}:{}", entry.server, entry.endpoint);
        tracing::info!(server = %entry.server, endpoint = %entry.endpoint, "warming up");

        match manager.ready(&key).await {
            Ok(_) => {}
            Err(err @ Error::BackendKeyNotFound(_)) => return Err(err),
            Err(err) => {
                tracing::warn!(server = %entry.server, endpoint = %entry.endpoint, error = %err, "warmup skipped, backend unavailable");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, BackendSpec};
    use crate::driver::{Driver, DriverCapabilities};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;

    struct AlwaysReadyDriver;

    #[async_trait]
    impl Driver for AlwaysReadyDriver {
        fn capabilities(&self) -> DriverCapabilities {
            DriverCapabilities {
                executes_directly: false,
                attaches_to_running_instance: true,
                supports_kv_cache_restore: false,
                supports_model_unloading: true,
            }
        }

        fn build_command_line(
            &self,
            _default_tokens: &[String],
            _endpoint_tokens: &[String],
            _port: u16,
            _kv_cache_path: Option<&Path>,
            _temp_dir: &Path,
        ) -> crate::error::Result<Vec<String>> {
            Ok(vec![])
        }

        async fn probe_ready(&self, _client: &reqwest::Client, _base_url: &str) -> bool {
            true
        }
    }

    fn fake_backend(key: &str) -> Arc<Backend> {
        Arc::new(Backend::new(BackendSpec {
            key: key.to_string(),
            driver: Arc::new(AlwaysReadyDriver),
            binary: None,
            attach_to: Some("http://127.0.0.1:9001".to_string()),
            default_parameters: vec![],
            endpoint_parameters: vec![],
            model_unloading: true,
            kv_cache_saving: false,
            host: "127.0.0.1".to_string(),
            temp_dir: std::env::temp_dir(),
        }))
    }

    #[tokio::test]
    async fn warms_up_every_entry_in_order() {
        let a = fake_backend("s:a");
        let mut backends = HashMap::new();
        backends.insert("s:a".to_string(), a.clone());
        let manager = Arc::new(Manager::new(vec!["s:a".to_string()], backends));

        let entries = vec![WarmupEntry {
            server: "s".to_string(),
            endpoint: "a".to_string(),
        }];

        run(&entries, &manager).await.unwrap();
        assert!(a.is_attached().await);
    }

    #[tokio::test]
    async fn aborts_on_unknown_backend_key() {
        let manager = Arc::new(Manager::new(vec![], HashMap::new()));
        let entries = vec![WarmupEntry {
            server: "missing".to_string(),
            endpoint: "thing".to_string(),
        }];

        let err = run(&entries, &manager).await.unwrap_err();
        assert!(matches!(err, Error::BackendKeyNotFound(_)));
    }
}
