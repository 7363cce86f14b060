//! The Backend Manager: owns every configured backend and enforces the
//! "at most one active backend" invariant by quiescing all others before
//! readying one, under a single process-wide mutex.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::Backend;
use crate::error::{Error, Result};

pub struct Manager {
    /// Insertion order, so `quiesce_all` has a deterministic iteration order.
    order: Vec<String>,
    backends: HashMap<String, Arc<Backend>>,
    /// Serializes `ready`/`quiesce_all` end-to-end, including process spawn
    /// and readiness polling. See SPEC_FULL.md §5.
    lock: tokio::sync::Mutex<()>,
}

impl Manager {
    pub fn new(order: Vec<String>, backends: HashMap<String, Arc<Backend>>) -> Self {
        Self {
            order,
            backends,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Quiesce every other backend, then ready the one at `key`.
    #[tracing::instrument(skip(self))]
    pub async fn ready(&self, key: &str) -> Result<Arc<Backend>> {
        let backend = self
            .backends
            .get(key)
            .cloned()
            .ok_or_else(|| Error::BackendKeyNotFound(key.to_string()))?;

        let _guard = self.lock.lock().await;

        self.quiesce_all_locked(Some(key)).await;

        match backend.ready().await {
            Ok(()) => Ok(backend),
            Err(err) => {
                tracing::warn!(key, error = %err, "backend unavailable");
                Err(Error::BackendUnavailable(key.to_string()))
            }
        }
    }

    /// Quiesce every backend, acquiring the manager-wide lock first. Used for
    /// warmup bootstrapping and process shutdown.
    pub async fn quiesce_all(&self, except: Option<&str>) {
        let _guard = self.lock.lock().await;
        self.quiesce_all_locked(except).await;
    }

    async fn quiesce_all_locked(&self, except: Option<&str>) {
        for key in &self.order {
            if Some(key.as_str()) == except {
                continue;
            }
            if let Some(backend) = self.backends.get(key) {
                if let Err(err) = backend.quiesce(false).await {
                    tracing::warn!(key = %key, error = %err, "failed to quiesce backend, continuing");
                }
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Backend>> {
        self.backends.get(key).cloned()
    }

    pub fn keys(&self) -> &[String] {
        &self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendSpec;
    use crate::driver::{Driver, DriverCapabilities};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A driver double that never needs a real child process: it reports
    /// ready immediately and counts how many times it was asked to.
    struct FakeDriver {
        probes: AtomicUsize,
    }

    #[async_trait]
    impl Driver for FakeDriver {
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
            self.probes.fetch_add(1, Ordering::SeqCst);
            true
        }

        async fn unload_model(&self, _client: &reqwest::Client, _base_url: &str) -> bool {
            true
        }
    }

    fn fake_backend(key: &str, attach_to: &str) -> Arc<Backend> {
        Arc::new(Backend::new(BackendSpec {
            key: key.to_string(),
            driver: Arc::new(FakeDriver { probes: AtomicUsize::new(0) }),
            binary: None,
            attach_to: Some(attach_to.to_string()),
            default_parameters: vec![],
            endpoint_parameters: vec![],
            model_unloading: true,
            kv_cache_saving: false,
            host: "127.0.0.1".to_string(),
            temp_dir: std::env::temp_dir(),
        }))
    }

    #[tokio::test]
    async fn ready_quiesces_other_backends_first() {
        let a = fake_backend("s:a", "http://127.0.0.1:9001");
        let b = fake_backend("s:b", "http://127.0.0.1:9002");

        let mut backends = HashMap::new();
        backends.insert("s:a".to_string(), a.clone());
        backends.insert("s:b".to_string(), b.clone());
        let manager = Manager::new(vec!["s:a".to_string(), "s:b".to_string()], backends);

        manager.ready("s:a").await.unwrap();
        assert!(a.is_attached().await);

        manager.ready("s:b").await.unwrap();
        assert!(b.is_attached().await);
        assert!(!a.checkpoint_maybe_loaded().await);
    }

    #[tokio::test]
    async fn unknown_key_is_reported_distinctly() {
        let manager = Manager::new(vec![], HashMap::new());
        let err = manager.ready("missing:endpoint").await.unwrap_err();
        assert!(matches!(err, Error::BackendKeyNotFound(_)));
    }
}
