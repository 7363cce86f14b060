//! HTTP Routing Front-end: one Axum router per configured server. Never
//! proxies bytes — matches a path prefix, readies the backend, and replies
//! with a 307 redirect to the backend's own `host:port`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;

use crate::config::EndpointConfig;
use crate::error::Error;
use crate::manager::Manager;

struct ServerContext {
    server_name: String,
    /// Pre-sorted longest-non-empty-prefix-first, catch-all last.
    endpoints: Vec<EndpointConfig>,
    manager: Arc<Manager>,
}

pub fn router(server_name: String, endpoints: Vec<EndpointConfig>, manager: Arc<Manager>) -> Router {
    let ctx = Arc::new(ServerContext {
        server_name,
        endpoints,
        manager,
    });

    Router::new()
        .route("/", any(handle_request))
        .route("/*path", any(handle_request))
        .with_state(ctx)
}

fn match_endpoint<'a>(endpoints: &'a [EndpointConfig], path: &str) -> Option<&'a EndpointConfig> {
    endpoints
        .iter()
        .find(|e| e.path_prefix.is_empty() || path.starts_with(e.path_prefix.as_str()))
}

#[tracing::instrument(skip(ctx), fields(server = %ctx.server_name))]
async fn handle_request(State(ctx): State<Arc<ServerContext>>, method: Method, uri: Uri) -> Response {
    let path = uri.path();

    let Some(endpoint) = match_endpoint(&ctx.endpoints, path) else {
        tracing::info!(server = %ctx.server_name, path, %method, "endpoint not matched");
        return Error::EndpointNotMatched(path.to_string()).into_response();
    };

    let key = format!("{}:{}", ctx.server_name, endpoint.name);

    let backend = match ctx.manager.ready(&key).await {
        Ok(backend) => backend,
        Err(err @ Error::BackendUnavailable(_)) => return err.into_response(),
        Err(err @ Error::BackendKeyNotFound(_)) => return err.into_response(),
        Err(err) => return err.into_response(),
    };

    let base_url = match backend.url().await {
        Ok(url) => url,
        Err(err) => return err.into_response(),
    };

    let forwarded_path = if endpoint.strip_prefix && !endpoint.path_prefix.is_empty() {
        path.strip_prefix(endpoint.path_prefix.as_str()).unwrap_or(path)
    } else {
        path
    };

    let mut location = format!("{base_url}{forwarded_path}");
    if let Some(query) = uri.query() {
        location.push('?');
        location.push_str(query);
    }

    tracing::debug!(server = %ctx.server_name, endpoint = %endpoint.name, %location, "redirecting");

    (
        StatusCode::TEMPORARY_REDIRECT,
        [(header::LOCATION, location)],
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, BackendSpec};
    use crate::driver::{Driver, DriverCapabilities};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Arc;
    use tower::ServiceExt;

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

    fn test_endpoint(name: &str, prefix: &str, strip: bool) -> EndpointConfig {
        EndpointConfig {
            name: name.to_string(),
            backend: "fake".to_string(),
            path_prefix: prefix.to_string(),
            strip_prefix: strip,
            parameters: vec![],
            kv_cache_saving: false,
        }
    }

    fn test_manager() -> Arc<Manager> {
        let a = Arc::new(Backend::new(BackendSpec {
            key: "s:a".to_string(),
            driver: Arc::new(AlwaysReadyDriver),
            binary: None,
            attach_to: Some("http://10.0.0.1:9001".to_string()),
            default_parameters: vec![],
            endpoint_parameters: vec![],
            model_unloading: true,
            kv_cache_saving: false,
            host: "127.0.0.1".to_string(),
            temp_dir: std::env::temp_dir(),
        }));
        let b = Arc::new(Backend::new(BackendSpec {
            key: "s:b".to_string(),
            driver: Arc::new(AlwaysReadyDriver),
            binary: None,
            attach_to: Some("http://10.0.0.1:9002".to_string()),
            default_parameters: vec![],
            endpoint_parameters: vec![],
            model_unloading: true,
            kv_cache_saving: false,
            host: "127.0.0.1".to_string(),
            temp_dir: std::env::temp_dir(),
        }));
        let mut backends = HashMap::new();
        backends.insert("s:a".to_string(), a);
        backends.insert("s:b".to_string(), b);
        Arc::new(Manager::new(vec!["s:a".to_string(), "s:b".to_string()], backends))
    }

    #[tokio::test]
    async fn routes_longest_prefix_first_and_strips() {
        let endpoints = vec![test_endpoint("a", "/a", true), test_endpoint("b", "", false)];
        let app = router("s".to_string(), endpoints, test_manager());

        let resp = app
            .oneshot(axum::http::Request::get("/a/x").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
        let location = resp.headers().get(header::LOCATION).unwrap().to_str().unwrap();
        assert_eq!(location, "http://10.0.0.1:9001/x");
    }

    #[tokio::test]
    async fn catch_all_matches_unprefixed_endpoint() {
        let endpoints = vec![test_endpoint("a", "/a", true), test_endpoint("b", "", false)];
        let app = router("s".to_string(), endpoints, test_manager());

        let resp = app
            .oneshot(axum::http::Request::get("/z").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
        let location = resp.headers().get(header::LOCATION).unwrap().to_str().unwrap();
        assert_eq!(location, "http://10.0.0.1:9002/z");
    }

    #[tokio::test]
    async fn unmatched_path_returns_404() {
        let endpoints = vec![test_endpoint("a", "/a", true)];
        let app = router("s".to_string(), endpoints, test_manager());

        let resp = app
            .oneshot(
                axum::http::Request::get("/unmapped")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
