//! Forwarding of inbound requests to the node hosting a plugin.

use axum::body::{Body, Bytes};
use axum::extract::{OriginalUri, Request};
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use colony_common::{ClusterError, Result};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;

use super::node::{NodeRegistry, sort_addresses};

/// Largest request body forwarded to another node
const MAX_REDIRECT_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Headers that describe one hop and are never forwarded
const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::HOST,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

/// Response of the node a request was forwarded to
pub struct RedirectedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BoxStream<'static, reqwest::Result<Bytes>>,
}

impl IntoResponse for RedirectedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from_stream(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = strip_hop_by_hop(self.headers);
        response
    }
}

impl std::fmt::Debug for RedirectedResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedirectedResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

fn strip_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers
}

pub struct RequestRedirector {
    nodes: Arc<NodeRegistry>,
    http: reqwest::Client,
}

impl RequestRedirector {
    pub fn new(nodes: Arc<NodeRegistry>) -> Self {
        Self {
            nodes,
            http: reqwest::Client::new(),
        }
    }

    /// Forward `request` to `node_id` and return its response
    pub async fn redirect_request(&self, node_id: &str, request: Request) -> Result<RedirectedResponse> {
        self.redirect(node_id, request, None).await
    }

    pub async fn redirect_request_with_timeout(
        &self,
        node_id: &str,
        request: Request,
        timeout: Duration,
    ) -> Result<RedirectedResponse> {
        self.redirect(node_id, request, Some(timeout)).await
    }

    async fn redirect(
        &self,
        node_id: &str,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<RedirectedResponse> {
        let record = self
            .nodes
            .member(node_id)
            .await
            .ok_or_else(|| ClusterError::NodeNotFound(node_id.to_string()))?;

        let target = sort_addresses(&record)
            .into_iter()
            .next()
            .ok_or_else(|| ClusterError::NoAvailableAddress(node_id.to_string()))?;

        let (parts, body) = request.into_parts();
        // Nested routers strip their prefix from `uri`
        let uri = parts
            .extensions
            .get::<OriginalUri>()
            .map_or(&parts.uri, |original| &original.0);
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("http://{}{}", target.http_authority(), path_and_query);

        let body = axum::body::to_bytes(body, MAX_REDIRECT_BODY_BYTES)
            .await
            .map_err(|e| ClusterError::Redirect(format!("failed to read request body: {e}")))?;

        tracing::debug!(
            node_id = %node_id,
            method = %parts.method,
            url = %url,
            "Redirecting request"
        );

        let mut outbound = self
            .http
            .request(parts.method, &url)
            .headers(strip_hop_by_hop(parts.headers))
            .body(body);
        if let Some(timeout) = timeout {
            outbound = outbound.timeout(timeout);
        }

        let response = outbound
            .send()
            .await
            .map_err(|e| ClusterError::Redirect(e.to_string()))?;

        Ok(RedirectedResponse {
            status: response.status(),
            headers: response.headers().clone(),
            body: response.bytes_stream().boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::test_config;
    use crate::store::{CoordinationStore, MemoryStore};
    use axum::Router;
    use axum::routing::post;
    use colony_common::constants::store_keys;
    use colony_common::{Address, NodeRecord, now_millis};

    async fn echo_server() -> u16 {
        let app = Router::new().route(
            "/invoke",
            post(|headers: HeaderMap, body: String| async move {
                let tenant = headers
                    .get("x-tenant")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                (StatusCode::CREATED, format!("{tenant}:{body}"))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    async fn redirector_with(peer: Option<NodeRecord>) -> RequestRedirector {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        if let Some(record) = peer {
            store
                .hset_json(store_keys::CLUSTER_STATUS_HASH_MAP, "node-b", &record)
                .await
                .unwrap();
        }
        let nodes = Arc::new(NodeRegistry::new("node-a".to_string(), 5002, &test_config(), store));
        nodes.refresh_members().await.unwrap();
        RequestRedirector::new(nodes)
    }

    fn invoke_request() -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri("/invoke?stream=false")
            .header("x-tenant", "t-1")
            .body(Body::from("payload"))
            .unwrap()
    }

    #[tokio::test]
    async fn test_forwards_to_best_address() {
        let port = echo_server().await;

        // The unreachable address has fewer votes and must not be picked
        let mut good = Address::new("127.0.0.1", port);
        good.record_vote("node-c", now_millis(), false);
        let peer = NodeRecord {
            addresses: vec![Address::new("127.0.0.1", 1), good],
            last_ping_at: now_millis(),
        };
        let redirector = redirector_with(Some(peer)).await;

        let response = redirector
            .redirect_request_with_timeout("node-b", invoke_request(), Duration::from_secs(5))
            .await
            .unwrap()
            .into_response();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"t-1:payload");
    }

    #[tokio::test]
    async fn test_forwards_original_path_of_nested_route() {
        let port = echo_server().await;
        let peer = NodeRecord {
            addresses: vec![Address::new("127.0.0.1", port)],
            last_ping_at: now_millis(),
        };
        let redirector = redirector_with(Some(peer)).await;

        // The peer only serves `/invoke`, so a 404 means `/api/invoke` went out
        let mut request = invoke_request();
        *request.uri_mut() = "/invoke?stream=false".parse().unwrap();
        request
            .extensions_mut()
            .insert(OriginalUri("/api/invoke?stream=false".parse().unwrap()));
        let response = redirector
            .redirect_request("node-b", request)
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let mut request = invoke_request();
        request
            .extensions_mut()
            .insert(OriginalUri("/invoke?stream=false".parse().unwrap()));
        *request.uri_mut() = "/?stream=false".parse().unwrap();
        let response = redirector
            .redirect_request("node-b", request)
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_unknown_node() {
        let redirector = redirector_with(None).await;

        let err = redirector
            .redirect_request("node-b", invoke_request())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NodeNotFound(_)));
        assert_eq!(err.status_code(), 503);
    }

    #[tokio::test]
    async fn test_node_without_addresses() {
        let peer = NodeRecord {
            addresses: vec![],
            last_ping_at: now_millis(),
        };
        let redirector = redirector_with(Some(peer)).await;

        let err = redirector
            .redirect_request("node-b", invoke_request())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NoAvailableAddress(_)));
    }
}
