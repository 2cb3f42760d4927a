//! HTTP health endpoint.
//!
//! - `GET /` connects if needed, pings the node and returns
//!   `{"latency": <seconds>}`; failures return 500 with `{"error": "..."}`.
//! - `GET /nodes` lists the candidates and their last probe results.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;

use crate::error::Result;
use crate::node_client::NodeClient;
use crate::selector::Candidate;

#[derive(Debug, Serialize)]
struct LatencyResponse {
    latency: f64,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// One row of `GET /nodes`.
#[derive(Debug, Serialize)]
pub struct NodeStatus {
    /// Host name or address.
    pub host: String,
    /// Node port.
    pub port: u16,
    /// Whether the last probe succeeded.
    pub reachable: bool,
    /// Last measured latency in seconds.
    pub latency: f64,
}

impl From<&Candidate> for NodeStatus {
    fn from(candidate: &Candidate) -> Self {
        Self {
            host: candidate.host.clone(),
            port: candidate.port,
            reachable: candidate.reachable,
            latency: candidate.latency_secs(),
        }
    }
}

/// Builds the health router.
pub fn router(client: Arc<NodeClient>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/nodes", get(nodes))
        .with_state(client)
}

/// Serves the router on `addr` until `shutdown` resolves.
pub async fn serve<F>(client: Arc<NodeClient>, addr: SocketAddr, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Health endpoint listening");
    axum::serve(listener, router(client))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn check(client: &NodeClient) -> Result<Duration> {
    client.ensure_connected().await?;
    client.ping().await
}

async fn health(State(client): State<Arc<NodeClient>>) -> Response {
    match check(&client).await {
        Ok(latency) => Json(LatencyResponse {
            latency: latency.as_secs_f64(),
        })
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Health check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn nodes(State(client): State<Arc<NodeClient>>) -> Json<Vec<NodeStatus>> {
    let candidates = client.candidates().await;
    Json(candidates.iter().map(NodeStatus::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeAddress;
    use crate::node_client::ClientOptions;
    use crate::selector::{NodeSelector, TcpProber};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn get(addr: SocketAddr, path: &str) -> (u16, serde_json::Value) {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();
        let status = raw[9..12].parse().unwrap();
        let body = raw.split("\r\n\r\n").nth(1).unwrap_or_default();
        (status, serde_json::from_str(body).unwrap())
    }

    async fn spawn_server(client: Arc<NodeClient>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router(client)).await });
        addr
    }

    fn client_for_closed_port() -> Arc<NodeClient> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let selector = NodeSelector::new(
            [NodeAddress::new("127.0.0.1", port)],
            TcpProber::new(Duration::from_millis(500)),
        );
        Arc::new(NodeClient::new(selector, ClientOptions::default()))
    }

    #[tokio::test]
    async fn test_health_reports_error_when_no_node() {
        let addr = spawn_server(client_for_closed_port()).await;

        let (status, body) = get(addr, "/").await;
        assert_eq!(status, 500);
        assert!(body["error"].as_str().unwrap().contains("no reachable node"));
    }

    #[tokio::test]
    async fn test_nodes_lists_candidates() {
        let addr = spawn_server(client_for_closed_port()).await;

        let (status, body) = get(addr, "/nodes").await;
        assert_eq!(status, 200);
        let nodes = body.as_array().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0]["host"], "127.0.0.1");
        assert_eq!(nodes[0]["reachable"], false);
    }
}
