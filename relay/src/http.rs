//! Plain-HTTP forwarding.
//!
//! The same host policy as the TLS path, applied to the `Host` header,
//! with the actual forwarding done by a pooled HTTP client.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderName, Response, StatusCode};
use axum::Router;
use snirelay_shared::rules::RuleSet;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::normalize_listen;

/// Upper bound on buffered request bodies.
const MAX_REQUEST_BODY: usize = 10 * 1024 * 1024;

const POOL_MAX_IDLE_PER_HOST: usize = 100;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
struct HttpState {
    rules: Arc<RuleSet>,
    client: reqwest::Client,
}

pub struct HttpProxy {
    state: HttpState,
    listen: String,
}

impl HttpProxy {
    pub fn new(rules: Arc<RuleSet>, outip: Option<IpAddr>, listen: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .connect_timeout(UPSTREAM_TIMEOUT)
            .read_timeout(UPSTREAM_TIMEOUT)
            .local_address(outip)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build upstream http client")?;
        Ok(Self {
            state: HttpState { rules, client },
            listen,
        })
    }

    pub async fn start(self) -> anyhow::Result<JoinHandle<()>> {
        let listener = TcpListener::bind(normalize_listen(&self.listen))
            .await
            .with_context(|| format!("unable to listen on {}", self.listen))?;
        info!("start serving http at {}", self.listen);
        Ok(tokio::spawn(serve_on(listener, self.state)))
    }
}

async fn serve_on(listener: TcpListener, state: HttpState) {
    let app = Router::new().fallback(proxy_handler).with_state(state);
    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        warn!("http server exited: {e}");
    }
}

async fn proxy_handler(
    State(state): State<HttpState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response<Body> {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();
    if !state.rules.is_host_allowed(&host) {
        return plain_response(StatusCode::FORBIDDEN, "Forbidden");
    }
    info!(scheme = "http", from = %peer, to = %host, "access");

    match forward(&state.client, &host, req).await {
        Ok(response) => response,
        Err(e) => {
            warn!(to = %host, "upstream request failed: {e:#}");
            plain_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
        }
    }
}

async fn forward(
    client: &reqwest::Client,
    host: &str,
    req: Request,
) -> anyhow::Result<Response<Body>> {
    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let url = format!("http://{host}{path_and_query}");
    let headers = req.headers().clone();
    let body = axum::body::to_bytes(req.into_body(), MAX_REQUEST_BODY)
        .await
        .context("read request body")?;

    let mut outbound = client.request(method, &url);
    for (name, value) in &headers {
        if name != &header::HOST && !is_hop_by_hop(name) {
            outbound = outbound.header(name, value);
        }
    }
    let upstream = outbound.body(body).send().await?;

    let mut response = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name) {
            response = response.header(name, value);
        }
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .context("assemble response")
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_state(rules: RuleSet) -> HttpState {
        HttpState {
            rules: Arc::new(rules),
            client: reqwest::Client::builder().build().unwrap(),
        }
    }

    #[tokio::test]
    async fn rejects_disallowed_host_with_403() {
        let state = test_state(RuleSet::new(false));
        let req = Request::builder()
            .uri("/anything")
            .header(header::HOST, "other.net")
            .body(Body::empty())
            .unwrap();
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        let response = proxy_handler(State(state), ConnectInfo(peer), req).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"Forbidden");
    }

    #[tokio::test]
    async fn missing_host_header_is_policy_checked_as_empty() {
        let state = test_state(RuleSet::new(false));
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        let response = proxy_handler(State(state), ConnectInfo(peer), req).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn forwards_to_upstream_and_relays_response() {
        // Hand-rolled upstream origin.
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = origin.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = conn.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(request.starts_with("GET /hello"));
            conn.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nhi")
                .await
                .unwrap();
        });

        let host = origin_addr.to_string();
        let rules = RuleSet::new(false);
        rules
            .set_rules([(host.clone(), true)].into_iter().collect())
            .await;
        let state = test_state(rules);

        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        tokio::spawn(serve_on(proxy, state));

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let request =
            format!("GET /hello HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
        client.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("hi"));
    }
}
