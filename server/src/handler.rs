//! HTTP and WebSocket handler
//!
//! One listener serves everything: requests for the tunnel path that
//! carry a WebSocket upgrade become relay sessions; every other request
//! gets the disguise page, except the health probes.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    Request, Response, StatusCode, body::Incoming, server::conn::http1, service::service_fn,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::metrics::METRICS;
use crate::session::Session;
use veil_protocol::decode_early_data;

/// Server state shared by every connection, immutable after startup.
struct ServerContext {
    config: ServerConfig,
    user_id: Uuid,
}

/// The relay's HTTP listener.
pub struct RelayServer {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
}

impl RelayServer {
    /// Bind the listener and resolve the authorized user ID.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.server.bind).await?;
        let user_id = config.user_id();

        info!("relay listening on {}", config.server.bind);

        Ok(Self {
            listener,
            ctx: Arc::new(ServerContext { config, user_id }),
        })
    }

    /// Get the bound address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the process exits.
    ///
    /// A failing connection never takes the listener down with it.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!("accept error: {}", err);
                    continue;
                }
            };
            debug!("new connection from {}", addr);

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                let service = service_fn(move |req| {
                    let ctx = ctx.clone();
                    async move { handle_request(req, addr, ctx).await }
                });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    debug!("connection from {} ended: {}", addr, err);
                }
            });
        }
    }
}

/// Route an HTTP request.
async fn handle_request(
    req: Request<Incoming>,
    addr: SocketAddr,
    ctx: Arc<ServerContext>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_owned();

    let response = if path == ctx.config.server.tunnel_path && is_upgrade_request(&req) {
        handle_tunnel(req, addr, ctx)
    } else {
        match path.as_str() {
            "/health" => handle_health(),
            "/ready" => handle_ready(),
            _ => handle_decoy(),
        }
    };

    Ok(response)
}

/// True when the request asks for a WebSocket upgrade.
fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Complete the WebSocket handshake and hand the socket to a session.
fn handle_tunnel(
    mut req: Request<Incoming>,
    addr: SocketAddr,
    ctx: Arc<ServerContext>,
) -> Response<Full<Bytes>> {
    let key = match req.headers().get("sec-websocket-key") {
        Some(key) => key.clone(),
        None => {
            return Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Full::new(Bytes::from("Missing Sec-WebSocket-Key")))
                .unwrap();
        }
    };
    let accept_key = derive_accept_key(key.as_bytes());

    // The subprotocol header doubles as the early-data carrier; a value
    // that fails to decode kills the session before it starts.
    let protocol = req.headers().get("sec-websocket-protocol").cloned();
    let early_data = match protocol.as_ref() {
        Some(value) => {
            let value = match value.to_str() {
                Ok(value) => value,
                Err(_) => {
                    warn!("rejecting upgrade from {}: early data is not ASCII", addr);
                    return bad_request();
                }
            };
            match decode_early_data(value) {
                Ok(data) => data,
                Err(err) => {
                    warn!("rejecting upgrade from {}: {}", addr, err);
                    return bad_request();
                }
            }
        }
        None => None,
    };

    let user_id = ctx.user_id;
    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let ws =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                        .await;

                METRICS.sessions_total.inc();
                METRICS.active_sessions.inc();

                let session = Session::new(ws, user_id, early_data, addr);
                if let Err(err) = session.run().await {
                    warn!("session from {} failed: {}", addr, err);
                }

                METRICS.active_sessions.dec();
            }
            Err(err) => error!("upgrade error from {}: {}", addr, err),
        }
    });

    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(hyper::header::UPGRADE, "websocket")
        .header(hyper::header::CONNECTION, "Upgrade")
        .header("Sec-WebSocket-Accept", accept_key);
    if let Some(protocol) = protocol {
        response = response.header("Sec-WebSocket-Protocol", protocol);
    }
    response.body(Full::new(Bytes::new())).unwrap()
}

fn bad_request() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(Full::new(Bytes::from("Bad Request")))
        .unwrap()
}

/// Handle health check
fn handle_health() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(r#"{"status":"healthy"}"#)))
        .unwrap()
}

/// Handle readiness check
fn handle_ready() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(r#"{"status":"ready"}"#)))
        .unwrap()
}

/// Serve the disguise page shown to everything that is not a tunnel
/// client.
fn handle_decoy() -> Response<Full<Bytes>> {
    let html = r#"<!DOCTYPE html>
<html>
<head><title>Welcome</title></head>
<body>
<h1>It works!</h1>
<p>This server is up and running.</p>
</body>
</html>"#;

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/html")
        .body(Full::new(Bytes::from(html)))
        .unwrap()
}
