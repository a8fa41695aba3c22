//! Relay session state machine
//!
//! One session per accepted WebSocket. The session owns both sockets for
//! its entire lifetime: the client WebSocket handed over by the HTTP
//! layer and the outbound TCP connection it opens once the request
//! header authenticates. A session moves through
//!
//! 1. awaiting header - the first binary frame must carry the complete
//!    request header
//! 2. connecting - dial the destination, flush early data and the
//!    header's trailing payload, answer with the 2-byte response header
//! 3. relaying - both directions forward concurrently until either side
//!    closes or fails
//!
//! Teardown from any state closes both sockets exactly once; the shared
//! `cancelled` latch makes late events no-ops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinError;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use uuid::Uuid;

use veil_protocol::{Command, HeaderError, RequestHeader};

use crate::metrics::METRICS;
use crate::outbound::{self, DialError};
use crate::throttle;

/// Read buffer size for the remote-to-client direction.
const READ_BUF_SIZE: usize = 16 * 1024;

/// Session failures surfaced to the connection handler
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid request header: {0}")]
    Header(#[from] HeaderError),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("client closed before sending a request header")]
    ClientClosed,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("relay I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// State shared by the two forwarding directions.
struct Shared {
    /// Idempotent teardown latch; once set, every later event is a no-op.
    cancelled: AtomicBool,

    /// Chunks forwarded remote-to-client so far, feeding the throttle.
    chunk_count: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            chunk_count: AtomicU64::new(0),
        }
    }

    /// Latch the session closed; true only for the first caller.
    fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Count a chunk and return its number, starting at 1.
    fn next_chunk(&self) -> u64 {
        self.chunk_count.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// One relay session: a client WebSocket plus its outbound TCP leg.
pub struct Session<S> {
    ws: WebSocketStream<S>,
    user_id: Uuid,
    early_data: Option<Vec<u8>>,
    peer: SocketAddr,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        ws: WebSocketStream<S>,
        user_id: Uuid,
        early_data: Option<Vec<u8>>,
        peer: SocketAddr,
    ) -> Self {
        Self {
            ws,
            user_id,
            early_data,
            peer,
        }
    }

    /// Drive the session to completion.
    ///
    /// Protocol and connect failures close the WebSocket and are
    /// returned for the caller to log; anything that happens after the
    /// relay is established is logged here with destination context and
    /// absorbed. Both sockets are closed on every path out.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let first = match self.await_header_frame().await {
            Ok(frame) => frame,
            Err(err) => {
                let _ = self.ws.close(None).await;
                return Err(err);
            }
        };

        let header = match RequestHeader::decode(&first, &self.user_id) {
            Ok(header) => header,
            Err(err) => {
                if err == HeaderError::IdentifierMismatch {
                    METRICS.auth_failures.inc();
                } else {
                    METRICS.header_errors.inc();
                }
                let _ = self.ws.close(None).await;
                return Err(err.into());
            }
        };

        if header.command == Command::Udp {
            // Recognized but never served; not an error worth surfacing.
            debug!("client {} requested UDP relay, closing", self.peer);
            let _ = self.ws.close(None).await;
            return Ok(());
        }

        let remote = match outbound::dial(&header.address, header.port).await {
            Ok(stream) => stream,
            Err(err) => {
                METRICS.dial_failures.inc();
                let _ = self.ws.close(None).await;
                return Err(err.into());
            }
        };

        debug!(
            "client {} connected to {}:{}",
            self.peer, header.address, header.port
        );

        let (remote_rd, mut remote_wr) = remote.into_split();

        // Everything the client sent ahead of the response goes out
        // before the relay starts: early data first, then whatever
        // trailed the header in its frame.
        if let Some(data) = self.early_data.take() {
            remote_wr.write_all(&data).await?;
        }
        let payload = header.payload(&first);
        if !payload.is_empty() {
            remote_wr.write_all(payload).await?;
        }

        self.ws
            .send(Message::Binary(Bytes::copy_from_slice(&header.response())))
            .await?;

        let target = format!("{}:{}", header.address, header.port);
        let shared = Arc::new(Shared::new());
        let (ws_tx, ws_rx) = self.ws.split();

        let mut client_to_remote = tokio::spawn(pump_client_to_remote(
            ws_rx,
            remote_wr,
            shared.clone(),
        ));
        let mut remote_to_client = tokio::spawn(pump_remote_to_client(
            remote_rd,
            ws_tx,
            shared.clone(),
        ));

        // Whichever direction stops first tears the other down.
        let (client_res, remote_res) = tokio::select! {
            res = &mut client_to_remote => {
                shared.cancel();
                remote_to_client.abort();
                (res, remote_to_client.await)
            }
            res = &mut remote_to_client => {
                shared.cancel();
                client_to_remote.abort();
                (client_to_remote.await, res)
            }
        };

        log_direction(self.peer, &target, "client->remote", client_res);
        log_direction(self.peer, &target, "remote->client", remote_res);
        debug!("session {} -> {} closed", self.peer, target);

        Ok(())
    }

    /// Wait for the frame that must carry the request header.
    async fn await_header_frame(&mut self) -> Result<Bytes, SessionError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(data),
                Some(Ok(Message::Close(_))) | None => return Err(SessionError::ClientClosed),
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(err.into()),
            }
        }
    }
}

/// Forward client frames to the TCP leg verbatim.
async fn pump_client_to_remote<S>(
    mut ws_rx: SplitStream<WebSocketStream<S>>,
    mut remote_wr: OwnedWriteHalf,
    shared: Arc<Shared>,
) -> Result<u64, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut total = 0u64;
    while let Some(message) = ws_rx.next().await {
        if shared.is_cancelled() {
            break;
        }
        match message? {
            Message::Binary(data) => {
                remote_wr.write_all(&data).await?;
                METRICS.bytes_client_to_remote.inc_by(data.len() as u64);
                total += data.len() as u64;
            }
            Message::Text(text) => {
                remote_wr.write_all(text.as_bytes()).await?;
                METRICS.bytes_client_to_remote.inc_by(text.len() as u64);
                total += text.len() as u64;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Client is done sending; signal EOF to the destination.
    let _ = remote_wr.shutdown().await;
    Ok(total)
}

/// Forward TCP reads to the client, one frame per chunk, throttled.
async fn pump_remote_to_client<S>(
    mut remote_rd: OwnedReadHalf,
    mut ws_tx: SplitSink<WebSocketStream<S>, Message>,
    shared: Arc<Shared>,
) -> Result<u64, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = remote_rd.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if shared.is_cancelled() {
            break;
        }

        let chunk = shared.next_chunk();
        let delay = throttle::delay_for(chunk);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        // The client may have gone away while we slept.
        if shared.is_cancelled() {
            break;
        }

        ws_tx
            .send(Message::Binary(Bytes::copy_from_slice(&buf[..n])))
            .await?;
        METRICS.bytes_remote_to_client.inc_by(n as u64);
        METRICS.chunk_size.observe(n as f64);
        total += n as u64;
    }

    // Destination finished; close the client side.
    let _ = ws_tx.close().await;
    Ok(total)
}

/// Log one direction's outcome with destination context.
fn log_direction(
    peer: SocketAddr,
    target: &str,
    direction: &str,
    result: Result<Result<u64, SessionError>, JoinError>,
) {
    match result {
        Ok(Ok(bytes)) => debug!("{} -> {} {}: {} bytes", peer, target, direction, bytes),
        Ok(Err(err)) => warn!("{} -> {} {} ended: {}", peer, target, direction, err),
        Err(err) if err.is_cancelled() => {}
        Err(err) => warn!("{} -> {} {} task panicked: {}", peer, target, direction, err),
    }
}
