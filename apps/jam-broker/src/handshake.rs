//! Container callback handshake.
//!
//! A freshly booted container cannot be dialed straight away: its control
//! port may not be listening yet. Instead the container connects to the
//! handshake port once it is ready and writes its session id. The broker
//! closes that callback socket, consumes the matching pending entry, dials
//! the container's control port, sends the membership bootstrap command and
//! registers the resulting connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::{self, Command, FrameError, BROKER_CORRELATION_ID};
use crate::pending::PendingHandshakes;
use crate::registry::RegisterError;
use crate::router::MessageRouter;

pub const DEFAULT_HANDSHAKE_PORT: u16 = 25051;
const MAX_CALLBACK_LEN: usize = 256;

#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// How long a callback connection may take to send its session id.
    pub read_timeout: Duration,
    pub dial_timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("timed out waiting for a session id")]
    ReadTimeout,
    #[error("callback closed without sending a session id")]
    Empty,
    #[error("failed to read callback: {0}")]
    Read(#[source] io::Error),
    #[error("timed out dialing control port at {0}")]
    DialTimeout(SocketAddr),
    #[error("failed to dial control port at {address}: {source}")]
    Dial {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode bootstrap command: {0}")]
    Encode(#[from] FrameError),
    #[error("failed to send bootstrap command: {0}")]
    Bootstrap(#[source] io::Error),
}

impl HandshakeError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            HandshakeError::ReadTimeout => "read_timeout",
            HandshakeError::Empty => "empty",
            HandshakeError::Read(_) => "read",
            HandshakeError::DialTimeout(_) => "dial_timeout",
            HandshakeError::Dial { .. } => "dial",
            HandshakeError::Encode(_) => "encode",
            HandshakeError::Bootstrap(_) => "bootstrap",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// The session is live.
    Bridged { session_id: String },
    /// No pending entry matched; late, duplicate or spoofed callback.
    Orphaned { session_id: String },
    /// A purge ran while the control connection was being set up.
    Superseded { session_id: String },
}

impl HandshakeOutcome {
    fn metric_label(&self) -> &'static str {
        match self {
            HandshakeOutcome::Bridged { .. } => "bridged",
            HandshakeOutcome::Orphaned { .. } => "orphaned",
            HandshakeOutcome::Superseded { .. } => "superseded",
        }
    }
}

#[derive(Clone)]
pub struct HandshakeService {
    pending: Arc<PendingHandshakes>,
    router: MessageRouter,
    control_port: u16,
    config: HandshakeConfig,
}

impl HandshakeService {
    pub fn new(
        pending: Arc<PendingHandshakes>,
        router: MessageRouter,
        control_port: u16,
        config: HandshakeConfig,
    ) -> Self {
        Self {
            pending,
            router,
            control_port,
            config,
        }
    }

    /// Reads the session id from one callback connection, closes it and
    /// completes the bridge.
    pub async fn accept_callback(
        &self,
        mut callback: TcpStream,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        let mut buf = vec![0u8; MAX_CALLBACK_LEN];
        let read = timeout(self.config.read_timeout, callback.read(&mut buf))
            .await
            .map_err(|_| HandshakeError::ReadTimeout)?
            .map_err(HandshakeError::Read)?;
        let _ = callback.shutdown().await;
        drop(callback);

        let session_id = String::from_utf8_lossy(&buf[..read]).trim().to_string();
        if session_id.is_empty() {
            return Err(HandshakeError::Empty);
        }
        self.complete(&session_id).await
    }

    /// Consumes the pending entry for `session_id` and brings the session live.
    pub async fn complete(&self, session_id: &str) -> Result<HandshakeOutcome, HandshakeError> {
        let epoch = self.router.registry().epoch();
        let Some(pending) = self.pending.take(session_id) else {
            debug!(session_id, "discarding callback with no pending handshake");
            return Ok(HandshakeOutcome::Orphaned {
                session_id: session_id.to_string(),
            });
        };

        let address = SocketAddr::new(pending.address, self.control_port);
        let mut stream = timeout(self.config.dial_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| HandshakeError::DialTimeout(address))?
            .map_err(|source| HandshakeError::Dial { address, source })?;

        let bootstrap = codec::encode(
            BROKER_CORRELATION_ID,
            &Command::AddAccount(pending.account_id.clone()).into_payload(),
        )?;
        stream
            .write_all(&bootstrap)
            .await
            .map_err(HandshakeError::Bootstrap)?;

        match self
            .router
            .attach(session_id, stream, pending.response_handler, epoch)
        {
            Ok(connection) => {
                info!(
                    session_id,
                    account_id = %pending.account_id,
                    peer = %connection.peer(),
                    "session live"
                );
                Ok(HandshakeOutcome::Bridged {
                    session_id: session_id.to_string(),
                })
            }
            Err(RegisterError::Purged(_)) => {
                warn!(session_id, "sessions purged during handshake; dropping connection");
                Ok(HandshakeOutcome::Superseded {
                    session_id: session_id.to_string(),
                })
            }
        }
    }
}

pub struct HandshakeListener {
    listener: TcpListener,
    service: HandshakeService,
}

impl HandshakeListener {
    pub async fn bind(addr: SocketAddr, service: HandshakeService) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, service })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "handshake listener running");
        }
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "failed to accept handshake connection");
                    continue;
                }
            };
            let service = self.service.clone();
            tokio::spawn(async move {
                match service.accept_callback(stream).await {
                    Ok(outcome) => {
                        counter!(
                            "jam_broker_handshakes_total",
                            1,
                            "outcome" => outcome.metric_label()
                        );
                    }
                    Err(err) => {
                        counter!(
                            "jam_broker_handshakes_total",
                            1,
                            "outcome" => "failed",
                            "reason" => err.metric_label()
                        );
                        warn!(%peer, error = %err, "handshake failed");
                    }
                }
            });
        }
    }
}
