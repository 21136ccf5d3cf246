//! Outbound writes and inbound response dispatch for live sessions.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use metrics::counter;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{self, Frame, FrameCodec, Payload};
use crate::registry::{Connection, ConnectionId, RegisterError, SendError, SessionRegistry};

pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;

/// Receives every `res` frame a session container sends back.
pub trait ResponseHandler: Send + Sync {
    fn on_response(&self, correlation_id: &str, payload: &Value, session_id: &str);
}

impl<F> ResponseHandler for F
where
    F: Fn(&str, &Value, &str) + Send + Sync,
{
    fn on_response(&self, correlation_id: &str, payload: &Value, session_id: &str) {
        self(correlation_id, payload, session_id)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopResponseHandler;

impl ResponseHandler for NoopResponseHandler {
    fn on_response(&self, _correlation_id: &str, _payload: &Value, _session_id: &str) {}
}

/// Emits each response as a structured log event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingResponseHandler;

impl ResponseHandler for LoggingResponseHandler {
    fn on_response(&self, correlation_id: &str, payload: &Value, session_id: &str) {
        info!(session_id, correlation_id, %payload, "session response");
    }
}

#[derive(Clone)]
pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
    outbound_buffer: usize,
}

impl MessageRouter {
    pub fn new(registry: Arc<SessionRegistry>, outbound_buffer: usize) -> Self {
        Self {
            registry,
            outbound_buffer: outbound_buffer.max(1),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Frames already-serialized `data` and queues it for the session.
    ///
    /// Fire-and-forget: a session that is not live, a full queue, or a bad
    /// correlation id all drop the frame. Returns whether it was queued.
    pub fn write(&self, session_id: &str, correlation_id: &str, data: &str) -> bool {
        let Some(connection) = self.registry.get(session_id) else {
            debug!(session_id, correlation_id, "write to session that is not live");
            return false;
        };
        match codec::encode_raw(correlation_id, data) {
            Ok(frame) => queue(&connection, session_id, frame),
            Err(err) => {
                warn!(session_id, error = %err, "refusing to frame outbound write");
                false
            }
        }
    }

    pub fn send(&self, session_id: &str, correlation_id: &str, payload: &Payload) -> bool {
        let Some(connection) = self.registry.get(session_id) else {
            debug!(session_id, correlation_id, "send to session that is not live");
            return false;
        };
        match codec::encode(correlation_id, payload) {
            Ok(frame) => queue(&connection, session_id, frame),
            Err(err) => {
                warn!(session_id, error = %err, "refusing to frame outbound payload");
                false
            }
        }
    }

    pub fn list_active(&self) -> Vec<(String, Connection)> {
        self.registry.list_active()
    }

    /// Takes ownership of a bridged control stream: spawns its writer and
    /// reader tasks and registers it under `session_id`.
    pub fn attach(
        &self,
        session_id: &str,
        stream: TcpStream,
        handler: Arc<dyn ResponseHandler>,
        epoch: u64,
    ) -> Result<Connection, RegisterError> {
        let peer = stream
            .peer_addr()
            .unwrap_or_else(|_| std::net::SocketAddr::from(([0, 0, 0, 0], 0)));
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(self.outbound_buffer);
        let shutdown = CancellationToken::new();
        let connection = Connection::new(
            self.registry.next_connection_id(),
            peer,
            tx,
            shutdown.clone(),
        );

        self.registry
            .register(session_id, connection.clone(), epoch)?;

        let context = ConnectionContext {
            session_id: session_id.to_string(),
            connection_id: connection.id(),
            registry: Arc::clone(&self.registry),
            shutdown,
        };
        tokio::spawn(write_loop(context.clone(), write_half, rx));
        tokio::spawn(read_loop(context, read_half, handler));

        Ok(connection)
    }
}

fn queue(connection: &Connection, session_id: &str, frame: Bytes) -> bool {
    match connection.send(frame) {
        Ok(()) => true,
        Err(SendError::Full) => {
            counter!("jam_broker_frames_dropped_total", 1, "reason" => "queue_full");
            warn!(session_id, "outbound queue full; dropping frame");
            false
        }
        Err(SendError::Closed) => {
            debug!(session_id, "connection closed; dropping frame");
            false
        }
    }
}

fn dispatch(frame: Frame, session_id: &str, handler: &dyn ResponseHandler) {
    match frame.payload.response() {
        Some(response) => handler.on_response(&frame.correlation_id, response, session_id),
        None => debug!(
            session_id,
            correlation_id = %frame.correlation_id,
            "ignoring request frame from container"
        ),
    }
}

#[derive(Clone)]
struct ConnectionContext {
    session_id: String,
    connection_id: ConnectionId,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
}

impl ConnectionContext {
    fn finish(&self, reason: &str) {
        self.shutdown.cancel();
        if self
            .registry
            .remove_if_current(&self.session_id, self.connection_id)
        {
            info!(
                session_id = %self.session_id,
                connection_id = self.connection_id,
                reason,
                "session ended"
            );
        }
    }
}

async fn write_loop(
    context: ConnectionContext,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
) {
    let reason = loop {
        tokio::select! {
            _ = context.shutdown.cancelled() => break "closed",
            next = rx.recv() => match next {
                Some(frame) => {
                    if let Err(err) = writer.write_all(&frame).await {
                        warn!(
                            session_id = %context.session_id,
                            error = %err,
                            "control connection write failed"
                        );
                        break "write_error";
                    }
                }
                None => break "released",
            },
        }
    };
    let _ = writer.shutdown().await;
    context.finish(reason);
}

async fn read_loop(
    context: ConnectionContext,
    reader: OwnedReadHalf,
    handler: Arc<dyn ResponseHandler>,
) {
    let mut frames = FramedRead::new(reader, FrameCodec);
    let reason = loop {
        tokio::select! {
            _ = context.shutdown.cancelled() => break "closed",
            next = frames.next() => match next {
                Some(Ok(Ok(frame))) => dispatch(frame, &context.session_id, handler.as_ref()),
                Some(Ok(Err(err))) => {
                    counter!(
                        "jam_broker_frames_dropped_total",
                        1,
                        "reason" => err.metric_label()
                    );
                    warn!(
                        session_id = %context.session_id,
                        error = %err,
                        "dropping malformed frame"
                    );
                }
                Some(Err(err)) => {
                    warn!(
                        session_id = %context.session_id,
                        error = %err,
                        "control connection error"
                    );
                    break "error";
                }
                None => break "remote_end",
            },
        }
    };
    context.finish(reason);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    type Responses = Arc<Mutex<Vec<(String, Value, String)>>>;

    fn recording_handler() -> (Arc<dyn ResponseHandler>, Responses) {
        let seen: Responses = Arc::default();
        let sink = Arc::clone(&seen);
        let handler = move |correlation_id: &str, payload: &Value, session_id: &str| {
            sink.lock().push((
                correlation_id.to_string(),
                payload.clone(),
                session_id.to_string(),
            ));
        };
        (Arc::new(handler), seen)
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test_timeout::timeout]
    fn write_to_unknown_session_is_a_no_op() {
        let router = MessageRouter::new(Arc::new(SessionRegistry::new()), 4);
        assert!(!router.write("missing", "1", "{}"));
        assert!(!router.send("missing", "1", &Payload::Req(json!({}))));
        assert!(router.list_active().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn routes_frames_both_ways() {
        let router = MessageRouter::new(Arc::new(SessionRegistry::new()), 4);
        let (broker_side, mut container) = socket_pair().await;
        let (handler, seen) = recording_handler();

        router
            .attach("abc", broker_side, handler, router.registry().epoch())
            .unwrap();
        assert!(router.write("abc", "3", r#"{"req":{"ping":1}}"#));

        let expected = br#"3:{"req":{"ping":1}}"#;
        let mut buf = vec![0u8; expected.len()];
        container.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], &expected[..]);

        container
            .write_all(br#"7:{"res":{"ok":true}}8:{"req":{"x":1}}9:{broken"#)
            .await
            .unwrap();
        container.write_all(br#"10:{"res":2}"#).await.unwrap();

        wait_until(|| !seen.lock().is_empty()).await;
        let first = seen.lock()[0].clone();
        assert_eq!(
            first,
            ("7".to_string(), json!({ "ok": true }), "abc".to_string())
        );
        assert!(router.registry().contains("abc"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn remote_close_unregisters_session() {
        let router = MessageRouter::new(Arc::new(SessionRegistry::new()), 4);
        let (broker_side, container) = socket_pair().await;

        router
            .attach(
                "abc",
                broker_side,
                Arc::new(NoopResponseHandler),
                router.registry().epoch(),
            )
            .unwrap();
        drop(container);

        let registry = Arc::clone(router.registry());
        wait_until(|| !registry.contains("abc")).await;
        assert!(!router.write("abc", "1", "{}"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn closing_connection_shuts_socket() {
        let router = MessageRouter::new(Arc::new(SessionRegistry::new()), 4);
        let (broker_side, mut container) = socket_pair().await;

        let connection = router
            .attach(
                "abc",
                broker_side,
                Arc::new(NoopResponseHandler),
                router.registry().epoch(),
            )
            .unwrap();
        connection.close();

        let mut buf = [0u8; 8];
        let read = container.read(&mut buf).await.unwrap();
        assert_eq!(read, 0);
        let registry = Arc::clone(router.registry());
        wait_until(|| !registry.contains("abc")).await;
    }
}
