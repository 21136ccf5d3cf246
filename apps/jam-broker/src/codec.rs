//! Control-plane framing.
//!
//! A frame on the wire is `<correlation id>:<json payload>`. The correlation id
//! is an opaque token (a command index, or `-1` for broker-issued commands) and
//! is never JSON-parsed. Frames carry no length prefix; the payload is a single
//! JSON object and delimits itself.

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::codec::Decoder;

pub const SEPARATOR: u8 = b':';

/// Correlation id used for commands the broker issues on its own behalf.
pub const BROKER_CORRELATION_ID: &str = "-1";

const MAX_CORRELATION_ID_LEN: usize = 256;
const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame has no separator")]
    MissingSeparator,
    #[error("invalid correlation id: {0:?}")]
    InvalidCorrelationId(String),
    #[error("frame exceeds maximum length")]
    Oversized,
    #[error("invalid frame payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl FrameError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            FrameError::MissingSeparator => "missing_separator",
            FrameError::InvalidCorrelationId(_) => "invalid_correlation_id",
            FrameError::Oversized => "oversized",
            FrameError::Payload(_) => "invalid_payload",
        }
    }
}

/// Body of a frame: exactly one of a request or a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    Req(Value),
    Res(Value),
}

impl Payload {
    pub fn response(&self) -> Option<&Value> {
        match self {
            Payload::Res(value) => Some(value),
            Payload::Req(_) => None,
        }
    }
}

/// Fixed commands the broker sends to a session container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AddAccount(String),
    DeleteAccount(String),
    EndSession,
}

impl Command {
    pub fn into_payload(self) -> Payload {
        let req = match self {
            Command::AddAccount(account_id) => json!({ "addAccount": account_id }),
            Command::DeleteAccount(account_id) => json!({ "deleteAccount": account_id }),
            Command::EndSession => json!({ "endSession": true }),
        };
        Payload::Req(req)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub correlation_id: String,
    pub payload: Payload,
}

impl Frame {
    pub fn new(correlation_id: impl Into<String>, payload: Payload) -> Result<Self, FrameError> {
        let correlation_id = correlation_id.into();
        validate_correlation_id(&correlation_id)?;
        Ok(Self {
            correlation_id,
            payload,
        })
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        encode(&self.correlation_id, &self.payload)
    }
}

fn validate_correlation_id(correlation_id: &str) -> Result<(), FrameError> {
    if correlation_id.as_bytes().contains(&SEPARATOR) {
        return Err(FrameError::InvalidCorrelationId(correlation_id.to_string()));
    }
    Ok(())
}

pub fn encode(correlation_id: &str, payload: &Payload) -> Result<Bytes, FrameError> {
    let data = serde_json::to_string(payload)?;
    encode_raw(correlation_id, &data)
}

/// Frames data that is already serialized. The data is not validated.
pub fn encode_raw(correlation_id: &str, data: &str) -> Result<Bytes, FrameError> {
    validate_correlation_id(correlation_id)?;
    let mut buf = BytesMut::with_capacity(correlation_id.len() + 1 + data.len());
    buf.extend_from_slice(correlation_id.as_bytes());
    buf.extend_from_slice(&[SEPARATOR]);
    buf.extend_from_slice(data.as_bytes());
    Ok(buf.freeze())
}

/// Decodes one complete frame held in `buf`.
pub fn decode(buf: &[u8]) -> Result<Frame, FrameError> {
    let split = buf
        .iter()
        .position(|byte| *byte == SEPARATOR)
        .ok_or(FrameError::MissingSeparator)?;
    let correlation_id = String::from_utf8_lossy(&buf[..split]).into_owned();
    let payload = serde_json::from_slice(&buf[split + 1..])?;
    Ok(Frame {
        correlation_id,
        payload,
    })
}

/// Stream decoder for the control connection.
///
/// Malformed frames come out as `Some(Err(_))` items so the connection keeps
/// reading; only I/O failures end the stream.
#[derive(Debug, Default)]
pub struct FrameCodec;

enum Scan {
    Incomplete,
    Complete { consumed: usize, payload: Value },
    Malformed(serde_json::Error),
}

impl Decoder for FrameCodec {
    type Item = Result<Frame, FrameError>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let leading = src.iter().take_while(|b| b.is_ascii_whitespace()).count();
        src.advance(leading);
        if src.is_empty() {
            return Ok(None);
        }

        let Some(split) = src.iter().position(|byte| *byte == SEPARATOR) else {
            if src.len() > MAX_CORRELATION_ID_LEN {
                src.clear();
                return Ok(Some(Err(FrameError::MissingSeparator)));
            }
            return Ok(None);
        };
        if split > MAX_CORRELATION_ID_LEN {
            let id = String::from_utf8_lossy(&src[..split]).into_owned();
            src.clear();
            return Ok(Some(Err(FrameError::InvalidCorrelationId(id))));
        }

        let scan = {
            let mut values =
                serde_json::Deserializer::from_slice(&src[split + 1..]).into_iter::<Value>();
            match values.next() {
                None => Scan::Incomplete,
                Some(Ok(payload)) => Scan::Complete {
                    consumed: split + 1 + values.byte_offset(),
                    payload,
                },
                Some(Err(err)) if err.is_eof() => Scan::Incomplete,
                Some(Err(err)) => Scan::Malformed(err),
            }
        };

        match scan {
            Scan::Incomplete => {
                if src.len() > MAX_FRAME_LEN {
                    src.clear();
                    return Ok(Some(Err(FrameError::Oversized)));
                }
                Ok(None)
            }
            Scan::Malformed(err) => {
                // No reliable resync point inside broken JSON; drop what we have.
                src.clear();
                Ok(Some(Err(FrameError::Payload(err))))
            }
            Scan::Complete { consumed, payload } => {
                let correlation_id = String::from_utf8_lossy(&src[..split]).into_owned();
                src.advance(consumed);
                let frame = serde_json::from_value::<Payload>(payload)
                    .map(|payload| Frame {
                        correlation_id,
                        payload,
                    })
                    .map_err(FrameError::from);
                Ok(Some(frame))
            }
        }
    }
}
