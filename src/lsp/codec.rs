//! `Content-Length` framing for JSON-RPC messages
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <payload>
//! ```

use crate::types::LspError;
use bytes::{Buf, BufMut, BytesMut};
use lsp_server::Message;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Refuse frames larger than this rather than buffering without bound.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// `lsp_server::Message` serializes without the version member.
#[derive(Serialize)]
struct Envelope<'a> {
    jsonrpc: &'static str,
    #[serde(flatten)]
    message: &'a Message,
}

#[derive(Debug, Default)]
pub struct LspCodec {
    /// Body length of the frame whose headers were already consumed
    pending: Option<usize>,
}

impl LspCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

fn parse_headers(headers: &[u8]) -> Result<usize, LspError> {
    let headers = std::str::from_utf8(headers)
        .map_err(|_| LspError::ProtocolError("non UTF-8 message header".to_string()))?;

    let mut length = None;
    for line in headers.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        // Content-Type is allowed and ignored
        if name.trim().eq_ignore_ascii_case("content-length") {
            let value = value.trim().parse::<usize>().map_err(|_| {
                LspError::ProtocolError(format!("invalid Content-Length: {}", value.trim()))
            })?;
            length = Some(value);
        }
    }

    let length =
        length.ok_or_else(|| LspError::ProtocolError("missing Content-Length header".to_string()))?;
    if length > MAX_FRAME_LEN {
        return Err(LspError::ProtocolError(format!(
            "frame of {} bytes exceeds limit",
            length
        )));
    }
    Ok(length)
}

impl Decoder for LspCodec {
    type Item = Message;
    type Error = LspError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, LspError> {
        loop {
            let length = match self.pending {
                Some(length) => length,
                None => {
                    let Some(end) = src.windows(HEADER_END.len()).position(|w| w == HEADER_END)
                    else {
                        return Ok(None);
                    };
                    let length = parse_headers(&src[..end])?;
                    src.advance(end + HEADER_END.len());
                    self.pending = Some(length);
                    length
                }
            };

            if src.len() < length {
                src.reserve(length - src.len());
                return Ok(None);
            }

            self.pending = None;
            let body = src.split_to(length);
            match serde_json::from_slice::<Message>(&body) {
                Ok(message) => {
                    trace!("<- {}", String::from_utf8_lossy(&body));
                    return Ok(Some(message));
                }
                Err(e) => {
                    // One bad body does not poison the stream
                    warn!("Skipping malformed message: {}", e);
                }
            }
        }
    }
}

impl Encoder<Message> for LspCodec {
    type Error = LspError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), LspError> {
        let body = serde_json::to_vec(&Envelope {
            jsonrpc: "2.0",
            message: &message,
        })?;
        trace!("-> {}", String::from_utf8_lossy(&body));

        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        dst.reserve(header.len() + body.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}
