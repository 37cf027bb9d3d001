//! Tokio codec for newline-delimited JSON frames
//!
//! The orchestrator side decodes [`AgentMessage`]s and encodes
//! [`OutboundFrame`]s. A line that is not valid JSON, or carries an
//! unrecognized `type`, decodes to [`AgentMessage::Unknown`] instead of an
//! error: a decode error terminates a `Framed` stream, and one bad line from
//! an agent must not drop the connection. Only an oversized line is fatal.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::message::{AgentMessage, OutboundFrame};

/// Maximum length of a single line (1 MiB)
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Codec for encoding/decoding protocol frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Bytes of the current buffer already scanned for a newline
    next_index: usize,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self { next_index: 0 }
    }
}

impl Decoder for FrameCodec {
    type Item = AgentMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.next_index..].iter().position(|b| *b == b'\n');

            let Some(offset) = newline else {
                if src.len() > MAX_LINE_LENGTH {
                    return Err(ProtocolError::FrameTooLarge {
                        size: src.len(),
                        max: MAX_LINE_LENGTH,
                    });
                }
                self.next_index = src.len();
                return Ok(None);
            };

            let line_end = self.next_index + offset;
            self.next_index = 0;
            let line = src.split_to(line_end + 1);
            let line = &line[..line_end];

            if line.len() > MAX_LINE_LENGTH {
                return Err(ProtocolError::FrameTooLarge {
                    size: line.len(),
                    max: MAX_LINE_LENGTH,
                });
            }

            let Ok(text) = std::str::from_utf8(line) else {
                tracing::warn!("Dropping non UTF-8 frame ({} bytes)", line.len());
                return Ok(Some(AgentMessage::Unknown));
            };
            let text = text.trim();
            if text.is_empty() {
                continue;
            }

            return match serde_json::from_str::<AgentMessage>(text) {
                Ok(message) => Ok(Some(message)),
                Err(e) => {
                    tracing::warn!("Dropping malformed frame: {}", e);
                    Ok(Some(AgentMessage::Unknown))
                }
            };
        }
    }
}

impl Encoder<OutboundFrame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: OutboundFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&frame)?;
        if payload.len() > MAX_LINE_LENGTH {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: MAX_LINE_LENGTH,
            });
        }

        dst.reserve(payload.len() + 1);
        dst.put_slice(&payload);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CommandEnvelope};

    #[test]
    fn test_encode_appends_newline() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(
                OutboundFrame::Command(CommandEnvelope::new("1", Command::stop("tenant_a"))),
                &mut buf,
            )
            .unwrap();

        assert_eq!(buf.last(), Some(&b'\n'));
        let value: serde_json::Value = serde_json::from_slice(&buf[..buf.len() - 1]).unwrap();
        assert_eq!(value["type"], "bot.stop");
    }

    #[test]
    fn test_decode_partial_read() {
        let mut codec = FrameCodec::new();
        let line = b"{\"type\":\"heartbeat\",\"containers\":[]}\n";

        let mut buf = BytesMut::from(&line[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&line[10..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(decoded, AgentMessage::Heartbeat(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_multiple_lines_and_blank() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(
            &b"\n{\"type\":\"heartbeat\"}\n{\"type\":\"command_result\",\"id\":\"9\",\"success\":true}\n"[..],
        );

        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(AgentMessage::Heartbeat(_))
        ));
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(AgentMessage::CommandResult(_))
        ));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_malformed_line_is_not_fatal() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"not json\n{\"type\":\"heartbeat\"}\n"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(AgentMessage::Unknown));
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(AgentMessage::Heartbeat(_))
        ));
    }

    #[test]
    fn test_oversized_line_is_fatal() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(vec![b'x'; MAX_LINE_LENGTH + 1].as_slice());

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }
}
