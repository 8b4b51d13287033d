// codec.rs

//! Wire codec for the dynamic-session control protocol.
//!
//! Every datagram carries exactly one frame: a fixed 21-byte [`MessageHeader`] followed by a
//! body whose length the header declares. All integers are big-endian, strings are UTF-8 with a
//! `u16` length prefix.
//!
//! ```text
//! MessageHeader
//!   magic_cookie    u32
//!   message_type    u8    1=START_REQ 2=START_RES 3=STOP_REQ 4=STOP_RES
//!   sequence_number u32
//!   timestamp       u64   ms since the Unix epoch
//!   body_length     u32
//! START_REQ  source_ip(str) uri(str) expires(u64)
//! STOP_REQ   source_ip(str) uri(str)
//! START_RES / STOP_RES  status_code(u16) reason_length(u16) reason(bytes)
//! ```

use std::io::{self, Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use thiserror::Error;

use crate::types::ResponseType;

pub const MESSAGE_MAGIC_COOKIE: u32 = 0x4441_5348;
pub const HEADER_SIZE: usize = 4 + 1 + 4 + 8 + 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("bad magic cookie: {0:#010x}")]
    BadMagic(u32),

    #[error("declared body length {declared} does not match the {actual} trailing bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("body of {0:?} is truncated")]
    Truncated(MessageType),

    #[error("body of {message_type:?} has {remaining} unread bytes")]
    TrailingBytes {
        message_type: MessageType,
        remaining: usize,
    },

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("field of {0} bytes does not fit its u16 length prefix")]
    FieldTooLong(usize),
}

pub type CodecResult<T> = Result<T, CodecError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    StreamingStartRequest,
    StreamingStartResponse,
    StreamingStopRequest,
    StreamingStopResponse,
}

impl MessageType {
    pub fn code(self) -> u8 {
        match self {
            MessageType::StreamingStartRequest => 1,
            MessageType::StreamingStartResponse => 2,
            MessageType::StreamingStopRequest => 3,
            MessageType::StreamingStopResponse => 4,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(MessageType::StreamingStartRequest),
            2 => Ok(MessageType::StreamingStartResponse),
            3 => Ok(MessageType::StreamingStopRequest),
            4 => Ok(MessageType::StreamingStopResponse),
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic_cookie: u32,
    pub message_type: MessageType,
    pub sequence_number: u32,
    pub timestamp: u64,
    pub body_length: u32,
}

impl MessageHeader {
    fn write_to(&self, buffer: &mut Vec<u8>) {
        // Writes into a Vec cannot fail.
        let _ = buffer.write_u32::<BigEndian>(self.magic_cookie);
        let _ = buffer.write_u8(self.message_type.code());
        let _ = buffer.write_u32::<BigEndian>(self.sequence_number);
        let _ = buffer.write_u64::<BigEndian>(self.timestamp);
        let _ = buffer.write_u32::<BigEndian>(self.body_length);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamingStartRequest {
    pub source_ip: String,
    pub uri: String,
    pub expires: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamingStopRequest {
    pub source_ip: String,
    pub uri: String,
}

/// Body shared by `START_RES` and `STOP_RES`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamingResponse {
    pub status_code: u16,
    pub reason: String,
}

impl StreamingResponse {
    pub fn new(response_type: ResponseType) -> Self {
        Self {
            status_code: response_type.code(),
            reason: response_type.reason().to_owned(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == ResponseType::Success.code()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageBody {
    StartRequest(StreamingStartRequest),
    StartResponse(StreamingResponse),
    StopRequest(StreamingStopRequest),
    StopResponse(StreamingResponse),
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::StartRequest(_) => MessageType::StreamingStartRequest,
            MessageBody::StartResponse(_) => MessageType::StreamingStartResponse,
            MessageBody::StopRequest(_) => MessageType::StreamingStopRequest,
            MessageBody::StopResponse(_) => MessageType::StreamingStopResponse,
        }
    }

    fn encode(&self) -> CodecResult<Vec<u8>> {
        let mut buffer = Vec::new();
        match self {
            MessageBody::StartRequest(request) => {
                write_string(&mut buffer, &request.source_ip)?;
                write_string(&mut buffer, &request.uri)?;
                let _ = buffer.write_u64::<BigEndian>(request.expires);
            }
            MessageBody::StopRequest(request) => {
                write_string(&mut buffer, &request.source_ip)?;
                write_string(&mut buffer, &request.uri)?;
            }
            MessageBody::StartResponse(response) | MessageBody::StopResponse(response) => {
                let _ = buffer.write_u16::<BigEndian>(response.status_code);
                write_string(&mut buffer, &response.reason)?;
            }
        }
        Ok(buffer)
    }

    fn decode(message_type: MessageType, body: &[u8]) -> CodecResult<Self> {
        let mut cursor = Cursor::new(body);
        let truncated = |_: io::Error| CodecError::Truncated(message_type);

        let message = match message_type {
            MessageType::StreamingStartRequest => {
                let source_ip = read_string(&mut cursor).map_err(|e| e.or(message_type))?;
                let uri = read_string(&mut cursor).map_err(|e| e.or(message_type))?;
                let expires = cursor.read_u64::<BigEndian>().map_err(truncated)?;
                MessageBody::StartRequest(StreamingStartRequest {
                    source_ip,
                    uri,
                    expires,
                })
            }
            MessageType::StreamingStopRequest => {
                let source_ip = read_string(&mut cursor).map_err(|e| e.or(message_type))?;
                let uri = read_string(&mut cursor).map_err(|e| e.or(message_type))?;
                MessageBody::StopRequest(StreamingStopRequest { source_ip, uri })
            }
            MessageType::StreamingStartResponse | MessageType::StreamingStopResponse => {
                let status_code = cursor.read_u16::<BigEndian>().map_err(truncated)?;
                let reason = read_string(&mut cursor).map_err(|e| e.or(message_type))?;
                let response = StreamingResponse {
                    status_code,
                    reason,
                };
                if message_type == MessageType::StreamingStartResponse {
                    MessageBody::StartResponse(response)
                } else {
                    MessageBody::StopResponse(response)
                }
            }
        };

        let remaining = body.len() - cursor.position() as usize;
        if remaining != 0 {
            return Err(CodecError::TrailingBytes {
                message_type,
                remaining,
            });
        }
        Ok(message)
    }
}

/// One decoded datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlMessage {
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl ControlMessage {
    /// Builds a message whose header matches `body`.
    pub fn new(sequence_number: u32, timestamp: u64, body: MessageBody) -> CodecResult<Self> {
        let body_length = body.encode()?.len() as u32;
        Ok(Self {
            header: MessageHeader {
                magic_cookie: MESSAGE_MAGIC_COOKIE,
                message_type: body.message_type(),
                sequence_number,
                timestamp,
                body_length,
            },
            body,
        })
    }

    /// Serializes the frame. The written body length is always the real one.
    pub fn encode(&self) -> CodecResult<Bytes> {
        let body = self.body.encode()?;
        let header = MessageHeader {
            message_type: self.body.message_type(),
            body_length: body.len() as u32,
            ..self.header.clone()
        };

        let mut buffer = Vec::with_capacity(HEADER_SIZE + body.len());
        header.write_to(&mut buffer);
        buffer.extend_from_slice(&body);
        Ok(Bytes::from(buffer))
    }

    /// Parses one datagram.
    ///
    /// Returns `Ok(None)` for datagrams too short to carry a header; those are noise, not
    /// protocol errors.
    pub fn decode(data: &[u8]) -> CodecResult<Option<Self>> {
        if data.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&data[..HEADER_SIZE]);
        // The slice is exactly HEADER_SIZE long, these reads cannot run short.
        let magic_cookie = cursor.read_u32::<BigEndian>().unwrap_or_default();
        let type_code = cursor.read_u8().unwrap_or_default();
        let sequence_number = cursor.read_u32::<BigEndian>().unwrap_or_default();
        let timestamp = cursor.read_u64::<BigEndian>().unwrap_or_default();
        let body_length = cursor.read_u32::<BigEndian>().unwrap_or_default();

        if magic_cookie != MESSAGE_MAGIC_COOKIE {
            return Err(CodecError::BadMagic(magic_cookie));
        }

        let body = &data[HEADER_SIZE..];
        if body.len() != body_length as usize {
            return Err(CodecError::LengthMismatch {
                declared: body_length as usize,
                actual: body.len(),
            });
        }

        let message_type = MessageType::try_from(type_code)?;
        let body = MessageBody::decode(message_type, body)?;

        Ok(Some(Self {
            header: MessageHeader {
                magic_cookie,
                message_type,
                sequence_number,
                timestamp,
                body_length,
            },
            body,
        }))
    }
}

/// Error from a string read, before the message type is known.
enum FieldError {
    Truncated,
    InvalidUtf8,
}

impl FieldError {
    fn or(self, message_type: MessageType) -> CodecError {
        match self {
            FieldError::Truncated => CodecError::Truncated(message_type),
            FieldError::InvalidUtf8 => CodecError::InvalidUtf8,
        }
    }
}

fn write_string(buffer: &mut Vec<u8>, value: &str) -> CodecResult<()> {
    let length = u16::try_from(value.len()).map_err(|_| CodecError::FieldTooLong(value.len()))?;
    let _ = buffer.write_u16::<BigEndian>(length);
    buffer.extend_from_slice(value.as_bytes());
    Ok(())
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String, FieldError> {
    let length = cursor
        .read_u16::<BigEndian>()
        .map_err(|_| FieldError::Truncated)? as usize;
    let mut raw = vec![0u8; length];
    cursor.read_exact(&mut raw).map_err(|_| FieldError::Truncated)?;
    String::from_utf8(raw).map_err(|_| FieldError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_request() -> ControlMessage {
        ControlMessage::new(
            7,
            1_700_000_000_000,
            MessageBody::StartRequest(StreamingStartRequest {
                source_ip: "10.0.0.5".to_owned(),
                uri: "stream1.mp4".to_owned(),
                expires: 3600,
            }),
        )
        .unwrap()
    }

    #[test]
    fn start_request_layout() {
        let bytes = start_request().encode().unwrap();

        // header + (2 + 8) + (2 + 11) + 8
        assert_eq!(bytes.len(), HEADER_SIZE + 31);
        assert_eq!(&bytes[0..4], &MESSAGE_MAGIC_COOKIE.to_be_bytes());
        assert_eq!(bytes[4], 1);
        assert_eq!(&bytes[5..9], &7u32.to_be_bytes());
        assert_eq!(&bytes[17..21], &31u32.to_be_bytes());
        assert_eq!(&bytes[21..23], &8u16.to_be_bytes());
        assert_eq!(&bytes[23..31], b"10.0.0.5");
        assert_eq!(&bytes[bytes.len() - 8..], &3600u64.to_be_bytes());
    }

    #[test]
    fn every_message_type_survives_the_wire() {
        let bodies = [
            MessageBody::StartRequest(StreamingStartRequest {
                source_ip: "192.168.0.1".to_owned(),
                uri: "/live/cam.mp4".to_owned(),
                expires: u64::MAX,
            }),
            MessageBody::StartResponse(StreamingResponse::new(ResponseType::Forbidden)),
            MessageBody::StopRequest(StreamingStopRequest {
                source_ip: String::new(),
                uri: "ÜNICODE.mp4".to_owned(),
            }),
            MessageBody::StopResponse(StreamingResponse {
                status_code: 599,
                reason: String::new(),
            }),
        ];

        for (seq, body) in bodies.into_iter().enumerate() {
            let message = ControlMessage::new(seq as u32, 42, body).unwrap();
            let bytes = message.encode().unwrap();
            let decoded = ControlMessage::decode(&bytes).unwrap().unwrap();
            assert_eq!(decoded, message);
            assert_eq!(decoded.encode().unwrap(), bytes);
        }
    }

    #[test]
    fn short_datagrams_are_noise() {
        let bytes = start_request().encode().unwrap();
        assert_eq!(ControlMessage::decode(&bytes[..HEADER_SIZE - 1]), Ok(None));
        assert_eq!(ControlMessage::decode(&[]), Ok(None));
    }

    #[test]
    fn body_length_must_match_trailing_bytes() {
        let bytes = start_request().encode().unwrap();

        let mut long = bytes.to_vec();
        long.push(0);
        assert_eq!(
            ControlMessage::decode(&long),
            Err(CodecError::LengthMismatch {
                declared: 31,
                actual: 32
            })
        );
        assert_eq!(
            ControlMessage::decode(&bytes[..bytes.len() - 1]),
            Err(CodecError::LengthMismatch {
                declared: 31,
                actual: 30
            })
        );
    }

    #[test]
    fn bad_magic_and_unknown_type_are_rejected() {
        let mut bytes = start_request().encode().unwrap().to_vec();
        bytes[4] = 9;
        assert_eq!(
            ControlMessage::decode(&bytes),
            Err(CodecError::UnknownMessageType(9))
        );

        bytes[0] = 0;
        assert!(matches!(
            ControlMessage::decode(&bytes),
            Err(CodecError::BadMagic(_))
        ));
    }

    #[test]
    fn inconsistent_body_fields_are_rejected() {
        // STOP_REQ whose body claims a 200-byte source ip
        let mut frame = Vec::new();
        MessageHeader {
            magic_cookie: MESSAGE_MAGIC_COOKIE,
            message_type: MessageType::StreamingStopRequest,
            sequence_number: 1,
            timestamp: 0,
            body_length: 4,
        }
        .write_to(&mut frame);
        frame.extend_from_slice(&[0, 200, b'a', b'b']);
        assert_eq!(
            ControlMessage::decode(&frame),
            Err(CodecError::Truncated(MessageType::StreamingStopRequest))
        );

        // STOP_RES with one byte left over after the reason
        let mut frame = Vec::new();
        MessageHeader {
            magic_cookie: MESSAGE_MAGIC_COOKIE,
            message_type: MessageType::StreamingStopResponse,
            sequence_number: 1,
            timestamp: 0,
            body_length: 5,
        }
        .write_to(&mut frame);
        frame.extend_from_slice(&[0, 200, 0, 0, 0xff]);
        assert_eq!(
            ControlMessage::decode(&frame),
            Err(CodecError::TrailingBytes {
                message_type: MessageType::StreamingStopResponse,
                remaining: 1
            })
        );
    }

    #[test]
    fn oversized_strings_cannot_be_encoded() {
        let body = MessageBody::StopRequest(StreamingStopRequest {
            source_ip: "a".repeat(u16::MAX as usize + 1),
            uri: "x".to_owned(),
        });
        assert_eq!(
            ControlMessage::new(1, 0, body),
            Err(CodecError::FieldTooLong(u16::MAX as usize + 1))
        );
    }
}
