//! Message protocol for the capture pipe
//!
//! Frame format (little-endian, packed):
//! ```text
//! ┌──────────────┐
//! │ kind: i32    │  <- MessageKind
//! │ size: i32    │  <- total frame size, header included
//! │ body...      │  <- size - 8 bytes, layout depends on kind
//! └──────────────┘
//! ```
//!
//! Bodies with trailing data (`FunctionCode`, `FunctionCallTarget`) carry a
//! fixed 28-byte prefix followed by `codeSize`/`nameLength` raw bytes.

use crate::error::ProtocolError;

/// Frame header size in bytes
pub const HEADER_SIZE: usize = 8; // kind + size

/// Size of the fixed prefix shared by code, call-target and request bodies
/// (function id, address, re-JIT id, process id).
pub const FUNCTION_PREFIX_SIZE: usize = 24;

/// Fixed prefix of a `FunctionCode` / `FunctionCallTarget` body, length field included.
pub const TRAILING_PREFIX_SIZE: usize = FUNCTION_PREFIX_SIZE + 4;

/// Largest frame either side will accept (64MB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Message kinds (kind field)
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Producer announces itself (payload: process kind + process id)
    StartSession = 0,
    /// Consumer ends the session (payload: none)
    EndSession = 1,
    /// Native code of one compiled region
    FunctionCode = 2,
    /// Resolved name of a call/branch target inside captured code
    FunctionCallTarget = 3,
    /// Consumer asks for a function's code to be (re)sent
    RequestFunctionCode = 4,
}

impl TryFrom<i32> for MessageKind {
    type Error = ProtocolError;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(MessageKind::StartSession),
            1 => Ok(MessageKind::EndSession),
            2 => Ok(MessageKind::FunctionCode),
            3 => Ok(MessageKind::FunctionCallTarget),
            4 => Ok(MessageKind::RequestFunctionCode),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// Frame header (8 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Raw message kind; unknown kinds are carried through so the receiver can skip them
    pub kind: i32,
    /// Total frame size in bytes, header included
    pub size: i32,
}

impl MessageHeader {
    /// Create a header for a body of `body_len` bytes.
    pub fn new(kind: MessageKind, body_len: usize) -> Result<Self, ProtocolError> {
        let total = HEADER_SIZE + body_len;
        if total > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge {
                len: total,
                max: MAX_MESSAGE_SIZE,
            });
        }

        Ok(Self {
            kind: kind as i32,
            size: total as i32,
        })
    }

    /// Get the message kind
    pub fn message_kind(&self) -> Result<MessageKind, ProtocolError> {
        MessageKind::try_from(self.kind)
    }

    /// Number of body bytes following the header.
    pub fn body_len(&self) -> Result<usize, ProtocolError> {
        if self.size < HEADER_SIZE as i32 {
            return Err(ProtocolError::InvalidSize(self.size));
        }

        let total = self.size as usize;
        if total > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge {
                len: total,
                max: MAX_MESSAGE_SIZE,
            });
        }

        Ok(total - HEADER_SIZE)
    }

    /// Serialize header to bytes (little-endian)
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.kind.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.size.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            kind: i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            size: i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

/// Producer hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartSession {
    /// PE machine type of the instrumented process
    pub process_kind: i32,
    pub process_id: i32,
}

/// Native code of one compiled region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCode {
    pub function_id: i64,
    /// Start address of the code region
    pub address: i64,
    pub rejit_id: i32,
    pub process_id: i32,
    pub code: Vec<u8>,
}

/// A call target found in a function's code, with its resolved name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCallTarget {
    /// Function whose code contains the call
    pub function_id: i64,
    /// Destination address of the call
    pub address: i64,
    pub rejit_id: i32,
    pub process_id: i32,
    pub name: String,
}

/// Consumer request to (re)send one generation of a function's code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFunctionCode {
    pub function_id: i64,
    pub address: i64,
    pub rejit_id: i32,
    pub process_id: i32,
}

/// A decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    StartSession(StartSession),
    EndSession,
    FunctionCode(FunctionCode),
    FunctionCallTarget(FunctionCallTarget),
    RequestFunctionCode(RequestFunctionCode),
}

impl Message {
    /// Get message kind
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::StartSession(_) => MessageKind::StartSession,
            Message::EndSession => MessageKind::EndSession,
            Message::FunctionCode(_) => MessageKind::FunctionCode,
            Message::FunctionCallTarget(_) => MessageKind::FunctionCallTarget,
            Message::RequestFunctionCode(_) => MessageKind::RequestFunctionCode,
        }
    }

    /// Serialize the body (everything after the header).
    pub fn encode_body(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut body = Vec::new();

        match self {
            Message::StartSession(start) => {
                body.extend_from_slice(&start.process_kind.to_le_bytes());
                body.extend_from_slice(&start.process_id.to_le_bytes());
            }
            Message::EndSession => {}
            Message::FunctionCode(code) => {
                body.reserve(TRAILING_PREFIX_SIZE + code.code.len());
                put_prefix(
                    &mut body,
                    code.function_id,
                    code.address,
                    code.rejit_id,
                    code.process_id,
                );
                body.extend_from_slice(&trailing_len(code.code.len())?.to_le_bytes());
                body.extend_from_slice(&code.code);
            }
            Message::FunctionCallTarget(target) => {
                let name = target.name.as_bytes();
                body.reserve(TRAILING_PREFIX_SIZE + name.len());
                put_prefix(
                    &mut body,
                    target.function_id,
                    target.address,
                    target.rejit_id,
                    target.process_id,
                );
                body.extend_from_slice(&trailing_len(name.len())?.to_le_bytes());
                body.extend_from_slice(name);
            }
            Message::RequestFunctionCode(request) => {
                put_prefix(
                    &mut body,
                    request.function_id,
                    request.address,
                    request.rejit_id,
                    request.process_id,
                );
            }
        }

        if HEADER_SIZE + body.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge {
                len: HEADER_SIZE + body.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        Ok(body)
    }

    /// Serialize header and body into one buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = self.encode_body()?;
        let header = MessageHeader::new(self.kind(), body.len())?;
        let mut bytes = Vec::with_capacity(HEADER_SIZE + body.len());
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Decode a body received under `header`.
    pub fn decode(header: &MessageHeader, body: &[u8]) -> Result<Self, ProtocolError> {
        let expected = header.body_len()?;
        if body.len() < expected {
            return Err(ProtocolError::Truncated {
                what: "frame body",
                expected,
                actual: body.len(),
            });
        }
        let body = &body[..expected];
        let mut reader = BodyReader::new(body);

        match header.message_kind()? {
            MessageKind::StartSession => Ok(Message::StartSession(StartSession {
                process_kind: reader.i32("StartSession")?,
                process_id: reader.i32("StartSession")?,
            })),
            MessageKind::EndSession => Ok(Message::EndSession),
            MessageKind::FunctionCode => {
                let (function_id, address, rejit_id, process_id) =
                    reader.prefix("FunctionCode")?;
                let code_size = reader.i32("FunctionCode")?;
                let code = reader.trailing("FunctionCode code bytes", code_size)?;
                Ok(Message::FunctionCode(FunctionCode {
                    function_id,
                    address,
                    rejit_id,
                    process_id,
                    code: code.to_vec(),
                }))
            }
            MessageKind::FunctionCallTarget => {
                let (function_id, address, rejit_id, process_id) =
                    reader.prefix("FunctionCallTarget")?;
                let name_length = reader.i32("FunctionCallTarget")?;
                let name = reader.trailing("FunctionCallTarget name", name_length)?;
                // Older producers count a NUL terminator in nameLength.
                let name = match name.iter().position(|&b| b == 0) {
                    Some(end) => &name[..end],
                    None => name,
                };
                Ok(Message::FunctionCallTarget(FunctionCallTarget {
                    function_id,
                    address,
                    rejit_id,
                    process_id,
                    name: String::from_utf8_lossy(name).into_owned(),
                }))
            }
            MessageKind::RequestFunctionCode => {
                let (function_id, address, rejit_id, process_id) =
                    reader.prefix("RequestFunctionCode")?;
                Ok(Message::RequestFunctionCode(RequestFunctionCode {
                    function_id,
                    address,
                    rejit_id,
                    process_id,
                }))
            }
        }
    }
}

fn put_prefix(body: &mut Vec<u8>, function_id: i64, address: i64, rejit_id: i32, process_id: i32) {
    body.extend_from_slice(&function_id.to_le_bytes());
    body.extend_from_slice(&address.to_le_bytes());
    body.extend_from_slice(&rejit_id.to_le_bytes());
    body.extend_from_slice(&process_id.to_le_bytes());
}

fn trailing_len(len: usize) -> Result<i32, ProtocolError> {
    i32::try_from(len).map_err(|_| ProtocolError::TooLarge {
        len,
        max: i32::MAX as usize,
    })
}

/// Little-endian cursor over a message body.
struct BodyReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> BodyReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, what: &'static str, len: usize) -> Result<&'a [u8], ProtocolError> {
        let remaining = self.bytes.len() - self.offset;
        if len > remaining {
            return Err(ProtocolError::Truncated {
                what,
                expected: self.offset + len,
                actual: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn i32(&mut self, what: &'static str) -> Result<i32, ProtocolError> {
        let bytes = self.take(what, 4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i64(&mut self, what: &'static str) -> Result<i64, ProtocolError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(what, 8)?);
        Ok(i64::from_le_bytes(buf))
    }

    fn prefix(&mut self, what: &'static str) -> Result<(i64, i64, i32, i32), ProtocolError> {
        Ok((self.i64(what)?, self.i64(what)?, self.i32(what)?, self.i32(what)?))
    }

    fn trailing(&mut self, what: &'static str, len: i32) -> Result<&'a [u8], ProtocolError> {
        if len < 0 {
            return Err(ProtocolError::NegativeLength(len));
        }
        self.take(what, len as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(bytes: &[u8]) -> (MessageHeader, &[u8]) {
        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&bytes[..HEADER_SIZE]);
        (MessageHeader::from_bytes(&raw), &bytes[HEADER_SIZE..])
    }

    #[test]
    fn test_function_code_layout() {
        let message = Message::FunctionCode(FunctionCode {
            function_id: 0x1122334455667788,
            address: 0x7ff0_0000_1000,
            rejit_id: 3,
            process_id: 4242,
            code: vec![0xC3; 300],
        });

        let bytes = message.to_bytes().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + TRAILING_PREFIX_SIZE + 300);

        let (header, body) = split(&bytes);
        assert_eq!(header.kind, MessageKind::FunctionCode as i32);
        assert_eq!(header.size as usize, bytes.len());

        // Packed offsets: code size sits at 24, code bytes start at 28.
        assert_eq!(&body[0..8], &0x1122334455667788i64.to_le_bytes());
        assert_eq!(&body[16..20], &3i32.to_le_bytes());
        assert_eq!(&body[24..28], &300i32.to_le_bytes());
        assert_eq!(body[28], 0xC3);

        assert_eq!(Message::decode(&header, body).unwrap(), message);
    }

    #[test]
    fn test_call_target_name_terminator_is_stripped() {
        let mut body = Vec::new();
        put_prefix(&mut body, 7, 0x2000, 0, 1);
        body.extend_from_slice(&6i32.to_le_bytes());
        body.extend_from_slice(b"Main\0\0");

        let header = MessageHeader::new(MessageKind::FunctionCallTarget, body.len()).unwrap();
        match Message::decode(&header, &body).unwrap() {
            Message::FunctionCallTarget(target) => {
                assert_eq!(target.name, "Main");
                assert_eq!(target.address, 0x2000);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_end_session_has_no_body() {
        let bytes = Message::EndSession.to_bytes().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);

        let (header, body) = split(&bytes);
        assert_eq!(header.body_len().unwrap(), 0);
        assert_eq!(Message::decode(&header, body).unwrap(), Message::EndSession);
    }

    #[test]
    fn test_truncated_code_is_rejected() {
        let mut body = Vec::new();
        put_prefix(&mut body, 1, 2, 0, 1);
        body.extend_from_slice(&16i32.to_le_bytes());
        body.extend_from_slice(&[0x90; 4]);

        let header = MessageHeader::new(MessageKind::FunctionCode, body.len()).unwrap();
        assert!(matches!(
            Message::decode(&header, &body),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_negative_length_is_rejected() {
        let mut body = Vec::new();
        put_prefix(&mut body, 1, 2, 0, 1);
        body.extend_from_slice(&(-1i32).to_le_bytes());

        let header = MessageHeader::new(MessageKind::FunctionCallTarget, body.len()).unwrap();
        assert_eq!(
            Message::decode(&header, &body),
            Err(ProtocolError::NegativeLength(-1))
        );
    }

    #[test]
    fn test_header_validation() {
        let header = MessageHeader { kind: 2, size: 4 };
        assert_eq!(header.body_len(), Err(ProtocolError::InvalidSize(4)));

        let header = MessageHeader { kind: 99, size: 8 };
        assert_eq!(header.message_kind(), Err(ProtocolError::UnknownKind(99)));

        assert!(MessageHeader::new(MessageKind::FunctionCode, MAX_MESSAGE_SIZE).is_err());
    }
}
