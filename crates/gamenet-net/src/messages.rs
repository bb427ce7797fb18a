//! Payload encodings carried inside frames.
//!
//! Authentication traffic uses length-prefixed UTF-8 strings:
//!
//! ```text
//! LPString      = length:i32 LE | UTF-8 bytes[length]
//! AuthRequest   = LPString username | LPString password
//! RegisterReq.  = LPString username | LPString password | LPString email | LPString info
//! *Response     = success:i32 LE (1 = success) | LPString message
//! ```
//!
//! Application `Data` payloads are opaque to the transport. [`GameData`] is
//! an optional convenience envelope (`data_type:i32 | body`) used by the
//! reference client and server.

use crate::framing::MAX_MESSAGE_SIZE;

/// Errors produced while decoding payloads.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// The payload ended before a field was complete.
    #[error("payload truncated: needed {needed} more bytes, {remaining} left")]
    Truncated {
        /// Bytes the field required.
        needed: usize,
        /// Bytes that were left.
        remaining: usize,
    },

    /// A string length prefix was negative or above [`MAX_MESSAGE_SIZE`].
    #[error("invalid string length {0}")]
    InvalidStringLength(i32),

    /// String bytes were not valid UTF-8.
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Append an LPString to `buf`.
pub fn write_lp_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as i32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Sequential reader over a payload.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    /// Start reading at the beginning of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PayloadError> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(PayloadError::Truncated {
                needed: n,
                remaining,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read a little-endian `i32`.
    pub fn read_i32(&mut self) -> Result<i32, PayloadError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read an LPString.
    pub fn read_lp_string(&mut self) -> Result<String, PayloadError> {
        let len = self.read_i32()?;
        if len < 0 || len as usize > MAX_MESSAGE_SIZE {
            return Err(PayloadError::InvalidStringLength(len));
        }
        let bytes = self.take(len as usize)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// The unconsumed tail.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// Login credentials sent with `AuthRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// Account name.
    pub username: String,
    /// Password as typed by the user.
    pub password: String,
}

impl AuthRequest {
    /// Encode as `LPString username | LPString password`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.username.len() + self.password.len());
        write_lp_string(&mut buf, &self.username);
        write_lp_string(&mut buf, &self.password);
        buf
    }

    /// Decode from an `AuthRequest` payload.
    pub fn decode(payload: &[u8]) -> Result<Self, PayloadError> {
        let mut reader = PayloadReader::new(payload);
        Ok(Self {
            username: reader.read_lp_string()?,
            password: reader.read_lp_string()?,
        })
    }
}

/// Account details sent with `RegisterRequest`. Optional fields travel as
/// empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterRequest {
    /// Desired account name.
    pub username: String,
    /// Desired password.
    pub password: String,
    /// Contact email, may be empty.
    pub email: String,
    /// Free-form profile text, may be empty.
    pub info: String,
}

impl RegisterRequest {
    /// Encode as four LPStrings.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_lp_string(&mut buf, &self.username);
        write_lp_string(&mut buf, &self.password);
        write_lp_string(&mut buf, &self.email);
        write_lp_string(&mut buf, &self.info);
        buf
    }

    /// Decode from a `RegisterRequest` payload.
    pub fn decode(payload: &[u8]) -> Result<Self, PayloadError> {
        let mut reader = PayloadReader::new(payload);
        Ok(Self {
            username: reader.read_lp_string()?,
            password: reader.read_lp_string()?,
            email: reader.read_lp_string()?,
            info: reader.read_lp_string()?,
        })
    }
}

/// Body of `AuthResponse` and `RegisterResponse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthReply {
    /// Whether the request was accepted.
    pub success: bool,
    /// Human-readable verdict from the auth service.
    pub message: String,
}

impl AuthReply {
    /// Encode as `success:i32 | LPString message`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.message.len());
        buf.extend_from_slice(&i32::from(self.success).to_le_bytes());
        write_lp_string(&mut buf, &self.message);
        buf
    }

    /// Decode a response payload. Only a success flag of exactly 1 counts as success.
    pub fn decode(payload: &[u8]) -> Result<Self, PayloadError> {
        let mut reader = PayloadReader::new(payload);
        let success = reader.read_i32()? == 1;
        let message = reader.read_lp_string()?;
        Ok(Self { success, message })
    }
}

/// Application data categories understood by the reference client and server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// Payload shorter than the 4-byte tag, or an unknown tag.
    Invalid,
    /// UTF-8 chat text.
    Chat,
    /// A game action issued by a player.
    GameAction,
    /// The server finished sending initial world state.
    LoadComplete,
    /// A serialized game object.
    GameObject,
}

impl DataType {
    fn from_wire(tag: i32) -> Self {
        match tag {
            0 => DataType::Chat,
            10 => DataType::GameAction,
            11 => DataType::LoadComplete,
            31 => DataType::GameObject,
            _ => DataType::Invalid,
        }
    }

    fn to_wire(self) -> i32 {
        match self {
            DataType::Invalid => -1,
            DataType::Chat => 0,
            DataType::GameAction => 10,
            DataType::LoadComplete => 11,
            DataType::GameObject => 31,
        }
    }
}

/// Typed view of a `Data` payload: `data_type:i32 | body`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameData {
    /// Category tag.
    pub data_type: DataType,
    /// Everything after the tag.
    pub body: Vec<u8>,
}

impl GameData {
    /// A chat line.
    pub fn chat(text: &str) -> Self {
        Self {
            data_type: DataType::Chat,
            body: text.as_bytes().to_vec(),
        }
    }

    /// Encode tag and body.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.body.len());
        buf.extend_from_slice(&self.data_type.to_wire().to_le_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Decode a payload. Never fails: short payloads map to [`DataType::Invalid`].
    pub fn decode(payload: &[u8]) -> Self {
        let mut reader = PayloadReader::new(payload);
        match reader.read_i32() {
            Ok(tag) => Self {
                data_type: DataType::from_wire(tag),
                body: reader.rest().to_vec(),
            },
            Err(_) => Self {
                data_type: DataType::Invalid,
                body: Vec::new(),
            },
        }
    }

    /// The body as text, for chat messages.
    pub fn text(&self) -> Option<String> {
        match self.data_type {
            DataType::Chat => Some(String::from_utf8_lossy(&self.body).into_owned()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lp_string_layout() {
        let mut buf = Vec::new();
        write_lp_string(&mut buf, "hé");
        assert_eq!(buf, [3, 0, 0, 0, b'h', 0xC3, 0xA9]);

        let mut reader = PayloadReader::new(&buf);
        assert_eq!(reader.read_lp_string().unwrap(), "hé");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_negative_string_length_rejected() {
        let buf = (-1i32).to_le_bytes();
        let mut reader = PayloadReader::new(&buf);
        assert!(matches!(
            reader.read_lp_string(),
            Err(PayloadError::InvalidStringLength(-1))
        ));
    }

    #[test]
    fn test_oversized_string_length_rejected() {
        let buf = ((MAX_MESSAGE_SIZE as i32) + 1).to_le_bytes();
        let mut reader = PayloadReader::new(&buf);
        assert!(matches!(
            reader.read_lp_string(),
            Err(PayloadError::InvalidStringLength(_))
        ));
    }

    #[test]
    fn test_truncated_string_rejected() {
        let mut buf = Vec::new();
        write_lp_string(&mut buf, "alice");
        buf.truncate(6);
        assert!(matches!(
            AuthRequest::decode(&buf),
            Err(PayloadError::Truncated { .. })
        ));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut buf = 2i32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0xFF, 0xFE]);
        let mut reader = PayloadReader::new(&buf);
        assert!(matches!(
            reader.read_lp_string(),
            Err(PayloadError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn test_auth_request_decodes_fields_in_order() {
        let request = AuthRequest {
            username: "alice".to_string(),
            password: "correct".to_string(),
        };
        let decoded = AuthRequest::decode(&request.encode()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_register_request_with_empty_optional_fields() {
        let request = RegisterRequest {
            username: "bob".to_string(),
            password: "hunter22".to_string(),
            ..Default::default()
        };
        let payload = request.encode();
        // Four length prefixes plus the two non-empty strings.
        assert_eq!(payload.len(), 16 + 3 + 8);
        assert_eq!(RegisterRequest::decode(&payload).unwrap(), request);
    }

    #[test]
    fn test_auth_reply_success_flag() {
        let ok = AuthReply {
            success: true,
            message: "OK".to_string(),
        };
        let payload = ok.encode();
        assert_eq!(&payload[0..4], &1i32.to_le_bytes());
        assert_eq!(AuthReply::decode(&payload).unwrap(), ok);

        let mut odd = payload.clone();
        odd[0] = 2;
        assert!(!AuthReply::decode(&odd).unwrap().success);
    }

    #[test]
    fn test_game_data_chat() {
        let data = GameData::chat("Hooo!");
        let payload = data.encode();
        assert_eq!(&payload[0..4], &0i32.to_le_bytes());

        let decoded = GameData::decode(&payload);
        assert_eq!(decoded.data_type, DataType::Chat);
        assert_eq!(decoded.text().as_deref(), Some("Hooo!"));
    }

    #[test]
    fn test_game_data_short_or_unknown_is_invalid() {
        assert_eq!(GameData::decode(&[1, 2]).data_type, DataType::Invalid);
        assert_eq!(
            GameData::decode(&99i32.to_le_bytes()).data_type,
            DataType::Invalid
        );
        let action = GameData::decode(&10i32.to_le_bytes());
        assert_eq!(action.data_type, DataType::GameAction);
        assert!(action.text().is_none());
    }
}
