//! Protocol messages.
//!
//! A message is a typed [`Payload`] plus a sender id and a [`Target`]. On the
//! wire it becomes an ordered list of byte frames:
//! `[type_name, sender, target, field0, field1, ...]`, each field encoded by
//! the [`Codec`] its message kind declares for it.

use crate::error::{CodecError, ProtocolError};
use crate::guid::Guid;
use crate::state::ErrorCode;
use serde_json::Value;
use std::fmt;

/// One opaque byte frame.
pub type Frame = Vec<u8>;

/// Wire value of [`Target::Broadcast`].
pub const BROADCAST: &str = "broadcast";

const COMPRESSION_LEVEL: i32 = 3;

/// Who a message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// Every participant except the sender.
    Broadcast,
    /// A single client, by id.
    Client(String),
}

impl Target {
    pub fn client(id: impl Into<String>) -> Self {
        Self::Client(id.into())
    }

    pub fn parse(s: &str) -> Self {
        if s == BROADCAST {
            Self::Broadcast
        } else {
            Self::Client(s.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Broadcast => BROADCAST,
            Self::Client(id) => id,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::Broadcast)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a field is turned into a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    /// Native text form (numbers are stringified).
    Plain,
    /// `1` or `0`.
    Bool,
    /// JSON document.
    Json,
    /// Big-endian `u32` uncompressed length followed by a zstd frame.
    Compressed,
}

/// A decoded field, before it is given its typed form.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Bool(bool),
    Json(Value),
    Blob(Vec<u8>),
}

impl FieldValue {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Bool(_) => "bool",
            Self::Json(_) => "json",
            Self::Blob(_) => "blob",
        }
    }
}

impl Codec {
    pub fn encode(self, value: &FieldValue) -> Result<Frame, CodecError> {
        match (self, value) {
            (Codec::Plain, FieldValue::Text(text)) => Ok(text.as_bytes().to_vec()),
            (Codec::Bool, FieldValue::Bool(flag)) => Ok(if *flag { b"1".to_vec() } else { b"0".to_vec() }),
            (Codec::Json, FieldValue::Json(json)) => {
                serde_json::to_vec(json).map_err(|e| CodecError::Json(e.to_string()))
            }
            (Codec::Compressed, FieldValue::Blob(bytes)) => compress(bytes),
            (codec, other) => Err(CodecError::TypeMismatch {
                expected: codec.value_name(),
                found: other.type_name(),
            }),
        }
    }

    pub fn decode(self, frame: &[u8]) -> Result<FieldValue, CodecError> {
        match self {
            Codec::Plain => std::str::from_utf8(frame)
                .map(|s| FieldValue::Text(s.to_string()))
                .map_err(|_| CodecError::InvalidUtf8),
            Codec::Bool => match frame {
                b"1" => Ok(FieldValue::Bool(true)),
                b"0" => Ok(FieldValue::Bool(false)),
                other => Err(CodecError::InvalidBool(String::from_utf8_lossy(other).into_owned())),
            },
            Codec::Json => serde_json::from_slice(frame)
                .map(FieldValue::Json)
                .map_err(|e| CodecError::Json(e.to_string())),
            Codec::Compressed => decompress(frame).map(FieldValue::Blob),
        }
    }

    fn value_name(self) -> &'static str {
        match self {
            Codec::Plain => "text",
            Codec::Bool => "bool",
            Codec::Json => "json",
            Codec::Compressed => "blob",
        }
    }
}

fn compress(bytes: &[u8]) -> Result<Frame, CodecError> {
    let declared = u32::try_from(bytes.len())
        .map_err(|_| CodecError::Compression(format!("{} bytes is too large", bytes.len())))?;
    let compressed = zstd::encode_all(bytes, COMPRESSION_LEVEL)
        .map_err(|e| CodecError::Compression(e.to_string()))?;
    let mut frame = Vec::with_capacity(4 + compressed.len());
    frame.extend_from_slice(&declared.to_be_bytes());
    frame.extend_from_slice(&compressed);
    Ok(frame)
}

fn decompress(frame: &[u8]) -> Result<Vec<u8>, CodecError> {
    if frame.len() < 4 {
        return Err(CodecError::Truncated);
    }
    let (prefix, body) = frame.split_at(4);
    let declared = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    let bytes = zstd::decode_all(body).map_err(|e| CodecError::Compression(e.to_string()))?;
    if bytes.len() != declared {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

/// A Rust type that can sit in a message field.
///
/// Each type is tied to exactly one codec.
pub trait Field: Sized {
    const CODEC: Codec;

    fn to_value(&self) -> FieldValue;

    fn from_value(value: FieldValue) -> Result<Self, CodecError>;
}

fn mismatch(expected: &'static str, found: &FieldValue) -> CodecError {
    CodecError::TypeMismatch {
        expected,
        found: found.type_name(),
    }
}

impl Field for String {
    const CODEC: Codec = Codec::Plain;

    fn to_value(&self) -> FieldValue {
        FieldValue::Text(self.clone())
    }

    fn from_value(value: FieldValue) -> Result<Self, CodecError> {
        match value {
            FieldValue::Text(text) => Ok(text),
            other => Err(mismatch("text", &other)),
        }
    }
}

impl Field for Guid {
    const CODEC: Codec = Codec::Plain;

    fn to_value(&self) -> FieldValue {
        FieldValue::Text(self.as_str().to_string())
    }

    fn from_value(value: FieldValue) -> Result<Self, CodecError> {
        String::from_value(value).map(Guid::from)
    }
}

impl Field for usize {
    const CODEC: Codec = Codec::Plain;

    fn to_value(&self) -> FieldValue {
        FieldValue::Text(self.to_string())
    }

    fn from_value(value: FieldValue) -> Result<Self, CodecError> {
        let text = String::from_value(value)?;
        text.parse().map_err(|_| CodecError::InvalidNumber(text))
    }
}

impl Field for ErrorCode {
    const CODEC: Codec = Codec::Plain;

    fn to_value(&self) -> FieldValue {
        FieldValue::Text(self.code().to_string())
    }

    fn from_value(value: FieldValue) -> Result<Self, CodecError> {
        let text = String::from_value(value)?;
        let code: i32 = text.parse().map_err(|_| CodecError::InvalidNumber(text))?;
        ErrorCode::from_code(code).ok_or(CodecError::UnknownErrorCode(code))
    }
}

impl Field for bool {
    const CODEC: Codec = Codec::Bool;

    fn to_value(&self) -> FieldValue {
        FieldValue::Bool(*self)
    }

    fn from_value(value: FieldValue) -> Result<Self, CodecError> {
        match value {
            FieldValue::Bool(flag) => Ok(flag),
            other => Err(mismatch("bool", &other)),
        }
    }
}

impl Field for Value {
    const CODEC: Codec = Codec::Json;

    fn to_value(&self) -> FieldValue {
        FieldValue::Json(self.clone())
    }

    fn from_value(value: FieldValue) -> Result<Self, CodecError> {
        match value {
            FieldValue::Json(json) => Ok(json),
            other => Err(mismatch("json", &other)),
        }
    }
}

impl Field for Vec<Guid> {
    const CODEC: Codec = Codec::Json;

    fn to_value(&self) -> FieldValue {
        FieldValue::Json(Value::Array(
            self.iter().map(|g| Value::String(g.as_str().to_string())).collect(),
        ))
    }

    fn from_value(value: FieldValue) -> Result<Self, CodecError> {
        let json = Value::from_value(value)?;
        serde_json::from_value(json).map_err(|e| CodecError::Json(e.to_string()))
    }
}

impl Field for Vec<u8> {
    const CODEC: Codec = Codec::Compressed;

    fn to_value(&self) -> FieldValue {
        FieldValue::Blob(self.clone())
    }

    fn from_value(value: FieldValue) -> Result<Self, CodecError> {
        match value {
            FieldValue::Blob(bytes) => Ok(bytes),
            other => Err(mismatch("blob", &other)),
        }
    }
}

/// Name and codec of one declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub codec: Codec,
}

macro_rules! messages {
    ($(
        $(#[$meta:meta])*
        $kind:ident { $($field:ident : $ty:ty),* $(,)? }
    )*) => {
        /// Tag of every message type the protocol defines.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum MessageKind {
            $($(#[$meta])* $kind,)*
        }

        impl MessageKind {
            pub const ALL: &'static [MessageKind] = &[$(MessageKind::$kind,)*];

            /// Wire name, sent as the first frame.
            pub fn name(self) -> &'static str {
                match self {
                    $(MessageKind::$kind => stringify!($kind),)*
                }
            }

            /// Declared fields, in wire order.
            pub fn fields(self) -> &'static [FieldSpec] {
                match self {
                    $(MessageKind::$kind => {
                        const FIELDS: &[FieldSpec] = &[
                            $(FieldSpec { name: stringify!($field), codec: <$ty as Field>::CODEC },)*
                        ];
                        FIELDS
                    })*
                }
            }
        }

        /// Typed message contents.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Payload {
            $($(#[$meta])* $kind { $($field: $ty,)* },)*
        }

        impl Payload {
            pub fn kind(&self) -> MessageKind {
                match self {
                    $(Payload::$kind { .. } => MessageKind::$kind,)*
                }
            }

            /// Field values in declaration order.
            pub fn to_fields(&self) -> Vec<FieldValue> {
                match self {
                    $(Payload::$kind { $($field,)* } => vec![$(Field::to_value($field),)*],)*
                }
            }

            /// Rebuild a payload from positional field values.
            pub fn from_fields(kind: MessageKind, values: Vec<FieldValue>) -> Result<Self, ProtocolError> {
                let expected = kind.fields().len();
                if values.len() != expected {
                    return Err(ProtocolError::malformed(
                        kind.name(),
                        format!("expected {expected} fields, got {}", values.len()),
                    ));
                }
                #[allow(unused_mut, unused_variables)]
                let mut values = values.into_iter();
                let malformed = |e: CodecError| ProtocolError::malformed(kind.name(), e.to_string());
                #[allow(unused_variables)]
                let missing = || ProtocolError::malformed(kind.name(), "missing field");
                match kind {
                    $(MessageKind::$kind => Ok(Payload::$kind {
                        $($field: <$ty as Field>::from_value(values.next().ok_or_else(missing)?)
                            .map_err(malformed)?,)*
                    }),)*
                }
            }
        }
    };
}

messages! {
    /// First message of every client: versions and the participant profile.
    Connect { protocol_version: String, application_version: String, client_data: Value }
    /// Server's answer to `Connect`; `ErrorCode::None` admits the client.
    ConnectResponse { result: ErrorCode, response_text: String }
    /// Orderly goodbye, in either direction.
    Disconnect {}
    /// Server notice that a client left.
    Disconnected { disconnected: String }
    Ping {}
    Pong {}
    /// Number of participants besides the host.
    NumberOfPeers { content: usize }
    /// Free-form text shown to users.
    Notification { message: String }
    /// Opens a batch of project pushes.
    ProjectPushBegin { guids: Vec<Guid> }
    /// One full project snapshot.
    ProjectPush { guid: Guid, name: String, filename: String, content: Vec<u8> }
    /// Closes a batch of project pushes.
    ProjectPushEnd {}
    /// A project left the session.
    ProjectClose { guid: Guid }
    /// Viewer state that the project snapshot does not capture.
    ProjectViewerState { guid: Guid, state: Value }
    SetActiveVersion { entity: Guid, version: String }
    SetEnabled { entity: Guid, enabled: bool }
    SetRange { entity: Guid, range: Value }
    SetEffectParameter { entity: Guid, parameter: String, value: Value }
    /// Structural edit: the full serialized affected entity.
    ApplyEdit { entity: Guid, content: Vec<u8> }
    BinItemAdded { bin: Guid, index: usize, item: Vec<u8> }
    BinItemRemoved { item: Guid }
    BinItemRenamed { item: Guid, name: String }
    BinItemMoved { item: Guid, bin: Guid, index: usize }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A message as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub sender: String,
    pub target: Target,
    pub payload: Payload,
}

impl Message {
    pub fn new(sender: impl Into<String>, target: Target, payload: Payload) -> Self {
        Self {
            sender: sender.into(),
            target,
            payload,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Look up a field by its declared name.
    pub fn field(&self, name: &str) -> Option<FieldValue> {
        let index = self.kind().fields().iter().position(|f| f.name == name)?;
        self.payload.to_fields().into_iter().nth(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bool_codec_uses_digits() {
        assert_eq!(Codec::Bool.encode(&FieldValue::Bool(true)).unwrap(), b"1");
        assert_eq!(Codec::Bool.encode(&FieldValue::Bool(false)).unwrap(), b"0");
        assert_eq!(Codec::Bool.decode(b"1").unwrap(), FieldValue::Bool(true));
        assert!(matches!(Codec::Bool.decode(b"yes"), Err(CodecError::InvalidBool(_))));
    }

    #[test]
    fn compressed_codec_prefixes_length() {
        let blob = vec![7u8; 4096];
        let frame = Codec::Compressed.encode(&FieldValue::Blob(blob.clone())).unwrap();
        assert_eq!(&frame[..4], &4096u32.to_be_bytes());
        assert!(frame.len() < blob.len());
        assert_eq!(Codec::Compressed.decode(&frame).unwrap(), FieldValue::Blob(blob));
    }

    #[test]
    fn compressed_codec_rejects_wrong_length() {
        let mut frame = Codec::Compressed.encode(&FieldValue::Blob(b"abc".to_vec())).unwrap();
        frame[3] = 9;
        assert_eq!(
            Codec::Compressed.decode(&frame),
            Err(CodecError::LengthMismatch { declared: 9, actual: 3 })
        );
        assert_eq!(Codec::Compressed.decode(&[0, 1]), Err(CodecError::Truncated));
    }

    #[test]
    fn codec_refuses_wrong_value_type() {
        let err = Codec::Json.encode(&FieldValue::Text("x".into())).unwrap_err();
        assert_eq!(err, CodecError::TypeMismatch { expected: "json", found: "text" });
    }

    #[test]
    fn numbers_are_plain_text() {
        let payload = Payload::NumberOfPeers { content: 3 };
        assert_eq!(payload.to_fields(), vec![FieldValue::Text("3".into())]);
        let err = Payload::from_fields(
            MessageKind::NumberOfPeers,
            vec![FieldValue::Text("three".into())],
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedMessage { .. }));
    }

    #[test]
    fn fields_follow_declaration_order() {
        let names: Vec<_> = MessageKind::ProjectPush.fields().iter().map(|f| f.name).collect();
        assert_eq!(names, ["guid", "name", "filename", "content"]);
        assert_eq!(MessageKind::ProjectPush.fields()[3].codec, Codec::Compressed);
        assert!(MessageKind::Ping.fields().is_empty());
    }

    #[test]
    fn field_lookup_by_name() {
        let message = Message::new(
            "a",
            Target::Broadcast,
            Payload::SetEffectParameter {
                entity: Guid::from("fx"),
                parameter: "gain".into(),
                value: json!(0.5),
            },
        );
        assert_eq!(message.field("entity"), Some(FieldValue::Text("fx".into())));
        assert_eq!(message.field("value"), Some(FieldValue::Json(json!(0.5))));
        assert_eq!(message.field("missing"), None);
    }

    #[test]
    fn target_parses_broadcast_sentinel() {
        assert_eq!(Target::parse("broadcast"), Target::Broadcast);
        assert_eq!(Target::parse("c-1"), Target::client("c-1"));
        assert_eq!(Target::client("c-1").as_str(), "c-1");
    }
}
