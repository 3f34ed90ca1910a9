//! Message type registry.
//!
//! The registry is built once at startup and is immutable afterwards. It is
//! passed explicitly to whatever needs to encode or decode frames, so tests can
//! build isolated registries that only know a subset of the message kinds.

use crate::error::ProtocolError;
use crate::message::{Frame, Message, MessageKind, Payload, Target};
use std::collections::HashMap;

/// Accumulates declared message kinds.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    by_name: HashMap<&'static str, MessageKind>,
}

impl RegistryBuilder {
    /// Declare a message kind; declaring the same kind twice is harmless.
    pub fn declare(mut self, kind: MessageKind) -> Self {
        self.by_name.insert(kind.name(), kind);
        self
    }

    pub fn declare_all(self, kinds: &[MessageKind]) -> Self {
        kinds.iter().fold(self, |builder, kind| builder.declare(*kind))
    }

    pub fn build(self) -> MessageRegistry {
        MessageRegistry {
            by_name: self.by_name,
        }
    }
}

/// The routing header of a frame set: the first three frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageKind,
    pub sender: String,
    pub target: Target,
}

/// Immutable name → kind table with frame encode/decode.
#[derive(Debug, Clone)]
pub struct MessageRegistry {
    by_name: HashMap<&'static str, MessageKind>,
}

impl MessageRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Registry with every kind the protocol defines.
    pub fn standard() -> Self {
        Self::builder().declare_all(MessageKind::ALL).build()
    }

    pub fn lookup(&self, name: &[u8]) -> Option<MessageKind> {
        let name = std::str::from_utf8(name).ok()?;
        self.by_name.get(name).copied()
    }

    pub fn is_declared(&self, kind: MessageKind) -> bool {
        self.by_name.contains_key(kind.name())
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Encode a message as `[name, sender, target, fields...]`.
    pub fn serialize(&self, message: &Message) -> Result<Vec<Frame>, ProtocolError> {
        let kind = message.kind();
        if !self.is_declared(kind) {
            return Err(ProtocolError::UnknownMessageType(kind.name().to_string()));
        }
        let specs = kind.fields();
        let mut frames = Vec::with_capacity(3 + specs.len());
        frames.push(kind.name().as_bytes().to_vec());
        frames.push(message.sender.as_bytes().to_vec());
        frames.push(message.target.as_str().as_bytes().to_vec());
        for (spec, value) in specs.iter().zip(message.payload.to_fields()) {
            let frame = spec
                .codec
                .encode(&value)
                .map_err(|e| ProtocolError::malformed(kind.name(), format!("{}: {e}", spec.name)))?;
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Decode only the routing header, leaving the fields untouched.
    pub fn decode_header(&self, frames: &[Frame]) -> Result<Header, ProtocolError> {
        let [name, sender, target, ..] = frames else {
            return Err(ProtocolError::malformed(
                "<unknown>",
                format!("expected at least 3 frames, got {}", frames.len()),
            ));
        };
        let kind = self
            .lookup(name)
            .ok_or_else(|| ProtocolError::UnknownMessageType(String::from_utf8_lossy(name).into_owned()))?;
        let text = |frame: &[u8], what: &str| {
            String::from_utf8(frame.to_vec())
                .map_err(|_| ProtocolError::malformed(kind.name(), format!("{what} is not utf-8")))
        };
        Ok(Header {
            kind,
            sender: text(sender.as_slice(), "sender")?,
            target: Target::parse(&text(target.as_slice(), "target")?),
        })
    }

    /// Decode a full frame set into a message.
    pub fn deserialize(&self, frames: &[Frame]) -> Result<Message, ProtocolError> {
        let header = self.decode_header(frames)?;
        let kind = header.kind;
        let specs = kind.fields();
        let encoded = &frames[3..];
        if encoded.len() != specs.len() {
            return Err(ProtocolError::malformed(
                kind.name(),
                format!("expected {} fields, got {}", specs.len(), encoded.len()),
            ));
        }
        let values = specs
            .iter()
            .zip(encoded)
            .map(|(spec, frame)| {
                spec.codec
                    .decode(frame)
                    .map_err(|e| ProtocolError::malformed(kind.name(), format!("{}: {e}", spec.name)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Message {
            sender: header.sender,
            target: header.target,
            payload: Payload::from_fields(kind, values)?,
        })
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
