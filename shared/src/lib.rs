//! Wire protocol shared between the hexmap server and its clients.
//!
//! Every envelope travels as one JSON object per line. The object always
//! carries a `key` field identifying the message type, followed by the
//! type-specific fields. Keys are stable 64-bit integers and must never
//! change once released, otherwise older peers will fail to decode.
//!
//! Decoding goes through a [`Registry`], which maps keys to the
//! [`MessageKind`]s this peer understands. The [`codec`] module frames
//! envelopes on a byte stream.

pub mod codec;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

pub use codec::{CodecError, EnvelopeCodec};

/// Version string exchanged in the handshake. Peers must match exactly.
pub const PROTOCOL_VERSION: &str = "HEXMAP 0.4";
pub const DEFAULT_PORT: u16 = 7777;
/// Longest accepted envelope line, newline excluded.
pub const MAX_LINE_LENGTH: usize = 8192;

/// Field name of the type discriminator present in every envelope.
pub const KEY_FIELD: &str = "key";

/// An RGBA color, packed on the wire as a single ARGB integer
/// (alpha in the high byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }
}

impl From<Color> for i32 {
    fn from(color: Color) -> Self {
        let packed = (u32::from(color.a) << 24)
            | (u32::from(color.r) << 16)
            | (u32::from(color.g) << 8)
            | u32::from(color.b);
        packed as i32
    }
}

impl From<i32> for Color {
    fn from(packed: i32) -> Self {
        let packed = packed as u32;
        Self {
            a: (packed >> 24) as u8,
            r: (packed >> 16) as u8,
            g: (packed >> 8) as u8,
            b: packed as u8,
        }
    }
}

/// One unit placed on the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub name: String,
    pub x: i32,
    pub y: i32,
    pub uid: i32,
    pub color: Color,
}

impl Unit {
    pub fn new(uid: i32, name: impl Into<String>, x: i32, y: i32, color: Color) -> Self {
        Self {
            name: name.into(),
            x,
            y,
            uid,
            color,
        }
    }
}

/// Discriminator for every message type in the protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Chat,
    Close,
    Command,
    Handshake,
    Init,
    MoveUnit,
    NewUnit,
    Ping,
    Validation,
}

impl MessageKind {
    pub const ALL: [MessageKind; 9] = [
        MessageKind::Chat,
        MessageKind::Close,
        MessageKind::Command,
        MessageKind::Handshake,
        MessageKind::Init,
        MessageKind::MoveUnit,
        MessageKind::NewUnit,
        MessageKind::Ping,
        MessageKind::Validation,
    ];

    /// The stable wire key for this kind.
    pub fn key(self) -> i64 {
        match self {
            MessageKind::Chat => 147350107808482294,
            MessageKind::Close => -1449713013647322515,
            MessageKind::Command => 1925172692968220602,
            MessageKind::Handshake => 8682067740878305603,
            MessageKind::Init => 8433404537519147519,
            MessageKind::MoveUnit => -7316619218970310328,
            MessageKind::NewUnit => 5062758621873907775,
            MessageKind::Ping => -4105997739745042111,
            MessageKind::Validation => 3239519580113436622,
        }
    }

    /// Variant name used by the serde representation of [`Message`].
    fn variant(self) -> &'static str {
        match self {
            MessageKind::Chat => "Chat",
            MessageKind::Close => "Close",
            MessageKind::Command => "Command",
            MessageKind::Handshake => "Handshake",
            MessageKind::Init => "Init",
            MessageKind::MoveUnit => "MoveUnit",
            MessageKind::NewUnit => "NewUnit",
            MessageKind::Ping => "Ping",
            MessageKind::Validation => "Validation",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.variant())
    }
}

/// A decoded envelope.
///
/// Messages are immutable values: the server builds a fresh message for
/// every reply or broadcast rather than editing the one it received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Chat text. From a client this is the raw line; from the server it is
    /// already prefixed with the speaker's name.
    Chat { text: String },
    /// Either side announcing it is about to drop the connection.
    Close {
        #[serde(default)]
        reason: String,
    },
    /// A text command typed by a client, split into name and remainder.
    Command {
        name: String,
        command: Option<String>,
    },
    Handshake { version: String },
    /// Board dimensions sent to a client right after login.
    Init { x: i32, y: i32 },
    #[serde(rename_all = "camelCase")]
    MoveUnit {
        uid: i32,
        to_x: i32,
        to_y: i32,
        from_x: i32,
        from_y: i32,
    },
    NewUnit { unit: Unit },
    #[serde(rename_all = "camelCase")]
    Ping { from_client: bool },
    /// Login request.
    Validation {
        name: String,
        password: Option<String>,
    },
}

impl Message {
    pub fn chat(text: impl Into<String>) -> Self {
        Message::Chat { text: text.into() }
    }

    pub fn close(reason: impl Into<String>) -> Self {
        Message::Close {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Chat { .. } => MessageKind::Chat,
            Message::Close { .. } => MessageKind::Close,
            Message::Command { .. } => MessageKind::Command,
            Message::Handshake { .. } => MessageKind::Handshake,
            Message::Init { .. } => MessageKind::Init,
            Message::MoveUnit { .. } => MessageKind::MoveUnit,
            Message::NewUnit { .. } => MessageKind::NewUnit,
            Message::Ping { .. } => MessageKind::Ping,
            Message::Validation { .. } => MessageKind::Validation,
        }
    }

    pub fn key(&self) -> i64 {
        self.kind().key()
    }

    /// Builds the JSON object for this envelope, `key` included.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        // serde's externally tagged form is {"Variant": {fields}}; keep the
        // inner object and tag it with the wire key instead.
        let mut fields = match serde_json::to_value(self)? {
            Value::Object(outer) => match outer.into_iter().next() {
                Some((_, Value::Object(inner))) => inner,
                _ => Map::new(),
            },
            _ => Map::new(),
        };
        fields.insert(KEY_FIELD.to_string(), Value::from(self.key()));
        Ok(Value::Object(fields))
    }

    /// Serializes this envelope to a single line of JSON, without the
    /// trailing newline.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_json()?)
    }

    /// Client-side half of the double dispatch. Returns a message the
    /// client should send back, if any.
    pub fn apply_to_client<C: ClientHandler + ?Sized>(&self, client: &mut C) -> Option<Message> {
        match self {
            Message::Chat { text } => client.chat(text),
            Message::Close { reason } => client.disconnected(reason),
            Message::Handshake { version } => client.handshake(version),
            Message::Init { x, y } => client.init_board(*x, *y),
            Message::MoveUnit {
                uid,
                to_x,
                to_y,
                from_x,
                from_y,
            } => client.move_unit(*uid, (*to_x, *to_y), (*from_x, *from_y)),
            Message::NewUnit { unit } => client.add_unit(unit),
            Message::Ping { from_client: true } => client.pong(),
            // Server pings are answered with the same envelope.
            Message::Ping { from_client: false } => return Some(self.clone()),
            // Commands and logins only ever travel client to server.
            Message::Command { .. } | Message::Validation { .. } => {}
        }
        None
    }
}

/// Hooks a client implements to receive server messages.
pub trait ClientHandler {
    fn chat(&mut self, text: &str);
    fn disconnected(&mut self, reason: &str);
    fn handshake(&mut self, version: &str);
    fn init_board(&mut self, width: i32, height: i32);
    fn add_unit(&mut self, unit: &Unit);
    fn move_unit(&mut self, uid: i32, to: (i32, i32), from: (i32, i32));
    /// Called when the server echoes a client-originated ping.
    fn pong(&mut self) {}
}

/// Reasons a line cannot be turned into a [`Message`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("envelope has no \"key\" field")]
    MissingKey,
    #[error("envelope key is not an integer: {0}")]
    InvalidKey(Value),
    #[error("no message registered for key {0}")]
    UnknownKey(i64),
    #[error("bad fields for {kind} message: {source}")]
    Fields {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Maps wire keys to the message kinds this peer is willing to decode.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    kinds: HashMap<i64, MessageKind>,
}

impl Registry {
    /// Creates a registry with nothing registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every message kind in the protocol.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for kind in MessageKind::ALL {
            registry.register(kind);
        }
        registry
    }

    /// Registers a kind under its key. Returns false if the key is taken.
    pub fn register(&mut self, kind: MessageKind) -> bool {
        if self.kinds.contains_key(&kind.key()) {
            log::warn!("Duplicate message registration for key {}", kind.key());
            return false;
        }
        self.kinds.insert(kind.key(), kind);
        true
    }

    pub fn is_registered(&self, key: i64) -> bool {
        self.kinds.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Decodes one envelope line.
    pub fn decode(&self, line: &str) -> Result<Message, DecodeError> {
        let mut fields = match serde_json::from_str(line).map_err(DecodeError::Malformed)? {
            Value::Object(fields) => fields,
            _ => return Err(DecodeError::NotAnObject),
        };

        let key = match fields.remove(KEY_FIELD) {
            Some(Value::Number(n)) => n.as_i64().ok_or(DecodeError::InvalidKey(Value::Number(n)))?,
            Some(Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| DecodeError::InvalidKey(Value::String(s)))?,
            Some(other) => return Err(DecodeError::InvalidKey(other)),
            None => return Err(DecodeError::MissingKey),
        };

        let kind = *self.kinds.get(&key).ok_or(DecodeError::UnknownKey(key))?;

        let mut tagged = Map::with_capacity(1);
        tagged.insert(kind.variant().to_string(), Value::Object(fields));
        serde_json::from_value(Value::Object(tagged))
            .map_err(|source| DecodeError::Fields { kind, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::chat("hello there"),
            Message::close("Connection timed out."),
            Message::Command {
                name: "roll".to_string(),
                command: Some("3d6+2".to_string()),
            },
            Message::Command {
                name: "stop".to_string(),
                command: None,
            },
            Message::Handshake {
                version: PROTOCOL_VERSION.to_string(),
            },
            Message::Init { x: 10, y: 12 },
            Message::MoveUnit {
                uid: 4,
                to_x: 3,
                to_y: 2,
                from_x: 1,
                from_y: 1,
            },
            Message::NewUnit {
                unit: Unit::new(7, "Bob", 1, 2, Color::rgb(255, 0, 0)),
            },
            Message::Ping { from_client: true },
            Message::Validation {
                name: "alice".to_string(),
                password: None,
            },
        ]
    }

    #[test]
    fn test_every_kind_survives_encoding() {
        let registry = Registry::standard();
        for message in sample_messages() {
            let line = message.encode().unwrap();
            assert!(!line.contains('\n'));
            assert_eq!(registry.decode(&line).unwrap(), message);
        }
    }

    #[test]
    fn test_encoded_fields_match_wire_names() {
        let message = Message::MoveUnit {
            uid: 1,
            to_x: 2,
            to_y: 3,
            from_x: 4,
            from_y: 5,
        };
        let value = message.to_json().unwrap();
        assert_eq!(
            value,
            json!({
                "key": -7316619218970310328i64,
                "uid": 1, "toX": 2, "toY": 3, "fromX": 4, "fromY": 5
            })
        );

        let ping = Message::Ping { from_client: false }.to_json().unwrap();
        assert_eq!(ping["fromClient"], json!(false));
    }

    #[test]
    fn test_color_packs_as_argb() {
        let red = Color::rgb(255, 0, 0);
        assert_eq!(i32::from(red), 0xFFFF0000u32 as i32);
        assert_eq!(Color::from(i32::from(red)), red);

        let unit = Unit::new(0, "Bob", 1, 2, Color::rgb(0, 128, 255));
        let value = serde_json::to_value(&unit).unwrap();
        assert_eq!(value["color"], json!(0xFF0080FFu32 as i32));
    }

    #[test]
    fn test_string_key_is_accepted() {
        let registry = Registry::standard();
        let line = format!(r#"{{"key":"{}","text":"hi"}}"#, MessageKind::Chat.key());
        assert_eq!(registry.decode(&line).unwrap(), Message::chat("hi"));
    }

    #[test]
    fn test_decode_rejects_malformed_lines() {
        let registry = Registry::standard();

        assert!(matches!(
            registry.decode("{not json"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            registry.decode("[1, 2]"),
            Err(DecodeError::NotAnObject)
        ));
        assert!(matches!(
            registry.decode(r#"{"text":"hi"}"#),
            Err(DecodeError::MissingKey)
        ));
        assert!(matches!(
            registry.decode(r#"{"key":true}"#),
            Err(DecodeError::InvalidKey(_))
        ));
        assert!(matches!(
            registry.decode(r#"{"key":12345}"#),
            Err(DecodeError::UnknownKey(12345))
        ));

        let missing_field = format!(r#"{{"key":{}}}"#, MessageKind::Init.key());
        assert!(matches!(
            registry.decode(&missing_field),
            Err(DecodeError::Fields {
                kind: MessageKind::Init,
                ..
            })
        ));
    }

    #[test]
    fn test_decode_needs_registration() {
        let mut registry = Registry::new();
        let line = Message::chat("hi").encode().unwrap();
        assert!(matches!(
            registry.decode(&line),
            Err(DecodeError::UnknownKey(_))
        ));

        assert!(registry.register(MessageKind::Chat));
        assert!(!registry.register(MessageKind::Chat));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.decode(&line).unwrap(), Message::chat("hi"));
    }

    #[test]
    fn test_keys_are_unique() {
        let registry = Registry::standard();
        assert_eq!(registry.len(), MessageKind::ALL.len());
    }

    #[test]
    fn test_negative_uid_decodes() {
        let registry = Registry::standard();
        let line = format!(
            r#"{{"key":{},"uid":-1,"toX":1,"toY":1,"fromX":0,"fromY":0}}"#,
            MessageKind::MoveUnit.key()
        );
        assert_eq!(
            registry.decode(&line).unwrap(),
            Message::MoveUnit {
                uid: -1,
                to_x: 1,
                to_y: 1,
                from_x: 0,
                from_y: 0,
            }
        );
    }

    #[test]
    fn test_optional_fields_default_when_absent() {
        let registry = Registry::standard();
        let line = format!(r#"{{"key":{},"name":"bob"}}"#, MessageKind::Validation.key());
        assert_eq!(
            registry.decode(&line).unwrap(),
            Message::Validation {
                name: "bob".to_string(),
                password: None
            }
        );

        let line = format!(r#"{{"key":{}}}"#, MessageKind::Close.key());
        assert_eq!(registry.decode(&line).unwrap(), Message::close(""));
    }

    #[derive(Default)]
    struct RecordingClient {
        events: Vec<String>,
    }

    impl ClientHandler for RecordingClient {
        fn chat(&mut self, text: &str) {
            self.events.push(format!("chat {}", text));
        }
        fn disconnected(&mut self, reason: &str) {
            self.events.push(format!("closed {}", reason));
        }
        fn handshake(&mut self, version: &str) {
            self.events.push(format!("handshake {}", version));
        }
        fn init_board(&mut self, width: i32, height: i32) {
            self.events.push(format!("init {}x{}", width, height));
        }
        fn add_unit(&mut self, unit: &Unit) {
            self.events.push(format!("unit {}", unit.name));
        }
        fn move_unit(&mut self, uid: i32, to: (i32, i32), from: (i32, i32)) {
            self.events
                .push(format!("move {} {:?} -> {:?}", uid, from, to));
        }
    }

    #[test]
    fn test_apply_to_client() {
        let mut client = RecordingClient::default();

        assert_eq!(Message::chat("a: hi").apply_to_client(&mut client), None);
        assert_eq!(Message::Init { x: 5, y: 7 }.apply_to_client(&mut client), None);
        Message::MoveUnit {
            uid: 1,
            to_x: 2,
            to_y: 2,
            from_x: 1,
            from_y: 1,
        }
        .apply_to_client(&mut client);

        let server_ping = Message::Ping { from_client: false };
        assert_eq!(
            server_ping.apply_to_client(&mut client),
            Some(server_ping.clone())
        );

        assert_eq!(
            client.events,
            vec!["chat a: hi", "init 5x7", "move 1 (1, 1) -> (2, 2)"]
        );
    }
}
