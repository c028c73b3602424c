//! Message model for the undertow wire protocol.
//!
//! Every message travels inside a [`frame::Frame`] envelope. The payload layouts
//! live in [`wire`]; this module only defines the typed values on both sides of
//! the codec.

use std::borrow::Borrow;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod frame;
pub mod wire;

pub use frame::{
    DEFAULT_MAX_MESSAGE_BYTES, FLAG_MORE, Frame, FrameReader, MAX_FRAME_PAYLOAD, decode_single_frame,
    encode_frames,
};
pub use wire::{
    WireError, decode_client_bytes, decode_client_message, decode_server_bytes,
    decode_server_message, encode_client_message, encode_server_message,
};

/// Wall-clock milliseconds since the Unix epoch, as carried in hellos and pings.
pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

pub const PROTOCOL_MAJOR: u8 = 1;
pub const PROTOCOL_MINOR: u8 = 0;

/// ServerHello flag: the resume session id sent in Hello was honored.
pub const HELLO_FLAG_RESUMED: u16 = 0x0001;
/// ServerHello flag: a FullResync control frame follows immediately.
pub const HELLO_FLAG_FULL_STATE_FOLLOWS: u16 = 0x0002;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Handshake = 0,
    Event = 1,
    Patches = 2,
    Control = 3,
    Ack = 4,
    Error = 5,
}

impl FrameType {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameType::Handshake),
            1 => Some(FrameType::Event),
            2 => Some(FrameType::Patches),
            3 => Some(FrameType::Control),
            4 => Some(FrameType::Ack),
            5 => Some(FrameType::Error),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FrameType::Handshake => "handshake",
            FrameType::Event => "event",
            FrameType::Patches => "patches",
            FrameType::Control => "control",
            FrameType::Ack => "ack",
            FrameType::Error => "error",
        }
    }
}

/// Opaque server-issued identifier naming one addressable node (hydration id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeRef(pub String);

impl NodeRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for NodeRef {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Viewport {
    pub width: u16,
    pub height: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub protocol_major: u8,
    pub protocol_minor: u8,
    pub anti_forgery_token: String,
    /// Empty on the wire when the client has no session to resume.
    pub resume_session_id: Option<String>,
    pub last_seq: u32,
    pub viewport: Viewport,
    pub tz_offset_minutes: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    VersionMismatch,
    BadAntiForgeryToken,
    SessionExpired,
    ServerBusy,
    UpgradeRequired,
    MalformedRequest,
    Unauthorized,
    InternalError,
    Unknown(u8),
}

impl RejectReason {
    pub fn code(self) -> u8 {
        match self {
            RejectReason::VersionMismatch => 1,
            RejectReason::BadAntiForgeryToken => 2,
            RejectReason::SessionExpired => 3,
            RejectReason::ServerBusy => 4,
            RejectReason::UpgradeRequired => 5,
            RejectReason::MalformedRequest => 6,
            RejectReason::Unauthorized => 7,
            RejectReason::InternalError => 8,
            RejectReason::Unknown(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => RejectReason::VersionMismatch,
            2 => RejectReason::BadAntiForgeryToken,
            3 => RejectReason::SessionExpired,
            4 => RejectReason::ServerBusy,
            5 => RejectReason::UpgradeRequired,
            6 => RejectReason::MalformedRequest,
            7 => RejectReason::Unauthorized,
            8 => RejectReason::InternalError,
            other => RejectReason::Unknown(other),
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            RejectReason::VersionMismatch => "the server speaks an incompatible protocol version",
            RejectReason::BadAntiForgeryToken => "the anti-forgery token was rejected",
            RejectReason::SessionExpired => "the session expired; reload to start a new one",
            RejectReason::ServerBusy => "the server is at capacity; try again later",
            RejectReason::UpgradeRequired => "this client is too old; reload to upgrade",
            RejectReason::MalformedRequest => "the handshake request was malformed",
            RejectReason::Unauthorized => "not authorized to open this session",
            RejectReason::InternalError => "the server failed while opening the session",
            RejectReason::Unknown(_) => "the server rejected the connection",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Accepted,
    Rejected(RejectReason),
}

impl HandshakeStatus {
    pub fn code(self) -> u8 {
        match self {
            HandshakeStatus::Accepted => 0,
            HandshakeStatus::Rejected(reason) => reason.code(),
        }
    }

    pub fn from_code(code: u8) -> Self {
        if code == 0 {
            HandshakeStatus::Accepted
        } else {
            HandshakeStatus::Rejected(RejectReason::from_code(code))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub status: HandshakeStatus,
    pub session_id: String,
    pub next_seq: u32,
    pub server_time_ms: u64,
    pub flags: u16,
}

impl ServerHello {
    pub fn rejected(reason: RejectReason, server_time_ms: u64) -> Self {
        Self {
            status: HandshakeStatus::Rejected(reason),
            session_id: String::new(),
            next_seq: 0,
            server_time_ms,
            flags: 0,
        }
    }

    pub fn resumed(&self) -> bool {
        self.flags & HELLO_FLAG_RESUMED != 0
    }

    pub fn full_state_follows(&self) -> bool {
        self.flags & HELLO_FLAG_FULL_STATE_FOLLOWS != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub last_seq: u64,
    pub window: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Ping { timestamp_ms: u64 },
    Pong { timestamp_ms: u64 },
    Goodbye { reason: String },
    ResyncRequest { last_seq: u64 },
    /// Complete serialization of the UI tree; replaces the local root.
    FullResync { tree: String },
    Unknown { subtype: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    pub code: u16,
    pub message: String,
    pub fatal: bool,
}

/// Closed set of values a hook can receive from the server or report back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    List(Vec<HookValue>),
    Map(Vec<(String, HookValue)>),
    Unknown(u8),
}

/// Recursive description of newly inserted structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Subtree {
    Element {
        tag: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<NodeRef>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attrs: Vec<(String, String)>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        children: Vec<Subtree>,
    },
    Text {
        content: String,
    },
    Fragment {
        children: Vec<Subtree>,
    },
    #[serde(skip)]
    Unknown { kind: u8 },
}

impl Subtree {
    pub fn element(tag: impl Into<String>) -> Self {
        Subtree::Element {
            tag: tag.into(),
            id: None,
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Subtree::Text {
            content: content.into(),
        }
    }

    pub fn fragment(children: Vec<Subtree>) -> Self {
        Subtree::Fragment { children }
    }

    /// Builder helpers; no-ops on non-element variants.
    pub fn with_id(mut self, value: impl Into<NodeRef>) -> Self {
        if let Subtree::Element { id, .. } = &mut self {
            *id = Some(value.into());
        }
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if let Subtree::Element { attrs, .. } = &mut self {
            attrs.push((name.into(), value.into()));
        }
        self
    }

    pub fn with_child(mut self, child: Subtree) -> Self {
        match &mut self {
            Subtree::Element { children, .. } | Subtree::Fragment { children } => {
                children.push(child)
            }
            _ => {}
        }
        self
    }

    pub fn contains_unknown(&self) -> bool {
        match self {
            Subtree::Unknown { .. } => true,
            Subtree::Element { children, .. } | Subtree::Fragment { children } => {
                children.iter().any(Subtree::contains_unknown)
            }
            Subtree::Text { .. } => false,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch {
    SetText { node: NodeRef, text: String },
    SetAttribute { node: NodeRef, name: String, value: String },
    RemoveAttribute { node: NodeRef, name: String },
    AddClass { node: NodeRef, class: String },
    RemoveClass { node: NodeRef, class: String },
    SetStyle { node: NodeRef, property: String, value: String },
    RemoveStyle { node: NodeRef, property: String },
    SetValue { node: NodeRef, value: String },
    Insert { parent: NodeRef, index: u32, subtree: Subtree },
    Remove { node: NodeRef },
    Move { node: NodeRef, new_parent: NodeRef, index: u32 },
    Replace { node: NodeRef, subtree: Subtree },
    PushUrl { url: String },
    ReplaceUrl { url: String },
    SetTitle { title: String },
    Dispatch { node: NodeRef, event: String, detail: HookValue },
    Unknown { kind: u8 },
}

impl Patch {
    /// Node the patch is addressed to; `None` for reference-less variants.
    pub fn target(&self) -> Option<&NodeRef> {
        match self {
            Patch::SetText { node, .. }
            | Patch::SetAttribute { node, .. }
            | Patch::RemoveAttribute { node, .. }
            | Patch::AddClass { node, .. }
            | Patch::RemoveClass { node, .. }
            | Patch::SetStyle { node, .. }
            | Patch::RemoveStyle { node, .. }
            | Patch::SetValue { node, .. }
            | Patch::Remove { node }
            | Patch::Move { node, .. }
            | Patch::Replace { node, .. }
            | Patch::Dispatch { node, .. } => Some(node),
            Patch::Insert { parent, .. } => Some(parent),
            Patch::PushUrl { .. }
            | Patch::ReplaceUrl { .. }
            | Patch::SetTitle { .. }
            | Patch::Unknown { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Patch::SetText { .. } => "set_text",
            Patch::SetAttribute { .. } => "set_attribute",
            Patch::RemoveAttribute { .. } => "remove_attribute",
            Patch::AddClass { .. } => "add_class",
            Patch::RemoveClass { .. } => "remove_class",
            Patch::SetStyle { .. } => "set_style",
            Patch::RemoveStyle { .. } => "remove_style",
            Patch::SetValue { .. } => "set_value",
            Patch::Insert { .. } => "insert",
            Patch::Remove { .. } => "remove",
            Patch::Move { .. } => "move",
            Patch::Replace { .. } => "replace",
            Patch::PushUrl { .. } => "push_url",
            Patch::ReplaceUrl { .. } => "replace_url",
            Patch::SetTitle { .. } => "set_title",
            Patch::Dispatch { .. } => "dispatch",
            Patch::Unknown { .. } => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchBatch {
    pub seq: u64,
    pub patches: Vec<Patch>,
}

impl PatchBatch {
    pub fn new(seq: u64, patches: Vec<Patch>) -> Self {
        Self { seq, patches }
    }

    /// A batch whose decoding stopped at an unknown discriminant.
    pub fn is_truncated(&self) -> bool {
        self.patches
            .iter()
            .any(|patch| matches!(patch, Patch::Unknown { .. }))
    }
}

pub mod modifiers {
    pub const SHIFT: u8 = 0b0001;
    pub const CTRL: u8 = 0b0010;
    pub const ALT: u8 = 0b0100;
    pub const META: u8 = 0b1000;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NavigationTrigger {
    Link = 0,
    PopState = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Click { x: i32, y: i32 },
    Input { value: String },
    Change { value: String },
    Submit { fields: Vec<(String, String)> },
    KeyDown { key: String, modifiers: u8 },
    KeyUp { key: String, modifiers: u8 },
    Focus,
    Blur,
    Scroll { top: i64, left: i64 },
    Navigate { url: String, trigger: NavigationTrigger },
    Custom { name: String, detail: HookValue },
    Unknown { kind: u8 },
}

impl EventKind {
    /// Name used in `ut-on-<name>` declarations.
    pub fn name(&self) -> &str {
        match self {
            EventKind::Click { .. } => "click",
            EventKind::Input { .. } => "input",
            EventKind::Change { .. } => "change",
            EventKind::Submit { .. } => "submit",
            EventKind::KeyDown { .. } => "keydown",
            EventKind::KeyUp { .. } => "keyup",
            EventKind::Focus => "focus",
            EventKind::Blur => "blur",
            EventKind::Scroll { .. } => "scroll",
            EventKind::Navigate { .. } => "navigate",
            EventKind::Custom { name, .. } => name,
            EventKind::Unknown { .. } => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEvent {
    /// Local, client-side counter; independent of patch sequencing.
    pub seq: u64,
    pub node: NodeRef,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Hello(Hello),
    Event(ClientEvent),
    Control(Control),
    Ack(Ack),
    Unknown { frame_type: u8 },
}

impl ClientMessage {
    pub fn label(&self) -> &'static str {
        match self {
            ClientMessage::Hello(_) => "hello",
            ClientMessage::Event(_) => "event",
            ClientMessage::Control(_) => "control",
            ClientMessage::Ack(_) => "ack",
            ClientMessage::Unknown { .. } => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    ServerHello(ServerHello),
    Patches(PatchBatch),
    Control(Control),
    Error(ErrorFrame),
    Unknown { frame_type: u8 },
}

impl ServerMessage {
    pub fn label(&self) -> &'static str {
        match self {
            ServerMessage::ServerHello(_) => "server_hello",
            ServerMessage::Patches(_) => "patches",
            ServerMessage::Control(_) => "control",
            ServerMessage::Error(_) => "error",
            ServerMessage::Unknown { .. } => "unknown",
        }
    }
}
