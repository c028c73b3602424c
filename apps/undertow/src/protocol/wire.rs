use super::frame::{Frame, decode_single_frame, encode_frames};
use super::{
    Ack, ClientEvent, ClientMessage, Control, ErrorFrame, EventKind, FrameType, HandshakeStatus,
    Hello, HookValue, NavigationTrigger, NodeRef, Patch, PatchBatch, ServerHello, ServerMessage,
    Subtree, Viewport,
};

const CONTROL_PING: u8 = 0x01;
const CONTROL_PONG: u8 = 0x02;
const CONTROL_GOODBYE: u8 = 0x03;
const CONTROL_RESYNC_REQUEST: u8 = 0x10;
const CONTROL_FULL_RESYNC: u8 = 0x12;

const PATCH_SET_TEXT: u8 = 0x01;
const PATCH_SET_ATTRIBUTE: u8 = 0x02;
const PATCH_REMOVE_ATTRIBUTE: u8 = 0x03;
const PATCH_ADD_CLASS: u8 = 0x04;
const PATCH_REMOVE_CLASS: u8 = 0x05;
const PATCH_SET_STYLE: u8 = 0x06;
const PATCH_REMOVE_STYLE: u8 = 0x07;
const PATCH_SET_VALUE: u8 = 0x08;
const PATCH_INSERT: u8 = 0x10;
const PATCH_REMOVE: u8 = 0x11;
const PATCH_MOVE: u8 = 0x12;
const PATCH_REPLACE: u8 = 0x13;
const PATCH_PUSH_URL: u8 = 0x20;
const PATCH_REPLACE_URL: u8 = 0x21;
const PATCH_SET_TITLE: u8 = 0x22;
const PATCH_DISPATCH: u8 = 0x30;

const SUBTREE_ELEMENT: u8 = 0x00;
const SUBTREE_TEXT: u8 = 0x01;
const SUBTREE_FRAGMENT: u8 = 0x02;

const HOOK_NULL: u8 = 0;
const HOOK_BOOL: u8 = 1;
const HOOK_INT: u8 = 2;
const HOOK_TEXT: u8 = 3;
const HOOK_LIST: u8 = 4;
const HOOK_MAP: u8 = 5;

const EVENT_CLICK: u8 = 0;
const EVENT_INPUT: u8 = 1;
const EVENT_CHANGE: u8 = 2;
const EVENT_SUBMIT: u8 = 3;
const EVENT_KEY_DOWN: u8 = 4;
const EVENT_KEY_UP: u8 = 5;
const EVENT_FOCUS: u8 = 6;
const EVENT_BLUR: u8 = 7;
const EVENT_SCROLL: u8 = 8;
const EVENT_NAVIGATE: u8 = 9;
const EVENT_CUSTOM: u8 = 10;

/// Nesting limit for subtrees and hook values.
pub const MAX_NESTING_DEPTH: usize = 256;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("varint overflow")]
    VarIntOverflow,
    #[error("string is not valid utf-8")]
    InvalidUtf8,
    #[error("logical payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("frame declares {declared} payload bytes but only {available} are present")]
    LengthMismatch { declared: usize, available: usize },
    #[error("nesting deeper than {0}")]
    DepthExceeded(usize),
    #[error("invalid data: {0}")]
    InvalidData(&'static str),
}

pub fn encode_client_message(message: &ClientMessage) -> Vec<u8> {
    let (frame_type, payload) = client_payload(message);
    encode_frames(frame_type, 0, &payload)
}

pub fn encode_server_message(message: &ServerMessage) -> Vec<u8> {
    let (frame_type, payload) = server_payload(message);
    encode_frames(frame_type, 0, &payload)
}

fn client_payload(message: &ClientMessage) -> (u8, Vec<u8>) {
    let mut buf = Vec::with_capacity(32);
    let frame_type = match message {
        ClientMessage::Hello(hello) => {
            encode_hello(&mut buf, hello);
            FrameType::Handshake.as_u8()
        }
        ClientMessage::Event(event) => {
            encode_event(&mut buf, event);
            FrameType::Event.as_u8()
        }
        ClientMessage::Control(control) => {
            encode_control(&mut buf, control);
            FrameType::Control.as_u8()
        }
        ClientMessage::Ack(ack) => {
            write_var_u64(&mut buf, ack.last_seq);
            write_var_u32(&mut buf, ack.window);
            FrameType::Ack.as_u8()
        }
        ClientMessage::Unknown { frame_type } => *frame_type,
    };
    (frame_type, buf)
}

fn server_payload(message: &ServerMessage) -> (u8, Vec<u8>) {
    let mut buf = Vec::with_capacity(64);
    let frame_type = match message {
        ServerMessage::ServerHello(hello) => {
            buf.push(hello.status.code());
            write_string(&mut buf, &hello.session_id);
            buf.extend_from_slice(&hello.next_seq.to_be_bytes());
            buf.extend_from_slice(&hello.server_time_ms.to_be_bytes());
            buf.extend_from_slice(&hello.flags.to_be_bytes());
            FrameType::Handshake.as_u8()
        }
        ServerMessage::Patches(batch) => {
            write_var_u64(&mut buf, batch.seq);
            write_var_u64(&mut buf, batch.patches.len() as u64);
            for patch in &batch.patches {
                encode_patch(&mut buf, patch);
            }
            FrameType::Patches.as_u8()
        }
        ServerMessage::Control(control) => {
            encode_control(&mut buf, control);
            FrameType::Control.as_u8()
        }
        ServerMessage::Error(error) => {
            buf.extend_from_slice(&error.code.to_be_bytes());
            write_string(&mut buf, &error.message);
            buf.push(error.fatal as u8);
            FrameType::Error.as_u8()
        }
        ServerMessage::Unknown { frame_type } => *frame_type,
    };
    (frame_type, buf)
}

/// Decodes a frame received by the server.
pub fn decode_client_message(frame: &Frame) -> Result<ClientMessage, WireError> {
    let mut cursor = Cursor::new(&frame.payload);
    let message = match FrameType::from_u8(frame.frame_type) {
        Some(FrameType::Handshake) => ClientMessage::Hello(decode_hello(&mut cursor)?),
        Some(FrameType::Event) => ClientMessage::Event(decode_event(&mut cursor)?),
        Some(FrameType::Control) => ClientMessage::Control(decode_control(&mut cursor)?),
        Some(FrameType::Ack) => ClientMessage::Ack(Ack {
            last_seq: cursor.read_var_u64()?,
            window: cursor.read_var_u32()?,
        }),
        _ => ClientMessage::Unknown {
            frame_type: frame.frame_type,
        },
    };
    Ok(message)
}

/// Decodes a frame received by the renderer.
pub fn decode_server_message(frame: &Frame) -> Result<ServerMessage, WireError> {
    let mut cursor = Cursor::new(&frame.payload);
    let message = match FrameType::from_u8(frame.frame_type) {
        Some(FrameType::Handshake) => ServerMessage::ServerHello(ServerHello {
            status: HandshakeStatus::from_code(cursor.read_u8()?),
            session_id: cursor.read_string()?,
            next_seq: cursor.read_u32_be()?,
            server_time_ms: cursor.read_u64_be()?,
            flags: cursor.read_u16_be()?,
        }),
        Some(FrameType::Patches) => ServerMessage::Patches(decode_patch_batch(&mut cursor)?),
        Some(FrameType::Control) => ServerMessage::Control(decode_control(&mut cursor)?),
        Some(FrameType::Error) => ServerMessage::Error(ErrorFrame {
            code: cursor.read_u16_be()?,
            message: cursor.read_string()?,
            fatal: cursor.read_u8()? != 0,
        }),
        _ => ServerMessage::Unknown {
            frame_type: frame.frame_type,
        },
    };
    Ok(message)
}

/// Convenience for callers holding exactly one encoded message.
pub fn decode_client_bytes(bytes: &[u8]) -> Result<ClientMessage, WireError> {
    decode_client_message(&decode_single_frame(bytes)?)
}

pub fn decode_server_bytes(bytes: &[u8]) -> Result<ServerMessage, WireError> {
    decode_server_message(&decode_single_frame(bytes)?)
}

fn encode_hello(buf: &mut Vec<u8>, hello: &Hello) {
    buf.push(hello.protocol_major);
    buf.push(hello.protocol_minor);
    write_string(buf, &hello.anti_forgery_token);
    write_string(buf, hello.resume_session_id.as_deref().unwrap_or(""));
    buf.extend_from_slice(&hello.last_seq.to_be_bytes());
    buf.extend_from_slice(&hello.viewport.width.to_be_bytes());
    buf.extend_from_slice(&hello.viewport.height.to_be_bytes());
    buf.extend_from_slice(&hello.tz_offset_minutes.to_be_bytes());
}

fn decode_hello(cursor: &mut Cursor<'_>) -> Result<Hello, WireError> {
    let protocol_major = cursor.read_u8()?;
    let protocol_minor = cursor.read_u8()?;
    let anti_forgery_token = cursor.read_string()?;
    let resume = cursor.read_string()?;
    Ok(Hello {
        protocol_major,
        protocol_minor,
        anti_forgery_token,
        resume_session_id: (!resume.is_empty()).then_some(resume),
        last_seq: cursor.read_u32_be()?,
        viewport: Viewport {
            width: cursor.read_u16_be()?,
            height: cursor.read_u16_be()?,
        },
        tz_offset_minutes: cursor.read_u16_be()? as i16,
    })
}

fn encode_control(buf: &mut Vec<u8>, control: &Control) {
    match control {
        Control::Ping { timestamp_ms } => {
            buf.push(CONTROL_PING);
            buf.extend_from_slice(&timestamp_ms.to_be_bytes());
        }
        Control::Pong { timestamp_ms } => {
            buf.push(CONTROL_PONG);
            buf.extend_from_slice(&timestamp_ms.to_be_bytes());
        }
        Control::Goodbye { reason } => {
            buf.push(CONTROL_GOODBYE);
            write_string(buf, reason);
        }
        Control::ResyncRequest { last_seq } => {
            buf.push(CONTROL_RESYNC_REQUEST);
            write_var_u64(buf, *last_seq);
        }
        Control::FullResync { tree } => {
            buf.push(CONTROL_FULL_RESYNC);
            write_string(buf, tree);
        }
        Control::Unknown { subtype } => buf.push(*subtype),
    }
}

fn decode_control(cursor: &mut Cursor<'_>) -> Result<Control, WireError> {
    let control = match cursor.read_u8()? {
        CONTROL_PING => Control::Ping {
            timestamp_ms: cursor.read_u64_be()?,
        },
        CONTROL_PONG => Control::Pong {
            timestamp_ms: cursor.read_u64_be()?,
        },
        CONTROL_GOODBYE => Control::Goodbye {
            reason: cursor.read_string()?,
        },
        CONTROL_RESYNC_REQUEST => Control::ResyncRequest {
            last_seq: cursor.read_var_u64()?,
        },
        CONTROL_FULL_RESYNC => Control::FullResync {
            tree: cursor.read_string()?,
        },
        subtype => Control::Unknown { subtype },
    };
    Ok(control)
}

fn encode_patch(buf: &mut Vec<u8>, patch: &Patch) {
    match patch {
        Patch::SetText { node, text } => {
            write_patch_head(buf, PATCH_SET_TEXT, node);
            write_string(buf, text);
        }
        Patch::SetAttribute { node, name, value } => {
            write_patch_head(buf, PATCH_SET_ATTRIBUTE, node);
            write_string(buf, name);
            write_string(buf, value);
        }
        Patch::RemoveAttribute { node, name } => {
            write_patch_head(buf, PATCH_REMOVE_ATTRIBUTE, node);
            write_string(buf, name);
        }
        Patch::AddClass { node, class } => {
            write_patch_head(buf, PATCH_ADD_CLASS, node);
            write_string(buf, class);
        }
        Patch::RemoveClass { node, class } => {
            write_patch_head(buf, PATCH_REMOVE_CLASS, node);
            write_string(buf, class);
        }
        Patch::SetStyle {
            node,
            property,
            value,
        } => {
            write_patch_head(buf, PATCH_SET_STYLE, node);
            write_string(buf, property);
            write_string(buf, value);
        }
        Patch::RemoveStyle { node, property } => {
            write_patch_head(buf, PATCH_REMOVE_STYLE, node);
            write_string(buf, property);
        }
        Patch::SetValue { node, value } => {
            write_patch_head(buf, PATCH_SET_VALUE, node);
            write_string(buf, value);
        }
        Patch::Insert {
            parent,
            index,
            subtree,
        } => {
            write_patch_head(buf, PATCH_INSERT, parent);
            write_var_u32(buf, *index);
            encode_subtree(buf, subtree);
        }
        Patch::Remove { node } => write_patch_head(buf, PATCH_REMOVE, node),
        Patch::Move {
            node,
            new_parent,
            index,
        } => {
            write_patch_head(buf, PATCH_MOVE, node);
            write_string(buf, new_parent.as_str());
            write_var_u32(buf, *index);
        }
        Patch::Replace { node, subtree } => {
            write_patch_head(buf, PATCH_REPLACE, node);
            encode_subtree(buf, subtree);
        }
        Patch::PushUrl { url } => {
            buf.push(PATCH_PUSH_URL);
            write_string(buf, url);
        }
        Patch::ReplaceUrl { url } => {
            buf.push(PATCH_REPLACE_URL);
            write_string(buf, url);
        }
        Patch::SetTitle { title } => {
            buf.push(PATCH_SET_TITLE);
            write_string(buf, title);
        }
        Patch::Dispatch {
            node,
            event,
            detail,
        } => {
            write_patch_head(buf, PATCH_DISPATCH, node);
            write_string(buf, event);
            encode_hook_value(buf, detail);
        }
        Patch::Unknown { kind } => buf.push(*kind),
    }
}

fn write_patch_head(buf: &mut Vec<u8>, kind: u8, node: &NodeRef) {
    buf.push(kind);
    write_string(buf, node.as_str());
}

fn decode_patch_batch(cursor: &mut Cursor<'_>) -> Result<PatchBatch, WireError> {
    let seq = cursor.read_var_u64()?;
    let count = cursor.read_var_u64()? as usize;
    let mut patches = Vec::with_capacity(count.min(cursor.remaining()));
    for _ in 0..count {
        let patch = decode_patch(cursor)?;
        let unknown = matches!(patch, Patch::Unknown { .. });
        patches.push(patch);
        if unknown {
            // Layout of the remaining bytes is unknown; the batch ends here.
            break;
        }
    }
    Ok(PatchBatch { seq, patches })
}

fn decode_patch(cursor: &mut Cursor<'_>) -> Result<Patch, WireError> {
    let kind = cursor.read_u8()?;
    let patch = match kind {
        PATCH_PUSH_URL => Patch::PushUrl {
            url: cursor.read_string()?,
        },
        PATCH_REPLACE_URL => Patch::ReplaceUrl {
            url: cursor.read_string()?,
        },
        PATCH_SET_TITLE => Patch::SetTitle {
            title: cursor.read_string()?,
        },
        PATCH_SET_TEXT..=PATCH_SET_VALUE
        | PATCH_INSERT..=PATCH_REPLACE
        | PATCH_DISPATCH => {
            let node = NodeRef(cursor.read_string()?);
            decode_addressed_patch(cursor, kind, node)?
        }
        _ => Patch::Unknown { kind },
    };
    Ok(patch)
}

fn decode_addressed_patch(
    cursor: &mut Cursor<'_>,
    kind: u8,
    node: NodeRef,
) -> Result<Patch, WireError> {
    let patch = match kind {
        PATCH_SET_TEXT => Patch::SetText {
            node,
            text: cursor.read_string()?,
        },
        PATCH_SET_ATTRIBUTE => Patch::SetAttribute {
            node,
            name: cursor.read_string()?,
            value: cursor.read_string()?,
        },
        PATCH_REMOVE_ATTRIBUTE => Patch::RemoveAttribute {
            node,
            name: cursor.read_string()?,
        },
        PATCH_ADD_CLASS => Patch::AddClass {
            node,
            class: cursor.read_string()?,
        },
        PATCH_REMOVE_CLASS => Patch::RemoveClass {
            node,
            class: cursor.read_string()?,
        },
        PATCH_SET_STYLE => Patch::SetStyle {
            node,
            property: cursor.read_string()?,
            value: cursor.read_string()?,
        },
        PATCH_REMOVE_STYLE => Patch::RemoveStyle {
            node,
            property: cursor.read_string()?,
        },
        PATCH_SET_VALUE => Patch::SetValue {
            node,
            value: cursor.read_string()?,
        },
        PATCH_INSERT => {
            let index = cursor.read_var_u32()?;
            match decode_subtree(cursor, 0)? {
                Subtree::Unknown { .. } => Patch::Unknown { kind },
                subtree => Patch::Insert {
                    parent: node,
                    index,
                    subtree,
                },
            }
        }
        PATCH_REMOVE => Patch::Remove { node },
        PATCH_MOVE => Patch::Move {
            node,
            new_parent: NodeRef(cursor.read_string()?),
            index: cursor.read_var_u32()?,
        },
        PATCH_REPLACE => match decode_subtree(cursor, 0)? {
            Subtree::Unknown { .. } => Patch::Unknown { kind },
            subtree => Patch::Replace { node, subtree },
        },
        PATCH_DISPATCH => {
            let event = cursor.read_string()?;
            match decode_hook_value(cursor, 0)? {
                HookValue::Unknown(_) => Patch::Unknown { kind },
                detail => Patch::Dispatch {
                    node,
                    event,
                    detail,
                },
            }
        }
        _ => Patch::Unknown { kind },
    };
    Ok(patch)
}

fn encode_subtree(buf: &mut Vec<u8>, subtree: &Subtree) {
    match subtree {
        Subtree::Element {
            tag,
            id,
            attrs,
            children,
        } => {
            buf.push(SUBTREE_ELEMENT);
            write_string(buf, tag);
            match id {
                Some(id) => {
                    buf.push(1);
                    write_string(buf, id.as_str());
                }
                None => buf.push(0),
            }
            write_var_u64(buf, attrs.len() as u64);
            for (name, value) in attrs {
                write_string(buf, name);
                write_string(buf, value);
            }
            write_var_u64(buf, children.len() as u64);
            for child in children {
                encode_subtree(buf, child);
            }
        }
        Subtree::Text { content } => {
            buf.push(SUBTREE_TEXT);
            write_string(buf, content);
        }
        Subtree::Fragment { children } => {
            buf.push(SUBTREE_FRAGMENT);
            write_var_u64(buf, children.len() as u64);
            for child in children {
                encode_subtree(buf, child);
            }
        }
        Subtree::Unknown { kind } => buf.push(*kind),
    }
}

/// Returns `Subtree::Unknown` as soon as any nested discriminant is unrecognised.
fn decode_subtree(cursor: &mut Cursor<'_>, depth: usize) -> Result<Subtree, WireError> {
    if depth >= MAX_NESTING_DEPTH {
        return Err(WireError::DepthExceeded(MAX_NESTING_DEPTH));
    }
    let subtree = match cursor.read_u8()? {
        SUBTREE_ELEMENT => {
            let tag = cursor.read_string()?;
            let id = if cursor.read_bool()? {
                Some(NodeRef(cursor.read_string()?))
            } else {
                None
            };
            let attr_count = cursor.read_var_u64()? as usize;
            let mut attrs = Vec::with_capacity(attr_count.min(cursor.remaining()));
            for _ in 0..attr_count {
                attrs.push((cursor.read_string()?, cursor.read_string()?));
            }
            let children = match decode_children(cursor, depth)? {
                Ok(children) => children,
                Err(unknown) => return Ok(unknown),
            };
            Subtree::Element {
                tag,
                id,
                attrs,
                children,
            }
        }
        SUBTREE_TEXT => Subtree::Text {
            content: cursor.read_string()?,
        },
        SUBTREE_FRAGMENT => match decode_children(cursor, depth)? {
            Ok(children) => Subtree::Fragment { children },
            Err(unknown) => return Ok(unknown),
        },
        kind => Subtree::Unknown { kind },
    };
    Ok(subtree)
}

fn decode_children(
    cursor: &mut Cursor<'_>,
    depth: usize,
) -> Result<Result<Vec<Subtree>, Subtree>, WireError> {
    let count = cursor.read_var_u64()? as usize;
    let mut children = Vec::with_capacity(count.min(cursor.remaining()));
    for _ in 0..count {
        let child = decode_subtree(cursor, depth + 1)?;
        if matches!(child, Subtree::Unknown { .. }) {
            return Ok(Err(child));
        }
        children.push(child);
    }
    Ok(Ok(children))
}

fn encode_hook_value(buf: &mut Vec<u8>, value: &HookValue) {
    match value {
        HookValue::Null => buf.push(HOOK_NULL),
        HookValue::Bool(flag) => {
            buf.push(HOOK_BOOL);
            buf.push(*flag as u8);
        }
        HookValue::Int(number) => {
            buf.push(HOOK_INT);
            write_var_i64(buf, *number);
        }
        HookValue::Text(text) => {
            buf.push(HOOK_TEXT);
            write_string(buf, text);
        }
        HookValue::List(items) => {
            buf.push(HOOK_LIST);
            write_var_u64(buf, items.len() as u64);
            for item in items {
                encode_hook_value(buf, item);
            }
        }
        HookValue::Map(entries) => {
            buf.push(HOOK_MAP);
            write_var_u64(buf, entries.len() as u64);
            for (key, item) in entries {
                write_string(buf, key);
                encode_hook_value(buf, item);
            }
        }
        HookValue::Unknown(tag) => buf.push(*tag),
    }
}

fn decode_hook_value(cursor: &mut Cursor<'_>, depth: usize) -> Result<HookValue, WireError> {
    if depth >= MAX_NESTING_DEPTH {
        return Err(WireError::DepthExceeded(MAX_NESTING_DEPTH));
    }
    let value = match cursor.read_u8()? {
        HOOK_NULL => HookValue::Null,
        HOOK_BOOL => HookValue::Bool(cursor.read_u8()? != 0),
        HOOK_INT => HookValue::Int(cursor.read_var_i64()?),
        HOOK_TEXT => HookValue::Text(cursor.read_string()?),
        HOOK_LIST => {
            let count = cursor.read_var_u64()? as usize;
            let mut items = Vec::with_capacity(count.min(cursor.remaining()));
            for _ in 0..count {
                let item = decode_hook_value(cursor, depth + 1)?;
                if let HookValue::Unknown(_) = item {
                    return Ok(item);
                }
                items.push(item);
            }
            HookValue::List(items)
        }
        HOOK_MAP => {
            let count = cursor.read_var_u64()? as usize;
            let mut entries = Vec::with_capacity(count.min(cursor.remaining()));
            for _ in 0..count {
                let key = cursor.read_string()?;
                let item = decode_hook_value(cursor, depth + 1)?;
                if let HookValue::Unknown(_) = item {
                    return Ok(item);
                }
                entries.push((key, item));
            }
            HookValue::Map(entries)
        }
        tag => HookValue::Unknown(tag),
    };
    Ok(value)
}

fn encode_event(buf: &mut Vec<u8>, event: &ClientEvent) {
    write_var_u64(buf, event.seq);
    write_string(buf, event.node.as_str());
    match &event.kind {
        EventKind::Click { x, y } => {
            buf.push(EVENT_CLICK);
            write_var_i64(buf, *x as i64);
            write_var_i64(buf, *y as i64);
        }
        EventKind::Input { value } => {
            buf.push(EVENT_INPUT);
            write_string(buf, value);
        }
        EventKind::Change { value } => {
            buf.push(EVENT_CHANGE);
            write_string(buf, value);
        }
        EventKind::Submit { fields } => {
            buf.push(EVENT_SUBMIT);
            write_var_u64(buf, fields.len() as u64);
            for (name, value) in fields {
                write_string(buf, name);
                write_string(buf, value);
            }
        }
        EventKind::KeyDown { key, modifiers } => {
            buf.push(EVENT_KEY_DOWN);
            write_string(buf, key);
            buf.push(*modifiers);
        }
        EventKind::KeyUp { key, modifiers } => {
            buf.push(EVENT_KEY_UP);
            write_string(buf, key);
            buf.push(*modifiers);
        }
        EventKind::Focus => buf.push(EVENT_FOCUS),
        EventKind::Blur => buf.push(EVENT_BLUR),
        EventKind::Scroll { top, left } => {
            buf.push(EVENT_SCROLL);
            write_var_i64(buf, *top);
            write_var_i64(buf, *left);
        }
        EventKind::Navigate { url, trigger } => {
            buf.push(EVENT_NAVIGATE);
            write_string(buf, url);
            buf.push(*trigger as u8);
        }
        EventKind::Custom { name, detail } => {
            buf.push(EVENT_CUSTOM);
            write_string(buf, name);
            encode_hook_value(buf, detail);
        }
        EventKind::Unknown { kind } => buf.push(*kind),
    }
}

fn decode_event(cursor: &mut Cursor<'_>) -> Result<ClientEvent, WireError> {
    let seq = cursor.read_var_u64()?;
    let node = NodeRef(cursor.read_string()?);
    let kind = match cursor.read_u8()? {
        EVENT_CLICK => EventKind::Click {
            x: cursor.read_var_i32()?,
            y: cursor.read_var_i32()?,
        },
        EVENT_INPUT => EventKind::Input {
            value: cursor.read_string()?,
        },
        EVENT_CHANGE => EventKind::Change {
            value: cursor.read_string()?,
        },
        EVENT_SUBMIT => {
            let count = cursor.read_var_u64()? as usize;
            let mut fields = Vec::with_capacity(count.min(cursor.remaining()));
            for _ in 0..count {
                fields.push((cursor.read_string()?, cursor.read_string()?));
            }
            EventKind::Submit { fields }
        }
        EVENT_KEY_DOWN => EventKind::KeyDown {
            key: cursor.read_string()?,
            modifiers: cursor.read_u8()?,
        },
        EVENT_KEY_UP => EventKind::KeyUp {
            key: cursor.read_string()?,
            modifiers: cursor.read_u8()?,
        },
        EVENT_FOCUS => EventKind::Focus,
        EVENT_BLUR => EventKind::Blur,
        EVENT_SCROLL => EventKind::Scroll {
            top: cursor.read_var_i64()?,
            left: cursor.read_var_i64()?,
        },
        EVENT_NAVIGATE => EventKind::Navigate {
            url: cursor.read_string()?,
            trigger: match cursor.read_u8()? {
                0 => NavigationTrigger::Link,
                1 => NavigationTrigger::PopState,
                _ => return Err(WireError::InvalidData("navigation trigger")),
            },
        },
        EVENT_CUSTOM => {
            let name = cursor.read_string()?;
            match decode_hook_value(cursor, 0)? {
                HookValue::Unknown(_) => EventKind::Unknown { kind: EVENT_CUSTOM },
                detail => EventKind::Custom { name, detail },
            }
        }
        kind => EventKind::Unknown { kind },
    };
    Ok(ClientEvent { seq, node, kind })
}

fn write_var_u32(buf: &mut Vec<u8>, value: u32) {
    write_var_u64(buf, value as u64);
}

fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn write_var_i64(buf: &mut Vec<u8>, value: i64) {
    write_var_u64(buf, ((value << 1) ^ (value >> 63)) as u64);
}

fn write_string(buf: &mut Vec<u8>, value: &str) {
    write_var_u64(buf, value.len() as u64);
    buf.extend_from_slice(value.as_bytes());
}

/// Read cursor bounded to one frame payload.
#[derive(Clone, Copy)]
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        if self.pos >= self.bytes.len() {
            return Err(WireError::UnexpectedEof);
        }
        let value = self.bytes[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    fn read_u16_be(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    fn read_u32_be(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    fn read_u64_be(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    fn read_var_u64(&mut self) -> Result<u64, WireError> {
        let mut result: u64 = 0;
        let mut shift = 0;
        while shift < 64 {
            let byte = self.read_u8()?;
            // The tenth byte only has room for the top bit.
            if shift == 63 && byte & 0x7F > 1 {
                return Err(WireError::VarIntOverflow);
            }
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(WireError::VarIntOverflow)
    }

    fn read_var_u32(&mut self) -> Result<u32, WireError> {
        let value = self.read_var_u64()?;
        if value > u32::MAX as u64 {
            return Err(WireError::InvalidData("u32 overflow"));
        }
        Ok(value as u32)
    }

    fn read_var_i64(&mut self) -> Result<i64, WireError> {
        let raw = self.read_var_u64()?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    fn read_var_i32(&mut self) -> Result<i32, WireError> {
        i32::try_from(self.read_var_i64()?).map_err(|_| WireError::InvalidData("i32 overflow"))
    }

    fn read_bool(&mut self) -> Result<bool, WireError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(WireError::InvalidData("invalid boolean")),
        }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if len > self.remaining() {
            return Err(WireError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_string(&mut self) -> Result<String, WireError> {
        let len = self.read_var_u64()?;
        let len = usize::try_from(len).map_err(|_| WireError::UnexpectedEof)?;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidUtf8)
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HELLO_FLAG_FULL_STATE_FOLLOWS, RejectReason, modifiers};

    fn server_roundtrip(message: ServerMessage) {
        let encoded = encode_server_message(&message);
        let decoded = decode_server_bytes(&encoded).expect("decode");
        assert_eq!(message, decoded);
    }

    fn client_roundtrip(message: ClientMessage) {
        let encoded = encode_client_message(&message);
        let decoded = decode_client_bytes(&encoded).expect("decode");
        assert_eq!(message, decoded);
    }

    fn sample_subtree() -> Subtree {
        Subtree::element("ul")
            .with_id("list")
            .with_attr("class", "items")
            .with_child(Subtree::element("li").with_id("a").with_child(Subtree::text("one")))
            .with_child(Subtree::fragment(vec![Subtree::text("two")]))
    }

    #[test_timeout::timeout]
    fn encode_decode_hello_layout() {
        let hello = Hello {
            protocol_major: 1,
            protocol_minor: 0,
            anti_forgery_token: "tok".into(),
            resume_session_id: None,
            last_seq: 5,
            viewport: Viewport {
                width: 1280,
                height: 720,
            },
            tz_offset_minutes: -120,
        };
        let encoded = encode_client_message(&ClientMessage::Hello(hello.clone()));
        assert_eq!(
            &encoded[..4],
            &[FrameType::Handshake.as_u8(), 0, 0, 17],
            "header"
        );
        assert_eq!(&encoded[4..10], &[1, 0, 3, b't', b'o', b'k']);
        assert_eq!(&encoded[10..11], &[0], "empty resume id");
        assert_eq!(&encoded[11..15], &5u32.to_be_bytes());
        assert_eq!(&encoded[19..21], &(-120i16).to_be_bytes());
        client_roundtrip(ClientMessage::Hello(hello));
    }

    #[test_timeout::timeout]
    fn encode_decode_server_hello_and_errors() {
        server_roundtrip(ServerMessage::ServerHello(ServerHello {
            status: HandshakeStatus::Accepted,
            session_id: "abc".into(),
            next_seq: 6,
            server_time_ms: 1_700_000_000_000,
            flags: HELLO_FLAG_FULL_STATE_FOLLOWS,
        }));
        server_roundtrip(ServerMessage::ServerHello(ServerHello::rejected(
            RejectReason::ServerBusy,
            7,
        )));
        server_roundtrip(ServerMessage::Error(ErrorFrame {
            code: 409,
            message: "conflict".into(),
            fatal: true,
        }));
    }

    #[test_timeout::timeout]
    fn unknown_status_code_is_a_rejection() {
        let mut bytes = encode_server_message(&ServerMessage::ServerHello(ServerHello::rejected(
            RejectReason::Unauthorized,
            0,
        )));
        bytes[4] = 42;
        match decode_server_bytes(&bytes).expect("decode") {
            ServerMessage::ServerHello(hello) => {
                assert_eq!(
                    hello.status,
                    HandshakeStatus::Rejected(RejectReason::Unknown(42))
                );
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn every_patch_variant_survives_encoding() {
        let node = NodeRef::from("n1");
        let batch = PatchBatch::new(
            300,
            vec![
                Patch::SetText {
                    node: node.clone(),
                    text: "héllo".into(),
                },
                Patch::SetAttribute {
                    node: node.clone(),
                    name: "title".into(),
                    value: "t".into(),
                },
                Patch::RemoveAttribute {
                    node: node.clone(),
                    name: "title".into(),
                },
                Patch::AddClass {
                    node: node.clone(),
                    class: "on".into(),
                },
                Patch::RemoveClass {
                    node: node.clone(),
                    class: "on".into(),
                },
                Patch::SetStyle {
                    node: node.clone(),
                    property: "color".into(),
                    value: "red".into(),
                },
                Patch::RemoveStyle {
                    node: node.clone(),
                    property: "color".into(),
                },
                Patch::SetValue {
                    node: node.clone(),
                    value: "typed".into(),
                },
                Patch::Insert {
                    parent: node.clone(),
                    index: 2,
                    subtree: sample_subtree(),
                },
                Patch::Remove { node: node.clone() },
                Patch::Move {
                    node: node.clone(),
                    new_parent: NodeRef::from("root"),
                    index: 0,
                },
                Patch::Replace {
                    node: node.clone(),
                    subtree: Subtree::text("replaced"),
                },
                Patch::PushUrl { url: "/a".into() },
                Patch::ReplaceUrl { url: "/b".into() },
                Patch::SetTitle {
                    title: "Page".into(),
                },
                Patch::Dispatch {
                    node,
                    event: "chart:update".into(),
                    detail: HookValue::Map(vec![
                        ("points".into(), HookValue::List(vec![HookValue::Int(-3)])),
                        ("live".into(), HookValue::Bool(true)),
                        ("label".into(), HookValue::Text("x".into())),
                        ("none".into(), HookValue::Null),
                    ]),
                },
            ],
        );
        assert!(!batch.is_truncated());
        server_roundtrip(ServerMessage::Patches(batch));
    }

    #[test_timeout::timeout]
    fn every_event_kind_survives_encoding() {
        let kinds = vec![
            EventKind::Click { x: -4, y: 900 },
            EventKind::Input { value: "a".into() },
            EventKind::Change { value: "b".into() },
            EventKind::Submit {
                fields: vec![("name".into(), "ada".into())],
            },
            EventKind::KeyDown {
                key: "Enter".into(),
                modifiers: modifiers::SHIFT | modifiers::CTRL,
            },
            EventKind::KeyUp {
                key: "a".into(),
                modifiers: modifiers::META,
            },
            EventKind::Focus,
            EventKind::Blur,
            EventKind::Scroll {
                top: 1 << 40,
                left: -1,
            },
            EventKind::Navigate {
                url: "/next".into(),
                trigger: NavigationTrigger::PopState,
            },
            EventKind::Custom {
                name: "drop".into(),
                detail: HookValue::List(vec![HookValue::Null]),
            },
        ];
        for (seq, kind) in kinds.into_iter().enumerate() {
            client_roundtrip(ClientMessage::Event(ClientEvent {
                seq: seq as u64 + 1,
                node: NodeRef::from("btn"),
                kind,
            }));
        }
    }

    #[test_timeout::timeout]
    fn encode_decode_control_and_ack() {
        client_roundtrip(ClientMessage::Ack(Ack {
            last_seq: 6,
            window: 16,
        }));
        client_roundtrip(ClientMessage::Control(Control::ResyncRequest { last_seq: 6 }));
        client_roundtrip(ClientMessage::Control(Control::Ping { timestamp_ms: 99 }));
        server_roundtrip(ServerMessage::Control(Control::FullResync {
            tree: sample_subtree().to_json().expect("json"),
        }));
        server_roundtrip(ServerMessage::Control(Control::Goodbye {
            reason: "bye".into(),
        }));
        server_roundtrip(ServerMessage::Control(Control::Unknown { subtype: 0x7f }));
    }

    #[test_timeout::timeout]
    fn unknown_patch_truncates_batch() {
        let mut payload = Vec::new();
        write_var_u64(&mut payload, 9);
        write_var_u64(&mut payload, 3);
        encode_patch(
            &mut payload,
            &Patch::SetTitle {
                title: "ok".into(),
            },
        );
        payload.push(0x7e);
        payload.extend_from_slice(b"garbage");
        let frame = Frame::new(FrameType::Patches.as_u8(), payload);
        let ServerMessage::Patches(batch) = decode_server_message(&frame).expect("decode") else {
            panic!("expected patches");
        };
        assert_eq!(batch.seq, 9);
        assert_eq!(batch.patches.len(), 2);
        assert_eq!(batch.patches[1], Patch::Unknown { kind: 0x7e });
        assert!(batch.is_truncated());
    }

    #[test_timeout::timeout]
    fn unknown_subtree_kind_marks_enclosing_patch_unknown() {
        let mut payload = Vec::new();
        write_var_u64(&mut payload, 1);
        write_var_u64(&mut payload, 1);
        write_patch_head(&mut payload, PATCH_INSERT, &NodeRef::from("root"));
        write_var_u64(&mut payload, 0);
        payload.push(SUBTREE_FRAGMENT);
        write_var_u64(&mut payload, 1);
        payload.push(0x33);
        let frame = Frame::new(FrameType::Patches.as_u8(), payload);
        let ServerMessage::Patches(batch) = decode_server_message(&frame).expect("decode") else {
            panic!("expected patches");
        };
        assert_eq!(batch.patches, vec![Patch::Unknown { kind: PATCH_INSERT }]);
    }

    #[test_timeout::timeout]
    fn unknown_frame_types_are_not_fatal() {
        let frame = Frame::new(0x40, vec![1, 2, 3]);
        assert_eq!(
            decode_server_message(&frame).expect("decode"),
            ServerMessage::Unknown { frame_type: 0x40 }
        );
        let event_from_server = Frame::new(FrameType::Event.as_u8(), vec![]);
        assert_eq!(
            decode_server_message(&event_from_server).expect("decode"),
            ServerMessage::Unknown {
                frame_type: FrameType::Event.as_u8()
            }
        );
    }

    #[test_timeout::timeout]
    fn decoding_never_reads_past_the_frame() {
        // nodeRef claims 10 bytes; the frame holds 2. The next frame's bytes must not be used.
        let mut bytes = Frame::new(FrameType::Patches.as_u8(), vec![1, 1, PATCH_REMOVE, 10]).encode();
        bytes.extend(Frame::new(FrameType::Control.as_u8(), b"abcdefghij".to_vec()).encode());
        let mut reader = crate::protocol::FrameReader::default();
        let frames = reader.feed(&bytes);
        let first = frames[0].as_ref().expect("frame");
        assert_eq!(
            decode_server_message(first),
            Err(WireError::UnexpectedEof)
        );
    }

    #[test_timeout::timeout]
    fn varint_overflow_is_reported() {
        let frame = Frame::new(FrameType::Ack.as_u8(), vec![0xff; 11]);
        assert_eq!(
            decode_client_message(&frame),
            Err(WireError::VarIntOverflow)
        );
    }

    #[test_timeout::timeout]
    fn tenth_varint_byte_carries_one_bit() {
        let mut max = Vec::new();
        write_var_u64(&mut max, u64::MAX);
        assert_eq!(max.len(), 10);
        assert_eq!(Cursor::new(&max).read_var_u64(), Ok(u64::MAX));

        let mut wide = vec![0xff; 9];
        wide.push(0x02);
        assert_eq!(Cursor::new(&wide).read_var_u64(), Err(WireError::VarIntOverflow));
    }

    #[test_timeout::timeout]
    fn invalid_utf8_is_reported() {
        let mut payload = vec![CONTROL_GOODBYE];
        write_var_u64(&mut payload, 2);
        payload.extend_from_slice(&[0xc3, 0x28]);
        let frame = Frame::new(FrameType::Control.as_u8(), payload);
        assert_eq!(decode_server_message(&frame), Err(WireError::InvalidUtf8));
    }

    #[test_timeout::timeout]
    fn hostile_nesting_is_bounded() {
        let mut payload = Vec::new();
        write_var_u64(&mut payload, 1);
        write_var_u64(&mut payload, 1);
        write_patch_head(&mut payload, PATCH_REPLACE, &NodeRef::from("x"));
        for _ in 0..(MAX_NESTING_DEPTH + 1) {
            payload.push(SUBTREE_FRAGMENT);
            write_var_u64(&mut payload, 1);
        }
        let frame = Frame::new(FrameType::Patches.as_u8(), payload);
        assert_eq!(
            decode_server_message(&frame),
            Err(WireError::DepthExceeded(MAX_NESTING_DEPTH))
        );
    }

    #[test_timeout::timeout]
    fn zigzag_matches_protobuf() {
        for (value, expected) in [(0i64, 0u8), (-1, 1), (1, 2), (-2, 3)] {
            let mut buf = Vec::new();
            write_var_i64(&mut buf, value);
            assert_eq!(buf, vec![expected]);
            assert_eq!(Cursor::new(&buf).read_var_i64(), Ok(value));
        }
        let mut buf = Vec::new();
        write_var_i64(&mut buf, i64::MIN);
        assert_eq!(Cursor::new(&buf).read_var_i64(), Ok(i64::MIN));
    }
}
