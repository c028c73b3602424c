use crate::protocol::{HookValue, NodeRef, RejectReason};

/// Side effects the host environment must perform on behalf of a renderer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Self-heal of last resort: reload the whole page.
    Reload,
    /// Complete an interrupted navigation outside the protocol.
    AssignLocation(String),
    PushHistory(String),
    ReplaceHistory(String),
    SetTitle(String),
    HookMounted { node: NodeRef, hook: String },
    HookUpdated { node: NodeRef, hook: String },
    HookDestroyed { node: NodeRef, hook: String },
    Dispatch {
        node: NodeRef,
        event: String,
        detail: HookValue,
    },
    HandshakeRejected(RejectReason),
    ServerError {
        code: u16,
        message: String,
        fatal: bool,
    },
    GaveUp { attempts: u32 },
}

impl Effect {
    pub fn label(&self) -> &'static str {
        match self {
            Effect::Reload => "reload",
            Effect::AssignLocation(_) => "assign_location",
            Effect::PushHistory(_) => "push_history",
            Effect::ReplaceHistory(_) => "replace_history",
            Effect::SetTitle(_) => "set_title",
            Effect::HookMounted { .. } => "hook_mounted",
            Effect::HookUpdated { .. } => "hook_updated",
            Effect::HookDestroyed { .. } => "hook_destroyed",
            Effect::Dispatch { .. } => "dispatch",
            Effect::HandshakeRejected(_) => "handshake_rejected",
            Effect::ServerError { .. } => "server_error",
            Effect::GaveUp { .. } => "gave_up",
        }
    }
}
