use std::sync::Arc;

use thiserror::Error;

use crate::protocol::{ClientEvent, ErrorFrame, Patch, Subtree};

/// Application error reported back to the renderer as an Error frame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("view error {code}: {message}")]
pub struct ViewError {
    pub code: u16,
    pub message: String,
    pub fatal: bool,
}

impl ViewError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(code: u16, message: impl Into<String>) -> Self {
        Self {
            fatal: true,
            ..Self::new(code, message)
        }
    }

    pub fn to_frame(&self) -> ErrorFrame {
        ErrorFrame {
            code: self.code,
            message: self.message.clone(),
            fatal: self.fatal,
        }
    }
}

/// Server-side owner of one session's authoritative UI.
///
/// Views emit patches directly; producing them by diffing is left to the view.
pub trait View: Send {
    /// Complete current state, used for full resyncs.
    fn render(&self) -> Subtree;

    fn handle_event(&mut self, event: &ClientEvent) -> Result<Vec<Patch>, ViewError>;
}

pub type ViewFactory = Arc<dyn Fn() -> Box<dyn View> + Send + Sync>;
