use std::time::Duration;

use tracing::warn;

/// `ut-on-<kind>`: the element wants `<kind>` events forwarded to the server.
pub const EVENT_PREFIX: &str = "ut-on-";
/// `ut-optimistic-<kind>`: local effect applied as soon as `<kind>` is emitted.
pub const OPTIMISTIC_PREFIX: &str = "ut-optimistic-";
/// Client-side navigation target.
pub const LINK_ATTRIBUTE: &str = "ut-link";

pub fn event_attribute(kind: &str) -> String {
    format!("{EVENT_PREFIX}{kind}")
}

pub fn optimistic_attribute(kind: &str) -> String {
    format!("{OPTIMISTIC_PREFIX}{kind}")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Modifiers {
    pub prevent: bool,
    pub stop: bool,
    pub self_only: bool,
    pub once: bool,
    pub passive: bool,
    pub capture: bool,
    pub debounce: Option<Duration>,
    pub throttle: Option<Duration>,
}

impl Modifiers {
    /// Parses a whitespace-separated modifier list. Unknown tokens are skipped.
    pub fn parse(value: &str) -> Self {
        let mut modifiers = Modifiers::default();
        for token in value.split_ascii_whitespace() {
            match token {
                "prevent" => modifiers.prevent = true,
                "stop" => modifiers.stop = true,
                "self" => modifiers.self_only = true,
                "once" => modifiers.once = true,
                "passive" => modifiers.passive = true,
                "capture" => modifiers.capture = true,
                _ => {
                    if let Some(ms) = token.strip_prefix("debounce=") {
                        modifiers.debounce = parse_millis(token, ms);
                    } else if let Some(ms) = token.strip_prefix("throttle=") {
                        modifiers.throttle = parse_millis(token, ms);
                    } else {
                        warn!(target = "undertow::events", token, "ignoring unknown event modifier");
                    }
                }
            }
        }
        modifiers
    }

    /// Passive handlers can never suppress the default action.
    pub fn prevents_default(&self) -> bool {
        self.prevent && !self.passive
    }
}

fn parse_millis(token: &str, value: &str) -> Option<Duration> {
    match value.parse::<u64>() {
        Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
        Ok(_) => None,
        Err(_) => {
            warn!(target = "undertow::events", token, "invalid modifier duration");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimisticAction {
    ToggleClass(String),
    SetText(String),
    SetAttribute { name: String, value: String },
}

impl OptimisticAction {
    /// `toggle-class <name>`, `set-text <text>` or `set-attr <name> <value>`.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim_start();
        let (verb, rest) = value.split_once(char::is_whitespace).unwrap_or((value, ""));
        let action = match verb {
            "toggle-class" => {
                let class = rest.trim();
                (!class.is_empty()).then(|| OptimisticAction::ToggleClass(class.to_string()))
            }
            "set-text" => Some(OptimisticAction::SetText(rest.trim().to_string())),
            "set-attr" => {
                let rest = rest.trim_start();
                let (name, value) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                (!name.is_empty()).then(|| OptimisticAction::SetAttribute {
                    name: name.to_string(),
                    value: value.trim().to_string(),
                })
            }
            _ => None,
        };
        if action.is_none() {
            warn!(target = "undertow::events", declaration = value, "unparseable optimistic declaration");
        }
        action
    }
}
