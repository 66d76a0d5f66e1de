//! Actions the wrapped process can request over the IPC socket.
//!
//! The registry is a fixed name → handler table built once per executor and
//! shared read-only by every connection. Unknown names are an ordinary error
//! response, never a protocol failure.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::notify::{DEFAULT_TITLE, Notification, Notifier};

pub const NOT_ENABLED_MESSAGE: &str = "IPC action is not enabled";

pub type Message = Map<String, Value>;

/// A named operation invoked with the full request message.
pub trait IpcAction: Send + Sync {
    fn name(&self) -> &'static str;
    fn execute(&self, message: &Message) -> Result<Message>;
}

/// Echoes the request back with `action` set to `pong`.
pub struct Ping;

impl IpcAction for Ping {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn execute(&self, message: &Message) -> Result<Message> {
        let mut reply = message.clone();
        reply.insert("action".to_string(), Value::String("pong".to_string()));
        Ok(reply)
    }
}

/// Raises a desktop notification on the operator's machine.
///
/// Request fields: `message` (required), `title`, `modal`.
pub struct Notify {
    notifier: Arc<dyn Notifier>,
}

impl Notify {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

impl IpcAction for Notify {
    fn name(&self) -> &'static str {
        "notify"
    }

    fn execute(&self, message: &Message) -> Result<Message> {
        let text = message
            .get("message")
            .and_then(Value::as_str)
            .context("notify requires a `message` field")?;
        let notification = Notification {
            message: text.to_string(),
            title: message
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_TITLE)
                .to_string(),
            modal: message.get("modal").is_some_and(|v| bool_like(v, false)),
        };

        let outcome = self.notifier.notify(&notification)?;
        match serde_json::to_value(outcome)? {
            Value::Object(map) => Ok(map),
            _ => Ok(Message::new()),
        }
    }
}

/// Name → action table.
#[derive(Default)]
pub struct IpcRegistry {
    actions: HashMap<&'static str, Box<dyn IpcAction>>,
}

impl IpcRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// `ping` and `notify`.
    pub fn standard(notifier: Arc<dyn Notifier>) -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(Ping));
        registry.register(Box::new(Notify::new(notifier)));
        registry
    }

    pub fn register(&mut self, action: Box<dyn IpcAction>) {
        self.actions.insert(action.name(), action);
    }

    pub fn get(&self, name: &str) -> Option<&dyn IpcAction> {
        self.actions.get(name).map(|a| a.as_ref())
    }

    /// Turn one request line into exactly one response object.
    pub fn respond(&self, line: &str) -> Message {
        let message = match serde_json::from_str::<Value>(line.trim()) {
            Ok(Value::Object(map)) => map,
            Ok(other) => return error_reply(format!("IPC message must be a JSON object, got {other}")),
            Err(e) => return error_reply(e.to_string()),
        };

        let enabled = message.get("enabled").is_none_or(|v| bool_like(v, true));
        if !enabled {
            let mut reply = Message::new();
            reply.insert("message".to_string(), json!(NOT_ENABLED_MESSAGE));
            return reply;
        }

        let name = message
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let Some(action) = self.get(name) else {
            warn!(action = name, "unsupported ipc action");
            return error_reply(format!("Unsupported ipc action: {name}"));
        };

        debug!(action = name, "executing ipc action");
        match action.execute(&message) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(action = name, error = %e, "ipc action failed");
                error_reply(format!("Failure while executing ipc action: {e}"))
            }
        }
    }
}

pub(crate) fn error_reply(detail: String) -> Message {
    let mut reply = Message::new();
    reply.insert("error".to_string(), Value::String(detail));
    reply
}

/// Interpret booleans the way a shell-side caller is likely to send them.
pub fn bool_like(value: &Value, default: bool) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => {
            let s = s.trim();
            s == "1" || s.eq_ignore_ascii_case("true")
        }
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::Null => default,
        _ => false,
    }
}
