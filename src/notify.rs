//! Desktop notifications.
//!
//! Shared by the `notify` IPC action and the prompt-notify output filter.
//! The configured command template wins; otherwise a platform default is used
//! (`osascript` on macOS, `notify-send` elsewhere).

use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::debug;

use crate::config::NotifySettings;

pub const DEFAULT_TITLE: &str = "Atmos Notification";

/// A notification request.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub message: String,
    pub title: String,
    /// Block until the operator acknowledges it, where the platform supports it.
    pub modal: bool,
}

impl Notification {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            title: DEFAULT_TITLE.to_string(),
            modal: false,
        }
    }
}

/// What the notification command reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotifyOutcome {
    pub stdout: String,
    pub success: bool,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<NotifyOutcome>;
}

/// Runs an external command to raise the notification.
pub struct CommandNotifier {
    settings: NotifySettings,
}

impl CommandNotifier {
    pub fn new(settings: NotifySettings) -> Self {
        Self { settings }
    }

    fn command_line(&self, notification: &Notification) -> Vec<String> {
        let template = match &self.settings.command {
            Some(command) if !command.is_empty() => command.clone(),
            _ => default_template(notification.modal),
        };
        template
            .iter()
            .map(|arg| render_arg(arg, notification))
            .collect()
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, notification: &Notification) -> Result<NotifyOutcome> {
        if self.settings.disable {
            debug!(message = %notification.message, "notifications disabled");
            return Ok(NotifyOutcome {
                stdout: String::new(),
                success: true,
            });
        }

        let argv = self.command_line(notification);
        let Some((program, args)) = argv.split_first() else {
            bail!("notification command is empty");
        };

        debug!(program = %program, "raising notification");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to run notification command '{program}'"))?;

        Ok(NotifyOutcome {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            success: output.status.success(),
        })
    }
}

fn render_arg(arg: &str, notification: &Notification) -> String {
    arg.replace("{{title}}", &escape_quotes(&notification.title))
        .replace("{{message}}", &escape_quotes(&notification.message))
        .replace("{{modal}}", if notification.modal { "true" } else { "false" })
}

fn escape_quotes(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(target_os = "macos")]
fn default_template(modal: bool) -> Vec<String> {
    let script = if modal {
        r#"display dialog "{{message}}" with title "{{title}}" buttons {"OK"} default button "OK""#
    } else {
        r#"display notification "{{message}}" with title "{{title}}""#
    };
    vec!["osascript".to_string(), "-e".to_string(), script.to_string()]
}

#[cfg(not(target_os = "macos"))]
fn default_template(modal: bool) -> Vec<String> {
    let mut argv = vec!["notify-send".to_string()];
    if modal {
        argv.push("--urgency=critical".to_string());
    }
    argv.push("{{title}}".to_string());
    argv.push("{{message}}".to_string());
    argv
}
