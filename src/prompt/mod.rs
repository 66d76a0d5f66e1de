//! Operator prompts and terminal-text helpers.
//!
//! Terraform colors its output, so line-oriented matching happens on text
//! with ANSI escapes removed while the original bytes are passed through.

use std::sync::LazyLock;

use anyhow::Result;
use dialoguer::Confirm;
use regex::Regex;

/// Asks the operator a yes/no question.
pub trait Confirmer: Send + Sync {
    fn confirm(&self, question: &str) -> Result<bool>;
}

/// Interactive confirmation on the controlling terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalConfirmer;

impl Confirmer for TerminalConfirmer {
    fn confirm(&self, question: &str) -> Result<bool> {
        let answer = Confirm::new()
            .with_prompt(question)
            .default(false)
            .interact()?;
        Ok(answer)
    }
}

/// Drop the color and cursor escapes terraform and its providers emit.
pub fn strip_ansi(input: &str) -> String {
    static ESCAPE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\x1b(?:\[[0-9;?]*[@-~]|\][^\x07\x1b]*(?:\x07|\x1b\\)|[()][0-9A-Z])").unwrap()
    });
    ESCAPE_RE.replace_all(input, "").into_owned()
}

/// Build a multi-line regex matching `pattern` at the start of a line, after
/// any mix of whitespace and color codes.
pub fn line_start_regex(pattern: &str) -> Regex {
    Regex::new(&format!(r"(?m)^(?:\x1b\[[0-9;]*m|[ \t])*{pattern}")).unwrap()
}

/// Marker line terraform prints before describing planned changes.
pub static PLAN_START_RE: LazyLock<Regex> = LazyLock::new(|| {
    line_start_regex(
        r"(?:Terraform will perform the following actions:|An execution plan has been generated)",
    )
});
