//! Render JSON-valued attribute changes as a structural diff.
//!
//! Some providers print JSON documents (IAM policies, container definitions)
//! as a single escaped string on each side of `=>`, which is unreadable for
//! anything non-trivial. Once a plan has started, a chunk containing `"[{` is
//! taken as the start of such a value. Output is held back from that point
//! until a complete `"<old>" => "<new>"` pair has arrived, then replaced with
//! an indented diff. Whatever cannot be parsed is emitted exactly as received.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use super::{FilterContext, FilterError, OutputFilter};
use crate::prompt::PLAN_START_RE;

pub const NAME: &str = "json_diff";

const TRIGGER: &str = "\"[{";
const SEPARATOR: &str = " => \"";
const MAX_LINE_TAIL: usize = 512;

static QUOTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)\A"((?:[^"\\]|\\.)*)""#).unwrap());
static PAIR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)\A"((?:[^"\\]|\\.)*)" => "((?:[^"\\]|\\.)*)""#).unwrap()
});

/// What the collected buffer amounts to so far.
enum Scan {
    /// Still waiting for more text.
    Incomplete,
    /// Not an old/new pair after all; release the first `end` bytes untouched.
    NotAPair { end: usize },
    /// A full pair ending at `end`.
    Pair { old: String, new: String, end: usize },
}

pub struct JsonDiff {
    plan_started: bool,
    line_tail: String,
    collecting: bool,
    buffer: String,
}

impl JsonDiff {
    pub fn new(_ctx: &FilterContext) -> Self {
        Self {
            plan_started: false,
            line_tail: String::new(),
            collecting: false,
            buffer: String::new(),
        }
    }

    fn note_plan_start(&mut self, text: &str) {
        self.line_tail.push_str(text);
        if PLAN_START_RE.is_match(&self.line_tail) {
            self.plan_started = true;
            self.line_tail.clear();
            return;
        }
        // Only the current line can still complete a marker.
        let mut start = match self.line_tail.rfind('\n') {
            Some(i) => i + 1,
            None => self.line_tail.len().saturating_sub(MAX_LINE_TAIL),
        };
        while !self.line_tail.is_char_boundary(start) {
            start -= 1;
        }
        self.line_tail.drain(..start);
    }

    fn scan(&self) -> Scan {
        let Some(first) = QUOTED_RE.find(&self.buffer) else {
            return Scan::Incomplete;
        };
        let after = &self.buffer[first.end()..];
        if after.len() < SEPARATOR.len() {
            return if SEPARATOR.starts_with(after) {
                Scan::Incomplete
            } else {
                Scan::NotAPair { end: first.end() }
            };
        }
        if !after.starts_with(SEPARATOR) {
            return Scan::NotAPair { end: first.end() };
        }
        match PAIR_RE.captures(&self.buffer) {
            Some(caps) => Scan::Pair {
                old: caps[1].to_string(),
                new: caps[2].to_string(),
                end: caps.get(0).map_or(0, |m| m.end()),
            },
            None => Scan::Incomplete,
        }
    }

    /// Try to finish the current collection. Returns the emitted text and the
    /// unconsumed remainder when collection ended.
    fn complete(&mut self) -> Option<(String, String)> {
        let (emitted, end) = match self.scan() {
            Scan::Incomplete => return None,
            Scan::NotAPair { end } => {
                debug!("buffered text is not a JSON old/new pair");
                (self.buffer[..end].to_string(), end)
            }
            Scan::Pair { old, new, end } => match parse_pair(&old, &new) {
                Ok((old, new)) => (format!("\n{}", render_diff(&old, &new)), end),
                Err(e) => {
                    warn!(error = %e, "could not parse JSON values for diff");
                    (self.buffer[..end].to_string(), end)
                }
            },
        };

        let remainder = self.buffer[end..].to_string();
        self.buffer.clear();
        self.collecting = false;
        Some((emitted, remainder))
    }
}

impl OutputFilter for JsonDiff {
    fn name(&self) -> &'static str {
        NAME
    }

    fn filter(&mut self, chunk: &str, flushing: bool) -> Result<String, FilterError> {
        let mut out = String::with_capacity(chunk.len());
        let mut pending = chunk.to_string();

        loop {
            if self.collecting {
                self.buffer.push_str(&pending);
                match self.complete() {
                    Some((emitted, remainder)) => {
                        out.push_str(&emitted);
                        pending = remainder;
                        continue;
                    }
                    None => break,
                }
            }

            if !self.plan_started {
                self.note_plan_start(&pending);
            }
            match pending.find(TRIGGER).filter(|_| self.plan_started) {
                Some(idx) => {
                    out.push_str(&pending[..idx]);
                    pending.drain(..idx);
                    self.collecting = true;
                }
                None => {
                    out.push_str(&pending);
                    break;
                }
            }
        }

        if flushing && self.collecting {
            debug!(len = self.buffer.len(), "stream ended mid-value, emitting raw text");
            out.push_str(&self.buffer);
            self.buffer.clear();
            self.collecting = false;
        }

        Ok(out)
    }
}

fn parse_pair(old: &str, new: &str) -> serde_json::Result<(Value, Value)> {
    Ok((parse_escaped(old)?, parse_escaped(new)?))
}

/// Undo the string escaping, then parse the contents as JSON.
fn parse_escaped(escaped: &str) -> serde_json::Result<Value> {
    let raw: String = serde_json::from_str(&format!("\"{escaped}\""))?;
    serde_json::from_str(&raw)
}

/// Render an indented diff: `-` removed, `+` added, space unchanged.
pub fn render_diff(old: &Value, new: &Value) -> String {
    let mut lines = Vec::new();
    diff_value(old, new, 0, "", "", &mut lines);
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn line(marker: char, depth: usize, label: &str, body: &str, trailing: &str) -> String {
    format!("{marker}{}{label}{body}{trailing}", "  ".repeat(depth))
}

fn key_label(key: &str) -> String {
    format!("{}: ", Value::String(key.to_string()))
}

fn comma(index: usize, len: usize) -> &'static str {
    if index + 1 < len { "," } else { "" }
}

fn diff_value(
    old: &Value,
    new: &Value,
    depth: usize,
    label: &str,
    trailing: &str,
    out: &mut Vec<String>,
) {
    if old == new {
        emit_value(' ', old, depth, label, trailing, out);
        return;
    }

    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            out.push(line(' ', depth, label, "{", ""));
            let keys: Vec<&String> = a
                .keys()
                .chain(b.keys().filter(|k| !a.contains_key(*k)))
                .collect();
            for (i, key) in keys.iter().enumerate() {
                let label = key_label(key);
                let trailing = comma(i, keys.len());
                match (a.get(*key), b.get(*key)) {
                    (Some(x), Some(y)) => diff_value(x, y, depth + 1, &label, trailing, out),
                    (Some(x), None) => emit_value('-', x, depth + 1, &label, trailing, out),
                    (None, Some(y)) => emit_value('+', y, depth + 1, &label, trailing, out),
                    (None, None) => {}
                }
            }
            out.push(line(' ', depth, "", "}", trailing));
        }
        (Value::Array(a), Value::Array(b)) => {
            out.push(line(' ', depth, label, "[", ""));
            let len = a.len().max(b.len());
            for i in 0..len {
                let trailing = comma(i, len);
                match (a.get(i), b.get(i)) {
                    (Some(x), Some(y)) => diff_value(x, y, depth + 1, "", trailing, out),
                    (Some(x), None) => emit_value('-', x, depth + 1, "", trailing, out),
                    (None, Some(y)) => emit_value('+', y, depth + 1, "", trailing, out),
                    (None, None) => {}
                }
            }
            out.push(line(' ', depth, "", "]", trailing));
        }
        _ => {
            emit_value('-', old, depth, label, trailing, out);
            emit_value('+', new, depth, label, trailing, out);
        }
    }
}

fn emit_value(
    marker: char,
    value: &Value,
    depth: usize,
    label: &str,
    trailing: &str,
    out: &mut Vec<String>,
) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            out.push(line(marker, depth, label, "{", ""));
            for (i, (key, v)) in map.iter().enumerate() {
                emit_value(marker, v, depth + 1, &key_label(key), comma(i, map.len()), out);
            }
            out.push(line(marker, depth, "", "}", trailing));
        }
        Value::Array(items) if !items.is_empty() => {
            out.push(line(marker, depth, label, "[", ""));
            for (i, v) in items.iter().enumerate() {
                emit_value(marker, v, depth + 1, "", comma(i, items.len()), out);
            }
            out.push(line(marker, depth, "", "]", trailing));
        }
        scalar => out.push(line(marker, depth, label, &scalar.to_string(), trailing)),
    }
}
