//! Condense a long plan into its top-level resource changes.
//!
//! Everything passes through untouched. Once the `Plan:` totals line has been
//! seen, a `Plan Summary:` block listing only the outermost change lines is
//! inserted right before terraform asks for confirmation, so the operator can
//! review the whole change set without scrolling back. A plain `plan` never
//! asks, in which case the block is emitted when the stream ends.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::{FilterContext, FilterError, OutputFilter};
use crate::prompt::{PLAN_START_RE, line_start_regex, strip_ansi};

pub const NAME: &str = "plan_summary";

const CHANGE_GLYPHS: &[&str] = &["+", "-", "~", "-/+", "<="];
const CONFIRM_QUESTIONS: &[&str] = &[
    "Do you want to perform these actions",
    "Do you really want to destroy",
];

static PLAN_TOTALS_RE: LazyLock<Regex> = LazyLock::new(|| line_start_regex("Plan:"));
static CONFIRM_RE: LazyLock<Regex> = LazyLock::new(|| {
    line_start_regex(r"Do you (?:really )?want to (?:perform these actions|destroy)")
});

pub struct PlanSummary {
    collecting: bool,
    buffer: Vec<String>,
    /// Start of a line whose newline has not arrived yet.
    partial: String,
    /// Tail of `partial` not yet emitted because it may open the question.
    held: String,
    pending: Option<String>,
}

impl PlanSummary {
    pub fn new(_ctx: &FilterContext) -> Self {
        Self {
            collecting: false,
            buffer: Vec::new(),
            partial: String::new(),
            held: String::new(),
            pending: None,
        }
    }

    fn observe_line(&mut self, line: &str) {
        if !self.collecting {
            if PLAN_START_RE.is_match(line) {
                self.collecting = true;
                self.buffer.clear();
            }
            return;
        }

        if PLAN_TOTALS_RE.is_match(line) {
            self.pending = render_summary(&self.buffer);
            debug!(
                buffered = self.buffer.len(),
                summarized = self.pending.is_some(),
                "plan totals reached"
            );
            self.collecting = false;
            self.buffer.clear();
        } else {
            self.buffer.push(line.to_string());
        }
    }
}

impl OutputFilter for PlanSummary {
    fn name(&self) -> &'static str {
        NAME
    }

    fn filter(&mut self, chunk: &str, flushing: bool) -> Result<String, FilterError> {
        let mut out = String::with_capacity(chunk.len());

        for segment in chunk.split_inclusive('\n') {
            let terminated = segment.ends_with('\n');
            let mut line = self.partial.clone();
            line.push_str(segment);

            if self.pending.is_some() {
                if CONFIRM_RE.is_match(&line) {
                    if let Some(summary) = self.pending.take() {
                        out.push_str(&summary);
                    }
                } else if !terminated && !flushing && may_open_question(&line) {
                    self.held.push_str(segment);
                    self.partial = line;
                    continue;
                }
            }
            out.push_str(&std::mem::take(&mut self.held));
            out.push_str(segment);

            if terminated {
                self.partial.clear();
                let line = line.trim_end_matches('\n');
                self.observe_line(line.strip_suffix('\r').unwrap_or(line));
            } else {
                self.partial = line;
            }
        }

        if flushing {
            out.push_str(&std::mem::take(&mut self.held));
            if !self.partial.is_empty() {
                let line = std::mem::take(&mut self.partial);
                self.observe_line(&line);
            }
            if let Some(summary) = self.pending.take() {
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&summary);
            }
        }

        Ok(out)
    }
}

/// Whether an unterminated line could still become a confirmation question.
fn may_open_question(line: &str) -> bool {
    let plain = strip_ansi(line);
    let start = plain.trim_start();
    CONFIRM_QUESTIONS.iter().any(|question| question.starts_with(start))
}

/// Outermost-level change lines, verbatim, under a `Plan Summary:` heading.
fn render_summary(lines: &[String]) -> Option<String> {
    let candidates: Vec<(usize, &String)> = lines
        .iter()
        .filter_map(|line| {
            let plain = strip_ansi(line);
            let trimmed = plain.trim_start();
            let glyph = trimmed.split_whitespace().next()?;
            CHANGE_GLYPHS
                .contains(&glyph)
                .then(|| (plain.len() - trimmed.len(), line))
        })
        .collect();

    let outermost = candidates.iter().map(|(indent, _)| *indent).min()?;

    let mut summary = String::from("Plan Summary:\n");
    for (_, line) in candidates.iter().filter(|(indent, _)| *indent == outermost) {
        summary.push_str(line);
        summary.push('\n');
    }
    summary.push('\n');
    Some(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::testing::Harness;

    fn new_filter() -> PlanSummary {
        PlanSummary::new(&Harness::new("n").context())
    }

    fn summary_section(output: &str) -> &str {
        let start = output.find("Plan Summary:").expect("summary present");
        let rest = &output[start..];
        let end = rest.find("\n\n").map(|i| i + 2).unwrap_or(rest.len());
        &rest[..end]
    }

    #[test]
    fn summary_lists_only_top_level_changes() {
        let mut filter = new_filter();
        let input = "Terraform will perform the following actions:\n\
                     + one\n  + nestedone\n- two\n  - nestedtwo\n\
                     Plan: 1 to add, 0 to change, 1 to destroy.\n\
                     Do you want to perform these actions?\n  Enter a value: ";
        let output = filter.filter(input, false).unwrap();

        let summary = summary_section(&output);
        assert_eq!(summary, "Plan Summary:\n+ one\n- two\n\n");
        assert!(!summary.contains("nestedone"));

        let summary_at = output.find("Plan Summary:").unwrap();
        let confirm_at = output.find("Do you want to perform these actions?").unwrap();
        assert!(summary_at < confirm_at);
        assert!(output.find("Plan: 1 to add").unwrap() < summary_at);
    }

    #[test]
    fn passes_everything_through_unchanged() {
        let mut filter = new_filter();
        let input = "Terraform will perform the following actions:\n+ one\nPlan: 1 to add\n";
        let output = filter.filter(input, false).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn works_across_chunk_boundaries() {
        let mut filter = new_filter();
        let chunks = [
            "Terraform will perform the follow",
            "ing actions:\n\n  # aws_instance.web will be created\n  + resou",
            "rce \"aws_instance\" \"web\" {\n      + ami = \"ami-123\"\n    }\n\n",
            "  -/+ resource \"aws_eip\" \"ip\" {\n      ~ id = \"x\" -> (known after apply)\n    }\n",
            "  <= data \"aws_ami\" \"latest\" {\n    }\n",
            "Plan: 2 to add, 0 to change, 1 to destroy.\n\n",
            "Do you want to perform these actions?\n  Enter a value: ",
        ];
        let output: String = chunks
            .iter()
            .map(|chunk| filter.filter(chunk, false).unwrap())
            .collect();

        let summary = summary_section(&output);
        assert!(summary.contains("  + resource \"aws_instance\" \"web\" {"));
        assert!(summary.contains("  -/+ resource \"aws_eip\" \"ip\" {"));
        assert!(summary.contains("  <= data \"aws_ami\" \"latest\" {"));
        assert!(!summary.contains("ami-123"));
        assert!(!summary.contains("known after apply"));
    }

    #[test]
    fn color_codes_are_kept_verbatim() {
        let mut filter = new_filter();
        let input = "Terraform will perform the following actions:\n\
                     \x1b[32m+\x1b[0m resource \"a\" \"b\" {\n\
                     \x1b[32m+\x1b[0m     nested = 1\n\
                     Plan: 1 to add\nDo you want to perform these actions?\n";
        let output = filter.filter(input, false).unwrap();
        let summary = summary_section(&output);
        assert!(summary.contains("\x1b[32m+\x1b[0m resource \"a\" \"b\" {"));
    }

    #[test]
    fn summary_precedes_question_split_across_reads() {
        let mut filter = new_filter();
        let chunks = [
            "Terraform will perform the following actions:\n+ one\nPlan: 1 to add.\n\nDo you want to per",
            "form these actions?\n  Enter a value: ",
        ];
        let outputs: Vec<String> = chunks
            .iter()
            .map(|chunk| filter.filter(chunk, false).unwrap())
            .collect();

        assert!(outputs[0].ends_with("Plan: 1 to add.\n\n"));
        assert!(outputs[1].starts_with("Plan Summary:\n+ one\n\nDo you want to perform these actions?\n"));
        assert_eq!(outputs.concat().matches("Plan Summary:").count(), 1);
    }

    #[test]
    fn held_prefix_is_released_when_it_is_not_the_question() {
        let mut filter = new_filter();
        let body = "Terraform will perform the following actions:\n+ one\nPlan: 1 to add.\n";
        assert_eq!(filter.filter(body, false).unwrap(), body);
        assert_eq!(filter.filter("Do you", false).unwrap(), "");
        assert_eq!(filter.filter(" know?\n", false).unwrap(), "Do you know?\n");
        assert_eq!(filter.filter("Do", false).unwrap(), "");
        assert_eq!(filter.filter("", true).unwrap(), "Do\nPlan Summary:\n+ one\n\n");
    }

    #[test]
    fn plain_plan_gets_summary_at_end_of_stream() {
        let mut filter = new_filter();
        let body = "Terraform will perform the following actions:\n~ changed\nPlan: 0 to add, 1 to change\n";
        assert_eq!(filter.filter(body, false).unwrap(), body);
        let tail = filter.filter("", true).unwrap();
        assert_eq!(tail, "Plan Summary:\n~ changed\n\n");
    }

    #[test]
    fn no_plan_means_no_summary() {
        let mut filter = new_filter();
        let body = "No changes. Infrastructure is up-to-date.\nPlan: nothing\n";
        assert_eq!(filter.filter(body, false).unwrap(), body);
        assert_eq!(filter.filter("", true).unwrap(), "");
    }

    #[test]
    fn destroy_confirmation_is_recognized() {
        let mut filter = new_filter();
        let input = "Terraform will perform the following actions:\n- gone\n\
                     Plan: 0 to add, 0 to change, 1 to destroy.\n\
                     Do you really want to destroy all resources?\n";
        let output = filter.filter(input, false).unwrap();
        let summary_at = output.find("Plan Summary:").unwrap();
        assert!(summary_at < output.find("Do you really want to destroy").unwrap());
    }
}
