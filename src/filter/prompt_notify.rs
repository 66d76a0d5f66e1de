//! Raise a desktop notification when terraform blocks on operator input.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::debug;

use super::{FilterContext, FilterError, OutputFilter};
use crate::notify::{Notification, Notifier};
use crate::prompt::line_start_regex;

pub const NAME: &str = "prompt_notify";

const WAITING_MESSAGE: &str = "Terraform is waiting for user input";

static INPUT_PROMPT_RE: LazyLock<Regex> = LazyLock::new(|| line_start_regex("Enter a value:"));

pub struct PromptNotify {
    notifier: Arc<dyn Notifier>,
}

impl PromptNotify {
    pub fn new(ctx: &FilterContext) -> Self {
        Self {
            notifier: ctx.services.notifier.clone(),
        }
    }
}

impl OutputFilter for PromptNotify {
    fn name(&self) -> &'static str {
        NAME
    }

    fn filter(&mut self, chunk: &str, _flushing: bool) -> Result<String, FilterError> {
        if INPUT_PROMPT_RE.is_match(chunk) {
            debug!("terraform is prompting for input");
            self.notifier
                .notify(&Notification::new(WAITING_MESSAGE))
                .map_err(FilterError::Notify)?;
        }
        Ok(chunk.to_string())
    }
}
