//! Spot state-lock failures and offer to release the lock afterwards.
//!
//! Terraform reports a held lock as a `Lock Info:` block with an `ID:` line a
//! few lines further down. The two can arrive in separate reads, so matching
//! runs over the accumulated text from the marker onward.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, info};

use super::{FilterContext, FilterError, OutputFilter, RunLauncher};
use crate::prompt::{Confirmer, strip_ansi};

pub const NAME: &str = "lock_detection";

const LOCK_MARKER: &str = "Lock Info:";

// The ID only counts once its line is terminated, otherwise a token split
// across reads would be captured short.
static LOCK_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?sm)Lock Info:.*?^[ \t]*ID:[ \t]*([\w-]+)[ \t]*\r?\n").unwrap()
});
static LOCK_ID_AT_EOF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?sm)Lock Info:.*?^[ \t]*ID:[ \t]*([\w-]+)[ \t]*(?:\r?\n|\z)").unwrap()
});

pub struct LockDetection {
    scan: String,
    lock_id: Option<String>,
    confirmer: Arc<dyn Confirmer>,
    launcher: Arc<dyn RunLauncher>,
}

impl LockDetection {
    pub fn new(ctx: &FilterContext) -> Self {
        Self {
            scan: String::new(),
            lock_id: None,
            confirmer: ctx.services.confirmer.clone(),
            launcher: ctx.services.launcher.clone(),
        }
    }

    /// The captured lock ID, if a lock error has been seen.
    pub fn lock_id(&self) -> Option<&str> {
        self.lock_id.as_deref()
    }

    fn scan_chunk(&mut self, chunk: &str, flushing: bool) {
        self.scan.push_str(chunk);

        match self.scan.find(LOCK_MARKER) {
            Some(start) => {
                self.scan.drain(..start);
            }
            None => {
                // Keep just enough to match a marker split across reads.
                let mut keep_from = self.scan.len().saturating_sub(LOCK_MARKER.len() - 1);
                while !self.scan.is_char_boundary(keep_from) {
                    keep_from -= 1;
                }
                self.scan.drain(..keep_from);
                return;
            }
        }

        let text = strip_ansi(&self.scan);
        let re = if flushing { &*LOCK_ID_AT_EOF_RE } else { &*LOCK_ID_RE };
        if let Some(caps) = re.captures(&text) {
            let id = caps[1].to_string();
            debug!(lock_id = %id, "detected terraform state lock");
            self.lock_id = Some(id);
            self.scan.clear();
        }
    }
}

impl OutputFilter for LockDetection {
    fn name(&self) -> &'static str {
        NAME
    }

    fn filter(&mut self, chunk: &str, flushing: bool) -> Result<String, FilterError> {
        if self.lock_id.is_none() {
            self.scan_chunk(chunk, flushing);
        }
        Ok(chunk.to_string())
    }

    fn close(&mut self) -> Result<(), FilterError> {
        let Some(lock_id) = self.lock_id.take() else {
            return Ok(());
        };

        let question = format!("Terraform state is locked (ID {lock_id}). Force unlock it?");
        let confirmed = self
            .confirmer
            .confirm(&question)
            .map_err(FilterError::Prompt)?;
        if !confirmed {
            info!(lock_id = %lock_id, "leaving terraform state lock in place");
            return Ok(());
        }

        info!(lock_id = %lock_id, "force unlocking terraform state");
        let args = vec!["force-unlock".to_string(), "-force".to_string(), lock_id];
        self.launcher.launch(&args).map_err(FilterError::Relaunch)
    }
}
