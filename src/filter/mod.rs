//! Output filters for the wrapped process's stdout and stderr.
//!
//! Each run builds one [`FilterChain`] per stream direction from the
//! [`FilterRegistry`]. Filters see the live stream in whatever chunks the
//! pipe delivers, so anything that matches across lines keeps its own buffer.
//!
//! A failing filter never interrupts the stream: the chain logs the error and
//! treats that filter as the identity for the call.

pub mod json_diff;
pub mod lock_detection;
pub mod plan_summary;
pub mod prompt_notify;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::notify::Notifier;
use crate::prompt::Confirmer;

/// Which of the child's output streams a chain is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Stdout,
    Stderr,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("notification failed: {0}")]
    Notify(#[source] anyhow::Error),
    #[error("operator prompt failed: {0}")]
    Prompt(#[source] anyhow::Error),
    #[error("follow-up run failed: {0}")]
    Relaunch(#[source] anyhow::Error),
}

/// Starts a separate terraform run, e.g. a force-unlock after a lock error.
pub trait RunLauncher: Send + Sync {
    fn launch(&self, args: &[String]) -> anyhow::Result<()>;
}

/// Side channels a filter may reach for.
#[derive(Clone)]
pub struct RunServices {
    pub notifier: Arc<dyn Notifier>,
    pub confirmer: Arc<dyn Confirmer>,
    pub launcher: Arc<dyn RunLauncher>,
}

/// Read-only per-run state handed to every filter constructor.
#[derive(Clone)]
pub struct FilterContext {
    pub process_env: BTreeMap<String, String>,
    pub working_group: String,
    pub services: RunServices,
}

/// A stateful transformer over one output stream.
pub trait OutputFilter: Send {
    fn name(&self) -> &'static str;

    /// Transform one chunk. `flushing` is set once, at end of stream, so a
    /// filter can emit anything it is still holding back.
    fn filter(&mut self, chunk: &str, flushing: bool) -> Result<String, FilterError>;

    /// Finalize after the stream has ended.
    fn close(&mut self) -> Result<(), FilterError> {
        Ok(())
    }
}

/// Ordered filters for one stream direction of one run.
pub struct FilterChain {
    direction: Direction,
    filters: Vec<Box<dyn OutputFilter>>,
}

impl FilterChain {
    pub fn new(direction: Direction, filters: Vec<Box<dyn OutputFilter>>) -> Self {
        Self { direction, filters }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run `chunk` through every filter in order.
    pub fn transform(&mut self, chunk: &str, flushing: bool) -> String {
        let mut data = chunk.to_string();
        for filter in &mut self.filters {
            match filter.filter(&data, flushing) {
                Ok(out) => data = out,
                Err(e) => warn!(
                    filter = filter.name(),
                    direction = %self.direction,
                    error = %e,
                    "output filter failed, passing chunk through"
                ),
            }
        }
        data
    }

    /// Finalize every filter, isolating failures.
    pub fn close(&mut self) {
        for filter in &mut self.filters {
            if let Err(e) = filter.close() {
                warn!(
                    filter = filter.name(),
                    direction = %self.direction,
                    error = %e,
                    "output filter failed to close"
                );
            }
        }
    }
}

type FilterFactory = Box<dyn Fn(&FilterContext) -> Box<dyn OutputFilter> + Send + Sync>;

struct Registration {
    name: &'static str,
    direction: Direction,
    factory: FilterFactory,
}

/// Explicit table of the filters available to runs.
///
/// Built once and shared; every run constructs fresh instances from it.
#[derive(Default)]
pub struct FilterRegistry {
    entries: Vec<Registration>,
}

impl FilterRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in filters in their chain order.
    ///
    /// Plan summary runs ahead of the JSON diff renderer so it only ever sees
    /// terraform's own lines.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(plan_summary::NAME, Direction::Stdout, |ctx| {
            Box::new(plan_summary::PlanSummary::new(ctx))
        });
        registry.register(json_diff::NAME, Direction::Stdout, |ctx| {
            Box::new(json_diff::JsonDiff::new(ctx))
        });
        registry.register(prompt_notify::NAME, Direction::Stdout, |ctx| {
            Box::new(prompt_notify::PromptNotify::new(ctx))
        });
        registry.register(lock_detection::NAME, Direction::Stderr, |ctx| {
            Box::new(lock_detection::LockDetection::new(ctx))
        });
        registry
    }

    pub fn register<F>(&mut self, name: &'static str, direction: Direction, factory: F)
    where
        F: Fn(&FilterContext) -> Box<dyn OutputFilter> + Send + Sync + 'static,
    {
        self.entries.push(Registration {
            name,
            direction,
            factory: Box::new(factory),
        });
    }

    /// Registered filter names for a direction, in chain order.
    pub fn names(&self, direction: Direction) -> Vec<&'static str> {
        self.entries
            .iter()
            .filter(|e| e.direction == direction)
            .map(|e| e.name)
            .collect()
    }

    /// Construct a fresh chain for one run, skipping disabled filter names.
    pub fn build_chain(
        &self,
        direction: Direction,
        ctx: &FilterContext,
        disabled: &[String],
    ) -> FilterChain {
        let filters = self
            .entries
            .iter()
            .filter(|e| e.direction == direction)
            .filter(|e| {
                let skip = disabled.iter().any(|d| d == e.name);
                if skip {
                    debug!(filter = e.name, %direction, "output filter disabled");
                }
                !skip
            })
            .map(|e| (e.factory)(ctx))
            .collect();
        FilterChain::new(direction, filters)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct Suffix(&'static str);

    impl OutputFilter for Suffix {
        fn name(&self) -> &'static str {
            "suffix"
        }

        fn filter(&mut self, chunk: &str, _flushing: bool) -> Result<String, FilterError> {
            Ok(format!("{chunk}{}", self.0))
        }
    }

    struct Broken;

    impl OutputFilter for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn filter(&mut self, _chunk: &str, _flushing: bool) -> Result<String, FilterError> {
            Err(FilterError::Notify(anyhow::anyhow!("boom")))
        }

        fn close(&mut self) -> Result<(), FilterError> {
            Err(FilterError::Prompt(anyhow::anyhow!("boom")))
        }
    }

    struct CountsClose(Arc<std::sync::atomic::AtomicUsize>);

    impl OutputFilter for CountsClose {
        fn name(&self) -> &'static str {
            "counts_close"
        }

        fn filter(&mut self, chunk: &str, _flushing: bool) -> Result<String, FilterError> {
            Ok(chunk.to_string())
        }

        fn close(&mut self) -> Result<(), FilterError> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn chain_composes_in_order() {
        let mut chain =
            FilterChain::new(Direction::Stdout, vec![Box::new(Suffix("1")), Box::new(Suffix("2"))]);
        assert_eq!(chain.transform("x", false), "x12");
    }

    #[test]
    fn failing_filter_acts_as_identity() {
        let mut chain =
            FilterChain::new(Direction::Stdout, vec![Box::new(Broken), Box::new(Suffix("2"))]);
        assert_eq!(chain.transform("x", false), "x2");
    }

    #[test]
    fn close_reaches_every_filter_despite_failures() {
        let closed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut chain = FilterChain::new(
            Direction::Stderr,
            vec![
                Box::new(CountsClose(closed.clone())),
                Box::new(Broken),
                Box::new(CountsClose(closed.clone())),
            ],
        );
        chain.close();
        assert_eq!(closed.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_chain_is_identity() {
        let mut chain = FilterChain::new(Direction::Stdout, vec![]);
        assert!(chain.is_empty());
        assert_eq!(chain.transform("abc", true), "abc");
    }

    #[test]
    fn standard_registry_layout() {
        let registry = FilterRegistry::standard();
        assert_eq!(
            registry.names(Direction::Stdout),
            vec!["plan_summary", "json_diff", "prompt_notify"]
        );
        assert_eq!(registry.names(Direction::Stderr), vec!["lock_detection"]);
    }

    #[test]
    fn build_chain_skips_disabled_filters() {
        let harness = testing::Harness::new("n");
        let registry = FilterRegistry::standard();
        let chain = registry.build_chain(
            Direction::Stdout,
            &harness.context(),
            &["json_diff".to_string(), "prompt_notify".to_string()],
        );
        assert_eq!(chain.filters.len(), 1);
        assert_eq!(chain.filters[0].name(), "plan_summary");
        assert_eq!(chain.direction(), Direction::Stdout);
    }

    proptest! {
        // Text without any trigger marker passes through every built-in filter.
        #[test]
        fn standard_filters_pass_plain_text_through(chunk in "[a-z0-9 .,\n]{0,200}") {
            let harness = testing::Harness::new("n");
            let registry = FilterRegistry::standard();
            for direction in [Direction::Stdout, Direction::Stderr] {
                let ctx = harness.context();
                for entry in registry.entries.iter().filter(|e| e.direction == direction) {
                    let mut filter = (entry.factory)(&ctx);
                    prop_assert_eq!(filter.filter(&chunk, false).unwrap(), chunk.clone());
                }
            }
            prop_assert!(harness.notifier.sent.lock().unwrap().is_empty());
        }
    }
}
