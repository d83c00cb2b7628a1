//! UI/logging capability.
//!
//! Cross-cutting logging is a consumed capability, not a core concern: the
//! rest of the crate takes `&dyn Sink` and never reaches for a global
//! logger. Routes through `tracing` (the teacher workspace's logging
//! dependency) for level gating, re-expressing the level-gated writer
//! pattern of a trace/debug/warn/error gate over one sink idiomatically
//! instead of transliterating it line for line.

use std::fmt;

/// A level-gated, indentation-aware output sink.
///
/// Nested bundle traversal passes an indented view of the parent sink to
/// recursive calls, and a [`Sink::silent`] sink to any sub-operation whose
/// output would duplicate the parent's (e.g. the Locations push performed
/// inside [`crate::bundle::Bundle::note_copy`]).
pub trait Sink: Send + Sync {
    /// Writes a line at "info" level — always shown.
    fn line(&self, msg: &str);

    /// Writes a line at debug level — shown when the sink's configured
    /// level is `Debug` or `Trace`.
    fn debug(&self, msg: &str) {
        let _ = msg;
    }

    /// Writes a line at trace level — shown only when the sink's
    /// configured level is `Trace`.
    fn trace(&self, msg: &str) {
        let _ = msg;
    }

    /// Writes a warning line — always shown, prefixed distinctly.
    fn warn(&self, msg: &str) {
        self.line(&format!("Warning: {msg}"));
    }

    /// Returns an indented view of this sink for nested operations.
    fn indented(&self) -> Box<dyn Sink>;
}

/// Sink level, mirroring the three gates in the original level logger
/// (`Trace` < `Debug` < `Warn`, i.e. `Warn` is the least verbose).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Most verbose.
    Trace,
    /// Intermediate verbosity.
    Debug,
    /// Warnings and plain output only.
    Warn,
}

/// A [`Sink`] that writes through `tracing`, with indentation tracked per
/// instance.
pub struct TracingSink {
    level: Level,
    depth: usize,
}

impl TracingSink {
    /// Creates a root sink at the given verbosity.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level, depth: 0 }
    }

    fn prefix(&self) -> String {
        "  ".repeat(self.depth)
    }
}

impl Sink for TracingSink {
    fn line(&self, msg: &str) {
        tracing::info!("{}{}", self.prefix(), msg);
    }

    fn debug(&self, msg: &str) {
        if self.level <= Level::Debug {
            tracing::debug!("{}{}", self.prefix(), msg);
        }
    }

    fn trace(&self, msg: &str) {
        if self.level <= Level::Trace {
            tracing::trace!("{}{}", self.prefix(), msg);
        }
    }

    fn warn(&self, msg: &str) {
        tracing::warn!("{}{}", self.prefix(), msg);
    }

    fn indented(&self) -> Box<dyn Sink> {
        Box::new(Self {
            level: self.level,
            depth: self.depth + 1,
        })
    }
}

/// A [`Sink`] that discards everything — passed to nested operations whose
/// output would duplicate the parent's.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl Sink for NoopSink {
    fn line(&self, _msg: &str) {}
    fn indented(&self) -> Box<dyn Sink> {
        Box::new(Self)
    }
}

impl fmt::Debug for TracingSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingSink").field("depth", &self.depth).finish()
    }
}
