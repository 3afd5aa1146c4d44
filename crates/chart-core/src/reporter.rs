//! Reporter trait for dependency injection
//!
//! Pipelines report progress through this trait so the hosting task system
//! can surface it however it likes without the core knowing about it.

/// Stable progress codes.
pub mod codes {
    /// Fetching the remote `index.yaml`.
    pub const DOWNLOADING_METADATA: &str = "downloading.metadata";
    /// Turning decoded entries into declared content.
    pub const PARSING_METADATA: &str = "parsing.metadata";
    /// Registering published artifacts.
    pub const PUBLISHING_CONTENT: &str = "publishing.content";
    /// Writing the generated `index.yaml`.
    pub const PUBLISHING_METADATA: &str = "publishing.metadata";
}

/// Receives progress for long-running pipeline phases.
pub trait Reporter: Send + Sync {
    /// A phase identified by `code` has started.
    fn started(&self, code: &str, message: &str, total: Option<u64>);

    /// `done` units of the phase are complete.
    fn advanced(&self, code: &str, done: u64);

    /// The phase finished after `done` units.
    fn finished(&self, code: &str, done: u64);

    /// Log a warning message.
    fn warning(&self, msg: &str);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn started(&self, code: &str, message: &str, total: Option<u64>) {
        (**self).started(code, message, total);
    }
    fn advanced(&self, code: &str, done: u64) {
        (**self).advanced(code, done);
    }
    fn finished(&self, code: &str, done: u64) {
        (**self).finished(code, done);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
}

/// A no-op reporter for silent operations (e.g., verification, testing).
#[derive(Debug, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn started(&self, _: &str, _: &str, _: Option<u64>) {}
    fn advanced(&self, _: &str, _: u64) {}
    fn finished(&self, _: &str, _: u64) {}
    fn warning(&self, _: &str) {}
}

/// Forwards every report to `tracing`.
#[derive(Debug, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn started(&self, code: &str, message: &str, total: Option<u64>) {
        tracing::info!(code, total, "{message}");
    }
    fn advanced(&self, code: &str, done: u64) {
        tracing::trace!(code, done, "progress");
    }
    fn finished(&self, code: &str, done: u64) {
        tracing::debug!(code, done, "phase complete");
    }
    fn warning(&self, msg: &str) {
        tracing::warn!("{msg}");
    }
}

/// A running phase. Counts increments and reports completion exactly once.
pub struct ProgressReport<'a> {
    reporter: &'a dyn Reporter,
    code: &'static str,
    done: u64,
}

impl std::fmt::Debug for ProgressReport<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReport")
            .field("code", &self.code)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<'a> ProgressReport<'a> {
    /// Announce the phase and start counting.
    pub fn start(
        reporter: &'a dyn Reporter,
        code: &'static str,
        message: &str,
        total: Option<u64>,
    ) -> Self {
        reporter.started(code, message, total);
        Self {
            reporter,
            code,
            done: 0,
        }
    }

    /// One more unit done.
    pub fn increment(&mut self) {
        self.done += 1;
        self.reporter.advanced(self.code, self.done);
    }

    /// Close the phase.
    pub fn finish(self) -> u64 {
        self.reporter.finished(self.code, self.done);
        self.done
    }
}
