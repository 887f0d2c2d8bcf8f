//! Logging bootstrap for Kiln applications.
//!
//! Thin builder over `tracing-subscriber`: level, extra filter directives,
//! span events, and an optional rolling file appender. Initialization is
//! process-wide and guarded, so calling it twice is a no-op rather than a
//! panic.
//!
//! # Example
//!
//! ```rust,ignore
//! use kiln_runtime::logging::{LoggingBuilder, SpanEvents};
//!
//! LoggingBuilder::new()
//!     .with_level(tracing::Level::DEBUG)
//!     .directive("kiln_hub=trace")
//!     .with_span_events(SpanEvents::LIFECYCLE)
//!     .init();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Span event configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpanEvents {
    /// Log when a span is created.
    pub new: bool,
    /// Log when a span is entered.
    pub enter: bool,
    /// Log when a span is exited.
    pub exit: bool,
    /// Log when a span is closed.
    pub close: bool,
}

impl SpanEvents {
    /// No span events.
    pub const NONE: Self = Self {
        new: false,
        enter: false,
        exit: false,
        close: false,
    };

    /// Creation and close only: lifecycle visibility without enter/exit
    /// noise.
    pub const LIFECYCLE: Self = Self {
        new: true,
        enter: false,
        exit: false,
        close: true,
    };

    /// Everything.
    pub const FULL: Self = Self {
        new: true,
        enter: true,
        exit: true,
        close: true,
    };

    fn to_fmt_span(self) -> fmt::format::FmtSpan {
        let mut span = fmt::format::FmtSpan::NONE;
        if self.new {
            span |= fmt::format::FmtSpan::NEW;
        }
        if self.enter {
            span |= fmt::format::FmtSpan::ENTER;
        }
        if self.exit {
            span |= fmt::format::FmtSpan::EXIT;
        }
        if self.close {
            span |= fmt::format::FmtSpan::CLOSE;
        }
        span
    }
}

/// Whether logging has already been initialized by this builder.
pub fn is_initialized() -> bool {
    LOGGING_INITIALIZED.load(Ordering::SeqCst)
}

/// Builder for the logging setup.
#[derive(Default)]
pub struct LoggingBuilder {
    directives: Vec<String>,
    level: Option<tracing::Level>,
    span_events: SpanEvents,
    with_target: bool,
    with_thread_ids: bool,
    file_appender: Option<(std::path::PathBuf, String)>,
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base log level (overridden by `RUST_LOG` when present).
    pub fn with_level(mut self, level: tracing::Level) -> Self {
        self.level = Some(level);
        self
    }

    /// Adds a filter directive, e.g. `"kiln_engine=debug"`.
    pub fn directive(mut self, directive: &str) -> Self {
        self.directives.push(directive.to_string());
        self
    }

    /// Configures span lifecycle events.
    pub fn with_span_events(mut self, events: SpanEvents) -> Self {
        self.span_events = events;
        self
    }

    /// Includes the module path in log output.
    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    /// Includes thread ids in log output.
    pub fn with_thread_ids(mut self, enabled: bool) -> Self {
        self.with_thread_ids = enabled;
        self
    }

    /// Additionally writes daily-rolled log files to `dir/<prefix>.*`.
    pub fn with_file_appender(
        mut self,
        dir: impl Into<std::path::PathBuf>,
        prefix: impl Into<String>,
    ) -> Self {
        self.file_appender = Some((dir.into(), prefix.into()));
        self
    }

    fn build_filter(&self) -> EnvFilter {
        let base = match self.level {
            Some(tracing::Level::TRACE) => "trace",
            Some(tracing::Level::DEBUG) => "debug",
            Some(tracing::Level::INFO) | None => "info",
            Some(tracing::Level::WARN) => "warn",
            Some(tracing::Level::ERROR) => "error",
        };
        let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(base));
        for directive in &self.directives {
            if let Ok(parsed) = directive.parse() {
                filter = filter.add_directive(parsed);
            }
        }
        filter
    }

    /// Initializes the global subscriber; a no-op when already set up.
    pub fn init(self) {
        let _ = self.try_init();
    }

    /// Initializes the global subscriber, reporting failure instead of
    /// panicking.
    pub fn try_init(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if LOGGING_INITIALIZED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let filter = self.build_filter();
        let console = fmt::layer()
            .with_span_events(self.span_events.to_fmt_span())
            .with_target(self.with_target)
            .with_thread_ids(self.with_thread_ids);

        match self.file_appender {
            Some((dir, prefix)) => {
                let appender = tracing_appender::rolling::daily(dir, prefix);
                let file = fmt::layer().with_ansi(false).with_writer(appender);
                tracing_subscriber::registry()
                    .with(console)
                    .with(file)
                    .with(filter)
                    .try_init()
                    .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
            }
            None => tracing_subscriber::registry()
                .with(console)
                .with(filter)
                .try_init()
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
        }
    }
}
