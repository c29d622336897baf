//! Leveled logger capability injected into a filesystem handle.
//!
//! The reader never decides where log output goes. Callers hand it a
//! [`Logger`], which filters by threshold and forwards to a [`LogSink`].
//! Two sinks ship here: [`TracingSink`] for processes that already run a
//! `tracing` subscriber, and [`StreamSink`] for plain text on any writer.

use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;

/// Log severity, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Fatal,
    Error,
    Warn,
    Info,
    Verbose,
    Debug,
    Trace,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Fatal => "FATAL",
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Verbose => "VERBOSE",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    /// One-letter tag used by [`StreamSink`].
    pub fn tag(&self) -> char {
        self.as_str().chars().next().unwrap_or('?')
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FATAL" => Ok(Level::Fatal),
            "ERROR" => Ok(Level::Error),
            "WARN" | "WARNING" => Ok(Level::Warn),
            "INFO" => Ok(Level::Info),
            "VERBOSE" => Ok(Level::Verbose),
            "DEBUG" => Ok(Level::Debug),
            "TRACE" => Ok(Level::Trace),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// Destination for log records.
pub trait LogSink: Send + Sync {
    fn write(&self, level: Level, message: &str, file: &str, line: u32);
}

/// Output policy, chosen from the threshold at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPolicy {
    /// Source locations shortened to the file name.
    Production,
    /// Full source paths.
    Debug,
}

/// Threshold-filtering logger handle. Cheap to clone.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
    threshold: Level,
    policy: LogPolicy,
}

impl Logger {
    pub fn new(sink: Arc<dyn LogSink>, threshold: Level) -> Self {
        let policy = if threshold >= Level::Debug {
            LogPolicy::Debug
        } else {
            LogPolicy::Production
        };
        Self {
            sink,
            threshold,
            policy,
        }
    }

    /// Logger forwarding to `tracing`.
    pub fn tracing(threshold: Level) -> Self {
        Self::new(Arc::new(TracingSink), threshold)
    }

    /// Logger writing text lines to stderr.
    pub fn stderr(threshold: Level) -> Self {
        Self::new(Arc::new(StreamSink::stderr()), threshold)
    }

    pub fn threshold(&self) -> Level {
        self.threshold
    }

    pub fn policy(&self) -> LogPolicy {
        self.policy
    }

    /// FATAL is always emitted.
    pub fn is_enabled(&self, level: Level) -> bool {
        level <= self.threshold || level == Level::Fatal
    }

    pub fn write(&self, level: Level, message: &str, file: &str, line: u32) {
        if !self.is_enabled(level) {
            return;
        }
        let file = match self.policy {
            LogPolicy::Production => file.rsplit(['/', '\\']).next().unwrap_or(file),
            LogPolicy::Debug => file,
        };
        self.sink.write(level, message, file, line);
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("threshold", &self.threshold)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Forwards records as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, level: Level, message: &str, file: &str, line: u32) {
        match level {
            Level::Fatal | Level::Error => {
                tracing::error!(target: "dwarfs", source_file = file, source_line = line, "{message}")
            }
            Level::Warn => {
                tracing::warn!(target: "dwarfs", source_file = file, source_line = line, "{message}")
            }
            Level::Info | Level::Verbose => {
                tracing::info!(target: "dwarfs", source_file = file, source_line = line, "{message}")
            }
            Level::Debug => {
                tracing::debug!(target: "dwarfs", source_file = file, source_line = line, "{message}")
            }
            Level::Trace => {
                tracing::trace!(target: "dwarfs", source_file = file, source_line = line, "{message}")
            }
        }
    }
}

/// Writes `L file:line] message` lines to a writer.
pub struct StreamSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl StreamSink {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
        }
    }

    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }
}

impl LogSink for StreamSink {
    fn write(&self, level: Level, message: &str, file: &str, line: u32) {
        let mut out = self.out.lock();
        // Nowhere to report a failing log stream.
        let _ = writeln!(out, "{} {}:{}] {}", level.tag(), file, line, message);
    }
}

macro_rules! log_at {
    ($lgr:expr, $level:expr, $($arg:tt)+) => {{
        let lgr: &$crate::logger::Logger = &$lgr;
        if lgr.is_enabled($level) {
            lgr.write($level, &format!($($arg)+), file!(), line!());
        }
    }};
}

macro_rules! log_error {
    ($lgr:expr, $($arg:tt)+) => { $crate::logger::log_at!($lgr, $crate::logger::Level::Error, $($arg)+) };
}

macro_rules! log_warn {
    ($lgr:expr, $($arg:tt)+) => { $crate::logger::log_at!($lgr, $crate::logger::Level::Warn, $($arg)+) };
}

macro_rules! log_info {
    ($lgr:expr, $($arg:tt)+) => { $crate::logger::log_at!($lgr, $crate::logger::Level::Info, $($arg)+) };
}

macro_rules! log_verbose {
    ($lgr:expr, $($arg:tt)+) => { $crate::logger::log_at!($lgr, $crate::logger::Level::Verbose, $($arg)+) };
}

macro_rules! log_debug {
    ($lgr:expr, $($arg:tt)+) => { $crate::logger::log_at!($lgr, $crate::logger::Level::Debug, $($arg)+) };
}

pub(crate) use {log_at, log_debug, log_error, log_info, log_verbose, log_warn};

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Capture(Mutex<Vec<(Level, String, String)>>);

    impl LogSink for Capture {
        fn write(&self, level: Level, message: &str, file: &str, _line: u32) {
            self.0.lock().push((level, message.to_string(), file.to_string()));
        }
    }

    #[test]
    fn test_threshold_filter() {
        let sink = Arc::new(Capture::default());
        let lgr = Logger::new(sink.clone(), Level::Warn);

        lgr.write(Level::Info, "dropped", "a.rs", 1);
        lgr.write(Level::Warn, "kept", "a.rs", 2);
        lgr.write(Level::Error, "kept too", "a.rs", 3);

        let records = sink.0.lock();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].1, "kept");
    }

    #[test]
    fn test_fatal_always_emitted() {
        let sink = Arc::new(Capture::default());
        let lgr = Logger::new(sink.clone(), Level::Fatal);
        lgr.write(Level::Fatal, "boom", "a.rs", 1);
        lgr.write(Level::Error, "quiet", "a.rs", 1);
        assert_eq!(sink.0.lock().len(), 1);
    }

    #[test]
    fn test_policy_selection() {
        let sink = Arc::new(Capture::default());
        let prod = Logger::new(sink.clone(), Level::Verbose);
        assert_eq!(prod.policy(), LogPolicy::Production);
        prod.write(Level::Info, "x", "src/deep/file.rs", 1);

        let dbg = Logger::new(sink.clone(), Level::Debug);
        assert_eq!(dbg.policy(), LogPolicy::Debug);
        dbg.write(Level::Info, "y", "src/deep/file.rs", 1);

        let records = sink.0.lock();
        assert_eq!(records[0].2, "file.rs");
        assert_eq!(records[1].2, "src/deep/file.rs");
    }

    #[test]
    fn test_macros_capture_location() {
        let sink = Arc::new(Capture::default());
        let lgr = Logger::new(sink.clone(), Level::Trace);
        log_info!(lgr, "mounted {} sections", 3);
        log_debug!(lgr, "debug {}", "detail");

        let records = sink.0.lock();
        assert_eq!(records[0].0, Level::Info);
        assert_eq!(records[0].1, "mounted 3 sections");
        assert!(records[0].2.ends_with("logger.rs"));
        assert_eq!(records[1].0, Level::Debug);
    }

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_tracing_sink_emits_every_level() {
        let buf = Buffer::default();
        let writer = buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let lgr = Logger::tracing(Level::Trace);
            for level in [
                Level::Fatal,
                Level::Error,
                Level::Warn,
                Level::Info,
                Level::Verbose,
                Level::Debug,
                Level::Trace,
            ] {
                lgr.write(level, &format!("at {level}"), "img.rs", 7);
            }
        });

        let text = String::from_utf8(buf.0.lock().clone()).unwrap();
        assert_eq!(text.lines().count(), 7, "{text}");
        assert!(text.contains("source_file=") && text.contains("img.rs"), "{text}");
        assert!(text.contains("source_line=7"));
        assert!(text.lines().any(|l| l.contains("TRACE") && l.contains("at TRACE")));
    }

    #[test]
    fn test_level_parse() {
        assert_eq!("verbose".parse::<Level>().unwrap(), Level::Verbose);
        assert_eq!("WARNING".parse::<Level>().unwrap(), Level::Warn);
        assert!("loud".parse::<Level>().is_err());
        assert!(Level::Fatal < Level::Trace);
    }
}
