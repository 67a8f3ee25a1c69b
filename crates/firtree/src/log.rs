//! Selective logging facility.
//!
//! Log output is controlled by a specification string of category items and
//! channels, e.g. `+all>notice -linker @stderr` or
//! `+kernel=debug @file firtree.log`:
//!
//! ```text
//! item    ::= ('+' | '-') name (('<' | '=' | '>') level)?
//! channel ::= '@' name arg*
//! ```
//!
//! Items are evaluated in order and the last matching one wins; without a
//! level comparison an item applies to every severity. The `FIRTREE_DEBUG`
//! environment variable overrides any compiled-in specification. Messages
//! are emitted through `tracing`; the category of an event is the last
//! segment of its target.

use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Message severities, from least to most severe.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogSeverity {
    Trace,
    Debug,
    OptionOff,
    Verbose,
    OptionOn,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
    Exit,
    Abort,
}

impl LogSeverity {
    pub fn name(self) -> &'static str {
        match self {
            LogSeverity::Trace => "trace",
            LogSeverity::Debug => "debug",
            LogSeverity::OptionOff => "option_off",
            LogSeverity::Verbose => "verbose",
            LogSeverity::OptionOn => "option_on",
            LogSeverity::Info => "info",
            LogSeverity::Notice => "notice",
            LogSeverity::Warning => "warn",
            LogSeverity::Error => "error",
            LogSeverity::Critical => "critical",
            LogSeverity::Alert => "alert",
            LogSeverity::Emergency => "emergency",
            LogSeverity::Exit => "exit",
            LogSeverity::Abort => "abort",
        }
    }

    fn from_tracing(level: &tracing::Level) -> LogSeverity {
        match *level {
            tracing::Level::TRACE => LogSeverity::Trace,
            tracing::Level::DEBUG => LogSeverity::Debug,
            tracing::Level::INFO => LogSeverity::Info,
            tracing::Level::WARN => LogSeverity::Warning,
            tracing::Level::ERROR => LogSeverity::Error,
        }
    }
}

impl FromStr for LogSeverity {
    type Err = LogSpecError;

    fn from_str(s: &str) -> Result<LogSeverity, LogSpecError> {
        let all = [
            LogSeverity::Trace,
            LogSeverity::Debug,
            LogSeverity::OptionOff,
            LogSeverity::Verbose,
            LogSeverity::OptionOn,
            LogSeverity::Info,
            LogSeverity::Notice,
            LogSeverity::Warning,
            LogSeverity::Error,
            LogSeverity::Critical,
            LogSeverity::Alert,
            LogSeverity::Emergency,
            LogSeverity::Exit,
            LogSeverity::Abort,
        ];
        all.into_iter()
            .find(|l| l.name() == s)
            .ok_or_else(|| LogSpecError::UnknownLevel(s.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum LogSpecError {
    #[error("empty log item")]
    EmptyItem,
    #[error("log item must start with '+' or '-': `{0}`")]
    BadPrefix(String),
    #[error("unknown severity level `{0}`")]
    UnknownLevel(String),
    #[error("unknown channel `{0}`")]
    UnknownChannel(String),
    #[error("channel `{0}` is missing its argument")]
    MissingChannelArg(String),
}

/// Relation between a message's severity and an item's level.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LevelCmp {
    Below,
    Equal,
    Above,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogItem {
    /// `+` enables, `-` disables.
    pub enabled: bool,
    /// Category name; `all` matches every category.
    pub category: String,
    pub level: Option<(LevelCmp, LogSeverity)>,
}

impl LogItem {
    fn matches(&self, category: &str, severity: LogSeverity) -> bool {
        if self.category != "all" && self.category != category {
            return false;
        }
        match self.level {
            None => true,
            Some((LevelCmp::Below, level)) => severity < level,
            Some((LevelCmp::Equal, level)) => severity == level,
            Some((LevelCmp::Above, level)) => severity > level,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogChannel {
    Stderr,
    Stdout,
    File(PathBuf),
}

/// A parsed logging specification.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LogSpec {
    pub items: Vec<LogItem>,
    pub channels: Vec<LogChannel>,
}

impl LogSpec {
    /// Whether a message in `category` at `severity` should be emitted.
    /// Without any matching item, warnings and up pass.
    pub fn enables(&self, category: &str, severity: LogSeverity) -> bool {
        let mut enabled = severity >= LogSeverity::Warning;
        for item in &self.items {
            if item.matches(category, severity) {
                enabled = item.enabled;
            }
        }
        enabled
    }

    /// The first configured channel, defaulting to stderr.
    pub fn channel(&self) -> LogChannel {
        self.channels.first().cloned().unwrap_or(LogChannel::Stderr)
    }
}

impl FromStr for LogSpec {
    type Err = LogSpecError;

    fn from_str(s: &str) -> Result<LogSpec, LogSpecError> {
        let mut spec = LogSpec::default();
        let mut words = s.split_whitespace().peekable();
        while let Some(word) = words.next() {
            if let Some(name) = word.strip_prefix('@') {
                match name {
                    "stderr" => spec.channels.push(LogChannel::Stderr),
                    "stdout" => spec.channels.push(LogChannel::Stdout),
                    "file" => {
                        let path = words
                            .next()
                            .ok_or_else(|| LogSpecError::MissingChannelArg(name.to_string()))?;
                        spec.channels.push(LogChannel::File(PathBuf::from(path)));
                    }
                    other => return Err(LogSpecError::UnknownChannel(other.to_string())),
                }
                continue;
            }
            let (enabled, rest) = if let Some(rest) = word.strip_prefix('+') {
                (true, rest)
            } else if let Some(rest) = word.strip_prefix('-') {
                (false, rest)
            } else {
                return Err(LogSpecError::BadPrefix(word.to_string()));
            };
            if rest.is_empty() {
                return Err(LogSpecError::EmptyItem);
            }
            let (category, level) = match rest.find(['<', '=', '>']) {
                Some(pos) => {
                    let cmp = match &rest[pos..pos + 1] {
                        "<" => LevelCmp::Below,
                        "=" => LevelCmp::Equal,
                        _ => LevelCmp::Above,
                    };
                    let level = rest[pos + 1..].parse::<LogSeverity>()?;
                    (rest[..pos].to_string(), Some((cmp, level)))
                }
                None => (rest.to_string(), None),
            };
            if category.is_empty() {
                return Err(LogSpecError::EmptyItem);
            }
            spec.items.push(LogItem { enabled, category, level });
        }
        Ok(spec)
    }
}

/// Environment variable that overrides the compiled-in specification.
pub const LOG_SPEC_ENV: &str = "FIRTREE_DEBUG";

static ACTIVE_SPEC: OnceCell<Arc<LogSpec>> = OnceCell::new();

/// The specification logging was initialised with, if any.
pub fn active_log_spec() -> Option<Arc<LogSpec>> {
    ACTIVE_SPEC.get().cloned()
}

/// Install a `tracing` subscriber filtered by `default_spec`, or by
/// `FIRTREE_DEBUG` when set. Ignores errors from a subscriber already being
/// installed (tests, embedding applications).
pub fn init_logging(default_spec: &str) -> Result<(), LogSpecError> {
    let text = std::env::var(LOG_SPEC_ENV).unwrap_or_else(|_| default_spec.to_string());
    let spec = Arc::new(text.parse::<LogSpec>()?);
    let _ = ACTIVE_SPEC.set(spec.clone());

    let filter_spec = spec.clone();
    let filter = tracing_subscriber::filter::filter_fn(move |meta| {
        let category = meta.target().rsplit("::").next().unwrap_or(meta.target());
        filter_spec.enables(category, LogSeverity::from_tracing(meta.level()))
    });

    let result = match spec.channel() {
        LogChannel::Stderr => tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr).with_filter(filter))
            .try_init(),
        LogChannel::Stdout => tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stdout).with_filter(filter))
            .try_init(),
        LogChannel::File(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|_| LogSpecError::MissingChannelArg("file".to_string()))?;
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(Arc::new(file)).with_ansi(false).with_filter(filter))
                .try_init()
        }
    };
    // A second initialisation keeps the first subscriber.
    let _ = result;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severities_are_totally_ordered() {
        assert!(LogSeverity::Trace < LogSeverity::Debug);
        assert!(LogSeverity::OptionOff < LogSeverity::Verbose);
        assert!(LogSeverity::Notice < LogSeverity::Warning);
        assert!(LogSeverity::Emergency < LogSeverity::Exit);
        assert!(LogSeverity::Exit < LogSeverity::Abort);
    }

    #[test]
    fn parses_items_and_channels() {
        let spec: LogSpec = "+all>notice -linker +jit=debug @file /tmp/firtree.log".parse().unwrap();
        assert_eq!(spec.items.len(), 3);
        assert_eq!(
            spec.items[0],
            LogItem {
                enabled: true,
                category: "all".to_string(),
                level: Some((LevelCmp::Above, LogSeverity::Notice)),
            }
        );
        assert_eq!(spec.items[1].enabled, false);
        assert_eq!(spec.items[1].category, "linker");
        assert_eq!(spec.channel(), LogChannel::File(PathBuf::from("/tmp/firtree.log")));
    }

    #[test]
    fn rejects_malformed_specs() {
        assert!("linker".parse::<LogSpec>().is_err());
        assert!("+".parse::<LogSpec>().is_err());
        assert!("+a=wibble".parse::<LogSpec>().is_err());
        assert!("@nowhere".parse::<LogSpec>().is_err());
        assert!("@file".parse::<LogSpec>().is_err());
    }

    #[test]
    fn last_matching_item_wins() {
        let spec: LogSpec = "+all -linker".parse().unwrap();
        assert!(spec.enables("jit", LogSeverity::Debug));
        assert!(!spec.enables("linker", LogSeverity::Error));

        let spec: LogSpec = "-all +linker>info".parse().unwrap();
        assert!(!spec.enables("jit", LogSeverity::Error));
        assert!(spec.enables("linker", LogSeverity::Warning));
        assert!(!spec.enables("linker", LogSeverity::Info));
    }

    #[test]
    fn default_passes_warnings() {
        let spec = LogSpec::default();
        assert!(spec.enables("anything", LogSeverity::Warning));
        assert!(!spec.enables("anything", LogSeverity::Info));
    }
}
