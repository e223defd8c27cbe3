//! Node log scanning policy and the line classifier.
//!
//! Nodes emit zap-style JSON lines (`{"level":"error","msg":"..."}`). A line
//! at or above the failing level counts as concerning unless an allowed
//! message matches its `msg`; once the count reaches the threshold the scan fails.

use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use thiserror::Error;
use tracing::warn;

/// Severity levels as named by zap, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    DPanic,
    Panic,
    Fatal,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Debug => "debug",
                Self::Info => "info",
                Self::Warn => "warn",
                Self::Error => "error",
                Self::DPanic => "dpanic",
                Self::Panic => "panic",
                Self::Fatal => "fatal",
            }
        )
    }
}

#[derive(Debug, Error)]
#[error("unknown log level {0}")]
pub struct UnknownLevel(pub String);

impl FromStr for LogLevel {
    type Err = UnknownLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "dpanic" => Ok(Self::DPanic),
            "panic" => Ok(Self::Panic),
            "fatal" => Ok(Self::Fatal),
            _ => Err(UnknownLevel(s.to_owned())),
        }
    }
}

/// A known-benign message that must not fail a test when seen at `level`.
#[serde_as]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AllowedLogMessage {
    pub message: String,
    pub reason: String,

    #[serde_as(as = "DisplayFromStr")]
    pub level: LogLevel,

    /// Announce every match with a warning.
    #[serde(default)]
    pub warn_on_match: bool,
}

impl AllowedLogMessage {
    pub fn new(
        message: impl Into<String>,
        reason: impl Into<String>,
        level: LogLevel,
        warn_on_match: bool,
    ) -> Self {
        Self {
            message: message.into(),
            reason: reason.into(),
            level,
            warn_on_match,
        }
    }

    fn matches(&self, level: LogLevel, msg: &str) -> bool {
        self.level == level && msg.contains(&self.message)
    }
}

pub fn default_allowed_messages() -> Vec<AllowedLogMessage> {
    vec![
        AllowedLogMessage::new(
            "Failed to get LINK balance",
            "Happens only when we deploy LINK token for test purposes. Harmless.",
            LogLevel::Error,
            false,
        ),
        AllowedLogMessage::new(
            "Error stopping job service",
            "It's a known issue with lifecycle. There's ongoing work that will fix it.",
            LogLevel::DPanic,
            false,
        ),
    ]
}

#[serde_as]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LogScanSettings {
    #[serde_as(as = "DisplayFromStr")]
    pub failing_level: LogLevel,

    /// Concerning lines tolerated before failing; 1 fails on the first one.
    pub threshold: usize,

    #[serde(default)]
    pub allowed_messages: Vec<AllowedLogMessage>,
}

impl Default for LogScanSettings {
    fn default() -> Self {
        Self::default_policy()
    }
}

impl LogScanSettings {
    /// Fails on the first line at `dpanic` or above, minus known-benign ones.
    pub fn default_policy() -> Self {
        Self {
            failing_level: LogLevel::DPanic,
            threshold: 1,
            allowed_messages: default_allowed_messages(),
        }
    }

    /// A policy that never activates scanning.
    pub fn disabled() -> Self {
        Self {
            failing_level: LogLevel::default(),
            threshold: 0,
            allowed_messages: vec![],
        }
    }

    /// The default policy with `extra` appended to the allow-list.
    pub fn extend_default(extra: impl IntoIterator<Item = AllowedLogMessage>) -> Self {
        let mut settings = Self::default_policy();
        settings.allowed_messages.extend(extra);
        settings
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold > 0 || !self.allowed_messages.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("found one concerning log at level {level} or above: {line}")]
    OneAtLevel { level: LogLevel, line: String },

    #[error("found {count} concerning logs at level {level} or above (threshold {threshold})")]
    MultipleAtLevel {
        count: usize,
        threshold: usize,
        level: LogLevel,
    },

    #[error("malformed log line: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    UnknownLevel(#[from] UnknownLevel),
}

impl ScanError {
    /// Whether the scan found what it was looking for, as opposed to failing
    /// to read the logs.
    pub fn is_concerning(&self) -> bool {
        matches!(self, Self::OneAtLevel { .. } | Self::MultipleAtLevel { .. })
    }
}

#[derive(Deserialize)]
struct LogRecord {
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    msg: String,
}

/// Classifies one log line and returns the updated count of concerning lines.
pub fn scan_log_line(
    line: &str,
    failing_level: LogLevel,
    count_so_far: usize,
    threshold: usize,
    allowed: &[AllowedLogMessage],
) -> Result<usize, ScanError> {
    let record: LogRecord = serde_json::from_str(line)?;

    // banners and other unleveled output carry no severity
    let Some(level) = record.level else {
        return Ok(count_so_far);
    };

    let level: LogLevel = level.parse()?;

    if level < failing_level {
        return Ok(count_so_far);
    }

    if let Some(allowed) = allowed.iter().find(|x| x.matches(level, &record.msg)) {
        if allowed.warn_on_match {
            warn!(
                message = %allowed.message,
                reason = %allowed.reason,
                %level,
                "found allowed log message, ignoring"
            );
        }

        return Ok(count_so_far);
    }

    let count = count_so_far + 1;

    if threshold == 0 || count < threshold {
        return Ok(count);
    }

    if threshold == 1 {
        Err(ScanError::OneAtLevel {
            level,
            line: line.to_owned(),
        })
    } else {
        Err(ScanError::MultipleAtLevel {
            count,
            threshold,
            level,
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn line(level: &str, msg: &str) -> String {
        serde_json::json!({ "level": level, "ts": 1.0, "msg": msg }).to_string()
    }

    #[test]
    fn level_ordering() {
        assert!(LogLevel::Warn < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::DPanic);
        assert!(LogLevel::DPanic < LogLevel::Fatal);
        assert_eq!("DPANIC".parse::<LogLevel>().unwrap(), LogLevel::DPanic);
        assert!("crit".parse::<LogLevel>().is_err());
    }

    #[test]
    fn default_policy_fails_on_first_dpanic() {
        let settings = LogScanSettings::default_policy();

        assert_eq!(settings.failing_level, LogLevel::DPanic);
        assert_eq!(settings.threshold, 1);
        assert_eq!(settings.allowed_messages, default_allowed_messages());
        assert!(settings.is_enabled());
        assert!(!LogScanSettings::disabled().is_enabled());
    }

    #[test]
    fn extra_allowed_messages_keep_order() {
        let extra = AllowedLogMessage::new("flaky", "known", LogLevel::Error, true);

        let settings = LogScanSettings::extend_default([extra.clone(), extra.clone()]);

        let defaults = default_allowed_messages();
        assert_eq!(settings.allowed_messages.len(), defaults.len() + 2);
        assert_eq!(settings.allowed_messages[..defaults.len()], defaults[..]);
        assert_eq!(settings.allowed_messages[defaults.len()], extra);
    }

    #[test]
    fn first_concerning_line_fails() {
        let result = scan_log_line(&line("dpanic", "boom"), LogLevel::DPanic, 0, 1, &[]);

        assert!(matches!(
            result,
            Err(ScanError::OneAtLevel {
                level: LogLevel::DPanic,
                ..
            })
        ));
    }

    #[test]
    fn threshold_counts_up() {
        let concerning = line("panic", "boom");

        let count = scan_log_line(&concerning, LogLevel::Error, 0, 3, &[]).unwrap();
        assert_eq!(count, 1);

        let count = scan_log_line(&concerning, LogLevel::Error, count, 3, &[]).unwrap();
        assert_eq!(count, 2);

        let err = scan_log_line(&concerning, LogLevel::Error, count, 3, &[]).unwrap_err();
        assert!(matches!(err, ScanError::MultipleAtLevel { count: 3, .. }));
        assert!(err.is_concerning());
    }

    #[test]
    fn allowed_message_is_ignored() {
        let allowed = default_allowed_messages();
        let benign = line("dpanic", "Error stopping job service: context canceled");

        let count = scan_log_line(&benign, LogLevel::DPanic, 0, 1, &allowed).unwrap();
        assert_eq!(count, 0);

        // same message at another level is not covered
        let other = line("panic", "Error stopping job service");
        assert!(scan_log_line(&other, LogLevel::DPanic, 0, 1, &allowed).is_err());
    }

    #[test]
    fn allowed_message_only_matches_msg() {
        let allowed = [AllowedLogMessage::new(
            "jobs/service",
            "known shutdown noise",
            LogLevel::Panic,
            false,
        )];
        let crash = r#"{"level":"panic","caller":"jobs/service.go:12","msg":"real crash"}"#;

        let result = scan_log_line(crash, LogLevel::DPanic, 0, 1, &allowed);

        assert!(matches!(
            result,
            Err(ScanError::OneAtLevel {
                level: LogLevel::Panic,
                ..
            })
        ));
    }

    #[test]
    fn unleveled_line_is_skipped() {
        let banner = r#"{"msg":"starting node banner"}"#;

        assert_eq!(scan_log_line(banner, LogLevel::Debug, 2, 3, &[]).unwrap(), 2);
        assert_eq!(scan_log_line("{}", LogLevel::Debug, 0, 1, &[]).unwrap(), 0);
    }

    #[test]
    fn malformed_line() {
        let err = scan_log_line("not json", LogLevel::Error, 0, 1, &[]).unwrap_err();

        assert!(matches!(err, ScanError::Malformed(_)));
        assert!(!err.is_concerning());
    }

    #[test]
    fn settings_from_toml() {
        let raw = r#"
            failing_level = "error"
            threshold = 2

            [[allowed_messages]]
            message = "flaky rpc"
            reason = "upstream"
            level = "error"
        "#;

        let settings: LogScanSettings = toml::from_str(raw).unwrap();

        assert_eq!(settings.failing_level, LogLevel::Error);
        assert_eq!(settings.allowed_messages[0].level, LogLevel::Error);
        assert!(!settings.allowed_messages[0].warn_on_match);
    }

    fn any_level() -> impl Strategy<Value = LogLevel> {
        prop_oneof![
            Just(LogLevel::Debug),
            Just(LogLevel::Info),
            Just(LogLevel::Warn),
            Just(LogLevel::Error),
            Just(LogLevel::DPanic),
            Just(LogLevel::Panic),
            Just(LogLevel::Fatal),
        ]
    }

    proptest! {
        #[test]
        fn lines_below_failing_level_never_count(
            level in any_level(),
            failing in any_level(),
            count in 0usize..10,
        ) {
            prop_assume!(level < failing);

            let result = scan_log_line(&line(&level.to_string(), "x"), failing, count, 1, &[]);

            prop_assert_eq!(result.unwrap(), count);
        }

        #[test]
        fn zero_threshold_never_fails(level in any_level(), count in 0usize..100) {
            let result = scan_log_line(&line(&level.to_string(), "x"), LogLevel::Debug, count, 0, &[]);

            prop_assert_eq!(result.unwrap(), count + 1);
        }
    }
}
