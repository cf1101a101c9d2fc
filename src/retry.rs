//! Deciding which provider failures are retried, and how long to wait.

use serde::Deserialize;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Caller-supplied retry predicate
pub type RetryPredicate = Arc<dyn Fn(&io::Error) -> bool + Send + Sync>;

/// A class of provider errors a [`RetryPolicy::Kinds`] set can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Every provider error.
    Io,
    /// Errors of exactly this kind.
    Kind(io::ErrorKind),
}

impl ErrorClass {
    pub fn matches(&self, err: &io::Error) -> bool {
        match self {
            ErrorClass::Io => true,
            ErrorClass::Kind(kind) => err.kind() == *kind,
        }
    }

    /// Parse a snake_case class name such as `"timed_out"`.
    pub fn from_name(name: &str) -> Option<Self> {
        use io::ErrorKind::*;
        let kind = match name {
            "io" => return Some(ErrorClass::Io),
            "not_found" => NotFound,
            "permission_denied" => PermissionDenied,
            "connection_refused" => ConnectionRefused,
            "connection_reset" => ConnectionReset,
            "connection_aborted" => ConnectionAborted,
            "not_connected" => NotConnected,
            "addr_in_use" => AddrInUse,
            "addr_not_available" => AddrNotAvailable,
            "broken_pipe" => BrokenPipe,
            "already_exists" => AlreadyExists,
            "would_block" => WouldBlock,
            "invalid_input" => InvalidInput,
            "invalid_data" => InvalidData,
            "timed_out" => TimedOut,
            "write_zero" => WriteZero,
            "interrupted" => Interrupted,
            "unsupported" => Unsupported,
            "unexpected_eof" => UnexpectedEof,
            "out_of_memory" => OutOfMemory,
            "other" => Other,
            _ => return None,
        };
        Some(ErrorClass::Kind(kind))
    }
}

impl From<io::ErrorKind> for ErrorClass {
    fn from(kind: io::ErrorKind) -> Self {
        ErrorClass::Kind(kind)
    }
}

/// Which provider failures may be retried.
#[derive(Clone, Default, Deserialize)]
#[serde(try_from = "RetrySetting")]
pub enum RetryPolicy {
    #[default]
    Disabled,
    Always,
    Predicate(RetryPredicate),
    Kinds(Vec<ErrorClass>),
}

impl RetryPolicy {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&io::Error) -> bool + Send + Sync + 'static,
    {
        RetryPolicy::Predicate(Arc::new(f))
    }

    pub fn kinds<I, C>(classes: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<ErrorClass>,
    {
        RetryPolicy::Kinds(classes.into_iter().map(Into::into).collect())
    }

    /// An empty set of kinds counts as disabled.
    pub fn is_enabled(&self) -> bool {
        match self {
            RetryPolicy::Disabled => false,
            RetryPolicy::Kinds(classes) => !classes.is_empty(),
            RetryPolicy::Always | RetryPolicy::Predicate(_) => true,
        }
    }

    /// Whether `err` may be retried. A panicking predicate is not caught.
    pub fn is_safe_to_retry(&self, err: &io::Error) -> bool {
        if !self.is_enabled() {
            return false;
        }
        match self {
            RetryPolicy::Predicate(predicate) => predicate(err),
            RetryPolicy::Always => true,
            RetryPolicy::Kinds(classes) => classes.iter().any(|class| class.matches(err)),
            RetryPolicy::Disabled => false,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPolicy::Disabled => f.write_str("Disabled"),
            RetryPolicy::Always => f.write_str("Always"),
            RetryPolicy::Predicate(_) => f.write_str("Predicate(..)"),
            RetryPolicy::Kinds(classes) => f.debug_tuple("Kinds").field(classes).finish(),
        }
    }
}

/// Configuration form: `true`/`false` or a list of class names.
#[derive(Deserialize)]
#[serde(untagged)]
enum RetrySetting {
    Flag(bool),
    Classes(Vec<String>),
}

impl TryFrom<RetrySetting> for RetryPolicy {
    type Error = String;

    fn try_from(setting: RetrySetting) -> Result<Self, Self::Error> {
        match setting {
            RetrySetting::Flag(true) => Ok(RetryPolicy::Always),
            RetrySetting::Flag(false) => Ok(RetryPolicy::Disabled),
            RetrySetting::Classes(names) => names
                .iter()
                .map(|name| {
                    ErrorClass::from_name(name)
                        .ok_or_else(|| format!("unknown error class {name:?}"))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(RetryPolicy::Kinds),
        }
    }
}

/// Exponential delay between retries, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(10),
            max: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}
