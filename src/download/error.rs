//! Error types for piece fetching.
//!
//! Every failure a source adapter or the piece writer can produce is a
//! [`FetchError`]. The engine never inspects messages: control flow is driven
//! by the [`FailureType`] returned from [`classify_error`].

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while resolving or streaming one piece.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Temporary failure (timeout, connection reset, 5xx). Retried locally.
    #[error("transient failure fetching {url}: {reason}")]
    Transient {
        /// The URL being fetched.
        url: String,
        /// What went wrong.
        reason: String,
    },

    /// The source cannot serve this piece (not found, broken layout,
    /// unsolvable challenge, non-200 on the final stream).
    #[error("source exhausted for {url}: {reason}")]
    SourceExhausted {
        /// The URL being fetched.
        url: String,
        /// What went wrong.
        reason: String,
    },

    /// The site answered with something the adapter could not parse.
    #[error("protocol error for {url}: {reason}")]
    Protocol {
        /// The URL being fetched.
        url: String,
        /// What went wrong.
        reason: String,
    },

    /// Local file system error while writing a working file.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    /// Creates a transient error.
    pub fn transient(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transient {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates a source-exhausted error.
    pub fn source_exhausted(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SourceExhausted {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates a protocol error.
    pub fn protocol(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Protocol {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an error from a non-success HTTP status.
    ///
    /// 408, 429 and 5xx are transient; anything else means the source cannot
    /// serve the URL.
    pub fn from_status(url: impl Into<String>, status: u16) -> Self {
        let reason = format!("HTTP {status}");
        match classify_http_status(status) {
            FailureType::Transient => Self::transient(url, reason),
            _ => Self::source_exhausted(url, reason),
        }
    }

    /// Creates an error from a reqwest failure.
    ///
    /// Builder and decode failures are protocol errors, TLS failures exhaust
    /// the source, everything else (timeouts, resets, refused connections) is
    /// transient.
    pub fn from_reqwest(url: impl Into<String>, error: &reqwest::Error) -> Self {
        let reason = error_chain(error);
        if let Some(status) = error.status() {
            return Self::from_status(url, status.as_u16());
        }
        if error.is_builder() || error.is_decode() {
            return Self::protocol(url, reason);
        }
        let host = error.url().and_then(|url| url.host_str());
        if source_chain_mentions_tls(error, host) {
            return Self::source_exhausted(url, reason);
        }
        Self::transient(url, reason)
    }

    /// Returns the URL this error refers to, if any.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Transient { url, .. }
            | Self::SourceExhausted { url, .. }
            | Self::Protocol { url, .. } => Some(url),
            Self::Io { .. } => None,
        }
    }
}

// No `From<reqwest::Error>` / `From<std::io::Error>`: every variant needs the
// url or path the source error does not carry.

/// Classification of a fetch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// May succeed on retry.
    Transient,
    /// The source is unusable for this file.
    SourceExhausted,
    /// Site-specific parse failure. Handled like [`FailureType::SourceExhausted`].
    Protocol,
    /// Local file system failure while writing.
    Local,
}

impl FailureType {
    /// Returns true for failures the piece-level retry loop should repeat.
    #[must_use]
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Transient => "transient",
            Self::SourceExhausted => "source-exhausted",
            Self::Protocol => "protocol",
            Self::Local => "local",
        };
        f.write_str(label)
    }
}

/// Classifies a fetch error.
#[must_use]
pub fn classify_error(error: &FetchError) -> FailureType {
    match error {
        FetchError::Transient { .. } => FailureType::Transient,
        FetchError::SourceExhausted { .. } => FailureType::SourceExhausted,
        FetchError::Protocol { .. } => FailureType::Protocol,
        FetchError::Io { .. } => FailureType::Local,
    }
}

/// Classifies an HTTP status code.
///
/// | Status | Type |
/// |--------|------|
/// | 408 | Transient |
/// | 429 | Transient |
/// | 5xx | Transient |
/// | anything else | `SourceExhausted` |
#[must_use]
pub fn classify_http_status(status: u16) -> FailureType {
    match status {
        408 | 429 | 500..=599 => FailureType::Transient,
        _ => FailureType::SourceExhausted,
    }
}

fn error_chain(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

/// Looks for TLS failures in the inner errors only. The top-level message
/// carries the URL, and the request host is blanked out of inner messages.
fn source_chain_mentions_tls(error: &dyn std::error::Error, host: Option<&str>) -> bool {
    let host = host.map(str::to_ascii_lowercase);
    let mut source = error.source();
    while let Some(inner) = source {
        let mut message = inner.to_string().to_ascii_lowercase();
        if let Some(host) = host.as_deref().filter(|h| !h.is_empty()) {
            message = message.replace(host, "");
        }
        if ["certificate", "tls", "ssl"]
            .iter()
            .any(|marker| message.contains(marker))
        {
            return true;
        }
        source = inner.source();
    }
    false
}
