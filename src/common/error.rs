//! Error types for the server

use std::io;
use thiserror::Error;

/// Server error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("Dial error: {0}")]
    Dial(#[from] DialError),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Error::Auth(msg.into())
    }

    pub fn tls<S: Into<String>>(msg: S) -> Self {
        Error::Tls(msg.into())
    }

    pub fn address<S: Into<String>>(msg: S) -> Self {
        Error::Address(msg.into())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Failure classification at the egress dialer boundary.
///
/// Callers branch on the variant, never on message contents.
#[derive(Error, Debug)]
pub enum DialError {
    #[error("invalid egress configuration: {0}")]
    Config(String),

    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("proxy rejected tunnel{}", fmt_status(.code))]
    ProxyRejected { code: Option<u16> },

    #[error("timed out during {0}")]
    Timeout(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("all egress candidates failed: {last}")]
    AllCandidatesFailed {
        #[source]
        last: Box<DialError>,
    },

    #[error("UDP relay requires a SOCKS5 primary candidate")]
    UdpUnsupportedByProxy,
}

impl DialError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        DialError::Config(msg.into())
    }

    pub fn rejected(code: Option<u16>) -> Self {
        DialError::ProxyRejected { code }
    }
}

fn fmt_status(code: &Option<u16>) -> String {
    match code {
        Some(c) => format!(" (status {})", c),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::protocol("invalid header");
        assert_eq!(e.to_string(), "Protocol error: invalid header");
    }

    #[test]
    fn test_dial_error_rejected_display() {
        let e = DialError::rejected(Some(502));
        assert_eq!(e.to_string(), "proxy rejected tunnel (status 502)");

        let e = DialError::rejected(None);
        assert_eq!(e.to_string(), "proxy rejected tunnel");
    }

    #[test]
    fn test_dial_error_wraps_into_error() {
        let e: Error = DialError::UdpUnsupportedByProxy.into();
        assert!(matches!(e, Error::Dial(DialError::UdpUnsupportedByProxy)));
    }

    #[test]
    fn test_all_failed_keeps_last_cause() {
        let e = DialError::AllCandidatesFailed {
            last: Box::new(DialError::Timeout("connect")),
        };
        assert!(e.to_string().contains("timed out during connect"));
    }
}
