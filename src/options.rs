//! Connection options and validation.
//!
//! Options are fixed when a connection is opened and never change
//! afterwards.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use tether::{ConnectionType, Options};
//!
//! let options = Options::new()
//!     .with_type(ConnectionType::Tcp)
//!     .with_retry(3)
//!     .with_retry_timeout(Duration::from_secs(1));
//!
//! assert!(options.validate().is_ok());
//! ```
//!
//! Options can also be loaded from JSON, where every key is checked:
//!
//! ```
//! use serde_json::json;
//! use tether::Options;
//!
//! let options = Options::from_json(&json!({ "type": "tcp_spdy", "retry": 0 })).unwrap();
//! assert_eq!(options.retry, 0);
//!
//! let err = Options::from_json(&json!({ "retries": 3 })).unwrap_err();
//! assert_eq!(err.to_string(), "Invalid option `retries`: unknown option");
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default keepalive interval.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_millis(5000);

/// Default number of reconnect attempts.
pub const DEFAULT_RETRY: u32 = 5;

/// Default delay between reconnect attempts.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_millis(5000);

// ============================================================================
// ConnectionType
// ============================================================================

/// Transport and initial protocol of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// Plain TCP speaking HTTP/1.1.
    Tcp,
    /// Plain TCP speaking SPDY.
    #[serde(alias = "tcp_multiplexed")]
    TcpSpdy,
    /// TLS, protocol chosen by ALPN.
    #[default]
    Tls,
}

impl ConnectionType {
    /// Returns the option value for this type.
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::TcpSpdy => "tcp_spdy",
            Self::Tls => "tls",
        }
    }

    /// Returns `true` if the transport is encrypted.
    #[inline]
    #[must_use]
    pub const fn is_secure(&self) -> bool {
        matches!(self, Self::Tls)
    }

    /// Port used when the authority omits one.
    #[inline]
    #[must_use]
    pub const fn default_port(&self) -> u16 {
        match self {
            Self::Tls => 443,
            Self::Tcp | Self::TcpSpdy => 80,
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "tcp_spdy" | "tcp_multiplexed" => Ok(Self::TcpSpdy),
            "tls" => Ok(Self::Tls),
            other => Err(Error::invalid_option(
                "type",
                format!("expected one of tcp, tcp_spdy, tls; got `{other}`"),
            )),
        }
    }
}

// ============================================================================
// Options
// ============================================================================

/// Connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Options {
    /// Interval between protocol keepalives while connected.
    #[serde(with = "millis")]
    pub keepalive: Duration,

    /// Reconnect attempts allowed after a failed connect.
    pub retry: u32,

    /// Fixed delay between reconnect attempts.
    #[serde(with = "millis")]
    pub retry_timeout: Duration,

    /// Transport and initial protocol.
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,

    /// TLS client configuration. Native roots are loaded when unset.
    #[serde(skip)]
    pub tls: Option<Arc<ClientConfig>>,
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl Options {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            keepalive: DEFAULT_KEEPALIVE,
            retry: DEFAULT_RETRY,
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
            connection_type: ConnectionType::Tls,
            tls: None,
        }
    }

    /// Parses options from a JSON object.
    ///
    /// Durations are given in milliseconds. Missing keys keep their
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOption`] naming the first key that is unknown,
    /// mistyped or out of range.
    pub fn from_json(value: &Value) -> Result<Self> {
        let Some(map) = value.as_object() else {
            return Err(Error::invalid_option("options", "expected a JSON object"));
        };

        let mut options = Self::new();
        for (key, value) in map {
            match key.as_str() {
                "keepalive" => options.keepalive = millis_option(key, value)?,
                "retry_timeout" => options.retry_timeout = millis_option(key, value)?,
                "retry" => {
                    options.retry = value
                        .as_u64()
                        .and_then(|n| u32::try_from(n).ok())
                        .ok_or_else(|| {
                            Error::invalid_option(key, "expected a non-negative integer")
                        })?;
                }
                "type" => {
                    let name = value
                        .as_str()
                        .ok_or_else(|| Error::invalid_option(key, "expected a string"))?;
                    options.connection_type = name.parse()?;
                }
                other => return Err(Error::invalid_option(other, "unknown option")),
            }
        }

        options.validate()?;
        Ok(options)
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl Options {
    /// Sets the keepalive interval.
    #[inline]
    #[must_use]
    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Sets the reconnect budget.
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the delay between reconnect attempts.
    #[inline]
    #[must_use]
    pub fn with_retry_timeout(mut self, retry_timeout: Duration) -> Self {
        self.retry_timeout = retry_timeout;
        self
    }

    /// Sets the connection type.
    #[inline]
    #[must_use]
    pub fn with_type(mut self, connection_type: ConnectionType) -> Self {
        self.connection_type = connection_type;
        self
    }

    /// Uses a custom TLS client configuration.
    ///
    /// An empty ALPN list is replaced with `spdy/3.1`, `http/1.1`. A
    /// non-empty one is offered as is.
    #[inline]
    #[must_use]
    pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl Options {
    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOption`] naming the offending option.
    pub fn validate(&self) -> Result<()> {
        if self.keepalive.is_zero() {
            return Err(Error::invalid_option(
                "keepalive",
                "must be greater than zero",
            ));
        }
        if self.retry_timeout.is_zero() {
            return Err(Error::invalid_option(
                "retry_timeout",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn millis_option(key: &str, value: &Value) -> Result<Duration> {
    match value.as_u64() {
        Some(0) => Err(Error::invalid_option(key, "must be greater than zero")),
        Some(ms) => Ok(Duration::from_millis(ms)),
        None => Err(Error::invalid_option(
            key,
            "expected a positive integer of milliseconds",
        )),
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let options = Options::new();
        assert_eq!(options.keepalive, Duration::from_millis(5000));
        assert_eq!(options.retry, 5);
        assert_eq!(options.retry_timeout, Duration::from_millis(5000));
        assert_eq!(options.connection_type, ConnectionType::Tls);
        assert!(options.tls.is_none());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let options = Options::new()
            .with_keepalive(Duration::from_secs(1))
            .with_retry(0)
            .with_retry_timeout(Duration::from_millis(10))
            .with_type(ConnectionType::TcpSpdy);

        assert_eq!(options.keepalive, Duration::from_secs(1));
        assert_eq!(options.retry, 0);
        assert_eq!(options.retry_timeout, Duration::from_millis(10));
        assert_eq!(options.connection_type, ConnectionType::TcpSpdy);
    }

    #[test]
    fn test_validate_zero_keepalive() {
        let err = Options::new()
            .with_keepalive(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOption { ref option, .. } if option == "keepalive"));
    }

    #[test]
    fn test_validate_zero_retry_timeout() {
        let err = Options::new()
            .with_retry_timeout(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOption { ref option, .. } if option == "retry_timeout"));
    }

    #[test]
    fn test_connection_type_parse() {
        assert_eq!("tcp".parse::<ConnectionType>().unwrap(), ConnectionType::Tcp);
        assert_eq!(
            "tcp_multiplexed".parse::<ConnectionType>().unwrap(),
            ConnectionType::TcpSpdy
        );
        assert_eq!("tls".parse::<ConnectionType>().unwrap(), ConnectionType::Tls);
        assert!("udp".parse::<ConnectionType>().is_err());
        assert_eq!(ConnectionType::TcpSpdy.to_string(), "tcp_spdy");
    }

    #[test]
    fn test_from_json_full() {
        let options = Options::from_json(&json!({
            "keepalive": 1000,
            "retry": 2,
            "retry_timeout": 250,
            "type": "tcp",
        }))
        .unwrap();

        assert_eq!(options.keepalive, Duration::from_millis(1000));
        assert_eq!(options.retry, 2);
        assert_eq!(options.retry_timeout, Duration::from_millis(250));
        assert_eq!(options.connection_type, ConnectionType::Tcp);
    }

    #[test]
    fn test_from_json_rejects_unknown_key() {
        let err = Options::from_json(&json!({ "retry": 1, "pool": true })).unwrap_err();
        assert!(matches!(err, Error::InvalidOption { ref option, .. } if option == "pool"));
    }

    #[test]
    fn test_from_json_rejects_negative_retry() {
        let err = Options::from_json(&json!({ "retry": -1 })).unwrap_err();
        assert!(matches!(err, Error::InvalidOption { ref option, .. } if option == "retry"));
    }

    #[test]
    fn test_from_json_rejects_zero_keepalive() {
        let err = Options::from_json(&json!({ "keepalive": 0 })).unwrap_err();
        assert!(matches!(err, Error::InvalidOption { ref option, .. } if option == "keepalive"));
    }

    #[test]
    fn test_from_json_rejects_bad_type() {
        let err = Options::from_json(&json!({ "type": "quic" })).unwrap_err();
        assert!(matches!(err, Error::InvalidOption { ref option, .. } if option == "type"));
    }

    #[test]
    fn test_from_json_rejects_non_object() {
        assert!(Options::from_json(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_serde_roundtrip_uses_millis() {
        let options = Options::new().with_type(ConnectionType::Tcp);
        let value = serde_json::to_value(&options).unwrap();
        assert_eq!(value["keepalive"], json!(5000));
        assert_eq!(value["type"], json!("tcp"));

        let back: Options = serde_json::from_value(value).unwrap();
        assert_eq!(back.connection_type, ConnectionType::Tcp);
    }

    proptest! {
        #[test]
        fn prop_positive_durations_validate(
            keepalive in 1u64..10_000_000,
            retry in any::<u32>(),
            retry_timeout in 1u64..10_000_000,
        ) {
            let options = Options::from_json(&json!({
                "keepalive": keepalive,
                "retry": retry,
                "retry_timeout": retry_timeout,
            }));
            prop_assert!(options.is_ok());
        }

        #[test]
        fn prop_unknown_keys_are_named(key in "[a-z]{3,12}") {
            prop_assume!(!["keepalive", "retry", "retry_timeout", "type"].contains(&key.as_str()));
            let mut map = serde_json::Map::new();
            map.insert(key.clone(), json!(1));
            match Options::from_json(&Value::Object(map)) {
                Err(Error::InvalidOption { option, .. }) => prop_assert_eq!(option, key),
                other => prop_assert!(false, "unexpected {:?}", other.map(|_| ())),
            }
        }
    }
}
