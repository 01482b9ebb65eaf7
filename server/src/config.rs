//! Server configuration module.
//!
//! Parses configuration from environment variables for the TopPet hub.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TOPPET_USER_TOKENS` | Yes* | - | Viewer tokens, `token1:user_id1,token2:user_id2` |
//! | `TOPPET_PUBLIC_KEYS` | Yes* | - | Publisher keys, `source1:pubkey1,source2:pubkey2` |
//! | `PORT` | No | 8080 | HTTP server port |
//! | `TOPPET_UNSAFE_NO_AUTH` | No | false | Disable all authentication (dev only) |
//! | `TOPPET_OUTBOUND_QUEUE_CAPACITY` | No | 32 | Frames queued per connection before eviction |
//! | `TOPPET_DISPATCH_QUEUE_CAPACITY` | No | 256 | Envelopes queued for the coordinator |
//! | `TOPPET_MAX_FRAME_BYTES` | No | 65536 | Largest accepted inbound frame |
//! | `TOPPET_KEEPALIVE_SECS` | No | 0 | Ping interval, `0` disables keepalive |
//! | `TOPPET_CHAT_RATE` | No | 1.0 | Chat messages per second per user |
//! | `TOPPET_CHAT_BURST` | No | 5 | Chat burst per user |
//!
//! *Not required if `TOPPET_UNSAFE_NO_AUTH=true`

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use thiserror::Error;
use tracing::warn;

use crate::auth::parse_public_key;
use crate::chat::{DEFAULT_CHAT_BURST, DEFAULT_CHAT_RATE};
use crate::connection::SessionConfig;
use crate::hub::HubConfig;
use crate::types::UserId;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

const USER_TOKENS_VAR: &str = "TOPPET_USER_TOKENS";
const PUBLIC_KEYS_VAR: &str = "TOPPET_PUBLIC_KEYS";

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

impl ConfigError {
    fn invalid(var: &str, message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            var: var.to_string(),
            message: message.into(),
        }
    }
}

/// Server configuration parsed from environment variables.
#[derive(Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// When true, disables all authentication (development only).
    pub unsafe_no_auth: bool,

    /// Viewer access tokens and the users they identify.
    pub user_tokens: HashMap<String, UserId>,

    /// Publisher source id to Ed25519 verifying key.
    pub public_keys: HashMap<String, VerifyingKey>,

    pub hub: HubConfig,
    pub session: SessionConfig,

    /// Sustained chat messages per second per user.
    pub chat_rate: f64,

    /// Chat burst per user.
    pub chat_burst: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            unsafe_no_auth: false,
            user_tokens: HashMap::new(),
            public_keys: HashMap::new(),
            hub: HubConfig::default(),
            session: SessionConfig::default(),
            chat_rate: DEFAULT_CHAT_RATE,
            chat_burst: DEFAULT_CHAT_BURST,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("unsafe_no_auth", &self.unsafe_no_auth)
            .field("user_tokens", &self.user_tokens.len())
            .field("public_keys", &self.public_keys.keys().collect::<Vec<_>>())
            .field("hub", &self.hub)
            .field("session", &self.session)
            .field("chat_rate", &self.chat_rate)
            .field("chat_burst", &self.chat_burst)
            .finish()
    }
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Required environment variables are missing (when `TOPPET_UNSAFE_NO_AUTH` is not true)
    /// - Environment variables have invalid format
    /// - Port number is not a valid u16
    /// - A queue capacity, frame limit or chat limit is zero
    ///
    /// # Example
    ///
    /// ```no_run
    /// use toppet_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let keepalive_secs: u64 = parse_env("TOPPET_KEEPALIVE_SECS", 0)?;

        let config = Self {
            port: parse_port()?,
            unsafe_no_auth: parse_bool_env("TOPPET_UNSAFE_NO_AUTH"),
            user_tokens: parse_user_tokens()?,
            public_keys: parse_public_keys()?,
            hub: HubConfig {
                outbound_capacity: parse_env(
                    "TOPPET_OUTBOUND_QUEUE_CAPACITY",
                    HubConfig::default().outbound_capacity,
                )?,
                dispatch_capacity: parse_env(
                    "TOPPET_DISPATCH_QUEUE_CAPACITY",
                    HubConfig::default().dispatch_capacity,
                )?,
                ..HubConfig::default()
            },
            session: SessionConfig {
                max_frame_bytes: parse_env(
                    "TOPPET_MAX_FRAME_BYTES",
                    SessionConfig::default().max_frame_bytes,
                )?,
                keepalive: (keepalive_secs > 0).then(|| Duration::from_secs(keepalive_secs)),
            },
            chat_rate: parse_env("TOPPET_CHAT_RATE", DEFAULT_CHAT_RATE)?,
            chat_burst: parse_env("TOPPET_CHAT_BURST", DEFAULT_CHAT_BURST)?,
        };

        config.validate()?;

        if config.unsafe_no_auth {
            warn!(
                "TOPPET_UNSAFE_NO_AUTH is enabled - all authentication is disabled. \
                 Do not use in production!"
            );
        }

        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Outside unsafe mode both viewer tokens and publisher keys must be
    /// configured. Limits must be positive in every mode.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hub.outbound_capacity == 0 || self.hub.dispatch_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "queue capacities must be greater than zero".to_string(),
            ));
        }

        if self.session.max_frame_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "TOPPET_MAX_FRAME_BYTES must be greater than zero".to_string(),
            ));
        }

        if !(self.chat_rate.is_finite() && self.chat_rate > 0.0) || self.chat_burst == 0 {
            return Err(ConfigError::ValidationError(
                "chat rate and burst must be greater than zero".to_string(),
            ));
        }

        if self.unsafe_no_auth {
            return Ok(());
        }

        if self.user_tokens.is_empty() {
            return Err(ConfigError::MissingEnvVar(USER_TOKENS_VAR.to_string()));
        }

        if self.public_keys.is_empty() {
            return Err(ConfigError::MissingEnvVar(PUBLIC_KEYS_VAR.to_string()));
        }

        Ok(())
    }
}

/// Parse a boolean environment variable.
///
/// Returns `true` if the variable is set to "true" (case-insensitive),
/// `false` otherwise.
fn parse_bool_env(name: &str) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Parse the PORT environment variable.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.trim().parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => {
            Err(ConfigError::invalid("PORT", "contains invalid unicode"))
        }
    }
}

/// Parse an optional numeric environment variable, falling back to `default`.
fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(default),
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|err: T::Err| ConfigError::invalid(name, format!("'{raw}': {err}"))),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => {
            Err(ConfigError::invalid(name, "contains invalid unicode"))
        }
    }
}

/// Splits a `key:value,key:value` list, rejecting empty halves.
///
/// The split is on the last `:` of each entry so keys may contain colons.
fn parse_pairs(var: &str) -> Result<Vec<(String, String)>, ConfigError> {
    let raw = match env::var(var) {
        Ok(s) if !s.trim().is_empty() => s,
        _ => return Ok(Vec::new()),
    };

    let mut pairs = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let Some((key, value)) = entry.rsplit_once(':') else {
            return Err(ConfigError::invalid(
                var,
                format!("expected 'key:value' format, got '{entry}'"),
            ));
        };
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() {
            return Err(ConfigError::invalid(
                var,
                format!("empty key or value in '{entry}'"),
            ));
        }
        pairs.push((key.to_string(), value.to_string()));
    }
    Ok(pairs)
}

/// Parse `TOPPET_USER_TOKENS` (`token:user_id,...`).
fn parse_user_tokens() -> Result<HashMap<String, UserId>, ConfigError> {
    parse_pairs(USER_TOKENS_VAR)?
        .into_iter()
        .map(|(token, user)| -> Result<_, ConfigError> {
            let user_id: i64 = user.parse().map_err(|_| {
                ConfigError::invalid(USER_TOKENS_VAR, format!("user id '{user}' is not an integer"))
            })?;
            Ok((token, UserId(user_id)))
        })
        .collect()
}

/// Parse `TOPPET_PUBLIC_KEYS` (`source:base64_pubkey,...`) into verifying keys.
fn parse_public_keys() -> Result<HashMap<String, VerifyingKey>, ConfigError> {
    parse_pairs(PUBLIC_KEYS_VAR)?
        .into_iter()
        .map(|(source_id, key)| -> Result<_, ConfigError> {
            let verifying_key = parse_public_key(&key).map_err(|err| {
                ConfigError::invalid(PUBLIC_KEYS_VAR, format!("key for source '{source_id}': {err}"))
            })?;
            Ok((source_id, verifying_key))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::prelude::*;
    use ed25519_dalek::SigningKey;
    use serial_test::serial;

    const ALL_VARS: &[&str] = &[
        "PORT",
        "TOPPET_UNSAFE_NO_AUTH",
        USER_TOKENS_VAR,
        PUBLIC_KEYS_VAR,
        "TOPPET_OUTBOUND_QUEUE_CAPACITY",
        "TOPPET_DISPATCH_QUEUE_CAPACITY",
        "TOPPET_MAX_FRAME_BYTES",
        "TOPPET_KEEPALIVE_SECS",
        "TOPPET_CHAT_RATE",
        "TOPPET_CHAT_BURST",
    ];

    /// Restores touched environment variables on drop.
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        /// Starts from a clean slate for every variable the server reads.
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for var in ALL_VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
            env::set_var(key, value);
        }

        fn remove(&mut self, key: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
            env::remove_var(key);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.iter().rev() {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    fn public_key(seed: u8) -> String {
        let signing_key = SigningKey::from_bytes(&[seed; 32]);
        BASE64_STANDARD.encode(signing_key.verifying_key().to_bytes())
    }

    fn secure_env() -> EnvGuard {
        let mut guard = EnvGuard::clean();
        guard.set(USER_TOKENS_VAR, "tok-a:1,tok-b:2");
        guard.set(PUBLIC_KEYS_VAR, &format!("contest-service:{}", public_key(1)));
        guard
    }

    #[test]
    #[serial]
    fn unsafe_mode_needs_no_credentials() {
        let mut guard = EnvGuard::clean();
        guard.set("TOPPET_UNSAFE_NO_AUTH", "TRUE");

        let config = Config::from_env().expect("should parse config");
        assert!(config.unsafe_no_auth);
        assert!(config.user_tokens.is_empty());
        assert!(config.public_keys.is_empty());
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.hub, HubConfig::default());
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    #[serial]
    fn secure_mode_parses_tokens_and_keys() {
        let mut guard = secure_env();
        guard.set("PORT", "9090");

        let config = Config::from_env().expect("should parse config");
        assert!(!config.unsafe_no_auth);
        assert_eq!(config.port, 9090);
        assert_eq!(config.user_tokens.get("tok-a"), Some(&UserId(1)));
        assert_eq!(config.user_tokens.get("tok-b"), Some(&UserId(2)));
        assert!(config.public_keys.contains_key("contest-service"));
    }

    #[test]
    #[serial]
    fn missing_user_tokens_is_rejected() {
        let mut guard = secure_env();
        guard.remove(USER_TOKENS_VAR);

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref v) if v == USER_TOKENS_VAR));
    }

    #[test]
    #[serial]
    fn missing_public_keys_is_rejected() {
        let mut guard = secure_env();
        guard.remove(PUBLIC_KEYS_VAR);

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref v) if v == PUBLIC_KEYS_VAR));
    }

    #[test]
    #[serial]
    fn tuning_variables_override_defaults() {
        let mut guard = secure_env();
        guard.set("TOPPET_OUTBOUND_QUEUE_CAPACITY", "8");
        guard.set("TOPPET_DISPATCH_QUEUE_CAPACITY", "1024");
        guard.set("TOPPET_MAX_FRAME_BYTES", "4096");
        guard.set("TOPPET_KEEPALIVE_SECS", "25");
        guard.set("TOPPET_CHAT_RATE", "0.5");
        guard.set("TOPPET_CHAT_BURST", "3");

        let config = Config::from_env().expect("should parse config");
        assert_eq!(config.hub.outbound_capacity, 8);
        assert_eq!(config.hub.dispatch_capacity, 1024);
        assert_eq!(config.session.max_frame_bytes, 4096);
        assert_eq!(config.session.keepalive, Some(Duration::from_secs(25)));
        assert_eq!(config.chat_rate, 0.5);
        assert_eq!(config.chat_burst, 3);
    }

    #[test]
    #[serial]
    fn zero_keepalive_disables_pings() {
        let mut guard = secure_env();
        guard.set("TOPPET_KEEPALIVE_SECS", "0");

        let config = Config::from_env().expect("should parse config");
        assert_eq!(config.session.keepalive, None);
    }

    #[test]
    #[serial]
    fn zero_capacity_fails_validation() {
        let mut guard = secure_env();
        guard.set("TOPPET_OUTBOUND_QUEUE_CAPACITY", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    #[serial]
    fn non_numeric_tuning_value_is_invalid() {
        let mut guard = secure_env();
        guard.set("TOPPET_CHAT_BURST", "lots");

        let err = Config::from_env().unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidFormat { ref var, .. } if var == "TOPPET_CHAT_BURST")
        );
    }

    #[test]
    #[serial]
    fn user_tokens_require_integer_ids() {
        let mut guard = EnvGuard::clean();
        guard.set(USER_TOKENS_VAR, "tok-a:alice");

        let err = parse_user_tokens().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFormat { ref var, .. } if var == USER_TOKENS_VAR));
    }

    #[test]
    #[serial]
    fn tokens_may_contain_colons_and_whitespace() {
        let mut guard = EnvGuard::clean();
        guard.set(USER_TOKENS_VAR, " a:b:c : 7 , plain:8 ");

        let tokens = parse_user_tokens().expect("should parse tokens");
        assert_eq!(tokens.get("a:b:c"), Some(&UserId(7)));
        assert_eq!(tokens.get("plain"), Some(&UserId(8)));
    }

    #[test]
    #[serial]
    fn malformed_pairs_are_rejected() {
        let mut guard = EnvGuard::clean();
        for raw in ["no-colon", ":7", "tok:"] {
            guard.set(USER_TOKENS_VAR, raw);
            assert!(parse_user_tokens().is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    #[serial]
    fn undecodable_public_key_is_rejected() {
        let mut guard = EnvGuard::clean();
        guard.set(PUBLIC_KEYS_VAR, "votes:not-a-key");

        let err = parse_public_keys().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFormat { ref var, .. } if var == PUBLIC_KEYS_VAR));
    }

    #[test]
    #[serial]
    fn port_parsing() {
        let mut guard = EnvGuard::clean();
        assert_eq!(parse_port().unwrap(), DEFAULT_PORT);

        guard.set("PORT", "3000");
        assert_eq!(parse_port().unwrap(), 3000);

        guard.set("PORT", "not-a-number");
        assert!(matches!(parse_port().unwrap_err(), ConfigError::InvalidPort(_)));

        guard.set("PORT", "99999");
        assert!(parse_port().is_err());
    }

    #[test]
    #[serial]
    fn bool_parsing_accepts_only_true() {
        let mut guard = EnvGuard::clean();
        guard.set("TOPPET_UNSAFE_NO_AUTH", "True");
        assert!(parse_bool_env("TOPPET_UNSAFE_NO_AUTH"));

        guard.set("TOPPET_UNSAFE_NO_AUTH", "1");
        assert!(!parse_bool_env("TOPPET_UNSAFE_NO_AUTH"));
    }

    #[test]
    fn debug_output_hides_tokens() {
        let config = Config {
            user_tokens: HashMap::from([("super-secret".to_string(), UserId(1))]),
            ..Config::default()
        };
        assert!(!format!("{config:?}").contains("super-secret"));
    }
}
