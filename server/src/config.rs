//! Command-line and environment configuration.

use clap::Parser;
use k256::ecdsa::SigningKey;
use thiserror::Error;

/// Starts the skein realtime session server.
#[derive(Parser, Debug, Clone)]
#[command(name = "skein-server", version, about)]
pub struct Args {
    /// Listening address for client connections.
    #[arg(long, env = "SKEIN_ADDR", default_value = "0.0.0.0:4000")]
    pub addr: String,

    /// Admin listening address (metrics, health and debug endpoints).
    #[arg(long, env = "SKEIN_ADMIN_ADDR", default_value = "0.0.0.0:18190")]
    pub admin_addr: String,

    /// The public endpoint where this server is reachable.
    #[arg(long, env = "SKEIN_PUBLIC_ENDPOINT", default_value = "http://localhost:4000")]
    pub public_endpoint: String,

    /// Private key of the server-unique secp256k1 wallet, hex with an
    /// optional 0x prefix. Exactly one of --private-key and
    /// --private-key-file must be given.
    #[arg(long, env = "SKEIN_PRIVATE_KEY")]
    pub private_key: Option<String>,

    /// File containing the private key.
    #[arg(long, env = "SKEIN_PRIVATE_KEY_FILE")]
    pub private_key_file: Option<String>,

    /// Log level (error|warn|info|debug|trace).
    #[arg(long, env = "SKEIN_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Pretty-print log records.
    #[arg(long, env = "SKEIN_LOG_INDENT")]
    pub log_indent: bool,

    /// Seconds between sync clock messages to each client.
    #[arg(long, env = "SKEIN_SYNC_CLOCK_INTERVAL_SECS", default_value_t = 5)]
    pub sync_clock_interval_secs: u64,

    /// Seconds a client may stay idle before being disconnected.
    #[arg(long, env = "SKEIN_CLIENT_IDLE_TIMEOUT_SECS", default_value_t = 300)]
    pub client_idle_timeout_secs: u64,

    /// Milliseconds per session frame.
    #[arg(long, env = "SKEIN_FRAME_DURATION_MS", default_value_t = 15)]
    pub frame_duration_ms: u64,

    /// Seconds between per-connection log summaries.
    #[arg(long, env = "SKEIN_LOG_SUMMARY_INTERVAL_SECS", default_value_t = 60)]
    pub log_summary_interval_secs: u64,

    /// Discovery service endpoint.
    #[arg(long, env = "SKEIN_DISCOVERY_ENDPOINT", default_value = "https://discovery.example.com")]
    pub discovery_endpoint: String,

    /// Seconds between discovery registration attempts.
    #[arg(long, env = "SKEIN_DISCOVERY_REGISTRATION_INTERVAL_SECS", default_value_t = 15)]
    pub discovery_registration_interval_secs: u64,

    /// Seconds since the last health check before re-registration triggers.
    #[arg(long, env = "SKEIN_DISCOVERY_HEALTH_CHECK_TTL_SECS", default_value_t = 120)]
    pub discovery_health_check_ttl_secs: u64,

    /// Number of discovery registration retries.
    #[arg(long, env = "SKEIN_DISCOVERY_REGISTRATION_RETRIES", default_value_t = 3)]
    pub discovery_registration_retries: u32,

    /// Endpoint events are pushed to; empty disables pushing.
    #[arg(long, env = "SKEIN_EVENTS_ENDPOINT", default_value = "")]
    pub events_endpoint: String,

    /// Seconds between event flushes.
    #[arg(long, env = "SKEIN_EVENTS_FLUSH_INTERVAL_SECS", default_value_t = 5)]
    pub events_flush_interval_secs: u64,

    /// Maximum number of events sent at once.
    #[arg(long, env = "SKEIN_EVENTS_BATCH_SIZE", default_value_t = 100)]
    pub events_batch_size: usize,

    /// Size of the queue where events are stored.
    #[arg(long, env = "SKEIN_EVENTS_QUEUE_SIZE", default_value_t = 1000)]
    pub events_queue_size: usize,

    /// Network credit service endpoint receipts are forwarded to.
    #[arg(long, env = "SKEIN_NCS_ENDPOINT", default_value = "http://localhost:4040")]
    pub ncs_endpoint: String,

    /// Comma separated feature flags.
    #[arg(long, env = "SKEIN_FEATURE_FLAGS", default_value = "")]
    pub feature_flags: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("have to specify either private key or private key file")]
    MissingPrivateKey,
    #[error("have to specify either private key or private key file, not both")]
    ConflictingPrivateKeys,
    #[error("invalid public endpoint {0:?}")]
    InvalidPublicEndpoint(String),
    #[error("error loading private key from {file}: {source}")]
    PrivateKeyFile {
        file: String,
        source: std::io::Error,
    },
    #[error("error parsing private key: {0}")]
    PrivateKey(#[from] crate::crypto::CryptoError),
}

/// Validates option combinations that clap cannot express.
pub fn validate(args: &Args) -> Result<(), ConfigError> {
    if !args.public_endpoint.starts_with("http://") && !args.public_endpoint.starts_with("https://")
    {
        return Err(ConfigError::InvalidPublicEndpoint(
            args.public_endpoint.clone(),
        ));
    }

    match (&args.private_key, &args.private_key_file) {
        (Some(_), Some(_)) => Err(ConfigError::ConflictingPrivateKeys),
        (None, None) => Err(ConfigError::MissingPrivateKey),
        _ => Ok(()),
    }
}

/// Loads the signing key from the configured literal or file.
pub fn load_signing_key(args: &Args) -> Result<SigningKey, ConfigError> {
    let raw = match (&args.private_key, &args.private_key_file) {
        (Some(key), _) => key.clone(),
        (None, Some(file)) => {
            std::fs::read_to_string(file).map_err(|source| ConfigError::PrivateKeyFile {
                file: file.clone(),
                source,
            })?
        }
        (None, None) => return Err(ConfigError::MissingPrivateKey),
    };

    Ok(crate::crypto::signing_key_from_hex(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "0x0303030303030303030303030303030303030303030303030303030303030303";

    fn base_args() -> Args {
        Args::parse_from(["skein-server", "--private-key", TEST_KEY])
    }

    #[test]
    fn test_defaults() {
        let args = base_args();
        assert_eq!(args.addr, "0.0.0.0:4000");
        assert_eq!(args.sync_clock_interval_secs, 5);
        assert_eq!(args.client_idle_timeout_secs, 300);
        assert_eq!(args.frame_duration_ms, 15);
        assert_eq!(args.log_summary_interval_secs, 60);
        assert!(validate(&args).is_ok());
    }

    #[test]
    fn test_exactly_one_key_source() {
        let mut args = base_args();
        args.private_key_file = Some("/tmp/key".to_string());
        assert!(matches!(
            validate(&args),
            Err(ConfigError::ConflictingPrivateKeys)
        ));

        args.private_key = None;
        args.private_key_file = None;
        assert!(matches!(validate(&args), Err(ConfigError::MissingPrivateKey)));
    }

    #[test]
    fn test_public_endpoint_must_be_a_url() {
        let mut args = base_args();
        args.public_endpoint = "not-a-url".to_string();
        assert!(matches!(
            validate(&args),
            Err(ConfigError::InvalidPublicEndpoint(_))
        ));
    }

    #[test]
    fn test_key_loads_from_literal_and_file() {
        let args = base_args();
        let from_literal = load_signing_key(&args).unwrap();

        let path = std::env::temp_dir().join("skein-config-test-key");
        std::fs::write(&path, format!("{}\n", TEST_KEY)).unwrap();
        let mut args = base_args();
        args.private_key = None;
        args.private_key_file = Some(path.to_string_lossy().to_string());
        let from_file = load_signing_key(&args).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(from_literal.to_bytes(), from_file.to_bytes());
    }

    #[test]
    fn test_missing_key_file_is_an_error() {
        let mut args = base_args();
        args.private_key = None;
        args.private_key_file = Some("/nonexistent/skein-key".to_string());
        assert!(matches!(
            load_signing_key(&args),
            Err(ConfigError::PrivateKeyFile { .. })
        ));
    }
}
