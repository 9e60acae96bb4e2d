//! Runtime configuration.
//!
//! Every field has a serde default so partial TOML files load. `validate()`
//! rejects values the protocol cannot use; clamping is left to accessors.

use std::time::Duration;

use demonsaw_crypto::KeyParameters;
use demonsaw_crypto::dh::{MAX_PRIME_SIZE, MIN_PRIME_SIZE};
use demonsaw_files::{DEFAULT_CHUNK_SIZE, DEFAULT_THREAD_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::group::EntropySource;
use crate::handshake::{MAX_ITERATIONS, MAX_KEY_SIZE, MAX_NAME_SIZE, MAX_SALT_SIZE, MIN_KEY_SIZE};

/// Smallest socket timeout.
pub const MIN_SOCKET_TIMEOUT: Duration = Duration::from_secs(3);

/// Largest socket timeout.
pub const MAX_SOCKET_TIMEOUT: Duration = Duration::from_secs(60);

/// Router wait for the first request on a fresh connection.
pub const ROUTER_FIRST_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Router wait between requests on a kept-alive connection.
pub const ROUTER_READ_TIMEOUT: Duration = Duration::from_secs(180);

/// Largest error history.
pub const MAX_ERRORS: usize = 1024;

/// Most router connection tasks.
pub const MAX_THREADS: usize = 128;

/// Most concurrent downloads.
pub const MAX_DOWNLOADS: usize = 16;

/// Most shards per transfer.
pub const MAX_TRANSFER_THREADS: usize = 8;

/// Most retries per transfer.
pub const MAX_RETRIES: usize = 16;

fn default_cipher() -> String {
    "aes".to_string()
}

fn default_key_size() -> usize {
    256
}

fn default_hash() -> String {
    "sha256".to_string()
}

fn default_iterations() -> u32 {
    1
}

fn default_prime_size() -> usize {
    MIN_PRIME_SIZE
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    80
}

fn default_socket_timeout_ms() -> u64 {
    15_000
}

fn default_error_ms() -> u64 {
    3_000
}

fn default_idle_ms() -> u64 {
    500
}

fn default_sleep_ms() -> u64 {
    100
}

fn default_ping_ms() -> u64 {
    60_000
}

fn default_max_errors() -> usize {
    128
}

fn default_name() -> String {
    "anonymous".to_string()
}

fn default_threads() -> usize {
    32
}

fn default_max_transfers() -> usize {
    256
}

fn default_chunk_buffer() -> usize {
    8
}

fn default_upload_timeout_ms() -> u64 {
    30_000
}

fn default_relay_delay_ms() -> u64 {
    250
}

fn default_session_timeout_ms() -> u64 {
    600_000
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_transfers() -> usize {
    4
}

fn default_thread_size() -> u64 {
    DEFAULT_THREAD_SIZE
}

fn default_max_retries() -> usize {
    3
}

fn default_stall_ms() -> u64 {
    60_000
}

/// Negotiated key parameters plus the router passphrase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Cipher name
    #[serde(default = "default_cipher")]
    pub cipher: String,
    /// Key size in bits
    #[serde(default = "default_key_size")]
    pub key_size: usize,
    /// PBKDF hash name
    #[serde(default = "default_hash")]
    pub hash: String,
    /// PBKDF salt
    #[serde(default)]
    pub salt: String,
    /// PBKDF iterations
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// DH prime size in bits
    #[serde(default = "default_prime_size")]
    pub prime_size: usize,
    /// Router passphrase keying the bootstrap cipher
    #[serde(default)]
    pub passphrase: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            cipher: default_cipher(),
            key_size: default_key_size(),
            hash: default_hash(),
            salt: String::new(),
            iterations: default_iterations(),
            prime_size: default_prime_size(),
            passphrase: String::new(),
        }
    }
}

impl SecurityConfig {
    /// Parameters for session key derivation.
    #[must_use]
    pub fn key_parameters(&self) -> KeyParameters {
        KeyParameters {
            cipher: self.cipher.clone(),
            key_size: self.key_size,
            hash: self.hash.clone(),
            salt: self.salt.clone(),
            iterations: self.iterations,
        }
    }

    /// Passphrase, `None` when empty.
    #[must_use]
    pub fn passphrase(&self) -> Option<&str> {
        Some(self.passphrase.as_str()).filter(|p| !p.is_empty())
    }

    /// Check that a router would accept these parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.cipher.len() > MAX_NAME_SIZE || self.hash.len() > MAX_NAME_SIZE {
            return Err(Error::config("cipher and hash names are limited to 64 bytes"));
        }
        if !(MIN_KEY_SIZE..=MAX_KEY_SIZE).contains(&self.key_size) || self.key_size % 8 != 0 {
            return Err(Error::config("key size must be 128-256 bits in steps of 8"));
        }
        if self.salt.len() > MAX_SALT_SIZE {
            return Err(Error::config("salt is limited to 1024 bytes"));
        }
        if self.iterations == 0 || self.iterations > MAX_ITERATIONS {
            return Err(Error::config("iterations must be 1-100000"));
        }
        if !(MIN_PRIME_SIZE..=MAX_PRIME_SIZE).contains(&self.prime_size) {
            return Err(Error::config("prime size must be 128-4096 bits"));
        }
        Ok(())
    }
}

/// Settings shared by client and server machines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Router host
    #[serde(default = "default_address")]
    pub address: String,
    /// Router port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Display name sent on join
    #[serde(default = "default_name")]
    pub name: String,
    /// Per-operation socket timeout
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    /// Backoff after an error
    #[serde(default = "default_error_ms")]
    pub error_ms: u64,
    /// Idle pause between states
    #[serde(default = "default_idle_ms")]
    pub idle_ms: u64,
    /// Sleep poll granularity
    #[serde(default = "default_sleep_ms")]
    pub sleep_ms: u64,
    /// Interval between pings
    #[serde(default = "default_ping_ms")]
    pub ping_ms: u64,
    /// Error history cap
    #[serde(default = "default_max_errors")]
    pub max_errors: usize,
    /// Key parameters
    #[serde(default)]
    pub security: SecurityConfig,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            name: default_name(),
            socket_timeout_ms: default_socket_timeout_ms(),
            error_ms: default_error_ms(),
            idle_ms: default_idle_ms(),
            sleep_ms: default_sleep_ms(),
            ping_ms: default_ping_ms(),
            max_errors: default_max_errors(),
            security: SecurityConfig::default(),
        }
    }
}

impl MachineConfig {
    /// Socket timeout clamped to 3-60 s.
    #[must_use]
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms).clamp(MIN_SOCKET_TIMEOUT, MAX_SOCKET_TIMEOUT)
    }

    /// Error backoff.
    #[must_use]
    pub fn error_timeout(&self) -> Duration {
        Duration::from_millis(self.error_ms)
    }

    /// Idle pause.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }

    /// Sleep poll.
    #[must_use]
    pub fn sleep_timeout(&self) -> Duration {
        Duration::from_millis(self.sleep_ms.max(1))
    }

    /// Ping interval.
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_ms)
    }

    /// Error history cap, at most 1024.
    #[must_use]
    pub fn max_errors(&self) -> usize {
        self.max_errors.min(MAX_ERRORS)
    }

    /// Check the endpoint is usable. Machines report failures here as
    /// configuration warnings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty address or port 0.
    pub fn validate_endpoint(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(Error::config("router address is empty"));
        }
        if self.port == 0 {
            return Err(Error::config("router port is 0"));
        }
        Ok(())
    }

    /// Full validation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for the first invalid field.
    pub fn validate(&self) -> Result<()> {
        self.validate_endpoint()?;
        if self.name.len() > MAX_NAME_SIZE {
            return Err(Error::config("name is limited to 64 bytes"));
        }
        self.security.validate()
    }
}

/// Router settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Bind address
    #[serde(default = "default_bind_address")]
    pub address: String,
    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Concurrent connection tasks
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Relay slots
    #[serde(default = "default_max_transfers")]
    pub max_transfers: usize,
    /// Buffered chunks per relay slot
    #[serde(default = "default_chunk_buffer")]
    pub chunk_buffer: usize,
    /// Time before an unanswered chunk request is handed out again
    #[serde(default = "default_upload_timeout_ms")]
    pub upload_timeout_ms: u64,
    /// Delay suggested to relay peers that have nothing to do
    #[serde(default = "default_relay_delay_ms")]
    pub relay_delay_ms: u64,
    /// Idle time before a session is pruned
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    /// Per-operation socket timeout
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    /// Passphrase for the router cipher
    #[serde(default)]
    pub passphrase: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            address: default_bind_address(),
            port: default_port(),
            threads: default_threads(),
            max_transfers: default_max_transfers(),
            chunk_buffer: default_chunk_buffer(),
            upload_timeout_ms: default_upload_timeout_ms(),
            relay_delay_ms: default_relay_delay_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            socket_timeout_ms: default_socket_timeout_ms(),
            passphrase: String::new(),
        }
    }
}

impl RouterConfig {
    /// Connection tasks, 1-128.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.threads.clamp(1, MAX_THREADS)
    }

    /// Upload timeout.
    #[must_use]
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    /// Session idle timeout.
    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Socket timeout clamped to 3-60 s.
    #[must_use]
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms).clamp(MIN_SOCKET_TIMEOUT, MAX_SOCKET_TIMEOUT)
    }

    /// Passphrase, `None` when empty.
    #[must_use]
    pub fn passphrase(&self) -> Option<&str> {
        Some(self.passphrase.as_str()).filter(|p| !p.is_empty())
    }

    /// Validate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(Error::config("bind address is empty"));
        }
        if self.max_transfers == 0 {
            return Err(Error::config("max transfers must be at least 1"));
        }
        if self.chunk_buffer == 0 {
            return Err(Error::config("chunk buffer must be at least 1"));
        }
        Ok(())
    }
}

/// Transfer engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Concurrent downloads
    #[serde(default = "default_transfers")]
    pub max_downloads: usize,
    /// Concurrent uploads
    #[serde(default = "default_transfers")]
    pub max_uploads: usize,
    /// Shards per download
    #[serde(default = "default_transfers")]
    pub download_threads: usize,
    /// Shards per upload
    #[serde(default = "default_transfers")]
    pub upload_threads: usize,
    /// Files smaller than this use one shard
    #[serde(default = "default_thread_size")]
    pub thread_size: u64,
    /// Retry budget (0 disables retries)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Time without progress before a transfer is cancelled
    #[serde(default = "default_stall_ms")]
    pub stall_ms: u64,
    /// Uploads at or under this size jump the queue (0 disables)
    #[serde(default)]
    pub priority_size: u64,
    /// Extensions that jump the upload queue
    #[serde(default)]
    pub priority_extensions: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_downloads: default_transfers(),
            max_uploads: default_transfers(),
            download_threads: default_transfers(),
            upload_threads: default_transfers(),
            thread_size: default_thread_size(),
            max_retries: default_max_retries(),
            stall_ms: default_stall_ms(),
            priority_size: 0,
            priority_extensions: String::new(),
        }
    }
}

impl TransferConfig {
    /// Chunk size clamped to 1 KiB-32 MiB.
    #[must_use]
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
    }

    /// Concurrent downloads, at most 16.
    #[must_use]
    pub fn max_downloads(&self) -> usize {
        self.max_downloads.min(MAX_DOWNLOADS)
    }

    /// Concurrent uploads, at most 16.
    #[must_use]
    pub fn max_uploads(&self) -> usize {
        self.max_uploads.min(MAX_DOWNLOADS)
    }

    /// Shards per download, 1-8.
    #[must_use]
    pub fn download_threads(&self) -> usize {
        self.download_threads.clamp(1, MAX_TRANSFER_THREADS)
    }

    /// Shards per upload, 1-8.
    #[must_use]
    pub fn upload_threads(&self) -> usize {
        self.upload_threads.clamp(1, MAX_TRANSFER_THREADS)
    }

    /// Retry budget, at most 16.
    #[must_use]
    pub fn max_retries(&self) -> usize {
        self.max_retries.min(MAX_RETRIES)
    }

    /// Stall limit.
    #[must_use]
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_ms)
    }

    /// Validate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(Error::config("chunk size must be 1 KiB-32 MiB"));
        }
        if self.thread_size == 0 {
            return Err(Error::config("thread size must be positive"));
        }
        Ok(())
    }
}

/// Group entropy sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Sources in chain order
    #[serde(default)]
    pub sources: Vec<EntropySource>,
}

impl GroupConfig {
    /// Validate every source.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for the first invalid source.
    pub fn validate(&self) -> Result<()> {
        self.sources.iter().try_for_each(EntropySource::validate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let machine = MachineConfig::default();
        assert_eq!(machine.port, 80);
        assert_eq!(machine.socket_timeout(), Duration::from_secs(15));
        assert_eq!(machine.max_errors(), 128);

        let transfer = TransferConfig::default();
        assert_eq!(transfer.chunk_size(), 768 * 1024);
        assert_eq!(transfer.download_threads(), 4);
        assert_eq!(transfer.max_retries(), 3);

        let router = RouterConfig::default();
        assert_eq!(router.threads(), 32);
        assert!(router.validate().is_ok());
        assert!(SecurityConfig::default().validate().is_ok());
    }

    #[test]
    fn test_clamping() {
        let machine = MachineConfig {
            socket_timeout_ms: 10,
            max_errors: 5000,
            ..MachineConfig::default()
        };
        assert_eq!(machine.socket_timeout(), MIN_SOCKET_TIMEOUT);
        assert_eq!(machine.max_errors(), MAX_ERRORS);

        let transfer = TransferConfig {
            chunk_size: 1,
            download_threads: 0,
            max_downloads: 99,
            ..TransferConfig::default()
        };
        assert_eq!(transfer.chunk_size(), MIN_CHUNK_SIZE);
        assert_eq!(transfer.download_threads(), 1);
        assert_eq!(transfer.max_downloads(), MAX_DOWNLOADS);
    }

    #[test]
    fn test_security_validation() {
        let bad_key = SecurityConfig {
            key_size: 200 + 4,
            ..SecurityConfig::default()
        };
        assert!(bad_key.validate().unwrap_err().is_config());

        let bad_iterations = SecurityConfig {
            iterations: 100_001,
            ..SecurityConfig::default()
        };
        assert!(bad_iterations.validate().is_err());

        let bad_prime = SecurityConfig {
            prime_size: 8192,
            ..SecurityConfig::default()
        };
        assert!(bad_prime.validate().is_err());
    }

    #[test]
    fn test_endpoint_validation() {
        let machine = MachineConfig {
            address: " ".to_string(),
            ..MachineConfig::default()
        };
        assert!(machine.validate_endpoint().unwrap_err().is_config());

        let machine = MachineConfig {
            port: 0,
            ..MachineConfig::default()
        };
        assert!(machine.validate_endpoint().is_err());
    }

    #[test]
    fn test_partial_json() {
        let config: TransferConfig = serde_json::from_str(r#"{"chunk_size": 2048}"#).unwrap();
        assert_eq!(config.chunk_size, 2048);
        assert_eq!(config.max_uploads, 4);
    }
}
