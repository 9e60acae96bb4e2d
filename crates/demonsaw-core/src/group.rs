//! Group keys derived from shared entropy.
//!
//! Members of a group configure the same ordered list of entropy sources
//! (files, URLs or raw strings). Each enabled source yields one cipher; the
//! chain wraps transfer payloads and the group id is an HMAC fold over the
//! cipher keys:
//!
//! ```text
//! id_0 = ""
//! id_n = HMAC-SHA256(key = cipher_n.key, salt = cipher_n.name)(id_{n-1})
//! ```

use std::path::Path;
use std::time::Duration;

use demonsaw_crypto::{Cipher, Hmac, KeyParameters};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::handshake::{MAX_ITERATIONS, MAX_KEY_SIZE, MAX_NAME_SIZE, MAX_SALT_SIZE, MIN_KEY_SIZE};
use crate::status::Status;

fn default_true() -> bool {
    true
}

fn default_percent() -> u32 {
    100
}

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

/// One entropy source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntropySource {
    /// File path, URL or raw data
    pub entropy: String,
    /// Share of the file or URL body to use (0-100)
    #[serde(default = "default_percent")]
    pub percent: u32,
    /// Whether the source takes part
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Cipher name
    #[serde(default = "default_cipher")]
    pub cipher: String,
    /// Key size in bits
    #[serde(default = "default_key_size")]
    pub key_size: usize,
    /// PBKDF hash
    #[serde(default = "default_hash")]
    pub hash: String,
    /// PBKDF salt
    #[serde(default)]
    pub salt: String,
    /// PBKDF iterations
    #[serde(default = "default_iterations")]
    pub iterations: u32,
}

impl EntropySource {
    /// Raw-data source with default parameters.
    #[must_use]
    pub fn new(entropy: impl Into<String>) -> Self {
        Self {
            entropy: entropy.into(),
            percent: default_percent(),
            enabled: true,
            cipher: default_cipher(),
            key_size: default_key_size(),
            hash: default_hash(),
            salt: String::new(),
            iterations: default_iterations(),
        }
    }

    /// Whether the source is enabled and has entropy.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.enabled && !self.entropy.is_empty()
    }

    /// Key derivation parameters.
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

    /// Validate parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.percent > 100 {
            return Err(Error::config("entropy percent must be 0-100"));
        }
        if self.cipher.len() > MAX_NAME_SIZE || self.hash.len() > MAX_NAME_SIZE {
            return Err(Error::config("cipher and hash names are limited to 64 bytes"));
        }
        if !(MIN_KEY_SIZE..=MAX_KEY_SIZE).contains(&self.key_size) || self.key_size % 8 != 0 {
            return Err(Error::config("key size must be 128-256 bits in steps of 8"));
        }
        if self.salt.len() > MAX_SALT_SIZE || self.iterations > MAX_ITERATIONS {
            return Err(Error::config("salt or iterations out of range"));
        }
        Ok(())
    }
}

/// How a source's entropy is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntropyKind {
    /// Contents of an existing file
    File,
    /// Body of an `http`/`https` URL
    Url,
    /// The string itself
    Data,
}

/// Classify `entropy`: an existing file wins over a URL, anything else is
/// raw data.
#[must_use]
pub fn classify(entropy: &str) -> EntropyKind {
    if Path::new(entropy).is_file() {
        return EntropyKind::File;
    }
    match Url::parse(entropy) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => EntropyKind::Url,
        _ => EntropyKind::Data,
    }
}

fn truncate(mut data: Vec<u8>, percent: u32) -> Vec<u8> {
    let size = (u128::from(percent.min(100)) * data.len() as u128 / 100) as usize;
    data.truncate(size);
    data
}

async fn fetch(url: &str, timeout: Duration) -> Result<Vec<u8>> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout)
        .build()
        .map_err(|err| Error::Entropy(format!("HTTP client: {err}")))?;
    let fail = |err: reqwest::Error| Error::Entropy(format!("Invalid URL: {url} ({err})"));

    let mut response = client.get(url).send().await.map_err(fail)?;
    if response.status().is_redirection() {
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|location| response.url().join(location).ok());
        if let Some(location) = location {
            tracing::debug!("Following redirect to {}", location);
            response = client.get(location).send().await.map_err(fail)?;
        }
    }

    if response.status() != reqwest::StatusCode::OK {
        return Ok(Vec::new());
    }
    Ok(response.bytes().await.map_err(fail)?.to_vec())
}

async fn entropy_bytes(source: &EntropySource, timeout: Duration) -> Result<Vec<u8>> {
    match classify(&source.entropy) {
        EntropyKind::File => {
            let data = tokio::fs::read(&source.entropy).await?;
            let data = truncate(data, source.percent);
            if data.is_empty() {
                return Err(Error::Entropy(format!("Invalid file: {}", source.entropy)));
            }
            Ok(data)
        }
        EntropyKind::Url => {
            let data = truncate(fetch(&source.entropy, timeout).await?, source.percent);
            if data.is_empty() {
                return Err(Error::Entropy(format!("Invalid URL: {}", source.entropy)));
            }
            Ok(data)
        }
        EntropyKind::Data => Ok(source.entropy.as_bytes().to_vec()),
    }
}

/// A group: cipher chain plus the id folded from it.
pub struct Group {
    id: Vec<u8>,
    chain: Vec<Box<dyn Cipher>>,
}

impl Group {
    /// Derive the group from `sources` in order. Returns the group (or the
    /// first failure, which discards the partial chain) together with one
    /// status per source.
    pub async fn build(sources: &[EntropySource], timeout: Duration) -> (Result<Group>, Vec<Status>) {
        let mut statuses = vec![Status::None; sources.len()];
        let mut group = Group {
            id: Vec::new(),
            chain: Vec::new(),
        };

        for (index, source) in sources.iter().enumerate() {
            if !source.is_active() {
                continue;
            }
            statuses[index] = Status::Pending;
            match group.push(source, timeout).await {
                Ok(()) => statuses[index] = Status::Success,
                Err(err) => {
                    statuses[index] = Status::Error;
                    tracing::warn!("Group entropy source {} failed: {}", index, err);
                    return (Err(err), statuses);
                }
            }
        }

        if !group.is_empty() {
            tracing::info!("Group {} ({} ciphers)", group.id(), group.len());
        }
        (Ok(group), statuses)
    }

    async fn push(&mut self, source: &EntropySource, timeout: Duration) -> Result<()> {
        let data = entropy_bytes(source, timeout).await?;
        let cipher = source.key_parameters().create_cipher(&data)?;

        let mut hmac = Hmac::new("sha256");
        hmac.set_key(cipher.key());
        hmac.set_salt(source.cipher.as_bytes());
        self.id = hmac.compute(&self.id)?;
        self.chain.push(cipher);
        Ok(())
    }

    /// Hex group id, empty when no source contributed.
    #[must_use]
    pub fn id(&self) -> String {
        hex::encode(&self.id)
    }

    /// Number of ciphers in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Encrypt through the chain in order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Crypto`] if a layer fails.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = data.to_vec();
        for cipher in &self.chain {
            out = cipher.encrypt(&out)?;
        }
        Ok(out)
    }

    /// Unwrap the chain in reverse order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Crypto`] if a layer fails to authenticate.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = data.to_vec();
        for cipher in self.chain.iter().rev() {
            out = cipher.decrypt(&out)?;
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id())
            .field("ciphers", &self.chain.iter().map(|c| c.name()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn build(sources: &[EntropySource]) -> Group {
        let (group, _) = Group::build(sources, TIMEOUT).await;
        group.unwrap()
    }

    #[test]
    fn test_classify() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(classify(file.path().to_str().unwrap()), EntropyKind::File);
        assert_eq!(classify("https://example.com/seed"), EntropyKind::Url);
        assert_eq!(classify("ftp://example.com/seed"), EntropyKind::Data);
        assert_eq!(classify("correct horse battery staple"), EntropyKind::Data);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate(vec![1; 10], 50).len(), 5);
        assert_eq!(truncate(vec![1; 10], 100).len(), 10);
        assert_eq!(truncate(vec![1; 3], 10).len(), 0);
    }

    #[tokio::test]
    async fn test_deterministic() {
        let sources = [EntropySource::new("alpha"), EntropySource::new("beta")];
        let a = build(&sources).await;
        let b = build(&sources).await;
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().len(), 64);
        assert_eq!(a.len(), 2);
    }

    #[tokio::test]
    async fn test_order_sensitive() {
        let ab = build(&[EntropySource::new("alpha"), EntropySource::new("beta")]).await;
        let ba = build(&[EntropySource::new("beta"), EntropySource::new("alpha")]).await;
        assert_ne!(ab.id(), ba.id());
    }

    #[tokio::test]
    async fn test_skips_inactive() {
        let disabled = EntropySource {
            enabled: false,
            ..EntropySource::new("gamma")
        };
        let (group, statuses) = Group::build(
            &[EntropySource::new("alpha"), disabled, EntropySource::new("")],
            TIMEOUT,
        )
        .await;
        let group = group.unwrap();
        assert_eq!(group.len(), 1);
        assert_eq!(statuses, vec![Status::Success, Status::None, Status::None]);
        assert_eq!(group.id(), build(&[EntropySource::new("alpha")]).await.id());
    }

    #[tokio::test]
    async fn test_empty_chain() {
        let group = build(&[]).await;
        assert!(group.id().is_empty());
        assert_eq!(group.encrypt(b"plain").unwrap(), b"plain");
    }

    #[tokio::test]
    async fn test_file_source_percent() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let half = build(&[EntropySource {
            percent: 50,
            ..EntropySource::new(path.clone())
        }])
        .await;
        let full = build(&[EntropySource::new(path)]).await;
        assert_ne!(half.id(), full.id());
        assert_eq!(half.id(), build(&[EntropySource::new("01234")]).await.id());
    }

    #[tokio::test]
    async fn test_empty_file_fails() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let sources = [
            EntropySource::new("alpha"),
            EntropySource::new(file.path().to_str().unwrap()),
        ];
        let (group, statuses) = Group::build(&sources, TIMEOUT).await;
        assert!(matches!(group, Err(Error::Entropy(_))));
        assert_eq!(statuses, vec![Status::Success, Status::Error]);
    }

    #[tokio::test]
    async fn test_chain_round_trip() {
        let group = build(&[
            EntropySource::new("alpha"),
            EntropySource {
                cipher: "xchacha20".to_string(),
                ..EntropySource::new("beta")
            },
        ])
        .await;
        let sealed = group.encrypt(b"chunk").unwrap();
        assert_eq!(group.decrypt(&sealed).unwrap(), b"chunk");

        let other = build(&[EntropySource::new("alpha")]).await;
        assert!(other.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(EntropySource::new("x").validate().is_ok());
        let bad = EntropySource {
            percent: 101,
            ..EntropySource::new("x")
        };
        assert!(bad.validate().unwrap_err().is_config());
    }
}
