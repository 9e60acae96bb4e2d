//! Session handshake.
//!
//! ```text
//! Client                                   Router
//!   | init DH (prime_size)                    |
//!   |-- handshake {p, g, A, cipher, ...} ---->|  sealed with router cipher
//!   |                                         |  rebuild DH, s = B^a
//!   |                                         |  key = PBKDF(s), assign id
//!   |<------- {version, B, id} ---------------|  sealed with router cipher
//!   | s = A^b, key = PBKDF(s)                 |
//!   | install cipher, wipe DH                 |
//! ```
//!
//! Both ends derive the session cipher as
//! `cipher(PBKDF(hash, salt, iterations)(s, key_size / 8))`.

use std::sync::Arc;

use demonsaw_crypto::dh::MIN_PRIME_SIZE;
use demonsaw_crypto::{DiffieHellman, KeyParameters};
use serde::{Deserialize, Serialize};

use crate::VERSION;
use crate::config::SecurityConfig;
use crate::error::{Error, Result};
use crate::registry::{Peer, SessionRegistry};
use crate::session::{Session, short_id};

/// Smallest negotiable key size in bits.
pub const MIN_KEY_SIZE: usize = 128;

/// Largest negotiable key size in bits.
pub const MAX_KEY_SIZE: usize = 256;

/// Longest cipher or hash name.
pub const MAX_NAME_SIZE: usize = 64;

/// Longest salt.
pub const MAX_SALT_SIZE: usize = 1024;

/// Most PBKDF iterations.
pub const MAX_ITERATIONS: u32 = 100_000;

/// Longest hex-encoded DH value (4096 bits plus a sign byte).
const MAX_DH_HEX: usize = 2 * (4096 / 8 + 1);

/// Client to router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Client version
    pub version: String,
    /// DH prime, hex
    pub prime: String,
    /// DH generator
    pub generator: u32,
    /// Client public value, hex
    pub public_key: String,
    /// Cipher name
    pub cipher: String,
    /// Key size in bits
    pub key_size: usize,
    /// PBKDF hash
    pub hash: String,
    /// PBKDF salt
    #[serde(default)]
    pub salt: String,
    /// PBKDF iterations
    pub iterations: u32,
}

impl HandshakeRequest {
    /// Key parameters carried by this request.
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

    /// Enforce the router's size limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] naming the first violated limit.
    pub fn validate(&self) -> Result<()> {
        if self.prime.len() > MAX_DH_HEX || self.public_key.len() > MAX_DH_HEX {
            return Err(Error::protocol("DH value too large"));
        }
        if self.cipher.len() > MAX_NAME_SIZE || self.hash.len() > MAX_NAME_SIZE {
            return Err(Error::protocol("algorithm name too long"));
        }
        if !(MIN_KEY_SIZE..=MAX_KEY_SIZE).contains(&self.key_size) || self.key_size % 8 != 0 {
            return Err(Error::protocol("unsupported key size"));
        }
        if self.salt.len() > MAX_SALT_SIZE {
            return Err(Error::protocol("salt too long"));
        }
        if self.iterations > MAX_ITERATIONS {
            return Err(Error::protocol("too many iterations"));
        }
        if self.version.len() > MAX_NAME_SIZE {
            return Err(Error::protocol("version too long"));
        }
        Ok(())
    }
}

/// Router to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Router version
    pub version: String,
    /// Router public value, hex
    pub public_key: String,
    /// Assigned session id
    pub id: String,
}

fn decode_hex(value: &str) -> Result<Vec<u8>> {
    hex::decode(value).map_err(|_| Error::protocol("malformed hex value"))
}

// ============ Client Side ============

/// Start a handshake: select a DH group and build the request.
///
/// `full` selects the configured prime size; otherwise the minimum is used.
/// The caller seals the request with the router cipher.
///
/// # Errors
///
/// Returns [`Error::Crypto`] if key generation fails.
pub fn client_request(
    session: &mut Session,
    security: &SecurityConfig,
    full: bool,
) -> Result<HandshakeRequest> {
    let bits = if full {
        security.prime_size
    } else {
        MIN_PRIME_SIZE
    };
    let dh = session.dh_mut();
    dh.init(bits)?;

    Ok(HandshakeRequest {
        version: VERSION.to_string(),
        prime: hex::encode(dh.prime()),
        generator: dh.generator(),
        public_key: hex::encode(dh.public_key()),
        cipher: security.cipher.clone(),
        key_size: security.key_size,
        hash: security.hash.clone(),
        salt: security.salt.clone(),
        iterations: security.iterations,
    })
}

/// Finish a handshake: derive and install the session cipher, store the id
/// and wipe DH state. Returns the router version.
///
/// The session is left untouched (apart from the DH state) when the
/// router's public value is rejected.
///
/// # Errors
///
/// Returns [`Error::Protocol`] for malformed fields and [`Error::Crypto`]
/// when key agreement or derivation fails.
pub fn client_response(
    session: &mut Session,
    security: &SecurityConfig,
    response: &HandshakeResponse,
) -> Result<String> {
    if response.id.is_empty() {
        return Err(Error::protocol("router assigned no session id"));
    }
    let public = decode_hex(&response.public_key)?;
    let result = session
        .dh_mut()
        .compute(&public)
        .map_err(Error::from)
        .and_then(|shared| Ok(security.key_parameters().create_cipher(shared)?));
    session.dh_mut().clear();
    let cipher = result?;

    session.set_id(response.id.clone());
    session.set_cipher(cipher);
    tracing::debug!("Handshake complete, session {}", short_id(&response.id));
    Ok(response.version.clone())
}

// ============ Router Side ============

/// Answer a handshake for `peer`: agree on a key, assign (or migrate) the
/// session id, record the peer version and install the new cipher.
///
/// Nothing is mutated when the request is rejected.
///
/// # Errors
///
/// Returns [`Error::Protocol`] for limit violations and malformed fields, and
/// [`Error::Crypto`] for an invalid group or public value. Both map to bad
/// request.
pub fn respond(
    registry: &SessionRegistry,
    peer: &Arc<Peer>,
    request: &HandshakeRequest,
) -> Result<HandshakeResponse> {
    request.validate()?;
    let prime = decode_hex(&request.prime)?;
    let client_public = decode_hex(&request.public_key)?;

    let mut dh = DiffieHellman::from_parameters(&prime, request.generator)?;
    let shared = dh.compute(&client_public)?;
    let cipher = request.key_parameters().create_cipher(shared)?;
    let public_key = hex::encode(dh.public_key());
    dh.clear();

    let id = registry.assign(peer)?;
    peer.set_version(request.version.clone());
    peer.session().set_cipher(cipher);
    peer.touch();

    tracing::info!(
        "Session {} negotiated {} ({} bits)",
        short_id(&id),
        request.cipher,
        request.key_size
    );
    Ok(HandshakeResponse {
        version: VERSION.to_string(),
        public_key,
        id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;

    fn exchange(security: &SecurityConfig) -> (Session, Arc<Peer>, SessionRegistry) {
        let registry = SessionRegistry::new(EventBus::new());
        let peer = Arc::new(Peer::new(Session::new()));
        let mut client = Session::new();

        let request = client_request(&mut client, security, true).unwrap();
        let response = respond(&registry, &peer, &request).unwrap();
        let version = client_response(&mut client, security, &response).unwrap();
        assert_eq!(version, VERSION);
        (client, peer, registry)
    }

    #[test]
    fn test_round_trip() {
        let security = SecurityConfig::default();
        let (client, peer, registry) = exchange(&security);

        assert_eq!(client.id(), peer.id());
        assert!(registry.get(client.id()).is_some());
        assert!(!client.dh().is_initialized());
        assert_eq!(peer.version(), VERSION);

        let sealed = client.encrypt(b"ping").unwrap();
        assert_eq!(peer.session().decrypt(&sealed).unwrap(), b"ping");
        assert!(Session::new().decrypt(&sealed).is_err());
    }

    #[test]
    fn test_round_trip_custom_parameters() {
        let security = SecurityConfig {
            cipher: "xchacha20".to_string(),
            hash: "sha512".to_string(),
            salt: "pepper".to_string(),
            iterations: 10,
            prime_size: 768,
            ..SecurityConfig::default()
        };
        let (client, peer, _) = exchange(&security);
        assert_eq!(client.cipher().name(), "xchacha20");
        let sealed = peer.session().encrypt(b"pong").unwrap();
        assert_eq!(client.decrypt(&sealed).unwrap(), b"pong");
    }

    #[test]
    fn test_minimum_prime_when_not_full() {
        let security = SecurityConfig {
            prime_size: 2048,
            ..SecurityConfig::default()
        };
        let mut session = Session::new();
        let request = client_request(&mut session, &security, false).unwrap();
        assert!(session.dh().prime_size() < 2048);
        assert!(!request.prime.is_empty());
    }

    #[test]
    fn test_rejects_without_mutation() {
        let registry = SessionRegistry::default();
        let peer = Arc::new(Peer::new(Session::new()));
        let mut client = Session::new();
        let mut request = client_request(&mut client, &SecurityConfig::default(), true).unwrap();
        request.public_key = "01".to_string();

        let err = respond(&registry, &peer, &request).unwrap_err();
        assert_eq!(err.status(), crate::http::HttpStatus::BadRequest);
        assert!(registry.is_empty());
        assert!(peer.id().is_empty());
        assert!(peer.version().is_empty());
    }

    #[test]
    fn test_limits() {
        let mut client = Session::new();
        let base = client_request(&mut client, &SecurityConfig::default(), true).unwrap();

        for request in [
            HandshakeRequest { key_size: 264, ..base.clone() },
            HandshakeRequest { key_size: 130, ..base.clone() },
            HandshakeRequest { iterations: 100_001, ..base.clone() },
            HandshakeRequest { salt: "s".repeat(1025), ..base.clone() },
            HandshakeRequest { cipher: "c".repeat(65), ..base.clone() },
            HandshakeRequest { prime: "ff".repeat(600), ..base.clone() },
        ] {
            assert!(matches!(request.validate(), Err(Error::Protocol(_))));
        }
        assert!(base.validate().is_ok());
    }

    #[test]
    fn test_even_prime_rejected() {
        let registry = SessionRegistry::default();
        let peer = Arc::new(Peer::new(Session::new()));
        let mut client = Session::new();
        let mut request = client_request(&mut client, &SecurityConfig::default(), true).unwrap();
        let last = request.prime.len() - 1;
        request.prime.replace_range(last.., "e");

        assert!(matches!(respond(&registry, &peer, &request), Err(Error::Crypto(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_client_rejects_bad_public_key() {
        let security = SecurityConfig::default();
        let mut client = Session::new();
        client_request(&mut client, &security, true).unwrap();
        let response = HandshakeResponse {
            version: VERSION.to_string(),
            public_key: "00".to_string(),
            id: "abc".to_string(),
        };
        assert!(client_response(&mut client, &security, &response).is_err());
        assert!(client.id().is_empty());
    }
}
