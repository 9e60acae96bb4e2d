//! Finite-field Diffie-Hellman key agreement.
//!
//! The initiating side picks a group sized to its configured prime length and
//! sends the prime, generator and its public value. The responder rebuilds the
//! group from those values, so any validated group is accepted on the wire.
//!
//! Groups are the well-known safe-prime MODP groups (RFC 2409 / RFC 3526),
//! 768 to 4096 bits. A requested size selects the smallest group at least
//! that large. Peer-supplied primes must pass trial division and a
//! Miller-Rabin test before they are used.
//!
//! All integers travel big-endian; public values and shared secrets are
//! left-padded to the prime's byte length.

use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};
use zeroize::Zeroizing;

use crate::CryptoError;
use crate::random::fill_random;

/// Smallest prime size a peer may request, in bits.
pub const MIN_PRIME_SIZE: usize = 128;

/// Largest prime size accepted from a peer, in bits.
pub const MAX_PRIME_SIZE: usize = 4096;

/// Default prime size, in bits.
pub const DEFAULT_PRIME_SIZE: usize = MIN_PRIME_SIZE;

/// Generator shared by every built-in group.
pub const GENERATOR: u32 = 2;

/// Algorithm name announced on the wire.
pub const NAME: &str = "dh";

const MODP_768: &str = "\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
    020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
    4FE1356D6D51C245E485B576625E7EC6F44C42E9A63A3620FFFFFFFFFFFFFFFF";

const MODP_1024: &str = "\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
    020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
    4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF";

const MODP_1536: &str = "\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
    020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
    4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
    98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
    9ED529077096966D670C354E4ABC9804F1746C08CA237327FFFFFFFFFFFFFFFF";

const MODP_2048: &str = "\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
    020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
    4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
    98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
    9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
    E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
    3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

const MODP_3072: &str = "\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
    020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
    4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
    98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
    9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
    E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
    3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33\
    A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7\
    ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864\
    D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2\
    08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF";

const MODP_4096: &str = "\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
    020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
    4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
    98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
    9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
    E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
    3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33\
    A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7\
    ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864\
    D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2\
    08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A92108011A723C12A787E6D7\
    88719A10BDBA5B2699C327186AF4E23C1A946834B6150BDA2583E9CA2AD44CE8\
    DBBBC2DB04DE8EF92E8EFC141FBECAA6287C59474E6BC05D99B2964FA090C3A2\
    233BA186515BE7ED1F612970CEE2D7AFB81BDD762170481CD0069127D5B05AA9\
    93B4EA988D8FDDC186FFB7DC90A6C08F4DF435C934063199FFFFFFFFFFFFFFFF";

const GROUPS: [(usize, &str); 6] = [
    (768, MODP_768),
    (1024, MODP_1024),
    (1536, MODP_1536),
    (2048, MODP_2048),
    (3072, MODP_3072),
    (4096, MODP_4096),
];

/// Odd primes below 256, for trial division of peer primes.
const SMALL_PRIMES: [u32; 53] = [
    3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97,
    101, 103, 107, 109, 113, 127, 131, 137, 139, 149, 151, 157, 163, 167, 173, 179, 181, 191, 193,
    197, 199, 211, 223, 227, 229, 233, 239, 241, 251,
];

/// Miller-Rabin rounds with random bases, on top of base 2.
const PRIME_ROUNDS: usize = 4;

fn group_prime(bits: usize) -> Result<BigUint, CryptoError> {
    let hex = GROUPS
        .iter()
        .find(|(size, _)| *size >= bits)
        .or_else(|| GROUPS.last())
        .map(|(_, hex)| *hex)
        .ok_or(CryptoError::InvalidGroup("no group available"))?;
    BigUint::parse_bytes(hex.as_bytes(), 16).ok_or(CryptoError::InvalidGroup("malformed prime"))
}

/// Miller-Rabin with base 2 and `rounds` random bases. `n` must be odd and
/// larger than the biggest small prime.
fn probably_prime(n: &BigUint, rounds: usize) -> Result<bool, CryptoError> {
    if SMALL_PRIMES.iter().any(|&small| (n % small).is_zero()) {
        return Ok(false);
    }

    let one = BigUint::one();
    let n_minus_one = n - &one;
    let shift = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> shift;
    let witness = |base: &BigUint| {
        let mut x = base.modpow(&d, n);
        if x == one || x == n_minus_one {
            return false;
        }
        for _ in 1..shift {
            x = x.modpow(&BigUint::from(2u32), n);
            if x == n_minus_one {
                return false;
            }
        }
        true
    };

    if witness(&BigUint::from(2u32)) {
        return Ok(false);
    }
    let span = n - BigUint::from(4u32);
    let mut raw = vec![0u8; n.to_bytes_be().len()];
    for _ in 0..rounds {
        fill_random(&mut raw)?;
        let base = BigUint::from_bytes_be(&raw) % &span + BigUint::from(2u32);
        if witness(&base) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn to_padded_bytes(value: &BigUint, len: usize) -> Vec<u8> {
    let raw = value.to_bytes_be();
    if raw.len() >= len {
        return raw;
    }
    let mut out = vec![0u8; len - raw.len()];
    out.extend_from_slice(&raw);
    out
}

/// Diffie-Hellman agreement state.
///
/// Private, public and shared material are wiped by [`DiffieHellman::clear`]
/// and on drop.
#[derive(Default)]
pub struct DiffieHellman {
    prime: Option<BigUint>,
    generator: u32,
    private_key: Zeroizing<Vec<u8>>,
    public_key: Vec<u8>,
    shared_key: Zeroizing<Vec<u8>>,
}

impl DiffieHellman {
    /// Empty, uninitialized state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Select a group of at least `bits` and generate a key pair.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if key generation fails.
    pub fn init(&mut self, bits: usize) -> Result<(), CryptoError> {
        let bits = bits.clamp(MIN_PRIME_SIZE, MAX_PRIME_SIZE);
        let prime = group_prime(bits)?;
        self.install(prime, GENERATOR)
    }

    /// Rebuild a group from peer-supplied parameters and generate a key pair.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidGroup`] if the prime is even, outside the
    /// accepted size range or composite, or the generator is not in
    /// `(1, p-1)`.
    pub fn from_parameters(prime: &[u8], generator: u32) -> Result<Self, CryptoError> {
        let p = BigUint::from_bytes_be(prime);
        let bits = usize::try_from(p.bits()).unwrap_or(usize::MAX);
        if bits < MIN_PRIME_SIZE {
            return Err(CryptoError::InvalidGroup("prime too small"));
        }
        if bits > MAX_PRIME_SIZE {
            return Err(CryptoError::InvalidGroup("prime too large"));
        }
        if (&p % 2u32).is_zero() {
            return Err(CryptoError::InvalidGroup("prime must be odd"));
        }
        let g = BigUint::from(generator);
        if g <= BigUint::one() || g >= &p - BigUint::one() {
            return Err(CryptoError::InvalidGroup("generator out of range"));
        }
        if !probably_prime(&p, PRIME_ROUNDS)? {
            return Err(CryptoError::InvalidGroup("prime is composite"));
        }

        let mut dh = Self::new();
        dh.install(p, generator)?;
        Ok(dh)
    }

    fn install(&mut self, prime: BigUint, generator: u32) -> Result<(), CryptoError> {
        self.clear();
        let len = prime.to_bytes_be().len();
        let upper = &prime - BigUint::from(2u32);

        // Private exponent in [2, p-2]
        let mut raw = Zeroizing::new(vec![0u8; len]);
        let exponent = loop {
            fill_random(&mut raw)?;
            let candidate = BigUint::from_bytes_be(&raw) % &upper;
            if candidate > BigUint::one() {
                break candidate;
            }
        };

        let public = BigUint::from(generator).modpow(&exponent, &prime);
        self.private_key = Zeroizing::new(to_padded_bytes(&exponent, len));
        self.public_key = to_padded_bytes(&public, len);
        self.generator = generator;
        self.prime = Some(prime);
        Ok(())
    }

    /// Derive the shared secret from the peer's public value.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] before a group is selected and
    /// [`CryptoError::InvalidPublicKey`] if the peer value is outside
    /// `[2, p-2]` or the agreement degenerates to 1.
    pub fn compute(&mut self, peer_public: &[u8]) -> Result<&[u8], CryptoError> {
        let prime = self.prime.as_ref().ok_or(CryptoError::InvalidState)?;
        let peer = BigUint::from_bytes_be(peer_public);
        let p_minus_one = prime - BigUint::one();
        if peer <= BigUint::one() || peer >= p_minus_one {
            return Err(CryptoError::InvalidPublicKey);
        }

        let exponent = BigUint::from_bytes_be(&self.private_key);
        let shared = peer.modpow(&exponent, prime);
        if shared <= BigUint::one() {
            return Err(CryptoError::InvalidPublicKey);
        }

        let len = prime.to_bytes_be().len();
        self.shared_key = Zeroizing::new(to_padded_bytes(&shared, len));
        Ok(self.shared_key.as_slice())
    }

    /// Prime as big-endian bytes (empty before init).
    #[must_use]
    pub fn prime(&self) -> Vec<u8> {
        self.prime.as_ref().map(BigUint::to_bytes_be).unwrap_or_default()
    }

    /// Prime size in bits (0 before init).
    #[must_use]
    pub fn prime_size(&self) -> usize {
        self.prime
            .as_ref()
            .and_then(|p| p.bits().to_usize())
            .unwrap_or(0)
    }

    /// Generator.
    #[must_use]
    pub fn generator(&self) -> u32 {
        self.generator
    }

    /// Local public value.
    #[must_use]
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Shared secret (empty until [`DiffieHellman::compute`] succeeds).
    #[must_use]
    pub fn shared_key(&self) -> &[u8] {
        &self.shared_key
    }

    /// Whether a group has been selected.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.prime.is_some()
    }

    /// Wipe all key material and forget the group.
    pub fn clear(&mut self) {
        self.prime = None;
        self.generator = 0;
        self.private_key = Zeroizing::new(Vec::new());
        self.public_key.clear();
        self.shared_key = Zeroizing::new(Vec::new());
    }
}

impl std::fmt::Debug for DiffieHellman {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffieHellman")
            .field("prime_size", &self.prime_size())
            .field("generator", &self.generator)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_secret_agreement() {
        let mut client = DiffieHellman::new();
        client.init(DEFAULT_PRIME_SIZE).unwrap();

        let mut router = DiffieHellman::from_parameters(&client.prime(), client.generator()).unwrap();
        let router_secret = router.compute(client.public_key()).unwrap().to_vec();
        let client_secret = client.compute(router.public_key()).unwrap().to_vec();

        // Both parties compute the same shared secret
        assert_eq!(client_secret, router_secret);
        assert_eq!(client_secret.len(), client.prime().len());
    }

    #[test]
    fn test_init_selects_group_by_size() {
        let mut dh = DiffieHellman::new();
        dh.init(128).unwrap();
        assert_eq!(dh.prime_size(), 768);
        dh.init(1025).unwrap();
        assert_eq!(dh.prime_size(), 1536);
        dh.init(2049).unwrap();
        assert_eq!(dh.prime_size(), 3072);
        dh.init(MAX_PRIME_SIZE).unwrap();
        assert_eq!(dh.prime_size(), 4096);
        dh.init(MAX_PRIME_SIZE * 2).unwrap();
        assert_eq!(dh.prime_size(), 4096);
    }

    #[test]
    fn test_builtin_groups_are_prime() {
        for (bits, hex) in GROUPS {
            let prime = BigUint::parse_bytes(hex.as_bytes(), 16).unwrap();
            assert_eq!(prime.bits(), bits as u64);
            assert!(probably_prime(&prime, 2).unwrap(), "{bits}");
        }
    }

    #[test]
    fn test_large_group_agreement() {
        let mut client = DiffieHellman::new();
        client.init(4096).unwrap();
        let mut router = DiffieHellman::from_parameters(&client.prime(), client.generator()).unwrap();
        let router_secret = router.compute(client.public_key()).unwrap().to_vec();
        assert_eq!(client.compute(router.public_key()).unwrap(), router_secret.as_slice());
        assert_eq!(router_secret.len(), 512);
    }

    #[test]
    fn test_rejects_composite_prime() {
        // (2^127 - 1) * (2^89 - 1): odd, 216 bits, no small factor
        let composite = ((BigUint::one() << 127u32) - 1u32) * ((BigUint::one() << 89u32) - 1u32);
        assert!(matches!(
            DiffieHellman::from_parameters(&composite.to_bytes_be(), GENERATOR),
            Err(CryptoError::InvalidGroup("prime is composite"))
        ));

        // Odd with a small factor
        let mut factored = vec![0xFFu8; 96];
        factored[95] = 0xFD;
        let value = BigUint::from_bytes_be(&factored) * 3u32;
        assert!(DiffieHellman::from_parameters(&value.to_bytes_be(), GENERATOR).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_public() {
        let mut dh = DiffieHellman::new();
        dh.init(768).unwrap();
        assert!(matches!(dh.compute(&[1]), Err(CryptoError::InvalidPublicKey)));
        assert!(matches!(dh.compute(&[0]), Err(CryptoError::InvalidPublicKey)));

        let p_minus_one = BigUint::from_bytes_be(&dh.prime()) - BigUint::one();
        assert!(dh.compute(&p_minus_one.to_bytes_be()).is_err());
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(DiffieHellman::from_parameters(&[], GENERATOR).is_err());
        assert!(DiffieHellman::from_parameters(&[0xFF; 8], GENERATOR).is_err());

        let mut even = vec![0xFFu8; 96];
        even[95] = 0xFE;
        assert!(DiffieHellman::from_parameters(&even, GENERATOR).is_err());

        let odd = vec![0xFFu8; 96];
        assert!(DiffieHellman::from_parameters(&odd, 1).is_err());
        assert!(DiffieHellman::from_parameters(&vec![0xFFu8; 600], GENERATOR).is_err());
    }

    #[test]
    fn test_compute_before_init() {
        let mut dh = DiffieHellman::new();
        assert!(matches!(dh.compute(&[5]), Err(CryptoError::InvalidState)));
    }

    #[test]
    fn test_clear_wipes_material() {
        let mut a = DiffieHellman::new();
        a.init(768).unwrap();
        let b = DiffieHellman::from_parameters(&a.prime(), a.generator()).unwrap();
        a.compute(b.public_key()).unwrap();

        a.clear();
        assert!(!a.is_initialized());
        assert!(a.public_key().is_empty());
        assert!(a.shared_key().is_empty());
    }
}
