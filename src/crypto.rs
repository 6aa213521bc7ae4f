use std::fmt;
use std::path::Path;

use pqcrypto_falcon::falcon512;
use pqcrypto_traits::sign::{DetachedSignature, PublicKey, SecretKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Sha3_256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::NetworkParams;
use crate::error::CoreError;
use crate::Result;

/// 256-bit content hash. The same primitive (SHA3-256) is used for
/// transaction hashes, merkle nodes, address derivation and proof of work.
pub type Hash32 = [u8; 32];

/// Falcon-512 public key size in bytes.
pub const FALCON_PUBKEY_SIZE: usize = falcon512::public_key_bytes();

/// Falcon-512 secret key size in bytes.
pub const FALCON_SECKEY_SIZE: usize = falcon512::secret_key_bytes();

/// Upper bound on a detached Falcon-512 signature. Signatures are variable
/// length; anything above this is rejected before parsing.
pub const FALCON_SIG_MAX_SIZE: usize = falcon512::signature_bytes();

/// SHA3-256 of `data`.
pub fn hash256(data: &[u8]) -> Hash32 {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA3-256 over the concatenation of two nodes (merkle interior hash).
pub fn hash256_pair(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut hasher = Sha3_256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Constant-time byte comparison.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Falcon-512 keypair. The secret key is zeroized on drop and never leaves
/// the process through serialization.
#[derive(Clone, ZeroizeOnDrop)]
pub struct FalconKeypair {
    #[zeroize(skip)]
    public_key: Vec<u8>,
    secret_key: Vec<u8>,
}

impl FalconKeypair {
    /// Generate a fresh keypair from the OS entropy source.
    pub fn generate() -> Self {
        let (pk, sk) = falcon512::keypair();
        Self {
            public_key: pk.as_bytes().to_vec(),
            secret_key: sk.as_bytes().to_vec(),
        }
    }

    /// Rebuild a keypair from raw key material, validating sizes and that
    /// the two halves actually belong together.
    pub fn from_bytes(public_key: Vec<u8>, secret_key: Vec<u8>) -> Result<Self> {
        if public_key.len() != FALCON_PUBKEY_SIZE {
            return Err(CoreError::Crypto(format!(
                "bad public key size: expected {FALCON_PUBKEY_SIZE}, got {}",
                public_key.len()
            )));
        }
        if secret_key.len() != FALCON_SECKEY_SIZE {
            return Err(CoreError::Crypto(format!(
                "bad secret key size: expected {FALCON_SECKEY_SIZE}, got {}",
                secret_key.len()
            )));
        }
        let keypair = Self { public_key, secret_key };
        let probe = keypair.sign(b"keypair-consistency-probe")?;
        if !verify(&keypair.public_key, b"keypair-consistency-probe", &probe) {
            return Err(CoreError::Crypto("public and secret key do not match".into()));
        }
        Ok(keypair)
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Detached signature over `message`. Variable length, at most
    /// [`FALCON_SIG_MAX_SIZE`] bytes.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let sk = falcon512::SecretKey::from_bytes(&self.secret_key)
            .map_err(|e| CoreError::Crypto(format!("invalid secret key: {e:?}")))?;
        let sig = falcon512::detached_sign(message, &sk);
        Ok(sig.as_bytes().to_vec())
    }

    /// Address of this keypair's public key on the given network.
    pub fn address(&self, params: &NetworkParams) -> Address {
        Address::from_public_key(params.address_version, &self.public_key)
    }

    /// Persist the keypair as a JSON file with hex-encoded key material.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let record = KeyFile {
            public_key: hex::encode(&self.public_key),
            secret_key: hex::encode(&self.secret_key),
        };
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| CoreError::Crypto(format!("cannot serialize key file: {e}")))?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let mut record: KeyFile = serde_json::from_str(&text)
            .map_err(|e| CoreError::Crypto(format!("cannot parse key file: {e}")))?;
        let public_key = hex::decode(&record.public_key)
            .map_err(|e| CoreError::Crypto(format!("bad public key hex: {e}")))?;
        let mut secret_hex = std::mem::take(&mut record.secret_key);
        let secret_key = hex::decode(&secret_hex)
            .map_err(|e| CoreError::Crypto(format!("bad secret key hex: {e}")))?;
        secret_hex.zeroize();
        Self::from_bytes(public_key, secret_key)
    }

    /// Load the key file at `path`, creating and persisting a fresh keypair
    /// if none exists yet.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match Self::load_from_file(path) {
            Ok(keypair) => {
                log::info!("loaded miner key from {}", path.display());
                Ok(keypair)
            }
            Err(_) => {
                log::info!("no usable key at {}, generating a new one", path.display());
                let keypair = Self::generate();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                keypair.save_to_file(path)?;
                Ok(keypair)
            }
        }
    }
}

impl fmt::Debug for FalconKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FalconKeypair(pk: {}…)", hex::encode(&self.public_key[..8]))
    }
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    public_key: String,
    secret_key: String,
}

/// Verify a detached Falcon-512 signature. Deterministic, side-effect free
/// and safe to run from any thread; invalid key or signature bytes simply
/// fail verification.
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    if signature.is_empty() || signature.len() > FALCON_SIG_MAX_SIZE {
        return false;
    }
    let pk = match falcon512::PublicKey::from_bytes(public_key) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    let sig = match falcon512::DetachedSignature::from_bytes(signature) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    falcon512::verify_detached_signature(&sig, message, &pk).is_ok()
}

/// Total size of a binary address: version byte, 19-byte key-hash body,
/// 4-byte checksum.
pub const ADDRESS_SIZE: usize = 24;

const ADDRESS_BODY_SIZE: usize = 19;

/// Binary account address. Canonical inside blocks and the store; the
/// user-facing form is `Q` + Base58 of the 24 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; ADDRESS_SIZE]);

impl Address {
    /// Derive the address of a public key:
    /// `version || sha3(pk)[..19] || checksum`.
    pub fn from_public_key(version: u8, public_key: &[u8]) -> Self {
        let digest = hash256(public_key);
        Self::assemble(version, &digest[..ADDRESS_BODY_SIZE])
    }

    /// Derive a well-known address from a seed string. Used for the
    /// per-network genesis address, which has no corresponding key.
    pub fn from_seed(version: u8, seed: &str) -> Self {
        let digest = hash256(seed.as_bytes());
        Self::assemble(version, &digest[..ADDRESS_BODY_SIZE])
    }

    /// Derive a multi-sig account address from its creating transaction
    /// hash. Domain-separated so it can never collide with a key address.
    pub fn from_multisig(version: u8, creation_tx: &Hash32) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(b"multisig-address");
        hasher.update(creation_tx);
        let digest: Hash32 = hasher.finalize().into();
        Self::assemble(version, &digest[..ADDRESS_BODY_SIZE])
    }

    fn assemble(version: u8, body: &[u8]) -> Self {
        debug_assert_eq!(body.len(), ADDRESS_BODY_SIZE);
        let mut bytes = [0u8; ADDRESS_SIZE];
        bytes[0] = version;
        bytes[1..1 + ADDRESS_BODY_SIZE].copy_from_slice(body);
        let checksum = Self::checksum(version, body);
        bytes[1 + ADDRESS_BODY_SIZE..].copy_from_slice(&checksum);
        Self(bytes)
    }

    fn checksum(version: u8, body: &[u8]) -> [u8; 4] {
        let mut hasher = Sha3_256::new();
        hasher.update([version]);
        hasher.update(body);
        let digest = hasher.finalize();
        [digest[0], digest[1], digest[2], digest[3]]
    }

    pub fn version(&self) -> u8 {
        self.0[0]
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }

    /// Raw binary form with no checksum validation; wire decoding uses this
    /// since checksums are only meaningful on user input.
    pub fn from_raw(bytes: [u8; ADDRESS_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse the user-facing string form, validating length, checksum and
    /// that the version byte belongs to `params`' network.
    pub fn from_string(s: &str, params: &NetworkParams) -> Result<Self> {
        let addr = s.parse::<Address>()?;
        if addr.version() != params.address_version {
            return Err(CoreError::Malformed(format!(
                "address version {:#04x} does not belong to {}",
                addr.version(),
                params.network.as_str()
            )));
        }
        Ok(addr)
    }

    /// Whether the embedded checksum is intact.
    pub fn checksum_valid(&self) -> bool {
        let expected = Self::checksum(self.0[0], &self.0[1..1 + ADDRESS_BODY_SIZE]);
        constant_time_eq(&expected, &self.0[1 + ADDRESS_BODY_SIZE..])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Q{}", bs58::encode(&self.0).into_string())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl std::str::FromStr for Address {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix('Q')
            .ok_or_else(|| CoreError::Malformed("address must start with 'Q'".into()))?;
        let bytes = bs58::decode(body)
            .into_vec()
            .map_err(|e| CoreError::Malformed(format!("bad base58 address: {e}")))?;
        if bytes.len() != ADDRESS_SIZE {
            return Err(CoreError::Malformed(format!(
                "bad address length: expected {ADDRESS_SIZE}, got {}",
                bytes.len()
            )));
        }
        let mut raw = [0u8; ADDRESS_SIZE];
        raw.copy_from_slice(&bytes);
        let addr = Address(raw);
        if !addr.checksum_valid() {
            return Err(CoreError::Malformed("address checksum mismatch".into()));
        }
        Ok(addr)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkType;

    #[test]
    fn falcon_key_sizes() {
        let keypair = FalconKeypair::generate();
        assert_eq!(keypair.public_key().len(), FALCON_PUBKEY_SIZE);
        assert_eq!(FALCON_PUBKEY_SIZE, 897);
    }

    #[test]
    fn sign_and_verify() {
        let keypair = FalconKeypair::generate();
        let message = b"quantum resistant money";
        let sig = keypair.sign(message).unwrap();
        assert!(sig.len() <= FALCON_SIG_MAX_SIZE);
        assert!(verify(keypair.public_key(), message, &sig));
        assert!(!verify(keypair.public_key(), b"another message", &sig));

        let other = FalconKeypair::generate();
        assert!(!verify(other.public_key(), message, &sig));
    }

    #[test]
    fn tampered_signature_rejected() {
        let keypair = FalconKeypair::generate();
        let message = b"tamper test";
        let mut sig = keypair.sign(message).unwrap();
        sig[10] ^= 0x01;
        assert!(!verify(keypair.public_key(), message, &sig));

        assert!(!verify(keypair.public_key(), message, &[]));
        assert!(!verify(keypair.public_key(), message, &vec![0u8; FALCON_SIG_MAX_SIZE + 1]));
    }

    #[test]
    fn hashing_is_deterministic() {
        assert_eq!(hash256(b"abc"), hash256(b"abc"));
        assert_ne!(hash256(b"abc"), hash256(b"abd"));

        let left = hash256(b"left");
        let right = hash256(b"right");
        let mut joined = Vec::new();
        joined.extend_from_slice(&left);
        joined.extend_from_slice(&right);
        assert_eq!(hash256_pair(&left, &right), hash256(&joined));
    }

    #[test]
    fn address_round_trip() {
        let params = NetworkParams::for_network(NetworkType::Dev);
        let keypair = FalconKeypair::generate();
        let addr = keypair.address(params);
        assert_eq!(addr.version(), params.address_version);
        assert!(addr.checksum_valid());

        let text = addr.to_string();
        assert!(text.starts_with('Q'));
        let parsed = Address::from_string(&text, params).unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn address_checksum_detects_corruption() {
        let params = NetworkParams::for_network(NetworkType::Dev);
        let addr = Address::from_seed(params.address_version, "corruption-test");
        let mut bytes = *addr.as_bytes();
        bytes[5] ^= 0xff;
        let corrupted = Address::from_raw(bytes);
        assert!(!corrupted.checksum_valid());
        assert!(corrupted.to_string().parse::<Address>().is_err());
    }

    #[test]
    fn address_rejects_wrong_network() {
        let dev = NetworkParams::for_network(NetworkType::Dev);
        let mainnet = NetworkParams::for_network(NetworkType::Mainnet);
        let addr = Address::from_seed(mainnet.address_version, "cross-network");
        assert!(Address::from_string(&addr.to_string(), dev).is_err());
    }

    #[test]
    fn key_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("miner.key");
        let keypair = FalconKeypair::load_or_create(&path).unwrap();
        let reloaded = FalconKeypair::load_from_file(&path).unwrap();
        assert_eq!(keypair.public_key(), reloaded.public_key());
    }
}
