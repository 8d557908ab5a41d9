//! Cryptographic façade: hashing, secp256k1 keypairs, and Base58Check addresses.
//!
//! Wraps the RustCrypto stack (`sha2`, `ripemd`, `k256`) and `bs58` behind the
//! handful of operations the ledger needs. Key material is an owned resource:
//! secret bytes only leave [`Keypair`] wrapped in [`Zeroizing`].

use k256::ecdsa::signature::{Signer as _, Verifier as _};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::Hash;

/// Version byte prefixed to the public-key hash of every address.
pub const ADDRESS_VERSION: u8 = 0x00;
/// Trailing checksum bytes of a Base58Check address.
pub const ADDRESS_CHECKSUM_LEN: usize = 4;

/// Errors from key handling, signing, and address decoding.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid secret key material")]
    InvalidSecretKey,
    #[error("invalid public key encoding")]
    InvalidPublicKey,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("signing failed")]
    SigningFailed,
}

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// Double SHA-256 of `data`.
pub fn dsha256(data: &[u8]) -> Hash {
    sha256(&sha256(data))
}

/// RIPEMD-160 of `data`.
pub fn ripemd160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(data).into()
}

/// The locking hash of a public key: `RIPEMD-160(SHA-256(pubKey))`.
pub fn hash_pubkey(pub_key: &[u8]) -> [u8; 20] {
    ripemd160(&sha256(pub_key))
}

/// An owned secp256k1 keypair. The secret key is released on drop.
pub struct Keypair {
    secret: SigningKey,
    /// SEC1 uncompressed point (65 bytes, 0x04 prefix).
    public: Vec<u8>,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let secret = SigningKey::random(&mut OsRng);
        let public = secret
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        Keypair { secret, public }
    }

    /// Rebuild a keypair from 32 secret-key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret = SigningKey::from_slice(bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
        let public = secret
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        Ok(Keypair { secret, public })
    }

    /// The raw uncompressed public key.
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// The 32 secret-key bytes, zeroized when the returned buffer drops.
    pub fn secret_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret.to_bytes().to_vec())
    }

    /// ECDSA-sign `digest` (hashed again with SHA-256 inside the scheme),
    /// returning a DER-encoded signature.
    pub fn sign(&self, digest: &[u8]) -> Vec<u8> {
        let sig: Signature = self.secret.sign(digest);
        sig.to_der().as_bytes().to_vec()
    }
}

/// Verify a DER-encoded ECDSA signature over `digest` under an uncompressed
/// public key. Malformed keys or signatures verify as false.
pub fn verify_signature(pub_key: &[u8], digest: &[u8], der_signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_sec1_bytes(pub_key) else {
        return false;
    };
    let Ok(sig) = Signature::from_der(der_signature) else {
        return false;
    };
    key.verify(digest, &sig).is_ok()
}

/// A signing oracle: something that can produce a DER signature over a digest
/// and reveal the corresponding public key. Implemented by the wallet so the
/// chain never touches raw private keys.
pub trait Signer {
    fn public_key(&self) -> &[u8];
    fn sign(&self, digest: &Hash) -> Result<Vec<u8>, CryptoError>;
}

/// First `ADDRESS_CHECKSUM_LEN` bytes of the double-SHA-256 of `payload`.
fn checksum(payload: &[u8]) -> [u8; ADDRESS_CHECKSUM_LEN] {
    let hash = dsha256(payload);
    let mut out = [0u8; ADDRESS_CHECKSUM_LEN];
    out.copy_from_slice(&hash[..ADDRESS_CHECKSUM_LEN]);
    out
}

/// Encode a 20-byte public-key hash as a Base58Check address.
pub fn address_from_pubkey_hash(pub_key_hash: &[u8]) -> String {
    let mut payload = Vec::with_capacity(1 + pub_key_hash.len() + ADDRESS_CHECKSUM_LEN);
    payload.push(ADDRESS_VERSION);
    payload.extend_from_slice(pub_key_hash);
    let check = checksum(&payload);
    payload.extend_from_slice(&check);
    bs58::encode(payload).into_string()
}

/// The address of a raw uncompressed public key.
pub fn address_from_pubkey(pub_key: &[u8]) -> String {
    address_from_pubkey_hash(&hash_pubkey(pub_key))
}

/// Decode an address back to its public-key hash, verifying the checksum.
pub fn address_to_pubkey_hash(address: &str) -> Result<Vec<u8>, CryptoError> {
    let decoded = bs58::decode(address)
        .into_vec()
        .map_err(|e| CryptoError::InvalidAddress(e.to_string()))?;
    if decoded.len() < 1 + ADDRESS_CHECKSUM_LEN {
        return Err(CryptoError::InvalidAddress("too short".into()));
    }
    let (payload, actual) = decoded.split_at(decoded.len() - ADDRESS_CHECKSUM_LEN);
    if checksum(payload) != actual {
        return Err(CryptoError::InvalidAddress("checksum mismatch".into()));
    }
    Ok(payload[1..].to_vec())
}

/// Whether `address` is well-formed Base58Check with a valid checksum.
pub fn validate_address(address: &str) -> bool {
    address_to_pubkey_hash(address).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        // SHA-256("abc")
        let hash = sha256(b"abc");
        assert_eq!(
            hex::encode(hash),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn ripemd160_known_vector() {
        // RIPEMD-160("abc")
        let hash = ripemd160(b"abc");
        assert_eq!(hex::encode(hash), "8eb208f7e05d987a9b044a8e98c6b087f15a0bfc");
    }

    #[test]
    fn dsha256_is_double_hash() {
        assert_eq!(dsha256(b"x"), sha256(&sha256(b"x")));
    }

    #[test]
    fn keypair_public_key_is_uncompressed() {
        let kp = Keypair::generate();
        assert_eq!(kp.public_key().len(), 65);
        assert_eq!(kp.public_key()[0], 0x04);
    }

    #[test]
    fn keypair_secret_roundtrip() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_bytes(&kp.secret_bytes()).unwrap();
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn sign_and_verify() {
        let kp = Keypair::generate();
        let digest = sha256(b"message");
        let sig = kp.sign(&digest);

        assert!(verify_signature(kp.public_key(), &digest, &sig));
        // wrong digest
        assert!(!verify_signature(kp.public_key(), &sha256(b"other"), &sig));
        // wrong key
        let other = Keypair::generate();
        assert!(!verify_signature(other.public_key(), &digest, &sig));
    }

    #[test]
    fn verify_rejects_garbage() {
        let kp = Keypair::generate();
        assert!(!verify_signature(kp.public_key(), &[0u8; 32], b"not-der"));
        assert!(!verify_signature(b"not-a-key", &[0u8; 32], b"not-der"));
    }

    #[test]
    fn address_roundtrip_any_hash() {
        for seed in 0u8..8 {
            let pkh = [seed; 20];
            let addr = address_from_pubkey_hash(&pkh);
            assert!(validate_address(&addr));
            assert_eq!(address_to_pubkey_hash(&addr).unwrap(), pkh);
        }
    }

    #[test]
    fn tampered_address_rejected() {
        let kp = Keypair::generate();
        let addr = address_from_pubkey(kp.public_key());
        assert!(validate_address(&addr));

        // flip one character; '1' and '2' are both in the Base58 alphabet
        let mut chars: Vec<char> = addr.chars().collect();
        let mid = chars.len() / 2;
        chars[mid] = if chars[mid] == '1' { '2' } else { '1' };
        let tampered: String = chars.into_iter().collect();
        assert!(!validate_address(&tampered));
    }

    #[test]
    fn invalid_base58_rejected() {
        // '0' and 'O' are not Base58 characters
        assert!(!validate_address("0OIl"));
        assert!(!validate_address(""));
    }
}
