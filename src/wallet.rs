//! Wallets: keypair ownership, address derivation, and the on-disk store.
//!
//! `wallet.dat` holds every wallet keyed by address, written with bincode and
//! owner-only permissions. A [`Wallet`] is the signing oracle handed to the
//! chain when building transactions; the private key never leaves it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{self, CryptoError, Keypair, Signer};
use crate::Hash;

/// Errors from wallet storage.
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("wallet for address {0} not found")]
    NotFound(String),
    #[error("wallet file corrupted: {0}")]
    Corrupted(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// One keypair and its derived address.
pub struct Wallet {
    keypair: Keypair,
}

impl Wallet {
    /// Generate a fresh wallet.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Wallet {
            keypair: Keypair::generate(),
        }
    }

    fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        Ok(Wallet {
            keypair: Keypair::from_secret_bytes(bytes)?,
        })
    }

    /// The raw uncompressed public key.
    pub fn public_key(&self) -> &[u8] {
        self.keypair.public_key()
    }

    /// Base58Check address of this wallet's public key.
    pub fn address(&self) -> String {
        crypto::address_from_pubkey(self.keypair.public_key())
    }
}

impl Signer for Wallet {
    fn public_key(&self) -> &[u8] {
        self.keypair.public_key()
    }

    fn sign(&self, digest: &Hash) -> Result<Vec<u8>, CryptoError> {
        Ok(self.keypair.sign(digest))
    }
}

/// Serialized form of one wallet inside `wallet.dat`.
#[derive(Serialize, Deserialize)]
struct StoredWallet {
    address: String,
    secret: Vec<u8>,
}

/// The collection of local wallets backed by `wallet.dat`.
pub struct WalletStore {
    path: PathBuf,
    wallets: BTreeMap<String, Wallet>,
}

impl WalletStore {
    /// Load the store, or start empty when no file exists yet.
    pub fn load(path: &Path) -> Result<Self, WalletError> {
        let mut store = WalletStore {
            path: path.to_path_buf(),
            wallets: BTreeMap::new(),
        };

        if !path.exists() {
            return Ok(store);
        }

        let data = Zeroizing::new(std::fs::read(path)?);
        if data.is_empty() {
            return Ok(store);
        }

        let stored: Vec<StoredWallet> =
            bincode::deserialize(&data).map_err(|e| WalletError::Corrupted(e.to_string()))?;
        for entry in stored {
            let secret = Zeroizing::new(entry.secret);
            let wallet = Wallet::from_secret_bytes(&secret)
                .map_err(|e| WalletError::Corrupted(e.to_string()))?;
            store.wallets.insert(entry.address, wallet);
        }
        Ok(store)
    }

    /// Write every wallet back to disk, owner-readable only.
    pub fn save(&self) -> Result<(), WalletError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let stored: Vec<StoredWallet> = self
            .wallets
            .iter()
            .map(|(address, wallet)| StoredWallet {
                address: address.clone(),
                secret: wallet.keypair.secret_bytes().to_vec(),
            })
            .collect();
        let data = Zeroizing::new(
            bincode::serialize(&stored).map_err(|e| WalletError::Corrupted(e.to_string()))?,
        );
        std::fs::write(&self.path, &*data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Create a wallet, add it to the store, and return its address.
    pub fn create_wallet(&mut self) -> String {
        let wallet = Wallet::new();
        let address = wallet.address();
        self.wallets.insert(address.clone(), wallet);
        address
    }

    /// Every stored address, sorted.
    pub fn addresses(&self) -> Vec<String> {
        self.wallets.keys().cloned().collect()
    }

    /// Look up the wallet for an address.
    pub fn get(&self, address: &str) -> Result<&Wallet, WalletError> {
        self.wallets
            .get(address)
            .ok_or_else(|| WalletError::NotFound(address.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_validates() {
        let wallet = Wallet::new();
        assert!(crypto::validate_address(&wallet.address()));
    }

    #[test]
    fn signer_signature_verifies() {
        let wallet = Wallet::new();
        let digest = crypto::sha256(b"digest");
        let sig = Signer::sign(&wallet, &digest).unwrap();
        assert!(crypto::verify_signature(wallet.public_key(), &digest, &sig));
    }

    #[test]
    fn store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.dat");

        let (addr1, addr2, pub1) = {
            let mut store = WalletStore::load(&path).unwrap();
            let a1 = store.create_wallet();
            let a2 = store.create_wallet();
            let p1 = store.get(&a1).unwrap().public_key().to_vec();
            store.save().unwrap();
            (a1, a2, p1)
        };

        let reloaded = WalletStore::load(&path).unwrap();
        let mut expected = vec![addr1.clone(), addr2];
        expected.sort();
        assert_eq!(reloaded.addresses(), expected);
        assert_eq!(reloaded.get(&addr1).unwrap().public_key(), pub1);
        assert_eq!(reloaded.get(&addr1).unwrap().address(), addr1);
    }

    #[test]
    fn missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = WalletStore::load(&dir.path().join("wallet.dat")).unwrap();
        assert!(store.addresses().is_empty());
    }

    #[test]
    fn unknown_address_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = WalletStore::load(&dir.path().join("wallet.dat")).unwrap();
        assert!(matches!(
            store.get("nothere"),
            Err(WalletError::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn wallet_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.dat");
        let mut store = WalletStore::load(&path).unwrap();
        store.create_wallet();
        store.save().unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
