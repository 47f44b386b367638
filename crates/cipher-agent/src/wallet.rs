//! Agent wallet key.
//!
//! A dedicated ed25519 keypair, stored as the usual 64-number JSON array
//! (32 secret + 32 public bytes) with owner-only permissions. Created on
//! first start; an explicit override path must already exist, hold exactly
//! 64 bytes of key material, and not be readable by group or other.

use cipher_core::error::{Error, Result};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const WALLET_FILE: &str = "agent-wallet.json";

pub struct AgentWallet {
    signing_key: SigningKey,
    path: PathBuf,
}

impl AgentWallet {
    /// Load the wallet from the data directory, creating it on first start,
    /// or from an explicit override path (which is never auto-created).
    pub fn load_or_create(data_dir: &Path, override_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = override_path {
            check_key_file_permissions(path);
            let signing_key = read_key_file(path)?;
            return Ok(Self {
                signing_key,
                path: path.to_path_buf(),
            });
        }

        let path = data_dir.join(WALLET_FILE);
        if path.exists() {
            let signing_key = read_key_file(&path)?;
            return Ok(Self { signing_key, path });
        }

        fs::create_dir_all(data_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(data_dir, fs::Permissions::from_mode(0o700))?;
        }
        let signing_key = SigningKey::generate(&mut OsRng);
        write_key_file(&path, &signing_key)?;
        info!(path = %path.display(), "created agent wallet");
        Ok(Self { signing_key, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stable node identity seed: the public half of the wallet key.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn address(&self) -> String {
        bs58::encode(self.public_key_bytes()).into_string()
    }
}

/// Fresh throwaway recipient for a mixed withdrawal.
pub fn fresh_recipient() -> String {
    let key = SigningKey::generate(&mut OsRng);
    bs58::encode(key.verifying_key().to_bytes()).into_string()
}

fn read_key_file(path: &Path) -> Result<SigningKey> {
    let raw = fs::read_to_string(path)?;
    let bytes: Vec<u8> = serde_json::from_str(&raw)
        .map_err(|e| Error::Integrity(format!("wallet {}: {e}", path.display())))?;
    if bytes.len() != 64 {
        return Err(Error::Integrity(format!(
            "wallet {} holds {} bytes, expected 64",
            path.display(),
            bytes.len()
        )));
    }
    let secret: [u8; 32] = bytes[..32].try_into().expect("32-byte slice");
    let signing_key = SigningKey::from_bytes(&secret);
    if signing_key.verifying_key().to_bytes() != bytes[32..] {
        return Err(Error::Integrity(format!(
            "wallet {}: public half does not match secret",
            path.display()
        )));
    }
    Ok(signing_key)
}

fn write_key_file(path: &Path, key: &SigningKey) -> Result<()> {
    let mut bytes = Vec::with_capacity(64);
    bytes.extend_from_slice(&key.to_bytes());
    bytes.extend_from_slice(&key.verifying_key().to_bytes());
    let body = serde_json::to_string(&bytes).map_err(|e| Error::Disk(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(unix)]
fn check_key_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path) {
        let mode = meta.permissions().mode();
        if mode & 0o077 != 0 {
            warn!(
                path = %path.display(),
                mode = format!("{:o}", mode & 0o777),
                "wallet key is readable by group or other"
            );
        }
    }
}

#[cfg(not(unix))]
fn check_key_file_permissions(_path: &Path) {}
