use crate::common::{AttendanceError, Result};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

const KEY_FILE: &str = "secret.key";
const PASSWORD_FILE: &str = "password.bin";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Admin password encrypted with a local AES-256-GCM key.
///
/// `passkey/secret.key` holds the raw key; `passkey/password.bin` holds
/// `nonce || ciphertext`.
pub struct CredentialStore {
    dir: PathBuf,
    key: [u8; KEY_LEN],
}

impl CredentialStore {
    /// Opens the store, creating the key and the default password when absent.
    pub fn open_or_init(dir: impl Into<PathBuf>, default_password: &str) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let key_path = dir.join(KEY_FILE);
        let key = if key_path.is_file() {
            let bytes = fs::read(&key_path)?;
            bytes.as_slice().try_into().map_err(|_| {
                AttendanceError::Storage(format!("{} must hold {} bytes", key_path.display(), KEY_LEN))
            })?
        } else {
            let mut key = [0u8; KEY_LEN];
            rand::thread_rng().fill_bytes(&mut key);
            fs::write(&key_path, key)?;
            tracing::info!("Generated new credential key at {}", key_path.display());
            key
        };

        let store = Self { dir, key };
        if !store.password_path().is_file() {
            store.write_password(default_password)?;
            tracing::warn!("Initialised admin password to the configured default");
        }
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn verify(&self, password: &str) -> Result<()> {
        let stored = self.read_password()?;
        if Sha256::digest(stored.as_bytes()) == Sha256::digest(password.as_bytes()) {
            Ok(())
        } else {
            Err(AttendanceError::PasswordMismatch)
        }
    }

    pub fn update(&self, old_password: &str, new_password: &str) -> Result<()> {
        self.verify(old_password)?;
        if new_password.is_empty() {
            return Err(AttendanceError::InvalidRequest("New password must not be empty".into()));
        }
        self.write_password(new_password)?;
        tracing::info!("Admin password updated");
        Ok(())
    }

    /// Replaces the password without checking the old one.
    pub fn reset(&self, new_password: &str) -> Result<()> {
        if new_password.is_empty() {
            return Err(AttendanceError::InvalidRequest("New password must not be empty".into()));
        }
        self.write_password(new_password)
    }

    fn password_path(&self) -> PathBuf {
        self.dir.join(PASSWORD_FILE)
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| AttendanceError::Storage(format!("Invalid credential key: {}", e)))
    }

    fn write_password(&self, password: &str) -> Result<()> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self.cipher()?
            .encrypt(Nonce::from_slice(&nonce), password.as_bytes())
            .map_err(|e| AttendanceError::Storage(format!("Failed to encrypt password: {}", e)))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        fs::write(self.password_path(), blob)?;
        Ok(())
    }

    fn read_password(&self) -> Result<String> {
        let blob = fs::read(self.password_path())?;
        if blob.len() <= NONCE_LEN {
            return Err(AttendanceError::Storage("Password file is truncated".into()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);

        let plain = self.cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| AttendanceError::Storage(format!("Failed to decrypt password: {}", e)))?;
        String::from_utf8(plain)
            .map_err(|e| AttendanceError::Storage(format!("Password is not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn bootstraps_with_default_password() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::open_or_init(dir.path(), "admin").unwrap();
        assert!(dir.path().join(KEY_FILE).is_file());
        assert!(store.verify("admin").is_ok());
        assert!(matches!(store.verify("guess"), Err(AttendanceError::PasswordMismatch)));
    }

    #[test]
    fn password_is_not_stored_in_plain_text() {
        let dir = TempDir::new().unwrap();
        CredentialStore::open_or_init(dir.path(), "hunter2-secret").unwrap();
        let blob = fs::read(dir.path().join(PASSWORD_FILE)).unwrap();
        assert!(!blob.windows(6).any(|w| w == b"hunter"));
    }

    #[test]
    fn update_requires_old_password_and_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::open_or_init(dir.path(), "admin").unwrap();

        assert!(matches!(store.update("wrong", "new"), Err(AttendanceError::PasswordMismatch)));
        assert!(matches!(store.update("admin", ""), Err(AttendanceError::InvalidRequest(_))));
        store.update("admin", "s3cret").unwrap();

        let reopened = CredentialStore::open_or_init(dir.path(), "admin").unwrap();
        assert!(reopened.verify("s3cret").is_ok());
        assert!(reopened.verify("admin").is_err());
    }
}
