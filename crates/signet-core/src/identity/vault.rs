//! Key vault
//!
//! The Ed25519 keypair lives on disk encrypted under a master key derived
//! from the machine identity, so the file only decrypts on the host+user
//! that created it. The decrypted signer is cached behind a mutex; the lock
//! is held for the duration of a load, which serializes concurrent loaders
//! into a single decrypt. A failed load leaves the cache empty so later
//! callers retry.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use crypto_secretbox::aead::{Aead, AeadCore, KeyInit, OsRng};
use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::machine::resolve_machine_id;
use super::signer::Signer;
use crate::hash::{blake2b_256, SECRETS_DOMAIN};

/// KDF version 1: master key bound to the machine identity.
pub const KDF_VERSION_MACHINE: u32 = 1;

/// XSalsa20-Poly1305 nonce length.
const NONCE_LEN: usize = 24;

/// Vault failures.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// The keypair file does not exist.
    #[error("keypair file not found: {0}")]
    KeyNotFound(PathBuf),
    /// A keypair file already exists where `generate` would write.
    #[error("keypair file already exists: {0}")]
    AlreadyExists(PathBuf),
    /// Decryption failed: wrong machine, or the file was tampered with.
    #[error("keypair decryption failed (wrong machine or tampered file)")]
    KeyMismatch,
    /// The file parsed but its contents are structurally wrong.
    #[error("keypair file corrupted: {0}")]
    Corrupted(String),
    /// Unknown KDF version recorded in the file.
    #[error("unsupported kdf version {0}")]
    UnsupportedKdf(u32),
    /// Filesystem error.
    #[error("vault io error: {0}")]
    Io(#[from] std::io::Error),
}

impl VaultError {
    /// Stable error code for user-visible failures.
    pub fn code(&self) -> &'static str {
        match self {
            VaultError::KeyNotFound(_) => "KEY_NOT_FOUND",
            VaultError::AlreadyExists(_) => "KEY_EXISTS",
            VaultError::KeyMismatch => "KEY_MISMATCH",
            VaultError::Corrupted(_) => "CORRUPTED",
            VaultError::UnsupportedKdf(_) => "UNSUPPORTED_KDF",
            VaultError::Io(_) => "IO",
        }
    }

    /// Whether retrying the operation can help.
    pub fn retryable(&self) -> bool {
        matches!(self, VaultError::Io(_))
    }
}

/// On-disk keypair file layout.
#[derive(Debug, Serialize, Deserialize)]
struct KeypairFile {
    public_key: String,
    encrypted_private_key: String,
    created: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kdf_version: Option<u32>,
}

/// Derive the 32-byte master key for a KDF version.
///
/// Version 1 is `BLAKE2b-256("signet:secrets:" ‖ machine_id)`; the machine
/// id is treated as non-secret. Future versions may substitute a
/// passphrase-derived KDF; the file records which one was used.
pub fn derive_master_key(
    kdf_version: u32,
    machine_id: &str,
) -> Result<Zeroizing<[u8; 32]>, VaultError> {
    match kdf_version {
        KDF_VERSION_MACHINE => {
            let mut input = Vec::with_capacity(SECRETS_DOMAIN.len() + machine_id.len());
            input.extend_from_slice(SECRETS_DOMAIN);
            input.extend_from_slice(machine_id.as_bytes());
            Ok(Zeroizing::new(blake2b_256(&input)))
        }
        v => Err(VaultError::UnsupportedKdf(v)),
    }
}

/// Machine-bound store for the Ed25519 signing keypair.
pub struct KeyVault {
    path: PathBuf,
    machine_id: String,
    cached: Mutex<Option<Arc<Signer>>>,
}

impl KeyVault {
    /// Vault over the keypair file at `path`, bound to this machine.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_machine_id(path, resolve_machine_id())
    }

    /// Vault with an explicit machine identity (tests and migrations).
    pub fn with_machine_id(path: impl Into<PathBuf>, machine_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            machine_id: machine_id.into(),
            cached: Mutex::new(None),
        }
    }

    /// Path of the keypair file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the keypair file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Generate a fresh keypair and write the encrypted file.
    ///
    /// Fails with `AlreadyExists` if the file is present; the vault never
    /// overwrites key material.
    pub fn generate(&self) -> Result<Arc<Signer>, VaultError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700));
            }
        }

        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let file = self.encrypt_keypair(&signing_key, KDF_VERSION_MACHINE)?;
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| VaultError::Corrupted(e.to_string()))?;

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut handle = options.open(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                VaultError::AlreadyExists(self.path.clone())
            } else {
                VaultError::Io(e)
            }
        })?;
        use std::io::Write;
        handle.write_all(&json)?;
        handle.sync_all()?;

        let signer = Arc::new(Signer::new(signing_key));
        *self.cached.lock().expect("vault cache lock") = Some(signer.clone());
        Ok(signer)
    }

    /// Load and decrypt the keypair, caching the signer in-process.
    pub fn load(&self) -> Result<Arc<Signer>, VaultError> {
        let mut cached = self.cached.lock().expect("vault cache lock");
        if let Some(signer) = cached.as_ref() {
            return Ok(signer.clone());
        }

        let signer = Arc::new(self.load_from_disk()?);
        *cached = Some(signer.clone());
        Ok(signer)
    }

    /// Drop the cached signer. Key material zeroizes on drop.
    pub fn clear(&self) {
        self.cached.lock().expect("vault cache lock").take();
    }

    /// Rewrite the keypair file under a (possibly new) KDF version.
    ///
    /// The rewrite goes through a temp file plus rename so a crash never
    /// leaves a half-written keypair.
    pub fn re_encrypt(&self, kdf_version: u32) -> Result<(), VaultError> {
        let signer = self.load()?;

        let file = self.read_file()?;
        let secret = self.decrypt_file(&file)?;
        if secret.len() != 32 {
            return Err(VaultError::Corrupted(format!(
                "decrypted key has length {}, expected 32",
                secret.len()
            )));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&secret[..]);
        let signing_key = SigningKey::from_bytes(&bytes);
        if signing_key.verifying_key().to_bytes() != signer.public_key_bytes() {
            return Err(VaultError::KeyMismatch);
        }

        let file = self.encrypt_keypair(&signing_key, kdf_version)?;
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| VaultError::Corrupted(e.to_string()))?;

        let tmp = self.path.with_extension("enc.tmp");
        {
            let mut options = std::fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut handle = options.open(&tmp)?;
            use std::io::Write;
            handle.write_all(&json)?;
            handle.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn encrypt_keypair(
        &self,
        signing_key: &SigningKey,
        kdf_version: u32,
    ) -> Result<KeypairFile, VaultError> {
        let master = derive_master_key(kdf_version, &self.machine_id)?;
        let cipher = XSalsa20Poly1305::new(Key::from_slice(&master[..]));
        let nonce = XSalsa20Poly1305::generate_nonce(&mut OsRng);
        let secret = Zeroizing::new(signing_key.to_bytes());
        let ciphertext = cipher
            .encrypt(&nonce, secret.as_ref())
            .map_err(|_| VaultError::Corrupted("encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);

        Ok(KeypairFile {
            public_key: BASE64.encode(signing_key.verifying_key().to_bytes()),
            encrypted_private_key: BASE64.encode(blob),
            created: Utc::now().to_rfc3339(),
            kdf_version: Some(kdf_version),
        })
    }

    fn read_file(&self) -> Result<KeypairFile, VaultError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VaultError::KeyNotFound(self.path.clone())
            } else {
                VaultError::Io(e)
            }
        })?;
        serde_json::from_str(&contents).map_err(|e| VaultError::Corrupted(e.to_string()))
    }

    fn decrypt_file(&self, file: &KeypairFile) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let kdf_version = file.kdf_version.unwrap_or(KDF_VERSION_MACHINE);
        let master = derive_master_key(kdf_version, &self.machine_id)?;
        let blob = BASE64
            .decode(&file.encrypted_private_key)
            .map_err(|e| VaultError::Corrupted(e.to_string()))?;
        if blob.len() <= NONCE_LEN {
            return Err(VaultError::Corrupted(format!(
                "encrypted blob too short: {} bytes",
                blob.len()
            )));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = XSalsa20Poly1305::new(Key::from_slice(&master[..]));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| VaultError::KeyMismatch)?;
        Ok(Zeroizing::new(plaintext))
    }

    fn load_from_disk(&self) -> Result<Signer, VaultError> {
        let file = self.read_file()?;
        let secret = self.decrypt_file(&file)?;
        if secret.len() != 32 {
            return Err(VaultError::Corrupted(format!(
                "decrypted key has length {}, expected 32",
                secret.len()
            )));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&secret[..]);
        let signing_key = SigningKey::from_bytes(&bytes);

        // Public/private consistency: derive and compare to the stored key.
        let stored_public = BASE64
            .decode(&file.public_key)
            .map_err(|e| VaultError::Corrupted(e.to_string()))?;
        if stored_public != signing_key.verifying_key().to_bytes() {
            return Err(VaultError::KeyMismatch);
        }

        Ok(Signer::new(signing_key))
    }
}

impl std::fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVault")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
