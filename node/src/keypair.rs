use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey, Verifier};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

/// The operator's key material: an ed25519 identity key plus the x25519
/// sealing key derived from it.
pub struct OperatorKeypair {
    signing: SigningKey,
}

impl OperatorKeypair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Ledger address: url-safe base64 of the hashed public key.
    pub fn address(&self) -> String {
        let digest = Sha256::digest(self.signing.verifying_key().as_bytes());
        URL_SAFE_NO_PAD.encode(digest)
    }

    /// The x25519 secret used to open sealed request payloads. Derived from
    /// the identity seed so a single key file covers both roles.
    pub fn sealing_secret(&self) -> StaticSecret {
        let mut hasher = Sha256::new();
        hasher.update(self.signing.to_bytes());
        hasher.update(b"inferlay-sealing-v1");
        let digest: [u8; 32] = hasher.finalize().into();
        StaticSecret::from(digest)
    }

    pub fn sealing_public(&self) -> PublicKey {
        PublicKey::from(&self.sealing_secret())
    }
}

pub fn keypair_exists(path: &Path) -> bool {
    path.exists()
}

pub fn default_keypair_path(data_dir: &Path) -> PathBuf {
    data_dir.join("operator_keypair.bin")
}

pub fn save_keypair(keypair: &OperatorKeypair, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create keypair parent directory: {}",
                parent.display()
            )
        })?;
    }

    std::fs::write(path, keypair.signing.to_bytes())
        .with_context(|| format!("failed to write keypair file: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms).with_context(|| {
            format!(
                "failed to set permissions on keypair file: {}",
                path.display()
            )
        })?;
    }

    Ok(())
}

pub fn load_keypair(path: &Path) -> Result<OperatorKeypair> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read keypair file: {}", path.display()))?;

    let seed: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("keypair file must hold exactly 32 bytes: {}", path.display()))?;
    let keypair = OperatorKeypair {
        signing: SigningKey::from_bytes(&seed),
    };

    validate_keypair(&keypair)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let meta = std::fs::metadata(path)
            .with_context(|| format!("failed to stat keypair file: {}", path.display()))?;
        let mode = meta.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            eprintln!(
                "keypair file permissions are too permissive: path={}, mode={:o}",
                path.display(),
                mode
            );
        }
    }

    Ok(keypair)
}

fn validate_keypair(keypair: &OperatorKeypair) -> Result<()> {
    let msg = b"inferlay-keypair-validation";
    let sig = keypair.signing.sign(msg);
    keypair
        .signing
        .verifying_key()
        .verify(msg, &sig)
        .map_err(|e| anyhow!("keypair signature verification failed: {e}"))
}
