//! Agent identity: ed25519 keypair generation, persistence, signing, and
//! `agent_id` derivation.
//!
//! Layout under `work_dir`:
//! ```text
//! ~/.aether/
//! └── agent-pkey{16-hex-chars}/
//!     ├── id_ed25519       (32-byte signing key seed, mode 0600)
//!     └── id_ed25519.pub   (32-byte verifying key, mode 0644)
//! ```
//!
//! `agent_id` is the first 16 hex characters of `SHA256(verifying_key_bytes)`.
//! Because the id is derived from the key, any message carrying both can be
//! checked without a directory lookup (see [`verify`]).

use std::{
    fs,
    path::{Path, PathBuf},
};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256};

use crate::{config::Config, error::MarketplaceError};

const AGENT_ID_LEN: usize = 16;
const DIR_PREFIX: &str = "agent-pkey";

/// Loaded agent identity.
#[derive(Clone)]
pub struct Identity {
    /// First 16 hex chars of `SHA256(verifying_key)`.
    pub agent_id: String,
    /// Identity directory, or `None` for an ephemeral identity.
    pub identity_dir: Option<PathBuf>,
    signing_key: SigningKey,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("agent_id", &self.agent_id)
            .field("identity_dir", &self.identity_dir)
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Fresh in-memory identity; nothing is written to disk.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng), None)
    }

    fn from_signing_key(signing_key: SigningKey, identity_dir: Option<PathBuf>) -> Self {
        let agent_id = compute_agent_id(&signing_key.verifying_key().to_bytes());
        Self {
            agent_id,
            identity_dir,
            signing_key,
        }
    }

    pub fn verifying_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Hex-encoded verifying key, as carried in `ConversationMessage::sender_key`.
    pub fn verifying_key_hex(&self) -> String {
        hex::encode(self.verifying_key_bytes())
    }

    /// Sign `bytes`; returns the hex-encoded signature.
    pub fn sign(&self, bytes: &[u8]) -> String {
        hex::encode(self.signing_key.sign(bytes).to_bytes())
    }
}

/// Check that `sig_hex` is a valid signature of `bytes` under `key_hex`, and
/// that `key_hex` belongs to `agent_id`.
pub fn verify(
    agent_id: &str,
    key_hex: &str,
    bytes: &[u8],
    sig_hex: &str,
) -> Result<(), MarketplaceError> {
    let key_bytes: [u8; 32] = hex::decode(key_hex)
        .map_err(|e| MarketplaceError::Signature(format!("sender key is not hex: {e}")))?
        .try_into()
        .map_err(|_| MarketplaceError::Signature("sender key is not 32 bytes".into()))?;

    if compute_agent_id(&key_bytes) != agent_id {
        return Err(MarketplaceError::Signature(format!(
            "sender key does not belong to agent {agent_id}"
        )));
    }

    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| MarketplaceError::Signature(format!("invalid sender key: {e}")))?;

    let sig_bytes: [u8; 64] = hex::decode(sig_hex)
        .map_err(|e| MarketplaceError::Signature(format!("signature is not hex: {e}")))?
        .try_into()
        .map_err(|_| MarketplaceError::Signature("signature is not 64 bytes".into()))?;

    key.verify_strict(bytes, &Signature::from_bytes(&sig_bytes))
        .map_err(|e| MarketplaceError::Signature(format!("bad signature: {e}")))
}

/// Load or create the agent identity under `config.work_dir`.
pub fn setup(config: &Config) -> Result<Identity, MarketplaceError> {
    let (seed, identity_dir) = if let Some(dir) = config.identity_dir.clone() {
        if dir.exists() {
            (load_keypair(&dir)?, dir)
        } else {
            let seed = generate_seed();
            fs::create_dir_all(&dir)
                .map_err(|e| MarketplaceError::Identity(format!("cannot create identity dir: {e}")))?;
            save_keypair(&dir, &seed)?;
            (seed, dir)
        }
    } else {
        // The directory name comes from the key, so use a single discovered
        // `agent-pkey*` directory if unambiguous, else generate.
        let dirs = find_existing_identity_dirs(&config.work_dir)?;
        match dirs.as_slice() {
            [] => {
                let seed = generate_seed();
                let vk = SigningKey::from_bytes(&seed).verifying_key().to_bytes();
                let dir = config
                    .work_dir
                    .join(format!("{DIR_PREFIX}{}", compute_agent_id(&vk)));
                fs::create_dir_all(&dir)
                    .map_err(|e| MarketplaceError::Identity(format!("cannot create identity dir: {e}")))?;
                save_keypair(&dir, &seed)?;
                (seed, dir)
            }
            [dir] => (load_keypair(dir)?, dir.clone()),
            _ => {
                return Err(MarketplaceError::Identity(format!(
                    "multiple identity directories found in {} ({}); set [marketplace].identity_dir explicitly",
                    config.work_dir.display(),
                    dirs.iter()
                        .map(|d| d
                            .file_name()
                            .map(|n| n.to_string_lossy().to_string())
                            .unwrap_or_else(|| d.display().to_string()))
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }
        }
    };

    Ok(Identity::from_signing_key(
        SigningKey::from_bytes(&seed),
        Some(identity_dir),
    ))
}

/// Derive `agent_id`: first 16 hex chars of `SHA256(verifying_key_bytes)`.
pub fn compute_agent_id(verifying_key_bytes: &[u8; 32]) -> String {
    let digest = Sha256::digest(verifying_key_bytes);
    hex::encode(digest)[..AGENT_ID_LEN].to_string()
}

// ── internals ────────────────────────────────────────────────────────────────

fn generate_seed() -> [u8; 32] {
    SigningKey::generate(&mut OsRng).to_bytes()
}

/// Save keypair to `dir/id_ed25519` (seed, 0600) and `dir/id_ed25519.pub` (vk, 0644).
fn save_keypair(dir: &Path, seed: &[u8; 32]) -> Result<(), MarketplaceError> {
    let secret_path = dir.join("id_ed25519");
    let pub_path = dir.join("id_ed25519.pub");
    let vk = SigningKey::from_bytes(seed).verifying_key().to_bytes();

    fs::write(&secret_path, seed)
        .map_err(|e| MarketplaceError::Identity(format!("cannot write id_ed25519: {e}")))?;
    fs::write(&pub_path, vk)
        .map_err(|e| MarketplaceError::Identity(format!("cannot write id_ed25519.pub: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&secret_path, fs::Permissions::from_mode(0o600))
            .map_err(|e| MarketplaceError::Identity(format!("cannot set permissions on id_ed25519: {e}")))?;
        fs::set_permissions(&pub_path, fs::Permissions::from_mode(0o644))
            .map_err(|e| MarketplaceError::Identity(format!("cannot set permissions on id_ed25519.pub: {e}")))?;
    }

    Ok(())
}

/// Load the seed from `dir/id_ed25519`, checking it against `dir/id_ed25519.pub`.
fn load_keypair(dir: &Path) -> Result<[u8; 32], MarketplaceError> {
    let seed_bytes = fs::read(dir.join("id_ed25519"))
        .map_err(|e| MarketplaceError::Identity(format!("cannot read id_ed25519: {e}")))?;
    let vk_bytes = fs::read(dir.join("id_ed25519.pub"))
        .map_err(|e| MarketplaceError::Identity(format!("cannot read id_ed25519.pub: {e}")))?;

    let seed: [u8; 32] = seed_bytes
        .try_into()
        .map_err(|_| MarketplaceError::Identity("id_ed25519 is not 32 bytes".into()))?;
    let vk: [u8; 32] = vk_bytes
        .try_into()
        .map_err(|_| MarketplaceError::Identity("id_ed25519.pub is not 32 bytes".into()))?;

    if SigningKey::from_bytes(&seed).verifying_key().to_bytes() != vk {
        return Err(MarketplaceError::Identity(
            "keypair mismatch: verifying key does not match signing key seed".into(),
        ));
    }

    Ok(seed)
}

/// Scan `work_dir` for `agent-pkey*` subdirectories containing `id_ed25519`.
fn find_existing_identity_dirs(work_dir: &Path) -> Result<Vec<PathBuf>, MarketplaceError> {
    if !work_dir.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(work_dir)
        .map_err(|e| MarketplaceError::Identity(format!("cannot read work_dir: {e}")))?;
    let mut candidates: Vec<PathBuf> = entries
        .flatten()
        .filter(|entry| {
            entry.file_name().to_string_lossy().starts_with(DIR_PREFIX)
                && entry.path().join("id_ed25519").exists()
        })
        .map(|entry| entry.path())
        .collect();
    candidates.sort();
    Ok(candidates)
}

// ── tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn agent_id_is_16_hex_chars() {
        let id = Identity::generate();
        assert_eq!(id.agent_id.len(), 16);
        assert!(id.agent_id.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(id.identity_dir.is_none());
    }

    #[test]
    fn sign_and_verify() {
        let id = Identity::generate();
        let sig = id.sign(b"payload");
        verify(&id.agent_id, &id.verifying_key_hex(), b"payload", &sig).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_bytes() {
        let id = Identity::generate();
        let sig = id.sign(b"payload");
        let err = verify(&id.agent_id, &id.verifying_key_hex(), b"payl0ad", &sig).unwrap_err();
        assert!(matches!(err, MarketplaceError::Signature(_)));
    }

    #[test]
    fn verify_rejects_key_of_other_agent() {
        let alice = Identity::generate();
        let mallory = Identity::generate();
        let sig = mallory.sign(b"payload");
        let err = verify(&alice.agent_id, &mallory.verifying_key_hex(), b"payload", &sig)
            .unwrap_err();
        assert!(err.to_string().contains("does not belong"));
    }

    #[test]
    fn verify_rejects_malformed_hex() {
        let id = Identity::generate();
        assert!(verify(&id.agent_id, "zz", b"x", "00").is_err());
        assert!(verify(&id.agent_id, &id.verifying_key_hex(), b"x", "abcd").is_err());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let seed = generate_seed();
        save_keypair(dir.path(), &seed).unwrap();
        assert_eq!(load_keypair(dir.path()).unwrap(), seed);
    }

    #[test]
    fn mismatched_public_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        save_keypair(dir.path(), &generate_seed()).unwrap();
        fs::write(dir.path().join("id_ed25519.pub"), [7u8; 32]).unwrap();
        let err = load_keypair(dir.path()).unwrap_err();
        assert!(err.to_string().contains("keypair mismatch"));
    }

    #[test]
    fn setup_creates_identity_dir_and_files() {
        let tmp = TempDir::new().unwrap();
        let identity = setup(&Config::test_default(tmp.path())).unwrap();
        let dir = identity.identity_dir.clone().unwrap();

        assert!(dir.join("id_ed25519").exists());
        assert!(dir.join("id_ed25519.pub").exists());
        assert!(dir.ends_with(format!("agent-pkey{}", identity.agent_id)));
    }

    #[test]
    fn setup_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let cfg = Config::test_default(tmp.path());
        let id1 = setup(&cfg).unwrap();
        let id2 = setup(&cfg).unwrap();
        assert_eq!(id1.agent_id, id2.agent_id);
    }

    #[test]
    fn setup_errors_when_multiple_identity_dirs_exist_without_explicit_config() {
        let tmp = TempDir::new().unwrap();
        for name in ["agent-pkeyaaaa", "agent-pkeybbbb"] {
            let dir = tmp.path().join(name);
            fs::create_dir_all(&dir).unwrap();
            save_keypair(&dir, &generate_seed()).unwrap();
        }

        let err = setup(&Config::test_default(tmp.path())).unwrap_err();
        assert!(err.to_string().contains("multiple identity directories found"));
    }

    #[test]
    fn setup_uses_explicit_identity_dir_when_configured() {
        let tmp = TempDir::new().unwrap();
        let explicit = tmp.path().join("custom-keys");

        let mut cfg = Config::test_default(tmp.path());
        cfg.identity_dir = Some(explicit.clone());

        let first = setup(&cfg).unwrap();
        assert_eq!(first.identity_dir.as_deref(), Some(explicit.as_path()));
        let second = setup(&cfg).unwrap();
        assert_eq!(first.agent_id, second.agent_id);
    }

    #[cfg(unix)]
    #[test]
    fn secret_key_mode_is_0600() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let identity = setup(&Config::test_default(tmp.path())).unwrap();
        let mode = fs::metadata(identity.identity_dir.unwrap().join("id_ed25519"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
