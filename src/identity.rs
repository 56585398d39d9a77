//! One-shot SSH identity for worker dial-back.
//!
//! Workers authenticate to the controller's sshd with a keypair generated
//! at startup. The public half is appended to the authorized_keys file
//! for the controller's lifetime and removed again on orderly shutdown;
//! the private half travels to workers inside the invocation payload.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::rngs::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey, PublicKey};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("key generation failed: {0}")]
    Key(#[from] ssh_key::Error),
    #[error("generated key already present in {0}")]
    KeyAlreadyInstalled(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct SshIdentity {
    auth_path: PathBuf,
    private_key_pem: String,
    public_entry: String,
    invalidated: AtomicBool,
}

impl SshIdentity {
    /// Generate a fresh keypair and install its public half in the
    /// authorized_keys file at `auth_path` (created 0600 if absent).
    pub fn generate(auth_path: PathBuf) -> Result<Self, IdentityError> {
        let private = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?;
        let private_key_pem = private.to_openssh(LineEnding::LF)?.to_string();
        let public = PublicKey::new(private.public_key().key_data().clone(), "rotor-egress");
        let public_entry = public.to_openssh()?;

        let existing = match fs::read_to_string(&auth_path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        if existing.contains(&public_entry) {
            return Err(IdentityError::KeyAlreadyInstalled(auth_path));
        }

        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&public_entry);
        updated.push('\n');
        write_restricted(&auth_path, &updated)?;

        info!(path = %auth_path.display(), "tunnel key installed");
        Ok(Self {
            auth_path,
            private_key_pem,
            public_entry,
            invalidated: AtomicBool::new(false),
        })
    }

    /// OpenSSH-encoded private key, as carried in the worker payload.
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    #[cfg(test)]
    pub(crate) fn public_entry(&self) -> &str {
        &self.public_entry
    }

    /// Remove exactly the generated public key from the authorized_keys
    /// file. Idempotent; the file is rewritten with mode 0600.
    pub fn invalidate(&self) -> Result<(), IdentityError> {
        if self.invalidated.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let contents = fs::read_to_string(&self.auth_path)?;
        let remaining: String = contents
            .lines()
            .filter(|line| line.trim() != self.public_entry)
            .map(|line| format!("{line}\n"))
            .collect();
        write_restricted(&self.auth_path, &remaining)?;
        info!(path = %self.auth_path.display(), "tunnel key removed");
        Ok(())
    }
}

fn write_restricted(path: &PathBuf, contents: &str) -> std::io::Result<()> {
    fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_appends_single_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        fs::write(&path, "ssh-ed25519 AAAAexisting user@host\n").unwrap();

        let identity = SshIdentity::generate(path.clone()).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains(identity.public_entry()));
        assert!(identity.private_key_pem().contains("OPENSSH PRIVATE KEY"));
    }

    #[test]
    fn test_generate_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");

        let identity = SshIdentity::generate(path.clone()).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), identity.public_entry());
    }

    #[test]
    fn test_invalidate_restores_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        let original = "ssh-ed25519 AAAAexisting user@host\n";
        fs::write(&path, original).unwrap();

        let identity = SshIdentity::generate(path.clone()).unwrap();
        identity.invalidate().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), original);

        // Idempotent.
        identity.invalidate().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), original);
    }

    #[cfg(unix)]
    #[test]
    fn test_invalidate_sets_restrictive_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        let identity = SshIdentity::generate(path.clone()).unwrap();
        identity.invalidate().unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
