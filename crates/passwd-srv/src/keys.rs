//! The server keypair.
//!
//! Generated once at startup. The public half is published as a PKCS#1 PEM
//! file; the private half never leaves process memory.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use log::{info, warn};
use nix::unistd::{Gid, chown};
use openssl::pkey::Private;
use openssl::rsa::{Padding, Rsa};
use passwd_srv_protocol::KEY_BITS;
use zeroize::Zeroizing;

use crate::error::KeyError;

/// Mode of the published public key file.
pub const PUBLIC_KEY_MODE: u32 = 0o640;

pub struct KeyManager {
    rsa: Rsa<Private>,
}

impl KeyManager {
    /// Generate a fresh 2048-bit keypair with public exponent 65537.
    pub fn generate() -> Result<Self, KeyError> {
        let rsa = Rsa::generate(KEY_BITS).map_err(KeyError::Generate)?;
        Ok(Self { rsa })
    }

    /// Size of one ciphertext block in bytes.
    pub fn ciphertext_len(&self) -> usize {
        self.rsa.size() as usize
    }

    pub fn public_key_pem(&self) -> Result<Vec<u8>, KeyError> {
        self.rsa.public_key_to_pem_pkcs1().map_err(KeyError::Encode)
    }

    /// Write the public key to `path`, replacing any stale file, and hand it
    /// to `group` when given.
    pub fn publish(&self, path: &Path, group: Option<u32>) -> Result<(), KeyError> {
        let pem = self.public_key_pem()?;
        let write_err = |source| KeyError::Write {
            path: path.to_path_buf(),
            source,
        };

        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(write_err(e)),
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(PUBLIC_KEY_MODE)
            .open(path)
            .map_err(write_err)?;
        file.write_all(&pem).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;

        match group {
            Some(gid) => {
                if let Err(e) = chown(path, None, Some(Gid::from_raw(gid))) {
                    warn!("Failed to set group of {}: {e}", path.display());
                }
            }
            None => warn!(
                "Client group not found, {} stays owned by the daemon's group",
                path.display()
            ),
        }

        info!("Published public key to {}", path.display());
        Ok(())
    }

    /// Decrypt one OAEP ciphertext block.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        let mut plaintext = Zeroizing::new(vec![0u8; self.ciphertext_len()]);
        let len = self
            .rsa
            .private_decrypt(ciphertext, &mut plaintext, Padding::PKCS1_OAEP)
            .map_err(KeyError::Decrypt)?;
        plaintext.truncate(len);
        Ok(plaintext)
    }
}
