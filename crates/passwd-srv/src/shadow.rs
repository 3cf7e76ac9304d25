//! The shadow password database.
//!
//! Every access runs under the system password-file lock. Entries are never
//! cached; each lookup re-reads the file. Updates rewrite the whole file
//! through `<shadow>+` and rename it into place, touching only the hash field
//! of the target row.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use zeroize::Zeroizing;

use crate::error::ShadowError;

pub const DEFAULT_SHADOW_PATH: &str = "/etc/shadow";

/// A lock serializing access to the password files with other tools.
pub trait PasswordLock {
    fn lock(&self) -> io::Result<()>;
    fn unlock(&self) -> io::Result<()>;
}

unsafe extern "C" {
    fn lckpwdf() -> libc::c_int;
    fn ulckpwdf() -> libc::c_int;
}

/// The libc `lckpwdf(3)` lock, shared with `passwd`, `useradd` and friends.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPwdLock;

impl PasswordLock for SystemPwdLock {
    fn lock(&self) -> io::Result<()> {
        // SAFETY: lckpwdf takes no arguments and only touches libc state.
        if unsafe { lckpwdf() } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn unlock(&self) -> io::Result<()> {
        // SAFETY: as above.
        if unsafe { ulckpwdf() } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Releases the password lock when dropped.
struct LockGuard<'a, L: PasswordLock + ?Sized> {
    lock: &'a L,
}

impl<'a, L: PasswordLock + ?Sized> LockGuard<'a, L> {
    fn acquire(lock: &'a L) -> Result<Self, ShadowError> {
        lock.lock().map_err(ShadowError::Lock)?;
        Ok(Self { lock })
    }
}

impl<L: PasswordLock + ?Sized> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            debug!("Failed to unlock password files: {e}");
        }
    }
}

/// One row of the shadow file.
#[derive(Clone)]
pub struct ShadowEntry {
    name: String,
    hash: Zeroizing<String>,
    /// Everything after the hash field, leading `:` included.
    tail: String,
}

impl ShadowEntry {
    /// Parse one line (without its newline). Lines without a `:` are not
    /// entries.
    pub fn parse(line: &str) -> Option<Self> {
        let (name, rest) = line.split_once(':')?;
        if name.is_empty() {
            return None;
        }
        let (hash, tail) = match rest.find(':') {
            Some(i) => rest.split_at(i),
            None => (rest, ""),
        };
        Some(Self {
            name: name.to_string(),
            hash: Zeroizing::new(hash.to_string()),
            tail: tail.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Day of the last password change, if recorded.
    pub fn last_change(&self) -> Option<u64> {
        self.tail.split(':').nth(1)?.parse().ok()
    }

    fn render_with_hash(&self, hash: &str) -> String {
        format!("{}:{}{}", self.name, hash, self.tail)
    }
}

impl fmt::Debug for ShadowEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowEntry")
            .field("name", &self.name)
            .field("hash", &"<redacted>")
            .field("tail", &self.tail)
            .finish()
    }
}

/// Shadow database at `path`, guarded by `lock`.
#[derive(Debug)]
pub struct ShadowDb<L> {
    path: PathBuf,
    lock: L,
}

impl ShadowDb<SystemPwdLock> {
    pub fn system(path: impl Into<PathBuf>) -> Self {
        Self::new(path, SystemPwdLock)
    }
}

impl<L: PasswordLock> ShadowDb<L> {
    pub fn new(path: impl Into<PathBuf>, lock: L) -> Self {
        Self {
            path: path.into(),
            lock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Find the entry for `username`.
    pub fn lookup(&self, username: &str) -> Result<Option<ShadowEntry>, ShadowError> {
        let _guard = LockGuard::acquire(&self.lock)?;
        let content = self.read()?;
        Ok(content
            .lines()
            .filter_map(ShadowEntry::parse)
            .find(|e| e.name == username))
    }

    /// Replace the stored hash of `username`.
    pub fn set_password(&self, username: &str, hash: &str) -> Result<(), ShadowError> {
        let _guard = LockGuard::acquire(&self.lock)?;
        let content = self.read()?;

        let mut updated = Zeroizing::new(String::with_capacity(content.len() + hash.len()));
        let mut found = false;
        for line in content.split_inclusive('\n') {
            let (body, eol) = match line.strip_suffix('\n') {
                Some(body) => (body, "\n"),
                None => (line, ""),
            };
            if !found
                && let Some(entry) = ShadowEntry::parse(body)
                && entry.name == username
            {
                updated.push_str(&entry.render_with_hash(hash));
                updated.push_str(eol);
                found = true;
                continue;
            }
            updated.push_str(line);
        }

        if !found {
            return Err(ShadowError::NotFound(username.to_string()));
        }
        self.replace(updated.as_bytes())?;
        debug!("Updated shadow entry for {username}");
        Ok(())
    }

    fn read(&self) -> Result<Zeroizing<String>, ShadowError> {
        fs::read_to_string(&self.path)
            .map(Zeroizing::new)
            .map_err(|source| ShadowError::Read {
                path: self.path.clone(),
                source,
            })
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push("+");
        PathBuf::from(name)
    }

    fn replace(&self, data: &[u8]) -> Result<(), ShadowError> {
        let meta = fs::metadata(&self.path).map_err(|source| ShadowError::Read {
            path: self.path.clone(),
            source,
        })?;
        let tmp = self.temp_path();
        let result = write_replacement(&tmp, data, &meta).and_then(|()| fs::rename(&tmp, &self.path));
        if let Err(source) = result {
            if let Err(e) = fs::remove_file(&tmp)
                && e.kind() != io::ErrorKind::NotFound
            {
                warn!("Failed to remove {}: {e}", tmp.display());
            }
            return Err(ShadowError::Write {
                path: self.path.clone(),
                source,
            });
        }
        Ok(())
    }
}

fn write_replacement(tmp: &Path, data: &[u8], original: &fs::Metadata) -> io::Result<()> {
    let mut file: File = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    std::os::unix::fs::fchown(&file, Some(original.uid()), Some(original.gid()))?;
    file.set_permissions(fs::Permissions::from_mode(original.mode() & 0o7777))?;
    Ok(())
}
