//! Test utilities and common setup.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::fd::BorrowedFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use passwd_srv::accounts::AccountTool;
use passwd_srv::directory::UserDirectory;
use passwd_srv::error::{AccountError, IdentityError};
use passwd_srv::hashing::HashMethod;
use passwd_srv::identity::PeerResolver;
use passwd_srv::processor::Processor;
use passwd_srv::shadow::{PasswordLock, ShadowDb};

/// Shadow row template used for freshly added accounts.
pub const NEW_ACCOUNT_TAIL: &str = ":!:19000:0:99999:7:::";

/// Write a shadow file with one row per `(name, password)`, hashed with SHA-512.
pub fn write_shadow(dir: &Path, users: &[(&str, &str)]) -> PathBuf {
    let mut content = String::from("root:*:19000:0:99999:7:::\n");
    for (name, password) in users {
        let hash = HashMethod::Sha512.hash(password).unwrap();
        content.push_str(&format!("{name}:{}:19000:0:99999:7:::\n", hash.as_str()));
    }
    let path = dir.join("shadow");
    fs::write(&path, content).unwrap();
    path
}

pub fn shadow_names(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter_map(|l| l.split(':').next())
        .map(str::to_owned)
        .collect()
}

/// Password lock that counts acquisitions and fails the `fail_on`th one.
#[derive(Debug, Default)]
pub struct CountingLock {
    acquired: Cell<u32>,
    fail_on: Option<u32>,
}

impl CountingLock {
    pub fn failing_on(n: u32) -> Self {
        Self {
            acquired: Cell::new(0),
            fail_on: Some(n),
        }
    }

    pub fn acquired(&self) -> u32 {
        self.acquired.get()
    }
}

impl PasswordLock for CountingLock {
    fn lock(&self) -> io::Result<()> {
        let n = self.acquired.get() + 1;
        self.acquired.set(n);
        if self.fail_on == Some(n) {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"));
        }
        Ok(())
    }

    fn unlock(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Account tool that edits the shadow file directly, like useradd/userdel
/// would.
#[derive(Debug)]
pub struct FileAccountTool {
    shadow: PathBuf,
    pub calls: RefCell<Vec<String>>,
}

impl FileAccountTool {
    pub fn new(shadow: impl Into<PathBuf>) -> Self {
        Self {
            shadow: shadow.into(),
            calls: RefCell::new(Vec::new()),
        }
    }
}

impl AccountTool for FileAccountTool {
    fn add_user(&self, username: &str) -> Result<(), AccountError> {
        self.calls.borrow_mut().push(format!("add {username}"));
        let mut content = fs::read_to_string(&self.shadow).unwrap();
        content.push_str(&format!("{username}{NEW_ACCOUNT_TAIL}\n"));
        fs::write(&self.shadow, content).unwrap();
        Ok(())
    }

    fn delete_user(&self, username: &str) -> Result<(), AccountError> {
        self.calls.borrow_mut().push(format!("del {username}"));
        let prefix = format!("{username}:");
        let content: String = fs::read_to_string(&self.shadow)
            .unwrap()
            .lines()
            .filter(|l| !l.starts_with(&prefix))
            .map(|l| format!("{l}\n"))
            .collect();
        fs::write(&self.shadow, content).unwrap();
        Ok(())
    }
}

/// In-memory user and group database.
#[derive(Debug, Default)]
pub struct MapDirectory {
    users: HashMap<u32, String>,
    groups: HashMap<String, Vec<String>>,
}

impl MapDirectory {
    pub fn with_user(mut self, uid: u32, name: &str, groups: &[&str]) -> Self {
        self.users.insert(uid, name.to_owned());
        self.groups.insert(
            name.to_owned(),
            groups.iter().map(|g| (*g).to_owned()).collect(),
        );
        self
    }
}

impl UserDirectory for MapDirectory {
    fn username_of(&self, uid: u32) -> Result<Option<String>, Errno> {
        Ok(self.users.get(&uid).cloned())
    }

    fn groups_of(&self, username: &str) -> Result<Vec<String>, Errno> {
        Ok(self.groups.get(username).cloned().unwrap_or_default())
    }

    fn group_id(&self, _name: &str) -> Result<Option<u32>, Errno> {
        Ok(None)
    }
}

/// The standard cast: `alice` may change passwords, `admin` manages
/// accounts, `mallory` is nobody.
pub fn directory() -> MapDirectory {
    MapDirectory::default()
        .with_user(0, "root", &["root"])
        .with_user(1000, "alice", &["alice", "ovsdb-client"])
        .with_user(1001, "admin", &["admin", "ops_admin"])
        .with_user(1002, "mallory", &["mallory"])
}

/// Resolver that reports a fixed caller regardless of the connection.
#[derive(Debug, Clone)]
pub struct StaticResolver(pub Option<String>);

impl StaticResolver {
    pub fn user(name: &str) -> Self {
        Self(Some(name.to_owned()))
    }
}

impl PeerResolver for StaticResolver {
    fn resolve(&self, _conn: BorrowedFd<'_>) -> Result<String, IdentityError> {
        self.0.clone().ok_or(IdentityError::Closed)
    }
}

pub type TestProcessor = Processor<CountingLock, FileAccountTool, MapDirectory>;

pub fn processor(shadow: &Path, lock: CountingLock) -> TestProcessor {
    Processor::new(
        ShadowDb::new(shadow, lock),
        FileAccountTool::new(shadow),
        directory(),
    )
    .with_hash_method(HashMethod::Sha512)
}
