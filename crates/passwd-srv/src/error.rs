//! Error types for the daemon.
//!
//! Infrastructure errors (config, keys, transport) stop the daemon and surface
//! as [`ServerError`]. Everything that can go wrong while handling a single
//! connection is a [`RequestError`] and maps to exactly one wire [`Status`].

use std::io;
use std::path::PathBuf;

use nix::errno::Errno;
use openssl::error::ErrorStack;
use passwd_srv_protocol::{FieldError, Opcode, Status};
use thiserror::Error;

use crate::config::PathType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{kind} path is too long ({len} bytes, max {max})")]
    PathTooLong {
        kind: PathType,
        len: usize,
        max: usize,
    },

    #[error("no {0} path configured")]
    Missing(PathType),
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("failed to generate RSA keypair: {0}")]
    Generate(#[source] ErrorStack),

    #[error("failed to encode public key: {0}")]
    Encode(#[source] ErrorStack),

    #[error("failed to write public key {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to decrypt request: {0}")]
    Decrypt(#[source] ErrorStack),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to create socket: {0}")]
    Socket(#[source] Errno),

    #[error("failed to bind {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: Errno,
    },

    #[error("failed to set permissions on {}: {source}", path.display())]
    Permissions {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen: {0}")]
    Listen(#[source] Errno),

    #[error("accept failed: {0}")]
    Accept(#[source] Errno),

    #[error("failed to wait for clients: {0}")]
    Poll(#[source] Errno),

    #[error("failed to set receive timeout: {0}")]
    Timeout(#[source] io::Error),

    #[error("failed to peek request: {0}")]
    Peek(#[source] Errno),

    #[error("short request: got {got} of {want} bytes")]
    ShortRead { got: usize, want: usize },

    #[error("failed to send reply: {0}")]
    Send(#[source] Errno),
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to resolve socket inode from {}: {source}", path.display())]
    OwnInode {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("descriptor does not refer to a socket: {0}")]
    NotSocket(String),

    #[error("sock_diag channel error: {0}")]
    Channel(#[source] Errno),

    #[error("kernel reported sock_diag error {0}")]
    Kernel(i32),

    #[error("sock_diag channel closed before dump finished")]
    Closed,

    #[error("gave up after {0} failed sock_diag receives")]
    RetriesExhausted(u32),

    #[error("no diagnostic entry for socket inode {0}")]
    NoEntry(u32),

    #[error("socket inode {0} has no peer")]
    NoPeer(u32),

    #[error("failed to scan {}: {source}", path.display())]
    ProcScan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no process holds socket inode {0}")]
    NoProcess(u32),

    #[error("failed to read status of pid {pid}: {source}")]
    ProcStatus {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("no Uid line in status of pid {0}")]
    NoUid(u32),

    #[error("uid {0} has no user entry")]
    UnknownUid(u32),

    #[error("user database lookup failed: {0}")]
    Directory(#[source] Errno),
}

#[derive(Debug, Error)]
pub enum ShadowError {
    #[error("failed to lock password files: {0}")]
    Lock(#[source] io::Error),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no shadow entry for {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("failed to execute {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{tool} failed (exit {code}): {stderr}")]
    Failed {
        tool: String,
        code: i32,
        stderr: String,
    },
}

#[derive(Debug, Error)]
pub enum HashError {
    #[error("crypt failed: {0}")]
    Crypt(#[source] io::Error),

    #[error("bcrypt failed: {0}")]
    Bcrypt(#[from] bcrypt::BcryptError),
}

/// Failure while handling one connection.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("failed to receive request: {0}")]
    Receive(#[source] TransportError),

    #[error("{0}")]
    Decrypt(#[source] KeyError),

    #[error("short ciphertext: {0}")]
    ShortCiphertext(#[source] TransportError),

    #[error("unsupported op code {0}")]
    InvalidOpcode(i32),

    #[error("could not identify peer: {0}")]
    Unidentified(#[source] IdentityError),

    #[error("{user} may not {op}")]
    Unauthorized { user: String, op: Opcode },

    #[error("invalid request field: {0}")]
    Field(#[from] FieldError),

    #[error("invalid username: {0}")]
    InvalidUsername(String),

    #[error("user {0} not found")]
    UserNotFound(String),

    #[error("old password does not match for {0}")]
    PasswordMismatch(String),

    #[error("shadow lookup failed: {0}")]
    ShadowFile(#[source] ShadowError),

    #[error("user {0} already exists")]
    UserExists(String),

    #[error("failed to add user {user}: {reason}")]
    AddFailed { user: String, reason: String },

    #[error("failed to delete user {user}: {reason}")]
    DeleteFailed { user: String, reason: String },

    #[error("failed to hash new password: {0}")]
    Hash(#[from] HashError),

    #[error("password update for {0} found no shadow row")]
    UpdateFailed(String),

    #[error("shadow update failed: {0}")]
    Store(#[source] ShadowError),
}

impl RequestError {
    /// The status code reported to the client.
    pub fn status(&self) -> Status {
        match self {
            Self::Receive(_) => Status::RecvFailed,
            Self::Decrypt(_) | Self::ShortCiphertext(_) => Status::DecryptFailed,
            Self::InvalidOpcode(_) => Status::InvalidOpcode,
            Self::Unidentified(_) | Self::Unauthorized { .. } => Status::InvalidUser,
            Self::Field(_) | Self::InvalidUsername(_) => Status::InvalidParam,
            Self::UserNotFound(_) => Status::UserNotFound,
            Self::PasswordMismatch(_) => Status::PasswordNotMatch,
            Self::ShadowFile(_) => Status::ShadowFile,
            Self::UserExists(_) => Status::UserExist,
            Self::AddFailed { .. } => Status::UseraddFailed,
            Self::DeleteFailed { .. } => Status::UserdelFailed,
            Self::Hash(_) | Self::UpdateFailed(_) => Status::PasswdUpdFail,
            Self::Store(_) => Status::Fatal,
        }
    }
}

/// Errors that stop the daemon.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to prepare run directory {}: {source}", path.display())]
    RunDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to install signal handlers: {0}")]
    Signal(#[source] Errno),
}
