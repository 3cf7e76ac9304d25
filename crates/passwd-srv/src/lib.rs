//! passwd-srv: privileged password and account daemon.
//!
//! Unprivileged programs send RSA-OAEP encrypted requests over a local unix
//! socket. The daemon works out who is calling from kernel socket state,
//! checks that user's group membership and then changes a password, adds a
//! user or deletes a user. Every shadow file access runs under the system
//! password-file lock.
//!
//! Security invariants:
//! - Identity claims inside a request are never used for authorization
//! - `root` may do anything; `ovsdb-client` members may change passwords;
//!   `ops_admin` members may add and delete users
//! - Only the hash field of the target shadow row is ever rewritten
//! - A user whose password cannot be set after creation is removed again

pub mod accounts;
pub mod config;
pub mod directory;
pub mod error;
pub mod hashing;
pub mod identity;
pub mod keys;
pub mod privilege;
pub mod processor;
pub mod server;
pub mod shadow;
pub mod transport;
pub mod validate;

pub use error::{RequestError, ServerError};
pub use server::{DaemonOptions, Server, run_daemon};
