//! passwd-srv wire protocol.
//!
//! Shared between the privileged `passwd-srvd` daemon and the unprivileged
//! programs that ask it to change passwords or manage accounts.
//!
//! One connection carries exactly one request:
//!   Request:  RSA-OAEP ciphertext (one key-size block) of a fixed 154-byte record
//!   Response: 4-byte native-endian signed status code, unencrypted
//!
//! The daemon never trusts any identity inside the request. It works out who
//! is calling from kernel socket state and authorizes against that.

pub mod client;
mod codes;
mod request;

pub use codes::{Opcode, Status, UnknownCode};
pub use request::{
    FieldError, PASSWORD_SIZE, REQUEST_SIZE, Request, RequestError, USERNAME_SIZE,
};

/// RSA modulus size used by the daemon, in bits.
pub const KEY_BITS: u32 = 2048;

/// Size of one ciphertext block on the wire, in bytes.
pub const CIPHERTEXT_SIZE: usize = (KEY_BITS / 8) as usize;

/// Size of a status reply on the wire, in bytes.
pub const STATUS_SIZE: usize = std::mem::size_of::<i32>();
