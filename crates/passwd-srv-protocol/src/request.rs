//! The fixed-layout request record.
//!
//! Layout (154 bytes, no padding):
//!
//! | offset | size | field                              |
//! |--------|------|------------------------------------|
//! | 0      | 4    | op code, native-endian `i32`       |
//! | 4      | 50   | username, NUL-terminated           |
//! | 54     | 50   | old password, NUL-terminated       |
//! | 104    | 50   | new password, NUL-terminated       |

use std::fmt;

use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::codes::{Opcode, UnknownCode};

/// Size of the username field, terminator included.
pub const USERNAME_SIZE: usize = 50;

/// Size of each password field, terminator included.
pub const PASSWORD_SIZE: usize = 50;

/// Total encoded size of a request.
pub const REQUEST_SIZE: usize = 4 + USERNAME_SIZE + 2 * PASSWORD_SIZE;

const USERNAME_OFFSET: usize = 4;
const OLD_PASSWORD_OFFSET: usize = USERNAME_OFFSET + USERNAME_SIZE;
const NEW_PASSWORD_OFFSET: usize = OLD_PASSWORD_OFFSET + PASSWORD_SIZE;

/// Errors building a request on the client side.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("{field} is too long ({len} > {max} bytes)")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{0} contains a NUL byte")]
    EmbeddedNul(&'static str),
}

/// A text field inside a decoded request could not be read.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("{0} is not NUL-terminated")]
    Unterminated(&'static str),

    #[error("{0} is not valid UTF-8")]
    NotUtf8(&'static str),
}

/// One decrypted client request. Wiped from memory when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Request {
    op_code: i32,
    username: [u8; USERNAME_SIZE],
    old_password: [u8; PASSWORD_SIZE],
    new_password: [u8; PASSWORD_SIZE],
}

impl Request {
    pub fn new(
        opcode: Opcode,
        username: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<Self, RequestError> {
        Self::with_raw_opcode(opcode.as_i32(), username, old_password, new_password)
    }

    /// Build a request carrying an arbitrary op code, including ones the
    /// daemon does not support.
    pub fn with_raw_opcode(
        op_code: i32,
        username: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<Self, RequestError> {
        let mut req = Self {
            op_code,
            username: [0; USERNAME_SIZE],
            old_password: [0; PASSWORD_SIZE],
            new_password: [0; PASSWORD_SIZE],
        };
        fill_field(&mut req.username, "username", username)?;
        fill_field(&mut req.old_password, "old password", old_password)?;
        fill_field(&mut req.new_password, "new password", new_password)?;
        Ok(req)
    }

    /// Decode a decrypted payload.
    ///
    /// Shorter input is treated as zero-padded; bytes past the record are
    /// ignored. Structural problems surface later through the accessors.
    pub fn decode(plaintext: &[u8]) -> Self {
        let mut raw = Zeroizing::new([0u8; REQUEST_SIZE]);
        let len = plaintext.len().min(REQUEST_SIZE);
        raw[..len].copy_from_slice(&plaintext[..len]);

        let mut req = Self {
            op_code: i32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]),
            username: [0; USERNAME_SIZE],
            old_password: [0; PASSWORD_SIZE],
            new_password: [0; PASSWORD_SIZE],
        };
        req.username
            .copy_from_slice(&raw[USERNAME_OFFSET..OLD_PASSWORD_OFFSET]);
        req.old_password
            .copy_from_slice(&raw[OLD_PASSWORD_OFFSET..NEW_PASSWORD_OFFSET]);
        req.new_password
            .copy_from_slice(&raw[NEW_PASSWORD_OFFSET..REQUEST_SIZE]);
        req
    }

    /// Encode to the fixed wire layout.
    pub fn encode(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(REQUEST_SIZE));
        out.extend_from_slice(&self.op_code.to_ne_bytes());
        out.extend_from_slice(&self.username);
        out.extend_from_slice(&self.old_password);
        out.extend_from_slice(&self.new_password);
        out
    }

    /// The raw op code exactly as received.
    pub fn op_code(&self) -> i32 {
        self.op_code
    }

    pub fn opcode(&self) -> Result<Opcode, UnknownCode> {
        Opcode::try_from(self.op_code)
    }

    pub fn username(&self) -> Result<&str, FieldError> {
        read_field(&self.username, "username")
    }

    pub fn old_password(&self) -> Result<&str, FieldError> {
        read_field(&self.old_password, "old password")
    }

    pub fn new_password(&self) -> Result<&str, FieldError> {
        read_field(&self.new_password, "new password")
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("op_code", &self.op_code)
            .field("username", &self.username())
            .field("old_password", &"<redacted>")
            .field("new_password", &"<redacted>")
            .finish()
    }
}

fn fill_field(dst: &mut [u8], field: &'static str, value: &str) -> Result<(), RequestError> {
    let bytes = value.as_bytes();
    // One byte is reserved for the terminator.
    let max = dst.len() - 1;
    if bytes.len() > max {
        return Err(RequestError::TooLong {
            field,
            len: bytes.len(),
            max,
        });
    }
    if bytes.contains(&0) {
        return Err(RequestError::EmbeddedNul(field));
    }
    dst[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn read_field<'a>(raw: &'a [u8], field: &'static str) -> Result<&'a str, FieldError> {
    let end = raw
        .iter()
        .position(|&b| b == 0)
        .ok_or(FieldError::Unterminated(field))?;
    std::str::from_utf8(&raw[..end]).map_err(|_| FieldError::NotUtf8(field))
}
