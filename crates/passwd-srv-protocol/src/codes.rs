//! Operation and status codes.
//!
//! The numeric values are part of the deployed wire format and must not be
//! renumbered.

use std::fmt;

use thiserror::Error;

/// A numeric code that does not map to any known variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown code {0}")]
pub struct UnknownCode(pub i32);

/// Operation requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Opcode {
    ChangePassword = 1,
    AddUser = 2,
    DeleteUser = 3,
}

impl Opcode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for Opcode {
    type Error = UnknownCode;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ChangePassword),
            2 => Ok(Self::AddUser),
            3 => Ok(Self::DeleteUser),
            other => Err(UnknownCode(other)),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ChangePassword => "change-password",
            Self::AddUser => "add-user",
            Self::DeleteUser => "delete-user",
        };
        f.write_str(name)
    }
}

/// Status returned to the client after a request has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    Fatal = -1,
    Success = 0,
    UserNotFound = 1,
    PasswordNotMatch = 2,
    ShadowFile = 3,
    InvalidMsg = 4,
    InsufficientMem = 5,
    RecvFailed = 6,
    InvalidOpcode = 7,
    InvalidUser = 8,
    InvalidParam = 9,
    PasswdUpdFail = 10,
    SendFailed = 11,
    UseraddFailed = 12,
    UserExist = 13,
    UserdelFailed = 14,
    DecryptFailed = 15,
    YamlFile = 16,
}

impl Status {
    const ALL: [Status; 18] = [
        Self::Fatal,
        Self::Success,
        Self::UserNotFound,
        Self::PasswordNotMatch,
        Self::ShadowFile,
        Self::InvalidMsg,
        Self::InsufficientMem,
        Self::RecvFailed,
        Self::InvalidOpcode,
        Self::InvalidUser,
        Self::InvalidParam,
        Self::PasswdUpdFail,
        Self::SendFailed,
        Self::UseraddFailed,
        Self::UserExist,
        Self::UserdelFailed,
        Self::DecryptFailed,
        Self::YamlFile,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Encode as the 4-byte wire reply.
    pub fn to_wire(self) -> [u8; 4] {
        self.code().to_ne_bytes()
    }

    /// Decode a 4-byte wire reply.
    pub fn from_wire(bytes: [u8; 4]) -> Result<Self, UnknownCode> {
        Self::try_from(i32::from_ne_bytes(bytes))
    }

    /// Short human-readable description, suitable for CLI output.
    pub fn describe(self) -> &'static str {
        match self {
            Self::Fatal => "fatal error",
            Self::Success => "operation succeeded",
            Self::UserNotFound => "user not found",
            Self::PasswordNotMatch => "old password cannot be validated",
            Self::ShadowFile => "error accessing shadow file",
            Self::InvalidMsg => "received invalid message",
            Self::InsufficientMem => "failed to allocate memory",
            Self::RecvFailed => "failed to receive message",
            Self::InvalidOpcode => "invalid operation code",
            Self::InvalidUser => "user does not have privilege",
            Self::InvalidParam => "invalid parameter",
            Self::PasswdUpdFail => "password update failed",
            Self::SendFailed => "failed to send message",
            Self::UseraddFailed => "failed to add user",
            Self::UserExist => "user already exists",
            Self::UserdelFailed => "failed to delete user",
            Self::DecryptFailed => "failed to decrypt client message",
            Self::YamlFile => "error accessing yaml file",
        }
    }
}

impl TryFrom<i32> for Status {
    type Error = UnknownCode;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|s| s.code() == value)
            .ok_or(UnknownCode(value))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.describe(), self.code())
    }
}
