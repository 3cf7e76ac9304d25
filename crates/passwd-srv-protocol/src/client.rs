//! Blocking client for the daemon.
//!
//! Callers seal a [`Request`] with the published public key, write the
//! ciphertext and read back a single status code.

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use openssl::pkey::Public;
use openssl::rsa::{Padding, Rsa};
use thiserror::Error;

use crate::codes::{Status, UnknownCode};
use crate::{Request, STATUS_SIZE};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to read public key {path}: {source}")]
    ReadKey { path: String, source: io::Error },

    #[error("invalid public key: {0}")]
    InvalidKey(openssl::error::ErrorStack),

    #[error("encryption failed: {0}")]
    Encrypt(openssl::error::ErrorStack),

    #[error("failed to connect to {path}: {source}")]
    Connect { path: String, source: io::Error },

    #[error("i/o error talking to daemon: {0}")]
    Io(#[from] io::Error),

    #[error("daemon replied with {0}")]
    UnknownStatus(#[from] UnknownCode),
}

/// Parse a public key in either PKCS#1 (`RSA PUBLIC KEY`) or SPKI
/// (`PUBLIC KEY`) PEM form.
pub fn parse_public_key(pem: &[u8]) -> Result<Rsa<Public>, ClientError> {
    match Rsa::public_key_from_pem_pkcs1(pem) {
        Ok(key) => Ok(key),
        Err(_) => Rsa::public_key_from_pem(pem).map_err(ClientError::InvalidKey),
    }
}

/// Encrypt a request with RSA-OAEP. The result is exactly one key-size block.
pub fn seal(public_key_pem: &[u8], request: &Request) -> Result<Vec<u8>, ClientError> {
    let key = parse_public_key(public_key_pem)?;
    let plaintext = request.encode();
    let mut out = vec![0u8; key.size() as usize];
    let len = key
        .public_encrypt(&plaintext, &mut out, Padding::PKCS1_OAEP)
        .map_err(ClientError::Encrypt)?;
    out.truncate(len);
    Ok(out)
}

/// Perform one request/response round trip.
pub fn send(
    socket_path: impl AsRef<Path>,
    public_key_path: impl AsRef<Path>,
    request: &Request,
) -> Result<Status, ClientError> {
    let key_path = public_key_path.as_ref();
    let pem = fs::read(key_path).map_err(|source| ClientError::ReadKey {
        path: key_path.display().to_string(),
        source,
    })?;
    let ciphertext = seal(&pem, request)?;

    let socket_path = socket_path.as_ref();
    let mut stream = UnixStream::connect(socket_path).map_err(|source| ClientError::Connect {
        path: socket_path.display().to_string(),
        source,
    })?;
    stream.write_all(&ciphertext)?;

    let mut reply = [0u8; STATUS_SIZE];
    stream.read_exact(&mut reply)?;
    Ok(Status::from_wire(reply)?)
}
