//! Password hashing in the crypt(3) formats found in `/etc/shadow`.
//!
//! Everything except bcrypt goes through the system libcrypt, so any format
//! the host can write (yescrypt included) can also be checked here.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use log::{debug, warn};
use rand::Rng;
use zeroize::Zeroizing;

use crate::error::HashError;

pub const DEFAULT_LOGIN_DEFS: &str = "/etc/login.defs";

const SALT_CHARS: &[u8] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

const DES_SALT_LEN: usize = 2;
const MD5_SALT_LEN: usize = 8;
const SHA_SALT_MIN: usize = 8;
const SHA_SALT_MAX: usize = 16;

const YESCRYPT_PREFIX: &str = "$y$";
const YESCRYPT_RANDOM_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMethod {
    Des,
    Md5,
    Sha256,
    Sha512,
    Yescrypt,
    Bcrypt,
}

impl HashMethod {
    /// Parse an `ENCRYPT_METHOD` value.
    pub fn from_name(name: &str) -> Option<Self> {
        let method = match name.to_ascii_uppercase().as_str() {
            "DES" => Self::Des,
            "MD5" => Self::Md5,
            "SHA256" => Self::Sha256,
            "SHA512" => Self::Sha512,
            "YESCRYPT" => Self::Yescrypt,
            "BCRYPT" | "BLOWFISH" => Self::Bcrypt,
            _ => return None,
        };
        Some(method)
    }

    /// Pick the method configured in `login.defs` text.
    ///
    /// `ENCRYPT_METHOD` wins; without it `MD5_CRYPT_ENAB yes` selects MD5 and
    /// anything else DES. An unrecognised `ENCRYPT_METHOD` falls back to
    /// SHA512.
    pub fn from_login_defs(text: &str) -> Self {
        let mut encrypt_method = None;
        let mut md5_enabled = false;

        for line in text.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some("ENCRYPT_METHOD"), Some(value)) if encrypt_method.is_none() => {
                    encrypt_method = Some(value);
                }
                (Some("MD5_CRYPT_ENAB"), Some(value)) => {
                    md5_enabled = value.eq_ignore_ascii_case("yes");
                }
                _ => {}
            }
        }

        match encrypt_method {
            Some(value) => Self::from_name(value).unwrap_or_else(|| {
                warn!("Unsupported ENCRYPT_METHOD {value}, using SHA512");
                Self::Sha512
            }),
            None if md5_enabled => Self::Md5,
            None => Self::Des,
        }
    }

    /// Read `login.defs` at `path`. A missing file selects DES.
    pub fn discover(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(text) => {
                let method = Self::from_login_defs(&text);
                debug!("Password hashing method from {}: {method}", path.display());
                method
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("{} not found, hashing passwords with DES", path.display());
                Self::Des
            }
            Err(e) => {
                warn!(
                    "Failed to read {}: {e}, hashing passwords with DES",
                    path.display()
                );
                Self::Des
            }
        }
    }

    /// Hash `password` with a fresh salt.
    pub fn hash(self, password: &str) -> Result<Zeroizing<String>, HashError> {
        let mut rng = rand::rng();
        let setting = match self {
            Self::Bcrypt => {
                let hashed = bcrypt::hash(password, bcrypt::DEFAULT_COST)?;
                return Ok(Zeroizing::new(hashed));
            }
            Self::Des => generate_salt(&mut rng, DES_SALT_LEN),
            Self::Md5 => format!("$1${}", generate_salt(&mut rng, MD5_SALT_LEN)),
            Self::Sha256 => format!("$5${}", sha_salt(&mut rng)),
            Self::Sha512 => format!("$6${}", sha_salt(&mut rng)),
            Self::Yescrypt => {
                let mut random = Zeroizing::new([0u8; YESCRYPT_RANDOM_BYTES]);
                rng.fill(&mut random[..]);
                crypt::gensalt(YESCRYPT_PREFIX, &random[..]).map_err(HashError::Crypt)?
            }
        };
        crypt::hash(password, &setting).map_err(HashError::Crypt)
    }
}

impl fmt::Display for HashMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Des => "DES",
            Self::Md5 => "MD5",
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
            Self::Yescrypt => "YESCRYPT",
            Self::Bcrypt => "BCRYPT",
        })
    }
}

/// Random salt of `len` characters from the crypt alphabet.
pub fn generate_salt<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| SALT_CHARS[rng.random_range(0..SALT_CHARS.len())] as char)
        .collect()
}

fn sha_salt<R: Rng + ?Sized>(rng: &mut R) -> String {
    let len = rng.random_range(SHA_SALT_MIN..=SHA_SALT_MAX);
    generate_salt(rng, len)
}

/// Check `password` against a stored shadow hash.
///
/// An empty stored hash only matches an empty password. Locked (`!`, `*`)
/// or otherwise unparseable hashes never match. The final comparison runs
/// in constant time.
pub fn verify(password: &str, stored: &str) -> bool {
    if stored.is_empty() {
        return password.is_empty();
    }
    if stored.starts_with('!') || stored.starts_with('*') {
        return false;
    }
    if stored.starts_with("$2") {
        return bcrypt::verify(password, stored).unwrap_or(false);
    }
    match crypt::hash(password, stored) {
        Ok(computed) => {
            computed.len() == stored.len()
                && openssl::memcmp::eq(computed.as_bytes(), stored.as_bytes())
        }
        Err(e) => {
            debug!("Stored hash rejected by crypt: {e}");
            false
        }
    }
}

/// Bindings to libcrypt (libxcrypt on current distributions).
mod crypt {
    use std::ffi::{CStr, CString, c_char, c_int, c_ulong};
    use std::io;

    use zeroize::Zeroizing;

    /// Scratch space for `crypt_r`. Larger than `struct crypt_data` in both
    /// libxcrypt and older glibc.
    const DATA_WORDS: usize = 256 * 1024 / 8;

    const GENSALT_OUTPUT_SIZE: usize = 192;

    #[link(name = "crypt")]
    unsafe extern "C" {
        fn crypt_r(phrase: *const c_char, setting: *const c_char, data: *mut u64) -> *mut c_char;

        fn crypt_gensalt_rn(
            prefix: *const c_char,
            count: c_ulong,
            rbytes: *const c_char,
            nrbytes: c_int,
            output: *mut c_char,
            output_size: c_int,
        ) -> *mut c_char;
    }

    fn invalid(msg: &str) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidInput, msg)
    }

    /// Hash `phrase` under `setting`, which may be a bare setting or a full
    /// stored hash.
    pub(super) fn hash(phrase: &str, setting: &str) -> io::Result<Zeroizing<String>> {
        let phrase = Zeroizing::new(
            CString::new(phrase)
                .map_err(|_| invalid("password contains NUL"))?
                .into_bytes_with_nul(),
        );
        let setting = CString::new(setting).map_err(|_| invalid("setting contains NUL"))?;
        let mut data = Zeroizing::new(vec![0u64; DATA_WORDS]);

        // SAFETY: both strings are NUL-terminated and `data` is zeroed and
        // at least as large as `struct crypt_data`.
        let out = unsafe {
            crypt_r(
                phrase.as_ptr().cast(),
                setting.as_ptr(),
                data.as_mut_ptr(),
            )
        };
        if out.is_null() {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: crypt_r returned a NUL-terminated string inside `data`.
        let out = unsafe { CStr::from_ptr(out) };
        let out = out.to_str().map_err(|_| invalid("crypt output is not UTF-8"))?;
        if out.starts_with('*') {
            return Err(invalid("unsupported or malformed setting"));
        }
        Ok(Zeroizing::new(out.to_owned()))
    }

    /// Build a setting string for `prefix` from caller-supplied random bytes.
    pub(super) fn gensalt(prefix: &str, random: &[u8]) -> io::Result<String> {
        let prefix = CString::new(prefix).map_err(|_| invalid("prefix contains NUL"))?;
        let nrbytes = c_int::try_from(random.len()).map_err(|_| invalid("too many bytes"))?;
        let mut output = [0u8; GENSALT_OUTPUT_SIZE];

        // SAFETY: `random` and `output` outlive the call and their lengths
        // are passed alongside them.
        let out = unsafe {
            crypt_gensalt_rn(
                prefix.as_ptr(),
                0,
                random.as_ptr().cast(),
                nrbytes,
                output.as_mut_ptr().cast(),
                GENSALT_OUTPUT_SIZE as c_int,
            )
        };
        if out.is_null() {
            return Err(io::Error::last_os_error());
        }
        let setting = CStr::from_bytes_until_nul(&output)
            .map_err(|_| invalid("unterminated setting"))?
            .to_str()
            .map_err(|_| invalid("setting is not UTF-8"))?;
        Ok(setting.to_owned())
    }
}
