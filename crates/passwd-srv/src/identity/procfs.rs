//! Process table lookups through procfs.

use std::fs;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::IdentityError;

pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// A procfs mount. Tests point this at a scratch tree.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new(DEFAULT_PROC_ROOT)
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Inode of the socket behind descriptor `fd` of process `pid`.
    pub fn socket_inode(&self, pid: u32, fd: RawFd) -> Result<u32, IdentityError> {
        let path = self.root.join(pid.to_string()).join("fd").join(fd.to_string());
        let target = fs::read_link(&path).map_err(|source| IdentityError::OwnInode {
            path: path.clone(),
            source,
        })?;
        let target = target.to_string_lossy();
        parse_socket_link(&target).ok_or_else(|| IdentityError::NotSocket(target.into_owned()))
    }

    /// Find the process holding a descriptor for socket `inode`.
    ///
    /// Processes are visited in ascending pid order and the first holder
    /// wins. Processes that vanish or whose descriptors are unreadable are
    /// skipped. The holder may exit between the kernel dump and this scan,
    /// in which case the inode can in principle be reused by another socket.
    pub fn find_socket_owner(&self, inode: u32) -> Result<u32, IdentityError> {
        let entries = fs::read_dir(&self.root).map_err(|source| IdentityError::ProcScan {
            path: self.root.clone(),
            source,
        })?;

        let mut pids: Vec<u32> = entries
            .flatten()
            .filter_map(|e| e.file_name().to_str().and_then(parse_pid))
            .collect();
        pids.sort_unstable();

        for pid in pids {
            let fd_dir = self.root.join(pid.to_string()).join("fd");
            let Ok(fds) = fs::read_dir(&fd_dir) else {
                continue;
            };
            for fd in fds.flatten() {
                let Ok(target) = fs::read_link(fd.path()) else {
                    continue;
                };
                if parse_socket_link(&target.to_string_lossy()) == Some(inode) {
                    debug!("Socket inode {inode} is held by pid {pid}");
                    return Ok(pid);
                }
            }
        }

        Err(IdentityError::NoProcess(inode))
    }

    /// Real uid of process `pid`, from the first field of its `Uid:` line.
    pub fn real_uid(&self, pid: u32) -> Result<u32, IdentityError> {
        let path = self.root.join(pid.to_string()).join("status");
        let status = fs::read_to_string(&path)
            .map_err(|source| IdentityError::ProcStatus { pid, source })?;
        parse_real_uid(&status).ok_or(IdentityError::NoUid(pid))
    }
}

/// Parse a descriptor link target of the form `socket:[<inode>]`.
pub fn parse_socket_link(target: &str) -> Option<u32> {
    target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

fn parse_pid(name: &str) -> Option<u32> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

fn parse_real_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}
