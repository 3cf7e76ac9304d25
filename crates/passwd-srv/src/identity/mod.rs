//! Caller identity from kernel state.
//!
//! Nothing the client sends is trusted. For an accepted connection:
//!
//! 1. read our own end's socket inode from `/proc/<pid>/fd/<fd>`
//! 2. dump unix sockets over `NETLINK_SOCK_DIAG` and take the peer inode of
//!    the entry matching ours
//! 3. scan `/proc/*/fd/*` for the process holding the peer inode
//! 4. read that process's real uid and look up its user name

pub mod procfs;
pub mod sock_diag;

use std::os::fd::{AsRawFd, BorrowedFd};

use log::debug;

use crate::directory::UserDirectory;
use crate::error::IdentityError;
use procfs::ProcFs;
use sock_diag::{DiagChannel, NetlinkChannel, query_peer_inode};

/// Works out which user is driving the other end of a connection.
pub trait PeerResolver {
    fn resolve(&self, conn: BorrowedFd<'_>) -> Result<String, IdentityError>;
}

/// Resolver backed by procfs and the kernel's socket diagnostics.
#[derive(Debug)]
pub struct KernelPeerResolver<D> {
    proc_fs: ProcFs,
    directory: D,
    pid: u32,
}

impl<D: UserDirectory> KernelPeerResolver<D> {
    pub fn new(directory: D) -> Self {
        Self::with_proc_fs(ProcFs::default(), directory, std::process::id())
    }

    /// Use an alternative procfs root and daemon pid. The pid is also the
    /// netlink sequence number.
    pub fn with_proc_fs(proc_fs: ProcFs, directory: D, pid: u32) -> Self {
        Self {
            proc_fs,
            directory,
            pid,
        }
    }

    /// Resolve the user on the other end of our socket `inode`, using
    /// `channel` for the diagnostic dump.
    pub fn resolve_inode<C: DiagChannel + ?Sized>(
        &self,
        channel: &mut C,
        inode: u32,
    ) -> Result<String, IdentityError> {
        let peer = query_peer_inode(channel, inode, self.pid)?;
        let pid = self.proc_fs.find_socket_owner(peer)?;
        let uid = self.proc_fs.real_uid(pid)?;
        let name = self
            .directory
            .username_of(uid)
            .map_err(IdentityError::Directory)?
            .ok_or(IdentityError::UnknownUid(uid))?;
        debug!("Peer of socket {inode} is pid {pid} (uid {uid}, user {name})");
        Ok(name)
    }
}

impl<D: UserDirectory> PeerResolver for KernelPeerResolver<D> {
    fn resolve(&self, conn: BorrowedFd<'_>) -> Result<String, IdentityError> {
        let inode = self.proc_fs.socket_inode(self.pid, conn.as_raw_fd())?;
        let mut channel = NetlinkChannel::open().map_err(IdentityError::Channel)?;
        self.resolve_inode(&mut channel, inode)
    }
}
