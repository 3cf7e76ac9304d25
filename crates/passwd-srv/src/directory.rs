//! User and group database lookups.

use std::ffi::CString;

use nix::errno::Errno;
use nix::unistd::{Group, Uid, User, getgrouplist};

/// Upper bound on the number of groups examined per user.
pub const MAX_GROUPS: usize = 65;

/// Read-only view of the system user and group databases.
pub trait UserDirectory {
    /// Name of the account owning `uid`, if any.
    fn username_of(&self, uid: u32) -> Result<Option<String>, Errno>;

    /// Names of every group `username` belongs to, primary group included.
    /// At most [`MAX_GROUPS`] entries are returned.
    fn groups_of(&self, username: &str) -> Result<Vec<String>, Errno>;

    /// Numeric id of the group called `name`, if it exists.
    fn group_id(&self, name: &str) -> Result<Option<u32>, Errno>;
}

/// Directory backed by NSS (`getpwuid`, `getgrouplist`, `getgrgid`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDirectory;

impl UserDirectory for SystemDirectory {
    fn username_of(&self, uid: u32) -> Result<Option<String>, Errno> {
        Ok(User::from_uid(Uid::from_raw(uid))?.map(|u| u.name))
    }

    fn groups_of(&self, username: &str) -> Result<Vec<String>, Errno> {
        let Some(user) = User::from_name(username)? else {
            return Ok(Vec::new());
        };
        let c_name = CString::new(username).map_err(|_| Errno::EINVAL)?;
        let mut gids = getgrouplist(&c_name, user.gid)?;
        gids.truncate(MAX_GROUPS);

        let mut names = Vec::with_capacity(gids.len());
        for gid in gids {
            if let Some(group) = Group::from_gid(gid)? {
                names.push(group.name);
            }
        }
        Ok(names)
    }

    fn group_id(&self, name: &str) -> Result<Option<u32>, Errno> {
        Ok(Group::from_name(name)?.map(|g| g.gid.as_raw()))
    }
}
