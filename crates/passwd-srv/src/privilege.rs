//! Privilege checks against the resolved caller.

use log::{debug, warn};
use passwd_srv_protocol::Opcode;

use crate::accounts::AccountPolicy;
use crate::directory::UserDirectory;
use crate::error::RequestError;

/// Always authorized, whatever its group membership.
pub const SUPERUSER: &str = "root";

/// Group a caller must belong to for `op`.
pub fn required_group(policy: &AccountPolicy, op: Opcode) -> &str {
    match op {
        Opcode::ChangePassword => &policy.client_group,
        Opcode::AddUser | Opcode::DeleteUser => &policy.admin_group,
    }
}

/// Check that `username` may perform `op`.
pub fn authorize<D: UserDirectory + ?Sized>(
    directory: &D,
    policy: &AccountPolicy,
    username: &str,
    op: Opcode,
) -> Result<(), RequestError> {
    if username == SUPERUSER {
        return Ok(());
    }

    let group = required_group(policy, op);
    let groups = match directory.groups_of(username) {
        Ok(groups) => groups,
        Err(errno) => {
            warn!("Group lookup for {username} failed: {errno}");
            Vec::new()
        }
    };

    if groups.iter().any(|g| g == group) {
        debug!("{username} is a member of {group}, {op} allowed");
        Ok(())
    } else {
        Err(RequestError::Unauthorized {
            user: username.to_string(),
            op,
        })
    }
}
