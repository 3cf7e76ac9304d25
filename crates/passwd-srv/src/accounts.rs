//! Account policy and the external account tools.

use std::path::PathBuf;
use std::process::Command;

use log::{debug, info};

use crate::error::AccountError;

/// Group whose members may change their own password and read the public key.
pub const CLIENT_GROUP: &str = "ovsdb-client";

/// Group whose members may add and delete users.
pub const ADMIN_GROUP: &str = "ops_admin";

/// Primary group of created users.
pub const NETOP_GROUP: &str = "ops_netop";

pub const LOGIN_SHELL: &str = "/usr/bin/vtysh";
pub const USERADD: &str = "/usr/sbin/useradd";
pub const USERDEL: &str = "/usr/sbin/userdel";

/// Names and programs the daemon applies to account operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountPolicy {
    pub client_group: String,
    pub admin_group: String,
    pub primary_group: String,
    pub login_shell: String,
    pub useradd: PathBuf,
    pub userdel: PathBuf,
}

impl Default for AccountPolicy {
    fn default() -> Self {
        Self {
            client_group: CLIENT_GROUP.into(),
            admin_group: ADMIN_GROUP.into(),
            primary_group: NETOP_GROUP.into(),
            login_shell: LOGIN_SHELL.into(),
            useradd: USERADD.into(),
            userdel: USERDEL.into(),
        }
    }
}

/// Creates and removes system accounts.
pub trait AccountTool {
    fn add_user(&self, username: &str) -> Result<(), AccountError>;
    fn delete_user(&self, username: &str) -> Result<(), AccountError>;
}

/// Runs `useradd`/`userdel` directly, never through a shell.
#[derive(Debug, Clone, Default)]
pub struct SystemAccountTool {
    policy: AccountPolicy,
}

impl SystemAccountTool {
    pub fn new(policy: AccountPolicy) -> Self {
        Self { policy }
    }
}

impl AccountTool for SystemAccountTool {
    fn add_user(&self, username: &str) -> Result<(), AccountError> {
        info!("Adding user {username}");
        run_cmd(
            &self.policy.useradd,
            &[
                "-g",
                &self.policy.primary_group,
                "-G",
                &self.policy.client_group,
                "-s",
                &self.policy.login_shell,
                username,
            ],
        )
        .map(|_| ())
    }

    fn delete_user(&self, username: &str) -> Result<(), AccountError> {
        info!("Deleting user {username}");
        run_cmd(&self.policy.userdel, &[username]).map(|_| ())
    }
}

fn run_cmd(cmd: &std::path::Path, args: &[&str]) -> Result<String, AccountError> {
    let tool = cmd.display().to_string();
    debug!("Running {tool} {args:?}");
    let output = Command::new(cmd)
        .args(args)
        .output()
        .map_err(|source| AccountError::Spawn {
            tool: tool.clone(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AccountError::Failed {
            tool,
            code: output.status.code().unwrap_or(-1),
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
