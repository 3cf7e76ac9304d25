//! passwd-srvd: privileged password daemon.
//!
//! ## Usage
//!
//! ```bash
//! # Run with the default config (/etc/passwd-srv/passwd-srv.yaml)
//! passwd-srvd
//!
//! # Custom config, debug logging, drop stalled clients after 5s
//! passwd-srvd --config ./passwd-srv.yaml -v --peek-timeout 5
//! ```

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{LevelFilter, info};

use passwd_srv::accounts::AccountPolicy;
use passwd_srv::config::{Config, DEFAULT_CONFIG_PATH};
use passwd_srv::error::ConfigError;
use passwd_srv::hashing::DEFAULT_LOGIN_DEFS;
use passwd_srv::server::DEFAULT_RUN_DIR;
use passwd_srv::shadow::DEFAULT_SHADOW_PATH;
use passwd_srv::{DaemonOptions, run_daemon};
use passwd_srv_protocol::Status;

#[derive(Debug, Parser)]
#[command(
    name = "passwd-srvd",
    version,
    about = "Privileged daemon for password changes and account management"
)]
struct Args {
    /// Config file listing the socket and public key paths
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, env = "PASSWD_SRV_CONFIG")]
    config: PathBuf,

    /// Run directory, recreated at startup
    #[arg(long, value_name = "PATH", default_value = DEFAULT_RUN_DIR)]
    run_dir: PathBuf,

    /// login.defs used to pick the password hashing method
    #[arg(long, value_name = "PATH", default_value = DEFAULT_LOGIN_DEFS)]
    login_defs: PathBuf,

    /// Shadow password database
    #[arg(long, value_name = "PATH", default_value = DEFAULT_SHADOW_PATH)]
    shadow: PathBuf,

    /// Drop clients that do not send a full request within SECS seconds.
    /// Without this a stalled client blocks the daemon.
    #[arg(long, value_name = "SECS")]
    peek_timeout: Option<u64>,

    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    quiet: bool,

    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn log_level(&self) -> LevelFilter {
        if self.quiet {
            return LevelFilter::Error;
        }
        match self.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "passwd-srvd: {err:?}");
        let code = if err.downcast_ref::<ConfigError>().is_some() {
            Status::YamlFile.code()
        } else {
            1
        };
        std::process::exit(code);
    }
}

fn try_main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(args.log_level().as_str()),
    )
    .init();

    info!("Starting passwd-srvd (pid {})", std::process::id());

    let config = Config::load(&args.config)?;
    let options = DaemonOptions {
        socket_path: config.socket_path()?.to_path_buf(),
        public_key_path: config.public_key_path()?.to_path_buf(),
        run_dir: args.run_dir,
        shadow_path: args.shadow,
        login_defs: args.login_defs,
        peek_timeout: args.peek_timeout.map(Duration::from_secs),
        policy: AccountPolicy::default(),
    };

    run_daemon(&options).context("passwd-srvd stopped")?;
    info!("passwd-srvd stopped");
    Ok(())
}
