//! The serve loop and daemon startup.

use std::fs::{self, DirBuilder};
use std::io;
use std::os::fd::AsFd;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::unistd::{Gid, chown};
use passwd_srv_protocol::{Request, Status};

use crate::accounts::{AccountPolicy, AccountTool, SystemAccountTool};
use crate::directory::{SystemDirectory, UserDirectory};
use crate::error::{RequestError, ServerError, TransportError};
use crate::identity::{KernelPeerResolver, PeerResolver};
use crate::keys::KeyManager;
use crate::processor::{Processor, Session};
use crate::shadow::{PasswordLock, ShadowDb, SystemPwdLock};
use crate::transport::{Connection, Listener, Readiness, ShutdownSignal};

/// Mode of the run directory holding the socket and public key.
pub const RUN_DIR_MODE: u32 = 0o750;

pub const DEFAULT_RUN_DIR: &str = "/var/run/passwd-srv";

/// Owns everything a request needs: the keypair, the identity resolver and
/// the processor. Connections are served one at a time.
pub struct Server<R, L, A, D> {
    keys: KeyManager,
    resolver: R,
    processor: Processor<L, A, D>,
    peek_timeout: Option<Duration>,
}

impl<R, L, A, D> Server<R, L, A, D>
where
    R: PeerResolver,
    L: PasswordLock,
    A: AccountTool,
    D: UserDirectory,
{
    pub fn new(keys: KeyManager, resolver: R, processor: Processor<L, A, D>) -> Self {
        Self {
            keys,
            resolver,
            processor,
            peek_timeout: None,
        }
    }

    /// Give up on clients that do not send a full request within `timeout`.
    pub fn with_peek_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.peek_timeout = timeout;
        self
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    pub fn processor(&self) -> &Processor<L, A, D> {
        &self.processor
    }

    /// Handle one connection end to end and return the status sent.
    pub fn serve_connection(&self, conn: Connection) -> Status {
        let status = match self.receive(&conn) {
            Ok(request) => {
                let mut session = Session::new(request);
                self.processor
                    .process(&mut session, || self.resolver.resolve(conn.as_fd()))
            }
            Err(e) => {
                warn!("Rejecting request: {e}");
                e.status()
            }
        };

        if let Err(e) = conn.respond(status) {
            warn!("Failed to send status {}: {e}", status.code());
        }
        status
    }

    fn receive(&self, conn: &Connection) -> Result<Request, RequestError> {
        if self.peek_timeout.is_some() {
            conn.set_peek_timeout(self.peek_timeout)
                .map_err(RequestError::Receive)?;
        }
        let ciphertext = conn
            .peek_ciphertext(self.keys.ciphertext_len())
            .map_err(|e| match e {
                TransportError::ShortRead { .. } => RequestError::ShortCiphertext(e),
                other => RequestError::Receive(other),
            })?;
        let plaintext = self
            .keys
            .decrypt(&ciphertext)
            .map_err(RequestError::Decrypt)?;
        Ok(Request::decode(&plaintext))
    }

    /// Accept and serve connections until `shutdown` fires.
    ///
    /// A shutdown that arrives mid-request is noticed once that connection
    /// has been answered.
    pub fn run(&self, listener: &Listener, shutdown: &ShutdownSignal) -> Result<(), ServerError> {
        info!("Listening on {}", listener.path().display());
        while listener.wait(shutdown)? == Readiness::Incoming {
            let conn = match listener.accept() {
                Ok(conn) => conn,
                Err(TransportError::Accept(Errno::EAGAIN | Errno::EINTR | Errno::ECONNABORTED)) => {
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let status = self.serve_connection(conn);
            debug!("Connection closed with status {}", status.code());
        }
        info!("Shutting down");
        Ok(())
    }
}

/// Server wired to the real system databases and kernel interfaces.
pub type SystemServer = Server<
    KernelPeerResolver<SystemDirectory>,
    SystemPwdLock,
    SystemAccountTool,
    SystemDirectory,
>;

/// Paths and knobs for a daemon instance.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub socket_path: PathBuf,
    pub public_key_path: PathBuf,
    pub run_dir: PathBuf,
    pub shadow_path: PathBuf,
    pub login_defs: PathBuf,
    pub peek_timeout: Option<Duration>,
    pub policy: AccountPolicy,
}

/// Recreate the run directory from scratch with mode 0750, owned by `group`
/// when given.
pub fn prepare_run_dir(path: &Path, group: Option<u32>) -> Result<(), ServerError> {
    let dir_err = |source| ServerError::RunDir {
        path: path.to_path_buf(),
        source,
    };

    match fs::remove_dir_all(path) {
        Ok(()) => debug!("Removed stale run directory {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(dir_err(e)),
    }
    DirBuilder::new()
        .recursive(true)
        .mode(RUN_DIR_MODE)
        .create(path)
        .map_err(dir_err)?;
    fs::set_permissions(path, fs::Permissions::from_mode(RUN_DIR_MODE)).map_err(dir_err)?;

    match group {
        Some(gid) => {
            if let Err(e) = chown(path, None, Some(Gid::from_raw(gid))) {
                warn!("Failed to set group of {}: {e}", path.display());
            }
        }
        None => warn!("Client group not found, {} keeps default group", path.display()),
    }
    Ok(())
}

/// Run the daemon until SIGTERM/SIGINT.
///
/// Prepares the run directory, generates and publishes the keypair, installs
/// signal handlers and serves the socket. Any error here is fatal.
pub fn run_daemon(options: &DaemonOptions) -> Result<(), ServerError> {
    let directory = SystemDirectory;
    let group = match directory.group_id(&options.policy.client_group) {
        Ok(gid) => gid,
        Err(e) => {
            warn!("Lookup of group {} failed: {e}", options.policy.client_group);
            None
        }
    };

    prepare_run_dir(&options.run_dir, group)?;

    let keys = KeyManager::generate()?;
    keys.publish(&options.public_key_path, group)?;

    let shutdown = ShutdownSignal::new().map_err(ServerError::Signal)?;
    shutdown.install_handlers().map_err(ServerError::Signal)?;

    let processor = Processor::new(
        ShadowDb::system(&options.shadow_path),
        SystemAccountTool::new(options.policy.clone()),
        SystemDirectory,
    )
    .with_policy(options.policy.clone())
    .with_login_defs(&options.login_defs);

    let server: SystemServer = Server::new(keys, KernelPeerResolver::new(SystemDirectory), processor)
        .with_peek_timeout(options.peek_timeout);

    let listener = Listener::bind(&options.socket_path)?;
    server.run(&listener, &shutdown)
}
