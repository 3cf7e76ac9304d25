//! Request processing.
//!
//! A session moves strictly forward:
//! `Received -> Identified -> Authorized -> Executing -> Responded`.
//! Any failure jumps straight to `Responded` with the matching status.

use std::path::PathBuf;

use log::{debug, error, info, warn};
use once_cell::unsync::OnceCell;
use passwd_srv_protocol::{Opcode, Request, Status};

use crate::accounts::{AccountPolicy, AccountTool};
use crate::directory::UserDirectory;
use crate::error::{IdentityError, RequestError, ShadowError};
use crate::hashing::{self, DEFAULT_LOGIN_DEFS, HashMethod};
use crate::privilege;
use crate::shadow::{PasswordLock, ShadowDb, ShadowEntry};
use crate::validate::validate_username;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Received,
    Identified,
    Authorized,
    Executing,
    Responded,
}

/// Per-connection state. Dropping it wipes the request.
#[derive(Debug)]
pub struct Session {
    request: Request,
    stage: Stage,
    caller: Option<String>,
    target: Option<ShadowEntry>,
}

impl Session {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            stage: Stage::Received,
            caller: None,
            target: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// The user resolved from kernel state, once identified.
    pub fn caller(&self) -> Option<&str> {
        self.caller.as_deref()
    }

    /// Shadow entry of the target user, when one was loaded.
    pub fn target(&self) -> Option<&ShadowEntry> {
        self.target.as_ref()
    }

    fn advance(&mut self, next: Stage) {
        debug_assert!(next > self.stage, "{:?} -> {:?}", self.stage, next);
        self.stage = next;
    }
}

/// Executes authorized requests against the account databases.
pub struct Processor<L, A, D> {
    shadow: ShadowDb<L>,
    accounts: A,
    directory: D,
    policy: AccountPolicy,
    login_defs: PathBuf,
    method: OnceCell<HashMethod>,
}

impl<L, A, D> Processor<L, A, D>
where
    L: PasswordLock,
    A: AccountTool,
    D: UserDirectory,
{
    pub fn new(shadow: ShadowDb<L>, accounts: A, directory: D) -> Self {
        Self {
            shadow,
            accounts,
            directory,
            policy: AccountPolicy::default(),
            login_defs: PathBuf::from(DEFAULT_LOGIN_DEFS),
            method: OnceCell::new(),
        }
    }

    pub fn with_policy(mut self, policy: AccountPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_login_defs(mut self, path: impl Into<PathBuf>) -> Self {
        self.login_defs = path.into();
        self
    }

    /// Pin the hashing method instead of reading `login.defs`.
    pub fn with_hash_method(self, method: HashMethod) -> Self {
        let _ = self.method.set(method);
        self
    }

    pub fn policy(&self) -> &AccountPolicy {
        &self.policy
    }

    pub fn accounts(&self) -> &A {
        &self.accounts
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    /// Hashing method, read from `login.defs` on first use and kept for the
    /// life of the process.
    pub fn hash_method(&self) -> HashMethod {
        *self
            .method
            .get_or_init(|| HashMethod::discover(&self.login_defs))
    }

    /// Run a decoded request to completion and return the reply status.
    ///
    /// `resolve` is only called once the op code is known to be valid.
    pub fn process<F>(&self, session: &mut Session, resolve: F) -> Status
    where
        F: FnOnce() -> Result<String, IdentityError>,
    {
        let result = self.run(session, resolve);
        session.advance(Stage::Responded);
        match result {
            Ok(op) => {
                info!(
                    "{op} for {} by {} succeeded",
                    session.request.username().unwrap_or("?"),
                    session.caller().unwrap_or("?")
                );
                Status::Success
            }
            Err(e) => {
                let status = e.status();
                warn!("Request failed: {e} (status {})", status.code());
                status
            }
        }
    }

    fn run<F>(&self, session: &mut Session, resolve: F) -> Result<Opcode, RequestError>
    where
        F: FnOnce() -> Result<String, IdentityError>,
    {
        let op = session
            .request
            .opcode()
            .map_err(|e| RequestError::InvalidOpcode(e.0))?;

        let caller = resolve().map_err(RequestError::Unidentified)?;
        debug!("Request {op} from {caller}");
        session.caller = Some(caller);
        session.advance(Stage::Identified);

        let caller = session.caller.as_deref().unwrap_or_default();
        privilege::authorize(&self.directory, &self.policy, caller, op)?;
        session.advance(Stage::Authorized);

        session.advance(Stage::Executing);
        match op {
            Opcode::ChangePassword => self.change_password(session)?,
            Opcode::AddUser => self.add_user(session)?,
            Opcode::DeleteUser => self.delete_user(session)?,
        }
        Ok(op)
    }

    fn lookup(&self, username: &str) -> Result<Option<ShadowEntry>, RequestError> {
        self.shadow
            .lookup(username)
            .map_err(RequestError::ShadowFile)
    }

    fn change_password(&self, session: &mut Session) -> Result<(), RequestError> {
        let username = session.request.username()?.to_owned();
        let entry = self
            .lookup(&username)?
            .ok_or_else(|| RequestError::UserNotFound(username.clone()))?;

        if !hashing::verify(session.request.old_password()?, entry.hash()) {
            return Err(RequestError::PasswordMismatch(username));
        }
        session.target = Some(entry);

        self.store_password(&username, session.request.new_password()?)
    }

    fn add_user(&self, session: &mut Session) -> Result<(), RequestError> {
        let username = session.request.username()?.to_owned();
        validate_username(&username).map_err(RequestError::InvalidUsername)?;
        let password = session.request.new_password()?;

        if self.lookup(&username)?.is_some() {
            return Err(RequestError::UserExists(username));
        }

        let add_failed = |reason: String| RequestError::AddFailed {
            user: username.clone(),
            reason,
        };
        self.accounts
            .add_user(&username)
            .map_err(|e| add_failed(e.to_string()))?;

        match self.shadow.lookup(&username) {
            Ok(Some(entry)) => session.target = Some(entry),
            Ok(None) => return Err(add_failed("no shadow entry after useradd".into())),
            Err(e) => return Err(add_failed(e.to_string())),
        }

        if let Err(e) = self.store_password(&username, password) {
            warn!("Setting password for new user {username} failed, removing the account");
            if let Err(rollback) = self.accounts.delete_user(&username) {
                error!("Rollback of user {username} failed: {rollback}");
            }
            return Err(e);
        }
        Ok(())
    }

    fn delete_user(&self, session: &mut Session) -> Result<(), RequestError> {
        let username = session.request.username()?.to_owned();
        validate_username(&username).map_err(RequestError::InvalidUsername)?;

        let entry = self
            .lookup(&username)?
            .ok_or_else(|| RequestError::UserNotFound(username.clone()))?;
        session.target = Some(entry);

        let delete_failed = |reason: String| RequestError::DeleteFailed {
            user: username.clone(),
            reason,
        };
        self.accounts
            .delete_user(&username)
            .map_err(|e| delete_failed(e.to_string()))?;

        match self.shadow.lookup(&username) {
            Ok(None) => Ok(()),
            Ok(Some(_)) => Err(delete_failed("shadow entry still present".into())),
            Err(e) => Err(delete_failed(e.to_string())),
        }
    }

    fn store_password(&self, username: &str, password: &str) -> Result<(), RequestError> {
        let hash = self.hash_method().hash(password)?;
        self.shadow
            .set_password(username, &hash)
            .map_err(|e| match e {
                ShadowError::NotFound(user) => RequestError::UpdateFailed(user),
                other => RequestError::Store(other),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AccountError;
    use nix::errno::Errno;
    use std::cell::RefCell;
    use std::fs;
    use std::io;
    use std::path::Path;

    struct NoLock;

    impl PasswordLock for NoLock {
        fn lock(&self) -> io::Result<()> {
            Ok(())
        }
        fn unlock(&self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingTool {
        calls: RefCell<Vec<String>>,
    }

    impl AccountTool for RecordingTool {
        fn add_user(&self, username: &str) -> Result<(), AccountError> {
            self.calls.borrow_mut().push(format!("add {username}"));
            Ok(())
        }
        fn delete_user(&self, username: &str) -> Result<(), AccountError> {
            self.calls.borrow_mut().push(format!("del {username}"));
            Ok(())
        }
    }

    struct Groups;

    impl UserDirectory for Groups {
        fn username_of(&self, _uid: u32) -> Result<Option<String>, Errno> {
            Ok(None)
        }
        fn groups_of(&self, username: &str) -> Result<Vec<String>, Errno> {
            Ok(match username {
                "alice" => vec!["ovsdb-client".into()],
                _ => Vec::new(),
            })
        }
        fn group_id(&self, _name: &str) -> Result<Option<u32>, Errno> {
            Ok(None)
        }
    }

    fn processor(dir: &Path, shadow: &str) -> Processor<NoLock, RecordingTool, Groups> {
        let path = dir.join("shadow");
        fs::write(&path, shadow).unwrap();
        Processor::new(ShadowDb::new(path, NoLock), RecordingTool::default(), Groups)
            .with_hash_method(HashMethod::Sha512)
    }

    fn session(op: i32, user: &str, old: &str, new: &str) -> Session {
        Session::new(Request::with_raw_opcode(op, user, old, new).unwrap())
    }

    #[test]
    fn test_invalid_opcode_skips_identity() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(dir.path(), "");
        let mut s = session(42, "alice", "", "");
        let status = p.process(&mut s, || panic!("identity must not be resolved"));
        assert_eq!(status, Status::InvalidOpcode);
        assert_eq!(s.stage(), Stage::Responded);
        assert!(s.caller().is_none());
    }

    #[test]
    fn test_unidentified_peer() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(dir.path(), "");
        let mut s = session(1, "alice", "a", "b");
        let status = p.process(&mut s, || Err(IdentityError::NoProcess(5)));
        assert_eq!(status, Status::InvalidUser);
    }

    #[test]
    fn test_change_password() {
        let dir = tempfile::tempdir().unwrap();
        let old = HashMethod::Sha512.hash("old1").unwrap();
        let p = processor(dir.path(), &format!("alice:{}:19000:0:99999:7:::\n", *old));
        let mut s = session(1, "alice", "old1", "new1");
        assert_eq!(p.process(&mut s, || Ok("alice".into())), Status::Success);
        assert_eq!(s.caller(), Some("alice"));
        assert_eq!(s.target().unwrap().name(), "alice");

        let stored = p.shadow.lookup("alice").unwrap().unwrap();
        assert!(hashing::verify("new1", stored.hash()));
        assert!(!hashing::verify("old1", stored.hash()));
        assert_eq!(stored.last_change(), Some(19000));
    }

    #[test]
    fn test_change_password_wrong_old() {
        let dir = tempfile::tempdir().unwrap();
        let old = HashMethod::Sha512.hash("old1").unwrap();
        let content = format!("alice:{}:19000:0:99999:7:::\n", *old);
        let p = processor(dir.path(), &content);
        let mut s = session(1, "alice", "nope", "new1");
        assert_eq!(
            p.process(&mut s, || Ok("alice".into())),
            Status::PasswordNotMatch
        );
        assert_eq!(fs::read_to_string(p.shadow.path()).unwrap(), content);
    }

    #[test]
    fn test_change_password_unknown_user() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(dir.path(), "root:x:1::::::\n");
        let mut s = session(1, "ghost", "a", "b");
        assert_eq!(p.process(&mut s, || Ok("root".into())), Status::UserNotFound);
    }

    #[test]
    fn test_unauthorized_add_user() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(dir.path(), "");
        let mut s = session(2, "bob", "", "pw");
        assert_eq!(p.process(&mut s, || Ok("alice".into())), Status::InvalidUser);
        assert_eq!(s.stage(), Stage::Responded);
        assert!(p.accounts.calls.borrow().is_empty());
    }

    #[test]
    fn test_add_existing_user() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(dir.path(), "bob:x:1::::::\n");
        let mut s = session(2, "bob", "", "pw");
        assert_eq!(p.process(&mut s, || Ok("root".into())), Status::UserExist);
        assert!(p.accounts.calls.borrow().is_empty());
    }

    #[test]
    fn test_add_user_invalid_name() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(dir.path(), "");
        let mut s = session(2, "Bad;Name", "", "pw");
        assert_eq!(p.process(&mut s, || Ok("root".into())), Status::InvalidParam);
        assert!(p.accounts.calls.borrow().is_empty());
    }

    #[test]
    fn test_add_user_without_shadow_row_fails() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(dir.path(), "");
        let mut s = session(2, "bob", "", "pw");
        assert_eq!(p.process(&mut s, || Ok("root".into())), Status::UseraddFailed);
        assert_eq!(*p.accounts.calls.borrow(), vec!["add bob".to_string()]);
    }

    #[test]
    fn test_delete_missing_user() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(dir.path(), "");
        let mut s = session(3, "bob", "", "");
        assert_eq!(p.process(&mut s, || Ok("root".into())), Status::UserNotFound);
    }

    #[test]
    fn test_delete_user_still_present_fails() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(dir.path(), "bob:x:1::::::\n");
        let mut s = session(3, "bob", "", "");
        assert_eq!(p.process(&mut s, || Ok("root".into())), Status::UserdelFailed);
        assert_eq!(*p.accounts.calls.borrow(), vec!["del bob".to_string()]);
    }

    #[test]
    fn test_unterminated_username_is_invalid_param() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(dir.path(), "");
        let mut raw = vec![0u8; passwd_srv_protocol::REQUEST_SIZE];
        raw[..4].copy_from_slice(&1i32.to_ne_bytes());
        raw[4..54].fill(b'a');
        let mut s = Session::new(Request::decode(&raw));
        assert_eq!(p.process(&mut s, || Ok("root".into())), Status::InvalidParam);
    }

    #[test]
    fn test_hash_method_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let defs = dir.path().join("login.defs");
        fs::write(&defs, "ENCRYPT_METHOD SHA256\n").unwrap();
        let p = Processor::new(
            ShadowDb::new(dir.path().join("shadow"), NoLock),
            RecordingTool::default(),
            Groups,
        )
        .with_login_defs(&defs);
        assert_eq!(p.hash_method(), HashMethod::Sha256);
        fs::write(&defs, "ENCRYPT_METHOD MD5\n").unwrap();
        assert_eq!(p.hash_method(), HashMethod::Sha256);
    }
}
