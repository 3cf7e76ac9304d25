//! End-to-end requests over a real unix socket.

mod common;

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use common::{CountingLock, StaticResolver, TestProcessor, shadow_names, write_shadow};
use passwd_srv::Server;
use passwd_srv::hashing;
use passwd_srv::keys::KeyManager;
use passwd_srv::shadow::ShadowDb;
use passwd_srv::transport::{Connection, Listener, Readiness, ShutdownSignal};
use passwd_srv_protocol::client::{self, ClientError};
use passwd_srv_protocol::{CIPHERTEXT_SIZE, Opcode, Request, STATUS_SIZE, Status};

struct Harness {
    _dir: tempfile::TempDir,
    socket: PathBuf,
    public_key: PathBuf,
    shadow: PathBuf,
    listener: Listener,
    idle: ShutdownSignal,
    server: Server<StaticResolver, CountingLock, common::FileAccountTool, common::MapDirectory>,
}

impl Harness {
    fn new(caller: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("passwd-srv.sock");
        let public_key = dir.path().join("passwd_srv_pub.pem");
        let shadow = write_shadow(dir.path(), &[("alice", "old1"), ("bob", "bobpw")]);

        let keys = KeyManager::generate().unwrap();
        keys.publish(&public_key, None).unwrap();
        let processor: TestProcessor = common::processor(&shadow, CountingLock::default());
        let server = Server::new(keys, StaticResolver::user(caller), processor)
            .with_peek_timeout(Some(Duration::from_secs(5)));
        let listener = Listener::bind(&socket).unwrap();

        Self {
            _dir: dir,
            socket,
            public_key,
            shadow,
            listener,
            idle: ShutdownSignal::new().unwrap(),
            server,
        }
    }

    fn accept(&self) -> Connection {
        assert_eq!(self.listener.wait(&self.idle).unwrap(), Readiness::Incoming);
        self.listener.accept().unwrap()
    }

    /// Send `request` from a client thread and serve it here.
    fn round_trip(&self, request: Request) -> (Status, Result<Status, ClientError>) {
        let client = spawn_client(&self.socket, &self.public_key, request);
        let conn = self.accept();
        let served = self.server.serve_connection(conn);
        (served, client.join().unwrap())
    }

    fn raw_round_trip(&self, payload: Vec<u8>) -> (Status, [u8; STATUS_SIZE]) {
        let socket = self.socket.clone();
        let client = thread::spawn(move || {
            let mut stream = UnixStream::connect(socket).unwrap();
            stream.write_all(&payload).unwrap();
            stream.shutdown(Shutdown::Write).unwrap();
            let mut reply = [0u8; STATUS_SIZE];
            stream.read_exact(&mut reply).unwrap();
            reply
        });
        let conn = self.accept();
        let served = self.server.serve_connection(conn);
        (served, client.join().unwrap())
    }
}

fn spawn_client(
    socket: &Path,
    public_key: &Path,
    request: Request,
) -> JoinHandle<Result<Status, ClientError>> {
    let socket = socket.to_path_buf();
    let public_key = public_key.to_path_buf();
    thread::spawn(move || client::send(socket, public_key, &request))
}

fn stored_hash(shadow: &Path, user: &str) -> String {
    ShadowDb::new(shadow, CountingLock::default())
        .lookup(user)
        .unwrap()
        .unwrap()
        .hash()
        .to_owned()
}

#[test]
fn test_change_password_end_to_end() {
    let h = Harness::new("alice");
    let req = Request::new(Opcode::ChangePassword, "alice", "old1", "new1").unwrap();

    let (served, reply) = h.round_trip(req);
    assert_eq!(served, Status::Success);
    assert_eq!(reply.unwrap(), Status::Success);
    assert!(hashing::verify("new1", &stored_hash(&h.shadow, "alice")));
}

#[test]
fn test_wrong_password_end_to_end() {
    let h = Harness::new("alice");
    let req = Request::new(Opcode::ChangePassword, "alice", "wrong", "new1").unwrap();

    let (_, reply) = h.round_trip(req);
    assert_eq!(reply.unwrap(), Status::PasswordNotMatch);
    assert!(hashing::verify("old1", &stored_hash(&h.shadow, "alice")));
}

#[test]
fn test_add_and_delete_user_end_to_end() {
    let h = Harness::new("admin");

    let add = Request::new(Opcode::AddUser, "carol", "", "carolpw").unwrap();
    assert_eq!(h.round_trip(add).1.unwrap(), Status::Success);
    assert!(hashing::verify("carolpw", &stored_hash(&h.shadow, "carol")));

    let delete = Request::new(Opcode::DeleteUser, "carol", "", "").unwrap();
    assert_eq!(h.round_trip(delete).1.unwrap(), Status::Success);
    assert_eq!(shadow_names(&h.shadow), ["root", "alice", "bob"]);
}

#[test]
fn test_invalid_opcode_end_to_end() {
    let h = Harness::new("root");
    let req = Request::with_raw_opcode(9, "alice", "old1", "new1").unwrap();

    let (_, reply) = h.round_trip(req);
    assert_eq!(reply.unwrap(), Status::InvalidOpcode);
}

#[test]
fn test_garbage_ciphertext_is_rejected() {
    let h = Harness::new("alice");

    let (served, reply) = h.raw_round_trip(vec![0x5a; CIPHERTEXT_SIZE]);
    assert_eq!(served, Status::DecryptFailed);
    assert_eq!(Status::from_wire(reply).unwrap(), Status::DecryptFailed);
}

#[test]
fn test_short_ciphertext_is_rejected() {
    let h = Harness::new("alice");

    let (served, reply) = h.raw_round_trip(vec![1u8; 16]);
    assert_eq!(served, Status::DecryptFailed);
    assert_eq!(Status::from_wire(reply).unwrap(), Status::DecryptFailed);
    assert!(hashing::verify("old1", &stored_hash(&h.shadow, "alice")));
}

#[test]
fn test_public_key_is_readable_by_clients() {
    let h = Harness::new("alice");
    let pem = std::fs::read(&h.public_key).unwrap();
    assert!(client::parse_public_key(&pem).is_ok());
    assert_eq!(pem, h.server.keys().public_key_pem().unwrap());
}
