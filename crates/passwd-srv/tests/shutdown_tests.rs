//! Stopping the serve loop.
//!
//! Kept in its own binary since one test installs process-wide signal
//! handlers.

mod common;

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use common::{CountingLock, StaticResolver, TestProcessor, write_shadow};
use nix::sys::pthread::{pthread_kill, pthread_self};
use nix::sys::signal::Signal;
use passwd_srv::{Server, ServerError};
use passwd_srv::keys::KeyManager;
use passwd_srv::transport::{Listener, ShutdownSignal};
use passwd_srv_protocol::client;
use passwd_srv_protocol::{Opcode, Request, Status};

/// Bind a socket and publish a fresh key under `dir`.
fn serve(dir: &Path) -> (Listener, KeyManager, PathBuf, PathBuf) {
    let socket = dir.join("passwd-srv.sock");
    let public_key = dir.join("passwd_srv_pub.pem");
    let keys = KeyManager::generate().unwrap();
    keys.publish(&public_key, None).unwrap();
    let listener = Listener::bind(&socket).unwrap();
    (listener, keys, socket, public_key)
}

fn run_server(
    listener: Listener,
    keys: KeyManager,
    shadow: &Path,
    shutdown: &ShutdownSignal,
) -> Result<(), ServerError> {
    let processor: TestProcessor = common::processor(shadow, CountingLock::default());
    let server = Server::new(keys, StaticResolver::user("alice"), processor)
        .with_peek_timeout(Some(Duration::from_secs(5)));
    let result = server.run(&listener, shutdown);
    drop(listener);
    result
}

#[test]
fn test_trigger_stops_loop_between_requests() {
    let dir = tempfile::tempdir().unwrap();
    let shadow = write_shadow(dir.path(), &[("alice", "old1")]);
    let (listener, keys, socket, public_key) = serve(dir.path());
    let shutdown = ShutdownSignal::new().unwrap();

    thread::scope(|s| {
        let server = s.spawn(|| run_server(listener, keys, &shadow, &shutdown));

        let first = Request::new(Opcode::ChangePassword, "alice", "old1", "new1").unwrap();
        assert_eq!(client::send(&socket, &public_key, &first).unwrap(), Status::Success);
        let second = Request::new(Opcode::ChangePassword, "alice", "new1", "new2").unwrap();
        assert_eq!(client::send(&socket, &public_key, &second).unwrap(), Status::Success);

        shutdown.trigger();
        server.join().unwrap().unwrap();
    });
    assert!(!socket.exists());
}

#[test]
fn test_sigterm_stops_idle_loop() {
    let dir = tempfile::tempdir().unwrap();
    let shadow = write_shadow(dir.path(), &[("alice", "old1")]);
    let (listener, keys, socket, _) = serve(dir.path());
    let shutdown = ShutdownSignal::new().unwrap();
    shutdown.install_handlers().unwrap();

    let (tid_tx, tid_rx) = mpsc::channel();
    thread::scope(|s| {
        let server = s.spawn(|| {
            tid_tx.send(pthread_self()).unwrap();
            run_server(listener, keys, &shadow, &shutdown)
        });

        let tid = tid_rx.recv().unwrap();
        // Let the loop reach poll; a signal sent earlier is still latched.
        thread::sleep(Duration::from_millis(50));
        pthread_kill(tid, Signal::SIGTERM).unwrap();
        server.join().unwrap().unwrap();
    });
    assert!(shutdown.is_triggered());
    assert!(!socket.exists());
}
