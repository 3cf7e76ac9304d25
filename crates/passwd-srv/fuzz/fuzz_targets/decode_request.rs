#![no_main]
use libfuzzer_sys::fuzz_target;
use passwd_srv_protocol::Request;

// Decrypted payloads are attacker-shaped; decoding and field access must
// never panic.
fuzz_target!(|data: &[u8]| {
    let req = Request::decode(data);
    let _ = req.opcode();
    let _ = req.username();
    let _ = req.old_password();
    let _ = req.new_password();
});
