#![no_main]
use libfuzzer_sys::fuzz_target;
use passwd_srv::identity::sock_diag::{AttributeTable, DiagEntry, Messages, UNIX_DIAG_PEER};

fuzz_target!(|data: &[u8]| {
    for (_header, payload) in Messages::new(data) {
        if let Some(entry) = DiagEntry::parse(payload) {
            let _ = entry.peer;
        }
        let _ = AttributeTable::parse(payload).get_u32(UNIX_DIAG_PEER);
    }
});
