#![no_main]
use libfuzzer_sys::fuzz_target;
use passwd_srv::validate::{USER_NAME_MAX_LENGTH, validate_username};

fuzz_target!(|data: &str| {
    if validate_username(data).is_ok() {
        assert!(!data.is_empty());
        assert!(data.len() <= USER_NAME_MAX_LENGTH);
        assert!(!data.contains(['/', ':', '\0', ' ']));
    }
});
