#![no_main]
use libfuzzer_sys::fuzz_target;

use wsframe::{handshake::server::NoCallback, AuthResult, Authenticator};

fuzz_target!(|data: &[u8]| {
    let mut authenticator = Authenticator::new(8 << 10);
    for chunk in data.chunks(64) {
        match authenticator.authenticate(chunk, NoCallback) {
            AuthResult::Pending => {}
            AuthResult::Success { .. } | AuthResult::Failure { .. } => return,
        }
    }
});
