#![no_main]
use libfuzzer_sys::fuzz_target;

use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let mut cursor = Cursor::new(data);
    if let Ok(None) = wsframe::protocol::frame::FrameHeader::parse(&mut cursor) {
        assert_eq!(cursor.position(), 0);
    }
});
