#![no_main]
use libfuzzer_sys::fuzz_target;

use wsframe::{protocol::Role, DataFrame, DataState, WebSocketConfig};

// The first byte picks the chunk size so split headers get exercised too.
fuzz_target!(|data: &[u8]| {
    let Some((&split, input)) = data.split_first() else {
        return;
    };
    let config = WebSocketConfig::default().max_message_size(Some(1 << 16));
    let mut frame = DataFrame::new(Role::Server, config.accept_unmasked_frames(split & 1 == 1));

    for chunk in input.chunks(usize::from(split).max(1)) {
        let mut state = frame.append(chunk);
        loop {
            match state {
                DataState::Continuing => break,
                DataState::Closed => return,
                DataState::Complete => {
                    frame.take_message();
                }
                DataState::Ping | DataState::Pong => {
                    assert!(frame.as_raw().iter().map(|s| s.len()).sum::<usize>() <= 125);
                }
            }
            frame.reset();
            state = frame.resume();
        }
    }
});
