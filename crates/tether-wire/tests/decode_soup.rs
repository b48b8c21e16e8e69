//! Decoders must fail cleanly on arbitrary byte soup, never panic.

use proptest::prelude::*;
use tether_wire::{decode_command, decode_event, RecordIter};

proptest! {
    #[test]
    fn command_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        let _ = decode_command(&bytes);
    }

    #[test]
    fn event_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        let _ = decode_event(&bytes);
    }

    #[test]
    fn record_iter_never_panics_and_terminates(
        bytes in proptest::collection::vec(any::<u8>(), 0..2048),
    ) {
        // The iterator must finish (poisoning itself on the first bad length).
        let mut count = 0usize;
        for record in RecordIter::new(&bytes) {
            let _ = record;
            count += 1;
            prop_assert!(count <= bytes.len());
        }
    }
}
