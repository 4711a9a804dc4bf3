//! Property tests for chunking and readback verification.

use std::time::Duration;

use fwup_core::device::mock::MockDevice;
use fwup_core::{
    Backoff, ChunkLayout, Chunks, Error, RetryLedger, RetryPolicy, Verifier, VerifyStrategy,
};
use proptest::prelude::*;

fn verifier() -> Verifier {
    Verifier::new(
        RetryPolicy::new(1, Duration::ZERO, Backoff::Fixed),
        Duration::from_millis(10),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_chunks_rebuild_payload(
        payload in proptest::collection::vec(any::<u8>(), 0..2048),
        max_size in 1usize..300,
        start in proptest::option::of(0u64..0x1_0000),
        page in proptest::option::of(1u64..512),
    ) {
        let mut layout = ChunkLayout::new(start, max_size);
        if let Some(page) = page {
            layout = layout.with_page_size(page);
        }
        let chunks = Chunks::new(&payload, layout).unwrap();
        let total = chunks.total();
        let base = start.unwrap_or(0);

        let mut rebuilt = Vec::with_capacity(payload.len());
        let mut last_address = None;
        let mut count = 0;
        for (i, chunk) in chunks.enumerate() {
            prop_assert_eq!(chunk.index, i);
            prop_assert!(!chunk.is_empty());
            prop_assert!(chunk.len() <= max_size);
            prop_assert_eq!(chunk.address, base + chunk.offset as u64);
            if let Some(prev) = last_address {
                prop_assert!(chunk.address > prev);
            }
            if let Some(page) = page {
                let first_page = chunk.address / page;
                let last_page = (chunk.address + chunk.len() as u64 - 1) / page;
                prop_assert_eq!(first_page, last_page);
            }
            last_address = Some(chunk.address);
            rebuilt.extend_from_slice(chunk.data);
            count += 1;
        }
        prop_assert_eq!(count, total);
        prop_assert_eq!(rebuilt, payload);
    }

    #[test]
    fn prop_readback_reports_first_corrupt_offset(
        payload in proptest::collection::vec(any::<u8>(), 1..512),
        max_size in 1usize..128,
        pick in any::<prop::sample::Index>(),
        mask in 1u8..=255,
    ) {
        let base = 0x2000u64;
        let offset = pick.index(payload.len());
        let mut dev = MockDevice::new();
        dev.load_memory(base, &payload);
        dev.corrupt(base + offset as u64, mask);

        let err = verifier()
            .run(
                &mut dev,
                VerifyStrategy::ReadBack,
                &payload,
                ChunkLayout::new(Some(base), max_size),
                &mut RetryLedger::new(),
                |_, _| {},
            )
            .unwrap_err();

        match err {
            Error::Mismatch { offset: got, address, expected, actual } => {
                prop_assert_eq!(got, offset);
                prop_assert_eq!(address, base + offset as u64);
                prop_assert_eq!(expected, payload[offset]);
                prop_assert_eq!(actual, payload[offset] ^ mask);
            }
            other => prop_assert!(false, "unexpected error: {}", other),
        }
    }
}
