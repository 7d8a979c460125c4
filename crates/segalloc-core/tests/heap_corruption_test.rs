//! Integration test: the validator against injected corruption.
//!
//! Each test builds a small heap through the public API, damages it through
//! raw arena access, and checks the structured report.
//!
//! Run: cargo test -p segalloc-core --test heap_corruption_test

use segalloc_core::{
    AllocatorConfig, AllocatorLogLevel, ArenaProvider, BlockHeader, HeapViolation, SegAllocator,
};

fn poke(a: &mut SegAllocator, offset: usize, word: u32) {
    a.arena_mut().bytes_mut()[offset..offset + 4].copy_from_slice(&word.to_le_bytes());
}

/// Four 32-byte blocks at 16, 48, 80 and 112 with 16 and 80 freed, so the
/// 32-byte list reads 80 -> 16.
fn two_listed_blocks() -> SegAllocator {
    let mut a = SegAllocator::new(AllocatorConfig::default()).unwrap();
    let ptrs: Vec<usize> = (0..4).map(|_| a.malloc(24).unwrap()).collect();
    assert_eq!(ptrs, vec![16, 48, 80, 112]);
    a.free(16);
    a.free(80);
    assert_eq!(a.free_list(1), vec![80, 16]);
    a.drain_lifecycle_logs();
    a
}

#[test]
fn bad_footer() {
    let mut a = two_listed_blocks();
    poke(&mut a, 16 + 32 - 8, BlockHeader::free(24, false).encode());
    let report = a.check(false);
    assert_eq!(
        report.violations,
        vec![HeapViolation::FooterMismatch {
            offset: 16,
            header: 32,
            footer: 24,
        }]
    );
    let logs = a.drain_lifecycle_logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].event, "heap_check_failed");
    assert_eq!(logs[0].level, AllocatorLogLevel::Error);
    assert!(logs[0].details.contains("header size 32 but footer size 24"));
}

#[test]
fn broken_back_link() {
    let mut a = two_listed_blocks();
    // 16.prev should point back at 80.
    poke(&mut a, 16, 0);
    assert_eq!(
        a.validate().violations,
        vec![HeapViolation::BrokenLink {
            bucket: 1,
            offset: 80,
            next: 16,
        }]
    );
}

#[test]
fn stale_predecessor_bit() {
    let mut a = two_listed_blocks();
    poke(&mut a, 112 - 4, BlockHeader::new(32, true, true).encode());
    assert_eq!(
        a.validate().violations,
        vec![HeapViolation::StalePrevAllocated {
            offset: 112,
            recorded: true,
            actual: false,
        }]
    );
}

#[test]
fn block_filed_in_wrong_bucket() {
    let mut a = two_listed_blocks();
    // A 48-byte size belongs in bucket 2.
    poke(&mut a, 80 - 4, BlockHeader::free(48, true).encode());
    poke(&mut a, 80 + 48 - 8, BlockHeader::free(48, false).encode());
    let violations = a.validate().violations;
    let misfiled = HeapViolation::WrongBucket {
        bucket: 1,
        offset: 80,
        size: 48,
        min: 17,
        max: Some(32),
    };
    assert!(violations.contains(&misfiled), "{violations:?}");
    assert_eq!(
        misfiled.to_string(),
        "bucket 1: block 80 of size 48 is outside the bucket's range 17..=32"
    );
}

#[test]
fn catch_all_bucket_range_is_open_ended() {
    let misfiled = HeapViolation::WrongBucket {
        bucket: 9,
        offset: 16,
        size: 24,
        min: 4097,
        max: None,
    };
    assert_eq!(
        misfiled.to_string(),
        "bucket 9: block 16 of size 24 is outside the bucket's range 4097.."
    );
    let json = serde_json::to_value(&misfiled).unwrap();
    assert_eq!(json["kind"], "wrong_bucket");
    assert_eq!(json["max"], serde_json::Value::Null);
}

#[test]
fn failing_report_converts_to_error() {
    let mut a = two_listed_blocks();
    poke(&mut a, 16, 0);
    poke(&mut a, 112 - 4, BlockHeader::new(32, true, true).encode());
    let err = a.validate().into_result().unwrap_err();
    assert_eq!(err.count, 2);
    assert_eq!(
        err.to_string(),
        "heap check found 2 violation(s); first: block 112 records predecessor \
         allocated=true, actual=false"
    );
    assert_eq!(err.report.violations.len(), 2);
}
