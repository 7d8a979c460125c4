#![no_main]
use libfuzzer_sys::fuzz_target;
use segalloc_core::{AllocatorConfig, SegAllocator};

fuzz_target!(|data: &[u8]| {
    // Each 4-byte chunk is one operation: opcode, slot, 16-bit size.
    if data.len() < 4 {
        return;
    }

    let config = AllocatorConfig::default()
        .with_log_level(None)
        .with_chunk_size(256)
        .with_max_heap(1 << 20);
    let Ok(mut alloc) = SegAllocator::new(config) else {
        return;
    };
    let mut slots: [Option<(usize, u8)>; 16] = [None; 16];

    for chunk in data.chunks_exact(4) {
        let slot = usize::from(chunk[1] % 16);
        let size = usize::from(u16::from_le_bytes([chunk[2], chunk[3]]));
        let tag = chunk[1];

        match chunk[0] % 4 {
            0 => {
                if slots[slot].is_none() {
                    if let Some(ptr) = alloc.malloc(size) {
                        if let Some(bytes) = alloc.payload_mut(ptr) {
                            bytes.fill(tag);
                        }
                        slots[slot] = Some((ptr, tag));
                    }
                }
            }
            1 => {
                if let Some((ptr, tag)) = slots[slot].take() {
                    let payload = alloc.payload(ptr).expect("live payload");
                    assert!(payload.iter().all(|&b| b == tag), "payload clobbered");
                    alloc.free(ptr);
                }
            }
            2 => {
                if let Some((ptr, tag)) = slots[slot] {
                    let kept = alloc.usable_size(ptr).expect("live block").min(size);
                    match alloc.realloc(ptr, size) {
                        Some(new_ptr) => {
                            let bytes = alloc.payload_mut(new_ptr).expect("live payload");
                            assert!(bytes[..kept].iter().all(|&b| b == tag));
                            bytes.fill(tag);
                            slots[slot] = Some((new_ptr, tag));
                        }
                        None if size == 0 => slots[slot] = None,
                        None => {}
                    }
                }
            }
            _ => {
                if slots[slot].is_none() {
                    let count = usize::from(chunk[2]);
                    let elem = usize::from(chunk[3]);
                    if let Some(ptr) = alloc.calloc(count, elem) {
                        let bytes = alloc.payload_mut(ptr).expect("live payload");
                        assert!(bytes.iter().all(|&b| b == 0), "calloc must zero");
                        bytes.fill(tag);
                        slots[slot] = Some((ptr, tag));
                    }
                }
            }
        }

        let report = alloc.validate();
        assert!(report.is_ok(), "{report:?}");
    }

    for (ptr, _) in slots.into_iter().flatten() {
        alloc.free(ptr);
    }
    assert!(alloc.validate().is_ok());
});
