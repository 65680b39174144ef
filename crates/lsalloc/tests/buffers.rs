//! Buffer allocation and pointer stability across compaction.

mod common;

use lsalloc::{tracker, Error, Region, SEGMENT_SIZE};

#[test]
fn buffer_contents_survive_compaction() {
    common::init_logging();
    let region = Region::new();

    let buf = region.alloc_buf(65536).expect("alloc_buf failed");
    assert_eq!(buf.size(), 65536);
    assert_eq!(buf.get() as usize % 4096, 0);
    let original_address = buf.get();
    unsafe {
        for i in 0..65536usize {
            buf.get().add(i).write(((i * 7) % 251) as u8);
        }
    }

    region.full_compaction().expect("full compaction failed");

    // The handle still points at the bytes; the address is allowed to have
    // changed.
    assert!(buf.is_engaged());
    unsafe {
        for i in 0..65536usize {
            assert_eq!(buf.get().add(i).read(), ((i * 7) % 251) as u8);
        }
    }
    let _ = original_address;

    drop(buf);
    assert_eq!(region.occupancy().used_space(), 0);
}

#[test]
fn oversize_buffer_is_rejected() {
    common::init_logging();
    let region = Region::new();
    let err = region.alloc_buf(SEGMENT_SIZE + 1).unwrap_err();
    assert_eq!(
        err,
        Error::BufferTooLarge {
            size: SEGMENT_SIZE + 1
        }
    );
}

#[test]
fn dropping_buffers_releases_segments() {
    common::init_logging();
    let region = Region::new();
    let buffers: Vec<_> = (0..16)
        .map(|_| region.alloc_buf(16384).expect("alloc_buf failed"))
        .collect();
    assert!(region.occupancy().used_space() >= 16 * 16384);

    drop(buffers);
    assert_eq!(region.occupancy().used_space(), 0);

    drop(region);
    assert_eq!(tracker::metrics().segments_in_use, 0);
}

#[test]
fn sparse_buffer_segments_compact_and_relink() {
    common::init_logging();
    let region = Region::new();

    let mut buffers: Vec<_> = (0..32)
        .map(|i| {
            let buf = region.alloc_buf(16384).expect("alloc_buf failed");
            unsafe {
                buf.get().write_bytes(i as u8, 16384);
            }
            Some(buf)
        })
        .collect();

    // Punch holes, then force everything to move.
    for slot in buffers.iter_mut().step_by(2) {
        *slot = None;
    }
    region.full_compaction().expect("full compaction failed");

    for (i, slot) in buffers.iter().enumerate() {
        if let Some(buf) = slot {
            assert!(buf.is_engaged());
            unsafe {
                for offset in [0usize, 1, 8191, 16383] {
                    assert_eq!(buf.get().add(offset).read(), i as u8);
                }
            }
        }
    }

    buffers.clear();
    drop(region);
    assert_eq!(tracker::metrics().segments_in_use, 0);
}
