//! Multi-handle lifecycle tests: reference counts, data visibility, and
//! teardown, observed through several handles to the same name.
//!
//! Segment names are host-global state, so every test derives a unique name
//! from the pid plus a counter; an `AlreadyExists` here would mean leftover
//! objects from a crashed prior run.

use std::sync::atomic::{AtomicU32, Ordering};

use shmseg::{SegError, SegName, Segment};

fn unique_name(tag: &str) -> SegName {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    SegName::new(format!("/shmseg-it-{tag}-{}-{n}", std::process::id())).unwrap()
}

/// /dev/shm may be read-only in sandboxed environments; skip instead of
/// failing there.
fn create_or_skip(name: SegName, payload: u64) -> Option<Segment> {
    match Segment::create(name, payload) {
        Ok(seg) => Some(seg),
        Err(SegError::Os { ref source, .. })
            if source.kind() == std::io::ErrorKind::PermissionDenied =>
        {
            eprintln!("skipping: shared memory not permitted here");
            None
        }
        Err(err) => panic!("create failed: {err}"),
    }
}

fn write_payload(seg: &mut Segment, bytes: &[u8]) {
    let addr = seg.map().unwrap();
    unsafe {
        std::slice::from_raw_parts_mut(addr.as_ptr(), bytes.len()).copy_from_slice(bytes);
    }
}

fn read_payload(seg: &mut Segment, len: usize) -> Vec<u8> {
    let addr = seg.map().unwrap();
    unsafe { std::slice::from_raw_parts(addr.as_ptr(), len) }.to_vec()
}

#[test]
fn ref_count_tracks_handles_through_every_view() {
    let name = unique_name("refs");
    let Some(creator) = create_or_skip(name.clone(), 4096) else {
        return;
    };
    assert_eq!(creator.ref_count(), 1);

    let attachers: Vec<Segment> = (0..10)
        .map(|_| Segment::attach(name.clone()).unwrap())
        .collect();
    assert_eq!(creator.ref_count(), 11);
    for handle in &attachers {
        assert_eq!(handle.ref_count(), 11);
        assert_eq!(handle.name(), creator.name());
        assert_eq!(handle.size(), 4096);
    }

    // Dropping attachers one at a time decrements visibly through the rest.
    let mut attachers = attachers;
    for expected in (1..=10).rev() {
        drop(attachers.pop().unwrap());
        assert_eq!(creator.ref_count(), expected);
    }
    assert_eq!(creator.ref_count(), 1);
}

#[test]
fn last_release_removes_the_name() {
    let name = unique_name("teardown");
    {
        let Some(creator) = create_or_skip(name.clone(), 512) else {
            return;
        };
        let attacher = Segment::attach(name.clone()).unwrap();
        assert_eq!(attacher.ref_count(), 2);
        drop(creator);
        assert_eq!(attacher.ref_count(), 1);
    }
    let err = Segment::attach(name).unwrap_err();
    assert!(matches!(err, SegError::NotFound { .. }));
}

#[test]
fn writes_are_visible_across_handles_and_survive_the_writer() {
    let name = unique_name("shared-bytes");
    let msg = b"written by the creator";

    let Some(mut creator) = create_or_skip(name.clone(), 4096) else {
        return;
    };
    write_payload(&mut creator, msg);

    let mut attacher = Segment::attach(name.clone()).unwrap();
    assert_eq!(read_payload(&mut attacher, msg.len()), msg);

    // The attacher still holds a reference, so the writer's release must
    // not take the data with it.
    drop(creator);
    assert_eq!(read_payload(&mut attacher, msg.len()), msg);

    let mut late = Segment::attach(name).unwrap();
    assert_eq!(read_payload(&mut late, msg.len()), msg);
}

#[test]
fn unlink_blocks_new_attaches_but_not_existing_holders() {
    let name = unique_name("unlink");
    let Some(mut creator) = create_or_skip(name.clone(), 1024) else {
        return;
    };
    let mut holder = Segment::attach(name.clone()).unwrap();

    creator.unlink().unwrap();

    let err = Segment::attach(name).unwrap_err();
    assert!(
        matches!(err, SegError::SegmentGone { .. } | SegError::NotFound { .. }),
        "unexpected error: {err}"
    );

    // Handles attached before the unlink keep working until they release.
    write_payload(&mut creator, b"post-unlink");
    assert_eq!(read_payload(&mut holder, 11), b"post-unlink");
}

#[test]
fn size_is_the_requested_payload_size() {
    // Sizes the OS will round up to page multiples; size() must not.
    for requested in [1u64, 100, 4096, 5000] {
        let Some(seg) = create_or_skip(unique_name("size"), requested) else {
            return;
        };
        assert_eq!(seg.size(), requested);
        let attacher = Segment::attach(seg.name().clone()).unwrap();
        assert_eq!(attacher.size(), requested);
    }
}

#[test]
fn seg_a_scenario() {
    // create "seg-a" with a 4096-byte payload
    let name = unique_name("seg-a");
    let Some(creator) = create_or_skip(name.clone(), 4096) else {
        return;
    };
    assert_eq!(creator.size(), 4096);
    assert_eq!(creator.ref_count(), 1);

    // attach twice more: every handle observes 3
    let second = Segment::attach(name.clone()).unwrap();
    let third = Segment::attach(name.clone()).unwrap();
    for handle in [&creator, &second, &third] {
        assert_eq!(handle.ref_count(), 3);
    }

    // drop the two attached handles
    drop(second);
    drop(third);
    assert_eq!(creator.ref_count(), 1);

    // drop the last: the name is gone
    drop(creator);
    let err = Segment::attach(name).unwrap_err();
    assert!(matches!(err, SegError::NotFound { .. }));
}
