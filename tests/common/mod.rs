//! Common test utilities.
//!
//! Every test attaches to its own shared-memory region: names carry the
//! process id plus a sequence number so parallel test runs never collide,
//! and end in `_1` so the grow chain has a serial to count.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};

/// A region name unique to this test invocation.
pub fn unique_region(tag: &str) -> String {
    static SEQ: AtomicU32 = AtomicU32::new(0);
    format!(
        "sht_{}_{}_{}_1",
        tag,
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// The name the first grow migrates to: trailing serial bumped by one.
pub fn successor_of(name: &str) -> String {
    let idx = name.rfind('_').expect("test region names end in _<digits>");
    let serial: u64 = name[idx + 1..].parse().expect("numeric serial");
    format!("{}{}", &name[..=idx], serial + 1)
}
