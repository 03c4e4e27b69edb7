//! Standard memory orderings for cross-process shared state.
//!
//! These constants ensure consistent ordering usage across the codebase
//! and make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for bumping a reference count.
/// Relaxed is sufficient: a new reference is always cloned from a live one.
pub const REF_INC: Ordering = Ordering::Relaxed;

/// Ordering for dropping a reference count.
/// Release makes prior writes visible to whichever thread observes zero.
pub const REF_DEC: Ordering = Ordering::Release;

/// Ordering for the fence taken after a count reaches zero,
/// before the value is torn down.
pub const REF_SYNC: Ordering = Ordering::Acquire;

/// Ordering for the success case of the weak-to-strong upgrade CAS.
pub const UPGRADE_OK: Ordering = Ordering::Acquire;

/// Ordering for the failure case of the weak-to-strong upgrade CAS.
pub const UPGRADE_FAIL: Ordering = Ordering::Relaxed;

/// Ordering for publishing a sticky flag (`outdated`, segment init state).
/// Pairs with [`FLAG_READ`].
pub const FLAG_SET: Ordering = Ordering::Release;

/// Ordering for observing a sticky flag.
/// Pairs with [`FLAG_SET`].
pub const FLAG_READ: Ordering = Ordering::Acquire;

/// Ordering for plain loads within a locked region.
/// Safe because the lock provides synchronization.
pub const RELAXED: Ordering = Ordering::Relaxed;
