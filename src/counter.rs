//! # The dual reference count
//!
//! Every object carries an open count (references that may be dereferenced:
//! `mut`, `imm`, `box`, and the single `iso`) and an owning count (`syn` and
//! `asy` references). Which instructions update a count is decided by the
//! capability doing the update: thread-confined capabilities use plain
//! load/store arithmetic, shareable ones use atomic read-modify-write.
//!
//! While the owning count is positive, the open count carries a bias of one
//! so that scope aliases coming and going never drive it to zero. Only the
//! owning count reaching zero frees such an object, and it does so eagerly.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    capability::{Capability, Count},
    heap::{self, Link, Object, Slot},
    shape::FieldKind,
};

/// Packed into the top bit of the open count. Set by every atomic update,
/// cleared and re-checked by the shared isolation check.
pub(crate) const RESERVED_BIT: usize = 1 << (usize::BITS - 1);
const COUNT_MASK: usize = !RESERVED_BIT;

/// Update discipline for a count word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline
{
    Plain,
    Atomic,
}

impl Discipline
{
    pub fn of(capability: Capability) -> Self
    {
        if capability.is_atomic() {
            Discipline::Atomic
        } else {
            Discipline::Plain
        }
    }

    fn increment(self, word: &AtomicUsize)
    {
        match self {
            Discipline::Plain => {
                let n = word.load(Ordering::Relaxed);
                word.store(n + 1, Ordering::Relaxed);
            }
            Discipline::Atomic => {
                let _ = word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    Some((n + 1) | RESERVED_BIT)
                });
            }
        }
    }

    /// Returns the remaining count, or `None` if the count was already zero.
    fn decrement(self, word: &AtomicUsize) -> Option<usize>
    {
        match self {
            Discipline::Plain => {
                let n = word.load(Ordering::Relaxed);
                if n & COUNT_MASK == 0 {
                    return None;
                }
                word.store(n - 1, Ordering::Relaxed);
                Some((n - 1) & COUNT_MASK)
            }
            Discipline::Atomic => word
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    if n & COUNT_MASK == 0 {
                        None
                    } else {
                        Some((n - 1) | RESERVED_BIT)
                    }
                })
                .ok()
                .map(|n| (n & COUNT_MASK) - 1),
        }
    }
}

pub(crate) fn open_count(obj: &Object) -> usize { obj.open.load(Ordering::Acquire) & COUNT_MASK }

pub(crate) fn owning_count(obj: &Object) -> usize { obj.owning.load(Ordering::Acquire) }

pub(crate) fn is_reserved(obj: &Object) -> bool
{
    obj.open.load(Ordering::Acquire) & RESERVED_BIT != 0
}

pub(crate) fn clear_reserved(obj: &Object) { obj.open.fetch_and(COUNT_MASK, Ordering::AcqRel); }

/// INCREF on behalf of a new reference of capability `capability`.
pub(crate) fn retain(obj: &Object, capability: Capability)
{
    match capability.count() {
        Count::Open => Discipline::of(capability).increment(&obj.open),
        Count::Owning => {
            obj.owning.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// DECREF on behalf of a reference of capability `capability`, freeing the
/// object and releasing its fields when the count hits zero.
pub(crate) fn release(link: Link, capability: Capability)
{
    let mut pending = vec![(link, capability)];
    while let Some((link, capability)) = pending.pop() {
        let Some(obj) = link.object() else {
            tracing::trace!(object = %link.id, "release of stale reference ignored");
            continue;
        };
        let remaining = match capability.count() {
            Count::Open => Discipline::of(capability).decrement(&obj.open),
            Count::Owning => obj
                .owning
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .ok()
                .map(|n| n - 1),
        };
        if remaining == Some(0) {
            tracing::trace!(object = %link.id, via = %capability, "count reached zero");
            reclaim(link, capability, &mut pending);
        }
    }
}

/// Free the object and queue its reference fields for release, each under
/// the capability it has when seen through `capability`.
fn reclaim(link: Link, capability: Capability, pending: &mut Vec<(Link, Capability)>)
{
    let Some((body, mechanism)) = heap::free(link) else {
        return;
    };
    if let Some(mechanism) = mechanism {
        mechanism.retire();
    }
    let Some(shape) = body.shape else {
        return;
    };
    for (index, slot) in body.slots.into_iter().enumerate() {
        if let (Slot::Ref { link, tag }, FieldKind::Ref(declared)) = (slot, shape.kind(index)) {
            let stored = match declared {
                Capability::Box(_) => Capability::Box(tag),
                other => other,
            };
            pending.push((link, capability.field_capability(stored)));
        }
    }
}

/// Enter the owning regime: `owning_count` becomes one and the open count
/// takes its bias. The consumed source's own open contribution becomes the
/// bias, so the count itself is unchanged; from here on the word is shared
/// between threads, which the reserved bit records.
pub(crate) fn install_bias(obj: &Object)
{
    obj.owning.store(1, Ordering::Release);
    obj.open.fetch_or(RESERVED_BIT, Ordering::AcqRel);
}

/// Leave the owning regime. The bias becomes the open contribution of the
/// reference the object is consumed into.
pub(crate) fn remove_bias(obj: &Object) { obj.owning.store(0, Ordering::Release); }
