//! # Locks of `syn` objects
//!
//! A reader/writer or recursive lock attached to an object when it is
//! consumed into `syn`. The lock is held for the whole of a
//! `locked`/`wlocked`/`rlocked` scope.
//!
//! Lock timeouts are not modelled, so re-entry that would block forever is
//! detected up front: each thread remembers which `syn` locks it holds, and
//! a conflicting re-acquisition by the holder is a fatal
//! [`Error::LockReentrancyViolation`].

use std::{cell::RefCell, sync::Arc};

use lock_api::{RawReentrantMutex, RawRwLock, RawRwLockRecursive};

use crate::{
    capability::Capability,
    config::LockDiscipline,
    error::{fatal, scope_violation, Error},
    heap::{Link, Mechanism},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode
{
    Shared,
    Exclusive,
}

thread_local! {
    static HELD : RefCell<Vec<(Link, Mode)>> = RefCell::new(Vec::new());
}

pub(crate) struct SynLock
{
    discipline: LockDiscipline,
    rw: parking_lot::RawRwLock,
    reentrant: RawReentrantMutex<parking_lot::RawMutex, parking_lot::RawThreadId>,
}

impl SynLock
{
    pub(crate) fn new(discipline: LockDiscipline) -> Self
    {
        Self {
            discipline,
            rw: <parking_lot::RawRwLock as RawRwLock>::INIT,
            reentrant: RawReentrantMutex::INIT,
        }
    }

    /// Mode a `locked` scope takes: the reader lock for a `box` request
    /// when readers and writers are told apart, the writer lock otherwise.
    pub(crate) fn mode_for(&self, relax_as: Capability) -> Mode
    {
        match (self.discipline, relax_as) {
            (LockDiscipline::ReaderWriter, Capability::Box(_)) => Mode::Shared,
            _ => Mode::Exclusive,
        }
    }

    /// Whether a scope holding this lock in `mode` excludes every writer
    /// but may run next to other readers. Only then is its `box` alias
    /// handed out as `box(1)`.
    pub(crate) fn is_reader(&self, mode: Mode) -> bool
    {
        self.discipline == LockDiscipline::ReaderWriter && mode == Mode::Shared
    }
}

/// Held `syn` lock. Released on drop.
#[must_use]
pub(crate) struct LockGuard
{
    mechanism: Arc<Mechanism>,
    link: Link,
    mode: Mode,
}

impl LockGuard
{
    fn lock(&self) -> &SynLock
    {
        match &*self.mechanism {
            Mechanism::Lock(lock) => lock,
            Mechanism::Queue(_) => unreachable!("lock guard over an actor queue"),
        }
    }
}

/// Block until the lock of the `syn` object behind `link` is held in `mode`.
pub(crate) fn acquire(mechanism: Arc<Mechanism>, link: Link, mode: Mode) -> LockGuard
{
    let Mechanism::Lock(lock) = &*mechanism else {
        scope_violation(format!("object {} is not lock-synchronised", link.id));
    };

    match lock.discipline {
        LockDiscipline::ReaderWriter => {
            let reentry = HELD.with_borrow(|held| {
                held.iter()
                    .filter(|(l, _)| *l == link)
                    .map(|(_, m)| *m)
                    .collect::<Vec<_>>()
            });
            if !reentry.is_empty() && (mode == Mode::Exclusive || reentry.contains(&Mode::Exclusive))
            {
                fatal(Error::LockReentrancyViolation(link.id));
            }
            match mode {
                Mode::Shared => lock.rw.lock_shared_recursive(),
                Mode::Exclusive => lock.rw.lock_exclusive(),
            }
        }
        LockDiscipline::Recursive => lock.reentrant.lock(),
    }

    HELD.with_borrow_mut(|held| held.push((link, mode)));
    tracing::trace!(object = %link.id, ?mode, "syn lock acquired");
    LockGuard {
        mechanism,
        link,
        mode,
    }
}

impl Drop for LockGuard
{
    fn drop(&mut self)
    {
        HELD.with_borrow_mut(|held| {
            if let Some(i) = held.iter().rposition(|e| *e == (self.link, self.mode)) {
                held.remove(i);
            }
        });
        let lock = self.lock();
        unsafe {
            match lock.discipline {
                LockDiscipline::ReaderWriter => match self.mode {
                    Mode::Shared => lock.rw.unlock_shared(),
                    Mode::Exclusive => lock.rw.unlock_exclusive(),
                },
                LockDiscipline::Recursive => lock.reentrant.unlock(),
            }
        }
        tracing::trace!(object = %self.link.id, mode = ?self.mode, "syn lock released");
    }
}
