//! # Scope frames
//!
//! Each thread keeps a stack of the relax/lock/schedule scopes it is
//! currently inside. A reference created while a frame is on top of the
//! stack is registered with that frame: the frame owns the reference's
//! count and releases it when the scope exits, whatever happened to the
//! reference value itself. Later use of such a reference is fatal.
//!
//! The stack also decides visibility: inside a frame, only sendable
//! references from the enclosing context may be used.

use std::{
    cell::RefCell,
    fmt, mem,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{
    capability::Capability,
    counter,
    error::scope_violation,
    heap::Link,
};

static NEXT_THREAD: AtomicU32 = AtomicU32::new(1);
static NEXT_FRAME: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD : u32 = NEXT_THREAD.fetch_add(1, Ordering::Relaxed);
    static STACK : RefCell<Vec<Arc<Frame>>> = RefCell::new(Vec::new());
}

/// Small, never reused id of the calling thread. Zero is never issued.
pub(crate) fn thread_id() -> u32 { THREAD.with(|t| *t) }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind
{
    Relax,
    Locked,
    Schedule,
}

pub(crate) struct Frame
{
    id: u64,
    kind: FrameKind,
    state: Mutex<FrameState>,
}

#[derive(Default)]
struct FrameState
{
    closed: bool,
    held: Vec<Option<(Link, Capability)>>,
}

impl Frame
{
    pub(crate) fn kind(&self) -> FrameKind { self.kind }

    pub(crate) fn is_closed(&self) -> bool { self.state.lock().closed }

    fn hold(self: &Arc<Self>, link: Link, capability: Capability) -> Ticket
    {
        let mut state = self.state.lock();
        state.held.push(Some((link, capability)));
        Ticket {
            frame: self.clone(),
            index: state.held.len() - 1,
        }
    }

    /// Release every count still registered with this frame.
    fn close(&self)
    {
        let held = {
            let mut state = self.state.lock();
            state.closed = true;
            mem::take(&mut state.held)
        };
        for (link, capability) in held.into_iter().flatten() {
            counter::release(link, capability);
        }
    }
}

impl fmt::Debug for Frame
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

pub(crate) struct Ticket
{
    frame: Arc<Frame>,
    index: usize,
}

impl Ticket
{
    /// Withdraw the registration. True if the frame still held the count,
    /// which now belongs to the caller.
    fn redeem(&self) -> bool
    {
        let mut state = self.frame.state.lock();
        if state.closed {
            return false;
        }
        state
            .held
            .get_mut(self.index)
            .and_then(Option::take)
            .is_some()
    }
}

/// Who owns the count contributed by a reference value.
pub(crate) enum Hold
{
    /// The reference itself, created outside any scope.
    Loose,
    /// The frame the reference was created in.
    Framed(Ticket),
    /// Nobody: the count was moved elsewhere or already released.
    Spent,
}

impl Hold
{
    /// Register a fresh count with the innermost frame of this thread.
    pub(crate) fn new(link: Link, capability: Capability) -> Self
    {
        match current() {
            Some(frame) => Hold::Framed(frame.hold(link, capability)),
            None => Hold::Loose,
        }
    }

    /// Take the count away from whoever holds it. True if there was one.
    pub(crate) fn take(&mut self) -> bool
    {
        match mem::replace(self, Hold::Spent) {
            Hold::Loose => true,
            Hold::Framed(ticket) => ticket.redeem(),
            Hold::Spent => false,
        }
    }

    pub(crate) fn frame(&self) -> Option<&Arc<Frame>>
    {
        match self {
            Hold::Framed(ticket) => Some(&ticket.frame),
            _ => None,
        }
    }

    pub(crate) fn expired(&self) -> bool
    {
        match self {
            Hold::Loose => false,
            Hold::Framed(ticket) => ticket.frame.is_closed(),
            Hold::Spent => true,
        }
    }
}

impl fmt::Debug for Hold
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Hold::Loose => write!(f, "Loose"),
            Hold::Framed(ticket) => f.debug_tuple("Framed").field(&ticket.frame).finish(),
            Hold::Spent => write!(f, "Spent"),
        }
    }
}

pub(crate) fn current() -> Option<Arc<Frame>> { STACK.with_borrow(|s| s.last().cloned()) }

fn same_frame(a: Option<&Arc<Frame>>, b: Option<&Arc<Frame>>) -> bool
{
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

/// Fatal unless a reference with these properties may be used here.
pub(crate) fn check_visible(capability: Capability, home: u32, hold: &Hold, operation: &str)
{
    if hold.expired() {
        scope_violation(format!(
            "{} reference used for {} after the scope that created it exited",
            capability, operation
        ));
    }
    let current = current();
    let local = same_frame(hold.frame(), current.as_ref());
    if !capability.is_sendable() {
        if home != thread_id() {
            scope_violation(format!(
                "{} reference used for {} off the thread that created it",
                capability, operation
            ));
        }
        if !local {
            scope_violation(format!(
                "{} reference from an enclosing scope used for {}",
                capability, operation
            ));
        }
    }
    if capability == Capability::Iso && !local {
        if let Some(frame) = &current {
            if frame.kind() == FrameKind::Schedule {
                scope_violation(format!(
                    "iso reference captured by a scheduled task without consume, used for {}",
                    operation
                ));
            }
        }
    }
}

/// Push a frame for the duration of the guard.
pub(crate) fn enter(kind: FrameKind) -> FrameGuard
{
    let frame = Arc::new(Frame {
        id: NEXT_FRAME.fetch_add(1, Ordering::Relaxed),
        kind,
        state: Mutex::new(FrameState::default()),
    });
    STACK.with_borrow_mut(|s| s.push(frame.clone()));
    FrameGuard { frame }
}

#[must_use]
pub(crate) struct FrameGuard
{
    frame: Arc<Frame>,
}

impl Drop for FrameGuard
{
    fn drop(&mut self)
    {
        let popped = STACK.with_borrow_mut(|s| s.pop());
        debug_assert!(
            popped.map_or(false, |f| Arc::ptr_eq(&f, &self.frame)),
            "scope frames exited out of order"
        );
        self.frame.close();
    }
}
