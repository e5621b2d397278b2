//! # Consume and the isolation verifier
//!
//! `consume` moves a reference into another capability. Leaving `iso` is
//! free, leaving `syn`/`asy` only needs the owning count, and leaving an
//! open capability needs a walk of the subgraph reachable through
//! `mut`/`box(0)` fields:
//!
//! 1. collect the subgraph, threading it into a list through each object's
//!    trace word;
//! 2. count the `mut`/`box(0)` edges found while visiting the collected
//!    objects;
//! 3. sum the open counts of the collected objects.
//!
//! The root is isolated iff the sum exceeds the edge count by exactly one,
//! the one being the reference that is consumed.
//!
//! Objects reachable from `imm`/`box(1)` may be shared with other threads,
//! so that walk claims every object it collects with the calling thread's id
//! and brackets the sum with a clear and a re-check of the reserved bits.
//! Meeting another thread's claim, or a reserved bit set during the sum,
//! refuses the consume. Two racing consumes may both be refused; they never
//! both succeed.

use std::sync::atomic::Ordering;

use crate::{
    actor::Mailbox,
    capability::{BoxTag, Capability, Count},
    config::{config, LockDiscipline},
    counter,
    error::{Error, Refused, Result},
    frame::thread_id,
    heap::{self, trace_parts, trace_word, Link, LinkCode, Mechanism, Object, ObjectId, Slot},
    reference::Ref,
    shape::FieldKind,
    sync::SynLock,
};

/// Totals of one isolation walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tally
{
    pub(crate) collected: usize,
    pub(crate) edges: usize,
    pub(crate) open: usize,
}

impl Tally
{
    pub(crate) fn isolated(&self) -> bool { self.open.checked_sub(self.edges) == Some(1) }
}

/// Objects collected by one walk, threaded through their trace words.
struct Collection
{
    /// Zero for the unclaimed `mut` walk.
    claim: u32,
    head: ObjectId,
    tail: Option<ObjectId>,
    len: usize,
}

struct Members
{
    next: Option<ObjectId>,
}

impl Iterator for Members
{
    type Item = &'static Object;

    fn next(&mut self) -> Option<Self::Item>
    {
        let obj = heap::object(self.next?);
        self.next = match trace_parts(obj.trace.load(Ordering::Acquire)).1 {
            LinkCode::Next(id) => Some(id),
            _ => None,
        };
        Some(obj)
    }
}

impl Collection
{
    fn new(root: ObjectId, shared: bool) -> Self
    {
        Collection {
            claim: if shared { thread_id() } else { 0 },
            head: root,
            tail: None,
            len: 0,
        }
    }

    fn shared(&self) -> bool { self.claim != 0 }

    fn members(&self) -> Members
    {
        Members {
            next: (self.len > 0).then_some(self.head),
        }
    }

    /// Add `obj` to the collection unless it is already in it.
    fn mark(&mut self, id: ObjectId, obj: &Object) -> Result<()>
    {
        let fresh = trace_word(self.claim, LinkCode::End);
        if self.shared() {
            if let Err(word) = obj
                .trace
                .compare_exchange(0, fresh, Ordering::AcqRel, Ordering::Acquire)
            {
                let (owner, _) = trace_parts(word);
                if owner != self.claim {
                    tracing::debug!(object = %id, owner, "object claimed by a racing consume");
                    return Err(Error::NotIsolated);
                }
                return Ok(());
            }
        } else {
            if trace_parts(obj.trace.load(Ordering::Relaxed)).1 != LinkCode::Uncollected {
                return Ok(());
            }
            obj.trace.store(fresh, Ordering::Relaxed);
        }

        if let Some(tail) = self.tail {
            heap::object(tail)
                .trace
                .store(trace_word(self.claim, LinkCode::Next(id)), Ordering::Release);
        }
        self.tail = Some(id);
        self.len += 1;
        Ok(())
    }

    /// Mark the targets of the `mut`/`box(0)` fields of `obj`. Returns the
    /// number of such edges.
    fn visit(&mut self, obj: &Object) -> Result<usize>
    {
        let body = obj.body.read();
        let Some(shape) = body.shape.clone() else {
            return Ok(0);
        };
        let mut edges = 0;
        for (index, slot) in body.slots.iter().enumerate() {
            let Slot::Ref { link, tag } = *slot else {
                continue;
            };
            let internal = match shape.kind(index) {
                FieldKind::Ref(Capability::Mut) => true,
                FieldKind::Ref(Capability::Box(_)) => tag == BoxTag::Zero,
                _ => false,
            };
            if !internal {
                continue;
            }
            edges += 1;
            if let Some(target) = link.object() {
                self.mark(link.id, target)?;
            }
        }
        Ok(edges)
    }

    /// Collect everything reachable from the head and count its edges. The
    /// list doubles as the work queue.
    fn gather(&mut self, root: &Object) -> Result<usize>
    {
        self.mark(self.head, root)?;
        let mut edges = 0;
        let mut cursor = Some(self.head);
        while let Some(id) = cursor {
            let obj = heap::object(id);
            edges += self.visit(obj)?;
            cursor = match trace_parts(obj.trace.load(Ordering::Acquire)).1 {
                LinkCode::Next(next) => Some(next),
                _ => None,
            };
        }
        Ok(edges)
    }

    /// Sum the open counts. A shared collection clears the reserved bits
    /// first and refuses if any was set again by the time `between` has
    /// run after the sum.
    fn tally(&self, edges: usize, between: impl FnOnce()) -> Result<Tally>
    {
        if self.shared() {
            self.members().for_each(counter::clear_reserved);
        }
        let open = self.members().map(counter::open_count).sum();
        between();
        if self.shared() && self.members().any(counter::is_reserved) {
            tracing::debug!(object = %self.head, "count changed during the tally");
            return Err(Error::NotIsolated);
        }
        Ok(Tally {
            collected: self.len,
            edges,
            open,
        })
    }

    /// Unthread the list and drop every claim taken.
    fn release(self)
    {
        for obj in self.members() {
            obj.trace.store(0, Ordering::Release);
        }
    }
}

/// Run the isolation walk rooted at `root`. `shared` selects the claimed
/// protocol for `imm`/`box(1)` roots.
pub(crate) fn verify(root: Link, shared: bool) -> Result<Tally> { verify_interleaved(root, shared, || ()) }

/// [`verify`], running `between` after the open counts are summed and
/// before the reserved bits are checked again.
pub(crate) fn verify_interleaved(root: Link, shared: bool, between: impl FnOnce()) -> Result<Tally>
{
    let Some(obj) = root.object() else {
        return Err(Error::NotIsolated);
    };
    let mut collection = Collection::new(root.id, shared);
    let tally = collection
        .gather(obj)
        .and_then(|edges| collection.tally(edges, between));
    collection.release();
    tally
}

fn retire(mechanism: Option<std::sync::Arc<Mechanism>>)
{
    if let Some(mechanism) = mechanism {
        mechanism.retire();
    }
}

impl Ref
{
    /// Move this reference into capability `target`.
    ///
    /// On failure the reference comes back unchanged inside the
    /// [`Refused`] value.
    pub fn consume(self, target: Capability) -> std::result::Result<Ref, Refused>
    {
        let discipline = config().lock_discipline;
        self.transfer(target, discipline)
    }

    /// Consume into `syn` with a lock discipline other than the configured
    /// one.
    pub fn into_syn(self, discipline: LockDiscipline) -> std::result::Result<Ref, Refused>
    {
        self.transfer(Capability::Syn, discipline)
    }

    /// Change capability without any runtime check. Only an `iso`
    /// reference may be cast.
    pub fn cast(self, target: Capability) -> std::result::Result<Ref, Refused>
    {
        if self.capability() != Capability::Iso {
            let error = Error::IncompatibleCapability {
                from: self.capability(),
                to: Capability::Iso,
            };
            return Err(Refused {
                error,
                reference: self,
            });
        }
        let obj = self.enter("cast");
        Ok(self.convert(obj, target, config().lock_discipline))
    }

    fn transfer(self, target: Capability, discipline: LockDiscipline) -> std::result::Result<Ref, Refused>
    {
        let obj = self.enter("consume");
        let from = self.capability();
        let verdict = match from {
            Capability::Iso => Ok(()),
            Capability::Syn | Capability::Asy => match counter::owning_count(obj) {
                1 => Ok(()),
                _ => Err(Error::NotIsolated),
            },
            Capability::Mut | Capability::Box(BoxTag::Zero) => {
                verify(self.link(), false).and_then(|t| self.judge(t))
            }
            Capability::Imm | Capability::Box(BoxTag::One) => {
                verify(self.link(), true).and_then(|t| self.judge(t))
            }
        };

        match verdict {
            Ok(()) => {
                tracing::debug!(object = %self.id(), %from, to = %target, "consumed");
                Ok(self.convert(obj, target, discipline))
            }
            Err(error) => {
                tracing::debug!(object = %self.id(), %from, to = %target, %error, "consume refused");
                Err(Refused {
                    error,
                    reference: self,
                })
            }
        }
    }

    fn judge(&self, tally: Tally) -> Result<()>
    {
        tracing::debug!(
            object = %self.id(),
            collected = tally.collected,
            edges = tally.edges,
            open = tally.open,
            "isolation tally"
        );
        if tally.isolated() {
            Ok(())
        } else {
            Err(Error::NotIsolated)
        }
    }

    /// Swap capabilities after a successful check, moving the object into
    /// or out of the owning regime as needed.
    fn convert(self, obj: &'static Object, target: Capability, discipline: LockDiscipline) -> Ref
    {
        let from = self.capability();
        let (link, _) = self.into_parts();

        let mechanism = || {
            std::sync::Arc::new(match target {
                Capability::Syn => Mechanism::Lock(SynLock::new(discipline)),
                _ => Mechanism::Queue(Mailbox::spawn(link.id, &config())),
            })
        };
        match (from.count(), target.count()) {
            (Count::Open, Count::Owning) => {
                counter::install_bias(obj);
                *obj.mechanism.lock() = Some(mechanism());
            }
            (Count::Owning, Count::Open) => {
                retire(obj.mechanism.lock().take());
                counter::remove_bias(obj);
            }
            (Count::Owning, Count::Owning) if from != target => {
                let old = obj.mechanism.lock().replace(mechanism());
                retire(old);
            }
            _ => {}
        }
        Ref::adopt(link, target)
    }
}
