//! # Relax, lock and schedule scopes
//!
//! An owning reference cannot be dereferenced. To get at its object, a
//! scope hands out an open alias (`mut` or `box`) for the duration of a
//! closure:
//!
//! * [`Ref::relax`] on `iso` does so directly, on `syn` it takes the lock
//!   and on `asy` it waits for an exclusive turn on the actor.
//! * [`Ref::locked`], [`Ref::wlocked`] and [`Ref::rlocked`] lock a `syn`
//!   object.
//! * [`Ref::relax_field`] opens an `iso` field of an open object.
//! * [`Ref::schedule`] runs the closure as a task on an `asy` object's
//!   queue.
//!
//! Every reference created inside the closure belongs to the scope and is
//! released when it exits. While a scope of an owning object is open, the
//! object's owning count is pinned so that the object outlives the scope.

use std::cell::RefCell;

use crate::{
    actor::{self, Mailbox, TaskHandle},
    capability::{Access, Capability},
    counter,
    error::{fatal, scope_violation, Error, Refused, Result},
    frame::{self, FrameKind},
    heap::{Link, Mechanism, Object},
    reference::Ref,
    sync::{self, Mode},
};

/// View of an object inside a scope.
pub struct Scope
{
    target: Ref,
    arg: RefCell<Option<Ref>>,
}

impl Scope
{
    /// The open alias handed out by the scope.
    pub fn target(&self) -> &Ref { &self.target }

    pub fn capability(&self) -> Capability { self.target.capability() }

    /// The `iso` argument consumed by [`Ref::schedule_consuming`] or
    /// [`crate::Future::consuming`], once.
    pub fn take_arg(&self) -> Option<Ref> { self.arg.borrow_mut().take() }
}

/// Extra owning count held for the lifetime of a `syn` or `asy` scope.
struct Pin
{
    link: Link,
    capability: Capability,
}

impl Pin
{
    fn new(obj: &Object, link: Link, capability: Capability) -> Pin
    {
        counter::retain(obj, capability);
        Pin { link, capability }
    }
}

impl Drop for Pin
{
    fn drop(&mut self) { counter::release(self.link, self.capability) }
}

/// Push a frame, alias `link` as `produced` inside it and run `body`.
fn run_scope<R>(
    link: Link,
    produced: Capability,
    kind: FrameKind,
    arg: Option<(Link, Capability)>,
    body: impl FnOnce(&Scope) -> R,
) -> R
{
    let Some(obj) = link.object() else {
        scope_violation(format!("scope opened on freed object {}", link.id));
    };
    counter::retain(obj, produced);
    let _frame = frame::enter(kind);
    tracing::trace!(object = %link.id, capability = %produced, ?kind, "scope entered");
    let scope = Scope {
        target: Ref::adopt(link, produced),
        arg: RefCell::new(arg.map(|(link, capability)| Ref::adopt(link, capability))),
    };
    let res = body(&scope);
    drop(scope);
    tracing::trace!(object = %link.id, ?kind, "scope exited");
    res
}

fn incompatible(from: Capability, to: Capability) -> Error
{
    Error::IncompatibleCapability { from, to }
}

fn mailbox(obj: &Object, link: Link) -> std::sync::Arc<Mailbox>
{
    match obj.mechanism().as_deref() {
        Some(Mechanism::Queue(mailbox)) => mailbox.clone(),
        _ => scope_violation(format!("asy object {} has no task queue", link.id)),
    }
}

impl Ref
{
    /// Open this owning reference for the duration of `body`, which sees a
    /// `mut` or `box` alias. On `iso` and `asy` a `box` request yields
    /// `box(0)`.
    ///
    /// `syn` goes through [`Ref::locked`]. `asy` waits until
    /// its queue is idle and keeps the worker parked until `body` returns.
    pub fn relax<R>(&mut self, relax_as: Capability, body: impl FnOnce(&Scope) -> R) -> Result<R>
    {
        let obj = self.enter("relax");
        match self.capability() {
            Capability::Iso => {
                let produced = Capability::Iso
                    .relax_target(relax_as, false)
                    .ok_or_else(|| incompatible(Capability::Iso, relax_as))?;
                Ok(run_scope(self.link(), produced, FrameKind::Relax, None, body))
            }
            Capability::Syn => self.locked(relax_as, body),
            Capability::Asy => {
                let produced = Capability::Asy
                    .relax_target(relax_as, false)
                    .ok_or_else(|| incompatible(Capability::Asy, relax_as))?;
                if actor::current_actor() == Some(self.id()) {
                    fatal(Error::LockReentrancyViolation(self.id()));
                }
                let Some(_turn) = mailbox(obj, self.link()).exclusive() else {
                    scope_violation(format!("task queue of {} already closed", self.id()));
                };
                let _pin = Pin::new(obj, self.link(), Capability::Asy);
                Ok(run_scope(self.link(), produced, FrameKind::Relax, None, body))
            }
            other => Err(incompatible(other, relax_as)),
        }
    }

    /// Hold the lock of this `syn` object for the duration of `body`.
    ///
    /// A `mut` request takes the writer lock. A `box` request takes the
    /// reader lock and yields `box(1)` when the object was consumed under
    /// [`crate::LockDiscipline::ReaderWriter`]. Under
    /// [`crate::LockDiscipline::Recursive`] there is only the one exclusive
    /// lock, and `box` yields `box(0)`.
    pub fn locked<R>(&self, relax_as: Capability, body: impl FnOnce(&Scope) -> R) -> Result<R>
    {
        self.synchronized(relax_as, None, body)
    }

    /// Hold the writer lock for the duration of `body`. A `box` request
    /// yields `box(0)`.
    pub fn wlocked<R>(&self, relax_as: Capability, body: impl FnOnce(&Scope) -> R) -> Result<R>
    {
        self.synchronized(relax_as, Some(Mode::Exclusive), body)
    }

    /// Hold the reader lock of this `syn` object for the duration of
    /// `body`. Only `box` may be requested. The alias is `box(1)`, or
    /// `box(0)` for a [`crate::LockDiscipline::Recursive`] lock, which
    /// cannot tell readers from writers.
    pub fn rlocked<R>(&self, relax_as: Capability, body: impl FnOnce(&Scope) -> R) -> Result<R>
    {
        if relax_as.box_tag().is_none() {
            return Err(incompatible(Capability::Syn, relax_as));
        }
        self.synchronized(relax_as, Some(Mode::Shared), body)
    }

    fn synchronized<R>(&self, relax_as: Capability, mode: Option<Mode>, body: impl FnOnce(&Scope) -> R) -> Result<R>
    {
        let obj = self.enter("lock");
        if self.capability() != Capability::Syn {
            return Err(incompatible(self.capability(), Capability::Syn));
        }
        let Some(mechanism) = obj.mechanism() else {
            scope_violation(format!("syn object {} has no lock", self.id()));
        };
        let Mechanism::Lock(lock) = &*mechanism else {
            scope_violation(format!("syn object {} has no lock", self.id()));
        };
        let mode = mode.unwrap_or_else(|| lock.mode_for(relax_as));
        let produced = Capability::Syn
            .relax_target(relax_as, lock.is_reader(mode))
            .ok_or_else(|| incompatible(Capability::Syn, relax_as))?;

        let _lock = sync::acquire(mechanism.clone(), self.link(), mode);
        let _pin = Pin::new(obj, self.link(), Capability::Syn);
        Ok(run_scope(self.link(), produced, FrameKind::Locked, None, body))
    }

    /// Open the `iso` field `field` of this open object for the duration of
    /// `body`.
    ///
    /// Through a `mut` root the field may be relaxed as `mut` or `box(0)`.
    /// Through an `imm` or `box` root only `box` is allowed, and the alias
    /// inherits the root's tag (`imm` counts as `box(1)`).
    pub fn relax_field<R>(&self, field: &str, relax_as: Capability, body: impl FnOnce(&Scope) -> R) -> Result<R>
    {
        let Some((link, stored)) = self.peek(field)? else {
            return Err(Error::FieldKind {
                field: field.to_owned(),
                expected: "a non-empty reference",
            });
        };
        if stored != Capability::Iso {
            return Err(incompatible(stored, relax_as));
        }
        let produced = match self.capability().access() {
            Access::ReadWrite => Capability::Iso.relax_target(relax_as, false),
            Access::Read => match relax_as {
                Capability::Box(_) => self
                    .capability()
                    .box_tag_on_alias(None)
                    .map(Capability::Box),
                _ => None,
            },
            Access::Opaque => None,
        }
        .ok_or_else(|| incompatible(stored, relax_as))?;

        Ok(run_scope(link, produced, FrameKind::Relax, None, body))
    }

    /// Queue `body` on this `asy` object's actor. The task sees a `mut` or
    /// `box(0)` alias and runs after every task queued before it.
    pub fn schedule<F>(&self, relax_as: Capability, body: F) -> Result<TaskHandle>
    where
        F: FnOnce(&Scope) + Send + 'static,
    {
        let (obj, produced) = self.schedule_target(relax_as)?;
        Ok(self.post(obj, produced, None, body))
    }

    /// Like [`Ref::schedule`], additionally consuming `arg` into `iso` on
    /// the calling thread. The task receives it through
    /// [`Scope::take_arg`].
    pub fn schedule_consuming<F>(&self, relax_as: Capability, arg: Ref, body: F) -> std::result::Result<TaskHandle, Refused>
    where
        F: FnOnce(&Scope) + Send + 'static,
    {
        let (obj, produced) = match self.schedule_target(relax_as) {
            Ok(it) => it,
            Err(error) => {
                return Err(Refused {
                    error,
                    reference: arg,
                })
            }
        };
        let arg = arg.consume(Capability::Iso)?;
        Ok(self.post(obj, produced, Some(arg.into_parts()), body))
    }

    fn schedule_target(&self, relax_as: Capability) -> Result<(&'static Object, Capability)>
    {
        let obj = self.enter("schedule");
        if self.capability() != Capability::Asy {
            return Err(incompatible(self.capability(), Capability::Asy));
        }
        let produced = Capability::Asy
            .relax_target(relax_as, false)
            .ok_or_else(|| incompatible(Capability::Asy, relax_as))?;
        Ok((obj, produced))
    }

    fn post<F>(&self, obj: &Object, produced: Capability, arg: Option<(Link, Capability)>, body: F) -> TaskHandle
    where
        F: FnOnce(&Scope) + Send + 'static,
    {
        let link = self.link();
        let pin = Pin::new(obj, link, Capability::Asy);
        let task = move || {
            let _pin = pin;
            run_scope(link, produced, FrameKind::Schedule, arg, body)
        };
        match mailbox(obj, link).post(task) {
            Some(handle) => {
                tracing::trace!(object = %link.id, "task queued");
                handle
            }
            None => scope_violation(format!("task queue of {} already closed", link.id)),
        }
    }
}
