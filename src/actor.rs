//! # Actor queues of `asy` objects
//!
//! An object consumed into `asy` gets a FIFO mailbox and a dedicated worker
//! thread that drains it. Tasks for one object run strictly in submission
//! order; nothing is promised across objects.
//!
//! A [`Future`] wraps an `asy` reference together with its most recently
//! scheduled task. Any direct use of the object through the future waits
//! for that task first.

use std::{
    any::Any,
    cell::Cell,
    collections::VecDeque,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
};

use parking_lot::{Condvar, Mutex};

use crate::{
    capability::Capability,
    config::Config,
    error::{fatal, Error, Refused, RefusedPair, Result},
    heap::ObjectId,
    reference::Ref,
    scope::Scope,
};

type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static ACTOR : Cell<Option<ObjectId>> = const { Cell::new(None) };
}

/// The actor whose worker is the calling thread, if any.
pub(crate) fn current_actor() -> Option<ObjectId> { ACTOR.with(Cell::get) }

pub(crate) struct Mailbox
{
    owner: ObjectId,
    state: Mutex<MailboxState>,
    ready: Condvar,
}

#[derive(Default)]
struct MailboxState
{
    jobs: VecDeque<Job>,
    closed: bool,
}

impl Mailbox
{
    /// Create the mailbox of `owner` and start its worker.
    pub(crate) fn spawn(owner: ObjectId, config: &Config) -> Arc<Mailbox>
    {
        let mailbox = Arc::new(Mailbox {
            owner,
            state: Mutex::new(MailboxState::default()),
            ready: Condvar::new(),
        });

        let mut builder = thread::Builder::new().name(format!("{}-{}", config.worker_name, owner));
        if let Some(size) = config.worker_stack_size {
            builder = builder.stack_size(size);
        }
        let worker = mailbox.clone();
        if let Err(err) = builder.spawn(move || worker.run()) {
            panic!("failed to start worker of actor {}: {}", owner, err)
        }
        tracing::debug!(actor = %owner, "actor worker started");
        mailbox
    }

    fn run(self: Arc<Self>)
    {
        ACTOR.with(|a| a.set(Some(self.owner)));
        loop {
            let job = {
                let mut state = self.state.lock();
                loop {
                    if let Some(job) = state.jobs.pop_front() {
                        break Some(job);
                    }
                    if state.closed {
                        break None;
                    }
                    self.ready.wait(&mut state);
                }
            };
            match job {
                Some(job) => job(),
                None => break,
            }
        }
        tracing::debug!(actor = %self.owner, "actor worker stopped");
    }

    /// Stop accepting tasks. The worker drains what is queued and exits.
    pub(crate) fn close(&self)
    {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    fn push(&self, job: Job) -> bool
    {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.jobs.push_back(job);
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Enqueue a task. A panic inside it is caught on the worker and
    /// re-raised in whoever waits on the returned handle.
    pub(crate) fn post(&self, task: impl FnOnce() + Send + 'static) -> Option<TaskHandle>
    {
        let completion = Arc::new(Completion {
            actor: self.owner,
            status: Mutex::new(Status::Pending),
            done: Condvar::new(),
        });
        let finished = completion.clone();
        let actor = self.owner;
        let job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(task));
            if let Err(payload) = &outcome {
                tracing::error!(%actor, panic = panic_message(&**payload), "scheduled task panicked");
            }
            finished.finish(outcome.err());
        });
        if self.push(job) {
            Some(TaskHandle(completion))
        } else {
            None
        }
    }

    /// Wait until the worker reaches a barrier task, then hold it there
    /// until the returned turn is dropped. The caller has the object to
    /// itself in between.
    pub(crate) fn exclusive(&self) -> Option<Turn>
    {
        let granted = Arc::new(Signal::default());
        let released = Arc::new(Signal::default());
        let (g, r) = (granted.clone(), released.clone());
        self.push(Box::new(move || {
            g.raise();
            r.wait();
        }))
        .then(|| {
            granted.wait();
            Turn(released)
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str
{
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[derive(Default)]
struct Signal
{
    raised: Mutex<bool>,
    cv: Condvar,
}

impl Signal
{
    fn raise(&self)
    {
        *self.raised.lock() = true;
        self.cv.notify_all();
    }

    fn wait(&self)
    {
        let mut raised = self.raised.lock();
        while !*raised {
            self.cv.wait(&mut raised);
        }
    }
}

/// Exclusive turn on an actor, see [`Mailbox::exclusive`].
#[must_use]
pub(crate) struct Turn(Arc<Signal>);

impl Drop for Turn
{
    fn drop(&mut self) { self.0.raise() }
}

enum Status
{
    Pending,
    Done,
    Panicked(Box<dyn Any + Send>),
}

struct Completion
{
    actor: ObjectId,
    status: Mutex<Status>,
    done: Condvar,
}

impl Completion
{
    fn finish(&self, panicked: Option<Box<dyn Any + Send>>)
    {
        *self.status.lock() = match panicked {
            Some(payload) => Status::Panicked(payload),
            None => Status::Done,
        };
        self.done.notify_all();
    }
}

/// Handle of one scheduled task.
#[derive(Clone)]
pub struct TaskHandle(Arc<Completion>);

impl fmt::Debug for TaskHandle
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("TaskHandle")
            .field("actor", &self.0.actor)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl TaskHandle
{
    pub fn is_finished(&self) -> bool { !matches!(*self.0.status.lock(), Status::Pending) }

    /// Block until the task has run. If it panicked, the panic continues in
    /// the first thread to wait on it.
    pub fn wait(&self)
    {
        if current_actor() == Some(self.0.actor) {
            fatal(Error::LockReentrancyViolation(self.0.actor));
        }
        let mut status = self.0.status.lock();
        while matches!(*status, Status::Pending) {
            self.0.done.wait(&mut status);
        }
        if matches!(*status, Status::Panicked(_)) {
            if let Status::Panicked(payload) = std::mem::replace(&mut *status, Status::Done) {
                drop(status);
                panic::resume_unwind(payload);
            }
        }
    }
}

/// An `asy` reference together with its pending task.
pub struct Future
{
    target: Ref,
    pending: Option<TaskHandle>,
    arg: Option<Ref>,
}

impl Future
{
    pub fn new(target: Ref) -> Result<Future>
    {
        target.enter("future");
        if target.capability() != Capability::Asy {
            return Err(Error::IncompatibleCapability {
                from: target.capability(),
                to: Capability::Asy,
            });
        }
        Ok(Future {
            target,
            pending: None,
            arg: None,
        })
    }

    /// Like [`Future::new`], additionally consuming `arg` into `iso` right
    /// away. The next task scheduled through the future receives it via
    /// [`Scope::take_arg`].
    ///
    /// On failure both references are handed back unchanged.
    pub fn consuming(target: Ref, arg: Ref) -> std::result::Result<Future, RefusedPair>
    {
        target.enter("future");
        if target.capability() != Capability::Asy {
            let error = Error::IncompatibleCapability {
                from: target.capability(),
                to: Capability::Asy,
            };
            return Err(RefusedPair { error, target, arg });
        }
        match arg.consume(Capability::Iso) {
            Ok(arg) => Ok(Future {
                target,
                pending: None,
                arg: Some(arg),
            }),
            Err(Refused { error, reference }) => Err(RefusedPair {
                error,
                target,
                arg: reference,
            }),
        }
    }

    /// Schedule a task on the wrapped object, which becomes the pending
    /// task of this future. A refused task leaves a stashed argument in
    /// place for the next one.
    pub fn schedule<F>(&mut self, relax_as: Capability, body: F) -> Result<()>
    where
        F: FnOnce(&Scope) + Send + 'static,
    {
        let handle = match self.arg.take() {
            Some(arg) => match self.target.schedule_consuming(relax_as, arg, body) {
                Ok(handle) => handle,
                Err(Refused { error, reference }) => {
                    self.arg = Some(reference);
                    return Err(error);
                }
            },
            None => self.target.schedule(relax_as, body)?,
        };
        self.pending = Some(handle);
        Ok(())
    }

    pub fn is_pending(&self) -> bool { self.pending.as_ref().is_some_and(|h| !h.is_finished()) }

    /// Block until the pending task, if any, has run.
    pub fn wait(&mut self)
    {
        if let Some(handle) = self.pending.take() {
            handle.wait();
        }
    }

    /// Direct access to the wrapped reference. Waits for the pending task.
    pub fn target(&mut self) -> &Ref
    {
        self.wait();
        &self.target
    }

    /// Relax the wrapped reference after waiting for the pending task.
    pub fn relax<R>(&mut self, relax_as: Capability, body: impl FnOnce(&Scope) -> R) -> Result<R>
    {
        self.wait();
        self.target.relax(relax_as, body)
    }

    /// Consume the wrapped reference after waiting for the pending task.
    pub fn consume(mut self, capability: Capability) -> std::result::Result<Ref, Refused>
    {
        self.wait();
        self.target.consume(capability)
    }

    pub fn into_inner(mut self) -> Ref
    {
        self.wait();
        self.target
    }
}

/// Block until the pending task of `future` has run.
pub fn wait(future: &mut Future) { future.wait() }
