//! # The managed heap
//!
//! Object headers live in leaked slabs that are never returned to the
//! allocator, so a header reference is `&'static` and stays dereferencable
//! after the object it describes has been freed. Liveness is decided by a
//! per-slot generation counter instead: every handle remembers the
//! generation it was issued under, and freeing a slot bumps it.
//!
//! Freed slots go to a free list and are handed out again until their
//! generation counter runs out, at which point they are retired.

use std::{
    fmt, mem,
    num::NonZeroU32,
    sync::{
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};

use crate::{
    actor::Mailbox,
    capability::BoxTag,
    shape::{Shape, Value},
    stats::Stats,
    sync::SynLock,
};

pub(crate) const SLAB_SIZE: usize = 256;

const GENERATION_INIT: u32 = 1;
const GENERATION_RETIRED: u32 = u32::MAX - 1;

/// Index of an object slot in the managed heap, starting at one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ObjectId(NonZeroU32);

impl ObjectId
{
    fn from_index(index: usize) -> Self
    {
        match u32::try_from(index + 1).ok().and_then(NonZeroU32::new) {
            Some(raw) if raw.get() < LinkCode::END => ObjectId(raw),
            _ => panic!("managed heap exhausted"),
        }
    }

    fn index(self) -> usize { self.0.get() as usize - 1 }

    pub(crate) fn raw(self) -> u32 { self.0.get() }

    pub(crate) fn from_raw(raw: u32) -> Option<Self> { NonZeroU32::new(raw).map(ObjectId) }
}

impl fmt::Display for ObjectId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "#{}", self.0) }
}

/// A slot paired with the generation it was allocated under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Link
{
    pub(crate) id: ObjectId,
    pub(crate) generation: u32,
}

impl Link
{
    pub(crate) fn object(self) -> Option<&'static Object>
    {
        let obj = object(self.id);
        if obj.generation() == self.generation {
            Some(obj)
        } else {
            None
        }
    }
}

/// Contents of one field slot.
#[derive(Debug, Clone, Default)]
pub(crate) enum Slot
{
    #[default]
    Empty,
    Data(Value),
    Ref
    {
        link: Link,
        tag: BoxTag,
    },
}

#[derive(Debug, Default)]
pub(crate) struct Body
{
    pub(crate) shape: Option<Arc<Shape>>,
    pub(crate) slots: Vec<Slot>,
}

/// Synchronisation attached to an object once it is consumed into `syn` or
/// `asy`.
pub(crate) enum Mechanism
{
    Lock(SynLock),
    Queue(Arc<Mailbox>),
}

impl Mechanism
{
    /// Detach from the object. A queue stops taking tasks and its worker
    /// exits once drained; a lock simply goes away with the last guard.
    pub(crate) fn retire(&self)
    {
        if let Mechanism::Queue(mailbox) = self {
            mailbox.close();
        }
    }
}

/// Link half of the traversal word.
///
/// The low 32 bits of `Object::trace` hold one of these, the high 32 bits
/// the id of the thread that collected the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkCode
{
    Uncollected,
    End,
    Next(ObjectId),
}

impl LinkCode
{
    const END: u32 = u32::MAX;

    pub(crate) fn encode(self) -> u32
    {
        match self {
            LinkCode::Uncollected => 0,
            LinkCode::End => Self::END,
            LinkCode::Next(id) => id.raw(),
        }
    }

    pub(crate) fn decode(raw: u32) -> Self
    {
        match raw {
            Self::END => LinkCode::End,
            raw => ObjectId::from_raw(raw).map_or(LinkCode::Uncollected, LinkCode::Next),
        }
    }
}

pub(crate) fn trace_word(claim: u32, link: LinkCode) -> u64
{
    (claim as u64) << 32 | link.encode() as u64
}

pub(crate) fn trace_parts(word: u64) -> (u32, LinkCode)
{
    ((word >> 32) as u32, LinkCode::decode(word as u32))
}

/// Header and fields of one managed object.
pub(crate) struct Object
{
    generation: AtomicU32,
    /// Open count, with the reserved bit packed into the top bit.
    pub(crate) open: AtomicUsize,
    pub(crate) owning: AtomicUsize,
    /// Thread claim and collection link, see [`LinkCode`].
    pub(crate) trace: AtomicU64,
    pub(crate) body: RwLock<Body>,
    pub(crate) mechanism: Mutex<Option<Arc<Mechanism>>>,
}

impl Object
{
    fn new() -> Self
    {
        Self {
            generation: AtomicU32::new(GENERATION_INIT),
            open: AtomicUsize::new(0),
            owning: AtomicUsize::new(0),
            trace: AtomicU64::new(0),
            body: RwLock::new(Body::default()),
            mechanism: Mutex::new(None),
        }
    }

    pub(crate) fn generation(&self) -> u32 { self.generation.load(Ordering::Acquire) }

    pub(crate) fn mechanism(&self) -> Option<Arc<Mechanism>> { self.mechanism.lock().clone() }

    pub(crate) fn shape(&self) -> Option<Arc<Shape>> { self.body.read().shape.clone() }
}

struct Heap
{
    slabs: RwLock<Vec<&'static [Object]>>,
    free: Mutex<Vec<ObjectId>>,
    fresh: Mutex<usize>,
    live: AtomicUsize,
    retired: AtomicUsize,
}

lazy_static! {
    static ref HEAP: Heap = Heap {
        slabs: RwLock::new(Vec::new()),
        free: Mutex::new(Vec::with_capacity(SLAB_SIZE)),
        fresh: Mutex::new(0),
        live: AtomicUsize::new(0),
        retired: AtomicUsize::new(0),
    };
}

impl Heap
{
    fn recycle(&self) -> Option<ObjectId> { self.free.lock().pop() }

    fn fresh(&self) -> ObjectId
    {
        let mut next = self.fresh.lock();
        let index = *next;
        if index / SLAB_SIZE >= self.slabs.read().len() {
            let slab: Vec<Object> = (0..SLAB_SIZE).map(|_| Object::new()).collect();
            self.slabs.write().push(slab.leak());
        }
        *next += 1;
        ObjectId::from_index(index)
    }

    fn object(&self, id: ObjectId) -> &'static Object
    {
        let index = id.index();
        let slab: &'static [Object] = self.slabs.read()[index / SLAB_SIZE];
        &slab[index % SLAB_SIZE]
    }
}

pub(crate) fn object(id: ObjectId) -> &'static Object { HEAP.object(id) }

/// Claim a slot and initialise its header: `open_count = 1`,
/// `owning_count = 0`, uncollected and unclaimed.
pub(crate) fn allocate(shape: Arc<Shape>, slots: Vec<Slot>) -> Link
{
    let id = HEAP.recycle().unwrap_or_else(|| HEAP.fresh());
    let obj = HEAP.object(id);
    *obj.body.write() = Body {
        shape: Some(shape),
        slots,
    };
    obj.owning.store(0, Ordering::Relaxed);
    obj.trace.store(0, Ordering::Relaxed);
    obj.open.store(1, Ordering::Release);
    HEAP.live.fetch_add(1, Ordering::Relaxed);
    let link = Link {
        id,
        generation: obj.generation(),
    };
    tracing::trace!(object = %id, generation = link.generation, "allocated");
    link
}

/// Invalidate the slot behind `link` and hand back what it held.
///
/// Returns `None` if the slot was already freed under that generation, so
/// a racing second free is harmless.
pub(crate) fn free(link: Link) -> Option<(Body, Option<Arc<Mechanism>>)>
{
    let obj = HEAP.object(link.id);
    let next = link.generation.wrapping_add(1);
    obj.generation
        .compare_exchange(link.generation, next, Ordering::AcqRel, Ordering::Acquire)
        .ok()?;

    let body = mem::take(&mut *obj.body.write());
    let mechanism = obj.mechanism.lock().take();
    obj.open.store(0, Ordering::Relaxed);
    obj.owning.store(0, Ordering::Relaxed);
    obj.trace.store(0, Ordering::Release);
    HEAP.live.fetch_sub(1, Ordering::Relaxed);

    if next < GENERATION_RETIRED {
        HEAP.free.lock().push(link.id);
    } else {
        HEAP.retired.fetch_add(1, Ordering::Relaxed);
    }
    tracing::trace!(object = %link.id, generation = link.generation, "freed");
    Some((body, mechanism))
}

pub fn stats() -> Stats
{
    let slabs = HEAP.slabs.read().len();
    Stats {
        slabs,
        capacity: slabs * SLAB_SIZE,
        live_objects: HEAP.live.load(Ordering::Relaxed),
        free_slots: HEAP.free.lock().len(),
        retired_slots: HEAP.retired.load(Ordering::Relaxed),
    }
}
