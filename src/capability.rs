//! # The capability lattice
//!
//! Pure lookup tables over the closed set of reference capabilities. Nothing
//! here touches an object; the refcount engine, the scopes and the consume
//! verifier all consult these tables to decide what a reference may do.

use std::fmt;

/// Provenance tag of a `box` reference.
///
/// `Zero` means a `mut` alias may exist somewhere, so the referent is only
/// ever touched by one thread and counts are updated with plain arithmetic.
/// `One` means the referent is provably immutable and may be shared, so
/// counts are updated atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BoxTag
{
    Zero,
    One,
}

impl BoxTag
{
    /// The stricter of two tags. Once a view is known immutable it stays so.
    pub fn join(self, other: BoxTag) -> BoxTag { self.max(other) }

    pub fn bit(self) -> u8
    {
        match self {
            BoxTag::Zero => 0,
            BoxTag::One => 1,
        }
    }
}

/// Static tag carried by every reference value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability
{
    /// Thread-local, readable and writable, locally aliasable.
    Mut,
    /// Immutable, readable, globally aliasable.
    Imm,
    /// Either `mut` or `imm`, unknown which. Read-only.
    Box(BoxTag),
    /// Owning reference guarded by a lock.
    Syn,
    /// Owning reference served by a task queue.
    Asy,
    /// The only owning reference to an isolated subgraph.
    Iso,
}

/// Dereference rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access
{
    ReadWrite,
    Read,
    Opaque,
}

/// Aliasing rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aliasing
{
    Global,
    Local,
    Unique,
}

/// Which of the two counts of an object a reference contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Count
{
    Open,
    Owning,
}

impl Capability
{
    pub const BOX0: Capability = Capability::Box(BoxTag::Zero);
    pub const BOX1: Capability = Capability::Box(BoxTag::One);

    pub const ALL: [Capability; 7] = [
        Capability::Mut,
        Capability::Imm,
        Capability::BOX0,
        Capability::BOX1,
        Capability::Syn,
        Capability::Asy,
        Capability::Iso,
    ];

    pub fn access(self) -> Access
    {
        match self {
            Capability::Mut => Access::ReadWrite,
            Capability::Imm | Capability::Box(_) => Access::Read,
            Capability::Syn | Capability::Asy | Capability::Iso => Access::Opaque,
        }
    }

    pub fn aliasing(self) -> Aliasing
    {
        match self {
            Capability::Imm | Capability::Syn | Capability::Asy => Aliasing::Global,
            Capability::Mut | Capability::Box(_) => Aliasing::Local,
            Capability::Iso => Aliasing::Unique,
        }
    }

    /// Whether a reference of this capability may be used from a thread
    /// other than the one that created it.
    pub fn is_sendable(self) -> bool
    {
        match self {
            Capability::Imm | Capability::Syn | Capability::Asy | Capability::Iso => true,
            Capability::Mut | Capability::Box(_) => false,
        }
    }

    /// Whether count updates through this capability need atomic
    /// instructions.
    pub fn is_atomic(self) -> bool
    {
        match self {
            Capability::Imm | Capability::Box(BoxTag::One) | Capability::Syn | Capability::Asy => {
                true
            }
            Capability::Mut | Capability::Box(BoxTag::Zero) | Capability::Iso => false,
        }
    }

    /// Open references (`mut`, `imm`, `box`) may be dereferenced directly.
    pub fn is_open(self) -> bool { !self.is_owning() }

    /// Owning references (`iso`, `syn`, `asy`) govern the isolation of a
    /// subgraph and must be relaxed before use.
    pub fn is_owning(self) -> bool
    {
        matches!(self, Capability::Iso | Capability::Syn | Capability::Asy)
    }

    pub fn box_tag(self) -> Option<BoxTag>
    {
        match self {
            Capability::Box(tag) => Some(tag),
            _ => None,
        }
    }

    pub(crate) fn count(self) -> Count
    {
        match self {
            Capability::Syn | Capability::Asy => Count::Owning,
            _ => Count::Open,
        }
    }

    /// Whether a reference of capability `self` may be aliased as `target`.
    ///
    /// A `box` target is only compatible with the tag that
    /// [`Capability::box_tag_on_alias`] would assign.
    pub fn alias_compatible(self, target: Capability) -> bool
    {
        match (self, target) {
            (Capability::Mut, Capability::Mut) => true,
            (Capability::Imm, Capability::Imm) => true,
            (Capability::Syn, Capability::Syn) => true,
            (Capability::Asy, Capability::Asy) => true,
            (_, Capability::Box(tag)) => self.box_tag_on_alias(None) == Some(tag),
            _ => false,
        }
    }

    /// Tag given to a `box` alias created from a reference of capability
    /// `self`. `field_tag` is the tag stored with the aliased value when it
    /// is read out of a `box` field.
    ///
    /// Returns `None` for owning capabilities, which cannot be aliased as
    /// `box` at all.
    pub fn box_tag_on_alias(self, field_tag: Option<BoxTag>) -> Option<BoxTag>
    {
        match self {
            Capability::Mut => Some(BoxTag::Zero),
            Capability::Imm => Some(BoxTag::One),
            Capability::Box(BoxTag::Zero) => Some(field_tag.unwrap_or(BoxTag::Zero)),
            Capability::Box(BoxTag::One) => Some(BoxTag::One),
            Capability::Syn | Capability::Asy | Capability::Iso => None,
        }
    }

    /// Apparent capability of a field with stored capability `field` when
    /// viewed through a root reference of capability `self`.
    ///
    /// For `box` fields `field` carries the tag stored with the value.
    pub fn field_capability(self, field: Capability) -> Capability
    {
        match field {
            Capability::Imm | Capability::Syn | Capability::Asy | Capability::Iso => field,
            Capability::Mut => match self {
                Capability::Imm => Capability::Imm,
                Capability::Box(tag) => Capability::Box(tag),
                _ => Capability::Mut,
            },
            Capability::Box(tag) => match self {
                Capability::Imm => Capability::Imm,
                Capability::Box(_) => Capability::Box(
                    self.box_tag_on_alias(Some(tag)).unwrap_or(BoxTag::One),
                ),
                _ => Capability::Box(tag),
            },
        }
    }

    /// Tag stored in a `box` field when a reference of capability `self` is
    /// written into it.
    pub(crate) fn stored_tag(self) -> Option<BoxTag> { self.box_tag_on_alias(None) }

    /// Capability of the open alias a relax-style scope hands out.
    ///
    /// `requested` must be `mut` or `box`; the tag of a `box` request is
    /// decided by the scope (`shared` is true for a reader lock).
    pub(crate) fn relax_target(self, requested: Capability, shared: bool) -> Option<Capability>
    {
        if !self.is_owning() {
            return None;
        }
        match (requested, shared) {
            (Capability::Mut, false) => Some(Capability::Mut),
            (Capability::Box(_), false) => Some(Capability::BOX0),
            (Capability::Box(_), true) => Some(Capability::BOX1),
            _ => None,
        }
    }
}

impl fmt::Display for Capability
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Capability::Mut => write!(f, "mut"),
            Capability::Imm => write!(f, "imm"),
            Capability::Box(tag) => write!(f, "box({})", tag.bit()),
            Capability::Syn => write!(f, "syn"),
            Capability::Asy => write!(f, "asy"),
            Capability::Iso => write!(f, "iso"),
        }
    }
}
