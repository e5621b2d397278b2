//! # Capability-tagged references
//!
//! A [`Ref`] pairs a capability with a generation-checked slot in the
//! managed heap. Creating one is an INCREF, dropping one is a DECREF, and
//! both go through the refcount engine under the reference's own
//! capability. Storing a `Ref` into a field moves its count into the field.
//!
//! A [`Weak`] is an uncounted probe used for diagnostics.

use std::{fmt, mem, sync::Arc};

use crate::{
    capability::{Access, BoxTag, Capability},
    counter,
    error::{scope_violation, Error, Result},
    frame::{self, thread_id, Hold},
    heap::{self, Link, Object, ObjectId, Slot},
    shape::{FieldKind, Shape, Value},
};

/// Capability-tagged reference to a managed object.
pub struct Ref
{
    capability: Capability,
    link: Link,
    home: u32,
    hold: Hold,
}

/// Initial content of a field passed to [`Ref::alloc_with`].
#[derive(Debug)]
pub enum Init
{
    Data(Value),
    Ref(Ref),
}

impl From<Value> for Init
{
    fn from(it: Value) -> Self { Init::Data(it) }
}

impl From<Ref> for Init
{
    fn from(it: Ref) -> Self { Init::Ref(it) }
}

impl From<i64> for Init
{
    fn from(it: i64) -> Self { Init::Data(Value::Int(it)) }
}

/// Tag stored in a field of declared capability `declared` when a reference
/// of capability `value` is written into it, or `None` if the write is not
/// permitted.
fn stored_tag(declared: Capability, value: Capability) -> Option<BoxTag>
{
    match declared {
        Capability::Box(_) => value.stored_tag(),
        declared if declared == value => Some(BoxTag::Zero),
        _ => None,
    }
}

fn stored_capability(declared: Capability, tag: BoxTag) -> Capability
{
    match declared {
        Capability::Box(_) => Capability::Box(tag),
        other => other,
    }
}

fn declared_ref(shape: &Shape, index: usize, field: &str) -> Result<Capability>
{
    match shape.kind(index) {
        FieldKind::Ref(declared) => Ok(declared),
        FieldKind::Data => Err(Error::FieldKind {
            field: field.to_owned(),
            expected: "a reference",
        }),
    }
}

impl Ref
{
    /// Wrap a count already taken on `link`, registering it with the
    /// innermost scope of the calling thread.
    pub(crate) fn adopt(link: Link, capability: Capability) -> Ref
    {
        Ref {
            capability,
            link,
            home: thread_id(),
            hold: Hold::new(link, capability),
        }
    }

    /// Allocate a new object with every data field `Nil` and every
    /// reference field empty. The fresh object has `open_count = 1`.
    pub fn alloc(capability: Capability, shape: &Arc<Shape>) -> Result<Ref>
    {
        Self::alloc_with(capability, shape, Vec::<(&str, Init)>::new())
    }

    /// Allocate a new `iso` or `mut` object with the given initial fields.
    ///
    /// Each initial reference must be storable in its field's declared
    /// capability; its count moves into the field.
    pub fn alloc_with<'a, I>(capability: Capability, shape: &Arc<Shape>, fields: I) -> Result<Ref>
    where
        I: IntoIterator<Item = (&'a str, Init)>,
    {
        if !matches!(capability, Capability::Iso | Capability::Mut) {
            return Err(Error::AccessDenied {
                capability,
                operation: "allocation",
            });
        }

        let mut slots: Vec<Slot> = shape
            .fields()
            .iter()
            .map(|f| match f.kind {
                FieldKind::Data => Slot::Data(Value::Nil),
                FieldKind::Ref(_) => Slot::Empty,
            })
            .collect();

        let mut moved: Vec<Ref> = Vec::new();
        for (name, init) in fields {
            let index = shape.index_of(name).ok_or_else(|| Error::UnknownField {
                shape: shape.name().to_owned(),
                field: name.to_owned(),
            })?;
            match (shape.kind(index), init) {
                (FieldKind::Data, Init::Data(value)) => slots[index] = Slot::Data(value),
                (FieldKind::Ref(declared), Init::Ref(value)) => {
                    value.enter("store");
                    let tag = stored_tag(declared, value.capability).ok_or(
                        Error::IncompatibleCapability {
                            from: value.capability,
                            to: declared,
                        },
                    )?;
                    slots[index] = Slot::Ref {
                        link: value.link,
                        tag,
                    };
                    moved.push(value);
                }
                (FieldKind::Data, Init::Ref(_)) => {
                    return Err(Error::FieldKind {
                        field: name.to_owned(),
                        expected: "data",
                    })
                }
                (FieldKind::Ref(_), Init::Data(_)) => {
                    return Err(Error::FieldKind {
                        field: name.to_owned(),
                        expected: "a reference",
                    })
                }
            }
        }

        for value in moved {
            value.into_parts();
        }
        let link = heap::allocate(shape.clone(), slots);
        Ok(Ref::adopt(link, capability))
    }

    pub fn capability(&self) -> Capability { self.capability }

    pub fn id(&self) -> ObjectId { self.link.id }

    pub fn same_object(&self, other: &Ref) -> bool { self.link == other.link }

    /// Still usable: its scope has not exited and its object is alive.
    pub fn is_valid(&self) -> bool { !self.hold.expired() && self.link.object().is_some() }

    pub fn shape(&self) -> Arc<Shape>
    {
        match self.enter("inspection").shape() {
            Some(shape) => shape,
            None => scope_violation("reference to an object without a shape"),
        }
    }

    pub fn downgrade(&self) -> Weak { Weak { link: self.link } }

    pub(crate) fn link(&self) -> Link { self.link }

    /// Check that this reference may be used here and now, and resolve it.
    pub(crate) fn enter(&self, operation: &str) -> &'static Object
    {
        frame::check_visible(self.capability, self.home, &self.hold, operation);
        match self.link.object() {
            Some(obj) => obj,
            None => scope_violation(format!(
                "{} reference to {} used for {} after its owner freed it",
                self.capability, self.link.id, operation
            )),
        }
    }

    /// Give up this handle while keeping its count, which the caller now
    /// owns.
    pub(crate) fn into_parts(mut self) -> (Link, Capability)
    {
        if !self.hold.take() {
            scope_violation(format!(
                "{} reference moved after the scope that created it exited",
                self.capability
            ));
        }
        (self.link, self.capability)
    }

    fn require(&self, access: Access, operation: &'static str) -> Result<()>
    {
        let granted = self.capability.access();
        let ok = match access {
            Access::ReadWrite => granted == Access::ReadWrite,
            Access::Read => granted != Access::Opaque,
            Access::Opaque => true,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::AccessDenied {
                capability: self.capability,
                operation,
            })
        }
    }

    fn field_index(&self, obj: &Object, field: &str) -> Result<(Arc<Shape>, usize)>
    {
        let shape = obj.shape().ok_or_else(|| Error::UnknownField {
            shape: String::from("<freed>"),
            field: field.to_owned(),
        })?;
        let index = shape.index_of(field).ok_or_else(|| Error::UnknownField {
            shape: shape.name().to_owned(),
            field: field.to_owned(),
        })?;
        Ok((shape, index))
    }

    /// Create an alias of capability `target` to the same object.
    pub fn alias(&self, target: Capability) -> Result<Ref>
    {
        let obj = self.enter("aliasing");
        if !self.capability.alias_compatible(target) {
            return Err(Error::IncompatibleCapability {
                from: self.capability,
                to: target,
            });
        }
        counter::retain(obj, target);
        Ok(Ref::adopt(self.link, target))
    }

    /// Read a data field.
    pub fn get(&self, field: &str) -> Result<Value>
    {
        let obj = self.enter("reading");
        self.require(Access::Read, "reading")?;
        let (_, index) = self.field_index(obj, field)?;
        match &obj.body.read().slots[index] {
            Slot::Data(value) => Ok(value.clone()),
            _ => Err(Error::FieldKind {
                field: field.to_owned(),
                expected: "data",
            }),
        }
    }

    /// Write a data field.
    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<()>
    {
        let obj = self.enter("writing");
        self.require(Access::ReadWrite, "writing")?;
        let (_, index) = self.field_index(obj, field)?;
        match &mut obj.body.write().slots[index] {
            Slot::Data(slot) => {
                *slot = value.into();
                Ok(())
            }
            _ => Err(Error::FieldKind {
                field: field.to_owned(),
                expected: "data",
            }),
        }
    }

    /// Alias the reference held in a field, under the capability the field
    /// has when seen through this reference. `iso` fields cannot be
    /// aliased; relax or take them instead.
    pub fn load(&self, field: &str) -> Result<Option<Ref>>
    {
        let obj = self.enter("reading");
        self.require(Access::Read, "reading")?;
        let (shape, index) = self.field_index(obj, field)?;
        let declared = declared_ref(&shape, index, field)?;

        let body = obj.body.read();
        let Slot::Ref { link, tag } = body.slots[index] else {
            return Ok(None);
        };
        let effective = self
            .capability
            .field_capability(stored_capability(declared, tag));
        if effective == Capability::Iso {
            return Err(Error::AccessDenied {
                capability: Capability::Iso,
                operation: "aliasing",
            });
        }
        let Some(target) = link.object() else {
            scope_violation(format!("field {} refers to a freed object", field));
        };
        counter::retain(target, effective);
        drop(body);
        Ok(Some(Ref::adopt(link, effective)))
    }

    /// Write a reference field, releasing whatever it held before. The
    /// stored reference's count moves into the field.
    pub fn store(&self, field: &str, value: Option<Ref>) -> Result<()>
    {
        let obj = self.enter("writing");
        self.require(Access::ReadWrite, "writing")?;
        let (shape, index) = self.field_index(obj, field)?;
        let declared = declared_ref(&shape, index, field)?;

        let slot = match value {
            None => Slot::Empty,
            Some(value) => {
                value.enter("store");
                let tag = stored_tag(declared, value.capability).ok_or(
                    Error::IncompatibleCapability {
                        from: value.capability,
                        to: declared,
                    },
                )?;
                let (link, _) = value.into_parts();
                Slot::Ref { link, tag }
            }
        };

        let old = mem::replace(&mut obj.body.write().slots[index], slot);
        if let Slot::Ref { link, tag } = old {
            let released = self
                .capability
                .field_capability(stored_capability(declared, tag));
            counter::release(link, released);
        }
        Ok(())
    }

    /// Move the reference out of a field, leaving it empty. The result has
    /// the field's stored capability; this is how an `iso` field is
    /// extracted.
    pub fn take(&self, field: &str) -> Result<Option<Ref>>
    {
        let obj = self.enter("writing");
        self.require(Access::ReadWrite, "writing")?;
        let (shape, index) = self.field_index(obj, field)?;
        let declared = declared_ref(&shape, index, field)?;

        let old = mem::take(&mut obj.body.write().slots[index]);
        match old {
            Slot::Ref { link, tag } => Ok(Some(Ref::adopt(
                link,
                stored_capability(declared, tag),
            ))),
            _ => Ok(None),
        }
    }

    /// Declared capability and current occupant of a reference field,
    /// without creating an alias.
    pub(crate) fn peek(&self, field: &str) -> Result<Option<(Link, Capability)>>
    {
        let obj = self.enter("reading");
        self.require(Access::Read, "reading")?;
        let (shape, index) = self.field_index(obj, field)?;
        let declared = declared_ref(&shape, index, field)?;
        let res = match obj.body.read().slots[index] {
            Slot::Ref { link, tag } => Some((link, stored_capability(declared, tag))),
            _ => None,
        };
        Ok(res)
    }
}

impl Drop for Ref
{
    fn drop(&mut self)
    {
        if !self.hold.take() {
            return;
        }
        if !self.capability.is_sendable() && self.home != thread_id() {
            tracing::warn!(
                object = %self.link.id,
                capability = %self.capability,
                "thread-local reference dropped off its home thread"
            );
        }
        counter::release(self.link, self.capability);
    }
}

impl fmt::Debug for Ref
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Ref")
            .field("capability", &self.capability)
            .field("id", &self.link.id)
            .field("generation", &self.link.generation)
            .field("hold", &self.hold)
            .finish()
    }
}

/// Uncounted probe of an object slot.
///
/// Compares the generation it was created under with the slot's current
/// one, so it never observes a different object that reused the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Weak
{
    link: Link,
}

impl Weak
{
    pub fn id(&self) -> ObjectId { self.link.id }

    pub fn is_live(&self) -> bool { self.link.object().is_some() }

    pub fn open_count(&self) -> Option<usize> { self.link.object().map(counter::open_count) }

    pub fn owning_count(&self) -> Option<usize> { self.link.object().map(counter::owning_count) }

    pub fn is_reserved(&self) -> Option<bool> { self.link.object().map(counter::is_reserved) }
}
