//! Object shapes: the per-field declarations the runtime needs to know about.
//!
//! The class system proper lives in a front-end. All the runtime cares about
//! is which fields hold plain data and which hold references of what
//! declared capability.

use std::{fmt, sync::Arc};

use crate::capability::{BoxTag, Capability};

/// Plain data stored in a field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Value
{
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl From<i64> for Value
{
    fn from(it: i64) -> Self { Value::Int(it) }
}

impl From<bool> for Value
{
    fn from(it: bool) -> Self { Value::Bool(it) }
}

impl From<&str> for Value
{
    fn from(it: &str) -> Self { Value::Text(it.to_owned()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind
{
    Data,
    /// Reference field. For `box` fields the declared tag is irrelevant,
    /// every stored reference carries its own.
    Ref(Capability),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDecl
{
    pub name: String,
    pub kind: FieldKind,
}

/// Field layout shared by every object of one class.
#[derive(Debug, PartialEq, Eq)]
pub struct Shape
{
    name: String,
    fields: Vec<FieldDecl>,
}

impl Shape
{
    pub fn builder(name: &str) -> ShapeBuilder
    {
        ShapeBuilder(Shape {
            name: name.to_owned(),
            fields: Vec::new(),
        })
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn fields(&self) -> &[FieldDecl] { &self.fields }

    pub fn index_of(&self, field: &str) -> Option<usize>
    {
        self.fields.iter().position(|f| f.name == field)
    }

    pub fn kind(&self, index: usize) -> FieldKind { self.fields[index].kind }
}

impl fmt::Display for Shape
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.name) }
}

#[must_use]
pub struct ShapeBuilder(Shape);

impl ShapeBuilder
{
    pub fn data(self, name: &str) -> Self { self.with(name, FieldKind::Data) }

    pub fn field(self, name: &str, capability: Capability) -> Self
    {
        let capability = match capability {
            Capability::Box(_) => Capability::Box(BoxTag::Zero),
            other => other,
        };
        self.with(name, FieldKind::Ref(capability))
    }

    pub fn boxed(self, name: &str) -> Self { self.field(name, Capability::BOX0) }

    fn with(mut self, name: &str, kind: FieldKind) -> Self
    {
        if self.0.index_of(name).is_some() {
            panic!("field {} declared twice on {}", name, self.0.name)
        }
        self.0.fields.push(FieldDecl {
            name: name.to_owned(),
            kind,
        });
        self
    }

    pub fn build(self) -> Arc<Shape> { Arc::new(self.0) }
}
