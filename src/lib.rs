//! Runtime support for reference capabilities.
//!
//! Every reference carries one of a fixed set of capabilities: `mut`, `imm`,
//! `box`, `iso`, `syn` and `asy`. The capability decides what the reference
//! may do (read, write, alias, cross threads) and how the reference counts of
//! its object are maintained. Thread-confined references update counts with
//! plain arithmetic, shareable ones atomically.
//!
//! Objects carry two counts. Open references (`mut`, `imm`, `box`, `iso`)
//! are counted in one, owning `syn` and `asy` references in the other. An
//! owning reference is opened through a scope (`relax`, `locked`,
//! `schedule`), which hands out a `mut` or `box` alias that dies with the
//! scope.
//!
//! Changing the capability of a reference is a `consume`, which checks at
//! runtime that the reachable graph is isolated. The check is safe against a
//! racing consume from another thread over a shared `imm` graph.
//!
//! This crate is the runtime half: a front-end is expected to have ruled out
//! most misuse statically. What it cannot rule out is detected here and is
//! fatal, with the exception of a refused consume, which hands the original
//! reference back.
//!

pub(crate) mod capability;
pub(crate) mod shape;
pub(crate) mod heap;
pub(crate) mod counter;
pub(crate) mod frame;
pub(crate) mod reference;
pub(crate) mod sync;
pub(crate) mod actor;
pub(crate) mod scope;
pub(crate) mod consume;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod stats;

#[cfg(test)]
mod tests;

pub use actor::{wait, Future, TaskHandle};
pub use capability::{Access, Aliasing, BoxTag, Capability};
pub use config::{config, configure, Config, LockDiscipline};
pub use counter::Discipline;
pub use error::{Error, Refused, RefusedPair, Result};
pub use heap::{stats, ObjectId};
pub use reference::{Init, Ref, Weak};
pub use scope::Scope;
pub use shape::{FieldDecl, FieldKind, Shape, ShapeBuilder, Value};
pub use stats::Stats;
