//! Error kinds of the capability runtime.
//!
//! Only [`Error::NotIsolated`] is meant for ordinary control flow. The
//! scope and reentrancy violations mean a static invariant was broken
//! before the runtime saw it; they are raised through [`fatal`] and never
//! returned.

use std::fmt;

use thiserror::Error;

use crate::{capability::Capability, heap::ObjectId, reference::Ref};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error
{
    /// The reachable graph could not be shown isolated under the target
    /// capability's invariant.
    #[error("reference is not isolated")]
    NotIsolated,

    #[error("capability scope violation: {0}")]
    CapabilityScopeViolation(String),

    #[error("lock reentrancy violation on object {0}")]
    LockReentrancyViolation(ObjectId),

    #[error("a {from} reference cannot be used as {to}")]
    IncompatibleCapability
    {
        from: Capability,
        to: Capability,
    },

    #[error("a {capability} reference does not permit {operation}")]
    AccessDenied
    {
        capability: Capability,
        operation: &'static str,
    },

    #[error("{shape} has no field named {field}")]
    UnknownField
    {
        shape: String,
        field: String,
    },

    #[error("field {field} does not hold {expected}")]
    FieldKind
    {
        field: String,
        expected: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A refused `consume`. Carries the original reference back to the caller,
/// still valid and unchanged.
#[derive(Error)]
#[error("{error}")]
pub struct Refused
{
    pub error: Error,
    pub reference: Ref,
}

impl Refused
{
    pub fn into_inner(self) -> Ref { self.reference }
}

impl fmt::Debug for Refused
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Refused")
            .field("error", &self.error)
            .field("reference", &self.reference)
            .finish()
    }
}

/// A refused [`crate::Future::consuming`]. Both references come back as
/// they were passed in.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RefusedPair
{
    pub error: Error,
    pub target: Ref,
    pub arg: Ref,
}

/// Abort on a violated capability invariant.
#[track_caller]
pub(crate) fn fatal(error: Error) -> !
{
    tracing::error!(%error, "fatal capability condition");
    panic!("{}", error)
}

pub(crate) fn scope_violation(message: impl Into<String>) -> !
{
    fatal(Error::CapabilityScopeViolation(message.into()))
}
