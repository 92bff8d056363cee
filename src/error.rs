//! Scene-level error types.

use thiserror::Error;

use crate::backend::traits::BackendError;
use crate::schema::NodeKind;

/// Errors surfaced by tree edits, compilation, and the allocators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SceneError {
    /// A structural edit violates the schema's parent-legality table.
    #[error("{child:?} may not be a child of {parent:?}")]
    IllegalParent { child: NodeKind, parent: NodeKind },
    /// The child already has a different parent; reparenting across
    /// parents is not supported.
    #[error("node is already attached to a different parent")]
    AlreadyAttached,
    /// A property update carried props of a different kind than the node.
    #[error("expected {expected:?} props, got {got:?}")]
    KindMismatch { expected: NodeKind, got: NodeKind },
    /// A node lacks the properties required to compile it.
    #[error("invalid properties: {0}")]
    InvalidProps(&'static str),
    /// A buffer data reference was allocated under two different usages.
    #[error("buffer data must always be allocated with the same usage")]
    UsageMismatch,
    /// An allocator entry was freed past a reference count of zero.
    #[error("double free of a pooled resource")]
    DoubleFree,
    /// A backend operation failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type SceneResult<T> = Result<T, SceneError>;
