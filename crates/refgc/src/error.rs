//! Error types.

use std::fmt;

use thiserror::Error;

use crate::object::ObjectRef;

/// The heap space an allocation was routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpaceKind {
    /// Size-class pooled pages for objects up to 2KB.
    Small,
    /// Dedicated page runs for larger objects.
    Large,
}

impl fmt::Display for SpaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Small => f.write_str("small-object"),
            Self::Large => f.write_str("large-object"),
        }
    }
}

/// Errors reported by heap operations.
#[derive(Debug, Error)]
pub enum GcError {
    /// No placement satisfies the request, even after a forced collection.
    ///
    /// The heap is left consistent: once memory is released, later
    /// allocations succeed again.
    #[error("out of memory: cannot allocate {requested} bytes in the {space} space")]
    OutOfMemory {
        /// Requested object size in bytes.
        requested: usize,
        /// Space that could not satisfy the request.
        space: SpaceKind,
    },

    /// The handle names an object that has already been reclaimed.
    #[error("object handle {0} refers to a reclaimed object")]
    StaleHandle(ObjectRef),

    /// A reference field index past the object's reference slots.
    #[error("field index {index} out of bounds for object with {len} reference slots")]
    FieldOutOfBounds {
        /// Requested slot.
        index: usize,
        /// Number of reference slots.
        len: usize,
    },

    /// A byte range outside the object's data payload.
    #[error("data range {offset}..{end} out of bounds for {len} data bytes")]
    DataOutOfBounds {
        /// Start of the requested range.
        offset: usize,
        /// End of the requested range.
        end: usize,
        /// Size of the data payload.
        len: usize,
    },

    /// An array operation on an object or type that is not an array.
    #[error("type `{0}` is not an array type")]
    NotAnArray(String),

    /// A plain instance allocation requested for an array type.
    #[error("type `{0}` is an array type; allocate it with a length")]
    NotAnInstance(String),

    /// The computed object size overflows.
    #[error("object size overflows for array length {0}")]
    SizeOverflow(usize),

    /// The OS refused to reserve a heap space.
    #[error("failed to reserve heap space: {0}")]
    Reserve(#[from] std::io::Error),

    /// A finalizer worker thread could not be started.
    #[error("failed to spawn finalizer thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// A configuration value is out of range or unparsable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The heap was shut down; no further allocation is possible.
    #[error("heap has been shut down")]
    ShutDown,
}

/// Result alias for heap operations.
pub type Result<T, E = GcError> = std::result::Result<T, E>;

/// Failure reported by a user finalizer.
///
/// The finalization scheduler logs and discards these; they never stop the
/// finalizer thread.
#[derive(Debug, Error)]
pub enum FinalizeError {
    /// The finalizer gave up with a message.
    #[error("{0}")]
    Failed(String),
    /// A heap operation inside the finalizer failed.
    #[error(transparent)]
    Heap(#[from] GcError),
}

impl FinalizeError {
    /// Convenience constructor for [`FinalizeError::Failed`].
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}
