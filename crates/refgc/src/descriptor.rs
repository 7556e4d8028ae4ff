//! Type descriptors.
//!
//! A [`TypeDescriptor`] tells the allocator how large an object is, tells the
//! tracer which slots hold references, and optionally carries the finalizer
//! that runs once an instance becomes unreachable.

use std::fmt;
use std::sync::Arc;

use crate::error::{FinalizeError, GcError, Result};
use crate::mutator::Mutator;
use crate::object::ObjectRef;

/// Size of the per-object header written at the start of every block.
pub const OBJECT_HEADER_SIZE: usize = 16;

/// Size of the length word that follows the header in array objects.
pub const ARRAY_LENGTH_SIZE: usize = 8;

/// Size of one reference slot.
pub const REFERENCE_SLOT_SIZE: usize = 8;

/// Shared, immutable descriptor handle.
pub type TypeRef = Arc<TypeDescriptor>;

/// Element kind of an array type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    /// Reference elements; traced like fields.
    Reference,
    /// 1-byte boolean.
    Boolean,
    /// 1-byte integer.
    Byte,
    /// 2-byte character.
    Char,
    /// 2-byte integer.
    Short,
    /// 4-byte integer.
    Int,
    /// 4-byte float.
    Float,
    /// 8-byte integer.
    Long,
    /// 8-byte float.
    Double,
}

impl ElementKind {
    /// Bytes per element.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Boolean | Self::Byte => 1,
            Self::Char | Self::Short => 2,
            Self::Int | Self::Float => 4,
            Self::Long | Self::Double => 8,
            Self::Reference => REFERENCE_SLOT_SIZE,
        }
    }

    /// Whether elements are traced.
    #[must_use]
    pub const fn is_reference(self) -> bool {
        matches!(self, Self::Reference)
    }
}

/// Shape of a type's instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// A fixed-size instance.
    Instance {
        /// Number of reference fields.
        reference_fields: usize,
        /// Bytes of untraced payload.
        data_bytes: usize,
    },
    /// A variable-length array; the length is given at allocation.
    Array {
        /// Element kind.
        element: ElementKind,
    },
}

/// Callback invoked by the finalization scheduler.
///
/// The object is rooted for the duration of the call. Storing it into a
/// global or into a field of a reachable object resurrects it; it will be
/// finalized again at its next death.
pub trait Finalize: Send + Sync {
    /// Runs the finalizer for `object`.
    ///
    /// # Errors
    ///
    /// Errors are logged and discarded by the scheduler.
    fn finalize(&self, mutator: &Mutator, object: ObjectRef) -> Result<(), FinalizeError>;
}

impl<F> Finalize for F
where
    F: Fn(&Mutator, ObjectRef) -> Result<(), FinalizeError> + Send + Sync,
{
    fn finalize(&self, mutator: &Mutator, object: ObjectRef) -> Result<(), FinalizeError> {
        self(mutator, object)
    }
}

/// Describes the layout and finalization behavior of a managed type.
pub struct TypeDescriptor {
    name: String,
    kind: ObjectKind,
    finalizer: Option<Arc<dyn Finalize>>,
}

impl TypeDescriptor {
    /// Describes an instance type with `reference_fields` traced slots and
    /// `data_bytes` of untraced payload.
    #[must_use]
    pub fn instance(name: impl Into<String>, reference_fields: usize, data_bytes: usize) -> Self {
        Self {
            name: name.into(),
            kind: ObjectKind::Instance {
                reference_fields,
                data_bytes,
            },
            finalizer: None,
        }
    }

    /// Describes an array type of `element`.
    #[must_use]
    pub fn array(name: impl Into<String>, element: ElementKind) -> Self {
        Self {
            name: name.into(),
            kind: ObjectKind::Array { element },
            finalizer: None,
        }
    }

    /// Attaches a finalizer closure. Every instance allocated from the
    /// returned descriptor is tracked for finalization.
    #[must_use]
    pub fn with_finalizer<F>(self, finalizer: F) -> Self
    where
        F: Fn(&Mutator, ObjectRef) -> Result<(), FinalizeError> + Send + Sync + 'static,
    {
        self.with_finalize_impl(Arc::new(finalizer))
    }

    /// Attaches a finalizer given as a trait object.
    #[must_use]
    pub fn with_finalize_impl(mut self, finalizer: Arc<dyn Finalize>) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    /// Wraps the descriptor for sharing between allocations.
    #[must_use]
    pub fn into_ref(self) -> TypeRef {
        Arc::new(self)
    }

    /// Type name, used in diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn kind(&self) -> ObjectKind {
        self.kind
    }

    #[must_use]
    pub const fn is_array(&self) -> bool {
        matches!(self.kind, ObjectKind::Array { .. })
    }

    /// Element kind for array types.
    #[must_use]
    pub const fn element_kind(&self) -> Option<ElementKind> {
        match self.kind {
            ObjectKind::Array { element } => Some(element),
            ObjectKind::Instance { .. } => None,
        }
    }

    #[must_use]
    pub const fn is_finalizable(&self) -> bool {
        self.finalizer.is_some()
    }

    pub(crate) fn finalizer(&self) -> Option<&Arc<dyn Finalize>> {
        self.finalizer.as_ref()
    }

    /// Computes the layout of one object of this type.
    ///
    /// `len` must be `Some` exactly when the type is an array.
    pub(crate) fn layout(&self, len: Option<usize>) -> Result<ObjectLayout> {
        match (self.kind, len) {
            (
                ObjectKind::Instance {
                    reference_fields,
                    data_bytes,
                },
                None,
            ) => {
                let size = reference_fields
                    .checked_mul(REFERENCE_SLOT_SIZE)
                    .and_then(|refs| refs.checked_add(data_bytes))
                    .and_then(|body| body.checked_add(OBJECT_HEADER_SIZE))
                    .ok_or(GcError::SizeOverflow(0))?;
                Ok(ObjectLayout {
                    size,
                    reference_slots: reference_fields,
                    data_offset: OBJECT_HEADER_SIZE + reference_fields * REFERENCE_SLOT_SIZE,
                    data_len: data_bytes,
                    array_len: None,
                })
            }
            (ObjectKind::Array { element }, Some(len)) => {
                let body = len
                    .checked_mul(element.size())
                    .ok_or(GcError::SizeOverflow(len))?;
                let size = body
                    .checked_add(OBJECT_HEADER_SIZE + ARRAY_LENGTH_SIZE)
                    .ok_or(GcError::SizeOverflow(len))?;
                let (reference_slots, data_len) = if element.is_reference() {
                    (len, 0)
                } else {
                    (0, body)
                };
                Ok(ObjectLayout {
                    size,
                    reference_slots,
                    data_offset: OBJECT_HEADER_SIZE + ARRAY_LENGTH_SIZE,
                    data_len,
                    array_len: Some(len),
                })
            }
            (ObjectKind::Instance { .. }, Some(_)) => Err(GcError::NotAnArray(self.name.clone())),
            (ObjectKind::Array { .. }, None) => Err(GcError::NotAnInstance(self.name.clone())),
        }
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("finalizable", &self.is_finalizable())
            .finish()
    }
}

/// Byte layout of one object, derived from its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ObjectLayout {
    /// Total object size including the header.
    pub size: usize,
    /// Number of traced reference slots.
    pub reference_slots: usize,
    /// Offset of the untraced payload from the start of the block.
    pub data_offset: usize,
    /// Length of the untraced payload.
    pub data_len: usize,
    /// Element count for arrays.
    pub array_len: Option<usize>,
}
