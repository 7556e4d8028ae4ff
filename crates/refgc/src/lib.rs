//! A tracing mark-sweep heap with finalization and weak, soft and phantom
//! references.
//!
//! `refgc` manages objects described by [`TypeDescriptor`]s on behalf of a
//! managed runtime. Objects are addressed by copyable [`ObjectRef`] handles
//! and kept alive by the root set: each mutator's root frames plus a global
//! table. Collections stop every mutator, trace from the roots, process
//! references, queue newly unreachable finalizable objects, and sweep.
//!
//! # Features
//!
//! - **Size-segregated allocation**: small objects on size-class pages, large
//!   objects in page runs with their own first-fit placement
//! - **Finalization**: finalizers run on dedicated threads and may resurrect
//!   their object; a resurrected object is finalized again at its next death
//! - **Weak, soft and phantom references** with exactly-once enqueueing on
//!   [`ReferenceQueue`]s
//! - **Stop-the-world coordination** through safepoint polls and blocking
//!   regions, with per-thread and system pause reporting
//!
//! # Quick Start
//!
//! ```
//! use refgc::{GcConfig, Heap, ReferenceKind, ReferenceQueue, TypeDescriptor};
//!
//! let heap = Heap::new(GcConfig::with_capacity(1 << 20)).unwrap();
//! let mutator = heap.bind_mutator();
//! let node = TypeDescriptor::instance("Node", 1, 8).into_ref();
//!
//! let queue = ReferenceQueue::new();
//! let weak = {
//!     let _frame = mutator.frame();
//!     let obj = mutator.alloc(&node).unwrap();
//!     mutator
//!         .create_reference(ReferenceKind::Weak, obj, Some(&queue))
//!         .unwrap()
//! };
//!
//! heap.collect();
//! assert!(mutator.reference_get(&weak).is_none());
//! assert_eq!(queue.poll(), Some(weak));
//! ```
//!
//! # Threads
//!
//! A thread binds to a heap with [`HeapHandle::bind_mutator`]. Long-running
//! loops should call [`Mutator::safepoint`] periodically, and anything that
//! may block (locks, channels, [`ReferenceQueue::remove`]) belongs inside
//! [`Mutator::blocking`]; otherwise a pause waits for that thread.

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod descriptor;
pub mod error;
mod finalizer;
mod gc;
mod los;
pub mod metrics;
mod mutator;
mod object;
pub mod reference;
mod roots;
mod runtime;
mod tracing;

/// Heap spaces and their usage reports.
///
/// This module is public for size-class constants and usage types; objects
/// are allocated through [`Mutator`].
pub mod heap;

// Re-export public API
pub use config::GcConfig;
pub use descriptor::{ElementKind, Finalize, ObjectKind, TypeDescriptor, TypeRef};
pub use error::{FinalizeError, GcError, Result, SpaceKind};
pub use finalizer::FinalizationStats;
pub use gc::{
    build_report, default_collect_condition, system_pauses, CollectCondition, CollectInfo,
    CollectionCause, PauseInterval, PauseReport, SystemPause,
};
pub use heap::{HeapUsage, SpaceUsage};
pub use metrics::{CumulativeMetrics, GcHistory, GcMetrics};
pub use mutator::{Frame, Mutator, MutatorId};
pub use object::ObjectRef;
pub use reference::{Reference, ReferenceKind, ReferenceQueue};
pub use roots::GlobalId;
pub use runtime::{Heap, HeapHandle};
