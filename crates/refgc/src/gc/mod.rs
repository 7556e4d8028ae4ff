//! Garbage collection: the pause coordinator, tracing, reference processing
//! and the collection driver.

#[allow(clippy::module_inception)]
mod gc;

pub(crate) mod mark;
pub(crate) mod pause;
pub(crate) mod reference_processor;
pub(crate) mod safepoint;

pub(crate) use gc::collect;
pub use gc::{default_collect_condition, CollectCondition, CollectInfo, CollectionCause};
pub use pause::{build_report, system_pauses, PauseInterval, PauseReport, SystemPause};
