#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **herd-engine** – Procedure executor and crash recovery for the herd
//! controller.
//!
//! Inbound commands and events become *procedures*: durable, serially
//! executed sequences of *jobs*. The executor owns a FIFO queue, a fixed
//! worker pool and the in-memory procedure registry; the lock manager
//! serializes procedures that touch the same objects, and every job
//! transition is journaled through the store's checkpoint log so an unclean
//! shutdown can be replayed deterministically at the next boot.

pub mod action;
pub mod executor;
pub mod procedure;
pub mod recovery;

pub use action::{ActionFn, ActionFuture, ActionOutcome, ActionRegistry};
pub use executor::{Executor, ExecutorConfig};
pub use procedure::{Job, JobSpec, Procedure, UndoSpec};
pub use recovery::recover;
