//! Dispatch orchestration for the Gmail push relay.
//!
//! [`Dispatcher`] sequences the gates from the [`pipeline`] crate with the
//! collaborator ports (message fetch, activity verification, job trigger) and
//! owns the shared rate-limit and claim state. [`spawn_sweeper`] evicts that
//! state in the background.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** The dispatcher decides *when* each gate and
//! collaborator runs. It contains no domain rules of its own and performs no
//! network I/O directly.

mod dispatcher;
mod sweeper;

pub use dispatcher::{Collaborators, Dispatcher, SweepReport};
pub use sweeper::{spawn_sweeper, DEFAULT_SWEEP_INTERVAL};
