//! Load-balanced target selection.
//!
//! A [`SchedTarget`] caps the number of concurrent exchanges to one
//! destination; a [`SchedGroup`] spreads requests over several of them,
//! always picking the member with the lowest relative load. Both implement
//! [`RequestObject`], which is what [`CommScheduler::request`] draws a
//! target from.

mod group;
mod object;
mod scheduler;
mod target;

pub use group::SchedGroup;
pub use object::RequestObject;
pub use scheduler::CommScheduler;
pub use target::SchedTarget;
