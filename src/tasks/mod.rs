//! Maintenance Tasks
//!
//! Houses the garbage collector, invoked from the engine's `shutdown` hook.

pub mod gc;
