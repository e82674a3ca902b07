//! Synchronization primitives for global kernel state.

pub mod once_lock;

pub use once_lock::GlobalState;
