//! Priority round-robin process scheduler.
//!
//! Sixteen strict priority levels, each a circular run queue represented as
//! `next` links through an id-indexed process arena (no owning pointers, no
//! cycles for the borrow checker to fight). The timer tick calls
//! [`process_switch`] with the interrupted register state; picking the next
//! process walks the highest non-empty priority bucket round-robin, skipping
//! blocked processes.

mod process;
mod queue;
mod scheduler;

pub use process::{Pid, Process, ProcessFlags, Stack};
pub use scheduler::{
    block, current_process_id, exit, init, process_switch, process_yield, reschedule_for_test,
    spawn, unblock, with_process, Scheduler, SwitchTarget, SCHEDULER,
};

pub use crate::config::{DEFAULT_STACK_SIZE, PRIORITY_MAX};
