//! Circular run queues over the process arena.
//!
//! A queue is just a cursor to the last-scheduled process; the ring itself
//! lives in the `next` links of the arena entries. Walking `last.next` first
//! gives round-robin rotation for free.

extern crate alloc;

use alloc::vec::Vec;

use super::process::{Pid, ProcessTable};

/// One priority level's queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunQueue {
    /// The process scheduled most recently; the next quantum's search
    /// starts at its successor.
    pub last: Option<Pid>,
}

impl RunQueue {
    pub const fn new() -> Self {
        Self { last: None }
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_none()
    }

    /// Link `pid` into the ring just after the cursor, then move the cursor
    /// onto it (a freshly spawned process waits a full rotation).
    pub fn enqueue(&mut self, table: &mut ProcessTable, pid: Pid) {
        match self.last {
            None => {
                if let Some(process) = table.get_mut(pid) {
                    process.next = Some(pid);
                }
                self.last = Some(pid);
            }
            Some(last) => {
                let successor = table.get(last).and_then(|process| process.next);
                if let Some(process) = table.get_mut(pid) {
                    process.next = successor;
                }
                if let Some(process) = table.get_mut(last) {
                    process.next = Some(pid);
                }
                self.last = Some(pid);
            }
        }
    }

    /// Unlink `pid` from the ring. Returns whether it was a member.
    pub fn unlink(&mut self, table: &mut ProcessTable, pid: Pid) -> bool {
        let Some(last) = self.last else {
            return false;
        };
        // Find the predecessor by walking the ring.
        let mut predecessor = last;
        let mut found = false;
        loop {
            let successor = match table.get(predecessor).and_then(|process| process.next) {
                Some(next) => next,
                None => return false,
            };
            if successor == pid {
                found = true;
                break;
            }
            predecessor = successor;
            if predecessor == last {
                break;
            }
        }
        if !found {
            return false;
        }
        let after = table.get(pid).and_then(|process| process.next);
        if predecessor == pid {
            // Single-element ring.
            self.last = None;
        } else {
            if let Some(process) = table.get_mut(predecessor) {
                process.next = after;
            }
            if self.last == Some(pid) {
                self.last = Some(predecessor);
            }
        }
        if let Some(process) = table.get_mut(pid) {
            process.next = None;
        }
        true
    }

    /// First non-blocked process, searching from the cursor's successor and
    /// going once around the ring.
    pub fn pick_next(&self, table: &ProcessTable) -> Option<Pid> {
        let last = self.last?;
        let mut candidate = table.get(last).and_then(|process| process.next)?;
        loop {
            if let Some(process) = table.get(candidate) {
                if !process.blocked {
                    return Some(candidate);
                }
            }
            if candidate == last {
                return None;
            }
            candidate = table.get(candidate).and_then(|process| process.next)?;
        }
    }

    /// Ring members starting after the cursor. Diagnostic and test helper.
    pub fn members(&self, table: &ProcessTable) -> Vec<Pid> {
        let mut result = Vec::new();
        let Some(last) = self.last else {
            return result;
        };
        let Some(start) = table.get(last).and_then(|process| process.next) else {
            return result;
        };
        let mut current = start;
        loop {
            result.push(current);
            match table.get(current).and_then(|process| process.next) {
                Some(next) if next != start && result.len() <= table.live_count() => {
                    current = next;
                }
                _ => break,
            }
        }
        result
    }
}
