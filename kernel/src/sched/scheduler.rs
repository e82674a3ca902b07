//! Scheduler state and the switch path.

use super::process::{Pid, Process, ProcessFlags, ProcessTable, Stack};
use super::queue::RunQueue;
use crate::config::PRIORITY_MAX;
use crate::error::{KernelError, KernelResult};
use crate::interrupt::{InterruptFrame, InterruptGuard};
use crate::mm::PhysicalAddress;
use crate::arch;
use crate::sync::GlobalState;

/// Ring-0 selectors programmed into supervisor frames.
const KERNEL_CS: u32 = 0x08;
const KERNEL_DS: u32 = 0x10;
/// Ring-3 selectors (RPL 3) programmed into user frames.
const USER_CS: u32 = 0x1B;
const USER_DS: u32 = 0x23;

/// EFLAGS for a fresh process: IF plus the always-one bit, so a resumed
/// process is preemptible from its first instruction.
const INITIAL_EFLAGS: u32 = 0x202;

const QUEUE_COUNT: usize = PRIORITY_MAX as usize + 1;

/// Everything the switch path needs after the scheduler lock is dropped.
pub struct SwitchTarget {
    pub pid: Pid,
    pub frame: InterruptFrame,
    pub page_directory: PhysicalAddress,
}

pub struct Scheduler {
    table: ProcessTable,
    queues: [RunQueue; QUEUE_COUNT],
    current: Option<Pid>,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            table: ProcessTable::new(),
            queues: [RunQueue::new(); QUEUE_COUNT],
            current: None,
        }
    }

    /// Create a process and append it to its priority queue.
    ///
    /// With `stack_addr == 0` a stack of `stack_size` bytes is taken from
    /// the kernel heap and owned by the process record; otherwise the caller
    /// keeps ownership of the given region.
    pub fn spawn(
        &mut self,
        entry_point: usize,
        page_directory: PhysicalAddress,
        priority: u8,
        stack_addr: usize,
        stack_size: usize,
        flags: ProcessFlags,
    ) -> KernelResult<Pid> {
        if entry_point == 0 {
            return Err(KernelError::InvalidArgument { name: "entry_point" });
        }
        if stack_size == 0 {
            return Err(KernelError::InvalidArgument { name: "stack_size" });
        }
        if priority > PRIORITY_MAX {
            log::error!("invalid process priority: {}", priority);
            return Err(KernelError::InvalidArgument { name: "priority" });
        }
        let stack = if stack_addr == 0 {
            Stack::owned(stack_size)
        } else {
            Stack::Provided {
                base: stack_addr,
                size: stack_size,
            }
        };

        let mut state = InterruptFrame::zeroed();
        if flags.contains(ProcessFlags::SUPERVISOR) {
            state.cs = KERNEL_CS;
            state.ds = KERNEL_DS;
            state.es = KERNEL_DS;
            state.fs = KERNEL_DS;
            state.gs = KERNEL_DS;
            state.ss = KERNEL_DS;
        } else {
            state.cs = USER_CS;
            state.ds = USER_DS;
            state.es = USER_DS;
            state.fs = USER_DS;
            state.gs = USER_DS;
            state.ss = USER_DS;
        }
        state.eip = entry_point as u32;
        state.esp = stack.top() as u32;
        state.useresp = stack.top() as u32;
        state.eflags = INITIAL_EFLAGS;
        state.cr3 = page_directory.as_usize() as u32;

        let pid = self.table.insert_with(|id| Process {
            id,
            blocked: false,
            page_directory,
            state,
            stack,
            flags,
            priority,
            next: None,
        });
        self.queues[priority as usize].enqueue(&mut self.table, pid);
        if self.current.is_none() {
            self.current = Some(pid);
        }
        log::debug!(
            "spawned process: id={} priority={} entry={:#010X}",
            pid,
            priority,
            entry_point
        );
        Ok(pid)
    }

    /// Save the interrupted state into the current process and pick the next
    /// runnable one, highest priority bucket first, round-robin within the
    /// bucket. Returns `None` when nothing is runnable.
    pub fn reschedule(&mut self, regs: Option<&InterruptFrame>) -> Option<SwitchTarget> {
        if let (Some(regs), Some(current)) = (regs, self.current) {
            if let Some(process) = self.table.get_mut(current) {
                process.state = *regs;
            }
        }
        for priority in (0..QUEUE_COUNT).rev() {
            let Some(pid) = self.queues[priority].pick_next(&self.table) else {
                continue;
            };
            self.queues[priority].last = Some(pid);
            self.current = Some(pid);
            let process = self.table.get(pid)?;
            return Some(SwitchTarget {
                pid,
                frame: process.state,
                page_directory: process.page_directory,
            });
        }
        None
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.current
    }

    pub fn live_count(&self) -> usize {
        self.table.live_count()
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.table.get(pid)
    }

    /// Mark a process blocked; it stays queued but the picker skips it.
    pub fn block(&mut self, pid: Pid) -> KernelResult<()> {
        self.table
            .get_mut(pid)
            .map(|process| process.blocked = true)
            .ok_or(KernelError::ProcessNotFound { pid })
    }

    pub fn unblock(&mut self, pid: Pid) -> KernelResult<()> {
        self.table
            .get_mut(pid)
            .map(|process| process.blocked = false)
            .ok_or(KernelError::ProcessNotFound { pid })
    }

    /// Remove a process entirely: unlink it from its queue and release its
    /// arena slot (dropping a heap-owned stack with it).
    pub fn exit(&mut self, pid: Pid) -> KernelResult<()> {
        let priority = self
            .table
            .get(pid)
            .map(|process| process.priority)
            .ok_or(KernelError::ProcessNotFound { pid })?;
        self.queues[priority as usize].unlink(&mut self.table, pid);
        self.table.remove(pid);
        if self.current == Some(pid) {
            self.current = None;
        }
        log::debug!("process {} exited", pid);
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// The scheduler singleton.
pub static SCHEDULER: GlobalState<Scheduler> = GlobalState::new();

/// Arm the scheduler. Called once from the boot path.
pub fn init() -> KernelResult<()> {
    SCHEDULER
        .init(Scheduler::new())
        .map_err(|_| KernelError::InvalidArgument { name: "scheduler reinit" })?;
    log::info!("scheduler ready ({} priority levels)", QUEUE_COUNT);
    Ok(())
}

/// Spawn against the singleton.
pub fn spawn(
    entry_point: usize,
    page_directory: PhysicalAddress,
    priority: u8,
    stack_addr: usize,
    stack_size: usize,
    flags: ProcessFlags,
) -> KernelResult<Pid> {
    let _guard = InterruptGuard::disable();
    SCHEDULER
        .with_mut(|scheduler| {
            scheduler.spawn(
                entry_point,
                page_directory,
                priority,
                stack_addr,
                stack_size,
                flags,
            )
        })
        .ok_or(KernelError::NotInitialized { subsystem: "scheduler" })?
}

/// Timer-tick entry: save the interrupted state and resume the next
/// runnable process. Returns normally only when there is nothing to switch
/// to, in which case the interrupted context continues.
pub fn process_switch(frame: &mut InterruptFrame) {
    let target = {
        let _guard = InterruptGuard::disable();
        if !frame.is_user_mode() {
            // No privilege change happened on interrupt entry, so the CPU
            // never pushed ESP; the interrupted stack continues right after
            // the eflags slot of this very frame.
            frame.useresp = (frame as *const InterruptFrame as usize
                + core::mem::offset_of!(InterruptFrame, useresp)) as u32;
        }
        SCHEDULER
            .with_mut(|scheduler| scheduler.reschedule(Some(frame)))
            .flatten()
    };
    if let Some(target) = target {
        resume(target);
    }
}

/// Give up the calling context for good and run the scheduler. The boot
/// path's final act: its context is never saved, so the first timer tick
/// that lands in the idle loop below adopts it as the current process's
/// continuation.
pub fn process_yield() -> ! {
    loop {
        let target = {
            let _guard = InterruptGuard::disable();
            SCHEDULER
                .with_mut(|scheduler| scheduler.reschedule(None))
                .flatten()
        };
        if let Some(target) = target {
            resume(target);
        }
        // Nothing runnable: idle until an interrupt changes that.
        arch::enable_interrupts();
        arch::wait_for_interrupt();
    }
}

/// Load the target's address space and jump into its saved frame.
fn resume(target: SwitchTarget) -> ! {
    log::debug!(
        "switching process: id={} eip={:#010X}",
        target.pid,
        target.frame.eip
    );
    if target.page_directory.as_usize() != 0 {
        // SAFETY: the directory address was captured from a live directory
        // at spawn time and directories are never freed; interrupts are off
        // in the switch path.
        unsafe {
            arch::write_cr3(target.page_directory.as_usize());
        }
    }
    arch::set_state_and_jump(&target.frame)
}

/// Id of the process currently scheduled, if any.
pub fn current_process_id() -> Option<Pid> {
    SCHEDULER.with(|scheduler| scheduler.current_pid()).flatten()
}

/// Run `f` against a process record.
pub fn with_process<R>(pid: Pid, f: impl FnOnce(&Process) -> R) -> Option<R> {
    SCHEDULER
        .with(|scheduler| scheduler.get(pid).map(f))
        .flatten()
}

/// Block a process by id.
pub fn block(pid: Pid) -> KernelResult<()> {
    let _guard = InterruptGuard::disable();
    SCHEDULER
        .with_mut(|scheduler| scheduler.block(pid))
        .ok_or(KernelError::NotInitialized { subsystem: "scheduler" })?
}

/// Unblock a process by id.
pub fn unblock(pid: Pid) -> KernelResult<()> {
    let _guard = InterruptGuard::disable();
    SCHEDULER
        .with_mut(|scheduler| scheduler.unblock(pid))
        .ok_or(KernelError::NotInitialized { subsystem: "scheduler" })?
}

/// Terminate a process by id.
pub fn exit(pid: Pid) -> KernelResult<()> {
    let _guard = InterruptGuard::disable();
    SCHEDULER
        .with_mut(|scheduler| scheduler.exit(pid))
        .ok_or(KernelError::NotInitialized { subsystem: "scheduler" })?
}

/// Drive one scheduling decision without jumping. Test scaffolding: the
/// host target cannot perform the actual context switch.
pub fn reschedule_for_test(regs: Option<&InterruptFrame>) -> Option<(Pid, InterruptFrame)> {
    SCHEDULER
        .with_mut(|scheduler| scheduler.reschedule(regs))
        .flatten()
        .map(|target| (target.pid, target.frame))
}
