//! Interval timer and periodic event queue.
//!
//! `init` programs the 8253-compatible timer to [`TICK_RATE`] Hz and claims
//! IRQ 0. Each tick advances every queued event by [`TICK_USEC`]; an event
//! whose elapsed time reaches its period fires and is reset, and an event
//! whose callback returns `false` is dropped from the queue. After the queue
//! runs, the tick hands the interrupted register state to the scheduler.
//!
//! Callbacks run in interrupt context with the queue locked: they must not
//! call back into `add_event`/`remove_event`.

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

pub use crate::config::{PIT_BASE_HZ, TICK_RATE, TICK_USEC};
use crate::error::{KernelError, KernelResult};
use crate::interrupt::{self, InterruptFrame, InterruptGuard};
use crate::sync::GlobalState;
use crate::{arch, sched};

/// Monotonic tick counter since `init`.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// The process-wide event queue.
static TIMER_QUEUE: GlobalState<TimerQueue> = GlobalState::new();

/// 32-bit djb2 hash used to identify events by name.
pub fn hash32(text: &str) -> u32 {
    let mut hash: u32 = 5381;
    for byte in text.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u32);
    }
    hash
}

/// Decides whether a fired event stays in the queue.
pub type EventCallback = Box<dyn FnMut() -> bool + Send>;

/// One periodic event.
pub struct TimerEvent {
    /// Owned copy of the registration name.
    pub name: String,
    pub name_hash: u32,
    /// Firing period in microseconds.
    pub period: u64,
    /// Microseconds accumulated since the last firing.
    pub elapsed_time: u64,
    callback: EventCallback,
}

/// Ordered queue of periodic events. Events fire in registration order.
pub struct TimerQueue {
    events: Vec<TimerEvent>,
}

impl TimerQueue {
    pub const fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Append an event. The name is duplicated into the event.
    pub fn add(&mut self, name: &str, period_usec: u64, callback: EventCallback) {
        self.events.push(TimerEvent {
            name: String::from(name),
            name_hash: hash32(name),
            period: period_usec,
            elapsed_time: 0,
            callback,
        });
    }

    /// Remove every event registered under `name` (hash compared). Removing
    /// an unknown name is a no-op.
    pub fn remove(&mut self, name: &str) {
        let hash = hash32(name);
        self.events.retain(|event| event.name_hash != hash);
    }

    /// Microseconds until the next event would fire, assuming no
    /// re-registration. Diagnostic helper.
    pub fn next_due_usec(&self) -> Option<u64> {
        self.events
            .iter()
            .map(|event| event.period.saturating_sub(event.elapsed_time))
            .min()
    }

    /// Advance all events by `elapsed_usec`, firing the due ones in list
    /// order and dropping those whose callback declines to stay.
    pub fn tick(&mut self, elapsed_usec: u64) {
        self.events.retain_mut(|event| {
            event.elapsed_time += elapsed_usec;
            if event.elapsed_time >= event.period {
                log::debug!("event \"{}\" raised", event.name);
                let keep = (event.callback)();
                event.elapsed_time = 0;
                keep
            } else {
                true
            }
        });
    }

    /// Elapsed time of the first event registered under `name`.
    pub fn elapsed_of(&self, name: &str) -> Option<u64> {
        let hash = hash32(name);
        self.events
            .iter()
            .find(|event| event.name_hash == hash)
            .map(|event| event.elapsed_time)
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Program the interval timer, claim IRQ 0 and arm the event queue.
pub fn init() -> KernelResult<()> {
    let _guard = InterruptGuard::disable();
    TIMER_QUEUE
        .init(TimerQueue::new())
        .map_err(|_| KernelError::InvalidArgument { name: "timer reinit" })?;
    let divisor = PIT_BASE_HZ / TICK_RATE;
    // SAFETY: interrupts are disabled by the guard, and the IRQ 0 handler is
    // registered in the same breath.
    unsafe {
        arch::program_interval_timer(divisor as u16);
    }
    interrupt::set_interrupt_handler(interrupt::IRQ_TIMER, timer_interrupt);
    log::info!("interval timer at {} Hz (divisor {})", TICK_RATE, divisor);
    Ok(())
}

/// IRQ 0: advance the event queue, then give the scheduler a chance to
/// switch away from the interrupted context.
fn timer_interrupt(frame: &mut InterruptFrame) {
    TICKS.fetch_add(1, Ordering::Relaxed);
    TIMER_QUEUE.with_mut(|queue| queue.tick(TICK_USEC));
    sched::process_switch(frame);
}

/// Ticks since boot.
pub fn get_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Microseconds since boot, at tick granularity.
pub fn uptime_usec() -> u64 {
    get_ticks() * TICK_USEC
}

/// Register a periodic event with the global queue.
pub fn add_event(name: &str, period_usec: u64, callback: EventCallback) -> KernelResult<()> {
    let _guard = InterruptGuard::disable();
    TIMER_QUEUE
        .with_mut(|queue| queue.add(name, period_usec, callback))
        .ok_or(KernelError::NotInitialized { subsystem: "timer" })
}

/// Remove events by name from the global queue. Unknown names are ignored.
pub fn remove_event(name: &str) {
    let _guard = InterruptGuard::disable();
    TIMER_QUEUE.with_mut(|queue| queue.remove(name));
}
