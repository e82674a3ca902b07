//! Scheduler integration tests: the core scheduling scenarios over a privately
//! constructed scheduler instance.

use std::collections::HashMap;

use redshift_kernel::interrupt::InterruptFrame;
use redshift_kernel::mm::PhysicalAddress;
use redshift_kernel::sched::{Pid, ProcessFlags, Scheduler, PRIORITY_MAX};

fn spawn(scheduler: &mut Scheduler, priority: u8) -> Pid {
    scheduler
        .spawn(
            0x10_0000,
            PhysicalAddress::new(0x1000),
            priority,
            0,
            8192,
            ProcessFlags::SUPERVISOR,
        )
        .expect("spawn succeeds")
}

// ===== Scenario: priorities 3, 7, 7 over 100 ticks =====

#[test]
fn test_priority_seven_pair_alternates_and_three_starves() {
    let mut scheduler = Scheduler::new();
    let low = spawn(&mut scheduler, 3);
    let hi_a = spawn(&mut scheduler, 7);
    let hi_b = spawn(&mut scheduler, 7);

    let mut tally: HashMap<Pid, u32> = HashMap::new();
    let mut previous: Option<Pid> = None;
    for _ in 0..100 {
        let frame = InterruptFrame::zeroed();
        let target = scheduler
            .reschedule(Some(&frame))
            .expect("a runnable process exists");
        *tally.entry(target.pid).or_insert(0) += 1;
        if let Some(previous) = previous {
            assert_ne!(previous, target.pid, "the pair must alternate every tick");
        }
        previous = Some(target.pid);
    }
    assert_eq!(tally.get(&low), None, "priority 3 gets no ticks");
    assert_eq!(tally[&hi_a] + tally[&hi_b], 100);
    assert_eq!(tally[&hi_a], 50);
    assert_eq!(tally[&hi_b], 50);
}

// ===== Frame initialisation =====

#[test]
fn test_supervisor_and_user_selectors() {
    let mut scheduler = Scheduler::new();
    let supervisor = spawn(&mut scheduler, 1);
    let user = scheduler
        .spawn(
            0x40_0000,
            PhysicalAddress::new(0x2000),
            1,
            0x80_0000,
            0x4000,
            ProcessFlags::empty(),
        )
        .expect("user spawn succeeds");

    let s = scheduler.get(supervisor).expect("exists");
    assert_eq!((s.state.cs, s.state.ds, s.state.ss), (0x08, 0x10, 0x10));
    assert!(s.is_supervisor());

    let u = scheduler.get(user).expect("exists");
    assert_eq!((u.state.cs, u.state.ds, u.state.ss), (0x1B, 0x23, 0x23));
    assert_eq!(u.state.eip, 0x40_0000);
    assert_eq!(u.state.useresp, 0x80_4000, "esp starts at stack top");
    assert!(!u.is_supervisor());
}

#[test]
fn test_spawn_rejects_priority_out_of_range() {
    let mut scheduler = Scheduler::new();
    assert!(scheduler
        .spawn(
            0x1000,
            PhysicalAddress::new(0),
            PRIORITY_MAX + 1,
            0,
            4096,
            ProcessFlags::SUPERVISOR,
        )
        .is_err());
}

// ===== Blocking =====

#[test]
fn test_blocked_process_keeps_queue_position() {
    let mut scheduler = Scheduler::new();
    let a = spawn(&mut scheduler, 5);
    let b = spawn(&mut scheduler, 5);
    let c = spawn(&mut scheduler, 5);

    scheduler.block(b).expect("b exists");
    let mut seen = Vec::new();
    for _ in 0..6 {
        seen.push(scheduler.reschedule(None).expect("runnable").pid);
    }
    assert!(!seen.contains(&b), "blocked process must be skipped");
    scheduler.unblock(b).expect("b exists");
    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(scheduler.reschedule(None).expect("runnable").pid);
    }
    assert!(seen.contains(&a));
    assert!(seen.contains(&b), "unblocked process rejoins the rotation");
    assert!(seen.contains(&c));
}

#[test]
fn test_no_runnable_process_means_no_switch() {
    let mut scheduler = Scheduler::new();
    let a = spawn(&mut scheduler, 2);
    let b = spawn(&mut scheduler, 9);
    scheduler.block(a).expect("a exists");
    scheduler.block(b).expect("b exists");
    assert!(scheduler.reschedule(None).is_none());
    scheduler.unblock(b).expect("b exists");
    assert_eq!(scheduler.reschedule(None).expect("b runnable").pid, b);
}

// ===== State capture =====

#[test]
fn test_switch_preserves_interrupted_registers() {
    let mut scheduler = Scheduler::new();
    let first = spawn(&mut scheduler, 6);
    let second = spawn(&mut scheduler, 6);

    let mut frame = InterruptFrame::zeroed();
    frame.eax = 0xAAAA_0001;
    frame.ebx = 0xBBBB_0002;
    frame.eip = 0xC0DE;
    frame.cs = 0x08;

    // First decision saves the interrupted frame into the current process
    // (the first spawned) and resumes it.
    let target = scheduler.reschedule(Some(&frame)).expect("runnable");
    assert_eq!(target.pid, first);
    assert_eq!(target.frame.eax, 0xAAAA_0001);

    // The next decision rotates to the other process with its pristine
    // spawn frame.
    let target = scheduler.reschedule(None).expect("runnable");
    assert_eq!(target.pid, second);
    assert_eq!(target.frame.eip, 0x10_0000);
    assert_eq!(target.frame.eflags, 0x202, "spawned frames carry IF");
}

// ===== Exit =====

#[test]
fn test_exit_path_releases_processes() {
    let mut scheduler = Scheduler::new();
    let a = spawn(&mut scheduler, 7);
    let b = spawn(&mut scheduler, 7);
    let c = spawn(&mut scheduler, 7);
    assert_eq!(scheduler.live_count(), 3);

    scheduler.exit(b).expect("b exists");
    assert_eq!(scheduler.live_count(), 2);
    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(scheduler.reschedule(None).expect("runnable").pid);
    }
    assert!(!seen.contains(&b));
    assert!(seen.contains(&a));
    assert!(seen.contains(&c));

    scheduler.exit(a).expect("a exists");
    scheduler.exit(c).expect("c exists");
    assert!(scheduler.reschedule(None).is_none());
    assert!(scheduler.exit(c).is_err(), "second exit reports the missing pid");
}
