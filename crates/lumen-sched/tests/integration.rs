//! Integration tests for the lumen-sched crate.
//!
//! These exercise the scheduler end to end: real worker threads, a tick loop
//! on the test thread, and tasks built from every combinator.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use lumen_sched::{ScheduleTimeline, Scheduler};
use lumen_task::{Chain, FutureStatus, TaskPriority};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Tick the scheduler until `done` or the timeout elapses.
fn drive(scheduler: &Scheduler, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        scheduler.tick(Instant::now());
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

// ═══════════════════════════════════════════════════════════════════════
//  Ordering and priority
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn equal_priority_tasks_complete_in_submission_order() {
    init_tracing();
    let scheduler = Scheduler::new(1).expect("scheduler");

    let order = Arc::new(Mutex::new(Vec::new()));
    let futures: Vec<_> = (1..=3u32)
        .map(|index| {
            let order = Arc::clone(&order);
            scheduler
                .submit(format!("noop-{index}"), TaskPriority::Normal, move || {
                    order.lock().unwrap().push(index);
                })
                .expect("submit")
        })
        .collect();

    assert!(drive(&scheduler, Duration::from_secs(5), || {
        futures.iter().all(|f| f.is_done())
    }));

    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    scheduler.shutdown();
}

#[test]
fn critical_task_preempts_a_background_loop() {
    init_tracing();
    let scheduler = Scheduler::new(1).expect("scheduler");

    let loop_future = scheduler
        .submit_loop("bg-loop", TaskPriority::Background, || {
            thread::sleep(Duration::from_millis(1));
        })
        .expect("submit loop");

    // a few ticks to get the loop onto the single slot
    assert!(drive(&scheduler, Duration::from_secs(5), || {
        loop_future.fetch_status() == FutureStatus::Executing
    }));

    let critical = scheduler
        .submit("critical-noop", TaskPriority::Critical, || ())
        .expect("submit critical");

    // the critical task lands inside the loop's starvation window, evicts
    // it, and completes
    assert!(drive(&scheduler, Duration::from_secs(5), || critical.is_done()));
    assert_eq!(critical.fetch_status(), FutureStatus::Completed);
    assert!(!loop_future.is_done());

    // the loop gets its slot back afterwards
    assert!(drive(&scheduler, Duration::from_secs(5), || {
        loop_future.fetch_status() == FutureStatus::Executing
    }));

    loop_future.request_cancel();
    assert!(drive(&scheduler, Duration::from_secs(5), || {
        loop_future.is_done()
    }));
    assert_eq!(loop_future.fetch_status(), FutureStatus::UserCanceled);

    scheduler.shutdown();
}

#[test]
fn background_task_survives_an_interactive_flood() {
    init_tracing();
    let scheduler = Scheduler::new(1).expect("scheduler");

    let background = scheduler
        .submit("background", TaskPriority::Background, || ())
        .expect("submit background");

    // flood the scheduler with interactive work every iteration; the
    // starvation window guarantees the background task is selected once the
    // flood ages past STARVATION_PERIOD
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut ticks = 0u32;
    while Instant::now() < deadline && !background.is_done() {
        scheduler
            .submit("interactive-noise", TaskPriority::Interactive, || ())
            .expect("submit noise");
        scheduler.tick(Instant::now());
        ticks += 1;
        thread::sleep(Duration::from_millis(1));
    }

    assert!(background.is_done(), "background task was starved for {ticks} ticks");
    assert_eq!(background.fetch_status(), FutureStatus::Completed);

    // well past the flood of the first window plus its drain
    let bound = 4 * ScheduleTimeline::STARVATION_PERIOD.as_millis() as u32;
    assert!(
        ticks <= bound,
        "background selection took {ticks} ticks, bound was {bound}"
    );

    scheduler.shutdown();
}

// ═══════════════════════════════════════════════════════════════════════
//  Cancellation and suspension
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn user_cancel_stops_a_long_for_loop_mid_range() {
    init_tracing();
    let scheduler = Scheduler::new(1).expect("scheduler");

    const END: i64 = 1_000_000;
    let progress = Arc::new(AtomicU64::new(0));
    let future = {
        let progress = Arc::clone(&progress);
        scheduler
            .submit_for("big-for", TaskPriority::Normal, 0, END, move |_| {
                progress.fetch_add(1, Ordering::Relaxed);
                thread::sleep(Duration::from_micros(5));
            })
            .expect("submit for")
    };

    // let it make some progress first
    assert!(drive(&scheduler, Duration::from_secs(5), || {
        progress.load(Ordering::Relaxed) > 100
    }));

    future.request_cancel();
    assert!(drive(&scheduler, Duration::from_secs(10), || future.is_done()));

    assert_eq!(future.fetch_status(), FutureStatus::UserCanceled);
    let executed = progress.load(Ordering::Relaxed);
    assert!(executed < END as u64, "loop ran to completion despite cancel");

    scheduler.shutdown();
}

#[test]
fn suspended_loop_stops_making_progress_until_resumed() {
    init_tracing();
    let scheduler = Scheduler::new(1).expect("scheduler");

    let count = Arc::new(AtomicU64::new(0));
    let future = {
        let count = Arc::clone(&count);
        scheduler
            .submit_loop("counting-loop", TaskPriority::Normal, move || {
                count.fetch_add(1, Ordering::Relaxed);
            })
            .expect("submit loop")
    };

    assert!(drive(&scheduler, Duration::from_secs(5), || {
        count.load(Ordering::Relaxed) > 0
    }));

    future.request_suspend();
    assert!(drive(&scheduler, Duration::from_secs(5), || {
        future.fetch_status() == FutureStatus::UserSuspended
    }));

    // parked: the body yielded, so the count is frozen
    let frozen = count.load(Ordering::Relaxed);
    assert!(!drive(&scheduler, Duration::from_millis(50), || {
        count.load(Ordering::Relaxed) != frozen
    }));

    future.request_resume();
    assert!(drive(&scheduler, Duration::from_secs(5), || {
        count.load(Ordering::Relaxed) > frozen
    }));

    future.request_cancel();
    assert!(drive(&scheduler, Duration::from_secs(5), || future.is_done()));
    assert_eq!(future.fetch_status(), FutureStatus::UserCanceled);

    scheduler.shutdown();
}

// ═══════════════════════════════════════════════════════════════════════
//  Chains, awaits and readiness
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn chain_stages_feed_each_other() {
    init_tracing();
    let scheduler = Scheduler::new(1).expect("scheduler");

    let chain = Chain::new(|| 2)
        .then(|x: i32| x + 1)
        .then(|x: i32| x * 2)
        .then(|x: i32| x.to_string());
    let future = scheduler
        .submit_chain("arith-chain", TaskPriority::Normal, chain)
        .expect("submit chain");

    assert!(drive(&scheduler, Duration::from_secs(5), || future.is_done()));
    assert_eq!(future.value().unwrap(), "6");

    scheduler.shutdown();
}

#[test]
fn await_all_runs_after_every_dependency() {
    init_tracing();
    let scheduler = Scheduler::new(2).expect("scheduler");

    let a = scheduler
        .submit("three", TaskPriority::Normal, || 3)
        .expect("submit a");
    let b = scheduler
        .submit("four", TaskPriority::Normal, || 4)
        .expect("submit b");

    let sum = {
        let (a, b) = (a.clone(), b.clone());
        scheduler
            .await_all(
                "sum",
                TaskPriority::Normal,
                vec![a.as_any(), b.as_any()],
                move || a.value().expect("a completed") + b.value().expect("b completed"),
            )
            .expect("submit await")
    };

    assert!(drive(&scheduler, Duration::from_secs(5), || sum.is_done()));
    assert_eq!(sum.value().unwrap(), 7);

    scheduler.shutdown();
}

#[test]
fn await_all_over_nothing_is_immediately_ready() {
    init_tracing();
    let scheduler = Scheduler::new(1).expect("scheduler");

    let future = scheduler
        .await_all("empty-await", TaskPriority::Normal, Vec::new(), || 9)
        .expect("submit");

    assert!(drive(&scheduler, Duration::from_secs(5), || future.is_done()));
    assert_eq!(future.value().unwrap(), 9);

    scheduler.shutdown();
}

#[test]
fn await_any_fires_on_the_first_completion() {
    init_tracing();
    let scheduler = Scheduler::new(2).expect("scheduler");

    let endless = scheduler
        .submit_loop("endless", TaskPriority::Background, || {
            thread::sleep(Duration::from_millis(1));
        })
        .expect("submit loop");
    let quick = scheduler
        .submit("quick", TaskPriority::Normal, || 1)
        .expect("submit quick");

    let first = scheduler
        .await_any(
            "first-of",
            TaskPriority::Normal,
            vec![endless.as_any(), quick.as_any()],
            || "one dependency settled",
        )
        .expect("submit await_any");

    assert!(drive(&scheduler, Duration::from_secs(5), || first.is_done()));
    assert_eq!(first.value().unwrap(), "one dependency settled");
    assert!(!endless.is_done());

    scheduler.shutdown();
    assert_eq!(endless.fetch_status(), FutureStatus::ForceCanceled);
}

#[test]
fn canceling_an_await_leaves_its_dependencies_alone() {
    init_tracing();
    let scheduler = Scheduler::new(1).expect("scheduler");

    let dep = scheduler
        .submit_after("slow-dep", TaskPriority::Normal, Duration::from_millis(50), || 5)
        .expect("submit dep");

    let gated = {
        let dep = dep.clone();
        scheduler
            .await_all("gated", TaskPriority::Normal, vec![dep.as_any()], move || {
                dep.value().unwrap_or(0)
            })
            .expect("submit await")
    };

    gated.request_cancel();
    assert!(drive(&scheduler, Duration::from_secs(5), || {
        gated.is_done() && dep.is_done()
    }));

    assert_eq!(gated.fetch_status(), FutureStatus::UserCanceled);
    assert_eq!(dep.fetch_status(), FutureStatus::Completed);
    assert_eq!(dep.value().unwrap(), 5);

    scheduler.shutdown();
}

#[test]
fn delayed_submission_respects_its_delay() {
    init_tracing();
    let scheduler = Scheduler::new(1).expect("scheduler");

    let submitted_at = Instant::now();
    let future = scheduler
        .submit_after("delayed", TaskPriority::Normal, Duration::from_millis(200), || 1)
        .expect("submit");

    // clearly before the delay elapses it must still be waiting
    assert!(!drive(&scheduler, Duration::from_millis(50), || future.is_done()));

    assert!(drive(&scheduler, Duration::from_secs(5), || future.is_done()));
    assert!(submitted_at.elapsed() >= Duration::from_millis(200));
    assert_eq!(future.value().unwrap(), 1);

    scheduler.shutdown();
}

#[test]
fn deferred_submission_waits_for_its_predicate() {
    init_tracing();
    let scheduler = Scheduler::new(1).expect("scheduler");

    let gate = Arc::new(AtomicBool::new(false));
    let future = {
        let gate = Arc::clone(&gate);
        scheduler
            .submit_when(
                "gated",
                TaskPriority::Normal,
                move || gate.load(Ordering::Acquire),
                || 11,
            )
            .expect("submit")
    };

    assert!(!drive(&scheduler, Duration::from_millis(50), || future.is_done()));

    gate.store(true, Ordering::Release);
    assert!(drive(&scheduler, Duration::from_secs(5), || future.is_done()));
    assert_eq!(future.value().unwrap(), 11);

    scheduler.shutdown();
}

// ═══════════════════════════════════════════════════════════════════════
//  Shutdown
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn dropping_the_scheduler_force_cancels_live_loops() {
    init_tracing();
    let scheduler = Scheduler::new(2).expect("scheduler");

    let futures: Vec<_> = (0..10)
        .map(|index| {
            scheduler
                .submit_loop(format!("loop-{index}"), TaskPriority::Normal, || {
                    thread::sleep(Duration::from_millis(1));
                })
                .expect("submit loop")
        })
        .collect();

    // get some of them actually running before the teardown
    assert!(drive(&scheduler, Duration::from_secs(5), || {
        futures
            .iter()
            .any(|f| f.fetch_status() == FutureStatus::Executing)
    }));

    let teardown_started = Instant::now();
    drop(scheduler);
    let teardown = teardown_started.elapsed();

    for future in &futures {
        assert_eq!(future.fetch_status(), FutureStatus::ForceCanceled);
    }
    assert!(
        teardown < Duration::from_secs(5),
        "workers took {teardown:?} to join"
    );
}

#[test]
fn shutdown_cancels_work_that_never_became_ready() {
    init_tracing();
    let scheduler = Scheduler::new(1).expect("scheduler");

    let never = scheduler
        .submit_when("never-ready", TaskPriority::Normal, || false, || ())
        .expect("submit");
    scheduler.tick(Instant::now());

    scheduler.shutdown();
    assert_eq!(never.fetch_status(), FutureStatus::ForceCanceled);
}

#[test]
fn counters_settle_after_shutdown() {
    init_tracing();
    let scheduler = Scheduler::new(2).expect("scheduler");

    let counter = Arc::new(AtomicU32::new(0));
    for index in 0..5u32 {
        let counter = Arc::clone(&counter);
        scheduler
            .submit(format!("count-{index}"), TaskPriority::Normal, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("submit");
    }

    assert!(drive(&scheduler, Duration::from_secs(5), || {
        counter.load(Ordering::SeqCst) == 5
    }));
    // one more tick may be needed before the timeline drops the last record
    assert!(drive(&scheduler, Duration::from_secs(5), || scheduler.is_idle()));

    scheduler.shutdown();
    assert_eq!(counter.load(Ordering::SeqCst), 5);
}
