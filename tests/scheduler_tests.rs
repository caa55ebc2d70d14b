//! Submission, group and blocking-wait behaviour of the scheduler

mod common;

use common::TIMEOUT;
use fiber_tasks::prelude::*;
use fiber_tasks::SchedulerListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn counting_tasks(count: usize, counter: &Arc<AtomicUsize>) -> Vec<TaskDesc> {
    (0..count)
        .map(|_| {
            let counter = Arc::clone(counter);
            TaskDesc::new(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect()
}

/// A task that spins until `release` is set
fn blocking_task(release: &Arc<AtomicBool>) -> TaskDesc {
    let release = Arc::clone(release);
    TaskDesc::new(move |_| {
        while !release.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(1));
        }
    })
}

#[test]
fn test_group_completion_counts_every_task() {
    let scheduler = common::scheduler(4);
    let group = scheduler.create_group().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    scheduler.submit(group, counting_tasks(1000, &counter)).unwrap();

    assert!(scheduler.wait_group(group, TIMEOUT));
    assert_eq!(counter.load(Ordering::Relaxed), 1000);
    assert_eq!(scheduler.group_in_progress(group).unwrap(), 0);
    scheduler.release_group(group).unwrap();
}

#[test]
fn test_fewer_tasks_than_workers() {
    let scheduler = common::scheduler(8);
    let counter = Arc::new(AtomicUsize::new(0));

    scheduler
        .submit(TaskGroup::DEFAULT, counting_tasks(3, &counter))
        .unwrap();

    assert!(scheduler.wait_group(TaskGroup::DEFAULT, TIMEOUT));
    assert_eq!(counter.load(Ordering::Relaxed), 3);
}

#[test]
fn test_groups_complete_independently() {
    let scheduler = common::scheduler(4);
    let release = Arc::new(AtomicBool::new(false));
    let fast = scheduler.create_group().unwrap();
    let slow = scheduler.create_group().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    scheduler.submit(slow, vec![blocking_task(&release)]).unwrap();
    scheduler.submit(fast, counting_tasks(100, &counter)).unwrap();

    assert!(scheduler.wait_group(fast, TIMEOUT));
    assert_eq!(counter.load(Ordering::Relaxed), 100);
    assert_eq!(scheduler.group_in_progress(slow).unwrap(), 1);
    assert!(!scheduler.wait_all(Duration::ZERO));

    release.store(true, Ordering::Release);
    assert!(scheduler.wait_group(slow, TIMEOUT));
    assert!(scheduler.wait_all(TIMEOUT));
}

#[test]
fn test_wait_group_times_out() {
    let scheduler = common::scheduler(2);
    let group = scheduler.create_group().unwrap();
    let release = Arc::new(AtomicBool::new(false));

    scheduler.submit(group, vec![blocking_task(&release)]).unwrap();

    let timeout = Duration::from_millis(50);
    let start = Instant::now();
    assert!(!scheduler.wait_group(group, timeout));
    let elapsed = start.elapsed();
    assert!(elapsed >= timeout);
    assert!(elapsed < TIMEOUT);

    release.store(true, Ordering::Release);
    assert!(scheduler.wait_group(group, TIMEOUT));
}

#[test]
fn test_wait_all_covers_every_group() {
    let scheduler = common::scheduler(3);
    let counter = Arc::new(AtomicUsize::new(0));
    let groups: Vec<TaskGroup> = (0..4).map(|_| scheduler.create_group().unwrap()).collect();

    for group in &groups {
        scheduler.submit(*group, counting_tasks(50, &counter)).unwrap();
    }

    assert!(scheduler.wait_all(TIMEOUT));
    assert_eq!(counter.load(Ordering::Relaxed), 200);
    for group in groups {
        assert_eq!(scheduler.group_in_progress(group).unwrap(), 0);
        scheduler.release_group(group).unwrap();
    }
}

#[test]
fn test_group_table_exhaustion() {
    let scheduler = common::scheduler(1);
    let capacity = scheduler.group_capacity();

    // One slot is the pre-reserved default group.
    let groups: Vec<TaskGroup> = (1..capacity).map(|_| scheduler.create_group().unwrap()).collect();
    assert!(matches!(
        scheduler.create_group(),
        Err(Error::ResourceExhausted { .. })
    ));

    scheduler.release_group(groups[0]).unwrap();
    assert!(scheduler.create_group().is_ok());
}

#[test]
fn test_release_busy_group_rejected() {
    let scheduler = common::scheduler(2);
    let group = scheduler.create_group().unwrap();
    let release = Arc::new(AtomicBool::new(false));

    scheduler.submit(group, vec![blocking_task(&release)]).unwrap();
    assert!(matches!(
        scheduler.release_group(group),
        Err(Error::InvalidUsage { .. })
    ));

    release.store(true, Ordering::Release);
    assert!(scheduler.wait_group(group, TIMEOUT));
    scheduler.release_group(group).unwrap();
    assert!(scheduler.release_group(group).is_err());
    assert!(scheduler.release_group(TaskGroup::DEFAULT).is_err());
}

#[test]
fn test_blocking_api_rejected_inside_tasks() {
    let scheduler = Arc::new(common::scheduler(2));
    let observed = common::log();

    let task_scheduler = Arc::clone(&scheduler);
    let task_observed = Arc::clone(&observed);
    scheduler
        .submit(
            TaskGroup::DEFAULT,
            vec![TaskDesc::new(move |ctx| {
                let mut observed = task_observed.lock();
                observed.push(("context is worker", ctx.is_worker_thread()));
                observed.push(("scheduler is worker", task_scheduler.is_worker_thread()));
                observed.push((
                    "submit rejected",
                    task_scheduler
                        .submit(TaskGroup::DEFAULT, vec![TaskDesc::new(|_| {})])
                        .is_err(),
                ));
                observed.push((
                    "wait_group rejected",
                    !task_scheduler.wait_group(TaskGroup::DEFAULT, Duration::ZERO),
                ));
                observed.push(("wait_all rejected", !task_scheduler.wait_all(Duration::ZERO)));
            })],
        )
        .unwrap();

    assert!(scheduler.wait_all(TIMEOUT));
    let observed = observed.lock();
    assert_eq!(observed.len(), 5);
    for (what, held) in observed.iter() {
        assert!(held, "{}", what);
    }
    assert!(!scheduler.is_worker_thread());
}

#[test]
fn test_run_async_from_task() {
    let scheduler = common::scheduler(4);
    let outer = scheduler.create_group().unwrap();
    let inner = scheduler.create_group().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    let task_counter = Arc::clone(&counter);
    scheduler
        .submit(
            outer,
            vec![TaskDesc::new(move |ctx| {
                ctx.run_async(inner, counting_tasks(64, &task_counter)).unwrap();
            })],
        )
        .unwrap();

    assert!(scheduler.wait_group(outer, TIMEOUT));
    assert!(scheduler.wait_group(inner, TIMEOUT));
    assert_eq!(counter.load(Ordering::Relaxed), 64);
}

#[test]
fn test_panicking_task_still_completes_group() {
    let scheduler = common::scheduler(2);
    let group = scheduler.create_group().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    let mut tasks = counting_tasks(10, &counter);
    tasks.push(TaskDesc::new(|_| panic!("task failure")).with_label("panicker"));
    scheduler.submit(group, tasks).unwrap();

    assert!(scheduler.wait_group(group, TIMEOUT));
    assert_eq!(counter.load(Ordering::Relaxed), 10);
    assert_eq!(scheduler.stats().tasks_completed, 11);
}

#[test]
fn test_stats_track_submissions() {
    let scheduler = common::scheduler(2);
    let counter = Arc::new(AtomicUsize::new(0));

    scheduler
        .submit(TaskGroup::DEFAULT, counting_tasks(25, &counter))
        .unwrap();
    assert!(scheduler.wait_all(TIMEOUT));
    assert!(common::wait_until(TIMEOUT, || scheduler.is_empty()));

    let stats = scheduler.stats();
    assert_eq!(stats.tasks_submitted, 25);
    assert_eq!(stats.tasks_completed, 25);
}

#[derive(Default)]
struct CountingListener {
    workers_started: AtomicUsize,
    workers_stopped: AtomicUsize,
    tasks_started: AtomicUsize,
    tasks_finished: AtomicUsize,
}

impl SchedulerListener for CountingListener {
    fn on_worker_started(&self, _worker: usize) {
        self.workers_started.fetch_add(1, Ordering::Relaxed);
    }

    fn on_worker_stopped(&self, _worker: usize) {
        self.workers_stopped.fetch_add(1, Ordering::Relaxed);
    }

    fn on_task_started(&self, _worker: usize, _label: &'static str, _color: u32) {
        self.tasks_started.fetch_add(1, Ordering::Relaxed);
    }

    fn on_task_finished(&self, _worker: usize, label: &'static str) {
        assert_eq!(label, "observed");
        self.tasks_finished.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn test_listener_sees_tasks_and_workers() {
    let listener = Arc::new(CountingListener::default());
    let scheduler = TaskScheduler::new(SchedulerConfig {
        listener: Some(listener.clone()),
        ..common::config(3)
    })
    .unwrap();

    let tasks = (0..20).map(|_| TaskDesc::new(|_| {}).with_label("observed"));
    scheduler.submit(TaskGroup::DEFAULT, tasks).unwrap();
    assert!(scheduler.wait_all(TIMEOUT));

    assert_eq!(listener.tasks_finished.load(Ordering::Relaxed), 20);
    assert!(listener.tasks_started.load(Ordering::Relaxed) >= 20);

    drop(scheduler);
    assert_eq!(listener.workers_started.load(Ordering::Relaxed), 3);
    assert_eq!(listener.workers_stopped.load(Ordering::Relaxed), 3);
}
