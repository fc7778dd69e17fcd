//! Demo and benchmark runners driving the scheduler with simulated robots.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use labflow::area_lock::AreaLocks;
use labflow::types::LockId;
use labflow::{LabConfig, RobotId, Scheduler, SlotRef, Task, Vial, ZoneId, ZoneKey};

const DEMO_CONFIG: &str = include_str!("../config/demo.toml");

const INTAKE_ZONE: ZoneId = 1;
const ARCHIVE_ZONE: ZoneId = 4;
// Highest zone id in the bundled configuration.
const MAX_LOCK: LockId = 10;
const VIALS: u32 = 8;

// Pause between polls that returned nothing to do.
const IDLE_POLL_MS: u64 = 2;
const DEMO_WORK_MS: u64 = 10;
const DEMO_DEADLINE: Duration = Duration::from_secs(10);

/// Best-effort CPU user/system time snapshot (seconds) on Unix platforms.
#[cfg(unix)]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    use libc::{RUSAGE_SELF, getrusage, rusage};
    // SAFETY: rusage is plain old data; getrusage fills it in.
    let mut usage: rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { getrusage(RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return None;
    }
    let user = usage.ru_utime.tv_sec as f64 + (usage.ru_utime.tv_usec as f64 / 1_000_000.0);
    let sys = usage.ru_stime.tv_sec as f64 + (usage.ru_stime.tv_usec as f64 / 1_000_000.0);
    Some((user, sys))
}

#[cfg(not(unix))]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    None
}

/// Concurrent holders per area lock, indexed by lock id.
struct LockMetrics {
    holders: Vec<AtomicUsize>,
    max_holders: AtomicUsize,
    violation: AtomicBool,
}

impl LockMetrics {
    fn new(max_lock: LockId) -> Self {
        Self {
            holders: (0..=max_lock).map(|_| AtomicUsize::new(0)).collect(),
            max_holders: AtomicUsize::new(0),
            violation: AtomicBool::new(false),
        }
    }

    fn enter(&self, lock: LockId) {
        let Some(counter) = self.holders.get(lock as usize) else {
            return;
        };
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if now > 1 {
            self.violation.store(true, Ordering::SeqCst);
        }
        self.max_holders.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self, lock: LockId) {
        if let Some(counter) = self.holders.get(lock as usize) {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn has_violation(&self) -> bool {
        self.violation.load(Ordering::SeqCst)
    }

    fn max_holders(&self) -> usize {
        self.max_holders.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct RobotStats {
    tasks: usize,
    noops: usize,
    errors: usize,
}

struct DriveResult {
    per_robot: Vec<(RobotId, RobotStats)>,
    archived: usize,
    finished: bool,
    lock_violation: bool,
    max_lock_holders: usize,
    elapsed: Duration,
}

/// Zones a task touches, ascending, so robots always lock in the same order.
fn task_locks(task: &Task) -> Vec<LockId> {
    let mut locks = vec![task.curr_zone];
    if task.next_zone != 0 && task.next_zone != task.curr_zone {
        locks.push(task.next_zone);
    }
    locks.sort_unstable();
    locks
}

fn seed_intake(scheduler: &Scheduler) -> labflow::Result<()> {
    for position in 1..=VIALS {
        let mut vial = Vial::new(format!("DEMO-{position:03}"), Some(position % 4 + 1), Some(1));
        vial.next_zone_id = Some(3);
        let at = SlotRef::new(ZoneKey::zone(INTAKE_ZONE), position);
        if !scheduler.place_vial(at, vial)? {
            warn!(%at, "intake slot already occupied");
        }
    }
    Ok(())
}

fn robot_loop(
    scheduler: &Scheduler,
    locks: &AreaLocks,
    metrics: &LockMetrics,
    robot: RobotId,
    work: Duration,
    stop: &AtomicBool,
) -> RobotStats {
    let mut stats = RobotStats::default();
    while !stop.load(Ordering::SeqCst) {
        let task = match scheduler.get_task(robot) {
            Ok(task) => task,
            Err(err) => {
                warn!(robot, error = %err, "poll failed");
                stats.errors += 1;
                thread::sleep(Duration::from_millis(IDLE_POLL_MS));
                continue;
            }
        };
        if task.is_noop() {
            stats.noops += 1;
            thread::sleep(Duration::from_millis(IDLE_POLL_MS));
            continue;
        }
        let held = task_locks(&task);
        for &lock in &held {
            locks.acquire(lock, robot);
            metrics.enter(lock);
        }
        debug!(robot, kind = ?task.kind(), from = task.curr_zone, to = task.next_zone, "executing");
        if !work.is_zero() {
            thread::sleep(work);
        }
        for &lock in held.iter().rev() {
            metrics.leave(lock);
            if !locks.release(lock, robot) {
                warn!(robot, lock, "area lock release failed");
            }
        }
        stats.tasks += 1;
    }
    stats
}

/// Run every configured robot on its own thread until the archive holds all
/// seeded vials or `deadline` passes.
fn drive(scheduler: &Arc<Scheduler>, work: Duration, deadline: Duration) -> DriveResult {
    let robots = scheduler.robots();
    let locks = scheduler.area_locks();
    let metrics = Arc::new(LockMetrics::new(MAX_LOCK));
    let stop = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(robots.len() + 1));
    let mut handles = Vec::new();
    for &robot in &robots {
        let scheduler = Arc::clone(scheduler);
        let locks = Arc::clone(&locks);
        let metrics = Arc::clone(&metrics);
        let stop = Arc::clone(&stop);
        let barrier = Arc::clone(&barrier);
        let handle = thread::Builder::new()
            .name(format!("robot-{robot}"))
            .spawn(move || {
                barrier.wait();
                let stats = robot_loop(&scheduler, &locks, &metrics, robot, work, &stop);
                (robot, stats)
            })
            .expect("failed to spawn robot thread");
        handles.push(handle);
    }

    barrier.wait();
    let start = Instant::now();
    let archive = ZoneKey::zone(ARCHIVE_ZONE);
    let mut finished = false;
    while start.elapsed() < deadline {
        if scheduler.zone_count(archive).unwrap_or(0) >= VIALS as usize {
            finished = true;
            break;
        }
        thread::sleep(Duration::from_millis(IDLE_POLL_MS));
    }
    stop.store(true, Ordering::SeqCst);
    let per_robot = handles
        .into_iter()
        .map(|h| h.join().expect("robot thread panicked"))
        .collect();
    DriveResult {
        per_robot,
        archived: scheduler.zone_count(archive).unwrap_or(0),
        finished,
        lock_violation: metrics.has_violation(),
        max_lock_holders: metrics.max_holders(),
        elapsed: start.elapsed(),
    }
}

fn demo_scheduler() -> labflow::Result<Arc<Scheduler>> {
    let config = LabConfig::from_toml_str(DEMO_CONFIG)?;
    Ok(Arc::new(Scheduler::new(config)?))
}

/// Rack, centrifuge and archive eight vials with two robots.
pub fn run_demo() -> labflow::Result<()> {
    let scheduler = demo_scheduler()?;
    seed_intake(&scheduler)?;
    info!(vials = VIALS, "demo started");
    let result = drive(&scheduler, Duration::from_millis(DEMO_WORK_MS), DEMO_DEADLINE);
    if !result.finished {
        warn!(archived = result.archived, "demo deadline reached");
    }
    let tasks: Vec<usize> = result.per_robot.iter().map(|(_, s)| s.tasks).collect();
    let noops: usize = result.per_robot.iter().map(|(_, s)| s.noops).sum();
    let errors: usize = result.per_robot.iter().map(|(_, s)| s.errors).sum();
    println!("DEMO SUMMARY");
    println!("robots={} vials={VIALS}", result.per_robot.len());
    println!("tasks_per_robot={tasks:?}");
    println!("noop_polls={noops} poll_errors={errors}");
    println!("archived={}", result.archived);
    println!("batch_order={}", scheduler.current_order().unwrap_or(0));
    println!("pending_futures={}", scheduler.pending_futures());
    println!("max_lock_holders={}", result.max_lock_holders);
    println!("lock_violation={}", result.lock_violation);
    println!("elapsed_ms={}", result.elapsed.as_millis());
    Ok(())
}

/// Repeat the demo flow without simulated work and report throughput as CSV.
pub fn run_benchmark(rounds: usize) -> labflow::Result<()> {
    let scheduler = demo_scheduler()?;
    let mut polls = 0usize;
    let mut tasks = 0usize;
    let mut archived = 0usize;
    let mut violation = false;
    let cpu_start = cpu_times_seconds();
    let start = Instant::now();
    for round in 0..rounds {
        scheduler.restart(true);
        seed_intake(&scheduler)?;
        let result = drive(&scheduler, Duration::ZERO, DEMO_DEADLINE);
        if !result.finished {
            warn!(round, archived = result.archived, "benchmark round did not finish");
        }
        for (_, stats) in &result.per_robot {
            polls += stats.tasks + stats.noops + stats.errors;
            tasks += stats.tasks;
        }
        archived += result.archived;
        violation |= result.lock_violation;
    }
    let elapsed_ms = start.elapsed().as_millis() as f64;
    let throughput = if elapsed_ms > 0.0 {
        polls as f64 / (elapsed_ms / 1000.0)
    } else {
        0.0
    };
    let (cpu_user, cpu_sys) = match (cpu_start, cpu_times_seconds()) {
        (Some((user_start, sys_start)), Some((user_end, sys_end))) => (
            format!("{:.4}", user_end - user_start),
            format!("{:.4}", sys_end - sys_start),
        ),
        _ => ("NA".to_string(), "NA".to_string()),
    };
    println!("rounds,polls,tasks,archived,elapsed_ms,polls_per_s,cpu_user_s,cpu_sys_s,lock_violation");
    println!(
        "{rounds},{polls},{tasks},{archived},{elapsed_ms:.2},{throughput:.2},{cpu_user},{cpu_sys},{violation}"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn movement_locks_both_zones_in_order() {
        let task = Task {
            curr_zone: 4,
            next_zone: 3,
            ..Task::default()
        };
        assert_eq!(task_locks(&task), vec![3, 4]);
        let control = Task::control(labflow::TaskType::Start, ZoneKey::subzone(3, 1), 9);
        assert_eq!(task_locks(&control), vec![3]);
    }

    #[test]
    fn lock_metrics_flag_shared_locks() {
        let metrics = LockMetrics::new(4);
        metrics.enter(3);
        metrics.leave(3);
        metrics.enter(3);
        assert!(!metrics.has_violation());
        metrics.enter(3);
        assert!(metrics.has_violation());
        assert_eq!(metrics.max_holders(), 2);
    }

    #[test]
    fn bundled_config_builds() {
        let scheduler = demo_scheduler().expect("demo scheduler");
        assert_eq!(scheduler.robots(), vec![1, 2]);
    }
}
