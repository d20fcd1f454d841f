use jobfiber::fiber::{FiberEntry, PlatformFiber, SwitchReason};
use jobfiber::{
    AllocatorConfig, CorosenseiPlatform, FiberPlatform, Job, JobSystem, JobSystemConfig, MarkerType,
    NullProfiler, Priority, SchedulerConfig, SchedulerError, TraceProfiler,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn config(threads: usize) -> JobSystemConfig {
    JobSystemConfig {
        num_threads: Some(threads),
        scheduler: SchedulerConfig {
            small_fibers: 32,
            large_fibers: 4,
            ..SchedulerConfig::default()
        },
        allocator: AllocatorConfig {
            block_size: 64 * 1024,
            num_blocks: 32,
            max_threads: 8,
        },
        ..JobSystemConfig::default()
    }
}

fn slots(n: usize) -> Vec<AtomicUsize> {
    (0..n).map(|_| AtomicUsize::new(0)).collect()
}

#[test]
fn test_every_task_runs_exactly_once() {
    for threads in 1..=4 {
        let system = JobSystem::new(config(threads)).expect("start");
        let runs = slots(1000);
        let job = Job::new("count", runs.len(), |i, _| {
            runs[i].fetch_add(1, Ordering::Relaxed);
        });

        system.do_and_wait(&job).unwrap();

        assert!(job.has_finished());
        assert!(runs.iter().all(|r| r.load(Ordering::Relaxed) == 1));
        system.shutdown().expect("shutdown");
    }
}

#[test]
fn test_four_workers_fill_slots() {
    let system = JobSystem::new(config(4)).unwrap();
    let values = slots(1000);
    let job = Job::new("fill", values.len(), |i, ctx| {
        assert!(ctx.thread_index() < 4);
        values[i].store(i + 1, Ordering::Relaxed);
    });
    system.do_and_wait(&job).unwrap();

    for (i, value) in values.iter().enumerate() {
        assert_eq!(value.load(Ordering::Relaxed), i + 1);
    }
    system.shutdown().unwrap();
}

#[test]
fn test_concurrent_jobs_from_tasks() {
    const JOBS: usize = 8;
    const TASKS: usize = 100;

    let system = JobSystem::new(config(4)).unwrap();
    let completed = AtomicUsize::new(0);
    let outer = Job::new("outer", JOBS, |_, ctx| {
        let inner = Job::new("inner", TASKS, |_, _| {
            completed.fetch_add(1, Ordering::Relaxed);
        });
        ctx.do_and_wait(&inner).unwrap();
        assert!(inner.has_finished());
    });

    system.do_and_wait(&outer).unwrap();
    assert_eq!(completed.load(Ordering::Relaxed), JOBS * TASKS);
    system.shutdown().unwrap();
}

#[test]
fn test_wait_suspends_fiber_not_thread() {
    // One worker: if waiting blocked the thread, the inner tasks could never run.
    let system = JobSystem::new(config(1)).unwrap();
    let inner_runs = slots(50);
    let outer = Job::new("waiter", 2, |_, ctx| {
        assert!(ctx.fiber_index().is_some());
        let inner = Job::new("waited", inner_runs.len(), |i, _| {
            inner_runs[i].fetch_add(1, Ordering::Relaxed);
        });
        ctx.do_and_wait(&inner).unwrap();
        assert_eq!(ctx.thread_index(), 0);
    });

    system.do_and_wait(&outer).unwrap();
    assert!(inner_runs.iter().all(|r| r.load(Ordering::Relaxed) == 2));
    system.shutdown().unwrap();
}

#[test]
fn test_backpressure_from_host() {
    let system = JobSystem::new(config(2)).unwrap();
    let runs = slots(2000);
    let job = Job::new("flood", runs.len(), |i, _| {
        runs[i].fetch_add(1, Ordering::Relaxed);
    });

    system.do_and_wait(&job).unwrap();
    assert!(runs.iter().all(|r| r.load(Ordering::Relaxed) == 1));
    system.shutdown().unwrap();
}

#[test]
fn test_backpressure_from_fiber() {
    let mut cfg = config(2);
    cfg.scheduler.queue_capacity = 64;
    let system = JobSystem::new(cfg).unwrap();

    let completed = AtomicUsize::new(0);
    let outer = Job::new("producer", 3, |_, ctx| {
        let inner = Job::new("flood", 500, |_, _| {
            completed.fetch_add(1, Ordering::Relaxed);
        });
        ctx.do_and_wait(&inner).unwrap();
    });

    system.do_and_wait(&outer).unwrap();
    assert_eq!(completed.load(Ordering::Relaxed), 1500);
    system.shutdown().unwrap();
}

#[test]
fn test_panicking_task_still_finishes_job() {
    let system = JobSystem::new(config(2)).unwrap();
    let runs = slots(10);
    let job = Job::new("faulty", runs.len(), |i, _| {
        runs[i].fetch_add(1, Ordering::Relaxed);
        if i == 3 {
            panic!("task {} failed", i);
        }
    });

    system.do_and_wait(&job).unwrap();
    assert!(job.has_finished());
    assert!(runs.iter().all(|r| r.load(Ordering::Relaxed) == 1));
    system.shutdown().unwrap();
}

#[test]
fn test_batched_job_covers_every_item_once() {
    let system = JobSystem::new(config(3)).unwrap();
    let items = slots(1000);
    let job = Job::batched("batched", 64, items.len(), |item, _| {
        items[item].fetch_add(1, Ordering::Relaxed);
    });
    assert_eq!(job.num_tasks(), 16);

    system.do_and_wait(&job).unwrap();
    assert!(items.iter().all(|r| r.load(Ordering::Relaxed) == 1));
    system.shutdown().unwrap();
}

#[test]
fn test_large_stack_jobs_use_large_fibers() {
    let cfg = config(2);
    let small_fibers = cfg.scheduler.small_fibers;
    let system = JobSystem::new(cfg).unwrap();
    let fibers = slots(8);
    let job = Job::new("deep", fibers.len(), |i, ctx| {
        fibers[i].store(ctx.fiber_index().unwrap_or(0), Ordering::Relaxed);
    })
    .with_large_stack();

    system.do_and_wait(&job).unwrap();
    assert!(fibers.iter().all(|f| f.load(Ordering::Relaxed) >= small_fibers));
    system.shutdown().unwrap();
}

#[test]
fn test_large_stack_waiters_beyond_large_fibers() {
    // More large-stack tasks than large fibers, each waiting on small-stack
    // children: blocked large tasks must not keep the children from starting.
    let mut cfg = config(2);
    cfg.scheduler.small_fibers = 16;
    cfg.scheduler.large_fibers = 2;
    let system = JobSystem::new(cfg).unwrap();

    let leaf_runs = AtomicUsize::new(0);
    let outer = Job::new("deep_waiter", 8, |_, ctx| {
        let leaf = Job::new("leaf", 4, |_, _| {
            leaf_runs.fetch_add(1, Ordering::Relaxed);
        });
        ctx.do_and_wait(&leaf).unwrap();
    })
    .with_large_stack();

    system.do_and_wait(&outer).unwrap();
    assert!(outer.has_finished());
    assert_eq!(leaf_runs.load(Ordering::Relaxed), 32);
    system.shutdown().unwrap();
}

#[test]
fn test_all_priorities_complete() {
    let system = JobSystem::new(config(2)).unwrap();
    let context = system.main_context();
    let done = slots(3);

    let high = Job::new("high", 20, |_, _| {
        done[0].fetch_add(1, Ordering::Relaxed);
    })
    .with_priority(Priority::High);
    let medium = Job::new("medium", 20, |_, _| {
        done[1].fetch_add(1, Ordering::Relaxed);
    });
    let low = Job::new("low", 20, |_, _| {
        done[2].fetch_add(1, Ordering::Relaxed);
    })
    .with_priority(Priority::Low);

    unsafe {
        context.do_job(&low).unwrap();
        context.do_job(&medium).unwrap();
        context.do_job(&high).unwrap();
    }
    context.wait(&low).unwrap();
    context.wait(&medium).unwrap();
    context.wait(&high).unwrap();

    assert!(done.iter().all(|d| d.load(Ordering::Relaxed) == 20));
    drop(context);
    system.shutdown().unwrap();
}

#[test]
fn test_resubmit_requires_reset() {
    let system = JobSystem::new(config(2)).unwrap();
    let runs = AtomicUsize::new(0);
    let mut job = Job::new("again", 4, |_, _| {
        runs.fetch_add(1, Ordering::Relaxed);
    });

    system.do_and_wait(&job).unwrap();
    assert!(matches!(
        system.do_and_wait(&job),
        Err(SchedulerError::JobAlreadySubmitted { name: "again" })
    ));

    job.reset();
    system.do_and_wait(&job).unwrap();
    assert_eq!(runs.load(Ordering::Relaxed), 8);
    system.shutdown().unwrap();
}

#[test]
fn test_empty_job_finishes_immediately() {
    let system = JobSystem::new(config(1)).unwrap();
    let job = Job::new("empty", 0, |_, _| {});
    system.do_and_wait(&job).unwrap();
    assert!(job.has_finished());
    system.shutdown().unwrap();
}

#[test]
fn test_profiler_sees_every_task() {
    let profiler = Arc::new(TraceProfiler::new(8));
    let system = JobSystem::with_profiler(config(2), profiler.clone()).unwrap();
    let job = Job::new("traced", 6, |_, ctx| {
        let _mark = ctx.create_profile_mark_guard("work", 9);
    });
    system.do_and_wait(&job).unwrap();
    system.shutdown().unwrap();

    let events = profiler.events();
    let count = |marker: MarkerType| {
        events
            .iter()
            .filter(|e| e.marker == marker && e.name == Some("traced"))
            .count()
    };
    assert_eq!(count(MarkerType::Begin), 6);
    assert_eq!(count(MarkerType::End), 6);
    let functions = events.iter().filter(|e| e.marker == MarkerType::BeginFunction).count();
    assert_eq!(functions, 6);
}

/// Wraps the default platform and counts every switch into a fiber.
struct CountingPlatform {
    switches: Arc<AtomicUsize>,
}

struct CountingFiber {
    inner: Box<dyn PlatformFiber>,
    switches: Arc<AtomicUsize>,
}

impl PlatformFiber for CountingFiber {
    fn switch_in(&mut self) -> SwitchReason {
        self.switches.fetch_add(1, Ordering::SeqCst);
        self.inner.switch_in()
    }
}

impl FiberPlatform for CountingPlatform {
    fn create_fiber(
        &self,
        stack_size: usize,
        entry: FiberEntry,
    ) -> Result<Box<dyn PlatformFiber>, SchedulerError> {
        Ok(Box::new(CountingFiber {
            inner: CorosenseiPlatform.create_fiber(stack_size, entry)?,
            switches: Arc::clone(&self.switches),
        }))
    }
}

#[test]
fn test_single_task_do_and_wait_runs_inline() {
    let switches = Arc::new(AtomicUsize::new(0));
    let platform = CountingPlatform {
        switches: Arc::clone(&switches),
    };
    // One worker, so nothing else switches fibers while the outer task runs.
    let system = JobSystem::with_platform(config(1), &platform, Arc::new(NullProfiler)).unwrap();

    let deltas = slots(2);
    let inner_fibers = slots(2);
    let outer = Job::new("outer", 2, |i, ctx| {
        let before = switches.load(Ordering::SeqCst);
        let inner = Job::new("inline", 1, |_, inner_ctx| {
            inner_fibers[i].store(inner_ctx.fiber_index().unwrap_or(usize::MAX), Ordering::Relaxed);
        });
        ctx.do_and_wait(&inner).unwrap();
        deltas[i].store(switches.load(Ordering::SeqCst) - before, Ordering::Relaxed);
        assert_eq!(inner_fibers[i].load(Ordering::Relaxed), ctx.fiber_index().unwrap_or(usize::MAX));
    });

    system.do_and_wait(&outer).unwrap();
    assert!(deltas.iter().all(|d| d.load(Ordering::Relaxed) == 0));
    assert!(switches.load(Ordering::SeqCst) >= 2);
    system.shutdown().unwrap();
}

#[test]
fn test_wait_on_unsubmitted_job_is_an_error() {
    let system = JobSystem::new(config(1)).unwrap();
    let job = Job::new("lonely", 3, |_, _| {});
    assert!(matches!(
        system.main_context().wait(&job),
        Err(SchedulerError::JobNotSubmitted { name: "lonely" })
    ));
    system.shutdown().unwrap();
}
