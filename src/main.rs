use jobfiber::{Job, JobSystem, JobSystemConfig, Priority, TraceProfiler};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

fn main() {
    println!("jobfiber - Fiber-Based Priority Job Scheduler\n");

    let config = JobSystemConfig::with_threads(4);
    let profiler = Arc::new(TraceProfiler::new(config.worker_count() + 1));
    let job_system = match JobSystem::with_profiler(config, profiler.clone()) {
        Ok(system) => system,
        Err(e) => {
            eprintln!("Failed to start job system: {}", e);
            return;
        }
    };
    println!("Initialized job system with {} worker threads\n", job_system.num_workers());

    // Example 1: a single task runs inline on the host thread
    println!("Example 1: Single task");
    let hello = Job::new("hello", 1, |_, ctx| {
        println!("  Hello from thread {}", ctx.thread_index());
    });
    report(job_system.do_and_wait(&hello));

    // Example 2: parallel tasks, each writing its own slot
    println!("Example 2: Parallel computation");
    let slots: Vec<AtomicU64> = (0..10_000).map(|_| AtomicU64::new(0)).collect();
    let start = Instant::now();
    let squares = Job::new("squares", slots.len(), |i, _| {
        slots[i].store((i * i) as u64, Ordering::Relaxed);
    })
    .with_priority(Priority::High);
    report(job_system.do_and_wait(&squares));
    let sum: u64 = slots.iter().map(|s| s.load(Ordering::Relaxed)).sum();
    println!("  {} tasks in {:?}, sum = {}\n", slots.len(), start.elapsed(), sum);

    // Example 3: nested jobs and scratch memory
    println!("Example 3: Nested jobs with labeled scratch memory");
    let total = AtomicUsize::new(0);
    let outer = Job::new("outer", 8, |_, ctx| {
        let label = ctx.get_unused_label_with_guard("scratch");
        let inner = Job::batched("inner", 16, 256, |item, ctx| {
            if let Ok(block) = ctx.alloc::<u32>(label.label(), 4) {
                // SAFETY: the block was just allocated for this task.
                unsafe { block.write(0, item as u32) };
            }
            total.fetch_add(1, Ordering::Relaxed);
        });
        if let Err(e) = ctx.do_and_wait(&inner) {
            ctx.print_debug(format_args!("inner job failed: {}", e));
        }
    });
    report(job_system.do_and_wait(&outer));
    println!("  Inner items processed: {} (expected {})\n", total.load(Ordering::Relaxed), 8 * 256);

    println!("Profiler recorded {} marks", profiler.events().len());
    if let Err(e) = profiler.export_to_file("jobfiber_trace.json") {
        eprintln!("Trace export failed: {}", e);
    }

    println!("Shutting down job system...");
    match job_system.shutdown() {
        Ok(()) => println!("Done!"),
        Err(e) => eprintln!("Shutdown error: {}", e),
    }
}

fn report(result: Result<(), jobfiber::SchedulerError>) {
    match result {
        Ok(()) => println!("  Job completed"),
        Err(e) => eprintln!("  Job failed: {}", e),
    }
}
