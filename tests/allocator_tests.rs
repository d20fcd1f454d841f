use jobfiber::allocator::{LabelMap, StackAllocator};
use jobfiber::{AllocError, AllocatorConfig, Job, JobSystem, JobSystemConfig, Label, SchedulerConfig};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

const BLOCK: usize = 16 * 1024;

fn system(threads: usize, blocks: usize) -> JobSystem {
    JobSystem::new(JobSystemConfig {
        num_threads: Some(threads),
        scheduler: SchedulerConfig {
            small_fibers: 16,
            large_fibers: 2,
            ..SchedulerConfig::default()
        },
        allocator: AllocatorConfig {
            block_size: BLOCK,
            num_blocks: blocks,
            max_threads: 8,
        },
        ..JobSystemConfig::default()
    })
    .unwrap()
}

#[test]
fn test_tasks_allocate_from_thread_arenas() {
    let system = system(4, 32);
    let label = system.allocator().get_unused_label("particles");
    let sums = (0..64).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>();

    let job = Job::new("scratch", sums.len(), |i, ctx| {
        let block = ctx.alloc::<usize>(label, 32).unwrap();
        let values = unsafe { block.as_uninit_mut() };
        for (k, value) in values.iter_mut().enumerate() {
            value.write(i + k);
        }
        let total: usize = unsafe { block.as_slice() }.iter().sum();
        sums[i].store(total, Ordering::Relaxed);
    });
    system.do_and_wait(&job).unwrap();

    for (i, sum) in sums.iter().enumerate() {
        assert_eq!(sum.load(Ordering::Relaxed), 32 * i + (0..32).sum::<usize>());
    }

    // At most one block per thread that ran a task.
    let used = system.allocator().label_blocks(label);
    assert!(used >= 1 && used <= 5);
    assert_eq!(system.allocator().free(label).unwrap(), used);
    assert_eq!(system.allocator().free_blocks(), 32);
    system.allocator().return_label(label).unwrap();
    system.shutdown().unwrap();
}

#[test]
fn test_label_guard_in_tasks() {
    let system = system(2, 32);
    let job = Job::new("guarded", 8, |_, ctx| {
        let guard = ctx.get_unused_label_with_guard("frame");
        ctx.alloc::<u8>(guard.label(), 100).unwrap();
        ctx.alloc::<u8>(guard.label(), 2 * BLOCK).unwrap();
    });
    system.do_and_wait(&job).unwrap();

    assert_eq!(system.allocator().free_blocks(), 32);
    assert!(system.allocator().label_pool_len() <= 8);
    system.shutdown().unwrap();
}

#[test]
fn test_free_leaves_other_labels_intact() {
    let system = system(1, 16);
    let context = system.main_context();
    let keep = context.get_unused_label("keep");
    let drop_me = context.get_unused_label("drop");

    let kept = context.alloc::<u64>(keep, 4).unwrap();
    unsafe { kept.write(3, 0xfeed) };
    let gone = context.alloc::<u64>(drop_me, 4).unwrap();

    assert_eq!(context.free(drop_me).unwrap(), 1);
    assert!(!system.allocator().is_live(&gone));
    assert!(system.allocator().is_live(&kept));
    assert_eq!(unsafe { kept.read(3) }, 0xfeed);

    assert_eq!(
        context.return_label(keep).unwrap_err(),
        AllocError::LabelInUse { label: keep, blocks: 1 }
    );
    drop(context);
    system.shutdown().unwrap();
}

#[test]
fn test_realloc_through_context() {
    let system = system(1, 16);
    let context = system.main_context();
    let label = context.get_unused_label("grow");

    let mut block = context.alloc::<u32>(label, 1).unwrap();
    for n in 1..=64 {
        unsafe { block.write(n - 1, n as u32) };
        block = context.realloc_array(label, block, n + 1).unwrap();
    }
    let values = unsafe { block.as_slice() };
    assert_eq!(values[..64], (1..=64).collect::<Vec<u32>>()[..]);

    drop(context);
    system.shutdown().unwrap();
}

#[test]
fn test_internal_label_rejected() {
    let system = system(1, 4);
    assert_eq!(
        system.main_context().alloc::<u8>(Label::INTERNAL, 1).unwrap_err(),
        AllocError::InternalLabel
    );
    system.shutdown().unwrap();
}

proptest! {
    #[test]
    fn prop_label_map_matches_hash_map(ops in proptest::collection::vec((0u64..48, any::<bool>()), 1..300)) {
        let mut map = LabelMap::with_capacity(4);
        let mut model = HashMap::new();
        for (i, (raw, insert)) in ops.into_iter().enumerate() {
            let label = Label::new(raw);
            if insert {
                prop_assert_eq!(map.insert(label, i), model.insert(raw, i));
            } else {
                prop_assert_eq!(map.remove(label), model.remove(&raw));
            }
            prop_assert_eq!(map.len(), model.len());
        }
        for (raw, value) in &model {
            prop_assert_eq!(map.get(Label::new(*raw)), Some(value));
        }
    }

    #[test]
    fn prop_nested_guards_restore(depths in proptest::collection::vec(1usize..40, 1..8)) {
        let mut buffer = vec![0u8; 8192];
        let mut stack = StackAllocator::new(&mut buffer);
        let before = stack.used();
        {
            let mut outer = stack.guard().unwrap();
            for n in &depths {
                let mut inner = outer.guard().unwrap();
                inner.alloc::<u32>(*n).unwrap();
            }
            outer.alloc::<u8>(7).unwrap();
        }
        prop_assert_eq!(stack.used(), before);
    }
}
