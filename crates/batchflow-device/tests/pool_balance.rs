//! Buffer pool balance under concurrent acquire/release.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use batchflow_core::{Accelerator, AcceleratorBackend, FlowError, LoadRequest};
use batchflow_device::{BufferPool, BufferRole, HostBackend};

fn load(backend: &HostBackend) -> (Arc<dyn Accelerator>, tempfile::NamedTempFile) {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"functions":{{"fusion_0":{{
            "inputs":[{{"n":1,"c":3,"h":8,"w":8}}],
            "outputs":[{{"n":1,"c":4,"h":16,"w":1}}]}}}}}}"#
    )
    .unwrap();
    let accel = backend
        .load(&LoadRequest {
            model_path: file.path().to_path_buf(),
            function_name: "fusion_0".into(),
            device_id: 0,
            data_parallelism: 1,
        })
        .unwrap();
    (accel, file)
}

#[test]
fn test_single_slot_alternates_between_threads() {
    let backend = HostBackend::new();
    let (accel, _model) = load(&backend);
    let pool = Arc::new(BufferPool::new(accel, BufferRole::Input, 1, vec![256]).unwrap());
    let holders = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let holders = Arc::clone(&holders);
            thread::spawn(move || {
                for _ in 0..200 {
                    let set = pool.lease().unwrap();
                    assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0, "set issued twice");
                    assert_eq!(set.slot(), Some(0));
                    holders.fetch_sub(1, Ordering::SeqCst);
                    drop(set);
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    let stats = pool.stats();
    assert!(stats.is_balanced());
    assert_eq!(stats.acquired_total, 400);
    assert_eq!(stats.high_water, 1);
    pool.destroy().unwrap();
    assert_eq!(backend.live_allocations(), 0);
}

#[test]
fn test_outstanding_never_exceeds_slot_count() {
    let backend = HostBackend::new();
    let (accel, _model) = load(&backend);
    let pool = Arc::new(BufferPool::new(accel, BufferRole::Output, 3, vec![64, 128]).unwrap());

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for _ in 0..50 {
                    let set = pool.acquire().unwrap();
                    assert!(pool.outstanding() <= 3);
                    assert_eq!(set.buffers().len(), 2);
                    thread::yield_now();
                    pool.release(set).unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    let stats = pool.stats();
    assert!(stats.is_balanced());
    assert!(stats.high_water <= 3);
    assert_eq!(stats.free, 3);
}

#[test]
fn test_foreign_set_rejected() {
    let backend = HostBackend::new();
    let (accel, _model) = load(&backend);
    let a = BufferPool::new(Arc::clone(&accel), BufferRole::Input, 1, vec![64]).unwrap();
    let b = BufferPool::new(accel, BufferRole::Input, 1, vec![64]).unwrap();

    let set = a.acquire().unwrap();
    let err = b.release(set).unwrap_err();
    assert!(matches!(err.error, FlowError::PoolImbalance(_)));
    assert_eq!(b.outstanding(), 0);
    assert_eq!(b.stats().released_total, 0);

    // The rejected set comes back intact and its owner can still take it.
    let set = err.set.expect("rejected set handed back");
    assert_eq!(a.outstanding(), 1);
    a.release(set).unwrap();
    assert!(a.stats().is_balanced());
    a.destroy().unwrap();
    b.destroy().unwrap();
    assert_eq!(backend.live_allocations(), 0);
}

#[test]
fn test_destroy_with_outstanding_set_fails() {
    let backend = HostBackend::new();
    let (accel, _model) = load(&backend);
    let pool = Arc::new(BufferPool::new(accel, BufferRole::Input, 2, vec![64]).unwrap());

    let lease = pool.lease().unwrap();
    assert!(matches!(pool.destroy(), Err(FlowError::PoolImbalance(_))));
    lease.release().unwrap();
    pool.destroy().unwrap();
    assert_eq!(backend.live_allocations(), 0);
}

#[test]
fn test_close_wakes_blocked_acquire() {
    let backend = HostBackend::new();
    let (accel, _model) = load(&backend);
    let pool = Arc::new(BufferPool::new(accel, BufferRole::Input, 1, vec![64]).unwrap());
    let held = pool.lease().unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.acquire().map(|_| ()))
    };
    thread::sleep(Duration::from_millis(20));
    pool.close();
    assert!(matches!(waiter.join().unwrap(), Err(FlowError::QueueClosed)));

    // Sets returned after close are freed rather than queued.
    drop(held);
    assert_eq!(pool.available(), 0);
    assert_eq!(backend.live_allocations(), 0);
}
