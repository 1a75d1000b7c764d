//! futures.rs
//!
//! The future surface end-to-end: thread-pool offload, multi-future wait
//! modes, completion-order iteration, and the task-based executor.

use frond::{
    as_completed, sleep, spawn, wait, Executor, EventLoop, FutureError, ReturnWhen, SharedError,
    TaskPoolExecutor,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn shared_error(text: &str) -> SharedError {
    Arc::new(std::io::Error::new(std::io::ErrorKind::Other, text.to_string()))
}

#[test]
fn test_threadpool_resumes_caller_with_result() {
    let lp = EventLoop::new().unwrap();
    let observed = Arc::new(Mutex::new(None));

    let seen = observed.clone();
    spawn(move || {
        let pool = EventLoop::current().threadpool();
        let future = pool.spawn(|| {
            thread::sleep(Duration::from_millis(20));
            Ok(40 + 2)
        });
        *seen.lock() = Some(future.get(None));
        Ok(())
    });

    lp.run().unwrap();
    assert!(matches!(*observed.lock(), Some(Ok(42))));
    lp.destroy().unwrap();
}

#[test]
fn test_threadpool_panic_surfaces_as_failure() {
    let lp = EventLoop::new().unwrap();
    let observed = Arc::new(Mutex::new(None));

    let seen = observed.clone();
    spawn(move || {
        let pool = EventLoop::current().threadpool();
        let future: frond::Future<u32> = pool.spawn(|| panic!("kaboom"));
        *seen.lock() = Some(future.get(None));
        Ok(())
    });

    lp.run().unwrap();
    assert!(matches!(
        *observed.lock(),
        Some(Err(FutureError::Failed(_)))
    ));
    lp.destroy().unwrap();
}

#[test]
fn test_wait_first_completed_returns_only_the_fast_one() {
    let lp = EventLoop::new().unwrap();
    let observed = Arc::new(Mutex::new(None));

    let seen = observed.clone();
    let lp_in_task = lp.clone();
    spawn(move || {
        let pool = EventLoop::current().threadpool();
        let mut futures = vec![pool.spawn(|| {
            thread::sleep(Duration::from_millis(10));
            Ok(1u32)
        })];
        for _ in 0..100 {
            futures.push(pool.spawn(|| {
                thread::sleep(Duration::from_secs(30));
                Ok(0u32)
            }));
        }
        let (done, not_done) = wait(&futures, None, ReturnWhen::FirstCompleted)?;
        let first = done.first().and_then(|f| f.get(None).ok());
        *seen.lock() = Some((done.len(), not_done.len(), first));
        // The slow workers are still parked on their naps; leave by force.
        lp_in_task.stop().expect("stop");
        Ok(())
    });

    lp.run().unwrap();
    assert_eq!(*observed.lock(), Some((1, 100, Some(1))));
    lp.destroy().unwrap();
}

#[test]
fn test_wait_all_completed() {
    let lp = EventLoop::new().unwrap();
    let observed = Arc::new(Mutex::new(None));

    let seen = observed.clone();
    spawn(move || {
        let pool = EventLoop::current().threadpool();
        let futures: Vec<_> = (0..4u32)
            .map(|i| {
                pool.spawn(move || {
                    thread::sleep(Duration::from_millis(5 * u64::from(i)));
                    Ok(i)
                })
            })
            .collect();
        let (done, not_done) = wait(&futures, None, ReturnWhen::AllCompleted)?;
        *seen.lock() = Some((done.len(), not_done.len()));
        Ok(())
    });

    lp.run().unwrap();
    assert_eq!(*observed.lock(), Some((4, 0)));
    lp.destroy().unwrap();
}

#[test]
fn test_wait_first_exception_stops_early() {
    let lp = EventLoop::new().unwrap();
    let observed = Arc::new(Mutex::new(None));

    let seen = observed.clone();
    let lp_in_task = lp.clone();
    spawn(move || {
        let pool = EventLoop::current().threadpool();
        let futures = vec![
            pool.spawn(|| {
                thread::sleep(Duration::from_millis(10));
                Err(shared_error("deliberate"))
            }),
            pool.spawn(|| {
                thread::sleep(Duration::from_secs(30));
                Ok(0u32)
            }),
        ];
        let (done, _) = wait(&futures, None, ReturnWhen::FirstException)?;
        let failed = done
            .iter()
            .any(|f| matches!(f.get(None), Err(FutureError::Failed(_))));
        *seen.lock() = Some(failed);
        lp_in_task.stop().expect("stop");
        Ok(())
    });

    lp.run().unwrap();
    assert_eq!(*observed.lock(), Some(true));
    lp.destroy().unwrap();
}

#[test]
fn test_as_completed_yields_in_completion_order() {
    let lp = EventLoop::new().unwrap();
    let observed = Arc::new(Mutex::new(Vec::new()));

    let seen = observed.clone();
    spawn(move || {
        let pool = EventLoop::current().threadpool();
        let delays = [50u64, 10, 30];
        let futures: Vec<_> = delays
            .iter()
            .map(|&ms| {
                pool.spawn(move || {
                    thread::sleep(Duration::from_millis(ms));
                    Ok(ms)
                })
            })
            .collect();
        for item in as_completed(&futures, None)? {
            let future = item.expect("completion");
            seen.lock().push(future.get(None).expect("value"));
        }
        Ok(())
    });

    lp.run().unwrap();
    assert_eq!(*observed.lock(), vec![10, 30, 50]);
    lp.destroy().unwrap();
}

#[test]
fn test_task_pool_executor_runs_and_shuts_down() {
    let lp = EventLoop::new().unwrap();
    let observed = Arc::new(Mutex::new(None));

    let seen = observed.clone();
    spawn(move || {
        let executor = TaskPoolExecutor::new(2);
        let futures: Vec<_> = (1..=3u32)
            .map(|i| {
                executor.submit(move || {
                    sleep(Duration::from_millis(5)).map_err(|e| Arc::new(e) as SharedError)?;
                    Ok(i * 10)
                })
            })
            .collect();
        let total: u32 = futures
            .iter()
            .map(|f| f.get(None).expect("value"))
            .sum();
        executor.shutdown(true)?;
        *seen.lock() = Some(total);
        Ok(())
    });

    lp.run().unwrap();
    assert_eq!(*observed.lock(), Some(60));
    lp.destroy().unwrap();
}

#[test]
fn test_task_pool_cancel_before_start() {
    let lp = EventLoop::new().unwrap();
    let observed = Arc::new(Mutex::new(None));

    let seen = observed.clone();
    spawn(move || {
        let executor = TaskPoolExecutor::new(1);
        // The single worker is busy with the first item, so the second sits
        // queued and can still be cancelled.
        let busy = executor.submit(|| {
            sleep(Duration::from_millis(50)).map_err(|e| Arc::new(e) as SharedError)?;
            Ok(1u32)
        });
        let doomed = executor.submit(|| Ok(2u32));
        let cancelled = doomed.cancel()?;
        let outcome = doomed.get(None);
        let kept = busy.get(None).expect("busy result");
        *seen.lock() = Some((cancelled, matches!(outcome, Err(FutureError::Cancelled)), kept));
        executor.shutdown(true)?;
        Ok(())
    });

    lp.run().unwrap();
    assert_eq!(*observed.lock(), Some((true, true, 1)));
    lp.destroy().unwrap();
}
