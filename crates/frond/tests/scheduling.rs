//! scheduling.rs
//!
//! End-to-end scheduler behavior: ready-queue ordering, event wakeups,
//! timeouts, task kill, signals, and cross-thread wakeup. Assertions happen
//! after `run()` against state the tasks recorded, so a failing task cannot
//! be mistaken for a passing test.

use frond::{
    sleep, spawn, with_timeout, Barrier, Channel, ChannelError, Event, EventLoop, Semaphore,
};
use parking_lot::Mutex;
use signal_hook::consts::SIGUSR1;
use signal_hook::low_level::raise;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_sleep_zero_round_robin_order() {
    let lp = EventLoop::new().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 1..=3u32 {
        let order = order.clone();
        spawn(move || {
            order.lock().push(i);
            sleep(Duration::ZERO)?;
            order.lock().push(i);
            Ok(())
        });
    }
    lp.run().unwrap();
    assert_eq!(*order.lock(), vec![1, 2, 3, 1, 2, 3]);
    lp.destroy().unwrap();
}

#[test]
fn test_event_wakes_waiter() {
    let lp = EventLoop::new().unwrap();
    let event = Event::new();
    let observed = Arc::new(Mutex::new(None));

    let waiting = event.clone();
    let seen = observed.clone();
    spawn(move || {
        *seen.lock() = Some(waiting.wait(None)?);
        Ok(())
    });
    let setting = event.clone();
    spawn(move || {
        setting.set();
        Ok(())
    });

    lp.run().unwrap();
    assert_eq!(*observed.lock(), Some(true));
    assert!(event.is_set());
    lp.destroy().unwrap();
}

#[test]
fn test_event_wait_times_out() {
    let lp = EventLoop::new().unwrap();
    let event = Event::new();
    let observed = Arc::new(Mutex::new(None));

    let waiting = event.clone();
    let seen = observed.clone();
    spawn(move || {
        *seen.lock() = Some(waiting.wait(Some(Duration::from_millis(20)))?);
        Ok(())
    });

    lp.run().unwrap();
    assert_eq!(*observed.lock(), Some(false));
    lp.destroy().unwrap();
}

#[test]
fn test_timeout_interrupts_sleep() {
    let lp = EventLoop::new().unwrap();
    let observed = Arc::new(Mutex::new(None));

    let seen = observed.clone();
    spawn(move || {
        let bounded = with_timeout(Some(Duration::from_millis(10)), || {
            sleep(Duration::from_secs(10))
        })?;
        let unbounded = with_timeout(None, || sleep(Duration::from_millis(10)))?;
        *seen.lock() = Some((bounded.is_none(), unbounded.is_some()));
        Ok(())
    });

    let started = Instant::now();
    lp.run().unwrap();
    // The ten second sleep must have been cut short.
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(*observed.lock(), Some((true, true)));
    lp.destroy().unwrap();
}

#[test]
fn test_nested_timeouts_keep_identity() {
    let lp = EventLoop::new().unwrap();
    let observed = Arc::new(Mutex::new(None));

    let seen = observed.clone();
    spawn(move || {
        // The inner scope is generous, the outer one fires first; the outer
        // scope must swallow its own expiry and nobody else's.
        let outer = with_timeout(Some(Duration::from_millis(10)), || {
            let inner = with_timeout(Some(Duration::from_secs(30)), || {
                sleep(Duration::from_secs(30))
            })?;
            Ok(inner.is_some())
        })?;
        *seen.lock() = Some(outer);
        Ok(())
    });

    lp.run().unwrap();
    assert_eq!(*observed.lock(), Some(None));
    lp.destroy().unwrap();
}

#[test]
fn test_kill_before_start_skips_body() {
    let lp = EventLoop::new().unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let observed = ran.clone();
    let task = spawn(move || {
        observed.store(true, Ordering::SeqCst);
        Ok(())
    });
    task.kill();
    lp.run().unwrap();
    assert!(!ran.load(Ordering::SeqCst));
    assert!(task.join(None).unwrap());
    lp.destroy().unwrap();
}

#[test]
fn test_kill_interrupts_sleeping_task() {
    let lp = EventLoop::new().unwrap();
    let finished = Arc::new(AtomicBool::new(false));

    let observed = finished.clone();
    let sleeper = spawn(move || {
        sleep(Duration::from_secs(600))?;
        observed.store(true, Ordering::SeqCst);
        Ok(())
    });
    let victim = sleeper.clone();
    spawn(move || {
        sleep(Duration::from_millis(10))?;
        victim.kill();
        Ok(())
    });

    let started = Instant::now();
    lp.run().unwrap();
    assert!(started.elapsed() < Duration::from_secs(60));
    assert!(!finished.load(Ordering::SeqCst));
    assert!(sleeper.join(None).unwrap());
    lp.destroy().unwrap();
}

#[test]
fn test_semaphore_bounds_concurrency() {
    let lp = EventLoop::new().unwrap();
    let sem = Semaphore::new(2);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        let sem = sem.clone();
        let running = running.clone();
        let peak = peak.clone();
        spawn(move || {
            sem.acquire(true, None)?;
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(10))?;
            running.fetch_sub(1, Ordering::SeqCst);
            sem.release();
            Ok(())
        });
    }

    lp.run().unwrap();
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(sem.available(), 2);
    lp.destroy().unwrap();
}

#[test]
fn test_channel_rendezvous_and_remote_error() {
    let lp = EventLoop::new().unwrap();
    let channel: Channel<u32> = Channel::new();
    let received = Arc::new(Mutex::new(Vec::new()));
    let remote_seen = Arc::new(AtomicBool::new(false));

    let tx = channel.clone();
    spawn(move || {
        tx.send(1)?;
        tx.send(2)?;
        tx.send_error(Arc::new(std::io::Error::new(
            std::io::ErrorKind::Other,
            "wire broke",
        )))?;
        Ok(())
    });
    let rx = channel.clone();
    let seen = received.clone();
    let remote = remote_seen.clone();
    spawn(move || {
        seen.lock().push(rx.recv().expect("first value"));
        seen.lock().push(rx.recv().expect("second value"));
        if let Err(ChannelError::Remote(_)) = rx.recv() {
            remote.store(true, Ordering::SeqCst);
        }
        Ok(())
    });

    lp.run().unwrap();
    assert_eq!(*received.lock(), vec![1, 2]);
    assert!(remote_seen.load(Ordering::SeqCst));
    lp.destroy().unwrap();
}

#[test]
fn test_buffered_channel_blocks_when_full() {
    let lp = EventLoop::new().unwrap();
    let channel: Channel<u32> = Channel::with_capacity(2);
    let sent = Arc::new(AtomicUsize::new(0));
    let drained = Arc::new(Mutex::new(Vec::new()));

    let tx = channel.clone();
    let progress = sent.clone();
    spawn(move || {
        for i in 0..4 {
            tx.send(i)?;
            progress.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    });
    let rx = channel.clone();
    let out = drained.clone();
    let progress = sent.clone();
    spawn(move || {
        // Let the sender run ahead; it can buffer two items, no more.
        sleep(Duration::from_millis(20))?;
        assert_eq!(progress.load(Ordering::SeqCst), 2);
        for _ in 0..4 {
            out.lock().push(rx.recv().expect("value"));
        }
        Ok(())
    });

    lp.run().unwrap();
    assert_eq!(*drained.lock(), vec![0, 1, 2, 3]);
    assert_eq!(sent.load(Ordering::SeqCst), 4);
    lp.destroy().unwrap();
}

#[test]
fn test_barrier_releases_all_parties() {
    let lp = EventLoop::new().unwrap();
    let barrier = Barrier::new(3);
    let indexes = Arc::new(Mutex::new(Vec::new()));

    for i in 0..3u64 {
        let barrier = barrier.clone();
        let indexes = indexes.clone();
        spawn(move || {
            sleep(Duration::from_millis(5 * i))?;
            let index = barrier.wait(None).expect("barrier wait");
            indexes.lock().push(index);
            Ok(())
        });
    }

    lp.run().unwrap();
    let mut seen = indexes.lock().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2]);
    assert!(!barrier.is_broken());
    lp.destroy().unwrap();
}

#[test]
fn test_signal_fires_every_handler_once() {
    let lp = EventLoop::new().unwrap();
    let first = Arc::new(AtomicI32::new(0));
    let second = Arc::new(AtomicI32::new(0));

    let tally = first.clone();
    let one = lp
        .add_signal_handler(SIGUSR1, move || {
            tally.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let tally = second.clone();
    let _two = lp
        .add_signal_handler(SIGUSR1, move || {
            tally.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let lp_for_task = lp.clone();
    spawn(move || {
        raise(SIGUSR1).expect("raise");
        sleep(Duration::from_millis(100))?;
        // Both handlers observed the first delivery; drop one and deliver
        // again.
        one.cancel();
        raise(SIGUSR1).expect("raise");
        sleep(Duration::from_millis(100))?;
        lp_for_task.stop().expect("stop");
        Ok(())
    });

    lp.run().unwrap();
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 2);
    lp.destroy().unwrap();
}

#[test]
fn test_cross_thread_stop_wakes_run_forever() {
    let lp = EventLoop::new().unwrap();
    let stopper = lp.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        let target = stopper.clone();
        stopper.call_from_thread(move || {
            target.stop().expect("stop");
        });
    });

    let started = Instant::now();
    lp.run_forever().unwrap();
    // Bounded wakeup: the waker must interrupt the idle poll promptly.
    assert!(started.elapsed() < Duration::from_secs(5));
    handle.join().unwrap();
    lp.destroy().unwrap();
}

#[test]
fn test_task_join_with_timeout() {
    let lp = EventLoop::new().unwrap();
    let observed = Arc::new(Mutex::new(None));

    let slow = spawn(move || {
        sleep(Duration::from_millis(50))?;
        Ok(())
    });
    let waiter = slow.clone();
    let seen = observed.clone();
    spawn(move || {
        let early = waiter.join(Some(Duration::from_millis(5)))?;
        let late = waiter.join(None)?;
        *seen.lock() = Some((early, late));
        Ok(())
    });

    lp.run().unwrap();
    assert_eq!(*observed.lock(), Some((false, true)));
    lp.destroy().unwrap();
}
