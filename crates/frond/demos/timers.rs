//! Timers, timeouts and cooperative hand-off in one loop.
//!
//! Run with `cargo run --example timers`.

use frond::{sleep, spawn, with_timeout, Event, EventLoop};
use std::time::{Duration, Instant};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let lp = EventLoop::new().expect("event loop");
    let started = Instant::now();
    let gate = Event::new();

    let tick = lp.call_repeatedly(Duration::from_millis(100), move || {
        println!("tick at {:?}", started.elapsed());
    });

    let waiting = gate.clone();
    spawn(move || {
        println!("waiting on the gate...");
        waiting.wait(None)?;
        println!("gate opened at {:?}", started.elapsed());
        Ok(())
    });

    let opening = gate.clone();
    spawn(move || {
        sleep(Duration::from_millis(250))?;
        opening.set();
        Ok(())
    });

    spawn(move || {
        let outcome = with_timeout(Some(Duration::from_millis(300)), || {
            sleep(Duration::from_secs(60))
        })?;
        match outcome {
            Some(()) => println!("nap finished (unexpected)"),
            None => println!("nap cut short at {:?}", started.elapsed()),
        }
        tick.cancel();
        Ok(())
    });

    lp.run().expect("run");
    lp.destroy().expect("destroy");
}
