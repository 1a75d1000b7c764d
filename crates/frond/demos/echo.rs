//! Line echo server with a self-test client.
//!
//! Run with `cargo run --example echo`. Serves on an ephemeral port, echoes
//! newline-delimited messages, and drives a couple of clients through it.

use frond::io::tcp::{TcpClient, TcpServer};
use frond::{sleep, spawn, EventLoop};
use std::time::Duration;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let lp = EventLoop::new().expect("event loop");
    let server = TcpServer::bind("127.0.0.1:0".parse().unwrap()).expect("bind");
    let addr = server.local_addr();
    println!("echo server on {addr}");

    let serving = server.clone();
    spawn(move || {
        serving
            .serve(|conn| {
                spawn(move || {
                    loop {
                        let line = match conn.read_until(b"\n") {
                            Ok(line) if line.is_empty() => break,
                            Ok(line) => line,
                            Err(e) => {
                                eprintln!("connection failed: {e}");
                                break;
                            }
                        };
                        if conn.write(&line).is_err() {
                            break;
                        }
                    }
                    Ok(())
                });
            })
            .expect("serve");
        Ok(())
    });

    let closer = server.clone();
    spawn(move || {
        for i in 0..3 {
            let client = TcpClient::connect(addr).expect("connect");
            let message = format!("hello {i}\n");
            client.write(message.as_bytes()).expect("write");
            let reply = client.read_until(b"\n").expect("read");
            print!("<- {}", String::from_utf8_lossy(&reply));
            client.close();
            sleep(Duration::from_millis(50))?;
        }
        closer.close();
        Ok(())
    });

    lp.run().expect("run");
    lp.destroy().expect("destroy");
}
