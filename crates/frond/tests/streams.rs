//! streams.rs
//!
//! Stream end-to-end behavior over real sockets: TCP echo with delimited
//! reads, EOF as clean close, pipe round trips, and datagram endpoints.

use bytes::Bytes;
use frond::io::pipe::{PipeClient, PipeServer};
use frond::io::tcp::{TcpClient, TcpServer};
use frond::io::udp::UdpEndpoint;
use frond::{sleep, spawn, EventLoop};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_tcp_echo_round_trip() {
    let lp = EventLoop::new().unwrap();
    let server = TcpServer::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.local_addr();
    let echoed = Arc::new(Mutex::new(None));
    let server_saw_eof = Arc::new(Mutex::new(None));

    let serving = server.clone();
    let eof_seen = server_saw_eof.clone();
    spawn(move || {
        let eof_seen = eof_seen.clone();
        serving
            .serve(move |conn| {
                let eof_seen = eof_seen.clone();
                spawn(move || {
                    loop {
                        let line = conn.read_until(b"\n").expect("server read");
                        if line.is_empty() {
                            // Clean close from the peer.
                            *eof_seen.lock() = Some(true);
                            break;
                        }
                        conn.write(&line).expect("server write");
                    }
                    Ok(())
                });
            })
            .expect("serve");
        Ok(())
    });

    let closer = server.clone();
    let response = echoed.clone();
    spawn(move || {
        let client = TcpClient::connect(addr).expect("connect");
        client.write(b"PING\n").expect("client write");
        let reply = client.read_until(b"\n").expect("client read");
        *response.lock() = Some(reply);
        client.close();
        // Give the server side a tick to observe the EOF, then shut down.
        sleep(Duration::from_millis(50))?;
        closer.close();
        Ok(())
    });

    lp.run().unwrap();
    assert_eq!(*echoed.lock(), Some(Bytes::from_static(b"PING\n")));
    assert_eq!(*server_saw_eof.lock(), Some(true));
    assert_eq!(server.connection_count(), 0);
    lp.destroy().unwrap();
}

#[test]
fn test_tcp_large_transfer_with_backpressure() {
    let lp = EventLoop::new().unwrap();
    let server = TcpServer::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.local_addr();
    let received = Arc::new(Mutex::new(0usize));

    const TOTAL: usize = 4 * 1024 * 1024;

    let serving = server.clone();
    let progress = received.clone();
    spawn(move || {
        let progress = progress.clone();
        serving
            .serve(move |conn| {
                let progress = progress.clone();
                spawn(move || {
                    loop {
                        let chunk = conn.read_bytes(64 * 1024);
                        match chunk {
                            Ok(data) if data.is_empty() => break,
                            Ok(data) => *progress.lock() += data.len(),
                            Err(_) => break,
                        }
                    }
                    Ok(())
                });
            })
            .expect("serve");
        Ok(())
    });

    let closer = server.clone();
    let progress = received.clone();
    spawn(move || {
        let client = TcpClient::connect(addr).expect("connect");
        let block = vec![0xA5u8; 256 * 1024];
        for _ in 0..(TOTAL / block.len()) {
            // The boolean is the back-pressure signal; a false just means
            // bytes were queued for the background flush.
            let _ = client.write(&block).expect("client write");
        }
        client.shutdown().expect("shutdown waits for drain");
        client.close();
        while *progress.lock() < TOTAL {
            sleep(Duration::from_millis(10))?;
        }
        closer.close();
        Ok(())
    });

    lp.run().unwrap();
    assert_eq!(*received.lock(), TOTAL);
    lp.destroy().unwrap();
}

#[test]
fn test_pipe_round_trip() {
    let lp = EventLoop::new().unwrap();
    let path = std::env::temp_dir().join(format!("frond-pipe-{}", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let server = PipeServer::bind(&path).unwrap();
    let observed = Arc::new(Mutex::new(None));

    let serving = server.clone();
    spawn(move || {
        serving
            .serve(|conn| {
                spawn(move || {
                    let line = conn.read_until(b"\n").expect("pipe read");
                    conn.write(&line).expect("pipe write");
                    Ok(())
                });
            })
            .expect("serve");
        Ok(())
    });

    let closer = server.clone();
    let response = observed.clone();
    let client_path = path.clone();
    spawn(move || {
        let client = PipeClient::connect(&client_path).expect("connect");
        client.write(b"over the pipe\n").expect("write");
        *response.lock() = Some(client.read_until(b"\n").expect("read"));
        client.close();
        closer.close();
        Ok(())
    });

    lp.run().unwrap();
    assert_eq!(
        *observed.lock(),
        Some(Bytes::from_static(b"over the pipe\n"))
    );
    let _ = std::fs::remove_file(&path);
    lp.destroy().unwrap();
}

#[test]
fn test_udp_round_trip() {
    let lp = EventLoop::new().unwrap();
    let alpha = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let beta = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let alpha_addr = alpha.local_addr().unwrap();
    let beta_addr = beta.local_addr().unwrap();
    let observed = Arc::new(Mutex::new(None));

    let receiver = beta.clone();
    let sender = beta.clone();
    let seen = observed.clone();
    spawn(move || {
        let (datagram, from) = receiver.recv_from().expect("recv");
        sender.send_to(&datagram, from).expect("reply");
        Ok(())
    });
    let requester = alpha.clone();
    spawn(move || {
        requester.send_to(b"marco", beta_addr).expect("send");
        let (reply, from) = requester.recv_from().expect("recv reply");
        *seen.lock() = Some((reply, from));
        Ok(())
    });

    lp.run().unwrap();
    assert_eq!(
        *observed.lock(),
        Some((Bytes::from_static(b"marco"), beta_addr))
    );
    assert_eq!(alpha.local_addr().unwrap(), alpha_addr);
    alpha.close();
    beta.close();
    lp.destroy().unwrap();
}
