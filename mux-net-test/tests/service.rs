//! End-to-end service tests over loopback TCP.
//!
//! Every test runs a real service (reactors, accept plane, pool) on
//! ephemeral ports and drives it with std TcpStream clients. They are
//! serialized because the continue flag is process-global.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::Ordering::SeqCst;
use std::time::{Duration, Instant};

use serial_test::serial;

use mux_net::ServiceConfig;
use mux_net_test::echo::echo_round_trip;
use mux_net_test::{EchoHandler, HEADER_SIZE, TestService, encode_frame, read_frame};

fn test_config() -> ServiceConfig {
    ServiceConfig {
        outer_bind_addr: "127.0.0.1".into(),
        outer_port: 0,
        accept_threads: 1,
        work_threads: 2,
        max_connections: 32,
        min_buf_size: 4096,
        max_buf_size: 65536,
        net_timeout: Duration::from_secs(30),
        poll_timeout_ms: 100,
        ..Default::default()
    }
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
#[serial]
fn echo_round_trip_matches() {
    let (handler, counters) = EchoHandler::new();
    let service = TestService::start(test_config(), handler).unwrap();

    let mut client = service.connect().unwrap();
    let body: Vec<u8> = (0..16u8).collect();
    let reply = echo_round_trip(&mut client, &body).unwrap();
    assert_eq!(reply, body);
    assert_eq!(counters.requests.load(SeqCst), 1);
    assert_eq!(counters.accepted.load(SeqCst), 1);

    drop(client);
    let stats = service.shutdown();
    assert_eq!(stats.in_use, 0);
}

#[test]
#[serial]
fn pipelined_requests_are_answered_in_order() {
    let (handler, counters) = EchoHandler::new();
    let service = TestService::start(test_config(), handler).unwrap();

    let mut client = service.connect().unwrap();
    let bodies = [b"first".to_vec(), b"second".to_vec(), b"third".to_vec()];
    let mut wire = Vec::new();
    for body in &bodies {
        wire.extend_from_slice(&encode_frame(body));
    }
    client.write_all(&wire).unwrap();

    for body in &bodies {
        let reply = read_frame(&mut client).unwrap();
        assert_eq!(&reply, body);
    }
    assert_eq!(counters.requests.load(SeqCst), 3);

    drop(client);
    let stats = service.shutdown();
    assert_eq!(stats.in_use, 0);
    assert_eq!(counters.cleanups.load(SeqCst), 1);
}

#[test]
#[serial]
fn zero_length_body_is_dispatched() {
    let (handler, counters) = EchoHandler::new();
    let service = TestService::start(test_config(), handler).unwrap();

    let mut client = service.connect().unwrap();
    let reply = echo_round_trip(&mut client, b"").unwrap();
    assert!(reply.is_empty());
    assert_eq!(counters.requests.load(SeqCst), 1);

    drop(client);
    service.shutdown();
}

#[test]
#[serial]
fn body_at_buffer_limit_succeeds() {
    let (handler, counters) = EchoHandler::new();
    let service = TestService::start(test_config(), handler).unwrap();

    let mut client = service.connect().unwrap();
    let body = vec![0x5A; 65536 - HEADER_SIZE];
    let reply = echo_round_trip(&mut client, &body).unwrap();
    assert_eq!(reply, body);
    assert_eq!(counters.requests.load(SeqCst), 1);

    drop(client);
    service.shutdown();
}

#[test]
#[serial]
fn oversized_declared_body_closes_without_dispatch() {
    let (handler, counters) = EchoHandler::new();
    let service = TestService::start(test_config(), handler).unwrap();

    let mut client = service.connect().unwrap();
    let oversized = (65536 - HEADER_SIZE + 1) as u64;
    client.write_all(&oversized.to_be_bytes()).unwrap();

    match read_frame(&mut client) {
        Err(e) => assert!(matches!(
            e.kind(),
            ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset
        )),
        Ok(body) => panic!("expected close, got {} bytes", body.len()),
    }
    assert!(service.wait_for(Duration::from_secs(5), || {
        counters.cleanups.load(SeqCst) == 1
    }));
    assert_eq!(counters.requests.load(SeqCst), 0);

    service.shutdown();
}

#[test]
#[serial]
fn partial_header_then_close_cleans_up_once() {
    let (handler, counters) = EchoHandler::new();
    let service = TestService::start(test_config(), handler).unwrap();

    let mut client = service.connect().unwrap();
    client.write_all(&[0u8; 4]).unwrap();
    // Make sure the partial header reached the reactor before closing.
    assert!(service.wait_for(Duration::from_secs(5), || {
        counters.accepted.load(SeqCst) == 1
    }));
    drop(client);

    assert!(service.wait_for(Duration::from_secs(5), || {
        counters.cleanups.load(SeqCst) == 1
    }));
    assert_eq!(counters.requests.load(SeqCst), 0);

    let stats = service.shutdown();
    assert_eq!(stats.in_use, 0);
}

#[test]
#[serial]
fn pool_exhaustion_rejects_but_keeps_listening() {
    let (handler, counters) = EchoHandler::new();
    let config = ServiceConfig {
        work_threads: 1,
        max_connections: 2,
        min_buf_size: 1024,
        max_buf_size: 4096,
        ..test_config()
    };
    let service = TestService::start(config, handler).unwrap();

    let mut a = service.connect().unwrap();
    let mut b = service.connect().unwrap();
    assert_eq!(echo_round_trip(&mut a, b"a").unwrap(), b"a");
    assert_eq!(echo_round_trip(&mut b, b"b").unwrap(), b"b");

    // Third connection: pool is exhausted, the server closes it without
    // data exchange.
    let mut c = service.connect().unwrap();
    match read_frame(&mut c) {
        Err(e) => assert!(matches!(
            e.kind(),
            ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset
        )),
        Ok(_) => panic!("exhausted pool still served a request"),
    }
    assert_eq!(counters.requests.load(SeqCst), 2);

    // Releasing one connection makes room again: the listener never left
    // its listening state.
    drop(a);
    assert!(service.wait_for(Duration::from_secs(5), || {
        counters.cleanups.load(SeqCst) >= 1
    }));
    let mut d = service.connect().unwrap();
    assert_eq!(echo_round_trip(&mut d, b"d").unwrap(), b"d");

    drop(b);
    drop(d);
    let stats = service.shutdown();
    assert_eq!(stats.in_use, 0);
}

#[test]
#[serial]
fn idle_connection_times_out() {
    let (handler, counters) = EchoHandler::new();
    let config = ServiceConfig {
        net_timeout: Duration::from_secs(1),
        ..test_config()
    };
    let service = TestService::start(config, handler).unwrap();

    let mut client = service.connect().unwrap();
    client.write_all(&[0u8; 4]).unwrap();

    let started = Instant::now();
    let mut buf = [0u8; 1];
    match client.read(&mut buf) {
        Ok(0) => {}
        other => panic!("expected idle close, got {other:?}"),
    }
    // Closed within a couple of wheel ticks past the 1s timeout.
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(counters.timeouts.load(SeqCst), 1);
    assert!(service.wait_for(Duration::from_secs(5), || {
        counters.cleanups.load(SeqCst) == 1
    }));

    service.shutdown();
}

#[test]
#[serial]
fn equal_ports_share_one_listener() {
    let (handler, counters) = EchoHandler::new();
    let service = TestService::start(test_config(), handler).unwrap();
    assert!(service.inner_addr.is_none());

    let mut client = service.connect().unwrap();
    assert_eq!(echo_round_trip(&mut client, b"hi").unwrap(), b"hi");
    assert_eq!(counters.accepted.load(SeqCst), 1);
    assert_eq!(counters.inner_accepted.load(SeqCst), 0);

    drop(client);
    service.shutdown();
}

#[test]
#[serial]
fn inner_listener_flags_trusted_connections() {
    let (handler, counters) = EchoHandler::new();
    let config = ServiceConfig {
        outer_port: free_port(),
        inner_bind_addr: "127.0.0.1".into(),
        inner_port: free_port(),
        ..test_config()
    };
    let service = TestService::start(config, handler).unwrap();
    assert!(service.inner_addr.is_some());

    let mut trusted = service.connect_inner().unwrap();
    assert_eq!(echo_round_trip(&mut trusted, b"in").unwrap(), b"in");
    assert!(service.wait_for(Duration::from_secs(5), || {
        counters.inner_accepted.load(SeqCst) == 1
    }));

    let mut public = service.connect().unwrap();
    assert_eq!(echo_round_trip(&mut public, b"out").unwrap(), b"out");
    assert_eq!(counters.accepted.load(SeqCst), 2);
    assert_eq!(counters.inner_accepted.load(SeqCst), 1);

    drop(trusted);
    drop(public);
    service.shutdown();
}

#[test]
#[serial]
fn shutdown_sweeps_open_connections_back_to_pool() {
    let (handler, counters) = EchoHandler::new();
    let config = ServiceConfig {
        work_threads: 4,
        ..test_config()
    };
    let service = TestService::start(config, handler).unwrap();

    let mut clients = Vec::new();
    for i in 0..3u8 {
        let mut client = service.connect().unwrap();
        assert_eq!(echo_round_trip(&mut client, &[i]).unwrap(), vec![i]);
        clients.push(client);
    }
    assert_eq!(service.pool_stats().in_use, 3);

    // Clients still open: shutdown must sweep their tasks back.
    let stats = service.shutdown();
    assert_eq!(stats.in_use, 0);
    assert_eq!(counters.cleanups.load(SeqCst), 3);

    // The swept sockets are closed from the server side.
    let mut buf = [0u8; 1];
    for client in &mut clients {
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        match client.read(&mut buf) {
            Ok(0) | Err(_) => {}
            Ok(n) => panic!("unexpected {n} bytes after shutdown"),
        }
    }
}
