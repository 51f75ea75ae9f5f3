//! Back-pressure path: partial writes, output spill, high-water mark.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tern_net::{Address, Buffer, ConnectionRef, EventLoop, Server};

/// Deterministic payload so reordered or dropped spans are detectable.
fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

const PAYLOAD_LEN: usize = 2 * 1024 * 1024;
const HIGH_WATER_MARK: usize = 64 * 1024;

#[test]
fn slow_reader_spills_to_output_buffer_and_drains_in_order() {
    let high_water_hits = Arc::new(AtomicUsize::new(0));
    let high_water_size = Arc::new(AtomicUsize::new(0));
    let write_completes = Arc::new(AtomicUsize::new(0));
    let conn_slot: Arc<Mutex<Option<ConnectionRef>>> = Arc::new(Mutex::new(None));

    let (tx, rx) = std::sync::mpsc::channel();
    let handle = {
        let high_water_hits = high_water_hits.clone();
        let high_water_size = high_water_size.clone();
        let write_completes = write_completes.clone();
        let conn_slot = conn_slot.clone();
        thread::spawn(move || {
            let main_loop = EventLoop::new().unwrap();
            let server = Server::new(main_loop.clone(), &Address::with_port(0)).unwrap();
            server.set_thread_count(1).unwrap();
            server.set_high_water_mark(HIGH_WATER_MARK);

            server.set_connection_callback(Arc::new(move |conn: &ConnectionRef| {
                *conn_slot.lock() = Some(conn.clone());
            }));
            // Any request triggers a response far larger than the kernel
            // send buffer: the direct write must be partial and the rest
            // spill into the output buffer.
            server.set_message_callback(Arc::new(
                move |conn: &ConnectionRef, input: &mut Buffer, _now| {
                    input.clear();
                    conn.send(&patterned(PAYLOAD_LEN));
                },
            ));
            server.set_high_water_mark_callback(Arc::new(move |_conn: &ConnectionRef, size: usize| {
                high_water_hits.fetch_add(1, Ordering::SeqCst);
                high_water_size.store(size, Ordering::SeqCst);
            }));
            server.set_write_complete_callback(Arc::new(move |_conn: &ConnectionRef| {
                write_completes.fetch_add(1, Ordering::SeqCst);
            }));

            server.start().unwrap();
            tx.send((server.clone(), server.local_addr().unwrap()))
                .unwrap();
            main_loop.run();
        })
    };
    let (server, addr) = rx.recv().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"go").unwrap();

    // Hold off reading so the server is forced to buffer.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let pending = conn_slot
            .lock()
            .as_ref()
            .map(|conn| conn.pending_send_bytes())
            .unwrap_or(0);
        if pending > 0 {
            break;
        }
        assert!(Instant::now() < deadline, "output never spilled");
        thread::sleep(Duration::from_millis(5));
    }

    // The crossing callback is deferred to the loop's task phase.
    let deadline = Instant::now() + Duration::from_secs(5);
    while high_water_hits.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "high-water mark never fired");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(high_water_hits.load(Ordering::SeqCst), 1);
    assert!(high_water_size.load(Ordering::SeqCst) >= HIGH_WATER_MARK);

    // Drain slowly at first, then fully; every byte must arrive in order.
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut got = Vec::with_capacity(PAYLOAD_LEN);
    let mut chunk = [0u8; 1024];
    for _ in 0..32 {
        let n = client.read(&mut chunk).unwrap();
        got.extend_from_slice(&chunk[..n]);
        thread::sleep(Duration::from_millis(2));
    }
    while got.len() < PAYLOAD_LEN {
        let n = client.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed mid-payload");
        got.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(got.len(), PAYLOAD_LEN);
    assert_eq!(got, patterned(PAYLOAD_LEN), "delivery out of order");

    // The buffer fully drained and write-complete fired once.
    let deadline = Instant::now() + Duration::from_secs(5);
    while write_completes.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "write-complete never fired");
        thread::sleep(Duration::from_millis(5));
    }
    let conn = conn_slot.lock().clone().unwrap();
    assert_eq!(conn.pending_send_bytes(), 0);
    assert_eq!(high_water_hits.load(Ordering::SeqCst), 1);

    // Release the test's references so the final drop lands on the worker.
    conn_slot.lock().take();
    drop(conn);
    drop(client);
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.connection_count() > 0 {
        assert!(Instant::now() < deadline, "connection never removed");
        thread::sleep(Duration::from_millis(5));
    }

    server.stop();
    server.main_loop().stop();
    handle.join().unwrap();
}

#[test]
fn oversized_single_send_is_delivered_completely() {
    let (tx, rx) = std::sync::mpsc::channel();
    let handle = thread::spawn(move || {
        let main_loop = EventLoop::new().unwrap();
        let server = Server::new(main_loop.clone(), &Address::with_port(0)).unwrap();
        server.set_thread_count(1).unwrap();
        server.set_message_callback(Arc::new(
            |conn: &ConnectionRef, input: &mut Buffer, _now| {
                // Echo whatever arrived; large client writes exercise the
                // scatter-read spillover on the input side.
                conn.send(&input.take());
            },
        ));
        server.start().unwrap();
        tx.send((server.clone(), server.local_addr().unwrap()))
            .unwrap();
        main_loop.run();
    });
    let (server, addr) = rx.recv().unwrap();

    let payload = patterned(512 * 1024);
    let mut client = TcpStream::connect(addr).unwrap();

    let writer = {
        let mut half = client.try_clone().unwrap();
        let payload = payload.clone();
        thread::spawn(move || half.write_all(&payload))
    };

    let mut got = vec![0u8; payload.len()];
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    client.read_exact(&mut got).unwrap();
    writer.join().unwrap().unwrap();

    assert_eq!(got, payload);

    drop(client);
    server.stop();
    server.main_loop().stop();
    handle.join().unwrap();
}
