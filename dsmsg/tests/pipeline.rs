//! End-to-end scenarios that exercise a whole connection rather than one
//! state transition: queuing several messages before any wait, delivering a
//! message one byte at a time, and the two timeout shapes.

use std::io::Write;
use std::net::TcpStream as StdTcpStream;
use std::thread;
use std::time::{Duration, Instant};

use dsmsg::{unwrap_buffer, wrap_buffer, Endpoint, EndpointState};

fn deadline_in(d: Duration) -> Instant {
    Instant::now() + d
}

fn connected_pair() -> (Endpoint, Endpoint) {
    let server = Endpoint::serve("127.0.0.1", 0).unwrap();
    let port = server.local_addr().unwrap().port();
    let client = Endpoint::connect("127.0.0.1", port).unwrap();

    assert_eq!(client.wait(deadline_in(Duration::from_secs(2))), 1);
    assert_eq!(client.state(), EndpointState::Ready);

    assert_eq!(server.wait(deadline_in(Duration::from_secs(2))), 1);
    let accepted = server.accept().expect("listener should have accepted");

    (client, accepted)
}

#[test]
fn pipeline_of_varied_sizes_arrives_in_order() {
    let (client, server) = connected_pair();

    let payloads: Vec<Vec<u8>> = vec![
        Vec::new(),
        vec![0x42],
        (0..1_048_576u32).map(|i| (i % 251) as u8).collect(),
    ];

    for payload in &payloads {
        client.send(wrap_buffer(payload));
    }

    let mut received = Vec::new();
    let deadline = deadline_in(Duration::from_secs(10));
    while received.len() < payloads.len() {
        assert!(server.wait(deadline) >= 0);
        while let Some(msg) = server.recv() {
            received.push(unwrap_buffer(msg).unwrap());
        }
    }

    assert_eq!(received, payloads);
}

#[test]
fn one_kib_message_survives_a_byte_at_a_time_delivery() {
    let server = Endpoint::serve("127.0.0.1", 0).unwrap();
    let port = server.local_addr().unwrap().port();

    let trickler = thread::spawn(move || {
        let mut raw = StdTcpStream::connect(("127.0.0.1", port)).unwrap();
        let payload: Vec<u8> = (0..1024u32).map(|i| (i % 256) as u8).collect();

        // Hand-assemble the same wire bytes the library would produce, then
        // drip them through the socket one octet at a time.
        let mut wire = Vec::with_capacity(16 + payload.len());
        wire.extend_from_slice(b"DSmsg");
        wire.extend_from_slice(&[0u8, 0u8]);
        wire.push(0u8); // MessageType::Buffer
        wire.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        wire.extend_from_slice(&payload);

        for byte in wire {
            raw.write_all(&[byte]).unwrap();
            raw.flush().unwrap();
            thread::sleep(Duration::from_micros(200));
        }
        payload
    });

    assert_eq!(server.wait(deadline_in(Duration::from_secs(2))), 1);
    let accepted = server.accept().expect("listener should have accepted");

    let deadline = deadline_in(Duration::from_secs(10));
    let mut msg = None;
    while msg.is_none() {
        assert!(accepted.wait(deadline) >= 0);
        msg = accepted.recv();
    }

    let expected = trickler.join().unwrap();
    assert_eq!(msg.unwrap().payload(), expected.as_slice());
}

#[test]
fn wait_with_no_peer_activity_times_out_twice() {
    let (client, server) = connected_pair();
    let _ = client;

    assert_eq!(server.wait(Instant::now()), 0);
    assert_eq!(
        server.wait(deadline_in(Duration::from_millis(100))),
        0
    );
}
