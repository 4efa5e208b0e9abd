//! Single-threaded echo server: accepts any number of clients on one
//! `PollGroup` and bounces every message it receives straight back to the
//! connection it arrived on.

use std::time::{Duration, Instant};

use dsmsg::{wrap_buffer, Endpoint, PollGroup};
use log::info;

const ADDR: &str = "127.0.0.1";
const PORT: u16 = 28008;

/// Tag reserved for the listening endpoint; every accepted client gets its
/// own index into `clients` instead.
const LISTENER_TAG: u64 = 0;

fn main() {
    env_logger::init();

    let listener = Endpoint::serve(ADDR, PORT).expect("bind failed");
    let group = PollGroup::create().expect("poll group failed");
    group
        .add_with_tag(&listener, LISTENER_TAG)
        .expect("listener must be freshly created");

    let mut clients: Vec<Option<Endpoint>> = Vec::new();

    info!("echo server listening on {}:{}", ADDR, PORT);

    loop {
        let deadline = Instant::now() + Duration::from_secs(3600);
        if group.wait(deadline) < 0 {
            break;
        }

        while let Some(tag) = group.acceptable() {
            if tag != LISTENER_TAG {
                break;
            }
            if let Some(client) = listener.accept() {
                let slot = clients.len() as u64 + 1;
                info!("accepted connection {:?}", client.local_addr());
                group
                    .add_with_tag(&client, slot)
                    .expect("fresh accept is never already a member");
                clients.push(Some(client));
            }
        }

        while let Some(tag) = group.readable() {
            let idx = (tag - 1) as usize;
            let client = match clients.get(idx).and_then(|c| c.as_ref()) {
                Some(c) => c,
                None => continue,
            };
            if let Some(msg) = client.recv() {
                info!("echoing {} byte payload", msg.payload().len());
                client.send(wrap_buffer(msg.payload()));
            }
        }

        while let Some(tag) = group.errored() {
            let idx = (tag - 1) as usize;
            if let Some(slot) = clients.get_mut(idx) {
                if let Some(client) = slot.take() {
                    info!("client {} errored, closing", tag);
                    client.close();
                }
            }
        }
    }
}
