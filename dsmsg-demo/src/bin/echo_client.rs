//! Minimal echo client: connects, sends one line read from stdin per
//! iteration, and prints whatever comes back.

use std::io::{self, BufRead, Write};
use std::time::{Duration, Instant};

use dsmsg::{unwrap_buffer, wrap_buffer, Endpoint, EndpointState};
use log::info;

const ADDR: &str = "127.0.0.1";
const PORT: u16 = 28008;

fn main() {
    env_logger::init();

    let conn = Endpoint::connect(ADDR, PORT).expect("connect failed");

    let deadline = Instant::now() + Duration::from_secs(5);
    if conn.wait(deadline) != 1 || conn.state() != EndpointState::Ready {
        eprintln!("failed to connect: {:?}", conn.last_error());
        std::process::exit(1);
    }
    info!("connected to {}:{}", ADDR, PORT);

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        conn.send(wrap_buffer(line.as_bytes()));

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match conn.wait(deadline) {
                1 => {
                    if let Some(msg) = conn.recv() {
                        match unwrap_buffer(msg) {
                            Ok(buf) => {
                                let mut stdout = io::stdout();
                                stdout.write_all(&buf).unwrap();
                                stdout.write_all(b"\n").unwrap();
                            }
                            Err(_) => eprintln!("unrecognized payload type"),
                        }
                        break;
                    }
                }
                0 => {
                    eprintln!("timed out waiting for echo");
                    break;
                }
                _ => {
                    eprintln!("connection failed: {:?}", conn.last_error());
                    return;
                }
            }
        }
    }
}
