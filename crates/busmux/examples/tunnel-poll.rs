//! Tunnel polling: the node uppercases whatever arrives on channel 1 and
//! the client collects it on the following poll.
//!
//! Run with:
//!   cargo run --example tunnel-poll

use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use busmux::{
    BusListener, ClientOptions, Endpoint, MultiplexClient, MultiplexServer, RegisterBank,
    ServerDriver, ServerOptions,
};

const CHANNEL: u32 = 1;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let listener = BusListener::bind(&"tcp:127.0.0.1:0".parse::<Endpoint>()?)?;
    let endpoint = listener.endpoint().clone();

    let node = thread::spawn(move || -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let stream = listener.accept()?;
        stream.set_read_timeout(Some(Duration::from_millis(20)))?;
        let server = MultiplexServer::new(ServerOptions::default())?;
        let mut driver = ServerDriver::new(server, stream, RegisterBank::new());
        driver.run_until(|driver| {
            let server = driver.server_mut();
            if let Some(handle) = server.tunnel_handle(CHANNEL) {
                let mut buf = [0u8; 64];
                let mut stream = server.tunnel(handle);
                if let Ok(n) = stream.read(&mut buf) {
                    let _ = stream.write_all(&buf[..n].to_ascii_uppercase());
                }
            }
            true
        })?;
        Ok(())
    });

    let mut client = MultiplexClient::connect(&endpoint, ClientOptions::default())?;
    for line in ["hello", "multi-drop", "bus"] {
        let earlier = client.poll_tunnel(1, CHANNEL, line.as_bytes())?;
        if !earlier.is_empty() {
            eprintln!("[client] {}", String::from_utf8_lossy(&earlier));
        }
        thread::sleep(Duration::from_millis(50));
    }
    let last = client.poll_tunnel(1, CHANNEL, &[])?;
    eprintln!("[client] {}", String::from_utf8_lossy(&last));
    drop(client);

    node.join()
        .expect("node thread should not panic")
        .expect("node should serve without error");
    Ok(())
}
