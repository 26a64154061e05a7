//! Register node: one thread serves a register bank, the main thread
//! writes and reads it over a local TCP bus.
//!
//! Run with:
//!   cargo run --example register-node

use std::thread;

use busmux::{
    BusListener, ClientOptions, Endpoint, MultiplexClient, MultiplexServer, RegisterBank,
    ServerDriver, ServerOptions, Value, ValueKind,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let listener = BusListener::bind(&"tcp:127.0.0.1:0".parse::<Endpoint>()?)?;
    let endpoint = listener.endpoint().clone();

    let mut bank = RegisterBank::new();
    bank.define(0x10, Value::Int32(0))
        .define(0x11, Value::Int32(0))
        .define_read_only(0x20, Value::Float(3.25));

    let node = thread::spawn(
        move || -> Result<RegisterBank, Box<dyn std::error::Error + Send + Sync>> {
            let stream = listener.accept()?;
            let server = MultiplexServer::new(ServerOptions::default().default_id(5))?;
            let mut driver = ServerDriver::new(server, stream, bank);
            driver.run()?;
            let (server, _stream, bank) = driver.into_parts();
            eprintln!("[node] counters: {:?}", server.stats());
            Ok(bank)
        },
    );

    let mut client = MultiplexClient::connect(&endpoint, ClientOptions::default())?;
    client.write_registers(5, 0x10, &[Value::Int32(7), Value::Int32(-9)])?;
    let values = client.read_registers(5, 0x10, 2, ValueKind::Int32)?;
    eprintln!("[client] 0x10..0x11 = {values:?}");

    let temperature = client.read_register(5, 0x20, ValueKind::Float)?;
    eprintln!("[client] 0x20 = {temperature}");

    if let Err(err) = client.write_registers(5, 0x20, &[Value::Float(0.0)]) {
        eprintln!("[client] read-only register refused: {err}");
    }
    drop(client);

    let bank = node
        .join()
        .expect("node thread should not panic")
        .expect("node should serve without error");
    eprintln!("[node] final 0x10 = {:?}", bank.get(0x10));
    Ok(())
}
