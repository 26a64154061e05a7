use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use busmux_protocol::{
    JsonFileConfigStore, MultiplexServer, RegisterBank, ServerDriver, ServerOptions,
};
use busmux_transport::BusListener;
use tracing::{info, warn};

use crate::cmd::{parse_definition, parse_duration, parse_endpoint, ServeArgs};
use crate::exit::{protocol_error, transport_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_stats, OutputFormat};

/// How often the driver wakes up to service tunnels and signals.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let endpoint = parse_endpoint(&args.endpoint)?;
    let stats_interval = args
        .stats_interval
        .as_deref()
        .map(parse_duration)
        .transpose()?;
    let mut registers = build_registers(&args)?;

    let options = ServerOptions::default()
        .buffer_size(args.buffer_size)
        .max_tunnel_streams(args.tunnels);
    let mut server = match &args.config {
        Some(path) => {
            MultiplexServer::with_store(options, Box::new(JsonFileConfigStore::new(path)))
        }
        None => MultiplexServer::new(options),
    }
    .map_err(|err| protocol_error("server setup failed", err))?;
    if let Some(id) = args.id {
        server
            .set_id(id)
            .map_err(|err| protocol_error("invalid node id", err))?;
    }

    let listener =
        BusListener::bind(&endpoint).map_err(|err| transport_error("bind failed", err))?;
    info!(
        endpoint = %listener.endpoint(),
        id = server.id(),
        registers = registers.len(),
        "node ready"
    );

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut last_stats = Instant::now();
    while running.load(Ordering::SeqCst) {
        let stream = listener
            .accept()
            .map_err(|err| transport_error("accept failed", err))?;
        stream
            .set_read_timeout(Some(POLL_INTERVAL))
            .map_err(|err| transport_error("stream setup failed", err))?;

        let mut driver = ServerDriver::new(server, stream, registers);
        let result = driver.run_until(|driver| {
            if args.tunnel_echo {
                echo_tunnels(driver.server_mut());
            }
            if let Some(interval) = stats_interval {
                if last_stats.elapsed() >= interval {
                    let stats = driver.server().stats();
                    info!(id = driver.server().id(), total = stats.total(), ?stats, "counters");
                    last_stats = Instant::now();
                }
            }
            running.load(Ordering::SeqCst)
        });
        let (returned, _stream, bank) = driver.into_parts();
        server = returned;
        registers = bank;
        if let Err(err) = result {
            warn!(error = %err, "connection ended with error");
        }

        if args.once {
            break;
        }
    }

    print_stats(server.id(), server.stats(), format);
    Ok(SUCCESS)
}

fn build_registers(args: &ServeArgs) -> CliResult<RegisterBank> {
    let mut bank = RegisterBank::new();
    for definition in &args.define {
        let (register, value) = parse_definition(definition)?;
        bank.define(register, value);
    }
    for definition in &args.read_only {
        let (register, value) = parse_definition(definition)?;
        bank.define_read_only(register, value);
    }
    Ok(bank)
}

/// Send everything received on each open channel straight back.
fn echo_tunnels(server: &mut MultiplexServer) {
    let channels: Vec<u32> = server.tunnels().channels().collect();
    let chunk = server.options().buffer_size.clamp(1, 256);
    for channel in channels {
        let Some(handle) = server.tunnel_handle(channel) else {
            continue;
        };
        let mut stream = server.tunnel(handle);
        if stream.pending() > 0 {
            continue;
        }
        let mut buf = [0u8; 256];
        if let Ok(n) = stream.read(&mut buf[..chunk]) {
            if let Err(err) = stream.write_all(&buf[..n]) {
                warn!(channel, error = %err, "tunnel echo truncated");
            }
        }
    }
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        // A second interrupt while blocked in accept exits immediately.
        if !running.swap(false, Ordering::SeqCst) {
            std::process::exit(SUCCESS);
        }
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
