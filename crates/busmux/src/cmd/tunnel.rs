use std::fs;
use std::thread;

use crate::cmd::{parse_duration, TunnelArgs};
use crate::exit::{client_error, io_error, CliResult, SUCCESS};
use crate::output::{print_tunnel, OutputFormat};

pub fn run(args: TunnelArgs, format: OutputFormat) -> CliResult<i32> {
    let interval = parse_duration(&args.interval)?;
    let data = resolve_data(&args)?;
    let node = args.client.node;

    let mut client = args.client.connect()?;
    let mut received = Vec::new();
    let mut outgoing = &data[..];
    let mut sent_once = false;

    // The first poll always goes out, even with nothing to send.
    while !outgoing.is_empty() || !sent_once {
        let room = client.options().buffer_size.saturating_sub(8).max(1);
        let (now, rest) = outgoing.split_at(outgoing.len().min(room));
        let reply = client
            .poll_tunnel(node, args.channel, now)
            .map_err(|err| client_error("tunnel poll failed", err))?;
        received.extend_from_slice(&reply);
        outgoing = rest;
        sent_once = true;
    }

    for _ in 0..args.polls {
        thread::sleep(interval);
        let reply = client
            .poll_tunnel(node, args.channel, &[])
            .map_err(|err| client_error("tunnel poll failed", err))?;
        received.extend_from_slice(&reply);
    }

    print_tunnel(node, args.channel, &received, format);
    Ok(SUCCESS)
}

fn resolve_data(args: &TunnelArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Ok(Vec::new())
}
