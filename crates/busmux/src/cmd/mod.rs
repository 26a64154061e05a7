use std::path::PathBuf;
use std::time::Duration;

use busmux_protocol::{ClientOptions, FixedAttempts, MultiplexClient, Register, Value, ValueKind};
use busmux_transport::{BusStream, Endpoint};
use clap::{Args, Subcommand, ValueEnum};

use crate::exit::{client_error, transport_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod read;
pub mod serve;
pub mod tunnel;
pub mod version;
pub mod write;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a node: answer register and tunnel requests on an endpoint.
    Serve(ServeArgs),
    /// Read registers from a node.
    Read(ReadArgs),
    /// Write registers on a node.
    Write(WriteArgs),
    /// Exchange bytes with a node over a tunnel channel.
    Tunnel(TunnelArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Read(args) => read::run(args, format),
        Command::Write(args) => write::run(args, format),
        Command::Tunnel(args) => tunnel::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum KindArg {
    Int8,
    Int16,
    Int32,
    Float,
}

impl From<KindArg> for ValueKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Int8 => ValueKind::Int8,
            KindArg::Int16 => ValueKind::Int16,
            KindArg::Int32 => ValueKind::Int32,
            KindArg::Float => ValueKind::Float,
        }
    }
}

/// Options shared by every command that talks to a node.
#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Endpoint of the bus (unix:/path, tcp:host:port, or a bare path).
    pub endpoint: String,
    /// Node id to address.
    #[arg(long, short = 'n', default_value = "1")]
    pub node: u8,
    /// Time to wait for each reply (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
    /// Source id placed in request frames.
    #[arg(long, default_value = "0")]
    pub source_id: u8,
    /// Extra attempts after a timeout or damaged reply.
    #[arg(long, default_value = "0")]
    pub retries: u32,
}

impl ClientArgs {
    pub fn connect(&self) -> CliResult<MultiplexClient<BusStream>> {
        let endpoint = parse_endpoint(&self.endpoint)?;
        let options = ClientOptions {
            source_id: self.source_id,
            reply_timeout: parse_duration(&self.timeout)?,
            ..ClientOptions::default()
        };
        let client = MultiplexClient::connect(&endpoint, options)
            .map_err(|err| client_error("connect failed", err))?;
        Ok(client.with_retry(FixedAttempts(self.retries.saturating_add(1))))
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Endpoint to listen on (unix:/path, tcp:host:port, or a bare path).
    pub endpoint: String,
    /// Node id. Persisted when --config is given.
    #[arg(long)]
    pub id: Option<u8>,
    /// JSON file holding the node configuration.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Largest frame payload the node accepts and sends.
    #[arg(long, default_value = "256")]
    pub buffer_size: usize,
    /// Number of tunnel channels the node can hold open.
    #[arg(long, default_value = "1")]
    pub tunnels: usize,
    /// Echo tunnel data back to the client.
    #[arg(long)]
    pub tunnel_echo: bool,
    /// Define a writable register (e.g. 0x10=int16:42).
    #[arg(long = "define", value_name = "REG=KIND:VALUE")]
    pub define: Vec<String>,
    /// Define a read-only register.
    #[arg(long = "read-only", value_name = "REG=KIND:VALUE")]
    pub read_only: Vec<String>,
    /// Log counters at this interval (e.g. 10s).
    #[arg(long)]
    pub stats_interval: Option<String>,
    /// Exit after the first connection closes.
    #[arg(long)]
    pub once: bool,
}

#[derive(Args, Debug)]
pub struct ReadArgs {
    #[command(flatten)]
    pub client: ClientArgs,
    /// First register (decimal or 0x-prefixed).
    #[arg(value_parser = parse_register)]
    pub register: Register,
    /// Number of consecutive registers.
    #[arg(long, short = 'c', default_value = "1")]
    pub count: u32,
    /// Representation to read.
    #[arg(long, short = 'k', value_enum, default_value = "int32")]
    pub kind: KindArg,
}

#[derive(Args, Debug)]
pub struct WriteArgs {
    #[command(flatten)]
    pub client: ClientArgs,
    /// First register (decimal or 0x-prefixed).
    #[arg(value_parser = parse_register)]
    pub register: Register,
    /// Values for consecutive registers.
    #[arg(required = true, allow_hyphen_values = true)]
    pub values: Vec<String>,
    /// Representation of the values.
    #[arg(long, short = 'k', value_enum, default_value = "int32")]
    pub kind: KindArg,
}

#[derive(Args, Debug)]
pub struct TunnelArgs {
    #[command(flatten)]
    pub client: ClientArgs,
    /// Tunnel channel.
    #[arg(long, default_value = "0")]
    pub channel: u32,
    /// Data to send on the first poll.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read the data to send from a file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Extra empty polls to collect delayed output.
    #[arg(long, default_value = "1")]
    pub polls: u32,
    /// Pause between polls.
    #[arg(long, default_value = "50ms")]
    pub interval: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_endpoint(input: &str) -> CliResult<Endpoint> {
    input
        .parse()
        .map_err(|err| transport_error("invalid endpoint", err))
}

pub fn parse_register(input: &str) -> Result<Register, String> {
    let input = input.trim();
    let parsed = match input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
    {
        Some(hex) => Register::from_str_radix(hex, 16),
        None => input.parse(),
    };
    parsed.map_err(|_| format!("invalid register: {input}"))
}

/// Parse `REG=KIND:VALUE`.
pub fn parse_definition(input: &str) -> CliResult<(Register, Value)> {
    let invalid = || CliError::new(USAGE, format!("invalid register definition: {input}"));
    let (register, rest) = input.split_once('=').ok_or_else(invalid)?;
    let (kind, value) = rest.split_once(':').ok_or_else(invalid)?;
    let register = parse_register(register).map_err(|_| invalid())?;
    let kind = ValueKind::ALL
        .into_iter()
        .find(|k| k.name() == kind.trim())
        .ok_or_else(invalid)?;
    let value = kind.parse_value(value).ok_or_else(invalid)?;
    Ok((register, value))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        _ => Duration::from_secs(value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
    }

    #[test]
    fn registers_accept_hex() {
        assert_eq!(parse_register("0x10"), Ok(16));
        assert_eq!(parse_register("300"), Ok(300));
        assert!(parse_register("0xzz").is_err());
    }

    #[test]
    fn definitions_carry_kind() {
        let (register, value) = parse_definition("0x20=int16:-7").expect("definition should parse");
        assert_eq!(register, 0x20);
        assert_eq!(value, Value::Int16(-7));

        let (_, value) = parse_definition("5=float:1.5").expect("float should parse");
        assert_eq!(value, Value::Float(1.5));

        let err = parse_definition("5=int8:300").expect_err("out of range value should fail");
        assert_eq!(err.code, USAGE);
        assert!(parse_definition("5:int8").is_err());
    }
}
