use std::io::{IsTerminal, Write};

use busmux_protocol::{Register, Stats, Value};
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct RegisterOutput {
    register: Register,
    kind: &'static str,
    value: serde_json::Value,
}

#[derive(Serialize)]
struct ReadOutput {
    node: u8,
    registers: Vec<RegisterOutput>,
}

fn json_value(value: Value) -> serde_json::Value {
    match value {
        Value::Int8(v) => v.into(),
        Value::Int16(v) => v.into(),
        Value::Int32(v) => v.into(),
        Value::Float(v) => f64::from(v).into(),
    }
}

pub fn print_registers(node: u8, start: Register, values: &[Value], format: OutputFormat) {
    let rows = (start..).zip(values.iter().copied());
    match format {
        OutputFormat::Json => {
            let out = ReadOutput {
                node,
                registers: rows
                    .map(|(register, value)| RegisterOutput {
                        register,
                        kind: value.kind().name(),
                        value: json_value(value),
                    })
                    .collect(),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["NODE", "REGISTER", "KIND", "VALUE"]);
            for (register, value) in rows {
                table.add_row(vec![
                    node.to_string(),
                    format!("{register:#x}"),
                    value.kind().to_string(),
                    value.to_string(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for (register, value) in rows {
                println!("node={node} register={register:#x} {}={value}", value.kind());
            }
        }
        OutputFormat::Raw => {
            for (_, value) in rows {
                println!("{value}");
            }
        }
    }
}

#[derive(Serialize)]
struct WriteOutput {
    node: u8,
    start: Register,
    count: usize,
    ok: bool,
}

pub fn print_write(node: u8, start: Register, count: usize, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&WriteOutput {
            node,
            start,
            count,
            ok: true,
        }),
        OutputFormat::Raw => {}
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("node={node} wrote {count} register(s) from {start:#x}");
        }
    }
}

#[derive(Serialize)]
struct TunnelOutput {
    node: u8,
    channel: u32,
    size: usize,
    data: String,
}

pub fn print_tunnel(node: u8, channel: u32, data: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&TunnelOutput {
            node,
            channel,
            size: data.len(),
            data: payload_preview(data),
        }),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["NODE", "CHANNEL", "SIZE", "DATA"])
                .add_row(vec![
                    node.to_string(),
                    channel.to_string(),
                    data.len().to_string(),
                    payload_preview(data),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "node={node} channel={channel} size={} data={}",
                data.len(),
                payload_preview(data)
            );
        }
        OutputFormat::Raw => print_raw(data),
    }
}

pub fn print_stats(id: u8, stats: &Stats, format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Raw => {
            #[derive(Serialize)]
            struct StatsOutput<'a> {
                id: u8,
                stats: &'a Stats,
            }
            print_json(&StatsOutput { id, stats });
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["COUNTER", "VALUE"]);
            for (name, value) in stat_rows(stats) {
                table.add_row(vec![name.to_string(), value.to_string()]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let line = stat_rows(stats)
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join(" ");
            println!("id={id} {line}");
        }
    }
}

fn stat_rows(stats: &Stats) -> [(&'static str, u32); 7] {
    [
        ("wrong_id", stats.wrong_id),
        ("checksum_mismatch", stats.checksum_mismatch),
        ("receive_overrun", stats.receive_overrun),
        ("unknown_subframe", stats.unknown_subframe),
        ("missing_subframe", stats.missing_subframe),
        ("malformed_subframe", stats.malformed_subframe),
        ("reply_overflow", stats.reply_overflow),
    ]
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_values_serialize_as_numbers() {
        assert_eq!(json_value(Value::Float(0.5)), serde_json::json!(0.5));
        assert_eq!(json_value(Value::Int16(-3)), serde_json::json!(-3));
    }

    #[test]
    fn binary_payload_preview() {
        assert_eq!(payload_preview(b"abc"), "abc");
        assert_eq!(payload_preview(&[0xff, 0xfe]), "<binary 2 bytes>");
    }
}
