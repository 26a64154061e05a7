use busmux_protocol::{Value, ValueKind};

use crate::cmd::WriteArgs;
use crate::exit::{client_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_write, OutputFormat};

pub fn run(args: WriteArgs, format: OutputFormat) -> CliResult<i32> {
    let values = parse_values(ValueKind::from(args.kind), &args.values)?;
    let span = u32::try_from(values.len() - 1).unwrap_or(u32::MAX);
    if args.register.checked_add(span).is_none() {
        return Err(CliError::new(USAGE, "register range overflows"));
    }

    let mut client = args.client.connect()?;
    client
        .write_registers(args.client.node, args.register, &values)
        .map_err(|err| client_error("write failed", err))?;

    print_write(args.client.node, args.register, values.len(), format);
    Ok(SUCCESS)
}

fn parse_values(kind: ValueKind, inputs: &[String]) -> CliResult<Vec<Value>> {
    if inputs.is_empty() {
        return Err(CliError::new(USAGE, "at least one value is required"));
    }
    inputs
        .iter()
        .map(|input| {
            kind.parse_value(input)
                .ok_or_else(|| CliError::new(USAGE, format!("invalid {kind} value: {input}")))
        })
        .collect()
}
