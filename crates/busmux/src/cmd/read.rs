use busmux_protocol::ValueKind;

use crate::cmd::ReadArgs;
use crate::exit::{client_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_registers, OutputFormat};

pub fn run(args: ReadArgs, format: OutputFormat) -> CliResult<i32> {
    if args.count == 0 {
        return Err(CliError::new(USAGE, "--count must be at least 1"));
    }
    if args.register.checked_add(args.count - 1).is_none() {
        return Err(CliError::new(USAGE, "register range overflows"));
    }

    let mut client = args.client.connect()?;
    let values = client
        .read_registers(
            args.client.node,
            args.register,
            args.count,
            ValueKind::from(args.kind),
        )
        .map_err(|err| client_error("read failed", err))?;

    print_registers(args.client.node, args.register, &values, format);
    Ok(SUCCESS)
}
