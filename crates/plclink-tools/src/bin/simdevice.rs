use clap::Parser;
use plclink_datalink::{InMemoryModbusService, ModbusTcpServer};
use plclink_tools::common::init_tracing;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    name = "simdevice",
    about = "Serve an in-memory holding-register bank over Modbus-TCP"
)]
struct Args {
    #[arg(long, default_value = "127.0.0.1:5020")]
    bind: String,
    #[arg(long, default_value_t = 256)]
    registers: usize,
    /// Initial values as `address=value`, repeatable.
    #[arg(long = "set", value_parser = parse_assignment)]
    assignments: Vec<(u16, u16)>,
}

fn parse_assignment(input: &str) -> Result<(u16, u16), String> {
    let (address, value) = input
        .split_once('=')
        .ok_or_else(|| format!("expected address=value, got {input}"))?;
    let address = address
        .trim()
        .parse()
        .map_err(|err| format!("invalid address {address}: {err}"))?;
    let value = value
        .trim()
        .parse()
        .map_err(|err| format!("invalid value {value}: {err}"))?;
    Ok((address, value))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    let service = InMemoryModbusService::new(args.registers);
    for (address, value) in &args.assignments {
        service.set_holding_register(*address, *value)?;
    }

    let server = ModbusTcpServer::bind(args.bind.as_str(), service).await?;
    info!(addr = %server.local_addr()?, registers = args.registers, "simulated device listening");
    server.run().await?;
    Ok(())
}
