use clap::Parser;
use plclink_tools::common::{TcpConnectionArgs, connect_client, init_tracing};

#[derive(Debug, Parser)]
#[command(name = "readholding", about = "Read holding registers (FC03)")]
struct Args {
    #[command(flatten)]
    conn: TcpConnectionArgs,
    #[arg(long)]
    start: u16,
    #[arg(long, default_value_t = 1)]
    quantity: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();
    let client = connect_client(&args.conn).await?;

    let result = client
        .read_holding_registers(args.start, args.quantity, None)
        .await;
    client.shutdown().await;

    for (idx, value) in result?.iter().enumerate() {
        let address = u32::from(args.start) + idx as u32;
        println!("addr={address} value={value} (0x{value:04X})");
    }
    Ok(())
}
