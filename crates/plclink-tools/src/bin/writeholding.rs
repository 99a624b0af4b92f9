use clap::Parser;
use plclink_tools::common::{TcpConnectionArgs, connect_client, init_tracing};

#[derive(Debug, Parser)]
#[command(name = "writeholding", about = "Write a single holding register (FC06)")]
struct Args {
    #[command(flatten)]
    conn: TcpConnectionArgs,
    #[arg(long)]
    address: u16,
    #[arg(long)]
    value: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();
    let client = connect_client(&args.conn).await?;

    let result = client
        .write_single_register(args.address, args.value, None)
        .await;
    client.shutdown().await;
    result?;

    println!("wrote {} (0x{:04X}) to register {}", args.value, args.value, args.address);
    Ok(())
}
