use plclink_client::{ClientSettings, ModbusClient};
use plclink_datalink::ModbusTcpTransport;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = ClientSettings::new("127.0.0.1", 502).with_unit_id(1);
    let client = ModbusClient::with_settings(ModbusTcpTransport::new(), settings);
    client.connect().await?;

    let values = client.read_holding_registers(0, 4, None).await?;
    println!("holding registers: {values:?}");

    client.shutdown().await;
    Ok(())
}
