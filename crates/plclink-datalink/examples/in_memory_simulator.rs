use plclink_core::frame::tcp::encode_request;
use plclink_datalink::{DataLink, InMemoryModbusService, LinkEvent, ModbusTcpServer, ModbusTcpTransport};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let service = Arc::new(InMemoryModbusService::new(64));
    service.set_holding_register(0, 1234)?;

    let server = ModbusTcpServer::bind("127.0.0.1:0", Arc::clone(&service)).await?;
    let addr = server.local_addr()?;
    let server_task = tokio::spawn(server.run());

    let link = ModbusTcpTransport::new();
    let mut events = link.connect("127.0.0.1", addr.port()).await?;
    link.send(&encode_request(1, 1, 0x03, &[0x00, 0x00, 0x00, 0x01])?)
        .await?;

    while let Some(event) = events.recv().await {
        if let LinkEvent::Frame(frame) = event {
            println!("response adu: {frame:02X?}");
            break;
        }
    }

    link.disconnect().await;
    server_task.abort();
    let _ = server_task.await;
    Ok(())
}
