use plclink_core::frame::tcp::{decode_frame, encode_request};
use plclink_core::pdu::{FunctionCode, ReadHoldingRegistersRequest, decode_read_registers_response};

fn main() {
    let request = ReadHoldingRegistersRequest::new(0x0010, 2)
        .expect("sample quantity is within bounds");
    let frame = encode_request(
        1,
        1,
        FunctionCode::ReadHoldingRegisters.as_u8(),
        &request.payload(),
    )
    .expect("sample payload fits a frame");
    println!("request adu: {frame:02X?}");

    let reply = [0x00, 0x01, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x04, 0x00, 0x2A, 0x00, 0x64];
    let decoded = decode_frame(&reply).expect("sample reply has a valid header");
    match decode_read_registers_response(decoded.pdu, 0x03, 2) {
        Ok(values) => {
            for (offset, value) in values.iter().enumerate() {
                println!("register[{}] = {value}", 0x0010 + offset);
            }
        }
        Err(err) => println!("device rejected request: {err}"),
    }
}
