//! Modbus-TCP frame codec for the plclink engine.
//!
//! `plclink-core` is the pure, stateless half of the engine: MBAP framing,
//! register request payloads and response validation. It performs no I/O and
//! works in `no_std` builds; the `alloc` feature adds owned outputs such as
//! [`frame::tcp::encode_request`] and [`pdu::decode_read_registers_response`].

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]

#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(feature = "std")]
extern crate std;

pub mod encoding;
pub mod error;
pub mod frame;
pub mod pdu;

pub use error::{DecodeError, EncodeError, FrameError, ProtocolError};
