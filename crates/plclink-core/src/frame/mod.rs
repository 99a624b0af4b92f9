//! Transport framing. Only the TCP (MBAP) flavour is used by plclink.

pub mod tcp;
