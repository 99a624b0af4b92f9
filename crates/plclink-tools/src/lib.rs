//! Shared plumbing for the plclink command-line tools.

#![forbid(unsafe_code)]

pub mod common;
