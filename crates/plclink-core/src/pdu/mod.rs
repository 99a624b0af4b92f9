pub mod exception;
pub mod function_code;
pub mod request;
pub mod response;

pub use exception::{ExceptionCode, ExceptionKind, ExceptionResponse};
pub use function_code::FunctionCode;
pub use request::{
    MAX_READ_REGISTERS, ReadHoldingRegistersRequest, Request, WriteSingleRegisterRequest,
};
pub use response::*;
