use crate::{ModbusService, ServiceError};
use plclink_core::EncodeError;
use plclink_core::encoding::Writer;
use plclink_core::pdu::{ExceptionCode, FunctionCode, Request};
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBank {
    values: Vec<u16>,
}

impl RegisterBank {
    pub fn new(size: usize) -> Self {
        Self {
            values: vec![0u16; size],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<u16> {
        self.values.get(index).copied()
    }

    pub fn set(&mut self, index: usize, value: u16) -> Result<(), ServiceError> {
        let slot = self
            .values
            .get_mut(index)
            .ok_or(ServiceError::Exception(ExceptionCode::IllegalDataAddress))?;
        *slot = value;
        Ok(())
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.values
    }
}

impl From<Vec<u16>> for RegisterBank {
    fn from(values: Vec<u16>) -> Self {
        Self { values }
    }
}

/// Holding-register device kept in memory, answering FC03 and FC06.
#[derive(Debug)]
pub struct InMemoryModbusService {
    registers: RwLock<RegisterBank>,
}

impl InMemoryModbusService {
    pub fn new(register_count: usize) -> Self {
        Self::with_registers(RegisterBank::new(register_count))
    }

    pub fn with_registers(registers: impl Into<RegisterBank>) -> Self {
        Self {
            registers: RwLock::new(registers.into()),
        }
    }

    pub fn snapshot(&self) -> RegisterBank {
        self.registers
            .read()
            .expect("register bank lock poisoned")
            .clone()
    }

    pub fn set_holding_register(&self, address: u16, value: u16) -> Result<(), ServiceError> {
        self.registers
            .write()
            .expect("register bank lock poisoned")
            .set(usize::from(address), value)
    }

    pub fn holding_register(&self, address: u16) -> Option<u16> {
        self.registers
            .read()
            .expect("register bank lock poisoned")
            .get(usize::from(address))
    }
}

impl ModbusService for InMemoryModbusService {
    fn handle(
        &self,
        _unit_id: u8,
        request: Request,
        response_pdu: &mut [u8],
    ) -> Result<usize, ServiceError> {
        let mut w = Writer::new(response_pdu);

        match request {
            Request::ReadHoldingRegisters(req) => {
                let bank = self.registers.read().expect("register bank lock poisoned");
                let range = checked_range(req.start_address, req.quantity, bank.len())
                    .ok_or(ServiceError::Exception(ExceptionCode::IllegalDataAddress))?;
                let byte_count = u8::try_from(range.len() * 2)
                    .map_err(|_| ServiceError::Internal("register response too large"))?;

                w.write_u8(FunctionCode::ReadHoldingRegisters.as_u8())
                    .map_err(map_encode)?;
                w.write_u8(byte_count).map_err(map_encode)?;
                for value in &bank.as_slice()[range] {
                    w.write_be_u16(*value).map_err(map_encode)?;
                }
            }
            Request::WriteSingleRegister(req) => {
                self.set_holding_register(req.address, req.value)?;
                // The normal reply echoes the request.
                request.encode(&mut w).map_err(map_encode)?;
            }
        }

        Ok(w.position())
    }
}

fn checked_range(start: u16, quantity: u16, len: usize) -> Option<std::ops::Range<usize>> {
    let start = usize::from(start);
    let end = start.checked_add(usize::from(quantity))?;
    if quantity == 0 || end > len {
        return None;
    }
    Some(start..end)
}

fn map_encode(err: EncodeError) -> ServiceError {
    let msg = match err {
        EncodeError::BufferTooSmall => "response buffer too small",
        EncodeError::ValueOutOfRange => "response value out of range",
        EncodeError::PayloadTooLarge { .. } => "response payload too large",
    };
    ServiceError::Internal(msg)
}
