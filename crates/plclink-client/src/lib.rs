//! Concurrent Modbus-TCP master.
//!
//! Many callers share one link. Each request gets its own transaction id and
//! waits on a one-shot completion that is resolved by the matching response,
//! its timeout, a dropped connection or shutdown, whichever comes first.

#![forbid(unsafe_code)]

pub mod connection;
pub mod registry;
pub mod settings;

#[cfg(test)]
mod testing;

pub use connection::{ConnectionManager, ConnectionState};
pub use registry::{AbortReason, TransactionRegistry};
pub use settings::{ClientSettings, EchoPolicy};

use plclink_core::frame::tcp::encode_request;
use plclink_core::pdu::{
    ExceptionKind, ExceptionResponse, FunctionCode, ReadHoldingRegistersRequest, Request,
    WriteEcho, WriteSingleRegisterRequest, decode_read_registers_response,
    decode_write_register_response,
};
use plclink_core::{EncodeError, ProtocolError};
use plclink_datalink::{DataLink, DataLinkError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::time::sleep;
use tracing::{debug, warn};

#[cfg(feature = "metrics")]
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("not connected")]
    NotConnected,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("device exception: {0}")]
    DeviceException(ExceptionResponse),
    #[error("unexpected function code {actual:#04x} (expected {expected:#04x})")]
    UnexpectedFunctionCode { expected: u8, actual: u8 },
    #[error("malformed response: {0}")]
    Malformed(&'static str),
    #[error("transaction id {0} is already in flight")]
    DuplicateTransaction(u16),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("write echo mismatch: device reported address {address:#06x}, value {value:#06x}")]
    EchoMismatch { address: u16, value: u16 },
    #[error("datalink error: {0}")]
    DataLink(#[from] DataLinkError),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
}

impl ClientError {
    /// Exception class reported by the device, if this is a device exception.
    pub fn exception_kind(&self) -> Option<ExceptionKind> {
        match self {
            Self::DeviceException(ex) => Some(ex.kind()),
            _ => None,
        }
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidArgument(msg) => Self::InvalidArgument(msg),
            ProtocolError::DeviceException(ex) => Self::DeviceException(ex),
            ProtocolError::UnexpectedFunctionCode { expected, actual } => {
                Self::UnexpectedFunctionCode { expected, actual }
            }
            ProtocolError::Malformed(msg) => Self::Malformed(msg),
        }
    }
}

impl From<AbortReason> for ClientError {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::ConnectionClosed => Self::ConnectionClosed,
            AbortReason::Timeout => Self::Timeout,
            AbortReason::Cancelled => Self::Cancelled,
        }
    }
}

#[cfg(feature = "metrics")]
#[derive(Debug, Default)]
pub struct ClientMetrics {
    requests_total: AtomicU64,
    successful_responses: AtomicU64,
    timeouts_total: AtomicU64,
    cancelled_total: AtomicU64,
    connection_closed_total: AtomicU64,
    exceptions_total: AtomicU64,
    decode_errors_total: AtomicU64,
    dropped_frames_total: AtomicU64,
    late_frames_total: AtomicU64,
}

#[cfg(feature = "metrics")]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientMetricsSnapshot {
    pub requests_total: u64,
    pub successful_responses: u64,
    pub timeouts_total: u64,
    pub cancelled_total: u64,
    pub connection_closed_total: u64,
    pub exceptions_total: u64,
    pub decode_errors_total: u64,
    pub dropped_frames_total: u64,
    pub late_frames_total: u64,
}

#[cfg(feature = "metrics")]
impl ClientMetrics {
    fn snapshot(&self) -> ClientMetricsSnapshot {
        ClientMetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            successful_responses: self.successful_responses.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
            cancelled_total: self.cancelled_total.load(Ordering::Relaxed),
            connection_closed_total: self.connection_closed_total.load(Ordering::Relaxed),
            exceptions_total: self.exceptions_total.load(Ordering::Relaxed),
            decode_errors_total: self.decode_errors_total.load(Ordering::Relaxed),
            dropped_frames_total: self.dropped_frames_total.load(Ordering::Relaxed),
            late_frames_total: self.late_frames_total.load(Ordering::Relaxed),
        }
    }
}

/// A response PDU together with the settings of the connection it came over.
struct Reply {
    pdu: Vec<u8>,
    settings: Arc<ClientSettings>,
}

/// Takes a registered request back out of the registry when its caller stops
/// waiting (dropped future, outer timeout, aborted task) before it resolves.
struct InFlight<'a> {
    registry: &'a TransactionRegistry,
    transaction_id: u16,
    settled: bool,
}

impl InFlight<'_> {
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled && self.registry.remove(self.transaction_id) {
            debug!(
                transaction_id = self.transaction_id,
                "caller stopped waiting; request withdrawn"
            );
        }
    }
}

enum Wait {
    Delivered(Result<registry::Completion, oneshot::error::RecvError>),
    Interrupted(AbortReason),
}

/// Request executor over a shared [`DataLink`].
pub struct ModbusClient<D: DataLink> {
    connection: ConnectionManager<D>,
}

impl<D: DataLink> ModbusClient<D> {
    pub fn new(link: D) -> Self {
        Self::with_settings(link, ClientSettings::default())
    }

    pub fn with_settings(link: D, settings: ClientSettings) -> Self {
        Self {
            connection: ConnectionManager::new(link, settings),
        }
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await
    }

    /// Cancel outstanding requests and close the link for good.
    pub async fn shutdown(&self) {
        self.connection.shutdown().await
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn pending_count(&self) -> usize {
        self.connection.pending_count()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    pub fn settings(&self) -> ClientSettings {
        self.connection.settings()
    }

    pub fn replace_settings(&self, settings: ClientSettings) {
        self.connection.replace_settings(settings)
    }

    #[cfg(feature = "metrics")]
    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.connection.metrics().snapshot()
    }

    /// Read `quantity` holding registers starting at `start_address`.
    ///
    /// `timeout` falls back to the connection's `request_timeout`.
    pub async fn read_holding_registers(
        &self,
        start_address: u16,
        quantity: u16,
        timeout: Option<Duration>,
    ) -> Result<Vec<u16>, ClientError> {
        let request = ReadHoldingRegistersRequest::new(start_address, quantity)?;
        let reply = self
            .execute(Request::ReadHoldingRegisters(request), timeout)
            .await?;
        let values = decode_read_registers_response(
            &reply.pdu,
            FunctionCode::ReadHoldingRegisters.as_u8(),
            quantity,
        )
        .map_err(|err| self.protocol_failure(err))?;

        #[cfg(feature = "metrics")]
        self.connection
            .metrics()
            .successful_responses
            .fetch_add(1, Ordering::Relaxed);
        Ok(values)
    }

    /// Write one holding register.
    ///
    /// A device echo that differs from the request is handled according to
    /// the connection's [`EchoPolicy`].
    pub async fn write_single_register(
        &self,
        address: u16,
        value: u16,
        timeout: Option<Duration>,
    ) -> Result<(), ClientError> {
        let request = WriteSingleRegisterRequest { address, value };
        let reply = self
            .execute(Request::WriteSingleRegister(request), timeout)
            .await?;
        let echo = decode_write_register_response(&reply.pdu, address, value)
            .map_err(|err| self.protocol_failure(err))?;

        if let WriteEcho::Mismatched {
            address: echoed_address,
            value: echoed_value,
        } = echo
        {
            warn!(
                address,
                value,
                echoed_address,
                echoed_value,
                "device echoed a different register write"
            );
            if reply.settings.echo_policy == EchoPolicy::Reject {
                return Err(ClientError::EchoMismatch {
                    address: echoed_address,
                    value: echoed_value,
                });
            }
        }

        #[cfg(feature = "metrics")]
        self.connection
            .metrics()
            .successful_responses
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Send one request frame and wait for whatever resolves it first.
    async fn execute(
        &self,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<Reply, ClientError> {
        if !self.connection.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let settings = self
            .connection
            .active_settings()
            .ok_or(ClientError::NotConnected)?;
        let wait = timeout.unwrap_or(settings.request_timeout);
        let registry = self.connection.registry();

        let transaction_id = registry.next_id();
        let function = request.function_code().as_u8();
        let frame = encode_request(
            transaction_id,
            settings.unit_id,
            function,
            &request.payload(),
        )?;

        let (completion, mut rx) = oneshot::channel();
        registry.register(transaction_id, completion)?;
        let mut in_flight = InFlight {
            registry,
            transaction_id,
            settled: false,
        };

        #[cfg(feature = "metrics")]
        self.connection
            .metrics()
            .requests_total
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            transaction_id,
            unit_id = settings.unit_id,
            function,
            timeout_ms = wait.as_millis() as u64,
            "dispatching modbus request"
        );

        if let Err(err) = self.connection.link().send(&frame).await {
            warn!(transaction_id, error = %err, "failed to send modbus request");
            return Err(err.into());
        }

        let waited = tokio::select! {
            delivered = &mut rx => Wait::Delivered(delivered),
            _ = sleep(wait) => Wait::Interrupted(AbortReason::Timeout),
            _ = self.connection.cancellation().cancelled() => {
                Wait::Interrupted(AbortReason::Cancelled)
            }
        };
        let delivered = match waited {
            Wait::Delivered(delivered) => delivered,
            Wait::Interrupted(reason) => {
                // A response or a drain may have won the race; the receiver
                // holds whichever resolution actually happened.
                registry.try_resolve(transaction_id, Err(reason));
                rx.await
            }
        };
        in_flight.settle();

        match delivered {
            Ok(Ok(pdu)) => Ok(Reply { pdu, settings }),
            Ok(Err(reason)) => {
                self.record_abort(reason);
                warn!(transaction_id, function, reason = ?reason, "modbus request aborted");
                Err(reason.into())
            }
            Err(_) => {
                warn!(transaction_id, function, "pending request dropped without a resolution");
                Err(ClientError::ConnectionClosed)
            }
        }
    }

    fn record_abort(&self, reason: AbortReason) {
        #[cfg(feature = "metrics")]
        {
            let metrics = self.connection.metrics();
            let counter = match reason {
                AbortReason::Timeout => &metrics.timeouts_total,
                AbortReason::Cancelled => &metrics.cancelled_total,
                AbortReason::ConnectionClosed => &metrics.connection_closed_total,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = reason;
    }

    fn protocol_failure(&self, err: ProtocolError) -> ClientError {
        match err {
            ProtocolError::DeviceException(ex) => {
                #[cfg(feature = "metrics")]
                self.connection
                    .metrics()
                    .exceptions_total
                    .fetch_add(1, Ordering::Relaxed);
                debug!(exception = %ex, "device rejected request");
            }
            other => {
                #[cfg(feature = "metrics")]
                self.connection
                    .metrics()
                    .decode_errors_total
                    .fetch_add(1, Ordering::Relaxed);
                warn!(error = %other, "invalid response pdu");
            }
        }
        err.into()
    }
}
