use crate::DataLinkError;
use plclink_core::DecodeError;
use plclink_core::encoding::{Reader, Writer};
use plclink_core::frame::tcp::{self, MbapHeader};
use plclink_core::pdu::{ExceptionCode, ExceptionResponse, FunctionCode, Request};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, warn};

#[cfg(feature = "metrics")]
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("modbus exception: {0}")]
    Exception(ExceptionCode),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("internal error: {0}")]
    Internal(&'static str),
}

/// Device-side request handler.
pub trait ModbusService: Send + Sync + 'static {
    /// Answer a decoded request by writing the response PDU (function code
    /// and payload, no MBAP header) into `response_pdu`.
    ///
    /// Returns the number of bytes written.
    fn handle(
        &self,
        unit_id: u8,
        request: Request,
        response_pdu: &mut [u8],
    ) -> Result<usize, ServiceError>;
}

impl<T> ModbusService for Arc<T>
where
    T: ModbusService + ?Sized,
{
    fn handle(
        &self,
        unit_id: u8,
        request: Request,
        response_pdu: &mut [u8],
    ) -> Result<usize, ServiceError> {
        (**self).handle(unit_id, request, response_pdu)
    }
}

#[cfg(feature = "metrics")]
#[derive(Debug, Default)]
pub struct ServerMetrics {
    requests_total: AtomicU64,
    responses_ok: AtomicU64,
    exceptions_sent: AtomicU64,
    decode_errors: AtomicU64,
}

#[cfg(feature = "metrics")]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerMetricsSnapshot {
    pub requests_total: u64,
    pub responses_ok: u64,
    pub exceptions_sent: u64,
    pub decode_errors: u64,
}

#[cfg(feature = "metrics")]
impl ServerMetrics {
    pub fn snapshot(&self) -> ServerMetricsSnapshot {
        ServerMetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            responses_ok: self.responses_ok.load(Ordering::Relaxed),
            exceptions_sent: self.exceptions_sent.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

/// A Modbus-TCP slave answering through a [`ModbusService`].
pub struct ModbusTcpServer<S> {
    listener: TcpListener,
    service: Arc<S>,
    #[cfg(feature = "metrics")]
    metrics: Arc<ServerMetrics>,
}

impl<S: ModbusService> ModbusTcpServer<S> {
    pub async fn bind<A: ToSocketAddrs>(addr: A, service: S) -> Result<Self, DataLinkError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::from_listener(listener, service))
    }

    pub fn from_listener(listener: TcpListener, service: S) -> Self {
        Self {
            listener,
            service: Arc::new(service),
            #[cfg(feature = "metrics")]
            metrics: Arc::new(ServerMetrics::default()),
        }
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, DataLinkError> {
        Ok(self.listener.local_addr()?)
    }

    #[cfg(feature = "metrics")]
    pub fn metrics_handle(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Accept connections forever, one task per peer.
    pub async fn run(self) -> Result<(), DataLinkError> {
        loop {
            let (socket, peer) = self.listener.accept().await?;
            debug!(%peer, "simulated device accepted connection");
            let service = Arc::clone(&self.service);
            #[cfg(feature = "metrics")]
            let metrics = Arc::clone(&self.metrics);

            tokio::spawn(async move {
                if let Err(err) = handle_connection(
                    socket,
                    service,
                    #[cfg(feature = "metrics")]
                    metrics,
                )
                .await
                {
                    warn!(%peer, error = %err, "simulated device connection ended with error");
                }
            });
        }
    }
}

async fn handle_connection<S: ModbusService>(
    mut socket: TcpStream,
    service: Arc<S>,
    #[cfg(feature = "metrics")] metrics: Arc<ServerMetrics>,
) -> Result<(), DataLinkError> {
    loop {
        let mut head = [0u8; tcp::MBAP_HEADER_LEN];
        if let Err(err) = socket.read_exact(&mut head).await {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(());
            }
            return Err(DataLinkError::Io(err));
        }

        let header = MbapHeader::read(&mut Reader::new(&head))
            .map_err(|_| DataLinkError::InvalidFrame("short mbap header"))?;
        if header.protocol_id != 0 {
            return Err(DataLinkError::InvalidFrame("non-zero protocol id"));
        }
        let frame_len = header
            .frame_len()
            .ok_or(DataLinkError::InvalidFrame("invalid request length"))?;

        let mut request_pdu = vec![0u8; frame_len - tcp::MBAP_HEADER_LEN];
        socket.read_exact(&mut request_pdu).await?;

        #[cfg(feature = "metrics")]
        metrics.requests_total.fetch_add(1, Ordering::Relaxed);

        let request = match Request::decode(&request_pdu) {
            Ok(request) => request,
            Err(err) => {
                #[cfg(feature = "metrics")]
                {
                    metrics.decode_errors.fetch_add(1, Ordering::Relaxed);
                    metrics.exceptions_sent.fetch_add(1, Ordering::Relaxed);
                }
                let function = request_pdu[0] & !FunctionCode::EXCEPTION_FLAG;
                send_exception(
                    &mut socket,
                    &header,
                    function,
                    map_decode_error_to_exception(err),
                )
                .await?;
                continue;
            }
        };

        let function = request.function_code().as_u8();
        debug!(
            transaction_id = header.transaction_id,
            unit_id = header.unit_id,
            function,
            "simulated device received request"
        );

        let mut response_pdu = [0u8; tcp::MAX_PDU_LEN];
        let code = match service.handle(header.unit_id, request, &mut response_pdu) {
            Ok(len) if len > 0 && len <= response_pdu.len() => {
                #[cfg(feature = "metrics")]
                metrics.responses_ok.fetch_add(1, Ordering::Relaxed);
                send_pdu(&mut socket, &header, &response_pdu[..len]).await?;
                continue;
            }
            Ok(_) | Err(ServiceError::Internal(_)) => ExceptionCode::ServerDeviceFailure,
            Err(ServiceError::Exception(code)) => code,
            Err(ServiceError::InvalidRequest(_)) => ExceptionCode::IllegalDataValue,
        };
        #[cfg(feature = "metrics")]
        metrics.exceptions_sent.fetch_add(1, Ordering::Relaxed);
        send_exception(&mut socket, &header, function, code).await?;
    }
}

fn map_decode_error_to_exception(err: DecodeError) -> ExceptionCode {
    match err {
        DecodeError::InvalidFunctionCode => ExceptionCode::IllegalFunction,
        DecodeError::UnexpectedEof | DecodeError::InvalidValue | DecodeError::TrailingBytes => {
            ExceptionCode::IllegalDataValue
        }
    }
}

async fn send_exception(
    socket: &mut TcpStream,
    header: &MbapHeader,
    function_code: u8,
    exception_code: ExceptionCode,
) -> Result<(), DataLinkError> {
    let mut pdu = [0u8; 2];
    let mut w = Writer::new(&mut pdu);
    ExceptionResponse {
        function_code,
        exception_code,
    }
    .encode(&mut w)?;
    send_pdu(socket, header, w.as_written()).await
}

async fn send_pdu(
    socket: &mut TcpStream,
    header: &MbapHeader,
    pdu: &[u8],
) -> Result<(), DataLinkError> {
    let mut frame = [0u8; tcp::MAX_FRAME_LEN];
    let mut w = Writer::new(&mut frame);
    tcp::encode_frame(&mut w, header.transaction_id, header.unit_id, pdu)?;
    debug!(
        transaction_id = header.transaction_id,
        unit_id = header.unit_id,
        pdu_len = pdu.len(),
        "simulated device sending response"
    );
    socket.write_all(w.as_written()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{ModbusService, ModbusTcpServer, ServiceError};
    use plclink_core::frame::tcp::{decode_frame, encode_request};
    use plclink_core::pdu::{ExceptionCode, Request};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct FixedReadService;

    impl ModbusService for FixedReadService {
        fn handle(
            &self,
            _unit_id: u8,
            request: Request,
            response_pdu: &mut [u8],
        ) -> Result<usize, ServiceError> {
            match request {
                Request::ReadHoldingRegisters(_) => {
                    let bytes = [0x03u8, 0x02, 0x00, 0x2A];
                    response_pdu[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Request::WriteSingleRegister(_) => {
                    Err(ServiceError::Exception(ExceptionCode::ServerDeviceBusy))
                }
            }
        }
    }

    async fn round_trip(stream: &mut TcpStream, request: &[u8], reply_len: usize) -> Vec<u8> {
        stream.write_all(request).await.unwrap();
        let mut reply = vec![0u8; reply_len];
        stream.read_exact(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn answers_and_preserves_correlation_fields() {
        let server = ModbusTcpServer::bind("127.0.0.1:0", FixedReadService)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let task = tokio::spawn(server.run());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = encode_request(0x1234, 7, 0x03, &[0x00, 0x00, 0x00, 0x01]).unwrap();
        let reply = round_trip(&mut stream, &request, 11).await;
        let frame = decode_frame(&reply).unwrap();
        assert_eq!(frame.transaction_id, 0x1234);
        assert_eq!(frame.unit_id, 7);
        assert_eq!(frame.pdu, &[0x03, 0x02, 0x00, 0x2A]);

        task.abort();
        let _ = task.await;
    }

    #[tokio::test]
    async fn service_exception_is_sent_back() {
        let server = ModbusTcpServer::bind("127.0.0.1:0", FixedReadService)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let task = tokio::spawn(server.run());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = encode_request(2, 1, 0x06, &[0x00, 0x20, 0x00, 0xFF]).unwrap();
        let reply = round_trip(&mut stream, &request, 9).await;
        assert_eq!(decode_frame(&reply).unwrap().pdu, &[0x86, 0x06]);

        task.abort();
        let _ = task.await;
    }

    #[tokio::test]
    async fn unsupported_function_gets_illegal_function() {
        let server = ModbusTcpServer::bind("127.0.0.1:0", FixedReadService)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let task = tokio::spawn(server.run());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = encode_request(3, 1, 0x10, &[0x00, 0x00, 0x00, 0x01, 0x02, 0x12, 0x34])
            .unwrap();
        let reply = round_trip(&mut stream, &request, 9).await;
        assert_eq!(decode_frame(&reply).unwrap().pdu, &[0x90, 0x01]);

        // Bad quantity on a supported function.
        let request = encode_request(4, 1, 0x03, &[0x00, 0x00, 0x00, 0x00]).unwrap();
        let reply = round_trip(&mut stream, &request, 9).await;
        assert_eq!(decode_frame(&reply).unwrap().pdu, &[0x83, 0x03]);

        task.abort();
        let _ = task.await;
    }
}
