//! Scripted in-memory link for unit tests.

use async_trait::async_trait;
use plclink_core::frame::tcp::encode_request;
use plclink_datalink::{DataLink, DataLinkError, LinkEvent};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

struct Script {
    events: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
    sent_tx: mpsc::UnboundedSender<Vec<u8>>,
    sent_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    sent_count: AtomicUsize,
    connects: AtomicUsize,
    connect_delay: Mutex<Duration>,
    refuse_connect: AtomicBool,
    fail_send: AtomicBool,
    last_target: Mutex<Option<(String, u16)>>,
}

#[derive(Clone)]
pub(crate) struct ScriptedLink {
    script: Arc<Script>,
}

pub(crate) fn transaction_id_of(frame: &[u8]) -> u16 {
    u16::from_be_bytes([frame[0], frame[1]])
}

impl ScriptedLink {
    pub(crate) fn new() -> Self {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        Self {
            script: Arc::new(Script {
                events: Mutex::new(None),
                sent_tx,
                sent_rx: tokio::sync::Mutex::new(sent_rx),
                sent_count: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                connect_delay: Mutex::new(Duration::ZERO),
                refuse_connect: AtomicBool::new(false),
                fail_send: AtomicBool::new(false),
                last_target: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn with_connect_delay(self, delay: Duration) -> Self {
        self.set_connect_delay(delay);
        self
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        *self.script.connect_delay.lock().unwrap() = delay;
    }

    pub(crate) fn refuse_connect(&self, refuse: bool) {
        self.script.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    pub(crate) fn fail_send(&self, fail: bool) {
        self.script.fail_send.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn connects(&self) -> usize {
        self.script.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.script.sent_count.load(Ordering::SeqCst)
    }

    pub(crate) fn last_target(&self) -> Option<(String, u16)> {
        self.script.last_target.lock().unwrap().clone()
    }

    /// Wait for the next frame the engine writes.
    pub(crate) async fn next_sent(&self) -> Vec<u8> {
        self.script
            .sent_rx
            .lock()
            .await
            .recv()
            .await
            .expect("sender is owned by the script")
    }

    pub(crate) fn inject(&self, event: LinkEvent) {
        if let Some(events) = self.script.events.lock().unwrap().as_ref() {
            let _ = events.send(event);
        }
    }

    /// Deliver a response ADU carrying `pdu`.
    pub(crate) fn reply(&self, transaction_id: u16, unit_id: u8, pdu: &[u8]) {
        let frame = encode_request(transaction_id, unit_id, pdu[0], &pdu[1..]).unwrap();
        self.inject(LinkEvent::Frame(frame));
    }
}

#[async_trait]
impl DataLink for ScriptedLink {
    async fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> Result<mpsc::UnboundedReceiver<LinkEvent>, DataLinkError> {
        self.script.connects.fetch_add(1, Ordering::SeqCst);
        *self.script.last_target.lock().unwrap() = Some((host.to_string(), port));

        let delay = *self.script.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.script.refuse_connect.load(Ordering::SeqCst) {
            return Err(DataLinkError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "scripted refusal",
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.script.events.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn send(&self, frame: &[u8]) -> Result<(), DataLinkError> {
        if self.script.fail_send.load(Ordering::SeqCst) {
            return Err(DataLinkError::ConnectionClosed);
        }
        if self.script.events.lock().unwrap().is_none() {
            return Err(DataLinkError::NotConnected);
        }
        self.script.sent_count.fetch_add(1, Ordering::SeqCst);
        let _ = self.script.sent_tx.send(frame.to_vec());
        Ok(())
    }

    async fn disconnect(&self) {
        self.script.events.lock().unwrap().take();
    }
}
