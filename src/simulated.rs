//! In-process simulated link
//!
//! A scriptable [`Link`] implementation backed by tokio channels, used by
//! the driver tests and available to downstream service-glue tests.
//! Connect outcomes, characteristic values, notifications and disconnects
//! are all driven from the test, with a connect-call counter for
//! asserting that concurrent operations share one connection.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Notify};
use uuid::Uuid;

use crate::link::{Characteristic, Link, LinkError, LinkState};

/// How the next `connect()` call behaves.
#[derive(Debug, Clone)]
pub enum ConnectBehavior {
    /// Resolve successfully.
    Succeed,
    /// Fail with the given message.
    Fail(String),
    /// Stay pending until [`SimLink::resolve_connect`] is called.
    Hold,
}

/// Outcome scripted for one `read()` call.
#[derive(Debug, Clone)]
pub enum ReadScript {
    /// Resolve with the given value (`None` = value missing).
    Value(Option<Vec<u8>>),
    /// Fail with the given error.
    Error(LinkError),
    /// Never resolve. Used to test disconnect-during-operation.
    Hang,
}

/// Simulated peer link.
pub struct SimLink {
    id: Uuid,
    state: Mutex<LinkState>,
    behavior: Mutex<ConnectBehavior>,
    connect_calls: AtomicUsize,
    connect_gate: Notify,
    characteristics: Mutex<HashMap<(Uuid, Uuid), Arc<SimCharacteristic>>>,
    disconnect_tx: broadcast::Sender<Option<LinkError>>,
}

impl SimLink {
    pub fn new() -> Arc<Self> {
        let (disconnect_tx, _) = broadcast::channel(8);
        Arc::new(Self {
            id: Uuid::new_v4(),
            state: Mutex::new(LinkState::Disconnected),
            behavior: Mutex::new(ConnectBehavior::Succeed),
            connect_calls: AtomicUsize::new(0),
            connect_gate: Notify::new(),
            characteristics: Mutex::new(HashMap::new()),
            disconnect_tx,
        })
    }

    /// Script the outcome of subsequent `connect()` calls.
    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Force the reported link state, e.g. to simulate a connect driven
    /// by another owner of the link.
    pub fn set_state(&self, state: LinkState) {
        *self.state.lock().unwrap() = state;
    }

    /// Number of `connect()` calls issued against this link.
    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Release every connect held by [`ConnectBehavior::Hold`].
    pub fn resolve_connect(&self) {
        self.connect_gate.notify_waiters();
        // A permit for a connect that has not reached the gate yet.
        self.connect_gate.notify_one();
    }

    /// Register a characteristic under (service, characteristic) and
    /// return its scripting handle.
    pub fn add_characteristic(
        &self,
        service_id: Uuid,
        characteristic_id: Uuid,
    ) -> Arc<SimCharacteristic> {
        let characteristic = Arc::new(SimCharacteristic::default());
        self.characteristics
            .lock()
            .unwrap()
            .insert((service_id, characteristic_id), Arc::clone(&characteristic));
        characteristic
    }

    /// Drop the connection from the peripheral side, delivering `reason`
    /// to every disconnect observer.
    pub fn inject_disconnect(&self, reason: Option<LinkError>) {
        *self.state.lock().unwrap() = LinkState::Disconnected;
        let _ = self.disconnect_tx.send(reason);
    }
}

#[async_trait]
impl Link for SimLink {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn connect(&self) -> Result<(), LinkError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            ConnectBehavior::Succeed => {
                *self.state.lock().unwrap() = LinkState::Connected;
                Ok(())
            }
            ConnectBehavior::Fail(message) => {
                *self.state.lock().unwrap() = LinkState::Disconnected;
                Err(LinkError::ConnectFailed(message))
            }
            ConnectBehavior::Hold => {
                *self.state.lock().unwrap() = LinkState::Connecting;
                self.connect_gate.notified().await;
                *self.state.lock().unwrap() = LinkState::Connected;
                Ok(())
            }
        }
    }

    fn state(&self) -> LinkState {
        *self.state.lock().unwrap()
    }

    async fn discover_characteristic(
        &self,
        service_id: Uuid,
        characteristic_id: Uuid,
    ) -> Result<Arc<dyn Characteristic>, LinkError> {
        if self.state() != LinkState::Connected {
            return Err(LinkError::Disconnected);
        }
        let characteristics = self.characteristics.lock().unwrap();
        match characteristics.get(&(service_id, characteristic_id)) {
            Some(characteristic) => Ok(Arc::clone(characteristic) as Arc<dyn Characteristic>),
            None => Err(LinkError::CharacteristicNotFound {
                service_id,
                characteristic_id,
            }),
        }
    }

    fn on_disconnect(&self) -> broadcast::Receiver<Option<LinkError>> {
        self.disconnect_tx.subscribe()
    }
}

/// Scriptable characteristic. Reads pop from a queue (an empty queue
/// reads as a missing value), writes are recorded, notifications fan out
/// to every registered listener.
#[derive(Default)]
pub struct SimCharacteristic {
    reads: Mutex<VecDeque<ReadScript>>,
    write_ack: Mutex<Option<Vec<u8>>>,
    writes: Mutex<Vec<Vec<u8>>>,
    listeners: Mutex<Vec<mpsc::Sender<Option<Vec<u8>>>>>,
}

impl SimCharacteristic {
    /// Queue a value for the next `read()` call.
    pub fn push_read(&self, value: Option<Vec<u8>>) {
        self.reads.lock().unwrap().push_back(ReadScript::Value(value));
    }

    /// Queue an error for the next `read()` call.
    pub fn push_read_error(&self, error: LinkError) {
        self.reads.lock().unwrap().push_back(ReadScript::Error(error));
    }

    /// Queue a `read()` that never resolves.
    pub fn push_read_hang(&self) {
        self.reads.lock().unwrap().push_back(ReadScript::Hang);
    }

    /// Set the acknowledgement payload returned by subsequent writes.
    pub fn set_write_ack(&self, ack: Option<Vec<u8>>) {
        *self.write_ack.lock().unwrap() = ack;
    }

    /// Payloads written so far, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    /// Deliver one notification to every registered listener.
    pub fn notify(&self, value: Option<Vec<u8>>) {
        let mut listeners = self.listeners.lock().unwrap();
        listeners.retain(|tx| !tx.is_closed());
        for tx in listeners.iter() {
            let _ = tx.try_send(value.clone());
        }
    }

    /// Whether any notification listener is still registered.
    pub fn has_subscribers(&self) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        listeners.retain(|tx| !tx.is_closed());
        !listeners.is_empty()
    }
}

#[async_trait]
impl Characteristic for SimCharacteristic {
    async fn read(&self) -> Result<Option<Vec<u8>>, LinkError> {
        let script = self.reads.lock().unwrap().pop_front();
        match script {
            Some(ReadScript::Value(value)) => Ok(value),
            Some(ReadScript::Error(error)) => Err(error),
            Some(ReadScript::Hang) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            None => Ok(None),
        }
    }

    async fn write(&self, data: &[u8]) -> Result<Option<Vec<u8>>, LinkError> {
        self.writes.lock().unwrap().push(data.to_vec());
        Ok(self.write_ack.lock().unwrap().clone())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<Option<Vec<u8>>>, LinkError> {
        let (tx, rx) = mpsc::channel(32);
        self.listeners.lock().unwrap().push(tx);
        Ok(rx)
    }
}
