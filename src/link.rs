//! Link capability boundary
//!
//! Abstract interface over one physical BLE peer. The driver consumes
//! these traits and never talks to a platform stack directly; production
//! backends wrap a real central, tests inject the in-process simulator
//! from [`crate::simulated`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("characteristic {characteristic_id} not found in service {service_id}")]
    CharacteristicNotFound {
        service_id: Uuid,
        characteristic_id: Uuid,
    },

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("notification setup failed: {0}")]
    NotifyFailed(String),

    #[error("peer disconnected")]
    Disconnected,
}

/// Connection state as reported by the underlying stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// One physical wireless peer.
#[async_trait]
pub trait Link: Send + Sync {
    /// Peer identity, opaque to the driver.
    fn id(&self) -> Uuid;

    /// Issue a connect request. Resolves once the link is connected.
    async fn connect(&self) -> Result<(), LinkError>;

    /// Current connection state. The link may be driven from outside the
    /// driver, so this can change between any two calls.
    fn state(&self) -> LinkState;

    /// Resolve a (service, characteristic) pair to a live handle. Only
    /// valid while connected; handles must not be reused across
    /// reconnects.
    async fn discover_characteristic(
        &self,
        service_id: Uuid,
        characteristic_id: Uuid,
    ) -> Result<Arc<dyn Characteristic>, LinkError>;

    /// Observe disconnect events. Fires once per disconnect, for any
    /// reason including caller-initiated, with the underlying cause when
    /// one is known.
    fn on_disconnect(&self) -> broadcast::Receiver<Option<LinkError>>;
}

/// A live characteristic handle on a connected link.
#[async_trait]
pub trait Characteristic: Send + Sync {
    /// One-shot read. `None` means the peer attached no value.
    async fn read(&self) -> Result<Option<Vec<u8>>, LinkError>;

    /// Acknowledged write ("with response"). Resolves when the peer
    /// acknowledges, returning the acknowledgement payload, normally
    /// `None`.
    async fn write(&self, data: &[u8]) -> Result<Option<Vec<u8>>, LinkError>;

    /// Register for notifications. Each item is one notification; `None`
    /// means the notification carried no value. Dropping the receiver
    /// unregisters the listener.
    async fn subscribe(&self) -> Result<mpsc::Receiver<Option<Vec<u8>>>, LinkError>;
}
