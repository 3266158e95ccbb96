//! Service driver
//!
//! Public request/response surface over one link: read, write and
//! subscribe against a (service, characteristic) target, multiplexed over
//! the shared connection owned by the coordinator. Characteristic
//! discovery runs freshly per call so a peripheral can reshape its
//! service table between operations, and every in-flight operation races
//! the session-closed signal so a disconnect can never leave it hanging.

use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::link::{Characteristic, Link};
use crate::message::{self, Message};
use crate::session::{ConnectionCoordinator, SessionHandle};
use crate::DriverError;

/// Notifications buffered per subscription between the link and a slow
/// consumer.
const SUBSCRIPTION_BUFFER: usize = 32;

/// Driver for one peripheral link. All operations share one underlying
/// connection, established lazily on first use and re-established on
/// demand after a disconnect.
pub struct ServiceDriver {
    coordinator: Arc<ConnectionCoordinator>,
}

impl ServiceDriver {
    pub fn new(link: Arc<dyn Link>) -> Self {
        Self {
            coordinator: ConnectionCoordinator::new(link),
        }
    }

    /// Read the characteristic once. `request` must be empty: reads carry
    /// no payload in this protocol.
    pub async fn read(
        &self,
        request: &[u8],
        service_id: Uuid,
        characteristic_id: Uuid,
    ) -> Result<Vec<u8>, DriverError> {
        if !request.is_empty() {
            return Err(DriverError::NonEmptyRequest);
        }
        let session = self.coordinator.acquire().await?;
        let mut closed = session.attach()?;
        let characteristic =
            discover(&session, service_id, characteristic_id, &mut closed).await?;
        let value = tokio::select! {
            result = characteristic.read() => result.map_err(DriverError::from)?,
            _ = closed.recv() => return Err(DriverError::Disconnected),
        };
        match value {
            Some(data) if !data.is_empty() => Ok(data),
            _ => Err(DriverError::EmptyResponse),
        }
    }

    /// Write `request` with acknowledgement. Resolves with an empty
    /// buffer once the peripheral acknowledges; an acknowledgement that
    /// carries data is rejected as [`DriverError::UnexpectedResponse`].
    pub async fn write(
        &self,
        request: &[u8],
        service_id: Uuid,
        characteristic_id: Uuid,
    ) -> Result<Vec<u8>, DriverError> {
        let session = self.coordinator.acquire().await?;
        let mut closed = session.attach()?;
        let characteristic =
            discover(&session, service_id, characteristic_id, &mut closed).await?;
        let ack = tokio::select! {
            result = characteristic.write(request) => result.map_err(DriverError::from)?,
            _ = closed.recv() => return Err(DriverError::Disconnected),
        };
        match ack {
            Some(data) if !data.is_empty() => Err(DriverError::UnexpectedResponse),
            _ => Ok(Vec::new()),
        }
    }

    /// Subscribe to notifications. `request` must be empty. Each call is
    /// an independent subscription; the returned stream terminates with
    /// [`DriverError::Disconnected`] if the connection drops, with
    /// [`DriverError::EmptyResponse`] if a notification carries no value,
    /// or cleanly if the link closes the stream. Dropping the
    /// [`Subscription`] cancels it and releases the link-level listener.
    pub async fn subscribe(
        &self,
        request: &[u8],
        service_id: Uuid,
        characteristic_id: Uuid,
    ) -> Result<Subscription, DriverError> {
        if !request.is_empty() {
            return Err(DriverError::NonEmptyRequest);
        }
        let session = self.coordinator.acquire().await?;
        let mut closed = session.attach()?;
        let characteristic =
            discover(&session, service_id, characteristic_id, &mut closed).await?;
        let mut notifications = tokio::select! {
            result = characteristic.subscribe() => result.map_err(DriverError::from)?,
            _ = closed.recv() => return Err(DriverError::Disconnected),
        };

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    notification = notifications.recv() => match notification {
                        Some(Some(data)) if !data.is_empty() => {
                            // A closed receiver means the caller dropped
                            // the stream; dropping `notifications` below
                            // unregisters the link-level listener.
                            if tx.send(Ok(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(_) => {
                            let _ = tx.send(Err(DriverError::EmptyResponse)).await;
                            break;
                        }
                        // Link closed the notification stream normally.
                        None => break,
                    },
                    _ = closed.recv() => {
                        let _ = tx.send(Err(DriverError::Disconnected)).await;
                        break;
                    }
                }
            }
        });
        Ok(Subscription { rx })
    }

    /// Tear down the current session, failing every attached operation
    /// with [`DriverError::Disconnected`]. Safe to call at any time, any
    /// number of times.
    pub fn disconnect(&self) {
        self.coordinator.teardown(None);
    }

    /// Read and decode a typed response message from the characteristic
    /// its schema declares.
    pub async fn read_message<M: Message>(&self) -> Result<M, DriverError> {
        let schema = M::schema();
        let data = self
            .read(&[], schema.service_id, schema.characteristic_id)
            .await?;
        Ok(message::decode_message(&data)?)
    }

    /// Encode and write a typed request message to the characteristic its
    /// schema declares.
    pub async fn write_message<M: Message>(&self, request: &M) -> Result<(), DriverError> {
        let schema = M::schema();
        let payload = message::encode_message(request)?;
        self.write(&payload, schema.service_id, schema.characteristic_id)
            .await?;
        Ok(())
    }

    /// Subscribe to the characteristic a message schema declares,
    /// decoding each notification into the typed message.
    pub async fn subscribe_messages<M: Message>(&self) -> Result<MessageStream<M>, DriverError> {
        let schema = M::schema();
        let inner = self
            .subscribe(&[], schema.service_id, schema.characteristic_id)
            .await?;
        Ok(MessageStream {
            inner,
            _message: PhantomData,
        })
    }
}

impl Drop for ServiceDriver {
    fn drop(&mut self) {
        // Operations outliving the driver resolve with Disconnected
        // rather than hanging on a session nobody owns.
        self.coordinator.teardown(None);
    }
}

/// Discover the target characteristic, racing the session-closed signal.
async fn discover(
    session: &Arc<SessionHandle>,
    service_id: Uuid,
    characteristic_id: Uuid,
    closed: &mut tokio::sync::broadcast::Receiver<()>,
) -> Result<Arc<dyn Characteristic>, DriverError> {
    tokio::select! {
        result = session.link.discover_characteristic(service_id, characteristic_id) => {
            result.map_err(DriverError::from)
        }
        _ = closed.recv() => Err(DriverError::Disconnected),
    }
}

/// Caller-visible notification stream. Terminates after yielding an
/// error; dropping it cancels the subscription.
pub struct Subscription {
    rx: mpsc::Receiver<Result<Vec<u8>, DriverError>>,
}

impl Stream for Subscription {
    type Item = Result<Vec<u8>, DriverError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Typed view over a [`Subscription`], decoding each notification with
/// the message's schema.
pub struct MessageStream<M> {
    inner: Subscription,
    // fn() -> M keeps the stream Unpin (and covariant) regardless of M;
    // we only ever produce M values, never store one.
    _message: PhantomData<fn() -> M>,
}

impl<M: Message> Stream for MessageStream<M> {
    type Item = Result<M, DriverError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(data))) => {
                Poll::Ready(Some(message::decode_message(&data).map_err(DriverError::from)))
            }
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
