//! Connection coordinator
//!
//! Owns the lifecycle of the single physical connection: lazy
//! establishment, de-duplication of concurrent attempts, disconnect
//! fan-out and reconnect. All session-state transitions are serialized
//! through one mutex; the lock is never held across an await, so
//! `teardown` stays callable from synchronous contexts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};

use crate::link::{Link, LinkError, LinkState};
use crate::DriverError;

/// How long to wait between polls while the link reports a connect
/// driven from outside the coordinator, and how many polls to tolerate
/// before failing the attempt.
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const CONNECT_POLL_ATTEMPTS: u32 = 20;

/// A live session over a connected link. Every attached operation holds
/// a clone and listens on `closed`; teardown fires it exactly once, so no
/// operation outlives its session unresolved.
pub(crate) struct SessionHandle {
    pub(crate) link: Arc<dyn Link>,
    closed_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl SessionHandle {
    fn new(link: Arc<dyn Link>) -> Arc<Self> {
        let (closed_tx, _) = broadcast::channel(4);
        Arc::new(Self {
            link,
            closed_tx,
            closed: AtomicBool::new(false),
        })
    }

    /// Attach to the session-closed signal. Subscribes before checking
    /// the closed flag, so a teardown landing between `acquire` and
    /// attachment reports `Disconnected` instead of being missed.
    pub(crate) fn attach(&self) -> Result<broadcast::Receiver<()>, DriverError> {
        let receiver = self.closed_tx.subscribe();
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Disconnected);
        }
        Ok(receiver)
    }

    fn close(&self) {
        // Flag before signal: every attacher observes one or the other.
        // Receivers may all be gone already; that just means every
        // attached operation has resolved.
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.closed_tx.send(());
    }
}

type Waiter = oneshot::Sender<Result<Arc<SessionHandle>, DriverError>>;

enum SessionState {
    /// No session. The next requester starts a connect attempt.
    Idle,
    /// One connect attempt in flight; everyone who asked meanwhile waits
    /// on it. Never issues a second `Link::connect`.
    Connecting { waiters: Vec<Waiter> },
    /// Serving the live session to every requester.
    Connected { session: Arc<SessionHandle> },
}

struct Machine {
    state: SessionState,
    /// Bumped on every teardown so a stale connect task or disconnect
    /// watcher can never touch a newer generation.
    epoch: u64,
}

/// Shared-connection state machine for one driver instance.
pub(crate) struct ConnectionCoordinator {
    link: Arc<dyn Link>,
    machine: Mutex<Machine>,
}

impl ConnectionCoordinator {
    pub(crate) fn new(link: Arc<dyn Link>) -> Arc<Self> {
        Arc::new(Self {
            link,
            machine: Mutex::new(Machine {
                state: SessionState::Idle,
                epoch: 0,
            }),
        })
    }

    /// Obtain the current session, establishing or joining a shared
    /// connect attempt as needed.
    pub(crate) async fn acquire(self: &Arc<Self>) -> Result<Arc<SessionHandle>, DriverError> {
        let rx = {
            let mut machine = self.machine.lock().unwrap();
            match &mut machine.state {
                SessionState::Connected { session } => return Ok(Arc::clone(session)),
                SessionState::Connecting { waiters } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
                SessionState::Idle => {
                    let (tx, rx) = oneshot::channel();
                    machine.state = SessionState::Connecting { waiters: vec![tx] };
                    let epoch = machine.epoch;
                    let coordinator = Arc::clone(self);
                    tokio::spawn(async move {
                        coordinator.run_connect(epoch).await;
                    });
                    rx
                }
            }
        };
        // The sender side only disappears if teardown raced ahead of the
        // waiter notification, which resolves the same way.
        rx.await.unwrap_or(Err(DriverError::Disconnected))
    }

    /// Tear down the current session or connect attempt, failing every
    /// waiter and firing the session-closed signal. Idempotent: with no
    /// active session this is a no-op, and already-resolved operations
    /// are not failed again. `expected_epoch` guards teardowns issued by
    /// background watchers of a prior generation; `None` forces teardown
    /// of whatever is current.
    pub(crate) fn teardown(&self, expected_epoch: Option<u64>) {
        let (waiters, session) = {
            let mut machine = self.machine.lock().unwrap();
            if let Some(epoch) = expected_epoch {
                if machine.epoch != epoch {
                    return;
                }
            }
            match std::mem::replace(&mut machine.state, SessionState::Idle) {
                SessionState::Idle => return,
                SessionState::Connecting { waiters } => {
                    machine.epoch += 1;
                    (waiters, None)
                }
                SessionState::Connected { session } => {
                    machine.epoch += 1;
                    (Vec::new(), Some(session))
                }
            }
        };
        log::debug!("link {}: session torn down", self.link.id());
        for waiter in waiters {
            let _ = waiter.send(Err(DriverError::Disconnected));
        }
        if let Some(session) = session {
            session.close();
        }
    }

    /// Drive one connect attempt to completion and notify every waiter
    /// exactly once with the shared outcome. The disconnect observer is
    /// registered before the connect is issued: an event landing while
    /// still connecting fails every waiter with `Disconnected`, and the
    /// same receiver is handed to the session watcher so an event
    /// arriving between connect resolution and watch registration is
    /// buffered rather than lost.
    async fn run_connect(self: Arc<Self>, epoch: u64) {
        let mut events = self.link.on_disconnect();
        let outcome = tokio::select! {
            result = self.establish() => result,
            reason = events.recv() => {
                match reason.unwrap_or(None) {
                    Some(cause) => log::warn!(
                        "link {}: disconnected while connecting: {}",
                        self.link.id(),
                        cause
                    ),
                    None => log::debug!(
                        "link {}: disconnected while connecting",
                        self.link.id()
                    ),
                }
                Err(DriverError::Disconnected)
            }
        };
        let (waiters, result) = {
            let mut machine = self.machine.lock().unwrap();
            if machine.epoch != epoch {
                // Torn down while we were connecting; the waiters were
                // already failed by the teardown path.
                return;
            }
            let waiters = match std::mem::replace(&mut machine.state, SessionState::Idle) {
                SessionState::Connecting { waiters } => waiters,
                other => {
                    machine.state = other;
                    return;
                }
            };
            match outcome {
                Ok(()) => {
                    let session = SessionHandle::new(Arc::clone(&self.link));
                    machine.state = SessionState::Connected {
                        session: Arc::clone(&session),
                    };
                    self.spawn_disconnect_watch(epoch, events);
                    (waiters, Ok(session))
                }
                Err(err) => {
                    log::warn!("link {}: connect failed: {}", self.link.id(), err);
                    (waiters, Err(err))
                }
            }
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    async fn establish(&self) -> Result<(), DriverError> {
        // Another owner of the link may already be driving a connect.
        // Poll with bounded backoff instead of issuing a second request
        // or failing outright.
        let mut attempts = 0;
        while self.link.state() == LinkState::Connecting {
            if attempts >= CONNECT_POLL_ATTEMPTS {
                return Err(DriverError::ConnectFailed(
                    "link stuck in externally driven connect".to_string(),
                ));
            }
            attempts += 1;
            tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
        }
        // Connecting an already-connected link is a cheap no-op at the
        // link level, and issuing it unconditionally keeps reconnects
        // after a session teardown honest.
        self.link
            .connect()
            .await
            .map_err(|err| DriverError::ConnectFailed(err.to_string()))
    }

    fn spawn_disconnect_watch(
        self: &Arc<Self>,
        epoch: u64,
        mut events: broadcast::Receiver<Option<LinkError>>,
    ) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let reason = events.recv().await.unwrap_or(None);
            match &reason {
                Some(cause) => log::warn!(
                    "link {}: disconnected: {}",
                    coordinator.link.id(),
                    cause
                ),
                None => log::debug!("link {}: disconnected", coordinator.link.id()),
            }
            coordinator.teardown(Some(epoch));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkError;
    use crate::simulated::{ConnectBehavior, SimLink};

    #[tokio::test]
    async fn test_connected_session_is_shared() {
        let link = SimLink::new();
        let coordinator = ConnectionCoordinator::new(link.clone() as Arc<dyn Link>);

        let first = coordinator.acquire().await.unwrap();
        let second = coordinator.acquire().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(link.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_teardown_with_no_session_is_a_noop() {
        let link = SimLink::new();
        let coordinator = ConnectionCoordinator::new(link as Arc<dyn Link>);
        coordinator.teardown(None);
        coordinator.teardown(None);
    }

    #[tokio::test]
    async fn test_teardown_fails_pending_waiters() {
        let link = SimLink::new();
        link.set_connect_behavior(ConnectBehavior::Hold);
        let coordinator = ConnectionCoordinator::new(link.clone() as Arc<dyn Link>);

        let pending = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.acquire().await })
        };
        tokio::task::yield_now().await;

        coordinator.teardown(None);
        let result = pending.await.unwrap();
        assert_eq!(result.err(), Some(DriverError::Disconnected));
    }

    #[tokio::test]
    async fn test_stale_epoch_teardown_ignored() {
        let link = SimLink::new();
        let coordinator = ConnectionCoordinator::new(link.clone() as Arc<dyn Link>);

        let _session = coordinator.acquire().await.unwrap();
        coordinator.teardown(None); // epoch 0 -> 1

        // A watcher from the torn-down generation must not touch the new one.
        let fresh = coordinator.acquire().await.unwrap();
        coordinator.teardown(Some(0));
        let mut closed = fresh.attach().unwrap();
        assert!(closed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_event_during_connect_fails_waiters() {
        let link = SimLink::new();
        link.set_connect_behavior(ConnectBehavior::Hold);
        let coordinator = ConnectionCoordinator::new(link.clone() as Arc<dyn Link>);

        let pending = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.acquire().await })
        };
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        // The peer drops the link while the connect is still pending.
        link.inject_disconnect(Some(LinkError::Disconnected));

        let result = pending.await.unwrap();
        assert_eq!(result.err(), Some(DriverError::Disconnected));

        // The coordinator is back in Idle and can connect again.
        link.set_connect_behavior(ConnectBehavior::Succeed);
        coordinator.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn test_attach_after_teardown_is_disconnected() {
        let link = SimLink::new();
        let coordinator = ConnectionCoordinator::new(link.clone() as Arc<dyn Link>);

        let session = coordinator.acquire().await.unwrap();
        coordinator.teardown(None);

        // An operation holding the handle from before the teardown must
        // fail to attach, not wait on a signal that already fired.
        assert_eq!(session.attach().err(), Some(DriverError::Disconnected));
    }

    #[tokio::test]
    async fn test_link_disconnect_event_tears_down_session() {
        let link = SimLink::new();
        let coordinator = ConnectionCoordinator::new(link.clone() as Arc<dyn Link>);

        let session = coordinator.acquire().await.unwrap();
        let mut closed = session.attach().unwrap();

        link.inject_disconnect(Some(LinkError::Disconnected));
        closed.recv().await.unwrap();

        // The coordinator is reusable after the event.
        let fresh = coordinator.acquire().await.unwrap();
        assert!(!Arc::ptr_eq(&session, &fresh));
        assert_eq!(link.connect_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_externally_driven_connect_is_polled_not_duplicated() {
        let link = SimLink::new();
        link.set_state(LinkState::Connecting);
        let coordinator = ConnectionCoordinator::new(link.clone() as Arc<dyn Link>);

        let pending = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(120)).await;
        link.set_state(LinkState::Connected);

        let session = pending.await.unwrap().unwrap();
        assert_eq!(session.link.id(), link.id());
        // One connect of our own once the outside attempt settled, not a
        // second one racing it.
        assert_eq!(link.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_externally_driven_connect_backoff_is_bounded() {
        let link = SimLink::new();
        link.set_state(LinkState::Connecting);
        let coordinator = ConnectionCoordinator::new(link.clone() as Arc<dyn Link>);

        let result = coordinator.acquire().await;
        assert!(matches!(result, Err(DriverError::ConnectFailed(_))));
    }
}
