//! Published connection slot
//!
//! One writer (the connector), any number of read-only observers. The slot
//! holds `None` until the handshake completes and again after teardown.

use tokio::sync::watch;

use super::Connection;

/// Writer side, owned by the connector
#[derive(Debug)]
pub struct SessionSlot {
    tx: watch::Sender<Option<Connection>>,
}

impl SessionSlot {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Observer for consumers
    pub fn reader(&self) -> SessionReader {
        SessionReader {
            rx: self.tx.subscribe(),
        }
    }

    pub fn publish(&self, connection: Connection) {
        self.tx.send_replace(Some(connection));
    }

    pub fn clear(&self) {
        self.tx.send_if_modified(|slot| slot.take().is_some());
    }
}

impl Default for SessionSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of the published connection
#[derive(Debug, Clone)]
pub struct SessionReader {
    rx: watch::Receiver<Option<Connection>>,
}

impl SessionReader {
    /// The connection, if one is published right now
    pub fn current(&self) -> Option<Connection> {
        self.rx.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait for the next change; `None` in the result means the handle was withdrawn.
    /// Returns `Err` once the connector has gone away.
    pub async fn changed(&mut self) -> Result<Option<Connection>, watch::error::RecvError> {
        self.rx.changed().await?;
        Ok(self.rx.borrow_and_update().clone())
    }

    /// Wait until a connection is published. `None` if the connector goes away first.
    pub async fn authenticated(&self) -> Option<Connection> {
        let mut rx = self.rx.clone();
        let result = rx.wait_for(Option::is_some).await;
        result.ok().and_then(|slot| slot.clone())
    }
}
