use tokio::sync::{
    Mutex,
    mpsc::{self, error::TrySendError},
};

use crate::mtcp::tunnel::connector::SharedConnector;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool closed")]
    Closed,
}

/// Bounded queue of idle local connectors.
///
/// Waiters in `acquire` queue up on a fair lock around the receiver, so every
/// waiter is served in arrival order once connectors come back.
pub struct ConnectionPool {
    tx: mpsc::Sender<SharedConnector>,
    rx: Mutex<mpsc::Receiver<SharedConnector>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Connectors currently queued, stale ones included.
    pub fn available(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub async fn add(&self, c: SharedConnector) -> Result<(), PoolError> {
        match self.tx.try_send(c) {
            Ok(()) => {}
            Err(TrySendError::Full(c)) => {
                tracing::warn!(
                    connector = %c.id(),
                    capacity = self.capacity(),
                    "pool: full; more connectors registered than pool_size, waiting for room"
                );
                self.tx.send(c).await.map_err(|_| PoolError::Closed)?;
            }
            Err(TrySendError::Closed(_)) => return Err(PoolError::Closed),
        }
        self.publish();
        Ok(())
    }

    /// Returns a connector after its session ended.
    pub async fn release(&self, c: SharedConnector) -> Result<(), PoolError> {
        tracing::debug!(connector = %c.id(), "pool: released");
        self.add(c).await
    }

    /// Waits for a live connector. Entries closed while queued are dropped.
    pub async fn acquire(&self) -> Result<SharedConnector, PoolError> {
        let mut rx = self.rx.lock().await;
        loop {
            let c = rx.recv().await.ok_or(PoolError::Closed)?;
            self.publish();
            if c.is_closed() {
                tracing::debug!(connector = %c.id(), "pool: discarded stale connector");
                continue;
            }
            tracing::debug!(connector = %c.id(), "pool: acquired");
            return Ok(c);
        }
    }

    /// Looks at up to `count` queued entries without waiting, drops the closed
    /// ones and requeues the rest. Returns how many were dropped.
    ///
    /// When an acquirer is parked on the queue there is nothing to drain: it
    /// takes entries as they arrive and discards stale ones itself.
    pub fn drain(&self, count: usize) -> usize {
        let Ok(mut rx) = self.rx.try_lock() else {
            return 0;
        };

        let mut keep = Vec::new();
        let mut dropped = 0;
        for _ in 0..count {
            match rx.try_recv() {
                Ok(c) if c.is_closed() => dropped += 1,
                Ok(c) => keep.push(c),
                Err(_) => break,
            }
        }
        for c in keep {
            // Room is guaranteed: each of these was just taken out.
            if let Err(err) = self.tx.try_send(c) {
                tracing::warn!(err = %err, "pool: requeue after drain failed");
            }
        }
        self.publish();
        dropped
    }

    fn publish(&self) {
        metrics::gauge!("mtcp_pool_available").set(self.available() as f64);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::mtcp::tunnel::connector::tests::duplex_connector;

    #[tokio::test]
    async fn acquire_waits_until_a_connector_is_added() {
        let pool = Arc::new(ConnectionPool::new(2));
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.available(), 0);

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await.unwrap().id().to_string() }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        let (c, _far) = duplex_connector("c-1");
        pool.add(c).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, "c-1");
        assert_eq!(pool.available(), 0);
    }

    #[tokio::test]
    async fn released_connector_is_handed_out_again() {
        let pool = ConnectionPool::new(1);
        let (c, _far) = duplex_connector("c-1");
        pool.add(c).await.unwrap();

        let first = pool.acquire().await.unwrap();
        pool.release(first.clone()).await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn acquire_skips_closed_connectors() {
        let pool = ConnectionPool::new(3);
        let (dead, _f1) = duplex_connector("c-1");
        let (live, _f2) = duplex_connector("c-2");
        pool.add(dead.clone()).await.unwrap();
        pool.add(live).await.unwrap();
        dead.close().await;

        let got = pool.acquire().await.unwrap();
        assert_eq!(got.id(), "c-2");
        assert_eq!(pool.available(), 0);
    }

    #[tokio::test]
    async fn drain_drops_stale_entries_and_keeps_live_ones() {
        let pool = ConnectionPool::new(4);
        let mut fars = Vec::new();
        let mut conns = Vec::new();
        for i in 0..3 {
            let (c, far) = duplex_connector(&format!("c-{i}"));
            pool.add(c.clone()).await.unwrap();
            conns.push(c);
            fars.push(far);
        }
        conns[0].close().await;
        conns[2].close().await;

        assert_eq!(pool.drain(pool.capacity()), 2);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.acquire().await.unwrap().id(), "c-1");
        assert_eq!(pool.drain(pool.capacity()), 0);
    }

    #[tokio::test]
    async fn drain_does_not_block_behind_a_waiting_acquirer() {
        let pool = Arc::new(ConnectionPool::new(2));
        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await.map(|c| c.id().to_string()) }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(pool.drain(2), 0);

        let (dead, _f1) = duplex_connector("c-1");
        let (live, _f2) = duplex_connector("c-2");
        dead.close().await;
        pool.add(dead).await.unwrap();
        pool.add(live).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got, "c-2");
    }

    #[tokio::test]
    async fn concurrent_acquirers_never_share_a_connector() {
        let pool = Arc::new(ConnectionPool::new(8));
        let mut fars = Vec::new();
        for i in 0..8 {
            let (c, far) = duplex_connector(&format!("c-{i}"));
            pool.add(c).await.unwrap();
            fars.push(far);
        }

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(
                async move { pool.acquire().await.unwrap().id().to_string() },
            ));
        }
        let mut ids = Vec::new();
        for t in tasks {
            ids.push(t.await.unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8);
    }
}
