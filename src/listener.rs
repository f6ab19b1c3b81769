//! Handoff queues and virtual listeners.
//!
//! A handoff queue moves accepted streams from the channel router to a
//! backend's HTTP server. It behaves as a rendezvous: [`HandoffSender::send`]
//! only completes once a matching [`Listener::accept`] has taken the
//! stream, so a stalled backend slows down admissions for that backend and
//! nothing else.

use std::future::Future;
use std::net::SocketAddr;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TunnelError;
use crate::stream::Connection;

/// Anything an HTTP server can pull connections from.
pub trait Listener: Send + Sync + 'static {
    type Conn: Connection;

    /// Wait for the next connection. [`TunnelError::ListenerClosed`] means the
    /// listener is done for good; other errors are transient.
    fn accept(&self) -> impl Future<Output = Result<Self::Conn, TunnelError>> + Send;

    /// Bound address, if the listener has one.
    fn local_addr(&self) -> Option<SocketAddr>;
}

struct Handoff<T> {
    item: T,
    ack: oneshot::Sender<()>,
}

/// Create a connected producer/consumer pair.
pub fn handoff<T>() -> (HandoffSender<T>, VirtualListener<T>) {
    let (tx, rx) = mpsc::channel(1);
    let producer_closed = CancellationToken::new();
    // Cancelled when either side closes.
    let closed = producer_closed.child_token();
    (
        HandoffSender {
            tx,
            producer_closed,
            closed: closed.clone(),
        },
        VirtualListener {
            rx: Mutex::new(rx),
            closed,
        },
    )
}

/// Producer end of a handoff queue.
pub struct HandoffSender<T> {
    tx: mpsc::Sender<Handoff<T>>,
    producer_closed: CancellationToken,
    closed: CancellationToken,
}

impl<T> Clone for HandoffSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            producer_closed: self.producer_closed.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<T: Send> HandoffSender<T> {
    /// Hand `item` to the consumer, waiting until it has been accepted.
    ///
    /// Returns [`TunnelError::ListenerClosed`] if either side closes first;
    /// the item is dropped in that case.
    pub async fn send(&self, item: T) -> Result<(), TunnelError> {
        let (ack_tx, mut ack_rx) = oneshot::channel();
        let handoff = Handoff { item, ack: ack_tx };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(TunnelError::ListenerClosed),
            sent = self.tx.send(handoff) => {
                sent.map_err(|_| TunnelError::ListenerClosed)?;
            }
        }

        tokio::select! {
            biased;
            acked = &mut ack_rx => acked.map_err(|_| TunnelError::ListenerClosed),
            _ = self.closed.cancelled() => Err(TunnelError::ListenerClosed),
        }
    }
}

impl<T> HandoffSender<T> {
    /// Close the producer side. Pending and future sends fail, and the
    /// paired listener reports closure. Idempotent.
    pub fn close(&self) {
        self.producer_closed.cancel();
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Consumer end of a handoff queue, usable wherever a [`Listener`] is.
///
/// It has no network address of its own; [`Listener::local_addr`] returns
/// `None`. One consumer per listener is expected.
pub struct VirtualListener<T> {
    rx: Mutex<mpsc::Receiver<Handoff<T>>>,
    closed: CancellationToken,
}

impl<T> VirtualListener<T> {
    /// Wait for the next handed-off item.
    pub async fn next(&self) -> Result<T, TunnelError> {
        if self.closed.is_cancelled() {
            return Err(TunnelError::ListenerClosed);
        }

        let mut rx = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(TunnelError::ListenerClosed),
            rx = self.rx.lock() => rx,
        };

        loop {
            let handoff = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(TunnelError::ListenerClosed),
                handoff = rx.recv() => handoff,
            };

            let Some(Handoff { item, ack }) = handoff else {
                return Err(TunnelError::ListenerClosed);
            };
            if self.closed.is_cancelled() {
                return Err(TunnelError::ListenerClosed);
            }
            if ack.send(()).is_ok() {
                return Ok(item);
            }
            debug!("Producer abandoned handoff, skipping");
        }
    }

    /// Mark the listener closed and wake any pending accept. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl<T: Connection> Listener for VirtualListener<T> {
    type Conn = T;

    fn accept(&self) -> impl Future<Output = Result<T, TunnelError>> + Send {
        self.next()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Listener for tokio::net::TcpListener {
    type Conn = tokio::net::TcpStream;

    async fn accept(&self) -> Result<tokio::net::TcpStream, TunnelError> {
        let (stream, _) = tokio::net::TcpListener::accept(self).await?;
        Ok(stream)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        tokio::net::TcpListener::local_addr(self).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_send_blocks_until_accept() {
        let (tx, listener) = handoff::<u32>();

        let sender = tokio::spawn(async move { tx.send(7).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sender.is_finished(), "send must wait for a consumer");

        assert_eq!(listener.next().await.unwrap(), 7);
        timeout(Duration::from_secs(1), sender)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_each_accept_consumes_exactly_one() {
        let (tx, listener) = handoff::<u32>();

        let first = tokio::spawn({
            let tx = tx.clone();
            async move { tx.send(1).await }
        });
        let second = tokio::spawn({
            let tx = tx.clone();
            async move { tx.send(2).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let got = listener.next().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let finished = [first.is_finished(), second.is_finished()];
        assert_eq!(finished.iter().filter(|f| **f).count(), 1);

        let other = listener.next().await.unwrap();
        let mut got = vec![got, other];
        got.sort();
        assert_eq!(got, vec![1, 2]);
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_routes_do_not_block_each_other() {
        let (stalled_tx, _stalled) = handoff::<u32>();
        let (tx, listener) = handoff::<u32>();

        let stalled = tokio::spawn(async move { stalled_tx.send(1).await });
        let sender = tokio::spawn(async move { tx.send(2).await });

        assert_eq!(
            timeout(Duration::from_secs(1), listener.next())
                .await
                .unwrap()
                .unwrap(),
            2
        );
        sender.await.unwrap().unwrap();
        assert!(!stalled.is_finished());
        stalled.abort();
    }

    #[tokio::test]
    async fn test_close_wakes_pending_accept() {
        let (_tx, listener) = handoff::<u32>();
        let listener = Arc::new(listener);

        let pending = tokio::spawn({
            let listener = listener.clone();
            async move { listener.next().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        listener.close();

        let result = timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
        assert!(matches!(result, Err(TunnelError::ListenerClosed)));
        assert!(matches!(listener.next().await, Err(TunnelError::ListenerClosed)));
        listener.close();
    }

    #[tokio::test]
    async fn test_closed_listener_never_yields_queued_item() {
        let (tx, listener) = handoff::<u32>();
        let sender = tokio::spawn(async move { tx.send(9).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        listener.close();
        assert!(matches!(listener.next().await, Err(TunnelError::ListenerClosed)));
        let result = timeout(Duration::from_secs(1), sender).await.unwrap().unwrap();
        assert!(matches!(result, Err(TunnelError::ListenerClosed)));
    }

    #[tokio::test]
    async fn test_producer_close_unblocks_both_sides() {
        let (tx, listener) = handoff::<u32>();
        let blocked = tokio::spawn({
            let tx = tx.clone();
            async move { tx.send(3).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        tx.close();
        tx.close();
        assert!(tx.is_closed());

        let result = timeout(Duration::from_secs(1), blocked).await.unwrap().unwrap();
        assert!(matches!(result, Err(TunnelError::ListenerClosed)));
        assert!(matches!(listener.next().await, Err(TunnelError::ListenerClosed)));
        assert!(listener.is_closed());
        assert!(matches!(tx.send(4).await, Err(TunnelError::ListenerClosed)));
    }

    #[tokio::test]
    async fn test_listener_close_fails_new_sends() {
        let (tx, listener) = handoff::<u32>();
        listener.close();
        assert!(matches!(tx.send(1).await, Err(TunnelError::ListenerClosed)));
    }

    #[tokio::test]
    async fn test_virtual_listener_has_no_address() {
        let (_tx, listener) =
            handoff::<crate::stream::TunnelStream<tokio::io::DuplexStream>>();
        assert_eq!(Listener::local_addr(&listener), None);
    }
}
