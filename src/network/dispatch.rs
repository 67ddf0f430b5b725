//! Frame dispatch
//!
//! Receive loops hand every reassembled frame to a [`Dispatcher`], which runs
//! the [`MessageHandler`] on a separate task. At most `workers` handler
//! invocations run at once; when all are busy, `submit` waits, which stalls
//! the submitting receive loop instead of growing the task count.

use crate::network::link::{Channel, Link};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Consumer of complete frames
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Called once per frame; `frame` is `header ‖ payload`
    async fn handle_frame(&self, link: Arc<Link>, channel: Channel, frame: Bytes);
}

#[derive(Clone)]
pub struct Dispatcher {
    handler: Arc<dyn MessageHandler>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn MessageHandler>, workers: usize) -> Self {
        Self {
            handler,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Queue one frame, waiting for a free worker slot
    pub async fn submit(&self, link: Arc<Link>, channel: Channel, frame: Bytes) {
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                log::debug!("Dispatcher closed, dropping frame from {}", link.addr());
                return;
            }
        };

        let handler = self.handler.clone();
        tokio::spawn(async move {
            handler.handle_frame(link, channel, frame).await;
            drop(permit);
        });
    }

    /// Worker slots currently free
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Refuse further frames
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::network::constants::NETWORK_MAGIC;
    use crate::network::message::build_frame;
    use crate::transport::tcp::loopback_pair;
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};

    /// Forwards every frame it sees to a channel
    pub(crate) struct RecordingHandler {
        tx: mpsc::UnboundedSender<(Channel, Bytes)>,
    }

    impl RecordingHandler {
        pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(Channel, Bytes)>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Arc::new(Self { tx }), rx)
        }
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle_frame(&self, _link: Arc<Link>, channel: Channel, frame: Bytes) {
            let _ = self.tx.send((channel, frame));
        }
    }

    /// Blocks every invocation until released
    struct GateHandler {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl MessageHandler for GateHandler {
        async fn handle_frame(&self, _link: Arc<Link>, _channel: Channel, _frame: Bytes) {
            self.gate.notified().await;
        }
    }

    async fn test_link() -> Arc<Link> {
        let (a, _b) = loopback_pair().await;
        Arc::new(Link::inbound(a))
    }

    #[tokio::test]
    async fn test_frames_reach_handler() {
        let (handler, mut rx) = RecordingHandler::new();
        let dispatcher = Dispatcher::new(handler, 2);
        let link = test_link().await;
        let frame = build_frame(NETWORK_MAGIC, "ping", b"{}");

        dispatcher
            .submit(link, Channel::Consensus, frame.clone())
            .await;
        let (channel, got) = rx.recv().await.unwrap();
        assert_eq!(channel, Channel::Consensus);
        assert_eq!(got, frame);
    }

    #[tokio::test]
    async fn test_submit_waits_when_workers_busy() {
        let gate = Arc::new(Notify::new());
        let dispatcher = Dispatcher::new(Arc::new(GateHandler { gate: gate.clone() }), 2);
        let link = test_link().await;
        let frame = build_frame(NETWORK_MAGIC, "ping", b"{}");

        dispatcher.submit(link.clone(), Channel::Data, frame.clone()).await;
        dispatcher.submit(link.clone(), Channel::Data, frame.clone()).await;
        assert_eq!(dispatcher.available(), 0);

        let third = dispatcher.submit(link.clone(), Channel::Data, frame.clone());
        assert!(tokio::time::timeout(Duration::from_millis(50), third)
            .await
            .is_err());

        gate.notify_one();
        tokio::time::timeout(
            Duration::from_secs(2),
            dispatcher.submit(link, Channel::Data, frame),
        )
        .await
        .unwrap();
        gate.notify_waiters();
    }

    #[tokio::test]
    async fn test_closed_dispatcher_drops() {
        let (handler, mut rx) = RecordingHandler::new();
        let dispatcher = Dispatcher::new(handler, 1);
        dispatcher.close();

        let link = test_link().await;
        dispatcher
            .submit(link, Channel::Data, build_frame(NETWORK_MAGIC, "ping", b"{}"))
            .await;
        assert!(rx.try_recv().is_err());
    }
}
