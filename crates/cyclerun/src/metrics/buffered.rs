use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use super::{CycleOutcome, MetricsSink, SinkEvent};
use crate::cycles::Cycle;
use crate::errors::ErrorKind;

enum Message {
    Event(SinkEvent),
    Flush(oneshot::Sender<()>),
}

/// Decouples motors from a slow sink with a bounded queue and a forwarding
/// task. When the queue is full events are dropped and counted; the motor
/// never waits on the sink.
pub struct BufferedSink {
    sender: mpsc::Sender<Message>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
    forwarded: Arc<AtomicU64>,
}

impl BufferedSink {
    /// Must be called from within a tokio runtime.
    pub fn spawn(inner: Arc<dyn MetricsSink>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, mut receiver) = mpsc::channel(capacity);
        let forwarded = Arc::new(AtomicU64::new(0));
        let task_forwarded = Arc::clone(&forwarded);
        // Ends once the sink is dropped and the queue has drained.
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                match message {
                    Message::Event(event) => {
                        event.deliver(inner.as_ref());
                        task_forwarded.fetch_add(1, Ordering::Relaxed);
                    }
                    Message::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self {
            sender,
            capacity,
            dropped: Arc::new(AtomicU64::new(0)),
            forwarded,
        }
    }

    fn push(&self, event: SinkEvent) {
        if self.sender.try_send(Message::Event(event)).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!(
                    dropped,
                    capacity = self.capacity,
                    "metrics buffer full, dropping events"
                );
            }
        }
    }

    /// Resolves once every event queued before the call has been delivered.
    pub async fn flush(&self) {
        let (done, delivered) = oneshot::channel();
        if self.sender.send(Message::Flush(done)).await.is_ok() {
            let _ = delivered.await;
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }
}

impl MetricsSink for BufferedSink {
    fn on_start(&self, cycle: Cycle) {
        self.push(SinkEvent::Start { cycle });
    }

    fn on_complete(&self, cycle: Cycle, latency_nanos: u64, outcome: CycleOutcome) {
        self.push(SinkEvent::Complete {
            cycle,
            latency_nanos,
            outcome,
        });
    }

    fn on_error(&self, cycle: Cycle, kind: ErrorKind) {
        self.push(SinkEvent::Error { cycle, kind });
    }
}
