//! Background flush loop.
//!
//! A single task drains flush requests queued by buffer writes and, on a fixed
//! interval, flushes every session with pending messages. Being one task, at
//! most one drain runs at a time; a request that arrives mid-drain is picked
//! up on the next loop turn.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use quill_types::SessionId;

use crate::buffer::WriteBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// The session reached the flush threshold.
    Threshold,
    /// The buffer exceeded its global cap and this session was least recently
    /// touched.
    Eviction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushRequest {
    pub session_id: SessionId,
    pub reason: FlushReason,
}

/// Sending half of the flush queue. Scheduling never blocks and never runs
/// the flush on the caller's stack.
#[derive(Debug, Clone)]
pub struct FlushScheduler {
    tx: mpsc::UnboundedSender<FlushRequest>,
}

impl FlushScheduler {
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FlushRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn schedule(&self, request: FlushRequest) {
        if self.tx.send(request).is_err() {
            tracing::debug!("Flush worker stopped; request dropped");
        }
    }
}

pub(crate) async fn run_flush_worker(
    buffer: Arc<WriteBuffer>,
    mut requests: mpsc::UnboundedReceiver<FlushRequest>,
    interval: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            request = requests.recv() => {
                let Some(request) = request else { break };
                handle_request(&buffer, request).await;
            }
            _ = ticker.tick() => {
                match buffer.flush_all().await {
                    Ok(0) => {}
                    Ok(count) => tracing::debug!(count, "Periodic flush complete"),
                    // Failed batches stay buffered; the next tick retries them.
                    Err(err) => tracing::warn!(error = %err, "Periodic flush incomplete"),
                }
            }
        }
    }
    tracing::debug!("Flush worker stopped");
}

async fn handle_request(buffer: &WriteBuffer, request: FlushRequest) {
    let FlushRequest { session_id, reason } = request;
    if let Err(err) = buffer.flush(&session_id).await {
        tracing::warn!(
            session_id = %session_id,
            reason = ?reason,
            error = %err,
            "Scheduled flush failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use quill_config::BufferConfig;
    use quill_types::{Message, MessageId, NewMessage};

    use super::*;
    use crate::buffer::{FlushFut, FlushSink};
    use crate::events::EventBus;

    #[derive(Default)]
    struct MemorySink(Mutex<Vec<Message>>);

    impl FlushSink for MemorySink {
        fn persist<'a>(&'a self, batch: &'a [Message]) -> FlushFut<'a> {
            Box::pin(async move {
                self.0.lock().extend_from_slice(batch);
                Ok(())
            })
        }

        fn purge<'a>(&'a self, _ids: &'a [MessageId]) -> FlushFut<'a> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_request_is_drained_by_worker() {
        let sink = Arc::new(MemorySink::default());
        let (scheduler, rx) = FlushScheduler::channel();
        let config = BufferConfig {
            flush_threshold: 2,
            flush_interval_ms: 60_000,
            ..BufferConfig::default()
        };
        let buffer = Arc::new(WriteBuffer::new(config, sink.clone(), scheduler, EventBus::new()));
        let mut events = buffer.events().subscribe();
        let (stop, stopped) = oneshot::channel();
        let worker = tokio::spawn(run_flush_worker(
            buffer.clone(),
            rx,
            Duration::from_secs(60),
            stopped,
        ));

        let session = SessionId::new("s1").unwrap();
        buffer.write(NewMessage::user(session.clone(), "a"));
        buffer.write(NewMessage::user(session.clone(), "b"));

        loop {
            if let crate::events::StoreEvent::Flushed { count, .. } =
                events.recv().await.expect("event stream open")
            {
                assert_eq!(count, 2);
                break;
            }
        }
        assert_eq!(sink.0.lock().len(), 2);

        stop.send(()).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn interval_flushes_below_threshold() {
        let sink = Arc::new(MemorySink::default());
        let (scheduler, rx) = FlushScheduler::channel();
        let buffer = Arc::new(WriteBuffer::new(
            BufferConfig::default(),
            sink.clone(),
            scheduler,
            EventBus::new(),
        ));
        let (stop, stopped) = oneshot::channel();
        let worker = tokio::spawn(run_flush_worker(
            buffer.clone(),
            rx,
            Duration::from_millis(500),
            stopped,
        ));

        buffer.write(NewMessage::user(SessionId::new("s1").unwrap(), "lonely"));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(sink.0.lock().len(), 1);
        assert_eq!(buffer.status().total_messages, 0);

        stop.send(()).unwrap();
        worker.await.unwrap();
    }
}
