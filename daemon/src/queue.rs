//! Bounded hand-off of inbound messages from the listener to the engine.
//!
//! When the engine falls behind and the queue is full, the newest message is
//! discarded and counted; messages already queued are never dropped.

use crate::transport::InboundMessage;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// Statistics for messages offered to the queue.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueueStatistics {
    /// Total number of messages offered.
    pub(crate) total: usize,

    /// Number of messages discarded because the queue was full.
    pub(crate) discarded: usize,
}

type SharedStatistics = Arc<Mutex<QueueStatistics>>;

/// Applies `f` and returns the statistics as they are afterwards.
fn update(stats: &SharedStatistics, f: impl FnOnce(&mut QueueStatistics)) -> QueueStatistics {
    let mut stats = stats.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut stats);
    stats.clone()
}

pub(crate) fn command_queue(capacity: usize) -> (CommandProducer, CommandConsumer) {
    let (tx, rx) = mpsc::channel(capacity);
    let stats = SharedStatistics::default();

    (
        CommandProducer {
            tx,
            stats: stats.clone(),
        },
        CommandConsumer { rx, stats },
    )
}

#[derive(Clone)]
pub(crate) struct CommandProducer {
    tx: mpsc::Sender<InboundMessage>,
    stats: SharedStatistics,
}

impl CommandProducer {
    /// Offers a message to the queue without waiting.
    ///
    /// Returns `false` if the message was discarded.
    pub(crate) fn push(&self, message: InboundMessage) -> bool {
        update(&self.stats, |s| s.total = s.total.wrapping_add(1));

        let (message, reason) = match self.tx.try_send(message) {
            Ok(()) => return true,
            Err(TrySendError::Full(message)) => (message, "full"),
            Err(TrySendError::Closed(message)) => (message, "closed"),
        };

        let stats = update(&self.stats, |s| {
            s.discarded = s.discarded.wrapping_add(1);
        });
        warn!(
            "Command queue {reason}, discarding message {} from {} ({} received, {} discarded)",
            message.id, message.sender, stats.total, stats.discarded
        );
        false
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub(crate) struct CommandConsumer {
    rx: mpsc::Receiver<InboundMessage>,
    stats: SharedStatistics,
}

impl CommandConsumer {
    /// Takes the oldest queued message, if any, without waiting.
    pub(crate) fn try_pop(&mut self) -> Option<InboundMessage> {
        self.rx.try_recv().ok()
    }

    pub(crate) fn len(&self) -> usize {
        self.rx.len()
    }

    pub(crate) fn statistics(&self) -> QueueStatistics {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: usize) -> InboundMessage {
        InboundMessage {
            id: id.to_string(),
            sender: "someone".to_owned(),
            text: format!("message {id}"),
        }
    }

    #[test]
    fn test_queue_new() {
        let (_producer, consumer) = command_queue(5);
        assert_eq!(consumer.len(), 0);
        assert_eq!(consumer.statistics(), QueueStatistics::default());
    }

    #[test]
    fn test_queue_push_pop() {
        let (producer, mut consumer) = command_queue(5);

        assert!(producer.push(message(1)));
        assert!(producer.push(message(2)));
        assert_eq!(consumer.len(), 2);

        assert_eq!(consumer.try_pop(), Some(message(1)));
        assert_eq!(consumer.try_pop(), Some(message(2)));
        assert_eq!(consumer.try_pop(), None);

        assert_eq!(
            consumer.statistics(),
            QueueStatistics {
                total: 2,
                discarded: 0
            }
        );
    }

    #[test]
    fn test_queue_overflow_discards_newest() {
        let (producer, mut consumer) = command_queue(3);

        for i in 0..5 {
            producer.push(message(i));
        }

        assert_eq!(consumer.len(), 3);
        assert_eq!(
            consumer.statistics(),
            QueueStatistics {
                total: 5,
                discarded: 2
            }
        );

        assert_eq!(consumer.try_pop(), Some(message(0)));
        assert_eq!(consumer.try_pop(), Some(message(1)));
        assert_eq!(consumer.try_pop(), Some(message(2)));
        assert_eq!(consumer.try_pop(), None);
    }

    #[test]
    fn test_queue_accepts_again_after_drain() {
        let (producer, mut consumer) = command_queue(1);

        assert!(producer.push(message(1)));
        assert!(!producer.push(message(2)));
        assert_eq!(consumer.try_pop(), Some(message(1)));
        assert!(producer.push(message(3)));
        assert_eq!(consumer.try_pop(), Some(message(3)));
    }

    #[test]
    fn test_queue_closed() {
        let (producer, consumer) = command_queue(2);
        drop(consumer);

        assert!(producer.is_closed());
        assert!(!producer.push(message(1)));
    }
}
