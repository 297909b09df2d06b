//! Keeps a message source connected and feeds what it receives into the
//! command queue.

use crate::{
    queue::CommandProducer,
    transport::{MessageSource, SourceError},
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Doubling reconnect delay, capped at [`MAX_BACKOFF`].
#[derive(Debug)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Returns the delay to wait now and doubles the following one.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Runs until `shutdown` is cancelled or the queue's consumer goes away.
pub(crate) async fn run<S: MessageSource>(
    mut source: S,
    queue: CommandProducer,
    mut backoff: Backoff,
    shutdown: CancellationToken,
) {
    info!("Command listener started");

    loop {
        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = source.next_message() => result,
        };

        match result {
            Ok(message) => {
                backoff.reset();
                debug!("Received message {} from {}", message.id, message.sender);
                queue.push(message);

                if queue.is_closed() {
                    break;
                }
            }
            Err(e) => {
                let delay = backoff.next_delay();
                match e {
                    SourceError::Closed => info!("Message stream closed, reconnecting in {delay:?}"),
                    e => warn!("Message stream error: {e}, reconnecting in {delay:?}"),
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    info!("Command listener stopped");
}
