//! The primary loop: polls telemetry, takes queued commands one at a time,
//! applies both to the tap store and hands derived events to the dispatcher.

use crate::{
    accountant::VolumeAccountant,
    auth::{AllowList, Authorization},
    notify::{crossed_low_threshold, Dispatcher, NotificationEvent},
    queue::CommandConsumer,
    store::TapStore,
    transport::{InboundMessage, TelemetryTransport},
};
use kegbot_protocol::{CommandParser, ParseOutcome, TelemetryDecoder};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) const UNAUTHORIZED_REPLY: &str = "You are not an approved admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EngineState {
    Starting,
    Running,
    Draining,
    Stopped,
}

pub(crate) struct Engine {
    state: EngineState,
    store: Arc<TapStore>,
    decoder: TelemetryDecoder,
    accountant: VolumeAccountant,
    parser: CommandParser,
    allow_list: AllowList,
    low_volume_threshold: f64,
    dispatcher: Arc<Dispatcher>,
    telemetry: Option<Box<dyn TelemetryTransport>>,
    commands: Option<CommandConsumer>,
    poll_interval: Duration,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<TapStore>,
        decoder: TelemetryDecoder,
        accountant: VolumeAccountant,
        parser: CommandParser,
        allow_list: AllowList,
        low_volume_threshold: f64,
        dispatcher: Arc<Dispatcher>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            state: EngineState::Starting,
            store,
            decoder,
            accountant,
            parser,
            allow_list,
            low_volume_threshold,
            dispatcher,
            telemetry: None,
            commands: None,
            poll_interval,
        }
    }

    pub(crate) fn with_telemetry(mut self, transport: Box<dyn TelemetryTransport>) -> Self {
        self.telemetry = Some(transport);
        self
    }

    pub(crate) fn with_commands(mut self, commands: CommandConsumer) -> Self {
        self.commands = Some(commands);
        self
    }

    fn transition(&mut self, state: EngineState) {
        info!("Engine {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Decodes one telemetry line and applies it to the store.
    pub(crate) fn handle_telemetry_line(&self, line: &[u8]) -> Vec<NotificationEvent> {
        let reading = match self.decoder.decode_bytes(line) {
            Ok(reading) => reading,
            Err(e) => {
                warn!("{e}");
                return Vec::new();
            }
        };

        let Some(deltas) = self.accountant.deltas(&reading) else {
            debug!("Reading below noise threshold, updating temperatures only");
            if let Err(e) = self.store.record_temperatures(&reading.temperatures) {
                error!("Failed to record temperatures: {e}");
            }
            return Vec::new();
        };

        match self
            .store
            .apply_volume_deltas(&deltas, &reading.temperatures)
        {
            Ok(changes) => changes
                .into_iter()
                .filter(|c| crossed_low_threshold(c, self.low_volume_threshold))
                .map(|c| {
                    info!(
                        "Tap {} is low, {:.2} remaining",
                        c.after.index, c.after.remaining_volume
                    );
                    NotificationEvent::LowVolume(c.after)
                })
                .collect(),
            Err(e) => {
                error!("Failed to apply poured volume, telemetry cycle lost: {e}");
                Vec::new()
            }
        }
    }

    /// Parses, authorizes and applies one inbound social message.
    pub(crate) fn handle_inbound(&self, message: InboundMessage) -> Vec<NotificationEvent> {
        let authorization = self.allow_list.authorize(&message.sender);

        let command = match self.parser.parse(&message.sender, &message.text) {
            ParseOutcome::Matched(command) => command,
            ParseOutcome::NotACommand => {
                debug!("Message {} has no command marker, ignoring", message.id);
                return Vec::new();
            }
            ParseOutcome::Malformed(reason) => {
                if authorization == Authorization::Granted {
                    info!("Malformed command from {}: {reason}", message.sender);
                    return vec![NotificationEvent::CommandReject {
                        to: message,
                        reason,
                    }];
                }
                debug!(
                    "Ignoring malformed command from {}: {reason}",
                    message.sender
                );
                return Vec::new();
            }
        };

        if authorization == Authorization::Denied {
            info!(
                "Rejecting command for tap {} from unauthorized sender {}",
                command.tap, message.sender
            );
            return vec![NotificationEvent::CommandReject {
                to: message,
                reason: UNAUTHORIZED_REPLY.to_owned(),
            }];
        }

        match self.store.apply_replacement(&command) {
            Ok(change) => {
                info!(
                    "{} put {} on tap {}",
                    message.sender, change.after.full_name, command.tap
                );
                vec![
                    NotificationEvent::CommandAck {
                        to: message,
                        tap: change.after,
                    },
                    NotificationEvent::NewKeg {
                        tap: command.tap,
                        taps: self.store.snapshot(),
                    },
                ]
            }
            Err(e) => {
                error!("Failed to apply command from {}: {e}", message.sender);
                vec![NotificationEvent::CommandReject {
                    to: message,
                    reason: format!("could not save tap {}, please try again", command.tap),
                }]
            }
        }
    }

    fn dispatch(&self, events: Vec<NotificationEvent>) {
        for event in events {
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move { dispatcher.deliver(event).await });
        }
    }

    /// Returns true if a line was read.
    fn poll_telemetry(&mut self) -> bool {
        let Some(transport) = self.telemetry.as_mut() else {
            return false;
        };

        let line = transport.data_available().and_then(|available| {
            if available {
                transport.read_line()
            } else {
                Ok(None)
            }
        });

        match line {
            Ok(Some(line)) => {
                let events = self.handle_telemetry_line(&line);
                self.dispatch(events);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Telemetry transport failed, continuing without it: {e}");
                self.telemetry = None;
                false
            }
        }
    }

    /// Returns true if a command was taken from the queue.
    fn poll_commands(&mut self) -> bool {
        let Some(message) = self.commands.as_mut().and_then(|c| c.try_pop()) else {
            return false;
        };

        let events = self.handle_inbound(message);
        self.dispatch(events);
        true
    }

    /// Runs the primary loop until `shutdown` is cancelled.
    pub(crate) async fn run(mut self, shutdown: CancellationToken) -> EngineState {
        if self.telemetry.is_none() {
            warn!("No telemetry transport, tap volumes will only change by command");
        }
        if self.commands.is_none() {
            warn!("No command source, taps can not be changed");
        }

        self.transition(EngineState::Running);

        while !shutdown.is_cancelled() {
            let read_telemetry = self.poll_telemetry();
            let took_command = self.poll_commands();

            if read_telemetry || took_command {
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        self.transition(EngineState::Draining);

        self.telemetry = None;
        if let Some(commands) = self.commands.take() {
            let stats = commands.statistics();
            info!(
                "Dropping {} queued commands ({} received, {} discarded)",
                commands.len(),
                stats.total,
                stats.discarded
            );
        }

        self.transition(EngineState::Stopped);
        self.state
    }
}
