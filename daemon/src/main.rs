mod accountant;
mod auth;
mod config;
mod engine;
mod listener;
mod notify;
mod queue;
mod scheduler;
mod store;
mod transport;

#[cfg(test)]
mod test;

use crate::{
    accountant::{Calibration, NoiseGate, VolumeAccountant},
    auth::AllowList,
    config::{Config, SerialConfig, DEFAULT_COMMAND_MARKER, DEFAULT_NEW_KEG_HASHTAG},
    engine::Engine,
    listener::Backoff,
    notify::{Dispatcher, MessageStyle, PushbulletClient, SmtpMailer},
    store::{StateFiles, TapStore},
    transport::{
        serial::SerialTransport,
        social::{SocialClient, SocialStream},
    },
};
use clap::Parser;
use kegbot_protocol::{CommandParser, TelemetryDecoder};
use std::{path::PathBuf, sync::Arc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Tracks the beer left in each keg from flow meter telemetry and social
/// media commands.
#[derive(Parser)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "kegbot.toml")]
    config: PathBuf,

    /// Serial port, overrides the config file
    #[arg(short, long)]
    port: Option<String>,

    /// Serial baud rate, overrides the config file
    #[arg(short, long)]
    baud: Option<u32>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    info!(
        "kegbotd {}",
        git_version::git_version!(args = ["--always", "--dirty=-modified"], fallback = "unknown")
    );

    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            ::std::process::exit(1);
        }
    };
    apply_serial_overrides(&mut config, cli.port, cli.baud);

    let store = match TapStore::open(
        StateFiles::new(config.state.record.clone(), config.state.projection.clone()),
        config.taps.count,
        config.taps.temperature_probes,
    ) {
        Ok(store) => {
            info!("Last known temperatures {:?}", store.temperatures());
            Arc::new(store)
        }
        Err(e) => {
            error!("Failed to open tap store: {e}");
            ::std::process::exit(1);
        }
    };

    let marker = config
        .social
        .as_ref()
        .map_or(DEFAULT_COMMAND_MARKER, |s| s.command_marker.as_str());

    let (decoder, parser) = match (
        TelemetryDecoder::new(config.taps.count.into(), config.taps.temperature_probes),
        CommandParser::new(marker, config.taps.count),
    ) {
        (Ok(decoder), Ok(parser)) => (decoder, parser),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to build input parsers: {e}");
            ::std::process::exit(1);
        }
    };

    let allow_list = AllowList::new(config.social.iter().flat_map(|s| s.admins.iter()));
    if allow_list.is_empty() {
        warn!("No admins configured, every command will be rejected");
    }

    let social_client = config
        .social
        .as_ref()
        .and_then(|social| match SocialClient::new(social) {
            Ok(client) => Some(client),
            Err(e) => {
                error!("Failed to create social client: {e}");
                None
            }
        });

    let shutdown = CancellationToken::new();
    let dispatcher = Arc::new(build_dispatcher(&config, social_client.clone()));
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let mut engine = Engine::new(
        store.clone(),
        decoder,
        VolumeAccountant::new(
            Calibration {
                pulses_per_unit: config.taps.pulses_per_unit,
                unit_divisor: config.taps.unit_divisor,
            },
            NoiseGate {
                threshold: config.taps.noise_threshold,
            },
        ),
        parser,
        allow_list,
        config.taps.low_volume_threshold,
        dispatcher.clone(),
        config.engine.poll_interval(),
    );

    match &config.serial {
        Some(serial) => match SerialTransport::open(&serial.port, serial.baud) {
            Ok(transport) => {
                info!("Reading telemetry from {} at {} baud", serial.port, serial.baud);
                engine = engine.with_telemetry(Box::new(transport));
            }
            Err(e) => error!("{e}"),
        },
        None => info!("No serial port configured"),
    }

    match (&config.social, social_client) {
        (Some(social), Some(client)) => {
            let (producer, consumer) = queue::command_queue(social.queue_capacity);
            let source = SocialStream::new(client, social.search_term());
            info!("Listening for posts matching {:?}", social.search_term());

            tasks.push(tokio::spawn(listener::run(
                source,
                producer,
                Backoff::default(),
                shutdown.clone(),
            )));
            engine = engine.with_commands(consumer);
        }
        (Some(_), None) => {}
        (None, _) => info!("No social account configured"),
    }

    match config.digest.schedule() {
        Ok(schedule) if !schedule.is_empty() => {
            tasks.push(tokio::spawn(scheduler::run(
                schedule,
                store.clone(),
                dispatcher.clone(),
                shutdown.clone(),
            )));
        }
        Ok(_) => info!("No digest times configured"),
        Err(e) => error!("{e}"),
    }

    tokio::spawn(wait_for_signal(shutdown.clone()));

    engine.run(shutdown.clone()).await;

    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task failed: {e}");
        }
    }
}

fn apply_serial_overrides(config: &mut Config, port: Option<String>, baud: Option<u32>) {
    if let Some(port) = port {
        let serial = config.serial.get_or_insert_with(|| SerialConfig {
            port: String::new(),
            baud: baud.unwrap_or(9600),
        });
        serial.port = port;
    }

    if let (Some(baud), Some(serial)) = (baud, config.serial.as_mut()) {
        serial.baud = baud;
    }
}

fn build_dispatcher(config: &Config, social: Option<SocialClient>) -> Dispatcher {
    let mut dispatcher = Dispatcher::new(MessageStyle {
        low_volume_threshold: config.taps.low_volume_threshold,
        litres_per_unit: config.taps.litres_per_unit,
        new_keg_hashtag: config
            .social
            .as_ref()
            .map_or(DEFAULT_NEW_KEG_HASHTAG, |s| s.new_keg_hashtag.as_str())
            .to_owned(),
    });

    if let Some(push) = &config.push {
        match PushbulletClient::new(push) {
            Ok(client) => dispatcher = dispatcher.with_push(Arc::new(client)),
            Err(e) => error!("Failed to create push client: {e}"),
        }
    }

    if let Some(client) = social {
        dispatcher = dispatcher.with_social(Arc::new(client));
    }

    if let Some(mail) = &config.mail {
        match SmtpMailer::new(mail) {
            Ok(mailer) => dispatcher = dispatcher.with_mail(Arc::new(mailer)),
            Err(e) => error!("Failed to create mailer: {e}"),
        }
    }

    dispatcher
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Interrupted"),
                    _ = terminate.recv() => info!("Terminated"),
                }
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {e}");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for interrupt: {e}");
                    return;
                }
                info!("Interrupted");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for interrupt: {e}");
            return;
        }
        info!("Interrupted");
    }

    shutdown.cancel();
}
