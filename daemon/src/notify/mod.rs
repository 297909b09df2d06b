//! Turning tap events into outbound messages and getting them out the door.
//!
//! Rendering is pure; delivery fans each message out to its sink and logs,
//! but otherwise ignores, any sink that fails.

mod mail;
mod push;

pub(crate) use mail::SmtpMailer;
pub(crate) use push::PushbulletClient;

use crate::{store::TapChange, transport::InboundMessage};
use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use futures_util::future::join_all;
use kegbot_protocol::{Tap, TapIndex, TapTable};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Timestamp appended to replies so that repeated replies are never identical.
const REPLY_TIMESTAMP_FORMAT: &str = "%m/%d/%y %H:%M:%S";

#[derive(thiserror::Error, Debug)]
pub(crate) enum SinkError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid mail address: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("Failed to build mail: {0}")]
    Message(#[from] lettre::error::Error),

    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

#[async_trait]
pub(crate) trait PushSink: Send + Sync {
    async fn push_note(&self, title: &str, body: &str) -> Result<(), SinkError>;
}

#[async_trait]
pub(crate) trait SocialSink: Send + Sync {
    async fn post_status(&self, text: &str) -> Result<(), SinkError>;
    async fn reply(&self, in_reply_to: &str, text: &str) -> Result<(), SinkError>;
}

#[async_trait]
pub(crate) trait MailSink: Send + Sync {
    async fn send_mail(&self, subject: &str, body: &str) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NotificationEvent {
    /// An active tap has just dropped below the low volume threshold.
    LowVolume(Tap),

    /// A keg was accepted onto `tap`; `taps` is the table right after.
    NewKeg { tap: TapIndex, taps: TapTable },

    /// Scheduled summary of every tap.
    Digest(TapTable),

    CommandAck { to: InboundMessage, tap: Tap },
    CommandReject { to: InboundMessage, reason: String },
}

impl NotificationEvent {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::LowVolume(_) => "low volume",
            Self::NewKeg { .. } => "new keg",
            Self::Digest(_) => "digest",
            Self::CommandAck { .. } => "command ack",
            Self::CommandReject { .. } => "command reject",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outbound {
    Push { title: String, body: String },
    Broadcast(String),
    Reply { in_reply_to: String, text: String },
    Mail { subject: String, body: String },
}

/// True if this change is the one that took an active tap below `threshold`.
pub(crate) fn crossed_low_threshold(change: &TapChange, threshold: f64) -> bool {
    !change.before.is_low(threshold) && change.after.is_low(threshold)
}

/// Wording settings for rendered messages.
#[derive(Debug, Clone)]
pub(crate) struct MessageStyle {
    pub(crate) low_volume_threshold: f64,
    pub(crate) litres_per_unit: f64,
    pub(crate) new_keg_hashtag: String,
}

#[derive(Clone)]
pub(crate) struct Dispatcher {
    style: MessageStyle,
    push: Option<Arc<dyn PushSink>>,
    social: Option<Arc<dyn SocialSink>>,
    mail: Option<Arc<dyn MailSink>>,
}

impl Dispatcher {
    pub(crate) fn new(style: MessageStyle) -> Self {
        Self {
            style,
            push: None,
            social: None,
            mail: None,
        }
    }

    pub(crate) fn with_push(mut self, sink: Arc<dyn PushSink>) -> Self {
        self.push = Some(sink);
        self
    }

    pub(crate) fn with_social(mut self, sink: Arc<dyn SocialSink>) -> Self {
        self.social = Some(sink);
        self
    }

    pub(crate) fn with_mail(mut self, sink: Arc<dyn MailSink>) -> Self {
        self.mail = Some(sink);
        self
    }

    fn litres(&self, volume: f64) -> f64 {
        volume * self.style.litres_per_unit
    }

    fn tap_summary(taps: &TapTable) -> String {
        taps.iter()
            .map(|t| format!("Tap {}: {} ({:.2} gal.)", t.index, t.short_name, t.remaining_volume))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn reply(to: &InboundMessage, text: &str, now: NaiveDateTime) -> Outbound {
        Outbound::Reply {
            in_reply_to: to.id.clone(),
            text: format!(
                "@{} {} {}",
                to.sender,
                text,
                now.format(REPLY_TIMESTAMP_FORMAT)
            ),
        }
    }

    pub(crate) fn render(&self, event: &NotificationEvent, now: NaiveDateTime) -> Vec<Outbound> {
        match event {
            NotificationEvent::LowVolume(tap) => vec![Outbound::Push {
                title: "Low keg".to_owned(),
                body: format!(
                    "Tap {}: {} has {:.2} gal. ({:.1}L) remaining",
                    tap.index,
                    tap.full_name,
                    tap.remaining_volume,
                    self.litres(tap.remaining_volume)
                ),
            }],
            NotificationEvent::NewKeg { tap, taps } => {
                let summary = Self::tap_summary(taps);
                let headline = match taps.get(*tap) {
                    Some(t) => format!(
                        "{} Tap {}: {}",
                        self.style.new_keg_hashtag, tap, t.full_name
                    ),
                    None => self.style.new_keg_hashtag.clone(),
                };
                vec![
                    Outbound::Broadcast(format!("{headline}\n{summary}")),
                    Outbound::Push {
                        title: "New Keg!".to_owned(),
                        body: summary,
                    },
                ]
            }
            NotificationEvent::Digest(taps) => {
                let subject = if taps
                    .iter()
                    .any(|t| t.is_low(self.style.low_volume_threshold))
                {
                    "LOW KEG ALERT".to_owned()
                } else {
                    taps.iter()
                        .map(|t| format!("Tap{}:{:.2}", t.index, t.remaining_volume))
                        .collect::<Vec<_>>()
                        .join(" ")
                };

                let body = taps
                    .iter()
                    .map(|t| {
                        format!(
                            "Tap {}, {}, {:.2}gal ({:.1}L) remaining",
                            t.index,
                            t.full_name,
                            t.remaining_volume,
                            self.litres(t.remaining_volume)
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");

                vec![Outbound::Mail { subject, body }]
            }
            NotificationEvent::CommandAck { to, tap } => vec![Self::reply(
                to,
                &format!(
                    "successfully put {:.2} gal. ({:.1}L) of {} on Tap #{}",
                    tap.remaining_volume,
                    self.litres(tap.remaining_volume),
                    tap.full_name,
                    tap.index
                ),
                now,
            )],
            NotificationEvent::CommandReject { to, reason } => {
                vec![Self::reply(to, reason, now)]
            }
        }
    }

    /// Renders `event` and sends every resulting message, never failing.
    pub(crate) async fn deliver(&self, event: NotificationEvent) {
        let outbound = self.render(&event, Local::now().naive_local());
        info!(
            "Delivering {} notification as {} message(s)",
            event.kind(),
            outbound.len()
        );

        join_all(outbound.into_iter().map(|o| self.send(o))).await;
    }

    async fn send(&self, outbound: Outbound) {
        let result = match &outbound {
            Outbound::Push { title, body } => match &self.push {
                Some(sink) => sink.push_note(title, body).await,
                None => {
                    debug!("No push sink configured, dropping {:?}", title);
                    return;
                }
            },
            Outbound::Broadcast(text) => match &self.social {
                Some(sink) => sink.post_status(text).await,
                None => {
                    debug!("No social sink configured, dropping broadcast");
                    return;
                }
            },
            Outbound::Reply { in_reply_to, text } => match &self.social {
                Some(sink) => sink.reply(in_reply_to, text).await,
                None => {
                    debug!("No social sink configured, dropping reply {:?}", text);
                    return;
                }
            },
            Outbound::Mail { subject, body } => match &self.mail {
                Some(sink) => sink.send_mail(subject, body).await,
                None => {
                    debug!("No mail sink configured, dropping {:?}", subject);
                    return;
                }
            },
        };

        match result {
            Ok(()) => debug!("Sent {:?}", outbound),
            Err(e) => warn!("Failed to send {:?}: {e}", outbound),
        }
    }
}
