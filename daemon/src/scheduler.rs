//! Daily digest timing.

use crate::{
    notify::{Dispatcher, NotificationEvent},
    store::TapStore,
};
use chrono::{Days, Local, NaiveDateTime, NaiveTime, TimeZone};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Wall clock times of day at which the digest goes out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DigestSchedule {
    times: Vec<NaiveTime>,
}

impl DigestSchedule {
    pub(crate) fn new(mut times: Vec<NaiveTime>) -> Self {
        times.sort();
        times.dedup();
        Self { times }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// The first scheduled instant strictly after `now`.
    pub(crate) fn next_after(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        let today = now.date();

        self.times
            .iter()
            .map(|t| today.and_time(*t))
            .find(|at| *at > now)
            .or_else(|| {
                let first = self.times.first()?;
                Some(today.checked_add_days(Days::new(1))?.and_time(*first))
            })
    }

    /// The firing after one sent at `sent`, even if the clock now reads earlier.
    pub(crate) fn following(
        &self,
        sent: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Option<NaiveDateTime> {
        self.next_after(sent.max(now))
    }
}

fn until(at: NaiveDateTime) -> Duration {
    // Instants skipped by a DST change fire straight away
    let target = Local
        .from_local_datetime(&at)
        .earliest()
        .map(|t| t.signed_duration_since(Local::now()))
        .unwrap_or_else(chrono::Duration::zero);

    target.to_std().unwrap_or_default()
}

/// Sends a digest of the tap table at every scheduled time until cancelled.
pub(crate) async fn run(
    schedule: DigestSchedule,
    store: Arc<TapStore>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) {
    info!("Digest scheduler started");

    let mut next = schedule.next_after(Local::now().naive_local());

    while let Some(at) = next {
        debug!("Next digest at {at}");

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(until(at)) => {}
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Abandoning digest delivery");
                break;
            }
            _ = dispatcher.deliver(NotificationEvent::Digest(store.snapshot())) => {}
        }

        next = schedule.following(at, Local::now().naive_local());
    }

    info!("Digest scheduler stopped");
}
