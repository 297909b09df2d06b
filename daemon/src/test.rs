use crate::{
    accountant::{Calibration, NoiseGate, VolumeAccountant},
    auth::AllowList,
    engine::{Engine, EngineState, UNAUTHORIZED_REPLY},
    notify::{tests::RecordingSink, Dispatcher, MessageStyle, NotificationEvent, Outbound},
    queue::command_queue,
    store::{StateFiles, TapStore},
    transport::{InboundMessage, TelemetryTransport, TransportError},
};
use approx::assert_relative_eq;
use chrono::NaiveDate;
use kegbot_protocol::{CommandParser, Tap, TapStatus, TapTable, TelemetryDecoder};
use rstest::rstest;
use std::{collections::VecDeque, fs, path::PathBuf, sync::Arc, thread, time::Duration};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .init();
}

const PULSES_PER_UNIT: f64 = 170.5;
const UNIT_DIVISOR: f64 = 128.0;

struct Fixture {
    _dir: TempDir,
    store: Arc<TapStore>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let projection = dir.path().join("taps.json");
        Self::open(dir, projection)
    }

    fn open(dir: TempDir, projection: PathBuf) -> Self {
        let store = TapStore::open(
            StateFiles::new(dir.path().join("taps.toml"), projection),
            3,
            1,
        )
        .unwrap();

        Self {
            _dir: dir,
            store: Arc::new(store),
        }
    }

    fn engine(&self, dispatcher: Dispatcher) -> Engine {
        Engine::new(
            self.store.clone(),
            TelemetryDecoder::new(3, 1).unwrap(),
            VolumeAccountant::new(
                Calibration {
                    pulses_per_unit: PULSES_PER_UNIT,
                    unit_divisor: UNIT_DIVISOR,
                },
                NoiseGate { threshold: 10 },
            ),
            CommandParser::new("TAP", 3).unwrap(),
            AllowList::new(["head_brewer"]),
            1.0,
            Arc::new(dispatcher),
            Duration::from_millis(1),
        )
    }

    fn quiet_engine(&self) -> Engine {
        self.engine(Dispatcher::new(style()))
    }

    fn tap(&self, index: u8) -> Tap {
        self.store.snapshot().get(index).cloned().unwrap()
    }

    fn put(&self, engine: &Engine, tap: u8, remaining: f64) {
        let events = engine.handle_inbound(message(
            "head_brewer",
            &format!("TAP {tap}:{remaining:.3}:5.00:ACTIVE:01/02/20:Keg {tap}:K{tap}"),
        ));
        assert_eq!(events.len(), 2);
    }
}

fn style() -> MessageStyle {
    MessageStyle {
        low_volume_threshold: 1.0,
        litres_per_unit: 3.785_411_784,
        new_keg_hashtag: "#NewKeg".to_owned(),
    }
}

fn message(sender: &str, text: &str) -> InboundMessage {
    InboundMessage {
        id: "1001".to_owned(),
        sender: sender.to_owned(),
        text: text.to_owned(),
    }
}

fn poured(pulses: u32) -> f64 {
    pulses as f64 / PULSES_PER_UNIT / UNIT_DIVISOR
}

/// Telemetry link that plays back a fixed set of lines, then optionally fails.
struct ScriptedTransport {
    lines: VecDeque<Vec<u8>>,
    fail_when_done: bool,
}

impl ScriptedTransport {
    fn new(lines: &[&str], fail_when_done: bool) -> Self {
        Self {
            lines: lines.iter().map(|l| l.as_bytes().to_vec()).collect(),
            fail_when_done,
        }
    }
}

impl TelemetryTransport for ScriptedTransport {
    fn data_available(&mut self) -> Result<bool, TransportError> {
        if self.lines.is_empty() && self.fail_when_done {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "unplugged",
            )));
        }
        Ok(!self.lines.is_empty())
    }

    fn read_line(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.lines.pop_front())
    }
}

#[test]
fn noise_only_updates_temperatures() {
    let fixture = Fixture::new();
    let engine = fixture.quiet_engine();
    fixture.put(&engine, 1, 5.0);
    let before = fixture.store.snapshot();

    let events = engine.handle_telemetry_line(b"tap1:10 tap2:3 tap3:0 temp1:4.25");

    assert!(events.is_empty());
    assert_eq!(fixture.store.snapshot(), before);
    assert_eq!(fixture.store.temperatures(), vec![4.25]);
}

#[test]
fn pour_reduces_remaining_by_calibrated_volume() {
    let fixture = Fixture::new();
    let engine = fixture.quiet_engine();
    fixture.put(&engine, 1, 5.0);
    fixture.put(&engine, 2, 3.0);

    let events = engine.handle_telemetry_line(b"tap1:2000 tap2:11 tap3:0 temp1:3.5");

    assert!(events.is_empty());
    assert_relative_eq!(fixture.tap(1).remaining_volume, 5.0 - poured(2000));
    assert_relative_eq!(fixture.tap(2).remaining_volume, 3.0 - poured(11));
    assert_relative_eq!(fixture.tap(3).remaining_volume, 0.0);
    assert_eq!(fixture.store.temperatures(), vec![3.5]);
}

#[rstest]
#[case(b"tap1:2000 tap2:0 temp1:3.5".as_slice())]
#[case(b"tap1:2000 tap2:0 tap3:0".as_slice())]
#[case(b"tap1:2000 tap2:0 tap3:0 temp1:3.5tap1:5".as_slice())]
#[case(b"ap1:2000 tap2:0 tap3:0 temp1:3.5".as_slice())]
#[case(b"tap1:20\xff0 tap2:0 tap3:0 temp1:3.5".as_slice())]
#[case(b"".as_slice())]
fn garbled_telemetry_changes_nothing(#[case] line: &[u8]) {
    let fixture = Fixture::new();
    let engine = fixture.quiet_engine();
    fixture.put(&engine, 1, 5.0);
    let before = fixture.store.snapshot();

    assert!(engine.handle_telemetry_line(line).is_empty());
    assert_eq!(fixture.store.snapshot(), before);
    assert_eq!(fixture.store.temperatures(), vec![0.0]);
}

#[test]
fn low_volume_fires_once_on_crossing() {
    let fixture = Fixture::new();
    let engine = fixture.quiet_engine();
    fixture.put(&engine, 1, 1.05);

    let first = engine.handle_telemetry_line(b"tap1:2000 tap2:0 tap3:0 temp1:3.5");
    let second = engine.handle_telemetry_line(b"tap1:2000 tap2:0 tap3:0 temp1:3.5");

    let [NotificationEvent::LowVolume(tap)] = &first[..] else {
        panic!("expected one low volume event, got {first:?}");
    };
    assert_eq!(tap.index, 1);
    assert!(tap.remaining_volume < 1.0);
    assert!(second.is_empty());
}

#[test]
fn inactive_taps_never_report_low() {
    let fixture = Fixture::new();
    let engine = fixture.quiet_engine();

    let events = engine.handle_telemetry_line(b"tap1:0 tap2:0 tap3:2000 temp1:3.5");

    assert!(events.is_empty());
    assert!(fixture.tap(3).remaining_volume < 0.0);
}

#[test]
fn authorized_command_replaces_tap() {
    let fixture = Fixture::new();
    let engine = fixture.quiet_engine();
    let inbound = message(
        "Head_Brewer",
        "TAP 2:3.50:5.00:ACTIVE:01/02/20:House Lager:Lager",
    );

    let events = engine.handle_inbound(inbound.clone());

    let expected = Tap {
        index: 2,
        remaining_volume: 3.5,
        total_volume: 5.0,
        status: TapStatus::Active,
        tapped_on: NaiveDate::from_ymd_opt(2020, 1, 2),
        full_name: "House Lager".to_owned(),
        short_name: "Lager".to_owned(),
    };
    assert_eq!(fixture.tap(2), expected);

    assert_eq!(
        events,
        vec![
            NotificationEvent::CommandAck {
                to: inbound,
                tap: expected,
            },
            NotificationEvent::NewKeg {
                tap: 2,
                taps: fixture.store.snapshot(),
            },
        ]
    );
}

#[test]
fn unauthorized_command_is_rejected() {
    let fixture = Fixture::new();
    let engine = fixture.quiet_engine();
    let before = fixture.store.snapshot();
    let inbound = message(
        "random_fan",
        "TAP 2:3.50:5.00:ACTIVE:01/02/20:House Lager:Lager",
    );

    let events = engine.handle_inbound(inbound.clone());

    assert_eq!(fixture.store.snapshot(), before);
    assert_eq!(
        events,
        vec![NotificationEvent::CommandReject {
            to: inbound,
            reason: UNAUTHORIZED_REPLY.to_owned(),
        }]
    );
}

#[rstest]
#[case("head_brewer", true)]
#[case("random_fan", false)]
fn malformed_command_only_answered_for_admins(#[case] sender: &str, #[case] answered: bool) {
    let fixture = Fixture::new();
    let engine = fixture.quiet_engine();
    let before = fixture.store.snapshot();

    let events = engine.handle_inbound(message(
        sender,
        "TAP 9:3.50:5.00:ACTIVE:01/02/20:House Lager:Lager",
    ));

    assert_eq!(fixture.store.snapshot(), before);
    match &events[..] {
        [NotificationEvent::CommandReject { reason, .. }] => {
            assert!(answered);
            assert_eq!(reason, "tap 9 does not exist");
        }
        [] => assert!(!answered),
        other => panic!("unexpected events {other:?}"),
    }
}

#[test]
fn chatter_without_marker_is_ignored() {
    let fixture = Fixture::new();
    let engine = fixture.quiet_engine();

    assert!(engine
        .handle_inbound(message("head_brewer", "what is on tap today?"))
        .is_empty());
}

#[test]
fn interleaved_pours_and_commands_lose_nothing() {
    let fixture = Fixture::new();
    fixture.put(&fixture.quiet_engine(), 1, 5.0);

    let pourers = (0..3)
        .map(|_| {
            let engine = fixture.quiet_engine();
            thread::spawn(move || {
                for _ in 0..20 {
                    engine.handle_telemetry_line(b"tap1:500 tap2:0 tap3:0 temp1:4.0");
                }
            })
        })
        .collect::<Vec<_>>();

    let operator = {
        let engine = fixture.quiet_engine();
        thread::spawn(move || {
            for i in 0..20 {
                engine.handle_inbound(message(
                    "head_brewer",
                    &format!("TAP 2:{i}.0:20.0:ACTIVE:01/02/20:Keg {i}:K"),
                ));
            }
        })
    };

    for t in pourers {
        t.join().unwrap();
    }
    operator.join().unwrap();

    assert_relative_eq!(
        fixture.tap(1).remaining_volume,
        5.0 - 60.0 * poured(500),
        epsilon = 1e-9
    );
    assert_eq!(fixture.tap(2).remaining_volume, 19.0);
    assert_eq!(fixture.tap(2).full_name, "Keg 19");
}

#[test]
fn unsaved_replacement_is_rejected_not_acknowledged() {
    let dir = tempfile::tempdir().unwrap();
    let public = dir.path().join("www");
    fs::create_dir(&public).unwrap();
    let fixture = Fixture::open(dir, public.join("taps.json"));
    let engine = fixture.quiet_engine();
    let before = fixture.store.snapshot();

    fs::remove_dir_all(&public).unwrap();

    let inbound = message(
        "head_brewer",
        "TAP 2:3.50:5.00:ACTIVE:01/02/20:House Lager:Lager",
    );
    let events = engine.handle_inbound(inbound.clone());

    assert_eq!(
        events,
        vec![NotificationEvent::CommandReject {
            to: inbound,
            reason: "could not save tap 2, please try again".to_owned(),
        }]
    );
    assert_eq!(fixture.store.snapshot(), before);
}

#[test]
fn pours_and_replacements_on_one_tap_serialize() {
    const POURERS: usize = 3;
    const POURS: usize = 20;
    const REPLACEMENTS: usize = 20;

    let fixture = Fixture::new();
    fixture.put(&fixture.quiet_engine(), 1, 5.0);

    let pourers = (0..POURERS)
        .map(|_| {
            let engine = fixture.quiet_engine();
            thread::spawn(move || {
                for _ in 0..POURS {
                    engine.handle_telemetry_line(b"tap1:500 tap2:0 tap3:0 temp1:4.0");
                }
            })
        })
        .collect::<Vec<_>>();

    // Each keg is 10 units apart, far more than every pour combined, so the
    // final volume identifies which replacement it descends from.
    let operator = {
        let engine = fixture.quiet_engine();
        thread::spawn(move || {
            for i in 1..=REPLACEMENTS {
                let events = engine.handle_inbound(message(
                    "head_brewer",
                    &format!("TAP 1:{}.0:500.0:ACTIVE:01/02/20:Keg {i}:K", i * 10),
                ));
                assert_eq!(events.len(), 2);
            }
        })
    };

    for t in pourers {
        t.join().unwrap();
    }
    operator.join().unwrap();

    let tap = fixture.tap(1);
    assert_eq!(tap.full_name, format!("Keg {REPLACEMENTS}"));
    assert_eq!(tap.total_volume, 500.0);

    // Equal to the last replacement followed by some whole number of pours
    let last = (REPLACEMENTS * 10) as f64;
    let pours_after = (last - tap.remaining_volume) / poured(500);
    assert!(
        (-1e-6..=(POURERS * POURS) as f64 + 1e-6).contains(&pours_after),
        "remaining {} is not reachable from the last keg",
        tap.remaining_volume
    );
    assert_relative_eq!(pours_after, pours_after.round(), epsilon = 1e-6);
}

#[tokio::test]
async fn run_loop_applies_both_channels_and_notifies() {
    let fixture = Fixture::new();
    let push = Arc::new(RecordingSink::default());
    let social = Arc::new(RecordingSink::default());
    let dispatcher = Dispatcher::new(style())
        .with_push(push.clone())
        .with_social(social.clone());

    let (producer, consumer) = command_queue(4);
    producer.push(message(
        "head_brewer",
        "TAP 1:5.00:5.00:ACTIVE:01/02/20:House Stout:Stout",
    ));

    let engine = fixture
        .engine(dispatcher)
        .with_telemetry(Box::new(ScriptedTransport::new(
            &["tap1:0 tap2:0 tap3:0 temp1:2.5"],
            true,
        )))
        .with_commands(consumer);

    let shutdown = CancellationToken::new();
    let running = tokio::spawn(engine.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(100)).await;

    // The telemetry link has failed by now, commands must still flow
    producer.push(message("random_fan", "TAP 1:1:1:ACTIVE:01/02/20:Nope:N"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    shutdown.cancel();
    assert_eq!(running.await.unwrap(), EngineState::Stopped);

    assert_eq!(fixture.tap(1).full_name, "House Stout");
    assert_eq!(fixture.store.temperatures(), vec![2.5]);

    let replies = social
        .sent()
        .into_iter()
        .filter(|o| matches!(o, Outbound::Reply { .. }))
        .count();
    assert_eq!(replies, 2);
    assert!(push
        .sent()
        .iter()
        .any(|o| matches!(o, Outbound::Push { title, .. } if title == "New Keg!")));
}

#[tokio::test]
async fn engine_without_inputs_stops_on_cancel() {
    let fixture = Fixture::new();
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let state = fixture.quiet_engine().run(shutdown).await;

    assert_eq!(state, EngineState::Stopped);
    assert_eq!(fixture.store.snapshot(), TapTable::with_default_taps(3));
}
