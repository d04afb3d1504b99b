use crate::events::{self, Sink};
use crate::growatt::clock::{ClockSync, Reconciliation, DEFAULT_THRESHOLD_SECS};
use crate::growatt::state::OperatingState;
use crate::growatt::telemetry::{
    self, timestamp_format, DecodeOptions, Stats, INPUT_REGISTER_COUNT, INPUT_REGISTER_START,
};
use crate::growatt::transport::{RegisterClass, Transport};

use anyhow::{bail, Result};
use chrono::{DateTime, Local, SubsecRound, TimeZone, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};

/// Published whenever the decoded run status differs from the last one seen.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub state: OperatingState,
    #[serde(with = "timestamp_format")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelData {
    StateChange(StateChange),
    Stats(Stats),
}
pub type Sender = mpsc::Sender<ChannelData>;
pub type Receiver = mpsc::Receiver<ChannelData>;

/// Single slot handoff between poller and consumer. A slow consumer stalls
/// polling rather than letting records pile up.
pub fn handoff() -> (Sender, Receiver) {
    mpsc::channel(1)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollState {
    ConnectedIdle,
    Polling,
    BackoffWaiting,
    Reconnecting,
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollSettings {
    pub poll_interval: Duration,
    pub timesync_interval: Duration,
    pub timesync_threshold_secs: u64,
    /// How long to leave a dark inverter alone before polling again.
    pub waiting_backoff: Duration,
    /// Reconnect once this many consecutive timeouts have been exceeded.
    pub max_consecutive_timeouts: u32,
    pub decode: DecodeOptions,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            timesync_interval: Duration::from_secs(30 * 60),
            timesync_threshold_secs: DEFAULT_THRESHOLD_SECS,
            waiting_backoff: Duration::from_secs(60),
            max_consecutive_timeouts: 10,
            decode: DecodeOptions::default(),
        }
    }
}

impl From<&crate::config::Inverter> for PollSettings {
    fn from(inverter: &crate::config::Inverter) -> Self {
        Self {
            poll_interval: Duration::from_secs(inverter.poll_interval_secs()),
            timesync_interval: Duration::from_secs(inverter.timesync_interval_secs()),
            timesync_threshold_secs: inverter.timesync_threshold_secs(),
            waiting_backoff: Duration::from_secs(inverter.waiting_backoff_secs()),
            max_consecutive_timeouts: inverter.max_consecutive_timeouts(),
            decode: DecodeOptions {
                consecutive_pv1_watt: inverter.consecutive_pv1_watt(),
            },
        }
    }
}

/// What a single telemetry tick amounted to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Emitted { state_changed: bool },
    /// Timed out while the inverter is known to be dark.
    Backoff,
    TimeoutCounted(u32),
    Reconnected { ok: bool },
    Skipped,
    ConsumerGone,
}

pub struct Poller<T: Transport> {
    transport: T,
    settings: PollSettings,
    clock: ClockSync,
    events: Sink,
    tx: Sender,
    state: PollState,
    last_state: OperatingState,
    timeout_count: u32,
    reconnects: u64,
}

impl<T: Transport> Poller<T> {
    /// `transport` is expected to be open already.
    pub fn new(transport: T, settings: PollSettings, tx: Sender, events: Sink) -> Self {
        let clock = ClockSync::new(settings.timesync_threshold_secs, events.clone());

        Self {
            transport,
            settings,
            clock,
            events,
            tx,
            state: PollState::ConnectedIdle,
            last_state: OperatingState::default(),
            timeout_count: 0,
            reconnects: 0,
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn last_state(&self) -> OperatingState {
        self.last_state
    }

    pub fn timeout_count(&self) -> u32 {
        self.timeout_count
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Drives both timers until a shutdown is broadcast, then closes the
    /// transport. Returns an error only if the consumer went away.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        self.events.emit(
            events::info("start reading from inverter")
                .field("address", self.transport.address())
                .field("poll_interval_secs", self.settings.poll_interval.as_secs()),
        );

        let mut telemetry = tokio::time::interval(self.settings.poll_interval);
        telemetry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // first clock check is one full period out; startup does its own
        let period = self.settings.timesync_interval;
        let mut timesync = tokio::time::interval_at(Instant::now() + period, period);
        timesync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut consumer_gone = false;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    self.events.emit(events::info("shutdown received, stop reading from inverter"));
                    break;
                }

                _ = telemetry.tick() => {
                    match self.poll_telemetry().await {
                        TickOutcome::Backoff => {
                            tokio::select! {
                                biased;
                                _ = shutdown.recv() => {
                                    self.events.emit(events::info("shutdown received during backoff"));
                                    break;
                                }
                                _ = tokio::time::sleep(self.settings.waiting_backoff) => {}
                            }
                            self.state = PollState::Polling;
                            telemetry.reset();
                        }
                        TickOutcome::ConsumerGone => {
                            consumer_gone = true;
                            break;
                        }
                        _ => {}
                    }
                }

                _ = timesync.tick() => {
                    self.check_clock().await;
                }
            }
        }

        self.stop().await;

        if consumer_gone {
            bail!("telemetry receiver dropped, poller stopped");
        }

        Ok(())
    }

    pub async fn poll_telemetry(&mut self) -> TickOutcome {
        self.poll_telemetry_at(Utc::now()).await
    }

    /// One telemetry tick, with `now` as the capture time.
    pub async fn poll_telemetry_at(&mut self, now: DateTime<Utc>) -> TickOutcome {
        let result = self
            .transport
            .read_block(INPUT_REGISTER_START, INPUT_REGISTER_COUNT, RegisterClass::Input)
            .await
            .and_then(|words| telemetry::decode_slice(&words, now, self.settings.decode));

        let err = match result {
            Ok(stats) => return self.accept(stats).await,
            Err(err) => err,
        };

        if err.is_timeout() && self.last_state.is_waiting() {
            // registers are only readable once the inverter wakes up
            self.events.emit(
                events::debug("last known inverter state is 'waiting', backing off")
                    .field("error", &err)
                    .field("backoff_secs", self.settings.waiting_backoff.as_secs()),
            );
            self.state = PollState::BackoffWaiting;
            return TickOutcome::Backoff;
        }

        self.events.emit(
            events::warn("got error while retrieving modbus registers").field("error", &err),
        );

        if err.is_timeout() {
            self.timeout_count += 1;

            if self.timeout_count > self.settings.max_consecutive_timeouts {
                self.events.emit(
                    events::warn("too many subsequent read timeouts, reconnecting to inverter")
                        .field("timeouts", self.timeout_count),
                );
                let ok = self.reconnect().await;
                self.timeout_count = 0;
                return TickOutcome::Reconnected { ok };
            }

            self.state = PollState::Polling;
            return TickOutcome::TimeoutCounted(self.timeout_count);
        }

        if err.is_link_down() {
            let ok = self.reconnect().await;
            return TickOutcome::Reconnected { ok };
        }

        self.state = PollState::Polling;
        TickOutcome::Skipped
    }

    async fn accept(&mut self, stats: Stats) -> TickOutcome {
        let new_state = stats.state;
        let state_changed = new_state != self.last_state;

        if state_changed {
            self.events.emit(
                events::info("inverter state changed")
                    .field("from", self.last_state)
                    .field("to", new_state),
            );

            let notice = StateChange {
                state: new_state,
                timestamp: stats.timestamp.trunc_subsecs(0),
            };
            if Self::send(&self.tx, &self.events, ChannelData::StateChange(notice)).await.is_err() {
                return TickOutcome::ConsumerGone;
            }
        }

        if Self::send(&self.tx, &self.events, ChannelData::Stats(stats)).await.is_err() {
            return TickOutcome::ConsumerGone;
        }

        self.last_state = new_state;
        self.timeout_count = 0;
        self.state = PollState::Polling;

        TickOutcome::Emitted { state_changed }
    }

    // takes fields rather than &self so the future stays Send for non-Sync transports
    async fn send(
        tx: &Sender,
        sink: &Sink,
        data: ChannelData,
    ) -> Result<(), mpsc::error::SendError<ChannelData>> {
        tx.send(data).await.inspect_err(|_| {
            sink.emit(events::error("telemetry receiver dropped, cannot hand off data"))
        })
    }

    /// Close and reopen the link. A failed reopen leaves the transport closed,
    /// so the next tick lands here again.
    async fn reconnect(&mut self) -> bool {
        self.state = PollState::Reconnecting;
        self.reconnects += 1;

        self.transport.close().await;
        let ok = match self.transport.open().await {
            Ok(()) => {
                self.events.emit(
                    events::info("reconnected to inverter")
                        .field("address", self.transport.address())
                        .field("reconnects", self.reconnects),
                );
                true
            }
            Err(e) => {
                self.events.emit(
                    events::error("failed to reconnect to inverter")
                        .field("address", self.transport.address())
                        .field("error", e),
                );
                false
            }
        };

        self.state = PollState::Polling;
        ok
    }

    pub async fn check_clock(&mut self) -> Option<Reconciliation> {
        self.check_clock_at(Local::now()).await
    }

    /// Failures are logged only; they never change the polling state.
    pub async fn check_clock_at<Tz>(&mut self, now: DateTime<Tz>) -> Option<Reconciliation>
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        match self.clock.check_and_reconcile(&mut self.transport, now).await {
            Ok(r) => Some(r),
            Err(e) => {
                self.events
                    .emit(events::error("time check on inverter failed").field("error", e));
                None
            }
        }
    }

    pub async fn stop(&mut self) {
        self.transport.close().await;
        self.state = PollState::Stopped;
        self.events.emit(events::info("stopped reading from inverter"));
    }
}
