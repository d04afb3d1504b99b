use crate::error::{Error, Result};
use crate::events::{self, Sink};
use crate::growatt::transport::{RegisterClass, Transport};

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};

/// Holding registers 45..=50 carry year, month, day, hour, minute, second.
pub const CLOCK_REGISTER_START: u16 = 45;
pub const CLOCK_REGISTER_COUNT: u16 = 6;

pub const DEFAULT_THRESHOLD_SECS: u64 = 30;

type ClockRegisters = [u16; CLOCK_REGISTER_COUNT as usize];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClockField {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
}

impl ClockField {
    /// Most granular first. The year goes last since some firmware refuses
    /// to have it written at all.
    pub const WRITE_ORDER: [ClockField; 6] = [
        ClockField::Second,
        ClockField::Minute,
        ClockField::Hour,
        ClockField::Day,
        ClockField::Month,
        ClockField::Year,
    ];

    pub fn register(&self) -> u16 {
        CLOCK_REGISTER_START
            + match self {
                Self::Year => 0,
                Self::Month => 1,
                Self::Day => 2,
                Self::Hour => 3,
                Self::Minute => 4,
                Self::Second => 5,
            }
    }

    /// Position within the clock register block.
    pub fn index(&self) -> usize {
        (self.register() - CLOCK_REGISTER_START) as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Year => "year",
            Self::Month => "month",
            Self::Day => "day",
            Self::Hour => "hour",
            Self::Minute => "minute",
            Self::Second => "second",
        }
    }

    pub fn value_of<Tz: TimeZone>(&self, t: &DateTime<Tz>) -> u16 {
        match self {
            Self::Year => t.year() as u16,
            Self::Month => t.month() as u16,
            Self::Day => t.day() as u16,
            Self::Hour => t.hour() as u16,
            Self::Minute => t.minute() as u16,
            Self::Second => t.second() as u16,
        }
    }
}

/// Outcome of one `check_and_reconcile` pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reconciliation {
    pub difference_secs: i64,
    /// Fields written successfully, in write order.
    pub written: Vec<ClockField>,
    /// Fields the device refused but which were not considered fatal.
    pub rejected: Vec<ClockField>,
}

impl Reconciliation {
    pub fn is_noop(&self) -> bool {
        self.written.is_empty() && self.rejected.is_empty()
    }
}

pub struct ClockSync {
    threshold_ms: i64,
    events: Sink,
}

impl ClockSync {
    pub fn new(threshold_secs: u64, events: Sink) -> Self {
        Self {
            threshold_ms: threshold_secs as i64 * 1000,
            events,
        }
    }

    /// Reads the device clock, interpreting it as host local time.
    pub async fn read_device_time<T>(&self, transport: &mut T) -> Result<DateTime<Local>>
    where
        T: Transport + ?Sized,
    {
        self.read_device_time_in(transport, &Local).await
    }

    /// Registers that do not form a valid date come back as `Protocol`.
    pub async fn read_device_time_in<T, Tz>(&self, transport: &mut T, tz: &Tz) -> Result<DateTime<Tz>>
    where
        T: Transport + ?Sized,
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        let raw = self.read_registers(transport).await?;

        let t = Self::to_time(&raw, tz)
            .ok_or_else(|| Error::Protocol(format!("inverter reported invalid time {:?}", raw)))?;

        self.events
            .emit(events::debug("current time on inverter").field("time", t.format("%Y-%m-%d %H:%M:%S")));

        Ok(t)
    }

    async fn read_registers<T>(&self, transport: &mut T) -> Result<ClockRegisters>
    where
        T: Transport + ?Sized,
    {
        let data = transport
            .read_block(CLOCK_REGISTER_START, CLOCK_REGISTER_COUNT, RegisterClass::Holding)
            .await
            .inspect_err(|e| {
                self.events
                    .emit(events::error("failed to read inverter time").field("error", e))
            })?;

        data.as_slice().try_into().map_err(|_| {
            Error::Protocol(format!(
                "expected {} clock registers, got {}",
                CLOCK_REGISTER_COUNT,
                data.len()
            ))
        })
    }

    fn to_time<Tz: TimeZone>(raw: &ClockRegisters, tz: &Tz) -> Option<DateTime<Tz>> {
        tz.with_ymd_and_hms(
            raw[0] as i32,
            raw[1] as u32,
            raw[2] as u32,
            raw[3] as u32,
            raw[4] as u32,
            raw[5] as u32,
        )
        .earliest()
    }

    /// Compares the device clock against `now` and, when they are more than
    /// the threshold apart, writes each differing field back.
    ///
    /// A device clock that is not a valid date (month 0 after losing power,
    /// say) counts as infinitely far off, so every differing field is written.
    /// A rejected year write is logged and skipped; any other failed write
    /// aborts the pass.
    pub async fn check_and_reconcile<T, Tz>(
        &self,
        transport: &mut T,
        now: DateTime<Tz>,
    ) -> Result<Reconciliation>
    where
        T: Transport + ?Sized,
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        let raw = self.read_registers(transport).await?;

        let (diff_ms, inverter_time) = match Self::to_time(&raw, &now.timezone()) {
            Some(device_time) => {
                let inverter_time = device_time.format("%Y-%m-%d %H:%M:%S").to_string();
                self.events
                    .emit(events::debug("current time on inverter").field("time", &inverter_time));
                let diff = now
                    .clone()
                    .signed_duration_since(device_time)
                    .num_milliseconds()
                    .abs();
                (diff, inverter_time)
            }
            None => {
                self.events.emit(
                    events::warn("inverter reported invalid time, rewriting clock")
                        .field("registers", format!("{:?}", raw)),
                );
                (i64::MAX, format!("{:?}", raw))
            }
        };

        let mut outcome = Reconciliation {
            difference_secs: diff_ms / 1000,
            written: Vec::new(),
            rejected: Vec::new(),
        };

        if diff_ms <= self.threshold_ms {
            self.events.emit(
                events::debug("inverter time within threshold")
                    .field("difference_secs", outcome.difference_secs),
            );
            return Ok(outcome);
        }

        self.events.emit(
            events::info("inverter time difference exceeds threshold, updating")
                .field("difference_secs", outcome.difference_secs)
                .field("threshold_secs", self.threshold_ms / 1000)
                .field("inverter_time", inverter_time)
                .field("new_time", now.format("%Y-%m-%d %H:%M:%S")),
        );

        for field in ClockField::WRITE_ORDER {
            let current = raw[field.index()];
            let target = field.value_of(&now);
            if current == target {
                continue;
            }

            self.events.emit(
                events::info(format!("updating inverter time({})", field.name()))
                    .field("from", current)
                    .field("to", target),
            );

            match transport.write_register(field.register(), target).await {
                Ok(()) => outcome.written.push(field),
                Err(e) if field == ClockField::Year => {
                    // usually an illegal-function reply; nothing more to try
                    self.events.emit(
                        events::warn("failed to update time(year), probably not supported via modbus")
                            .field("error", e),
                    );
                    outcome.rejected.push(field);
                }
                Err(e) => {
                    return Err(Error::Write {
                        field: field.name(),
                        source: Box::new(e),
                    })
                }
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use crate::growatt::mock::{self, MockTransport};
    use chrono::Utc;
    use std::sync::Arc;

    fn sync() -> (ClockSync, MemorySink) {
        let sink = MemorySink::new();
        (ClockSync::new(30, Arc::new(sink.clone())), sink)
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, h, m, s).unwrap()
    }

    #[test]
    fn registers() {
        assert_eq!(ClockField::Year.register(), 45);
        assert_eq!(ClockField::Second.register(), 50);
        assert_eq!(ClockField::WRITE_ORDER[0], ClockField::Second);
        assert_eq!(ClockField::WRITE_ORDER[5], ClockField::Year);
    }

    #[tokio::test]
    async fn reads_device_time() {
        let (sync, _) = sync();
        let mut t = MockTransport::connected();
        t.set_clock([2024, 3, 15, 10, 30, 0]);

        let dt = sync.read_device_time_in(&mut t, &Utc).await.unwrap();
        assert_eq!(dt, at(10, 30, 0));
    }

    #[tokio::test]
    async fn invalid_device_time_is_protocol_error() {
        let (sync, _) = sync();
        let mut t = MockTransport::connected();
        t.set_clock([2024, 13, 15, 10, 30, 0]);

        let err = sync.read_device_time_in(&mut t, &Utc).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn read_errors_propagate() {
        let (sync, sink) = sync();
        let mut t = MockTransport::connected();
        t.push_holding(Err(mock::timeout()));

        let err = sync.check_and_reconcile(&mut t, at(10, 30, 5)).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(sink.contains("failed to read inverter time"));
        assert!(t.writes().is_empty());
    }

    #[tokio::test]
    async fn small_difference_writes_nothing() {
        let (sync, _) = sync();
        let mut t = MockTransport::connected();
        t.set_clock([2024, 3, 15, 10, 30, 0]);

        let r = sync.check_and_reconcile(&mut t, at(10, 30, 5)).await.unwrap();
        assert_eq!(r.difference_secs, 5);
        assert!(r.is_noop());
        assert!(t.writes().is_empty());
    }

    #[tokio::test]
    async fn threshold_boundary() {
        let (sync, _) = sync();
        let mut t = MockTransport::connected();
        t.set_clock([2024, 3, 15, 10, 30, 0]);

        let r = sync.check_and_reconcile(&mut t, at(10, 30, 30)).await.unwrap();
        assert!(r.is_noop());
        assert!(t.writes().is_empty());

        let r = sync.check_and_reconcile(&mut t, at(10, 30, 31)).await.unwrap();
        assert_eq!(r.written, vec![ClockField::Second]);
        assert_eq!(t.writes(), vec![(50, 31)]);
    }

    #[tokio::test]
    async fn device_ahead_counts_too() {
        let (sync, _) = sync();
        let mut t = MockTransport::connected();
        t.set_clock([2024, 3, 15, 10, 31, 0]);

        let r = sync.check_and_reconcile(&mut t, at(10, 30, 0)).await.unwrap();
        assert_eq!(r.difference_secs, 60);
        assert_eq!(r.written, vec![ClockField::Minute]);
    }

    #[tokio::test]
    async fn writes_only_differing_fields_most_granular_first() {
        let (sync, _) = sync();
        let mut t = MockTransport::connected();
        t.set_clock([2023, 3, 14, 9, 30, 5]);

        let now = Utc.with_ymd_and_hms(2024, 3, 15, 10, 30, 7).unwrap();
        let r = sync.check_and_reconcile(&mut t, now).await.unwrap();

        assert_eq!(
            r.written,
            vec![
                ClockField::Second,
                ClockField::Hour,
                ClockField::Day,
                ClockField::Year
            ]
        );
        assert_eq!(t.writes(), vec![(50, 7), (48, 10), (47, 15), (45, 2024)]);
        assert_eq!(t.clock(), [2024, 3, 15, 10, 30, 7]);
    }

    #[tokio::test]
    async fn invalid_device_clock_is_rewritten() {
        let (sync, sink) = sync();
        let mut t = MockTransport::connected();
        t.set_clock([2000, 0, 0, 0, 0, 0]);

        let r = sync.check_and_reconcile(&mut t, at(10, 30, 5)).await.unwrap();
        assert_eq!(r.written, ClockField::WRITE_ORDER.to_vec());
        assert_eq!(
            t.writes(),
            vec![(50, 5), (49, 30), (48, 10), (47, 15), (46, 3), (45, 2024)]
        );
        assert_eq!(t.clock(), [2024, 3, 15, 10, 30, 5]);
        assert!(sink.contains("invalid time"));

        let again = sync.check_and_reconcile(&mut t, at(10, 30, 5)).await.unwrap();
        assert!(again.is_noop());
    }

    #[tokio::test]
    async fn invalid_device_clock_keeps_matching_fields() {
        let (sync, _) = sync();
        let mut t = MockTransport::connected();
        // day 0 makes the whole date invalid, the rest already matches
        t.set_clock([2024, 3, 0, 10, 30, 5]);

        let r = sync.check_and_reconcile(&mut t, at(10, 30, 5)).await.unwrap();
        assert_eq!(r.written, vec![ClockField::Day]);
        assert_eq!(t.writes(), vec![(47, 15)]);
    }

    #[tokio::test]
    async fn second_pass_is_noop() {
        let (sync, _) = sync();
        let mut t = MockTransport::connected();
        t.set_clock([2024, 1, 1, 0, 0, 0]);
        let now = at(10, 30, 5);

        let first = sync.check_and_reconcile(&mut t, now).await.unwrap();
        assert!(!first.is_noop());
        let writes = t.writes().len();

        let second = sync.check_and_reconcile(&mut t, now).await.unwrap();
        assert!(second.is_noop());
        assert_eq!(t.writes().len(), writes);
    }

    #[tokio::test]
    async fn rejected_year_is_not_fatal() {
        let (sync, sink) = sync();
        let mut t = MockTransport::connected();
        t.set_clock([2023, 3, 15, 10, 30, 0]);
        t.reject_write(45, "illegal function");

        let r = sync.check_and_reconcile(&mut t, at(10, 30, 0)).await.unwrap();
        assert!(r.written.is_empty());
        assert_eq!(r.rejected, vec![ClockField::Year]);
        assert_eq!(sink.count(log::Level::Warn), 1);
    }

    #[tokio::test]
    async fn rejected_minute_aborts() {
        let (sync, _) = sync();
        let mut t = MockTransport::connected();
        t.set_clock([2024, 3, 14, 10, 20, 0]);
        t.reject_write(49, "illegal data value");

        let err = sync.check_and_reconcile(&mut t, at(10, 30, 5)).await.unwrap_err();
        match err {
            Error::Write { field, .. } => assert_eq!(field, "minute"),
            e => panic!("unexpected error {:?}", e),
        }
        // second went through, nothing after the minute was attempted
        assert_eq!(t.writes(), vec![(50, 5)]);
    }
}
