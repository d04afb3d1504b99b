#![allow(dead_code)]

pub use growatt_bridge::events::MemorySink;
pub use growatt_bridge::growatt::mock::{self, MockTransport};
pub use growatt_bridge::growatt::poller::{ChannelData, PollState, StateChange, TickOutcome};
pub use growatt_bridge::prelude::*;

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;

pub struct Factory();
impl Factory {
    /// Raw 41-word input block with the given status word and 150W PV input.
    pub fn input_block(state: u16) -> Vec<u16> {
        let mut block = vec![0u16; 41];
        block[0] = state;
        block[1] = 0;
        block[2] = 1500;
        block[13] = 5000;
        block
    }

    pub fn config_yaml() -> String {
        r#"
loglevel: debug
inverter:
  address: /dev/ttyUSB0
  baudrate: 9600
  poll_interval_secs: 2
  waiting_backoff_secs: 60
mqtt:
  host: localhost
  username: solar
  password: secret
  topic: solar/growatt
"#
        .to_string()
    }

    pub fn config() -> Config {
        Config::from_yaml(&Self::config_yaml()).unwrap()
    }

    pub fn settings() -> PollSettings {
        PollSettings::default()
    }

    pub fn timestamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 10, 30, 5).unwrap()
    }

    /// Poller over a clone of `transport`, with a roomy handoff so tests can
    /// drain at their own pace.
    pub fn poller(
        transport: &MockTransport,
        settings: PollSettings,
    ) -> (Poller<MockTransport>, poller::Receiver, MemorySink) {
        let (tx, rx) = mpsc::channel(64);
        let sink = MemorySink::new();
        let p = Poller::new(transport.clone(), settings, tx, Arc::new(sink.clone()));
        (p, rx, sink)
    }
}

pub fn unwrap_stats(data: ChannelData) -> Stats {
    if let ChannelData::Stats(stats) = data {
        stats
    } else {
        panic!("expected stats, got {:?}", data)
    }
}

pub fn unwrap_state_change(data: ChannelData) -> StateChange {
    if let ChannelData::StateChange(change) = data {
        change
    } else {
        panic!("expected state change, got {:?}", data)
    }
}

pub fn unwrap_mqtt_message(data: mqtt::ChannelData) -> mqtt::Message {
    if let mqtt::ChannelData::Message(message) = data {
        message
    } else {
        panic!("expected message, got {:?}", data)
    }
}
