use crate::prelude::*;
use crate::growatt::poller::ChannelData;

use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub records_received: u64,
    pub state_changes_received: u64,
    pub mqtt_messages_sent: u64,
    pub mqtt_errors: u64,
    /// Messages that could not be queued for MQTT at all
    pub dropped: u64,
    pub last_state: Option<OperatingState>,
}

impl PublishStats {
    pub fn print_summary(&self) {
        info!("Publish Statistics:");
        info!("  Telemetry records received: {}", self.records_received);
        info!("  State changes received: {}", self.state_changes_received);
        if let Some(state) = self.last_state {
            info!("  Last inverter state: {}", state);
        }
        info!("  MQTT:");
        info!("    Messages sent: {}", self.mqtt_messages_sent);
        info!("    Errors: {}", self.mqtt_errors);
        info!("    Dropped: {}", self.dropped);
    }
}

/// Turns poller output into MQTT messages.
#[derive(Clone)]
pub struct Coordinator {
    channels: Channels,
    pub shared_stats: Arc<Mutex<PublishStats>>,
}

impl Coordinator {
    pub fn new(channels: Channels) -> Self {
        Self {
            channels,
            shared_stats: Arc::new(Mutex::new(PublishStats::default())),
        }
    }

    /// Runs until the poller drops its end of the handoff.
    pub async fn start(&self, mut receiver: poller::Receiver) -> Result<()> {
        while let Some(data) = receiver.recv().await {
            self.process(data)?;
        }

        info!("poller handoff closed, coordinator exiting");
        Ok(())
    }

    pub fn process(&self, data: ChannelData) -> Result<()> {
        let message = match data {
            ChannelData::StateChange(change) => {
                info!("inverter state is now {} (since {})", change.state, change.timestamp);
                self.with_stats(|s| {
                    s.state_changes_received += 1;
                    s.last_state = Some(change.state);
                });
                mqtt::Message::for_state_change(&change)?
            }
            ChannelData::Stats(stats) => {
                debug!(
                    "telemetry: state={} pv={}W ac={}W",
                    stats.state, stats.pv_input_power, stats.ac_watt
                );
                self.with_stats(|s| {
                    s.records_received += 1;
                    s.last_state = Some(stats.state);
                });
                mqtt::Message::for_stats(&stats)?
            }
        };

        if self
            .channels
            .to_mqtt
            .send(mqtt::ChannelData::Message(message))
            .is_err()
        {
            warn!("send(to_mqtt) failed - channel closed?");
            self.with_stats(|s| s.dropped += 1);
        }

        Ok(())
    }

    pub fn stop(&self) {
        if let Ok(stats) = self.shared_stats.lock() {
            stats.print_summary();
        }
    }

    pub fn stats(&self) -> PublishStats {
        self.shared_stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn with_stats<F: FnOnce(&mut PublishStats)>(&self, f: F) {
        if let Ok(mut stats) = self.shared_stats.lock() {
            f(&mut stats);
        }
    }
}
