use crate::prelude::*;
use crate::coordinator::PublishStats;
use crate::growatt::poller::StateChange;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing, QoS};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PUBLISH_ATTEMPTS: u32 = 3;
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

// Message {{{
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Message {
    /// Relative to the configured base topic
    pub topic: String,
    pub retain: bool,
    pub payload: String,
}

impl Message {
    pub fn for_stats(stats: &Stats) -> Result<Message> {
        Ok(Message {
            topic: "data".to_string(),
            retain: true,
            payload: serde_json::to_string(stats)?,
        })
    }

    pub fn for_state_change(change: &StateChange) -> Result<Message> {
        Ok(Message {
            topic: "state".to_string(),
            retain: true,
            payload: serde_json::to_string(change)?,
        })
    }
} // }}}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    Message(Message),
    Shutdown,
}

pub type Sender = broadcast::Sender<ChannelData>;
type Receiver = broadcast::Receiver<ChannelData>;

pub struct Mqtt {
    config: ConfigWrapper,
    channels: Channels,
    shared_stats: Arc<Mutex<PublishStats>>,
    // taken by start(); subscribed at construction so nothing sent before the
    // task gets scheduled is lost
    receivers: Mutex<Option<(Receiver, Receiver)>>,
}

impl Mqtt {
    pub fn new(
        config: ConfigWrapper,
        channels: Channels,
        shared_stats: Arc<Mutex<PublishStats>>,
    ) -> Self {
        let receivers = (channels.to_mqtt.subscribe(), channels.to_mqtt.subscribe());

        Self {
            config,
            channels,
            shared_stats,
            receivers: Mutex::new(Some(receivers)),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let c = self.config.mqtt();

        let mut options = MqttOptions::new(c.client_id(), c.host(), c.port());

        let will = LastWill {
            topic: self.lwt_topic(),
            message: bytes::Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        options.set_last_will(will);

        options.set_keep_alive(Duration::from_secs(60));
        if let (Some(u), Some(p)) = (c.username(), c.password()) {
            options.set_credentials(u, p);
        }

        info!("initializing mqtt at {}:{}", c.host(), c.port());

        let (outgoing, control) = self
            .receivers
            .lock()
            .map_err(|_| file_error!("Failed to lock mqtt receivers"))?
            .take()
            .ok_or_else(|| file_error!("mqtt client already started"))?;

        let (client, eventloop) = AsyncClient::new(options, 10);

        futures::try_join!(
            self.setup(client.clone()),
            self.receiver(eventloop, control),
            self.sender(client, outgoing)
        )?;

        Ok(())
    }

    pub fn stop(&self) {
        info!("Stopping MQTT client...");
        let _ = self.channels.to_mqtt.send(ChannelData::Shutdown);
    }

    async fn setup(&self, client: AsyncClient) -> Result<()> {
        client
            .publish(self.lwt_topic(), QoS::AtLeastOnce, true, "online")
            .await?;

        Ok(())
    }

    // drives the connection; nothing is subscribed so incoming publishes are unexpected
    async fn receiver(&self, mut eventloop: EventLoop, mut control: Receiver) -> Result<()> {
        loop {
            tokio::select! {
                biased;

                msg = control.recv() => {
                    match msg {
                        Ok(ChannelData::Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
                        _ => {}
                    }
                }
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            info!("connected to mqtt broker");
                        }
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            debug!("ignoring unexpected publish on {}", publish.topic);
                        }
                        Err(e) => {
                            error!("{}", e);
                            info!("reconnecting in 5s");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                        _ => {} // keepalives etc
                    }
                }
            }
        }

        self.flush(&mut eventloop).await;

        info!("MQTT receiver loop exiting");
        Ok(())
    }

    // keep the connection moving until the sender's queued publishes, the
    // offline marker and the disconnect have gone out
    async fn flush(&self, eventloop: &mut EventLoop) {
        let deadline = tokio::time::sleep(FLUSH_TIMEOUT);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!("MQTT flush did not complete within {:?}", FLUSH_TIMEOUT);
                    break;
                }
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                            debug!("MQTT disconnect sent");
                            break;
                        }
                        Err(e) => {
                            debug!("MQTT connection closed during flush: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    // coordinator -> mqtt
    async fn sender(&self, client: AsyncClient, mut receiver: Receiver) -> Result<()> {
        use ChannelData::*;

        loop {
            match receiver.recv().await {
                Ok(Shutdown) | Err(broadcast::error::RecvError::Closed) => {
                    info!("MQTT sender received shutdown signal");
                    let _ = client
                        .publish(self.lwt_topic(), QoS::AtLeastOnce, true, "offline")
                        .await;
                    let _ = client.disconnect().await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("MQTT sender lagged, dropped {} messages", n);
                }
                Ok(Message(message)) => self.publish(&client, message).await,
            }
        }

        info!("MQTT sender loop exiting");
        Ok(())
    }

    async fn publish(&self, client: &AsyncClient, message: Message) {
        let topic = self.topic_for(&message);
        debug!("publishing: {} = {}", topic, message.payload);
        let payload = message.payload.into_bytes();

        for attempt in 1..=PUBLISH_ATTEMPTS {
            match client
                .publish(&topic, QoS::AtLeastOnce, message.retain, payload.clone())
                .await
            {
                Ok(_) => {
                    if let Ok(mut stats) = self.shared_stats.lock() {
                        stats.mqtt_messages_sent += 1;
                    }
                    return;
                }
                Err(err) => {
                    error!(
                        "MQTT publish to {} failed: {:?} (attempt {}/{})",
                        topic, err, attempt, PUBLISH_ATTEMPTS
                    );
                    if let Ok(mut stats) = self.shared_stats.lock() {
                        stats.mqtt_errors += 1;
                    }
                    if attempt < PUBLISH_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                }
            }
        }

        warn!("giving up on publish to {}", topic);
    }

    fn topic_for(&self, message: &Message) -> String {
        format!("{}/{}", self.config.mqtt().topic(), message.topic)
    }

    fn lwt_topic(&self) -> String {
        format!("{}/LWT", self.config.mqtt().topic())
    }
}
