use crate::prelude::*;

use serde::Deserialize;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub inverter: Inverter,
    pub mqtt: Mqtt,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// Inverter {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Inverter {
    /// Serial device, eg /dev/ttyUSB0
    pub address: String,
    pub baudrate: u32,

    pub unit_id: Option<u8>,
    pub timeout_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub timesync_interval_secs: Option<u64>,
    pub timesync_threshold_secs: Option<u64>,
    pub waiting_backoff_secs: Option<u64>,
    pub max_consecutive_timeouts: Option<u32>,
    pub timesync_on_start: Option<bool>,
    pub consecutive_pv1_watt: Option<bool>,
}
impl Inverter {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn baudrate(&self) -> u32 {
        self.baudrate
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id.unwrap_or(1)
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(3)
    }

    pub fn poll_interval_secs(&self) -> u64 {
        self.poll_interval_secs.unwrap_or(2)
    }

    pub fn timesync_interval_secs(&self) -> u64 {
        self.timesync_interval_secs.unwrap_or(30 * 60)
    }

    pub fn timesync_threshold_secs(&self) -> u64 {
        self.timesync_threshold_secs.unwrap_or(30)
    }

    pub fn waiting_backoff_secs(&self) -> u64 {
        self.waiting_backoff_secs.unwrap_or(60)
    }

    pub fn max_consecutive_timeouts(&self) -> u32 {
        self.max_consecutive_timeouts.unwrap_or(10)
    }

    pub fn timesync_on_start(&self) -> bool {
        self.timesync_on_start.unwrap_or(true)
    }

    pub fn consecutive_pv1_watt(&self) -> bool {
        self.consecutive_pv1_watt == Some(true)
    }
} // }}}

// Mqtt {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    pub host: String,
    #[serde(default = "Config::default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "Config::default_mqtt_client_id")]
    pub client_id: String,

    /// Base topic; data lands on `<topic>/data`, state on `<topic>/state`
    pub topic: String,
}
impl Mqtt {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &Option<String> {
        &self.username
    }

    pub fn password(&self) -> &Option<String> {
        &self.password
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
} // }}}

pub struct ConfigWrapper {
    config: Arc<Mutex<Config>>,
}

impl Clone for ConfigWrapper {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
        }
    }
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        let config = Config::new(file)?;
        Ok(Self::from_config(config))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Config> {
        // config is never mutated while held, so a poisoned lock is still consistent
        match self.config.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn inverter(&self) -> Inverter {
        self.lock().inverter.clone()
    }

    pub fn mqtt(&self) -> Mqtt {
        self.lock().mqtt.clone()
    }

    pub fn loglevel(&self) -> String {
        self.lock().loglevel.clone()
    }

    pub fn log_summary(&self) {
        self.lock().log_summary()
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        let content = std::fs::read_to_string(&file)
            .map_err(|err| file_error!("error reading {}: {}", file, err))?;

        Self::from_yaml(&content)
    }

    /// Parses and validates, without touching the filesystem.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Logged separately from loading, as the log level comes from here.
    pub fn log_summary(&self) {
        info!("Configuration loaded successfully:");
        info!("  Inverter:");
        info!("    Address: {}", self.inverter.address);
        info!("    Baudrate: {}", self.inverter.baudrate);
        info!("    Unit ID: {}", self.inverter.unit_id());
        info!("    Timeout: {}s", self.inverter.timeout_secs());
        info!("    Poll Interval: {}s", self.inverter.poll_interval_secs());
        info!(
            "    Timesync: every {}s, threshold {}s, on start: {}",
            self.inverter.timesync_interval_secs(),
            self.inverter.timesync_threshold_secs(),
            self.inverter.timesync_on_start()
        );
        info!("  MQTT:");
        info!("    Host: {}", self.mqtt.host);
        info!("    Port: {}", self.mqtt.port);
        info!("    Client ID: {}", self.mqtt.client_id);
        info!("    Topic: {}", self.mqtt.topic);
        info!("  Log Level: {}", self.loglevel);
    }

    fn validate(&self) -> Result<()> {
        if self.inverter.address.is_empty() {
            return Err(file_error!("inverter.address cannot be empty"));
        }
        if self.inverter.baudrate == 0 {
            bail!("inverter.baudrate must be greater than 0");
        }
        if self.inverter.timeout_secs() == 0 {
            return Err(file_error!("Invalid inverter timeout: 0"));
        }
        if self.inverter.poll_interval_secs() == 0 {
            return Err(file_error!("Invalid poll interval: 0"));
        }
        if self.inverter.timesync_interval_secs() == 0 {
            return Err(file_error!("Invalid timesync interval: 0"));
        }

        if self.mqtt.port == 0 {
            bail!("mqtt.port must be between 1 and 65535");
        }
        if self.mqtt.host.is_empty() {
            return Err(file_error!("MQTT host cannot be empty"));
        }
        if self.mqtt.topic.is_empty() {
            return Err(file_error!("MQTT topic cannot be empty"));
        }

        Ok(())
    }

    fn default_mqtt_port() -> u16 {
        1883
    }

    fn default_mqtt_client_id() -> String {
        "growatt-bridge".to_string()
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }
}
