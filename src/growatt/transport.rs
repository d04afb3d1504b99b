use crate::error::{Error, Result};
use crate::events::{self, Sink};

use async_trait::async_trait;
use std::time::Duration;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;

const DEFAULT_TIMEOUT_SECS: u64 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterClass {
    Input,
    Holding,
}

impl std::fmt::Display for RegisterClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Holding => write!(f, "holding"),
        }
    }
}

/// Register level access to the inverter.
///
/// One instance is owned by exactly one poller; nothing here is shared.
#[async_trait]
pub trait Transport: Send {
    async fn open(&mut self) -> Result<()>;

    /// Returns exactly `count` words starting at `start`.
    async fn read_block(&mut self, start: u16, count: u16, class: RegisterClass)
        -> Result<Vec<u16>>;

    async fn write_register(&mut self, address: u16, value: u16) -> Result<()>;

    /// Safe to call when already closed.
    async fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Human readable name of the line, used in log output.
    fn address(&self) -> &str;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerialSettings {
    pub address: String,
    pub baud_rate: u32,
    pub unit_id: u8,
    pub timeout: Duration,
}

impl SerialSettings {
    pub fn new(address: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            address: address.into(),
            baud_rate,
            unit_id: 1,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl From<&crate::config::Inverter> for SerialSettings {
    fn from(inverter: &crate::config::Inverter) -> Self {
        Self {
            address: inverter.address().to_string(),
            baud_rate: inverter.baudrate(),
            unit_id: inverter.unit_id(),
            timeout: Duration::from_secs(inverter.timeout_secs()),
        }
    }
}

/// Modbus RTU over a local serial line: no parity, 8 data bits, 1 stop bit.
pub struct ModbusRtu {
    settings: SerialSettings,
    ctx: Option<Context>,
    events: Sink,
}

impl ModbusRtu {
    pub fn new(settings: SerialSettings, events: Sink) -> Self {
        Self {
            settings,
            ctx: None,
            events,
        }
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    fn classify(err: tokio_modbus::Error, timeout: Duration) -> Error {
        match err {
            tokio_modbus::Error::Transport(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                Error::Timeout(timeout)
            }
            e => Error::Protocol(e.to_string()),
        }
    }
}

#[async_trait]
impl Transport for ModbusRtu {
    async fn open(&mut self) -> Result<()> {
        self.events.emit(
            events::info("connecting to inverter")
                .field("address", &self.settings.address)
                .field("baudrate", self.settings.baud_rate),
        );

        let builder = tokio_serial::new(&self.settings.address, self.settings.baud_rate)
            .parity(tokio_serial::Parity::None)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .timeout(self.settings.timeout);

        let serial = tokio_serial::SerialStream::open(&builder).map_err(|e| {
            let err = Error::Connection {
                address: self.settings.address.clone(),
                reason: e.to_string(),
            };
            self.events.emit(events::error(err.to_string()));
            err
        })?;

        self.ctx = Some(rtu::attach_slave(serial, Slave(self.settings.unit_id)));
        self.events.emit(events::info("connected to inverter").field("address", &self.settings.address));

        Ok(())
    }

    async fn read_block(
        &mut self,
        start: u16,
        count: u16,
        class: RegisterClass,
    ) -> Result<Vec<u16>> {
        let timeout = self.settings.timeout;
        let ctx = self.ctx.as_mut().ok_or(Error::NotConnected)?;

        let request = async {
            match class {
                RegisterClass::Input => ctx.read_input_registers(start, count).await,
                RegisterClass::Holding => ctx.read_holding_registers(start, count).await,
            }
        };

        let words = match tokio::time::timeout(timeout, request).await {
            Err(_) => return Err(Error::Timeout(timeout)),
            Ok(Err(e)) => return Err(Self::classify(e, timeout)),
            Ok(Ok(Err(exception))) => {
                return Err(Error::Protocol(format!(
                    "exception reading {} registers {}..{}: {:?}",
                    class,
                    start,
                    start + count,
                    exception
                )))
            }
            Ok(Ok(Ok(words))) => words,
        };

        if words.len() != count as usize {
            return Err(Error::Protocol(format!(
                "asked for {} {} registers, got {}",
                count,
                class,
                words.len()
            )));
        }

        Ok(words)
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<()> {
        let timeout = self.settings.timeout;
        let ctx = self.ctx.as_mut().ok_or(Error::NotConnected)?;

        match tokio::time::timeout(timeout, ctx.write_single_register(address, value)).await {
            Err(_) => Err(Error::Timeout(timeout)),
            Ok(Err(e)) => Err(Self::classify(e, timeout)),
            Ok(Ok(Err(exception))) => Err(Error::Protocol(format!(
                "exception writing register {}: {:?}",
                address, exception
            ))),
            Ok(Ok(Ok(()))) => Ok(()),
        }
    }

    async fn close(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            if let Err(e) = ctx.disconnect().await {
                self.events.emit(
                    events::warn("error closing inverter connection")
                        .field("address", &self.settings.address)
                        .field("error", e),
                );
            }
            self.events.emit(events::info("disconnected from inverter"));
        }
    }

    fn is_open(&self) -> bool {
        self.ctx.is_some()
    }

    fn address(&self) -> &str {
        &self.settings.address
    }
}
