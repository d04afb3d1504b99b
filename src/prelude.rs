pub use anyhow::{anyhow, bail, Result};
pub use log::{debug, error, info, trace, warn};
pub use std::io::Write;
pub use tokio::sync::{broadcast, mpsc};

pub use crate::channels::Channels;
pub use crate::config::{self, Config, ConfigWrapper};
pub use crate::events::{EventSink, LogSink, Sink};
pub use crate::file_error;
pub use crate::growatt::{
    poller::{self, PollSettings, Poller},
    state::OperatingState,
    telemetry::Stats,
    transport::{ModbusRtu, SerialSettings, Transport},
};
pub use crate::mqtt;
pub use crate::options::Options;
