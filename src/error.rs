use thiserror::Error;

/// Errors raised while talking to the inverter.
///
/// The poller branches on these: a `Timeout` feeds the backoff/reconnect
/// policy, `NotConnected` and `Connection` trigger a reopen, anything else is
/// logged and the cycle skipped.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open {address}: {reason}")]
    Connection { address: String, reason: String },

    #[error("transport is not connected")]
    NotConnected,

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("failed to update time({field}): {source}")]
    Write {
        field: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// True when the link itself is gone and only a reopen can help.
    pub fn is_link_down(&self) -> bool {
        matches!(self, Error::NotConnected | Error::Connection { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Creates an anyhow error prefixed with the current file and line number
#[macro_export]
macro_rules! file_error {
    ($($arg:tt)*) => {
        anyhow::anyhow!(
            "[{}:{}] {}",
            std::path::Path::new(file!())
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
            line!(),
            format!($($arg)*)
        )
    };
}
