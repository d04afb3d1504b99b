pub mod clock;
#[cfg(any(test, feature = "mocks"))]
pub mod mock;
pub mod poller;
pub mod state;
pub mod telemetry;
pub mod transport;
