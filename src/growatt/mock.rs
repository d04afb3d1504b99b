//! Scripted in-memory transport used to drive the poller and clock logic
//! without a serial line.

use crate::error::{Error, Result};
use crate::growatt::clock::{CLOCK_REGISTER_COUNT, CLOCK_REGISTER_START};
use crate::growatt::transport::{RegisterClass, Transport};

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct MockState {
    /// Replies for input register reads, consumed in order. Once empty every
    /// read times out.
    pub input_replies: VecDeque<Result<Vec<u16>>>,
    /// Replies for holding register reads. When empty, reads of the clock
    /// block are answered from `clock`.
    pub holding_replies: VecDeque<Result<Vec<u16>>>,
    /// Device clock registers: year, month, day, hour, minute, second.
    pub clock: [u16; CLOCK_REGISTER_COUNT as usize],
    /// Registers whose writes are rejected, with the rejection message.
    pub rejected_writes: HashMap<u16, String>,
    /// Number of upcoming `open` calls that fail.
    pub failing_opens: usize,

    pub open: bool,
    pub opens: usize,
    pub closes: usize,
    pub reads: usize,
    pub writes: Vec<(u16, u16)>,
}

/// Cloning yields another handle onto the same script, so tests can keep one
/// for inspection after handing the transport to a poller.
#[derive(Clone, Debug, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// A transport that starts out open, as the poller expects.
    pub fn connected() -> Self {
        let t = Self::default();
        t.state().open = true;
        t
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        // a poisoned lock only happens after a test already panicked
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push_input(&self, reply: Result<Vec<u16>>) -> &Self {
        self.state().input_replies.push_back(reply);
        self
    }

    pub fn push_inputs<I>(&self, replies: I) -> &Self
    where
        I: IntoIterator<Item = Result<Vec<u16>>>,
    {
        self.state().input_replies.extend(replies);
        self
    }

    pub fn push_holding(&self, reply: Result<Vec<u16>>) -> &Self {
        self.state().holding_replies.push_back(reply);
        self
    }

    pub fn set_clock(&self, clock: [u16; CLOCK_REGISTER_COUNT as usize]) -> &Self {
        self.state().clock = clock;
        self
    }

    pub fn reject_write(&self, register: u16, message: &str) -> &Self {
        self.state()
            .rejected_writes
            .insert(register, message.to_string());
        self
    }

    pub fn fail_next_opens(&self, count: usize) -> &Self {
        self.state().failing_opens = count;
        self
    }

    pub fn writes(&self) -> Vec<(u16, u16)> {
        self.state().writes.clone()
    }

    pub fn clock(&self) -> [u16; CLOCK_REGISTER_COUNT as usize] {
        self.state().clock
    }

    pub fn opens(&self) -> usize {
        self.state().opens
    }

    pub fn closes(&self) -> usize {
        self.state().closes
    }
}

pub fn timeout() -> Error {
    Error::Timeout(Duration::from_secs(3))
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> Result<()> {
        let mut s = self.state();
        s.opens += 1;
        if s.failing_opens > 0 {
            s.failing_opens -= 1;
            return Err(Error::Connection {
                address: "mock".to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        s.open = true;
        Ok(())
    }

    async fn read_block(
        &mut self,
        start: u16,
        count: u16,
        class: RegisterClass,
    ) -> Result<Vec<u16>> {
        let mut s = self.state();
        if !s.open {
            return Err(Error::NotConnected);
        }
        s.reads += 1;

        match class {
            RegisterClass::Input => s.input_replies.pop_front().unwrap_or_else(|| Err(timeout())),
            RegisterClass::Holding => match s.holding_replies.pop_front() {
                Some(reply) => reply,
                None if start == CLOCK_REGISTER_START && count == CLOCK_REGISTER_COUNT => {
                    Ok(s.clock.to_vec())
                }
                None => Err(timeout()),
            },
        }
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<()> {
        let mut s = self.state();
        if !s.open {
            return Err(Error::NotConnected);
        }
        if let Some(message) = s.rejected_writes.get(&address) {
            return Err(Error::Protocol(message.clone()));
        }

        s.writes.push((address, value));
        if (CLOCK_REGISTER_START..CLOCK_REGISTER_START + CLOCK_REGISTER_COUNT).contains(&address) {
            s.clock[(address - CLOCK_REGISTER_START) as usize] = value;
        }
        Ok(())
    }

    async fn close(&mut self) {
        let mut s = self.state();
        if s.open {
            s.closes += 1;
        }
        s.open = false;
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    fn address(&self) -> &str {
        "mock"
    }
}
