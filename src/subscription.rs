//! The long running loop that keeps the broker subscription alive and hands every received
//! message to a [`MessageHandler`].
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use crate::mqtt::{MqttParams, Transport};
use crate::router::MessageHandler;
use crate::shutdown::Shutdown;

/// Upper bound for a single receive, the shutdown signal is checked in between.
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

/// Capped exponential delay between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Backoff { base, max }
    }

    pub fn from_params(params: &MqttParams) -> Self {
        Backoff::new(Duration::from_secs(params.reconnect_base_secs), Duration::from_secs(params.reconnect_max_secs))
    }

    /// Delay before retry number `retries`: `min(base * 2^retries, max)`.
    pub fn delay(&self, retries: u32) -> Duration {
        let factor = 2u32.checked_pow(retries).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Not connected, `retries` failed attempts since the last successful connect.
    Disconnected { retries: u32 },
    Connected,
    Stopped,
}

/// Subscription loop driving a [`Transport`].
///
/// Messages are handed to the handler one at a time in delivery order. Transport failures lead
/// to a reconnect after the backoff delay, handler side errors never reach the loop. A panicking
/// handler is treated like a transport failure. The only way out of the loop is the shutdown
/// signal.
pub struct SubscriptionLoop<T, H> {
    transport: T,
    handler: H,
    backoff: Backoff,
    shutdown: Shutdown,
}

impl<T: Transport, H: MessageHandler> SubscriptionLoop<T, H> {
    pub fn new(transport: T, handler: H, backoff: Backoff, shutdown: Shutdown) -> Self {
        SubscriptionLoop { transport, handler, backoff, shutdown }
    }

    /// Runs until the shutdown signal is triggered.
    pub fn run(&mut self) {
        log::info!(target: "sensord::mqtt", "Starting mqtt subscription loop");
        let mut state = LoopState::Disconnected { retries: 0 };
        while state != LoopState::Stopped {
            state = self.step(state);
        }
        self.transport.disconnect();
        log::info!(target: "sensord::mqtt", "Exiting mqtt subscription loop");
    }

    fn step(&mut self, state: LoopState) -> LoopState {
        if self.shutdown.is_triggered() {
            return LoopState::Stopped;
        }

        match state {
            LoopState::Disconnected { retries } => match self.transport.connect() {
                Ok(_) => LoopState::Connected,
                Err(err) => {
                    log::error!(target: "sensord::mqtt", "Unable to connect: \'{}\'", err);
                    self.transport.disconnect();
                    self.wait_for_retry(retries.saturating_add(1))
                }
            },
            LoopState::Connected => match self.transport.next_message(RECEIVE_TIMEOUT) {
                Ok(Some(message)) => {
                    let handler = &mut self.handler;
                    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&message.topic, &message.payload))) {
                        Ok(_) => LoopState::Connected,
                        Err(_) => {
                            log::error!(target: "sensord::mqtt", "Message handler panicked on topic \'{}\'", message.topic);
                            self.transport.disconnect();
                            self.wait_for_retry(1)
                        }
                    }
                }
                Ok(None) => LoopState::Connected,
                Err(err) => {
                    log::error!(target: "sensord::mqtt", "Mqtt connection failed: \'{}\'", err);
                    self.transport.disconnect();
                    self.wait_for_retry(1)
                }
            },
            LoopState::Stopped => LoopState::Stopped,
        }
    }

    fn wait_for_retry(&self, retries: u32) -> LoopState {
        let delay = self.backoff.delay(retries);
        log::warn!(target: "sensord::mqtt", "Reconnecting in {}s (attempt {})", delay.as_secs_f64(), retries);
        match self.shutdown.wait_timeout(delay) {
            true => LoopState::Stopped,
            false => LoopState::Disconnected { retries },
        }
    }
}
