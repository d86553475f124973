//! Time bounds for blocking waits.

use commonware_macros::select;
use commonware_runtime::{signal::Signal, Clock};
use std::time::{Duration, SystemTime};

/// Why a [Deadline] fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expired {
    Timeout,
    Canceled,
}

/// Bounds a blocking operation in time and, optionally, allows a caller to
/// cancel it early.
#[derive(Clone)]
pub struct Deadline {
    at: SystemTime,
    cancel: Option<Signal>,
}

impl Deadline {
    /// A deadline `duration` from the current time of `clock`.
    pub fn after(clock: &impl Clock, duration: Duration) -> Self {
        Self::at(clock.current() + duration)
    }

    /// A deadline at a fixed point in time.
    pub fn at(at: SystemTime) -> Self {
        Self { at, cancel: None }
    }

    /// Attach a cancellation [Signal] to this deadline.
    pub fn with_cancel(mut self, cancel: Signal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// The time at which this deadline times out.
    pub fn time(&self) -> SystemTime {
        self.at
    }

    /// Resolves when the deadline times out or its cancellation signal fires.
    ///
    /// A dropped [commonware_runtime::signal::Signaler] never cancels.
    pub async fn expired(&self, clock: &impl Clock) -> Expired {
        let canceled = async {
            if let Some(cancel) = self.cancel.clone() {
                if cancel.await.is_ok() {
                    return;
                }
            }
            futures::future::pending::<()>().await
        };
        select! {
            _ = canceled => {
                Expired::Canceled
            },
            _ = clock.sleep_until(self.at) => {
                Expired::Timeout
            },
        }
    }
}
