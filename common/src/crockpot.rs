use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use log::{error, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::{
    config::CrockpotConfig,
    lock::TimedMutex,
    relay::{RelayActuator, RelayChannel, RelayError},
    temperature::TemperatureSource,
    types::{CrockpotStatus, OperatingState, TemperatureReading},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("timed out after {0:?} waiting for the state lock")]
    LockTimeout(Duration),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

pub trait Connectivity {
    fn is_connected(&self) -> bool;
}

impl Connectivity for Arc<AtomicBool> {
    fn is_connected(&self) -> bool {
        self.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SafetyShutoff {
    OverTemperature { temperature_f: f32, limit_f: f32 },
    SensorFailure { consecutive_errors: u32 },
}

impl fmt::Display for SafetyShutoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OverTemperature {
                temperature_f,
                limit_f,
            } => write!(
                f,
                "temperature {temperature_f:.1} F exceeds limit of {limit_f:.1} F"
            ),
            Self::SensorFailure { consecutive_errors } => write!(
                f,
                "persistent sensor error ({consecutive_errors} consecutive failed readings)"
            ),
        }
    }
}

struct Shared<R> {
    status: CrockpotStatus,
    relay: R,
}

impl<R: RelayActuator> Shared<R> {
    /// Privileged write path for the supervisor. Skips validation because
    /// `Off` is always a valid and safe state. The stored state becomes `Off`
    /// even if the relay command fails; the failure is returned for logging.
    fn force_off(&mut self) -> Result<(), RelayError> {
        self.status.state = OperatingState::Off;
        self.relay.all_off()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Published {
    status: CrockpotStatus,
    relay_main: bool,
}

pub struct Crockpot<R> {
    shared: TimedMutex<Shared<R>>,
    // Copy of the status taken at the end of every critical section, served
    // when the main lock cannot be acquired in time.
    published: Mutex<Published>,
    lock_timeout: Duration,
}

impl<R: RelayActuator> Crockpot<R> {
    pub fn new(mut relay: R, lock_timeout: Duration) -> Result<Self, RelayError> {
        relay.all_off()?;
        info!("crockpot control core initialized");

        Ok(Self {
            shared: TimedMutex::new(Shared {
                status: CrockpotStatus::default(),
                relay,
            }),
            published: Mutex::new(Published::default()),
            lock_timeout,
        })
    }

    pub fn get_status(&self) -> CrockpotStatus {
        self.try_status()
            .unwrap_or_else(|| self.last_published().status)
    }

    pub fn try_status(&self) -> Option<CrockpotStatus> {
        self.shared
            .lock_for(self.lock_timeout)
            .map(|shared| shared.status)
    }

    pub fn relay_main(&self) -> bool {
        self.last_published().relay_main
    }

    /// Request a new operating state. The relay and the stored state change
    /// together or not at all.
    pub fn set_state(&self, state: OperatingState) -> Result<(), ControlError> {
        info!("setting state to: {state}");

        let Some(mut shared) = self.shared.lock_for(self.lock_timeout) else {
            error!("failed to acquire state lock");
            return Err(ControlError::LockTimeout(self.lock_timeout));
        };

        if let Err(err) = shared.relay.apply_state(state) {
            error!("failed to apply state to relay: {err}");
            return Err(err.into());
        }

        shared.status.state = state;
        self.publish(&shared);
        drop(shared);

        info!("state changed to: {state}");
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    fn publish(&self, shared: &Shared<R>) {
        let mut published = self
            .published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        published.status = shared.status;
        published.relay_main = shared.relay.is_on(RelayChannel::Main);
    }

    fn last_published(&self) -> Published {
        *self
            .published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleReport {
    pub reading: TemperatureReading,
    pub status: CrockpotStatus,
    pub shutoff: Option<SafetyShutoff>,
    pub consecutive_errors: u32,
}

pub struct Supervisor<R, T, N> {
    crockpot: Arc<Crockpot<R>>,
    source: T,
    network: N,
    config: CrockpotConfig,
    consecutive_errors: u32,
    boot: Instant,
}

impl<R, T, N> Supervisor<R, T, N>
where
    R: RelayActuator,
    T: TemperatureSource,
    N: Connectivity,
{
    pub fn new(crockpot: Arc<Crockpot<R>>, source: T, network: N, config: CrockpotConfig) -> Self {
        Self {
            crockpot,
            source,
            network,
            config,
            consecutive_errors: 0,
            boot: Instant::now(),
        }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn crockpot(&self) -> &Arc<Crockpot<R>> {
        &self.crockpot
    }

    pub fn cycle(&mut self) -> Option<CycleReport> {
        let uptime = self.boot.elapsed();
        self.cycle_at(uptime)
    }

    pub fn cycle_at(&mut self, uptime: Duration) -> Option<CycleReport> {
        let reading = self.source.read();
        let wifi_connected = self.network.is_connected();

        let mut shared = self.crockpot.shared.lock_for(self.crockpot.lock_timeout)?;

        if reading.valid {
            shared.status.temperature_f = reading.temperature_f;
            shared.status.sensor_error = false;
            self.consecutive_errors = 0;
        } else {
            // Keep the last good temperature in place. Failures only count
            // while the element may be heating.
            shared.status.sensor_error = true;
            if shared.status.state != OperatingState::Off {
                self.consecutive_errors = self.consecutive_errors.saturating_add(1);
            }
        }

        shared.status.uptime_seconds = u32::try_from(uptime.as_secs()).unwrap_or(u32::MAX);
        shared.status.wifi_connected = wifi_connected;

        let mut shutoff = None;

        if reading.valid && reading.temperature_f > self.config.safety_temp_f {
            warn!(
                "SAFETY: temperature {:.1} F exceeds limit, shutting off",
                reading.temperature_f
            );
            if let Err(err) = shared.force_off() {
                error!("relay shutoff failed during over-temperature: {err}");
            }
            shutoff = Some(SafetyShutoff::OverTemperature {
                temperature_f: reading.temperature_f,
                limit_f: self.config.safety_temp_f,
            });
        }

        if shared.status.sensor_error
            && self.consecutive_errors > self.config.max_sensor_errors
            && shared.status.state != OperatingState::Off
        {
            warn!("SAFETY: persistent sensor error, shutting off");
            if let Err(err) = shared.force_off() {
                error!("relay shutoff failed during sensor fault: {err}");
            }
            shutoff = Some(SafetyShutoff::SensorFailure {
                consecutive_errors: self.consecutive_errors,
            });
            self.consecutive_errors = 0;
        }

        self.crockpot.publish(&shared);
        let status = shared.status;
        drop(shared);

        Some(CycleReport {
            reading,
            status,
            shutoff,
            consecutive_errors: self.consecutive_errors,
        })
    }

    pub fn run<F>(mut self, mut on_cycle: F) -> !
    where
        F: FnMut(Option<&CycleReport>, Duration),
    {
        let period = self.config.control_interval();
        info!("control supervisor started ({}ms period)", period.as_millis());

        let mut pacer = Pacer::new(period, Instant::now());
        loop {
            let elapsed = pacer.begin(Instant::now());
            let report = self.cycle();
            if report.is_none() {
                warn!("state lock busy, skipping supervisor cycle");
            }
            on_cycle(report.as_ref(), elapsed);

            let pause = pacer.finish(Instant::now());
            if !pause.is_zero() {
                thread::sleep(pause);
            }
        }
    }
}

// Cycle timing against absolute deadlines. Deadlines stay on the
// `start + k * period` grid however long a cycle takes, unless the loop
// falls more than one period behind; then the grid restarts from the
// finishing instant instead of bursting to catch up.
#[derive(Debug, Clone, Copy)]
struct Pacer {
    period: Duration,
    due: Instant,
    last_start: Option<Instant>,
}

impl Pacer {
    fn new(period: Duration, start: Instant) -> Self {
        Self {
            period,
            due: start,
            last_start: None,
        }
    }

    fn begin(&mut self, now: Instant) -> Duration {
        let elapsed = self
            .last_start
            .map_or(Duration::ZERO, |last| now.saturating_duration_since(last));
        self.last_start = Some(now);
        elapsed
    }

    fn finish(&mut self, now: Instant) -> Duration {
        self.due = next_deadline(self.due, now, self.period);
        self.due.saturating_duration_since(now)
    }
}

fn next_deadline(due: Instant, now: Instant, period: Duration) -> Instant {
    let next = due + period;
    if now.saturating_duration_since(next) > period {
        now
    } else {
        next
    }
}
