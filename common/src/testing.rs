use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use crate::{
    crockpot::Connectivity,
    relay::RelayPin,
    temperature::TemperatureSource,
    types::TemperatureReading,
};

#[derive(Debug, Default)]
struct PinLog {
    levels: Vec<bool>,
    fail: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingPin {
    log: Arc<Mutex<PinLog>>,
}

impl RecordingPin {
    pub fn levels(&self) -> Vec<bool> {
        self.log.lock().unwrap().levels.clone()
    }

    pub fn last_level(&self) -> Option<bool> {
        self.log.lock().unwrap().levels.last().copied()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.log.lock().unwrap().fail = fail;
    }
}

impl RelayPin for RecordingPin {
    type Error = &'static str;

    fn set_level(&mut self, high: bool) -> Result<(), Self::Error> {
        let mut log = self.log.lock().unwrap();
        if log.fail {
            return Err("gpio write rejected");
        }
        log.levels.push(high);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    queue: Arc<Mutex<VecDeque<TemperatureReading>>>,
    last: Arc<Mutex<TemperatureReading>>,
}

impl ScriptedSource {
    pub fn push(&self, reading: TemperatureReading) {
        self.queue.lock().unwrap().push_back(reading);
    }

    pub fn push_f(&self, temperature_f: f32) {
        self.push(TemperatureReading::from_fahrenheit(temperature_f));
    }

    pub fn push_invalid(&self, count: usize) {
        for _ in 0..count {
            self.push(TemperatureReading::invalid());
        }
    }
}

impl TemperatureSource for ScriptedSource {
    fn read(&mut self) -> TemperatureReading {
        let mut last = self.last.lock().unwrap();
        if let Some(next) = self.queue.lock().unwrap().pop_front() {
            *last = next;
        }
        *last
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlagConnectivity(pub Arc<AtomicBool>);

impl FlagConnectivity {
    pub fn set(&self, connected: bool) {
        self.0.store(connected, Ordering::Relaxed);
    }
}

impl Connectivity for FlagConnectivity {
    fn is_connected(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
