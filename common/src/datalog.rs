use std::{collections::VecDeque, fmt::Write as _, time::Duration};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::{
    config::DataLogConfig,
    program::ProgramStatus,
    types::{CrockpotStatus, OperatingState},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: u32,
    pub temperature_f: f32,
    pub state: OperatingState,
    pub relay_main: bool,
    #[serde(default)]
    pub program_active: bool,
    #[serde(default)]
    pub program_name: String,
    #[serde(default)]
    pub program_step: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LogStats {
    pub min_temp: f32,
    pub max_temp: f32,
    pub avg_temp: f32,
    pub duration_seconds: u32,
    pub entry_count: usize,
}

#[derive(Serialize)]
struct LogExport<'a> {
    log_interval_seconds: u32,
    entry_count: usize,
    entries: &'a VecDeque<LogEntry>,
}

#[derive(Deserialize)]
struct LogImport {
    #[serde(default)]
    entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct ProgramInfo {
    name: String,
    step: usize,
}

const CSV_HEADER: &str =
    "timestamp,temperature_f,state,relay_main,program_active,program_name,program_step";

#[derive(Debug, Clone)]
pub struct DataLog {
    interval: Duration,
    max_entries: usize,
    entries: VecDeque<LogEntry>,
    since_last: Duration,
    program: Option<ProgramInfo>,
}

impl Default for DataLog {
    fn default() -> Self {
        Self::new(&DataLogConfig::default())
    }
}

impl DataLog {
    pub fn new(config: &DataLogConfig) -> Self {
        let max_entries = config.max_entries.max(1);
        Self {
            interval: Duration::from_secs(u64::from(config.interval_secs.max(1))),
            max_entries,
            entries: VecDeque::with_capacity(max_entries),
            since_last: Duration::ZERO,
            program: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval.as_secs()
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn set_program(&mut self, program: Option<&ProgramStatus>) {
        self.program = program.map(|status| ProgramInfo {
            name: status.name.clone(),
            step: status.step,
        });
    }

    pub fn tick(&mut self, status: &CrockpotStatus, relay_main: bool, elapsed: Duration) -> bool {
        self.since_last += elapsed;
        if self.since_last < self.interval {
            return false;
        }

        self.force_log(status, relay_main);
        true
    }

    pub fn force_log(&mut self, status: &CrockpotStatus, relay_main: bool) {
        let (program_active, program_name, program_step) = match &self.program {
            Some(info) => (true, info.name.clone(), info.step),
            None => (false, String::new(), 0),
        };

        self.push(LogEntry {
            timestamp: status.uptime_seconds,
            temperature_f: status.temperature_f,
            state: status.state,
            relay_main,
            program_active,
            program_name,
            program_step,
        });
        self.since_last = Duration::ZERO;
    }

    fn push(&mut self, entry: LogEntry) {
        if self.entries.len() == self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn recent(&self, count: usize) -> Vec<LogEntry> {
        let skip = self.entries.len().saturating_sub(count);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn temperature_history(&self, count: Option<usize>) -> Vec<f32> {
        let skip = count.map_or(0, |count| self.entries.len().saturating_sub(count));
        self.entries
            .iter()
            .skip(skip)
            .map(|entry| entry.temperature_f)
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.since_last = Duration::ZERO;
    }

    pub fn stats(&self) -> LogStats {
        let (Some(first), Some(last)) = (self.entries.front(), self.entries.back()) else {
            return LogStats::default();
        };

        let mut min_temp = f32::INFINITY;
        let mut max_temp = f32::NEG_INFINITY;
        let mut sum = 0.0_f64;
        for entry in &self.entries {
            min_temp = min_temp.min(entry.temperature_f);
            max_temp = max_temp.max(entry.temperature_f);
            sum += f64::from(entry.temperature_f);
        }

        LogStats {
            min_temp,
            max_temp,
            avg_temp: (sum / self.entries.len() as f64) as f32,
            duration_seconds: last.timestamp.saturating_sub(first.timestamp),
            entry_count: self.entries.len(),
        }
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::with_capacity(CSV_HEADER.len() + 48 * self.entries.len());
        out.push_str(CSV_HEADER);
        out.push('\n');

        for entry in &self.entries {
            let _ = writeln!(
                out,
                "{},{:.1},{},{},{},{},{}",
                entry.timestamp,
                entry.temperature_f,
                entry.state,
                u8::from(entry.relay_main),
                u8::from(entry.program_active),
                csv_field(&entry.program_name),
                entry.program_step,
            );
        }
        out
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&LogExport {
            log_interval_seconds: self.interval.as_secs() as u32,
            entry_count: self.entries.len(),
            entries: &self.entries,
        })
    }

    /// Replace the buffer with entries from a JSON export, keeping only the
    /// newest `max_entries`. The buffer is untouched when parsing fails.
    pub fn load_json(&mut self, json: &str) -> serde_json::Result<usize> {
        let import: LogImport = serde_json::from_str(json)?;

        self.entries.clear();
        for entry in import.entries {
            self.push(entry);
        }
        self.since_last = Duration::ZERO;
        Ok(self.entries.len())
    }
}

pub fn export_file_name(at: NaiveDateTime, extension: &str) -> String {
    format!("crockpot_log_{}.{extension}", at.format("%Y%m%d_%H%M%S"))
}

pub fn export_file_name_now(extension: &str) -> String {
    export_file_name(chrono::Local::now().naive_local(), extension)
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    const SECOND: Duration = Duration::from_secs(1);

    fn status(uptime: u32, temperature_f: f32, state: OperatingState) -> CrockpotStatus {
        CrockpotStatus {
            state,
            temperature_f,
            uptime_seconds: uptime,
            ..CrockpotStatus::default()
        }
    }

    fn small_log(max_entries: usize) -> DataLog {
        DataLog::new(&DataLogConfig {
            interval_secs: 2,
            max_entries,
        })
    }

    #[test]
    fn logs_once_per_interval() {
        let mut log = small_log(10);
        let sample = status(1, 100.0, OperatingState::Low);

        assert!(!log.tick(&sample, true, SECOND));
        assert!(log.tick(&sample, true, SECOND));
        assert!(!log.tick(&sample, true, SECOND));
        assert!(log.tick(&sample, true, SECOND));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn ring_buffer_drops_oldest() {
        let mut log = small_log(3);
        for t in 0..5 {
            log.force_log(&status(t, t as f32, OperatingState::Warm), true);
        }

        assert_eq!(log.temperature_history(None), vec![2.0, 3.0, 4.0]);
        assert_eq!(log.temperature_history(Some(2)), vec![3.0, 4.0]);
        assert_eq!(log.recent(10).len(), 3);
        assert_eq!(log.recent(1)[0].timestamp, 4);
    }

    #[test]
    fn stats_cover_buffer() {
        let mut log = small_log(10);
        assert_eq!(log.stats(), LogStats::default());

        log.force_log(&status(60, 100.0, OperatingState::High), true);
        log.force_log(&status(120, 150.0, OperatingState::High), true);
        log.force_log(&status(180, 200.0, OperatingState::Low), true);

        assert_eq!(
            log.stats(),
            LogStats {
                min_temp: 100.0,
                max_temp: 200.0,
                avg_temp: 150.0,
                duration_seconds: 120,
                entry_count: 3,
            }
        );
    }

    #[test]
    fn csv_export_includes_program_columns() {
        let mut log = small_log(10);
        log.force_log(&status(5, 98.3, OperatingState::Off), false);
        log.set_program(Some(&ProgramStatus {
            name: "Stew, beef".to_string(),
            step: 2,
            total_steps: 3,
            state: OperatingState::Low,
            remaining_secs: Some(10),
            progress: 0.5,
        }));
        log.force_log(&status(65, 180.0, OperatingState::Low), true);

        assert_eq!(
            log.to_csv(),
            "timestamp,temperature_f,state,relay_main,program_active,program_name,program_step\n\
             5,98.3,OFF,0,0,,0\n\
             65,180.0,LOW,1,1,\"Stew, beef\",2\n"
        );
    }

    #[test]
    fn json_export_reloads() {
        let mut log = small_log(10);
        log.force_log(&status(60, 150.0, OperatingState::Warm), true);
        log.force_log(&status(120, 151.0, OperatingState::Warm), true);
        let json = log.to_json().unwrap();

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["log_interval_seconds"], 2);
        assert_eq!(value["entry_count"], 2);
        assert_eq!(value["entries"][0]["state"], "WARM");

        let mut restored = small_log(1);
        assert_eq!(restored.load_json(&json).unwrap(), 1);
        assert_eq!(restored.recent(1)[0].timestamp, 120);
    }

    #[test]
    fn failed_import_keeps_entries() {
        let mut log = small_log(10);
        log.force_log(&status(1, 70.0, OperatingState::Off), false);

        assert!(log.load_json("{\"entries\": [{\"state\": \"BOIL\"}]}").is_err());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn clear_resets_interval() {
        let mut log = small_log(10);
        let sample = status(1, 100.0, OperatingState::Low);
        log.tick(&sample, true, SECOND);
        log.clear();

        assert!(log.is_empty());
        assert!(!log.tick(&sample, true, SECOND));
    }

    #[test]
    fn export_names_are_timestamped() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(7, 5, 30)
            .unwrap();
        assert_eq!(export_file_name(at, "csv"), "crockpot_log_20240309_070530.csv");
    }
}
