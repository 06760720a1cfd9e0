use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrockpotConfig {
    pub safety_temp_f: f32,
    pub control_interval_ms: u64,
    pub max_sensor_errors: u32,
    pub lock_timeout_ms: u64,
    pub status_log_interval_ms: u64,
}

impl Default for CrockpotConfig {
    fn default() -> Self {
        Self {
            safety_temp_f: 300.0,
            control_interval_ms: 1_000,
            max_sensor_errors: 10,
            lock_timeout_ms: 100,
            status_log_interval_ms: 30_000,
        }
    }
}

impl CrockpotConfig {
    pub fn control_interval(&self) -> Duration {
        Duration::from_millis(self.control_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn sanitize(&mut self) {
        if !self.safety_temp_f.is_finite() {
            self.safety_temp_f = Self::default().safety_temp_f;
        }
        self.safety_temp_f = self.safety_temp_f.clamp(150.0, 450.0);
        self.control_interval_ms = self.control_interval_ms.clamp(100, 10_000);
        self.max_sensor_errors = self.max_sensor_errors.clamp(1, 120);
        self.lock_timeout_ms = self.lock_timeout_ms.clamp(10, 1_000);
        self.status_log_interval_ms = self.status_log_interval_ms.max(1_000);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayHardwareConfig {
    pub main_gpio: i32,
    // Some relay boards energize on a low level.
    pub active_high: bool,
}

impl Default for RelayHardwareConfig {
    fn default() -> Self {
        Self {
            main_gpio: 5,
            active_high: true,
        }
    }
}

impl RelayHardwareConfig {
    pub fn sanitize(&mut self) {
        if self.main_gpio < 0 {
            self.main_gpio = Self::default().main_gpio;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorHardwareConfig {
    pub cs_gpio: i32,
    pub clk_gpio: i32,
    pub miso_gpio: i32,
    pub clock_hz: u32,
}

impl Default for SensorHardwareConfig {
    fn default() -> Self {
        Self {
            cs_gpio: 10,
            clk_gpio: 12,
            miso_gpio: 13,
            clock_hz: 4_000_000,
        }
    }
}

impl SensorHardwareConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.cs_gpio < 0 {
            self.cs_gpio = defaults.cs_gpio;
        }
        if self.clk_gpio < 0 {
            self.clk_gpio = defaults.clk_gpio;
        }
        if self.miso_gpio < 0 {
            self.miso_gpio = defaults.miso_gpio;
        }
        // MAX31855 tops out at 5 MHz.
        self.clock_hz = self.clock_hz.clamp(100_000, 5_000_000);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLogConfig {
    pub interval_secs: u32,
    pub max_entries: usize,
}

impl Default for DataLogConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_entries: 1_440,
        }
    }
}

impl DataLogConfig {
    pub fn sanitize(&mut self) {
        self.interval_secs = self.interval_secs.clamp(1, 3_600);
        self.max_entries = self.max_entries.clamp(1, 10_080);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub wifi_connect_timeout_ms: u64,
    pub telegram_bot_token: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            wifi_connect_timeout_ms: 30_000,
            telegram_bot_token: String::new(),
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

impl NetworkConfig {
    pub fn has_station_credentials(&self) -> bool {
        !self.wifi_ssid.trim().is_empty()
    }

    pub fn telegram_enabled(&self) -> bool {
        !self.telegram_bot_token.trim().is_empty()
    }

    pub fn wifi_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.wifi_connect_timeout_ms)
    }

    pub fn sanitize(&mut self) {
        self.wifi_connect_timeout_ms = self.wifi_connect_timeout_ms.clamp(5_000, 120_000);
        if self.mqtt_port == 0 {
            self.mqtt_port = 1883;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub crockpot: CrockpotConfig,
    #[serde(default)]
    pub relay: RelayHardwareConfig,
    #[serde(default)]
    pub sensor: SensorHardwareConfig,
    #[serde(default)]
    pub datalog: DataLogConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.crockpot.sanitize();
        self.relay.sanitize();
        self.sensor.sanitize();
        self.datalog.sanitize();
        self.network.sanitize();
    }
}
