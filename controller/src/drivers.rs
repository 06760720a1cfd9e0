use esp_idf_hal::{
    gpio::{AnyInputPin, AnyOutputPin, Output, PinDriver},
    spi::{
        config::{Config as SpiConfig, MODE_0},
        SpiDeviceDriver, SpiDriver, SpiDriverConfig, SPI2,
    },
    units::FromValueType,
};
use esp_idf_svc::sys::EspError;
use log::{debug, info, warn};
use thiserror::Error;

use crockpot_common::{
    config::{RelayHardwareConfig, SensorHardwareConfig},
    decode_max31855, RelayPin, TemperatureReading, TemperatureSource, ThermocoupleFault,
};

pub struct GpioRelayPin {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    gpio: i32,
}

impl GpioRelayPin {
    pub fn new(config: &RelayHardwareConfig) -> Result<Self, EspError> {
        let pin = unsafe { PinDriver::output(AnyOutputPin::new(config.main_gpio)) }?;
        info!("relay output on GPIO{}", config.main_gpio);
        Ok(Self {
            pin,
            gpio: config.main_gpio,
        })
    }
}

impl RelayPin for GpioRelayPin {
    type Error = GpioError;

    fn set_level(&mut self, high: bool) -> Result<(), Self::Error> {
        let result = if high {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        result.map_err(|source| GpioError {
            gpio: self.gpio,
            source,
        })
    }
}

#[derive(Debug, Error)]
#[error("GPIO{gpio}: {source}")]
pub struct GpioError {
    gpio: i32,
    source: EspError,
}

// Read-only part: no MOSI, so the bus is built without SDO.
pub struct Max31855 {
    device: SpiDeviceDriver<'static, SpiDriver<'static>>,
    last_fault: Option<ThermocoupleFault>,
}

impl Max31855 {
    pub fn new(spi: SPI2, config: &SensorHardwareConfig) -> Result<Self, EspError> {
        let driver = SpiDriver::new_without_sdo(
            spi,
            unsafe { AnyOutputPin::new(config.clk_gpio) },
            unsafe { AnyInputPin::new(config.miso_gpio) },
            &SpiDriverConfig::new(),
        )?;
        let bus_config = SpiConfig::new()
            .baudrate(config.clock_hz.Hz())
            .data_mode(MODE_0);
        let device = SpiDeviceDriver::new(
            driver,
            Some(unsafe { AnyOutputPin::new(config.cs_gpio) }),
            &bus_config,
        )?;

        info!(
            "MAX31855 on CS=GPIO{}, CLK=GPIO{}, MISO=GPIO{} at {} Hz",
            config.cs_gpio, config.clk_gpio, config.miso_gpio, config.clock_hz
        );

        Ok(Self {
            device,
            last_fault: None,
        })
    }

    pub fn last_fault(&self) -> Option<ThermocoupleFault> {
        self.last_fault
    }

    fn read_frame(&mut self) -> Result<u32, EspError> {
        let mut frame = [0_u8; 4];
        self.device.read(&mut frame)?;
        Ok(u32::from_be_bytes(frame))
    }
}

impl TemperatureSource for Max31855 {
    fn read(&mut self) -> TemperatureReading {
        let raw = match self.read_frame() {
            Ok(raw) => raw,
            Err(err) => {
                warn!("MAX31855 bus read failed: {err}");
                return TemperatureReading::default();
            }
        };
        debug!("MAX31855 raw frame 0x{raw:08x}");

        match decode_max31855(raw) {
            Ok(frame) => {
                self.last_fault = None;
                frame.reading()
            }
            Err(fault) => {
                if self.last_fault != Some(fault) {
                    warn!("thermocouple fault: {fault}");
                }
                self.last_fault = Some(fault);
                TemperatureReading::default()
            }
        }
    }
}
