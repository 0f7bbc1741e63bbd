//! CCS811 gas sensor driver.
//!
//! The device boots into a bootloader; `begin` verifies the hardware
//! identity, soft-resets, checks that an application image is present,
//! starts it and programs the drive mode. After that each cycle is a
//! two-phase protocol: poll [`Ccs811Sensor::data_available`], then fetch
//! and classify the result block with
//! [`Ccs811Sensor::read_algorithm_results`].

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;

use crate::bus::{BusError, RegisterBus, RetryPolicy};

/// Default I2C address (ADDR high; 0x5A with ADDR low).
pub const CCS811_I2C_ADDR: u8 = 0x5B;

/// HW_ID register contents for a genuine CCS811.
const HW_ID: u8 = 0x81;

const RETRY_COUNT: u8 = 5;

/// Magic sequence that triggers a software reset when written to SW_RESET.
const RESET_KEY: [u8; 4] = [0x11, 0xE5, 0x72, 0x8A];

const RESET_SETTLE_MS: u32 = 100;
const APP_START_SETTLE_MS: u32 = 100;
const BASELINE_SETTLE_MS: u32 = 100;

mod reg {
    #![allow(dead_code)]

    pub const STATUS: u8 = 0x00;
    pub const MEAS_MODE: u8 = 0x01;
    pub const ALG_RESULT_DATA: u8 = 0x02;
    pub const RAW_DATA: u8 = 0x03;
    pub const ENV_DATA: u8 = 0x05;
    pub const NTC: u8 = 0x06;
    pub const THRESHOLDS: u8 = 0x10;
    pub const BASELINE: u8 = 0x11;
    pub const HW_ID: u8 = 0x20;
    pub const HW_VERSION: u8 = 0x21;
    pub const FW_BOOT_VERSION: u8 = 0x23;
    pub const FW_APP_VERSION: u8 = 0x24;
    pub const ERROR_ID: u8 = 0xE0;
    pub const APP_START: u8 = 0xF4;
    pub const SW_RESET: u8 = 0xFF;
}

// STATUS register bits.
const STATUS_ERROR: u8 = 1 << 0;
const STATUS_DATA_READY: u8 = 1 << 3;
const STATUS_APP_VALID: u8 = 1 << 4;

// MEAS_MODE register bits.
const MEAS_MODE_INT_DATARDY: u8 = 1 << 3;

// Sub-error bits mirrored into byte 5 of the result block.
const ERR_READ_REG_INVALID: u8 = 1 << 1;
const ERR_MEASMODE_INVALID: u8 = 1 << 2;

// Plausibility window for settled readings.
const ECO2_MIN: u16 = 400;
const ECO2_MAX: u16 = 8192;
const TVOC_MAX: u16 = 1187;

/// Measurement-rate profile written to the top nibble of MEAS_MODE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DriveMode {
    Idle = 0,
    EverySecond = 1,
    EveryTenSeconds = 2,
    EverySixtySeconds = 3,
    EveryQuarterSecond = 4,
}

impl DriveMode {
    /// Converts a raw level, clamping anything above 4 to the fastest mode.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Self::Idle,
            1 => Self::EverySecond,
            2 => Self::EveryTenSeconds,
            3 => Self::EverySixtySeconds,
            _ => Self::EveryQuarterSecond,
        }
    }
}

/// Last settled gas reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AirQualityReading {
    /// Equivalent CO2, ppm.
    pub eco2: u16,
    /// Total volatile organic compounds, ppb.
    pub tvoc: u16,
}

/// Outcome of one result-read cycle. `NotReady` and `Settling` are normal
/// transient states, not errors; the caller retries next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AirQualitySample {
    /// New settled reading; the cached values were updated.
    Fresh(AirQualityReading),
    /// Bytes were read but the values are outside the sensor's plausible
    /// window; the algorithm has not settled yet.
    Settling,
    /// The data-ready bit is not set yet.
    NotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Ccs811Error {
    /// Bus transfer still failing after the retry budget.
    Bus(BusError),
    /// HW_ID did not match a CCS811; payload is the id actually read.
    WrongDevice(u8),
    /// The status register reports an error; payload is ERROR_ID.
    DeviceError(u8),
    /// No application firmware is loaded on the device.
    AppNotValid,
    /// Environmental data outside the encodable range; nothing was written.
    EnvDataOutOfRange,
    /// `begin` has not completed successfully.
    Uninitialized,
}

impl From<BusError> for Ccs811Error {
    fn from(err: BusError) -> Self {
        Self::Bus(err)
    }
}

pub struct Ccs811Sensor<I2C, D> {
    bus: RegisterBus<I2C, D>,
    mode: DriveMode,
    started: bool,
    reading: AirQualityReading,
}

impl<I2C, D> Ccs811Sensor<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    pub fn new(i2c: I2C, address: u8, delay: D) -> Self {
        Self {
            bus: RegisterBus::new(i2c, address, RetryPolicy::with_retries(RETRY_COUNT), delay),
            mode: DriveMode::EverySecond,
            started: false,
            reading: AirQualityReading::default(),
        }
    }

    /// Boots the sensor into its application firmware.
    ///
    /// Verifies the hardware identity, soft-resets, validates the status
    /// and application image, starts the application and programs `mode`.
    /// All failures are fatal; the driver stays unstarted.
    pub async fn begin(&mut self, mode: DriveMode) -> Result<(), Ccs811Error> {
        let id = self.bus.read_byte(reg::HW_ID).await?;
        if id != HW_ID {
            return Err(Ccs811Error::WrongDevice(id));
        }

        self.bus.write_block(reg::SW_RESET, &RESET_KEY).await?;
        self.bus.settle_ms(RESET_SETTLE_MS).await;

        let status = self.bus.read_byte(reg::STATUS).await?;
        if status & STATUS_ERROR != 0 {
            let code = self.error_register().await?;
            return Err(Ccs811Error::DeviceError(code));
        }
        if status & STATUS_APP_VALID == 0 {
            return Err(Ccs811Error::AppNotValid);
        }

        // Zero-length write: APP_START is a command, not a register.
        self.bus.write_block(reg::APP_START, &[]).await?;
        self.bus.settle_ms(APP_START_SETTLE_MS).await;

        self.set_drive_mode(mode).await?;
        self.started = true;
        #[cfg(feature = "defmt")]
        defmt::debug!("ccs811 application started, drive mode {}", mode);
        Ok(())
    }

    /// Polls the status register's data-ready bit. Callers poll this (or
    /// just call [`Self::read_algorithm_results`]) with their own backoff.
    pub async fn data_available(&mut self) -> Result<bool, Ccs811Error> {
        if !self.started {
            return Err(Ccs811Error::Uninitialized);
        }
        let status = self.bus.read_byte(reg::STATUS).await?;
        Ok(status & STATUS_DATA_READY != 0)
    }

    /// Fetches and classifies the 8-byte result block.
    ///
    /// The cached eCO2/TVOC values are updated only on a
    /// [`AirQualitySample::Fresh`] outcome. When the device flags an
    /// invalid-measurement-mode error the configured drive mode is written
    /// back, so a transiently confused sensor heals on the next cycle.
    pub async fn read_algorithm_results(&mut self) -> Result<AirQualitySample, Ccs811Error> {
        if !self.data_available().await? {
            return Ok(AirQualitySample::NotReady);
        }

        let mut buf = [0u8; 8];
        self.bus.read_block(reg::ALG_RESULT_DATA, &mut buf).await?;
        let eco2 = (u16::from(buf[0] & 0x3F) << 8) | u16::from(buf[1]);
        let tvoc = (u16::from(buf[2] & 0x07) << 8) | u16::from(buf[3]);

        if !(ECO2_MIN..=ECO2_MAX).contains(&eco2) || tvoc > TVOC_MAX {
            return Ok(AirQualitySample::Settling);
        }

        if buf[4] & STATUS_ERROR != 0 {
            if buf[5] & ERR_READ_REG_INVALID != 0 {
                self.error_register().await?;
            }
            if buf[5] & ERR_MEASMODE_INVALID != 0 {
                self.error_register().await?;
                let mode = self.mode;
                #[cfg(feature = "defmt")]
                defmt::warn!("ccs811 lost its measurement mode, re-applying {}", mode);
                self.set_drive_mode(mode).await?;
            }
        }

        self.reading = AirQualityReading { eco2, tvoc };
        Ok(AirQualitySample::Fresh(self.reading))
    }

    /// Feeds an external temperature (°C) and relative humidity (%) into
    /// the sensor's compensation algorithm.
    ///
    /// Values outside -25..=50 °C or 0..=100 % are rejected without any
    /// bus traffic.
    pub async fn set_environmental_data(
        &mut self,
        temperature: f32,
        humidity: f32,
    ) -> Result<(), Ccs811Error> {
        if !(-25.0..=50.0).contains(&temperature) || !(0.0..=100.0).contains(&humidity) {
            return Err(Ccs811Error::EnvDataOutOfRange);
        }

        // The device wants 0.5-unit counts; the fraction bytes stay zero.
        // Operands are non-negative here, so +0.5 then truncate rounds to
        // the nearest count.
        let humidity_counts = ((humidity * 1000.0 + 250.0) / 500.0 + 0.5) as u8;
        let temperature_counts = (((temperature + 25.0) * 1000.0 + 250.0) / 500.0 + 0.5) as u8;

        self.bus
            .write_block(reg::ENV_DATA, &[humidity_counts, 0, temperature_counts, 0])
            .await?;
        Ok(())
    }

    /// Reads the opaque algorithm baseline for persisting across power
    /// cycles.
    pub async fn baseline(&mut self) -> Result<u16, Ccs811Error> {
        let mut buf = [0u8; 2];
        self.bus.read_block(reg::BASELINE, &mut buf).await?;
        Ok(u16::from_be_bytes(buf))
    }

    /// Restores a previously saved baseline.
    pub async fn set_baseline(&mut self, value: u16) -> Result<(), Ccs811Error> {
        self.bus
            .write_block(reg::BASELINE, &value.to_be_bytes())
            .await?;
        self.bus.settle_ms(BASELINE_SETTLE_MS).await;
        Ok(())
    }

    /// Programs the measurement rate, then fails if the device flags an
    /// error against it.
    pub async fn set_drive_mode(&mut self, mode: DriveMode) -> Result<(), Ccs811Error> {
        self.mode = mode;
        self.bus
            .write_byte(reg::MEAS_MODE, (mode as u8) << 4)
            .await?;

        let status = self.bus.read_byte(reg::STATUS).await?;
        if status & STATUS_ERROR != 0 {
            let code = self.error_register().await?;
            return Err(Ccs811Error::DeviceError(code));
        }
        Ok(())
    }

    /// Raw MEAS_MODE register contents.
    pub async fn drive_mode_register(&mut self) -> Result<u8, Ccs811Error> {
        Ok(self.bus.read_byte(reg::MEAS_MODE).await?)
    }

    pub async fn enable_interrupts(&mut self) -> Result<(), Ccs811Error> {
        self.set_interrupts(true).await
    }

    pub async fn disable_interrupts(&mut self) -> Result<(), Ccs811Error> {
        self.set_interrupts(false).await
    }

    async fn set_interrupts(&mut self, enabled: bool) -> Result<(), Ccs811Error> {
        let mut value = self.bus.read_byte(reg::MEAS_MODE).await?;
        if enabled {
            value |= MEAS_MODE_INT_DATARDY;
        } else {
            value &= !MEAS_MODE_INT_DATARDY;
        }
        self.bus.write_byte(reg::MEAS_MODE, value).await?;
        Ok(())
    }

    /// Reads ERROR_ID, which also clears the device's error condition.
    /// Bits: 0 write-reg-invalid, 1 read-reg-invalid, 2 measmode-invalid,
    /// 3 max-resistance, 4 heater-fault, 5 heater-supply.
    pub async fn error_register(&mut self) -> Result<u8, Ccs811Error> {
        let code = self.bus.read_byte(reg::ERROR_ID).await?;
        #[cfg(feature = "defmt")]
        defmt::debug!("ccs811 ERROR_ID {=u8:x}", code);
        Ok(code)
    }

    /// Last settled eCO2, ppm. Zero until the first fresh reading.
    pub fn eco2(&self) -> u16 {
        self.reading.eco2
    }

    /// Last settled TVOC, ppb. Zero until the first fresh reading.
    pub fn tvoc(&self) -> u16 {
        self.reading.tvoc
    }
}
