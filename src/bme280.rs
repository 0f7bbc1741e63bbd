//! BME280 environmental sensor driver.
//!
//! `begin` configures oversampling/mode/standby and reads the factory
//! calibration block once; `read_data` then turns each raw ADC burst into
//! compensated temperature, humidity and pressure using the datasheet
//! floating-point formulas.

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;

use crate::bus::{BusError, RegisterBus, RetryPolicy};

/// Default I2C address (SDO low).
pub const BME280_I2C_ADDR: u8 = 0x76;

const RETRY_COUNT: u8 = 3;

mod reg {
    pub const CTRL_HUM: u8 = 0xF2;
    pub const CTRL_MEAS: u8 = 0xF4;
    pub const CONFIG: u8 = 0xF5;
    /// First calibration block: T1..T3 and P1..P9, 24 bytes.
    pub const CALIB_00: u8 = 0x88;
    /// H1.
    pub const CALIB_25: u8 = 0xA1;
    /// Second calibration block: H2..H6, 7 bytes.
    pub const CALIB_26: u8 = 0xE1;
    /// Measurement burst: press/temp/hum, 8 bytes.
    pub const DATA: u8 = 0xF7;
}

/// One compensated measurement cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EnvironmentalReading {
    /// Degrees Celsius.
    pub temperature: f32,
    /// Relative humidity, percent.
    pub humidity: f32,
    /// Hectopascal.
    pub pressure: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Bme280Error {
    /// Bus transfer still failing after the retry budget.
    Bus(BusError),
    /// `begin` has not completed successfully.
    Uninitialized,
}

impl From<BusError> for Bme280Error {
    fn from(err: BusError) -> Self {
        Self::Bus(err)
    }
}

/// Factory trimming coefficients, sign-corrected at parse time.
#[derive(Debug, Clone, Copy)]
struct Calibration {
    dig_t1: u16,
    dig_t2: i16,
    dig_t3: i16,
    dig_p1: u16,
    dig_p2: i16,
    dig_p3: i16,
    dig_p4: i16,
    dig_p5: i16,
    dig_p6: i16,
    dig_p7: i16,
    dig_p8: i16,
    dig_p9: i16,
    dig_h1: u8,
    dig_h2: i16,
    dig_h3: u8,
    dig_h4: i16,
    dig_h5: i16,
    dig_h6: i8,
}

impl Calibration {
    fn parse(tp: &[u8; 24], h1: u8, h: &[u8; 7]) -> Self {
        Self {
            dig_t1: u16::from_le_bytes([tp[0], tp[1]]),
            dig_t2: i16::from_le_bytes([tp[2], tp[3]]),
            dig_t3: i16::from_le_bytes([tp[4], tp[5]]),
            dig_p1: u16::from_le_bytes([tp[6], tp[7]]),
            dig_p2: i16::from_le_bytes([tp[8], tp[9]]),
            dig_p3: i16::from_le_bytes([tp[10], tp[11]]),
            dig_p4: i16::from_le_bytes([tp[12], tp[13]]),
            dig_p5: i16::from_le_bytes([tp[14], tp[15]]),
            dig_p6: i16::from_le_bytes([tp[16], tp[17]]),
            dig_p7: i16::from_le_bytes([tp[18], tp[19]]),
            dig_p8: i16::from_le_bytes([tp[20], tp[21]]),
            dig_p9: i16::from_le_bytes([tp[22], tp[23]]),
            dig_h1: h1,
            dig_h2: i16::from_le_bytes([h[0], h[1]]),
            dig_h3: h[2],
            // H4/H5 are 12-bit two's-complement split across 0xE4..0xE6.
            dig_h4: sign_extend_12((u16::from(h[3]) << 4) | u16::from(h[4] & 0x0F)),
            dig_h5: sign_extend_12((u16::from(h[5]) << 4) | u16::from(h[4] >> 4)),
            dig_h6: h[6] as i8,
        }
    }
}

fn sign_extend_12(raw: u16) -> i16 {
    ((raw << 4) as i16) >> 4
}

/// Fine-resolution temperature produced by the temperature step and
/// required by the pressure and humidity steps of the same cycle.
#[derive(Clone, Copy)]
struct FineTemperature(f32);

fn compensate_temperature(cal: &Calibration, adc_t: u32) -> (f32, FineTemperature) {
    let adc = adc_t as f32;
    let v1 = (adc / 16384.0 - f32::from(cal.dig_t1) / 1024.0) * f32::from(cal.dig_t2);
    let v2 = (adc / 131072.0 - f32::from(cal.dig_t1) / 8192.0)
        * (adc / 131072.0 - f32::from(cal.dig_t1) / 8192.0)
        * f32::from(cal.dig_t3);
    let t_fine = v1 + v2;
    (t_fine / 5120.0, FineTemperature(t_fine))
}

/// Returns hPa, or `None` when the calibration denominator collapses to
/// zero and the division must be skipped.
fn compensate_pressure(cal: &Calibration, adc_p: u32, fine: FineTemperature) -> Option<f32> {
    let mut v1 = fine.0 / 2.0 - 64000.0;
    let mut v2 = v1 / 4.0 * (v1 / 4.0) / 2048.0 * f32::from(cal.dig_p6);
    v2 += v1 * f32::from(cal.dig_p5) * 2.0;
    v2 = v2 / 4.0 + f32::from(cal.dig_p4) * 65536.0;
    v1 = (f32::from(cal.dig_p3) * (v1 / 4.0 * (v1 / 4.0)) / 8192.0 / 8.0
        + f32::from(cal.dig_p2) * v1 / 2.0)
        / 262144.0;
    v1 = (32768.0 + v1) * f32::from(cal.dig_p1) / 32768.0;
    if v1 == 0.0 {
        return None;
    }

    let mut pressure = ((1048576.0 - adc_p as f32) - v2 / 4096.0) * 3125.0;
    pressure = pressure * 2.0 / v1;
    v1 = f32::from(cal.dig_p9) * (pressure / 8.0 * (pressure / 8.0)) / 8192.0 / 4096.0;
    v2 = pressure / 4.0 * f32::from(cal.dig_p8) / 8192.0;
    pressure += (v1 + v2 + f32::from(cal.dig_p7)) / 16.0;
    Some(pressure / 100.0)
}

fn compensate_humidity(cal: &Calibration, adc_h: u32, fine: FineTemperature) -> f32 {
    let h = fine.0 - 76800.0;
    let mut var_h = (adc_h as f32
        - (f32::from(cal.dig_h4) * 64.0 + f32::from(cal.dig_h5) / 16384.0 * h))
        * (f32::from(cal.dig_h2) / 65536.0
            * (1.0
                + f32::from(cal.dig_h6) / 67108864.0
                    * h
                    * (1.0 + f32::from(cal.dig_h3) / 67108864.0 * h)));
    var_h *= 1.0 - f32::from(cal.dig_h1) * var_h / 524288.0;
    var_h.clamp(0.0, 100.0)
}

pub struct Bme280Sensor<I2C, D> {
    bus: RegisterBus<I2C, D>,
    calib: Option<Calibration>,
    reading: EnvironmentalReading,
}

impl<I2C, D> Bme280Sensor<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    pub fn new(i2c: I2C, address: u8, delay: D) -> Self {
        Self {
            bus: RegisterBus::new(i2c, address, RetryPolicy::with_retries(RETRY_COUNT), delay),
            calib: None,
            reading: EnvironmentalReading::default(),
        }
    }

    /// Configures the sensor and reads the calibration block. Must succeed
    /// before `read_data`; any bus failure leaves the driver uninitialized.
    pub async fn begin(&mut self) -> Result<(), Bme280Error> {
        let osrs_t = 1u8; // temperature oversampling x1
        let osrs_p = 1u8; // pressure oversampling x1
        let osrs_h = 1u8; // humidity oversampling x1
        let mode = 3u8; // normal mode
        let t_sb = 5u8; // standby 1000 ms
        let filter = 0u8; // filter off
        let spi3w_en = 0u8; // 3-wire SPI off

        self.bus.write_byte(reg::CTRL_HUM, osrs_h).await?;
        self.bus
            .write_byte(reg::CTRL_MEAS, (osrs_t << 5) | (osrs_p << 2) | mode)
            .await?;
        self.bus
            .write_byte(reg::CONFIG, (t_sb << 5) | (filter << 2) | spi3w_en)
            .await?;

        let mut tp = [0u8; 24];
        self.bus.read_block(reg::CALIB_00, &mut tp).await?;
        let h1 = self.bus.read_byte(reg::CALIB_25).await?;
        let mut h = [0u8; 7];
        self.bus.read_block(reg::CALIB_26, &mut h).await?;

        self.calib = Some(Calibration::parse(&tp, h1, &h));
        #[cfg(feature = "defmt")]
        defmt::debug!("bme280 configured, calibration loaded");
        Ok(())
    }

    /// Reads one raw burst and computes the compensated reading.
    ///
    /// Temperature is always computed first; pressure and humidity both
    /// consume its fine-temperature result. When the pressure denominator
    /// is zero the previous pressure value is kept.
    pub async fn read_data(&mut self) -> Result<EnvironmentalReading, Bme280Error> {
        let cal = self.calib.ok_or(Bme280Error::Uninitialized)?;

        let mut data = [0u8; 8];
        self.bus.read_block(reg::DATA, &mut data).await?;

        let adc_p =
            (u32::from(data[0]) << 12) | (u32::from(data[1]) << 4) | (u32::from(data[2]) >> 4);
        let adc_t =
            (u32::from(data[3]) << 12) | (u32::from(data[4]) << 4) | (u32::from(data[5]) >> 4);
        let adc_h = (u32::from(data[6]) << 8) | u32::from(data[7]);

        let (temperature, fine) = compensate_temperature(&cal, adc_t);
        self.reading.temperature = temperature;
        if let Some(pressure) = compensate_pressure(&cal, adc_p, fine) {
            self.reading.pressure = pressure;
        }
        self.reading.humidity = compensate_humidity(&cal, adc_h, fine);

        Ok(self.reading)
    }

    /// Last computed temperature, °C.
    pub fn temperature(&self) -> f32 {
        self.reading.temperature
    }

    /// Last computed relative humidity, %.
    pub fn humidity(&self) -> f32 {
        self.reading.humidity
    }

    /// Last computed pressure, hPa.
    pub fn pressure(&self) -> f32 {
        self.reading.pressure
    }
}
