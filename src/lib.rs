//! Drivers for the CCS811 gas sensor (eCO2/TVOC) and the BME280
//! environmental sensor (temperature/humidity/pressure), written for the
//! Embassy async runtime.
//!
//! Both drivers are generic over [`embedded_hal_async::i2c::I2c`] and
//! [`embedded_hal_async::delay::DelayNs`]; on Embassy targets pass
//! `embassy_time::Delay`. Every bus transfer is retried with linear
//! backoff before an error is reported.
//!
//! The intended wiring is one driver per I2C peripheral, with an external
//! loop that reads the BME280 each cycle and feeds its temperature and
//! humidity into the CCS811 via
//! [`Ccs811Sensor::set_environmental_data`](ccs811::Ccs811Sensor::set_environmental_data)
//! to improve the gas readings. See `demos/read-sensors-rp.rs` for an
//! RP2040 sampling loop.

#![cfg_attr(not(test), no_std)]

mod bus;

pub mod bme280;
pub mod ccs811;

pub use bus::BusError;

pub use bme280::{BME280_I2C_ADDR, Bme280Error, Bme280Sensor, EnvironmentalReading};
pub use ccs811::{
    AirQualityReading, AirQualitySample, CCS811_I2C_ADDR, Ccs811Error, Ccs811Sensor, DriveMode,
};
