#![no_std]
#![no_main]

use defmt::{error, info, unwrap};
use defmt_rtt as _;
use embassy_ccs811_bme280::{
    AirQualitySample, BME280_I2C_ADDR, Bme280Sensor, CCS811_I2C_ADDR, Ccs811Sensor, DriveMode,
};
use embassy_executor::Spawner;
use embassy_rp::peripherals::{I2C0, I2C1};
use embassy_rp::{bind_interrupts, i2c};
use embassy_time::{Delay, Duration, Timer};
use panic_probe as _;

bind_interrupts!(struct Irqs {
    I2C0_IRQ => i2c::InterruptHandler<I2C0>;
    I2C1_IRQ => i2c::InterruptHandler<I2C1>;
});

#[embassy_executor::main]
async fn main(_spawner: Spawner) -> ! {
    let p = embassy_rp::init(Default::default());

    // BME280 on I2C0, CCS811 on I2C1; each driver owns its bus.
    let i2c0 = i2c::I2c::new_async(p.I2C0, p.PIN_1, p.PIN_0, Irqs, Default::default());
    let i2c1 = i2c::I2c::new_async(p.I2C1, p.PIN_3, p.PIN_2, Irqs, Default::default());

    let mut env = Bme280Sensor::new(i2c0, BME280_I2C_ADDR, Delay);
    let mut gas = Ccs811Sensor::new(i2c1, CCS811_I2C_ADDR, Delay);

    unwrap!(env.begin().await);
    unwrap!(gas.begin(DriveMode::EverySecond).await);

    // The first gas result takes a while after app start.
    while !unwrap!(gas.data_available().await) {
        Timer::after_millis(100).await;
    }

    loop {
        match env.read_data().await {
            Ok(r) => {
                info!(
                    "Temperature: {} °C, Humidity: {} %, Pressure: {} hPa",
                    r.temperature, r.humidity, r.pressure
                );
                // Feed the environment into the gas algorithm each cycle.
                if let Err(e) = gas.set_environmental_data(r.temperature, r.humidity).await {
                    error!("Environmental data rejected: {}", e);
                }
            }
            Err(e) => error!("BME280 read failed: {}", e),
        }

        let mut backoff = Duration::from_millis(100);
        loop {
            match gas.read_algorithm_results().await {
                Ok(AirQualitySample::Fresh(r)) => {
                    info!("eCO2: {} ppm, TVOC: {} ppb", r.eco2, r.tvoc);
                    if let Ok(baseline) = gas.baseline().await {
                        info!("Baseline: {=u16:x}", baseline);
                    }
                    if let Ok(mode) = gas.drive_mode_register().await {
                        info!("MEAS_MODE: {=u8:x}", mode);
                    }
                    break;
                }
                Ok(_) => {
                    // Not ready or still settling; back off up to 1 s.
                    Timer::after(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(1));
                }
                Err(e) => {
                    error!("CCS811 read failed: {}", e);
                    break;
                }
            }
        }

        Timer::after_secs(60).await;
    }
}
