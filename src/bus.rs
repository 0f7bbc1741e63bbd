use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;

/// A bus transfer that kept failing after the whole retry budget was spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusError;

/// Bounded retry with linear backoff: after failed attempt `n` the bus
/// sleeps `backoff_base_ms * n` before trying again.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub max_retries: u8,
    pub backoff_base_ms: u32,
}

impl RetryPolicy {
    pub const fn with_retries(max_retries: u8) -> Self {
        Self {
            max_retries,
            backoff_base_ms: 200,
        }
    }
}

/// Register-addressed transport for a single I2C device.
///
/// Owns the bus handle exclusively; all transfers are strictly sequential.
pub(crate) struct RegisterBus<I2C, D> {
    i2c: I2C,
    address: u8,
    retry: RetryPolicy,
    delay: D,
}

// Largest register write is the 4-byte CCS811 reset key, plus the register.
const MAX_WRITE: usize = 8;

impl<I2C, D> RegisterBus<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    pub fn new(i2c: I2C, address: u8, retry: RetryPolicy, delay: D) -> Self {
        Self {
            i2c,
            address,
            retry,
            delay,
        }
    }

    pub async fn read_byte(&mut self, register: u8) -> Result<u8, BusError> {
        let mut buf = [0u8; 1];
        let mut attempt = 0u8;
        loop {
            match self.i2c.write_read(self.address, &[register], &mut buf).await {
                Ok(()) => return Ok(buf[0]),
                Err(_) => self.backoff(&mut attempt, register).await?,
            }
        }
    }

    pub async fn write_byte(&mut self, register: u8, value: u8) -> Result<(), BusError> {
        let mut attempt = 0u8;
        loop {
            match self.i2c.write(self.address, &[register, value]).await {
                Ok(()) => return Ok(()),
                Err(_) => self.backoff(&mut attempt, register).await?,
            }
        }
    }

    pub async fn read_block(&mut self, register: u8, buf: &mut [u8]) -> Result<(), BusError> {
        let mut attempt = 0u8;
        loop {
            match self.i2c.write_read(self.address, &[register], buf).await {
                Ok(()) => return Ok(()),
                Err(_) => self.backoff(&mut attempt, register).await?,
            }
        }
    }

    /// Writes `data` to `register` in one transfer. An empty `data` emits
    /// the bare register address, which the CCS811 uses as a command.
    pub async fn write_block(&mut self, register: u8, data: &[u8]) -> Result<(), BusError> {
        debug_assert!(data.len() < MAX_WRITE);
        let mut frame = [0u8; MAX_WRITE];
        frame[0] = register;
        frame[1..=data.len()].copy_from_slice(data);
        let mut attempt = 0u8;
        loop {
            match self.i2c.write(self.address, &frame[..=data.len()]).await {
                Ok(()) => return Ok(()),
                Err(_) => self.backoff(&mut attempt, register).await?,
            }
        }
    }

    /// Plain fixed delay, used for post-reset and post-command settle times.
    pub async fn settle_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms).await;
    }

    async fn backoff(&mut self, attempt: &mut u8, register: u8) -> Result<(), BusError> {
        if *attempt >= self.retry.max_retries {
            return Err(BusError);
        }
        *attempt += 1;
        #[cfg(feature = "defmt")]
        defmt::debug!(
            "i2c transfer to reg {=u8:x} failed, retry {} of {}",
            register,
            *attempt,
            self.retry.max_retries
        );
        #[cfg(not(feature = "defmt"))]
        let _ = register;
        self.delay
            .delay_ms(self.retry.backoff_base_ms * u32::from(*attempt))
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use embedded_hal::i2c::ErrorKind;
    use embedded_hal_mock::eh1::i2c::{Mock as I2cMock, Transaction as I2cTransaction};
    use futures::executor::block_on;
    use std::rc::Rc;

    const ADDR: u8 = 0x5B;

    /// Records every requested sleep (in ms) instead of sleeping.
    #[derive(Clone, Default)]
    struct RecordingDelay {
        slept_ms: Rc<RefCell<Vec<u32>>>,
    }

    impl DelayNs for RecordingDelay {
        async fn delay_ns(&mut self, ns: u32) {
            self.slept_ms.borrow_mut().push(ns / 1_000_000);
        }

        async fn delay_ms(&mut self, ms: u32) {
            self.slept_ms.borrow_mut().push(ms);
        }
    }

    fn bus(
        i2c: I2cMock,
        max_retries: u8,
        delay: RecordingDelay,
    ) -> RegisterBus<I2cMock, RecordingDelay> {
        RegisterBus::new(i2c, ADDR, RetryPolicy::with_retries(max_retries), delay)
    }

    #[test]
    fn read_byte_succeeds_after_transient_failures() {
        let expectations = [
            I2cTransaction::write_read(ADDR, vec![0x00], vec![0x00]).with_error(ErrorKind::Other),
            I2cTransaction::write_read(ADDR, vec![0x00], vec![0x00]).with_error(ErrorKind::Other),
            I2cTransaction::write_read(ADDR, vec![0x00], vec![0x90]),
        ];
        let mut i2c = I2cMock::new(&expectations);
        let delay = RecordingDelay::default();
        let mut bus = bus(i2c.clone(), 3, delay.clone());

        let value = block_on(bus.read_byte(0x00)).unwrap();
        assert_eq!(value, 0x90);

        // Linear backoff, strictly increasing.
        assert_eq!(*delay.slept_ms.borrow(), vec![200, 400]);
        i2c.done();
    }

    #[test]
    fn read_byte_surfaces_error_after_exhausting_retries() {
        let failed = I2cTransaction::write_read(ADDR, vec![0x20], vec![0x00])
            .with_error(ErrorKind::Other);
        let expectations = [failed.clone(), failed.clone(), failed.clone(), failed];
        let mut i2c = I2cMock::new(&expectations);
        let delay = RecordingDelay::default();
        let mut bus = bus(i2c.clone(), 3, delay.clone());

        assert_eq!(block_on(bus.read_byte(0x20)), Err(BusError));
        assert_eq!(*delay.slept_ms.borrow(), vec![200, 400, 600]);
        i2c.done();
    }

    #[test]
    fn write_byte_retries_then_succeeds() {
        let expectations = [
            I2cTransaction::write(ADDR, vec![0x01, 0x10]).with_error(ErrorKind::Other),
            I2cTransaction::write(ADDR, vec![0x01, 0x10]),
        ];
        let mut i2c = I2cMock::new(&expectations);
        let delay = RecordingDelay::default();
        let mut bus = bus(i2c.clone(), 5, delay.clone());

        block_on(bus.write_byte(0x01, 0x10)).unwrap();
        assert_eq!(*delay.slept_ms.borrow(), vec![200]);
        i2c.done();
    }

    #[test]
    fn write_block_frames_register_and_payload() {
        let expectations = [I2cTransaction::write(ADDR, vec![0xFF, 0x11, 0xE5, 0x72, 0x8A])];
        let mut i2c = I2cMock::new(&expectations);
        let mut bus = bus(i2c.clone(), 5, RecordingDelay::default());

        block_on(bus.write_block(0xFF, &[0x11, 0xE5, 0x72, 0x8A])).unwrap();
        i2c.done();
    }

    #[test]
    fn empty_write_block_emits_bare_register() {
        let expectations = [I2cTransaction::write(ADDR, vec![0xF4])];
        let mut i2c = I2cMock::new(&expectations);
        let mut bus = bus(i2c.clone(), 5, RecordingDelay::default());

        block_on(bus.write_block(0xF4, &[])).unwrap();
        i2c.done();
    }

    #[test]
    fn read_block_fills_caller_buffer() {
        let expectations = [I2cTransaction::write_read(
            ADDR,
            vec![0x02],
            vec![1, 2, 3, 4, 5, 6, 7, 8],
        )];
        let mut i2c = I2cMock::new(&expectations);
        let mut bus = bus(i2c.clone(), 5, RecordingDelay::default());

        let mut buf = [0u8; 8];
        block_on(bus.read_block(0x02, &mut buf)).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
        i2c.done();
    }
}
