// Bosch BME280 temperature / humidity / pressure sensor.
// Compensation follows the integer formulas of the datasheet (rev 1.6, section 4.2.3).

use super::{EnvReading, SensorError};
use embedded_hal::i2c::I2c;
use linux_embedded_hal::I2cdev;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::task;

pub const PRIMARY_ADDRESS: u8 = 0x76;
const CHIP_ID: u8 = 0x60;

const REG_CALIB_TP: u8 = 0x88; // 0x88..=0xA1, T/P words plus H1
const REG_CHIP_ID: u8 = 0xd0;
const REG_CALIB_H: u8 = 0xe1; // 0xE1..=0xE7
const REG_CTRL_HUM: u8 = 0xf2;
const REG_CTRL_MEAS: u8 = 0xf4;
const REG_CONFIG: u8 = 0xf5;
const REG_DATA: u8 = 0xf7; // 0xF7..=0xFE

const OVERSAMPLE_X1: u8 = 0b001;
const OVERSAMPLE_X2: u8 = 0b010;
const OVERSAMPLE_X16: u8 = 0b101;
const FILTER_X16: u8 = 0b100;
const MODE_NORMAL: u8 = 0b11;

// Raw value the chip reports for a channel that has not been measured yet
const SKIPPED: i32 = 0x80000;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Calibration {
    t1: u16,
    t2: i16,
    t3: i16,
    p1: u16,
    p2: i16,
    p3: i16,
    p4: i16,
    p5: i16,
    p6: i16,
    p7: i16,
    p8: i16,
    p9: i16,
    h1: u8,
    h2: i16,
    h3: u8,
    h4: i16,
    h5: i16,
    h6: i8,
}

impl Calibration {
    fn parse(tp: &[u8; 26], h: &[u8; 7]) -> Self {
        let u = |i: usize| u16::from_le_bytes([tp[i], tp[i + 1]]);
        let s = |i: usize| i16::from_le_bytes([tp[i], tp[i + 1]]);
        Self {
            t1: u(0),
            t2: s(2),
            t3: s(4),
            p1: u(6),
            p2: s(8),
            p3: s(10),
            p4: s(12),
            p5: s(14),
            p6: s(16),
            p7: s(18),
            p8: s(20),
            p9: s(22),
            h1: tp[25],
            h2: i16::from_le_bytes([h[0], h[1]]),
            h3: h[2],
            h4: (i16::from(h[3] as i8) << 4) | i16::from(h[4] & 0x0f),
            h5: (i16::from(h[5] as i8) << 4) | i16::from(h[4] >> 4),
            h6: h[6] as i8,
        }
    }

    /// Returns (t_fine, temperature in 0.01 °C).
    fn temperature(&self, adc_t: i32) -> (i32, i32) {
        let t1 = i32::from(self.t1);
        let var1 = (((adc_t >> 3) - (t1 << 1)) * i32::from(self.t2)) >> 11;
        let var2 = (((((adc_t >> 4) - t1) * ((adc_t >> 4) - t1)) >> 12) * i32::from(self.t3)) >> 14;
        let t_fine = var1 + var2;
        (t_fine, (t_fine * 5 + 128) >> 8)
    }

    /// Pressure in Pa as Q24.8.
    fn pressure(&self, t_fine: i32, adc_p: i32) -> u32 {
        let mut var1 = i64::from(t_fine) - 128000;
        let mut var2 = var1 * var1 * i64::from(self.p6);
        var2 += (var1 * i64::from(self.p5)) << 17;
        var2 += i64::from(self.p4) << 35;
        var1 = ((var1 * var1 * i64::from(self.p3)) >> 8) + ((var1 * i64::from(self.p2)) << 12);
        var1 = (((1i64 << 47) + var1) * i64::from(self.p1)) >> 33;
        if var1 == 0 {
            return 0;
        }
        let mut p = 1048576 - i64::from(adc_p);
        p = (((p << 31) - var2) * 3125) / var1;
        var1 = (i64::from(self.p9) * (p >> 13) * (p >> 13)) >> 25;
        var2 = (i64::from(self.p8) * p) >> 19;
        (((p + var1 + var2) >> 8) + (i64::from(self.p7) << 4)) as u32
    }

    /// Relative humidity in % as Q22.10.
    fn humidity(&self, t_fine: i32, adc_h: i32) -> u32 {
        let mut v = i64::from(t_fine) - 76800;
        v = (((i64::from(adc_h) << 14) - (i64::from(self.h4) << 20) - (i64::from(self.h5) * v)
            + 16384)
            >> 15)
            * (((((((v * i64::from(self.h6)) >> 10)
                * (((v * i64::from(self.h3)) >> 11) + 32768))
                >> 10)
                + 2097152)
                * i64::from(self.h2)
                + 8192)
                >> 14);
        v -= ((((v >> 15) * (v >> 15)) >> 7) * i64::from(self.h1)) >> 4;
        (v.clamp(0, 419430400) >> 12) as u32
    }

    fn compensate(&self, raw: &[u8; 8]) -> Result<EnvReading, SensorError> {
        let adc_p = (i32::from(raw[0]) << 12) | (i32::from(raw[1]) << 4) | (i32::from(raw[2]) >> 4);
        let adc_t = (i32::from(raw[3]) << 12) | (i32::from(raw[4]) << 4) | (i32::from(raw[5]) >> 4);
        let adc_h = (i32::from(raw[6]) << 8) | i32::from(raw[7]);
        if adc_t == SKIPPED {
            return Err(SensorError::NotReady);
        }
        let (t_fine, centi_celsius) = self.temperature(adc_t);
        Ok(EnvReading {
            temperature: centi_celsius as f32 / 100.0,
            humidity: self.humidity(t_fine, adc_h) as f32 / 1024.0,
            // Pa -> hPa
            pressure: self.pressure(t_fine, adc_p) as f32 / 256.0 / 100.0,
        })
    }
}

pub struct Bme280<I> {
    i2c: I,
    address: u8,
    calibration: Calibration,
}

impl<I: I2c> Bme280<I> {
    /// Checks the chip id, reads the factory calibration and starts normal mode
    /// with humidity x1, pressure x16, temperature x2 and IIR filter 16.
    pub fn new(i2c: I, address: u8) -> Result<Self, SensorError> {
        let mut sensor = Self {
            i2c,
            address,
            calibration: Calibration::default(),
        };
        let mut id = [0u8; 1];
        sensor.read_registers(REG_CHIP_ID, &mut id)?;
        if id[0] != CHIP_ID {
            return Err(SensorError::ChipId(id[0]));
        }
        let mut tp = [0u8; 26];
        let mut h = [0u8; 7];
        sensor.read_registers(REG_CALIB_TP, &mut tp)?;
        sensor.read_registers(REG_CALIB_H, &mut h)?;
        sensor.calibration = Calibration::parse(&tp, &h);

        sensor.write_register(REG_CTRL_HUM, OVERSAMPLE_X1)?;
        sensor.write_register(REG_CONFIG, FILTER_X16 << 2)?;
        // ctrl_hum only takes effect after ctrl_meas is written
        sensor.write_register(
            REG_CTRL_MEAS,
            (OVERSAMPLE_X2 << 5) | (OVERSAMPLE_X16 << 2) | MODE_NORMAL,
        )?;
        Ok(sensor)
    }

    pub fn measure(&mut self) -> Result<EnvReading, SensorError> {
        let mut raw = [0u8; 8];
        self.read_registers(REG_DATA, &mut raw)?;
        self.calibration.compensate(&raw)
    }

    fn read_registers(&mut self, register: u8, buf: &mut [u8]) -> Result<(), SensorError> {
        self.i2c
            .write_read(self.address, &[register], buf)
            .map_err(|e| SensorError::I2c(format!("{e:?}")))
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<(), SensorError> {
        self.i2c
            .write(self.address, &[register, value])
            .map_err(|e| SensorError::I2c(format!("{e:?}")))
    }
}

/// The Linux driver, shared with blocking tasks so I2C never runs on the runtime.
#[derive(Clone)]
pub struct Bme280Sensor {
    inner: Arc<Mutex<Bme280<I2cdev>>>,
}

impl Bme280Sensor {
    pub async fn open(bus: &Path, address: u8) -> Result<Self, SensorError> {
        let bus = bus.to_path_buf();
        let sensor = task::spawn_blocking(move || {
            let i2c = I2cdev::new(&bus).map_err(|e| SensorError::I2c(e.to_string()))?;
            Bme280::new(i2c, address)
        })
        .await??;
        Ok(Self {
            inner: Arc::new(Mutex::new(sensor)),
        })
    }

    pub async fn read(&self) -> Result<EnvReading, SensorError> {
        let inner = Arc::clone(&self.inner);
        task::spawn_blocking(move || {
            let mut sensor = inner
                .lock()
                .map_err(|_| SensorError::I2c("BME280 driver lock poisoned".into()))?;
            sensor.measure()
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::{ErrorType, Operation};
    use std::convert::Infallible;

    /// Register file behind a fake I2C bus.
    struct FakeBus {
        regs: [u8; 256],
        pointer: usize,
    }

    impl ErrorType for FakeBus {
        type Error = Infallible;
    }

    impl I2c for FakeBus {
        fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Self::Error> {
            assert_eq!(address, PRIMARY_ADDRESS);
            for op in operations {
                match op {
                    Operation::Write(bytes) => {
                        self.pointer = bytes[0] as usize;
                        for (i, b) in bytes[1..].iter().enumerate() {
                            self.regs[self.pointer + i] = *b;
                        }
                    }
                    Operation::Read(buf) => {
                        let n = buf.len();
                        buf.copy_from_slice(&self.regs[self.pointer..self.pointer + n]);
                    }
                }
            }
            Ok(())
        }
    }

    // Calibration words from the Bosch worked example, humidity words made up.
    fn fake_bus() -> FakeBus {
        let mut regs = [0u8; 256];
        regs[REG_CHIP_ID as usize] = CHIP_ID;
        let words: [i32; 12] = [
            27504, 26435, -1000, 36477, -10685, 3024, 2855, 140, -7, 15500, -14600, 6000,
        ];
        for (i, w) in words.iter().enumerate() {
            let at = REG_CALIB_TP as usize + 2 * i;
            regs[at..at + 2].copy_from_slice(&(*w as u16).to_le_bytes());
        }
        regs[0xa1] = 75; // H1
        regs[0xe1..0xe8].copy_from_slice(&[0x6a, 0x01, 0x00, 0x14, 0x24, 0x03, 30]);
        // adc_P = 415148, adc_T = 519888, adc_H = 30000
        regs[0xf7..0xff].copy_from_slice(&[0x65, 0x5a, 0xc0, 0x7e, 0xed, 0x00, 0x75, 0x30]);
        FakeBus { regs, pointer: 0 }
    }

    #[test]
    fn test_calibration_layout() {
        let sensor = Bme280::new(fake_bus(), PRIMARY_ADDRESS).unwrap();
        let c = &sensor.calibration;
        assert_eq!((c.t1, c.t2, c.t3), (27504, 26435, -1000));
        assert_eq!((c.p1, c.p9), (36477, 6000));
        assert_eq!((c.h1, c.h2, c.h3, c.h4, c.h5, c.h6), (75, 362, 0, 324, 50, 30));
    }

    #[test]
    fn test_configuration_written() {
        let sensor = Bme280::new(fake_bus(), PRIMARY_ADDRESS).unwrap();
        assert_eq!(sensor.i2c.regs[REG_CTRL_HUM as usize], 0b001);
        assert_eq!(sensor.i2c.regs[REG_CONFIG as usize], 0b100 << 2);
        assert_eq!(sensor.i2c.regs[REG_CTRL_MEAS as usize], 0b010_101_11);
    }

    #[test]
    fn test_compensation() {
        let mut sensor = Bme280::new(fake_bus(), PRIMARY_ADDRESS).unwrap();
        let reading = sensor.measure().unwrap();
        assert_eq!(reading.temperature, 25.08);
        // 25767233 / 256 Pa
        assert!((reading.pressure - 1006.5325).abs() < 0.001);
        // 52306 / 1024 %
        assert!((reading.humidity - 51.08).abs() < 0.001);
    }

    #[test]
    fn test_wrong_chip() {
        let mut bus = fake_bus();
        bus.regs[REG_CHIP_ID as usize] = 0x58; // a BMP280
        assert!(matches!(
            Bme280::new(bus, PRIMARY_ADDRESS),
            Err(SensorError::ChipId(0x58))
        ));
    }

    #[test]
    fn test_measurement_not_ready() {
        let mut bus = fake_bus();
        bus.regs[0xfa..0xfd].copy_from_slice(&[0x80, 0x00, 0x00]);
        let mut sensor = Bme280::new(bus, PRIMARY_ADDRESS).unwrap();
        assert!(matches!(sensor.measure(), Err(SensorError::NotReady)));
    }
}
