//! BME280 temperature/humidity driver over I2C.
//!
//! Runs in forced mode: each read triggers one conversion with x1
//! oversampling for temperature and humidity (pressure skipped), waits for
//! it to finish, then applies the factory calibration using the datasheet's
//! floating-point compensation formulas.

use anyhow::{bail, ensure, Context, Result};
use std::{thread, time::Duration};

use crate::sensor::{Environment, EnvironmentSensor};

// ── Registers ───────────────────────────────────────────────────────────────

const REG_CHIP_ID: u8 = 0xD0;
const REG_RESET: u8 = 0xE0;
/// calib00..calib25 (dig_T*, dig_P*, dig_H1).
const REG_CALIB_00: u8 = 0x88;
/// calib26..calib32 (dig_H2..dig_H6).
const REG_CALIB_26: u8 = 0xE1;
const REG_CTRL_HUM: u8 = 0xF2;
const REG_STATUS: u8 = 0xF3;
const REG_CTRL_MEAS: u8 = 0xF4;
/// press_msb..hum_lsb burst.
const REG_DATA: u8 = 0xF7;

const CHIP_ID: u8 = 0x60;
const RESET_WORD: u8 = 0xB6;

/// osrs_h = x1.
const CTRL_HUM_X1: u8 = 0b001;
/// osrs_t = x1, osrs_p = skipped, mode = forced.
const CTRL_MEAS_FORCED: u8 = 0b001_000_01;
/// Status bit 3: conversion running.
const STATUS_MEASURING: u8 = 1 << 3;
/// Status bit 0: NVM data being copied after reset.
const STATUS_IM_UPDATE: u8 = 1 << 0;

/// A x1/x1 forced conversion takes ~2.3 ms worst case. We wait 5 ms.
const CONVERSION_WAIT: Duration = Duration::from_millis(5);
const STARTUP_WAIT: Duration = Duration::from_millis(10);

/// Raw values the chip reports for a skipped measurement.
const TEMP_SKIPPED: i32 = 0x80000;
const HUM_SKIPPED: i32 = 0x8000;

pub const DEFAULT_ADDR: u16 = 0x76;

// ── Calibration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
struct Calibration {
    t1: u16,
    t2: i16,
    t3: i16,
    h1: u8,
    h2: i16,
    h3: u8,
    h4: i16,
    h5: i16,
    h6: i8,
}

impl Calibration {
    /// Decode from the two calibration register blocks.
    fn from_registers(calib00: &[u8; 26], calib26: &[u8; 7]) -> Self {
        let u16_le = |b: &[u8], i: usize| u16::from_le_bytes([b[i], b[i + 1]]);
        let i16_le = |b: &[u8], i: usize| i16::from_le_bytes([b[i], b[i + 1]]);

        // dig_H4 = 0xE4[7:0] << 4 | 0xE5[3:0]; dig_H5 = 0xE6[7:0] << 4 | 0xE5[7:4].
        // The MSB registers are signed.
        let e4 = calib26[3] as i8 as i16;
        let e5 = calib26[4] as i16;
        let e6 = calib26[5] as i8 as i16;

        Self {
            t1: u16_le(calib00, 0),
            t2: i16_le(calib00, 2),
            t3: i16_le(calib00, 4),
            h1: calib00[25],
            h2: i16_le(calib26, 0),
            h3: calib26[2],
            h4: (e4 << 4) | (e5 & 0x0F),
            h5: (e6 << 4) | (e5 >> 4),
            h6: calib26[6] as i8,
        }
    }

    /// Returns (°C, t_fine).
    fn compensate_temperature(&self, adc_t: i32) -> (f64, f64) {
        let adc_t = f64::from(adc_t);
        let t1 = f64::from(self.t1);
        let var1 = (adc_t / 16384.0 - t1 / 1024.0) * f64::from(self.t2);
        let d = adc_t / 131072.0 - t1 / 8192.0;
        let var2 = d * d * f64::from(self.t3);
        let t_fine = var1 + var2;
        (t_fine / 5120.0, t_fine)
    }

    /// Relative humidity in percent, clamped to [0, 100].
    fn compensate_humidity(&self, adc_h: i32, t_fine: f64) -> f64 {
        let mut h = t_fine - 76800.0;
        h = (f64::from(adc_h) - (f64::from(self.h4) * 64.0 + f64::from(self.h5) / 16384.0 * h))
            * (f64::from(self.h2) / 65536.0
                * (1.0
                    + f64::from(self.h6) / 67108864.0
                        * h
                        * (1.0 + f64::from(self.h3) / 67108864.0 * h)));
        h *= 1.0 - f64::from(self.h1) * h / 524288.0;
        h.clamp(0.0, 100.0)
    }
}

/// Split the 8-byte data burst into (adc_T, adc_H).
fn raw_samples(data: &[u8; 8]) -> (i32, i32) {
    let adc_t = (i32::from(data[3]) << 12) | (i32::from(data[4]) << 4) | (i32::from(data[5]) >> 4);
    let adc_h = (i32::from(data[6]) << 8) | i32::from(data[7]);
    (adc_t, adc_h)
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// BME280 driver backed by `rppal::i2c`.
pub struct Bme280 {
    i2c: rppal::i2c::I2c,
    calibration: Calibration,
}

impl Bme280 {
    /// Open I2C bus 1, verify the chip at `addr`, and load its calibration.
    pub fn new(addr: u16) -> Result<Self> {
        let mut i2c = rppal::i2c::I2c::new().context("failed to open I2C bus")?;
        i2c.set_slave_address(addr)
            .with_context(|| format!("failed to address BME280 at 0x{addr:02x}"))?;

        let id = i2c.smbus_read_byte(REG_CHIP_ID).context("failed to read BME280 chip id")?;
        ensure!(
            id == CHIP_ID,
            "device at 0x{addr:02x} is not a BME280 (chip id 0x{id:02x}, expected 0x{CHIP_ID:02x})"
        );

        i2c.smbus_write_byte(REG_RESET, RESET_WORD)
            .context("failed to reset BME280")?;
        thread::sleep(STARTUP_WAIT);
        for _ in 0..10 {
            let status = i2c.smbus_read_byte(REG_STATUS)?;
            if status & STATUS_IM_UPDATE == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut calib00 = [0u8; 26];
        i2c.block_read(REG_CALIB_00, &mut calib00)
            .context("failed to read BME280 calibration (0x88)")?;
        let mut calib26 = [0u8; 7];
        i2c.block_read(REG_CALIB_26, &mut calib26)
            .context("failed to read BME280 calibration (0xE1)")?;
        let calibration = Calibration::from_registers(&calib00, &calib26);

        tracing::info!(addr = format_args!("0x{addr:02x}"), "bme280 initialised");

        Ok(Self { i2c, calibration })
    }

    fn measure(&mut self) -> Result<[u8; 8]> {
        // ctrl_hum only takes effect after a write to ctrl_meas.
        self.i2c.smbus_write_byte(REG_CTRL_HUM, CTRL_HUM_X1)?;
        self.i2c.smbus_write_byte(REG_CTRL_MEAS, CTRL_MEAS_FORCED)?;

        thread::sleep(CONVERSION_WAIT);
        for _ in 0..5 {
            let status = self.i2c.smbus_read_byte(REG_STATUS)?;
            if status & STATUS_MEASURING == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut data = [0u8; 8];
        self.i2c.block_read(REG_DATA, &mut data)?;
        Ok(data)
    }
}

impl EnvironmentSensor for Bme280 {
    fn read(&mut self) -> Result<Environment> {
        let data = self.measure().context("bme280 read failed")?;
        let (adc_t, adc_h) = raw_samples(&data);
        if adc_t == TEMP_SKIPPED || adc_h == HUM_SKIPPED {
            bail!("bme280 returned a skipped measurement");
        }

        let (temperature, t_fine) = self.calibration.compensate_temperature(adc_t);
        let humidity = self.calibration.compensate_humidity(adc_h, t_fine);
        Ok(Environment {
            temperature,
            humidity,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
