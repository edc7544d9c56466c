//! Relay control via GPIO. The `gpio` feature gates the real rppal driver;
//! without it, a mock implementation keeps state in memory and logs changes.

use anyhow::{bail, Context, Result};
use std::collections::{HashMap, HashSet};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

use crate::device::Device;

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: std::ops::RangeInclusive<u8> = 2..=27;

pub const DEFAULT_RELAY_PINS: &str = "heat-mat=17,pump=22,fan=23,light=27";

// ---------------------------------------------------------------------------
// Pin map parsing
// ---------------------------------------------------------------------------

/// Parse the `RELAY_PINS` environment variable into a device -> pin map.
///
/// Format: comma-separated `device=pin` pairs, e.g.
/// `"heat-mat=17,pump=22,fan=23,light=27"`. Every device must be listed
/// exactly once and pins must be unique.
pub fn parse_relay_pins(env_val: &str) -> Result<Vec<(Device, u8)>> {
    let input = if env_val.trim().is_empty() {
        DEFAULT_RELAY_PINS
    } else {
        env_val
    };

    let mut pins: Vec<(Device, u8)> = Vec::new();
    let mut seen_pins: HashSet<u8> = HashSet::new();

    for token in input.split(',') {
        let (name, pin) = token
            .split_once('=')
            .with_context(|| format!("invalid entry in RELAY_PINS: {token:?} (use device=pin)"))?;
        let device: Device = name.parse()?;
        let pin: u8 = pin
            .trim()
            .parse()
            .with_context(|| format!("invalid pin for {device} in RELAY_PINS: {pin:?}"))?;

        if !VALID_GPIO_PINS.contains(&pin) {
            bail!("{device}: gpio {pin} is not a valid BCM GPIO pin (allowed: 2-27)");
        }
        if pins.iter().any(|(d, _)| *d == device) {
            bail!("{device} listed more than once in RELAY_PINS");
        }
        if !seen_pins.insert(pin) {
            bail!("{device}: gpio {pin} is already used by another device");
        }
        pins.push((device, pin));
    }

    for device in Device::ALL {
        if !pins.iter().any(|(d, _)| *d == device) {
            bail!("RELAY_PINS has no pin for {device}");
        }
    }

    Ok(pins)
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (production — requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct RelayBoard {
    pins: HashMap<Device, OutputPin>,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl RelayBoard {
    pub fn new(device_to_gpio: &[(Device, u8)], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new().context("failed to open GPIO")?;
        let mut pins = HashMap::new();

        for (device, pin_num) in device_to_gpio {
            let mut pin = gpio
                .get(*pin_num)
                .with_context(|| format!("failed to claim gpio {pin_num} for {device}"))?
                .into_output();

            // Fail-safe: ensure "OFF" at startup
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }

            pins.insert(*device, pin);
        }

        tracing::info!(active_low, "relay board initialised");
        Ok(Self { pins, active_low })
    }

    pub fn set(&mut self, device: Device, on: bool) {
        if let Some(pin) = self.pins.get_mut(&device) {
            // active-low relay: LOW = ON, HIGH = OFF
            if on != self.active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }
            tracing::info!(%device, on, "relay set");
        } else {
            tracing::warn!(%device, "no relay configured");
        }
    }

    /// Last state applied to the relay.
    pub fn is_on(&self, device: Device) -> bool {
        self.pins
            .get(&device)
            .is_some_and(|pin| pin.is_set_high() != self.active_low)
    }

    pub fn all_off(&mut self) {
        for device in Device::ALL {
            self.set(device, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (development — no hardware, state kept in memory)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct RelayBoard {
    relays: HashMap<Device, bool>,
}

#[cfg(not(feature = "gpio"))]
impl RelayBoard {
    pub fn new(device_to_gpio: &[(Device, u8)], _active_low: bool) -> Result<Self> {
        let mut relays = HashMap::new();
        for (device, pin_num) in device_to_gpio {
            tracing::debug!(%device, gpio = pin_num, "[mock-gpio] registered relay (not wired)");
            relays.insert(*device, false);
        }
        tracing::info!("[mock-gpio] relay board initialised (no hardware)");
        Ok(Self { relays })
    }

    pub fn set(&mut self, device: Device, on: bool) {
        if let Some(state) = self.relays.get_mut(&device) {
            *state = on;
            tracing::info!(%device, on, "[mock-gpio] relay set");
        } else {
            tracing::warn!(%device, "[mock-gpio] no relay configured");
        }
    }

    /// Last state applied to the relay.
    pub fn is_on(&self, device: Device) -> bool {
        self.relays.get(&device).copied().unwrap_or(false)
    }

    pub fn all_off(&mut self) {
        for device in Device::ALL {
            self.set(device, false);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
