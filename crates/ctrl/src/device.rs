use anyhow::bail;
use std::fmt;
use std::str::FromStr;

/// One of the four mains-switched devices in the enclosure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    HeatMat,
    Pump,
    Fan,
    Light,
}

impl Device {
    /// Every device, in the order used for status comments.
    pub const ALL: [Device; 4] = [Device::HeatMat, Device::Pump, Device::Fan, Device::Light];

    /// Identifier stored in the `device_states` table.
    pub fn as_str(self) -> &'static str {
        match self {
            Device::HeatMat => "heat-mat",
            Device::Pump => "pump",
            Device::Fan => "fan",
            Device::Light => "light",
        }
    }

    /// Human-readable name used in reading comments.
    pub fn label(self) -> &'static str {
        match self {
            Device::HeatMat => "Heat Mat",
            Device::Pump => "Pump",
            Device::Fan => "Fan",
            Device::Light => "Light",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "heat-mat" => Ok(Device::HeatMat),
            "pump" => Ok(Device::Pump),
            "fan" => Ok(Device::Fan),
            "light" => Ok(Device::Light),
            other => bail!("unknown device '{other}'"),
        }
    }
}

/// "On" / "Off", as shown in reading comments.
pub fn on_off(on: bool) -> &'static str {
    if on {
        "On"
    } else {
        "Off"
    }
}

// ===========================================================================
// Tests
// ===========================================================================
