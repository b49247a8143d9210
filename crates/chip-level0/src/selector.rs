//! Platform and device selection filters
//!
//! Each selector is parsed from a string. The empty string, `all` and
//! `default` select everything. Platform and device selectors also accept a
//! decimal index or a case-insensitive substring of the name.

use std::fmt;
use std::str::FromStr;

use chip_ze::DeviceType;

use crate::error::{Error, Result};

fn is_wildcard(s: &str) -> bool {
    s.is_empty() || s.eq_ignore_ascii_case("all") || s.eq_ignore_ascii_case("default")
}

/// Index or name filter shared by platform and device selection
#[derive(Debug, Clone, PartialEq, Eq)]
enum IndexOrName {
    All,
    Index(usize),
    Name(String),
}

impl IndexOrName {
    fn parse(s: &str) -> Self {
        let s = s.trim();
        if is_wildcard(s) {
            Self::All
        } else if let Ok(index) = s.parse::<usize>() {
            Self::Index(index)
        } else {
            Self::Name(s.to_lowercase())
        }
    }

    fn matches(&self, index: usize, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Index(i) => *i == index,
            Self::Name(needle) => name.to_lowercase().contains(needle.as_str()),
        }
    }
}

impl fmt::Display for IndexOrName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Index(i) => write!(f, "{i}"),
            Self::Name(n) => f.write_str(n),
        }
    }
}

/// Platform filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformSelector(IndexOrName);

impl PlatformSelector {
    /// Select every platform
    pub fn all() -> Self {
        Self(IndexOrName::All)
    }

    /// `true` if the platform at `index` named `name` is selected
    pub fn matches(&self, index: usize, name: &str) -> bool {
        self.0.matches(index, name)
    }
}

impl FromStr for PlatformSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(IndexOrName::parse(s)))
    }
}

impl fmt::Display for PlatformSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Device filter; indices count devices that passed the type filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSelector(IndexOrName);

impl DeviceSelector {
    /// Select every device
    pub fn all() -> Self {
        Self(IndexOrName::All)
    }

    /// `true` if the device at `index` named `name` is selected
    pub fn matches(&self, index: usize, name: &str) -> bool {
        self.0.matches(index, name)
    }
}

impl FromStr for DeviceSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(IndexOrName::parse(s)))
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Device type filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTypeSelector {
    /// Any device
    All,
    /// GPUs only
    Gpu,
    /// CPUs only
    Cpu,
    /// FPGAs only
    Fpga,
    /// Memory copy accelerators only
    Mca,
    /// Vision processing units only
    Vpu,
    /// FPGAs, MCAs and VPUs
    Accelerator,
}

impl DeviceTypeSelector {
    /// `true` if a device of type `ty` is selected
    pub fn matches(&self, ty: DeviceType) -> bool {
        match self {
            Self::All => true,
            Self::Gpu => ty == DeviceType::Gpu,
            Self::Cpu => ty == DeviceType::Cpu,
            Self::Fpga => ty == DeviceType::Fpga,
            Self::Mca => ty == DeviceType::Mca,
            Self::Vpu => ty == DeviceType::Vpu,
            Self::Accelerator => {
                matches!(ty, DeviceType::Fpga | DeviceType::Mca | DeviceType::Vpu)
            }
        }
    }
}

impl FromStr for DeviceTypeSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if is_wildcard(s) {
            return Ok(Self::All);
        }
        match s.to_lowercase().as_str() {
            "gpu" => Ok(Self::Gpu),
            "cpu" => Ok(Self::Cpu),
            "fpga" => Ok(Self::Fpga),
            "mca" => Ok(Self::Mca),
            "vpu" => Ok(Self::Vpu),
            "accel" | "accelerator" => Ok(Self::Accelerator),
            _ => Err(Error::invalid_value(format!("unknown device type '{s}'"))),
        }
    }
}

impl fmt::Display for DeviceTypeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::All => "all",
            Self::Gpu => "gpu",
            Self::Cpu => "cpu",
            Self::Fpga => "fpga",
            Self::Mca => "mca",
            Self::Vpu => "vpu",
            Self::Accelerator => "accel",
        })
    }
}
