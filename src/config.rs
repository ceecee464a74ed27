//! EEPROM-backed mount configuration.
//!
//! A fixed 80-byte image: an identifying magic, one block per axis, a
//! global block, then the two serialized acceleration tables. Blocks are
//! packed little-endian with `packed_struct` so the image is identical
//! across targets. Read once at boot; written only by the programming-mode
//! `C` command with both motors forced stopped.

use num_enum::TryFromPrimitive;
use packed_struct::prelude::*;

use crate::accel::{AccelEntry, AccelTable, ACCEL_TABLE_LEN};
use crate::hal::ConfigStore;
use crate::{MAX_SIDEREAL_PERIOD, MIN_SIDEREAL_PERIOD};

/// First bytes of the image. A mismatch keeps the firmware in programming
/// mode until a config utility writes a full image.
pub const MAGIC: [u8; 8] = *b"AstroEQ\0";

const ADDR_MAGIC: usize = 0;
const ADDR_AXIS: [usize; 2] = [8, 24];
const ADDR_GLOBAL: usize = 40;
const ADDR_ACCEL: [usize; 2] = [44, 62];

/// Stepper driver IC family; decides the microstep ceiling and the mode-pin
/// truth table.
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DriverFamily {
    A498x = 0,
    Drv882x = 1,
    Drv8834 = 2,
}

impl DriverFamily {
    pub fn max_microsteps(self) -> u8 {
        match self {
            DriverFamily::A498x => 16,
            DriverFamily::Drv882x | DriverFamily::Drv8834 => 32,
        }
    }
}

#[derive(PackedStruct, Clone, Copy, Debug, PartialEq)]
#[packed_struct(endian = "lsb", size_bytes = "16", bit_numbering = "msb0")]
struct AxisBlock {
    /// Steps per axis revolution (`aVal`).
    #[packed_field(bytes = "0..=3")]
    steps_per_rev: u32,
    /// Timer-count divisor for sidereal (`bVal`).
    #[packed_field(bytes = "4..=7")]
    sidereal_divisor: u32,
    /// Steps per worm revolution (`sVal`).
    #[packed_field(bytes = "8..=11")]
    steps_per_worm_rev: u32,
    /// Sidereal tracking period (`siderealIVal`).
    #[packed_field(bytes = "12..=13")]
    sidereal_period: u16,
    /// Goto cruise period.
    #[packed_field(bytes = "14")]
    goto_period: u8,
    /// Direction sense: nonzero flips the direction pin.
    #[packed_field(bytes = "15")]
    reverse: u8,
}

#[derive(PackedStruct, Clone, Copy, Debug, PartialEq)]
#[packed_struct(endian = "lsb", size_bytes = "4", bit_numbering = "msb0")]
struct GlobalBlock {
    #[packed_field(bytes = "0")]
    driver: u8,
    #[packed_field(bytes = "1")]
    microsteps: u8,
    /// Allow the 8x gear change during fast moves.
    #[packed_field(bytes = "2")]
    gear_change: u8,
    /// Allow the advanced hand-controller probe result to take effect.
    #[packed_field(bytes = "3")]
    advanced_hc: u8,
}

#[derive(PackedStruct, Clone, Copy, Debug, PartialEq)]
#[packed_struct(endian = "lsb", size_bytes = "3", bit_numbering = "msb0")]
struct AccelEntryBlock {
    #[packed_field(bytes = "0..=1")]
    period: u16,
    #[packed_field(bytes = "2")]
    repeats: u8,
}

/// Runtime form of one axis's configuration.
#[derive(Clone, Debug)]
pub struct AxisConfig {
    pub steps_per_rev: u32,
    pub sidereal_divisor: u32,
    pub steps_per_worm_rev: u32,
    pub sidereal_period: u16,
    pub goto_period: u8,
    pub reverse: bool,
    pub accel: AccelTable,
}

impl AxisConfig {
    /// Factory values: a 144:1 worm EQ-class mount at 16 microsteps.
    pub fn defaults() -> Self {
        Self {
            steps_per_rev: 9_024_000,
            sidereal_divisor: 40_000,
            steps_per_worm_rev: 62_667,
            sidereal_period: 191,
            goto_period: 16,
            reverse: false,
            accel: AccelTable::new([
                AccelEntry { period: 720, repeats: 3 },
                AccelEntry { period: 360, repeats: 5 },
                AccelEntry { period: 180, repeats: 7 },
                AccelEntry { period: 90, repeats: 9 },
                AccelEntry { period: 45, repeats: 11 },
                AccelEntry { period: 12, repeats: 14 },
            ]),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MountConfig {
    pub axes: [AxisConfig; 2],
    pub driver: DriverFamily,
    pub microsteps: u8,
    pub gear_change_enabled: bool,
    pub advanced_hc_enabled: bool,
}

impl MountConfig {
    pub fn defaults() -> Self {
        Self {
            axes: [AxisConfig::defaults(), AxisConfig::defaults()],
            driver: DriverFamily::Drv882x,
            microsteps: 16,
            gear_change_enabled: true,
            advanced_hc_enabled: true,
        }
    }

    /// High-speed mode needs headroom to drop to a mode 8x coarser.
    pub fn high_speed_available(&self) -> bool {
        self.gear_change_enabled && self.microsteps >= 8
    }

    /// Range rules enforced before any image is accepted or persisted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.microsteps.is_power_of_two() || self.microsteps > self.driver.max_microsteps() {
            return Err(ConfigError::MicrostepOutOfRange(self.microsteps));
        }
        for axis in &self.axes {
            if !(MIN_SIDEREAL_PERIOD..=MAX_SIDEREAL_PERIOD).contains(&axis.sidereal_period) {
                return Err(ConfigError::SiderealPeriodOutOfRange(axis.sidereal_period));
            }
            if axis.goto_period == 0 {
                return Err(ConfigError::ZeroGotoSpeed);
            }
            if axis.sidereal_divisor == 0 {
                return Err(ConfigError::ZeroDivisor);
            }
            if !axis.accel.is_monotonic() || axis.accel.fastest() == 0 {
                return Err(ConfigError::BadAccelTable);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// No (or foreign) image in the store.
    BadMagic,
    UnknownDriverFamily(u8),
    MicrostepOutOfRange(u8),
    SiderealPeriodOutOfRange(u16),
    ZeroGotoSpeed,
    ZeroDivisor,
    /// Non-monotone table, or a zero fastest period.
    BadAccelTable,
    /// A block failed to (un)pack; only reachable if the image layout and
    /// the code disagree.
    Layout,
}

impl From<packed_struct::PackingError> for ConfigError {
    fn from(_: packed_struct::PackingError) -> Self {
        ConfigError::Layout
    }
}

/// Read and validate the whole image.
pub fn load<E: ConfigStore>(store: &mut E) -> Result<MountConfig, ConfigError> {
    let mut magic = [0u8; 8];
    store.read(ADDR_MAGIC, &mut magic);
    if magic != MAGIC {
        return Err(ConfigError::BadMagic);
    }

    let mut global_raw = [0u8; 4];
    store.read(ADDR_GLOBAL, &mut global_raw);
    let global = GlobalBlock::unpack(&global_raw)?;
    let driver = DriverFamily::try_from(global.driver)
        .map_err(|_| ConfigError::UnknownDriverFamily(global.driver))?;

    let mut axes = [AxisConfig::defaults(), AxisConfig::defaults()];
    for (i, axis) in axes.iter_mut().enumerate() {
        let mut raw = [0u8; 16];
        store.read(ADDR_AXIS[i], &mut raw);
        let block = AxisBlock::unpack(&raw)?;

        let mut entries = [AccelEntry { period: 0, repeats: 0 }; ACCEL_TABLE_LEN];
        for (j, entry) in entries.iter_mut().enumerate() {
            let mut raw = [0u8; 3];
            store.read(ADDR_ACCEL[i] + j * 3, &mut raw);
            let e = AccelEntryBlock::unpack(&raw)?;
            *entry = AccelEntry {
                period: e.period,
                repeats: e.repeats,
            };
        }

        *axis = AxisConfig {
            steps_per_rev: block.steps_per_rev,
            sidereal_divisor: block.sidereal_divisor,
            steps_per_worm_rev: block.steps_per_worm_rev,
            sidereal_period: block.sidereal_period,
            goto_period: block.goto_period,
            reverse: block.reverse != 0,
            accel: AccelTable::new(entries),
        };
    }

    let cfg = MountConfig {
        axes,
        driver,
        microsteps: global.microsteps,
        gear_change_enabled: global.gear_change != 0,
        advanced_hc_enabled: global.advanced_hc != 0,
    };
    cfg.validate()?;
    Ok(cfg)
}

/// Persist the whole image. The magic goes last so a torn write reads back
/// as an absent image rather than a corrupt one.
pub fn save<E: ConfigStore>(store: &mut E, cfg: &MountConfig) -> Result<(), ConfigError> {
    cfg.validate()?;

    for (i, axis) in cfg.axes.iter().enumerate() {
        let block = AxisBlock {
            steps_per_rev: axis.steps_per_rev,
            sidereal_divisor: axis.sidereal_divisor,
            steps_per_worm_rev: axis.steps_per_worm_rev,
            sidereal_period: axis.sidereal_period,
            goto_period: axis.goto_period,
            reverse: u8::from(axis.reverse),
        };
        store.write(ADDR_AXIS[i], &block.pack()?);

        for j in 0..ACCEL_TABLE_LEN {
            let e = axis.accel.entry(j as u8);
            let block = AccelEntryBlock {
                period: e.period,
                repeats: e.repeats,
            };
            store.write(ADDR_ACCEL[i] + j * 3, &block.pack()?);
        }
    }

    let global = GlobalBlock {
        driver: cfg.driver as u8,
        microsteps: cfg.microsteps,
        gear_change: u8::from(cfg.gear_change_enabled),
        advanced_hc: u8::from(cfg.advanced_hc_enabled),
    };
    store.write(ADDR_GLOBAL, &global.pack()?);
    store.write(ADDR_MAGIC, &MAGIC);
    Ok(())
}
