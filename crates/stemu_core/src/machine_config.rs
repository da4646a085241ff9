/*
    StEmu

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    machine_config.rs

    Machine configuration, deserialized from TOML.
*/

use std::path::PathBuf;

use serde_derive::Deserialize;
use thiserror::Error;

use crate::{clock::CPU_HZ_REFERENCE, machine_types::VideoMode};

pub const MAX_FLOPPY_DRIVES: usize = 2;
pub const MAX_ACSI_DEVICES: u8 = 8;

const fn _default_true() -> bool {
    true
}
const fn _default_cpu_hz() -> u32 {
    CPU_HZ_REFERENCE
}
const fn _default_ram_kb() -> u32 {
    1024
}
const fn _default_midi_buffer_size() -> usize {
    8192
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Bad value for {0}")]
    BadValue(String),
    #[error("failed to parse machine configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Disk timing switches shared by the floppy drives and the ACSI bus.
#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct DiskTiming {
    /// Model real rotation speed on the floppy drives instead of the fast approximation.
    #[serde(default)]
    pub accurate_floppy: bool,
    /// Complete hard disk transfers without the per-block delay.
    #[serde(default = "_default_true")]
    pub instant_sector_access: bool,
    #[serde(default)]
    pub advanced_timing: bool,
}

impl Default for DiskTiming {
    fn default() -> Self {
        Self {
            accurate_floppy: false,
            instant_sector_access: true,
            advanced_timing: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct FloppyConfigEntry {
    pub drive: usize,
    pub path:  PathBuf,
    #[serde(default)]
    pub write_protect: bool,
    #[serde(default)]
    pub ghost: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AcsiConfigEntry {
    pub device: u8,
    pub path:   PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MachineConfig {
    #[serde(default = "_default_cpu_hz")]
    pub cpu_hz: u32,
    #[serde(default)]
    pub video: VideoMode,
    #[serde(default = "_default_ram_kb")]
    pub ram_kb: u32,
    #[serde(default)]
    pub disk_timing: DiskTiming,
    #[serde(default)]
    pub floppy: Vec<FloppyConfigEntry>,
    #[serde(default)]
    pub acsi: Vec<AcsiConfigEntry>,
    #[serde(default = "_default_midi_buffer_size")]
    pub midi_buffer_size: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            cpu_hz: _default_cpu_hz(),
            video: VideoMode::default(),
            ram_kb: _default_ram_kb(),
            disk_timing: DiskTiming::default(),
            floppy: Vec::new(),
            acsi: Vec::new(),
            midi_buffer_size: _default_midi_buffer_size(),
        }
    }
}

impl MachineConfig {
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: MachineConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpu_hz == 0 {
            return Err(ConfigError::BadValue("cpu_hz".to_string()));
        }
        if self.ram_kb == 0 || self.ram_kb > 14 * 1024 {
            return Err(ConfigError::BadValue("ram_kb".to_string()));
        }
        if self.midi_buffer_size < 2 {
            return Err(ConfigError::BadValue("midi_buffer_size".to_string()));
        }
        if self.floppy.iter().any(|f| f.drive >= MAX_FLOPPY_DRIVES) {
            return Err(ConfigError::BadValue("floppy.drive".to_string()));
        }
        if self.acsi.iter().any(|a| a.device >= MAX_ACSI_DEVICES) {
            return Err(ConfigError::BadValue("acsi.device".to_string()));
        }
        Ok(())
    }

    pub fn ram_bytes(&self) -> usize {
        self.ram_kb as usize * 1024
    }
}
