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

    lib.rs

    Reads the emulator configuration from a TOML file and overlays command
    line arguments on top of it.
*/

mod bpaf_config;
pub mod mount;

use std::path::{Path, PathBuf};

use serde_derive::Deserialize;

pub use bpaf_config::{cli_args, CmdLineArgs};
use mount::{MountSpec, MountableDeviceType};
use stemu_core::machine_config::{AcsiConfigEntry, FloppyConfigEntry, MachineConfig};

const fn _default_true() -> bool {
    true
}
const fn _default_frames() -> u32 {
    50
}

#[derive(Debug, Deserialize)]
pub struct Emulator {
    /// Frames to run before exiting.
    #[serde(default = "_default_frames")]
    pub frames: u32,
    /// Connect the MIDI ACIA's output back to its input.
    #[serde(default)]
    pub midi_loopback: bool,
    /// A file streamed into the MIDI input from a separate thread.
    pub midi_feed: Option<PathBuf>,
    /// Write ghost overlays back to their .stg files at exit.
    #[serde(default = "_default_true")]
    pub save_ghosts: bool,
}

impl Default for Emulator {
    fn default() -> Self {
        Self {
            frames: _default_frames(),
            midi_loopback: false,
            midi_feed: None,
            save_ghosts: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfigFileParams {
    #[serde(default)]
    pub emulator: Emulator,
    #[serde(default)]
    pub machine: MachineConfig,
}

impl ConfigFileParams {
    pub fn overlay(&mut self, shell_args: CmdLineArgs) {
        if let Some(frames) = shell_args.frames {
            self.emulator.frames = frames;
        }
        if let Some(video) = shell_args.video {
            self.machine.video = video;
        }
        if let Some(cpu_hz) = shell_args.cpu_hz {
            self.machine.cpu_hz = cpu_hz;
        }
        if let Some(midi_feed) = shell_args.midi_feed {
            self.emulator.midi_feed = Some(midi_feed);
        }

        self.machine.disk_timing.accurate_floppy |= shell_args.accurate_floppy;
        self.machine.disk_timing.advanced_timing |= shell_args.advanced_timing;
        self.emulator.midi_loopback |= shell_args.midi_loopback;

        for mount in shell_args.mounts {
            self.apply_mount(mount);
        }
    }

    /// A mount given on the command line replaces any entry for the same unit.
    fn apply_mount(&mut self, mount: MountSpec) {
        match mount.device {
            MountableDeviceType::Floppy => {
                let entry = FloppyConfigEntry {
                    drive: mount.index,
                    write_protect: mount.flag("wp"),
                    ghost: mount.flag("ghost"),
                    path: mount.path,
                };
                self.machine.floppy.retain(|f| f.drive != entry.drive);
                self.machine.floppy.push(entry);
            }
            MountableDeviceType::HardDisk => {
                let entry = AcsiConfigEntry {
                    device: mount.index.min(u8::MAX as usize) as u8,
                    path:   mount.path,
                };
                self.machine.acsi.retain(|a| a.device != entry.device);
                self.machine.acsi.push(entry);
            }
        }
    }
}

pub fn read_config(toml_string: impl AsRef<str>, shell_args: CmdLineArgs) -> Result<ConfigFileParams, anyhow::Error> {
    let mut toml_args: ConfigFileParams = toml::from_str(toml_string.as_ref())?;

    // Command line arguments override config file arguments
    toml_args.overlay(shell_args);
    toml_args.machine.validate()?;

    Ok(toml_args)
}

/// Read the TOML configuration from a file path, parse and overlay command line arguments.
/// A missing configuration file is not an error; defaults are used instead.
pub fn read_config_file<P>(default_path: P) -> Result<ConfigFileParams, anyhow::Error>
where
    P: AsRef<Path>,
{
    log::debug!("Reading command line arguments...");
    let shell_args = cli_args().run();

    let config_path = shell_args
        .config_file
        .clone()
        .unwrap_or_else(|| default_path.as_ref().to_path_buf());

    let toml_string = match std::fs::read_to_string(&config_path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && shell_args.config_file.is_none() => {
            log::warn!("No configuration file at {}, using defaults", config_path.display());
            String::new()
        }
        Err(e) => {
            return Err(anyhow::Error::new(e).context(format!("Failed to read {}", config_path.display())));
        }
    };

    read_config(toml_string, shell_args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stemu_core::machine_types::VideoMode;

    const CONFIG: &str = r#"
[emulator]
frames = 10

[machine]
video = "Ntsc"
ram_kb = 4096

[machine.disk_timing]
instant_sector_access = false

[[machine.floppy]]
drive = 0
path = "boot.st"

[[machine.acsi]]
device = 0
path = "hd0.img"
"#;

    #[test]
    fn test_file_values() {
        let config = read_config(CONFIG, CmdLineArgs::default()).unwrap();
        assert_eq!(config.emulator.frames, 10);
        assert!(config.emulator.save_ghosts);
        assert_eq!(config.machine.video, VideoMode::Ntsc);
        assert_eq!(config.machine.ram_kb, 4096);
        assert!(!config.machine.disk_timing.instant_sector_access);
        assert_eq!(config.machine.floppy.len(), 1);
        assert_eq!(config.machine.acsi[0].path, PathBuf::from("hd0.img"));
    }

    #[test]
    fn test_command_line_overrides() {
        let args = CmdLineArgs {
            frames: Some(3),
            video: Some(VideoMode::Mono),
            accurate_floppy: true,
            mounts: vec![
                "fd:0:other.st?wp".parse().unwrap(),
                "fd:1:second.st?ghost".parse().unwrap(),
                "hd:4:hd4.img".parse().unwrap(),
            ],
            ..Default::default()
        };
        let config = read_config(CONFIG, args).unwrap();
        assert_eq!(config.emulator.frames, 3);
        assert_eq!(config.machine.video, VideoMode::Mono);
        assert!(config.machine.disk_timing.accurate_floppy);

        let floppy = &config.machine.floppy;
        assert_eq!(floppy.len(), 2);
        let a = floppy.iter().find(|f| f.drive == 0).unwrap();
        assert_eq!(a.path, PathBuf::from("other.st"));
        assert!(a.write_protect);
        assert!(floppy.iter().find(|f| f.drive == 1).unwrap().ghost);
        assert_eq!(config.machine.acsi.len(), 2);
    }

    #[test]
    fn test_invalid_mount_rejected() {
        let args = CmdLineArgs {
            mounts: vec!["fd:2:third.st".parse().unwrap()],
            ..Default::default()
        };
        assert!(read_config("", args).is_err());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = read_config("", CmdLineArgs::default()).unwrap();
        assert_eq!(config.emulator.frames, 50);
        assert_eq!(config.machine.cpu_hz, 8_000_000);
    }
}
