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

    A headless StEmu frontend. Builds a machine from the configuration file and
    command line, runs it for a number of frames and reports what the peripherals did.
*/

#![forbid(unsafe_code)]

mod emulator;
mod midi_feed;

use std::{sync::Arc, time::Instant};

use stemu_core::{
    circular_buffer::CircularBuffer,
    device_types::disk::RawSectorImage,
    devices::{acia::AciaId, floppy_drive::DriveId},
    machine::MachineBuilder,
    port::{BufferedPort, LoopbackPort, SerialPort},
};
use strum::IntoEnumIterator;

use crate::{emulator::Emulator, midi_feed::MidiFeeder};

/// Boot sectors are loaded here, clear of the system variables.
const BOOT_ADDRESS: u32 = 0x0001_0000;

pub fn run() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match stemu_config::read_config_file("./stemu.toml") {
        Ok(config) => config,
        Err(e) => match e.downcast_ref::<std::io::Error>() {
            Some(e) => {
                eprintln!("IO error reading configuration file:\n{}", e);
                std::process::exit(1);
            }
            None => {
                eprintln!("Failed to resolve configuration:\n{:#}", e);
                std::process::exit(1);
            }
        },
    };

    // Resolve the MIDI port. A buffered port exposes its rings so a feeder thread can
    // play a file into the machine and we can count what comes back out.
    let mut midi_input: Option<Arc<CircularBuffer>> = None;
    let mut midi_output: Option<Arc<CircularBuffer>> = None;
    let midi_port: Box<dyn SerialPort> = if config.emulator.midi_loopback {
        match LoopbackPort::new(config.machine.midi_buffer_size) {
            Ok(port) => Box::new(port),
            Err(e) => {
                log::error!("Failed to create MIDI loopback: {}", e);
                std::process::exit(1);
            }
        }
    }
    else {
        match BufferedPort::new("midi", config.machine.midi_buffer_size) {
            Ok(port) => {
                midi_input = Some(port.input_handle());
                midi_output = Some(port.output_handle());
                Box::new(port)
            }
            Err(e) => {
                log::error!("Failed to create MIDI port: {}", e);
                std::process::exit(1);
            }
        }
    };

    let machine = MachineBuilder::new()
        .with_machine_config(&config.machine)
        .with_midi_port(midi_port)
        .build()
        .unwrap_or_else(|e| {
            log::error!("Failed to build machine: {:#}", e);
            std::process::exit(1);
        });

    let mut emu = Emulator::new(machine, midi_output);

    for entry in &config.machine.floppy {
        let inspection = RawSectorImage::open(&entry.path, true)
            .and_then(|image| Ok(emu.machine.inspect_floppy(Box::new(image))?));
        match inspection {
            Ok((info, _)) => log::info!(
                "Floppy {}: {} sides, {} tracks, {} sectors/track, bootable: {}",
                info.name,
                if info.single_sided { 1 } else { 2 },
                info.geometry.tracks,
                info.geometry.sectors_per_track,
                info.bootable
            ),
            Err(e) => log::warn!("Couldn't inspect {}: {:#}", entry.path.display(), e),
        }
    }

    if !emu.machine.drive(DriveId::A).is_empty() {
        match emu.boot_floppy(DriveId::A, BOOT_ADDRESS) {
            Ok(true) => log::info!("Drive A: boot sector is executable"),
            Ok(false) => log::info!("Drive A: boot sector is not executable"),
            Err(e) => log::error!("Drive A: boot sector read failed: {:#}", e),
        }
    }
    emu.check_acsi_ready();

    let feeder = match (&config.emulator.midi_feed, &midi_input) {
        (Some(path), Some(input)) => match std::fs::read(path) {
            Ok(data) => {
                log::info!("Feeding {} bytes of MIDI from {}", data.len(), path.display());
                Some(MidiFeeder::start(input.clone(), data))
            }
            Err(e) => {
                log::error!("Couldn't read MIDI feed {}: {}", path.display(), e);
                None
            }
        },
        (Some(_), None) => {
            log::warn!("MIDI feed ignored: the MIDI port is in loopback");
            None
        }
        _ => None,
    };

    let start = Instant::now();
    emu.run_frames(config.emulator.frames);
    let elapsed = start.elapsed();

    let fed = match feeder {
        Some(feeder) => {
            if !feeder.is_finished() {
                log::debug!("MIDI feed still running, stopping it");
            }
            feeder.stop()
        }
        None => 0,
    };

    if config.emulator.save_ghosts {
        for entry in config.machine.floppy.iter().filter(|e| e.ghost) {
            let Some(drive) = DriveId::from_index(entry.drive)
            else {
                continue;
            };
            let Some(mut ejected) = emu.machine.eject_floppy(drive)
            else {
                continue;
            };
            if let Some(ghost) = ejected.ghost.as_mut().filter(|g| g.is_dirty()) {
                let ghost_path = entry.path.with_extension("stg");
                match ghost.save_file(&ghost_path) {
                    Ok(()) => log::info!("Saved {} modified sectors to {}", ghost.len(), ghost_path.display()),
                    Err(e) => log::error!("Failed to save {}: {:#}", ghost_path.display(), e),
                }
            }
        }
    }

    let stats = emu.stats();
    log::info!(
        "Ran {} frames, {} lines ({} cycles) in {:.2?}: {} HBL, {} VBL",
        emu.machine.glue().frame(),
        stats.lines,
        emu.machine.now().raw(),
        elapsed,
        stats.hbls,
        stats.vbls
    );
    log::info!(
        "Disk: {} floppy transfers ({} failed), {} ACSI commands",
        stats.floppy_transfers,
        stats.floppy_errors,
        stats.acsi_commands
    );
    for id in AciaId::iter() {
        let acia = emu.machine.acia(id);
        log::info!(
            "{} ACIA: {} sent, {} received, {} overruns",
            id,
            acia.bytes_sent(),
            acia.bytes_received(),
            acia.overruns()
        );
    }
    log::info!(
        "Serial: {} keyboard bytes serviced; MIDI {} bytes fed, {} serviced, {} bytes out",
        stats.keyboard_in,
        fed,
        stats.midi_in,
        stats.midi_out
    );
}
