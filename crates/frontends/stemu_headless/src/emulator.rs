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

    emulator.rs

    The headless emulator loop. Stands in for the CPU core: runs the machine a
    scanline at a time and services interrupts the way the OS would.
*/

use std::sync::Arc;

use anyhow::anyhow;

use stemu_core::{
    bus::DeviceEvent,
    circular_buffer::CircularBuffer,
    devices::{
        acia::{AciaId, ACIA_SR_RDRF},
        floppy_drive::DriveId,
    },
    interrupt::InterruptLine,
    machine::{
        Machine,
        ACIA_KEYBOARD_CONTROL,
        ACIA_KEYBOARD_DATA,
        ACIA_MIDI_CONTROL,
        ACIA_MIDI_DATA,
        BOOT_SECTOR_CHECKSUM,
        DMA_ADDRESS_HIGH,
        DMA_ADDRESS_LOW,
        DMA_ADDRESS_MID,
        DMA_DISK_DATA,
        DMA_MODE_STATUS,
    },
};

/// DMA mode for reading the ACSI status register.
const MODE_HDC_STATUS: u16 = 0x008A;

#[derive(Clone, Debug, Default)]
pub struct Stats {
    pub lines: u64,
    pub hbls: u64,
    pub vbls: u64,
    pub keyboard_in: u64,
    pub midi_in: u64,
    pub midi_out: u64,
    pub floppy_transfers: u64,
    pub floppy_errors: u64,
    pub acsi_commands: u64,
}

pub struct Emulator {
    pub machine: Machine,
    midi_output: Option<Arc<CircularBuffer>>,
    stats: Stats,
}

impl Emulator {
    pub fn new(machine: Machine, midi_output: Option<Arc<CircularBuffer>>) -> Self {
        Self {
            machine,
            midi_output,
            stats: Default::default(),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn run_line(&mut self) {
        let cycles = self.machine.glue().cycles_per_line();
        self.machine.run(cycles as u32);
        self.stats.lines += 1;
        self.service_events();
        self.drain_midi_output();
    }

    pub fn run_frame(&mut self) {
        for _ in 0..self.machine.config().video.lines_per_frame() {
            self.run_line();
        }
    }

    pub fn run_frames(&mut self, frames: u32) {
        for _ in 0..frames {
            self.run_frame();
        }
    }

    fn service_events(&mut self) {
        for event in self.machine.take_events() {
            match event {
                DeviceEvent::InterruptUpdate(line, true) => self.service(line),
                DeviceEvent::InterruptUpdate(_, false) => {}
                DeviceEvent::AciaByteSent(id, byte) => {
                    log::trace!("{} ACIA sent {:02X}", id, byte);
                }
                DeviceEvent::FloppyTransferComplete(drive, ok) => {
                    self.stats.floppy_transfers += 1;
                    if !ok {
                        self.stats.floppy_errors += 1;
                        log::warn!("Drive {}: transfer failed", drive);
                    }
                }
                DeviceEvent::AcsiCommandComplete(device, status) => {
                    self.stats.acsi_commands += 1;
                    log::debug!("ACSI {}: command complete, status {:02X}", device, status);
                }
            }
        }
    }

    fn service(&mut self, line: InterruptLine) {
        match line {
            InterruptLine::HBlank => self.stats.hbls += 1,
            InterruptLine::VBlank => self.stats.vbls += 1,
            InterruptLine::Disk => {
                if self.machine.acsi().any_irq() {
                    self.machine.write_u16(DMA_MODE_STATUS, MODE_HDC_STATUS);
                    let status = self.machine.read_u16(DMA_DISK_DATA);
                    log::trace!("ACSI status: {:02X}", status);
                }
            }
            InterruptLine::KeyboardAcia => self.drain_acia(AciaId::Keyboard),
            InterruptLine::MidiAcia => self.drain_acia(AciaId::Midi),
        }
        self.machine.acknowledge(line);
    }

    fn drain_acia(&mut self, id: AciaId) {
        let (control, data) = match id {
            AciaId::Keyboard => (ACIA_KEYBOARD_CONTROL, ACIA_KEYBOARD_DATA),
            AciaId::Midi => (ACIA_MIDI_CONTROL, ACIA_MIDI_DATA),
        };
        while self.machine.read_u8(control) & ACIA_SR_RDRF != 0 {
            let byte = self.machine.read_u8(data);
            log::trace!("{} ACIA received {:02X}", id, byte);
            match id {
                AciaId::Keyboard => self.stats.keyboard_in += 1,
                AciaId::Midi => self.stats.midi_in += 1,
            }
        }
    }

    fn drain_midi_output(&mut self) {
        if let Some(output) = &self.midi_output {
            while output.pop_byte().is_some() {
                self.stats.midi_out += 1;
            }
        }
    }

    /// Load the boot sector of `drive` to `address` through the DMA, as the OS does at startup.
    /// Returns true if the sector is executable.
    pub fn boot_floppy(&mut self, drive: DriveId, address: u32) -> anyhow::Result<bool> {
        let m = &mut self.machine;
        m.write_u8(DMA_ADDRESS_HIGH, (address >> 16) as u8);
        m.write_u8(DMA_ADDRESS_MID, (address >> 8) as u8);
        m.write_u8(DMA_ADDRESS_LOW, address as u8);
        m.write_u16(DMA_MODE_STATUS, 0x0190);
        m.write_u16(DMA_MODE_STATUS, 0x0090);
        m.write_u16(DMA_DISK_DATA, 1);
        m.write_u16(DMA_MODE_STATUS, 0x0080);
        m.floppy_read_sector(drive, 0, 1)?;

        while self.machine.drive(drive).is_busy() {
            self.run_line();
        }

        let start = address as usize;
        let Some(sector) = self.machine.ram().as_slice().get(start..start + 512)
        else {
            return Err(anyhow!(
                "Boot sector at {:06X} does not fit in {} bytes of RAM",
                address,
                self.machine.ram().as_slice().len()
            ));
        };
        let sum = sector
            .chunks(2)
            .fold(0u16, |acc, w| acc.wrapping_add(u16::from_be_bytes([w[0], w[1]])));
        Ok(sum == BOOT_SECTOR_CHECKSUM)
    }

    /// Send TEST UNIT READY to every attached hard disk and report the result.
    pub fn check_acsi_ready(&mut self) -> Vec<(u8, u8)> {
        let devices: Vec<u8> = self
            .machine
            .acsi()
            .devices()
            .filter(|d| d.is_attached())
            .map(|d| d.device_num())
            .collect();

        let mut results = Vec::new();
        for device in devices {
            self.machine.write_u16(DMA_MODE_STATUS, 0x0088);
            self.machine.write_u16(DMA_DISK_DATA, (device as u16) << 5);
            self.machine.write_u16(DMA_MODE_STATUS, MODE_HDC_STATUS);
            for _ in 0..5 {
                self.machine.write_u16(DMA_DISK_DATA, 0);
            }
            let status = self.machine.read_u16(DMA_DISK_DATA) as u8;
            log::info!("ACSI {}: ready, status {:02X}", device, status);
            results.push((device, status));
        }
        self.service_events();
        results
    }
}
