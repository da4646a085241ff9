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

    machine.rs

    The machine context. Owns the clock, the agenda and every peripheral chip,
    exposes the register map to the CPU core and dispatches agenda events.
*/

use std::{collections::VecDeque, io::ErrorKind, path::Path};

use anyhow::Context;
use strum::IntoEnumIterator;
use thiserror::Error;

use crate::{
    agenda::{Agenda, AgendaEntry, AgendaEvent},
    bus::{DeviceEvent, DmaMemory, Ram, ADDRESS_MASK},
    circular_buffer::CircularBufferError,
    clock::{Clock, ClockValue},
    device_types::{
        disk::{DiskError, DiskGeometry, ImageStream, RawSectorImage, SectorImage},
        ghost::GhostDisk,
    },
    devices::{
        acia::{Acia, AciaId},
        acsi::{AcsiBus, AcsiError, AcsiResponse, ACSI_PHASE_IDLE},
        dma::{AddressByte, Dma},
        floppy_drive::{DriveId, DriveOperation, EjectedDisk, FloppyDrive, StepDirection},
        glue::Glue,
    },
    interrupt::{InterruptLine, InterruptPins},
    machine_config::{ConfigError, DiskTiming, MachineConfig},
    machine_types::VideoMode,
    port::{BufferedPort, NullPort, SerialPort},
};

pub const ACIA_KEYBOARD_CONTROL: u32 = 0xFF_FC00;
pub const ACIA_KEYBOARD_DATA: u32 = 0xFF_FC02;
pub const ACIA_MIDI_CONTROL: u32 = 0xFF_FC04;
pub const ACIA_MIDI_DATA: u32 = 0xFF_FC06;

pub const DMA_DISK_DATA: u32 = 0xFF_8604;
pub const DMA_MODE_STATUS: u32 = 0xFF_8606;
pub const DMA_ADDRESS_HIGH: u32 = 0xFF_8609;
pub const DMA_ADDRESS_MID: u32 = 0xFF_860B;
pub const DMA_ADDRESS_LOW: u32 = 0xFF_860D;

pub const SHIFTER_SYNC_MODE: u32 = 0xFF_820A;
pub const SHIFTER_RESOLUTION: u32 = 0xFF_8260;
/// Sync mode bit 1 selects 50Hz.
pub const SYNC_50HZ: u8 = 0x02;
pub const RESOLUTION_HIGH: u8 = 0x02;

/// Controller status bits left in the disk data register by a failed floppy transfer.
pub const FDC_SR_LOST_DATA: u16 = 0x04;
pub const FDC_SR_RECORD_NOT_FOUND: u16 = 0x10;
pub const FDC_SR_WRITE_PROTECT: u16 = 0x40;

/// Sum of the big-endian words of an executable boot sector.
pub const BOOT_SECTOR_CHECKSUM: u16 = 0x1234;

const OPEN_BUS: u8 = 0xFF;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Disk(#[from] DiskError),
    #[error(transparent)]
    Acsi(#[from] AcsiError),
    #[error(transparent)]
    Buffer(#[from] CircularBufferError),
    #[error("drive {0} is not connected to the disk controller")]
    DriveNotConnected(DriveId),
    #[error("drive {0} is busy")]
    DriveBusy(DriveId),
}

/// Properties read from a floppy image in the inspection slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FloppyInspection {
    pub name: String,
    pub geometry: DiskGeometry,
    pub single_sided: bool,
    pub bootable: bool,
}

pub struct Machine {
    config: MachineConfig,
    clock: Clock,
    agenda: Agenda,
    timing: DiskTiming,

    acias: [Acia; 2],
    ports: [Box<dyn SerialPort>; 2],

    dma: Dma,
    ram: Ram,
    drives: [FloppyDrive; DriveId::COUNT],
    floppy_irq: bool,
    fdc_register: u16,
    acsi: AcsiBus,
    glue: Glue,
    sync_mode: u8,
    resolution: u8,

    pins: InterruptPins,
    events: VecDeque<DeviceEvent>,
}

impl Machine {
    pub fn new(
        config: MachineConfig,
        keyboard_port: Box<dyn SerialPort>,
        midi_port: Box<dyn SerialPort>,
    ) -> Result<Self, MachineError> {
        config.validate()?;
        let cpu_hz = config.cpu_hz;
        let accurate = config.disk_timing.accurate_floppy;

        let (sync_mode, resolution) = video_registers(config.video);
        let mut machine = Machine {
            clock: Clock::new(cpu_hz),
            agenda: Agenda::new(),
            timing: config.disk_timing,
            acias: [Acia::new(AciaId::Keyboard, cpu_hz), Acia::new(AciaId::Midi, cpu_hz)],
            ports: [keyboard_port, midi_port],
            dma: Dma::new(),
            ram: Ram::new(config.ram_bytes()),
            drives: [
                FloppyDrive::new(DriveId::A, cpu_hz, accurate),
                FloppyDrive::new(DriveId::B, cpu_hz, accurate),
                FloppyDrive::new(DriveId::Inspect, cpu_hz, accurate),
            ],
            floppy_irq: false,
            fdc_register: 0,
            acsi: AcsiBus::new(),
            glue: Glue::new(config.video, cpu_hz),
            sync_mode,
            resolution,
            pins: InterruptPins::default(),
            events: VecDeque::new(),
            config,
        };
        log::debug!(
            "Machine: {} Hz, {:?} video, {} KB RAM",
            cpu_hz,
            machine.config.video,
            machine.config.ram_kb
        );
        machine.start();
        Ok(machine)
    }

    /// Cold reset. Every chip returns to its power-on state and the agenda is emptied;
    /// mounted media stays where it is.
    pub fn reset(&mut self) {
        log::debug!("Machine: cold reset");
        self.agenda.clear();
        self.clock.cold_reset();
        for acia in self.acias.iter_mut() {
            acia.reset(&mut self.agenda);
        }
        self.dma.reset();
        for drive in self.drives.iter_mut() {
            drive.reset(&mut self.agenda);
        }
        self.floppy_irq = false;
        self.fdc_register = 0;
        self.acsi.reset();
        self.glue.reset(&mut self.agenda);
        (self.sync_mode, self.resolution) = video_registers(self.config.video);
        self.glue.set_mode(self.config.video, &mut self.agenda, self.clock.now());
        self.timing = self.config.disk_timing;
        self.pins.clear();
        self.events.clear();
        self.start();
    }

    fn start(&mut self) {
        let now = self.clock.now();
        self.glue.start(&mut self.agenda, now);
        for id in AciaId::iter() {
            self.schedule_rx_poll(id, now);
        }
    }

    fn schedule_rx_poll(&mut self, id: AciaId, now: ClockValue) {
        if self.ports[id.index()].is_connected() {
            let delay = self.acias[id.index()].transmission_time();
            self.agenda.schedule(AgendaEvent::AciaRxPoll(id), now, delay, 0);
        }
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn now(&self) -> ClockValue {
        self.clock.now()
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn agenda(&self) -> &Agenda {
        &self.agenda
    }

    pub fn disk_timing(&self) -> DiskTiming {
        self.timing
    }

    pub fn acia(&self, id: AciaId) -> &Acia {
        &self.acias[id.index()]
    }

    pub fn port(&self, id: AciaId) -> &dyn SerialPort {
        self.ports[id.index()].as_ref()
    }

    /// Replace the transport behind an ACIA.
    pub fn set_port(&mut self, id: AciaId, port: Box<dyn SerialPort>) {
        log::debug!("Machine: {} ACIA attached to port {}", id, port.name());
        self.ports[id.index()] = port;
        self.agenda.cancel(AgendaEvent::AciaRxPoll(id));
        let now = self.clock.now();
        self.schedule_rx_poll(id, now);
    }

    pub fn dma(&self) -> &Dma {
        &self.dma
    }

    pub fn ram(&self) -> &Ram {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut Ram {
        &mut self.ram
    }

    pub fn drive(&self, id: DriveId) -> &FloppyDrive {
        &self.drives[id.index()]
    }

    pub fn acsi(&self) -> &AcsiBus {
        &self.acsi
    }

    pub fn glue(&self) -> &Glue {
        &self.glue
    }

    pub fn pins(&self) -> &InterruptPins {
        &self.pins
    }

    /// Level of the MFP input both ACIAs are wired to.
    pub fn acia_irq(&self) -> bool {
        self.pins.acia()
    }

    /// Drain the events raised since the last call.
    pub fn take_events(&mut self) -> Vec<DeviceEvent> {
        self.events.drain(..).collect()
    }

    fn set_pin(&mut self, line: InterruptLine, level: bool) {
        if self.pins.set(line, level) {
            log::trace!("Machine: interrupt {} -> {}", line, level);
            self.events.push_back(DeviceEvent::InterruptUpdate(line, level));
        }
    }

    /// Bring every pin in line with the state of the chip driving it.
    fn refresh_pins(&mut self) {
        let levels = [
            (InterruptLine::KeyboardAcia, self.acias[AciaId::Keyboard.index()].irq()),
            (InterruptLine::MidiAcia, self.acias[AciaId::Midi.index()].irq()),
            (InterruptLine::Disk, self.floppy_irq || self.acsi.any_irq()),
            (InterruptLine::HBlank, self.glue.hbl_pending()),
            (InterruptLine::VBlank, self.glue.vbl_pending()),
        ];
        for (line, level) in levels {
            self.set_pin(line, level);
        }
    }

    /// The CPU has taken an interrupt. Edge-triggered sources clear their pending flag;
    /// the ACIA lines follow chip state and only drop once the chip is serviced.
    pub fn acknowledge(&mut self, line: InterruptLine) {
        match line {
            InterruptLine::HBlank => self.glue.acknowledge_hbl(),
            InterruptLine::VBlank => self.glue.acknowledge_vbl(),
            InterruptLine::Disk => self.floppy_irq = false,
            InterruptLine::KeyboardAcia | InterruptLine::MidiAcia => {}
        }
        self.refresh_pins();
    }

    /// Advance the clock by `cycles`, firing every agenda entry that falls due on the way.
    /// Returns the number of entries fired.
    pub fn run(&mut self, cycles: u32) -> usize {
        let target = self.clock.now() + cycles as i64;
        self.run_until(target)
    }

    pub fn run_until(&mut self, target: ClockValue) -> usize {
        let mut fired = 0;
        while let Some(entry) = self.agenda.pop_due(target) {
            if self.clock.now().is_at_or_before(entry.fire_time) {
                self.clock.set(entry.fire_time);
            }
            log::trace!("Machine: firing {} at {}", entry.event, entry.fire_time);
            self.fire(entry);
            fired += 1;
        }
        self.clock.set(target);
        fired
    }

    fn fire(&mut self, entry: AgendaEntry) {
        let now = entry.fire_time;
        match entry.event {
            AgendaEvent::AciaTdrLoad(id) => {
                self.acias[id.index()].transmit_tdr(&mut self.agenda, now);
            }
            AgendaEvent::AciaTxComplete(id) => {
                let byte = self.acias[id.index()].tx_complete(&mut self.agenda, now);
                self.ports[id.index()].output_byte(byte);
                self.events.push_back(DeviceEvent::AciaByteSent(id, byte));
            }
            AgendaEvent::AciaRxPoll(id) => {
                let idx = id.index();
                self.acias[idx].poll_port(self.ports[idx].as_mut(), &mut self.agenda, now);
                self.schedule_rx_poll(id, now);
            }
            AgendaEvent::AciaRxComplete(id) => {
                self.acias[id.index()].rx_complete();
            }
            AgendaEvent::FloppyIndexPulse(id) => {
                self.drives[id.index()].index_pulse(&mut self.agenda, now);
            }
            AgendaEvent::FloppyTransfer(id) => self.floppy_transfer(id, now),
            AgendaEvent::AcsiComplete(device) => {
                if let Ok(dev) = self.acsi.device_mut(device) {
                    dev.complete_transfer();
                    let status = dev.status();
                    self.events.push_back(DeviceEvent::AcsiCommandComplete(device, status));
                }
            }
            AgendaEvent::HBlank => {
                self.glue.hblank(&mut self.agenda, now);
            }
            AgendaEvent::VBlank => {
                self.glue.vblank(&mut self.agenda, now);
            }
        }
        self.refresh_pins();
    }

    pub fn read_u8(&mut self, address: u32) -> u8 {
        let address = address & ADDRESS_MASK;
        match address {
            ACIA_KEYBOARD_CONTROL => self.acias[AciaId::Keyboard.index()].status(),
            ACIA_MIDI_CONTROL => self.acias[AciaId::Midi.index()].status(),
            ACIA_KEYBOARD_DATA | ACIA_MIDI_DATA => {
                let id = if address == ACIA_KEYBOARD_DATA { AciaId::Keyboard } else { AciaId::Midi };
                let byte = self.acias[id.index()].read_data();
                self.refresh_pins();
                byte
            }
            DMA_DISK_DATA => (self.read_disk_data() >> 8) as u8,
            0xFF_8605 => self.read_disk_data() as u8,
            DMA_MODE_STATUS => 0,
            0xFF_8607 => self.dma.status(),
            DMA_ADDRESS_HIGH => self.dma.read_address_byte(AddressByte::High),
            DMA_ADDRESS_MID => self.dma.read_address_byte(AddressByte::Mid),
            DMA_ADDRESS_LOW => self.dma.read_address_byte(AddressByte::Low),
            SHIFTER_SYNC_MODE => self.sync_mode,
            SHIFTER_RESOLUTION => self.resolution,
            _ => self.ram.read_u8(address).unwrap_or(OPEN_BUS),
        }
    }

    pub fn read_u16(&mut self, address: u32) -> u16 {
        match address & ADDRESS_MASK & !1 {
            DMA_DISK_DATA => self.read_disk_data(),
            DMA_MODE_STATUS => self.dma.status() as u16,
            a => u16::from_be_bytes([self.read_u8(a), self.read_u8(a + 1)]),
        }
    }

    pub fn write_u8(&mut self, address: u32, value: u8) {
        let address = address & ADDRESS_MASK;
        let now = self.clock.now();
        match address {
            ACIA_KEYBOARD_CONTROL | ACIA_MIDI_CONTROL => {
                let id = if address == ACIA_KEYBOARD_CONTROL { AciaId::Keyboard } else { AciaId::Midi };
                self.acias[id.index()].write_control(value, &mut self.agenda);
                self.refresh_pins();
            }
            ACIA_KEYBOARD_DATA | ACIA_MIDI_DATA => {
                let id = if address == ACIA_KEYBOARD_DATA { AciaId::Keyboard } else { AciaId::Midi };
                self.acias[id.index()].write_data(value, &mut self.agenda, now);
                self.refresh_pins();
            }
            DMA_DISK_DATA => {}
            0xFF_8605 => self.write_disk_data(value as u16),
            DMA_MODE_STATUS => {
                let mode = self.dma.mode_value();
                self.dma.write_mode((value as u16) << 8 | (mode & 0x00FF));
            }
            0xFF_8607 => {
                let mode = self.dma.mode_value();
                self.dma.write_mode((mode & 0xFF00) | value as u16);
            }
            DMA_ADDRESS_HIGH => self.dma.write_address_byte(AddressByte::High, value),
            DMA_ADDRESS_MID => self.dma.write_address_byte(AddressByte::Mid, value),
            DMA_ADDRESS_LOW => self.dma.write_address_byte(AddressByte::Low, value),
            SHIFTER_SYNC_MODE => {
                self.sync_mode = value & SYNC_50HZ;
                self.update_video_mode();
            }
            SHIFTER_RESOLUTION => {
                self.resolution = value & 0x03;
                self.update_video_mode();
            }
            _ => match self.ram.as_mut_slice().get_mut(address as usize) {
                Some(byte) => *byte = value,
                None => log::trace!("Machine: write to unmapped address {:06X}: {:02X}", address, value),
            },
        }
    }

    pub fn write_u16(&mut self, address: u32, value: u16) {
        match address & ADDRESS_MASK & !1 {
            DMA_DISK_DATA => self.write_disk_data(value),
            DMA_MODE_STATUS => self.dma.write_mode(value),
            a => {
                let [hi, lo] = value.to_be_bytes();
                self.write_u8(a, hi);
                self.write_u8(a + 1, lo);
            }
        }
    }

    fn update_video_mode(&mut self) {
        let mode = if self.resolution == RESOLUTION_HIGH {
            VideoMode::Mono
        }
        else if self.sync_mode & SYNC_50HZ != 0 {
            VideoMode::Pal
        }
        else {
            VideoMode::Ntsc
        };
        let now = self.clock.now();
        self.glue.set_mode(mode, &mut self.agenda, now);
    }

    fn read_disk_data(&mut self) -> u16 {
        let mode = self.dma.mode();
        if mode.count_select() {
            return self.dma.sector_count();
        }
        if mode.hdc_select() {
            let (device, status) = self.acsi.read(self.dma.mode_value() as u8);
            log::trace!("Machine: ACSI {} status read: {:02X}", device, status);
            self.refresh_pins();
            return status as u16;
        }
        self.fdc_register
    }

    fn write_disk_data(&mut self, value: u16) {
        let mode = self.dma.mode();
        if mode.count_select() {
            self.dma.write_sector_count(value);
            return;
        }
        if !mode.hdc_select() {
            log::trace!(
                "Machine: FDC register {} write: {:02X}",
                (mode.a1() as u8) << 1 | mode.a0() as u8,
                value
            );
            self.fdc_register = value;
            return;
        }

        let (device, response) = self.acsi.write(
            mode.a0(),
            value as u8,
            &mut self.dma,
            &mut self.ram,
            &mut self.timing,
        );
        let now = self.clock.now();
        match response {
            AcsiResponse::None => {}
            AcsiResponse::Irq => {
                if let Some(dev) = self.acsi.device(device) {
                    if dev.phase() == ACSI_PHASE_IDLE {
                        self.events
                            .push_back(DeviceEvent::AcsiCommandComplete(device, dev.status()));
                    }
                }
            }
            AcsiResponse::DeferredIrq(reference_cycles) => {
                let delay = self.clock.scale_reference(reference_cycles);
                log::debug!("Machine: ACSI {} completes in {} cycles", device, delay);
                self.agenda.schedule(AgendaEvent::AcsiComplete(device), now, delay, 0);
            }
        }
        self.refresh_pins();
    }

    fn wired_drive(&self, drive: DriveId) -> Result<usize, MachineError> {
        match drive {
            DriveId::A | DriveId::B => Ok(drive.index()),
            DriveId::Inspect => Err(MachineError::DriveNotConnected(drive)),
        }
    }

    /// Insert a disk, returning whatever was in the drive before.
    pub fn insert_floppy(
        &mut self,
        drive: DriveId,
        image: Box<dyn SectorImage>,
        ghost: Option<GhostDisk>,
    ) -> Result<Option<EjectedDisk>, MachineError> {
        let idx = self.wired_drive(drive)?;
        let previous = self.drives[idx].eject(&mut self.agenda);
        self.drives[idx].insert(image, ghost);
        Ok(previous)
    }

    /// Open a raw image and insert it. With `ghost` set, writes are kept in an overlay
    /// loaded from (and later saved to) the image path with an `.stg` extension.
    pub fn insert_floppy_file<P: AsRef<Path>>(
        &mut self,
        drive: DriveId,
        path: P,
        write_protect: bool,
        ghost: bool,
    ) -> anyhow::Result<()> {
        let path = path.as_ref();
        // A ghosted disk is never written directly.
        let image = RawSectorImage::open(path, write_protect || ghost)?;
        let ghost_disk = if ghost {
            let ghost_path = path.with_extension("stg");
            match GhostDisk::load_file(&ghost_path) {
                Ok(ghost_disk) => Some(ghost_disk),
                Err(e) if is_not_found(&e) => Some(GhostDisk::new()),
                Err(e) => return Err(e),
            }
        }
        else {
            None
        };
        self.insert_floppy(drive, Box::new(image), ghost_disk)
            .with_context(|| format!("Failed to insert {} into drive {}", path.display(), drive))?;
        Ok(())
    }

    pub fn eject_floppy(&mut self, drive: DriveId) -> Option<EjectedDisk> {
        let ejected = self.drives[drive.index()].eject(&mut self.agenda);
        self.refresh_pins();
        ejected
    }

    /// Read disk properties through the inspection slot. The image is handed back so it can
    /// be inserted into a real drive.
    pub fn inspect_floppy(
        &mut self,
        image: Box<dyn SectorImage>,
    ) -> Result<(FloppyInspection, Box<dyn SectorImage>), MachineError> {
        let now = self.clock.now();
        let name = image.name().to_string();
        let drive = &mut self.drives[DriveId::Inspect.index()];
        drive.eject(&mut self.agenda);
        drive.insert(image, None);

        // Nothing between insert and eject may return early; the image goes back to the caller.
        let bootable = match boot_sector_checksum(drive, now) {
            Ok(sum) => sum == BOOT_SECTOR_CHECKSUM,
            Err(e) => {
                log::warn!("Machine: could not read boot sector of {}: {}", name, e);
                false
            }
        };

        let inspection = FloppyInspection {
            name,
            geometry: drive.geometry().unwrap_or_default(),
            single_sided: drive.single_sided(),
            bootable,
        };
        let ejected = drive.eject(&mut self.agenda).ok_or(DiskError::NoDisk)?;
        Ok((inspection, ejected.image))
    }

    pub fn attach_hard_disk(
        &mut self,
        device: u8,
        name: &str,
        stream: Box<dyn ImageStream>,
    ) -> Result<(), MachineError> {
        self.acsi.device_mut(device)?.attach(name, stream)?;
        Ok(())
    }

    pub fn attach_hard_disk_file<P: AsRef<Path>>(&mut self, device: u8, path: P) -> anyhow::Result<()> {
        self.acsi.device_mut(device)?.attach_file(path)
    }

    pub fn detach_hard_disk(&mut self, device: u8) -> Result<(), MachineError> {
        self.agenda.cancel(AgendaEvent::AcsiComplete(device));
        if !self.acsi.device_mut(device)?.detach() {
            return Err(AcsiError::NoImage(device).into());
        }
        self.refresh_pins();
        Ok(())
    }

    pub fn floppy_motor(&mut self, drive: DriveId, on: bool) -> Result<(), MachineError> {
        let idx = self.wired_drive(drive)?;
        let now = self.clock.now();
        self.drives[idx].set_motor(on, &mut self.agenda, now);
        Ok(())
    }

    /// Step the head. Returns the settle time before the drive will accept a transfer.
    pub fn floppy_step(&mut self, drive: DriveId, direction: StepDirection) -> Result<i64, MachineError> {
        let idx = self.wired_drive(drive)?;
        Ok(self.drives[idx].step(direction))
    }

    pub fn floppy_byte_position(&self, drive: DriveId) -> u32 {
        self.drives[drive.index()].byte_position(self.clock.now())
    }

    pub fn floppy_hbls_per_rotation(&self, drive: DriveId) -> u32 {
        self.drives[drive.index()].hbls_per_rotation(self.glue.hbls_per_second())
    }

    /// Start moving a sector from the disk to memory through the DMA. The disk interrupt is
    /// raised once the last byte has been delivered.
    pub fn floppy_read_sector(&mut self, drive: DriveId, side: u8, sector: u8) -> Result<(), MachineError> {
        let idx = self.prepare_transfer(drive)?;
        let now = self.clock.now();
        if let Err(e) = self.drives[idx].read(side, sector, now) {
            self.fdc_register = fdc_status_for(&e);
            return Err(e.into());
        }
        self.fdc_register = 0;
        self.schedule_floppy_transfer(drive, now);
        Ok(())
    }

    /// Start moving a sector from memory to the disk through the DMA.
    pub fn floppy_write_sector(&mut self, drive: DriveId, side: u8, sector: u8) -> Result<(), MachineError> {
        let idx = self.prepare_transfer(drive)?;
        let now = self.clock.now();
        if let Err(e) = self.drives[idx].write(side, sector, now) {
            self.fdc_register = fdc_status_for(&e);
            return Err(e.into());
        }
        self.fdc_register = 0;
        self.schedule_floppy_transfer(drive, now);
        Ok(())
    }

    fn prepare_transfer(&mut self, drive: DriveId) -> Result<usize, MachineError> {
        let idx = self.wired_drive(drive)?;
        if self.drives[idx].is_busy() {
            return Err(MachineError::DriveBusy(drive));
        }
        if !self.drives[idx].motor_on() {
            // The controller spins the motor up on its own.
            let now = self.clock.now();
            self.drives[idx].set_motor(true, &mut self.agenda, now);
        }
        Ok(idx)
    }

    fn schedule_floppy_transfer(&mut self, drive: DriveId, now: ClockValue) {
        let cycles_per_byte = self.drives[drive.index()].cycles_per_byte();
        self.agenda
            .schedule(AgendaEvent::FloppyTransfer(drive), now, cycles_per_byte, 0);
    }

    fn floppy_transfer(&mut self, id: DriveId, now: ClockValue) {
        let drive = &mut self.drives[id.index()];
        match drive.operation() {
            DriveOperation::Reading => {
                if let Some(mut byte) = drive.next_read_byte() {
                    self.dma.drq(&mut byte, &mut self.ram);
                }
            }
            DriveOperation::Writing => {
                let mut byte = 0;
                self.dma.drq(&mut byte, &mut self.ram);
                drive.push_write_byte(byte);
            }
            DriveOperation::Idle => return,
        }

        if !drive.transfer_done() {
            let cycles_per_byte = drive.cycles_per_byte();
            self.agenda
                .schedule(AgendaEvent::FloppyTransfer(id), now, cycles_per_byte, 0);
            return;
        }

        let ok = match drive.finish_transfer(now) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Drive {}: transfer failed: {}", id, e);
                self.fdc_register = fdc_status_for(&e);
                self.dma.set_error();
                false
            }
        };
        self.floppy_irq = true;
        self.events.push_back(DeviceEvent::FloppyTransferComplete(id, ok));
    }
}

fn video_registers(mode: VideoMode) -> (u8, u8) {
    match mode {
        VideoMode::Pal => (SYNC_50HZ, 0),
        VideoMode::Ntsc => (0, 0),
        VideoMode::Mono => (SYNC_50HZ, RESOLUTION_HIGH),
    }
}

fn fdc_status_for(e: &DiskError) -> u16 {
    match e {
        DiskError::WriteProtected => FDC_SR_WRITE_PROTECT,
        DiskError::Io(_) => FDC_SR_LOST_DATA,
        DiskError::NoDisk | DiskError::SectorNotFound(_) | DiskError::BadImageSize(_) => FDC_SR_RECORD_NOT_FOUND,
    }
}

/// Read sector 1 of side 0 and sum it as big-endian words.
fn boot_sector_checksum(drive: &mut FloppyDrive, now: ClockValue) -> Result<u16, DiskError> {
    drive.read(0, 1, now)?;
    let mut sum: u16 = 0;
    let mut high = None;
    while let Some(byte) = drive.next_read_byte() {
        match high.take() {
            Some(h) => sum = sum.wrapping_add(u16::from_be_bytes([h, byte])),
            None => high = Some(byte),
        }
    }
    drive.finish_transfer(now)?;
    Ok(sum)
}

fn is_not_found(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == ErrorKind::NotFound)
    })
}

#[derive(Default)]
pub struct MachineBuilder {
    config: MachineConfig,
    keyboard_port: Option<Box<dyn SerialPort>>,
    midi_port: Option<Box<dyn SerialPort>>,
    skip_media: bool,
}

impl MachineBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_machine_config(mut self, config: &MachineConfig) -> Self {
        self.config = config.clone();
        self
    }

    pub fn with_keyboard_port(mut self, port: Box<dyn SerialPort>) -> Self {
        self.keyboard_port = Some(port);
        self
    }

    pub fn with_midi_port(mut self, port: Box<dyn SerialPort>) -> Self {
        self.midi_port = Some(port);
        self
    }

    /// Don't open the media listed in the configuration.
    pub fn without_media(mut self) -> Self {
        self.skip_media = true;
        self
    }

    pub fn build(self) -> anyhow::Result<Machine> {
        let keyboard_port = self.keyboard_port.unwrap_or_else(|| Box::new(NullPort));
        let midi_port = match self.midi_port {
            Some(port) => port,
            None => Box::new(BufferedPort::new("midi", self.config.midi_buffer_size)?),
        };
        let mut machine = Machine::new(self.config, keyboard_port, midi_port)?;
        if self.skip_media {
            return Ok(machine);
        }

        let floppies = machine.config.floppy.clone();
        for entry in floppies {
            let drive = DriveId::from_index(entry.drive)
                .ok_or_else(|| ConfigError::BadValue("floppy.drive".to_string()))?;
            machine.insert_floppy_file(drive, &entry.path, entry.write_protect, entry.ghost)?;
        }
        let hard_disks = machine.config.acsi.clone();
        for entry in hard_disks {
            machine
                .attach_hard_disk_file(entry.device, &entry.path)
                .with_context(|| format!("Failed to attach ACSI device {}", entry.device))?;
        }
        Ok(machine)
    }
}
