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

    devices::floppy_drive.rs

    Implements a 3.5" floppy drive: rotation timing, index pulses, head
    stepping and sector transfers against a mounted image.
*/

use strum_macros::{Display, EnumIter};

use crate::{
    agenda::{Agenda, AgendaEvent},
    clock::ClockValue,
    device_types::{
        disk::{DiskError, DiskGeometry, SectorId, SectorImage, DD_TRACK_BYTES},
        ghost::GhostDisk,
    },
};

pub const DRIVE_RPM: u32 = 300;
pub const DRIVE_FAST_CYCLES_PER_BYTE: i64 = 4;
pub const DRIVE_FAST_IP_MULTIPLIER: i64 = 8;
pub const DRIVE_MAX_CYL: u8 = 83;
pub const DRIVE_STEP_SETTLE_US: i64 = 3000;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum DriveId {
    A,
    B,
    /// Scratch slot used to read disk properties before an image is inserted for real.
    Inspect,
}

impl DriveId {
    pub const COUNT: usize = 3;

    pub fn index(&self) -> usize {
        match self {
            DriveId::A => 0,
            DriveId::B => 1,
            DriveId::Inspect => 2,
        }
    }

    pub fn from_index(idx: usize) -> Option<DriveId> {
        match idx {
            0 => Some(DriveId::A),
            1 => Some(DriveId::B),
            2 => Some(DriveId::Inspect),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StepDirection {
    /// Toward the spindle (higher track numbers).
    In,
    Out,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DriveOperation {
    #[default]
    Idle,
    Reading,
    Writing,
}

/// A sector moving between the disk and the DMA controller.
pub struct SectorTransfer {
    pub id: SectorId,
    pub data: Vec<u8>,
    pub position: usize,
    pub start_byte: u32,
}

/// What comes out of a drive when its disk is ejected.
pub struct EjectedDisk {
    pub image: Box<dyn SectorImage>,
    pub ghost: Option<GhostDisk>,
}

pub struct FloppyDrive {
    id: DriveId,
    cpu_hz: u32,
    accurate: bool,

    track: u8,
    motor_on: bool,
    operation: DriveOperation,
    transfer: Option<SectorTransfer>,

    time_of_next_ip: ClockValue,
    time_of_last_ip: ClockValue,
    cycles_per_byte: i64,
    current_byte: u32,

    disk: Option<Box<dyn SectorImage>>,
    single_sided: bool,
    ghost: Option<GhostDisk>,

    index_pulses: u64,
}

impl FloppyDrive {
    pub fn new(id: DriveId, cpu_hz: u32, accurate: bool) -> Self {
        let mut drive = Self {
            id,
            cpu_hz,
            accurate,
            track: 0,
            motor_on: false,
            operation: DriveOperation::Idle,
            transfer: None,
            time_of_next_ip: ClockValue::default(),
            time_of_last_ip: ClockValue::default(),
            cycles_per_byte: DRIVE_FAST_CYCLES_PER_BYTE,
            current_byte: 0,
            disk: None,
            single_sided: false,
            ghost: None,
            index_pulses: 0,
        };
        drive.update_cycles_per_byte();
        drive
    }

    /// Stop the motor and abandon any transfer. The disk stays in the drive.
    pub fn reset(&mut self, agenda: &mut Agenda) {
        agenda.cancel(AgendaEvent::FloppyIndexPulse(self.id));
        agenda.cancel(AgendaEvent::FloppyTransfer(self.id));
        self.motor_on = false;
        self.operation = DriveOperation::Idle;
        self.transfer = None;
        self.track = 0;
        self.current_byte = 0;
        self.update_cycles_per_byte();
    }

    pub fn id(&self) -> DriveId {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.disk.is_none()
    }

    pub fn track(&self) -> u8 {
        self.track
    }

    pub fn motor_on(&self) -> bool {
        self.motor_on
    }

    pub fn operation(&self) -> DriveOperation {
        self.operation
    }

    pub fn is_busy(&self) -> bool {
        self.operation != DriveOperation::Idle
    }

    pub fn single_sided(&self) -> bool {
        self.single_sided
    }

    pub fn index_pulses(&self) -> u64 {
        self.index_pulses
    }

    pub fn time_of_last_ip(&self) -> ClockValue {
        self.time_of_last_ip
    }

    pub fn time_of_next_ip(&self) -> ClockValue {
        self.time_of_next_ip
    }

    pub fn geometry(&self) -> Option<DiskGeometry> {
        self.disk.as_ref().map(|d| d.geometry())
    }

    pub fn ghost(&self) -> Option<&GhostDisk> {
        self.ghost.as_ref()
    }

    pub fn ghost_mut(&mut self) -> Option<&mut GhostDisk> {
        self.ghost.as_mut()
    }

    pub fn has_override(&self, id: SectorId) -> bool {
        self.ghost.as_ref().is_some_and(|g| g.has_override(id))
    }

    pub fn insert(&mut self, image: Box<dyn SectorImage>, ghost: Option<GhostDisk>) {
        let geometry = image.geometry();
        log::debug!("Drive {}: inserted {} {}", self.id, image.name(), geometry);
        self.single_sided = geometry.sides < 2;
        self.disk = Some(image);
        self.ghost = ghost;
        self.update_cycles_per_byte();
    }

    pub fn eject(&mut self, agenda: &mut Agenda) -> Option<EjectedDisk> {
        let image = self.disk.take()?;
        log::debug!("Drive {}: ejected {}", self.id, image.name());
        agenda.cancel(AgendaEvent::FloppyIndexPulse(self.id));
        agenda.cancel(AgendaEvent::FloppyTransfer(self.id));
        self.operation = DriveOperation::Idle;
        self.transfer = None;
        self.single_sided = false;
        self.update_cycles_per_byte();
        Some(EjectedDisk {
            image,
            ghost: self.ghost.take(),
        })
    }

    pub fn track_bytes(&self) -> u32 {
        self.disk
            .as_ref()
            .map(|d| d.geometry().track_bytes)
            .unwrap_or(DD_TRACK_BYTES)
            .max(1)
    }

    pub fn cycles_per_byte(&self) -> i64 {
        self.cycles_per_byte
    }

    pub fn set_accurate(&mut self, accurate: bool) {
        self.accurate = accurate;
        self.update_cycles_per_byte();
    }

    pub fn update_cycles_per_byte(&mut self) {
        self.cycles_per_byte = if self.accurate {
            let rotations_per_second = (DRIVE_RPM / 60) as i64;
            (self.cpu_hz as i64 / rotations_per_second / self.track_bytes() as i64).max(1)
        }
        else {
            DRIVE_FAST_CYCLES_PER_BYTE
        };
    }

    /// Cycles between index pulses.
    pub fn rotation_cycles(&self) -> i64 {
        let cycles = self.cycles_per_byte * self.track_bytes() as i64;
        if self.accurate {
            cycles
        }
        else {
            cycles * DRIVE_FAST_IP_MULTIPLIER
        }
    }

    /// Byte offset under the head, from time since the last index pulse.
    pub fn byte_position(&self, now: ClockValue) -> u32 {
        let elapsed = now.diff(self.time_of_last_ip);
        if elapsed < 0 {
            return 0;
        }
        ((elapsed / self.cycles_per_byte) as u64 % self.track_bytes() as u64) as u32
    }

    pub fn hbls_per_rotation(&self, hbls_per_second: u32) -> u32 {
        (hbls_per_second / (DRIVE_RPM / 60)).max(1)
    }

    pub fn hbls_to_bytes(&self, hbls: u32, hbls_per_second: u32) -> u32 {
        (self.track_bytes() as u64 * hbls as u64 / self.hbls_per_rotation(hbls_per_second) as u64) as u32
    }

    pub fn bytes_to_hbls(&self, bytes: u32, hbls_per_second: u32) -> u32 {
        (self.hbls_per_rotation(hbls_per_second) as u64 * bytes as u64 / self.track_bytes() as u64) as u32
    }

    /// Start of a revolution. Returns false if the drive is not spinning with a disk in it,
    /// in which case no further pulse is scheduled until the motor starts again.
    pub fn index_pulse(&mut self, agenda: &mut Agenda, now: ClockValue) -> bool {
        if self.is_empty() || !self.motor_on {
            return false;
        }
        self.time_of_last_ip = now;
        self.time_of_next_ip = now + self.rotation_cycles();
        agenda.schedule_at(AgendaEvent::FloppyIndexPulse(self.id), self.time_of_next_ip, 0);
        if self.operation == DriveOperation::Idle {
            self.current_byte = 0;
        }
        self.index_pulses += 1;
        log::trace!("Drive {}: index pulse at {}", self.id, now);
        true
    }

    pub fn set_motor(&mut self, on: bool, agenda: &mut Agenda, now: ClockValue) {
        if on == self.motor_on {
            return;
        }
        self.motor_on = on;
        if !on {
            self.current_byte = self.byte_position(now);
            agenda.cancel(AgendaEvent::FloppyIndexPulse(self.id));
            log::debug!("Drive {}: motor off at byte {}", self.id, self.current_byte);
            return;
        }

        // Resume rotation from where the disk stopped.
        let position = self.current_byte.min(self.track_bytes() - 1) as i64;
        self.time_of_last_ip = now + -(position * self.cycles_per_byte);
        self.time_of_next_ip = now + (self.track_bytes() as i64 - position) * self.cycles_per_byte;
        if !self.is_empty() {
            agenda.schedule_at(AgendaEvent::FloppyIndexPulse(self.id), self.time_of_next_ip, 0);
        }
        log::debug!("Drive {}: motor on, next index pulse at {}", self.id, self.time_of_next_ip);
    }

    /// Move the head one track. Returns the settle time the caller must wait before the next
    /// read or write.
    pub fn step(&mut self, direction: StepDirection) -> i64 {
        match direction {
            StepDirection::In if self.track < DRIVE_MAX_CYL => self.track += 1,
            StepDirection::Out if self.track > 0 => self.track -= 1,
            _ => {}
        }
        self.update_cycles_per_byte();
        log::trace!("Drive {}: step {:?} to track {}", self.id, direction, self.track);
        DRIVE_STEP_SETTLE_US * self.cpu_hz as i64 / 1_000_000
    }

    fn sector_id(&self, side: u8, sector: u8) -> SectorId {
        SectorId::new(side, self.track, sector)
    }

    /// Latch a sector from the disk (or its ghost overlay) for transfer to memory.
    pub fn read(&mut self, side: u8, sector: u8, now: ClockValue) -> Result<(), DiskError> {
        let id = self.sector_id(side, sector);
        let disk = self.disk.as_mut().ok_or(DiskError::NoDisk)?;
        let size = disk.sector_size(id).ok_or(DiskError::SectorNotFound(id))?;

        let mut data = vec![0u8; size];
        let from_ghost = self.ghost.as_ref().is_some_and(|g| g.read_sector(id, &mut data));
        if !from_ghost {
            disk.read_sector(id, &mut data)?;
        }
        log::debug!("Drive {}: read sector {} (ghost: {})", self.id, id, from_ghost);
        self.begin_transfer(DriveOperation::Reading, id, data, now);
        Ok(())
    }

    /// Prepare to receive a sector from memory. Committed when the last byte arrives.
    pub fn write(&mut self, side: u8, sector: u8, now: ClockValue) -> Result<(), DiskError> {
        let id = self.sector_id(side, sector);
        let disk = self.disk.as_ref().ok_or(DiskError::NoDisk)?;
        if disk.is_write_protected() && self.ghost.is_none() {
            return Err(DiskError::WriteProtected);
        }
        let size = disk.sector_size(id).ok_or(DiskError::SectorNotFound(id))?;
        log::debug!("Drive {}: write sector {}", self.id, id);
        self.begin_transfer(DriveOperation::Writing, id, vec![0u8; size], now);
        Ok(())
    }

    fn begin_transfer(&mut self, operation: DriveOperation, id: SectorId, data: Vec<u8>, now: ClockValue) {
        self.current_byte = self.byte_position(now);
        self.operation = operation;
        self.transfer = Some(SectorTransfer {
            id,
            data,
            position: 0,
            start_byte: self.current_byte,
        });
    }

    /// Next byte of a read in progress.
    pub fn next_read_byte(&mut self) -> Option<u8> {
        if self.operation != DriveOperation::Reading {
            return None;
        }
        let transfer = self.transfer.as_mut()?;
        let byte = *transfer.data.get(transfer.position)?;
        transfer.position += 1;
        Some(byte)
    }

    /// Store the next byte of a write in progress.
    pub fn push_write_byte(&mut self, byte: u8) -> bool {
        if self.operation != DriveOperation::Writing {
            return false;
        }
        match self.transfer.as_mut() {
            Some(transfer) if transfer.position < transfer.data.len() => {
                transfer.data[transfer.position] = byte;
                transfer.position += 1;
                true
            }
            _ => false,
        }
    }

    pub fn transfer_done(&self) -> bool {
        self.transfer
            .as_ref()
            .map_or(true, |t| t.position >= t.data.len())
    }

    /// Close out the current transfer. Writes are committed to the ghost overlay when the
    /// image is write protected, otherwise to the image itself.
    pub fn finish_transfer(&mut self, now: ClockValue) -> Result<(), DiskError> {
        let operation = std::mem::take(&mut self.operation);
        let transfer = self.transfer.take();
        self.current_byte = self.byte_position(now);

        let transfer = match (operation, transfer) {
            (DriveOperation::Writing, Some(transfer)) => transfer,
            _ => return Ok(()),
        };
        let disk = self.disk.as_mut().ok_or(DiskError::NoDisk)?;
        match self.ghost.as_mut() {
            Some(ghost) if disk.is_write_protected() => ghost.write_sector(transfer.id, &transfer.data),
            _ => disk.write_sector(transfer.id, &transfer.data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::CPU_HZ_REFERENCE,
        device_types::disk::{RawSectorImage, DEFAULT_SECTOR_SIZE},
    };

    const T0: ClockValue = ClockValue::new(10_000);

    fn image(write_protected: bool) -> Box<dyn SectorImage> {
        let geometry = DiskGeometry::new(2, 80, 9);
        let bytes = (0..geometry.image_size() as usize)
            .map(|i| (i / DEFAULT_SECTOR_SIZE) as u8)
            .collect();
        Box::new(RawSectorImage::from_bytes("TEST.ST", bytes, write_protected).unwrap())
    }

    fn spinning_drive(cpu_hz: u32, agenda: &mut Agenda) -> FloppyDrive {
        let mut drive = FloppyDrive::new(DriveId::A, cpu_hz, true);
        drive.insert(image(false), None);
        drive.set_motor(true, agenda, T0);
        assert!(drive.index_pulse(agenda, T0));
        drive
    }

    #[test]
    fn test_cycles_per_byte() {
        let mut drive = FloppyDrive::new(DriveId::A, CPU_HZ_REFERENCE, true);
        // 8MHz / 5 rotations per second / 6250 bytes per track.
        assert_eq!(drive.cycles_per_byte(), 256);
        drive.set_accurate(false);
        assert_eq!(drive.cycles_per_byte(), DRIVE_FAST_CYCLES_PER_BYTE);
        assert_eq!(drive.rotation_cycles(), 4 * 6250 * 8);
    }

    #[test]
    fn test_hbl_conversions() {
        // PAL: 8MHz / 512 cycles per line.
        let hbls_per_second = 15625;
        let mut drive = FloppyDrive::new(DriveId::A, CPU_HZ_REFERENCE, true);
        drive.insert(image(false), None);
        assert_eq!(drive.track_bytes(), 6250);

        assert_eq!(drive.hbls_per_rotation(hbls_per_second), 3125);
        assert_eq!(drive.hbls_to_bytes(3125, hbls_per_second), 6250);
        assert_eq!(drive.bytes_to_hbls(6250, hbls_per_second), 3125);
        assert_eq!(drive.hbls_to_bytes(1, hbls_per_second), 2);
        for hbls in [0, 1, 100, 1562, 3124] {
            let bytes = drive.hbls_to_bytes(hbls, hbls_per_second);
            assert_eq!(drive.bytes_to_hbls(bytes, hbls_per_second), hbls);
        }

        // NTSC lines are shorter, so more of them fit in a rotation.
        assert_eq!(drive.hbls_per_rotation(15748), 3149);
    }

    #[test]
    fn test_byte_position_is_elapsed_over_cpb_mod_track() {
        for cpu_hz in [CPU_HZ_REFERENCE, 16_000_000, 32_000_000] {
            let mut agenda = Agenda::new();
            let drive = spinning_drive(cpu_hz, &mut agenda);
            let c = drive.cycles_per_byte();
            for e in [0i64, 1, c - 1, c, 5 * c + 3, 6249 * c, 6250 * c, 6250 * c + 7 * c, 123_456_789] {
                assert_eq!(drive.byte_position(T0 + e) as i64, (e / c) % 6250, "cpu_hz {} E {}", cpu_hz, e);
            }
        }
    }

    #[test]
    fn test_index_pulses_follow_rotation() {
        let mut agenda = Agenda::new();
        let mut drive = spinning_drive(CPU_HZ_REFERENCE, &mut agenda);
        let period = drive.rotation_cycles();
        assert_eq!(period, 1_600_000);
        assert_eq!(agenda.fire_time(AgendaEvent::FloppyIndexPulse(DriveId::A)), Some(T0 + period));

        // Reading does not disturb the pulse train.
        drive.read(0, 1, T0 + 1000).unwrap();
        let entry = agenda.pop_due(T0 + period).unwrap();
        assert!(drive.index_pulse(&mut agenda, entry.fire_time));
        assert_eq!(drive.time_of_last_ip(), T0 + period);
        assert_eq!(agenda.fire_time(AgendaEvent::FloppyIndexPulse(DriveId::A)), Some(T0 + 2 * period));
        assert_eq!(drive.index_pulses(), 2);
    }

    #[test]
    fn test_motor_stop_and_resume_keeps_position() {
        let mut agenda = Agenda::new();
        let mut drive = spinning_drive(CPU_HZ_REFERENCE, &mut agenda);
        let c = drive.cycles_per_byte();

        drive.set_motor(false, &mut agenda, T0 + 1000 * c);
        assert!(!agenda.is_pending(AgendaEvent::FloppyIndexPulse(DriveId::A)));
        assert!(!drive.index_pulse(&mut agenda, T0 + 2000 * c));

        let restart = T0 + 50_000 * c;
        drive.set_motor(true, &mut agenda, restart);
        assert_eq!(drive.byte_position(restart), 1000);
        assert_eq!(
            agenda.fire_time(AgendaEvent::FloppyIndexPulse(DriveId::A)),
            Some(restart + 5250 * c)
        );
    }

    #[test]
    fn test_step_clamps() {
        let mut drive = FloppyDrive::new(DriveId::B, CPU_HZ_REFERENCE, false);
        drive.step(StepDirection::Out);
        assert_eq!(drive.track(), 0);
        for _ in 0..100 {
            drive.step(StepDirection::In);
        }
        assert_eq!(drive.track(), DRIVE_MAX_CYL);
        assert_eq!(drive.step(StepDirection::Out), 24_000);
        assert_eq!(drive.track(), DRIVE_MAX_CYL - 1);
    }

    #[test]
    fn test_empty_drive_reports_no_disk() {
        let mut drive = FloppyDrive::new(DriveId::A, CPU_HZ_REFERENCE, false);
        assert!(matches!(drive.read(0, 1, T0), Err(DiskError::NoDisk)));
        assert!(matches!(drive.write(0, 1, T0), Err(DiskError::NoDisk)));
        assert!(!drive.is_busy());
    }

    #[test]
    fn test_read_transfer() {
        let mut agenda = Agenda::new();
        let mut drive = spinning_drive(CPU_HZ_REFERENCE, &mut agenda);
        drive.step(StepDirection::In);
        drive.read(1, 2, T0).unwrap();
        assert!(drive.is_busy());

        let mut count = 0;
        while let Some(byte) = drive.next_read_byte() {
            // Track 1, side 1, sector 2 is the 29th sector of the image.
            assert_eq!(byte, 28);
            count += 1;
        }
        assert_eq!(count, 512);
        assert!(drive.transfer_done());
        drive.finish_transfer(T0).unwrap();
        assert!(!drive.is_busy());

        assert!(matches!(drive.read(0, 12, T0), Err(DiskError::SectorNotFound(_))));
    }

    #[test]
    fn test_write_protected_goes_to_ghost() {
        let mut drive = FloppyDrive::new(DriveId::A, CPU_HZ_REFERENCE, false);
        drive.insert(image(true), None);
        assert!(matches!(drive.write(0, 1, T0), Err(DiskError::WriteProtected)));

        let mut agenda = Agenda::new();
        let ejected = drive.eject(&mut agenda).unwrap();
        drive.insert(ejected.image, Some(GhostDisk::new()));

        drive.write(0, 3, T0).unwrap();
        while drive.push_write_byte(0x99) {}
        drive.finish_transfer(T0).unwrap();
        assert!(drive.has_override(SectorId::new(0, 0, 3)));

        drive.read(0, 3, T0).unwrap();
        assert_eq!(drive.next_read_byte(), Some(0x99));
        drive.finish_transfer(T0).unwrap();

        drive.read(0, 4, T0).unwrap();
        assert_eq!(drive.next_read_byte(), Some(3));
    }
}
