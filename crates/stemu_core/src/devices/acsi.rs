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

    devices::acsi.rs

    Implements ACSI hard disk devices. Up to eight devices share the bus behind
    the DMA controller and receive commands one byte at a time.
*/

use std::{
    fs::OpenOptions,
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use anyhow::Context;
use thiserror::Error;

use crate::{
    bus::DmaMemory,
    device_types::disk::ImageStream,
    devices::dma::Dma,
    machine_config::DiskTiming,
};

pub const ACSI_BLOCK_SIZE: usize = 512;
pub const ACSI_MAX_DEVICES: usize = 8;
pub const ACSI_COMMAND_LEN: usize = 6;
pub const ACSI_INQUIRY_LEN: usize = 32;
pub const ACSI_INQUIRY_NAME_OFFSET: usize = 8;

/// Command phase values. Phases below 6 are accumulating command bytes.
pub const ACSI_PHASE_DISPATCH: u8 = 6;
pub const ACSI_PHASE_IDLE: u8 = 7;

pub const ACSI_STATUS_OK: u8 = 0x00;
pub const ACSI_STATUS_ERROR: u8 = 0x02;

pub const ACSI_ERROR_NONE: u8 = 0x00;
pub const ACSI_ERROR_WRITE_FAULT: u8 = 0x03;
pub const ACSI_ERROR_INVALID_OPCODE: u8 = 0x20;
pub const ACSI_ERROR_INVALID_ADDRESS: u8 = 0x21;

pub const ACSI_FORMAT_FILL: u8 = 0x6C;
/// Status is only returned when the mode register selects HDC, A1 and A0 with DRQ from the HDC.
pub const ACSI_STATUS_MODE: u8 = 0x8A;
/// Per-block delay at 8MHz; roughly 1MB/s.
pub const ACSI_CYCLES_PER_BLOCK: i64 = 4000;

#[derive(Debug, Error)]
pub enum AcsiError {
    #[error("invalid ACSI device number {0}")]
    InvalidDevice(u8),
    #[error("no hard disk image attached to ACSI device {0}")]
    NoImage(u8),
    #[error("hard disk image is {0} bytes, smaller than one block")]
    ImageTooSmall(u64),
    #[error("hard disk image I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AcsiOpcode {
    TestUnitReady,
    RequestSense,
    Format,
    Read,
    Write,
    Seek,
    Inquiry,
    ModeSelect,
}

impl TryFrom<u8> for AcsiOpcode {
    type Error = u8;
    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x00 => Ok(AcsiOpcode::TestUnitReady),
            0x03 => Ok(AcsiOpcode::RequestSense),
            0x04 => Ok(AcsiOpcode::Format),
            0x08 => Ok(AcsiOpcode::Read),
            0x0A => Ok(AcsiOpcode::Write),
            0x0B => Ok(AcsiOpcode::Seek),
            0x12 => Ok(AcsiOpcode::Inquiry),
            0x15 => Ok(AcsiOpcode::ModeSelect),
            _ => Err(value),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AcsiActivity {
    #[default]
    Idle,
    Command,
    Transfer,
}

/// What a device needs from the machine after accepting a byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AcsiResponse {
    None,
    /// Raise the interrupt line now.
    Irq,
    /// Raise the interrupt line after this many cycles at the 8MHz reference clock.
    DeferredIrq(i64),
}

/// Forces instant sector access for the life of the guard and puts the previous setting back
/// when dropped, whichever way the transfer ends.
struct InstantAccessGuard<'a> {
    flag:  &'a mut bool,
    saved: bool,
}

impl<'a> InstantAccessGuard<'a> {
    fn engage(timing: &'a mut DiskTiming) -> Self {
        let saved = timing.instant_sector_access;
        if !timing.advanced_timing {
            timing.instant_sector_access = true;
        }
        Self {
            flag: &mut timing.instant_sector_access,
            saved,
        }
    }
}

impl Drop for InstantAccessGuard<'_> {
    fn drop(&mut self) {
        *self.flag = self.saved;
    }
}

struct HardDiskImage {
    name:   String,
    stream: Box<dyn ImageStream>,
}

pub struct AcsiDevice {
    device_num: u8,
    command: [u8; ACSI_COMMAND_LEN],
    phase: u8,
    status: u8,
    error_code: u8,
    data_register: u8,
    inquiry: [u8; ACSI_INQUIRY_LEN],
    image: Option<HardDiskImage>,
    sector_count: u32,
    irq: bool,
    activity: AcsiActivity,
}

impl AcsiDevice {
    pub fn new(device_num: u8) -> Self {
        Self {
            device_num: device_num & 0x07,
            command: [0; ACSI_COMMAND_LEN],
            phase: ACSI_PHASE_IDLE,
            status: ACSI_STATUS_OK,
            error_code: ACSI_ERROR_NONE,
            data_register: 0,
            inquiry: [0; ACSI_INQUIRY_LEN],
            image: None,
            sector_count: 0,
            irq: false,
            activity: AcsiActivity::Idle,
        }
    }

    pub fn reset(&mut self) {
        self.phase = ACSI_PHASE_IDLE;
        self.status = ACSI_STATUS_OK;
        self.irq = false;
        self.activity = AcsiActivity::Idle;
    }

    pub fn attach(&mut self, name: &str, mut stream: Box<dyn ImageStream>) -> Result<(), AcsiError> {
        let len = stream.seek(SeekFrom::End(0))?;
        if len < ACSI_BLOCK_SIZE as u64 {
            return Err(AcsiError::ImageTooSmall(len));
        }
        self.sector_count = (len / ACSI_BLOCK_SIZE as u64) as u32;
        self.inquiry = [0; ACSI_INQUIRY_LEN];
        let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
        let max = ACSI_INQUIRY_LEN - ACSI_INQUIRY_NAME_OFFSET - 1;
        for (dst, src) in self.inquiry[ACSI_INQUIRY_NAME_OFFSET..]
            .iter_mut()
            .zip(stem.bytes().take(max))
        {
            *dst = src;
        }
        log::debug!(
            "ACSI {}: attached {} ({} sectors)",
            self.device_num,
            name,
            self.sector_count
        );
        self.image = Some(HardDiskImage {
            name: name.to_string(),
            stream,
        });
        self.reset();
        Ok(())
    }

    pub fn attach_file<P: AsRef<Path>>(&mut self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open hard disk image: {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.attach(&name, Box::new(file))
            .with_context(|| format!("Failed to attach hard disk image: {}", path.display()))
    }

    pub fn detach(&mut self) -> bool {
        match self.image.take() {
            Some(image) => {
                log::debug!("ACSI {}: detached {}", self.device_num, image.name);
                self.sector_count = 0;
                self.reset();
                true
            }
            None => false,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.image.is_some()
    }

    pub fn device_num(&self) -> u8 {
        self.device_num
    }

    pub fn phase(&self) -> u8 {
        self.phase
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn error_code(&self) -> u8 {
        self.error_code
    }

    pub fn irq(&self) -> bool {
        self.irq
    }

    pub fn activity(&self) -> AcsiActivity {
        self.activity
    }

    pub fn sector_count(&self) -> u32 {
        self.sector_count
    }

    pub fn command(&self) -> &[u8; ACSI_COMMAND_LEN] {
        &self.command
    }

    pub fn inquiry_data(&self) -> &[u8; ACSI_INQUIRY_LEN] {
        &self.inquiry
    }

    /// True if `byte`, written with A0 clear, starts a new command for this device.
    pub fn claims(&self, byte: u8) -> bool {
        self.image.is_some() && self.phase == ACSI_PHASE_IDLE && (byte >> 5) == self.device_num
    }

    fn block_count(&self) -> u32 {
        self.command[4] as u32
    }

    fn sector_number(&self) -> u32 {
        (self.command[1] as u32) << 16 | (self.command[2] as u32) << 8 | self.command[3] as u32
    }

    /// Accept a byte from the DMA controller's data register. `a0` is the A0 line from the mode
    /// register: clear for the first byte of a command.
    pub fn io_write(
        &mut self,
        a0: bool,
        byte: u8,
        dma: &mut Dma,
        mem: &mut dyn DmaMemory,
        timing: &mut DiskTiming,
    ) -> AcsiResponse {
        if self.image.is_none() {
            return AcsiResponse::None;
        }

        let mut byte = byte;
        if !a0 && self.claims(byte) {
            self.phase = 0;
            byte &= 0x1F;
            self.activity = AcsiActivity::Command;
        }
        if self.phase >= ACSI_PHASE_DISPATCH {
            log::trace!("ACSI {}: ignoring byte {:02X} while idle", self.device_num, byte);
            return AcsiResponse::None;
        }

        self.command[self.phase as usize] = byte;
        self.phase += 1;
        if self.phase < ACSI_PHASE_DISPATCH {
            self.irq = true;
            return AcsiResponse::Irq;
        }

        self.dispatch(dma, mem, timing);
        self.phase = ACSI_PHASE_IDLE;

        let transfer = matches!(
            AcsiOpcode::try_from(self.command[0]),
            Ok(AcsiOpcode::Read) | Ok(AcsiOpcode::Write)
        );
        if transfer && self.status == ACSI_STATUS_OK && !timing.instant_sector_access {
            self.activity = AcsiActivity::Transfer;
            self.irq = false;
            return AcsiResponse::DeferredIrq(self.block_count() as i64 * ACSI_CYCLES_PER_BLOCK);
        }
        self.irq = true;
        AcsiResponse::Irq
    }

    /// Status register read. Acknowledges the interrupt.
    pub fn io_read(&mut self, mode: u8) -> u8 {
        self.irq = false;
        self.activity = AcsiActivity::Command;
        if mode == ACSI_STATUS_MODE {
            self.status
        }
        else {
            0
        }
    }

    /// A deferred transfer has run its course.
    pub fn complete_transfer(&mut self) {
        self.activity = AcsiActivity::Command;
        self.irq = true;
    }

    fn dispatch(&mut self, dma: &mut Dma, mem: &mut dyn DmaMemory, timing: &mut DiskTiming) {
        self.status = ACSI_STATUS_OK;
        let opcode = AcsiOpcode::try_from(self.command[0]);
        if opcode != Ok(AcsiOpcode::RequestSense) {
            self.error_code = ACSI_ERROR_NONE;
        }
        log::debug!("ACSI {}: command {:02X?}", self.device_num, self.command);

        match opcode {
            Ok(AcsiOpcode::TestUnitReady) => {}
            Ok(AcsiOpcode::RequestSense) => {
                self.data_register = self.error_code;
                dma.drq(&mut self.data_register, mem);
                for _ in 0..3 {
                    self.data_register = 0;
                    dma.drq(&mut self.data_register, mem);
                }
            }
            Ok(AcsiOpcode::Format) => self.format(),
            Ok(AcsiOpcode::Read) => self.read_write(false, dma, mem, timing),
            Ok(AcsiOpcode::Write) => self.read_write(true, dma, mem, timing),
            Ok(AcsiOpcode::Seek) => {
                self.seek();
            }
            Ok(AcsiOpcode::Inquiry) => {
                let inquiry = self.inquiry;
                for byte in inquiry {
                    self.data_register = byte;
                    dma.drq(&mut self.data_register, mem);
                }
            }
            Ok(AcsiOpcode::ModeSelect) => {
                for _ in 0..self.block_count() {
                    dma.drq(&mut self.data_register, mem);
                }
            }
            Err(op) => {
                log::warn!("ACSI {}: invalid opcode {:02X}", self.device_num, op);
                self.status = ACSI_STATUS_ERROR;
                self.error_code = ACSI_ERROR_INVALID_OPCODE;
            }
        }
    }

    fn fail(&mut self, error_code: u8) {
        self.status = ACSI_STATUS_ERROR;
        self.error_code = error_code;
    }

    /// Position the image at the sector in the command block.
    fn seek(&mut self) -> bool {
        let sector = self.sector_number();
        if sector >= self.sector_count {
            log::warn!("ACSI {}: seek to sector {} beyond end of disk", self.device_num, sector);
            self.fail(ACSI_ERROR_INVALID_ADDRESS);
            return false;
        }
        let Some(image) = self.image.as_mut()
        else {
            return false;
        };
        if let Err(e) = image.stream.seek(SeekFrom::Start(sector as u64 * ACSI_BLOCK_SIZE as u64)) {
            log::error!("ACSI {}: seek failed: {}", self.device_num, e);
            self.fail(ACSI_ERROR_WRITE_FAULT);
            return false;
        }
        true
    }

    fn read_write(&mut self, write: bool, dma: &mut Dma, mem: &mut dyn DmaMemory, timing: &mut DiskTiming) {
        let _guard = InstantAccessGuard::engage(timing);
        if !self.seek() {
            return;
        }
        let total = self.block_count() as usize * ACSI_BLOCK_SIZE;
        let sector_number = self.sector_number();
        let Some(image) = self.image.as_mut()
        else {
            return;
        };

        for _ in 0..total {
            let result = if write {
                dma.drq(&mut self.data_register, mem);
                image.stream.write_all(&[self.data_register])
            }
            else {
                let mut byte = [0u8; 1];
                image.stream.read_exact(&mut byte).map(|_| {
                    self.data_register = byte[0];
                    dma.drq(&mut self.data_register, mem);
                })
            };
            if let Err(e) = result {
                log::error!(
                    "ACSI {}: {} failed at sector {}: {}",
                    self.device_num,
                    if write { "write" } else { "read" },
                    sector_number,
                    e
                );
                self.status = ACSI_STATUS_ERROR;
                self.error_code = ACSI_ERROR_WRITE_FAULT;
                return;
            }
        }
        if write {
            if let Err(e) = image.stream.flush() {
                log::error!("ACSI {}: flush failed: {}", self.device_num, e);
                self.fail(ACSI_ERROR_WRITE_FAULT);
            }
        }
    }

    /// Fill every sector with the format pattern, one sector at a time.
    fn format(&mut self) {
        let sector_count = self.sector_count;
        let Some(image) = self.image.as_mut()
        else {
            return;
        };
        log::debug!("ACSI {}: formatting {} sectors", self.device_num, sector_count);
        let block = [ACSI_FORMAT_FILL; ACSI_BLOCK_SIZE];
        let result = image.stream.seek(SeekFrom::Start(0)).and_then(|_| {
            for _ in 0..sector_count {
                image.stream.write_all(&block)?;
            }
            image.stream.flush()
        });
        if let Err(e) = result {
            log::error!("ACSI {}: format failed: {}", self.device_num, e);
            self.fail(ACSI_ERROR_WRITE_FAULT);
        }
    }
}

/// The devices sharing the ACSI bus, and which of them owns it.
pub struct AcsiBus {
    devices: Vec<AcsiDevice>,
    owner:   u8,
}

impl Default for AcsiBus {
    fn default() -> Self {
        Self {
            devices: (0..ACSI_MAX_DEVICES as u8).map(AcsiDevice::new).collect(),
            owner:   0,
        }
    }
}

impl AcsiBus {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn reset(&mut self) {
        for device in self.devices.iter_mut() {
            device.reset();
        }
        self.owner = 0;
    }

    pub fn owner(&self) -> u8 {
        self.owner
    }

    pub fn device(&self, num: u8) -> Option<&AcsiDevice> {
        self.devices.get(num as usize)
    }

    pub fn device_mut(&mut self, num: u8) -> Result<&mut AcsiDevice, AcsiError> {
        self.devices.get_mut(num as usize).ok_or(AcsiError::InvalidDevice(num))
    }

    pub fn devices(&self) -> impl Iterator<Item = &AcsiDevice> {
        self.devices.iter()
    }

    pub fn any_irq(&self) -> bool {
        self.devices.iter().any(|d| d.irq())
    }

    /// Put a byte on the bus. Every device sees it; the first in bus order to claim a new
    /// command takes the bus, otherwise the byte belongs to the current owner.
    pub fn write(
        &mut self,
        a0: bool,
        byte: u8,
        dma: &mut Dma,
        mem: &mut dyn DmaMemory,
        timing: &mut DiskTiming,
    ) -> (u8, AcsiResponse) {
        if !a0 {
            if let Some(claimant) = self.devices.iter().position(|d| d.claims(byte)) {
                if claimant as u8 != self.owner {
                    log::trace!("ACSI: device {} takes the bus", claimant);
                }
                self.owner = claimant as u8;
            }
        }
        let owner = self.owner;
        let response = self.devices[owner as usize].io_write(a0, byte, dma, mem, timing);
        (owner, response)
    }

    /// Read the owning device's status.
    pub fn read(&mut self, mode: u8) -> (u8, u8) {
        let owner = self.owner;
        (owner, self.devices[owner as usize].io_read(mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bus::Ram, devices::dma::DMA_MODE_WRITE};
    use std::io::Cursor;

    const SECTORS: usize = 64;

    fn disk_bytes() -> Vec<u8> {
        (0..SECTORS * ACSI_BLOCK_SIZE)
            .map(|i| (i / ACSI_BLOCK_SIZE) as u8 ^ (i as u8).rotate_left(3))
            .collect()
    }

    fn attached(num: u8) -> AcsiDevice {
        let mut device = AcsiDevice::new(num);
        device
            .attach("SYSTEM.HD", Box::new(Cursor::new(disk_bytes())))
            .unwrap();
        device
    }

    fn read_dma(sectors: u16) -> (Dma, Ram) {
        let mut dma = Dma::new();
        dma.set_address(0x2000);
        dma.write_mode(0x0098);
        dma.write_sector_count(sectors);
        dma.write_mode(0x008A);
        (dma, Ram::new(0x10000))
    }

    fn send(
        device: &mut AcsiDevice,
        cmd: [u8; 6],
        dma: &mut Dma,
        mem: &mut Ram,
        timing: &mut DiskTiming,
    ) -> AcsiResponse {
        let mut response = AcsiResponse::None;
        for (i, byte) in cmd.iter().enumerate() {
            response = device.io_write(i != 0, *byte, dma, mem, timing);
        }
        response
    }

    #[test]
    fn test_claim_requires_matching_id() {
        let (mut dma, mut ram) = read_dma(0);
        let mut timing = DiskTiming::default();
        let mut device = attached(3);

        device.io_write(false, (5 << 5) | 0x08, &mut dma, &mut ram, &mut timing);
        assert_eq!(device.phase(), ACSI_PHASE_IDLE);

        let response = device.io_write(false, (3 << 5) | 0x08, &mut dma, &mut ram, &mut timing);
        assert_eq!(device.phase(), 1);
        assert_eq!(device.command()[0], 0x08);
        assert_eq!(response, AcsiResponse::Irq);

        // A byte for another device mid-command does not restart this one.
        assert!(!device.claims((3 << 5) | 0x08));
    }

    #[test]
    fn test_no_image_ignores_everything() {
        let (mut dma, mut ram) = read_dma(0);
        let mut timing = DiskTiming::default();
        let mut device = AcsiDevice::new(0);
        assert_eq!(
            device.io_write(false, 0x00, &mut dma, &mut ram, &mut timing),
            AcsiResponse::None
        );
        assert_eq!(device.phase(), ACSI_PHASE_IDLE);
    }

    #[test]
    fn test_read_sectors() {
        let (mut dma, mut ram) = read_dma(2);
        let mut timing = DiskTiming::default();
        let mut device = attached(0);

        let response = send(&mut device, [0x08, 0, 0, 10, 2, 0], &mut dma, &mut ram, &mut timing);
        assert_eq!(response, AcsiResponse::Irq);
        assert_eq!(device.phase(), ACSI_PHASE_IDLE);
        assert_eq!(device.io_read(ACSI_STATUS_MODE), ACSI_STATUS_OK);
        assert!(!device.irq());

        let expected = &disk_bytes()[10 * ACSI_BLOCK_SIZE..12 * ACSI_BLOCK_SIZE];
        assert_eq!(&ram.as_slice()[0x2000..0x2000 + 1024], expected);
        assert_eq!(dma.drq_count(), 1024);
    }

    #[test]
    fn test_write_then_read_back() {
        let mut timing = DiskTiming::default();
        let mut device = attached(1);

        let mut dma = Dma::new();
        let mut ram = Ram::new(0x10000);
        ram.load(0x4000, &[0x5A; 512]);
        dma.set_address(0x4000);
        dma.write_mode(DMA_MODE_WRITE | 0x18);
        dma.write_sector_count(1);
        dma.write_mode(DMA_MODE_WRITE | 0x08);
        send(&mut device, [0x2A, 0, 0, 7, 1, 0], &mut dma, &mut ram, &mut timing);
        assert_eq!(device.status(), ACSI_STATUS_OK);

        let (mut dma, mut ram) = read_dma(1);
        send(&mut device, [0x28, 0, 0, 7, 1, 0], &mut dma, &mut ram, &mut timing);
        assert!(ram.as_slice()[0x2000..0x2200].iter().all(|b| *b == 0x5A));
    }

    #[test]
    fn test_invalid_opcode_and_request_sense() {
        let (mut dma, mut ram) = read_dma(1);
        let mut timing = DiskTiming::default();
        let mut device = attached(0);

        send(&mut device, [0x1F, 0, 0, 0, 0, 0], &mut dma, &mut ram, &mut timing);
        assert_eq!(device.status(), ACSI_STATUS_ERROR);
        assert_eq!(device.error_code(), ACSI_ERROR_INVALID_OPCODE);

        send(&mut device, [0x03, 0, 0, 0, 4, 0], &mut dma, &mut ram, &mut timing);
        assert_eq!(device.status(), ACSI_STATUS_OK);
        assert_eq!(dma.drq_count(), 4);
        // Four bytes sit in the FIFO until the half fills.
        assert_eq!(dma.fifo_index(), 4);
    }

    #[test]
    fn test_seek_beyond_end_fails() {
        let (mut dma, mut ram) = read_dma(1);
        let mut timing = DiskTiming::default();
        let mut device = attached(0);

        send(&mut device, [0x0B, 0, 0, SECTORS as u8, 0, 0], &mut dma, &mut ram, &mut timing);
        assert_eq!(device.status(), ACSI_STATUS_ERROR);
        assert_eq!(device.error_code(), ACSI_ERROR_INVALID_ADDRESS);

        send(&mut device, [0x0B, 0, 0, SECTORS as u8 - 1, 0, 0], &mut dma, &mut ram, &mut timing);
        assert_eq!(device.status(), ACSI_STATUS_OK);
    }

    #[test]
    fn test_inquiry_reports_image_name() {
        let device = attached(0);
        let inquiry = device.inquiry_data();
        assert_eq!(&inquiry[..8], &[0; 8]);
        assert_eq!(&inquiry[8..14], b"SYSTEM");
        assert_eq!(inquiry[14], 0);
    }

    #[test]
    fn test_format_fills_every_sector() {
        let (mut dma, mut ram) = read_dma(1);
        let mut timing = DiskTiming::default();
        let mut device = attached(0);
        send(&mut device, [0x04, 0, 0, 0, 0, 0], &mut dma, &mut ram, &mut timing);
        assert_eq!(device.status(), ACSI_STATUS_OK);

        send(&mut device, [0x08, 0, 0, SECTORS as u8 - 1, 1, 0], &mut dma, &mut ram, &mut timing);
        assert!(ram.as_slice()[0x2000..0x2200].iter().all(|b| *b == ACSI_FORMAT_FILL));
    }

    #[test]
    fn test_deferred_completion_and_guard_restores_timing() {
        let (mut dma, mut ram) = read_dma(3);
        let mut timing = DiskTiming {
            instant_sector_access: false,
            ..Default::default()
        };
        let mut device = attached(0);

        let response = send(&mut device, [0x08, 0, 0, 0, 3, 0], &mut dma, &mut ram, &mut timing);
        assert_eq!(response, AcsiResponse::DeferredIrq(3 * ACSI_CYCLES_PER_BLOCK));
        assert!(!device.irq());
        assert_eq!(device.activity(), AcsiActivity::Transfer);
        assert!(!timing.instant_sector_access);

        device.complete_transfer();
        assert!(device.irq());

        // A read running off the end of the image fails, and the timing mode still comes back.
        let response = send(&mut device, [0x08, 0, 0, SECTORS as u8 - 1, 4, 0], &mut dma, &mut ram, &mut timing);
        assert_eq!(response, AcsiResponse::Irq);
        assert_eq!(device.status(), ACSI_STATUS_ERROR);
        assert_eq!(device.error_code(), ACSI_ERROR_WRITE_FAULT);
        assert!(!timing.instant_sector_access);
    }

    #[test]
    fn test_bus_routes_to_claimant() {
        let (mut dma, mut ram) = read_dma(0);
        let mut timing = DiskTiming::default();
        let mut bus = AcsiBus::new();
        bus.device_mut(3)
            .unwrap()
            .attach("A.HD", Box::new(Cursor::new(disk_bytes())))
            .unwrap();
        bus.device_mut(5)
            .unwrap()
            .attach("B.HD", Box::new(Cursor::new(disk_bytes())))
            .unwrap();

        let (owner, _) = bus.write(false, (5 << 5) | 0x00, &mut dma, &mut ram, &mut timing);
        assert_eq!(owner, 5);
        assert_eq!(bus.device(5).unwrap().phase(), 1);
        assert_eq!(bus.device(3).unwrap().phase(), ACSI_PHASE_IDLE);

        for _ in 0..5 {
            bus.write(true, 0, &mut dma, &mut ram, &mut timing);
        }
        assert_eq!(bus.device(5).unwrap().phase(), ACSI_PHASE_IDLE);
        assert!(bus.any_irq());
        assert_eq!(bus.read(ACSI_STATUS_MODE), (5, ACSI_STATUS_OK));
        assert!(!bus.any_irq());

        assert!(matches!(bus.device_mut(8), Err(AcsiError::InvalidDevice(8))));
    }
}
