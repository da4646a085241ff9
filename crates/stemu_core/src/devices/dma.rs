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

    devices::dma.rs

    Implements the ST DMA controller. Bytes move between the disk controllers
    and memory through a pair of 16 byte FIFO halves, eight words at a time.
*/

use modular_bitfield::{bitfield, prelude::*};

use crate::bus::DmaMemory;

pub const DMA_FIFO_SIZE: usize = 16;
pub const DMA_WORDS_PER_BURST: usize = 8;
pub const DMA_SECTOR_SIZE: u16 = 512;
pub const DMA_ADDRESS_MASK: u32 = 0x00FF_FFFE;

pub const DMA_SR_NO_ERROR: u8 = 0b0000_0001;
pub const DMA_SR_COUNT: u8 = 0b0000_0010;
pub const DMA_SR_DRQ: u8 = 0b0000_0100;

pub const DMA_MODE_MASK: u16 = 0x01FF;
pub const DMA_MODE_WRITE: u16 = 0b1_0000_0000;

#[bitfield]
#[derive(Copy, Clone, Debug)]
pub struct ModeControl {
    #[skip]
    unused0: B1,
    pub a0: bool,
    pub a1: bool,
    pub hdc_select: bool,
    pub count_select: bool,
    #[skip]
    unused5: B1,
    pub disable: bool,
    pub fdc_drq: bool,
    /// Memory to disk.
    pub write: bool,
    #[skip]
    unused9: B7,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddressByte {
    High,
    Mid,
    Low,
}

pub struct Dma {
    mode: ModeControl,
    address: u32,
    sector_count: u16,
    byte_count: u16,
    fifo: [[u8; DMA_FIFO_SIZE]; 2],
    fifo_idx: usize,
    buffer_in_use: usize,
    error: bool,
    drq: bool,
    drq_count: u64,
}

impl Default for Dma {
    fn default() -> Self {
        Self {
            mode: ModeControl::new(),
            address: 0,
            sector_count: 0,
            byte_count: 0,
            fifo: [[0; DMA_FIFO_SIZE]; 2],
            fifo_idx: 0,
            buffer_in_use: 0,
            error: false,
            drq: false,
            drq_count: 0,
        }
    }
}

impl Dma {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn reset(&mut self) {
        *self = Self {
            address: self.address,
            ..Default::default()
        };
    }

    pub fn mode(&self) -> ModeControl {
        self.mode
    }

    pub fn mode_value(&self) -> u16 {
        u16::from_le_bytes(self.mode.into_bytes())
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn set_address(&mut self, address: u32) {
        self.address = address & DMA_ADDRESS_MASK;
    }

    pub fn sector_count(&self) -> u16 {
        self.sector_count
    }

    pub fn byte_count(&self) -> u16 {
        self.byte_count
    }

    pub fn fifo_index(&self) -> usize {
        self.fifo_idx
    }

    pub fn buffer_in_use(&self) -> usize {
        self.buffer_in_use
    }

    /// Number of byte requests serviced since the last reset.
    pub fn drq_count(&self) -> u64 {
        self.drq_count
    }

    /// Status register, derived from the transfer state.
    pub fn status(&self) -> u8 {
        let mut sr = 0;
        if !self.error {
            sr |= DMA_SR_NO_ERROR;
        }
        if self.sector_count != 0 {
            sr |= DMA_SR_COUNT;
        }
        if self.drq {
            sr |= DMA_SR_DRQ;
        }
        sr
    }

    /// Flag a failed transfer. Cleared by the next direction toggle.
    pub fn set_error(&mut self) {
        log::trace!("DMA: transfer error");
        self.error = true;
    }

    /// Mode control write. Flipping the direction bit clears the transfer state.
    pub fn write_mode(&mut self, value: u16) {
        let old = self.mode_value();
        if (old ^ value) & DMA_MODE_WRITE != 0 {
            log::trace!("DMA: direction toggled, resetting transfer state");
            self.sector_count = 0;
            self.byte_count = 0;
            self.error = false;
            self.fifo_idx = 0;
            self.buffer_in_use = 0;
        }
        self.mode = ModeControl::from_bytes((value & DMA_MODE_MASK).to_le_bytes());
        log::trace!("DMA: mode write: {:04X}", value & DMA_MODE_MASK);
    }

    pub fn write_sector_count(&mut self, value: u16) {
        self.sector_count = value & 0xFF;
        self.byte_count = 0;
        log::trace!("DMA: sector count: {}", self.sector_count);
    }

    pub fn write_address_byte(&mut self, which: AddressByte, value: u8) {
        let (shift, value) = match which {
            AddressByte::High => (16, value),
            AddressByte::Mid => (8, value),
            AddressByte::Low => (0, value & 0xFE),
        };
        self.address = (self.address & !(0xFF << shift)) | ((value as u32) << shift);
        log::trace!("DMA: address: {:06X}", self.address);
    }

    pub fn read_address_byte(&self, which: AddressByte) -> u8 {
        match which {
            AddressByte::High => (self.address >> 16) as u8,
            AddressByte::Mid => (self.address >> 8) as u8,
            AddressByte::Low => self.address as u8,
        }
    }

    /// One byte is ready at the controller's data register `dr`. Disk to memory transfers
    /// take the byte; memory to disk transfers store the next byte into `dr`.
    pub fn drq(&mut self, dr: &mut u8, mem: &mut dyn DmaMemory) {
        self.drq = true;
        self.drq_count += 1;
        if self.mode.write() {
            if self.fifo_idx == 0 && self.sector_count == 0 {
                log::trace!("DMA: write request with sector count 0 ignored");
            }
            else {
                *dr = self.get_fifo_byte(mem);
            }
        }
        else if self.sector_count != 0 {
            self.add_to_fifo(*dr, mem);
        }
        else {
            log::trace!("DMA: read request with sector count 0 ignored");
        }
        self.drq = false;
    }

    fn add_to_fifo(&mut self, data: u8, mem: &mut dyn DmaMemory) {
        self.fifo[self.buffer_in_use][self.fifo_idx] = data;
        self.fifo_idx += 1;
        if self.fifo_idx == DMA_FIFO_SIZE {
            self.request_transfer(mem);
        }
    }

    fn get_fifo_byte(&mut self, mem: &mut dyn DmaMemory) -> u8 {
        if self.fifo_idx == 0 {
            self.request_transfer(mem);
        }
        self.fifo_idx -= 1;
        self.fifo[self.buffer_in_use][self.fifo_idx]
    }

    /// Swap FIFO halves and burst the full (or empty) one to (or from) memory.
    fn request_transfer(&mut self, mem: &mut dyn DmaMemory) {
        self.fifo_idx = if self.mode.write() { DMA_FIFO_SIZE } else { 0 };
        self.buffer_in_use ^= 1;
        self.transfer_bytes(mem);
    }

    fn transfer_bytes(&mut self, mem: &mut dyn DmaMemory) {
        for i in 0..DMA_WORDS_PER_BURST {
            if self.mode.write() {
                // The FIFO is drained from the top, so the first word lands at the end.
                let hi = mem.read_u8(self.address).unwrap_or(0xFF);
                let lo = mem.read_u8(self.address + 1).unwrap_or(0xFF);
                self.fifo[self.buffer_in_use][DMA_FIFO_SIZE - 1 - i * 2] = hi;
                self.fifo[self.buffer_in_use][DMA_FIFO_SIZE - 2 - i * 2] = lo;
            }
            else {
                let half = self.buffer_in_use ^ 1;
                let hi = self.fifo[half][i * 2];
                let lo = self.fifo[half][i * 2 + 1];
                if !mem.write_u8(self.address, hi) || !mem.write_u8(self.address + 1, lo) {
                    log::warn!("DMA: bus error writing to {:06X}", self.address);
                    self.error = true;
                }
            }
            self.inc_address();
        }
    }

    fn inc_address(&mut self) {
        if self.sector_count == 0 {
            return;
        }
        self.address = (self.address + 2) & DMA_ADDRESS_MASK;
        self.byte_count += 2;
        if self.byte_count >= DMA_SECTOR_SIZE {
            self.byte_count = 0;
            self.sector_count -= 1;
            log::trace!("DMA: sector complete, {} remaining", self.sector_count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Ram;

    const BASE: u32 = 0x1000;

    fn setup(mode: u16, sectors: u16) -> (Dma, Ram) {
        let mut dma = Dma::new();
        dma.set_address(BASE);
        dma.write_mode(mode | 0x10);
        dma.write_sector_count(sectors);
        dma.write_mode(mode);
        (dma, Ram::new(0x10000))
    }

    #[test]
    fn test_read_sector_into_memory() {
        let (mut dma, mut ram) = setup(0x0008, 1);
        assert_eq!(dma.status(), DMA_SR_NO_ERROR | DMA_SR_COUNT);

        for i in 0..512u32 {
            let mut dr = (i * 7) as u8;
            dma.drq(&mut dr, &mut ram);
            if i == 15 {
                // The first half has been handed off and the selector flipped.
                assert_eq!(dma.buffer_in_use(), 1);
                assert_eq!(dma.address(), BASE + 16);
            }
        }

        for i in 0..512u32 {
            assert_eq!(ram.as_slice()[(BASE + i) as usize], (i * 7) as u8);
        }
        assert_eq!(dma.sector_count(), 0);
        assert_eq!(dma.address(), BASE + 512);
        assert_eq!(dma.status(), DMA_SR_NO_ERROR);

        // Further requests are dropped once the count runs out.
        let mut dr = 0xAA;
        dma.drq(&mut dr, &mut ram);
        assert_eq!(dma.address(), BASE + 512);
        assert_eq!(dma.fifo_index(), 0);
    }

    #[test]
    fn test_write_sector_from_memory() {
        let (mut dma, mut ram) = setup(DMA_MODE_WRITE | 0x0008, 2);
        for i in 0..1024u32 {
            ram.as_mut_slice()[(BASE + i) as usize] = (i ^ (i >> 8)) as u8;
        }

        let mut out = Vec::new();
        for _ in 0..1024 {
            let mut dr = 0;
            dma.drq(&mut dr, &mut ram);
            out.push(dr);
        }
        for (i, byte) in out.iter().enumerate() {
            assert_eq!(*byte, (i ^ (i >> 8)) as u8, "byte {}", i);
        }
        assert_eq!(dma.sector_count(), 0);

        // Counter exhausted and FIFO drained: nothing more to hand out.
        let mut dr = 0x55;
        dma.drq(&mut dr, &mut ram);
        assert_eq!(dr, 0x55);
        assert_eq!(dma.status() & DMA_SR_COUNT, 0);
    }

    #[test]
    fn test_zero_count_write_is_noop() {
        let (mut dma, mut ram) = setup(DMA_MODE_WRITE, 0);
        let mut dr = 0x12;
        dma.drq(&mut dr, &mut ram);
        assert_eq!(dr, 0x12);
        assert_eq!(dma.address(), BASE);
        assert_eq!(dma.status(), DMA_SR_NO_ERROR);
    }

    #[test]
    fn test_direction_toggle_resets() {
        let (mut dma, mut ram) = setup(0, 4);
        let mut dr = 1;
        for _ in 0..5 {
            dma.drq(&mut dr, &mut ram);
        }
        assert_eq!(dma.fifo_index(), 5);

        dma.write_mode(0x0008);
        assert_eq!(dma.fifo_index(), 5);
        assert_eq!(dma.sector_count(), 4);

        dma.write_mode(DMA_MODE_WRITE);
        assert_eq!(dma.fifo_index(), 0);
        assert_eq!(dma.sector_count(), 0);
        assert_eq!(dma.status(), DMA_SR_NO_ERROR);
    }

    #[test]
    fn test_bus_error_sets_status() {
        let mut dma = Dma::new();
        let mut ram = Ram::new(0x100);
        dma.write_mode(0x10);
        dma.write_sector_count(1);
        dma.write_mode(0);
        dma.set_address(0x0000);

        let mut dr = 0;
        for _ in 0..16 {
            dma.drq(&mut dr, &mut ram);
        }
        assert_eq!(dma.status() & DMA_SR_NO_ERROR, 0);
    }

    #[test]
    fn test_address_bytes() {
        let mut dma = Dma::new();
        dma.write_address_byte(AddressByte::High, 0x12);
        dma.write_address_byte(AddressByte::Mid, 0x34);
        dma.write_address_byte(AddressByte::Low, 0x57);
        assert_eq!(dma.address(), 0x123456);
        assert_eq!(dma.read_address_byte(AddressByte::Low), 0x56);
        assert_eq!(dma.read_address_byte(AddressByte::High), 0x12);
    }
}
