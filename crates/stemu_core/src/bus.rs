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

    bus.rs

    Memory seen by the DMA controller, and events reported back to the CPU core.
*/

use crate::{
    devices::{acia::AciaId, floppy_drive::DriveId},
    interrupt::InterruptLine,
};

pub const RAM_FIRST_WRITEABLE: u32 = 0x08;
pub const ADDRESS_MASK: u32 = 0x00FF_FFFF;

/// Events collected while devices run and drained by the CPU core.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    InterruptUpdate(InterruptLine, bool),
    AciaByteSent(AciaId, u8),
    FloppyTransferComplete(DriveId, bool),
    AcsiCommandComplete(u8, u8),
}

/// Memory access for bus masters other than the CPU.
pub trait DmaMemory {
    fn read_u8(&self, address: u32) -> Option<u8>;
    /// Returns false if `address` is not writeable; the DMA reports that as a bus error.
    fn write_u8(&mut self, address: u32, data: u8) -> bool;
}

/// Main RAM. The first eight bytes are the reset vector and are only writeable by the CPU.
pub struct Ram {
    data: Vec<u8>,
}

impl Ram {
    pub fn new(size: usize) -> Self {
        Self { data: vec![0; size] }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copy `bytes` into RAM at `address`, clipping at the end of memory.
    pub fn load(&mut self, address: u32, bytes: &[u8]) {
        let start = address as usize;
        if start >= self.data.len() {
            return;
        }
        let len = bytes.len().min(self.data.len() - start);
        self.data[start..start + len].copy_from_slice(&bytes[..len]);
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
    }
}

impl DmaMemory for Ram {
    fn read_u8(&self, address: u32) -> Option<u8> {
        self.data.get((address & ADDRESS_MASK) as usize).copied()
    }

    fn write_u8(&mut self, address: u32, data: u8) -> bool {
        let address = address & ADDRESS_MASK;
        if address < RAM_FIRST_WRITEABLE {
            return false;
        }
        match self.data.get_mut(address as usize) {
            Some(byte) => {
                *byte = data;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ram_bounds() {
        let mut ram = Ram::new(0x100);
        assert!(!ram.write_u8(0x04, 0xAA));
        assert!(ram.write_u8(0x10, 0xAA));
        assert_eq!(ram.read_u8(0x10), Some(0xAA));
        assert!(!ram.write_u8(0x100, 0xAA));
        assert_eq!(ram.read_u8(0x100), None);
    }

    #[test]
    fn test_load_clips() {
        let mut ram = Ram::new(0x10);
        ram.load(0x0E, &[1, 2, 3, 4]);
        assert_eq!(&ram.as_slice()[0x0E..], &[1, 2]);
    }
}
