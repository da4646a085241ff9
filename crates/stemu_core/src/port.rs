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

    port.rs

    Byte transports attached to the ACIAs (keyboard processor link, MIDI ports).
*/

use std::sync::Arc;

use crate::circular_buffer::{CircularBuffer, CircularBufferError};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ModemStatus {
    pub dcd: bool,
    pub cts: bool,
}

/// The far side of an ACIA. The chip only ever exchanges whole bytes with a port.
pub trait SerialPort: Send {
    fn name(&self) -> &str;
    fn output_byte(&mut self, byte: u8);
    fn are_bytes_to_read(&self) -> bool;
    /// Peek at the next input byte. Returns 0 if there is none.
    fn read_byte(&self) -> u8;
    /// Consume the byte returned by `read_byte`.
    fn next_byte(&mut self);
    fn modem_status(&self) -> ModemStatus {
        ModemStatus::default()
    }
    /// False for ports that will never produce input; the ACIA does not poll them.
    fn is_connected(&self) -> bool {
        true
    }
}

#[derive(Default)]
pub struct NullPort;

impl SerialPort for NullPort {
    fn name(&self) -> &str {
        "null"
    }
    fn output_byte(&mut self, _byte: u8) {}
    fn are_bytes_to_read(&self) -> bool {
        false
    }
    fn read_byte(&self) -> u8 {
        0
    }
    fn next_byte(&mut self) {}
    fn is_connected(&self) -> bool {
        false
    }
}

/// Everything written comes back as input.
pub struct LoopbackPort {
    ring: CircularBuffer,
    sent: u64,
}

impl LoopbackPort {
    pub fn new(size: usize) -> Result<Self, CircularBufferError> {
        Ok(Self {
            ring: CircularBuffer::new(size)?,
            sent: 0,
        })
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent
    }
}

impl SerialPort for LoopbackPort {
    fn name(&self) -> &str {
        "loopback"
    }

    fn output_byte(&mut self, byte: u8) {
        self.sent += 1;
        if !self.ring.add_byte(byte) {
            log::warn!("LoopbackPort: ring overflow, oldest byte dropped");
        }
    }

    fn are_bytes_to_read(&self) -> bool {
        self.ring.are_bytes_in_buffer()
    }

    fn read_byte(&self) -> u8 {
        self.ring.read_byte().unwrap_or(0)
    }

    fn next_byte(&mut self) {
        self.ring.next_byte();
    }

    fn modem_status(&self) -> ModemStatus {
        ModemStatus { dcd: false, cts: false }
    }
}

/// A port whose other end lives on another thread. Input is filled and output drained by
/// whoever holds the other handles to the two rings.
pub struct BufferedPort {
    name:   String,
    input:  Arc<CircularBuffer>,
    output: Arc<CircularBuffer>,
    modem:  ModemStatus,
}

impl BufferedPort {
    pub fn new(name: &str, size: usize) -> Result<Self, CircularBufferError> {
        Ok(Self {
            name:   name.to_string(),
            input:  Arc::new(CircularBuffer::new(size)?),
            output: Arc::new(CircularBuffer::new(size)?),
            modem:  ModemStatus::default(),
        })
    }

    /// Handle used by the producing thread to feed bytes into the emulated machine.
    pub fn input_handle(&self) -> Arc<CircularBuffer> {
        self.input.clone()
    }

    /// Handle used by the consuming thread to collect bytes sent by the emulated machine.
    pub fn output_handle(&self) -> Arc<CircularBuffer> {
        self.output.clone()
    }

    pub fn set_modem_status(&mut self, status: ModemStatus) {
        self.modem = status;
    }
}

impl SerialPort for BufferedPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_byte(&mut self, byte: u8) {
        if !self.output.add_byte(byte) {
            log::warn!("{}: output overflow, oldest byte dropped", self.name);
        }
    }

    fn are_bytes_to_read(&self) -> bool {
        self.input.are_bytes_in_buffer()
    }

    fn read_byte(&self) -> u8 {
        self.input.read_byte().unwrap_or(0)
    }

    fn next_byte(&mut self) {
        self.input.next_byte();
    }

    fn modem_status(&self) -> ModemStatus {
        self.modem
    }
}
