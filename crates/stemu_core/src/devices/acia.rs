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

    devices::acia.rs

    Implements the MC6850 ACIA. Two instances exist: one linked to the
    keyboard processor and one driving the MIDI ports.
*/

use modular_bitfield::{bitfield, prelude::*};
use strum_macros::{Display, EnumIter};

use crate::{
    agenda::{Agenda, AgendaEvent},
    clock::{scale_reference, ClockValue},
    interrupt::InterruptLine,
    port::{ModemStatus, SerialPort},
};

pub const ACIA_SR_RDRF: u8 = 0b0000_0001;
pub const ACIA_SR_TDRE: u8 = 0b0000_0010;
pub const ACIA_SR_DCD: u8 = 0b0000_0100;
pub const ACIA_SR_CTS: u8 = 0b0000_1000;
pub const ACIA_SR_FE: u8 = 0b0001_0000;
pub const ACIA_SR_OVRN: u8 = 0b0010_0000;
pub const ACIA_SR_PE: u8 = 0b0100_0000;
pub const ACIA_SR_IRQ: u8 = 0b1000_0000;

pub const ACIA_CR_MASTER_RESET: u8 = 0b0000_0011;
pub const ACIA_CR_RX_IRQ: u8 = 0b1000_0000;

/// CPU cycles per ACIA clock tick: both ACIAs are clocked at 500kHz.
pub const ACIA_CYCLES_PER_CLOCK: i64 = 16;
/// Framing is not modeled; every byte occupies the line for this many bit times.
pub const ACIA_BITS_PER_BYTE: i64 = 9;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum AciaId {
    Keyboard,
    Midi,
}

impl AciaId {
    pub fn index(&self) -> usize {
        match self {
            AciaId::Keyboard => 0,
            AciaId::Midi => 1,
        }
    }

    pub fn interrupt_line(&self) -> InterruptLine {
        match self {
            AciaId::Keyboard => InterruptLine::KeyboardAcia,
            AciaId::Midi => InterruptLine::MidiAcia,
        }
    }

    /// Counter divide selected at power on: the keyboard link runs at 7812 baud, MIDI at 31250.
    fn reset_divide(&self) -> CounterDivide {
        match self {
            AciaId::Keyboard => CounterDivide::Div64,
            AciaId::Midi => CounterDivide::Div16,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CounterDivide {
    Div1,
    #[default]
    Div16,
    Div64,
    MasterReset,
}

impl CounterDivide {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => CounterDivide::Div1,
            1 => CounterDivide::Div16,
            2 => CounterDivide::Div64,
            _ => CounterDivide::MasterReset,
        }
    }

    fn bits(&self) -> u8 {
        match self {
            CounterDivide::Div1 => 0,
            CounterDivide::Div16 => 1,
            CounterDivide::Div64 => 2,
            CounterDivide::MasterReset => 3,
        }
    }

    pub fn factor(&self) -> i64 {
        match self {
            CounterDivide::Div1 => 1,
            CounterDivide::Div16 | CounterDivide::MasterReset => 16,
            CounterDivide::Div64 => 64,
        }
    }
}

#[bitfield]
#[derive(Copy, Clone, Debug)]
pub struct ControlRegister {
    pub divide: B2,
    pub word_select: B3,
    pub tx_control: B2,
    pub rx_irq: bool,
}

pub struct Acia {
    id: AciaId,
    cpu_hz: u32,

    control: ControlRegister,
    clock_divide: CounterDivide,
    tx_irq_enabled: bool,
    rx_irq_enabled: bool,

    tdr: u8,
    tdrs: u8,
    rdr: u8,
    rdrs: u8,

    tdre: bool,
    rdrf: bool,
    overrun: bool,
    modem: ModemStatus,
    irq: bool,

    line_tx_busy: bool,
    line_rx_busy: bool,
    last_tx_write_time: ClockValue,

    bytes_sent: u64,
    bytes_received: u64,
    overruns: u64,
}

impl Acia {
    pub fn new(id: AciaId, cpu_hz: u32) -> Self {
        let mut acia = Self {
            id,
            cpu_hz,
            control: ControlRegister::new(),
            clock_divide: id.reset_divide(),
            tx_irq_enabled: false,
            rx_irq_enabled: true,
            tdr: 0,
            tdrs: 0,
            rdr: 0,
            rdrs: 0,
            tdre: true,
            rdrf: false,
            overrun: false,
            modem: ModemStatus::default(),
            irq: false,
            line_tx_busy: false,
            line_rx_busy: false,
            last_tx_write_time: ClockValue::default(),
            bytes_sent: 0,
            bytes_received: 0,
            overruns: 0,
        };
        acia.set_control(ACIA_CR_RX_IRQ | id.reset_divide().bits());
        acia
    }

    pub fn id(&self) -> AciaId {
        self.id
    }

    /// Return the chip to its power-on state. Cancels any bytes in flight.
    pub fn reset(&mut self, agenda: &mut Agenda) {
        let id = self.id;
        agenda.cancel_where(|e| {
            matches!(e,
                AgendaEvent::AciaTdrLoad(a)
                | AgendaEvent::AciaTxComplete(a)
                | AgendaEvent::AciaRxComplete(a) if *a == id)
        });

        *self = Self {
            modem: self.modem,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            overruns: self.overruns,
            ..Acia::new(self.id, self.cpu_hz)
        };
        log::debug!("ACIA {}: reset", self.id);
    }

    /// Decode a control register write.
    pub fn set_control(&mut self, value: u8) {
        self.control = ControlRegister::from_bytes([value]);
        self.clock_divide = CounterDivide::from_bits(self.control.divide());
        // Only the 01 pattern enables the transmit interrupt; 10 and 11 control RTS and break.
        self.tx_irq_enabled = self.control.tx_control() == 0b01;
        self.rx_irq_enabled = self.control.rx_irq();
        self.check_irq();
    }

    /// Recompute the interrupt output from current state. Idempotent.
    pub fn check_irq(&mut self) -> bool {
        let tx_irq = self.tx_irq_enabled && self.tdre;
        let rx_irq = self.rx_irq_enabled && (self.rdrf || self.overrun);
        self.irq = tx_irq || rx_irq;
        self.irq
    }

    pub fn irq(&self) -> bool {
        self.irq
    }

    pub fn control(&self) -> u8 {
        self.control.into_bytes()[0]
    }

    pub fn clock_divide(&self) -> CounterDivide {
        self.clock_divide
    }

    pub fn tx_irq_enabled(&self) -> bool {
        self.tx_irq_enabled
    }

    pub fn rx_irq_enabled(&self) -> bool {
        self.rx_irq_enabled
    }

    pub fn line_tx_busy(&self) -> bool {
        self.line_tx_busy
    }

    pub fn line_rx_busy(&self) -> bool {
        self.line_rx_busy
    }

    pub fn last_tx_write_time(&self) -> ClockValue {
        self.last_tx_write_time
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    pub fn set_modem_status(&mut self, status: ModemStatus) {
        self.modem = status;
    }

    /// Cycles for one bit on the wire at the current divide.
    pub fn bit_time(&self) -> i64 {
        scale_reference(ACIA_CYCLES_PER_CLOCK * self.clock_divide.factor(), self.cpu_hz)
    }

    pub fn transmission_time(&self) -> i64 {
        ACIA_BITS_PER_BYTE * self.bit_time()
    }

    pub fn status(&self) -> u8 {
        let mut sr = 0;
        if self.rdrf {
            sr |= ACIA_SR_RDRF;
        }
        if self.tdre {
            sr |= ACIA_SR_TDRE;
        }
        if self.modem.dcd {
            sr |= ACIA_SR_DCD;
        }
        if self.modem.cts {
            sr |= ACIA_SR_CTS;
        }
        if self.overrun {
            sr |= ACIA_SR_OVRN;
        }
        if self.irq {
            sr |= ACIA_SR_IRQ;
        }
        sr
    }

    pub fn write_control(&mut self, value: u8, agenda: &mut Agenda) {
        log::trace!("ACIA {}: control write: {:02X}", self.id, value);
        if value & ACIA_CR_MASTER_RESET == ACIA_CR_MASTER_RESET {
            self.reset(agenda);
            return;
        }
        self.set_control(value);
    }

    /// CPU write to the transmit data register.
    pub fn write_data(&mut self, value: u8, agenda: &mut Agenda, now: ClockValue) {
        log::trace!("ACIA {}: TDR write: {:02X}", self.id, value);
        self.tdr = value;
        self.tdre = false;
        self.last_tx_write_time = now;
        self.check_irq();

        if !self.line_tx_busy && !agenda.is_pending(AgendaEvent::AciaTdrLoad(self.id)) {
            // The byte reaches the shift register on the next bit clock.
            agenda.schedule(AgendaEvent::AciaTdrLoad(self.id), now, self.bit_time(), 0);
        }
    }

    /// CPU read of the receive data register.
    pub fn read_data(&mut self) -> u8 {
        self.rdrf = false;
        self.overrun = false;
        self.check_irq();
        self.rdr
    }

    /// Move the holding register into the shift register and start it on the wire.
    pub fn transmit_tdr(&mut self, agenda: &mut Agenda, now: ClockValue) {
        self.tdrs = self.tdr;
        self.tdre = true;
        self.check_irq();
        self.line_tx_busy = true;
        agenda.schedule(AgendaEvent::AciaTxComplete(self.id), now, self.transmission_time(), 0);
    }

    /// The shift register has finished. Returns the byte that left the chip.
    pub fn tx_complete(&mut self, agenda: &mut Agenda, now: ClockValue) -> u8 {
        self.line_tx_busy = false;
        self.bytes_sent += 1;
        let sent = self.tdrs;
        log::trace!("ACIA {}: byte sent: {:02X}", self.id, sent);
        if !self.tdre {
            // Another byte was written while this one was shifting out.
            self.transmit_tdr(agenda, now);
        }
        sent
    }

    /// Start receiving the next byte from `port` if the rx line is idle.
    /// Returns true if a byte started arriving.
    pub fn poll_port(&mut self, port: &mut dyn SerialPort, agenda: &mut Agenda, now: ClockValue) -> bool {
        self.modem = port.modem_status();
        if self.line_rx_busy || !port.are_bytes_to_read() {
            return false;
        }
        self.rdrs = port.read_byte();
        port.next_byte();
        self.line_rx_busy = true;
        agenda.schedule(AgendaEvent::AciaRxComplete(self.id), now, self.transmission_time(), 0);
        true
    }

    /// The byte on the rx line has been fully shifted in.
    pub fn rx_complete(&mut self) {
        self.line_rx_busy = false;
        if self.rdrf {
            log::warn!("ACIA {}: overrun, byte {:02X} lost", self.id, self.rdrs);
            self.overrun = true;
            self.overruns += 1;
        }
        else {
            self.rdr = self.rdrs;
            self.rdrf = true;
            self.bytes_received += 1;
            log::trace!("ACIA {}: byte received: {:02X}", self.id, self.rdr);
        }
        self.check_irq();
    }
}
