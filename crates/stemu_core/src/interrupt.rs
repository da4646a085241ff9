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

    interrupt.rs

    Interrupt lines raised by the peripheral core toward the CPU core.
*/

use strum_macros::{Display, EnumIter};

/// Named interrupt outputs. The keyboard and MIDI ACIAs are wire-ORed into a single MFP
/// input on real hardware; they are kept separate here and combined by [InterruptPins::acia].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum InterruptLine {
    KeyboardAcia,
    MidiAcia,
    /// Shared by the floppy controller and the ACSI bus.
    Disk,
    HBlank,
    VBlank,
}

impl InterruptLine {
    pub const COUNT: usize = 5;

    pub fn index(&self) -> usize {
        match self {
            InterruptLine::KeyboardAcia => 0,
            InterruptLine::MidiAcia => 1,
            InterruptLine::Disk => 2,
            InterruptLine::HBlank => 3,
            InterruptLine::VBlank => 4,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct InterruptPins {
    levels: [bool; InterruptLine::COUNT],
}

impl InterruptPins {
    /// Set a pin level. Returns true if the level changed.
    pub fn set(&mut self, line: InterruptLine, asserted: bool) -> bool {
        let level = &mut self.levels[line.index()];
        if *level == asserted {
            return false;
        }
        *level = asserted;
        true
    }

    pub fn get(&self, line: InterruptLine) -> bool {
        self.levels[line.index()]
    }

    /// Level of the combined ACIA input.
    pub fn acia(&self) -> bool {
        self.get(InterruptLine::KeyboardAcia) || self.get(InterruptLine::MidiAcia)
    }

    pub fn any(&self) -> bool {
        self.levels.iter().any(|l| *l)
    }

    pub fn clear(&mut self) {
        self.levels = [false; InterruptLine::COUNT];
    }
}
