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

    devices::glue.rs

    Video timing from the GLUE chip: horizontal and vertical blank interrupts
    paced by the selected video mode.
*/

use crate::{
    agenda::{Agenda, AgendaEvent},
    clock::{scale_reference, ClockValue, CPU_HZ_REFERENCE},
    machine_types::VideoMode,
};

pub struct Glue {
    mode: VideoMode,
    cpu_hz: u32,
    scanline: u32,
    frame: u64,
    hbl_pending: bool,
    vbl_pending: bool,
}

impl Glue {
    pub fn new(mode: VideoMode, cpu_hz: u32) -> Self {
        Self {
            mode,
            cpu_hz,
            scanline: 0,
            frame: 0,
            hbl_pending: false,
            vbl_pending: false,
        }
    }

    pub fn reset(&mut self, agenda: &mut Agenda) {
        agenda.cancel(AgendaEvent::HBlank);
        agenda.cancel(AgendaEvent::VBlank);
        self.scanline = 0;
        self.frame = 0;
        self.hbl_pending = false;
        self.vbl_pending = false;
    }

    pub fn mode(&self) -> VideoMode {
        self.mode
    }

    pub fn scanline(&self) -> u32 {
        self.scanline
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn hbl_pending(&self) -> bool {
        self.hbl_pending
    }

    pub fn vbl_pending(&self) -> bool {
        self.vbl_pending
    }

    pub fn cycles_per_line(&self) -> i64 {
        scale_reference(self.mode.cycles_per_line(), self.cpu_hz).max(1)
    }

    pub fn cycles_per_frame(&self) -> i64 {
        self.cycles_per_line() * self.mode.lines_per_frame() as i64
    }

    pub fn hbls_per_second(&self) -> u32 {
        (CPU_HZ_REFERENCE as i64 / self.mode.cycles_per_line()) as u32
    }

    /// Begin generating blanking interrupts from `now`.
    pub fn start(&mut self, agenda: &mut Agenda, now: ClockValue) {
        agenda.schedule(AgendaEvent::HBlank, now, self.cycles_per_line(), 0);
        agenda.schedule(AgendaEvent::VBlank, now, self.cycles_per_frame(), 0);
    }

    /// Change video mode. Timing restarts at the top of a frame.
    pub fn set_mode(&mut self, mode: VideoMode, agenda: &mut Agenda, now: ClockValue) {
        if mode == self.mode {
            return;
        }
        log::debug!("GLUE: video mode {:?} -> {:?}", self.mode, mode);
        self.mode = mode;
        self.scanline = 0;
        self.start(agenda, now);
    }

    /// End of a scanline. Returns true; the HBL line is asserted until acknowledged.
    pub fn hblank(&mut self, agenda: &mut Agenda, now: ClockValue) -> bool {
        self.scanline = (self.scanline + 1) % self.mode.lines_per_frame();
        self.hbl_pending = true;
        agenda.schedule(AgendaEvent::HBlank, now, self.cycles_per_line(), 0);
        true
    }

    pub fn vblank(&mut self, agenda: &mut Agenda, now: ClockValue) -> bool {
        self.frame += 1;
        self.scanline = 0;
        self.vbl_pending = true;
        agenda.schedule(AgendaEvent::VBlank, now, self.cycles_per_frame(), 0);
        log::trace!("GLUE: frame {}", self.frame);
        true
    }

    pub fn acknowledge_hbl(&mut self) {
        self.hbl_pending = false;
    }

    pub fn acknowledge_vbl(&mut self) {
        self.vbl_pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_until(glue: &mut Glue, agenda: &mut Agenda, until: ClockValue) -> (u32, u32) {
        let mut hbls = 0;
        let mut vbls = 0;
        while let Some(entry) = agenda.pop_due(until) {
            match entry.event {
                AgendaEvent::HBlank => {
                    glue.hblank(agenda, entry.fire_time);
                    hbls += 1;
                }
                AgendaEvent::VBlank => {
                    glue.vblank(agenda, entry.fire_time);
                    vbls += 1;
                }
                _ => unreachable!(),
            }
        }
        (hbls, vbls)
    }

    #[test]
    fn test_pal_frame() {
        let mut agenda = Agenda::new();
        let mut glue = Glue::new(VideoMode::Pal, CPU_HZ_REFERENCE);
        let t0 = ClockValue::new(0);
        glue.start(&mut agenda, t0);

        let frame = glue.cycles_per_frame();
        assert_eq!(frame, 512 * 313);
        let (hbls, vbls) = run_until(&mut glue, &mut agenda, t0 + frame);
        assert_eq!(hbls, 313);
        assert_eq!(vbls, 1);
        assert_eq!(glue.frame(), 1);
        assert!(glue.vbl_pending());

        glue.acknowledge_vbl();
        assert!(!glue.vbl_pending());
        assert_eq!(glue.hbls_per_second(), 15625);
    }

    #[test]
    fn test_scaled_clock_and_mode_change() {
        let mut agenda = Agenda::new();
        let mut glue = Glue::new(VideoMode::Ntsc, 16_000_000);
        assert_eq!(glue.cycles_per_line(), 1016);

        let t0 = ClockValue::new(500);
        glue.start(&mut agenda, t0);
        glue.set_mode(VideoMode::Mono, &mut agenda, t0);
        assert_eq!(agenda.fire_time(AgendaEvent::HBlank), Some(t0 + 448));
        assert_eq!(agenda.fire_time(AgendaEvent::VBlank), Some(t0 + 448 * 501));
        assert_eq!(agenda.len(), 2);

        glue.reset(&mut agenda);
        assert!(agenda.is_empty());
    }
}
