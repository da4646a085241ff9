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

    agenda.rs

    Cycle-exact event scheduler. Chips schedule future work here and the
    machine fires it as the master clock passes each entry's fire time.
*/

use std::fmt;

use crate::{
    clock::ClockValue,
    devices::{acia::AciaId, floppy_drive::DriveId},
};

/// The identity of a scheduled event. At most one entry per identity is pending at a time.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AgendaEvent {
    AciaTdrLoad(AciaId),
    AciaTxComplete(AciaId),
    AciaRxPoll(AciaId),
    AciaRxComplete(AciaId),
    FloppyIndexPulse(DriveId),
    FloppyTransfer(DriveId),
    AcsiComplete(u8),
    HBlank,
    VBlank,
}

impl fmt::Display for AgendaEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgendaEvent::AciaTdrLoad(id) => write!(f, "{} ACIA TDR load", id),
            AgendaEvent::AciaTxComplete(id) => write!(f, "{} ACIA tx complete", id),
            AgendaEvent::AciaRxPoll(id) => write!(f, "{} ACIA rx poll", id),
            AgendaEvent::AciaRxComplete(id) => write!(f, "{} ACIA rx complete", id),
            AgendaEvent::FloppyIndexPulse(id) => write!(f, "drive {} index pulse", id),
            AgendaEvent::FloppyTransfer(id) => write!(f, "drive {} transfer", id),
            AgendaEvent::AcsiComplete(dev) => write!(f, "ACSI device {} complete", dev),
            AgendaEvent::HBlank => write!(f, "HBL"),
            AgendaEvent::VBlank => write!(f, "VBL"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AgendaEntry {
    pub event: AgendaEvent,
    pub fire_time: ClockValue,
    pub param: i32,
}

/// Pending events, kept in scheduling order. The agenda is short (one entry per identity),
/// so due entries are found by scanning rather than by keeping the list sorted.
#[derive(Default)]
pub struct Agenda {
    entries: Vec<AgendaEntry>,
}

impl Agenda {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(32),
        }
    }

    /// Install or replace the entry for `event`, firing `delay` cycles after `now`.
    /// A delay of zero or less fires the next time the agenda is polled.
    pub fn schedule(&mut self, event: AgendaEvent, now: ClockValue, delay: i64, param: i32) -> ClockValue {
        let fire_time = now + delay;
        self.schedule_at(event, fire_time, param);
        fire_time
    }

    pub fn schedule_at(&mut self, event: AgendaEvent, fire_time: ClockValue, param: i32) {
        self.remove_entry(event);
        log::trace!("Agenda: scheduling {} at {}", event, fire_time);
        self.entries.push(AgendaEntry {
            event,
            fire_time,
            param,
        });
    }

    /// Remove the pending entry for `event`. Returns false if nothing was pending.
    pub fn cancel(&mut self, event: AgendaEvent) -> bool {
        let removed = self.remove_entry(event);
        if removed {
            log::trace!("Agenda: cancelled {}", event);
        }
        removed
    }

    /// Remove every pending entry whose identity matches `pred`.
    pub fn cancel_where<F: Fn(&AgendaEvent) -> bool>(&mut self, pred: F) {
        self.entries.retain(|e| !pred(&e.event));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_pending(&self, event: AgendaEvent) -> bool {
        self.entries.iter().any(|e| e.event == event)
    }

    pub fn fire_time(&self, event: AgendaEvent) -> Option<ClockValue> {
        self.entries.iter().find(|e| e.event == event).map(|e| e.fire_time)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &AgendaEntry> {
        self.entries.iter()
    }

    /// The earliest pending fire time, relative to `now`.
    pub fn next_due(&self, now: ClockValue) -> Option<ClockValue> {
        self.entries
            .iter()
            .min_by_key(|e| e.fire_time.diff(now))
            .map(|e| e.fire_time)
    }

    /// Remove and return the earliest entry with `fire_time <= now`. Among entries due at the
    /// same time the one scheduled first is returned, though callers must not rely on that.
    pub fn pop_due(&mut self, now: ClockValue) -> Option<AgendaEntry> {
        let mut best: Option<(usize, i64)> = None;
        for (i, entry) in self.entries.iter().enumerate() {
            let lateness = now.diff(entry.fire_time);
            if lateness < 0 {
                continue;
            }
            match best {
                Some((_, best_lateness)) if best_lateness >= lateness => {}
                _ => best = Some((i, lateness)),
            }
        }
        best.map(|(i, _)| self.entries.remove(i))
    }

    /// Fire every entry due at or before `now`, earliest first. The handler may schedule and
    /// cancel entries; the scan restarts after every fire so new earlier entries are honored.
    pub fn advance<F>(&mut self, now: ClockValue, mut handler: F) -> usize
    where
        F: FnMut(&mut Agenda, AgendaEntry),
    {
        let mut fired = 0;
        while let Some(entry) = self.pop_due(now) {
            log::trace!("Agenda: firing {} (due {}, now {})", entry.event, entry.fire_time, now);
            handler(self, entry);
            fired += 1;
        }
        fired
    }

    fn remove_entry(&mut self, event: AgendaEvent) -> bool {
        match self.entries.iter().position(|e| e.event == event) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: ClockValue = ClockValue::new(1000);

    #[test]
    fn test_event_display() {
        assert_eq!(AgendaEvent::AciaRxPoll(AciaId::Midi).to_string(), "Midi ACIA rx poll");
        assert_eq!(AgendaEvent::FloppyTransfer(DriveId::B).to_string(), "drive B transfer");
        assert_eq!(AgendaEvent::AcsiComplete(3).to_string(), "ACSI device 3 complete");
        assert_eq!(AgendaEvent::VBlank.to_string(), "VBL");
    }

    #[test]
    fn test_schedule_replaces() {
        let mut agenda = Agenda::new();
        agenda.schedule(AgendaEvent::HBlank, T0, 100, 1);
        agenda.schedule(AgendaEvent::HBlank, T0, 300, 2);

        assert_eq!(agenda.len(), 1);
        assert_eq!(agenda.fire_time(AgendaEvent::HBlank), Some(T0 + 300));

        let mut fired = Vec::new();
        agenda.advance(T0 + 200, |_, e| fired.push(e.param));
        assert!(fired.is_empty());
        agenda.advance(T0 + 300, |_, e| fired.push(e.param));
        assert_eq!(fired, vec![2]);
        assert!(agenda.is_empty());
    }

    #[test]
    fn test_cancel_missing_is_noop() {
        let mut agenda = Agenda::new();
        assert!(!agenda.cancel(AgendaEvent::VBlank));
        agenda.schedule(AgendaEvent::VBlank, T0, 10, 0);
        assert!(agenda.cancel(AgendaEvent::VBlank));
        assert!(!agenda.is_pending(AgendaEvent::VBlank));
        assert_eq!(agenda.advance(T0 + 100, |_, _| panic!("cancelled entry fired")), 0);
    }

    #[test]
    fn test_fires_in_time_order() {
        let mut agenda = Agenda::new();
        agenda.schedule(AgendaEvent::AcsiComplete(2), T0, 30, 2);
        agenda.schedule(AgendaEvent::AcsiComplete(0), T0, 10, 0);
        agenda.schedule(AgendaEvent::AcsiComplete(3), T0, 40, 3);
        agenda.schedule(AgendaEvent::AcsiComplete(1), T0, 20, 1);

        let mut order = Vec::new();
        let fired = agenda.advance(T0 + 30, |_, e| order.push(e.param));
        assert_eq!(fired, 3);
        assert_eq!(order, vec![0, 1, 2]);
        assert!(agenda.is_pending(AgendaEvent::AcsiComplete(3)));
    }

    #[test]
    fn test_zero_and_negative_delay_fire_on_next_poll() {
        let mut agenda = Agenda::new();
        agenda.schedule(AgendaEvent::HBlank, T0, 0, 0);
        agenda.schedule(AgendaEvent::VBlank, T0, -50, 0);
        assert_eq!(agenda.advance(T0, |_, _| {}), 2);
    }

    #[test]
    fn test_handler_schedules_earlier_entry() {
        let mut agenda = Agenda::new();
        agenda.schedule(AgendaEvent::HBlank, T0, 10, 0);
        agenda.schedule(AgendaEvent::VBlank, T0, 50, 0);

        let mut order = Vec::new();
        agenda.advance(T0 + 100, |agenda, e| {
            order.push((e.event, e.fire_time));
            if e.event == AgendaEvent::HBlank {
                // Due before the pending VBlank; must fire ahead of it.
                agenda.schedule(AgendaEvent::AcsiComplete(0), e.fire_time, 5, 0);
            }
        });

        assert_eq!(
            order,
            vec![
                (AgendaEvent::HBlank, T0 + 10),
                (AgendaEvent::AcsiComplete(0), T0 + 15),
                (AgendaEvent::VBlank, T0 + 50),
            ]
        );
    }

    #[test]
    fn test_wraparound_ordering() {
        let now = ClockValue::new(i64::MAX - 20);
        let mut agenda = Agenda::new();
        agenda.schedule(AgendaEvent::VBlank, now, 40, 1);
        agenda.schedule(AgendaEvent::HBlank, now, 10, 0);

        let mut order = Vec::new();
        agenda.advance(now + 30, |_, e| order.push(e.param));
        assert_eq!(order, vec![0]);
        agenda.advance(now + 40, |_, e| order.push(e.param));
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn test_random_sequences_hold_invariants() {
        let events = [
            AgendaEvent::HBlank,
            AgendaEvent::VBlank,
            AgendaEvent::AcsiComplete(0),
            AgendaEvent::AcsiComplete(1),
            AgendaEvent::FloppyTransfer(DriveId::A),
            AgendaEvent::AciaTxComplete(AciaId::Midi),
        ];
        let mut seed: u32 = 0x1234_5678;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };

        let mut agenda = Agenda::new();
        let mut now = T0;
        for _ in 0..2000 {
            let r = next();
            let event = events[(r as usize >> 4) % events.len()];
            match r % 4 {
                0 | 1 => {
                    agenda.schedule(event, now, (r >> 8) as i64 % 200 - 20, 0);
                }
                2 => {
                    agenda.cancel(event);
                }
                _ => {
                    now = now + (r >> 8) as i64 % 100;
                    let mut last: Option<ClockValue> = None;
                    agenda.advance(now, |_, e| {
                        assert!(e.fire_time.is_at_or_before(now));
                        if let Some(last) = last {
                            assert!(last.is_at_or_before(e.fire_time));
                        }
                        last = Some(e.fire_time);
                    });
                    assert!(agenda.entries().all(|e| now.is_at_or_before(e.fire_time) && e.fire_time != now));
                }
            }
            for event in events.iter() {
                assert!(agenda.entries().filter(|e| e.event == *event).count() <= 1);
            }
        }
    }
}
