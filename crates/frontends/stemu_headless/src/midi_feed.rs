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

    midi_feed.rs

    Streams a file into the MIDI input ring from its own thread, the way a
    host MIDI driver would.
*/

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use stemu_core::circular_buffer::CircularBuffer;

const FEED_CHUNK: usize = 64;
const FEED_WAIT: Duration = Duration::from_millis(1);

pub struct MidiFeeder {
    stop_tx: Sender<()>,
    handle:  JoinHandle<usize>,
}

impl MidiFeeder {
    /// Start feeding `data` into `ring`. The thread waits whenever the ring is more than half
    /// full and exits when the data runs out or it is told to stop.
    pub fn start(ring: Arc<CircularBuffer>, data: Vec<u8>) -> Self {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let handle = thread::spawn(move || feed(ring, data, stop_rx));
        Self { stop_tx, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the thread and return the number of bytes it delivered.
    pub fn stop(self) -> usize {
        // The thread may already be gone, in which case nobody is listening.
        _ = self.stop_tx.send(());
        match self.handle.join() {
            Ok(fed) => fed,
            Err(_) => {
                log::error!("MIDI feeder thread panicked");
                0
            }
        }
    }
}

fn feed(ring: Arc<CircularBuffer>, data: Vec<u8>, stop_rx: Receiver<()>) -> usize {
    let mut fed = 0;
    let half = ring.size() / 2;
    let mut chunks = data.chunks(FEED_CHUNK.min(half.max(1)));
    let mut pending = chunks.next();

    while let Some(chunk) = pending {
        match stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }
        if ring.len() + chunk.len() > half {
            thread::sleep(FEED_WAIT);
            continue;
        }
        match ring.add_bytes(chunk) {
            Ok(_) => {
                fed += chunk.len();
                pending = chunks.next();
            }
            Err(e) => {
                log::error!("MIDI feeder: {}", e);
                break;
            }
        }
    }
    log::debug!("MIDI feeder: delivered {} of {} bytes", fed, data.len());
    fed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feeds_everything_to_a_draining_reader() {
        let ring = Arc::new(CircularBuffer::new(32).unwrap());
        let data: Vec<u8> = (0..=255).collect();
        let feeder = MidiFeeder::start(ring.clone(), data.clone());

        let mut received = Vec::new();
        while received.len() < data.len() {
            match ring.pop_byte() {
                Some(b) => received.push(b),
                None => thread::yield_now(),
            }
        }
        assert_eq!(feeder.stop(), data.len());
        assert_eq!(received, data);
    }

    #[test]
    fn test_stop_while_waiting() {
        let ring = Arc::new(CircularBuffer::new(16).unwrap());
        let feeder = MidiFeeder::start(ring.clone(), vec![0x90; 1000]);
        // Nobody drains the ring, so the feeder stalls at half full until stopped.
        while ring.len() < 8 {
            thread::yield_now();
        }
        assert!(!feeder.is_finished());
        assert_eq!(feeder.stop(), 8);
    }
}
