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

    machine_types.rs

    This module manages machine-related type definitions.
*/

use serde_derive::Deserialize;
use std::str::FromStr;

/// Video timing the glue chip generates. Each mode fixes the scanline length and the number
/// of scanlines per frame.
#[derive(Copy, Clone, Debug, Default, Deserialize, Hash, Eq, PartialEq)]
pub enum VideoMode {
    #[default]
    Pal,
    Ntsc,
    Mono,
}

impl FromStr for VideoMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String>
    where
        Self: Sized,
    {
        match s.to_lowercase().as_str() {
            "pal" | "50" | "50hz" => Ok(VideoMode::Pal),
            "ntsc" | "60" | "60hz" => Ok(VideoMode::Ntsc),
            "mono" | "71" | "71hz" => Ok(VideoMode::Mono),
            _ => Err("Bad value for video".to_string()),
        }
    }
}

impl VideoMode {
    /// Scanline length in cycles at the 8MHz reference clock.
    pub fn cycles_per_line(&self) -> i64 {
        match self {
            VideoMode::Pal => 512,
            VideoMode::Ntsc => 508,
            VideoMode::Mono => 224,
        }
    }

    pub fn lines_per_frame(&self) -> u32 {
        match self {
            VideoMode::Pal => 313,
            VideoMode::Ntsc => 263,
            VideoMode::Mono => 501,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_mode_from_str() {
        assert_eq!("PAL".parse::<VideoMode>(), Ok(VideoMode::Pal));
        assert_eq!("60hz".parse::<VideoMode>(), Ok(VideoMode::Ntsc));
        assert_eq!("mono".parse::<VideoMode>(), Ok(VideoMode::Mono));
        assert!("secam".parse::<VideoMode>().is_err());
    }

    #[test]
    fn test_frame_lengths() {
        // 50Hz PAL: 512 * 313 cycles per frame at 8MHz.
        assert_eq!(VideoMode::Pal.cycles_per_line() * VideoMode::Pal.lines_per_frame() as i64, 160_256);
        assert_eq!(VideoMode::Mono.cycles_per_line() * VideoMode::Mono.lines_per_frame() as i64, 112_224);
    }
}
