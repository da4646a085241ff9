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

    device_types::disk.rs

    Sector-level access to floppy disk images.
*/

use std::{
    fmt::{self, Display},
    fs::OpenOptions,
    io::{Cursor, Read, Seek, SeekFrom, Write},
    path::Path,
};

use anyhow::Context;
use thiserror::Error;

pub const DEFAULT_SECTOR_SIZE: usize = 512;
pub const DD_TRACK_BYTES: u32 = 6250;

/// Anything a disk image can be read from and written back to.
pub trait ImageStream: Read + Write + Seek + Send {}
impl<T: Read + Write + Seek + Send> ImageStream for T {}

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("no disk in drive")]
    NoDisk,
    #[error("sector {0} not found")]
    SectorNotFound(SectorId),
    #[error("disk is write protected")]
    WriteProtected,
    #[error("unrecognized image size: {0} bytes")]
    BadImageSize(u64),
    #[error("disk image I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Address of a sector as written in its ID field. Sector numbers start at 1.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectorId {
    pub side:   u8,
    pub track:  u8,
    pub sector: u8,
}

impl SectorId {
    pub fn new(side: u8, track: u8, sector: u8) -> Self {
        Self { side, track, sector }
    }
}

impl Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[s:{} t:{:2} n:{:2}]", self.side, self.track, self.sector)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DiskGeometry {
    pub sides: u8,
    pub tracks: u8,
    pub sectors_per_track: u8,
    pub sector_size: usize,
    pub track_bytes: u32,
}

impl Default for DiskGeometry {
    fn default() -> Self {
        Self {
            sides: 2,
            tracks: 80,
            sectors_per_track: 9,
            sector_size: DEFAULT_SECTOR_SIZE,
            track_bytes: DD_TRACK_BYTES,
        }
    }
}

impl Display for DiskGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[sides:{} tracks:{:2} spt:{:2} size:{}]",
            self.sides, self.tracks, self.sectors_per_track, self.sector_size
        )
    }
}

impl DiskGeometry {
    pub fn new(sides: u8, tracks: u8, sectors_per_track: u8) -> Self {
        Self {
            sides,
            tracks,
            sectors_per_track,
            sector_size: DEFAULT_SECTOR_SIZE,
            track_bytes: Self::track_bytes_for(sectors_per_track),
        }
    }

    /// Unformatted track length. Double density tracks hold 6250 bytes at 300 RPM; high and
    /// extra density scale with the data rate.
    fn track_bytes_for(sectors_per_track: u8) -> u32 {
        match sectors_per_track {
            0..=12 => DD_TRACK_BYTES,
            13..=24 => DD_TRACK_BYTES * 2,
            _ => DD_TRACK_BYTES * 4,
        }
    }

    /// Guess the layout of a flat sector image from its length.
    pub fn from_image_size(len: u64) -> Option<Self> {
        const TRACKS: [u8; 9] = [80, 81, 82, 83, 84, 85, 40, 41, 42];
        const SIDES: [u8; 2] = [2, 1];
        const SPT: [u8; 5] = [9, 10, 11, 18, 36];

        for tracks in TRACKS {
            for sides in SIDES {
                for spt in SPT {
                    let size = sides as u64 * tracks as u64 * spt as u64 * DEFAULT_SECTOR_SIZE as u64;
                    if size == len {
                        return Some(DiskGeometry::new(sides, tracks, spt));
                    }
                }
            }
        }
        None
    }

    pub fn total_sectors(&self) -> usize {
        self.sides as usize * self.tracks as usize * self.sectors_per_track as usize
    }

    pub fn image_size(&self) -> u64 {
        (self.total_sectors() * self.sector_size) as u64
    }

    pub fn contains(&self, id: SectorId) -> bool {
        id.side < self.sides && id.track < self.tracks && id.sector >= 1 && id.sector <= self.sectors_per_track
    }

    pub fn sector_offset(&self, id: SectorId) -> Option<u64> {
        if !self.contains(id) {
            return None;
        }
        let index = (id.track as u64 * self.sides as u64 + id.side as u64) * self.sectors_per_track as u64
            + (id.sector as u64 - 1);
        Some(index * self.sector_size as u64)
    }
}

/// Sector access to a mounted floppy image.
pub trait SectorImage: Send {
    fn name(&self) -> &str;
    fn geometry(&self) -> DiskGeometry;
    fn is_write_protected(&self) -> bool;
    fn read_sector(&mut self, id: SectorId, buf: &mut [u8]) -> Result<(), DiskError>;
    fn write_sector(&mut self, id: SectorId, buf: &[u8]) -> Result<(), DiskError>;

    fn sector_exists(&self, id: SectorId) -> bool {
        self.geometry().contains(id)
    }

    fn sector_size(&self, id: SectorId) -> Option<usize> {
        self.sector_exists(id).then(|| self.geometry().sector_size)
    }
}

/// A flat, sector-ordered image: track-major, then side, then sector.
pub struct RawSectorImage {
    name: String,
    stream: Box<dyn ImageStream>,
    geometry: DiskGeometry,
    write_protected: bool,
}

impl RawSectorImage {
    pub fn from_stream(
        name: &str,
        mut stream: Box<dyn ImageStream>,
        write_protected: bool,
    ) -> Result<Self, DiskError> {
        let len = stream.seek(SeekFrom::End(0))?;
        let geometry = DiskGeometry::from_image_size(len).ok_or(DiskError::BadImageSize(len))?;
        log::debug!("RawSectorImage: {} is {} bytes, geometry {}", name, len, geometry);
        Ok(Self {
            name: name.to_string(),
            stream,
            geometry,
            write_protected,
        })
    }

    pub fn from_bytes(name: &str, bytes: Vec<u8>, write_protected: bool) -> Result<Self, DiskError> {
        Self::from_stream(name, Box::new(Cursor::new(bytes)), write_protected)
    }

    /// Create a blank image of the given geometry.
    pub fn blank(name: &str, geometry: DiskGeometry) -> Result<Self, DiskError> {
        Self::from_bytes(name, vec![0; geometry.image_size() as usize], false)
    }

    pub fn open<P: AsRef<Path>>(path: P, write_protect: bool) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(!write_protect)
            .open(path)
            .with_context(|| format!("Failed to open floppy image: {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let image = Self::from_stream(&name, Box::new(file), write_protect)
            .with_context(|| format!("Failed to load floppy image: {}", path.display()))?;
        Ok(image)
    }
}

impl SectorImage for RawSectorImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn geometry(&self) -> DiskGeometry {
        self.geometry
    }

    fn is_write_protected(&self) -> bool {
        self.write_protected
    }

    fn read_sector(&mut self, id: SectorId, buf: &mut [u8]) -> Result<(), DiskError> {
        let offset = self.geometry.sector_offset(id).ok_or(DiskError::SectorNotFound(id))?;
        let len = buf.len().min(self.geometry.sector_size);
        self.stream.seek(SeekFrom::Start(offset))?;
        self.stream.read_exact(&mut buf[..len])?;
        Ok(())
    }

    fn write_sector(&mut self, id: SectorId, buf: &[u8]) -> Result<(), DiskError> {
        if self.write_protected {
            return Err(DiskError::WriteProtected);
        }
        let offset = self.geometry.sector_offset(id).ok_or(DiskError::SectorNotFound(id))?;
        let len = buf.len().min(self.geometry.sector_size);
        self.stream.seek(SeekFrom::Start(offset))?;
        self.stream.write_all(&buf[..len])?;
        self.stream.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned_image(geometry: DiskGeometry) -> Vec<u8> {
        (0..geometry.image_size() as usize)
            .map(|i| ((i / DEFAULT_SECTOR_SIZE) as u8) ^ (i as u8))
            .collect()
    }

    #[test]
    fn test_geometry_from_size() {
        assert_eq!(DiskGeometry::from_image_size(737_280), Some(DiskGeometry::new(2, 80, 9)));
        assert_eq!(DiskGeometry::from_image_size(368_640), Some(DiskGeometry::new(1, 80, 9)));
        assert_eq!(DiskGeometry::from_image_size(819_200), Some(DiskGeometry::new(2, 80, 10)));
        assert_eq!(DiskGeometry::from_image_size(1_474_560).map(|g| g.track_bytes), Some(12_500));
        assert_eq!(DiskGeometry::from_image_size(1000), None);
    }

    #[test]
    fn test_sector_offsets_interleave_sides() {
        let geometry = DiskGeometry::new(2, 80, 9);
        assert_eq!(geometry.sector_offset(SectorId::new(0, 0, 1)), Some(0));
        assert_eq!(geometry.sector_offset(SectorId::new(1, 0, 1)), Some(9 * 512));
        assert_eq!(geometry.sector_offset(SectorId::new(0, 1, 2)), Some(19 * 512));
        assert_eq!(geometry.sector_offset(SectorId::new(0, 0, 0)), None);
        assert_eq!(geometry.sector_offset(SectorId::new(0, 0, 10)), None);
        assert_eq!(geometry.sector_offset(SectorId::new(2, 0, 1)), None);
    }

    #[test]
    fn test_raw_image_read_write() {
        let geometry = DiskGeometry::new(2, 80, 9);
        let bytes = patterned_image(geometry);
        let mut image = RawSectorImage::from_bytes("TEST.ST", bytes.clone(), false).unwrap();

        let id = SectorId::new(1, 5, 3);
        let offset = geometry.sector_offset(id).unwrap() as usize;
        let mut buf = [0u8; 512];
        image.read_sector(id, &mut buf).unwrap();
        assert_eq!(&buf[..], &bytes[offset..offset + 512]);

        image.write_sector(id, &[0xE5; 512]).unwrap();
        image.read_sector(id, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0xE5));

        assert!(matches!(
            image.read_sector(SectorId::new(0, 90, 1), &mut buf),
            Err(DiskError::SectorNotFound(_))
        ));
    }

    #[test]
    fn test_write_protected_image() {
        let mut image = RawSectorImage::from_bytes("WP.ST", vec![0; 368_640], true).unwrap();
        assert!(matches!(
            image.write_sector(SectorId::new(0, 0, 1), &[0; 512]),
            Err(DiskError::WriteProtected)
        ));
        assert_eq!(image.sector_size(SectorId::new(0, 0, 1)), Some(512));
        assert_eq!(image.sector_size(SectorId::new(1, 0, 1)), None);
    }
}
