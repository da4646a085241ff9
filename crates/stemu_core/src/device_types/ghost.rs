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

    device_types::ghost.rs

    Ghost disks record sector writes made to a write-protected floppy image,
    so changes survive without touching the original image.
*/

use std::{
    fs::File,
    io::{BufReader, BufWriter, ErrorKind, Read, Seek, Write},
    path::Path,
};

use anyhow::Context;
use binrw::{binrw, BinRead, BinWrite};
use fxhash::FxHashMap;

use crate::device_types::disk::{DiskError, SectorId};

pub const GHOST_VERSION: u16 = 0x0100;
pub const GHOST_MAX_RECORDS: usize = u16::MAX as usize;

/// CRC-CCITT as computed by the floppy controller over an ID address mark and field.
fn crc16_ccitt(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in bytes {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
    }
    crc
}

/// The six-byte ID field written ahead of every sector on the track.
#[binrw]
#[brw(big)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IdField {
    pub track:  u8,
    pub side:   u8,
    pub sector: u8,
    pub len:    u8,
    pub crc:    u16,
}

impl IdField {
    pub fn new(id: SectorId, size: usize) -> Self {
        let len = match size {
            0..=128 => 0,
            129..=256 => 1,
            257..=512 => 2,
            _ => 3,
        };
        let crc = crc16_ccitt(&[0xA1, 0xA1, 0xA1, 0xFE, id.track, id.side, id.sector, len]);
        Self {
            track: id.track,
            side: id.side,
            sector: id.sector,
            len,
            crc,
        }
    }

    pub fn sector_id(&self) -> SectorId {
        SectorId::new(self.side, self.track, self.sector)
    }

    pub fn sector_size(&self) -> usize {
        128 << (self.len & 0x03)
    }

    /// True if the stored CRC matches the one the controller would compute.
    pub fn crc_valid(&self) -> bool {
        IdField::new(self.sector_id(), self.sector_size()).crc == self.crc
    }
}

#[binrw]
#[brw(big, magic = b"SEC")]
struct GhostRecord {
    record: u16,
    id: IdField,
    #[br(count = id.sector_size())]
    data: Vec<u8>,
}

#[binrw]
#[brw(little, magic = b"STG\0")]
struct GhostFile {
    version: u16,
    #[br(temp)]
    #[bw(calc = records.len() as u16)]
    count: u16,
    #[br(count = count)]
    records: Vec<GhostRecord>,
}

fn bad_ghost_file(detail: String) -> DiskError {
    DiskError::Io(std::io::Error::new(ErrorKind::InvalidData, detail))
}

fn ghost_error(e: binrw::Error) -> DiskError {
    match e {
        binrw::Error::Io(e) => DiskError::Io(e),
        other => bad_ghost_file(format!("not a ghost disk file: {}", other)),
    }
}

#[derive(Default)]
pub struct GhostDisk {
    sectors: FxHashMap<SectorId, Vec<u8>>,
    dirty:   bool,
}

impl GhostDisk {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }

    /// True if the overlay holds unsaved writes.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn has_override(&self, id: SectorId) -> bool {
        self.sectors.contains_key(&id)
    }

    /// Copy the overridden sector into `buf`. Returns false if the sector was never written.
    pub fn read_sector(&self, id: SectorId, buf: &mut [u8]) -> bool {
        match self.sectors.get(&id) {
            Some(data) => {
                let len = buf.len().min(data.len());
                buf[..len].copy_from_slice(&data[..len]);
                true
            }
            None => false,
        }
    }

    pub fn write_sector(&mut self, id: SectorId, data: &[u8]) -> Result<(), DiskError> {
        if !self.sectors.contains_key(&id) && self.sectors.len() >= GHOST_MAX_RECORDS {
            return Err(DiskError::SectorNotFound(id));
        }
        log::trace!("GhostDisk: recording write to sector {}", id);
        self.sectors.insert(id, data.to_vec());
        self.dirty = true;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.sectors.clear();
        self.dirty = false;
    }

    pub fn save<W: Write + Seek>(&mut self, mut writer: W) -> Result<(), DiskError> {
        let mut ids: Vec<&SectorId> = self.sectors.keys().collect();
        ids.sort();

        let records = ids
            .into_iter()
            .enumerate()
            .map(|(record, id)| {
                let data = &self.sectors[id];
                let id = IdField::new(*id, data.len());
                let mut sector = vec![0u8; id.sector_size()];
                let len = data.len().min(sector.len());
                sector[..len].copy_from_slice(&data[..len]);
                GhostRecord {
                    record: record as u16,
                    id,
                    data: sector,
                }
            })
            .collect();

        let file = GhostFile {
            version: GHOST_VERSION,
            records,
        };
        file.write(&mut writer).map_err(ghost_error)?;
        writer.flush()?;
        self.dirty = false;
        Ok(())
    }

    pub fn load<R: Read + Seek>(mut reader: R) -> Result<Self, DiskError> {
        let file = GhostFile::read(&mut reader).map_err(ghost_error)?;
        if file.version != GHOST_VERSION {
            log::warn!("GhostDisk: unexpected version {:04X}", file.version);
        }

        let mut ghost = GhostDisk::new();
        for record in file.records {
            if !record.id.crc_valid() {
                return Err(bad_ghost_file(format!(
                    "bad ID field CRC {:04X} in record {}",
                    record.id.crc, record.record
                )));
            }
            ghost.sectors.insert(record.id.sector_id(), record.data);
        }
        log::debug!("GhostDisk: loaded {} sector records", ghost.len());
        Ok(ghost)
    }

    pub fn save_file<P: AsRef<Path>>(&mut self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| format!("Failed to create ghost disk: {}", path.display()))?;
        self.save(BufWriter::new(file))
            .with_context(|| format!("Failed to write ghost disk: {}", path.display()))
    }

    pub fn load_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open ghost disk: {}", path.display()))?;
        GhostDisk::load(BufReader::new(file)).with_context(|| format!("Failed to read ghost disk: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_id_field_crc() {
        // Track 0, side 0, sector 1, 512 bytes. Value as written by a WD1772.
        let field = IdField::new(SectorId::new(0, 0, 1), 512);
        assert_eq!(field.len, 2);
        assert_eq!(field.crc, 0xCA6F);
    }

    #[test]
    fn test_overlay_read_back() {
        let mut ghost = GhostDisk::new();
        let id = SectorId::new(0, 10, 4);
        assert!(!ghost.has_override(id));

        ghost.write_sector(id, &[0x42; 512]).unwrap();
        assert!(ghost.has_override(id));
        assert!(ghost.is_dirty());

        let mut buf = [0u8; 512];
        assert!(ghost.read_sector(id, &mut buf));
        assert!(buf.iter().all(|b| *b == 0x42));
        assert!(!ghost.read_sector(SectorId::new(1, 10, 4), &mut buf));
    }

    #[test]
    fn test_save_and_load() {
        let mut ghost = GhostDisk::new();
        ghost.write_sector(SectorId::new(1, 2, 3), &[0xAB; 512]).unwrap();
        ghost.write_sector(SectorId::new(0, 0, 1), &[0xCD; 512]).unwrap();

        let mut cursor = Cursor::new(Vec::new());
        ghost.save(&mut cursor).unwrap();
        assert!(!ghost.is_dirty());
        let file = cursor.into_inner();
        assert_eq!(&file[0..4], b"STG\0");
        assert_eq!(&file[4..8], &[0x00, 0x01, 0x02, 0x00]);
        assert_eq!(file.len(), 8 + 2 * (11 + 512));
        // Records are written in sector order.
        assert_eq!(&file[8..11], b"SEC");
        assert_eq!(&file[11..13], &[0x00, 0x00]);
        assert_eq!(&file[13..17], &[0, 0, 1, 2]);
        assert_eq!(&file[17..19], &[0xCA, 0x6F]);

        let loaded = GhostDisk::load(Cursor::new(file)).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(!loaded.is_dirty());
        let mut buf = [0u8; 512];
        assert!(loaded.read_sector(SectorId::new(1, 2, 3), &mut buf));
        assert_eq!(buf[511], 0xAB);
    }

    #[test]
    fn test_short_sector_is_padded() {
        let mut ghost = GhostDisk::new();
        ghost.write_sector(SectorId::new(0, 1, 1), &[0x11; 200]).unwrap();

        let mut cursor = Cursor::new(Vec::new());
        ghost.save(&mut cursor).unwrap();
        let file = cursor.into_inner();
        assert_eq!(file.len(), 8 + 11 + 256);

        let loaded = GhostDisk::load(Cursor::new(file)).unwrap();
        let mut buf = [0xFFu8; 256];
        assert!(loaded.read_sector(SectorId::new(0, 1, 1), &mut buf));
        assert_eq!(buf[199], 0x11);
        assert_eq!(buf[200], 0x00);
    }

    #[test]
    fn test_load_rejects_garbage() {
        assert!(GhostDisk::load(Cursor::new(b"NOTAGHOST".to_vec())).is_err());
    }

    #[test]
    fn test_load_rejects_bad_record_tag() {
        let mut ghost = GhostDisk::new();
        ghost.write_sector(SectorId::new(0, 0, 1), &[0; 512]).unwrap();
        let mut cursor = Cursor::new(Vec::new());
        ghost.save(&mut cursor).unwrap();
        let mut file = cursor.into_inner();
        file[8] = b'X';
        assert!(GhostDisk::load(Cursor::new(file)).is_err());
    }

    #[test]
    fn test_load_rejects_bad_id_crc() {
        let mut ghost = GhostDisk::new();
        ghost.write_sector(SectorId::new(0, 0, 1), &[0; 512]).unwrap();
        let mut cursor = Cursor::new(Vec::new());
        ghost.save(&mut cursor).unwrap();
        let mut file = cursor.into_inner();
        file[18] ^= 0xFF;

        match GhostDisk::load(Cursor::new(file)) {
            Err(DiskError::Io(e)) => assert_eq!(e.kind(), ErrorKind::InvalidData),
            _ => panic!("expected an InvalidData error"),
        }
    }

    #[test]
    fn test_load_truncated_file() {
        let mut ghost = GhostDisk::new();
        ghost.write_sector(SectorId::new(0, 0, 1), &[0; 512]).unwrap();
        let mut cursor = Cursor::new(Vec::new());
        ghost.save(&mut cursor).unwrap();
        let mut file = cursor.into_inner();
        file.truncate(100);
        assert!(GhostDisk::load(Cursor::new(file)).is_err());
    }
}
