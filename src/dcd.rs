//! For reading the header of DCD trajectory files. This is the CHARMM/NAMD binary format,
//! also written by cpptraj's `trajout ... dcd`. We use the header to check a re-imaged trajectory
//! written on our behalf: that it parses, and how many frames and atoms it holds.
//!
//! Layout: Fortran unformatted records, each a payload sandwiched by its length as a 4-byte int.
//! The first record is 84 bytes: `CORD`, then 20 control ints. The second holds 80-byte
//! title lines, and the third the atom count. Frames follow.

use std::{
    fs::{self, File},
    io::{BufReader, Read},
    path::Path,
};

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};

use crate::error::{QaError, Result};

const HEADER_RECORD_LEN: u32 = 84;
const TITLE_LINE_LEN: usize = 80;
// Writers emit a handful of title lines; anything far beyond this is a corrupt length.
const MAX_TITLE_LINES: usize = 64;
const MAX_TITLE_RECORD_LEN: u32 = (4 + TITLE_LINE_LEN * MAX_TITLE_LINES) as u32;

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Endian {
    Little,
    Big,
}

#[derive(Clone, PartialEq, Debug)]
pub struct DcdHeader {
    pub endian: Endian,
    /// Number of frames, as recorded by the writer.
    pub n_frames: u32,
    /// Timestep of the first frame.
    pub first_step: i32,
    /// Timesteps between frames.
    pub save_interval: i32,
    /// AKMA time units (~48.9 fs).
    pub delta: f32,
    /// Each frame is preceded by a unit cell record.
    pub has_unit_cell: bool,
    pub n_atoms: u32,
    pub title: Vec<String>,
    /// Bytes before the first frame.
    pub header_len: u64,
}

impl DcdHeader {
    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        let mut marker = [0u8; 4];
        r.read_exact(&mut marker).map_err(dcd_err)?;

        if LittleEndian::read_u32(&marker) == HEADER_RECORD_LEN {
            read_after_marker::<LittleEndian, _>(r, Endian::Little)
        } else if BigEndian::read_u32(&marker) == HEADER_RECORD_LEN {
            read_after_marker::<BigEndian, _>(r, Endian::Big)
        } else {
            Err(QaError::Dcd("Not a CORD/DCD file".to_owned()))
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let f = File::open(path).map_err(|e| QaError::io(path, e))?;
        Self::read(&mut BufReader::new(f))
    }

    /// Load the header, and check that the file holds every frame it declares.
    pub fn load_complete(path: &Path) -> Result<Self> {
        let header = Self::load(path)?;
        let file_len = fs::metadata(path).map_err(|e| QaError::io(path, e))?.len();

        let on_disk = header.frames_on_disk(file_len);
        if on_disk == 0 || on_disk < header.n_frames as u64 {
            return Err(QaError::Dcd(format!(
                "Header lists {} frames; {on_disk} on disk",
                header.n_frames
            )));
        }
        Ok(header)
    }

    /// Bytes per frame: an optional unit cell record (6 doubles), then one record each for
    /// X, Y, and Z.
    pub fn frame_len(&self) -> u64 {
        let cell = if self.has_unit_cell { 4 + 48 + 4 } else { 0 };
        cell + 3 * (4 + 4 * self.n_atoms as u64 + 4)
    }

    /// Complete frames present in a file of this length. Can be less than `n_frames` if the
    /// writer was interrupted.
    pub fn frames_on_disk(&self, file_len: u64) -> u64 {
        let frame_len = self.frame_len();
        if frame_len == 0 {
            return 0;
        }
        file_len.saturating_sub(self.header_len) / frame_len
    }
}

fn dcd_err(e: std::io::Error) -> QaError {
    QaError::Dcd(e.to_string())
}

/// A record's payload, checking that both length markers agree. Lengths above `max_len` are
/// rejected before allocating.
fn read_record<B: ByteOrder, R: Read>(r: &mut R, max_len: u32) -> Result<Vec<u8>> {
    let len = r.read_u32::<B>().map_err(dcd_err)?;
    if len > max_len {
        return Err(QaError::Dcd(format!(
            "Record length {len} exceeds the maximum of {max_len}"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).map_err(dcd_err)?;

    let len_end = r.read_u32::<B>().map_err(dcd_err)?;
    if len_end != len {
        return Err(QaError::Dcd("Record length mismatch".to_owned()));
    }
    Ok(payload)
}

fn read_after_marker<B: ByteOrder, R: Read>(r: &mut R, endian: Endian) -> Result<DcdHeader> {
    let mut hdr = [0u8; HEADER_RECORD_LEN as usize];
    r.read_exact(&mut hdr).map_err(dcd_err)?;
    if &hdr[0..4] != b"CORD" {
        return Err(QaError::Dcd("Missing CORD signature".to_owned()));
    }
    if r.read_u32::<B>().map_err(dcd_err)? != HEADER_RECORD_LEN {
        return Err(QaError::Dcd("Corrupt header record".to_owned()));
    }

    let mut icntrl = [0i32; 20];
    for (i, item) in icntrl.iter_mut().enumerate() {
        let off = 4 + i * 4;
        *item = B::read_i32(&hdr[off..off + 4]);
    }

    // Delta sits in the 10th control slot, as a float.
    let delta = B::read_f32(&hdr[4 + 36..4 + 40]);

    let title_block = read_record::<B, _>(r, MAX_TITLE_RECORD_LEN)?;
    if title_block.len() < 4 {
        return Err(QaError::Dcd("Truncated title block".to_owned()));
    }
    let n_title = B::read_i32(&title_block[0..4]).max(0) as usize;
    let title = title_block[4..]
        .chunks(TITLE_LINE_LEN)
        .take(n_title)
        .map(|line| {
            String::from_utf8_lossy(line)
                .trim_end_matches(['\0', ' '])
                .to_owned()
        })
        .collect();

    let natom_block = read_record::<B, _>(r, 4)?;
    if natom_block.len() != 4 {
        return Err(QaError::Dcd("Unexpected NATOM block size".to_owned()));
    }
    let n_atoms = B::read_i32(&natom_block);
    if n_atoms < 0 || icntrl[0] < 0 {
        return Err(QaError::Dcd("Negative atom or frame count".to_owned()));
    }

    let header_len = (4 + HEADER_RECORD_LEN as u64 + 4)
        + (4 + title_block.len() as u64 + 4)
        + (4 + 4 + 4);

    Ok(DcdHeader {
        endian,
        n_frames: icntrl[0] as u32,
        first_step: icntrl[1],
        save_interval: icntrl[2],
        delta,
        has_unit_cell: icntrl[10] != 0,
        n_atoms: n_atoms as u32,
        title,
        header_len,
    })
}
