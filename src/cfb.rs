// SPDX-License-Identifier: MIT

//! Compound File Binary format MS-CFB
//!
//! The legacy `.xls` container is a small filesystem: a header, a FAT
//! describing sector chains, a directory tree, and a mini-FAT for
//! streams shorter than 4096 bytes. Everything here operates on the
//! file bytes already held in memory.

use encoding_rs::{Encoding, UTF_16LE, UTF_8};
use log::{debug, warn};

use crate::utils::{read_u16, read_u32, read_u64, read_usize};

const ENDOFCHAIN: u32 = 0xFFFF_FFFE;
const FREESECT: u32 = 0xFFFF_FFFF;
const RESERVED_SECTORS: u32 = 0xFFFF_FFFA;

/// A Cfb specific error enum
#[derive(Debug)]
pub enum CfbError {
    /// Invalid OLE signature
    Ole,
    /// Empty root directory
    EmptyRootDir,
    /// Stream not found within directories
    StreamNotFound(String),
    /// Invalid value found in the header
    Invalid {
        /// Name of the field
        name: &'static str,
        /// Expected value
        expected: &'static str,
        /// Found value
        found: u16,
    },
    /// Codepage is not implemented
    CodePageNotFound(u16),
}

impl std::fmt::Display for CfbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CfbError::Ole => write!(f, "Invalid OLE signature (not an office document?)"),
            CfbError::EmptyRootDir => write!(f, "Empty Root directory"),
            CfbError::StreamNotFound(name) => write!(f, "Cannot find {name} stream"),
            CfbError::Invalid {
                name,
                expected,
                found,
            } => write!(f, "Invalid {name}, expecting {expected} found {found:X}"),
            CfbError::CodePageNotFound(cp) => write!(f, "Codepage {cp:X} not found"),
        }
    }
}

impl std::error::Error for CfbError {}

/// A struct for managing Compound File Binary format
#[derive(Debug, Clone)]
pub struct Cfb {
    directories: Vec<Directory>,
    sectors: Sectors,
    fats: Vec<u32>,
    mini_sectors: Sectors,
    mini_fats: Vec<u32>,
}

impl Cfb {
    /// Parses the header, FAT, directory tree and mini stream of a
    /// compound file held in `data`.
    pub fn new(data: &[u8]) -> Result<Cfb, CfbError> {
        let (h, mut difat) = Header::parse(data)?;
        let body = data.get(h.sector_size..).unwrap_or_default().to_vec();
        let sectors = Sectors::new(h.sector_size, body);

        // walk the DIFAT chain, present only when the FAT exceeds 109 sectors
        debug!("load difat");
        let max_sectors = data.len() / h.sector_size + 1;
        let mut sector_id = h.difat_start;
        let mut seen = 0usize;
        while sector_id < RESERVED_SECTORS {
            seen += 1;
            if seen > max_sectors {
                warn!("difat chain does not terminate");
                break;
            }
            difat.extend(sectors.get(sector_id).chunks_exact(4).map(read_u32));
            sector_id = match difat.pop() {
                Some(id) => id,
                None => break,
            };
        }

        debug!("load fat");
        let mut fats = Vec::with_capacity(h.fat_len * (h.sector_size / 4));
        for id in difat.into_iter().filter(|id| *id != FREESECT) {
            fats.extend(sectors.get(id).chunks_exact(4).map(read_u32));
        }

        debug!("load directories");
        let dirs = sectors.get_chain(h.dir_start, &fats, h.dir_len * h.sector_size);
        let dirs = dirs
            .chunks(128)
            .filter(|c| c.len() == 128)
            .map(|c| Directory::from_slice(c, h.sector_size))
            .collect::<Vec<_>>();
        if dirs.is_empty() || (h.version != 3 && dirs[0].start == ENDOFCHAIN) {
            return Err(CfbError::EmptyRootDir);
        }

        // the root entry's stream is the backing store for mini sectors
        debug!("load minis");
        let ministream = sectors.get_chain(dirs[0].start, &fats, dirs[0].len);
        let minifat = sectors.get_chain(h.mini_fat_start, &fats, h.mini_fat_len * h.sector_size);
        let mini_fats = minifat.chunks_exact(4).map(read_u32).collect();
        Ok(Cfb {
            directories: dirs,
            sectors,
            fats,
            mini_sectors: Sectors::new(64, ministream),
            mini_fats,
        })
    }

    /// Checks if a directory entry with this name exists
    pub fn has_directory(&self, name: &str) -> bool {
        self.directories.iter().any(|d| d.name == name)
    }

    /// Gets a stream by name out of directories
    pub fn get_stream(&self, name: &str) -> Result<Vec<u8>, CfbError> {
        match self.directories.iter().find(|d| d.name == name) {
            None => Err(CfbError::StreamNotFound(name.to_string())),
            Some(d) if d.len < 4096 => {
                Ok(self.mini_sectors.get_chain(d.start, &self.mini_fats, d.len))
            }
            Some(d) => Ok(self.sectors.get_chain(d.start, &self.fats, d.len)),
        }
    }
}

/// A hidden struct which defines cfb files structure
#[derive(Debug)]
struct Header {
    version: u16,
    sector_size: usize,
    dir_len: usize,
    dir_start: u32,
    fat_len: usize,
    mini_fat_len: usize,
    mini_fat_start: u32,
    difat_start: u32,
}

impl Header {
    fn parse(data: &[u8]) -> Result<(Header, Vec<u32>), CfbError> {
        if data.len() < 512 || read_u64(data) != 0xE11A_B1A1_E011_CFD0 {
            return Err(CfbError::Ole);
        }

        let version = read_u16(&data[26..28]);
        let sector_size = match read_u16(&data[30..32]) {
            0x0009 => 512,
            0x000C => 4096,
            s => {
                return Err(CfbError::Invalid {
                    name: "sector shift",
                    expected: "0x09 or 0x0C",
                    found: s,
                })
            }
        };
        if read_u16(&data[32..34]) != 0x0006 {
            return Err(CfbError::Invalid {
                name: "minisector shift",
                expected: "0x06",
                found: read_u16(&data[32..34]),
            });
        }

        let dir_len = read_usize(&data[40..44]);
        let fat_len = read_usize(&data[44..48]);
        let dir_start = read_u32(&data[48..52]);
        let mini_fat_start = read_u32(&data[60..64]);
        let mini_fat_len = read_usize(&data[64..68]);
        let difat_start = read_u32(&data[68..72]);
        let difat_len = read_usize(&data[72..76]);

        // the first 109 FAT sector ids live in the header itself
        let mut difat = Vec::with_capacity(109 + difat_len * (sector_size / 4));
        difat.extend(data[76..512].chunks_exact(4).map(read_u32));

        Ok((
            Header {
                version,
                sector_size,
                dir_len,
                fat_len,
                dir_start,
                mini_fat_len,
                mini_fat_start,
                difat_start,
            },
            difat,
        ))
    }
}

/// Fixed-size sector access over a contiguous byte buffer
#[derive(Debug, Clone)]
struct Sectors {
    data: Vec<u8>,
    size: usize,
}

impl Sectors {
    fn new(size: usize, data: Vec<u8>) -> Sectors {
        Sectors { data, size }
    }

    fn get(&self, id: u32) -> &[u8] {
        let start = (id as usize).saturating_mul(self.size).min(self.data.len());
        let end = (start + self.size).min(self.data.len());
        &self.data[start..end]
    }

    fn get_chain(&self, mut sector_id: u32, fats: &[u32], len: usize) -> Vec<u8> {
        let mut chain = Vec::with_capacity(len);
        let mut seen = 0usize;
        while sector_id < RESERVED_SECTORS {
            seen += 1;
            if seen > fats.len() {
                warn!("sector chain does not terminate");
                break;
            }
            chain.extend_from_slice(self.get(sector_id));
            sector_id = match fats.get(sector_id as usize) {
                Some(next) => *next,
                None => break,
            };
        }
        if len > 0 {
            chain.truncate(len);
        }
        chain
    }
}

/// A directory entry: a named stream and its first sector
#[derive(Debug, Clone)]
struct Directory {
    name: String,
    start: u32,
    len: usize,
}

impl Directory {
    fn from_slice(buf: &[u8], sector_size: usize) -> Directory {
        let mut name = UTF_16LE.decode(&buf[..64]).0.into_owned();
        if let Some(l) = name.as_bytes().iter().position(|b| *b == 0) {
            name.truncate(l);
        }
        let start = read_u32(&buf[116..120]);
        let len = if sector_size == 512 {
            read_u32(&buf[120..124]) as usize
        } else {
            read_u64(&buf[120..128]) as usize
        };

        Directory { name, start, len }
    }
}

/// Byte-string decoding as configured by the workbook's CodePage record.
///
/// BIFF8 strings carry a per-string flag choosing between compressed
/// (high bytes stripped) and full UTF-16 storage; single-byte codepages
/// have no such flag.
#[derive(Clone)]
pub(crate) struct XlsEncoding {
    encoding: &'static Encoding,
    /// None for single byte encodings, per-string flag otherwise
    pub(crate) high_byte: Option<bool>,
}

impl XlsEncoding {
    pub(crate) fn from_codepage(codepage: u16) -> Result<XlsEncoding, CfbError> {
        let e = codepage::to_encoding(codepage).ok_or(CfbError::CodePageNotFound(codepage))?;
        let high_byte = if e == UTF_8 || e.is_single_byte() {
            None
        } else {
            Some(false)
        };
        Ok(XlsEncoding {
            encoding: e,
            high_byte,
        })
    }

    /// The BIFF8 default, used until a CodePage record says otherwise.
    pub(crate) fn utf16() -> XlsEncoding {
        XlsEncoding {
            encoding: UTF_16LE,
            high_byte: Some(false),
        }
    }

    pub(crate) fn decode_to(&self, stream: &[u8], len: usize, s: &mut String) {
        match self.high_byte {
            None => {
                let l = stream.len().min(len);
                s.push_str(&self.encoding.decode(&stream[..l]).0);
            }
            Some(false) => {
                // compressed storage: re-widen to UTF-16 before decoding
                let l = stream.len().min(len);
                let mut bytes = vec![0; l * 2];
                for (i, b) in stream.iter().take(l).enumerate() {
                    bytes[2 * i] = *b;
                }
                s.push_str(&self.encoding.decode(&bytes).0);
            }
            Some(true) => {
                let l = (stream.len() / 2).min(len);
                s.push_str(&self.encoding.decode(&stream[..2 * l]).0);
            }
        }
    }
}
