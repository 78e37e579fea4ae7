// SPDX-License-Identifier: MIT

//! Internal module providing little-endian byte accessors

use byteorder::{ByteOrder, LittleEndian};

pub(crate) fn read_u16(s: &[u8]) -> u16 {
    LittleEndian::read_u16(s)
}

pub(crate) fn read_u32(s: &[u8]) -> u32 {
    LittleEndian::read_u32(s)
}

pub(crate) fn read_u64(s: &[u8]) -> u64 {
    LittleEndian::read_u64(s)
}

pub(crate) fn read_i32(s: &[u8]) -> i32 {
    LittleEndian::read_i32(s)
}

pub(crate) fn read_usize(s: &[u8]) -> usize {
    read_u32(s) as usize
}
