// Copyright 2018-2026 wstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The binary frame format of conflict profiling traces.
//!
//! A trace file is a plain concatenation of frames, little-endian and
//! packed. Every frame starts with the same header:
//!
//! ```text
//! type: u32, name_key: u64
//! ```
//!
//! The remaining fields depend on the type:
//!
//! * `VarName (1)`: `var_key: u64`
//! * `Commit (2)` / `Conflict (3)`: `thread_id: u64, thread_name_key:
//!   u64, start_ns: u64, end_ns: u64, file_key: u64, line: u32,
//!   num_vars: u32`, followed by `num_vars` u64 var keys
//! * `NameData (4)`: `num_chars: u32`, followed by the raw bytes of the
//!   name, no terminator
//!
//! Keys are pointer bit patterns and only meaningful within one file:
//! `NameData` frames at the end of the file map them to strings.

pub(crate) const TYPE_VAR_NAME: u32 = 1;
pub(crate) const TYPE_COMMIT: u32 = 2;
pub(crate) const TYPE_CONFLICT: u32 = 3;
pub(crate) const TYPE_NAME_DATA: u32 = 4;

pub(crate) const HEADER_LEN: usize = 4 + 8;
pub(crate) const VAR_NAME_LEN: usize = HEADER_LEN + 8;
pub(crate) const TRANSACTION_FIXED_LEN: usize = HEADER_LEN + 8 + 8 + 8 + 8 + 8 + 4 + 4;
pub(crate) const NAME_DATA_FIXED_LEN: usize = HEADER_LEN + 4;

pub(crate) fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().expect("u32 field"))
}

pub(crate) fn get_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().expect("u64 field"))
}

pub(crate) fn put_header(buf: &mut [u8], frame_type: u32, name_key: u64) {
    put_u32(buf, 0, frame_type);
    put_u64(buf, 4, name_key);
}

/// Fields shared by commit and conflict frames, minus the variable tail.
pub(crate) struct TransactionFrame {
    pub name_key: u64,
    pub thread_id: u64,
    pub thread_name_key: u64,
    pub start_ns: u64,
    pub end_ns: u64,
    pub file_key: u64,
    pub line: u32,
    pub num_vars: u32,
}

pub(crate) fn put_transaction(buf: &mut [u8], frame_type: u32, frame: &TransactionFrame) {
    put_header(buf, frame_type, frame.name_key);
    put_u64(buf, 12, frame.thread_id);
    put_u64(buf, 20, frame.thread_name_key);
    put_u64(buf, 28, frame.start_ns);
    put_u64(buf, 36, frame.end_ns);
    put_u64(buf, 44, frame.file_key);
    put_u32(buf, 52, frame.line);
    put_u32(buf, 56, frame.num_vars);
}

/// Parse the fixed part of a commit or conflict frame. `buf` starts at
/// the frame header.
pub(crate) fn get_transaction(buf: &[u8]) -> TransactionFrame {
    TransactionFrame {
        name_key: get_u64(buf, 4),
        thread_id: get_u64(buf, 12),
        thread_name_key: get_u64(buf, 20),
        start_ns: get_u64(buf, 28),
        end_ns: get_u64(buf, 36),
        file_key: get_u64(buf, 44),
        line: get_u32(buf, 52),
        num_vars: get_u32(buf, 56),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transaction_round_trip() {
        let frame = TransactionFrame {
            name_key: 1,
            thread_id: 2,
            thread_name_key: 3,
            start_ns: 4,
            end_ns: 5,
            file_key: 6,
            line: 7,
            num_vars: 8,
        };
        let mut buf = [0u8; TRANSACTION_FIXED_LEN];
        put_transaction(&mut buf, TYPE_COMMIT, &frame);

        assert_eq!(get_u32(&buf, 0), TYPE_COMMIT);
        let back = get_transaction(&buf);
        assert_eq!(back.name_key, 1);
        assert_eq!(back.thread_id, 2);
        assert_eq!(back.thread_name_key, 3);
        assert_eq!(back.start_ns, 4);
        assert_eq!(back.end_ns, 5);
        assert_eq!(back.file_key, 6);
        assert_eq!(back.line, 7);
        assert_eq!(back.num_vars, 8);
    }

    #[test]
    fn fields_are_little_endian_and_packed() {
        let mut buf = [0u8; VAR_NAME_LEN];
        put_header(&mut buf, TYPE_VAR_NAME, 0x0102_0304_0506_0708);
        put_u64(&mut buf, HEADER_LEN, 0xAABB);

        assert_eq!(&buf[..4], &[1, 0, 0, 0]);
        assert_eq!(buf[4], 0x08);
        assert_eq!(buf[11], 0x01);
        assert_eq!(buf[12], 0xBB);
    }
}
