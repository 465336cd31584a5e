// Copyright 2018-2026 wstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Reading conflict profiling trace files.
//!
//! [`DataProcessor`] consumes a byte stream written by
//! [`write_profile`](super::write_profile) and yields typed records.
//! Name and var keys in the records are opaque; cross-reference them
//! against the [`Record::Name`] records at the end of the stream to
//! recover strings.

use std::io::{self, Read};

use thiserror::Error;

use super::frames::{
    get_transaction, get_u32, get_u64, HEADER_LEN, NAME_DATA_FIXED_LEN, TRANSACTION_FIXED_LEN,
    TYPE_COMMIT, TYPE_CONFLICT, TYPE_NAME_DATA, TYPE_VAR_NAME, VAR_NAME_LEN,
};

/// Error while reading profiling data.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("error reading profiling data: {0}")]
    Io(#[from] io::Error),

    /// The stream ended in the middle of a frame.
    #[error("profiling data ends in the middle of a frame")]
    Truncated,

    /// The stream contains a frame type this reader does not know.
    #[error("unknown frame type {0}")]
    UnknownFrame(u32),
}

/// A committed or conflicted transaction read from a trace.
///
/// For a commit `vars` holds the keys of the written variables, for a
/// conflict the keys of the variables the transaction had read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionData {
    pub name_key: u64,
    pub thread_id: u64,
    pub thread_name_key: u64,
    pub start_ns: u64,
    pub end_ns: u64,
    pub file_key: u64,
    pub line: u32,
    pub vars: Vec<u64>,
}

/// One typed record from a trace file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// A variable was given a name.
    VarName { name_key: u64, var_key: u64 },

    /// A top-level transaction committed.
    Commit(TransactionData),

    /// A top-level transaction hit a conflict.
    Conflict(TransactionData),

    /// Maps a name key to its string. These appear at the end of the
    /// stream.
    Name { key: u64, name: String },
}

enum Fill {
    Full,
    Empty,
    Partial,
}

fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<Fill, ReadError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = input.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(if filled == 0 { Fill::Empty } else { Fill::Partial });
        }
        filled += n;
    }
    Ok(Fill::Full)
}

/// Streaming reader for trace files.
pub struct DataProcessor<R> {
    input: R,
}

impl<R: Read> DataProcessor<R> {
    pub fn new(input: R) -> DataProcessor<R> {
        DataProcessor { input }
    }

    /// The next record, or `None` at a clean end of stream. An end of
    /// stream inside a frame is a [`ReadError::Truncated`].
    pub fn next_record(&mut self) -> Result<Option<Record>, ReadError> {
        let mut header = [0u8; HEADER_LEN];
        match read_full(&mut self.input, &mut header)? {
            Fill::Empty => return Ok(None),
            Fill::Partial => return Err(ReadError::Truncated),
            Fill::Full => {}
        }
        let frame_type = get_u32(&header, 0);
        let name_key = get_u64(&header, 4);

        match frame_type {
            TYPE_VAR_NAME => {
                let mut rest = [0u8; VAR_NAME_LEN - HEADER_LEN];
                self.read_rest(&mut rest)?;
                Ok(Some(Record::VarName {
                    name_key,
                    var_key: get_u64(&rest, 0),
                }))
            }
            TYPE_COMMIT | TYPE_CONFLICT => {
                let mut frame = [0u8; TRANSACTION_FIXED_LEN];
                frame[..HEADER_LEN].copy_from_slice(&header);
                self.read_rest(&mut frame[HEADER_LEN..])?;
                let fixed = get_transaction(&frame);

                // Read the tail keys one by one; a corrupt count must
                // not translate into a giant allocation.
                let mut vars = Vec::new();
                for _ in 0..fixed.num_vars {
                    let mut key = [0u8; 8];
                    self.read_rest(&mut key)?;
                    vars.push(u64::from_le_bytes(key));
                }

                let data = TransactionData {
                    name_key: fixed.name_key,
                    thread_id: fixed.thread_id,
                    thread_name_key: fixed.thread_name_key,
                    start_ns: fixed.start_ns,
                    end_ns: fixed.end_ns,
                    file_key: fixed.file_key,
                    line: fixed.line,
                    vars,
                };
                Ok(Some(if frame_type == TYPE_COMMIT {
                    Record::Commit(data)
                } else {
                    Record::Conflict(data)
                }))
            }
            TYPE_NAME_DATA => {
                let mut rest = [0u8; NAME_DATA_FIXED_LEN - HEADER_LEN];
                self.read_rest(&mut rest)?;
                let num_chars = get_u32(&rest, 0) as usize;
                let mut chars = vec![0u8; num_chars];
                self.read_rest(&mut chars)?;
                Ok(Some(Record::Name {
                    key: name_key,
                    name: String::from_utf8_lossy(&chars).into_owned(),
                }))
            }
            other => Err(ReadError::UnknownFrame(other)),
        }
    }

    fn read_rest(&mut self, buf: &mut [u8]) -> Result<(), ReadError> {
        match read_full(&mut self.input, buf)? {
            Fill::Full => Ok(()),
            Fill::Empty | Fill::Partial => Err(ReadError::Truncated),
        }
    }
}

/// Iterate over all records until the end of the stream.
impl<R: Read> Iterator for DataProcessor<R> {
    type Item = Result<Record, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

#[cfg(test)]
mod test {
    use super::super::frames::{put_header, put_transaction, put_u32, put_u64, TransactionFrame};
    use super::*;

    fn var_name_frame(name_key: u64, var_key: u64) -> Vec<u8> {
        let mut buf = vec![0u8; VAR_NAME_LEN];
        put_header(&mut buf, TYPE_VAR_NAME, name_key);
        put_u64(&mut buf, HEADER_LEN, var_key);
        buf
    }

    fn name_data_frame(key: u64, name: &str) -> Vec<u8> {
        let mut buf = vec![0u8; NAME_DATA_FIXED_LEN];
        put_header(&mut buf, TYPE_NAME_DATA, key);
        put_u32(&mut buf, HEADER_LEN, name.len() as u32);
        buf.extend_from_slice(name.as_bytes());
        buf
    }

    fn commit_frame(vars: &[u64]) -> Vec<u8> {
        let mut buf = vec![0u8; TRANSACTION_FIXED_LEN];
        put_transaction(
            &mut buf,
            TYPE_COMMIT,
            &TransactionFrame {
                name_key: 11,
                thread_id: 22,
                thread_name_key: 33,
                start_ns: 44,
                end_ns: 55,
                file_key: 66,
                line: 77,
                num_vars: vars.len() as u32,
            },
        );
        for var in vars {
            buf.extend_from_slice(&var.to_le_bytes());
        }
        buf
    }

    #[test]
    fn empty_stream_is_clean_eof() {
        let mut reader = DataProcessor::new(&[][..]);
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn reads_a_sequence_of_frames() {
        let mut bytes = var_name_frame(5, 100);
        bytes.extend(commit_frame(&[100, 200]));
        bytes.extend(name_data_frame(5, "counter"));

        let records: Vec<Record> = DataProcessor::new(&bytes[..])
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(
            records[0],
            Record::VarName {
                name_key: 5,
                var_key: 100
            }
        );
        match &records[1] {
            Record::Commit(txn) => {
                assert_eq!(txn.thread_id, 22);
                assert_eq!(txn.vars, [100, 200]);
            }
            other => panic!("expected a commit, got {:?}", other),
        }
        assert_eq!(
            records[2],
            Record::Name {
                key: 5,
                name: "counter".to_owned()
            }
        );
    }

    #[test]
    fn eof_inside_a_frame_is_an_error() {
        let bytes = commit_frame(&[100, 200]);
        // Drop the last three bytes of the tail.
        let truncated = &bytes[..bytes.len() - 3];

        let mut reader = DataProcessor::new(truncated);
        assert!(matches!(reader.next_record(), Err(ReadError::Truncated)));
    }

    #[test]
    fn eof_inside_a_header_is_an_error() {
        let bytes = var_name_frame(5, 100);
        let truncated = &bytes[..HEADER_LEN - 2];

        let mut reader = DataProcessor::new(truncated);
        assert!(matches!(reader.next_record(), Err(ReadError::Truncated)));
    }

    #[test]
    fn unknown_frame_type_is_an_error() {
        let mut buf = vec![0u8; HEADER_LEN];
        put_header(&mut buf, 9, 0);

        let mut reader = DataProcessor::new(&buf[..]);
        assert!(matches!(reader.next_record(), Err(ReadError::UnknownFrame(9))));
    }
}
