// Copyright 2018-2026 wstm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The conflict profiling sidecar.
//!
//! Every thread appends frames to its own chain of fixed-size pages, so
//! recording a transaction outcome is a memcpy with no cross-thread
//! traffic. A thread hands its chain to the shared collector when it
//! exits; [`write_profile`] merges the chains into a trace file that
//! [`reader::DataProcessor`] consumes.
//!
//! Only top-level transactions are recorded: a child transaction's reads
//! and writes end up in the frame of the top level that subsumes it.
//!
//! Recording of commits and conflicts is wired into the transaction
//! driver behind the `profiling` cargo feature. Name keys are the
//! addresses of `'static` strings and var keys the addresses of cells;
//! they are opaque and only meaningful within a single trace file.

pub mod reader;

pub(crate) mod frames;

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use self::frames::{
    get_transaction, get_u32, get_u64, put_header, put_transaction, put_u32, put_u64,
    TransactionFrame, HEADER_LEN, NAME_DATA_FIXED_LEN, TRANSACTION_FIXED_LEN, TYPE_COMMIT,
    TYPE_CONFLICT, TYPE_NAME_DATA, TYPE_VAR_NAME, VAR_NAME_LEN,
};
use crate::var::Var;

pub(crate) const PAGE_SIZE: usize = 4096;

/// One fixed-size buffer in a thread's page chain.
pub(crate) struct Page {
    used: usize,
    data: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    fn new() -> Page {
        Page {
            used: 0,
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    fn left(&self) -> usize {
        PAGE_SIZE - self.used
    }

    fn bytes(&self) -> &[u8] {
        &self.data[..self.used]
    }

    fn reserve(&mut self, len: usize) -> Option<&mut [u8]> {
        if len <= self.left() {
            let at = self.used;
            self.used += len;
            Some(&mut self.data[at..at + len])
        } else {
            None
        }
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Per-thread recording state. Lives in thread-local storage; the Drop
/// impl hands the page chain to the collector when the thread exits.
#[cfg_attr(not(feature = "profiling"), allow(dead_code))]
struct ThreadData {
    pages: Vec<Page>,
    registered: bool,
    thread_id: u64,
    thread_name_key: u64,
    txn_name_key: u64,
    txn_file_key: u64,
    txn_line: u32,
    txn_depth: u32,
    attempt_start_ns: u64,
}

impl ThreadData {
    fn new() -> ThreadData {
        ThreadData {
            pages: Vec::new(),
            registered: false,
            thread_id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            thread_name_key: 0,
            txn_name_key: 0,
            txn_file_key: 0,
            txn_line: 0,
            txn_depth: 0,
            attempt_start_ns: 0,
        }
    }

    fn register(&mut self) {
        if !self.registered {
            MAIN.new_thread();
            self.registered = true;
        }
    }

    /// Space for a frame's fixed part. Never splits: a frame that does
    /// not fit on the current page starts a fresh one.
    fn reserve(&mut self, len: usize) -> &mut [u8] {
        self.register();
        if self.pages.last().map_or(true, |page| page.left() < len) {
            self.pages.push(Page::new());
        }
        self.pages
            .last_mut()
            .and_then(|page| page.reserve(len))
            .expect("frame larger than a page")
    }

    fn emit_var_name(&mut self, name_key: u64, var_key: u64) {
        let buf = self.reserve(VAR_NAME_LEN);
        put_header(buf, TYPE_VAR_NAME, name_key);
        put_u64(buf, HEADER_LEN, var_key);
    }

    /// Emit a commit or conflict frame. The fixed part stays on one
    /// page; the var-key tail may split across pages.
    #[cfg_attr(not(feature = "profiling"), allow(dead_code))]
    fn emit_transaction(&mut self, frame_type: u32, end_ns: u64, vars: &[u64]) {
        let frame = TransactionFrame {
            name_key: self.txn_name_key,
            thread_id: self.thread_id,
            thread_name_key: self.thread_name_key,
            start_ns: self.attempt_start_ns,
            end_ns,
            file_key: self.txn_file_key,
            line: self.txn_line,
            num_vars: vars.len() as u32,
        };
        let buf = self.reserve(TRANSACTION_FIXED_LEN);
        put_transaction(buf, frame_type, &frame);

        let mut rest = vars;
        while !rest.is_empty() {
            let left = self.pages.last().map_or(0, |page| page.left());
            let fit = (left / 8).min(rest.len());
            if fit == 0 {
                self.pages.push(Page::new());
                continue;
            }
            let buf = self
                .pages
                .last_mut()
                .and_then(|page| page.reserve(fit * 8))
                .expect("reserved within measured space");
            for (i, var) in rest[..fit].iter().enumerate() {
                put_u64(buf, i * 8, *var);
            }
            rest = &rest[fit..];
        }
    }
}

impl Drop for ThreadData {
    fn drop(&mut self) {
        if self.registered {
            MAIN.thread_done(mem::take(&mut self.pages));
        }
    }
}

thread_local! {
    static THREAD: RefCell<ThreadData> = RefCell::new(ThreadData::new());
}

struct MainInner {
    pages: Vec<Page>,
    threads: usize,
}

/// The shared collector every recording thread registers with.
struct MainData {
    inner: Mutex<MainInner>,
    all_done: Condvar,
}

static MAIN: MainData = MainData {
    inner: Mutex::new(MainInner {
        pages: Vec::new(),
        threads: 0,
    }),
    all_done: Condvar::new(),
};

impl MainData {
    fn new_thread(&self) {
        self.inner.lock().threads += 1;
    }

    fn thread_done(&self, pages: Vec<Page>) {
        let mut inner = self.inner.lock();
        inner.pages.extend(pages);
        inner.threads -= 1;
        self.all_done.notify_all();
    }
}

/// Names are interned so the collector can recover the bytes behind a
/// key at shutdown. Keys are the string's data address, which is stable
/// for the `'static` strings we accept.
static NAMES: Lazy<Mutex<HashMap<u64, &'static str>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn intern(name: &'static str) -> u64 {
    let key = name.as_ptr() as u64;
    NAMES.lock().insert(key, name);
    key
}

#[cfg_attr(not(feature = "profiling"), allow(dead_code))]
fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0)
}

/// Attach a name to a variable in this thread's trace.
pub fn name_var<T>(var: &Var<T>, name: &'static str) {
    let name_key = intern(name);
    let var_key = var.core().key();
    THREAD.with(|thread| thread.borrow_mut().emit_var_name(name_key, var_key));
}

/// Name the currently running top-level transaction. Calls from child
/// transactions are ignored.
pub fn name_transaction(name: &'static str) {
    let key = intern(name);
    THREAD.with(|thread| {
        let mut thread = thread.borrow_mut();
        if thread.txn_depth == 1 {
            thread.txn_name_key = key;
        }
    });
}

/// Name the current thread in subsequent transaction frames.
pub fn name_thread(name: &'static str) {
    let key = intern(name);
    THREAD.with(|thread| thread.borrow_mut().thread_name_key = key);
}

/// RAII marker for a running transaction; leaving the scope pops one
/// nesting level.
pub(crate) struct TransactionScope;

#[cfg(feature = "profiling")]
impl Drop for TransactionScope {
    fn drop(&mut self) {
        THREAD.with(|thread| thread.borrow_mut().txn_depth -= 1);
    }
}

#[cfg(feature = "profiling")]
pub(crate) fn enter_transaction(file: &'static str, line: u32) -> TransactionScope {
    let file_key = intern(file);
    THREAD.with(|thread| {
        let mut thread = thread.borrow_mut();
        if thread.txn_depth == 0 {
            thread.txn_file_key = file_key;
            thread.txn_line = line;
            thread.txn_name_key = 0;
        }
        thread.txn_depth += 1;
    });
    TransactionScope
}

#[cfg(feature = "profiling")]
pub(crate) fn enter_child() -> TransactionScope {
    THREAD.with(|thread| thread.borrow_mut().txn_depth += 1);
    TransactionScope
}

#[cfg(feature = "profiling")]
pub(crate) fn attempt_start() {
    THREAD.with(|thread| {
        let mut thread = thread.borrow_mut();
        if thread.txn_depth == 1 {
            thread.attempt_start_ns = now_ns();
        }
    });
}

#[cfg(feature = "profiling")]
pub(crate) fn record_commit(vars: &[u64]) {
    THREAD.with(|thread| {
        let mut thread = thread.borrow_mut();
        if thread.txn_depth == 1 {
            thread.emit_transaction(TYPE_COMMIT, now_ns(), vars);
        }
    });
}

#[cfg(feature = "profiling")]
pub(crate) fn record_conflict(vars: &[u64]) {
    THREAD.with(|thread| {
        let mut thread = thread.borrow_mut();
        if thread.txn_depth == 1 {
            thread.emit_transaction(TYPE_CONFLICT, now_ns(), vars);
        }
    });
}

#[cfg(not(feature = "profiling"))]
pub(crate) fn enter_transaction(_file: &'static str, _line: u32) -> TransactionScope {
    TransactionScope
}

#[cfg(not(feature = "profiling"))]
pub(crate) fn enter_child() -> TransactionScope {
    TransactionScope
}

#[cfg(not(feature = "profiling"))]
pub(crate) fn attempt_start() {}

/// Flush the calling thread's pages, wait for every other recording
/// thread to exit, and write the merged trace into `dir`.
///
/// The filename is `wstm_<seconds since the unix epoch>.profile`. After
/// the raw pages the writer appends one `NameData` frame per distinct
/// name key referenced by the stream, so a reader can map keys back to
/// strings.
pub fn write_profile(dir: impl AsRef<Path>) -> io::Result<PathBuf> {
    THREAD.with(|thread| {
        let mut thread = thread.borrow_mut();
        if thread.registered {
            let pages = mem::take(&mut thread.pages);
            thread.registered = false;
            MAIN.thread_done(pages);
        }
    });

    let pages = {
        let mut inner = MAIN.inner.lock();
        while inner.threads > 0 {
            MAIN.all_done.wait(&mut inner);
        }
        mem::take(&mut inner.pages)
    };

    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    let path = dir.as_ref().join(format!("wstm_{}.profile", secs));
    let mut out = BufWriter::new(File::create(&path)?);
    for page in &pages {
        out.write_all(page.bytes())?;
    }

    let names = NAMES.lock();
    for key in referenced_names(&pages) {
        if let Some(name) = names.get(&key) {
            let mut fixed = [0u8; NAME_DATA_FIXED_LEN];
            put_header(&mut fixed, TYPE_NAME_DATA, key);
            put_u32(&mut fixed, HEADER_LEN, name.len() as u32);
            out.write_all(&fixed)?;
            out.write_all(name.as_bytes())?;
        }
    }
    out.flush()?;
    Ok(path)
}

/// Scan the emitted stream as frames and collect every distinct
/// non-zero name key.
///
/// A frame's fixed part never crosses a page boundary, only the var-key
/// tail of a transaction frame does, so the scanner reads headers in
/// place and skips tail bytes across pages.
fn referenced_names(pages: &[Page]) -> BTreeSet<u64> {
    let mut names = BTreeSet::new();
    let mut skip = 0usize;
    for page in pages {
        let data = page.bytes();
        if skip >= data.len() {
            skip -= data.len();
            continue;
        }
        let mut pos = skip;
        skip = 0;
        while pos < data.len() {
            let frame = &data[pos..];
            let frame_type = get_u32(frame, 0);
            names.insert(get_u64(frame, 4));
            let total = match frame_type {
                TYPE_VAR_NAME => VAR_NAME_LEN,
                TYPE_COMMIT | TYPE_CONFLICT => {
                    let txn = get_transaction(frame);
                    names.insert(txn.thread_name_key);
                    names.insert(txn.file_key);
                    TRANSACTION_FIXED_LEN + txn.num_vars as usize * 8
                }
                other => unreachable!("unknown frame type {} in page", other),
            };
            if pos + total <= data.len() {
                pos += total;
            } else {
                skip = pos + total - data.len();
                pos = data.len();
            }
        }
    }
    names.remove(&0);
    names
}

#[cfg(test)]
mod test {
    use super::reader::{DataProcessor, Record};
    use super::*;

    /// Build a detached recorder whose pages can be inspected without
    /// going through the collector.
    fn detached_thread_data() -> ThreadData {
        let mut data = ThreadData::new();
        // Field setup the driver shims would normally do.
        data.txn_name_key = 0;
        data.txn_file_key = 0;
        data.txn_line = 17;
        data.attempt_start_ns = 1000;
        data
    }

    fn concat(pages: &[Page]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for page in pages {
            bytes.extend_from_slice(page.bytes());
        }
        bytes
    }

    #[test]
    fn page_reserve_tracks_usage() {
        let mut page = Page::new();
        assert_eq!(page.left(), PAGE_SIZE);

        assert!(page.reserve(100).is_some());
        assert_eq!(page.left(), PAGE_SIZE - 100);
        assert_eq!(page.bytes().len(), 100);

        assert!(page.reserve(PAGE_SIZE).is_none());
    }

    #[test]
    fn var_tail_splits_across_pages() {
        let mut data = detached_thread_data();
        let vars: Vec<u64> = (1..=1000).collect();
        data.emit_transaction(TYPE_COMMIT, 2000, &vars);

        let pages = mem::take(&mut data.pages);
        assert!(pages.len() > 1, "1000 var keys cannot fit a single page");

        // The concatenated stream reads back as one frame.
        let bytes = concat(&pages);
        let mut reader = DataProcessor::new(&bytes[..]);
        match reader.next_record().unwrap().unwrap() {
            Record::Commit(txn) => {
                assert_eq!(txn.line, 17);
                assert_eq!(txn.start_ns, 1000);
                assert_eq!(txn.end_ns, 2000);
                assert_eq!(txn.vars, vars);
            }
            other => panic!("expected a commit record, got {:?}", other),
        }
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn scanner_collects_names_across_split_frames() {
        let mut data = detached_thread_data();
        let name = intern("scanner-var");
        let thread_name = intern("scanner-thread");
        let file = intern("scanner-file");
        data.thread_name_key = thread_name;
        data.txn_file_key = file;

        data.emit_var_name(name, 0xABCD);
        let vars: Vec<u64> = (1..=600).collect();
        data.emit_transaction(TYPE_CONFLICT, 2000, &vars);
        data.emit_var_name(name, 0xABCE);

        let pages = mem::take(&mut data.pages);
        let names = referenced_names(&pages);
        assert!(names.contains(&name));
        assert!(names.contains(&thread_name));
        assert!(names.contains(&file));
        assert!(!names.contains(&0));
    }
}
