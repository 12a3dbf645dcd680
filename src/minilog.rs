//! Per-thread undo/redo mini-transaction log.
//!
//! A mini-transaction is the smallest unit of crash consistency: a sequence
//! of typed updates framed by `start` and `commit` (or `abort`). Three
//! flavors of update exist:
//!
//! - **write**: logs old and new value, flushes the record, then mutates
//!   memory. Undone from the old value on abort.
//! - **new**: the target held no meaningful data; only the new value is
//!   logged and nothing is flushed eagerly.
//! - **`redo_write`**: buffered volatilely; at commit all redo records are
//!   appended to the log in one batch, `COMMIT` is written and flushed, and
//!   only then are the memory writes (and deferred node frees) performed.
//!   This gives all-or-nothing semantics for the redo set.
//!
//! Node lifecycle records pair with the NVM allocator: `alloc_node` is
//! logged eagerly (so a crash can reclaim the orphan on abort), `del_node`
//! is buffered and logged at commit so the free happens only after the
//! transaction is durable.
//!
//! Every record carries its tag byte first *and* last so the abort path can
//! dispatch while scanning the log backward. There are no nested
//! transactions. Recovery replay itself is out of scope; the record rules
//! here are what make a replay scanner possible (forward scan from the last
//! known transaction start, redo committed transactions, undo the rest).

use crate::flush;
use crate::logbuf::{LogBuffer, LogPos};
use crate::mempool::{Arena, worker_id};
use crate::nvmpool::NvmPoolSet;
use std::cell::UnsafeCell;

// ============================================================================
//  Record tags
// ============================================================================

/// Log record tags. The tag byte frames each record at both ends.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecTag {
    Invalid = 0x0,

    New1B = 0x1,
    New2B = 0x2,
    New4B = 0x3,
    New8B = 0x4,
    NewVchar = 0x5,

    Write1B = 0x6,
    Write2B = 0x7,
    Write4B = 0x8,
    Write8B = 0x9,
    WriteVchar = 0xa,

    Redo1B = 0xb,
    Redo2B = 0xc,
    Redo4B = 0xd,
    Redo8B = 0xe,
    RedoVchar = 0xf,

    AllocNode = 0x10,
    DelNode = 0x11,

    /// Filler directing a scanner to the next chunk (legacy; skipped).
    NextChunk = 0x20,

    Commit = 0x80,
    Abort = 0x81,
    Ongoing = 0x82,
}

impl RecTag {
    /// Decode a tag byte.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x0 => Self::Invalid,
            0x1 => Self::New1B,
            0x2 => Self::New2B,
            0x3 => Self::New4B,
            0x4 => Self::New8B,
            0x5 => Self::NewVchar,
            0x6 => Self::Write1B,
            0x7 => Self::Write2B,
            0x8 => Self::Write4B,
            0x9 => Self::Write8B,
            0xa => Self::WriteVchar,
            0xb => Self::Redo1B,
            0xc => Self::Redo2B,
            0xd => Self::Redo4B,
            0xe => Self::Redo8B,
            0xf => Self::RedoVchar,
            0x10 => Self::AllocNode,
            0x11 => Self::DelNode,
            0x20 => Self::NextChunk,
            0x80 => Self::Commit,
            0x81 => Self::Abort,
            0x82 => Self::Ongoing,
            _ => return None,
        })
    }
}

// ============================================================================
//  Byte helpers
// ============================================================================

#[inline]
fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

#[inline]
fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

// ============================================================================
//  Volatile redo records
// ============================================================================

/// A redo update buffered until commit.
///
/// For `RedoVchar`, `value` is an offset into the volatile vchar arena.
#[derive(Clone, Copy, Debug)]
struct RedoRec {
    tag: RecTag,
    len: u32,
    addr: u64,
    value: u64,
}

// ============================================================================
//  NvmLog
// ============================================================================

/// One worker's mini-transaction log: the NVM ring plus volatile buffers.
pub struct NvmLog {
    buf: LogBuffer,
    tx_pos: LogPos,

    /// Nodes to free at commit.
    to_del: Vec<u64>,

    /// Redo records to persist and apply at commit.
    redo: Vec<RedoRec>,

    /// Backing bytes for buffered vchar redo values.
    vchar: Vec<u8>,
}

impl NvmLog {
    /// Create the log, allocating its ring from the worker's NVM arena.
    #[must_use]
    pub fn new(arena: &Arena) -> Self {
        let buf = LogBuffer::init(arena);
        let tx_pos = buf.cur_pos();
        Self {
            buf,
            tx_pos,
            to_del: Vec::with_capacity(64),
            redo: Vec::with_capacity(64),
            vchar: Vec::with_capacity(1024),
        }
    }

    /// Begin a mini-transaction.
    ///
    /// Snapshots the log position (the undo scan's stopping point) and
    /// resets the volatile buffers. No nesting.
    pub fn start(&mut self) {
        self.tx_pos = self.buf.cur_pos();
        self.to_del.clear();
        self.redo.clear();
        self.vchar.clear();
    }

    // ========================================================================
    //  Undo-logged writes (immediately durable, restored on abort)
    // ========================================================================

    /// Overwrite an 8-byte persistent location, undo-logged.
    ///
    /// # Safety
    ///
    /// `addr` must be a valid persistent location owned by the transaction.
    pub unsafe fn write8b(&mut self, addr: *mut u64, value: u64) {
        let mut rec = [0u8; 26];
        rec[0] = RecTag::Write8B as u8;
        put_u64(&mut rec, 1, addr as u64);
        put_u64(&mut rec, 9, unsafe { addr.read() });
        put_u64(&mut rec, 17, value);
        rec[25] = RecTag::Write8B as u8;
        self.buf.write(&rec);
        self.buf.flush();

        unsafe { addr.write(value) };
    }

    /// Overwrite a 4-byte persistent location, undo-logged.
    ///
    /// # Safety
    ///
    /// `addr` must be a valid persistent location owned by the transaction.
    pub unsafe fn write4b(&mut self, addr: *mut u32, value: u32) {
        let mut rec = [0u8; 18];
        rec[0] = RecTag::Write4B as u8;
        put_u64(&mut rec, 1, addr as u64);
        put_u32(&mut rec, 9, unsafe { addr.read() });
        put_u32(&mut rec, 13, value);
        rec[17] = RecTag::Write4B as u8;
        self.buf.write(&rec);
        self.buf.flush();

        unsafe { addr.write(value) };
    }

    /// Overwrite a 2-byte persistent location, undo-logged.
    ///
    /// # Safety
    ///
    /// `addr` must be a valid persistent location owned by the transaction.
    pub unsafe fn write2b(&mut self, addr: *mut u16, value: u16) {
        let mut rec = [0u8; 14];
        rec[0] = RecTag::Write2B as u8;
        put_u64(&mut rec, 1, addr as u64);
        rec[9..11].copy_from_slice(&unsafe { addr.read() }.to_le_bytes());
        rec[11..13].copy_from_slice(&value.to_le_bytes());
        rec[13] = RecTag::Write2B as u8;
        self.buf.write(&rec);
        self.buf.flush();

        unsafe { addr.write(value) };
    }

    /// Overwrite a 1-byte persistent location, undo-logged.
    ///
    /// # Safety
    ///
    /// `addr` must be a valid persistent location owned by the transaction.
    pub unsafe fn write1b(&mut self, addr: *mut u8, value: u8) {
        let mut rec = [0u8; 12];
        rec[0] = RecTag::Write1B as u8;
        put_u64(&mut rec, 1, addr as u64);
        rec[9] = unsafe { addr.read() };
        rec[10] = value;
        rec[11] = RecTag::Write1B as u8;
        self.buf.write(&rec);
        self.buf.flush();

        unsafe { addr.write(value) };
    }

    /// Overwrite `value.len()` persistent bytes, undo-logged.
    ///
    /// # Safety
    ///
    /// `addr..addr+len` must be valid persistent bytes owned by the
    /// transaction.
    pub unsafe fn write_vchar(&mut self, addr: *mut u8, value: &[u8]) {
        if value.is_empty() {
            return;
        }
        let len = value.len() as u32;
        let mut head = [0u8; 13];
        head[0] = RecTag::WriteVchar as u8;
        put_u64(&mut head, 1, addr as u64);
        put_u32(&mut head, 9, len);
        self.buf.write(&head);

        // old value, then new value
        let old = unsafe { std::slice::from_raw_parts(addr.cast_const(), value.len()) };
        self.buf.write(old);
        self.buf.write(value);

        let mut tail = [0u8; 5];
        put_u32(&mut tail, 0, len);
        tail[4] = RecTag::WriteVchar as u8;
        self.buf.write(&tail);
        self.buf.flush();

        unsafe { std::ptr::copy_nonoverlapping(value.as_ptr(), addr, value.len()) };
    }

    // ========================================================================
    //  New-value writes (target previously meaningless, no eager flush)
    // ========================================================================

    /// Write an 8-byte location that held no meaningful data before.
    ///
    /// # Safety
    ///
    /// `addr` must be a valid persistent location owned by the transaction.
    pub unsafe fn new8b(&mut self, addr: *mut u64, value: u64) {
        let mut rec = [0u8; 18];
        rec[0] = RecTag::New8B as u8;
        put_u64(&mut rec, 1, addr as u64);
        put_u64(&mut rec, 9, value);
        rec[17] = RecTag::New8B as u8;
        self.buf.write(&rec);

        unsafe { addr.write(value) };
    }

    /// Write a 4-byte location that held no meaningful data before.
    ///
    /// # Safety
    ///
    /// `addr` must be a valid persistent location owned by the transaction.
    pub unsafe fn new4b(&mut self, addr: *mut u32, value: u32) {
        let mut rec = [0u8; 14];
        rec[0] = RecTag::New4B as u8;
        put_u64(&mut rec, 1, addr as u64);
        put_u32(&mut rec, 9, value);
        rec[13] = RecTag::New4B as u8;
        self.buf.write(&rec);

        unsafe { addr.write(value) };
    }

    /// Write a 2-byte location that held no meaningful data before.
    ///
    /// # Safety
    ///
    /// `addr` must be a valid persistent location owned by the transaction.
    pub unsafe fn new2b(&mut self, addr: *mut u16, value: u16) {
        let mut rec = [0u8; 12];
        rec[0] = RecTag::New2B as u8;
        put_u64(&mut rec, 1, addr as u64);
        rec[9..11].copy_from_slice(&value.to_le_bytes());
        rec[11] = RecTag::New2B as u8;
        self.buf.write(&rec);

        unsafe { addr.write(value) };
    }

    /// Write a 1-byte location that held no meaningful data before.
    ///
    /// # Safety
    ///
    /// `addr` must be a valid persistent location owned by the transaction.
    pub unsafe fn new1b(&mut self, addr: *mut u8, value: u8) {
        let mut rec = [0u8; 11];
        rec[0] = RecTag::New1B as u8;
        put_u64(&mut rec, 1, addr as u64);
        rec[9] = value;
        rec[10] = RecTag::New1B as u8;
        self.buf.write(&rec);

        unsafe { addr.write(value) };
    }

    /// Write bytes to a location that held no meaningful data before.
    ///
    /// # Safety
    ///
    /// `addr..addr+len` must be valid persistent bytes owned by the
    /// transaction.
    pub unsafe fn new_vchar(&mut self, addr: *mut u8, value: &[u8]) {
        let len = value.len() as u32;
        let mut head = [0u8; 13];
        head[0] = RecTag::NewVchar as u8;
        put_u64(&mut head, 1, addr as u64);
        put_u32(&mut head, 9, len);
        self.buf.write(&head);
        self.buf.write(value);

        let mut tail = [0u8; 5];
        put_u32(&mut tail, 0, len);
        tail[4] = RecTag::NewVchar as u8;
        self.buf.write(&tail);

        unsafe { std::ptr::copy_nonoverlapping(value.as_ptr(), addr, value.len()) };
    }

    // ========================================================================
    //  Redo writes (buffered, applied after COMMIT is durable)
    // ========================================================================

    /// Buffer an 8-byte redo write.
    pub fn redo_write8b(&mut self, addr: *mut u64, value: u64) {
        self.redo.push(RedoRec {
            tag: RecTag::Redo8B,
            len: 0,
            addr: addr as u64,
            value,
        });
    }

    /// Buffer a 4-byte redo write.
    pub fn redo_write4b(&mut self, addr: *mut u32, value: u32) {
        self.redo.push(RedoRec {
            tag: RecTag::Redo4B,
            len: 0,
            addr: addr as u64,
            value: u64::from(value),
        });
    }

    /// Buffer a 2-byte redo write.
    pub fn redo_write2b(&mut self, addr: *mut u16, value: u16) {
        self.redo.push(RedoRec {
            tag: RecTag::Redo2B,
            len: 0,
            addr: addr as u64,
            value: u64::from(value),
        });
    }

    /// Buffer a 1-byte redo write.
    pub fn redo_write1b(&mut self, addr: *mut u8, value: u8) {
        self.redo.push(RedoRec {
            tag: RecTag::Redo1B,
            len: 0,
            addr: addr as u64,
            value: u64::from(value),
        });
    }

    /// Buffer a byte-string redo write.
    pub fn redo_write_vchar(&mut self, addr: *mut u8, value: &[u8]) {
        if value.is_empty() {
            return;
        }
        let off = self.vchar.len() as u64;
        self.vchar.extend_from_slice(value);
        self.redo.push(RedoRec {
            tag: RecTag::RedoVchar,
            len: value.len() as u32,
            addr: addr as u64,
            value: off,
        });
    }

    // ========================================================================
    //  Node lifecycle
    // ========================================================================

    /// Allocate a node from the NVM arena and log the allocation eagerly,
    /// so an aborting recovery can reclaim the orphan.
    pub fn alloc_node(&mut self, size: usize, arena: &Arena) -> *mut u8 {
        let ptr = arena.alloc_node(size);

        let mut rec = [0u8; 10];
        rec[0] = RecTag::AllocNode as u8;
        put_u64(&mut rec, 1, ptr as u64);
        rec[9] = RecTag::AllocNode as u8;
        self.buf.write(&rec);
        self.buf.flush();

        ptr
    }

    /// Defer freeing a node until commit.
    pub fn del_node(&mut self, p: *mut u8) {
        self.to_del.push(p as u64);
    }

    // ========================================================================
    //  Commit / abort
    // ========================================================================

    /// Commit the transaction.
    ///
    /// Appends the buffered redo records and the deferred-deletion record,
    /// makes `COMMIT` durable, then performs the real memory writes and
    /// frees the deferred nodes into `arena`. A transaction that logged
    /// nothing writes nothing.
    pub fn commit(&mut self, arena: &Arena) {
        // 1. persist the redo records
        for i in 0..self.redo.len() {
            let r = self.redo[i];
            match r.tag {
                RecTag::Redo1B | RecTag::Redo2B | RecTag::Redo4B | RecTag::Redo8B => {
                    let vlen = match r.tag {
                        RecTag::Redo1B => 1,
                        RecTag::Redo2B => 2,
                        RecTag::Redo4B => 4,
                        _ => 8,
                    };
                    let mut rec = [0u8; 19];
                    rec[0] = r.tag as u8;
                    put_u64(&mut rec, 1, r.addr);
                    rec[9..17].copy_from_slice(&r.value.to_le_bytes());
                    rec[9 + vlen] = r.tag as u8;
                    self.buf.write(&rec[..9 + vlen + 1]);
                }
                RecTag::RedoVchar => {
                    let mut head = [0u8; 13];
                    head[0] = RecTag::RedoVchar as u8;
                    put_u64(&mut head, 1, r.addr);
                    put_u32(&mut head, 9, r.len);
                    self.buf.write(&head);

                    let start = r.value as usize;
                    let bytes = self.vchar[start..start + r.len as usize].to_vec();
                    self.buf.write(&bytes);

                    let mut tail = [0u8; 5];
                    put_u32(&mut tail, 0, r.len);
                    tail[4] = RecTag::RedoVchar as u8;
                    self.buf.write(&tail);
                }
                _ => unreachable!("non-redo tag in redo buffer"),
            }
        }

        // 2. persist the deferred deletions
        if !self.to_del.is_empty() {
            let n = self.to_del.len() as u32;
            let mut head = [0u8; 5];
            head[0] = RecTag::DelNode as u8;
            put_u32(&mut head, 1, n);
            self.buf.write(&head);
            for &p in &self.to_del {
                let bytes = p.to_le_bytes();
                self.buf.write(&bytes);
            }
            let mut tail = [0u8; 5];
            put_u32(&mut tail, 0, n);
            tail[4] = RecTag::DelNode as u8;
            self.buf.write(&tail);
        }

        // 3. COMMIT marker, durable before any data is touched
        if !self.buf.is_same_as_cur(&self.tx_pos) {
            self.buf.write(&[RecTag::Commit as u8]);
            self.buf.flush();
        }

        // 4. the actual redo writes
        for r in &self.redo {
            // SAFETY: the caller registered valid persistent locations.
            unsafe {
                match r.tag {
                    RecTag::Redo1B => (r.addr as *mut u8).write(r.value as u8),
                    RecTag::Redo2B => (r.addr as *mut u16).write(r.value as u16),
                    RecTag::Redo4B => (r.addr as *mut u32).write(r.value as u32),
                    RecTag::Redo8B => (r.addr as *mut u64).write(r.value),
                    RecTag::RedoVchar => {
                        let start = r.value as usize;
                        std::ptr::copy_nonoverlapping(
                            self.vchar.as_ptr().add(start),
                            r.addr as *mut u8,
                            r.len as usize,
                        );
                    }
                    _ => unreachable!(),
                }
            }
        }

        // 5. the actual deletions
        for &p in &self.to_del {
            arena.free_node(p as *mut u8);
        }
    }

    /// Abort the transaction: walk the log backward to the transaction
    /// start, undoing every record, then write a durable `ABORT`.
    pub fn abort(&mut self, arena: &Arena) {
        let mut backward = self.buf.cur_pos();
        self.buf.prepare_for_reverse_read(&mut backward);

        let p_end = self.buf.reverse_adjust(self.tx_pos.next);
        let mut tmp = [0u8; 32];

        while backward.next != p_end {
            let tag_byte = self.buf.byte_before(backward.next);
            let Some(tag) = RecTag::from_byte(tag_byte) else {
                eprintln!("nvm log: invalid record tag {tag_byte:#04x} during abort");
                std::process::exit(1);
            };
            match tag {
                RecTag::New1B => {
                    self.buf.skip_reverse(&mut backward, 11);
                }
                RecTag::New2B => {
                    self.buf.skip_reverse(&mut backward, 12);
                }
                RecTag::New4B => {
                    self.buf.skip_reverse(&mut backward, 14);
                }
                RecTag::New8B => {
                    self.buf.skip_reverse(&mut backward, 18);
                }
                RecTag::NewVchar => {
                    self.buf.read_reverse(&mut backward, &mut tmp[..5]);
                    let len = get_u32(&tmp, 0) as usize;
                    self.buf.skip_reverse(&mut backward, 13 + len);
                }
                RecTag::Write1B => {
                    self.buf.read_reverse(&mut backward, &mut tmp[..12]);
                    let addr = get_u64(&tmp, 1) as *mut u8;
                    // SAFETY: the record was written for a live location.
                    unsafe { addr.write(tmp[9]) };
                    flush::flush_line(addr.cast_const());
                }
                RecTag::Write2B => {
                    self.buf.read_reverse(&mut backward, &mut tmp[..14]);
                    let addr = get_u64(&tmp, 1) as *mut u16;
                    let old = u16::from_le_bytes(tmp[9..11].try_into().unwrap());
                    // SAFETY: as above.
                    unsafe { addr.write(old) };
                    flush::flush_range(addr.cast::<u8>().cast_const(), unsafe {
                        addr.cast::<u8>().add(1).cast_const()
                    });
                }
                RecTag::Write4B => {
                    self.buf.read_reverse(&mut backward, &mut tmp[..18]);
                    let addr = get_u64(&tmp, 1) as *mut u32;
                    let old = get_u32(&tmp, 9);
                    // SAFETY: as above.
                    unsafe { addr.write(old) };
                    flush::flush_range(addr.cast::<u8>().cast_const(), unsafe {
                        addr.cast::<u8>().add(3).cast_const()
                    });
                }
                RecTag::Write8B => {
                    self.buf.read_reverse(&mut backward, &mut tmp[..26]);
                    let addr = get_u64(&tmp, 1) as *mut u64;
                    let old = get_u64(&tmp, 9);
                    // SAFETY: as above.
                    unsafe { addr.write(old) };
                    flush::flush_range(addr.cast::<u8>().cast_const(), unsafe {
                        addr.cast::<u8>().add(7).cast_const()
                    });
                }
                RecTag::WriteVchar => {
                    self.buf.read_reverse(&mut backward, &mut tmp[..5]);
                    let len = get_u32(&tmp, 0) as usize;
                    let mut body = vec![0u8; 13 + len + len];
                    self.buf.read_reverse(&mut backward, &mut body);
                    let addr = get_u64(&body, 1) as *mut u8;
                    // SAFETY: as above; old value occupies body[13..13+len].
                    unsafe {
                        std::ptr::copy_nonoverlapping(body.as_ptr().add(13), addr, len);
                    }
                    flush::flush_range(addr.cast_const(), unsafe {
                        addr.add(len - 1).cast_const()
                    });
                }
                RecTag::AllocNode => {
                    self.buf.read_reverse(&mut backward, &mut tmp[..10]);
                    let addr = get_u64(&tmp, 1) as *mut u8;
                    arena.free_node(addr);
                }
                RecTag::NextChunk => {
                    self.buf.skip_reverse(&mut backward, 1);
                }
                _ => {
                    eprintln!("nvm log: unexpected record {tag:?} during abort");
                    std::process::exit(1);
                }
            }
        }

        flush::fence();

        self.buf.write(&[RecTag::Abort as u8]);
        self.buf.flush();
    }

    // ========================================================================
    //  Scanning / diagnostics
    // ========================================================================

    /// Decode the tags of every record between the last transaction start
    /// and the current write position, in forward order.
    ///
    /// This is the same walk a recovery scanner performs. Fatal on an
    /// undecodable tag.
    pub fn scan_since_tx(&mut self) -> Vec<RecTag> {
        let mut pos = self.tx_pos;
        self.buf.prepare_for_read(&mut pos);
        let end = self.buf.cur_pos().next;

        let mut out = Vec::new();
        let mut tmp = [0u8; 16];
        while pos.next != end {
            let tag_byte = self.buf.byte_at(pos.next);
            let Some(tag) = RecTag::from_byte(tag_byte) else {
                eprintln!("nvm log: invalid record tag {tag_byte:#04x} during scan");
                std::process::exit(1);
            };
            match tag {
                RecTag::New1B => {
                    self.buf.skip(&mut pos, 11);
                }
                RecTag::New2B => {
                    self.buf.skip(&mut pos, 12);
                }
                RecTag::New4B => {
                    self.buf.skip(&mut pos, 14);
                }
                RecTag::New8B => {
                    self.buf.skip(&mut pos, 18);
                }
                RecTag::Write1B => {
                    self.buf.skip(&mut pos, 12);
                }
                RecTag::Write2B => {
                    self.buf.skip(&mut pos, 14);
                }
                RecTag::Write4B => {
                    self.buf.skip(&mut pos, 18);
                }
                RecTag::Write8B => {
                    self.buf.skip(&mut pos, 26);
                }
                RecTag::Redo1B => {
                    self.buf.skip(&mut pos, 11);
                }
                RecTag::Redo2B => {
                    self.buf.skip(&mut pos, 12);
                }
                RecTag::Redo4B => {
                    self.buf.skip(&mut pos, 14);
                }
                RecTag::Redo8B => {
                    self.buf.skip(&mut pos, 18);
                }
                RecTag::NewVchar | RecTag::RedoVchar => {
                    self.buf.read(&mut pos, &mut tmp[..13]);
                    let len = get_u32(&tmp, 9) as usize;
                    self.buf.skip(&mut pos, len + 5);
                }
                RecTag::WriteVchar => {
                    self.buf.read(&mut pos, &mut tmp[..13]);
                    let len = get_u32(&tmp, 9) as usize;
                    self.buf.skip(&mut pos, len + len + 5);
                }
                RecTag::AllocNode => {
                    self.buf.skip(&mut pos, 10);
                }
                RecTag::DelNode => {
                    self.buf.read(&mut pos, &mut tmp[..5]);
                    let n = get_u32(&tmp, 1) as usize;
                    self.buf.skip(&mut pos, n * 8 + 5);
                }
                RecTag::Invalid | RecTag::NextChunk => {
                    // Terminator of a sealed partial line: step over the rest
                    // of the line.
                    let rest = pos.nextline - pos.next;
                    self.buf.skip(&mut pos, rest);
                }
                RecTag::Commit | RecTag::Abort | RecTag::Ongoing => {
                    self.buf.skip(&mut pos, 1);
                }
            }
            if tag != RecTag::Invalid {
                out.push(tag);
            }
        }
        out
    }

    /// Print the decoded records of the current transaction window.
    pub fn print(&mut self) {
        for tag in self.scan_since_tx() {
            println!("{tag:?}");
        }
    }
}

// ============================================================================
//  NvmLogSet
// ============================================================================

/// One [`NvmLog`] per worker, indexed by [`worker_id`].
pub struct NvmLogSet {
    logs: Box<[UnsafeCell<NvmLog>]>,
}

// SAFETY: each inner log is touched only by the thread bound to its worker
// id (the same contract as the arenas).
unsafe impl Send for NvmLogSet {}
unsafe impl Sync for NvmLogSet {}

impl NvmLogSet {
    /// Create one log per worker, each ring allocated from that worker's
    /// NVM arena.
    #[must_use]
    pub fn init(nvm: &NvmPoolSet) -> Self {
        let logs = (0..nvm.num_workers())
            .map(|w| UnsafeCell::new(NvmLog::new(nvm.arena_for(w))))
            .collect();
        Self { logs }
    }

    /// Number of logs.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.logs.len()
    }

    /// The calling worker's log.
    ///
    /// # Safety
    ///
    /// The caller must be the only thread currently bound to this worker id;
    /// the returned reference must not outlive that exclusivity.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn local(&self) -> &mut NvmLog {
        unsafe { &mut *self.logs[worker_id()].get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::{MB, MemPoolSet, set_worker_id};

    fn dram_log() -> (MemPoolSet, NvmLog) {
        let pools = MemPoolSet::init(1, 4 * MB, 4096);
        set_worker_id(0);
        let log = NvmLog::new(pools.arena());
        (pools, log)
    }

    #[test]
    fn write_then_commit_keeps_new_value() {
        let (pools, mut log) = dram_log();
        let mut x: u64 = 11;

        log.start();
        unsafe { log.write8b(&mut x, 22) };
        assert_eq!(x, 22);
        log.commit(pools.arena());
        assert_eq!(x, 22);

        let tags = log.scan_since_tx();
        assert_eq!(tags, vec![RecTag::Write8B, RecTag::Commit]);
    }

    #[test]
    fn write_then_abort_restores_old_value() {
        let (pools, mut log) = dram_log();
        let mut x: u64 = 0xdead;

        log.start();
        unsafe { log.write8b(&mut x, 0xbeef) };
        assert_eq!(x, 0xbeef);
        log.abort(pools.arena());
        assert_eq!(x, 0xdead);

        let tags = log.scan_since_tx();
        assert_eq!(tags.last(), Some(&RecTag::Abort));
    }

    #[test]
    fn mixed_width_abort_restores_everything() {
        let (pools, mut log) = dram_log();
        let mut a: u8 = 1;
        let mut b: u16 = 2;
        let mut c: u32 = 3;
        let mut d: u64 = 4;
        let mut s = *b"hello";

        log.start();
        unsafe {
            log.write1b(&mut a, 0x11);
            log.write2b(&mut b, 0x22);
            log.write4b(&mut c, 0x33);
            log.write8b(&mut d, 0x44);
            log.write_vchar(s.as_mut_ptr(), b"world");
        }
        assert_eq!((a, b, c, d), (0x11, 0x22, 0x33, 0x44));
        assert_eq!(&s, b"world");

        log.abort(pools.arena());
        assert_eq!((a, b, c, d), (1, 2, 3, 4));
        assert_eq!(&s, b"hello");
    }

    #[test]
    fn redo_writes_apply_only_at_commit() {
        let (pools, mut log) = dram_log();
        let mut y: u64 = 7;

        log.start();
        log.redo_write8b(&mut y, 99);
        assert_eq!(y, 7, "redo is buffered, not applied");
        log.commit(pools.arena());
        assert_eq!(y, 99);

        let tags = log.scan_since_tx();
        assert_eq!(tags, vec![RecTag::Redo8B, RecTag::Commit]);
    }

    #[test]
    fn empty_commit_writes_nothing() {
        let (pools, mut log) = dram_log();
        log.start();
        log.commit(pools.arena());
        assert!(log.scan_since_tx().is_empty());
    }

    #[test]
    fn new_records_are_undone_by_skipping() {
        let (pools, mut log) = dram_log();
        let mut x: u64 = 0;

        log.start();
        unsafe { log.new8b(&mut x, 123) };
        assert_eq!(x, 123);
        log.abort(pools.arena());
        // `new` assumed the slot held nothing meaningful: not restored.
        assert_eq!(x, 123);
    }

    #[test]
    fn alloc_node_is_reclaimed_on_abort() {
        let (pools, mut log) = dram_log();
        set_worker_id(0);
        let arena = pools.arena();
        let before = arena.free_node_count();

        log.start();
        let p = log.alloc_node(256, arena);
        assert!(!p.is_null());
        log.abort(arena);

        assert_eq!(arena.free_node_count(), before + 1);
    }

    #[test]
    fn del_node_frees_only_after_commit() {
        let (pools, mut log) = dram_log();
        let arena = pools.arena();
        let p = arena.alloc_node(256);

        log.start();
        log.del_node(p);
        assert_eq!(arena.free_node_count(), 0);
        log.commit(arena);
        assert_eq!(arena.free_node_count(), 1);
    }
}
