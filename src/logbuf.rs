//! Cache-line-structured wrap-around log buffer on NVM.
//!
//! One [`LogBuffer`] exists per worker thread. The ring is a power-of-two
//! multiple of the 64-byte cache line; each line has the layout
//!
//! ```text
//! +-----------+--------+-------------+-----+---------------+
//! | flag byte | offset | log byte[2] | ... | log byte[63]  |
//! +-----------+--------+-------------+-----+---------------+
//! ```
//!
//! where the flag byte packs a 7-bit checksum with a 1-bit version, and
//! `offset` is the byte index within the line of the first record that
//! starts in it (0 if none). The version flips every time the writer wraps
//! from the last line back to the first, so a reader can tell bytes written
//! in this epoch from stale bytes of the previous one. A line is readable
//! only if its recomputed checksum and the expected version both match the
//! flag byte; a mismatch simultaneously detects torn writes and epoch
//! boundaries and is treated as end-of-log.
//!
//! Record bytes flow through lines back to back; a record may straddle any
//! number of lines. Whenever a line fills, its flag and offset bytes are
//! sealed and the line is flushed. [`LogBuffer::flush`] seals the current
//! partial line (terminated by a 0x00 sentinel byte) and fences.
//!
//! Readers walk the ring forward or backward from a snapshot [`LogPos`];
//! both directions stop at the first unreadable line.

use crate::flush::{self, CACHE_LINE_SIZE};
use crate::mempool::{Arena, MB};

/// Bytes of log ring per worker thread.
pub const NVM_LOG_SIZE: usize = MB;

/// Payload bytes per line (the first two bytes are flag and offset).
const LINE_PAYLOAD: usize = CACHE_LINE_SIZE - 2;

/// Version bit stored in the flag byte.
const VERSION_BIT: u8 = 0x80;

/// A snapshot position in the log.
///
/// `next` is the offset of the next byte to write (or read); `nextline` is
/// the offset of the line boundary just past the line `next` lies in for
/// forward traversal, or the start of that line for reverse traversal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogPos {
    pub(crate) version: u8,
    pub(crate) offset: u8,
    pub(crate) nextline: usize,
    pub(crate) next: usize,
}

/// The per-thread log ring.
///
/// Writing requires `&mut self`; the buffer is owned by exactly one worker
/// thread (see [`crate::minilog::NvmLogSet`]).
pub struct LogBuffer {
    area: *mut u8,
    size: usize,
    wr: LogPos,
}

// SAFETY: the ring memory is exclusively owned by this buffer; access is
// single-threaded by the per-worker protocol.
unsafe impl Send for LogBuffer {}

impl LogBuffer {
    /// Allocate the default-sized ring from the worker's NVM arena.
    #[must_use]
    pub fn init(arena: &Arena) -> Self {
        Self::init_with_size(arena, NVM_LOG_SIZE)
    }

    /// Allocate a ring of `size` bytes (a multiple of the cache line), zero
    /// it, flush it and position the write cursor at byte 2 of line 0 with
    /// version 0.
    #[must_use]
    pub fn init_with_size(arena: &Arena, size: usize) -> Self {
        assert!(
            size >= 2 * CACHE_LINE_SIZE && size % CACHE_LINE_SIZE == 0,
            "log size must be a multiple of the cache line"
        );
        let area = arena.alloc(size);
        assert_eq!(
            area as usize % CACHE_LINE_SIZE,
            0,
            "log area is not line aligned"
        );

        // SAFETY: the arena handed us `size` bytes.
        unsafe {
            std::ptr::write_bytes(area, 0, size);
        }
        flush::flush_range(area, unsafe { area.add(size - 1) });
        flush::fence();

        let mut buf = Self {
            area,
            size,
            wr: LogPos {
                version: VERSION_BIT, // flipped to 0 by prepare_for_writing
                offset: 0,
                nextline: size,
                next: size,
            },
        };
        buf.prepare_for_writing();
        buf
    }

    /// Reset the write cursor to the start of the ring and flip the version.
    fn prepare_for_writing(&mut self) {
        self.wr.version ^= VERSION_BIT;
        self.wr.offset = 0;
        self.wr.nextline = CACHE_LINE_SIZE;
        self.wr.next = 2;
    }

    // ========================================================================
    //  Byte access
    // ========================================================================

    #[inline]
    fn byte(&self, off: usize) -> u8 {
        debug_assert!(off < self.size);
        // SAFETY: off < size.
        unsafe { self.area.add(off).read() }
    }

    #[inline]
    fn set_byte(&mut self, off: usize, v: u8) {
        debug_assert!(off < self.size);
        // SAFETY: off < size; we own the ring.
        unsafe { self.area.add(off).write(v) }
    }

    /// The byte at `off`, for forward-scan tag dispatch.
    #[inline]
    #[must_use]
    pub fn byte_at(&self, off: usize) -> u8 {
        self.byte(off)
    }

    /// The byte just before `off`, for reverse-scan tag dispatch.
    #[inline]
    #[must_use]
    pub fn byte_before(&self, off: usize) -> u8 {
        self.byte(off - 1)
    }

    // ========================================================================
    //  Checksum / flag byte
    // ========================================================================

    /// Sum the eight 8-byte words of a line (flag byte masked out) and fold
    /// the sum down to one byte.
    fn checksum(&self, line: usize) -> u8 {
        debug_assert_eq!(line % CACHE_LINE_SIZE, 0);
        // SAFETY: line is a 64-byte-aligned offset within the ring.
        let p = unsafe { self.area.add(line).cast::<u64>() };
        let mut v: u64 = unsafe { p.read() } & !0xffu64;
        for i in 1..8 {
            v = v.wrapping_add(unsafe { p.add(i).read() });
        }
        v = v.wrapping_add(v >> 32);
        v = v.wrapping_add(v >> 16);
        v = v.wrapping_add(v >> 8);
        v as u8
    }

    fn seal_line(&mut self, line: usize, version: u8) {
        let flag = (self.checksum(line) & 0x7f) | version;
        self.set_byte(line, flag);
    }

    /// Whether a line's flag byte matches its contents and the expected
    /// version. False means torn write or different epoch: end of log.
    fn check_line(&self, line: usize, version: u8) -> bool {
        self.byte(line) == ((self.checksum(line) & 0x7f) | version)
    }

    // ========================================================================
    //  Writing
    // ========================================================================

    /// Seal the just-filled line, flush it, and advance to the next line
    /// (wrapping with a version flip at the end of the ring).
    fn complete_line(&mut self) {
        let line = self.wr.nextline - CACHE_LINE_SIZE;
        let offset = self.wr.offset;
        self.set_byte(line + 1, offset);
        let version = self.wr.version;
        self.seal_line(line, version);
        // SAFETY: line is in bounds.
        flush::flush_line(unsafe { self.area.add(line) });
        flush::fence();

        if self.wr.nextline < self.size {
            self.wr.offset = 0;
            self.wr.next = self.wr.nextline + 2;
            self.wr.nextline += CACHE_LINE_SIZE;
        } else {
            self.prepare_for_writing();
        }
    }

    /// Append `rec` to the log, spanning lines as needed.
    pub fn write(&mut self, rec: &[u8]) {
        let mut rec = rec;
        let mut room = self.wr.nextline - self.wr.next;
        if self.wr.offset == 0 {
            self.wr.offset = (CACHE_LINE_SIZE - room) as u8;
        }

        while rec.len() >= room {
            // SAFETY: [next, next+room) lies inside the current line.
            unsafe {
                std::ptr::copy_nonoverlapping(rec.as_ptr(), self.area.add(self.wr.next), room);
            }
            rec = &rec[room..];
            self.complete_line();
            room = LINE_PAYLOAD;
        }

        if !rec.is_empty() {
            // SAFETY: rec.len() < room, still inside the current line.
            unsafe {
                std::ptr::copy_nonoverlapping(rec.as_ptr(), self.area.add(self.wr.next), rec.len());
            }
            self.wr.next += rec.len();
        }
    }

    /// Seal the current partial line (0x00 terminator in the first unused
    /// byte), flush it, and fence.
    pub fn flush(&mut self) {
        let line = self.wr.nextline - CACHE_LINE_SIZE;
        if self.wr.next - line > 2 {
            let next = self.wr.next;
            let offset = self.wr.offset;
            self.set_byte(next, 0x00);
            self.set_byte(line + 1, offset);
            let version = self.wr.version;
            self.seal_line(line, version);
            // SAFETY: line is in bounds.
            flush::flush_line(unsafe { self.area.add(line) });
        }
        flush::fence();
    }

    // ========================================================================
    //  Read positioning
    // ========================================================================

    /// Snapshot the current write position.
    #[must_use]
    pub fn cur_pos(&self) -> LogPos {
        self.wr
    }

    /// Whether `pos` still equals the current write position.
    #[must_use]
    pub fn is_same_as_cur(&self, pos: &LogPos) -> bool {
        pos.next == self.wr.next
    }

    /// Make everything up to the write cursor readable from `pos` forward.
    pub fn prepare_for_read(&mut self, _pos: &mut LogPos) {
        self.flush();
    }

    /// Make everything readable backward from `pos`.
    ///
    /// Normalizes a cursor sitting on a line's header bytes down to the end
    /// of the previous line (so the byte before the cursor is always the
    /// trailing tag of a record), aligns `nextline`, and takes the version
    /// from the current line's flag byte.
    pub fn prepare_for_reverse_read(&mut self, pos: &mut LogPos) {
        self.flush();
        pos.next = self.reverse_adjust(pos.next);
        pos.nextline = if pos.next % CACHE_LINE_SIZE == 0 {
            pos.next - CACHE_LINE_SIZE
        } else {
            flush::line_of(pos.next)
        };
        pos.version = self.byte(pos.nextline) & VERSION_BIT;
    }

    /// Adjust a raw position for reverse reading: a pointer at byte 2 of a
    /// line is moved to the line start, because reverse reads step from byte
    /// 2 straight across the header bytes.
    #[must_use]
    pub fn reverse_adjust(&self, mut off: usize) -> usize {
        if off % CACHE_LINE_SIZE <= 2 {
            off -= 2;
            if off == 0 {
                off = self.size;
            }
        }
        off
    }

    // ========================================================================
    //  Forward reading
    // ========================================================================

    /// Read up to `buf.len()` bytes at `pos`, advancing it. Returns the
    /// number of bytes read; 0 means end of log (checksum/version mismatch).
    pub fn read(&self, pos: &mut LogPos, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        let mut len = buf.len();
        let mut chunk = pos.nextline - pos.next;

        while len > 0 && self.check_line(pos.nextline - CACHE_LINE_SIZE, pos.version) {
            if len < chunk {
                chunk = len;
            }
            // SAFETY: [next, next+chunk) is inside the ring.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.area.add(pos.next),
                    buf.as_mut_ptr().add(copied),
                    chunk,
                );
            }
            copied += chunk;
            len -= chunk;
            pos.next += chunk;

            if pos.next == pos.nextline {
                self.advance_line(pos);
                chunk = LINE_PAYLOAD;
            }
        }
        copied
    }

    /// Skip up to `len` bytes at `pos`. Returns bytes skipped; 0 = end of log.
    pub fn skip(&self, pos: &mut LogPos, len: usize) -> usize {
        let mut skipped = 0;
        let mut len = len;
        let mut chunk = pos.nextline - pos.next;

        while len > 0 && self.check_line(pos.nextline - CACHE_LINE_SIZE, pos.version) {
            if len < chunk {
                chunk = len;
            }
            skipped += chunk;
            len -= chunk;
            pos.next += chunk;

            if pos.next == pos.nextline {
                self.advance_line(pos);
                chunk = LINE_PAYLOAD;
            }
        }
        skipped
    }

    fn advance_line(&self, pos: &mut LogPos) {
        if pos.nextline < self.size {
            pos.next += 2;
            pos.nextline += CACHE_LINE_SIZE;
        } else {
            pos.version ^= VERSION_BIT;
            pos.next = 2;
            pos.nextline = CACHE_LINE_SIZE;
        }
        pos.offset = self.byte(pos.next - 1);
    }

    // ========================================================================
    //  Reverse reading
    // ========================================================================

    /// Read up to `buf.len()` bytes backward from `pos`.
    ///
    /// The bytes land at the tail of `buf`: after a return value of `n`,
    /// `buf[buf.len() - n..]` holds the data in forward order.
    pub fn read_reverse(&self, pos: &mut LogPos, buf: &mut [u8]) -> usize {
        let total = buf.len();
        let mut p = total;
        let mut len = total;
        let mut chunk = (pos.next - pos.nextline) - 2;

        while len > 0 && self.check_line(pos.nextline, pos.version) {
            if len < chunk {
                chunk = len;
            }
            p -= chunk;
            pos.next -= chunk;
            len -= chunk;
            // SAFETY: [next, next+chunk) is inside the ring.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.area.add(pos.next),
                    buf.as_mut_ptr().add(p),
                    chunk,
                );
            }

            if pos.next - 2 == pos.nextline {
                self.retreat_line(pos);
                chunk = LINE_PAYLOAD;
            }
        }
        total - p
    }

    /// Skip up to `len` bytes backward from `pos`.
    pub fn skip_reverse(&self, pos: &mut LogPos, len: usize) -> usize {
        let mut skipped = 0;
        let mut len = len;
        let mut chunk = (pos.next - pos.nextline) - 2;

        while len > 0 && self.check_line(pos.nextline, pos.version) {
            if len < chunk {
                chunk = len;
            }
            skipped += chunk;
            pos.next -= chunk;
            len -= chunk;

            if pos.next - 2 == pos.nextline {
                self.retreat_line(pos);
                chunk = LINE_PAYLOAD;
            }
        }
        skipped
    }

    fn retreat_line(&self, pos: &mut LogPos) {
        if pos.nextline > 0 {
            pos.next = pos.nextline;
            pos.nextline -= CACHE_LINE_SIZE;
        } else {
            pos.version ^= VERSION_BIT;
            pos.next = self.size;
            pos.nextline = self.size - CACHE_LINE_SIZE;
        }
        pos.offset = self.byte(pos.nextline + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::{MemPoolSet, set_worker_id};

    fn dram_log() -> (MemPoolSet, LogBuffer) {
        // The log only needs a line-aligned arena; DRAM stands in for NVM.
        let pools = MemPoolSet::init(1, 2 * NVM_LOG_SIZE, 4096);
        set_worker_id(0);
        let buf = LogBuffer::init(pools.arena());
        (pools, buf)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_pools, mut log) = dram_log();

        let pos0 = log.cur_pos();
        let rec: Vec<u8> = (0u8..200).collect();
        log.write(&rec);
        log.flush();

        let mut rd = pos0;
        log.prepare_for_read(&mut rd);
        let mut back = vec![0u8; rec.len()];
        assert_eq!(log.read(&mut rd, &mut back), rec.len());
        assert_eq!(back, rec);
    }

    #[test]
    fn skip_forward_matches_read_forward() {
        let (_pools, mut log) = dram_log();

        let pos0 = log.cur_pos();
        let rec = [0xaau8; 300];
        log.write(&rec);
        log.flush();

        let mut rd1 = pos0;
        let mut rd2 = pos0;
        log.prepare_for_read(&mut rd1);
        let mut sink = vec![0u8; 300];
        assert_eq!(log.read(&mut rd1, &mut sink), 300);
        assert_eq!(log.skip(&mut rd2, 300), 300);
        assert_eq!(rd1, rd2);
    }

    #[test]
    fn reverse_read_returns_tail_bytes() {
        let (_pools, mut log) = dram_log();

        let rec: Vec<u8> = (0u8..120).collect();
        log.write(&rec);

        let mut pos = log.cur_pos();
        log.prepare_for_reverse_read(&mut pos);
        let mut buf = [0u8; 40];
        assert_eq!(log.read_reverse(&mut pos, &mut buf), 40);
        assert_eq!(&buf[..], &rec[80..120]);
    }

    #[test]
    fn wrap_flips_version_and_stops_stale_readers() {
        let pools = MemPoolSet::init(1, 2 * MB, 4096);
        set_worker_id(0);
        // A 256-byte ring (4 lines) wraps quickly.
        let mut log = LogBuffer::init_with_size(pools.arena(), 256);

        let pos0 = log.cur_pos();

        // 300 bytes > ring capacity: the writer wraps and reseals line 0 in
        // the next epoch.
        let rec = [0x55u8; 300];
        log.write(&rec);
        log.flush();

        assert_ne!(log.cur_pos().version, pos0.version, "wrap flips the version");

        // A reader holding the pre-wrap position sees line 0's flag byte
        // disagree with its own epoch and stops immediately.
        let mut rd = pos0;
        let mut buf = [0u8; 64];
        assert_eq!(log.read(&mut rd, &mut buf), 0);
        assert_eq!(log.skip(&mut rd, 64), 0);
    }
}
