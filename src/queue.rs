//! The chunk queue: an ordered sequence of memory and file chunks with
//! lifetime byte counters.
//!
//! Every operation preserves the invariant that the sum of unconsumed chunk
//! lengths equals `bytes_in - bytes_out`.

use crate::chunk::{Chunk, FileChunk, MemChunk};
use crate::pool::ChunkPool;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{ErrorKind, Result};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// A FIFO of byte runs held in memory buffers or file regions.
pub struct ChunkQueue {
	pub(crate) chunks: VecDeque<Chunk>,
	pub(crate) bytes_in: u64,
	pub(crate) bytes_out: u64,
	pub(crate) pool: ChunkPool,
	pub(crate) tempdirs: Vec<PathBuf>,
	/// Index of the spillover directory currently in use; advanced
	/// permanently when a directory fills up.
	pub(crate) tempdir_idx: usize,
	pub(crate) upload_temp_file_size: u64,
	/// Committed length of the tail buffer while a write cursor is
	/// outstanding.
	pub(crate) cursor_mark: Option<usize>,
}

impl std::fmt::Debug for ChunkQueue {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChunkQueue")
			.field("chunks", &self.chunks)
			.field("bytes_in", &self.bytes_in)
			.field("bytes_out", &self.bytes_out)
			.finish()
	}
}

impl ChunkQueue {
	/// Constructs an empty queue drawing buffers from `pool` and inheriting
	/// the pool's default spillover configuration.
	#[must_use]
	pub fn new(pool: &ChunkPool) -> Self {
		let (tempdirs, upload_temp_file_size) = pool.default_spill();
		Self {
			chunks: VecDeque::new(),
			bytes_in: 0,
			bytes_out: 0,
			pool: pool.clone(),
			tempdirs,
			tempdir_idx: 0,
			upload_temp_file_size,
			cursor_mark: None,
		}
	}

	/// Returns the pool this queue draws buffers from.
	#[must_use]
	pub fn pool(&self) -> &ChunkPool {
		&self.pool
	}

	/// Overrides the spillover directories and rotation size for this queue.
	///
	/// A `tempfile_size` of zero keeps the current rotation size.
	pub fn set_tempdirs(&mut self, dirs: Vec<PathBuf>, tempfile_size: u64) {
		self.tempdirs = dirs;
		self.tempdir_idx = 0;
		if tempfile_size != 0 {
			self.upload_temp_file_size = tempfile_size;
		}
	}

	/// Returns the number of unconsumed bytes, computed by walking the
	/// chunks.
	#[must_use]
	pub fn len(&self) -> u64 {
		self.chunks.iter().map(Chunk::remaining).sum()
	}

	/// Returns whether the queue holds no unconsumed bytes.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.chunks.iter().all(|c| c.remaining() == 0)
	}

	/// Returns the lifetime count of bytes appended.
	#[must_use]
	pub fn bytes_in(&self) -> u64 {
		self.bytes_in
	}

	/// Returns the lifetime count of bytes consumed.
	#[must_use]
	pub fn bytes_out(&self) -> u64 {
		self.bytes_out
	}

	/// Appends a run of bytes.
	///
	/// Small payloads extend the tail memory chunk in place when it has
	/// room; otherwise a fresh chunk sized for the payload plus a one-byte
	/// terminator allowance is taken from the pool.
	pub fn append_bytes(&mut self, data: &[u8]) {
		if data.is_empty() {
			return;
		}
		let small = data.len() < self.pool.chunk_size();
		if !(small && self.try_extend_tail(data)) {
			let mut chunk = self.pool.acquire_mem_chunk(data.len() + 1);
			if let Chunk::Memory(m) = &mut chunk {
				m.buf.extend_from_slice(data);
			}
			self.chunks.push_back(chunk);
		}
		self.bytes_in += data.len() as u64;
	}

	fn try_extend_tail(&mut self, data: &[u8]) -> bool {
		match self.chunks.back_mut() {
			Some(Chunk::Memory(m)) if m.buf.capacity() - m.buf.len() >= data.len() => {
				m.buf.extend_from_slice(data);
				true
			}
			_ => false,
		}
	}

	/// Appends the byte range `offset..offset + length` of the file at
	/// `path`, to be opened lazily when first accessed.
	///
	/// A zero-length range appends nothing.
	pub fn append_file_range(&mut self, path: &Path, offset: u64, length: u64) {
		if length == 0 {
			return;
		}
		let mut fc = self.pool.acquire_file_chunk(path);
		fc.offset = offset;
		fc.length = offset + length;
		self.push_file_chunk(fc, length);
	}

	/// Appends a file range together with an already-open descriptor.
	///
	/// A zero-length range appends nothing; the descriptor is closed rather
	/// than queued.
	pub fn append_file(&mut self, path: &Path, file: File, offset: u64, length: u64) {
		self.append_file_shared(path, Rc::new(file), offset, length);
	}

	/// Appends a file range sharing a descriptor that other chunks or a
	/// cache may also hold.
	///
	/// A zero-length range appends nothing; the descriptor reference is
	/// dropped.
	pub fn append_file_shared(&mut self, path: &Path, file: Rc<File>, offset: u64, length: u64) {
		if length == 0 {
			return;
		}
		let mut fc = self.pool.acquire_file_chunk(path);
		fc.file = Some(file);
		fc.offset = offset;
		fc.length = offset + length;
		self.push_file_chunk(fc, length);
	}

	pub(crate) fn push_file_chunk(&mut self, fc: FileChunk, length: u64) {
		self.chunks.push_back(Chunk::File(fc));
		self.bytes_in += length;
	}

	/// Splices the entire contents of `src` onto the end of this queue
	/// without copying. `src` is left empty with its `bytes_out` advanced to
	/// match its `bytes_in`.
	pub fn append_from(&mut self, src: &mut ChunkQueue) {
		let moved = src.len();
		self.chunks.append(&mut src.chunks);
		self.bytes_in += moved;
		src.bytes_out = src.bytes_in;
	}

	/// Appends a copy of the byte range `offset..offset + len` of `src`
	/// (relative to its unconsumed data) without mutating `src`.
	///
	/// Memory content is copied; file regions share the source descriptor.
	pub fn copy_range_from(&mut self, src: &ChunkQueue, mut offset: u64, mut len: u64) {
		for c in &src.chunks {
			if len == 0 {
				break;
			}
			let clen = c.remaining();
			if offset >= clen {
				offset -= clen;
				continue;
			}
			let avail = clen - offset;
			let take = len.min(avail);
			match c {
				Chunk::Memory(m) => {
					let start = m.offset + offset as usize;
					let data = &m.buf[start..start + take as usize];
					// borrow of src, not self; safe to append
					let small = data.len() < self.pool.chunk_size();
					if !(small && self.try_extend_tail(data)) {
						let mut chunk = self.pool.acquire_mem_chunk(data.len() + 1);
						if let Chunk::Memory(nm) = &mut chunk {
							nm.buf.extend_from_slice(data);
						}
						self.chunks.push_back(chunk);
					}
					self.bytes_in += take;
				}
				Chunk::File(f) => {
					let fc = f.share_range(f.offset + offset, take);
					self.push_file_chunk(fc, take);
				}
			}
			len -= take;
			offset = 0;
		}
	}

	/// Moves up to `len` bytes from the front of `src` onto the end of this
	/// queue.
	///
	/// Whole chunks move without copying. A partial memory head is copied
	/// and its cursor advanced; a partial file head is split into a new
	/// chunk sharing the descriptor. Empty chunks at the head of `src` are
	/// dropped along the way.
	pub fn move_range_from(&mut self, src: &mut ChunkQueue, mut len: u64) {
		while len > 0 {
			let clen = match src.chunks.front() {
				Some(c) => c.remaining(),
				None => break,
			};
			if clen == 0 {
				if let Some(c) = src.chunks.pop_front() {
					src.pool.release_chunk(c);
				}
				continue;
			}
			let take = len.min(clen);
			len -= take;
			if take == clen {
				if let Some(c) = src.chunks.pop_front() {
					self.chunks.push_back(c);
					self.bytes_in += take;
				}
			} else {
				match src.chunks.front_mut() {
					Some(Chunk::Memory(m)) => {
						let end = m.offset + take as usize;
						let data = m.buf[m.offset..end].to_vec();
						m.offset = end;
						self.append_bytes(&data);
					}
					Some(Chunk::File(f)) => {
						let fc = f.share_range(f.offset, take);
						f.offset += take;
						self.push_file_chunk(fc, take);
					}
					None => break,
				}
			}
			src.bytes_out += take;
		}
	}

	/// Borrows a writable slice of at least `min` bytes at the tail of the
	/// queue, reusing the tail chunk's spare capacity when possible.
	///
	/// A `min` of zero asks for half a standard chunk. The slice is
	/// zero-initialized; a matching [`commit_write`](Self::commit_write)
	/// must follow before any other queue operation.
	pub fn write_cursor(&mut self, min: usize) -> &mut [u8] {
		let want = if min == 0 {
			self.pool.chunk_size() >> 1
		} else {
			min
		};
		let reuse = match self.chunks.back() {
			Some(Chunk::Memory(m)) => m.buf.capacity() - m.buf.len() >= want,
			_ => false,
		};
		if !reuse {
			let chunk = self.pool.acquire_mem_chunk(want);
			self.chunks.push_back(chunk);
		}
		match self.chunks.back_mut() {
			Some(Chunk::Memory(m)) => {
				let mark = m.buf.len();
				self.cursor_mark = Some(mark);
				let cap = m.buf.capacity();
				m.buf.resize(cap, 0);
				&mut m.buf[mark..]
			}
			// a memory chunk was just ensured above
			_ => unreachable!(),
		}
	}

	/// Commits `n` bytes written through the cursor returned by
	/// [`write_cursor`](Self::write_cursor).
	///
	/// Committing zero bytes into an otherwise-empty tail chunk removes the
	/// chunk again.
	pub fn commit_write(&mut self, n: usize) {
		let mark = self.cursor_mark.take().unwrap_or_else(|| {
			debug_assert!(false, "commit_write without write_cursor");
			0
		});
		if let Some(Chunk::Memory(m)) = self.chunks.back_mut() {
			m.buf.truncate(mark + n);
			if n > 0 {
				self.bytes_in += n as u64;
			} else if m.remaining() == 0 {
				if let Some(c) = self.chunks.pop_back() {
					self.pool.release_chunk(c);
				}
			}
		}
	}

	/// Consumes `len` bytes from the front of the queue, releasing finished
	/// chunks back to the pool.
	pub fn consume(&mut self, mut len: u64) {
		self.bytes_out += len;
		while len > 0 {
			let clen = match self.chunks.front() {
				Some(c) => c.remaining(),
				None => return,
			};
			if len < clen {
				match self.chunks.front_mut() {
					Some(Chunk::Memory(m)) => m.offset += len as usize,
					Some(Chunk::File(f)) => f.offset += len,
					None => {}
				}
				return;
			}
			len -= clen;
			if let Some(c) = self.chunks.pop_front() {
				self.pool.release_chunk(c);
			}
		}
		self.drop_finished_front();
	}

	fn drop_finished_front(&mut self) {
		while self.chunks.front().is_some_and(|c| c.remaining() == 0) {
			if let Some(c) = self.chunks.pop_front() {
				self.pool.release_chunk(c);
			}
		}
	}

	pub(crate) fn remove_empty_chunks(&mut self) {
		let old = std::mem::take(&mut self.chunks);
		for c in old {
			if c.remaining() == 0 {
				self.pool.release_chunk(c);
			} else {
				self.chunks.push_back(c);
			}
		}
	}

	/// Copies up to `out.len()` bytes from the front of the queue into `out`
	/// without consuming them, reading file chunks as needed.
	///
	/// # Errors
	/// Returns file open, validation, and read errors.
	pub fn peek_into(&mut self, out: &mut [u8]) -> Result<usize> {
		let mut filled = 0;
		for c in &mut self.chunks {
			if filled == out.len() {
				break;
			}
			filled += c.peek_into(&mut out[filled..])?;
		}
		Ok(filled)
	}

	/// Fills `out` exactly from the front of the queue and consumes the
	/// bytes.
	///
	/// # Errors
	/// Returns file I/O errors, or `UnexpectedEof` if the queue holds fewer
	/// bytes than `out`.
	pub fn read_into(&mut self, out: &mut [u8]) -> Result<()> {
		let filled = self.peek_into(out)?;
		if filled < out.len() {
			return Err(ErrorKind::UnexpectedEof.into());
		}
		self.consume(out.len() as u64);
		Ok(())
	}

	/// Gathers at least `need` contiguous bytes at the front of the queue by
	/// pulling content forward from following memory chunks.
	///
	/// Gathering stops early at a file chunk or when the queue runs out of
	/// memory content. The head chunk must be a memory chunk.
	pub fn compact_front(&mut self, need: usize) {
		let head_ok = match self.chunks.front() {
			Some(Chunk::Memory(m)) => {
				if m.remaining() >= need {
					return;
				}
				true
			}
			_ => false,
		};
		if !head_ok {
			return;
		}
		self.make_head_room(need);
		loop {
			let have = match self.chunks.front() {
				Some(Chunk::Memory(m)) => m.remaining(),
				_ => return,
			};
			if have >= need {
				return;
			}
			let mut next = match self.chunks.get(1) {
				Some(Chunk::Memory(_)) => match self.chunks.remove(1) {
					Some(c) => c,
					None => return,
				},
				_ => return,
			};
			let head = match self.chunks.front_mut() {
				Some(Chunk::Memory(m)) => m,
				// checked above; the head cannot have changed
				_ => unreachable!(),
			};
			if let Chunk::Memory(m2) = &mut next {
				let spare = head.buf.capacity() - head.buf.len();
				let take = m2.remaining().min(spare);
				let end = m2.offset + take;
				head.buf.extend_from_slice(&m2.buf[m2.offset..end]);
				m2.offset = end;
				if m2.remaining() == 0 {
					self.pool.release_chunk(next);
				} else {
					// head is out of room
					self.chunks.insert(1, next);
					return;
				}
			}
		}
	}

	/// Ensures the head memory chunk can hold `need` bytes, either by
	/// shifting its content to the start of the buffer or by replacing the
	/// buffer with a larger one.
	fn make_head_room(&mut self, need: usize) {
		let replace = match self.chunks.front_mut() {
			Some(Chunk::Memory(m)) => {
				if m.buf.capacity() > need {
					if m.buf.capacity() - m.buf.len() < need - m.remaining() {
						m.buf.drain(..m.offset);
						m.offset = 0;
					}
					false
				} else {
					true
				}
			}
			_ => return,
		};
		if replace {
			let mut bigger = self.pool.acquire_buffer_sized(need + 1);
			if let Some(Chunk::Memory(m)) = self.chunks.front_mut() {
				bigger.extend_from_slice(m.content());
				std::mem::swap(&mut m.buf, &mut bigger);
				m.offset = 0;
				self.pool.release_buffer(bigger);
			}
		}
	}

	/// Replaces the queue's contents with a single memory chunk holding the
	/// same bytes and returns a view of them. Counters are unchanged.
	///
	/// # Errors
	/// Returns file I/O errors from reading file chunks.
	pub fn squash(&mut self) -> Result<&[u8]> {
		let total = self.len();
		let single_mem = self.chunks.len() == 1
			&& matches!(self.chunks.front(), Some(Chunk::Memory(_)));
		if !single_mem {
			let mut buf = self.pool.acquire_buffer_sized(total as usize + 1);
			buf.resize(total as usize, 0);
			let filled = self.peek_into(&mut buf)?;
			if filled < total as usize {
				self.pool.release_buffer(buf);
				return Err(ErrorKind::UnexpectedEof.into());
			}
			while let Some(c) = self.chunks.pop_front() {
				self.pool.release_chunk(c);
			}
			self.chunks.push_back(Chunk::Memory(MemChunk { buf, offset: 0 }));
		}
		match self.chunks.front() {
			Some(Chunk::Memory(m)) => Ok(m.content()),
			// a memory chunk was just ensured above
			_ => unreachable!(),
		}
	}

	/// Releases every chunk through the pool and zeroes the counters.
	pub fn reset(&mut self) {
		while let Some(c) = self.chunks.pop_front() {
			self.pool.release_chunk(c);
		}
		self.bytes_in = 0;
		self.bytes_out = 0;
		self.tempdir_idx = 0;
		self.cursor_mark = None;
	}
}

impl Drop for ChunkQueue {
	fn drop(&mut self) {
		while let Some(c) = self.chunks.pop_front() {
			self.pool.release_chunk(c);
		}
	}
}

#[cfg(test)]
mod test {
	use super::ChunkQueue;
	use crate::pool::ChunkPool;
	use std::io::Write as _;

	fn check(q: &ChunkQueue) {
		assert_eq!(q.len(), q.bytes_in() - q.bytes_out());
	}

	fn fixture(content: &[u8]) -> tempfile::NamedTempFile {
		let mut f = tempfile::NamedTempFile::new().unwrap();
		f.write_all(content).unwrap();
		f.flush().unwrap();
		f
	}

	/// Tests that appending then consuming in arbitrary pieces yields the
	/// original bytes and keeps the counters consistent.
	#[test]
	fn append_consume_round_trip() {
		let pool = ChunkPool::new();
		let mut q = ChunkQueue::new(&pool);
		q.append_bytes(b"hello ");
		q.append_bytes(b"world");
		check(&q);
		let mut out = [0_u8; 11];
		q.read_into(&mut out).unwrap();
		assert_eq!(&out, b"hello world");
		check(&q);
		assert!(q.is_empty());
		assert_eq!(q.bytes_in(), 11);
		assert_eq!(q.bytes_out(), 11);
	}

	/// Tests that small appends extend the tail chunk instead of growing
	/// the chunk list.
	#[test]
	fn small_appends_share_a_chunk() {
		let pool = ChunkPool::new();
		let mut q = ChunkQueue::new(&pool);
		for _ in 0..10 {
			q.append_bytes(b"x");
		}
		assert_eq!(q.chunks.len(), 1);
		check(&q);
	}

	/// Tests partial consumption within a chunk.
	#[test]
	fn partial_consume() {
		let pool = ChunkPool::new();
		let mut q = ChunkQueue::new(&pool);
		q.append_bytes(b"abcdef");
		q.consume(2);
		check(&q);
		let mut out = [0_u8; 4];
		q.peek_into(&mut out).unwrap();
		assert_eq!(&out, b"cdef");
		check(&q);
	}

	/// Tests that a zero-length file append is a no-op.
	#[test]
	fn zero_length_file_append() {
		let pool = ChunkPool::new();
		let mut q = ChunkQueue::new(&pool);
		let f = fixture(b"data");
		q.append_file_range(f.path(), 0, 0);
		assert!(q.is_empty());
		assert_eq!(q.bytes_in(), 0);
		assert_eq!(q.chunks.len(), 0);
	}

	/// Tests reading through a mix of memory and file chunks.
	#[test]
	fn mixed_chunk_read() {
		let pool = ChunkPool::new();
		let mut q = ChunkQueue::new(&pool);
		let f = fixture(b"0123456789");
		q.append_bytes(b"head:");
		q.append_file_range(f.path(), 2, 5);
		q.append_bytes(b":tail");
		check(&q);
		let mut out = vec![0_u8; q.len() as usize];
		q.read_into(&mut out).unwrap();
		assert_eq!(&out, b"head:23456:tail");
		check(&q);
	}

	/// Tests the O(1) whole-queue splice.
	#[test]
	fn append_from_drains_source() {
		let pool = ChunkPool::new();
		let mut a = ChunkQueue::new(&pool);
		let mut b = ChunkQueue::new(&pool);
		a.append_bytes(b"first");
		b.append_bytes(b"second");
		a.append_from(&mut b);
		assert!(b.is_empty());
		assert_eq!(b.bytes_out(), b.bytes_in());
		check(&a);
		check(&b);
		let mut out = vec![0_u8; 11];
		a.read_into(&mut out).unwrap();
		assert_eq!(&out, b"firstsecond");
	}

	/// Tests that moving a range conserves total bytes across both queues.
	#[test]
	fn move_range_conserves_bytes() {
		let pool = ChunkPool::new();
		let mut src = ChunkQueue::new(&pool);
		let mut dst = ChunkQueue::new(&pool);
		let f = fixture(b"0123456789");
		src.append_bytes(b"abcdef");
		src.append_file_range(f.path(), 0, 10);
		let before = src.len();
		dst.move_range_from(&mut src, 9);
		assert_eq!(dst.len(), 9);
		assert_eq!(src.len(), before - 9);
		check(&src);
		check(&dst);
		let mut out = vec![0_u8; 9];
		dst.read_into(&mut out).unwrap();
		assert_eq!(&out, b"abcdef012");
		let mut rest = vec![0_u8; 7];
		src.read_into(&mut rest).unwrap();
		assert_eq!(&rest, b"3456789");
	}

	/// Tests that a partial file head split shares the descriptor instead
	/// of reopening.
	#[test]
	fn move_range_splits_file_head() {
		let pool = ChunkPool::new();
		let mut src = ChunkQueue::new(&pool);
		let mut dst = ChunkQueue::new(&pool);
		let f = fixture(b"0123456789");
		src.append_file_range(f.path(), 0, 10);
		// open the descriptor in the source chunk first
		let mut tmp = [0_u8; 1];
		src.peek_into(&mut tmp).unwrap();
		dst.move_range_from(&mut src, 4);
		check(&src);
		check(&dst);
		let shared = match (dst.chunks.front(), src.chunks.front()) {
			(
				Some(super::Chunk::File(a)),
				Some(super::Chunk::File(b)),
			) => match (&a.file, &b.file) {
				(Some(fa), Some(fb)) => std::rc::Rc::ptr_eq(fa, fb),
				_ => false,
			},
			_ => false,
		};
		assert!(shared);
	}

	/// Tests copying a range without mutating the source.
	#[test]
	fn copy_range_leaves_source_intact() {
		let pool = ChunkPool::new();
		let mut src = ChunkQueue::new(&pool);
		let mut dst = ChunkQueue::new(&pool);
		src.append_bytes(b"abcdefgh");
		dst.copy_range_from(&src, 2, 4);
		assert_eq!(src.len(), 8);
		assert_eq!(src.bytes_out(), 0);
		let mut out = [0_u8; 4];
		dst.read_into(&mut out).unwrap();
		assert_eq!(&out, b"cdef");
		check(&src);
		check(&dst);
	}

	/// Tests the write cursor and commit, including the zero-commit
	/// removal of an otherwise-empty tail chunk.
	#[test]
	fn write_cursor_commit() {
		let pool = ChunkPool::new();
		let mut q = ChunkQueue::new(&pool);
		let cursor = q.write_cursor(4);
		assert!(cursor.len() >= 4);
		cursor[..4].copy_from_slice(b"data");
		q.commit_write(4);
		assert_eq!(q.len(), 4);
		check(&q);
		// a cursor that ends up unused leaves no empty chunk behind
		let _ = q.write_cursor(1024);
		q.commit_write(0);
		assert_eq!(q.len(), 4);
		check(&q);
		let before = q.chunks.len();
		let mut fresh = ChunkQueue::new(&pool);
		let _ = fresh.write_cursor(16);
		fresh.commit_write(0);
		assert_eq!(fresh.chunks.len(), 0);
		assert_eq!(q.chunks.len(), before);
	}

	/// Tests that releasing a queue returns its standard buffers to the
	/// pool for reuse.
	#[test]
	fn release_returns_buffers_to_pool() {
		let pool = ChunkPool::new();
		let ptr;
		{
			let mut q = ChunkQueue::new(&pool);
			q.append_bytes(b"pooled");
			ptr = match q.chunks.front() {
				Some(super::Chunk::Memory(m)) => m.buf.as_ptr(),
				_ => unreachable!(),
			};
		}
		let buf = pool.acquire_buffer();
		assert_eq!(buf.as_ptr(), ptr);
	}

	/// Tests gathering fragmented memory content at the head.
	#[test]
	fn compact_front_gathers_fragments() {
		let pool = ChunkPool::with_chunk_size(1024);
		let mut q = ChunkQueue::new(&pool);
		// force separate chunks with oversize appends
		let a = vec![b'a'; 1500];
		let b = vec![b'b'; 1500];
		q.append_bytes(&a);
		q.append_bytes(&b);
		assert!(q.chunks.len() >= 2);
		q.compact_front(2000);
		check(&q);
		match q.chunks.front() {
			Some(super::Chunk::Memory(m)) => assert!(m.remaining() >= 2000),
			_ => panic!("head is not a memory chunk"),
		}
		let mut out = vec![0_u8; 3000];
		q.read_into(&mut out).unwrap();
		assert_eq!(&out[..1500], &a[..]);
		assert_eq!(&out[1500..], &b[..]);
	}

	/// Tests squashing a fragmented queue into one contiguous view.
	#[test]
	fn squash_concatenates() {
		let pool = ChunkPool::new();
		let mut q = ChunkQueue::new(&pool);
		let f = fixture(b"FILE");
		q.append_bytes(b"mem:");
		q.append_file_range(f.path(), 0, 4);
		let before_in = q.bytes_in();
		assert_eq!(q.squash().unwrap(), b"mem:FILE");
		assert_eq!(q.chunks.len(), 1);
		assert_eq!(q.bytes_in(), before_in);
		check(&q);
	}

	/// Tests that a mixed sequence of appends, spillover, cursor writes,
	/// and cross-queue copies and moves keeps `len` equal to
	/// `bytes_in - bytes_out` on both queues throughout.
	#[test]
	fn mixed_operations_keep_counters_consistent() {
		let pool = ChunkPool::new();
		let dir = tempfile::tempdir().unwrap();
		let mut a = ChunkQueue::new(&pool);
		let mut b = ChunkQueue::new(&pool);
		a.set_tempdirs(vec![dir.path().to_path_buf()], 64);
		a.append_bytes(b"abcdefgh");
		a.append_bytes_to_tempfile(b"ijklmnop").unwrap();
		check(&a);
		let cur = a.write_cursor(4);
		cur[..4].copy_from_slice(b"qrst");
		a.commit_write(4);
		check(&a);
		assert_eq!(a.len(), 20);
		b.copy_range_from(&a, 2, 10);
		check(&b);
		assert_eq!(a.len(), 20);
		b.move_range_from(&mut a, 6);
		check(&a);
		check(&b);
		assert_eq!(a.len(), 14);
		a.consume(3);
		check(&a);
		let mut out = vec![0_u8; b.len() as usize];
		b.read_into(&mut out).unwrap();
		check(&b);
		assert_eq!(&out, b"cdefghijklabcdef");
		assert!(b.is_empty());
	}

	/// Tests that reset clears counters and contents.
	#[test]
	fn reset_clears() {
		let pool = ChunkPool::new();
		let mut q = ChunkQueue::new(&pool);
		q.append_bytes(b"gone");
		q.consume(1);
		q.reset();
		assert!(q.is_empty());
		assert_eq!(q.bytes_in(), 0);
		assert_eq!(q.bytes_out(), 0);
	}
}
