//! Size-classed buffer recycling shared by every chunk queue of a process.
//!
//! A [`ChunkPool`] keeps three free lists: standard buffers of exactly the
//! configured chunk size, oversized buffers kept sorted by descending
//! capacity, and recycled path buffers for file chunks. The pool is an
//! explicit object behind a cheaply clonable handle; dropping the last
//! handle frees everything held on the lists.

use crate::chunk::{Chunk, FileChunk, MemChunk};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// The default standard chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// The default size at which a spillover temp file is rotated.
pub const DEFAULT_TEMPFILE_SIZE: u64 = 1024 * 1024;

/// The maximum number of oversized buffers retained on the free list.
const OVERSIZED_LIMIT: usize = 64;

/// The smallest configurable standard chunk size.
const MIN_CHUNK_SIZE: usize = 1024;

struct Inner {
	chunk_size: usize,
	default_tempdirs: Vec<PathBuf>,
	default_tempfile_size: u64,
	standard: Vec<Vec<u8>>,
	/// Sorted by descending capacity.
	oversized: Vec<Vec<u8>>,
	file_shells: Vec<PathBuf>,
}

/// A handle to a buffer pool.
///
/// Cloning the handle is cheap and yields another handle to the same pool.
#[derive(Clone)]
pub struct ChunkPool {
	inner: Rc<RefCell<Inner>>,
}

impl std::fmt::Debug for ChunkPool {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let inner = self.inner.borrow();
		f.debug_struct("ChunkPool")
			.field("chunk_size", &inner.chunk_size)
			.field("standard", &inner.standard.len())
			.field("oversized", &inner.oversized.len())
			.field("file_shells", &inner.file_shells.len())
			.finish()
	}
}

impl Default for ChunkPool {
	fn default() -> Self {
		Self::new()
	}
}

impl ChunkPool {
	/// Constructs a pool with the default chunk size.
	#[must_use]
	pub fn new() -> Self {
		Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
	}

	/// Constructs a pool whose standard chunk size is `size` rounded up to
	/// the next power of two, with a floor of 1024.
	#[must_use]
	pub fn with_chunk_size(size: usize) -> Self {
		let mut rounded = MIN_CHUNK_SIZE;
		while rounded < size && rounded < (1 << 30) {
			rounded <<= 1;
		}
		Self {
			inner: Rc::new(RefCell::new(Inner {
				chunk_size: rounded,
				default_tempdirs: Vec::new(),
				default_tempfile_size: DEFAULT_TEMPFILE_SIZE,
				standard: Vec::new(),
				oversized: Vec::new(),
				file_shells: Vec::new(),
			})),
		}
	}

	/// Returns the standard chunk size.
	#[must_use]
	pub fn chunk_size(&self) -> usize {
		self.inner.borrow().chunk_size
	}

	/// Sets the default spillover directories and rotation size copied into
	/// every queue subsequently created from this pool.
	///
	/// A `tempfile_size` of zero selects the built-in default of 1 MiB.
	pub fn set_default_tempdirs(&self, dirs: Vec<PathBuf>, tempfile_size: u64) {
		let mut inner = self.inner.borrow_mut();
		inner.default_tempdirs = dirs;
		inner.default_tempfile_size = if tempfile_size == 0 {
			DEFAULT_TEMPFILE_SIZE
		} else {
			tempfile_size
		};
	}

	pub(crate) fn default_spill(&self) -> (Vec<PathBuf>, u64) {
		let inner = self.inner.borrow();
		(inner.default_tempdirs.clone(), inner.default_tempfile_size)
	}

	/// Borrows a standard-sized buffer from the pool, allocating one if no
	/// recycled buffer is available. The buffer is empty.
	#[must_use]
	pub fn acquire_buffer(&self) -> Vec<u8> {
		let size = self.inner.borrow().chunk_size;
		self.acquire_buffer_sized(size)
	}

	/// Borrows a buffer of capacity at least `min` from the pool.
	///
	/// Requests at or below the standard chunk size come from the standard
	/// list; larger requests take the smallest adequate oversized buffer, or
	/// allocate one rounded up to a multiple of the standard chunk size.
	#[must_use]
	pub fn acquire_buffer_sized(&self, min: usize) -> Vec<u8> {
		let mut inner = self.inner.borrow_mut();
		let cs = inner.chunk_size;
		if min <= cs {
			return match inner.standard.pop() {
				Some(buf) => buf,
				None => Vec::with_capacity(cs),
			};
		}
		// oversized list is sorted descending, so scan from the tail for
		// the smallest entry that fits
		let found = (0..inner.oversized.len())
			.rev()
			.find(|&i| inner.oversized[i].capacity() >= min);
		match found {
			Some(i) => inner.oversized.remove(i),
			None => Vec::with_capacity(min.div_ceil(cs) * cs),
		}
	}

	/// Returns a buffer to the pool.
	///
	/// The buffer is routed by capacity: exactly the standard chunk size goes
	/// to the standard list, larger goes to the oversized list, smaller is
	/// dropped. Contents are discarded.
	pub fn release_buffer(&self, mut buf: Vec<u8>) {
		buf.clear();
		let mut inner = self.inner.borrow_mut();
		let cap = buf.capacity();
		if cap == inner.chunk_size {
			inner.standard.push(buf);
		} else if cap > inner.chunk_size {
			inner.push_oversized(buf);
		}
	}

	/// Ensures `buf` has at least `additional` bytes of spare capacity,
	/// swapping it for a larger pooled buffer (and copying the contents) if
	/// needed. Returns the spare capacity now available.
	pub fn reserve(&self, buf: &mut Vec<u8>, additional: usize) -> usize {
		let spare = buf.capacity() - buf.len();
		if spare >= additional {
			return spare;
		}
		let mut bigger = self.acquire_buffer_sized(buf.len() + additional);
		bigger.extend_from_slice(buf);
		std::mem::swap(buf, &mut bigger);
		self.release_buffer(bigger);
		buf.capacity() - buf.len()
	}

	/// Swaps `buf` back down to a standard-sized buffer, discarding its
	/// contents, if it has grown beyond the standard chunk size.
	pub fn shrink_to_standard(&self, buf: &mut Vec<u8>) {
		buf.clear();
		if buf.capacity() <= self.inner.borrow().chunk_size {
			return;
		}
		let mut standard = self.acquire_buffer();
		std::mem::swap(buf, &mut standard);
		self.release_buffer(standard);
	}

	/// Drops every buffer and path shell held on the free lists.
	pub fn clear(&self) {
		let mut inner = self.inner.borrow_mut();
		inner.standard.clear();
		inner.oversized.clear();
		inner.file_shells.clear();
	}

	pub(crate) fn acquire_mem_chunk(&self, min: usize) -> Chunk {
		Chunk::Memory(MemChunk {
			buf: self.acquire_buffer_sized(min),
			offset: 0,
		})
	}

	pub(crate) fn acquire_file_chunk(&self, path: &Path) -> FileChunk {
		let mut shell = self
			.inner
			.borrow_mut()
			.file_shells
			.pop()
			.unwrap_or_default();
		shell.clear();
		shell.push(path);
		FileChunk::new(shell)
	}

	pub(crate) fn release_chunk(&self, chunk: Chunk) {
		match chunk {
			Chunk::Memory(m) => self.release_buffer(m.buf),
			Chunk::File(f) => {
				// descriptor, temp path and mmap window drop here; the
				// path buffer is recycled
				self.inner.borrow_mut().file_shells.push(f.into_path());
			}
		}
	}
}

impl Inner {
	fn push_oversized(&mut self, buf: Vec<u8>) {
		// pooling tiny oversized buffers is not worth it
		if self.chunk_size < 4096 {
			return;
		}
		let cap = buf.capacity();
		if self.oversized.len() < OVERSIZED_LIMIT {
			let at = self
				.oversized
				.iter()
				.position(|b| b.capacity() <= cap)
				.unwrap_or(self.oversized.len());
			self.oversized.insert(at, buf);
		} else if self.oversized.first().is_some_and(|b| b.capacity() < cap) {
			// list full: keep the largest, drop the rest
			self.oversized[0] = buf;
		}
	}
}
