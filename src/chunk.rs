//! The chunk union: a run of bytes held in memory or a region of a file.

use memmap2::Mmap;
use std::fs::File;
use std::io::{Error, ErrorKind, Result};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::rc::Rc;
use tempfile::TempPath;

/// A chunk of queued data.
pub(crate) enum Chunk {
	Memory(MemChunk),
	File(FileChunk),
}

impl Chunk {
	/// Returns the number of unconsumed bytes in this chunk.
	pub(crate) fn remaining(&self) -> u64 {
		match self {
			Self::Memory(m) => m.remaining() as u64,
			Self::File(f) => f.remaining(),
		}
	}
}

impl std::fmt::Debug for Chunk {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Memory(m) => f
				.debug_struct("Memory")
				.field("len", &m.buf.len())
				.field("offset", &m.offset)
				.finish(),
			Self::File(c) => f
				.debug_struct("File")
				.field("path", &c.path)
				.field("offset", &c.offset)
				.field("length", &c.length)
				.field("temp", &c.temp.is_some())
				.finish(),
		}
	}
}

/// An in-memory chunk: a buffer plus a consume cursor.
pub(crate) struct MemChunk {
	pub(crate) buf: Vec<u8>,
	/// Bytes before this offset have been consumed.
	pub(crate) offset: usize,
}

impl MemChunk {
	pub(crate) fn remaining(&self) -> usize {
		self.buf.len() - self.offset
	}

	pub(crate) fn content(&self) -> &[u8] {
		&self.buf[self.offset..]
	}
}

/// A cached mapping of the tail of a file chunk, page-aligned at `start`.
pub(crate) struct MmapWindow {
	map: Mmap,
	start: u64,
}

impl MmapWindow {
	fn covers(&self, offset: u64, end: u64) -> bool {
		offset >= self.start && end <= self.start + self.map.len() as u64
	}

	/// Returns the unconsumed bytes of `offset..end` within this window.
	pub(crate) fn slice(&self, offset: u64, end: u64) -> &[u8] {
		&self.map[(offset - self.start) as usize..(end - self.start) as usize]
	}
}

/// A file-backed chunk covering the byte range `offset..length` of `path`.
///
/// The descriptor is opened lazily and may be shared between chunks split
/// from the same region. Spillover temp files additionally share the
/// [`TempPath`] whose last drop unlinks the file.
pub(crate) struct FileChunk {
	pub(crate) path: PathBuf,
	pub(crate) file: Option<Rc<File>>,
	pub(crate) temp: Option<Rc<TempPath>>,
	/// Absolute position of the next unconsumed byte.
	pub(crate) offset: u64,
	/// Absolute position one past the last byte of the region.
	pub(crate) length: u64,
	pub(crate) mmap: Option<MmapWindow>,
}

impl FileChunk {
	pub(crate) fn new(path: PathBuf) -> Self {
		Self {
			path,
			file: None,
			temp: None,
			offset: 0,
			length: 0,
			mmap: None,
		}
	}

	pub(crate) fn remaining(&self) -> u64 {
		self.length - self.offset
	}

	pub(crate) fn into_path(self) -> PathBuf {
		self.path
	}

	/// Returns a new chunk sharing this chunk's descriptor and temp-file
	/// ownership, covering `offset..offset + len`.
	pub(crate) fn share_range(&self, offset: u64, len: u64) -> Self {
		Self {
			path: self.path.clone(),
			file: self.file.clone(),
			temp: self.temp.clone(),
			offset,
			length: offset + len,
			mmap: None,
		}
	}

	/// Opens the backing file if it is not open yet and validates that it
	/// still covers this chunk's region. Temp files are exempt from the
	/// validation; nothing else writes them.
	///
	/// # Errors
	/// Returns any error opening or statting the file, or `InvalidData` if
	/// the file has shrunk below the region end.
	pub(crate) fn open(&mut self) -> Result<Rc<File>> {
		let file = match &self.file {
			Some(f) => Rc::clone(f),
			None => {
				let f = File::open(&self.path).map_err(|e| {
					tracing::error!(path = %self.path.display(), error = %e, "opening file chunk failed");
					e
				})?;
				let f = Rc::new(f);
				self.file = Some(Rc::clone(&f));
				f
			}
		};
		if self.temp.is_none() {
			let size = file.metadata()?.len();
			if self.length > size {
				tracing::error!(
					path = %self.path.display(),
					expected = self.length,
					actual = size,
					"file shrunk while queued",
				);
				return Err(Error::new(ErrorKind::InvalidData, "file shrunk while queued"));
			}
		}
		Ok(file)
	}

	/// Reads up to `out.len()` bytes from the unconsumed region into `out`
	/// without consuming them.
	///
	/// # Errors
	/// Returns open/validation errors, read errors other than interruption,
	/// and `UnexpectedEof` if the file ends before the region does.
	pub(crate) fn peek_into(&mut self, out: &mut [u8]) -> Result<usize> {
		let want = (self.remaining()).min(out.len() as u64) as usize;
		if want == 0 {
			return Ok(0);
		}
		let file = self.open()?;
		let mut filled = 0;
		while filled < want {
			match file.read_at(&mut out[filled..want], self.offset + filled as u64) {
				Ok(0) => {
					tracing::error!(path = %self.path.display(), "unexpected end of file chunk");
					return Err(ErrorKind::UnexpectedEof.into());
				}
				Ok(n) => filled += n,
				Err(e) if e.kind() == ErrorKind::Interrupted => {}
				Err(e) => {
					tracing::error!(path = %self.path.display(), error = %e, "reading file chunk failed");
					return Err(e);
				}
			}
		}
		Ok(filled)
	}

	/// Returns the mapped window for this chunk, mapping or remapping if the
	/// cached window does not cover the unconsumed region.
	pub(crate) fn map_window(&mut self, file: &File, page_size: u64) -> Result<&MmapWindow> {
		let usable = match &self.mmap {
			Some(w) => w.covers(self.offset, self.length),
			None => false,
		};
		if !usable {
			self.mmap = None;
			let start = self.offset - (self.offset % page_size);
			let len = (self.length - start) as usize;
			// Safety: the mapping is read-only and the region was validated
			// against the current file size by open()
			let map = unsafe {
				memmap2::MmapOptions::new()
					.offset(start)
					.len(len)
					.map(file)?
			};
			self.mmap = Some(MmapWindow { map, start });
		}
		match &self.mmap {
			Some(w) => Ok(w),
			// just assigned above
			None => unreachable!(),
		}
	}
}

impl Chunk {
	/// Copies up to `out.len()` unconsumed bytes into `out` without
	/// consuming them.
	pub(crate) fn peek_into(&mut self, out: &mut [u8]) -> Result<usize> {
		match self {
			Self::Memory(m) => {
				let data = m.content();
				let n = data.len().min(out.len());
				out[..n].copy_from_slice(&data[..n]);
				Ok(n)
			}
			Self::File(f) => f.peek_into(out),
		}
	}
}

#[cfg(test)]
mod test {
	use super::FileChunk;
	use std::io::Write as _;

	fn fixture(content: &[u8]) -> tempfile::NamedTempFile {
		let mut f = tempfile::NamedTempFile::new().unwrap();
		f.write_all(content).unwrap();
		f.flush().unwrap();
		f
	}

	/// Tests lazy opening and a positioned peek.
	#[test]
	fn peek_reads_region() {
		let f = fixture(b"0123456789");
		let mut c = FileChunk::new(f.path().to_path_buf());
		c.offset = 2;
		c.length = 7;
		let mut out = [0_u8; 16];
		let n = c.peek_into(&mut out).unwrap();
		assert_eq!(&out[..n], b"23456");
		// peeking does not consume
		assert_eq!(c.remaining(), 5);
	}

	/// Tests that a region extending past the file's current size is
	/// rejected at open time.
	#[test]
	fn shrunk_file_rejected() {
		let f = fixture(b"short");
		let mut c = FileChunk::new(f.path().to_path_buf());
		c.length = 100;
		let err = c.open().unwrap_err();
		assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
	}

	/// Tests that a shared range keeps the same descriptor.
	#[test]
	fn share_range_shares_descriptor() {
		let f = fixture(b"0123456789");
		let mut c = FileChunk::new(f.path().to_path_buf());
		c.length = 10;
		let file = c.open().unwrap();
		let shared = c.share_range(4, 3);
		assert_eq!(shared.offset, 4);
		assert_eq!(shared.length, 7);
		assert!(std::rc::Rc::ptr_eq(
			&file,
			shared.file.as_ref().unwrap()
		));
	}
}
