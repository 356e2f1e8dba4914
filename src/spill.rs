//! Spillover of queued bytes to unlinked temp files.
//!
//! Temp files are created in the queue's configured spillover directories,
//! rotated once they reach the queue's rotation size, and unlinked when the
//! last chunk referencing them is released. A directory that fills up is
//! skipped permanently for the remainder of the queue's life.

use crate::chunk::Chunk;
use crate::queue::ChunkQueue;
use nix::errno::Errno;
use std::io::Result;
use std::path::Path;
use std::rc::Rc;

impl ChunkQueue {
	/// Appends `data`, storing it in spillover temp files rather than
	/// memory. Any buffered memory content already in the queue is drained
	/// to temp files first so that ordering is preserved.
	///
	/// # Errors
	/// Returns temp-file creation and write errors once every configured
	/// spillover directory has been exhausted.
	pub fn append_bytes_to_tempfile(&mut self, data: &[u8]) -> Result<()> {
		if matches!(self.chunks.front(), Some(Chunk::Memory(_))) {
			self.spill_to_tempfiles()?;
		}
		let mut data = data;
		while !data.is_empty() {
			self.prepare_tempfile_tail()?;
			let res = match self.chunks.back_mut() {
				Some(Chunk::File(f)) => match &f.file {
					Some(file) => nix::unistd::write(&**file, data),
					None => Err(Errno::EBADF),
				},
				_ => Err(Errno::EBADF),
			};
			match res {
				Ok(n) => {
					if let Some(Chunk::File(f)) = self.chunks.back_mut() {
						f.length += n as u64;
					}
					self.bytes_in += n as u64;
					// a partial write retries with the remainder
					data = &data[n..];
				}
				Err(Errno::EINTR) => {}
				Err(errno) => self.handle_tempfile_error(errno)?,
			}
		}
		Ok(())
	}

	/// Converts every buffered memory chunk in the queue to temp-file
	/// storage, leaving file chunks in place.
	///
	/// # Errors
	/// Returns temp-file creation and write errors; chunks that could not
	/// be converted are dropped.
	pub fn spill_to_tempfiles(&mut self) -> Result<()> {
		if !self.chunks.iter().any(|c| matches!(c, Chunk::Memory(_))) {
			return Ok(());
		}
		let len = self.len();
		let mut src = ChunkQueue::new(&self.pool);
		src.chunks = std::mem::take(&mut self.chunks);
		src.bytes_in = len;
		self.bytes_in -= len;
		self.move_range_to_tempfiles(&mut src, len)
	}

	/// Moves up to `len` bytes from the front of `src` into this queue,
	/// converting memory content to temp-file storage along the way. File
	/// chunks move without copying, exactly as in
	/// [`move_range_from`](Self::move_range_from).
	///
	/// # Errors
	/// Returns temp-file creation and write errors.
	pub fn move_range_to_tempfiles(&mut self, src: &mut ChunkQueue, mut len: u64) -> Result<()> {
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
			if matches!(src.chunks.front(), Some(Chunk::File(_))) {
				if take == clen {
					if let Some(c) = src.chunks.pop_front() {
						self.chunks.push_back(c);
						self.bytes_in += take;
					}
				} else if let Some(Chunk::File(f)) = src.chunks.front_mut() {
					let fc = f.share_range(f.offset, take);
					f.offset += take;
					self.push_file_chunk(fc, take);
				}
			} else {
				if let Some(Chunk::Memory(m)) = src.chunks.front() {
					let end = m.offset + take as usize;
					self.append_bytes_to_tempfile(&m.buf[m.offset..end])?;
				}
				if take == clen {
					if let Some(c) = src.chunks.pop_front() {
						src.pool.release_chunk(c);
					}
				} else if let Some(Chunk::Memory(m)) = src.chunks.front_mut() {
					m.offset += take as usize;
				}
			}
			len -= take;
			src.bytes_out += take;
		}
		Ok(())
	}

	/// Ensures the tail of the queue is a temp-file chunk with an open
	/// descriptor and room before the rotation size, opening a fresh temp
	/// file otherwise.
	fn prepare_tempfile_tail(&mut self) -> Result<()> {
		if let Some(Chunk::File(f)) = self.chunks.back() {
			if f.temp.is_some() && f.file.is_some() && f.length < self.upload_temp_file_size {
				return Ok(());
			}
		}
		self.open_new_tempfile()
	}

	fn open_new_tempfile(&mut self) -> Result<()> {
		if self.tempdirs.is_empty() {
			return self.open_tempfile_in(&std::env::temp_dir());
		}
		let mut last = None;
		while self.tempdir_idx < self.tempdirs.len() {
			let dir = self.tempdirs[self.tempdir_idx].clone();
			match self.open_tempfile_in(&dir) {
				Ok(()) => return Ok(()),
				Err(e) => {
					tracing::error!(dir = %dir.display(), error = %e, "opening temp file failed");
					last = Some(e);
					self.tempdir_idx += 1;
				}
			}
		}
		Err(last.unwrap_or_else(|| Errno::ENOSPC.into()))
	}

	fn open_tempfile_in(&mut self, dir: &Path) -> Result<()> {
		let ntf = tempfile::Builder::new().prefix("chunkq-").tempfile_in(dir)?;
		let (file, temp_path) = ntf.into_parts();
		let mut fc = self.pool.acquire_file_chunk(&temp_path);
		fc.file = Some(Rc::new(file));
		fc.temp = Some(Rc::new(temp_path));
		self.chunks.push_back(Chunk::File(fc));
		Ok(())
	}

	/// Handles a failed temp-file write: on `ENOSPC` with further spillover
	/// directories remaining, advances to the next directory so the caller
	/// retries; otherwise the error is fatal. Either way an empty tail
	/// chunk is dropped (unlinking its backing file) and a non-empty one
	/// keeps its data but gives up its write descriptor.
	fn handle_tempfile_error(&mut self, errno: Errno) -> Result<()> {
		let retry = errno == Errno::ENOSPC
			&& !self.tempdirs.is_empty()
			&& self.tempdir_idx + 1 < self.tempdirs.len();
		if retry {
			self.tempdir_idx += 1;
		} else if let Some(Chunk::File(f)) = self.chunks.back() {
			tracing::error!(path = %f.path.display(), errno = %errno, "writing temp file failed");
		}
		match self.chunks.back_mut() {
			Some(Chunk::File(f)) if f.remaining() == 0 => {
				if let Some(c) = self.chunks.pop_back() {
					self.pool.release_chunk(c);
				}
			}
			Some(Chunk::File(f)) => f.file = None,
			_ => {}
		}
		if retry {
			Ok(())
		} else {
			Err(errno.into())
		}
	}
}

#[cfg(test)]
mod test {
	use crate::chunk::Chunk;
	use crate::pool::ChunkPool;
	use crate::queue::ChunkQueue;

	/// Tests that spilled bytes land in temp files and read back intact.
	#[test]
	fn spill_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let pool = ChunkPool::new();
		let mut q = ChunkQueue::new(&pool);
		q.set_tempdirs(vec![dir.path().to_path_buf()], 0);
		q.append_bytes_to_tempfile(b"spilled to disk").unwrap();
		assert!(q.chunks.iter().all(|c| matches!(c, Chunk::File(_))));
		let mut out = vec![0_u8; q.len() as usize];
		q.read_into(&mut out).unwrap();
		assert_eq!(&out, b"spilled to disk");
	}

	/// Tests rotation to a new temp file once the rotation size is reached.
	#[test]
	fn rotation_at_threshold() {
		let dir = tempfile::tempdir().unwrap();
		let pool = ChunkPool::new();
		let mut q = ChunkQueue::new(&pool);
		q.set_tempdirs(vec![dir.path().to_path_buf()], 16);
		for _ in 0..4 {
			q.append_bytes_to_tempfile(b"0123456789").unwrap();
		}
		assert!(q.chunks.len() >= 2);
		assert_eq!(q.len(), 40);
		let mut out = vec![0_u8; 40];
		q.read_into(&mut out).unwrap();
		assert_eq!(&out[..10], b"0123456789");
		assert_eq!(&out[30..], b"0123456789");
	}

	/// Tests that buffered memory content is drained to temp files before
	/// new spilled bytes, preserving order.
	#[test]
	fn memory_drained_first() {
		let dir = tempfile::tempdir().unwrap();
		let pool = ChunkPool::new();
		let mut q = ChunkQueue::new(&pool);
		q.set_tempdirs(vec![dir.path().to_path_buf()], 0);
		q.append_bytes(b"first ");
		q.append_bytes_to_tempfile(b"second").unwrap();
		assert!(q.chunks.iter().all(|c| matches!(c, Chunk::File(_))));
		let mut out = vec![0_u8; 12];
		q.read_into(&mut out).unwrap();
		assert_eq!(&out, b"first second");
	}

	/// Tests that the temp file disappears once the last chunk referencing
	/// it is released.
	#[test]
	fn tempfile_unlinked_on_release() {
		let dir = tempfile::tempdir().unwrap();
		let pool = ChunkPool::new();
		let mut q = ChunkQueue::new(&pool);
		q.set_tempdirs(vec![dir.path().to_path_buf()], 0);
		q.append_bytes_to_tempfile(b"ephemeral").unwrap();
		let path = match q.chunks.front() {
			Some(Chunk::File(f)) => f.path.clone(),
			_ => panic!("no file chunk"),
		};
		assert!(path.exists());
		q.reset();
		assert!(!path.exists());
	}

	/// Tests converting an in-memory queue wholesale.
	#[test]
	fn spill_converts_existing_queue() {
		let dir = tempfile::tempdir().unwrap();
		let pool = ChunkPool::new();
		let mut q = ChunkQueue::new(&pool);
		q.set_tempdirs(vec![dir.path().to_path_buf()], 0);
		q.append_bytes(b"resident");
		q.consume(3);
		q.spill_to_tempfiles().unwrap();
		assert!(q.chunks.iter().all(|c| matches!(c, Chunk::File(_))));
		assert_eq!(q.len(), 5);
		let mut out = vec![0_u8; 5];
		q.read_into(&mut out).unwrap();
		assert_eq!(&out, b"ident");
	}
}
