//! Writing the front of a queue to a descriptor without copying where the
//! platform allows it.
//!
//! Memory chunks are written directly. File chunks go through a strategy
//! ladder: `sendfile` on Linux, then a cached page-aligned memory mapping,
//! then a bounded copy through an intermediate buffer. Each call transfers
//! from the first chunk only; the caller consumes what was written and
//! calls again, so a would-block return surfaces promptly.

use crate::chunk::{Chunk, FileChunk};
use crate::queue::ChunkQueue;
use nix::errno::Errno;
use std::fs::File;
use std::io::Result;
use std::os::fd::BorrowedFd;
use std::os::unix::fs::FileExt;
use std::rc::Rc;

/// Upper bound on a single copy through the intermediate buffer.
const INTERMED_BUF_SIZE: usize = 16384;

/// Writes bytes from the first chunk of `cq` to `fd` and returns the number
/// written. Returns zero when the queue is empty. Nothing is consumed; call
/// [`ChunkQueue::consume`] with the returned count.
///
/// # Errors
/// Returns write errors other than interruption, including
/// [`std::io::ErrorKind::WouldBlock`], and file open/validation/read errors
/// for file chunks.
pub fn write_chunk(fd: BorrowedFd<'_>, cq: &mut ChunkQueue) -> Result<usize> {
	match cq.chunks.front_mut() {
		None => Ok(0),
		Some(Chunk::Memory(m)) => write_retrying(fd, m.content()),
		Some(Chunk::File(f)) => write_file_chunk(fd, f),
	}
}

/// Writes bytes from the first chunk of `cq` to the pipe `fd`, preferring
/// `splice` for file chunks on Linux.
///
/// # Errors
/// As for [`write_chunk`].
pub fn write_chunk_to_pipe(fd: BorrowedFd<'_>, cq: &mut ChunkQueue) -> Result<usize> {
	#[cfg(target_os = "linux")]
	if let Some(Chunk::File(f)) = cq.chunks.front_mut() {
		let file = f.open()?;
		let mut off = f.offset as nix::libc::loff_t;
		let len = f.remaining().min(usize::MAX as u64) as usize;
		return match nix::fcntl::splice(
			&*file,
			Some(&mut off),
			fd,
			None,
			len,
			nix::fcntl::SpliceFFlags::SPLICE_F_NONBLOCK,
		) {
			Ok(n) => Ok(n),
			Err(Errno::EINVAL) | Err(Errno::ENOSYS) => write_file_chunk(fd, f),
			Err(e) => Err(e.into()),
		};
	}
	write_chunk(fd, cq)
}

fn write_retrying(fd: BorrowedFd<'_>, data: &[u8]) -> Result<usize> {
	loop {
		match nix::unistd::write(fd, data) {
			Ok(n) => return Ok(n),
			Err(Errno::EINTR) => {}
			Err(e) => return Err(e.into()),
		}
	}
}

fn write_file_chunk(fd: BorrowedFd<'_>, f: &mut FileChunk) -> Result<usize> {
	let file = f.open()?;
	if f.remaining() == 0 {
		return Ok(0);
	}
	#[cfg(target_os = "linux")]
	{
		let mut off = f.offset as nix::libc::off_t;
		let count = f.remaining().min(i32::MAX as u64) as usize;
		loop {
			match nix::sys::sendfile::sendfile(fd, &*file, Some(&mut off), count) {
				Ok(n) => return Ok(n),
				Err(Errno::EINTR) => {}
				// not supported for this descriptor pair; fall back
				Err(Errno::EINVAL) | Err(Errno::ENOSYS) => break,
				Err(Errno::EAGAIN) => return Err(Errno::EAGAIN.into()),
				Err(e) => {
					tracing::error!(path = %f.path.display(), errno = %e, "sendfile failed");
					return Err(e.into());
				}
			}
		}
	}
	write_file_mapped(fd, f, &file)
}

fn write_file_mapped(fd: BorrowedFd<'_>, f: &mut FileChunk, file: &Rc<File>) -> Result<usize> {
	let page_size = match nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE) {
		Ok(Some(sz)) if sz > 0 => sz as u64,
		_ => 4096,
	};
	let (offset, end) = (f.offset, f.length);
	if f.map_window(file, page_size).is_ok() {
		let data = match &f.mmap {
			Some(w) => w.slice(offset, end),
			None => return write_file_intermed(fd, f),
		};
		return write_retrying(fd, data);
	}
	write_file_intermed(fd, f)
}

fn write_file_intermed(fd: BorrowedFd<'_>, f: &mut FileChunk) -> Result<usize> {
	let mut buf = [0_u8; INTERMED_BUF_SIZE];
	let want = f.remaining().min(INTERMED_BUF_SIZE as u64) as usize;
	let got = f.peek_into(&mut buf[..want])?;
	write_retrying(fd, &buf[..got])
}

/// Folds a two-chunk queue of response headers in memory followed by a small
/// file body into contiguous memory, so the subsequent write needs a single
/// syscall. Does nothing unless the queue is exactly that shape with the
/// file already open. The logical queue length never changes; on a read
/// failure the bytes simply stay in the file chunk.
pub fn small_response_optim(cq: &mut ChunkQueue) {
	if cq.chunks.len() != 2 {
		return;
	}
	if !matches!(cq.chunks.front(), Some(Chunk::Memory(_))) {
		return;
	}
	let (file, offset, need) = match cq.chunks.back() {
		Some(Chunk::File(f)) => match &f.file {
			Some(file) => (Rc::clone(file), f.offset, f.remaining() as usize),
			None => return,
		},
		_ => return,
	};
	if need == 0 {
		cq.remove_empty_chunks();
		return;
	}
	let spare = match cq.chunks.front() {
		Some(Chunk::Memory(m)) => m.buf.capacity() - m.buf.len(),
		_ => return,
	};
	let target = if spare >= need {
		0
	} else {
		let chunk = cq.pool.acquire_mem_chunk(need + 1);
		cq.chunks.insert(1, chunk);
		1
	};
	let mut read_total = 0;
	if let Some(Chunk::Memory(m)) = cq.chunks.get_mut(target) {
		let base = m.buf.len();
		m.buf.resize(base + need, 0);
		while read_total < need {
			match file.read_at(&mut m.buf[base + read_total..base + need], offset + read_total as u64) {
				Ok(0) => break,
				Ok(n) => read_total += n,
				Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
				Err(e) => {
					tracing::debug!(error = %e, "small response read failed");
					break;
				}
			}
		}
		m.buf.truncate(base + read_total);
	}
	if let Some(Chunk::File(f)) = cq.chunks.back_mut() {
		f.offset += read_total as u64;
	}
	cq.remove_empty_chunks();
}

#[cfg(test)]
mod test {
	use super::{small_response_optim, write_chunk, write_chunk_to_pipe};
	use crate::chunk::Chunk;
	use crate::pool::ChunkPool;
	use crate::queue::ChunkQueue;
	use std::io::{Read as _, Write as _};
	use std::os::fd::AsFd as _;

	fn fixture(content: &[u8]) -> tempfile::NamedTempFile {
		let mut f = tempfile::NamedTempFile::new().unwrap();
		f.write_all(content).unwrap();
		f.flush().unwrap();
		f
	}

	fn drain_queue(cq: &mut ChunkQueue) -> Vec<u8> {
		let (rx, tx) = nix::unistd::pipe().unwrap();
		let mut out = Vec::new();
		while !cq.is_empty() {
			let n = write_chunk(tx.as_fd(), cq).unwrap();
			assert!(n > 0);
			cq.consume(n as u64);
			let mut buf = vec![0_u8; n];
			let mut file = std::fs::File::from(rx.try_clone().unwrap());
			file.read_exact(&mut buf).unwrap();
			out.extend_from_slice(&buf);
		}
		out
	}

	/// Tests writing memory chunks to a pipe.
	#[test]
	fn write_memory() {
		let pool = ChunkPool::new();
		let mut q = ChunkQueue::new(&pool);
		q.append_bytes(b"over the wire");
		assert_eq!(drain_queue(&mut q), b"over the wire");
		assert_eq!(q.bytes_out(), 13);
	}

	/// Tests writing a file chunk region, exercising the sendfile path or
	/// its fallbacks depending on the platform.
	#[test]
	fn write_file_region() {
		let pool = ChunkPool::new();
		let mut q = ChunkQueue::new(&pool);
		let f = fixture(b"0123456789");
		q.append_file_range(f.path(), 3, 5);
		assert_eq!(drain_queue(&mut q), b"34567");
	}

	/// Tests the splice-based pipe write for file chunks.
	#[test]
	fn splice_file_to_pipe() {
		let pool = ChunkPool::new();
		let mut q = ChunkQueue::new(&pool);
		let f = fixture(b"spliced content");
		q.append_file_range(f.path(), 0, 15);
		let (rx, tx) = nix::unistd::pipe().unwrap();
		let n = write_chunk_to_pipe(tx.as_fd(), &mut q).unwrap();
		assert!(n > 0);
		q.consume(n as u64);
		let mut buf = vec![0_u8; n];
		let mut file = std::fs::File::from(rx);
		file.read_exact(&mut buf).unwrap();
		assert_eq!(&buf, &b"spliced content"[..n]);
	}

	/// Tests folding headers plus a small file body into memory.
	#[test]
	fn small_response_folds_to_memory() {
		let pool = ChunkPool::new();
		let mut q = ChunkQueue::new(&pool);
		let f = fixture(b"tiny body");
		q.append_bytes(b"HTTP/1.1 200 OK\r\n\r\n");
		let file = std::fs::File::open(f.path()).unwrap();
		q.append_file(f.path(), file, 0, 9);
		let before = q.len();
		small_response_optim(&mut q);
		assert_eq!(q.len(), before);
		assert!(q.chunks.iter().all(|c| matches!(c, Chunk::Memory(_))));
		let mut out = vec![0_u8; before as usize];
		q.read_into(&mut out).unwrap();
		assert_eq!(&out, b"HTTP/1.1 200 OK\r\n\r\ntiny body");
	}

	/// Tests that the optimization declines queues of the wrong shape.
	#[test]
	fn small_response_requires_shape() {
		let pool = ChunkPool::new();
		let mut q = ChunkQueue::new(&pool);
		let f = fixture(b"body");
		q.append_bytes(b"headers");
		// descriptor not open: left alone
		q.append_file_range(f.path(), 0, 4);
		small_response_optim(&mut q);
		assert!(matches!(q.chunks.back(), Some(Chunk::File(_))));
	}
}
