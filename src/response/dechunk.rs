//! Incremental decoder for `Transfer-Encoding: chunked` bodies.
//!
//! The decoder is a byte-at-a-time state machine over the framing, with
//! chunk payloads copied out in bulk. Backends are not always careful about
//! line endings, so a bare LF is accepted wherever CRLF is expected.
//! Trailers after the final zero-size chunk are discarded up to the blank
//! line that ends the body.

use crate::error::GatewayError;
use crate::queue::ChunkQueue;

/// The position of the decoder within the chunked framing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
	/// Expecting the first hex digit of a chunk size.
	SizeFirst,
	/// Expecting more hex digits, an extension, or the end of the size
	/// line. The payload is the size so far.
	Size(u64),
	/// Skipping a chunk extension until the end of the size line.
	Ext(u64),
	/// Seen CR at the end of the size line; expecting LF.
	SizeLf(u64),
	/// Consuming chunk payload; the payload is the number of bytes left.
	Data(u64),
	/// Expecting the CR or LF that follows a chunk payload.
	DataEnd,
	/// Seen CR after a chunk payload; expecting LF.
	DataEndLf,
	/// Discarding trailers. The payload is whether the current line is
	/// still blank.
	Trailer(bool),
	/// The terminating blank line has been consumed.
	Done,
}

/// An incremental chunked-transfer decoder feeding a [`ChunkQueue`].
#[derive(Debug)]
pub(crate) struct Dechunker {
	state: State,
}

impl Dechunker {
	pub(crate) fn new() -> Self {
		Self {
			state: State::SizeFirst,
		}
	}

	/// Decodes `data`, appending payload bytes to `out`. Returns whether
	/// the body is now complete; input past the terminator is ignored.
	///
	/// # Errors
	/// Returns a framing error, after which the decoder must not be fed
	/// again.
	pub(crate) fn decode_append(
		&mut self,
		data: &[u8],
		out: &mut ChunkQueue,
	) -> Result<bool, GatewayError> {
		let mut pos = 0;
		while pos < data.len() {
			match self.state {
				State::SizeFirst => {
					let d = hex_digit(data[pos]).ok_or(GatewayError::ChunkSizeNotHex)?;
					self.state = State::Size(u64::from(d));
					pos += 1;
				}
				State::Size(size) => {
					let ch = data[pos];
					self.state = if let Some(d) = hex_digit(ch) {
						if size >= 0x1000_0000_0000_0000 {
							return Err(GatewayError::ChunkSizeOverflow);
						}
						State::Size(size * 16 + u64::from(d))
					} else {
						match ch {
							b';' => State::Ext(size),
							b'\r' => State::SizeLf(size),
							b'\n' => Self::after_size(size),
							_ => return Err(GatewayError::ChunkSizeNotHex),
						}
					};
					pos += 1;
				}
				State::Ext(size) => {
					self.state = match data[pos] {
						b'\r' => State::SizeLf(size),
						b'\n' => Self::after_size(size),
						_ => State::Ext(size),
					};
					pos += 1;
				}
				State::SizeLf(size) => {
					if data[pos] != b'\n' {
						return Err(GatewayError::ChunkFraming);
					}
					self.state = Self::after_size(size);
					pos += 1;
				}
				State::Data(left) => {
					let take = left.min((data.len() - pos) as u64) as usize;
					out.append_bytes(&data[pos..pos + take]);
					pos += take;
					let left = left - take as u64;
					self.state = if left == 0 {
						State::DataEnd
					} else {
						State::Data(left)
					};
				}
				State::DataEnd => {
					self.state = match data[pos] {
						b'\r' => State::DataEndLf,
						b'\n' => State::SizeFirst,
						_ => return Err(GatewayError::ChunkFraming),
					};
					pos += 1;
				}
				State::DataEndLf => {
					if data[pos] != b'\n' {
						return Err(GatewayError::ChunkFraming);
					}
					self.state = State::SizeFirst;
					pos += 1;
				}
				State::Trailer(blank) => {
					self.state = match data[pos] {
						b'\n' if blank => State::Done,
						b'\n' => State::Trailer(true),
						b'\r' => State::Trailer(blank),
						_ => State::Trailer(false),
					};
					pos += 1;
				}
				State::Done => break,
			}
		}
		Ok(self.state == State::Done)
	}

	fn after_size(size: u64) -> State {
		if size == 0 {
			State::Trailer(true)
		} else {
			State::Data(size)
		}
	}
}

fn hex_digit(ch: u8) -> Option<u8> {
	match ch {
		b'0'..=b'9' => Some(ch - b'0'),
		b'a'..=b'f' => Some(ch - b'a' + 10),
		b'A'..=b'F' => Some(ch - b'A' + 10),
		_ => None,
	}
}

#[cfg(test)]
mod test {
	use super::Dechunker;
	use crate::error::GatewayError;
	use crate::pool::ChunkPool;
	use crate::queue::ChunkQueue;

	fn decode_all(input: &[u8]) -> Result<(Vec<u8>, bool), GatewayError> {
		let pool = ChunkPool::new();
		let mut out = ChunkQueue::new(&pool);
		let mut d = Dechunker::new();
		let done = d.decode_append(input, &mut out)?;
		let mut bytes = vec![0_u8; out.len() as usize];
		out.read_into(&mut bytes).unwrap();
		Ok((bytes, done))
	}

	/// Tests a straightforward two-chunk body.
	#[test]
	fn two_chunks() {
		let (bytes, done) =
			decode_all(b"6\r\nHello \r\n6\r\nWorld!\r\n0\r\n\r\n").unwrap();
		assert_eq!(&bytes, b"Hello World!");
		assert!(done);
	}

	/// Tests bare-LF framing, which sloppy backends produce.
	#[test]
	fn bare_lf_accepted() {
		let (bytes, done) = decode_all(b"3\nabc\n0\n\n").unwrap();
		assert_eq!(&bytes, b"abc");
		assert!(done);
	}

	/// Tests chunk extensions being skipped.
	#[test]
	fn extension_skipped() {
		let (bytes, done) = decode_all(b"4;name=value\r\nabcd\r\n0\r\n\r\n").unwrap();
		assert_eq!(&bytes, b"abcd");
		assert!(done);
	}

	/// Tests trailers being discarded up to the blank line.
	#[test]
	fn trailers_discarded() {
		let (bytes, done) =
			decode_all(b"2\r\nhi\r\n0\r\nExpires: never\r\nX-Y: z\r\n\r\n").unwrap();
		assert_eq!(&bytes, b"hi");
		assert!(done);
	}

	/// Tests decoding across arbitrary input splits.
	#[test]
	fn split_input() {
		let input = b"6\r\nHello \r\n6\r\nWorld!\r\n0\r\n\r\n";
		let pool = ChunkPool::new();
		let mut out = ChunkQueue::new(&pool);
		let mut d = Dechunker::new();
		let mut done = false;
		for b in input.iter() {
			done = d.decode_append(std::slice::from_ref(b), &mut out).unwrap();
		}
		assert!(done);
		let mut bytes = vec![0_u8; 12];
		out.read_into(&mut bytes).unwrap();
		assert_eq!(&bytes, b"Hello World!");
	}

	/// Tests that an incomplete body reports not-done without error.
	#[test]
	fn incomplete_not_done() {
		let (bytes, done) = decode_all(b"6\r\nHel").unwrap();
		assert_eq!(&bytes, b"Hel");
		assert!(!done);
	}

	/// Tests rejection of a non-hex size.
	#[test]
	fn bad_size_rejected() {
		assert_eq!(
			decode_all(b"zz\r\nbody").unwrap_err(),
			GatewayError::ChunkSizeNotHex
		);
	}

	/// Tests rejection of an oversized size.
	#[test]
	fn huge_size_rejected() {
		assert_eq!(
			decode_all(b"11111111111111111\r\n").unwrap_err(),
			GatewayError::ChunkSizeOverflow
		);
	}

	/// Tests rejection of garbage where the post-payload CRLF belongs.
	#[test]
	fn bad_framing_rejected() {
		assert_eq!(
			decode_all(b"3\r\nabcX").unwrap_err(),
			GatewayError::ChunkFraming
		);
	}
}
