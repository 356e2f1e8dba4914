//! Protocol-malformation errors raised while ingesting a backend response.
//!
//! Local descriptor I/O failures are reported as plain [`std::io::Error`]
//! values so that callers can inspect [`std::io::ErrorKind::WouldBlock`] and
//! friends. The errors in this module describe data that a backend produced
//! in violation of the protocol; they convert into [`std::io::Error`] with
//! kind [`std::io::ErrorKind::InvalidData`] for callers that do not care
//! about the distinction.

use thiserror::Error;

/// An error describing malformed data received from a backend or a rejected
/// delegation header.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum GatewayError {
	/// The first line of an NPH response claimed to be a status line but
	/// could not be parsed as one.
	#[error("invalid HTTP status line from backend")]
	InvalidStatusLine,

	/// The header block exceeded the maximum permitted size before its
	/// terminating blank line was seen.
	#[error("backend response headers too large")]
	HeadersTooLarge,

	/// The size of a transfer-encoded chunk was not a hexadecimal number.
	#[error("chunk size is not a hex number")]
	ChunkSizeNotHex,

	/// The size of a transfer-encoded chunk was too large to process.
	#[error("chunk size does not fit in a u64")]
	ChunkSizeOverflow,

	/// The line framing within a transfer-encoded body was incorrect.
	#[error("chunk framing contains incorrect line endings")]
	ChunkFraming,

	/// A delegated file path contained an invalid percent-encoding or an
	/// encoded NUL byte.
	#[error("invalid percent-encoding in delegated path")]
	InvalidPathEncoding,

	/// A delegated file path was not valid UTF-8 after decoding.
	#[error("delegated path is not valid UTF-8")]
	PathNotUtf8,

	/// A delegated file path was empty after simplification.
	#[error("delegated path is empty")]
	EmptyPath,

	/// A delegated file path fell outside every trusted document root.
	#[error("delegated path outside trusted roots")]
	UntrustedPath,

	/// A range list in an `X-Sendfile2` header was malformed.
	#[error("malformed range in X-Sendfile2 header")]
	MalformedRange,
}

impl GatewayError {
	/// Returns the HTTP status code with which this error is reported to
	/// the client.
	#[must_use]
	pub fn status(self) -> u16 {
		match self {
			Self::UntrustedPath => 403,
			_ => 502,
		}
	}
}

impl From<GatewayError> for std::io::Error {
	fn from(src: GatewayError) -> Self {
		Self::new(std::io::ErrorKind::InvalidData, src)
	}
}

#[cfg(test)]
mod test {
	use super::GatewayError;

	/// Tests that protocol errors convert into `InvalidData` I/O errors and
	/// keep their message.
	#[test]
	fn into_io_error() {
		let e = std::io::Error::from(GatewayError::ChunkSizeNotHex);
		assert_eq!(e.kind(), std::io::ErrorKind::InvalidData);
		assert!(e.to_string().contains("hex"));
	}

	/// Tests the client-facing status mapping.
	#[test]
	fn status_codes() {
		assert_eq!(GatewayError::UntrustedPath.status(), 403);
		assert_eq!(GatewayError::InvalidStatusLine.status(), 502);
		assert_eq!(GatewayError::MalformedRange.status(), 502);
	}
}
