//! Ingesting a backend's response: the non-blocking read loop, response
//! state, and the callbacks through which the server reacts to it.

mod dechunk;
mod delegate;
mod parse;

pub use parse::parse_headers;

use crate::cache::ContentCache;
use crate::date::HttpDateCache;
use crate::queue::ChunkQueue;
use dechunk::Dechunker;
use nix::errno::Errno;
use std::io::Result;
use std::os::fd::{AsRawFd as _, BorrowedFd};
use std::path::PathBuf;

/// The maximum size of a backend's header block, in bytes.
pub const MAX_HEADER_SIZE: usize = 65535;

/// The output-queue watermark above which reading from the backend pauses.
const OUT_QUEUE_LIMIT: u64 = 65536;
const OUT_QUEUE_HEADROOM: u64 = 4096;

/// The protocol family a backend speaks, which selects the header dialect
/// and classification rules applied to its response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackendKind {
	/// Plain CGI: headers first, or a legacy colonless body.
	Cgi,
	/// FastCGI and similar framed backends.
	FastCgi,
	/// A proxied origin server; must speak real HTTP.
	Proxy,
	/// An access-control backend whose response configures the request
	/// instead of answering it.
	Authorizer,
}

/// The HTTP version of the client-facing connection.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum HttpVersion {
	/// HTTP/1.0
	Http10,
	/// HTTP/1.1
	Http11,
	/// HTTP/2
	Http2,
	/// HTTP/3
	Http3,
}

/// What the caller should do next with this backend connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Control {
	/// Keep the descriptor registered and call again on readiness.
	GoOn,
	/// The response is complete (or completely broken); stop reading.
	Finished,
}

/// A callback invoked for each interim (1xx) response. Returning `false`
/// reports that the interim response could not be forwarded.
pub type InterimCallback<'h> = Box<dyn FnMut(&mut Response) -> bool + 'h>;

/// A callback invoked once the final header block has been processed.
pub type HeadersCallback<'h> = Box<dyn FnMut(&mut Response) -> Control + 'h>;

/// A sink for authorizer-exported `Variable-*` values.
pub type EnvSink<'h> = Box<dyn FnMut(&str, &str) + 'h>;

/// Interim-response forwarding callbacks, registered per client HTTP
/// version family.
#[derive(Default)]
pub struct InterimHandlers<'h> {
	h1: Option<InterimCallback<'h>>,
	h2: Option<InterimCallback<'h>>,
}

impl std::fmt::Debug for InterimHandlers<'_> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("InterimHandlers")
			.field("h1", &self.h1.is_some())
			.field("h2", &self.h2.is_some())
			.finish()
	}
}

impl<'h> InterimHandlers<'h> {
	/// Registers `cb` for the version family of `version`. HTTP/1.0
	/// clients never receive interim responses.
	pub fn set(&mut self, version: HttpVersion, cb: InterimCallback<'h>) {
		match version {
			HttpVersion::Http10 => {}
			HttpVersion::Http11 => self.h1 = Some(cb),
			HttpVersion::Http2 | HttpVersion::Http3 => self.h2 = Some(cb),
		}
	}

	fn get_mut(&mut self, version: HttpVersion) -> Option<&mut InterimCallback<'h>> {
		match version {
			HttpVersion::Http10 => None,
			HttpVersion::Http11 => self.h1.as_mut(),
			HttpVersion::Http2 | HttpVersion::Http3 => self.h2.as_mut(),
		}
	}
}

/// Per-exchange configuration for ingesting one backend response.
pub struct ResponseOptions<'h> {
	/// The backend's protocol family.
	pub backend: BackendKind,
	/// Whether a 3xx response with a `Location` header and no body is
	/// handed back for internal re-dispatch instead of being sent.
	pub local_redir: bool,
	/// Whether `X-Sendfile` delegation headers are honored.
	pub xsendfile_allow: bool,
	/// Directory prefixes a delegated path must fall under; empty trusts
	/// everything. Entries carry a trailing slash.
	pub xsendfile_docroot: Vec<PathBuf>,
	/// Whether delegated paths are folded to lowercase (case-insensitive
	/// filesystems).
	pub force_lowercase_paths: bool,
	/// Interim-response forwarding, per client HTTP version.
	pub send_1xx: InterimHandlers<'h>,
	/// Invoked once the final header block is complete.
	pub on_headers: Option<HeadersCallback<'h>>,
	/// Invoked for an internal redirect when `local_redir` applies.
	pub on_local_redir: Option<HeadersCallback<'h>>,
	/// Receives authorizer `Variable-*` exports.
	pub env: Option<EnvSink<'h>>,
}

impl std::fmt::Debug for ResponseOptions<'_> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ResponseOptions")
			.field("backend", &self.backend)
			.field("local_redir", &self.local_redir)
			.field("xsendfile_allow", &self.xsendfile_allow)
			.field("xsendfile_docroot", &self.xsendfile_docroot)
			.field("force_lowercase_paths", &self.force_lowercase_paths)
			.finish()
	}
}

impl ResponseOptions<'_> {
	/// Constructs options for `backend` with every optional behavior off.
	#[must_use]
	pub fn new(backend: BackendKind) -> Self {
		Self {
			backend,
			local_redir: false,
			xsendfile_allow: false,
			xsendfile_docroot: Vec::new(),
			force_lowercase_paths: false,
			send_1xx: InterimHandlers::default(),
			on_headers: None,
			on_local_redir: None,
			env: None,
		}
	}
}

/// The state of one response being ingested from a backend.
#[derive(Debug)]
pub struct Response {
	/// The response status; zero until the backend supplies one.
	pub status: u16,
	/// The client connection's HTTP version, which gates hop-by-hop
	/// header handling.
	pub http_version: HttpVersion,
	/// Cleared when the backend asks for the connection to close.
	pub keep_alive: bool,
	/// Set once the header block is complete and body bytes flow.
	pub body_started: bool,
	/// Set once the body is known to be complete.
	pub body_finished: bool,
	headers: Vec<(String, String)>,
	pub(crate) aborted: bool,
	pub(crate) saw_content_length: bool,
	pub(crate) body_remaining: Option<u64>,
	pub(crate) decode_chunked: bool,
	pub(crate) dechunk: Option<Dechunker>,
}

impl Response {
	/// Constructs an empty response for a client speaking `version`.
	#[must_use]
	pub fn new(version: HttpVersion) -> Self {
		Self {
			status: 0,
			http_version: version,
			keep_alive: true,
			body_started: false,
			body_finished: false,
			headers: Vec::new(),
			aborted: false,
			saw_content_length: false,
			body_remaining: None,
			decode_chunked: false,
			dechunk: None,
		}
	}

	/// Returns the response headers in arrival order.
	#[must_use]
	pub fn headers(&self) -> &[(String, String)] {
		&self.headers
	}

	/// Returns the value of the first header named `name`, compared
	/// case-insensitively.
	#[must_use]
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers
			.iter()
			.find(|(k, _)| k.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}

	/// Whether the backend's handling was abandoned; the accumulated
	/// status describes an error response the server generates itself.
	#[must_use]
	pub fn aborted(&self) -> bool {
		self.aborted
	}

	pub(crate) fn insert_header(&mut self, name: &str, value: &str) {
		self.headers.push((name.to_owned(), value.to_owned()));
	}

	pub(crate) fn take_header(&mut self, name: &str) -> Option<String> {
		let i = self
			.headers
			.iter()
			.position(|(k, _)| k.eq_ignore_ascii_case(name))?;
		Some(self.headers.remove(i).1)
	}

	pub(crate) fn remove_header(&mut self, name: &str) {
		self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
	}

	/// Forgets all header state, ready for the next response on the same
	/// backend connection (used after forwarding an interim response).
	pub(crate) fn clear_headers(&mut self) {
		self.status = 0;
		self.headers.clear();
		self.saw_content_length = false;
		self.body_remaining = None;
		self.decode_chunked = false;
		self.dechunk = None;
	}

	/// Pushes body bytes into `out`, dechunking or counting down a
	/// Content-Length as the header block dictated, and marks the body
	/// finished when its end is recognized.
	///
	/// # Errors
	/// Returns `InvalidData` wrapping a [`crate::GatewayError`] when the
	/// chunked framing is malformed.
	pub(crate) fn append_body(&mut self, out: &mut ChunkQueue, data: &[u8]) -> Result<()> {
		if self.body_finished || data.is_empty() {
			return Ok(());
		}
		if let Some(d) = &mut self.dechunk {
			let done = d.decode_append(data, out).map_err(|e| {
				tracing::error!(error = %e, "invalid chunked body from backend");
				std::io::Error::from(e)
			})?;
			if done {
				self.body_finished = true;
			}
		} else if let Some(remaining) = self.body_remaining {
			let take = remaining.min(data.len() as u64);
			out.append_bytes(&data[..take as usize]);
			let left = remaining - take;
			self.body_remaining = Some(left);
			if left == 0 {
				self.body_finished = true;
			}
		} else {
			out.append_bytes(data);
		}
		Ok(())
	}
}

/// Reads from the backend descriptor `fd` until it would block, the output
/// queue is full, or the response ends, accumulating header bytes in `buf`
/// and body bytes in `out`.
///
/// `buf` holds the partial header block between calls and must be carried
/// across them unchanged; it draws its capacity from `out`'s pool.
/// Returns [`Control::GoOn`] when the caller should wait for readiness and
/// call again, [`Control::Finished`] when the backend is done (end of
/// response, end of stream, or a protocol failure recorded on `resp`).
///
/// # Errors
/// Returns descriptor read errors and protocol errors severe enough to
/// abandon the connection.
pub fn read_response(
	fd: BorrowedFd<'_>,
	resp: &mut Response,
	opts: &mut ResponseOptions<'_>,
	buf: &mut Vec<u8>,
	out: &mut ChunkQueue,
	cache: &mut dyn ContentCache,
	dates: &mut HttpDateCache,
) -> Result<Control> {
	let pool = out.pool().clone();
	loop {
		let queued = out.len();
		if queued >= OUT_QUEUE_LIMIT - 1 {
			return Ok(Control::GoOn);
		}
		let mut toread = pool.chunk_size() as u64;
		if queued + toread > OUT_QUEUE_LIMIT - OUT_QUEUE_HEADROOM {
			toread = OUT_QUEUE_LIMIT - 1 - queued;
		}
		let spare = pool.reserve(buf, toread as usize);
		let base = buf.len();
		buf.resize(base + spare, 0);
		let n = match nix::unistd::read(fd.as_raw_fd(), &mut buf[base..]) {
			Ok(n) => {
				buf.truncate(base + n);
				n
			}
			Err(Errno::EAGAIN) | Err(Errno::EINTR) => {
				buf.truncate(base);
				return Ok(Control::GoOn);
			}
			Err(e) => {
				buf.truncate(base);
				tracing::error!(errno = %e, "reading from backend failed");
				return Err(e.into());
			}
		};
		if n == 0 {
			// end of stream terminates a body of unknown length
			if resp.body_started {
				resp.body_finished = true;
			}
			return Ok(Control::Finished);
		}
		if resp.body_started {
			resp.append_body(out, buf)?;
			buf.clear();
		} else {
			let rc = parse_headers(resp, opts, buf, out, cache, dates)?;
			if rc != Control::GoOn || resp.aborted {
				return Ok(rc);
			}
			if resp.body_started {
				pool.shrink_to_standard(buf);
			}
			if resp.body_finished {
				return Ok(Control::Finished);
			}
		}
		if resp.body_finished {
			return Ok(Control::Finished);
		}
		if out.len() > OUT_QUEUE_LIMIT - OUT_QUEUE_HEADROOM {
			return Ok(Control::GoOn);
		}
		if n < spare {
			// drained the socket buffer
			return Ok(Control::GoOn);
		}
	}
}
