//! Splitting a backend's header block from its body and classifying the
//! headers.
//!
//! Backends produce three dialects: a real HTTP status line (NPH and
//! proxied origins), CGI `Key: value` headers with an optional `Status`
//! field, and, for the sloppiest CGI programs, no headers at all.
//! Line endings may be CRLF or bare LF in any mix.

use super::delegate;
use super::{BackendKind, Control, HttpVersion, Response, ResponseOptions, MAX_HEADER_SIZE};
use crate::cache::ContentCache;
use crate::date::HttpDateCache;
use crate::error::GatewayError;
use crate::queue::ChunkQueue;
use std::io::Result;

/// Attempts to complete the header block accumulated in `buf`, classify its
/// headers into `resp`, and start the body.
///
/// Returns [`Control::GoOn`] while the block is still incomplete or once it
/// has been processed and more body is expected, and [`Control::Finished`]
/// when the response is over, including the protocol-failure cases recorded
/// as a status on `resp`. Interim (1xx) responses are forwarded and their
/// bytes drained from `buf` before parsing continues.
///
/// # Errors
/// Returns `InvalidData` for an unparsable NPH status line and temp-file or
/// dechunking errors from pushing the first body bytes.
pub fn parse_headers(
	resp: &mut Response,
	opts: &mut ResponseOptions<'_>,
	buf: &mut Vec<u8>,
	out: &mut ChunkQueue,
	cache: &mut dyn ContentCache,
	dates: &mut HttpDateCache,
) -> Result<Control> {
	let body_off = loop {
		let blen = buf.len();
		if blen == 0 {
			return Ok(Control::GoOn);
		}
		// "HTTP/1.1 200 " is at least 13 chars; accept without final space
		let is_nph = blen >= 12 && buf.starts_with(b"HTTP/");
		let mut header_nl = None;
		if buf[0] == b'\n' || (buf[0] == b'\r' && blen >= 2 && buf[1] == b'\n') {
			// no headers at all
			header_nl = Some(if buf[0] == b'\n' { 0 } else { 1 });
		} else {
			let scan = if is_nph {
				0
			} else {
				buf.iter()
					.position(|&c| c == b':' || c == b'\n')
					.unwrap_or(blen)
			};
			if is_nph || (scan < blen && buf[scan] == b':') {
				if let Some(n) = end_of_header(buf, scan + 1) {
					header_nl = Some(n - 1);
				}
			} else if scan == blen {
				// partial first line
			} else if opts.backend == BackendKind::Cgi {
				// no headers, just a body
				resp.status = 200;
				resp.body_started = true;
				out.append_bytes(buf);
				buf.clear();
				return Ok(Control::GoOn);
			} else {
				resp.status = 502;
				resp.aborted = true;
				return Ok(Control::Finished);
			}
		}
		let Some(nl) = header_nl else {
			if blen > MAX_HEADER_SIZE {
				tracing::error!(len = blen, error = %GatewayError::HeadersTooLarge, "rejecting backend response");
				resp.status = 502;
				resp.aborted = true;
				return Ok(Control::Finished);
			}
			return Ok(Control::GoOn);
		};
		let body_off = nl + 1;
		let mut hdr_end = nl;
		if hdr_end > 0 && buf[hdr_end - 1] == b'\r' {
			hdr_end -= 1;
		}
		if opts.backend == BackendKind::Proxy && !is_nph {
			// proxied origin must send a Status-Line
			resp.status = 502;
			resp.aborted = true;
			return Ok(Control::Finished);
		}
		let block = buf[..hdr_end].to_vec();
		process_header_block(resp, opts, &block)?;
		if resp.status < 200 && resp.status != 0 && resp.status != 101 {
			// interim response: discard its bytes, forward it, and look
			// for the next response in the same buffer
			buf.drain(..body_off);
			if send_interim(resp, opts) {
				continue;
			}
			break 0;
		}
		break body_off;
	};

	resp.body_started = true;

	if opts.backend == BackendKind::Authorizer && (resp.status == 0 || resp.status == 200) {
		return Ok(Control::GoOn);
	}

	if resp.aborted {
		return Ok(Control::Finished);
	}

	let body_len = buf.len() - body_off;

	if opts.local_redir
		&& (300..400).contains(&resp.status)
		&& body_len == 0
		&& resp.header("Location").is_some()
	{
		if let Some(cb) = &mut opts.on_local_redir {
			let rc = cb(resp);
			if rc != Control::GoOn {
				return Ok(rc);
			}
		}
	}

	if opts.xsendfile_allow {
		if opts.backend == BackendKind::FastCgi {
			if let Some(v) = resp.take_header("X-Sendfile2") {
				delegate::sendfile2(resp, opts, out, cache, dates, &v);
				if resp.aborted {
					resp.body_started = false;
				}
				return Ok(Control::Finished);
			}
		}
		let delegated = resp.take_header("X-Sendfile").or_else(|| {
			if opts.backend == BackendKind::FastCgi {
				resp.take_header("X-LIGHTTPD-send-file")
			} else {
				None
			}
		});
		if let Some(v) = delegated {
			delegate::sendfile(resp, opts, out, cache, dates, &v);
			if resp.aborted {
				resp.body_started = false;
			}
			return Ok(Control::Finished);
		}
	}

	if resp.body_remaining == Some(0) {
		// Content-Length: 0, nothing further to read
		resp.body_finished = true;
	}
	if body_len > 0 {
		let body = buf[body_off..].to_vec();
		resp.append_body(out, &body)?;
	}

	match &mut opts.on_headers {
		Some(cb) => Ok(cb(resp)),
		None => Ok(Control::GoOn),
	}
}

/// Finds the `\n(\r)?\n` sequence ending a header block, scanning from
/// `from`, and returns the index one past it.
fn end_of_header(b: &[u8], from: usize) -> Option<usize> {
	let mut prev: Option<usize> = None;
	let mut pos = from;
	while let Some(rel) = b.get(pos..)?.iter().position(|&c| c == b'\n') {
		let n = pos + rel;
		match prev {
			Some(p) if n - p == 1 => return Some(n + 1),
			Some(p) if n - p == 2 && b[n - 1] == b'\r' => return Some(n + 1),
			_ => {}
		}
		prev = Some(n);
		pos = n + 1;
	}
	None
}

fn process_header_block(
	resp: &mut Response,
	opts: &mut ResponseOptions<'_>,
	block: &[u8],
) -> Result<()> {
	let mut status_is_set = false;
	for (lineno, raw) in block.split(|&c| c == b'\n').enumerate() {
		let line = raw.strip_suffix(b"\r").unwrap_or(raw);
		if line.is_empty() {
			continue;
		}
		if lineno == 0 && line.len() >= 12 && line.starts_with(b"HTTP/") {
			// non-parsed headers; parse them anyway (accept HTTP/2.0 and
			// HTTP/3.0 from naive non-proxy backends)
			if (line[5] == b'1' || opts.backend != BackendKind::Proxy)
				&& line[6] == b'.'
				&& (line[7] == b'1' || line[7] == b'0')
				&& line[8] == b' '
			{
				if let Some(code) = str_to_code(&line[9..]) {
					resp.status = code;
					status_is_set = true;
				}
			}
			if resp.status == 0 {
				tracing::error!(
					line = %String::from_utf8_lossy(line),
					"invalid HTTP status line from backend",
				);
				resp.status = 502;
				resp.aborted = true;
				return Err(GatewayError::InvalidStatusLine.into());
			}
			continue;
		}
		let Some(colon) = line.iter().position(|&c| c == b':') else {
			continue;
		};
		let key = &line[..colon];
		if key.is_empty() {
			continue;
		}
		let mut value = &line[colon + 1..];
		while let Some((&(b' ' | b'\t'), rest)) = value.split_first() {
			value = rest;
		}
		let key_str = String::from_utf8_lossy(key).into_owned();
		let value_str = String::from_utf8_lossy(value).into_owned();

		if opts.backend == BackendKind::Authorizer
			&& (resp.status == 0 || resp.status == 200)
		{
			if key_str.eq_ignore_ascii_case("Status") {
				match str_to_code(value) {
					Some(code) => resp.status = code,
					None => {
						resp.status = 502;
						break;
					}
				}
			} else if key.len() > 9 && key[..9].eq_ignore_ascii_case(b"Variable-") {
				if let Some(env) = &mut opts.env {
					env(&String::from_utf8_lossy(&key[9..]), &value_str);
				}
			}
			continue;
		}

		if key_str.eq_ignore_ascii_case("Status") {
			if opts.backend != BackendKind::Proxy {
				match str_to_code(value) {
					Some(code) => {
						resp.status = code;
						status_is_set = true;
					}
					None => {
						resp.status = 502;
						resp.aborted = true;
					}
				}
				// never sent on to the client
				continue;
			}
		} else if key_str.eq_ignore_ascii_case("Upgrade") {
			if opts.backend != BackendKind::Proxy && opts.backend != BackendKind::Cgi {
				continue;
			}
			if resp.http_version >= HttpVersion::Http2 {
				continue;
			}
		} else if key_str.eq_ignore_ascii_case("Connection") {
			if opts.backend == BackendKind::Proxy {
				continue;
			}
			// a simplistic attempt to honor a backend request to close
			if contains_close(value) {
				resp.keep_alive = false;
			}
			if resp.http_version >= HttpVersion::Http2 {
				continue;
			}
		} else if key_str.eq_ignore_ascii_case("Content-Length") {
			let digits = value.strip_prefix(b"+").unwrap_or(value);
			if resp.decode_chunked || resp.saw_content_length {
				// ignore Content-Length under Transfer-Encoding: chunked
				// and ignore subsequent (multiple) Content-Length
				continue;
			}
			let trimmed = trim_trailing_ws(digits);
			if trimmed.is_empty() {
				continue;
			}
			match parse_decimal(trimmed) {
				Some(n) => resp.body_remaining = Some(n),
				// invalid value from backend: read until close and
				// hope for the best
				None => resp.body_remaining = None,
			}
			resp.saw_content_length = true;
			resp.insert_header(&key_str, &String::from_utf8_lossy(digits));
			continue;
		} else if key_str.eq_ignore_ascii_case("Transfer-Encoding") {
			if resp.saw_content_length {
				resp.body_remaining = None;
				resp.remove_header("Content-Length");
				resp.saw_content_length = false;
			}
			// assumes "Transfer-Encoding: chunked"; does not verify
			resp.decode_chunked = true;
			resp.dechunk = Some(super::Dechunker::new());
			continue;
		} else if key_str.eq_ignore_ascii_case("HTTP2-Settings") {
			// RFC 7540 3.2.1: a server must not send this field
			continue;
		}
		resp.insert_header(&key_str, &value_str);
	}
	// CGI/1.1: a Location header with no status implies a 302 redirect
	// (proxy requires a Status-Line, so this never fires for proxy)
	if !status_is_set && resp.header("Location").is_some() {
		resp.status = 302;
	}
	Ok(())
}

fn send_interim(resp: &mut Response, opts: &mut ResponseOptions<'_>) -> bool {
	if let Some(cb) = opts.send_1xx.get_mut(resp.http_version) {
		if !cb(resp) {
			return false;
		}
	}
	resp.clear_headers();
	true
}

/// Parses the leading decimal digits of `s` as a status code, accepting
/// 100 through 999.
fn str_to_code(s: &[u8]) -> Option<u16> {
	let digits = s.iter().take_while(|c| c.is_ascii_digit()).count();
	if digits == 0 || digits > 9 {
		return None;
	}
	let mut code: u32 = 0;
	for &c in &s[..digits] {
		code = code * 10 + u32::from(c - b'0');
	}
	if (100..1000).contains(&code) {
		Some(code as u16)
	} else {
		None
	}
}

fn parse_decimal(s: &[u8]) -> Option<u64> {
	if s.is_empty() || !s.iter().all(u8::is_ascii_digit) {
		return None;
	}
	let mut n: u64 = 0;
	for &c in s {
		n = n.checked_mul(10)?.checked_add(u64::from(c - b'0'))?;
	}
	Some(n)
}

fn trim_trailing_ws(s: &[u8]) -> &[u8] {
	let end = s
		.iter()
		.rposition(|&c| c != b' ' && c != b'\t')
		.map_or(0, |i| i + 1);
	&s[..end]
}

fn contains_close(v: &[u8]) -> bool {
	v.windows(5).any(|w| w.eq_ignore_ascii_case(b"close"))
}
