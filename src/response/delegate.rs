//! Delegated static-file serving, where a backend hands back a path (or a
//! list of path ranges) instead of a body and the server streams the file
//! itself.
//!
//! Paths arrive percent-encoded from an untrusted process, so they are
//! decoded, lexically simplified, and checked against the configured
//! docroot prefixes before anything touches the filesystem.

use super::{Response, ResponseOptions};
use crate::cache::ContentCache;
use crate::date::HttpDateCache;
use crate::error::GatewayError;
use crate::queue::ChunkQueue;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Serves the whole file named by an `X-Sendfile` header value.
pub(super) fn sendfile(
	resp: &mut Response,
	opts: &ResponseOptions<'_>,
	out: &mut ChunkQueue,
	cache: &mut dyn ContentCache,
	dates: &mut HttpDateCache,
	value: &str,
) {
	reset_content_length(resp);
	let saved = resp.status;
	let path = match decode_path(value, opts.force_lowercase_paths) {
		Ok(p) => p,
		Err(e) => {
			tracing::error!(value, error = %e, "rejecting delegated path");
			if resp.status < 400 {
				resp.status = 502;
				resp.aborted = true;
			}
			return;
		}
	};
	if path.is_empty() {
		tracing::error!(value, error = %GatewayError::EmptyPath, "rejecting delegated path");
		resp.status = 502;
	} else if !under_docroot(&path, &opts.xsendfile_docroot, opts.force_lowercase_paths) {
		tracing::error!(path, error = %GatewayError::UntrustedPath, "rejecting delegated path");
		resp.status = 403;
	} else {
		send_file(resp, out, cache, dates, Path::new(&path));
	}
	finish_delegation(resp, saved);
}

/// Queues the ranges named by an `X-Sendfile2` header value: a
/// comma-separated list of `<urlencoded-path> <begin>-[<end>]` entries.
pub(super) fn sendfile2(
	resp: &mut Response,
	opts: &ResponseOptions<'_>,
	out: &mut ChunkQueue,
	cache: &mut dyn ContentCache,
	_dates: &mut HttpDateCache,
	value: &str,
) {
	reset_content_length(resp);
	let saved = resp.status;
	let mut rest = value;
	loop {
		rest = rest.trim_start_matches(' ');
		if rest.is_empty() {
			break;
		}
		let Some(sp) = rest.find(' ') else {
			tracing::error!(entry = rest, "delegated range entry lacks a range");
			resp.status = 502;
			break;
		};
		let encoded = &rest[..sp];
		let after = &rest[sp + 1..];
		let range_end = after
			.find(|c| c == ' ' || c == ',')
			.unwrap_or(after.len());
		let range = &after[..range_end];
		let tail = after[range_end..].trim_start_matches(' ');

		let path = match decode_path(encoded, opts.force_lowercase_paths) {
			Ok(p) if !p.is_empty() => p,
			Ok(_) => {
				resp.status = 502;
				break;
			}
			Err(e) => {
				tracing::error!(entry = encoded, error = %e, "rejecting delegated path");
				resp.status = 502;
				break;
			}
		};
		if !under_docroot(&path, &opts.xsendfile_docroot, opts.force_lowercase_paths) {
			tracing::error!(path, error = %GatewayError::UntrustedPath, "rejecting delegated path");
			resp.status = 403;
			break;
		}
		let info = match cache.lookup(Path::new(&path)) {
			Ok(info) => info,
			Err(e) => {
				tracing::error!(path, error = %e, "delegated file lookup failed");
				resp.status = if e.kind() == ErrorKind::NotFound {
					404
				} else {
					502
				};
				break;
			}
		};
		let (begin, len) = match parse_range(range, info.size) {
			Ok(r) => r,
			Err(e) => {
				tracing::error!(range, error = %e, "rejecting delegated range");
				resp.status = 502;
				break;
			}
		};
		if !tail.is_empty() && !tail.starts_with(',') {
			// no parameters accepted
			resp.status = 502;
			break;
		}
		if len != 0 {
			match info.file {
				Some(f) => out.append_file_shared(Path::new(&path), f, begin, len),
				None => out.append_file_range(Path::new(&path), begin, len),
			}
		}
		match tail.strip_prefix(',') {
			Some(next) => rest = next,
			None => break,
		}
	}
	finish_delegation(resp, saved);
}

/// Looks up `path` and queues it as the whole response body, filling in
/// Content-Type, validators, and Content-Length.
fn send_file(
	resp: &mut Response,
	out: &mut ChunkQueue,
	cache: &mut dyn ContentCache,
	dates: &mut HttpDateCache,
	path: &Path,
) {
	let info = match cache.lookup(path) {
		Ok(info) => info,
		Err(e) => {
			tracing::error!(path = %path.display(), error = %e, "delegated file lookup failed");
			resp.status = if e.kind() == ErrorKind::NotFound {
				404
			} else {
				403
			};
			return;
		}
	};
	if info.file.is_none() && info.size != 0 {
		tracing::error!(path = %path.display(), "delegated file has no open descriptor");
		resp.status = 403;
		return;
	}

	let mut allow_caching = resp.status == 0 || resp.status == 200;

	if resp.header("Content-Type").is_none() {
		match &info.content_type {
			Some(ct) => resp.insert_header("Content-Type", ct),
			None => {
				resp.insert_header("Content-Type", "application/octet-stream");
				allow_caching = false;
			}
		}
	}
	if allow_caching {
		if resp.header("ETag").is_none() {
			if let Some(etag) = &info.etag {
				resp.insert_header("ETag", etag);
			}
		}
		if resp.header("Last-Modified").is_none() {
			let mtime = dates.format(info.mtime).to_owned();
			resp.insert_header("Last-Modified", &mtime);
		}
	}

	if info.size == 0 {
		resp.status = 200;
		resp.body_finished = true;
		resp.insert_header("Content-Length", "0");
		return;
	}
	// info.file checked above
	if let Some(f) = info.file {
		out.append_file_shared(path, f, 0, info.size);
	}
	resp.status = 200;
	resp.body_finished = true;
	resp.insert_header("Content-Length", &info.size.to_string());
}

/// Applies the post-delegation status rules: a fresh failure aborts unless
/// the backend had already failed, and a backend status other than 200
/// survives a successful delegation.
fn finish_delegation(resp: &mut Response, saved: u16) {
	if resp.status >= 400 && saved < 300 {
		resp.aborted = true;
	} else if saved != 0 && saved != 200 {
		resp.status = saved;
	}
}

fn reset_content_length(resp: &mut Response) {
	resp.remove_header("Content-Length");
	resp.saw_content_length = false;
	resp.body_remaining = None;
}

/// Percent-decodes, validates, and lexically simplifies a delegated path.
fn decode_path(encoded: &str, force_lowercase: bool) -> Result<String, GatewayError> {
	let decoded = percent_decode(encoded.as_bytes())?;
	let s = String::from_utf8(decoded).map_err(|_| GatewayError::PathNotUtf8)?;
	let mut simplified = simplify_path(&s);
	if force_lowercase {
		simplified.make_ascii_lowercase();
	}
	Ok(simplified)
}

fn percent_decode(s: &[u8]) -> Result<Vec<u8>, GatewayError> {
	let mut out = Vec::with_capacity(s.len());
	let mut i = 0;
	while i < s.len() {
		let b = if s[i] == b'%' {
			let hi = s.get(i + 1).and_then(|&c| hex_val(c));
			let lo = s.get(i + 2).and_then(|&c| hex_val(c));
			let (Some(hi), Some(lo)) = (hi, lo) else {
				return Err(GatewayError::InvalidPathEncoding);
			};
			i += 3;
			hi * 16 + lo
		} else {
			i += 1;
			s[i - 1]
		};
		if b == 0 {
			return Err(GatewayError::InvalidPathEncoding);
		}
		out.push(b);
	}
	Ok(out)
}

fn hex_val(c: u8) -> Option<u8> {
	match c {
		b'0'..=b'9' => Some(c - b'0'),
		b'a'..=b'f' => Some(c - b'a' + 10),
		b'A'..=b'F' => Some(c - b'A' + 10),
		_ => None,
	}
}

/// Removes `.` and `..` segments and duplicate slashes without consulting
/// the filesystem. `..` never climbs past the first segment.
fn simplify_path(p: &str) -> String {
	let absolute = p.starts_with('/');
	let mut parts: Vec<&str> = Vec::new();
	for seg in p.split('/') {
		match seg {
			"" | "." => {}
			".." => {
				parts.pop();
			}
			s => parts.push(s),
		}
	}
	let mut out = String::with_capacity(p.len());
	if absolute {
		out.push('/');
	}
	out.push_str(&parts.join("/"));
	out
}

fn under_docroot(path: &str, roots: &[PathBuf], fold: bool) -> bool {
	if roots.is_empty() {
		return true;
	}
	let path = path.as_bytes();
	roots.iter().any(|root| {
		let root = root.as_os_str().as_encoded_bytes();
		path.len() >= root.len()
			&& if fold {
				path[..root.len()].eq_ignore_ascii_case(root)
			} else {
				&path[..root.len()] == root
			}
	})
}

fn parse_range(s: &str, size: u64) -> Result<(u64, u64), GatewayError> {
	let (b, e) = s.split_once('-').ok_or(GatewayError::MalformedRange)?;
	let begin = parse_off(b)?;
	let end = if e.is_empty() {
		size as i64 - 1
	} else {
		parse_off(e)?
	};
	let len = end - begin + 1;
	if len < 0 {
		return Err(GatewayError::MalformedRange);
	}
	Ok((begin as u64, len as u64))
}

fn parse_off(s: &str) -> Result<i64, GatewayError> {
	if s.is_empty() || !s.bytes().all(|c| c.is_ascii_digit()) {
		return Err(GatewayError::MalformedRange);
	}
	s.parse().map_err(|_| GatewayError::MalformedRange)
}
