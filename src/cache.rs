//! The content-metadata collaborator consulted when a backend delegates a
//! file to be served.

use std::fs::File;
use std::io::{Error, ErrorKind, Result};
use std::path::Path;
use std::rc::Rc;
use std::time::SystemTime;

/// Metadata for a regular file that is about to be served.
#[derive(Debug)]
pub struct FileInfo {
	/// An open descriptor for the file, shared with whatever cache owns it.
	/// `None` if the cache could not keep one open.
	pub file: Option<Rc<File>>,
	/// Size in bytes.
	pub size: u64,
	/// Last modification time.
	pub mtime: SystemTime,
	/// A strong validator for the current contents, if available.
	pub etag: Option<String>,
	/// MIME type derived from the file name, if known.
	pub content_type: Option<String>,
}

/// A source of file metadata, typically backed by a stat cache.
pub trait ContentCache {
	/// Looks up a regular file by path.
	///
	/// # Errors
	/// Returns `NotFound` if the path does not resolve, and
	/// `PermissionDenied` if it resolves to something other than a regular
	/// readable file.
	fn lookup(&mut self, path: &Path) -> Result<FileInfo>;
}

/// A [`ContentCache`] that opens and stats the file on every lookup.
///
/// Suitable for tests and small deployments; anything busier wants a real
/// cache behind the trait.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectLookup;

impl ContentCache for DirectLookup {
	fn lookup(&mut self, path: &Path) -> Result<FileInfo> {
		let file = File::open(path)?;
		let meta = file.metadata()?;
		if !meta.is_file() {
			return Err(Error::new(
				ErrorKind::PermissionDenied,
				"not a regular file",
			));
		}
		let mtime = meta.modified()?;
		let etag = {
			use std::os::unix::fs::MetadataExt as _;
			Some(format!(
				"\"{:x}-{:x}-{:x}\"",
				meta.ino(),
				meta.len(),
				meta.mtime()
			))
		};
		Ok(FileInfo {
			file: Some(Rc::new(file)),
			size: meta.len(),
			mtime,
			etag,
			content_type: None,
		})
	}
}

#[cfg(test)]
mod test {
	use super::{ContentCache as _, DirectLookup};
	use std::io::Write as _;

	/// Tests metadata for a regular file.
	#[test]
	fn regular_file() {
		let mut f = tempfile::NamedTempFile::new().unwrap();
		f.write_all(b"twelve bytes").unwrap();
		f.flush().unwrap();
		let info = DirectLookup.lookup(f.path()).unwrap();
		assert_eq!(info.size, 12);
		assert!(info.file.is_some());
		assert!(info.etag.is_some());
	}

	/// Tests rejection of directories.
	#[test]
	fn directory_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let err = DirectLookup.lookup(dir.path()).unwrap_err();
		assert_eq!(err.kind(), std::io::ErrorKind::PermissionDenied);
	}

	/// Tests the missing-file error kind.
	#[test]
	fn missing_file() {
		let err = DirectLookup
			.lookup(std::path::Path::new("/nonexistent/for/sure"))
			.unwrap_err();
		assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
	}
}
