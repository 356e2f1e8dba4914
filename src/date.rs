//! A small rolling cache of formatted HTTP-dates.
//!
//! Formatting an RFC 7231 date is cheap but not free, and servers format
//! the same second over and over. The cache keys sixteen slots by unix
//! timestamp and replaces the oldest entry on a miss.

use chrono::{DateTime, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

const SLOTS: usize = 16;

/// A fixed-size cache of formatted HTTP-dates keyed by second.
#[derive(Debug, Default)]
pub struct HttpDateCache {
	slots: Vec<(i64, String)>,
	next: usize,
}

impl HttpDateCache {
	/// Constructs an empty cache.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns `t` formatted as an RFC 7231 HTTP-date, reusing a cached
	/// string when the same second was formatted recently.
	pub fn format(&mut self, t: SystemTime) -> &str {
		let secs = match t.duration_since(UNIX_EPOCH) {
			Ok(d) => d.as_secs() as i64,
			Err(_) => 0,
		};
		let hit = self.slots.iter().position(|(k, _)| *k == secs);
		let i = match hit {
			Some(i) => i,
			None => {
				let formatted = match DateTime::<Utc>::from_timestamp(secs, 0) {
					Some(dt) => dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
					None => String::from("Thu, 01 Jan 1970 00:00:00 GMT"),
				};
				if self.slots.len() < SLOTS {
					self.slots.push((secs, formatted));
					self.slots.len() - 1
				} else {
					let i = self.next;
					self.next = (self.next + 1) % SLOTS;
					self.slots[i] = (secs, formatted);
					i
				}
			}
		};
		&self.slots[i].1
	}
}

#[cfg(test)]
mod test {
	use super::{HttpDateCache, SLOTS};
	use std::time::{Duration, UNIX_EPOCH};

	/// Tests the formatted shape of a known timestamp.
	#[test]
	fn known_timestamp() {
		let mut cache = HttpDateCache::new();
		let t = UNIX_EPOCH + Duration::from_secs(784111777);
		assert_eq!(cache.format(t), "Sun, 06 Nov 1994 08:49:37 GMT");
	}

	/// Tests that a repeated second reuses the cached string.
	#[test]
	fn repeated_second_is_cached() {
		let mut cache = HttpDateCache::new();
		let t = UNIX_EPOCH + Duration::from_secs(1_000_000_000);
		let first = cache.format(t).as_ptr();
		let second = cache.format(t).as_ptr();
		assert_eq!(first, second);
	}

	/// Tests that an entry survives other timestamps until the cache
	/// wraps, and is replaced afterwards.
	#[test]
	fn eviction_after_wrap() {
		let mut cache = HttpDateCache::new();
		let t = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
		let first = cache.format(t).as_ptr();
		for i in 1..SLOTS as u64 {
			let _ = cache.format(UNIX_EPOCH + Duration::from_secs(1_700_000_000 + i));
		}
		assert_eq!(cache.format(t).as_ptr(), first);
		for i in 0..SLOTS as u64 {
			let _ = cache.format(UNIX_EPOCH + Duration::from_secs(1_800_000_000 + i));
		}
		let again = cache.format(t);
		assert_eq!(again, "Tue, 14 Nov 2023 22:13:20 GMT");
	}
}
