#![warn(
	future_incompatible,
	nonstandard_style,
	rust_2018_idioms,
	unused
)]
#![warn(
	deprecated_in_future,
	missing_debug_implementations,
	missing_docs,
	trivial_casts,
	trivial_numeric_casts,
	unused_crate_dependencies,
	unused_import_braces,
	unused_qualifications
)]
#![warn(clippy::pedantic, clippy::cargo)]
// Disabled because we frequently mix u64 and usize, where the former is used
// for stream and file lengths and the latter for in-memory buffer sizes.
#![allow(clippy::cast_possible_truncation)]

//! Response-body plumbing for an event-driven HTTP server.
//!
//! The core type is the [`ChunkQueue`]: an ordered sequence of in-memory
//! buffers and file ranges that holds bytes between the subsystem that
//! produced them and the socket that will carry them, without copying more
//! than necessary. Queues draw their buffers from a shared [`ChunkPool`]
//! and can spill to unlinked temporary files when a body grows too large
//! to keep in memory.
//!
//! On top of the queue sit the two halves of talking to a backend process:
//! [`read_response`] ingests a CGI, FastCGI, proxy, or authorizer response
//! (header classification, chunked decoding, `X-Sendfile` delegation) into
//! a queue, and [`write_chunk`] drains a queue to a non-blocking socket
//! using `sendfile`, `mmap`, or plain writes as each chunk allows.
//!
//! # Example
//! ```
//! let pool = chunkq::ChunkPool::new();
//! let mut queue = chunkq::ChunkQueue::new(&pool);
//! queue.append_bytes(b"hello ");
//! queue.append_bytes(b"world");
//! let mut body = [0_u8; 11];
//! queue.read_into(&mut body).unwrap();
//! assert_eq!(&body, b"hello world");
//! assert!(queue.is_empty());
//! ```

mod cache;
mod chunk;
mod date;
mod error;
mod pool;
mod queue;
mod response;
mod spill;
mod write;

pub use cache::ContentCache;
pub use cache::DirectLookup;
pub use cache::FileInfo;
pub use date::HttpDateCache;
pub use error::GatewayError;
pub use pool::ChunkPool;
pub use pool::DEFAULT_CHUNK_SIZE;
pub use pool::DEFAULT_TEMPFILE_SIZE;
pub use queue::ChunkQueue;
pub use response::parse_headers;
pub use response::read_response;
pub use response::BackendKind;
pub use response::Control;
pub use response::EnvSink;
pub use response::HeadersCallback;
pub use response::HttpVersion;
pub use response::InterimCallback;
pub use response::InterimHandlers;
pub use response::Response;
pub use response::ResponseOptions;
pub use response::MAX_HEADER_SIZE;
pub use write::small_response_optim;
pub use write::write_chunk;
pub use write::write_chunk_to_pipe;
