//! Data streams
//!
//! [`DataOStream`] buffers application bytes destined for a set of
//! connections, cuts them into chunks once the buffer passes a threshold,
//! compresses each chunk when the codec and the link policy make it
//! worthwhile, and wraps every chunk into a packet through a
//! [`ChunkFramer`]. [`DataIStream`] reads the payload back from a sequence of
//! buckets supplied by a [`BucketSource`].
//!
//! ```text
//!  write() ──► buffer ──flush──► WireChunk ──framer──► packet ──► connections
//!                                                                  │
//!  read()  ◄── bucket ◄──payload()◄── WireChunk ◄── BucketSource ◄──┘
//! ```

mod chunk;
mod error;
mod framing;
mod istream;
mod ostream;

pub use chunk::{WireChunk, SEGMENT_COUNT_MAX};
pub use error::StreamError;
pub use framing::{read_frame, ConnectionSource, PlainFramer, FRAME_SIZE_MAX};
pub use istream::{BucketSource, DataIStream, VecSource};
pub use ostream::{ChunkFramer, DataOStream, DEFAULT_FLUSH_THRESHOLD};
