//! Reader and writer for the FFM ring-buffered live feed format.
//!
//! An FFM feed is a self-describing container carrying a continuous A/V
//! stream from a single producer to any number of readers over a shared,
//! append-only, wrap-around file. The producer appends fixed-size packets;
//! once a configured maximum size is reached the file becomes a ring and the
//! oldest packets are overwritten in place. Readers coordinate with the
//! producer purely through the bytes of the file and the write index stored
//! in its header, so a feed can be read while it is still being written.

pub mod codec;
pub mod error;
pub mod frame;
pub mod header;
pub mod packet;
pub mod reader;
pub mod seek;
pub mod writer;

pub use error::{FeedError, Result};
pub use frame::Frame;
pub use reader::{FeedReader, ReaderOptions};
pub use seek::SeekMode;
pub use writer::{FeedWriter, WriterOptions};
