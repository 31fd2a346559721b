//! fragfs: a FUSE filesystem that fragments files into fixed-size
//! chunks, ships each chunk to a size-capped remote blob store, and
//! catalogues file/chunk metadata in a strongly-consistent key-value
//! store so the tree can be reconstituted from scratch on any host.

pub mod catalog;
pub mod chunk;
pub mod chunked_file;
pub mod config;
pub mod directory;
pub mod error;
pub mod evictor;
pub mod mountpoint;
pub mod remote;
pub mod sync;
pub mod write_streamer;
