// shardpipe-common - Shared slot hashing and RESP2 framing for shardpipe
//
// The client and the development node both speak RESP2 and both need to agree
// on which hash slot a key belongs to, so those two pieces live here.

pub mod resp;
pub mod slot;

// Re-export for convenience
pub use resp::*;
pub use slot::*;
