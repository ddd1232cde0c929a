pub mod client;
pub mod codec;
pub mod serial_link;

pub use client::{read_chunked, ChunkedReadOptions, RomIdentity, SSM2Client, Ssm2Error, MAX_MULTI_READ_ADDRS};
pub use serial_link::SerialLink;
