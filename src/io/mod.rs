mod framer;
pub mod tls;

pub use self::framer::*;

use crate::common::*;

/// Anything a session can read from and write to. The TLS upgrade swaps
/// one `Box<dyn Io>` for another, the rest of the engine does not care.
pub trait Io: Read + Write + Send + Sync + Unpin {}
impl<T> Io for T where T: Read + Write + Send + Sync + Unpin {}
