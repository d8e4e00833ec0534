mod rustls;

pub use self::rustls::*;

use crate::io::Io;
use std::future::Future;
use std::pin::Pin;

pub type TlsUpgradeFut = Pin<Box<dyn Future<Output = std::io::Result<Box<dyn Io>>> + Send>>;

/// Performs the server-side handshake on an accepted stream. On success
/// the returned stream replaces the raw one for the rest of the session.
pub trait TlsUpgrade: Send + Sync {
    fn upgrade_to_tls(&self, stream: Box<dyn Io>) -> TlsUpgradeFut;
}
