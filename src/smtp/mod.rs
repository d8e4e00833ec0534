mod auth;
mod command;
mod context;
mod data;
mod error;
mod reply;
mod session;

pub use self::command::*;
pub use self::context::*;
pub use self::error::*;
pub use self::reply::*;
pub use self::session::*;

/// The explicit command-sequence token of a session. Which verbs are legal
/// depends solely on this phase; everything else lives in the context.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum SmtpPhase {
    /// Connected, HELO/EHLO not seen yet (also right after STARTTLS)
    Helo,
    /// Greeted and idle, ready for MAIL, AUTH or STARTTLS
    Idle,
    /// MAIL FROM accepted, waiting for recipients
    Mail,
    /// At least one RCPT TO accepted
    Rcpt,
    /// Receiving message body lines
    Data,
    /// `220 Ready to start TLS` sent, handshake pending
    StartTls,
    /// `AUTH PLAIN` sent without an initial response
    AuthPlainValues,
    /// `AUTH LOGIN` username challenge outstanding
    AuthLoginUser,
    /// `AUTH LOGIN` password challenge outstanding
    AuthLoginPass,
    /// QUIT received, terminal
    Quit,
}

/// Instructions for the connection driver, queued by the session engine.
pub enum DriverControl {
    /// Write an SMTP reply
    Response(Vec<u8>),
    /// Flush, then hand the stream to the TLS transport
    StartTls,
    /// Shut the stream down
    Shutdown,
}

impl std::fmt::Debug for DriverControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverControl::Response(r) => f
                .debug_tuple("Response")
                .field(&String::from_utf8_lossy(r))
                .finish(),
            DriverControl::StartTls => f.debug_tuple("StartTls").finish(),
            DriverControl::Shutdown => f.debug_tuple("Shutdown").finish(),
        }
    }
}
