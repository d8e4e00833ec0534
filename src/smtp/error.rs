use crate::smtp::SmtpReply;
use thiserror::Error;

/// Everything that can go wrong while serving an SMTP session.
///
/// Protocol violations map to a specific SMTP reply through [`SmtpError::reply`]
/// and the session usually continues. Transport conditions (`Io`,
/// `Disconnected`), the framer limits (`CmdTimeout`, `BufferOverrun`) and
/// `Stopping` end the session. `Stopping` is a shutdown signal, not a fault,
/// and is never logged as an error.
#[derive(Error, Debug)]
pub enum SmtpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by peer")]
    Disconnected,

    #[error("command timeout expired")]
    CmdTimeout,

    #[error("input buffer limit exceeded without a line break")]
    BufferOverrun,

    #[error("service is shutting down")]
    Stopping,

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("bad sequence of commands")]
    BadSequence,

    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("syntax error in parameters: {0}")]
    ParamSyntax(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("encryption required")]
    TlsRequired,

    #[error("authentication credentials invalid")]
    AuthFailed,

    #[error("{1}")]
    Reply(u16, String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Failure(String),
}

impl SmtpError {
    /// A host-specified SMTP reply, e.g. `SmtpError::custom(552, "too big")`.
    pub fn custom(code: u16, text: impl Into<String>) -> Self {
        SmtpError::Reply(code, text.into())
    }

    /// The reply this error produces when it is recovered inside a command
    /// handler. `fallback` is used for conditions without a protocol
    /// meaning of their own - 500 during command handling, 451 once a
    /// message body is being completed.
    pub fn reply(&self, fallback: SmtpReply) -> SmtpReply {
        use SmtpError::*;
        match self {
            BadSequence => SmtpReply::CommandSequenceFailure,
            Syntax(_) => SmtpReply::CommandSyntaxFailure,
            ParamSyntax(_) => SmtpReply::ParameterSyntaxFailure,
            AuthRequired => SmtpReply::AuthRequiredFailure,
            TlsRequired => SmtpReply::TlsRequiredFailure,
            AuthFailed => SmtpReply::AuthFailure,
            CmdTimeout => SmtpReply::ServiceTimeoutError,
            BufferOverrun => SmtpReply::LineLengthFailure,
            Reply(code, text) => SmtpReply::Custom(*code, text.clone()),
            _ => fallback,
        }
    }

    /// Shutdown signals pass through the session loop without a farewell
    /// and without an error log.
    pub fn is_shutdown_signal(&self) -> bool {
        matches!(self, SmtpError::Stopping)
    }
}
