mod debug;

pub use self::debug::*;

use crate::smtp::{SessionContext, SmtpError};
use async_trait::async_trait;

/// The contract between the server and the host program.
///
/// Every hook has a default, so a service implements only what it cares
/// about. The two exceptions to the no-op rule: [`on_auth`](MailService::on_auth)
/// denies everyone and [`on_unknown`](MailService::on_unknown) rejects the
/// line with a 500 - both must be overridden deliberately.
///
/// Hooks run inside the session task. An `Err` return is recovered into an
/// SMTP reply ([`SmtpError::Reply`] verbatim, anything else 500 - or 451
/// while a message is being completed), counted on
/// [`SessionInfo::exceptions`](crate::smtp::SessionInfo) and recorded on
/// the context for post-mortem inspection.
#[async_trait]
pub trait MailService: Send + Sync {
    /// Logging events of the session engine. Defaults to the `log` facade.
    fn on_log(&self, ctx: Option<&SessionContext>, level: log::Level, message: &str) {
        match ctx {
            Some(ctx) => log::log!(level, "{} {}", ctx.info.id, message),
            None => log::log!(level, "{}", message),
        }
    }

    /// The client connected. May mutate `local_response` / `helo_response`.
    async fn on_connect(&self, _ctx: &mut SessionContext) {}

    /// The session ended, on every exit path, exactly once.
    async fn on_disconnect(&self, _ctx: &mut SessionContext) {}

    /// HELO/EHLO was accepted. May mutate `helo_response`.
    async fn on_helo(&self, _ctx: &mut SessionContext, _helo: &str) -> Result<(), SmtpError> {
        Ok(())
    }

    /// Verify credentials. Return an authorization id to override the one
    /// the client announced, `None` to keep it.
    async fn on_auth(
        &self,
        _ctx: &mut SessionContext,
        _authorization_id: &str,
        _authentication_id: &str,
        _secret: &str,
    ) -> Result<Option<String>, SmtpError> {
        Err(SmtpError::AuthFailed)
    }

    /// MAIL FROM was accepted. Return an address to override what gets
    /// recorded on the envelope, `None` to keep the client's argument.
    async fn on_mail_from(
        &self,
        _ctx: &mut SessionContext,
        _from: &str,
    ) -> Result<Option<String>, SmtpError> {
        Ok(None)
    }

    /// RCPT TO was accepted. Same override contract as `on_mail_from`.
    async fn on_rcpt_to(
        &self,
        _ctx: &mut SessionContext,
        _to: &str,
    ) -> Result<Option<String>, SmtpError> {
        Ok(None)
    }

    /// The first body line is about to be processed.
    async fn on_data_start(&self, _ctx: &mut SessionContext) {}

    /// The empty separator line was seen; headers are complete.
    async fn on_data_headers(&self, _ctx: &mut SessionContext) -> Result<(), SmtpError> {
        Ok(())
    }

    /// A body line was appended. An `Err` aborts the transfer.
    async fn on_data_line(&self, _ctx: &mut SessionContext) -> Result<(), SmtpError> {
        Ok(())
    }

    /// The terminating dot arrived; `ctx.message` holds the complete body.
    /// This is the acceptance decision - an `Err` rejects the message.
    async fn on_message(&self, _ctx: &mut SessionContext) -> Result<(), SmtpError> {
        Ok(())
    }

    /// A line matched no known verb. The default rejects it.
    async fn on_unknown(&self, _ctx: &mut SessionContext, line: &str) -> Result<(), SmtpError> {
        Err(SmtpError::Syntax(line.to_owned()))
    }
}

/// Accepts everything and does nothing. AUTH still denies everyone.
#[derive(Clone, Debug, Default)]
pub struct NullMailService;

#[async_trait]
impl MailService for NullMailService {}
