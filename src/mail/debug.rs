//! Reference implementation of a mail service, simply logging the
//! session flow and accepted mail to the console log.

use crate::mail::MailService;
use crate::smtp::{SessionContext, SmtpError};
use async_trait::async_trait;

/// Logs every hook and accepts all mail and all credentials. Use it to
/// watch a session unfold with `RUST_LOG=debug`; do not use it in
/// anything resembling production.
#[derive(Clone, Debug, Default)]
pub struct DebugMailService;

#[async_trait]
impl MailService for DebugMailService {
    async fn on_connect(&self, ctx: &mut SessionContext) {
        info!(
            "{} connected from {}:{}",
            ctx.info.id, ctx.info.remote_ip, ctx.info.remote_port
        );
    }

    async fn on_disconnect(&self, ctx: &mut SessionContext) {
        info!(
            "{} disconnected after {} recovered error(s)",
            ctx.info.id, ctx.info.exceptions
        );
    }

    async fn on_helo(&self, ctx: &mut SessionContext, helo: &str) -> Result<(), SmtpError> {
        debug!("{} greeted as {:?}", ctx.info.id, helo);
        Ok(())
    }

    async fn on_auth(
        &self,
        ctx: &mut SessionContext,
        authorization_id: &str,
        authentication_id: &str,
        _secret: &str,
    ) -> Result<Option<String>, SmtpError> {
        warn!(
            "{} accepting any credentials: authzid={:?} authcid={:?}",
            ctx.info.id, authorization_id, authentication_id
        );
        Ok(None)
    }

    async fn on_mail_from(
        &self,
        ctx: &mut SessionContext,
        from: &str,
    ) -> Result<Option<String>, SmtpError> {
        debug!("{} mail from {}", ctx.info.id, from);
        Ok(None)
    }

    async fn on_rcpt_to(
        &self,
        ctx: &mut SessionContext,
        to: &str,
    ) -> Result<Option<String>, SmtpError> {
        debug!("{} rcpt to {}", ctx.info.id, to);
        Ok(None)
    }

    async fn on_message(&self, ctx: &mut SessionContext) -> Result<(), SmtpError> {
        info!(
            "{} message from {} for {} recipient(s), {} bytes:\n{}",
            ctx.info.id,
            ctx.envelope.from,
            ctx.envelope.to.len(),
            ctx.message.bytesize,
            String::from_utf8_lossy(&ctx.message.data)
        );
        Ok(())
    }

    async fn on_unknown(&self, ctx: &mut SessionContext, line: &str) -> Result<(), SmtpError> {
        debug!("{} unknown command {:?}", ctx.info.id, line);
        Err(SmtpError::Syntax(line.to_owned()))
    }
}
