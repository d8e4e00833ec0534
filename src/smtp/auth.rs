//! AUTH sub-dialogs: PLAIN in one or two steps, LOGIN with one or two
//! challenges. Credential verification is entirely the host's business,
//! this module only shepherds base64 blobs back and forth.

use crate::smtp::{AuthMechanism, SmtpError, SmtpPhase, SmtpReply, SmtpSession};
use chrono::Utc;

impl SmtpSession {
    pub(crate) async fn start_auth(&mut self, mechanism: AuthMechanism, initial: Option<String>) {
        match (mechanism, initial) {
            (AuthMechanism::Plain, Some(blob)) => match decode_plain(&blob) {
                Ok((authz, authn, secret)) => self.verify_credentials(authz, authn, secret).await,
                Err(e) => self.fail_auth_dialog(e),
            },
            (AuthMechanism::Plain, None) => {
                // bare challenge: code, space, nothing else
                self.say_reply(SmtpReply::AuthChallenge(String::new()));
                self.set_phase(SmtpPhase::AuthPlainValues);
            }
            (AuthMechanism::Login, Some(user)) => match decode(&user) {
                Ok(authn) => {
                    self.auth_scratch_mut().authentication_id = authn;
                    self.say_reply(SmtpReply::AuthChallenge(base64::encode("Password:")));
                    self.set_phase(SmtpPhase::AuthLoginPass);
                }
                Err(e) => self.fail_auth_dialog(e),
            },
            (AuthMechanism::Login, None) => {
                self.say_reply(SmtpReply::AuthChallenge(base64::encode("Username:")));
                self.set_phase(SmtpPhase::AuthLoginUser);
            }
        }
    }

    /// A continuation line inside an AUTH sub-dialog.
    pub(crate) async fn apply_auth_step(&mut self, line: String) {
        match self.phase() {
            SmtpPhase::AuthPlainValues => match decode_plain(line.trim()) {
                Ok((authz, authn, secret)) => self.verify_credentials(authz, authn, secret).await,
                Err(e) => self.fail_auth_dialog(e),
            },
            SmtpPhase::AuthLoginUser => match decode(line.trim()) {
                Ok(authn) => {
                    self.auth_scratch_mut().authentication_id = authn;
                    self.say_reply(SmtpReply::AuthChallenge(base64::encode("Password:")));
                    self.set_phase(SmtpPhase::AuthLoginPass);
                }
                Err(e) => self.fail_auth_dialog(e),
            },
            SmtpPhase::AuthLoginPass => match decode(line.trim()) {
                Ok(secret) => {
                    let scratch = self.take_auth_scratch();
                    self.verify_credentials(
                        scratch.authorization_id,
                        scratch.authentication_id,
                        secret,
                    )
                    .await
                }
                Err(e) => self.fail_auth_dialog(e),
            },
            phase => unreachable!("auth step in phase {:?}", phase),
        }
    }

    /// Delegate to the host. Whatever happens, the sub-dialog is over:
    /// scratch is dropped and the session returns to idle.
    async fn verify_credentials(&mut self, authz: String, authn: String, secret: String) {
        let service = self.service();
        match service
            .on_auth(&mut self.ctx, &authz, &authn, &secret)
            .await
        {
            Ok(replacement) => {
                self.ctx.info.authorization_id = replacement.unwrap_or_else(|| {
                    if authz.is_empty() {
                        authn.clone()
                    } else {
                        authz.clone()
                    }
                });
                self.ctx.info.authentication_id = authn;
                self.ctx.info.authenticated = Some(Utc::now());
                self.say_reply(SmtpReply::AuthSuccessInfo);
            }
            Err(e) => {
                // whatever the host raised, the client learns only 535
                self.service().on_log(
                    Some(&self.ctx),
                    log::Level::Warn,
                    &format!("authentication failed: {}", e),
                );
                self.ctx.record_error(&e);
                self.say_reply(SmtpReply::AuthFailure);
            }
        }
        self.take_auth_scratch();
        self.set_phase(SmtpPhase::Idle);
    }

    fn fail_auth_dialog(&mut self, e: SmtpError) {
        self.take_auth_scratch();
        self.set_phase(SmtpPhase::Idle);
        self.recover(e, SmtpReply::CommandSyntaxFailure);
    }
}

fn decode(blob: &str) -> Result<String, SmtpError> {
    let bytes =
        base64::decode(blob).map_err(|e| SmtpError::Syntax(format!("bad base64: {}", e)))?;
    String::from_utf8(bytes).map_err(|_| SmtpError::Syntax("bad utf-8 in base64".to_owned()))
}

/// RFC 4616 PLAIN: authorization-id NUL authentication-id NUL password.
/// Exactly three fields; a two-token payload is refused.
fn decode_plain(blob: &str) -> Result<(String, String, String), SmtpError> {
    let decoded = decode(blob)?;
    let fields: Vec<&str> = decoded.split('\0').collect();
    if fields.len() != 3 {
        return Err(SmtpError::Syntax(format!(
            "AUTH PLAIN expects 3 fields, got {}",
            fields.len()
        )));
    }
    Ok((
        fields[0].to_owned(),
        fields[1].to_owned(),
        fields[2].to_owned(),
    ))
}
