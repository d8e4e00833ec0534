use crate::common::*;
use crate::mail::MailService;
use crate::smtp::{
    AuthMechanism, DriverControl, LineEnding, SessionContext, SmtpCommand, SmtpError, SmtpPhase,
    SmtpReply, Utf8Encoding,
};
use chrono::Utc;
use std::collections::VecDeque;

/// Input line terminator policy.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum CrlfMode {
    /// Strip every CR and LF from input; body lines are stored with CRLF
    Ensure,
    /// Accept CRLF and bare LF, remember what the client used in the body
    Leave,
    /// Demand exactly CRLF and no stray CR; violations get a 500
    Strict,
}

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum AuthMode {
    Forbidden,
    Optional,
    Required,
}

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum EncryptMode {
    Forbidden,
    Optional,
    Required,
}

/// The slice of the server configuration the session engine acts on.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub crlf_mode: CrlfMode,
    pub auth_mode: AuthMode,
    pub encrypt_mode: EncryptMode,
    pub pipelining: bool,
    pub internationalization: bool,
    /// A TLS upgrade is actually configured on the server
    pub tls_available: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            crlf_mode: CrlfMode::Ensure,
            auth_mode: AuthMode::Forbidden,
            encrypt_mode: EncryptMode::Forbidden,
            pipelining: false,
            internationalization: false,
            tls_available: false,
        }
    }
}

/// Username kept between the AUTH LOGIN challenges.
#[derive(Debug, Clone, Default)]
pub(crate) struct AuthScratch {
    pub authorization_id: String,
    pub authentication_id: String,
}

/// The per-connection SMTP engine.
///
/// Feed it one framed input line at a time through [`apply_line`] and
/// drain the queued [`DriverControl`]s after each call. The engine never
/// touches the socket itself - the connection driver owns all IO, which
/// is what makes the whole state machine testable without a network.
///
/// [`apply_line`]: SmtpSession::apply_line
pub struct SmtpSession {
    service: Arc<dyn MailService>,
    settings: SessionSettings,
    pub ctx: SessionContext,
    phase: SmtpPhase,
    auth: AuthScratch,
    data_started: bool,
    writes: VecDeque<DriverControl>,
}

impl SmtpSession {
    pub fn new(settings: SessionSettings, service: Arc<dyn MailService>) -> Self {
        let mut ctx = SessionContext::default();
        ctx.info.id = crate::common::time_based_id();
        SmtpSession {
            service,
            settings,
            ctx,
            phase: SmtpPhase::Helo,
            auth: AuthScratch::default(),
            data_started: false,
            writes: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> SmtpPhase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: SmtpPhase) {
        self.phase = phase;
    }

    pub fn pop_control(&mut self) -> Option<DriverControl> {
        self.writes.pop_front()
    }

    /// The connection is established and the context endpoints are filled
    /// in. Greets the client.
    pub async fn connect(&mut self) {
        self.ctx.info.connected = Some(Utc::now());
        if self.ctx.info.local_response.is_empty() {
            self.ctx.info.local_response =
                format!("{} postak service ready", self.ctx.info.local_host);
        }
        if self.ctx.info.helo_response.is_empty() {
            self.ctx.info.helo_response = self.ctx.info.local_host.clone();
        }
        self.service.on_connect(&mut self.ctx).await;
        self.service.on_log(
            Some(&self.ctx),
            log::Level::Debug,
            &format!(
                "session open from {}:{}",
                self.ctx.info.remote_ip, self.ctx.info.remote_port
            ),
        );
        let greeting = self.ctx.info.local_response.clone();
        self.say_reply(SmtpReply::ServiceReadyInfo(greeting));
    }

    /// Runs on every exit path, exactly once per session.
    pub async fn disconnect(&mut self) {
        self.service.on_disconnect(&mut self.ctx).await;
        self.service
            .on_log(Some(&self.ctx), log::Level::Debug, "session closed");
    }

    /// The TLS handshake succeeded and the raw stream was replaced. The
    /// client must introduce itself again; whatever it sent in plaintext
    /// is forgotten.
    pub fn tls_done(&mut self) {
        self.ctx.info.encrypted = Some(Utc::now());
        self.ctx.info.helo.clear();
        self.clear_authentication();
        self.ctx.reset_transaction();
        self.data_started = false;
        self.phase = SmtpPhase::Helo;
    }

    /// Applies one framed line. `pipelined` is true when this line was
    /// already buffered while the previous one was still being processed.
    pub async fn apply_line(&mut self, raw: &[u8], pipelined: bool) {
        if self.phase == SmtpPhase::Quit {
            return;
        }
        let (line, ending) = match self.check_line_ending(raw) {
            Ok(parts) => parts,
            Err(e) => {
                self.recover(e, SmtpReply::LineEndingFailure);
                return;
            }
        };
        if self.phase == SmtpPhase::Data {
            self.apply_data_line(line, ending).await;
            return;
        }
        if pipelined && !self.settings.pipelining {
            let e = SmtpError::Syntax("pipelined input".to_owned());
            self.ctx.record_error(&e);
            self.say_reply(SmtpReply::PipeliningFailure);
            return;
        }
        let text = String::from_utf8_lossy(&line).into_owned();
        match self.phase {
            SmtpPhase::AuthPlainValues | SmtpPhase::AuthLoginUser | SmtpPhase::AuthLoginPass => {
                self.apply_auth_step(text).await
            }
            _ => self.apply_command(text).await,
        }
    }

    async fn apply_command(&mut self, text: String) {
        use SmtpCommand as C;
        match SmtpCommand::parse(&text) {
            C::Noop => self.say_ok(),
            C::Quit => self.apply_quit(),
            C::Helo(host) => self.apply_helo(host, false).await,
            C::Ehlo(host) => self.apply_helo(host, true).await,
            C::StartTls => self.apply_starttls(),
            C::Rset => self.apply_rset(),
            C::Auth { mechanism, initial } => self.apply_auth(mechanism, initial).await,
            C::Mail(arg) => self.apply_mail(arg).await,
            C::Rcpt(arg) => self.apply_rcpt(arg).await,
            C::Data => self.apply_data(),
            C::Unknown(line) => self.apply_unknown(line).await,
        }
    }

    async fn apply_helo(&mut self, host: String, extended: bool) {
        if self.phase != SmtpPhase::Helo {
            self.recover(SmtpError::BadSequence, SmtpReply::CommandSequenceFailure);
            return;
        }
        if host.is_empty() {
            self.recover(
                SmtpError::ParamSyntax("missing domain".to_owned()),
                SmtpReply::ParameterSyntaxFailure,
            );
            return;
        }
        self.ctx.info.helo = host.clone();
        if let Err(e) = self.service.on_helo(&mut self.ctx, &host).await {
            self.ctx.info.helo.clear();
            self.recover(e, SmtpReply::CommandSyntaxFailure);
            return;
        }
        self.clear_authentication();
        self.ctx.reset_transaction();
        self.phase = SmtpPhase::Idle;
        let response = self.ctx.info.helo_response.clone();
        if extended {
            self.say_reply(SmtpReply::OkEhloInfo {
                response,
                extensions: self.ehlo_extensions(),
            });
        } else {
            self.say_reply(SmtpReply::OkHeloInfo(response));
        }
    }

    fn ehlo_extensions(&self) -> Vec<String> {
        let mut extensions = Vec::new();
        if self.settings.internationalization {
            extensions.push("8BITMIME".to_owned());
            extensions.push("SMTPUTF8".to_owned());
        }
        if self.settings.pipelining {
            extensions.push("PIPELINING".to_owned());
        }
        if self.settings.auth_mode != AuthMode::Forbidden {
            extensions.push("AUTH LOGIN PLAIN".to_owned());
        }
        // you cannot STARTTLS twice, advertise only before first use
        if self.settings.encrypt_mode != EncryptMode::Forbidden
            && self.settings.tls_available
            && self.ctx.info.encrypted.is_none()
        {
            extensions.push("STARTTLS".to_owned());
        }
        extensions
    }

    fn apply_starttls(&mut self) {
        if self.phase == SmtpPhase::Helo || self.ctx.info.encrypted.is_some() {
            self.recover(SmtpError::BadSequence, SmtpReply::CommandSequenceFailure);
            return;
        }
        if self.settings.encrypt_mode == EncryptMode::Forbidden || !self.settings.tls_available {
            let e = SmtpError::Tls("no TLS upgrade configured".to_owned());
            self.ctx.record_error(&e);
            self.say_reply(SmtpReply::TlsNotAvailableError);
            return;
        }
        self.phase = SmtpPhase::StartTls;
        self.say_reply(SmtpReply::TlsReadyInfo);
        self.say(DriverControl::StartTls);
    }

    fn apply_rset(&mut self) {
        if self.phase == SmtpPhase::Helo {
            self.recover(SmtpError::BadSequence, SmtpReply::CommandSequenceFailure);
            return;
        }
        if let Err(e) = self.check_tls_gate() {
            self.recover(e, SmtpReply::TlsRequiredFailure);
            return;
        }
        self.clear_authentication();
        self.ctx.reset_transaction();
        self.data_started = false;
        self.phase = SmtpPhase::Idle;
        self.say_ok();
    }

    fn apply_quit(&mut self) {
        self.phase = SmtpPhase::Quit;
        let domain = self.ctx.info.local_host.clone();
        self.say_shutdown(SmtpReply::ClosingConnectionInfo(domain));
    }

    async fn apply_auth(&mut self, mechanism: AuthMechanism, initial: Option<String>) {
        if let Err(e) = self.check_tls_gate() {
            self.recover(e, SmtpReply::TlsRequiredFailure);
            return;
        }
        if self.settings.auth_mode == AuthMode::Forbidden {
            self.recover(
                SmtpError::Syntax("AUTH".to_owned()),
                SmtpReply::CommandSyntaxFailure,
            );
            return;
        }
        if self.phase != SmtpPhase::Idle || self.ctx.info.authenticated.is_some() {
            self.recover(SmtpError::BadSequence, SmtpReply::CommandSequenceFailure);
            return;
        }
        self.start_auth(mechanism, initial).await;
    }

    async fn apply_mail(&mut self, arg: String) {
        if let Err(e) = self.check_gates(SmtpPhase::Idle) {
            self.recover(e, SmtpReply::CommandSequenceFailure);
            return;
        }
        let (from, body, utf8) = match self.parse_mail_parameters(&arg) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.recover(e, SmtpReply::ParameterSyntaxFailure);
                return;
            }
        };
        self.ctx.envelope.encoding_body = body;
        self.ctx.envelope.encoding_utf8 = utf8;
        match self.service.on_mail_from(&mut self.ctx, &from).await {
            Ok(replacement) => {
                self.ctx.envelope.from = replacement.unwrap_or(from);
                self.phase = SmtpPhase::Mail;
                self.say_ok();
            }
            Err(e) => {
                self.ctx.envelope.encoding_body = Default::default();
                self.ctx.envelope.encoding_utf8 = Default::default();
                self.recover(e, SmtpReply::CommandSyntaxFailure);
            }
        }
    }

    fn parse_mail_parameters(
        &self,
        arg: &str,
    ) -> crate::common::Result<(String, crate::smtp::BodyEncoding, Utf8Encoding)> {
        use crate::smtp::BodyEncoding;
        let mut address = Vec::new();
        let mut body = BodyEncoding::Unspecified;
        let mut utf8 = Utf8Encoding::Unspecified;
        for token in arg.split_whitespace() {
            let upper = token.to_ascii_uppercase();
            if upper == "BODY=7BIT" || upper == "BODY=8BITMIME" {
                if !self.settings.internationalization {
                    return Err(SmtpError::ParamSyntax(token.to_owned()));
                }
                body = if upper == "BODY=7BIT" {
                    BodyEncoding::SevenBit
                } else {
                    BodyEncoding::EightBitMime
                };
            } else if upper.starts_with("BODY=") {
                return Err(SmtpError::ParamSyntax(token.to_owned()));
            } else if upper == "SMTPUTF8" {
                if !self.settings.internationalization {
                    return Err(SmtpError::ParamSyntax(token.to_owned()));
                }
                utf8 = Utf8Encoding::Utf8;
            } else {
                address.push(token);
            }
        }
        Ok((address.join(" "), body, utf8))
    }

    async fn apply_rcpt(&mut self, arg: String) {
        if let Err(e) = self.check_gates(SmtpPhase::Mail) {
            match (e, self.phase) {
                // a second and further RCPT is fine
                (SmtpError::BadSequence, SmtpPhase::Rcpt) => {}
                (e, _) => {
                    self.recover(e, SmtpReply::CommandSequenceFailure);
                    return;
                }
            }
        }
        if arg.is_empty() {
            self.recover(
                SmtpError::ParamSyntax("missing forward-path".to_owned()),
                SmtpReply::ParameterSyntaxFailure,
            );
            return;
        }
        match self.service.on_rcpt_to(&mut self.ctx, &arg).await {
            Ok(replacement) => {
                self.ctx.envelope.to.push(replacement.unwrap_or(arg));
                self.phase = SmtpPhase::Rcpt;
                self.say_ok();
            }
            Err(e) => self.recover(e, SmtpReply::CommandSyntaxFailure),
        }
    }

    fn apply_data(&mut self) {
        if let Err(e) = self.check_gates(SmtpPhase::Rcpt) {
            self.recover(e, SmtpReply::CommandSequenceFailure);
            return;
        }
        self.phase = SmtpPhase::Data;
        self.data_started = false;
        self.ctx.message.received = Some(Utc::now());
        self.say_reply(SmtpReply::StartMailInputChallenge);
    }

    async fn apply_unknown(&mut self, line: String) {
        match self.service.on_unknown(&mut self.ctx, &line).await {
            // the host consumed the line; it owes the client nothing
            Ok(()) => {}
            Err(e) => self.recover(e, SmtpReply::CommandSyntaxFailure),
        }
    }

    /// Sequencing and gating shared by MAIL, RCPT and DATA: HELO first,
    /// then the encryption gate, then the authentication gate, then the
    /// phase the verb demands.
    fn check_gates(&self, wanted: SmtpPhase) -> crate::common::Result<()> {
        if self.phase == SmtpPhase::Helo {
            return Err(SmtpError::BadSequence);
        }
        self.check_tls_gate()?;
        if self.settings.auth_mode == AuthMode::Required && self.ctx.info.authenticated.is_none() {
            return Err(SmtpError::AuthRequired);
        }
        if self.phase != wanted {
            return Err(SmtpError::BadSequence);
        }
        Ok(())
    }

    fn check_tls_gate(&self) -> crate::common::Result<()> {
        if self.settings.encrypt_mode == EncryptMode::Required
            && self.ctx.info.encrypted.is_none()
        {
            return Err(SmtpError::TlsRequired);
        }
        Ok(())
    }

    fn check_line_ending(&mut self, raw: &[u8]) -> crate::common::Result<(Vec<u8>, LineEnding)> {
        match self.settings.crlf_mode {
            CrlfMode::Ensure => {
                let line = raw
                    .iter()
                    .copied()
                    .filter(|b| *b != b'\r' && *b != b'\n')
                    .collect();
                Ok((line, LineEnding::CrLf))
            }
            CrlfMode::Leave => {
                let (line, ending) = if raw.ends_with(b"\r\n") {
                    (&raw[..raw.len() - 2], LineEnding::CrLf)
                } else if raw.ends_with(b"\n") {
                    (&raw[..raw.len() - 1], LineEnding::Lf)
                } else {
                    (raw, LineEnding::CrLf)
                };
                Ok((line.to_vec(), ending))
            }
            CrlfMode::Strict => {
                if !raw.ends_with(b"\r\n") {
                    return Err(SmtpError::Syntax("line must end with CRLF".to_owned()));
                }
                let line = &raw[..raw.len() - 2];
                if line.contains(&b'\r') {
                    return Err(SmtpError::Syntax("stray CR in line".to_owned()));
                }
                Ok((line.to_vec(), LineEnding::CrLf))
            }
        }
    }

    pub(crate) fn clear_authentication(&mut self) {
        self.ctx.info.authenticated = None;
        self.ctx.info.authorization_id.clear();
        self.ctx.info.authentication_id.clear();
        self.auth = AuthScratch::default();
    }

    pub(crate) fn auth_scratch_mut(&mut self) -> &mut AuthScratch {
        &mut self.auth
    }

    pub(crate) fn take_auth_scratch(&mut self) -> AuthScratch {
        std::mem::take(&mut self.auth)
    }

    pub(crate) fn service(&self) -> Arc<dyn MailService> {
        self.service.clone()
    }

    pub(crate) fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub(crate) fn data_started(&self) -> bool {
        self.data_started
    }

    pub(crate) fn mark_data_started(&mut self) {
        self.data_started = true;
    }

    pub(crate) fn finish_transaction(&mut self) {
        self.ctx.reset_transaction();
        self.data_started = false;
        self.phase = SmtpPhase::Idle;
    }

    /// Recover a handler error into a reply. A 421 additionally shuts the
    /// session down, everything else lets it continue.
    pub(crate) fn recover(&mut self, e: SmtpError, fallback: SmtpReply) {
        let reply = e.reply(fallback);
        self.service.on_log(
            Some(&self.ctx),
            log::Level::Warn,
            &format!("recovered into {}: {}", reply.code(), e),
        );
        self.ctx.record_error(&e);
        if reply.code() == 421 {
            self.say_shutdown(reply);
        } else {
            self.say_reply(reply);
        }
    }
}

/// Reply helpers. Queue output for the driver, never touch the wire.
impl SmtpSession {
    pub(crate) fn say(&mut self, what: DriverControl) {
        self.writes.push_back(what);
    }
    pub(crate) fn say_reply(&mut self, reply: SmtpReply) {
        self.say(DriverControl::Response(reply.to_string().into_bytes()));
    }
    pub(crate) fn say_ok(&mut self) {
        self.say_reply(SmtpReply::OkInfo);
    }
    /// Reply and shut the session down
    pub(crate) fn say_shutdown(&mut self, reply: SmtpReply) {
        self.say_reply(reply);
        self.say(DriverControl::Shutdown);
    }
    /// "421, closing transmission channel" after the idle deadline
    pub fn say_shutdown_timeout(&mut self) {
        let e = SmtpError::CmdTimeout;
        self.ctx.record_error(&e);
        self.say_shutdown(e.reply(SmtpReply::CommandSyntaxFailure));
    }
    /// "500 Line too long" when the input buffer cap is hit
    pub fn say_shutdown_overrun(&mut self) {
        let e = SmtpError::BufferOverrun;
        self.ctx.record_error(&e);
        self.say_shutdown(e.reply(SmtpReply::CommandSyntaxFailure));
    }
}
