//! DATA reassembly: dot-stuffing removal, the headers/body split signal
//! and line-ending bookkeeping, per RFC 5321 section 4.5.2.

use crate::smtp::{CrlfMode, LineEnding, SmtpError, SmtpReply, SmtpSession};
use chrono::Utc;

impl SmtpSession {
    /// One framed body line, already stripped per the CRLF policy.
    pub(crate) async fn apply_data_line(&mut self, line: Vec<u8>, ending: LineEnding) {
        let service = self.service();
        if !self.data_started() {
            self.mark_data_started();
            service.on_data_start(&mut self.ctx).await;
        }

        if line == b"." {
            self.complete_message().await;
            return;
        }

        // a client dot-stuffs every body line starting with a period
        let line = if line.starts_with(b".") {
            &line[1..]
        } else {
            &line[..]
        };

        if !self.ctx.message.headers && line.is_empty() {
            self.ctx.message.headers = true;
            if let Err(e) = service.on_data_headers(&mut self.ctx).await {
                self.recover(e, SmtpReply::CommandSyntaxFailure);
                self.finish_transaction();
                return;
            }
        }

        self.ctx.message.data.extend_from_slice(line);
        match self.settings().crlf_mode {
            CrlfMode::Leave => {
                self.ctx.message.crlf = ending;
                self.ctx.message.data.extend_from_slice(ending.as_bytes());
            }
            CrlfMode::Ensure | CrlfMode::Strict => {
                self.ctx
                    .message
                    .data
                    .extend_from_slice(LineEnding::CrLf.as_bytes());
            }
        }

        if let Err(e) = service.on_data_line(&mut self.ctx).await {
            self.recover(e, SmtpReply::CommandSyntaxFailure);
            self.finish_transaction();
        }
    }

    /// The terminating dot arrived. Hand the message over and reset for
    /// the next transaction no matter how that goes.
    async fn complete_message(&mut self) {
        let data = &mut self.ctx.message.data;
        if data.ends_with(b"\r\n") {
            data.truncate(data.len() - 2);
        } else if data.ends_with(b"\n") {
            let len = data.len() - 1;
            data.truncate(len);
        }
        self.ctx.message.delivered = Some(Utc::now());
        self.ctx.message.bytesize = self.ctx.message.data.len();

        let service = self.service();
        match service.on_message(&mut self.ctx).await {
            Ok(()) => self.say_reply(SmtpReply::OkCompletedInfo),
            Err(e @ SmtpError::Reply(_, _)) => self.recover(e, SmtpReply::ProcessingError),
            Err(e) => self.recover(SmtpError::Failure(e.to_string()), SmtpReply::ProcessingError),
        }
        self.finish_transaction();
    }
}

#[cfg(test)]
mod tests {
    use crate::mail::NullMailService;
    use crate::smtp::{
        CrlfMode, DriverControl, SessionSettings, SmtpPhase, SmtpSession,
    };
    use std::sync::Arc;

    async fn in_data(settings: SessionSettings) -> SmtpSession {
        let mut session = SmtpSession::new(settings, Arc::new(NullMailService));
        session.ctx.info.local_host = "mx.example.org".to_owned();
        for line in [
            &b"EHLO client\r\n"[..],
            b"MAIL FROM:<a@x>\r\n",
            b"RCPT TO:<a@x>\r\n",
            b"DATA\r\n",
        ] {
            session.apply_line(line, false).await;
            session.pop_control();
        }
        assert_eq!(session.phase(), SmtpPhase::Data);
        session
    }

    fn reply_of(session: &mut SmtpSession) -> String {
        match session.pop_control() {
            Some(DriverControl::Response(bytes)) => String::from_utf8(bytes).unwrap(),
            otherwise => panic!("Expected a response, got {:?}", otherwise),
        }
    }

    #[test]
    fn dot_stuffing_is_removed() {
        async_std::task::block_on(async {
            let mut sut = in_data(SessionSettings::default()).await;
            sut.apply_line(b"..hello\r\n", false).await;
            assert_eq!(sut.ctx.message.data, b".hello\r\n".to_vec());
            sut.apply_line(b"...\r\n", false).await;
            assert_eq!(sut.ctx.message.data, b".hello\r\n..\r\n".to_vec());
        })
    }

    #[test]
    fn lone_dot_completes_and_resets() {
        async_std::task::block_on(async {
            let mut sut = in_data(SessionSettings::default()).await;
            sut.apply_line(b"Subject: hi\r\n", false).await;
            sut.apply_line(b"\r\n", false).await;
            sut.apply_line(b"body\r\n", false).await;
            sut.apply_line(b".\r\n", false).await;
            assert!(reply_of(&mut sut).starts_with("250 "));
            // message and envelope are gone, the session is idle again
            assert_eq!(sut.phase(), SmtpPhase::Idle);
            assert!(sut.ctx.message.data.is_empty());
            assert!(sut.ctx.envelope.from.is_empty());
        })
    }

    #[test]
    fn headers_flag_flips_on_the_separator_line() {
        async_std::task::block_on(async {
            let mut sut = in_data(SessionSettings::default()).await;
            sut.apply_line(b"Subject: hi\r\n", false).await;
            assert!(!sut.ctx.message.headers);
            sut.apply_line(b"\r\n", false).await;
            assert!(sut.ctx.message.headers);
        })
    }

    #[test]
    fn ensure_mode_normalizes_bare_newlines() {
        async_std::task::block_on(async {
            let mut sut = in_data(SessionSettings::default()).await;
            sut.apply_line(b"one\n", false).await;
            sut.apply_line(b"two\r\n", false).await;
            assert_eq!(sut.ctx.message.data, b"one\r\ntwo\r\n".to_vec());
        })
    }

    #[test]
    fn leave_mode_remembers_the_observed_terminator() {
        async_std::task::block_on(async {
            let mut settings = SessionSettings::default();
            settings.crlf_mode = CrlfMode::Leave;
            let mut sut = in_data(settings).await;
            sut.apply_line(b"one\r\n", false).await;
            assert_eq!(sut.ctx.message.crlf.as_bytes(), b"\r\n");
            sut.apply_line(b"two\n", false).await;
            assert_eq!(sut.ctx.message.crlf.as_bytes(), b"\n");
            assert_eq!(sut.ctx.message.data, b"one\r\ntwo\n".to_vec());
        })
    }

    #[test]
    fn body_keeps_terminators_until_completion() {
        async_std::task::block_on(async {
            let mut sut = in_data(SessionSettings::default()).await;
            sut.apply_line(b"hello\r\n", false).await;
            assert_eq!(sut.ctx.message.data, b"hello\r\n".to_vec());
            sut.apply_line(b".\r\n", false).await;
            assert!(reply_of(&mut sut).starts_with("250 "));
        })
    }
}
