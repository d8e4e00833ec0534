//! Protocol-level tests: the session engine driven line by line without
//! a network, watching replies, state transitions and the context handed
//! to the mail service.

use async_std::channel::{unbounded, Receiver, Sender};
use async_std::task::block_on;
use async_trait::async_trait;
use postak::mail::MailService;
use postak::smtp::{
    AuthMode, CrlfMode, DriverControl, SessionContext, SessionSettings, SmtpError, SmtpPhase,
    SmtpSession,
};
use std::sync::Arc;

/// Hands every accepted message context to the test over a channel.
#[derive(Debug)]
struct CapturingService {
    accepted: Sender<SessionContext>,
}

#[async_trait]
impl MailService for CapturingService {
    async fn on_auth(
        &self,
        _ctx: &mut SessionContext,
        _authorization_id: &str,
        _authentication_id: &str,
        secret: &str,
    ) -> Result<Option<String>, SmtpError> {
        if secret == "pw" {
            Ok(None)
        } else {
            Err(SmtpError::AuthFailed)
        }
    }

    async fn on_message(&self, ctx: &mut SessionContext) -> Result<(), SmtpError> {
        self.accepted
            .try_send(ctx.clone())
            .map_err(|e| SmtpError::Failure(e.to_string()))
    }
}

fn capturing_session(settings: SessionSettings) -> (SmtpSession, Receiver<SessionContext>) {
    let (tx, rx) = unbounded();
    let mut session = SmtpSession::new(settings, Arc::new(CapturingService { accepted: tx }));
    session.ctx.info.local_host = "mx.example.org".to_owned();
    (session, rx)
}

async fn reply(session: &mut SmtpSession) -> String {
    match session.pop_control() {
        Some(DriverControl::Response(bytes)) => String::from_utf8(bytes).unwrap(),
        otherwise => panic!("Expected a response, got {:?}", otherwise),
    }
}

async fn dialog(session: &mut SmtpSession, lines: &[(&str, &str)]) {
    for (send, expect) in lines {
        session
            .apply_line(format!("{}\r\n", send).as_bytes(), false)
            .await;
        let got = reply(session).await;
        assert!(
            got.starts_with(expect),
            "sent {:?}, expected a reply starting with {:?}, got {:?}",
            send,
            expect,
            got
        );
    }
}

#[test]
fn sequencing_violations_get_503() {
    block_on(async {
        // every verb issued in a state it does not belong to
        let cases: &[&[(&str, &str)]] = &[
            &[("MAIL FROM:<a@x>", "503")],
            &[("RCPT TO:<b@y>", "503")],
            &[("DATA", "503")],
            &[("RSET", "503")],
            &[("STARTTLS", "503")],
            &[("EHLO c", "250"), ("RCPT TO:<b@y>", "503")],
            &[("EHLO c", "250"), ("DATA", "503")],
            &[("EHLO c", "250"), ("MAIL FROM:<a@x>", "250"), ("DATA", "503")],
            &[
                ("EHLO c", "250"),
                ("MAIL FROM:<a@x>", "250"),
                ("MAIL FROM:<a@x>", "503"),
            ],
            &[("EHLO c", "250"), ("EHLO c", "503")],
        ];
        for case in cases {
            let (mut session, _rx) = capturing_session(SessionSettings::default());
            dialog(&mut session, case).await;
        }
    })
}

#[test]
fn noop_and_quit_are_welcome_any_time() {
    block_on(async {
        let (mut session, _rx) = capturing_session(SessionSettings::default());
        dialog(&mut session, &[("NOOP", "250"), ("QUIT", "221")]).await;
    })
}

#[test]
fn auth_gating_blocks_the_envelope_until_authenticated() {
    block_on(async {
        let mut settings = SessionSettings::default();
        settings.auth_mode = AuthMode::Required;
        let (mut session, _rx) = capturing_session(settings);
        dialog(
            &mut session,
            &[
                ("EHLO c", "250"),
                ("MAIL FROM:<a@x>", "530"),
                ("RCPT TO:<b@y>", "530"),
                ("DATA", "530"),
            ],
        )
        .await;
        let blob = base64::encode("\0alice\0pw");
        dialog(
            &mut session,
            &[
                (&format!("AUTH PLAIN {}", blob), "235"),
                ("MAIL FROM:<a@x>", "250"),
                ("RCPT TO:<b@y>", "250"),
                ("DATA", "354"),
            ],
        )
        .await;
    })
}

#[test]
fn message_flows_into_the_service() {
    block_on(async {
        let (mut session, rx) = capturing_session(SessionSettings::default());
        dialog(
            &mut session,
            &[
                ("EHLO client", "250"),
                ("MAIL FROM:<a@x>", "250"),
                ("RCPT TO:<b@y>", "250"),
                ("DATA", "354"),
            ],
        )
        .await;
        for line in ["Subject: hi", "", "body", "."] {
            session
                .apply_line(format!("{}\r\n", line).as_bytes(), false)
                .await;
        }
        assert!(reply(&mut session).await.starts_with("250 "));

        let ctx = rx.try_recv().expect("one accepted message");
        assert_eq!(ctx.envelope.from, "<a@x>");
        assert_eq!(ctx.envelope.to, vec!["<b@y>".to_owned()]);
        assert_eq!(ctx.message.data, b"Subject: hi\r\n\r\nbody".to_vec());
        assert_eq!(ctx.message.bytesize, ctx.message.data.len());
        assert!(ctx.message.headers);
        assert!(ctx.message.received.is_some());
        assert!(ctx.message.delivered.is_some());
    })
}

#[test]
fn dot_stuffed_lines_lose_exactly_one_dot() {
    block_on(async {
        let (mut session, rx) = capturing_session(SessionSettings::default());
        dialog(
            &mut session,
            &[
                ("EHLO client", "250"),
                ("MAIL FROM:<a@x>", "250"),
                ("RCPT TO:<b@y>", "250"),
                ("DATA", "354"),
            ],
        )
        .await;
        for line in ["..hello", "..", ".dot lead", "."] {
            session
                .apply_line(format!("{}\r\n", line).as_bytes(), false)
                .await;
        }
        assert!(reply(&mut session).await.starts_with("250 "));
        let ctx = rx.try_recv().expect("one accepted message");
        assert_eq!(ctx.message.data, b".hello\r\n.\r\ndot lead".to_vec());
    })
}

#[test]
fn single_dot_stuffed_body_line() {
    block_on(async {
        // scenario: body lines "..hello" then "." store ".hello"
        let (mut session, rx) = capturing_session(SessionSettings::default());
        dialog(
            &mut session,
            &[
                ("EHLO c", "250"),
                ("MAIL FROM:<a@x>", "250"),
                ("RCPT TO:<b@y>", "250"),
                ("DATA", "354"),
            ],
        )
        .await;
        session.apply_line(b"..hello\r\n", false).await;
        session.apply_line(b".\r\n", false).await;
        assert!(reply(&mut session).await.starts_with("250 "));
        let ctx = rx.try_recv().expect("one accepted message");
        assert_eq!(ctx.message.data, b".hello".to_vec());
    })
}

#[test]
fn crlf_ensure_normalizes_all_input() {
    block_on(async {
        let (mut session, rx) = capturing_session(SessionSettings::default());
        dialog(
            &mut session,
            &[
                ("EHLO c", "250"),
                ("MAIL FROM:<a@x>", "250"),
                ("RCPT TO:<b@y>", "250"),
                ("DATA", "354"),
            ],
        )
        .await;
        session.apply_line(b"one\n", false).await;
        session.apply_line(b"two\r\n", false).await;
        session.apply_line(b".\r\n", false).await;
        assert!(reply(&mut session).await.starts_with("250 "));
        let ctx = rx.try_recv().expect("one accepted message");
        assert_eq!(ctx.message.data, b"one\r\ntwo".to_vec());
    })
}

#[test]
fn crlf_leave_records_the_last_observed_terminator() {
    block_on(async {
        let mut settings = SessionSettings::default();
        settings.crlf_mode = CrlfMode::Leave;
        let (mut session, rx) = capturing_session(settings);
        dialog(
            &mut session,
            &[
                ("EHLO c", "250"),
                ("MAIL FROM:<a@x>", "250"),
                ("RCPT TO:<b@y>", "250"),
                ("DATA", "354"),
            ],
        )
        .await;
        session.apply_line(b"one\r\n", false).await;
        session.apply_line(b"two\n", false).await;
        session.apply_line(b".\r\n", false).await;
        assert!(reply(&mut session).await.starts_with("250 "));
        let ctx = rx.try_recv().expect("one accepted message");
        assert_eq!(ctx.message.crlf.as_bytes(), b"\n");
        assert_eq!(ctx.message.data, b"one\r\ntwo".to_vec());
    })
}

#[test]
fn crlf_strict_rejects_bare_newline_anywhere() {
    block_on(async {
        let mut settings = SessionSettings::default();
        settings.crlf_mode = CrlfMode::Strict;
        let (mut session, _rx) = capturing_session(settings);
        dialog(&mut session, &[("EHLO c", "250"), ("MAIL FROM:<a@x>", "250")]).await;
        session.apply_line(b"RCPT TO:<b@y>\n", false).await;
        assert!(reply(&mut session).await.starts_with("500 "));
        // also inside DATA
        dialog(&mut session, &[("RCPT TO:<b@y>", "250"), ("DATA", "354")]).await;
        session.apply_line(b"bare line\n", false).await;
        assert!(reply(&mut session).await.starts_with("500 "));
    })
}

#[test]
fn per_message_reset_is_idempotent() {
    block_on(async {
        let (mut session, rx) = capturing_session(SessionSettings::default());
        dialog(
            &mut session,
            &[
                ("EHLO c", "250"),
                ("MAIL FROM:<first@x>", "250"),
                ("RCPT TO:<b@y>", "250"),
                ("DATA", "354"),
            ],
        )
        .await;
        session.apply_line(b"round one\r\n", false).await;
        session.apply_line(b".\r\n", false).await;
        assert!(reply(&mut session).await.starts_with("250 "));
        let _ = rx.try_recv().expect("first message");

        // envelope and message are zeroed
        assert_eq!(session.ctx.envelope.from, "");
        assert!(session.ctx.envelope.to.is_empty());
        assert!(session.ctx.message.data.is_empty());
        assert_eq!(session.phase(), SmtpPhase::Idle);

        // RSET then a second transaction behaves like the first
        dialog(
            &mut session,
            &[
                ("RSET", "250"),
                ("MAIL FROM:<second@x>", "250"),
                ("RCPT TO:<c@z>", "250"),
                ("DATA", "354"),
            ],
        )
        .await;
        session.apply_line(b"round two\r\n", false).await;
        session.apply_line(b".\r\n", false).await;
        assert!(reply(&mut session).await.starts_with("250 "));
        let ctx = rx.try_recv().expect("second message");
        assert_eq!(ctx.envelope.from, "<second@x>");
        assert_eq!(ctx.envelope.to, vec!["<c@z>".to_owned()]);
        assert_eq!(ctx.message.data, b"round two".to_vec());
    })
}

#[test]
fn rejected_message_still_resets_the_transaction() {
    block_on(async {
        #[derive(Debug)]
        struct Rejecting;
        #[async_trait]
        impl MailService for Rejecting {
            async fn on_message(&self, _ctx: &mut SessionContext) -> Result<(), SmtpError> {
                Err(SmtpError::custom(552, "Message refused for policy"))
            }
        }
        let mut session = SmtpSession::new(SessionSettings::default(), Arc::new(Rejecting));
        session.ctx.info.local_host = "mx.example.org".to_owned();
        dialog(
            &mut session,
            &[
                ("EHLO c", "250"),
                ("MAIL FROM:<a@x>", "250"),
                ("RCPT TO:<b@y>", "250"),
                ("DATA", "354"),
            ],
        )
        .await;
        session.apply_line(b"doomed\r\n", false).await;
        session.apply_line(b".\r\n", false).await;
        let got = reply(&mut session).await;
        assert!(got.starts_with("552 "), "got {:?}", got);
        assert_eq!(session.phase(), SmtpPhase::Idle);
        assert!(session.ctx.message.data.is_empty());
        assert_eq!(session.ctx.info.exceptions, 1);

        // and a generic failure maps to 451
        #[derive(Debug)]
        struct Broken;
        #[async_trait]
        impl MailService for Broken {
            async fn on_message(&self, _ctx: &mut SessionContext) -> Result<(), SmtpError> {
                Err(SmtpError::Failure("disk on fire".to_owned()))
            }
        }
        let mut session = SmtpSession::new(SessionSettings::default(), Arc::new(Broken));
        session.ctx.info.local_host = "mx.example.org".to_owned();
        dialog(
            &mut session,
            &[
                ("EHLO c", "250"),
                ("MAIL FROM:<a@x>", "250"),
                ("RCPT TO:<b@y>", "250"),
                ("DATA", "354"),
            ],
        )
        .await;
        session.apply_line(b".\r\n", false).await;
        assert!(reply(&mut session).await.starts_with("451 "));
    })
}

#[test]
fn unknown_command_is_recoverable() {
    block_on(async {
        let (mut session, _rx) = capturing_session(SessionSettings::default());
        dialog(
            &mut session,
            &[
                ("EHLO c", "250"),
                ("FOO", "500"),
                ("RSET", "250"),
                ("MAIL FROM:<a@x>", "250"),
            ],
        )
        .await;
        assert_eq!(session.ctx.info.exceptions, 1);
        assert_eq!(session.ctx.info.errors.len(), 1);
    })
}

#[test]
fn mail_from_override_wins() {
    block_on(async {
        #[derive(Debug)]
        struct Rewriting;
        #[async_trait]
        impl MailService for Rewriting {
            async fn on_mail_from(
                &self,
                _ctx: &mut SessionContext,
                _from: &str,
            ) -> Result<Option<String>, SmtpError> {
                Ok(Some("<rewritten@x>".to_owned()))
            }
            async fn on_rcpt_to(
                &self,
                _ctx: &mut SessionContext,
                to: &str,
            ) -> Result<Option<String>, SmtpError> {
                Ok(Some(to.to_ascii_lowercase()))
            }
        }
        let mut session = SmtpSession::new(SessionSettings::default(), Arc::new(Rewriting));
        session.ctx.info.local_host = "mx.example.org".to_owned();
        dialog(
            &mut session,
            &[
                ("EHLO c", "250"),
                ("MAIL FROM:<original@x>", "250"),
                ("RCPT TO:<B@Y>", "250"),
            ],
        )
        .await;
        assert_eq!(session.ctx.envelope.from, "<rewritten@x>");
        assert_eq!(session.ctx.envelope.to, vec!["<b@y>".to_owned()]);
    })
}
