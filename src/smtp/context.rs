use chrono::{DateTime, Utc};
use std::fmt;

/// Line terminator observed on client input. Server replies always use CRLF.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum LineEnding {
    CrLf,
    Lf,
}

impl LineEnding {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            LineEnding::CrLf => b"\r\n",
            LineEnding::Lf => b"\n",
        }
    }
}

/// `BODY=` parameter recorded from MAIL FROM.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum BodyEncoding {
    Unspecified,
    SevenBit,
    EightBitMime,
}

impl fmt::Display for BodyEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BodyEncoding::Unspecified => "",
            BodyEncoding::SevenBit => "7bit",
            BodyEncoding::EightBitMime => "8bitmime",
        })
    }
}

/// `SMTPUTF8` parameter recorded from MAIL FROM.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum Utf8Encoding {
    Unspecified,
    Utf8,
}

impl fmt::Display for Utf8Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Utf8Encoding::Unspecified => "",
            Utf8Encoding::Utf8 => "utf8",
        })
    }
}

/// Connection-scoped facts about one live session. Initialized when the
/// client connects, discarded when it disconnects. Host callbacks may
/// mutate the greeting strings; CR/LF is stripped from them on the wire.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    /// Short unique id used as a logging prefix
    pub id: String,
    pub local_host: String,
    pub local_ip: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_ip: String,
    pub remote_port: u16,
    /// Argument of the last successful HELO/EHLO
    pub helo: String,
    /// Text of the `220` session greeting
    pub local_response: String,
    /// Text of the `250` HELO/EHLO greeting
    pub helo_response: String,
    pub connected: Option<DateTime<Utc>>,
    pub authorization_id: String,
    pub authentication_id: String,
    pub authenticated: Option<DateTime<Utc>>,
    pub encrypted: Option<DateTime<Utc>>,
    /// How many errors were recovered within this session
    pub exceptions: usize,
    /// Descriptions of the recovered errors, for post-mortem inspection
    pub errors: Vec<String>,
}

/// The reverse-path / forward-path pair of the transaction in progress.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub from: String,
    /// Ordered as received, duplicates allowed
    pub to: Vec<String>,
    pub encoding_body: BodyEncoding,
    pub encoding_utf8: Utf8Encoding,
}

impl Default for BodyEncoding {
    fn default() -> Self {
        BodyEncoding::Unspecified
    }
}

impl Default for Utf8Encoding {
    fn default() -> Self {
        Utf8Encoding::Unspecified
    }
}

/// The message body being reassembled during DATA.
#[derive(Debug, Clone)]
pub struct Message {
    pub received: Option<DateTime<Utc>>,
    pub delivered: Option<DateTime<Utc>>,
    pub bytesize: usize,
    /// False until the header/body separator line was seen
    pub headers: bool,
    /// The last line terminator observed in the body (CRLF_LEAVE mode)
    pub crlf: LineEnding,
    pub data: Vec<u8>,
}

impl Default for Message {
    fn default() -> Self {
        Message {
            received: None,
            delivered: None,
            bytesize: 0,
            headers: false,
            crlf: LineEnding::CrLf,
            data: Vec::new(),
        }
    }
}

/// Everything a host callback may inspect or mutate about one session.
/// Contexts are never shared across sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub info: SessionInfo,
    pub envelope: Envelope,
    pub message: Message,
}

impl SessionContext {
    /// Clears the transaction state after a completed DATA or on RSET.
    /// The connection-scoped facts in `info` survive.
    pub fn reset_transaction(&mut self) {
        self.envelope = Envelope::default();
        self.message = Message::default();
    }

    pub fn record_error(&mut self, error: &crate::smtp::SmtpError) {
        self.info.exceptions += 1;
        self.info.errors.push(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_reset_keeps_connection_facts() {
        let mut sut = SessionContext::default();
        sut.info.helo = "client.example.org".to_owned();
        sut.info.authenticated = Some(Utc::now());
        sut.envelope.from = "<a@example.org>".to_owned();
        sut.envelope.to.push("<b@example.org>".to_owned());
        sut.message.data.extend_from_slice(b"hello");
        sut.reset_transaction();
        assert_eq!(sut.info.helo, "client.example.org");
        assert!(sut.info.authenticated.is_some());
        assert!(sut.envelope.from.is_empty());
        assert!(sut.envelope.to.is_empty());
        assert!(sut.message.data.is_empty());
    }

    #[test]
    fn recorded_errors_count_up() {
        let mut sut = SessionContext::default();
        sut.record_error(&crate::smtp::SmtpError::BadSequence);
        sut.record_error(&crate::smtp::SmtpError::AuthFailed);
        assert_eq!(sut.info.exceptions, 2);
        assert_eq!(sut.info.errors.len(), 2);
    }
}
