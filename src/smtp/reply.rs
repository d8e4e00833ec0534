use std::fmt;

/* Codes are arranged according to RFC 5321 reply classes:

   2yz positive completion, 3yz positive intermediate,
   4yz transient negative, 5yz permanent negative.

   Variant name suffixes follow the classes to keep names english:
   2xx => ...Info, 3xx => ...Challenge, 4xx => ...Error, 5xx => ...Failure
*/

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum SmtpReply {
    /// 220 `<text>` - the text is the session greeting or the TLS go-ahead
    ServiceReadyInfo(String),
    /// 220 Ready to start TLS
    TlsReadyInfo,
    /// 221 `<text>` Service closing transmission channel
    ClosingConnectionInfo(String),
    /// 235 OK
    AuthSuccessInfo,
    /// 250 OK
    OkInfo,
    /// 250 `<info>`
    OkMessageInfo(String),
    /// 250 OK `<helo response>`
    OkHeloInfo(String),
    /// multi-line 250 advertising extensions, terminated by `250 OK`
    OkEhloInfo {
        response: String,
        extensions: Vec<String>,
    },
    /// 250 Requested mail action okay, completed
    OkCompletedInfo,
    /// 334 `<base64 challenge>` - empty challenge renders as `334 `
    AuthChallenge(String),
    /// 354 end with `<CRLF>.<CRLF>`
    StartMailInputChallenge,
    /// 421 `<text>`, closing transmission channel
    ServiceNotAvailableError(String),
    /// 421 after the idle deadline expired
    ServiceTimeoutError,
    /// 421 over the connection cap
    ServiceTooBusyError,
    /// 451 Requested action aborted
    ProcessingError,
    /// 454 TLS not available due to temporary reason
    TlsNotAvailableError,
    /// 500 Syntax error, command unrecognized
    CommandSyntaxFailure,
    /// 500 Bare newline or stray carriage return in input
    LineEndingFailure,
    /// 500 Pipelining is not allowed on this service
    PipeliningFailure,
    /// 500 Line length exceeded
    LineLengthFailure,
    /// 501 Syntax error in parameters or arguments
    ParameterSyntaxFailure,
    /// 503 Bad sequence of commands
    CommandSequenceFailure,
    /// 530 Authentication required
    AuthRequiredFailure,
    /// 530 Must issue a STARTTLS command first
    TlsRequiredFailure,
    /// 535 Authentication credentials invalid
    AuthFailure,
    /// any other code/text pair, used for host-specified replies
    Custom(u16, String),
}

impl SmtpReply {
    pub fn code(&self) -> u16 {
        use SmtpReply::*;
        match self {
            ServiceReadyInfo(_) | TlsReadyInfo => 220,
            ClosingConnectionInfo(_) => 221,
            AuthSuccessInfo => 235,
            OkInfo
            | OkMessageInfo(_)
            | OkHeloInfo(_)
            | OkEhloInfo { .. }
            | OkCompletedInfo => 250,
            AuthChallenge(_) => 334,
            StartMailInputChallenge => 354,
            ServiceNotAvailableError(_) | ServiceTimeoutError | ServiceTooBusyError => 421,
            ProcessingError => 451,
            TlsNotAvailableError => 454,
            CommandSyntaxFailure | LineEndingFailure | PipeliningFailure | LineLengthFailure => 500,
            ParameterSyntaxFailure => 501,
            CommandSequenceFailure => 503,
            AuthRequiredFailure | TlsRequiredFailure => 530,
            AuthFailure => 535,
            Custom(code, _) => *code,
        }
    }

    fn text(&self) -> String {
        use SmtpReply::*;
        match self {
            ServiceReadyInfo(text) => sanitize(text),
            TlsReadyInfo => "Ready to start TLS".to_owned(),
            ClosingConnectionInfo(domain) => {
                format!("{} Service closing transmission channel", sanitize(domain))
            }
            AuthSuccessInfo => "OK".to_owned(),
            OkInfo => "OK".to_owned(),
            OkMessageInfo(info) => sanitize(info),
            OkHeloInfo(response) => format!("OK {}", sanitize(response)),
            OkEhloInfo { response, .. } => sanitize(response),
            OkCompletedInfo => "Requested mail action okay, completed".to_owned(),
            AuthChallenge(challenge) => challenge.clone(),
            StartMailInputChallenge => {
                "Enter message, ending with \".\" on a line by itself".to_owned()
            }
            ServiceNotAvailableError(reason) => format!(
                "{} Service not available, closing transmission channel",
                sanitize(reason)
            ),
            ServiceTimeoutError => "Timeout, closing transmission channel".to_owned(),
            ServiceTooBusyError => "Too many connections, try again later".to_owned(),
            ProcessingError => "Requested action aborted: error in processing".to_owned(),
            TlsNotAvailableError => "TLS not available due to temporary reason".to_owned(),
            CommandSyntaxFailure => "Syntax error, command unrecognized".to_owned(),
            LineEndingFailure => "Line must end with <CRLF>".to_owned(),
            PipeliningFailure => "Pipelining is not allowed".to_owned(),
            LineLengthFailure => "Line too long".to_owned(),
            ParameterSyntaxFailure => "Syntax error in parameters or arguments".to_owned(),
            CommandSequenceFailure => "Bad sequence of commands".to_owned(),
            AuthRequiredFailure => "Authentication required".to_owned(),
            TlsRequiredFailure => "Must issue a STARTTLS command first".to_owned(),
            AuthFailure => "Authentication credentials invalid".to_owned(),
            Custom(_, text) => sanitize(text),
        }
    }

    /// Continuation lines between the first line and the closing `250 OK`.
    fn items(&self) -> &[String] {
        match self {
            SmtpReply::OkEhloInfo { extensions, .. } => extensions.as_slice(),
            _ => &[],
        }
    }
}

/// Greeting strings come from host callbacks; a stray CR or LF in them
/// must not break the wire framing.
fn sanitize(text: &str) -> String {
    text.replace(&['\r', '\n'][..], " ").trim_end().to_owned()
}

impl fmt::Display for SmtpReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.code();
        match self {
            // the greeting line, the extension lines, a closing OK -
            // even when no extension is on
            SmtpReply::OkEhloInfo { .. } => {
                write!(f, "{}-{}\r\n", code, self.text())?;
                for item in self.items() {
                    write!(f, "{}-{}\r\n", code, item)?;
                }
                write!(f, "{} OK\r\n", code)
            }
            // the two-step AUTH PLAIN challenge is `334 ` - code, space,
            // nothing else
            SmtpReply::AuthChallenge(c) if c.is_empty() => write!(f, "{} \r\n", code),
            _ => write!(f, "{} {}\r\n", code, self.text()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_reply_renders_code_and_text() {
        assert_eq!(SmtpReply::OkInfo.to_string(), "250 OK\r\n");
        assert_eq!(
            SmtpReply::StartMailInputChallenge.to_string(),
            "354 Enter message, ending with \".\" on a line by itself\r\n"
        );
    }

    #[test]
    fn ehlo_reply_renders_multiline() {
        let sut = SmtpReply::OkEhloInfo {
            response: "mx.example.org".to_owned(),
            extensions: vec!["PIPELINING".to_owned(), "STARTTLS".to_owned()],
        };
        assert_eq!(
            sut.to_string(),
            "250-mx.example.org\r\n250-PIPELINING\r\n250-STARTTLS\r\n250 OK\r\n"
        );
    }

    #[test]
    fn empty_auth_challenge_keeps_trailing_space() {
        assert_eq!(SmtpReply::AuthChallenge(String::new()).to_string(), "334 \r\n");
        assert_eq!(
            SmtpReply::AuthChallenge("VXNlcm5hbWU6".to_owned()).to_string(),
            "334 VXNlcm5hbWU6\r\n"
        );
    }

    #[test]
    fn greeting_with_crlf_is_sanitized() {
        let sut = SmtpReply::ServiceReadyInfo("mx\r\nevil".to_owned());
        assert_eq!(sut.to_string(), "220 mx evil\r\n");
    }
}
