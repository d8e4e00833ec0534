/// One parsed client command line. Verbs are matched case-insensitively
/// and tolerate extra whitespace; MAIL/RCPT arguments are kept raw so the
/// host callbacks see exactly what the client sent.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    StartTls,
    Auth {
        mechanism: AuthMechanism,
        initial: Option<String>,
    },
    Noop,
    Rset,
    Quit,
    /// Everything after `MAIL FROM:`, trimmed
    Mail(String),
    /// Everything after `RCPT TO:`, trimmed
    Rcpt(String),
    Data,
    /// Anything else, verbatim - handed to the unknown-command callback
    Unknown(String),
}

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum AuthMechanism {
    Plain,
    Login,
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Self {
        fn prefix_match(line: &str, candidate: &str) -> bool {
            line.len() >= candidate.len()
                && line[..candidate.len()].eq_ignore_ascii_case(candidate)
        }

        let line = line.trim();

        if line.eq_ignore_ascii_case("QUIT") {
            Self::Quit
        } else if line.eq_ignore_ascii_case("DATA") {
            Self::Data
        } else if line.eq_ignore_ascii_case("RSET") {
            Self::Rset
        } else if line.eq_ignore_ascii_case("NOOP") || prefix_match(line, "NOOP ") {
            Self::Noop
        } else if line.eq_ignore_ascii_case("STARTTLS") {
            Self::StartTls
        } else if prefix_match(line, "HELO ") {
            Self::Helo(line[5..].trim().to_owned())
        } else if prefix_match(line, "EHLO ") {
            Self::Ehlo(line[5..].trim().to_owned())
        } else if prefix_match(line, "MAIL FROM:") {
            Self::Mail(line[10..].trim().to_owned())
        } else if prefix_match(line, "RCPT TO:") {
            Self::Rcpt(line[8..].trim().to_owned())
        } else if line.eq_ignore_ascii_case("AUTH") || prefix_match(line, "AUTH ") {
            match Self::parse_auth(line[4..].trim()) {
                Some(auth) => auth,
                None => Self::Unknown(line.to_owned()),
            }
        } else {
            Self::Unknown(line.to_owned())
        }
    }

    fn parse_auth(args: &str) -> Option<Self> {
        let mut words = args.split_whitespace();
        let mechanism = match words.next() {
            Some(word) if word.eq_ignore_ascii_case("PLAIN") => AuthMechanism::Plain,
            Some(word) if word.eq_ignore_ascii_case("LOGIN") => AuthMechanism::Login,
            // only LOGIN and PLAIN are implemented
            _ => return None,
        };
        let initial = words.next().map(str::to_owned);
        if words.next().is_some() {
            return None;
        }
        Some(Self::Auth { mechanism, initial })
    }
}
