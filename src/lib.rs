/*!
Postak is an embeddable SMTP submission server library.

It accepts mail-submission clients over TCP, drives them through the
SMTP command/response dialog (RFC 5321 subset) with optional AUTH and
STARTTLS, reconstructs each message envelope and body, and hands the
result to your [`MailService`](mail::MailService) callbacks. What happens
to an accepted message - queueing, storage, relaying - is entirely up to
the host program.

# What you get

* The per-connection session engine: command sequencing, line framing
  with idle-timeout and buffer-cap policies, CRLF handling, dot-stuffed
  DATA reassembly.
* STARTTLS through rustls, with a self-signed certificate fallback for
  development setups.
* AUTH LOGIN and AUTH PLAIN sub-dialogs; credential checks are delegated
  to the host.
* A connection supervisor with strict admission control: a connection
  cap, a processing cap with backpressure, and an optional pre-forked
  worker pool on unix.

# What you do not get

No mail relaying, no MIME parsing, no recipient directory, no DKIM/SPF,
no message persistence. Those belong to the host program.

# Usage

```no_run
use postak::mail::DebugMailService;
use postak::server::{SmtpServer, SmtpServerOptions};

fn main() {
    env_logger::init();
    let mut opts = SmtpServerOptions::default();
    opts.hosts = "127.0.0.1".into();
    opts.ports = "2525".into();
    let server = SmtpServer::new(opts, DebugMailService::default()).unwrap();
    server.start().unwrap();
    async_std::task::block_on(server.join());
}
```
*/

#[macro_use]
extern crate log;

pub mod io;
pub mod mail;
pub mod server;
pub mod smtp;

pub mod common {
    pub use crate::smtp::SmtpError;
    pub type Result<T> = std::result::Result<T, SmtpError>;

    pub use async_std::io::prelude::{ReadExt, WriteExt};
    pub use async_std::io::{Read, Write};
    pub use std::pin::Pin;
    pub use std::sync::Arc;

    /// In the absence of a random number generator produces a time based
    /// identifier. Used as a logging prefix, not for security.
    pub fn time_based_id() -> String {
        fn nonnumber(input: char) -> bool {
            !input.is_ascii_digit()
        }
        format!("{:?}", std::time::Instant::now()).replace(nonnumber, "")
    }
}
