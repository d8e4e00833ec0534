//! The per-connection driver: owns the stream, feeds the framer into the
//! session engine, writes queued replies back, performs the TLS swap and
//! releases every resource on every exit path.

use crate::common::*;
use crate::io::tls::TlsUpgrade;
use crate::io::{Io, LineReader};
use crate::mail::MailService;
use crate::server::{ServerState, SmtpServerOptions};
use crate::smtp::{DriverControl, SessionSettings, SmtpError, SmtpReply, SmtpSession};
use async_std::net::TcpStream;
use once_cell::sync::Lazy;
use std::net::IpAddr;
use trust_dns_resolver::Resolver;

enum Flow {
    Continue,
    StartTls,
    Closed,
}

pub(crate) async fn serve_session(
    stream: TcpStream,
    state: Arc<ServerState>,
    opts: Arc<SmtpServerOptions>,
    service: Arc<dyn MailService>,
    tls: Option<Arc<dyn TlsUpgrade>>,
) {
    let occupied = state.enter_connection();
    let mut stream = stream;
    if let Some(max) = opts.max_connections {
        if occupied > max {
            // over capacity: no welcome, a 421 and the door
            let refusal = SmtpReply::ServiceTooBusyError.to_string();
            let _ = stream.write_all(refusal.as_bytes()).await;
            let _ = stream.flush().await;
            state.leave_connection();
            return;
        }
    }

    let local = stream.local_addr().ok();
    let peer = stream.peer_addr().ok();

    let settings = SessionSettings {
        crlf_mode: opts.crlf_mode,
        auth_mode: opts.auth_mode,
        encrypt_mode: opts.encrypt_mode,
        pipelining: opts.pipelining,
        internationalization: opts.internationalization,
        tls_available: tls.is_some(),
    };
    let mut session = SmtpSession::new(settings, service);
    if let Some(local) = local {
        session.ctx.info.local_ip = local.ip().to_string();
        session.ctx.info.local_port = local.port();
        session.ctx.info.local_host = resolve_name(local.ip(), opts.do_dns_reverse_lookup).await;
    }
    if let Some(peer) = peer {
        session.ctx.info.remote_ip = peer.ip().to_string();
        session.ctx.info.remote_port = peer.port();
        session.ctx.info.remote_host = resolve_name(peer.ip(), opts.do_dns_reverse_lookup).await;
    }

    let mut io: Box<dyn Io> = Box::new(stream);
    session.connect().await;

    // the welcome goes out before admission; command processing waits
    // for a slot
    let mut processing = false;
    match flush(&mut session, &mut io).await {
        Ok(Flow::Continue) => {
            state.acquire_processing().await;
            processing = true;
            run(&mut session, &mut io, &state, &opts, tls).await;
        }
        Ok(_) | Err(_) => {}
    }

    session.disconnect().await;
    let _ = futures_lite::io::AsyncWriteExt::close(&mut io).await;
    if processing {
        state.release_processing();
    }
    state.leave_connection();
}

async fn run(
    session: &mut SmtpSession,
    io: &mut Box<dyn Io>,
    state: &Arc<ServerState>,
    opts: &Arc<SmtpServerOptions>,
    tls: Option<Arc<dyn TlsUpgrade>>,
) {
    let mut framer = LineReader::new(
        opts.io_buffer_chunk_size,
        opts.io_buffer_max_size,
        opts.io_cmd_timeout,
    );

    loop {
        match flush(session, io).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Closed) => return,
            Ok(Flow::StartTls) => {
                let upgrade = match tls.as_ref() {
                    Some(upgrade) => upgrade,
                    // the dispatcher refuses STARTTLS when no upgrade is
                    // configured, this is unreachable in practice
                    None => return,
                };
                let plain = std::mem::replace(io, Box::new(Gone));
                match upgrade.upgrade_to_tls(plain).await {
                    Ok(encrypted) => {
                        *io = encrypted;
                        session.tls_done();
                        framer.reset();
                        continue;
                    }
                    Err(e) => {
                        error!("{} TLS handshake failed: {}", session.ctx.info.id, e);
                        return;
                    }
                }
            }
            Err(e) => {
                debug!("{} write failed: {}", session.ctx.info.id, e);
                return;
            }
        }

        match framer.read_line(io, state.abort_flag()).await {
            Ok(line) => session.apply_line(&line.bytes, line.pipelined).await,
            Err(SmtpError::CmdTimeout) => {
                session.say_shutdown_timeout();
                let _ = flush(session, io).await;
                return;
            }
            Err(SmtpError::BufferOverrun) => {
                session.say_shutdown_overrun();
                let _ = flush(session, io).await;
                return;
            }
            Err(SmtpError::Stopping) => {
                // shutdown signal, clean exit without a farewell
                return;
            }
            Err(SmtpError::Disconnected) => {
                debug!("{} peer went away", session.ctx.info.id);
                return;
            }
            Err(e) => {
                debug!("{} read failed: {}", session.ctx.info.id, e);
                return;
            }
        }
    }
}

/// Writes everything the engine queued. Replies are emitted strictly in
/// the order they were said.
async fn flush(session: &mut SmtpSession, io: &mut Box<dyn Io>) -> crate::common::Result<Flow> {
    while let Some(control) = session.pop_control() {
        match control {
            DriverControl::Response(bytes) => {
                trace!(
                    "{} > {:?}",
                    session.ctx.info.id,
                    String::from_utf8_lossy(&bytes)
                );
                io.write_all(&bytes).await?;
            }
            DriverControl::StartTls => {
                io.flush().await?;
                return Ok(Flow::StartTls);
            }
            DriverControl::Shutdown => {
                io.flush().await?;
                return Ok(Flow::Closed);
            }
        }
    }
    io.flush().await?;
    Ok(Flow::Continue)
}

/// Stand-in stream while the real one is inside the TLS handshake.
struct Gone;

impl Read for Gone {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        _buf: &mut [u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::task::Poll::Ready(Err(std::io::ErrorKind::NotConnected.into()))
    }
}

impl Write for Gone {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        _buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::task::Poll::Ready(Err(std::io::ErrorKind::NotConnected.into()))
    }
    fn poll_flush(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
    fn poll_close(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

/// Numeric unless reverse lookup is enabled and yields a PTR name.
async fn resolve_name(ip: IpAddr, reverse_lookup: bool) -> String {
    if !reverse_lookup {
        return ip.to_string();
    }
    async_std::task::spawn_blocking(move || {
        static RESOLVER: Lazy<Option<Resolver>> = Lazy::new(|| Resolver::from_system_conf().ok());
        RESOLVER
            .as_ref()
            .and_then(|resolver| resolver.reverse_lookup(ip).ok())
            .and_then(|ptr| {
                ptr.iter()
                    .next()
                    .map(|name| name.to_utf8().trim_end_matches('.').to_owned())
            })
            .unwrap_or_else(|| ip.to_string())
    })
    .await
}
