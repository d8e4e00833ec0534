mod binding;
#[cfg(unix)]
mod prefork;
mod session_worker;

use crate::common::*;
use crate::io::tls::{RustlsProvider, TlsUpgrade};
use crate::mail::MailService;
use crate::smtp::SmtpError;
use async_std::channel::{bounded, Receiver, Sender};
use async_std::net::TcpListener;
use async_std::prelude::FutureExt;
use async_std::task;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub use crate::io::tls::TlsOptions;
pub use crate::smtp::{AuthMode, CrlfMode, EncryptMode};

/// Everything the server can be told before it starts. Validation
/// happens in [`SmtpServer::new`]; an invalid combination never yields a
/// server object.
#[derive(Debug, Clone)]
pub struct SmtpServerOptions {
    /// Service name used in greetings. Defaults to the machine hostname.
    pub name: String,
    /// Comma-separated hosts: names, literal addresses or `*`
    pub hosts: String,
    /// Comma-separated port tokens, a token may be `2525:3535`
    pub ports: String,
    /// Sessions allowed to process commands concurrently
    pub max_processings: usize,
    /// Sessions allowed to hold a connection open, `None` = unbounded
    pub max_connections: Option<usize>,
    /// 0 disables pre-forking, otherwise at least 2 worker processes
    pub pre_fork: usize,
    pub crlf_mode: CrlfMode,
    pub auth_mode: AuthMode,
    pub encrypt_mode: EncryptMode,
    pub pipelining: bool,
    /// Enables 8BITMIME and SMTPUTF8
    pub internationalization: bool,
    /// Idle deadline between commands, `None` disables
    pub io_cmd_timeout: Option<Duration>,
    pub io_buffer_chunk_size: usize,
    /// Input buffer cap, `None` disables
    pub io_buffer_max_size: Option<usize>,
    pub do_dns_reverse_lookup: bool,
    /// `stop` waits for live sessions instead of aborting them
    pub stop_gracefully: bool,
    /// Grace period before listeners close while connections remain
    pub wait_seconds_before_close: Duration,
    pub tls: TlsOptions,
}

impl Default for SmtpServerOptions {
    fn default() -> Self {
        let name = hostname::get()
            .ok()
            .and_then(|n| n.into_string().ok())
            .unwrap_or_else(|| "postak".to_owned());
        SmtpServerOptions {
            name,
            hosts: "127.0.0.1".to_owned(),
            ports: "2525".to_owned(),
            max_processings: 4,
            max_connections: None,
            pre_fork: 0,
            crlf_mode: CrlfMode::Ensure,
            auth_mode: AuthMode::Forbidden,
            encrypt_mode: EncryptMode::Forbidden,
            pipelining: false,
            internationalization: false,
            io_cmd_timeout: Some(Duration::from_secs(30)),
            io_buffer_chunk_size: 4096,
            io_buffer_max_size: Some(1024 * 1024),
            do_dns_reverse_lookup: true,
            stop_gracefully: true,
            wait_seconds_before_close: Duration::from_secs(0),
            tls: TlsOptions::default(),
        }
    }
}

impl SmtpServerOptions {
    fn validate(&self) -> crate::common::Result<()> {
        if self.max_processings == 0 {
            return Err(SmtpError::Config(
                "max_processings must be a positive integer".to_owned(),
            ));
        }
        if let Some(max) = self.max_connections {
            if max < self.max_processings {
                return Err(SmtpError::Config(
                    "max_connections must be at least max_processings".to_owned(),
                ));
            }
        }
        if self.pre_fork == 1 {
            return Err(SmtpError::Config(
                "pre_fork must be 0 or at least 2".to_owned(),
            ));
        }
        #[cfg(not(unix))]
        if self.pre_fork > 1 {
            return Err(SmtpError::Config(
                "pre_fork requires a unix platform".to_owned(),
            ));
        }
        if self.io_buffer_chunk_size == 0 {
            return Err(SmtpError::Config(
                "io_buffer_chunk_size must be a positive integer".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Counters and stop signals shared by listeners and session workers.
pub(crate) struct ServerState {
    connections: AtomicUsize,
    processings: AtomicUsize,
    slot_tx: Sender<()>,
    slot_rx: Receiver<()>,
    stop_accepting: AtomicBool,
    abort_sessions: AtomicBool,
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
}

impl ServerState {
    fn new(max_processings: usize) -> Self {
        let (slot_tx, slot_rx) = bounded(max_processings);
        let (stop_tx, stop_rx) = bounded(1);
        ServerState {
            connections: AtomicUsize::new(0),
            processings: AtomicUsize::new(0),
            slot_tx,
            slot_rx,
            stop_accepting: AtomicBool::new(false),
            abort_sessions: AtomicBool::new(false),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
        }
    }

    /// Registers a connection slot, returns how many are now held.
    pub(crate) fn enter_connection(&self) -> usize {
        self.connections.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn leave_connection(&self) {
        self.connections.fetch_sub(1, Ordering::SeqCst);
    }

    /// Blocks until a processing slot frees up. A freed slot wakes
    /// exactly one waiter.
    pub(crate) async fn acquire_processing(&self) {
        let _ = self.slot_tx.send(()).await;
        self.processings.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release_processing(&self) {
        if self.slot_rx.try_recv().is_ok() {
            self.processings.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub(crate) fn processings(&self) -> usize {
        self.processings.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_accepting(&self) -> bool {
        self.stop_accepting.load(Ordering::SeqCst)
    }

    pub(crate) fn abort_flag(&self) -> &AtomicBool {
        &self.abort_sessions
    }

    fn stop_listener_rx(&self) -> Receiver<()> {
        self.stop_rx.clone()
    }

    /// Stops accepting: sets the flag and unblocks every accept.
    fn request_stop(&self) {
        self.stop_accepting.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.stop_tx.lock() {
            guard.take();
        }
    }

    /// Tells live sessions to abort at their next poll.
    fn abort_sessions(&self) {
        self.abort_sessions.store(true, Ordering::SeqCst);
    }

    pub(crate) fn begin_stop(&self, gracefully: bool) {
        self.request_stop();
        if !gracefully {
            self.abort_sessions();
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
enum Role {
    /// Accepts connections itself, no forked workers
    Single,
    /// Bound the listeners and forked; only supervises
    Master,
    /// Forked child accepting on inherited listeners
    Worker,
}

struct Inner {
    listener_tasks: Vec<task::JoinHandle<()>>,
    bound: Vec<SocketAddr>,
    #[cfg(unix)]
    children: Vec<nix::unistd::Pid>,
    role: Role,
    started: bool,
}

/// The connection supervisor: binds listeners, runs accept loops, spawns
/// one task per session, enforces the connection and processing caps and
/// owns the shutdown choreography.
pub struct SmtpServer {
    opts: Arc<SmtpServerOptions>,
    service: Arc<dyn MailService>,
    tls: Option<Arc<dyn TlsUpgrade>>,
    candidates: Vec<SocketAddr>,
    state: Arc<ServerState>,
    inner: Mutex<Inner>,
}

impl SmtpServer {
    /// Validates the options, resolves the bindings and prepares the TLS
    /// transport. Nothing listens yet - call [`start`](SmtpServer::start).
    pub fn new(
        opts: SmtpServerOptions,
        service: impl MailService + 'static,
    ) -> crate::common::Result<Self> {
        opts.validate()?;
        let candidates = binding::expand_bindings(&opts.hosts, &opts.ports)?;

        let tls: Option<Arc<dyn TlsUpgrade>> = if opts.encrypt_mode != EncryptMode::Forbidden {
            let mut tls_opts = opts.tls.clone();
            if tls_opts.subject_names.is_empty() {
                tls_opts.subject_names = opts
                    .hosts
                    .split(',')
                    .map(str::trim)
                    .filter(|host| !host.is_empty() && *host != "*")
                    .map(str::to_owned)
                    .chain(candidates.iter().map(|addr| addr.ip().to_string()))
                    .collect();
            }
            let provider = RustlsProvider::from_options(&tls_opts)?;
            Some(Arc::new(provider) as Arc<dyn TlsUpgrade>)
        } else {
            None
        };

        let state = Arc::new(ServerState::new(opts.max_processings));
        Ok(SmtpServer {
            opts: Arc::new(opts),
            service: Arc::new(service),
            tls,
            candidates,
            state,
            inner: Mutex::new(Inner {
                listener_tasks: Vec::new(),
                bound: Vec::new(),
                #[cfg(unix)]
                children: Vec::new(),
                role: Role::Single,
                started: false,
            }),
        })
    }

    /// Binds all configured addresses and begins accepting. With
    /// `pre_fork` at least 2 the listeners are bound first, then the
    /// worker processes are forked to share them; the master itself does
    /// not accept. Returns in every process.
    ///
    /// Deliberately synchronous: with `pre_fork` the fork must happen
    /// before the async executor spins up its worker threads, so call
    /// this before entering the runtime in that case.
    pub fn start(&self) -> crate::common::Result<()> {
        let mut std_listeners = Vec::new();
        {
            let inner = self.inner.lock().expect("server lock");
            if inner.started {
                return Err(SmtpError::Config("server already started".to_owned()));
            }
        }
        let mut bound = Vec::new();
        for addr in &self.candidates {
            let listener = std::net::TcpListener::bind(addr)
                .map_err(|e| SmtpError::Config(format!("unable to bind {}: {}", addr, e)))?;
            bound.push(listener.local_addr()?);
            info!("listening on {}", bound.last().expect("just pushed"));
            std_listeners.push(listener);
        }

        #[cfg(unix)]
        if self.opts.pre_fork >= 2 {
            return self.start_forked(std_listeners, bound);
        }

        let mut inner = self.inner.lock().expect("server lock");
        inner.bound = bound;
        inner.role = Role::Single;
        inner.started = true;
        for listener in std_listeners {
            inner.listener_tasks.push(self.spawn_accept_loop(listener));
        }
        Ok(())
    }

    #[cfg(unix)]
    fn start_forked(
        &self,
        std_listeners: Vec<std::net::TcpListener>,
        bound: Vec<SocketAddr>,
    ) -> crate::common::Result<()> {
        match prefork::fork_workers(self.opts.pre_fork)? {
            prefork::ForkOutcome::Master(children) => {
                // the workers carry the inherited handles from here on
                drop(std_listeners);
                let mut inner = self.inner.lock().expect("server lock");
                inner.bound = bound;
                inner.children = children;
                inner.role = Role::Master;
                inner.started = true;
                Ok(())
            }
            prefork::ForkOutcome::Worker => {
                let term = Arc::new(AtomicBool::new(false));
                prefork::register_termination(&term)?;
                {
                    let state = self.state.clone();
                    let gracefully = self.opts.stop_gracefully;
                    task::spawn(async move {
                        while !state.stop_accepting() {
                            if term.load(Ordering::SeqCst) {
                                state.begin_stop(gracefully);
                                break;
                            }
                            task::sleep(Duration::from_millis(100)).await;
                        }
                    });
                }
                let mut inner = self.inner.lock().expect("server lock");
                inner.bound = bound;
                inner.role = Role::Worker;
                inner.started = true;
                for listener in std_listeners {
                    inner.listener_tasks.push(self.spawn_accept_loop(listener));
                }
                Ok(())
            }
        }
    }

    fn spawn_accept_loop(&self, listener: std::net::TcpListener) -> task::JoinHandle<()> {
        let state = self.state.clone();
        let opts = self.opts.clone();
        let service = self.service.clone();
        let tls = self.tls.clone();
        task::spawn(async move {
            let listener = TcpListener::from(listener);
            accept_loop(listener, state, opts, service, tls).await
        })
    }

    /// Tells the accept loops to exit after their next accept. Live
    /// sessions are left alone.
    pub fn shutdown(&self) {
        self.state.stop_accepting.store(true, Ordering::SeqCst);
    }

    /// Full stop: unblocks and closes the listeners, optionally sleeps
    /// the configured grace period while connections remain, then either
    /// waits for sessions to finish (`stop_gracefully`) or aborts them.
    pub async fn stop(&self) {
        self.state.request_stop();

        #[cfg(unix)]
        {
            let children: Vec<_> = {
                let inner = self.inner.lock().expect("server lock");
                inner.children.clone()
            };
            for child in children {
                prefork::terminate(child);
            }
        }

        if self.opts.wait_seconds_before_close > Duration::from_secs(0)
            && self.state.connections() > 0
        {
            task::sleep(self.opts.wait_seconds_before_close).await;
        }

        let tasks: Vec<_> = {
            let mut inner = self.inner.lock().expect("server lock");
            inner.listener_tasks.drain(..).collect()
        };
        for task in tasks {
            task.await;
        }

        if !self.opts.stop_gracefully {
            self.state.abort_sessions();
        }
        self.drain_sessions().await;

        #[cfg(unix)]
        self.reap_children().await;
    }

    /// Waits until the server is fully stopped: listeners gone, workers
    /// reaped, sessions drained. Blocks until something else initiates
    /// the shutdown.
    pub async fn join(&self) {
        let tasks: Vec<_> = {
            let mut inner = self.inner.lock().expect("server lock");
            inner.listener_tasks.drain(..).collect()
        };
        for task in tasks {
            task.await;
        }
        #[cfg(unix)]
        self.reap_children().await;
        self.drain_sessions().await;
    }

    async fn drain_sessions(&self) {
        while self.state.connections() > 0 {
            task::sleep(Duration::from_millis(50)).await;
        }
    }

    #[cfg(unix)]
    async fn reap_children(&self) {
        let children: Vec<_> = {
            let mut inner = self.inner.lock().expect("server lock");
            inner.children.drain(..).collect()
        };
        for child in children {
            task::spawn_blocking(move || prefork::join_worker(child)).await;
        }
    }

    /// Connections currently held open.
    pub fn connections(&self) -> usize {
        self.state.connections()
    }

    /// Sessions currently holding a processing slot.
    pub fn processings(&self) -> usize {
        self.state.processings()
    }

    /// Forked worker processes supervised by this master.
    pub fn workers(&self) -> usize {
        #[cfg(unix)]
        {
            self.inner.lock().expect("server lock").children.len()
        }
        #[cfg(not(unix))]
        {
            0
        }
    }

    pub fn is_master(&self) -> bool {
        self.inner.lock().expect("server lock").role == Role::Master
    }

    pub fn is_worker(&self) -> bool {
        self.inner.lock().expect("server lock").role == Role::Worker
    }

    /// No more listener tasks - and on a master, no more workers either.
    pub fn stopped(&self) -> bool {
        let inner = self.inner.lock().expect("server lock");
        let no_listeners = inner.listener_tasks.is_empty();
        match inner.role {
            #[cfg(unix)]
            Role::Master => no_listeners && inner.children.is_empty(),
            _ => no_listeners,
        }
    }

    /// The addresses actually bound, useful with port 0.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner.lock().expect("server lock").bound.clone()
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    opts: Arc<SmtpServerOptions>,
    service: Arc<dyn MailService>,
    tls: Option<Arc<dyn TlsUpgrade>>,
) {
    enum Next {
        Conn(std::io::Result<(async_std::net::TcpStream, SocketAddr)>),
        Stop,
    }

    let stop_rx = state.stop_listener_rx();
    loop {
        if state.stop_accepting() {
            break;
        }
        let accept = async { Next::Conn(listener.accept().await) };
        let stopped = async {
            // the channel never carries data, it closes on stop
            let _ = stop_rx.recv().await;
            Next::Stop
        };
        match accept.race(stopped).await {
            Next::Stop => break,
            Next::Conn(Ok((stream, addr))) => {
                trace!("accepted {}", addr);
                task::spawn(session_worker::serve_session(
                    stream,
                    state.clone(),
                    opts.clone(),
                    service.clone(),
                    tls.clone(),
                ));
            }
            Next::Conn(Err(e)) => {
                if state.stop_accepting() {
                    break;
                }
                error!("accept failed: {}", e);
                task::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    trace!("listener {:?} closed", listener.local_addr());
}
