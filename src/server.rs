//! The event loop: one thread owning the listening socket, the epoll
//! instance, the connection table and the timer list.
//!
//! Connection sockets are registered one-shot, so a readiness event claims
//! the connection until the loop re-arms it. Reactor dispatches block on
//! the task's [`Completion`] before re-arming; proactor dispatches return
//! immediately and the verdicts come back through an eventfd-backed
//! [`VerdictQueue`] drained here. Either way every epoll and timer
//! mutation stays on this thread.

use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::config::{Discipline, ServerConfig};
use crate::conn::{HttpConnection, WriteOutcome};
use crate::error::{ServerError, ServerResult};
use crate::pool::{Completion, Reply, Task, TaskOp, TaskOutcome, VerdictQueue, WorkerPool};
use crate::store::{CredentialStore, StorePool, lock_unpoisoned};
use crate::syscalls::{
    self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, Epoll, SIGALRM, SIGINT, SIGTERM,
    epoll_event,
};
use crate::table::{ConnId, ConnectionTable};
use crate::timer::TimerList;

const MAX_EVENTS: usize = 10_000;

/// Tokens for the non-connection descriptors. Connection tokens are
/// packed `ConnId`s and can never reach these values at any real capacity.
const LISTEN_TOKEN: u64 = u64::MAX;
const SIGNAL_TOKEN: u64 = u64::MAX - 1;
const VERDICT_TOKEN: u64 = u64::MAX - 2;

/// Sent to a peer refused because the connection table is full.
const BUSY_REPLY: &[u8] = b"Internal server busy";

pub struct Server {
    config: Arc<ServerConfig>,
    epoll: Epoll,
    listen_fd: RawFd,
    port: u16,
    sig_read_fd: RawFd,
    sig_write_fd: RawFd,
    verdict_fd: RawFd,
    verdicts: Arc<VerdictQueue>,
    table: ConnectionTable,
    timers: TimerList,
    pool: WorkerPool,
    listen_et: bool,
    conn_et: bool,
    started: Instant,
    stop: bool,
    tick_pending: bool,
}

impl Server {
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let (listen_et, conn_et) = config.trigger_modes();

        let store = match &config.credentials {
            Some(path) => CredentialStore::load(path)?,
            None => CredentialStore::new(),
        };
        let stores = Arc::new(StorePool::new(config.store_pool, Arc::new(store)));
        let pool = WorkerPool::new(&config, stores)?;

        let listen_fd = syscalls::create_listen_socket(config.port, config.opt_linger)?;
        let port = syscalls::local_port(listen_fd)?;

        let epoll = Epoll::new()?;
        epoll.add(listen_fd, LISTEN_TOKEN, EPOLLIN | EPOLLRDHUP, listen_et, false)?;

        let (sig_read_fd, sig_write_fd) = syscalls::create_signal_socketpair()?;
        epoll.add(sig_read_fd, SIGNAL_TOKEN, EPOLLIN, false, false)?;
        syscalls::install_signal_handlers(sig_write_fd)?;

        let verdict_fd = syscalls::create_eventfd()?;
        epoll.add(verdict_fd, VERDICT_TOKEN, EPOLLIN, false, false)?;
        let verdicts = Arc::new(VerdictQueue::new(verdict_fd));

        let table = ConnectionTable::new(config.max_connections, config.clone());

        Ok(Self {
            config,
            epoll,
            listen_fd,
            port,
            sig_read_fd,
            sig_write_fd,
            verdict_fd,
            verdicts,
            table,
            timers: TimerList::new(),
            pool,
            listen_et,
            conn_et,
            started: Instant::now(),
            stop: false,
            tick_pending: false,
        })
    }

    /// The bound port; differs from the configured one when binding port 0.
    pub fn port(&self) -> u16 {
        self.port
    }

    fn now(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Block on readiness events until a termination signal arrives.
    pub fn run(&mut self) -> ServerResult<()> {
        info!(
            port = self.port,
            workers = self.config.workers,
            discipline = ?self.config.discipline,
            trig_mode = self.config.trig_mode,
            "listening"
        );
        syscalls::arm_alarm(self.config.tick_secs as u32);

        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        while !self.stop {
            let n = self.epoll.wait(&mut events, -1)?;
            for event in &events[..n] {
                match event.u64 {
                    LISTEN_TOKEN => self.accept_burst(),
                    SIGNAL_TOKEN => self.drain_signals()?,
                    VERDICT_TOKEN => self.apply_verdicts(),
                    token => {
                        let id = ConnId::from_token(token);
                        let flags = event.events as i32;
                        if flags & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0 {
                            self.teardown(id);
                        } else if flags & EPOLLIN != 0 {
                            self.handle_readable(id);
                        } else if flags & EPOLLOUT != 0 {
                            self.handle_writable(id);
                        }
                    }
                }
            }
            // Eviction runs after the batch so fresh activity wins over the
            // pending tick.
            if self.tick_pending {
                self.tick_pending = false;
                self.run_tick();
            }
        }
        info!("server stopped");
        Ok(())
    }

    // ---- Accept path ----

    fn accept_burst(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => self.admit(fd, peer),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
            // Level-triggered listen accepts one per readiness event.
            if !self.listen_et {
                break;
            }
        }
    }

    fn admit(&mut self, fd: RawFd, peer: std::net::SocketAddr) {
        let Some(id) = self.table.allocate(fd) else {
            warn!(%peer, live = self.table.live(), "connection table full, refusing");
            let _ = syscalls::send(fd, BUSY_REPLY);
            syscalls::close_fd(fd);
            return;
        };

        if let Some(conn) = self.table.conn(id) {
            lock_unpoisoned(conn).init(fd, peer, self.conn_et);
        }

        let handle = self.timers.add(self.now() + self.config.idle_deadline(), id);
        self.table.set_timer(id, Some(handle));

        if let Err(e) = self
            .epoll
            .add(fd, id.token(), EPOLLIN | EPOLLRDHUP, self.conn_et, true)
        {
            error!(error = %e, fd, "failed to register connection");
            self.teardown(id);
            return;
        }
        debug!(%peer, fd, "accepted connection");
    }

    // ---- Signal path ----

    /// Pull queued signal bytes off the bridge. A drained-empty or closed
    /// channel means the bridge is broken and the server cannot continue.
    fn drain_signals(&mut self) -> ServerResult<()> {
        let mut buf = [0u8; 1024];
        match syscalls::recv(self.sig_read_fd, &mut buf) {
            Ok(0) => Err(ServerError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "signal channel closed",
            ))),
            Ok(n) => {
                for &byte in &buf[..n] {
                    match i32::from(byte) {
                        SIGALRM => self.tick_pending = true,
                        SIGTERM | SIGINT => {
                            info!(signal = byte, "termination signal");
                            self.stop = true;
                        }
                        _ => {}
                    }
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(ServerError::Io(e)),
        }
    }

    // ---- Connection events ----

    fn handle_readable(&mut self, id: ConnId) {
        let Some(conn) = self.table.conn(id).cloned() else {
            return;
        };
        self.refresh_timer(id);

        match self.config.discipline {
            Discipline::Reactor => self.dispatch(id, conn, TaskOp::ReadAndProcess),
            Discipline::Proactor => {
                // The loop performs the read; workers only parse and respond.
                let drained = lock_unpoisoned(&conn).read_once();
                if !drained {
                    self.teardown(id);
                    return;
                }
                self.dispatch(id, conn, TaskOp::Process);
            }
        }
    }

    fn handle_writable(&mut self, id: ConnId) {
        let Some(conn) = self.table.conn(id).cloned() else {
            return;
        };
        self.refresh_timer(id);

        match self.config.discipline {
            Discipline::Reactor => self.dispatch(id, conn, TaskOp::Write),
            Discipline::Proactor => {
                let outcome = lock_unpoisoned(&conn).write();
                match outcome {
                    WriteOutcome::Again => self.rearm(id, EPOLLOUT),
                    WriteOutcome::Done { keep_alive: true } => self.rearm(id, EPOLLIN),
                    WriteOutcome::Done { keep_alive: false } | WriteOutcome::Error => {
                        self.teardown(id)
                    }
                }
            }
        }
    }

    /// Hand a task to the pool. Under the reactor discipline the loop
    /// blocks until the worker posts its verdict, since the worker owns the
    /// socket meanwhile; under the proactor discipline dispatch returns at
    /// once and the verdict arrives through the eventfd queue, so tasks
    /// pile up across the pool. A full queue sheds the connection rather
    /// than stalling the loop.
    fn dispatch(&mut self, id: ConnId, conn: Arc<Mutex<HttpConnection>>, op: TaskOp) {
        let (reply, handshake) = match self.config.discipline {
            Discipline::Reactor => {
                let completion = Arc::new(Completion::new());
                (Reply::Handshake(completion.clone()), Some(completion))
            }
            Discipline::Proactor => (Reply::Queued(self.verdicts.clone()), None),
        };
        let task = Task {
            op,
            conn_id: id,
            conn,
            reply,
        };
        if let Err(e) = self.pool.dispatch(task) {
            warn!(error = %e, "task queue full, shedding connection");
            self.teardown(id);
            return;
        }
        if let Some(completion) = handshake {
            let outcome = completion.wait();
            self.apply(id, outcome);
        }
    }

    /// Drain the eventfd, then apply every queued worker verdict. Stale
    /// identifiers (the connection was evicted while its task ran) fall
    /// through the generation check and are ignored.
    fn apply_verdicts(&mut self) {
        syscalls::drain_event(self.verdict_fd);
        for (id, outcome) in self.verdicts.drain() {
            self.apply(id, outcome);
        }
    }

    fn apply(&mut self, id: ConnId, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::AwaitReadable => self.rearm(id, EPOLLIN),
            TaskOutcome::AwaitWritable => self.rearm(id, EPOLLOUT),
            TaskOutcome::Teardown => self.teardown(id),
        }
    }

    /// Reset the one-shot registration with the next interest.
    fn rearm(&mut self, id: ConnId, interest: i32) {
        let Some(fd) = self.table.fd(id) else {
            return;
        };
        if let Err(e) = self
            .epoll
            .modify(fd, id.token(), interest | EPOLLRDHUP, self.conn_et, true)
        {
            error!(error = %e, fd, "failed to re-arm connection");
            self.teardown(id);
        }
    }

    fn refresh_timer(&mut self, id: ConnId) {
        if let Some(handle) = self.table.timer(id) {
            self.timers
                .adjust(handle, self.now() + self.config.idle_deadline());
        }
    }

    /// Unregister, close and recycle. Safe to call with a stale identifier.
    fn teardown(&mut self, id: ConnId) {
        let Some(fd) = self.table.fd(id) else {
            return;
        };
        if let Some(handle) = self.table.timer(id) {
            self.timers.del(handle);
        }
        if let Err(e) = self.epoll.delete(fd) {
            warn!(error = %e, fd, "epoll deregistration failed");
        }
        syscalls::close_fd(fd);
        self.table.free(id);
        debug!(fd, "connection closed");
    }

    // ---- Timer tick ----

    fn run_tick(&mut self) {
        let now = self.now();
        let expired = self.timers.tick(now);
        for id in expired {
            // The tick already released the record; clear the slot's handle
            // so teardown does not touch a recycled one.
            self.table.set_timer(id, None);
            info!(fd = self.table.fd(id), "evicting idle connection");
            self.teardown(id);
        }
        syscalls::arm_alarm(self.config.tick_secs as u32);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        syscalls::close_fd(self.listen_fd);
        syscalls::close_fd(self.sig_read_fd);
        syscalls::close_fd(self.sig_write_fd);
        syscalls::close_fd(self.verdict_fd);
    }
}
