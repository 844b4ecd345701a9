//! Connection handling on the reactor thread.
//!
//! `HttpHost` owns every connection and every request. Requests are
//! admitted into a `RequestTable` whose payload is the connection slot,
//! so a late worker for a connection that already went away is caught as
//! stale when its handle comes back.

use crate::http::{self, MAX_HEAD};

use handoff_core::handle::{HandleValue, RequestHandle};
use handoff_core::host::{HandlerStatus, HostError, RequestHost, Response};
use handoff_core::mux::{Callback, Interest, Readiness, Registrar, Token, Trigger};
use handoff_core::worker::TaskSpawner;
use handoff_executor::DeferContext;
use handoff_module::RequestTable;

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::mem;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

pub type Ctx = DeferContext<Box<dyn TaskSpawner>>;

const READ_CHUNK: usize = 4096;
/// Unparsed input a connection may hold, pipelined requests included.
const MAX_RECV: usize = 4 * MAX_HEAD;

pub const HELLO_BODY: &[u8] = b"Hello from handoff!\n";

// ── Connection state ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fill {
    /// Drained to would-block; more may come.
    Open,
    Eof,
    /// `recv` passed `MAX_RECV`.
    Overflow,
}

struct Conn {
    stream: TcpStream,
    token: Option<Token>,
    recv: Vec<u8>,
    send: Vec<u8>,
    send_off: usize,
    /// Request currently parked on a worker.
    in_flight: Option<HandleValue>,
    keep_alive: bool,
    /// Close once `send` is flushed.
    closing: bool,
}

impl Conn {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            token: None,
            recv: Vec::with_capacity(READ_CHUNK),
            send: Vec::new(),
            send_off: 0,
            in_flight: None,
            keep_alive: true,
            closing: false,
        }
    }

    /// Read everything available, up to `MAX_RECV` buffered bytes.
    fn fill(&mut self) -> io::Result<Fill> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(Fill::Eof),
                Ok(n) => {
                    self.recv.extend_from_slice(&buf[..n]);
                    if self.recv.len() > MAX_RECV {
                        return Ok(Fill::Overflow);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::Open),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write as much as the socket takes. `Ok(true)` once drained.
    fn flush(&mut self) -> io::Result<bool> {
        while self.send_off < self.send.len() {
            match self.stream.write(&self.send[self.send_off..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.send_off += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.send.clear();
        self.send_off = 0;
        Ok(true)
    }

    fn idle(&self) -> bool {
        self.in_flight.is_none() && self.send.is_empty()
    }
}

struct ConnSlab {
    slots: Vec<Option<Conn>>,
    free: Vec<usize>,
}

impl ConnSlab {
    fn new(max: usize) -> Self {
        Self {
            slots: (0..max).map(|_| None).collect(),
            free: (0..max).rev().collect(),
        }
    }

    fn alloc(&mut self, conn: Conn) -> Option<usize> {
        let idx = self.free.pop()?;
        self.slots[idx] = Some(conn);
        Some(idx)
    }

    fn get_mut(&mut self, idx: usize) -> Option<&mut Conn> {
        self.slots.get_mut(idx)?.as_mut()
    }

    fn remove(&mut self, idx: usize) -> Option<Conn> {
        let conn = self.slots.get_mut(idx)?.take()?;
        self.free.push(idx);
        Some(conn)
    }

    fn active(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

// ── Stats ──

#[derive(Debug, Default)]
pub struct Stats {
    accepts: u64,
    requests: u64,
    deferred: u64,
    inline: u64,
    rejected: u64,
    responses: u64,
    cancelled: u64,
    errors: u64,
}

// ── Host ──

pub struct HttpHost {
    requests: RequestTable<usize>,
    conns: ConnSlab,
    stats: Stats,
    want_write: Vec<usize>,
    backlog: Vec<usize>,
    closing: Vec<usize>,
}

impl HttpHost {
    pub fn new(max_conns: usize) -> Self {
        Self {
            requests: RequestTable::new(),
            conns: ConnSlab::new(max_conns),
            stats: Stats::default(),
            want_write: Vec::new(),
            backlog: Vec::new(),
            closing: Vec::new(),
        }
    }

    pub fn log_stats(&self, overdue_after: Duration) {
        let overdue = self.requests.overdue(overdue_after);
        let s = &self.stats;
        tracing::info!(
            conns = self.conns.active(),
            accepts = s.accepts,
            requests = s.requests,
            deferred = s.deferred,
            inline = s.inline,
            rejected = s.rejected,
            responses = s.responses,
            cancelled = s.cancelled,
            errors = s.errors,
            waiting = self.requests.deferred(),
            overdue = overdue.len(),
            "stats"
        );
        for (handle, waited) in overdue {
            tracing::warn!(%handle, ?waited, "deferred request overdue");
        }
    }

    /// Queue bytes for `idx` and try to send them right away.
    fn queue(&mut self, idx: usize, bytes: &[u8]) {
        let Some(conn) = self.conns.get_mut(idx) else {
            return;
        };
        conn.send.extend_from_slice(bytes);
        match conn.flush() {
            Ok(true) if conn.closing => self.closing.push(idx),
            Ok(true) => self.backlog.push(idx),
            Ok(false) => self.want_write.push(idx),
            Err(e) => {
                tracing::debug!(conn = idx, error = %e, "send failed");
                self.stats.errors += 1;
                self.closing.push(idx);
            }
        }
    }

    /// Parse the next request on `idx` and either answer it or defer it.
    fn dispatch(&mut self, ctx: &Ctx, idx: usize, delay: Duration) {
        let Some(conn) = self.conns.get_mut(idx) else {
            return;
        };
        if !conn.idle() || conn.closing {
            return;
        }
        let Some(head) = http::parse_request(&conn.recv) else {
            if conn.recv.len() > MAX_HEAD {
                conn.keep_alive = false;
                conn.recv.clear();
                self.answer_inline(idx, Response::text(431, "request head too large\n"));
            }
            return;
        };
        conn.recv.drain(..head.len);
        conn.keep_alive = head.keep_alive;
        self.stats.requests += 1;

        if head.method != "GET" {
            self.answer_inline(idx, Response::text(405, "GET only\n"));
            return;
        }
        if head.path == "/now" {
            self.answer_inline(idx, Response::text(200, HELLO_BODY));
            return;
        }

        let handle = self.requests.admit(idx);
        let value = handle.value();
        match ctx.defer(&mut *self, handle, move || thread::sleep(delay)) {
            Ok(HandlerStatus::Deferred) => {
                if let Some(conn) = self.conns.get_mut(idx) {
                    conn.in_flight = Some(value);
                }
                self.stats.deferred += 1;
            }
            Ok(HandlerStatus::Done) => {}
            Err(rejected) => {
                tracing::warn!(conn = idx, error = %rejected.error, "answering inline");
                self.stats.rejected += 1;
                if let Err(e) = self.finalize(rejected.handle, Response::text(503, "busy\n")) {
                    tracing::warn!(conn = idx, error = %e, "inline answer failed");
                }
            }
        }
    }

    fn answer_inline(&mut self, idx: usize, response: Response) {
        let handle = self.requests.admit(idx);
        self.stats.inline += 1;
        if let Err(e) = self.finalize(handle, response) {
            tracing::warn!(conn = idx, error = %e, "inline answer failed");
        }
    }

    fn close_conn(&mut self, reg: &mut dyn Registrar, idx: usize) {
        let Some(conn) = self.conns.remove(idx) else {
            return;
        };
        if let Some(token) = conn.token {
            if let Err(e) = reg.deregister(token) {
                tracing::warn!(conn = idx, error = %e, "deregister failed");
            }
        }
        if let Some(value) = conn.in_flight {
            if self.requests.cancel(value).is_some() {
                self.stats.cancelled += 1;
                tracing::debug!(handle = %value, "client gone, deferred request cancelled");
            }
        }
        tracing::trace!(conn = idx, "closed");
    }

    fn on_conn_event(
        &mut self,
        reg: &mut dyn Registrar,
        ctx: &Ctx,
        idx: usize,
        token: Token,
        readiness: Readiness,
        delay: Duration,
    ) {
        let Some(conn) = self.conns.get_mut(idx) else {
            return;
        };

        if readiness.error {
            self.closing.push(idx);
        } else {
            if readiness.writable && !conn.send.is_empty() {
                match conn.flush() {
                    Ok(true) => {
                        if let Err(e) = reg.reregister(token, Interest::READABLE) {
                            tracing::warn!(conn = idx, error = %e, "reregister failed");
                        }
                        if conn.closing {
                            self.closing.push(idx);
                        } else {
                            self.backlog.push(idx);
                        }
                    }
                    Ok(false) => {}
                    Err(_) => {
                        self.stats.errors += 1;
                        self.closing.push(idx);
                    }
                }
            }
            if readiness.readable || readiness.hangup {
                self.on_readable(ctx, idx, delay);
            }
        }

        self.service_queues(reg, ctx, delay);
    }

    fn on_readable(&mut self, ctx: &Ctx, idx: usize, delay: Duration) {
        let Some(conn) = self.conns.get_mut(idx) else {
            return;
        };
        match conn.fill() {
            Ok(Fill::Open) => self.dispatch(ctx, idx, delay),
            Ok(Fill::Overflow) => {
                tracing::warn!(conn = idx, buffered = conn.recv.len(), "client over input limit, closing");
                self.stats.errors += 1;
                self.closing.push(idx);
            }
            Ok(Fill::Eof) => {
                // Peer done sending: answer what it sent, then close.
                self.dispatch(ctx, idx, delay);
                match self.conns.get_mut(idx) {
                    Some(conn) if !conn.idle() => conn.closing = true,
                    Some(_) => self.closing.push(idx),
                    None => {}
                }
            }
            Err(e) => {
                tracing::debug!(conn = idx, error = %e, "recv failed");
                self.stats.errors += 1;
                self.closing.push(idx);
            }
        }
    }

    /// Apply work queued by callbacks that had no registrar at hand
    /// (finalize runs inside the resume path).
    pub fn service_queues(&mut self, reg: &mut dyn Registrar, ctx: &Ctx, delay: Duration) {
        loop {
            let closing = mem::take(&mut self.closing);
            let writes = mem::take(&mut self.want_write);
            let backlog = mem::take(&mut self.backlog);
            if closing.is_empty() && writes.is_empty() && backlog.is_empty() {
                return;
            }
            for idx in closing {
                self.close_conn(reg, idx);
            }
            for idx in writes {
                let Some(token) = self.conns.get_mut(idx).and_then(|c| c.token) else {
                    continue;
                };
                if let Err(e) = reg.reregister(token, Interest::BOTH) {
                    tracing::warn!(conn = idx, error = %e, "reregister failed");
                    self.closing.push(idx);
                }
            }
            for idx in backlog {
                self.dispatch(ctx, idx, delay);
            }
        }
    }
}

impl RequestHost for HttpHost {
    fn suspend(&mut self, handle: &RequestHandle) -> Result<(), HostError> {
        self.requests.suspend(handle)
    }

    fn reclaim(&mut self, value: HandleValue) -> Option<RequestHandle> {
        self.requests.reclaim(value)
    }

    fn finalize(&mut self, handle: RequestHandle, response: Response) -> Result<(), HostError> {
        let value = handle.value();
        let (idx, elapsed) = self.requests.retire(handle)?;
        let Some(conn) = self.conns.get_mut(idx) else {
            return Err(HostError::Gone(value));
        };
        conn.in_flight = None;
        if !conn.keep_alive {
            conn.closing = true;
        }
        let bytes = http::encode_response(&response, conn.keep_alive);
        self.stats.responses += 1;
        tracing::debug!(handle = %value, conn = idx, status = response.status, ?elapsed, "response");
        self.queue(idx, &bytes);
        Ok(())
    }
}

// ── Callbacks ──

fn conn_callback(host: Rc<RefCell<HttpHost>>, ctx: Rc<Ctx>, idx: usize, delay: Duration) -> Callback {
    Box::new(move |reg: &mut dyn Registrar, token: Token, readiness: Readiness| {
        host.borrow_mut()
            .on_conn_event(reg, &ctx, idx, token, readiness, delay);
    })
}

/// Callback for the listening socket: accept until would-block and
/// register each connection.
pub fn accept_callback(
    listener: TcpListener,
    host: Rc<RefCell<HttpHost>>,
    ctx: Rc<Ctx>,
    delay: Duration,
) -> Callback {
    Box::new(move |reg: &mut dyn Registrar, _: Token, _: Readiness| loop {
        let stream = match listener.accept() {
            Ok((stream, _peer)) => stream,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                return;
            }
        };
        if let Err(e) = stream.set_nonblocking(true) {
            tracing::warn!(error = %e, "set_nonblocking failed");
            continue;
        }
        let _ = stream.set_nodelay(true);
        let fd = stream.as_raw_fd();

        let idx = {
            let mut h = host.borrow_mut();
            h.stats.accepts += 1;
            match h.conns.alloc(Conn::new(stream)) {
                Some(idx) => idx,
                None => {
                    tracing::warn!("connection table full, dropping client");
                    continue;
                }
            }
        };

        let callback = conn_callback(Rc::clone(&host), Rc::clone(&ctx), idx, delay);
        match reg.register(fd, Interest::READABLE, Trigger::Edge, callback) {
            Ok(token) => {
                if let Some(conn) = host.borrow_mut().conns.get_mut(idx) {
                    conn.token = Some(token);
                }
            }
            Err(e) => {
                tracing::warn!(fd, error = %e, "connection registration failed");
                host.borrow_mut().conns.remove(idx);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn connected() -> (TcpStream, Conn) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, Conn::new(server))
    }

    /// Call `fill` until it reports something other than `Open`.
    fn fill_until_settled(conn: &mut Conn) -> Fill {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match conn.fill().unwrap() {
                Fill::Open if Instant::now() < deadline => thread::sleep(Duration::from_millis(2)),
                other => return other,
            }
        }
    }

    #[test]
    fn fill_stops_at_input_limit() {
        let (client, mut conn) = connected();
        let writer = thread::spawn(move || {
            let mut client = client;
            // Ignore errors: the reader may stop before everything is sent.
            let _ = client.write_all(&vec![b'a'; MAX_RECV + 2 * READ_CHUNK]);
            client
        });

        assert_eq!(fill_until_settled(&mut conn), Fill::Overflow);
        assert!(conn.recv.len() > MAX_RECV);
        assert!(conn.recv.len() <= MAX_RECV + READ_CHUNK);
        drop(conn);
        drop(writer.join().unwrap());
    }

    #[test]
    fn fill_reports_eof() {
        let (mut client, mut conn) = connected();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        drop(client);
        assert_eq!(fill_until_settled(&mut conn), Fill::Eof);
        assert!(http::parse_request(&conn.recv).is_some());
    }
}
