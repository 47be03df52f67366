//! Per-connection HTTP/1.1 parse/response state machine.
//!
//! A connection owns fixed read/write buffers and advances through
//! `RequestLine → Header → Content` as lines become available. Responses
//! are assembled into the write buffer; file bodies ride along as a
//! memory-mapped second segment of a vectored write.

use std::fs::File;
use std::io::{self, Write as _};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::RawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path};
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::http::{
    self, DEFAULT_LANDING, EMPTY_FILE_BODY, ERROR_400_FORM, ERROR_403_FORM, ERROR_404_FORM,
    ERROR_500_FORM, HttpCode, LOGIN_CHECK_CODE, LOGIN_FAIL_PAGE, LOGIN_OK_PAGE, Method,
    REGISTER_CHECK_CODE, REGISTER_FAIL_PAGE, REGISTER_OK_PAGE,
};
use crate::store::StoreConn;
use crate::syscalls::{self, MappedFile};

pub const READ_BUFFER_SIZE: usize = 2048;
pub const WRITE_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckState {
    RequestLine,
    Header,
    Content,
}

/// Line-scanner verdict: a complete line, a partial line awaiting more
/// data, or a malformed terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineStatus {
    /// Complete line; carries the byte range of its content, terminator
    /// excluded.
    Complete(usize, usize),
    Open,
    Bad,
}

/// What the event loop should do with the connection after protocol work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Request still incomplete; wait for more readable data.
    NeedMore,
    /// Response assembled; wait for writable readiness.
    ResponseReady,
    /// Unrecoverable; tear the connection down.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Partial progress, kernel buffer full; re-arm write interest.
    Again,
    /// Response fully drained.
    Done { keep_alive: bool },
    Error,
}

pub struct HttpConnection {
    config: Arc<ServerConfig>,
    fd: RawFd,
    peer: SocketAddr,
    edge_triggered: bool,

    rx: RecvBuffer,
    check_state: CheckState,
    method: Method,
    target: String,
    host: Option<String>,
    content_length: usize,
    linger: bool,
    /// Byte range of the request body within the receive buffer.
    body: (usize, usize),

    write_buf: [u8; WRITE_BUFFER_SIZE],
    write_idx: usize,
    bytes_to_send: usize,
    bytes_have_send: usize,
    file: Option<MappedFile>,
}

fn unspecified_peer() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}

/// Receive-side cursor over the fixed input buffer. Owns the high-water
/// mark and the delimiter-scan position, so no caller ever computes raw
/// offsets. The scan cursor never retreats; a line handed out by
/// [`RecvBuffer::next_line`] is consumed.
struct RecvBuffer {
    buf: [u8; READ_BUFFER_SIZE],
    /// High-water mark of buffered input.
    filled: usize,
    /// Delimiter-scan cursor; everything before it has been consumed.
    scanned: usize,
    /// Start of the line currently being scanned.
    line_start: usize,
}

impl RecvBuffer {
    fn new() -> Self {
        Self {
            buf: [0; READ_BUFFER_SIZE],
            filled: 0,
            scanned: 0,
            line_start: 0,
        }
    }

    fn reset(&mut self) {
        self.filled = 0;
        self.scanned = 0;
        self.line_start = 0;
    }

    fn is_full(&self) -> bool {
        self.filled >= READ_BUFFER_SIZE
    }

    /// Append raw bytes; fails when the fixed buffer would overflow.
    fn feed(&mut self, bytes: &[u8]) -> bool {
        if self.filled + bytes.len() > READ_BUFFER_SIZE {
            return false;
        }
        self.buf[self.filled..self.filled + bytes.len()].copy_from_slice(bytes);
        self.filled += bytes.len();
        true
    }

    /// One bounded read off the socket into the remaining capacity.
    fn recv_from(&mut self, fd: RawFd) -> io::Result<usize> {
        let n = syscalls::recv(fd, &mut self.buf[self.filled..])?;
        self.filled += n;
        Ok(n)
    }

    /// Find and consume the next line. CRLF and bare LF both end a line; a
    /// CR at the end of buffered data means the line is still open; a CR
    /// followed by anything but LF is malformed.
    fn next_line(&mut self) -> LineStatus {
        while self.scanned < self.filled {
            match self.buf[self.scanned] {
                b'\r' => {
                    if self.scanned + 1 == self.filled {
                        return LineStatus::Open;
                    }
                    if self.buf[self.scanned + 1] == b'\n' {
                        let (start, end) = (self.line_start, self.scanned);
                        self.scanned += 2;
                        self.line_start = self.scanned;
                        return LineStatus::Complete(start, end);
                    }
                    return LineStatus::Bad;
                }
                b'\n' => {
                    let (start, end) = (self.line_start, self.scanned);
                    self.scanned += 1;
                    self.line_start = self.scanned;
                    return LineStatus::Complete(start, end);
                }
                _ => self.scanned += 1,
            }
        }
        LineStatus::Open
    }

    /// The body starts at the scan cursor once the blank header line has
    /// been consumed.
    fn body_complete(&self, content_length: usize) -> bool {
        self.filled >= self.scanned + content_length
    }

    fn body_range(&self, content_length: usize) -> (usize, usize) {
        (self.scanned, self.scanned + content_length)
    }

    fn slice(&self, start: usize, end: usize) -> &[u8] {
        &self.buf[start..end]
    }

    fn get(&self, start: usize, end: usize) -> Option<&[u8]> {
        self.buf.get(start..end)
    }
}

impl HttpConnection {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            config,
            fd: -1,
            peer: unspecified_peer(),
            edge_triggered: false,
            rx: RecvBuffer::new(),
            check_state: CheckState::RequestLine,
            method: Method::Get,
            target: String::new(),
            host: None,
            content_length: 0,
            linger: false,
            body: (0, 0),
            write_buf: [0; WRITE_BUFFER_SIZE],
            write_idx: 0,
            bytes_to_send: 0,
            bytes_have_send: 0,
            file: None,
        }
    }

    /// Bind a freshly accepted socket to this slot.
    pub fn init(&mut self, fd: RawFd, peer: SocketAddr, edge_triggered: bool) {
        self.fd = fd;
        self.peer = peer;
        self.edge_triggered = edge_triggered;
        self.reinit();
    }

    /// Reset protocol state for the next request on a kept-alive socket.
    pub fn reinit(&mut self) {
        self.rx.reset();
        self.check_state = CheckState::RequestLine;
        self.method = Method::Get;
        self.target.clear();
        self.host = None;
        self.content_length = 0;
        self.linger = false;
        self.body = (0, 0);
        self.write_idx = 0;
        self.bytes_to_send = 0;
        self.bytes_have_send = 0;
        self.file = None;
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn keep_alive(&self) -> bool {
        self.linger
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// True while a declared body has not fully arrived.
    pub fn awaiting_body(&self) -> bool {
        self.check_state == CheckState::Content
    }

    /// The response head assembled so far (status line + headers + any
    /// inline body).
    pub fn response_head(&self) -> &[u8] {
        &self.write_buf[..self.write_idx]
    }

    pub fn file_len(&self) -> Option<usize> {
        self.file.as_ref().map(MappedFile::len)
    }

    /// Buffer raw request bytes without a socket, as a read would. Fails
    /// when the fixed buffer would overflow.
    pub fn feed(&mut self, bytes: &[u8]) -> bool {
        self.rx.feed(bytes)
    }

    // ---- Reading ----

    /// Drain the socket into the read buffer. Level-triggered mode performs
    /// one bounded read; edge-triggered mode loops until would-block.
    /// Returns false on EOF, error, or buffer overflow.
    pub fn read_once(&mut self) -> bool {
        if self.rx.is_full() {
            return false;
        }

        if !self.edge_triggered {
            match self.rx.recv_from(self.fd) {
                Ok(0) => false,
                Ok(_) => true,
                Err(_) => false,
            }
        } else {
            loop {
                if self.rx.is_full() {
                    // Request larger than the fixed buffer.
                    return false;
                }
                match self.rx.recv_from(self.fd) {
                    Ok(0) => return false,
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                    Err(_) => return false,
                }
            }
        }
    }

    // ---- Parsing ----

    fn parse_request_line(&mut self, start: usize, end: usize) -> HttpCode {
        let Ok(line) = std::str::from_utf8(self.rx.slice(start, end)) else {
            return HttpCode::BadRequest;
        };
        let line = line.to_owned();
        let mut parts = line.split_ascii_whitespace();
        let (Some(method), Some(target), Some(version)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return HttpCode::BadRequest;
        };
        if parts.next().is_some() {
            return HttpCode::BadRequest;
        }

        let Some(method) = Method::from_token(method) else {
            return HttpCode::BadRequest;
        };
        self.method = method;

        if !version.eq_ignore_ascii_case("HTTP/1.1") {
            return HttpCode::BadRequest;
        }

        // An absolute-form target is reduced to its path component.
        let mut target = target.to_string();
        for scheme in ["http://", "https://"] {
            let matches = target
                .get(..scheme.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme));
            if matches {
                match target[scheme.len()..].find('/') {
                    Some(slash) => target = target[scheme.len() + slash..].to_string(),
                    None => return HttpCode::BadRequest,
                }
                break;
            }
        }
        if !target.starts_with('/') {
            return HttpCode::BadRequest;
        }
        if target == "/" {
            target = DEFAULT_LANDING.to_string();
        }
        self.target = target;
        self.check_state = CheckState::Header;
        HttpCode::NoRequest
    }

    fn parse_header(&mut self, start: usize, end: usize) -> HttpCode {
        if start == end {
            // Blank line ends the header phase.
            if self.content_length != 0 {
                self.check_state = CheckState::Content;
                return HttpCode::NoRequest;
            }
            return HttpCode::GetRequest;
        }

        let Ok(line) = std::str::from_utf8(self.rx.slice(start, end)) else {
            info!(peer = %self.peer, "ignoring non-UTF-8 header line");
            return HttpCode::NoRequest;
        };
        let line = line.to_owned();
        match line.split_once(':') {
            Some((key, value)) => {
                let value = value.trim_start_matches([' ', '\t']);
                if key.eq_ignore_ascii_case("Connection") {
                    if value.eq_ignore_ascii_case("keep-alive") {
                        self.linger = true;
                    }
                } else if key.eq_ignore_ascii_case("Content-Length") {
                    self.content_length = value.parse().unwrap_or(0);
                } else if key.eq_ignore_ascii_case("Host") {
                    self.host = Some(value.to_string());
                } else {
                    info!(header = %line, "ignoring unrecognized header");
                }
            }
            None => info!(header = %line, "ignoring malformed header"),
        }
        HttpCode::NoRequest
    }

    /// Advance the state machine over everything buffered so far.
    pub fn process_read(&mut self) -> HttpCode {
        loop {
            match self.check_state {
                CheckState::Content => {
                    // Complete once the bytes buffered past the body start
                    // reach the declared length.
                    if self.rx.body_complete(self.content_length) {
                        self.body = self.rx.body_range(self.content_length);
                        return HttpCode::GetRequest;
                    }
                    return HttpCode::NoRequest;
                }
                CheckState::RequestLine | CheckState::Header => match self.rx.next_line() {
                    LineStatus::Open => return HttpCode::NoRequest,
                    LineStatus::Bad => return HttpCode::BadRequest,
                    LineStatus::Complete(start, end) => {
                        let code = if self.check_state == CheckState::RequestLine {
                            self.parse_request_line(start, end)
                        } else {
                            self.parse_header(start, end)
                        };
                        if code != HttpCode::NoRequest {
                            return code;
                        }
                    }
                },
            }
        }
    }

    // ---- Resource resolution ----

    /// Tolerant form-urlencoded extraction of the `user`/`passwd` pair.
    fn form_credentials(&self) -> Option<(String, String)> {
        let (start, end) = self.body;
        let body = self.rx.get(start, end)?;
        let text = std::str::from_utf8(body).ok()?;

        let mut user = None;
        let mut passwd = None;
        for pair in text.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key {
                "user" => user = Some(value.to_string()),
                "passwd" => passwd = Some(value.to_string()),
                _ => {}
            }
        }
        Some((user?, passwd?))
    }

    /// Apply the path-code table: canned pages, and the POST-only
    /// login-check / register-check actions that rewrite the target to a
    /// success or failure page.
    fn route_target(&mut self, store: &StoreConn) {
        let Some(code) = http::path_code(&self.target) else {
            return;
        };

        if self.method == Method::Post
            && (code == LOGIN_CHECK_CODE || code == REGISTER_CHECK_CODE)
        {
            let page = match (code, self.form_credentials()) {
                (LOGIN_CHECK_CODE, Some((user, passwd))) => {
                    if store.lookup(&user).is_some_and(|stored| stored == passwd) {
                        LOGIN_OK_PAGE
                    } else {
                        LOGIN_FAIL_PAGE
                    }
                }
                (LOGIN_CHECK_CODE, None) => LOGIN_FAIL_PAGE,
                (_, Some((user, passwd))) => {
                    if store.insert(&user, &passwd).is_ok() {
                        debug!(user = %user, "registered new account");
                        REGISTER_OK_PAGE
                    } else {
                        REGISTER_FAIL_PAGE
                    }
                }
                (_, None) => REGISTER_FAIL_PAGE,
            };
            self.target = page.to_string();
            return;
        }

        if let Some(page) = http::canned_page(code) {
            self.target = page.to_string();
        }
    }

    /// Resolve the (possibly rewritten) target under the document root and
    /// map the file for transmission.
    pub fn do_request(&mut self, store: &StoreConn) -> HttpCode {
        self.route_target(store);

        let relative = self.target.trim_start_matches('/');
        // A parent-directory segment would resolve outside the document
        // root; reject it before touching the filesystem.
        if Path::new(relative)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return HttpCode::BadRequest;
        }
        let path = self.config.doc_root.join(relative);
        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(_) => return HttpCode::NoResource,
        };
        if meta.permissions().mode() & 0o004 == 0 {
            return HttpCode::ForbiddenRequest;
        }
        if meta.is_dir() {
            return HttpCode::BadRequest;
        }
        if meta.len() == 0 {
            // Zero-length files get a generated body, never a mapping.
            self.file = None;
            return HttpCode::FileRequest;
        }

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(_) => return HttpCode::NoResource,
        };
        match MappedFile::map(&file, meta.len() as usize) {
            Ok(map) => {
                self.file = Some(map);
                HttpCode::FileRequest
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "mmap failed");
                HttpCode::InternalError
            }
        }
    }

    // ---- Response assembly ----

    fn add_response(&mut self, args: std::fmt::Arguments<'_>) -> bool {
        if self.write_idx >= WRITE_BUFFER_SIZE {
            return false;
        }
        let mut cursor = io::Cursor::new(&mut self.write_buf[self.write_idx..]);
        if cursor.write_fmt(args).is_err() {
            return false;
        }
        self.write_idx += cursor.position() as usize;
        true
    }

    fn add_status_line(&mut self, status: u16) -> bool {
        self.add_response(format_args!(
            "HTTP/1.1 {} {}\r\n",
            status,
            http::status_title(status)
        ))
    }

    fn add_headers(&mut self, content_len: usize) -> bool {
        let connection = if self.linger { "keep-alive" } else { "close" };
        self.add_response(format_args!("Content-Length:{content_len}\r\n"))
            && self.add_response(format_args!("Connection:{connection}\r\n"))
            && self.add_response(format_args!("\r\n"))
    }

    fn add_content(&mut self, content: &str) -> bool {
        self.add_response(format_args!("{content}"))
    }

    /// Fill the write buffer for the given request outcome. Returns false
    /// when even the response does not fit, in which case the connection is
    /// torn down.
    pub fn process_write(&mut self, code: HttpCode) -> bool {
        let ok = match code {
            HttpCode::InternalError => {
                self.add_status_line(500)
                    && self.add_headers(ERROR_500_FORM.len())
                    && self.add_content(ERROR_500_FORM)
            }
            HttpCode::BadRequest => {
                self.add_status_line(400)
                    && self.add_headers(ERROR_400_FORM.len())
                    && self.add_content(ERROR_400_FORM)
            }
            HttpCode::NoResource => {
                self.add_status_line(404)
                    && self.add_headers(ERROR_404_FORM.len())
                    && self.add_content(ERROR_404_FORM)
            }
            HttpCode::ForbiddenRequest => {
                self.add_status_line(403)
                    && self.add_headers(ERROR_403_FORM.len())
                    && self.add_content(ERROR_403_FORM)
            }
            HttpCode::FileRequest => {
                if !self.add_status_line(200) {
                    return false;
                }
                if let Some(len) = self.file_len() {
                    if !self.add_headers(len) {
                        return false;
                    }
                    // Two segments: header buffer + mapped file span.
                    self.bytes_to_send = self.write_idx + len;
                    self.bytes_have_send = 0;
                    return true;
                }
                self.add_headers(EMPTY_FILE_BODY.len()) && self.add_content(EMPTY_FILE_BODY)
            }
            // NoRequest/GetRequest never reach response assembly.
            _ => false,
        };
        if !ok {
            return false;
        }
        self.bytes_to_send = self.write_idx;
        self.bytes_have_send = 0;
        true
    }

    fn unmap(&mut self) {
        self.file = None;
    }

    // ---- Writing ----

    /// Drain the pending response with vectored writes.
    pub fn write(&mut self) -> WriteOutcome {
        if self.bytes_to_send == 0 {
            self.reinit();
            return WriteOutcome::Done { keep_alive: true };
        }

        loop {
            let result = {
                let head_remaining = self.write_idx.saturating_sub(self.bytes_have_send);
                if head_remaining > 0 {
                    match &self.file {
                        Some(file) => syscalls::writev(
                            self.fd,
                            &[
                                &self.write_buf[self.bytes_have_send..self.write_idx],
                                file.as_slice(),
                            ],
                        ),
                        None => syscalls::writev(
                            self.fd,
                            &[&self.write_buf[self.bytes_have_send..self.write_idx]],
                        ),
                    }
                } else if let Some(file) = &self.file {
                    let offset = self.bytes_have_send - self.write_idx;
                    syscalls::writev(self.fd, &[&file.as_slice()[offset..]])
                } else {
                    // Accounting says bytes remain but no segment holds them.
                    self.unmap();
                    return WriteOutcome::Error;
                }
            };

            let sent = match result {
                Ok(0) => {
                    self.unmap();
                    return WriteOutcome::Error;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return WriteOutcome::Again,
                Err(_) => {
                    self.unmap();
                    return WriteOutcome::Error;
                }
            };

            self.bytes_have_send += sent;
            self.bytes_to_send = self.bytes_to_send.saturating_sub(sent);
            if self.bytes_to_send == 0 {
                self.unmap();
                if self.linger {
                    self.reinit();
                    return WriteOutcome::Done { keep_alive: true };
                }
                return WriteOutcome::Done { keep_alive: false };
            }
        }
    }

    /// One full protocol step: parse what is buffered, resolve the request,
    /// assemble the response.
    pub fn process(&mut self, store: &StoreConn) -> ProcessOutcome {
        let code = self.process_read();
        if code == HttpCode::NoRequest {
            return ProcessOutcome::NeedMore;
        }
        if code == HttpCode::BadRequest {
            info!(peer = %self.peer, "malformed request");
        }

        let code = if code == HttpCode::GetRequest {
            self.do_request(store)
        } else {
            code
        };

        if self.process_write(code) {
            ProcessOutcome::ResponseReady
        } else {
            ProcessOutcome::Close
        }
    }
}
