//! Request state and response output.
//!
//! A [`Request`] collects the allow-listed parameters and the input body of
//! one FastCGI request, and buffers the CGI-style response (header lines, a
//! blank line, then the body) until it is flushed as STDOUT records.
//!
//! Output operations take `&self` and are serialized by a re-entrant lock, so
//! handler code may write from several threads, and a thread already inside
//! [`Request::transaction`] may call any other output operation.

use crate::error::OutputError;
use crate::protocol::{Decode, EndRequest, Header, ProtocolStatus, RecordType, MAX_CONTENT_LEN};
use bytes::BytesMut;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, IoSlice, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

/// Destination for encoded records.
pub(crate) trait RecordSink: Send + Sync {
    /// Write every byte of `bufs`, or fail.
    fn write_records(&self, bufs: &mut [IoSlice<'_>]) -> io::Result<()>;
}

impl RecordSink for mio::net::TcpStream {
    fn write_records(&self, bufs: &mut [IoSlice<'_>]) -> io::Result<()> {
        write_all_vectored(self, bufs)
    }
}

impl RecordSink for UnixStream {
    fn write_records(&self, bufs: &mut [IoSlice<'_>]) -> io::Result<()> {
        write_all_vectored(self, bufs)
    }
}

/// Vectored write loop over a possibly nonblocking socket.
///
/// A full send buffer parks the calling thread until the peer drains it, so a
/// record is never left half written.
fn write_all_vectored<S>(stream: &S, mut bufs: &mut [IoSlice<'_>]) -> io::Result<()>
where
    S: AsRawFd,
    for<'a> &'a S: Write,
{
    let mut writer = stream;
    IoSlice::advance_slices(&mut bufs, 0);
    while !bufs.is_empty() {
        match Write::write_vectored(&mut writer, bufs) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => IoSlice::advance_slices(&mut bufs, n),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                wait_writable(stream.as_raw_fd())?
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Block until `fd` reports POLLOUT (or an error condition the next write will surface).
fn wait_writable(fd: RawFd) -> io::Result<()> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    loop {
        // SAFETY: `pollfd` is a single valid entry that outlives the call.
        let rc = unsafe { libc::poll(&mut pollfd, 1, -1) };
        if rc >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// No BEGIN_REQUEST seen yet on this connection.
    Idle,
    /// Parameters and body are being collected.
    Accumulating,
    /// The handler has been invoked.
    Dispatched,
}

type CloseHook = Box<dyn FnOnce() + Send>;

/// Response side of a request.
struct Output {
    sink: Arc<dyn RecordSink>,
    request_id: u16,
    buf: BytesMut,
    capacity: usize,
    body_written: bool,
    ended: bool,
    failed: bool,
    on_close: Option<CloseHook>,
}

impl Output {
    fn check_open(&self) -> Result<(), OutputError> {
        if self.ended {
            return Err(OutputError::Ended);
        }
        // part of a record may already be on the wire
        if self.failed {
            return Err(OutputError::Failed);
        }
        Ok(())
    }

    /// Buffer `data`, flushing full buffers as separate records.
    fn append(&mut self, mut data: &[u8]) -> Result<(), OutputError> {
        while !data.is_empty() {
            let room = self.capacity - self.buf.len();
            if room == 0 {
                self.flush()?;
                continue;
            }
            let n = room.min(data.len());
            self.buf.extend_from_slice(&data[..n]);
            data = &data[n..];
        }
        Ok(())
    }

    fn write_header(&mut self, name: &str, value: &str) -> Result<(), OutputError> {
        self.check_open()?;
        if self.body_written {
            return Err(OutputError::HeaderAfterBody);
        }
        self.append(name.as_bytes())?;
        self.append(b": ")?;
        self.append(value.as_bytes())?;
        self.append(b"\n")
    }

    fn write_body(&mut self, body: &[u8]) -> Result<(), OutputError> {
        self.check_open()?;
        if !self.body_written {
            self.append(b"\n")?;
            self.body_written = true;
        }
        self.append(body)
    }

    fn stdout_header(&self) -> [u8; 8] {
        // capacity never exceeds MAX_CONTENT_LEN
        Header::new(RecordType::Stdout, self.request_id, self.buf.len() as u16).encode()
    }

    /// Record a write outcome; any failure leaves the stream unusable.
    fn settle(&mut self, result: io::Result<()>) -> Result<(), OutputError> {
        if let Err(e) = result {
            self.failed = true;
            return Err(e.into());
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), OutputError> {
        self.check_open()?;
        if self.buf.is_empty() {
            return Ok(());
        }
        let header = self.stdout_header();
        let result = self
            .sink
            .write_records(&mut [IoSlice::new(&header), IoSlice::new(&self.buf)]);
        self.settle(result)?;
        self.buf.clear();
        Ok(())
    }

    fn end(&mut self) -> Result<(), OutputError> {
        // an empty response is not allowed, so at least the separator goes out
        self.write_body(b"")?;

        let stdout_header = self.stdout_header();
        let end_header =
            Header::new(RecordType::EndRequest, self.request_id, EndRequest::LEN as u16).encode();
        let end_body = EndRequest::new(ProtocolStatus::RequestComplete).encode();

        let mut slices = Vec::with_capacity(4);
        if !self.buf.is_empty() {
            slices.push(IoSlice::new(&stdout_header));
            slices.push(IoSlice::new(&self.buf));
        }
        slices.push(IoSlice::new(&end_header));
        slices.push(IoSlice::new(&end_body));

        let result = self.sink.write_records(&mut slices);
        drop(slices);
        self.settle(result)?;

        self.buf.clear();
        self.ended = true;
        Ok(())
    }

    fn reset(&mut self, request_id: u16) {
        self.request_id = request_id;
        self.buf.clear();
        self.body_written = false;
        self.ended = false;
        self.failed = false;
        self.on_close = None;
    }
}

/// One FastCGI request.
///
/// The same `Request` is reused for every request on a connection; starting
/// a new one drops all parameters, input and buffered output of the last.
pub struct Request {
    request_id: u16,
    state: RequestState,
    params: HashMap<Vec<u8>, Vec<u8>>,
    body: BytesMut,
    output: ReentrantMutex<RefCell<Output>>,
}

impl Request {
    pub(crate) fn new(sink: Arc<dyn RecordSink>, output_capacity: usize) -> Self {
        let capacity = output_capacity.clamp(1, MAX_CONTENT_LEN);
        Self {
            request_id: 0,
            state: RequestState::Idle,
            params: HashMap::new(),
            body: BytesMut::new(),
            output: ReentrantMutex::new(RefCell::new(Output {
                sink,
                request_id: 0,
                buf: BytesMut::with_capacity(capacity),
                capacity,
                body_written: false,
                ended: false,
                failed: false,
                on_close: None,
            })),
        }
    }

    /// Start a new request with `request_id`, discarding everything from the previous one.
    pub(crate) fn new_request(&mut self, request_id: u16) {
        let output = self.output.get_mut().get_mut();
        if let Some(hook) = output.on_close.take() {
            hook();
        }
        output.reset(request_id);

        self.request_id = request_id;
        self.state = RequestState::Accumulating;
        self.params.clear();
        self.body.clear();
    }

    /// Insert a parameter unless one with the same name is already present.
    pub(crate) fn add_param(&mut self, key: &[u8], value: &[u8]) {
        self.params
            .entry(key.to_vec())
            .or_insert_with(|| value.to_vec());
    }

    /// Append to the input body.
    pub(crate) fn add_in(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    pub(crate) fn mark_dispatched(&mut self) {
        self.state = RequestState::Dispatched;
    }

    /// Whether a response write failed, leaving the connection unusable.
    pub(crate) fn output_failed(&self) -> bool {
        self.output.lock().borrow().failed
    }

    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Value of an allow-listed parameter.
    pub fn param(&self, name: &str) -> Option<&[u8]> {
        self.params.get(name.as_bytes()).map(Vec::as_slice)
    }

    /// Value of an allow-listed parameter, if it is valid UTF-8.
    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.param(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// All retained parameters, in no particular order.
    pub fn params(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.params.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// The input body received so far (all of it, once the handler runs).
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Append a `name: value` response header line.
    ///
    /// Fails with [`OutputError::HeaderAfterBody`] once any body byte has been written.
    pub fn write_header(&self, name: &str, value: &str) -> Result<(), OutputError> {
        let guard = self.output.lock();
        let mut output = guard.borrow_mut();
        output.write_header(name, value)
    }

    /// Append response body bytes. The first call also ends the header block.
    pub fn write_body(&self, body: impl AsRef<[u8]>) -> Result<(), OutputError> {
        let guard = self.output.lock();
        let mut output = guard.borrow_mut();
        output.write_body(body.as_ref())
    }

    /// Send everything buffered so far as one STDOUT record.
    ///
    /// After a failed write every further output call fails with
    /// [`OutputError::Failed`] without touching the stream, and the
    /// connection is closed once the handler returns.
    pub fn flush(&self) -> Result<(), OutputError> {
        let guard = self.output.lock();
        let mut output = guard.borrow_mut();
        output.flush()
    }

    /// Finish the response: flush what is left and send END_REQUEST.
    pub fn end(&self) -> Result<(), OutputError> {
        let guard = self.output.lock();
        let mut output = guard.borrow_mut();
        output.end()
    }

    /// Whether [`Request::end`] has completed.
    pub fn is_ended(&self) -> bool {
        self.output.lock().borrow().ended
    }

    /// Run `f` while holding the output lock, so its writes are not
    /// interleaved with writes from other threads.
    ///
    /// Output operations called from inside `f` re-acquire the lock
    /// re-entrantly on the same thread.
    pub fn transaction<T>(&self, f: impl FnOnce(&Request) -> T) -> T {
        let _guard = self.output.lock();
        f(self)
    }

    /// Register a hook to run when this request is finished with: when the
    /// next request starts on the connection, or when the connection closes.
    ///
    /// Replaces any previously registered hook.
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        let guard = self.output.lock();
        guard.borrow_mut().on_close = Some(Box::new(hook));
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if let Some(hook) = self.output.get_mut().get_mut().on_close.take() {
            hook();
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("request_id", &self.request_id)
            .field("state", &self.state)
            .field("params", &self.params.len())
            .field("body_len", &self.body.len())
            .finish()
    }
}
