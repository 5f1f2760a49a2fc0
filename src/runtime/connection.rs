//! Per-connection record processing.
//!
//! A [`Connection`] owns one client socket, its receive buffer and the single
//! [`Request`] reused for every request on that socket. Records are only
//! acted on once they are completely buffered, so each one is processed
//! exactly once no matter how the bytes arrive.

use crate::config::Config;
use crate::error::{ConnectionError, ProtocolError};
use crate::protocol::{
    BeginRequest, Decode, Header, Params, RecordType, ROLE_RESPONDER, VERSION_1,
};
use crate::runtime::buffer::{Fill, ReceiveBuffer};
use crate::runtime::request::{RecordSink, Request, RequestState};
use crate::server::Handler;
use slab::Slab;
use std::collections::HashSet;
use std::io::Read;
use std::sync::Arc;
use tracing::warn;

/// Limits and allow-list shared by every connection of a server.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionSettings {
    pub max_request_len: usize,
    pub output_buffer: usize,
    pub params: Arc<HashSet<Vec<u8>>>,
}

impl ConnectionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_request_len: config.max_request_len,
            output_buffer: config.output_buffer,
            params: Arc::new(
                config
                    .params
                    .iter()
                    .map(|name| name.as_bytes().to_vec())
                    .collect(),
            ),
        }
    }
}

/// A single client connection.
pub(crate) struct Connection<S> {
    stream: Arc<S>,
    buf: ReceiveBuffer,
    request: Request,
    settings: ConnectionSettings,
    requests: u64,
}

impl<S> Connection<S>
where
    S: RecordSink + 'static,
    for<'a> &'a S: Read,
{
    pub fn new(stream: S, settings: &ConnectionSettings) -> Self {
        let stream = Arc::new(stream);
        let request = Request::new(stream.clone(), settings.output_buffer);
        Self {
            stream,
            buf: ReceiveBuffer::new(settings.max_request_len),
            request,
            settings: settings.clone(),
            requests: 0,
        }
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Requests handed to the handler so far.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Read and process everything available on the socket.
    ///
    /// `Ok(())` means the connection stays open and waits for the next
    /// readiness event; any error means it must be closed.
    pub fn on_readable(&mut self, handler: &dyn Handler) -> Result<(), ConnectionError> {
        loop {
            match self.buf.refill(&*self.stream)? {
                Fill::Data(_) => self.process_records(handler)?,
                Fill::WouldBlock => return Ok(()),
                Fill::Eof => return Err(ConnectionError::PeerClosed),
                Fill::Full => {
                    return Err(ConnectionError::Capacity {
                        needed: self.buf.pending() + 1,
                        limit: self.buf.capacity(),
                    })
                }
            }
        }
    }

    fn process_records(&mut self, handler: &dyn Handler) -> Result<(), ConnectionError> {
        loop {
            self.buf.reset_read();

            let Some(header) = self.buf.read_obj::<Header>() else {
                return Ok(());
            };
            if header.version != VERSION_1 {
                return Err(ProtocolError::Version(header.version).into());
            }
            let record_type = RecordType::try_from(header.record_type)?;

            if header.record_len() > self.buf.capacity() {
                return Err(ConnectionError::Capacity {
                    needed: header.record_len(),
                    limit: self.buf.capacity(),
                });
            }

            let content_len = usize::from(header.content_length());
            let padding_len = usize::from(header.padding_length);
            if self.buf.read_max_len() < content_len + padding_len {
                return Ok(());
            }

            let Some(content) = self.buf.read(content_len) else {
                return Ok(());
            };
            let complete = apply_record(
                &mut self.request,
                &self.settings,
                record_type,
                header.request_id(),
                content,
            )?;

            self.buf.discard(padding_len);
            self.buf.commit();

            if complete {
                self.dispatch(handler)?;
            }
        }
    }

    fn dispatch(&mut self, handler: &dyn Handler) -> Result<(), ConnectionError> {
        self.requests += 1;
        self.request.mark_dispatched();
        handler.handle(&self.request);

        if !self.request.is_ended() {
            warn!(
                request_id = self.request.request_id(),
                "Handler returned without ending the request"
            );
        }
        self.buf.consume();

        if self.request.output_failed() {
            return Err(ConnectionError::OutputFailed);
        }
        Ok(())
    }
}

/// Act on one complete record. Returns `true` once the request's input is
/// complete and the handler should run.
fn apply_record(
    request: &mut Request,
    settings: &ConnectionSettings,
    record_type: RecordType,
    request_id: u16,
    content: &[u8],
) -> Result<bool, ConnectionError> {
    match record_type {
        RecordType::BeginRequest => {
            if content.len() != BeginRequest::LEN {
                return Err(ProtocolError::BeginRequestLength(content.len() as u16).into());
            }
            let begin = BeginRequest::decode(content);
            if begin.role() != ROLE_RESPONDER {
                return Err(ProtocolError::UnsupportedRole(begin.role()).into());
            }
            if request.state() == RequestState::Accumulating {
                return Err(ProtocolError::OutOfOrder {
                    record: record_type,
                    request_id,
                }
                .into());
            }
            request.new_request(request_id);
            Ok(false)
        }
        RecordType::Params => {
            check_in_flight(request, record_type, request_id)?;
            for entry in Params::new(content) {
                let (key, value) = entry?;
                if settings.params.contains(key) {
                    request.add_param(key, value);
                }
            }
            Ok(false)
        }
        RecordType::Stdin => {
            check_in_flight(request, record_type, request_id)?;
            if content.is_empty() {
                return Ok(true);
            }
            let needed = request.body().len() + content.len();
            if needed > settings.max_request_len {
                return Err(ConnectionError::Capacity {
                    needed,
                    limit: settings.max_request_len,
                });
            }
            request.add_in(content);
            Ok(false)
        }
        other => Err(ProtocolError::UnexpectedRecord(other).into()),
    }
}

fn check_in_flight(
    request: &Request,
    record: RecordType,
    request_id: u16,
) -> Result<(), ProtocolError> {
    if request.state() != RequestState::Accumulating || request.request_id() != request_id {
        return Err(ProtocolError::OutOfOrder { record, request_id });
    }
    Ok(())
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub(crate) struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Whether another connection would exceed the limit.
    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Insert a new connection.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection<S>) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        self.connections.try_remove(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Remove every connection.
    pub fn drain(&mut self) -> impl Iterator<Item = Connection<S>> + '_ {
        self.connections.drain()
    }
}
