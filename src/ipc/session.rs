//! Sessions and ports
//!
//! A session joins one client end to one server end. Clients send
//! synchronously: the request stays in the sending thread's IPC buffer, the
//! thread is queued on the session and blocks until the server replies.
//! The server takes requests strictly in queue order and has at most one
//! in flight.
//!
//! The server end is either a guest thread (AcceptSession, ReplyAndReceive)
//! or a host [`ServiceHandler`] run by the service pump.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};

use super::message::{write_u32, Layout, MESSAGE_SIZE};
use super::service::{DomainTable, ServiceHandler};
use crate::kernel::svc::Reply;
use crate::kernel::{
    KObjectRef, KernelError, KernelState, PortId, ProcessId, SessionId, SyncObject, ThreadId, WaitReason,
    CURRENT_PROCESS, CURRENT_THREAD,
};

/// Request taken by the server and not yet answered
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InFlight {
    /// `None` once the client stopped waiting; the reply is then dropped
    pub client: Option<ThreadId>,
}

pub struct HostSession {
    pub handler: Arc<dyn ServiceHandler>,
    /// Object table once the session was converted to a domain
    pub domain: Option<DomainTable>,
}

pub enum SessionServer {
    Guest,
    Host(HostSession),
}

pub struct KSession {
    pub port: Option<PortId>,
    /// Clients whose requests wait to be received
    pub queue: VecDeque<ThreadId>,
    pub in_flight: Option<InFlight>,
    /// Requests the queue holds before senders get `Busy`
    pub capacity: usize,
    pub client_open: bool,
    pub server_open: bool,
    pub client_refs: u32,
    pub server_refs: u32,
    pub server: SessionServer,
}

impl KSession {
    fn new(port: Option<PortId>, capacity: usize, server: SessionServer) -> Self {
        KSession {
            port,
            queue: VecDeque::new(),
            in_flight: None,
            capacity,
            client_open: true,
            server_open: true,
            client_refs: 0,
            server_refs: 0,
            server,
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self.server, SessionServer::Host(_))
    }

    pub fn is_domain(&self) -> bool {
        matches!(&self.server, SessionServer::Host(HostSession { domain: Some(_), .. }))
    }
}

pub enum PortServer {
    Guest,
    Host(Arc<dyn ServiceHandler>),
}

pub struct KPort {
    pub name: Option<String>,
    pub max_sessions: usize,
    pub open_sessions: usize,
    /// Sessions connected but not yet accepted
    pub pending: VecDeque<SessionId>,
    pub server: PortServer,
    pub server_open: bool,
    pub server_refs: u32,
    pub client_refs: u32,
}

impl KPort {
    pub fn new(name: Option<String>, max_sessions: usize, server: PortServer) -> Self {
        KPort {
            name,
            max_sessions,
            open_sessions: 0,
            pending: VecDeque::new(),
            server,
            server_open: true,
            server_refs: 0,
            client_refs: 0,
        }
    }
}

impl KernelState {
    // =========================================================================
    // Ports
    // =========================================================================

    /// Create a guest-served port; returns (server, client) handles.
    /// A named port is also registered for ConnectToNamedPort.
    pub fn create_port(
        &mut self,
        pid: ProcessId,
        max_sessions: usize,
        name: Option<String>,
    ) -> Result<(u32, u32), KernelError> {
        if let Some(name) = &name {
            if self.named_ports.contains_key(name) {
                return Err(KernelError::InvalidState);
            }
        }
        let port = self.ports.insert(KPort::new(name.clone(), max_sessions, PortServer::Guest));
        let server = match self.add_handle(pid, KObjectRef::ServerPort(port)) {
            Ok(handle) => handle,
            Err(err) => {
                self.ports.remove(port);
                return Err(err);
            }
        };
        let client = match self.add_handle(pid, KObjectRef::ClientPort(port)) {
            Ok(handle) => handle,
            Err(err) => {
                self.close_handle(pid, server)?;
                return Err(err);
            }
        };
        if let Some(name) = name {
            debug!("registered named port \"{name}\"");
            self.named_ports.insert(name, port);
        }
        Ok((server, client))
    }

    /// Register a port served by a host handler
    pub fn register_host_port(
        &mut self,
        name: &str,
        handler: Arc<dyn ServiceHandler>,
        max_sessions: usize,
    ) -> Result<PortId, KernelError> {
        if self.named_ports.contains_key(name) {
            return Err(KernelError::InvalidState);
        }
        let port = self
            .ports
            .insert(KPort::new(Some(name.to_string()), max_sessions, PortServer::Host(handler)));
        self.named_ports.insert(name.to_string(), port);
        Ok(port)
    }

    pub fn unregister_named_port(&mut self, name: &str) -> Result<(), KernelError> {
        let port = self.named_ports.remove(name).ok_or(KernelError::NotFound)?;
        if let Some(p) = self.ports.get_mut(port) {
            p.name = None;
        }
        Ok(())
    }

    /// Connect to a port; returns a client session handle in `pid`
    pub fn connect(&mut self, pid: ProcessId, port: PortId) -> Result<u32, KernelError> {
        let capacity = self.config.session_capacity;
        let p = self.ports.get_mut(port).ok_or(KernelError::NotFound)?;
        if !p.server_open {
            return Err(KernelError::SessionClosed);
        }
        if p.open_sessions >= p.max_sessions {
            return Err(KernelError::SessionCountExceeded);
        }
        let server = match &p.server {
            PortServer::Guest => SessionServer::Guest,
            PortServer::Host(handler) => SessionServer::Host(HostSession { handler: handler.clone(), domain: None }),
        };
        let guest_served = matches!(server, SessionServer::Guest);
        p.open_sessions += 1;

        let session = self.sessions.insert(KSession::new(Some(port), capacity, server));
        let handle = match self.add_handle(pid, KObjectRef::ClientSession(session)) {
            Ok(handle) => handle,
            Err(err) => {
                self.sessions.remove(session);
                if let Some(p) = self.ports.get_mut(port) {
                    p.open_sessions -= 1;
                }
                return Err(err);
            }
        };
        if guest_served {
            if let Some(p) = self.ports.get_mut(port) {
                p.pending.push_back(session);
            }
            self.wake_object(SyncObject::ServerPort(port));
        }
        debug!("connected session {session} to port {port}");
        Ok(handle)
    }

    /// Take the oldest pending connection; returns a server session handle
    pub fn accept(&mut self, pid: ProcessId, port: PortId) -> Result<u32, KernelError> {
        let p = self.ports.get_mut(port).ok_or(KernelError::InvalidHandle)?;
        let session = p.pending.pop_front().ok_or(KernelError::NotFound)?;
        match self.add_handle(pid, KObjectRef::ServerSession(session)) {
            Ok(handle) => Ok(handle),
            Err(err) => {
                if let Some(p) = self.ports.get_mut(port) {
                    p.pending.push_front(session);
                }
                Err(err)
            }
        }
    }

    /// A session with no port; returns (server, client) handles
    pub fn create_session_pair(&mut self, pid: ProcessId) -> Result<(u32, u32), KernelError> {
        let capacity = self.config.session_capacity;
        let session = self.sessions.insert(KSession::new(None, capacity, SessionServer::Guest));
        let server = match self.add_handle(pid, KObjectRef::ServerSession(session)) {
            Ok(handle) => handle,
            Err(err) => {
                self.sessions.remove(session);
                return Err(err);
            }
        };
        let client = match self.add_handle(pid, KObjectRef::ClientSession(session)) {
            Ok(handle) => handle,
            Err(err) => {
                self.close_handle(pid, server)?;
                return Err(err);
            }
        };
        Ok((server, client))
    }

    /// New session served by `handler`, e.g. an object a service hands out.
    /// Returns a client handle in `pid`.
    pub fn open_host_session(&mut self, pid: ProcessId, handler: Arc<dyn ServiceHandler>) -> Result<u32, KernelError> {
        let capacity = self.config.session_capacity;
        let server = SessionServer::Host(HostSession { handler, domain: None });
        let session = self.sessions.insert(KSession::new(None, capacity, server));
        match self.add_handle(pid, KObjectRef::ClientSession(session)) {
            Ok(handle) => Ok(handle),
            Err(err) => {
                self.sessions.remove(session);
                Err(err)
            }
        }
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Queue the request in `cur`'s IPC buffer and block until it is answered
    pub(crate) fn send_request(&mut self, cur: ThreadId, session: SessionId) -> Result<Reply, KernelError> {
        let s = self.sessions.get_mut(session).ok_or(KernelError::SessionClosed)?;
        if !s.server_open {
            return Err(KernelError::SessionClosed);
        }
        if s.queue.len() >= s.capacity {
            return Err(KernelError::Busy);
        }
        s.queue.push_back(cur);
        let host = s.is_host();
        self.begin_wait(cur, WaitReason::IpcReply { session }, None, Vec::new(), false, false);
        debug!("thread {cur} sent a request on session {session}");
        if host {
            self.host_work = true;
        } else {
            self.wake_object(SyncObject::ServerSession(session));
        }
        Ok(Reply::Blocked)
    }

    /// Move the oldest queued request into `server`'s IPC buffer
    pub(crate) fn receive_request(&mut self, server: ThreadId, session: SessionId) -> Result<(), KernelError> {
        let s = self.sessions.get_mut(session).ok_or(KernelError::SessionClosed)?;
        if s.in_flight.is_some() {
            return Err(KernelError::InvalidState);
        }
        let Some(client) = s.queue.pop_front() else {
            return Err(if s.client_open { KernelError::NotFound } else { KernelError::SessionClosed });
        };
        s.in_flight = Some(InFlight { client: Some(client) });
        if let Err(err) = self.transfer_message(client, server) {
            // The request cannot be delivered; fail it rather than the server
            if let Some(s) = self.sessions.get_mut(session) {
                s.in_flight = None;
            }
            self.end_wait(client, Err(err), None);
            return Err(err);
        }
        Ok(())
    }

    /// Copy `server`'s IPC buffer back to the client of the request in flight
    pub(crate) fn reply(&mut self, server: ThreadId, session: SessionId) -> Result<(), KernelError> {
        let s = self.sessions.get_mut(session).ok_or(KernelError::SessionClosed)?;
        let in_flight = s.in_flight.take().ok_or(KernelError::InvalidState)?;
        let result = match in_flight.client {
            Some(client) => {
                let result = self.transfer_message(server, client);
                self.end_wait(client, result, None);
                result
            }
            None => Ok(()),
        };
        self.wake_object(SyncObject::ServerSession(session));
        result
    }

    /// Drop `client` from the session after its wait ended some other way
    pub(crate) fn unlink_ipc_client(&mut self, session: SessionId, client: ThreadId) {
        let Some(s) = self.sessions.get_mut(session) else { return };
        s.queue.retain(|&t| t != client);
        if let Some(in_flight) = &mut s.in_flight {
            if in_flight.client == Some(client) {
                in_flight.client = None;
            }
        }
    }

    /// Copy an IPC message between thread buffers, translating the handle
    /// descriptor into the receiver's process
    pub(crate) fn transfer_message(&mut self, from: ThreadId, to: ThreadId) -> Result<(), KernelError> {
        let (from_pid, from_tls) = self.thread(from).map(|t| (t.process, t.tls))?;
        let (to_pid, to_tls) = self.thread(to).map(|t| (t.process, t.tls))?;
        let from_space = self.process(from_pid)?.space.clone();
        let to_space = self.process(to_pid)?.space.clone();

        let mut buf = [0u8; MESSAGE_SIZE];
        from_space.read_bytes(from_tls, &mut buf)?;
        let layout = Layout::parse(&buf)?;

        // Handles opened in the receiver, and moved ones the sender gives
        // up once the message has landed
        let mut opened = Vec::new();
        let mut surrendered = Vec::new();
        let mut words = Vec::new();
        if let Some(desc) = layout.handles {
            if desc.pid.is_some() {
                let guest_pid = self.process(from_pid)?.pid;
                write_u32(&mut buf, desc.pid_offset, guest_pid as u32)?;
                write_u32(&mut buf, desc.pid_offset + 4, (guest_pid >> 32) as u32)?;
            }
            let copies = desc.copy.len();
            for (i, &handle) in desc.copy.iter().chain(desc.moves.iter()).enumerate() {
                let offset = desc.handles_offset + i * 4;
                let translated = match self.translate_handle(from, from_pid, to_pid, handle) {
                    Ok(0) => 0,
                    Ok(translated) => {
                        opened.push(translated);
                        if i >= copies && handle != CURRENT_THREAD && handle != CURRENT_PROCESS {
                            surrendered.push(handle);
                        }
                        translated
                    }
                    Err(err) => {
                        warn!("dropping handle {handle:#x} in transfer: {err}");
                        0
                    }
                };
                words.push((offset, translated));
            }
        }

        let delivered = words
            .iter()
            .try_for_each(|&(offset, value)| write_u32(&mut buf, offset, value).map_err(KernelError::from))
            .and_then(|()| to_space.write_bytes(to_tls, &buf).map_err(KernelError::from));
        if let Err(err) = delivered {
            for handle in opened {
                let _ = self.close_handle(to_pid, handle);
            }
            return Err(err);
        }
        for handle in surrendered {
            if let Err(err) = self.close_handle(from_pid, handle) {
                warn!("moved handle {handle:#x} already gone from sender: {err}");
            }
        }
        Ok(())
    }

    /// Open the object behind the sender's `handle` in `to_pid`
    fn translate_handle(
        &mut self,
        from: ThreadId,
        from_pid: ProcessId,
        to_pid: ProcessId,
        handle: u32,
    ) -> Result<u32, KernelError> {
        if handle == 0 {
            return Ok(0);
        }
        let object = match handle {
            CURRENT_THREAD => KObjectRef::Thread(from),
            CURRENT_PROCESS => KObjectRef::Process(from_pid),
            _ => self.process(from_pid)?.handles.get(handle).ok_or(KernelError::InvalidHandle)?,
        };
        self.add_handle(to_pid, object)
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    pub(crate) fn close_client(&mut self, session: SessionId) {
        let Some(s) = self.sessions.get_mut(session) else { return };
        if !s.client_open {
            return;
        }
        s.client_open = false;
        let queued: Vec<ThreadId> = s.queue.drain(..).collect();
        let in_flight = s.in_flight.as_mut().and_then(|f| f.client.take());
        let port = s.port;
        let host = s.is_host();
        let server_open = s.server_open;

        for client in queued.into_iter().chain(in_flight) {
            self.end_wait(client, Err(KernelError::SessionClosed), None);
        }
        if let Some(p) = port.and_then(|p| self.ports.get_mut(p)) {
            p.open_sessions = p.open_sessions.saturating_sub(1);
            p.pending.retain(|&pending| pending != session);
        }
        debug!("client end of session {session} closed");
        if host || !server_open {
            self.sessions.remove(session);
        } else {
            self.wake_object(SyncObject::ServerSession(session));
        }
    }

    pub(crate) fn close_server(&mut self, session: SessionId) {
        let Some(s) = self.sessions.get_mut(session) else { return };
        if !s.server_open {
            return;
        }
        s.server_open = false;
        let queued: Vec<ThreadId> = s.queue.drain(..).collect();
        let in_flight = s.in_flight.take().and_then(|f| f.client);
        let client_open = s.client_open;

        for client in queued.into_iter().chain(in_flight) {
            self.end_wait(client, Err(KernelError::SessionClosed), None);
        }
        debug!("server end of session {session} closed");
        if !client_open {
            self.sessions.remove(session);
        }
    }

    pub(crate) fn close_port(&mut self, port: PortId) {
        let Some(p) = self.ports.get_mut(port) else { return };
        p.server_open = false;
        let pending: Vec<SessionId> = p.pending.drain(..).collect();
        let name = p.name.take();
        let unreferenced = p.client_refs == 0;
        for session in pending {
            self.close_server(session);
        }
        if let Some(name) = name {
            if self.named_ports.get(&name) == Some(&port) {
                self.named_ports.remove(&name);
            }
        }
        if unreferenced {
            self.ports.remove(port);
        }
    }
}
