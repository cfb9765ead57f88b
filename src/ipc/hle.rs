//! Service pump
//!
//! Drains requests queued on host-served sessions. Runs under the kernel
//! lock, either from `Emulator::step_core` or from the pump thread in
//! threaded mode.

use tracing::{debug, trace, warn};

use super::message::{control, CommandType, MessageError, Request, Response, MESSAGE_SIZE};
use super::service::{insert_domain_object, DomainTable, ServiceCtx};
use super::session::{InFlight, SessionServer};
use crate::kernel::{KernelError, KernelState, ResultCode, SessionId};

/// Pointer buffer size reported to QueryPointerBufferSize
pub const POINTER_BUFFER_SIZE: u32 = 0x8000;

/// Serve every queued request on host sessions; returns how many were served
pub fn pump_services(state: &mut KernelState) -> usize {
    let mut served = 0;
    while std::mem::take(&mut state.host_work) {
        let ready: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, s)| s.is_host() && s.in_flight.is_none() && !s.queue.is_empty())
            .map(|(id, _)| id)
            .collect();
        for session in ready {
            while serve_one(state, session) {
                served += 1;
            }
        }
    }
    served
}

/// Answer the oldest request on `session`; false if there was none
fn serve_one(state: &mut KernelState, session: SessionId) -> bool {
    let Some(s) = state.sessions.get_mut(session) else { return false };
    let Some(client) = s.queue.pop_front() else { return false };
    s.in_flight = Some(InFlight { client: Some(client) });
    let SessionServer::Host(host) = &mut s.server else { return false };
    let handler = host.handler.clone();
    let mut domain = host.domain.take();

    let outcome = state.process_of(client).and_then(|process| {
        let space = state.process(process)?.space.clone();
        let tls = state.thread(client)?.tls;
        let mut buf = [0u8; MESSAGE_SIZE];
        space.read_bytes(tls, &mut buf)?;
        Ok((process, space, tls, buf))
    });
    let (process, space, tls, buf) = match outcome {
        Ok(parts) => parts,
        Err(err) => {
            finish(state, session, domain, Err(err));
            return true;
        }
    };

    let mut request = match Request::parse(&buf, domain.is_some()) {
        Ok(request) => request,
        Err(err) => {
            warn!("malformed request to {}: {err}", handler.name());
            let response = Response::new(KernelError::from(err).code());
            let result = write_response(&space, tls, &response, false);
            finish(state, session, domain, result);
            return true;
        }
    };

    // The sender's pid comes from the kernel, not from the message
    if request.pid.is_some() {
        request.pid = state.process(process).ok().map(|p| p.pid);
    }

    let (response, domain_reply) = match request.ty {
        CommandType::Close => {
            debug!("client closed session {session} to {}", handler.name());
            finish(state, session, domain, Ok(()));
            state.close_client(session);
            return true;
        }
        CommandType::Control | CommandType::ControlWithContext | CommandType::LegacyControl => {
            (handle_control(state, session, process, &request, &mut domain), false)
        }
        _ => {
            let is_domain = domain.is_some();
            let response = match domain.as_mut() {
                Some(table) if request.is_domain_close() => close_domain_object(table, &request),
                Some(table) => {
                    let object_id = request.domain.map(|d| d.object_id).unwrap_or(0);
                    match table.get(object_id.wrapping_sub(1) as usize).cloned().flatten() {
                        Some(target) => {
                            trace!("{} command {} on object {object_id}", target.name(), request.command);
                            let ctx = ServiceCtx::new(state, session, client, process, &request, Some(table));
                            dispatch(ctx, target.as_ref())
                        }
                        None => Response::new(KernelError::InvalidHandle.code()),
                    }
                }
                None => {
                    debug!("{} command {}", handler.name(), request.command);
                    let ctx = ServiceCtx::new(state, session, client, process, &request, None);
                    dispatch(ctx, handler.as_ref())
                }
            };
            (response, is_domain)
        }
    };

    let result = write_response(&space, tls, &response, domain_reply);
    finish(state, session, domain, result);
    true
}

fn dispatch(mut ctx: ServiceCtx<'_>, handler: &dyn super::ServiceHandler) -> Response {
    match handler.handle_request(&mut ctx) {
        Ok(()) => ctx.response,
        Err(code) => {
            // Handles opened for a failed reply would leak in the client
            let process = ctx.process();
            let opened: Vec<u32> = ctx.response.copy_handles.iter().chain(&ctx.response.move_handles).copied().collect();
            let state = ctx.state();
            for handle in opened {
                let _ = state.close_handle(process, handle);
            }
            debug!("{} command failed with {code}", handler.name());
            Response::new(code)
        }
    }
}

fn handle_control(
    state: &mut KernelState,
    session: SessionId,
    process: crate::kernel::ProcessId,
    request: &Request,
    domain: &mut Option<DomainTable>,
) -> Response {
    let mut response = Response::new(ResultCode::SUCCESS);
    match request.command {
        control::CONVERT_TO_DOMAIN => {
            let Some(SessionServer::Host(host)) = state.sessions.get(session).map(|s| &s.server) else {
                return Response::new(KernelError::InvalidState.code());
            };
            if domain.is_some() {
                return Response::new(KernelError::InvalidState.code());
            }
            let mut table = DomainTable::new();
            let id = insert_domain_object(&mut table, host.handler.clone());
            *domain = Some(table);
            response.data = id.to_le_bytes().to_vec();
        }
        control::CLONE_CURRENT_OBJECT | control::CLONE_CURRENT_OBJECT_EX => {
            let Some(SessionServer::Host(host)) = state.sessions.get(session).map(|s| &s.server) else {
                return Response::new(KernelError::InvalidState.code());
            };
            let handler = host.handler.clone();
            match state.open_host_session(process, handler) {
                Ok(handle) => response.move_handles.push(handle),
                Err(err) => return Response::new(err.code()),
            }
        }
        control::QUERY_POINTER_BUFFER_SIZE => {
            response.data = POINTER_BUFFER_SIZE.to_le_bytes().to_vec();
        }
        other => {
            warn!("unsupported control command {other}");
            return Response::new(KernelError::NotImplemented.code());
        }
    }
    response
}

fn close_domain_object(table: &mut DomainTable, request: &Request) -> Response {
    let id = request.domain.map(|d| d.object_id).unwrap_or(0) as usize;
    match table.get_mut(id.wrapping_sub(1)) {
        Some(slot @ Some(_)) => {
            *slot = None;
            Response::new(ResultCode::SUCCESS)
        }
        _ => Response::new(KernelError::InvalidHandle.code()),
    }
}

fn write_response(
    space: &crate::memory::AddressSpace,
    tls: u32,
    response: &Response,
    domain: bool,
) -> Result<(), KernelError> {
    let bytes = response.encode(domain).or_else(|err| match err {
        // Drop the payload rather than leave the client without a reply
        MessageError::TooLarge => Response::new(KernelError::MessageTooLarge.code()).encode(domain),
        other => Err(other),
    })?;
    space.write_bytes(tls, &bytes)?;
    Ok(())
}

/// Release the session's in-flight slot and wake the client
fn finish(state: &mut KernelState, session: SessionId, domain: Option<DomainTable>, result: Result<(), KernelError>) {
    let Some(s) = state.sessions.get_mut(session) else { return };
    if let SessionServer::Host(host) = &mut s.server {
        if host.domain.is_none() {
            host.domain = domain;
        }
    }
    let client = s.in_flight.take().and_then(|f| f.client);
    if let Some(client) = client {
        state.end_wait(client, result, None);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::EmulatorConfig;
    use crate::ipc::message::RequestBuilder;
    use crate::ipc::ServiceHandler;
    use crate::kernel::{Kernel, KObjectRef, ProcessId, ThreadId, ThreadState};

    const BUF: u32 = 0x0010_0000;

    /// Command 0 adds two words; command 1 echoes the send buffer into the
    /// receive buffer; command 2 opens a child object
    struct Calculator;

    impl ServiceHandler for Calculator {
        fn name(&self) -> &str {
            "calc"
        }

        fn handle_request(&self, ctx: &mut ServiceCtx<'_>) -> Result<(), ResultCode> {
            match ctx.command() {
                0 => {
                    let a = ctx.pop_u32()?;
                    let b = ctx.pop_u32()?;
                    ctx.push_u32(a.wrapping_add(b));
                }
                1 => {
                    let data = ctx.read_send_buffer(0)?;
                    let written = ctx.write_receive_buffer(0, &data)?;
                    ctx.push_u32(written as u32);
                }
                2 => ctx.push_object(Arc::new(Calculator))?,
                _ => return Err(ResultCode::new(0x77, 1)),
            }
            Ok(())
        }
    }

    fn setup() -> (Kernel, ProcessId, ThreadId, u32) {
        let kernel = Kernel::new(EmulatorConfig::deterministic(1));
        let (pid, tid, handle) = {
            let mut st = kernel.lock();
            let pid = st.create_process("client").unwrap();
            let (tid, _) = st.create_thread(pid, 0x1000, 0, 0x2000, 30, 0).unwrap();
            st.start_thread(tid).unwrap();
            st.process(pid)
                .unwrap()
                .space
                .map(
                    BUF,
                    0x1000,
                    crate::memory::MemoryPermission::READ_WRITE,
                    crate::memory::MemoryAttribute::empty(),
                    crate::memory::MemoryState::Normal,
                )
                .unwrap();
            let port = st.register_host_port("calc", Arc::new(Calculator), 4).unwrap();
            let handle = st.connect(pid, port).unwrap();
            (pid, tid, handle)
        };
        (kernel, pid, tid, handle)
    }

    fn call(st: &mut KernelState, tid: ThreadId, handle: u32, message: Vec<u8>, domain: bool) -> Response {
        let tls = st.thread(tid).unwrap().tls;
        let space = st.space_of(tid).unwrap();
        space.write_bytes(tls, &message).unwrap();
        let session = match st.resolve(tid, handle).unwrap() {
            KObjectRef::ClientSession(s) => s,
            other => panic!("not a client session: {other:?}"),
        };
        st.send_request(tid, session).unwrap();
        assert_eq!(pump_services(st), 1);
        assert_eq!(st.thread(tid).unwrap().state, ThreadState::Ready);
        let mut buf = vec![0u8; MESSAGE_SIZE];
        space.read_bytes(tls, &mut buf).unwrap();
        Response::parse(&buf, domain).unwrap()
    }

    #[test]
    fn test_host_service_answers_request() {
        let (kernel, _, tid, handle) = setup();
        let mut st = kernel.lock();
        let response = call(&mut st, tid, handle, RequestBuilder::new(0).push_u32(40).push_u32(2).build().unwrap(), false);
        assert!(response.result_code().is_success());
        assert_eq!(response.data[..4], 42u32.to_le_bytes());
    }

    #[test]
    fn test_buffers_are_copied_through_client_memory() {
        let (kernel, _, tid, handle) = setup();
        let mut st = kernel.lock();
        let space = st.space_of(tid).unwrap();
        space.write_bytes(BUF, b"hello").unwrap();
        let message = RequestBuilder::new(1).send_buffer(BUF, 5).receive_buffer(BUF + 0x100, 3).build().unwrap();
        let response = call(&mut st, tid, handle, message, false);
        assert_eq!(response.data[..4], 3u32.to_le_bytes());
        let mut out = [0u8; 3];
        space.read_bytes(BUF + 0x100, &mut out).unwrap();
        assert_eq!(&out, b"hel");
    }

    #[test]
    fn test_handler_error_becomes_result() {
        let (kernel, _, tid, handle) = setup();
        let mut st = kernel.lock();
        let response = call(&mut st, tid, handle, RequestBuilder::new(9).build().unwrap(), false);
        assert_eq!(response.result_code(), ResultCode::new(0x77, 1));
        let response = call(&mut st, tid, handle, RequestBuilder::new(0).build().unwrap(), false);
        assert_eq!(response.result_code(), KernelError::OutOfRange.code());
    }

    #[test]
    fn test_domain_objects() {
        let (kernel, _, tid, handle) = setup();
        let mut st = kernel.lock();
        let response = call(&mut st, tid, handle, RequestBuilder::control(control::CONVERT_TO_DOMAIN).build().unwrap(), false);
        assert_eq!(response.data[..4], 1u32.to_le_bytes());

        let message = RequestBuilder::new(2).domain_object(1).build().unwrap();
        let response = call(&mut st, tid, handle, message, true);
        assert_eq!(response.objects, vec![2]);

        let message = RequestBuilder::new(0).push_u32(1).push_u32(2).domain_object(2).build().unwrap();
        let response = call(&mut st, tid, handle, message, true);
        assert_eq!(response.data[..4], 3u32.to_le_bytes());

        call(&mut st, tid, handle, RequestBuilder::domain_close(2).build().unwrap(), true);
        let message = RequestBuilder::new(0).push_u32(1).push_u32(2).domain_object(2).build().unwrap();
        let response = call(&mut st, tid, handle, message, true);
        assert_eq!(response.result_code(), KernelError::InvalidHandle.code());
    }

    #[test]
    fn test_child_object_gets_own_session() {
        let (kernel, pid, tid, handle) = setup();
        let mut st = kernel.lock();
        let response = call(&mut st, tid, handle, RequestBuilder::new(2).build().unwrap(), false);
        let child = response.move_handles[0];
        assert!(matches!(st.process(pid).unwrap().handles.get(child), Some(KObjectRef::ClientSession(_))));
        let response = call(&mut st, tid, child, RequestBuilder::new(0).push_u32(5).push_u32(6).build().unwrap(), false);
        assert_eq!(response.data[..4], 11u32.to_le_bytes());
    }

    #[test]
    fn test_query_pointer_buffer_size() {
        let (kernel, _, tid, handle) = setup();
        let mut st = kernel.lock();
        let message = RequestBuilder::control(control::QUERY_POINTER_BUFFER_SIZE).build().unwrap();
        let response = call(&mut st, tid, handle, message, false);
        assert_eq!(response.data[..4], POINTER_BUFFER_SIZE.to_le_bytes());
    }
}
