//! Host-implemented services
//!
//! A [`ServiceHandler`] answers requests on sessions whose server end lives
//! in the host. The service pump hands it a [`ServiceCtx`] per request;
//! everything the handler sees is already in the client's terms: buffers
//! are read from and written to the client's address space, and handles it
//! returns are opened in the client's table.

use std::sync::Arc;

use super::message::{Request, Response};
use crate::kernel::{EventId, KObjectRef, KernelError, KernelState, ProcessId, ResultCode, SessionId, ThreadId};

pub trait ServiceHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Serve one request. An error becomes the response's result code and
    /// anything pushed so far is discarded.
    fn handle_request(&self, ctx: &mut ServiceCtx<'_>) -> Result<(), ResultCode>;
}

/// Domain object table; object id n is slot n - 1
pub type DomainTable = Vec<Option<Arc<dyn ServiceHandler>>>;

pub struct ServiceCtx<'a> {
    state: &'a mut KernelState,
    session: SessionId,
    client: ThreadId,
    process: ProcessId,
    request: &'a Request,
    domain: Option<&'a mut DomainTable>,
    input_pos: usize,
    pub(crate) response: Response,
}

impl<'a> ServiceCtx<'a> {
    pub(crate) fn new(
        state: &'a mut KernelState,
        session: SessionId,
        client: ThreadId,
        process: ProcessId,
        request: &'a Request,
        domain: Option<&'a mut DomainTable>,
    ) -> Self {
        ServiceCtx {
            state,
            session,
            client,
            process,
            request,
            domain,
            input_pos: 0,
            response: Response::new(ResultCode::SUCCESS),
        }
    }

    pub fn command(&self) -> u32 {
        self.request.command
    }

    pub fn request(&self) -> &Request {
        self.request
    }

    /// Raw arguments after the CMIF header
    pub fn input(&self) -> &[u8] {
        &self.request.data
    }

    pub fn pop_u32(&mut self) -> Result<u32, KernelError> {
        let bytes = self
            .request
            .data
            .get(self.input_pos..self.input_pos + 4)
            .ok_or(KernelError::OutOfRange)?;
        self.input_pos += 4;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn pop_u64(&mut self) -> Result<u64, KernelError> {
        // u64 arguments are 8-byte aligned within the raw data
        self.input_pos = (self.input_pos + 7) & !7;
        let lo = self.pop_u32()? as u64;
        let hi = self.pop_u32()? as u64;
        Ok(lo | hi << 32)
    }

    pub fn push_u32(&mut self, value: u32) {
        self.response.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn push_u64(&mut self, value: u64) {
        while self.response.data.len() % 8 != 0 {
            self.response.data.push(0);
        }
        self.response.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.response.data.extend_from_slice(bytes);
    }

    /// Pid the client sent, if it asked the kernel to send one
    pub fn pid(&self) -> Option<u64> {
        self.request.pid
    }

    /// Guest id of the calling thread
    pub fn thread_id(&self) -> u64 {
        self.state.thread(self.client).map(|t| t.guest_id).unwrap_or(0)
    }

    pub fn process(&self) -> ProcessId {
        self.process
    }

    pub fn client(&self) -> ThreadId {
        self.client
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn state(&mut self) -> &mut KernelState {
        self.state
    }

    fn client_read(&self, addr: u32, size: usize) -> Result<Vec<u8>, KernelError> {
        let space = self.state.process(self.process)?.space.clone();
        let mut buf = vec![0u8; size];
        space.read_bytes(addr, &mut buf).map_err(|_| KernelError::InvalidCurrentMemory)?;
        Ok(buf)
    }

    /// Contents of the `index`th A buffer
    pub fn read_send_buffer(&self, index: usize) -> Result<Vec<u8>, KernelError> {
        let desc = self.request.sends.get(index).ok_or(KernelError::OutOfRange)?;
        self.client_read(desc.addr, desc.size as usize)
    }

    /// Contents of the `index`th X buffer
    pub fn read_pointer_buffer(&self, index: usize) -> Result<Vec<u8>, KernelError> {
        let desc = self.request.pointers.get(index).ok_or(KernelError::OutOfRange)?;
        self.client_read(desc.addr, desc.size as usize)
    }

    /// Size of the `index`th B buffer
    pub fn receive_buffer_size(&self, index: usize) -> Result<usize, KernelError> {
        self.request.receives.get(index).map(|d| d.size as usize).ok_or(KernelError::OutOfRange)
    }

    /// Write into the `index`th B buffer, truncating to its size; returns
    /// the number of bytes written
    pub fn write_receive_buffer(&mut self, index: usize, data: &[u8]) -> Result<usize, KernelError> {
        let desc = *self.request.receives.get(index).ok_or(KernelError::OutOfRange)?;
        let len = data.len().min(desc.size as usize);
        let space = self.state.process(self.process)?.space.clone();
        space
            .write_bytes(desc.addr, &data[..len])
            .map_err(|_| KernelError::InvalidCurrentMemory)?;
        Ok(len)
    }

    /// Object behind the `index`th handle the client sent (copy handles
    /// first, then move handles)
    pub fn input_handle(&self, index: usize) -> Result<KObjectRef, KernelError> {
        let handle = self
            .request
            .copy_handles
            .iter()
            .chain(&self.request.move_handles)
            .nth(index)
            .copied()
            .ok_or(KernelError::OutOfRange)?;
        self.state.resolve(self.client, handle)
    }

    /// Return a handle to `object` that the client keeps alongside ours
    pub fn copy_handle(&mut self, object: KObjectRef) -> Result<(), KernelError> {
        let handle = self.state.add_handle(self.process, object)?;
        self.response.copy_handles.push(handle);
        Ok(())
    }

    pub fn move_handle(&mut self, object: KObjectRef) -> Result<(), KernelError> {
        let handle = self.state.add_handle(self.process, object)?;
        self.response.move_handles.push(handle);
        Ok(())
    }

    /// Create an event the service signals later through its id; the
    /// client receives the readable end
    pub fn create_event(&mut self) -> Result<EventId, KernelError> {
        let (event, writable, readable) = self.state.create_event(self.process)?;
        self.state.close_handle(self.process, writable)?;
        self.response.copy_handles.push(readable);
        Ok(event)
    }

    /// Return a new service object: a domain object id on domain sessions,
    /// otherwise a fresh session handle
    pub fn push_object(&mut self, handler: Arc<dyn ServiceHandler>) -> Result<(), KernelError> {
        match self.domain.as_deref_mut() {
            Some(table) => {
                let id = insert_domain_object(table, handler);
                self.response.objects.push(id);
            }
            None => {
                let handle = self.state.open_host_session(self.process, handler)?;
                self.response.move_handles.push(handle);
            }
        }
        Ok(())
    }
}

/// Put `handler` in the first free slot; returns its object id
pub(crate) fn insert_domain_object(table: &mut DomainTable, handler: Arc<dyn ServiceHandler>) -> u32 {
    match table.iter().position(Option::is_none) {
        Some(slot) => {
            table[slot] = Some(handler);
            slot as u32 + 1
        }
        None => {
            table.push(Some(handler));
            table.len() as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl ServiceHandler for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn handle_request(&self, _ctx: &mut ServiceCtx<'_>) -> Result<(), ResultCode> {
            Ok(())
        }
    }

    #[test]
    fn test_domain_ids_reuse_closed_slots() {
        let mut table: DomainTable = Vec::new();
        assert_eq!(insert_domain_object(&mut table, Arc::new(Named("a"))), 1);
        assert_eq!(insert_domain_object(&mut table, Arc::new(Named("b"))), 2);
        table[0] = None;
        assert_eq!(insert_domain_object(&mut table, Arc::new(Named("c"))), 1);
        assert_eq!(table[0].as_ref().map(|h| h.name()), Some("c"));
    }
}
