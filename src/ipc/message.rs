//! HIPC message codec
//!
//! A message lives in the first 0x100 bytes of a thread's local region:
//!
//! ```text
//! word 0      type (bits 0-15), X count (16-19), A count (20-23),
//!             B count (24-27), W count (28-31)
//! word 1      raw data words (bits 0-9), handle descriptor present (bit 31)
//! [handle descriptor: send pid (bit 0), copy count (1-4), move count (5-8)]
//! [pid: two words] [copy handles] [move handles]
//! X descriptors   2 words each: size << 16 | counter, address
//! A/B/W           3 words each: size, address, flags
//! raw data        payload starts 16-byte aligned
//! ```
//!
//! The payload is a CMIF header (`SFCI`/`SFCO` magic, version, command or
//! result, token) followed by arguments. Requests to a domain carry a
//! 16-byte domain header in front of it.

use std::ops::Range;

use thiserror::Error;

use crate::kernel::{KernelError, ResultCode};

pub const MESSAGE_SIZE: usize = 0x100;
/// "SFCI"
pub const SFCI_MAGIC: u32 = 0x4943_4653;
/// "SFCO"
pub const SFCO_MAGIC: u32 = 0x4F43_4653;

const CMIF_HEADER_SIZE: usize = 16;
const DOMAIN_HEADER_SIZE: usize = 16;
const MAX_RAW_WORDS: usize = 0x3FF;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("message does not fit the IPC buffer")]
    TooLarge,
    #[error("message truncated")]
    Truncated,
    #[error("bad CMIF magic {0:#010x}")]
    BadMagic(u32),
    #[error("unknown command type {0}")]
    UnknownType(u16),
    #[error("unknown domain command {0}")]
    UnknownDomainCommand(u8),
}

impl From<MessageError> for KernelError {
    fn from(err: MessageError) -> Self {
        match err {
            MessageError::TooLarge => KernelError::MessageTooLarge,
            MessageError::Truncated => KernelError::OutOfRange,
            MessageError::BadMagic(_) => KernelError::InvalidState,
            MessageError::UnknownType(_) | MessageError::UnknownDomainCommand(_) => KernelError::InvalidEnumValue,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum CommandType {
    /// Responses carry type 0
    Invalid = 0,
    LegacyRequest = 1,
    Close = 2,
    LegacyControl = 3,
    Request = 4,
    Control = 5,
    RequestWithContext = 6,
    ControlWithContext = 7,
}

impl CommandType {
    pub fn from_raw(raw: u16) -> Result<Self, MessageError> {
        Ok(match raw {
            0 => CommandType::Invalid,
            1 => CommandType::LegacyRequest,
            2 => CommandType::Close,
            3 => CommandType::LegacyControl,
            4 => CommandType::Request,
            5 => CommandType::Control,
            6 => CommandType::RequestWithContext,
            7 => CommandType::ControlWithContext,
            other => return Err(MessageError::UnknownType(other)),
        })
    }

    pub fn is_request(self) -> bool {
        matches!(self, CommandType::Request | CommandType::RequestWithContext | CommandType::LegacyRequest)
    }

    pub fn is_control(self) -> bool {
        matches!(self, CommandType::Control | CommandType::ControlWithContext | CommandType::LegacyControl)
    }
}

/// Commands of the `Control` type
pub mod control {
    pub const CONVERT_TO_DOMAIN: u32 = 0;
    pub const COPY_FROM_CURRENT_DOMAIN: u32 = 1;
    pub const CLONE_CURRENT_OBJECT: u32 = 2;
    pub const QUERY_POINTER_BUFFER_SIZE: u32 = 3;
    pub const CLONE_CURRENT_OBJECT_EX: u32 = 4;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DomainCommand {
    SendMessage = 1,
    Close = 2,
}

impl DomainCommand {
    fn from_raw(raw: u8) -> Result<Self, MessageError> {
        match raw {
            1 => Ok(DomainCommand::SendMessage),
            2 => Ok(DomainCommand::Close),
            other => Err(MessageError::UnknownDomainCommand(other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DomainHeader {
    pub command: DomainCommand,
    pub object_id: u32,
    pub token: u32,
}

/// X descriptor (pointer buffer)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PointerDescriptor {
    pub addr: u32,
    pub size: u16,
    pub counter: u8,
}

/// A, B or W descriptor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub addr: u32,
    pub size: u32,
    pub flags: u8,
}

/// Decoded first two words
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub ty: u16,
    pub num_x: u8,
    pub num_a: u8,
    pub num_b: u8,
    pub num_w: u8,
    pub raw_words: u16,
    pub has_handles: bool,
}

impl Header {
    pub fn decode(w0: u32, w1: u32) -> Self {
        Header {
            ty: w0 as u16,
            num_x: ((w0 >> 16) & 0xF) as u8,
            num_a: ((w0 >> 20) & 0xF) as u8,
            num_b: ((w0 >> 24) & 0xF) as u8,
            num_w: ((w0 >> 28) & 0xF) as u8,
            raw_words: (w1 & 0x3FF) as u16,
            has_handles: w1 & (1 << 31) != 0,
        }
    }

    pub fn encode(&self) -> [u32; 2] {
        let w0 = self.ty as u32
            | (self.num_x as u32 & 0xF) << 16
            | (self.num_a as u32 & 0xF) << 20
            | (self.num_b as u32 & 0xF) << 24
            | (self.num_w as u32 & 0xF) << 28;
        let w1 = (self.raw_words as u32 & 0x3FF) | (self.has_handles as u32) << 31;
        [w0, w1]
    }
}

/// Handle descriptor fields and where their words live in the buffer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandleDescriptor {
    pub pid: Option<u64>,
    pub copy: Vec<u32>,
    pub moves: Vec<u32>,
    /// Byte offset of the pid words
    pub pid_offset: usize,
    /// Byte offset of the first copy handle; move handles follow
    pub handles_offset: usize,
}

/// Everything but the payload contents
#[derive(Clone, Debug, Default)]
pub struct Layout {
    pub header: Header,
    pub handles: Option<HandleDescriptor>,
    pub pointers: Vec<PointerDescriptor>,
    pub sends: Vec<BufferDescriptor>,
    pub receives: Vec<BufferDescriptor>,
    pub exchanges: Vec<BufferDescriptor>,
    /// Byte range of the 16-byte aligned payload
    pub payload: Range<usize>,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn word(&mut self) -> Result<u32, MessageError> {
        let word = read_u32(self.buf, self.pos)?;
        self.pos += 4;
        Ok(word)
    }
}

pub fn read_u32(buf: &[u8], offset: usize) -> Result<u32, MessageError> {
    let bytes = buf.get(offset..offset + 4).ok_or(MessageError::Truncated)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) -> Result<(), MessageError> {
    buf.get_mut(offset..offset + 4)
        .ok_or(MessageError::TooLarge)?
        .copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn align16(offset: usize) -> usize {
    (offset + 15) & !15
}

impl Layout {
    pub fn parse(buf: &[u8]) -> Result<Self, MessageError> {
        let mut r = Reader { buf, pos: 0 };
        let header = Header::decode(r.word()?, r.word()?);

        let handles = if header.has_handles {
            let desc = r.word()?;
            let pid_offset = r.pos;
            let pid = if desc & 1 != 0 {
                let lo = r.word()? as u64;
                let hi = r.word()? as u64;
                Some(lo | hi << 32)
            } else {
                None
            };
            let handles_offset = r.pos;
            let copy = (0..(desc >> 1) & 0xF).map(|_| r.word()).collect::<Result<Vec<_>, _>>()?;
            let moves = (0..(desc >> 5) & 0xF).map(|_| r.word()).collect::<Result<Vec<_>, _>>()?;
            Some(HandleDescriptor { pid, copy, moves, pid_offset, handles_offset })
        } else {
            None
        };

        let mut pointers = Vec::with_capacity(header.num_x as usize);
        for _ in 0..header.num_x {
            let w0 = r.word()?;
            let addr = r.word()?;
            pointers.push(PointerDescriptor { addr, size: (w0 >> 16) as u16, counter: (w0 & 0x3F) as u8 });
        }
        let mut buffers = |count: u8| -> Result<Vec<BufferDescriptor>, MessageError> {
            (0..count)
                .map(|_| {
                    let size = r.word()?;
                    let addr = r.word()?;
                    let flags = (r.word()? & 3) as u8;
                    Ok(BufferDescriptor { addr, size, flags })
                })
                .collect()
        };
        let sends = buffers(header.num_a)?;
        let receives = buffers(header.num_b)?;
        let exchanges = buffers(header.num_w)?;

        let raw_start = r.pos;
        let raw_end = raw_start + header.raw_words as usize * 4;
        if raw_end > buf.len() {
            return Err(MessageError::Truncated);
        }
        let payload_start = align16(raw_start).min(raw_end);
        Ok(Layout { header, handles, pointers, sends, receives, exchanges, payload: payload_start..raw_end })
    }

    pub fn command_type(&self) -> Result<CommandType, MessageError> {
        CommandType::from_raw(self.header.ty)
    }
}

/// Parsed incoming request
#[derive(Clone, Debug)]
pub struct Request {
    pub ty: CommandType,
    pub pid: Option<u64>,
    pub copy_handles: Vec<u32>,
    pub move_handles: Vec<u32>,
    pub pointers: Vec<PointerDescriptor>,
    pub sends: Vec<BufferDescriptor>,
    pub receives: Vec<BufferDescriptor>,
    pub exchanges: Vec<BufferDescriptor>,
    pub domain: Option<DomainHeader>,
    /// Object ids passed to a domain
    pub input_objects: Vec<u32>,
    pub command: u32,
    pub token: u32,
    /// Arguments after the CMIF header
    pub data: Vec<u8>,
}

impl Request {
    /// Decode a request; `domain` says whether the session is a domain
    pub fn parse(buf: &[u8], domain: bool) -> Result<Self, MessageError> {
        let layout = Layout::parse(buf)?;
        let ty = layout.command_type()?;
        let handles = layout.handles.clone().unwrap_or_default();
        let mut request = Request {
            ty,
            pid: handles.pid,
            copy_handles: handles.copy,
            move_handles: handles.moves,
            pointers: layout.pointers,
            sends: layout.sends,
            receives: layout.receives,
            exchanges: layout.exchanges,
            domain: None,
            input_objects: Vec::new(),
            command: 0,
            token: 0,
            data: Vec::new(),
        };
        if ty == CommandType::Close {
            return Ok(request);
        }

        let mut cmif = layout.payload.clone();
        if domain && ty.is_request() {
            let at = cmif.start;
            let bytes = buf.get(at..at + DOMAIN_HEADER_SIZE).ok_or(MessageError::Truncated)?;
            let command = DomainCommand::from_raw(bytes[0])?;
            let input_count = bytes[1] as usize;
            let data_size = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
            request.domain = Some(DomainHeader {
                command,
                object_id: read_u32(buf, at + 4)?,
                token: read_u32(buf, at + 12)?,
            });
            if command == DomainCommand::Close {
                return Ok(request);
            }
            let data_start = at + DOMAIN_HEADER_SIZE;
            let objects_start = data_start + data_size;
            request.input_objects = (0..input_count)
                .map(|i| read_u32(buf, objects_start + i * 4))
                .collect::<Result<_, _>>()?;
            cmif = data_start..objects_start;
        }

        if cmif.len() < CMIF_HEADER_SIZE {
            return Err(MessageError::Truncated);
        }
        let magic = read_u32(buf, cmif.start)?;
        if magic != SFCI_MAGIC {
            return Err(MessageError::BadMagic(magic));
        }
        request.command = read_u32(buf, cmif.start + 8)?;
        request.token = read_u32(buf, cmif.start + 12)?;
        request.data = buf[cmif.start + CMIF_HEADER_SIZE..cmif.end].to_vec();
        Ok(request)
    }

    pub fn is_domain_close(&self) -> bool {
        matches!(self.domain, Some(DomainHeader { command: DomainCommand::Close, .. }))
    }
}

/// Outgoing reply
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Response {
    pub result: u32,
    pub data: Vec<u8>,
    pub copy_handles: Vec<u32>,
    pub move_handles: Vec<u32>,
    /// Domain object ids created by the command
    pub objects: Vec<u32>,
}

impl Response {
    pub fn new(result: ResultCode) -> Self {
        Response { result: result.raw(), ..Default::default() }
    }

    pub fn result_code(&self) -> ResultCode {
        ResultCode(self.result)
    }

    pub fn encode(&self, domain: bool) -> Result<Vec<u8>, MessageError> {
        let mut payload = Vec::new();
        if domain {
            payload.extend_from_slice(&(self.objects.len() as u32).to_le_bytes());
            payload.extend_from_slice(&[0u8; 12]);
        }
        for word in [SFCO_MAGIC, 0, self.result, 0] {
            payload.extend_from_slice(&word.to_le_bytes());
        }
        payload.extend_from_slice(&self.data);
        if domain {
            pad_to_word(&mut payload);
            for id in &self.objects {
                payload.extend_from_slice(&id.to_le_bytes());
            }
        }
        write_message(
            CommandType::Invalid as u16,
            None,
            &self.copy_handles,
            &self.move_handles,
            &[],
            &[],
            &[],
            &payload,
        )
    }

    pub fn parse(buf: &[u8], domain: bool) -> Result<Self, MessageError> {
        let layout = Layout::parse(buf)?;
        let handles = layout.handles.unwrap_or_default();
        let mut at = layout.payload.start;
        let mut object_count = 0;
        if domain {
            object_count = read_u32(buf, at)? as usize;
            at += DOMAIN_HEADER_SIZE;
        }
        let magic = read_u32(buf, at)?;
        if magic != SFCO_MAGIC {
            return Err(MessageError::BadMagic(magic));
        }
        let result = read_u32(buf, at + 8)?;
        let data_start = at + CMIF_HEADER_SIZE;
        let end = layout.payload.end;
        if data_start > end || object_count * 4 > end - data_start {
            return Err(MessageError::Truncated);
        }
        let data_end = end - object_count * 4;
        let objects = (0..object_count).map(|i| read_u32(buf, data_end + i * 4)).collect::<Result<_, _>>()?;
        Ok(Response {
            result,
            data: buf[data_start..data_end].to_vec(),
            copy_handles: handles.copy,
            move_handles: handles.moves,
            objects,
        })
    }
}

fn pad_to_word(bytes: &mut Vec<u8>) {
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }
}

#[allow(clippy::too_many_arguments)]
fn write_message(
    ty: u16,
    pid: Option<u64>,
    copy: &[u32],
    moves: &[u32],
    pointers: &[PointerDescriptor],
    sends: &[BufferDescriptor],
    receives: &[BufferDescriptor],
    payload: &[u8],
) -> Result<Vec<u8>, MessageError> {
    if copy.len() > 15 || moves.len() > 15 || pointers.len() > 15 || sends.len() > 15 || receives.len() > 15 {
        return Err(MessageError::TooLarge);
    }
    let has_handles = pid.is_some() || !copy.is_empty() || !moves.is_empty();

    let mut words: Vec<u32> = vec![0, 0];
    if has_handles {
        words.push(pid.is_some() as u32 | (copy.len() as u32) << 1 | (moves.len() as u32) << 5);
        if let Some(pid) = pid {
            words.push(pid as u32);
            words.push((pid >> 32) as u32);
        }
        words.extend_from_slice(copy);
        words.extend_from_slice(moves);
    }
    for x in pointers {
        words.push((x.size as u32) << 16 | (x.counter as u32 & 0x3F));
        words.push(x.addr);
    }
    for buffer in sends.iter().chain(receives) {
        words.extend_from_slice(&[buffer.size, buffer.addr, buffer.flags as u32 & 3]);
    }

    let raw_start = words.len() * 4;
    let payload_start = align16(raw_start);
    let end = payload_start + payload.len();
    let raw_words = (end - raw_start + 3) / 4;
    if end > MESSAGE_SIZE || raw_words > MAX_RAW_WORDS {
        return Err(MessageError::TooLarge);
    }
    let header = Header {
        ty,
        num_x: pointers.len() as u8,
        num_a: sends.len() as u8,
        num_b: receives.len() as u8,
        num_w: 0,
        raw_words: raw_words as u16,
        has_handles,
    };
    let [w0, w1] = header.encode();
    words[0] = w0;
    words[1] = w1;

    let mut buf = vec![0u8; MESSAGE_SIZE];
    for (i, word) in words.iter().enumerate() {
        write_u32(&mut buf, i * 4, *word)?;
    }
    buf[payload_start..end].copy_from_slice(payload);
    Ok(buf)
}

/// Assembles request messages; used by host-side clients and tests
#[derive(Clone, Debug)]
pub struct RequestBuilder {
    ty: CommandType,
    command: u32,
    data: Vec<u8>,
    pid: Option<u64>,
    copy: Vec<u32>,
    moves: Vec<u32>,
    pointers: Vec<PointerDescriptor>,
    sends: Vec<BufferDescriptor>,
    receives: Vec<BufferDescriptor>,
    domain: Option<(DomainCommand, u32)>,
}

impl RequestBuilder {
    pub fn new(command: u32) -> Self {
        Self::with_type(CommandType::Request, command)
    }

    pub fn control(command: u32) -> Self {
        Self::with_type(CommandType::Control, command)
    }

    pub fn close() -> Self {
        Self::with_type(CommandType::Close, 0)
    }

    fn with_type(ty: CommandType, command: u32) -> Self {
        RequestBuilder {
            ty,
            command,
            data: Vec::new(),
            pid: None,
            copy: Vec::new(),
            moves: Vec::new(),
            pointers: Vec::new(),
            sends: Vec::new(),
            receives: Vec::new(),
            domain: None,
        }
    }

    pub fn data(mut self, bytes: &[u8]) -> Self {
        self.data.extend_from_slice(bytes);
        self
    }

    pub fn push_u32(self, value: u32) -> Self {
        self.data(&value.to_le_bytes())
    }

    pub fn send_pid(mut self) -> Self {
        self.pid = Some(0);
        self
    }

    pub fn copy_handle(mut self, handle: u32) -> Self {
        self.copy.push(handle);
        self
    }

    pub fn move_handle(mut self, handle: u32) -> Self {
        self.moves.push(handle);
        self
    }

    pub fn pointer(mut self, addr: u32, size: u16) -> Self {
        let counter = self.pointers.len() as u8;
        self.pointers.push(PointerDescriptor { addr, size, counter });
        self
    }

    pub fn send_buffer(mut self, addr: u32, size: u32) -> Self {
        self.sends.push(BufferDescriptor { addr, size, flags: 0 });
        self
    }

    pub fn receive_buffer(mut self, addr: u32, size: u32) -> Self {
        self.receives.push(BufferDescriptor { addr, size, flags: 0 });
        self
    }

    /// Address a domain object
    pub fn domain_object(mut self, object_id: u32) -> Self {
        self.domain = Some((DomainCommand::SendMessage, object_id));
        self
    }

    /// Close a domain object
    pub fn domain_close(object_id: u32) -> Self {
        let mut builder = Self::new(0);
        builder.domain = Some((DomainCommand::Close, object_id));
        builder
    }

    pub fn build(&self) -> Result<Vec<u8>, MessageError> {
        let mut payload = Vec::new();
        if self.ty != CommandType::Close {
            let mut cmif = Vec::with_capacity(CMIF_HEADER_SIZE + self.data.len());
            for word in [SFCI_MAGIC, 0, self.command, 0] {
                cmif.extend_from_slice(&word.to_le_bytes());
            }
            cmif.extend_from_slice(&self.data);
            pad_to_word(&mut cmif);

            match self.domain {
                Some((command, object_id)) => {
                    let size = if command == DomainCommand::Close { 0 } else { cmif.len() };
                    payload.push(command as u8);
                    payload.push(0);
                    payload.extend_from_slice(&(size as u16).to_le_bytes());
                    payload.extend_from_slice(&object_id.to_le_bytes());
                    payload.extend_from_slice(&[0u8; 8]);
                    if command == DomainCommand::SendMessage {
                        payload.extend_from_slice(&cmif);
                    }
                }
                None => payload = cmif,
            }
        }
        write_message(
            self.ty as u16,
            self.pid,
            &self.copy,
            &self.moves,
            &self.pointers,
            &self.sends,
            &self.receives,
            &payload,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let buf = RequestBuilder::new(7)
            .push_u32(0xAABB_CCDD)
            .send_pid()
            .copy_handle(0x8001)
            .move_handle(0x8002)
            .send_buffer(0x2000, 0x40)
            .receive_buffer(0x3000, 0x80)
            .build()
            .unwrap();
        assert_eq!(buf.len(), MESSAGE_SIZE);

        let header = Header::decode(read_u32(&buf, 0).unwrap(), read_u32(&buf, 4).unwrap());
        assert_eq!(header.ty, CommandType::Request as u16);
        assert_eq!((header.num_a, header.num_b), (1, 1));
        assert!(header.has_handles);
        // pid + copy 1 + move 1
        assert_eq!(read_u32(&buf, 8).unwrap(), 1 | 1 << 1 | 1 << 5);

        let request = Request::parse(&buf, false).unwrap();
        assert_eq!(request.command, 7);
        assert_eq!(request.pid, Some(0));
        assert_eq!(request.copy_handles, vec![0x8001]);
        assert_eq!(request.move_handles, vec![0x8002]);
        assert_eq!(request.sends[0], BufferDescriptor { addr: 0x2000, size: 0x40, flags: 0 });
        assert_eq!(request.receives[0].addr, 0x3000);
        assert_eq!(&request.data[..4], &0xAABB_CCDDu32.to_le_bytes());
    }

    #[test]
    fn test_payload_is_16_byte_aligned() {
        let buf = RequestBuilder::new(1).copy_handle(5).build().unwrap();
        let layout = Layout::parse(&buf).unwrap();
        // Header, descriptor and one handle end at byte 16
        assert_eq!(layout.payload.start, 16);
        assert_eq!(read_u32(&buf, 16).unwrap(), SFCI_MAGIC);

        let buf = RequestBuilder::new(1).build().unwrap();
        assert_eq!(Layout::parse(&buf).unwrap().payload.start, 16);
        assert_eq!(read_u32(&buf, 8).unwrap(), 0);
    }

    #[test]
    fn test_domain_request() {
        let buf = RequestBuilder::new(3).domain_object(2).push_u32(9).build().unwrap();
        let request = Request::parse(&buf, true).unwrap();
        let domain = request.domain.unwrap();
        assert_eq!(domain.command, DomainCommand::SendMessage);
        assert_eq!(domain.object_id, 2);
        assert_eq!(request.command, 3);
        assert_eq!(request.data, 9u32.to_le_bytes());

        let close = Request::parse(&RequestBuilder::domain_close(2).build().unwrap(), true).unwrap();
        assert!(close.is_domain_close());
    }

    #[test]
    fn test_response_with_objects() {
        let response = Response {
            result: 0,
            data: vec![1, 2, 3, 4],
            copy_handles: vec![0x10],
            move_handles: vec![],
            objects: vec![5, 6],
        };
        let buf = response.encode(true).unwrap();
        assert_eq!(Response::parse(&buf, true).unwrap(), response);
        assert_eq!(Header::decode(read_u32(&buf, 0).unwrap(), 0).ty, 0);
    }

    #[test]
    fn test_errors() {
        let mut buf = RequestBuilder::new(1).build().unwrap();
        write_u32(&mut buf, 16, 0x1234).unwrap();
        assert_eq!(Request::parse(&buf, false).unwrap_err(), MessageError::BadMagic(0x1234));

        let big = RequestBuilder::new(1).data(&[0u8; 0x100]).build();
        assert_eq!(big.unwrap_err(), MessageError::TooLarge);

        let mut buf = RequestBuilder::new(1).build().unwrap();
        write_u32(&mut buf, 0, 9).unwrap();
        assert_eq!(Request::parse(&buf, false).unwrap_err(), MessageError::UnknownType(9));
        assert_eq!(KernelError::from(MessageError::TooLarge), KernelError::MessageTooLarge);
    }

    #[test]
    fn test_close_has_no_payload() {
        let request = Request::parse(&RequestBuilder::close().build().unwrap(), false).unwrap();
        assert_eq!(request.ty, CommandType::Close);
        assert!(request.data.is_empty());
    }
}
