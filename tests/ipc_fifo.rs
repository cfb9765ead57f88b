mod common;

use common::*;
use otohle::cpu::asm::{self, reg::*};
use otohle::ipc::message::Layout;
use otohle::ipc::{RequestBuilder, Response};
use otohle::kernel::svc::nr;
use otohle::kernel::ThreadState;
use otohle::{LoadOptions, ProcessState, ResultCode};

const CLIENTS: u32 = 6;

const SERVER_HANDLE: u32 = DATA;
const CLIENT_HANDLE: u32 = DATA + 4;
const MSG: u32 = DATA + 0x100;
const REPLY: u32 = DATA + 0x200;
const LOG: u32 = DATA + 0x300;

/// Server loop at label 0, client body at the returned label
fn program(arg_offset: i32) -> (Program, usize) {
    let mut p = Program::new();
    p.li(S0, LOG).emit(asm::addi(S1, ZERO, 0));
    let top = p.label();
    p.li(A0, SERVER_HANDLE)
        .emit(asm::addi(A1, ZERO, 1))
        .emit(asm::addi(A2, S1, 0))
        .emit(asm::addi(A3, ZERO, -1))
        .emit(asm::addi(A4, ZERO, -1))
        .svc(nr::REPLY_AND_RECEIVE);
    // Record which client this request came from
    p.emit(asm::lw(T0, TP, arg_offset)).emit(asm::sw(S0, T0, 0)).emit(asm::addi(S0, S0, 4));
    p.copy_to_tls(REPLY);
    p.li(T0, SERVER_HANDLE).emit(asm::lw(S1, T0, 0));
    let back = p.offset_to(top);
    p.emit(asm::jal(ZERO, back));

    let client = p.label();
    p.copy_to_tls(MSG);
    p.emit(asm::sw(TP, A0, arg_offset));
    p.li(T0, CLIENT_HANDLE).emit(asm::lw(A0, T0, 0)).svc(nr::SEND_SYNC_REQUEST);
    p.svc(nr::EXIT_THREAD);
    (p, client)
}

#[test]
fn test_requests_are_served_in_arrival_order() {
    let message = RequestBuilder::new(3).push_u32(0xFFFF_FFFF).build().unwrap();
    let layout = Layout::parse(&message).unwrap();
    let arg_offset = (layout.payload.start + 16) as i32;
    let reply = Response::new(ResultCode::SUCCESS).encode(false).unwrap();

    let emu = emulator(1);
    let (code, client_label) = program(arg_offset);
    let opts = LoadOptions { priority: 40, core: 0, ..LoadOptions::default() };
    let loaded = emu.load_flat_image("fifo", &code.bytes(), &opts).unwrap();
    let pid = loaded.process;

    map_data(&emu, pid);
    let (server, client) = emu.kernel().lock().create_session_pair(pid).unwrap();
    write_u32(&emu, pid, SERVER_HANDLE, server);
    write_u32(&emu, pid, CLIENT_HANDLE, client);
    emu.write_memory(pid, MSG, &message).unwrap();
    emu.write_memory(pid, REPLY, &reply).unwrap();

    // Higher priority than the server, so every request is queued before
    // the server first runs
    let entry = opts.base + client_label as u32 * 4;
    let clients: Vec<_> = (0..CLIENTS)
        .map(|i| emu.create_thread(pid, entry, i, DATA + DATA_SIZE - i * 0x100, 30, 0).unwrap())
        .collect();

    emu.run_until_idle(10_000);

    let log: Vec<u32> = (0..CLIENTS).map(|i| read_u32(&emu, pid, LOG + i * 4)).collect();
    assert_eq!(log, (0..CLIENTS).collect::<Vec<_>>());
    // The server is left blocked waiting for a seventh request
    assert_eq!(read_u32(&emu, pid, LOG + CLIENTS * 4), 0);
    assert_eq!(emu.process_state(pid), Some(ProcessState::Running));
    for tid in clients {
        assert!(emu.thread_state(tid).map_or(true, |s| s == ThreadState::Terminated));
    }
}

#[test]
fn test_closing_server_fails_queued_requests() {
    let message = RequestBuilder::new(3).push_u32(0).build().unwrap();

    // The main thread exits at once; the second thread sends one request
    let mut code = Program::new();
    code.svc(nr::EXIT_THREAD);
    let client_label = code.label();
    code.copy_to_tls(MSG);
    code.li(T0, CLIENT_HANDLE).emit(asm::lw(A0, T0, 0)).svc(nr::SEND_SYNC_REQUEST);
    code.li(T0, REPLY).emit(asm::sw(T0, A0, 0));
    code.svc(nr::EXIT_PROCESS);

    let emu = emulator(1);
    let loaded = emu.load_flat_image("closed", &code.bytes(), &LoadOptions::default()).unwrap();
    let pid = loaded.process;
    map_data(&emu, pid);
    let (server, client) = emu.kernel().lock().create_session_pair(pid).unwrap();
    write_u32(&emu, pid, CLIENT_HANDLE, client);
    emu.write_memory(pid, MSG, &message).unwrap();

    let entry = LoadOptions::default().base + client_label as u32 * 4;
    let sender = emu.create_thread(pid, entry, 0, DATA + DATA_SIZE, 30, 0).unwrap();
    emu.run_until_idle(100);
    assert!(matches!(emu.thread_state(sender), Some(ThreadState::Waiting(_))));

    emu.kernel().lock().close_handle(pid, server).unwrap();
    emu.run_until_idle(100);

    assert_eq!(emu.process_state(pid), Some(ProcessState::Exited));
    assert_eq!(read_u32(&emu, pid, REPLY), otohle::KernelError::SessionClosed.code().raw());
}
