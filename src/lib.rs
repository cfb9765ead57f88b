//! otohle
//!
//! User-mode RV32IMAC guest emulator with a block translator and a
//! Horizon-style kernel: processes, threads, handles, priority scheduling
//! across emulated cores, synchronization primitives and session-based IPC
//! to guest or host-implemented services. Runs natively or in the browser
//! through the wasm facade at the bottom of this file.

use wasm_bindgen::prelude::*;

pub mod config;
pub mod cpu;
pub mod image;
pub mod ipc;
pub mod kernel;
mod lock;
pub mod memory;
pub mod snapshot;
pub mod system;

pub use config::{EmulatorConfig, TimeSourceKind};
pub use ipc::{ServiceCtx, ServiceHandler};
pub use kernel::{KernelError, ProcessId, ProcessState, ResultCode, ThreadId};
pub use snapshot::{ExitReason, ProcessSnapshot};
pub use system::{CoreStep, Emulator, EmulatorError, KernelHandle, LoadOptions, LoadedImage};

/// Initialize panic hook for better error messages in browser console
#[wasm_bindgen(start)]
pub fn init() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// Emulator interface exposed to JavaScript
///
/// Single-threaded and driven by the page: every `run` call steps the
/// cores round-robin. The clock is manual and only moves through
/// `advance_time` or when every core is idle waiting for a deadline.
#[wasm_bindgen(js_name = Emulator)]
pub struct WebEmulator {
    emulator: Emulator,
    processes: Vec<ProcessId>,
}

#[wasm_bindgen(js_class = Emulator)]
impl WebEmulator {
    #[wasm_bindgen(constructor)]
    pub fn new(cores: u32) -> Result<WebEmulator, JsValue> {
        let config = EmulatorConfig::deterministic(cores as usize);
        let emulator = Emulator::new(config).map_err(to_js)?;
        Ok(WebEmulator { emulator, processes: Vec::new() })
    }

    /// Load a flat image (plain, gzip or zstd) at the default base; returns
    /// an index for the other process queries
    pub fn load_image(&mut self, name: &str, data: &[u8]) -> Result<u32, JsValue> {
        let loaded = self
            .emulator
            .load_flat_image(name, data, &LoadOptions::default())
            .map_err(to_js)?;
        self.processes.push(loaded.process);
        Ok(self.processes.len() as u32 - 1)
    }

    /// Run up to `max_slices` slices; returns how many ran
    pub fn run(&mut self, max_slices: u32) -> u32 {
        self.emulator.run_until_idle(max_slices as usize) as u32
    }

    pub fn advance_time(&mut self, ns: f64) {
        self.emulator.advance_time(ns.max(0.0) as u64);
    }

    pub fn is_finished(&self) -> bool {
        self.emulator.is_finished()
    }

    pub fn debug_output(&self, index: u32) -> String {
        self.process(index).map(|pid| self.emulator.debug_output(pid)).unwrap_or_default()
    }

    /// "running", "exited" or "crashed"
    pub fn process_state(&self, index: u32) -> Option<String> {
        let state = self.emulator.process_state(self.process(index)?)?;
        Some(
            match state {
                ProcessState::Running => "running",
                ProcessState::Exited => "exited",
                ProcessState::Crashed => "crashed",
            }
            .to_string(),
        )
    }

    pub fn exit_reason(&self, index: u32) -> Option<String> {
        self.emulator.exit_reason(self.process(index)?).map(|reason| reason.to_string())
    }

    /// Compressed crash report of a process that died on a fault
    pub fn crash_report(&self, index: u32) -> Result<Option<Vec<u8>>, JsValue> {
        let Some(report) = self.process(index).and_then(|pid| self.emulator.crash_report(pid)) else {
            return Ok(None);
        };
        report.to_bytes().map(Some).map_err(to_js)
    }
}

impl WebEmulator {
    fn process(&self, index: u32) -> Option<ProcessId> {
        self.processes.get(index as usize).copied()
    }
}

fn to_js(err: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::asm::{self, reg::*};
    use crate::kernel::svc::nr;

    #[test]
    fn test_facade_runs_image() {
        let mut emu = WebEmulator::new(1).unwrap();
        let code = asm::assemble(&[asm::addi(A7, ZERO, nr::EXIT_PROCESS as i32), asm::ecall()]);
        let index = emu.load_image("demo", &code).unwrap();
        assert!(emu.run(10) > 0);
        assert!(emu.is_finished());
        assert_eq!(emu.process_state(index).as_deref(), Some("exited"));
        assert_eq!(emu.exit_reason(index).as_deref(), Some("exited"));
        assert_eq!(emu.crash_report(index).ok(), Some(None));
        assert_eq!(emu.process_state(7), None);
    }
}
