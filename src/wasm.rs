//! WebAssembly bindings for the bus machine.
//!
//! This module provides JavaScript-friendly wrappers around the
//! deterministic driver.

use wasm_bindgen::prelude::*;
use js_sys::Array;
use crate::asm::Program;
use crate::config::MachineConfig;
use crate::machine::Machine;

/// Initialize panic hook for better error messages in console.
#[wasm_bindgen(start)]
pub fn init() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

fn js_error(e: impl std::fmt::Display) -> JsError {
    JsError::new(&e.to_string())
}

/// WebAssembly-friendly machine wrapper.
#[wasm_bindgen]
pub struct WasmMachine {
    machine: Machine,
    program: Option<Program>,
}

#[wasm_bindgen]
impl WasmMachine {
    /// Create a machine from a JSON configuration. An empty string uses the defaults.
    #[wasm_bindgen(constructor)]
    pub fn new(config_json: &str) -> Result<WasmMachine, JsError> {
        let config = if config_json.trim().is_empty() {
            MachineConfig::default()
        } else {
            MachineConfig::from_json(config_json).map_err(js_error)?
        };
        let machine = Machine::new(config).map_err(js_error)?;
        Ok(Self { machine, program: None })
    }

    /// Assemble and load source on a fresh machine. Returns the instruction count.
    #[wasm_bindgen]
    pub fn load_asm(&mut self, source: &str) -> Result<usize, JsError> {
        let program = self.machine.assemble(source).map_err(js_error)?;
        self.machine = Machine::new(self.machine.config().clone()).map_err(js_error)?;
        self.machine.load(&program).map_err(js_error)?;

        let len = program.len();
        self.program = Some(program);
        Ok(len)
    }

    /// One bus, memory and CPU tick. Returns whether the machine is now idle.
    #[wasm_bindgen]
    pub fn step(&mut self) -> Result<bool, JsError> {
        self.machine.step().map_err(js_error)?;
        Ok(self.machine.is_idle())
    }

    /// Step until idle or `max_steps`. Returns the steps taken.
    #[wasm_bindgen]
    pub fn run_until_idle(&mut self, max_steps: u32) -> Result<u32, JsError> {
        let steps = self.machine.run_until_idle(max_steps as u64).map_err(js_error)?;
        Ok(steps as u32)
    }

    /// Rebuild the machine and reload the last program.
    #[wasm_bindgen]
    pub fn reset(&mut self) -> Result<(), JsError> {
        self.machine = Machine::new(self.machine.config().clone()).map_err(js_error)?;
        if let Some(program) = &self.program {
            self.machine.load(program).map_err(js_error)?;
        }
        Ok(())
    }

    #[wasm_bindgen]
    pub fn is_idle(&self) -> bool {
        self.machine.is_idle()
    }

    #[wasm_bindgen]
    pub fn steps(&self) -> f64 {
        self.machine.steps() as f64
    }

    /// Register values as `[name, value]` pairs.
    #[wasm_bindgen]
    pub fn registers(&self) -> Array {
        self.machine
            .cpu()
            .registers()
            .iter()
            .map(|(name, value)| {
                let pair = Array::new();
                pair.push(&JsValue::from_str(name));
                pair.push(&JsValue::from_f64(value as f64));
                JsValue::from(pair)
            })
            .collect()
    }

    /// The whole data region, one number per address.
    #[wasm_bindgen]
    pub fn memory(&self) -> Array {
        let memory = self.machine.memory();
        (0..memory.data_len() as i64)
            .map(|address| JsValue::from_f64(memory.read_data(address).unwrap_or_default() as f64))
            .collect()
    }

    /// Current loop state as text.
    #[wasm_bindgen]
    pub fn loop_state(&self) -> String {
        self.machine.cpu().loop_state().to_string()
    }

    /// Full machine snapshot as JSON.
    #[wasm_bindgen]
    pub fn snapshot_json(&self) -> Result<String, JsError> {
        serde_json::to_string(&self.machine.snapshot()).map_err(js_error)
    }
}

/// Assemble with the default configuration and return the instruction count.
#[wasm_bindgen]
pub fn wasm_assemble(source: &str) -> Result<usize, JsError> {
    let machine = Machine::new(MachineConfig::default()).map_err(js_error)?;
    let program = machine.assemble(source).map_err(js_error)?;
    Ok(program.len())
}
