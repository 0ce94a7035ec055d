//! Host bridge for sandboxed tensor modules.
//!
//! A compiled module runs inside a memory-sandboxed virtual machine with its
//! own linear memory. This crate lets the host drive it:
//!
//! - [`codec`] and [`value`]: the 16-byte tagged-value wire format and its
//!   host-side representation.
//! - [`arena`]: reusable scratch buffers in sandbox memory for in-flight
//!   calls.
//! - [`scope`]: scope frames that release foreign handles deterministically.
//! - [`calling`]: outbound calls, host callbacks and the global function
//!   registry, exposed through the [`Bridge`] extension trait.
//! - [`suspend`]: cooperative suspension so a foreign call can await host
//!   futures.
//! - [`sandbox`]: the [`Sandbox`] seam a concrete module implements, with
//!   [`wasm::WasmSandbox`] as the Wasmtime-backed implementation.
//!
//! # Example
//!
//! ```ignore
//! use sandlink_bridge::{Bridge, BridgeConfig, Sandbox, Value, WasmSandbox};
//!
//! let engine = wasmtime::Engine::default();
//! let mut sandbox = WasmSandbox::new(&engine, std::fs::read("model.wasm")?, BridgeConfig::default())?;
//!
//! sandbox.register("host.add1", |_: &mut dyn Sandbox, args: &[Value]| {
//!     Ok(Value::Int(args[0].as_i64()? + 1))
//! }, false)?;
//!
//! let result = sandbox.with_scope(|s| s.call("module.run", &[Value::Int(41)]))?;
//! ```

pub mod arena;
pub mod calling;
pub mod codec;
pub mod error;
pub mod memory;
pub mod sandbox;
pub mod scope;
pub mod suspend;
pub mod value;
pub mod wasm;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use calling::{Bridge, HostFunction};
pub use error::{Error, Result};
pub use sandbox::{BridgeConfig, BridgeState, Sandbox, SuspendState};
pub use suspend::{call_async, wrap_async};
pub use value::{DataType, Device, DeviceType, Handle, Module, Object, PackedFunc, Tensor, Tracked, Value};
pub use wasm::WasmSandbox;
