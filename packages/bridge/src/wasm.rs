//! A [`Sandbox`] backed by a core WebAssembly module running in Wasmtime.
//!
//! The module exports the `sandlink_*` runtime ABI and imports
//! `env.sandlink_host_call` / `env.sandlink_host_release`, which route
//! foreign calls of host-backed functions into the bridge. If the module was
//! built with asyncify, its `asyncify_*` exports drive suspension.

use tracing::debug;
use wasmtime::{
    AsContext, AsContextMut, Caller, Engine, Instance, Linker, Memory, Module, Store, TypedFunc,
};

use crate::calling;
use crate::error::{Error, Result};
use crate::memory;
use crate::sandbox::{BridgeConfig, BridgeState, Sandbox, SuspendState};

/// Bytes reserved for the saved stack of an unwound call.
const ASYNCIFY_STACK_BYTES: u32 = 64 * 1024;

/// State held by the Wasmtime store of a sandbox.
pub struct WasmState {
    pub bridge: BridgeState,
    exports: Option<Exports>,
}

#[derive(Clone)]
struct Asyncify {
    start_unwind: TypedFunc<u32, ()>,
    stop_unwind: TypedFunc<(), ()>,
    start_rewind: TypedFunc<u32, ()>,
    stop_rewind: TypedFunc<(), ()>,
    get_state: TypedFunc<(), i32>,
    /// `{current: u32, end: u32}` followed by the stack area.
    data: u32,
}

#[derive(Clone)]
struct Exports {
    memory: Memory,
    alloc: TypedFunc<u32, u32>,
    free: TypedFunc<u32, ()>,
    func_call: TypedFunc<(u32, u32, u32, u32), i32>,
    get_global_func: TypedFunc<(u32, u32), i32>,
    register_global_func: TypedFunc<(u32, u32, i32), i32>,
    func_create_from_host: TypedFunc<(u32, u32), i32>,
    set_return: TypedFunc<(u32, u32), i32>,
    set_last_error: TypedFunc<(u32, u32), ()>,
    last_error: TypedFunc<(), u32>,
    object_retain: TypedFunc<u32, ()>,
    object_free: TypedFunc<u32, i32>,
    asyncify: Option<Asyncify>,
}

impl Exports {
    fn resolve(mut store: impl AsContextMut, instance: &Instance) -> Result<Self> {
        let mut store = store.as_context_mut();
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| Error::Sandbox("module does not export `memory`".into()))?;

        macro_rules! export {
            ($name:literal) => {
                instance
                    .get_typed_func(&mut store, $name)
                    .map_err(|e| Error::Sandbox(format!("export `{}`: {e}", $name)))?
            };
        }

        let asyncify = if instance.get_export(&mut store, "asyncify_get_state").is_some() {
            Some(Asyncify {
                start_unwind: export!("asyncify_start_unwind"),
                stop_unwind: export!("asyncify_stop_unwind"),
                start_rewind: export!("asyncify_start_rewind"),
                stop_rewind: export!("asyncify_stop_rewind"),
                get_state: export!("asyncify_get_state"),
                data: 0,
            })
        } else {
            None
        };

        Ok(Self {
            memory,
            alloc: export!("sandlink_alloc"),
            free: export!("sandlink_free"),
            func_call: export!("sandlink_func_call"),
            get_global_func: export!("sandlink_get_global_func"),
            register_global_func: export!("sandlink_register_global_func"),
            func_create_from_host: export!("sandlink_func_create_from_host"),
            set_return: export!("sandlink_set_return"),
            set_last_error: export!("sandlink_set_last_error"),
            last_error: export!("sandlink_last_error"),
            object_retain: export!("sandlink_object_retain"),
            object_free: export!("sandlink_object_free"),
            asyncify,
        })
    }
}

/// Store-like contexts that carry a [`WasmState`].
pub trait WasmStore: AsContextMut<Data = WasmState> {
    fn wasm_state(&mut self) -> &mut WasmState;
}

impl WasmStore for Store<WasmState> {
    fn wasm_state(&mut self) -> &mut WasmState {
        self.data_mut()
    }
}

impl WasmStore for Caller<'_, WasmState> {
    fn wasm_state(&mut self) -> &mut WasmState {
        self.data_mut()
    }
}

/// A Wasmtime context driven through the bridge ABI.
///
/// [`WasmSandbox`] owns its store. Host callbacks run on a context that
/// borrows the calling instance, so they can call back into the module.
pub struct WasmContext<C> {
    ctx: C,
    exports: Exports,
}

/// A sandbox owning its Wasmtime store.
pub type WasmSandbox = WasmContext<Store<WasmState>>;

impl WasmContext<Store<WasmState>> {
    /// Compile and instantiate a module (binary or text format).
    pub fn new(engine: &Engine, wasm: impl AsRef<[u8]>, config: BridgeConfig) -> Result<Self> {
        let module = Module::new(engine, wasm.as_ref()).map_err(Error::sandbox)?;
        let mut linker = Linker::new(engine);
        link_host_imports(&mut linker)?;

        let mut store = Store::new(
            engine,
            WasmState {
                bridge: BridgeState::new(config),
                exports: None,
            },
        );
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(Error::sandbox)?;
        let exports = Exports::resolve(&mut store, &instance)?;

        let mut sandbox = WasmContext {
            ctx: store,
            exports,
        };
        sandbox.init_asyncify()?;
        let exports = sandbox.exports.clone();
        sandbox.ctx.data_mut().exports = Some(exports);
        debug!(
            asyncify = sandbox.exports.asyncify.is_some(),
            "instantiated sandbox module"
        );
        Ok(sandbox)
    }

    pub fn store(&self) -> &Store<WasmState> {
        &self.ctx
    }
}

impl<C: WasmStore> WasmContext<C> {
    fn init_asyncify(&mut self) -> Result<()> {
        if self.exports.asyncify.is_none() {
            return Ok(());
        }
        let data = self.alloc(ASYNCIFY_STACK_BYTES + 8)?;
        if let Some(asyncify) = self.exports.asyncify.as_mut() {
            asyncify.data = data;
        }
        Ok(())
    }

    fn asyncify(&self, op: &str) -> Result<Asyncify> {
        self.exports
            .asyncify
            .clone()
            .ok_or_else(|| Error::SuspensionUnsupported(op.to_string()))
    }
}

fn link_host_imports(linker: &mut Linker<WasmState>) -> Result<()> {
    linker
        .func_wrap(
            "env",
            "sandlink_host_call",
            |caller: Caller<'_, WasmState>, resource: u32, args: u32, nargs: u32, ret: u32| -> i32 {
                let Some(exports) = caller.data().exports.clone() else {
                    return -1;
                };
                let mut sandbox = WasmContext {
                    ctx: caller,
                    exports,
                };
                calling::dispatch_callback(&mut sandbox, resource, args, nargs, ret)
            },
        )
        .map_err(Error::sandbox)?;
    linker
        .func_wrap(
            "env",
            "sandlink_host_release",
            |mut caller: Caller<'_, WasmState>, resource: u32| {
                calling::release_callback(&mut caller.data_mut().bridge, resource);
            },
        )
        .map_err(Error::sandbox)?;
    Ok(())
}

impl<C: WasmStore> Sandbox for WasmContext<C> {
    fn state(&mut self) -> &mut BridgeState {
        &mut self.ctx.wasm_state().bridge
    }

    fn memory(&self) -> &[u8] {
        self.exports.memory.data(self.ctx.as_context())
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        self.exports.memory.data_mut(self.ctx.as_context_mut())
    }

    fn alloc(&mut self, nbytes: u32) -> Result<u32> {
        let ptr = self
            .exports
            .alloc
            .call(&mut self.ctx, nbytes)
            .map_err(Error::sandbox)?;
        if ptr == 0 {
            return Err(Error::Sandbox(format!("out of memory allocating {nbytes} bytes")));
        }
        Ok(ptr)
    }

    fn free(&mut self, ptr: u32) -> Result<()> {
        self.exports
            .free
            .call(&mut self.ctx, ptr)
            .map_err(Error::sandbox)
    }

    fn func_call(&mut self, func: u32, args: u32, nargs: u32, ret: u32) -> Result<i32> {
        self.exports
            .func_call
            .call(&mut self.ctx, (func, args, nargs, ret))
            .map_err(Error::sandbox)
    }

    fn get_global_func(&mut self, name: u32, out: u32) -> Result<i32> {
        self.exports
            .get_global_func
            .call(&mut self.ctx, (name, out))
            .map_err(Error::sandbox)
    }

    fn register_global_func(&mut self, name: u32, func: u32, override_existing: bool) -> Result<i32> {
        self.exports
            .register_global_func
            .call(&mut self.ctx, (name, func, i32::from(override_existing)))
            .map_err(Error::sandbox)
    }

    fn func_create_from_host(&mut self, resource: u32, out: u32) -> Result<i32> {
        self.exports
            .func_create_from_host
            .call(&mut self.ctx, (resource, out))
            .map_err(Error::sandbox)
    }

    fn set_return(&mut self, ret: u32, value: u32) -> Result<i32> {
        self.exports
            .set_return
            .call(&mut self.ctx, (ret, value))
            .map_err(Error::sandbox)
    }

    fn set_last_error(&mut self, kind: u32, message: u32) -> Result<()> {
        self.exports
            .set_last_error
            .call(&mut self.ctx, (kind, message))
            .map_err(Error::sandbox)
    }

    fn last_error(&mut self) -> Result<u32> {
        self.exports
            .last_error
            .call(&mut self.ctx, ())
            .map_err(Error::sandbox)
    }

    fn object_retain(&mut self, handle: u32) -> Result<()> {
        self.exports
            .object_retain
            .call(&mut self.ctx, handle)
            .map_err(Error::sandbox)
    }

    fn object_free(&mut self, handle: u32) -> Result<i32> {
        self.exports
            .object_free
            .call(&mut self.ctx, handle)
            .map_err(Error::sandbox)
    }

    fn suspend_state(&mut self) -> Result<SuspendState> {
        let Some(asyncify) = self.exports.asyncify.clone() else {
            return Ok(SuspendState::Normal);
        };
        let code = asyncify
            .get_state
            .call(&mut self.ctx, ())
            .map_err(Error::sandbox)?;
        SuspendState::from_code(code)
    }

    fn start_unwind(&mut self) -> Result<()> {
        let asyncify = self.asyncify("start_unwind")?;
        let stack = memory::offset(asyncify.data, 8)?;
        let stack_end = memory::offset(stack, ASYNCIFY_STACK_BYTES)?;
        let mem = self.memory_mut();
        memory::write_u32(mem, asyncify.data, stack)?;
        memory::write_u32(mem, memory::offset(asyncify.data, 4)?, stack_end)?;
        asyncify
            .start_unwind
            .call(&mut self.ctx, asyncify.data)
            .map_err(Error::sandbox)
    }

    fn stop_unwind(&mut self) -> Result<()> {
        let asyncify = self.asyncify("stop_unwind")?;
        asyncify
            .stop_unwind
            .call(&mut self.ctx, ())
            .map_err(Error::sandbox)
    }

    fn start_rewind(&mut self) -> Result<()> {
        let asyncify = self.asyncify("start_rewind")?;
        asyncify
            .start_rewind
            .call(&mut self.ctx, asyncify.data)
            .map_err(Error::sandbox)
    }

    fn stop_rewind(&mut self) -> Result<()> {
        let asyncify = self.asyncify("stop_rewind")?;
        asyncify
            .stop_rewind
            .call(&mut self.ctx, ())
            .map_err(Error::sandbox)
    }
}
