//! Calling convention across the sandbox boundary.
//!
//! Outbound calls encode their arguments and a `None` return slot into an
//! arena buffer, commit it, invoke the foreign entry point and decode the
//! result, attaching any returned handle to the current scope.
//!
//! Inbound calls go through host functions registered in the session's
//! [`CallbackTable`]. The foreign module only ever sees a function handle
//! bound to a resource index; when it calls that handle, the sandbox routes
//! the call to [`dispatch_callback`]. Host failures, including panics, never
//! cross the boundary: they are written into the foreign error channel as a
//! `CallbackError` and reported with status `-1`.

use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::arena::ArenaBuffer;
use crate::codec::{self, DecodeMode, RECORD_BYTES};
use crate::error::{Error, Result};
use crate::memory;
use crate::sandbox::{BridgeState, Sandbox, SuspendState};
use crate::scope;
use crate::suspend;
use crate::value::{Handle, PackedFunc, Tracked, Value};

/// A host function callable from the foreign module.
pub type HostFunction = Rc<dyn Fn(&mut dyn Sandbox, &[Value]) -> Result<Value>>;

/// Host functions reachable from the foreign side, indexed by resource id.
#[derive(Default)]
pub struct CallbackTable {
    slots: Vec<Option<HostFunction>>,
    free: Vec<u32>,
}

impl CallbackTable {
    fn insert(&mut self, f: HostFunction) -> u32 {
        if let Some(resource) = self.free.pop() {
            self.slots[resource as usize] = Some(f);
            return resource;
        }
        self.slots.push(Some(f));
        u32::try_from(self.slots.len() - 1).unwrap_or(u32::MAX)
    }

    fn get(&self, resource: u32) -> Option<HostFunction> {
        self.slots.get(resource as usize).and_then(Clone::clone)
    }

    fn release(&mut self, resource: u32) -> bool {
        match self.slots.get_mut(resource as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                self.free.push(resource);
                true
            }
            _ => false,
        }
    }

    /// Number of occupied slots.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Run `f` with a freshly checked-out arena buffer, recycling it afterwards
/// whatever the outcome.
pub(crate) fn with_arena<S, R>(
    sandbox: &mut S,
    f: impl FnOnce(&mut S, &mut ArenaBuffer) -> Result<R>,
) -> Result<R>
where
    S: Sandbox + ?Sized,
{
    let mut buf = sandbox.state().arena.checkout();
    let result = f(sandbox, &mut buf);
    sandbox.state().arena.recycle(buf);
    result
}

/// Read the foreign `{kind, message}` pair left by a failed call.
pub(crate) fn last_error<S: Sandbox + ?Sized>(sandbox: &mut S) -> Error {
    read_last_error(sandbox).unwrap_or_else(|e| e)
}

fn read_last_error<S: Sandbox + ?Sized>(sandbox: &mut S) -> Result<Error> {
    let addr = sandbox.last_error()?;
    let mem = sandbox.memory();
    let kind = memory::read_string(mem, memory::read_u32(mem, addr)?)?;
    let message = memory::read_string(mem, memory::read_u32(mem, memory::offset(addr, 4)?)?)?;
    Ok(Error::from_foreign(kind, message))
}

pub(crate) fn check_status<S: Sandbox + ?Sized>(sandbox: &mut S, status: i32) -> Result<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(last_error(sandbox))
    }
}

/// Lay out `args` followed by one return slot; returns both offsets.
pub(crate) fn layout_call(buf: &mut ArenaBuffer, args: &[Value]) -> Result<(usize, usize)> {
    let args_offset = buf.alloc_records(args.len());
    let ret_offset = buf.alloc_records(1);
    for (i, arg) in args.iter().enumerate() {
        codec::encode(buf, args_offset + i * RECORD_BYTES, arg)?;
    }
    Ok((args_offset, ret_offset))
}

pub(crate) fn arg_count(args: &[Value]) -> Result<u32> {
    u32::try_from(args.len()).map_err(|_| Error::UnsupportedValueType("argument list".into()))
}

/// Look a global function up, taking a new untracked reference.
fn get_global<S: Sandbox + ?Sized>(sandbox: &mut S, name: &str) -> Result<Option<Handle>> {
    let addr = with_arena(sandbox, |sandbox, buf| {
        let name_offset = buf.alloc_len_prefixed(name.as_bytes());
        let out_offset = buf.alloc_raw(4, 4);
        buf.commit(sandbox)?;
        let status = sandbox.get_global_func(buf.addr(name_offset), buf.addr(out_offset))?;
        check_status(sandbox, status)?;
        memory::read_u32(sandbox.memory(), buf.addr(out_offset))
    })?;
    Ok((addr != 0).then(|| Handle::new(addr)))
}

/// Wrap a host function in a new, untracked foreign function handle.
fn create_host_func<S: Sandbox + ?Sized>(sandbox: &mut S, f: HostFunction) -> Result<Handle> {
    let resource = sandbox.state().callbacks.insert(f);
    let created = with_arena(sandbox, |sandbox, buf| {
        let out_offset = buf.alloc_raw(4, 4);
        buf.commit(sandbox)?;
        let status = sandbox.func_create_from_host(resource, buf.addr(out_offset))?;
        check_status(sandbox, status)?;
        memory::read_u32(sandbox.memory(), buf.addr(out_offset))
    });
    match created {
        Ok(addr) => {
            trace!(resource, handle = addr, "created host function");
            Ok(Handle::new(addr))
        }
        Err(e) => {
            sandbox.state().callbacks.release(resource);
            Err(e)
        }
    }
}

/// Attach a fresh handle to the current scope, releasing it if that fails.
fn attach_or_release<S: Sandbox + ?Sized>(sandbox: &mut S, handle: &Handle) -> Result<()> {
    if let Err(e) = sandbox.state().scopes.attach(handle) {
        scope::release(sandbox, handle)?;
        return Err(e);
    }
    Ok(())
}

/// Host-side operations of a bridge session.
///
/// Implemented for every [`Sandbox`], including `dyn Sandbox`, so host
/// callbacks can use the same API on the context they receive.
pub trait Bridge: Sandbox {
    /// Open a new scope frame.
    fn begin_scope(&mut self) {
        self.state().scopes.begin();
    }

    /// Close the top scope frame, releasing everything still attached.
    fn end_scope(&mut self) -> Result<()> {
        let handles = self.state().scopes.end()?;
        scope::release_all(self, handles)
    }

    fn scope_depth(&mut self) -> usize {
        self.state().scopes.depth()
    }

    /// Run `f` inside a new scope that is closed on success and failure.
    fn with_scope<R, F>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Self) -> Result<R>,
    {
        self.begin_scope();
        let result = f(self);
        let ended = self.end_scope();
        let value = result?;
        ended?;
        Ok(value)
    }

    fn attach<T: Tracked>(&mut self, obj: T) -> Result<T> {
        self.state().scopes.attach(obj.tracked_handle()?)?;
        Ok(obj)
    }

    fn detach<T: Tracked>(&mut self, obj: T) -> Result<T> {
        self.state().scopes.detach(obj.tracked_handle()?)?;
        Ok(obj)
    }

    fn move_to_parent<T: Tracked>(&mut self, obj: T) -> Result<T> {
        self.state().scopes.move_to_parent(obj.tracked_handle()?)?;
        Ok(obj)
    }

    /// Release a tracked object now instead of at the end of its scope.
    fn dispose<T: Tracked>(&mut self, obj: &T) -> Result<()> {
        let handle = obj.tracked_handle()?.clone();
        scope::release(self, &handle)
    }

    /// Look up a global function; the handle joins the current scope.
    fn lookup(&mut self, name: &str) -> Result<PackedFunc> {
        let handle = get_global(self, name)?.ok_or_else(|| Error::SymbolNotFound(name.into()))?;
        attach_or_release(self, &handle)?;
        Ok(PackedFunc::from_handle(handle))
    }

    /// Look up a global function through the session cache. Cached handles
    /// are owned by the session, never by a scope.
    fn cached_function(&mut self, name: &str) -> Result<PackedFunc> {
        if let Some(func) = self.state().functions.get(name) {
            return Ok(func.clone());
        }
        let handle = get_global(self, name)?.ok_or_else(|| Error::SymbolNotFound(name.into()))?;
        let func = PackedFunc::from_handle(handle);
        self.state().functions.insert(name.to_string(), func.clone());
        debug!(name, "cached foreign function");
        Ok(func)
    }

    /// Release every cached function handle.
    fn clear_function_cache(&mut self) -> Result<()> {
        let handles = self
            .state()
            .functions
            .drain()
            .map(|(_, f)| f.handle().clone())
            .collect();
        scope::release_all(self, handles)
    }

    /// Call a foreign function.
    fn invoke(&mut self, func: &PackedFunc, args: &[Value]) -> Result<Value> {
        let addr = func.handle().live_addr()?;
        let nargs = arg_count(args)?;
        with_arena(self, |sandbox, buf| {
            let (args_offset, ret_offset) = layout_call(buf, args)?;
            buf.commit(sandbox)?;
            trace!(func = addr, nargs, buffer = buf.id(), "calling foreign function");
            let status =
                sandbox.func_call(addr, buf.addr(args_offset), nargs, buf.addr(ret_offset))?;
            suspend::reject_suspension(sandbox)?;
            check_status(sandbox, status)?;
            codec::decode(sandbox, buf.addr(ret_offset), DecodeMode::Owned { track: true })
        })
    }

    /// Call a global function by name.
    fn call(&mut self, name: &str, args: &[Value]) -> Result<Value> {
        let func = self.cached_function(name)?;
        self.invoke(&func, args)
    }

    /// Wrap a host function as a foreign-callable function handle attached
    /// to the current scope.
    fn to_packed_func<F>(&mut self, f: F) -> Result<PackedFunc>
    where
        F: Fn(&mut dyn Sandbox, &[Value]) -> Result<Value> + 'static,
    {
        let handle = create_host_func(self, Rc::new(f))?;
        attach_or_release(self, &handle)?;
        Ok(PackedFunc::from_handle(handle))
    }

    /// Register a host function under a global name.
    ///
    /// Fails with `AlreadyRegistered` if the name exists and
    /// `override_existing` is false.
    fn register<F>(&mut self, name: &str, f: F, override_existing: bool) -> Result<()>
    where
        F: Fn(&mut dyn Sandbox, &[Value]) -> Result<Value> + 'static,
    {
        if !override_existing {
            if let Some(existing) = get_global(self, name)? {
                scope::release(self, &existing)?;
                return Err(Error::AlreadyRegistered(name.to_string()));
            }
        }

        let handle = create_host_func(self, Rc::new(f))?;
        let registered = with_arena(self, |sandbox, buf| {
            let name_offset = buf.alloc_len_prefixed(name.as_bytes());
            buf.commit(sandbox)?;
            let status = sandbox.register_global_func(
                buf.addr(name_offset),
                handle.addr(),
                override_existing,
            )?;
            check_status(sandbox, status)
        });
        // The registry holds its own reference from here on.
        let released = scope::release(self, &handle);
        registered?;
        released?;

        if let Some(stale) = self.state().functions.remove(name) {
            scope::release(self, stale.handle())?;
        }
        debug!(name, override_existing, "registered host function");
        Ok(())
    }

    /// Register an asynchronous host function; see [`suspend::wrap_async`].
    fn register_async<F, Fut>(&mut self, name: &str, f: F, override_existing: bool) -> Result<()>
    where
        F: Fn(Vec<Value>) -> Fut + 'static,
        Fut: std::future::Future<Output = Result<Value>> + 'static,
    {
        self.register(name, suspend::wrap_async(f), override_existing)
    }
}

impl<S: Sandbox + ?Sized> Bridge for S {}

/// Entry point for foreign calls into host function `resource`.
///
/// Returns the foreign status code: `0` on success, `-1` after writing a
/// `CallbackError` into the foreign error channel.
pub fn dispatch_callback(
    sandbox: &mut dyn Sandbox,
    resource: u32,
    args: u32,
    nargs: u32,
    ret: u32,
) -> i32 {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        run_callback(&mut *sandbox, resource, args, nargs, ret)
    }));
    let error = match outcome {
        Ok(Ok(())) => return 0,
        Ok(Err(e)) => e,
        Err(payload) => Error::CallbackError {
            message: panic_message(payload.as_ref()),
        },
    };
    warn!(resource, error = %error, "host callback failed");
    if let Err(e) = report_error(sandbox, &error) {
        warn!(resource, error = %e, "could not report callback failure");
    }
    -1
}

/// Forget host function `resource` once the foreign side released it.
pub fn release_callback(state: &mut BridgeState, resource: u32) {
    if state.callbacks.release(resource) {
        trace!(resource, "released host function");
    }
}

fn run_callback(
    sandbox: &mut dyn Sandbox,
    resource: u32,
    args: u32,
    nargs: u32,
    ret: u32,
) -> Result<()> {
    let f = sandbox
        .state()
        .callbacks
        .get(resource)
        .ok_or_else(|| Error::CallbackError {
            message: format!("host function {resource} has been released"),
        })?;
    let resuming = sandbox.suspend_state()? == SuspendState::Rewinding;

    sandbox.begin_scope();
    let result = invoke_host(sandbox, &f, args, nargs, ret, resuming);
    let ended = sandbox.end_scope();
    if resuming && result.is_err() {
        // The import never reached its resume point.
        if let Err(e) = suspend::reset(sandbox) {
            warn!(resource, error = %e, "could not abandon the rewind");
        }
    }
    result?;
    ended
}

fn invoke_host(
    sandbox: &mut dyn Sandbox,
    f: &HostFunction,
    args: u32,
    nargs: u32,
    ret: u32,
    resuming: bool,
) -> Result<()> {
    let mut values = Vec::new();
    for i in 0..nargs {
        let addr = codec::record_addr(args, i)?;
        values.push(codec::decode(
            sandbox,
            addr,
            DecodeMode::Borrowed { resuming },
        )?);
    }
    let value = f(&mut *sandbox, &values)?;
    with_arena(sandbox, |sandbox, buf| {
        let slot = buf.alloc_records(1);
        codec::encode(buf, slot, &value)?;
        buf.commit(sandbox)?;
        let status = sandbox.set_return(ret, buf.addr(slot))?;
        check_status(sandbox, status)
    })
}

fn report_error(sandbox: &mut dyn Sandbox, error: &Error) -> Result<()> {
    let (kind, message) = error.kind_and_message();
    with_arena(sandbox, |sandbox, buf| {
        let kind_offset = buf.alloc_len_prefixed(kind.as_bytes());
        let message_offset = buf.alloc_len_prefixed(message.as_bytes());
        buf.commit(sandbox)?;
        sandbox.set_last_error(buf.addr(kind_offset), buf.addr(message_offset))
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("host function panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("host function panicked: {s}")
    } else {
        "host function panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{RawValue, TypeTag};
    use crate::testing::{SimFault, SimSandbox};
    use crate::value::{DataType, Device};

    fn add1(_: &mut dyn Sandbox, args: &[Value]) -> Result<Value> {
        Ok(Value::Int(args[0].as_i64()? + 1))
    }

    #[test]
    fn registered_function_is_callable() {
        let mut sandbox = SimSandbox::new();
        sandbox.register("add1", add1, false).unwrap();

        sandbox.begin_scope();
        let func = sandbox.lookup("add1").unwrap();
        let result = sandbox.invoke(&func, &[Value::Int(41)]).unwrap();
        assert_eq!(result, Value::Int(42));
        sandbox.end_scope().unwrap();
        assert!(func.handle().is_disposed());
        assert_eq!(sandbox.state().arena().in_flight(), 0);
    }

    #[test]
    fn duplicate_registration_needs_override() {
        let mut sandbox = SimSandbox::new();
        sandbox.register("add1", add1, false).unwrap();
        let err = sandbox.register("add1", add1, false).unwrap_err();
        assert_eq!(err, Error::AlreadyRegistered("add1".into()));

        sandbox
            .register("add1", |_: &mut dyn Sandbox, _: &[Value]| Ok(Value::Int(0)), true)
            .unwrap();
        assert_eq!(sandbox.call("add1", &[Value::Int(1)]).unwrap(), Value::Int(0));
        // The overridden function's host slot is released with its handle.
        assert_eq!(sandbox.state().live_callbacks(), 1);
    }

    #[test]
    fn missing_symbol() {
        let mut sandbox = SimSandbox::new();
        sandbox.begin_scope();
        assert_eq!(
            sandbox.lookup("nope").unwrap_err(),
            Error::SymbolNotFound("nope".into())
        );
        assert_eq!(
            sandbox.call("nope", &[]).unwrap_err(),
            Error::SymbolNotFound("nope".into())
        );
    }

    #[test]
    fn foreign_errors_keep_kind_and_message() {
        let mut sandbox = SimSandbox::new();
        sandbox.sim_define("fails", |_, _| Err(SimFault::error("ValueError", "shape mismatch")));
        let err = sandbox.call("fails", &[]).unwrap_err();
        assert_eq!(
            err,
            Error::ForeignError {
                kind: "ValueError".into(),
                message: "shape mismatch".into()
            }
        );
        assert_eq!(sandbox.state().arena().in_flight(), 0);
    }

    #[test]
    fn corrupt_returned_descriptors_are_out_of_bounds() {
        let mut sandbox = SimSandbox::new();
        sandbox.sim_define("module.bad_view", |_, _| {
            Ok(RawValue::pointer(TypeTag::ArrayView, 0xFFFF_FFF8))
        });
        sandbox.begin_scope();
        let err = sandbox.call("module.bad_view", &[]).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { addr: 0xFFFF_FFF8, .. }), "{err}");
        sandbox.end_scope().unwrap();
        assert_eq!(sandbox.state().arena().in_flight(), 0);
    }

    #[test]
    fn callback_errors_cross_back_as_callback_errors() {
        let mut sandbox = SimSandbox::new();
        sandbox
            .register(
                "explode",
                |_: &mut dyn Sandbox, _: &[Value]| -> Result<Value> {
                    Err(Error::CallbackError {
                        message: "no luck".into(),
                    })
                },
                false,
            )
            .unwrap();
        let err = sandbox.call("explode", &[]).unwrap_err();
        assert_eq!(
            err,
            Error::CallbackError {
                message: "no luck".into()
            }
        );
        assert_eq!(sandbox.scope_depth(), 0);
    }

    #[test]
    fn callback_panics_are_contained() {
        let mut sandbox = SimSandbox::new();
        sandbox
            .register(
                "panics",
                |_: &mut dyn Sandbox, _: &[Value]| -> Result<Value> { panic!("kaboom") },
                false,
            )
            .unwrap();
        let err = sandbox.call("panics", &[]).unwrap_err();
        assert!(matches!(err, Error::CallbackError { ref message } if message.contains("kaboom")));
        assert_eq!(sandbox.scope_depth(), 0);
    }

    #[test]
    fn callback_intermediates_are_released() {
        let mut sandbox = SimSandbox::new();
        sandbox
            .register(
                "make_and_drop",
                |ctx: &mut dyn Sandbox, _: &[Value]| -> Result<Value> {
                    let _scratch = ctx.call(
                        "runtime.array.empty",
                        &["float32".into(), Device::cpu().into(), 4_i64.into()],
                    )?;
                    Ok(Value::Int(1))
                },
                false,
            )
            .unwrap();
        let before = sandbox.sim_live_objects();
        assert_eq!(sandbox.call("make_and_drop", &[]).unwrap(), Value::Int(1));
        assert_eq!(sandbox.sim_live_objects(), before);
    }

    #[test]
    fn callback_can_return_objects_it_created() {
        let mut sandbox = SimSandbox::new();
        sandbox
            .register(
                "make",
                |ctx: &mut dyn Sandbox, _: &[Value]| -> Result<Value> {
                    ctx.call(
                        "runtime.array.empty",
                        &["float32".into(), Device::cpu().into(), 2_i64.into(), 2_i64.into()],
                    )
                },
                false,
            )
            .unwrap();
        sandbox.begin_scope();
        let array = sandbox.call("make", &[]).unwrap().into_array().unwrap();
        assert_eq!(array.shape(), &[2, 2]);
        assert_eq!(array.dtype(), DataType::float32());
        let addr = array.handle().unwrap().addr();
        assert_eq!(sandbox.sim_refcount(addr), Some(1));
        sandbox.end_scope().unwrap();
        assert_eq!(sandbox.sim_refcount(addr), None);
    }

    #[test]
    fn callback_arguments_are_borrowed_or_converted() {
        let mut sandbox = SimSandbox::new();
        sandbox
            .register(
                "inspect",
                |_: &mut dyn Sandbox, args: &[Value]| -> Result<Value> {
                    let s = args[0].as_str()?.to_string();
                    let view = args[1].clone().into_array()?;
                    assert!(view.is_view());
                    Ok(Value::Str(format!("{s}:{}", view.numel())))
                },
                false,
            )
            .unwrap();
        let array = sandbox.sim_empty_array(&[3, 2], DataType::float32(), Device::cpu());
        let result = sandbox
            .sim_call_with_view("inspect", "shape", &array)
            .unwrap();
        assert_eq!(result, Value::Str("shape:6".into()));
    }

    #[test]
    fn host_functions_are_released_with_their_handle() {
        let mut sandbox = SimSandbox::new();
        sandbox.begin_scope();
        let func = sandbox.to_packed_func(add1).unwrap();
        assert_eq!(sandbox.state().live_callbacks(), 1);
        assert_eq!(sandbox.invoke(&func, &[Value::Int(1)]).unwrap(), Value::Int(2));
        sandbox.end_scope().unwrap();
        assert_eq!(sandbox.state().live_callbacks(), 0);
        assert_eq!(
            sandbox.invoke(&func, &[]).unwrap_err(),
            Error::DisposedHandle(func.handle().addr())
        );
    }

    #[test]
    fn with_scope_ends_scope_on_error() {
        let mut sandbox = SimSandbox::new();
        let result: Result<()> = sandbox.with_scope(|s| {
            s.call(
                "runtime.array.empty",
                &["float32".into(), Device::cpu().into(), 8_i64.into()],
            )?;
            Err(Error::NotFound)
        });
        assert_eq!(result.unwrap_err(), Error::NotFound);
        assert_eq!(sandbox.scope_depth(), 0);
        assert_eq!(sandbox.sim_live_arrays(), 0);
    }

    #[test]
    fn detached_results_survive_their_scope() {
        let mut sandbox = SimSandbox::new();
        let array = sandbox
            .with_scope(|s| {
                let value = s.call(
                    "runtime.array.empty",
                    &["float32".into(), Device::cpu().into(), 8_i64.into()],
                )?;
                s.detach(value.into_array()?)
            })
            .unwrap();
        assert!(!array.handle().unwrap().is_disposed());
        assert_eq!(sandbox.sim_live_arrays(), 1);
        sandbox.dispose(&array).unwrap();
        assert_eq!(sandbox.sim_live_arrays(), 0);
    }

    #[test]
    fn function_cache_is_released_on_clear() {
        let mut sandbox = SimSandbox::new();
        sandbox.register("add1", add1, false).unwrap();
        let first = sandbox.cached_function("add1").unwrap();
        let second = sandbox.cached_function("add1").unwrap();
        assert!(first.handle().same(second.handle()));
        sandbox.clear_function_cache().unwrap();
        assert!(first.handle().is_disposed());
    }
}
