//! A simulated foreign module for tests.
//!
//! [`SimSandbox`] implements the whole foreign ABI in Rust: a flat linear
//! memory with a bump allocator, reference-counted objects, a global
//! function registry, the error channel and an emulation of the
//! unwind/rewind protocol. "Foreign" functions are Rust closures over raw
//! records ([`NativeFn`]); a rewound call simply runs its closure again, so
//! natives used with suspension must not have side effects before their
//! suspend point.
//!
//! The runtime functions the shard loader relies on (`runtime.array.*`,
//! `runtime.device.sync`, `runtime.shard_cache.*`) are built in.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::calling;
use crate::codec::{self, descriptor, DecodeMode, RawValue, TypeTag, RECORD_BYTES};
use crate::error::{Error, Result};
use crate::memory;
use crate::sandbox::{BridgeConfig, BridgeState, Sandbox, SuspendState};
use crate::value::{DataType, Device, Handle, Tensor, Value};

/// How a simulated foreign function stops early.
#[derive(Debug, Clone, PartialEq)]
pub enum SimFault {
    /// Fail with a `{kind, message}` pair.
    Error { kind: String, message: String },
    /// A nested call started unwinding; return without a result.
    Unwind,
}

impl SimFault {
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        SimFault::Error {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<Error> for SimFault {
    fn from(e: Error) -> Self {
        SimFault::error("RuntimeError", e.to_string())
    }
}

pub type SimResult<T> = std::result::Result<T, SimFault>;

/// A foreign function implemented in Rust.
pub type NativeFn = Rc<dyn Fn(&mut SimSandbox, &[RawValue]) -> SimResult<RawValue>>;

#[derive(Clone)]
enum SimKind {
    Native { name: String, f: NativeFn },
    Host(u32),
    Array { shape: u32, data: u32 },
}

struct SimObject {
    refcount: u32,
    kind: SimKind,
}

/// An in-process foreign module.
pub struct SimSandbox {
    state: BridgeState,
    memory: Vec<u8>,
    top: u32,
    allocations: HashMap<u32, u32>,
    freed: HashSet<u32>,
    objects: HashMap<u32, SimObject>,
    globals: HashMap<String, u32>,
    cache: HashMap<String, u32>,
    calls: HashMap<String, usize>,
    error_record: u32,
    suspend: SuspendState,
    asyncify: bool,
    device_syncs: usize,
}

impl Default for SimSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl SimSandbox {
    pub fn new() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        let mut sim = Self {
            state: BridgeState::new(config),
            memory: vec![0; 64 * 1024],
            // Keep address zero and its neighbourhood unmapped.
            top: 64,
            allocations: HashMap::new(),
            freed: HashSet::new(),
            objects: HashMap::new(),
            globals: HashMap::new(),
            cache: HashMap::new(),
            calls: HashMap::new(),
            error_record: 0,
            suspend: SuspendState::Normal,
            asyncify: true,
            device_syncs: 0,
        };
        sim.error_record = sim.bump(8);
        sim.install_runtime();
        sim
    }

    fn bump(&mut self, nbytes: u32) -> u32 {
        let size = nbytes.max(1).next_multiple_of(16);
        let addr = self.top;
        self.top += size;
        let needed = self.top as usize;
        if needed > self.memory.len() {
            let grown = needed.max(self.memory.len() * 2);
            self.memory.resize(grown, 0);
        }
        self.allocations.insert(addr, size);
        addr
    }

    fn alloc_len_prefixed(&mut self, bytes: &[u8]) -> Result<u32> {
        let len = u32::try_from(bytes.len()).map_err(|_| Error::OutOfBounds {
            addr: 0,
            len: bytes.len(),
        })?;
        let addr = self.bump(4 + len);
        memory::write_u32(&mut self.memory, addr, len)?;
        memory::write_bytes(&mut self.memory, addr + 4, bytes)?;
        Ok(addr)
    }

    fn write_error(&mut self, kind: &str, message: &str) -> Result<i32> {
        let kind = self.alloc_len_prefixed(kind.as_bytes())?;
        let message = self.alloc_len_prefixed(message.as_bytes())?;
        memory::write_u32(&mut self.memory, self.error_record, kind)?;
        memory::write_u32(&mut self.memory, self.error_record + 4, message)?;
        Ok(-1)
    }

    fn read_error(&self) -> Result<(String, String)> {
        let kind = memory::read_u32(&self.memory, self.error_record)?;
        let message = memory::read_u32(&self.memory, self.error_record + 4)?;
        Ok((
            memory::read_string(&self.memory, kind)?,
            memory::read_string(&self.memory, message)?,
        ))
    }

    fn new_object(&mut self, nbytes: u32, kind: SimKind) -> u32 {
        let addr = self.bump(nbytes);
        self.objects.insert(addr, SimObject { refcount: 1, kind });
        addr
    }

    fn retain(&mut self, handle: u32) -> Result<()> {
        let object = self
            .objects
            .get_mut(&handle)
            .ok_or_else(|| Error::Sandbox(format!("object {handle:#x} is not live")))?;
        object.refcount += 1;
        Ok(())
    }

    fn release(&mut self, handle: u32) -> Result<()> {
        let object = self
            .objects
            .get_mut(&handle)
            .ok_or_else(|| Error::Sandbox(format!("object {handle:#x} is not live")))?;
        object.refcount -= 1;
        if object.refcount > 0 {
            return Ok(());
        }
        let Some(object) = self.objects.remove(&handle) else {
            return Ok(());
        };
        match object.kind {
            SimKind::Host(resource) => calling::release_callback(&mut self.state, resource),
            SimKind::Array { shape, data } => {
                self.free(shape)?;
                self.free(data)?;
            }
            SimKind::Native { .. } => {}
        }
        self.free(handle)
    }

    fn transition(&mut self, op: &str, from: SuspendState, to: SuspendState) -> Result<()> {
        if !self.asyncify {
            return Err(Error::SuspensionUnsupported(op.to_string()));
        }
        if self.suspend != from {
            return Err(Error::Suspension(format!("{op} while {:?}", self.suspend)));
        }
        self.suspend = to;
        Ok(())
    }

    /// Register a native function under a global name, replacing any
    /// previous one.
    pub fn sim_define<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&mut SimSandbox, &[RawValue]) -> SimResult<RawValue> + 'static,
    {
        let kind = SimKind::Native {
            name: name.to_string(),
            f: Rc::new(f),
        };
        let handle = self.new_object(16, kind);
        if let Some(old) = self.globals.insert(name.to_string(), handle) {
            let _ = self.release(old);
        }
    }

    /// Call a function handle the way foreign code would.
    pub fn sim_invoke(&mut self, func: u32, args: &[RawValue]) -> SimResult<RawValue> {
        let nargs = u32::try_from(args.len()).map_err(|_| SimFault::error("ValueError", "too many arguments"))?;
        let frame = self.bump((nargs + 1) * RECORD_BYTES as u32);
        for (i, arg) in (0_u32..).zip(args) {
            arg.write(&mut self.memory, frame + i * RECORD_BYTES as u32)?;
        }
        let ret = frame + nargs * RECORD_BYTES as u32;
        let status = self.func_call(func, frame, nargs, ret)?;
        let result = if self.suspend == SuspendState::Unwinding {
            Err(SimFault::Unwind)
        } else if status != 0 {
            let (kind, message) = self.read_error()?;
            Err(SimFault::Error { kind, message })
        } else {
            Ok(RawValue::read(&self.memory, ret)?)
        };
        self.free(frame)?;
        result
    }

    /// Call a global function by name the way foreign code would.
    pub fn sim_invoke_global(&mut self, name: &str, args: &[RawValue]) -> SimResult<RawValue> {
        let func = self
            .globals
            .get(name)
            .copied()
            .ok_or_else(|| SimFault::error("NameError", format!("no global function {name}")))?;
        self.sim_invoke(func, args)
    }

    /// Call a global function with a string and an array view argument,
    /// decoding the result on the host side.
    pub fn sim_call_with_view(&mut self, name: &str, text: &str, view: &Tensor) -> Result<Value> {
        let text = self.alloc_len_prefixed(text.as_bytes())?;
        let args = [
            RawValue::pointer(TypeTag::RawStr, text),
            RawValue::pointer(TypeTag::ArrayView, view.descriptor()),
        ];
        match self.sim_invoke_global(name, &args) {
            Ok(raw) => codec::decode_raw(self, raw, DecodeMode::Owned { track: false }),
            Err(SimFault::Error { kind, message }) => Err(Error::from_foreign(kind, message)),
            Err(SimFault::Unwind) => Err(Error::SuspendedOutsideAsync),
        }
    }

    /// Read a string argument.
    pub fn sim_read_str(&self, raw: &RawValue) -> SimResult<String> {
        if raw.tag != TypeTag::RawStr.code() {
            return Err(SimFault::error("TypeError", "expected a string"));
        }
        Ok(memory::read_string(&self.memory, raw.as_ptr())?)
    }

    /// Create an array object with one reference, returning its descriptor.
    pub fn sim_new_array(&mut self, shape: &[i64], dtype: DataType, device: Device) -> Result<u32> {
        let ndim = u32::try_from(shape.len()).map_err(|_| Error::UnsupportedValueType("rank".into()))?;
        let numel: usize = shape.iter().map(|d| usize::try_from(*d).unwrap_or(0)).product();
        let nbytes = u32::try_from(numel * dtype.element_bytes()).map_err(|_| Error::OutOfBounds {
            addr: 0,
            len: numel,
        })?;
        let shape_ptr = self.bump(ndim * 8);
        let data = self.bump(nbytes);
        let addr = self.new_object(descriptor::SIZE, SimKind::Array { shape: shape_ptr, data });

        let mem = &mut self.memory;
        memory::write_u32(mem, addr + descriptor::DATA, data)?;
        memory::write_bytes(mem, addr + descriptor::DEVICE_TYPE, &device.device_type.code().to_le_bytes())?;
        memory::write_bytes(mem, addr + descriptor::DEVICE_ID, &device.device_id.to_le_bytes())?;
        memory::write_u32(mem, addr + descriptor::NDIM, ndim)?;
        memory::write_bytes(mem, addr + descriptor::DTYPE_CODE, &[dtype.code, dtype.bits])?;
        memory::write_bytes(mem, addr + descriptor::DTYPE_LANES, &dtype.lanes.to_le_bytes())?;
        memory::write_u32(mem, addr + descriptor::SHAPE, shape_ptr)?;
        for (i, dim) in (0_u32..).zip(shape) {
            memory::write_i64(mem, shape_ptr + i * 8, *dim)?;
        }
        Ok(addr)
    }

    /// An owned array whose only reference belongs to the returned value.
    ///
    /// Panics if the array cannot be laid out.
    pub fn sim_empty_array(&mut self, shape: &[i64], dtype: DataType, device: Device) -> Tensor {
        let addr = self
            .sim_new_array(shape, dtype, device)
            .expect("simulated array allocation");
        codec::read_tensor(&self.memory, addr, Some(Handle::new(addr))).expect("fresh descriptor")
    }

    /// Contents of an array object.
    pub fn sim_array_bytes(&self, addr: u32) -> Result<Vec<u8>> {
        let tensor = codec::read_tensor(&self.memory, addr, None)?;
        let start = tensor.data() + u32::try_from(tensor.byte_offset()).unwrap_or(0);
        Ok(memory::read_bytes(&self.memory, start, tensor.nbytes())?.to_vec())
    }

    /// Take one more reference. Panics on a dead object.
    pub fn sim_retain(&mut self, addr: u32) {
        self.retain(addr).expect("retain of a live object");
    }

    /// Reference count of a live object.
    pub fn sim_refcount(&self, addr: u32) -> Option<u32> {
        self.objects.get(&addr).map(|o| o.refcount)
    }

    pub fn sim_live_objects(&self) -> usize {
        self.objects.len()
    }

    pub fn sim_live_arrays(&self) -> usize {
        self.objects
            .values()
            .filter(|o| matches!(o.kind, SimKind::Array { .. }))
            .count()
    }

    /// How often the native function `name` has run.
    pub fn sim_call_count(&self, name: &str) -> usize {
        self.calls.get(name).copied().unwrap_or(0)
    }

    pub fn sim_device_syncs(&self) -> usize {
        self.device_syncs
    }

    /// Names in the module's shard cache, sorted.
    pub fn sim_cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cache.keys().cloned().collect();
        names.sort();
        names
    }

    /// Contents of the cached array `name`.
    pub fn sim_cache_bytes(&self, name: &str) -> Option<Vec<u8>> {
        let addr = *self.cache.get(name)?;
        self.sim_array_bytes(addr).ok()
    }

    /// Enable or disable the unwind/rewind exports.
    pub fn sim_set_asyncify(&mut self, enabled: bool) {
        self.asyncify = enabled;
    }

    /// Whether `addr` was handed back to the allocator.
    pub fn is_freed(&self, addr: u32) -> bool {
        self.freed.contains(&addr)
    }

    fn install_runtime(&mut self) {
        self.sim_define("runtime.array.empty", |sim, args| {
            if args.len() < 2 {
                return Err(SimFault::error("ValueError", "expected dtype and device"));
            }
            let dtype: DataType = sim.sim_read_str(&args[0])?.parse()?;
            let device = args[1].as_device();
            let shape: Vec<i64> = args[2..].iter().map(RawValue::as_i64).collect();
            let addr = sim.sim_new_array(&shape, dtype, device)?;
            Ok(RawValue::pointer(TypeTag::Array, addr))
        });

        self.sim_define("runtime.array.decode_storage", |sim, args| {
            let [target, source, format, dtype] = args else {
                return Err(SimFault::error("ValueError", "expected 4 arguments"));
            };
            let target = codec::read_tensor(&sim.memory, target.as_ptr(), None)?;
            let source = memory::read_len_prefixed(&sim.memory, source.as_ptr())?.to_vec();
            let dtype: DataType = sim.sim_read_str(dtype)?.parse()?;
            if dtype != target.dtype() {
                return Err(SimFault::error(
                    "ValueError",
                    format!("target is {}, record is {dtype}", target.dtype()),
                ));
            }
            let decoded: Vec<u8> = match sim.sim_read_str(format)?.as_str() {
                "raw" => source,
                "f32-to-bf16" => source
                    .chunks_exact(2)
                    .flat_map(|c| (u32::from(u16::from_le_bytes([c[0], c[1]])) << 16).to_le_bytes())
                    .collect(),
                other => {
                    return Err(SimFault::error("ValueError", format!("unknown format {other}")));
                }
            };
            if decoded.len() != target.nbytes() {
                return Err(SimFault::error(
                    "ValueError",
                    format!("expected {} bytes, got {}", target.nbytes(), decoded.len()),
                ));
            }
            memory::write_bytes(&mut sim.memory, target.data(), &decoded)?;
            Ok(RawValue::NONE)
        });

        self.sim_define("runtime.array.copy_from", |sim, args| {
            let [dst, src] = args else {
                return Err(SimFault::error("ValueError", "expected 2 arguments"));
            };
            let dst = codec::read_tensor(&sim.memory, dst.as_ptr(), None)?;
            let src = codec::read_tensor(&sim.memory, src.as_ptr(), None)?;
            if dst.nbytes() != src.nbytes() {
                return Err(SimFault::error("ValueError", "copy between arrays of different size"));
            }
            let from = src.data() as usize;
            sim.memory
                .copy_within(from..from + src.nbytes(), dst.data() as usize);
            Ok(RawValue::NONE)
        });

        self.sim_define("runtime.device.sync", |sim, _| {
            sim.device_syncs += 1;
            Ok(RawValue::NONE)
        });

        self.sim_define("runtime.shard_cache.update", |sim, args| {
            let [name, array, override_existing] = args else {
                return Err(SimFault::error("ValueError", "expected 3 arguments"));
            };
            let name = sim.sim_read_str(name)?;
            if sim.cache.contains_key(&name) && override_existing.as_i64() == 0 {
                return Err(SimFault::error("ValueError", format!("{name} is already cached")));
            }
            sim.retain(array.as_ptr())?;
            if let Some(old) = sim.cache.insert(name, array.as_ptr()) {
                sim.release(old)?;
            }
            Ok(RawValue::NONE)
        });

        self.sim_define("runtime.shard_cache.get", |sim, args| {
            let name = sim.sim_read_str(args.first().unwrap_or(&RawValue::NONE))?;
            match sim.cache.get(&name).copied() {
                Some(addr) => {
                    sim.retain(addr)?;
                    Ok(RawValue::pointer(TypeTag::Array, addr))
                }
                None => Ok(RawValue::NONE),
            }
        });

        self.sim_define("runtime.shard_cache.remove", |sim, args| {
            let name = sim.sim_read_str(args.first().unwrap_or(&RawValue::NONE))?;
            if let Some(addr) = sim.cache.remove(&name) {
                sim.release(addr)?;
            }
            Ok(RawValue::NONE)
        });

        self.sim_define("runtime.shard_cache.clear", |sim, _| {
            let cached: Vec<u32> = sim.cache.drain().map(|(_, addr)| addr).collect();
            for addr in cached {
                sim.release(addr)?;
            }
            Ok(RawValue::NONE)
        });
    }
}

impl Sandbox for SimSandbox {
    fn state(&mut self) -> &mut BridgeState {
        &mut self.state
    }

    fn memory(&self) -> &[u8] {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    fn alloc(&mut self, nbytes: u32) -> Result<u32> {
        Ok(self.bump(nbytes))
    }

    fn free(&mut self, ptr: u32) -> Result<()> {
        if self.allocations.remove(&ptr).is_none() {
            return Err(Error::Sandbox(format!("free of unknown pointer {ptr:#x}")));
        }
        self.freed.insert(ptr);
        Ok(())
    }

    fn func_call(&mut self, func: u32, args: u32, nargs: u32, ret: u32) -> Result<i32> {
        let Some(kind) = self.objects.get(&func).map(|o| o.kind.clone()) else {
            return self.write_error("RuntimeError", &format!("{func:#x} is not a live object"));
        };
        match kind {
            SimKind::Host(resource) => Ok(calling::dispatch_callback(self, resource, args, nargs, ret)),
            SimKind::Native { name, f } => {
                *self.calls.entry(name).or_default() += 1;
                let raw_args = (0..nargs)
                    .map(|i| RawValue::read(&self.memory, codec::record_addr(args, i)?))
                    .collect::<Result<Vec<_>>>()?;
                match f(self, &raw_args) {
                    Ok(value) => {
                        value.write(&mut self.memory, ret)?;
                        Ok(0)
                    }
                    Err(SimFault::Unwind) => Ok(0),
                    Err(SimFault::Error { kind, message }) => self.write_error(&kind, &message),
                }
            }
            SimKind::Array { .. } => self.write_error("TypeError", "arrays are not callable"),
        }
    }

    fn get_global_func(&mut self, name: u32, out: u32) -> Result<i32> {
        let name = memory::read_string(&self.memory, name)?;
        let handle = self.globals.get(&name).copied().unwrap_or(0);
        if handle != 0 {
            self.retain(handle)?;
        }
        memory::write_u32(&mut self.memory, out, handle)?;
        Ok(0)
    }

    fn register_global_func(&mut self, name: u32, func: u32, override_existing: bool) -> Result<i32> {
        let name = memory::read_string(&self.memory, name)?;
        if self.globals.contains_key(&name) && !override_existing {
            return self.write_error("ValueError", &format!("{name} is already registered"));
        }
        if self.retain(func).is_err() {
            return self.write_error("RuntimeError", &format!("{func:#x} is not a live object"));
        }
        if let Some(old) = self.globals.insert(name, func) {
            self.release(old)?;
        }
        Ok(0)
    }

    fn func_create_from_host(&mut self, resource: u32, out: u32) -> Result<i32> {
        let handle = self.new_object(16, SimKind::Host(resource));
        memory::write_u32(&mut self.memory, out, handle)?;
        Ok(0)
    }

    fn set_return(&mut self, ret: u32, value: u32) -> Result<i32> {
        let raw = RawValue::read(&self.memory, value)?;
        let tag = TypeTag::from_code(raw.tag)?;
        let raw = match tag {
            TypeTag::RawStr | TypeTag::Bytes => {
                let bytes = memory::read_len_prefixed(&self.memory, raw.as_ptr())?.to_vec();
                RawValue::pointer(tag, self.alloc_len_prefixed(&bytes)?)
            }
            tag if tag.is_object() && raw.as_ptr() != 0 => {
                self.retain(raw.as_ptr())?;
                raw
            }
            _ => raw,
        };
        raw.write(&mut self.memory, ret)?;
        Ok(0)
    }

    fn set_last_error(&mut self, kind: u32, message: u32) -> Result<()> {
        let kind = memory::read_string(&self.memory, kind)?;
        let message = memory::read_string(&self.memory, message)?;
        self.write_error(&kind, &message)?;
        Ok(())
    }

    fn last_error(&mut self) -> Result<u32> {
        Ok(self.error_record)
    }

    fn object_retain(&mut self, handle: u32) -> Result<()> {
        self.retain(handle)
    }

    fn object_free(&mut self, handle: u32) -> Result<i32> {
        match self.release(handle) {
            Ok(()) => Ok(0),
            Err(e) => self.write_error("RuntimeError", &e.to_string()),
        }
    }

    fn suspend_state(&mut self) -> Result<SuspendState> {
        Ok(if self.asyncify {
            self.suspend
        } else {
            SuspendState::Normal
        })
    }

    fn start_unwind(&mut self) -> Result<()> {
        self.transition("start_unwind", SuspendState::Normal, SuspendState::Unwinding)
    }

    fn stop_unwind(&mut self) -> Result<()> {
        self.transition("stop_unwind", SuspendState::Unwinding, SuspendState::Normal)
    }

    fn start_rewind(&mut self) -> Result<()> {
        self.transition("start_rewind", SuspendState::Normal, SuspendState::Rewinding)
    }

    fn stop_rewind(&mut self) -> Result<()> {
        self.transition("stop_rewind", SuspendState::Rewinding, SuspendState::Normal)
    }
}
