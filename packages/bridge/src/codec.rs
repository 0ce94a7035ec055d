//! Tagged-value wire format.
//!
//! Every value crossing the boundary is a 16-byte record:
//!
//! ```text
//! 0        4          8                 16
//! +--------+----------+-----------------+
//! |  tag   | reserved |     payload     |
//! +--------+----------+-----------------+
//! ```
//!
//! The tag alone decides how the payload is read. Strings and byte buffers
//! are out of band: the payload points at a `u32`-length-prefixed copy.
//! Object handles are plain addresses; tags from [`OBJECT_BEGIN`] upward are
//! object type indices.

use crate::arena::ArenaBuffer;
use crate::error::{Error, Result};
use crate::memory;
use crate::sandbox::Sandbox;
use crate::scope;
use crate::value::{
    DataType, Device, DeviceType, Handle, Module, Object, PackedFunc, Tensor, Value,
};

/// Size of one tagged-value record.
pub const RECORD_BYTES: usize = 16;

/// Address of record `index` in an array of records starting at `base`.
pub fn record_addr(base: u32, index: u32) -> Result<u32> {
    let delta = index
        .checked_mul(RECORD_BYTES as u32)
        .ok_or(Error::OutOfBounds {
            addr: base,
            len: RECORD_BYTES,
        })?;
    memory::offset(base, delta)
}

/// First tag that denotes an object type index.
pub const OBJECT_BEGIN: u32 = 64;

/// Offsets inside a tensor descriptor (wasm32 layout).
pub mod descriptor {
    pub const DATA: u32 = 0;
    pub const DEVICE_TYPE: u32 = 4;
    pub const DEVICE_ID: u32 = 8;
    pub const NDIM: u32 = 12;
    pub const DTYPE_CODE: u32 = 16;
    pub const DTYPE_BITS: u32 = 17;
    pub const DTYPE_LANES: u32 = 18;
    pub const SHAPE: u32 = 20;
    pub const STRIDES: u32 = 24;
    pub const BYTE_OFFSET: u32 = 32;
    pub const SIZE: u32 = 40;
}

/// The discriminant of a tagged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    None,
    Int,
    Bool,
    Float,
    OpaquePtr,
    Device,
    RawStr,
    Bytes,
    ArrayView,
    Function,
    Array,
    Module,
    Object(u32),
}

impl TypeTag {
    pub fn code(self) -> u32 {
        match self {
            TypeTag::None => 0,
            TypeTag::Int => 1,
            TypeTag::Bool => 2,
            TypeTag::Float => 3,
            TypeTag::OpaquePtr => 4,
            TypeTag::Device => 5,
            TypeTag::RawStr => 6,
            TypeTag::Bytes => 7,
            TypeTag::ArrayView => 8,
            TypeTag::Function => 68,
            TypeTag::Array => 70,
            TypeTag::Module => 73,
            TypeTag::Object(index) => index,
        }
    }

    pub fn from_code(code: u32) -> Result<Self> {
        Ok(match code {
            0 => TypeTag::None,
            1 => TypeTag::Int,
            2 => TypeTag::Bool,
            3 => TypeTag::Float,
            4 => TypeTag::OpaquePtr,
            5 => TypeTag::Device,
            6 => TypeTag::RawStr,
            7 => TypeTag::Bytes,
            8 => TypeTag::ArrayView,
            68 => TypeTag::Function,
            70 => TypeTag::Array,
            73 => TypeTag::Module,
            index if index >= OBJECT_BEGIN => TypeTag::Object(index),
            unknown => return Err(Error::UnknownTag(unknown)),
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            TypeTag::None => "none",
            TypeTag::Int => "int",
            TypeTag::Bool => "bool",
            TypeTag::Float => "float",
            TypeTag::OpaquePtr => "pointer",
            TypeTag::Device => "device",
            TypeTag::RawStr => "string",
            TypeTag::Bytes => "bytes",
            TypeTag::ArrayView => "array view",
            TypeTag::Function => "function",
            TypeTag::Array => "array",
            TypeTag::Module => "module",
            TypeTag::Object(_) => "object",
        }
    }

    /// Whether a callback argument of this type must be copied or retained
    /// before the host can own it.
    pub fn needs_conversion(self) -> bool {
        matches!(
            self,
            TypeTag::RawStr
                | TypeTag::Bytes
                | TypeTag::Function
                | TypeTag::Array
                | TypeTag::Module
                | TypeTag::Object(_)
        )
    }

    pub fn is_object(self) -> bool {
        self.code() >= OBJECT_BEGIN
    }
}

/// One record exactly as it sits in sandbox memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawValue {
    pub tag: u32,
    pub payload: [u8; 8],
}

impl RawValue {
    pub const NONE: RawValue = RawValue {
        tag: 0,
        payload: [0; 8],
    };

    pub fn int(v: i64) -> Self {
        Self {
            tag: TypeTag::Int.code(),
            payload: v.to_le_bytes(),
        }
    }

    pub fn float(v: f64) -> Self {
        Self {
            tag: TypeTag::Float.code(),
            payload: v.to_le_bytes(),
        }
    }

    pub fn bool(v: bool) -> Self {
        Self {
            tag: TypeTag::Bool.code(),
            payload: i64::from(v).to_le_bytes(),
        }
    }

    /// A record whose payload is a sandbox address.
    pub fn pointer(tag: TypeTag, addr: u32) -> Self {
        Self {
            tag: tag.code(),
            payload: u64::from(addr).to_le_bytes(),
        }
    }

    pub fn device(device: Device) -> Self {
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&device.device_type.code().to_le_bytes());
        payload[4..].copy_from_slice(&device.device_id.to_le_bytes());
        Self {
            tag: TypeTag::Device.code(),
            payload,
        }
    }

    pub fn as_i64(&self) -> i64 {
        i64::from_le_bytes(self.payload)
    }

    pub fn as_f64(&self) -> f64 {
        f64::from_le_bytes(self.payload)
    }

    pub fn as_ptr(&self) -> u32 {
        u32::from_le_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ])
    }

    pub fn as_device(&self) -> Device {
        let code = i32::from_le_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]);
        let id = i32::from_le_bytes([
            self.payload[4],
            self.payload[5],
            self.payload[6],
            self.payload[7],
        ]);
        Device::new(DeviceType::from_code(code), id)
    }

    pub fn to_bytes(&self) -> [u8; RECORD_BYTES] {
        let mut out = [0u8; RECORD_BYTES];
        out[..4].copy_from_slice(&self.tag.to_le_bytes());
        out[8..].copy_from_slice(&self.payload);
        out
    }

    pub fn read(mem: &[u8], addr: u32) -> Result<Self> {
        let bytes = memory::read_bytes(mem, addr, RECORD_BYTES)?;
        let mut payload = [0u8; 8];
        payload.copy_from_slice(&bytes[8..]);
        Ok(Self {
            tag: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            payload,
        })
    }

    pub fn write(&self, mem: &mut [u8], addr: u32) -> Result<()> {
        memory::write_bytes(mem, addr, &self.to_bytes())
    }
}

/// How decoded handles are owned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    /// A return slot: the bridge already holds a reference to any object.
    /// With `track`, new handles join the current scope.
    Owned { track: bool },
    /// A callback argument: the foreign caller keeps its references. Views
    /// are read in place; everything else is converted to an owned copy,
    /// which is illegal while the module is `resuming`.
    Borrowed { resuming: bool },
}

/// Write `value` into the record at `slot` of `buf`.
pub fn encode(buf: &mut ArenaBuffer, slot: usize, value: &Value) -> Result<()> {
    let raw = match value {
        Value::None => RawValue::NONE,
        Value::Bool(v) => RawValue::bool(*v),
        Value::Int(v) => RawValue::int(*v),
        Value::Float(v) => RawValue::float(*v),
        Value::OpaquePtr(addr) => RawValue::pointer(TypeTag::OpaquePtr, *addr),
        Value::Device(device) => RawValue::device(*device),
        Value::Str(s) => {
            let target = buf.alloc_len_prefixed(s.as_bytes());
            buf.set_ptr_from_offset(slot + 8, target);
            RawValue::pointer(TypeTag::RawStr, 0)
        }
        Value::Bytes(bytes) => {
            let target = buf.alloc_len_prefixed(bytes);
            buf.set_ptr_from_offset(slot + 8, target);
            RawValue::pointer(TypeTag::Bytes, 0)
        }
        Value::Function(f) => RawValue::pointer(TypeTag::Function, f.handle().live_addr()?),
        Value::Module(m) => RawValue::pointer(TypeTag::Module, m.handle().live_addr()?),
        Value::Array(t) => match t.handle() {
            Some(handle) => RawValue::pointer(TypeTag::Array, handle.live_addr()?),
            None => RawValue::pointer(TypeTag::ArrayView, t.descriptor()),
        },
        Value::Object(o) => {
            // Indices below OBJECT_BEGIN, and those of the dedicated object
            // tags, would decode as a different variant.
            let index = o.type_index();
            if !matches!(TypeTag::from_code(index), Ok(TypeTag::Object(_))) {
                return Err(Error::UnsupportedValueType(format!(
                    "object with type index {index}"
                )));
            }
            RawValue::pointer(TypeTag::Object(index), o.handle().live_addr()?)
        }
    };
    buf.write_bytes(slot, &raw.to_bytes());
    Ok(())
}

/// Read the record at `addr` back into a host value.
pub fn decode<S: Sandbox + ?Sized>(sandbox: &mut S, addr: u32, mode: DecodeMode) -> Result<Value> {
    let raw = RawValue::read(sandbox.memory(), addr)?;
    decode_raw(sandbox, raw, mode)
}

/// Decode a record that has already been read out of sandbox memory.
pub fn decode_raw<S: Sandbox + ?Sized>(
    sandbox: &mut S,
    raw: RawValue,
    mode: DecodeMode,
) -> Result<Value> {
    let tag = TypeTag::from_code(raw.tag)?;
    if mode == (DecodeMode::Borrowed { resuming: true }) && tag.needs_conversion() {
        return Err(Error::IllegalArgumentInSuspendedContext(tag.name()));
    }

    let value = match tag {
        TypeTag::None => Value::None,
        TypeTag::Int => Value::Int(raw.as_i64()),
        TypeTag::Bool => Value::Bool(raw.as_i64() != 0),
        TypeTag::Float => Value::Float(raw.as_f64()),
        TypeTag::OpaquePtr => Value::OpaquePtr(raw.as_ptr()),
        TypeTag::Device => Value::Device(raw.as_device()),
        TypeTag::RawStr => Value::Str(memory::read_string(sandbox.memory(), raw.as_ptr())?),
        TypeTag::Bytes => {
            Value::Bytes(memory::read_len_prefixed(sandbox.memory(), raw.as_ptr())?.to_vec())
        }
        TypeTag::ArrayView => Value::Array(read_tensor(sandbox.memory(), raw.as_ptr(), None)?),
        TypeTag::Function | TypeTag::Array | TypeTag::Module | TypeTag::Object(_) => {
            return decode_object(sandbox, tag, raw.as_ptr(), mode);
        }
    };
    Ok(value)
}

fn decode_object<S: Sandbox + ?Sized>(
    sandbox: &mut S,
    tag: TypeTag,
    addr: u32,
    mode: DecodeMode,
) -> Result<Value> {
    if addr == 0 {
        return Ok(Value::None);
    }
    let track = match mode {
        DecodeMode::Owned { track } => track,
        DecodeMode::Borrowed { .. } => {
            sandbox.object_retain(addr)?;
            true
        }
    };

    let handle = Handle::new(addr);
    let value = match tag {
        TypeTag::Function => Ok(Value::Function(PackedFunc::from_handle(handle.clone()))),
        TypeTag::Module => Ok(Value::Module(Module::from_handle(handle.clone()))),
        TypeTag::Array => {
            read_tensor(sandbox.memory(), addr, Some(handle.clone())).map(Value::Array)
        }
        _ => Ok(Value::Object(Object::from_handle(handle.clone(), tag.code()))),
    };
    let attached = value.and_then(|value| {
        if track {
            sandbox.state().scopes.attach(&handle)?;
        }
        Ok(value)
    });
    if attached.is_err() {
        scope::release(sandbox, &handle)?;
    }
    attached
}

/// Read a tensor descriptor at `addr`.
pub fn read_tensor(mem: &[u8], addr: u32, handle: Option<Handle>) -> Result<Tensor> {
    // Every field lies below `descriptor::SIZE`.
    memory::offset(addr, descriptor::SIZE)?;
    let field = |off: u32| addr + off;
    let ndim = memory::read_i32(mem, field(descriptor::NDIM))?;
    let ndim = u32::try_from(ndim).map_err(|_| Error::TypeMismatch {
        expected: "non-negative rank",
        found: "negative rank",
    })?;
    let shape_ptr = memory::read_u32(mem, field(descriptor::SHAPE))?;
    let shape = (0..ndim)
        .map(|i| {
            let dim = i.checked_mul(8).ok_or(Error::OutOfBounds {
                addr: shape_ptr,
                len: ndim as usize * 8,
            })?;
            memory::read_i64(mem, memory::offset(shape_ptr, dim)?)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor {
        handle,
        descriptor: addr,
        dtype: DataType::new(
            memory::read_u8(mem, field(descriptor::DTYPE_CODE))?,
            memory::read_u8(mem, field(descriptor::DTYPE_BITS))?,
            memory::read_u16(mem, field(descriptor::DTYPE_LANES))?,
        ),
        shape,
        device: Device::new(
            DeviceType::from_code(memory::read_i32(mem, field(descriptor::DEVICE_TYPE))?),
            memory::read_i32(mem, field(descriptor::DEVICE_ID))?,
        ),
        data: memory::read_u32(mem, field(descriptor::DATA))?,
        byte_offset: memory::read_u64(mem, field(descriptor::BYTE_OFFSET))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::Bridge;
    use crate::testing::SimSandbox;

    fn round_trip(sandbox: &mut SimSandbox, value: &Value, mode: DecodeMode) -> Value {
        let mut buf = sandbox.state().arena.checkout();
        let slot = buf.alloc_records(1);
        encode(&mut buf, slot, value).unwrap();
        buf.commit(sandbox).unwrap();
        let decoded = decode(sandbox, buf.addr(slot), mode).unwrap();
        sandbox.state().arena.recycle(buf);
        decoded
    }

    #[test]
    fn plain_values_round_trip() {
        let mut sandbox = SimSandbox::new();
        let values = vec![
            Value::None,
            Value::Bool(true),
            Value::Int(-42),
            Value::Float(1.5),
            Value::OpaquePtr(0x40),
            Value::Device(Device::webgpu(2)),
            Value::Str("hello, sandbox".to_string()),
            Value::Str(String::new()),
            Value::Bytes(vec![0, 1, 2, 255]),
        ];
        for value in values {
            let back = round_trip(&mut sandbox, &value, DecodeMode::Owned { track: false });
            assert_eq!(back, value);
        }
    }

    #[test]
    fn handles_round_trip_by_address() {
        let mut sandbox = SimSandbox::new();
        let array = sandbox.sim_empty_array(&[2, 3], DataType::float32(), Device::cpu());
        let original = Value::Array(array);
        let back = round_trip(&mut sandbox, &original, DecodeMode::Owned { track: false });
        let back = back.into_array().unwrap();
        assert_eq!(back.handle().unwrap().addr(), original.handle().unwrap().addr());
        assert_eq!(back.shape(), &[2, 3]);
        assert_eq!(back.dtype(), DataType::float32());
        assert!(!back.is_view());
    }

    #[test]
    fn modules_and_objects_round_trip_into_the_scope() {
        let mut sandbox = SimSandbox::new();
        let module_addr = sandbox
            .sim_new_array(&[1], DataType::float32(), Device::cpu())
            .unwrap();
        let object_addr = sandbox
            .sim_new_array(&[1], DataType::float32(), Device::cpu())
            .unwrap();
        let module = Value::Module(Module::from_handle(Handle::new(module_addr)));
        let object = Value::Object(Object::from_handle(Handle::new(object_addr), 80));

        sandbox.begin_scope();
        let owned = DecodeMode::Owned { track: true };
        let back = round_trip(&mut sandbox, &module, owned).into_module().unwrap();
        assert_eq!(back.handle().addr(), module_addr);
        let back = round_trip(&mut sandbox, &object, owned).into_object().unwrap();
        assert_eq!(back.handle().addr(), object_addr);
        assert_eq!(back.type_index(), 80);
        assert_eq!(sandbox.state().scopes.live_in_top(), 2);
        assert_eq!(sandbox.sim_refcount(module_addr), Some(1));

        sandbox.end_scope().unwrap();
        assert_eq!(sandbox.sim_refcount(module_addr), None);
        assert_eq!(sandbox.sim_refcount(object_addr), None);
    }

    #[test]
    fn borrowed_modules_and_objects_take_their_own_reference() {
        let mut sandbox = SimSandbox::new();
        let module_addr = sandbox
            .sim_new_array(&[1], DataType::float32(), Device::cpu())
            .unwrap();
        let object_addr = sandbox
            .sim_new_array(&[1], DataType::float32(), Device::cpu())
            .unwrap();
        let module = Value::Module(Module::from_handle(Handle::new(module_addr)));
        let object = Value::Object(Object::from_handle(Handle::new(object_addr), 80));

        sandbox.begin_scope();
        let borrowed = DecodeMode::Borrowed { resuming: false };
        let back = round_trip(&mut sandbox, &module, borrowed).into_module().unwrap();
        assert_eq!(back.handle().addr(), module_addr);
        let back = round_trip(&mut sandbox, &object, borrowed).into_object().unwrap();
        assert_eq!(back.handle().addr(), object_addr);
        assert_eq!(back.type_index(), 80);
        assert_eq!(sandbox.state().scopes.live_in_top(), 2);
        assert_eq!(sandbox.sim_refcount(module_addr), Some(2));
        assert_eq!(sandbox.sim_refcount(object_addr), Some(2));

        sandbox.end_scope().unwrap();
        assert_eq!(sandbox.sim_refcount(module_addr), Some(1));
        assert_eq!(sandbox.sim_refcount(object_addr), Some(1));
    }

    #[test]
    fn reserved_type_indices_are_not_generic_objects() {
        let mut sandbox = SimSandbox::new();
        let mut buf = sandbox.state().arena.checkout();
        let slot = buf.alloc_records(1);
        for index in [3, 68, 70, 73] {
            let object = Value::Object(Object::from_handle(Handle::new(0x40), index));
            let err = encode(&mut buf, slot, &object).unwrap_err();
            assert_eq!(
                err,
                Error::UnsupportedValueType(format!("object with type index {index}"))
            );
        }
    }

    #[test]
    fn views_encode_their_descriptor() {
        let mut sandbox = SimSandbox::new();
        let owned = sandbox.sim_empty_array(&[4], DataType::float32(), Device::cpu());
        let view = read_tensor(sandbox.memory(), owned.descriptor(), None).unwrap();
        let back = round_trip(
            &mut sandbox,
            &Value::Array(view),
            DecodeMode::Borrowed { resuming: false },
        );
        let back = back.into_array().unwrap();
        assert!(back.is_view());
        assert_eq!(back.shape(), &[4]);
        assert_eq!(sandbox.state().scopes.depth(), 0);
    }

    #[test]
    fn owned_decode_attaches_to_current_scope() {
        let mut sandbox = SimSandbox::new();
        let array = sandbox.sim_empty_array(&[1], DataType::float32(), Device::cpu());
        sandbox.state().scopes.begin();
        let _ = round_trip(&mut sandbox, &Value::Array(array), DecodeMode::Owned { track: true });
        assert_eq!(sandbox.state().scopes.live_in_top(), 1);
    }

    #[test]
    fn owned_decode_without_scope_releases_the_handle() {
        let mut sandbox = SimSandbox::new();
        let array = sandbox.sim_empty_array(&[1], DataType::float32(), Device::cpu());
        let addr = array.handle().unwrap().addr();
        sandbox.sim_retain(addr);

        let mut buf = sandbox.state().arena.checkout();
        let slot = buf.alloc_records(1);
        encode(&mut buf, slot, &Value::Array(array)).unwrap();
        buf.commit(&mut sandbox).unwrap();
        let err = decode(&mut sandbox, buf.addr(slot), DecodeMode::Owned { track: true });
        assert_eq!(err.unwrap_err(), Error::NoOpenScope);
        assert_eq!(sandbox.sim_refcount(addr), Some(1));
    }

    #[test]
    fn resuming_rejects_conversions() {
        let mut sandbox = SimSandbox::new();
        let mut buf = sandbox.state().arena.checkout();
        let slot = buf.alloc_records(1);
        encode(&mut buf, slot, &Value::Str("late".into())).unwrap();
        buf.commit(&mut sandbox).unwrap();
        let err = decode(
            &mut sandbox,
            buf.addr(slot),
            DecodeMode::Borrowed { resuming: true },
        )
        .unwrap_err();
        assert_eq!(err, Error::IllegalArgumentInSuspendedContext("string"));
    }

    #[test]
    fn disposed_handles_cannot_be_encoded() {
        let mut sandbox = SimSandbox::new();
        let array = sandbox.sim_empty_array(&[1], DataType::float32(), Device::cpu());
        array.handle().unwrap().mark_disposed();
        let mut buf = sandbox.state().arena.checkout();
        let slot = buf.alloc_records(1);
        let err = encode(&mut buf, slot, &Value::Array(array)).unwrap_err();
        assert!(matches!(err, Error::DisposedHandle(_)));
    }

    #[test]
    fn descriptors_near_the_end_of_memory_are_out_of_bounds() {
        let err = read_tensor(&[0u8; 64], 0xFFFF_FFF0, None).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { addr: 0xFFFF_FFF0, .. }));

        let mut mem = vec![0u8; 64];
        memory::write_u32(&mut mem, descriptor::NDIM, 2).unwrap();
        memory::write_u32(&mut mem, descriptor::SHAPE, 0xFFFF_FFFC).unwrap();
        let err = read_tensor(&mem, 0, None).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { .. }));
        assert!(record_addr(0xFFFF_FFF0, 1).is_err());
        assert_eq!(record_addr(0x100, 2).unwrap(), 0x120);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        assert_eq!(TypeTag::from_code(40), Err(Error::UnknownTag(40)));
        assert_eq!(TypeTag::from_code(100).unwrap(), TypeTag::Object(100));
        assert!(TypeTag::Function.is_object());
        assert!(!TypeTag::ArrayView.needs_conversion());
    }
}
