//! Host-side representation of values exchanged with the foreign module.
//!
//! Plain data (`Int`, `Float`, strings, ...) is copied across the boundary.
//! Foreign resources (functions, modules, arrays, objects) are represented by
//! a [`Handle`], an opaque foreign address with a disposed flag. Handles are
//! reference-counted on the host only so that scope frames can recognise the
//! same wrapper by identity; the foreign resource itself is released exactly
//! once, through the scope manager or [`crate::Bridge::dispose`].

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Opaque address of a disposable foreign resource.
///
/// Clones share identity: disposing through one clone marks all of them
/// disposed.
#[derive(Clone)]
pub struct Handle(Rc<HandleCell>);

struct HandleCell {
    addr: u32,
    disposed: Cell<bool>,
}

impl Handle {
    pub(crate) fn new(addr: u32) -> Self {
        Self(Rc::new(HandleCell {
            addr,
            disposed: Cell::new(false),
        }))
    }

    /// The foreign address, regardless of disposal.
    pub fn addr(&self) -> u32 {
        self.0.addr
    }

    /// The foreign address, or `DisposedHandle` if it was released.
    pub fn live_addr(&self) -> Result<u32> {
        if self.is_disposed() {
            Err(Error::DisposedHandle(self.0.addr))
        } else {
            Ok(self.0.addr)
        }
    }

    /// Whether the foreign resource has been released.
    pub fn is_disposed(&self) -> bool {
        self.0.disposed.get()
    }

    /// Whether both handles are the same wrapper instance.
    pub fn same(&self, other: &Handle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Mark as disposed; returns `false` if it already was.
    pub(crate) fn mark_disposed(&self) -> bool {
        !self.0.disposed.replace(true)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x}", self.0.addr)?;
        if self.is_disposed() {
            write!(f, ", disposed")?;
        }
        write!(f, ")")
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

/// Anything that owns a [`Handle`] and can therefore live in a scope frame.
pub trait Tracked {
    /// The owned handle, or an error if this value owns nothing.
    fn tracked_handle(&self) -> Result<&Handle>;
}

/// Device type codes understood by the foreign runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Cpu,
    Cuda,
    CudaHost,
    OpenCl,
    Vulkan,
    Metal,
    WebGpu,
    Other(i32),
}

impl DeviceType {
    pub fn code(self) -> i32 {
        match self {
            DeviceType::Cpu => 1,
            DeviceType::Cuda => 2,
            DeviceType::CudaHost => 3,
            DeviceType::OpenCl => 4,
            DeviceType::Vulkan => 7,
            DeviceType::Metal => 8,
            DeviceType::WebGpu => 15,
            DeviceType::Other(code) => code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => DeviceType::Cpu,
            2 => DeviceType::Cuda,
            3 => DeviceType::CudaHost,
            4 => DeviceType::OpenCl,
            7 => DeviceType::Vulkan,
            8 => DeviceType::Metal,
            15 => DeviceType::WebGpu,
            other => DeviceType::Other(other),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Cuda => "cuda",
            DeviceType::CudaHost => "cuda_host",
            DeviceType::OpenCl => "opencl",
            DeviceType::Vulkan => "vulkan",
            DeviceType::Metal => "metal",
            DeviceType::WebGpu => "webgpu",
            DeviceType::Other(_) => "ext_dev",
        }
    }
}

impl FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "cpu" | "llvm" => DeviceType::Cpu,
            "cuda" | "gpu" => DeviceType::Cuda,
            "cuda_host" => DeviceType::CudaHost,
            "opencl" | "cl" => DeviceType::OpenCl,
            "vulkan" => DeviceType::Vulkan,
            "metal" => DeviceType::Metal,
            "webgpu" => DeviceType::WebGpu,
            other => return Err(Error::UnsupportedValueType(format!("device `{other}`"))),
        })
    }
}

/// A device as seen by the foreign runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device {
    pub device_type: DeviceType,
    pub device_id: i32,
}

impl Device {
    pub fn new(device_type: DeviceType, device_id: i32) -> Self {
        Self {
            device_type,
            device_id,
        }
    }

    pub fn cpu() -> Self {
        Self::new(DeviceType::Cpu, 0)
    }

    pub fn webgpu(device_id: i32) -> Self {
        Self::new(DeviceType::WebGpu, device_id)
    }

    /// Whether host code can read the device's memory directly.
    pub fn is_host_visible(&self) -> bool {
        matches!(self.device_type, DeviceType::Cpu | DeviceType::CudaHost)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_type.name(), self.device_id)
    }
}

/// Element type of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataType {
    pub code: u8,
    pub bits: u8,
    pub lanes: u16,
}

impl DataType {
    pub const INT: u8 = 0;
    pub const UINT: u8 = 1;
    pub const FLOAT: u8 = 2;
    pub const HANDLE: u8 = 3;
    pub const BFLOAT: u8 = 4;

    pub const fn new(code: u8, bits: u8, lanes: u16) -> Self {
        Self { code, bits, lanes }
    }

    pub const fn float32() -> Self {
        Self::new(Self::FLOAT, 32, 1)
    }

    /// Bytes per element, rounded up.
    pub fn element_bytes(&self) -> usize {
        (usize::from(self.bits) * usize::from(self.lanes)).div_ceil(8)
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::UnsupportedValueType(format!("dtype `{s}`"));
        if s == "bool" {
            return Ok(Self::new(Self::UINT, 1, 1));
        }
        let (base, lanes) = match s.split_once('x') {
            Some((base, lanes)) => (base, lanes.parse::<u16>().map_err(|_| invalid())?),
            None => (s, 1),
        };
        let (code, bits) = [
            ("bfloat", Self::BFLOAT),
            ("float", Self::FLOAT),
            ("uint", Self::UINT),
            ("int", Self::INT),
        ]
        .iter()
        .find_map(|(prefix, code)| base.strip_prefix(prefix).map(|bits| (*code, bits)))
        .ok_or_else(invalid)?;
        let bits = if bits.is_empty() && code == Self::BFLOAT {
            16
        } else {
            bits.parse::<u8>().map_err(|_| invalid())?
        };
        Ok(Self::new(code, bits, lanes))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code == Self::UINT && self.bits == 1 && self.lanes == 1 {
            return write!(f, "bool");
        }
        let prefix = match self.code {
            Self::INT => "int",
            Self::UINT => "uint",
            Self::FLOAT => "float",
            Self::BFLOAT => "bfloat",
            _ => "handle",
        };
        write!(f, "{prefix}{}", self.bits)?;
        if self.lanes != 1 {
            write!(f, "x{}", self.lanes)?;
        }
        Ok(())
    }
}

/// A callable foreign function.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedFunc {
    handle: Handle,
}

impl PackedFunc {
    pub(crate) fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Tracked for PackedFunc {
    fn tracked_handle(&self) -> Result<&Handle> {
        Ok(&self.handle)
    }
}

/// A foreign runtime module.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    handle: Handle,
}

impl Module {
    pub(crate) fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Tracked for Module {
    fn tracked_handle(&self) -> Result<&Handle> {
        Ok(&self.handle)
    }
}

/// Any other foreign object, identified by its run-time type index.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    handle: Handle,
    type_index: u32,
}

impl Object {
    pub(crate) fn from_handle(handle: Handle, type_index: u32) -> Self {
        Self { handle, type_index }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn type_index(&self) -> u32 {
        self.type_index
    }
}

impl Tracked for Object {
    fn tracked_handle(&self) -> Result<&Handle> {
        Ok(&self.handle)
    }
}

/// A foreign array.
///
/// Owned arrays carry a handle that must be disposed. Views only borrow a
/// descriptor for the duration of a callback and never free anything.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub(crate) handle: Option<Handle>,
    pub(crate) descriptor: u32,
    pub(crate) dtype: DataType,
    pub(crate) shape: Vec<i64>,
    pub(crate) device: Device,
    pub(crate) data: u32,
    pub(crate) byte_offset: u64,
}

impl Tensor {
    pub fn handle(&self) -> Option<&Handle> {
        self.handle.as_ref()
    }

    /// Address of the tensor descriptor in sandbox memory.
    pub fn descriptor(&self) -> u32 {
        self.descriptor
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Address of the first element's storage (before `byte_offset`).
    pub fn data(&self) -> u32 {
        self.data
    }

    pub fn byte_offset(&self) -> u64 {
        self.byte_offset
    }

    pub fn is_view(&self) -> bool {
        self.handle.is_none()
    }

    pub fn numel(&self) -> usize {
        self.shape
            .iter()
            .map(|d| usize::try_from(*d).unwrap_or(0))
            .product()
    }

    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype.element_bytes()
    }
}

impl Tracked for Tensor {
    fn tracked_handle(&self) -> Result<&Handle> {
        self.handle.as_ref().ok_or(Error::TypeMismatch {
            expected: "owned array",
            found: "array view",
        })
    }
}

/// A value that can cross the sandbox boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    OpaquePtr(u32),
    Device(Device),
    Str(String),
    Bytes(Vec<u8>),
    Function(PackedFunc),
    Module(Module),
    Array(Tensor),
    Object(Object),
}

impl Value {
    /// Build a value by inspecting the runtime type of a host value.
    ///
    /// Fails with `UnsupportedValueType` naming the offending type.
    pub fn from_any<T: Any>(value: &T) -> Result<Value> {
        let any = value as &dyn Any;
        macro_rules! widen {
            ($variant:ident, $target:ty, $($t:ty),*) => {
                $(
                    if let Some(v) = any.downcast_ref::<$t>() {
                        return Ok(Value::$variant(<$target>::from(*v)));
                    }
                )*
            };
        }
        widen!(Int, i64, i8, i16, i32, i64, u8, u16, u32);
        widen!(Float, f64, f32, f64);
        widen!(Bool, bool, bool);
        widen!(Device, Device, Device);

        let out_of_range = || {
            Error::UnsupportedValueType(format!("{} (out of range)", std::any::type_name::<T>()))
        };
        if let Some(v) = any.downcast_ref::<u64>() {
            return i64::try_from(*v).map(Value::Int).map_err(|_| out_of_range());
        }
        if let Some(v) = any.downcast_ref::<usize>() {
            return i64::try_from(*v).map(Value::Int).map_err(|_| out_of_range());
        }
        if let Some(v) = any.downcast_ref::<String>() {
            return Ok(Value::Str(v.clone()));
        }
        if let Some(v) = any.downcast_ref::<&'static str>() {
            return Ok(Value::Str((*v).to_string()));
        }
        if let Some(v) = any.downcast_ref::<Vec<u8>>() {
            return Ok(Value::Bytes(v.clone()));
        }
        if let Some(v) = any.downcast_ref::<PackedFunc>() {
            return Ok(Value::Function(v.clone()));
        }
        if let Some(v) = any.downcast_ref::<Module>() {
            return Ok(Value::Module(v.clone()));
        }
        if let Some(v) = any.downcast_ref::<Tensor>() {
            return Ok(Value::Array(v.clone()));
        }
        if let Some(v) = any.downcast_ref::<Object>() {
            return Ok(Value::Object(v.clone()));
        }
        if let Some(v) = any.downcast_ref::<Value>() {
            return Ok(v.clone());
        }
        if any.downcast_ref::<()>().is_some() {
            return Ok(Value::None);
        }
        Err(Error::UnsupportedValueType(
            std::any::type_name::<T>().to_string(),
        ))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::OpaquePtr(_) => "pointer",
            Value::Device(_) => "device",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Function(_) => "function",
            Value::Module(_) => "module",
            Value::Array(t) if t.is_view() => "array view",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    fn mismatch(&self, expected: &'static str) -> Error {
        Error::TypeMismatch {
            expected,
            found: self.type_name(),
        }
    }

    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Value::Int(v) => Ok(*v),
            Value::Bool(v) => Ok(i64::from(*v)),
            other => Err(other.mismatch("int")),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Value::Float(v) => Ok(*v),
            #[allow(clippy::cast_precision_loss)]
            Value::Int(v) => Ok(*v as f64),
            other => Err(other.mismatch("float")),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(v) => Ok(*v),
            Value::Int(v) => Ok(*v != 0),
            other => Err(other.mismatch("bool")),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(other.mismatch("string")),
        }
    }

    pub fn into_function(self) -> Result<PackedFunc> {
        match self {
            Value::Function(f) => Ok(f),
            other => Err(other.mismatch("function")),
        }
    }

    pub fn into_module(self) -> Result<Module> {
        match self {
            Value::Module(m) => Ok(m),
            other => Err(other.mismatch("module")),
        }
    }

    pub fn into_array(self) -> Result<Tensor> {
        match self {
            Value::Array(t) => Ok(t),
            other => Err(other.mismatch("array")),
        }
    }

    pub fn into_object(self) -> Result<Object> {
        match self {
            Value::Object(o) => Ok(o),
            other => Err(other.mismatch("object")),
        }
    }

    /// The handle this value owns, if any.
    pub fn handle(&self) -> Option<&Handle> {
        match self {
            Value::Function(f) => Some(f.handle()),
            Value::Module(m) => Some(m.handle()),
            Value::Array(t) => t.handle(),
            Value::Object(o) => Some(o.handle()),
            _ => None,
        }
    }
}

impl Tracked for Value {
    fn tracked_handle(&self) -> Result<&Handle> {
        self.handle().ok_or_else(|| self.mismatch("foreign object"))
    }
}

macro_rules! value_from {
    ($variant:ident: $($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

value_from!(Int: i8, i16, i32, i64, u8, u16, u32);
value_from!(Float: f32, f64);
value_from!(Bool: bool);
value_from!(Str: String, &str);
value_from!(Bytes: Vec<u8>, &[u8]);
value_from!(Device: Device);
value_from!(Function: PackedFunc);
value_from!(Module: Module);
value_from!(Array: Tensor);
value_from!(Object: Object);

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::None
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::None, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_parse_and_display() {
        for name in ["float32", "float16", "bfloat16", "int8", "uint32", "bool", "float32x4"] {
            let dtype: DataType = name.parse().unwrap();
            assert_eq!(dtype.to_string(), name);
        }
        assert_eq!("bfloat16".parse::<DataType>().unwrap().element_bytes(), 2);
        assert_eq!("float32x4".parse::<DataType>().unwrap().element_bytes(), 16);
        assert!("complex64".parse::<DataType>().is_err());
    }

    #[test]
    fn device_codes_round_trip() {
        for device_type in [DeviceType::Cpu, DeviceType::WebGpu, DeviceType::Other(42)] {
            assert_eq!(DeviceType::from_code(device_type.code()), device_type);
        }
        assert_eq!("webgpu".parse::<DeviceType>().unwrap(), DeviceType::WebGpu);
        assert_eq!(Device::webgpu(1).to_string(), "webgpu:1");
        assert!(Device::cpu().is_host_visible());
        assert!(!Device::webgpu(0).is_host_visible());
    }

    #[test]
    fn from_any_inspects_runtime_type() {
        assert_eq!(Value::from_any(&3_u8).unwrap(), Value::Int(3));
        assert_eq!(Value::from_any(&2.5_f32).unwrap(), Value::Float(2.5));
        assert_eq!(Value::from_any(&true).unwrap(), Value::Bool(true));
        assert_eq!(Value::from_any(&"hi").unwrap(), Value::Str("hi".into()));
        assert_eq!(Value::from_any(&()).unwrap(), Value::None);
    }

    #[test]
    fn from_any_rejects_unknown_types() {
        struct Opaque;
        let err = Value::from_any(&Opaque).unwrap_err();
        assert!(matches!(err, Error::UnsupportedValueType(name) if name.contains("Opaque")));

        let err = Value::from_any(&u64::MAX).unwrap_err();
        assert!(matches!(err, Error::UnsupportedValueType(name) if name.contains("out of range")));
    }

    #[test]
    fn handle_identity_and_disposal() {
        let a = Handle::new(0x100);
        let b = a.clone();
        let c = Handle::new(0x100);
        assert!(a.same(&b));
        assert!(!a.same(&c));

        assert!(a.mark_disposed());
        assert!(b.is_disposed());
        assert!(!b.mark_disposed());
        assert_eq!(b.live_addr(), Err(Error::DisposedHandle(0x100)));
    }

    #[test]
    fn views_are_not_tracked() {
        let view = Tensor {
            handle: None,
            descriptor: 64,
            dtype: DataType::float32(),
            shape: vec![2, 3],
            device: Device::cpu(),
            data: 128,
            byte_offset: 0,
        };
        assert!(view.is_view());
        assert_eq!(view.numel(), 6);
        assert_eq!(view.nbytes(), 24);
        assert!(view.tracked_handle().is_err());
        assert!(Value::Int(1).tracked_handle().is_err());
    }

    #[test]
    fn accessors_report_mismatches() {
        assert_eq!(Value::Int(7).as_i64().unwrap(), 7);
        assert_eq!(Value::Int(7).as_f64().unwrap(), 7.0);
        let err = Value::Str("x".into()).as_i64().unwrap_err();
        assert_eq!(
            err,
            Error::TypeMismatch {
                expected: "int",
                found: "string"
            }
        );
        assert_eq!(Value::from(Some(3_i32)), Value::Int(3));
        assert_eq!(Value::from(None::<i32>), Value::None);
    }
}
