//! Core types for value types, tensor element types, devices and constants.

use crate::{Error, Result};
use std::fmt;

/// Tensor element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F64,
    F32,
    F16,
    BF16,
    I64,
    I32,
    I8,
    U8,
    Bool,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::F64 | DataType::I64 => 8,
            DataType::F32 | DataType::I32 => 4,
            DataType::F16 | DataType::BF16 => 2,
            DataType::I8 | DataType::U8 | DataType::Bool => 1,
        }
    }

    /// Check if this is a floating point type.
    pub fn is_floating_point(&self) -> bool {
        matches!(
            self,
            DataType::F64 | DataType::F32 | DataType::F16 | DataType::BF16
        )
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::F64 => "f64",
            DataType::F32 => "f32",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::I64 => "i64",
            DataType::I32 => "i32",
            DataType::I8 => "i8",
            DataType::U8 => "u8",
            DataType::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// Device a tensor lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda(u16),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(index) => write!(f, "cuda:{index}"),
        }
    }
}

/// Static type of an IR value.
///
/// Only the mutable types (tensors, lists, tuples holding them, modules) take
/// part in alias analysis; scalars are immutable and never alias anything.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    Tensor,
    Int,
    Float,
    Bool,
    Str,
    NoneType,
    IntList,
    List(Box<ValueType>),
    Tuple(Vec<ValueType>),
    /// A module instance, named by its class.
    Module(String),
    Any,
}

impl ValueType {
    /// Check if values of this type may share mutable storage.
    pub fn is_mutable(&self) -> bool {
        match self {
            ValueType::Tensor
            | ValueType::IntList
            | ValueType::List(_)
            | ValueType::Module(_)
            | ValueType::Any => true,
            ValueType::Tuple(elements) => elements.iter().any(ValueType::is_mutable),
            ValueType::Int
            | ValueType::Float
            | ValueType::Bool
            | ValueType::Str
            | ValueType::NoneType => false,
        }
    }

    /// Check if this is a module type.
    pub fn is_module(&self) -> bool {
        matches!(self, ValueType::Module(_))
    }

    /// Check if this is a tensor type.
    pub fn is_tensor(&self) -> bool {
        matches!(self, ValueType::Tensor)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Tensor => f.write_str("Tensor"),
            ValueType::Int => f.write_str("int"),
            ValueType::Float => f.write_str("float"),
            ValueType::Bool => f.write_str("bool"),
            ValueType::Str => f.write_str("str"),
            ValueType::NoneType => f.write_str("NoneType"),
            ValueType::IntList => f.write_str("int[]"),
            ValueType::List(element) => write!(f, "{element}[]"),
            ValueType::Tuple(elements) => {
                f.write_str("(")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{element}")?;
                }
                f.write_str(")")
            }
            ValueType::Module(class) => write!(f, "Module({class})"),
            ValueType::Any => f.write_str("Any"),
        }
    }
}

/// Raw tensor data.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I64(Vec<i64>),
    I32(Vec<i32>),
    Bool(Vec<bool>),
    U8(Vec<u8>),
}

impl TensorData {
    /// Get the number of elements in this tensor data.
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::I64(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::Bool(v) => v.len(),
            TensorData::U8(v) => v.len(),
        }
    }

    /// Check if this tensor data is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the element type of this tensor data.
    pub fn dtype(&self) -> DataType {
        match self {
            TensorData::F32(_) => DataType::F32,
            TensorData::I64(_) => DataType::I64,
            TensorData::I32(_) => DataType::I32,
            TensorData::Bool(_) => DataType::Bool,
            TensorData::U8(_) => DataType::U8,
        }
    }
}

/// A tensor whose contents are known at compile time.
///
/// Produced by freezing (module parameters become embedded constants) and
/// by literal tensor constants already present in the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorValue {
    /// The raw tensor data.
    pub data: TensorData,

    /// The shape of the tensor (dimensions).
    pub shape: Vec<usize>,

    /// The device the tensor lives on.
    pub device: Device,
}

impl TensorValue {
    /// Create a new CPU tensor value.
    ///
    /// # Errors
    ///
    /// Returns an error if the data length doesn't match the shape product.
    pub fn new(data: TensorData, shape: Vec<usize>) -> Result<Self> {
        let expected_len: usize = shape.iter().product();
        if data.len() != expected_len {
            return Err(Error::Shape(format!(
                "Data length {} doesn't match shape {:?} (product = {})",
                data.len(),
                shape,
                expected_len
            )));
        }
        Ok(Self {
            data,
            shape,
            device: Device::Cpu,
        })
    }

    /// Create a one-dimensional f32 tensor.
    pub fn from_f32(values: Vec<f32>) -> Self {
        let shape = vec![values.len()];
        Self {
            data: TensorData::F32(values),
            shape,
            device: Device::Cpu,
        }
    }

    /// Place this tensor on another device.
    pub fn on(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Get the element type.
    pub fn dtype(&self) -> DataType {
        self.data.dtype()
    }

    /// Get the total number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Try to get as f32 slice.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Try to get as i64 slice.
    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.data {
            TensorData::I64(v) => Some(v),
            _ => None,
        }
    }
}

/// A compile-time constant carried by `prim::Constant` nodes, module
/// snapshots and constant-value facts.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    IntList(Vec<i64>),
    Tensor(TensorValue),
}

impl ConstantValue {
    /// The static type of this constant.
    pub fn value_type(&self) -> ValueType {
        match self {
            ConstantValue::None => ValueType::NoneType,
            ConstantValue::Bool(_) => ValueType::Bool,
            ConstantValue::Int(_) => ValueType::Int,
            ConstantValue::Float(_) => ValueType::Float,
            ConstantValue::Str(_) => ValueType::Str,
            ConstantValue::IntList(_) => ValueType::IntList,
            ConstantValue::Tensor(_) => ValueType::Tensor,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConstantValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConstantValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConstantValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int_list(&self) -> Option<&[i64]> {
        match self {
            ConstantValue::IntList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&TensorValue> {
        match self {
            ConstantValue::Tensor(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ConstantValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstantValue::None => f.write_str("None"),
            ConstantValue::Bool(v) => write!(f, "{v}"),
            ConstantValue::Int(v) => write!(f, "{v}"),
            ConstantValue::Float(v) => write!(f, "{v:?}"),
            ConstantValue::Str(v) => write!(f, "{v:?}"),
            ConstantValue::IntList(v) => write!(f, "{v:?}"),
            ConstantValue::Tensor(t) => {
                write!(f, "Tensor({}, {:?}, {}, ", t.dtype(), t.shape, t.device)?;
                match &t.data {
                    TensorData::F32(v) => write!(f, "{v:?})"),
                    TensorData::I64(v) => write!(f, "{v:?})"),
                    TensorData::I32(v) => write!(f, "{v:?})"),
                    TensorData::Bool(v) => write!(f, "{v:?})"),
                    TensorData::U8(v) => write!(f, "{v:?})"),
                }
            }
        }
    }
}
