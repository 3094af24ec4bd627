//! Data types that memory accesses are described with.

use crate::util::StaticMemorySize;

/// The type of value a symbol reference loads or stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    NoType,
    Int8,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
    Address,
}
impl DataType {
    /// Whether this is one of the integer types that the alias sets group as 'int'
    #[must_use]
    pub fn is_int(self) -> bool {
        matches!(
            self,
            DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64
        )
    }

    #[must_use]
    pub fn is_floating_point(self) -> bool {
        matches!(self, DataType::Float | DataType::Double)
    }

    /// Size in bytes, `None` for [`DataType::NoType`]
    #[must_use]
    pub fn size(self) -> Option<usize> {
        Some(match self {
            DataType::NoType => return None,
            DataType::Int8 => i8::MEMORY_SIZE,
            DataType::Int16 => i16::MEMORY_SIZE,
            DataType::Int32 | DataType::Float => i32::MEMORY_SIZE,
            DataType::Int64 | DataType::Double => i64::MEMORY_SIZE,
            DataType::Address => std::mem::size_of::<usize>(),
        })
    }

    /// The descriptor letter used when fabricating a qualified field name
    #[must_use]
    pub fn descriptor(self) -> &'static str {
        match self {
            DataType::NoType => "V",
            DataType::Int8 => "B",
            DataType::Int16 => "S",
            DataType::Int32 => "I",
            DataType::Int64 => "J",
            DataType::Float => "F",
            DataType::Double => "D",
            DataType::Address => "Ljava/lang/Object;",
        }
    }
}
