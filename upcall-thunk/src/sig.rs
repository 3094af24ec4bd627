//! Native function signatures, as far as calling conventions care about them.

use std::{fmt, str::FromStr};

use smallvec::SmallVec;

/// Bytes that every argument slot in the flat argument list takes up
pub const SLOT_SIZE: u32 = 8;

/// How the fields of an aggregate are laid out, by the kind of value in each eightbyte.
/// `sp` is a single precision float, `dp` a double and `misc` anything that isn't floating point.
/// So `SpDp` is an aggregate made of a float (or two floats) followed by a double.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateShape {
    AllSp,
    AllDp,
    SpDp,
    SpSpDp,
    DpSp,
    DpSpSp,
    MiscSp,
    MiscDp,
    SpMisc,
    DpMisc,
    Misc,
    /// An aggregate larger than 16 bytes whose members are not all floats or all doubles
    Other,
}
impl AggregateShape {
    pub const ALL: [AggregateShape; 12] = [
        AggregateShape::AllSp,
        AggregateShape::AllDp,
        AggregateShape::SpDp,
        AggregateShape::SpSpDp,
        AggregateShape::DpSp,
        AggregateShape::DpSpSp,
        AggregateShape::MiscSp,
        AggregateShape::MiscDp,
        AggregateShape::SpMisc,
        AggregateShape::DpMisc,
        AggregateShape::Misc,
        AggregateShape::Other,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            AggregateShape::AllSp => "all-sp",
            AggregateShape::AllDp => "all-dp",
            AggregateShape::SpDp => "sp-dp",
            AggregateShape::SpSpDp => "sp-sp-dp",
            AggregateShape::DpSp => "dp-sp",
            AggregateShape::DpSpSp => "dp-sp-sp",
            AggregateShape::MiscSp => "misc-sp",
            AggregateShape::MiscDp => "misc-dp",
            AggregateShape::SpMisc => "sp-misc",
            AggregateShape::DpMisc => "dp-misc",
            AggregateShape::Misc => "misc",
            AggregateShape::Other => "other",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<AggregateShape> {
        AggregateShape::ALL
            .iter()
            .copied()
            .find(|shape| shape.name() == name)
    }

    /// The size of the members, if every member of the aggregate is the same kind of floating
    /// point value
    #[must_use]
    pub fn homogeneous_float_size(self) -> Option<u32> {
        match self {
            AggregateShape::AllSp => Some(4),
            AggregateShape::AllDp => Some(8),
            _ => None,
        }
    }
}

/// The type of a parameter or the return value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SigType {
    Void,
    Char,
    Short,
    Int32,
    Int64,
    Pointer,
    Float,
    Double,
    Struct { shape: AggregateShape, size: u32 },
}
impl SigType {
    #[must_use]
    pub fn is_struct(self) -> bool {
        matches!(self, SigType::Struct { .. })
    }

    #[must_use]
    pub fn is_floating_point(self) -> bool {
        matches!(self, SigType::Float | SigType::Double)
    }

    /// Number of argument list slots that a parameter of this type takes up
    #[must_use]
    pub fn slots(self) -> u32 {
        match self {
            SigType::Struct { size, .. } => size / SLOT_SIZE + u32::from(size % SLOT_SIZE != 0),
            _ => 1,
        }
    }

    /// Bytes that a parameter of this type takes up in the argument list
    #[must_use]
    pub fn arg_size(self) -> u64 {
        u64::from(self.slots()) * u64::from(SLOT_SIZE)
    }

    /// The descriptor character (or aggregate descriptor)
    fn write_descriptor(self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigType::Void => f.write_str("v"),
            SigType::Char => f.write_str("c"),
            SigType::Short => f.write_str("s"),
            SigType::Int32 => f.write_str("i"),
            SigType::Int64 => f.write_str("j"),
            SigType::Pointer => f.write_str("p"),
            SigType::Float => f.write_str("f"),
            SigType::Double => f.write_str("d"),
            SigType::Struct { shape, size } => write!(f, "{{{}:{}}}", size, shape.name()),
        }
    }
}

/// Which dispatcher the thunk calls, decided by the return type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatcherKind {
    Void,
    /// Anything returned in a 32-bit integer register
    Int32,
    /// 64-bit integers and pointers
    Int64,
    Float,
    Double,
    Struct,
}
impl DispatcherKind {
    #[must_use]
    pub fn for_return(ret: SigType) -> DispatcherKind {
        match ret {
            SigType::Void => DispatcherKind::Void,
            SigType::Char | SigType::Short | SigType::Int32 => DispatcherKind::Int32,
            SigType::Int64 | SigType::Pointer => DispatcherKind::Int64,
            SigType::Float => DispatcherKind::Float,
            SigType::Double => DispatcherKind::Double,
            SigType::Struct { .. } => DispatcherKind::Struct,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub params: SmallVec<[SigType; 8]>,
    pub ret: SigType,
}
impl Signature {
    #[must_use]
    pub fn new(params: impl IntoIterator<Item = SigType>, ret: SigType) -> Signature {
        Signature {
            params: params.into_iter().collect(),
            ret,
        }
    }

    #[must_use]
    pub fn dispatcher(&self) -> DispatcherKind {
        DispatcherKind::for_return(self.ret)
    }

    /// Total size of the argument list of a call with this signature
    #[must_use]
    pub fn arg_list_size(&self) -> u64 {
        self.params.iter().map(|param| param.arg_size()).sum()
    }

    /// The offset of the argument `index` inside of the flat argument list
    #[must_use]
    pub fn arg_offset(&self, index: usize) -> Option<u64> {
        if index >= self.params.len() {
            return None;
        }

        Some(self.params[..index].iter().map(|param| param.arg_size()).sum())
    }
}
impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i != 0 {
                f.write_str(",")?;
            }
            param.write_descriptor(f)?;
        }
        f.write_str(")")?;
        self.ret.write_descriptor(f)
    }
}

#[must_use]
pub fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

/// Get a pointer to the argument `index` inside of the argument list at `base` which a thunk for
/// `signature` built.
/// Returns `None` if the signature has no such parameter.
#[must_use]
pub fn arg_pointer(signature: &Signature, base: *mut u8, index: usize) -> Option<*mut u8> {
    let offset = signature.arg_offset(index)?;
    let offset = usize::try_from(offset).ok()?;
    Some(base.wrapping_add(offset))
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SignatureParseError {
    /// The descriptor did not start with `(`
    ExpectedOpenParen,
    /// The parameter list was never closed
    ExpectedCloseParen,
    /// An unknown type character was found at the position
    UnknownType { position: usize, found: char },
    /// An aggregate descriptor was not of the form `{size:shape}`
    BadAggregate { position: usize },
    UnknownShape(String),
    /// `void` was used as a parameter type
    VoidParameter,
    MissingReturn,
    TrailingCharacters { position: usize },
}

impl FromStr for Signature {
    type Err = SignatureParseError;

    /// Parse a signature such as `(i,d,{8:misc},p)d`.
    ///
    /// Types are `v` void, `c` char, `s` short, `i` int32, `j` int64, `p` pointer, `f` float,
    /// `d` double and `{size:shape}` for aggregates.
    fn from_str(text: &str) -> Result<Signature, SignatureParseError> {
        let text = text.trim();
        let rest = text
            .strip_prefix('(')
            .ok_or(SignatureParseError::ExpectedOpenParen)?;
        let close = rest
            .find(')')
            .ok_or(SignatureParseError::ExpectedCloseParen)?;
        let (param_text, ret_text) = (&rest[..close], &rest[close + 1..]);

        let mut params = SmallVec::new();
        let mut position = 1;
        for part in param_text.split(',') {
            let trimmed = part.trim();
            if !trimmed.is_empty() {
                let (ty, used) = parse_type(trimmed, position)?;
                if used != trimmed.len() {
                    return Err(SignatureParseError::TrailingCharacters {
                        position: position + used,
                    });
                }
                if ty == SigType::Void {
                    return Err(SignatureParseError::VoidParameter);
                }
                params.push(ty);
            }
            position += part.len() + 1;
        }

        let ret_position = close + 2;
        let ret_text = ret_text.trim();
        if ret_text.is_empty() {
            return Err(SignatureParseError::MissingReturn);
        }
        let (ret, used) = parse_type(ret_text, ret_position)?;
        if used != ret_text.len() {
            return Err(SignatureParseError::TrailingCharacters {
                position: ret_position + used,
            });
        }

        Ok(Signature { params, ret })
    }
}

/// Parse a single type at the start of `text`, returning it and how many bytes it took
fn parse_type(text: &str, position: usize) -> Result<(SigType, usize), SignatureParseError> {
    let first = text.chars().next().ok_or(SignatureParseError::MissingReturn)?;
    let ty = match first {
        'v' => SigType::Void,
        'c' => SigType::Char,
        's' => SigType::Short,
        'i' => SigType::Int32,
        'j' => SigType::Int64,
        'p' => SigType::Pointer,
        'f' => SigType::Float,
        'd' => SigType::Double,
        '{' => {
            let end = text
                .find('}')
                .ok_or(SignatureParseError::BadAggregate { position })?;
            let (size, shape) = text[1..end]
                .split_once(':')
                .ok_or(SignatureParseError::BadAggregate { position })?;
            let size = size
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|size| *size > 0)
                .ok_or(SignatureParseError::BadAggregate { position })?;
            let shape = AggregateShape::from_name(shape.trim())
                .ok_or_else(|| SignatureParseError::UnknownShape(shape.trim().to_string()))?;
            return Ok((SigType::Struct { shape, size }, end + 1));
        }
        found => return Err(SignatureParseError::UnknownType { position, found }),
    };
    Ok((ty, 1))
}
