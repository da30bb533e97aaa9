//! Method signatures and basic types.

use std::fmt;

use serde::Serialize;

use crate::error::SignatureError;

/// A value category as seen by the calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum BasicType {
    Boolean = 4,
    Char = 5,
    Float = 6,
    Double = 7,
    Byte = 8,
    Short = 9,
    Int = 10,
    Long = 11,
    Object = 12,
    Array = 13,
    Void = 14,
    /// Raw machine address, used for hidden native arguments.
    Address = 15,
}

impl BasicType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            4 => BasicType::Boolean,
            5 => BasicType::Char,
            6 => BasicType::Float,
            7 => BasicType::Double,
            8 => BasicType::Byte,
            9 => BasicType::Short,
            10 => BasicType::Int,
            11 => BasicType::Long,
            12 => BasicType::Object,
            13 => BasicType::Array,
            14 => BasicType::Void,
            15 => BasicType::Address,
            _ => return None,
        })
    }

    /// Occupies two argument slots (the second one is a `Void` half).
    pub fn is_wide(self) -> bool {
        matches!(self, BasicType::Long | BasicType::Double)
    }

    pub fn is_reference(self) -> bool {
        matches!(self, BasicType::Object | BasicType::Array)
    }

    pub fn is_floating(self) -> bool {
        matches!(self, BasicType::Float | BasicType::Double)
    }

    pub fn descriptor_char(self) -> char {
        match self {
            BasicType::Boolean => 'Z',
            BasicType::Char => 'C',
            BasicType::Float => 'F',
            BasicType::Double => 'D',
            BasicType::Byte => 'B',
            BasicType::Short => 'S',
            BasicType::Int => 'I',
            BasicType::Long => 'J',
            BasicType::Object => 'L',
            BasicType::Array => '[',
            BasicType::Void => 'V',
            BasicType::Address => 'A',
        }
    }
}

/// Parameter and return types of a method, without the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    params: Vec<BasicType>,
    ret: BasicType,
}

impl Signature {
    pub fn new(params: Vec<BasicType>, ret: BasicType) -> Self {
        Self { params, ret }
    }

    /// Parse a JVM method descriptor such as `(ILjava/lang/String;[J)V`.
    pub fn parse(descriptor: &str) -> Result<Self, SignatureError> {
        let bytes = descriptor.as_bytes();
        let err = |position| SignatureError {
            descriptor: descriptor.to_string(),
            position,
        };

        if bytes.first() != Some(&b'(') {
            return Err(err(0));
        }
        let mut pos = 1;
        let mut params = Vec::new();
        while pos < bytes.len() && bytes[pos] != b')' {
            let (ty, next) = Self::parse_field(bytes, pos).ok_or_else(|| err(pos))?;
            if ty == BasicType::Void {
                return Err(err(pos));
            }
            params.push(ty);
            pos = next;
        }
        if pos >= bytes.len() {
            return Err(err(pos));
        }
        pos += 1;
        let (ret, next) = Self::parse_field(bytes, pos).ok_or_else(|| err(pos))?;
        if next != bytes.len() {
            return Err(err(next));
        }
        Ok(Self { params, ret })
    }

    fn parse_field(bytes: &[u8], pos: usize) -> Option<(BasicType, usize)> {
        let ty = match *bytes.get(pos)? {
            b'Z' => BasicType::Boolean,
            b'C' => BasicType::Char,
            b'F' => BasicType::Float,
            b'D' => BasicType::Double,
            b'B' => BasicType::Byte,
            b'S' => BasicType::Short,
            b'I' => BasicType::Int,
            b'J' => BasicType::Long,
            b'V' => BasicType::Void,
            b'L' => {
                let end = bytes[pos..].iter().position(|&b| b == b';')?;
                if end == 1 {
                    return None;
                }
                return Some((BasicType::Object, pos + end + 1));
            }
            b'[' => {
                let mut next = pos + 1;
                while bytes.get(next) == Some(&b'[') {
                    next += 1;
                }
                let (elem, end) = Self::parse_field(bytes, next)?;
                if elem == BasicType::Void {
                    return None;
                }
                return Some((BasicType::Array, end));
            }
            _ => return None,
        };
        Some((ty, pos + 1))
    }

    pub fn params(&self) -> &[BasicType] {
        &self.params
    }

    pub fn ret(&self) -> BasicType {
        self.ret
    }

    /// Expand to the per-slot type list the calling convention consumes.
    ///
    /// The receiver, if any, comes first as an `Object`; every wide value is
    /// followed by a `Void` half.
    pub fn to_slot_types(&self, has_receiver: bool) -> Vec<BasicType> {
        let mut out = Vec::with_capacity(self.params.len() * 2 + 1);
        if has_receiver {
            out.push(BasicType::Object);
        }
        for &ty in &self.params {
            out.push(ty);
            if ty.is_wide() {
                out.push(BasicType::Void);
            }
        }
        out
    }

    /// Number of argument words, counting wide values twice and the receiver once.
    pub fn slot_count(&self, has_receiver: bool) -> usize {
        has_receiver as usize
            + self
                .params
                .iter()
                .map(|ty| if ty.is_wide() { 2 } else { 1 })
                .sum::<usize>()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for ty in &self.params {
            match ty {
                BasicType::Object => write!(f, "Ljava/lang/Object;")?,
                BasicType::Array => write!(f, "[Ljava/lang/Object;")?,
                other => write!(f, "{}", other.descriptor_char())?,
            }
        }
        write!(f, "){}", self.ret.descriptor_char())
    }
}
