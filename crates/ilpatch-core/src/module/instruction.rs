use std::fmt;

use serde::{Deserialize, Serialize};

use super::opcode::OpCode;

/// Parameter and return types of a method, by type name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub params: Vec<String>,
    pub ret: String,
}

impl Signature {
    pub fn new<I, S>(params: I, ret: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            params: params.into_iter().map(Into::into).collect(),
            ret: ret.into(),
        }
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

/// Reference to a field or method, possibly defined in another module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberRef {
    /// Name of the defining module.
    pub scope: String,
    pub declaring_type: String,
    pub name: String,
    /// Method signature; for fields `ret` holds the field type.
    pub signature: Signature,
}

impl fmt::Display for MemberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]{}::{}", self.scope, self.declaring_type, self.name)
    }
}

/// Instruction operand.
///
/// `T` is the branch target representation: instruction indices in a stored
/// [`MethodBody`](super::MethodBody), stream handles in an
/// [`InstructionStream`](crate::stream::InstructionStream).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand<T = u32> {
    None,
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Local(u16),
    Arg(u16),
    Branch(T),
    Switch(Vec<T>),
    Field(MemberRef),
    Method(MemberRef),
    Type(String),
}

impl<T> Operand<T> {
    /// Rewrite branch targets, keeping every other operand as-is.
    pub fn try_map_targets<U, E>(
        self,
        mut f: impl FnMut(T) -> Result<U, E>,
    ) -> Result<Operand<U>, E> {
        Ok(match self {
            Operand::None => Operand::None,
            Operand::Int32(v) => Operand::Int32(v),
            Operand::Int64(v) => Operand::Int64(v),
            Operand::Float64(v) => Operand::Float64(v),
            Operand::String(v) => Operand::String(v),
            Operand::Local(v) => Operand::Local(v),
            Operand::Arg(v) => Operand::Arg(v),
            Operand::Branch(t) => Operand::Branch(f(t)?),
            Operand::Switch(ts) => Operand::Switch(ts.into_iter().map(f).collect::<Result<_, _>>()?),
            Operand::Field(m) => Operand::Field(m),
            Operand::Method(m) => Operand::Method(m),
            Operand::Type(t) => Operand::Type(t),
        })
    }

    pub fn targets(&self) -> &[T] {
        match self {
            Operand::Branch(t) => std::slice::from_ref(t),
            Operand::Switch(ts) => ts,
            _ => &[],
        }
    }

    pub fn member(&self) -> Option<&MemberRef> {
        match self {
            Operand::Field(m) | Operand::Method(m) => Some(m),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction<T = u32> {
    pub opcode: OpCode,
    pub operand: Operand<T>,
}

impl<T> Instruction<T> {
    pub fn new(opcode: OpCode, operand: Operand<T>) -> Self {
        Self { opcode, operand }
    }

    pub fn simple(opcode: OpCode) -> Self {
        Self::new(opcode, Operand::None)
    }
}

/// Write `s` as a JSON string literal, the form text operands are parsed from.
pub(crate) fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    let quoted = serde_json::to_string(s).map_err(|_| fmt::Error)?;
    f.write_str(&quoted)
}

impl<T: fmt::Display> fmt::Display for Operand<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Int32(v) => write!(f, "{}", v),
            Operand::Int64(v) => write!(f, "{}", v),
            Operand::Float64(v) => write!(f, "{}", v),
            Operand::String(s) => write_quoted(f, s),
            Operand::Local(i) => write!(f, "V_{}", i),
            Operand::Arg(i) => write!(f, "A_{}", i),
            Operand::Branch(t) => write!(f, "{}", t),
            Operand::Switch(ts) => {
                let parts: Vec<String> = ts.iter().map(|t| t.to_string()).collect();
                write!(f, "({})", parts.join(", "))
            }
            Operand::Field(m) => write!(f, "{}", m),
            Operand::Method(m) => write!(f, "{}({})", m, m.signature.params.join(", ")),
            Operand::Type(t) => write!(f, "{}", t),
        }
    }
}

impl<T: fmt::Display> fmt::Display for Instruction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operand {
            Operand::None => write!(f, "{}", self.opcode),
            _ => write!(f, "{} {}", self.opcode, self.operand),
        }
    }
}
