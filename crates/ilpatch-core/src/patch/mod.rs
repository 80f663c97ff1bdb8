//! Patch scripts.
//!
//! A [`PatchScript`] names one target method and a list of [`PatchOp`]s that
//! run in order against a single cursor. Scripts are plain data: they can be
//! built in Rust (see [`builtin_patches`]) or loaded from JSON.

mod builtin;
mod executor;
mod set;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::module::{OpCode, OperandKind, write_quoted};
use crate::resolve::SymbolQuery;
use crate::stream::{InstrPattern, MoveType};

pub use builtin::{MAIN_MARKER, builtin_patches};
pub use executor::{PatchExecutor, PatchOutcome, apply_script};
pub use set::{PatchSet, load_patch_set, save_patch_set};

/// Method a script edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodTarget {
    pub type_name: String,
    pub method: String,
    /// Overload selector; the first overload is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<String>>,
}

impl MethodTarget {
    pub fn new(type_name: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            method: method.into(),
            params: None,
        }
    }
}

impl fmt::Display for MethodTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.type_name, self.method)?;
        if let Some(params) = &self.params {
            write!(f, "({})", params.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchScript {
    pub name: String,
    pub target: MethodTarget,
    /// Pattern that only exists in an already patched body.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub probe: Vec<InstrPattern>,
    pub ops: Vec<PatchOp>,
}

impl PatchScript {
    pub fn new(name: impl Into<String>, target: MethodTarget) -> Self {
        Self {
            name: name.into(),
            target,
            probe: Vec::new(),
            ops: Vec::new(),
        }
    }

    pub fn with_probe(mut self, probe: Vec<InstrPattern>) -> Self {
        self.probe = probe;
        self
    }

    pub fn op(mut self, op: PatchOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn seek(self, move_type: MoveType, pattern: Vec<InstrPattern>) -> Self {
        self.op(PatchOp::Seek { pattern, move_type })
    }

    pub fn insert(self, instructions: Vec<InstrTemplate>) -> Self {
        self.op(PatchOp::Insert { instructions })
    }

    pub fn remove(self, count: usize) -> Self {
        self.op(PatchOp::Remove { count })
    }

    pub fn define_label(self, name: impl Into<String>) -> Self {
        self.op(PatchOp::DefineLabel { name: name.into() })
    }

    pub fn mark_label(self, name: impl Into<String>) -> Self {
        self.op(PatchOp::MarkLabel { name: name.into() })
    }

    pub fn emit_call(self, symbol: SymbolQuery) -> Self {
        self.op(PatchOp::EmitCall {
            symbol,
            virtual_call: false,
        })
    }

    pub fn emit_callvirt(self, symbol: SymbolQuery) -> Self {
        self.op(PatchOp::EmitCall {
            symbol,
            virtual_call: true,
        })
    }

    pub fn declare_local(self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.op(PatchOp::DeclareLocal {
            name: name.into(),
            type_name: type_name.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    /// Move the cursor to the next match of `pattern`; a missing anchor is fatal.
    Seek {
        pattern: Vec<InstrPattern>,
        #[serde(default)]
        move_type: MoveType,
    },
    Remove {
        count: usize,
    },
    Insert {
        instructions: Vec<InstrTemplate>,
    },
    DefineLabel {
        name: String,
    },
    MarkLabel {
        name: String,
    },
    /// Resolve a method and insert a call to it.
    EmitCall {
        symbol: SymbolQuery,
        #[serde(default)]
        virtual_call: bool,
    },
    DeclareLocal {
        name: String,
        type_name: String,
    },
}

impl PatchOp {
    /// Whether the op changes the instruction stream.
    pub fn edits(&self) -> bool {
        matches!(
            self,
            PatchOp::Remove { .. } | PatchOp::Insert { .. } | PatchOp::EmitCall { .. }
        )
    }
}

impl fmt::Display for PatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchOp::Seek { pattern, move_type } => {
                write!(f, "seek {:?} [{}]", move_type, crate::stream::format_patterns(pattern))
            }
            PatchOp::Remove { count } => write!(f, "remove {}", count),
            PatchOp::Insert { instructions } => write!(f, "insert {}", instructions.len()),
            PatchOp::DefineLabel { name } => write!(f, "define label {}", name),
            PatchOp::MarkLabel { name } => write!(f, "mark label {}", name),
            PatchOp::EmitCall {
                symbol,
                virtual_call,
            } => write!(f, "{} {}", if *virtual_call { "callvirt" } else { "call" }, symbol),
            PatchOp::DeclareLocal { name, type_name } => {
                write!(f, "declare local {}: {}", name, type_name)
            }
        }
    }
}

/// Operand of an instruction to insert, before symbols, locals and labels
/// are resolved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateOperand {
    #[default]
    None,
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Local(u16),
    /// Local declared earlier in the script with `declare_local`.
    NamedLocal(String),
    Arg(u16),
    Label(String),
    Labels(Vec<String>),
    Field(SymbolQuery),
    Method(SymbolQuery),
    Type(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "TemplateRepr")]
pub struct InstrTemplate {
    pub opcode: OpCode,
    pub operand: TemplateOperand,
}

// Text form where it parses back to the same template, the full object otherwise.
impl Serialize for InstrTemplate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let text = self.to_string();
        if text.parse::<InstrTemplate>().is_ok_and(|parsed| parsed == *self) {
            return serializer.serialize_str(&text);
        }

        #[derive(Serialize)]
        struct Full<'a> {
            opcode: OpCode,
            operand: &'a TemplateOperand,
        }
        Full {
            opcode: self.opcode,
            operand: &self.operand,
        }
        .serialize(serializer)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TemplateRepr {
    Text(String),
    Full {
        opcode: OpCode,
        #[serde(default)]
        operand: TemplateOperand,
    },
}

impl TryFrom<TemplateRepr> for InstrTemplate {
    type Error = Error;

    fn try_from(repr: TemplateRepr) -> Result<Self> {
        match repr {
            TemplateRepr::Text(text) => text.parse(),
            TemplateRepr::Full { opcode, operand } => Ok(Self { opcode, operand }),
        }
    }
}

impl InstrTemplate {
    pub fn new(opcode: OpCode, operand: TemplateOperand) -> Self {
        Self { opcode, operand }
    }

    pub fn simple(opcode: OpCode) -> Self {
        Self::new(opcode, TemplateOperand::None)
    }

    pub fn ldstr(value: impl Into<String>) -> Self {
        Self::new(OpCode::Ldstr, TemplateOperand::String(value.into()))
    }

    pub fn ldfld(query: SymbolQuery) -> Self {
        Self::new(OpCode::Ldfld, TemplateOperand::Field(query))
    }

    pub fn call(query: SymbolQuery) -> Self {
        Self::new(OpCode::Call, TemplateOperand::Method(query))
    }

    pub fn callvirt(query: SymbolQuery) -> Self {
        Self::new(OpCode::Callvirt, TemplateOperand::Method(query))
    }

    pub fn branch(opcode: OpCode, label: impl Into<String>) -> Self {
        Self::new(opcode, TemplateOperand::Label(label.into()))
    }

    pub fn named_local(opcode: OpCode, name: impl Into<String>) -> Self {
        Self::new(opcode, TemplateOperand::NamedLocal(name.into()))
    }
}

/// Parses `opcode [operand]`. Branch operands are label names, switch
/// operands a parenthesized label list, and local operands either `V_n`, a
/// bare index, or the name of a declared local.
impl FromStr for InstrTemplate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (mnemonic, rest) = s.split_once(char::is_whitespace).unwrap_or((s, ""));
        let opcode: OpCode = mnemonic
            .parse()
            .map_err(|_| Error::InvalidPatch(format!("Unknown opcode '{}'", mnemonic)))?;
        let rest = rest.trim();

        let invalid = |what: &str| {
            Error::InvalidPatch(format!("Invalid {} operand '{}' for {}", what, rest, opcode))
        };
        if opcode.implicit_operand::<u32>().is_some() || opcode.operand_kind() == OperandKind::None
        {
            if !rest.is_empty() {
                return Err(invalid("extra"));
            }
            return Ok(Self::simple(opcode));
        }
        if rest.is_empty() {
            return Err(Error::InvalidPatch(format!("{} needs an operand", opcode)));
        }

        let operand = match opcode.operand_kind() {
            OperandKind::None => TemplateOperand::None,
            OperandKind::Int32 => TemplateOperand::Int32(rest.parse().map_err(|_| invalid("int32"))?),
            OperandKind::Int64 => TemplateOperand::Int64(rest.parse().map_err(|_| invalid("int64"))?),
            OperandKind::Float64 => {
                TemplateOperand::Float64(rest.parse().map_err(|_| invalid("float64"))?)
            }
            OperandKind::String => TemplateOperand::String(
                serde_json::from_str::<String>(rest).map_err(|_| invalid("string"))?,
            ),
            OperandKind::Local => match rest.trim_start_matches("V_").parse() {
                Ok(index) => TemplateOperand::Local(index),
                Err(_) => TemplateOperand::NamedLocal(rest.to_string()),
            },
            OperandKind::Arg => TemplateOperand::Arg(
                rest.trim_start_matches("A_")
                    .parse()
                    .map_err(|_| invalid("argument"))?,
            ),
            OperandKind::Branch => TemplateOperand::Label(rest.to_string()),
            OperandKind::Switch => {
                let inner = rest
                    .strip_prefix('(')
                    .and_then(|r| r.strip_suffix(')'))
                    .ok_or_else(|| invalid("switch"))?;
                TemplateOperand::Labels(
                    inner
                        .split(',')
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(str::to_string)
                        .collect(),
                )
            }
            OperandKind::Field => TemplateOperand::Field(rest.parse()?),
            OperandKind::Method => TemplateOperand::Method(rest.parse()?),
            OperandKind::Type => TemplateOperand::Type(rest.to_string()),
        };
        Ok(Self::new(opcode, operand))
    }
}

impl fmt::Display for InstrTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        match &self.operand {
            TemplateOperand::None => Ok(()),
            TemplateOperand::Int32(v) => write!(f, " {}", v),
            TemplateOperand::Int64(v) => write!(f, " {}", v),
            TemplateOperand::Float64(v) => write!(f, " {:?}", v),
            TemplateOperand::String(s) => {
                f.write_str(" ")?;
                write_quoted(f, s)
            }
            TemplateOperand::Local(i) => write!(f, " V_{}", i),
            TemplateOperand::NamedLocal(name) => write!(f, " {}", name),
            TemplateOperand::Arg(i) => write!(f, " A_{}", i),
            TemplateOperand::Label(name) => write!(f, " {}", name),
            TemplateOperand::Labels(names) => write!(f, " ({})", names.join(", ")),
            TemplateOperand::Field(q) | TemplateOperand::Method(q) => write!(f, " {}", q),
            TemplateOperand::Type(t) => write!(f, " {}", t),
        }
    }
}
