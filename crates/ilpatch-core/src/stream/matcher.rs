//! Instruction patterns for anchoring edits.
//!
//! A pattern list is matched as one consecutive run of instructions by a
//! single left-to-right scan. Opcodes are compared in canonical form, so
//! `ldloc.3` matches `ldloc 3` and `brtrue.s` matches `brtrue`.
//!
//! Patterns also have a compact text form, one instruction per `;`:
//!
//! ```text
//! ldloc.3; ldloc.2; ldlen; conv.i4; blt ?
//! call [System.Runtime]System.IO.File::Exists
//! ```

use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};

use super::{InstructionStream, StreamInstruction, Target};
use crate::error::{Error, Result};
use crate::module::{MemberRef, OpCode, Operand, OperandKind, write_quoted};
use crate::resolve::{SymbolContext, SymbolQuery};

/// Operand test evaluated in Rust code.
#[derive(Clone)]
pub struct Predicate(Rc<dyn Fn(&Operand<Target>) -> bool>);

impl Predicate {
    pub fn new(f: impl Fn(&Operand<Target>) -> bool + 'static) -> Self {
        Self(Rc::new(f))
    }

    pub fn test(&self, operand: &Operand<Target>) -> bool {
        (self.0)(operand)
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate(..)")
    }
}

impl PartialEq for Predicate {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperandMatch {
    /// Any operand. For implicit-operand opcodes (`ldloc.3`) the implied
    /// operand must still match.
    #[default]
    Any,
    Int32(i32),
    String(String),
    Local(u16),
    Arg(u16),
    Type(String),
    Field(SymbolQuery),
    Method(SymbolQuery),
    /// Exact member, usually produced by [`InstrPattern::bind`].
    Resolved(MemberRef),
    #[serde(skip)]
    Satisfies(Predicate),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "PatternRepr")]
pub struct InstrPattern {
    pub opcode: OpCode,
    pub operand: OperandMatch,
}

// Text form where it round-trips, the full object otherwise.
impl Serialize for InstrPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match &self.operand {
            OperandMatch::Resolved(_) | OperandMatch::Satisfies(_) => {
                #[derive(Serialize)]
                struct Full<'a> {
                    opcode: OpCode,
                    operand: &'a OperandMatch,
                }
                Full {
                    opcode: self.opcode,
                    operand: &self.operand,
                }
                .serialize(serializer)
            }
            _ => serializer.collect_str(self),
        }
    }
}

// Patch files may spell a pattern either as text or as a full object.
#[derive(Deserialize)]
#[serde(untagged)]
enum PatternRepr {
    Text(String),
    Full {
        opcode: OpCode,
        #[serde(default)]
        operand: OperandMatch,
    },
}

impl TryFrom<PatternRepr> for InstrPattern {
    type Error = Error;

    fn try_from(repr: PatternRepr) -> Result<Self> {
        match repr {
            PatternRepr::Text(text) => text.parse(),
            PatternRepr::Full { opcode, operand } => Ok(Self { opcode, operand }),
        }
    }
}

impl InstrPattern {
    pub fn new(opcode: OpCode, operand: OperandMatch) -> Self {
        Self { opcode, operand }
    }

    /// Match on the opcode alone.
    pub fn op(opcode: OpCode) -> Self {
        Self::new(opcode, OperandMatch::Any)
    }

    pub fn ldc_i4(value: i32) -> Self {
        Self::new(OpCode::LdcI4, OperandMatch::Int32(value))
    }

    pub fn ldstr(value: impl Into<String>) -> Self {
        Self::new(OpCode::Ldstr, OperandMatch::String(value.into()))
    }

    pub fn ldloc(index: u16) -> Self {
        Self::new(OpCode::Ldloc, OperandMatch::Local(index))
    }

    pub fn stloc(index: u16) -> Self {
        Self::new(OpCode::Stloc, OperandMatch::Local(index))
    }

    pub fn ldarg(index: u16) -> Self {
        Self::new(OpCode::Ldarg, OperandMatch::Arg(index))
    }

    pub fn call(query: SymbolQuery) -> Self {
        Self::new(OpCode::Call, OperandMatch::Method(query))
    }

    pub fn callvirt(query: SymbolQuery) -> Self {
        Self::new(OpCode::Callvirt, OperandMatch::Method(query))
    }

    pub fn ldfld(query: SymbolQuery) -> Self {
        Self::new(OpCode::Ldfld, OperandMatch::Field(query))
    }

    pub fn ldsfld(query: SymbolQuery) -> Self {
        Self::new(OpCode::Ldsfld, OperandMatch::Field(query))
    }

    pub fn satisfies(opcode: OpCode, f: impl Fn(&Operand<Target>) -> bool + 'static) -> Self {
        Self::new(opcode, OperandMatch::Satisfies(Predicate::new(f)))
    }

    pub fn matches(&self, instr: &StreamInstruction) -> bool {
        if instr.opcode.canonical() != self.opcode.canonical() {
            return false;
        }

        let implicit = instr.opcode.implicit_operand::<Target>();
        let operand = implicit.as_ref().unwrap_or(&instr.operand);

        match &self.operand {
            OperandMatch::Any => match self.opcode.implicit_operand::<Target>() {
                Some(expected) => expected == *operand,
                None => true,
            },
            OperandMatch::Int32(v) => matches!(operand, Operand::Int32(o) if o == v),
            OperandMatch::String(s) => matches!(operand, Operand::String(o) if o == s),
            OperandMatch::Local(i) => matches!(operand, Operand::Local(o) if o == i),
            OperandMatch::Arg(i) => matches!(operand, Operand::Arg(o) if o == i),
            OperandMatch::Type(t) => matches!(operand, Operand::Type(o) if o == t),
            OperandMatch::Field(query) => {
                matches!(operand, Operand::Field(member) if query.matches(member))
            }
            OperandMatch::Method(query) => {
                matches!(operand, Operand::Method(member) if query.matches(member))
            }
            OperandMatch::Resolved(expected) => operand.member() == Some(expected),
            OperandMatch::Satisfies(predicate) => predicate.test(operand),
        }
    }

    /// Resolve symbolic member queries against `ctx`.
    ///
    /// Fails with NotFound when the member does not exist. Queries with a
    /// parameter list become exact [`OperandMatch::Resolved`] matches; without
    /// one, any overload of the resolved member matches.
    pub fn bind(&self, ctx: &SymbolContext<'_>) -> Result<InstrPattern> {
        let operand = match &self.operand {
            OperandMatch::Field(query) => {
                OperandMatch::Resolved(ctx.resolve_field(query)?)
            }
            OperandMatch::Method(query) => {
                let member = ctx.resolve_method(query)?;
                if query.params.is_some() {
                    OperandMatch::Resolved(member)
                } else {
                    OperandMatch::Method(query.clone().in_scope(member.scope))
                }
            }
            other => other.clone(),
        };
        Ok(Self::new(self.opcode, operand))
    }
}

/// First position at or after `from` where `patterns` match consecutively.
pub fn find_pattern(
    stream: &InstructionStream,
    from: usize,
    patterns: &[InstrPattern],
) -> Option<usize> {
    if patterns.is_empty() || stream.len() < patterns.len() {
        return None;
    }
    let last_start = stream.len() - patterns.len();
    (from..=last_start).find(|&start| {
        patterns.iter().enumerate().all(|(offset, pattern)| {
            stream
                .get(start + offset)
                .is_some_and(|instr| pattern.matches(instr))
        })
    })
}

/// Parse a `;`-separated pattern list.
pub fn parse_patterns(text: &str) -> Result<Vec<InstrPattern>> {
    let patterns = split_outside_quotes(text, ';')
        .into_iter()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect::<Result<Vec<InstrPattern>>>()?;
    if patterns.is_empty() {
        return Err(Error::InvalidPatch("Pattern is empty".to_string()));
    }
    Ok(patterns)
}

pub fn format_patterns(patterns: &[InstrPattern]) -> String {
    patterns
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn split_outside_quotes(text: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            c if c == separator && !quoted => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

impl FromStr for InstrPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (mnemonic, rest) = s.split_once(char::is_whitespace).unwrap_or((s, ""));
        let opcode: OpCode = mnemonic
            .parse()
            .map_err(|_| Error::InvalidPatch(format!("Unknown opcode '{}'", mnemonic)))?;

        let rest = rest.trim();
        if rest.is_empty() || rest == "?" {
            return Ok(Self::op(opcode));
        }

        let invalid = |what: &str| {
            Error::InvalidPatch(format!("Invalid {} operand '{}' for {}", what, rest, opcode))
        };
        let operand = match opcode.operand_kind() {
            OperandKind::Int32 => OperandMatch::Int32(rest.parse().map_err(|_| invalid("int32"))?),
            OperandKind::String => OperandMatch::String(
                serde_json::from_str::<String>(rest).map_err(|_| invalid("string"))?,
            ),
            OperandKind::Local => OperandMatch::Local(
                rest.trim_start_matches("V_")
                    .parse()
                    .map_err(|_| invalid("local"))?,
            ),
            OperandKind::Arg => OperandMatch::Arg(
                rest.trim_start_matches("A_")
                    .parse()
                    .map_err(|_| invalid("argument"))?,
            ),
            OperandKind::Type => OperandMatch::Type(rest.to_string()),
            OperandKind::Field => OperandMatch::Field(rest.parse()?),
            OperandKind::Method => OperandMatch::Method(rest.parse()?),
            _ => {
                return Err(Error::InvalidPatch(format!(
                    "{} operands cannot be matched by value, use '?'",
                    opcode
                )));
            }
        };
        Ok(Self::new(opcode, operand))
    }
}

impl fmt::Display for InstrPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.operand {
            OperandMatch::Any
                if self.opcode.operand_kind() == OperandKind::None
                    || self.opcode.implicit_operand::<Target>().is_some() =>
            {
                write!(f, "{}", self.opcode)
            }
            OperandMatch::Any => write!(f, "{} ?", self.opcode),
            OperandMatch::Int32(v) => write!(f, "{} {}", self.opcode, v),
            OperandMatch::String(s) => {
                write!(f, "{} ", self.opcode)?;
                write_quoted(f, s)
            }
            OperandMatch::Local(i) => write!(f, "{} V_{}", self.opcode, i),
            OperandMatch::Arg(i) => write!(f, "{} A_{}", self.opcode, i),
            OperandMatch::Type(t) => write!(f, "{} {}", self.opcode, t),
            OperandMatch::Field(q) | OperandMatch::Method(q) => write!(f, "{} {}", self.opcode, q),
            OperandMatch::Resolved(m) => write!(f, "{} {}", self.opcode, m),
            OperandMatch::Satisfies(_) => write!(f, "{} <predicate>", self.opcode),
        }
    }
}
