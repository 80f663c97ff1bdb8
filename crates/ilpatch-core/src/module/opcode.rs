//! Opcode table.
//!
//! Every opcode carries its mnemonic (used for display, parsing and the JSON
//! patch format), a numeric code (used by the binary module format), and the
//! kind of operand it takes. Short and implicit-operand forms (`ldloc.3`,
//! `brtrue.s`, `ldc.i4.1`) can be folded into their canonical long form so
//! that patterns match either encoding.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use strum::{Display, EnumIter, EnumString, FromRepr, IntoStaticStr};

use super::instruction::Operand;

/// What an opcode expects as its operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    Int32,
    Int64,
    Float64,
    String,
    Local,
    Arg,
    Branch,
    Switch,
    Field,
    Method,
    Type,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, EnumIter, FromRepr,
)]
#[repr(u16)]
pub enum OpCode {
    #[strum(to_string = "nop")]
    Nop = 0x00,
    #[strum(to_string = "ldarg.0")]
    Ldarg0 = 0x02,
    #[strum(to_string = "ldarg.1")]
    Ldarg1 = 0x03,
    #[strum(to_string = "ldarg.2")]
    Ldarg2 = 0x04,
    #[strum(to_string = "ldarg.3")]
    Ldarg3 = 0x05,
    #[strum(to_string = "ldloc.0")]
    Ldloc0 = 0x06,
    #[strum(to_string = "ldloc.1")]
    Ldloc1 = 0x07,
    #[strum(to_string = "ldloc.2")]
    Ldloc2 = 0x08,
    #[strum(to_string = "ldloc.3")]
    Ldloc3 = 0x09,
    #[strum(to_string = "stloc.0")]
    Stloc0 = 0x0A,
    #[strum(to_string = "stloc.1")]
    Stloc1 = 0x0B,
    #[strum(to_string = "stloc.2")]
    Stloc2 = 0x0C,
    #[strum(to_string = "stloc.3")]
    Stloc3 = 0x0D,
    #[strum(to_string = "ldarg.s")]
    LdargS = 0x0E,
    #[strum(to_string = "starg.s")]
    StargS = 0x10,
    #[strum(to_string = "ldloc.s")]
    LdlocS = 0x11,
    #[strum(to_string = "ldloca.s")]
    LdlocaS = 0x12,
    #[strum(to_string = "stloc.s")]
    StlocS = 0x13,
    #[strum(to_string = "ldnull")]
    Ldnull = 0x14,
    #[strum(to_string = "ldc.i4.m1")]
    LdcI4M1 = 0x15,
    #[strum(to_string = "ldc.i4.0")]
    LdcI40 = 0x16,
    #[strum(to_string = "ldc.i4.1")]
    LdcI41 = 0x17,
    #[strum(to_string = "ldc.i4.2")]
    LdcI42 = 0x18,
    #[strum(to_string = "ldc.i4.3")]
    LdcI43 = 0x19,
    #[strum(to_string = "ldc.i4.4")]
    LdcI44 = 0x1A,
    #[strum(to_string = "ldc.i4.5")]
    LdcI45 = 0x1B,
    #[strum(to_string = "ldc.i4.6")]
    LdcI46 = 0x1C,
    #[strum(to_string = "ldc.i4.7")]
    LdcI47 = 0x1D,
    #[strum(to_string = "ldc.i4.8")]
    LdcI48 = 0x1E,
    #[strum(to_string = "ldc.i4.s")]
    LdcI4S = 0x1F,
    #[strum(to_string = "ldc.i4")]
    LdcI4 = 0x20,
    #[strum(to_string = "ldc.i8")]
    LdcI8 = 0x21,
    #[strum(to_string = "ldc.r8")]
    LdcR8 = 0x23,
    #[strum(to_string = "dup")]
    Dup = 0x25,
    #[strum(to_string = "pop")]
    Pop = 0x26,
    #[strum(to_string = "call")]
    Call = 0x28,
    #[strum(to_string = "ret")]
    Ret = 0x2A,
    #[strum(to_string = "br.s")]
    BrS = 0x2B,
    #[strum(to_string = "brfalse.s")]
    BrfalseS = 0x2C,
    #[strum(to_string = "brtrue.s")]
    BrtrueS = 0x2D,
    #[strum(to_string = "beq.s")]
    BeqS = 0x2E,
    #[strum(to_string = "bge.s")]
    BgeS = 0x2F,
    #[strum(to_string = "bgt.s")]
    BgtS = 0x30,
    #[strum(to_string = "ble.s")]
    BleS = 0x31,
    #[strum(to_string = "blt.s")]
    BltS = 0x32,
    #[strum(to_string = "bne.un.s")]
    BneUnS = 0x33,
    #[strum(to_string = "br")]
    Br = 0x38,
    #[strum(to_string = "brfalse")]
    Brfalse = 0x39,
    #[strum(to_string = "brtrue")]
    Brtrue = 0x3A,
    #[strum(to_string = "beq")]
    Beq = 0x3B,
    #[strum(to_string = "bge")]
    Bge = 0x3C,
    #[strum(to_string = "bgt")]
    Bgt = 0x3D,
    #[strum(to_string = "ble")]
    Ble = 0x3E,
    #[strum(to_string = "blt")]
    Blt = 0x3F,
    #[strum(to_string = "bne.un")]
    BneUn = 0x40,
    #[strum(to_string = "switch")]
    Switch = 0x45,
    #[strum(to_string = "add")]
    Add = 0x58,
    #[strum(to_string = "sub")]
    Sub = 0x59,
    #[strum(to_string = "mul")]
    Mul = 0x5A,
    #[strum(to_string = "div")]
    Div = 0x5B,
    #[strum(to_string = "rem")]
    Rem = 0x5D,
    #[strum(to_string = "and")]
    And = 0x5F,
    #[strum(to_string = "or")]
    Or = 0x60,
    #[strum(to_string = "xor")]
    Xor = 0x61,
    #[strum(to_string = "neg")]
    Neg = 0x65,
    #[strum(to_string = "not")]
    Not = 0x66,
    #[strum(to_string = "conv.i4")]
    ConvI4 = 0x69,
    #[strum(to_string = "conv.i8")]
    ConvI8 = 0x6A,
    #[strum(to_string = "callvirt")]
    Callvirt = 0x6F,
    #[strum(to_string = "ldstr")]
    Ldstr = 0x72,
    #[strum(to_string = "newobj")]
    Newobj = 0x73,
    #[strum(to_string = "castclass")]
    Castclass = 0x74,
    #[strum(to_string = "isinst")]
    Isinst = 0x75,
    #[strum(to_string = "throw")]
    Throw = 0x7A,
    #[strum(to_string = "ldfld")]
    Ldfld = 0x7B,
    #[strum(to_string = "ldflda")]
    Ldflda = 0x7C,
    #[strum(to_string = "stfld")]
    Stfld = 0x7D,
    #[strum(to_string = "ldsfld")]
    Ldsfld = 0x7E,
    #[strum(to_string = "stsfld")]
    Stsfld = 0x80,
    #[strum(to_string = "box")]
    Box = 0x8C,
    #[strum(to_string = "newarr")]
    Newarr = 0x8D,
    #[strum(to_string = "ldlen")]
    Ldlen = 0x8E,
    #[strum(to_string = "ldelem.ref")]
    LdelemRef = 0x9A,
    #[strum(to_string = "stelem.ref")]
    StelemRef = 0xA2,
    #[strum(to_string = "endfinally")]
    Endfinally = 0xDC,
    #[strum(to_string = "leave")]
    Leave = 0xDD,
    #[strum(to_string = "leave.s")]
    LeaveS = 0xDE,
    #[strum(to_string = "ceq")]
    Ceq = 0xFE01,
    #[strum(to_string = "cgt")]
    Cgt = 0xFE02,
    #[strum(to_string = "clt")]
    Clt = 0xFE04,
    #[strum(to_string = "ldarg")]
    Ldarg = 0xFE09,
    #[strum(to_string = "starg")]
    Starg = 0xFE0B,
    #[strum(to_string = "ldloc")]
    Ldloc = 0xFE0C,
    #[strum(to_string = "ldloca")]
    Ldloca = 0xFE0D,
    #[strum(to_string = "stloc")]
    Stloc = 0xFE0E,
}

impl OpCode {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn mnemonic(self) -> &'static str {
        self.into()
    }

    pub fn operand_kind(self) -> OperandKind {
        use OpCode::*;
        match self {
            LdcI4S | LdcI4 => OperandKind::Int32,
            LdcI8 => OperandKind::Int64,
            LdcR8 => OperandKind::Float64,
            Ldstr => OperandKind::String,
            LdlocS | LdlocaS | StlocS | Ldloc | Ldloca | Stloc => OperandKind::Local,
            LdargS | StargS | Ldarg | Starg => OperandKind::Arg,
            BrS | BrfalseS | BrtrueS | BeqS | BgeS | BgtS | BleS | BltS | BneUnS | Br
            | Brfalse | Brtrue | Beq | Bge | Bgt | Ble | Blt | BneUn | Leave | LeaveS => {
                OperandKind::Branch
            }
            Switch => OperandKind::Switch,
            Ldfld | Ldflda | Stfld | Ldsfld | Stsfld => OperandKind::Field,
            Call | Callvirt | Newobj => OperandKind::Method,
            Castclass | Isinst | Box | Newarr => OperandKind::Type,
            _ => OperandKind::None,
        }
    }

    /// Long form of this opcode, folding short and implicit-operand encodings.
    pub fn canonical(self) -> OpCode {
        use OpCode::*;
        match self {
            Ldarg0 | Ldarg1 | Ldarg2 | Ldarg3 | LdargS => Ldarg,
            StargS => Starg,
            Ldloc0 | Ldloc1 | Ldloc2 | Ldloc3 | LdlocS => Ldloc,
            LdlocaS => Ldloca,
            Stloc0 | Stloc1 | Stloc2 | Stloc3 | StlocS => Stloc,
            LdcI4M1 | LdcI40 | LdcI41 | LdcI42 | LdcI43 | LdcI44 | LdcI45 | LdcI46 | LdcI47
            | LdcI48 | LdcI4S => LdcI4,
            BrS => Br,
            BrfalseS => Brfalse,
            BrtrueS => Brtrue,
            BeqS => Beq,
            BgeS => Bge,
            BgtS => Bgt,
            BleS => Ble,
            BltS => Blt,
            BneUnS => BneUn,
            LeaveS => Leave,
            other => other,
        }
    }

    /// Operand encoded in the opcode itself (`ldloc.2` carries local 2).
    pub fn implicit_operand<T>(self) -> Option<Operand<T>> {
        use OpCode::*;
        let operand = match self {
            Ldarg0 => Operand::Arg(0),
            Ldarg1 => Operand::Arg(1),
            Ldarg2 => Operand::Arg(2),
            Ldarg3 => Operand::Arg(3),
            Ldloc0 | Stloc0 => Operand::Local(0),
            Ldloc1 | Stloc1 => Operand::Local(1),
            Ldloc2 | Stloc2 => Operand::Local(2),
            Ldloc3 | Stloc3 => Operand::Local(3),
            LdcI4M1 => Operand::Int32(-1),
            LdcI40 => Operand::Int32(0),
            LdcI41 => Operand::Int32(1),
            LdcI42 => Operand::Int32(2),
            LdcI43 => Operand::Int32(3),
            LdcI44 => Operand::Int32(4),
            LdcI45 => Operand::Int32(5),
            LdcI46 => Operand::Int32(6),
            LdcI47 => Operand::Int32(7),
            LdcI48 => Operand::Int32(8),
            _ => return None,
        };
        Some(operand)
    }

    /// Check whether `operand` has the shape this opcode expects.
    pub fn accepts<T>(self, operand: &Operand<T>) -> bool {
        if self.implicit_operand::<T>().is_some() {
            return matches!(operand, Operand::None);
        }
        matches!(
            (self.operand_kind(), operand),
            (OperandKind::None, Operand::None)
                | (OperandKind::Int32, Operand::Int32(_))
                | (OperandKind::Int64, Operand::Int64(_))
                | (OperandKind::Float64, Operand::Float64(_))
                | (OperandKind::String, Operand::String(_))
                | (OperandKind::Local, Operand::Local(_))
                | (OperandKind::Arg, Operand::Arg(_))
                | (OperandKind::Branch, Operand::Branch(_))
                | (OperandKind::Switch, Operand::Switch(_))
                | (OperandKind::Field, Operand::Field(_))
                | (OperandKind::Method, Operand::Method(_))
                | (OperandKind::Type, Operand::Type(_))
        )
    }
}

// Mnemonics in human-readable formats (patch files), numeric codes otherwise.
impl Serialize for OpCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(self.mnemonic())
        } else {
            serializer.serialize_u16(self.code())
        }
    }
}

impl<'de> Deserialize<'de> for OpCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            deserializer.deserialize_str(OpCodeVisitor)
        } else {
            deserializer.deserialize_u16(OpCodeVisitor)
        }
    }
}

struct OpCodeVisitor;

impl Visitor<'_> for OpCodeVisitor {
    type Value = OpCode;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an opcode mnemonic or numeric code")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<OpCode, E> {
        OpCode::from_str(value).map_err(|_| E::custom(format!("unknown opcode '{}'", value)))
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<OpCode, E> {
        u16::try_from(value)
            .ok()
            .and_then(OpCode::from_repr)
            .ok_or_else(|| E::custom(format!("unknown opcode code {:#06x}", value)))
    }
}
