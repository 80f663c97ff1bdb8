//! In-memory module model.
//!
//! A [`Module`] holds type definitions with their fields and methods. Method
//! bodies are stored in their serialized shape, with branch targets and
//! exception handler boundaries given as instruction indices. Editing happens
//! on an [`InstructionStream`](crate::stream::InstructionStream) built from a
//! body, never on the stored body directly.

mod format;
mod instruction;
mod opcode;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use format::{FORMAT_VERSION, MAGIC, MODULE_EXTENSION, read_module, write_module_bytes};
pub(crate) use instruction::write_quoted;
pub use instruction::{Instruction, MemberRef, Operand, Signature};
pub use opcode::{OpCode, OperandKind};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub version: String,
    /// Names of the modules this one references.
    pub references: Vec<String>,
    pub types: Vec<TypeDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    /// Dotted full name; nested types are separated with `/`.
    pub full_name: String,
    pub fields: Vec<FieldDef>,
    pub methods: Vec<MethodDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: String,
    pub is_static: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    pub signature: Signature,
    pub is_static: bool,
    pub body: Option<MethodBody>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalVariable {
    pub name: Option<String>,
    pub var_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerKind {
    Catch,
    Filter,
    Finally,
    Fault,
}

/// Protected region. `T` is the boundary representation, `None` ends mean
/// "to the end of the body".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionHandler<T = u32> {
    pub kind: HandlerKind,
    pub try_start: T,
    pub try_end: Option<T>,
    pub handler_start: T,
    pub handler_end: Option<T>,
    pub catch_type: Option<String>,
}

impl<T> ExceptionHandler<T> {
    pub fn try_map<U, E>(
        self,
        mut f: impl FnMut(T) -> std::result::Result<U, E>,
    ) -> std::result::Result<ExceptionHandler<U>, E> {
        Ok(ExceptionHandler {
            kind: self.kind,
            try_start: f(self.try_start)?,
            try_end: self.try_end.map(&mut f).transpose()?,
            handler_start: f(self.handler_start)?,
            handler_end: self.handler_end.map(&mut f).transpose()?,
            catch_type: self.catch_type,
        })
    }

    pub fn boundaries(&self) -> impl Iterator<Item = &T> {
        [
            Some(&self.try_start),
            self.try_end.as_ref(),
            Some(&self.handler_start),
            self.handler_end.as_ref(),
        ]
        .into_iter()
        .flatten()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodBody {
    pub max_stack: u16,
    pub locals: Vec<LocalVariable>,
    pub instructions: Vec<Instruction>,
    pub handlers: Vec<ExceptionHandler>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "1.0.0.0".to_string(),
            ..Default::default()
        }
    }

    pub fn type_position(&self, full_name: &str) -> Result<usize> {
        self.types
            .iter()
            .position(|t| t.full_name == full_name)
            .ok_or_else(|| self.type_not_found(full_name))
    }

    pub fn find_type(&self, full_name: &str) -> Result<&TypeDef> {
        Ok(&self.types[self.type_position(full_name)?])
    }

    pub fn find_type_mut(&mut self, full_name: &str) -> Result<&mut TypeDef> {
        let index = self.type_position(full_name)?;
        Ok(&mut self.types[index])
    }

    fn type_not_found(&self, full_name: &str) -> Error {
        Error::not_found(
            "Type",
            full_name,
            &self.name,
            self.types.iter().map(|t| t.full_name.clone()),
        )
    }

    /// Record that this module references `member`'s defining module.
    ///
    /// Members defined in this module need no reference; returns whether a new
    /// reference entry was added.
    pub fn import_reference(&mut self, member: &MemberRef) -> bool {
        if member.scope == self.name || self.references.contains(&member.scope) {
            return false;
        }
        self.references.push(member.scope.clone());
        true
    }
}

impl TypeDef {
    pub fn new(full_name: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }

    /// Index of a method by name, or by name and exact parameter types.
    ///
    /// Without `params` the first overload wins.
    pub fn method_position(&self, name: &str, params: Option<&[String]>) -> Result<usize> {
        match params {
            None => self
                .methods
                .iter()
                .position(|m| m.name == name)
                .ok_or_else(|| self.method_not_found(name)),
            Some(params) => self
                .methods
                .iter()
                .position(|m| m.name == name && m.signature.params == params)
                .ok_or_else(|| {
                    Error::not_found(
                        "Method",
                        format!("{}({})", name, params.join(", ")),
                        &self.full_name,
                        self.methods
                            .iter()
                            .map(|m| format!("{}({})", m.name, m.signature.params.join(", "))),
                    )
                }),
        }
    }

    pub fn find_method(&self, name: &str) -> Result<&MethodDef> {
        Ok(&self.methods[self.method_position(name, None)?])
    }

    pub fn find_method_mut(&mut self, name: &str) -> Result<&mut MethodDef> {
        let index = self.method_position(name, None)?;
        Ok(&mut self.methods[index])
    }

    pub fn find_overload(&self, name: &str, params: &[String]) -> Result<&MethodDef> {
        Ok(&self.methods[self.method_position(name, Some(params))?])
    }

    fn method_not_found(&self, name: &str) -> Error {
        Error::not_found(
            "Method",
            name,
            &self.full_name,
            self.methods.iter().map(|m| m.name.clone()),
        )
    }

    pub fn find_field(&self, name: &str) -> Result<&FieldDef> {
        self.fields.iter().find(|f| f.name == name).ok_or_else(|| {
            Error::not_found(
                "Field",
                name,
                &self.full_name,
                self.fields.iter().map(|f| f.name.clone()),
            )
        })
    }
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            is_static: false,
        }
    }

    pub fn static_field(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn to_ref(&self, scope: &str, declaring_type: &str) -> MemberRef {
        MemberRef {
            scope: scope.to_string(),
            declaring_type: declaring_type.to_string(),
            name: self.name.clone(),
            signature: Signature::new(Vec::<String>::new(), self.field_type.clone()),
        }
    }
}

impl MethodDef {
    pub fn new(name: impl Into<String>, signature: Signature) -> Self {
        Self {
            name: name.into(),
            signature,
            is_static: false,
            body: None,
        }
    }

    pub fn static_method(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn with_body(mut self, body: MethodBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn to_ref(&self, scope: &str, declaring_type: &str) -> MemberRef {
        MemberRef {
            scope: scope.to_string(),
            declaring_type: declaring_type.to_string(),
            name: self.name.clone(),
            signature: self.signature.clone(),
        }
    }
}

impl LocalVariable {
    pub fn new(var_type: impl Into<String>) -> Self {
        Self {
            name: None,
            var_type: var_type.into(),
        }
    }

    pub fn named(name: impl Into<String>, var_type: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            var_type: var_type.into(),
        }
    }
}

impl MethodBody {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self {
            max_stack: 8,
            instructions,
            ..Default::default()
        }
    }
}
