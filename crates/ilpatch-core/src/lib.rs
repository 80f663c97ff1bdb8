//! # ilpatch-core
//!
//! Core library for patching method bodies of managed modules.
//!
//! This crate provides:
//! - A module model with a binary image format
//! - Editable instruction streams with stable handles and labels
//! - A structural cursor that seeks by instruction patterns
//! - Declarative patch scripts and their executor
//! - Lazy dependency resolution and a backup-then-replace writer

pub mod error;
pub mod module;
pub mod patch;
pub mod pipeline;
pub mod resolve;
pub mod stream;
pub mod writer;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use module::{
    Instruction, MemberRef, MethodBody, MethodDef, Module, OpCode, Operand, Signature, TypeDef,
    read_module, write_module_bytes,
};
pub use patch::{
    InstrTemplate, MethodTarget, PatchExecutor, PatchOp, PatchOutcome, PatchScript, PatchSet,
    apply_script, builtin_patches, load_patch_set, save_patch_set,
};
pub use pipeline::{DefaultLocation, PatchReport, Patcher, PatcherConfig, resolve_install_dir};
pub use resolve::{
    DirectoryResolver, LoadedModule, StaticResolver, SymbolQuery, SymbolResolver, load_module,
};
pub use stream::{Cursor, InstrPattern, InstructionStream, MoveType, OperandMatch};
pub use writer::{CommitReport, backup_path, write_module};
