//! Editable instruction stream.
//!
//! Instructions live in an arena and are addressed by stable [`InstrId`]
//! handles; a separate order vector gives their logical position. Branch
//! operands and exception handler boundaries hold handles (or [`Label`]s),
//! never positions, so inserting or removing instructions can only break a
//! reference by deleting its target, which [`InstructionStream::remove_range`]
//! refuses to do.

mod cursor;
mod matcher;

use std::collections::HashSet;
use std::fmt;

use crate::error::{Error, Result};
use crate::module::{ExceptionHandler, Instruction, LocalVariable, MethodBody, Operand};

pub use cursor::{Cursor, MoveType, Span};
pub use matcher::{
    InstrPattern, OperandMatch, Predicate, find_pattern, format_patterns, parse_patterns,
};

/// Stable handle of an instruction inside one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(u32);

/// Deferred branch target, bound to an instruction once marked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Instr(InstrId),
    Label(Label),
}

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "label_{}", self.0)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Instr(id) => write!(f, "{}", id),
            Target::Label(label) => write!(f, "{}", label),
        }
    }
}

pub type StreamInstruction = Instruction<Target>;

#[derive(Debug, Clone, Default)]
pub struct InstructionStream {
    arena: Vec<Option<StreamInstruction>>,
    order: Vec<InstrId>,
    labels: Vec<Option<InstrId>>,
    locals: Vec<LocalVariable>,
    handlers: Vec<ExceptionHandler<InstrId>>,
}

impl InstructionStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a stored body, turning instruction indices into handles.
    pub fn from_body(body: &MethodBody) -> Result<Self> {
        let count = body.instructions.len();
        let to_id = |index: u32| -> Result<InstrId> {
            if (index as usize) < count {
                Ok(InstrId(index))
            } else {
                Err(Error::corruption(format!(
                    "target index {} is outside the body ({} instructions)",
                    index, count
                )))
            }
        };

        let mut arena = Vec::with_capacity(count);
        for instr in &body.instructions {
            let operand = instr
                .operand
                .clone()
                .try_map_targets(|index| to_id(index).map(Target::Instr))?;
            arena.push(Some(Instruction::new(instr.opcode, operand)));
        }

        let handlers = body
            .handlers
            .iter()
            .cloned()
            .map(|h| h.try_map(to_id))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            arena,
            order: (0..count as u32).map(InstrId).collect(),
            labels: Vec::new(),
            locals: body.locals.clone(),
            handlers,
        })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn id_at(&self, index: usize) -> Option<InstrId> {
        self.order.get(index).copied()
    }

    pub fn get(&self, index: usize) -> Option<&StreamInstruction> {
        self.id_at(index).and_then(|id| self.instruction(id))
    }

    /// Instruction behind a handle, `None` once it has been removed.
    pub fn instruction(&self, id: InstrId) -> Option<&StreamInstruction> {
        self.arena.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub fn is_live(&self, id: InstrId) -> bool {
        self.instruction(id).is_some()
    }

    pub fn position_of(&self, id: InstrId) -> Option<usize> {
        self.order.iter().position(|&other| other == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (InstrId, &StreamInstruction)> {
        self.order
            .iter()
            .filter_map(|&id| self.instruction(id).map(|instr| (id, instr)))
    }

    pub fn locals(&self) -> &[LocalVariable] {
        &self.locals
    }

    pub fn handlers(&self) -> &[ExceptionHandler<InstrId>] {
        &self.handlers
    }

    /// Append a local slot and return its index.
    pub fn add_local(&mut self, local: LocalVariable) -> Result<u16> {
        let index = u16::try_from(self.locals.len())
            .map_err(|_| Error::InvalidPatch("too many local variables".to_string()))?;
        self.locals.push(local);
        Ok(index)
    }

    pub fn find_local(&self, name: &str) -> Option<u16> {
        self.locals
            .iter()
            .position(|l| l.name.as_deref() == Some(name))
            .map(|index| index as u16)
    }

    pub fn define_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(None);
        label
    }

    pub fn bind_label(&mut self, label: Label, id: InstrId) -> Result<()> {
        if !self.is_live(id) {
            return Err(Error::corruption(format!(
                "cannot bind {} to removed instruction {}",
                label, id
            )));
        }
        let slot = self.label_slot(label)?;
        *slot = Some(id);
        Ok(())
    }

    pub(crate) fn unbind_label(&mut self, label: Label) -> Result<()> {
        *self.label_slot(label)? = None;
        Ok(())
    }

    pub fn label_target(&self, label: Label) -> Option<InstrId> {
        self.labels.get(label.0 as usize).copied().flatten()
    }

    fn label_slot(&mut self, label: Label) -> Result<&mut Option<InstrId>> {
        self.labels
            .get_mut(label.0 as usize)
            .ok_or_else(|| Error::corruption(format!("{} was never defined", label)))
    }

    /// Whether any live instruction branches to `label`.
    pub fn is_label_referenced(&self, label: Label) -> bool {
        self.iter().any(|(_, instr)| {
            instr
                .operand
                .targets()
                .iter()
                .any(|t| *t == Target::Label(label))
        })
    }

    fn resolve_target(&self, target: Target) -> Option<InstrId> {
        match target {
            Target::Instr(id) => Some(id),
            Target::Label(label) => self.label_target(label),
        }
    }

    fn check_targets(&self, instr: &StreamInstruction) -> Result<()> {
        for target in instr.operand.targets() {
            match *target {
                Target::Instr(id) if !self.is_live(id) => {
                    return Err(Error::corruption(format!(
                        "{} targets removed instruction {}",
                        instr.opcode, id
                    )));
                }
                Target::Label(label) if label.0 as usize >= self.labels.len() => {
                    return Err(Error::corruption(format!(
                        "{} targets undefined {}",
                        instr.opcode, label
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Splice `instrs` so that the first one ends up at `index`.
    pub fn insert(&mut self, index: usize, instrs: Vec<StreamInstruction>) -> Result<Vec<InstrId>> {
        if index > self.len() {
            return Err(Error::corruption(format!(
                "insert position {} is past the end of the stream ({} instructions)",
                index,
                self.len()
            )));
        }
        for instr in &instrs {
            if !instr.opcode.accepts(&instr.operand) {
                return Err(Error::InvalidPatch(format!(
                    "operand {:?} does not fit opcode {}",
                    instr.operand, instr.opcode
                )));
            }
            self.check_targets(instr)?;
        }

        let ids: Vec<InstrId> = instrs
            .into_iter()
            .map(|instr| {
                let id = InstrId(self.arena.len() as u32);
                self.arena.push(Some(instr));
                id
            })
            .collect();
        self.order.splice(index..index, ids.iter().copied());
        Ok(ids)
    }

    /// Remove `count` instructions starting at `index`.
    ///
    /// Fails without modifying the stream if the range runs past the end, or
    /// if a removed instruction is still targeted by a live instruction (directly
    /// or through a label) or bounds an exception handler. Labels bound to
    /// removed, unreferenced instructions become unbound.
    pub fn remove_range(&mut self, index: usize, count: usize) -> Result<Vec<StreamInstruction>> {
        let end = index.checked_add(count).filter(|&end| end <= self.len());
        let Some(end) = end else {
            return Err(Error::corruption(format!(
                "cannot remove {} instructions at {}: only {} remain",
                count,
                index,
                self.len().saturating_sub(index)
            )));
        };

        let removed: HashSet<InstrId> = self.order[index..end].iter().copied().collect();

        for (position, &id) in self.order.iter().enumerate() {
            if removed.contains(&id) {
                continue;
            }
            let Some(instr) = self.instruction(id) else {
                continue;
            };
            for target in instr.operand.targets() {
                if let Some(target_id) = self.resolve_target(*target)
                    && removed.contains(&target_id)
                {
                    return Err(Error::corruption(format!(
                        "cannot remove {} at {}: still targeted by {} at {}",
                        self.describe(target_id),
                        self.position_of(target_id).unwrap_or_default(),
                        instr,
                        position
                    )));
                }
            }
        }

        for handler in &self.handlers {
            if let Some(id) = handler.boundaries().find(|id| removed.contains(*id)) {
                return Err(Error::corruption(format!(
                    "cannot remove {}: it bounds a {:?} exception handler",
                    self.describe(*id),
                    handler.kind
                )));
            }
        }

        for slot in self.labels.iter_mut() {
            if slot.is_some_and(|id| removed.contains(&id)) {
                *slot = None;
            }
        }

        let ids: Vec<InstrId> = self.order.drain(index..end).collect();
        Ok(ids
            .into_iter()
            .filter_map(|id| self.arena[id.0 as usize].take())
            .collect())
    }

    fn describe(&self, id: InstrId) -> String {
        match self.instruction(id) {
            Some(instr) => format!("{} ({})", instr, id),
            None => id.to_string(),
        }
    }

    /// Check that every branch target and label reference resolves to a live
    /// instruction of this stream.
    pub fn validate(&self) -> Result<()> {
        for (position, (_, instr)) in self.iter().enumerate() {
            for target in instr.operand.targets() {
                match self.resolve_target(*target) {
                    Some(id) if self.is_live(id) => {}
                    Some(id) => {
                        return Err(Error::corruption(format!(
                            "{} at {} targets removed instruction {}",
                            instr, position, id
                        )));
                    }
                    None => {
                        return Err(Error::corruption(format!(
                            "{} at {} references a label that was never marked",
                            instr, position
                        )));
                    }
                }
            }
        }
        for handler in &self.handlers {
            if let Some(id) = handler.boundaries().find(|id| !self.is_live(**id)) {
                return Err(Error::corruption(format!(
                    "exception handler boundary {} was removed",
                    id
                )));
            }
        }
        Ok(())
    }

    /// Lower the stream back into a stored body.
    pub fn into_body(self, max_stack: u16) -> Result<MethodBody> {
        self.validate()?;

        let mut positions = vec![u32::MAX; self.arena.len()];
        for (index, id) in self.order.iter().enumerate() {
            positions[id.0 as usize] = index as u32;
        }
        let labels = &self.labels;
        let index_of = |id: InstrId| -> Result<u32> {
            match positions[id.0 as usize] {
                u32::MAX => Err(Error::corruption(format!("{} is not in the stream", id))),
                index => Ok(index),
            }
        };
        let lower = |target: Target| -> Result<u32> {
            let id = match target {
                Target::Instr(id) => id,
                Target::Label(label) => labels
                    .get(label.0 as usize)
                    .copied()
                    .flatten()
                    .ok_or_else(|| Error::corruption(format!("{} was never marked", label)))?,
            };
            index_of(id)
        };

        let mut arena = self.arena;
        let mut instructions = Vec::with_capacity(self.order.len());
        for id in &self.order {
            let instr = arena[id.0 as usize]
                .take()
                .ok_or_else(|| Error::corruption(format!("{} is not in the stream", id)))?;
            instructions.push(Instruction::new(
                instr.opcode,
                instr.operand.try_map_targets(lower)?,
            ));
        }

        let handlers = self
            .handlers
            .into_iter()
            .map(|h| h.try_map(index_of))
            .collect::<Result<Vec<_>>>()?;

        Ok(MethodBody {
            max_stack,
            locals: self.locals,
            instructions,
            handlers,
        })
    }
}

/// IL-style listing, one instruction per line with resolved positions.
impl fmt::Display for InstructionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label_of = |target: &Target| -> String {
            match self.resolve_target(*target).and_then(|id| self.position_of(id)) {
                Some(position) => format!("IL_{:04}", position),
                None => target.to_string(),
            }
        };
        for (position, (_, instr)) in self.iter().enumerate() {
            write!(f, "IL_{:04}: {}", position, instr.opcode)?;
            match &instr.operand {
                Operand::None => {}
                Operand::Branch(target) => write!(f, " {}", label_of(target))?,
                Operand::Switch(targets) => {
                    let parts: Vec<String> = targets.iter().map(label_of).collect();
                    write!(f, " ({})", parts.join(", "))?;
                }
                operand => write!(f, " {}", operand)?,
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{HandlerKind, OpCode};

    fn ldc(value: i32) -> Instruction {
        Instruction::new(OpCode::LdcI4, Operand::Int32(value))
    }

    /// `[A, B, C, D, ret]` where every letter is an `ldc.i4` with a distinct value.
    fn abcd_body() -> MethodBody {
        MethodBody::new(vec![ldc(0xA), ldc(0xB), ldc(0xC), ldc(0xD), Instruction::simple(OpCode::Ret)])
    }

    fn values(stream: &InstructionStream) -> Vec<i32> {
        stream
            .iter()
            .filter_map(|(_, instr)| match instr.operand {
                Operand::Int32(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    fn sldc(value: i32) -> StreamInstruction {
        Instruction::new(OpCode::LdcI4, Operand::Int32(value))
    }

    #[test]
    fn test_body_roundtrip_preserves_targets() {
        let mut body = MethodBody::new(vec![
            ldc(1),
            Instruction::new(OpCode::BrtrueS, Operand::Branch(3)),
            Instruction::new(OpCode::Switch, Operand::Switch(vec![0, 3])),
            Instruction::simple(OpCode::Ret),
        ]);
        body.handlers.push(ExceptionHandler {
            kind: HandlerKind::Finally,
            try_start: 0,
            try_end: Some(2),
            handler_start: 2,
            handler_end: None,
            catch_type: None,
        });

        let stream = InstructionStream::from_body(&body).unwrap();
        assert_eq!(stream.len(), 4);
        let lowered = stream.into_body(body.max_stack).unwrap();
        assert_eq!(lowered, body);
    }

    #[test]
    fn test_from_body_rejects_out_of_range_target() {
        let body = MethodBody::new(vec![Instruction::new(OpCode::Br, Operand::Branch(5))]);
        let err = InstructionStream::from_body(&body).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_insert_shifts_following_instructions_and_keeps_targets() {
        let body = MethodBody::new(vec![
            Instruction::new(OpCode::BrS, Operand::Branch(2)),
            ldc(1),
            Instruction::simple(OpCode::Ret),
        ]);
        let mut stream = InstructionStream::from_body(&body).unwrap();
        stream.insert(1, vec![sldc(7), sldc(8)]).unwrap();

        let lowered = stream.into_body(8).unwrap();
        assert_eq!(lowered.instructions.len(), 5);
        // Branch still lands on `ret`, now at index 4.
        assert_eq!(lowered.instructions[0].operand, Operand::Branch(4));
    }

    #[test]
    fn test_insert_past_end_fails() {
        let mut stream = InstructionStream::from_body(&abcd_body()).unwrap();
        let err = stream.insert(9, vec![sldc(1)]).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_insert_rejects_mismatched_operand() {
        let mut stream = InstructionStream::from_body(&abcd_body()).unwrap();
        let bad = Instruction::new(OpCode::Ldstr, Operand::Int32(3));
        let err = stream.insert(0, vec![bad]).unwrap_err();
        assert!(matches!(err, Error::InvalidPatch(_)));
        assert_eq!(stream.len(), 5);
    }

    #[test]
    fn test_remove_then_insert_replaces_span() {
        let mut stream = InstructionStream::from_body(&abcd_body()).unwrap();
        let removed = stream.remove_range(1, 2).unwrap();
        assert_eq!(removed.len(), 2);
        stream.insert(1, vec![sldc(0x58), sldc(0x59)]).unwrap();
        assert_eq!(values(&stream), vec![0xA, 0x58, 0x59, 0xD]);
    }

    #[test]
    fn test_remove_branch_target_is_corruption() {
        let body = MethodBody::new(vec![
            Instruction::new(OpCode::BrS, Operand::Branch(2)),
            ldc(0xB),
            ldc(0xC),
            Instruction::simple(OpCode::Ret),
        ]);
        let mut stream = InstructionStream::from_body(&body).unwrap();
        let err = stream.remove_range(1, 2).unwrap_err();
        assert!(err.is_corruption());
        assert!(err.to_string().contains("still targeted by br.s"));
        // Nothing was removed.
        assert_eq!(stream.len(), 4);
    }

    #[test]
    fn test_remove_branch_together_with_its_target() {
        let body = MethodBody::new(vec![
            ldc(0xA),
            Instruction::new(OpCode::BrS, Operand::Branch(2)),
            ldc(0xC),
            Instruction::simple(OpCode::Ret),
        ]);
        let mut stream = InstructionStream::from_body(&body).unwrap();
        stream.remove_range(1, 2).unwrap();
        assert_eq!(values(&stream), vec![0xA]);
        stream.validate().unwrap();
    }

    #[test]
    fn test_remove_past_end_fails() {
        let mut stream = InstructionStream::from_body(&abcd_body()).unwrap();
        let err = stream.remove_range(3, 5).unwrap_err();
        assert!(err.to_string().contains("only 2 remain"));
        assert_eq!(stream.len(), 5);
    }

    #[test]
    fn test_remove_handler_boundary_is_corruption() {
        let mut body = abcd_body();
        body.handlers.push(ExceptionHandler {
            kind: HandlerKind::Catch,
            try_start: 0,
            try_end: Some(1),
            handler_start: 1,
            handler_end: Some(2),
            catch_type: Some("System.Exception".to_string()),
        });
        let mut stream = InstructionStream::from_body(&body).unwrap();
        assert!(stream.remove_range(1, 1).unwrap_err().is_corruption());
        stream.remove_range(3, 1).unwrap();
    }

    #[test]
    fn test_label_bound_to_removed_target_is_protected() {
        let mut stream = InstructionStream::from_body(&abcd_body()).unwrap();
        let label = stream.define_label();
        let target = stream.id_at(2).unwrap();
        stream.bind_label(label, target).unwrap();
        stream
            .insert(0, vec![Instruction::new(OpCode::Br, Operand::Branch(Target::Label(label)))])
            .unwrap();

        let err = stream.remove_range(3, 1).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_unreferenced_label_is_unbound_on_removal() {
        let mut stream = InstructionStream::from_body(&abcd_body()).unwrap();
        let label = stream.define_label();
        stream.bind_label(label, stream.id_at(1).unwrap()).unwrap();
        stream.remove_range(1, 1).unwrap();
        assert_eq!(stream.label_target(label), None);
    }

    #[test]
    fn test_unmarked_label_fails_lowering() {
        let mut stream = InstructionStream::from_body(&abcd_body()).unwrap();
        let label = stream.define_label();
        stream
            .insert(0, vec![Instruction::new(OpCode::BrtrueS, Operand::Branch(Target::Label(label)))])
            .unwrap();
        assert!(stream.is_label_referenced(label));

        let err = stream.into_body(8).unwrap_err();
        assert!(err.is_corruption());
        assert!(err.to_string().contains("never marked"));
    }

    #[test]
    fn test_insert_with_undefined_label_fails() {
        let mut stream = InstructionStream::from_body(&abcd_body()).unwrap();
        let mut other = InstructionStream::new();
        let foreign = other.define_label();
        let err = stream
            .insert(0, vec![Instruction::new(OpCode::Br, Operand::Branch(Target::Label(foreign)))])
            .unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_locals() {
        let mut stream = InstructionStream::new();
        let first = stream.add_local(LocalVariable::new("System.Int32")).unwrap();
        let second = stream
            .add_local(LocalVariable::named("logger", "System.Object"))
            .unwrap();
        assert_eq!((first, second), (0, 1));
        assert_eq!(stream.find_local("logger"), Some(1));
        assert_eq!(stream.find_local("missing"), None);
    }

    #[test]
    fn test_listing_shows_resolved_positions() {
        let body = MethodBody::new(vec![
            Instruction::new(OpCode::BrS, Operand::Branch(2)),
            Instruction::new(OpCode::Ldstr, Operand::String("x".into())),
            Instruction::simple(OpCode::Ret),
        ]);
        let stream = InstructionStream::from_body(&body).unwrap();
        let listing = stream.to_string();
        assert_eq!(
            listing,
            "IL_0000: br.s IL_0002\nIL_0001: ldstr \"x\"\nIL_0002: ret\n"
        );
    }
}
