use std::collections::HashMap;

use tracing::{debug, info};

use super::{InstrTemplate, MethodTarget, PatchOp, PatchScript, TemplateOperand};
use crate::error::{Error, Result};
use crate::module::{Instruction, LocalVariable, MemberRef, Module, OpCode, Operand};
use crate::resolve::{SymbolContext, SymbolQuery, SymbolResolver};
use crate::stream::{
    Cursor, InstrPattern, InstructionStream, Label, Span, StreamInstruction, Target, find_pattern,
};

/// What a successful script run changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchOutcome {
    pub script: String,
    pub target: String,
    /// Members from other modules the new instructions reference.
    pub imports: Vec<MemberRef>,
    /// Module references added to the patched module.
    pub new_references: Vec<String>,
    pub inserted: usize,
    pub removed: usize,
    /// Every anchor the script's seeks matched.
    pub anchors: Vec<Span>,
}

/// Runs patch scripts against instruction streams of one module.
pub struct PatchExecutor<'a> {
    ctx: SymbolContext<'a>,
}

struct ScriptState {
    cursor: Cursor,
    labels: HashMap<String, Label>,
    outcome: PatchOutcome,
}

impl<'a> PatchExecutor<'a> {
    pub fn new(module: &'a Module, resolver: &'a dyn SymbolResolver) -> Self {
        Self {
            ctx: SymbolContext::new(module, resolver),
        }
    }

    /// Run `script` against `stream`.
    ///
    /// The stream is left in an unspecified state on error; callers keep the
    /// original body until this returns `Ok`.
    pub fn execute(
        &self,
        script: &PatchScript,
        stream: &mut InstructionStream,
    ) -> Result<PatchOutcome> {
        let target = script.target.to_string();

        if script.probe.is_empty() {
            if script.ops.iter().any(PatchOp::edits) {
                return Err(Error::InvalidPatch(format!(
                    "script {} edits {} but has no probe",
                    script.name, target
                )));
            }
        } else {
            let probe = self.bind_patterns(&script.probe)?;
            if let Some(position) = find_pattern(stream, 0, &probe) {
                debug!("Probe for {} matched at {}", script.name, position);
                return Err(Error::AlreadyPatched { target });
            }
        }

        let mut state = ScriptState {
            cursor: Cursor::new(),
            labels: HashMap::new(),
            outcome: PatchOutcome {
                script: script.name.clone(),
                target,
                ..Default::default()
            },
        };

        for (step, op) in script.ops.iter().enumerate() {
            debug!("{} step {}: {}", script.name, step, op);
            self.apply(op, stream, &mut state)?;
        }

        let mut names: Vec<(&String, &Label)> = state.labels.iter().collect();
        names.sort_by_key(|(_, label)| **label);
        for (name, label) in names {
            if stream.is_label_referenced(*label) && stream.label_target(*label).is_none() {
                return Err(Error::corruption(format!(
                    "label {} is referenced but was never marked",
                    name
                )));
            }
        }
        stream.validate()?;

        Ok(state.outcome)
    }

    fn apply(
        &self,
        op: &PatchOp,
        stream: &mut InstructionStream,
        state: &mut ScriptState,
    ) -> Result<()> {
        match op {
            PatchOp::Seek { pattern, move_type } => {
                if pattern.is_empty() {
                    return Err(Error::InvalidPatch("seek needs a pattern".to_string()));
                }
                let pattern = self.bind_patterns(pattern)?;
                let span = state.cursor.seek_forward(stream, &pattern, *move_type)?;
                state.outcome.anchors.push(span);
            }
            PatchOp::Remove { count } => {
                let removed = state.cursor.remove(stream, *count)?;
                state.outcome.removed += removed.len();
            }
            PatchOp::Insert { instructions } => {
                let instrs = instructions
                    .iter()
                    .map(|template| self.instantiate(template, stream, state))
                    .collect::<Result<Vec<_>>>()?;
                let ids = state.cursor.emit(stream, instrs)?;
                state.outcome.inserted += ids.len();
            }
            PatchOp::DefineLabel { name } => {
                if state.labels.contains_key(name) {
                    return Err(Error::InvalidPatch(format!(
                        "label {} is defined twice",
                        name
                    )));
                }
                let label = stream.define_label();
                state.labels.insert(name.clone(), label);
            }
            PatchOp::MarkLabel { name } => {
                let label = lookup_label(&state.labels, name)?;
                state.cursor.mark_label(stream, label)?;
            }
            PatchOp::EmitCall {
                symbol,
                virtual_call,
            } => {
                let member = self.resolve_call(symbol)?;
                self.record_import(&member, &mut state.outcome);
                let opcode = if *virtual_call {
                    OpCode::Callvirt
                } else {
                    OpCode::Call
                };
                state
                    .cursor
                    .emit(stream, vec![Instruction::new(opcode, Operand::Method(member))])?;
                state.outcome.inserted += 1;
            }
            PatchOp::DeclareLocal { name, type_name } => {
                if stream.find_local(name).is_some() {
                    return Err(Error::InvalidPatch(format!(
                        "local {} is declared twice",
                        name
                    )));
                }
                let index = stream.add_local(LocalVariable::named(name, type_name))?;
                debug!("Declared local {} ({}) at V_{}", name, type_name, index);
            }
        }
        Ok(())
    }

    fn bind_patterns(&self, patterns: &[InstrPattern]) -> Result<Vec<InstrPattern>> {
        patterns.iter().map(|p| p.bind(&self.ctx)).collect()
    }

    fn resolve_call(&self, symbol: &SymbolQuery) -> Result<MemberRef> {
        self.ctx.resolve_method(symbol).map_err(|e| match e {
            Error::NotFound { .. } => Error::UnresolvedSymbol {
                symbol: symbol.to_string(),
                reason: e.to_string(),
            },
            other => other,
        })
    }

    fn record_import(&self, member: &MemberRef, outcome: &mut PatchOutcome) {
        if member.scope != self.ctx.module().name && !outcome.imports.contains(member) {
            outcome.imports.push(member.clone());
        }
    }

    fn instantiate(
        &self,
        template: &InstrTemplate,
        stream: &InstructionStream,
        state: &mut ScriptState,
    ) -> Result<StreamInstruction> {
        let operand = match &template.operand {
            TemplateOperand::None => Operand::None,
            TemplateOperand::Int32(v) => Operand::Int32(*v),
            TemplateOperand::Int64(v) => Operand::Int64(*v),
            TemplateOperand::Float64(v) => Operand::Float64(*v),
            TemplateOperand::String(s) => Operand::String(s.clone()),
            TemplateOperand::Local(index) => {
                if usize::from(*index) >= stream.locals().len() {
                    return Err(Error::InvalidPatch(format!(
                        "local V_{} does not exist ({} locals)",
                        index,
                        stream.locals().len()
                    )));
                }
                Operand::Local(*index)
            }
            TemplateOperand::NamedLocal(name) => {
                Operand::Local(stream.find_local(name).ok_or_else(|| {
                    Error::InvalidPatch(format!("local {} was never declared", name))
                })?)
            }
            TemplateOperand::Arg(index) => Operand::Arg(*index),
            TemplateOperand::Label(name) => {
                Operand::Branch(Target::Label(lookup_label(&state.labels, name)?))
            }
            TemplateOperand::Labels(names) => Operand::Switch(
                names
                    .iter()
                    .map(|name| lookup_label(&state.labels, name).map(Target::Label))
                    .collect::<Result<_>>()?,
            ),
            TemplateOperand::Field(query) => {
                let member = self.ctx.resolve_field(query)?;
                self.record_import(&member, &mut state.outcome);
                Operand::Field(member)
            }
            TemplateOperand::Method(query) => {
                let member = self.ctx.resolve_method(query)?;
                self.record_import(&member, &mut state.outcome);
                Operand::Method(member)
            }
            TemplateOperand::Type(name) => Operand::Type(name.clone()),
        };
        Ok(Instruction::new(template.opcode, operand))
    }
}

fn lookup_label(labels: &HashMap<String, Label>, name: &str) -> Result<Label> {
    labels
        .get(name)
        .copied()
        .ok_or_else(|| Error::corruption(format!("label {} was never defined", name)))
}

fn locate(module: &Module, target: &MethodTarget) -> Result<(usize, usize)> {
    let type_index = module.type_position(&target.type_name)?;
    let method_index =
        module.types[type_index].method_position(&target.method, target.params.as_deref())?;
    Ok((type_index, method_index))
}

/// Run `script` against its target method in `module`.
///
/// The method body and the module's references are only replaced once the
/// whole script succeeded and the edited stream lowered cleanly.
pub fn apply_script(
    module: &mut Module,
    resolver: &dyn SymbolResolver,
    script: &PatchScript,
) -> Result<PatchOutcome> {
    let (type_index, method_index) = locate(module, &script.target)?;
    let method = &module.types[type_index].methods[method_index];
    let body = method.body.as_ref().ok_or_else(|| {
        Error::InvalidPatch(format!("{} has no method body", script.target))
    })?;
    let max_stack = body.max_stack;
    let mut stream = InstructionStream::from_body(body)?;

    let mut outcome = PatchExecutor::new(module, resolver).execute(script, &mut stream)?;
    let body = stream.into_body(max_stack)?;

    for member in &outcome.imports {
        if module.import_reference(member) {
            outcome.new_references.push(member.scope.clone());
        }
    }
    module.types[type_index].methods[method_index].body = Some(body);

    info!(
        "Patched {} ({} inserted, {} removed)",
        outcome.target, outcome.inserted, outcome.removed
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::MethodBody;
    use crate::patch::MethodTarget;
    use crate::resolve::StaticResolver;
    use crate::stream::MoveType;
    use crate::testing;

    fn ldc(value: i32) -> Instruction {
        Instruction::new(OpCode::LdcI4, Operand::Int32(value))
    }

    fn ldc_t(value: i32) -> InstrTemplate {
        InstrTemplate::new(OpCode::LdcI4, TemplateOperand::Int32(value))
    }

    fn values(body: &MethodBody) -> Vec<i32> {
        body.instructions
            .iter()
            .filter_map(|i| match i.operand {
                Operand::Int32(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    fn script() -> PatchScript {
        PatchScript::new("test", MethodTarget::new(testing::SAMPLE_TYPE, testing::SAMPLE_METHOD))
            .with_probe(vec![InstrPattern::ldstr("<patched>")])
    }

    #[test]
    fn test_replace_span() {
        let mut module = testing::sample_module(vec![
            ldc(0xA),
            ldc(0xB),
            ldc(0xC),
            ldc(0xD),
            Instruction::simple(OpCode::Ret),
        ]);
        let script = script()
            .seek(MoveType::Before, vec![InstrPattern::ldc_i4(0xB), InstrPattern::ldc_i4(0xC)])
            .remove(2)
            .insert(vec![ldc_t(0x58), ldc_t(0x59)]);

        let outcome = apply_script(&mut module, &StaticResolver::new(), &script).unwrap();
        assert_eq!(outcome.removed, 2);
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.anchors[0].start, 1);
        assert_eq!(values(testing::sample_body(&module)), vec![0xA, 0x58, 0x59, 0xD]);
    }

    #[test]
    fn test_removing_branch_target_leaves_module_untouched() {
        let mut module = testing::sample_module(vec![
            ldc(0xA),
            ldc(0xB),
            ldc(0xC),
            ldc(0xD),
            Instruction::new(OpCode::BrS, Operand::Branch(1)),
            Instruction::simple(OpCode::Ret),
        ]);
        let before = module.clone();
        let script = script()
            .seek(MoveType::Before, vec![InstrPattern::ldc_i4(0xB), InstrPattern::ldc_i4(0xC)])
            .remove(2)
            .insert(vec![ldc_t(0x58), ldc_t(0x59)]);

        let err = apply_script(&mut module, &StaticResolver::new(), &script).unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(module, before);
    }

    #[test]
    fn test_probe_aborts_before_any_edit() {
        let mut module = testing::sample_module(vec![
            Instruction::new(OpCode::Ldstr, Operand::String("<patched>".into())),
            Instruction::simple(OpCode::Pop),
            Instruction::simple(OpCode::Ret),
        ]);
        let before = module.clone();
        let script = script()
            .with_probe(vec![InstrPattern::ldstr("<patched>")])
            .insert(vec![InstrTemplate::ldstr("<patched>"), InstrTemplate::simple(OpCode::Pop)]);

        let err = apply_script(&mut module, &StaticResolver::new(), &script).unwrap_err();
        assert!(err.is_already_patched());
        assert_eq!(module, before);
    }

    #[test]
    fn test_probe_then_patch_is_idempotent() {
        let mut module = testing::sample_module(vec![Instruction::simple(OpCode::Ret)]);
        let script = script()
            .with_probe(vec![InstrPattern::ldstr("<patched>")])
            .insert(vec![InstrTemplate::ldstr("<patched>"), InstrTemplate::simple(OpCode::Pop)]);

        apply_script(&mut module, &StaticResolver::new(), &script).unwrap();
        let patched = module.clone();
        let err = apply_script(&mut module, &StaticResolver::new(), &script).unwrap_err();
        assert!(err.is_already_patched());
        assert_eq!(module, patched);
    }

    #[test]
    fn test_editing_script_needs_probe() {
        let unguarded = |ops: PatchScript| PatchScript { probe: Vec::new(), ..ops };
        let mut module = testing::sample_module(vec![Instruction::simple(OpCode::Ret)]);
        let before = module.clone();

        for script in [
            unguarded(script().insert(vec![
                InstrTemplate::ldstr("<patched>"),
                InstrTemplate::simple(OpCode::Pop),
            ])),
            unguarded(script().remove(1)),
            unguarded(script().emit_call(
                SymbolQuery::new("System.String", "IsNullOrEmpty").in_scope("System.Runtime"),
            )),
        ] {
            let err = apply_script(&mut module, &testing::dependency_resolver(), &script)
                .unwrap_err();
            assert!(matches!(err, Error::InvalidPatch(_)), "{err}");
            assert_eq!(module, before);
        }

        let seek_only =
            unguarded(script().seek(MoveType::After, vec![InstrPattern::op(OpCode::Ret)]));
        apply_script(&mut module, &StaticResolver::new(), &seek_only).unwrap();
    }

    #[test]
    fn test_missing_anchor_lists_context() {
        let mut module = testing::sample_module(vec![ldc(1), Instruction::simple(OpCode::Ret)]);
        let script = script().seek(MoveType::After, vec![InstrPattern::ldc_i4(2)]);
        let err = apply_script(&mut module, &StaticResolver::new(), &script).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_labels_and_locals() {
        let mut module = testing::sample_module(vec![ldc(1), ldc(2), Instruction::simple(OpCode::Ret)]);
        let script = script()
            .declare_local("flag", "System.Boolean")
            .define_label("skip")
            .insert(vec![
                InstrTemplate::simple(OpCode::LdcI40),
                InstrTemplate::named_local(OpCode::Stloc, "flag"),
                InstrTemplate::named_local(OpCode::Ldloc, "flag"),
                InstrTemplate::branch(OpCode::BrfalseS, "skip"),
            ])
            .seek(MoveType::Before, vec![InstrPattern::op(OpCode::Ret)])
            .mark_label("skip")
            .insert(vec![InstrTemplate::simple(OpCode::Nop)]);

        apply_script(&mut module, &StaticResolver::new(), &script).unwrap();
        let body = testing::sample_body(&module);
        assert_eq!(body.locals.len(), 1);
        assert_eq!(body.locals[0].name.as_deref(), Some("flag"));
        // ldc.i4.0, stloc, ldloc, brfalse.s, ldc 1, ldc 2, nop, ret
        assert_eq!(body.instructions.len(), 8);
        assert_eq!(body.instructions[1].operand, Operand::Local(0));
        assert_eq!(body.instructions[3].operand, Operand::Branch(6));
        assert_eq!(body.instructions[6].opcode, OpCode::Nop);
    }

    #[test]
    fn test_label_rules() {
        let body = vec![Instruction::simple(OpCode::Ret)];

        let unmarked = script()
            .define_label("end")
            .insert(vec![InstrTemplate::branch(OpCode::Br, "end")]);
        let mut module = testing::sample_module(body.clone());
        let err = apply_script(&mut module, &StaticResolver::new(), &unmarked).unwrap_err();
        assert!(err.is_corruption());
        assert!(err.to_string().contains("never marked"));

        let undefined = script().mark_label("nowhere");
        let mut module = testing::sample_module(body.clone());
        let err = apply_script(&mut module, &StaticResolver::new(), &undefined).unwrap_err();
        assert!(err.is_corruption());

        let twice = script().define_label("a").define_label("a");
        let mut module = testing::sample_module(body);
        let err = apply_script(&mut module, &StaticResolver::new(), &twice).unwrap_err();
        assert!(matches!(err, Error::InvalidPatch(_)));
    }

    #[test]
    fn test_emit_call_imports_reference() {
        let mut module = testing::sample_module(vec![Instruction::simple(OpCode::Ret)]);
        let resolver = testing::dependency_resolver();
        let script = script()
            .insert(vec![InstrTemplate::ldstr("tML")])
            .emit_call(
                SymbolQuery::new("log4net.LogManager", "GetLogger")
                    .in_scope("log4net")
                    .with_params(["System.String"]),
            )
            .insert(vec![InstrTemplate::simple(OpCode::Pop)]);

        let outcome = apply_script(&mut module, &resolver, &script).unwrap();
        assert_eq!(outcome.new_references, vec!["log4net"]);
        assert_eq!(outcome.imports.len(), 1);
        assert!(module.references.contains(&"log4net".to_string()));
        let call = &testing::sample_body(&module).instructions[1];
        assert_eq!(call.opcode, OpCode::Call);
        assert_eq!(call.operand.member().map(|m| m.name.as_str()), Some("GetLogger"));
    }

    #[test]
    fn test_emit_call_failures_are_unresolved() {
        let resolver = testing::dependency_resolver();

        let missing_member = script().emit_call(
            SymbolQuery::new("log4net.LogManager", "GetRepository").in_scope("log4net"),
        );
        let mut module = testing::sample_module(vec![Instruction::simple(OpCode::Ret)]);
        let err = apply_script(&mut module, &resolver, &missing_member).unwrap_err();
        assert!(err.is_unresolved());
        assert!(err.to_string().contains("GetLogger"));

        let missing_module = script()
            .emit_call(SymbolQuery::new("NLog.LogManager", "GetLogger").in_scope("NLog"));
        let err = apply_script(&mut module, &resolver, &missing_module).unwrap_err();
        assert!(err.is_unresolved());
    }

    #[test]
    fn test_missing_target_method() {
        let mut module = testing::sample_module(vec![Instruction::simple(OpCode::Ret)]);
        let script = PatchScript::new("x", MethodTarget::new(testing::SAMPLE_TYPE, "Nope"));
        let err = apply_script(&mut module, &StaticResolver::new(), &script).unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains(testing::SAMPLE_METHOD));
    }
}
