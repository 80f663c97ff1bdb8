//! The tModLoader patch set.
//!
//! `ModLoadContext` makes mods with debug symbols load their assembly from
//! disk (so a debugger can attach to it) and logs where the symbols were
//! found. `Main` stamps the version banner so a patched install is visible
//! in game.

use super::{InstrTemplate, MethodTarget, PatchScript, PatchSet};
use crate::module::OpCode;
use crate::resolve::SymbolQuery;
use crate::stream::{InstrPattern, MoveType};

/// Text prepended to the version banner. Installs patched by the earlier
/// patcher carry the same literal, so they are recognised as patched.
pub const MAIN_MARKER: &str = "Patched by ppeb!\n";

const MOD_LOAD_CONTEXT: &str = "Terraria.ModLoader.Core.AssemblyManager/ModLoadContext";
const ASSEMBLY_MANAGER: &str = "Terraria.ModLoader.Core.AssemblyManager";
const BUILD_PROPERTIES: &str = "Terraria.ModLoader.Core.BuildProperties";

const TML_LOGGER: &str = "tmlLogger";
const FOUND_PDB: &str = "foundPdb";
const SKIP_DEBUG: &str = "skipDebug";

fn runtime(type_name: &str, name: &str) -> SymbolQuery {
    SymbolQuery::new(type_name, name).in_scope("System.Runtime")
}

fn string_concat(arity: usize) -> SymbolQuery {
    runtime("System.String", "Concat").with_params(vec!["System.String"; arity])
}

fn load_from_assembly_path() -> SymbolQuery {
    SymbolQuery::new("System.Runtime.Loader.AssemblyLoadContext", "LoadFromAssemblyPath")
        .in_scope("System.Runtime.Loader")
}

fn log_debug() -> SymbolQuery {
    SymbolQuery::new("log4net.ILog", "Debug").in_scope("log4net")
}

fn properties() -> SymbolQuery {
    SymbolQuery::new(MOD_LOAD_CONTEXT, "properties")
}

fn eac_path() -> SymbolQuery {
    SymbolQuery::new(BUILD_PROPERTIES, "eacPath")
}

/// `tmlLogger.Debug("Located pdb at " + this.properties.eacPath + suffix)`
fn log_pdb_path(suffix: &str) -> Vec<InstrTemplate> {
    vec![
        InstrTemplate::named_local(OpCode::Ldloc, TML_LOGGER),
        InstrTemplate::ldstr("Located pdb at "),
        InstrTemplate::simple(OpCode::Ldarg0),
        InstrTemplate::ldfld(properties()),
        InstrTemplate::ldfld(eac_path()),
        InstrTemplate::ldstr(suffix),
        InstrTemplate::call(string_concat(3)),
        InstrTemplate::callvirt(log_debug()),
    ]
}

pub fn mod_load_context_patch() -> PatchScript {
    let load_pdb_from_disk = {
        let mut instrs = log_pdb_path(", loading assembly from disk");
        // base.LoadFromAssemblyPath(Path.ChangeExtension(this.properties.eacPath, ".dll"))
        instrs.extend([
            InstrTemplate::simple(OpCode::Ldarg0),
            InstrTemplate::simple(OpCode::Ldarg0),
            InstrTemplate::ldfld(properties()),
            InstrTemplate::ldfld(eac_path()),
            InstrTemplate::ldstr(".dll"),
            InstrTemplate::call(runtime("System.IO.Path", "ChangeExtension")),
            InstrTemplate::call(load_from_assembly_path()),
        ]);
        instrs
    };

    PatchScript::new(
        "ModLoadContext",
        MethodTarget::new(MOD_LOAD_CONTEXT, "LoadAssemblies"),
    )
    .with_probe(vec![InstrPattern::call(load_from_assembly_path())])
    // After the dependency loop: ILog tmlLogger = LogManager.GetLogger("tML");
    .seek(
        MoveType::After,
        vec![
            InstrPattern::op(OpCode::Ldloc3),
            InstrPattern::op(OpCode::Ldloc2),
            InstrPattern::op(OpCode::Ldlen),
            InstrPattern::op(OpCode::ConvI4),
            InstrPattern::op(OpCode::Blt),
        ],
    )
    .declare_local(TML_LOGGER, "System.Object")
    .insert(vec![InstrTemplate::ldstr("tML")])
    .emit_call(
        SymbolQuery::new("log4net.LogManager", "GetLogger")
            .in_scope("log4net")
            .with_params(["System.String"]),
    )
    .insert(vec![InstrTemplate::named_local(OpCode::Stloc, TML_LOGGER)])
    // The old branch targets the in-memory load, which is removed below.
    .seek(
        MoveType::After,
        vec![InstrPattern::call(runtime("System.IO.File", "Exists"))],
    )
    .define_label(FOUND_PDB)
    .remove(1)
    .insert(vec![InstrTemplate::branch(OpCode::BrtrueS, FOUND_PDB)])
    // if (Debugger.IsAttached && !string.IsNullOrEmpty(this.properties.eacPath)) log
    .define_label(SKIP_DEBUG)
    .emit_call(runtime("System.Diagnostics.Debugger", "get_IsAttached"))
    .insert(
        [
            vec![
                InstrTemplate::branch(OpCode::BrfalseS, SKIP_DEBUG),
                InstrTemplate::simple(OpCode::Ldarg0),
                InstrTemplate::ldfld(properties()),
                InstrTemplate::ldfld(eac_path()),
                InstrTemplate::call(runtime("System.String", "IsNullOrEmpty")),
                InstrTemplate::branch(OpCode::BrtrueS, SKIP_DEBUG),
            ],
            log_pdb_path(", but the file was not found"),
        ]
        .concat(),
    )
    .mark_label(SKIP_DEBUG)
    .seek(
        MoveType::Before,
        vec![
            InstrPattern::op(OpCode::Ldarg0),
            InstrPattern::op(OpCode::Ldarg0),
            InstrPattern::ldfld(SymbolQuery::new(MOD_LOAD_CONTEXT, "modFile")),
            InstrPattern::call(SymbolQuery::new(ASSEMBLY_MANAGER, "GetModAssembly")),
            InstrPattern::op(OpCode::Ldarg0),
            InstrPattern::ldfld(properties()),
            InstrPattern::ldfld(eac_path()),
            InstrPattern::call(runtime("System.IO.File", "ReadAllBytes")),
        ],
    )
    .remove(9)
    .mark_label(FOUND_PDB)
    .insert(load_pdb_from_disk)
}

pub fn main_patch() -> PatchScript {
    PatchScript::new("Main", MethodTarget::new("Terraria.Main", "DrawVersionNumber"))
        .with_probe(vec![InstrPattern::ldstr(MAIN_MARKER)])
        .seek(
            MoveType::Before,
            vec![
                InstrPattern::ldsfld(SymbolQuery::new("Terraria.GameContent.FontAssets", "MouseText")),
                InstrPattern::op(OpCode::Callvirt),
                InstrPattern::op(OpCode::Ldloc3),
                InstrPattern::op(OpCode::Callvirt),
                InstrPattern::stloc(4),
            ],
        )
        .insert(vec![
            InstrTemplate::ldstr(MAIN_MARKER),
            InstrTemplate::simple(OpCode::Ldloc3),
            InstrTemplate::call(string_concat(2)),
            InstrTemplate::simple(OpCode::Stloc3),
        ])
}

pub fn builtin_patches() -> PatchSet {
    PatchSet::new("tModLoader")
        .with_script(mod_load_context_patch())
        .with_script(main_patch())
}
