//! Module fixtures shared by the unit tests.
//!
//! [`tml_module`] mirrors the parts of tModLoader the built-in patches touch,
//! with bodies shaped like the real methods. The dependency modules carry
//! only the members those patches reference.

use std::fs;
use std::path::{Path, PathBuf};

use crate::module::{
    FieldDef, Instruction, LocalVariable, MemberRef, MethodBody, MethodDef, Module, OpCode,
    Operand, Signature, TypeDef,
};
use crate::resolve::StaticResolver;

pub const SAMPLE_TYPE: &str = "Game.Main";
pub const SAMPLE_METHOD: &str = "Draw";

pub const TML: &str = "tModLoader";
pub const ASSEMBLY_MANAGER: &str = "Terraria.ModLoader.Core.AssemblyManager";
pub const MOD_LOAD_CONTEXT: &str = "Terraria.ModLoader.Core.AssemblyManager/ModLoadContext";
pub const BUILD_PROPERTIES: &str = "Terraria.ModLoader.Core.BuildProperties";
pub const MAIN: &str = "Terraria.Main";
pub const FONT_ASSETS: &str = "Terraria.GameContent.FontAssets";

pub fn sample_module(instructions: Vec<Instruction>) -> Module {
    let mut module = Module::new("Game");
    module.references.push("System.Runtime".to_string());
    module.types.push(
        TypeDef::new(SAMPLE_TYPE)
            .with_method(MethodDef::new("Update", Signature::new(Vec::<String>::new(), "System.Void")))
            .with_method(
                MethodDef::new(SAMPLE_METHOD, Signature::new(Vec::<String>::new(), "System.Void"))
                    .with_body(MethodBody::new(instructions)),
            ),
    );
    module
}

pub fn sample_body(module: &Module) -> &MethodBody {
    module.types[0].methods[1]
        .body
        .as_ref()
        .expect("sample method has a body")
}

fn sig<const N: usize>(params: [&str; N], ret: &str) -> Signature {
    Signature::new(params, ret)
}

pub fn runtime_module() -> Module {
    let mut module = Module::new("System.Runtime");
    module.types.push(
        TypeDef::new("System.String")
            .with_method(
                MethodDef::new("Concat", sig(["System.String", "System.String"], "System.String"))
                    .static_method(),
            )
            .with_method(
                MethodDef::new(
                    "Concat",
                    sig(["System.String", "System.String", "System.String"], "System.String"),
                )
                .static_method(),
            )
            .with_method(
                MethodDef::new("IsNullOrEmpty", sig(["System.String"], "System.Boolean"))
                    .static_method(),
            ),
    );
    module.types.push(
        TypeDef::new("System.IO.File")
            .with_method(
                MethodDef::new("Exists", sig(["System.String"], "System.Boolean")).static_method(),
            )
            .with_method(
                MethodDef::new("ReadAllBytes", sig(["System.String"], "System.Byte[]"))
                    .static_method(),
            ),
    );
    module.types.push(
        TypeDef::new("System.IO.Path").with_method(
            MethodDef::new(
                "ChangeExtension",
                sig(["System.String", "System.String"], "System.String"),
            )
            .static_method(),
        ),
    );
    module.types.push(
        TypeDef::new("System.Diagnostics.Debugger").with_method(
            MethodDef::new("get_IsAttached", sig([], "System.Boolean")).static_method(),
        ),
    );
    module
}

pub fn loader_module() -> Module {
    let mut module = Module::new("System.Runtime.Loader");
    module.types.push(
        TypeDef::new("System.Runtime.Loader.AssemblyLoadContext").with_method(MethodDef::new(
            "LoadFromAssemblyPath",
            sig(["System.String"], "System.Reflection.Assembly"),
        )),
    );
    module
}

pub fn log4net_module() -> Module {
    let mut module = Module::new("log4net");
    module.types.push(
        TypeDef::new("log4net.LogManager")
            .with_method(
                MethodDef::new("GetLogger", sig(["System.Type"], "log4net.ILog")).static_method(),
            )
            .with_method(
                MethodDef::new("GetLogger", sig(["System.String"], "log4net.ILog")).static_method(),
            ),
    );
    module.types.push(
        TypeDef::new("log4net.ILog")
            .with_method(MethodDef::new("Debug", sig(["System.Object"], "System.Void")))
            .with_method(MethodDef::new("Info", sig(["System.Object"], "System.Void"))),
    );
    module
}

pub fn dependency_resolver() -> StaticResolver {
    StaticResolver::new()
        .with_module(runtime_module())
        .with_module(loader_module())
        .with_module(log4net_module())
}

fn runtime(type_name: &str, name: &str, params: &[&str], ret: &str) -> Operand {
    Operand::Method(MemberRef {
        scope: "System.Runtime".to_string(),
        declaring_type: type_name.to_string(),
        name: name.to_string(),
        signature: Signature::new(params.iter().copied(), ret),
    })
}

fn local_field(type_name: &str, name: &str, field_type: &str) -> Operand {
    Operand::Field(FieldDef::new(name, field_type).to_ref(TML, type_name))
}

fn op(opcode: OpCode) -> Instruction {
    Instruction::simple(opcode)
}

fn with(opcode: OpCode, operand: Operand) -> Instruction {
    Instruction::new(opcode, operand)
}

/// `ModLoadContext.LoadAssemblies`: a dependency loop, then a branch on
/// whether the debug symbols exist.
///
/// ```text
/// 00-15  for (i = 0; i < deps.Length; i++) ...    ; loop on V_3 / V_2
/// 16-19  ldarg.0 ldfld properties ldfld eacPath call File::Exists
/// 20     brtrue.s 28
/// 21-26  ldarg.0 ldarg.0 ldfld modFile call GetModAssembly ldnull call LoadAssembly
/// 27     br.s 37
/// 28-36  ldarg.0 ldarg.0 ldfld modFile call GetModAssembly ldarg.0
///        ldfld properties ldfld eacPath call File::ReadAllBytes call LoadAssembly
/// 37-38  stloc.1 ret
/// ```
pub fn load_assemblies_body() -> MethodBody {
    let properties = || local_field(MOD_LOAD_CONTEXT, "properties", BUILD_PROPERTIES);
    let mod_file = || local_field(MOD_LOAD_CONTEXT, "modFile", "Terraria.ModLoader.Core.TmodFile");
    let eac_path = || local_field(BUILD_PROPERTIES, "eacPath", "System.String");
    let get_mod_assembly = || {
        Operand::Method(
            MethodDef::new(
                "GetModAssembly",
                sig(["Terraria.ModLoader.Core.TmodFile"], "System.Byte[]"),
            )
            .to_ref(TML, ASSEMBLY_MANAGER),
        )
    };
    let load_assembly = || {
        Operand::Method(
            MethodDef::new(
                "LoadAssembly",
                sig(["System.Byte[]", "System.Byte[]"], "System.Reflection.Assembly"),
            )
            .to_ref(TML, MOD_LOAD_CONTEXT),
        )
    };

    let mut body = MethodBody::new(vec![
        op(OpCode::LdcI40),
        op(OpCode::Stloc3),
        with(OpCode::BrS, Operand::Branch(11)),
        op(OpCode::Ldloc2),
        op(OpCode::Ldloc3),
        op(OpCode::LdelemRef),
        op(OpCode::Pop),
        op(OpCode::Ldloc3),
        op(OpCode::LdcI41),
        op(OpCode::Add),
        op(OpCode::Stloc3),
        op(OpCode::Ldloc3),
        op(OpCode::Ldloc2),
        op(OpCode::Ldlen),
        op(OpCode::ConvI4),
        with(OpCode::BltS, Operand::Branch(3)),
        // 16
        op(OpCode::Ldarg0),
        with(OpCode::Ldfld, properties()),
        with(OpCode::Ldfld, eac_path()),
        with(OpCode::Call, runtime("System.IO.File", "Exists", &["System.String"], "System.Boolean")),
        with(OpCode::BrtrueS, Operand::Branch(28)),
        // 21
        op(OpCode::Ldarg0),
        op(OpCode::Ldarg0),
        with(OpCode::Ldfld, mod_file()),
        with(OpCode::Call, get_mod_assembly()),
        op(OpCode::Ldnull),
        with(OpCode::Call, load_assembly()),
        with(OpCode::BrS, Operand::Branch(37)),
        // 28
        op(OpCode::Ldarg0),
        op(OpCode::Ldarg0),
        with(OpCode::Ldfld, mod_file()),
        with(OpCode::Call, get_mod_assembly()),
        op(OpCode::Ldarg0),
        with(OpCode::Ldfld, properties()),
        with(OpCode::Ldfld, eac_path()),
        with(
            OpCode::Call,
            runtime("System.IO.File", "ReadAllBytes", &["System.String"], "System.Byte[]"),
        ),
        with(OpCode::Call, load_assembly()),
        // 37
        op(OpCode::Stloc1),
        op(OpCode::Ret),
    ]);
    body.max_stack = 5;
    body.locals = vec![
        LocalVariable::new("System.String"),
        LocalVariable::new("System.Reflection.Assembly"),
        LocalVariable::new("System.String[]"),
        LocalVariable::new("System.Int32"),
    ];
    body
}

/// `Main.DrawVersionNumber`, reduced to the measuring of the version string.
pub fn draw_version_number_body() -> MethodBody {
    let callvirt = |type_name: &str, name: &str, ret: &str| {
        with(
            OpCode::Callvirt,
            Operand::Method(MethodDef::new(name, sig([], ret)).to_ref("ReLogic", type_name)),
        )
    };
    let mut body = MethodBody::new(vec![
        with(OpCode::Ldstr, Operand::String("v2024.5.3.0".into())),
        op(OpCode::Stloc3),
        with(
            OpCode::Ldsfld,
            local_field(FONT_ASSETS, "MouseText", "ReLogic.Content.Asset`1"),
        ),
        callvirt("ReLogic.Content.Asset`1", "get_Value", "ReLogic.Graphics.DynamicSpriteFont"),
        op(OpCode::Ldloc3),
        callvirt(
            "ReLogic.Graphics.DynamicSpriteFont",
            "MeasureString",
            "Microsoft.Xna.Framework.Vector2",
        ),
        with(OpCode::StlocS, Operand::Local(4)),
        op(OpCode::Ret),
    ]);
    body.locals = vec![
        LocalVariable::new("System.Int32"),
        LocalVariable::new("System.Int32"),
        LocalVariable::new("System.Int32"),
        LocalVariable::new("System.String"),
        LocalVariable::new("Microsoft.Xna.Framework.Vector2"),
    ];
    body
}

pub fn tml_module() -> Module {
    let mut module = Module::new(TML);
    module.version = "2024.5.3.0".to_string();
    module.references = vec![
        "System.Runtime".to_string(),
        "System.Runtime.Loader".to_string(),
        "ReLogic".to_string(),
    ];
    module.types.push(
        TypeDef::new(ASSEMBLY_MANAGER).with_method(
            MethodDef::new(
                "GetModAssembly",
                sig(["Terraria.ModLoader.Core.TmodFile"], "System.Byte[]"),
            )
            .static_method(),
        ),
    );
    module.types.push(
        TypeDef::new(MOD_LOAD_CONTEXT)
            .with_field(FieldDef::new("modFile", "Terraria.ModLoader.Core.TmodFile"))
            .with_field(FieldDef::new("properties", BUILD_PROPERTIES))
            .with_method(
                MethodDef::new("LoadAssemblies", sig([], "System.Void"))
                    .with_body(load_assemblies_body()),
            )
            .with_method(MethodDef::new(
                "LoadAssembly",
                sig(["System.Byte[]", "System.Byte[]"], "System.Reflection.Assembly"),
            )),
    );
    module
        .types
        .push(TypeDef::new(BUILD_PROPERTIES).with_field(FieldDef::new("eacPath", "System.String")));
    module.types.push(TypeDef::new(MAIN).with_method(
        MethodDef::new("DrawVersionNumber", sig(["Microsoft.Xna.Framework.Color", "System.Single"], "System.Void"))
            .static_method()
            .with_body(draw_version_number_body()),
    ));
    module.types.push(
        TypeDef::new(FONT_ASSETS)
            .with_field(FieldDef::new("MouseText", "ReLogic.Content.Asset`1").static_field()),
    );
    module
}

/// Lay out an install directory: the game module at the root and its
/// dependencies in nested library folders. Returns the game module's path.
pub fn write_install(dir: &Path) -> PathBuf {
    let log4net_dir = dir.join("Libraries").join("log4net").join("2.0.8.0");
    let runtime_dir = dir.join("dotnet").join("shared");
    fs::create_dir_all(&log4net_dir).expect("create log4net dir");
    fs::create_dir_all(&runtime_dir).expect("create runtime dir");

    let write = |path: PathBuf, module: Module| {
        fs::write(path, module.to_bytes().expect("encode module")).expect("write module");
    };
    write(log4net_dir.join("log4net.dll"), log4net_module());
    write(runtime_dir.join("System.Runtime.dll"), runtime_module());
    write(runtime_dir.join("System.Runtime.Loader.dll"), loader_module());

    let path = dir.join("tModLoader.dll");
    write(path.clone(), tml_module());
    path
}
