mod commands;
mod location;

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use ilpatch_core::{PatcherConfig, resolve_install_dir};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::location::PlatformLocation;

#[derive(Parser)]
#[command(name = "ilpatch")]
#[command(about = "Patch tModLoader so mods can be debugged with a managed debugger")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    target: TargetArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Args)]
struct TargetArgs {
    /// tModLoader install directory (defaults to the Steam library location)
    #[arg(short, long, global = true, env = "ILPATCH_PATH")]
    path: Option<PathBuf>,

    /// Module file inside the install directory
    #[arg(short, long, global = true, default_value = "tModLoader.dll")]
    module: String,

    /// Write the patched module here instead of replacing the input
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Additional directory searched for dependency modules (repeatable)
    #[arg(short, long = "search-dir", global = true)]
    search_dirs: Vec<PathBuf>,

    /// Patch set JSON to apply instead of the built-in patches
    #[arg(long, global = true)]
    patches: Option<PathBuf>,
}

impl TargetArgs {
    fn config(&self) -> Result<PatcherConfig> {
        let install_dir = resolve_install_dir(self.path.as_deref(), &PlatformLocation)?;
        let module_path = install_dir.join(&self.module);
        info!("Using module at {}", module_path.display());

        if !module_path.is_file() {
            bail!(
                "Unable to locate {} in {}, please pass your install directory using --path",
                self.module,
                install_dir.display()
            );
        }

        let mut builder = PatcherConfig::builder()
            .module_path(module_path)
            .search_dirs(self.search_dirs.iter().cloned());
        if let Some(output) = &self.output {
            builder = builder.output_path(output);
        }
        Ok(builder.build())
    }
}

#[derive(Subcommand)]
enum Command {
    /// Apply the patch set and write the module (default)
    Patch,
    /// Print the instruction listing of a method
    Inspect {
        /// Full type name, nested types separated by '/'
        #[arg(value_name = "TYPE")]
        type_name: String,
        /// Method name
        method: String,
    },
    /// Print the built-in patch set as JSON
    Patches {
        /// Save to a file instead of printing
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ilpatch=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Patch) {
        Command::Patch => {
            let config = cli.target.config()?;
            commands::patch::run(config, cli.target.patches.as_deref())
        }
        Command::Inspect { type_name, method } => {
            let config = cli.target.config()?;
            commands::inspect::run(config, &type_name, &method)
        }
        Command::Patches { save } => commands::patches::run(save.as_deref()),
    }
}
