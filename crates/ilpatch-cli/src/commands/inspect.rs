//! Inspect command implementation.

use anyhow::{Context, Result};
use ilpatch_core::{Patcher, PatcherConfig};
use owo_colors::OwoColorize;

pub fn run(config: PatcherConfig, type_name: &str, method: &str) -> Result<()> {
    let listing = Patcher::new(config)
        .inspect(type_name, method)
        .with_context(|| format!("Failed to inspect {}::{}", type_name, method))?;

    println!("{}::{}", type_name.bold(), method.bold());
    for line in listing.lines() {
        println!("{}", colorize(line));
    }
    Ok(())
}

/// `IL_0003: ldfld Foo::bar` with a dimmed offset and a highlighted mnemonic.
fn colorize(line: &str) -> String {
    let Some((offset, rest)) = line.split_once(": ") else {
        return line.to_string();
    };
    let (mnemonic, operand) = rest.split_once(' ').unwrap_or((rest, ""));
    if operand.is_empty() {
        format!("{}: {}", offset.dimmed(), mnemonic.cyan())
    } else {
        format!("{}: {} {}", offset.dimmed(), mnemonic.cyan(), operand)
    }
}
