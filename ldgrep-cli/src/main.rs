use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use ldgrep_core::{Binary, Class, Endian, Format, FormatError};
use regex::Regex;
use serde::Serialize;

/// Shared-library dependency grep for executable binaries
#[derive(Parser)]
#[command(
    name = "ldgrep",
    about = "Inspect and grep the shared-library dependencies of ELF and Mach-O binaries",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the dependencies of one binary
    Deps {
        /// Path to binary file
        path: PathBuf,
        /// Emit JSON instead of plain text
        #[arg(long)]
        json: bool,
    },
    /// Print binaries whose dependencies match a pattern
    Grep {
        /// Regular expression applied to each dependency name
        #[arg(short, long, default_value = ".")]
        pattern: String,
        /// Binaries to search
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Emit one JSON object per matching file
        #[arg(long)]
        json: bool,
    },
    /// Show header identification for one binary
    Info {
        /// Path to binary file
        path: PathBuf,
    },
}

#[derive(Serialize)]
struct FileDeps {
    path: PathBuf,
    format: &'static str,
    deps: Vec<String>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Deps { path, json } => {
            let mut bin = Binary::open(&path)?;
            let deps = bin.dependencies()?;
            if json {
                let out = FileDeps {
                    path,
                    format: bin.format_name(),
                    deps,
                };
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                for dep in deps {
                    println!("{dep}");
                }
            }
        }

        Command::Grep {
            pattern,
            files,
            json,
        } => {
            let re = Regex::new(&pattern)?;
            for entry in grep(&files, &re)? {
                if json {
                    println!("{}", serde_json::to_string(&entry)?);
                } else {
                    let rendered: Vec<String> = entry
                        .deps
                        .iter()
                        .map(|dep| {
                            if re.is_match(dep) {
                                dep.green().bold().to_string()
                            } else {
                                dep.clone()
                            }
                        })
                        .collect();
                    println!("{} {}", entry.path.display(), rendered.join(" "));
                }
            }
        }

        Command::Info { path } => {
            let bin = Binary::open(&path)?;
            match bin.format() {
                Format::Elf(elf) => {
                    println!("{:<12} ELF", "Format:");
                    println!("{:<12} {}", "Class:", class_name(elf.class()));
                    println!("{:<12} {}", "Endian:", endian_name(elf.endian()));
                    println!("{:<12} {}", "Machine:", elf.header.e_machine);
                    println!("{:<12} 0x{:x}", "Entry:", elf.header.e_entry);
                    println!("{:<12} {}", "Phdrs:", elf.header.e_phnum);
                }
                Format::MachO(macho) => {
                    println!("{:<12} Mach-O", "Format:");
                    println!("{:<12} {}", "Endian:", endian_name(macho.endian()));
                    println!("{:<12} 0x{:x}", "CPU type:", macho.header.cputype);
                    println!("{:<12} {}", "Commands:", macho.header.ncmds);
                }
            }
        }
    }

    Ok(())
}

/// Collects every file whose dependency list has at least one match.
/// Unrecognized files are skipped; I/O failures abort the run.
fn grep(files: &[PathBuf], pattern: &Regex) -> Result<Vec<FileDeps>> {
    let mut matches = Vec::new();
    for path in files {
        let mut bin = match Binary::open(path) {
            Ok(bin) => bin,
            Err(FormatError::Unrecognized) => {
                log::debug!("{}: unrecognized format, skipped", path.display());
                continue;
            }
            Err(FormatError::Io(e)) => return Err(e.into()),
        };
        let deps = bin.dependencies()?;
        if deps.iter().any(|dep| pattern.is_match(dep)) {
            matches.push(FileDeps {
                path: path.clone(),
                format: bin.format_name(),
                deps,
            });
        }
    }
    Ok(matches)
}

fn class_name(class: Class) -> &'static str {
    match class {
        Class::Elf32 => "ELF32",
        Class::Elf64 => "ELF64",
    }
}

fn endian_name(endian: Endian) -> &'static str {
    match endian {
        Endian::Little => "little-endian",
        Endian::Big => "big-endian",
    }
}
