//! Goat CLI (goat)
//! Runs and disassembles compiled Goat bytecode (.gbc).

use clap::{Parser as ClapParser, Subcommand};
use goat::{run, BytecodeImage, Process, RunConfig};
use miette::Result;
use std::path::PathBuf;

#[derive(ClapParser)]
#[command(
    name = "goat",
    version = "0.1.0",
    about = "The Goat bytecode runtime",
    long_about = "goat — execute and inspect compiled Goat programs (.gbc)."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a compiled Goat program
    Run {
        path: PathBuf,
        /// Emit a [gc] line for every sweep
        #[arg(long)]
        trace_gc: bool,
        /// Print heap statistics after the run
        #[arg(long)]
        gc_stats: bool,
    },
    /// Print a disassembly of a compiled Goat program
    Dis { path: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // ----------------------------------------------------------------
        // goat run <file.gbc>
        // ----------------------------------------------------------------
        Commands::Run { path, trace_gc, gc_stats } => {
            let image = BytecodeImage::from_file(&path)
                .map_err(|e| miette::miette!("Cannot load '{}': {}", path.display(), e))?;

            let mut process = Process::new(RunConfig { trace_gc, gc_stats });
            match run(&mut process, &image) {
                Ok(_) => {}
                Err(e) => {
                    eprintln!("goat: {}", e);
                    std::process::exit(e.exit_code());
                }
            }
        }

        // ----------------------------------------------------------------
        // goat dis <file.gbc>
        // ----------------------------------------------------------------
        Commands::Dis { path } => {
            let image = BytecodeImage::from_file(&path)
                .map_err(|e| miette::miette!("Cannot load '{}': {}", path.display(), e))?;
            print!("{}", image.disassemble());
        }
    }

    Ok(())
}
