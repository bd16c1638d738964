//! weave CLI tool
//!
//! Command-line interface for compiling and watching weave projects.
//!
//! ## Commands
//!
//! - `check <path>`: One-shot compile, prints diagnostics, exits with 1 on any error
//! - `watch <path>`: Keeps the project compiled while files change

use clap::{Parser, Subcommand};
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::mpsc::channel,
};
use weave_core::{
    codec::ProjectCompiler, config::find_project_root, event::CompileEvent, watch::LanguageService,
};

#[derive(Parser)]
#[command(name = "weave")]
#[command(author, version, about = "Compiler for markdown documents with typed data blocks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a project once and display diagnostics
    Check {
        /// Project directory, or any path inside it
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Skip the spec blocks
        #[arg(long)]
        no_specs: bool,

        /// Print diagnostics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Watch a project and recompile on every change
    Watch {
        /// Project directory, or any path inside it
        #[arg(default_value = ".")]
        path: PathBuf,
    },
}

fn project_root(path: &Path) -> PathBuf {
    find_project_root(path).unwrap_or_else(|| path.to_path_buf())
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check {
            path,
            no_specs,
            json,
        } => {
            let root = project_root(&path);
            let mut compiler = ProjectCompiler::new(&root)?;
            if no_specs {
                compiler = compiler.with_specs(false);
            }
            let output = compiler.compile();

            if json {
                println!("{}", serde_json::to_string_pretty(&output.diagnostics)?);
            } else {
                if !output.diagnostics.is_empty() {
                    println!("{}", output.diagnostics);
                }
                println!(
                    "{} entities, {} errors, {} diagnostics",
                    output.entities.len(),
                    output.diagnostics.errors().count(),
                    output.diagnostics.len()
                );
            }
            Ok(if output.diagnostics.has_errors() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Commands::Watch { path } => {
            let root = project_root(&path);
            let (tx, rx) = channel::<CompileEvent>();
            let mut service = LanguageService::open(&root, tx)?;
            println!("{}", service.workspace().diagnostics());
            service.watch()?;
            println!("Watching {} (Ctrl-C to stop)", root.display());

            for event in rx {
                match event {
                    CompileEvent::Published { diagnostics, .. }
                    | CompileEvent::ProjectReloaded(diagnostics) => {
                        println!(
                            "--- {} errors, {} diagnostics",
                            diagnostics.errors().count(),
                            diagnostics.len()
                        );
                        if !diagnostics.is_empty() {
                            println!("{diagnostics}");
                        }
                    }
                    other => tracing::debug!("{other}"),
                }
            }
            service.shutdown();
            Ok(ExitCode::SUCCESS)
        }
    }
}
