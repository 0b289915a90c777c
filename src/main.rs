mod engine;
mod language;
mod runtime;
#[cfg(test)]
mod tests;
mod tools;

use clap::{Parser, Subcommand};
use engine::Engine;
use language::parser::parse_chunk;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tools::diagnostics::{emit_syntax_errors, report_engine_error, report_io_error};

#[derive(Debug, Parser)]
#[command(
    name = "lunet",
    version,
    about = "Lunet language interpreter",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Interpret a script file
    Run {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Parse and statically analyze a script without running it
    Check {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Dump the parse tree of a script
    Ast {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run { file } => run_command(&file),
        Commands::Check { file } => check_command(&file),
        Commands::Ast { file } => ast_command(&file),
    };
    ExitCode::from(code)
}

fn read_source(file: &PathBuf) -> Result<String, u8> {
    std::fs::read_to_string(file).map_err(|err| {
        report_io_error(file, &err);
        1
    })
}

fn run_command(file: &PathBuf) -> u8 {
    let source = match read_source(file) {
        Ok(source) => source,
        Err(code) => return code,
    };
    let engine = Engine::new();
    let mut stdout = std::io::stdout();
    match engine.run_source(&source, &mut stdout) {
        Ok(outcome) => {
            if !outcome.values.is_empty() {
                let rendered: Vec<String> =
                    outcome.values.iter().map(|v| v.render()).collect();
                let _ = writeln!(stdout, "{}", rendered.join("\t"));
            }
            0
        }
        Err(error) => report_engine_error(file, &source, &error) as u8,
    }
}

fn check_command(file: &PathBuf) -> u8 {
    let source = match read_source(file) {
        Ok(source) => source,
        Err(code) => return code,
    };
    let engine = Engine::new();
    match engine.check_source(&source) {
        Ok(()) => {
            println!("OK");
            0
        }
        Err(error) => report_engine_error(file, &source, &error) as u8,
    }
}

fn ast_command(file: &PathBuf) -> u8 {
    let source = match read_source(file) {
        Ok(source) => source,
        Err(code) => return code,
    };
    match parse_chunk(&source) {
        Ok(chunk) => {
            println!("{chunk:#?}");
            0
        }
        Err(errors) => {
            emit_syntax_errors(file, &source, &errors);
            2
        }
    }
}
