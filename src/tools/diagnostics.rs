use crate::engine::EngineError;
use crate::language::errors::SyntaxErrors;
use crate::runtime::{analysis::AnalysisError, error::RuntimeError};
use miette::{Diagnostic, NamedSource, Report, SourceSpan};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic, Clone)]
#[error("{message}")]
pub struct SyntaxDiagnostic {
    #[source_code]
    src: NamedSource<String>,
    #[label("here")]
    span: SourceSpan,
    #[help]
    help: Option<String>,
    message: String,
}

pub fn emit_syntax_errors(path: &Path, source: &str, errors: &SyntaxErrors) {
    let src = NamedSource::new(path.display().to_string(), source.to_string());
    for err in &errors.errors {
        let diagnostic = SyntaxDiagnostic {
            src: src.clone(),
            span: err.to_source_span(),
            help: err.help.clone(),
            message: err.message.clone(),
        };
        eprintln!("{:?}", Report::new(diagnostic));
    }
}

pub fn report_static_error(error: &AnalysisError) {
    eprintln!("Static error: {error}");
}

pub fn report_runtime_error(error: &RuntimeError) {
    eprintln!("Runtime error: {error}");
}

pub fn report_io_error(path: &Path, error: &std::io::Error) {
    eprintln!("Failed to access {}: {}", path.display(), error);
}

/// Routes an engine error to the matching reporter; returns the exit code
/// the driver should use.
pub fn report_engine_error(path: &Path, source: &str, error: &EngineError) -> i32 {
    match error {
        EngineError::Syntax(errors) => {
            emit_syntax_errors(path, source, errors);
            2
        }
        EngineError::Analysis(error) => {
            report_static_error(error);
            3
        }
        EngineError::Runtime(error) => {
            report_runtime_error(error);
            1
        }
        EngineError::Io { source, .. } => {
            report_io_error(path, source);
            1
        }
    }
}
