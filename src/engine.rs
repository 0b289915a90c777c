use crate::language::{errors::SyntaxErrors, parser::parse_chunk};
use crate::runtime::{
    analysis::{analyze, AnalysisError},
    error::RuntimeError,
    ffi::{ConvertFn, Converter, HostFunction, NativeType, NativeValue},
    heap::Heap,
    interpreter::Interpreter,
    value::{Function, FunctionKind, Value},
};
use std::io::Write;
use std::path::Path;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("syntax error: {0}")]
    Syntax(SyntaxErrors),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// What a finished run hands back to the embedder: the chunk's return
/// values plus the heap registry, for inspection of live objects.
pub struct RunOutcome {
    pub values: Vec<Value>,
    pub heap: Heap,
}

/// Embedder facade. Holds the native-type converter table and the host
/// callables to install as globals, and drives parse, static analysis and
/// evaluation.
pub struct Engine {
    converter: Converter,
    host_functions: Vec<Rc<HostFunction>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            converter: Converter::with_defaults(),
            host_functions: Vec::new(),
        }
    }

    /// Replaces the converter for one native type.
    pub fn register_converter(&mut self, ty: NativeType, convert: ConvertFn) {
        self.converter.register(ty, convert);
    }

    /// Registers a host callable; it becomes a global function value when a
    /// run starts.
    pub fn register_function(
        &mut self,
        name: impl Into<String>,
        params: Vec<NativeType>,
        callable: impl Fn(&[NativeValue]) -> Option<NativeValue> + 'static,
    ) {
        self.host_functions
            .push(Rc::new(HostFunction::new(name, params, callable)));
    }

    pub fn run_source(&self, source: &str, out: &mut dyn Write) -> Result<RunOutcome, EngineError> {
        let chunk = parse_chunk(source).map_err(EngineError::Syntax)?;
        let analysis = analyze(&chunk, source)?;

        let mut interpreter = Interpreter::new(source, &analysis, &self.converter, out);
        for host in &self.host_functions {
            let function = Function {
                kind: FunctionKind::Host(host.clone()),
            };
            let value = Value::Function(Rc::new(function));
            interpreter.set_global(&host.name, value);
        }

        let values = interpreter.run(&chunk)?;
        let heap = interpreter.into_heap();
        Ok(RunOutcome { values, heap })
    }

    pub fn run_file(&self, path: &Path, out: &mut dyn Write) -> Result<RunOutcome, EngineError> {
        let source = std::fs::read_to_string(path).map_err(|source| EngineError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.run_source(&source, out)
    }

    /// Parse and static analysis only, as the `check` subcommand does.
    pub fn check_source(&self, source: &str) -> Result<(), EngineError> {
        let chunk = parse_chunk(source).map_err(EngineError::Syntax)?;
        analyze(&chunk, source)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> (Vec<Value>, String) {
        let engine = Engine::new();
        let mut out = Vec::new();
        let outcome = engine.run_source(source, &mut out).expect("run");
        (outcome.values, String::from_utf8(out).expect("utf8 output"))
    }

    #[test]
    fn chunk_return_values_surface() {
        let (values, _) = run("return 1, 'two'");
        assert_eq!(values, vec![Value::Int(1), Value::Str("two".into())]);
    }

    #[test]
    fn host_function_is_callable_from_scripts() {
        let mut engine = Engine::new();
        engine.register_function("double", vec![NativeType::Int], |args| {
            let NativeValue::Int(v) = args[0] else {
                return None;
            };
            Some(NativeValue::Int(v * 2))
        });
        let mut out = Vec::new();
        let outcome = engine.run_source("return double(21)", &mut out).expect("run");
        assert_eq!(outcome.values, vec![Value::Int(42)]);
    }

    #[test]
    fn host_function_bind_overflow_is_reported() {
        let mut engine = Engine::new();
        engine.register_function("one", vec![NativeType::Int], |_| None);
        let mut out = Vec::new();
        let result = engine.run_source("one(1, 2)", &mut out);
        assert!(matches!(
            result,
            Err(EngineError::Runtime(RuntimeError::Ffi(_)))
        ));
    }

    #[test]
    fn host_function_partial_call_is_reported() {
        let mut engine = Engine::new();
        engine.register_function("two", vec![NativeType::Int, NativeType::Int], |_| None);
        let mut out = Vec::new();
        let result = engine.run_source("two(1)", &mut out);
        assert!(matches!(
            result,
            Err(EngineError::Runtime(RuntimeError::Ffi(_)))
        ));
    }

    #[test]
    fn check_rejects_static_errors_without_running() {
        let engine = Engine::new();
        assert!(matches!(
            engine.check_source("break"),
            Err(EngineError::Analysis(_))
        ));
        assert!(engine.check_source("print('not evaluated')").is_ok());
    }

    #[test]
    fn run_file_reads_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("script.lunet");
        std::fs::write(&path, "print('from disk')").expect("write script");
        let engine = Engine::new();
        let mut out = Vec::new();
        engine.run_file(&path, &mut out).expect("run");
        assert_eq!(String::from_utf8(out).expect("utf8"), "from disk\n");
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let engine = Engine::new();
        let mut out = Vec::new();
        let result = engine.run_file(Path::new("no/such/script.lunet"), &mut out);
        assert!(matches!(result, Err(EngineError::Io { .. })));
    }

    #[test]
    fn syntax_errors_are_surfaced() {
        let engine = Engine::new();
        let mut out = Vec::new();
        assert!(matches!(
            engine.run_source("local = 3", &mut out),
            Err(EngineError::Syntax(_))
        ));
    }
}
