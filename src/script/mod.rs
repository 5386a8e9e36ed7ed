//! Script language: lexer, parser, scopes and a resumable interpreter

pub mod ast;
pub mod builtins;
pub mod diagnostic;
pub mod environment;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod token;
pub mod value;

pub use ast::{Expr, Program, Stmt};
pub use diagnostic::{Diagnostic, Phase, RuntimeError, Span};
pub use environment::{Binding, EnvRef, Environment, NodeRef};
pub use interpreter::{
    BindingPolicy, ExecutionResult, Interpreter, InterpreterOptions, RunState, DEFAULT_MAX_CALL_DEPTH,
};
pub use lexer::{lex, Lexer};
pub use parser::{parse, Parser, MAX_NESTING};
pub use token::{Token, TokenKind};
pub use value::Value;

/// Output of the front end: tokens, the recovered program and every
/// lexical and syntax diagnostic in source order
#[derive(Debug)]
pub struct Compilation {
    pub tokens: Vec<Token>,
    pub program: Option<Program>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Compilation {
    pub fn has_errors(&self) -> bool {
        !self.diagnostics.is_empty()
    }
}

/// Lex and parse a source text
pub fn compile(source: &str) -> Compilation {
    let (tokens, lex_errors) = lex(source);
    let (program, syntax_errors) = parse(tokens.clone());

    let mut diagnostics: Vec<Diagnostic> = lex_errors
        .into_iter()
        .map(Diagnostic::from)
        .chain(syntax_errors.into_iter().map(Diagnostic::from))
        .collect();
    diagnostics.sort_by_key(|d| (d.span.line, d.span.start_col));

    log::debug!(
        "compiled {} token(s), {} statement(s), {} diagnostic(s)",
        tokens.len(),
        program.as_ref().map_or(0, Program::len),
        diagnostics.len()
    );
    Compilation { tokens, program, diagnostics }
}

/// Options for [`run_source`]
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub interpreter: InterpreterOptions,
    /// Run the recovered statements even when the front end reported errors
    pub run_partial: bool,
}

/// Everything a host needs after a run
#[derive(Debug, Default)]
pub struct Report {
    pub diagnostics: Vec<Diagnostic>,
    /// Root-scope bindings, builtins excluded, deferred values resolved when possible
    pub bindings: Vec<(String, Binding)>,
    pub output: Vec<String>,
    /// Final interpreter state, `None` when the program was not run
    pub state: Option<RunState>,
}

impl Report {
    pub fn succeeded(&self) -> bool {
        self.diagnostics.is_empty() && self.state == Some(RunState::Done)
    }
}

/// Compile and, unless the front end failed, run a source text to completion
pub fn run_source(source: &str, options: &RunOptions) -> Report {
    let compilation = compile(source);
    let mut report = Report { diagnostics: compilation.diagnostics, ..Report::default() };

    let Some(program) = compilation.program else {
        log::debug!("nothing to run");
        return report;
    };
    if !report.diagnostics.is_empty() && !options.run_partial {
        log::debug!("not running: {} front-end diagnostic(s)", report.diagnostics.len());
        return report;
    }

    let mut interp = Interpreter::with_options(options.interpreter.clone());
    interp.load(program);
    if let Err(err) = interp.run() {
        report.diagnostics.push(err.to_diagnostic(source));
    }

    report.output = interp.take_output();
    report.bindings = inspect_bindings(&mut interp);
    report.state = Some(interp.state());
    report
}

/// Root-scope bindings for display, deferred values resolved when possible.
/// Natives live in the tier above the root and are not listed.
pub fn inspect_bindings(interp: &mut Interpreter) -> Vec<(String, Binding)> {
    let snapshot = interp.globals().borrow().bindings();
    snapshot
        .into_iter()
        .map(|(name, binding)| match binding {
            Binding::NodeRef(NodeRef::Expr(_)) => match interp.resolve(&name) {
                Ok(Some(value)) => (name, Binding::from_value(value)),
                _ => (name, binding),
            },
            other => (name, other),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::diagnostic::RuntimeErrorKind;

    fn binding<'a>(report: &'a Report, name: &str) -> Option<&'a Binding> {
        report.bindings.iter().find(|(n, _)| n == name).map(|(_, b)| b)
    }

    #[test]
    fn test_compile_collects_both_phases() {
        let compilation = compile("let a = @;\nlet b = ;\nlet c = 1;");
        let phases: Vec<Phase> = compilation.diagnostics.iter().map(|d| d.phase).collect();
        assert_eq!(phases, vec![Phase::Lexical, Phase::Syntax]);
        assert_eq!((compilation.diagnostics[0].line(), compilation.diagnostics[0].col()), (1, 9));
        assert_eq!((compilation.diagnostics[1].line(), compilation.diagnostics[1].col()), (2, 9));
        assert_eq!(compilation.program.map(|p| p.len()), Some(1));
        assert_eq!(compilation.tokens.last().map(|t| t.kind), Some(TokenKind::Eof));
    }

    #[test]
    fn test_run_source() {
        let report = run_source("let x = 1 + 2 * 3;\nprint(x);", &RunOptions::default());
        assert!(report.succeeded(), "{:?}", report.diagnostics);
        assert_eq!(report.output, vec!["7"]);
        assert_eq!(report.bindings.len(), 1);
        assert_eq!(binding(&report, "x").map(|b| b.to_string()), Some("7".to_string()));
    }

    #[test]
    fn test_front_end_errors_block_the_run() {
        let source = "let a = 1;\nlet = 2;";
        let report = run_source(source, &RunOptions::default());
        assert_eq!(report.diagnostics.len(), 1);
        assert!(report.state.is_none());
        assert!(report.bindings.is_empty());

        let options = RunOptions { run_partial: true, ..RunOptions::default() };
        let report = run_source(source, &options);
        assert_eq!(report.state, Some(RunState::Done));
        assert!(binding(&report, "a").is_some());
        assert!(!report.succeeded());
    }

    #[test]
    fn test_runtime_diagnostic() {
        let report = run_source("let ok = 1;\nlet bad = ok / 0;", &RunOptions::default());
        assert_eq!(report.state, Some(RunState::Error));
        let diagnostic = report.diagnostics.last().expect("runtime diagnostic");
        assert_eq!(diagnostic.phase, Phase::Runtime);
        assert_eq!(diagnostic.span, Span::new(2, 11, 17));
        assert_eq!(diagnostic.lexeme, "ok / 0");
        assert_eq!(diagnostic.message, RuntimeErrorKind::DivisionByZero.to_string());
        assert!(binding(&report, "ok").is_some());
    }

    #[test]
    fn test_deferred_bindings_are_resolved_for_inspection() {
        let options = RunOptions {
            interpreter: InterpreterOptions { policy: BindingPolicy::Deferred, ..InterpreterOptions::default() },
            ..RunOptions::default()
        };
        let report = run_source("let a = 2;\nlet b = a * 10;\nfn f() { return 1; }", &options);
        assert!(report.succeeded(), "{:?}", report.diagnostics);
        assert_eq!(binding(&report, "b").map(|b| b.to_string()), Some("20".to_string()));
        assert_eq!(binding(&report, "f").map(|b| b.to_string()), Some("<fn f>".to_string()));
    }

    #[test]
    fn test_script_may_reuse_builtin_names() {
        let report = run_source("let len = 3;\nlet alias = print;\nalias(len);", &RunOptions::default());
        assert!(report.succeeded(), "{:?}", report.diagnostics);
        assert_eq!(report.output, vec!["3"]);
        let names: Vec<&str> = report.bindings.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["alias", "len"]);
        assert_eq!(binding(&report, "alias").map(|b| b.to_string()), Some("<builtin print>".to_string()));
    }

    #[test]
    fn test_empty_source() {
        let report = run_source("", &RunOptions::default());
        assert!(report.succeeded());
        assert!(report.bindings.is_empty());
    }
}
