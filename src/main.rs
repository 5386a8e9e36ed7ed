//! vizscript command line runner
//!
//! Lexes, parses and runs a script, printing diagnostics with source
//! excerpts and the final root-scope bindings.

use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use vizscript::script::{
    self, BindingPolicy, Diagnostic, ExecutionResult, Interpreter, InterpreterOptions, DEFAULT_MAX_CALL_DEPTH,
};

/// Run a script and show what it bound.
#[derive(Parser, Debug)]
#[command(name = "vizscript", version, about, long_about = None)]
struct Args {
    /// Script file to run, or `-` to read standard input.
    file: PathBuf,

    /// Bind assignments unevaluated and evaluate them when read.
    #[arg(long)]
    deferred: bool,

    /// Execute one top-level statement at a time, reporting each.
    #[arg(long)]
    step: bool,

    /// Print the token stream.
    #[arg(long)]
    tokens: bool,

    /// Print the syntax tree.
    #[arg(long)]
    ast: bool,

    /// Run the recovered statements even when there are lexical or syntax errors.
    #[arg(long)]
    partial: bool,

    /// Do not install print() and len().
    #[arg(long)]
    no_builtins: bool,

    /// Maximum nesting of function calls.
    #[arg(long, default_value_t = DEFAULT_MAX_CALL_DEPTH)]
    max_depth: usize,

    /// Milliseconds a loop may run before output is flushed.
    #[arg(long, default_value_t = 16)]
    frame_ms: u64,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn interpreter_options(&self) -> InterpreterOptions {
        InterpreterOptions {
            policy: if self.deferred { BindingPolicy::Deferred } else { BindingPolicy::Eager },
            max_call_depth: self.max_depth,
            frame_budget: Duration::from_millis(self.frame_ms),
            install_builtins: !self.no_builtins,
        }
    }
}

/// Minimal stderr backend for the `log` facade
struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

fn read_source(path: &PathBuf) -> io::Result<String> {
    if path.as_os_str() == "-" {
        let mut source = String::new();
        io::stdin().read_to_string(&mut source)?;
        Ok(source)
    } else {
        fs::read_to_string(path)
    }
}

fn report(diagnostics: &[Diagnostic], source: &str) {
    for diagnostic in diagnostics {
        eprintln!("{}", diagnostic.render(source));
    }
}

fn flush_output(interp: &mut Interpreter, out: &mut impl Write) -> io::Result<()> {
    for line in interp.take_output() {
        writeln!(out, "{}", line)?;
    }
    out.flush()
}

fn main() -> io::Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.verbose);

    let source = match read_source(&args.file) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Failed to read '{}': {}", args.file.display(), err);
            return Ok(ExitCode::FAILURE);
        }
    };
    log::info!("running {} ({} bytes)", args.file.display(), source.len());

    let compilation = script::compile(&source);
    let stdout = io::stdout();
    let mut out = stdout.lock();

    if args.tokens {
        for token in &compilation.tokens {
            writeln!(out, "{}:{}-{}\t{:?}\t{:?}", token.line, token.start_col, token.end_col, token.kind, token.lexeme)?;
        }
    }
    if args.ast {
        writeln!(out, "{:#?}", compilation.program)?;
    }

    report(&compilation.diagnostics, &source);
    let mut failed = compilation.has_errors();
    let Some(program) = compilation.program else {
        return Ok(ExitCode::FAILURE);
    };
    if failed && !args.partial {
        return Ok(ExitCode::FAILURE);
    }

    let mut interp = Interpreter::with_options(args.interpreter_options());
    interp.load(program);

    loop {
        let result = if args.step { interp.step() } else { interp.resume() };
        flush_output(&mut interp, &mut out)?;
        match result {
            Ok(ExecutionResult::Stepped(index)) => {
                if let Some(stmt) = interp.program().get(index) {
                    eprintln!("step {}: {} | {}", index, stmt.span, stmt.span.excerpt(&source));
                }
            }
            Ok(ExecutionResult::Running) => continue,
            Ok(ExecutionResult::Completed) | Ok(ExecutionResult::Halted) => break,
            Err(err) => {
                report(&[err.to_diagnostic(&source)], &source);
                failed = true;
                break;
            }
        }
    }

    for (name, binding) in script::inspect_bindings(&mut interp) {
        writeln!(out, "{} = {}", name, binding)?;
    }

    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}
