//! Script interpreter with generator-based execution

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use async_recursion::async_recursion;
use genawaiter::rc::{Co, Gen};
use genawaiter::GeneratorState;

use crate::script::ast::{
    AssignOp, BinOp, Expr, ExprKind, FunctionDef, LiteralValue, Program, Stmt, StmtKind, UpdateOp,
};
use crate::script::builtins;
use crate::script::diagnostic::{RuntimeError, RuntimeErrorKind, Span};
use crate::script::environment::{Binding, EnvError, EnvRef, Environment, NodeRef};
use crate::script::value::{apply_binary, apply_unary, Value};

/// How plain assignments and declarations bind names
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BindingPolicy {
    /// Evaluate the right-hand side, then define (`let`) or mutate (`=`)
    #[default]
    Eager,
    /// Bind the unevaluated right-hand side once; evaluate it when the name is read
    Deferred,
}

/// Interpreter configuration
/// Default call nesting limit. Every script call costs several nested polls
/// of the tree walk, so this stays well inside a 2 MiB thread stack in debug
/// builds.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 32;

#[derive(Clone, Debug)]
pub struct InterpreterOptions {
    pub policy: BindingPolicy,
    /// Nested function calls (and deferred reads) allowed before a fault
    pub max_call_depth: usize,
    /// Time spent inside loops before yielding back to the host
    pub frame_budget: Duration,
    pub install_builtins: bool,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            policy: BindingPolicy::Eager,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            frame_budget: Duration::from_millis(16),
            install_builtins: true,
        }
    }
}

/// Lifecycle of a loaded program
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    /// Program loaded, cursor at the first statement
    Ready,
    Running,
    /// All statements executed
    Done,
    /// Stopped by a runtime fault
    Error,
    /// Stopped by the host
    Halted,
}

/// Result of driving the interpreter
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    /// Program ran to the end
    Completed,
    /// Program was stopped by the host
    Halted,
    /// Step mode executed the top-level statement at this index
    Stepped(usize),
    /// Frame budget expired, call again to continue
    Running,
}

/// Why the interpreter yielded control
#[derive(Debug, Clone)]
pub enum YieldReason {
    /// Frame budget used up (every ~16ms)
    FrameBudget,
    /// Step mode finished the statement at this index
    Stepped(usize),
}

/// Control flow out of a statement
#[derive(Debug)]
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// Why evaluation unwound
#[derive(Debug)]
enum Interrupt {
    Error(RuntimeError),
    Halt,
}

impl From<RuntimeError> for Interrupt {
    fn from(err: RuntimeError) -> Self {
        Interrupt::Error(err)
    }
}

type Exec<T> = Result<T, Interrupt>;

fn fault(kind: impl Into<RuntimeErrorKind>, span: Span) -> Interrupt {
    Interrupt::Error(RuntimeError::new(kind.into(), span))
}

/// How a store treats the final name of an assignment target
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BindMode {
    Define,
    Mutate,
    /// Define when absent from the target scope, overwrite otherwise
    Upsert,
}

/// Internal interpreter state, shared between generator and owner
struct InterpreterState {
    globals: EnvRef,
    options: InterpreterOptions,

    // Program state
    cursor: usize,
    run_state: RunState,
    call_depth: usize,
    resolve_depth: usize,

    // I/O
    output: Vec<String>,

    // Execution control
    step_mode: bool,
    stop_requested: bool,
    last_yield_time: Instant,

    // Error state
    error: Option<RuntimeError>,
}

impl InterpreterState {
    fn new(options: InterpreterOptions) -> Self {
        Self {
            globals: fresh_globals(&options),
            options,
            cursor: 0,
            run_state: RunState::Ready,
            call_depth: 0,
            resolve_depth: 0,
            output: Vec::new(),
            step_mode: false,
            stop_requested: false,
            last_yield_time: Instant::now(),
            error: None,
        }
    }

    fn reset(&mut self) {
        self.globals = fresh_globals(&self.options);
        self.cursor = 0;
        self.run_state = RunState::Ready;
        self.call_depth = 0;
        self.resolve_depth = 0;
        self.output.clear();
        self.step_mode = false;
        self.stop_requested = false;
        self.last_yield_time = Instant::now();
        self.error = None;
    }

    fn should_yield_for_frame(&self) -> bool {
        !self.step_mode && self.last_yield_time.elapsed() >= self.options.frame_budget
    }
}

/// Root scope for a run. Natives live one tier above it so scripts may
/// shadow them.
fn fresh_globals(options: &InterpreterOptions) -> EnvRef {
    let natives = Environment::new_root();
    if options.install_builtins {
        for &name in builtins::BUILTINS {
            if let Err(err) = natives.borrow_mut().define(name, Binding::Native(Value::Builtin(name))) {
                log::warn!("builtin not installed: {}", err);
            }
        }
    }
    Environment::new_child(&natives)
}

/// Trait for resumable generators
trait Resumable {
    fn resume_gen(&mut self) -> Option<YieldReason>;
}

/// Wrapper to make Gen implement our Resumable trait
struct GenWrapper<F: std::future::Future<Output = ()>> {
    gen: Gen<YieldReason, (), F>,
}

impl<F: std::future::Future<Output = ()>> Resumable for GenWrapper<F> {
    fn resume_gen(&mut self) -> Option<YieldReason> {
        match self.gen.resume() {
            GeneratorState::Yielded(y) => Some(y),
            GeneratorState::Complete(()) => None,
        }
    }
}

type BoxedGenerator = Box<dyn Resumable>;

/// Tree-walking interpreter with resumable execution
pub struct Interpreter {
    state: Rc<RefCell<InterpreterState>>,
    program: Rc<Program>,
    /// Stored generator for continuation after yield
    generator: Option<BoxedGenerator>,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self::with_options(InterpreterOptions::default())
    }

    pub fn with_options(options: InterpreterOptions) -> Self {
        Self {
            state: Rc::new(RefCell::new(InterpreterState::new(options))),
            program: Rc::new(Program::default()),
            generator: None,
        }
    }

    pub fn options(&self) -> InterpreterOptions {
        self.state.borrow().options.clone()
    }

    /// Load a program and enter `Ready` with a fresh root scope
    pub fn load(&mut self, program: Program) {
        log::debug!("loading program with {} statement(s)", program.len());
        self.program = Rc::new(program);
        self.reset();
    }

    /// Discard all run state, keeping the loaded program
    pub fn reset(&mut self) {
        self.generator = None;
        self.state.borrow_mut().reset();
    }

    /// Load and run a program to completion
    pub fn execute(&mut self, program: Program) -> Result<(), RuntimeError> {
        self.load(program);
        self.run()
    }

    /// Execute exactly the next top-level statement
    pub fn step(&mut self) -> Result<ExecutionResult, RuntimeError> {
        self.state.borrow_mut().step_mode = true;
        self.drive()
    }

    /// Run until the frame budget expires or the program ends
    pub fn resume(&mut self) -> Result<ExecutionResult, RuntimeError> {
        self.state.borrow_mut().step_mode = false;
        self.drive()
    }

    /// Drive to completion. A halted run is not an error.
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            match self.resume()? {
                ExecutionResult::Running | ExecutionResult::Stepped(_) => continue,
                ExecutionResult::Completed | ExecutionResult::Halted => return Ok(()),
            }
        }
    }

    /// Ask a running program to stop at the next statement or loop iteration
    pub fn request_stop(&mut self) {
        self.state.borrow_mut().stop_requested = true;
    }

    /// Stop immediately, keeping the bindings made so far
    pub fn halt(&mut self) {
        self.generator = None;
        let mut s = self.state.borrow_mut();
        // The dropped generator never unwinds its calls
        s.call_depth = 0;
        s.resolve_depth = 0;
        s.stop_requested = true;
        if matches!(s.run_state, RunState::Ready | RunState::Running) {
            s.run_state = RunState::Halted;
        }
    }

    pub fn state(&self) -> RunState {
        self.state.borrow().run_state
    }

    /// Index of the next top-level statement to execute
    pub fn cursor(&self) -> usize {
        self.state.borrow().cursor
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn globals(&self) -> EnvRef {
        self.state.borrow().globals.clone()
    }

    pub fn get(&self, name: &str) -> Option<Binding> {
        self.globals().borrow().get(name)
    }

    pub fn error(&self) -> Option<RuntimeError> {
        self.state.borrow().error.clone()
    }

    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.state.borrow_mut().output)
    }

    /// Value of a root-scope name, evaluating deferred bindings
    pub fn resolve(&mut self, name: &str) -> Result<Option<Value>, RuntimeError> {
        let globals = self.globals();
        let binding = globals.borrow().get(name);
        let Some(binding) = binding else {
            return Ok(None);
        };

        let state = self.state.clone();
        let mut gen = Gen::new(|co: Co<YieldReason>| async move {
            binding_value(&co, &state, &globals, binding, Span::default()).await
        });
        loop {
            match gen.resume() {
                GeneratorState::Yielded(_) => continue,
                GeneratorState::Complete(Ok(value)) => return Ok(Some(value)),
                GeneratorState::Complete(Err(Interrupt::Error(err))) => return Err(err),
                GeneratorState::Complete(Err(Interrupt::Halt)) => return Ok(None),
            }
        }
    }

    fn drive(&mut self) -> Result<ExecutionResult, RuntimeError> {
        let run_state = self.state.borrow().run_state;
        match run_state {
            RunState::Done => return Ok(ExecutionResult::Completed),
            RunState::Halted => return Ok(ExecutionResult::Halted),
            RunState::Error => return Err(self.recorded_error()),
            RunState::Ready | RunState::Running => {}
        }

        if self.generator.is_none() {
            {
                let mut s = self.state.borrow_mut();
                s.run_state = RunState::Running;
                s.last_yield_time = Instant::now();
            }
            let gen = create_execution_generator(self.state.clone(), self.program.clone());
            self.generator = Some(Box::new(GenWrapper { gen }));
        }

        match self.generator.as_mut().and_then(|g| g.resume_gen()) {
            Some(YieldReason::Stepped(pos)) => Ok(ExecutionResult::Stepped(pos)),
            Some(YieldReason::FrameBudget) => Ok(ExecutionResult::Running),
            None => {
                // Generator completed
                self.generator = None;
                let run_state = self.state.borrow().run_state;
                match run_state {
                    RunState::Error => Err(self.recorded_error()),
                    RunState::Halted => Ok(ExecutionResult::Halted),
                    _ => Ok(ExecutionResult::Completed),
                }
            }
        }
    }

    fn recorded_error(&self) -> RuntimeError {
        self.state.borrow().error.clone().unwrap_or_else(|| {
            RuntimeError::new(RuntimeErrorKind::Native("execution failed".to_string()), Span::default())
        })
    }
}

/// Create a generator for program execution (standalone to avoid borrow issues)
fn create_execution_generator(
    state: Rc<RefCell<InterpreterState>>,
    program: Rc<Program>,
) -> Gen<YieldReason, (), impl std::future::Future<Output = ()>> {
    Gen::new(|co: Co<YieldReason>| async move {
        execute_program(&co, &state, &program).await;
    })
}

/// Main program execution loop
async fn execute_program(co: &Co<YieldReason>, state: &Rc<RefCell<InterpreterState>>, program: &Program) {
    let globals = state.borrow().globals.clone();

    loop {
        let pos = state.borrow().cursor;
        let Some(stmt) = program.get(pos) else {
            break;
        };

        if state.borrow().stop_requested {
            state.borrow_mut().run_state = RunState::Halted;
            return;
        }

        log::trace!("statement {} at {}", pos, stmt.span);
        match execute_stmt(co, state, &globals, stmt).await {
            // Misplaced break/continue/return were reported by the parser
            Ok(_) => {}
            Err(Interrupt::Error(err)) => {
                log::debug!("runtime error at {}: {}", err.span, err);
                let mut s = state.borrow_mut();
                s.error = Some(err);
                s.run_state = RunState::Error;
                return;
            }
            Err(Interrupt::Halt) => {
                log::debug!("halted at statement {}", pos);
                state.borrow_mut().run_state = RunState::Halted;
                return;
            }
        }

        state.borrow_mut().cursor = pos + 1;

        let step_mode = state.borrow().step_mode;
        if step_mode {
            co.yield_(YieldReason::Stepped(pos)).await;
        } else if state.borrow().should_yield_for_frame() {
            state.borrow_mut().last_yield_time = Instant::now();
            co.yield_(YieldReason::FrameBudget).await;
        }
    }

    state.borrow_mut().run_state = RunState::Done;
}

/// Stop check and periodic frame yield, called once per loop iteration
async fn frame_tick(co: &Co<YieldReason>, state: &Rc<RefCell<InterpreterState>>) -> Exec<()> {
    if state.borrow().stop_requested {
        return Err(Interrupt::Halt);
    }
    let due = state.borrow().should_yield_for_frame();
    if due {
        state.borrow_mut().last_yield_time = Instant::now();
        co.yield_(YieldReason::FrameBudget).await;
        if state.borrow().stop_requested {
            return Err(Interrupt::Halt);
        }
    }
    Ok(())
}

fn deferred(expr: &Expr) -> Binding {
    Binding::NodeRef(NodeRef::Expr(Rc::new(expr.clone())))
}

/// Bind `name` in `env` according to `mode`
fn bind(env: &EnvRef, name: &str, binding: Binding, mode: BindMode) -> Result<(), EnvError> {
    let mut env = env.borrow_mut();
    let mode = match mode {
        BindMode::Upsert if env.contains_local(name) => BindMode::Mutate,
        BindMode::Upsert => BindMode::Define,
        other => other,
    };
    match (mode, binding) {
        (BindMode::Define, Binding::Scope(child)) => env.define_scope(name, child).map(|_| ()),
        (BindMode::Define, binding) => env.define(name, binding),
        (_, Binding::Scope(child)) => env.mutate_scope(name, child).map(|_| ()),
        (_, binding) => env.mutate(name, binding),
    }
}

/// Bind through a property path such as `a.b.c`, creating missing scopes
/// for every segment but the last.
fn bind_path(env: &EnvRef, path: &[&str], binding: Binding, mode: BindMode, span: Span) -> Exec<()> {
    let Some((last, prefix)) = path.split_last() else {
        return Ok(());
    };

    let mut scope = env.clone();
    for (i, segment) in prefix.iter().enumerate() {
        // The root segment is looked up through the chain, later ones inside their scope
        let existing = if i == 0 {
            scope.borrow().get(segment)
        } else {
            scope.borrow().get_local(segment)
        };
        let next = match existing {
            Some(Binding::Scope(inner)) => inner,
            None => {
                log::trace!("creating scope '{}'", path[..=i].join("."));
                let created = scope.borrow_mut().define_scope(segment, Environment::new_root());
                created.map_err(|err| fault(err, span))?
            }
            Some(_) => {
                return Err(fault(
                    RuntimeErrorKind::TypeMismatch(format!("'{}' is not a scope", path[..=i].join("."))),
                    span,
                ))
            }
        };
        scope = next;
    }

    bind(&scope, last, binding, mode).map_err(|err| fault(err, span))
}

fn checked_index(index: f64, len: usize, span: Span) -> Exec<usize> {
    if !index.is_finite() || index != index.trunc() {
        return Err(fault(RuntimeErrorKind::TypeMismatch(format!("index {} is not an integer", index)), span));
    }
    if index < 0.0 || index >= len as f64 {
        return Err(fault(RuntimeErrorKind::IndexOutOfBounds { index, len }, span));
    }
    Ok(index as usize)
}

/// Execute a single statement
#[async_recursion(?Send)]
async fn execute_stmt(
    co: &Co<YieldReason>,
    state: &Rc<RefCell<InterpreterState>>,
    env: &EnvRef,
    stmt: &Stmt,
) -> Exec<Flow> {
    match &stmt.kind {
        StmtKind::Let { name, value } => {
            let policy = state.borrow().options.policy;
            let binding = match (policy, value) {
                (_, None) => Binding::Native(Value::Null),
                (BindingPolicy::Deferred, Some(expr)) => deferred(expr),
                (BindingPolicy::Eager, Some(expr)) => Binding::from_value(eval_expr(co, state, env, expr).await?),
            };
            bind(env, name, binding, BindMode::Define).map_err(|err| fault(err, stmt.span))?;
            Ok(Flow::Normal)
        }

        StmtKind::Expression(expr) => {
            eval_expr(co, state, env, expr).await?;
            Ok(Flow::Normal)
        }

        StmtKind::Block(block) => {
            let inner = Environment::new_child(env);
            execute_statements(co, state, &inner, &block.statements).await
        }

        StmtKind::If { condition, then_branch, else_branch } => {
            if eval_expr(co, state, env, condition).await?.is_truthy() {
                execute_stmt(co, state, env, then_branch).await
            } else if let Some(else_branch) = else_branch {
                execute_stmt(co, state, env, else_branch).await
            } else {
                Ok(Flow::Normal)
            }
        }

        StmtKind::Switch { subject, cases } => {
            let subject = eval_expr(co, state, env, subject).await?;
            let switch_env = Environment::new_child(env);

            let mut start = None;
            for (i, case) in cases.iter().enumerate() {
                if let Some(test) = &case.test {
                    if eval_expr(co, state, &switch_env, test).await?.equals(&subject) {
                        start = Some(i);
                        break;
                    }
                }
            }
            let Some(start) = start.or_else(|| cases.iter().position(|case| case.test.is_none())) else {
                return Ok(Flow::Normal);
            };

            // Fall through every following clause until a break
            for case in &cases[start..] {
                match execute_statements(co, state, &switch_env, &case.body).await? {
                    Flow::Normal => {}
                    Flow::Break => break,
                    other => return Ok(other),
                }
            }
            Ok(Flow::Normal)
        }

        StmtKind::While { condition, body } => {
            while eval_expr(co, state, env, condition).await?.is_truthy() {
                let iteration = Environment::new_child(env);
                match execute_body(co, state, &iteration, body).await? {
                    Flow::Break => break,
                    Flow::Return(value) => return Ok(Flow::Return(value)),
                    Flow::Normal | Flow::Continue => {}
                }
                frame_tick(co, state).await?;
            }
            Ok(Flow::Normal)
        }

        StmtKind::DoWhile { body, condition } => {
            loop {
                let iteration = Environment::new_child(env);
                match execute_body(co, state, &iteration, body).await? {
                    Flow::Break => break,
                    Flow::Return(value) => return Ok(Flow::Return(value)),
                    Flow::Normal | Flow::Continue => {}
                }
                frame_tick(co, state).await?;
                if !eval_expr(co, state, env, condition).await?.is_truthy() {
                    break;
                }
            }
            Ok(Flow::Normal)
        }

        StmtKind::For { init, condition, update, body } => {
            let loop_env = Environment::new_child(env);
            if let Some(init) = init {
                execute_stmt(co, state, &loop_env, init).await?;
            }

            loop {
                if let Some(condition) = condition {
                    if !eval_expr(co, state, &loop_env, condition).await?.is_truthy() {
                        break;
                    }
                }
                let iteration = Environment::new_child(&loop_env);
                match execute_body(co, state, &iteration, body).await? {
                    Flow::Break => break,
                    Flow::Return(value) => return Ok(Flow::Return(value)),
                    Flow::Normal | Flow::Continue => {}
                }
                if let Some(update) = update {
                    eval_expr(co, state, &loop_env, update).await?;
                }
                frame_tick(co, state).await?;
            }
            Ok(Flow::Normal)
        }

        StmtKind::ForIn { binding, iterable, body } => {
            let items: Vec<Value> = match eval_expr(co, state, env, iterable).await? {
                Value::Array(items) => {
                    let snapshot = items.borrow().clone();
                    snapshot
                }
                Value::String(s) => s.chars().map(|c| Value::String(c.to_string())).collect(),
                Value::Scope(scope) => {
                    let names = scope.borrow().bindings();
                    names.into_iter().map(|(name, _)| Value::String(name)).collect()
                }
                other => {
                    return Err(fault(
                        RuntimeErrorKind::TypeMismatch(format!("cannot iterate over {}", other.type_name())),
                        iterable.span,
                    ))
                }
            };

            for item in items {
                let iteration = Environment::new_child(env);
                bind(&iteration, binding, Binding::from_value(item), BindMode::Define)
                    .map_err(|err| fault(err, stmt.span))?;
                match execute_body(co, state, &iteration, body).await? {
                    Flow::Break => break,
                    Flow::Return(value) => return Ok(Flow::Return(value)),
                    Flow::Normal | Flow::Continue => {}
                }
                frame_tick(co, state).await?;
            }
            Ok(Flow::Normal)
        }

        StmtKind::FunctionDef(def) => {
            let binding = Binding::NodeRef(NodeRef::Function(def.clone()));
            bind(env, &def.name, binding, BindMode::Define).map_err(|err| fault(err, stmt.span))?;
            Ok(Flow::Normal)
        }

        StmtKind::Return(value) => {
            let value = match value {
                Some(expr) => eval_expr(co, state, env, expr).await?,
                None => Value::Null,
            };
            Ok(Flow::Return(value))
        }

        StmtKind::Break => Ok(Flow::Break),

        StmtKind::Continue => Ok(Flow::Continue),
    }
}

/// Execute statements in order, stopping at the first non-normal flow
#[async_recursion(?Send)]
async fn execute_statements(
    co: &Co<YieldReason>,
    state: &Rc<RefCell<InterpreterState>>,
    env: &EnvRef,
    statements: &[Stmt],
) -> Exec<Flow> {
    for stmt in statements {
        match execute_stmt(co, state, env, stmt).await? {
            Flow::Normal => {}
            other => return Ok(other),
        }
    }
    Ok(Flow::Normal)
}

/// Execute a loop body in its iteration scope; a block body does not open another one
#[async_recursion(?Send)]
async fn execute_body(
    co: &Co<YieldReason>,
    state: &Rc<RefCell<InterpreterState>>,
    iteration: &EnvRef,
    body: &Stmt,
) -> Exec<Flow> {
    match &body.kind {
        StmtKind::Block(block) => execute_statements(co, state, iteration, &block.statements).await,
        _ => execute_stmt(co, state, iteration, body).await,
    }
}

/// Evaluate an expression
#[async_recursion(?Send)]
async fn eval_expr(
    co: &Co<YieldReason>,
    state: &Rc<RefCell<InterpreterState>>,
    env: &EnvRef,
    expr: &Expr,
) -> Exec<Value> {
    match &expr.kind {
        ExprKind::Literal(literal) => Ok(match literal {
            LiteralValue::Number(n) => Value::Number(*n),
            LiteralValue::String(s) => Value::String(s.clone()),
            LiteralValue::Bool(b) => Value::Bool(*b),
            LiteralValue::Null => Value::Null,
        }),

        ExprKind::Array(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval_expr(co, state, env, item).await?);
            }
            Ok(Value::array(values))
        }

        ExprKind::Identifier(name) => {
            let binding = env.borrow().get(name);
            match binding {
                Some(binding) => binding_value(co, state, env, binding, expr.span).await,
                None => Err(fault(RuntimeErrorKind::Undefined(name.clone()), expr.span)),
            }
        }

        ExprKind::Unary { op, operand } => {
            let value = eval_expr(co, state, env, operand).await?;
            apply_unary(*op, &value).map_err(|kind| fault(kind, expr.span))
        }

        ExprKind::Binary { op: BinOp::And, left, right } => {
            let left = eval_expr(co, state, env, left).await?;
            if left.is_truthy() {
                eval_expr(co, state, env, right).await
            } else {
                Ok(left)
            }
        }

        ExprKind::Binary { op: BinOp::Or, left, right } => {
            let left = eval_expr(co, state, env, left).await?;
            if left.is_truthy() {
                Ok(left)
            } else {
                eval_expr(co, state, env, right).await
            }
        }

        ExprKind::Binary { op, left, right } => {
            let left = eval_expr(co, state, env, left).await?;
            let right = eval_expr(co, state, env, right).await?;
            apply_binary(*op, &left, &right).map_err(|kind| fault(kind, expr.span))
        }

        ExprKind::Update { op, target } => {
            let (symbol, delta) = match op {
                UpdateOp::Increment => ("++", 1.0),
                UpdateOp::Decrement => ("--", -1.0),
            };
            let Value::Number(n) = eval_expr(co, state, env, target).await? else {
                return Err(fault(
                    RuntimeErrorKind::TypeMismatch(format!("'{}' needs a number", symbol)),
                    expr.span,
                ));
            };
            let updated = n + delta;
            store(co, state, env, target, Value::Number(updated), BindMode::Mutate).await?;
            // Postfix: the old value
            Ok(Value::Number(n))
        }

        ExprKind::Assignment { op, target, value } => assign(co, state, env, *op, target, value, expr.span).await,

        ExprKind::PropertyAccess { object, property } => {
            let object = eval_expr(co, state, env, object).await?;
            match object {
                Value::Scope(scope) => {
                    let binding = scope.borrow().get_local(property);
                    match binding {
                        Some(binding) => binding_value(co, state, env, binding, expr.span).await,
                        None => Err(fault(RuntimeErrorKind::Undefined(property.clone()), expr.span)),
                    }
                }
                Value::Array(items) if property == "length" => {
                    let len = items.borrow().len();
                    Ok(Value::Number(len as f64))
                }
                Value::String(s) if property == "length" => Ok(Value::Number(s.chars().count() as f64)),
                other => Err(fault(
                    RuntimeErrorKind::TypeMismatch(format!("{} has no property '{}'", other.type_name(), property)),
                    expr.span,
                )),
            }
        }

        ExprKind::Index { object, index } => {
            let object = eval_expr(co, state, env, object).await?;
            let index = eval_expr(co, state, env, index).await?;
            match (&object, &index) {
                (Value::Array(items), Value::Number(n)) => {
                    let items = items.borrow();
                    let i = checked_index(*n, items.len(), expr.span)?;
                    let item = items[i].clone();
                    Ok(item)
                }
                (Value::String(s), Value::Number(n)) => {
                    let i = checked_index(*n, s.chars().count(), expr.span)?;
                    Ok(Value::String(s.chars().skip(i).take(1).collect()))
                }
                (Value::Scope(scope), Value::String(key)) => {
                    let binding = scope.borrow().get_local(key);
                    match binding {
                        Some(binding) => binding_value(co, state, env, binding, expr.span).await,
                        None => Err(fault(RuntimeErrorKind::Undefined(key.clone()), expr.span)),
                    }
                }
                _ => Err(fault(
                    RuntimeErrorKind::TypeMismatch(format!(
                        "cannot index {} with {}",
                        object.type_name(),
                        index.type_name()
                    )),
                    expr.span,
                )),
            }
        }

        ExprKind::Call { callee, args } => {
            let callee = eval_expr(co, state, env, callee).await?;
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_expr(co, state, env, arg).await?);
            }
            match callee {
                Value::Function(def) => call_function(co, state, &def, values, expr.span).await,
                Value::Builtin(name) => builtins::call_builtin(name, &values, &mut state.borrow_mut().output)
                    .map_err(|kind| fault(kind, expr.span)),
                other => Err(fault(
                    RuntimeErrorKind::TypeMismatch(format!("{} is not callable", other.type_name())),
                    expr.span,
                )),
            }
        }
    }
}

/// Value of a binding; deferred expressions are evaluated in the reading scope
#[async_recursion(?Send)]
async fn binding_value(
    co: &Co<YieldReason>,
    state: &Rc<RefCell<InterpreterState>>,
    env: &EnvRef,
    binding: Binding,
    span: Span,
) -> Exec<Value> {
    match binding {
        Binding::Native(value) => Ok(value),
        Binding::Scope(scope) => Ok(Value::Scope(scope)),
        Binding::NodeRef(NodeRef::Function(def)) => Ok(Value::Function(def)),
        Binding::NodeRef(NodeRef::Expr(expr)) => {
            let (depth, limit) = {
                let s = state.borrow();
                (s.resolve_depth, s.options.max_call_depth)
            };
            if depth >= limit {
                return Err(fault(RuntimeErrorKind::CallDepthExceeded(limit), span));
            }
            state.borrow_mut().resolve_depth += 1;
            let result = eval_expr(co, state, env, &expr).await;
            state.borrow_mut().resolve_depth -= 1;
            result
        }
    }
}

/// Call a script function in a fresh scope whose parent is the root scope
#[async_recursion(?Send)]
async fn call_function(
    co: &Co<YieldReason>,
    state: &Rc<RefCell<InterpreterState>>,
    def: &FunctionDef,
    args: Vec<Value>,
    span: Span,
) -> Exec<Value> {
    if args.len() != def.params.len() {
        return Err(fault(
            RuntimeErrorKind::Arity { name: def.name.clone(), expected: def.params.len(), found: args.len() },
            span,
        ));
    }

    let (globals, depth, limit) = {
        let s = state.borrow();
        (s.globals.clone(), s.call_depth, s.options.max_call_depth)
    };
    if depth >= limit {
        return Err(fault(RuntimeErrorKind::CallDepthExceeded(limit), span));
    }

    let call_env = Environment::new_child(&globals);
    for (param, arg) in def.params.iter().zip(args) {
        bind(&call_env, param, Binding::from_value(arg), BindMode::Define).map_err(|err| fault(err, span))?;
    }

    log::trace!("call {} at depth {}", def.name, depth + 1);
    state.borrow_mut().call_depth += 1;
    let result = execute_statements(co, state, &call_env, &def.body.statements).await;
    state.borrow_mut().call_depth -= 1;

    match result? {
        Flow::Return(value) => Ok(value),
        _ => Ok(Value::Null),
    }
}

/// Evaluate an assignment and return the stored value
#[async_recursion(?Send)]
async fn assign(
    co: &Co<YieldReason>,
    state: &Rc<RefCell<InterpreterState>>,
    env: &EnvRef,
    op: AssignOp,
    target: &Expr,
    value: &Expr,
    span: Span,
) -> Exec<Value> {
    let policy = state.borrow().options.policy;
    let path = target.property_path();

    if op == AssignOp::Assign && policy == BindingPolicy::Deferred {
        if let Some(path) = &path {
            bind_path(env, path, deferred(value), BindMode::Define, span)?;
            return Ok(Value::Null);
        }
    }

    let new_value = match op {
        AssignOp::Assign => eval_expr(co, state, env, value).await?,
        AssignOp::Compound(bin) => {
            let current = eval_expr(co, state, env, target).await?;
            let rhs = eval_expr(co, state, env, value).await?;
            apply_binary(bin, &current, &rhs).map_err(|kind| fault(kind, span))?
        }
    };

    // `x = e` requires an existing `x`; `a.b = e` creates or overwrites `b`
    let mode = match (op, &path) {
        (AssignOp::Assign, Some(path)) if path.len() > 1 => BindMode::Upsert,
        _ => BindMode::Mutate,
    };
    store(co, state, env, target, new_value.clone(), mode).await?;
    Ok(new_value)
}

/// Write `value` into an assignment target
#[async_recursion(?Send)]
async fn store(
    co: &Co<YieldReason>,
    state: &Rc<RefCell<InterpreterState>>,
    env: &EnvRef,
    target: &Expr,
    value: Value,
    mode: BindMode,
) -> Exec<()> {
    if let Some(path) = target.property_path() {
        return bind_path(env, &path, Binding::from_value(value), mode, target.span);
    }

    let ExprKind::Index { object, index } = &target.kind else {
        return Err(fault(
            RuntimeErrorKind::TypeMismatch("invalid assignment target".to_string()),
            target.span,
        ));
    };
    let object = eval_expr(co, state, env, object).await?;
    let index = eval_expr(co, state, env, index).await?;
    match (&object, &index) {
        (Value::Array(items), Value::Number(n)) => {
            let mut items = items.borrow_mut();
            let i = checked_index(*n, items.len(), target.span)?;
            items[i] = value;
            Ok(())
        }
        (Value::Scope(scope), Value::String(key)) => {
            bind(scope, key, Binding::from_value(value), BindMode::Upsert).map_err(|err| fault(err, target.span))
        }
        _ => Err(fault(
            RuntimeErrorKind::TypeMismatch(format!(
                "cannot assign into {} with {} index",
                object.type_name(),
                index.type_name()
            )),
            target.span,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::lexer::lex;
    use crate::script::parser::parse;

    fn compile(code: &str) -> Result<Program, String> {
        let (tokens, lex_errors) = lex(code);
        if let Some(err) = lex_errors.first() {
            return Err(format!("{}: {}", err.span, err));
        }
        let (program, errors) = parse(tokens);
        if let Some(err) = errors.first() {
            return Err(format!("{}: {}", err.span, err));
        }
        Ok(program.unwrap_or_default())
    }

    fn run_with(code: &str, options: InterpreterOptions) -> Result<Interpreter, String> {
        let mut interp = Interpreter::with_options(options);
        interp.execute(compile(code)?).map_err(|e| format!("{}: {}", e.span, e))?;
        Ok(interp)
    }

    fn run(code: &str) -> Result<Interpreter, String> {
        run_with(code, InterpreterOptions::default())
    }

    fn run_err_with(code: &str, options: InterpreterOptions) -> RuntimeError {
        let mut interp = Interpreter::with_options(options);
        match interp.execute(compile(code).expect("Should parse")) {
            Ok(()) => panic!("expected a runtime error"),
            Err(err) => {
                assert_eq!(interp.state(), RunState::Error);
                err
            }
        }
    }

    fn run_err(code: &str) -> RuntimeError {
        run_err_with(code, InterpreterOptions::default())
    }

    fn value(interp: &mut Interpreter, name: &str) -> Value {
        match interp.resolve(name) {
            Ok(Some(value)) => value,
            other => panic!("'{}' did not resolve: {:?}", name, other),
        }
    }

    fn number(interp: &mut Interpreter, name: &str) -> f64 {
        match value(interp, name) {
            Value::Number(n) => n,
            other => panic!("'{}' is not a number: {}", name, other),
        }
    }

    fn text(interp: &mut Interpreter, name: &str) -> String {
        value(interp, name).to_string()
    }

    fn deferred_options() -> InterpreterOptions {
        InterpreterOptions { policy: BindingPolicy::Deferred, ..InterpreterOptions::default() }
    }

    #[test]
    fn test_let_arithmetic() {
        let mut interp = run("let x = 1 + 2 * 3;").expect("Should run");
        assert_eq!(number(&mut interp, "x"), 7.0);
        assert_eq!(interp.state(), RunState::Done);

        let mut interp = run_with("let x = 1 + 2 * 3;", deferred_options()).expect("Should run");
        assert_eq!(number(&mut interp, "x"), 7.0);
    }

    #[test]
    fn test_prefix_minus_binds_before_power() {
        let mut interp = run("let x = -2 ** 2;\nlet y = 2 ** -1;\nlet z = 2 ** 3 ** 2;").expect("Should run");
        assert_eq!(number(&mut interp, "x"), 4.0);
        assert_eq!(number(&mut interp, "y"), 0.5);
        assert_eq!(number(&mut interp, "z"), 512.0);
    }

    #[test]
    fn test_print() {
        let mut interp = run("print(\"hello\", 1 + 1);\nprint([1, \"a\"]);").expect("Should run");
        assert_eq!(interp.take_output(), vec!["hello 2", "[1, \"a\"]"]);
        assert!(interp.take_output().is_empty());
    }

    #[test]
    fn test_while_loop() {
        let mut interp = run("let i = 0; let total = 0; while i < 5 { total += i; i++; }").expect("Should run");
        assert_eq!(number(&mut interp, "total"), 10.0);
        assert_eq!(number(&mut interp, "i"), 5.0);
    }

    #[test]
    fn test_for_loops() {
        let code = r#"
let sum = 0;
for (let i = 1; i <= 3; i++) { sum += i; }
for x in [10, 20] { sum += x; }
let reversed = "";
for (ch in "abc") reversed = ch + reversed;
"#;
        let mut interp = run(code).expect("Should run");
        assert_eq!(number(&mut interp, "sum"), 36.0);
        assert_eq!(text(&mut interp, "reversed"), "cba");
        assert!(interp.get("i").is_none());
        assert!(interp.get("x").is_none());
    }

    #[test]
    fn test_break_and_continue() {
        let code = r#"
let out = "";
for (let i = 0; i < 10; i++) {
    if i == 2 { continue; }
    if i == 5 { break; }
    out += i;
}
let n = 0;
do { n++; } while n < 3;
"#;
        let mut interp = run(code).expect("Should run");
        assert_eq!(text(&mut interp, "out"), "0134");
        assert_eq!(number(&mut interp, "n"), 3.0);
    }

    #[test]
    fn test_loop_iterations_get_fresh_scopes() {
        let code = r#"
let count = 0;
while count < 3 {
    let local = count * 2;
    count++;
}
"#;
        let mut interp = run(code).expect("redeclaring inside each iteration is fine");
        assert_eq!(number(&mut interp, "count"), 3.0);
        assert!(interp.get("local").is_none());
    }

    #[test]
    fn test_switch_fallthrough() {
        let code = r#"
fn classify(n) {
    let r = "";
    switch n {
        case 1: r += "one";
        case 2: r += "two"; break;
        case 3: r += "three";
        default: r += "other";
    }
    return r;
}
let a = classify(1);
let b = classify(2);
let c = classify(3);
let d = classify(9);
"#;
        let mut interp = run(code).expect("Should run");
        assert_eq!(text(&mut interp, "a"), "onetwo");
        assert_eq!(text(&mut interp, "b"), "two");
        assert_eq!(text(&mut interp, "c"), "threeother");
        assert_eq!(text(&mut interp, "d"), "other");
    }

    #[test]
    fn test_recursion() {
        let code = "fn fib(n) { if n < 2 { return n; } return fib(n - 1) + fib(n - 2); }\nlet f = fib(10);";
        let mut interp = run(code).expect("Should run");
        assert_eq!(number(&mut interp, "f"), 55.0);
        assert!(matches!(interp.get("fib"), Some(Binding::NodeRef(NodeRef::Function(_)))));
    }

    #[test]
    fn test_calls_see_root_scope_not_caller() {
        let code = r#"
let g = 1;
fn read() { return g; }
fn shadow() { let g = 2; return read(); }
let r = shadow();
"#;
        let mut interp = run(code).expect("Should run");
        assert_eq!(number(&mut interp, "r"), 1.0);
    }

    #[test]
    fn test_call_faults() {
        let err = run_err("fn f(a) { return a; }\nf();");
        assert_eq!(err.kind, RuntimeErrorKind::Arity { name: "f".to_string(), expected: 1, found: 0 });
        assert_eq!(err.span.line, 2);

        let options = InterpreterOptions { max_call_depth: 20, ..InterpreterOptions::default() };
        let err = run_err_with("fn r(n) { return r(n + 1); }\nr(0);", options);
        assert_eq!(err.kind, RuntimeErrorKind::CallDepthExceeded(20));

        let err = run_err("let n = 3; n();");
        assert!(matches!(err.kind, RuntimeErrorKind::TypeMismatch(_)));
    }

    #[test]
    fn test_runtime_error_keeps_partial_state() {
        let mut interp = Interpreter::new();
        let result = interp.execute(compile("let a = 1;\nlet b = a / 0;\nlet c = 3;").unwrap());
        let err = result.unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::DivisionByZero);
        assert_eq!(err.span, Span::new(2, 9, 14));
        assert_eq!(interp.state(), RunState::Error);
        assert_eq!(interp.cursor(), 1);
        assert_eq!(number(&mut interp, "a"), 1.0);
        assert!(interp.get("c").is_none());
        assert_eq!(interp.resume().unwrap_err(), err);
    }

    #[test]
    fn test_name_faults() {
        assert_eq!(run_err("x = 1;").kind, RuntimeErrorKind::NotDefined("x".to_string()));
        assert_eq!(run_err("let y = z;").kind, RuntimeErrorKind::Undefined("z".to_string()));
        assert_eq!(run_err("fn f() {}\nfn f() {}").kind, RuntimeErrorKind::AlreadyDefined("f".to_string()));

        let mut interp = Interpreter::new();
        let err = interp.execute(compile("let x = 1;\nlet x = 2;").unwrap()).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::AlreadyDefined("x".to_string()));
        assert_eq!(number(&mut interp, "x"), 1.0);

        let mut interp = run("let x = 1; { let x = 2; x = 3; }").expect("shadowing is allowed");
        assert_eq!(number(&mut interp, "x"), 1.0);
    }

    #[test]
    fn test_deferred_policy() {
        let code = r#"
let a = 1;
let b = a + 1;
total = x * 2;
fn calc() { let x = 21; return total; }
let r = calc();
"#;
        let mut interp = run_with(code, deferred_options()).expect("Should run");
        assert!(matches!(interp.get("b"), Some(Binding::NodeRef(NodeRef::Expr(_)))));
        assert_eq!(number(&mut interp, "b"), 2.0);
        // Evaluated where it is read, inside calc()
        assert_eq!(number(&mut interp, "r"), 42.0);

        let err = run_err_with("c = 5;\nc = 6;", deferred_options());
        assert_eq!(err.kind, RuntimeErrorKind::AlreadyDefined("c".to_string()));
        assert_eq!(err.span.line, 2);
    }

    #[test]
    fn test_deferred_self_reference_is_bounded() {
        let options = InterpreterOptions { max_call_depth: 16, ..deferred_options() };
        let mut interp = run_with("x = x + 1;", options).expect("binding does not evaluate");
        let err = interp.resolve("x").unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::CallDepthExceeded(16));
    }

    #[test]
    fn test_property_scopes() {
        let code = r#"
point.x = 1;
point.y = 2;
point.x += 10;
let px = point.x;
let has = "y" in point;
let kind = point instanceof "scope";
a.b.c = 3;
let deep = a.b.c + a["b"].c;
"#;
        let mut interp = run(code).expect("Should run");
        assert_eq!(number(&mut interp, "px"), 11.0);
        assert!(value(&mut interp, "has").is_truthy());
        assert!(value(&mut interp, "kind").is_truthy());
        assert_eq!(number(&mut interp, "deep"), 6.0);
        assert_eq!(text(&mut interp, "point"), "{x: 11, y: 2}");
        match interp.get("a") {
            Some(Binding::Scope(a)) => assert!(a.borrow().contains_local("b")),
            other => panic!("expected scope, got {:?}", other),
        }

        let err = run_err("let n = 5;\nn.m = 1;");
        assert_eq!(err.kind, RuntimeErrorKind::TypeMismatch("'n' is not a scope".to_string()));

        let err = run_err_with("p.q = 1;\np.q = 2;", deferred_options());
        assert_eq!(err.kind, RuntimeErrorKind::AlreadyDefined("q".to_string()));
    }

    #[test]
    fn test_arrays_and_strings() {
        let code = r#"
let xs = [1, 2, 3];
xs[0] = 10;
xs[1] += 5;
let n = len(xs) + xs.length;
let s = "abc"[1];
let both = [1] + [2];
let shared = xs;
shared[2] = 0;
"#;
        let mut interp = run(code).expect("Should run");
        assert_eq!(text(&mut interp, "xs"), "[10, 7, 0]");
        assert_eq!(number(&mut interp, "n"), 6.0);
        assert_eq!(text(&mut interp, "s"), "b");
        assert_eq!(text(&mut interp, "both"), "[1, 2]");

        let err = run_err("let xs = [1, 2, 3];\nlet y = xs[3];");
        assert_eq!(err.kind, RuntimeErrorKind::IndexOutOfBounds { index: 3.0, len: 3 });
        assert_eq!(err.span, Span::new(2, 9, 14));
    }

    #[test]
    fn test_logical_operators_short_circuit() {
        let code = r#"
let calls = 0;
fn bump() { calls++; return true; }
let r1 = false && bump();
let r2 = true || bump();
let r3 = 0 || "fallback";
let r4 = 1 and bump();
"#;
        let mut interp = run(code).expect("Should run");
        assert_eq!(number(&mut interp, "calls"), 1.0);
        assert_eq!(text(&mut interp, "r1"), "false");
        assert_eq!(text(&mut interp, "r2"), "true");
        assert_eq!(text(&mut interp, "r3"), "fallback");
        assert_eq!(text(&mut interp, "r4"), "true");
    }

    #[test]
    fn test_step_mode() {
        let mut interp = Interpreter::new();
        interp.load(compile("let a = 1;\nlet b = 2;\nlet c = a + b;").unwrap());
        assert_eq!(interp.state(), RunState::Ready);

        assert_eq!(interp.step(), Ok(ExecutionResult::Stepped(0)));
        assert_eq!(interp.state(), RunState::Running);
        assert_eq!(interp.cursor(), 1);
        assert!(interp.get("a").is_some());
        assert!(interp.get("b").is_none());

        assert_eq!(interp.step(), Ok(ExecutionResult::Stepped(1)));
        assert_eq!(interp.step(), Ok(ExecutionResult::Stepped(2)));
        assert_eq!(interp.step(), Ok(ExecutionResult::Completed));
        assert_eq!(interp.state(), RunState::Done);
        assert_eq!(number(&mut interp, "c"), 3.0);
    }

    #[test]
    fn test_frame_budget_yields_inside_loops() {
        let options = InterpreterOptions { frame_budget: Duration::ZERO, ..InterpreterOptions::default() };
        let mut interp = Interpreter::with_options(options);
        interp.load(compile("let i = 0; while i < 3 { i++; }").unwrap());

        let mut frames = 0;
        loop {
            match interp.resume() {
                Ok(ExecutionResult::Running) => frames += 1,
                Ok(ExecutionResult::Completed) => break,
                other => panic!("unexpected result {:?}", other),
            }
        }
        assert!(frames >= 3);
        assert_eq!(number(&mut interp, "i"), 3.0);
    }

    #[test]
    fn test_stop_and_halt() {
        let options = InterpreterOptions { frame_budget: Duration::ZERO, ..InterpreterOptions::default() };
        let mut interp = Interpreter::with_options(options.clone());
        interp.load(compile("let i = 0; while true { i++; }").unwrap());
        assert_eq!(interp.resume(), Ok(ExecutionResult::Running));
        assert_eq!(interp.resume(), Ok(ExecutionResult::Running));
        interp.request_stop();
        assert_eq!(interp.resume(), Ok(ExecutionResult::Halted));
        assert_eq!(interp.state(), RunState::Halted);
        assert!(number(&mut interp, "i") >= 1.0);
        assert_eq!(interp.run(), Ok(()));
        assert_eq!(interp.state(), RunState::Halted);

        let mut interp = Interpreter::with_options(options);
        interp.load(compile("let a = 1;\nlet b = 2;").unwrap());
        interp.step().unwrap();
        interp.halt();
        assert_eq!(interp.state(), RunState::Halted);
        assert!(interp.get("a").is_some());
        assert!(interp.get("b").is_none());
    }

    #[test]
    fn test_reset_and_builtins() {
        let mut interp = run("let x = 1; print(x);").expect("Should run");
        interp.reset();
        assert_eq!(interp.state(), RunState::Ready);
        assert!(interp.get("x").is_none());
        assert!(interp.take_output().is_empty());
        interp.run().unwrap();
        assert_eq!(number(&mut interp, "x"), 1.0);

        let options = InterpreterOptions { install_builtins: false, ..InterpreterOptions::default() };
        let err = run_err_with("print(1);", options);
        assert_eq!(err.kind, RuntimeErrorKind::Undefined("print".to_string()));
    }

    #[test]
    fn test_builtins_can_be_shadowed() {
        let mut interp = run("let len = 3;\nfn print(x) { return x * 2; }\nlet y = print(len);").expect("Should run");
        assert_eq!(number(&mut interp, "len"), 3.0);
        assert_eq!(number(&mut interp, "y"), 6.0);
        assert!(interp.take_output().is_empty());
        assert!(matches!(interp.get("print"), Some(Binding::NodeRef(NodeRef::Function(_)))));

        // Natives stay visible from function bodies, and never show up in the root tier
        let mut interp = run("fn size(xs) { return len(xs); }\nlet n = size([1, 2]);").expect("Should run");
        assert_eq!(number(&mut interp, "n"), 2.0);
        assert!(!interp.globals().borrow().contains_local("len"));
        assert!(interp.get("len").is_some());
    }

    #[test]
    fn test_default_call_depth_fits_the_stack() {
        let code = |n: usize| format!("fn r(n) {{ if n == 0 {{ return 0; }} return r(n - 1) + 1; }}\nlet x = r({});", n);

        let mut interp = run(&code(DEFAULT_MAX_CALL_DEPTH - 1)).expect("Should run");
        assert_eq!(number(&mut interp, "x"), (DEFAULT_MAX_CALL_DEPTH - 1) as f64);

        let err = run_err(&code(DEFAULT_MAX_CALL_DEPTH));
        assert_eq!(err.kind, RuntimeErrorKind::CallDepthExceeded(DEFAULT_MAX_CALL_DEPTH));
    }

    #[test]
    fn test_halt_inside_a_call_clears_call_depth() {
        let options = InterpreterOptions { frame_budget: Duration::ZERO, max_call_depth: 1, ..deferred_options() };
        let mut interp = Interpreter::with_options(options);
        interp.load(compile("fn one() { return 1; }\nlet v = one();\nfn spin() { while true { } }\nspin();").unwrap());
        // Three definitions, then the first loop iteration inside spin()
        for _ in 0..4 {
            assert_eq!(interp.resume(), Ok(ExecutionResult::Running));
        }
        assert_eq!(interp.cursor(), 3);
        assert_eq!(interp.state.borrow().call_depth, 1);

        interp.halt();
        assert_eq!(interp.state(), RunState::Halted);
        assert_eq!(interp.state.borrow().call_depth, 0);
        assert_eq!(interp.resolve("v").map(|v| v.map(|v| v.to_string())), Ok(Some("1".to_string())));
    }
}
