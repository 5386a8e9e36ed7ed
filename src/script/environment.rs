//! Chained name-binding scopes

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use crate::script::ast::{Expr, FunctionDef};
use crate::script::diagnostic::RuntimeErrorKind;
use crate::script::value::Value;

/// Shared handle to an environment
pub type EnvRef = Rc<RefCell<Environment>>;

/// Unevaluated syntax tree bound to a name
#[derive(Clone, Debug)]
pub enum NodeRef {
    /// Right-hand side of a deferred assignment, evaluated on read
    Expr(Rc<Expr>),
    Function(Rc<FunctionDef>),
}

/// What a name is bound to
#[derive(Clone, Debug)]
pub enum Binding {
    Native(Value),
    NodeRef(NodeRef),
    Scope(EnvRef),
}

impl Binding {
    /// Binding that stores `value`, keeping scope handles as nested scopes
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Scope(scope) => Binding::Scope(scope),
            other => Binding::Native(other),
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Native(value) => write!(f, "{}", value),
            Binding::Scope(scope) => write!(f, "{}", Value::Scope(scope.clone())),
            Binding::NodeRef(NodeRef::Function(def)) => write!(f, "<fn {}>", def.name),
            Binding::NodeRef(NodeRef::Expr(_)) => write!(f, "<deferred>"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EnvError {
    #[error("'{0}' is already defined in this scope")]
    AlreadyDefined(String),
    #[error("'{0}' is not defined")]
    NotDefined(String),
}

impl From<EnvError> for RuntimeErrorKind {
    fn from(err: EnvError) -> Self {
        match err {
            EnvError::AlreadyDefined(name) => RuntimeErrorKind::AlreadyDefined(name),
            EnvError::NotDefined(name) => RuntimeErrorKind::NotDefined(name),
        }
    }
}

/// One tier of bindings with an optional enclosing tier
#[derive(Default)]
pub struct Environment {
    values: HashMap<String, Binding>,
    parent: Option<EnvRef>,
}

impl Environment {
    pub fn new_root() -> EnvRef {
        Rc::new(RefCell::new(Environment::default()))
    }

    pub fn new_child(parent: &EnvRef) -> EnvRef {
        Rc::new(RefCell::new(Environment { values: HashMap::new(), parent: Some(parent.clone()) }))
    }

    pub fn parent(&self) -> Option<EnvRef> {
        self.parent.clone()
    }

    /// Bind `name` in this tier. Fails without side effect when it is already bound here.
    pub fn define(&mut self, name: &str, binding: Binding) -> Result<(), EnvError> {
        if self.values.contains_key(name) {
            return Err(EnvError::AlreadyDefined(name.to_string()));
        }
        self.values.insert(name.to_string(), binding);
        Ok(())
    }

    pub fn define_scope(&mut self, name: &str, child: EnvRef) -> Result<EnvRef, EnvError> {
        self.define(name, Binding::Scope(child.clone()))?;
        Ok(child)
    }

    /// Overwrite the nearest existing binding of `name`, searching outward.
    pub fn mutate(&mut self, name: &str, binding: Binding) -> Result<(), EnvError> {
        if let Some(slot) = self.values.get_mut(name) {
            *slot = binding;
            return Ok(());
        }
        match &self.parent {
            Some(parent) => parent.borrow_mut().mutate(name, binding),
            None => Err(EnvError::NotDefined(name.to_string())),
        }
    }

    pub fn mutate_scope(&mut self, name: &str, child: EnvRef) -> Result<EnvRef, EnvError> {
        self.mutate(name, Binding::Scope(child.clone()))?;
        Ok(child)
    }

    /// Chained lookup
    pub fn get(&self, name: &str) -> Option<Binding> {
        match self.values.get(name) {
            Some(binding) => Some(binding.clone()),
            None => self.parent.as_ref().and_then(|parent| parent.borrow().get(name)),
        }
    }

    pub fn get_local(&self, name: &str) -> Option<Binding> {
        self.values.get(name).cloned()
    }

    pub fn contains_local(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Snapshot of this tier sorted by name
    pub fn bindings(&self) -> Vec<(String, Binding)> {
        let mut bindings: Vec<(String, Binding)> =
            self.values.iter().map(|(name, binding)| (name.clone(), binding.clone())).collect();
        bindings.sort_by(|a, b| a.0.cmp(&b.0));
        bindings
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Environment {
    // Names only: scopes may refer back to themselves
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.values.keys().collect();
        names.sort();
        f.debug_struct("Environment")
            .field("names", &names)
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}
