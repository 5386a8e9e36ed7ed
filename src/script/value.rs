//! Runtime values and the operators defined on them

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::script::ast::{BinOp, FunctionDef, UnaryOp};
use crate::script::diagnostic::RuntimeErrorKind;
use crate::script::environment::{Binding, EnvRef};

/// Nesting limit when rendering arrays and scopes, which may contain themselves
const DISPLAY_DEPTH: usize = 8;

/// A script value
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// Shared, mutable array
    Array(Rc<RefCell<Vec<Value>>>),
    Function(Rc<FunctionDef>),
    /// Host native, identified by name
    Builtin(&'static str),
    /// Handle to a nested environment built by property assignments
    Scope(EnvRef),
}

impl Value {
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Function(_) | Value::Builtin(_) => "function",
            Value::Scope(_) => "scope",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Structural equality; never faults. Functions and scopes compare by identity.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equals(y))
            }
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Scope(a), Value::Scope(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Rendering used inside arrays and scopes: strings are quoted
    fn fmt_nested(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s),
            _ => self.fmt_depth(f, depth),
        }
    }

    fn fmt_depth(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::String(s) => write!(f, "{}", s),
            Value::Function(def) => write!(f, "<fn {}>", def.name),
            Value::Builtin(name) => write!(f, "<builtin {}>", name),
            Value::Array(_) | Value::Scope(_) if depth >= DISPLAY_DEPTH => write!(f, "..."),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    item.fmt_nested(f, depth + 1)?;
                }
                write!(f, "]")
            }
            Value::Scope(scope) => {
                write!(f, "{{")?;
                for (i, (name, binding)) in scope.borrow().bindings().into_iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: ", name)?;
                    match binding {
                        Binding::Native(value) => value.fmt_nested(f, depth + 1)?,
                        Binding::Scope(inner) => Value::Scope(inner).fmt_depth(f, depth + 1)?,
                        other => write!(f, "{}", other)?,
                    }
                }
                write!(f, "}}")
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_depth(f, 0)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

/// Format a number without a trailing `.0` when it is integral
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn mismatch(op: impl fmt::Display, left: &Value, right: &Value) -> RuntimeErrorKind {
    RuntimeErrorKind::TypeMismatch(format!(
        "cannot apply '{}' to {} and {}",
        op,
        left.type_name(),
        right.type_name()
    ))
}

fn integral(op: BinOp, left: &Value, right: &Value) -> Result<(i64, i64), RuntimeErrorKind> {
    match (to_integer(left), to_integer(right)) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(RuntimeErrorKind::TypeMismatch(format!(
            "'{}' needs integral numbers, got {} and {}",
            op, left, right
        ))),
    }
}

fn to_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) if n.is_finite() && *n == n.trunc() && n.abs() <= i64::MAX as f64 => Some(*n as i64),
        _ => None,
    }
}

/// Apply a prefix operator
pub fn apply_unary(op: UnaryOp, operand: &Value) -> Result<Value, RuntimeErrorKind> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!operand.is_truthy())),
        UnaryOp::Neg => match operand {
            Value::Number(n) => Ok(Value::Number(-n)),
            other => Err(RuntimeErrorKind::TypeMismatch(format!("cannot negate {}", other.type_name()))),
        },
        UnaryOp::BitNot => match to_integer(operand) {
            Some(n) => Ok(Value::Number(!n as f64)),
            None => Err(RuntimeErrorKind::TypeMismatch(format!("'~' needs an integral number, got {}", operand))),
        },
    }
}

/// Apply a strict binary operator. `&&` and `||` short-circuit and are
/// handled by the interpreter before their right operand is evaluated.
pub fn apply_binary(op: BinOp, left: &Value, right: &Value) -> Result<Value, RuntimeErrorKind> {
    use crate::script::value::Value::{Array, Number, Scope, String as Str};

    match op {
        BinOp::Add => match (left, right) {
            (Number(a), Number(b)) => Ok(Number(a + b)),
            (Str(_), _) | (_, Str(_)) => Ok(Str(format!("{}{}", left, right))),
            (Array(a), Array(b)) => {
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                Ok(Value::array(items))
            }
            _ => Err(mismatch(op, left, right)),
        },
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod | BinOp::Pow => {
            let (Number(a), Number(b)) = (left, right) else {
                return Err(mismatch(op, left, right));
            };
            let (a, b) = (*a, *b);
            match op {
                BinOp::Sub => Ok(Number(a - b)),
                BinOp::Mul => Ok(Number(a * b)),
                BinOp::Div if b == 0.0 => Err(RuntimeErrorKind::DivisionByZero),
                BinOp::Div => Ok(Number(a / b)),
                BinOp::Mod if b == 0.0 => Err(RuntimeErrorKind::DivisionByZero),
                BinOp::Mod => Ok(Number(a % b)),
                _ => Ok(Number(a.powf(b))),
            }
        }
        BinOp::Eq => Ok(Value::Bool(left.equals(right))),
        BinOp::Ne => Ok(Value::Bool(!left.equals(right))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (left, right) {
                (Number(a), Number(b)) => a.partial_cmp(b),
                (Str(a), Str(b)) => Some(a.cmp(b)),
                _ => return Err(mismatch(op, left, right)),
            };
            let result = match ordering {
                None => false,
                Some(ord) => match op {
                    BinOp::Lt => ord.is_lt(),
                    BinOp::Le => ord.is_le(),
                    BinOp::Gt => ord.is_gt(),
                    _ => ord.is_ge(),
                },
            };
            Ok(Value::Bool(result))
        }
        BinOp::And => Ok(if left.is_truthy() { right.clone() } else { left.clone() }),
        BinOp::Or => Ok(if left.is_truthy() { left.clone() } else { right.clone() }),
        BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor => {
            let (a, b) = integral(op, left, right)?;
            let n = match op {
                BinOp::BitAnd => a & b,
                BinOp::BitOr => a | b,
                _ => a ^ b,
            };
            Ok(Number(n as f64))
        }
        BinOp::Shl | BinOp::Shr => {
            let (a, b) = integral(op, left, right)?;
            let shifted = u32::try_from(b).ok().and_then(|shift| {
                if op == BinOp::Shl {
                    a.checked_shl(shift)
                } else {
                    a.checked_shr(shift)
                }
            });
            match shifted {
                Some(n) => Ok(Number(n as f64)),
                None => Err(RuntimeErrorKind::TypeMismatch(format!("shift amount {} is out of range", b))),
            }
        }
        BinOp::In => match (left, right) {
            (_, Array(items)) => Ok(Value::Bool(items.borrow().iter().any(|item| item.equals(left)))),
            (Str(needle), Str(haystack)) => Ok(Value::Bool(haystack.contains(needle.as_str()))),
            (Str(key), Scope(scope)) => Ok(Value::Bool(scope.borrow().contains_local(key))),
            _ => Err(mismatch(op, left, right)),
        },
        BinOp::InstanceOf => match right {
            Str(name) => Ok(Value::Bool(left.type_name() == name)),
            _ => Err(RuntimeErrorKind::TypeMismatch(format!(
                "right side of 'instanceof' must be a type name string, got {}",
                right.type_name()
            ))),
        },
    }
}
