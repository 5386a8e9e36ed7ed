//! Host native functions

use crate::script::diagnostic::RuntimeErrorKind;
use crate::script::value::Value;

/// Names of the natives installed into the root scope
pub const BUILTINS: &[&str] = &["print", "len"];

/// Expected argument count, `None` for variadic natives
pub fn arity(name: &str) -> Option<usize> {
    match name {
        "len" => Some(1),
        _ => None,
    }
}

/// Call a native function. Text printed by the script is appended to `output`.
pub fn call_builtin(name: &str, args: &[Value], output: &mut Vec<String>) -> Result<Value, RuntimeErrorKind> {
    if let Some(expected) = arity(name) {
        if args.len() != expected {
            return Err(RuntimeErrorKind::Arity { name: name.to_string(), expected, found: args.len() });
        }
    }

    match name {
        "print" => {
            let line = args.iter().map(|arg| arg.to_string()).collect::<Vec<_>>().join(" ");
            log::trace!("print: {}", line);
            output.push(line);
            Ok(Value::Null)
        }
        "len" => match &args[0] {
            Value::String(s) => Ok(Value::Number(s.chars().count() as f64)),
            Value::Array(items) => Ok(Value::Number(items.borrow().len() as f64)),
            Value::Scope(scope) => Ok(Value::Number(scope.borrow().len() as f64)),
            other => Err(RuntimeErrorKind::TypeMismatch(format!("len() of {}", other.type_name()))),
        },
        _ => Err(RuntimeErrorKind::Native(format!("unknown builtin '{}'", name))),
    }
}
