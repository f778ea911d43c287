//! Builtin math functions
//!
//! Arguments are a flat JSON object. Operands may be numbers or numeric
//! strings and are looked up under several common names.

use serde_json::{Map, Value};
use thiserror::Error;

const FIRST_OPERAND: &[&str] = &["a", "first", "num1", "x"];
const SECOND_OPERAND: &[&str] = &["b", "second", "num2", "y"];

#[derive(Debug, Error, PartialEq)]
pub enum BuiltinError {
    #[error("unsupported builtin function {0:?}")]
    Unsupported(String),
    #[error("missing argument {0:?}")]
    MissingArgument(&'static str),
    #[error("argument {name:?} is not a number: {value}")]
    NotANumber { name: String, value: String },
    #[error("division by zero")]
    DivisionByZero,
    #[error("result is not a finite number")]
    NonFinite,
}

fn operand(args: &Map<String, Value>, names: &[&'static str]) -> Result<f64, BuiltinError> {
    let Some((name, value)) = names
        .iter()
        .find_map(|name| args.get(*name).map(|v| (*name, v)))
    else {
        return Err(BuiltinError::MissingArgument(names[0]));
    };

    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.ok_or_else(|| BuiltinError::NotANumber {
        name: name.to_string(),
        value: value.to_string(),
    })
}

/// Run a builtin by name
pub fn execute_builtin(name: &str, args: &Map<String, Value>) -> Result<f64, BuiltinError> {
    let op: fn(f64, f64) -> Result<f64, BuiltinError> = match name {
        "add" => |a, b| Ok(a + b),
        "subtract" => |a, b| Ok(a - b),
        "multiply" => |a, b| Ok(a * b),
        "divide" => |a, b| {
            if b == 0.0 {
                Err(BuiltinError::DivisionByZero)
            } else {
                Ok(a / b)
            }
        },
        other => return Err(BuiltinError::Unsupported(other.to_string())),
    };

    let a = operand(args, FIRST_OPERAND)?;
    let b = operand(args, SECOND_OPERAND)?;
    let result = op(a, b)?;
    if !result.is_finite() {
        return Err(BuiltinError::NonFinite);
    }
    Ok(result)
}

/// Integral values print without a fractional part (`5`, not `5.0`)
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn add_formats_integral_result() {
        let result = execute_builtin("add", &args(json!({"a": 2, "b": 3}))).unwrap();
        assert_eq!(format_number(result), "5");
    }

    #[test]
    fn aliases_and_string_operands() {
        let result = execute_builtin("add", &args(json!({"x": 2, "y": 3}))).unwrap();
        assert_eq!(format_number(result), "5");

        let result =
            execute_builtin("multiply", &args(json!({"first": "1.5", "second": 2}))).unwrap();
        assert_eq!(format_number(result), "3");

        let result = execute_builtin("subtract", &args(json!({"num1": 1, "num2": 1.25}))).unwrap();
        assert_eq!(format_number(result), "-0.25");
    }

    #[test]
    fn divide_by_zero_is_an_error() {
        assert_eq!(
            execute_builtin("divide", &args(json!({"a": 1, "b": 0}))),
            Err(BuiltinError::DivisionByZero)
        );
        assert_eq!(
            execute_builtin("divide", &args(json!({"a": 1, "b": "0"}))),
            Err(BuiltinError::DivisionByZero)
        );
    }

    #[test]
    fn malformed_arguments() {
        assert_eq!(
            execute_builtin("add", &args(json!({"a": 1}))),
            Err(BuiltinError::MissingArgument("b"))
        );
        assert!(matches!(
            execute_builtin("add", &args(json!({"a": "one", "b": 2}))),
            Err(BuiltinError::NotANumber { .. })
        ));
        assert_eq!(
            execute_builtin("pow", &args(json!({"a": 1, "b": 2}))).unwrap_err().to_string(),
            "unsupported builtin function \"pow\""
        );
    }
}
