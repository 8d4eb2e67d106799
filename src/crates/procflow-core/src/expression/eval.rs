//! Expression evaluation over `serde_json::Value`
//!
//! The evaluator resolves identifiers through a [`VarScope`], walks the AST
//! with a recursion-depth cap, and exposes a fixed function whitelist. It has
//! no access to the host runtime: no reflection, no I/O, no clocks beyond the
//! explicit `now()` helper.
//!
//! Null handling is deliberate: equality against null is allowed, but
//! ordering comparisons and arithmetic on null raise
//! [`ExpressionError::NullOperand`] so the caller can surface a classified
//! "missing upstream data" failure instead of silently propagating nulls.

use super::parser::{BinaryOp, Expr};
use super::ExpressionError;
use chrono::Utc;
use serde_json::{json, Map, Number, Value};

const MAX_RECURSION_DEPTH: usize = 64;

/// Variable resolution scope for identifier lookup
pub trait VarScope {
    /// Resolve a top-level identifier; `None` means undefined
    fn resolve(&self, name: &str) -> Option<Value>;
}

impl VarScope for Map<String, Value> {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// Evaluate a parsed expression in the given scope
pub fn eval(expr: &Expr, scope: &dyn VarScope) -> Result<Value, ExpressionError> {
    eval_with_depth(expr, scope, 0)
}

fn eval_with_depth(
    expr: &Expr,
    scope: &dyn VarScope,
    depth: usize,
) -> Result<Value, ExpressionError> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(ExpressionError::DepthExceeded(MAX_RECURSION_DEPTH));
    }

    match expr {
        Expr::Literal(value) => Ok(value.clone()),

        // Undefined identifiers resolve to null; ordering/arithmetic on the
        // null later reports the offending expression text.
        Expr::Ident(name) => Ok(scope.resolve(name).unwrap_or(Value::Null)),

        Expr::Field(base, field) => {
            let value = eval_with_depth(base, scope, depth + 1)?;
            Ok(match value {
                Value::Object(map) => map.get(field).cloned().unwrap_or(Value::Null),
                _ => Value::Null,
            })
        }

        Expr::Index(base, index) => {
            let value = eval_with_depth(base, scope, depth + 1)?;
            let index = eval_with_depth(index, scope, depth + 1)?;
            Ok(match (&value, &index) {
                (Value::Array(items), Value::Number(n)) => {
                    let i = n.as_i64().unwrap_or(-1);
                    let i = if i < 0 { items.len() as i64 + i } else { i };
                    if i >= 0 && (i as usize) < items.len() {
                        items[i as usize].clone()
                    } else {
                        Value::Null
                    }
                }
                (Value::Object(map), Value::String(key)) => {
                    map.get(key).cloned().unwrap_or(Value::Null)
                }
                _ => Value::Null,
            })
        }

        Expr::Array(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval_with_depth(item, scope, depth + 1)?);
            }
            Ok(Value::Array(values))
        }

        Expr::Not(inner) => {
            let value = eval_with_depth(inner, scope, depth + 1)?;
            Ok(Value::Bool(!truthy(&value)))
        }

        Expr::Neg(inner) => {
            let value = eval_with_depth(inner, scope, depth + 1)?;
            match as_f64(&value) {
                Some(n) => Ok(number(-n)),
                None => Err(ExpressionError::NullOperand(format!(
                    "cannot negate {}",
                    type_name(&value)
                ))),
            }
        }

        Expr::Binary { op, left, right } => {
            // Short-circuit boolean operators
            match op {
                BinaryOp::And => {
                    let l = eval_with_depth(left, scope, depth + 1)?;
                    if !truthy(&l) {
                        return Ok(Value::Bool(false));
                    }
                    let r = eval_with_depth(right, scope, depth + 1)?;
                    return Ok(Value::Bool(truthy(&r)));
                }
                BinaryOp::Or => {
                    let l = eval_with_depth(left, scope, depth + 1)?;
                    if truthy(&l) {
                        return Ok(Value::Bool(true));
                    }
                    let r = eval_with_depth(right, scope, depth + 1)?;
                    return Ok(Value::Bool(truthy(&r)));
                }
                _ => {}
            }

            let l = eval_with_depth(left, scope, depth + 1)?;
            let r = eval_with_depth(right, scope, depth + 1)?;
            eval_binary(*op, &l, &r)
        }

        Expr::Call(name, args) => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_with_depth(arg, scope, depth + 1)?);
            }
            call_function(name, &values)
        }
    }
}

fn eval_binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_eq(left, right))),

        BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Lt | BinaryOp::Le => {
            if left.is_null() || right.is_null() {
                return Err(ExpressionError::NullOperand(format!(
                    "'{}' comparison against a missing or null value",
                    op.symbol()
                )));
            }
            let ordering = compare(left, right)?;
            Ok(Value::Bool(match op {
                BinaryOp::Gt => ordering == std::cmp::Ordering::Greater,
                BinaryOp::Ge => ordering != std::cmp::Ordering::Less,
                BinaryOp::Lt => ordering == std::cmp::Ordering::Less,
                BinaryOp::Le => ordering != std::cmp::Ordering::Greater,
                _ => unreachable!(),
            }))
        }

        BinaryOp::Add => {
            // String concatenation when either side is a string
            if let (Value::String(l), r) = (left, right) {
                return Ok(Value::String(format!("{l}{}", stringify(r))));
            }
            if let (l, Value::String(r)) = (left, right) {
                return Ok(Value::String(format!("{}{r}", stringify(l))));
            }
            arithmetic(op, left, right)
        }

        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arithmetic(op, left, right)
        }

        BinaryOp::And | BinaryOp::Or => unreachable!("handled by short-circuit path"),
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    let (l, r) = match (as_f64(left), as_f64(right)) {
        (Some(l), Some(r)) => (l, r),
        _ => {
            return Err(ExpressionError::NullOperand(format!(
                "'{}' requires numeric operands, got {} and {}",
                op.symbol(),
                type_name(left),
                type_name(right)
            )));
        }
    };
    match op {
        BinaryOp::Add => Ok(number(l + r)),
        BinaryOp::Sub => Ok(number(l - r)),
        BinaryOp::Mul => Ok(number(l * r)),
        BinaryOp::Div => {
            if r == 0.0 {
                Err(ExpressionError::DivisionByZero)
            } else {
                Ok(number(l / r))
            }
        }
        BinaryOp::Mod => {
            if r == 0.0 {
                Err(ExpressionError::DivisionByZero)
            } else {
                Ok(number(l % r))
            }
        }
        _ => unreachable!(),
    }
}

fn compare(left: &Value, right: &Value) -> Result<std::cmp::Ordering, ExpressionError> {
    if let (Some(l), Some(r)) = (as_f64(left), as_f64(right)) {
        return l
            .partial_cmp(&r)
            .ok_or_else(|| ExpressionError::NullOperand("NaN comparison".into()));
    }
    if let (Value::String(l), Value::String(r)) = (left, right) {
        return Ok(l.cmp(r));
    }
    Err(ExpressionError::TypeMismatch {
        expected: "two numbers or two strings",
        found: format!("{} and {}", type_name(left), type_name(right)),
    })
}

/// Loose equality: numbers compare numerically across int/float
fn loose_eq(left: &Value, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (as_f64(left), as_f64(right)) {
        return l == r;
    }
    left == right
}

/// JSON truthiness: null/false/0/""/[]/{} are false
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Render a value the way interpolation does: bare strings, JSON otherwise
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn expect_args(
    name: &str,
    args: &[Value],
    expected: usize,
) -> Result<(), ExpressionError> {
    if args.len() != expected {
        return Err(ExpressionError::Arity {
            function: name.to_string(),
            expected,
            found: args.len(),
        });
    }
    Ok(())
}

/// The function whitelist
fn call_function(name: &str, args: &[Value]) -> Result<Value, ExpressionError> {
    match name {
        "len" => {
            expect_args(name, args, 1)?;
            Ok(json!(match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::Null => 0,
                _ => {
                    return Err(ExpressionError::TypeMismatch {
                        expected: "string, array or object",
                        found: type_name(&args[0]).to_string(),
                    });
                }
            }))
        }
        "upper" => {
            expect_args(name, args, 1)?;
            Ok(json!(stringify(&args[0]).to_uppercase()))
        }
        "lower" => {
            expect_args(name, args, 1)?;
            Ok(json!(stringify(&args[0]).to_lowercase()))
        }
        "trim" => {
            expect_args(name, args, 1)?;
            Ok(json!(stringify(&args[0]).trim()))
        }
        "contains" => {
            expect_args(name, args, 2)?;
            Ok(json!(match &args[0] {
                Value::String(s) => s.contains(&stringify(&args[1])),
                Value::Array(items) => items.iter().any(|v| loose_eq(v, &args[1])),
                Value::Object(map) => match &args[1] {
                    Value::String(key) => map.contains_key(key),
                    _ => false,
                },
                _ => false,
            }))
        }
        "starts_with" => {
            expect_args(name, args, 2)?;
            Ok(json!(stringify(&args[0]).starts_with(&stringify(&args[1]))))
        }
        "ends_with" => {
            expect_args(name, args, 2)?;
            Ok(json!(stringify(&args[0]).ends_with(&stringify(&args[1]))))
        }
        "abs" => {
            expect_args(name, args, 1)?;
            numeric_unary(name, &args[0], f64::abs)
        }
        "round" => {
            expect_args(name, args, 1)?;
            numeric_unary(name, &args[0], f64::round)
        }
        "floor" => {
            expect_args(name, args, 1)?;
            numeric_unary(name, &args[0], f64::floor)
        }
        "ceil" => {
            expect_args(name, args, 1)?;
            numeric_unary(name, &args[0], f64::ceil)
        }
        "min" | "max" | "sum" => {
            let values = collect_numbers(name, args)?;
            if values.is_empty() {
                return Ok(Value::Null);
            }
            let result = match name {
                "min" => values.iter().cloned().fold(f64::INFINITY, f64::min),
                "max" => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                _ => values.iter().sum(),
            };
            Ok(number(result))
        }
        "first" => {
            expect_args(name, args, 1)?;
            Ok(match &args[0] {
                Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
                _ => Value::Null,
            })
        }
        "last" => {
            expect_args(name, args, 1)?;
            Ok(match &args[0] {
                Value::Array(items) => items.last().cloned().unwrap_or(Value::Null),
                _ => Value::Null,
            })
        }
        "keys" => {
            expect_args(name, args, 1)?;
            Ok(match &args[0] {
                Value::Object(map) => json!(map.keys().cloned().collect::<Vec<_>>()),
                _ => json!([]),
            })
        }
        "values" => {
            expect_args(name, args, 1)?;
            Ok(match &args[0] {
                Value::Object(map) => json!(map.values().cloned().collect::<Vec<_>>()),
                _ => json!([]),
            })
        }
        "to_number" => {
            expect_args(name, args, 1)?;
            Ok(match &args[0] {
                Value::Number(n) => Value::Number(n.clone()),
                Value::String(s) => s.trim().parse::<f64>().map(number).unwrap_or(Value::Null),
                Value::Bool(b) => json!(if *b { 1 } else { 0 }),
                _ => Value::Null,
            })
        }
        "to_string" => {
            expect_args(name, args, 1)?;
            Ok(json!(stringify(&args[0])))
        }
        "coalesce" => {
            for arg in args {
                if !arg.is_null() {
                    return Ok(arg.clone());
                }
            }
            Ok(Value::Null)
        }
        "now" => {
            expect_args(name, args, 0)?;
            Ok(json!(Utc::now().to_rfc3339()))
        }
        other => Err(ExpressionError::UnknownFunction(other.to_string())),
    }
}

fn numeric_unary(
    name: &str,
    value: &Value,
    f: impl Fn(f64) -> f64,
) -> Result<Value, ExpressionError> {
    match as_f64(value) {
        Some(n) => Ok(number(f(n))),
        None => Err(ExpressionError::TypeMismatch {
            expected: "number",
            found: format!("{} in {name}()", type_name(value)),
        }),
    }
}

/// Numbers from either a single array argument or the argument list itself
fn collect_numbers(name: &str, args: &[Value]) -> Result<Vec<f64>, ExpressionError> {
    let items: Vec<&Value> = match args {
        [Value::Array(items)] => items.iter().collect(),
        other => other.iter().collect(),
    };
    let mut numbers = Vec::with_capacity(items.len());
    for item in items {
        match as_f64(item) {
            Some(n) => numbers.push(n),
            None => {
                if !item.is_null() {
                    return Err(ExpressionError::TypeMismatch {
                        expected: "number",
                        found: format!("{} in {name}()", type_name(item)),
                    });
                }
            }
        }
    }
    Ok(numbers)
}
