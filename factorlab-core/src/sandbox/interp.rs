//! Capability-free evaluator for validated factor expressions.
//!
//! The interpreter is constructed fresh for every execution: the only
//! reachable inputs are the numeric columns named by the factor's declared
//! fields, and the only operations are the arithmetic of the grammar plus
//! the builtin allowlist. Wall-clock and memory budgets are enforced
//! cooperatively — the deadline is checked on a fuel counter and every
//! series allocation is charged against the cell ceiling.

use super::parser::{BinaryOp, Expr, UnaryOp};
use super::{ExecutionBudget, SandboxError};
use crate::domain::Table;
use std::collections::BTreeMap;
use std::time::Instant;

/// An evaluation result: a scalar or a series over the table's index.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Series(Vec<Option<f64>>),
}

pub(crate) struct Interpreter<'a> {
    columns: BTreeMap<&'a str, &'a [Option<f64>]>,
    rows: usize,
    /// Row positions per entity, in index (date) order.
    entity_rows: Vec<Vec<usize>>,
    /// For each row: (entity group, offset within that entity's rows).
    row_pos: Vec<(usize, usize)>,
    deadline: Instant,
    budget_ms: u64,
    max_cells: usize,
    cells: usize,
    fuel: u32,
}

impl<'a> Interpreter<'a> {
    pub(crate) fn new(
        table: &'a Table,
        inputs: &'a [String],
        budget: &ExecutionBudget,
    ) -> Result<Self, SandboxError> {
        let mut columns = BTreeMap::new();
        for input in inputs {
            match table.column(input) {
                Some(col) => {
                    let values = col.as_float().ok_or_else(|| {
                        SandboxError::ContractViolation(format!(
                            "input field '{input}' is not numeric"
                        ))
                    })?;
                    columns.insert(input.as_str(), values);
                }
                None => {
                    return Err(SandboxError::ContractViolation(format!(
                        "input field '{input}' is not present in the fetched table"
                    )))
                }
            }
        }

        let mut group_of: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
        let mut entity_rows: Vec<Vec<usize>> = Vec::new();
        let mut row_pos = Vec::with_capacity(table.len());
        for (i, key) in table.index().iter().enumerate() {
            let group = *group_of.entry(key.ts_code.as_str()).or_insert_with(|| {
                entity_rows.push(Vec::new());
                entity_rows.len() - 1
            });
            row_pos.push((group, entity_rows[group].len()));
            entity_rows[group].push(i);
        }

        Ok(Self {
            columns,
            rows: table.len(),
            entity_rows,
            row_pos,
            deadline: Instant::now() + budget.timeout,
            budget_ms: budget.timeout.as_millis() as u64,
            max_cells: budget.max_cells,
            cells: 0,
            fuel: 0,
        })
    }

    fn tick(&mut self) -> Result<(), SandboxError> {
        if self.fuel % 64 == 0 && Instant::now() >= self.deadline {
            return Err(SandboxError::ExecutionTimeout {
                budget_ms: self.budget_ms,
            });
        }
        self.fuel = self.fuel.wrapping_add(1);
        Ok(())
    }

    fn charge(&mut self, n: usize) -> Result<(), SandboxError> {
        self.cells += n;
        if self.cells > self.max_cells {
            return Err(SandboxError::ResourceExceeded {
                cells: self.cells,
                max_cells: self.max_cells,
            });
        }
        Ok(())
    }

    pub(crate) fn eval(&mut self, expr: &Expr) -> Result<Value, SandboxError> {
        self.tick()?;
        match expr {
            Expr::Number(v) => Ok(Value::Scalar(*v)),
            Expr::Column(name) => {
                self.charge(self.rows)?;
                let values = self.columns[name.as_str()].to_vec();
                Ok(Value::Series(values))
            }
            Expr::Unary {
                op: UnaryOp::Neg,
                operand,
            } => {
                let value = self.eval(operand)?;
                self.map1(value, |v| -v)
            }
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                self.apply2(*op, lhs, rhs)
            }
            Expr::Call { func, args } => self.call(func, args),
        }
    }

    fn call(&mut self, func: &str, args: &[Expr]) -> Result<Value, SandboxError> {
        let arity = |expected: usize| {
            if args.len() == expected {
                Ok(())
            } else {
                Err(SandboxError::ParseError(format!(
                    "{func}() expects {expected} argument(s), got {}",
                    args.len()
                )))
            }
        };

        match func {
            "abs" | "log" | "exp" | "sqrt" | "sign" => {
                arity(1)?;
                let value = self.eval(&args[0])?;
                let f: fn(f64) -> f64 = match func {
                    "abs" => f64::abs,
                    "log" => f64::ln,
                    "exp" => f64::exp,
                    "sqrt" => f64::sqrt,
                    _ => f64::signum,
                };
                self.map1(value, f)
            }
            "min" | "max" | "pow" => {
                arity(2)?;
                let lhs = self.eval(&args[0])?;
                let rhs = self.eval(&args[1])?;
                let f: fn(f64, f64) -> f64 = match func {
                    "min" => f64::min,
                    "max" => f64::max,
                    _ => f64::powf,
                };
                self.zip2(lhs, rhs, f)
            }
            "clip" => {
                arity(3)?;
                let value = self.eval(&args[0])?;
                let lo = self.scalar_arg(&args[1], "clip lower bound")?;
                let hi = self.scalar_arg(&args[2], "clip upper bound")?;
                if lo > hi {
                    return Err(SandboxError::ParseError(
                        "clip() lower bound exceeds upper bound".into(),
                    ));
                }
                self.map1(value, move |v| v.clamp(lo, hi))
            }
            "where" => {
                arity(3)?;
                let cond = self.eval(&args[0])?;
                let if_true = self.eval(&args[1])?;
                let if_false = self.eval(&args[2])?;
                self.select(cond, if_true, if_false)
            }
            "delay" => {
                arity(2)?;
                let value = self.eval(&args[0])?;
                let lag = self.scalar_arg(&args[1], "delay lag")?;
                if lag < 0.0 || lag.fract() != 0.0 {
                    return Err(SandboxError::ParseError(
                        "delay() lag must be a non-negative integer".into(),
                    ));
                }
                self.delay(value, lag as usize)
            }
            // Unreachable after validation, kept as a defense-in-depth check.
            other => Err(SandboxError::UnsafeCode(format!(
                "function '{other}' is not in the builtin allowlist"
            ))),
        }
    }

    fn scalar_arg(&mut self, expr: &Expr, what: &str) -> Result<f64, SandboxError> {
        match self.eval(expr)? {
            Value::Scalar(v) if v.is_finite() => Ok(v),
            Value::Scalar(_) => Err(SandboxError::ParseError(format!("{what} is not finite"))),
            Value::Series(_) => Err(SandboxError::ParseError(format!(
                "{what} must be a scalar, not a series"
            ))),
        }
    }

    fn map1(
        &mut self,
        value: Value,
        f: impl Fn(f64) -> f64,
    ) -> Result<Value, SandboxError> {
        match value {
            Value::Scalar(v) => Ok(Value::Scalar(f(v))),
            Value::Series(values) => {
                self.charge(values.len())?;
                Ok(Value::Series(
                    values
                        .into_iter()
                        .map(|v| v.map(&f).filter(|x| x.is_finite()))
                        .collect(),
                ))
            }
        }
    }

    fn zip2(
        &mut self,
        lhs: Value,
        rhs: Value,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<Value, SandboxError> {
        let combine = |a: Option<f64>, b: Option<f64>| -> Option<f64> {
            match (a, b) {
                (Some(a), Some(b)) => Some(f(a, b)).filter(|x| x.is_finite()),
                _ => None,
            }
        };
        match (lhs, rhs) {
            (Value::Scalar(a), Value::Scalar(b)) => Ok(Value::Scalar(f(a, b))),
            (Value::Series(a), Value::Scalar(b)) => {
                self.charge(a.len())?;
                Ok(Value::Series(
                    a.into_iter().map(|v| combine(v, Some(b))).collect(),
                ))
            }
            (Value::Scalar(a), Value::Series(b)) => {
                self.charge(b.len())?;
                Ok(Value::Series(
                    b.into_iter().map(|v| combine(Some(a), v)).collect(),
                ))
            }
            (Value::Series(a), Value::Series(b)) => {
                self.charge(a.len())?;
                Ok(Value::Series(
                    a.into_iter()
                        .zip(b)
                        .map(|(x, y)| combine(x, y))
                        .collect(),
                ))
            }
        }
    }

    fn apply2(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, SandboxError> {
        let f: fn(f64, f64) -> f64 = match op {
            BinaryOp::Add => |a, b| a + b,
            BinaryOp::Sub => |a, b| a - b,
            BinaryOp::Mul => |a, b| a * b,
            BinaryOp::Div => |a, b| a / b,
            BinaryOp::Rem => |a, b| a % b,
            BinaryOp::Pow => f64::powf,
            BinaryOp::Lt => |a, b| f64::from(a < b),
            BinaryOp::Le => |a, b| f64::from(a <= b),
            BinaryOp::Gt => |a, b| f64::from(a > b),
            BinaryOp::Ge => |a, b| f64::from(a >= b),
            BinaryOp::Eq => |a, b| f64::from(a == b),
            BinaryOp::Ne => |a, b| f64::from(a != b),
        };
        self.zip2(lhs, rhs, f)
    }

    fn select(
        &mut self,
        cond: Value,
        if_true: Value,
        if_false: Value,
    ) -> Result<Value, SandboxError> {
        let pick = |c: Option<f64>, t: Option<f64>, f: Option<f64>| -> Option<f64> {
            match c {
                Some(c) => {
                    if c != 0.0 {
                        t
                    } else {
                        f
                    }
                }
                None => None,
            }
        };
        let as_series = |v: Value, n: usize| -> Vec<Option<f64>> {
            match v {
                Value::Scalar(s) => vec![Some(s).filter(|x| x.is_finite()); n],
                Value::Series(values) => values,
            }
        };

        match cond {
            Value::Scalar(c) => Ok(if c != 0.0 { if_true } else { if_false }),
            Value::Series(cond) => {
                let n = cond.len();
                // Charges the condition's expansion plus both branches.
                self.charge(3 * n)?;
                let t = as_series(if_true, n);
                let f = as_series(if_false, n);
                Ok(Value::Series(
                    cond.into_iter()
                        .zip(t)
                        .zip(f)
                        .map(|((c, t), f)| pick(c, t, f))
                        .collect(),
                ))
            }
        }
    }

    /// Per-entity time-series lag: each row takes the value its entity had
    /// `lag` index steps earlier; the first `lag` rows of an entity are
    /// missing.
    fn delay(&mut self, value: Value, lag: usize) -> Result<Value, SandboxError> {
        let values = match value {
            Value::Series(values) => values,
            Value::Scalar(_) => {
                return Err(SandboxError::ParseError(
                    "delay() requires a series argument".into(),
                ))
            }
        };
        self.charge(values.len())?;

        let lagged = (0..values.len())
            .map(|i| {
                let (group, offset) = self.row_pos[i];
                if offset < lag {
                    None
                } else {
                    values[self.entity_rows[group][offset - lag]]
                }
            })
            .collect();
        Ok(Value::Series(lagged))
    }
}
