//! Sandboxed execution of user-authored factor formulas.
//!
//! Factor code is untrusted input. Instead of embedding a general-purpose
//! interpreter, formulas are written in a small expression language over the
//! named columns of the fetched table and compiled through a verify-then-run
//! pipeline:
//!
//! 1. lex ([`lexer`]) — reject unknown characters
//! 2. screen ([`validate::scan_banned`]) — banned identifiers (`import`,
//!    `eval`, `open`, …) anywhere in the token stream are `UnsafeCode`,
//!    checked before parsing so `import os` is reported as unsafe rather
//!    than as a syntax error
//! 3. parse ([`parser`]) — the grammar has no attribute access, indexing,
//!    assignment, or statements
//! 4. validate ([`validate`]) — every column reference must be a declared
//!    input field and every call a whitelisted builtin
//! 5. evaluate ([`interp`]) — a fresh, capability-free evaluator per
//!    execution, bounded by a wall-clock deadline and a cell ceiling
//!
//! Sandbox failures are never retried; they abort only the offending
//! factor's contribution to a run.

mod interp;
mod lexer;
mod parser;
mod validate;

pub use interp::Value;
pub use parser::Expr;
pub use validate::{validate, ValidationReport, BUILTINS};

use crate::domain::{FactorSeries, Table};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Sandbox failures. All of them are hard failures surfaced to the caller.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The source is not a well-formed expression.
    #[error("parse error: {0}")]
    ParseError(String),

    /// The source references something outside its declared capability:
    /// a banned identifier, an undeclared input field, or a non-builtin call.
    #[error("unsafe code: {0}")]
    UnsafeCode(String),

    /// The result does not satisfy the output contract (numeric series
    /// aligned to the output index).
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// Evaluation exceeded the wall-clock budget.
    #[error("execution timed out after {budget_ms}ms")]
    ExecutionTimeout { budget_ms: u64 },

    /// Evaluation exceeded the memory budget.
    #[error("resource ceiling exceeded: {cells} cells allocated, limit {max_cells}")]
    ResourceExceeded { cells: usize, max_cells: usize },
}

/// Untrusted factor source plus its declared input fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorCode {
    pub source: String,
    pub inputs: Vec<String>,
}

impl FactorCode {
    pub fn new(source: impl Into<String>, inputs: &[&str]) -> Self {
        Self {
            source: source.into(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Resource budget for one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionBudget {
    /// Wall-clock limit for evaluation.
    pub timeout: Duration,
    /// Ceiling on total cells (series elements) allocated while evaluating.
    pub max_cells: usize,
}

impl Default for ExecutionBudget {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            max_cells: 10_000_000,
        }
    }
}

/// Statically check factor code without executing it. Returns the
/// field-usage report on success.
pub fn validate_factor(code: &FactorCode) -> Result<ValidationReport, SandboxError> {
    let tokens = lexer::lex(&code.source)?;
    validate::scan_banned(&tokens, &code.inputs)?;
    let expr = parser::parse(&tokens)?;
    validate(&expr, &code.inputs)
}

/// Validate and execute factor code against a fetched table.
///
/// The returned series is aligned to the table's output index; non-finite
/// results are normalized to missing. No state survives this call.
pub fn execute_factor(
    code: &FactorCode,
    table: &Table,
    budget: &ExecutionBudget,
) -> Result<FactorSeries, SandboxError> {
    let tokens = lexer::lex(&code.source)?;
    validate::scan_banned(&tokens, &code.inputs)?;
    let expr = parser::parse(&tokens)?;
    validate(&expr, &code.inputs)?;

    let value = interp::Interpreter::new(table, &code.inputs, budget)?.eval(&expr)?;

    match value {
        Value::Series(values) => {
            let values = values
                .into_iter()
                .map(|v| v.filter(|x| x.is_finite()))
                .collect();
            Ok(FactorSeries::new(table.index().to_vec(), values))
        }
        Value::Scalar(_) => Err(SandboxError::ContractViolation(
            "formula produced a scalar, not a series over the output index".into(),
        )),
    }
}
