//! Static validation of factor expressions.

use super::lexer::Token;
use super::parser::Expr;
use super::SandboxError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Functions the interpreter exposes. Everything else is unsafe.
pub const BUILTINS: [&str; 11] = [
    "abs", "log", "exp", "sqrt", "sign", "min", "max", "clip", "pow", "where", "delay",
];

/// Identifiers that signal an attempt to reach outside the sandbox. These
/// are rejected wherever they appear, even in positions that would not
/// parse, so hostile code fails as unsafe rather than as a syntax error.
const BANNED: [&str; 22] = [
    "import",
    "from",
    "eval",
    "exec",
    "open",
    "compile",
    "input",
    "getattr",
    "setattr",
    "delattr",
    "globals",
    "locals",
    "vars",
    "dir",
    "breakpoint",
    "os",
    "sys",
    "subprocess",
    "socket",
    "pathlib",
    "shutil",
    "builtins",
];

/// Which declared input fields the formula actually uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub used_fields: Vec<String>,
    pub unused_inputs: Vec<String>,
}

/// Scan the raw token stream for banned identifiers. Runs before parsing.
///
/// A banned name that is also a declared input field (`open` is both a
/// hostile primitive and a market field) stays legal as a column reference
/// but is still rejected in call position.
pub fn scan_banned(tokens: &[Token], inputs: &[String]) -> Result<(), SandboxError> {
    for (i, token) in tokens.iter().enumerate() {
        if let Token::Ident(name) = token {
            if name.starts_with("__") {
                return Err(SandboxError::UnsafeCode(format!(
                    "dunder identifier '{name}' is not allowed"
                )));
            }
            if !BANNED.contains(&name.as_str()) {
                continue;
            }
            let called = tokens.get(i + 1) == Some(&Token::LParen);
            if called || !inputs.iter().any(|f| f == name) {
                return Err(SandboxError::UnsafeCode(format!(
                    "identifier '{name}' is not allowed"
                )));
            }
        }
    }
    Ok(())
}

/// Validate a parsed expression against the declared input fields: every
/// column reference must be declared and every call must be a builtin.
pub fn validate(expr: &Expr, inputs: &[String]) -> Result<ValidationReport, SandboxError> {
    let declared: BTreeSet<&str> = inputs.iter().map(String::as_str).collect();
    let mut used: BTreeSet<String> = BTreeSet::new();
    walk(expr, &declared, &mut used)?;

    let unused_inputs = inputs
        .iter()
        .filter(|f| !used.contains(*f))
        .cloned()
        .collect();
    Ok(ValidationReport {
        used_fields: used.into_iter().collect(),
        unused_inputs,
    })
}

fn walk(
    expr: &Expr,
    declared: &BTreeSet<&str>,
    used: &mut BTreeSet<String>,
) -> Result<(), SandboxError> {
    match expr {
        Expr::Number(_) => Ok(()),
        Expr::Column(name) => {
            if !declared.contains(name.as_str()) {
                return Err(SandboxError::UnsafeCode(format!(
                    "identifier '{name}' is not a declared input field"
                )));
            }
            used.insert(name.clone());
            Ok(())
        }
        Expr::Unary { operand, .. } => walk(operand, declared, used),
        Expr::Binary { lhs, rhs, .. } => {
            walk(lhs, declared, used)?;
            walk(rhs, declared, used)
        }
        Expr::Call { func, args } => {
            if !BUILTINS.contains(&func.as_str()) {
                return Err(SandboxError::UnsafeCode(format!(
                    "function '{func}' is not in the builtin allowlist"
                )));
            }
            for arg in args {
                walk(arg, declared, used)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::lexer::lex;
    use super::super::parser::parse;
    use super::*;

    fn check(source: &str, inputs: &[&str]) -> Result<ValidationReport, SandboxError> {
        let tokens = lex(source)?;
        let inputs: Vec<String> = inputs.iter().map(|s| s.to_string()).collect();
        scan_banned(&tokens, &inputs)?;
        let expr = parse(&tokens)?;
        validate(&expr, &inputs)
    }

    #[test]
    fn banned_identifiers_fail_before_parsing() {
        // `import os` is not even grammatical, but must fail as unsafe.
        let tokens = lex("import os").unwrap();
        assert!(matches!(
            scan_banned(&tokens, &[]),
            Err(SandboxError::UnsafeCode(_))
        ));
    }

    #[test]
    fn dunder_names_are_unsafe() {
        let tokens = lex("__class__").unwrap();
        assert!(matches!(
            scan_banned(&tokens, &[]),
            Err(SandboxError::UnsafeCode(_))
        ));
    }

    #[test]
    fn non_builtin_calls_are_unsafe() {
        assert!(matches!(
            check("system(close)", &["close"]),
            Err(SandboxError::UnsafeCode(_))
        ));
    }

    #[test]
    fn undeclared_columns_are_unsafe() {
        assert!(matches!(
            check("close * pe", &["close"]),
            Err(SandboxError::UnsafeCode(_))
        ));
    }

    #[test]
    fn usage_report_partitions_declared_fields() {
        let report = check("log(close) - log(pre_close)", &["close", "pre_close", "vol"]).unwrap();
        assert_eq!(report.used_fields, vec!["close", "pre_close"]);
        assert_eq!(report.unused_inputs, vec!["vol"]);
    }
}
