//! Constant folding
//!
//! Folds binary, unary and ternary expressions whose operands are all
//! literals into a precomputed literal node. Folding is behavior
//! preserving: the produced literal equals what the VM would compute for
//! the same operator at runtime. Division by zero, non-positive modulo
//! and negative shift counts are diagnosed here instead of folded.
//!
//! Returns `None` when the operand kinds do not admit folding; the parser
//! then builds the ordinary operator node.

use crate::ast::{Expr, ExprKind, LiteralValue};
use crate::diagnostics::DiagnosticReporter;
use crate::scanner::{Token, TokenKind};

fn literal_of(expr: &Expr) -> &LiteralValue {
    match &expr.kind {
        ExprKind::Literal(value) => value,
        _ => unreachable!("folding requires literal operands"),
    }
}

fn numeric(value: &LiteralValue) -> Option<f64> {
    match value {
        LiteralValue::Int(v) => Some(*v as f64),
        LiteralValue::Float(v) => Some(*v),
        _ => None,
    }
}

fn truthy(value: &LiteralValue) -> bool {
    match value {
        LiteralValue::Int(v) => *v != 0,
        LiteralValue::Float(v) => *v != 0.0,
        LiteralValue::Bool(v) => *v,
        LiteralValue::String(s) => !s.is_empty(),
        LiteralValue::Null => false,
    }
}

fn make(value: LiteralValue, token: &Token) -> Expr {
    Expr::new(ExprKind::Literal(value), token.clone())
}

pub(crate) fn fold_binary(
    reporter: &mut DiagnosticReporter,
    module: &str,
    left: &Expr,
    operator: &Token,
    right: &Expr,
) -> Option<Expr> {
    use LiteralValue::{Bool, Float, Int, Null, String};
    let a = literal_of(left);
    let b = literal_of(right);
    let token = &left.attrs.token;

    match operator.kind {
        TokenKind::BitOr => int_op(a, b, token, |x, y| x | y),
        TokenKind::BitXor => int_op(a, b, token, |x, y| x ^ y),
        TokenKind::BitAnd => int_op(a, b, token, |x, y| x & y),
        TokenKind::LeftShift | TokenKind::RightShift => {
            if let (Int(x), Int(y)) = (a, b) {
                if *y < 0 {
                    reporter.error(module, "Bitshift using negative value", operator);
                    return None;
                }
                let result = if operator.kind == TokenKind::LeftShift {
                    x.wrapping_shl(*y as u32)
                } else {
                    x.wrapping_shr(*y as u32)
                };
                Some(make(Int(result), token))
            } else {
                None
            }
        }
        TokenKind::EqualEqual | TokenKind::NotEqual => {
            let equal = match (a, b) {
                (Int(x), Int(y)) => Some(x == y),
                (Float(x), Float(y)) => Some(x == y),
                (Int(x), Float(y)) | (Float(y), Int(x)) => Some(*x as f64 == *y),
                (Bool(x), Bool(y)) => Some(x == y),
                (String(x), String(y)) => Some(x == y),
                (Null, Null) => Some(true),
                _ => None,
            }?;
            let result = if operator.kind == TokenKind::EqualEqual {
                equal
            } else {
                !equal
            };
            Some(make(Bool(result), token))
        }
        TokenKind::Greater => comparison(a, b, token, |x, y| x > y),
        TokenKind::GreaterEqual => comparison(a, b, token, |x, y| x >= y),
        TokenKind::Less => comparison(a, b, token, |x, y| x < y),
        TokenKind::LessEqual => comparison(a, b, token, |x, y| x <= y),
        TokenKind::Plus => match (a, b) {
            (Int(x), Int(y)) => Some(make(Int(x.wrapping_add(*y)), token)),
            (String(x), String(y)) => Some(make(String(format!("{}{}", x, y)), token)),
            _ => numeric_op(a, b, token, |x, y| x + y),
        },
        TokenKind::Minus => match (a, b) {
            (Int(x), Int(y)) => Some(make(Int(x.wrapping_sub(*y)), token)),
            _ => numeric_op(a, b, token, |x, y| x - y),
        },
        TokenKind::Star => match (a, b) {
            (Int(x), Int(y)) => Some(make(Int(x.wrapping_mul(*y)), token)),
            _ => numeric_op(a, b, token, |x, y| x * y),
        },
        TokenKind::Slash => {
            if numeric(b) == Some(0.0) {
                reporter.error(module, "Division by zero", &right.attrs.token);
                return None;
            }
            match (a, b) {
                (Int(x), Int(y)) => Some(make(Int(x.wrapping_div(*y)), token)),
                _ => numeric_op(a, b, token, |x, y| x / y),
            }
        }
        TokenKind::Modulo => {
            if let Int(y) = b {
                if *y <= 0 {
                    reporter.error(
                        module,
                        "Modulo using negative or zero value",
                        &right.attrs.token,
                    );
                    return None;
                }
            }
            int_op(a, b, token, |x, y| x.wrapping_rem(y))
        }
        TokenKind::DotDot | TokenKind::DotDotEqual => None,
        _ => None,
    }
}

fn int_op(
    a: &LiteralValue,
    b: &LiteralValue,
    token: &Token,
    apply: impl Fn(i32, i32) -> i32,
) -> Option<Expr> {
    if let (LiteralValue::Int(x), LiteralValue::Int(y)) = (a, b) {
        Some(make(LiteralValue::Int(apply(*x, *y)), token))
    } else {
        None
    }
}

fn numeric_op(
    a: &LiteralValue,
    b: &LiteralValue,
    token: &Token,
    apply: impl Fn(f64, f64) -> f64,
) -> Option<Expr> {
    let x = numeric(a)?;
    let y = numeric(b)?;
    Some(make(LiteralValue::Float(apply(x, y)), token))
}

fn comparison(
    a: &LiteralValue,
    b: &LiteralValue,
    token: &Token,
    apply: impl Fn(f64, f64) -> bool,
) -> Option<Expr> {
    use LiteralValue::Bool;
    if let (Bool(x), Bool(y)) = (a, b) {
        return Some(make(
            Bool(apply(*x as i32 as f64, *y as i32 as f64)),
            token,
        ));
    }
    let x = numeric(a)?;
    let y = numeric(b)?;
    Some(make(Bool(apply(x, y)), token))
}

pub(crate) fn fold_unary(
    _reporter: &mut DiagnosticReporter,
    _module: &str,
    operator: &Token,
    operand: &Expr,
) -> Option<Expr> {
    use LiteralValue::{Bool, Float, Int};
    let value = literal_of(operand);
    let token = &operand.attrs.token;
    match operator.kind {
        TokenKind::Minus => match value {
            Int(v) => Some(make(Int(v.wrapping_neg()), token)),
            Float(v) => Some(make(Float(-v), token)),
            _ => None,
        },
        TokenKind::Plus => match value {
            Int(_) | Float(_) => Some(make(value.clone(), token)),
            _ => None,
        },
        TokenKind::Not => Some(make(Bool(!truthy(value)), token)),
        TokenKind::BitNot => match value {
            Int(v) => Some(make(Int(!v), token)),
            _ => None,
        },
        _ => None,
    }
}

/// A literal ternary folds only when the condition is a boolean literal
/// and both branches are literals of the same kind.
pub(crate) fn fold_ternary(condition: &Expr, then_branch: &Expr, else_branch: &Expr) -> Option<Expr> {
    let LiteralValue::Bool(chosen) = literal_of(condition) else {
        return None;
    };
    let a = literal_of(then_branch);
    let b = literal_of(else_branch);
    if std::mem::discriminant(a) != std::mem::discriminant(b) {
        return None;
    }
    let selected = if *chosen { then_branch } else { else_branch };
    Some(make(
        literal_of(selected).clone(),
        &selected.attrs.token,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_expr(value: i32) -> Expr {
        Expr::new(
            ExprKind::Literal(LiteralValue::Int(value)),
            Token::new(TokenKind::IntValue, value.to_string(), 1, 0, 1),
        )
    }

    fn op(kind: TokenKind) -> Token {
        Token::new(kind, "", 1, 0, 1)
    }

    fn folded_int(expr: Option<Expr>) -> i32 {
        match expr.map(|e| e.kind) {
            Some(ExprKind::Literal(LiteralValue::Int(v))) => v,
            other => panic!("expected folded int, got {:?}", other),
        }
    }

    #[test]
    fn test_int_arithmetic() {
        let mut reporter = DiagnosticReporter::new();
        let result = fold_binary(
            &mut reporter,
            "t",
            &int_expr(6),
            &op(TokenKind::Star),
            &int_expr(7),
        );
        assert_eq!(folded_int(result), 42);
    }

    #[test]
    fn test_mixed_numeric_becomes_float() {
        let mut reporter = DiagnosticReporter::new();
        let float = Expr::new(
            ExprKind::Literal(LiteralValue::Float(0.5)),
            Token::new(TokenKind::FloatValue, "0.5", 1, 0, 3),
        );
        let result = fold_binary(&mut reporter, "t", &int_expr(1), &op(TokenKind::Plus), &float);
        match result.map(|e| e.kind) {
            Some(ExprKind::Literal(LiteralValue::Float(v))) => assert_eq!(v, 1.5),
            other => panic!("expected float, got {:?}", other),
        }
    }

    #[test]
    fn test_division_by_zero_reports() {
        let mut reporter = DiagnosticReporter::new();
        let result = fold_binary(
            &mut reporter,
            "t",
            &int_expr(1),
            &op(TokenKind::Slash),
            &int_expr(0),
        );
        assert!(result.is_none());
        assert!(reporter.had_error());
    }

    #[test]
    fn test_negative_shift_reports() {
        let mut reporter = DiagnosticReporter::new();
        let result = fold_binary(
            &mut reporter,
            "t",
            &int_expr(1),
            &op(TokenKind::LeftShift),
            &int_expr(-1),
        );
        assert!(result.is_none());
        assert!(reporter.had_error());
    }

    #[test]
    fn test_comparisons_fold_to_bool() {
        let mut reporter = DiagnosticReporter::new();
        let result = fold_binary(
            &mut reporter,
            "t",
            &int_expr(2),
            &op(TokenKind::Less),
            &int_expr(3),
        );
        match result.map(|e| e.kind) {
            Some(ExprKind::Literal(LiteralValue::Bool(true))) => {}
            other => panic!("expected true, got {:?}", other),
        }
    }

    #[test]
    fn test_unary_minus() {
        let mut reporter = DiagnosticReporter::new();
        let result = fold_unary(&mut reporter, "t", &op(TokenKind::Minus), &int_expr(5));
        assert_eq!(folded_int(result), -5);
    }

    #[test]
    fn test_ternary_requires_matching_kinds() {
        let cond = Expr::new(
            ExprKind::Literal(LiteralValue::Bool(true)),
            Token::new(TokenKind::True, "true", 1, 0, 4),
        );
        let float = Expr::new(
            ExprKind::Literal(LiteralValue::Float(1.0)),
            Token::new(TokenKind::FloatValue, "1.0", 1, 0, 3),
        );
        assert!(fold_ternary(&cond, &int_expr(1), &float).is_none());
        let result = fold_ternary(&cond, &int_expr(1), &int_expr(2));
        assert_eq!(folded_int(result), 1);
    }

    #[test]
    fn test_range_operator_never_folds() {
        let mut reporter = DiagnosticReporter::new();
        let result = fold_binary(
            &mut reporter,
            "t",
            &int_expr(1),
            &op(TokenKind::DotDot),
            &int_expr(3),
        );
        assert!(result.is_none());
        assert!(!reporter.had_error());
    }
}
