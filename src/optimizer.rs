// File: src/optimizer.rs
//
// Expression-tree simplification for the Rill compiler.
// Implements constant folding on literal subtrees (arithmetic, string
// concatenation, booleans, comparisons) and dead-branch elimination for
// conditionals with constant conditions. Runs before code generation so
// semantically identical inputs compile to identical bytecode.

use crate::ast::{BinaryOp, Expr, ExprKind, Stmt, StmtKind, SwitchCase, UnaryOp};
use crate::value::{format_number, to_int32};

/// Statistics tracking what simplifications were performed
#[derive(Debug, Default, Clone)]
pub struct SimplifyStats {
    pub constants_folded: usize,
    pub branches_eliminated: usize,
}

/// Expression-tree simplifier
#[derive(Default)]
pub struct Simplifier {
    pub stats: SimplifyStats,
}

impl Simplifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn simplify_stmts(&mut self, stmts: Vec<Stmt>) -> Vec<Stmt> {
        stmts.into_iter().map(|s| self.simplify_stmt(s)).collect()
    }

    fn simplify_stmt(&mut self, stmt: Stmt) -> Stmt {
        let location = stmt.location.clone();
        let kind = match stmt.kind {
            StmtKind::Expr(e) => StmtKind::Expr(self.simplify_expr(e)),
            StmtKind::VarDecl { name, value } => StmtKind::VarDecl {
                name,
                value: value.map(|v| self.simplify_expr(v)),
            },
            StmtKind::Assign { target, value } => StmtKind::Assign {
                target: self.simplify_expr(target),
                value: self.simplify_expr(value),
            },
            StmtKind::If { condition, then_branch, else_branch } => {
                let condition = self.simplify_expr(condition);
                let then_branch = self.simplify_stmts(then_branch);
                let else_branch = else_branch.map(|b| self.simplify_stmts(b));
                // Dead-branch elimination for a constant condition
                if let Some(truthy) = literal_truthiness(&condition) {
                    self.stats.branches_eliminated += 1;
                    let kept = if truthy { then_branch } else { else_branch.unwrap_or_default() };
                    StmtKind::Block(kept)
                } else {
                    StmtKind::If { condition, then_branch, else_branch }
                }
            }
            StmtKind::While { condition, body } => StmtKind::While {
                condition: self.simplify_expr(condition),
                body: self.simplify_stmts(body),
            },
            StmtKind::DoWhile { body, condition } => StmtKind::DoWhile {
                body: self.simplify_stmts(body),
                condition: self.simplify_expr(condition),
            },
            StmtKind::For { init, condition, update, body } => StmtKind::For {
                init: init.map(|s| Box::new(self.simplify_stmt(*s))),
                condition: condition.map(|c| self.simplify_expr(c)),
                update: update.map(|s| Box::new(self.simplify_stmt(*s))),
                body: self.simplify_stmts(body),
            },
            StmtKind::Foreach { name, iterable, body } => StmtKind::Foreach {
                name,
                iterable: self.simplify_expr(iterable),
                body: self.simplify_stmts(body),
            },
            StmtKind::Switch { subject, cases, default } => StmtKind::Switch {
                subject: self.simplify_expr(subject),
                cases: cases
                    .into_iter()
                    .map(|case| SwitchCase {
                        values: case.values.into_iter().map(|v| self.simplify_expr(v)).collect(),
                        body: self.simplify_stmts(case.body),
                    })
                    .collect(),
                default: default.map(|b| self.simplify_stmts(b)),
            },
            StmtKind::Return(value) => StmtKind::Return(value.map(|v| self.simplify_expr(v))),
            StmtKind::TryCatch { try_body, catch_name, catch_body, finally_body } => {
                StmtKind::TryCatch {
                    try_body: self.simplify_stmts(try_body),
                    catch_name,
                    catch_body: catch_body.map(|b| self.simplify_stmts(b)),
                    finally_body: finally_body.map(|b| self.simplify_stmts(b)),
                }
            }
            StmtKind::Block(body) => StmtKind::Block(self.simplify_stmts(body)),
            StmtKind::FuncDecl(mut decl) => {
                decl.body = self.simplify_stmts(decl.body);
                StmtKind::FuncDecl(decl)
            }
            StmtKind::Export { decl } => StmtKind::Export {
                decl: Box::new(self.simplify_stmt(*decl)),
            },
            other @ (StmtKind::Break | StmtKind::Continue | StmtKind::Import { .. }) => other,
        };
        Stmt::new(kind, location)
    }

    pub fn simplify_expr(&mut self, expr: Expr) -> Expr {
        let location = expr.location.clone();
        let kind = match expr.kind {
            ExprKind::Binary { op, left, right } => {
                let left = self.simplify_expr(*left);
                let right = self.simplify_expr(*right);
                match self.try_fold_binary(op, &left, &right) {
                    Some(folded) => {
                        self.stats.constants_folded += 1;
                        folded
                    }
                    None => ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) },
                }
            }
            ExprKind::Unary { op, operand } => {
                let operand = self.simplify_expr(*operand);
                match self.try_fold_unary(op, &operand) {
                    Some(folded) => {
                        self.stats.constants_folded += 1;
                        folded
                    }
                    None => ExprKind::Unary { op, operand: Box::new(operand) },
                }
            }
            ExprKind::Ternary { condition, then_value, else_value } => {
                let condition = self.simplify_expr(*condition);
                let then_value = self.simplify_expr(*then_value);
                let else_value = self.simplify_expr(*else_value);
                if let Some(truthy) = literal_truthiness(&condition) {
                    self.stats.branches_eliminated += 1;
                    if truthy { then_value.kind } else { else_value.kind }
                } else {
                    ExprKind::Ternary {
                        condition: Box::new(condition),
                        then_value: Box::new(then_value),
                        else_value: Box::new(else_value),
                    }
                }
            }
            ExprKind::Index { object, index } => ExprKind::Index {
                object: Box::new(self.simplify_expr(*object)),
                index: Box::new(self.simplify_expr(*index)),
            },
            ExprKind::Field { object, name } => ExprKind::Field {
                object: Box::new(self.simplify_expr(*object)),
                name,
            },
            ExprKind::Slice { object, start, end, step } => ExprKind::Slice {
                object: Box::new(self.simplify_expr(*object)),
                start: start.map(|e| Box::new(self.simplify_expr(*e))),
                end: end.map(|e| Box::new(self.simplify_expr(*e))),
                step: step.map(|e| Box::new(self.simplify_expr(*e))),
            },
            ExprKind::Call { callee, args } => ExprKind::Call {
                callee: Box::new(self.simplify_expr(*callee)),
                args: args.into_iter().map(|a| self.simplify_expr(a)).collect(),
            },
            ExprKind::MethodCall { receiver, method, args } => ExprKind::MethodCall {
                receiver: Box::new(self.simplify_expr(*receiver)),
                method,
                args: args.into_iter().map(|a| self.simplify_expr(a)).collect(),
            },
            ExprKind::Function(mut decl) => {
                decl.body = self.simplify_stmts(decl.body);
                ExprKind::Function(decl)
            }
            ExprKind::ObjectLiteral(fields) => ExprKind::ObjectLiteral(
                fields.into_iter().map(|(k, v)| (k, self.simplify_expr(v))).collect(),
            ),
            ExprKind::ArrayLiteral(elements) => ExprKind::ArrayLiteral(
                elements.into_iter().map(|e| self.simplify_expr(e)).collect(),
            ),
            ExprKind::Yield(inner) => ExprKind::Yield(Box::new(self.simplify_expr(*inner))),
            other => other,
        };
        Expr::new(kind, location)
    }

    fn try_fold_binary(&self, op: BinaryOp, left: &Expr, right: &Expr) -> Option<ExprKind> {
        use BinaryOp::*;

        // Short-circuit operators fold whenever the left side is a literal:
        // `&&` yields the left value when it is falsy, the right otherwise.
        if op == And || op == Or {
            let truthy = literal_truthiness(left)?;
            let keep_left = if op == And { !truthy } else { truthy };
            return Some(if keep_left { left.kind.clone() } else { right.kind.clone() });
        }

        match (&left.kind, &right.kind) {
            (ExprKind::Number(a), ExprKind::Number(b)) => match op {
                Add => Some(ExprKind::Number(a + b)),
                Sub => Some(ExprKind::Number(a - b)),
                Mul => Some(ExprKind::Number(a * b)),
                Div => Some(ExprKind::Number(a / b)),
                Mod => Some(ExprKind::Number(a % b)),
                Exp => Some(ExprKind::Number(a.powf(*b))),
                Eq => Some(ExprKind::Bool(a == b)),
                Neq => Some(ExprKind::Bool(a != b)),
                Gt => Some(ExprKind::Bool(a > b)),
                Gte => Some(ExprKind::Bool(a >= b)),
                Lt => Some(ExprKind::Bool(a < b)),
                Lte => Some(ExprKind::Bool(a <= b)),
                BitAnd => Some(ExprKind::Number((to_int32(*a) & to_int32(*b)) as f64)),
                BitOr => Some(ExprKind::Number((to_int32(*a) | to_int32(*b)) as f64)),
                BitXor => Some(ExprKind::Number((to_int32(*a) ^ to_int32(*b)) as f64)),
                BitLShift => {
                    Some(ExprKind::Number((to_int32(*a).wrapping_shl(to_int32(*b) as u32 & 31)) as f64))
                }
                BitRShift => {
                    Some(ExprKind::Number((to_int32(*a).wrapping_shr(to_int32(*b) as u32 & 31)) as f64))
                }
                _ => None,
            },
            (ExprKind::Str(a), ExprKind::Str(b)) => match op {
                Add => Some(ExprKind::Str(format!("{}{}", a, b))),
                Eq => Some(ExprKind::Bool(a == b)),
                Neq => Some(ExprKind::Bool(a != b)),
                Gt => Some(ExprKind::Bool(a > b)),
                Gte => Some(ExprKind::Bool(a >= b)),
                Lt => Some(ExprKind::Bool(a < b)),
                Lte => Some(ExprKind::Bool(a <= b)),
                _ => None,
            },
            (ExprKind::Str(a), ExprKind::Number(b)) if op == Add => {
                Some(ExprKind::Str(format!("{}{}", a, format_number(*b))))
            }
            (ExprKind::Number(a), ExprKind::Str(b)) if op == Add => {
                Some(ExprKind::Str(format!("{}{}", format_number(*a), b)))
            }
            (ExprKind::Bool(a), ExprKind::Bool(b)) => match op {
                Eq => Some(ExprKind::Bool(a == b)),
                Neq => Some(ExprKind::Bool(a != b)),
                _ => None,
            },
            _ => None,
        }
    }

    fn try_fold_unary(&self, op: UnaryOp, operand: &Expr) -> Option<ExprKind> {
        match (op, &operand.kind) {
            (UnaryOp::Neg, ExprKind::Number(n)) => Some(ExprKind::Number(-n)),
            (UnaryOp::BitNot, ExprKind::Number(n)) => Some(ExprKind::Number(!to_int32(*n) as f64)),
            (UnaryOp::Not, _) => literal_truthiness(operand).map(|t| ExprKind::Bool(!t)),
            _ => None,
        }
    }
}

/// Truthiness of a literal expression, or None if it is not a literal
fn literal_truthiness(expr: &Expr) -> Option<bool> {
    match &expr.kind {
        ExprKind::Bool(b) => Some(*b),
        ExprKind::Null | ExprKind::Undefined => Some(false),
        ExprKind::Number(_) | ExprKind::Str(_) => Some(true),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SourceLocation;

    fn num(n: f64) -> Expr {
        Expr::new(ExprKind::Number(n), SourceLocation::unknown())
    }

    fn string(s: &str) -> Expr {
        Expr::new(ExprKind::Str(s.to_string()), SourceLocation::unknown())
    }

    fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::new(
            ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) },
            SourceLocation::unknown(),
        )
    }

    #[test]
    fn test_folds_nested_arithmetic() {
        // 3 + 4 * 2 folds to 11
        let expr = binary(BinaryOp::Add, num(3.0), binary(BinaryOp::Mul, num(4.0), num(2.0)));
        let mut simplifier = Simplifier::new();
        let folded = simplifier.simplify_expr(expr);
        assert!(matches!(folded.kind, ExprKind::Number(n) if n == 11.0));
        assert_eq!(simplifier.stats.constants_folded, 2);
    }

    #[test]
    fn test_folds_string_concat() {
        let expr = binary(BinaryOp::Add, string("a"), binary(BinaryOp::Add, string("b"), num(2.0)));
        let folded = Simplifier::new().simplify_expr(expr);
        assert!(matches!(folded.kind, ExprKind::Str(s) if s == "ab2"));
    }

    #[test]
    fn test_folds_comparisons_and_not() {
        let expr = Expr::new(
            ExprKind::Unary {
                op: UnaryOp::Not,
                operand: Box::new(binary(BinaryOp::Lt, num(1.0), num(2.0))),
            },
            SourceLocation::unknown(),
        );
        let folded = Simplifier::new().simplify_expr(expr);
        assert!(matches!(folded.kind, ExprKind::Bool(false)));
    }

    #[test]
    fn test_division_by_zero_folds_to_infinity() {
        let folded = Simplifier::new().simplify_expr(binary(BinaryOp::Div, num(1.0), num(0.0)));
        assert!(matches!(folded.kind, ExprKind::Number(n) if n.is_infinite()));
    }

    #[test]
    fn test_short_circuit_folding() {
        // false && x keeps the literal false without touching x
        let expr = binary(
            BinaryOp::And,
            Expr::new(ExprKind::Bool(false), SourceLocation::unknown()),
            Expr::new(ExprKind::Identifier("x".to_string()), SourceLocation::unknown()),
        );
        let folded = Simplifier::new().simplify_expr(expr);
        assert!(matches!(folded.kind, ExprKind::Bool(false)));

        // true && x keeps x
        let expr = binary(
            BinaryOp::And,
            Expr::new(ExprKind::Bool(true), SourceLocation::unknown()),
            Expr::new(ExprKind::Identifier("x".to_string()), SourceLocation::unknown()),
        );
        let folded = Simplifier::new().simplify_expr(expr);
        assert!(matches!(folded.kind, ExprKind::Identifier(name) if name == "x"));
    }

    #[test]
    fn test_dead_branch_elimination() {
        let stmt = Stmt::new(
            StmtKind::If {
                condition: Expr::new(ExprKind::Bool(true), SourceLocation::unknown()),
                then_branch: vec![Stmt::new(StmtKind::Break, SourceLocation::unknown())],
                else_branch: Some(vec![Stmt::new(StmtKind::Continue, SourceLocation::unknown())]),
            },
            SourceLocation::unknown(),
        );
        let mut simplifier = Simplifier::new();
        let simplified = simplifier.simplify_stmt(stmt);
        match simplified.kind {
            StmtKind::Block(body) => {
                assert_eq!(body.len(), 1);
                assert!(matches!(body[0].kind, StmtKind::Break));
            }
            other => panic!("Expected block, got {:?}", other),
        }
        assert_eq!(simplifier.stats.branches_eliminated, 1);
    }

    #[test]
    fn test_non_literal_subtrees_are_preserved() {
        let expr = binary(
            BinaryOp::Add,
            Expr::new(ExprKind::Identifier("x".to_string()), SourceLocation::unknown()),
            num(1.0),
        );
        let folded = Simplifier::new().simplify_expr(expr);
        assert!(matches!(folded.kind, ExprKind::Binary { .. }));
    }
}
