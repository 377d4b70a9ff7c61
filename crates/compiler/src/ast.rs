//! Abstract syntax tree
//!
//! Closed statement and expression sums. Every expression carries
//! synthesized attributes that the type resolver fills in: the resolved
//! type, the originating token for diagnostics, an lvalue flag, a numeric
//! conversion tag, and the resolution of names to stable slots or targets.
//! The code generator assumes every reachable node of a successfully
//! checked AST is annotated.

use crate::scanner::Token;
use crate::types::TypeDesc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NumericConversion {
    #[default]
    None,
    IntToFloat,
    FloatToInt,
}

/// How a name resolved. Back-references are stable indices (or, for
/// cross-module targets, the imported module's absolute path, mapped to
/// its final index by the code generator after dependency sorting).
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ScopeKind {
    #[default]
    Unresolved,
    /// Slot in the enclosing call frame
    Local { slot: usize },
    /// Slot in the enclosing module frame
    Global { slot: usize },
    /// Function in the module currently being compiled
    Function { name: String },
    /// Function in an imported module
    ModuleFunction { module_path: String, name: String },
    /// Entry in the native table
    Native { name: String },
    /// A module name used before `::`
    Module { path: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynthesizedAttrs {
    pub resolved: Option<TypeDesc>,
    /// Originating token, for diagnostics and line numbers
    pub token: Token,
    pub is_lvalue: bool,
    pub conversion: NumericConversion,
    pub scope: ScopeKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub attrs: SynthesizedAttrs,
}

impl Expr {
    pub fn new(kind: ExprKind, token: Token) -> Self {
        Expr {
            kind,
            attrs: SynthesizedAttrs {
                token,
                ..SynthesizedAttrs::default()
            },
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self.kind, ExprKind::Literal(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    Int(i32),
    Float(f64),
    String(String),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(LiteralValue),
    Variable {
        name: Token,
    },
    Assign {
        name: Token,
        operator: Token,
        value: Box<Expr>,
    },
    Binary {
        left: Box<Expr>,
        operator: Token,
        right: Box<Expr>,
    },
    Logical {
        left: Box<Expr>,
        operator: Token,
        right: Box<Expr>,
    },
    Unary {
        operator: Token,
        operand: Box<Expr>,
    },
    Ternary {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
    Comma {
        expressions: Vec<Expr>,
    },
    Grouping {
        inner: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        arguments: Vec<Expr>,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    /// `object[index] op= value`
    ListAssign {
        object: Box<Expr>,
        index: Box<Expr>,
        operator: Token,
        value: Box<Expr>,
    },
    List {
        elements: Vec<Expr>,
    },
    /// `[element; count]`
    ListRepeat {
        element: Box<Expr>,
        count: Box<Expr>,
    },
    Tuple {
        elements: Vec<Expr>,
    },
    /// `object.name`; `name` is an identifier or an integer literal
    /// (tuple field access)
    Get {
        object: Box<Expr>,
        name: Token,
    },
    /// `object.name op= value`
    Set {
        object: Box<Expr>,
        name: Token,
        operator: Token,
        value: Box<Expr>,
    },
    /// A name known to be a scope (module) before `::`
    ScopeName {
        name: Token,
    },
    /// `scope::name`
    ScopeAccess {
        scope: Box<Expr>,
        name: Token,
    },
    Move {
        variable: Box<Expr>,
    },
    This,
    Super {
        name: Token,
    },
    /// Recovery sentinel left behind by a failed parse so later phases
    /// can skip it without disturbing their traversal
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
    Protected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: Token,
    pub params: Vec<(Token, TypeDesc)>,
    pub return_type: TypeDesc,
    pub body: Vec<Stmt>,
    /// Highest frame slot count seen in the body, filled by the resolver
    pub locals_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDecl {
    pub name: Token,
    pub members: Vec<(Stmt, Visibility)>,
    pub methods: Vec<(FunctionDecl, Visibility)>,
    pub ctor: Option<usize>,
    pub dtor: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expression {
        expr: Expr,
    },
    /// `var`/`const`/`ref` declaration; slot and conversion are filled by
    /// the resolver
    Var {
        keyword: Token,
        name: Token,
        declared_type: Option<TypeDesc>,
        initializer: Expr,
        resolved_type: Option<TypeDesc>,
        conversion: NumericConversion,
        slot: usize,
        global: bool,
    },
    Function(FunctionDecl),
    Class(ClassDecl),
    If {
        keyword: Token,
        condition: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    /// `while`; `increment` carries the third clause of a desugared
    /// `for` so that `continue` still runs it
    While {
        keyword: Token,
        condition: Expr,
        body: Box<Stmt>,
        increment: Option<Box<Stmt>>,
    },
    Block {
        statements: Vec<Stmt>,
    },
    Return {
        keyword: Token,
        value: Option<Expr>,
    },
    Break {
        keyword: Token,
    },
    Continue {
        keyword: Token,
    },
    Switch {
        condition: Expr,
        cases: Vec<(Expr, Stmt)>,
        default: Option<Box<Stmt>>,
    },
    TypeAlias {
        name: Token,
        aliased: TypeDesc,
    },
    /// Parsed import; the module itself was parsed recursively by the
    /// driver and registered under `path`
    Import {
        keyword: Token,
        path: String,
    },
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::TokenKind;

    #[test]
    fn test_expr_starts_unresolved() {
        let token = Token::new(TokenKind::IntValue, "1", 1, 0, 1);
        let expr = Expr::new(ExprKind::Literal(LiteralValue::Int(1)), token);
        assert!(expr.attrs.resolved.is_none());
        assert_eq!(expr.attrs.scope, ScopeKind::Unresolved);
        assert!(expr.is_literal());
    }
}
