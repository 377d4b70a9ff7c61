//! Parser for Rill
//!
//! A hand-written Pratt parser. A rule table maps each token kind to a
//! prefix handler, an infix handler and a precedence; `parse_precedence`
//! drives them. Assignment is handled at `Assignment` precedence with an
//! assignability check on the left-hand side.
//!
//! Literal binary, unary and ternary subtrees are folded at parse time
//! (the `fold-constants` option, on by default); folding never changes
//! observable behavior, it only precomputes it.
//!
//! On a parse error the parser reports, then synchronizes to the next
//! statement boundary and leaves an `Error` node behind, so one pass
//! reports as many errors as possible.

use crate::ast::{
    ClassDecl, Expr, ExprKind, FunctionDecl, LiteralValue, Stmt, Visibility,
};
use crate::config::FlagLevel;
use crate::driver::{import_module, CompilerContext, FunctionSig, ParsedModule};
use crate::folding;
use crate::scanner::{Scanner, Token, TokenKind, TOKEN_KIND_COUNT};
use crate::types::TypeDesc;

/// Signal that a rule failed after reporting; `declaration` catches it
/// and synchronizes.
pub(crate) struct ParseInterrupt;

pub(crate) type PResult<T> = Result<T, ParseInterrupt>;

type PrefixFn<'c> = for<'r> fn(&'r mut Parser<'c>, bool) -> PResult<Expr>;
type InfixFn<'c> = for<'r> fn(&'r mut Parser<'c>, bool, Expr) -> PResult<Expr>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Comma,
    Assignment,
    Ternary,
    LogicOr,
    LogicAnd,
    BitOr,
    BitXor,
    BitAnd,
    Equality,
    Ordering,
    Shift,
    Range,
    Sum,
    Product,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn one_higher(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Comma,
            Precedence::Comma => Precedence::Assignment,
            Precedence::Assignment => Precedence::Ternary,
            Precedence::Ternary => Precedence::LogicOr,
            Precedence::LogicOr => Precedence::LogicAnd,
            Precedence::LogicAnd => Precedence::BitOr,
            Precedence::BitOr => Precedence::BitXor,
            Precedence::BitXor => Precedence::BitAnd,
            Precedence::BitAnd => Precedence::Equality,
            Precedence::Equality => Precedence::Ordering,
            Precedence::Ordering => Precedence::Shift,
            Precedence::Shift => Precedence::Range,
            Precedence::Range => Precedence::Sum,
            Precedence::Sum => Precedence::Product,
            Precedence::Product => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

#[derive(Clone, Copy)]
struct ParseRule<'c> {
    prefix: Option<PrefixFn<'c>>,
    infix: Option<InfixFn<'c>>,
    precedence: Precedence,
}

impl<'c> ParseRule<'c> {
    const EMPTY: ParseRule<'c> = ParseRule {
        prefix: None,
        infix: None,
        precedence: Precedence::None,
    };
}

const ASSIGN_OPS: [TokenKind; 5] = [
    TokenKind::Equal,
    TokenKind::PlusEqual,
    TokenKind::MinusEqual,
    TokenKind::StarEqual,
    TokenKind::SlashEqual,
];

pub struct Parser<'c> {
    ctx: &'c mut CompilerContext,
    module: &'c mut ParsedModule,
    scanner: Scanner,
    rules: [ParseRule<'c>; TOKEN_KIND_COUNT],
    current: Token,
    next: Token,
    depth: usize,
    scope_depth: usize,
    expr_depth: usize,
    in_class: bool,
    in_function: bool,
    in_loop: bool,
    in_switch: bool,
}

impl<'c> Parser<'c> {
    pub fn new(
        ctx: &'c mut CompilerContext,
        module: &'c mut ParsedModule,
        mut scanner: Scanner,
        depth: usize,
    ) -> Self {
        let next = scanner.scan_token(&mut ctx.reporter);
        let mut parser = Parser {
            ctx,
            module,
            scanner,
            rules: [ParseRule::EMPTY; TOKEN_KIND_COUNT],
            current: Token::default(),
            next,
            depth,
            scope_depth: 0,
            expr_depth: 0,
            in_class: false,
            in_function: false,
            in_loop: false,
            in_switch: false,
        };
        parser.setup_rules();
        parser
    }

    fn add_rule(
        &mut self,
        kind: TokenKind,
        prefix: Option<PrefixFn<'c>>,
        infix: Option<InfixFn<'c>>,
        precedence: Precedence,
    ) {
        self.rules[kind as usize] = ParseRule {
            prefix,
            infix,
            precedence,
        };
    }

    fn rule(&self, kind: TokenKind) -> ParseRule<'c> {
        self.rules[kind as usize]
    }

    #[rustfmt::skip]
    fn setup_rules(&mut self) {
        type K = TokenKind;
        let prefix = |f: PrefixFn<'c>| Some(f);
        let infix = |f: InfixFn<'c>| Some(f);
        self.add_rule(K::Comma,        None,                           infix(Parser::comma),        Precedence::Comma);
        self.add_rule(K::Question,     None,                           infix(Parser::ternary),      Precedence::Ternary);
        self.add_rule(K::Or,           None,                           infix(Parser::or_),          Precedence::LogicOr);
        self.add_rule(K::And,          None,                           infix(Parser::and_),         Precedence::LogicAnd);
        self.add_rule(K::BitOr,        None,                           infix(Parser::binary),       Precedence::BitOr);
        self.add_rule(K::BitXor,       None,                           infix(Parser::binary),       Precedence::BitXor);
        self.add_rule(K::BitAnd,       None,                           infix(Parser::binary),       Precedence::BitAnd);
        self.add_rule(K::NotEqual,     None,                           infix(Parser::binary),       Precedence::Equality);
        self.add_rule(K::EqualEqual,   None,                           infix(Parser::binary),       Precedence::Equality);
        self.add_rule(K::Greater,      None,                           infix(Parser::binary),       Precedence::Ordering);
        self.add_rule(K::GreaterEqual, None,                           infix(Parser::binary),       Precedence::Ordering);
        self.add_rule(K::Less,         None,                           infix(Parser::binary),       Precedence::Ordering);
        self.add_rule(K::LessEqual,    None,                           infix(Parser::binary),       Precedence::Ordering);
        self.add_rule(K::RightShift,   None,                           infix(Parser::binary),       Precedence::Shift);
        self.add_rule(K::LeftShift,    None,                           infix(Parser::binary),       Precedence::Shift);
        self.add_rule(K::DotDot,       None,                           infix(Parser::binary),       Precedence::Range);
        self.add_rule(K::DotDotEqual,  None,                           infix(Parser::binary),       Precedence::Range);
        self.add_rule(K::Minus,        prefix(Parser::unary),          infix(Parser::binary),       Precedence::Sum);
        self.add_rule(K::Plus,         prefix(Parser::unary),          infix(Parser::binary),       Precedence::Sum);
        self.add_rule(K::Modulo,       None,                           infix(Parser::binary),       Precedence::Product);
        self.add_rule(K::Slash,        None,                           infix(Parser::binary),       Precedence::Product);
        self.add_rule(K::Star,         None,                           infix(Parser::binary),       Precedence::Product);
        self.add_rule(K::Not,          prefix(Parser::unary),          None,                        Precedence::Unary);
        self.add_rule(K::BitNot,       prefix(Parser::unary),          None,                        Precedence::Unary);
        self.add_rule(K::PlusPlus,     prefix(Parser::unary),          None,                        Precedence::Unary);
        self.add_rule(K::MinusMinus,   prefix(Parser::unary),          None,                        Precedence::Unary);
        self.add_rule(K::Dot,          None,                           infix(Parser::dot),          Precedence::Call);
        self.add_rule(K::LeftParen,    prefix(Parser::grouping),       infix(Parser::call),         Precedence::Call);
        self.add_rule(K::LeftIndex,    prefix(Parser::list),           infix(Parser::index),        Precedence::Call);
        self.add_rule(K::LeftBrace,    prefix(Parser::tuple),          None,                        Precedence::None);
        self.add_rule(K::DoubleColon,  None,                           infix(Parser::scope_access), Precedence::Primary);
        self.add_rule(K::Identifier,   prefix(Parser::variable),       None,                        Precedence::None);
        self.add_rule(K::StringValue,  prefix(Parser::literal),        None,                        Precedence::None);
        self.add_rule(K::IntValue,     prefix(Parser::literal),        None,                        Precedence::None);
        self.add_rule(K::FloatValue,   prefix(Parser::literal),        None,                        Precedence::None);
        self.add_rule(K::False,        prefix(Parser::literal),        None,                        Precedence::None);
        self.add_rule(K::True,         prefix(Parser::literal),        None,                        Precedence::None);
        self.add_rule(K::Null,         prefix(Parser::literal),        None,                        Precedence::None);
        self.add_rule(K::Int,          prefix(Parser::variable),       None,                        Precedence::None);
        self.add_rule(K::Float,        prefix(Parser::variable),       None,                        Precedence::None);
        self.add_rule(K::String,       prefix(Parser::variable),       None,                        Precedence::None);
        self.add_rule(K::Move,         prefix(Parser::move_),          None,                        Precedence::Primary);
        self.add_rule(K::Super,        prefix(Parser::super_),         None,                        Precedence::None);
        self.add_rule(K::This,         prefix(Parser::this_),          None,                        Precedence::None);
    }

    // ------------------------------------------------------------------
    // Token plumbing
    // ------------------------------------------------------------------

    fn error(&mut self, message: impl Into<String>, token: &Token) {
        self.ctx.reporter.error(&self.module.name, message, token);
    }

    fn warning(&mut self, message: impl Into<String>, token: &Token) {
        self.ctx.reporter.warning(&self.module.name, message, token);
    }

    fn note(&mut self, message: impl Into<String>) {
        self.ctx.reporter.note(&self.module.name, message);
    }

    fn throw(&mut self, message: impl Into<String>, token: Token) -> ParseInterrupt {
        self.error(message, &token);
        ParseInterrupt
    }

    fn is_at_end(&self) -> bool {
        self.next.kind == TokenKind::EndOfFile
    }

    fn peek(&self) -> &Token {
        &self.next
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.next.kind == kind
    }

    fn advance(&mut self) -> PResult<()> {
        if self.current.kind == TokenKind::EndOfFile && self.next.kind == TokenKind::EndOfFile {
            let token = self.current.clone();
            return Err(self.throw("Found unexpected EOF while parsing", token));
        }
        let scanned = self.scanner.scan_token(&mut self.ctx.reporter);
        self.current = std::mem::replace(&mut self.next, scanned);
        Ok(())
    }

    fn match_kinds(&mut self, kinds: &[TokenKind]) -> PResult<bool> {
        if kinds.contains(&self.next.kind) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn consume(&mut self, message: &str, kinds: &[TokenKind]) -> PResult<()> {
        if self.match_kinds(kinds)? {
            Ok(())
        } else {
            let token = self.peek().clone();
            Err(self.throw(message, token))
        }
    }

    fn consume_terminator(&mut self, message: &str) -> PResult<()> {
        self.consume(message, &[TokenKind::Semicolon, TokenKind::EndOfLine])
    }

    fn skip_end_of_lines(&mut self) -> PResult<()> {
        while self.check(TokenKind::EndOfLine) {
            self.advance()?;
        }
        Ok(())
    }

    fn synchronize(&mut self) {
        let _ = self.advance();
        while !self.is_at_end() {
            if matches!(
                self.current.kind,
                TokenKind::Semicolon | TokenKind::EndOfLine | TokenKind::RightBrace
            ) {
                return;
            }
            match self.peek().kind {
                TokenKind::Break
                | TokenKind::Continue
                | TokenKind::Class
                | TokenKind::Fn
                | TokenKind::For
                | TokenKind::If
                | TokenKind::Import
                | TokenKind::Private
                | TokenKind::Protected
                | TokenKind::Public
                | TokenKind::Return
                | TokenKind::Type
                | TokenKind::Const
                | TokenKind::Var
                | TokenKind::While => return,
                _ => {}
            }
            if self.advance().is_err() {
                return;
            }
        }
    }

    fn feature_flag(&mut self, level: FlagLevel, name: &str, message: &str, token: &Token) {
        match level {
            FlagLevel::Warn => {
                self.warning(format!("{} [[ {} = warn ]]", message, name), token);
            }
            FlagLevel::Error => {
                self.error(format!("{} [[ {} = error ]]", message, name), token);
            }
            FlagLevel::None => {}
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_precedence(&mut self, precedence: Precedence) -> PResult<Expr> {
        self.expr_depth += 1;
        let result = self.parse_precedence_inner(precedence);
        self.expr_depth -= 1;
        result
    }

    fn parse_precedence_inner(&mut self, precedence: Precedence) -> PResult<Expr> {
        self.advance()?;

        let prefix = match self.rule(self.current.kind).prefix {
            Some(prefix) => prefix,
            None => {
                let shown = if self.current.kind == TokenKind::EndOfLine {
                    "\\n' (newline)".to_string()
                } else {
                    format!("{}'", self.current.lexeme)
                };
                let message = format!("Unexpected token in expression '{}", shown);
                let had_error_before = self.ctx.reporter.had_error();
                let token = self.current.clone();
                self.error(message, &token);
                if had_error_before {
                    self.note(
                        "This may occur because of previous errors leading to the parser being confused",
                    );
                }
                return Err(ParseInterrupt);
            }
        };

        let can_assign = precedence <= Precedence::Assignment;
        let mut left = prefix(self, can_assign)?;

        while precedence <= self.rule(self.peek().kind).precedence {
            self.advance()?;
            let infix = match self.rule(self.current.kind).infix {
                Some(infix) => infix,
                None => {
                    let message = format!(
                        "'{}' cannot occur in an infix/postfix expression",
                        self.current.lexeme
                    );
                    let token = self.current.clone();
                    self.error(message, &token);
                    if token.kind == TokenKind::PlusPlus {
                        self.note("Postfix increment is not supported");
                    } else if token.kind == TokenKind::MinusMinus {
                        self.note("Postfix decrement is not supported");
                    }
                    return Err(ParseInterrupt);
                }
            };
            left = infix(self, can_assign, left)?;
        }

        if can_assign && self.match_kinds(&ASSIGN_OPS)? {
            let token = self.current.clone();
            return Err(self.throw("Invalid assignment target", token));
        }

        Ok(left)
    }

    fn expression(&mut self) -> PResult<Expr> {
        self.parse_precedence(Precedence::Comma)
    }

    fn assignment(&mut self) -> PResult<Expr> {
        self.parse_precedence(Precedence::Assignment)
    }

    fn binary(&mut self, _can_assign: bool, left: Expr) -> PResult<Expr> {
        let operator = self.current.clone();
        let next = self.rule(operator.kind).precedence.one_higher();
        let right = self.parse_precedence(next)?;

        if self.ctx.options.fold_constants && left.is_literal() && right.is_literal() {
            if let Some(folded) = folding::fold_binary(
                &mut self.ctx.reporter,
                &self.module.name,
                &left,
                &operator,
                &right,
            ) {
                return Ok(folded);
            }
        }

        Ok(Expr::new(
            ExprKind::Binary {
                left: Box::new(left),
                operator: operator.clone(),
                right: Box::new(right),
            },
            operator,
        ))
    }

    fn unary(&mut self, _can_assign: bool) -> PResult<Expr> {
        let operator = self.current.clone();
        let operand = self.parse_precedence(self.rule(operator.kind).precedence)?;

        if self.ctx.options.fold_constants && operand.is_literal() {
            if let Some(folded) = folding::fold_unary(
                &mut self.ctx.reporter,
                &self.module.name,
                &operator,
                &operand,
            ) {
                return Ok(folded);
            }
        }

        Ok(Expr::new(
            ExprKind::Unary {
                operator: operator.clone(),
                operand: Box::new(operand),
            },
            operator,
        ))
    }

    fn ternary(&mut self, _can_assign: bool, condition: Expr) -> PResult<Expr> {
        let question = self.current.clone();
        let level = self.ctx.options.ternary_operator;
        self.feature_flag(level, "ternary-operator", "Usage of ternary operator", &question);

        let then_branch = self.parse_precedence(Precedence::LogicOr)?;
        self.consume("Expected colon in ternary expression", &[TokenKind::Colon])?;
        let else_branch = self.parse_precedence(Precedence::Ternary)?;

        if self.ctx.options.fold_constants
            && condition.is_literal()
            && then_branch.is_literal()
            && else_branch.is_literal()
        {
            if let Some(folded) =
                folding::fold_ternary(&condition, &then_branch, &else_branch)
            {
                return Ok(folded);
            }
        }

        Ok(Expr::new(
            ExprKind::Ternary {
                condition: Box::new(condition),
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
            },
            question,
        ))
    }

    fn comma(&mut self, _can_assign: bool, left: Expr) -> PResult<Expr> {
        let token = self.current.clone();
        let level = self.ctx.options.comma_operator;
        self.feature_flag(level, "comma-operator", "Usage of comma operator", &token);

        let mut expressions = vec![left];
        loop {
            expressions.push(self.assignment()?);
            if !self.match_kinds(&[TokenKind::Comma])? {
                break;
            }
        }
        Ok(Expr::new(ExprKind::Comma { expressions }, token))
    }

    fn and_(&mut self, _can_assign: bool, left: Expr) -> PResult<Expr> {
        let operator = self.current.clone();
        let right = self.parse_precedence(Precedence::LogicAnd)?;
        Ok(Expr::new(
            ExprKind::Logical {
                left: Box::new(left),
                operator: operator.clone(),
                right: Box::new(right),
            },
            operator,
        ))
    }

    fn or_(&mut self, _can_assign: bool, left: Expr) -> PResult<Expr> {
        let operator = self.current.clone();
        let right = self.parse_precedence(Precedence::LogicOr)?;
        Ok(Expr::new(
            ExprKind::Logical {
                left: Box::new(left),
                operator: operator.clone(),
                right: Box::new(right),
            },
            operator,
        ))
    }

    fn grouping(&mut self, _can_assign: bool) -> PResult<Expr> {
        let token = self.current.clone();
        let inner = self.expression()?;
        self.consume(
            "Expected ')' after parenthesized expression",
            &[TokenKind::RightParen],
        )?;
        Ok(Expr::new(
            ExprKind::Grouping {
                inner: Box::new(inner),
            },
            token,
        ))
    }

    fn call(&mut self, _can_assign: bool, callee: Expr) -> PResult<Expr> {
        let paren = self.current.clone();
        let mut arguments = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                arguments.push(self.assignment()?);
                if !self.match_kinds(&[TokenKind::Comma])? {
                    break;
                }
            }
        }
        self.consume("Expected ')' after function call", &[TokenKind::RightParen])?;
        Ok(Expr::new(
            ExprKind::Call {
                callee: Box::new(callee),
                arguments,
            },
            paren,
        ))
    }

    /// Member access. A float literal after `.` means tuple access of the
    /// form `x.2.0`: the literal is split into its two integer components
    /// so the expression parses as `(x.2).0`.
    fn dot(&mut self, can_assign: bool, mut left: Expr) -> PResult<Expr> {
        let name = if self.check(TokenKind::FloatValue) {
            let literal = self.peek().clone();
            let Some(split_at) = literal.lexeme.find('.') else {
                self.advance()?;
                let token = self.current.clone();
                return Err(self.throw("Use of float literal in member access", token));
            };
            let first = Token::new(
                TokenKind::IntValue,
                &literal.lexeme[..split_at],
                literal.line,
                literal.start_column,
                literal.start_column + split_at,
            );
            let second = Token::new(
                TokenKind::IntValue,
                &literal.lexeme[split_at + 1..],
                literal.line,
                literal.start_column + split_at + 1,
                literal.end_column,
            );
            self.advance()?;
            left = Expr::new(
                ExprKind::Get {
                    object: Box::new(left),
                    name: first.clone(),
                },
                first,
            );
            second
        } else {
            self.consume(
                "Expected identifier or integer literal after '.'",
                &[TokenKind::Identifier, TokenKind::IntValue],
            )?;
            self.current.clone()
        };

        if can_assign && self.match_kinds(&ASSIGN_OPS)? {
            let operator = self.current.clone();
            let value = self.assignment()?;
            self.flag_assignment_expression(&operator);
            Ok(Expr::new(
                ExprKind::Set {
                    object: Box::new(left),
                    name,
                    operator: operator.clone(),
                    value: Box::new(value),
                },
                operator,
            ))
        } else {
            let token = name.clone();
            Ok(Expr::new(
                ExprKind::Get {
                    object: Box::new(left),
                    name,
                },
                token,
            ))
        }
    }

    fn index(&mut self, can_assign: bool, object: Expr) -> PResult<Expr> {
        let bracket = self.current.clone();
        let index = self.expression()?;
        self.consume(
            "Expected ']' after array subscript index",
            &[TokenKind::RightIndex],
        )?;

        if can_assign && self.match_kinds(&ASSIGN_OPS)? {
            let operator = self.current.clone();
            let value = self.assignment()?;
            self.flag_assignment_expression(&operator);
            return Ok(Expr::new(
                ExprKind::ListAssign {
                    object: Box::new(object),
                    index: Box::new(index),
                    operator: operator.clone(),
                    value: Box::new(value),
                },
                operator,
            ));
        }
        Ok(Expr::new(
            ExprKind::Index {
                object: Box::new(object),
                index: Box::new(index),
            },
            bracket,
        ))
    }

    fn list(&mut self, _can_assign: bool) -> PResult<Expr> {
        let bracket = self.current.clone();
        let mut elements = Vec::new();
        let mut maybe_list_repeat = true;

        if !self.check(TokenKind::RightIndex) {
            loop {
                let element = self.assignment()?;

                if maybe_list_repeat && self.match_kinds(&[TokenKind::Semicolon])? {
                    let count = self.assignment()?;
                    self.consume(
                        "Expected ']' after list expression",
                        &[TokenKind::RightIndex],
                    )?;
                    return Ok(Expr::new(
                        ExprKind::ListRepeat {
                            element: Box::new(element),
                            count: Box::new(count),
                        },
                        bracket,
                    ));
                }

                maybe_list_repeat = false;
                elements.push(element);
                if !self.match_kinds(&[TokenKind::Comma])? || self.check(TokenKind::RightIndex) {
                    break;
                }
            }
        }

        self.consume(
            "Expected ']' after list expression",
            &[TokenKind::RightIndex],
        )?;
        Ok(Expr::new(ExprKind::List { elements }, bracket))
    }

    fn tuple(&mut self, _can_assign: bool) -> PResult<Expr> {
        let brace = self.current.clone();
        let mut elements = Vec::new();
        while !self.check(TokenKind::RightBrace) {
            elements.push(self.assignment()?);
            self.match_kinds(&[TokenKind::Comma])?;
        }
        self.consume(
            "Expected '}' after tuple expression",
            &[TokenKind::RightBrace],
        )?;
        Ok(Expr::new(ExprKind::Tuple { elements }, brace))
    }

    fn literal(&mut self, _can_assign: bool) -> PResult<Expr> {
        let token = self.current.clone();
        let value = match token.kind {
            TokenKind::IntValue => match token.lexeme.parse::<i32>() {
                Ok(value) => LiteralValue::Int(value),
                Err(_) => {
                    return Err(self.throw("Integer literal out of range", token));
                }
            },
            TokenKind::FloatValue => match token.lexeme.parse::<f64>() {
                Ok(value) => LiteralValue::Float(value),
                Err(_) => {
                    return Err(self.throw("Malformed float literal", token));
                }
            },
            TokenKind::StringValue => {
                // Adjacent string literals concatenate
                let mut text = token.lexeme.clone();
                while self.match_kinds(&[TokenKind::StringValue])? {
                    text.push_str(&self.current.lexeme);
                }
                LiteralValue::String(text)
            }
            TokenKind::True => LiteralValue::Bool(true),
            TokenKind::False => LiteralValue::Bool(false),
            TokenKind::Null => LiteralValue::Null,
            _ => {
                return Err(self.throw("Unexpected token passed to literal parser", token));
            }
        };
        Ok(Expr::new(ExprKind::Literal(value), token))
    }

    fn variable(&mut self, can_assign: bool) -> PResult<Expr> {
        let name = self.current.clone();
        if can_assign && self.match_kinds(&ASSIGN_OPS)? {
            let operator = self.current.clone();
            let value = self.assignment()?;
            self.flag_assignment_expression(&operator);
            Ok(Expr::new(
                ExprKind::Assign {
                    name,
                    operator: operator.clone(),
                    value: Box::new(value),
                },
                operator,
            ))
        } else if self.check(TokenKind::DoubleColon) {
            Ok(Expr::new(ExprKind::ScopeName { name: name.clone() }, name))
        } else {
            Ok(Expr::new(ExprKind::Variable { name: name.clone() }, name))
        }
    }

    fn scope_access(&mut self, _can_assign: bool, left: Expr) -> PResult<Expr> {
        let colon_colon = self.current.clone();
        self.consume(
            "Expected identifier to be accessed after scope name",
            &[TokenKind::Identifier],
        )?;
        let name = self.current.clone();
        Ok(Expr::new(
            ExprKind::ScopeAccess {
                scope: Box::new(left),
                name,
            },
            colon_colon,
        ))
    }

    fn move_(&mut self, _can_assign: bool) -> PResult<Expr> {
        let keyword = self.current.clone();
        self.consume(
            "Expected identifier after 'move' keyword",
            &[TokenKind::Identifier],
        )?;
        let name = self.current.clone();
        let variable = Expr::new(ExprKind::Variable { name: name.clone() }, name);
        Ok(Expr::new(
            ExprKind::Move {
                variable: Box::new(variable),
            },
            keyword,
        ))
    }

    fn this_(&mut self, _can_assign: bool) -> PResult<Expr> {
        if !(self.in_class && self.in_function) {
            let token = self.current.clone();
            return Err(self.throw(
                "Cannot use 'this' keyword outside a class's constructor or destructor",
                token,
            ));
        }
        let keyword = self.current.clone();
        Ok(Expr::new(ExprKind::This, keyword))
    }

    fn super_(&mut self, _can_assign: bool) -> PResult<Expr> {
        if !(self.in_class && self.in_function) {
            let token = self.current.clone();
            return Err(self.throw("Cannot use super expression outside a class", token));
        }
        let keyword = self.current.clone();
        self.consume("Expected '.' after 'super' keyword", &[TokenKind::Dot])?;
        self.consume(
            "Expected name after '.' in super expression",
            &[TokenKind::Identifier],
        )?;
        let name = self.current.clone();
        Ok(Expr::new(ExprKind::Super { name }, keyword))
    }

    /// An assignment nested inside a larger expression trips the
    /// `assignment-expr` feature flag; the root of an expression
    /// statement does not.
    fn flag_assignment_expression(&mut self, operator: &Token) {
        if self.expr_depth > 1 {
            let level = self.ctx.options.assignment_expr;
            let token = operator.clone();
            self.feature_flag(
                level,
                "assignment-expr",
                "Usage of assignment as an expression",
                &token,
            );
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    /// Parse the whole module: declarations until end of file.
    pub fn program(&mut self) -> Vec<Stmt> {
        let mut statements = Vec::new();
        while !self.check(TokenKind::EndOfFile) && !self.check(TokenKind::EndOfLine) {
            statements.push(self.declaration());
        }
        if self.check(TokenKind::EndOfLine) {
            let _ = self.advance();
        }
        if !self.check(TokenKind::EndOfFile) {
            let token = self.peek().clone();
            self.error("Expected EOF at the end of file", &token);
        }
        statements
    }

    fn declaration(&mut self) -> Stmt {
        let result = (|| -> PResult<Stmt> {
            if self.match_kinds(&[TokenKind::Class])? {
                self.class_declaration()
            } else if self.match_kinds(&[TokenKind::Fn])? {
                self.function_declaration().map(Stmt::Function)
            } else if self.match_kinds(&[TokenKind::Import])? {
                self.import_statement()
            } else if self.match_kinds(&[TokenKind::Type])? {
                self.type_declaration()
            } else if self.match_kinds(&[TokenKind::Var, TokenKind::Const, TokenKind::Ref])? {
                self.variable_declaration()
            } else {
                self.statement()
            }
        })();
        match result {
            Ok(statement) => statement,
            Err(ParseInterrupt) => {
                self.synchronize();
                Stmt::Error
            }
        }
    }

    fn class_declaration(&mut self) -> PResult<Stmt> {
        self.consume(
            "Expected class name after 'class' keyword",
            &[TokenKind::Identifier],
        )?;
        let name = self.current.clone();

        if self.module.classes.contains(&name.lexeme) {
            return Err(self.throw("Class already defined", name));
        }

        let mut members: Vec<(Stmt, Visibility)> = Vec::new();
        let mut methods: Vec<(FunctionDecl, Visibility)> = Vec::new();
        let mut ctor = None;
        let mut dtor = None;

        self.consume("Expected '{' after class name", &[TokenKind::LeftBrace])?;
        let was_in_class = std::mem::replace(&mut self.in_class, true);

        while !self.is_at_end() && !self.check(TokenKind::RightBrace) {
            if let Err(interrupt) = self.consume(
                "Expected 'public', 'private' or 'protected' modifier before member declaration",
                &[TokenKind::Private, TokenKind::Public, TokenKind::Protected],
            ) {
                self.in_class = was_in_class;
                return Err(interrupt);
            }

            let visibility = match self.current.kind {
                TokenKind::Public => Visibility::Public,
                TokenKind::Private => Visibility::Private,
                _ => Visibility::Protected,
            };

            if self
                .match_kinds(&[TokenKind::Var, TokenKind::Const, TokenKind::Ref])
                .unwrap_or(false)
            {
                match self.variable_declaration() {
                    Ok(member) => members.push((member, visibility)),
                    Err(ParseInterrupt) => self.synchronize(),
                }
            } else if self.match_kinds(&[TokenKind::Fn]).unwrap_or(false) {
                let found_dtor = self.match_kinds(&[TokenKind::BitNot]).unwrap_or(false);
                if found_dtor && self.peek().lexeme != name.lexeme {
                    let token = self.peek().clone();
                    self.error(
                        "The name of the destructor has to be the same as the name of the class",
                        &token,
                    );
                    self.synchronize();
                    continue;
                }
                match self.function_declaration() {
                    Ok(mut method) => {
                        if method.name.lexeme == name.lexeme {
                            if found_dtor && dtor.is_none() {
                                method.name.lexeme = format!("~{}", method.name.lexeme);
                                dtor = Some(methods.len());
                            } else if !found_dtor && ctor.is_none() {
                                ctor = Some(methods.len());
                            } else {
                                let token = method.name.clone();
                                self.error(
                                    "Cannot declare constructors or destructors more than once",
                                    &token,
                                );
                            }
                        }
                        methods.push((method, visibility));
                    }
                    Err(ParseInterrupt) => self.synchronize(),
                }
            } else {
                self.in_class = was_in_class;
                let token = self.peek().clone();
                return Err(
                    self.throw("Expected either member or method declaration in class", token)
                );
            }
        }

        self.in_class = was_in_class;
        self.consume(
            "Expected '}' at the end of class declaration",
            &[TokenKind::RightBrace],
        )?;

        self.module.classes.insert(name.lexeme.clone());
        Ok(Stmt::Class(ClassDecl {
            name,
            members,
            methods,
            ctor,
            dtor,
        }))
    }

    fn function_declaration(&mut self) -> PResult<FunctionDecl> {
        self.consume(
            "Expected function name after 'fn' keyword",
            &[TokenKind::Identifier],
        )?;
        let name = self.current.clone();

        if !self.in_class && self.module.functions.contains_key(&name.lexeme) {
            return Err(self.throw("Function already defined", name));
        }

        self.consume("Expected '(' after function name", &[TokenKind::LeftParen])?;

        self.scope_depth += 1;
        let declaration = (|| -> PResult<FunctionDecl> {
            let mut params = Vec::new();
            if !self.check(TokenKind::RightParen) {
                loop {
                    self.consume(
                        "Expected parameter name",
                        &[TokenKind::Identifier],
                    )?;
                    let parameter_name = self.current.clone();
                    self.consume(
                        "Expected ':' after function parameter name",
                        &[TokenKind::Colon],
                    )?;
                    let parameter_type = self.type_annotation()?;
                    params.push((parameter_name, parameter_type));
                    if !self.match_kinds(&[TokenKind::Comma])? {
                        break;
                    }
                }
            }
            self.consume(
                "Expected ')' after function parameters",
                &[TokenKind::RightParen],
            )?;

            // The scanner may emit end-of-lines after ')'
            self.skip_end_of_lines()?;

            self.consume("Expected '->' after ')' to specify type", &[TokenKind::Arrow])?;
            let return_type = self.type_annotation()?;
            self.skip_end_of_lines()?;
            self.consume(
                "Expected '{' after function return type",
                &[TokenKind::LeftBrace],
            )?;

            let was_in_function = std::mem::replace(&mut self.in_function, true);
            let body = self.block_statements();
            self.in_function = was_in_function;

            Ok(FunctionDecl {
                name: name.clone(),
                params,
                return_type,
                body: body?,
                locals_count: 0,
            })
        })();
        self.scope_depth -= 1;
        let declaration = declaration?;

        if !self.in_class && self.scope_depth == 0 {
            self.module.functions.insert(
                name.lexeme.clone(),
                FunctionSig {
                    params: declaration
                        .params
                        .iter()
                        .map(|(_, param_type)| param_type.clone())
                        .collect(),
                    return_type: declaration.return_type.clone(),
                },
            );
        }

        Ok(declaration)
    }

    fn import_statement(&mut self) -> PResult<Stmt> {
        let keyword = self.current.clone();
        self.consume(
            "Expected path to module after 'import' keyword",
            &[TokenKind::StringValue],
        )?;
        let imported = self.current.clone();
        self.consume_terminator("Expected ';' or newline after imported file")?;

        match import_module(self.ctx, &imported.lexeme, self.depth + 1) {
            Ok((path, index)) => {
                if !self.module.imported.contains(&index) {
                    self.module.imported.push(index);
                }
                Ok(Stmt::Import { keyword, path })
            }
            Err(message) => {
                self.error(message, &imported);
                Err(ParseInterrupt)
            }
        }
    }

    fn type_declaration(&mut self) -> PResult<Stmt> {
        self.consume(
            "Expected type name after 'type' keyword",
            &[TokenKind::Identifier],
        )?;
        let name = self.current.clone();
        self.consume("Expected '=' after type name", &[TokenKind::Equal])?;
        let aliased = self.type_annotation()?;
        self.consume_terminator("Expected ';' or newline after type alias")?;
        Ok(Stmt::TypeAlias { name, aliased })
    }

    fn variable_declaration(&mut self) -> PResult<Stmt> {
        let keyword = self.current.clone();
        let keyword_name = match keyword.kind {
            TokenKind::Var => "var",
            TokenKind::Const => "const",
            _ => "ref",
        };
        self.consume(
            &format!("Expected variable name after '{}' keyword", keyword_name),
            &[TokenKind::Identifier],
        )?;
        let name = self.current.clone();

        let declared_type = if self.match_kinds(&[TokenKind::Colon])? {
            Some(self.type_annotation()?)
        } else {
            None
        };
        self.consume(
            "Expected initializer after variable name",
            &[TokenKind::Equal],
        )?;
        let initializer = self.expression()?;
        self.consume_terminator("Expected ';' or newline after variable initializer")?;

        Ok(Stmt::Var {
            keyword,
            name,
            declared_type,
            initializer,
            resolved_type: None,
            conversion: Default::default(),
            slot: 0,
            global: false,
        })
    }

    fn statement(&mut self) -> PResult<Stmt> {
        if self.match_kinds(&[TokenKind::LeftBrace])? {
            self.block_statement()
        } else if self.match_kinds(&[TokenKind::Break])? {
            self.break_statement()
        } else if self.match_kinds(&[TokenKind::Continue])? {
            self.continue_statement()
        } else if self.match_kinds(&[TokenKind::For])? {
            self.for_statement()
        } else if self.match_kinds(&[TokenKind::If])? {
            self.if_statement()
        } else if self.match_kinds(&[TokenKind::Return])? {
            self.return_statement()
        } else if self.match_kinds(&[TokenKind::Switch])? {
            self.switch_statement()
        } else if self.match_kinds(&[TokenKind::While])? {
            self.while_statement()
        } else {
            self.expression_statement()
        }
    }

    fn block_statement(&mut self) -> PResult<Stmt> {
        Ok(Stmt::Block {
            statements: self.block_statements()?,
        })
    }

    fn block_statements(&mut self) -> PResult<Vec<Stmt>> {
        let mut statements = Vec::new();
        self.scope_depth += 1;
        while !self.is_at_end() && !self.check(TokenKind::RightBrace) {
            if self
                .match_kinds(&[TokenKind::Var, TokenKind::Const, TokenKind::Ref])
                .unwrap_or(false)
            {
                match self.variable_declaration() {
                    Ok(statement) => statements.push(statement),
                    Err(ParseInterrupt) => {
                        self.synchronize();
                        statements.push(Stmt::Error);
                    }
                }
            } else {
                match self.statement() {
                    Ok(statement) => statements.push(statement),
                    Err(ParseInterrupt) => {
                        self.synchronize();
                        statements.push(Stmt::Error);
                    }
                }
            }
        }
        self.scope_depth -= 1;
        self.consume("Expected '}' after block", &[TokenKind::RightBrace])?;
        Ok(statements)
    }

    fn break_statement(&mut self) -> PResult<Stmt> {
        if !(self.in_loop || self.in_switch) {
            let token = self.current.clone();
            return Err(self.throw("Cannot use 'break' outside a loop or switch.", token));
        }
        let keyword = self.current.clone();
        self.consume_terminator("Expected ';' or newline after break keyword")?;
        Ok(Stmt::Break { keyword })
    }

    fn continue_statement(&mut self) -> PResult<Stmt> {
        if !self.in_loop {
            let token = self.current.clone();
            return Err(self.throw("Cannot use 'continue' outside a loop", token));
        }
        let keyword = self.current.clone();
        self.consume_terminator("Expected ';' or newline after continue keyword")?;
        Ok(Stmt::Continue { keyword })
    }

    fn expression_statement(&mut self) -> PResult<Stmt> {
        let expr = self.expression()?;
        self.consume_terminator("Expected ';' or newline after expression")?;
        Ok(Stmt::Expression { expr })
    }

    /// `for (init; cond; incr) body` desugars to
    /// `{ init; while (cond) { body } <incr> }` with the increment riding
    /// on the While so `continue` still executes it.
    fn for_statement(&mut self) -> PResult<Stmt> {
        let keyword = self.current.clone();
        self.consume("Expected '(' after 'for' keyword", &[TokenKind::LeftParen])?;
        self.scope_depth += 1;

        let result = (|| -> PResult<Stmt> {
            let initializer = if self
                .match_kinds(&[TokenKind::Var, TokenKind::Const, TokenKind::Ref])?
            {
                Some(self.variable_declaration()?)
            } else if self.match_kinds(&[TokenKind::Semicolon])? {
                None
            } else {
                Some(self.expression_statement()?)
            };

            let condition = if !self.check(TokenKind::Semicolon) {
                self.expression()?
            } else {
                // An absent condition is an always-true loop
                Expr::new(
                    ExprKind::Literal(LiteralValue::Bool(true)),
                    keyword.clone(),
                )
            };
            self.consume("Expected ';' after loop condition", &[TokenKind::Semicolon])?;

            let increment = if !self.check(TokenKind::RightParen) {
                Some(Box::new(Stmt::Expression {
                    expr: self.expression()?,
                }))
            } else {
                None
            };
            self.consume(
                "Expected ')' after for loop header",
                &[TokenKind::RightParen],
            )?;

            self.skip_end_of_lines()?;

            let was_in_loop = std::mem::replace(&mut self.in_loop, true);
            let body = (|| -> PResult<Stmt> {
                self.consume(
                    "Expected '{' after for-loop header",
                    &[TokenKind::LeftBrace],
                )?;
                self.block_statement()
            })();
            self.in_loop = was_in_loop;

            let desugared = Stmt::While {
                keyword: keyword.clone(),
                condition,
                body: Box::new(body?),
                increment,
            };

            let mut statements = Vec::new();
            if let Some(initializer) = initializer {
                statements.push(initializer);
            }
            statements.push(desugared);
            Ok(Stmt::Block { statements })
        })();
        self.scope_depth -= 1;
        result
    }

    fn if_statement(&mut self) -> PResult<Stmt> {
        let keyword = self.current.clone();
        let condition = self.expression()?;
        self.skip_end_of_lines()?;

        self.consume(
            "Expected '{' after if statement condition",
            &[TokenKind::LeftBrace],
        )?;
        let then_branch = self.block_statement()?;

        if self.match_kinds(&[TokenKind::Else])? {
            let else_branch = if self.match_kinds(&[TokenKind::If])? {
                self.if_statement()?
            } else {
                self.consume("Expected '{' after else keyword", &[TokenKind::LeftBrace])?;
                self.block_statement()?
            };
            Ok(Stmt::If {
                keyword,
                condition,
                then_branch: Box::new(then_branch),
                else_branch: Some(Box::new(else_branch)),
            })
        } else {
            Ok(Stmt::If {
                keyword,
                condition,
                then_branch: Box::new(then_branch),
                else_branch: None,
            })
        }
    }

    fn return_statement(&mut self) -> PResult<Stmt> {
        if !self.in_function {
            let token = self.current.clone();
            return Err(self.throw("Cannot use 'return' keyword outside a function", token));
        }
        let keyword = self.current.clone();

        let value = if !self.check(TokenKind::Semicolon) && !self.check(TokenKind::EndOfLine) {
            Some(self.expression()?)
        } else {
            None
        };

        self.consume_terminator("Expected ';' or newline after return statement")?;
        Ok(Stmt::Return { keyword, value })
    }

    fn switch_statement(&mut self) -> PResult<Stmt> {
        let condition = self.expression()?;
        self.skip_end_of_lines()?;

        let mut cases = Vec::new();
        let mut default_case: Option<Box<Stmt>> = None;
        self.consume(
            "Expected '{' after switch statement condition",
            &[TokenKind::LeftBrace],
        )?;

        let was_in_switch = std::mem::replace(&mut self.in_switch, true);
        let result = (|| -> PResult<()> {
            while !self.is_at_end() && !self.check(TokenKind::RightBrace) {
                if self.match_kinds(&[TokenKind::Default])? {
                    if default_case.is_some() {
                        let token = self.current.clone();
                        return Err(self.throw(
                            "Cannot have more than one default case in a switch",
                            token,
                        ));
                    }
                    self.consume("Expected '->' after 'default'", &[TokenKind::Arrow])?;
                    default_case = Some(Box::new(self.statement()?));
                } else {
                    let case = self.expression()?;
                    self.consume("Expected '->' after case expression", &[TokenKind::Arrow])?;
                    let body = self.statement()?;
                    cases.push((case, body));
                }
            }
            Ok(())
        })();
        self.in_switch = was_in_switch;
        result?;

        self.consume(
            "Expected '}' at the end of switch statement",
            &[TokenKind::RightBrace],
        )?;
        Ok(Stmt::Switch {
            condition,
            cases,
            default: default_case,
        })
    }

    fn while_statement(&mut self) -> PResult<Stmt> {
        let keyword = self.current.clone();
        let condition = self.expression()?;
        self.skip_end_of_lines()?;

        let was_in_loop = std::mem::replace(&mut self.in_loop, true);
        let result = (|| -> PResult<Stmt> {
            self.consume(
                "Expected '{' after while-loop header",
                &[TokenKind::LeftBrace],
            )?;
            self.block_statement()
        })();
        self.in_loop = was_in_loop;

        Ok(Stmt::While {
            keyword,
            condition,
            body: Box::new(result?),
            increment: None,
        })
    }

    // ------------------------------------------------------------------
    // Types
    // ------------------------------------------------------------------

    fn type_annotation(&mut self) -> PResult<TypeDesc> {
        let is_const = self.match_kinds(&[TokenKind::Const])?;
        let is_ref = self.match_kinds(&[TokenKind::Ref])?;

        use crate::types::PrimitiveKind;
        if self.match_kinds(&[TokenKind::Bool])? {
            Ok(TypeDesc::Primitive {
                kind: PrimitiveKind::Bool,
                is_const,
                is_ref,
            })
        } else if self.match_kinds(&[TokenKind::Int])? {
            Ok(TypeDesc::Primitive {
                kind: PrimitiveKind::Int,
                is_const,
                is_ref,
            })
        } else if self.match_kinds(&[TokenKind::Float])? {
            Ok(TypeDesc::Primitive {
                kind: PrimitiveKind::Float,
                is_const,
                is_ref,
            })
        } else if self.match_kinds(&[TokenKind::String])? {
            Ok(TypeDesc::Primitive {
                kind: PrimitiveKind::String,
                is_const,
                is_ref,
            })
        } else if self.match_kinds(&[TokenKind::Null])? {
            Ok(TypeDesc::Primitive {
                kind: PrimitiveKind::Null,
                is_const,
                is_ref,
            })
        } else if self.match_kinds(&[TokenKind::Identifier])? {
            Ok(TypeDesc::UserDefined {
                name: self.current.lexeme.clone(),
                is_const,
                is_ref,
            })
        } else if self.match_kinds(&[TokenKind::LeftIndex])? {
            let contained = self.type_annotation()?;
            self.consume(
                "Expected ']' after array declaration",
                &[TokenKind::RightIndex],
            )?;
            Ok(TypeDesc::List {
                contained: Box::new(contained),
                is_const,
                is_ref,
            })
        } else if self.match_kinds(&[TokenKind::LeftBrace])? {
            let mut elements = Vec::new();
            while !self.check(TokenKind::RightBrace) {
                elements.push(self.type_annotation()?);
                self.match_kinds(&[TokenKind::Comma])?;
            }
            self.consume("Expected '}' after tuple type", &[TokenKind::RightBrace])?;
            Ok(TypeDesc::Tuple {
                elements,
                is_const,
                is_ref,
            })
        } else if self.match_kinds(&[TokenKind::Typeof])? {
            let expr = self.parse_precedence(Precedence::LogicOr)?;
            Ok(TypeDesc::Typeof {
                expr: Box::new(expr),
                is_const,
                is_ref,
            })
        } else {
            let token = self.peek().clone();
            self.error("Unexpected token in type specifier", &token);
            self.note(
                "The type needs to be one of: bool, int, float, string, an identifier or an array type",
            );
            Err(ParseInterrupt)
        }
    }
}

/// Convenience wrapper used by reporter-level tests: parse a single
/// module with default options and no import root.
#[cfg(test)]
pub(crate) fn parse_source(source: &str) -> (Vec<Stmt>, crate::diagnostics::DiagnosticReporter) {
    let mut ctx = CompilerContext::for_tests();
    let mut module = ParsedModule::new("test", "/test.rill");
    let scanner = Scanner::new(source, "test");
    let statements = {
        let mut parser = Parser::new(&mut ctx, &mut module, scanner, 0);
        parser.program()
    };
    (statements, ctx.reporter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticReporter;

    fn parse_ok(source: &str) -> Vec<Stmt> {
        let (statements, reporter) = parse_source(source);
        assert!(
            !reporter.had_error(),
            "unexpected errors:\n{}",
            reporter.format_all()
        );
        statements
    }

    fn parse_err(source: &str) -> DiagnosticReporter {
        let (_, reporter) = parse_source(source);
        assert!(reporter.had_error(), "expected a parse error");
        reporter
    }

    #[test]
    fn test_variable_declaration() {
        let statements = parse_ok("var x: int = 1;\n");
        assert_eq!(statements.len(), 1);
        match &statements[0] {
            Stmt::Var { name, declared_type, .. } => {
                assert_eq!(name.lexeme, "x");
                assert!(declared_type.as_ref().unwrap().is_int());
            }
            other => panic!("expected var, got {:?}", other),
        }
    }

    #[test]
    fn test_newline_terminates_statement() {
        let statements = parse_ok("var x = 1\nvar y = 2\n");
        assert_eq!(statements.len(), 2);
    }

    #[test]
    fn test_constant_folding_binary() {
        let statements = parse_ok("var x = 2 + 3 * 4;\n");
        match &statements[0] {
            Stmt::Var { initializer, .. } => match &initializer.kind {
                ExprKind::Literal(LiteralValue::Int(14)) => {}
                other => panic!("expected folded literal 14, got {:?}", other),
            },
            other => panic!("expected var, got {:?}", other),
        }
    }

    #[test]
    fn test_folding_string_concat() {
        let statements = parse_ok("var s = \"a\" + \"b\";\n");
        match &statements[0] {
            Stmt::Var { initializer, .. } => match &initializer.kind {
                ExprKind::Literal(LiteralValue::String(s)) => assert_eq!(s, "ab"),
                other => panic!("expected folded string, got {:?}", other),
            },
            other => panic!("expected var, got {:?}", other),
        }
    }

    #[test]
    fn test_fold_division_by_zero_is_error() {
        parse_err("var x = 1 / 0;\n");
    }

    #[test]
    fn test_fold_modulo_nonpositive_is_error() {
        parse_err("var x = 1 % 0;\n");
        parse_err("var x = 1 % -2;\n");
    }

    #[test]
    fn test_invalid_assignment_target() {
        let reporter = parse_err("1 = 2;\n");
        assert!(reporter
            .format_all()
            .contains("Invalid assignment target"));
    }

    #[test]
    fn test_ternary_flagged_by_default() {
        let reporter = parse_err("var x = true ? 1 : 2;\n");
        assert!(reporter.format_all().contains("ternary-operator"));
    }

    #[test]
    fn test_comma_flagged_by_default() {
        let reporter = parse_err("1, 2;\n");
        assert!(reporter.format_all().contains("comma-operator"));
    }

    #[test]
    fn test_for_desugars_to_while() {
        let statements =
            parse_ok("fn main() -> int { for (var j: int = 0; j < 3; j += 1) { } return 0; }\n");
        let Stmt::Function(declaration) = &statements[0] else {
            panic!("expected function");
        };
        let Stmt::Block { statements: inner } = &declaration.body[0] else {
            panic!("expected desugared block, got {:?}", declaration.body[0]);
        };
        assert!(matches!(inner[0], Stmt::Var { .. }));
        match &inner[1] {
            Stmt::While { increment, .. } => assert!(increment.is_some()),
            other => panic!("expected while, got {:?}", other),
        }
    }

    #[test]
    fn test_tuple_field_access_float_split() {
        let statements = parse_ok("var y = x.2.0;\n");
        let Stmt::Var { initializer, .. } = &statements[0] else {
            panic!("expected var");
        };
        // ((x.2).0)
        let ExprKind::Get { object, name } = &initializer.kind else {
            panic!("expected get, got {:?}", initializer.kind);
        };
        assert_eq!(name.lexeme, "0");
        let ExprKind::Get { name: inner, .. } = &object.kind else {
            panic!("expected inner get");
        };
        assert_eq!(inner.lexeme, "2");
    }

    #[test]
    fn test_list_repeat() {
        let statements = parse_ok("var xs = [0; 5];\n");
        let Stmt::Var { initializer, .. } = &statements[0] else {
            panic!("expected var");
        };
        assert!(matches!(initializer.kind, ExprKind::ListRepeat { .. }));
    }

    #[test]
    fn test_return_outside_function_is_error() {
        parse_err("return 1;\n");
    }

    #[test]
    fn test_break_outside_loop_is_error() {
        parse_err("break;\n");
    }

    #[test]
    fn test_duplicate_function_is_error() {
        parse_err("fn f() -> null { }\nfn f() -> null { }\n");
    }

    #[test]
    fn test_error_recovery_reports_multiple() {
        let (_, reporter) = parse_source("var = 1;\nvar y 2;\n");
        let errors = reporter
            .diagnostics()
            .iter()
            .filter(|d| d.severity == crate::diagnostics::Severity::Error)
            .count();
        assert!(errors >= 2, "expected two reported errors");
    }

    #[test]
    fn test_adjacent_string_literals_concatenate() {
        let statements = parse_ok("var s = \"a\" \"b\";\n");
        let Stmt::Var { initializer, .. } = &statements[0] else {
            panic!("expected var");
        };
        match &initializer.kind {
            ExprKind::Literal(LiteralValue::String(s)) => assert_eq!(s, "ab"),
            other => panic!("expected string literal, got {:?}", other),
        }
    }

    #[test]
    fn test_switch_statement() {
        let statements = parse_ok(
            "fn main() -> int { switch 1 { 1 -> { } default -> { } } return 0; }\n",
        );
        let Stmt::Function(declaration) = &statements[0] else {
            panic!("expected function");
        };
        match &declaration.body[0] {
            Stmt::Switch { cases, default, .. } => {
                assert_eq!(cases.len(), 1);
                assert!(default.is_some());
            }
            other => panic!("expected switch, got {:?}", other),
        }
    }
}
