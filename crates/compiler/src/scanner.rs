//! Scanner for Rill source
//!
//! Produces tokens one at a time; the parser keeps a two-token lookahead.
//! Newlines double as statement terminators: a `\n` becomes an
//! `EndOfLine` token only when no parenthesis is open and the previously
//! emitted token could end a statement (literals, identifiers, `)`, `]`,
//! `break`, `continue`). Everywhere else the newline is whitespace.
//!
//! Keywords are recognized through a trie keyed on the identifier's
//! characters; misses fall back to `Identifier`.

use crate::diagnostics::DiagnosticReporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenKind {
    // Punctuation
    Dot,
    DotDot,
    DotDotEqual,
    Comma,
    Question,
    Colon,
    DoubleColon,
    BitOr,
    BitAnd,
    BitXor,
    BitNot,
    Not,
    NotEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    RightShift,
    Less,
    LessEqual,
    LeftShift,
    Star,
    StarEqual,
    Slash,
    SlashEqual,
    Minus,
    MinusEqual,
    MinusMinus,
    Arrow,
    Plus,
    PlusEqual,
    PlusPlus,
    Modulo,
    LeftParen,
    RightParen,
    LeftIndex,
    RightIndex,
    LeftBrace,
    RightBrace,
    Semicolon,
    // Literal classes
    IntValue,
    FloatValue,
    StringValue,
    Identifier,
    // Keywords
    And,
    Bool,
    Break,
    Class,
    Const,
    Continue,
    Default,
    Else,
    False,
    Float,
    Fn,
    For,
    If,
    Import,
    Int,
    Move,
    Null,
    Or,
    Protected,
    Private,
    Public,
    Ref,
    Return,
    String,
    Super,
    Switch,
    This,
    True,
    Type,
    Typeof,
    Var,
    While,
    // Synthetic
    EndOfLine,
    EndOfFile,
    #[default]
    None,
}

/// Number of token kinds, for the parser's rule table.
pub const TOKEN_KIND_COUNT: usize = TokenKind::None as usize + 1;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: std::string::String,
    /// 1-indexed source line
    pub line: u32,
    pub start_column: usize,
    pub end_column: usize,
}

impl Token {
    pub fn new(
        kind: TokenKind,
        lexeme: impl Into<std::string::String>,
        line: u32,
        start_column: usize,
        end_column: usize,
    ) -> Self {
        Token {
            kind,
            lexeme: lexeme.into(),
            line,
            start_column,
            end_column,
        }
    }
}

const KEYWORDS: [(&str, TokenKind); 33] = [
    ("and", TokenKind::And),
    ("bool", TokenKind::Bool),
    ("break", TokenKind::Break),
    ("class", TokenKind::Class),
    ("const", TokenKind::Const),
    ("continue", TokenKind::Continue),
    ("default", TokenKind::Default),
    ("else", TokenKind::Else),
    ("false", TokenKind::False),
    ("float", TokenKind::Float),
    ("fn", TokenKind::Fn),
    ("for", TokenKind::For),
    ("if", TokenKind::If),
    ("import", TokenKind::Import),
    ("int", TokenKind::Int),
    ("move", TokenKind::Move),
    ("not", TokenKind::Not),
    ("null", TokenKind::Null),
    ("or", TokenKind::Or),
    ("protected", TokenKind::Protected),
    ("private", TokenKind::Private),
    ("public", TokenKind::Public),
    ("ref", TokenKind::Ref),
    ("return", TokenKind::Return),
    ("string", TokenKind::String),
    ("super", TokenKind::Super),
    ("switch", TokenKind::Switch),
    ("this", TokenKind::This),
    ("true", TokenKind::True),
    ("type", TokenKind::Type),
    ("typeof", TokenKind::Typeof),
    ("var", TokenKind::Var),
    ("while", TokenKind::While),
];

/// Trie over the keyword set. Nodes are arena-allocated; edges cover the
/// lowercase letters keywords are made of.
struct KeywordTrie {
    nodes: Vec<TrieNode>,
}

struct TrieNode {
    terminal: Option<TokenKind>,
    children: [Option<usize>; 26],
}

impl TrieNode {
    fn new() -> Self {
        TrieNode {
            terminal: Option::None,
            children: [Option::None; 26],
        }
    }
}

impl KeywordTrie {
    fn build() -> Self {
        let mut trie = KeywordTrie {
            nodes: vec![TrieNode::new()],
        };
        for (word, kind) in KEYWORDS {
            trie.insert(word, kind);
        }
        trie
    }

    fn insert(&mut self, word: &str, kind: TokenKind) {
        let mut node = 0;
        for ch in word.bytes() {
            let edge = (ch - b'a') as usize;
            node = match self.nodes[node].children[edge] {
                Some(next) => next,
                Option::None => {
                    self.nodes.push(TrieNode::new());
                    let next = self.nodes.len() - 1;
                    self.nodes[node].children[edge] = Some(next);
                    next
                }
            };
        }
        self.nodes[node].terminal = Some(kind);
    }

    fn search(&self, word: &str) -> Option<TokenKind> {
        let mut node = 0;
        for ch in word.bytes() {
            if !ch.is_ascii_lowercase() {
                return Option::None;
            }
            node = self.nodes[node].children[(ch - b'a') as usize]?;
        }
        self.nodes[node].terminal
    }
}

pub struct Scanner {
    source: Vec<char>,
    module_name: std::string::String,
    keywords: KeywordTrie,
    start: usize,
    current: usize,
    line: u32,
    paren_depth: i32,
    /// Kind of the last token handed out, for the EndOfLine rule
    last_emitted: TokenKind,
    emitted_any: bool,
    synthetic_eol_done: bool,
}

impl Scanner {
    pub fn new(source: &str, module_name: impl Into<std::string::String>) -> Self {
        Scanner {
            source: source.chars().collect(),
            module_name: module_name.into(),
            keywords: KeywordTrie::build(),
            start: 0,
            current: 0,
            line: 1,
            paren_depth: 0,
            last_emitted: TokenKind::None,
            emitted_any: false,
            synthetic_eol_done: false,
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> char {
        if self.is_at_end() {
            return '\0';
        }
        self.current += 1;
        self.source[self.current - 1]
    }

    fn peek(&self) -> char {
        if self.is_at_end() {
            '\0'
        } else {
            self.source[self.current]
        }
    }

    fn peek_next(&self) -> char {
        if self.current + 1 >= self.source.len() {
            '\0'
        } else {
            self.source[self.current + 1]
        }
    }

    fn matches(&mut self, expected: char) -> bool {
        if self.peek() == expected {
            self.current += 1;
            true
        } else {
            false
        }
    }

    fn lexeme(&self) -> std::string::String {
        self.source[self.start..self.current].iter().collect()
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        Token::new(kind, self.lexeme(), self.line, self.start, self.current)
    }

    /// Produce the next token, reporting scanner diagnostics as they
    /// occur. After the source is exhausted this returns one synthetic
    /// `EndOfLine` (unless the last real token already terminates a
    /// statement) followed by `EndOfFile` forever.
    pub fn scan_token(&mut self, reporter: &mut DiagnosticReporter) -> Token {
        let token = self.next_token(reporter);
        self.last_emitted = token.kind;
        if !matches!(token.kind, TokenKind::EndOfFile) {
            self.emitted_any = true;
        }
        token
    }

    fn next_token(&mut self, reporter: &mut DiagnosticReporter) -> Token {
        loop {
            if self.is_at_end() {
                if !self.synthetic_eol_done {
                    self.synthetic_eol_done = true;
                    if self.emitted_any
                        && self.last_emitted != TokenKind::EndOfLine
                        && self.last_emitted != TokenKind::Semicolon
                    {
                        return Token::new(TokenKind::EndOfLine, "\\n", self.line, 0, 0);
                    }
                }
                return Token::new(TokenKind::EndOfFile, "", self.line, 0, 0);
            }

            self.start = self.current;
            let ch = self.advance();
            match ch {
                '.' => {
                    return if self.matches('.') {
                        if self.matches('=') {
                            self.make_token(TokenKind::DotDotEqual)
                        } else {
                            self.make_token(TokenKind::DotDot)
                        }
                    } else {
                        self.make_token(TokenKind::Dot)
                    };
                }
                ',' => return self.make_token(TokenKind::Comma),
                '?' => return self.make_token(TokenKind::Question),
                ':' => {
                    return if self.matches(':') {
                        self.make_token(TokenKind::DoubleColon)
                    } else {
                        self.make_token(TokenKind::Colon)
                    };
                }
                '|' => {
                    return if self.matches('|') {
                        self.make_token(TokenKind::Or)
                    } else {
                        self.make_token(TokenKind::BitOr)
                    };
                }
                '&' => {
                    return if self.matches('&') {
                        self.make_token(TokenKind::And)
                    } else {
                        self.make_token(TokenKind::BitAnd)
                    };
                }
                '^' => return self.make_token(TokenKind::BitXor),
                '~' => return self.make_token(TokenKind::BitNot),
                '!' => {
                    return if self.matches('=') {
                        self.make_token(TokenKind::NotEqual)
                    } else {
                        self.make_token(TokenKind::Not)
                    };
                }
                '=' => {
                    return if self.matches('=') {
                        self.make_token(TokenKind::EqualEqual)
                    } else {
                        self.make_token(TokenKind::Equal)
                    };
                }
                '>' => {
                    return if self.matches('>') {
                        self.make_token(TokenKind::RightShift)
                    } else if self.matches('=') {
                        self.make_token(TokenKind::GreaterEqual)
                    } else {
                        self.make_token(TokenKind::Greater)
                    };
                }
                '<' => {
                    return if self.matches('<') {
                        self.make_token(TokenKind::LeftShift)
                    } else if self.matches('=') {
                        self.make_token(TokenKind::LessEqual)
                    } else {
                        self.make_token(TokenKind::Less)
                    };
                }
                '*' => {
                    return if self.matches('=') {
                        self.make_token(TokenKind::StarEqual)
                    } else {
                        self.make_token(TokenKind::Star)
                    };
                }
                '-' => {
                    return if self.matches('-') {
                        self.make_token(TokenKind::MinusMinus)
                    } else if self.matches('>') {
                        self.make_token(TokenKind::Arrow)
                    } else if self.matches('=') {
                        self.make_token(TokenKind::MinusEqual)
                    } else {
                        self.make_token(TokenKind::Minus)
                    };
                }
                '+' => {
                    return if self.matches('+') {
                        self.make_token(TokenKind::PlusPlus)
                    } else if self.matches('=') {
                        self.make_token(TokenKind::PlusEqual)
                    } else {
                        self.make_token(TokenKind::Plus)
                    };
                }
                '%' => return self.make_token(TokenKind::Modulo),
                '(' => {
                    self.paren_depth += 1;
                    return self.make_token(TokenKind::LeftParen);
                }
                ')' => {
                    self.paren_depth -= 1;
                    return self.make_token(TokenKind::RightParen);
                }
                '[' => return self.make_token(TokenKind::LeftIndex),
                ']' => return self.make_token(TokenKind::RightIndex),
                '{' => return self.make_token(TokenKind::LeftBrace),
                '}' => return self.make_token(TokenKind::RightBrace),
                ';' => return self.make_token(TokenKind::Semicolon),
                '"' | '\'' => return self.scan_string(ch, reporter),
                ' ' | '\t' | '\r' | '\u{8}' => continue,
                '\n' => {
                    let terminates = self.paren_depth == 0
                        && self.emitted_any
                        && is_valid_before_eol(self.last_emitted);
                    if terminates {
                        let token =
                            Token::new(TokenKind::EndOfLine, "\\n", self.line, self.start, self.current);
                        self.line += 1;
                        return token;
                    }
                    self.line += 1;
                    continue;
                }
                '/' => {
                    if self.matches('/') {
                        while !self.is_at_end() && self.peek() != '\n' {
                            self.advance();
                        }
                        continue;
                    } else if self.matches('*') {
                        self.skip_block_comment(reporter);
                        continue;
                    }
                    return if self.matches('=') {
                        self.make_token(TokenKind::SlashEqual)
                    } else {
                        self.make_token(TokenKind::Slash)
                    };
                }
                _ => {
                    if ch.is_ascii_digit() {
                        return self.scan_number();
                    } else if ch.is_alphabetic() || ch == '_' {
                        return self.scan_identifier();
                    }
                    let token = self.make_token(TokenKind::None);
                    reporter.error(
                        &self.module_name,
                        format!("Unrecognized character '{}' in input", ch),
                        &token,
                    );
                    continue;
                }
            }
        }
    }

    fn scan_number(&mut self) -> Token {
        let mut kind = TokenKind::IntValue;
        while self.peek().is_ascii_digit() {
            self.advance();
        }
        if self.peek() == '.' && self.peek_next().is_ascii_digit() {
            kind = TokenKind::FloatValue;
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        if self.peek() == 'e' && self.peek_next().is_ascii_digit() {
            kind = TokenKind::FloatValue;
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        self.make_token(kind)
    }

    fn scan_identifier(&mut self) -> Token {
        while self.peek().is_alphanumeric() || self.peek() == '_' {
            self.advance();
        }
        let lexeme = self.lexeme();
        match self.keywords.search(&lexeme) {
            Some(kind) => self.make_token(kind),
            Option::None => self.make_token(TokenKind::Identifier),
        }
    }

    fn scan_string(&mut self, delimiter: char, reporter: &mut DiagnosticReporter) -> Token {
        let mut lexeme = std::string::String::new();
        while !self.is_at_end() && self.peek() != delimiter {
            if self.peek() == '\n' {
                self.line += 1;
                lexeme.push(self.advance());
            } else if self.matches('\\') {
                if self.matches('b') {
                    lexeme.push('\u{8}');
                } else if self.matches('n') {
                    lexeme.push('\n');
                } else if self.matches('r') {
                    lexeme.push('\r');
                } else if self.matches('t') {
                    lexeme.push('\t');
                } else if self.matches('\\') {
                    lexeme.push('\\');
                } else if self.matches('\'') {
                    lexeme.push('\'');
                } else if self.matches('"') {
                    lexeme.push('"');
                } else {
                    let invalid = self.advance();
                    reporter.warning(
                        &self.module_name,
                        format!("Unrecognized escape sequence: '\\{}'", invalid),
                        &self.make_token(TokenKind::StringValue),
                    );
                }
            } else {
                lexeme.push(self.advance());
            }
        }

        if self.is_at_end() {
            let token = self.make_token(TokenKind::StringValue);
            reporter.error(
                &self.module_name,
                format!(
                    "Unexpected end of file while reading string, did you forget the closing {}?",
                    delimiter
                ),
                &token,
            );
            return token;
        }

        self.advance(); // closing delimiter
        Token::new(
            TokenKind::StringValue,
            lexeme,
            self.line,
            self.start,
            self.current,
        )
    }

    fn skip_block_comment(&mut self, reporter: &mut DiagnosticReporter) {
        while !self.is_at_end() && !(self.peek() == '*' && self.peek_next() == '/') {
            if self.matches('/') {
                if self.matches('*') {
                    self.skip_block_comment(reporter); // comments nest
                } else if self.matches('/') {
                    while !self.is_at_end() && self.peek() != '\n' {
                        self.advance();
                    }
                }
            } else {
                if self.peek() == '\n' {
                    self.line += 1;
                }
                self.advance();
            }
        }

        if self.is_at_end() {
            reporter.error(
                &self.module_name,
                "Unexpected end of file while reading comment, did you forget the closing '*/'?",
                &self.make_token(TokenKind::None),
            );
            return;
        }

        self.advance(); // *
        self.advance(); // /
    }
}

fn is_valid_before_eol(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Break
            | TokenKind::Continue
            | TokenKind::IntValue
            | TokenKind::FloatValue
            | TokenKind::StringValue
            | TokenKind::Identifier
            | TokenKind::RightParen
            | TokenKind::RightIndex
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(source: &str) -> Vec<Token> {
        let mut reporter = DiagnosticReporter::new();
        let mut scanner = Scanner::new(source, "test");
        let mut tokens = Vec::new();
        loop {
            let token = scanner.scan_token(&mut reporter);
            let done = token.kind == TokenKind::EndOfFile;
            tokens.push(token);
            if done {
                break;
            }
        }
        tokens
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        scan_all(source).iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("1 2.5 3e7"),
            vec![
                TokenKind::IntValue,
                TokenKind::FloatValue,
                TokenKind::FloatValue,
                TokenKind::EndOfLine,
                TokenKind::EndOfFile
            ]
        );
    }

    #[test]
    fn test_keywords_and_identifiers() {
        assert_eq!(
            kinds("var x fnx fn"),
            vec![
                TokenKind::Var,
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::Fn,
                TokenKind::EndOfLine,
                TokenKind::EndOfFile
            ]
        );
    }

    #[test]
    fn test_eol_only_after_statement_enders() {
        // `var` cannot end a statement, so its newline is whitespace
        assert_eq!(
            kinds("var\nx\n"),
            vec![
                TokenKind::Var,
                TokenKind::Identifier,
                TokenKind::EndOfLine,
                TokenKind::EndOfFile
            ]
        );
    }

    #[test]
    fn test_no_eol_inside_parens() {
        assert_eq!(
            kinds("(1 +\n2)\n"),
            vec![
                TokenKind::LeftParen,
                TokenKind::IntValue,
                TokenKind::Plus,
                TokenKind::IntValue,
                TokenKind::RightParen,
                TokenKind::EndOfLine,
                TokenKind::EndOfFile
            ]
        );
    }

    #[test]
    fn test_synthetic_eol_before_eof() {
        let tokens = scan_all("x");
        assert_eq!(tokens[tokens.len() - 2].kind, TokenKind::EndOfLine);
        assert_eq!(tokens[tokens.len() - 1].kind, TokenKind::EndOfFile);
    }

    #[test]
    fn test_no_synthetic_eol_after_semicolon() {
        assert_eq!(
            kinds("x;"),
            vec![
                TokenKind::Identifier,
                TokenKind::Semicolon,
                TokenKind::EndOfFile
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        let tokens = scan_all(r#""a\nb\tc\\d""#);
        assert_eq!(tokens[0].lexeme, "a\nb\tc\\d");
    }

    #[test]
    fn test_single_quoted_string() {
        let tokens = scan_all("'hi'");
        assert_eq!(tokens[0].kind, TokenKind::StringValue);
        assert_eq!(tokens[0].lexeme, "hi");
    }

    #[test]
    fn test_unknown_escape_warns() {
        let mut reporter = DiagnosticReporter::new();
        let mut scanner = Scanner::new(r#""a\qb""#, "test");
        let token = scanner.scan_token(&mut reporter);
        assert_eq!(token.lexeme, "ab");
        assert!(!reporter.had_error());
        assert_eq!(reporter.diagnostics().len(), 1);
    }

    #[test]
    fn test_unterminated_string_is_fatal() {
        let mut reporter = DiagnosticReporter::new();
        let mut scanner = Scanner::new("\"abc", "test");
        scanner.scan_token(&mut reporter);
        assert!(reporter.had_error());
    }

    #[test]
    fn test_nested_block_comments() {
        assert_eq!(
            kinds("1 /* outer /* inner */ still */ 2"),
            vec![
                TokenKind::IntValue,
                TokenKind::IntValue,
                TokenKind::EndOfLine,
                TokenKind::EndOfFile
            ]
        );
    }

    #[test]
    fn test_unterminated_block_comment_is_fatal() {
        let mut reporter = DiagnosticReporter::new();
        let mut scanner = Scanner::new("/* oops", "test");
        scanner.scan_token(&mut reporter);
        assert!(reporter.had_error());
    }

    #[test]
    fn test_compound_operators() {
        assert_eq!(
            kinds("a += b <<= "),
            vec![
                TokenKind::Identifier,
                TokenKind::PlusEqual,
                TokenKind::Identifier,
                TokenKind::LeftShift,
                TokenKind::Equal,
                TokenKind::EndOfFile
            ]
        );
        assert_eq!(
            kinds("..= .. . :: -> ++ --"),
            vec![
                TokenKind::DotDotEqual,
                TokenKind::DotDot,
                TokenKind::Dot,
                TokenKind::DoubleColon,
                TokenKind::Arrow,
                TokenKind::PlusPlus,
                TokenKind::MinusMinus,
                TokenKind::EndOfFile
            ]
        );
    }
}
