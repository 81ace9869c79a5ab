/*!
# Expression Parsing

Lexer and recursive-descent parser for the built-in expression language used
by filters, computed columns and code snippets.

## Precedence

```text
Level 1 (Lowest):  Logical OR        ||  |     (parse_or)
Level 2:           Logical AND       &&  &     (parse_and)
Level 3:           Logical NOT       !         (parse_not)
Level 4:           Comparisons       == != < <= > >=
Level 5:           Addition          +  -
Level 6:           Multiplication    *  /
Level 7:           Unary sign        -x  +x
Level 8 (Highest): Power             ^         (right associative)
```

`-2^2` is `-(2^2)`, and `2^-1` is allowed.

Nesting (parentheses, unary operators, operator chains) is capped at
[`MAX_DEPTH`] so the parser and evaluator stay within a bounded stack.

## Primary expressions

- Numbers (`1`, `2.5`, `1e-3`, `.5`), strings (`"a"`, `'a'`)
- `TRUE`, `FALSE`, `T`, `F`, `NA`
- Identifiers (`col0_enc`, `is.na`) and back-quoted names
- Calls: `name(arg, ...)`
- Parenthesized expressions
*/

use super::{RuntimeError, RuntimeResult};

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Text(String),
    Logical(bool),
    Missing,
    Identifier(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Text(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Bang,
    AndAnd,
    And,
    OrOr,
    Or,
    LParen,
    RParen,
    Comma,
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    position: usize,
}

/// Deepest expression tree the parser will build.
pub const MAX_DEPTH: usize = 128;

fn parse_error(position: usize, message: impl Into<String>) -> RuntimeError {
    RuntimeError::Parse {
        position,
        message: message.into(),
    }
}

fn tokenize(source: &str) -> RuntimeResult<Vec<Token>> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (position, c) = chars[i];
        let peek = chars.get(i + 1).map(|(_, c)| *c);

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let single = |kind| Token { kind, position };

        let kind = match c {
            '0'..='9' => {
                let (value, next) = lex_number(source, &chars, i)?;
                i = next;
                tokens.push(single(TokenKind::Number(value)));
                continue;
            }
            '.' if peek.is_some_and(|p| p.is_ascii_digit()) => {
                let (value, next) = lex_number(source, &chars, i)?;
                i = next;
                tokens.push(single(TokenKind::Number(value)));
                continue;
            }
            '"' | '\'' => {
                let (text, next) = lex_string(&chars, i)?;
                i = next;
                tokens.push(single(TokenKind::Text(text)));
                continue;
            }
            '`' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|(_, c)| *c == '`')
                    .ok_or_else(|| parse_error(position, "unterminated back-quoted name"))?;
                let name: String = chars[i + 1..i + 1 + end].iter().map(|(_, c)| c).collect();
                i += end + 2;
                tokens.push(single(TokenKind::Ident(name)));
                continue;
            }
            c if c.is_alphabetic() || c == '_' || c == '.' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].1.is_alphanumeric() || chars[i].1 == '_' || chars[i].1 == '.')
                {
                    i += 1;
                }
                let name: String = chars[start..i].iter().map(|(_, c)| c).collect();
                tokens.push(single(TokenKind::Ident(name)));
                continue;
            }
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '^' => TokenKind::Caret,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            ',' => TokenKind::Comma,
            '=' if peek == Some('=') => {
                i += 1;
                TokenKind::EqEq
            }
            '!' if peek == Some('=') => {
                i += 1;
                TokenKind::NotEq
            }
            '!' => TokenKind::Bang,
            '<' if peek == Some('=') => {
                i += 1;
                TokenKind::Le
            }
            '<' => TokenKind::Lt,
            '>' if peek == Some('=') => {
                i += 1;
                TokenKind::Ge
            }
            '>' => TokenKind::Gt,
            '&' if peek == Some('&') => {
                i += 1;
                TokenKind::AndAnd
            }
            '&' => TokenKind::And,
            '|' if peek == Some('|') => {
                i += 1;
                TokenKind::OrOr
            }
            '|' => TokenKind::Or,
            other => return Err(parse_error(position, format!("unexpected '{}'", other))),
        };

        tokens.push(single(kind));
        i += 1;
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        position: source.len(),
    });
    Ok(tokens)
}

fn lex_number(source: &str, chars: &[(usize, char)], start: usize) -> RuntimeResult<(f64, usize)> {
    let mut i = start;
    let digits = |i: &mut usize| {
        while *i < chars.len() && chars[*i].1.is_ascii_digit() {
            *i += 1;
        }
    };

    digits(&mut i);
    if i < chars.len() && chars[i].1 == '.' {
        i += 1;
        digits(&mut i);
    }
    if i < chars.len() && matches!(chars[i].1, 'e' | 'E') {
        let mut j = i + 1;
        if j < chars.len() && matches!(chars[j].1, '+' | '-') {
            j += 1;
        }
        if j < chars.len() && chars[j].1.is_ascii_digit() {
            i = j;
            digits(&mut i);
        }
    }

    let begin = chars[start].0;
    let end = chars.get(i).map_or(source.len(), |(p, _)| *p);
    let text = &source[begin..end];
    text.parse()
        .map(|value| (value, i))
        .map_err(|_| parse_error(begin, format!("invalid number '{}'", text)))
}

fn lex_string(chars: &[(usize, char)], start: usize) -> RuntimeResult<(String, usize)> {
    let (position, quote) = chars[start];
    let mut text = String::new();
    let mut i = start + 1;

    while i < chars.len() {
        let c = chars[i].1;
        if c == quote {
            return Ok((text, i + 1));
        }
        if c == '\\' {
            i += 1;
            match chars.get(i).map(|(_, c)| *c) {
                Some('n') => text.push('\n'),
                Some('t') => text.push('\t'),
                Some(other) => text.push(other),
                None => break,
            }
        } else {
            text.push(c);
        }
        i += 1;
    }

    Err(parse_error(position, "unterminated string"))
}

/// Parse a complete expression.
pub fn parse(source: &str) -> RuntimeResult<Expr> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };

    if parser.current().kind == TokenKind::Eof {
        return Err(parse_error(0, "empty expression"));
    }

    let expr = parser.parse_or()?;
    let trailing = parser.current();
    if trailing.kind != TokenKind::Eof {
        return Err(parse_error(
            trailing.position,
            format!("unexpected {}", describe(&trailing.kind)),
        ));
    }
    Ok(expr)
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Number(n) => format!("number {}", n),
        TokenKind::Text(s) => format!("string \"{}\"", s),
        TokenKind::Ident(name) => format!("symbol '{}'", name),
        TokenKind::Eof => "end of input".to_string(),
        TokenKind::LParen => "'('".to_string(),
        TokenKind::RParen => "')'".to_string(),
        TokenKind::Comma => "','".to_string(),
        _ => "operator".to_string(),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn current(&self) -> &Token {
        // tokenize always ends with Eof and advance never moves past it
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
    }

    fn expect(&mut self, kind: TokenKind) -> RuntimeResult<()> {
        let token = self.current();
        if token.kind == kind {
            self.advance();
            Ok(())
        } else {
            Err(parse_error(
                token.position,
                format!("expected {} but found {}", describe(&kind), describe(&token.kind)),
            ))
        }
    }

    /// Descend one level; fails past [`MAX_DEPTH`].
    fn enter(&mut self) -> RuntimeResult<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(parse_error(
                self.current().position,
                "expression nested too deeply",
            ));
        }
        Ok(())
    }

    fn leave(&mut self, levels: usize) {
        self.depth -= levels;
    }

    fn binary(left: Expr, op: BinaryOp, right: Expr) -> Expr {
        Expr::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    /// Grammar: `and ((|| | |) and)*`
    fn parse_or(&mut self) -> RuntimeResult<Expr> {
        let mut left = self.parse_and()?;
        let mut chained = 0;
        while matches!(self.current().kind, TokenKind::OrOr | TokenKind::Or) {
            self.advance();
            self.enter()?;
            chained += 1;
            let right = self.parse_and()?;
            left = Self::binary(left, BinaryOp::Or, right);
        }
        self.leave(chained);
        Ok(left)
    }

    /// Grammar: `not ((&& | &) not)*`
    fn parse_and(&mut self) -> RuntimeResult<Expr> {
        let mut left = self.parse_not()?;
        let mut chained = 0;
        while matches!(self.current().kind, TokenKind::AndAnd | TokenKind::And) {
            self.advance();
            self.enter()?;
            chained += 1;
            let right = self.parse_not()?;
            left = Self::binary(left, BinaryOp::And, right);
        }
        self.leave(chained);
        Ok(left)
    }

    fn parse_not(&mut self) -> RuntimeResult<Expr> {
        if self.current().kind == TokenKind::Bang {
            self.advance();
            self.enter()?;
            let operand = self.parse_not()?;
            self.leave(1);
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> RuntimeResult<Expr> {
        let mut left = self.parse_additive()?;
        let mut chained = 0;
        loop {
            let op = match self.current().kind {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::NotEq => BinaryOp::Ne,
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Le => BinaryOp::Le,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::Ge => BinaryOp::Ge,
                _ => break,
            };
            self.advance();
            self.enter()?;
            chained += 1;
            let right = self.parse_additive()?;
            left = Self::binary(left, op, right);
        }
        self.leave(chained);
        Ok(left)
    }

    fn parse_additive(&mut self) -> RuntimeResult<Expr> {
        let mut left = self.parse_multiplicative()?;
        let mut chained = 0;
        loop {
            let op = match self.current().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            self.enter()?;
            chained += 1;
            let right = self.parse_multiplicative()?;
            left = Self::binary(left, op, right);
        }
        self.leave(chained);
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> RuntimeResult<Expr> {
        let mut left = self.parse_unary()?;
        let mut chained = 0;
        loop {
            let op = match self.current().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                _ => break,
            };
            self.advance();
            self.enter()?;
            chained += 1;
            let right = self.parse_unary()?;
            left = Self::binary(left, op, right);
        }
        self.leave(chained);
        Ok(left)
    }

    fn parse_unary(&mut self) -> RuntimeResult<Expr> {
        self.enter()?;
        let expr = self.parse_signed()?;
        self.leave(1);
        Ok(expr)
    }

    fn parse_signed(&mut self) -> RuntimeResult<Expr> {
        match self.current().kind {
            TokenKind::Minus => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                })
            }
            TokenKind::Plus => {
                self.advance();
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    /// Grammar: `primary (^ unary)?`
    fn parse_power(&mut self) -> RuntimeResult<Expr> {
        let base = self.parse_primary()?;
        if self.current().kind == TokenKind::Caret {
            self.advance();
            let exponent = self.parse_unary()?;
            return Ok(Self::binary(base, BinaryOp::Pow, exponent));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> RuntimeResult<Expr> {
        let token = self.current().clone();
        match token.kind {
            TokenKind::Number(value) => {
                self.advance();
                Ok(Expr::Number(value))
            }
            TokenKind::Text(text) => {
                self.advance();
                Ok(Expr::Text(text))
            }
            TokenKind::Ident(name) => {
                self.advance();
                if self.current().kind == TokenKind::LParen {
                    self.advance();
                    let args = self.parse_arguments()?;
                    return Ok(Expr::Call { name, args });
                }
                Ok(match name.as_str() {
                    "TRUE" | "T" => Expr::Logical(true),
                    "FALSE" | "F" => Expr::Logical(false),
                    "NA" => Expr::Missing,
                    _ => Expr::Identifier(name),
                })
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_or()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            other => Err(parse_error(
                token.position,
                format!("unexpected {}", describe(&other)),
            )),
        }
    }

    fn parse_arguments(&mut self) -> RuntimeResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.current().kind == TokenKind::RParen {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            match self.current().kind {
                TokenKind::Comma => self.advance(),
                TokenKind::RParen => {
                    self.advance();
                    return Ok(args);
                }
                _ => {
                    let token = self.current();
                    return Err(parse_error(
                        token.position,
                        format!("expected ',' or ')' but found {}", describe(&token.kind)),
                    ));
                }
            }
        }
    }
}
