//! Reader for a small model-description language.
//!
//! ```text
//! var k c $C_t$;
//! varexo e;
//! parameters alpha;
//! model;
//!   # r = alpha*k(-1);
//!   k = r + c + e;
//!   c = 0.5*k;
//! end;
//! ```
//!
//! The reader drives a [`CompilationSession`] call by call, setting the
//! session's location before each call so that failures point back into the
//! source text.

use crate::data_tree::{BinaryOp, NodeId, UnaryOp};
use crate::diagnostics::Location;
use crate::error::{CompileError, Result};
use crate::session::CompilationSession;
use crate::symbol_table::SymbolKind;

/// Reads declarations and the model block from `source`.
///
/// Stops at the first failure, which is also reported to the session's sink.
pub fn read_model(session: &mut CompilationSession, source: &str) -> Result<()> {
    let result = tokenize(source).and_then(|tokens| Parser::new(&mut *session, tokens).program());
    if let Err(err) = &result {
        session.report(err);
    }
    result
}

/// Reads a single `lhs = rhs` (or bare `expr`, meaning `expr = 0`) equation
/// into the open model block. A trailing `;` is optional.
pub fn read_equation(session: &mut CompilationSession, source: &str) -> Result<NodeId> {
    let result = tokenize(source).and_then(|tokens| {
        let mut parser = Parser::new(&mut *session, tokens);
        let residual = parser.equation_body()?;
        parser.eat(&Token::Semicolon);
        parser.expect_end()?;
        Ok(residual)
    });
    if let Err(err) = &result {
        session.report(err);
    }
    result
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(String),
    Identifier(String),
    Tex(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    Comma,
    Semicolon,
    Hash,
    Assign,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    EqualEqual,
    NotEqual,
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    location: Location,
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
}

impl Lexer {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn take_while(&mut self, text: &mut String, pred: impl Fn(char) -> bool) {
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            text.push(c);
            self.bump();
        }
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.bump() {
            if c == '\n' {
                break;
            }
        }
    }

    /// Exponent part of a number: `e`, optional sign, at least one digit.
    fn has_exponent(&self) -> bool {
        match (self.peek(), self.peek_at(1), self.peek_at(2)) {
            (Some('e' | 'E'), Some(d), _) if d.is_ascii_digit() => true,
            (Some('e' | 'E'), Some('+' | '-'), Some(d)) => d.is_ascii_digit(),
            _ => false,
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Spanned>> {
    let mut lexer = Lexer {
        chars: input.chars().collect(),
        pos: 0,
        line: 1,
        col: 1,
    };
    let mut tokens = Vec::new();

    while let Some(c) = lexer.peek() {
        let (line, start) = (lexer.line, lexer.col);
        if c.is_whitespace() {
            lexer.bump();
            continue;
        }
        if c == '%' || (c == '/' && lexer.peek_at(1) == Some('/')) {
            lexer.skip_line();
            continue;
        }

        let token = if c.is_ascii_digit() || c == '.' {
            let mut text = String::new();
            lexer.take_while(&mut text, |d| d.is_ascii_digit() || d == '.');
            if lexer.has_exponent() {
                for _ in 0..2 {
                    if let Some(e) = lexer.bump() {
                        text.push(e);
                    }
                }
                lexer.take_while(&mut text, |d| d.is_ascii_digit());
            }
            Token::Number(text)
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            lexer.take_while(&mut ident, |d| d.is_alphanumeric() || d == '_');
            Token::Identifier(ident)
        } else if c == '$' {
            lexer.bump();
            let mut tex = String::new();
            lexer.take_while(&mut tex, |d| d != '$');
            if lexer.bump() != Some('$') {
                return Err(CompileError::Syntax {
                    message: "unterminated '$' display name".to_string(),
                    location: Location::new(line, start, lexer.col),
                });
            }
            Token::Tex(tex)
        } else {
            lexer.bump();
            let next = lexer.peek();
            let mut two = |token: Token| {
                lexer.bump();
                token
            };
            match (c, next) {
                ('<', Some('=')) => two(Token::LessEqual),
                ('>', Some('=')) => two(Token::GreaterEqual),
                ('=', Some('=')) => two(Token::EqualEqual),
                ('!' | '~', Some('=')) => two(Token::NotEqual),
                ('<', _) => Token::Less,
                ('>', _) => Token::Greater,
                ('=', _) => Token::Assign,
                ('+', _) => Token::Plus,
                ('-', _) => Token::Minus,
                ('*', _) => Token::Star,
                ('/', _) => Token::Slash,
                ('^', _) => Token::Caret,
                ('(', _) => Token::LParen,
                (')', _) => Token::RParen,
                (',', _) => Token::Comma,
                (';', _) => Token::Semicolon,
                ('#', _) => Token::Hash,
                _ => {
                    return Err(CompileError::Syntax {
                        message: format!("unexpected character '{c}'"),
                        location: Location::new(line, start, start + 1),
                    })
                }
            }
        };
        tokens.push(Spanned {
            token,
            location: Location::new(line, start, lexer.col),
        });
    }
    Ok(tokens)
}

struct Parser<'s> {
    session: &'s mut CompilationSession,
    tokens: Vec<Spanned>,
    pos: usize,
}

impl<'s> Parser<'s> {
    fn new(session: &'s mut CompilationSession, tokens: Vec<Spanned>) -> Self {
        Self {
            session,
            tokens,
            pos: 0,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn consume(&mut self) -> Option<Spanned> {
        let spanned = self.tokens.get(self.pos).cloned()?;
        self.pos += 1;
        self.session.set_location(spanned.location);
        Some(spanned)
    }

    /// Location of the next token, or just past the last one.
    fn location(&self) -> Location {
        match self.tokens.get(self.pos).or_else(|| self.tokens.last()) {
            Some(s) if self.pos < self.tokens.len() => s.location,
            Some(s) => Location::new(s.location.line, s.location.end_column, s.location.end_column + 1),
            None => Location::new(1, 1, 2),
        }
    }

    fn syntax<T>(&self, message: impl Into<String>) -> Result<T> {
        Err(CompileError::Syntax {
            message: message.into(),
            location: self.location(),
        })
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.consume();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<()> {
        if self.eat(&token) {
            Ok(())
        } else {
            self.syntax(format!("expected {what}"))
        }
    }

    fn expect_end(&self) -> Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(_) => self.syntax("unexpected text after the equation"),
        }
    }

    fn identifier(&mut self, what: &str) -> Result<String> {
        match self.peek() {
            Some(Token::Identifier(_)) => match self.consume().map(|s| s.token) {
                Some(Token::Identifier(name)) => Ok(name),
                _ => self.syntax(format!("expected {what}")),
            },
            _ => self.syntax(format!("expected {what}")),
        }
    }

    // --- Statements ---

    fn program(&mut self) -> Result<()> {
        while let Some(token) = self.peek() {
            let keyword = match token {
                Token::Identifier(word) => word.clone(),
                _ => return self.syntax("expected a statement"),
            };
            match keyword.as_str() {
                "var" => self.declarations(Some(SymbolKind::Endogenous))?,
                "varexo" => self.declarations(Some(SymbolKind::Exogenous))?,
                "varexo_det" => self.declarations(Some(SymbolKind::ExogenousDeterministic))?,
                "parameters" => self.declarations(Some(SymbolKind::Parameter))?,
                "predetermined_variables" => self.declarations(None)?,
                "model" => self.model_block()?,
                other => return self.syntax(format!("unknown statement '{other}'")),
            }
        }
        Ok(())
    }

    /// `keyword name [$tex$] [,] ... ;`. `None` marks names as predetermined.
    fn declarations(&mut self, kind: Option<SymbolKind>) -> Result<()> {
        self.consume();
        loop {
            if self.eat(&Token::Semicolon) {
                return Ok(());
            }
            let name = self.identifier("a name")?;
            let tex = match self.peek() {
                Some(Token::Tex(tex)) => {
                    let tex = tex.clone();
                    self.consume();
                    tex
                }
                _ => String::new(),
            };
            let session = &mut *self.session;
            match kind {
                Some(SymbolKind::Endogenous) => session.declare_endogenous(&name, &tex).map(drop)?,
                Some(SymbolKind::Exogenous) => session.declare_exogenous(&name, &tex).map(drop)?,
                Some(SymbolKind::ExogenousDeterministic) => {
                    session.declare_exogenous_det(&name, &tex).map(drop)?
                }
                Some(_) => session.declare_parameter(&name, &tex).map(drop)?,
                None => session.mark_predetermined(&name)?,
            }
            self.eat(&Token::Comma);
        }
    }

    fn model_block(&mut self) -> Result<()> {
        self.consume();
        self.expect(Token::Semicolon, "';' after 'model'")?;
        self.session.begin_model()?;
        loop {
            match self.peek() {
                None => return self.syntax("model block is missing 'end;'"),
                Some(Token::Identifier(word)) if word == "end" => {
                    self.consume();
                    self.expect(Token::Semicolon, "';' after 'end'")?;
                    return self.session.end_model();
                }
                Some(Token::Hash) => {
                    self.consume();
                    let name = self.identifier("a local variable name")?;
                    self.expect(Token::Assign, "'='")?;
                    let rhs = self.expression()?;
                    self.expect(Token::Semicolon, "';'")?;
                    self.session.declare_and_init_model_local_variable(&name, rhs)?;
                }
                Some(_) => {
                    self.equation_body()?;
                    self.expect(Token::Semicolon, "';' at the end of the equation")?;
                }
            }
        }
    }

    fn equation_body(&mut self) -> Result<NodeId> {
        let lhs = self.expression()?;
        if self.eat(&Token::Assign) {
            let rhs = self.expression()?;
            self.session.add_model_equal(lhs, rhs)
        } else {
            self.session.add_model_equal_with_zero_rhs(lhs)
        }
    }

    // --- Expressions, loosest binding first ---

    fn expression(&mut self) -> Result<NodeId> {
        let mut left = self.relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqualEqual) => BinaryOp::Equal,
                Some(Token::NotEqual) => BinaryOp::NotEqual,
                _ => return Ok(left),
            };
            self.consume();
            let right = self.relational()?;
            left = self.session.add_binary(op, left, right);
        }
    }

    fn relational(&mut self) -> Result<NodeId> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Less) => BinaryOp::Less,
                Some(Token::Greater) => BinaryOp::Greater,
                Some(Token::LessEqual) => BinaryOp::LessEqual,
                Some(Token::GreaterEqual) => BinaryOp::GreaterEqual,
                _ => return Ok(left),
            };
            self.consume();
            let right = self.additive()?;
            left = self.session.add_binary(op, left, right);
        }
    }

    fn additive(&mut self) -> Result<NodeId> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Subtract,
                _ => return Ok(left),
            };
            self.consume();
            let right = self.multiplicative()?;
            left = self.session.add_binary(op, left, right);
        }
    }

    fn multiplicative(&mut self) -> Result<NodeId> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Multiply,
                Some(Token::Slash) => BinaryOp::Divide,
                _ => return Ok(left),
            };
            self.consume();
            let right = self.unary()?;
            left = self.session.add_binary(op, left, right);
        }
    }

    /// `-x^2` is `-(x^2)`.
    fn unary(&mut self) -> Result<NodeId> {
        if self.eat(&Token::Minus) {
            let arg = self.unary()?;
            return Ok(self.session.add_uminus(arg));
        }
        if self.eat(&Token::Plus) {
            return self.unary();
        }
        self.power()
    }

    /// Right associative: `a^b^c` is `a^(b^c)`.
    fn power(&mut self) -> Result<NodeId> {
        let base = self.primary()?;
        if self.eat(&Token::Caret) {
            let exponent = self.unary()?;
            return Ok(self.session.add_power(base, exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<NodeId> {
        let location = self.location();
        match self.consume().map(|s| s.token) {
            Some(Token::Number(text)) => self.session.add_constant(&text),
            Some(Token::Identifier(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.call_or_lag(name, location)
                } else {
                    self.session.add_model_variable(&name, 0)
                }
            }
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            _ => Err(CompileError::Syntax {
                message: "expected an expression".to_string(),
                location,
            }),
        }
    }

    fn call_or_lag(&mut self, name: String, location: Location) -> Result<NodeId> {
        let is_variable = matches!(
            self.session.symbols().lookup(&name),
            Some(id) if id.kind != SymbolKind::UnknownFunction
        );
        self.consume();
        if is_variable {
            let lag = self.lag()?;
            self.session.set_location(location);
            return self.session.add_model_variable(&name, lag);
        }

        let args = self.arguments()?;
        self.session.set_location(location);
        let arity = |expected: usize| -> Result<()> {
            if args.len() == expected {
                Ok(())
            } else {
                Err(CompileError::Arity {
                    function: name.clone(),
                    expected,
                    found: args.len(),
                })
            }
        };
        if let Some(op) = UnaryOp::from_function_name(&name) {
            arity(1)?;
            return Ok(self.session.add_unary(op, args[0]));
        }
        match name.as_str() {
            "max" | "min" => {
                arity(2)?;
                let op = if name == "max" { BinaryOp::Max } else { BinaryOp::Min };
                Ok(self.session.add_binary(op, args[0], args[1]))
            }
            "normcdf" => {
                arity(3)?;
                self.session.add_normcdf(args[0], args[1], args[2])
            }
            _ => self.session.add_unknown_function(&name, args),
        }
    }

    /// `(-1)`, `(+1)` or `(2)` after a variable name; the `(` is consumed.
    fn lag(&mut self) -> Result<i32> {
        let sign = if self.eat(&Token::Minus) {
            -1
        } else {
            self.eat(&Token::Plus);
            1
        };
        let lag = match self.peek() {
            Some(Token::Number(text)) => match text.parse::<i32>() {
                Ok(value) => value,
                Err(_) => return self.syntax(format!("lag must be an integer, found '{text}'")),
            },
            _ => return self.syntax("expected an integer lag"),
        };
        self.consume();
        self.expect(Token::RParen, "')' after the lag")?;
        Ok(sign * lag)
    }

    /// Comma-separated arguments up to the closing `)`; the `(` is consumed.
    fn arguments(&mut self) -> Result<Vec<NodeId>> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            self.expect(Token::Comma, "',' or ')'")?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompileOptions;
    use crate::diagnostics::Severity;
    use crate::render::Dialect;

    const GROWTH: &str = "\
var k c;
parameters alpha $\\alpha$;
model;
  k = alpha*k + c;
end;
";

    #[test]
    fn reads_and_compiles_the_growth_model() {
        let mut session = CompilationSession::default();
        read_model(&mut session, GROWTH).unwrap();
        let alpha = session.symbols().lookup("alpha").unwrap();
        assert_eq!(session.symbols().display_name_of(alpha).unwrap(), "\\alpha");

        let compiled = session.compile().unwrap();
        assert!(compiled.text.contains("g1(1,1) = 1 - params(1);"));
        assert!(compiled.text.contains("g1(1,2) = -1;"));
    }

    #[test]
    fn tokens_carry_line_and_columns() {
        let tokens = tokenize("x = 1.5e-3;\n  y(-1)").unwrap();
        assert_eq!(tokens[2].token, Token::Number("1.5e-3".into()));
        assert_eq!(tokens[2].location, Location::new(1, 5, 11));
        assert_eq!(tokens[4].token, Token::Identifier("y".into()));
        assert_eq!(tokens[4].location, Location::new(2, 3, 4));
        assert_eq!(tokenize("a ~= b").unwrap()[1].token, Token::NotEqual);
    }

    #[test]
    fn unary_minus_binds_looser_than_power() {
        let source = "var y x;\nmodel;\n y = -x^2;\n x = 2^-1 + 1.5e-3;\nend;\n";
        let mut session = CompilationSession::default();
        read_model(&mut session, source).unwrap();
        let eqs = session.model().equations();
        let tree = session.tree();
        assert_eq!(tree.render(eqs[0].residual, Dialect::Matlab), "y - (-x^2)");
        assert_eq!(tree.constant_value(eqs[1].rhs), Some(0.5 + 1.5e-3));
    }

    #[test]
    fn lags_locals_and_functions() {
        let source = "\
var y k;
varexo e;
parameters rho;
model;
  // comment line
  # g = exp(e);
  y = rho*y(-1) + g*k(+1); % trailing comment
  k = max(y, 0) + f(k, y);
end;
";
        let mut session = CompilationSession::default();
        read_model(&mut session, source).unwrap();
        let eqs = session.model().equations();
        let tree = session.tree();
        assert_eq!(tree.render(eqs[0].rhs, Dialect::Matlab), "rho*y(-1) + exp(e)*k(1)");
        assert_eq!(tree.render(eqs[1].rhs, Dialect::Matlab), "max(y, 0) + f(k, y)");
        assert_eq!(session.symbols().count(SymbolKind::UnknownFunction), 1);
        assert_eq!(session.symbols().count(SymbolKind::ModelLocalVariable), 1);
    }

    #[test]
    fn syntax_errors_point_at_the_offending_token() {
        let source = "var k;\nmodel;\n  k = 2*(k + ;\nend;\n";
        let mut session = CompilationSession::default();
        let err = read_model(&mut session, source).unwrap_err();
        assert_eq!(err.location(), Some(Location::new(3, 14, 15)));
        let reported = &session.diagnostics()[0];
        assert_eq!(reported.severity, Severity::Error);
        assert_eq!(reported.message, "expected an expression");
        assert_eq!(reported.location, Some(Location::new(3, 14, 15)));
    }

    #[test]
    fn unknown_symbols_are_reported_where_they_occur() {
        let source = "var k;\nmodel;\n  k = 2*q;\nend;\n";
        let mut session = CompilationSession::default();
        let err = read_model(&mut session, source).unwrap_err();
        assert_eq!(err, CompileError::UnknownSymbol("q".into()));
        let reported = &session.diagnostics()[0];
        assert_eq!(reported.message, "unknown symbol: q");
        assert_eq!(reported.location, Some(Location::new(3, 9, 10)));
    }

    #[test]
    fn builtin_arity_is_checked() {
        let source = "var k;\nmodel;\n  k = normcdf(k, 0);\nend;\n";
        let mut session = CompilationSession::default();
        let err = read_model(&mut session, source).unwrap_err();
        assert_eq!(
            err,
            CompileError::Arity {
                function: "normcdf".into(),
                expected: 3,
                found: 2
            }
        );
    }

    #[test]
    fn predetermined_declarations() {
        let source = "var k;\nparameters a;\npredetermined_variables k;\nmodel;\n  k(1) = a*k;\nend;\n";
        let mut session = CompilationSession::new(CompileOptions {
            dynamic: true,
            ..CompileOptions::default()
        });
        read_model(&mut session, source).unwrap();
        let compiled = session.compile().unwrap();
        assert_eq!(compiled.dynamic_columns, Some(2));
    }

    #[test]
    fn predetermined_declarations_must_precede_the_model() {
        let source = "var k;\nparameters a;\nmodel;\n  k(1) = a*k;\nend;\npredetermined_variables k;\n";
        let mut session = CompilationSession::default();
        let err = read_model(&mut session, source).unwrap_err();
        assert!(matches!(err, CompileError::Mode(_)));
        assert_eq!(session.diagnostics()[0].location, Some(Location::new(6, 25, 26)));
    }

    #[test]
    fn single_equations_can_be_added() {
        let mut session = CompilationSession::default();
        session.declare_endogenous("x", "").unwrap();
        session.begin_model().unwrap();
        read_equation(&mut session, "x = 1").unwrap();
        read_equation(&mut session, "log(x);").unwrap();
        assert_eq!(session.model().len(), 2);
        assert!(read_equation(&mut session, "x = 1; x").is_err());
    }

    #[test]
    fn redeclaration_fails() {
        let mut session = CompilationSession::default();
        let err = read_model(&mut session, "var x;\nparameters x;\n").unwrap_err();
        assert_eq!(
            err,
            CompileError::AlreadyDeclared {
                name: "x".into(),
                conflicting_kind: true
            }
        );
    }
}
