//! Operator schemas and the signature parser.
//!
//! Catalog entries are written as TorchScript-style signatures:
//!
//! ```text
//! aten::add_.Tensor(Tensor(a!) self, Tensor other, *, Scalar alpha=1) -> Tensor(a!)
//! ```
//!
//! An alias annotation `(a)` on an argument and a return declares that the
//! return shares storage with that argument; `(a!)` additionally declares
//! that the operator writes to it. `(a -> *)` means the argument's storage
//! escapes into a container.
//!
//! # Grammar
//!
//! ```text
//! schema  = name ['.' overload] '(' [arg (',' arg)*] ')' '->' returns
//! arg     = '*' | '...' | type [ident] ['=' default]
//! type    = ident [alias] ('[' [number] ']' [alias])* ['?']
//! alias   = '(' (ident | '*') ('|' ident)* ['!'] ['->' '*'] ')'
//! returns = '...' | '(' [type [ident] (',' type [ident])*] ')' | type [ident]
//! ```

use crate::{Error, Result};
use std::fmt;

/// Declared type of a schema argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgType {
    Tensor,
    Int,
    Float,
    Bool,
    Scalar,
    Str,
    /// Generic element type (`t`, `Any`).
    Any,
    Module,
    List(Box<ArgType>),
    /// Any other named type (`ScalarType`, `MemoryFormat`, `Device`, ...).
    Other(String),
}

impl ArgType {
    fn from_name(name: &str) -> Self {
        match name {
            "Tensor" => ArgType::Tensor,
            "int" | "SymInt" => ArgType::Int,
            "float" => ArgType::Float,
            "bool" => ArgType::Bool,
            "Scalar" => ArgType::Scalar,
            "str" => ArgType::Str,
            "t" | "Any" => ArgType::Any,
            "Module" => ArgType::Module,
            other => ArgType::Other(other.to_string()),
        }
    }

    /// Check if values of this type can share mutable storage.
    pub fn is_mutable(&self) -> bool {
        matches!(
            self,
            ArgType::Tensor | ArgType::Any | ArgType::Module | ArgType::List(_)
        )
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgType::Tensor => f.write_str("Tensor"),
            ArgType::Int => f.write_str("int"),
            ArgType::Float => f.write_str("float"),
            ArgType::Bool => f.write_str("bool"),
            ArgType::Scalar => f.write_str("Scalar"),
            ArgType::Str => f.write_str("str"),
            ArgType::Any => f.write_str("t"),
            ArgType::Module => f.write_str("Module"),
            ArgType::List(element) => write!(f, "{element}[]"),
            ArgType::Other(name) => f.write_str(name),
        }
    }
}

/// Alias annotation: `(a)`, `(a!)` or `(a -> *)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasAnnotation {
    /// Alias set name (`a`, or `*` for "anything").
    pub set: String,
    /// The operator writes through this reference.
    pub is_write: bool,
    /// The storage escapes into a container (`-> *`).
    pub escapes: bool,
}

impl fmt::Display for AliasAnnotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        f.write_str(&self.set)?;
        if self.is_write {
            f.write_str("!")?;
        }
        if self.escapes {
            f.write_str(" -> *")?;
        }
        f.write_str(")")
    }
}

/// One argument or return of a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    /// Argument name (empty for unnamed returns).
    pub name: String,
    pub ty: ArgType,
    pub optional: bool,
    pub alias: Option<AliasAnnotation>,
    pub kwarg_only: bool,
    /// Default value, kept as source text.
    pub default: Option<String>,
}

impl Argument {
    /// Check if the operator may write through this argument.
    pub fn is_write(&self) -> bool {
        self.alias.as_ref().is_some_and(|a| a.is_write)
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ty)?;
        if let Some(alias) = &self.alias {
            write!(f, "{alias}")?;
        }
        if self.optional {
            f.write_str("?")?;
        }
        if !self.name.is_empty() {
            write!(f, " {}", self.name)?;
        }
        if let Some(default) = &self.default {
            write!(f, "={default}")?;
        }
        Ok(())
    }
}

/// Declared contract of an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    /// Namespaced name, e.g. `aten::add`.
    pub name: String,
    /// Overload name, e.g. `Tensor` in `aten::add.Tensor`.
    pub overload: Option<String>,
    pub arguments: Vec<Argument>,
    pub returns: Vec<Argument>,
    /// Accepts any number of trailing inputs.
    pub is_vararg: bool,
    /// Produces any number of outputs.
    pub is_varret: bool,
}

impl Schema {
    /// Parse a TorchScript-style signature.
    pub fn parse(signature: &str) -> Result<Self> {
        let fail = |message: String| Error::SchemaParse {
            signature: signature.to_string(),
            message,
        };
        let tokens = tokenize(signature).map_err(fail)?;
        let mut parser = Parser::new(tokens);
        let schema = parser.parse_schema().map_err(fail)?;

        if parser.pos < parser.tokens.len() {
            return Err(fail(format!(
                "Unexpected token after schema: {:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(schema)
    }

    /// The registry key: `name` or `name.overload`.
    pub fn qualified_name(&self) -> String {
        match &self.overload {
            Some(overload) => format!("{}.{}", self.name, overload),
            None => self.name.clone(),
        }
    }

    /// Check if the operator may write through its `index`-th input.
    ///
    /// Inputs matched by `...` are never declared writable.
    pub fn writes_argument(&self, index: usize) -> bool {
        self.arguments.get(index).is_some_and(Argument::is_write)
    }

    /// Alias annotation of the `index`-th input, if declared.
    pub fn argument_alias(&self, index: usize) -> Option<&AliasAnnotation> {
        self.arguments.get(index).and_then(|a| a.alias.as_ref())
    }

    /// Alias annotation of the `index`-th output, if declared.
    pub fn output_alias(&self, index: usize) -> Option<&AliasAnnotation> {
        self.returns.get(index).and_then(|a| a.alias.as_ref())
    }

    /// Check if any argument is declared mutable.
    pub fn is_mutable(&self) -> bool {
        self.arguments.iter().any(Argument::is_write)
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.qualified_name())?;
        let mut first = true;
        let mut kwarg_marker = false;
        for argument in &self.arguments {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            if argument.kwarg_only && !kwarg_marker {
                f.write_str("*, ")?;
                kwarg_marker = true;
            }
            write!(f, "{argument}")?;
        }
        if self.is_vararg {
            if !first {
                f.write_str(", ")?;
            }
            f.write_str("...")?;
        }
        f.write_str(") -> ")?;

        if self.is_varret {
            return f.write_str("...");
        }
        match self.returns.as_slice() {
            [single] => write!(f, "{single}"),
            returns => {
                f.write_str("(")?;
                for (i, ret) in returns.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{ret}")?;
                }
                f.write_str(")")
            }
        }
    }
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    /// Numeric literal, kept as written.
    Number(String),
    /// String literal including its quotes.
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Question,
    Bang,
    Star,
    Pipe,
    Arrow,
    Ellipsis,
    Eq,
    ColonColon,
    Dot,
}

impl Token {
    fn text(&self) -> String {
        match self {
            Token::Ident(s) | Token::Number(s) | Token::Str(s) => s.clone(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
            Token::LBracket => "[".to_string(),
            Token::RBracket => "]".to_string(),
            Token::Comma => ",".to_string(),
            Token::Question => "?".to_string(),
            Token::Bang => "!".to_string(),
            Token::Star => "*".to_string(),
            Token::Pipe => "|".to_string(),
            Token::Arrow => "->".to_string(),
            Token::Ellipsis => "...".to_string(),
            Token::Eq => "=".to_string(),
            Token::ColonColon => "::".to_string(),
            Token::Dot => ".".to_string(),
        }
    }
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' | ')' | '[' | ']' | ',' | '?' | '!' | '*' | '|' | '=' => {
                chars.next();
                tokens.push(match ch {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    ',' => Token::Comma,
                    '?' => Token::Question,
                    '!' => Token::Bang,
                    '*' => Token::Star,
                    '|' => Token::Pipe,
                    _ => Token::Eq,
                });
            }
            ':' => {
                chars.next();
                if chars.next() != Some(':') {
                    return Err("Expected '::'".to_string());
                }
                tokens.push(Token::ColonColon);
            }
            '-' => {
                chars.next();
                match chars.peek() {
                    Some('>') => {
                        chars.next();
                        tokens.push(Token::Arrow);
                    }
                    Some(c) if c.is_ascii_digit() => {
                        let number = parse_number(&mut chars);
                        tokens.push(Token::Number(format!("-{number}")));
                    }
                    _ => return Err("Unexpected character: '-'".to_string()),
                }
            }
            '.' => {
                chars.next();
                if chars.peek() == Some(&'.') {
                    chars.next();
                    if chars.next() != Some('.') {
                        return Err("Expected '...'".to_string());
                    }
                    tokens.push(Token::Ellipsis);
                } else {
                    tokens.push(Token::Dot);
                }
            }
            '"' | '\'' => {
                chars.next();
                let mut text = String::from(ch);
                loop {
                    match chars.next() {
                        Some(c) if c == ch => break,
                        Some(c) => text.push(c),
                        None => return Err("Unterminated string literal".to_string()),
                    }
                }
                text.push(ch);
                tokens.push(Token::Str(text));
            }
            '0'..='9' => {
                let number = parse_number(&mut chars);
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                tokens.push(Token::Ident(parse_ident(&mut chars)));
            }
            _ => {
                return Err(format!("Unexpected character: '{}'", ch));
            }
        }
    }

    Ok(tokens)
}

fn parse_number(chars: &mut std::iter::Peekable<std::str::Chars>) -> String {
    let mut number = String::new();
    while let Some(&ch) = chars.peek() {
        if ch.is_ascii_digit() || ch == '.' || ch == 'e' {
            number.push(ch);
            chars.next();
        } else {
            break;
        }
    }
    number
}

fn parse_ident(chars: &mut std::iter::Peekable<std::str::Chars>) -> String {
    let mut ident = String::new();
    while let Some(&ch) = chars.peek() {
        if ch.is_alphanumeric() || ch == '_' {
            ident.push(ch);
            chars.next();
        } else {
            break;
        }
    }
    ident
}

// ============================================================================
// Parser
// ============================================================================

type ParseResult<T> = std::result::Result<T, String>;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn current(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.current() == Some(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> ParseResult<()> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(format!(
                "Expected '{}', found {:?}",
                token.text(),
                self.current()
            ))
        }
    }

    fn ident(&mut self) -> ParseResult<String> {
        match self.current() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            other => Err(format!("Expected identifier, found {:?}", other)),
        }
    }

    fn parse_schema(&mut self) -> ParseResult<Schema> {
        let namespace = self.ident()?;
        self.expect(Token::ColonColon)?;
        let name = format!("{}::{}", namespace, self.ident()?);
        let overload = if self.eat(&Token::Dot) {
            Some(self.ident()?)
        } else {
            None
        };

        self.expect(Token::LParen)?;
        let mut arguments = Vec::new();
        let mut is_vararg = false;
        let mut kwarg_only = false;
        if !self.eat(&Token::RParen) {
            loop {
                if self.eat(&Token::Star) {
                    kwarg_only = true;
                } else if self.eat(&Token::Ellipsis) {
                    is_vararg = true;
                } else {
                    let mut argument = self.parse_argument(true)?;
                    argument.kwarg_only = kwarg_only;
                    arguments.push(argument);
                }
                if self.eat(&Token::RParen) {
                    break;
                }
                self.expect(Token::Comma)?;
            }
        }

        self.expect(Token::Arrow)?;
        let (returns, is_varret) = self.parse_returns()?;

        Ok(Schema {
            name,
            overload,
            arguments,
            returns,
            is_vararg,
            is_varret,
        })
    }

    fn parse_returns(&mut self) -> ParseResult<(Vec<Argument>, bool)> {
        if self.eat(&Token::Ellipsis) {
            return Ok((Vec::new(), true));
        }
        if !self.eat(&Token::LParen) {
            return Ok((vec![self.parse_argument(false)?], false));
        }
        let mut returns = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok((returns, false));
        }
        loop {
            returns.push(self.parse_argument(false)?);
            if self.eat(&Token::RParen) {
                return Ok((returns, false));
            }
            self.expect(Token::Comma)?;
        }
    }

    fn parse_argument(&mut self, allow_default: bool) -> ParseResult<Argument> {
        let mut ty = ArgType::from_name(&self.ident()?);
        let mut alias = self.parse_alias()?;

        while self.eat(&Token::LBracket) {
            if let Some(Token::Number(_)) = self.current() {
                self.advance();
            }
            self.expect(Token::RBracket)?;
            ty = ArgType::List(Box::new(ty));
            if let Some(list_alias) = self.parse_alias()? {
                // The annotation after `[]` describes the list itself
                alias = Some(list_alias);
            }
        }
        let optional = self.eat(&Token::Question);

        let name = match self.current() {
            Some(Token::Ident(_)) => self.ident()?,
            _ => String::new(),
        };

        let default = if allow_default && self.eat(&Token::Eq) {
            Some(self.parse_default()?)
        } else {
            None
        };

        Ok(Argument {
            name,
            ty,
            optional,
            alias,
            kwarg_only: false,
            default,
        })
    }

    fn parse_alias(&mut self) -> ParseResult<Option<AliasAnnotation>> {
        if !self.eat(&Token::LParen) {
            return Ok(None);
        }
        let set = if self.eat(&Token::Star) {
            "*".to_string()
        } else {
            self.ident()?
        };
        while self.eat(&Token::Pipe) {
            self.ident()?;
        }
        let is_write = self.eat(&Token::Bang);
        let escapes = if self.eat(&Token::Arrow) {
            self.expect(Token::Star)?;
            true
        } else {
            false
        };
        self.expect(Token::RParen)?;
        Ok(Some(AliasAnnotation {
            set,
            is_write,
            escapes,
        }))
    }

    /// Collect default-value tokens up to the next `,` or `)` at depth zero.
    fn parse_default(&mut self) -> ParseResult<String> {
        let mut text = String::new();
        let mut depth = 0usize;
        loop {
            match self.current() {
                None => return Err("Unterminated default value".to_string()),
                Some(Token::Comma) | Some(Token::RParen) if depth == 0 => break,
                Some(token) => {
                    match token {
                        Token::LBracket | Token::LParen => depth += 1,
                        Token::RBracket | Token::RParen => depth = depth.saturating_sub(1),
                        _ => {}
                    }
                    text.push_str(&token.text());
                    self.advance();
                }
            }
        }
        if text.is_empty() {
            return Err("Empty default value".to_string());
        }
        Ok(text)
    }
}
