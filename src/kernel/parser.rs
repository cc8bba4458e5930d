//! Parser for the textual kernel format.
//!
//! A file holds any number of top-level items:
//!
//! ```text
//! const SCALE: f32 = 2.0              ; captured constant
//! const LUT: [u32] = [1, 2, 4, 8]     ; captured constant table
//! extern mut COUNTER: u32             ; mutable host variable
//!
//! fn scale(v, s: f32) {               ; helper, `v` is generic
//!     return v * s
//! }
//!
//! codelet Scale(x: in [f32], y: out [f32], n: in u32) {
//!     for i in 0 .. len(x) {
//!         y[i] = scale(x[i], SCALE)
//!     }
//! }
//! ```
//!
//! Statements end at a newline. Constants, externs and helpers are shared by
//! every codelet of the file; each codelet captures only what its body and
//! the helpers it reaches refer to. Names that resolve to nothing are kept as
//! uncaptured globals so the verifier reports them.

use std::collections::{BTreeMap, BTreeSet};

use super::display::ExprText;
use super::visit::{for_each_expr, for_each_expr_mut};
use super::{
    ArrayRef, BinaryOp, Call, Callee, Capture, Direction, ElemType, Expr, FieldDecl, FieldShape, HelperFn,
    KernelSpec, Literal, Macro, Param, Scalar, Stmt, UnaryOp, GENERATED_PREFIX, RESERVED,
};
use crate::core::error::ParseError;

/// Parse every codelet of `text`.
pub fn parse_codelets(text: &str) -> Result<Vec<KernelSpec>, ParseError> {
    let parser = Parser::new(text);
    parser.parse()
}

/// Parse a text that holds exactly one codelet.
pub fn parse_codelet(text: &str) -> Result<KernelSpec, ParseError> {
    let mut codelets = parse_codelets(text)?;
    match codelets.len() {
        1 => Ok(codelets.remove(0)),
        n => Err(ParseError {
            line: 1,
            column: 1,
            message: format!("expected exactly one codelet, found {}", n),
        }),
    }
}

struct RawCodelet {
    pos: usize,
    name: String,
    fields: Vec<FieldDecl>,
    body: Vec<Stmt>,
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,

    // File-level items
    captures: BTreeMap<String, Capture>,
    helpers: Vec<HelperFn>,
    codelets: Vec<RawCodelet>,

    // Per-body state
    fields: Vec<FieldDecl>,
    scopes: Vec<Vec<String>>,
}

type PResult<T> = Result<T, ParseError>;

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            captures: BTreeMap::new(),
            helpers: Vec::new(),
            codelets: Vec::new(),
            fields: Vec::new(),
            scopes: Vec::new(),
        }
    }

    fn parse(mut self) -> PResult<Vec<KernelSpec>> {
        self.skip_whitespace(true);

        while !self.is_eof() {
            let start = self.pos;
            let keyword = self.read_identifier()?;
            match keyword {
                "const" => self.parse_const()?,
                "extern" => self.parse_extern()?,
                "fn" => self.parse_helper()?,
                "codelet" => self.parse_codelet(start)?,
                other => {
                    self.pos = start;
                    return Err(self.error(format!(
                        "expected `const`, `extern`, `fn` or `codelet`, found `{}`",
                        other
                    )));
                }
            }
            self.skip_whitespace(true);
        }

        self.resolve_helper_calls();
        let codelets = std::mem::take(&mut self.codelets);
        codelets.into_iter().map(|raw| self.assemble(raw)).collect()
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn current_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn peek_char(&self, offset: usize) -> Option<char> {
        self.text[self.pos..].chars().nth(offset)
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn skip_whitespace(&mut self, skip_newlines: bool) {
        while let Some(ch) = self.current_char() {
            if ch == ';' {
                // Comment up to the end of the line; the newline itself ends a statement.
                while let Some(ch) = self.current_char() {
                    if ch == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else if ch.is_whitespace() {
                if ch == '\n' && !skip_newlines {
                    break;
                }
                self.advance();
            } else {
                break;
            }
        }
    }

    fn try_read(&mut self, ch: char) -> bool {
        self.skip_whitespace(true);
        if self.current_char() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Like `try_read`, but `ch` must be on the current line.
    fn try_read_inline(&mut self, ch: char) -> bool {
        self.skip_whitespace(false);
        if self.current_char() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn try_read_str(&mut self, s: &str) -> bool {
        self.skip_whitespace(true);
        if self.rest().starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> PResult<()> {
        if !self.try_read(ch) {
            let found = match self.current_char() {
                Some(c) => format!("'{}'", c),
                None => "end of input".to_string(),
            };
            return Err(self.error(format!("expected '{}' but found {}", ch, found)));
        }
        Ok(())
    }

    fn read_identifier(&mut self) -> PResult<&'a str> {
        self.skip_whitespace(true);
        let start = self.pos;

        match self.current_char() {
            Some(ch) if ch.is_ascii_alphabetic() || ch == '_' => {}
            Some(ch) => return Err(self.error(format!("expected identifier but found '{}'", ch))),
            None => return Err(self.error("expected identifier but found end of input")),
        }

        while let Some(ch) = self.current_char() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }

        Ok(&self.text[start..self.pos])
    }

    /// Peek the identifier at the cursor without consuming it.
    fn peek_identifier(&mut self) -> Option<&'a str> {
        let save = self.pos;
        let ident = self.read_identifier().ok();
        self.pos = save;
        ident
    }

    /// Consume `word` if the current line continues with it as a whole word.
    fn try_keyword_inline(&mut self, word: &str) -> bool {
        self.skip_whitespace(false);
        let rest = self.rest();
        let whole = rest.starts_with(word)
            && !rest[word.len()..]
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
        if whole {
            self.pos += word.len();
        }
        whole
    }

    fn read_name(&mut self, what: &str) -> PResult<String> {
        let start = self.pos;
        let name = self.read_identifier()?;
        if RESERVED.contains(&name) || name.starts_with(GENERATED_PREFIX) {
            self.pos = start;
            self.skip_whitespace(true);
            return Err(self.error(format!("`{}` cannot be used as a {} name", name, what)));
        }
        Ok(name.to_string())
    }

    fn parse_type(&mut self) -> PResult<ElemType> {
        let start = self.pos;
        let name = self.read_identifier()?;
        ElemType::from_name(name).ok_or_else(|| {
            self.pos = start;
            self.skip_whitespace(true);
            self.error(format!("unknown type `{}`", name))
        })
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        error_at(self.text, self.pos, message)
    }

    // ---- Items -------------------------------------------------------------

    fn declare_capture(&mut self, start: usize, name: String, capture: Capture) -> PResult<()> {
        if self.captures.contains_key(&name) || self.helpers.iter().any(|h| h.name == name) {
            return Err(error_at(self.text, start, format!("`{}` is already declared", name)));
        }
        self.captures.insert(name, capture);
        Ok(())
    }

    fn parse_const(&mut self) -> PResult<()> {
        self.skip_whitespace(true);
        let start = self.pos;
        let name = self.read_name("constant")?;
        self.expect(':')?;

        let capture = if self.try_read('[') {
            let elem = self.parse_type()?;
            self.expect(']')?;
            self.expect('=')?;
            self.expect('[')?;
            let mut values = Vec::new();
            if !self.try_read(']') {
                loop {
                    values.push(self.parse_constant_value(elem)?);
                    if self.try_read(']') {
                        break;
                    }
                    self.expect(',')?;
                }
            }
            if values.is_empty() {
                return Err(error_at(self.text, start, format!("constant table `{}` is empty", name)));
            }
            Capture::ConstArray { elem, values }
        } else {
            let elem = self.parse_type()?;
            self.expect('=')?;
            Capture::Constant(self.parse_constant_value(elem)?)
        };

        self.declare_capture(start, name, capture)
    }

    fn parse_extern(&mut self) -> PResult<()> {
        if self.read_identifier()? != "mut" {
            return Err(self.error("expected `mut` after `extern`"));
        }
        self.skip_whitespace(true);
        let start = self.pos;
        let name = self.read_name("global")?;
        self.expect(':')?;
        let elem = self.parse_type()?;
        self.declare_capture(start, name, Capture::Mutable { elem })
    }

    fn parse_constant_value(&mut self, elem: ElemType) -> PResult<Scalar> {
        self.skip_whitespace(true);
        let start = self.pos;
        let negate = self.try_read('-');
        let literal = match self.peek_identifier() {
            Some(word @ ("true" | "false")) if !negate => {
                self.read_identifier()?;
                Literal::Typed(Scalar::Bool(word == "true"))
            }
            _ => self.parse_number(negate)?,
        };

        let value = match literal {
            Literal::Typed(s) if s.elem() == elem => Some(s),
            Literal::Int(v) if elem.is_integer() && elem.can_hold(v) => Some(Scalar::from_i128(elem, v)),
            Literal::Int(v) if elem.is_float() => Some(Scalar::F32(v as f32)),
            Literal::Float(v) if elem.is_float() => Some(Scalar::F32(v as f32)),
            _ => None,
        };
        value.ok_or_else(|| error_at(self.text, start, format!("value does not fit type {}", elem)))
    }

    fn parse_helper(&mut self) -> PResult<()> {
        self.skip_whitespace(true);
        let start = self.pos;
        let name = self.read_name("function")?;
        if self.helpers.iter().any(|h| h.name == name) || self.captures.contains_key(&name) {
            return Err(error_at(self.text, start, format!("`{}` is already declared", name)));
        }

        self.expect('(')?;
        let mut params: Vec<Param> = Vec::new();
        if !self.try_read(')') {
            loop {
                self.skip_whitespace(true);
                let param_start = self.pos;
                let pname = self.read_name("parameter")?;
                if params.iter().any(|p| p.name == pname) {
                    return Err(error_at(
                        self.text,
                        param_start,
                        format!("parameter `{}` declared twice", pname),
                    ));
                }
                let ty = if self.try_read(':') { Some(self.parse_type()?) } else { None };
                params.push(Param { name: pname, ty });
                if self.try_read(')') {
                    break;
                }
                self.expect(',')?;
            }
        }

        self.fields.clear();
        self.scopes = vec![params.iter().map(|p| p.name.clone()).collect()];
        let body = self.parse_block()?;
        self.scopes.clear();

        self.helpers.push(HelperFn { name, params, body });
        Ok(())
    }

    fn parse_codelet(&mut self, pos: usize) -> PResult<()> {
        self.skip_whitespace(true);
        let name_pos = self.pos;
        let name = self.read_name("codelet")?;
        if self.codelets.iter().any(|c| c.name == name) {
            return Err(error_at(self.text, name_pos, format!("codelet `{}` is defined twice", name)));
        }

        self.expect('(')?;
        let mut fields: Vec<FieldDecl> = Vec::new();
        if !self.try_read(')') {
            loop {
                self.skip_whitespace(true);
                let field_start = self.pos;
                let fname = self.read_name("field")?;
                if fields.iter().any(|f| f.name == fname) {
                    return Err(error_at(
                        self.text,
                        field_start,
                        format!("field `{}` declared twice", fname),
                    ));
                }
                self.expect(':')?;
                let word = self.read_identifier()?;
                let direction = Direction::from_keyword(word)
                    .ok_or_else(|| self.error(format!("expected `in`, `out` or `inout`, found `{}`", word)))?;
                let (shape, elem) = if self.try_read('[') {
                    let elem = self.parse_type()?;
                    self.expect(']')?;
                    (FieldShape::Vector, elem)
                } else {
                    (FieldShape::Scalar, self.parse_type()?)
                };
                fields.push(FieldDecl {
                    name: fname,
                    direction,
                    shape,
                    elem,
                });
                if self.try_read(')') {
                    break;
                }
                self.expect(',')?;
            }
        }

        self.fields = fields;
        self.scopes = vec![Vec::new()];
        let body = self.parse_block()?;
        self.scopes.clear();

        self.codelets.push(RawCodelet {
            pos,
            name,
            fields: std::mem::take(&mut self.fields),
            body,
        });
        Ok(())
    }

    // ---- Statements --------------------------------------------------------

    fn parse_block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect('{')?;
        self.scopes.push(Vec::new());
        let mut stmts = Vec::new();
        loop {
            self.skip_whitespace(true);
            if self.try_read('}') {
                break;
            }
            if self.is_eof() {
                return Err(self.error("unterminated block"));
            }
            stmts.push(self.parse_statement()?);
            if !self.at_statement_end() {
                return Err(self.error("expected end of line after statement"));
            }
        }
        self.scopes.pop();
        Ok(stmts)
    }

    fn at_statement_end(&mut self) -> bool {
        self.skip_whitespace(false);
        matches!(self.current_char(), None | Some('\n') | Some('}'))
    }

    fn parse_statement(&mut self) -> PResult<Stmt> {
        self.skip_whitespace(true);
        match self.current_char() {
            Some('@') => {
                self.advance();
                return self.parse_macro();
            }
            Some('{') => return Ok(Stmt::Block(self.parse_block()?)),
            _ => {}
        }

        let start = self.pos;
        match self.peek_identifier() {
            Some("let") => {
                self.read_identifier()?;
                self.parse_let()
            }
            Some("if") => {
                self.read_identifier()?;
                self.parse_if()
            }
            Some("for") => {
                self.read_identifier()?;
                self.parse_for()
            }
            Some("while") => {
                self.read_identifier()?;
                let cond = self.parse_expr()?;
                let body = self.parse_block()?;
                Ok(Stmt::While { cond, body })
            }
            Some("return") => {
                self.read_identifier()?;
                if self.at_statement_end() {
                    Ok(Stmt::Return(None))
                } else {
                    Ok(Stmt::Return(Some(self.parse_expr()?)))
                }
            }
            _ => {
                let target = self.parse_expr()?;
                if !self.try_assign_operator() {
                    return Ok(Stmt::Expr(target));
                }
                let value = self.parse_expr()?;
                match target {
                    Expr::Local(name) => Ok(Stmt::Assign { name, value }),
                    Expr::Field(name) | Expr::Global(name) => Ok(Stmt::Store {
                        field: name,
                        index: None,
                        value,
                    }),
                    Expr::Index { base, index } => Ok(Stmt::Store {
                        field: base.name().to_string(),
                        index: Some(*index),
                        value,
                    }),
                    _ => Err(error_at(self.text, start, "left side of `=` is not assignable")),
                }
            }
        }
    }

    fn try_assign_operator(&mut self) -> bool {
        self.skip_whitespace(false);
        if self.rest().starts_with('=') && !self.rest().starts_with("==") {
            self.advance();
            true
        } else {
            false
        }
    }

    fn declare_local(&mut self, name: &str, start: usize) -> PResult<()> {
        if self.fields.iter().any(|f| f.name == name) {
            return Err(error_at(self.text, start, format!("local `{}` shadows a field", name)));
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.push(name.to_string());
        }
        Ok(())
    }

    fn parse_let(&mut self) -> PResult<Stmt> {
        self.skip_whitespace(true);
        let start = self.pos;
        let name = self.read_name("local")?;
        let ty = if self.try_read(':') { Some(self.parse_type()?) } else { None };
        self.expect('=')?;
        let value = self.parse_expr()?;
        // The local is visible from the next statement on.
        self.declare_local(&name, start)?;
        Ok(Stmt::Let { name, ty, value })
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        let cond = self.parse_expr()?;
        let then = self.parse_block()?;
        let otherwise = if self.try_keyword_inline("else") {
            if self.try_keyword_inline("if") {
                vec![self.parse_if()?]
            } else {
                self.parse_block()?
            }
        } else {
            Vec::new()
        };
        Ok(Stmt::If {
            cond,
            then,
            otherwise,
        })
    }

    fn parse_for(&mut self) -> PResult<Stmt> {
        self.skip_whitespace(true);
        let var_start = self.pos;
        let var = self.read_name("loop variable")?;
        if self.read_identifier()? != "in" {
            return Err(self.error("expected `in` in for loop"));
        }
        let start = self.parse_expr()?;
        if !self.try_read_str("..") {
            return Err(self.error("expected `..` in for loop range"));
        }
        let end = self.parse_expr()?;

        self.scopes.push(Vec::new());
        self.declare_local(&var, var_start)?;
        let body = self.parse_block();
        self.scopes.pop();

        Ok(Stmt::For {
            var,
            start,
            end,
            body: body?,
        })
    }

    fn parse_macro(&mut self) -> PResult<Stmt> {
        let name = self.read_identifier()?;
        match name {
            "print" | "println" => {
                self.expect('(')?;
                let args = self.parse_args_until(')')?;
                Ok(Stmt::Macro(Macro::Print {
                    args,
                    newline: name == "println",
                }))
            }
            "show" => {
                self.expect('(')?;
                self.skip_whitespace(true);
                let label = if self.current_char() == Some('"') {
                    let label = self.parse_string()?;
                    self.expect(',')?;
                    Some(label)
                } else {
                    None
                };
                let expr = self.parse_expr()?;
                self.expect(')')?;
                let text = label.unwrap_or_else(|| ExprText(&expr).to_string());
                Ok(Stmt::Macro(Macro::Show { expr, text }))
            }
            "cycles" => {
                self.skip_whitespace(true);
                let label = self.parse_string()?;
                let body = self.parse_block()?;
                Ok(Stmt::Macro(Macro::Cycles { label, body }))
            }
            other => Err(self.error(format!("unknown macro `@{}`", other))),
        }
    }

    // ---- Expressions -------------------------------------------------------

    fn parse_expr(&mut self) -> PResult<Expr> {
        self.parse_binary(1)
    }

    fn parse_binary(&mut self, min_prec: u8) -> PResult<Expr> {
        let mut lhs = self.parse_cast()?;
        loop {
            self.skip_whitespace(false);
            let Some((op, width)) = binary_operator(self.rest()) else {
                break;
            };
            if op.precedence() < min_prec {
                break;
            }
            self.pos += width;
            let rhs = self.parse_binary(op.precedence() + 1)?;
            lhs = Expr::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_cast(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_unary()?;
        while self.try_keyword_inline("as") {
            let to = self.parse_type()?;
            expr = expr.cast(to);
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        self.skip_whitespace(true);
        match self.current_char() {
            Some('-') => {
                self.advance();
                if self.current_char().is_some_and(|c| c.is_ascii_digit()) {
                    let literal = self.parse_number(true)?;
                    return self.parse_postfix(Expr::Const(literal));
                }
                Ok(Expr::unary(UnaryOp::Neg, self.parse_unary()?))
            }
            Some('!') => {
                self.advance();
                Ok(Expr::unary(UnaryOp::Not, self.parse_unary()?))
            }
            _ => {
                let primary = self.parse_primary()?;
                self.parse_postfix(primary)
            }
        }
    }

    /// Method-call syntax, which always dispatches dynamically.
    fn parse_postfix(&mut self, mut expr: Expr) -> PResult<Expr> {
        loop {
            self.skip_whitespace(false);
            if self.current_char() == Some('.') && self.peek_char(1) != Some('.') {
                self.advance();
                let method = self.read_identifier()?.to_string();
                self.expect('(')?;
                let mut args = vec![expr];
                args.extend(self.parse_args_until(')')?);
                expr = Expr::call(Callee::Dynamic { method }, args);
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        self.skip_whitespace(true);
        match self.current_char() {
            Some('(') => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(')')?;
                Ok(expr)
            }
            Some('"') => Ok(Expr::Str(self.parse_string()?)),
            Some(c) if c.is_ascii_digit() => Ok(Expr::Const(self.parse_number(false)?)),
            Some(_) => self.parse_name_expr(),
            None => Err(self.error("expected expression but found end of input")),
        }
    }

    fn parse_name_expr(&mut self) -> PResult<Expr> {
        let start = self.pos;
        let name = self.read_identifier()?;
        match name {
            "true" => return Ok(Expr::bool(true)),
            "false" => return Ok(Expr::bool(false)),
            "len" => {
                self.expect('(')?;
                let field = self.read_identifier()?.to_string();
                self.expect(')')?;
                return Ok(Expr::Len(field));
            }
            "select" => {
                self.expect('(')?;
                let cond = self.parse_expr()?;
                self.expect(',')?;
                let then = self.parse_expr()?;
                self.expect(',')?;
                let otherwise = self.parse_expr()?;
                self.expect(')')?;
                return Ok(Expr::select(cond, then, otherwise));
            }
            "new" => {
                self.expect('[')?;
                let elem = self.parse_type()?;
                self.expect(';')?;
                let len = self.parse_expr()?;
                self.expect(']')?;
                return Ok(Expr::alloc(elem, len));
            }
            _ => {}
        }

        // Qualified calls: `runtime::name(..)` and `library::symbol(..)`.
        if self.rest().starts_with("::") {
            self.pos += 2;
            let symbol = self.read_identifier()?.to_string();
            self.expect('(')?;
            let args = self.parse_args_until(')')?;
            let callee = if name == "runtime" {
                Callee::Runtime(symbol)
            } else {
                Callee::Foreign {
                    library: name.to_string(),
                    symbol,
                }
            };
            return Ok(Expr::call(callee, args));
        }

        if RESERVED.contains(&name) {
            self.pos = start;
            return Err(self.error(format!("unexpected keyword `{}`", name)));
        }

        if self.try_read_inline('(') {
            // A leading type name is the type argument of shapes such as `rand(f32)`.
            let mut type_arg = None;
            let save = self.pos;
            if let Some(elem) = self.peek_identifier().and_then(ElemType::from_name) {
                self.read_identifier()?;
                if self.try_read(')') {
                    return Ok(Expr::Call(Call {
                        callee: Callee::Library(name.to_string()),
                        type_arg: Some(elem),
                        args: Vec::new(),
                    }));
                } else if self.try_read(',') {
                    type_arg = Some(elem);
                } else {
                    self.pos = save;
                }
            }
            let args = self.parse_args_until(')')?;
            return Ok(Expr::Call(Call {
                callee: Callee::Library(name.to_string()),
                type_arg,
                args,
            }));
        }

        if self.try_read_inline('[') {
            let index = self.parse_expr()?;
            self.expect(']')?;
            let base = if self.is_local(name) {
                self.pos = start;
                return Err(self.error(format!("local `{}` cannot be indexed", name)));
            } else if self.fields.iter().any(|f| f.name == name) {
                ArrayRef::Field(name.to_string())
            } else {
                ArrayRef::Global(name.to_string())
            };
            return Ok(Expr::Index {
                base,
                index: Box::new(index),
            });
        }

        Ok(self.resolve(name))
    }

    fn is_local(&self, name: &str) -> bool {
        self.scopes.iter().rev().any(|scope| scope.iter().any(|n| n == name))
    }

    fn resolve(&self, name: &str) -> Expr {
        if self.is_local(name) {
            Expr::Local(name.to_string())
        } else if self.fields.iter().any(|f| f.name == name) {
            Expr::Field(name.to_string())
        } else {
            Expr::Global(name.to_string())
        }
    }

    fn parse_args_until(&mut self, close: char) -> PResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.try_read(close) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if self.try_read(close) {
                return Ok(args);
            }
            self.expect(',')?;
        }
    }

    fn parse_string(&mut self) -> PResult<String> {
        self.expect('"')?;
        let mut out = String::new();
        loop {
            match self.current_char() {
                None | Some('\n') => return Err(self.error("unterminated string literal")),
                Some('"') => {
                    self.advance();
                    return Ok(out);
                }
                Some('\\') => {
                    self.advance();
                    let escaped = match self.current_char() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('"') => '"',
                        Some('\\') => '\\',
                        other => return Err(self.error(format!("invalid escape {:?}", other))),
                    };
                    out.push(escaped);
                    self.advance();
                }
                Some(c) => {
                    out.push(c);
                    self.advance();
                }
            }
        }
    }

    /// Integer or float literal with an optional type suffix.
    fn parse_number(&mut self, negate: bool) -> PResult<Literal> {
        self.skip_whitespace(true);
        let text = self.text;
        let start = self.pos;

        let is_hex = self.rest().starts_with("0x") || self.rest().starts_with("0X");
        let mut is_float = false;
        let value_text = if is_hex {
            self.pos += 2;
            let digits_start = self.pos;
            while self.current_char().is_some_and(|c| c.is_ascii_hexdigit()) {
                self.advance();
            }
            &text[digits_start..self.pos]
        } else {
            while self.current_char().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
            // `0..n` is a range, not a fraction.
            if self.current_char() == Some('.') && self.peek_char(1).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                self.advance();
                while self.current_char().is_some_and(|c| c.is_ascii_digit()) {
                    self.advance();
                }
            }
            if matches!(self.current_char(), Some('e' | 'E')) {
                let exponent_digit = match self.peek_char(1) {
                    Some('+' | '-') => self.peek_char(2),
                    other => other,
                };
                if exponent_digit.is_some_and(|c| c.is_ascii_digit()) {
                    is_float = true;
                    self.advance();
                    if matches!(self.current_char(), Some('+' | '-')) {
                        self.advance();
                    }
                    while self.current_char().is_some_and(|c| c.is_ascii_digit()) {
                        self.advance();
                    }
                }
            }
            &text[start..self.pos]
        };

        if value_text.is_empty() {
            return Err(self.error("expected number"));
        }

        let suffix = match self.current_char() {
            Some(c) if c.is_ascii_alphabetic() => {
                let suffix_start = self.pos;
                let word = self.read_identifier()?;
                match ElemType::from_name(word) {
                    Some(ElemType::Bool) | None => {
                        return Err(error_at(
                            text,
                            suffix_start,
                            format!("invalid literal suffix `{}`", word),
                        ))
                    }
                    elem => elem,
                }
            }
            _ => None,
        };

        let bad = |message: String| error_at(text, start, message);

        if is_float {
            let value: f64 = value_text
                .parse()
                .map_err(|_| bad(format!("invalid float literal `{}`", value_text)))?;
            let value = if negate { -value } else { value };
            return match suffix {
                None => Ok(Literal::Float(value)),
                Some(ElemType::F32) => Ok(Literal::Typed(Scalar::F32(value as f32))),
                Some(other) => Err(bad(format!("float literal with integer suffix `{}`", other))),
            };
        }

        let radix = if is_hex { 16 } else { 10 };
        let value = i128::from_str_radix(value_text, radix)
            .map_err(|_| bad(format!("integer literal `{}` out of range", value_text)))?;
        let value = if negate { -value } else { value };
        match suffix {
            None => Ok(Literal::Int(value)),
            Some(ElemType::F32) => Ok(Literal::Typed(Scalar::F32(value as f32))),
            Some(elem) if elem.can_hold(value) => Ok(Literal::Typed(Scalar::from_i128(elem, value))),
            Some(elem) => Err(bad(format!("literal {} does not fit {}", value, elem))),
        }
    }

    // ---- Assembly ----------------------------------------------------------

    /// Calls to names declared as helpers become static calls.
    fn resolve_helper_calls(&mut self) {
        let names: BTreeSet<String> = self.helpers.iter().map(|h| h.name.clone()).collect();
        let mut to_static = |expr: &mut Expr| {
            if let Expr::Call(call) = expr {
                if let Callee::Library(name) = &call.callee {
                    if call.type_arg.is_none() && names.contains(name) {
                        call.callee = Callee::Static(name.clone());
                    }
                }
            }
        };
        for helper in &mut self.helpers {
            for_each_expr_mut(&mut helper.body, &mut to_static);
        }
        for codelet in &mut self.codelets {
            for_each_expr_mut(&mut codelet.body, &mut to_static);
        }
    }

    fn assemble(&self, raw: RawCodelet) -> PResult<KernelSpec> {
        // Helpers reachable from the body, in declaration order.
        let mut reachable: BTreeSet<&str> = BTreeSet::new();
        let mut pending: Vec<&str> = static_callees(&raw.body);
        while let Some(name) = pending.pop() {
            if let Some(helper) = self.helpers.iter().find(|h| h.name == name) {
                if reachable.insert(helper.name.as_str()) {
                    pending.extend(static_callees(&helper.body));
                }
            }
        }
        let helpers: Vec<&HelperFn> = self
            .helpers
            .iter()
            .filter(|h| reachable.contains(h.name.as_str()))
            .collect();

        let mut referenced: BTreeSet<String> = global_references(&raw.body);
        for helper in &helpers {
            referenced.extend(global_references(&helper.body));
        }

        let mut builder = KernelSpec::builder(raw.name);
        for field in raw.fields {
            builder = builder.field(field);
        }
        for name in &referenced {
            if let Some(capture) = self.captures.get(name) {
                builder = builder.capture(name.clone(), capture.clone());
            }
        }
        for helper in helpers {
            builder = builder.helper(helper.clone());
        }

        builder
            .body(raw.body)
            .build()
            .map_err(|e| error_at(self.text, raw.pos, e.to_string()))
    }
}

fn static_callees(body: &[Stmt]) -> Vec<&str> {
    let mut names = Vec::new();
    for_each_expr(body, &mut |expr| {
        if let Expr::Call(Call {
            callee: Callee::Static(name),
            ..
        }) = expr
        {
            names.push(name.as_str());
        }
    });
    names
}

/// Names referenced as globals, including scalar stores to non-fields.
fn global_references(body: &[Stmt]) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for_each_expr(body, &mut |expr| match expr {
        Expr::Global(name)
        | Expr::Index {
            base: ArrayRef::Global(name),
            ..
        } => {
            names.insert(name.clone());
        }
        _ => {}
    });
    collect_store_targets(body, &mut names);
    names
}

fn collect_store_targets(body: &[Stmt], names: &mut BTreeSet<String>) {
    for stmt in body {
        match stmt {
            Stmt::Store { field, .. } => {
                names.insert(field.clone());
            }
            Stmt::If { then, otherwise, .. } => {
                collect_store_targets(then, names);
                collect_store_targets(otherwise, names);
            }
            Stmt::For { body, .. } | Stmt::While { body, .. } | Stmt::Block(body) => {
                collect_store_targets(body, names)
            }
            Stmt::Macro(Macro::Cycles { body, .. }) => collect_store_targets(body, names),
            _ => {}
        }
    }
}

fn binary_operator(rest: &str) -> Option<(BinaryOp, usize)> {
    const TWO: [(&str, BinaryOp); 8] = [
        ("&&", BinaryOp::LogicalAnd),
        ("||", BinaryOp::LogicalOr),
        ("==", BinaryOp::Eq),
        ("!=", BinaryOp::Ne),
        ("<=", BinaryOp::Le),
        (">=", BinaryOp::Ge),
        ("<<", BinaryOp::Shl),
        (">>", BinaryOp::Shr),
    ];
    for (symbol, op) in TWO {
        if rest.starts_with(symbol) {
            return Some((op, 2));
        }
    }
    let op = match rest.chars().next()? {
        '+' => BinaryOp::Add,
        '-' => BinaryOp::Sub,
        '*' => BinaryOp::Mul,
        '/' => BinaryOp::Div,
        '%' => BinaryOp::Rem,
        '&' => BinaryOp::And,
        '|' => BinaryOp::Or,
        '^' => BinaryOp::Xor,
        '<' => BinaryOp::Lt,
        '>' => BinaryOp::Gt,
        _ => return None,
    };
    Some((op, 1))
}

fn error_at(text: &str, pos: usize, message: impl Into<String>) -> ParseError {
    let before = &text[..pos.min(text.len())];
    let line = before.matches('\n').count() + 1;
    let column = before.rfind('\n').map_or(before.len(), |nl| before.len() - nl - 1) + 1;
    ParseError {
        line,
        column,
        message: message.into(),
    }
}
