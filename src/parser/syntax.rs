use crate::PErr;
use crate::catalog::{self, VOID};
use crate::parser::diagnostic::{Diagnostic, Severity};
use crate::parser::tokens::{Lexer, Token, TokenKind};
use crate::parser::ParseErr;
use crate::types::{
    resolve, Ast, BinOp, Block, BlockId, DeclareVar, Expr, ExprKind, Extern, Function, Signature,
    Ty, UnaryOp, VarRef, ROOT,
};

/// The result of a parser on the token stream.
type ParseRes<O> = Result<O, ParseErr>;

/// Operands nested deeper than this are rejected before they exhaust the native stack.
const MAX_NESTING: usize = 256;

/// A binary operator as seen by precedence climbing.
#[derive(Debug, Clone, Copy)]
enum Infix {
    Arith(BinOp),
    /// `=`, or `op=` carrying the arithmetic it stands for
    Assign(Option<BinOp>),
}

impl Infix {
    fn from_token(kind: &TokenKind) -> Option<Infix> {
        Some(match kind {
            TokenKind::Assign => Infix::Assign(None),
            TokenKind::PlusEquals => Infix::Assign(Some(BinOp::Plus)),
            TokenKind::MinusEquals => Infix::Assign(Some(BinOp::Minus)),
            TokenKind::MultiplyEquals => Infix::Assign(Some(BinOp::Multiply)),
            TokenKind::DivideEquals => Infix::Assign(Some(BinOp::Divide)),
            TokenKind::Greater => Infix::Arith(BinOp::Greater),
            TokenKind::Smaller => Infix::Arith(BinOp::Smaller),
            TokenKind::GreaterEquals => Infix::Arith(BinOp::GreaterEquals),
            TokenKind::SmallerEquals => Infix::Arith(BinOp::SmallerEquals),
            TokenKind::Plus => Infix::Arith(BinOp::Plus),
            TokenKind::Minus => Infix::Arith(BinOp::Minus),
            TokenKind::Multiply => Infix::Arith(BinOp::Multiply),
            TokenKind::Divide => Infix::Arith(BinOp::Divide),
            TokenKind::Power => Infix::Arith(BinOp::Power),
            _ => return None,
        })
    }

    /// Higher binds tighter.
    fn precedence(self) -> u8 {
        match self {
            Infix::Assign(_) => 1,
            Infix::Arith(op) if op.is_comparison() => 2,
            Infix::Arith(BinOp::Plus | BinOp::Minus) => 3,
            Infix::Arith(BinOp::Multiply | BinOp::Divide) => 4,
            Infix::Arith(_) => 5,
        }
    }

    fn is_right_assoc(self) -> bool {
        matches!(self, Infix::Assign(_) | Infix::Arith(BinOp::Power))
    }
}

/// Per-function parsing state.
#[derive(Default)]
struct FnScope {
    name: String,
    signature: Signature,
    blocks: Vec<Block>,
    slots: usize,
}

impl FnScope {
    fn declaration(&self, var: VarRef) -> &DeclareVar {
        &self.blocks[var.block.0].variables[var.index]
    }
}

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    /// The current, not yet consumed, token.
    token: Token,
    /// Open parentheses; newlines are insignificant while this is non-zero.
    paren_depth: usize,
    /// Operands currently being parsed, one per recursive `primary`.
    nesting: usize,
    ast: Ast,
    scope: FnScope,
}

impl<'a> Parser<'a> {
    pub fn new(src: &'a str) -> Self {
        let mut lexer = Lexer::new(src);
        let token = lexer.next_token(true);
        let mut ast = Ast::default();
        for d in lexer.take_diagnostics() {
            ast.push_diagnostic(d);
        }

        Parser {
            lexer,
            token,
            paren_depth: 0,
            nesting: 0,
            ast,
            scope: FnScope::default(),
        }
    }

    /// Top level of a program is a list of function and extern declarations.
    pub fn parse(mut self) -> Ast {
        loop {
            let res = match self.token.kind {
                TokenKind::Func => self.function(),
                TokenKind::Use => self.extern_decl(),
                TokenKind::Newline => {
                    self.bump();
                    Ok(())
                }
                TokenKind::Eof => break,
                _ => {
                    let err = ParseErr::at(
                        &self.token,
                        format!("Invalid token ({}) in a top level statement", self.token.kind),
                    );
                    self.skip_item();
                    Err(err)
                }
            };

            if let Err(e) = res {
                self.report(e);
            }
        }

        log::debug!(
            "parsed {} functions and {} externs with {} errors",
            self.ast.functions.len(),
            self.ast.externs.len(),
            self.ast.error_count()
        );
        self.ast
    }

    fn bump(&mut self) {
        self.token = self.lexer.next_token(self.paren_depth == 0);
        for d in self.lexer.take_diagnostics() {
            self.ast.push_diagnostic(d);
        }
    }

    fn open_paren(&mut self) {
        self.paren_depth += 1;
        self.bump();
    }

    fn close_paren(&mut self) {
        self.paren_depth = self.paren_depth.saturating_sub(1);
        self.bump();
    }

    fn report(&mut self, e: ParseErr) {
        let src = self.lexer.source();
        self.ast
            .push_diagnostic(Diagnostic::new(Severity::Error, e.message, src, e.line, e.column));
        for (severity, note) in e.notes {
            self.ast
                .push_diagnostic(Diagnostic::new(severity, note, src, e.line, e.column));
        }
    }

    /// Discard tokens up to the end of the current statement: a newline or a closing brace at
    /// the same brace depth.
    fn synchronize(&mut self) {
        self.paren_depth = 0;
        let mut depth = 0usize;
        loop {
            match self.token.kind {
                TokenKind::Eof => return,
                TokenKind::Newline | TokenKind::ClosedCurly if depth == 0 => return,
                TokenKind::OpenCurly => depth += 1,
                TokenKind::ClosedCurly => depth -= 1,
                _ => {}
            }
            self.bump();
        }
    }

    /// Discard the rest of a top level declaration, including any brace-delimited body.
    fn skip_item(&mut self) {
        self.paren_depth = 0;
        let mut depth = 0usize;
        loop {
            match self.token.kind {
                TokenKind::Eof => return,
                TokenKind::Newline if depth == 0 => return,
                TokenKind::OpenCurly => depth += 1,
                TokenKind::ClosedCurly => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        self.bump();
                        return;
                    }
                }
                _ => {}
            }
            self.bump();
        }
    }

    fn identifier(&mut self, msg: &str) -> ParseRes<String> {
        match &self.token.kind {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                self.bump();
                Ok(name)
            }
            _ => PErr!(self.token, msg),
        }
    }

    fn type_name(&mut self) -> ParseRes<Ty> {
        let at = self.token.clone();
        let name = self.identifier("Expected an identifier to name a type")?;
        catalog::lookup(&name)
            .ok_or_else(|| ParseErr::at(&at, format!("Identifier {} does not name a type", name)))
    }

    /// `name ( arg : Type , ... ) [-> Type]`, starting at the name.
    fn signature(&mut self) -> ParseRes<(String, Signature)> {
        let name = self.identifier("Expected identifier in function declaration")?;
        if self.token.kind != TokenKind::OpenBracket {
            return PErr!(self.token, "Expected a '(' after the function name");
        }
        self.open_paren();

        let mut args: Vec<(String, Ty)> = vec![];
        if self.token.kind != TokenKind::ClosedBracket {
            loop {
                let at = self.token.clone();
                let arg = self.identifier("Expected an argument name")?;
                if self.token.kind != TokenKind::Colon {
                    return PErr!(self.token, "Expected a ':' after the argument name");
                }
                self.bump();
                let ty = self.type_name()?;
                if args.iter().any(|(a, _)| *a == arg) {
                    return PErr!(at, "Argument {} is declared twice", arg);
                }
                args.push((arg, ty));

                match self.token.kind {
                    TokenKind::Comma => self.bump(),
                    TokenKind::ClosedBracket => break,
                    _ => {
                        return PErr!(self.token, "Expected a comma or a closed bracket after argument")
                    }
                }
            }
        }
        self.close_paren();

        let ret = if self.token.kind == TokenKind::Arrow {
            self.bump();
            self.type_name()?
        } else {
            &VOID
        };

        Ok((name, Signature { args, ret }))
    }

    /// `use name(...) [-> Type]`
    fn extern_decl(&mut self) -> ParseRes<()> {
        let at = self.token.clone();
        self.bump();
        let res = self.signature().and_then(|(name, signature)| {
            if self.ast.is_declared(&name) {
                return PErr!(at, "Cannot extern {}, as it was already declared", name);
            }
            if !matches!(self.token.kind, TokenKind::Newline | TokenKind::Eof) {
                return PErr!(self.token, "Expected a newline or the end of file after extern");
            }
            Ok((name, signature))
        });

        match res {
            Ok((name, signature)) => {
                self.ast.externs.insert(name, Extern { signature });
                Ok(())
            }
            Err(e) => {
                self.skip_item();
                Err(e)
            }
        }
    }

    /// `func name(...) [-> Type] { ... }`
    fn function(&mut self) -> ParseRes<()> {
        let at = self.token.clone();
        self.bump();
        let (name, signature) = match self.function_head(&at) {
            Ok(head) => head,
            Err(e) => {
                self.skip_item();
                return Err(e);
            }
        };

        self.scope = FnScope {
            name: name.clone(),
            signature: signature.clone(),
            ..FnScope::default()
        };
        let root = self.open_block();
        for (arg, ty) in &signature.args {
            self.declare(arg.clone(), *ty, false);
        }
        let body = self.block_body(root);

        let scope = std::mem::take(&mut self.scope);
        self.ast.current_block = None;
        self.ast.functions.insert(
            name,
            Function { signature, body, blocks: scope.blocks, slots: scope.slots },
        );
        Ok(())
    }

    /// Signature and duplicate checks; leaves the current token on the body's `{`.
    fn function_head(&mut self, at: &Token) -> ParseRes<(String, Signature)> {
        let (name, signature) = self.signature()?;
        if self.ast.externs.contains_key(&name) {
            return PErr!(*at, "Cannot create function {}, as it was already externed", name);
        }
        if self.ast.functions.contains_key(&name) {
            return PErr!(*at, "Cannot create function {}, as it was already declared", name);
        }
        while self.token.kind == TokenKind::Newline {
            self.bump();
        }
        if self.token.kind != TokenKind::OpenCurly {
            return PErr!(self.token, "Expected an open curly bracket after function declaration");
        }
        Ok((name, signature))
    }

    fn open_block(&mut self) -> BlockId {
        let id = BlockId(self.scope.blocks.len());
        self.scope.blocks.push(Block::new(self.ast.current_block));
        self.ast.current_block = Some(id);
        id
    }

    fn declare(&mut self, name: String, ty: Ty, mutable: bool) -> VarRef {
        let block = self.ast.current_block.unwrap_or(ROOT);
        let slot = self.scope.slots;
        self.scope.slots += 1;

        let variables = &mut self.scope.blocks[block.0].variables;
        variables.push(DeclareVar { name, ty, mutable, slot, initialized: true });
        VarRef { block, index: variables.len() - 1 }
    }

    /// `{ ... }` as a new scope, starting at the `{`.
    fn block(&mut self) -> ParseRes<Expr> {
        let id = self.open_block();
        Ok(self.block_body(id))
    }

    /// Statements of an already opened block, starting at its `{`. Statement errors are
    /// reported here, so this always produces a block.
    fn block_body(&mut self, id: BlockId) -> Expr {
        // Newlines end statements again inside braces, even within brackets
        let outer_parens = std::mem::replace(&mut self.paren_depth, 0);
        self.bump();

        loop {
            match self.token.kind {
                TokenKind::Newline => {
                    self.bump();
                    continue;
                }
                TokenKind::ClosedCurly => break,
                TokenKind::Eof => {
                    let e = ParseErr::at(&self.token, "Expected a '}' before the end of file");
                    self.report(e);
                    break;
                }
                _ => {}
            }

            let at = self.token.clone();
            let expr = match self.statement() {
                Ok(expr) => expr,
                Err(e) => {
                    self.report(e);
                    self.synchronize();
                    continue;
                }
            };

            if !matches!(
                self.token.kind,
                TokenKind::Newline | TokenKind::ClosedCurly | TokenKind::Eof
            ) {
                let e = ParseErr::at(&self.token, "Expected newline after statement");
                self.report(e);
                self.synchronize();
                continue;
            }

            if !expr.is_useful() {
                let e = ParseErr::at(
                    &at,
                    "An expression with no effects is not allowed as a statement",
                );
                self.report(e);
                continue;
            }
            self.scope.blocks[id.0].expressions.push(expr);
        }

        self.paren_depth = outer_parens;
        if self.token.kind == TokenKind::ClosedCurly {
            self.bump();
        }

        let block = &self.scope.blocks[id.0];
        self.ast.current_block = block.parent;
        Expr::block(id, block.ty())
    }

    fn statement(&mut self) -> ParseRes<Expr> {
        match self.token.kind {
            TokenKind::Let => self.binding(false),
            TokenKind::Var => self.binding(true),
            TokenKind::Return => self.return_stmt(),
            TokenKind::Func => PErr!(self.token, "Closures not implemented"),
            TokenKind::Use => Err(ParseErr::at(&self.token, "The extern keyword is invalid here")
                .with_note(Severity::Note, "To use extern, do it in a top level statement")),
            _ => self.expression(),
        }
    }

    /// `let name [: Type] = expr`, or `var` for a mutable binding.
    fn binding(&mut self, mutable: bool) -> ParseRes<Expr> {
        self.bump();
        let at = self.token.clone();
        let name = self.identifier("Expected identifier after let")?;
        let annotation = if self.token.kind == TokenKind::Colon {
            self.bump();
            Some(self.type_name()?)
        } else {
            None
        };
        if self.token.kind != TokenKind::Assign {
            return PErr!(self.token, "Expected a '=' after the name of the variable");
        }
        self.bump();

        let value = self.expression()?;
        if value.ty().is_void {
            return PErr!(at, "Cannot bind {} to an expression with no value", name);
        }
        if let Some(ty) = annotation {
            if ty != value.ty() {
                return PErr!(
                    at,
                    "{} is declared as {} but given a {}",
                    name,
                    ty.name,
                    value.ty().name
                );
            }
        }

        // Declared after the value, so `let x = x` refers to an outer x
        let var = self.declare(name.clone(), value.ty(), mutable);
        Ok(Expr::binding(name, var, value))
    }

    fn return_stmt(&mut self) -> ParseRes<Expr> {
        let at = self.token.clone();
        self.bump();
        let value = match self.token.kind {
            TokenKind::Newline | TokenKind::ClosedCurly | TokenKind::Eof => None,
            _ => Some(self.expression()?),
        };
        Expr::ret(value, self.scope.signature.ret).map_err(|e| ParseErr::at(&at, e))
    }

    fn expression(&mut self) -> ParseRes<Expr> {
        let lhs = self.primary()?;
        self.binary_rhs(1, lhs)
    }

    /// Precedence climbing: fold operators binding at least as tight as `min_prec` onto `lhs`.
    fn binary_rhs(&mut self, min_prec: u8, mut lhs: Expr) -> ParseRes<Expr> {
        loop {
            let op = match Infix::from_token(&self.token.kind) {
                Some(op) if op.precedence() >= min_prec => op,
                _ => return Ok(lhs),
            };
            let at = self.token.clone();
            self.bump();

            let mut rhs = self.primary()?;
            while let Some(next) = Infix::from_token(&self.token.kind) {
                let (prec, next_prec) = (op.precedence(), next.precedence());
                if next_prec > prec {
                    rhs = self.binary_rhs(prec + 1, rhs)?;
                } else if next_prec == prec && next.is_right_assoc() {
                    rhs = self.binary_rhs(prec, rhs)?;
                } else {
                    break;
                }
            }

            lhs = self.combine(op, lhs, rhs, &at)?;
        }
    }

    fn combine(&self, op: Infix, lhs: Expr, rhs: Expr, at: &Token) -> ParseRes<Expr> {
        let res = match op {
            Infix::Arith(op) => Expr::binary(op, lhs, rhs),
            Infix::Assign(compound) => {
                let (name, var) = match lhs.kind() {
                    ExprKind::Read { name, var } => (name.clone(), *var),
                    _ => return PErr!(*at, "Only variables can be assigned to"),
                };
                let decl = self.scope.declaration(var);
                match compound {
                    Some(op) => Expr::binary(op, lhs, rhs)
                        .and_then(|value| Expr::write(name, var, decl, value)),
                    None => Expr::write(name, var, decl, rhs),
                }
            }
        };
        res.map_err(|e| ParseErr::at(at, e))
    }

    fn primary(&mut self) -> ParseRes<Expr> {
        if self.nesting >= MAX_NESTING {
            return PErr!(self.token, "Expression nested too deeply");
        }
        self.nesting += 1;
        let res = self.operand();
        self.nesting -= 1;
        res
    }

    /// Unary operators, brackets, literals, variables, calls, blocks and ifs.
    fn operand(&mut self) -> ParseRes<Expr> {
        let at = self.token.clone();
        match &at.kind {
            TokenKind::Minus | TokenKind::Plus => {
                let op = if at.kind == TokenKind::Minus { UnaryOp::Minus } else { UnaryOp::Plus };
                self.bump();
                let operand = self.primary()?;
                Expr::unary(op, operand).map_err(|e| ParseErr::at(&at, e))
            }
            TokenKind::OpenBracket => {
                self.open_paren();
                if self.token.kind == TokenKind::ClosedBracket {
                    return PErr!(at, "Empty brackets in expression");
                }
                let expr = self.expression()?;
                if self.token.kind != TokenKind::ClosedBracket {
                    return PErr!(
                        self.token,
                        "Expected a closing bracket after bracketed expression"
                    );
                }
                self.close_paren();
                Ok(expr)
            }
            TokenKind::OpenCurly => self.block(),
            TokenKind::Number(n) => {
                self.bump();
                Ok(Expr::literal(*n))
            }
            TokenKind::Identifier(name) => {
                self.bump();
                if self.token.kind == TokenKind::OpenBracket {
                    self.call(name.clone(), &at)
                } else {
                    self.read(name.clone(), &at)
                }
            }
            TokenKind::If => self.if_chain(),
            kind => PErr!(at, "Expected an expression, found {}", kind),
        }
    }

    fn read(&mut self, name: String, at: &Token) -> ParseRes<Expr> {
        let from = self.ast.current_block.unwrap_or(ROOT);
        match resolve(&self.scope.blocks, from, &name) {
            Some(var) => {
                let decl = self.scope.declaration(var);
                Ok(Expr::read(name, var, decl))
            }
            None => PErr!(*at, "Variable {} is not defined", name),
        }
    }

    fn call(&mut self, name: String, at: &Token) -> ParseRes<Expr> {
        self.open_paren();
        let mut args = vec![];
        if self.token.kind != TokenKind::ClosedBracket {
            loop {
                args.push(self.expression()?);
                match self.token.kind {
                    TokenKind::Comma => self.bump(),
                    TokenKind::ClosedBracket => break,
                    _ => {
                        return PErr!(
                            self.token,
                            "Expected a comma or a closed bracket in the call to {}",
                            name
                        )
                    }
                }
            }
        }
        self.close_paren();

        // The function being parsed can call itself
        let signature = self.ast.signature(&name).or_else(|| {
            (self.scope.name == name).then(|| &self.scope.signature)
        });
        match signature {
            Some(signature) => {
                Expr::call(name, signature, args).map_err(|e| ParseErr::at(at, e))
            }
            None => PErr!(*at, "Function {} was called but is not defined", name),
        }
    }

    /// One `if`/`elif` condition and its block, starting at the keyword.
    fn if_arm(&mut self) -> ParseRes<(Token, Expr, Expr)> {
        let at = self.token.clone();
        self.bump();
        let condition = self.expression()?;
        if self.token.kind != TokenKind::OpenCurly {
            return PErr!(self.token, "Expected a block '{{' after the condition of an {}", at.kind);
        }
        let body = self.block()?;
        Ok((at, condition, body))
    }

    /// `if c { } [elif c { }]* [else { }]`; each `elif` becomes the false branch of the
    /// condition before it.
    fn if_chain(&mut self) -> ParseRes<Expr> {
        let (at, condition, on_true) = self.if_arm()?;
        let mut elifs = vec![];
        while self.token.kind == TokenKind::Elif {
            elifs.push(self.if_arm()?);
        }

        let mut on_false = if self.token.kind == TokenKind::Else {
            self.bump();
            if self.token.kind != TokenKind::OpenCurly {
                return PErr!(self.token, "Expected a block '{' after else");
            }
            Some(self.block()?)
        } else {
            None
        };

        for (at, condition, on_true) in elifs.into_iter().rev() {
            let nested = Expr::if_else(condition, on_true, on_false)
                .map_err(|e| ParseErr::at(&at, e))?;
            on_false = Some(nested);
        }
        Expr::if_else(condition, on_true, on_false).map_err(|e| ParseErr::at(&at, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FLOAT64;
    use crate::parser::{parse, parse_ast};
    use crate::types::ValueCategory;
    use pretty_assertions::assert_eq;

    /// Parse a single expression inside a throwaway function with the given variables.
    fn expr(src: &str) -> Expr {
        let program = format!(
            "use f(x: Float64) -> Float64\nfunc t(a: Float64, b: Float64, c: Float64) -> Float64 {{\n return {}\n}}",
            src
        );
        let ast = parse(&program).expect("expression should parse");
        let f = &ast.functions["t"];
        match f.block(ROOT).expressions[0].kind() {
            ExprKind::Return(Some(value)) => (**value).clone(),
            other => panic!("expected a return, got {:?}", other),
        }
    }

    fn lit(n: f64) -> Expr {
        Expr::literal(n)
    }

    fn bin(op: BinOp, l: Expr, r: Expr) -> Expr {
        Expr::binary(op, l, r).unwrap()
    }

    fn messages(src: &str) -> Vec<String> {
        parse_ast(src).diagnostics().iter().map(|d| d.message.clone()).collect()
    }

    #[test]
    fn return_of_a_sum() {
        let ast = parse("func f() -> Float64 { return 1+2 }").unwrap();
        let f = &ast.functions["f"];
        assert_eq!(f.signature.ret, &FLOAT64);
        assert!(matches!(f.body.kind(), ExprKind::Block(ROOT)));
        let body = &f.block(ROOT).expressions;
        assert_eq!(body.len(), 1);
        assert_eq!(
            body[0],
            Expr::ret(Some(bin(BinOp::Plus, lit(1.0), lit(2.0))), &FLOAT64).unwrap()
        );
    }

    #[test]
    fn useless_statement_is_rejected_once() {
        let ast = parse_ast("func f() -> Float64 {\n    42\n    return 1\n}");
        assert_eq!(ast.error_count(), 1);
        assert_eq!(ast.diagnostics()[0].line, 2);
        assert_eq!(ast.diagnostics()[0].column, 5);
        let body = &ast.functions["f"].block(ROOT).expressions;
        assert_eq!(body.len(), 1);
        assert!(matches!(body[0].kind(), ExprKind::Return(_)));
    }

    #[test]
    fn blocks_take_the_value_of_their_last_statement() {
        let src = "use getDouble() -> Float64\nfunc f() -> Float64 {\n    let x = 2\n    { getDouble() }\n}";
        let ast = parse(src).unwrap();
        let f = &ast.functions["f"];
        assert_eq!(f.block(ROOT).expressions.len(), 2);
        assert_eq!(f.body.ty(), &FLOAT64);
        assert_eq!(f.block(BlockId(1)).ty(), &FLOAT64);
    }

    #[test]
    fn effect_free_block_statements_are_rejected() {
        let ast = parse_ast("func f() {\n    { 42 }\n}");
        assert_eq!(ast.error_count(), 1);
        assert!(ast.functions["f"].block(BlockId(1)).expressions.is_empty());
    }

    #[test]
    fn multiplication_binds_tighter() {
        assert_eq!(
            expr("2+3*4"),
            bin(BinOp::Plus, lit(2.0), bin(BinOp::Multiply, lit(3.0), lit(4.0)))
        );
        assert_eq!(
            expr("2*3+4"),
            bin(BinOp::Plus, bin(BinOp::Multiply, lit(2.0), lit(3.0)), lit(4.0))
        );
    }

    #[test]
    fn subtraction_is_left_associative() {
        assert_eq!(
            expr("1-2-3"),
            bin(BinOp::Minus, bin(BinOp::Minus, lit(1.0), lit(2.0)), lit(3.0))
        );
    }

    #[test]
    fn power_is_right_associative() {
        assert_eq!(
            expr("2**3**2"),
            bin(BinOp::Power, lit(2.0), bin(BinOp::Power, lit(3.0), lit(2.0)))
        );
    }

    #[test]
    fn comparisons_bind_looser_than_arithmetic() {
        assert_eq!(
            expr("1+2 > 3*4"),
            bin(
                BinOp::Greater,
                bin(BinOp::Plus, lit(1.0), lit(2.0)),
                bin(BinOp::Multiply, lit(3.0), lit(4.0))
            )
        );
    }

    #[test]
    fn brackets_and_unary_minus() {
        assert_eq!(
            expr("-(1+2)*3"),
            bin(
                BinOp::Multiply,
                Expr::unary(UnaryOp::Minus, bin(BinOp::Plus, lit(1.0), lit(2.0))).unwrap(),
                lit(3.0)
            )
        );
    }

    #[test]
    fn newlines_inside_brackets_are_ignored() {
        assert_eq!(expr("(1 +\n 2)"), bin(BinOp::Plus, lit(1.0), lit(2.0)));
    }

    #[test]
    fn variables_resolve_to_arguments() {
        let e = expr("a * b");
        match e.kind() {
            ExprKind::Binary { lhs, rhs, .. } => {
                let first = VarRef { block: ROOT, index: 0 };
                let second = VarRef { block: ROOT, index: 1 };
                assert!(matches!(lhs.kind(), ExprKind::Read { var, .. } if *var == first));
                assert!(matches!(rhs.kind(), ExprKind::Read { var, .. } if *var == second));
                assert_eq!(lhs.category(), ValueCategory::Ref);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn elif_nests_in_the_false_branch() {
        let e = expr("if a { f(1) } elif b { f(2) } else { f(3) }");
        let ExprKind::If { on_false: Some(elif), .. } = e.kind() else { panic!("not an if") };
        let ExprKind::If { on_false: Some(last), .. } = elif.kind() else { panic!("elif missing") };
        assert!(matches!(last.kind(), ExprKind::Block(_)));
        assert_eq!(e.ty(), &FLOAT64);
    }

    #[test]
    fn missing_else_is_allowed() {
        let e = expr("if a { f(1) }");
        assert!(matches!(e.kind(), ExprKind::If { on_false: None, .. }));
    }

    #[test]
    fn mismatched_branches_are_reported() {
        let msgs = messages("use g() -> Float64\nfunc f() {\n var x = 1\n if x { x = 2 } else { g() }\n}");
        assert_eq!(msgs, vec!["Branches of an if disagree: Void and Float64".to_string()]);
    }

    #[test]
    fn scopes_shadow_and_end() {
        let src = "func f() -> Float64 {\n let x = 1\n if x {\n  let x = 2\n  return x\n }\n return y\n}";
        let msgs = messages(src);
        assert_eq!(msgs, vec!["Variable y is not defined".to_string()]);

        let ast = parse_ast(src);
        let f = &ast.functions["f"];
        assert_eq!(f.slots, 2);
        assert_eq!(f.blocks.len(), 2);
        assert_eq!(f.blocks[1].parent, Some(ROOT));
    }

    #[test]
    fn let_bindings_are_immutable() {
        let msgs = messages("func f() {\n let x = 1\n x = 2\n var y = 1\n y += 2\n}");
        assert_eq!(msgs, vec!["Cannot assign to x, it was not declared with var".to_string()]);
    }

    #[test]
    fn calls_check_arity_and_resolve_externs() {
        let ok = parse("use printDouble(x: Float64) -> Float64\nfunc main() -> Float64 {\n printDouble(1)\n return 0\n}");
        assert!(ok.is_ok(), "{:?}", ok.err());

        let msgs = messages("use printDouble(x: Float64) -> Float64\nfunc main() {\n printDouble(1, 2)\n nope()\n}");
        assert_eq!(
            msgs,
            vec![
                "Function printDouble expected 1 arguments, 2 were supplied".to_string(),
                "Function nope was called but is not defined".to_string(),
            ]
        );
    }

    #[test]
    fn functions_may_recurse() {
        let src = "func fact(n: Float64) -> Float64 {\n if n < 2 { return 1 }\n return n * fact(n - 1)\n}";
        assert!(parse(src).is_ok());
    }

    #[test]
    fn duplicate_declarations_are_rejected() {
        let msgs = messages("use f()\nfunc f() {\n}\nfunc g() {\n}\nfunc g() {\n}");
        assert_eq!(
            msgs,
            vec![
                "Cannot create function f, as it was already externed".to_string(),
                "Cannot create function g, as it was already declared".to_string(),
            ]
        );

        assert_eq!(
            messages("func f() {\n}\nuse f()\nuse g()\nuse g()"),
            vec![
                "Cannot extern f, as it was already declared".to_string(),
                "Cannot extern g, as it was already declared".to_string(),
            ]
        );
    }

    #[test]
    fn deep_nesting_is_an_error_not_a_crash() {
        let depth = 10_000;
        let src = format!(
            "func main() -> Float64 {{\n return {}1{}\n}}",
            "(".repeat(depth),
            ")".repeat(depth)
        );
        let ast = parse_ast(&src);
        assert_eq!(ast.error_count(), 1);
        assert_eq!(ast.diagnostics()[0].message, "Expression nested too deeply");

        let src = format!("func main() -> Float64 {{\n return {}1\n}}", "-".repeat(depth));
        assert_eq!(parse_ast(&src).error_count(), 1);

        let src = format!(
            "func main() -> Float64 {{\n return {}1{}\n}}",
            "(".repeat(100),
            ")".repeat(100)
        );
        assert!(parse(&src).is_ok());
    }

    #[test]
    fn errors_resynchronize_at_the_next_statement() {
        let src = "func f() -> Float64 {\n let = 3\n let y = (1 +\n return y\n}\n3\nfunc g() {\n use h()\n}";
        let ast = parse_ast(src);
        let lines: Vec<(usize, &str)> = ast
            .diagnostics()
            .iter()
            .map(|d| (d.line, d.message.as_str()))
            .collect();
        assert_eq!(lines[0], (2, "Expected identifier after let"));
        assert!(ast.functions.contains_key("g"));
        assert!(lines.contains(&(8, "The extern keyword is invalid here")));
        assert!(lines.contains(&(8, "To use extern, do it in a top level statement")));
        assert!(lines.iter().any(|(_, m)| m.starts_with("Invalid token (number 3)")));
    }

    #[test]
    fn unknown_types_are_reported() {
        assert_eq!(
            messages("func f(x: Real) {\n}"),
            vec!["Identifier Real does not name a type".to_string()]
        );
    }

    #[test]
    fn annotated_bindings_are_checked() {
        assert_eq!(
            messages("func f() {\n let x: Int32 = 1\n}"),
            vec!["x is declared as Int32 but given a Float64".to_string()]
        );
    }
}
