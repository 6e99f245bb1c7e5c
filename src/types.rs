use crate::catalog::{Type, FLOAT64, VOID};
use crate::parser::Diagnostic;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Types are catalog singletons, referred to by address.
pub type Ty = &'static Type;

/// Whether an expression names an immutable binding, a mutable binding, or a temporary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValueCategory {
    /// `let` bindings and arguments
    Ref,
    /// `var` bindings
    MutRef,
    /// Anything else; results of calls, literals and products thereof
    Transient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BinOp {
    Plus,
    Minus,
    Multiply,
    Divide,
    Power,
    Greater,
    Smaller,
    GreaterEquals,
    SmallerEquals,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Greater | BinOp::Smaller | BinOp::GreaterEquals | BinOp::SmallerEquals
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnaryOp {
    Minus,
    Plus,
}

/// Index of a [Block] in its function's block arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BlockId(pub usize);

/// The function's outermost block, which also holds the arguments.
pub const ROOT: BlockId = BlockId(0);

/// A resolved variable: the declaring block and the declaration's index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VarRef {
    pub block: BlockId,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ExprKind {
    Literal(f64),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Read {
        name: String,
        var: VarRef,
    },
    Write {
        name: String,
        var: VarRef,
        value: Box<Expr>,
    },
    Call {
        callee: String,
        args: Vec<Expr>,
    },
    Return(Option<Box<Expr>>),
    Let {
        name: String,
        var: VarRef,
        value: Box<Expr>,
    },
    /// `elif`s are nested as the false branch of the previous condition.
    If {
        condition: Box<Expr>,
        on_true: Box<Expr>,
        on_false: Option<Box<Expr>>,
    },
    Block(BlockId),
}

/// Invariant violations caught while building expressions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AstErr {
    #[error("Mismatched operand types {lhs} and {rhs}")]
    OperandMismatch { lhs: &'static str, rhs: &'static str },
    #[error("An operand has no value")]
    VoidOperand,
    #[error("Cannot assign to {0}, it was not declared with var")]
    Immutable(String),
    #[error("Cannot assign a {found} to {name}, which is a {expected}")]
    AssignMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("Function {callee} expected {expected} arguments, {found} were supplied")]
    Arity {
        callee: String,
        expected: usize,
        found: usize,
    },
    #[error("Argument {index} of {callee} should be a {expected}, found {found}")]
    ArgumentMismatch {
        callee: String,
        index: usize,
        expected: &'static str,
        found: &'static str,
    },
    #[error("Returning {found} from a function that returns {expected}")]
    ReturnMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("The condition has no value")]
    VoidCondition,
    #[error("Branches of an if disagree: {on_true} and {on_false}")]
    BranchMismatch {
        on_true: &'static str,
        on_false: &'static str,
    },
}

/// An expression with its static type, value category and usefulness, all fixed when built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Expr {
    kind: ExprKind,
    ty: Ty,
    category: ValueCategory,
    /// Side-effect-free expressions cannot stand alone as statements
    useful: bool,
}

impl Expr {
    fn new(kind: ExprKind, ty: Ty, category: ValueCategory, useful: bool) -> Self {
        Expr { kind, ty, category, useful }
    }

    pub fn literal(value: f64) -> Self {
        Expr::new(ExprKind::Literal(value), &FLOAT64, ValueCategory::Transient, false)
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Result<Self, AstErr> {
        if lhs.ty.is_void || rhs.ty.is_void {
            return Err(AstErr::VoidOperand);
        }
        if lhs.ty != rhs.ty {
            return Err(AstErr::OperandMismatch { lhs: lhs.ty.name, rhs: rhs.ty.name });
        }
        let ty = lhs.ty;
        let kind = ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        Ok(Expr::new(kind, ty, ValueCategory::Transient, false))
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Result<Self, AstErr> {
        if operand.ty.is_void {
            return Err(AstErr::VoidOperand);
        }
        let ty = operand.ty;
        let kind = ExprKind::Unary { op, operand: Box::new(operand) };
        Ok(Expr::new(kind, ty, ValueCategory::Transient, false))
    }

    pub fn read(name: String, var: VarRef, decl: &DeclareVar) -> Self {
        let category = if decl.mutable { ValueCategory::MutRef } else { ValueCategory::Ref };
        Expr::new(ExprKind::Read { name, var }, decl.ty, category, false)
    }

    pub fn write(
        name: String,
        var: VarRef,
        decl: &DeclareVar,
        value: Expr,
    ) -> Result<Self, AstErr> {
        if !decl.mutable {
            return Err(AstErr::Immutable(name));
        }
        if value.ty != decl.ty {
            return Err(AstErr::AssignMismatch {
                name,
                expected: decl.ty.name,
                found: value.ty.name,
            });
        }
        let kind = ExprKind::Write { name, var, value: Box::new(value) };
        Ok(Expr::new(kind, &VOID, ValueCategory::Transient, true))
    }

    pub fn call(callee: String, signature: &Signature, args: Vec<Expr>) -> Result<Self, AstErr> {
        if signature.args.len() != args.len() {
            return Err(AstErr::Arity {
                callee,
                expected: signature.args.len(),
                found: args.len(),
            });
        }
        for (index, ((_, expected), arg)) in signature.args.iter().zip(&args).enumerate() {
            if arg.ty != *expected {
                return Err(AstErr::ArgumentMismatch {
                    callee,
                    index,
                    expected: expected.name,
                    found: arg.ty.name,
                });
            }
        }
        let kind = ExprKind::Call { callee, args };
        Ok(Expr::new(kind, signature.ret, ValueCategory::Transient, true))
    }

    pub fn ret(value: Option<Expr>, expected: Ty) -> Result<Self, AstErr> {
        let found = value.as_ref().map_or(&VOID, |v| v.ty);
        if found != expected {
            return Err(AstErr::ReturnMismatch { expected: expected.name, found: found.name });
        }
        let kind = ExprKind::Return(value.map(Box::new));
        Ok(Expr::new(kind, &VOID, ValueCategory::Transient, true))
    }

    /// The value must not be void; the parser checks that before declaring the variable.
    pub fn binding(name: String, var: VarRef, value: Expr) -> Self {
        let kind = ExprKind::Let { name, var, value: Box::new(value) };
        Expr::new(kind, &VOID, ValueCategory::Transient, true)
    }

    pub fn if_else(condition: Expr, on_true: Expr, on_false: Option<Expr>) -> Result<Self, AstErr> {
        if condition.ty.is_void {
            return Err(AstErr::VoidCondition);
        }
        if let Some(on_false) = &on_false {
            if on_false.ty != on_true.ty || on_false.category != on_true.category {
                return Err(AstErr::BranchMismatch {
                    on_true: on_true.ty.name,
                    on_false: on_false.ty.name,
                });
            }
        }
        let (ty, category) = (on_true.ty, on_true.category);
        let kind = ExprKind::If {
            condition: Box::new(condition),
            on_true: Box::new(on_true),
            on_false: on_false.map(Box::new),
        };
        Ok(Expr::new(kind, ty, category, true))
    }

    pub fn block(id: BlockId, ty: Ty) -> Self {
        Expr::new(ExprKind::Block(id), ty, ValueCategory::Transient, true)
    }

    pub fn kind(&self) -> &ExprKind {
        &self.kind
    }

    pub fn ty(&self) -> Ty {
        self.ty
    }

    pub fn category(&self) -> ValueCategory {
        self.category
    }

    pub fn is_useful(&self) -> bool {
        self.useful
    }
}

/// A variable declared by `let`, `var`, or as a function argument.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeclareVar {
    pub name: String,
    pub ty: Ty,
    pub mutable: bool,
    /// Function-local storage slot, assigned in declaration order.
    pub slot: usize,
    pub initialized: bool,
}

/// A lexical scope. Its value is that of its last expression.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Block {
    pub parent: Option<BlockId>,
    pub variables: Vec<DeclareVar>,
    pub expressions: Vec<Expr>,
}

impl Block {
    pub fn new(parent: Option<BlockId>) -> Self {
        Block { parent, variables: vec![], expressions: vec![] }
    }

    pub fn ty(&self) -> Ty {
        self.expressions.last().map_or(&VOID, Expr::ty)
    }
}

/// Find the innermost declaration of `name` visible from `from`.
pub fn resolve(blocks: &[Block], from: BlockId, name: &str) -> Option<VarRef> {
    let mut current = Some(from);
    while let Some(id) = current {
        let block = blocks.get(id.0)?;
        // Later declarations shadow earlier ones
        if let Some(index) = block.variables.iter().rposition(|v| v.name == name) {
            return Some(VarRef { block: id, index });
        }
        current = block.parent;
    }
    None
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signature {
    pub args: Vec<(String, Ty)>,
    pub ret: Ty,
}

impl Default for Signature {
    fn default() -> Self {
        Signature { args: vec![], ret: &VOID }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Function {
    pub signature: Signature,
    pub body: Expr,
    /// Every block of the body; [ROOT] is the outermost.
    pub blocks: Vec<Block>,
    /// Number of storage slots the body's variables need.
    pub slots: usize,
}

impl Function {
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0]
    }

    pub fn declaration(&self, var: VarRef) -> &DeclareVar {
        &self.blocks[var.block.0].variables[var.index]
    }
}

/// A function provided by the host, declared with `use`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Extern {
    pub signature: Signature,
}

/// Everything produced by parsing one source text.
#[derive(Debug, Default, Serialize)]
pub struct Ast {
    pub functions: BTreeMap<String, Function>,
    pub externs: BTreeMap<String, Extern>,
    /// The block currently being populated by the parser.
    #[serde(skip)]
    pub current_block: Option<BlockId>,
    diagnostics: Vec<Diagnostic>,
}

impl Ast {
    pub fn push_diagnostic(&mut self, d: Diagnostic) {
        log::debug!("diagnostic at {}:{}: {}", d.line, d.column, d.message);
        self.diagnostics.push(d);
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics.iter().filter(|d| d.is_error()).count()
    }

    /// All diagnostics rendered one after another.
    pub fn diagnostic_text(&self) -> String {
        self.diagnostics
            .iter()
            .map(|d| format!("{}\n", d))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Is `name` taken by a function or an extern?
    pub fn is_declared(&self, name: &str) -> bool {
        self.functions.contains_key(name) || self.externs.contains_key(name)
    }

    pub fn signature(&self, name: &str) -> Option<&Signature> {
        self.functions
            .get(name)
            .map(|f| &f.signature)
            .or_else(|| self.externs.get(name).map(|e| &e.signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::INT32;

    fn decl(name: &str, mutable: bool) -> DeclareVar {
        DeclareVar { name: name.into(), ty: &FLOAT64, mutable, slot: 0, initialized: true }
    }

    #[test]
    fn binary_operands_must_agree() {
        let int = Expr::read("i".into(), VarRef { block: ROOT, index: 0 }, &DeclareVar {
            ty: &INT32,
            ..decl("i", false)
        });
        assert_eq!(
            Expr::binary(BinOp::Plus, Expr::literal(1.0), int),
            Err(AstErr::OperandMismatch { lhs: "Float64", rhs: "Int32" })
        );
        let sum = Expr::binary(BinOp::Plus, Expr::literal(1.0), Expr::literal(2.0)).unwrap();
        assert_eq!(sum.ty(), &FLOAT64);
        assert!(!sum.is_useful());
    }

    #[test]
    fn categories_follow_mutability() {
        let var = VarRef { block: ROOT, index: 0 };
        assert_eq!(Expr::read("a".into(), var, &decl("a", false)).category(), ValueCategory::Ref);
        assert_eq!(Expr::read("a".into(), var, &decl("a", true)).category(), ValueCategory::MutRef);
        assert_eq!(
            Expr::write("a".into(), var, &decl("a", false), Expr::literal(1.0)),
            Err(AstErr::Immutable("a".into()))
        );
        let write = Expr::write("a".into(), var, &decl("a", true), Expr::literal(1.0)).unwrap();
        assert!(write.is_useful());
        assert!(write.ty().is_void);
    }

    #[test]
    fn if_branches_must_agree_only_when_present() {
        let void_block = Expr::block(BlockId(2), &VOID);
        let num_block = Expr::block(BlockId(1), &FLOAT64);
        assert!(Expr::if_else(Expr::literal(1.0), num_block.clone(), None).is_ok());
        assert_eq!(
            Expr::if_else(Expr::literal(1.0), num_block, Some(void_block)),
            Err(AstErr::BranchMismatch { on_true: "Float64", on_false: "Void" })
        );
    }

    #[test]
    fn resolve_walks_parents_innermost_first() {
        let mut outer = Block::new(None);
        outer.variables.push(decl("x", false));
        outer.variables.push(decl("y", false));
        let mut inner = Block::new(Some(ROOT));
        inner.variables.push(decl("x", true));
        let blocks = vec![outer, inner];

        assert_eq!(resolve(&blocks, BlockId(1), "x"), Some(VarRef { block: BlockId(1), index: 0 }));
        assert_eq!(resolve(&blocks, BlockId(1), "y"), Some(VarRef { block: ROOT, index: 1 }));
        assert_eq!(resolve(&blocks, ROOT, "x"), Some(VarRef { block: ROOT, index: 0 }));
        assert_eq!(resolve(&blocks, BlockId(1), "z"), None);
    }

    #[test]
    fn return_checks_the_declared_type() {
        assert!(Expr::ret(Some(Expr::literal(1.0)), &FLOAT64).is_ok());
        assert!(Expr::ret(None, &VOID).is_ok());
        assert_eq!(
            Expr::ret(None, &FLOAT64),
            Err(AstErr::ReturnMismatch { expected: "Float64", found: "Void" })
        );
    }
}
