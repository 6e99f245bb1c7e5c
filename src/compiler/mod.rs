/// x86-64 instruction encoding.
pub mod encoder;
/// The LIFO register stack expressions are evaluated on.
pub mod regalloc;

use crate::catalog::FLOAT64;
use crate::runtime::{self, Runtime};
use crate::types::{Ast, BinOp, Expr, ExprKind, Function, Signature, UnaryOp, VarRef, ROOT};
use encoder::{Assembler, CmpPredicate, EncodeErr, Gpr, Mem, SseOp};
use regalloc::{Register, RegisterBank};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use thiserror::Error;

/// Arguments passed in registers; there is no stack passing.
pub const MAX_ARGS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodegenErr {
    #[error("Cannot generate code for a program with {0} errors")]
    HasDiagnostics(usize),
    #[error("Expression too deep, all registers are in use")]
    RegistersExhausted,
    #[error(transparent)]
    Encode(#[from] EncodeErr),
    #[error("{what} has type {ty}, only Float64 is supported")]
    UnsupportedType { what: String, ty: &'static str },
    #[error("{callee} takes {count} arguments, at most {} are supported", MAX_ARGS)]
    TooManyArguments { callee: String, count: usize },
    #[error("No intrinsic named {0} to satisfy its use declaration")]
    UnknownExtern(String),
    #[error("{name} is declared with {found} arguments, the intrinsic takes {expected}")]
    ExternArity {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("Internal compiler error: {0}")]
    Internal(String),
}

/// Page protection a section ends up with once loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Rights {
    ReadOnly,
    ReadWrite,
    Executable,
}

pub type SectionId = usize;

/// Bytes destined for memory with the given rights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub rights: Rights,
    pub data: Vec<u8>,
    /// Offset within its rights class, set by the loader.
    pub offset: Option<usize>,
}

impl Section {
    pub fn new(rights: Rights, data: Vec<u8>) -> Self {
        Section { rights, data, offset: None }
    }
}

/// An 8-byte slot at (pointer section, offset) that must hold the absolute address of
/// (pointee section, offset) once everything is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub pointer_section: SectionId,
    pub pointer_offset: usize,
    pub pointee_section: SectionId,
    pub pointee_offset: usize,
}

/// Generated code, ready for the loader. Compiled code holds the address of the [Runtime]
/// it was generated against, which stays mutably borrowed for as long as this exists.
#[derive(Debug)]
pub struct Program<'rt> {
    pub sections: Vec<Section>,
    pub links: Vec<Link>,
    /// Entry point of every function.
    pub functions: BTreeMap<String, (SectionId, usize)>,
    runtime: PhantomData<&'rt mut ()>,
}

impl<'rt> Program<'rt> {
    pub fn entry(&self, name: &str) -> Option<(SectionId, usize)> {
        self.functions.get(name).copied()
    }
}

/// Lowering of one node onto the function being generated. The value, if any, is left in the
/// returned register, which is the most recently acquired one.
pub trait Compile {
    fn compile_onto(&self, gen: &mut FunctionGen) -> Result<Option<Register>, CodegenErr>;
}

/// Program-wide state shared by every function: links, the literal pool and call targets.
struct Linker {
    links: Vec<Link>,
    pool: Vec<u8>,
    pool_section: SectionId,
    literals: HashMap<u64, usize>,
    function_sections: BTreeMap<String, SectionId>,
    context: u64,
}

impl Linker {
    /// Offset of `value` in the pool, adding it if new.
    fn literal(&mut self, value: f64) -> usize {
        let pool = &mut self.pool;
        *self.literals.entry(value.to_bits()).or_insert_with(|| {
            let at = pool.len();
            pool.extend_from_slice(&value.to_le_bytes());
            at
        })
    }
}

/// Where a call goes.
enum Target {
    /// A function of this program, linked by section.
    Local(SectionId),
    /// A host function; `context` says whether it takes the runtime pointer.
    Host { address: usize, context: bool },
}

pub struct FunctionGen<'g> {
    asm: Assembler,
    regs: RegisterBank,
    function: &'g Function,
    section: SectionId,
    linker: &'g mut Linker,
}

fn slot(index: usize) -> Result<Mem, CodegenErr> {
    i32::try_from(8 * (index + 1))
        .map(|off| Mem::new(Gpr::Rbp, -off))
        .map_err(|_| CodegenErr::Internal(format!("stack slot {} out of range", index)))
}

fn round16(bytes: usize) -> usize {
    (bytes + 15) & !15
}

impl<'g> FunctionGen<'g> {
    fn new(function: &'g Function, section: SectionId, linker: &'g mut Linker) -> Self {
        FunctionGen {
            asm: Assembler::new(),
            regs: RegisterBank::new(),
            function,
            section,
            linker,
        }
    }

    fn generate(mut self) -> Result<Vec<u8>, CodegenErr> {
        let f = self.function;
        self.asm.push(Gpr::Rbp)?;
        self.asm.mov(Gpr::Rbp, Gpr::Rsp)?;
        let frame = round16(8 * f.slots);
        if frame > 0 {
            self.asm.reserve_stack(frame)?;
        }

        for (i, _) in f.signature.args.iter().enumerate() {
            let decl = f.declaration(VarRef { block: ROOT, index: i });
            let reg = Register::argument(i)
                .ok_or_else(|| CodegenErr::Internal(format!("argument {} has no register", i)))?;
            self.asm.movsd_store(slot(decl.slot)?, reg)?;
        }

        // Falling off the end returns the body's value, or 0
        let value = f.body.compile_onto(&mut self)?;
        self.return_value(value)?;
        self.epilogue()?;

        if !self.regs.live().is_empty() {
            return Err(CodegenErr::Internal(format!(
                "{} registers still held at the end of the function",
                self.regs.live().len()
            )));
        }
        Ok(self.asm.finish())
    }

    fn return_value(&mut self, value: Option<Register>) -> Result<(), CodegenErr> {
        match value {
            Some(reg) => {
                if reg != Register::Xmm0 {
                    self.asm.sse(SseOp::MovSd, Register::Xmm0, reg)?;
                }
                self.regs.release(reg)
            }
            None => Ok(self.asm.sse(SseOp::XorPd, Register::Xmm0, Register::Xmm0)?),
        }
    }

    fn epilogue(&mut self) -> Result<(), CodegenErr> {
        self.asm.mov(Gpr::Rsp, Gpr::Rbp)?;
        self.asm.pop(Gpr::Rbp)?;
        Ok(self.asm.ret()?)
    }

    fn value(&mut self, expr: &Expr) -> Result<Register, CodegenErr> {
        expr.compile_onto(self)?
            .ok_or_else(|| CodegenErr::Internal("expression produced no value".into()))
    }

    /// Load a pool constant into a fresh register.
    fn constant(&mut self, value: f64) -> Result<Register, CodegenErr> {
        let offset = self.linker.literal(value);
        let reg = self.regs.acquire()?;
        let imm = self.asm.mov_imm64(Gpr::Rax, 0)?;
        self.linker.links.push(Link {
            pointer_section: self.section,
            pointer_offset: imm,
            pointee_section: self.linker.pool_section,
            pointee_offset: offset,
        });
        self.asm.sse_load(SseOp::MovSd, reg, Mem::new(Gpr::Rax, 0))?;
        Ok(reg)
    }

    fn store(&mut self, var: VarRef, value: &Expr) -> Result<(), CodegenErr> {
        let reg = self.value(value)?;
        let slot = slot(self.function.declaration(var).slot)?;
        self.asm.movsd_store(slot, reg)?;
        self.regs.release(reg)
    }

    fn arithmetic(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<Register, CodegenErr> {
        if op == BinOp::Power {
            let power = Target::Host {
                address: runtime::power_helper(),
                context: false,
            };
            let ret = self.call(power, &[lhs, rhs], true)?;
            return ret.ok_or_else(|| CodegenErr::Internal("power produced no value".into()));
        }

        let l = self.value(lhs)?;
        let r = self.value(rhs)?;
        let sse = match op {
            BinOp::Plus => SseOp::AddSd,
            BinOp::Minus => SseOp::SubSd,
            BinOp::Multiply => SseOp::MulSd,
            BinOp::Divide => SseOp::DivSd,
            _ => return self.comparison(op, l, r),
        };
        self.asm.sse(sse, l, r)?;
        self.regs.release(r)?;
        Ok(l)
    }

    /// 1.0 when `l op r` holds, else 0.0, left in `l`.
    fn comparison(&mut self, op: BinOp, l: Register, r: Register) -> Result<Register, CodegenErr> {
        // cmpsd only has less-than forms; greater swaps the operands
        match op {
            BinOp::Smaller => self.asm.cmpsd(l, r, CmpPredicate::Lt)?,
            BinOp::SmallerEquals => self.asm.cmpsd(l, r, CmpPredicate::Le)?,
            BinOp::Greater | BinOp::GreaterEquals => {
                let pred = if op == BinOp::Greater { CmpPredicate::Lt } else { CmpPredicate::Le };
                self.asm.cmpsd(r, l, pred)?;
                self.asm.sse(SseOp::MovApd, l, r)?;
            }
            _ => return Err(CodegenErr::Internal(format!("{:?} is not a comparison", op))),
        }
        self.regs.release(r)?;

        let one = self.constant(1.0)?;
        self.asm.sse(SseOp::AndPd, l, one)?;
        self.regs.release(one)?;
        Ok(l)
    }

    /// Call `target` with `args`, keeping every live register intact around it.
    fn call(
        &mut self,
        target: Target,
        args: &[&Expr],
        returns: bool,
    ) -> Result<Option<Register>, CodegenErr> {
        let before = self.regs.live().len();
        let mut regs = vec![];
        for arg in args {
            regs.push(self.value(arg)?);
        }

        // Spill everything, then load arguments from the spill area so no register is
        // overwritten before it has been read
        let live = self.regs.live();
        let area = round16(8 * live.len());
        if area > 0 {
            self.asm.reserve_stack(area)?;
        }
        for (i, &reg) in live.iter().enumerate() {
            self.asm.movsd_store(Mem::new(Gpr::Rsp, 8 * i as i32), reg)?;
        }
        for i in 0..regs.len() {
            let dst = Register::argument(i)
                .ok_or_else(|| CodegenErr::Internal(format!("argument {} has no register", i)))?;
            self.asm.sse_load(SseOp::MovSd, dst, Mem::new(Gpr::Rsp, 8 * (before + i) as i32))?;
        }

        match target {
            Target::Local(section) => {
                let imm = self.asm.mov_imm64(Gpr::Rax, 0)?;
                self.linker.links.push(Link {
                    pointer_section: self.section,
                    pointer_offset: imm,
                    pointee_section: section,
                    pointee_offset: 0,
                });
            }
            Target::Host { address, context } => {
                if context {
                    self.asm.mov_imm64(Gpr::Rdi, self.linker.context)?;
                }
                self.asm.mov_imm64(Gpr::Rax, address as u64)?;
            }
        }
        self.asm.call(Gpr::Rax)?;

        for reg in regs.into_iter().rev() {
            self.regs.release(reg)?;
        }
        let result = if returns {
            let dst = self.regs.acquire()?;
            if dst != Register::Xmm0 {
                self.asm.sse(SseOp::MovSd, dst, Register::Xmm0)?;
            }
            Some(dst)
        } else {
            None
        };

        let saved = &self.regs.live()[..before];
        for (i, &reg) in saved.iter().enumerate() {
            self.asm.sse_load(SseOp::MovSd, reg, Mem::new(Gpr::Rsp, 8 * i as i32))?;
        }
        if area > 0 {
            self.asm.free_stack(area)?;
        }
        Ok(result)
    }

    fn target(&self, callee: &str) -> Result<Target, CodegenErr> {
        if let Some(&section) = self.linker.function_sections.get(callee) {
            return Ok(Target::Local(section));
        }
        // Externs were matched against the intrinsic table before generation
        let intrinsic = runtime::intrinsic(callee)
            .ok_or_else(|| CodegenErr::UnknownExtern(callee.to_string()))?;
        Ok(Target::Host { address: intrinsic.address, context: true })
    }

    fn if_else(
        &mut self,
        condition: &Expr,
        on_true: &Expr,
        on_false: Option<&Expr>,
        has_value: bool,
    ) -> Result<Option<Register>, CodegenErr> {
        let c = self.value(condition)?;
        let zero = self.regs.acquire()?;
        self.asm.sse(SseOp::XorPd, zero, zero)?;
        // Zero and NaN both count as false
        self.asm.sse(SseOp::UComISd, c, zero)?;
        self.regs.release(zero)?;
        self.regs.release(c)?;
        let to_false = self.asm.jz()?;

        let t = on_true.compile_onto(self)?;
        if let Some(t) = t {
            self.regs.release(t)?;
        }
        let to_end = self.asm.jmp()?;
        let false_start = self.asm.position();
        self.asm.patch(to_false, false_start)?;

        let f = match on_false {
            Some(e) => e.compile_onto(self)?,
            None if has_value => {
                let reg = self.regs.acquire()?;
                self.asm.sse(SseOp::XorPd, reg, reg)?;
                Some(reg)
            }
            None => None,
        };
        let end = self.asm.position();
        self.asm.patch(to_end, end)?;

        match (has_value, t, f) {
            (false, _, Some(f)) => {
                self.regs.release(f)?;
                Ok(None)
            }
            (false, _, None) => Ok(None),
            (true, Some(t), Some(f)) if t == f => Ok(Some(f)),
            _ => Err(CodegenErr::Internal(
                "branches of an if left values in different places".into(),
            )),
        }
    }
}

impl Compile for Expr {
    fn compile_onto(&self, gen: &mut FunctionGen) -> Result<Option<Register>, CodegenErr> {
        let has_value = !self.ty().is_void;
        match self.kind() {
            ExprKind::Literal(v) => gen.constant(*v).map(Some),
            ExprKind::Read { var, .. } => {
                let reg = gen.regs.acquire()?;
                let slot = slot(gen.function.declaration(*var).slot)?;
                gen.asm.sse_load(SseOp::MovSd, reg, slot)?;
                Ok(Some(reg))
            }
            ExprKind::Write { var, value, .. } | ExprKind::Let { var, value, .. } => {
                gen.store(*var, value)?;
                Ok(None)
            }
            ExprKind::Binary { op, lhs, rhs } => gen.arithmetic(*op, lhs, rhs).map(Some),
            ExprKind::Unary { op: UnaryOp::Plus, operand } => operand.compile_onto(gen),
            ExprKind::Unary { op: UnaryOp::Minus, operand } => {
                let v = gen.value(operand)?;
                let sign = gen.constant(-0.0)?;
                gen.asm.sse(SseOp::XorPd, v, sign)?;
                gen.regs.release(sign)?;
                Ok(Some(v))
            }
            ExprKind::Call { callee, args } => {
                let target = gen.target(callee)?;
                let args: Vec<&Expr> = args.iter().collect();
                gen.call(target, &args, has_value)
            }
            ExprKind::Return(value) => {
                let reg = match value {
                    Some(v) => Some(gen.value(v)?),
                    None => None,
                };
                gen.return_value(reg)?;
                gen.epilogue()?;
                Ok(None)
            }
            ExprKind::If { condition, on_true, on_false } => {
                gen.if_else(condition, on_true, on_false.as_deref(), has_value)
            }
            ExprKind::Block(id) => {
                let function = gen.function;
                let exprs = &function.block(*id).expressions;
                let mut last = None;
                for (i, e) in exprs.iter().enumerate() {
                    let reg = e.compile_onto(gen)?;
                    match reg {
                        Some(reg) if i + 1 < exprs.len() || !has_value => gen.regs.release(reg)?,
                        reg => last = reg,
                    }
                }
                Ok(last)
            }
        }
    }
}

fn check_signature(name: &str, signature: &Signature) -> Result<(), CodegenErr> {
    if signature.args.len() > MAX_ARGS {
        return Err(CodegenErr::TooManyArguments {
            callee: name.to_string(),
            count: signature.args.len(),
        });
    }
    for (arg, ty) in &signature.args {
        if *ty != &FLOAT64 {
            return Err(CodegenErr::UnsupportedType {
                what: format!("Argument {} of {}", arg, name),
                ty: ty.name,
            });
        }
    }
    if !signature.ret.is_void && signature.ret != &FLOAT64 {
        return Err(CodegenErr::UnsupportedType {
            what: format!("The return value of {}", name),
            ty: signature.ret.name,
        });
    }
    Ok(())
}

fn check_function(name: &str, f: &Function) -> Result<(), CodegenErr> {
    check_signature(name, &f.signature)?;
    for var in f.blocks.iter().flat_map(|b| &b.variables) {
        if var.ty != &FLOAT64 {
            return Err(CodegenErr::UnsupportedType {
                what: format!("Variable {} in {}", var.name, name),
                ty: var.ty.name,
            });
        }
    }
    Ok(())
}

/// Lower every function of `ast` to machine code. Each function gets an executable section
/// and literals share one read-only pool after them. Intrinsic calls are bound to `runtime`.
pub fn generate<'r>(ast: &Ast, runtime: &'r mut Runtime<'_>) -> Result<Program<'r>, CodegenErr> {
    if ast.error_count() > 0 {
        return Err(CodegenErr::HasDiagnostics(ast.error_count()));
    }
    for (name, ext) in &ast.externs {
        check_signature(name, &ext.signature)?;
        let intrinsic =
            runtime::intrinsic(name).ok_or_else(|| CodegenErr::UnknownExtern(name.clone()))?;
        if intrinsic.arity != ext.signature.args.len() {
            return Err(CodegenErr::ExternArity {
                name: name.clone(),
                expected: intrinsic.arity,
                found: ext.signature.args.len(),
            });
        }
    }

    let function_sections: BTreeMap<String, SectionId> = ast
        .functions
        .keys()
        .enumerate()
        .map(|(i, name)| (name.clone(), i))
        .collect();
    let mut linker = Linker {
        links: vec![],
        pool: vec![],
        pool_section: ast.functions.len(),
        literals: HashMap::new(),
        function_sections,
        context: runtime.as_context() as u64,
    };

    let mut sections = vec![];
    for (i, (name, f)) in ast.functions.iter().enumerate() {
        check_function(name, f)?;
        let code = FunctionGen::new(f, i, &mut linker).generate()?;
        log::debug!("generated {} bytes for {}", code.len(), name);
        sections.push(Section::new(Rights::Executable, code));
    }
    if !linker.pool.is_empty() {
        log::debug!("literal pool of {} bytes", linker.pool.len());
        sections.push(Section::new(Rights::ReadOnly, linker.pool));
    }

    let functions = linker
        .function_sections
        .into_iter()
        .map(|(name, section)| (name, (section, 0)))
        .collect();
    Ok(Program {
        sections,
        links: linker.links,
        functions,
        runtime: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse, parse_ast};
    use std::io;

    type Compiled = (Vec<Section>, Vec<Link>, BTreeMap<String, (SectionId, usize)>);

    fn compile(src: &str) -> Result<Compiled, CodegenErr> {
        let ast = parse(src).expect("program should parse");
        let mut rt = Runtime::new(io::sink(), io::empty());
        let program = generate(&ast, &mut rt)?;
        Ok((program.sections, program.links, program.functions))
    }

    #[test]
    fn literal_return_links_into_the_pool() {
        let (sections, links, functions) =
            compile("func main() -> Float64 {\n return 1\n}").unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].rights, Rights::Executable);
        assert_eq!(sections[1].rights, Rights::ReadOnly);
        assert_eq!(sections[1].data, 1.0f64.to_le_bytes().to_vec());
        assert_eq!(functions["main"], (0, 0));

        // push rbp; mov rbp, rsp; mov rax, <pool>; movsd xmm0, [rax]
        let code = hex::encode(&sections[0].data);
        assert!(code.starts_with("554889e548b80000000000000000f20f1000"), "{}", code);
        assert_eq!(
            links,
            vec![Link {
                pointer_section: 0,
                pointer_offset: 6,
                pointee_section: 1,
                pointee_offset: 0
            }]
        );
    }

    #[test]
    fn literals_are_pooled_once() {
        let (sections, links, _) =
            compile("func main() -> Float64 {\n return 2 * 2 + 3 - 2\n}").unwrap();
        let pool = sections.last().unwrap();
        assert_eq!(pool.data.len(), 16);
        assert_eq!(links.len(), 4);
        assert!(links.iter().all(|l| l.pointee_section == 1 && l.pointee_offset % 8 == 0));
    }

    #[test]
    fn calls_between_functions_are_linked() {
        let src = "func one() -> Float64 {\n return 1\n}\nfunc main() -> Float64 {\n return one()\n}";
        let (sections, links, functions) = compile(src).unwrap();
        // Functions are laid out in name order, the pool last
        assert_eq!(functions["main"], (0, 0));
        assert_eq!(functions["one"], (1, 0));
        assert_eq!(sections.len(), 3);
        assert!(links
            .iter()
            .any(|l| l.pointer_section == 0 && l.pointee_section == 1 && l.pointee_offset == 0));
    }

    #[test]
    fn functions_without_literals_have_no_pool() {
        let (sections, links, _) =
            compile("func id(x: Float64) -> Float64 {\n return x\n}").unwrap();
        assert_eq!(sections.len(), 1);
        assert!(links.is_empty());
    }

    #[test]
    fn refuses_programs_with_diagnostics() {
        let ast = parse_ast("func main() {\n 42\n}");
        let mut rt = Runtime::new(io::sink(), io::empty());
        assert_eq!(generate(&ast, &mut rt).err(), Some(CodegenErr::HasDiagnostics(1)));
    }

    #[test]
    fn only_float64_is_lowered() {
        let err = compile("func f(x: Int32) {\n}").unwrap_err();
        assert_eq!(
            err,
            CodegenErr::UnsupportedType { what: "Argument x of f".into(), ty: "Int32" }
        );
    }

    #[test]
    fn externs_must_name_intrinsics() {
        assert_eq!(
            compile("use launch(x: Float64) -> Float64").unwrap_err(),
            CodegenErr::UnknownExtern("launch".into())
        );
        assert_eq!(
            compile("use printByte() -> Float64").unwrap_err(),
            CodegenErr::ExternArity { name: "printByte".into(), expected: 1, found: 0 }
        );
    }

    #[test]
    fn too_many_arguments() {
        let src = "func f(a: Float64, b: Float64, c: Float64, d: Float64, e: Float64, g: Float64, h: Float64, i: Float64, j: Float64) {\n}";
        assert_eq!(
            compile(src).unwrap_err(),
            CodegenErr::TooManyArguments { callee: "f".into(), count: 9 }
        );
    }

    #[test]
    fn deep_expressions_exhaust_the_registers() {
        // Each level keeps its left operand live while the right one is evaluated
        let mut expr = String::from("1");
        for _ in 0..17 {
            expr = format!("1 + ({})", expr);
        }
        let src = format!("func main() -> Float64 {{\n return {}\n}}", expr);
        assert_eq!(compile(&src).unwrap_err(), CodegenErr::RegistersExhausted);
    }
}
