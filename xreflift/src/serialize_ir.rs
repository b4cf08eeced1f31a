//! A human-readable textual form of modules.
//!
//! ```text
//! module "name" pointer_bits 32
//! used @a, @b
//! global [internal] [constant] @g : i32 [address 0x401000] [= 0:i32]
//! declare [internal] @f(&Memory, i32) -> i32 [readnone]
//! define [internal] @h(i32) -> i32 [noinline] {
//! entry:
//!   %0 = add i32 %arg0, 1:i32
//!   ret %0
//! }
//! ```
//!
//! Printing renumbers instructions and may rename blocks to keep labels unique, so a round trip
//! preserves structure rather than ids.

use crate::containers::unordered::UnorderedMap;
use crate::ir::{
    BinOp, BlockId, CastOp, CmpPred, FloatKind, FnAttr, FuncId, Function, GlobalVariable, InstId,
    InstKind, Linkage, Module, Type, Value,
};
use itertools::Itertools;

/// A trait that indicates that `Self` can be parsed from a string.
pub trait Parseable: Sized {
    /// Parse from the given string
    fn parse_from(s: &str) -> Result<Self, ParseError>;
}

/// Why parsing failed, and where
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ParseError {
    /// 1-based; 0 if the error is not tied to a line
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

const BINOPS: [(BinOp, &str); 17] = [
    (BinOp::Add, "add"),
    (BinOp::Sub, "sub"),
    (BinOp::Mul, "mul"),
    (BinOp::UDiv, "udiv"),
    (BinOp::SDiv, "sdiv"),
    (BinOp::URem, "urem"),
    (BinOp::SRem, "srem"),
    (BinOp::And, "and"),
    (BinOp::Or, "or"),
    (BinOp::Xor, "xor"),
    (BinOp::Shl, "shl"),
    (BinOp::LShr, "lshr"),
    (BinOp::AShr, "ashr"),
    (BinOp::FAdd, "fadd"),
    (BinOp::FSub, "fsub"),
    (BinOp::FMul, "fmul"),
    (BinOp::FDiv, "fdiv"),
];

const PREDICATES: [(CmpPred, &str); 17] = [
    (CmpPred::Eq, "eq"),
    (CmpPred::Ne, "ne"),
    (CmpPred::Ult, "ult"),
    (CmpPred::Ule, "ule"),
    (CmpPred::Ugt, "ugt"),
    (CmpPred::Uge, "uge"),
    (CmpPred::Slt, "slt"),
    (CmpPred::Sle, "sle"),
    (CmpPred::Sgt, "sgt"),
    (CmpPred::Sge, "sge"),
    (CmpPred::FOeq, "foeq"),
    (CmpPred::FOne, "fone"),
    (CmpPred::FOlt, "folt"),
    (CmpPred::FOle, "fole"),
    (CmpPred::FOgt, "fogt"),
    (CmpPred::FOge, "foge"),
    (CmpPred::FUno, "funo"),
];

const CASTS: [(CastOp, &str); 10] = [
    (CastOp::Trunc, "trunc"),
    (CastOp::ZExt, "zext"),
    (CastOp::SExt, "sext"),
    (CastOp::FpTrunc, "fptrunc"),
    (CastOp::FpExt, "fpext"),
    (CastOp::FpToSi, "fptosi"),
    (CastOp::SiToFp, "sitofp"),
    (CastOp::IntToPtr, "inttoptr"),
    (CastOp::PtrToInt, "ptrtoint"),
    (CastOp::Bitcast, "bitcast"),
];

const ATTRS: [FnAttr; 4] = [
    FnAttr::NoInline,
    FnAttr::AlwaysInline,
    FnAttr::InlineHint,
    FnAttr::ReadNone,
];

fn name_of<T: PartialEq + Copy>(table: &[(T, &'static str)], x: T) -> &'static str {
    table
        .iter()
        .find(|(y, _)| *y == x)
        .map(|(_, n)| *n)
        .unwrap_or("?")
}

fn lookup_name<T: Copy>(table: &[(T, &'static str)], name: &str) -> Option<T> {
    table.iter().find(|(_, n)| *n == name).map(|(x, _)| *x)
}

/////////////////////////////////////////////////////////////////////////////////////////////////
// Printing
/////////////////////////////////////////////////////////////////////////////////////////////////

/// Printing context for the values of one function
struct FunctionNames<'a> {
    module: &'a Module,
    insts: UnorderedMap<InstId, usize>,
    labels: UnorderedMap<BlockId, String>,
}

impl<'a> FunctionNames<'a> {
    fn of(module: &'a Module, func: Option<&Function>) -> Self {
        let mut insts = UnorderedMap::new();
        let mut labels = UnorderedMap::new();
        if let Some(func) = func {
            for (n, i) in func.instructions().into_iter().enumerate() {
                insts.insert(i, n);
            }
            let mut taken: Vec<String> = vec![];
            for b in func.block_ids() {
                let base = match func.block(b).name.as_str() {
                    "" => format!("bb{}", b.index()),
                    n => n.replace(|c: char| c.is_whitespace() || "()[]{},=:;\"".contains(c), "_"),
                };
                let mut label = base.clone();
                let mut k = 1;
                while taken.contains(&label) {
                    label = format!("{}.{}", base, k);
                    k += 1;
                }
                taken.push(label.clone());
                labels.insert(b, label);
            }
        }
        Self {
            module,
            insts,
            labels,
        }
    }

    fn value(&self, v: &Value) -> String {
        match v {
            Value::Int { value, bits } => {
                if *value > 0xffff {
                    format!("{:#x}:i{}", value, bits)
                } else {
                    format!("{}:i{}", value, bits)
                }
            }
            Value::Float { .. } => {
                let (f, kind) = v.as_float().unwrap_or((0.0, FloatKind::F64));
                format!("{:?}:f{}", f, kind.bits())
            }
            Value::Undef(t) => format!("undef:{}", t),
            Value::Null => "null".to_owned(),
            Value::Arg(i) => format!("%arg{}", i),
            Value::Inst(i) => match self.insts.get(i) {
                Some(n) => format!("%{}", n),
                None => format!("%dangling{}", i.index()),
            },
            Value::Global(g) => format!("@{}", self.module.global(*g).name),
            Value::Function(f) => format!("@{}", self.module.function(*f).name),
            Value::GlobalAddr(g) => format!("addr(@{})", self.module.global(*g).name),
        }
    }

    fn label(&self, b: &BlockId) -> String {
        self.labels
            .get(b)
            .cloned()
            .unwrap_or_else(|| format!("bb{}", b.index()))
    }

    fn write_inst(
        &self,
        f: &mut std::fmt::Formatter<'_>,
        func: &Function,
        i: InstId,
    ) -> std::fmt::Result {
        let data = func.inst(i);
        let lhs = format!("%{} = ", self.insts.get(&i).copied().unwrap_or(i.index()));
        let v = |x: &Value| self.value(x);
        match &data.kind {
            InstKind::Binary { op, lhs: a, rhs: b } => write!(
                f,
                "{}{} {} {}, {}",
                lhs,
                name_of(&BINOPS, *op),
                data.ty,
                v(a),
                v(b)
            ),
            InstKind::Cmp { pred, lhs: a, rhs: b } => write!(
                f,
                "{}cmp {} {}, {}",
                lhs,
                name_of(&PREDICATES, *pred),
                v(a),
                v(b)
            ),
            InstKind::Cast { op, value } => write!(
                f,
                "{}{} {} to {}",
                lhs,
                name_of(&CASTS, *op),
                v(value),
                data.ty
            ),
            InstKind::Select {
                cond,
                on_true,
                on_false,
            } => write!(
                f,
                "{}select {} {}, {}, {}",
                lhs,
                data.ty,
                v(cond),
                v(on_true),
                v(on_false)
            ),
            InstKind::Load { addr } => write!(f, "{}load {} {}", lhs, data.ty, v(addr)),
            InstKind::Store { value, addr } => write!(f, "store {}, {}", v(value), v(addr)),
            InstKind::Call { callee, args, tail } => write!(
                f,
                "{}{}call {} {}({})",
                if data.ty.is_void() { "" } else { lhs.as_str() },
                if *tail { "tail " } else { "" },
                data.ty,
                v(callee),
                args.iter().map(v).join(", ")
            ),
            InstKind::Phi { incoming } => write!(
                f,
                "{}phi {} {}",
                lhs,
                data.ty,
                incoming
                    .iter()
                    .map(|(x, b)| format!("[{}, {}]", v(x), self.label(b)))
                    .join(", ")
            ),
            InstKind::RegisterSlot { state, name } => {
                write!(f, "{}regslot {}, {:?}", lhs, v(state), name)
            }
            InstKind::Br { target } => write!(f, "br {}", self.label(target)),
            InstKind::CondBr {
                cond,
                on_true,
                on_false,
            } => write!(
                f,
                "condbr {}, {}, {}",
                v(cond),
                self.label(on_true),
                self.label(on_false)
            ),
            InstKind::Ret { value: None } => write!(f, "ret"),
            InstKind::Ret { value: Some(x) } => write!(f, "ret {}", v(x)),
            InstKind::Unreachable => write!(f, "unreachable"),
        }
    }
}

fn write_signature(f: &mut std::fmt::Formatter<'_>, func: &Function) -> std::fmt::Result {
    write!(
        f,
        "{}@{}({}) -> {}",
        if func.linkage == Linkage::Internal {
            "internal "
        } else {
            ""
        },
        func.name,
        func.ty.params.iter().join(", "),
        func.ty.ret
    )?;
    for attr in ATTRS {
        if func.attrs.contains(&attr) {
            write!(f, " {}", attr.name())?;
        }
    }
    Ok(())
}

impl std::fmt::Display for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "module {:?} pointer_bits {}",
            self.name, self.data_layout.pointer_bits
        )?;
        let constants = FunctionNames::of(self, None);
        if let Some(used) = &self.used {
            writeln!(f, "used {}", used.iter().map(|v| constants.value(v)).join(", "))?;
        }
        for g in self.global_ids() {
            let g = self.global(g);
            write!(f, "global ")?;
            if g.linkage == Linkage::Internal {
                write!(f, "internal ")?;
            }
            if g.is_constant {
                write!(f, "constant ")?;
            }
            write!(f, "@{} : {}", g.name, g.ty)?;
            if let Some(a) = g.address {
                write!(f, " address {:#x}", a)?;
            }
            if let Some(init) = &g.initializer {
                write!(f, " = {}", constants.value(init))?;
            }
            writeln!(f)?;
        }
        for id in self.function_ids() {
            let func = self.function(id);
            if func.is_declaration() {
                write!(f, "declare ")?;
                write_signature(f, func)?;
                writeln!(f)?;
                continue;
            }
            write!(f, "define ")?;
            write_signature(f, func)?;
            writeln!(f, " {{")?;
            let names = FunctionNames::of(self, Some(func));
            for b in func.block_ids() {
                writeln!(f, "{}:", names.label(&b))?;
                for &i in func.block(b).insts() {
                    write!(f, "  ")?;
                    names.write_inst(f, func, i)?;
                    writeln!(f)?;
                }
            }
            writeln!(f, "}}")?;
        }
        Ok(())
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////////
// Parsing
/////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, PartialEq, Eq, Debug)]
enum Token {
    Word(String),
    Str(String),
    Punct(char),
}

const PUNCTUATION: &str = "()[]{},=:";

fn tokenize(line: &str) -> Result<Vec<Token>, String> {
    let mut toks = vec![];
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == ';' {
            break;
        } else if PUNCTUATION.contains(c) {
            toks.push(Token::Punct(c));
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut s = String::new();
            loop {
                match chars.next() {
                    None => return Err("Unterminated string".into()),
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(e) => s.push(e),
                        None => return Err("Unterminated string".into()),
                    },
                    Some(x) => s.push(x),
                }
            }
            toks.push(Token::Str(s));
        } else {
            let mut w = String::new();
            while let Some(&x) = chars.peek() {
                if x.is_whitespace() || x == ';' || x == '"' || PUNCTUATION.contains(x) {
                    break;
                }
                w.push(x);
                chars.next();
            }
            toks.push(Token::Word(w));
        }
    }
    Ok(toks)
}

struct Cursor {
    toks: Vec<Token>,
    pos: usize,
}

impl Cursor {
    fn new(line: &str) -> Result<Self, String> {
        Ok(Self {
            toks: tokenize(line)?,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, String> {
        let t = self
            .toks
            .get(self.pos)
            .cloned()
            .ok_or_else(|| "Unexpected end of line".to_owned())?;
        self.pos += 1;
        Ok(t)
    }

    fn word(&mut self) -> Result<String, String> {
        match self.next()? {
            Token::Word(w) => Ok(w),
            t => Err(format!("Expected a word, found {:?}", t)),
        }
    }

    fn string(&mut self) -> Result<String, String> {
        match self.next()? {
            Token::Str(s) => Ok(s),
            t => Err(format!("Expected a string, found {:?}", t)),
        }
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if self.peek() == Some(&Token::Punct(c)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, c: char) -> Result<(), String> {
        if self.eat_punct(c) {
            Ok(())
        } else {
            Err(format!("Expected '{}', found {:?}", c, self.peek()))
        }
    }

    fn eat_word(&mut self, w: &str) -> bool {
        if matches!(self.peek(), Some(Token::Word(x)) if x == w) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_word(&mut self, w: &str) -> Result<(), String> {
        if self.eat_word(w) {
            Ok(())
        } else {
            Err(format!("Expected '{}', found {:?}", w, self.peek()))
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.toks.len()
    }

    fn finish(&self) -> Result<(), String> {
        if self.at_end() {
            Ok(())
        } else {
            Err(format!("Unexpected trailing {:?}", &self.toks[self.pos..]))
        }
    }

    /// A comma-separated list, ending at `close`
    fn list<T>(
        &mut self,
        close: char,
        mut item: impl FnMut(&mut Self) -> Result<T, String>,
    ) -> Result<Vec<T>, String> {
        let mut res = vec![];
        if self.eat_punct(close) {
            return Ok(res);
        }
        loop {
            res.push(item(self)?);
            if self.eat_punct(close) {
                return Ok(res);
            }
            self.expect_punct(',')?;
        }
    }

    fn ty(&mut self) -> Result<Type, String> {
        parse_type(&self.word()?)
    }
}

fn parse_type(w: &str) -> Result<Type, String> {
    Ok(match w {
        "void" => Type::Void,
        "ptr" => Type::Ptr,
        "f32" => Type::Float(FloatKind::F32),
        "f64" => Type::Float(FloatKind::F64),
        "f80" => Type::Float(FloatKind::F80),
        _ => {
            if let Some(name) = w.strip_prefix('&') {
                if name.is_empty() {
                    return Err("Empty handle type name".into());
                }
                Type::Handle(name.to_owned())
            } else if let Some(bits) = w.strip_prefix('i').and_then(|b| b.parse::<u32>().ok()) {
                if bits == 0 || bits > 64 {
                    return Err(format!("Unsupported integer width {}", bits));
                }
                Type::Int(bits)
            } else {
                return Err(format!("Unknown type {:?}", w));
            }
        }
    })
}

impl Parseable for Type {
    fn parse_from(s: &str) -> Result<Self, ParseError> {
        parse_type(s.trim()).map_err(|message| ParseError { line: 0, message })
    }
}

fn parse_integer(w: &str) -> Result<u64, String> {
    let (neg, digits) = match w.strip_prefix('-') {
        Some(d) => (true, d),
        None => (false, w),
    };
    let v = match digits.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => digits.parse::<u64>(),
    }
    .map_err(|e| format!("Bad integer {:?}: {}", w, e))?;
    Ok(if neg { v.wrapping_neg() } else { v })
}

/// Name resolution for the values of one function (or of none, for global initializers)
struct Scope<'a> {
    module: &'a Module,
    locals: UnorderedMap<String, InstId>,
    labels: UnorderedMap<String, BlockId>,
}

impl<'a> Scope<'a> {
    fn global_scope(module: &'a Module) -> Self {
        Self {
            module,
            locals: UnorderedMap::new(),
            labels: UnorderedMap::new(),
        }
    }

    fn symbol(&self, name: &str) -> Result<Value, String> {
        if let Some(f) = self.module.get_function(name) {
            Ok(Value::Function(f))
        } else if let Some(g) = self.module.get_global(name) {
            Ok(Value::Global(g))
        } else {
            Err(format!("Unknown symbol @{}", name))
        }
    }

    fn label(&self, c: &mut Cursor) -> Result<BlockId, String> {
        let l = c.word()?;
        self.labels
            .get(&l)
            .copied()
            .ok_or_else(|| format!("Unknown label {:?}", l))
    }

    fn value(&self, c: &mut Cursor) -> Result<Value, String> {
        let w = c.word()?;
        if let Some(local) = w.strip_prefix('%') {
            if let Some(n) = local.strip_prefix("arg").and_then(|n| n.parse().ok()) {
                return Ok(Value::Arg(n));
            }
            return self
                .locals
                .get(local)
                .map(|&i| Value::Inst(i))
                .ok_or_else(|| format!("Unknown value %{}", local));
        }
        if let Some(sym) = w.strip_prefix('@') {
            return self.symbol(sym);
        }
        match w.as_str() {
            "null" => return Ok(Value::Null),
            "undef" => {
                c.expect_punct(':')?;
                return Ok(Value::Undef(c.ty()?));
            }
            "addr" => {
                c.expect_punct('(')?;
                let sym = c.word()?;
                c.expect_punct(')')?;
                return match sym.strip_prefix('@').map(|s| self.module.get_global(s)) {
                    Some(Some(g)) => Ok(Value::GlobalAddr(g)),
                    _ => Err(format!("addr() needs a global, found {}", sym)),
                };
            }
            _ => {}
        }
        c.expect_punct(':')?;
        match c.ty()? {
            Type::Int(bits) => Ok(Value::int(parse_integer(&w)?, bits)),
            Type::Float(kind) => w
                .parse::<f64>()
                .map(|x| Value::float(x, kind))
                .map_err(|e| format!("Bad float {:?}: {}", w, e)),
            t => Err(format!("No literals of type {}", t)),
        }
    }

    fn args(&self, c: &mut Cursor) -> Result<Vec<Value>, String> {
        c.expect_punct('(')?;
        c.list(')', |c| self.value(c))
    }

    /// Parse an instruction (after any `%name =`), returning its kind and type
    fn inst(&self, c: &mut Cursor) -> Result<(InstKind, Type), String> {
        let op = c.word()?;
        if let Some(op) = lookup_name(&BINOPS, &op) {
            let ty = c.ty()?;
            let lhs = self.value(c)?;
            c.expect_punct(',')?;
            let rhs = self.value(c)?;
            return Ok((InstKind::Binary { op, lhs, rhs }, ty));
        }
        if let Some(op) = lookup_name(&CASTS, &op) {
            let value = self.value(c)?;
            c.expect_word("to")?;
            return Ok((InstKind::Cast { op, value }, c.ty()?));
        }
        Ok(match op.as_str() {
            "cmp" => {
                let pred = c.word()?;
                let pred = lookup_name(&PREDICATES, &pred)
                    .ok_or_else(|| format!("Unknown predicate {:?}", pred))?;
                let lhs = self.value(c)?;
                c.expect_punct(',')?;
                let rhs = self.value(c)?;
                (InstKind::Cmp { pred, lhs, rhs }, Type::Int(1))
            }
            "select" => {
                let ty = c.ty()?;
                let cond = self.value(c)?;
                c.expect_punct(',')?;
                let on_true = self.value(c)?;
                c.expect_punct(',')?;
                let on_false = self.value(c)?;
                (
                    InstKind::Select {
                        cond,
                        on_true,
                        on_false,
                    },
                    ty,
                )
            }
            "load" => {
                let ty = c.ty()?;
                (InstKind::Load { addr: self.value(c)? }, ty)
            }
            "store" => {
                let value = self.value(c)?;
                c.expect_punct(',')?;
                let addr = self.value(c)?;
                (InstKind::Store { value, addr }, Type::Void)
            }
            "tail" | "call" => {
                let tail = op == "tail";
                if tail {
                    c.expect_word("call")?;
                }
                let ty = c.ty()?;
                let callee = self.value(c)?;
                let args = self.args(c)?;
                (InstKind::Call { callee, args, tail }, ty)
            }
            "phi" => {
                let ty = c.ty()?;
                let mut incoming = vec![];
                while c.eat_punct('[') {
                    let v = self.value(c)?;
                    c.expect_punct(',')?;
                    let b = self.label(c)?;
                    c.expect_punct(']')?;
                    incoming.push((v, b));
                    if !c.eat_punct(',') {
                        break;
                    }
                }
                (InstKind::Phi { incoming }, ty)
            }
            "regslot" => {
                let state = self.value(c)?;
                c.expect_punct(',')?;
                let name = c.string()?;
                (InstKind::RegisterSlot { state, name }, Type::Ptr)
            }
            "br" => (
                InstKind::Br {
                    target: self.label(c)?,
                },
                Type::Void,
            ),
            "condbr" => {
                let cond = self.value(c)?;
                c.expect_punct(',')?;
                let on_true = self.label(c)?;
                c.expect_punct(',')?;
                let on_false = self.label(c)?;
                (
                    InstKind::CondBr {
                        cond,
                        on_true,
                        on_false,
                    },
                    Type::Void,
                )
            }
            "ret" => {
                let value = if c.at_end() {
                    None
                } else {
                    Some(self.value(c)?)
                };
                (InstKind::Ret { value }, Type::Void)
            }
            "unreachable" => (InstKind::Unreachable, Type::Void),
            _ => return Err(format!("Unknown instruction {:?}", op)),
        })
    }
}

/// `declare`/`define` line contents after the keyword
fn parse_signature(c: &mut Cursor) -> Result<Function, String> {
    let internal = c.eat_word("internal");
    let name = c.word()?;
    let name = name
        .strip_prefix('@')
        .ok_or_else(|| format!("Expected @name, found {:?}", name))?;
    c.expect_punct('(')?;
    let params = c.list(')', |c| c.ty())?;
    c.expect_word("->")?;
    let ret = c.ty()?;
    let mut f = Function::new(name, params, ret);
    if internal {
        f.linkage = Linkage::Internal;
    }
    while let Some(Token::Word(w)) = c.peek() {
        let attr = ATTRS
            .iter()
            .find(|a| a.name() == w)
            .ok_or_else(|| format!("Unknown attribute {:?}", w))?;
        f.attrs.insert(*attr);
        c.pos += 1;
    }
    Ok(f)
}

/// `global` line contents after the keyword, except for the initializer
fn parse_global(c: &mut Cursor) -> Result<GlobalVariable, String> {
    let internal = c.eat_word("internal");
    let is_constant = c.eat_word("constant");
    let name = c.word()?;
    let name = name
        .strip_prefix('@')
        .ok_or_else(|| format!("Expected @name, found {:?}", name))?;
    c.expect_punct(':')?;
    let mut g = GlobalVariable::new(name, c.ty()?);
    g.is_constant = is_constant;
    if internal {
        g.linkage = Linkage::Internal;
    }
    if c.eat_word("address") {
        g.address = Some(parse_integer(&c.word()?)?);
    }
    Ok(g)
}

/// A function body's lines, for the second pass
struct PendingBody {
    func: FuncId,
    /// Line numbers (0-based) of the body, excluding the braces
    lines: std::ops::Range<usize>,
}

fn parse_body(module: &mut Module, lines: &[&str], body: &PendingBody) -> Result<(), ParseError> {
    let err = |line: usize| move |message: String| ParseError {
        line: line + 1,
        message,
    };

    // Blocks first, and instruction names in the order instructions will be created
    let mut labels = UnorderedMap::new();
    let mut locals = UnorderedMap::new();
    let mut num_insts = 0;
    for ln in body.lines.clone() {
        let c = Cursor::new(lines[ln]).map_err(err(ln))?;
        match c.toks.as_slice() {
            [] => {}
            [Token::Word(l), Token::Punct(':')] => {
                if labels.contains_key(l) {
                    return Err(err(ln)(format!("Duplicate label {:?}", l)));
                }
                let b = module.function_mut(body.func).add_block(l.clone());
                labels.insert(l.clone(), b);
            }
            toks => {
                if let [Token::Word(name), Token::Punct('='), ..] = toks {
                    let name = name
                        .strip_prefix('%')
                        .ok_or_else(|| err(ln)(format!("Bad value name {:?}", name)))?;
                    // A fresh function allocates instruction ids sequentially
                    if locals.insert(name.to_owned(), InstId(num_insts)).is_some() {
                        return Err(err(ln)(format!("Duplicate value %{}", name)));
                    }
                }
                num_insts += 1;
            }
        }
    }

    let mut insts = vec![];
    let mut current: Option<BlockId> = None;
    {
        let scope = Scope {
            module,
            locals,
            labels,
        };
        for ln in body.lines.clone() {
            let mut c = Cursor::new(lines[ln]).map_err(err(ln))?;
            if c.at_end() {
                continue;
            }
            if let [Token::Word(l), Token::Punct(':')] = c.toks.as_slice() {
                current = scope.labels.get(l).copied();
                continue;
            }
            let block = current.ok_or_else(|| err(ln)("Instruction outside of a block".into()))?;
            if matches!(c.toks.get(1), Some(Token::Punct('='))) {
                c.pos = 2;
            }
            let (kind, ty) = scope.inst(&mut c).map_err(err(ln))?;
            c.finish().map_err(err(ln))?;
            insts.push((block, kind, ty));
        }
    }

    let func = module.function_mut(body.func);
    for (block, kind, ty) in insts {
        func.append_inst(block, kind, ty);
    }
    Ok(())
}

impl Parseable for Module {
    fn parse_from(s: &str) -> Result<Self, ParseError> {
        let lines: Vec<&str> = s.lines().collect();
        let err = |line: usize| move |message: String| ParseError {
            line: line + 1,
            message,
        };
        let is_blank = |l: &str| {
            let l = l.trim();
            l.is_empty() || l.starts_with(';')
        };

        let mut ln = 0;
        while ln < lines.len() && is_blank(lines[ln]) {
            ln += 1;
        }
        if ln == lines.len() {
            return Err(ParseError {
                line: 0,
                message: "Missing module header".into(),
            });
        }
        let mut module = {
            let mut c = Cursor::new(lines[ln]).map_err(err(ln))?;
            c.expect_word("module").map_err(err(ln))?;
            let name = c.string().map_err(err(ln))?;
            c.expect_word("pointer_bits").map_err(err(ln))?;
            let bits = c.word().map_err(err(ln))?;
            c.finish().map_err(err(ln))?;
            match bits.parse::<u32>() {
                Ok(bits @ (16 | 32 | 64)) => Module::new(name, bits),
                _ => return Err(err(ln)(format!("Unsupported pointer size {:?}", bits))),
            }
        };
        ln += 1;

        // First pass: symbols, so that everything may refer to anything
        let mut bodies = vec![];
        let mut second_pass = vec![];
        while ln < lines.len() {
            if is_blank(lines[ln]) {
                ln += 1;
                continue;
            }
            let mut c = Cursor::new(lines[ln]).map_err(err(ln))?;
            let keyword = c.word().map_err(err(ln))?;
            match keyword.as_str() {
                "used" => second_pass.push(ln),
                "global" => {
                    let g = parse_global(&mut c).map_err(err(ln))?;
                    if module.get_global(&g.name).is_some() {
                        return Err(err(ln)(format!("Duplicate global @{}", g.name)));
                    }
                    module.add_global(g);
                    second_pass.push(ln);
                }
                "declare" | "define" => {
                    let f = parse_signature(&mut c).map_err(err(ln))?;
                    if module.get_function(&f.name).is_some() {
                        return Err(err(ln)(format!("Duplicate function @{}", f.name)));
                    }
                    let is_definition = keyword == "define";
                    if is_definition {
                        c.expect_punct('{').map_err(err(ln))?;
                    }
                    c.finish().map_err(err(ln))?;
                    let func = module.add_function(f);
                    if is_definition {
                        let start = ln + 1;
                        let end = (start..lines.len())
                            .find(|&l| lines[l].trim() == "}")
                            .ok_or_else(|| err(ln)("Unterminated function body".into()))?;
                        bodies.push(PendingBody {
                            func,
                            lines: start..end,
                        });
                        ln = end;
                    }
                }
                _ => return Err(err(ln)(format!("Unexpected {:?}", keyword))),
            }
            ln += 1;
        }

        // Second pass: initializers, the used list, and bodies
        for ln in second_pass {
            let mut c = Cursor::new(lines[ln]).map_err(err(ln))?;
            let keyword = c.word().map_err(err(ln))?;
            let scope = Scope::global_scope(&module);
            if keyword == "used" {
                let used = if c.at_end() {
                    vec![]
                } else {
                    let mut used = vec![scope.value(&mut c).map_err(err(ln))?];
                    while c.eat_punct(',') {
                        used.push(scope.value(&mut c).map_err(err(ln))?);
                    }
                    used
                };
                c.finish().map_err(err(ln))?;
                module.used = Some(used);
                continue;
            }
            let g = parse_global(&mut c).map_err(err(ln))?;
            let init = if c.eat_punct('=') {
                let v = scope.value(&mut c).map_err(err(ln))?;
                if !v.is_constant() {
                    return Err(err(ln)("Initializers must be constants".into()));
                }
                Some(v)
            } else {
                None
            };
            c.finish().map_err(err(ln))?;
            if let Some(id) = module.get_global(&g.name) {
                module.global_mut(id).initializer = init;
            }
        }
        for body in &bodies {
            parse_body(&mut module, &lines, body)?;
        }
        Ok(module)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = r#"
module "sample" pointer_bits 32
used @keep
global internal constant @ISEL_ADD : ptr = @ADD
global @data_401000 : i8 address 0x401000
global @keep : i32 = 0:i32
declare @__lift_read_memory_32(&Memory, i32) -> i32 readnone
define internal @ADD(&Memory, &State, ptr, i32) -> &Memory alwaysinline {
entry:
  %0 = load i32 %arg2
  %1 = add i32 %0, %arg3
  store %1, %arg2
  ret %arg0
}
define @sub_401000(&Memory, &State, i32) -> &Memory {
entry:
  %slot = regslot %arg1, "EAX"
  %v = call i32 @__lift_read_memory_32(%arg0, addr(@data_401000))
  %c = cmp ult %v, 10:i32
  condbr %c, small, done
small:
  %w = phi i32 [%v, entry]
  store %w, %slot
  br done
done:
  %m = tail call &Memory @ADD(%arg0, %arg1, %slot, -1:i32)
  ret %m
}
"#;

    #[test]
    fn parse_print_parse_is_stable() {
        let m = Module::parse_from(SAMPLE).unwrap();
        let isel = m.get_global("ISEL_ADD").unwrap();
        let add = m.get_function("ADD").unwrap();
        assert_eq!(m.global(isel).initializer, Some(Value::Function(add)));
        assert_eq!(m.global(isel).linkage, Linkage::Internal);
        assert!(m.function(add).attrs.contains(&FnAttr::AlwaysInline));
        assert_eq!(
            m.global(m.get_global("data_401000").unwrap()).address,
            Some(0x401000)
        );

        let sub = m.function(m.get_function("sub_401000").unwrap());
        assert_eq!(sub.block_ids().len(), 3);
        assert_eq!(sub.num_instructions(), 9);
        let last_call = sub.instructions()[7];
        match &sub.inst(last_call).kind {
            InstKind::Call { args, tail, .. } => {
                assert!(*tail);
                assert_eq!(args[3], Value::int(0xffffffff, 32));
            }
            k => panic!("Expected a call, got {:?}", k),
        }

        let printed = m.to_string();
        let reparsed = Module::parse_from(&printed).unwrap();
        assert_eq!(reparsed.to_string(), printed);
    }

    #[test]
    fn errors_carry_line_numbers() {
        let e = Module::parse_from("module \"m\" pointer_bits 32\ndeclare @f() -> i7x\n")
            .unwrap_err();
        assert_eq!(e.line, 2);
        let e = Module::parse_from(
            "module \"m\" pointer_bits 32\ndefine @f() -> void {\nentry:\n  br nowhere\n}\n",
        )
        .unwrap_err();
        assert_eq!(e.line, 4);
        let e = Module::parse_from("module \"m\" pointer_bits 12\n").unwrap_err();
        assert_eq!(e.line, 1);
    }

    #[test]
    fn types_parse() {
        assert_eq!(Type::parse_from("&Memory").unwrap(), Type::memory());
        assert_eq!(Type::parse_from("i1").unwrap(), Type::Int(1));
        assert!(Type::parse_from("i0").is_err());
    }
}
