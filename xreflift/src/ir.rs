//! The intermediate representation that machine code is lifted into.
//!
//! A [`Module`] owns functions and global variables in arenas indexed by [`FuncId`] and
//! [`GlobalId`]. Removal tombstones an arena slot, so ids handed out earlier never get re-used for a
//! different object. Each [`Function`] owns its own instruction and block arenas, indexed by
//! [`InstId`] and [`BlockId`], with a separate layout order for blocks.
//!
//! There are no maintained use-lists. All use queries ([`Function::users_of`],
//! [`Module::callers_of`], ...) scan and return owned vectors, so callers are free to mutate the
//! module while walking the results. Passes that rewrite many values in one function build a
//! [`Function::user_index`] once and then use [`Function::replace_uses_in`] or
//! [`Function::replace_uses_with_map`], so that they stay linear in the size of the function.

use crate::containers::unordered::{UnorderedMap, UnorderedSet};

/// Floating-point formats
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum FloatKind {
    F32,
    F64,
    /// The x87 extended precision format
    F80,
}

impl FloatKind {
    pub fn bits(self) -> u32 {
        match self {
            FloatKind::F32 => 32,
            FloatKind::F64 => 64,
            FloatKind::F80 => 80,
        }
    }
}

/// An IR type.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Type {
    Void,
    /// An integer of the given number of bits (1 to 64)
    Int(u32),
    Float(FloatKind),
    /// An untyped pointer
    Ptr,
    /// A pointer to a named opaque structure, such as the memory-state or processor-state
    /// structures that lifted code threads through every function.
    Handle(String),
}

impl Type {
    /// Name of the opaque structure representing the state of memory
    pub const MEMORY: &'static str = "Memory";
    /// Name of the opaque structure representing the processor state
    pub const STATE: &'static str = "State";

    pub fn memory() -> Self {
        Type::Handle(Self::MEMORY.into())
    }

    pub fn state() -> Self {
        Type::Handle(Self::STATE.into())
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Type::Int(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Type::Float(_))
    }

    pub fn int_bits(&self) -> Option<u32> {
        match self {
            Type::Int(b) => Some(*b),
            _ => None,
        }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Int(b) => write!(f, "i{}", b),
            Type::Float(k) => write!(f, "f{}", k.bits()),
            Type::Ptr => write!(f, "ptr"),
            Type::Handle(n) => write!(f, "&{}", n),
        }
    }
}

impl std::fmt::Debug for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

/// Layout information of the target the module is lifted for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DataLayout {
    /// Size of a pointer, in bits
    pub pointer_bits: u32,
}

impl DataLayout {
    /// Size of `ty` in bits under this layout
    pub fn bit_width(&self, ty: &Type) -> u32 {
        match ty {
            Type::Void => 0,
            Type::Int(b) => *b,
            Type::Float(k) => k.bits(),
            Type::Ptr | Type::Handle(_) => self.pointer_bits,
        }
    }

    /// The integer type as wide as a pointer
    pub fn address_type(&self) -> Type {
        Type::Int(self.pointer_bits)
    }
}

macro_rules! arena_id {
    ($(#[$m:meta])* $name:ident) => {
        $(#[$m])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
        pub struct $name(pub(crate) usize);
        impl $name {
            pub fn index(self) -> usize {
                self.0
            }
        }
    };
}

arena_id!(
    /// A function of a [`Module`]
    FuncId
);
arena_id!(
    /// A global variable of a [`Module`]
    GlobalId
);
arena_id!(
    /// An instruction of a [`Function`]
    InstId
);
arena_id!(
    /// A basic block of a [`Function`]
    BlockId
);

/// Mask `value` down to its low `bits` bits
pub fn truncate_to_bits(value: u64, bits: u32) -> u64 {
    if bits >= 64 {
        value
    } else {
        value & ((1u64 << bits) - 1)
    }
}

/// Sign-extend the low `bits` bits of `value` to 64 bits
pub fn sign_extend_from_bits(value: u64, bits: u32) -> i64 {
    if bits >= 64 || bits == 0 {
        value as i64
    } else {
        let shift = 64 - bits;
        ((value << shift) as i64) >> shift
    }
}

/// An operand of an instruction, or an initializer of a global.
///
/// Values that refer to arguments or instructions are only meaningful within the function they
/// were created in.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Value {
    /// Integer constant; `value` is always kept truncated to `bits`
    Int { value: u64, bits: u32 },
    /// Floating constant, stored as the bits of an `f64`
    Float { bits: u64, kind: FloatKind },
    /// A formally undefined value of the given type
    Undef(Type),
    Null,
    /// The `n`th argument of the enclosing function
    Arg(usize),
    Inst(InstId),
    /// The address of a global variable, as a pointer
    Global(GlobalId),
    /// The address of a function, as a pointer
    Function(FuncId),
    /// The address of a global variable, as an integer of pointer width
    GlobalAddr(GlobalId),
}

impl Value {
    pub fn int(value: u64, bits: u32) -> Self {
        Value::Int {
            value: truncate_to_bits(value, bits),
            bits,
        }
    }

    pub fn float(value: f64, kind: FloatKind) -> Self {
        Value::Float {
            bits: value.to_bits(),
            kind,
        }
    }

    pub fn as_int(&self) -> Option<(u64, u32)> {
        match self {
            Value::Int { value, bits } => Some((*value, *bits)),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<(f64, FloatKind)> {
        match self {
            Value::Float { bits, kind } => Some((f64::from_bits(*bits), *kind)),
            _ => None,
        }
    }

    pub fn is_undef(&self) -> bool {
        matches!(self, Value::Undef(_))
    }

    /// Whether this value is independent of any function it is used in
    pub fn is_constant(&self) -> bool {
        !matches!(self, Value::Arg(_) | Value::Inst(_))
    }
}

/// Binary operators
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    FAdd,
    FSub,
    FMul,
    FDiv,
}

/// Comparison predicates; the `F*` predicates compare floats, the rest compare integers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum CmpPred {
    Eq,
    Ne,
    Ult,
    Ule,
    Ugt,
    Uge,
    Slt,
    Sle,
    Sgt,
    Sge,
    FOeq,
    FOne,
    FOlt,
    FOle,
    FOgt,
    FOge,
    FUno,
}

/// Conversion operators
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum CastOp {
    Trunc,
    ZExt,
    SExt,
    FpTrunc,
    FpExt,
    FpToSi,
    SiToFp,
    IntToPtr,
    PtrToInt,
    Bitcast,
}

/// The operation an instruction performs, along with its operands.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum InstKind {
    Binary {
        op: BinOp,
        lhs: Value,
        rhs: Value,
    },
    Cmp {
        pred: CmpPred,
        lhs: Value,
        rhs: Value,
    },
    /// Convert `value` to the instruction's type
    Cast {
        op: CastOp,
        value: Value,
    },
    Select {
        cond: Value,
        on_true: Value,
        on_false: Value,
    },
    /// Load a value of the instruction's type from `addr`
    Load {
        addr: Value,
    },
    Store {
        value: Value,
        addr: Value,
    },
    Call {
        callee: Value,
        args: Vec<Value>,
        /// The call may re-use its caller's frame
        tail: bool,
    },
    Phi {
        incoming: Vec<(Value, BlockId)>,
    },
    /// The address of the register `name` inside the processor state `state`
    RegisterSlot {
        state: Value,
        name: String,
    },
    Br {
        target: BlockId,
    },
    CondBr {
        cond: Value,
        on_true: BlockId,
        on_false: BlockId,
    },
    Ret {
        value: Option<Value>,
    },
    Unreachable,
}

impl InstKind {
    /// Visit every value operand (block operands are not values)
    pub fn for_each_operand(&self, mut f: impl FnMut(&Value)) {
        match self {
            InstKind::Binary { lhs, rhs, .. } | InstKind::Cmp { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            InstKind::Cast { value, .. } => f(value),
            InstKind::Select {
                cond,
                on_true,
                on_false,
            } => {
                f(cond);
                f(on_true);
                f(on_false);
            }
            InstKind::Load { addr } => f(addr),
            InstKind::Store { value, addr } => {
                f(value);
                f(addr);
            }
            InstKind::Call { callee, args, .. } => {
                f(callee);
                args.iter().for_each(f);
            }
            InstKind::Phi { incoming } => incoming.iter().for_each(|(v, _)| f(v)),
            InstKind::RegisterSlot { state, .. } => f(state),
            InstKind::CondBr { cond, .. } => f(cond),
            InstKind::Ret { value: Some(v) } => f(v),
            InstKind::Br { .. } | InstKind::Ret { value: None } | InstKind::Unreachable => {}
        }
    }

    /// Visit every value operand mutably
    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        match self {
            InstKind::Binary { lhs, rhs, .. } | InstKind::Cmp { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            InstKind::Cast { value, .. } => f(value),
            InstKind::Select {
                cond,
                on_true,
                on_false,
            } => {
                f(cond);
                f(on_true);
                f(on_false);
            }
            InstKind::Load { addr } => f(addr),
            InstKind::Store { value, addr } => {
                f(value);
                f(addr);
            }
            InstKind::Call { callee, args, .. } => {
                f(callee);
                args.iter_mut().for_each(f);
            }
            InstKind::Phi { incoming } => incoming.iter_mut().for_each(|(v, _)| f(v)),
            InstKind::RegisterSlot { state, .. } => f(state),
            InstKind::CondBr { cond, .. } => f(cond),
            InstKind::Ret { value: Some(v) } => f(v),
            InstKind::Br { .. } | InstKind::Ret { value: None } | InstKind::Unreachable => {}
        }
    }

    /// Visit every block operand mutably
    pub fn for_each_block_mut(&mut self, mut f: impl FnMut(&mut BlockId)) {
        match self {
            InstKind::Br { target } => f(target),
            InstKind::CondBr {
                on_true, on_false, ..
            } => {
                f(on_true);
                f(on_false);
            }
            InstKind::Phi { incoming } => incoming.iter_mut().for_each(|(_, b)| f(b)),
            _ => {}
        }
    }

    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            InstKind::Br { target } => vec![*target],
            InstKind::CondBr {
                on_true, on_false, ..
            } => {
                if on_true == on_false {
                    vec![*on_true]
                } else {
                    vec![*on_true, *on_false]
                }
            }
            _ => vec![],
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Br { .. }
                | InstKind::CondBr { .. }
                | InstKind::Ret { .. }
                | InstKind::Unreachable
        )
    }

    pub fn is_cast(&self) -> bool {
        matches!(self, InstKind::Cast { .. })
    }

    pub fn is_cmp(&self) -> bool {
        matches!(self, InstKind::Cmp { .. })
    }

    /// Whether removing this instruction (once it has no users) could change behavior
    pub fn has_side_effects(&self) -> bool {
        matches!(self, InstKind::Store { .. } | InstKind::Call { .. }) || self.is_terminator()
    }

    /// The callee, if this is a direct call
    pub fn called_function(&self) -> Option<FuncId> {
        match self {
            InstKind::Call {
                callee: Value::Function(f),
                ..
            } => Some(*f),
            _ => None,
        }
    }
}

/// An instruction, along with its result type and the block it lives in.
#[derive(Clone, Debug)]
pub struct InstData {
    pub kind: InstKind,
    /// Result type; [`Type::Void`] if the instruction produces no value
    pub ty: Type,
    pub(crate) block: BlockId,
}

impl InstData {
    pub fn block(&self) -> BlockId {
        self.block
    }
}

/// A basic block: a named, ordered list of instructions
#[derive(Clone, Debug)]
pub struct Block {
    pub name: String,
    pub(crate) insts: Vec<InstId>,
}

impl Block {
    pub fn insts(&self) -> &[InstId] {
        &self.insts
    }
}

/// Parameter and return types of a function
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct FunctionType {
    pub params: Vec<Type>,
    pub ret: Type,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Linkage {
    /// Visible outside the module; never removed by dead-code elimination
    External,
    /// Private to the module
    Internal,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum FnAttr {
    NoInline,
    AlwaysInline,
    InlineHint,
    /// Calls neither read nor write memory
    ReadNone,
}

impl FnAttr {
    pub fn name(self) -> &'static str {
        match self {
            FnAttr::NoInline => "noinline",
            FnAttr::AlwaysInline => "alwaysinline",
            FnAttr::InlineHint => "inlinehint",
            FnAttr::ReadNone => "readnone",
        }
    }
}

/// A function. Without any blocks, it is a declaration.
#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    pub ty: FunctionType,
    pub linkage: Linkage,
    pub attrs: UnorderedSet<FnAttr>,
    blocks: Vec<Option<Block>>,
    layout: Vec<BlockId>,
    insts: Vec<Option<InstData>>,
}

impl Function {
    /// A new external declaration
    pub fn new(name: impl Into<String>, params: Vec<Type>, ret: Type) -> Self {
        Self {
            name: name.into(),
            ty: FunctionType { params, ret },
            linkage: Linkage::External,
            attrs: Default::default(),
            blocks: vec![],
            layout: vec![],
            insts: vec![],
        }
    }

    pub fn is_declaration(&self) -> bool {
        self.layout.is_empty()
    }

    /// Append a new, empty block to the layout
    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len());
        self.blocks.push(Some(Block {
            name: name.into(),
            insts: vec![],
        }));
        self.layout.push(id);
        id
    }

    /// Create a new, empty block placed right after `after` in the layout
    pub fn add_block_after(&mut self, after: BlockId, name: impl Into<String>) -> BlockId {
        let id = self.add_block(name);
        self.layout.pop();
        let posn = self
            .layout
            .iter()
            .position(|&b| b == after)
            .map_or(self.layout.len(), |p| p + 1);
        self.layout.insert(posn, id);
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        self.blocks[id.0]
            .as_ref()
            .unwrap_or_else(|| panic!("Use of removed block {:?} in {}", id, self.name))
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        let name = &self.name;
        self.blocks[id.0]
            .as_mut()
            .unwrap_or_else(|| panic!("Use of removed block {:?} in {}", id, name))
    }

    /// Blocks in layout order; the first is the entry block
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.layout.clone()
    }

    pub fn entry_block(&self) -> Option<BlockId> {
        self.layout.first().copied()
    }

    pub fn block_exists(&self, id: BlockId) -> bool {
        matches!(self.blocks.get(id.0), Some(Some(_)))
    }

    pub fn inst(&self, id: InstId) -> &InstData {
        self.insts[id.0]
            .as_ref()
            .unwrap_or_else(|| panic!("Use of erased instruction {:?} in {}", id, self.name))
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut InstData {
        let name = &self.name;
        self.insts[id.0]
            .as_mut()
            .unwrap_or_else(|| panic!("Use of erased instruction {:?} in {}", id, name))
    }

    pub fn inst_exists(&self, id: InstId) -> bool {
        matches!(self.insts.get(id.0), Some(Some(_)))
    }

    /// All live instructions, in layout order
    pub fn instructions(&self) -> Vec<InstId> {
        self.layout
            .iter()
            .flat_map(|&b| self.block(b).insts.iter().copied())
            .collect()
    }

    pub fn num_instructions(&self) -> usize {
        self.layout.iter().map(|&b| self.block(b).insts.len()).sum()
    }

    fn new_inst(&mut self, block: BlockId, kind: InstKind, ty: Type) -> InstId {
        let id = InstId(self.insts.len());
        self.insts.push(Some(InstData { kind, ty, block }));
        id
    }

    /// Append an instruction to the end of `block`
    pub fn append_inst(&mut self, block: BlockId, kind: InstKind, ty: Type) -> InstId {
        let id = self.new_inst(block, kind, ty);
        self.block_mut(block).insts.push(id);
        id
    }

    /// Insert an instruction right before `before`, in the same block
    pub fn insert_inst_before(&mut self, before: InstId, kind: InstKind, ty: Type) -> InstId {
        let block = self.inst(before).block;
        let id = self.new_inst(block, kind, ty);
        let insts = &mut self.block_mut(block).insts;
        let posn = insts
            .iter()
            .position(|&i| i == before)
            .expect("Instruction missing from its own block");
        insts.insert(posn, id);
        id
    }

    /// Remove an instruction. Any remaining uses of it become dangling, so callers must redirect
    /// them first.
    pub fn erase_inst(&mut self, id: InstId) {
        let block = self.inst(id).block;
        self.block_mut(block).insts.retain(|&i| i != id);
        self.insts[id.0] = None;
    }

    /// Remove a block and all its instructions
    pub fn remove_block(&mut self, id: BlockId) {
        for i in self.block(id).insts.clone() {
            self.insts[i.0] = None;
        }
        self.blocks[id.0] = None;
        self.layout.retain(|&b| b != id);
    }

    /// Move the instructions of `block` from position `at` onwards into `to` (appending them)
    pub fn move_insts_from(&mut self, block: BlockId, at: usize, to: BlockId) {
        let moved = self.block_mut(block).insts.split_off(at);
        for &i in &moved {
            self.inst_mut(i).block = to;
        }
        self.block_mut(to).insts.extend(moved);
    }

    /// The terminating instruction of `block`, if it has been terminated
    pub fn terminator(&self, block: BlockId) -> Option<InstId> {
        let last = *self.block(block).insts.last()?;
        self.inst(last).kind.is_terminator().then(|| last)
    }

    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        self.terminator(block)
            .map(|t| self.inst(t).kind.successors())
            .unwrap_or_default()
    }

    /// Predecessors of `block`, in layout order, without duplicates
    pub fn predecessors(&self, block: BlockId) -> Vec<BlockId> {
        self.layout
            .iter()
            .copied()
            .filter(|&b| self.successors(b).contains(&block))
            .collect()
    }

    /// Instructions that use `value` as an operand, in layout order
    pub fn users_of(&self, value: &Value) -> Vec<InstId> {
        self.instructions()
            .into_iter()
            .filter(|&i| {
                let mut found = false;
                self.inst(i).kind.for_each_operand(|v| found |= v == value);
                found
            })
            .collect()
    }

    /// Redirect every use of `old` to `new`, returning how many operands changed
    pub fn replace_all_uses_with(&mut self, old: &Value, new: &Value) -> usize {
        let mut count = 0;
        for i in self.instructions() {
            self.inst_mut(i).kind.for_each_operand_mut(|v| {
                if v == old {
                    *v = new.clone();
                    count += 1;
                }
            });
        }
        count
    }

    /// Users of every instruction result, computed in a single scan. An instruction appears once
    /// per user even if it is used by several operands of that user.
    pub fn user_index(&self) -> UnorderedMap<InstId, Vec<InstId>> {
        let mut index: UnorderedMap<InstId, Vec<InstId>> = UnorderedMap::new();
        for i in self.instructions() {
            let mut used = vec![];
            self.inst(i).kind.for_each_operand(|v| {
                if let Value::Inst(d) = v {
                    if !used.contains(d) {
                        used.push(*d);
                    }
                }
            });
            for d in used {
                index.entry(d).or_default().push(i);
            }
        }
        index
    }

    /// Like [`Function::replace_all_uses_with`], but only rewrites operands of `users`. Users that
    /// have been erased in the meantime are skipped.
    pub fn replace_uses_in(&mut self, users: &[InstId], old: &Value, new: &Value) -> usize {
        let mut count = 0;
        for &i in users {
            if !self.inst_exists(i) {
                continue;
            }
            self.inst_mut(i).kind.for_each_operand_mut(|v| {
                if v == old {
                    *v = new.clone();
                    count += 1;
                }
            });
        }
        count
    }

    /// Apply a whole set of replacements in one pass over the function. Replacements that are
    /// themselves replaced are followed to the end of the chain.
    pub fn replace_uses_with_map(&mut self, map: &UnorderedMap<Value, Value>) -> usize {
        if map.is_empty() {
            return 0;
        }
        let mut count = 0;
        for i in self.instructions() {
            self.inst_mut(i).kind.for_each_operand_mut(|v| {
                if let Some(mut new) = map.get(&*v) {
                    while let Some(next) = map.get(new) {
                        if next == new {
                            break;
                        }
                        new = next;
                    }
                    *v = new.clone();
                    count += 1;
                }
            });
        }
        count
    }

    /// Replace all block references to `old` with `new` in terminators and phis
    pub fn replace_block_uses(&mut self, old: BlockId, new: BlockId) {
        for i in self.instructions() {
            self.inst_mut(i).kind.for_each_block_mut(|b| {
                if *b == old {
                    *b = new;
                }
            });
        }
    }

    /// Drop the body, turning the function back into a declaration
    pub fn clear_body(&mut self) {
        self.blocks.clear();
        self.layout.clear();
        self.insts.clear();
    }
}

/// A global variable
#[derive(Clone, Debug)]
pub struct GlobalVariable {
    pub name: String,
    /// The type of the value stored in the variable; the variable itself is a pointer.
    pub ty: Type,
    /// Must be a constant value if present
    pub initializer: Option<Value>,
    /// A fixed location in the original binary's address space
    pub address: Option<u64>,
    pub linkage: Linkage,
    pub is_constant: bool,
}

impl GlobalVariable {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
            initializer: None,
            address: None,
            linkage: Linkage::External,
            is_constant: false,
        }
    }
}

/// A whole translation unit
#[derive(Clone, Debug)]
pub struct Module {
    pub name: String,
    pub data_layout: DataLayout,
    functions: Vec<Option<Function>>,
    globals: Vec<Option<GlobalVariable>>,
    /// Values that are pinned against removal by dead-code elimination
    pub used: Option<Vec<Value>>,
}

impl Module {
    pub fn new(name: impl Into<String>, pointer_bits: u32) -> Self {
        assert!(
            matches!(pointer_bits, 16 | 32 | 64),
            "Unsupported pointer size {}",
            pointer_bits
        );
        Self {
            name: name.into(),
            data_layout: DataLayout { pointer_bits },
            functions: vec![],
            globals: vec![],
            used: None,
        }
    }

    /// Add a function; its name must be unique within the module
    pub fn add_function(&mut self, f: Function) -> FuncId {
        assert!(
            self.get_function(&f.name).is_none(),
            "Duplicate function {}",
            f.name
        );
        self.functions.push(Some(f));
        FuncId(self.functions.len() - 1)
    }

    pub fn get_function(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| matches!(f, Some(f) if f.name == name))
            .map(FuncId)
    }

    pub fn function(&self, id: FuncId) -> &Function {
        self.functions[id.0]
            .as_ref()
            .unwrap_or_else(|| panic!("Use of removed function {:?}", id))
    }

    pub fn function_mut(&mut self, id: FuncId) -> &mut Function {
        self.functions[id.0]
            .as_mut()
            .unwrap_or_else(|| panic!("Use of removed function {:?}", id))
    }

    pub fn function_exists(&self, id: FuncId) -> bool {
        matches!(self.functions.get(id.0), Some(Some(_)))
    }

    /// Live functions, in creation order
    pub fn function_ids(&self) -> Vec<FuncId> {
        (0..self.functions.len())
            .filter(|&i| self.functions[i].is_some())
            .map(FuncId)
            .collect()
    }

    /// Remove a function. Callers must make sure nothing refers to it anymore.
    pub fn remove_function(&mut self, id: FuncId) -> Function {
        self.functions[id.0]
            .take()
            .unwrap_or_else(|| panic!("Double removal of function {:?}", id))
    }

    /// Add a global; its name must be unique within the module
    pub fn add_global(&mut self, g: GlobalVariable) -> GlobalId {
        assert!(
            self.get_global(&g.name).is_none(),
            "Duplicate global {}",
            g.name
        );
        self.globals.push(Some(g));
        GlobalId(self.globals.len() - 1)
    }

    pub fn get_global(&self, name: &str) -> Option<GlobalId> {
        self.globals
            .iter()
            .position(|g| matches!(g, Some(g) if g.name == name))
            .map(GlobalId)
    }

    pub fn global(&self, id: GlobalId) -> &GlobalVariable {
        self.globals[id.0]
            .as_ref()
            .unwrap_or_else(|| panic!("Use of removed global {:?}", id))
    }

    pub fn global_mut(&mut self, id: GlobalId) -> &mut GlobalVariable {
        self.globals[id.0]
            .as_mut()
            .unwrap_or_else(|| panic!("Use of removed global {:?}", id))
    }

    pub fn global_exists(&self, id: GlobalId) -> bool {
        matches!(self.globals.get(id.0), Some(Some(_)))
    }

    /// Live globals, in creation order
    pub fn global_ids(&self) -> Vec<GlobalId> {
        (0..self.globals.len())
            .filter(|&i| self.globals[i].is_some())
            .map(GlobalId)
            .collect()
    }

    /// Remove a global. Callers must make sure nothing refers to it anymore.
    pub fn remove_global(&mut self, id: GlobalId) -> GlobalVariable {
        self.globals[id.0]
            .take()
            .unwrap_or_else(|| panic!("Double removal of global {:?}", id))
    }

    /// The type of `value` when used inside function `func`
    pub fn value_type(&self, func: FuncId, value: &Value) -> Type {
        match value {
            Value::Int { bits, .. } => Type::Int(*bits),
            Value::Float { kind, .. } => Type::Float(*kind),
            Value::Undef(t) => t.clone(),
            Value::Null | Value::Global(_) | Value::Function(_) => Type::Ptr,
            Value::GlobalAddr(_) => self.data_layout.address_type(),
            Value::Arg(i) => self.function(func).ty.params[*i].clone(),
            Value::Inst(i) => self.function(func).inst(*i).ty.clone(),
        }
    }

    /// Direct calls to `f`, across the whole module
    pub fn callers_of(&self, f: FuncId) -> Vec<(FuncId, InstId)> {
        let mut res = vec![];
        for caller in self.function_ids() {
            let func = self.function(caller);
            for i in func.instructions() {
                if func.inst(i).kind.called_function() == Some(f) {
                    res.push((caller, i));
                }
            }
        }
        res
    }

    /// Count the references to anything matching `is_ref` from instruction operands, from the
    /// initializers of globals other than `except`, and from the used list.
    fn count_references(&self, except: Option<GlobalId>, is_ref: impl Fn(&Value) -> bool) -> usize {
        let mut count = 0;
        for f in self.function_ids() {
            let func = self.function(f);
            for i in func.instructions() {
                func.inst(i).kind.for_each_operand(|v| {
                    if is_ref(v) {
                        count += 1;
                    }
                });
            }
        }
        for g in self.global_ids() {
            if Some(g) == except {
                continue;
            }
            if let Some(init) = &self.global(g).initializer {
                if is_ref(init) {
                    count += 1;
                }
            }
        }
        if let Some(used) = &self.used {
            count += used.iter().filter(|v| is_ref(v)).count();
        }
        count
    }

    /// Number of uses of function `f`, as a callee or as a value
    pub fn function_use_count(&self, f: FuncId) -> usize {
        self.count_references(None, |v| *v == Value::Function(f))
    }

    /// Number of uses of global `g` from outside itself. A global's own initializer refers to
    /// something else, never to the global itself, so it is not counted here.
    pub fn global_use_count(&self, g: GlobalId) -> usize {
        self.count_references(Some(g), |v| {
            matches!(v, Value::Global(x) | Value::GlobalAddr(x) if *x == g)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn tiny_function() -> (Function, BlockId, InstId, InstId) {
        let mut f = Function::new("tiny", vec![Type::Int(32)], Type::Int(32));
        let entry = f.add_block("entry");
        let add = f.append_inst(
            entry,
            InstKind::Binary {
                op: BinOp::Add,
                lhs: Value::Arg(0),
                rhs: Value::int(1, 32),
            },
            Type::Int(32),
        );
        let ret = f.append_inst(
            entry,
            InstKind::Ret {
                value: Some(Value::Inst(add)),
            },
            Type::Void,
        );
        (f, entry, add, ret)
    }

    #[test]
    fn constants_are_kept_truncated() {
        assert_eq!(Value::int(0x1ff, 8), Value::Int { value: 0xff, bits: 8 });
        assert_eq!(sign_extend_from_bits(0xff, 8), -1);
        assert_eq!(truncate_to_bits(u64::MAX, 64), u64::MAX);
    }

    #[test]
    fn users_and_replacement() {
        let (mut f, _entry, add, ret) = tiny_function();
        assert_eq!(f.users_of(&Value::Inst(add)), vec![ret]);
        assert_eq!(f.users_of(&Value::Arg(0)), vec![add]);
        assert_eq!(
            f.replace_all_uses_with(&Value::Inst(add), &Value::Arg(0)),
            1
        );
        assert!(f.users_of(&Value::Inst(add)).is_empty());
        f.erase_inst(add);
        assert_eq!(f.instructions(), vec![ret]);
        assert!(!f.inst_exists(add));
    }

    #[test]
    fn batched_replacement_follows_chains() {
        let (mut f, _entry, add, ret) = tiny_function();
        let mul = f.insert_inst_before(
            ret,
            InstKind::Binary {
                op: BinOp::Mul,
                lhs: Value::Inst(add),
                rhs: Value::Inst(add),
            },
            Type::Int(32),
        );
        f.inst_mut(ret).kind = InstKind::Ret {
            value: Some(Value::Inst(mul)),
        };
        let index = f.user_index();
        assert_eq!(index[&add], vec![mul]);
        assert_eq!(index[&mul], vec![ret]);
        assert!(index.get(&ret).is_none());

        let mut map = UnorderedMap::new();
        map.insert(Value::Inst(mul), Value::Inst(add));
        map.insert(Value::Inst(add), Value::Arg(0));
        assert_eq!(f.replace_uses_with_map(&map), 3);
        assert_eq!(
            f.inst(ret).kind,
            InstKind::Ret {
                value: Some(Value::Arg(0))
            }
        );

        f.erase_inst(mul);
        assert_eq!(
            f.replace_uses_in(&index[&add], &Value::Arg(0), &Value::int(7, 32)),
            0
        );
    }

    #[test]
    fn insertion_and_terminators() {
        let (mut f, entry, add, ret) = tiny_function();
        let sub = f.insert_inst_before(
            add,
            InstKind::Binary {
                op: BinOp::Sub,
                lhs: Value::Arg(0),
                rhs: Value::int(2, 32),
            },
            Type::Int(32),
        );
        assert_eq!(f.block(entry).insts(), &[sub, add, ret]);
        assert_eq!(f.terminator(entry), Some(ret));
        assert!(f.successors(entry).is_empty());
    }

    #[test]
    fn use_counts_span_functions_globals_and_used_list() {
        let mut m = Module::new("m", 32);
        let (f, ..) = tiny_function();
        let tiny = m.add_function(f);
        let mut g = GlobalVariable::new("ISEL_tiny", Type::Ptr);
        g.initializer = Some(Value::Function(tiny));
        let isel = m.add_global(g);
        assert_eq!(m.function_use_count(tiny), 1);
        assert_eq!(m.global_use_count(isel), 0);
        m.used = Some(vec![Value::Global(isel)]);
        assert_eq!(m.global_use_count(isel), 1);
        assert_eq!(m.value_type(tiny, &Value::GlobalAddr(isel)), Type::Int(32));
    }
}
