//! Convenient emission of instructions into a function, folding constants as they are built.

use crate::constant_folding::{fold_binary, fold_cast, fold_cmp};
use crate::ir::{
    BinOp, BlockId, CastOp, CmpPred, FuncId, InstId, InstKind, Module, Type, Value,
};

/// A basic block of a particular function of a module
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct BlockRef {
    pub func: FuncId,
    pub block: BlockId,
}

/// Where a [`Builder`] places new instructions
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InsertPoint {
    /// At the end of the block
    End(BlockId),
    /// Immediately before the instruction
    Before(InstId),
}

/// Emits instructions at an insertion point. Operations whose operands are all known are folded
/// into constants rather than emitted.
pub struct Builder<'m> {
    module: &'m mut Module,
    func: FuncId,
    point: InsertPoint,
}

impl<'m> Builder<'m> {
    /// Build at the end of `block`
    pub fn at_end(module: &'m mut Module, block: BlockRef) -> Self {
        Self {
            module,
            func: block.func,
            point: InsertPoint::End(block.block),
        }
    }

    /// Build right before `inst` of function `func`
    pub fn before(module: &'m mut Module, func: FuncId, inst: InstId) -> Self {
        Self {
            module,
            func,
            point: InsertPoint::Before(inst),
        }
    }

    pub fn module(&self) -> &Module {
        self.module
    }

    pub fn func(&self) -> FuncId {
        self.func
    }

    pub fn type_of(&self, v: &Value) -> Type {
        self.module.value_type(self.func, v)
    }

    /// Emit an instruction without attempting to fold it
    pub fn insert(&mut self, kind: InstKind, ty: Type) -> InstId {
        let func = self.module.function_mut(self.func);
        match self.point {
            InsertPoint::End(b) => func.append_inst(b, kind, ty),
            InsertPoint::Before(i) => func.insert_inst_before(i, kind, ty),
        }
    }

    pub fn binary(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Value {
        if let Some(v) = fold_binary(op, &lhs, &rhs) {
            return v;
        }
        let ty = self.type_of(&lhs);
        Value::Inst(self.insert(InstKind::Binary { op, lhs, rhs }, ty))
    }

    pub fn add(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Add, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Mul, lhs, rhs)
    }

    pub fn cmp(&mut self, pred: CmpPred, lhs: Value, rhs: Value) -> Value {
        if let Some(v) = fold_cmp(pred, &lhs, &rhs) {
            return v;
        }
        Value::Inst(self.insert(InstKind::Cmp { pred, lhs, rhs }, Type::Int(1)))
    }

    /// Convert `value` to `ty`. Converting to the type `value` already has is a no-op.
    pub fn cast(&mut self, op: CastOp, value: Value, ty: Type) -> Value {
        if self.type_of(&value) == ty {
            return value;
        }
        if let Some(v) = fold_cast(op, &value, &ty, &self.module.data_layout) {
            return v;
        }
        Value::Inst(self.insert(InstKind::Cast { op, value }, ty))
    }

    pub fn trunc(&mut self, value: Value, ty: Type) -> Value {
        self.cast(CastOp::Trunc, value, ty)
    }

    pub fn int_to_ptr(&mut self, value: Value) -> Value {
        self.cast(CastOp::IntToPtr, value, Type::Ptr)
    }

    pub fn load(&mut self, ty: Type, addr: Value) -> Value {
        Value::Inst(self.insert(InstKind::Load { addr }, ty))
    }

    pub fn store(&mut self, value: Value, addr: Value) -> InstId {
        self.insert(InstKind::Store { value, addr }, Type::Void)
    }

    /// Call `callee` directly. The result is a value even for `void` functions; it simply has no
    /// users then.
    pub fn call(&mut self, callee: FuncId, args: Vec<Value>) -> Value {
        let ty = self.module.function(callee).ty.ret.clone();
        Value::Inst(self.insert(
            InstKind::Call {
                callee: Value::Function(callee),
                args,
                tail: false,
            },
            ty,
        ))
    }

    /// The address of register `name` within the processor state `state`
    pub fn register_slot(&mut self, state: Value, name: &str) -> Value {
        Value::Inst(self.insert(
            InstKind::RegisterSlot {
                state,
                name: name.to_owned(),
            },
            Type::Ptr,
        ))
    }

    pub fn br(&mut self, target: BlockId) -> InstId {
        self.insert(InstKind::Br { target }, Type::Void)
    }

    pub fn cond_br(&mut self, cond: Value, on_true: BlockId, on_false: BlockId) -> InstId {
        self.insert(
            InstKind::CondBr {
                cond,
                on_true,
                on_false,
            },
            Type::Void,
        )
    }

    pub fn ret(&mut self, value: Option<Value>) -> InstId {
        self.insert(InstKind::Ret { value }, Type::Void)
    }
}
