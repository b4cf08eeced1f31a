//! Constant folding, both on demand (the [`Builder`](crate::ir_builder::Builder) folds as it
//! emits) and as a pass over a whole module.

use crate::ir::{
    sign_extend_from_bits, BinOp, CastOp, CmpPred, DataLayout, FloatKind,
    InstKind, Module, Type, Value,
};
use crate::log::*;

/// Round `v` to the precision of `kind`. Extended precision is modelled as `f64`.
fn round_to(v: f64, kind: FloatKind) -> f64 {
    match kind {
        FloatKind::F32 => v as f32 as f64,
        FloatKind::F64 | FloatKind::F80 => v,
    }
}

/// The result of `lhs op rhs`, if it can be computed now.
pub fn fold_binary(op: BinOp, lhs: &Value, rhs: &Value) -> Option<Value> {
    if let (Some((a, bits)), Some((b, bits_b))) = (lhs.as_int(), rhs.as_int()) {
        if bits != bits_b {
            return None;
        }
        let sa = sign_extend_from_bits(a, bits);
        let sb = sign_extend_from_bits(b, bits);
        let r = match op {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::UDiv if b != 0 => a / b,
            BinOp::SDiv if b != 0 => sa.wrapping_div(sb) as u64,
            BinOp::URem if b != 0 => a % b,
            BinOp::SRem if b != 0 => sa.wrapping_rem(sb) as u64,
            BinOp::And => a & b,
            BinOp::Or => a | b,
            BinOp::Xor => a ^ b,
            BinOp::Shl if b < bits as u64 => a << b,
            BinOp::LShr if b < bits as u64 => a >> b,
            BinOp::AShr if b < bits as u64 => (sa >> b) as u64,
            _ => return None,
        };
        return Some(Value::int(r, bits));
    }
    if let (Some((a, kind)), Some((b, kind_b))) = (lhs.as_float(), rhs.as_float()) {
        if kind != kind_b {
            return None;
        }
        let r = match op {
            BinOp::FAdd => a + b,
            BinOp::FSub => a - b,
            BinOp::FMul => a * b,
            BinOp::FDiv => a / b,
            _ => return None,
        };
        return Some(Value::float(round_to(r, kind), kind));
    }
    fold_identity(op, lhs, rhs)
}

/// Algebraic identities where only one side is known
fn fold_identity(op: BinOp, lhs: &Value, rhs: &Value) -> Option<Value> {
    let is = |v: &Value, c: u64| matches!(v.as_int(), Some((x, _)) if x == c);
    match op {
        BinOp::Add | BinOp::Or | BinOp::Xor if is(rhs, 0) => Some(lhs.clone()),
        BinOp::Add | BinOp::Or | BinOp::Xor if is(lhs, 0) => Some(rhs.clone()),
        BinOp::Sub | BinOp::Shl | BinOp::LShr | BinOp::AShr if is(rhs, 0) => Some(lhs.clone()),
        BinOp::Mul if is(rhs, 1) => Some(lhs.clone()),
        BinOp::Mul if is(lhs, 1) => Some(rhs.clone()),
        BinOp::UDiv | BinOp::SDiv if is(rhs, 1) => Some(lhs.clone()),
        BinOp::Mul | BinOp::And if is(rhs, 0) => rhs.as_int().map(|(_, b)| Value::int(0, b)),
        BinOp::Mul | BinOp::And if is(lhs, 0) => lhs.as_int().map(|(_, b)| Value::int(0, b)),
        _ => None,
    }
}

/// The result of comparing `lhs` and `rhs`, if it can be computed now.
pub fn fold_cmp(pred: CmpPred, lhs: &Value, rhs: &Value) -> Option<Value> {
    let r = if let (Some((a, bits)), Some((b, _))) = (lhs.as_int(), rhs.as_int()) {
        let (sa, sb) = (sign_extend_from_bits(a, bits), sign_extend_from_bits(b, bits));
        match pred {
            CmpPred::Eq => a == b,
            CmpPred::Ne => a != b,
            CmpPred::Ult => a < b,
            CmpPred::Ule => a <= b,
            CmpPred::Ugt => a > b,
            CmpPred::Uge => a >= b,
            CmpPred::Slt => sa < sb,
            CmpPred::Sle => sa <= sb,
            CmpPred::Sgt => sa > sb,
            CmpPred::Sge => sa >= sb,
            _ => return None,
        }
    } else if let (Some((a, _)), Some((b, _))) = (lhs.as_float(), rhs.as_float()) {
        match pred {
            CmpPred::FOeq => a == b,
            CmpPred::FOne => !a.is_nan() && !b.is_nan() && a != b,
            CmpPred::FOlt => a < b,
            CmpPred::FOle => a <= b,
            CmpPred::FOgt => a > b,
            CmpPred::FOge => a >= b,
            CmpPred::FUno => a.is_nan() || b.is_nan(),
            _ => return None,
        }
    } else {
        return None;
    };
    Some(Value::int(r as u64, 1))
}

/// The result of converting `value` to `to`, if it can be computed now.
pub fn fold_cast(op: CastOp, value: &Value, to: &Type, layout: &DataLayout) -> Option<Value> {
    if value.is_undef() {
        return Some(Value::Undef(to.clone()));
    }
    match (op, value, to) {
        (CastOp::Trunc | CastOp::ZExt, Value::Int { value, .. }, Type::Int(bits)) => {
            Some(Value::int(*value, *bits))
        }
        (CastOp::SExt, Value::Int { value, bits: from }, Type::Int(bits)) => Some(Value::int(
            sign_extend_from_bits(*value, *from) as u64,
            *bits,
        )),
        (CastOp::FpTrunc | CastOp::FpExt, Value::Float { .. }, Type::Float(kind)) => {
            let (v, _) = value.as_float()?;
            Some(Value::float(round_to(v, *kind), *kind))
        }
        (CastOp::FpToSi, Value::Float { .. }, Type::Int(bits)) => {
            let (v, _) = value.as_float()?;
            v.is_finite().then(|| Value::int(v.trunc() as i64 as u64, *bits))
        }
        (CastOp::SiToFp, Value::Int { value, bits }, Type::Float(kind)) => Some(Value::float(
            round_to(sign_extend_from_bits(*value, *bits) as f64, *kind),
            *kind,
        )),
        (CastOp::PtrToInt, Value::Global(g), Type::Int(bits)) if *bits == layout.pointer_bits => {
            Some(Value::GlobalAddr(*g))
        }
        (CastOp::PtrToInt, Value::Null, Type::Int(bits)) => Some(Value::int(0, *bits)),
        (CastOp::IntToPtr, Value::GlobalAddr(g), Type::Ptr) => Some(Value::Global(*g)),
        (CastOp::IntToPtr, Value::Int { value: 0, .. }, Type::Ptr) => Some(Value::Null),
        _ => None,
    }
}

/// The value an instruction is known to evaluate to, if any. Instructions with side effects
/// never fold.
pub fn fold_instruction(kind: &InstKind, ty: &Type, layout: &DataLayout) -> Option<Value> {
    match kind {
        InstKind::Binary { op, lhs, rhs } => fold_binary(*op, lhs, rhs),
        InstKind::Cmp { pred, lhs, rhs } => fold_cmp(*pred, lhs, rhs),
        InstKind::Cast { op, value } => fold_cast(*op, value, ty, layout),
        InstKind::Select {
            cond,
            on_true,
            on_false,
        } => match cond.as_int() {
            Some((0, _)) => Some(on_false.clone()),
            Some(_) => Some(on_true.clone()),
            None if on_true == on_false => Some(on_true.clone()),
            None => None,
        },
        _ => None,
    }
}

/// Fold every foldable instruction in the module, replacing its uses with the folded value.
/// Returns whether anything changed.
pub fn run(module: &mut Module) -> bool {
    let layout = module.data_layout;
    let mut changed = false;
    for f in module.function_ids() {
        let func = module.function_mut(f);
        // Folding one instruction can make its users foldable, so go around until nothing moves.
        loop {
            let mut folded_any = false;
            for i in func.instructions() {
                let data = func.inst(i);
                let folded = match &data.kind {
                    InstKind::Phi { incoming } => {
                        let mut vals = incoming
                            .iter()
                            .map(|(v, _)| v)
                            .filter(|v| **v != Value::Inst(i));
                        match vals.next() {
                            Some(first) if vals.all(|v| v == first) => Some(first.clone()),
                            _ => None,
                        }
                    }
                    kind => fold_instruction(kind, &data.ty, &layout),
                };
                if let Some(v) = folded {
                    trace!("Folded instruction"; "function" => &func.name, "inst" => i.index(), "value" => ?v);
                    func.replace_all_uses_with(&Value::Inst(i), &v);
                    func.erase_inst(i);
                    folded_any = true;
                }
            }
            if !folded_any {
                break;
            }
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::GlobalId;

    const L32: DataLayout = DataLayout { pointer_bits: 32 };

    #[test]
    fn integer_arithmetic_wraps_at_width() {
        assert_eq!(
            fold_binary(BinOp::Add, &Value::int(0xff, 8), &Value::int(1, 8)),
            Some(Value::int(0, 8))
        );
        assert_eq!(
            fold_binary(BinOp::AShr, &Value::int(0x80, 8), &Value::int(7, 8)),
            Some(Value::int(0xff, 8))
        );
        assert_eq!(
            fold_binary(BinOp::UDiv, &Value::int(1, 8), &Value::int(0, 8)),
            None
        );
    }

    #[test]
    fn identities_keep_the_unknown_side() {
        assert_eq!(
            fold_binary(BinOp::Add, &Value::Arg(0), &Value::int(0, 32)),
            Some(Value::Arg(0))
        );
        assert_eq!(
            fold_binary(BinOp::And, &Value::Arg(0), &Value::int(0, 32)),
            Some(Value::int(0, 32))
        );
        assert_eq!(fold_binary(BinOp::Sub, &Value::int(0, 32), &Value::Arg(0)), None);
    }

    #[test]
    fn signed_and_unsigned_comparisons_differ() {
        let (a, b) = (Value::int(0xff, 8), Value::int(1, 8));
        assert_eq!(fold_cmp(CmpPred::Ugt, &a, &b), Some(Value::int(1, 1)));
        assert_eq!(fold_cmp(CmpPred::Sgt, &a, &b), Some(Value::int(0, 1)));
    }

    #[test]
    fn casts() {
        assert_eq!(
            fold_cast(CastOp::SExt, &Value::int(0x80, 8), &Type::Int(16), &L32),
            Some(Value::int(0xff80, 16))
        );
        assert_eq!(
            fold_cast(CastOp::Trunc, &Value::int(0x1234, 16), &Type::Int(8), &L32),
            Some(Value::int(0x34, 8))
        );
        assert_eq!(
            fold_cast(CastOp::PtrToInt, &Value::Global(GlobalId(3)), &Type::Int(32), &L32),
            Some(Value::GlobalAddr(GlobalId(3)))
        );
        assert_eq!(
            fold_cast(CastOp::ZExt, &Value::Undef(Type::Int(8)), &Type::Int(32), &L32),
            Some(Value::Undef(Type::Int(32)))
        );
    }
}
