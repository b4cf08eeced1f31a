//! Names and signatures of the scaffolding the semantics library leaves in a lifted module.
//!
//! Semantic functions never touch memory directly: they call the memory-access placeholders
//! below, threading a memory-state token (of type [`Type::memory`]) through every access. The
//! module optimizer eventually lowers all of these away.

use crate::ir::{FloatKind, Function, Type};

/// Canonical lifted function; its signature is the signature of every lifted block and semantic
/// function.
pub const BASIC_BLOCK: &str = "__lift_basic_block";
/// Called with everything that must survive dead-code elimination while lifting
pub const MARK_AS_USED: &str = "__lift_mark_as_used";
/// Holds calls to every intrinsic, so that none is dropped before lifting is done
pub const INTRINSICS: &str = "__lift_intrinsics";
pub const DEFER_INLINING: &str = "__lift_defer_inlining";
pub const FUNCTION_RETURN: &str = "__lift_function_return";

/// Scaffolding functions removed once they have no callers, in removal order
pub const SCAFFOLDING_FUNCTIONS: [&str; 5] = [
    INTRINSICS,
    BASIC_BLOCK,
    MARK_AS_USED,
    DEFER_INLINING,
    FUNCTION_RETURN,
];

/// Prefix of selector globals, followed by the semantics selector name of an instruction
pub const SELECTOR_PREFIX: &str = "ISEL_";

/// Name of the register slot holding the current memory-state token
pub const MEMORY_REGISTER: &str = "MEMORY";

/// Memory-ordering barriers; each takes and returns the memory-state token
pub const BARRIERS: [&str; 6] = [
    "__lift_barrier_load_load",
    "__lift_barrier_load_store",
    "__lift_barrier_store_load",
    "__lift_barrier_store_store",
    "__lift_barrier_atomic_begin",
    "__lift_barrier_atomic_end",
];

/// A memory-access placeholder of a particular width
#[derive(Clone, Debug)]
pub struct MemoryAccess {
    /// `__lift_read_memory_<suffix>`, with signature `(&Memory, addr) -> ty`
    pub read: String,
    /// `__lift_write_memory_<suffix>`, with signature `(&Memory, addr, ty) -> &Memory`
    pub write: String,
    /// Type seen by lifted code
    pub ty: Type,
    /// Type actually held in memory; differs from `ty` only for extended precision, which lifted
    /// code handles as `f64`
    pub memory_ty: Type,
}

/// "Undefined value of width W" placeholders
#[derive(Clone, Debug)]
pub struct UndefinedValue {
    pub name: String,
    pub ty: Type,
}

lazy_static::lazy_static! {
    /// All memory-access placeholders, in the order they are lowered
    pub static ref MEMORY_ACCESSES: Vec<MemoryAccess> = {
        let int = |bits: u32| (format!("{}", bits), Type::Int(bits), Type::Int(bits));
        let float = |kind: FloatKind| {
            (format!("f{}", kind.bits()), Type::Float(kind), Type::Float(kind))
        };
        [
            int(8),
            int(16),
            int(32),
            int(64),
            float(FloatKind::F32),
            float(FloatKind::F64),
            (
                "f80".to_owned(),
                Type::Float(FloatKind::F64),
                Type::Float(FloatKind::F80),
            ),
        ]
        .into_iter()
        .map(|(suffix, ty, memory_ty)| MemoryAccess {
            read: format!("__lift_read_memory_{}", suffix),
            write: format!("__lift_write_memory_{}", suffix),
            ty,
            memory_ty,
        })
        .collect()
    };

    /// All undefined-value placeholders
    pub static ref UNDEFINED_VALUES: Vec<UndefinedValue> = [
        ("8", Type::Int(8)),
        ("16", Type::Int(16)),
        ("32", Type::Int(32)),
        ("64", Type::Int(64)),
        ("f32", Type::Float(FloatKind::F32)),
        ("f64", Type::Float(FloatKind::F64)),
    ]
    .into_iter()
    .map(|(suffix, ty)| UndefinedValue {
        name: format!("__lift_undefined_{}", suffix),
        ty,
    })
    .collect();
}

/// Declarations of every memory, barrier and undefined-value placeholder, for a target whose
/// addresses are `address_bits` wide.
pub fn declarations(address_bits: u32) -> Vec<Function> {
    let addr = Type::Int(address_bits);
    let mut res = vec![];
    for access in MEMORY_ACCESSES.iter() {
        res.push(Function::new(
            access.read.clone(),
            vec![Type::memory(), addr.clone()],
            access.ty.clone(),
        ));
        res.push(Function::new(
            access.write.clone(),
            vec![Type::memory(), addr.clone(), access.ty.clone()],
            Type::memory(),
        ));
    }
    for barrier in BARRIERS {
        res.push(Function::new(barrier, vec![Type::memory()], Type::memory()));
    }
    for undef in UNDEFINED_VALUES.iter() {
        res.push(Function::new(undef.name.clone(), vec![], undef.ty.clone()));
    }
    res
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extended_precision_is_the_only_width_mismatch() {
        assert_eq!(MEMORY_ACCESSES.len(), 7);
        let mismatched: Vec<_> = MEMORY_ACCESSES
            .iter()
            .filter(|a| a.ty != a.memory_ty)
            .map(|a| a.read.as_str())
            .collect();
        assert_eq!(mismatched, vec!["__lift_read_memory_f80"]);
        assert_eq!(declarations(32).len(), 7 * 2 + 6 + 6);
    }
}
