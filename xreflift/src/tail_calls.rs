//! Marks calls in tail position, so that code generation may turn them into jumps.

use crate::ir::{Function, InstKind, Module, Value};
use crate::log::*;

/// Mark every call that is immediately followed by a return of its result (or by a `void`
/// return) as a tail call. Returns whether any call was newly marked.
pub fn mark_tail_calls(func: &mut Function) -> bool {
    let mut changed = false;
    for b in func.block_ids() {
        let insts = func.block(b).insts();
        let (call, ret) = match insts {
            [.., call, ret] => (*call, *ret),
            _ => continue,
        };
        let returns_result = match &func.inst(ret).kind {
            InstKind::Ret { value: None } => true,
            InstKind::Ret { value: Some(v) } => *v == Value::Inst(call),
            _ => false,
        };
        if !returns_result {
            continue;
        }
        if let InstKind::Call { tail, .. } = &mut func.inst_mut(call).kind {
            if !*tail {
                *tail = true;
                changed = true;
                trace!("Marked tail call"; "function" => &func.name);
            }
        }
    }
    changed
}

pub fn run(module: &mut Module) -> bool {
    let mut changed = false;
    for f in module.function_ids() {
        changed |= mark_tail_calls(module.function_mut(f));
    }
    changed
}
