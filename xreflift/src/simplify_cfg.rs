//! Control-flow simplification: branches on known conditions, and straight-line block chains.

use crate::ir::{BlockId, Function, InstKind, Module, Value};
use crate::log::*;

/// Drop the phi entries of `block` that flow in from `pred`
fn remove_phi_entries(func: &mut Function, block: BlockId, pred: BlockId) {
    for i in func.block(block).insts().to_vec() {
        if let InstKind::Phi { incoming } = &mut func.inst_mut(i).kind {
            incoming.retain(|(_, b)| *b != pred);
        }
    }
}

/// Turn conditional branches on constants (or to a single target) into unconditional ones.
pub fn fold_branches(func: &mut Function) -> bool {
    let mut changed = false;
    for b in func.block_ids() {
        let t = match func.terminator(b) {
            Some(t) => t,
            None => continue,
        };
        let (cond, on_true, on_false) = match &func.inst(t).kind {
            InstKind::CondBr {
                cond,
                on_true,
                on_false,
            } => (cond.clone(), *on_true, *on_false),
            _ => continue,
        };
        let (taken, dropped) = if on_true == on_false {
            (on_true, None)
        } else {
            match cond.as_int() {
                Some((0, _)) => (on_false, Some(on_true)),
                Some(_) => (on_true, Some(on_false)),
                None => continue,
            }
        };
        trace!("Folding conditional branch"; "function" => &func.name, "block" => &func.block(b).name);
        func.inst_mut(t).kind = InstKind::Br { target: taken };
        if let Some(dropped) = dropped {
            remove_phi_entries(func, dropped, b);
        }
        changed = true;
    }
    changed
}

/// Merge every block that is the only successor of its single predecessor into that
/// predecessor.
pub fn merge_blocks(func: &mut Function) -> bool {
    let mut changed = false;
    'restart: loop {
        let entry = match func.entry_block() {
            Some(e) => e,
            None => return changed,
        };
        for b in func.block_ids() {
            let t = match func.terminator(b) {
                Some(t) => t,
                None => continue,
            };
            let succ = match func.inst(t).kind {
                InstKind::Br { target } => target,
                _ => continue,
            };
            if succ == b || succ == entry || func.predecessors(succ) != vec![b] {
                continue;
            }

            // With a single predecessor, every phi has exactly one meaningful value
            for i in func.block(succ).insts().to_vec() {
                let v = match &func.inst(i).kind {
                    InstKind::Phi { incoming } => match incoming.first() {
                        Some((v, _)) => v.clone(),
                        None => Value::Undef(func.inst(i).ty.clone()),
                    },
                    _ => break,
                };
                func.replace_all_uses_with(&Value::Inst(i), &v);
                func.erase_inst(i);
            }

            trace!("Merging blocks"; "function" => &func.name, "into" => &func.block(b).name, "from" => &func.block(succ).name);
            func.erase_inst(t);
            func.move_insts_from(succ, 0, b);
            func.replace_block_uses(succ, b);
            func.remove_block(succ);
            changed = true;
            continue 'restart;
        }
        return changed;
    }
}

pub fn run(module: &mut Module) -> bool {
    let mut changed = false;
    for f in module.function_ids() {
        let func = module.function_mut(f);
        changed |= fold_branches(func);
        changed |= merge_blocks(func);
    }
    changed
}

/// Whether every block ends in a terminator, and only there
pub fn is_well_formed(func: &Function) -> bool {
    func.block_ids().into_iter().all(|b| {
        let insts = func.block(b).insts();
        match insts.split_last() {
            Some((&last, rest)) => {
                func.inst(last).kind.is_terminator()
                    && rest.iter().all(|&i| !func.inst(i).kind.is_terminator())
            }
            None => false,
        }
    })
}
