//! Dead-code elimination, at the level of instructions, blocks, and whole functions and globals.

use crate::containers::unordered::UnorderedSet;
use crate::containers::WorkList;
use crate::ir::{FnAttr, FuncId, Function, InstId, InstKind, Linkage, Module, Value};
use crate::log::*;

/// Whether `kind` can be removed once nothing uses its result
fn is_trivially_dead_kind(module: &Module, kind: &InstKind) -> bool {
    match kind {
        InstKind::Call { .. } => match kind.called_function() {
            Some(f) => module.function(f).attrs.contains(&FnAttr::ReadNone),
            None => false,
        },
        k => !k.has_side_effects(),
    }
}

/// Instructions used as an operand anywhere in `func`
fn used_instructions(func: &Function) -> UnorderedSet<InstId> {
    let mut used = UnorderedSet::new();
    for i in func.instructions() {
        func.inst(i).kind.for_each_operand(|v| {
            if let Value::Inst(x) = v {
                used.insert(*x);
            }
        });
    }
    used
}

/// Remove instructions whose results are unused and that have no other effect. Returns whether
/// anything was removed.
pub fn remove_dead_instructions(module: &mut Module, f: FuncId) -> bool {
    let mut changed = false;
    loop {
        let func = module.function(f);
        let used = used_instructions(func);
        let dead: Vec<InstId> = func
            .instructions()
            .into_iter()
            .filter(|i| !used.contains(i))
            .filter(|&i| is_trivially_dead_kind(module, &func.inst(i).kind))
            .collect();
        if dead.is_empty() {
            break;
        }
        trace!("Removing dead instructions"; "function" => &func.name, "count" => dead.len());
        let func = module.function_mut(f);
        for i in dead {
            func.erase_inst(i);
        }
        changed = true;
    }
    changed
}

/// Remove blocks not reachable from the entry block, along with the phi entries flowing out of
/// them. Returns whether anything was removed.
pub fn remove_unreachable_blocks(func: &mut Function) -> bool {
    let entry = match func.entry_block() {
        Some(e) => e,
        None => return false,
    };
    let mut reachable = UnorderedSet::new();
    let mut wl = WorkList::new();
    wl.push(entry);
    while let Some(b) = wl.pop() {
        if reachable.insert(b) {
            wl.extend(func.successors(b));
        }
    }
    let dead: Vec<_> = func
        .block_ids()
        .into_iter()
        .filter(|b| !reachable.contains(b))
        .collect();
    if dead.is_empty() {
        return false;
    }
    trace!("Removing unreachable blocks"; "function" => &func.name, "count" => dead.len());
    for &b in &dead {
        func.remove_block(b);
    }
    for i in func.instructions() {
        if let InstKind::Phi { incoming } = &mut func.inst_mut(i).kind {
            incoming.retain(|(_, b)| !dead.contains(b));
        }
    }
    true
}

/// Remove internal functions and internal globals that nothing refers to, until none are left.
/// Returns whether anything was removed.
pub fn remove_dead_globals(module: &mut Module) -> bool {
    let mut changed = false;
    loop {
        let mut removed_any = false;
        for f in module.function_ids() {
            if module.function(f).linkage != Linkage::Internal {
                continue;
            }
            // Self-recursive calls alone do not keep a function alive
            let external_uses = module.function_use_count(f)
                - module
                    .callers_of(f)
                    .iter()
                    .filter(|(caller, _)| *caller == f)
                    .count();
            if external_uses == 0 {
                let func = module.remove_function(f);
                debug!("Removed dead function"; "function" => func.name);
                removed_any = true;
            }
        }
        for g in module.global_ids() {
            let global = module.global(g);
            if global.linkage == Linkage::Internal && module.global_use_count(g) == 0 {
                let global = module.remove_global(g);
                debug!("Removed dead global"; "global" => global.name);
                removed_any = true;
            }
        }
        if !removed_any {
            break;
        }
        changed = true;
    }
    changed
}

/// All of the above, over the whole module
pub fn run(module: &mut Module) -> bool {
    let mut changed = false;
    for f in module.function_ids() {
        changed |= remove_unreachable_blocks(module.function_mut(f));
        changed |= remove_dead_instructions(module, f);
    }
    changed |= remove_dead_globals(module);
    changed
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{BinOp, GlobalVariable, Type};

    #[test]
    fn unused_pure_instructions_go_but_stores_stay() {
        let mut m = Module::new("m", 32);
        let mut f = Function::new("f", vec![Type::Int(32), Type::Ptr], Type::Void);
        let entry = f.add_block("entry");
        let a = f.append_inst(
            entry,
            InstKind::Binary {
                op: BinOp::Add,
                lhs: Value::Arg(0),
                rhs: Value::int(1, 32),
            },
            Type::Int(32),
        );
        f.append_inst(
            entry,
            InstKind::Binary {
                op: BinOp::Mul,
                lhs: Value::Inst(a),
                rhs: Value::int(2, 32),
            },
            Type::Int(32),
        );
        let store = f.append_inst(
            entry,
            InstKind::Store {
                value: Value::Arg(0),
                addr: Value::Arg(1),
            },
            Type::Void,
        );
        let ret = f.append_inst(entry, InstKind::Ret { value: None }, Type::Void);
        let f = m.add_function(f);

        assert!(remove_dead_instructions(&mut m, f));
        assert_eq!(m.function(f).instructions(), vec![store, ret]);
        assert!(!remove_dead_instructions(&mut m, f));
    }

    #[test]
    fn unreachable_blocks_and_their_phi_entries_go() {
        let mut f = Function::new("f", vec![Type::Int(32)], Type::Int(32));
        let entry = f.add_block("entry");
        let orphan = f.add_block("orphan");
        let exit = f.add_block("exit");
        f.append_inst(entry, InstKind::Br { target: exit }, Type::Void);
        f.append_inst(orphan, InstKind::Br { target: exit }, Type::Void);
        let phi = f.append_inst(
            exit,
            InstKind::Phi {
                incoming: vec![(Value::int(1, 32), entry), (Value::int(2, 32), orphan)],
            },
            Type::Int(32),
        );
        f.append_inst(
            exit,
            InstKind::Ret {
                value: Some(Value::Inst(phi)),
            },
            Type::Void,
        );

        assert!(remove_unreachable_blocks(&mut f));
        assert_eq!(f.block_ids(), vec![entry, exit]);
        assert_eq!(
            f.inst(phi).kind,
            InstKind::Phi {
                incoming: vec![(Value::int(1, 32), entry)]
            }
        );
    }

    #[test]
    fn only_unreferenced_internal_symbols_are_removed() {
        let mut m = Module::new("m", 32);
        let mut helper = Function::new("helper", vec![], Type::Void);
        helper.linkage = Linkage::Internal;
        let entry = helper.add_block("entry");
        helper.append_inst(entry, InstKind::Ret { value: None }, Type::Void);
        let helper = m.add_function(helper);

        let mut table = GlobalVariable::new("table", Type::Ptr);
        table.linkage = Linkage::Internal;
        table.initializer = Some(Value::Function(helper));
        m.add_global(table);

        let mut exported = GlobalVariable::new("exported", Type::Int(32));
        exported.initializer = Some(Value::int(0, 32));
        m.add_global(exported);

        // `table` keeps `helper` alive until `table` itself goes
        assert!(remove_dead_globals(&mut m));
        assert!(m.get_global("table").is_none());
        assert!(m.get_function("helper").is_none());
        assert!(m.get_global("exported").is_some());
    }
}
