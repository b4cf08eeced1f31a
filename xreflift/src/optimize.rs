//! Cleanup of a fully lifted module.
//!
//! Lifting leaves a module full of scaffolding: selector globals pointing at semantic functions,
//! marker functions, and placeholder functions for memory accesses, memory barriers and undefined
//! values. [`optimize_module`] removes all of it and drives the module through the standard
//! pipeline, leaving ordinary IR behind.

use crate::containers::unordered::UnorderedMap;
use crate::containers::WorkList;
use crate::intrinsics::{self, MemoryAccess};
use crate::ir::{CastOp, FnAttr, FuncId, GlobalId, InstId, InstKind, Linkage, Module, Value};
use crate::ir_builder::Builder;
use crate::log::*;
use crate::optimizer_config::OptimizerConfig;
use crate::pipeline::run_pipeline;
use itertools::Itertools;

/// Remove all lifting scaffolding from `module` and optimize it, in place.
pub fn optimize_module(module: &mut Module, config: &OptimizerConfig) {
    let selectors = find_selectors(module);
    strip_scaffolding(module);
    info!("Optimizing module"; "module" => &module.name, "selectors" => selectors.len());
    log_statistics(module, config, "after stripping scaffolding");

    remove_selectors(module, selectors);
    if config.run_standard_pipeline {
        run_pipeline(module, &config.pipeline);
        log_statistics(module, config, "after standard pipeline");
    }
    strip_scaffolding(module);

    lower_memory_accesses(module);
    for barrier in intrinsics::BARRIERS {
        resolve_barrier(module, barrier);
    }
    eliminate_undefined_values(module);
    log_statistics(module, config, "done");
}

fn log_statistics(module: &Module, config: &OptimizerConfig, stage: &str) {
    if config.log_module_statistics {
        info!(
            "Module statistics";
            "stage" => stage,
            "functions" => module.function_ids().len(),
            "globals" => module.global_ids().len()
        );
    }
}

/// Selector globals: those initialized with a function whose first two parameters are the memory
/// and processor state, like the canonical lifted function's.
pub fn find_selectors(module: &Module) -> Vec<GlobalId> {
    let basic_block = match module.get_function(intrinsics::BASIC_BLOCK) {
        Some(f) => module.function(f),
        None => {
            error!(
                "Not removing any selectors or semantics; cannot find canonical lifted function";
                "name" => intrinsics::BASIC_BLOCK
            );
            return vec![];
        }
    };
    let (mem_ty, state_ty) = match basic_block.ty.params.as_slice() {
        [m, s, ..] => (m, s),
        _ => {
            error!("Canonical lifted function has too few parameters"; "name" => &basic_block.name);
            return vec![];
        }
    };

    module
        .global_ids()
        .into_iter()
        .filter(|&g| match &module.global(g).initializer {
            Some(Value::Function(sem)) => {
                let params = &module.function(*sem).ty.params;
                params.len() >= 2 && params[0] == *mem_ty && params[1] == *state_ty
            }
            _ => false,
        })
        .collect()
}

/// Remove the "used" list and the marker functions of the semantics library. Removing anything
/// twice is harmless, so this may run any number of times.
pub fn strip_scaffolding(module: &mut Module) {
    if module.used.take().is_some() {
        debug!("Dropped the used list");
    }

    // Inlining this marker everywhere drops the references it holds
    if let Some(f) = module.get_function(intrinsics::MARK_AS_USED) {
        let func = module.function_mut(f);
        if func.is_declaration() {
            func.linkage = Linkage::Internal;
            func.attrs.remove(&FnAttr::NoInline);
            func.attrs.insert(FnAttr::InlineHint);
            func.attrs.insert(FnAttr::AlwaysInline);
            let ret = if func.ty.ret.is_void() {
                None
            } else {
                Some(Value::Undef(func.ty.ret.clone()))
            };
            let entry = func.add_block("entry");
            func.append_inst(
                entry,
                InstKind::Ret { value: ret },
                crate::ir::Type::Void,
            );
            debug!("Gave marker function an empty body"; "name" => intrinsics::MARK_AS_USED);
        }
    }

    for name in intrinsics::SCAFFOLDING_FUNCTIONS {
        remove_function_if_unused(module, name);
    }
}

/// Make the function named `name` internal, and remove it if nothing refers to it
fn remove_function_if_unused(module: &mut Module, name: &str) {
    if let Some(f) = module.get_function(name) {
        module.function_mut(f).linkage = Linkage::Internal;
        remove_if_unused(module, f);
    }
}

fn remove_if_unused(module: &mut Module, f: FuncId) {
    if module.function_use_count(f) == 0 {
        let func = module.remove_function(f);
        debug!("Removed function"; "name" => func.name);
    }
}

/// Remove selector globals that nothing else refers to, repeatedly, until none are left or a round
/// removes nothing.
pub fn remove_selectors(module: &mut Module, mut selectors: Vec<GlobalId>) {
    while !selectors.is_empty() {
        let mut remaining = vec![];
        for &g in &selectors {
            module.global_mut(g).linkage = Linkage::Internal;
            if module.global_use_count(g) == 0 {
                let global = module.remove_global(g);
                trace!("Removed selector"; "name" => global.name);
            } else {
                remaining.push(g);
            }
        }
        if remaining.len() == selectors.len() {
            debug!("Selectors still in use are kept"; "count" => remaining.len());
            break;
        }
        selectors = remaining;
    }
}

/// Panic unless `f` is only declared
fn assert_placeholder(module: &Module, f: FuncId) {
    let func = module.function(f);
    assert!(
        func.is_declaration(),
        "Cannot lower already implemented memory intrinsic {}",
        func.name
    );
}

/// Calls to `f`, grouped by calling function
fn call_sites(module: &Module, f: FuncId) -> Vec<(FuncId, Vec<InstId>)> {
    let res = module
        .callers_of(f)
        .into_iter()
        .group_by(|&(caller, _)| caller)
        .into_iter()
        .map(|(caller, calls)| (caller, calls.map(|(_, call)| call).collect()))
        .collect();
    res
}

/// The arguments of a call to the placeholder `name`, which takes exactly `arity` of them
fn placeholder_args(
    module: &Module,
    caller: FuncId,
    call: InstId,
    name: &str,
    arity: usize,
) -> Vec<Value> {
    match &module.function(caller).inst(call).kind {
        InstKind::Call { args, .. } => {
            assert!(
                args.len() == arity,
                "Call to memory intrinsic {} has {} arguments, expected {}",
                name,
                args.len(),
                arity
            );
            args.clone()
        }
        _ => unreachable!(),
    }
}

/// Redirect the results of `calls` as given by `replacements`, then erase the calls
fn replace_calls(
    module: &mut Module,
    caller: FuncId,
    calls: Vec<InstId>,
    replacements: UnorderedMap<Value, Value>,
) {
    let func = module.function_mut(caller);
    func.replace_uses_with_map(&replacements);
    for call in calls {
        func.erase_inst(call);
    }
}

/// Turn calls to the read placeholder into a plain load
fn lower_read(module: &mut Module, access: &MemoryAccess) {
    let f = match module.get_function(&access.read) {
        Some(f) => f,
        None => return,
    };
    assert_placeholder(module, f);

    for (caller, calls) in call_sites(module, f) {
        let mut replacements = UnorderedMap::new();
        for &call in &calls {
            let args = placeholder_args(module, caller, call, &access.read, 2);
            let mut b = Builder::before(module, caller, call);
            let ptr = b.int_to_ptr(args[1].clone());
            let mut val = b.load(access.memory_ty.clone(), ptr);
            if access.memory_ty != access.ty {
                val = b.cast(CastOp::FpTrunc, val, access.ty.clone());
            }
            replacements.insert(Value::Inst(call), val);
        }
        trace!(
            "Lowered memory reads";
            "name" => &access.read,
            "caller" => ?caller,
            "calls" => calls.len()
        );
        replace_calls(module, caller, calls, replacements);
    }
    remove_if_unused(module, f);
}

/// Turn calls to the write placeholder into a plain store, with the memory token passed through
fn lower_write(module: &mut Module, access: &MemoryAccess) {
    let f = match module.get_function(&access.write) {
        Some(f) => f,
        None => return,
    };
    assert_placeholder(module, f);

    for (caller, calls) in call_sites(module, f) {
        let mut replacements = UnorderedMap::new();
        for &call in &calls {
            let args = placeholder_args(module, caller, call, &access.write, 3);
            let (memory, addr, value) = (args[0].clone(), args[1].clone(), args[2].clone());
            let mut b = Builder::before(module, caller, call);
            let ptr = b.int_to_ptr(addr);
            let value = if access.memory_ty != access.ty {
                b.cast(CastOp::FpExt, value, access.memory_ty.clone())
            } else {
                value
            };
            b.store(value, ptr);
            replacements.insert(Value::Inst(call), memory);
        }
        trace!(
            "Lowered memory writes";
            "name" => &access.write,
            "caller" => ?caller,
            "calls" => calls.len()
        );
        replace_calls(module, caller, calls, replacements);
    }
    remove_if_unused(module, f);
}

/// Lower every memory-access placeholder into loads and stores. Extended precision goes last.
pub fn lower_memory_accesses(module: &mut Module) {
    let (extended, plain): (Vec<&MemoryAccess>, Vec<&MemoryAccess>) = intrinsics::MEMORY_ACCESSES
        .iter()
        .partition(|a| a.memory_ty != a.ty);
    for access in &plain {
        lower_read(module, access);
    }
    for access in &plain {
        lower_write(module, access);
    }
    for access in extended {
        lower_read(module, access);
        lower_write(module, access);
    }
}

/// Replace calls to the barrier `name` by the memory token they are passed, and remove it
pub fn resolve_barrier(module: &mut Module, name: &str) {
    let f = match module.get_function(name) {
        Some(f) => f,
        None => return,
    };
    assert_placeholder(module, f);

    let mut resolved = 0;
    for (caller, calls) in call_sites(module, f) {
        let mut replacements = UnorderedMap::new();
        for &call in &calls {
            let args = placeholder_args(module, caller, call, name, 1);
            replacements.insert(Value::Inst(call), args[0].clone());
        }
        resolved += calls.len();
        replace_calls(module, caller, calls, replacements);
    }
    trace!("Resolved barrier"; "name" => name, "calls" => resolved);
    remove_if_unused(module, f);
}

/// Replace calls to the undefined-value placeholders by `undef`, propagate undefinedness through
/// comparisons and casts, and delete the stores this exposes to an undefined value or address.
pub fn eliminate_undefined_values(module: &mut Module) {
    for placeholder in intrinsics::UNDEFINED_VALUES.iter() {
        let f = match module.get_function(&placeholder.name) {
            Some(f) => f,
            None => continue,
        };

        let mut dead_stores = 0;
        for (caller, calls) in call_sites(module, f) {
            let func = module.function_mut(caller);
            let users = func.user_index();
            let users_of = |i: &InstId| users.get(i).map(Vec::as_slice).unwrap_or_default();

            let mut work_list = WorkList::new();
            for call in calls {
                let undef = Value::Undef(func.inst(call).ty.clone());
                func.replace_uses_in(users_of(&call), &Value::Inst(call), &undef);
                work_list.extend(users_of(&call).iter().copied());
                func.erase_inst(call);
            }

            while let Some(i) = work_list.pop() {
                if !func.inst_exists(i) {
                    continue;
                }
                let kind = &func.inst(i).kind;
                if kind.is_cmp() || kind.is_cast() {
                    let undef = Value::Undef(func.inst(i).ty.clone());
                    func.replace_uses_in(users_of(&i), &Value::Inst(i), &undef);
                    work_list.extend(users_of(&i).iter().copied());
                    func.erase_inst(i);
                } else if matches!(kind, InstKind::Store { .. }) {
                    func.erase_inst(i);
                    dead_stores += 1;
                }
            }
        }
        debug!(
            "Eliminated undefined values";
            "name" => &placeholder.name,
            "dead_stores" => dead_stores
        );
        remove_if_unused(module, f);
    }
}
