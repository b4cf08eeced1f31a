//! Inlining of direct calls to small, non-recursive functions.

use crate::containers::unordered::UnorderedMap;
use crate::ir::{BlockId, FnAttr, FuncId, Function, InstId, InstKind, Module, Type, Value};
use crate::log::*;

/// Whether `callee` may be inlined into `caller` under `threshold`
fn should_inline(module: &Module, caller: FuncId, callee: FuncId, threshold: usize) -> bool {
    if caller == callee {
        return false;
    }
    let c = module.function(callee);
    if c.is_declaration() || c.attrs.contains(&FnAttr::NoInline) {
        return false;
    }
    let calls_itself = c
        .instructions()
        .into_iter()
        .any(|i| c.inst(i).kind.called_function() == Some(callee));
    if calls_itself {
        return false;
    }
    c.attrs.contains(&FnAttr::AlwaysInline) || c.num_instructions() <= threshold
}

/// Replace the call `call` in `caller` with a copy of the body of the function it calls. The
/// callee must be defined and must not be `caller` itself.
pub fn inline_call(module: &mut Module, caller: FuncId, call: InstId) {
    let (callee, args) = match &module.function(caller).inst(call).kind {
        InstKind::Call {
            callee: Value::Function(callee),
            args,
            ..
        } => (*callee, args.clone()),
        k => panic!("Cannot inline {:?}", k),
    };
    assert_ne!(callee, caller, "Cannot inline a function into itself");
    let body = module.function(callee).clone();
    assert!(!body.is_declaration(), "Cannot inline a declaration");
    assert_eq!(args.len(), body.ty.params.len());

    let func = module.function_mut(caller);
    let call_block = func.inst(call).block();
    let posn = func
        .block(call_block)
        .insts()
        .iter()
        .position(|&i| i == call)
        .expect("Call missing from its own block");

    // Split the block after the call
    let cont_name = format!("{}.cont", func.block(call_block).name);
    let cont = func.add_block_after(call_block, cont_name);
    func.move_insts_from(call_block, posn + 1, cont);
    for succ in func.successors(cont) {
        for i in func.block(succ).insts().to_vec() {
            if let InstKind::Phi { incoming } = &mut func.inst_mut(i).kind {
                for (_, b) in incoming.iter_mut() {
                    if *b == call_block {
                        *b = cont;
                    }
                }
            }
        }
    }

    // Clone the callee's blocks in between
    let mut block_map: UnorderedMap<BlockId, BlockId> = UnorderedMap::new();
    let mut after = call_block;
    for b in body.block_ids() {
        let nb = func.add_block_after(after, format!("{}.{}", body.name, body.block(b).name));
        block_map.insert(b, nb);
        after = nb;
    }
    let mut inst_map: UnorderedMap<InstId, InstId> = UnorderedMap::new();
    let mut returns: Vec<(Option<Value>, BlockId)> = vec![];
    for b in body.block_ids() {
        let nb = block_map[&b];
        for &i in body.block(b).insts() {
            let data = body.inst(i);
            if let InstKind::Ret { value } = &data.kind {
                returns.push((value.clone(), nb));
                func.append_inst(nb, InstKind::Br { target: cont }, Type::Void);
            } else {
                let ni = func.append_inst(nb, data.kind.clone(), data.ty.clone());
                inst_map.insert(i, ni);
            }
        }
    }
    let remap = |v: &mut Value, inst_map: &UnorderedMap<InstId, InstId>| match v {
        Value::Arg(a) => *v = args[*a].clone(),
        Value::Inst(x) => *x = inst_map[&*x],
        _ => {}
    };
    for &ni in inst_map.values() {
        let kind = &mut func.inst_mut(ni).kind;
        kind.for_each_operand_mut(|v| remap(v, &inst_map));
        kind.for_each_block_mut(|b| *b = block_map[&*b]);
    }
    for (value, _) in returns.iter_mut() {
        if let Some(v) = value {
            remap(v, &inst_map);
        }
    }

    // Wire up the result
    let result = match (&body.ty.ret, returns.as_slice()) {
        (Type::Void, _) => None,
        (ty, []) => Some(Value::Undef(ty.clone())),
        (_, [(value, _)]) => value.clone(),
        (ty, returns) => {
            let first = func.block(cont).insts()[0];
            let incoming = returns
                .iter()
                .map(|(v, b)| (v.clone().unwrap_or_else(|| Value::Undef(ty.clone())), *b))
                .collect();
            Some(Value::Inst(func.insert_inst_before(
                first,
                InstKind::Phi { incoming },
                ty.clone(),
            )))
        }
    };
    if let Some(result) = result {
        func.replace_all_uses_with(&Value::Inst(call), &result);
    }
    func.erase_inst(call);
    let entry = block_map[&body.block_ids()[0]];
    func.append_inst(call_block, InstKind::Br { target: entry }, Type::Void);
}

/// Inline every eligible call in the module. Returns whether anything was inlined.
pub fn run(module: &mut Module, threshold: usize) -> bool {
    let mut changed = false;
    for caller in module.function_ids() {
        // Inlining invalidates the instruction list, so rescan after each one
        loop {
            let func = module.function(caller);
            let site = func.instructions().into_iter().find_map(|i| {
                let callee = func.inst(i).kind.called_function()?;
                should_inline(module, caller, callee, threshold).then(|| (i, callee))
            });
            let (call, callee) = match site {
                Some(site) => site,
                None => break,
            };
            trace!(
                "Inlining call";
                "caller" => &module.function(caller).name,
                "callee" => &module.function(callee).name
            );
            inline_call(module, caller, call);
            changed = true;
        }
    }
    changed
}

/// Number of direct calls in `func`
pub fn count_calls(func: &Function) -> usize {
    func.instructions()
        .into_iter()
        .filter(|&i| matches!(func.inst(i).kind, InstKind::Call { .. }))
        .count()
}
