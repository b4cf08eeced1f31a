//! Full unrolling of single-block loops whose trip count is a small constant.
//!
//! A candidate loop is a block `L` that branches either back to itself or to an exit block, and
//! that is entered from exactly one other block. The trip count is found by evaluating the loop
//! with constant folding, starting from the phis' initial values; the loop is then replaced by a
//! straight-line block holding that many copies of its body.

use crate::constant_folding::fold_instruction;
use crate::containers::unordered::UnorderedMap;
use crate::ir::{BlockId, DataLayout, Function, InstId, InstKind, Module, Type, Value};
use crate::log::*;

/// Upper bound on the number of instructions an unrolled loop may have, before any reduction for
/// code size
pub const MAX_UNROLLED_SIZE: usize = 2048;

/// The shape of a single-block loop
struct SimpleLoop {
    header: BlockId,
    preheader: BlockId,
    exit: BlockId,
    /// Each phi, with its initial value and the value it takes on the back-edge
    phis: Vec<(InstId, Value, Value)>,
    body: Vec<InstId>,
    cond: Value,
    /// Whether the loop continues when `cond` is true
    continue_on_true: bool,
}

fn find_simple_loop(func: &Function, header: BlockId) -> Option<SimpleLoop> {
    let term = func.terminator(header)?;
    let (cond, continue_on_true, exit) = match &func.inst(term).kind {
        InstKind::CondBr {
            cond,
            on_true,
            on_false,
        } if *on_true == header && *on_false != header => (cond.clone(), true, *on_false),
        InstKind::CondBr {
            cond,
            on_true,
            on_false,
        } if *on_false == header && *on_true != header => (cond.clone(), false, *on_true),
        _ => return None,
    };
    let preheader = match func.predecessors(header).as_slice() {
        [a, b] if *a == header => *b,
        [a, b] if *b == header => *a,
        _ => return None,
    };
    if Some(header) == func.entry_block() {
        return None;
    }

    let mut phis = vec![];
    let mut body = vec![];
    for &i in func.block(header).insts() {
        match &func.inst(i).kind {
            InstKind::Phi { incoming } => {
                let from = |b: BlockId| {
                    let mut vals = incoming.iter().filter(|(_, x)| *x == b).map(|(v, _)| v);
                    let v = vals.next()?;
                    vals.all(|x| x == v).then(|| v.clone())
                };
                phis.push((i, from(preheader)?, from(header)?));
            }
            k if k.is_terminator() => {}
            _ => body.push(i),
        }
    }
    Some(SimpleLoop {
        header,
        preheader,
        exit,
        phis,
        body,
        cond,
        continue_on_true,
    })
}

/// `v`, with loop values substituted from `env`
fn lookup(env: &UnorderedMap<InstId, Value>, v: &Value) -> Value {
    match v {
        Value::Inst(i) => env.get(i).cloned().unwrap_or_else(|| v.clone()),
        _ => v.clone(),
    }
}

/// Number of times the body of `l` runs, if it is a constant no larger than `max`
fn trip_count(func: &Function, layout: &DataLayout, l: &SimpleLoop, max: usize) -> Option<usize> {
    let mut env: UnorderedMap<InstId, Value> = UnorderedMap::new();
    for (phi, init, _) in &l.phis {
        env.insert(*phi, init.clone());
    }
    for trip in 1..=max {
        for &i in &l.body {
            let data = func.inst(i);
            let mut kind = data.kind.clone();
            kind.for_each_operand_mut(|v| *v = lookup(&env, v));
            match fold_instruction(&kind, &data.ty, layout) {
                Some(v) if v.is_constant() => {
                    env.insert(i, v);
                }
                _ => {
                    env.remove(&i);
                }
            }
        }
        let continues = match lookup(&env, &l.cond).as_int() {
            Some((c, _)) => (c != 0) == l.continue_on_true,
            None => return None,
        };
        if !continues {
            return Some(trip);
        }
        let next: Vec<_> = l
            .phis
            .iter()
            .map(|(phi, _, latch)| (*phi, lookup(&env, latch)))
            .collect();
        for (phi, v) in next {
            if v.is_constant() {
                env.insert(phi, v);
            } else {
                env.remove(&phi);
            }
        }
    }
    None
}

/// Replace `l` by `trips` copies of its body
fn unroll(func: &mut Function, l: &SimpleLoop, trips: usize) {
    let name = format!("{}.unrolled", func.block(l.header).name);
    let unrolled = func.add_block_after(l.header, name);

    let mut cur: UnorderedMap<InstId, Value> = UnorderedMap::new();
    for (phi, init, _) in &l.phis {
        cur.insert(*phi, init.clone());
    }
    for trip in 0..trips {
        for &i in &l.body {
            let data = func.inst(i);
            let mut kind = data.kind.clone();
            let ty = data.ty.clone();
            kind.for_each_operand_mut(|v| *v = lookup(&cur, v));
            let ni = func.append_inst(unrolled, kind, ty);
            cur.insert(i, Value::Inst(ni));
        }
        if trip + 1 < trips {
            let next: Vec<_> = l
                .phis
                .iter()
                .map(|(phi, _, latch)| (*phi, lookup(&cur, latch)))
                .collect();
            for (phi, v) in next {
                cur.insert(phi, v);
            }
        }
    }
    func.append_inst(unrolled, InstKind::Br { target: l.exit }, Type::Void);

    // Values computed by the loop are those of its last iteration
    for (&i, v) in cur.iter() {
        func.replace_all_uses_with(&Value::Inst(i), v);
    }
    for i in func.block(l.exit).insts().to_vec() {
        func.inst_mut(i).kind.for_each_block_mut(|b| {
            if *b == l.header {
                *b = unrolled;
            }
        });
    }
    if let Some(t) = func.terminator(l.preheader) {
        func.inst_mut(t).kind.for_each_block_mut(|b| {
            if *b == l.header {
                *b = unrolled;
            }
        });
    }
    func.remove_block(l.header);
}

/// Fully unroll every single-block loop in `func` that runs at most `max_trip_count` times and
/// unrolls to at most `max_size` instructions. Returns whether anything was unrolled.
pub fn unroll_loops(
    func: &mut Function,
    layout: &DataLayout,
    max_trip_count: usize,
    max_size: usize,
) -> bool {
    let mut changed = false;
    'restart: loop {
        for b in func.block_ids() {
            let l = match find_simple_loop(func, b) {
                Some(l) => l,
                None => continue,
            };
            let trips = match trip_count(func, layout, &l, max_trip_count) {
                Some(t) => t,
                None => continue,
            };
            if trips * l.body.len() > max_size {
                continue;
            }
            debug!(
                "Fully unrolling loop";
                "function" => &func.name,
                "block" => &func.block(b).name,
                "trips" => trips
            );
            unroll(func, &l, trips);
            changed = true;
            continue 'restart;
        }
        return changed;
    }
}

pub fn run(module: &mut Module, max_trip_count: usize, max_size: usize) -> bool {
    let layout = module.data_layout;
    let mut changed = false;
    for f in module.function_ids() {
        changed |= unroll_loops(module.function_mut(f), &layout, max_trip_count, max_size);
    }
    changed
}
