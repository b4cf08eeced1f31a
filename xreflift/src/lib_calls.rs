//! Recognition of calls to pure C library functions.
//!
//! Calls to external declarations named like one of a handful of side-effect free C library
//! functions are evaluated when their arguments are constants, and dropped when their result is
//! unused.

use crate::ir::{sign_extend_from_bits, FuncId, InstKind, Module, Value};
use crate::log::*;

/// Evaluate a known library function on integer arguments
fn evaluate(name: &str, args: &[(u64, u32)]) -> Option<u64> {
    let &[(a, bits)] = args else {
        return None;
    };
    let s = sign_extend_from_bits(a, bits);
    let c = u8::try_from(s).ok().map(char::from);
    let r = match name {
        "abs" | "labs" | "llabs" => s.wrapping_abs() as u64,
        "toupper" => c.map_or(a, |c| c.to_ascii_uppercase() as u64),
        "tolower" => c.map_or(a, |c| c.to_ascii_lowercase() as u64),
        "isdigit" => c.map_or(false, |c| c.is_ascii_digit()) as u64,
        "isalpha" => c.map_or(false, |c| c.is_ascii_alphabetic()) as u64,
        "isspace" => c.map_or(false, |c| c.is_ascii_whitespace()) as u64,
        _ => return None,
    };
    Some(r)
}

/// Names of the library functions understood here
pub const KNOWN_FUNCTIONS: [&str; 8] = [
    "abs", "labs", "llabs", "toupper", "tolower", "isdigit", "isalpha", "isspace",
];

fn is_known_library_function(module: &Module, f: FuncId) -> bool {
    let func = module.function(f);
    func.is_declaration() && KNOWN_FUNCTIONS.contains(&func.name.as_str())
}

/// Fold or drop calls to known library functions. Returns whether anything changed.
pub fn run(module: &mut Module) -> bool {
    let mut changed = false;
    for f in module.function_ids() {
        for i in module.function(f).instructions() {
            let func = module.function(f);
            let data = func.inst(i);
            let (callee, args) = match &data.kind {
                InstKind::Call {
                    callee: Value::Function(callee),
                    args,
                    ..
                } if is_known_library_function(module, *callee) => (*callee, args),
                _ => continue,
            };
            let folded = args
                .iter()
                .map(Value::as_int)
                .collect::<Option<Vec<_>>>()
                .and_then(|args| evaluate(&module.function(callee).name, &args));
            let bits = data.ty.int_bits();
            let unused = func.users_of(&Value::Inst(i)).is_empty();

            let func = module.function_mut(f);
            match (folded, bits) {
                (Some(r), Some(bits)) => {
                    trace!("Folded library call"; "function" => &func.name, "result" => r);
                    func.replace_all_uses_with(&Value::Inst(i), &Value::int(r, bits));
                    func.erase_inst(i);
                    changed = true;
                }
                _ if unused => {
                    func.erase_inst(i);
                    changed = true;
                }
                _ => {}
            }
        }
    }
    changed
}
