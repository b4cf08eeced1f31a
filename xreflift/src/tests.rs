use crate::binary_model::{BinaryModel, CrossReference, InstructionXrefs, Segment, SymbolMaterializer};
use crate::instruction_lifter::{
    Diagnostic, DiagnosticKind, InstructionLifter, LiftContext, TranslationContext, XrefSlot,
};
use crate::intrinsics;
use crate::ir::{BinOp, CastOp, FuncId, InstKind, Module, Type, Value};
use crate::ir_builder::{BlockRef, Builder};
use crate::optimize::{optimize_module, strip_scaffolding};
use crate::optimizer_config::{CommandLineOptimizerConfig, OptimizerConfig};
use crate::semantics::{
    Action, AddressKind, Arch, DecodedInstruction, LiftStatus, MemoryOperand, Operand,
    OperandLifter, Register,
};
use crate::serialize_ir::Parseable;

/// Semantics for a handful of x86 instruction forms, along with the scaffolding the semantics
/// library leaves behind.
pub const SEMANTICS: &str = r#"
module "lifted" pointer_bits 32
used @__lift_intrinsics
global constant @ISEL_MOV_GPR32_MEM : ptr = @MOV_GPR32_MEM
global constant @ISEL_MOV_GPR32_PTR : ptr = @MOV_GPR32_PTR
global constant @ISEL_MOV_GPR32_IMM : ptr = @MOV_GPR32_IMM
global constant @ISEL_MOV_GPR16_IMM : ptr = @MOV_GPR16_IMM
global constant @ISEL_MOV_GPR64_IMM : ptr = @MOV_GPR64_IMM
global constant @ISEL_LEA_GPR32 : ptr = @LEA_GPR32
global constant @ISEL_CALL_REL32 : ptr = @CALL_REL32
global constant @ISEL_MFENCE : ptr = @MFENCE
global constant @ISEL_SETUNDEF_GPR32 : ptr = @SETUNDEF_GPR32
global constant @ISEL_NOP : ptr = @NOP
declare @__lift_read_memory_32(&Memory, i32) -> i32
declare @__lift_barrier_store_load(&Memory) -> &Memory
declare @__lift_undefined_32() -> i32
declare @__lift_mark_as_used(ptr) -> void noinline
define @__lift_basic_block(&Memory, &State, i32) -> &Memory {
entry:
  ret %arg0
}
define @__lift_intrinsics() -> void {
entry:
  call void @__lift_mark_as_used(@__lift_read_memory_32)
  call void @__lift_mark_as_used(@__lift_barrier_store_load)
  call void @__lift_mark_as_used(@__lift_undefined_32)
  ret
}
define internal @MOV_GPR32_MEM(&Memory, &State, ptr, i32) -> &Memory alwaysinline {
entry:
  %0 = call i32 @__lift_read_memory_32(%arg0, %arg3)
  store %0, %arg2
  ret %arg0
}
define internal @MOV_GPR32_PTR(&Memory, &State, ptr, ptr) -> &Memory alwaysinline {
entry:
  %0 = load i32 %arg3
  store %0, %arg2
  ret %arg0
}
define internal @MOV_GPR32_IMM(&Memory, &State, ptr, i32) -> &Memory alwaysinline {
entry:
  store %arg3, %arg2
  ret %arg0
}
define internal @MOV_GPR16_IMM(&Memory, &State, ptr, i16) -> &Memory alwaysinline {
entry:
  store %arg3, %arg2
  ret %arg0
}
define internal @MOV_GPR64_IMM(&Memory, &State, ptr, i64) -> &Memory alwaysinline {
entry:
  store %arg3, %arg2
  ret %arg0
}
define internal @LEA_GPR32(&Memory, &State, ptr, i32) -> &Memory alwaysinline {
entry:
  store %arg3, %arg2
  ret %arg0
}
define internal @CALL_REL32(&Memory, &State, i32) -> &Memory alwaysinline {
entry:
  %0 = regslot %arg1, "NEXT_PC"
  store %arg2, %0
  ret %arg0
}
define internal @MFENCE(&Memory, &State) -> &Memory alwaysinline {
entry:
  %0 = call &Memory @__lift_barrier_store_load(%arg0)
  ret %0
}
define internal @SETUNDEF_GPR32(&Memory, &State, ptr) -> &Memory alwaysinline {
entry:
  %0 = call i32 @__lift_undefined_32()
  store %0, %arg2
  ret %arg0
}
define internal @NOP(&Memory, &State) -> &Memory alwaysinline {
entry:
  ret %arg0
}
"#;

/// The semantics module, with every placeholder declared
pub fn semantics_module() -> Module {
    let mut m = Module::parse_from(SEMANTICS).unwrap();
    for f in intrinsics::declarations(32) {
        if m.get_function(&f.name).is_none() {
            m.add_function(f);
        }
    }
    m
}

pub fn x86() -> Arch {
    Arch::new("x86", 32)
}

/// A small binary: code at 0x1000, writable data at 0x401000, read-only data at 0x500000
pub fn binary_model() -> BinaryModel {
    let mut model = BinaryModel::new();
    for (name, start, is_read_only) in [
        (".text", 0x1000, true),
        (".data", 0x401000, false),
        (".rdata", 0x500000, true),
    ] {
        model.add_segment(Segment {
            name: name.into(),
            start,
            size: 0x1000,
            is_read_only,
        });
    }
    model
}

pub fn translation_context(xrefs: Vec<(u64, InstructionXrefs)>) -> TranslationContext {
    let mut model = binary_model();
    for (pc, x) in xrefs {
        model.add_xrefs(pc, x);
    }
    TranslationContext::new(x86(), model, Box::new(SymbolMaterializer))
}

fn reg(name: &str) -> Register {
    Register::new(name, 32)
}

fn eax_out() -> Operand {
    Operand::register(Action::Write, reg("EAX"))
}

/// The outcome of lifting one instruction into a fresh function of its own
pub struct Lifted {
    pub status: LiftStatus,
    pub block: BlockRef,
    pub diagnostics: Vec<Diagnostic>,
    pub refs: LiftContext,
}

/// Lift `inst` into a new function `sub_<pc>` that returns right after it
pub fn lift(m: &mut Module, ctx: &mut TranslationContext, inst: &DecodedInstruction) -> Lifted {
    let block = ctx
        .arch
        .define_lifted_function(m, &format!("sub_{:x}", inst.pc));
    let mut lifter = InstructionLifter::new(ctx);
    let status = lifter.lift_into_block(m, inst, block, false);
    Builder::at_end(m, block).ret(Some(Value::Arg(0)));
    Lifted {
        status,
        block,
        diagnostics: lifter.take_diagnostics(),
        refs: lifter.lift_context().clone(),
    }
}

/// Arguments of the first call in `f`
fn first_call_args(m: &Module, f: FuncId) -> Vec<Value> {
    let func = m.function(f);
    func.instructions()
        .into_iter()
        .find_map(|i| match &func.inst(i).kind {
            InstKind::Call { args, .. } => Some(args.clone()),
            _ => None,
        })
        .unwrap()
}

fn global_addr(m: &Module, name: &str) -> Value {
    Value::GlobalAddr(m.get_global(name).unwrap())
}

/// `mov eax, [addr]`
fn mov_from_memory(arch: &Arch, pc: u64, mem: MemoryOperand) -> DecodedInstruction {
    DecodedInstruction::new(arch, pc, vec![0x8b, 0x05, 0, 0x10, 0x40, 0], "MOV_GPR32_MEM")
        .with_operand(eax_out())
        .with_operand(Operand::address(Action::Read, mem))
}

/// `mov eax, [addr]`, with semantics that take the address as a pointer
fn mov_through_pointer(arch: &Arch, pc: u64, mem: MemoryOperand) -> DecodedInstruction {
    DecodedInstruction::new(arch, pc, vec![0x8b, 0x04, 0xb3, 0, 0x11, 0x40, 0], "MOV_GPR32_PTR")
        .with_operand(eax_out())
        .with_operand(Operand::address(Action::Read, mem))
}

/// `mov eax, imm`
fn mov_immediate(arch: &Arch, pc: u64, value: u64) -> DecodedInstruction {
    DecodedInstruction::new(arch, pc, vec![0xb8, 0, 0, 0, 0], "MOV_GPR32_IMM")
        .with_operand(eax_out())
        .with_operand(Operand::immediate(value, 32))
}

fn indexed(base: &str, index: Option<&str>, scale: u64, displacement: i64) -> MemoryOperand {
    MemoryOperand {
        segment: None,
        base: Some(reg(base)),
        index: index.map(reg),
        scale,
        displacement,
        address_size: 32,
        kind: AddressKind::MemoryRead,
    }
}

#[test]
fn absolute_memory_reference_is_substituted() {
    let mut m = semantics_module();
    let mut ctx = translation_context(vec![(
        0x1000,
        InstructionXrefs {
            mem: Some(CrossReference::new(0x401000)),
            ..Default::default()
        },
    )]);
    let inst = mov_from_memory(
        &ctx.arch,
        0x1000,
        MemoryOperand::absolute(0x401000, 32, AddressKind::MemoryRead),
    );
    let r = lift(&mut m, &mut ctx, &inst);

    assert_eq!(r.status, LiftStatus::Lifted);
    assert!(r.diagnostics.is_empty());
    assert!(r.refs.mem.as_ref().unwrap().used);
    let args = first_call_args(&m, r.block.func);
    assert_eq!(args[3], global_addr(&m, "data_401000"));
}

#[test]
fn masked_memory_reference_uses_the_masked_address() {
    let mut m = semantics_module();
    let mut ctx = translation_context(vec![(
        0x1010,
        InstructionXrefs {
            mem: Some(CrossReference::masked(0x401234, 0xffff_f000)),
            ..Default::default()
        },
    )]);
    let inst = mov_from_memory(
        &ctx.arch,
        0x1010,
        MemoryOperand::absolute(0x401234, 32, AddressKind::MemoryRead),
    );
    let r = lift(&mut m, &mut ctx, &inst);

    assert!(r.diagnostics.is_empty());
    let g = m.get_global("data_401000").unwrap();
    assert_eq!(m.global(g).address, Some(0x401000));
    assert_eq!(first_call_args(&m, r.block.func)[3], Value::GlobalAddr(g));
}

#[test]
fn pc_relative_displacement_reference_is_substituted() {
    let mut m = semantics_module();
    let mut ctx = translation_context(vec![(
        0x1020,
        InstructionXrefs {
            disp: Some(CrossReference::new(0x401800)),
            ..Default::default()
        },
    )]);
    let inst = mov_from_memory(&ctx.arch, 0x1020, indexed("NEXT_PC", None, 1, 0x4007da));
    let r = lift(&mut m, &mut ctx, &inst);

    assert!(r.diagnostics.is_empty());
    assert!(r.refs.disp.as_ref().unwrap().used);
    assert_eq!(
        first_call_args(&m, r.block.func)[3],
        global_addr(&m, "data_401800")
    );
}

#[test]
fn displacement_reference_is_added_to_the_dynamic_address() {
    let mut m = semantics_module();
    let mut ctx = translation_context(vec![(
        0x1030,
        InstructionXrefs {
            disp: Some(CrossReference::new(0x401100)),
            ..Default::default()
        },
    )]);
    // mov eax, [ebx + esi*4 + 0x401100]
    let inst = mov_from_memory(&ctx.arch, 0x1030, indexed("EBX", Some("ESI"), 4, 0x401100));
    let r = lift(&mut m, &mut ctx, &inst);

    assert!(r.diagnostics.is_empty());
    assert!(r.refs.disp.as_ref().unwrap().used);

    let func = m.function(r.block.func);
    let addr = match first_call_args(&m, r.block.func)[3] {
        Value::Inst(i) => i,
        ref v => panic!("Expected a computed address, got {:?}", v),
    };
    let dynamic = match &func.inst(addr).kind {
        InstKind::Binary {
            op: BinOp::Add,
            lhs: Value::Inst(dynamic),
            rhs,
        } => {
            assert_eq!(*rhs, global_addr(&m, "data_401100"));
            *dynamic
        }
        k => panic!("Expected an addition, got {:?}", k),
    };
    assert!(matches!(
        func.inst(dynamic).kind,
        InstKind::Binary { op: BinOp::Add, .. }
    ));
    // The literal displacement is gone entirely
    for i in func.instructions() {
        func.inst(i)
            .kind
            .for_each_operand(|v| assert_ne!(v.as_int(), Some((0x401100, 32))));
    }
}

#[test]
fn absolute_reference_is_passed_as_a_pointer() {
    let mut m = semantics_module();
    let mut ctx = translation_context(vec![(
        0x1050,
        InstructionXrefs {
            mem: Some(CrossReference::new(0x401000)),
            ..Default::default()
        },
    )]);
    let inst = mov_through_pointer(
        &ctx.arch,
        0x1050,
        MemoryOperand::absolute(0x401000, 32, AddressKind::MemoryRead),
    );
    let r = lift(&mut m, &mut ctx, &inst);

    assert!(r.diagnostics.is_empty());
    let g = m.get_global("data_401000").unwrap();
    let arg = first_call_args(&m, r.block.func)[3].clone();
    assert_eq!(arg, Value::Global(g));
    assert_eq!(m.value_type(r.block.func, &arg), Type::Ptr);
}

#[test]
fn displacement_reference_is_converted_after_the_addition() {
    let mut m = semantics_module();
    let mut ctx = translation_context(vec![(
        0x1060,
        InstructionXrefs {
            disp: Some(CrossReference::new(0x401100)),
            ..Default::default()
        },
    )]);
    let inst = mov_through_pointer(&ctx.arch, 0x1060, indexed("EBX", Some("ESI"), 4, 0x401100));
    let r = lift(&mut m, &mut ctx, &inst);

    assert!(r.diagnostics.is_empty());
    let func = m.function(r.block.func);
    let ptr = match first_call_args(&m, r.block.func)[3] {
        Value::Inst(i) => i,
        ref v => panic!("Expected a computed pointer, got {:?}", v),
    };
    assert_eq!(func.inst(ptr).ty, Type::Ptr);
    let addr = match &func.inst(ptr).kind {
        InstKind::Cast {
            op: CastOp::IntToPtr,
            value: Value::Inst(addr),
        } => *addr,
        k => panic!("Expected a pointer conversion, got {:?}", k),
    };
    assert_eq!(func.inst(addr).ty, Type::Int(32));
    assert!(matches!(
        &func.inst(addr).kind,
        InstKind::Binary { op: BinOp::Add, rhs, .. } if *rhs == global_addr(&m, "data_401100")
    ));
}

#[test]
fn misclassified_memory_reference_is_treated_as_displacement() {
    let mut m = semantics_module();
    let mut ctx = translation_context(vec![(
        0x1040,
        InstructionXrefs {
            mem: Some(CrossReference::new(0x401200)),
            ..Default::default()
        },
    )]);
    // mov eax, [ebx + 0x401200], with the reference attached to the whole operand
    let inst = mov_from_memory(&ctx.arch, 0x1040, indexed("EBX", None, 1, 0x401200));
    let r = lift(&mut m, &mut ctx, &inst);

    assert_eq!(
        r.diagnostics,
        vec![Diagnostic {
            kind: DiagnosticKind::MisclassifiedMemoryOperand,
            pc: 0x1040,
            address: 0x401200,
        }]
    );
    assert!(r.refs.mem.as_ref().unwrap().used);

    let func = m.function(r.block.func);
    let addr = match first_call_args(&m, r.block.func)[3] {
        Value::Inst(i) => i,
        ref v => panic!("Expected a computed address, got {:?}", v),
    };
    match &func.inst(addr).kind {
        InstKind::Binary {
            op: BinOp::Add,
            lhs: Value::Inst(ebx),
            rhs,
        } => {
            assert_eq!(*rhs, global_addr(&m, "data_401200"));
            assert!(matches!(func.inst(*ebx).kind, InstKind::Load { .. }));
        }
        k => panic!("Expected an addition, got {:?}", k),
    }
}

#[test]
fn unrelated_memory_reference_is_reported_unused() {
    let mut m = semantics_module();
    let mut ctx = translation_context(vec![(
        0x1050,
        InstructionXrefs {
            mem: Some(CrossReference::new(0x401300)),
            ..Default::default()
        },
    )]);
    let inst = mov_from_memory(&ctx.arch, 0x1050, indexed("EBX", None, 1, 8));
    let r = lift(&mut m, &mut ctx, &inst);

    assert_eq!(r.status, LiftStatus::Lifted);
    assert_eq!(
        r.diagnostics,
        vec![Diagnostic {
            kind: DiagnosticKind::UnusedReference(XrefSlot::Memory),
            pc: 0x1050,
            address: 0x401300,
        }]
    );
}

#[test]
fn control_flow_targets_keep_their_static_address() {
    let mut m = semantics_module();
    let mut ctx = translation_context(vec![(
        0x1060,
        InstructionXrefs {
            mem: Some(CrossReference::new(0x1800)),
            ..Default::default()
        },
    )]);
    let inst = DecodedInstruction::new(&ctx.arch, 0x1060, vec![0xe8, 0, 0, 0, 0], "CALL_REL32")
        .with_operand(Operand::address(
            Action::Read,
            MemoryOperand::absolute(0x1800, 32, AddressKind::ControlFlowTarget),
        ));
    let r = lift(&mut m, &mut ctx, &inst);

    assert_eq!(first_call_args(&m, r.block.func)[2], Value::int(0x1800, 32));
    assert_eq!(
        r.diagnostics
            .iter()
            .map(|d| d.kind)
            .collect::<Vec<_>>(),
        vec![DiagnosticKind::UnusedReference(XrefSlot::Memory)]
    );
}

#[test]
fn every_reference_is_used_or_reported() {
    let mut m = semantics_module();
    let mut ctx = translation_context(vec![
        (
            0x1070,
            InstructionXrefs {
                imm: Some(CrossReference::new(0x401400)),
                disp: Some(CrossReference::new(0x401500)),
                ..Default::default()
            },
        ),
        (
            0x1080,
            InstructionXrefs {
                imm: Some(CrossReference::new(0x401400)),
                ..Default::default()
            },
        ),
    ]);
    let nop = DecodedInstruction::new(&ctx.arch, 0x1070, vec![0x90], "NOP");
    let r = lift(&mut m, &mut ctx, &nop);
    assert_eq!(r.status, LiftStatus::Lifted);
    let mut reported: Vec<_> = r.diagnostics.iter().map(|d| d.kind).collect();
    reported.sort_by_key(|k| format!("{:?}", k));
    assert_eq!(
        reported,
        vec![
            DiagnosticKind::UnusedReference(XrefSlot::Displacement),
            DiagnosticKind::UnusedReference(XrefSlot::Immediate),
        ]
    );

    // Instructions without semantics never get to use their references
    let unknown = DecodedInstruction::new(&ctx.arch, 0x1080, vec![0x0f, 0x0b], "UD2");
    let r = lift(&mut m, &mut ctx, &unknown);
    assert_eq!(r.status, LiftStatus::UnsupportedInstruction);
    assert!(r.diagnostics.is_empty());
}

#[test]
fn immediate_reference_is_substituted_and_narrowed() {
    let mut m = semantics_module();
    let mut ctx = translation_context(vec![
        (
            0x1090,
            InstructionXrefs {
                imm: Some(CrossReference::new(0x401010)),
                ..Default::default()
            },
        ),
        (
            0x10a0,
            InstructionXrefs {
                imm: Some(CrossReference::new(0x401010)),
                ..Default::default()
            },
        ),
    ]);
    let arch = ctx.arch.clone();
    let r = lift(&mut m, &mut ctx, &mov_immediate(&arch, 0x1090, 0x401010));
    assert!(r.diagnostics.is_empty());
    assert!(r.refs.imm.as_ref().unwrap().used);
    assert_eq!(
        first_call_args(&m, r.block.func)[3],
        global_addr(&m, "data_401010")
    );

    let inst = DecodedInstruction::new(&arch, 0x10a0, vec![0x66, 0xb8, 0x10, 0x10], "MOV_GPR16_IMM")
        .with_operand(eax_out())
        .with_operand(Operand::immediate(0x1010, 16));
    let r = lift(&mut m, &mut ctx, &inst);
    assert!(r.diagnostics.is_empty());
    let func = m.function(r.block.func);
    match first_call_args(&m, r.block.func)[3] {
        Value::Inst(i) => {
            assert_eq!(func.inst(i).ty, Type::Int(16));
            assert_eq!(
                func.inst(i).kind,
                InstKind::Cast {
                    op: CastOp::Trunc,
                    value: global_addr(&m, "data_401010"),
                }
            );
        }
        ref v => panic!("Expected a truncation, got {:?}", v),
    }
}

#[test]
#[should_panic(expected = "wider than the architecture address size")]
fn immediate_reference_wider_than_an_address_is_fatal() {
    let mut m = semantics_module();
    let mut ctx = translation_context(vec![(
        0x10b0,
        InstructionXrefs {
            imm: Some(CrossReference::new(0x401010)),
            ..Default::default()
        },
    )]);
    let inst = DecodedInstruction::new(&ctx.arch, 0x10b0, vec![0x48, 0xb8], "MOV_GPR64_IMM")
        .with_operand(eax_out())
        .with_operand(Operand::immediate(0x401010, 64));
    lift(&mut m, &mut ctx, &inst);
}

#[test]
fn address_sized_immediate_into_a_segment_is_flagged() {
    let mut m = semantics_module();
    let mut ctx = translation_context(vec![]);
    let arch = ctx.arch.clone();

    let r = lift(&mut m, &mut ctx, &mov_immediate(&arch, 0x10c0, 0x500000));
    assert_eq!(
        r.diagnostics,
        vec![Diagnostic {
            kind: DiagnosticKind::MissedReferenceCandidate,
            pc: 0x10c0,
            address: 0x500000,
        }]
    );
    assert_eq!(first_call_args(&m, r.block.func)[3], Value::int(0x500000, 32));

    // Small constants and constants outside the binary are not suspicious
    for (pc, value) in [(0x10d0, 0x100), (0x10e0, 0x900000)] {
        let r = lift(&mut m, &mut ctx, &mov_immediate(&arch, pc, value));
        assert!(r.diagnostics.is_empty());
    }
}

#[test]
fn scaffolding_removal_is_idempotent() {
    let mut m = semantics_module();
    strip_scaffolding(&mut m);
    let once = m.to_string();
    for name in [
        intrinsics::INTRINSICS,
        intrinsics::BASIC_BLOCK,
        intrinsics::MARK_AS_USED,
    ] {
        assert!(m.get_function(name).is_none(), "{} survived", name);
    }
    assert!(m.used.is_none());

    strip_scaffolding(&mut m);
    assert_eq!(m.to_string(), once);
}

#[test]
fn marker_function_is_defined_and_inlined_away() {
    let mut m = Module::parse_from(
        r#"
module "m" pointer_bits 32
declare @__lift_mark_as_used(ptr) -> void noinline
define @keep(ptr) -> void {
entry:
  call void @__lift_mark_as_used(%arg0)
  ret
}
"#,
    )
    .unwrap();
    strip_scaffolding(&mut m);
    let marker = m.function(m.get_function(intrinsics::MARK_AS_USED).unwrap());
    assert!(!marker.is_declaration());
    assert!(marker
        .attrs
        .contains(&crate::ir::FnAttr::AlwaysInline));
    assert!(!marker.attrs.contains(&crate::ir::FnAttr::NoInline));

    optimize_module(&mut m, &OptimizerConfig::default());
    assert!(m.get_function(intrinsics::MARK_AS_USED).is_none());
    let keep = m.function(m.get_function("keep").unwrap());
    assert_eq!(keep.num_instructions(), 1);
}

/// Lift `insts` into one function each, then optimize the whole module
fn lift_and_optimize(insts: &[DecodedInstruction], xrefs: Vec<(u64, InstructionXrefs)>) -> Module {
    let mut m = semantics_module();
    let mut ctx = translation_context(xrefs);
    for inst in insts {
        let r = lift(&mut m, &mut ctx, inst);
        assert_eq!(r.status, LiftStatus::Lifted);
        assert!(r.diagnostics.is_empty(), "{:?}", r.diagnostics);
    }
    optimize_module(&mut m, &OptimizerConfig::default());
    m
}

#[test]
fn scaffolding_is_gone_after_optimization() {
    let arch = x86();
    let m = lift_and_optimize(
        &[
            mov_from_memory(
                &arch,
                0x1100,
                MemoryOperand::absolute(0x401000, 32, AddressKind::MemoryRead),
            ),
            DecodedInstruction::new(&arch, 0x1110, vec![0x0f, 0xae, 0xf0], "MFENCE"),
            DecodedInstruction::new(&arch, 0x1120, vec![0x0f], "SETUNDEF_GPR32")
                .with_operand(eax_out()),
        ],
        vec![],
    );

    for access in intrinsics::MEMORY_ACCESSES.iter() {
        assert!(m.get_function(&access.read).is_none(), "{}", access.read);
        assert!(m.get_function(&access.write).is_none(), "{}", access.write);
    }
    for barrier in intrinsics::BARRIERS {
        assert!(m.get_function(barrier).is_none(), "{}", barrier);
    }
    for undef in intrinsics::UNDEFINED_VALUES.iter() {
        assert!(m.get_function(&undef.name).is_none(), "{}", undef.name);
    }
    for name in intrinsics::SCAFFOLDING_FUNCTIONS {
        assert!(m.get_function(name).is_none(), "{}", name);
    }
    for g in m.global_ids() {
        assert!(!m.global(g).name.starts_with(intrinsics::SELECTOR_PREFIX));
    }
    // Only the lifted functions themselves remain
    let names: Vec<_> = m
        .function_ids()
        .into_iter()
        .map(|f| m.function(f).name.clone())
        .collect();
    assert_eq!(names, vec!["sub_1100", "sub_1110", "sub_1120"]);
    for f in m.function_ids() {
        let func = m.function(f);
        for i in func.instructions() {
            assert!(!matches!(func.inst(i).kind, InstKind::Call { .. }));
        }
    }
}

#[test]
fn mov_from_absolute_address_loads_from_the_reference() {
    let arch = x86();
    let m = lift_and_optimize(
        &[mov_from_memory(
            &arch,
            0x1200,
            MemoryOperand::absolute(0x401000, 32, AddressKind::MemoryRead),
        )],
        vec![(
            0x1200,
            InstructionXrefs {
                mem: Some(CrossReference::new(0x401000)),
                ..Default::default()
            },
        )],
    );
    let data = m.get_global("data_401000").unwrap();
    let func = m.function(m.get_function("sub_1200").unwrap());
    let loads: Vec<_> = func
        .instructions()
        .into_iter()
        .filter(|&i| func.inst(i).kind == InstKind::Load { addr: Value::Global(data) })
        .collect();
    assert_eq!(loads.len(), 1);
    assert_eq!(func.inst(loads[0]).ty, Type::Int(32));
    // ... and the loaded value ends up in EAX
    assert!(func.instructions().into_iter().any(|i| matches!(
        &func.inst(i).kind,
        InstKind::Store { value: Value::Inst(v), .. } if *v == loads[0]
    )));
}

#[test]
fn barriers_pass_the_memory_token_through() {
    let arch = x86();
    let m = lift_and_optimize(
        &[DecodedInstruction::new(&arch, 0x1300, vec![0x0f, 0xae, 0xf0], "MFENCE")],
        vec![],
    );
    let func = m.function(m.get_function("sub_1300").unwrap());
    let memory_slot = func
        .instructions()
        .into_iter()
        .find(|&i| {
            matches!(&func.inst(i).kind, InstKind::RegisterSlot { name, .. } if name == intrinsics::MEMORY_REGISTER)
        })
        .unwrap();
    let token = func
        .instructions()
        .into_iter()
        .find(|&i| func.inst(i).kind == InstKind::Load { addr: Value::Inst(memory_slot) })
        .unwrap();
    assert!(func.instructions().into_iter().any(|i| func.inst(i).kind
        == InstKind::Store {
            value: Value::Inst(token),
            addr: Value::Inst(memory_slot),
        }));
}

#[test]
fn stores_of_undefined_values_are_removed() {
    let mut m = Module::parse_from(
        r#"
module "m" pointer_bits 32
declare @__lift_undefined_8() -> i8
define @f(&Memory, &State, i32) -> &Memory {
entry:
  %0 = call i8 @__lift_undefined_8()
  %1 = zext %0 to i32
  %2 = cmp eq %1, 0:i32
  %3 = regslot %arg1, "EAX"
  store %1, %3
  store 1:i32, %3
  ret %arg0
}
"#,
    )
    .unwrap();
    crate::optimize::eliminate_undefined_values(&mut m);

    assert!(m.get_function("__lift_undefined_8").is_none());
    let func = m.function(m.get_function("f").unwrap());
    let kinds: Vec<_> = func
        .instructions()
        .into_iter()
        .map(|i| func.inst(i).kind.clone())
        .collect();
    assert_eq!(kinds.len(), 3);
    assert!(matches!(kinds[0], InstKind::RegisterSlot { .. }));
    assert!(matches!(
        &kinds[1],
        InstKind::Store { value, .. } if *value == Value::int(1, 32)
    ));
}

#[test]
fn lifted_semantics_survive_a_print_parse_round_trip() {
    let mut m = semantics_module();
    let mut ctx = translation_context(vec![]);
    let arch = ctx.arch.clone();
    lift(&mut m, &mut ctx, &mov_immediate(&arch, 0x1400, 7));
    let printed = m.to_string();
    let reparsed = Module::parse_from(&printed).unwrap();
    assert_eq!(reparsed.to_string(), printed);
}

#[test]
fn command_line_configuration() {
    use CommandLineOptimizerConfig::*;
    let config = OptimizerConfig::from(vec![DisableLoopUnrolling, DisableSizeOptimization]);
    assert!(!config.pipeline.unroll_loops);
    assert_eq!(config.pipeline.size_level, 0);
    assert!(config.run_standard_pipeline);
    assert_eq!(OptimizerConfig::from(vec![]), OptimizerConfig::default());
    assert!(!OptimizerConfig::from(vec![DisableStandardPipeline]).run_standard_pipeline);
}
