//! The default, cross-reference-unaware way of lifting a decoded instruction.
//!
//! Instruction semantics live in the module itself: each instruction form has a selector global
//! `ISEL_<form>` whose initializer is the semantic function implementing it. Lifting an instruction
//! means lifting each of its operands to an IR value, then emitting a call to that semantic
//! function. Operand lifting goes through [`OperandLifter`], so that other strategies (such as
//! [`InstructionLifter`](crate::instruction_lifter::InstructionLifter)) can intercept individual
//! operands and fall back to the free functions of this module for everything else.

use crate::intrinsics::{MEMORY_REGISTER, SELECTOR_PREFIX};
use crate::ir::{CastOp, FuncId, Function, FunctionType, Module, Type, Value};
use crate::ir_builder::{BlockRef, Builder};
use crate::log::*;
use itertools::Itertools;

/// An architecture that instructions can be lifted for
#[derive(Clone, Debug)]
pub struct Arch {
    pub name: String,
    /// Width of an address, in bits
    pub address_size: u32,
    /// Register holding the address of the current instruction
    pub pc_reg: String,
    /// Register holding the address of the instruction to execute next
    pub next_pc_reg: String,
    pub memory_type: Type,
    pub state_type: Type,
}

impl Arch {
    pub fn new(name: impl Into<String>, address_size: u32) -> Self {
        Self {
            name: name.into(),
            address_size,
            pc_reg: "PC".into(),
            next_pc_reg: "NEXT_PC".into(),
            memory_type: Type::memory(),
            state_type: Type::state(),
        }
    }

    /// The integer type of an address
    pub fn address_type(&self) -> Type {
        Type::Int(self.address_size)
    }

    /// The signature of every lifted block: `(memory, state, pc) -> memory`
    pub fn lifted_function_type(&self) -> FunctionType {
        FunctionType {
            params: vec![
                self.memory_type.clone(),
                self.state_type.clone(),
                self.address_type(),
            ],
            ret: self.memory_type.clone(),
        }
    }

    /// Add a new function with the lifted signature to `module`, returning its (empty) entry
    /// block.
    pub fn define_lifted_function(&self, module: &mut Module, name: &str) -> BlockRef {
        let ty = self.lifted_function_type();
        let mut f = Function::new(name, ty.params, ty.ret);
        let block = f.add_block("entry");
        let func = module.add_function(f);
        BlockRef { func, block }
    }

    fn is_pc_register(&self, name: &str) -> bool {
        name == self.pc_reg || name == self.next_pc_reg
    }
}

/// Whether an operand is read or written by its instruction
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Action {
    Read,
    Write,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Register {
    pub name: String,
    /// Width in bits
    pub size: u32,
}

impl Register {
    pub fn new(name: impl Into<String>, size: u32) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }
}

/// What a memory operand's address is used for
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AddressKind {
    MemoryRead,
    MemoryWrite,
    /// The address is computed but never dereferenced (e.g. `lea`)
    AddressCalculation,
    /// The address is where control goes next (e.g. the target of a `call`)
    ControlFlowTarget,
}

/// `segment:[base + index * scale + displacement]`
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct MemoryOperand {
    /// Register holding the base address of the segment
    pub segment: Option<Register>,
    pub base: Option<Register>,
    pub index: Option<Register>,
    pub scale: u64,
    pub displacement: i64,
    /// Width of the computed address, in bits
    pub address_size: u32,
    pub kind: AddressKind,
}

impl MemoryOperand {
    /// An absolute memory operand, `[displacement]`
    pub fn absolute(displacement: i64, address_size: u32, kind: AddressKind) -> Self {
        Self {
            segment: None,
            base: None,
            index: None,
            scale: 1,
            displacement,
            address_size,
            kind,
        }
    }

    pub fn is_control_flow_target(&self) -> bool {
        self.kind == AddressKind::ControlFlowTarget
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum OperandKind {
    Register(Register),
    Immediate { value: u64, is_signed: bool },
    Address(MemoryOperand),
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Operand {
    pub action: Action,
    /// Width of the operand's value, in bits
    pub size: u32,
    pub kind: OperandKind,
}

impl Operand {
    pub fn register(action: Action, reg: Register) -> Self {
        Self {
            action,
            size: reg.size,
            kind: OperandKind::Register(reg),
        }
    }

    pub fn immediate(value: u64, size: u32) -> Self {
        Self {
            action: Action::Read,
            size,
            kind: OperandKind::Immediate {
                value,
                is_signed: false,
            },
        }
    }

    pub fn address(action: Action, mem: MemoryOperand) -> Self {
        Self {
            action,
            size: mem.address_size,
            kind: OperandKind::Address(mem),
        }
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let action = match self.action {
            Action::Read => "READ_OP",
            Action::Write => "WRITE_OP",
        };
        write!(f, "({} ", action)?;
        match &self.kind {
            OperandKind::Register(r) => write!(f, "(REG_{} {})", r.size, r.name)?,
            OperandKind::Immediate { value, is_signed } => write!(
                f,
                "({}_{} {:#x})",
                if *is_signed { "IMM" } else { "UIMM" },
                self.size,
                value
            )?,
            OperandKind::Address(mem) => {
                write!(f, "(ADDR_{} {:?}", mem.address_size, mem.kind)?;
                if let Some(r) = &mem.segment {
                    write!(f, " (SEGMENT {})", r.name)?;
                }
                if let Some(r) = &mem.base {
                    write!(f, " (BASE {})", r.name)?;
                }
                if let Some(r) = &mem.index {
                    write!(f, " (INDEX {} {})", r.name, mem.scale)?;
                }
                write!(f, " (DISP {:#x}))", mem.displacement)?;
            }
        }
        write!(f, ")")
    }
}

/// A machine instruction, decoded into its semantics selector and operands
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DecodedInstruction {
    pub arch_name: String,
    pub pc: u64,
    pub bytes: Vec<u8>,
    /// Name of the instruction form; `ISEL_<function>` selects its semantics
    pub function: String,
    pub operands: Vec<Operand>,
    pub is_valid: bool,
}

impl DecodedInstruction {
    pub fn new(arch: &Arch, pc: u64, bytes: Vec<u8>, function: impl Into<String>) -> Self {
        Self {
            arch_name: arch.name.clone(),
            pc,
            bytes,
            function: function.into(),
            operands: vec![],
            is_valid: true,
        }
    }

    pub fn with_operand(mut self, op: Operand) -> Self {
        self.operands.push(op);
        self
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Address of the next instruction in sequence
    pub fn next_pc(&self) -> u64 {
        self.pc.wrapping_add(self.size())
    }
}

impl std::fmt::Display for DecodedInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({} {:x} {} (BYTES {})",
            self.arch_name,
            self.pc,
            if self.function.is_empty() {
                "INVALID"
            } else {
                self.function.as_str()
            },
            self.bytes.iter().map(|b| format!("{:02x}", b)).join(" ")
        )?;
        for op in &self.operands {
            write!(f, " {}", op)?;
        }
        write!(f, ")")
    }
}

/// Outcome of lifting one instruction
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum LiftStatus {
    Lifted,
    InvalidInstruction,
    UnsupportedInstruction,
    UnsupportedArchitecture,
}

/// A strategy for lifting instructions, operand by operand. Every method defaults to the
/// corresponding free function of this module.
pub trait OperandLifter {
    fn arch(&self) -> &Arch;

    fn lift_into_block(
        &mut self,
        module: &mut Module,
        inst: &DecodedInstruction,
        block: BlockRef,
        is_delayed: bool,
    ) -> LiftStatus {
        lift_into_block(self, module, inst, block, is_delayed)
    }

    fn lift_immediate_operand(
        &mut self,
        module: &mut Module,
        _inst: &DecodedInstruction,
        block: BlockRef,
        param: &Type,
        op: &Operand,
    ) -> Value {
        lift_immediate_operand(module, block, param, op)
    }

    fn lift_address_operand(
        &mut self,
        module: &mut Module,
        inst: &DecodedInstruction,
        block: BlockRef,
        param: &Type,
        op: &Operand,
    ) -> Value {
        lift_address_operand(self.arch(), module, inst, block, param, op)
    }

    fn lift_register_operand(
        &mut self,
        module: &mut Module,
        _inst: &DecodedInstruction,
        block: BlockRef,
        param: &Type,
        op: &Operand,
    ) -> Value {
        lift_register_operand(module, block, param, op)
    }
}

/// The semantic function for instruction form `function`, if its selector exists and names one
pub fn find_semantics(module: &Module, function: &str) -> Option<FuncId> {
    let isel = module.get_global(&format!("{}{}", SELECTOR_PREFIX, function))?;
    match module.global(isel).initializer {
        Some(Value::Function(f)) => Some(f),
        _ => None,
    }
}

/// Lift `inst` by calling its semantic function at the end of `block`, lifting each operand
/// through `lifter`. Unless `is_delayed`, also advances the next-PC register past `inst`.
pub fn lift_into_block<L: OperandLifter + ?Sized>(
    lifter: &mut L,
    module: &mut Module,
    inst: &DecodedInstruction,
    block: BlockRef,
    is_delayed: bool,
) -> LiftStatus {
    if !inst.is_valid || inst.function.is_empty() {
        return LiftStatus::InvalidInstruction;
    }
    if inst.arch_name != lifter.arch().name {
        debug!("Instruction from another architecture"; "instruction" => %inst, "arch" => &lifter.arch().name);
        return LiftStatus::UnsupportedArchitecture;
    }

    let sem = match find_semantics(module, &inst.function) {
        Some(sem) => sem,
        None => {
            warn!("Missing semantics for instruction"; "pc" => format!("{:#x}", inst.pc), "instruction" => %inst);
            return LiftStatus::UnsupportedInstruction;
        }
    };

    let params = module.function(sem).ty.params.clone();
    if params.len() < 2 || params.len() - 2 != inst.operands.len() {
        error!(
            "Semantic function does not match the instruction's operands";
            "pc" => format!("{:#x}", inst.pc),
            "semantics" => &module.function(sem).name,
            "num_params" => params.len(),
            "num_operands" => inst.operands.len(),
            "instruction" => %inst
        );
        return LiftStatus::InvalidInstruction;
    }

    let mut args = vec![];
    for (op, param) in inst.operands.iter().zip(&params[2..]) {
        let arg = match &op.kind {
            OperandKind::Register(_) => {
                lifter.lift_register_operand(module, inst, block, param, op)
            }
            OperandKind::Immediate { .. } => {
                lifter.lift_immediate_operand(module, inst, block, param, op)
            }
            OperandKind::Address(_) => lifter.lift_address_operand(module, inst, block, param, op),
        };
        args.push(arg);
    }

    let state = Value::Arg(1);
    let memory_type = lifter.arch().memory_type.clone();
    let next_pc_reg = lifter.arch().next_pc_reg.clone();
    let address_size = lifter.arch().address_size;

    let mut b = Builder::at_end(module, block);
    let memory_slot = b.register_slot(state.clone(), MEMORY_REGISTER);
    let memory = b.load(memory_type, memory_slot.clone());
    let memory = b.call(sem, [memory, state.clone()].into_iter().chain(args).collect());
    b.store(memory, memory_slot);
    if !is_delayed {
        let next_pc = b.register_slot(state, &next_pc_reg);
        b.store(Value::int(inst.next_pc(), address_size), next_pc);
    }

    trace!("Lifted instruction"; "pc" => format!("{:#x}", inst.pc), "semantics" => &inst.function);
    LiftStatus::Lifted
}

/// The literal value of an immediate operand, at the width of `param`
pub fn lift_immediate_operand(
    module: &mut Module,
    block: BlockRef,
    param: &Type,
    op: &Operand,
) -> Value {
    let (value, is_signed) = match &op.kind {
        OperandKind::Immediate { value, is_signed } => (*value, *is_signed),
        k => panic!("Expected an immediate operand, got {:?}", k),
    };
    let value = if is_signed {
        crate::ir::sign_extend_from_bits(value, op.size) as u64
    } else {
        crate::ir::truncate_to_bits(value, op.size)
    };
    match param {
        Type::Int(bits) => Value::int(value, *bits),
        _ => {
            let v = Value::int(value, op.size);
            Builder::at_end(module, block).cast(CastOp::Bitcast, v, param.clone())
        }
    }
}

/// Read a register of width `reg.size` and convert it to `ty`
fn read_register(b: &mut Builder, reg: &Register, ty: &Type) -> Value {
    let slot = b.register_slot(Value::Arg(1), &reg.name);
    match ty {
        Type::Int(bits) => {
            let v = b.load(Type::Int(reg.size), slot);
            match (*bits).cmp(&reg.size) {
                std::cmp::Ordering::Equal => v,
                std::cmp::Ordering::Less => b.trunc(v, ty.clone()),
                std::cmp::Ordering::Greater => b.cast(CastOp::ZExt, v, ty.clone()),
            }
        }
        _ => b.load(ty.clone(), slot),
    }
}

/// A register operand. Read operands become the register's current value; written operands
/// become the address of the register within the processor state.
pub fn lift_register_operand(
    module: &mut Module,
    block: BlockRef,
    param: &Type,
    op: &Operand,
) -> Value {
    let reg = match &op.kind {
        OperandKind::Register(reg) => reg,
        k => panic!("Expected a register operand, got {:?}", k),
    };
    let mut b = Builder::at_end(module, block);
    match op.action {
        Action::Read => read_register(&mut b, reg, param),
        Action::Write => b.register_slot(Value::Arg(1), &reg.name),
    }
}

/// The address computed by a memory operand: `segment + base + index * scale + displacement`, at
/// the architecture's address width. References to the program counter resolve to constants, so
/// absolute and PC-relative operands fold down to constant addresses.
pub fn lift_address_operand(
    arch: &Arch,
    module: &mut Module,
    inst: &DecodedInstruction,
    block: BlockRef,
    param: &Type,
    op: &Operand,
) -> Value {
    let mem = match &op.kind {
        OperandKind::Address(mem) => mem,
        k => panic!("Expected an address operand, got {:?}", k),
    };
    let addr_ty = arch.address_type();
    let mut b = Builder::at_end(module, block);
    let register = |b: &mut Builder, reg: &Option<Register>| match reg {
        None => Value::int(0, arch.address_size),
        Some(r) if r.name == arch.pc_reg => Value::int(inst.pc, arch.address_size),
        Some(r) if r.name == arch.next_pc_reg => Value::int(inst.next_pc(), arch.address_size),
        Some(r) => read_register(b, r, &addr_ty),
    };

    let segment = register(&mut b, &mem.segment);
    let base = register(&mut b, &mem.base);
    let index = register(&mut b, &mem.index);

    let scaled = b.mul(index, Value::int(mem.scale, arch.address_size));
    let addr = b.add(base, scaled);
    let addr = b.add(addr, Value::int(mem.displacement as u64, arch.address_size));
    let mut addr = b.add(segment, addr);

    if mem.address_size < arch.address_size {
        addr = b.trunc(addr, Type::Int(mem.address_size));
        addr = b.cast(CastOp::ZExt, addr, addr_ty);
    }
    address_to_param(arch, &mut b, addr, param)
}

/// Convert an address-width integer to the type of a semantic function's parameter
pub fn address_to_param(arch: &Arch, b: &mut Builder, addr: Value, param: &Type) -> Value {
    match param {
        Type::Int(bits) if *bits < arch.address_size => b.trunc(addr, param.clone()),
        Type::Int(bits) if *bits > arch.address_size => b.cast(CastOp::ZExt, addr, param.clone()),
        Type::Int(_) => addr,
        _ => b.int_to_ptr(addr),
    }
}

impl MemoryOperand {
    /// Whether the operand's address is known statically: no registers other than the program
    /// counter take part in it.
    pub fn is_absolute_or_pc_relative(&self, arch: &Arch) -> bool {
        self.index.is_none()
            && match &self.base {
                None => true,
                Some(r) => arch.is_pc_register(&r.name),
            }
    }
}

/// The default strategy, which lifts every operand with the free functions of this module
#[derive(Clone, Debug)]
pub struct DefaultLifter {
    pub arch: Arch,
}

impl OperandLifter for DefaultLifter {
    fn arch(&self) -> &Arch {
        &self.arch
    }
}
