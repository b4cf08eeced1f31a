//! Lifting of instructions whose operands may carry cross-references.
//!
//! The binary model may know that some operand of an instruction is really an address into the
//! binary: the whole memory operand (`mem`), an immediate (`imm`), or just the displacement of a
//! memory operand (`disp`). A disassembler does not always attach these to the right operand, so
//! [`InstructionLifter`] decides per operand which interpretation applies, substitutes the
//! materialized reference for the literal, and complains about any reference it could not place.

use crate::binary_model::{BinaryModel, CrossReference, ReferenceMaterializer};
use crate::ir::{Module, Type, Value};
use crate::ir_builder::{BlockRef, Builder};
use crate::log::*;
use crate::semantics::{
    self, Arch, DecodedInstruction, LiftStatus, Operand, OperandKind, OperandLifter,
};

/// Everything the lifter needs to know about the binary being translated
pub struct TranslationContext {
    pub arch: Arch,
    pub model: BinaryModel,
    pub materializer: Box<dyn ReferenceMaterializer>,
}

impl TranslationContext {
    pub fn new(
        arch: Arch,
        model: BinaryModel,
        materializer: Box<dyn ReferenceMaterializer>,
    ) -> Self {
        Self {
            arch,
            model,
            materializer,
        }
    }
}

/// Which interpretation of an instruction a cross-reference was attached to
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum XrefSlot {
    Memory,
    Immediate,
    Displacement,
}

impl XrefSlot {
    pub fn name(self) -> &'static str {
        match self {
            XrefSlot::Memory => "memory",
            XrefSlot::Immediate => "immediate",
            XrefSlot::Displacement => "displacement",
        }
    }
}

/// A cross-reference, materialized for the instruction currently being lifted
#[derive(Clone, Debug)]
pub struct ResolvedReference {
    pub xref: CrossReference,
    /// The (masked) target address, as an IR value
    pub value: Value,
    pub used: bool,
}

/// Cross-references of the instruction currently being lifted. Lives for a single
/// [`InstructionLifter::lift_into_block`] call.
#[derive(Clone, Default, Debug)]
pub struct LiftContext {
    pub mem: Option<ResolvedReference>,
    pub imm: Option<ResolvedReference>,
    pub disp: Option<ResolvedReference>,
}

impl LiftContext {
    fn slots(&self) -> [(XrefSlot, &Option<ResolvedReference>); 3] {
        [
            (XrefSlot::Memory, &self.mem),
            (XrefSlot::Immediate, &self.imm),
            (XrefSlot::Displacement, &self.disp),
        ]
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DiagnosticKind {
    /// A cross-reference was attached to the instruction but no operand consumed it
    UnusedReference(XrefSlot),
    /// An address-sized immediate that points into the binary has no cross-reference
    MissedReferenceCandidate,
    /// A memory reference was really the displacement of an indexed operand
    MisclassifiedMemoryOperand,
}

/// An anomaly noticed while lifting. Each is also logged as it is found.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Address of the instruction
    pub pc: u64,
    /// The address involved: the reference target, or the suspicious immediate
    pub address: u64,
}

/// The cross-reference-aware lifting strategy. Operands without applicable cross-references are
/// lifted the default way.
pub struct InstructionLifter<'a> {
    ctx: &'a mut TranslationContext,
    refs: LiftContext,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> InstructionLifter<'a> {
    pub fn new(ctx: &'a mut TranslationContext) -> Self {
        Self {
            ctx,
            refs: Default::default(),
            diagnostics: vec![],
        }
    }

    /// Anomalies found so far, in the order they were found
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    /// References of the most recently lifted instruction
    pub fn lift_context(&self) -> &LiftContext {
        &self.refs
    }

    /// Materialize `xref`, if there is one
    fn get_address(
        &mut self,
        module: &mut Module,
        xref: Option<CrossReference>,
    ) -> Option<ResolvedReference> {
        let xref = xref?;
        let value = self.ctx.materializer.materialize(
            module,
            &self.ctx.model,
            xref.effective_address(),
        );
        Some(ResolvedReference {
            xref,
            value,
            used: false,
        })
    }

    fn report(&mut self, kind: DiagnosticKind, pc: u64, address: u64) {
        self.diagnostics.push(Diagnostic { kind, pc, address });
    }

    /// `dynamic + reference` as the type of `param`, where `dynamic` is the address computed by
    /// `op` the default way with its displacement zeroed out
    fn add_to_dynamic_address(
        &mut self,
        module: &mut Module,
        inst: &DecodedInstruction,
        block: BlockRef,
        param: &Type,
        op: &Operand,
        reference: Value,
    ) -> Value {
        let mut op = op.clone();
        if let OperandKind::Address(mem) = &mut op.kind {
            mem.displacement = 0;
        }
        let arch = &self.ctx.arch;
        let addr_ty = arch.address_type();
        let dynamic = semantics::lift_address_operand(arch, module, inst, block, &addr_ty, &op);
        let mut b = Builder::at_end(module, block);
        let addr = b.add(dynamic, reference);
        semantics::address_to_param(arch, &mut b, addr, param)
    }

    /// `reference` as the type of `param`
    fn reference_as_param(
        &self,
        module: &mut Module,
        block: BlockRef,
        param: &Type,
        reference: Value,
    ) -> Value {
        let mut b = Builder::at_end(module, block);
        semantics::address_to_param(&self.ctx.arch, &mut b, reference, param)
    }
}

impl<'a> OperandLifter for InstructionLifter<'a> {
    fn arch(&self) -> &Arch {
        &self.ctx.arch
    }

    fn lift_into_block(
        &mut self,
        module: &mut Module,
        inst: &DecodedInstruction,
        block: BlockRef,
        is_delayed: bool,
    ) -> LiftStatus {
        let xrefs = self.ctx.model.xrefs_at(inst.pc);
        self.refs = LiftContext {
            mem: self.get_address(module, xrefs.mem),
            imm: self.get_address(module, xrefs.imm),
            disp: self.get_address(module, xrefs.disp),
        };

        let status = semantics::lift_into_block(self, module, inst, block, is_delayed);

        // Only instructions we have semantics for had a chance to consume their references
        if status == LiftStatus::Lifted {
            let unused: Vec<(XrefSlot, CrossReference)> = self
                .refs
                .slots()
                .iter()
                .filter_map(|(slot, r)| match r {
                    Some(r) if !r.used => Some((*slot, r.xref)),
                    _ => None,
                })
                .collect();
            for (slot, xref) in unused {
                error!(
                    "Unused operand reference";
                    "slot" => slot.name(),
                    "target" => format!("{:#x}", xref.target_address),
                    OptionalKV("mask", xref.mask.map(|m| format!("{:#x}", m))),
                    "instruction" => %inst
                );
                self.report(DiagnosticKind::UnusedReference(slot), inst.pc, xref.target_address);
            }
        }

        status
    }

    fn lift_immediate_operand(
        &mut self,
        module: &mut Module,
        inst: &DecodedInstruction,
        block: BlockRef,
        param: &Type,
        op: &Operand,
    ) -> Value {
        let address_size = self.ctx.arch.address_size;
        if let Some(r) = self.refs.imm.as_mut().filter(|r| !r.used) {
            r.used = true;
            let value = r.value.clone();

            let arg_size = module.data_layout.bit_width(param);
            assert!(
                arg_size <= address_size,
                "Immediate operand size {} of {} in instruction {:#x} is wider than the \
                 architecture address size ({})",
                op.size,
                op,
                inst.pc,
                address_size,
            );

            let ref_ty = module.value_type(block.func, &value);
            if *param != ref_ty && arg_size < address_size {
                return Builder::at_end(module, block).trunc(value, param.clone());
            }
            return value;
        }

        if let OperandKind::Immediate { value, .. } = op.kind {
            if op.size == address_size
                && value >= 4096
                && self.ctx.model.try_get_segment(value).is_some()
            {
                warn!(
                    "Immediate operand is a missed cross-reference candidate";
                    "operand" => %op,
                    "instruction" => %inst
                );
                self.report(DiagnosticKind::MissedReferenceCandidate, inst.pc, value);
            }
        }

        semantics::lift_immediate_operand(module, block, param, op)
    }

    fn lift_address_operand(
        &mut self,
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

        // Code references are resolved by whoever handles control flow; keep the static address.
        if mem.is_control_flow_target() {
            return semantics::lift_address_operand(&self.ctx.arch, module, inst, block, param, op);
        }

        if mem.is_absolute_or_pc_relative(&self.ctx.arch) {
            if let Some(r) = &mut self.refs.mem {
                r.used = true;
                let reference = r.value.clone();
                return self.reference_as_param(module, block, param, reference);
            }
            if let Some(r) = &mut self.refs.disp {
                r.used = true;
                let reference = r.value.clone();
                return self.reference_as_param(module, block, param, reference);
            }
        } else if let Some(r) = &mut self.refs.disp {
            // e.g. `mov eax, [jump_table + edi * 4]`
            r.used = true;
            let reference = r.value.clone();
            return self.add_to_dynamic_address(module, inst, block, param, op, reference);
        } else if let Some(r) = self
            .refs
            .mem
            .as_mut()
            .filter(|r| mem.displacement as u64 == r.xref.target_address)
        {
            r.used = true;
            let reference = r.value.clone();
            error!(
                "Memory operand was probably decoded as an absolute memory reference when it \
                 should be treated as a displacement reference";
                "operand" => %op,
                "pc" => format!("{:#x}", inst.pc)
            );
            self.report(
                DiagnosticKind::MisclassifiedMemoryOperand,
                inst.pc,
                mem.displacement as u64,
            );
            return self.add_to_dynamic_address(module, inst, block, param, op, reference);
        }

        semantics::lift_address_operand(&self.ctx.arch, module, inst, block, param, op)
    }
}
