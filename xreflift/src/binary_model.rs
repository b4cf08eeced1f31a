//! The pre-built model of the binary being translated: its segments, and the cross-references
//! resolved for each instruction's operands.

use crate::containers::unordered::UnorderedMap;
use crate::ir::{GlobalVariable, Linkage, Module, Type, Value};
use crate::log::*;

/// "This operand's true value is an address", as resolved by whatever built the binary model.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CrossReference {
    pub target_address: u64,
    /// Bits of `target_address` that are actually referenced
    pub mask: Option<u64>,
}

impl CrossReference {
    pub fn new(target_address: u64) -> Self {
        Self {
            target_address,
            mask: None,
        }
    }

    pub fn masked(target_address: u64, mask: u64) -> Self {
        Self {
            target_address,
            mask: Some(mask),
        }
    }

    /// The referenced address, with the mask applied
    pub fn effective_address(&self) -> u64 {
        match self.mask {
            Some(mask) => self.target_address & mask,
            None => self.target_address,
        }
    }
}

/// The cross-references attached to a single instruction, one per interpretation slot.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct InstructionXrefs {
    /// The whole memory operand is this address
    pub mem: Option<CrossReference>,
    /// An immediate operand is this address
    pub imm: Option<CrossReference>,
    /// The displacement of a memory operand is this address
    pub disp: Option<CrossReference>,
}

impl InstructionXrefs {
    pub fn is_empty(&self) -> bool {
        self.mem.is_none() && self.imm.is_none() && self.disp.is_none()
    }
}

/// A contiguous range of the binary's address space
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Segment {
    pub name: String,
    pub start: u64,
    pub size: u64,
    pub is_read_only: bool,
}

impl Segment {
    pub fn contains(&self, address: u64) -> bool {
        self.start <= address && address - self.start < self.size
    }
}

/// The binary's segments and cross-references.
#[derive(Default, Debug)]
pub struct BinaryModel {
    segments: Vec<Segment>,
    xrefs: UnorderedMap<u64, InstructionXrefs>,
}

impl BinaryModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_segment(&mut self, segment: Segment) {
        if let Some(other) = self
            .segments
            .iter()
            .find(|s| s.contains(segment.start) || segment.contains(s.start))
        {
            warn!("Overlapping segments"; "new" => &segment.name, "existing" => &other.name);
        }
        self.segments.push(segment);
    }

    /// Attach cross-references to the instruction at `pc`, replacing any previous ones
    pub fn add_xrefs(&mut self, pc: u64, xrefs: InstructionXrefs) {
        if !xrefs.is_empty() {
            self.xrefs.insert(pc, xrefs);
        }
    }

    /// The segment containing `address`, if any
    pub fn try_get_segment(&self, address: u64) -> Option<&Segment> {
        self.segments.iter().find(|s| s.contains(address))
    }

    /// The cross-references of the instruction at `pc`; empty if there are none
    pub fn xrefs_at(&self, pc: u64) -> InstructionXrefs {
        self.xrefs.get(&pc).copied().unwrap_or_default()
    }
}

/// Turns a raw address of the original binary into a stable IR value.
pub trait ReferenceMaterializer {
    /// An integer value of the module's pointer width that denotes `address`
    fn materialize(&mut self, module: &mut Module, model: &BinaryModel, address: u64) -> Value;
}

/// Represents every referenced address as the address of a global variable placed at that
/// address. Repeated references to the same address share the global.
#[derive(Default, Debug)]
pub struct SymbolMaterializer;

impl SymbolMaterializer {
    fn symbol_name(model: &BinaryModel, address: u64) -> String {
        match model.try_get_segment(address) {
            Some(seg) => format!(
                "{}_{:x}",
                seg.name.trim_start_matches('.').replace(['.', ' '], "_"),
                address
            ),
            None => format!("data_{:x}", address),
        }
    }
}

impl ReferenceMaterializer for SymbolMaterializer {
    fn materialize(&mut self, module: &mut Module, model: &BinaryModel, address: u64) -> Value {
        let name = Self::symbol_name(model, address);
        let g = match module.get_global(&name) {
            Some(g) => g,
            None => {
                let seg = model.try_get_segment(address);
                if seg.is_none() {
                    debug!("Materializing reference outside of any segment"; "address" => format!("{:#x}", address));
                }
                let mut g = GlobalVariable::new(name, Type::Int(8));
                g.address = Some(address);
                g.linkage = Linkage::External;
                g.is_constant = seg.map_or(false, |s| s.is_read_only);
                module.add_global(g)
            }
        };
        Value::GlobalAddr(g)
    }
}
