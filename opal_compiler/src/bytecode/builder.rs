//! Function builder: bytecode emission with label resolution.

use super::code_object::{CodeFlags, CodeObject, Const, ExceptionEntry, LineTableEntry};
use super::instruction::{ConstIndex, Instruction, Opcode, Register};
use opal_core::Value;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// An abstract jump target. Labels are created unbound, referenced by
/// jump emissions, and bound to a position later; a relocation pass at
/// [`FunctionBuilder::finish`] rewrites every referencing jump to the
/// final relative offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

/// A jump emitted before its label was bound.
#[derive(Debug)]
struct PendingJump {
    pc: usize,
    label: Label,
}

/// Key for constant-pool deduplication of simple values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    None,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(Arc<str>),
}

impl ConstKey {
    fn from_value(value: &Value) -> Option<ConstKey> {
        match value {
            Value::None => Some(ConstKey::None),
            Value::Bool(b) => Some(ConstKey::Bool(*b)),
            Value::Int(i) => i.to_i64().map(ConstKey::Int),
            Value::Float(f) => Some(ConstKey::Float(f.to_bits())),
            Value::Str(s) => Some(ConstKey::Str(s.clone())),
            _ => None,
        }
    }
}

/// Builder for a single code object.
pub struct FunctionBuilder {
    name: Arc<str>,
    qualname: Arc<str>,
    filename: Arc<str>,
    first_line: u32,
    current_line: u32,

    instructions: Vec<Instruction>,

    consts: Vec<Const>,
    const_map: FxHashMap<ConstKey, ConstIndex>,

    names: Vec<Arc<str>>,
    name_map: FxHashMap<Arc<str>, u16>,

    varnames: Vec<Arc<str>>,
    cellvars: Vec<Arc<str>>,
    freevars: Vec<Arc<str>>,
    cell2arg: Vec<u16>,

    arg_count: u16,
    posonly_count: u16,
    kwonly_count: u16,
    flags: CodeFlags,

    next_register: u16,
    max_registers: u16,
    free_registers: Vec<Register>,

    next_label: u32,
    labels: FxHashMap<Label, usize>,
    pending_jumps: Vec<PendingJump>,

    exception_table: Vec<ExceptionEntry>,

    line_table: Vec<LineTableEntry>,
    line_start_pc: u32,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<Arc<str>>, filename: impl Into<Arc<str>>) -> Self {
        let name = name.into();
        FunctionBuilder {
            qualname: name.clone(),
            name,
            filename: filename.into(),
            first_line: 1,
            current_line: 1,
            instructions: Vec::new(),
            consts: Vec::new(),
            const_map: FxHashMap::default(),
            names: Vec::new(),
            name_map: FxHashMap::default(),
            varnames: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            cell2arg: Vec::new(),
            arg_count: 0,
            posonly_count: 0,
            kwonly_count: 0,
            flags: CodeFlags::NONE,
            next_register: 0,
            max_registers: 0,
            free_registers: Vec::new(),
            next_label: 0,
            labels: FxHashMap::default(),
            pending_jumps: Vec::new(),
            exception_table: Vec::new(),
            line_table: Vec::new(),
            line_start_pc: 0,
        }
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    pub fn set_qualname(&mut self, qualname: impl Into<Arc<str>>) {
        self.qualname = qualname.into();
    }

    pub fn set_first_line(&mut self, line: u32) {
        self.first_line = line;
        self.current_line = line;
    }

    /// Record the source line for subsequently emitted instructions.
    pub fn set_line(&mut self, line: u32) {
        if line != 0 && line != self.current_line {
            let pc = self.instructions.len() as u32;
            if pc > self.line_start_pc {
                self.line_table.push(LineTableEntry {
                    start_pc: self.line_start_pc,
                    end_pc: pc,
                    line: self.current_line,
                });
            }
            self.current_line = line;
            self.line_start_pc = pc;
        }
    }

    pub fn set_arg_counts(&mut self, args: u16, posonly: u16, kwonly: u16) {
        self.arg_count = args;
        self.posonly_count = posonly;
        self.kwonly_count = kwonly;
    }

    pub fn add_flags(&mut self, flags: CodeFlags) {
        self.flags |= flags;
    }

    pub fn flags(&self) -> CodeFlags {
        self.flags
    }

    /// Install the variable tables produced by scope analysis. Parameters
    /// occupy the leading `varnames` slots.
    pub fn set_variables(
        &mut self,
        varnames: Vec<Arc<str>>,
        cellvars: Vec<Arc<str>>,
        freevars: Vec<Arc<str>>,
        cell2arg: Vec<u16>,
    ) {
        debug_assert_eq!(cellvars.len(), cell2arg.len());
        self.varnames = varnames;
        self.cellvars = cellvars;
        self.freevars = freevars;
        self.cell2arg = cell2arg;
    }

    // =========================================================================
    // Registers
    // =========================================================================

    /// Allocate a scratch register, reusing freed ones first.
    pub fn alloc_register(&mut self) -> Register {
        if let Some(reg) = self.free_registers.pop() {
            return reg;
        }
        let reg = self.next_register;
        assert!(reg < 256, "function needs more than 256 registers");
        self.next_register += 1;
        self.max_registers = self.max_registers.max(self.next_register);
        Register(reg as u8)
    }

    /// Allocate `count` adjacent registers, returning the first. Used for
    /// call argument windows and builder element runs.
    pub fn alloc_register_run(&mut self, count: u16) -> Register {
        let base = self.next_register;
        assert!(base + count <= 256, "function needs more than 256 registers");
        self.next_register += count;
        self.max_registers = self.max_registers.max(self.next_register);
        Register(base as u8)
    }

    /// Release a run allocated by [`Self::alloc_register_run`] by rolling
    /// the allocator back to `base`. Every register at or above `base`
    /// must be dead at this point.
    pub fn free_register_run(&mut self, base: Register) {
        debug_assert!((base.0 as u16) <= self.next_register);
        self.next_register = base.0 as u16;
        // Individually freed registers above the new watermark are stale.
        self.free_registers
            .retain(|r| (r.0 as u16) < self.next_register);
    }

    pub fn free_register(&mut self, reg: Register) {
        self.free_registers.push(reg);
    }

    /// Reserve register 0 (return/yield) and the leading registers for
    /// parameters and named locals.
    pub fn reserve_locals(&mut self, count: u16) {
        debug_assert_eq!(self.next_register, 0);
        self.next_register = super::code_object::FIRST_LOCAL_REGISTER as u16 + count;
        assert!(
            self.next_register <= 256,
            "function needs more than 256 registers"
        );
        self.max_registers = self.max_registers.max(self.next_register);
    }

    // =========================================================================
    // Pools
    // =========================================================================

    /// Add a constant, deduplicating simple values.
    pub fn add_const(&mut self, value: Value) -> ConstIndex {
        if let Some(key) = ConstKey::from_value(&value) {
            if let Some(&idx) = self.const_map.get(&key) {
                return idx;
            }
            let idx = ConstIndex::new(self.consts.len() as u16);
            self.consts.push(Const::Value(value));
            self.const_map.insert(key, idx);
            idx
        } else {
            let idx = ConstIndex::new(self.consts.len() as u16);
            self.consts.push(Const::Value(value));
            idx
        }
    }

    /// Add a nested code object constant. Never deduplicated.
    pub fn add_code_const(&mut self, code: Arc<CodeObject>) -> ConstIndex {
        let idx = ConstIndex::new(self.consts.len() as u16);
        self.consts.push(Const::Code(code));
        idx
    }

    /// Add a keyword-name list constant for a `KwNames` announcement.
    pub fn add_names_const(&mut self, names: Vec<Arc<str>>) -> ConstIndex {
        let idx = ConstIndex::new(self.consts.len() as u16);
        self.consts.push(Const::Names(names.into_boxed_slice()));
        idx
    }

    /// Add a name and return its index.
    pub fn add_name(&mut self, name: impl Into<Arc<str>>) -> u16 {
        let name = name.into();
        if let Some(&idx) = self.name_map.get(&name) {
            return idx;
        }
        let idx = self.names.len() as u16;
        self.name_map.insert(name.clone(), idx);
        self.names.push(name);
        idx
    }

    // =========================================================================
    // Labels
    // =========================================================================

    pub fn create_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Bind a label to the current position.
    pub fn bind_label(&mut self, label: Label) {
        self.labels.insert(label, self.instructions.len());
    }

    /// Current instruction index.
    pub fn current_pc(&self) -> u32 {
        self.instructions.len() as u32
    }

    // =========================================================================
    // Emission
    // =========================================================================

    #[inline]
    pub fn emit(&mut self, inst: Instruction) {
        self.instructions.push(inst);
    }

    fn emit_jump_to(&mut self, inst: Instruction, label: Label) {
        let pc = self.instructions.len();
        self.instructions.push(inst);
        self.pending_jumps.push(PendingJump { pc, label });
    }

    pub fn emit_jump(&mut self, label: Label) {
        self.emit_jump_to(Instruction::op_i(Opcode::Jump, 0), label);
    }

    pub fn emit_jump_if_true(&mut self, test: Register, label: Label) {
        self.emit_jump_to(Instruction::op_di(Opcode::JumpIfTrue, test, 0), label);
    }

    pub fn emit_jump_if_false(&mut self, test: Register, label: Label) {
        self.emit_jump_to(Instruction::op_di(Opcode::JumpIfFalse, test, 0), label);
    }

    /// `ForIter`: iterator in `pair`, next value into `pair + 1`, jump to
    /// `done` on exhaustion.
    pub fn emit_for_iter(&mut self, pair: Register, done: Label) {
        self.emit_jump_to(Instruction::op_di(Opcode::ForIter, pair, 0), done);
    }

    /// Jump to `no_match` when the active exception does not match the
    /// type in `expected`.
    pub fn emit_jump_if_not_exc_match(&mut self, expected: Register, no_match: Label) {
        self.emit_jump_to(
            Instruction::op_di(Opcode::JumpIfNotExcMatch, expected, 0),
            no_match,
        );
    }

    pub fn emit_load_const(&mut self, dst: Register, idx: ConstIndex) {
        self.emit(Instruction::op_di(Opcode::LoadConst, dst, idx.0));
    }

    pub fn emit_load_value(&mut self, dst: Register, value: Value) {
        match value {
            Value::None => self.emit(Instruction::op_d(Opcode::LoadNone, dst)),
            Value::Bool(true) => self.emit(Instruction::op_d(Opcode::LoadTrue, dst)),
            Value::Bool(false) => self.emit(Instruction::op_d(Opcode::LoadFalse, dst)),
            other => {
                let idx = self.add_const(other);
                self.emit_load_const(dst, idx);
            }
        }
    }

    pub fn emit_move(&mut self, dst: Register, src: Register) {
        if dst != src {
            self.emit(Instruction::op_ds(Opcode::Move, dst, src));
        }
    }

    /// `Return` propagates r0; move the result there first.
    pub fn emit_return(&mut self, src: Register) {
        self.emit_move(Register(0), src);
        self.emit(Instruction::op(Opcode::Return));
    }

    pub fn emit_return_none(&mut self) {
        self.emit(Instruction::op_d(Opcode::LoadNone, Register(0)));
        self.emit(Instruction::op(Opcode::Return));
    }

    // =========================================================================
    // Exception table
    // =========================================================================

    /// Record a try-range row. Ranges are recorded innermost-last with
    /// their nesting depth; the unwinder picks the deepest covering row.
    pub fn add_exception_entry(&mut self, start_pc: u32, end_pc: u32, handler_pc: u32, depth: u16) {
        debug_assert!(start_pc <= end_pc);
        self.exception_table.push(ExceptionEntry {
            start_pc,
            end_pc,
            handler_pc,
            depth,
        });
    }

    // =========================================================================
    // Finalization
    // =========================================================================

    /// Patch pending jumps and produce the code object.
    pub fn finish(mut self) -> CodeObject {
        let final_pc = self.instructions.len() as u32;
        if final_pc > self.line_start_pc {
            self.line_table.push(LineTableEntry {
                start_pc: self.line_start_pc,
                end_pc: final_pc,
                line: self.current_line,
            });
        }

        for jump in &self.pending_jumps {
            let target = *self.labels.get(&jump.label).expect("unbound label");
            let offset = target as i64 - jump.pc as i64 - 1;
            let offset = i16::try_from(offset).expect("jump offset out of range");
            self.instructions[jump.pc] = self.instructions[jump.pc].with_imm(offset as u16);
        }

        CodeObject {
            name: self.name,
            qualname: self.qualname,
            filename: self.filename,
            first_line: self.first_line,
            instructions: self.instructions.into_boxed_slice(),
            consts: self.consts.into_boxed_slice(),
            names: self.names.into_boxed_slice(),
            varnames: self.varnames.into_boxed_slice(),
            cellvars: self.cellvars.into_boxed_slice(),
            freevars: self.freevars.into_boxed_slice(),
            cell2arg: self.cell2arg.into_boxed_slice(),
            arg_count: self.arg_count,
            posonly_count: self.posonly_count,
            kwonly_count: self.kwonly_count,
            register_count: self.max_registers,
            flags: self.flags,
            exception_table: self.exception_table.into_boxed_slice(),
            line_table: self.line_table.into_boxed_slice(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_jump_patching() {
        let mut b = FunctionBuilder::new("t", "<test>");
        let end = b.create_label();
        let r = b.alloc_register();
        b.emit_jump_if_false(r, end);
        b.emit(Instruction::op(Opcode::Nop));
        b.emit(Instruction::op(Opcode::Nop));
        b.bind_label(end);
        b.emit_return_none();

        let code = b.finish();
        // Jump at pc 0 skips the two Nops: target 3, offset 3 - 0 - 1 = 2.
        assert_eq!(code.instructions[0].offset(), 2);
    }

    #[test]
    fn test_backward_jump_is_negative() {
        let mut b = FunctionBuilder::new("t", "<test>");
        let top = b.create_label();
        b.bind_label(top);
        b.emit(Instruction::op(Opcode::Nop));
        b.emit_jump(top);
        let code = b.finish();
        // Jump at pc 1 back to 0: offset 0 - 1 - 1 = -2.
        assert_eq!(code.instructions[1].offset(), -2);
    }

    #[test]
    fn test_const_dedup() {
        let mut b = FunctionBuilder::new("t", "<test>");
        let a = b.add_const(Value::int(42));
        let c = b.add_const(Value::int(42));
        let d = b.add_const(Value::str("x"));
        let e = b.add_const(Value::str("x"));
        assert_eq!(a, c);
        assert_eq!(d, e);
        assert_ne!(a, d);
    }

    #[test]
    fn test_register_run_rollback() {
        let mut b = FunctionBuilder::new("t", "<test>");
        let r0 = b.alloc_register();
        let base = b.alloc_register_run(3);
        assert_eq!(base.0, 1);
        // Scratch above the run is rolled back with it.
        let scratch = b.alloc_register();
        b.free_register(scratch);
        b.free_register_run(base);
        let r1 = b.alloc_register();
        assert_eq!(r1.0, 1);
        assert_eq!(r0.0, 0);
        let code = b.finish();
        assert_eq!(code.register_count, 5);
    }

    #[test]
    fn test_line_table() {
        let mut b = FunctionBuilder::new("t", "<test>");
        b.set_first_line(10);
        b.emit(Instruction::op(Opcode::Nop));
        b.set_line(11);
        b.emit(Instruction::op(Opcode::Nop));
        b.emit(Instruction::op(Opcode::Nop));
        let code = b.finish();
        assert_eq!(code.line_for_pc(0), Some(10));
        assert_eq!(code.line_for_pc(2), Some(11));
    }
}
