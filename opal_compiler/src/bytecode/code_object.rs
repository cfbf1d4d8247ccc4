//! Code objects: the unit of compilation.

use super::instruction::Instruction;
use opal_core::Value;
use std::sync::Arc;

/// Sentinel in `cell2arg` for a cell variable that is not a parameter.
pub const CELL_NOT_AN_ARG: u16 = u16::MAX;

/// Register 0 is reserved for return and yield values; named locals start
/// here. The VM binds argument `i` to register `FIRST_LOCAL_REGISTER + i`.
pub const FIRST_LOCAL_REGISTER: u8 = 1;

/// A compiled function, class body or module.
///
/// Code objects are immutable once built and shared via `Arc`: a function
/// object references its code, and nested functions appear as constants
/// of their enclosing code object.
#[derive(Debug, PartialEq)]
pub struct CodeObject {
    /// Function name (`<module>` for module-level code).
    pub name: Arc<str>,
    /// Qualified name including enclosing functions/classes.
    pub qualname: Arc<str>,
    /// Source filename.
    pub filename: Arc<str>,
    /// First source line.
    pub first_line: u32,

    /// The instruction stream.
    pub instructions: Box<[Instruction]>,
    /// Constant pool.
    pub consts: Box<[Const]>,
    /// Global/attribute/method name strings.
    pub names: Box<[Arc<str>]>,
    /// Local variable names; parameters occupy the leading slots.
    pub varnames: Box<[Arc<str>]>,
    /// Variables defined here and captured by nested scopes.
    pub cellvars: Box<[Arc<str>]>,
    /// Variables captured from enclosing scopes.
    pub freevars: Box<[Arc<str>]>,
    /// For each cell variable, the parameter index it shadows, or
    /// [`CELL_NOT_AN_ARG`].
    pub cell2arg: Box<[u16]>,

    /// Number of positional parameters (including positional-only).
    pub arg_count: u16,
    /// Number of positional-only parameters.
    pub posonly_count: u16,
    /// Number of keyword-only parameters.
    pub kwonly_count: u16,
    /// Registers required by a frame running this code.
    pub register_count: u16,

    pub flags: CodeFlags,

    /// Try-range table consulted during unwinding, innermost rows have
    /// the highest depth.
    pub exception_table: Box<[ExceptionEntry]>,
    /// Instruction-range to source-line map.
    pub line_table: Box<[LineTableEntry]>,
}

/// A constant-pool entry: a plain value, a nested code object, or the
/// keyword-name list announced by `KwNames`.
#[derive(Debug, Clone, PartialEq)]
pub enum Const {
    Value(Value),
    Code(Arc<CodeObject>),
    Names(Box<[Arc<str>]>),
}

impl Const {
    /// The value form, if this is not a code constant.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Const::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// Code object flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodeFlags(u32);

impl CodeFlags {
    pub const NONE: CodeFlags = CodeFlags(0);
    /// Function collects excess positional arguments (`*args`).
    pub const VARARGS: CodeFlags = CodeFlags(1 << 0);
    /// Function collects excess keyword arguments (`**kwargs`).
    pub const VARKEYWORDS: CodeFlags = CodeFlags(1 << 1);
    /// Body contains `yield`; calls build a generator.
    pub const GENERATOR: CodeFlags = CodeFlags(1 << 2);
    /// Reserved for async support.
    pub const COROUTINE: CodeFlags = CodeFlags(1 << 3);
    /// Defined inside another function.
    pub const NESTED: CodeFlags = CodeFlags(1 << 4);
    /// Module-level code; names resolve through the globals dict.
    pub const MODULE: CodeFlags = CodeFlags(1 << 5);
    /// Class body; names resolve through the frame's locals dict, which
    /// becomes the class dict.
    pub const CLASS_BODY: CodeFlags = CodeFlags(1 << 6);

    #[inline]
    pub const fn contains(self, other: CodeFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u32) -> CodeFlags {
        CodeFlags(bits)
    }
}

impl std::ops::BitOr for CodeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        CodeFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for CodeFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// One row of the exception table: while executing `start_pc..end_pc`, a
/// raised exception transfers control to `handler_pc`. Ranges are
/// properly nested, so the innermost covering row is the one starting
/// latest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionEntry {
    pub start_pc: u32,
    pub end_pc: u32,
    pub handler_pc: u32,
    /// Exception-stack depth expected on entry to the handler; the
    /// unwinder truncates the frame's stash stack to this depth before
    /// pushing the new exception.
    pub depth: u16,
}

/// Instruction range to source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTableEntry {
    pub start_pc: u32,
    pub end_pc: u32,
    pub line: u32,
}

impl CodeObject {
    /// Source line for an instruction index.
    pub fn line_for_pc(&self, pc: u32) -> Option<u32> {
        self.line_table
            .iter()
            .find(|e| e.start_pc <= pc && pc < e.end_pc)
            .map(|e| e.line)
    }

    #[inline]
    pub fn is_generator(&self) -> bool {
        self.flags.contains(CodeFlags::GENERATOR)
    }

    #[inline]
    pub fn is_module(&self) -> bool {
        self.flags.contains(CodeFlags::MODULE)
    }

    #[inline]
    pub fn is_class_body(&self) -> bool {
        self.flags.contains(CodeFlags::CLASS_BODY)
    }

    /// Cell slots plus captured free slots: the size of a frame's cell
    /// storage.
    #[inline]
    pub fn cell_count(&self) -> usize {
        self.cellvars.len() + self.freevars.len()
    }

    /// Innermost exception-table row covering `pc`, if any.
    pub fn handler_for_pc(&self, pc: u32) -> Option<&ExceptionEntry> {
        self.exception_table
            .iter()
            .filter(|e| e.start_pc <= pc && pc < e.end_pc)
            .max_by_key(|e| e.start_pc)
    }
}

/// Render a code object (and, recursively, its nested code constants) as
/// human-readable assembly.
pub fn disassemble(code: &CodeObject) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    writeln!(out, "code {} (file {}, line {})", code.qualname, code.filename, code.first_line)
        .unwrap();
    writeln!(
        out,
        "  args: {} (pos-only {}, kw-only {}), registers: {}, flags: {:#x}",
        code.arg_count,
        code.posonly_count,
        code.kwonly_count,
        code.register_count,
        code.flags.bits()
    )
    .unwrap();

    if !code.consts.is_empty() {
        writeln!(out, "  consts:").unwrap();
        for (i, c) in code.consts.iter().enumerate() {
            match c {
                Const::Value(v) => writeln!(out, "    {i:4}: {v}").unwrap(),
                Const::Code(c) => writeln!(out, "    {i:4}: <code {}>", c.qualname).unwrap(),
                Const::Names(names) => writeln!(out, "    {i:4}: kwnames {}", names.join(", ")).unwrap(),
            }
        }
    }
    if !code.names.is_empty() {
        writeln!(out, "  names: {}", code.names.join(", ")).unwrap();
    }
    if !code.varnames.is_empty() {
        writeln!(out, "  locals: {}", code.varnames.join(", ")).unwrap();
    }
    if !code.cellvars.is_empty() {
        writeln!(out, "  cells: {}", code.cellvars.join(", ")).unwrap();
    }
    if !code.freevars.is_empty() {
        writeln!(out, "  frees: {}", code.freevars.join(", ")).unwrap();
    }
    for entry in code.exception_table.iter() {
        writeln!(
            out,
            "  try {}..{} -> handler {} (depth {})",
            entry.start_pc, entry.end_pc, entry.handler_pc, entry.depth
        )
        .unwrap();
    }

    for (pc, inst) in code.instructions.iter().enumerate() {
        writeln!(out, "  {pc:4}: {inst}").unwrap();
    }

    for c in code.consts.iter() {
        if let Const::Code(nested) = c {
            out.push('\n');
            out.push_str(&disassemble(nested));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_flags() {
        let flags = CodeFlags::GENERATOR | CodeFlags::NESTED;
        assert!(flags.contains(CodeFlags::GENERATOR));
        assert!(!flags.contains(CodeFlags::VARARGS));
        assert_eq!(CodeFlags::from_bits(flags.bits()), flags);
    }

    #[test]
    fn test_handler_selection_prefers_innermost() {
        let outer = ExceptionEntry {
            start_pc: 0,
            end_pc: 20,
            handler_pc: 30,
            depth: 0,
        };
        let inner = ExceptionEntry {
            start_pc: 5,
            end_pc: 10,
            handler_pc: 40,
            depth: 1,
        };
        let code = CodeObject {
            name: "t".into(),
            qualname: "t".into(),
            filename: "<test>".into(),
            first_line: 1,
            instructions: Box::new([]),
            consts: Box::new([]),
            names: Box::new([]),
            varnames: Box::new([]),
            cellvars: Box::new([]),
            freevars: Box::new([]),
            cell2arg: Box::new([]),
            arg_count: 0,
            posonly_count: 0,
            kwonly_count: 0,
            register_count: 0,
            flags: CodeFlags::NONE,
            exception_table: Box::new([outer, inner]),
            line_table: Box::new([]),
        };

        assert_eq!(code.handler_for_pc(7).unwrap().handler_pc, 40);
        assert_eq!(code.handler_for_pc(15).unwrap().handler_pc, 30);
        assert!(code.handler_for_pc(25).is_none());
    }
}
