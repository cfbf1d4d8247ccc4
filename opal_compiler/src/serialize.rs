//! Compiled program serialization.
//!
//! A self-describing little-endian byte stream: magic and version, a
//! program header (source filename, argument vector), then the module
//! code object with nested function code objects inline in its constant
//! pool. Instructions serialize as a 1-byte stable opcode followed by the
//! operand bytes its format dictates, so streams are portable across runs
//! and builds.

use crate::bytecode::{
    CodeFlags, CodeObject, Const, ExceptionEntry, Instruction, InstructionFormat, LineTableEntry,
    Opcode,
};
use opal_core::{Int, Value};
use std::sync::Arc;

const MAGIC: &[u8; 4] = b"OPLB";
const VERSION: u16 = 1;

// Constant pool tags.
const TAG_NONE: u8 = 0;
const TAG_FALSE: u8 = 1;
const TAG_TRUE: u8 = 2;
const TAG_INT: u8 = 3;
const TAG_BIGINT: u8 = 4;
const TAG_FLOAT: u8 = 5;
const TAG_STR: u8 = 6;
const TAG_BYTES: u8 = 7;
const TAG_ELLIPSIS: u8 = 8;
const TAG_CODE: u8 = 9;
const TAG_NAMES: u8 = 10;

/// A compiled program: module code plus invocation metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub filename: Arc<str>,
    pub argv: Vec<Arc<str>>,
    pub code: Arc<CodeObject>,
}

impl Program {
    pub fn new(code: Arc<CodeObject>) -> Self {
        Program {
            filename: code.filename.clone(),
            argv: Vec::new(),
            code,
        }
    }
}

/// Deserialization failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof,
    BadMagic,
    UnsupportedVersion(u16),
    BadOpcode(u8),
    BadConstTag(u8),
    BadUtf8,
    BadInteger,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnexpectedEof => write!(f, "unexpected end of stream"),
            DecodeError::BadMagic => write!(f, "not an opal bytecode stream"),
            DecodeError::UnsupportedVersion(v) => write!(f, "unsupported bytecode version {v}"),
            DecodeError::BadOpcode(op) => write!(f, "unknown opcode {op}"),
            DecodeError::BadConstTag(tag) => write!(f, "unknown constant tag {tag}"),
            DecodeError::BadUtf8 => write!(f, "invalid utf-8 in string record"),
            DecodeError::BadInteger => write!(f, "invalid big-integer record"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Serialize a program to bytes.
pub fn serialize(program: &Program) -> Vec<u8> {
    let mut w = Writer::default();
    w.bytes(MAGIC);
    w.u16(VERSION);
    w.str(&program.filename);
    w.u16(program.argv.len() as u16);
    for arg in &program.argv {
        w.str(arg);
    }
    w.code(&program.code);
    w.out
}

/// Deserialize a program from bytes.
pub fn deserialize(data: &[u8]) -> Result<Program, DecodeError> {
    let mut r = Reader { data, pos: 0 };
    if r.take(4)? != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let version = r.u16()?;
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let filename = r.str()?;
    let argc = r.u16()?;
    let mut argv = Vec::with_capacity(argc as usize);
    for _ in 0..argc {
        argv.push(r.str()?);
    }
    let code = Arc::new(r.code()?);
    Ok(Program {
        filename,
        argv,
        code,
    })
}

// =============================================================================
// Writer
// =============================================================================

#[derive(Default)]
struct Writer {
    out: Vec<u8>,
}

impl Writer {
    fn bytes(&mut self, b: &[u8]) {
        self.out.extend_from_slice(b);
    }

    fn u8(&mut self, v: u8) {
        self.out.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn str(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.bytes(s.as_bytes());
    }

    fn str_list(&mut self, items: &[Arc<str>]) {
        self.u16(items.len() as u16);
        for item in items {
            self.str(item);
        }
    }

    fn value(&mut self, value: &Value) {
        match value {
            Value::None => self.u8(TAG_NONE),
            Value::Bool(false) => self.u8(TAG_FALSE),
            Value::Bool(true) => self.u8(TAG_TRUE),
            Value::Int(i) => match i.to_i64() {
                Some(v) => {
                    self.u8(TAG_INT);
                    self.bytes(&v.to_le_bytes());
                }
                None => {
                    self.u8(TAG_BIGINT);
                    self.str(&i.to_big().to_string());
                }
            },
            Value::Float(f) => {
                self.u8(TAG_FLOAT);
                self.bytes(&f.to_bits().to_le_bytes());
            }
            Value::Str(s) => {
                self.u8(TAG_STR);
                self.str(s);
            }
            Value::Bytes(b) => {
                self.u8(TAG_BYTES);
                self.u32(b.len() as u32);
                self.bytes(b);
            }
            Value::Ellipsis => self.u8(TAG_ELLIPSIS),
            Value::NotImplemented | Value::Object(_) => {
                unreachable!("object values cannot appear in constant pools")
            }
        }
    }

    fn code(&mut self, code: &CodeObject) {
        self.str(&code.name);
        self.str(&code.qualname);
        self.str(&code.filename);
        self.u32(code.first_line);
        self.u16(code.arg_count);
        self.u16(code.posonly_count);
        self.u16(code.kwonly_count);
        self.u16(code.register_count);
        self.u32(code.flags.bits());

        self.str_list(&code.varnames);
        self.str_list(&code.cellvars);
        self.str_list(&code.freevars);
        self.u16(code.cell2arg.len() as u16);
        for &arg in code.cell2arg.iter() {
            self.u16(arg);
        }
        self.str_list(&code.names);

        self.u16(code.consts.len() as u16);
        for c in code.consts.iter() {
            match c {
                Const::Value(v) => self.value(v),
                Const::Code(nested) => {
                    self.u8(TAG_CODE);
                    self.code(nested);
                }
                Const::Names(names) => {
                    self.u8(TAG_NAMES);
                    self.str_list(names);
                }
            }
        }

        self.u32(code.instructions.len() as u32);
        for inst in code.instructions.iter() {
            self.instruction(*inst);
        }

        self.u16(code.exception_table.len() as u16);
        for entry in code.exception_table.iter() {
            self.u32(entry.start_pc);
            self.u32(entry.end_pc);
            self.u32(entry.handler_pc);
            self.u16(entry.depth);
        }

        self.u32(code.line_table.len() as u32);
        for entry in code.line_table.iter() {
            self.u32(entry.start_pc);
            self.u32(entry.end_pc);
            self.u32(entry.line);
        }
    }

    fn instruction(&mut self, inst: Instruction) {
        let opcode = inst.opcode();
        self.u8(opcode as u8);
        match opcode.format() {
            InstructionFormat::Op => {}
            InstructionFormat::D => self.u8(inst.a()),
            InstructionFormat::Ds => {
                self.u8(inst.a());
                self.u8(inst.b());
            }
            InstructionFormat::Dss => {
                self.u8(inst.a());
                self.u8(inst.b());
                self.u8(inst.c());
            }
            InstructionFormat::Di => {
                self.u8(inst.a());
                self.u16(inst.imm());
            }
            InstructionFormat::I => self.u16(inst.imm()),
        }
    }
}

// =============================================================================
// Reader
// =============================================================================

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::UnexpectedEof)?;
        let slice = self.data.get(self.pos..end).ok_or(DecodeError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes(b.try_into().expect("8-byte slice")))
    }

    fn str(&mut self) -> Result<Arc<str>, DecodeError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(Arc::from)
            .map_err(|_| DecodeError::BadUtf8)
    }

    fn str_list(&mut self) -> Result<Box<[Arc<str>]>, DecodeError> {
        let count = self.u16()?;
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            items.push(self.str()?);
        }
        Ok(items.into_boxed_slice())
    }

    fn value(&mut self, tag: u8) -> Result<Value, DecodeError> {
        Ok(match tag {
            TAG_NONE => Value::None,
            TAG_FALSE => Value::Bool(false),
            TAG_TRUE => Value::Bool(true),
            TAG_INT => Value::int(self.i64()?),
            TAG_BIGINT => {
                let digits = self.str()?;
                let big = digits.parse().map_err(|_| DecodeError::BadInteger)?;
                Value::Int(Int::from_big(big))
            }
            TAG_FLOAT => {
                let b = self.take(8)?;
                Value::Float(f64::from_bits(u64::from_le_bytes(
                    b.try_into().expect("8-byte slice"),
                )))
            }
            TAG_STR => Value::Str(self.str()?),
            TAG_BYTES => {
                let len = self.u32()? as usize;
                Value::Bytes(self.take(len)?.into())
            }
            TAG_ELLIPSIS => Value::Ellipsis,
            other => return Err(DecodeError::BadConstTag(other)),
        })
    }

    fn code(&mut self) -> Result<CodeObject, DecodeError> {
        let name = self.str()?;
        let qualname = self.str()?;
        let filename = self.str()?;
        let first_line = self.u32()?;
        let arg_count = self.u16()?;
        let posonly_count = self.u16()?;
        let kwonly_count = self.u16()?;
        let register_count = self.u16()?;
        let flags = CodeFlags::from_bits(self.u32()?);

        let varnames = self.str_list()?;
        let cellvars = self.str_list()?;
        let freevars = self.str_list()?;
        let cell2arg_len = self.u16()?;
        let mut cell2arg = Vec::with_capacity(cell2arg_len as usize);
        for _ in 0..cell2arg_len {
            cell2arg.push(self.u16()?);
        }
        let names = self.str_list()?;

        let const_count = self.u16()?;
        let mut consts = Vec::with_capacity(const_count as usize);
        for _ in 0..const_count {
            let tag = self.u8()?;
            consts.push(match tag {
                TAG_CODE => Const::Code(Arc::new(self.code()?)),
                TAG_NAMES => Const::Names(self.str_list()?),
                other => Const::Value(self.value(other)?),
            });
        }

        let inst_count = self.u32()?;
        let mut instructions = Vec::with_capacity(inst_count as usize);
        for _ in 0..inst_count {
            instructions.push(self.instruction()?);
        }

        let entry_count = self.u16()?;
        let mut exception_table = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            exception_table.push(ExceptionEntry {
                start_pc: self.u32()?,
                end_pc: self.u32()?,
                handler_pc: self.u32()?,
                depth: self.u16()?,
            });
        }

        let line_count = self.u32()?;
        let mut line_table = Vec::with_capacity(line_count as usize);
        for _ in 0..line_count {
            line_table.push(LineTableEntry {
                start_pc: self.u32()?,
                end_pc: self.u32()?,
                line: self.u32()?,
            });
        }

        Ok(CodeObject {
            name,
            qualname,
            filename,
            first_line,
            instructions: instructions.into_boxed_slice(),
            consts: consts.into_boxed_slice(),
            names,
            varnames,
            cellvars,
            freevars,
            cell2arg: cell2arg.into_boxed_slice(),
            arg_count,
            posonly_count,
            kwonly_count,
            register_count,
            flags,
            exception_table: exception_table.into_boxed_slice(),
            line_table: line_table.into_boxed_slice(),
        })
    }

    fn instruction(&mut self) -> Result<Instruction, DecodeError> {
        let raw = self.u8()?;
        let opcode = Opcode::from_u8(raw).ok_or(DecodeError::BadOpcode(raw))?;
        let (a, b, c) = match opcode.format() {
            InstructionFormat::Op => (0, 0, 0),
            InstructionFormat::D => (self.u8()?, 0, 0),
            InstructionFormat::Ds => (self.u8()?, self.u8()?, 0),
            InstructionFormat::Dss => (self.u8()?, self.u8()?, self.u8()?),
            InstructionFormat::Di => {
                let a = self.u8()?;
                let imm = self.u16()?;
                (a, (imm & 0xff) as u8, (imm >> 8) as u8)
            }
            InstructionFormat::I => {
                let imm = self.u16()?;
                (0, (imm & 0xff) as u8, (imm >> 8) as u8)
            }
        };
        Ok(Instruction::from_parts(opcode, a, b, c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::disassemble;
    use crate::compile_module;
    use opal_ast::{BinOp, Expr, Module, Stmt, StmtKind};

    fn sample_program() -> Program {
        let module = Module::new(vec![
            Stmt::new(
                StmtKind::FunctionDef {
                    name: "double".to_string(),
                    args: opal_ast::Arguments::positional(&["n"]),
                    body: vec![Stmt::ret(Expr::bin(
                        Expr::name("n"),
                        BinOp::Mul,
                        Expr::int(2),
                    ))],
                    decorators: Vec::new(),
                },
                1,
            ),
            Stmt::assign(
                "result",
                Expr::call(Expr::name("double"), vec![Expr::int(21)]),
            ),
        ]);
        let code = compile_module(&module, "sample.opal").unwrap();
        let mut program = Program::new(code);
        program.argv = vec!["sample.opal".into(), "--fast".into()];
        program
    }

    #[test]
    fn test_roundtrip_preserves_everything() {
        let program = sample_program();
        let bytes = serialize(&program);
        let decoded = deserialize(&bytes).unwrap();

        assert_eq!(decoded.filename, program.filename);
        assert_eq!(decoded.argv, program.argv);
        // Disassembly covers instructions, pools, tables and metadata.
        assert_eq!(disassemble(&decoded.code), disassemble(&program.code));
    }

    #[test]
    fn test_reserialization_is_identical() {
        let program = sample_program();
        let bytes = serialize(&program);
        let decoded = deserialize(&bytes).unwrap();
        let bytes2 = serialize(&decoded);
        assert_eq!(bytes, bytes2);
    }

    #[test]
    fn test_bad_magic() {
        assert_eq!(deserialize(b"nope"), Err(DecodeError::BadMagic));
    }

    #[test]
    fn test_truncated_stream() {
        let bytes = serialize(&sample_program());
        assert!(deserialize(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn test_bad_version() {
        let mut bytes = serialize(&sample_program());
        bytes[4] = 0xff;
        assert!(matches!(
            deserialize(&bytes),
            Err(DecodeError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_big_int_constant_roundtrip() {
        let module = Module::new(vec![Stmt::assign(
            "huge",
            Expr::new(
                opal_ast::ExprKind::BigInt("123456789012345678901234567890".to_string()),
                1,
            ),
        )]);
        let code = compile_module(&module, "<test>").unwrap();
        let program = Program::new(code);
        let decoded = deserialize(&serialize(&program)).unwrap();
        assert_eq!(disassemble(&decoded.code), disassemble(&program.code));
    }
}
