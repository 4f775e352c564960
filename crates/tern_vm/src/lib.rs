use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::rc::Rc;

use tern_runtime::{
    hash_get, hash_set, ClosureValue, CompiledFunction, Pairs, Value, BUILTINS,
};
use tern_syntax::{Block, Expr, Ident, InfixOp, Pos, PrefixOp, Program, Stmt, SwitchCase};

pub const STACK_SIZE: usize = 2048;
pub const GLOBALS_SIZE: usize = 65536;
pub const MAX_FRAMES: usize = 1024;

#[derive(Debug)]
pub enum VmError {
    Compile {
        message: String,
        pos: Option<Pos>,
    },
    Runtime {
        message: String,
    },
}

impl VmError {
    fn compile(message: impl Into<String>, pos: Option<Pos>) -> Self {
        VmError::Compile {
            message: message.into(),
            pos,
        }
    }

    fn runtime(message: impl Into<String>) -> Self {
        VmError::Runtime {
            message: message.into(),
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Compile {
                message,
                pos: Some(pos),
            } => write!(f, "{pos}: {message}"),
            VmError::Compile { message, pos: None } => f.write_str(message),
            VmError::Runtime { message } => f.write_str(message),
        }
    }
}

impl std::error::Error for VmError {}

// ---------------------------------------------------------------------------
// Bytecode
// ---------------------------------------------------------------------------

/// One-byte instruction tags. The discriminants are part of the wire format
/// and must never be reordered; new opcodes go at the end.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Constant = 0,
    Add,
    Sub,
    Mul,
    Div,
    Pop,
    True,
    False,
    Equal,
    NotEqual,
    GreaterThan,
    Minus,
    Bang,
    Jump,
    JumpNotTruthy,
    Null,
    SetGlobal,
    GetGlobal,
    GetBuiltin,
    SetLocal,
    GetLocal,
    GetFree,
    Array,
    Hash,
    Index,
    Call,
    Return,
    Closure,
    SetIndex,
}

pub struct Definition {
    pub name: &'static str,
    pub operand_widths: &'static [usize],
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Result<Opcode, String> {
        let op = match byte {
            0 => Opcode::Constant,
            1 => Opcode::Add,
            2 => Opcode::Sub,
            3 => Opcode::Mul,
            4 => Opcode::Div,
            5 => Opcode::Pop,
            6 => Opcode::True,
            7 => Opcode::False,
            8 => Opcode::Equal,
            9 => Opcode::NotEqual,
            10 => Opcode::GreaterThan,
            11 => Opcode::Minus,
            12 => Opcode::Bang,
            13 => Opcode::Jump,
            14 => Opcode::JumpNotTruthy,
            15 => Opcode::Null,
            16 => Opcode::SetGlobal,
            17 => Opcode::GetGlobal,
            18 => Opcode::GetBuiltin,
            19 => Opcode::SetLocal,
            20 => Opcode::GetLocal,
            21 => Opcode::GetFree,
            22 => Opcode::Array,
            23 => Opcode::Hash,
            24 => Opcode::Index,
            25 => Opcode::Call,
            26 => Opcode::Return,
            27 => Opcode::Closure,
            28 => Opcode::SetIndex,
            _ => return Err(format!("opcode {byte} undefined")),
        };
        Ok(op)
    }

    pub fn definition(self) -> &'static Definition {
        match self {
            Opcode::Constant => &Definition {
                name: "OpConstant",
                operand_widths: &[2],
            },
            Opcode::Add => &Definition {
                name: "OpAdd",
                operand_widths: &[],
            },
            Opcode::Sub => &Definition {
                name: "OpSub",
                operand_widths: &[],
            },
            Opcode::Mul => &Definition {
                name: "OpMul",
                operand_widths: &[],
            },
            Opcode::Div => &Definition {
                name: "OpDiv",
                operand_widths: &[],
            },
            Opcode::Pop => &Definition {
                name: "OpPop",
                operand_widths: &[],
            },
            Opcode::True => &Definition {
                name: "OpTrue",
                operand_widths: &[],
            },
            Opcode::False => &Definition {
                name: "OpFalse",
                operand_widths: &[],
            },
            Opcode::Equal => &Definition {
                name: "OpEqual",
                operand_widths: &[],
            },
            Opcode::NotEqual => &Definition {
                name: "OpNotEqual",
                operand_widths: &[],
            },
            Opcode::GreaterThan => &Definition {
                name: "OpGreaterThan",
                operand_widths: &[],
            },
            Opcode::Minus => &Definition {
                name: "OpMinus",
                operand_widths: &[],
            },
            Opcode::Bang => &Definition {
                name: "OpBang",
                operand_widths: &[],
            },
            Opcode::Jump => &Definition {
                name: "OpJump",
                operand_widths: &[2],
            },
            Opcode::JumpNotTruthy => &Definition {
                name: "OpJumpNotTruthy",
                operand_widths: &[2],
            },
            Opcode::Null => &Definition {
                name: "OpNull",
                operand_widths: &[],
            },
            Opcode::SetGlobal => &Definition {
                name: "OpSetGlobal",
                operand_widths: &[2],
            },
            Opcode::GetGlobal => &Definition {
                name: "OpGetGlobal",
                operand_widths: &[2],
            },
            Opcode::GetBuiltin => &Definition {
                name: "OpGetBuiltin",
                operand_widths: &[1],
            },
            Opcode::SetLocal => &Definition {
                name: "OpSetLocal",
                operand_widths: &[1],
            },
            Opcode::GetLocal => &Definition {
                name: "OpGetLocal",
                operand_widths: &[1],
            },
            Opcode::GetFree => &Definition {
                name: "OpGetFree",
                operand_widths: &[1],
            },
            Opcode::Array => &Definition {
                name: "OpArray",
                operand_widths: &[2],
            },
            Opcode::Hash => &Definition {
                name: "OpHash",
                operand_widths: &[2],
            },
            Opcode::Index => &Definition {
                name: "OpIndex",
                operand_widths: &[],
            },
            Opcode::Call => &Definition {
                name: "OpCall",
                operand_widths: &[1],
            },
            Opcode::Return => &Definition {
                name: "OpReturn",
                operand_widths: &[],
            },
            Opcode::Closure => &Definition {
                name: "OpClosure",
                operand_widths: &[2, 1],
            },
            Opcode::SetIndex => &Definition {
                name: "OpSetIndex",
                operand_widths: &[],
            },
        }
    }

    pub fn width(self) -> usize {
        1 + self.definition().operand_widths.iter().sum::<usize>()
    }
}

pub fn lookup(byte: u8) -> Result<&'static Definition, String> {
    Opcode::from_byte(byte).map(Opcode::definition)
}

/// Encode an instruction. The operand count is an internal invariant of the
/// compiler, so a mismatch is a programmer error.
pub fn make(op: Opcode, operands: &[usize]) -> Vec<u8> {
    let def = op.definition();
    assert_eq!(
        operands.len(),
        def.operand_widths.len(),
        "number of operands doesn't match opcode definition for {}",
        def.name
    );
    let mut instruction = Vec::with_capacity(op.width());
    instruction.push(op as u8);
    for (operand, width) in operands.iter().zip(def.operand_widths) {
        match width {
            1 => instruction.push(*operand as u8),
            2 => instruction.extend_from_slice(&(*operand as u16).to_be_bytes()),
            _ => unreachable!("unsupported operand width"),
        }
    }
    instruction
}

pub fn read_u16(ins: &[u8]) -> u16 {
    u16::from_be_bytes([ins[0], ins[1]])
}

pub fn read_u8(ins: &[u8]) -> u8 {
    ins[0]
}

pub fn read_operands(def: &Definition, ins: &[u8]) -> (Vec<usize>, usize) {
    let mut operands = Vec::with_capacity(def.operand_widths.len());
    let mut offset = 0;
    for width in def.operand_widths {
        match width {
            1 => operands.push(read_u8(&ins[offset..]) as usize),
            2 => operands.push(read_u16(&ins[offset..]) as usize),
            _ => unreachable!("unsupported operand width"),
        }
        offset += width;
    }
    (operands, offset)
}

/// Render instructions one per line as `"{offset:04} {name} {operands…}"`.
pub fn disassemble(ins: &[u8]) -> String {
    let mut out = String::new();
    let mut i = 0;
    while i < ins.len() {
        let def = match lookup(ins[i]) {
            Ok(def) => def,
            Err(err) => {
                let _ = writeln!(out, "ERROR: {err}");
                i += 1;
                continue;
            }
        };
        let (operands, read) = read_operands(def, &ins[i + 1..]);
        let _ = write!(out, "{:04} {}", i, def.name);
        for operand in operands {
            let _ = write!(out, " {operand}");
        }
        out.push('\n');
        i += 1 + read;
    }
    out
}

// ---------------------------------------------------------------------------
// Symbol table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolScope {
    Global,
    Local,
    Builtin,
    Free,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub scope: SymbolScope,
    pub index: usize,
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    outer: Option<Box<SymbolTable>>,
    store: HashMap<String, Symbol>,
    pub count: usize,
    pub free: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The global table for a compilation session, with every builtin
    /// ordinal pre-defined.
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        for (index, builtin) in BUILTINS.iter().enumerate() {
            table.define_builtin(builtin.name, index);
        }
        table
    }

    pub fn new_enclosed(outer: SymbolTable) -> Self {
        Self {
            outer: Some(Box::new(outer)),
            ..Self::default()
        }
    }

    pub fn define(&mut self, name: impl Into<String>) -> Symbol {
        let name = name.into();
        let scope = if self.outer.is_none() {
            SymbolScope::Global
        } else {
            SymbolScope::Local
        };
        let symbol = Symbol {
            name: name.clone(),
            scope,
            index: self.count,
        };
        self.count += 1;
        self.store.insert(name, symbol.clone());
        symbol
    }

    pub fn define_builtin(&mut self, name: impl Into<String>, index: usize) -> Symbol {
        let name = name.into();
        let symbol = Symbol {
            name: name.clone(),
            scope: SymbolScope::Builtin,
            index,
        };
        self.store.insert(name, symbol.clone());
        symbol
    }

    fn define_free(&mut self, original: Symbol) -> Symbol {
        self.free.push(original.clone());
        let symbol = Symbol {
            name: original.name,
            scope: SymbolScope::Free,
            index: self.free.len() - 1,
        };
        self.store.insert(symbol.name.clone(), symbol.clone());
        symbol
    }

    /// Walks outward. A `Local` (or `Free`) hit in an enclosing table is
    /// promoted to a `Free` symbol here; `Global` and `Builtin` pass
    /// through unchanged.
    pub fn resolve(&mut self, name: &str) -> Option<Symbol> {
        if let Some(symbol) = self.store.get(name) {
            return Some(symbol.clone());
        }
        let symbol = self.outer.as_mut()?.resolve(name)?;
        if matches!(symbol.scope, SymbolScope::Global | SymbolScope::Builtin) {
            return Some(symbol);
        }
        Some(self.define_free(symbol))
    }
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bytecode {
    pub instructions: Vec<u8>,
    pub constants: Vec<Value>,
}

#[derive(Debug, Clone, Copy)]
struct EmittedInstruction {
    opcode: Opcode,
    position: usize,
}

#[derive(Default)]
struct CompilationScope {
    instructions: Vec<u8>,
    last: Option<EmittedInstruction>,
    previous: Option<EmittedInstruction>,
}

pub struct Compiler {
    constants: Vec<Value>,
    symbols: SymbolTable,
    scopes: Vec<CompilationScope>,
    synthetic: usize,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        Self::with_state(SymbolTable::with_builtins(), Vec::new())
    }

    /// Resume from a previous compilation's symbol table and constant pool;
    /// this is what keeps a REPL session's globals addressable across lines.
    pub fn with_state(symbols: SymbolTable, constants: Vec<Value>) -> Self {
        Self {
            constants,
            symbols,
            scopes: vec![CompilationScope::default()],
            synthetic: 0,
        }
    }

    pub fn into_state(self) -> (SymbolTable, Vec<Value>) {
        (self.symbols, self.constants)
    }

    pub fn compile(&mut self, program: &Program) -> Result<Bytecode, VmError> {
        for stmt in &program.statements {
            self.compile_stmt(stmt)?;
        }
        Ok(Bytecode {
            instructions: self.scope().instructions.clone(),
            constants: self.constants.clone(),
        })
    }

    fn scope(&mut self) -> &mut CompilationScope {
        self.scopes.last_mut().expect("compiler always has a scope")
    }

    fn current_position(&mut self) -> usize {
        self.scope().instructions.len()
    }

    fn emit(&mut self, op: Opcode, operands: &[usize]) -> usize {
        let instruction = make(op, operands);
        let scope = self.scope();
        let position = scope.instructions.len();
        scope.instructions.extend_from_slice(&instruction);
        scope.previous = scope.last;
        scope.last = Some(EmittedInstruction {
            opcode: op,
            position,
        });
        position
    }

    fn last_instruction_is(&mut self, op: Opcode) -> bool {
        self.scope()
            .last
            .map(|last| last.opcode == op)
            .unwrap_or(false)
    }

    fn remove_last_instruction(&mut self) {
        let scope = self.scope();
        if let Some(last) = scope.last {
            scope.instructions.truncate(last.position);
            scope.last = scope.previous;
            scope.previous = None;
        }
    }

    /// Backpatch the operand of a previously emitted jump.
    fn change_operand(&mut self, position: usize, operand: usize) {
        let scope = self.scope();
        let op = Opcode::from_byte(scope.instructions[position])
            .expect("backpatch target is an instruction");
        let instruction = make(op, &[operand]);
        scope.instructions[position..position + instruction.len()]
            .copy_from_slice(&instruction);
    }

    fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    fn enter_scope(&mut self) {
        self.scopes.push(CompilationScope::default());
        let outer = std::mem::take(&mut self.symbols);
        self.symbols = SymbolTable::new_enclosed(outer);
    }

    fn leave_scope(&mut self) -> Vec<u8> {
        let scope = self.scopes.pop().expect("leave_scope inside a function");
        let outer = self
            .symbols
            .outer
            .take()
            .expect("function symbol table has an outer table");
        self.symbols = *outer;
        scope.instructions
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), VmError> {
        match stmt {
            Stmt::Expr { expr, .. } => {
                self.compile_expr(expr)?;
                self.emit(Opcode::Pop, &[]);
            }
            Stmt::Let { name, value, .. } => {
                self.compile_expr(value)?;
                let symbol = self.symbols.define(name.name.clone());
                self.emit_set(&symbol);
            }
            Stmt::Function {
                name, params, body, ..
            } => {
                // Defined before the body compiles so the function can call
                // itself.
                let symbol = self.symbols.define(name.name.clone());
                self.compile_function(params.iter().map(|p| p.name.name.clone()), body)?;
                self.emit_set(&symbol);
            }
            Stmt::Return { value, .. } => {
                match value {
                    Some(value) => self.compile_expr(value)?,
                    None => {
                        self.emit(Opcode::Null, &[]);
                    }
                }
                self.emit(Opcode::Return, &[]);
            }
            Stmt::While {
                condition, body, ..
            } => {
                let condition_position = self.current_position();
                self.compile_expr(condition)?;
                let exit_jump = self.emit(Opcode::JumpNotTruthy, &[9999]);
                for stmt in &body.statements {
                    self.compile_stmt(stmt)?;
                }
                self.emit(Opcode::Jump, &[condition_position]);
                let after = self.current_position();
                self.change_operand(exit_jump, after);
            }
            Stmt::Switch {
                value,
                cases,
                default,
                ..
            } => self.compile_switch(value, cases, default.as_deref())?,
            Stmt::Import { pos, path, .. } => self.compile_import(path, *pos)?,
            Stmt::Package { .. } | Stmt::Debugger { .. } => {}
        }
        Ok(())
    }

    /// The subject is evaluated once into a synthetic slot whose name no
    /// source identifier can collide with, then each case becomes an
    /// equality test and a conditional jump.
    fn compile_switch(
        &mut self,
        value: &Expr,
        cases: &[SwitchCase],
        default: Option<&[Stmt]>,
    ) -> Result<(), VmError> {
        self.compile_expr(value)?;
        let name = format!("switch#{}", self.synthetic);
        self.synthetic += 1;
        let subject = self.symbols.define(name);
        self.emit_set(&subject);

        let mut end_jumps = Vec::new();
        for case in cases {
            self.emit_get(&subject);
            self.compile_expr(&case.value)?;
            self.emit(Opcode::Equal, &[]);
            let skip = self.emit(Opcode::JumpNotTruthy, &[9999]);
            for stmt in &case.statements {
                self.compile_stmt(stmt)?;
            }
            end_jumps.push(self.emit(Opcode::Jump, &[9999]));
            let after = self.current_position();
            self.change_operand(skip, after);
        }
        if let Some(statements) = default {
            for stmt in statements {
                self.compile_stmt(stmt)?;
            }
        }
        let end = self.current_position();
        for jump in end_jumps {
            self.change_operand(jump, end);
        }
        Ok(())
    }

    fn compile_import(&mut self, path: &str, pos: Pos) -> Result<(), VmError> {
        let source = std::fs::read_to_string(path)
            .map_err(|err| VmError::compile(format!("import: {err}"), Some(pos)))?;
        let program = tern_parser::parse(&source)
            .map_err(|err| VmError::compile(format!("import: {err}"), Some(pos)))?;
        for stmt in &program.statements {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), VmError> {
        match expr {
            Expr::Int { value, .. } => {
                let index = self.add_constant(Value::Int(*value));
                self.emit(Opcode::Constant, &[index]);
            }
            Expr::Str { value, .. } => {
                let index = self.add_constant(Value::string(value.clone()));
                self.emit(Opcode::Constant, &[index]);
            }
            Expr::Bool { value, .. } => {
                if *value {
                    self.emit(Opcode::True, &[]);
                } else {
                    self.emit(Opcode::False, &[]);
                }
            }
            Expr::Null { .. } => {
                self.emit(Opcode::Null, &[]);
            }
            Expr::Ident(ident) => {
                let symbol = self.resolve(ident)?;
                self.emit_get(&symbol);
            }
            Expr::Prefix { op, right, .. } => {
                self.compile_expr(right)?;
                match op {
                    PrefixOp::Minus => self.emit(Opcode::Minus, &[]),
                    PrefixOp::Bang => self.emit(Opcode::Bang, &[]),
                };
            }
            Expr::Infix {
                pos,
                op,
                left,
                right,
            } => self.compile_infix(*op, left, right, *pos)?,
            Expr::If {
                condition,
                consequence,
                alternative,
                ..
            } => {
                self.compile_expr(condition)?;
                let jump_not_truthy = self.emit(Opcode::JumpNotTruthy, &[9999]);
                self.compile_block_value(consequence)?;
                let jump_end = self.emit(Opcode::Jump, &[9999]);
                let after_consequence = self.current_position();
                self.change_operand(jump_not_truthy, after_consequence);
                match alternative {
                    Some(alternative) => self.compile_block_value(alternative)?,
                    None => {
                        self.emit(Opcode::Null, &[]);
                    }
                }
                let after_alternative = self.current_position();
                self.change_operand(jump_end, after_alternative);
            }
            Expr::Array { elements, .. } => {
                for element in elements {
                    self.compile_expr(element)?;
                }
                self.emit(Opcode::Array, &[elements.len()]);
            }
            Expr::Hash { pairs, .. } => {
                for (key, value) in pairs {
                    self.compile_expr(key)?;
                    self.compile_expr(value)?;
                }
                self.emit(Opcode::Hash, &[pairs.len()]);
            }
            Expr::Index { value, index, .. } => {
                self.compile_expr(value)?;
                self.compile_expr(index)?;
                self.emit(Opcode::Index, &[]);
            }
            Expr::Property { value, name, .. } => {
                self.compile_expr(value)?;
                let index = self.add_constant(Value::string(name.name.clone()));
                self.emit(Opcode::Constant, &[index]);
                self.emit(Opcode::Index, &[]);
            }
            Expr::Call { function, args, .. } => {
                self.compile_expr(function)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit(Opcode::Call, &[args.len()]);
            }
            Expr::Function { params, body, .. } => {
                self.compile_function(params.iter().map(|p| p.name.name.clone()), body)?;
            }
            Expr::Assign { pos, target, value } => self.compile_assign(target, value, *pos)?,
        }
        Ok(())
    }

    fn compile_infix(
        &mut self,
        op: InfixOp,
        left: &Expr,
        right: &Expr,
        pos: Pos,
    ) -> Result<(), VmError> {
        match op {
            InfixOp::Lt => {
                // Only OpGreaterThan exists; swap the operands.
                self.compile_expr(right)?;
                self.compile_expr(left)?;
                self.emit(Opcode::GreaterThan, &[]);
                return Ok(());
            }
            InfixOp::LtEq => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit(Opcode::GreaterThan, &[]);
                self.emit(Opcode::Bang, &[]);
                return Ok(());
            }
            InfixOp::GtEq => {
                self.compile_expr(right)?;
                self.compile_expr(left)?;
                self.emit(Opcode::GreaterThan, &[]);
                self.emit(Opcode::Bang, &[]);
                return Ok(());
            }
            InfixOp::And => {
                self.compile_expr(left)?;
                let left_false = self.emit(Opcode::JumpNotTruthy, &[9999]);
                self.compile_expr(right)?;
                let right_false = self.emit(Opcode::JumpNotTruthy, &[9999]);
                self.emit(Opcode::True, &[]);
                let end = self.emit(Opcode::Jump, &[9999]);
                let false_target = self.current_position();
                self.change_operand(left_false, false_target);
                self.change_operand(right_false, false_target);
                self.emit(Opcode::False, &[]);
                let after = self.current_position();
                self.change_operand(end, after);
                return Ok(());
            }
            InfixOp::Or => {
                self.compile_expr(left)?;
                let try_right = self.emit(Opcode::JumpNotTruthy, &[9999]);
                self.emit(Opcode::True, &[]);
                let end_left = self.emit(Opcode::Jump, &[9999]);
                let right_target = self.current_position();
                self.change_operand(try_right, right_target);
                self.compile_expr(right)?;
                let right_false = self.emit(Opcode::JumpNotTruthy, &[9999]);
                self.emit(Opcode::True, &[]);
                let end_right = self.emit(Opcode::Jump, &[9999]);
                let false_target = self.current_position();
                self.change_operand(right_false, false_target);
                self.emit(Opcode::False, &[]);
                let after = self.current_position();
                self.change_operand(end_left, after);
                self.change_operand(end_right, after);
                return Ok(());
            }
            InfixOp::In => {
                return Err(VmError::compile("unknown operator: in", Some(pos)));
            }
            _ => {}
        }
        self.compile_expr(left)?;
        self.compile_expr(right)?;
        match op {
            InfixOp::Add => self.emit(Opcode::Add, &[]),
            InfixOp::Sub => self.emit(Opcode::Sub, &[]),
            InfixOp::Mul => self.emit(Opcode::Mul, &[]),
            InfixOp::Div => self.emit(Opcode::Div, &[]),
            InfixOp::Gt => self.emit(Opcode::GreaterThan, &[]),
            InfixOp::Eq => self.emit(Opcode::Equal, &[]),
            InfixOp::NotEq => self.emit(Opcode::NotEqual, &[]),
            other => return Err(VmError::compile(format!("unknown operator: {other}"), Some(pos))),
        };
        Ok(())
    }

    /// Compile a block that must leave a value on the stack: the trailing
    /// expression statement's `OpPop` is undone, and a block with no
    /// trailing value produces `Null`.
    fn compile_block_value(&mut self, block: &Block) -> Result<(), VmError> {
        let start = self.current_position();
        for stmt in &block.statements {
            self.compile_stmt(stmt)?;
        }
        if self.last_instruction_is(Opcode::Pop) {
            self.remove_last_instruction();
        } else if !self.block_ends_closed(start) {
            self.emit(Opcode::Null, &[]);
        }
        Ok(())
    }

    fn block_ends_closed(&mut self, start: usize) -> bool {
        let position = self.current_position();
        position > start && self.last_instruction_is(Opcode::Return)
    }

    fn compile_function(
        &mut self,
        params: impl Iterator<Item = String>,
        body: &Block,
    ) -> Result<(), VmError> {
        self.enter_scope();
        let mut num_parameters = 0;
        for param in params {
            self.symbols.define(param);
            num_parameters += 1;
        }
        for stmt in &body.statements {
            self.compile_stmt(stmt)?;
        }
        if self.last_instruction_is(Opcode::Pop) {
            self.remove_last_instruction();
            self.emit(Opcode::Return, &[]);
        }
        if !self.last_instruction_is(Opcode::Return) {
            self.emit(Opcode::Null, &[]);
            self.emit(Opcode::Return, &[]);
        }
        let num_locals = self.symbols.count;
        let free = self.symbols.free.clone();
        let instructions = self.leave_scope();
        for symbol in &free {
            self.emit_get(symbol);
        }
        let index = self.add_constant(Value::Compiled(Rc::new(CompiledFunction {
            instructions,
            num_locals,
            num_parameters,
        })));
        self.emit(Opcode::Closure, &[index, free.len()]);
        Ok(())
    }

    fn compile_assign(&mut self, target: &Expr, value: &Expr, pos: Pos) -> Result<(), VmError> {
        match target {
            Expr::Ident(ident) => {
                let symbol = self.resolve(ident)?;
                match symbol.scope {
                    SymbolScope::Global | SymbolScope::Local => {
                        self.compile_expr(value)?;
                        self.emit_set(&symbol);
                    }
                    SymbolScope::Free | SymbolScope::Builtin => {
                        return Err(VmError::compile(
                            format!("cannot assign to {}", ident.name),
                            Some(pos),
                        ));
                    }
                }
            }
            Expr::Index {
                value: container,
                index,
                ..
            } => {
                self.compile_expr(container)?;
                self.compile_expr(index)?;
                self.compile_expr(value)?;
                self.emit(Opcode::SetIndex, &[]);
            }
            Expr::Property {
                value: container,
                name,
                ..
            } => {
                self.compile_expr(container)?;
                let index = self.add_constant(Value::string(name.name.clone()));
                self.emit(Opcode::Constant, &[index]);
                self.compile_expr(value)?;
                self.emit(Opcode::SetIndex, &[]);
            }
            _ => return Err(VmError::compile("invalid assignment target", Some(pos))),
        }
        // Assignment is an expression; its value is null.
        self.emit(Opcode::Null, &[]);
        Ok(())
    }

    fn resolve(&mut self, ident: &Ident) -> Result<Symbol, VmError> {
        self.symbols.resolve(&ident.name).ok_or_else(|| {
            VmError::compile(format!("invalid identifier: {}", ident.name), Some(ident.pos))
        })
    }

    fn emit_get(&mut self, symbol: &Symbol) {
        match symbol.scope {
            SymbolScope::Global => self.emit(Opcode::GetGlobal, &[symbol.index]),
            SymbolScope::Local => self.emit(Opcode::GetLocal, &[symbol.index]),
            SymbolScope::Builtin => self.emit(Opcode::GetBuiltin, &[symbol.index]),
            SymbolScope::Free => self.emit(Opcode::GetFree, &[symbol.index]),
        };
    }

    fn emit_set(&mut self, symbol: &Symbol) {
        match symbol.scope {
            SymbolScope::Global => self.emit(Opcode::SetGlobal, &[symbol.index]),
            _ => self.emit(Opcode::SetLocal, &[symbol.index]),
        };
    }
}

/// Convenience for one-shot compilation.
pub fn compile(program: &Program) -> Result<Bytecode, VmError> {
    Compiler::new().compile(program)
}

// ---------------------------------------------------------------------------
// Virtual machine
// ---------------------------------------------------------------------------

/// Called before every instruction dispatch; the hook sees the frame-local
/// instruction pointer.
pub trait DebuggerHook {
    fn before_op(&mut self, ip: usize, op: Opcode);
}

struct Frame {
    closure: Rc<ClosureValue>,
    ip: usize,
    bp: usize,
}

impl Frame {
    fn new(closure: Rc<ClosureValue>, bp: usize) -> Self {
        Self { closure, ip: 0, bp }
    }
}

pub struct Vm {
    constants: Vec<Value>,
    stack: Vec<Value>,
    sp: usize,
    globals: Vec<Value>,
    frames: Vec<Frame>,
    debugger: Option<Rc<RefCell<dyn DebuggerHook>>>,
}

impl Vm {
    pub fn new(bytecode: Bytecode) -> Self {
        Self::with_globals(bytecode, vec![Value::Null; GLOBALS_SIZE])
    }

    /// Reuse a globals vector from a previous run (REPL sessions).
    pub fn with_globals(bytecode: Bytecode, globals: Vec<Value>) -> Self {
        let main = Rc::new(ClosureValue {
            func: Rc::new(CompiledFunction {
                instructions: bytecode.instructions,
                num_locals: 0,
                num_parameters: 0,
            }),
            free: Vec::new(),
        });
        Self {
            constants: bytecode.constants,
            stack: vec![Value::Null; STACK_SIZE],
            sp: 0,
            globals,
            frames: vec![Frame::new(main, 0)],
            debugger: None,
        }
    }

    pub fn into_globals(self) -> Vec<Value> {
        self.globals
    }

    pub fn set_debugger(&mut self, hook: Rc<RefCell<dyn DebuggerHook>>) {
        self.debugger = Some(hook);
    }

    /// The value most recently popped off the operand stack; after a
    /// successful run this is the program's final expression value.
    pub fn last_popped(&self) -> Value {
        self.stack[self.sp].clone()
    }

    fn push(&mut self, value: Value) -> Result<(), VmError> {
        if self.sp >= STACK_SIZE {
            return Err(VmError::runtime("stack overflow"));
        }
        self.stack[self.sp] = value;
        self.sp += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        if self.sp == 0 {
            return Err(VmError::runtime("stack underflow"));
        }
        self.sp -= 1;
        Ok(self.stack[self.sp].clone())
    }

    fn frame(&self) -> &Frame {
        self.frames.last().expect("vm always has a frame")
    }

    fn fetch_u16(&self, at: usize) -> usize {
        let frame = self.frame();
        read_u16(&frame.closure.func.instructions[at..]) as usize
    }

    fn fetch_u8(&self, at: usize) -> usize {
        self.frame().closure.func.instructions[at] as usize
    }

    fn set_ip(&mut self, ip: usize) {
        self.frames.last_mut().expect("vm always has a frame").ip = ip;
    }

    pub fn run(&mut self) -> Result<(), VmError> {
        loop {
            let ip = self.frame().ip;
            let instructions = &self.frame().closure.func.instructions;
            if ip >= instructions.len() {
                if self.frames.len() == 1 {
                    return Ok(());
                }
                return Err(VmError::runtime("instruction pointer out of range"));
            }
            let op = Opcode::from_byte(instructions[ip]).map_err(VmError::runtime)?;
            if let Some(debugger) = self.debugger.clone() {
                debugger.borrow_mut().before_op(ip, op);
            }
            match op {
                Opcode::Constant => {
                    let index = self.fetch_u16(ip + 1);
                    self.set_ip(ip + 3);
                    let value = self
                        .constants
                        .get(index)
                        .cloned()
                        .ok_or_else(|| VmError::runtime(format!("constant {index} undefined")))?;
                    self.push(value)?;
                }
                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                    self.set_ip(ip + 1);
                    let right = self.pop()?;
                    let left = self.pop()?;
                    let result = binary_op(op, &left, &right)?;
                    self.push(result)?;
                }
                Opcode::Equal => {
                    self.set_ip(ip + 1);
                    let right = self.pop()?;
                    let left = self.pop()?;
                    self.push(Value::Bool(left == right))?;
                }
                Opcode::NotEqual => {
                    self.set_ip(ip + 1);
                    let right = self.pop()?;
                    let left = self.pop()?;
                    self.push(Value::Bool(left != right))?;
                }
                Opcode::GreaterThan => {
                    self.set_ip(ip + 1);
                    let right = self.pop()?;
                    let left = self.pop()?;
                    match (&left, &right) {
                        (Value::Int(l), Value::Int(r)) => self.push(Value::Bool(l > r))?,
                        _ => {
                            return Err(VmError::runtime(format!(
                                "unknown operator: {} > {}",
                                left.type_name(),
                                right.type_name()
                            )))
                        }
                    }
                }
                Opcode::Minus => {
                    self.set_ip(ip + 1);
                    let operand = self.pop()?;
                    match operand {
                        Value::Int(v) => self.push(Value::Int(v.wrapping_neg()))?,
                        other => {
                            return Err(VmError::runtime(format!(
                                "cannot use minus on type: {}",
                                other.type_name()
                            )))
                        }
                    }
                }
                Opcode::Bang => {
                    self.set_ip(ip + 1);
                    let operand = self.pop()?;
                    self.push(Value::Bool(!operand.is_truthy()))?;
                }
                Opcode::True => {
                    self.set_ip(ip + 1);
                    self.push(Value::Bool(true))?;
                }
                Opcode::False => {
                    self.set_ip(ip + 1);
                    self.push(Value::Bool(false))?;
                }
                Opcode::Null => {
                    self.set_ip(ip + 1);
                    self.push(Value::Null)?;
                }
                Opcode::Pop => {
                    self.set_ip(ip + 1);
                    self.pop()?;
                }
                Opcode::Jump => {
                    let target = self.fetch_u16(ip + 1);
                    self.set_ip(target);
                }
                Opcode::JumpNotTruthy => {
                    let target = self.fetch_u16(ip + 1);
                    let condition = self.pop()?;
                    if condition.is_truthy() {
                        self.set_ip(ip + 3);
                    } else {
                        self.set_ip(target);
                    }
                }
                Opcode::SetGlobal => {
                    let index = self.fetch_u16(ip + 1);
                    self.set_ip(ip + 3);
                    let value = self.pop()?;
                    self.globals[index] = value;
                }
                Opcode::GetGlobal => {
                    let index = self.fetch_u16(ip + 1);
                    self.set_ip(ip + 3);
                    let value = self.globals[index].clone();
                    self.push(value)?;
                }
                Opcode::SetLocal => {
                    let index = self.fetch_u8(ip + 1);
                    self.set_ip(ip + 2);
                    let value = self.pop()?;
                    let bp = self.frame().bp;
                    self.stack[bp + index] = value;
                }
                Opcode::GetLocal => {
                    let index = self.fetch_u8(ip + 1);
                    self.set_ip(ip + 2);
                    let bp = self.frame().bp;
                    let value = self.stack[bp + index].clone();
                    self.push(value)?;
                }
                Opcode::GetBuiltin => {
                    let index = self.fetch_u8(ip + 1);
                    self.set_ip(ip + 2);
                    let builtin = BUILTINS
                        .get(index)
                        .ok_or_else(|| VmError::runtime(format!("builtin {index} undefined")))?;
                    self.push(Value::Builtin(builtin))?;
                }
                Opcode::GetFree => {
                    let index = self.fetch_u8(ip + 1);
                    self.set_ip(ip + 2);
                    let value = self.frame().closure.free[index].clone();
                    self.push(value)?;
                }
                Opcode::Array => {
                    let count = self.fetch_u16(ip + 1);
                    self.set_ip(ip + 3);
                    let elements = self.stack[self.sp - count..self.sp].to_vec();
                    self.sp -= count;
                    self.push(Value::array(elements))?;
                }
                Opcode::Hash => {
                    let count = self.fetch_u16(ip + 1);
                    self.set_ip(ip + 3);
                    let mut pairs = Pairs::new();
                    let start = self.sp - count * 2;
                    for chunk in self.stack[start..self.sp].chunks(2) {
                        let key = chunk[0].clone();
                        let value = chunk[1].clone();
                        pairs.insert(key.key(), tern_runtime::HashPair { key, value });
                    }
                    self.sp = start;
                    self.push(Value::Hash(Rc::new(RefCell::new(pairs))))?;
                }
                Opcode::Index => {
                    self.set_ip(ip + 1);
                    let index = self.pop()?;
                    let value = self.pop()?;
                    let result = index_op(&value, &index)?;
                    self.push(result)?;
                }
                Opcode::SetIndex => {
                    self.set_ip(ip + 1);
                    let value = self.pop()?;
                    let index = self.pop()?;
                    let container = self.pop()?;
                    set_index_op(&container, &index, value)?;
                }
                Opcode::Call => {
                    let num_args = self.fetch_u8(ip + 1);
                    self.set_ip(ip + 2);
                    self.call(num_args)?;
                }
                Opcode::Return => {
                    let returned = self.pop()?;
                    let frame = self.frames.pop().expect("return pops a frame");
                    if self.frames.is_empty() {
                        // Top-level return: terminate with the value as the
                        // final popped result.
                        self.stack[0] = returned;
                        self.sp = 0;
                        return Ok(());
                    }
                    self.sp = frame.bp - 1;
                    self.push(returned)?;
                }
                Opcode::Closure => {
                    let index = self.fetch_u16(ip + 1);
                    let num_free = self.fetch_u8(ip + 3);
                    self.set_ip(ip + 4);
                    let func = match self.constants.get(index) {
                        Some(Value::Compiled(func)) => func.clone(),
                        Some(other) => {
                            return Err(VmError::runtime(format!(
                                "not a function: {}",
                                other.type_name()
                            )))
                        }
                        None => {
                            return Err(VmError::runtime(format!("constant {index} undefined")))
                        }
                    };
                    let free = self.stack[self.sp - num_free..self.sp].to_vec();
                    self.sp -= num_free;
                    self.push(Value::Closure(Rc::new(ClosureValue { func, free })))?;
                }
            }
        }
    }

    fn call(&mut self, num_args: usize) -> Result<(), VmError> {
        let callee = self.stack[self.sp - 1 - num_args].clone();
        match callee {
            Value::Closure(closure) => {
                if num_args != closure.func.num_parameters {
                    return Err(VmError::runtime(format!(
                        "wrong number of arguments: want={}, got={}",
                        closure.func.num_parameters, num_args
                    )));
                }
                if self.frames.len() >= MAX_FRAMES {
                    return Err(VmError::runtime("frame overflow"));
                }
                let bp = self.sp - num_args;
                let new_sp = bp + closure.func.num_locals;
                if new_sp > STACK_SIZE {
                    return Err(VmError::runtime("stack overflow"));
                }
                // Slots above the arguments are this frame's locals.
                for slot in &mut self.stack[self.sp..new_sp] {
                    *slot = Value::Null;
                }
                self.sp = new_sp;
                self.frames.push(Frame::new(closure, bp));
                Ok(())
            }
            Value::Builtin(builtin) => {
                let args = self.stack[self.sp - num_args..self.sp].to_vec();
                let result = (builtin.func)(args).map_err(VmError::runtime)?;
                self.sp -= num_args + 1;
                self.push(result)
            }
            _ => Err(VmError::runtime("calling non-function")),
        }
    }
}

fn binary_op(op: Opcode, left: &Value, right: &Value) -> Result<Value, VmError> {
    match (left, right) {
        (Value::Int(l), Value::Int(r)) => {
            let result = match op {
                Opcode::Add => l.wrapping_add(*r),
                Opcode::Sub => l.wrapping_sub(*r),
                Opcode::Mul => l.wrapping_mul(*r),
                Opcode::Div => {
                    if *r == 0 {
                        return Err(VmError::runtime("division by zero"));
                    }
                    l.wrapping_div(*r)
                }
                _ => unreachable!("binary_op only handles arithmetic opcodes"),
            };
            Ok(Value::Int(result))
        }
        (Value::Str(l), Value::Str(r)) if op == Opcode::Add => {
            Ok(Value::string(format!("{l}{r}")))
        }
        _ => Err(VmError::runtime(format!(
            "unsupported types for binary operator: {}, {}",
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn index_op(value: &Value, index: &Value) -> Result<Value, VmError> {
    match value {
        Value::Array(elements) => match index {
            Value::Int(i) => {
                let elements = elements.borrow();
                if *i < 0 || *i >= elements.len() as i64 {
                    return Err(VmError::runtime(format!("index out of range: {i}")));
                }
                Ok(elements[*i as usize].clone())
            }
            other => Err(VmError::runtime(format!(
                "cannot index into array with: {}",
                other.type_name()
            ))),
        },
        Value::Hash(pairs) => Ok(hash_get(pairs, index).unwrap_or(Value::Null)),
        Value::Str(s) => match index {
            Value::Int(i) => {
                let bytes = s.as_bytes();
                if *i < 0 || *i >= bytes.len() as i64 {
                    return Err(VmError::runtime(format!("index out of range: {i}")));
                }
                // Byte indexing; a one-byte string comes back.
                let byte = bytes[*i as usize];
                Ok(Value::string(
                    String::from_utf8_lossy(&[byte]).into_owned(),
                ))
            }
            other => Err(VmError::runtime(format!(
                "cannot index into string with: {}",
                other.type_name()
            ))),
        },
        other => Err(VmError::runtime(format!(
            "cannot index into: {}",
            other.type_name()
        ))),
    }
}

fn set_index_op(container: &Value, index: &Value, value: Value) -> Result<(), VmError> {
    match container {
        Value::Array(elements) => match index {
            Value::Int(i) => {
                let mut elements = elements.borrow_mut();
                if *i < 0 || *i >= elements.len() as i64 {
                    return Err(VmError::runtime(format!("index out of range: {i}")));
                }
                elements[*i as usize] = value;
                Ok(())
            }
            other => Err(VmError::runtime(format!(
                "cannot index into array with: {}",
                other.type_name()
            ))),
        },
        Value::Hash(pairs) => {
            hash_set(pairs, index.clone(), value);
            Ok(())
        }
        other => Err(VmError::runtime(format!(
            "cannot assign to index of: {}",
            other.type_name()
        ))),
    }
}
