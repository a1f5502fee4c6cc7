// File: src/compiler.rs
//
// Bytecode compiler for the Rill engine.
// Lowers the expression tree into instruction lists, resolves identifiers to
// locals, upvalues, or global fields, assigns slots, recognizes tail calls,
// installs try handler records, and links everything into a ProgramImage.
//
// Compilation runs in three phases:
//   1. simplification (optimizer.rs) when constant folding is enabled;
//   2. capture analysis: a scope-faithful walk that records which
//      declarations are referenced from inner functions, keyed by the
//      address of the declaration's name in the tree (stable no matter how
//      many times a finally body is re-emitted);
//   3. emission and linking: symbolic labels become byte offsets, debug
//      pseudo-instructions are stripped into offset-keyed tables.
//
// Frame storage classes: a local that no inner function captures lives in a
// plain frame slot (LdLocF/StLocF). A captured local lives in a shared cell
// in the frame's upvalue array, which is laid out cells-first with received
// upvalues after them; cell indices are stable during emission while
// received indices are patched once the function is finished.

use crate::ast::{BinaryOp, Expr, ExprKind, FunctionDecl, Stmt, StmtKind, UnaryOp};
use crate::bytecode::{Instruction, OpCode, Operand};
use crate::errors::{ScriptError, SourceLocation};
use crate::optimizer::Simplifier;
use crate::program::{
    CaptureSource, DebugInfo, FunctionInfo, HandlerKind, HandlerRecord, PositionEntry,
    ProgramImage, ScopeEntry, StatementEntry,
};
use ahash::{AHashMap, AHashSet};
use std::sync::Arc;

/// Marker bit on upvalue-slot operands that still index the received region;
/// cleared (and rebased past the cell region) when the function is finished.
const RECV_MARK: u16 = 0x8000;

/// Compiler configuration
#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Run the expression-tree simplifier before emission
    pub fold_constants: bool,
    /// Emit position/statement/scope pseudo-instructions and build the
    /// image's debug tables
    pub emit_debug_info: bool,
    /// Emit a DebugCheckpoint at every statement boundary so an attached
    /// debugger can stop between statements
    pub emit_checkpoints: bool,
    /// Source file name recorded in the debug tables
    pub file_name: Option<String>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            fold_constants: true,
            emit_debug_info: true,
            emit_checkpoints: false,
            file_name: None,
        }
    }
}

/// Compiles an expression tree into a program image
pub struct Compiler {
    options: CompilerOptions,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        Self { options: CompilerOptions::default() }
    }

    pub fn with_options(options: CompilerOptions) -> Self {
        Self { options }
    }

    /// Compile a program (the statement list of the top-level function)
    pub fn compile(self, stmts: Vec<Stmt>) -> Result<Arc<ProgramImage>, ScriptError> {
        let stmts = if self.options.fold_constants {
            Simplifier::new().simplify_stmts(stmts)
        } else {
            stmts
        };
        let captured = analyze_captures(&stmts);
        let mut gen = CodeGen::new(self.options, captured);
        gen.run(&stmts)
    }
}

/// Address of a declaration's name String inside the tree; the stable
/// identity of that declaration across emission passes.
fn decl_key(name: &String) -> usize {
    name as *const String as usize
}

// ---------------------------------------------------------------------------
// Capture analysis
// ---------------------------------------------------------------------------

struct AnalyzerFunc {
    /// Block scopes, innermost last: name -> declaration key
    scopes: Vec<AHashMap<String, usize>>,
}

struct Analyzer {
    funcs: Vec<AnalyzerFunc>,
    captured: AHashSet<usize>,
}

/// Walk the tree with real scoping rules and collect the declarations that
/// are referenced from inside a nested function.
fn analyze_captures(stmts: &[Stmt]) -> AHashSet<usize> {
    let mut analyzer = Analyzer {
        funcs: vec![AnalyzerFunc { scopes: vec![AHashMap::new()] }],
        captured: AHashSet::new(),
    };
    analyzer.walk_stmts(stmts);
    analyzer.captured
}

impl Analyzer {
    fn declare(&mut self, name: &String) {
        let key = decl_key(name);
        if let Some(scope) = self.funcs.last_mut().and_then(|f| f.scopes.last_mut()) {
            scope.insert(name.clone(), key);
        }
    }

    fn reference(&mut self, name: &str) {
        for (depth, func) in self.funcs.iter().enumerate().rev() {
            for scope in func.scopes.iter().rev() {
                if let Some(&key) = scope.get(name) {
                    if depth + 1 != self.funcs.len() {
                        self.captured.insert(key);
                    }
                    return;
                }
            }
        }
    }

    fn scoped(&mut self, stmts: &[Stmt]) {
        self.funcs.last_mut().unwrap().scopes.push(AHashMap::new());
        self.walk_stmts(stmts);
        self.funcs.last_mut().unwrap().scopes.pop();
    }

    fn walk_stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.walk_stmt(stmt);
        }
    }

    fn walk_function(&mut self, decl: &FunctionDecl) {
        self.funcs.push(AnalyzerFunc { scopes: vec![AHashMap::new()] });
        for param in &decl.params {
            self.declare(param);
        }
        self.walk_stmts(&decl.body);
        self.funcs.pop();
    }

    fn walk_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Expr(e) => self.walk_expr(e),
            StmtKind::VarDecl { name, value } => {
                if let Some(value) = value {
                    self.walk_expr(value);
                }
                self.declare(name);
            }
            StmtKind::Assign { target, value } => {
                self.walk_expr(value);
                self.walk_expr(target);
            }
            StmtKind::If { condition, then_branch, else_branch } => {
                self.walk_expr(condition);
                self.scoped(then_branch);
                if let Some(else_branch) = else_branch {
                    self.scoped(else_branch);
                }
            }
            StmtKind::While { condition, body } => {
                self.walk_expr(condition);
                self.scoped(body);
            }
            StmtKind::DoWhile { body, condition } => {
                self.scoped(body);
                self.walk_expr(condition);
            }
            StmtKind::For { init, condition, update, body } => {
                self.funcs.last_mut().unwrap().scopes.push(AHashMap::new());
                if let Some(init) = init {
                    self.walk_stmt(init);
                }
                if let Some(condition) = condition {
                    self.walk_expr(condition);
                }
                self.scoped(body);
                if let Some(update) = update {
                    self.walk_stmt(update);
                }
                self.funcs.last_mut().unwrap().scopes.pop();
            }
            StmtKind::Foreach { name, iterable, body } => {
                self.walk_expr(iterable);
                self.funcs.last_mut().unwrap().scopes.push(AHashMap::new());
                self.declare(name);
                self.walk_stmts(body);
                self.funcs.last_mut().unwrap().scopes.pop();
            }
            StmtKind::Switch { subject, cases, default } => {
                self.walk_expr(subject);
                for case in cases {
                    for value in &case.values {
                        self.walk_expr(value);
                    }
                    self.scoped(&case.body);
                }
                if let Some(default) = default {
                    self.scoped(default);
                }
            }
            StmtKind::Break | StmtKind::Continue => {}
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.walk_expr(value);
                }
            }
            StmtKind::TryCatch { try_body, catch_name, catch_body, finally_body } => {
                self.scoped(try_body);
                if let Some(catch_body) = catch_body {
                    self.funcs.last_mut().unwrap().scopes.push(AHashMap::new());
                    if let Some(name) = catch_name {
                        self.declare(name);
                    }
                    self.walk_stmts(catch_body);
                    self.funcs.last_mut().unwrap().scopes.pop();
                }
                if let Some(finally_body) = finally_body {
                    self.scoped(finally_body);
                }
            }
            StmtKind::Block(body) => self.scoped(body),
            StmtKind::FuncDecl(decl) => {
                if let Some(name) = &decl.name {
                    self.declare(name);
                }
                self.walk_function(decl);
            }
            StmtKind::Import { name } => self.declare(name),
            StmtKind::Export { decl } => self.walk_stmt(decl),
        }
    }

    fn walk_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Identifier(name) => self.reference(name),
            ExprKind::Binary { left, right, .. } => {
                self.walk_expr(left);
                self.walk_expr(right);
            }
            ExprKind::Unary { operand, .. } => self.walk_expr(operand),
            ExprKind::Ternary { condition, then_value, else_value } => {
                self.walk_expr(condition);
                self.walk_expr(then_value);
                self.walk_expr(else_value);
            }
            ExprKind::Index { object, index } => {
                self.walk_expr(object);
                self.walk_expr(index);
            }
            ExprKind::Field { object, .. } => self.walk_expr(object),
            ExprKind::Slice { object, start, end, step } => {
                self.walk_expr(object);
                for bound in [start, end, step].into_iter().flatten() {
                    self.walk_expr(bound);
                }
            }
            ExprKind::Call { callee, args } => {
                for arg in args {
                    self.walk_expr(arg);
                }
                self.walk_expr(callee);
            }
            ExprKind::MethodCall { receiver, args, .. } => {
                self.walk_expr(receiver);
                for arg in args {
                    self.walk_expr(arg);
                }
            }
            ExprKind::Function(decl) => self.walk_function(decl),
            ExprKind::ObjectLiteral(fields) => {
                for (_, value) in fields {
                    self.walk_expr(value);
                }
            }
            ExprKind::ArrayLiteral(elements) => {
                for element in elements {
                    self.walk_expr(element);
                }
            }
            ExprKind::Yield(inner) => self.walk_expr(inner),
            ExprKind::Number(_)
            | ExprKind::Str(_)
            | ExprKind::Bool(_)
            | ExprKind::Undefined
            | ExprKind::Null
            | ExprKind::Global => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Emission
// ---------------------------------------------------------------------------

/// Where an identifier resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VarRef {
    Local(u16),
    Arg(u16),
    /// Frame-owned cell (a captured local of this function)
    Cell(u16),
    /// Received upvalue (captured from an enclosing function)
    Recv(u16),
}

struct Scope {
    map: AHashMap<String, VarRef>,
    debug_id: u32,
}

struct LoopCtx {
    break_label: u32,
    /// None for switch statements, which accept break but not continue
    continue_label: Option<u32>,
    finally_depth: usize,
}

struct PendingHandler {
    start_label: u32,
    end_label: u32,
    target_label: u32,
    kind: HandlerKind,
}

struct ScopeMeta {
    id: u32,
    parent: i32,
    names: Vec<(u32, u16)>,
}

struct FunctionBuilder<'ast> {
    id: usize,
    name: Option<String>,
    is_sequence: bool,
    var_arg: bool,
    num_args: u16,
    instructions: Vec<Instruction>,
    scopes: Vec<Scope>,
    next_local: u16,
    num_cells: u16,
    upvalues: Vec<(String, CaptureSource)>,
    loops: Vec<LoopCtx>,
    /// Finally bodies that are active while compiling their protected
    /// region; break/continue/return re-emit them before leaving
    finallys: Vec<&'ast [Stmt]>,
    /// Active try/finally nesting; any nesting cancels tail calls
    try_depth: usize,
    handlers: Vec<PendingHandler>,
    scope_meta: Vec<ScopeMeta>,
    /// Indices into scope_meta for the scopes currently open
    scope_stack: Vec<usize>,
    last_position: (u32, u32),
}

/// A finished function waiting for the link pass
struct FunctionPart {
    instructions: Vec<Instruction>,
    info: FunctionInfo,
    handlers: Vec<PendingHandler>,
    scope_meta: Vec<ScopeMeta>,
}

struct CodeGen<'ast> {
    options: CompilerOptions,
    captured: AHashSet<usize>,
    numbers: Vec<f64>,
    number_index: AHashMap<u64, u32>,
    strings: Vec<String>,
    string_index: AHashMap<String, u32>,
    parts: Vec<Option<FunctionPart>>,
    funcs: Vec<FunctionBuilder<'ast>>,
    next_label: u32,
    next_scope: u32,
}

impl<'ast> CodeGen<'ast> {
    fn new(options: CompilerOptions, captured: AHashSet<usize>) -> Self {
        Self {
            options,
            captured,
            numbers: Vec::new(),
            number_index: AHashMap::new(),
            strings: Vec::new(),
            string_index: AHashMap::new(),
            parts: Vec::new(),
            funcs: Vec::new(),
            next_label: 0,
            next_scope: 0,
        }
    }

    fn run(&mut self, stmts: &'ast [Stmt]) -> Result<Arc<ProgramImage>, ScriptError> {
        self.parts.push(None);
        self.push_function(0, Some("main".to_string()), &[], false, false);
        self.emit(OpCode::Enter, vec![Operand::UInt(0)]);
        self.begin_scope();
        self.compile_stmts(stmts)?;
        self.end_scope();
        self.emit(OpCode::LdUndef, vec![]);
        self.emit(OpCode::Ret, vec![]);
        self.finish_function();
        self.link()
    }

    // --- constant pools ---

    fn intern_number(&mut self, value: f64) -> u32 {
        let bits = value.to_bits();
        if let Some(&index) = self.number_index.get(&bits) {
            return index;
        }
        let index = self.numbers.len() as u32;
        self.numbers.push(value);
        self.number_index.insert(bits, index);
        index
    }

    fn intern_string(&mut self, value: &str) -> u32 {
        if let Some(&index) = self.string_index.get(value) {
            return index;
        }
        let index = self.strings.len() as u32;
        self.strings.push(value.to_string());
        self.string_index.insert(value.to_string(), index);
        index
    }

    // --- builder plumbing ---

    fn cur(&mut self) -> &mut FunctionBuilder<'ast> {
        self.funcs.last_mut().unwrap()
    }

    fn emit(&mut self, op: OpCode, operands: Vec<Operand>) {
        self.cur().instructions.push(Instruction { op, operands });
    }

    fn new_label(&mut self) -> u32 {
        let label = self.next_label;
        self.next_label += 1;
        label
    }

    fn mark(&mut self, label: u32) {
        self.emit(OpCode::Label, vec![Operand::Label(label)]);
    }

    fn push_function(
        &mut self,
        id: usize,
        name: Option<String>,
        params: &'ast [String],
        var_arg: bool,
        is_sequence: bool,
    ) {
        let mut builder = FunctionBuilder {
            id,
            name,
            is_sequence,
            var_arg,
            num_args: params.len() as u16,
            instructions: Vec::new(),
            scopes: vec![Scope { map: AHashMap::new(), debug_id: self.next_scope }],
            next_local: 0,
            num_cells: 0,
            upvalues: Vec::new(),
            loops: Vec::new(),
            finallys: Vec::new(),
            try_depth: 0,
            handlers: Vec::new(),
            scope_meta: Vec::new(),
            scope_stack: Vec::new(),
            last_position: (0, 0),
        };
        builder.scope_meta.push(ScopeMeta { id: self.next_scope, parent: -1, names: Vec::new() });
        builder.scope_stack.push(0);
        self.next_scope += 1;
        self.funcs.push(builder);
    }

    /// Finalize the current builder: patch Enter with the local count,
    /// rebase received-upvalue slots past the cell region, and store the
    /// finished part for linking.
    fn finish_function(&mut self) {
        let mut builder = self.funcs.pop().unwrap();
        let num_cells = builder.num_cells;
        let num_locals = builder.next_local;

        for instruction in &mut builder.instructions {
            match instruction.op {
                OpCode::Enter => {
                    instruction.operands = vec![Operand::UInt(num_locals as u32)];
                }
                OpCode::LdUpValue | OpCode::StUpValue => {
                    if let Some(Operand::Slot(slot)) = instruction.operands.first().copied() {
                        if slot & RECV_MARK != 0 {
                            instruction.operands =
                                vec![Operand::Slot(num_cells + (slot & !RECV_MARK))];
                        }
                    }
                }
                _ => {}
            }
        }

        let debug_name = builder.name.take().map(|n| self.intern_string(&n));
        let info = FunctionInfo {
            entry_offset: 0,
            num_args: builder.num_args,
            num_locals,
            num_upvalues: builder.upvalues.len() as u16,
            num_cells,
            has_var_args: builder.var_arg,
            is_sequence: builder.is_sequence,
            debug_name,
            captures: builder.upvalues.iter().map(|(_, source)| *source).collect(),
            handlers: Vec::new(),
        };

        self.parts[builder.id] = Some(FunctionPart {
            instructions: builder.instructions,
            info,
            handlers: builder.handlers,
            scope_meta: builder.scope_meta,
        });
    }

    // --- scopes and variables ---

    fn begin_scope(&mut self) {
        let id = self.next_scope;
        self.next_scope += 1;
        let parent = self.cur().scopes.last().map(|s| s.debug_id as i32).unwrap_or(-1);
        self.cur().scopes.push(Scope { map: AHashMap::new(), debug_id: id });
        let at = self.cur().scope_meta.len();
        self.cur().scope_meta.push(ScopeMeta { id, parent, names: Vec::new() });
        self.cur().scope_stack.push(at);
        if self.options.emit_debug_info {
            self.emit(OpCode::DbgScopeBegin, vec![Operand::UInt(id)]);
        }
    }

    fn end_scope(&mut self) {
        let scope = self.cur().scopes.pop().unwrap();
        self.cur().scope_stack.pop();
        if self.options.emit_debug_info {
            self.emit(OpCode::DbgScopeEnd, vec![Operand::UInt(scope.debug_id)]);
        }
    }

    /// Allocate an unnamed local slot for lowering temporaries
    fn hidden_local(&mut self) -> u16 {
        let slot = self.cur().next_local;
        self.cur().next_local += 1;
        slot
    }

    fn declare_local(
        &mut self,
        name: &String,
        location: &SourceLocation,
    ) -> Result<VarRef, ScriptError> {
        if self.cur().scopes.last().unwrap().map.contains_key(name) {
            return Err(ScriptError::compile_error(
                format!("duplicate declaration of '{}'", name),
                location.clone(),
            ));
        }
        let var = if self.captured.contains(&decl_key(name)) {
            let cell = self.cur().num_cells;
            self.cur().num_cells += 1;
            VarRef::Cell(cell)
        } else {
            let slot = self.cur().next_local;
            self.cur().next_local += 1;
            VarRef::Local(slot)
        };
        self.record_debug_name(name, var);
        self.cur().scopes.last_mut().unwrap().map.insert(name.clone(), var);
        Ok(var)
    }

    fn record_debug_name(&mut self, name: &str, var: VarRef) {
        if !self.options.emit_debug_info {
            return;
        }
        let index = self.intern_string(name);
        let slot = match var {
            VarRef::Local(slot) | VarRef::Arg(slot) | VarRef::Cell(slot) | VarRef::Recv(slot) => {
                slot
            }
        };
        let builder = self.cur();
        if let Some(&at) = builder.scope_stack.last() {
            builder.scope_meta[at].names.push((index, slot));
        }
    }

    /// Resolve a name from the innermost function outward, adding capture
    /// entries through every intermediate function on the way.
    fn resolve_var(&mut self, name: &str) -> Result<Option<VarRef>, ScriptError> {
        let top = self.funcs.len() - 1;
        self.resolve_in(top, name)
    }

    fn resolve_in(&mut self, fi: usize, name: &str) -> Result<Option<VarRef>, ScriptError> {
        for scope in self.funcs[fi].scopes.iter().rev() {
            if let Some(&var) = scope.map.get(name) {
                return Ok(Some(var));
            }
        }
        if fi == 0 {
            return Ok(None);
        }
        let parent = match self.resolve_in(fi - 1, name)? {
            Some(var) => var,
            None => return Ok(None),
        };
        let source = match parent {
            VarRef::Cell(cell) => CaptureSource::LocalCell(cell),
            VarRef::Recv(index) => CaptureSource::Upvalue(index),
            VarRef::Local(_) | VarRef::Arg(_) => {
                return Err(ScriptError::compile_error(
                    format!("internal: captured variable '{}' has no cell", name),
                    SourceLocation::unknown(),
                ));
            }
        };
        Ok(Some(VarRef::Recv(self.add_upvalue(fi, name, source))))
    }

    fn add_upvalue(&mut self, fi: usize, name: &str, source: CaptureSource) -> u16 {
        let builder = &mut self.funcs[fi];
        if let Some(at) = builder.upvalues.iter().position(|(n, _)| n == name) {
            return at as u16;
        }
        builder.upvalues.push((name.to_string(), source));
        (builder.upvalues.len() - 1) as u16
    }

    fn emit_load_var(&mut self, var: VarRef) {
        match var {
            VarRef::Local(slot) => self.emit(OpCode::LdLocF, vec![Operand::Slot(slot)]),
            VarRef::Arg(slot) => self.emit(OpCode::LdArgF, vec![Operand::Slot(slot)]),
            VarRef::Cell(cell) => self.emit(OpCode::LdUpValue, vec![Operand::Slot(cell)]),
            VarRef::Recv(index) => {
                self.emit(OpCode::LdUpValue, vec![Operand::Slot(RECV_MARK | index)])
            }
        }
    }

    fn emit_store_var(&mut self, var: VarRef) {
        match var {
            VarRef::Local(slot) => self.emit(OpCode::StLocF, vec![Operand::Slot(slot)]),
            VarRef::Arg(slot) => self.emit(OpCode::StArgF, vec![Operand::Slot(slot)]),
            VarRef::Cell(cell) => self.emit(OpCode::StUpValue, vec![Operand::Slot(cell)]),
            VarRef::Recv(index) => {
                self.emit(OpCode::StUpValue, vec![Operand::Slot(RECV_MARK | index)])
            }
        }
    }

    /// Bind a freshly declared variable from the value on top of the stack.
    /// Captured declarations get a fresh cell first, which is what gives
    /// loop-scoped declarations a new binding on every execution of the
    /// declaration.
    fn emit_bind_declaration(&mut self, var: VarRef) {
        if let VarRef::Cell(cell) = var {
            self.emit(OpCode::NewCell, vec![Operand::Slot(cell)]);
        }
        self.emit_store_var(var);
    }

    // --- debug pseudo-instructions ---

    fn emit_position(&mut self, location: &SourceLocation) {
        if !self.options.emit_debug_info || !location.is_known() {
            return;
        }
        let position = (location.line as u32, location.column as u32);
        if self.cur().last_position == position {
            return;
        }
        self.cur().last_position = position;
        self.emit(
            OpCode::DbgPosition,
            vec![Operand::UInt(position.0), Operand::UInt(position.1)],
        );
    }

    fn emit_statement_marker(&mut self, location: &SourceLocation) {
        if self.options.emit_debug_info && location.is_known() {
            self.emit(OpCode::DbgStatement, vec![Operand::UInt(location.line as u32)]);
        }
        if self.options.emit_checkpoints {
            self.emit(OpCode::DebugCheckpoint, vec![]);
        }
    }

    // --- statements ---

    fn compile_stmts(&mut self, stmts: &'ast [Stmt]) -> Result<(), ScriptError> {
        for stmt in stmts {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_block(&mut self, stmts: &'ast [Stmt]) -> Result<(), ScriptError> {
        self.begin_scope();
        let result = self.compile_stmts(stmts);
        self.end_scope();
        result
    }

    fn compile_stmt(&mut self, stmt: &'ast Stmt) -> Result<(), ScriptError> {
        self.emit_statement_marker(&stmt.location);
        self.emit_position(&stmt.location);

        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.compile_expr(expr)?;
                self.emit(OpCode::Drop, vec![]);
            }

            StmtKind::VarDecl { name, value } => {
                match value {
                    Some(value) => self.compile_expr(value)?,
                    None => self.emit(OpCode::LdUndef, vec![]),
                }
                let var = self.declare_local(name, &stmt.location)?;
                self.emit_bind_declaration(var);
            }

            StmtKind::Assign { target, value } => self.compile_assign(target, value)?,

            StmtKind::If { condition, then_branch, else_branch } => {
                let else_label = self.new_label();
                let end_label = self.new_label();
                self.compile_expr(condition)?;
                self.emit(OpCode::JmpFalse, vec![Operand::Label(else_label)]);
                self.compile_block(then_branch)?;
                self.emit(OpCode::Jmp, vec![Operand::Label(end_label)]);
                self.mark(else_label);
                if let Some(else_branch) = else_branch {
                    self.compile_block(else_branch)?;
                }
                self.mark(end_label);
            }

            StmtKind::While { condition, body } => {
                let start = self.new_label();
                let end = self.new_label();
                self.mark(start);
                self.compile_expr(condition)?;
                self.emit(OpCode::JmpFalse, vec![Operand::Label(end)]);
                self.enter_loop(end, Some(start));
                self.compile_block(body)?;
                self.exit_loop();
                self.emit(OpCode::Jmp, vec![Operand::Label(start)]);
                self.mark(end);
            }

            StmtKind::DoWhile { body, condition } => {
                let start = self.new_label();
                let check = self.new_label();
                let end = self.new_label();
                self.mark(start);
                self.enter_loop(end, Some(check));
                self.compile_block(body)?;
                self.exit_loop();
                self.mark(check);
                self.compile_expr(condition)?;
                self.emit(OpCode::JmpTrue, vec![Operand::Label(start)]);
                self.mark(end);
            }

            StmtKind::For { init, condition, update, body } => {
                self.begin_scope();
                if let Some(init) = init {
                    self.compile_stmt(init)?;
                }
                let start = self.new_label();
                let continue_label = self.new_label();
                let end = self.new_label();
                self.mark(start);
                if let Some(condition) = condition {
                    self.compile_expr(condition)?;
                    self.emit(OpCode::JmpFalse, vec![Operand::Label(end)]);
                }
                self.enter_loop(end, Some(continue_label));
                self.compile_block(body)?;
                self.exit_loop();
                self.mark(continue_label);
                if let Some(update) = update {
                    self.compile_stmt(update)?;
                }
                self.emit(OpCode::Jmp, vec![Operand::Label(start)]);
                self.mark(end);
                self.end_scope();
            }

            StmtKind::Foreach { name, iterable, body } => {
                self.compile_foreach(name, iterable, body, &stmt.location)?;
            }

            StmtKind::Switch { subject, cases, default } => {
                self.compile_switch(subject, cases, default.as_deref())?;
            }

            StmtKind::Break => {
                let ctx = self
                    .cur()
                    .loops
                    .last()
                    .map(|l| (l.break_label, l.finally_depth))
                    .ok_or_else(|| {
                        ScriptError::compile_error(
                            "'break' outside of a loop".to_string(),
                            stmt.location.clone(),
                        )
                    })?;
                self.unwind_finallys(ctx.1)?;
                self.emit(OpCode::Jmp, vec![Operand::Label(ctx.0)]);
            }

            StmtKind::Continue => {
                let ctx = self
                    .cur()
                    .loops
                    .iter()
                    .rev()
                    .find_map(|l| l.continue_label.map(|c| (c, l.finally_depth)))
                    .ok_or_else(|| {
                        ScriptError::compile_error(
                            "'continue' outside of a loop".to_string(),
                            stmt.location.clone(),
                        )
                    })?;
                self.unwind_finallys(ctx.1)?;
                self.emit(OpCode::Jmp, vec![Operand::Label(ctx.0)]);
            }

            StmtKind::Return(value) => self.compile_return(value.as_ref())?,

            StmtKind::TryCatch { try_body, catch_name, catch_body, finally_body } => {
                match finally_body {
                    Some(finally) => {
                        self.compile_try_finally(try_body, catch_name, catch_body, finally)?
                    }
                    None => self.compile_try_catch(try_body, catch_name, catch_body)?,
                }
            }

            StmtKind::Block(body) => self.compile_block(body)?,

            StmtKind::FuncDecl(decl) => {
                let name = decl.name.as_ref().ok_or_else(|| {
                    ScriptError::compile_error(
                        "function statement requires a name".to_string(),
                        stmt.location.clone(),
                    )
                })?;
                // Declared before the body compiles so it can recurse
                let var = self.declare_local(name, &stmt.location)?;
                if let VarRef::Cell(cell) = var {
                    self.emit(OpCode::NewCell, vec![Operand::Slot(cell)]);
                }
                let index = self.compile_function(decl)?;
                self.emit(OpCode::Closure, vec![Operand::UInt(index)]);
                self.emit_store_var(var);
            }

            StmtKind::Import { name } => {
                let field = self.intern_string(name);
                self.emit(OpCode::LdGlobalFld, vec![Operand::UInt(field)]);
                let var = self.declare_local(name, &stmt.location)?;
                self.emit_bind_declaration(var);
            }

            StmtKind::Export { decl } => {
                self.compile_stmt(decl)?;
                let name = match &decl.kind {
                    StmtKind::VarDecl { name, .. } => name.clone(),
                    StmtKind::FuncDecl(func) => func.name.clone().unwrap_or_default(),
                    _ => {
                        return Err(ScriptError::compile_error(
                            "only declarations can be exported".to_string(),
                            stmt.location.clone(),
                        ))
                    }
                };
                let var = self.resolve_var(&name)?.ok_or_else(|| {
                    ScriptError::compile_error(
                        format!("unresolved identifier '{}'", name),
                        stmt.location.clone(),
                    )
                })?;
                self.emit_load_var(var);
                self.emit(OpCode::LdGlobal, vec![]);
                let field = self.intern_string(&name);
                self.emit(OpCode::StFld, vec![Operand::UInt(field)]);
            }
        }
        Ok(())
    }

    fn enter_loop(&mut self, break_label: u32, continue_label: Option<u32>) {
        let finally_depth = self.cur().finallys.len();
        self.cur().loops.push(LoopCtx { break_label, continue_label, finally_depth });
    }

    fn exit_loop(&mut self) {
        self.cur().loops.pop();
    }

    /// Re-emit the bodies of every finally block entered past `depth`,
    /// innermost first; used before break/continue/return leave them.
    fn unwind_finallys(&mut self, depth: usize) -> Result<(), ScriptError> {
        let pending: Vec<&'ast [Stmt]> =
            self.cur().finallys[depth..].iter().rev().copied().collect();
        for body in pending {
            self.compile_block(body)?;
        }
        Ok(())
    }

    fn compile_foreach(
        &mut self,
        name: &'ast String,
        iterable: &'ast Expr,
        body: &'ast [Stmt],
        location: &SourceLocation,
    ) -> Result<(), ScriptError> {
        // enumerator = iterable.getEnumerator()
        self.compile_expr(iterable)?;
        let get_enumerator = self.intern_string("getEnumerator");
        self.emit(
            OpCode::InstanceCall,
            vec![Operand::UInt(0), Operand::UInt(get_enumerator)],
        );
        let enumerator = self.hidden_local();
        self.emit(OpCode::StLocF, vec![Operand::Slot(enumerator)]);

        let start = self.new_label();
        let end = self.new_label();
        let move_next = self.intern_string("moveNext");
        let current = self.intern_string("current");

        self.mark(start);
        self.emit(OpCode::LdLocF, vec![Operand::Slot(enumerator)]);
        self.emit(
            OpCode::InstanceCall,
            vec![Operand::UInt(0), Operand::UInt(move_next)],
        );
        self.emit(OpCode::JmpFalse, vec![Operand::Label(end)]);

        // The loop variable is a fresh binding on every iteration
        self.begin_scope();
        self.emit(OpCode::LdLocF, vec![Operand::Slot(enumerator)]);
        self.emit(OpCode::LdFld, vec![Operand::UInt(current)]);
        let var = self.declare_local(name, location)?;
        self.emit_bind_declaration(var);

        self.enter_loop(end, Some(start));
        let result = self.compile_stmts(body);
        self.exit_loop();
        self.end_scope();
        result?;

        self.emit(OpCode::Jmp, vec![Operand::Label(start)]);
        self.mark(end);
        Ok(())
    }

    fn compile_switch(
        &mut self,
        subject: &'ast Expr,
        cases: &'ast [crate::ast::SwitchCase],
        default: Option<&'ast [Stmt]>,
    ) -> Result<(), ScriptError> {
        self.compile_expr(subject)?;

        let end = self.new_label();
        let default_label = self.new_label();
        let case_labels: Vec<u32> = cases.iter().map(|_| self.new_label()).collect();

        // Dense integral case sets dispatch through a jump table
        if let Some((base, count, slots)) = dense_case_layout(cases) {
            let mut operands = vec![
                Operand::UInt(base as u32),
                Operand::UInt(count),
                Operand::Label(default_label),
            ];
            for slot in slots {
                operands.push(match slot {
                    Some(case) => Operand::Label(case_labels[case]),
                    None => Operand::Label(default_label),
                });
            }
            self.emit(OpCode::JmpTable, operands);
        } else {
            // Sparse or non-numeric cases lower to an equality chain
            let subject_slot = self.hidden_local();
            self.emit(OpCode::StLocF, vec![Operand::Slot(subject_slot)]);
            for (case, &label) in cases.iter().zip(&case_labels) {
                for value in &case.values {
                    self.emit(OpCode::LdLocF, vec![Operand::Slot(subject_slot)]);
                    self.compile_expr(value)?;
                    self.emit(OpCode::Eq, vec![]);
                    self.emit(OpCode::JmpTrue, vec![Operand::Label(label)]);
                }
            }
            self.emit(OpCode::Jmp, vec![Operand::Label(default_label)]);
        }

        // Bodies; no fallthrough, every case ends with an implicit break
        self.enter_loop(end, None);
        for (case, &label) in cases.iter().zip(&case_labels) {
            self.mark(label);
            self.compile_block(&case.body)?;
            self.emit(OpCode::Jmp, vec![Operand::Label(end)]);
        }
        self.mark(default_label);
        if let Some(default) = default {
            self.compile_block(default)?;
        }
        self.exit_loop();
        self.mark(end);
        Ok(())
    }

    fn compile_return(&mut self, value: Option<&'ast Expr>) -> Result<(), ScriptError> {
        let builder = self.cur();
        let plain_frame =
            builder.try_depth == 0 && builder.finallys.is_empty() && !builder.is_sequence;

        // Calls in return position of a plain frame become tail calls;
        // enclosing try/finally blocks cancel the optimization, as does a
        // sequence frame (its frame is anchored by the sequence object).
        if plain_frame {
            if let Some(value) = value {
                return self.compile_tail_expr(value);
            }
        }

        match value {
            Some(value) => self.compile_expr(value)?,
            None => self.emit(OpCode::LdUndef, vec![]),
        }
        // The return value stays parked on the stack while the finally
        // bodies run
        self.unwind_finallys(0)?;
        self.emit(OpCode::Ret, vec![]);
        Ok(())
    }

    /// Compile an expression in tail position: direct calls emit TailCall,
    /// ternaries carry tail position into both branches, everything else
    /// returns normally. Every path through here terminates the function.
    fn compile_tail_expr(&mut self, value: &'ast Expr) -> Result<(), ScriptError> {
        match &value.kind {
            ExprKind::Call { callee, args } => {
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.compile_expr(callee)?;
                self.emit(OpCode::TailCall, vec![Operand::UInt(args.len() as u32)]);
                Ok(())
            }
            ExprKind::Ternary { condition, then_value, else_value } => {
                let else_label = self.new_label();
                self.compile_expr(condition)?;
                self.emit(OpCode::JmpFalse, vec![Operand::Label(else_label)]);
                self.compile_tail_expr(then_value)?;
                self.mark(else_label);
                self.compile_tail_expr(else_value)
            }
            _ => {
                self.compile_expr(value)?;
                self.emit(OpCode::Ret, vec![]);
                Ok(())
            }
        }
    }

    fn compile_try_catch(
        &mut self,
        try_body: &'ast [Stmt],
        catch_name: &'ast Option<String>,
        catch_body: &'ast Option<Vec<Stmt>>,
    ) -> Result<(), ScriptError> {
        let start = self.new_label();
        let end = self.new_label();
        let target = self.new_label();
        let done = self.new_label();

        self.cur().try_depth += 1;
        self.mark(start);
        self.compile_block(try_body)?;
        self.mark(end);
        self.emit(OpCode::Jmp, vec![Operand::Label(done)]);

        // Catch target; the VM pushes the error value before jumping here
        self.mark(target);
        self.begin_scope();
        match catch_name {
            Some(name) => {
                let var = self.declare_local(name, &SourceLocation::unknown())?;
                self.emit_bind_declaration(var);
            }
            None => self.emit(OpCode::Drop, vec![]),
        }
        if let Some(catch_body) = catch_body {
            self.compile_stmts(catch_body)?;
        }
        self.end_scope();
        self.mark(done);
        self.cur().try_depth -= 1;

        self.cur().handlers.push(PendingHandler {
            start_label: start,
            end_label: end,
            target_label: target,
            kind: HandlerKind::Catch,
        });
        Ok(())
    }

    fn compile_try_finally(
        &mut self,
        try_body: &'ast [Stmt],
        catch_name: &'ast Option<String>,
        catch_body: &'ast Option<Vec<Stmt>>,
        finally_body: &'ast [Stmt],
    ) -> Result<(), ScriptError> {
        let start = self.new_label();
        let end = self.new_label();
        let target = self.new_label();
        let done = self.new_label();

        self.cur().try_depth += 1;
        self.cur().finallys.push(finally_body);
        self.mark(start);
        if catch_body.is_some() || catch_name.is_some() {
            self.compile_try_catch(try_body, catch_name, catch_body)?;
        } else {
            self.compile_block(try_body)?;
        }
        self.mark(end);
        self.cur().finallys.pop();
        self.cur().try_depth -= 1;

        // Normal completion runs the finally inline
        self.compile_block(finally_body)?;
        self.emit(OpCode::Jmp, vec![Operand::Label(done)]);

        // Error path: stash the in-flight error, run the finally body, then
        // re-raise
        self.mark(target);
        let err_slot = self.hidden_local();
        self.emit(OpCode::StLocF, vec![Operand::Slot(err_slot)]);
        self.compile_block(finally_body)?;
        self.emit(OpCode::LdLocF, vec![Operand::Slot(err_slot)]);
        self.emit(OpCode::Throw, vec![]);
        self.mark(done);

        self.cur().handlers.push(PendingHandler {
            start_label: start,
            end_label: end,
            target_label: target,
            kind: HandlerKind::Finally,
        });
        Ok(())
    }

    fn compile_assign(&mut self, target: &'ast Expr, value: &'ast Expr) -> Result<(), ScriptError> {
        match &target.kind {
            ExprKind::Identifier(name) => {
                let var = self.resolve_var(name)?.ok_or_else(|| {
                    ScriptError::compile_error(
                        format!("unresolved identifier '{}'", name),
                        target.location.clone(),
                    )
                })?;

                // x = x + 1 / x = x - 1 on a plain local shrinks to IncF/DecF
                if let VarRef::Local(slot) = var {
                    if let Some(op) = increment_shape(name, value) {
                        self.emit(op, vec![Operand::Slot(slot)]);
                        return Ok(());
                    }
                }

                self.compile_expr(value)?;
                self.emit_store_var(var);
            }
            ExprKind::Field { object, name } => {
                self.compile_expr(value)?;
                self.compile_expr(object)?;
                let field = self.intern_string(name);
                self.emit(OpCode::StFld, vec![Operand::UInt(field)]);
            }
            ExprKind::Index { object, index } => {
                // A constant index into a plain array local stores directly
                if let Some((slot, element)) = self.static_array_slot(object, index)? {
                    self.compile_expr(value)?;
                    self.emit(
                        OpCode::StArrF,
                        vec![Operand::Slot(slot), Operand::UInt(element)],
                    );
                    return Ok(());
                }
                self.compile_expr(value)?;
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.emit(OpCode::StArr, vec![]);
            }
            _ => {
                return Err(ScriptError::compile_error(
                    "invalid assignment target".to_string(),
                    target.location.clone(),
                ))
            }
        }
        Ok(())
    }

    /// (local slot, element index) when `object[index]` is a constant index
    /// into a plain array local
    fn static_array_slot(
        &mut self,
        object: &'ast Expr,
        index: &'ast Expr,
    ) -> Result<Option<(u16, u32)>, ScriptError> {
        let name = match &object.kind {
            ExprKind::Identifier(name) => name,
            _ => return Ok(None),
        };
        let element = match &index.kind {
            ExprKind::Number(n)
                if n.fract() == 0.0 && *n >= 0.0 && *n <= u32::MAX as f64 =>
            {
                *n as u32
            }
            _ => return Ok(None),
        };
        match self.resolve_var(name)? {
            Some(VarRef::Local(slot)) => Ok(Some((slot, element))),
            _ => Ok(None),
        }
    }

    // --- expressions ---

    fn compile_expr(&mut self, expr: &'ast Expr) -> Result<(), ScriptError> {
        self.emit_position(&expr.location);
        match &expr.kind {
            ExprKind::Number(n) => {
                let index = self.intern_number(*n);
                self.emit(OpCode::LdNum, vec![Operand::UInt(index)]);
            }
            ExprKind::Str(s) => {
                let index = self.intern_string(s);
                self.emit(OpCode::LdStr, vec![Operand::UInt(index)]);
            }
            ExprKind::Bool(true) => self.emit(OpCode::LdTrue, vec![]),
            ExprKind::Bool(false) => self.emit(OpCode::LdFalse, vec![]),
            ExprKind::Undefined => self.emit(OpCode::LdUndef, vec![]),
            ExprKind::Null => self.emit(OpCode::LdNull, vec![]),

            ExprKind::Identifier(name) => match self.resolve_var(name)? {
                Some(var) => self.emit_load_var(var),
                None => {
                    // Reads of undeclared names fall back to the global
                    // object; writes to them are compile errors.
                    let field = self.intern_string(name);
                    self.emit(OpCode::LdGlobalFld, vec![Operand::UInt(field)]);
                }
            },
            ExprKind::Global => self.emit(OpCode::LdGlobal, vec![]),

            ExprKind::Binary { op, left, right } => self.compile_binary(*op, left, right)?,
            ExprKind::Unary { op, operand } => {
                self.compile_expr(operand)?;
                match op {
                    UnaryOp::Neg => self.emit(OpCode::Neg, vec![]),
                    UnaryOp::Not => self.emit(OpCode::Not, vec![]),
                    UnaryOp::BitNot => self.emit(OpCode::BitNot, vec![]),
                }
            }
            ExprKind::Ternary { condition, then_value, else_value } => {
                let else_label = self.new_label();
                let end_label = self.new_label();
                self.compile_expr(condition)?;
                self.emit(OpCode::JmpFalse, vec![Operand::Label(else_label)]);
                self.compile_expr(then_value)?;
                self.emit(OpCode::Jmp, vec![Operand::Label(end_label)]);
                self.mark(else_label);
                self.compile_expr(else_value)?;
                self.mark(end_label);
            }

            ExprKind::Index { object, index } => {
                if let Some((slot, element)) = self.static_array_slot(object, index)? {
                    self.emit(
                        OpCode::LdArrF,
                        vec![Operand::Slot(slot), Operand::UInt(element)],
                    );
                } else {
                    self.compile_expr(object)?;
                    self.compile_expr(index)?;
                    self.emit(OpCode::LdArr, vec![]);
                }
            }
            ExprKind::Field { object, name } => {
                self.compile_expr(object)?;
                let field = self.intern_string(name);
                self.emit(OpCode::LdFld, vec![Operand::UInt(field)]);
            }
            ExprKind::Slice { object, start, end, step } => {
                self.compile_expr(object)?;
                for bound in [start, end, step] {
                    match bound {
                        Some(bound) => self.compile_expr(bound)?,
                        None => self.emit(OpCode::LdUndef, vec![]),
                    }
                }
                self.emit(OpCode::Slice, vec![]);
            }

            ExprKind::Call { callee, args } => {
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.compile_expr(callee)?;
                self.emit(OpCode::Call, vec![Operand::UInt(args.len() as u32)]);
            }
            ExprKind::MethodCall { receiver, method, args } => {
                self.compile_expr(receiver)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                let name = self.intern_string(method);
                self.emit(
                    OpCode::InstanceCall,
                    vec![Operand::UInt(args.len() as u32), Operand::UInt(name)],
                );
            }

            ExprKind::Function(decl) => {
                let index = self.compile_function(decl)?;
                self.emit(OpCode::Closure, vec![Operand::UInt(index)]);
            }

            ExprKind::ObjectLiteral(fields) => {
                self.emit(OpCode::NewObject, vec![]);
                for (key, value) in fields {
                    self.emit(OpCode::Dup, vec![]);
                    self.compile_expr(value)?;
                    self.emit(OpCode::Swap, vec![]);
                    let field = self.intern_string(key);
                    self.emit(OpCode::StFld, vec![Operand::UInt(field)]);
                }
            }
            ExprKind::ArrayLiteral(elements) => {
                for element in elements {
                    self.compile_expr(element)?;
                }
                self.emit(OpCode::NewArray, vec![Operand::UInt(elements.len() as u32)]);
            }

            ExprKind::Yield(inner) => {
                if !self.cur().is_sequence {
                    return Err(ScriptError::compile_error(
                        "'yield' outside of a sequence".to_string(),
                        expr.location.clone(),
                    ));
                }
                self.compile_expr(inner)?;
                self.emit(OpCode::SeqSuspend, vec![]);
                self.emit(OpCode::SeqResume, vec![]);
            }
        }
        Ok(())
    }

    fn compile_binary(
        &mut self,
        op: BinaryOp,
        left: &'ast Expr,
        right: &'ast Expr,
    ) -> Result<(), ScriptError> {
        // Short-circuit operators peek so the left value survives as the
        // result when it decides the answer
        if op == BinaryOp::And || op == BinaryOp::Or {
            let end = self.new_label();
            self.compile_expr(left)?;
            let jump = if op == BinaryOp::And { OpCode::JmpFalseP } else { OpCode::JmpTrueP };
            self.emit(jump, vec![Operand::Label(end)]);
            self.emit(OpCode::Drop, vec![]);
            self.compile_expr(right)?;
            self.mark(end);
            return Ok(());
        }

        self.compile_expr(left)?;
        self.compile_expr(right)?;
        let opcode = match op {
            BinaryOp::Add => OpCode::Add,
            BinaryOp::Sub => OpCode::Sub,
            BinaryOp::Mul => OpCode::Mul,
            BinaryOp::Div => OpCode::Div,
            BinaryOp::Mod => OpCode::Mod,
            BinaryOp::Exp => OpCode::Exp,
            BinaryOp::Eq => OpCode::Eq,
            BinaryOp::Neq => OpCode::Neq,
            BinaryOp::Gt => OpCode::Gt,
            BinaryOp::Gte => OpCode::Gte,
            BinaryOp::Lt => OpCode::Lt,
            BinaryOp::Lte => OpCode::Lte,
            BinaryOp::BitAnd => OpCode::BitAnd,
            BinaryOp::BitOr => OpCode::BitOr,
            BinaryOp::BitXor => OpCode::BitXor,
            BinaryOp::BitLShift => OpCode::BitLShift,
            BinaryOp::BitRShift => OpCode::BitRShift,
            BinaryOp::In => OpCode::In,
            BinaryOp::NotIn => OpCode::NotIn,
            BinaryOp::And | BinaryOp::Or => unreachable!(),
        };
        self.emit(opcode, vec![]);
        Ok(())
    }

    // --- functions ---

    fn compile_function(&mut self, decl: &'ast FunctionDecl) -> Result<u32, ScriptError> {
        let id = self.parts.len();
        self.parts.push(None);
        self.push_function(
            id,
            decl.name.clone(),
            &decl.params,
            decl.var_arg,
            decl.is_sequence,
        );

        self.emit(OpCode::Enter, vec![Operand::UInt(0)]);
        if decl.var_arg {
            let fixed = decl.params.len().saturating_sub(1) as u32;
            self.emit(OpCode::VarArgs, vec![Operand::UInt(fixed)]);
        }

        // Parameters: captured ones are copied into frame cells up front
        let mut copies = Vec::new();
        for (at, param) in decl.params.iter().enumerate() {
            if self.cur().scopes.last().unwrap().map.contains_key(param) {
                return Err(ScriptError::compile_error(
                    format!("duplicate declaration of '{}'", param),
                    SourceLocation::unknown(),
                ));
            }
            let var = if self.captured.contains(&decl_key(param)) {
                let cell = self.cur().num_cells;
                self.cur().num_cells += 1;
                copies.push((at as u16, cell));
                VarRef::Cell(cell)
            } else {
                VarRef::Arg(at as u16)
            };
            self.record_debug_name(param, var);
            self.cur().scopes.last_mut().unwrap().map.insert(param.clone(), var);
        }
        for (arg, cell) in copies {
            self.emit(OpCode::NewCell, vec![Operand::Slot(cell)]);
            self.emit(OpCode::LdArgF, vec![Operand::Slot(arg)]);
            self.emit(OpCode::StUpValue, vec![Operand::Slot(cell)]);
        }

        let result = self.compile_stmts(&decl.body);
        self.emit(OpCode::LdUndef, vec![]);
        self.emit(OpCode::Ret, vec![]);
        self.finish_function();
        result?;
        Ok(id as u32)
    }

    // --- linking ---

    /// Resolve labels to byte offsets, strip pseudo-instructions into the
    /// debug tables, and assemble the image.
    fn link(&mut self) -> Result<Arc<ProgramImage>, ScriptError> {
        let parts: Vec<FunctionPart> = self
            .parts
            .drain(..)
            .map(|p| p.expect("unfinished function part"))
            .collect();

        // First pass: assign byte offsets to every instruction and label
        let mut label_offsets: AHashMap<u32, u32> = AHashMap::new();
        let mut entry_offsets = Vec::with_capacity(parts.len());
        let mut offset = 0u32;
        for part in &parts {
            entry_offsets.push(offset);
            for instruction in &part.instructions {
                if instruction.op == OpCode::Label {
                    if let Some(Operand::Label(id)) = instruction.operands.first() {
                        label_offsets.insert(*id, offset);
                    }
                }
                offset += instruction.encoded_len() as u32;
            }
        }

        // Second pass: encode and collect the debug tables
        let mut bytecode = Vec::with_capacity(offset as usize);
        let mut positions: Vec<PositionEntry> = Vec::new();
        let mut statement_marks: Vec<(u32, u32)> = Vec::new();
        let mut statement_ends: Vec<u32> = Vec::new();
        let mut scope_ranges: AHashMap<u32, (u32, u32)> = AHashMap::new();
        let mut functions = Vec::with_capacity(parts.len());
        let mut function_names = Vec::new();

        for (index, part) in parts.iter().enumerate() {
            let statement_base = statement_marks.len();
            for instruction in &part.instructions {
                let at = bytecode.len() as u32;
                match instruction.op {
                    OpCode::DbgPosition => {
                        let line = instruction.operands[0].as_uint();
                        let column = instruction.operands[1].as_uint();
                        match positions.last_mut() {
                            Some(last) if last.offset == at => {
                                last.line = line;
                                last.column = column;
                            }
                            _ => positions.push(PositionEntry { offset: at, line, column }),
                        }
                    }
                    OpCode::DbgStatement => {
                        // A statement's range ends where the next one begins
                        if statement_ends.len() < statement_marks.len() {
                            statement_ends.push(at);
                        }
                        statement_marks.push((at, instruction.operands[0].as_uint()));
                    }
                    OpCode::DbgScopeBegin => {
                        let id = instruction.operands[0].as_uint();
                        scope_ranges.entry(id).or_insert((at, at)).0 = at;
                    }
                    OpCode::DbgScopeEnd => {
                        let id = instruction.operands[0].as_uint();
                        scope_ranges.entry(id).or_insert((at, at)).1 = at;
                    }
                    _ => {}
                }
                instruction.encode_into(&mut bytecode, |id| {
                    label_offsets.get(&id).copied()
                })?;
            }
            // Close this function's trailing statement range
            if statement_marks.len() > statement_base
                && statement_ends.len() < statement_marks.len()
            {
                statement_ends.push(bytecode.len() as u32);
            }

            let mut info = part.info.clone();
            info.entry_offset = entry_offsets[index];
            info.handlers = part
                .handlers
                .iter()
                .map(|pending| {
                    Ok(HandlerRecord {
                        start: resolve_label(&label_offsets, pending.start_label)?,
                        end: resolve_label(&label_offsets, pending.end_label)?,
                        target: resolve_label(&label_offsets, pending.target_label)?,
                        kind: pending.kind,
                    })
                })
                .collect::<Result<Vec<_>, ScriptError>>()?;
            if let Some(name) = info.debug_name {
                function_names.push((index as u32, name));
            }
            functions.push(info);
        }

        let debug = if self.options.emit_debug_info {
            let statements = statement_marks
                .iter()
                .zip(&statement_ends)
                .map(|(&(start, line), &end)| StatementEntry { start, end, line })
                .collect();
            let mut scopes = Vec::new();
            for part in &parts {
                for meta in &part.scope_meta {
                    let (start, end) = scope_ranges.get(&meta.id).copied().unwrap_or((0, 0));
                    scopes.push(ScopeEntry {
                        id: meta.id,
                        parent: meta.parent,
                        start,
                        end,
                        names: meta.names.clone(),
                    });
                }
            }
            Some(DebugInfo {
                file_name: self.options.file_name.clone(),
                positions,
                statements,
                scopes,
                function_names,
            })
        } else {
            None
        };

        Ok(Arc::new(ProgramImage {
            numbers: std::mem::take(&mut self.numbers),
            strings: std::mem::take(&mut self.strings).into_iter().map(Arc::new).collect(),
            functions,
            bytecode,
            debug,
        }))
    }
}

fn resolve_label(offsets: &AHashMap<u32, u32>, label: u32) -> Result<u32, ScriptError> {
    offsets
        .get(&label)
        .copied()
        .ok_or_else(|| ScriptError::runtime_error(format!("unresolved label {}", label)))
}

/// IncF/DecF shape: `x = x + 1` or `x = x - 1`
fn increment_shape(name: &str, value: &Expr) -> Option<OpCode> {
    if let ExprKind::Binary { op, left, right } = &value.kind {
        if let (ExprKind::Identifier(id), ExprKind::Number(n)) = (&left.kind, &right.kind) {
            if id == name && *n == 1.0 {
                return match op {
                    BinaryOp::Add => Some(OpCode::IncF),
                    BinaryOp::Sub => Some(OpCode::DecF),
                    _ => None,
                };
            }
        }
    }
    None
}

/// Layout for a dense switch: (base, slot count, case index per slot).
/// Dense means every case value is an integral number in i32 range and the
/// table would not be grossly sparse.
fn dense_case_layout(
    cases: &[crate::ast::SwitchCase],
) -> Option<(i32, u32, Vec<Option<usize>>)> {
    let mut values: Vec<(i64, usize)> = Vec::new();
    for (index, case) in cases.iter().enumerate() {
        for value in &case.values {
            match &value.kind {
                ExprKind::Number(n)
                    if n.fract() == 0.0 && *n >= i32::MIN as f64 && *n <= i32::MAX as f64 =>
                {
                    values.push((*n as i64, index));
                }
                _ => return None,
            }
        }
    }
    if values.is_empty() {
        return None;
    }
    let base = values.iter().map(|(v, _)| *v).min().unwrap();
    let max = values.iter().map(|(v, _)| *v).max().unwrap();
    let count = (max - base + 1) as u64;
    if count > 512 || count > 4 * values.len() as u64 {
        return None;
    }
    let mut slots: Vec<Option<usize>> = vec![None; count as usize];
    for (value, case) in values {
        let slot = (value - base) as usize;
        // The first matching case wins for duplicate values
        if slots[slot].is_none() {
            slots[slot] = Some(case);
        }
    }
    Some((base as i32, count as u32, slots))
}
