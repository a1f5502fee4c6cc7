// File: src/vm.rs
//
// Virtual machine for executing Rill bytecode.
// Single-threaded stack machine: fetch the opcode at ip, advance, dispatch.
// Manages pooled call frames, closures with shared upvalue cells, handler
// stack exception unwinding, the global object, and the embedder API.

use crate::bytecode::OpCode;
use crate::debug::{Debugger, StateNotification, PROTOCOL_VERSION};
use crate::errors::ScriptError;
use crate::pool::{ArrayPool, PoolHandle};
use crate::program::{CaptureSource, HandlerRecord, ProgramImage};
use crate::scheduler::Scheduler;
use crate::sequence::{self, SequenceRef, SequenceState};
use crate::value::{
    object_lookup, object_meta_method, to_int32, ArrayRef, Closure, FunctionValue, ObjectData,
    ObjectRef, UpvalueCell, Value,
};
use std::sync::{Arc, Mutex};

/// Default limit on call stack depth; exceeding it raises a RuntimeError
/// through the normal unwinding path
const DEFAULT_MAX_CALL_DEPTH: usize = 1000;

/// A call frame. Locals, arguments, and the evaluation stack are rented from
/// the VM's pool and return automatically when the frame drops, including
/// during unwinding. A sequence's frame lives off the call stack, anchored
/// by the sequence object, until the sequence completes.
pub(crate) struct Frame {
    pub program: Arc<ProgramImage>,
    pub func: usize,
    pub ip: usize,
    /// Offset of the instruction currently executing; what handler ranges
    /// and debug positions are matched against
    pub last_ip: usize,
    pub locals: PoolHandle,
    pub args: PoolHandle,
    /// Trailing arguments awaiting the VarArgs instruction
    pub overflow: Vec<Value>,
    pub eval: PoolHandle,
    /// Shared cells: this frame's own cells first, received upvalues after
    pub upvalues: Vec<UpvalueCell>,
    /// When set, Ret and unwinding return control to the Rust caller
    /// instead of the script caller
    pub barrier: bool,
    /// Value pushed by the next SeqResume
    pub resume_value: Option<Value>,
}

impl Frame {
    fn is_sequence(&self) -> bool {
        self.program.functions[self.func].is_sequence
    }
}

/// What one instruction did to the control flow
enum StepOutcome {
    Continue,
    /// A barrier frame returned
    Returned(Value),
    /// A sequence frame suspended; the frame comes off the call stack
    Suspended(Value, Frame),
}

/// Result of running until the innermost barrier frame finishes
pub(crate) enum RunOutcome {
    Returned(Value),
    Suspended(Value, Frame),
}

/// The virtual machine. One instance per host thread; instances share no
/// mutable state.
pub struct VM {
    globals: ObjectRef,
    pool: ArrayPool,
    frames: Vec<Frame>,
    max_call_depth: usize,
    debugger: Option<Arc<dyn Debugger>>,
    /// Cooperative async task scheduler owned by this VM
    pub scheduler: Scheduler,
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

impl VM {
    pub fn new() -> Self {
        let mut vm = Self {
            globals: Arc::new(Mutex::new(ObjectData::new())),
            pool: ArrayPool::default(),
            frames: Vec::new(),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            debugger: None,
            scheduler: Scheduler::new(),
        };
        vm.register_intrinsics();
        vm
    }

    fn register_intrinsics(&mut self) {
        self.register_native("error", |_vm, args| {
            let payload = args.first().cloned().unwrap_or(Value::Undefined);
            Err(ScriptError::runtime_error(format!("{}", payload)).with_payload(payload))
        });
        self.register_native("start", |vm, args| {
            let task = args.first().cloned().ok_or_else(|| {
                ScriptError::type_error("start requires a task argument".to_string())
            })?;
            vm.start_task(task)?;
            Ok(Value::Undefined)
        });
        self.register_native("run", |vm, _args| vm.run_scheduler_once().map(Value::Bool));
        self.register_native("runToCompletion", |vm, _args| {
            vm.run_to_completion()?;
            Ok(Value::Undefined)
        });
    }

    // --- embedder API ---

    pub fn globals(&self) -> ObjectRef {
        self.globals.clone()
    }

    pub fn get_global(&self, name: &str) -> Result<Value, ScriptError> {
        object_lookup(&self.globals, &Value::str_ref(name))
    }

    pub fn set_global(&mut self, name: &str, value: Value) -> Result<(), ScriptError> {
        self.globals.lock().unwrap().set(Value::str_ref(name), value)
    }

    pub fn register_native<F>(&mut self, name: &str, func: F)
    where
        F: Fn(&mut VM, &[Value]) -> Result<Value, ScriptError> + Send + Sync + 'static,
    {
        let value = Value::native(name, Arc::new(func));
        self.globals
            .lock()
            .unwrap()
            .set(Value::str_ref(name), value)
            .expect("fresh global object accepts keys");
    }

    pub fn set_max_call_depth(&mut self, depth: usize) {
        self.max_call_depth = depth.max(1);
    }

    pub fn pool_stats(&self) -> crate::pool::PoolStats {
        self.pool.stats()
    }

    pub fn attach_debugger(&mut self, debugger: Arc<dyn Debugger>) {
        debugger.notify(&StateNotification::InitialState { version: PROTOCOL_VERSION });
        self.debugger = Some(debugger);
    }

    /// Execute a program image: run its entry function to completion
    pub fn execute(&mut self, program: Arc<ProgramImage>) -> Result<Value, ScriptError> {
        if program.functions.is_empty() {
            return Err(ScriptError::runtime_error("program image has no functions".to_string()));
        }
        let closure = Closure { program, function: 0, upvalues: Vec::new() };
        self.call_closure(&closure, Vec::new())
    }

    /// Invoke any callable value with an argument list
    pub fn call_value(&mut self, callee: Value, args: Vec<Value>) -> Result<Value, ScriptError> {
        match &callee {
            Value::Function(func) => match func.as_ref() {
                FunctionValue::Native { func, .. } => {
                    let func = func.clone();
                    func(self, &args)
                }
                FunctionValue::Closure(closure) => {
                    if closure.program.functions[closure.function].is_sequence {
                        Ok(sequence::make_sequence_value(closure.clone(), args))
                    } else {
                        let closure = closure.clone();
                        self.call_closure(&closure, args)
                    }
                }
            },
            Value::Object(obj) => {
                // Objects with a __call meta-method are callable; the object
                // itself is passed as the first argument
                match object_meta_method(obj, "__call") {
                    Some(method) => {
                        let mut full = Vec::with_capacity(args.len() + 1);
                        full.push(callee.clone());
                        full.extend(args);
                        self.call_value(method, full)
                    }
                    None => Err(ScriptError::type_error(
                        "object is not callable (no __call meta-method)".to_string(),
                    )),
                }
            }
            other => Err(ScriptError::type_error(format!(
                "value of type '{}' is not callable",
                other.type_name()
            ))),
        }
    }

    /// Dispatch a method on a receiver the way InstanceCall does: the
    /// receiver is evaluated once and passed as the first argument.
    pub fn call_method(
        &mut self,
        receiver: Value,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value, ScriptError> {
        match &receiver {
            Value::Object(obj) => {
                let method = object_lookup(obj, &Value::str_ref(name))?;
                if method.is_callable() {
                    let mut full = Vec::with_capacity(args.len() + 1);
                    full.push(receiver.clone());
                    full.extend(args);
                    return self.call_value(method, full);
                }
                if !matches!(method, Value::Undefined) {
                    return Err(ScriptError::type_error(format!(
                        "field '{}' is not callable",
                        name
                    )));
                }
                self.object_builtin(obj, name, &args)
            }
            Value::Array(arr) => self.array_builtin(arr, name, &args),
            Value::Str(s) => match name {
                "length" => Ok(Value::Number(s.chars().count() as f64)),
                _ => Err(ScriptError::type_error(format!("string has no method '{}'", name))),
            },
            other => Err(ScriptError::type_error(format!(
                "cannot call method '{}' on value of type '{}'",
                name,
                other.type_name()
            ))),
        }
    }

    fn object_builtin(
        &mut self,
        obj: &ObjectRef,
        name: &str,
        args: &[Value],
    ) -> Result<Value, ScriptError> {
        match name {
            "setPrototype" => {
                let prototype = match args.first() {
                    Some(Value::Object(proto)) => Some(proto.clone()),
                    Some(Value::Null) | None => None,
                    Some(other) => {
                        return Err(ScriptError::type_error(format!(
                            "prototype must be an object or null, not '{}'",
                            other.type_name()
                        )))
                    }
                };
                obj.lock().unwrap().prototype = prototype;
                Ok(Value::Undefined)
            }
            "getPrototype" => Ok(match &obj.lock().unwrap().prototype {
                Some(proto) => Value::Object(proto.clone()),
                None => Value::Null,
            }),
            "lock" => {
                obj.lock().unwrap().locked = true;
                Ok(Value::Undefined)
            }
            "length" => Ok(Value::Number(obj.lock().unwrap().len() as f64)),
            _ => Err(ScriptError::type_error(format!("object has no method '{}'", name))),
        }
    }

    fn array_builtin(
        &mut self,
        arr: &ArrayRef,
        name: &str,
        args: &[Value],
    ) -> Result<Value, ScriptError> {
        match name {
            "add" => {
                let value = args.first().cloned().unwrap_or(Value::Undefined);
                arr.lock().unwrap().elements.push(value);
                Ok(Value::Undefined)
            }
            "length" => Ok(Value::Number(arr.lock().unwrap().elements.len() as f64)),
            "getEnumerator" => Ok(make_array_enumerator(arr.clone())),
            _ => Err(ScriptError::type_error(format!("array has no method '{}'", name))),
        }
    }

    // --- frame management ---

    fn call_closure(&mut self, closure: &Closure, args: Vec<Value>) -> Result<Value, ScriptError> {
        self.push_frame(closure, args, true)?;
        match self.run_to_barrier()? {
            RunOutcome::Returned(value) => Ok(value),
            RunOutcome::Suspended(..) => Err(ScriptError::runtime_error(
                "function suspended outside of a sequence".to_string(),
            )),
        }
    }

    pub(crate) fn push_frame(
        &mut self,
        closure: &Closure,
        mut args: Vec<Value>,
        barrier: bool,
    ) -> Result<(), ScriptError> {
        if self.frames.len() >= self.max_call_depth {
            return Err(ScriptError::runtime_error("stack overflow".to_string()));
        }
        let info = &closure.program.functions[closure.function];
        if closure.upvalues.len() != info.num_upvalues as usize {
            return Err(ScriptError::runtime_error(format!(
                "closure upvalue count mismatch for {}",
                closure.program.function_name(closure.function)
            )));
        }

        let num_args = info.num_args as usize;
        let bind_count = if info.has_var_args { num_args.saturating_sub(1) } else { num_args };
        let overflow = if info.has_var_args && args.len() > bind_count {
            args.split_off(bind_count)
        } else {
            Vec::new()
        };

        let mut arg_buf = self.pool.rent(num_args);
        for (slot, value) in args.into_iter().take(bind_count).enumerate() {
            arg_buf[slot] = value;
        }

        // Upvalue array: fresh frame-owned cells first, received after
        let total = info.num_cells as usize + info.num_upvalues as usize;
        let mut upvalues = Vec::with_capacity(total);
        for _ in 0..info.num_cells {
            upvalues.push(Arc::new(Mutex::new(Value::Undefined)));
        }
        upvalues.extend(closure.upvalues.iter().cloned());

        self.frames.push(Frame {
            program: closure.program.clone(),
            func: closure.function,
            ip: info.entry_offset as usize,
            last_ip: info.entry_offset as usize,
            locals: self.pool.rent(info.num_locals as usize),
            args: arg_buf,
            overflow,
            eval: self.pool.rent(0),
            upvalues,
            barrier,
            resume_value: None,
        });
        Ok(())
    }

    /// Resume a sequence with `send` as the value of its pending yield.
    /// Ok(Some(v)) means it yielded v, Ok(None) means it completed.
    pub(crate) fn resume_sequence(
        &mut self,
        seq: &SequenceRef,
        send: Value,
    ) -> Result<Option<Value>, ScriptError> {
        enum Setup {
            Fresh(Closure, Vec<Value>),
            Saved(Box<Frame>),
        }

        let setup = {
            let mut guard = seq.lock().unwrap();
            match guard.state {
                SequenceState::Running => {
                    return Err(ScriptError::runtime_error(
                        "sequence is already running".to_string(),
                    ))
                }
                SequenceState::Completed | SequenceState::Errored => return Ok(None),
                SequenceState::Initial => {
                    guard.state = SequenceState::Running;
                    let args = std::mem::take(&mut guard.args);
                    Setup::Fresh(guard.closure.clone(), args)
                }
                SequenceState::Suspended => {
                    guard.state = SequenceState::Running;
                    let mut frame = guard.frame.take().expect("suspended sequence keeps a frame");
                    frame.resume_value = Some(send);
                    Setup::Saved(Box::new(frame))
                }
            }
        };

        match setup {
            Setup::Saved(frame) => {
                if self.frames.len() >= self.max_call_depth {
                    seq.lock().unwrap().state = SequenceState::Errored;
                    return Err(ScriptError::runtime_error("stack overflow".to_string()));
                }
                self.frames.push(*frame);
            }
            Setup::Fresh(closure, args) => {
                if let Err(e) = self.push_frame(&closure, args, true) {
                    seq.lock().unwrap().state = SequenceState::Errored;
                    return Err(e);
                }
            }
        }

        match self.run_to_barrier() {
            Ok(RunOutcome::Returned(_)) => {
                let mut guard = seq.lock().unwrap();
                guard.state = SequenceState::Completed;
                guard.last_yielded = Value::Undefined;
                Ok(None)
            }
            Ok(RunOutcome::Suspended(value, frame)) => {
                let mut guard = seq.lock().unwrap();
                guard.frame = Some(frame);
                guard.state = SequenceState::Suspended;
                guard.last_yielded = value.clone();
                Ok(Some(value))
            }
            Err(e) => {
                seq.lock().unwrap().state = SequenceState::Errored;
                Err(e)
            }
        }
    }

    // --- the dispatch loop ---

    fn run_to_barrier(&mut self) -> Result<RunOutcome, ScriptError> {
        loop {
            match self.step() {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Returned(value)) => return Ok(RunOutcome::Returned(value)),
                Ok(StepOutcome::Suspended(value, frame)) => {
                    return Ok(RunOutcome::Suspended(value, frame))
                }
                Err(error) => self.unwind(error)?,
            }
        }
    }

    /// Walk the handler stack for an in-flight error: jump to the innermost
    /// covering handler, or pop the frame and keep walking. Errors that
    /// escape a barrier frame surface to the Rust caller.
    fn unwind(&mut self, mut error: ScriptError) -> Result<(), ScriptError> {
        loop {
            let Some(frame) = self.frames.last_mut() else {
                return Err(error);
            };
            if !error.location.is_known() {
                if let Some(location) = frame.program.location_for(frame.last_ip as u32) {
                    error = error.with_location(location);
                }
            }

            let offset = frame.last_ip as u32;
            let target = innermost_handler(&frame.program.functions[frame.func].handlers, offset)
                .map(|handler| handler.target);
            if let Some(target) = target {
                frame.eval.push(error.catch_value());
                frame.ip = target as usize;
                return Ok(());
            }

            let popped = self.frames.pop().expect("frame checked above");
            if popped.barrier {
                return Err(error);
            }
        }
    }

    fn step(&mut self) -> Result<StepOutcome, ScriptError> {
        let (byte, start) = {
            let frame = self
                .frames
                .last_mut()
                .ok_or_else(|| ScriptError::runtime_error("no active frame".to_string()))?;
            if frame.ip >= frame.program.bytecode.len() {
                return Err(ScriptError::runtime_error(
                    "instruction pointer out of range".to_string(),
                ));
            }
            let start = frame.ip;
            frame.last_ip = start;
            let byte = frame.program.bytecode[start];
            frame.ip += 1;
            (byte, start)
        };
        let op = OpCode::from_byte(byte).ok_or_else(|| {
            ScriptError::runtime_error(format!("invalid opcode {:#04x} at offset {}", byte, start))
        })?;

        match op {
            // === Stack shuffling ===
            OpCode::Dup => {
                let top = self.peek()?;
                self.push(top);
            }
            OpCode::Dup2 => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(a.clone());
                self.push(b.clone());
                self.push(a);
                self.push(b);
            }
            OpCode::Drop => {
                self.pop()?;
            }
            OpCode::Swap => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b);
                self.push(a);
            }
            OpCode::Swap1For2 => {
                let c = self.pop()?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(c);
                self.push(a);
                self.push(b);
            }

            // === Constants ===
            OpCode::LdUndef => self.push(Value::Undefined),
            OpCode::LdNull => self.push(Value::Null),
            OpCode::LdTrue => self.push(Value::Bool(true)),
            OpCode::LdFalse => self.push(Value::Bool(false)),
            OpCode::LdNum => {
                let index = self.fetch_u32()? as usize;
                let number = *self.frame().program.numbers.get(index).ok_or_else(|| {
                    ScriptError::runtime_error(format!("number constant {} out of range", index))
                })?;
                self.push(Value::Number(number));
            }
            OpCode::LdStr => {
                let index = self.fetch_u32()? as usize;
                let string = self
                    .frame()
                    .program
                    .strings
                    .get(index)
                    .cloned()
                    .ok_or_else(|| {
                        ScriptError::runtime_error(format!(
                            "string constant {} out of range",
                            index
                        ))
                    })?;
                self.push(Value::Str(string));
            }

            // === Globals ===
            OpCode::LdGlobal => {
                let globals = self.globals.clone();
                self.push(Value::Object(globals));
            }
            OpCode::LdGlobalFld => {
                let index = self.fetch_u32()?;
                let name = self.image_string(index);
                let value = object_lookup(&self.globals, &Value::Str(name))?;
                self.push(value);
            }

            // === Locals and arguments ===
            OpCode::LdLocF => {
                let slot = self.fetch_u16()? as usize;
                let value = self.frame().locals[slot].clone();
                self.push(value);
            }
            OpCode::StLocF => {
                let slot = self.fetch_u16()? as usize;
                let value = self.pop()?;
                self.frame_mut().locals[slot] = value;
            }
            OpCode::LdArgF => {
                let slot = self.fetch_u16()? as usize;
                let value = self.frame().args.get(slot).cloned().unwrap_or(Value::Undefined);
                self.push(value);
            }
            OpCode::StArgF => {
                let slot = self.fetch_u16()? as usize;
                let value = self.pop()?;
                if let Some(cell) = self.frame_mut().args.get_mut(slot) {
                    *cell = value;
                }
            }

            // === Fields and indexing ===
            OpCode::LdFld => {
                let index = self.fetch_u32()?;
                let name = self.image_string(index);
                let object = self.pop()?;
                let value = self.load_field(&object, &name)?;
                self.push(value);
            }
            OpCode::StFld => {
                let index = self.fetch_u32()?;
                let name = self.image_string(index);
                let object = self.pop()?;
                let value = self.pop()?;
                match &object {
                    Value::Object(obj) => {
                        obj.lock().unwrap().set(Value::Str(name), value)?;
                    }
                    other => {
                        return Err(ScriptError::type_error(format!(
                            "cannot set a field on value of type '{}'",
                            other.type_name()
                        )))
                    }
                }
            }
            OpCode::LdArr => {
                let index = self.pop()?;
                let container = self.pop()?;
                let value = self.load_index(&container, &index)?;
                self.push(value);
            }
            OpCode::StArr => {
                let index = self.pop()?;
                let container = self.pop()?;
                let value = self.pop()?;
                self.store_index(&container, index, value)?;
            }
            OpCode::LdArrF => {
                let slot = self.fetch_u16()? as usize;
                let element = self.fetch_u32()?;
                let local = self.frame().locals[slot].clone();
                match local {
                    Value::Array(arr) => {
                        let value = arr.lock().unwrap().get(element as f64);
                        self.push(value);
                    }
                    other => {
                        return Err(ScriptError::type_error(format!(
                            "expected an array local, found '{}'",
                            other.type_name()
                        )))
                    }
                }
            }
            OpCode::StArrF => {
                let slot = self.fetch_u16()? as usize;
                let element = self.fetch_u32()?;
                let value = self.pop()?;
                let local = self.frame().locals[slot].clone();
                match local {
                    Value::Array(arr) => arr.lock().unwrap().set(element as f64, value)?,
                    other => {
                        return Err(ScriptError::type_error(format!(
                            "expected an array local, found '{}'",
                            other.type_name()
                        )))
                    }
                }
            }

            // === Upvalues ===
            OpCode::LdUp => {
                let snapshot: Vec<Value> = self
                    .frame()
                    .upvalues
                    .iter()
                    .map(|cell| cell.lock().unwrap().clone())
                    .collect();
                self.push(Value::array(snapshot));
            }
            OpCode::LdUpValue => {
                let slot = self.fetch_u16()? as usize;
                let cell = self.upvalue_cell(slot)?;
                let value = cell.lock().unwrap().clone();
                self.push(value);
            }
            OpCode::StUpValue => {
                let slot = self.fetch_u16()? as usize;
                let value = self.pop()?;
                let cell = self.upvalue_cell(slot)?;
                *cell.lock().unwrap() = value;
            }
            OpCode::NewCell => {
                let slot = self.fetch_u16()? as usize;
                let frame = self.frame_mut();
                if slot >= frame.upvalues.len() {
                    return Err(ScriptError::runtime_error(format!(
                        "cell slot {} out of range",
                        slot
                    )));
                }
                frame.upvalues[slot] = Arc::new(Mutex::new(Value::Undefined));
            }

            // === Sequences ===
            OpCode::SeqSuspend => {
                let value = self.pop()?;
                {
                    let frame = self.frame();
                    if !(frame.barrier && frame.is_sequence()) {
                        return Err(ScriptError::runtime_error(
                            "yield outside of a sequence frame".to_string(),
                        ));
                    }
                }
                let frame = self.frames.pop().expect("frame checked above");
                return Ok(StepOutcome::Suspended(value, frame));
            }
            OpCode::SeqResume => {
                let value = self.frame_mut().resume_value.take().unwrap_or(Value::Undefined);
                self.push(value);
            }

            // === Constructors ===
            OpCode::NewObject => {
                self.push(Value::object(ObjectData::new()));
            }
            OpCode::NewArray => {
                let count = self.fetch_u32()? as usize;
                let mut elements = Vec::with_capacity(count);
                for _ in 0..count {
                    elements.push(self.pop()?);
                }
                elements.reverse();
                self.push(Value::array(elements));
            }
            OpCode::Slice => {
                let step = self.pop()?;
                let end = self.pop()?;
                let start = self.pop()?;
                let container = self.pop()?;
                let sliced = slice_array(&container, &start, &end, &step)?;
                self.push(sliced);
            }

            // === Arithmetic ===
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod | OpCode::Exp => {
                self.arithmetic(op)?;
            }
            OpCode::Neg => {
                let operand = self.pop()?;
                match &operand {
                    Value::Number(n) => self.push(Value::Number(-n)),
                    Value::Object(obj) => match object_meta_method(obj, "__neg") {
                        Some(method) => {
                            let result = self.call_value(method, vec![operand.clone()])?;
                            self.push(result);
                        }
                        None => {
                            return Err(ScriptError::type_error(format!(
                                "cannot negate value of type '{}'",
                                operand.type_name()
                            )))
                        }
                    },
                    other => {
                        return Err(ScriptError::type_error(format!(
                            "cannot negate value of type '{}'",
                            other.type_name()
                        )))
                    }
                }
            }

            // === Comparison ===
            OpCode::Eq | OpCode::Neq => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let equal = self.values_equal(&lhs, &rhs)?;
                self.push(Value::Bool(if op == OpCode::Eq { equal } else { !equal }));
            }
            OpCode::Gt | OpCode::Gte | OpCode::Lt | OpCode::Lte => {
                self.ordering(op)?;
            }

            // === Logical / bitwise ===
            OpCode::Not => {
                let operand = self.pop()?;
                self.push(Value::Bool(!operand.is_truthy()));
            }
            OpCode::BitLShift
            | OpCode::BitRShift
            | OpCode::BitAnd
            | OpCode::BitOr
            | OpCode::BitXor => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let (a, b) = match (lhs.as_number(), rhs.as_number()) {
                    (Some(a), Some(b)) => (to_int32(a), to_int32(b)),
                    _ => {
                        return Err(ScriptError::type_error(format!(
                            "bitwise operation requires numbers, found '{}' and '{}'",
                            lhs.type_name(),
                            rhs.type_name()
                        )))
                    }
                };
                let result = match op {
                    OpCode::BitLShift => a.wrapping_shl(b as u32 & 31),
                    OpCode::BitRShift => a.wrapping_shr(b as u32 & 31),
                    OpCode::BitAnd => a & b,
                    OpCode::BitOr => a | b,
                    OpCode::BitXor => a ^ b,
                    _ => unreachable!(),
                };
                self.push(Value::Number(result as f64));
            }
            OpCode::BitNot => {
                let operand = self.pop()?;
                match operand.as_number() {
                    Some(n) => self.push(Value::Number(!to_int32(n) as f64)),
                    None => {
                        return Err(ScriptError::type_error(format!(
                            "bitwise operation requires a number, found '{}'",
                            operand.type_name()
                        )))
                    }
                }
            }

            // === Membership ===
            OpCode::In | OpCode::NotIn => {
                let container = self.pop()?;
                let key = self.pop()?;
                let found = self.contains(&container, &key)?;
                self.push(Value::Bool(if op == OpCode::In { found } else { !found }));
            }

            // === Control flow ===
            OpCode::Jmp => {
                let target = self.fetch_u32()? as usize;
                self.frame_mut().ip = target;
            }
            OpCode::JmpTrue => {
                let target = self.fetch_u32()? as usize;
                if self.pop()?.is_truthy() {
                    self.frame_mut().ip = target;
                }
            }
            OpCode::JmpFalse => {
                let target = self.fetch_u32()? as usize;
                if !self.pop()?.is_truthy() {
                    self.frame_mut().ip = target;
                }
            }
            OpCode::JmpTrueP => {
                let target = self.fetch_u32()? as usize;
                if self.peek()?.is_truthy() {
                    self.frame_mut().ip = target;
                }
            }
            OpCode::JmpFalseP => {
                let target = self.fetch_u32()? as usize;
                if !self.peek()?.is_truthy() {
                    self.frame_mut().ip = target;
                }
            }
            OpCode::JmpTable => {
                let base = self.fetch_u32()? as i32 as i64;
                let count = self.fetch_u32()? as i64;
                let default = self.fetch_u32()? as usize;
                let table_at = self.frame().ip;
                self.frame_mut().ip += 4 * count as usize;

                let subject = self.pop()?;
                let slot = match subject.as_number() {
                    Some(n) if n.fract() == 0.0 && n >= base as f64 && n < (base + count) as f64 => {
                        Some((n as i64 - base) as usize)
                    }
                    _ => None,
                };
                let target = match slot {
                    Some(slot) => {
                        let at = table_at + 4 * slot;
                        let frame = self.frame();
                        let bytes = &frame.program.bytecode[at..at + 4];
                        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
                    }
                    None => default,
                };
                self.frame_mut().ip = target;
            }

            // === Calls and frames ===
            OpCode::Closure => {
                let index = self.fetch_u32()? as usize;
                let closure = self.build_closure(index)?;
                self.push(Value::Function(Arc::new(FunctionValue::Closure(closure))));
            }
            OpCode::Call => {
                let argc = self.fetch_u32()? as usize;
                let callee = self.pop()?;
                let args = self.pop_args(argc)?;
                self.dispatch_call(callee, args)?;
            }
            OpCode::TailCall => {
                let argc = self.fetch_u32()? as usize;
                let callee = self.pop()?;
                let args = self.pop_args(argc)?;
                return self.dispatch_tail_call(callee, args);
            }
            OpCode::InstanceCall => {
                let argc = self.fetch_u32()? as usize;
                let name_index = self.fetch_u32()?;
                let name = self.image_string(name_index);
                let args = self.pop_args(argc)?;
                let receiver = self.pop()?;
                let result = self.call_method(receiver, &name, args)?;
                self.push(result);
            }
            OpCode::Enter => {
                let count = self.fetch_u32()? as usize;
                let frame = self.frame_mut();
                if frame.locals.len() < count {
                    frame.locals.resize(count, Value::Undefined);
                }
            }
            OpCode::Ret => {
                let value = self.pop()?;
                let frame = self.frames.pop().expect("Ret requires a frame");
                if frame.barrier {
                    return Ok(StepOutcome::Returned(value));
                }
                self.push(value);
            }
            OpCode::VarArgs => {
                let fixed = self.fetch_u32()? as usize;
                let frame = self.frame_mut();
                let rest = std::mem::take(&mut frame.overflow);
                let packed = Value::array(rest);
                if let Some(slot) = frame.args.get_mut(fixed) {
                    *slot = packed;
                }
            }
            OpCode::Throw => {
                let value = self.pop()?;
                return Err(ScriptError::runtime_error(format!("{}", value)).with_payload(value));
            }

            // === In-place increment ===
            OpCode::IncF | OpCode::DecF => {
                let slot = self.fetch_u16()? as usize;
                let delta = if op == OpCode::IncF { 1.0 } else { -1.0 };
                let frame = self.frame_mut();
                let current = match &frame.locals[slot] {
                    Value::Number(n) => *n,
                    other => {
                        return Err(ScriptError::type_error(format!(
                            "cannot increment value of type '{}'",
                            other.type_name()
                        )))
                    }
                };
                frame.locals[slot] = Value::Number(current + delta);
            }

            // === Debugging ===
            OpCode::Breakpoint => {
                if let Some(debugger) = self.debugger.clone() {
                    debugger.notify(&StateNotification::State {
                        running: false,
                        cause: Some("breakpoint".to_string()),
                    });
                }
            }
            OpCode::DebugCheckpoint => {
                if let Some(debugger) = self.debugger.clone() {
                    if debugger.wants_break(start as u32) {
                        debugger.notify(&StateNotification::State {
                            running: false,
                            cause: Some("step".to_string()),
                        });
                    }
                }
            }

            // Pseudo-ops never survive linking
            OpCode::Label
            | OpCode::DbgPosition
            | OpCode::DbgStatement
            | OpCode::DbgScopeBegin
            | OpCode::DbgScopeEnd => {
                return Err(ScriptError::runtime_error(format!(
                    "pseudo-op {} in linked bytecode",
                    op.mnemonic()
                )));
            }
        }
        Ok(StepOutcome::Continue)
    }

    // --- dispatch helpers ---

    fn dispatch_call(&mut self, callee: Value, args: Vec<Value>) -> Result<(), ScriptError> {
        if let Value::Function(func) = &callee {
            if let FunctionValue::Closure(closure) = func.as_ref() {
                if !closure.program.functions[closure.function].is_sequence {
                    let closure = closure.clone();
                    return self.push_frame(&closure, args, false);
                }
            }
        }
        // Natives, sequences, and __call objects complete without a frame
        let result = self.call_value(callee, args)?;
        self.push(result);
        Ok(())
    }

    fn dispatch_tail_call(
        &mut self,
        callee: Value,
        args: Vec<Value>,
    ) -> Result<StepOutcome, ScriptError> {
        if let Value::Function(func) = &callee {
            if let FunctionValue::Closure(closure) = func.as_ref() {
                if !closure.program.functions[closure.function].is_sequence {
                    let closure = closure.clone();
                    let barrier = self.frame().barrier;
                    // The caller's frame is replaced, not stacked on
                    drop(self.frames.pop());
                    self.push_frame(&closure, args, barrier)?;
                    return Ok(StepOutcome::Continue);
                }
            }
        }
        let result = self.call_value(callee, args)?;
        let frame = self.frames.pop().expect("tail call requires a frame");
        if frame.barrier {
            return Ok(StepOutcome::Returned(result));
        }
        self.push(result);
        Ok(StepOutcome::Continue)
    }

    fn build_closure(&mut self, index: usize) -> Result<Closure, ScriptError> {
        let frame = self.frame();
        let program = frame.program.clone();
        let info = program.functions.get(index).ok_or_else(|| {
            ScriptError::runtime_error(format!("function index {} out of range", index))
        })?;
        let creator = &program.functions[frame.func];

        let mut upvalues = Vec::with_capacity(info.captures.len());
        for capture in &info.captures {
            let slot = match capture {
                CaptureSource::LocalCell(cell) => *cell as usize,
                CaptureSource::Upvalue(received) => {
                    creator.num_cells as usize + *received as usize
                }
            };
            let cell = frame.upvalues.get(slot).ok_or_else(|| {
                ScriptError::runtime_error(format!("capture slot {} out of range", slot))
            })?;
            upvalues.push(cell.clone());
        }
        Ok(Closure { program, function: index, upvalues })
    }

    // --- operator helpers ---

    fn arithmetic(&mut self, op: OpCode) -> Result<(), ScriptError> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;

        if let (Value::Number(a), Value::Number(b)) = (&lhs, &rhs) {
            let result = match op {
                OpCode::Add => a + b,
                OpCode::Sub => a - b,
                OpCode::Mul => a * b,
                OpCode::Div => a / b,
                OpCode::Mod => a % b,
                OpCode::Exp => a.powf(*b),
                _ => unreachable!(),
            };
            self.push(Value::Number(result));
            return Ok(());
        }

        // Add doubles as string concatenation when either side is a string
        if op == OpCode::Add {
            if matches!(lhs, Value::Str(_)) || matches!(rhs, Value::Str(_)) {
                self.push(Value::string(format!("{}{}", lhs, rhs)));
                return Ok(());
            }
        }

        if let Some(result) = self.try_meta_binary(op, &lhs, &rhs)? {
            self.push(result);
            return Ok(());
        }

        Err(ScriptError::type_error(format!(
            "cannot apply '{}' to '{}' and '{}'",
            op.mnemonic(),
            lhs.type_name(),
            rhs.type_name()
        )))
    }

    fn ordering(&mut self, op: OpCode) -> Result<(), ScriptError> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;

        let result = match (&lhs, &rhs) {
            (Value::Number(a), Value::Number(b)) => Some(match op {
                OpCode::Gt => a > b,
                OpCode::Gte => a >= b,
                OpCode::Lt => a < b,
                OpCode::Lte => a <= b,
                _ => unreachable!(),
            }),
            (Value::Str(a), Value::Str(b)) => Some(match op {
                OpCode::Gt => a > b,
                OpCode::Gte => a >= b,
                OpCode::Lt => a < b,
                OpCode::Lte => a <= b,
                _ => unreachable!(),
            }),
            _ => None,
        };
        if let Some(result) = result {
            self.push(Value::Bool(result));
            return Ok(());
        }

        if let Some(result) = self.try_meta_binary(op, &lhs, &rhs)? {
            self.push(Value::Bool(result.is_truthy()));
            return Ok(());
        }

        Err(ScriptError::type_error(format!(
            "cannot order '{}' and '{}'",
            lhs.type_name(),
            rhs.type_name()
        )))
    }

    /// Dispatch a binary operator through a meta-method on either operand's
    /// prototype chain
    fn try_meta_binary(
        &mut self,
        op: OpCode,
        lhs: &Value,
        rhs: &Value,
    ) -> Result<Option<Value>, ScriptError> {
        let name = meta_method_name(op);
        if name.is_empty() {
            return Ok(None);
        }
        for side in [lhs, rhs] {
            if let Value::Object(obj) = side {
                if let Some(method) = object_meta_method(obj, name) {
                    let result = self.call_value(method, vec![lhs.clone(), rhs.clone()])?;
                    return Ok(Some(result));
                }
            }
        }
        Ok(None)
    }

    fn values_equal(&mut self, lhs: &Value, rhs: &Value) -> Result<bool, ScriptError> {
        for side in [lhs, rhs] {
            if let Value::Object(obj) = side {
                if let Some(method) = object_meta_method(obj, "__eq") {
                    let result = self.call_value(method, vec![lhs.clone(), rhs.clone()])?;
                    return Ok(result.is_truthy());
                }
            }
        }
        Ok(lhs == rhs)
    }

    fn contains(&mut self, container: &Value, key: &Value) -> Result<bool, ScriptError> {
        match container {
            Value::Object(obj) => {
                if let Some(method) = object_meta_method(obj, "__in") {
                    let result = self.call_value(method, vec![container.clone(), key.clone()])?;
                    return Ok(result.is_truthy());
                }
                crate::value::object_has_key(obj, key)
            }
            Value::Array(arr) => {
                let elements = arr.lock().unwrap().elements.clone();
                Ok(elements.iter().any(|element| element == key))
            }
            Value::Str(haystack) => match key {
                Value::Str(needle) => Ok(haystack.contains(needle.as_str())),
                other => Err(ScriptError::type_error(format!(
                    "cannot search a string for '{}'",
                    other.type_name()
                ))),
            },
            other => Err(ScriptError::type_error(format!(
                "'in' requires an object, array, or string, found '{}'",
                other.type_name()
            ))),
        }
    }

    fn load_field(&mut self, object: &Value, name: &str) -> Result<Value, ScriptError> {
        match object {
            Value::Object(obj) => object_lookup(obj, &Value::str_ref(name)),
            Value::Array(arr) => match name {
                "length" => Ok(Value::Number(arr.lock().unwrap().elements.len() as f64)),
                _ => Err(ScriptError::type_error(format!("array has no field '{}'", name))),
            },
            Value::Str(s) => match name {
                "length" => Ok(Value::Number(s.chars().count() as f64)),
                _ => Err(ScriptError::type_error(format!("string has no field '{}'", name))),
            },
            other => Err(ScriptError::type_error(format!(
                "cannot read field '{}' of value of type '{}'",
                name,
                other.type_name()
            ))),
        }
    }

    fn load_index(&mut self, container: &Value, index: &Value) -> Result<Value, ScriptError> {
        match container {
            Value::Array(arr) => match index.as_number() {
                Some(n) => Ok(arr.lock().unwrap().get(n)),
                None => Err(ScriptError::type_error(format!(
                    "array index must be a number, found '{}'",
                    index.type_name()
                ))),
            },
            Value::Object(obj) => {
                if let Some(method) = object_meta_method(obj, "__getIndex") {
                    return self.call_value(method, vec![container.clone(), index.clone()]);
                }
                object_lookup(obj, index)
            }
            Value::Str(s) => match index.as_number() {
                Some(n) if n.fract() == 0.0 && n >= 0.0 => {
                    Ok(match s.chars().nth(n as usize) {
                        Some(c) => Value::string(c.to_string()),
                        None => Value::Undefined,
                    })
                }
                _ => Ok(Value::Undefined),
            },
            other => Err(ScriptError::type_error(format!(
                "cannot index value of type '{}'",
                other.type_name()
            ))),
        }
    }

    fn store_index(
        &mut self,
        container: &Value,
        index: Value,
        value: Value,
    ) -> Result<(), ScriptError> {
        match container {
            Value::Array(arr) => match index.as_number() {
                Some(n) => arr.lock().unwrap().set(n, value),
                None => Err(ScriptError::type_error(format!(
                    "array index must be a number, found '{}'",
                    index.type_name()
                ))),
            },
            Value::Object(obj) => {
                if let Some(method) = object_meta_method(obj, "__setIndex") {
                    self.call_value(method, vec![container.clone(), index, value])?;
                    return Ok(());
                }
                obj.lock().unwrap().set(index, value)
            }
            other => Err(ScriptError::type_error(format!(
                "cannot index value of type '{}'",
                other.type_name()
            ))),
        }
    }

    // --- frame and stack access ---

    fn frame(&self) -> &Frame {
        self.frames.last().expect("active frame")
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("active frame")
    }

    fn upvalue_cell(&self, slot: usize) -> Result<UpvalueCell, ScriptError> {
        self.frame()
            .upvalues
            .get(slot)
            .cloned()
            .ok_or_else(|| ScriptError::runtime_error(format!("upvalue slot {} out of range", slot)))
    }

    fn image_string(&self, index: u32) -> Arc<String> {
        self.frame()
            .program
            .strings
            .get(index as usize)
            .cloned()
            .unwrap_or_else(|| Arc::new(String::new()))
    }

    fn push(&mut self, value: Value) {
        self.frame_mut().eval.push(value);
    }

    fn pop(&mut self) -> Result<Value, ScriptError> {
        self.frame_mut()
            .eval
            .pop()
            .ok_or_else(|| ScriptError::runtime_error("evaluation stack underflow".to_string()))
    }

    fn peek(&self) -> Result<Value, ScriptError> {
        self.frame()
            .eval
            .last()
            .cloned()
            .ok_or_else(|| ScriptError::runtime_error("evaluation stack underflow".to_string()))
    }

    fn pop_args(&mut self, argc: usize) -> Result<Vec<Value>, ScriptError> {
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop()?);
        }
        args.reverse();
        Ok(args)
    }

    fn fetch_u16(&mut self) -> Result<u16, ScriptError> {
        let frame = self.frame_mut();
        let at = frame.ip;
        if at + 2 > frame.program.bytecode.len() {
            return Err(ScriptError::runtime_error("truncated instruction".to_string()));
        }
        frame.ip += 2;
        let bytes = &frame.program.bytecode[at..at + 2];
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn fetch_u32(&mut self) -> Result<u32, ScriptError> {
        let frame = self.frame_mut();
        let at = frame.ip;
        if at + 4 > frame.program.bytecode.len() {
            return Err(ScriptError::runtime_error("truncated instruction".to_string()));
        }
        frame.ip += 4;
        let bytes = &frame.program.bytecode[at..at + 4];
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// The innermost handler covering `offset`: smallest end, then latest start
fn innermost_handler(handlers: &[HandlerRecord], offset: u32) -> Option<&HandlerRecord> {
    let mut best: Option<&HandlerRecord> = None;
    for handler in handlers {
        if !handler.covers(offset) {
            continue;
        }
        best = match best {
            None => Some(handler),
            Some(current)
                if handler.end < current.end
                    || (handler.end == current.end && handler.start > current.start) =>
            {
                Some(handler)
            }
            Some(current) => Some(current),
        };
    }
    best
}

fn meta_method_name(op: OpCode) -> &'static str {
    match op {
        OpCode::Add => "__add",
        OpCode::Sub => "__sub",
        OpCode::Mul => "__mul",
        OpCode::Div => "__div",
        OpCode::Mod => "__mod",
        OpCode::Exp => "__exp",
        OpCode::Gt => "__gt",
        OpCode::Gte => "__gte",
        OpCode::Lt => "__lt",
        OpCode::Lte => "__lte",
        _ => "",
    }
}

/// Extract the slice of an array with optional start/end/step bounds.
/// Negative indices count from the end; a missing step is 1.
fn slice_array(
    container: &Value,
    start: &Value,
    end: &Value,
    step: &Value,
) -> Result<Value, ScriptError> {
    let arr = match container {
        Value::Array(arr) => arr,
        other => {
            return Err(ScriptError::type_error(format!(
                "cannot slice value of type '{}'",
                other.type_name()
            )))
        }
    };
    let elements = arr.lock().unwrap().elements.clone();
    let len = elements.len() as i64;

    let step = match step {
        Value::Undefined => 1i64,
        Value::Number(n) if n.fract() == 0.0 && *n != 0.0 => *n as i64,
        Value::Number(n) if *n == 0.0 => {
            return Err(ScriptError::runtime_error("slice step cannot be zero".to_string()))
        }
        other => {
            return Err(ScriptError::type_error(format!(
                "slice step must be a number, found '{}'",
                other.type_name()
            )))
        }
    };

    let bound = |value: &Value, default: i64| -> Result<i64, ScriptError> {
        match value {
            Value::Undefined => Ok(default),
            Value::Number(n) if n.fract() == 0.0 => {
                let mut at = *n as i64;
                if at < 0 {
                    at += len;
                }
                Ok(at)
            }
            other => Err(ScriptError::type_error(format!(
                "slice bound must be a number, found '{}'",
                other.type_name()
            ))),
        }
    };

    let mut out = Vec::new();
    if step > 0 {
        let from = bound(start, 0)?.clamp(0, len);
        let to = bound(end, len)?.clamp(0, len);
        let mut at = from;
        while at < to {
            out.push(elements[at as usize].clone());
            at += step;
        }
    } else {
        let from = bound(start, len - 1)?.clamp(-1, len - 1);
        let to = bound(end, -1)?.clamp(-1, len - 1);
        let mut at = from;
        while at > to {
            out.push(elements[at as usize].clone());
            at += step;
        }
    }
    Ok(Value::array(out))
}

/// Index-walking enumerator over an array, implementing the
/// getEnumerator/moveNext/current protocol
fn make_array_enumerator(array: ArrayRef) -> Value {
    let obj = Arc::new(Mutex::new(ObjectData::new()));
    let index = Arc::new(Mutex::new(0usize));
    let weak = Arc::downgrade(&obj);

    let move_next = {
        let array = array.clone();
        move |_vm: &mut VM, _args: &[Value]| -> Result<Value, ScriptError> {
            let mut at = index.lock().unwrap();
            let element = array.lock().unwrap().elements.get(*at).cloned();
            let (advance, current, more) = match element {
                Some(value) => (true, value, true),
                None => (false, Value::Undefined, false),
            };
            if advance {
                *at += 1;
            }
            if let Some(target) = weak.upgrade() {
                target.lock().unwrap().set(Value::str_ref("current"), current)?;
            }
            Ok(Value::Bool(more))
        }
    };

    {
        let mut data = obj.lock().unwrap();
        data.set(Value::str_ref("current"), Value::Undefined)
            .expect("fresh enumerator accepts keys");
        data.set(Value::str_ref("moveNext"), Value::native("moveNext", Arc::new(move_next)))
            .expect("fresh enumerator accepts keys");
        data.set(
            Value::str_ref("getEnumerator"),
            Value::native("getEnumerator", Arc::new(|_vm: &mut VM, args: &[Value]| {
                Ok(args.first().cloned().unwrap_or(Value::Undefined))
            })),
        )
        .expect("fresh enumerator accepts keys");
    }
    Value::Object(obj)
}
