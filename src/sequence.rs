// File: src/sequence.rs
//
// Sequence (generator) runtime for the Rill engine.
// A function compiled as a sequence does not execute when called: the call
// returns an enumerator object implementing getEnumerator, moveNext, and
// current. The sequence's frame never sits on the main call stack between
// resumes; SeqSuspend persists it here, anchored by the sequence object,
// until the sequence completes and its pooled buffers return.

use crate::errors::ScriptError;
use crate::value::{Closure, ObjectData, Value};
use crate::vm::{Frame, VM};
use std::sync::{Arc, Mutex, Weak};

/// Shared reference to a sequence instance
pub type SequenceRef = Arc<Mutex<Sequence>>;

/// Lifecycle of a sequence instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    /// Created, never resumed; the first moveNext allocates the frame
    Initial,
    /// Parked at a yield with its frame saved here
    Suspended,
    /// Currently executing on the VM
    Running,
    /// Ran to Ret; buffers have been returned
    Completed,
    /// Failed; the error propagated to the resumer
    Errored,
}

/// A generator instance: the suspended frame plus its lifecycle state
pub struct Sequence {
    pub closure: Closure,
    /// Arguments from the creating call, consumed by the first resume
    pub args: Vec<Value>,
    pub state: SequenceState,
    pub(crate) frame: Option<Frame>,
    pub last_yielded: Value,
}

impl Sequence {
    pub fn new(closure: Closure, args: Vec<Value>) -> SequenceRef {
        Arc::new(Mutex::new(Sequence {
            closure,
            args,
            state: SequenceState::Initial,
            frame: None,
            last_yielded: Value::Undefined,
        }))
    }
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Sequence({}, {:?}, suspended_frame={})",
            self.closure.program.function_name(self.closure.function),
            self.state,
            self.frame.is_some()
        )
    }
}

/// Build the enumerator object a sequence call returns.
///
/// The object carries the SequenceRef in its user-data slot (the scheduler
/// extracts it there) and exposes:
///   - getEnumerator: returns the receiver itself
///   - moveNext: resumes the sequence, stores the yielded value in
///     `current`, and returns whether a value was produced
///   - current: the last yielded value, Undefined once exhausted
pub fn make_sequence_value(closure: Closure, args: Vec<Value>) -> Value {
    let seq = Sequence::new(closure, args);
    let obj = Arc::new(Mutex::new(ObjectData::new()));
    let weak: Weak<Mutex<ObjectData>> = Arc::downgrade(&obj);

    let move_next = {
        let seq = seq.clone();
        move |vm: &mut VM, _args: &[Value]| -> Result<Value, ScriptError> {
            let yielded = vm.resume_sequence(&seq, Value::Undefined)?;
            let (current, more) = match yielded {
                Some(value) => (value, true),
                None => (Value::Undefined, false),
            };
            if let Some(target) = weak.upgrade() {
                target.lock().unwrap().set(Value::str_ref("current"), current)?;
            }
            Ok(Value::Bool(more))
        }
    };

    {
        let mut data = obj.lock().unwrap();
        data.user_data = Some(seq as std::sync::Arc<dyn std::any::Any + Send + Sync>);
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

/// Pull the SequenceRef back out of an enumerator object's user-data slot
pub fn sequence_of(value: &Value) -> Option<SequenceRef> {
    match value {
        Value::Object(obj) => {
            let data = obj.lock().unwrap();
            let user_data = data.user_data.clone()?;
            user_data.downcast::<Mutex<Sequence>>().ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{FunctionInfo, ProgramImage};

    fn dummy_closure() -> Closure {
        let image = ProgramImage {
            numbers: vec![],
            strings: vec![],
            functions: vec![FunctionInfo {
                entry_offset: 0,
                num_args: 0,
                num_locals: 0,
                num_upvalues: 0,
                num_cells: 0,
                has_var_args: false,
                is_sequence: true,
                debug_name: None,
                captures: vec![],
                handlers: vec![],
            }],
            bytecode: vec![],
            debug: None,
        };
        Closure { program: Arc::new(image), function: 0, upvalues: vec![] }
    }

    #[test]
    fn test_sequence_starts_initial() {
        let seq = Sequence::new(dummy_closure(), vec![Value::Number(1.0)]);
        let guard = seq.lock().unwrap();
        assert_eq!(guard.state, SequenceState::Initial);
        assert!(guard.frame.is_none());
        assert_eq!(guard.args.len(), 1);
    }

    #[test]
    fn test_enumerator_object_shape() {
        let value = make_sequence_value(dummy_closure(), vec![]);
        let obj = match &value {
            Value::Object(obj) => obj,
            _ => panic!("expected an object"),
        };
        let data = obj.lock().unwrap();
        assert!(data.get_own(&Value::str_ref("moveNext")).unwrap().is_callable());
        assert!(data.get_own(&Value::str_ref("getEnumerator")).unwrap().is_callable());
        assert_eq!(data.get_own(&Value::str_ref("current")), Some(Value::Undefined));
    }

    #[test]
    fn test_sequence_extraction_from_user_data() {
        let value = make_sequence_value(dummy_closure(), vec![]);
        assert!(sequence_of(&value).is_some());
        assert!(sequence_of(&Value::Number(1.0)).is_none());
        assert!(sequence_of(&Value::object(ObjectData::new())).is_none());
    }
}
