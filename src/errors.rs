// File: src/errors.rs
//
// Error handling and reporting for the Rill engine.
// Provides the structured error type shared by the compiler, the VM, and the
// async scheduler, with source location information and pretty-printed
// error messages.

use crate::value::Value;
use colored::Colorize;
use std::fmt;

/// Source location information for tracking where code appears in a file
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
    pub file: Option<String>,
}

impl SourceLocation {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column, file: None }
    }

    pub fn with_file(line: usize, column: usize, file: String) -> Self {
        Self { line, column, file: Some(file) }
    }

    pub fn unknown() -> Self {
        Self { line: 0, column: 0, file: None }
    }

    pub fn is_known(&self) -> bool {
        self.line != 0
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(ref file) = self.file {
            write!(f, "{}:{}:{}", file, self.line, self.column)
        } else {
            write!(f, "{}:{}", self.line, self.column)
        }
    }
}

/// Types of errors that can occur in the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Lexical, syntactic, or semantic failure during code generation.
    /// Never thrown from the VM.
    CompileError,
    /// Operation applied to incompatible value tags
    TypeError,
    /// Script-level `error(msg)`, failed invariant, stack overflow
    RuntimeError,
    /// Wrapped host exception from a native function
    HostError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::CompileError => write!(f, "Compile Error"),
            ErrorKind::TypeError => write!(f, "Type Error"),
            ErrorKind::RuntimeError => write!(f, "Runtime Error"),
            ErrorKind::HostError => write!(f, "Host Error"),
        }
    }
}

/// A structured engine error with location information.
///
/// `payload` is the script-visible error value: what a `catch` clause binds.
/// When absent, catch binds the message as a string.
#[derive(Debug, Clone)]
pub struct ScriptError {
    pub kind: ErrorKind,
    pub message: String,
    pub location: SourceLocation,
    pub source_line: Option<String>,
    pub cause: Option<Box<ScriptError>>,
    pub payload: Option<Value>,
}

impl ScriptError {
    pub fn new(kind: ErrorKind, message: String, location: SourceLocation) -> Self {
        Self {
            kind,
            message,
            location,
            source_line: None,
            cause: None,
            payload: None,
        }
    }

    pub fn compile_error(message: String, location: SourceLocation) -> Self {
        Self::new(ErrorKind::CompileError, message, location)
    }

    pub fn type_error(message: String) -> Self {
        Self::new(ErrorKind::TypeError, message, SourceLocation::unknown())
    }

    pub fn runtime_error(message: String) -> Self {
        Self::new(ErrorKind::RuntimeError, message, SourceLocation::unknown())
    }

    /// Wrap a host-side failure so it propagates through the handler stack
    /// without losing the original cause.
    pub fn host_error(message: String, cause: ScriptError) -> Self {
        Self::new(ErrorKind::HostError, message, SourceLocation::unknown()).with_cause(cause)
    }

    pub fn with_location(mut self, location: SourceLocation) -> Self {
        // Keep the innermost location: the first raise site wins.
        if !self.location.is_known() {
            self.location = location;
        }
        self
    }

    pub fn with_source(mut self, source_line: String) -> Self {
        self.source_line = Some(source_line);
        self
    }

    pub fn with_cause(mut self, cause: ScriptError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// The value a `catch` clause binds for this error.
    pub fn catch_value(&self) -> Value {
        match &self.payload {
            Some(v) => v.clone(),
            None => Value::string(self.message.clone()),
        }
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Error header with kind and message
        let kind_str = format!("{}", self.kind);
        writeln!(f, "{}: {}", kind_str.red().bold(), self.message.bold())?;

        // Location arrow
        if self.location.is_known() {
            let location_str = format!("  --> {}", self.location);
            writeln!(f, "{}", location_str.bright_blue())?;
        }

        // Source code context
        if let Some(ref source) = self.source_line {
            let line_num = self.location.line;
            let col_num = self.location.column;

            writeln!(f, "   {}", "|".bright_blue())?;
            writeln!(
                f,
                "{} {} {}",
                format!("{:3}", line_num).bright_blue(),
                "|".bright_blue(),
                source
            )?;
            writeln!(
                f,
                "   {} {}{}",
                "|".bright_blue(),
                " ".repeat(col_num.saturating_sub(1)),
                "^".red().bold()
            )?;
            writeln!(f, "   {}", "|".bright_blue())?;
        }

        if let Some(ref cause) = self.cause {
            writeln!(f, "   {} caused by: {}: {}", "=".bright_cyan(), cause.kind, cause.message)?;
        }

        Ok(())
    }
}

impl std::error::Error for ScriptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_display() {
        let loc = SourceLocation::with_file(3, 7, "main.rl".to_string());
        assert_eq!(format!("{}", loc), "main.rl:3:7");

        let bare = SourceLocation::new(3, 7);
        assert_eq!(format!("{}", bare), "3:7");
    }

    #[test]
    fn test_with_location_keeps_innermost() {
        let err = ScriptError::type_error("bad operand".to_string())
            .with_location(SourceLocation::new(4, 1))
            .with_location(SourceLocation::new(9, 1));
        assert_eq!(err.location.line, 4);
    }

    #[test]
    fn test_catch_value_defaults_to_message() {
        let err = ScriptError::runtime_error("boom".to_string());
        match err.catch_value() {
            Value::Str(s) => assert_eq!(s.as_str(), "boom"),
            other => panic!("Expected string payload, got {:?}", other),
        }
    }

    #[test]
    fn test_cause_chain() {
        let inner = ScriptError::runtime_error("disk on fire".to_string());
        let outer = ScriptError::host_error("io callback failed".to_string(), inner);
        assert_eq!(outer.kind, ErrorKind::HostError);
        assert_eq!(outer.cause.as_ref().unwrap().message, "disk on fire");
    }
}
