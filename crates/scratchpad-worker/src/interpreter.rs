//! Snippet interpreter.
//!
//! Executes a compiled [`Program`] statement by statement, reporting output as
//! [`ResultRecord`]s. Variables live for the whole process, so later runs see
//! what earlier runs defined.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use scratchpad_core::compile::{BinOp, Expr, Program, Statement, StatementKind};
use scratchpad_core::record::ResultRecord;

/// Name of the variable holding the restored package directories.
pub const PACKAGES_VAR: &str = "packages";

/// How often `sleep` checks for cancellation.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Largest string a script may build by repetition, in bytes.
pub const MAX_STRING_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Str(_) => "string",
            Self::List(_) => "list",
        }
    }

    /// Record for this value; list elements become child records.
    pub fn to_record(&self, header: Option<String>) -> ResultRecord {
        match self {
            Self::List(items) => ResultRecord::value_tree(
                header,
                self.to_string(),
                items.iter().map(|item| item.to_record(None)).collect(),
            ),
            _ => ResultRecord::value_tree(header, self.to_string(), Vec::new()),
        }
    }

    fn repr(&self) -> String {
        match self {
            Self::Str(s) => format!("{:?}", s),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{}", n),
            Self::Str(s) => write!(f, "{}", s),
            Self::List(items) => {
                let items: Vec<String> = items.iter().map(Value::repr).collect();
                write!(f, "[{}]", items.join(", "))
            }
        }
    }
}

/// A script error, reported as an `Exception` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub kind: &'static str,
    pub message: String,
    pub line: u32,
}

impl RuntimeError {
    fn new(kind: &'static str, message: impl Into<String>, line: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            line,
        }
    }

    pub fn to_record(&self) -> ResultRecord {
        ResultRecord::exception(self.kind, self.message.clone(), Some(self.line))
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    /// Ran to the end or stopped at a runtime error.
    Completed,
    Canceled,
    /// The script called `exit(code)`.
    Exit(i32),
}

enum Interrupt {
    Canceled,
    Exit(i32),
    Error(RuntimeError),
    Io(io::Error),
}

impl From<RuntimeError> for Interrupt {
    fn from(e: RuntimeError) -> Self {
        Self::Error(e)
    }
}

type Flow<T> = std::result::Result<T, Interrupt>;

/// Sink for records produced while running.
pub type Emit<'a> = dyn FnMut(ResultRecord) -> io::Result<()> + 'a;

#[derive(Debug, Default)]
pub struct Interpreter {
    globals: HashMap<String, Value>,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    /// Run `program`, checking `abort` between statements and while sleeping.
    ///
    /// Only failures to emit are errors; script errors are emitted as
    /// exception records and end the run normally.
    pub fn run(
        &mut self,
        program: &Program,
        package_paths: &[PathBuf],
        abort: &AtomicBool,
        emit: &mut Emit<'_>,
    ) -> io::Result<RunEnd> {
        let packages = package_paths
            .iter()
            .map(|p| Value::Str(p.display().to_string()))
            .collect();
        self.globals
            .insert(PACKAGES_VAR.to_string(), Value::List(packages));

        for statement in &program.statements {
            if abort.load(Ordering::SeqCst) {
                return Ok(RunEnd::Canceled);
            }
            match self.exec(statement, abort, emit) {
                Ok(()) => {}
                Err(Interrupt::Canceled) => return Ok(RunEnd::Canceled),
                Err(Interrupt::Exit(code)) => return Ok(RunEnd::Exit(code)),
                Err(Interrupt::Error(e)) => {
                    tracing::debug!(line = e.line, "runtime error: {}", e.message);
                    emit(e.to_record())?;
                    return Ok(RunEnd::Completed);
                }
                Err(Interrupt::Io(e)) => return Err(e),
            }
        }
        Ok(RunEnd::Completed)
    }

    fn exec(&mut self, statement: &Statement, abort: &AtomicBool, emit: &mut Emit<'_>) -> Flow<()> {
        let line = statement.line;
        match &statement.kind {
            StatementKind::Let { name, value } => {
                let value = self.eval(value, line)?;
                self.globals.insert(name.clone(), value);
            }
            StatementKind::Print { value } => {
                let value = self.eval(value, line)?;
                emit(value.to_record(None)).map_err(Interrupt::Io)?;
            }
            StatementKind::Dump { header, value } => {
                let header = self.eval(header, line)?.to_string();
                let value = self.eval(value, line)?;
                emit(value.to_record(Some(header))).map_err(Interrupt::Io)?;
            }
            StatementKind::Sleep { millis } => {
                let millis = self.eval_count(millis, "sleep", line)?;
                sleep(Duration::from_millis(millis), abort)?;
            }
            StatementKind::Throw { message } => {
                let message = self.eval(message, line)?.to_string();
                return Err(RuntimeError::new("ScriptError", message, line).into());
            }
            StatementKind::Exit { code } => match self.eval(code, line)? {
                Value::Int(code) => {
                    let code = i32::try_from(code).map_err(|_| {
                        RuntimeError::new("ValueError", format!("exit code {} is out of range", code), line)
                    })?;
                    return Err(Interrupt::Exit(code));
                }
                other => {
                    return Err(type_error(format!("exit() expects an int, got {}", other.type_name()), line).into());
                }
            },
            StatementKind::Repeat { count, body } => {
                let count = self.eval_count(count, "repeat", line)?;
                for _ in 0..count {
                    if abort.load(Ordering::SeqCst) {
                        return Err(Interrupt::Canceled);
                    }
                    self.exec(body, abort, emit)?;
                }
            }
            StatementKind::Expr { value } => {
                self.eval(value, line)?;
            }
        }
        Ok(())
    }

    fn eval_count(&self, expr: &Expr, what: &str, line: u32) -> Flow<u64> {
        match self.eval(expr, line)? {
            Value::Int(n) if n >= 0 => Ok(n as u64),
            Value::Int(n) => Err(RuntimeError::new(
                "ValueError",
                format!("{}() expects a non-negative count, got {}", what, n),
                line,
            )
            .into()),
            other => Err(type_error(
                format!("{}() expects an int, got {}", what, other.type_name()),
                line,
            )
            .into()),
        }
    }

    fn eval(&self, expr: &Expr, line: u32) -> std::result::Result<Value, RuntimeError> {
        match expr {
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item, line))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::List),
            Expr::Var(name) => self.globals.get(name).cloned().ok_or_else(|| {
                RuntimeError::new("NameError", format!("'{}' is not defined", name), line)
            }),
            Expr::Neg(inner) => match self.eval(inner, line)? {
                Value::Int(n) => n
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| overflow(line)),
                other => Err(type_error(format!("cannot negate {}", other.type_name()), line)),
            },
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.eval(lhs, line)?;
                let rhs = self.eval(rhs, line)?;
                binary(*op, lhs, rhs, line)
            }
        }
    }
}

fn binary(op: BinOp, lhs: Value, rhs: Value, line: u32) -> std::result::Result<Value, RuntimeError> {
    match (op, lhs, rhs) {
        (BinOp::Add, Value::Int(a), Value::Int(b)) => a.checked_add(b).map(Value::Int).ok_or_else(|| overflow(line)),
        (BinOp::Sub, Value::Int(a), Value::Int(b)) => a.checked_sub(b).map(Value::Int).ok_or_else(|| overflow(line)),
        (BinOp::Mul, Value::Int(a), Value::Int(b)) => a.checked_mul(b).map(Value::Int).ok_or_else(|| overflow(line)),
        (BinOp::Div, Value::Int(_), Value::Int(0)) => Err(RuntimeError::new(
            "DivideByZeroError",
            "attempted to divide by zero",
            line,
        )),
        (BinOp::Div, Value::Int(a), Value::Int(b)) => a.checked_div(b).map(Value::Int).ok_or_else(|| overflow(line)),
        (BinOp::Add, Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        (BinOp::Add, a @ Value::Str(_), b) | (BinOp::Add, a, b @ Value::Str(_)) => {
            Ok(Value::Str(format!("{}{}", a, b)))
        }
        (BinOp::Mul, Value::Str(s), Value::Int(n)) => {
            let count = usize::try_from(n).ok().filter(|&count| {
                s.len()
                    .checked_mul(count)
                    .is_some_and(|len| len <= MAX_STRING_LEN)
            });
            match count {
                Some(count) => Ok(Value::Str(s.repeat(count))),
                None => Err(RuntimeError::new(
                    "ValueError",
                    format!("cannot repeat a string {} times", n),
                    line,
                )),
            }
        }
        (op, a, b) => Err(type_error(
            format!(
                "unsupported operand types for {}: {} and {}",
                op,
                a.type_name(),
                b.type_name()
            ),
            line,
        )),
    }
}

fn sleep(duration: Duration, abort: &AtomicBool) -> Flow<()> {
    let deadline = Instant::now() + duration;
    loop {
        if abort.load(Ordering::SeqCst) {
            return Err(Interrupt::Canceled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

fn type_error(message: String, line: u32) -> RuntimeError {
    RuntimeError::new("TypeError", message, line)
}

fn overflow(line: u32) -> RuntimeError {
    RuntimeError::new("OverflowError", "arithmetic overflow", line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scratchpad_core::compile::{Compiler, SnippetCompiler};

    fn compile(source: &str) -> Program {
        let output = SnippetCompiler::new().compile(source);
        Program::from_payload(&output.into_payload().unwrap()).unwrap()
    }

    fn run(interpreter: &mut Interpreter, source: &str) -> (Vec<ResultRecord>, RunEnd) {
        let mut records = Vec::new();
        let abort = AtomicBool::new(false);
        let end = interpreter
            .run(&compile(source), &[], &abort, &mut |record| {
                records.push(record);
                Ok(())
            })
            .unwrap();
        (records, end)
    }

    #[test]
    fn test_print_arithmetic() {
        let (records, end) = run(&mut Interpreter::new(), "print(1+1)");
        assert_eq!(records, vec![ResultRecord::value("2")]);
        assert_eq!(end, RunEnd::Completed);
    }

    #[test]
    fn test_dump_list_has_children_in_order() {
        let (records, _) = run(&mut Interpreter::new(), "dump(\"xs\", [3, \"a\", [1]])");
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.to_string(), "xs: [3, \"a\", [1]]");
        let children: Vec<String> = record.children().iter().map(|c| c.to_string()).collect();
        assert_eq!(children, vec!["3", "a", "[1]"]);
        assert_eq!(record.children()[2].children().len(), 1);
    }

    #[test]
    fn test_runtime_error_stops_run_with_line() {
        let (records, end) = run(&mut Interpreter::new(), "print(1)\nprint(1 / 0)\nprint(3)");
        assert_eq!(end, RunEnd::Completed);
        assert_eq!(records.len(), 2);
        match &records[1] {
            ResultRecord::Exception {
                exception_type,
                line_number,
                ..
            } => {
                assert_eq!(exception_type, "DivideByZeroError");
                assert_eq!(*line_number, Some(2));
            }
            other => panic!("expected exception, got {:?}", other),
        }
    }

    #[test]
    fn test_string_repeat_is_bounded() {
        let (records, _) = run(&mut Interpreter::new(), "print(\"ab\" * 3)");
        assert_eq!(records, vec![ResultRecord::value("ababab")]);

        let (records, end) = run(&mut Interpreter::new(), "print(\"ab\" * 9223372036854775807)");
        assert_eq!(end, RunEnd::Completed);
        assert!(matches!(
            &records[..],
            [ResultRecord::Exception { exception_type, line_number: Some(1), .. }] if exception_type == "ValueError"
        ));
    }

    #[test]
    fn test_globals_persist_across_runs() {
        let mut interpreter = Interpreter::new();
        run(&mut interpreter, "let greeting = \"hi \" + 2");
        let (records, _) = run(&mut interpreter, "print(greeting)");
        assert_eq!(records, vec![ResultRecord::value("hi 2")]);
    }

    #[test]
    fn test_abort_before_first_statement() {
        let mut records = Vec::new();
        let abort = AtomicBool::new(true);
        let end = Interpreter::new()
            .run(&compile("print(1)"), &[], &abort, &mut |record| {
                records.push(record);
                Ok(())
            })
            .unwrap();
        assert_eq!(end, RunEnd::Canceled);
        assert!(records.is_empty());
    }

    #[test]
    fn test_exit_and_throw() {
        let (_, end) = run(&mut Interpreter::new(), "exit(7)\nprint(1)");
        assert_eq!(end, RunEnd::Exit(7));

        let (records, _) = run(&mut Interpreter::new(), "throw(\"boom\")");
        assert_eq!(records, vec![ResultRecord::exception("ScriptError", "boom", Some(1))]);
    }

    #[test]
    fn test_packages_variable() {
        let mut interpreter = Interpreter::new();
        let abort = AtomicBool::new(false);
        interpreter
            .run(
                &compile("let n = 1"),
                &[PathBuf::from("/cache/foo/1.0.0")],
                &abort,
                &mut |_| Ok(()),
            )
            .unwrap();
        assert_eq!(
            interpreter.get(PACKAGES_VAR),
            Some(&Value::List(vec![Value::Str("/cache/foo/1.0.0".to_string())]))
        );
    }
}
