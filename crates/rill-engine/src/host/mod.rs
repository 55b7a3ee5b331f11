//! Host binding surface
//!
//! Hosts declare the functions scripts may call: name, typed parameters
//! with optional defaults, an async flag, and a dispatch function. Sync
//! functions dispatch inline during execution; async functions suspend
//! the script and hand an `AsyncOp` back to the host.
//!
//! Registration is a phase that precedes compilation: `compile` captures
//! the registry behind an `Arc`, so scripts resolve against an immutable
//! snapshot and later registrations cannot affect them.

use crate::error::{RuntimeError, RuntimeErrorKind};
use crate::types::Type;
use crate::vm::value::Value;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Output sink for `print`/`println`; hosts provide their own.
pub trait PrintWriter: Send {
    fn print(&mut self, text: &str);

    fn println(&mut self, text: &str) {
        self.print(text);
        self.print("\n");
    }
}

/// Writes to stdout.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn print(&mut self, text: &str) {
        print!("{}", text);
    }
}

/// Collects output into a string (used by tests and `eval`-style hosts).
#[derive(Debug, Default)]
pub struct CollectPrint {
    pub output: String,
}

impl PrintWriter for CollectPrint {
    fn print(&mut self, text: &str) {
        self.output.push_str(text);
    }
}

/// Discards all output.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn print(&mut self, _text: &str) {}
}

/// Per-execution host context handed to sync host functions.
pub struct HostContext<'a> {
    pub writer: &'a mut dyn PrintWriter,
}

/// Dispatch function for a sync host function.
pub type HostFn =
    Arc<dyn Fn(&mut HostContext, &[Value]) -> Result<Value, RuntimeError> + Send + Sync>;

/// One parameter of a host function.
#[derive(Debug, Clone)]
pub struct HostParam {
    pub name: String,
    pub ty: Type,
    /// Parameters with a default are optional at call sites
    pub default: Option<Value>,
}

impl HostParam {
    pub fn required(name: &str, ty: Type) -> Self {
        Self {
            name: name.to_string(),
            ty,
            default: None,
        }
    }

    pub fn optional(name: &str, ty: Type, default: Value) -> Self {
        Self {
            name: name.to_string(),
            ty,
            default: Some(default),
        }
    }
}

/// A host-registered function.
pub struct HostFunction {
    pub name: String,
    pub params: Vec<HostParam>,
    pub return_type: Type,
    pub is_async: bool,
    /// Extra positional arguments beyond the declared parameters are
    /// allowed (e.g. `sprintf`)
    pub varargs: bool,
    /// Inline dispatch; `None` for async functions the host performs
    /// itself after receiving the `AsyncOp`
    pub dispatch: Option<HostFn>,
}

impl std::fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("is_async", &self.is_async)
            .finish()
    }
}

/// Registry of host functions indexed by name.
#[derive(Debug, Default)]
pub struct HostRegistry {
    functions: Vec<HostFunction>,
    by_name: FxHashMap<String, usize>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the standard global functions.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        register_defaults(&mut registry);
        registry
    }

    /// Register a function. Returns an error on duplicate names.
    pub fn register(&mut self, function: HostFunction) -> Result<(), String> {
        if self.by_name.contains_key(&function.name) {
            return Err(format!(
                "Host function '{}' is already registered",
                function.name
            ));
        }
        self.by_name
            .insert(function.name.clone(), self.functions.len());
        self.functions.push(function);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, idx: usize) -> &HostFunction {
        &self.functions[idx]
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

fn register_defaults(registry: &mut HostRegistry) {
    // sleep(ms, result?) - the canonical async function. The engine
    // suspends at the call site; hosts that use `run_blocking` get the
    // provided dispatch, which blocks the resuming thread.
    registry
        .register(HostFunction {
            name: "sleep".to_string(),
            params: vec![
                HostParam::required("millis", Type::Long),
                HostParam::optional("result", Type::Any, Value::Null),
            ],
            return_type: Type::Any,
            is_async: true,
            varargs: false,
            dispatch: Some(Arc::new(|_ctx, args| {
                if let Some(ms) = args.first().and_then(|v| v.to_i64()) {
                    if ms > 0 {
                        std::thread::sleep(std::time::Duration::from_millis(ms as u64));
                    }
                }
                Ok(args.get(1).cloned().unwrap_or(Value::Null))
            })),
        })
        .expect("default registration");

    registry
        .register(HostFunction {
            name: "timestamp".to_string(),
            params: vec![],
            return_type: Type::Long,
            is_async: false,
            varargs: false,
            dispatch: Some(Arc::new(|_ctx, _args| {
                let millis = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                Ok(Value::Long(millis))
            })),
        })
        .expect("default registration");

    registry
        .register(HostFunction {
            name: "sprintf".to_string(),
            params: vec![HostParam::required("format", Type::Str)],
            return_type: Type::Str,
            is_async: false,
            varargs: true,
            dispatch: Some(Arc::new(|_ctx, args| {
                let format = match args.first() {
                    Some(Value::Str(s)) => s.to_string(),
                    other => {
                        return Err(RuntimeError::new(RuntimeErrorKind::InvalidArguments {
                            message: format!(
                                "sprintf format must be a String, got {}",
                                other.map(|v| v.type_name()).unwrap_or_default()
                            ),
                        }));
                    }
                };
                sprintf(&format, &args[1..])
            })),
        })
        .expect("default registration");
}

/// Minimal `%`-directive formatter: `%s`, `%d`, `%f`, `%x`, `%%`, with
/// optional width (`%5d`) and precision (`%.2f`).
fn sprintf(format: &str, args: &[Value]) -> Result<Value, RuntimeError> {
    let mut out = String::new();
    let mut chars = format.chars().peekable();
    let mut next_arg = 0usize;
    let mut arg = |next_arg: &mut usize| -> Result<Value, RuntimeError> {
        let value = args.get(*next_arg).cloned().ok_or_else(|| {
            RuntimeError::new(RuntimeErrorKind::InvalidArguments {
                message: "Not enough arguments for format string".to_string(),
            })
        })?;
        *next_arg += 1;
        Ok(value)
    };
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut width = String::new();
        let mut precision = String::new();
        let mut in_precision = false;
        let conv = loop {
            match chars.next() {
                Some(d) if d.is_ascii_digit() => {
                    if in_precision {
                        precision.push(d);
                    } else {
                        width.push(d);
                    }
                }
                Some('.') => in_precision = true,
                Some(c) => break c,
                None => {
                    return Err(RuntimeError::new(RuntimeErrorKind::InvalidArguments {
                        message: "Incomplete format directive".to_string(),
                    }));
                }
            }
        };
        let width: usize = width.parse().unwrap_or(0);
        match conv {
            '%' => out.push('%'),
            's' => {
                let text = arg(&mut next_arg)?.display();
                out.push_str(&format!("{:>width$}", text, width = width));
            }
            'd' => {
                let value = arg(&mut next_arg)?;
                let n = value.to_i64().ok_or_else(|| {
                    RuntimeError::new(RuntimeErrorKind::InvalidArguments {
                        message: format!("%d requires an integer, got {}", value.type_name()),
                    })
                })?;
                out.push_str(&format!("{:>width$}", n, width = width));
            }
            'f' => {
                let value = arg(&mut next_arg)?;
                let n = value.to_f64().ok_or_else(|| {
                    RuntimeError::new(RuntimeErrorKind::InvalidArguments {
                        message: format!("%f requires a number, got {}", value.type_name()),
                    })
                })?;
                let prec: usize = precision.parse().unwrap_or(6);
                out.push_str(&format!("{:>width$.prec$}", n, width = width, prec = prec));
            }
            'x' => {
                let value = arg(&mut next_arg)?;
                let n = value.to_i64().ok_or_else(|| {
                    RuntimeError::new(RuntimeErrorKind::InvalidArguments {
                        message: format!("%x requires an integer, got {}", value.type_name()),
                    })
                })?;
                out.push_str(&format!("{:>width$x}", n, width = width));
            }
            other => {
                return Err(RuntimeError::new(RuntimeErrorKind::InvalidArguments {
                    message: format!("Unknown format directive '%{}'", other),
                }));
            }
        }
    }
    Ok(Value::string(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = HostRegistry::new();
        registry
            .register(HostFunction {
                name: "fetch".to_string(),
                params: vec![HostParam::required("url", Type::Str)],
                return_type: Type::Str,
                is_async: true,
                varargs: false,
                dispatch: None,
            })
            .unwrap();
        assert!(registry.lookup("fetch").is_some());
        assert!(registry.lookup("missing").is_none());
        assert!(registry.get(registry.lookup("fetch").unwrap()).is_async);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = HostRegistry::with_defaults();
        let err = registry.register(HostFunction {
            name: "sleep".to_string(),
            params: vec![],
            return_type: Type::Any,
            is_async: false,
            varargs: false,
            dispatch: None,
        });
        assert!(err.is_err());
    }

    #[test]
    fn test_sprintf() {
        assert_eq!(
            sprintf("x=%d y=%s", &[Value::Int(5), Value::string("ab")])
                .unwrap()
                .display(),
            "x=5 y=ab"
        );
        assert_eq!(
            sprintf("%.2f", &[Value::Double(1.2345)]).unwrap().display(),
            "1.23"
        );
        assert_eq!(sprintf("100%%", &[]).unwrap().display(), "100%");
    }
}
