//! Shared helpers for the integration tests.

use indexmap::IndexMap;
use rill_engine::{
    compile, CollectPrint, CompileOptions, CompiledScript, HostFunction, HostParam, HostRegistry,
    Outcome, RuntimeError, Type, Value,
};
use std::sync::Arc;

/// Compile a script against the default registry.
pub fn compile_script(source: &str) -> CompiledScript {
    let registry = Arc::new(HostRegistry::with_defaults());
    compile(source, "test", &registry, CompileOptions::default())
        .unwrap_or_else(|e| panic!("compile failed:\n{}", e.render(source)))
}

/// Run to completion (blocking async dispatch) and return the value.
pub fn run(source: &str) -> Value {
    let script = compile_script(source);
    let mut out = CollectPrint::default();
    script
        .run_blocking(IndexMap::new(), &mut out)
        .unwrap_or_else(|e| panic!("script failed: {}", e))
}

/// Run and return the script's printed output.
#[allow(dead_code)]
pub fn run_output(source: &str) -> String {
    let script = compile_script(source);
    let mut out = CollectPrint::default();
    script
        .run_blocking(IndexMap::new(), &mut out)
        .unwrap_or_else(|e| panic!("script failed: {}", e));
    out.output
}

/// Run expecting a runtime error.
#[allow(dead_code)]
pub fn run_err(source: &str) -> RuntimeError {
    let script = compile_script(source);
    let mut out = CollectPrint::default();
    match script.run_blocking(IndexMap::new(), &mut out) {
        Ok(v) => panic!("expected runtime error, got {}", v.display()),
        Err(e) => e,
    }
}

/// Compile expecting errors; returns their messages.
#[allow(dead_code)]
pub fn compile_err(source: &str) -> Vec<String> {
    let registry = Arc::new(HostRegistry::with_defaults());
    match compile(source, "test", &registry, CompileOptions::default()) {
        Ok(_) => panic!("expected compile error for: {}", source),
        Err(errors) => errors.errors.into_iter().map(|e| e.message).collect(),
    }
}

/// A registry with an async `fetch(url)` the host must perform itself.
#[allow(dead_code)]
pub fn registry_with_fetch() -> Arc<HostRegistry> {
    let mut registry = HostRegistry::with_defaults();
    registry
        .register(HostFunction {
            name: "fetch".to_string(),
            params: vec![HostParam::required("url", Type::Str)],
            return_type: Type::Str,
            is_async: true,
            varargs: false,
            dispatch: None,
        })
        .expect("fetch registration");
    Arc::new(registry)
}

/// Drive a script by hand, answering every suspension from `answers` in
/// order; returns the final value and the async requests observed.
#[allow(dead_code)]
pub fn run_with_answers(
    script: &CompiledScript,
    answers: Vec<Value>,
) -> (Value, Vec<(String, Vec<Value>)>) {
    let mut out = CollectPrint::default();
    let mut requests = Vec::new();
    let mut answers = answers.into_iter();
    let mut outcome = script.execute(IndexMap::new(), &mut out);
    loop {
        match outcome {
            Outcome::Done(value) => return (value, requests),
            Outcome::Failed(error) => panic!("script failed: {}", error),
            Outcome::Suspend(continuation, op) => {
                requests.push((op.function.clone(), op.args.clone()));
                let answer = answers.next().expect("more suspensions than answers");
                outcome = script.resume(continuation, Ok(answer), &mut out);
            }
        }
    }
}
