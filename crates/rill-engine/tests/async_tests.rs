//! Suspend/resume behavior: ordering, state capture across
//! suspensions, cancellation, and detached continuations.

mod common;

use common::{compile_script, registry_with_fetch, run, run_with_answers};
use indexmap::IndexMap;
use rill_engine::{
    compile, CollectPrint, CompileOptions, Outcome, RuntimeError, RuntimeErrorKind, Value,
};

#[test]
fn two_suspensions_in_source_order() {
    let registry = registry_with_fetch();
    let script = compile(
        "def r = fetch('x://1') + ':' + fetch('x://2'); return r",
        "test",
        &registry,
        CompileOptions::default(),
    )
    .expect("compile");
    let (result, requests) = run_with_answers(
        &script,
        vec![Value::string("A"), Value::string("B")],
    );
    assert_eq!(result.display(), "A:B");
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].0, "fetch");
    assert_eq!(requests[0].1[0].display(), "x://1");
    assert_eq!(requests[1].1[0].display(), "x://2");
}

#[test]
fn heap_hoisted_variable_survives_suspension() {
    let script = compile_script("def i=0; def f={ -> i++ }; sleep(1); f(); i");
    let (result, requests) = run_with_answers(&script, vec![Value::Null]);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "sleep");
    assert_eq!(result, Value::Int(1));
}

#[test]
fn suspension_inside_nested_calls() {
    let script = compile_script(
        "def inner() { sleep(1, 'x') }\n\
         def outer() { inner() + 'y' }\n\
         outer()",
    );
    let (result, requests) = run_with_answers(&script, vec![Value::string("x")]);
    assert_eq!(requests.len(), 1);
    assert_eq!(result.display(), "xy");
}

#[test]
fn suspension_inside_iterator_closure() {
    let script = compile_script("[1, 2, 3].map{ sleep(1, it * 2) }.collect()");
    let (result, requests) = run_with_answers(
        &script,
        vec![Value::Int(2), Value::Int(4), Value::Int(6)],
    );
    assert_eq!(requests.len(), 3);
    assert_eq!(result.display(), "[2, 4, 6]");
}

#[test]
fn cancellation_surfaces_as_failure() {
    let script = compile_script("sleep(1000); 'not reached'");
    let mut out = CollectPrint::default();
    let outcome = script.execute(IndexMap::new(), &mut out);
    let Outcome::Suspend(continuation, _) = outcome else {
        panic!("expected suspension");
    };
    let outcome = script.resume(continuation, Err(RuntimeError::cancelled()), &mut out);
    match outcome {
        Outcome::Failed(error) => {
            assert!(matches!(error.kind, RuntimeErrorKind::Cancelled))
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn resume_with_error_unwinds_from_call_site() {
    let registry = registry_with_fetch();
    let script = compile(
        "def f() { fetch('u') }\nf()",
        "test",
        &registry,
        CompileOptions::default(),
    )
    .expect("compile");
    let mut out = CollectPrint::default();
    let Outcome::Suspend(continuation, _) = script.execute(IndexMap::new(), &mut out) else {
        panic!("expected suspension");
    };
    let error = RuntimeError::new(RuntimeErrorKind::InvalidArguments {
        message: "connection refused".to_string(),
    });
    match script.resume(continuation, Err(error), &mut out) {
        Outcome::Failed(error) => {
            assert!(error.to_string().contains("connection refused"))
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn synchronous_scripts_never_suspend() {
    let script = compile_script("def fact(n){ n<=1 ? 1 : n*fact(n-1) }; fact(10)");
    let mut out = CollectPrint::default();
    match script.execute(IndexMap::new(), &mut out) {
        Outcome::Done(v) => assert_eq!(v, Value::Int(3628800)),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn only_one_suspension_outstanding_at_a_time() {
    let registry = registry_with_fetch();
    let script = compile(
        "def a = fetch('1'); def b = fetch('2'); a + b",
        "test",
        &registry,
        CompileOptions::default(),
    )
    .expect("compile");
    // Side effects are source-ordered across suspensions: the second
    // request is only issued after the first resume
    let mut out = CollectPrint::default();
    let Outcome::Suspend(c1, op1) = script.execute(IndexMap::new(), &mut out) else {
        panic!("expected suspension");
    };
    assert_eq!(op1.args[0].display(), "1");
    let Outcome::Suspend(c2, op2) = script.resume(c1, Ok(Value::string("a")), &mut out) else {
        panic!("expected second suspension");
    };
    assert_eq!(op2.args[0].display(), "2");
    match script.resume(c2, Ok(Value::string("b")), &mut out) {
        Outcome::Done(v) => assert_eq!(v.display(), "ab"),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn continuation_round_trips_through_serialization() {
    let script = compile_script(
        "def i = 10; def f = { -> i += 5 }\n\
         sleep(1)\n\
         f(); i",
    );
    let mut out = CollectPrint::default();
    let Outcome::Suspend(continuation, _) = script.execute(IndexMap::new(), &mut out) else {
        panic!("expected suspension");
    };

    let detached = continuation.detach().expect("detach");
    let json = serde_json::to_string(&detached).expect("serialize");
    let restored: rill_engine::SerializedContinuation =
        serde_json::from_str(&json).expect("deserialize");
    let continuation = script.attach(&restored).expect("attach");

    match script.resume(continuation, Ok(Value::Null), &mut out) {
        Outcome::Done(v) => assert_eq!(v, Value::Int(15)),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn shared_cells_stay_shared_after_round_trip() {
    // Two closures over the same variable must still see one cell after
    // detach/attach
    let script = compile_script(
        "def n = 0\n\
         def inc = { -> n++ }\n\
         def get = { -> n }\n\
         sleep(1)\n\
         inc(); inc(); get()",
    );
    let mut out = CollectPrint::default();
    let Outcome::Suspend(continuation, _) = script.execute(IndexMap::new(), &mut out) else {
        panic!("expected suspension");
    };
    let detached = continuation.detach().expect("detach");
    let continuation = script.attach(&detached).expect("attach");
    match script.resume(continuation, Ok(Value::Null), &mut out) {
        Outcome::Done(v) => assert_eq!(v, Value::Int(2)),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn run_blocking_uses_registered_dispatch() {
    assert_eq!(run("sleep(1, 'done')").display(), "done");
}
