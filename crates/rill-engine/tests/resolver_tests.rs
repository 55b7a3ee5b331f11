//! Semantic errors: scoping, capture rules, class checks, and
//! declaration validation.

mod common;

use common::{compile_err, run};
use rill_engine::Value;

#[test]
fn unknown_variable() {
    let errors = compile_err("def f() { missing + 1 }; f()");
    assert!(errors.iter().any(|e| e.contains("Unknown variable 'missing'")));
}

#[test]
fn unknown_function() {
    let errors = compile_err("frobnicate(1)");
    assert!(errors.iter().any(|e| e.contains("Unknown function 'frobnicate'")));
}

#[test]
fn duplicate_declaration_in_same_scope() {
    let errors = compile_err("def x = 1; def x = 2");
    assert!(errors.iter().any(|e| e.contains("already declared")));
}

#[test]
fn shadowing_in_nested_block_is_allowed() {
    assert_eq!(
        run("def x = 1; if (true) { def x = 2 }; x"),
        Value::Int(1)
    );
}

#[test]
fn closure_initializer_cannot_reference_its_own_variable() {
    let errors = compile_err("def f = { -> f() }");
    assert!(errors.iter().any(|e| e.contains("Unknown")));
}

#[test]
fn named_functions_may_be_mutually_recursive() {
    assert_eq!(
        run("def a(n) { n <= 0 ? 0 : b(n - 1) }\n\
             def b(n) { a(n) + 1 }\n\
             a(3)"),
        Value::Int(3)
    );
}

#[test]
fn capture_after_forward_reference_is_rejected() {
    let errors = compile_err(
        "def f() { g() }\n\
         f()\n\
         def later = 42\n\
         def g() { later }",
    );
    assert!(errors
        .iter()
        .any(|e| e.contains("declared after forward reference")));
}

#[test]
fn forward_reference_before_capture_declaration_is_fine() {
    assert_eq!(
        run("def later = 42\n\
             def f() { g() }\n\
             def g() { later }\n\
             f()"),
        Value::Int(42)
    );
}

#[test]
fn break_and_continue_need_a_loop() {
    let errors = compile_err("break");
    assert!(errors.iter().any(|e| e.contains("inside a loop")));
    let errors = compile_err("def f() { continue }; f()");
    assert!(errors.iter().any(|e| e.contains("inside a loop")));
}

#[test]
fn final_variables_cannot_be_reassigned() {
    let errors = compile_err("final def x = 1; x = 2");
    assert!(errors.iter().any(|e| e.contains("final")));
}

#[test]
fn cyclic_inheritance_is_rejected() {
    let errors = compile_err("class A extends B {}\nclass B extends A {}");
    assert!(errors.iter().any(|e| e.contains("Cyclic inheritance")));
}

#[test]
fn final_method_override_is_rejected() {
    let errors = compile_err(
        "class A { final int val() { 1 } }\n\
         class B extends A { int val() { 2 } }",
    );
    assert!(errors.iter().any(|e| e.contains("final method")));
}

#[test]
fn unknown_class() {
    let errors = compile_err("def x = new Missing()");
    assert!(errors.iter().any(|e| e.contains("Unknown class 'Missing'")));
}

#[test]
fn unknown_field_on_known_class() {
    let errors = compile_err("class P { int x }\nnew P(1).y");
    assert!(errors.iter().any(|e| e.contains("Unknown field 'y'")));
}

#[test]
fn classes_only_at_top_level_or_nested_in_classes() {
    let errors = compile_err("def f() { class Inner {} }; f()");
    assert!(errors.iter().any(|e| e.contains("top level")));
}

#[test]
fn inner_classes_resolve_by_dotted_name() {
    assert_eq!(
        run("class Outer { class Inner { int v = 7 } }\n\
             new Outer.Inner().v"),
        Value::Int(7)
    );
}

#[test]
fn wrong_argument_count() {
    let errors = compile_err("def f(a, b) { a + b }; f(1, 2, 3)");
    assert!(errors.iter().any(|e| e.contains("Wrong number of arguments")));
}

#[test]
fn missing_mandatory_named_argument() {
    let errors = compile_err("def f(a, b = 2) { a + b }; f(b: 1)");
    assert!(errors.iter().any(|e| e.contains("Missing value")));
}

#[test]
fn unknown_named_argument() {
    let errors = compile_err("def f(a) { a }; f(wrong: 1)");
    assert!(errors.iter().any(|e| e.contains("no parameter named")));
}

#[test]
fn var_requires_initializer() {
    let errors = compile_err("var x");
    assert!(errors.iter().any(|e| e.contains("initializer")));
}

#[test]
fn var_infers_from_initializer() {
    // A long-typed inference rejects an int-narrowing reassignment path
    assert_eq!(run("var x = 2L; x = 3L; x"), Value::Long(3));
    let errors = compile_err("var s = 'text'; s = 42");
    assert!(errors.iter().any(|e| e.contains("Type mismatch")));
}

#[test]
fn type_mismatch_in_declaration() {
    let errors = compile_err("int x = 'text'");
    assert!(errors.iter().any(|e| e.contains("Type mismatch")));
}

#[test]
fn multiple_errors_are_collected() {
    let errors = compile_err("def x = missing1\ndef y = missing2");
    assert!(errors.len() >= 2);
}

#[test]
fn mandatory_constructor_fields_enforced_at_runtime() {
    let err = common::run_err("class P { int x; int y = 0 }\nnew P()");
    assert!(err.to_string().contains("Missing mandatory field 'x'"));
}

#[test]
fn resolution_is_deterministic() {
    // Resolving is a pure function of the AST: side tables keyed by
    // node id, no mutation of the tree, so repeated runs agree
    let source = "def f(x, y = 1) { x + y }\nclass P { int a = 0 }\nf(2) + new P().a";
    let registry = std::sync::Arc::new(rill_engine::HostRegistry::with_defaults());
    let tokens = rill_engine::parser::Lexer::new(source).tokenize().unwrap();
    let script = rill_engine::parser::Parser::new(tokens)
        .parse_script("test", rill_engine::LoopMode::Off)
        .unwrap();
    let options = rill_engine::resolver::ResolveOptions::default();
    let first = rill_engine::resolver::resolve(&script, &registry, &options).unwrap();
    let second = rill_engine::resolver::resolve(&script, &registry, &options).unwrap();
    assert_eq!(format!("{:?}", first), format!("{:?}", second));
}

#[test]
fn single_list_argument_spreads() {
    assert_eq!(
        run("def add(a, b) { a + b }; def args = [3, 4]; add(args)"),
        Value::Int(7)
    );
}
