//! End-to-end execution tests: expressions, control flow, closures,
//! functions, and classes.

mod common;

use common::{run, run_err, run_output};
use rill_engine::{RuntimeErrorKind, Value};

#[test]
fn recursive_factorial() {
    assert_eq!(
        run("def fact(n){ n<=1 ? 1 : n*fact(n-1) }; fact(10)"),
        Value::Int(3628800)
    );
}

#[test]
fn closure_capture_with_mutation() {
    let result = run(
        "def counter(){ int c=0; return { -> ++c } }\n\
         def x = counter(); def y = counter()\n\
         [x(), x(), y()]",
    );
    assert_eq!(result.display(), "[1, 2, 1]");
}

#[test]
fn modulo_boundaries() {
    assert_eq!(run("-5 % 3"), Value::Int(1));
    assert_eq!(run("3 % -5"), Value::Int(-2));
    assert_eq!(run("-3 % -5"), Value::Int(-3));
    // Truncated remainder keeps the dividend's sign
    assert_eq!(run("-5 %% 3"), Value::Int(-2));
}

#[test]
fn arithmetic_promotion() {
    assert_eq!(run("1 + 2L"), Value::Long(3));
    assert_eq!(run("1 + 2.5D"), Value::Double(3.5));
    assert_eq!(run("(1 + 2.5).toString()").display(), "3.5");
    assert_eq!(run("7 / 2"), Value::Int(3));
    assert_eq!(run("(7.0 / 2).toString()").display(), "3.5");
}

#[test]
fn string_operations() {
    assert_eq!(run("'a' + 'b' + 1").display(), "ab1");
    assert_eq!(run("'ab' * 3").display(), "ababab");
    assert_eq!(run("'Hello World'.toUpperCase()").display(), "HELLO WORLD");
    assert_eq!(run("'hello'.substring(1, 3)").display(), "el");
    assert_eq!(run("'a,b,c'.split(',')").display(), "[a, b, c]");
    assert_eq!(run("'hello'.length()"), Value::Int(5));
    assert_eq!(run("'abc'[1]").display(), "b");
    assert_eq!(run("'42' as int"), Value::Int(42));
}

#[test]
fn string_interpolation() {
    assert_eq!(
        run(r#"def name = 'World'; "Hello $name!""#).display(),
        "Hello World!"
    );
    assert_eq!(run(r#"def x = 3; "x squared is ${x * x}""#).display(), "x squared is 9");
}

#[test]
fn lists_and_maps() {
    assert_eq!(run("[1, 2, 3].size()"), Value::Int(3));
    assert_eq!(run("[1, 2] + 3").display(), "[1, 2, 3]");
    assert_eq!(run("def m = [a:1, b:2]; m.a + m.b"), Value::Int(3));
    assert_eq!(run("def m = [:]; m.x = 5; m.x"), Value::Int(5));
    assert_eq!(run("def m = [:]; m.a.b = 1; m.a.b"), Value::Int(1));
    assert_eq!(run("def xs = [1]; xs[3] = 9; xs").display(), "[1, null, null, 9]");
    assert_eq!(run("[1, 2, 3][-1]"), Value::Int(3));
    assert_eq!(run("2 in [1, 2, 3]"), Value::Bool(true));
    assert_eq!(run("4 !in [1, 2, 3]"), Value::Bool(true));
}

#[test]
fn control_flow() {
    assert_eq!(run("def x = 5; if (x > 3) 'big' else 'small'").display(), "null");
    assert_eq!(
        run("def r = ''; if (2 > 1) { r = 'yes' } else { r = 'no' }; r").display(),
        "yes"
    );
    assert_eq!(
        run("def total = 0; for (int i = 1; i <= 4; i++) { total += i }; total"),
        Value::Int(10)
    );
    assert_eq!(
        run("def n = 0; while (true) { n++; break if n >= 3 }; n"),
        Value::Int(3)
    );
    assert_eq!(
        run("def total = 0; for (int i = 0; i < 5; i++) { continue if i % 2 == 0; total += i }; total"),
        Value::Int(4)
    );
}

#[test]
fn postfix_modifiers_and_unless() {
    assert_eq!(run("def x = 1; x = 2 if true; x"), Value::Int(2));
    assert_eq!(run("def x = 1; x = 2 unless true; x"), Value::Int(1));
    assert_eq!(run("unless (false) { 'ok' }\n'done'").display(), "done");
}

#[test]
fn ternary_and_elvis() {
    assert_eq!(run("1 < 2 ? 'a' : 'b'").display(), "a");
    assert_eq!(run("null ?: 'fallback'").display(), "fallback");
    assert_eq!(run("'value' ?: 'fallback'").display(), "value");
    assert_eq!(run("def x; x ?= 5; x"), Value::Int(5));
    assert_eq!(run("def x = 1; x ?= null; x"), Value::Int(1));
}

#[test]
fn null_safe_access() {
    assert_eq!(run("def m; m?.field").display(), "null");
    assert_eq!(run("def m; m?['k']").display(), "null");
    assert_eq!(run("def m; m?.size()").display(), "null");
    let err = run_err("def m; m.field");
    assert!(matches!(err.kind, RuntimeErrorKind::NullValue { .. }));
}

#[test]
fn functions_with_defaults_and_named_args() {
    assert_eq!(
        run("def greet(String name, String greeting = 'Hello') { greeting + ' ' + name }\n\
             greet('Ann')")
        .display(),
        "Hello Ann"
    );
    assert_eq!(
        run("def greet(String name, String greeting = 'Hello') { greeting + ' ' + name }\n\
             greet(name: 'Bob', greeting: 'Hi')")
        .display(),
        "Hi Bob"
    );
    // Defaults may reference earlier parameters
    assert_eq!(
        run("def f(int a, int b = a + 1) { a + b }; f(3)"),
        Value::Int(7)
    );
}

#[test]
fn forward_referenced_functions() {
    assert_eq!(
        run("def isEven(n) { n == 0 ? true : isOdd(n - 1) }\n\
             def isOdd(n) { n == 0 ? false : isEven(n - 1) }\n\
             isEven(10)"),
        Value::Bool(true)
    );
}

#[test]
fn functions_as_values() {
    assert_eq!(run("def twice(f, x) { f(f(x)) }; twice({ it + 3 }, 1)"), Value::Int(7));
    assert_eq!(run("def add(a, b) { a + b }; def g = add; g(2, 3)"), Value::Int(5));
}

#[test]
fn do_blocks_yield_their_last_expression() {
    assert_eq!(run("def x = do { def a = 2; a * 3 }; x"), Value::Int(6));
}

#[test]
fn classes_and_methods() {
    assert_eq!(
        run("class Point { int x; int y; int sum() { x + y } }\n\
             def p = new Point(3, 4)\n\
             p.sum()"),
        Value::Int(7)
    );
    assert_eq!(
        run("class Point { int x = 0; int y = 0 }\n\
             def p = new Point(y: 5)\n\
             p.x + p.y"),
        Value::Int(5)
    );
}

#[test]
fn class_inheritance() {
    assert_eq!(
        run("class A { int a = 1; int val() { a } }\n\
             class B extends A { int b = 2; int total() { val() + b } }\n\
             new B().total()"),
        Value::Int(3)
    );
    // Overridden methods dispatch dynamically
    assert_eq!(
        run("class A { int val() { 1 } }\n\
             class B extends A { int val() { 2 } }\n\
             def f(A x) { x.val() }\n\
             f(new B())"),
        Value::Int(2)
    );
}

#[test]
fn instance_map_conversion() {
    assert_eq!(
        run("class Point { int x; int y }\n\
             def m = new Point(1, 2) as Map\n\
             m.x + m.y"),
        Value::Int(3)
    );
    assert_eq!(
        run("class Point { int x; int y }\n\
             def p = [x: 5, y: 6] as Point\n\
             p.x + p.y"),
        Value::Int(11)
    );
}

#[test]
fn instanceof_checks() {
    assert_eq!(run("5 instanceof int"), Value::Bool(true));
    assert_eq!(run("'a' instanceof String"), Value::Bool(true));
    assert_eq!(run("5 !instanceof String"), Value::Bool(true));
    assert_eq!(
        run("class A {}\nclass B extends A {}\nnew B() instanceof A"),
        Value::Bool(true)
    );
}

#[test]
fn print_output() {
    assert_eq!(run_output("println 'hello'"), "hello\n");
    assert_eq!(run_output("print 'a'; print 'b'"), "ab");
    assert_eq!(run_output("println [1, 2, 3]"), "[1, 2, 3]\n");
}

#[test]
fn die_aborts_with_message() {
    let err = run_err("die 'gave up'");
    assert!(matches!(err.kind, RuntimeErrorKind::Died { .. }));
    assert!(err.to_string().contains("gave up"));
}

#[test]
fn divide_by_zero() {
    let err = run_err("1 / 0");
    assert!(matches!(err.kind, RuntimeErrorKind::DivideByZero));
}

#[test]
fn deep_recursion_overflows() {
    let err = run_err("def f(n) { f(n + 1) }; f(0)");
    assert!(matches!(err.kind, RuntimeErrorKind::StackOverflow));
}

#[test]
fn runtime_errors_carry_location() {
    let err = run_err("def x = 1\ndef y = x / 0\ny");
    let span = err.span.expect("error location");
    assert_eq!(span.line, 2);
}

#[test]
fn identity_vs_equality() {
    assert_eq!(run("[1, 2] == [1, 2]"), Value::Bool(true));
    assert_eq!(run("[1, 2] === [1, 2]"), Value::Bool(false));
    assert_eq!(run("def a = [1]; def b = a; a === b"), Value::Bool(true));
    assert_eq!(run("1 == 1.0D"), Value::Bool(true));
    assert_eq!(run("2 <=> 1"), Value::Int(1));
    assert_eq!(run("'a' <=> 'b'"), Value::Int(-1));
}

#[test]
fn eval_runs_nested_scripts() {
    assert_eq!(run("eval('1 + 2')"), Value::Int(3));
    assert_eq!(
        run("def b = [x: 3]; eval('x * 2', b)"),
        Value::Int(6)
    );
    // Compile errors inside eval surface via $error, not a throw
    assert_eq!(run("def b = [:]; def r = eval('1 +', b); r == null"), Value::Bool(true));
    assert_eq!(run("def b = [:]; eval('1 +', b); b.size()"), Value::Int(1));
}

#[test]
fn sprintf_formats() {
    assert_eq!(run("sprintf('%d-%s', 7, 'x')").display(), "7-x");
}
