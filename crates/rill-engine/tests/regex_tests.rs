//! Pattern matching, capture variables, global-match iteration, and
//! substitution.

mod common;

use common::{compile_err, run};
use rill_engine::Value;

#[test]
fn simple_match() {
    assert_eq!(run("'hello' =~ /ell/"), Value::Bool(true));
    assert_eq!(run("'hello' =~ /xyz/"), Value::Bool(false));
    assert_eq!(run("'hello' !~ /xyz/"), Value::Bool(true));
}

#[test]
fn capture_variables() {
    assert_eq!(
        run("'ab=12' =~ /(\\w+)=(\\d+)/ ? $1 + ':' + $2 : 'no'").display(),
        "ab:12"
    );
    assert_eq!(
        run("'ab=12' =~ /(\\w+)=(\\d+)/; $0").display(),
        "ab=12"
    );
}

#[test]
fn case_insensitive_modifier() {
    assert_eq!(run("'HELLO' =~ /hello/i"), Value::Bool(true));
    assert_eq!(run("'HELLO' =~ /hello/"), Value::Bool(false));
}

#[test]
fn global_match_iteration_builds_map() {
    let result = run(
        "def data='AAPL=$151.03, MSFT=$255.29'; def m=[:]\n\
         while (data =~ /(\\w+)=\\$([\\d.]+)/g) { m[$1] = $2 as Decimal }\n\
         m",
    );
    assert_eq!(result.display(), "[AAPL:151.03, MSFT:255.29]");
}

#[test]
fn global_match_counts_occurrences() {
    assert_eq!(
        run("def s = 'a1b2c3'; def n = 0\n\
             while (s =~ /\\d/g) { n++ }\n\
             n"),
        Value::Int(3)
    );
}

#[test]
fn interpolated_pattern() {
    assert_eq!(
        run("def sep = ','; 'a,b' =~ /a${sep}b/"),
        Value::Bool(true)
    );
}

#[test]
fn substitution() {
    assert_eq!(
        run("def s = 'a1b2'; s =~ s/\\d/X/g").display(),
        "aXbX"
    );
    // Non-global replaces only the first occurrence
    assert_eq!(
        run("def s = 'a1b2'; s =~ s/\\d/X/").display(),
        "aXb2"
    );
}

#[test]
fn substitution_with_capture_reference() {
    assert_eq!(
        run("def s = 'x=1,y=2'; s =~ s/(\\w)=/[$1]:/g").display(),
        "[x]:1,[y]:2"
    );
}

#[test]
fn substitution_with_interpolated_replacement() {
    assert_eq!(
        run("def tag = 'N'; def s = 'a1'; s =~ s/\\d/<${tag}>/").display(),
        "a<N>"
    );
}

#[test]
fn only_one_global_match_per_condition() {
    let errors = compile_err(
        "def a = 'x'; def b = 'y'\n\
         while ((a =~ /x/g) && (b =~ /y/g)) { break }",
    );
    assert!(errors.iter().any(|e| e.contains("global regex match")));
}
