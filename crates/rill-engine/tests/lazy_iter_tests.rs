//! Lazy collection chains: laziness, realization points, and
//! element-wise side-effect ordering.

mod common;

use common::run;
use rill_engine::Value;

#[test]
fn map_filter_collect() {
    assert_eq!(
        run("[1, 2, 3, 4].map{ it * 2 }.filter{ it > 4 }.collect()").display(),
        "[6, 8]"
    );
}

#[test]
fn chains_are_equivalent_to_stepwise_realization() {
    let lazy = run("[1, 2, 3, 4, 5].map{ it * 3 }.filter{ it % 2 == 0 }.collect()");
    let eager = run(
        "def doubled = [1, 2, 3, 4, 5].collect().map{ it * 3 }.collect()\n\
         doubled.filter{ it % 2 == 0 }.collect()",
    );
    assert!(lazy.equals(&eager));
}

#[test]
fn side_effects_are_element_wise() {
    // Effect i happens before snapshot i: the chain pulls one element
    // all the way through before touching the next
    assert_eq!(
        run("def seen = []\n\
             [1, 2].map{ seen.add(it); it }.map{ seen.add(it * 10); it }.collect()\n\
             seen")
        .display(),
        "[1, 10, 2, 20]"
    );
}

#[test]
fn terminal_operations() {
    assert_eq!(run("[1, 2, 3].sum()"), Value::Int(6));
    assert_eq!(run("[3, 1, 2].min()"), Value::Int(1));
    assert_eq!(run("[3, 1, 2].max()"), Value::Int(3));
    assert_eq!(run("[1, 2, 3].join('-')").display(), "1-2-3");
    assert_eq!(run("['a', 'b'].join()").display(), "ab");
    assert_eq!(run("[1, 2, 3].reduce(10){ acc, it -> acc + it }"), Value::Int(16));
    assert_eq!(run("[1, 2, 3].map{ it * 2 }.sum()"), Value::Int(12));
    assert_eq!(run("[1, 2, 3].map{ it }.size()"), Value::Int(3));
    assert_eq!(run("[4, 5].avg().toString()").display(), "4.5");
}

#[test]
fn each_runs_for_every_element() {
    assert_eq!(
        run("def total = 0; [1, 2, 3].each{ total += it }; total"),
        Value::Int(6)
    );
}

#[test]
fn flat_map_flattens_collections() {
    assert_eq!(
        run("[1, 2].flatMap{ [it, it * 10] }.collect()").display(),
        "[1, 10, 2, 20]"
    );
}

#[test]
fn skip_limit_unique_reverse() {
    assert_eq!(run("[1, 2, 3, 4].skip(1).limit(2).collect()").display(), "[2, 3]");
    assert_eq!(run("[1, 2, 1, 3, 2].unique().collect()").display(), "[1, 2, 3]");
    assert_eq!(run("[1, 2, 3].reverse().collect()").display(), "[3, 2, 1]");
}

#[test]
fn sort_with_and_without_comparator() {
    assert_eq!(run("[3, 1, 2].sort()").display(), "[1, 2, 3]");
    assert_eq!(
        run("[3, 1, 2].sort{ a, b -> b <=> a }").display(),
        "[3, 2, 1]"
    );
    assert_eq!(
        run("['bb', 'a', 'ccc'].sort{ a, b -> a.size() <=> b.size() }").display(),
        "[a, bb, ccc]"
    );
}

#[test]
fn iterators_realize_when_stored() {
    // Storing into a variable forces the chain to a list
    assert_eq!(
        run("def xs = [1, 2, 3].map{ it * 2 }; xs instanceof List"),
        Value::Bool(true)
    );
    assert_eq!(
        run("def xs = [1, 2].map{ it + 1 }; xs.size()"),
        Value::Int(2)
    );
}

#[test]
fn iterators_realize_when_printed() {
    assert_eq!(
        common::run_output("println [1, 2].map{ it * 3 }"),
        "[3, 6]\n"
    );
}

#[test]
fn map_entries_iterate_as_pairs() {
    assert_eq!(
        run("[a: 1, b: 2].map{ k, v -> k + v }.collect()").display(),
        "[a1, b2]"
    );
    assert_eq!(
        run("def keys = []; [x: 1, y: 2].each{ it -> keys.add(it[0]) }; keys").display(),
        "[x, y]"
    );
}

#[test]
fn string_iteration() {
    assert_eq!(run("'abc'.map{ it.toUpperCase() }.join()").display(), "ABC");
    assert_eq!(run("'hello'.filter{ it != 'l' }.join()").display(), "heo");
}

#[test]
fn stored_chains_realize_once_and_stay_lists() {
    assert_eq!(
        run("def xs = [1, 2].map{ it }\n\
             def first = xs.size()\n\
             def second = xs.size()\n\
             [first, second]")
        .display(),
        "[2, 2]"
    );
}
