//! Iterative analyses run after the main pass
//!
//! Capture closure: a function that creates a closure (or calls a
//! function) with captures must itself carry every captured cell it does
//! not own, so cells can flow from the declaring frame through all
//! intermediate frames. Async reachability: a function is async iff it
//! can reach an async seed through the call graph. Both iterate to a
//! fixed point; mutual recursion converges because the sets only grow.

use super::error::{ResolveError, ResolveErrorKind};
use super::symbols::CallTarget;
use super::Resolution;

/// Transitively close capture sets, hoist captured variables, and verify
/// the forward-reference rule.
pub(super) fn close_captures(res: &mut Resolution, errors: &mut Vec<ResolveError>) {
    loop {
        let mut changed = false;

        // Nested functions push their captures up to the enclosing
        // function (which materializes their closures)
        for g in 0..res.functions.len() {
            let Some(parent) = res.functions[g].enclosing else {
                continue;
            };
            let needed: Vec<_> = res.functions[g]
                .captures
                .iter()
                .copied()
                .filter(|&v| res.vars[v].owner_fun != parent)
                .collect();
            for v in needed {
                if !res.functions[parent].captures.contains(&v) {
                    res.functions[parent].captures.push(v);
                    changed = true;
                }
            }
        }

        // Callers need the captures of every function they reference
        for f in 0..res.functions.len() {
            let callees = res.functions[f].calls.clone();
            for callee in callees {
                let needed: Vec<_> = res.functions[callee]
                    .captures
                    .iter()
                    .copied()
                    .filter(|&v| res.vars[v].owner_fun != f)
                    .collect();
                for v in needed {
                    if !res.functions[f].captures.contains(&v) {
                        res.functions[f].captures.push(v);
                        changed = true;
                    }
                }
            }
        }

        if !changed {
            break;
        }
    }

    // Deterministic cell ordering: declaration order (var ids are dense
    // and allocated in order)
    for fun in &mut res.functions {
        fun.captures.sort_unstable();
        fun.own_cells.clear();
    }
    for v in 0..res.vars.len() {
        if res.vars[v].is_heap {
            let owner = res.vars[v].owner_fun;
            res.functions[owner].own_cells.push(v);
        }
    }

    // A forward-referenced function may not capture variables declared
    // after the earliest reference to it
    for f in 0..res.functions.len() {
        let Some(forward) = res.functions[f].earliest_forward_ref else {
            continue;
        };
        for &v in &res.functions[f].captures {
            if res.vars[v].decl_span.start > forward.start {
                errors.push(ResolveError::new(
                    ResolveErrorKind::CaptureAfterForwardReference {
                        name: res.vars[v].name.clone(),
                    },
                    res.vars[v].decl_span,
                ));
            }
        }
    }
}

/// Propagate the async property across the call graph and mark async
/// call sites.
pub(super) fn propagate_async(res: &mut Resolution) {
    for fun in &mut res.functions {
        fun.is_async = fun.has_async_seed;
    }
    loop {
        let mut changed = false;
        for f in 0..res.functions.len() {
            if res.functions[f].is_async {
                continue;
            }
            let reaches_async = res.functions[f]
                .calls
                .iter()
                .any(|&callee| res.functions[callee].is_async);
            if reaches_async {
                res.functions[f].is_async = true;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Call sites whose target is (or may be) async are suspension points
    let mut async_nodes = Vec::new();
    for (&node, target) in &res.call_targets {
        let is_async = match target {
            CallTarget::Function(f) => res.functions[*f].is_async,
            CallTarget::Value => true,
            CallTarget::SelfMethod(name) => res
                .classes
                .iter()
                .filter_map(|c| c.methods.get(name))
                .any(|m| res.functions[m.fun].is_async),
            // Host/Eval sites were marked during resolution
            CallTarget::Host(_) | CallTarget::Eval => continue,
        };
        if is_async {
            async_nodes.push(node);
        }
    }
    res.async_calls.extend(async_nodes);
}
