//! Regex support: pattern matching, `g`-modifier iteration state, and
//! the substitution drive
//!
//! Compiled regexes are cached per (pattern, flags) in the VM; the
//! per-site iteration state and capture variables live in frames so
//! they survive suspension. Substitution replacements re-evaluate per
//! match through the drive machinery, so a replacement that suspends is
//! handled like any other closure call.

use crate::compiler::op::RegexFlags;
use crate::error::{RuntimeError, RuntimeErrorKind};
use crate::vm::value::Value;
use regex::{Captures, Regex, RegexBuilder};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Cache of compiled regexes for one VM.
#[derive(Default)]
pub struct RegexCache {
    map: FxHashMap<(String, RegexFlags), Arc<Regex>>,
}

impl RegexCache {
    pub fn get(&mut self, pattern: &str, flags: RegexFlags) -> Result<Arc<Regex>, RuntimeError> {
        if let Some(re) = self.map.get(&(pattern.to_string(), flags)) {
            return Ok(Arc::clone(re));
        }
        let re = build_regex(pattern, flags)?;
        self.map
            .insert((pattern.to_string(), flags), Arc::clone(&re));
        Ok(re)
    }
}

pub fn build_regex(pattern: &str, flags: RegexFlags) -> Result<Arc<Regex>, RuntimeError> {
    RegexBuilder::new(pattern)
        .case_insensitive(flags.case_insensitive)
        .multi_line(flags.multi_line)
        .dot_matches_new_line(flags.dot_matches_newline)
        .build()
        .map(Arc::new)
        .map_err(|e| {
            RuntimeError::new(RuntimeErrorKind::BadRegex {
                message: e.to_string(),
            })
        })
}

/// Capture variables `$0..$N` for a match.
pub fn capture_values(caps: &Captures) -> Vec<Value> {
    (0..caps.len())
        .map(|i| match caps.get(i) {
            Some(m) => Value::string(m.as_str()),
            None => Value::Null,
        })
        .collect()
}

/// Per-call-site state for `subject =~ /pattern/g` in a loop condition:
/// successive evaluations continue from the previous match end until the
/// subject is exhausted (or changes).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GlobalMatchState {
    pub subject: String,
    pub pos: usize,
}

/// State machine behind `s/pattern/replacement/`; the replacement
/// closure runs once per match with that match's capture variables.
#[derive(Debug)]
pub struct SubstState {
    pub subject: String,
    pub pattern: String,
    pub flags: RegexFlags,
    pub global: bool,
    pub closure: Value,
    pub pos: usize,
    pub out: String,
    pub matched: bool,
    pending_match: Option<(usize, usize)>,
    regex: Option<Arc<Regex>>,
}

/// Substitution progress.
#[derive(Debug)]
pub enum SubstStep {
    /// Run the replacement closure with these capture variables
    Call { f: Value, captures: Vec<Value> },
    Done(Value),
    Error(RuntimeError),
}

impl SubstState {
    pub fn new(
        subject: String,
        pattern: String,
        flags: RegexFlags,
        global: bool,
        closure: Value,
    ) -> Self {
        Self {
            subject,
            pattern,
            flags,
            global,
            closure,
            pos: 0,
            out: String::new(),
            matched: false,
            pending_match: None,
            regex: None,
        }
    }

    pub fn step(&mut self) -> SubstStep {
        if self.matched && !self.global {
            self.out.push_str(&self.subject[self.pos..]);
            return SubstStep::Done(Value::string(std::mem::take(&mut self.out)));
        }
        let regex = match &self.regex {
            Some(re) => Arc::clone(re),
            None => match build_regex(&self.pattern, self.flags) {
                Ok(re) => {
                    self.regex = Some(Arc::clone(&re));
                    re
                }
                Err(e) => return SubstStep::Error(e),
            },
        };
        if self.pos > self.subject.len() {
            return SubstStep::Done(Value::string(std::mem::take(&mut self.out)));
        }
        match regex.captures_at(&self.subject, self.pos) {
            Some(caps) => {
                let whole = caps.get(0).expect("group 0 always present");
                self.out.push_str(&self.subject[self.pos..whole.start()]);
                self.pending_match = Some((whole.start(), whole.end()));
                SubstStep::Call {
                    f: self.closure.clone(),
                    captures: capture_values(&caps),
                }
            }
            None => {
                self.out.push_str(&self.subject[self.pos..]);
                self.pos = self.subject.len() + 1;
                SubstStep::Done(Value::string(std::mem::take(&mut self.out)))
            }
        }
    }

    /// Append the replacement produced for the pending match and move
    /// past it (empty matches advance one character to guarantee
    /// progress).
    pub fn deliver(&mut self, replacement: &Value) {
        self.out.push_str(&replacement.display());
        self.matched = true;
        if let Some((start, end)) = self.pending_match.take() {
            if end == start {
                match self.subject[end..].chars().next() {
                    Some(c) => {
                        self.out.push(c);
                        self.pos = end + c.len_utf8();
                    }
                    None => self.pos = self.subject.len() + 1,
                }
            } else {
                self.pos = end;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_values() {
        let re = build_regex(r"(\w+)=(\d+)", RegexFlags::default()).unwrap();
        let caps = re.captures("abc=42").unwrap();
        let values = capture_values(&caps);
        assert_eq!(values[0].display(), "abc=42");
        assert_eq!(values[1].display(), "abc");
        assert_eq!(values[2].display(), "42");
    }

    #[test]
    fn test_subst_without_matches_passes_through() {
        let mut subst = SubstState::new(
            "hello".to_string(),
            r"\d+".to_string(),
            RegexFlags::default(),
            true,
            Value::Null,
        );
        match subst.step() {
            SubstStep::Done(v) => assert_eq!(v.display(), "hello"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_subst_single_match_flow() {
        let mut subst = SubstState::new(
            "a1b".to_string(),
            r"\d".to_string(),
            RegexFlags::default(),
            false,
            Value::Null,
        );
        match subst.step() {
            SubstStep::Call { .. } => {}
            other => panic!("unexpected {:?}", other),
        }
        subst.deliver(&Value::string("X"));
        match subst.step() {
            SubstStep::Done(v) => assert_eq!(v.display(), "aXb"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
