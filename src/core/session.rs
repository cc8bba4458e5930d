// This module provides the arena-backed compilation session used while lowering one codelet.
// CompilationSession owns a reference to a bumpalo arena and interns every symbol name the
// code generator produces (helper specialisations, string constants) into it through a
// hashbrown set that itself lives in the arena, so repeated names share one allocation for
// the lifetime of the compile. SessionStats records what was emitted: functions,
// instructions, helper specialisations and a per-intrinsic breakdown, and is logged at debug
// level when the code generator finishes.

//! Arena-based compilation session management.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;

use bumpalo::Bump;
use hashbrown::{DefaultHashBuilder, HashSet};

/// Arena-based compilation session.
///
/// All interned names share the arena lifetime, so lowering code can hold
/// `&'arena str` symbol names without cloning.
pub struct CompilationSession<'arena> {
    arena: &'arena Bump,
    stats: RefCell<SessionStats>,
    interned: RefCell<HashSet<&'arena str, DefaultHashBuilder, &'arena Bump>>,
    current_function: RefCell<Option<&'arena str>>,
}

impl<'arena> CompilationSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            interned: RefCell::new(HashSet::new_in(arena)),
            current_function: RefCell::new(None),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut interned = self.interned.borrow_mut();
        if let Some(&existing) = interned.get(s) {
            return existing;
        }
        let stored: &'arena str = self.arena.alloc_str(s);
        interned.insert(stored);
        stored
    }

    pub fn set_current_function(&self, name: &str) {
        let name = self.intern_str(name);
        *self.current_function.borrow_mut() = Some(name);
    }

    pub fn current_function(&self) -> Option<&'arena str> {
        *self.current_function.borrow()
    }

    /// Record that a function body was emitted.
    pub fn record_function_emitted(&self, name: &str, instructions: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.functions_emitted += 1;
        if stats.largest_function_size < instructions {
            stats.largest_function_size = instructions;
            stats.largest_function_name = name.to_string();
        }
    }

    pub fn record_instruction(&self) {
        self.stats.borrow_mut().instructions_emitted += 1;
    }

    pub fn record_specialization(&self) {
        self.stats.borrow_mut().specializations += 1;
    }

    pub fn record_intrinsic(&self, name: &str) {
        *self
            .stats
            .borrow_mut()
            .intrinsic_counts
            .entry(name.to_string())
            .or_insert(0) += 1;
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Statistics of one compilation session.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub functions_emitted: usize,
    pub instructions_emitted: usize,
    pub specializations: usize,
    pub intrinsic_counts: BTreeMap<String, usize>,
    /// Largest function emitted, in instructions.
    pub largest_function_size: usize,
    pub largest_function_name: String,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Functions emitted: {}", self.functions_emitted)?;
        writeln!(f, "  Instructions emitted: {}", self.instructions_emitted)?;
        writeln!(f, "  Helper specializations: {}", self.specializations)?;

        if !self.largest_function_name.is_empty() {
            writeln!(
                f,
                "  Largest function: {} ({} instructions)",
                self.largest_function_name, self.largest_function_size
            )?;
        }

        if !self.intrinsic_counts.is_empty() {
            writeln!(f, "  Intrinsics:")?;
            for (name, count) in &self.intrinsic_counts {
                writeln!(f, "    {}: {}", name, count)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_same_slice() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let a = session.intern_str("scale.f32");
        let b = session.intern_str("scale.f32");
        assert!(std::ptr::eq(a, b));
        assert_ne!(session.intern_str("scale.u32"), a);
    }

    #[test]
    fn statistics_display() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        session.set_current_function("_ZN3Foo7computeEv");
        session.record_instruction();
        session.record_instruction();
        session.record_intrinsic("urand32");
        session.record_function_emitted("_ZN3Foo7computeEv", 2);

        assert_eq!(session.current_function(), Some("_ZN3Foo7computeEv"));
        let output = session.stats().to_string();
        assert!(output.contains("Functions emitted: 1"));
        assert!(output.contains("Instructions emitted: 2"));
        assert!(output.contains("urand32: 1"));
        assert!(output.contains("_ZN3Foo7computeEv (2 instructions)"));
    }
}
