// Shared plumbing used across the crate: the validated-program wrapper and
// the accumulating error type used to report IR well-formedness problems.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::ops::{AddAssign, Deref};

/// Wraps a value that has passed [`crate::ir::Program::validate`]. Every
/// analysis entry point takes `&Valid<Program>` rather than `&Program`, so a
/// caller cannot run an analysis over an IR graph that hasn't been checked
/// against the collaborator contract (cyclic dominator queries, dangling
/// block references, and the like all get ruled out up front).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Valid<T>(pub T);

impl<T> Deref for Valid<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// A single well-formedness complaint about a `Program`, e.g. a terminal
/// naming a block that doesn't exist in the function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation(pub String);

impl Display for Violation {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.0)
    }
}

/// An accumulating collection of [`Violation`]s produced while validating a
/// `Program`. Checks are run independently and their results combined with
/// `+=` so that validation reports every problem it finds in one pass
/// instead of stopping at the first one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationError {
    violations: Vec<Violation>,
}

impl ValidationError {
    pub fn new() -> Self {
        ValidationError {
            violations: Vec::new(),
        }
    }

    pub fn single(msg: impl Into<String>) -> Self {
        let mut e = ValidationError::new();
        e.violations.push(Violation(msg.into()));
        e
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }
}

impl AddAssign for ValidationError {
    fn add_assign(&mut self, rhs: Self) {
        self.violations.extend(rhs.violations);
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        for v in &self.violations {
            writeln!(f, "{v}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}
