use crate::error::{IndexError, Result};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Why a population failed. Kept by the failed behavior so later
/// `validate`/`activate` calls report the original cause.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexPopulationFailure {
    cause: IndexError,
}

impl IndexPopulationFailure {
    pub fn new(cause: IndexError) -> Self {
        // A conflict wrapped by a population error is the real failure
        let cause = match cause.root_conflict() {
            Some(conflict) => conflict.clone(),
            None => cause,
        };
        Self { cause }
    }

    pub fn cause(&self) -> &IndexError {
        &self.cause
    }

    pub fn as_string(&self) -> String {
        self.cause.to_string()
    }
}

/// Runs a collaborator call, turning a panic into a populator error so it
/// can fail the target that raised it.
pub(crate) fn catch_panic<T>(call: impl FnOnce() -> Result<T>) -> Result<T> {
    catch_unwind(AssertUnwindSafe(call))
        .unwrap_or_else(|panic| Err(IndexError::Populator(panic_message(panic))))
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_becomes_populator_error() {
        let err = catch_panic::<()>(|| panic!("boom")).unwrap_err();
        assert_eq!(err, IndexError::Populator("panicked: boom".into()));
        let err = catch_panic::<()>(|| panic!("{}", String::from("bang"))).unwrap_err();
        assert_eq!(err, IndexError::Populator("panicked: bang".into()));
        assert_eq!(catch_panic(|| Ok(3)).unwrap(), 3);
        assert_eq!(
            panic_message(Box::new(3)),
            "panicked"
        );
    }

    #[test]
    fn test_failure_unwraps_conflict() {
        let conflict = IndexError::EntryConflict {
            index: 1,
            values: "[1]".into(),
            existing: 1,
            added: 2,
        };
        let failure = IndexPopulationFailure::new(IndexError::PopulationFailed {
            index: 1,
            cause: Box::new(conflict.clone()),
        });
        assert_eq!(failure.cause(), &conflict);
        assert!(failure.as_string().contains("entry conflict"));
    }
}
