use crate::types::{BoxError, ExecutionFailure};
use core::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_owned(),
            Err(_) => "Box<dyn Any>".to_owned(),
        },
    }
}

/// Runs a work source bookkeeping hook, turning both returned errors and
/// panics into an [`ExecutionFailure`].
pub(crate) fn guard_bookkeeping<R>(
    hook: impl FnOnce() -> Result<R, BoxError>,
) -> Result<R, ExecutionFailure> {
    match panic::catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(ExecutionFailure::bookkeeping(error)),
        Err(payload) => Err(ExecutionFailure::Panicked(panic_message(payload))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_rendered() {
        let err = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(err), "static");
        let err = panic::catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(panic_message(err), "formatted 7");
    }

    #[test]
    fn bookkeeping_errors_and_panics_become_failures() {
        assert_eq!(guard_bookkeeping(|| Ok(3)).unwrap(), 3);
        assert!(matches!(
            guard_bookkeeping::<()>(|| Err("unknown node".into())),
            Err(ExecutionFailure::Bookkeeping(_))
        ));
        assert!(matches!(
            guard_bookkeeping::<()>(|| panic!("corrupt")),
            Err(ExecutionFailure::Panicked(message)) if message == "corrupt"
        ));
    }
}
