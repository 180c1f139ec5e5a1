/// Version string embedded in internal assertion failures.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Panics with a Firestore-styled internal assertion message when the condition is false.
///
/// Used for invariants whose violation means the local cache is inconsistent;
/// the failure must never be swallowed.
#[track_caller]
pub fn hard_assert(condition: bool, message: impl AsRef<str>) {
    if !condition {
        fail(message);
    }
}

/// Unconditionally aborts with an internal assertion failure.
#[track_caller]
pub fn fail(message: impl AsRef<str>) -> ! {
    panic!("{}", assertion_error(message));
}

/// Builds the message used for internal assertion failures.
pub fn assertion_error(message: impl AsRef<str>) -> String {
    format!(
        "FIRESTORE ({}) INTERNAL ASSERT FAILED: {}",
        SDK_VERSION,
        message.as_ref()
    )
}
