//! Cross-crate integration tests live in `tests/`; shared fixtures here.
