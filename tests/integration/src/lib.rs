//! Cross-crate payment flow tests. See `tests/`.
