//! Cross-module integration tests: end-to-end planning scenarios,
//! determinism and replay properties.

mod helpers;

mod scenarios;
