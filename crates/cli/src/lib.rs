//! Stage wiring for the `diex` binary: the compute stage and the interactive session.
pub mod run;
pub mod session;
