//! Core value types of the Goat runtime: object handles, static singletons
//! and the per-kind capability dispatch.

pub mod object;
