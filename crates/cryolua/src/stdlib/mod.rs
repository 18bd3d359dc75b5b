// Standard library bindings exposed to scripts as named host functions.

pub mod basic;
