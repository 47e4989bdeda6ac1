//! AC Phase-Current and DC Fast-Charge command controllers (§4.5, §4.6).

pub mod ac;
pub mod dc;
