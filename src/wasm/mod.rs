//! WASM bindings for browser audio worklet hosts.
//!
//! Only available with the `wasm` feature enabled.

mod engine;

pub use engine::WasmEngine;
