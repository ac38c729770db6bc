//! Core deterministic primitives.
//!
//! Everything in this module must behave identically on every platform;
//! the desync detector compares this state bit-for-bit across machines.

pub mod rng;

pub use rng::SimulationRng;
