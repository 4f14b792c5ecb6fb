#![warn(clippy::all, rust_2018_idioms)]

pub mod engine;

pub use engine::{AccessType, Engine, GuestBus, GuestMemoryError, InjectionSite};
