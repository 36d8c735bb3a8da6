//! Test doubles for exercising the bridge without a broker

pub mod mocks;

pub use mocks::*;
