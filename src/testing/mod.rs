//! Test-only support code, compiled for unit and integration tests.

pub mod mocks;
