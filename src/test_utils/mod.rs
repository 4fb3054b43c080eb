//! Helpers shared by the unit tests
mod common;
mod mock;

pub(crate) use common::*;
pub(crate) use mock::*;
