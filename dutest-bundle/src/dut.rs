// Copyright (c) The dutest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The device-under-test handle contract.
//!
//! Transport (SSH and friends) lives outside this crate; the planner only
//! needs to know whether the handle is still usable and how to bring it
//! back. The handle is shared across all tests in a batch, and the planner
//! reconnects it on entry to a test if the previous test left it
//! disconnected.

use crate::{errors::DutError, Context};
use std::sync::{Arc, Mutex};

/// A connection to the device under test.
pub trait Dut: Send {
    /// Returns true if the connection is believed to be usable.
    fn connected(&mut self, ctx: &Context) -> bool;

    /// Re-establishes the connection.
    fn reconnect(&mut self, ctx: &Context) -> Result<(), DutError>;
}

/// Shared handle to the batch's DUT connection.
pub type SharedDut = Arc<Mutex<dyn Dut>>;

/// Wraps a [`Dut`] implementation into a shareable handle.
pub fn shared(dut: impl Dut + 'static) -> SharedDut {
    Arc::new(Mutex::new(dut))
}
