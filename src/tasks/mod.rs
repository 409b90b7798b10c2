// FieldVault — Background task scheduling
//
// Re-encryption, maintenance and retention sweeps run as detached tasks.
// They are registered here instead of being spawned ad hoc so they can be
// cancelled per session, stopped at shutdown, and awaited in tests.

mod scheduler;

pub use scheduler::{TaskHandle, TaskScheduler, TaskScope};
