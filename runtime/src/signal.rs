//! Ctrl+C driven shutdown flag, extracted from the teacher's run-loop
//! (`rt::exec`'s `EXIT` atomic) now that the rest of that loop is gone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::RuntimeError;

#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
	pub fn requested(&self) -> bool {
		self.0.load(Ordering::Relaxed)
	}

	pub fn request(&self) {
		self.0.store(true, Ordering::Relaxed);
	}
}

/// Install a process-wide Ctrl+C handler that sets the returned flag. Only
/// one handler may be installed per process; installing a second one
/// returns an error.
pub fn install() -> Result<ShutdownFlag, RuntimeError> {
	let flag = ShutdownFlag::default();
	let setter = flag.clone();

	ctrlc::set_handler(move || setter.request()).map_err(|err| RuntimeError::Signal(err.to_string()))?;

	Ok(flag)
}
