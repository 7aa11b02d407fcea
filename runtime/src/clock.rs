//! Plain clock helpers. The teacher's equivalent read time off a Stakker
//! `Core`; there is no such core here, so these go straight to `std::time`.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current UNIX time in seconds, truncated to 32 bits as RFC 3080's
/// greeting timestamps do.
pub fn unix() -> u32 {
	let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).expect("current time should be after the UNIX epoch");

	since_epoch.as_secs().try_into().expect("32-bit UNIX time should not overflow until 2106")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unix_time_is_plausible() {
		// Some time after this file was written, well before u32 rolls over.
		assert!(unix() > 1_700_000_000);
	}
}
