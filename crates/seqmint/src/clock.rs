use std::time::{SystemTime, UNIX_EPOCH};

/// A trait for time sources that return wall-clock seconds since the Unix
/// epoch.
///
/// This abstraction allows you to plug in the real system clock or a mocked
/// time source in tests. Second granularity is all the id layout needs: only
/// the civil hour of the timestamp is encoded into an id, and lease expiry is
/// measured in whole seconds.
///
/// # Example
///
/// ```
/// use seqmint::WallClock;
///
/// struct FixedTime;
/// impl WallClock for FixedTime {
///     fn now_seconds(&self) -> u64 {
///         1234
///     }
/// }
///
/// let time = FixedTime;
/// assert_eq!(time.now_seconds(), 1234);
/// ```
pub trait WallClock {
    /// Returns the current time in seconds since the Unix epoch.
    fn now_seconds(&self) -> u64;
}

/// The real system clock.
#[derive(Default, Clone, Copy, Debug)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_seconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("System clock before UNIX_EPOCH")
            .as_secs()
    }
}
