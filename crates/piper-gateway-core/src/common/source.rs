use rand::{Rng, rng};
use std::time::{SystemTime, UNIX_EPOCH};

/// A trait for time sources that return a wall-clock timestamp.
///
/// The unit is **milliseconds** since the Unix epoch. Tests plug in a fixed
/// clock to make generated identifiers predictable.
///
/// # Example
///
/// ```
/// use piper_gateway_core::TimeSource;
///
/// struct FixedTime;
/// impl TimeSource<u128> for FixedTime {
///     fn current_millis(&self) -> u128 {
///         1234
///     }
/// }
///
/// assert_eq!(FixedTime.current_millis(), 1234);
/// ```
pub trait TimeSource<T> {
    /// Returns the current time in milliseconds since the Unix epoch.
    fn current_millis(&self) -> T;
}

/// A trait for random sources that return random integers.
pub trait RandSource<T> {
    /// Returns a random integer.
    fn rand(&self) -> T;
}

/// Wall clock backed by [`SystemTime`].
///
/// A clock set before 1970 reports zero rather than failing; the random half
/// of the identifier still carries the uniqueness guarantee.
#[derive(Default, Clone, Copy, Debug)]
pub struct SystemClock;

impl TimeSource<u128> for SystemClock {
    fn current_millis(&self) -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default()
    }
}

/// A `RandSource` that uses the thread-local RNG (`rand::rng()`).
///
/// Each OS thread has its own cryptographically secure generator, so calls
/// from many request tasks at once never contend on a lock. The type stores
/// nothing and is freely `Send + Sync`.
#[derive(Default, Clone, Copy, Debug)]
pub struct ThreadRandom;

impl RandSource<u128> for ThreadRandom {
    fn rand(&self) -> u128 {
        rng().random()
    }
}
