//! Retry policy for tile composition.
//!
//! A multi-layer tile can only be assembled once every source layer
//! has been produced. When a source is still being generated by a
//! concurrent seeding run, the compositor waits and looks again rather
//! than failing; [`RetryPolicy`] bounds how often and how long it
//! waits. Tests inject a zero-delay policy so retry paths run without
//! wall-clock time.

use std::time::Duration;

/// Default number of merge attempts, including the initial one.
pub const DEFAULT_MERGE_ATTEMPTS: u32 = 4;

/// Default pause between merge attempts.
pub const DEFAULT_MERGE_DELAY: Duration = Duration::from_secs(1);

/// How an operation handles sources that are not ready yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Single attempt, no waiting.
    None,

    /// Fixed number of attempts with a constant pause in between.
    Fixed {
        /// Maximum number of attempts (including the initial attempt).
        max_attempts: u32,
        /// Pause between attempts.
        delay: Duration,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::None
    }
}

impl RetryPolicy {
    /// Creates a fixed retry policy.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Maximum number of attempts (including the initial one)
    /// * `delay` - Pause between attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::Fixed {
            max_attempts,
            delay,
        }
    }

    /// The default policy for multi-layer merges: four attempts, one
    /// second apart.
    pub fn merge_default() -> Self {
        Self::fixed(DEFAULT_MERGE_ATTEMPTS, DEFAULT_MERGE_DELAY)
    }

    /// Calculates the pause before the next attempt.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The attempt that just finished (1-based)
    ///
    /// # Returns
    ///
    /// The pause before trying again, or `None` when the budget is
    /// exhausted.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed {
                max_attempts,
                delay,
            } => {
                if attempt < *max_attempts {
                    Some(*delay)
                } else {
                    None
                }
            }
        }
    }

    /// The maximum number of attempts for this policy.
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::Fixed { max_attempts, .. } => *max_attempts,
        }
    }
}
