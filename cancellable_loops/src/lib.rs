//! # cancellable_loops
//!
//! Loops that check an abort flag before every item.
//!
//! - [`try_for_each_cancellable`]: sequential, fallible body, reports how far it got.
//! - [`par_map_cancellable`]: parallel map over a Rayon iterator, keeping the input order.
//!
//! ## Example
//!
//! ```
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use cancellable_loops::{try_for_each_cancellable, LoopOutcome};
//!
//! let abort_flag = AtomicBool::new(false);
//! let mut seen = Vec::new();
//! let outcome = try_for_each_cancellable(0..10, &abort_flag, |i| {
//!     seen.push(i);
//!     if i == 2 {
//!         abort_flag.store(true, Ordering::Relaxed);
//!     }
//!     Ok::<(), String>(())
//! })
//! .unwrap();
//!
//! assert_eq!(outcome, LoopOutcome::Aborted { processed: 3 });
//! assert_eq!(seen, vec![0, 1, 2]);
//! ```

use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};

/// How a cancellable loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    Completed { processed: usize },
    Aborted { processed: usize },
}

impl LoopOutcome {
    pub fn processed(&self) -> usize {
        match self {
            LoopOutcome::Completed { processed } | LoopOutcome::Aborted { processed } => {
                *processed
            }
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, LoopOutcome::Aborted { .. })
    }
}

/// Runs `func` on every item until the abort flag is set or `func` fails.
///
/// # Arguments
///
/// * `iter` - Items to process
/// * `abort_flag` - Checked before every item
/// * `func` - Loop body; the first error ends the loop and is returned
///
/// # Returns
///
/// The number of processed items and whether the loop was aborted.
pub fn try_for_each_cancellable<I, F, T, E>(
    iter: I,
    abort_flag: &AtomicBool,
    mut func: F,
) -> Result<LoopOutcome, E>
where
    I: IntoIterator<Item = T>,
    F: FnMut(T) -> Result<(), E>,
{
    let mut processed = 0;
    for item in iter {
        if abort_flag.load(Ordering::Relaxed) {
            return Ok(LoopOutcome::Aborted { processed });
        }
        func(item)?;
        processed += 1;
    }
    Ok(LoopOutcome::Completed { processed })
}

/// Maps `func` over a parallel iterator, keeping the input order.
///
/// # Returns
///
/// `None` if the abort flag was set before every item was processed.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::AtomicBool;
/// use cancellable_loops::par_map_cancellable;
///
/// let abort_flag = AtomicBool::new(false);
/// let squares = par_map_cancellable(vec![1, 2, 3], &abort_flag, |i| i * i);
/// assert_eq!(squares, Some(vec![1, 4, 9]));
/// ```
pub fn par_map_cancellable<I, F, R>(iter: I, abort_flag: &AtomicBool, func: F) -> Option<Vec<R>>
where
    I: IntoParallelIterator,
    I::Iter: IndexedParallelIterator,
    F: Fn(I::Item) -> R + Sync + Send,
    R: Send,
{
    iter.into_par_iter()
        .map(|item| {
            if abort_flag.load(Ordering::Relaxed) {
                None
            } else {
                Some(func(item))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_loop_counts_items() {
        let flag = AtomicBool::new(false);
        let mut sum = 0;
        let outcome = try_for_each_cancellable(1..=4, &flag, |i| {
            sum += i;
            Ok::<(), ()>(())
        })
        .unwrap();
        assert_eq!(outcome, LoopOutcome::Completed { processed: 4 });
        assert_eq!(sum, 10);
    }

    #[test]
    fn test_error_stops_loop() {
        let flag = AtomicBool::new(false);
        let result = try_for_each_cancellable(0..5, &flag, |i| if i == 3 { Err(i) } else { Ok(()) });
        assert_eq!(result, Err(3));
    }

    #[test]
    fn test_preset_flag_skips_everything() {
        let flag = AtomicBool::new(true);
        let outcome = try_for_each_cancellable(0..5, &flag, |_| Ok::<(), ()>(())).unwrap();
        assert!(outcome.is_aborted());
        assert_eq!(outcome.processed(), 0);
        assert_eq!(par_map_cancellable(0..5usize, &flag, |i| i), None);
    }
}
