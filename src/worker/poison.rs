//! Poison-message detection for workers.
//!
//! A request that keeps failing is redelivered forever unless something stops
//! it. These pure functions decide when a delivery has been seen too often
//! and where it is parked instead.
//!
//! **Key Functions**:
//! - `exceeds_max_deliveries()` - Decide whether a delivery is poison
//! - `quarantine_queue()` - Name of the queue poison messages are moved to

/// Whether a delivery has been handed out more often than allowed.
///
/// `delivery_count` includes the current delivery. `None` disables the check.
///
/// # Examples
/// ```
/// use brokermr::worker::poison::exceeds_max_deliveries;
///
/// assert!(!exceeds_max_deliveries(5, Some(5)));
/// assert!(exceeds_max_deliveries(6, Some(5)));
/// assert!(!exceeds_max_deliveries(1_000, None));
/// ```
pub fn exceeds_max_deliveries(delivery_count: u32, max_deliveries: Option<u32>) -> bool {
    max_deliveries
        .map(|max| delivery_count > max)
        .unwrap_or(false)
}

/// Queue receiving poison messages of a computation.
///
/// # Examples
/// ```
/// use brokermr::worker::poison::quarantine_queue;
///
/// assert_eq!(
///     quarantine_queue("brokermr.sum_of_squares", ".quarantine"),
///     "brokermr.sum_of_squares.quarantine"
/// );
/// ```
pub fn quarantine_queue(routing_key: &str, suffix: &str) -> String {
    format!("{}{}", routing_key, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_delivery_is_never_poison() {
        assert!(!exceeds_max_deliveries(1, Some(1)));
        assert!(exceeds_max_deliveries(2, Some(1)));
    }
}
