//! Phase ordering for steps that run several plugins in sequence.

/// Ordering used when a phase does not set `order`.
pub const DEFAULT_ORDER: i64 = 50;
/// Implicit multihost phase (role variables and `/etc/hosts`).
pub const ORDER_MULTIHOST: i64 = 30;
/// Implicit installation of packages required by discovered tests.
pub const ORDER_REQUIRES: i64 = 70;
/// Implicit installation of packages recommended by discovered tests.
pub const ORDER_RECOMMENDS: i64 = 75;

/// Stable-sort `items` by ascending order value; ties keep configuration order.
pub fn sort_phases<T>(items: &mut [T], order: impl Fn(&T) -> i64) {
    items.sort_by_key(|item| order(item));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorts_by_order_then_config_index() {
        let mut phases = vec![("a", 50), ("b", 40), ("c", 50), ("d", 70), ("e", 40)];
        sort_phases(&mut phases, |(_, order)| *order);
        let names: Vec<&str> = phases.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, vec!["b", "e", "a", "c", "d"]);
    }

    #[test]
    fn implicit_phases_follow_defaults() {
        assert!(ORDER_MULTIHOST < DEFAULT_ORDER);
        assert!(DEFAULT_ORDER < ORDER_REQUIRES);
        assert!(ORDER_REQUIRES < ORDER_RECOMMENDS);
    }
}
