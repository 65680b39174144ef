use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Pool occupancy statistics. A monoid under addition; ordered so that
/// sparser pools come first. All sizes in bytes.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct OccupancyStats {
    free_space: usize,
    total_space: usize,
}

impl OccupancyStats {
    pub fn new(free_space: usize, total_space: usize) -> Self {
        OccupancyStats {
            free_space,
            total_space,
        }
    }

    pub fn used_space(&self) -> usize {
        self.total_space - self.free_space
    }

    pub fn free_space(&self) -> usize {
        self.free_space
    }

    pub fn total_space(&self) -> usize {
        self.total_space
    }

    pub fn used_fraction(&self) -> f64 {
        if self.total_space == 0 {
            0.0
        } else {
            self.used_space() as f64 / self.total_space as f64
        }
    }

    pub fn is_populated(&self) -> bool {
        self.total_space > 0
    }
}

impl PartialOrd for OccupancyStats {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.used_fraction().partial_cmp(&other.used_fraction())
    }
}

impl AddAssign for OccupancyStats {
    fn add_assign(&mut self, other: Self) {
        self.total_space += other.total_space;
        self.free_space += other.free_space;
    }
}

impl SubAssign for OccupancyStats {
    fn sub_assign(&mut self, other: Self) {
        self.total_space -= other.total_space;
        self.free_space -= other.free_space;
    }
}

impl Add for OccupancyStats {
    type Output = Self;
    fn add(mut self, other: Self) -> Self {
        self += other;
        self
    }
}

impl Sub for OccupancyStats {
    type Output = Self;
    fn sub(mut self, other: Self) -> Self {
        self -= other;
        self
    }
}

impl fmt::Display for OccupancyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2}%, {} / {} [B]",
            self.used_fraction() * 100.0,
            self.used_space(),
            self.total_space()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monoid_ops() {
        let a = OccupancyStats::new(10, 100);
        let b = OccupancyStats::new(5, 50);
        let sum = a + b;
        assert_eq!(sum.free_space(), 15);
        assert_eq!(sum.total_space(), 150);
        assert_eq!(sum - b, a);
    }

    #[test]
    fn sparser_orders_first() {
        let sparse = OccupancyStats::new(80, 100);
        let dense = OccupancyStats::new(10, 100);
        assert!(sparse < dense);
        assert_eq!(OccupancyStats::default().used_fraction(), 0.0);
    }
}
