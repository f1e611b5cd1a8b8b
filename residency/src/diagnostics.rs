use std::fmt;

use crate::config::CacheMode;

/// Point in time snapshot of one manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDiagnostics {
    pub name: String,
    pub mode: CacheMode,
    pub resident_size: u64,
    pub budget: Option<u64>,
    /// Registered resources, resident or not
    pub resource_count: usize,
    /// Resident resources the generation table is aging
    pub tracked_count: usize,
    pub operation_count: usize,
    pub idle: bool,
    /// Tracked resources per generation, youngest first
    pub generation_histogram: Vec<usize>,
}

impl CacheDiagnostics {
    pub fn over_budget(&self) -> bool {
        self.budget
            .is_some_and(|budget| self.resident_size > budget)
    }

    /// Fraction of the budget in use
    pub fn utilization(&self) -> Option<f64> {
        match self.budget {
            Some(0) | None => None,
            Some(budget) => Some(self.resident_size as f64 / budget as f64),
        }
    }
}

struct Bytes(u64);

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
        let mut value = self.0 as f64;
        let mut unit = 0;
        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }
        if unit == 0 {
            write!(f, "{} B", self.0)
        } else {
            write!(f, "{value:.1} {}", UNITS[unit])
        }
    }
}

impl fmt::Display for CacheDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.budget {
            Some(budget) => write!(
                f,
                "{} [async]: {} / {} resident",
                self.name,
                Bytes(self.resident_size),
                Bytes(budget)
            )?,
            None => write!(f, "{} [sync]: {} resident", self.name, Bytes(self.resident_size))?,
        }
        write!(
            f,
            ", {} resources ({} tracked), {} pending operations",
            self.resource_count, self.tracked_count, self.operation_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(resident_size: u64, budget: Option<u64>) -> CacheDiagnostics {
        CacheDiagnostics {
            name: String::from("textures"),
            mode: budget.map_or(CacheMode::Sync, |budget| CacheMode::Async { budget }),
            resident_size,
            budget,
            resource_count: 3,
            tracked_count: 2,
            operation_count: 1,
            idle: false,
            generation_histogram: vec![2, 0],
        }
    }

    #[test]
    fn test_over_budget() {
        assert!(snapshot(2048, Some(1024)).over_budget());
        assert!(!snapshot(1024, Some(1024)).over_budget());
        assert!(!snapshot(1 << 40, None).over_budget());
        assert_eq!(snapshot(512, Some(1024)).utilization(), Some(0.5));
        assert_eq!(snapshot(512, None).utilization(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            snapshot(1536, Some(4 << 20)).to_string(),
            "textures [async]: 1.5 KiB / 4.0 MiB resident, 3 resources (2 tracked), 1 pending operations"
        );
        assert_eq!(
            snapshot(12, None).to_string(),
            "textures [sync]: 12 B resident, 3 resources (2 tracked), 1 pending operations"
        );
    }
}
