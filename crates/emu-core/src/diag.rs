//! Per-space access diagnostics.

/// Saturating counters of unmapped accesses seen by one address space.
///
/// Counted whenever an access reaches the unmapped handler outside a debugger peek, whether or
/// not the space emits log records for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct SpaceDiagnostics {
    /// Native-unit reads that hit the unmapped handler.
    pub unmapped_reads: u32,
    /// Native-unit writes that hit the unmapped handler.
    pub unmapped_writes: u32,
}

impl SpaceDiagnostics {
    /// Records one unmapped read.
    #[must_use]
    pub const fn with_unmapped_read(self) -> Self {
        Self {
            unmapped_reads: self.unmapped_reads.saturating_add(1),
            ..self
        }
    }

    /// Records one unmapped write.
    #[must_use]
    pub const fn with_unmapped_write(self) -> Self {
        Self {
            unmapped_writes: self.unmapped_writes.saturating_add(1),
            ..self
        }
    }

    /// Total unmapped accesses of either kind.
    #[must_use]
    pub const fn total(self) -> u64 {
        self.unmapped_reads as u64 + self.unmapped_writes as u64
    }
}

#[cfg(test)]
mod tests {
    use super::SpaceDiagnostics;

    #[test]
    fn counters_saturate() {
        let diag = SpaceDiagnostics {
            unmapped_reads: u32::MAX,
            unmapped_writes: 0,
        };
        let diag = diag.with_unmapped_read().with_unmapped_write();
        assert_eq!(diag.unmapped_reads, u32::MAX);
        assert_eq!(diag.unmapped_writes, 1);
        assert_eq!(diag.total(), u64::from(u32::MAX) + 1);
    }
}
