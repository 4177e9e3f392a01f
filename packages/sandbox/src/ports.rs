// ABOUTME: Host port allocation for session containers
// ABOUTME: Linear scan over the configured range, skipping ports held by live containers

use crate::error::{Result, SandboxError};
use sandcastle_config::PortRange;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy)]
pub struct PortManager {
    range: PortRange,
}

impl PortManager {
    pub fn new(range: PortRange) -> Self {
        Self { range }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Pick a `(client, server)` pair of distinct ports not present in `in_use`.
    ///
    /// Callers must hold whatever lock guards `in_use` until the returned ports are
    /// recorded, otherwise two allocations can race to the same pair.
    pub fn find_two_available_ports(&self, in_use: &HashSet<u16>) -> Result<(u16, u16)> {
        let client = self.first_free(in_use, None)?;
        let server = self.first_free(in_use, Some(client))?;
        Ok((client, server))
    }

    fn first_free(&self, in_use: &HashSet<u16>, exclude: Option<u16>) -> Result<u16> {
        self.range
            .iter()
            .find(|port| !in_use.contains(port) && Some(*port) != exclude)
            .ok_or(SandboxError::PortExhausted {
                start: self.range.start,
                end: self.range.end,
            })
    }
}
