//! Master protocol: the messages a region server exchanges with its
//! master, the client trait the transport implements, and the outbound
//! report buffer.
//!
//! The server never calls the master directly; it accumulates reports and
//! ships them with the next heartbeat, receiving instructions back. The
//! wire transport is out of scope: `MasterClient` is implemented by an RPC
//! stub in a deployment and by an in-memory mock in tests.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::catalog::RegionInfo;
use crate::error::Result;

/// Load figures carried with every report.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLoad {
    pub requests: u64,
    pub regions: u64,
}

/// Identity and load of one region server incarnation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub address: String,
    /// Changes every time the region service (re)starts.
    pub start_code: u64,
    pub load: ServerLoad,
}

/// Events the server reports to the master.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Report {
    Open(RegionInfo),
    Close(RegionInfo),
    /// The named parent split; the children arrive as `Open` reports. The
    /// catalog update is authoritative, this report is a hint.
    Split(RegionInfo),
    Exiting,
}

/// Instructions the master sends back on a heartbeat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    Open(RegionInfo),
    Close(RegionInfo),
    CloseWithoutReport(RegionInfo),
    Stop,
    /// Restart the region service (new WAL, new start code) while keeping
    /// the process alive.
    CallServerStartup,
}

/// The master-side RPC surface this server consumes.
#[async_trait::async_trait]
pub trait MasterClient: Send + Sync {
    /// Startup handshake; the returned map overrides local configuration.
    async fn region_server_startup(&self, info: ServerInfo) -> Result<HashMap<String, String>>;

    /// Heartbeat: deliver accumulated reports, receive instructions.
    async fn region_server_report(
        &self,
        info: ServerInfo,
        reports: Vec<Report>,
    ) -> Result<Vec<Instruction>>;
}

/// Reports buffered between heartbeats; swapped out atomically when a
/// heartbeat goes on the wire.
#[derive(Default)]
pub struct Outbound {
    reports: Mutex<Vec<Report>>,
}

impl Outbound {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report_open(&self, info: RegionInfo) {
        self.push(Report::Open(info));
    }

    pub fn report_close(&self, info: RegionInfo) {
        self.push(Report::Close(info));
    }

    /// A split produces three messages: the retired parent and the two
    /// unassigned children.
    pub fn report_split(&self, parent: RegionInfo, child_a: RegionInfo, child_b: RegionInfo) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(Report::Split(parent));
            reports.push(Report::Open(child_a));
            reports.push(Report::Open(child_b));
        }
    }

    pub fn push(&self, report: Report) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(report);
        }
    }

    /// Takes everything buffered so far.
    pub fn take(&self) -> Vec<Report> {
        self.reports
            .lock()
            .map(|mut reports| std::mem::take(&mut *reports))
            .unwrap_or_default()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::meta_region_info;

    #[test]
    fn test_outbound_swap() {
        let outbound = Outbound::new();
        let info = meta_region_info(Vec::new(), Vec::new(), 1);
        outbound.report_open(info.clone());
        outbound.report_close(info.clone());

        let taken = outbound.take();
        assert_eq!(taken.len(), 2);
        assert!(outbound.take().is_empty(), "buffer drained by take");

        outbound.report_split(info.clone(), info.clone(), info);
        let taken = outbound.take();
        assert_eq!(taken.len(), 3);
        assert!(matches!(taken[0], Report::Split(_)));
        assert!(matches!(taken[1], Report::Open(_)));
    }
}
