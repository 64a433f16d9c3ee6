use serde::Serialize;

/// Parsed content of a claim file.
///
/// Both fields are optional because a reader can observe a claim that is
/// still being written, or one left corrupted by a crash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClaimRecord {
    pub pid: Option<u32>,
    pub worker: Option<String>,
}

impl ClaimRecord {
    pub fn new(pid: u32, worker: &str) -> Self {
        Self {
            pid: Some(pid),
            worker: Some(worker.to_string()),
        }
    }

    /// Line one `pid=<n>`, line two `worker=<identity>`.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        if let Some(pid) = self.pid {
            out.push_str(&format!("pid={pid}\n"));
        }
        if let Some(worker) = &self.worker {
            out.push_str(&format!("worker={worker}\n"));
        }
        out
    }

    pub fn parse(content: &str) -> Self {
        let mut record = Self::default();
        for line in content.lines() {
            if let Some(value) = line.strip_prefix("pid=") {
                record.pid = value.trim().parse::<u32>().ok().filter(|pid| *pid > 0);
            } else if let Some(value) = line.strip_prefix("worker=") {
                record.worker = Some(value.to_string());
            }
        }
        record
    }
}
