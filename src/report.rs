//! The stable JSON report every run emits.

use serde::Serialize;

use crate::binlink::BinStats;
use crate::extract::ExtractedPackage;
use crate::fetch::FetchStats;
use crate::materialize::MaterializeStats;
use crate::plan::InstallPlan;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize)]
pub struct PlanCounts {
    pub real: u64,
    pub workspace_link: u64,
    pub skipped_platform: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct FetchReport {
    pub bytes_in: u64,
    pub attempts: u32,
    pub retries: u32,
}

#[derive(Debug, Default, Serialize)]
pub struct ExtractReport {
    pub packages_extracted: u64,
    pub files_ingested: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct MaterializeReport {
    pub cloned: u64,
    pub linked: u64,
    pub copied: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct BinReport {
    pub created: u64,
    pub skipped_collisions: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorReport {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct InstallReport {
    pub kind: &'static str,
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "runId")]
    pub run_id: String,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "endedAt")]
    pub ended_at: String,
    #[serde(rename = "projectRoot")]
    pub project_root: String,
    pub plan: PlanCounts,
    pub fetch: FetchReport,
    pub extract: ExtractReport,
    pub materialize: MaterializeReport,
    pub bin: BinReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

impl InstallReport {
    pub fn new(run_id: String, started_at: String, project_root: String) -> Self {
        InstallReport {
            kind: "install.report",
            schema_version: SCHEMA_VERSION,
            run_id,
            started_at,
            ended_at: String::new(),
            project_root,
            plan: PlanCounts::default(),
            fetch: FetchReport::default(),
            extract: ExtractReport::default(),
            materialize: MaterializeReport::default(),
            bin: BinReport::default(),
            error: None,
        }
    }

    pub fn apply_plan(&mut self, plan: &InstallPlan) {
        for p in &plan.placements {
            match p.kind {
                crate::plan::PlacementKind::Real => self.plan.real += 1,
                crate::plan::PlacementKind::WorkspaceLink { .. } => self.plan.workspace_link += 1,
            }
        }
        self.plan.skipped_platform = plan.skipped.len() as u64;
    }

    pub fn apply_fetch(&mut self, stats: &FetchStats) {
        self.fetch.bytes_in = stats.bytes_in;
        self.fetch.attempts = stats.attempts;
        self.fetch.retries = stats.retries;
    }

    pub fn apply_extract(&mut self, extracted: &[ExtractedPackage]) {
        self.extract.packages_extracted = extracted.len() as u64;
        self.extract.files_ingested = extracted.iter().map(|e| e.files_ingested as u64).sum();
    }

    pub fn apply_materialize(&mut self, stats: &MaterializeStats) {
        self.materialize.cloned = stats.cloned;
        self.materialize.linked = stats.linked;
        self.materialize.copied = stats.copied;
    }

    pub fn apply_bin(&mut self, stats: &BinStats) {
        self.bin.created = stats.created;
        self.bin.skipped_collisions = stats.skipped_collisions;
    }

    pub fn with_error(mut self, kind: &str, message: String) -> Self {
        self.error = Some(ErrorReport {
            kind: kind.to_string(),
            message,
        });
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
