use crate::error::PatchError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Pipeline stage of a job. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Created,
    Decompiling,
    Injecting,
    Recompiling,
    Signing,
    Done,
    Failed,
}

impl JobStage {
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Created => Some(Self::Decompiling),
            Self::Decompiling => Some(Self::Injecting),
            Self::Injecting => Some(Self::Recompiling),
            Self::Recompiling => Some(Self::Signing),
            Self::Signing => Some(Self::Done),
            Self::Done | Self::Failed => None,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Decompiling => "decompiling",
            Self::Injecting => "injecting",
            Self::Recompiling => "recompiling",
            Self::Signing => "signing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

/// Signed output handed back to the caller.
#[derive(Debug, Clone)]
pub struct PatchedApk {
    pub bytes: Vec<u8>,
    pub sha256: String,
}

/// Terminal failure, attributed to the stage that was running.
#[derive(Debug)]
pub struct JobFailure {
    pub stage: JobStage,
    pub error: PatchError,
}

#[derive(Debug)]
pub enum JobOutcome {
    Done(PatchedApk),
    Failed(JobFailure),
}

impl JobOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    pub fn into_result(self) -> Result<PatchedApk, JobFailure> {
        match self {
            Self::Done(apk) => Ok(apk),
            Self::Failed(failure) => Err(failure),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: JobStage,
    pub millis: u128,
}

/// Mutable bookkeeping for one job. Only the coordinator advances it.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    stage: JobStage,
    stage_started: Instant,
    timings: Vec<StageTiming>,
}

impl Job {
    pub fn new(id: JobId) -> Self {
        Self {
            id,
            stage: JobStage::Created,
            stage_started: Instant::now(),
            timings: Vec::new(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn stage(&self) -> JobStage {
        self.stage
    }

    pub fn timings(&self) -> &[StageTiming] {
        &self.timings
    }

    /// Moves to the next stage on the success path; returns the new stage.
    pub(crate) fn advance(&mut self) -> JobStage {
        match self.stage.next() {
            Some(next) => self.enter(next),
            None => self.stage,
        }
    }

    /// Moves to `Failed` and returns the stage that was running.
    pub(crate) fn fail(&mut self) -> JobStage {
        let failed_at = self.stage;
        if !failed_at.is_terminal() {
            self.enter(JobStage::Failed);
        }
        failed_at
    }

    fn enter(&mut self, next: JobStage) -> JobStage {
        let elapsed: Duration = self.stage_started.elapsed();
        self.timings.push(StageTiming {
            stage: self.stage,
            millis: elapsed.as_millis(),
        });
        self.stage = next;
        self.stage_started = Instant::now();
        next
    }
}
