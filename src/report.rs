use crate::{
    inject::InjectionReport,
    job::{JobStage, StageTiming},
};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub started: String,
    pub finished: String,
    pub input_sha256: String,
    pub final_stage: JobStage,
    pub timings: Vec<StageTiming>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub injection: Option<InjectionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub stage: JobStage,
    pub kind: &'static str,
    pub message: String,
}
