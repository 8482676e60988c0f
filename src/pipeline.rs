use crate::{
    archive::{extract_zip, zip_dirs},
    config::Config,
    error::{PatchError, PatchResult},
    inject::{inject, smali_roots, InjectionReport},
    job::{Job, JobFailure, JobId, JobOutcome, JobStage, PatchedApk},
    payload::PayloadAsset,
    report::{FailureReport, JobReport},
    sign::Signer,
    transform::Transformer,
    util::{now_rfc3339, sha256_hex, write_atomic},
    workspace::{Workspace, WorkspaceManager},
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};

/// Runs jobs through decompile, inject, recompile and sign.
///
/// The pipeline is the only thing that moves a [`Job`] between stages; the
/// transformer, injector and signer just operate on workspace paths.
pub struct Pipeline<T: Transformer, S: Signer> {
    cfg: Config,
    transformer: T,
    signer: S,
    payload: Arc<PayloadAsset>,
    workspaces: WorkspaceManager,
}

pub struct JobRun {
    pub outcome: JobOutcome,
    pub report: JobReport,
}

impl<T: Transformer, S: Signer> Pipeline<T, S> {
    pub fn new(cfg: &Config, transformer: T, signer: S, payload: Arc<PayloadAsset>) -> Self {
        Self {
            cfg: cfg.clone(),
            transformer,
            signer,
            payload,
            workspaces: WorkspaceManager::new(&cfg.paths.scratch_root),
        }
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn transformer(&self) -> &T {
        &self.transformer
    }

    pub fn signer(&self) -> &S {
        &self.signer
    }

    /// Runs one job to a terminal state. The job's workspace is gone by the
    /// time this returns, whatever the outcome.
    pub fn run_job(&self, job_id: JobId, input: &[u8], cancel: &CancellationToken) -> JobRun {
        let span = info_span!("job", job_id = %job_id);
        let _enter = span.enter();

        let started = now_rfc3339();
        let input_sha256 = sha256_hex(input);
        info!(bytes = input.len(), sha256 = %input_sha256, "job created");

        let deadline = Deadline::arm(
            cancel,
            Duration::from_secs(self.cfg.limits.job_deadline_seconds),
        );

        let mut job = Job::new(job_id);
        let mut injection = None;

        let result = match self.workspaces.acquire(job_id) {
            Ok(workspace) => {
                let result = self
                    .stages(&mut job, &workspace, input, cancel, &mut injection)
                    .map_err(|e| deadline.explain(e, job.stage()));
                let outcome = self.settle(&mut job, result);
                if let Err(err) = self.workspaces.release(workspace) {
                    warn!("workspace release failed: {err}");
                }
                outcome
            }
            Err(err) => self.settle(&mut job, Err(err)),
        };

        let report = JobReport {
            job_id: job_id.to_string(),
            started,
            finished: now_rfc3339(),
            input_sha256,
            final_stage: job.stage(),
            timings: job.timings().to_vec(),
            injection,
            output_sha256: match &result {
                JobOutcome::Done(apk) => Some(apk.sha256.clone()),
                JobOutcome::Failed(_) => None,
            },
            failure: match &result {
                JobOutcome::Failed(f) => Some(FailureReport {
                    stage: f.stage,
                    kind: f.error.kind(),
                    message: f.error.to_string(),
                }),
                JobOutcome::Done(_) => None,
            },
        };
        if let Ok(json) = serde_json::to_string(&report) {
            debug!(report = %json, "job report");
        }

        JobRun {
            outcome: result,
            report,
        }
    }

    /// Decompiles only and returns the `smali*` roots of the tree as a zip.
    pub fn run_decompile(
        &self,
        job_id: JobId,
        input: &[u8],
        cancel: &CancellationToken,
    ) -> PatchResult<Vec<u8>> {
        self.in_workspace(job_id, "decompile", JobStage::Decompiling, cancel, |workspace| {
            let input_path = workspace.input_apk();
            write_atomic(&input_path, input)
                .map_err(|e| PatchError::io(format!("write {}", input_path.display()), e))?;
            let tree = self.transformer.decompile(&input_path, workspace, cancel)?;

            let (bytes, files) = zip_dirs(&tree, &smali_roots(&tree)?)?;
            if files == 0 {
                return Err(PatchError::TransformFailed {
                    stage: JobStage::Decompiling,
                    diagnostics: "no smali files generated".into(),
                });
            }
            info!(files, bytes = bytes.len(), "smali tree packed");
            Ok(bytes)
        })
    }

    /// Unpacks a zip of smali sources and assembles it into `classes.dex`.
    pub fn run_assemble(
        &self,
        job_id: JobId,
        smali_zip: &[u8],
        cancel: &CancellationToken,
    ) -> PatchResult<Vec<u8>> {
        self.in_workspace(job_id, "assemble", JobStage::Recompiling, cancel, |workspace| {
            let dir = workspace.smali_upload_dir();
            let written = extract_zip(smali_zip, &dir)?;
            let sources = written
                .iter()
                .filter(|p| p.extension().is_some_and(|ext| ext == "smali"))
                .count();
            if sources == 0 {
                return Err(PatchError::InvalidInput("archive contains no .smali files".into()));
            }
            info!(sources, "smali sources unpacked");

            let dex = self.transformer.assemble(&dir, workspace, cancel)?;
            std::fs::read(&dex).map_err(|e| PatchError::io(format!("read {}", dex.display()), e))
        })
    }

    fn in_workspace<R>(
        &self,
        job_id: JobId,
        op: &'static str,
        stage: JobStage,
        cancel: &CancellationToken,
        work: impl FnOnce(&Workspace) -> PatchResult<R>,
    ) -> PatchResult<R> {
        let span = info_span!("job", job_id = %job_id, op);
        let _enter = span.enter();

        let deadline = Deadline::arm(
            cancel,
            Duration::from_secs(self.cfg.limits.job_deadline_seconds),
        );
        let workspace = self.workspaces.acquire(job_id)?;
        let result = work(&workspace).map_err(|e| deadline.explain(e, stage));
        if let Err(err) = self.workspaces.release(workspace) {
            warn!("workspace release failed: {err}");
        }
        match &result {
            Ok(_) => info!("{op} done"),
            Err(err) => warn!(kind = err.kind(), "{op} failed: {err}"),
        }
        result
    }

    fn settle(&self, job: &mut Job, result: PatchResult<PatchedApk>) -> JobOutcome {
        match result {
            Ok(apk) => {
                job.advance();
                info!(bytes = apk.bytes.len(), sha256 = %apk.sha256, "job done");
                JobOutcome::Done(apk)
            }
            Err(error) => {
                let stage = job.fail();
                if matches!(error, PatchError::Cancelled) {
                    warn!(%stage, "job cancelled");
                } else {
                    error!(%stage, kind = error.kind(), "job failed: {error}");
                }
                JobOutcome::Failed(JobFailure { stage, error })
            }
        }
    }

    fn stages(
        &self,
        job: &mut Job,
        workspace: &Workspace,
        input: &[u8],
        cancel: &CancellationToken,
        injection: &mut Option<InjectionReport>,
    ) -> PatchResult<PatchedApk> {
        let input_path = workspace.input_apk();
        write_atomic(&input_path, input)
            .map_err(|e| PatchError::io(format!("write {}", input_path.display()), e))?;

        self.enter(job, cancel, JobStage::Decompiling)?;
        let tree = self.transformer.decompile(&input_path, workspace, cancel)?;

        self.enter(job, cancel, JobStage::Injecting)?;
        let report = inject(&tree, &self.payload, &self.cfg.injection)?;
        info!(
            entry = %report.entry_class,
            call_inserted = report.call_inserted,
            payload_replaced = report.payload_replaced,
            "injected"
        );
        *injection = Some(report);

        self.enter(job, cancel, JobStage::Recompiling)?;
        let unsigned = self.transformer.recompile(&tree, workspace, cancel)?;

        self.enter(job, cancel, JobStage::Signing)?;
        let signed = self.signer.sign(&unsigned, workspace, cancel)?;

        let bytes = std::fs::read(&signed)
            .map_err(|e| PatchError::io(format!("read {}", signed.display()), e))?;
        let sha256 = sha256_hex(&bytes);
        Ok(PatchedApk { bytes, sha256 })
    }

    fn enter(
        &self,
        job: &mut Job,
        cancel: &CancellationToken,
        expected: JobStage,
    ) -> PatchResult<()> {
        if cancel.is_cancelled() {
            return Err(PatchError::Cancelled);
        }
        let stage = job.advance();
        debug_assert_eq!(stage, expected);
        info!(%stage, "stage");
        Ok(())
    }
}

/// Cancels the token once the job deadline passes. Dropping the guard
/// disarms it.
struct Deadline {
    limit: Duration,
    fired: Arc<AtomicBool>,
    _disarm: Option<mpsc::Sender<()>>,
}

impl Deadline {
    fn arm(cancel: &CancellationToken, limit: Duration) -> Self {
        let fired = Arc::new(AtomicBool::new(false));
        if limit.is_zero() {
            return Self {
                limit,
                fired,
                _disarm: None,
            };
        }
        let (tx, rx) = mpsc::channel::<()>();
        let cancel = cancel.clone();
        let flag = Arc::clone(&fired);
        let spawned = std::thread::Builder::new()
            .name("job-deadline".into())
            .spawn(move || {
                if let Err(mpsc::RecvTimeoutError::Timeout) = rx.recv_timeout(limit) {
                    warn!("job deadline of {:?} elapsed", limit);
                    flag.store(true, Ordering::SeqCst);
                    cancel.cancel();
                }
            });
        if let Err(e) = spawned {
            warn!("deadline watchdog not started: {e}");
        }
        Self {
            limit,
            fired,
            _disarm: Some(tx),
        }
    }

    /// A cancellation caused by this deadline is a timeout of whatever
    /// stage was running, not a caller cancel.
    fn explain(&self, error: PatchError, stage: JobStage) -> PatchError {
        if matches!(error, PatchError::Cancelled) && self.fired.load(Ordering::SeqCst) {
            PatchError::TransformTimeout {
                stage,
                seconds: self.limit.as_secs(),
            }
        } else {
            error
        }
    }
}
