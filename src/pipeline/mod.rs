//! Analysis Pipeline
//!
//! Turns the documents of an intake session into a feasibility report.
//!
//! ```text
//! Document Analysis (per document, concurrent)
//!         ↓
//! Question Generation (session-wide)
//!         ↓
//! Report Generation (overview → technical → delivery)
//! ```
//!
//! ## Guarantees
//!
//! - Each stage runs under a [`StageLock`]; a caller that loses the race
//!   waits for the winner's result instead of paying for a duplicate call
//! - A `Processing` stage record is written before every external call;
//!   `Completed` records are reused, `Failed` ones retried up to the ceiling
//! - Every billed attempt first renews its lease on the record and the stage
//!   lock, so a slow but live run is never mistaken for an abandoned one
//! - Cost is added to the session after every successful call, never before

pub mod lock;
pub mod merge;
pub mod phases;
pub mod progress;
pub mod prompts;
pub mod stages;

pub use lock::{LockGuard, LockOutcome, LockState, ReleaseReason, StageLock};
pub use merge::{merge_into, merge_records};
pub use phases::{MergedResult, PhaseOrchestrator, PhaseReport, PhaseSpec};
pub use progress::ProgressTracker;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::{Map, Value, json};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, instrument, warn};

use crate::ai::{
    CompletionRequest, CompletionResponse, ResponseRecoveryParser, RetryPolicy, SharedClient,
};
use crate::config::{Config, PipelineConfig};
use crate::storage::SharedStore;
use crate::types::{
    CostUsage, Document, IntakeError, Progress, Question, Report, Result, Session, SessionStatus,
    Stage, StageRecord, StageStatus,
};
use prompts::{
    REPORT_PHASES, document_analysis_prompt, document_analysis_schema, questions_prompt,
    questions_schema, report_phase_prompt, report_phase_schema,
};
use stages::{
    Claim, Lease, StageOutput, claim_record, finish_record, normalize_questions, questions_from_record,
    questions_result,
};

/// Subject id of session-wide stage records
const SESSION_SUBJECT: &str = "";

/// Drives the three intake stages for any number of sessions
pub struct PipelineOrchestrator {
    store: SharedStore,
    client: SharedClient,
    retry: RetryPolicy,
    lock: StageLock,
    config: PipelineConfig,
    progress: ProgressTracker,
}

impl PipelineOrchestrator {
    pub fn new(store: SharedStore, client: SharedClient, config: &Config) -> Self {
        Self::with_policies(
            store,
            client,
            RetryPolicy::from_config(&config.retry),
            config.pipeline.clone(),
        )
    }

    pub fn with_policies(
        store: SharedStore,
        client: SharedClient,
        retry: RetryPolicy,
        config: PipelineConfig,
    ) -> Self {
        let lock = StageLock::new(Arc::clone(&store), config.lock_ttl());
        Self {
            store,
            client,
            retry,
            lock,
            config,
            progress: ProgressTracker::new(),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    // =========================================================================
    // Document Analysis
    // =========================================================================

    /// Analyze one document, reusing a completed or in-flight attempt
    #[instrument(skip(self))]
    pub async fn start_document_analysis(
        &self,
        session_id: &str,
        document_id: &str,
    ) -> Result<StageRecord> {
        self.session(session_id)?;
        let document = self
            .store
            .get_document(document_id)?
            .filter(|d| d.session_id == session_id)
            .ok_or_else(|| {
                IntakeError::NotFound(format!(
                    "Document {} in session {}",
                    document_id, session_id
                ))
            })?;

        self.analyze_document(&document, None).await
    }

    /// Analyze every document of the session, `document_concurrency` at a time
    #[instrument(skip(self))]
    pub async fn analyze_documents(&self, session_id: &str) -> Result<Vec<StageRecord>> {
        self.session(session_id)?;
        let stage = Stage::DocumentAnalysis;
        let documents = self.store.list_documents(session_id)?;
        if documents.is_empty() {
            return Err(IntakeError::PrerequisiteMissing {
                stage,
                reason: "No documents have been uploaded".to_string(),
            });
        }

        let guard = match self.lock.try_acquire(session_id, stage)? {
            LockOutcome::Acquired(guard) | LockOutcome::Reclaimed { guard, .. } => guard,
            LockOutcome::HeldByOther { started_at } => {
                info!(%started_at, "Document analysis already running, waiting");
                return match self
                    .wait_for(|| self.finished_documents(session_id, &documents))
                    .await?
                {
                    Some(records) => Ok(records),
                    None => Err(self.in_progress(session_id, stage)),
                };
            }
        };

        let total = documents.len();
        let finished = AtomicUsize::new(0);
        self.progress
            .update(session_id, stage, 0.0, &format!("0/{} documents analyzed", total));

        let mut results: Vec<(usize, Result<StageRecord>)> = stream::iter(documents.iter().enumerate())
            .map(|(index, document)| {
                let finished = &finished;
                let guard = &guard;
                async move {
                    let result = self.analyze_document(document, Some(guard)).await;
                    let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                    self.progress.update(
                        session_id,
                        stage,
                        done as f32 * 100.0 / total as f32,
                        &format!("{}/{} documents analyzed", done, total),
                    );
                    (index, result)
                }
            })
            .buffer_unordered(self.config.document_concurrency.max(1))
            .collect()
            .await;
        results.sort_by_key(|(index, _)| *index);

        let mut records = Vec::with_capacity(total);
        let mut first_error = None;
        for (_, result) in results {
            match result {
                Ok(record) => records.push(record),
                Err(err) if first_error.is_none() => first_error = Some(err),
                Err(err) => warn!(error = %err, "Additional document analysis failure"),
            }
        }

        let reason = if first_error.is_none() {
            ReleaseReason::Succeeded
        } else {
            ReleaseReason::Failed
        };
        self.release(guard, reason);
        self.progress.clear(session_id, stage);

        match first_error {
            Some(err) => Err(err),
            None => {
                info!(documents = records.len(), "Document analysis finished");
                Ok(records)
            }
        }
    }

    /// `batch` is the stage lock of a whole-session run, renewed alongside
    /// the document's own record
    async fn analyze_document(
        &self,
        document: &Document,
        batch: Option<&LockGuard>,
    ) -> Result<StageRecord> {
        let ttl = self.config.lock_ttl();
        let claim = claim_record(
            self.store.as_ref(),
            &document.session_id,
            &document.id,
            Stage::DocumentAnalysis,
            self.config.stage_attempt_ceiling,
            |record| is_stale(record, ttl),
        )?;

        let record = match claim {
            Claim::Completed(record) => return Ok(record),
            Claim::InProgress(record) => {
                debug!(document = %document.filename, "Document analysis already in flight");
                return Ok(record);
            }
            Claim::Claimed(record) => record,
        };

        let lease = Lease::new(&self.lock, &record, batch);
        match self.document_output(document, &lease).await {
            // The record belongs to another run now
            Err(err @ IntakeError::LeaseLost { .. }) => Err(err),
            outcome => {
                let stored = finish_record(self.store.as_ref(), &record, &outcome)?;
                outcome.map(|_| stored)
            }
        }
    }

    async fn document_output(&self, document: &Document, lease: &Lease) -> Result<StageOutput> {
        let schema = document_analysis_schema();
        let request = document_analysis_prompt(document, &schema);
        let label = format!("document analysis ({})", document.filename);

        let response = self.complete(&label, &request, lease).await?;
        self.record_cost(&document.session_id, &response.cost())?;

        let parsed = ResponseRecoveryParser::new(schema).parse(&response.text);
        let recovered = parsed.recovered;
        Ok(StageOutput {
            result: parsed.into_value(),
            recovered,
        })
    }

    /// All documents analyzed: their records. A failed analysis with nobody
    /// working on it ends the wait.
    fn finished_documents(
        &self,
        session_id: &str,
        documents: &[Document],
    ) -> Result<Option<Vec<StageRecord>>> {
        let mut records = Vec::with_capacity(documents.len());
        for document in documents {
            match self
                .store
                .get_stage_record(session_id, &document.id, Stage::DocumentAnalysis)?
            {
                Some(record) if record.is_completed() => records.push(record),
                Some(record)
                    if record.status == StageStatus::Failed
                        && !self.lock.is_held(session_id, Stage::DocumentAnalysis)? =>
                {
                    return Err(IntakeError::StageFailed {
                        stage: Stage::DocumentAnalysis,
                        reason: record.error.unwrap_or_default(),
                    });
                }
                _ => return Ok(None),
            }
        }
        Ok(Some(records))
    }

    // =========================================================================
    // Question Generation
    // =========================================================================

    /// Generate clarifying questions once per session
    #[instrument(skip(self))]
    pub async fn start_question_generation(&self, session_id: &str) -> Result<Vec<Question>> {
        self.session(session_id)?;
        let stage = Stage::QuestionGeneration;
        if let Some(record) = self.completed_record(session_id, stage)? {
            return questions_from_record(&record);
        }

        let analyses = self.completed_analyses(session_id, stage)?;
        let record = self
            .run_session_stage(session_id, stage, |lease| {
                self.questions_output(session_id, &analyses, lease)
            })
            .await?;

        questions_from_record(&record)
    }

    async fn questions_output(
        &self,
        session_id: &str,
        analyses: &[Value],
        lease: Lease,
    ) -> Result<StageOutput> {
        let stage = Stage::QuestionGeneration;
        let schema = questions_schema();
        let request = questions_prompt(analyses, &schema);
        self.progress
            .update(session_id, stage, 10.0, "Generating clarifying questions");

        let response = self
            .complete("question generation", &request, &lease)
            .await?;
        self.record_cost(session_id, &response.cost())?;

        let parsed = ResponseRecoveryParser::new(schema).parse(&response.text);
        let recovered = parsed.recovered;
        let questions = normalize_questions(&parsed.into_value());
        info!(questions = questions.len(), recovered, "Generated questions");

        Ok(StageOutput {
            result: questions_result(&questions),
            recovered,
        })
    }

    // =========================================================================
    // Report Generation
    // =========================================================================

    /// Write the multi-phase feasibility report once per session
    #[instrument(skip(self))]
    pub async fn start_report_generation(&self, session_id: &str) -> Result<Report> {
        self.session(session_id)?;
        let stage = Stage::ReportGeneration;
        if let Some(record) = self.completed_record(session_id, stage)? {
            return report_from_record(&record);
        }

        let analyses = self.completed_analyses(session_id, stage)?;
        let questions = match self.completed_record(session_id, Stage::QuestionGeneration)? {
            Some(record) => questions_from_record(&record)?,
            None => {
                return Err(IntakeError::PrerequisiteMissing {
                    stage,
                    reason: "Clarifying questions have not been generated".to_string(),
                });
            }
        };
        let record = self
            .run_session_stage(session_id, stage, |lease| {
                self.report_output(session_id, &analyses, &questions, lease)
            })
            .await?;

        self.store
            .set_session_status(session_id, SessionStatus::Completed)?;
        report_from_record(&record)
    }

    async fn report_output(
        &self,
        session_id: &str,
        analyses: &[Value],
        questions: &[Question],
        lease: Lease,
    ) -> Result<StageOutput> {
        let stage = Stage::ReportGeneration;
        let renew = || lease.renew();
        let merged = PhaseOrchestrator::new(self.client.as_ref(), &self.retry)
            .with_renewal(&renew)
            .run_phases(
                self.report_phases(analyses, questions),
                &|percent, phase| {
                    self.progress.update(
                        session_id,
                        stage,
                        percent,
                        &format!("Writing {} section", phase),
                    )
                },
                &|cost| self.record_cost(session_id, cost),
            )
            .await?;

        let report = Report {
            session_id: session_id.to_string(),
            sections: merged.record,
            recovered: merged.recovered,
            cost: merged.cost,
            generated_at: Utc::now(),
        };
        Ok(StageOutput {
            result: serde_json::to_value(&report)?,
            recovered: report.recovered,
        })
    }

    fn report_phases<'a>(
        &self,
        analyses: &'a [Value],
        questions: &'a [Question],
    ) -> Vec<PhaseSpec<'a>> {
        let count = REPORT_PHASES.len() as f32;
        REPORT_PHASES
            .iter()
            .enumerate()
            .map(|(i, &phase)| {
                let schema = report_phase_schema(phase);
                let prompt_schema = schema.clone();
                PhaseSpec {
                    name: phase,
                    prompt_builder: Box::new(move |merged: &Map<String, Value>| {
                        report_phase_prompt(phase, analyses, questions, merged, &prompt_schema)
                    }),
                    max_tokens: self.config.report_phase_max_tokens,
                    progress_range: (i as f32 * 100.0 / count, (i + 1) as f32 * 100.0 / count),
                    schema,
                }
            })
            .collect()
    }

    // =========================================================================
    // Progress, Reset, Full Run
    // =========================================================================

    /// Fractional progress of one stage
    pub fn get_progress(&self, session_id: &str, stage: Stage) -> Result<Progress> {
        self.session(session_id)?;
        if stage == Stage::DocumentAnalysis {
            return self.document_progress(session_id);
        }

        let live = self.progress.get(session_id, stage);
        Ok(
            match self.store.get_stage_record(session_id, SESSION_SUBJECT, stage)? {
                Some(record) if record.is_completed() => Progress::new(100.0, "Completed"),
                Some(record) if record.status == StageStatus::Failed => Progress::new(
                    0.0,
                    format!(
                        "Failed on attempt {}: {}",
                        record.attempts,
                        record.error.unwrap_or_default()
                    ),
                ),
                Some(_) => live.unwrap_or_else(|| Progress::new(0.0, "In progress")),
                None => live.unwrap_or_else(|| Progress::new(0.0, "Not started")),
            },
        )
    }

    fn document_progress(&self, session_id: &str) -> Result<Progress> {
        let documents = self.store.list_documents(session_id)?;
        if documents.is_empty() {
            return Ok(Progress::new(0.0, "No documents uploaded"));
        }

        let records = self
            .store
            .list_stage_records(session_id, Stage::DocumentAnalysis)?;
        let total = documents.len();
        let completed = documents
            .iter()
            .filter(|d| {
                records
                    .iter()
                    .any(|r| r.subject_id == d.id && r.is_completed())
            })
            .count();
        let failed = records
            .iter()
            .filter(|r| r.status == StageStatus::Failed)
            .count();

        if completed == total {
            return Ok(Progress::new(100.0, "Completed"));
        }
        if let Some(live) = self.progress.get(session_id, Stage::DocumentAnalysis) {
            return Ok(live);
        }

        let mut message = format!("{}/{} documents analyzed", completed, total);
        if failed > 0 {
            message.push_str(&format!(", {} failed", failed));
        }
        Ok(Progress::new(completed as f32 * 100.0 / total as f32, message))
    }

    /// Clear failed (or abandoned) attempts of a stage so it can run again.
    ///
    /// `subject_id` narrows document analysis to one document. Returns the
    /// number of records removed.
    #[instrument(skip(self))]
    pub fn reset_stage(
        &self,
        session_id: &str,
        stage: Stage,
        subject_id: Option<&str>,
    ) -> Result<usize> {
        let session = self.session(session_id)?;
        let ttl = self.config.lock_ttl();

        let resettable: Vec<StageRecord> = self
            .store
            .list_stage_records(session_id, stage)?
            .into_iter()
            .filter(|r| subject_id.is_none_or(|s| r.subject_id == s))
            .filter(|r| {
                r.status == StageStatus::Failed
                    || (r.status == StageStatus::Processing && is_stale(r, ttl))
            })
            .collect();

        for record in &resettable {
            self.store.delete_stage_record(&record.id)?;
        }

        if !self.lock.reset(session_id, stage)? {
            warn!("Stage is running; lock left in place");
        }
        if session.status == SessionStatus::Failed {
            self.store
                .set_session_status(session_id, SessionStatus::Processing)?;
        }

        info!(reset = resettable.len(), "Stage reset");
        Ok(resettable.len())
    }

    /// Run every stage in order and return the report
    #[instrument(skip(self))]
    pub async fn run(&self, session_id: &str) -> Result<Report> {
        let started = Instant::now();
        self.analyze_documents(session_id).await?;
        let questions = self.start_question_generation(session_id).await?;
        let report = self.start_report_generation(session_id).await?;

        let total_cost = self.session(session_id)?.total_cost;
        info!(
            questions = questions.len(),
            recovered = report.recovered,
            total_cost_usd = total_cost,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pipeline finished"
        );
        Ok(report)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn session(&self, session_id: &str) -> Result<Session> {
        self.store
            .get_session(session_id)?
            .ok_or_else(|| IntakeError::NotFound(format!("Session {}", session_id)))
    }

    fn completed_record(&self, session_id: &str, stage: Stage) -> Result<Option<StageRecord>> {
        Ok(self
            .store
            .get_stage_record(session_id, SESSION_SUBJECT, stage)?
            .filter(StageRecord::is_completed))
    }

    /// Results of every document analysis, tagged with the file name
    fn completed_analyses(&self, session_id: &str, stage: Stage) -> Result<Vec<Value>> {
        let documents = self.store.list_documents(session_id)?;
        if documents.is_empty() {
            return Err(IntakeError::PrerequisiteMissing {
                stage,
                reason: "No documents have been uploaded".to_string(),
            });
        }

        let records = self
            .store
            .list_stage_records(session_id, Stage::DocumentAnalysis)?;
        let analyses: Vec<Value> = documents
            .iter()
            .filter_map(|document| {
                records
                    .iter()
                    .find(|r| r.subject_id == document.id && r.is_completed())
                    .map(|r| {
                        json!({
                            "document": document.filename,
                            "analysis": r.result.clone().unwrap_or(Value::Null),
                        })
                    })
            })
            .collect();

        if analyses.len() < documents.len() {
            return Err(IntakeError::PrerequisiteMissing {
                stage,
                reason: format!(
                    "Only {} of {} documents have been analyzed",
                    analyses.len(),
                    documents.len()
                ),
            });
        }
        Ok(analyses)
    }

    /// One-shot completion under the retry policy, renewing `lease` before
    /// every attempt
    async fn complete(
        &self,
        label: &str,
        request: &CompletionRequest,
        lease: &Lease,
    ) -> Result<CompletionResponse> {
        self.retry
            .execute(label, |_ctx| async move {
                match lease.renew() {
                    Ok(()) => self.client.complete(request).await,
                    Err(err) => Err(err),
                }
            })
            .await
    }

    fn record_cost(&self, session_id: &str, cost: &CostUsage) -> Result<()> {
        let total = self.store.add_session_cost(session_id, cost)?;
        debug!(
            session_id,
            cost_usd = cost.cost_usd,
            total_cost_usd = total,
            "Recorded call cost"
        );
        Ok(())
    }

    fn release(&self, guard: LockGuard, reason: ReleaseReason) {
        // The TTL frees the lock eventually if this write fails
        if let Err(err) = self.lock.release(guard, reason) {
            warn!(error = %err, "Failed to release stage lock");
        }
    }

    fn in_progress(&self, session_id: &str, stage: Stage) -> IntakeError {
        IntakeError::AlreadyInProgress {
            session_id: session_id.to_string(),
            stage,
        }
    }

    /// Poll `check` until it yields, or the in-progress wait runs out
    async fn wait_for<T>(&self, mut check: impl FnMut() -> Result<Option<T>>) -> Result<Option<T>> {
        let deadline = Instant::now() + self.config.in_progress_wait();
        loop {
            if let Some(value) = check()? {
                return Ok(Some(value));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(self.config.poll_interval()).await;
        }
    }

    /// Completed session-wide record, or the failure of an attempt nobody
    /// is working on any more
    fn finished_record(&self, session_id: &str, stage: Stage) -> Result<Option<StageRecord>> {
        match self
            .store
            .get_stage_record(session_id, SESSION_SUBJECT, stage)?
        {
            Some(record) if record.is_completed() => Ok(Some(record)),
            Some(record)
                if record.status == StageStatus::Failed
                    && !self.lock.is_held(session_id, stage)? =>
            {
                Err(IntakeError::StageFailed {
                    stage,
                    reason: record.error.unwrap_or_default(),
                })
            }
            _ => Ok(None),
        }
    }

    /// Run a session-wide stage under its lock.
    ///
    /// Losers of the lock race wait for the winner's record and never start
    /// `work`. The winner claims a `Processing` record, runs `work` with a
    /// lease on that record and the lock, stores its outcome and releases.
    async fn run_session_stage<F, Fut>(
        &self,
        session_id: &str,
        stage: Stage,
        work: F,
    ) -> Result<StageRecord>
    where
        F: FnOnce(Lease) -> Fut,
        Fut: Future<Output = Result<StageOutput>>,
    {
        let guard = match self.lock.try_acquire(session_id, stage)? {
            LockOutcome::Acquired(guard) | LockOutcome::Reclaimed { guard, .. } => guard,
            LockOutcome::HeldByOther { started_at } => {
                info!(%started_at, stage = stage.as_str(), "Stage already running, waiting");
                return match self
                    .wait_for(|| self.finished_record(session_id, stage))
                    .await?
                {
                    Some(record) => Ok(record),
                    None => Err(self.in_progress(session_id, stage)),
                };
            }
        };

        // Holding the lock, any Processing record belongs to a dead attempt
        let ceiling = self.config.stage_attempt_ceiling;
        let record = match claim_record(
            self.store.as_ref(),
            session_id,
            SESSION_SUBJECT,
            stage,
            ceiling,
            |_| true,
        ) {
            Ok(Claim::Claimed(record)) => record,
            Ok(Claim::Completed(record) | Claim::InProgress(record)) => {
                self.release(guard, ReleaseReason::Succeeded);
                return Ok(record);
            }
            Err(err) => {
                self.release(guard, ReleaseReason::Failed);
                if matches!(err, IntakeError::RetryLimitExceeded { .. }) {
                    self.store
                        .set_session_status(session_id, SessionStatus::Failed)?;
                }
                return Err(err);
            }
        };

        info!(stage = stage.as_str(), attempt = record.attempts, "Stage started");
        let outcome = work(Lease::new(&self.lock, &record, Some(&guard))).await;
        if let Err(err @ IntakeError::LeaseLost { .. }) = outcome {
            // The new owner writes the record and reports progress
            self.release(guard, ReleaseReason::Failed);
            return Err(err);
        }
        let stored = finish_record(self.store.as_ref(), &record, &outcome);

        let reason = if outcome.is_ok() {
            ReleaseReason::Succeeded
        } else {
            ReleaseReason::Failed
        };
        self.release(guard, reason);
        self.progress.clear(session_id, stage);

        if let Err(err) = outcome {
            if record.attempts >= ceiling {
                warn!(stage = stage.as_str(), "Attempt ceiling reached");
                self.store
                    .set_session_status(session_id, SessionStatus::Failed)?;
            }
            return Err(err);
        }
        stored
    }
}

/// Processing record whose lease was last renewed longer than the lock TTL ago
fn is_stale(record: &StageRecord, ttl: Duration) -> bool {
    Utc::now()
        .signed_duration_since(record.updated_at)
        .to_std()
        .is_ok_and(|age| age >= ttl)
}

fn report_from_record(record: &StageRecord) -> Result<Report> {
    let result = record.result.clone().ok_or_else(|| {
        IntakeError::Storage(format!("Report record {} has no result", record.id))
    })?;
    Ok(serde_json::from_value(result)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemorySessionStore, SessionStore};
    use crate::testing::{CALL_COST_USD, Scripted, ScriptedClient};

    const ANALYSIS: &str = r#"{"summary": "Clinic booking platform", "requirements": ["Online booking", "SMS reminders"], "constraints": ["Launch before March"], "risks": ["Legacy EHR integration"], "stakeholders": ["Clinic staff", "Patients"]}"#;
    const QUESTIONS: &str = r#"{"questions": [{"text": "Which EHR system is in use?", "category": "integration", "rationale": "Drives integration effort"}, "Is there a fixed budget?"]}"#;
    const OVERVIEW: &str = r#"{"executive_summary": "Feasible with a phased rollout", "project_scope": {"in": ["booking"], "out": ["billing"]}, "objectives": ["Cut no-shows"]}"#;
    const TECHNICAL: &str = r#"{"architecture": "Web app plus SMS gateway", "technology_stack": ["Rust", "Postgres"], "integrations": ["EHR"], "technical_risks": ["EHR API access"]}"#;
    const DELIVERY: &str = r#"{"timeline": "14 weeks", "effort_estimate": {"person_weeks": 30}, "team": ["2 engineers", "1 designer"], "feasibility": "feasible", "recommendations": ["Confirm EHR vendor"]}"#;

    fn client() -> ScriptedClient {
        ScriptedClient::new(Vec::new())
            .with_route("**Document**:", ANALYSIS)
            .with_route("# Question format", QUESTIONS)
            .with_route("**Report phase**: overview", OVERVIEW)
            .with_route("**Report phase**: technical", TECHNICAL)
            .with_route("**Report phase**: delivery", DELIVERY)
    }

    fn pipeline_config() -> PipelineConfig {
        PipelineConfig {
            in_progress_wait_secs: 5,
            poll_interval_ms: 10,
            ..PipelineConfig::default()
        }
    }

    type Fixture = (Arc<MemorySessionStore>, Arc<ScriptedClient>, PipelineOrchestrator);

    fn setup(client: ScriptedClient, documents: usize) -> Fixture {
        setup_with(
            client,
            documents,
            RetryPolicy::new(1, Duration::from_millis(1), Duration::from_secs(2)),
            pipeline_config(),
        )
    }

    fn setup_with(
        client: ScriptedClient,
        documents: usize,
        retry: RetryPolicy,
        config: PipelineConfig,
    ) -> Fixture {
        let store = Arc::new(MemorySessionStore::new());
        store.create_session(&Session::new("s1")).unwrap();
        for i in 0..documents {
            store
                .add_document(&Document::new("s1", format!("brief-{}.md", i), "We need a booking system."))
                .unwrap();
        }

        let client = Arc::new(client);
        let orchestrator =
            PipelineOrchestrator::with_policies(store.clone(), client.clone(), retry, config);
        (store, client, orchestrator)
    }

    fn total_cost(store: &MemorySessionStore) -> f64 {
        store.get_session("s1").unwrap().unwrap().total_cost
    }

    #[tokio::test]
    async fn test_full_run_produces_report() {
        let (store, client, orchestrator) = setup(client(), 3);

        let report = orchestrator.run("s1").await.unwrap();

        assert!(!report.recovered);
        assert_eq!(report.sections["executive_summary"], "Feasible with a phased rollout");
        assert_eq!(report.sections["timeline"], "14 weeks");
        assert_eq!(report.sections["integrations"], json!(["EHR"]));

        // 3 analyses, 1 question call, 3 report phases
        assert_eq!(client.calls(), 7);
        assert!((total_cost(&store) - 7.0 * CALL_COST_USD).abs() < 1e-9);

        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        for stage in Stage::ALL {
            assert_eq!(orchestrator.get_progress("s1", stage).unwrap().percent, 100.0);
        }
        assert!(!LockState::read(&session, Stage::ReportGeneration).busy);
    }

    #[tokio::test]
    async fn test_completed_stages_are_reused() {
        let (store, client, orchestrator) = setup(client(), 1);
        orchestrator.run("s1").await.unwrap();
        let calls = client.calls();
        let cost = total_cost(&store);

        let questions = orchestrator.start_question_generation("s1").await.unwrap();
        let report = orchestrator.start_report_generation("s1").await.unwrap();

        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].id, "q1");
        assert_eq!(report.sections["timeline"], "14 weeks");
        assert_eq!(client.calls(), calls);
        assert_eq!(total_cost(&store), cost);
    }

    #[tokio::test]
    async fn test_concurrent_question_generation_runs_once() {
        let (store, client, orchestrator) = setup(client().with_delay(Duration::from_millis(100)), 2);
        orchestrator.analyze_documents("s1").await.unwrap();
        let calls_before = client.calls();
        let cost_before = total_cost(&store);

        let (first, second) = tokio::join!(
            orchestrator.start_question_generation("s1"),
            orchestrator.start_question_generation("s1"),
        );

        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first, second);
        assert_eq!(client.calls(), calls_before + 1);
        assert!((total_cost(&store) - cost_before - CALL_COST_USD).abs() < 1e-9);

        let records = store
            .list_stage_records("s1", Stage::QuestionGeneration)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_completed());
        assert_eq!(records[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_concurrent_document_analysis_runs_once() {
        let (_store, client, orchestrator) = setup(client().with_delay(Duration::from_millis(50)), 3);

        let (first, second) = tokio::join!(
            orchestrator.analyze_documents("s1"),
            orchestrator.analyze_documents("s1"),
        );

        assert_eq!(first.unwrap().len(), 3);
        assert_eq!(second.unwrap().len(), 3);
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn test_attempt_ceiling_then_reset() {
        let client = ScriptedClient::new(Vec::new()).with_route("**Document**:", ANALYSIS);
        let (store, client, orchestrator) = setup(client, 1);
        orchestrator.analyze_documents("s1").await.unwrap();

        for _ in 0..3 {
            let err = orchestrator.start_question_generation("s1").await.unwrap_err();
            assert!(err.is_transient() || matches!(err, IntakeError::RetryExhausted { .. }));
        }
        let err = orchestrator.start_question_generation("s1").await.unwrap_err();
        assert!(matches!(
            err,
            IntakeError::RetryLimitExceeded { attempts: 3, .. }
        ));
        // The rejected fourth call never reached the model
        assert_eq!(client.calls(), 4);

        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        let progress = orchestrator
            .get_progress("s1", Stage::QuestionGeneration)
            .unwrap();
        assert_eq!(progress.percent, 0.0);
        assert!(progress.message.starts_with("Failed on attempt 3"));

        assert_eq!(
            orchestrator
                .reset_stage("s1", Stage::QuestionGeneration, None)
                .unwrap(),
            1
        );
        assert_eq!(
            store.get_session("s1").unwrap().unwrap().status,
            SessionStatus::Processing
        );

        client.push(Scripted::Reply(QUESTIONS.to_string()));
        let questions = orchestrator.start_question_generation("s1").await.unwrap();
        assert_eq!(questions.len(), 2);
    }

    #[tokio::test]
    async fn test_truncated_phase_is_recovered_and_billed() {
        let (store, client, orchestrator) = setup(client(), 1);
        orchestrator.analyze_documents("s1").await.unwrap();
        orchestrator.start_question_generation("s1").await.unwrap();
        let cost_before = total_cost(&store);

        // Overview stream dies mid-document, long enough to synthesize usage
        let long_summary = "phased rollout ".repeat(100);
        let truncated = format!(
            r#"{{"executive_summary": "{}", "objectives": ["Cut no-shows", "Reduce phone bo"#,
            long_summary.trim_end()
        );
        assert!(truncated.len() >= 1500);
        client.push(Scripted::Truncated(truncated));

        let report = orchestrator.start_report_generation("s1").await.unwrap();

        assert!(report.recovered);
        assert_eq!(report.sections["objectives"], json!(["Cut no-shows"]));
        assert_eq!(report.sections["timeline"], "14 weeks");
        // Synthesized usage is priced, so the truncated phase still costs money
        assert!(report.cost.cost_usd > 2.0 * CALL_COST_USD);
        assert!((total_cost(&store) - cost_before - report.cost.cost_usd).abs() < 1e-9);

        let record = orchestrator
            .completed_record("s1", Stage::ReportGeneration)
            .unwrap()
            .unwrap();
        assert!(record.recovered);
    }

    #[tokio::test]
    async fn test_cost_never_decreases() {
        let (store, _client, orchestrator) = setup(client(), 2);
        let mut costs = vec![total_cost(&store)];

        orchestrator.analyze_documents("s1").await.unwrap();
        costs.push(total_cost(&store));
        orchestrator.start_question_generation("s1").await.unwrap();
        costs.push(total_cost(&store));
        orchestrator.start_report_generation("s1").await.unwrap();
        costs.push(total_cost(&store));

        assert!(costs.windows(2).all(|w| w[1] > w[0]));
    }

    #[tokio::test]
    async fn test_prerequisites_are_enforced() {
        let (_store, client, orchestrator) = setup(client(), 2);

        let err = orchestrator.start_question_generation("s1").await.unwrap_err();
        assert!(matches!(
            err,
            IntakeError::PrerequisiteMissing {
                stage: Stage::QuestionGeneration,
                ..
            }
        ));

        orchestrator.analyze_documents("s1").await.unwrap();
        let err = orchestrator.start_report_generation("s1").await.unwrap_err();
        assert!(matches!(
            err,
            IntakeError::PrerequisiteMissing {
                stage: Stage::ReportGeneration,
                ..
            }
        ));
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_document_must_belong_to_session() {
        let (store, _client, orchestrator) = setup(client(), 0);
        store.create_session(&Session::new("s2")).unwrap();
        let foreign = Document::new("s2", "other.md", "Other project");
        store.add_document(&foreign).unwrap();

        let err = orchestrator
            .start_document_analysis("s1", &foreign.id)
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::NotFound(_)));

        let err = orchestrator.analyze_documents("s1").await.unwrap_err();
        assert!(matches!(err, IntakeError::PrerequisiteMissing { .. }));
    }

    #[tokio::test]
    async fn test_failed_document_reported_in_progress() {
        let client = ScriptedClient::new(vec![Scripted::Rejected]).with_route("**Document**:", ANALYSIS);
        let (_store, _client, orchestrator) = setup(client, 2);

        let err = orchestrator.analyze_documents("s1").await.unwrap_err();
        assert_eq!(err.kind(), crate::types::ErrorKind::Validation);

        let progress = orchestrator
            .get_progress("s1", Stage::DocumentAnalysis)
            .unwrap();
        assert_eq!(progress.percent, 50.0);
        assert_eq!(progress.message, "1/2 documents analyzed, 1 failed");

        assert_eq!(
            orchestrator
                .reset_stage("s1", Stage::DocumentAnalysis, None)
                .unwrap(),
            1
        );
        assert_eq!(orchestrator.analyze_documents("s1").await.unwrap().len(), 2);
    }

    /// Lock TTL shorter than the whole stage but longer than any one call
    fn short_ttl_config() -> PipelineConfig {
        PipelineConfig {
            lock_ttl_secs: 1,
            ..pipeline_config()
        }
    }

    #[tokio::test]
    async fn test_report_longer_than_ttl_is_not_taken_over() {
        let (store, client, orchestrator) = setup_with(
            client().with_delay(Duration::from_millis(400)),
            1,
            RetryPolicy::new(1, Duration::from_millis(1), Duration::from_secs(2)),
            short_ttl_config(),
        );
        orchestrator.analyze_documents("s1").await.unwrap();
        orchestrator.start_question_generation("s1").await.unwrap();
        let calls_before = client.calls();
        let cost_before = total_cost(&store);

        // The second caller arrives after the first run's original TTL ran out
        let (first, second) = tokio::join!(
            orchestrator.start_report_generation("s1"),
            async {
                sleep(Duration::from_millis(1100)).await;
                orchestrator.start_report_generation("s1").await
            },
        );

        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.sections, second.sections);
        assert_eq!(client.calls(), calls_before + 3);
        assert!((total_cost(&store) - cost_before - 3.0 * CALL_COST_USD).abs() < 1e-9);

        let records = store
            .list_stage_records("s1", Stage::ReportGeneration)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attempts, 1);
        assert!(records[0].is_completed());
    }

    #[tokio::test]
    async fn test_retried_document_is_not_reanalyzed() {
        let client = ScriptedClient::new(vec![Scripted::Unavailable])
            .with_route("**Document**:", ANALYSIS)
            .with_delay(Duration::from_millis(600));
        let (store, client, orchestrator) = setup_with(
            client,
            1,
            RetryPolicy::new(2, Duration::from_millis(1), Duration::from_secs(2)),
            short_ttl_config(),
        );
        let document = store.list_documents("s1").unwrap().remove(0);

        // First attempt fails at 0.6 s and the retry renews the record; the
        // second caller at 1.05 s sees a live attempt
        let (first, second) = tokio::join!(
            orchestrator.start_document_analysis("s1", &document.id),
            async {
                sleep(Duration::from_millis(1050)).await;
                orchestrator.start_document_analysis("s1", &document.id).await
            },
        );

        assert!(first.unwrap().is_completed());
        assert_eq!(second.unwrap().status, StageStatus::Processing);
        assert_eq!(client.calls(), 2);
        assert!((total_cost(&store) - CALL_COST_USD).abs() < 1e-9);

        let record = store
            .get_stage_record("s1", &document.id, Stage::DocumentAnalysis)
            .unwrap()
            .unwrap();
        assert_eq!(record.attempts, 1);
        assert!(record.is_completed());
    }
}
