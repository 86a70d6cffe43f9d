//! Phase Orchestrator
//!
//! Runs dependent generation phases strictly in order. Each phase builds its
//! prompt from everything merged so far, streams its completion through the
//! retry policy, is parsed by the recovery parser and merged into the running
//! record. Streamed chunk growth is mapped into the phase's progress band, and
//! the cost of every successful call is handed to a sink immediately. An
//! optional renewal hook runs before every attempt of every phase.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use super::merge::merge_into;
use super::progress::band;
use crate::ai::{
    CompletionClient, CompletionRequest, RecordSchema, RecoveryStrategy, ResponseRecoveryParser,
    RetryPolicy, StreamFinish,
};
use crate::constants::pricing::CHARS_PER_TOKEN;
use crate::types::{CostUsage, Result};

/// Chunk progress never claims the whole band before the phase is parsed
const STREAM_PROGRESS_CAP: f32 = 0.95;

/// Builds a phase prompt from the record merged so far
pub type PromptFn<'a> = Box<dyn Fn(&Map<String, Value>) -> CompletionRequest + Send + Sync + 'a>;

/// Progress observer: `(percent, phase_name)`
pub type ProgressFn<'a> = dyn Fn(f32, &str) + Send + Sync + 'a;

/// Cost sink invoked after every successful call
pub type CostFn<'a> = dyn Fn(&CostUsage) -> Result<()> + Send + Sync + 'a;

/// Called before every attempt; an error aborts the run without retrying
pub type RenewFn<'a> = dyn Fn() -> Result<()> + Send + Sync + 'a;

pub struct PhaseSpec<'a> {
    pub name: &'static str,
    pub prompt_builder: PromptFn<'a>,
    pub max_tokens: u32,
    /// Percent band `[start, end]` this phase reports into
    pub progress_range: (f32, f32),
    pub schema: RecordSchema,
}

/// Outcome of one phase
#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub name: String,
    pub strategy: RecoveryStrategy,
    pub backfilled: Vec<String>,
    pub cost: CostUsage,
    pub partial: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MergedResult {
    pub record: Map<String, Value>,
    /// Any phase needed recovery or was cut off at its deadline
    pub recovered: bool,
    pub cost: CostUsage,
    pub phases: Vec<PhaseReport>,
}

pub struct PhaseOrchestrator<'a> {
    client: &'a dyn CompletionClient,
    retry: &'a RetryPolicy,
    renew: Option<&'a RenewFn<'a>>,
}

impl<'a> PhaseOrchestrator<'a> {
    pub fn new(client: &'a dyn CompletionClient, retry: &'a RetryPolicy) -> Self {
        Self {
            client,
            retry,
            renew: None,
        }
    }

    pub fn with_renewal(mut self, renew: &'a RenewFn<'a>) -> Self {
        self.renew = Some(renew);
        self
    }

    pub async fn run_phases(
        &self,
        phases: Vec<PhaseSpec<'_>>,
        on_progress: &ProgressFn<'_>,
        on_cost: &CostFn<'_>,
    ) -> Result<MergedResult> {
        let mut result = MergedResult::default();

        for spec in phases {
            let name = spec.name;
            let range = spec.progress_range;
            let expected_chars = (u64::from(spec.max_tokens) * CHARS_PER_TOKEN).max(1) as f32;
            let request = (spec.prompt_builder)(&result.record).with_max_tokens(spec.max_tokens);

            on_progress(range.0, name);

            let label = format!("{} phase", name);
            let response = self
                .retry
                .execute(&label, |ctx| {
                    let request = &request;
                    async move {
                        if let Some(renew) = self.renew
                            && let Err(err) = renew()
                        {
                            return Err(err);
                        }
                        let mut on_chunk = |_delta: &str, accumulated: &str| {
                            let fraction = accumulated.len() as f32 / expected_chars;
                            on_progress(band(range, fraction.min(STREAM_PROGRESS_CAP)), name);
                        };
                        self.client
                            .stream_complete(request, ctx.deadline, &mut on_chunk)
                            .await
                    }
                })
                .await?;

            let cost = response.cost();
            on_cost(&cost)?;

            let parsed = ResponseRecoveryParser::new(spec.schema).parse(&response.text);
            let partial = response.finish == StreamFinish::Cancelled;

            info!(
                phase = name,
                strategy = ?parsed.strategy,
                backfilled = parsed.backfilled.len(),
                partial,
                estimated_usage = response.is_estimated(),
                cost_usd = cost.cost_usd,
                "Phase complete"
            );

            result.recovered |= parsed.recovered || partial;
            result.cost.add(&cost);
            result.phases.push(PhaseReport {
                name: name.to_string(),
                strategy: parsed.strategy,
                backfilled: parsed.backfilled,
                cost,
                partial,
            });
            merge_into(&mut result.record, parsed.record);

            on_progress(range.1, name);
        }

        Ok(result)
    }
}
