use auditgraph_core::{
    AuditGraphError, ConsensusAudit, ConsensusDecision, GenerationSample, Result, SampleOutcome,
    SampleRecord, VoterSettings,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agents::ReportBrief;
use crate::decisions::DecisionExtractor;
use crate::pipeline::{AgentPipeline, PipelineRun};

#[derive(Debug, Clone)]
pub struct VoterConfig {
    pub samples: usize,
    pub quorum: usize,
    pub max_concurrency: usize,
    pub temperature_step: f32,
    pub straggler_grace: Duration,
}

impl Default for VoterConfig {
    fn default() -> Self {
        Self::from(&VoterSettings::default())
    }
}

impl From<&VoterSettings> for VoterConfig {
    fn from(settings: &VoterSettings) -> Self {
        Self {
            samples: settings.samples,
            quorum: settings.quorum,
            max_concurrency: settings.max_concurrency,
            temperature_step: settings.temperature_step,
            straggler_grace: Duration::from_millis(settings.straggler_grace_ms),
        }
    }
}

impl VoterConfig {
    fn validate(&self) -> Result<()> {
        if self.quorum == 0 || self.quorum > self.samples {
            return Err(AuditGraphError::Configuration(format!(
                "voter quorum {} must be between 1 and samples ({})",
                self.quorum, self.samples
            )));
        }
        if self.max_concurrency == 0 {
            return Err(AuditGraphError::Configuration(
                "voter max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of a self-consistency vote.
#[derive(Debug, Clone)]
pub struct ConsensusOutcome {
    pub selected: GenerationSample,
    pub audit: ConsensusAudit,
    /// Every successful sample, ordered by index.
    pub samples: Vec<GenerationSample>,
}

/// Runs the pipeline several times at increasing randomness and keeps the
/// sample that best agrees with the majority on every key decision.
pub struct SelfConsistencyVoter {
    pipeline: Arc<AgentPipeline>,
    extractor: DecisionExtractor,
    config: VoterConfig,
}

impl SelfConsistencyVoter {
    pub fn new(
        pipeline: Arc<AgentPipeline>,
        extractor: DecisionExtractor,
        config: VoterConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pipeline,
            extractor,
            config,
        })
    }

    pub fn config(&self) -> &VoterConfig {
        &self.config
    }

    pub async fn vote(&self, brief: &ReportBrief, deadline: Instant) -> Result<ConsensusOutcome> {
        let n = self.config.samples;
        let brief = Arc::new(brief.clone());
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut tasks: JoinSet<(usize, Result<PipelineRun>)> = JoinSet::new();

        for index in 0..n {
            let pipeline = Arc::clone(&self.pipeline);
            let brief = Arc::clone(&brief);
            let permits = Arc::clone(&permits);
            let offset = index as f32 * self.config.temperature_step;
            tasks.spawn(async move {
                // The semaphore is never closed, so this only waits for a slot.
                let _permit = permits.acquire_owned().await;
                (
                    index,
                    pipeline
                        .run_with_temperature_offset(&brief, offset, deadline)
                        .await,
                )
            });
        }

        let mut completed: BTreeMap<usize, GenerationSample> = BTreeMap::new();
        let mut failed: BTreeMap<usize, String> = BTreeMap::new();
        let mut grace_deadline: Option<Instant> = None;

        loop {
            let joined = match grace_deadline {
                None => tasks.join_next().await,
                Some(until) => match tokio::time::timeout_at(until, tasks.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        debug!(
                            pending = tasks.len(),
                            "straggler grace elapsed, cancelling samples"
                        );
                        tasks.abort_all();
                        break;
                    }
                },
            };
            let Some(joined) = joined else { break };

            match joined {
                Ok((index, Ok(run))) => {
                    let decisions = self.extractor.extract(&run.sections);
                    completed.insert(
                        index,
                        GenerationSample {
                            index,
                            randomness: run.randomness,
                            sections: run.sections,
                            decisions,
                        },
                    );
                    if completed.len() == self.config.quorum && grace_deadline.is_none() {
                        grace_deadline = Some(Instant::now() + self.config.straggler_grace);
                    }
                }
                Ok((index, Err(e))) => {
                    warn!(sample = index, "self-consistency sample failed: {}", e);
                    failed.insert(index, e.to_string());
                }
                Err(e) => warn!("self-consistency sample task aborted: {}", e),
            }
        }

        if completed.len() < self.config.quorum {
            return Err(AuditGraphError::QuorumNotReached {
                required: self.config.quorum,
                succeeded: completed.len(),
                attempted: n,
            });
        }

        let samples: Vec<GenerationSample> = completed.into_values().collect();
        let decisions = self.majority(&samples);
        let selected = select_sample(&samples, &decisions);

        let records = (0..n)
            .map(|index| {
                let randomness = index as f32 * self.config.temperature_step;
                match samples.iter().find(|s| s.index == index) {
                    Some(sample) => SampleRecord {
                        index,
                        randomness: sample.randomness,
                        decisions: sample.decisions.clone(),
                        outcome: SampleOutcome::Completed,
                    },
                    None => SampleRecord {
                        index,
                        randomness,
                        decisions: BTreeMap::new(),
                        outcome: match failed.get(&index) {
                            Some(reason) => SampleOutcome::Failed {
                                reason: reason.clone(),
                            },
                            None => SampleOutcome::Cancelled,
                        },
                    },
                }
            })
            .collect();

        info!(
            samples = n,
            succeeded = samples.len(),
            selected = selected.index,
            "self-consistency vote completed"
        );

        let audit = ConsensusAudit {
            requested_samples: n,
            quorum: self.config.quorum,
            selected_sample: selected.index,
            decisions,
            samples: records,
        };
        Ok(ConsensusOutcome {
            selected,
            audit,
            samples,
        })
    }

    /// Majority value per decision key. Ties go to the value produced by the
    /// least random sample, then to rule precedence, then lexical order.
    fn majority(&self, samples: &[GenerationSample]) -> Vec<ConsensusDecision> {
        let total = samples.len();
        self.extractor
            .rules()
            .iter()
            .map(|rule| {
                let mut tally: HashMap<&str, (usize, f32)> = HashMap::new();
                for sample in samples {
                    let value = sample
                        .decisions
                        .get(&rule.key)
                        .map(String::as_str)
                        .unwrap_or_default();
                    let entry = tally.entry(value).or_insert((0, f32::MAX));
                    entry.0 += 1;
                    entry.1 = entry.1.min(sample.randomness);
                }

                let (value, (votes, _)) = tally
                    .into_iter()
                    .min_by(|(va, (ca, ra)), (vb, (cb, rb))| {
                        cb.cmp(ca)
                            .then(ra.total_cmp(rb))
                            .then(rule.rank(va).cmp(&rule.rank(vb)))
                            .then(va.cmp(vb))
                    })
                    .unwrap_or(("", (0, 0.0)));

                ConsensusDecision {
                    key: rule.key.clone(),
                    value: value.to_string(),
                    votes,
                    agreement: if total == 0 {
                        0.0
                    } else {
                        votes as f64 / total as f64
                    },
                }
            })
            .collect()
    }
}

/// Sample matching the most consensus values; ties go to the lowest
/// randomness, then the lowest index.
fn select_sample(
    samples: &[GenerationSample],
    decisions: &[ConsensusDecision],
) -> GenerationSample {
    let matches = |sample: &GenerationSample| {
        decisions
            .iter()
            .filter(|d| sample.decisions.get(&d.key) == Some(&d.value))
            .count()
    };
    samples
        .iter()
        .min_by(|a, b| {
            matches(b)
                .cmp(&matches(a))
                .then(a.randomness.total_cmp(&b.randomness))
                .then(a.index.cmp(&b.index))
        })
        .cloned()
        .unwrap_or_else(|| GenerationSample {
            index: 0,
            randomness: 0.0,
            sections: Vec::new(),
            decisions: BTreeMap::new(),
        })
}
