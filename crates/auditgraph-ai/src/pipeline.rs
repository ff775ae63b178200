use auditgraph_core::{AuditGraphError, PipelineSettings, Result, Section};
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::agents::{AgentSpec, ReportBrief};
use crate::generator::{GenerationRequest, TextGenerator};

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

const SYSTEM_PROMPT: &str = "You draft sections of regulated assurance reports. Use precise, \
professional language, never promise absolute assurance, and cite standards in square brackets.";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First backoff delay; doubled for each further retry.
    pub backoff_base: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&PipelineSettings::default())
    }
}

impl From<&PipelineSettings> for PipelineConfig {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
        }
    }
}

/// Delay before retry number `attempt` (1-based): `base`, 2x `base`, 4x `base`,
/// saturating and capped at thirty seconds.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

/// Output of one full pipeline execution.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    /// Sections in agent-table order.
    pub sections: Vec<Section>,
    /// Mean temperature actually used across agents.
    pub randomness: f32,
}

/// Runs a table of agents over their dependency DAG.
///
/// Agents are grouped into waves: every agent in wave `n` depends only on
/// agents from earlier waves, so a wave runs concurrently once the previous
/// one has completed.
pub struct AgentPipeline {
    generator: Arc<dyn TextGenerator>,
    agents: Vec<AgentSpec>,
    waves: Vec<Vec<usize>>,
    config: PipelineConfig,
}

impl std::fmt::Debug for AgentPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentPipeline")
            .field("provider", &self.generator.provider_name())
            .field("agents", &self.agents.len())
            .field("waves", &self.waves)
            .finish()
    }
}

impl AgentPipeline {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        agents: Vec<AgentSpec>,
        config: PipelineConfig,
    ) -> Result<Self> {
        let waves = schedule_waves(&agents)?;
        Ok(Self {
            generator,
            agents,
            waves,
            config,
        })
    }

    pub fn agents(&self) -> &[AgentSpec] {
        &self.agents
    }

    pub fn generator(&self) -> &Arc<dyn TextGenerator> {
        &self.generator
    }

    /// Agent names grouped by execution wave.
    pub fn execution_waves(&self) -> Vec<Vec<&str>> {
        self.waves
            .iter()
            .map(|wave| wave.iter().map(|&i| self.agents[i].name.as_str()).collect())
            .collect()
    }

    pub async fn run(&self, brief: &ReportBrief, deadline: Instant) -> Result<PipelineRun> {
        self.run_with_temperature_offset(brief, 0.0, deadline).await
    }

    /// Runs every agent with `temperature + offset` (clamped to [0, 2]).
    pub async fn run_with_temperature_offset(
        &self,
        brief: &ReportBrief,
        offset: f32,
        deadline: Instant,
    ) -> Result<PipelineRun> {
        let started = std::time::Instant::now();
        let mut outputs: HashMap<String, String> = HashMap::new();
        let mut sections: HashMap<usize, Section> = HashMap::new();

        for wave in &self.waves {
            let calls = wave.iter().map(|&index| {
                let agent = &self.agents[index];
                let prompt = agent.render_prompt(brief, &outputs);
                let temperature = (agent.temperature + offset).clamp(0.0, 2.0);
                async move {
                    let result = self.call_with_retry(agent, prompt, temperature, deadline).await;
                    (index, result)
                }
            });
            let results = join_all(calls).await;

            let mut failures: Vec<AuditGraphError> = Vec::new();
            for (index, result) in results {
                let agent = &self.agents[index];
                match result {
                    Ok(content) => {
                        outputs.insert(agent.section.clone(), content.clone());
                        sections.insert(index, Section::new(&agent.section, content, &agent.name));
                    }
                    Err(err @ AuditGraphError::DeadlineExceeded(_)) => return Err(err),
                    Err(err) => failures.push(err),
                }
            }

            if !failures.is_empty() {
                return Err(self.degrade(failures, wave));
            }
        }

        let temperatures: Vec<f32> = self
            .agents
            .iter()
            .map(|a| (a.temperature + offset).clamp(0.0, 2.0))
            .collect();
        let randomness = if temperatures.is_empty() {
            0.0
        } else {
            temperatures.iter().sum::<f32>() / temperatures.len() as f32
        };

        let mut ordered = Vec::with_capacity(sections.len());
        for index in 0..self.agents.len() {
            if let Some(section) = sections.remove(&index) {
                ordered.push(section);
            }
        }

        info!(
            agents = self.agents.len(),
            waves = self.waves.len(),
            randomness,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pipeline run completed"
        );
        Ok(PipelineRun {
            sections: ordered,
            randomness,
        })
    }

    /// One corrective regeneration of a single section, used by fix mode.
    pub async fn regenerate_section(
        &self,
        brief: &ReportBrief,
        current: &[Section],
        section_name: &str,
        instructions: &str,
        deadline: Instant,
    ) -> Result<Section> {
        let agent = self
            .agents
            .iter()
            .find(|a| a.section == section_name)
            .ok_or_else(|| {
                AuditGraphError::NotFound(format!("no agent produces section '{}'", section_name))
            })?;

        let prior: HashMap<String, String> = current
            .iter()
            .map(|s| (s.name.clone(), s.content.clone()))
            .collect();
        let draft = prior.get(section_name).cloned().unwrap_or_default();
        let prompt = format!(
            "{}\n\nRevise the current draft so that it resolves these compliance findings:\n{}\n\n\
             Current draft:\n{}\n\nReturn only the revised section text.",
            agent.render_prompt(brief, &prior),
            instructions,
            draft
        );

        let content = self
            .call_with_retry(agent, prompt, agent.temperature, deadline)
            .await?;
        debug!(agent = %agent.name, section = section_name, "section regenerated");
        Ok(Section::new(&agent.section, content, &agent.name))
    }

    async fn call_with_retry(
        &self,
        agent: &AgentSpec,
        prompt: String,
        temperature: f32,
        deadline: Instant,
    ) -> Result<String> {
        let attempts = self.config.max_retries + 1;
        let request = GenerationRequest::new(prompt, temperature, agent.max_tokens)
            .with_system(SYSTEM_PROMPT);
        let mut last_error = String::from("no attempt made");

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = backoff_delay(self.config.backoff_base, attempt);
                if Instant::now() + delay >= deadline {
                    return Err(AuditGraphError::DeadlineExceeded(format!(
                        "backoff for agent '{}'",
                        agent.name
                    )));
                }
                tokio::time::sleep(delay).await;
            }

            // Dropping the timed-out future cancels the in-flight call.
            match tokio::time::timeout_at(deadline, self.generator.generate(&request)).await {
                Err(_) => {
                    return Err(AuditGraphError::DeadlineExceeded(format!(
                        "generation call for agent '{}'",
                        agent.name
                    )))
                }
                Ok(Ok(response)) if !response.content.trim().is_empty() => {
                    return Ok(response.content.trim().to_string());
                }
                Ok(Ok(_)) => last_error = "collaborator returned empty content".to_string(),
                Ok(Err(e)) => last_error = e.to_string(),
            }

            if attempt + 1 < attempts {
                warn!(
                    agent = %agent.name,
                    "generation failed (attempt {}/{}), retrying: {}",
                    attempt + 1,
                    attempts,
                    last_error
                );
            }
        }

        error!(agent = %agent.name, attempts, "generation retries exhausted: {}", last_error);
        Err(AuditGraphError::GenerationFailure {
            agent: agent.name.clone(),
            attempts,
            message: last_error,
            degraded_sections: vec![agent.section.clone()],
        })
    }

    /// Folds the failures of one wave into a single error naming every section
    /// that could not be produced, including downstream sections never started.
    fn degrade(&self, failures: Vec<AuditGraphError>, wave: &[usize]) -> AuditGraphError {
        let mut degraded: BTreeSet<String> = BTreeSet::new();
        let mut first: Option<(String, u32, String)> = None;
        for failure in failures {
            if let AuditGraphError::GenerationFailure {
                agent,
                attempts,
                message,
                degraded_sections,
            } = failure
            {
                degraded.extend(degraded_sections);
                first.get_or_insert((agent, attempts, message));
            }
        }
        let failed_agents: Vec<&str> = wave
            .iter()
            .map(|&i| &self.agents[i])
            .filter(|a| degraded.contains(&a.section))
            .map(|a| a.name.as_str())
            .collect();
        for dependent in self.dependents_of(&failed_agents) {
            degraded.insert(dependent);
        }

        let (agent, attempts, message) =
            first.unwrap_or_else(|| ("unknown".to_string(), 0, "unknown failure".to_string()));
        AuditGraphError::GenerationFailure {
            agent,
            attempts,
            message,
            degraded_sections: degraded.into_iter().collect(),
        }
    }

    /// Sections of agents that transitively depend on any of `roots`.
    fn dependents_of(&self, roots: &[&str]) -> Vec<String> {
        let mut blocked: BTreeSet<&str> = roots.iter().copied().collect();
        let mut sections = Vec::new();
        let mut changed = true;
        while changed {
            changed = false;
            for agent in &self.agents {
                if blocked.contains(agent.name.as_str()) {
                    continue;
                }
                if agent.depends_on.iter().any(|d| blocked.contains(d.as_str())) {
                    blocked.insert(agent.name.as_str());
                    sections.push(agent.section.clone());
                    changed = true;
                }
            }
        }
        sections
    }
}

/// Kahn's algorithm, level by level. Rejects duplicate names, unknown
/// dependencies and cycles.
fn schedule_waves(agents: &[AgentSpec]) -> Result<Vec<Vec<usize>>> {
    let invalid = |message: String| AuditGraphError::ValidationFailure {
        rule_id: "agent_table".to_string(),
        message,
    };

    let mut index_by_name: HashMap<&str, usize> = HashMap::new();
    let mut seen_sections: BTreeSet<&str> = BTreeSet::new();
    for (i, agent) in agents.iter().enumerate() {
        if index_by_name.insert(agent.name.as_str(), i).is_some() {
            return Err(invalid(format!("duplicate agent name '{}'", agent.name)));
        }
        if !seen_sections.insert(agent.section.as_str()) {
            return Err(invalid(format!(
                "section '{}' is produced by more than one agent",
                agent.section
            )));
        }
        if !(0.0..=2.0).contains(&agent.temperature) {
            return Err(invalid(format!(
                "agent '{}' temperature {} outside [0, 2]",
                agent.name, agent.temperature
            )));
        }
    }

    let mut in_degree = vec![0usize; agents.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); agents.len()];
    for (i, agent) in agents.iter().enumerate() {
        for dep in &agent.depends_on {
            let &d = index_by_name.get(dep.as_str()).ok_or_else(|| {
                invalid(format!(
                    "agent '{}' depends on unknown agent '{}'",
                    agent.name, dep
                ))
            })?;
            in_degree[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut waves = Vec::new();
    let mut ready: Vec<usize> = (0..agents.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut scheduled = 0;
    while !ready.is_empty() {
        scheduled += ready.len();
        let mut next = Vec::new();
        for &i in &ready {
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        next.sort_unstable();
        waves.push(std::mem::replace(&mut ready, next));
    }

    if scheduled != agents.len() {
        let stuck: Vec<&str> = agents
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, a)| a.name.as_str())
            .collect();
        return Err(invalid(format!(
            "agent dependency cycle among: {}",
            stuck.join(", ")
        )));
    }
    Ok(waves)
}
