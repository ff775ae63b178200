pub mod agents;
pub mod decisions;
pub mod generator;
pub mod pipeline;
pub mod voter;

#[cfg(feature = "openai-compatible")]
pub mod openai_compatible;

pub use agents::{audit_opinion_agents, AgentSpec, ReportBrief};
pub use decisions::{DecisionExtractor, DecisionProbe, DecisionRule};
pub use generator::{GenerationRequest, GenerationResponse, GenerationResult, TextGenerator};
pub use pipeline::{backoff_delay, AgentPipeline, PipelineConfig, PipelineRun};
pub use voter::{ConsensusOutcome, SelfConsistencyVoter, VoterConfig};

#[cfg(feature = "openai-compatible")]
pub use openai_compatible::{GeneratorFactory, OpenAICompatibleConfig, OpenAICompatibleGenerator};
