use anyhow::{Context, Result};
use auditgraph_ai::GeneratorFactory;
use auditgraph_compliance::{
    ComplianceEngine, ComplianceRule, EngineConfig, RuleCatalog, ValidationSubject, ValidationType,
};
use auditgraph_core::{
    ConfigManager, LoggingSettings, ReportContext, ReportType, Section, Settings,
};
use auditgraph_graph::{load_standards, KnowledgeGraph};
use auditgraph_report::{GenerateReportRequest, InMemoryReportStore, ReportService};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "auditgraph")]
#[command(
    about = "AuditGraph - regulated report synthesis and compliance checking",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Output format (json, pretty)
    #[arg(short, long, global = true, default_value = "pretty")]
    output: OutputFormat,

    /// Directory holding default.toml / <env>.toml / local.toml
    #[arg(long, global = true, env = "AUDITGRAPH_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Configuration environment
    #[arg(long, global = true, env = "AUDITGRAPH_ENV")]
    env: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate bracketed citations in a text file against a standards catalogue
    Citations {
        /// Text file to check
        file: PathBuf,

        /// Standards catalogue (.json or .toml)
        #[arg(short, long)]
        standards: PathBuf,
    },

    /// Run the rule engine (quick mode) over a text file
    Check {
        /// Text file; `## Heading` lines start named sections
        file: PathBuf,

        #[arg(short = 't', long, default_value = "audit_opinion")]
        report_type: ReportType,

        #[arg(long, default_value = "public_company")]
        entity_type: String,

        /// Section name used when the file has no headings
        #[arg(long, default_value = "body")]
        section: String,

        /// Context flags that are true (repeatable)
        #[arg(long = "flag")]
        flags: Vec<String>,

        /// Extra rules (JSON array) added to the built-in set
        #[arg(long)]
        rules: Option<PathBuf>,
    },

    /// Generate a report through the configured collaborator and validate it
    Generate {
        #[arg(long)]
        entity: String,

        #[arg(short = 't', long, default_value = "audit_opinion")]
        report_type: ReportType,

        #[arg(long, default_value = "public_company")]
        entity_type: String,

        #[arg(long, default_value = "US GAAP")]
        framework: String,

        /// Context flags that are true (repeatable)
        #[arg(long = "flag")]
        flags: Vec<String>,

        /// Engagement facts as key=value (repeatable)
        #[arg(long = "fact", value_parser = parse_fact)]
        facts: Vec<(String, String)>,

        /// Standards catalogue used for citation validation
        #[arg(short, long)]
        standards: Option<PathBuf>,

        /// Use self-consistency voting
        #[arg(long)]
        self_consistency: bool,

        /// Number of samples when voting
        #[arg(long)]
        samples: Option<usize>,

        /// Regenerate sections with repairable violations once
        #[arg(long)]
        fix: bool,

        /// Generation deadline in seconds
        #[arg(long)]
        deadline_secs: Option<u64>,
    },

    /// Inspect configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective settings
    Show,
    /// Print the settings JSON schema
    Schema,
}

fn parse_fact(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = ConfigManager::load(cli.config_dir.clone(), cli.env.clone())
        .context("Failed to load configuration")?;
    init_tracing(&settings.logging, cli.verbose);

    match execute_command(&cli, settings).await {
        Ok(output) => {
            print_output(&cli.output, &output)?;
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn init_tracing(logging: &LoggingSettings, verbose: bool) {
    let default_level = if verbose { "debug" } else { logging.level.as_str() };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn execute_command(cli: &Cli, settings: Settings) -> Result<serde_json::Value> {
    match &cli.command {
        Commands::Citations { file, standards } => execute_citations(file, standards),
        Commands::Check {
            file,
            report_type,
            entity_type,
            section,
            flags,
            rules,
        } => {
            execute_check(
                &settings,
                file,
                *report_type,
                entity_type,
                section,
                flags,
                rules.as_deref(),
            )
            .await
        }
        Commands::Generate {
            entity,
            report_type,
            entity_type,
            framework,
            flags,
            facts,
            standards,
            self_consistency,
            samples,
            fix,
            deadline_secs,
        } => {
            let mut context = ReportContext::new(entity.clone());
            for flag in flags {
                context = context.with_flag(flag.clone(), true);
            }
            for (key, value) in facts {
                context = context.with_fact(key.clone(), value.clone());
            }
            let mut request = GenerateReportRequest::new(
                *report_type,
                entity_type.clone(),
                framework.clone(),
                context,
            );
            request.flags.self_consistency = *self_consistency;
            request.flags.samples = *samples;
            request.deadline = deadline_secs.map(Duration::from_secs);
            execute_generate(settings, request, standards.as_deref(), *fix).await
        }
        Commands::Config(ConfigCommands::Show) => Ok(serde_json::to_value(&settings)?),
        Commands::Config(ConfigCommands::Schema) => {
            Ok(serde_json::to_value(schemars::schema_for!(Settings))?)
        }
    }
}

fn load_graph(path: &Path) -> Result<KnowledgeGraph> {
    let standards = load_standards(path)
        .with_context(|| format!("Failed to load standards from {}", path.display()))?;
    let graph = KnowledgeGraph::from_standards(standards).context("Invalid standards catalogue")?;
    for conflict in graph.detect_conflicts() {
        eprintln!("{} {}", "Warning:".yellow().bold(), conflict);
    }
    Ok(graph)
}

fn execute_citations(file: &Path, standards: &Path) -> Result<serde_json::Value> {
    let text = fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let graph = load_graph(standards)?;
    let sections = sections_from_text(&text, "body");
    let report = auditgraph_compliance::CitationValidator::new()
        .validate_sections(&graph.snapshot(), &sections);

    Ok(serde_json::json!({
        "graph_version": report.graph_version,
        "total": report.total(),
        "all_current": report.all_current(),
        "invalid": report.invalid(),
        "superseded": report.superseded(),
    }))
}

async fn execute_check(
    settings: &Settings,
    file: &Path,
    report_type: ReportType,
    entity_type: &str,
    default_section: &str,
    flags: &[String],
    extra_rules: Option<&Path>,
) -> Result<serde_json::Value> {
    let text = fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let catalog = RuleCatalog::with_builtins().context("Failed to load built-in rules")?;
    if let Some(path) = extra_rules {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let rules: Vec<ComplianceRule> = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid rules in {}", path.display()))?;
        for rule in rules {
            let id = rule.id.clone();
            catalog
                .add_rule(rule)
                .with_context(|| format!("Rejected rule {}", id))?;
        }
    }

    let mut context = ReportContext::new(file.display().to_string());
    for flag in flags {
        context = context.with_flag(flag.clone(), true);
    }
    let sections = sections_from_text(&text, default_section);
    let subject = ValidationSubject {
        report_type,
        entity_type,
        context: &context,
        sections: &sections,
    };

    let engine = ComplianceEngine::new(EngineConfig::from(&settings.compliance));
    let rules = catalog.list_rules(Some(report_type));
    let deadline = tokio::time::Instant::now()
        + Duration::from_secs(settings.pipeline.default_deadline_secs);
    let outcome = engine
        .evaluate(&rules, &subject, ValidationType::Quick, deadline)
        .await;
    info!(score = outcome.score, compliant = outcome.compliant, "check finished");
    Ok(serde_json::to_value(outcome)?)
}

async fn execute_generate(
    settings: Settings,
    request: GenerateReportRequest,
    standards: Option<&Path>,
    fix: bool,
) -> Result<serde_json::Value> {
    let graph = match standards {
        Some(path) => load_graph(path)?,
        None => KnowledgeGraph::new(),
    };
    let generator = GeneratorFactory::create_from_settings(&settings.generation)
        .context("Failed to create generation collaborator")?;
    if !generator.is_available().await {
        eprintln!(
            "{} {} is not reachable; generation will likely fail",
            "Warning:".yellow().bold(),
            generator.provider_name()
        );
    }

    let service = ReportService::new(
        settings,
        generator,
        Arc::new(graph),
        Arc::new(RuleCatalog::with_builtins().context("Failed to load built-in rules")?),
        Arc::new(InMemoryReportStore::new()),
    )
    .context("Failed to initialize report service")?;

    let draft = service
        .generate_report(request)
        .await
        .context("Report generation failed")?;
    let summary = service
        .validate_compliance(draft.id, ValidationType::Full, fix)
        .await
        .context("Compliance validation failed")?;
    let report = service.get_report(draft.id).await?;

    Ok(serde_json::json!({
        "report_id": report.id,
        "status": report.status,
        "generation_method": report.generation_method,
        "compliant": summary.compliant,
        "score": summary.score,
        "violations": summary.violations,
        "system_issues": summary.system_issues,
        "repaired_sections": summary.repaired_sections,
        "failed_repairs": summary.failed_repairs,
        "citations": report.citation_report,
        "consensus": report.consensus,
        "sections": report.sections,
    }))
}

/// Splits text on `## Heading` lines; a heading becomes a snake_case section
/// name. Text before the first heading goes to `default_section`.
fn sections_from_text(text: &str, default_section: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut name = default_section.to_string();
    let mut buffer: Vec<&str> = Vec::new();

    for line in text.lines() {
        if let Some(heading) = line.strip_prefix("## ") {
            let content = buffer.join("\n");
            if !content.trim().is_empty() {
                sections.push(Section::new(&name, content.trim(), "input"));
            }
            buffer.clear();
            name = heading
                .trim()
                .to_lowercase()
                .split(|c: char| !c.is_alphanumeric())
                .filter(|w| !w.is_empty())
                .collect::<Vec<_>>()
                .join("_");
        } else {
            buffer.push(line);
        }
    }
    let content = buffer.join("\n");
    if !content.trim().is_empty() {
        sections.push(Section::new(&name, content.trim(), "input"));
    }
    sections
}

fn print_output(format: &OutputFormat, value: &serde_json::Value) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Pretty => {
            print_pretty(value, 0)?;
        }
    }
    Ok(())
}

fn print_pretty(value: &serde_json::Value, depth: usize) -> Result<()> {
    let indent = "  ".repeat(depth);
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map {
                let key_colored = key.cyan().bold();
                match val {
                    serde_json::Value::String(s) => {
                        println!("{}{}: {}", indent, key_colored, s.green());
                    }
                    serde_json::Value::Number(n) => {
                        println!("{}{}: {}", indent, key_colored, n.to_string().yellow());
                    }
                    serde_json::Value::Bool(b) => {
                        let val_colored = if *b { "true".green() } else { "false".red() };
                        println!("{}{}: {}", indent, key_colored, val_colored);
                    }
                    serde_json::Value::Null => {
                        println!("{}{}: {}", indent, key_colored, "-".dimmed());
                    }
                    _ => {
                        println!("{}{}:", indent, key_colored);
                        print_pretty(val, depth + 1)?;
                    }
                }
            }
        }
        serde_json::Value::Array(arr) => {
            if arr.is_empty() {
                println!("{}{}", indent, "(none)".dimmed());
            }
            for (i, item) in arr.iter().enumerate() {
                println!("{}{}{}:", indent, "Item ".cyan(), (i + 1).to_string().yellow());
                print_pretty(item, depth + 1)?;
            }
        }
        _ => {
            println!("{}{}", indent, value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headings_start_sections() {
        let text = "Preamble line\n## Opinion\nIn our opinion, fine.\n\n## Basis for Opinion\nWe are independent.\n";
        let sections = sections_from_text(text, "body");
        let names: Vec<&str> = sections.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["body", "opinion", "basis_for_opinion"]);
        assert_eq!(sections[1].content, "In our opinion, fine.");
    }

    #[test]
    fn facts_need_a_key() {
        assert_eq!(
            parse_fact("revenue = $12M").unwrap(),
            ("revenue".to_string(), "$12M".to_string())
        );
        assert!(parse_fact("=x").is_err());
        assert!(parse_fact("novalue").is_err());
    }

    #[tokio::test]
    async fn check_reports_missing_opinion() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("draft.md");
        fs::write(&file, "## Opinion\nThe statements were examined.\n").unwrap();

        let value = execute_check(
            &Settings::default(),
            &file,
            ReportType::AuditOpinion,
            "public_company",
            "body",
            &[],
            None,
        )
        .await
        .unwrap();
        assert_eq!(value["compliant"], serde_json::Value::Bool(false));
        let violations = value["violations"].as_array().unwrap();
        assert!(violations.iter().any(|v| v["rule_id"] == "AUD-OPN-001"));
    }

    #[test]
    fn citations_against_catalogue() {
        let dir = tempfile::tempdir().unwrap();
        let standards = dir.path().join("standards.json");
        fs::write(
            &standards,
            r#"{"standards": [
                {"id": "as-2110", "issuing_body": "PCAOB", "number": "AS 2110"},
                {"id": "as-2110-r", "issuing_body": "PCAOB", "number": "AS 2110 (Revised 2023)", "supersedes": ["as-2110"]}
            ]}"#,
        )
        .unwrap();
        let file = dir.path().join("draft.md");
        fs::write(&file, "We followed [AS 2110] and [XYZ 1].").unwrap();

        let value = execute_citations(&file, &standards).unwrap();
        assert_eq!(value["total"], 2);
        assert_eq!(value["invalid"].as_array().unwrap().len(), 1);
        assert_eq!(value["superseded"].as_array().unwrap().len(), 1);
    }
}
