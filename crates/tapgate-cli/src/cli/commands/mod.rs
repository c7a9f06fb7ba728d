use super::args::*;
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tapgate_core::batch::{BatchRegistry, TracingProgress};
use tapgate_core::config::{self, OracleConfig, OracleProvider, PipelineConfig};
use tapgate_core::engine::{ExecutionEngine, SqlExecutor, SqliteExecutor};
use tapgate_core::generate::{GenerationPolicy, TestCaseGenerator};
use tapgate_core::model::SqlDialect;
use tapgate_core::pipeline::Pipeline;
use tapgate_core::providers::oracle::fixture::FixtureOracle;
use tapgate_core::providers::oracle::openai::OpenAiOracle;
use tapgate_core::providers::oracle::GenerationOracle;
use tapgate_core::triage::TriagePolicy;

pub mod inspect;

pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const TEST_FAILED: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
}

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.cmd {
        Command::Run(args) => cmd_run(args).await,
        Command::Init(args) => cmd_init(args),
        Command::Validate(args) => inspect::cmd_validate(args).await,
        Command::Parse(args) => inspect::cmd_parse(args).await,
        Command::Classify(args) => inspect::cmd_classify(args),
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(args: InitArgs) -> anyhow::Result<i32> {
    let path = config::write_sample_config(&args.dir)?;
    eprintln!("created {}", path.display());
    eprintln!("next: tapgate run --config {}", path.display());
    Ok(exit_codes::OK)
}

async fn cmd_run(args: RunArgs) -> anyhow::Result<i32> {
    let mut cfg = match config::load_config(&args.config, args.strict) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("config error: {}", e);
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };
    config::apply_env_overrides(&mut cfg);
    if let Some(n) = args.parallel {
        cfg.settings.parallel = Some(n);
    }

    let pipeline = match build_pipeline(&cfg) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("config error: {:#}", e);
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };

    let mut plan = cfg.to_plan();
    let schema = Arc::new(cfg.schema_snapshot());
    tracing::info!(
        event = "run.start",
        config = %args.config.display(),
        test_cases = plan.len(),
        parallel = cfg.settings.parallel(),
        oracle = pipeline.generator.provider_name(),
    );

    let outcome = pipeline.run(&mut plan, schema, &cfg.goal).await?;

    if let Some(out) = &args.out {
        write_json(out, &plan)?;
    }

    match args.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&outcome.summary)?),
        _ => tapgate_core::report::console::print_summary(&outcome.summary),
    }

    if outcome.summary.has_failures() {
        Ok(exit_codes::TEST_FAILED)
    } else {
        Ok(exit_codes::OK)
    }
}

fn build_pipeline(cfg: &PipelineConfig) -> anyhow::Result<Pipeline> {
    let oracle = build_oracle(&cfg.oracle)?;
    let executor = build_executor(cfg.schema.dialect)?;

    let policy = GenerationPolicy {
        max_attempts: cfg.settings.max_generation_attempts(),
        timeout: Duration::from_secs(cfg.settings.timeout_seconds()),
    };

    Ok(Pipeline {
        registry: Arc::new(BatchRegistry::with_limit(cfg.settings.parallel())),
        generator: Arc::new(TestCaseGenerator::new(oracle, policy)),
        engine: Arc::new(ExecutionEngine::new(
            executor,
            Duration::from_secs(cfg.settings.execution_timeout_seconds()),
        )),
        progress: Arc::new(TracingProgress),
        triage: TriagePolicy {
            sql_retry_ceiling: cfg.settings.sql_retry_ceiling(),
        },
    })
}

fn build_oracle(cfg: &OracleConfig) -> anyhow::Result<Arc<dyn GenerationOracle>> {
    match cfg.provider {
        OracleProvider::Fixture => {
            let file = cfg
                .fixture_file
                .as_deref()
                .context("oracle.fixture_file is required for provider 'fixture'")?;
            Ok(Arc::new(FixtureOracle::from_path(Path::new(file))?))
        }
        OracleProvider::Openai => {
            let api_key = cfg
                .api_key
                .clone()
                .context("OPENAI_API_KEY must be set for provider 'openai'")?;
            let model = cfg.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
            let mut client = OpenAiOracle::new(
                model,
                api_key,
                cfg.temperature.unwrap_or(0.0),
                cfg.max_tokens.unwrap_or(1200),
            );
            if let Some(url) = &cfg.base_url {
                client = client.with_base_url(url.clone());
            }
            Ok(Arc::new(client))
        }
    }
}

fn build_executor(dialect: SqlDialect) -> anyhow::Result<Arc<dyn SqlExecutor>> {
    match dialect {
        SqlDialect::Sqlite => Ok(Arc::new(SqliteExecutor::new())),
        SqlDialect::Postgres => anyhow::bail!(
            "no built-in executor for dialect 'postgres'; embed tapgate-core and supply a SqlExecutor"
        ),
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_string_pretty(value)?;
    std::fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))?;
    eprintln!("wrote {}", path.display());
    Ok(())
}
