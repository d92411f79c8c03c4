use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};

use referral_router::anthropic::AnthropicClient;
use referral_router::audit::{AuditStore, JsonlAuditStore};
use referral_router::checkpoint::{CheckpointStore, FileCheckpointStore};
use referral_router::cli::Cli;
use referral_router::config::RouterConfig;
use referral_router::draft::{LlmDraftGenerator, LlmDraftRepairer};
use referral_router::fhir::FhirClient;
use referral_router::intake::{DocumentExtractor, EmpiClient};
use referral_router::logging;
use referral_router::orchestrator::WorkflowEngine;
use referral_router::state_machine::{IdentityContext, RunState};
use referral_router::ui::{self, RunProgress};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Process one referral. `Ok(false)` means the run ended without success.
async fn run(cli: Cli) -> Result<bool> {
    let config = RouterConfig::load(&cli.config)?;
    logging::init(&config.log_level, cli.verbose);

    if config.api_key.is_empty() {
        bail!("no Anthropic API key: set ANTHROPIC_API_KEY or api_key in {}", cli.config.display());
    }
    let ceiling = cli.max_retries.unwrap_or(config.max_retries);

    let progress = RunProgress::start(&cli.document.display().to_string());

    progress.phase("Extracting document text");
    let extractor = DocumentExtractor::new(&config.pdf_service_url, config.extraction_timeout())?;
    let content = match extractor.extract(&cli.document).await {
        Ok(content) => content,
        Err(err) => {
            progress.abort(&format!("extraction failed: {err}"));
            return Ok(false);
        }
    };

    let identity = match &cli.identity_hint {
        Some(email) => {
            progress.phase("Looking up patient");
            EmpiClient::new(&config.empi_service_url, config.request_timeout())?
                .lookup_or_empty(email)
                .await
        }
        None => IdentityContext::new(),
    };

    let audit = Arc::new(
        JsonlAuditStore::open(&config.audit_path)
            .with_context(|| format!("cannot open audit log {}", config.audit_path.display()))?,
    );
    let checkpoints = Arc::new(
        FileCheckpointStore::open(&config.checkpoint_dir).with_context(|| {
            format!("cannot open checkpoint dir {}", config.checkpoint_dir.display())
        })?,
    );

    let initial = RunState::new(&cli.document, content, identity);
    if cli.fresh {
        info!(run_id = %initial.run_id, "discarding checkpoint");
        if let Err(err) = checkpoints.clear(&initial.run_id) {
            warn!(run_id = %initial.run_id, error = %err, "checkpoint could not be cleared");
        }
    }

    let fhir = FhirClient::new(&config.fhir_base_url, config.request_timeout())?;
    let anthropic = AnthropicClient::new(config.api_key.clone(), config.request_timeout())?;
    let settings = config.completion_settings();
    let engine = WorkflowEngine::new(
        LlmDraftGenerator::new(anthropic.clone(), fhir.clone(), settings.clone()),
        LlmDraftRepairer::new(anthropic, settings),
        fhir,
        audit.clone(),
    )
    .with_retry_ceiling(ceiling)
    .with_checkpoints(checkpoints);

    progress.phase("Running referral workflow");
    let result = engine.run(initial).await;
    progress.complete(&result);

    if result.success {
        ui::print_result(&result);
    }
    if cli.show_audit {
        match audit.records_for_run(&result.run_id) {
            Ok(records) => ui::print_audit(&records),
            Err(err) => warn!(error = %err, "could not read audit trail"),
        }
    }

    Ok(result.success)
}
