//! Interface de terminal do referral-router: spinner e saída colorida.
//!
//! Usa as crates `indicatif` para o spinner de progresso e `console` para
//! estilização com cores. O [`RunProgress`] acompanha visualmente
//! a execução de um encaminhamento no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::audit::AuditRecord;
use crate::state_machine::RunResult;

/// Indicador visual de progresso para uma execução no terminal.
///
/// O spinner e as mensagens de estado vão para stderr; o resultado em JSON
/// vai para stdout.
pub struct RunProgress {
    // Spinner do indicatif (desenhado em stderr).
    pb: ProgressBar,
    green: Style,
    red: Style,
    dim: Style,
}

impl RunProgress {
    /// Inicia o spinner com o nome do documento.
    pub fn start(document: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("Processing {document}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            dim: Style::new().dim(),
        }
    }

    /// Atualiza a mensagem do spinner (extração, consulta EMPI, workflow).
    pub fn phase(&self, message: &str) {
        self.pb.set_message(message.to_string());
    }

    /// Interrompe o spinner com uma falha anterior ao workflow.
    pub fn abort(&self, message: &str) {
        self.pb.finish_and_clear();
        eprintln!("  {} {message}", self.red.apply_to("✗"));
    }

    /// Finaliza o spinner e exibe o resultado da execução.
    ///
    /// Sucesso é mostrado em verde com checkmark; falha em vermelho com X.
    pub fn complete(&self, result: &RunResult) {
        self.pb.finish_and_clear();
        if result.success {
            let id = result
                .submission
                .as_ref()
                .and_then(|s| s.resource_id.as_deref())
                .unwrap_or("unknown");
            eprintln!(
                "  {} ServiceRequest/{id} created after {} repair(s)",
                self.green.apply_to("✓"),
                result.retry_count
            );
        } else {
            let reason = result
                .failure
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "run did not complete".to_string());
            eprintln!(
                "  {} {} ended in {}: {reason}",
                self.red.apply_to("✗"),
                result.run_id,
                result.final_state
            );
        }
        if result.audit_failures > 0 {
            eprintln!(
                "  {}",
                self.dim.apply_to(format!(
                    "{} audit record(s) could not be persisted",
                    result.audit_failures
                ))
            );
        }
    }
}

/// Recurso final e resultado da submissão, em JSON formatado.
pub fn print_result(result: &RunResult) {
    let output = serde_json::json!({
        "run_id": result.run_id,
        "final_resource": result.final_resource,
        "submission": result.submission,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&output).unwrap_or_default()
    );
}

/// Imprime a trilha de auditoria, um registro por linha.
pub fn print_audit(records: &[AuditRecord]) {
    let green = Style::new().green();
    let red = Style::new().red();
    let dim = Style::new().dim();

    eprintln!();
    eprintln!("{}", dim.apply_to("─── Audit Trail ───"));
    for record in records {
        let mark = if record.success {
            green.apply_to("✓")
        } else {
            red.apply_to("✗")
        };
        let detail = record.error_message.as_deref().unwrap_or("");
        eprintln!(
            "  {:>4} {mark} {:<8} retry={} {}",
            record.sequence_id,
            record.step.to_string(),
            record.retry_count_at_time,
            dim.apply_to(detail)
        );
    }
}
