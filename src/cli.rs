//! Interface de linha de comando do referral-router baseada em clap.
//!
//! Define a struct [`Cli`]: o documento de encaminhamento, uma dica de
//! identidade opcional e as flags globais (--config, --max-retries, --fresh,
//! --show-audit, --verbose).

use std::path::PathBuf;

use clap::Parser;

use crate::config::DEFAULT_CONFIG_FILE;

/// referral-router: transforma um encaminhamento em um ServiceRequest FHIR validado.
#[derive(Debug, Parser)]
#[command(name = "referral-router", version, about)]
pub struct Cli {
    /// Caminho do documento de encaminhamento (PDF).
    pub document: PathBuf,

    /// E-mail do paciente para consulta no EMPI.
    pub identity_hint: Option<String>,

    /// Arquivo de configuração TOML.
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Número máximo de ciclos de reparo.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Descarta qualquer checkpoint existente deste documento.
    #[arg(long, default_value_t = false)]
    pub fresh: bool,

    /// Imprime a trilha de auditoria da execução ao final.
    #[arg(long, default_value_t = false)]
    pub show_audit: bool,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}
