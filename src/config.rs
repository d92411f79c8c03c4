//! Configuração do referral-router carregada a partir de `referral-router.toml`.
//!
//! A struct [`RouterConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! Variáveis de ambiente (`ANTHROPIC_API_KEY`, `FHIR_BASE_URL`,
//! `PDF_SERVICE_URL`, `EMPI_SERVICE_URL`) têm precedência sobre o arquivo.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::draft::CompletionSettings;

/// Nome do arquivo de configuração procurado no diretório atual.
pub const DEFAULT_CONFIG_FILE: &str = "referral-router.toml";

/// Configuração de nível superior carregada de `referral-router.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Chave da API Anthropic.
    pub api_key: String,

    /// Modelo usado para geração e reparo.
    pub model: String,

    pub max_tokens: u32,

    pub temperature: f32,

    /// Máximo de ciclos de reparo antes de abortar a execução.
    pub max_retries: u32,

    /// URL base do servidor FHIR (validação, submissão e identidades).
    pub fhir_base_url: String,

    /// URL do serviço de extração de texto.
    pub pdf_service_url: String,

    /// URL do serviço EMPI.
    pub empi_service_url: String,

    /// Arquivo JSONL da trilha de auditoria.
    pub audit_path: PathBuf,

    /// Diretório dos checkpoints por execução.
    pub checkpoint_dir: PathBuf,

    /// Timeout das chamadas HTTP ao FHIR, EMPI e Anthropic.
    pub request_timeout_secs: u64,

    /// Timeout da extração de texto, que costuma ser mais lenta.
    pub extraction_timeout_secs: u64,

    /// Nível de log padrão quando `RUST_LOG` não está definido.
    pub log_level: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let completion = CompletionSettings::default();
        Self {
            api_key: String::new(),
            model: completion.model,
            max_tokens: completion.max_tokens,
            temperature: completion.temperature,
            max_retries: 3,
            fhir_base_url: "http://localhost:8080/fhir".to_string(),
            pdf_service_url: "http://localhost:7001".to_string(),
            empi_service_url: "http://localhost:7002".to_string(),
            audit_path: PathBuf::from("./data/audit.jsonl"),
            checkpoint_dir: PathBuf::from("./data/checkpoints"),
            request_timeout_secs: 30,
            extraction_timeout_secs: 60,
            log_level: "info".to_string(),
        }
    }
}

impl RouterConfig {
    /// Carrega a configuração de `path`.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<RouterConfig>(&contents)
                .with_context(|| format!("invalid configuration in {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    // Variáveis de ambiente não vazias substituem os valores do arquivo.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let targets: [(&str, &mut String); 4] = [
            ("ANTHROPIC_API_KEY", &mut self.api_key),
            ("FHIR_BASE_URL", &mut self.fhir_base_url),
            ("PDF_SERVICE_URL", &mut self.pdf_service_url),
            ("EMPI_SERVICE_URL", &mut self.empi_service_url),
        ];
        for (name, field) in targets {
            if let Some(value) = lookup(name)
                && !value.is_empty()
            {
                *field = value;
            }
        }
    }

    /// Parâmetros do modelo para o gerador e o reparador.
    pub fn completion_settings(&self) -> CompletionSettings {
        CompletionSettings {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_secs)
    }
}
