//! Tipos de erro para o cliente da API Anthropic.
//!
//! Timeouts são separados dos demais erros de rede para que o motor de
//! workflow os reporte como falha de execução com mensagem clara.

use thiserror::Error;

/// Erros que podem ocorrer ao interagir com a API da Anthropic.
#[derive(Debug, Error)]
pub enum AnthropicError {
    /// O servidor retornou HTTP 429 (rate limit).
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Erro retornado pela API (ex.: 401 chave inválida, 500 erro interno).
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// A requisição excedeu o timeout configurado.
    #[error("request timed out")]
    Timeout,

    /// O corpo da resposta não tem o formato esperado.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Falha de rede subjacente (DNS, conexão recusada).
    #[error("network error: {0}")]
    NetworkError(reqwest::Error),
}

impl From<reqwest::Error> for AnthropicError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AnthropicError::Timeout
        } else {
            AnthropicError::NetworkError(err)
        }
    }
}
