//! Tipos de dados para requisições e respostas da API Anthropic Messages.
//!
//! Todas as structs derivam `Serialize` e `Deserialize` para conversão JSON
//! conforme o formato esperado pelo endpoint `v1/messages` da Anthropic.

use serde::{Deserialize, Serialize};

/// Corpo da requisição para o endpoint `/v1/messages` da API Anthropic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    /// Identificador do modelo a ser usado (ex.: "claude-sonnet-4-5-20250929").
    pub model: String,
    /// Número máximo de tokens na resposta gerada pelo modelo.
    pub max_tokens: u32,
    /// Temperatura de amostragem. Omitida do JSON quando `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Lista de mensagens compondo a conversa (usuário e assistente).
    pub messages: Vec<Message>,
}

/// Uma única mensagem em uma conversa com a API Anthropic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Papel do remetente: "user" ou "assistant".
    pub role: String,
    /// Conteúdo textual da mensagem.
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Resposta retornada pelo endpoint `/v1/messages` da API Anthropic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    /// Identificador único da resposta (gerado pela API).
    pub id: String,
    /// Blocos de conteúdo na resposta (normalmente texto).
    pub content: Vec<ContentBlock>,
    /// Modelo que gerou a resposta.
    pub model: String,
    /// Motivo da parada da geração (ex.: "end_turn", "max_tokens").
    pub stop_reason: Option<String>,
    /// Estatísticas de uso de tokens (entrada e saída).
    pub usage: Usage,
}

impl MessagesResponse {
    /// Concatena os blocos de texto da resposta, ignorando os demais tipos.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|b| b.content_type == "text")
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Um bloco de conteúdo dentro da resposta.
///
/// O campo `content_type` é serializado como `"type"` no JSON via `serde(rename)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    /// Tipo do bloco ("text"). Serializado como "type" no JSON.
    #[serde(rename = "type")]
    pub content_type: String,
    /// Conteúdo textual deste bloco. Vazio para blocos que não são texto.
    #[serde(default)]
    pub text: String,
}

/// Estatísticas de consumo de tokens para uma chamada à API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_is_omitted_when_unset() {
        let req = MessagesRequest {
            model: "claude-sonnet-4-5-20250929".into(),
            max_tokens: 4096,
            temperature: None,
            messages: vec![Message::user("Hello")],
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("temperature"));

        let req = MessagesRequest {
            temperature: Some(0.1),
            ..req
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json["temperature"].as_f64().unwrap() > 0.09);
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn text_joins_only_text_blocks() {
        let api_json = r#"{
            "id": "msg_123",
            "content": [
                {"type": "text", "text": "{\"a\":"},
                {"type": "thinking"},
                {"type": "text", "text": "1}"}
            ],
            "model": "claude-sonnet-4-5-20250929",
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 5, "output_tokens": 15}
        }"#;
        let resp: MessagesResponse = serde_json::from_str(api_json).unwrap();
        assert_eq!(resp.text(), r#"{"a":1}"#);
    }

    #[test]
    fn content_block_type_field_renames_correctly() {
        let block = ContentBlock {
            content_type: "text".into(),
            text: "hello".into(),
        };
        let json = serde_json::to_string(&block).unwrap();
        assert!(json.contains(r#""type""#));
        assert!(!json.contains("content_type"));
    }

    #[test]
    fn messages_response_null_stop_reason() {
        let json = r#"{
            "id": "msg_456",
            "content": [],
            "model": "test",
            "stop_reason": null,
            "usage": {"input_tokens": 0, "output_tokens": 0}
        }"#;
        let resp: MessagesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.stop_reason, None);
        assert_eq!(resp.text(), "");
    }
}
