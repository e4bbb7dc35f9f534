use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Placeholder shown instead of the dialogue API key.
const REDACTED: &str = "***";

/// The configuration as JSON, with secrets masked.
fn redacted(config: &AppConfig) -> Result<serde_json::Value, AppError> {
    let mut value = serde_json::to_value(config)?;
    if let Some(api_key) = value.pointer_mut("/dialogue/api_key") {
        if api_key.as_str().map_or(false, |key| !key.is_empty()) {
            *api_key = json!(REDACTED);
        }
    }
    Ok(value)
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": redacted(&config)?
    })))
}

/// Apply a partial configuration update. Live calls keep the settings they
/// started with.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let mut patch = body.into_inner();

    // Echoing the masked key back must not overwrite the real one
    if patch.pointer("/dialogue/api_key").and_then(|key| key.as_str()) == Some(REDACTED) {
        if let Some(dialogue) = patch.get_mut("dialogue").and_then(|d| d.as_object_mut()) {
            dialogue.remove("api_key");
        }
    }

    let json_str = serde_json::to_string(&patch)?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": redacted(&current_config)?
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_is_masked() {
        let mut config = AppConfig::default();
        config.dialogue.api_key = "sk-secret".to_string();

        let value = redacted(&config).unwrap();
        assert_eq!(value["dialogue"]["api_key"], REDACTED);
        assert_eq!(value["tts"]["max_attempts"], 3);
        assert!(!value.to_string().contains("sk-secret"));
    }

    #[test]
    fn test_empty_api_key_stays_empty() {
        let value = redacted(&AppConfig::default()).unwrap();
        assert_eq!(value["dialogue"]["api_key"], "");
    }
}
