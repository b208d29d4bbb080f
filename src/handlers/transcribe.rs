//! `POST /transcribe`: multipart upload in, `{"text": ...}` out.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::transcription::RequestId;
use actix_multipart::Multipart;
use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::stream::StreamExt;
use tracing::debug;

/// Header carrying the shared-secret token.
pub const API_KEY_HEADER: &str = "X-API-KEY";

/// Multipart field names accepted for the audio file.
const AUDIO_FIELDS: &[&str] = &["file", "audio"];

/// Transcribe an uploaded audio file.
///
/// The API key is checked before the body is read, so unauthenticated
/// uploads are never buffered and never trigger a model load.
pub async fn transcribe(
    req: HttpRequest,
    payload: Multipart,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let api_key = req.headers().get(API_KEY_HEADER).map(|value| value.as_bytes());
    let request_id = state.pipeline.authorize(api_key)?;

    let audio = read_audio(payload, state.config.max_upload_bytes(), request_id).await?;
    let result = state.pipeline.transcribe(request_id, audio).await?;

    Ok(HttpResponse::Ok().json(result))
}

async fn read_audio(mut payload: Multipart, limit: usize, request_id: RequestId) -> AppResult<Vec<u8>> {
    while let Some(item) = payload.next().await {
        let mut field = item?;
        let is_audio = field
            .content_disposition()
            .and_then(|cd| cd.get_name())
            .map(|name| AUDIO_FIELDS.contains(&name))
            .unwrap_or(false);

        if !is_audio {
            while let Some(chunk) = field.next().await {
                chunk?;
            }
            continue;
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk?;
            if bytes.len() + chunk.len() > limit {
                return Err(AppError::BadRequest(format!(
                    "File too large (max {} bytes)",
                    limit
                )));
            }
            bytes.extend_from_slice(&chunk);
        }

        debug!(%request_id, bytes = bytes.len(), "upload received");
        return Ok(bytes);
    }

    Err(AppError::BadRequest("No audio file provided".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::handlers;
    use crate::pipeline::TranscriptionPipeline;
    use crate::transcription::testing::{manager_with, StubLoader, StubModel};
    use crate::transcription::lifecycle::LifecycleStatus;
    use crate::transcription::DecodeOptions;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use serde_json::Value;
    use std::sync::Arc;

    const BOUNDARY: &str = "stt-test-boundary";

    fn app_state(token: &str, loader: &Arc<StubLoader>) -> AppState {
        let mut config = AppConfig::default();
        config.auth.api_token = token.to_string();
        config.server.max_upload_mb = 1;
        let pipeline = TranscriptionPipeline::new(token, DecodeOptions::default(), manager_with(loader));
        AppState::new(config, Arc::new(pipeline))
    }

    fn multipart(field: &str, data: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"clip.wav\"\r\nContent-Type: audio/wav\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload(field: &str, data: &[u8]) -> test::TestRequest {
        test::TestRequest::post()
            .uri("/transcribe")
            .insert_header((
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            ))
            .set_payload(multipart(field, data))
    }

    #[actix_web::test]
    async fn test_valid_key_is_transcribed() {
        let loader = Arc::new(StubLoader::new(StubModel::segments(&["hel", "lo "])));
        let state = app_state("secret", &loader);
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(handlers::configure)).await;

        let req = upload("file", b"RIFF....WAVE").insert_header((API_KEY_HEADER, "secret")).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body, serde_json::json!({ "text": "hello " }));
        assert_eq!(loader.load_count(), 1);
    }

    #[actix_web::test]
    async fn test_wrong_or_missing_key_is_401_without_loading() {
        let loader = Arc::new(StubLoader::new(StubModel::segments(&["x"])));
        let state = app_state("secret", &loader);
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(handlers::configure)).await;

        let wrong = upload("file", b"audio").insert_header((API_KEY_HEADER, "wrong")).to_request();
        let resp = test::call_service(&app, wrong).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body: Value = test::read_body_json(resp).await;
        assert!(body["detail"].as_str().unwrap().contains("API key"));

        let missing = upload("file", b"audio").to_request();
        let resp = test::call_service(&app, missing).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        assert_eq!(loader.load_count(), 0);
    }

    #[actix_web::test]
    async fn test_no_token_accepts_requests_without_header() {
        let loader = Arc::new(StubLoader::new(StubModel::segments(&["ok"])));
        let state = app_state("", &loader);
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(handlers::configure)).await;

        let resp = test::call_service(&app, upload("audio", b"bytes").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_inference_failure_is_500_with_reason() {
        let loader = Arc::new(StubLoader::new(StubModel::failing("Malformed WAV file")));
        let state = app_state("", &loader);
        let data = web::Data::new(state);
        let app = test::init_service(App::new().app_data(data.clone()).configure(handlers::configure)).await;

        let resp = test::call_service(&app, upload("file", b"junk").to_request()).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = test::read_body_json(resp).await;
        assert!(body["detail"].as_str().unwrap().contains("Malformed WAV file"));
        assert!(!body.to_string().contains("req-"));

        assert_eq!(
            data.pipeline.manager().status(),
            LifecycleStatus::Ready { generation: 1 }
        );
    }

    #[actix_web::test]
    async fn test_load_failure_is_500() {
        let loader = Arc::new(StubLoader::new(StubModel::segments(&["x"])).failing_first(1));
        let state = app_state("", &loader);
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(handlers::configure)).await;

        let resp = test::call_service(&app, upload("file", b"bytes").to_request()).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["type"], "model_unavailable");
        assert!(body["detail"].as_str().unwrap().contains("device unavailable"));
    }

    #[actix_web::test]
    async fn test_missing_audio_field_is_400() {
        let loader = Arc::new(StubLoader::new(StubModel::segments(&["x"])));
        let state = app_state("", &loader);
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(handlers::configure)).await;

        let resp = test::call_service(&app, upload("notes", b"text").to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(loader.load_count(), 0);
    }

    #[actix_web::test]
    async fn test_oversized_upload_is_rejected() {
        let loader = Arc::new(StubLoader::new(StubModel::segments(&["x"])));
        let state = app_state("", &loader);
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(handlers::configure)).await;

        let big = vec![0u8; 1024 * 1024 + 1];
        let resp = test::call_service(&app, upload("file", &big).to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
