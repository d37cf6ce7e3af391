//! Router-level tests using `tower::ServiceExt::oneshot`.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;

use crewline::config::{OrchestratorSettings, RoleSettings, Settings};
use crewline::server::{AppState, create_router};

fn test_settings() -> Settings {
    let role = |id: &str, name: &str, app_id: &str| RoleSettings {
        id: id.to_string(),
        display_name: name.to_string(),
        emoji: "🤖".to_string(),
        app_id: app_id.to_string(),
        app_secret: "secret".to_string(),
        system_prompt: Some(format!("You are the {name}.")),
        prompt_file: None,
    };
    Settings {
        roles: vec![
            role("ceo_assistant", "CEO Assistant", "cli_ceo"),
            role("developer", "Developer", "cli_dev"),
        ],
        orchestrator: OrchestratorSettings {
            coordinator: "ceo_assistant".to_string(),
            max_rounds: 20,
        },
        ..Settings::default()
    }
}

fn test_router() -> Router {
    create_router(AppState::new(test_settings()).unwrap())
}

async fn post_webhook(app: Router, body: Value) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::post("/webhook")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_health_lists_roles() {
    let response = test_router()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "crewline");
    assert_eq!(body["active_roles"], 2);
    assert_eq!(body["roles"][0]["id"], "ceo_assistant");
    assert_eq!(body["roles"][1]["name"], "Developer");
}

#[tokio::test]
async fn test_challenge_echo() {
    let (status, body) = post_webhook(
        test_router(),
        json!({"challenge": "abc123", "type": "url_verification"}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["challenge"], "abc123");
}

#[tokio::test]
async fn test_non_message_events_are_skipped() {
    let (status, body) = post_webhook(
        test_router(),
        json!({
            "header": {
                "event_id": "evt-bot-added",
                "event_type": "im.chat.member.bot.added_v1",
                "app_id": "cli_ceo",
            },
            "event": {},
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "skipped");
}

#[tokio::test]
async fn test_unknown_app_id_matches_no_role() {
    let (_, body) = post_webhook(
        test_router(),
        json!({
            "header": {
                "event_id": "evt-unknown-app",
                "event_type": "im.message.receive_v1",
                "app_id": "cli_stranger",
            },
            "event": {
                "message": {
                    "message_type": "text",
                    "chat_id": "oc_1",
                    "content": "{\"text\": \"hello\"}",
                },
                "sender": {"sender_id": {"open_id": "ou_1"}},
            },
        }),
    )
    .await;

    assert_eq!(body["status"], "no_role");
}

#[tokio::test]
async fn test_duplicate_event_handled_once() {
    let app = test_router();
    let event = json!({
        "header": {
            "event_id": "evt-dup",
            "event_type": "im.chat.member.bot.added_v1",
            "app_id": "cli_ceo",
        },
        "event": {},
    });

    let (_, first) = post_webhook(app.clone(), event.clone()).await;
    assert_eq!(first["status"], "skipped");

    // Redelivery short-circuits at the dedup cache.
    let (_, second) = post_webhook(app, event).await;
    assert_eq!(second["status"], "success");
}
