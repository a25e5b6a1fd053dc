use std::sync::Arc;

use serde_json::json;

use super::*;
use crate::state::test_helpers::{eventually, seed_project, seed_section, seed_widget, test_app_state};
use crate::widgets::WidgetKind;

#[tokio::test]
async fn never_connected_project_is_offline() {
    let (state, store, _) = test_app_state();
    let project = seed_project(&store, "p").await;

    assert_eq!(connection_status(&state, "p").await.unwrap(), ConnectionStatus::Offline);
    assert!(state.registry.find(project.id).await.is_none());
}

#[tokio::test]
async fn unknown_slug_is_not_found_everywhere() {
    let (state, _, _) = test_app_state();
    assert!(matches!(connect_project(&state, "nope").await, Err(DashboardError::ProjectNotFound(_))));
    assert!(matches!(disconnect_project(&state, "nope").await, Err(DashboardError::ProjectNotFound(_))));
    assert!(matches!(connection_status(&state, "nope").await, Err(DashboardError::ProjectNotFound(_))));
}

#[tokio::test]
async fn connect_subscribes_widget_topics_and_goes_online() {
    let (state, store, broker) = test_app_state();
    let project = seed_project(&store, "p").await;
    let section = seed_section(&store, project.id, "Main").await;
    seed_widget(&store, section.id, WidgetKind::Text, json!({"topic": "room/temp"})).await;
    seed_widget(&store, section.id, WidgetKind::Indicator, json!({"topic": "room/temp", "on_condition": "1"})).await;
    seed_widget(&store, section.id, WidgetKind::Button, json!({"topic": "room/fan", "message": "on"})).await;

    assert_eq!(connect_project(&state, "p").await.unwrap(), ConnectOutcome::Started);

    let s = state.clone();
    assert!(eventually(|| {
        let s = s.clone();
        async move { connection_status(&s, "p").await.unwrap() == ConnectionStatus::Online }
    })
    .await);
    let b = broker.clone();
    assert!(eventually(|| {
        let b = b.clone();
        async move { !b.subscribes().is_empty() }
    })
    .await);
    assert_eq!(broker.subscribes(), vec!["room/temp".to_owned()]);
}

#[tokio::test]
async fn connect_when_online_is_idempotent() {
    let (state, store, broker) = test_app_state();
    let project = seed_project(&store, "p").await;

    connect_project(&state, "p").await.unwrap();
    let s = state.clone();
    assert!(eventually(|| {
        let s = s.clone();
        async move { connection_status(&s, "p").await.unwrap() == ConnectionStatus::Online }
    })
    .await);

    assert_eq!(connect_project(&state, "p").await.unwrap(), ConnectOutcome::AlreadyOnline);
    assert_eq!(broker.connect_count(), 1);
    let first = state.registry.find(project.id).await.unwrap();
    connect_project(&state, "p").await.unwrap();
    assert!(Arc::ptr_eq(&first, &state.registry.find(project.id).await.unwrap()));
}

#[tokio::test]
async fn disconnect_then_reconnect_uses_current_widgets() {
    let (state, store, broker) = test_app_state();
    let project = seed_project(&store, "p").await;
    let section = seed_section(&store, project.id, "Main").await;
    seed_widget(&store, section.id, WidgetKind::Text, json!({"topic": "old"})).await;

    connect_project(&state, "p").await.unwrap();
    let s = state.clone();
    assert!(eventually(|| {
        let s = s.clone();
        async move { connection_status(&s, "p").await.unwrap() == ConnectionStatus::Online }
    })
    .await);

    disconnect_project(&state, "p").await.unwrap();
    let s = state.clone();
    assert!(eventually(|| {
        let s = s.clone();
        async move { connection_status(&s, "p").await.unwrap() == ConnectionStatus::Offline }
    })
    .await);

    seed_widget(&store, section.id, WidgetKind::Text, json!({"topic": "new"})).await;
    connect_project(&state, "p").await.unwrap();

    let session = state.registry.find(project.id).await.unwrap();
    let expected = vec!["new".to_owned(), "old".to_owned()];
    let check = session.clone();
    assert!(eventually(|| {
        let check = check.clone();
        let expected = expected.clone();
        async move { check.subscribed_topics().await == expected }
    })
    .await);
    assert_eq!(broker.connect_count(), 2);
}

#[tokio::test]
async fn failed_connect_leaves_project_offline() {
    let (state, store, broker) = test_app_state();
    seed_project(&store, "p").await;
    broker.fail_next_connects(1);

    connect_project(&state, "p").await.unwrap();

    let b = broker.clone();
    assert!(eventually(|| {
        let b = b.clone();
        async move { b.connect_count() == 1 }
    })
    .await);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(connection_status(&state, "p").await.unwrap(), ConnectionStatus::Offline);
}

#[tokio::test]
async fn disconnect_without_session_is_ok() {
    let (state, store, broker) = test_app_state();
    seed_project(&store, "p").await;

    disconnect_project(&state, "p").await.unwrap();
    assert_eq!(broker.disconnect_count(), 0);
}

#[tokio::test]
async fn malformed_widget_does_not_block_sibling_subscriptions() {
    let (state, store, broker) = test_app_state();
    let project = seed_project(&store, "p").await;
    let section = seed_section(&store, project.id, "Main").await;
    store.insert_raw_widget(section.id, "TEXT", Some(b"not json"));
    seed_widget(&store, section.id, WidgetKind::Text, json!({"topic": "ok"})).await;

    connect_project(&state, "p").await.unwrap();

    let b = broker.clone();
    assert!(eventually(|| {
        let b = b.clone();
        async move { b.subscribes() == vec!["ok".to_owned()] }
    })
    .await);
}
