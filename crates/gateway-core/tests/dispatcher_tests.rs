//! Control protocol scenarios driven through the dispatcher.

mod common;

use serde_json::{json, Value};

use common::{test_gateway, TestGateway, ECHO_PACKAGE, OFFER_SDP};
use janus_gateway_core::RequestScope;

async fn post(t: &TestGateway, scope: RequestScope, body: Value) -> Value {
    let reply = t.dispatcher.handle_post(scope, &body.to_string()).await;
    serde_json::from_str(&reply).expect("replies are valid JSON")
}

async fn post_raw(t: &TestGateway, scope: RequestScope, body: &str) -> Value {
    let reply = t.dispatcher.handle_post(scope, body).await;
    serde_json::from_str(&reply).expect("replies are valid JSON")
}

async fn create_session(t: &TestGateway) -> u64 {
    let reply = post(
        t,
        RequestScope::Root,
        json!({ "janus": "create", "transaction": "t-create" }),
    )
    .await;
    assert_eq!(reply["janus"], "success");
    reply["data"]["id"].as_u64().expect("session id")
}

async fn attach_echo(t: &TestGateway, session: u64) -> u64 {
    let reply = post(
        t,
        RequestScope::Session(session),
        json!({ "janus": "attach", "transaction": "t-attach", "plugin": ECHO_PACKAGE }),
    )
    .await;
    assert_eq!(reply["janus"], "success", "attach failed: {reply}");
    reply["data"]["id"].as_u64().expect("handle id")
}

async fn next_event(t: &TestGateway, session: u64) -> Value {
    let reply = t.dispatcher.long_poll(session).await;
    serde_json::from_str(&reply).expect("events are valid JSON")
}

#[tokio::test]
async fn create_and_destroy_round_trip() {
    let t = test_gateway().await;
    let session = create_session(&t).await;

    let reply = post(
        &t,
        RequestScope::Session(session),
        json!({ "janus": "destroy", "transaction": "t2" }),
    )
    .await;
    assert_eq!(reply["janus"], "success");
    assert_eq!(reply["transaction"], "t2");

    // A long poll on the destroyed session reports it gone.
    let reply = next_event(&t, session).await;
    assert_eq!(reply["janus"], "error");
    assert_eq!(reply["error"]["code"], 458);
}

#[tokio::test]
async fn attach_to_an_unknown_plugin_fails() {
    let t = test_gateway().await;
    let session = create_session(&t).await;
    let reply = post(
        &t,
        RequestScope::Session(session),
        json!({ "janus": "attach", "transaction": "t", "plugin": "nope" }),
    )
    .await;
    assert_eq!(reply["janus"], "error");
    assert_eq!(reply["error"]["code"], 460);
    assert_eq!(reply["error"]["reason"], "No such plugin 'nope'");
}

#[tokio::test]
async fn malformed_json_reports_position() {
    let t = test_gateway().await;
    let reply = post_raw(&t, RequestScope::Root, "{\"janus\": \"create\",").await;
    assert_eq!(reply["janus"], "error");
    assert_eq!(reply["error"]["code"], 454);
    let reason = reply["error"]["reason"].as_str().unwrap();
    assert!(reason.starts_with("JSON error: on line"), "reason: {reason}");
}

#[tokio::test]
async fn non_object_payloads_are_rejected() {
    let t = test_gateway().await;
    let reply = post_raw(&t, RequestScope::Root, "[1, 2, 3]").await;
    assert_eq!(reply["error"]["code"], 455);
    assert_eq!(reply["error"]["reason"], "JSON error: not an object");
}

#[tokio::test]
async fn missing_mandatory_elements_are_flagged() {
    let t = test_gateway().await;

    let reply = post(&t, RequestScope::Root, json!({ "janus": "create" })).await;
    assert_eq!(reply["error"]["code"], 456);
    assert!(reply.get("transaction").is_none());

    let reply = post(&t, RequestScope::Root, json!({ "transaction": "t9" })).await;
    assert_eq!(reply["error"]["code"], 456);
    assert_eq!(reply["transaction"], "t9");
}

#[tokio::test]
async fn empty_body_is_a_missing_request() {
    let t = test_gateway().await;
    let reply = post_raw(&t, RequestScope::Root, "").await;
    assert_eq!(reply["error"]["code"], 452);
}

#[tokio::test]
async fn commands_at_the_wrong_scope_are_rejected() {
    let t = test_gateway().await;
    let session = create_session(&t).await;
    let handle = attach_echo(&t, session).await;

    // message is handle-scoped.
    let reply = post(
        &t,
        RequestScope::Session(session),
        json!({ "janus": "message", "transaction": "t", "body": {} }),
    )
    .await;
    assert_eq!(reply["error"]["code"], 457);

    // destroy is session-scoped.
    let reply = post(
        &t,
        RequestScope::Handle { session, handle },
        json!({ "janus": "destroy", "transaction": "t" }),
    )
    .await;
    assert_eq!(reply["error"]["code"], 457);

    // attach at the root is not even a known path command.
    let reply = post(
        &t,
        RequestScope::Root,
        json!({ "janus": "attach", "transaction": "t", "plugin": ECHO_PACKAGE }),
    )
    .await;
    assert_eq!(reply["error"]["code"], 457);

    // A command nobody knows.
    let reply = post(
        &t,
        RequestScope::Session(session),
        json!({ "janus": "frobnicate", "transaction": "t" }),
    )
    .await;
    assert_eq!(reply["error"]["code"], 453);
}

#[tokio::test]
async fn unknown_sessions_and_handles_are_distinct_errors() {
    let t = test_gateway().await;
    let reply = post(
        &t,
        RequestScope::Session(404_404),
        json!({ "janus": "destroy", "transaction": "t" }),
    )
    .await;
    assert_eq!(reply["error"]["code"], 458);

    let session = create_session(&t).await;
    let reply = post(
        &t,
        RequestScope::Handle { session, handle: 1 },
        json!({ "janus": "detach", "transaction": "t" }),
    )
    .await;
    assert_eq!(reply["error"]["code"], 459);
}

#[tokio::test]
async fn message_body_validation() {
    let t = test_gateway().await;
    let session = create_session(&t).await;
    let handle = attach_echo(&t, session).await;
    let scope = RequestScope::Handle { session, handle };

    let reply = post(&t, scope, json!({ "janus": "message", "transaction": "t" })).await;
    assert_eq!(reply["error"]["code"], 456);

    let reply = post(
        &t,
        scope,
        json!({ "janus": "message", "transaction": "t", "body": "not an object" }),
    )
    .await;
    assert_eq!(reply["error"]["code"], 455);
    assert_eq!(reply["error"]["reason"], "Invalid body object");
}

#[tokio::test]
async fn jsep_validation() {
    let t = test_gateway().await;
    let session = create_session(&t).await;
    let handle = attach_echo(&t, session).await;
    let scope = RequestScope::Handle { session, handle };

    let reply = post(
        &t,
        scope,
        json!({
            "janus": "message", "transaction": "t", "body": {},
            "jsep": { "type": "pranswer", "sdp": OFFER_SDP },
        }),
    )
    .await;
    assert_eq!(reply["error"]["code"], 464);

    let reply = post(
        &t,
        scope,
        json!({
            "janus": "message", "transaction": "t", "body": {},
            "jsep": { "type": "offer" },
        }),
    )
    .await;
    assert_eq!(reply["error"]["code"], 456);

    let reply = post(
        &t,
        scope,
        json!({
            "janus": "message", "transaction": "t", "body": {},
            "jsep": { "type": "offer", "sdp": "garbage" },
        }),
    )
    .await;
    assert_eq!(reply["error"]["code"], 465);
}

#[tokio::test]
async fn message_acks_then_delivers_the_event_asynchronously() {
    let t = test_gateway().await;
    let session = create_session(&t).await;
    let handle = attach_echo(&t, session).await;

    let reply = post(
        &t,
        RequestScope::Handle { session, handle },
        json!({ "janus": "message", "transaction": "t-msg", "body": { "foo": "bar" } }),
    )
    .await;
    assert_eq!(reply["janus"], "ack");
    assert_eq!(reply["transaction"], "t-msg");

    let event = next_event(&t, session).await;
    assert_eq!(event["janus"], "event");
    assert_eq!(event["sender"].as_u64(), Some(handle));
    assert_eq!(event["transaction"], "t-msg");
    assert_eq!(event["plugindata"]["plugin"], ECHO_PACKAGE);
    assert_eq!(event["plugindata"]["data"]["result"]["foo"], "bar");
}

#[tokio::test]
async fn events_are_delivered_in_enqueue_order() {
    let t = test_gateway().await;
    let session = create_session(&t).await;
    let handle = attach_echo(&t, session).await;
    for i in 0u64..5 {
        let reply = post(
            &t,
            RequestScope::Handle { session, handle },
            json!({ "janus": "message", "transaction": format!("t{i}"), "body": { "seq": i } }),
        )
        .await;
        assert_eq!(reply["janus"], "ack");
    }
    for i in 0u64..5 {
        let event = next_event(&t, session).await;
        assert_eq!(event["plugindata"]["data"]["result"]["seq"].as_u64(), Some(i));
    }
}

#[tokio::test]
async fn an_offer_sets_up_ice_exactly_once_before_the_reply() {
    let t = test_gateway().await;
    let session = create_session(&t).await;
    let handle = attach_echo(&t, session).await;

    let reply = post(
        &t,
        RequestScope::Handle { session, handle },
        json!({
            "janus": "message", "transaction": "t-offer", "body": {},
            "jsep": { "type": "offer", "sdp": OFFER_SDP },
        }),
    )
    .await;
    assert_eq!(reply["janus"], "ack");

    let event = next_event(&t, session).await;
    assert_eq!(event["jsep"]["type"], "answer");
    let sdp = event["jsep"]["sdp"].as_str().unwrap();
    // Merged with our credentials, stripped of the browser's.
    assert!(sdp.contains("a=ice-ufrag:"));
    assert!(sdp.contains("a=fingerprint:sha-256"));
    assert!(!sdp.contains("browsersecret"));

    let link = t.ice.links.get(&handle).expect("link was created").clone();
    assert_eq!(link.setup_calls(), 1);
    // The browser's description reached the transport and the answer
    // direction installed remote candidates for both components.
    assert!(link.remote_description().is_some());
    assert_eq!(link.installed_remote_candidates().len(), 4);
}

#[tokio::test]
async fn idle_long_poll_times_out_with_a_keepalive() {
    let t = test_gateway().await;
    let session = create_session(&t).await;
    let reply = next_event(&t, session).await;
    assert_eq!(reply, json!({ "janus": "keepalive" }));
}

#[tokio::test]
async fn detach_removes_the_handle() {
    let t = test_gateway().await;
    let session = create_session(&t).await;
    let handle = attach_echo(&t, session).await;

    let reply = post(
        &t,
        RequestScope::Handle { session, handle },
        json!({ "janus": "detach", "transaction": "t" }),
    )
    .await;
    assert_eq!(reply["janus"], "success");

    let reply = post(
        &t,
        RequestScope::Handle { session, handle },
        json!({ "janus": "message", "transaction": "t", "body": {} }),
    )
    .await;
    assert_eq!(reply["error"]["code"], 459);
}
