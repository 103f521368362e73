/// Tests for the routing rules and wire-format contracts
use conversa_core::models::{
    DeliveryCallback, Handler, MessageStatus, Responsible, TransferRequest,
};
use conversa_core::responsibility::compute_responsibles;
use uuid::Uuid;

fn profile(name: &str, active: bool, agents: serde_json::Value) -> conversa_core::models::Profile {
    conversa_core::models::Profile {
        id: Uuid::new_v4(),
        company_id: "empresa-1".to_string(),
        display_name: name.to_string(),
        active,
        agents,
    }
}

#[test]
fn toggle_from_unknown_state_hands_to_human() {
    // A lead that never had a discriminator set goes to a human on toggle.
    assert_eq!(Handler::next_after_toggle(None), Handler::Human);
    assert_eq!(
        Handler::next_after_toggle(Some(Handler::Human)),
        Handler::Agent
    );
    assert_eq!(
        Handler::next_after_toggle(Some(Handler::Agent)),
        Handler::Human
    );
}

#[test]
fn handler_labels_round_trip() {
    assert_eq!(Handler::from_label("Humano"), Some(Handler::Human));
    assert_eq!(Handler::from_label("Agente"), Some(Handler::Agent));
    assert_eq!(Handler::from_label("humano"), Some(Handler::Human));
    assert_eq!(Handler::from_label("robot"), None);
    assert_eq!(Handler::Human.as_str(), "Humano");
    assert_eq!(Handler::Agent.as_str(), "Agente");
}

#[test]
fn responsibles_projection_sorts_humans_and_appends_agent() {
    let profiles = vec![
        profile("Zuleica", true, serde_json::json!([])),
        profile("Alberto", true, serde_json::json!(["Assistente"])),
        profile("Marcos", false, serde_json::json!(["Assistente"])),
    ];

    let entries = compute_responsibles("empresa-1", &profiles, "Assistente");

    // Inactive profiles contribute nothing; humans come sorted by name and
    // the agent entry closes the list because an active profile enables it.
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].display_name, "Alberto");
    assert_eq!(entries[0].kind, "human");
    assert_eq!(entries[1].display_name, "Zuleica");
    assert_eq!(entries[2].display_name, "Assistente");
    assert_eq!(entries[2].kind, "agent");
    assert!(entries[2].profile_id.is_none());
}

#[test]
fn agent_entry_requires_an_active_enabling_profile() {
    // The only profile with the agent enabled is inactive.
    let profiles = vec![
        profile("Alberto", true, serde_json::json!([])),
        profile("Marcos", false, serde_json::json!(["Assistente"])),
    ];

    let entries = compute_responsibles("empresa-1", &profiles, "Assistente");
    assert_eq!(entries.len(), 1);
    assert!(entries.iter().all(|e| e.kind == "human"));
}

#[test]
fn transfer_request_flattens_typed_target() {
    let req: TransferRequest = serde_json::from_str(
        r#"{
            "company_id": "empresa-1",
            "kind": "human",
            "profile_id": "8f14e45f-ceea-4e67-b6f1-43a0e6bafce1",
            "display_name": "Alberto"
        }"#,
    )
    .unwrap();

    match &req.target {
        Responsible::Human { display_name, .. } => assert_eq!(display_name, "Alberto"),
        other => panic!("expected human target, got {:?}", other),
    }
    assert_eq!(req.target.implied_handler(), Handler::Human);
}

#[test]
fn delivery_callback_accepts_request_id_alias() {
    let id = Uuid::new_v4();

    let canonical: DeliveryCallback =
        serde_json::from_str(&format!(r#"{{"message_id":"{}","status":"sent"}}"#, id)).unwrap();
    assert_eq!(canonical.message_id, id);

    // Older provider versions report the id under "request_id".
    let aliased: DeliveryCallback =
        serde_json::from_str(&format!(r#"{{"request_id":"{}","status":"completed"}}"#, id))
            .unwrap();
    assert_eq!(aliased.message_id, id);
    assert_eq!(
        MessageStatus::from_callback_marker(&aliased.status),
        Some(MessageStatus::Delivered)
    );
}

#[test]
fn callback_markers_map_onto_the_ladder() {
    assert_eq!(
        MessageStatus::from_callback_marker("SENT"),
        Some(MessageStatus::Sent)
    );
    assert_eq!(
        MessageStatus::from_callback_marker("read"),
        Some(MessageStatus::Read)
    );
    assert_eq!(
        MessageStatus::from_callback_marker("failed"),
        Some(MessageStatus::Failed)
    );
    assert_eq!(MessageStatus::from_callback_marker("queued"), None);
}
