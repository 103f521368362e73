/// Storage integration tests against a real Postgres instance.
///
/// These tests are ignored by default. Run them with a database that has
/// schema.sql applied:
///
///   TEST_DATABASE_URL=postgresql://localhost/conversa_test cargo test -- --ignored
use conversa_core::conversation::{ConversationStore, NewMessage, StatusAdvance};
use conversa_core::identity::{normalize_identifiers, ContactIdentifiers, IdentityResolver};
use conversa_core::models::MessageStatus;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

async fn test_pool() -> PgPool {
    let url = std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set for storage integration tests");
    PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("failed to connect to test database")
}

fn unique_company() -> String {
    format!("test-company-{}", Uuid::new_v4())
}

fn ids_for_phone(phone: &str) -> conversa_core::identity::NormalizedIdentifiers {
    normalize_identifiers(&ContactIdentifiers {
        phone: Some(phone.to_string()),
        jid: None,
        email: None,
    })
}

#[tokio::test]
#[ignore]
async fn resolve_or_create_is_idempotent() {
    let pool = test_pool().await;
    let resolver = IdentityResolver::new(pool.clone());
    let company = unique_company();
    let ids = ids_for_phone("+5511987654321");

    let first = resolver
        .resolve_or_create(&company, &ids, "Ana Souza")
        .await
        .unwrap();
    assert!(first.was_created());
    let first_id = first.into_lead().id;

    let second = resolver
        .resolve_or_create(&company, &ids, "Ana Souza")
        .await
        .unwrap();
    assert!(!second.was_created());
    assert_eq!(second.into_lead().id, first_id);
}

#[tokio::test]
#[ignore]
async fn same_identifier_in_two_companies_gets_two_leads() {
    let pool = test_pool().await;
    let resolver = IdentityResolver::new(pool.clone());
    let ids = ids_for_phone("+5521912345678");

    let a = resolver
        .resolve_or_create(&unique_company(), &ids, "Bruno Lima")
        .await
        .unwrap()
        .into_lead();
    let b = resolver
        .resolve_or_create(&unique_company(), &ids, "Bruno Lima")
        .await
        .unwrap()
        .into_lead();

    assert_ne!(a.id, b.id);
}

#[tokio::test]
#[ignore]
async fn concurrent_conversation_creation_converges() {
    let pool = test_pool().await;
    let resolver = IdentityResolver::new(pool.clone());
    let store = ConversationStore::new(pool.clone());
    let company = unique_company();
    let ids = ids_for_phone("+5531955554444");

    let lead = resolver
        .resolve_or_create(&company, &ids, "Carla Dias")
        .await
        .unwrap()
        .into_lead();

    // Both racers must land on the same conversation row.
    let store_a = store.clone();
    let store_b = store.clone();
    let lead_a = lead.clone();
    let lead_b = lead.clone();

    let (a, b) = tokio::join!(
        tokio::spawn(async move { store_a.get_or_create(&lead_a, "WhatsApp").await }),
        tokio::spawn(async move { store_b.get_or_create(&lead_b, "WhatsApp").await }),
    );

    let conv_a = a.unwrap().unwrap();
    let conv_b = b.unwrap().unwrap();
    assert_eq!(conv_a.id, conv_b.id);
}

#[tokio::test]
#[ignore]
async fn out_of_order_status_callback_is_ignored() {
    let pool = test_pool().await;
    let resolver = IdentityResolver::new(pool.clone());
    let store = ConversationStore::new(pool.clone());
    let company = unique_company();
    let ids = ids_for_phone("+5541933332222");

    let lead = resolver
        .resolve_or_create(&company, &ids, "Diego Alves")
        .await
        .unwrap()
        .into_lead();
    let conversation = store.get_or_create(&lead, "WhatsApp").await.unwrap();

    let message = store
        .append_message(conversation.id, NewMessage::outbound("Oi!", None, None))
        .await
        .unwrap();
    assert_eq!(message.status, "pending");

    // Delivered arrives first; a later Sent report must not roll it back.
    let advance = store
        .apply_status_callback(message.id, MessageStatus::Delivered)
        .await
        .unwrap();
    assert_eq!(advance, StatusAdvance::Advanced(MessageStatus::Delivered));

    let advance = store
        .apply_status_callback(message.id, MessageStatus::Sent)
        .await
        .unwrap();
    assert_eq!(advance, StatusAdvance::Ignored(MessageStatus::Delivered));

    let stored = store.get_message(message.id).await.unwrap().unwrap();
    assert_eq!(stored.status, "delivered");
}
