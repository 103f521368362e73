/// Integration tests with a mocked delivery provider
/// Exercises the outbound delivery client without hitting a real provider
use conversa_core::dispatch::{DeliveryClient, DeliveryError};
use conversa_core::models::DispatchPayloadItem;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sample_item(message_id: Uuid) -> DispatchPayloadItem {
    DispatchPayloadItem {
        conversa_id: Uuid::new_v4(),
        empresa_id: "empresa-123".to_string(),
        mensage_body: "Olá! Como posso ajudar?".to_string(),
        message_type: "text".to_string(),
        message_midia_url: None,
        message_id,
    }
}

fn client_for(server: &MockServer, timeout: Duration) -> DeliveryClient {
    DeliveryClient::new(server.uri(), "test_token".to_string(), timeout)
        .expect("client construction should not fail")
}

#[tokio::test]
async fn test_deliver_posts_single_element_array() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/"))
        .and(header("Authorization", "Bearer test_token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server, Duration::from_secs(5));
    let message_id = Uuid::new_v4();
    let result = client.deliver(&sample_item(message_id)).await;
    assert!(result.is_ok());

    // The wire payload must be an array with exactly one element, keyed by
    // the internal message id, and must carry the provider's field names.
    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    let items = body.as_array().expect("payload should be a JSON array");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["message_id"], message_id.to_string());
    assert_eq!(items[0]["empresa_id"], "empresa-123");
    assert_eq!(items[0]["mensage_body"], "Olá! Como posso ajudar?");
    assert_eq!(items[0]["message_type"], "text");
    assert!(items[0]["message_midia_url"].is_null());
}

#[tokio::test]
async fn test_deliver_non_2xx_is_rejected() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(422).set_body_string("invalid payload"))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server, Duration::from_secs(5));
    let result = client.deliver(&sample_item(Uuid::new_v4())).await;

    match result {
        Err(DeliveryError::Rejected { status, body }) => {
            assert_eq!(status, 422);
            assert_eq!(body, "invalid payload");
        }
        other => panic!("expected Rejected, got {:?}", other),
    }
}

#[tokio::test]
async fn test_deliver_timeout_is_unknown_outcome() {
    let mock_server = MockServer::start().await;

    // The provider answers, but slower than the client's per-attempt timeout.
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server, Duration::from_millis(200));
    let result = client.deliver(&sample_item(Uuid::new_v4())).await;

    assert!(matches!(result, Err(DeliveryError::Timeout)));
}

#[tokio::test]
async fn test_check_receipt_found() {
    let mock_server = MockServer::start().await;
    let message_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path(format!("/receipts/{}", message_id)))
        .and(header("Authorization", "Bearer test_token"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server, Duration::from_secs(5));
    let received = client.check_receipt(message_id).await.unwrap();
    assert!(received);
}

#[tokio::test]
async fn test_check_receipt_unknown_message() {
    let mock_server = MockServer::start().await;
    let message_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path(format!("/receipts/{}", message_id)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server, Duration::from_secs(5));
    let received = client.check_receipt(message_id).await.unwrap();
    assert!(!received);
}

#[tokio::test]
async fn test_check_receipt_provider_error() {
    let mock_server = MockServer::start().await;
    let message_id = Uuid::new_v4();

    Mock::given(method("GET"))
        .and(path(format!("/receipts/{}", message_id)))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server, Duration::from_secs(5));
    let result = client.check_receipt(message_id).await;

    assert!(matches!(
        result,
        Err(DeliveryError::Rejected { status: 500, .. })
    ));
}

#[tokio::test]
async fn test_deliver_concurrent_requests() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(10)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server, Duration::from_secs(5));

    let mut handles = vec![];
    for _ in 0..10 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client.deliver(&sample_item(Uuid::new_v4())).await
        }));
    }

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
}
