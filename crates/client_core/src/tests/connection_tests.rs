use super::*;
use crate::test_support::{ScriptedTransport, TransportOp};

fn manager(transport: &Arc<ScriptedTransport>) -> Arc<ConnectionManager> {
    ConnectionManager::new(Arc::clone(transport) as Arc<dyn Transport>)
}

#[tokio::test]
async fn connect_transitions_to_connected() {
    let transport = ScriptedTransport::new();
    let connection = manager(&transport);
    let mut states = connection.watch_state();
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    connection.connect("token").await.expect("connect");

    assert!(connection.is_connected());
    assert_eq!(connection.epoch(), 1);
    assert!(states.has_changed().expect("watch"));
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);
}

#[tokio::test]
async fn failed_handshake_moves_to_error_and_can_retry() {
    let transport = ScriptedTransport::new();
    transport.fail_connect.store(true, Ordering::SeqCst);
    let connection = manager(&transport);

    let err = connection.connect("token").await.expect_err("must fail");
    assert!(matches!(err, SyncError::Connection(ref reason) if reason.contains("handshake refused")));
    assert_eq!(connection.state(), ConnectionState::Error);

    transport.fail_connect.store(false, Ordering::SeqCst);
    connection.connect("token").await.expect("retry");
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn handshake_times_out_into_error() {
    let transport = ScriptedTransport::new();
    transport.hang_connect.store(true, Ordering::SeqCst);
    let connection = ConnectionManager::with_timeout(
        Arc::clone(&transport) as Arc<dyn Transport>,
        Duration::from_millis(50),
    );

    let err = connection.connect("token").await.expect_err("must time out");
    assert!(matches!(err, SyncError::Connection(ref reason) if reason.contains("timed out")));
    assert_eq!(connection.state(), ConnectionState::Error);
    assert!(transport.ops().contains(&TransportOp::Close));
}

#[tokio::test]
async fn concurrent_connects_share_one_handshake() {
    let transport = ScriptedTransport::new();
    let gate = transport.gate_connect();
    let connection = manager(&transport);

    let first = tokio::spawn({
        let connection = Arc::clone(&connection);
        async move { connection.connect("token").await }
    });
    let second = tokio::spawn({
        let connection = Arc::clone(&connection);
        async move { connection.connect("token").await }
    });
    while transport.connect_calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    assert_eq!(connection.state(), ConnectionState::Connecting);
    gate.notify_one();

    first.await.expect("join").expect("first connect");
    second.await.expect("join").expect("second connect");
    assert_eq!(transport.connect_calls.load(Ordering::SeqCst), 1);
    assert!(connection.is_connected());
}

#[tokio::test]
async fn publish_without_connection_fails_fast() {
    let transport = ScriptedTransport::new();
    let connection = manager(&transport);

    let err = connection
        .publish("/app/chat/match/1", "{}".into())
        .await
        .expect_err("not connected");
    assert_eq!(err, SyncError::NotConnected);
    assert!(transport.ops().is_empty());
}

#[tokio::test]
async fn disconnect_cancels_listens_then_closes_and_is_idempotent() {
    let transport = ScriptedTransport::new();
    let connection = manager(&transport);
    connection.connect("token").await.expect("connect");
    let token = connection
        .listen("/topic/match/1", Arc::new(|_: &str| {}))
        .expect("listen");
    assert_eq!(connection.live_listens(), 1);

    connection.disconnect().await;
    connection.disconnect().await;

    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert_eq!(connection.live_listens(), 0);
    let ops = transport.ops();
    let unsubscribe = ops
        .iter()
        .position(|op| *op == TransportOp::Unsubscribe { token: token.0.clone() })
        .expect("unsubscribe recorded");
    let close = ops
        .iter()
        .position(|op| *op == TransportOp::Close)
        .expect("close recorded");
    assert!(unsubscribe < close);
}

#[tokio::test]
async fn unexpected_drop_moves_to_error_but_user_close_does_not() {
    let transport = ScriptedTransport::new();
    let connection = manager(&transport);
    connection.connect("token").await.expect("connect");

    transport.drop_connection("connection reset by peer");
    assert_eq!(connection.state(), ConnectionState::Error);
    assert_eq!(
        connection.listen("/topic/match/1", Arc::new(|_: &str| {})),
        Err(SyncError::NotConnected)
    );

    connection.connect("token").await.expect("reconnect");
    assert_eq!(connection.epoch(), 2);
    connection.disconnect().await;
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn cancel_ignores_tokens_from_previous_connection() {
    let transport = ScriptedTransport::new();
    let connection = manager(&transport);
    connection.connect("token").await.expect("connect");
    let stale = connection
        .listen("/topic/match/1", Arc::new(|_: &str| {}))
        .expect("listen");
    transport.drop_connection("gone");
    connection.connect("token").await.expect("reconnect");

    connection.cancel(&stale);

    assert!(!transport
        .ops()
        .contains(&TransportOp::Unsubscribe { token: stale.0 }));
}

#[tokio::test]
async fn disconnect_during_handshake_ends_disconnected() {
    let transport = ScriptedTransport::new();
    let gate = transport.gate_connect();
    let connection = manager(&transport);

    let pending = tokio::spawn({
        let connection = Arc::clone(&connection);
        async move { connection.connect("token").await }
    });
    while transport.connect_calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    connection.disconnect().await;
    gate.notify_one();

    assert!(pending.await.expect("join").is_err());
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}
