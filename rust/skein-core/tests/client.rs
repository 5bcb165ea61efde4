//! Client behavior against a hand-driven peer on the other end of an
//! in-process transport.

use std::time::Duration;

use skein_core::{
    ApplicationError, ClientConfig, Envelope, ErrorKind, MessageKind, Protocol, RpcClient,
    RpcError, Transport, TransportError,
};
use tokio::sync::oneshot;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("skein_core=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// The server side of a connection, driven by the test.
struct Peer {
    transport: Transport,
    protocol: Protocol,
}

impl Peer {
    async fn next_request<A: serde::de::DeserializeOwned>(&self) -> (Envelope, A) {
        let message = self.transport.recv().await.unwrap();
        let (envelope, body) = self.protocol.read_envelope(&message).unwrap();
        (envelope, self.protocol.decode(&body).unwrap())
    }

    async fn reply<R: serde::Serialize>(&self, request: &Envelope, result: &R) {
        let message = self
            .protocol
            .write_message(&request.reply(), result)
            .unwrap();
        self.transport.send(message).await.unwrap();
    }

    async fn fail(&self, request: &Envelope, error: &ApplicationError) {
        let message = self
            .protocol
            .write_message(&request.exception(), error)
            .unwrap();
        self.transport.send(message).await.unwrap();
    }
}

fn connected(config: ClientConfig) -> (RpcClient, Peer) {
    let (ours, theirs) = Transport::inproc_pair();
    let peer = Peer {
        transport: theirs,
        protocol: config.protocol,
    };
    (RpcClient::new(ours, config), peer)
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn replies_are_matched_out_of_order() {
    init_tracing();
    let (client, peer) = connected(ClientConfig::default());

    let calls: Vec<_> = (0..5u32)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.call::<_, u32>("times_ten", &i).await })
        })
        .collect();

    let mut requests = Vec::new();
    for _ in 0..5 {
        requests.push(peer.next_request::<u32>().await);
    }
    for (envelope, arg) in requests.iter().rev() {
        assert_eq!(envelope.kind, MessageKind::Call);
        peer.reply(envelope, &(arg * 10)).await;
    }

    for (i, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap().unwrap(), i as u32 * 10);
    }
    assert_eq!(client.pending_len(), 0);
    assert_eq!(client.orphan_replies(), 0);
}

#[tokio::test]
async fn sequence_ids_are_distinct_per_call() {
    let (client, peer) = connected(ClientConfig::default());
    for _ in 0..3 {
        let client = client.clone();
        tokio::spawn(async move { client.call::<_, ()>("noop", &()).await });
    }
    let mut ids = Vec::new();
    for _ in 0..3 {
        let (envelope, ()) = peer.next_request::<()>().await;
        ids.push(envelope.seq_id);
    }
    ids.sort_by_key(|id| id.get());
    ids.dedup();
    assert_eq!(ids.len(), 3);
    assert!(ids.iter().all(|id| id.get() > 0));
}

#[tokio::test]
async fn exception_reply_fails_only_that_call() {
    let (client, peer) = connected(ClientConfig::default());
    let failing = {
        let client = client.clone();
        tokio::spawn(async move { client.call::<_, i32>("divide", &(1, 0)).await })
    };
    let (request, (_, _)) = peer.next_request::<(i32, i32)>().await;
    peer.fail(&request, &ApplicationError::declared("Cannot divide by 0"))
        .await;

    let err = failing.await.unwrap().unwrap_err();
    let app = err.application().unwrap();
    assert_eq!(app.kind, ErrorKind::Declared);
    assert_eq!(app.message, "Cannot divide by 0");

    let ok = {
        let client = client.clone();
        tokio::spawn(async move { client.call::<_, i32>("divide", &(6, 3)).await })
    };
    let (request, (a, b)) = peer.next_request::<(i32, i32)>().await;
    peer.reply(&request, &(a / b)).await;
    assert_eq!(ok.await.unwrap().unwrap(), 2);
}

#[tokio::test]
async fn late_reply_after_timeout_is_counted_as_orphan() {
    init_tracing();
    let (client, peer) = connected(ClientConfig::default());

    let err = {
        let call = client.call_with_timeout::<_, u32>("slow", &(), Duration::from_millis(50));
        let (result, (request, ())) = tokio::join!(call, peer.next_request::<()>());
        let err = result.unwrap_err();
        peer.reply(&request, &7u32).await;
        err
    };

    match &err {
        RpcError::TimedOut { after, .. } => assert_eq!(*after, Duration::from_millis(50)),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::TimedOut);
    assert!(err.to_string().starts_with("No reply after 50ms"));

    wait_until(|| client.orphan_replies() == 1).await;
    assert_eq!(client.pending_len(), 0);
}

#[tokio::test]
async fn reply_with_wrong_method_name_fails_the_call() {
    let (client, peer) = connected(ClientConfig::default());
    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call::<_, u32>("add", &(1, 2)).await })
    };
    let (request, (_, _)) = peer.next_request::<(u32, u32)>().await;
    let mut renamed = request.clone();
    renamed.name = "subtract".to_string();
    peer.reply(&renamed, &3u32).await;

    match call.await.unwrap() {
        Err(RpcError::WrongMethodName { expected, actual }) => {
            assert_eq!(expected, "add");
            assert_eq!(actual, "subtract");
        }
        other => panic!("expected wrong method name, got {other:?}"),
    }
}

#[tokio::test]
async fn closing_the_connection_fails_every_pending_call() {
    let (client, peer) = connected(ClientConfig::default());
    let calls: Vec<_> = (0..3u32)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.call::<_, u32>("hang", &i).await })
        })
        .collect();
    for _ in 0..3 {
        peer.next_request::<u32>().await;
    }
    peer.transport.close();

    for call in calls {
        assert!(matches!(
            call.await.unwrap(),
            Err(RpcError::Transport(TransportError::Closed))
        ));
    }
    assert_eq!(client.pending_len(), 0);
    assert!(client.is_closed().await);
    assert!(matches!(
        client.call::<_, u32>("after", &0u32).await,
        Err(RpcError::Transport(TransportError::Closed))
    ));
}

#[tokio::test]
async fn local_close_fails_pending_calls() {
    let (client, peer) = connected(ClientConfig::default());
    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call::<_, ()>("hang", &()).await })
    };
    peer.next_request::<()>().await;
    client.close().await;
    assert!(matches!(
        call.await.unwrap(),
        Err(RpcError::Transport(TransportError::Closed))
    ));
}

#[tokio::test]
async fn oneway_is_sent_and_never_registered() {
    let (client, peer) = connected(ClientConfig::default());
    client.oneway("notify", &"hello").await.unwrap();
    assert_eq!(client.pending_len(), 0);
    let (envelope, text) = peer.next_request::<String>().await;
    assert_eq!(envelope.kind, MessageKind::Oneway);
    assert_eq!(envelope.name, "notify");
    assert_eq!(text, "hello");
}

#[tokio::test]
async fn unmatched_reply_is_dropped_and_counted() {
    let (client, peer) = connected(ClientConfig::default());
    let stray = Envelope::call("ghost", skein_core::SequenceId(4242));
    peer.reply(&stray, &1u8).await;
    wait_until(|| client.orphan_replies() == 1).await;
}

#[tokio::test]
async fn calls_made_while_connecting_are_flushed_in_order() {
    let (connect_tx, connect_rx) = oneshot::channel::<Transport>();
    let client = RpcClient::connecting(
        async move { connect_rx.await.map_err(|_| TransportError::Closed) },
        ClientConfig::default(),
    );

    let calls: Vec<_> = (0..4u32)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.call::<_, u32>("echo", &i).await })
        })
        .collect();
    wait_until(|| client.pending_len() == 4).await;
    assert!(!client.is_closed().await);

    let (ours, theirs) = Transport::inproc_pair();
    connect_tx.send(ours).unwrap();
    let peer = Peer {
        transport: theirs,
        protocol: Protocol::default(),
    };

    let mut seen = Vec::new();
    for _ in 0..4 {
        let (envelope, arg) = peer.next_request::<u32>().await;
        seen.push(envelope.seq_id.get());
        peer.reply(&envelope, &arg).await;
    }
    let mut sorted = seen.clone();
    sorted.sort();
    assert_eq!(seen, sorted, "queued requests must go out in call order");

    for call in calls {
        call.await.unwrap().unwrap();
    }
    assert!(!client.is_closed().await);
}

#[tokio::test]
async fn failed_connect_fails_queued_calls() {
    let (connect_tx, connect_rx) = oneshot::channel::<Result<Transport, TransportError>>();
    let client = RpcClient::connecting(
        async move { connect_rx.await.unwrap_or(Err(TransportError::Closed)) },
        ClientConfig::default(),
    );
    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call::<_, ()>("never", &()).await })
    };
    wait_until(|| client.pending_len() == 1).await;

    connect_tx
        .send(Err(TransportError::NoListener("calculator".into())))
        .unwrap();
    match call.await.unwrap() {
        Err(RpcError::Transport(TransportError::NoListener(addr))) => {
            assert_eq!(addr, "calculator")
        }
        other => panic!("expected connect failure, got {other:?}"),
    }
    assert_eq!(client.pending_len(), 0);
}

#[tokio::test]
async fn abandoned_queued_call_is_never_sent() {
    let (connect_tx, connect_rx) = oneshot::channel::<Transport>();
    let client = RpcClient::connecting(
        async move { connect_rx.await.map_err(|_| TransportError::Closed) },
        ClientConfig::default(),
    );

    let abandoned = {
        let client = client.clone();
        tokio::spawn(async move { client.call::<_, ()>("abandoned", &()).await })
    };
    wait_until(|| client.pending_len() == 1).await;
    abandoned.abort();
    let _ = abandoned.await;
    assert_eq!(client.pending_len(), 0);

    let kept = {
        let client = client.clone();
        tokio::spawn(async move { client.call::<_, ()>("kept", &()).await })
    };
    wait_until(|| client.pending_len() == 1).await;

    let (ours, theirs) = Transport::inproc_pair();
    connect_tx.send(ours).unwrap();
    let peer = Peer {
        transport: theirs,
        protocol: Protocol::default(),
    };
    let (envelope, ()) = peer.next_request::<()>().await;
    assert_eq!(envelope.name, "kept");
    peer.reply(&envelope, &()).await;
    kept.await.unwrap().unwrap();
}

#[tokio::test]
async fn call_timed_out_while_connecting_is_never_sent() {
    let (connect_tx, connect_rx) = oneshot::channel::<Transport>();
    let client = RpcClient::connecting(
        async move { connect_rx.await.map_err(|_| TransportError::Closed) },
        ClientConfig::default(),
    );

    let err = client
        .call_with_timeout::<_, ()>("expired", &(), Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::TimedOut { .. }));
    assert_eq!(client.pending_len(), 0);

    let next = {
        let client = client.clone();
        tokio::spawn(async move { client.call::<_, ()>("next", &()).await })
    };
    wait_until(|| client.pending_len() == 1).await;

    let (ours, theirs) = Transport::inproc_pair();
    connect_tx.send(ours).unwrap();
    let peer = Peer {
        transport: theirs,
        protocol: Protocol::default(),
    };
    let (envelope, ()) = peer.next_request::<()>().await;
    assert_eq!(envelope.name, "next");
    peer.reply(&envelope, &()).await;
    next.await.unwrap().unwrap();
    assert_eq!(client.orphan_replies(), 0);
}

#[tokio::test]
async fn timeout_covers_writes_the_peer_never_drains() {
    let (client, _peer) = connected(ClientConfig::default());

    // more calls than the connection can buffer; the later ones block in send
    let calls: Vec<_> = (0..100i32)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call_with_timeout::<_, ()>("stuck", &i, Duration::from_millis(50))
                    .await
            })
        })
        .collect();

    for call in calls {
        let result = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .expect("call never resolved")
            .unwrap();
        assert!(matches!(result, Err(RpcError::TimedOut { .. })));
    }
    assert_eq!(client.pending_len(), 0);
}

#[tokio::test]
async fn pending_limit_rejects_extra_calls() {
    let (client, peer) = connected(ClientConfig::default().with_max_pending(1));
    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.call::<_, ()>("first", &()).await })
    };
    let (request, ()) = peer.next_request::<()>().await;

    let err = client.call::<_, ()>("second", &()).await.unwrap_err();
    assert!(matches!(err, RpcError::Registry(_)));

    peer.reply(&request, &()).await;
    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn json_protocol_round_trips() {
    let (client, peer) = connected(ClientConfig::default().with_protocol(Protocol::Json));
    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call::<_, String>("greet", &"skein").await })
    };
    let message = peer.transport.recv().await.unwrap();
    assert_eq!(message.first(), Some(&b'{'));
    let (envelope, body) = Protocol::Json.read_envelope(&message).unwrap();
    let name: String = Protocol::Json.decode(&body).unwrap();
    peer.reply(&envelope, &format!("hello {name}")).await;
    assert_eq!(call.await.unwrap().unwrap(), "hello skein");
}

#[tokio::test]
async fn dropping_every_handle_closes_the_connection() {
    let (client, peer) = connected(ClientConfig::default());
    drop(client);
    assert!(matches!(
        peer.transport.recv().await,
        Err(TransportError::Closed)
    ));
}
