//! End-to-end scenarios over real WebSocket connections.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use syncore::network::protocol::{
    MessageType, MovementSample, NetworkMessage, WelcomePayload, WorldStatePayload,
};
use syncore::prediction::InputCommand;
use syncore::{
    ClientAgent, MessageCodec, SessionId, SyncConfig, SyncContext, TransportListener, Vec3,
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// HELPERS
// =============================================================================

fn test_config() -> SyncConfig {
    SyncConfig {
        bind_host: "127.0.0.1".into(),
        reconnect_delay_ms: 10,
        max_reconnect_attempts: 1,
        ..Default::default()
    }
}

async fn start(config: SyncConfig) -> (TransportListener, Arc<SyncContext>, String) {
    let ctx = SyncContext::new(config).unwrap();
    let mut listener = TransportListener::new(ctx.clone());
    let addr = listener.start(0).await.unwrap();
    (listener, ctx, format!("ws://{}", addr))
}

/// Raw client speaking frames directly, for feeding the server bad input.
struct RawClient {
    ws: Ws,
    codec: MessageCodec,
    id: SessionId,
}

impl RawClient {
    async fn connect(url: &str, codec: MessageCodec) -> Self {
        let (mut ws, _) = connect_async(url).await.unwrap();
        let welcome = recv_matching(&mut ws, &codec, Duration::from_secs(2), |m| {
            m.message_type == MessageType::Connect
        })
        .await
        .expect("welcome");
        let payload: WelcomePayload = welcome.decode_payload().unwrap();
        Self {
            ws,
            codec,
            id: payload.your_session_id,
        }
    }

    async fn send(&mut self, message: &NetworkMessage) {
        let frame = self.codec.encode(message).unwrap();
        self.ws.send(Message::Binary(frame)).await.unwrap();
    }

    async fn send_raw(&mut self, frame: Message) {
        self.ws.send(frame).await.unwrap();
    }

    async fn move_to(&mut self, x: f32) {
        let msg =
            NetworkMessage::movement(self.id.to_string(), &MovementSample::at(Vec3::new(x, 0.0, 0.0)))
                .unwrap();
        self.send(&msg).await;
    }

    async fn recv_matching<F>(&mut self, limit: Duration, pred: F) -> Option<NetworkMessage>
    where
        F: Fn(&NetworkMessage) -> bool,
    {
        recv_matching(&mut self.ws, &self.codec, limit, pred).await
    }
}

async fn recv_matching<F>(
    ws: &mut Ws,
    codec: &MessageCodec,
    limit: Duration,
    pred: F,
) -> Option<NetworkMessage>
where
    F: Fn(&NetworkMessage) -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let frame = match tokio::time::timeout_at(deadline, ws.next()).await {
            Ok(Some(Ok(frame))) => frame,
            _ => return None,
        };
        if let Message::Binary(data) = frame {
            if let Ok(message) = codec.decode(&data) {
                if pred(&message) {
                    return Some(message);
                }
            }
        }
    }
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn is_movement_from(id: SessionId) -> impl Fn(&NetworkMessage) -> bool {
    move |m| m.message_type == MessageType::Movement && m.sender_id == id.to_string()
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[tokio::test]
async fn test_accepted_movement_reaches_others() {
    let (mut listener, ctx, url) = start(test_config()).await;
    let mut a = RawClient::connect(&url, MessageCodec::default()).await;
    let mut b = RawClient::connect(&url, MessageCodec::default()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    a.move_to(1.0).await;

    let relayed = b
        .recv_matching(Duration::from_secs(2), is_movement_from(a.id))
        .await
        .expect("movement relayed to b");
    let sample: MovementSample = relayed.decode_payload().unwrap();
    assert_eq!(sample.position, Vec3::new(1.0, 0.0, 0.0));

    let stored = ctx.registry.get(&a.id).await.unwrap().sample;
    assert_eq!(stored.position, Vec3::new(1.0, 0.0, 0.0));

    listener.stop().await;
}

#[tokio::test]
async fn test_teleport_gets_correction() {
    let (mut listener, ctx, url) = start(test_config()).await;
    let mut a = RawClient::connect(&url, MessageCodec::default()).await;
    let mut b = RawClient::connect(&url, MessageCodec::default()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    a.move_to(500.0).await;

    let correction = a
        .recv_matching(Duration::from_secs(2), |m| m.message_type == MessageType::Movement)
        .await
        .expect("correction");
    let sample: MovementSample = correction.decode_payload().unwrap();
    assert!(sample.correction);
    assert_eq!(sample.position, Vec3::ZERO);

    assert_eq!(ctx.registry.get(&a.id).await.unwrap().sample.position, Vec3::ZERO);
    assert!(b
        .recv_matching(Duration::from_millis(300), is_movement_from(a.id))
        .await
        .is_none());

    listener.stop().await;
}

#[tokio::test]
async fn test_tick_snapshot_contains_both_sessions() {
    let (mut listener, _ctx, url) = start(test_config()).await;
    let mut a = RawClient::connect(&url, MessageCodec::default()).await;
    let mut b = RawClient::connect(&url, MessageCodec::default()).await;
    let both: BTreeSet<SessionId> = [a.id, b.id].into_iter().collect();

    for client in [&mut a, &mut b] {
        let state = client
            .recv_matching(Duration::from_secs(2), |m| {
                m.message_type == MessageType::WorldState
                    && m.decode_payload::<WorldStatePayload>()
                        .map(|s| s.players.len() == 2)
                        .unwrap_or(false)
            })
            .await
            .expect("world state with both sessions");
        let payload: WorldStatePayload = state.decode_payload().unwrap();
        let ids: BTreeSet<SessionId> = payload.players.iter().map(|p| p.session_id).collect();
        assert_eq!(ids, both);
        assert!(payload.players.iter().all(|p| p.position == Vec3::ZERO));
    }

    listener.stop().await;
}

#[tokio::test]
async fn test_bad_frames_do_not_drop_connection() {
    let (mut listener, ctx, url) = start(test_config()).await;
    let mut a = RawClient::connect(&url, MessageCodec::default()).await;
    let mut b = RawClient::connect(&url, MessageCodec::default()).await;

    let garbage_payload =
        NetworkMessage::new(MessageType::Movement, a.id.to_string(), b"{not a sample".to_vec());
    a.send(&garbage_payload).await;
    a.send_raw(Message::Binary(vec![0xff, 0x00, 0x13, 0x37])).await;
    a.send_raw(Message::Binary(Vec::new())).await;
    a.send_raw(Message::Text("definitely not json".into())).await;
    a.move_to(1.0).await;

    let relayed = b
        .recv_matching(Duration::from_secs(2), is_movement_from(a.id))
        .await
        .expect("valid movement after garbage");
    let sample: MovementSample = relayed.decode_payload().unwrap();
    assert_eq!(sample.position.x, 1.0);
    assert!(ctx.registry.contains(&a.id).await);

    listener.stop().await;
}

#[tokio::test]
async fn test_sender_id_is_stamped() {
    let (mut listener, _ctx, url) = start(test_config()).await;
    let mut a = RawClient::connect(&url, MessageCodec::default()).await;
    let mut b = RawClient::connect(&url, MessageCodec::default()).await;

    let forged = NetworkMessage::new(MessageType::Chat, b.id.to_string(), b"gg".to_vec());
    a.send(&forged).await;

    let chat = b
        .recv_matching(Duration::from_secs(2), |m| m.message_type == MessageType::Chat)
        .await
        .expect("chat");
    assert_eq!(chat.sender_id, a.id.to_string());
    assert_eq!(chat.payload, b"gg".to_vec());

    listener.stop().await;
}

#[tokio::test]
async fn test_disconnect_fanned_out() {
    let (mut listener, ctx, url) = start(test_config()).await;
    let a = RawClient::connect(&url, MessageCodec::default()).await;
    let mut b = RawClient::connect(&url, MessageCodec::default()).await;
    let a_id = a.id;

    drop(a);
    let notice = b
        .recv_matching(Duration::from_secs(2), |m| m.message_type == MessageType::Disconnect)
        .await
        .expect("disconnect notice");
    assert_eq!(notice.sender_id, a_id.to_string());

    let ctx2 = ctx.clone();
    wait_until(|| {
        let ctx = ctx2.clone();
        async move { !ctx.registry.contains(&a_id).await }
    })
    .await;

    listener.stop().await;
}

#[tokio::test]
async fn test_player_limit_refuses_extra_connection() {
    let config = SyncConfig {
        max_players: 1,
        ..test_config()
    };
    let (mut listener, ctx, url) = start(config).await;
    let _a = RawClient::connect(&url, MessageCodec::default()).await;

    assert!(connect_async(url.as_str()).await.is_err());
    assert_eq!(ctx.registry.len().await, 1);

    listener.stop().await;
}

#[tokio::test]
async fn test_encrypted_compressed_agents() {
    let config = SyncConfig {
        encryption: true,
        compression: true,
        compression_threshold: 0,
        ..test_config()
    };
    let (mut listener, _ctx, url) = start(config.clone()).await;

    let mut a = ClientAgent::new(SyncContext::new(config.clone()).unwrap());
    let mut b = ClientAgent::new(SyncContext::new(config).unwrap());
    a.connect(&url).await.unwrap();
    let b_id = b.connect(&url).await.unwrap();
    let (_, mut inbox) = a.subscribe();

    b.send_message(MessageType::Chat, b"secret".to_vec()).unwrap();
    b.flush().unwrap();

    let mut got = None;
    for _ in 0..40 {
        a.poll_wait(Duration::from_millis(50)).await;
        while let Ok(m) = inbox.try_recv() {
            if m.message_type == MessageType::Chat {
                got = Some(m);
            }
        }
        if got.is_some() {
            break;
        }
    }
    let chat = got.expect("chat over encrypted link");
    assert_eq!(chat.sender_id, b_id.to_string());
    assert_eq!(chat.payload, b"secret".to_vec());
    assert!(a.peer(&b_id).is_some());

    a.disconnect().await;
    b.disconnect().await;
    listener.stop().await;
}

#[tokio::test]
async fn test_plaintext_rejected_when_encrypted() {
    let config = SyncConfig {
        encryption: true,
        ..test_config()
    };
    let (mut listener, ctx, url) = start(config.clone()).await;
    let server_codec = MessageCodec::from_config(&config).unwrap();
    let mut a = RawClient::connect(&url, server_codec).await;
    let mut b = RawClient::connect(&url, MessageCodec::from_config(&config).unwrap()).await;

    // Plain frames from a client without the key are dropped
    let plain = MessageCodec::default()
        .encode(&NetworkMessage::new(MessageType::Chat, "x", b"leak".to_vec()))
        .unwrap();
    a.send_raw(Message::Binary(plain)).await;
    a.send_raw(Message::Text(
        serde_json::to_string(&NetworkMessage::new(MessageType::Chat, "x", b"leak".to_vec())).unwrap(),
    ))
    .await;
    a.send(&NetworkMessage::new(MessageType::Chat, "x", b"ok".to_vec())).await;

    let chat = b
        .recv_matching(Duration::from_secs(2), |m| m.message_type == MessageType::Chat)
        .await
        .expect("encrypted chat");
    assert_eq!(chat.payload, b"ok".to_vec());
    assert!(ctx.registry.contains(&a.id).await);

    listener.stop().await;
}

#[tokio::test]
async fn test_agent_reconciles_after_rejection() {
    let (mut listener, _ctx, url) = start(test_config()).await;
    let mut agent = ClientAgent::new(SyncContext::new(test_config()).unwrap());
    agent.connect(&url).await.unwrap();

    let predicted = agent
        .apply_input(InputCommand::moving(Vec3::new(1000.0, 0.0, 0.0)), 1.0)
        .unwrap();
    assert_eq!(predicted.position.x, 1000.0);
    agent.flush().unwrap();

    for _ in 0..40 {
        agent.poll_wait(Duration::from_millis(50)).await;
        if agent.corrections() > 0 {
            break;
        }
    }
    assert_eq!(agent.corrections(), 1);
    assert_eq!(agent.predicted().position, Vec3::ZERO);
    assert_eq!(agent.pending_inputs(), 0);

    agent.disconnect().await;
    listener.stop().await;
}

#[tokio::test]
async fn test_agent_replays_inputs_newer_than_correction() {
    let (mut listener, _ctx, url) = start(test_config()).await;
    let mut agent = ClientAgent::new(SyncContext::new(test_config()).unwrap());
    agent.connect(&url).await.unwrap();

    // Input 1 teleports and is flushed; inputs 2 and 3 stay local
    agent
        .apply_input(InputCommand::moving(Vec3::new(1000.0, 0.0, 0.0)), 1.0)
        .unwrap();
    agent.flush().unwrap();
    agent
        .apply_input(InputCommand::moving(Vec3::new(1.0, 0.0, 0.0)), 0.25)
        .unwrap();
    agent
        .apply_input(InputCommand::moving(Vec3::new(0.0, 0.0, 2.0)), 0.25)
        .unwrap();
    assert_eq!(agent.pending_inputs(), 3);

    for _ in 0..40 {
        agent.poll_wait(Duration::from_millis(50)).await;
        if agent.corrections() > 0 {
            break;
        }
    }
    assert_eq!(agent.corrections(), 1);

    let predicted = agent.predicted();
    assert!((predicted.position.x - 0.25).abs() < 1e-5, "{:?}", predicted.position);
    assert!((predicted.position.z - 0.5).abs() < 1e-5, "{:?}", predicted.position);
    assert_eq!(predicted.sequence, 3);
    assert_eq!(agent.pending_inputs(), 2);

    agent.disconnect().await;
    listener.stop().await;
}

#[tokio::test]
async fn test_agent_sees_peer_movement() {
    let (mut listener, _ctx, url) = start(test_config()).await;
    let mut a = ClientAgent::new(SyncContext::new(test_config()).unwrap());
    let mut b = ClientAgent::new(SyncContext::new(test_config()).unwrap());
    a.connect(&url).await.unwrap();
    let b_id = b.connect(&url).await.unwrap();

    b.apply_input(InputCommand::moving(Vec3::new(2.0, 0.0, 0.0)), 0.5)
        .unwrap();
    b.flush().unwrap();

    let mut seen = false;
    for _ in 0..40 {
        a.poll_wait(Duration::from_millis(50)).await;
        if a.peer(&b_id).map(|p| p.target_position.x == 1.0).unwrap_or(false) {
            seen = true;
            break;
        }
    }
    assert!(seen, "peer target never updated");

    a.interpolate(10.0);
    assert_eq!(a.peer(&b_id).unwrap().position.x, 1.0);

    b.disconnect().await;
    for _ in 0..40 {
        a.poll_wait(Duration::from_millis(50)).await;
        if a.peer(&b_id).is_none() {
            break;
        }
    }
    assert!(a.peer(&b_id).is_none());

    a.disconnect().await;
    listener.stop().await;
}

// =============================================================================
// PROPERTIES
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn prop_concurrent_connect_disconnect(
        n in 2usize..8,
        leave_mask in proptest::collection::vec(any::<bool>(), 8),
        seed in any::<u64>(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let (mut listener, ctx, url) = start(SyncConfig {
                max_players: 16,
                ..test_config()
            })
            .await;

            let connects = (0..n).map(|_| {
                let url = url.clone();
                tokio::spawn(async move { RawClient::connect(&url, MessageCodec::default()).await })
            });
            let mut clients = Vec::new();
            for handle in connects {
                clients.push(handle.await.unwrap());
            }

            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            clients.shuffle(&mut rng);

            let mut staying = BTreeSet::new();
            let mut kept = Vec::new();
            let mut leaving = Vec::new();
            for (i, client) in clients.into_iter().enumerate() {
                if leave_mask[i] {
                    leaving.push(client);
                } else {
                    staying.insert(client.id);
                    kept.push(client);
                }
            }

            let closes = leaving.into_iter().map(|mut client| {
                tokio::spawn(async move {
                    let _ = client.ws.close(None).await;
                })
            });
            for handle in closes {
                handle.await.unwrap();
            }

            let expected = staying.clone();
            let ctx2 = ctx.clone();
            wait_until(|| {
                let ctx = ctx2.clone();
                let expected = expected.clone();
                async move {
                    let ids: BTreeSet<SessionId> = ctx.registry.ids().await.into_iter().collect();
                    ids == expected
                }
            })
            .await;

            let ids = ctx.registry.ids().await;
            assert_eq!(ids.len(), staying.len());

            listener.stop().await;
            assert!(ctx.registry.is_empty().await);
            drop(kept);
        });
    }
}
