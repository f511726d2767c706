//! Perfect negotiation between two negotiators sharing one signaling hub.

use std::sync::Arc;

use tandem_collab::media::{LocalMedia, SyntheticMicrophone};
use tandem_collab::negotiation::{
    NegotiationPhase, OfferDecision, PerfectNegotiator, RecordingPlayback, Role,
};
use tandem_collab::peer::{MemoryPeerConnection, PeerConnection, SignalingState};
use tandem_collab::protocol::{ClientId, RoomId, SignalMessage};
use tandem_collab::signaling::MemorySignalHub;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

struct Side {
    pc: Arc<MemoryPeerConnection>,
    playback: RecordingPlayback,
    media: LocalMedia,
}

async fn side(hub: &MemorySignalHub, id: ClientId) -> (PerfectNegotiator, Side) {
    let pc = MemoryPeerConnection::new();
    let playback = RecordingPlayback::new();
    let media = LocalMedia::acquire(&SyntheticMicrophone::new()).await;
    let mut n = PerfectNegotiator::new(
        RoomId::new("r1"),
        id,
        pc.clone(),
        hub.connect(),
        playback.factory(),
    );
    if let Some(stream) = media.stream() {
        n.attach_microphone(stream.clone());
    }
    (
        n,
        Side {
            pc,
            playback,
            media,
        },
    )
}

fn settled(side: &Side) -> bool {
    side.pc.signaling_state() == SignalingState::Stable
        && side.pc.is_connected()
        && side.playback.created() == 1
        && side.pc.pending_descriptions() == (None, None)
}

async fn wait_settled(a: &Side, b: &Side) {
    timeout(Duration::from_secs(5), async {
        while !(settled(a) && settled(b)) {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("negotiation did not settle");
}

fn last_from(hub: &MemorySignalHub, kind: &str, sender: ClientId) -> SignalMessage {
    hub.history()
        .into_iter()
        .rev()
        .find(|m| m.kind() == kind && m.client_id() == sender)
        .expect("message not sent")
}

#[test]
fn test_role_election_is_complementary_for_random_ids() {
    for _ in 0..200 {
        let a = ClientId::random();
        let b = ClientId::random();
        if a == b {
            continue;
        }
        assert_ne!(Role::elect(a, b), Role::elect(b, a));
    }
}

#[tokio::test]
async fn test_late_joiner_connects() {
    let hub = MemorySignalHub::new();
    let (na, a) = side(&hub, ClientId::random()).await;
    let (stop_a, rx_a) = oneshot::channel();
    let task_a = tokio::spawn(na.run(rx_a));

    // A is alone for a while and its early messages go nowhere.
    sleep(Duration::from_millis(50)).await;

    let (nb, b) = side(&hub, ClientId::random()).await;
    let (stop_b, rx_b) = oneshot::channel();
    let task_b = tokio::spawn(nb.run(rx_b));

    wait_settled(&a, &b).await;

    stop_a.send(()).unwrap();
    stop_b.send(()).unwrap();
    task_a.await.unwrap();
    task_b.await.unwrap();
    assert!(a.pc.is_closed() && b.pc.is_closed());
    assert!(a.playback.released() && b.playback.released());
    assert!(a.media.is_muted());
}

#[tokio::test]
async fn test_simultaneous_join_connects() {
    for _ in 0..10 {
        let hub = MemorySignalHub::new();
        let (na, a) = side(&hub, ClientId::random()).await;
        let (nb, b) = side(&hub, ClientId::random()).await;
        let (stop_a, rx_a) = oneshot::channel();
        let (stop_b, rx_b) = oneshot::channel();
        let task_a = tokio::spawn(na.run(rx_a));
        let task_b = tokio::spawn(nb.run(rx_b));

        wait_settled(&a, &b).await;

        stop_a.send(()).unwrap();
        stop_b.send(()).unwrap();
        task_a.await.unwrap();
        task_b.await.unwrap();
    }
}

#[tokio::test]
async fn test_glare_resolves_to_impolite_offer() {
    let hub = MemorySignalHub::new();
    let low = ClientId::from_uuid(Uuid::from_u128(10));
    let high = ClientId::from_uuid(Uuid::from_u128(20));
    let (mut impolite, a) = side(&hub, low).await;
    let (mut polite, b) = side(&hub, high).await;
    let room = RoomId::new("r1");

    polite
        .handle_signal(SignalMessage::Hello {
            room_id: room.clone(),
            client_id: low,
        })
        .await;
    assert_eq!(polite.role(), Some(Role::Polite));

    // The impolite side offers as soon as it learns about the peer.
    impolite
        .handle_signal(SignalMessage::Hello {
            room_id: room.clone(),
            client_id: high,
        })
        .await;
    assert_eq!(impolite.role(), Some(Role::Impolite));
    assert_eq!(impolite.phase(), NegotiationPhase::AwaitingAnswer);

    // The polite side offers at the same time: glare.
    polite.make_offer().await;
    assert_eq!(b.pc.signaling_state(), SignalingState::HaveLocalOffer);

    let offer_from_polite = last_from(&hub, "offer", high);
    let offer_from_impolite = last_from(&hub, "offer", low);

    impolite.handle_signal(offer_from_polite).await;
    assert_eq!(impolite.last_offer(), OfferDecision::Ignored);
    assert_eq!(a.pc.signaling_state(), SignalingState::HaveLocalOffer);

    polite.handle_signal(offer_from_impolite).await;
    assert_eq!(polite.last_offer(), OfferDecision::Accepted);
    assert_eq!(b.pc.signaling_state(), SignalingState::Stable);

    impolite.handle_signal(last_from(&hub, "answer", high)).await;

    for s in [&a, &b] {
        assert_eq!(s.pc.signaling_state(), SignalingState::Stable);
        assert_eq!(s.pc.pending_descriptions(), (None, None));
    }
    assert_eq!(impolite.phase(), NegotiationPhase::Stable);
    assert_eq!(polite.phase(), NegotiationPhase::Stable);
    assert_eq!(hub.count("answer"), 1);
}

#[tokio::test]
async fn test_foreign_room_and_self_messages_ignored() {
    let hub = MemorySignalHub::new();
    let me = ClientId::random();
    let (mut n, s) = side(&hub, me).await;

    n.handle_signal(SignalMessage::Hello {
        room_id: RoomId::new("other-room"),
        client_id: ClientId::random(),
    })
    .await;
    n.handle_signal(SignalMessage::Hello {
        room_id: RoomId::new("r1"),
        client_id: me,
    })
    .await;
    assert_eq!(n.role(), None);
    assert_eq!(s.pc.signaling_state(), SignalingState::Stable);
}
