// Loopback negotiation between two real peer connections
// Needs working local network interfaces, so it is ignored by default

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

use proctor_client::config::IceConfig;
use proctor_client::room::{PeerEvent, PeerFactory, PeerNotice, PeerOptions, RtcPeerFactory};
use proctor_client::signaling::DataMessage;

fn local_ice() -> IceConfig {
    IceConfig {
        stun_servers: vec![],
        turn_servers: vec![],
    }
}

#[tokio::test]
#[ignore] // Requires local network interfaces for ICE
async fn test_host_and_candidate_connect_and_exchange_data() {
    let factory = RtcPeerFactory::new(local_ice()).unwrap();
    let (host_tx, mut host_rx) = mpsc::unbounded_channel::<PeerNotice>();
    let (cand_tx, mut cand_rx) = mpsc::unbounded_channel::<PeerNotice>();

    // Each peer is keyed by the id of its remote side.
    let host_side = factory
        .create(
            PeerOptions {
                peer_id: "candidate".into(),
                generation: 1,
                initiator: true,
                local_stream: None,
            },
            host_tx,
        )
        .await
        .unwrap();
    let candidate_side = factory
        .create(
            PeerOptions {
                peer_id: "host".into(),
                generation: 1,
                initiator: false,
                local_stream: None,
            },
            cand_tx,
        )
        .await
        .unwrap();

    let result = timeout(Duration::from_secs(20), async {
        let mut host_connected = false;
        let mut candidate_connected = false;
        while !(host_connected && candidate_connected) {
            tokio::select! {
                Some(notice) = host_rx.recv() => match notice.event {
                    PeerEvent::Signal(offer) => candidate_side.signal(offer).await.unwrap(),
                    PeerEvent::Connect => host_connected = true,
                    PeerEvent::Error(reason) => panic!("host peer failed: {}", reason),
                    _ => {}
                },
                Some(notice) = cand_rx.recv() => match notice.event {
                    PeerEvent::Signal(answer) => host_side.signal(answer).await.unwrap(),
                    PeerEvent::Connect => candidate_connected = true,
                    PeerEvent::Error(reason) => panic!("candidate peer failed: {}", reason),
                    _ => {}
                },
            }
        }

        // The data channel opens shortly after the transport connects.
        while host_side.send(DataMessage::Terminate).await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
        loop {
            if let Some(notice) = cand_rx.recv().await {
                if let PeerEvent::Data(message) = notice.event {
                    return message;
                }
            }
        }
    })
    .await
    .expect("loopback negotiation timed out");

    assert_eq!(result, DataMessage::Terminate);

    host_side.destroy().await;
    host_side.destroy().await;
    candidate_side.destroy().await;
    assert!(host_side.is_destroyed());
}
