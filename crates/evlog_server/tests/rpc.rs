//! Segment server over TCP.

mod common;

use common::{event, running_server, test_config, MockController};
use evlog_core::BlockId;
use evlog_server::protocol::{Request, Response};
use evlog_server::{ErrorKind, SegmentClient, SegmentServer};
use evlog_storage::MemoryVolume;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

struct Served {
    server: Arc<SegmentServer>,
    address: String,
    listener: JoinHandle<()>,
}

async fn served() -> Served {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = running_server(
        test_config(port),
        Arc::new(MemoryVolume::new()),
        Arc::new(MockController::new(1)),
    )
    .await;
    let serving = Arc::clone(&server);
    let listener = tokio::spawn(async move { serving.serve(listener).await.unwrap() });
    Served {
        address: server.local_address().to_string(),
        server,
        listener,
    }
}

#[tokio::test]
async fn client_drives_every_operation() {
    let served = served().await;
    let client = SegmentClient::connect(&served.address).await.unwrap();
    let id = BlockId::new(11);

    client.create_block(id, 1 << 20).await.unwrap();
    let err = client.create_block(id, 1 << 20).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceAlreadyExist);
    let err = client.create_block(BlockId::new(0), 1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);

    client
        .activate_segment(1, 1, BTreeMap::from([(id, served.address.clone())]))
        .await
        .unwrap();
    let offsets = client
        .append_to_block(id, vec![event(0), event(1)])
        .await
        .unwrap();
    assert_eq!(offsets, vec![0, 1]);

    let events = client
        .read_from_block(id, 0, 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].id, "evt-1");
    let err = client
        .read_from_block(id, 2, 10, Duration::ZERO)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OffsetOnEnd);

    assert_eq!(client.lookup_offset_in_block(id, 0).await.unwrap(), 0);
    client.inactivate_segment(id).await.unwrap();
    client.remove_block(id).await.unwrap();
    let err = client.remove_block(id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceNotFound);

    served.server.stop().await.unwrap();
    tokio::time::timeout(Duration::from_secs(3), served.listener)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn long_poll_shares_the_connection_with_appends() {
    let served = served().await;
    let client = Arc::new(SegmentClient::connect(&served.address).await.unwrap());
    let id = BlockId::new(12);
    client.create_block(id, 1 << 20).await.unwrap();
    client
        .activate_segment(1, 1, BTreeMap::from([(id, served.address.clone())]))
        .await
        .unwrap();

    let poller = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .read_from_block(id, 0, 10, Duration::from_secs(5))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.append_to_block(id, vec![event(0)]).await.unwrap(), vec![0]);

    let events = tokio::time::timeout(Duration::from_secs(2), poller)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(events.len(), 1);
    served.server.stop().await.unwrap();
}

#[tokio::test]
async fn raw_call_returns_wire_errors() {
    let served = served().await;
    let client = SegmentClient::connect(&served.address).await.unwrap();
    let err = client
        .call(Request::AppendToBlock {
            id: BlockId::new(99),
            events: vec![event(0)],
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceNotFound);

    let response = client
        .call(Request::ActivateSegment {
            eventlog_id: 1,
            segment_id: 1,
            replicas: BTreeMap::new(),
        })
        .await
        .unwrap();
    assert_eq!(response, Response::Ok);
    served.server.stop().await.unwrap();
}

#[tokio::test]
async fn two_servers_replicate_over_tcp() {
    let a = served().await;
    let b = served().await;
    let (block_a, block_b) = (BlockId::new(21), BlockId::new(22));
    let members = BTreeMap::from([
        (block_a, a.address.clone()),
        (block_b, b.address.clone()),
    ]);

    a.server.create_block(block_a, 1 << 20).await.unwrap();
    b.server.create_block(block_b, 1 << 20).await.unwrap();
    a.server.activate_segment(1, 1, members.clone()).await.unwrap();
    b.server.activate_segment(1, 1, members).await.unwrap();

    // Either member may win the election; append through whichever leads.
    let nodes = [(&a.server, block_a), (&b.server, block_b)];
    let mut leader = None;
    'retry: for _ in 0..500 {
        for (i, (server, block)) in nodes.iter().enumerate() {
            match server.append_to_block(*block, vec![event(0), event(1)]).await {
                Ok(offsets) => {
                    assert_eq!(offsets, vec![0, 1]);
                    leader = Some(i);
                    break 'retry;
                }
                Err(e) if e.kind() == ErrorKind::NotLeader => {}
                Err(e) => panic!("append failed: {e}"),
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let leader = leader.expect("no leader elected");
    let (follower, follower_block) = nodes[1 - leader];

    let mut replicated = Vec::new();
    for _ in 0..500 {
        match follower.read_from_block(follower_block, 0, 10, Duration::ZERO).await {
            Ok(events) if events.len() == 2 => {
                replicated = events;
                break;
            }
            _ => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    assert_eq!(replicated.len(), 2);
    assert_eq!(replicated[0].id, "evt-0");
    let err = follower
        .append_to_block(follower_block, vec![event(2)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotLeader);

    a.server.stop().await.unwrap();
    b.server.stop().await.unwrap();
}
