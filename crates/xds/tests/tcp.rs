#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use keel_core::wire::{DiscoveryRequest, DiscoveryResponse, Node};
use keel_core::{ResourceType, WireVersion};
use keel_feedback::FeedbackStore;
use keel_snapshot::SnapshotCache;
use keel_xds::{serve_tcp, DiscoveryServer, ServerConfig};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn line_transport_push_ack_and_shutdown() {
    let cache = Arc::new(SnapshotCache::new(WireVersion::V3));
    let feedback = Arc::new(FeedbackStore::new());
    let server = Arc::new(DiscoveryServer::new(Arc::clone(&cache), Arc::clone(&feedback), ServerConfig::default()));
    let items = [("c1".to_string(), json!({ "name": "c1" }))].into_iter().collect();
    cache.set_resources("n1", ResourceType::Cluster, "", items).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = tokio::spawn(serve_tcp(Arc::clone(&server), listener, Duration::from_millis(200)));

    let sock = TcpStream::connect(addr).await.unwrap();
    let mut conn = Framed::new(sock, LinesCodec::new());
    let type_url = WireVersion::V3.type_url(ResourceType::Cluster).unwrap().to_string();
    let node = Node { id: "n1".into(), metadata: [("instance".to_string(), "pod-a".to_string())].into_iter().collect(), ..Default::default() };
    let req = DiscoveryRequest { node: Some(node.clone()), type_url: type_url.clone(), ..Default::default() };

    conn.send("not json".to_string()).await.unwrap();
    conn.send(serde_json::to_string(&req).unwrap()).await.unwrap();
    let line = tokio::time::timeout(Duration::from_secs(2), conn.next()).await.unwrap().unwrap().unwrap();
    let resp: DiscoveryResponse = serde_json::from_str(&line).unwrap();
    assert_eq!(resp.type_url, type_url);
    assert_eq!(resp.resources[0].name, "c1");

    let ack = DiscoveryRequest {
        node: Some(node),
        type_url,
        version_info: resp.version_info.clone(),
        response_nonce: resp.nonce.clone(),
        ..Default::default()
    };
    conn.send(serde_json::to_string(&ack).unwrap()).await.unwrap();
    for _ in 0..200 {
        if feedback.acked_version("n1", ResourceType::Cluster, "pod-a").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(feedback.acked_version("n1", ResourceType::Cluster, "pod-a"), Some(resp.version_info));

    server.shutdown();
    tokio::time::timeout(Duration::from_secs(2), serving).await.unwrap().unwrap().unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(2), conn.next()).await.unwrap();
    assert!(closed.is_none() || closed.unwrap().is_err());
}
