//! End-to-end tests: a coordinator in front of real OSD servers on loopback

use crate::{ClusterState, DirCoordinator, DirServer, RepairOutcome};
use dstore_client::DirClient;
use dstore_common::{file_key, ChunkId, OsdId, ReplicationConfig, Shutdown};
use dstore_meta_store::MetaStore;
use dstore_osd::{ChunkStore, OsdServer};
use dstore_placement::HealthStatus;
use dstore_proto::frame::write_segment;
use dstore_proto::{DirRequest, Status};
use rand::RngCore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

struct TestOsd {
    id: OsdId,
    port: u16,
    server: Arc<OsdServer>,
    shutdown: Shutdown,
    handle: Option<JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

impl TestOsd {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = OsdServer::new(store);
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(Arc::clone(&server).serve(listener, shutdown.subscribe()));
        Self {
            id: OsdId::from_port(port),
            port,
            server,
            shutdown,
            handle: Some(handle),
            _dir: dir,
        }
    }

    async fn stop(&mut self) {
        self.shutdown.trigger();
        if let Some(handle) = self.handle.take() {
            handle.await.unwrap();
        }
    }

    async fn has_chunk(&self, chunk_id: &ChunkId) -> bool {
        self.server.store().get(chunk_id).await.unwrap().is_some()
    }

    /// Chunk files on disk, temp files excluded
    fn stored_chunks(&self) -> usize {
        std::fs::read_dir(self.server.store().root())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .filter(|name| !name.to_string_lossy().starts_with('.'))
            .count()
    }
}

struct TestCluster {
    coordinator: Arc<DirCoordinator>,
    osds: Vec<TestOsd>,
    meta_dir: tempfile::TempDir,
}

impl TestCluster {
    async fn start(osd_count: usize) -> Self {
        let meta_dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(meta_dir.path()).unwrap();
        let coordinator = Arc::new(DirCoordinator::new(
            Arc::new(ClusterState::new()),
            store,
            ReplicationConfig::default(),
        ));
        let mut osds = Vec::new();
        for _ in 0..osd_count {
            let osd = TestOsd::start().await;
            coordinator.on_heartbeat(&osd.id, "127.0.0.1", osd.port);
            osds.push(osd);
        }
        Self {
            coordinator,
            osds,
            meta_dir,
        }
    }

    fn state(&self) -> &ClusterState {
        self.coordinator.state()
    }

    fn osd(&self, id: &OsdId) -> &TestOsd {
        self.osds.iter().find(|o| &o.id == id).unwrap()
    }

    fn mark_down(&self, id: &OsdId) {
        self.state().health.write().get_mut(id).unwrap().status = HealthStatus::Down;
    }

    fn mark_all_down(&self) {
        for osd in &self.osds {
            self.mark_down(&osd.id);
        }
    }

    fn stored_chunks(&self) -> usize {
        self.osds.iter().map(TestOsd::stored_chunks).sum()
    }

    async fn shutdown(mut self) {
        for osd in &mut self.osds {
            osd.stop().await;
        }
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

#[tokio::test]
async fn test_multi_chunk_upload_layout() {
    let cluster = TestCluster::start(3).await;
    let data = random_bytes(2_500_000);

    assert!(cluster.coordinator.upload_bytes("42", "big.bin", &data).await);

    let meta = cluster.state().file(&file_key("42", "big.bin")).unwrap();
    assert_eq!(meta.total_size, 2_500_000);
    assert_eq!(meta.chunk_ids.len(), 3);
    for chunk_id in &meta.chunk_ids {
        assert!(chunk_id.as_str().starts_with("42_"));
        assert_eq!(meta.locations(chunk_id).len(), 3);
    }

    // Chunk boundaries are fixed at 1,000,000 bytes
    let first = &meta.chunk_ids[0];
    let holder = cluster.osd(&meta.locations(first)[0]);
    let stored = holder.server.store().get(first).await.unwrap().unwrap();
    assert_eq!(stored.len(), 1_000_000);
    let last = &meta.chunk_ids[2];
    let holder = cluster.osd(&meta.locations(last)[0]);
    assert_eq!(holder.server.store().get(last).await.unwrap().unwrap().len(), 500_000);

    let downloaded = cluster.coordinator.download("42", "big.bin").await.unwrap();
    assert_eq!(downloaded.as_ref(), data.as_slice());

    // Every OSD took each chunk once
    for h in cluster.state().health_snapshot() {
        assert_eq!(h.chunk_count, 3);
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_round_trip_lengths() {
    let cluster = TestCluster::start(3).await;
    for (name, len) in [("empty", 0), ("one", 1_000_000), ("two-and-a-half", 2_500_000)] {
        let data = random_bytes(len);
        assert!(cluster.coordinator.upload_bytes("u", name, &data).await);
        let downloaded = cluster.coordinator.download("u", name).await.unwrap();
        assert_eq!(downloaded.len(), len);
        assert_eq!(downloaded.as_ref(), data.as_slice());
    }
    let empty = cluster.state().file(&file_key("u", "empty")).unwrap();
    assert!(empty.chunk_ids.is_empty());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_chunking_ignores_client_segmentation() {
    let cluster = TestCluster::start(3).await;
    let data = random_bytes(2_100_000);

    let mut upload = cluster.coordinator.begin_upload("7", "odd.bin");
    for segment in data.chunks(333_333) {
        upload.push(segment).await;
    }
    assert_eq!(upload.received(), 2_100_000);
    assert!(upload.finish(2_100_000).await);

    let meta = cluster.state().file(&file_key("7", "odd.bin")).unwrap();
    assert_eq!(meta.chunk_ids.len(), 3);
    let downloaded = cluster.coordinator.download("7", "odd.bin").await.unwrap();
    assert_eq!(downloaded.as_ref(), data.as_slice());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_declared_size_mismatch_records_received_bytes() {
    let cluster = TestCluster::start(1).await;
    let mut upload = cluster.coordinator.begin_upload("7", "short.bin");
    upload.push(b"abc").await;
    assert!(upload.finish(10).await);
    let meta = cluster.state().file(&file_key("7", "short.bin")).unwrap();
    assert_eq!(meta.total_size, 3);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_upload_is_persisted() {
    let cluster = TestCluster::start(3).await;
    let data = random_bytes(1_200_000);
    assert!(cluster.coordinator.upload_bytes("9", "doc.pdf", &data).await);

    let reloaded = MetaStore::open(cluster.meta_dir.path())
        .unwrap()
        .load_all()
        .unwrap();
    let key = file_key("9", "doc.pdf");
    assert_eq!(reloaded.get(&key), cluster.state().file(&key).as_ref());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_upload_with_unusual_owner_ids() {
    let cluster = TestCluster::start(3).await;
    let long_owner = "a".repeat(300);
    for owner in [".alice", "..", long_owner.as_str(), "user 7/../x"] {
        let data = random_bytes(1_200_000);
        assert!(cluster.coordinator.upload_bytes(owner, "f.bin", &data).await, "owner {owner:?}");

        let meta = cluster.state().file(&file_key(owner, "f.bin")).unwrap();
        for chunk_id in &meta.chunk_ids {
            assert!(ChunkId::parse(chunk_id.as_str()).is_ok());
            assert_eq!(meta.locations(chunk_id).len(), 3);
        }
        let downloaded = cluster.coordinator.download(owner, "f.bin").await.unwrap();
        assert_eq!(downloaded.as_ref(), data.as_slice());
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_failed_upload_removes_stored_chunks() {
    let cluster = TestCluster::start(3).await;
    let key = file_key("4", "partial.bin");

    // The second chunk finds no target while the body is still streaming
    let mut upload = cluster.coordinator.begin_upload("4", "partial.bin");
    upload.push(&random_bytes(1_000_000)).await;
    assert_eq!(cluster.stored_chunks(), 3);
    cluster.mark_all_down();
    upload.push(&random_bytes(1_500_000)).await;
    assert_eq!(upload.received(), 2_500_000);
    assert!(!upload.finish(2_500_000).await);

    assert_eq!(cluster.stored_chunks(), 0);
    assert!(cluster.state().file(&key).is_none());
    assert!(!cluster.coordinator.replication().store().path_for(&key).exists());

    // Same when only the trailing partial chunk fails
    for osd in &cluster.osds {
        cluster.coordinator.on_heartbeat(&osd.id, "127.0.0.1", osd.port);
    }
    let mut upload = cluster.coordinator.begin_upload("4", "partial.bin");
    upload.push(&random_bytes(1_400_000)).await;
    assert_eq!(cluster.stored_chunks(), 3);
    cluster.mark_all_down();
    assert!(!upload.finish(1_400_000).await);

    assert_eq!(cluster.stored_chunks(), 0);
    assert!(cluster.state().file(&key).is_none());
    assert!(!cluster.coordinator.replication().store().path_for(&key).exists());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_cut_upload_body_leaves_nothing_behind() {
    let cluster = TestCluster::start(3).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let shutdown = Shutdown::new();
    let server = tokio::spawn(
        DirServer::new(Arc::clone(&cluster.coordinator)).serve(listener, shutdown.subscribe()),
    );

    let header = DirRequest::Upload {
        owner_id: "6".to_string(),
        file_name: "cut.bin".to_string(),
        declared_size: 3_000_000,
    };

    // Connection dropped in the middle of the second segment
    let mut socket = TcpStream::connect(&address).await.unwrap();
    header.write_to(&mut socket).await.unwrap();
    write_segment(&mut socket, &random_bytes(1_000_000)).await.unwrap();
    socket.write_i32(500_000).await.unwrap();
    socket.write_all(&random_bytes(10)).await.unwrap();
    socket.shutdown().await.unwrap();
    let mut reply = Vec::new();
    socket.read_to_end(&mut reply).await.unwrap();
    assert!(reply.is_empty());
    assert_eq!(cluster.stored_chunks(), 0);
    for h in cluster.state().health_snapshot() {
        assert_eq!(h.chunk_count, 1);
    }

    // Malformed segment length after a stored chunk
    let mut socket = TcpStream::connect(&address).await.unwrap();
    header.write_to(&mut socket).await.unwrap();
    write_segment(&mut socket, &random_bytes(1_000_000)).await.unwrap();
    socket.write_i32(-5).await.unwrap();
    socket.flush().await.unwrap();
    assert_eq!(Status::read_from(&mut socket).await.unwrap(), Status::Error);
    let mut rest = Vec::new();
    socket.read_to_end(&mut rest).await.unwrap();
    assert_eq!(cluster.stored_chunks(), 0);

    let key = file_key("6", "cut.bin");
    assert!(cluster.state().file(&key).is_none());
    assert!(!cluster.coordinator.replication().store().path_for(&key).exists());

    shutdown.trigger();
    server.await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_fewer_osds_than_replication_factor() {
    let cluster = TestCluster::start(2).await;
    let data = random_bytes(1_500_000);
    assert!(cluster.coordinator.upload_bytes("1", "f", &data).await);

    let meta = cluster.state().file(&file_key("1", "f")).unwrap();
    for chunk_id in &meta.chunk_ids {
        assert_eq!(meta.locations(chunk_id).len(), 2);
    }
    assert_eq!(meta.max_replicas(), 2);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_upload_without_osds_fails() {
    let cluster = TestCluster::start(0).await;
    assert!(!cluster.coordinator.upload_bytes("1", "f", b"payload").await);
    assert!(cluster.state().file(&file_key("1", "f")).is_none());
    assert!(!cluster
        .coordinator
        .replication()
        .store()
        .path_for(&file_key("1", "f"))
        .exists());
}

#[tokio::test]
async fn test_upload_fails_when_every_target_is_unreachable() {
    let mut cluster = TestCluster::start(2).await;
    for osd in &mut cluster.osds {
        osd.stop().await;
    }
    assert!(!cluster.coordinator.upload_bytes("1", "f", &random_bytes(10)).await);
    assert!(cluster.state().file(&file_key("1", "f")).is_none());
}

#[tokio::test]
async fn test_download_with_two_replicas_down() {
    let mut cluster = TestCluster::start(3).await;
    let data = random_bytes(1_000_001);
    assert!(cluster.coordinator.upload_bytes("5", "survivor", &data).await);

    let down: Vec<OsdId> = cluster.osds[..2].iter().map(|o| o.id.clone()).collect();
    for id in &down {
        cluster.mark_down(id);
    }
    for osd in &mut cluster.osds[..2] {
        osd.stop().await;
    }

    let downloaded = cluster.coordinator.download("5", "survivor").await.unwrap();
    assert_eq!(downloaded.as_ref(), data.as_slice());

    // With the last replica gone as well the download is absent
    cluster.osds[2].stop().await;
    assert!(cluster.coordinator.download("5", "survivor").await.is_none());
}

#[tokio::test]
async fn test_download_unknown_file() {
    let cluster = TestCluster::start(1).await;
    assert!(cluster.coordinator.download("nobody", "nothing").await.is_none());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_delete_removes_every_copy() {
    let cluster = TestCluster::start(3).await;
    let data = random_bytes(2_000_000);
    assert!(cluster.coordinator.upload_bytes("3", "gone", &data).await);
    let key = file_key("3", "gone");
    let meta = cluster.state().file(&key).unwrap();

    assert!(cluster.coordinator.delete("3", "gone").await);
    assert!(cluster.coordinator.download("3", "gone").await.is_none());
    assert!(!cluster.coordinator.replication().store().path_for(&key).exists());
    for chunk_id in &meta.chunk_ids {
        for osd in &cluster.osds {
            assert!(!osd.has_chunk(chunk_id).await);
        }
    }
    assert!(!cluster.coordinator.delete("3", "gone").await);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_repair_converges_after_osd_loss() {
    let mut cluster = TestCluster::start(4).await;
    let data = random_bytes(3_000_000);
    assert!(cluster.coordinator.upload_bytes("8", "repair.bin", &data).await);
    let key = file_key("8", "repair.bin");
    let before = cluster.state().file(&key).unwrap();

    let victim = before.locations(&before.chunk_ids[0])[0].clone();
    let lost = before
        .chunk_ids
        .iter()
        .filter(|c| before.locations(c).contains(&victim))
        .count();
    let victim_index = cluster.osds.iter().position(|o| o.id == victim).unwrap();
    cluster.osds[victim_index].stop().await;

    // Everyone but the victim keeps beating; 20s later it is DOWN
    let now = Instant::now();
    let later = now + Duration::from_secs(20);
    for osd in cluster.osds.iter().filter(|o| o.id != victim) {
        cluster
            .state()
            .record_heartbeat(&osd.id, "127.0.0.1", osd.port, later);
    }
    let replication = Arc::clone(cluster.coordinator.replication());
    let transitions = replication.health_tick(later);
    assert_eq!(transitions.len(), 1);
    assert!(transitions[0].is_failure());
    assert_eq!(replication.queue_len(), lost);

    while let Some(task) = replication.next_task(Duration::from_millis(10)).await {
        assert!(matches!(
            replication.execute_repair(&task).await,
            RepairOutcome::Repaired { added: 1 }
        ));
    }
    assert_eq!(replication.repairs_succeeded(), lost as u64);
    assert_eq!(replication.repairs_failed(), 0);

    let after = cluster.state().file(&key).unwrap();
    let statuses = cluster.state().statuses();
    for chunk_id in &after.chunk_ids {
        let locations = after.locations(chunk_id);
        let mut unique = locations.to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), locations.len());
        let alive = locations
            .iter()
            .filter(|id| statuses[*id].is_alive())
            .count();
        assert_eq!(alive, 3);
    }

    // The repaired placement was persisted
    let reloaded = MetaStore::open(cluster.meta_dir.path())
        .unwrap()
        .load_all()
        .unwrap();
    assert_eq!(reloaded[&key], after);

    // A second pass finds nothing to do
    assert_eq!(replication.full_repair_scan(), 0);

    let downloaded = cluster.coordinator.download("8", "repair.bin").await.unwrap();
    assert_eq!(downloaded.as_ref(), data.as_slice());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_scan_restores_replicas_on_returning_and_new_osds() {
    let mut cluster = TestCluster::start(3).await;
    let first = cluster.osds[0].id.clone();
    cluster.mark_down(&cluster.osds[1].id);
    cluster.mark_down(&cluster.osds[2].id);

    let data = random_bytes(2_000_000);
    assert!(cluster.coordinator.upload_bytes("12", "thin.bin", &data).await);
    let key = file_key("12", "thin.bin");
    let before = cluster.state().file(&key).unwrap();
    assert_eq!(before.chunk_ids.len(), 2);
    for chunk_id in &before.chunk_ids {
        assert_eq!(before.locations(chunk_id), &[first.clone()]);
    }

    // One OSD comes back, another joins; no health transition is involved
    let returning = cluster.osds[1].id.clone();
    cluster
        .coordinator
        .on_heartbeat(&returning, "127.0.0.1", cluster.osds[1].port);
    let newcomer = TestOsd::start().await;
    cluster
        .coordinator
        .on_heartbeat(&newcomer.id, "127.0.0.1", newcomer.port);
    cluster.osds.push(newcomer);

    let replication = Arc::clone(cluster.coordinator.replication());
    assert_eq!(replication.full_repair_scan(), 2);
    while let Some(task) = replication.next_task(Duration::from_millis(10)).await {
        assert_eq!(task.current_replicas, 1);
        assert_eq!(
            replication.execute_repair(&task).await,
            RepairOutcome::Repaired { added: 2 }
        );
    }
    assert_eq!(replication.repairs_succeeded(), 4);

    let after = cluster.state().file(&key).unwrap();
    let statuses = cluster.state().statuses();
    for chunk_id in &after.chunk_ids {
        let locations = after.locations(chunk_id);
        assert_eq!(locations.len(), 3);
        assert_eq!(locations[0], first);
        assert!(!locations.contains(&cluster.osds[2].id));
        let mut unique = locations.to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 3);
        for osd in locations {
            assert!(statuses[osd].is_alive());
            assert!(cluster.osd(osd).has_chunk(chunk_id).await);
        }
    }

    let reloaded = MetaStore::open(cluster.meta_dir.path())
        .unwrap()
        .load_all()
        .unwrap();
    assert_eq!(reloaded[&key], after);
    assert_eq!(replication.full_repair_scan(), 0);

    let downloaded = cluster.coordinator.download("12", "thin.bin").await.unwrap();
    assert_eq!(downloaded.as_ref(), data.as_slice());
    cluster.shutdown().await;
}

async fn wait_for_registrations(state: &ClusterState, count: usize) {
    for _ in 0..200 {
        if state.slaves().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("OSDs did not register");
}

#[tokio::test]
async fn test_dir_protocol_over_tcp() {
    let meta_dir = tempfile::tempdir().unwrap();
    let coordinator = Arc::new(DirCoordinator::new(
        Arc::new(ClusterState::new()),
        MetaStore::open(meta_dir.path()).unwrap(),
        ReplicationConfig::default(),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let shutdown = Shutdown::new();
    let server = tokio::spawn(DirServer::new(Arc::clone(&coordinator)).serve(listener, shutdown.subscribe()));

    let client = DirClient::new(address.clone());
    let mut osds = Vec::new();
    for _ in 0..3 {
        let osd = TestOsd::start().await;
        client.heartbeat(&osd.id, osd.port).await.unwrap();
        osds.push(osd);
    }
    wait_for_registrations(coordinator.state(), 3).await;

    let data = random_bytes(1_300_000);
    assert!(client.upload("11", "wire.bin", &data).await.unwrap());
    let downloaded = client.download("11", "wire.bin").await.unwrap().unwrap();
    assert_eq!(downloaded.as_ref(), data.as_slice());
    assert!(client.download("11", "missing").await.unwrap().is_none());

    assert_eq!(
        client.list_files("11").await.unwrap(),
        "wire.bin|1300000|2|3\n"
    );
    assert_eq!(client.list_all().await.unwrap(), "11|wire.bin|1300000|2\n");

    let cluster = client.cluster().await.unwrap();
    assert_eq!(cluster.lines().count(), 3);
    for osd in &osds {
        assert!(cluster.contains(&format!("{}|UP|127.0.0.1:{}", osd.id, osd.port)));
    }
    let health = client.health().await.unwrap();
    assert!(health.lines().all(|l| l.ends_with("|chunks=2")));

    let stats = client.stats().await.unwrap();
    assert!(stats.starts_with("=== Replication Stats ===\nFactor      : 3\n"));
    assert!(stats.contains("=== OSD Health ===\n"));

    let chunks = client.chunks().await.unwrap();
    assert!(chunks.starts_with("FILE=wire.bin\n  11_"));
    assert_eq!(chunks.lines().count(), 3);

    assert!(client.delete("11", "wire.bin").await.unwrap());
    assert!(!client.delete("11", "wire.bin").await.unwrap());
    assert_eq!(client.chunks().await.unwrap(), "No files registered\n");

    // Unknown commands are answered and the server keeps running
    let mut socket = TcpStream::connect(&address).await.unwrap();
    dstore_proto::frame::write_str(&mut socket, "FORMAT_DISK").await.unwrap();
    socket.flush().await.unwrap();
    assert_eq!(
        Status::read_from(&mut socket).await.unwrap(),
        Status::UnknownCommand
    );
    assert!(client.list_all().await.unwrap().is_empty());

    shutdown.trigger();
    server.await.unwrap();
    for osd in &mut osds {
        osd.stop().await;
    }
}
