//! End-to-end transfer tests between two engines

use ferry_core::{
    Engine, EngineConfig, ErrorCode, FailureKind, Limit, TransferRequest, TransferStore,
    UpdatedInfo,
};
use ferry_integration_tests::fixtures::{
    ALPHA, BETA, FaultyFileOpener, LoopbackConnector, TwoNodeFixture,
};
use ferry_integration_tests::init_tracing;
use ferry_transport::{Packet, RequestKind};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const BLOCK: u32 = 4096;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn final_ack(packets: &[Packet]) -> Option<(String, RequestKind)> {
    packets.iter().rev().find_map(|packet| match packet {
        Packet::ValidAck {
            rank_token,
            request_kind,
            ..
        } => Some((rank_token.clone(), *request_kind)),
        _ => None,
    })
}

#[tokio::test]
async fn test_three_block_push_completes() {
    init_tracing();
    let fixture = TwoNodeFixture::new(BLOCK);
    let data = pattern(3 * BLOCK as usize);
    fixture.write_outbound("ledger.dat", &data);

    let handle = fixture
        .alpha
        .transfer(TransferRequest::send(BETA, "ledger.dat"))
        .await
        .unwrap();
    let success = handle.wait().await.unwrap();
    handle.wait_closed().await;

    assert_eq!(success.record.rank, 3);
    assert_eq!(success.record.updated_info, UpdatedInfo::Done);
    assert_eq!(success.record.info_status, ErrorCode::CompleteOk);

    let (token, kind) = final_ack(&fixture.alpha_received()).expect("success ack");
    assert_eq!(token, "3");
    assert_eq!(kind, RequestKind::EndRequest);

    let beta = fixture.beta_handle(&success.record.key).await;
    let received = beta.wait().await.unwrap();
    beta.wait_closed().await;
    assert_eq!(received.record.rank, 3);
    assert_eq!(received.record.updated_info, UpdatedInfo::Done);
    assert_eq!(std::fs::read(fixture.inbound_path("ledger.dat")).unwrap(), data);
    assert_eq!(success.checksum, received.checksum);
}

#[tokio::test]
async fn test_disk_failure_then_resume() {
    init_tracing();
    let files = Arc::new(FaultyFileOpener::new());
    let faults = Arc::clone(files.state());
    let fixture = TwoNodeFixture::with_beta_files(BLOCK, files);
    let data = pattern(3 * BLOCK as usize);
    fixture.write_outbound("batch.csv", &data);
    faults.fail_next_write_at(1);

    // Disk error on the second block
    let handle = fixture
        .alpha
        .transfer(TransferRequest::send(BETA, "batch.csv"))
        .await
        .unwrap();
    let key = handle.key().clone();
    let beta = fixture.beta_handle(&key).await;

    let failure = beta.wait().await.unwrap_err();
    beta.wait_closed().await;
    assert_eq!(failure.kind, FailureKind::System);
    let failed = failure.record.expect("record");
    assert_eq!(failed.rank, 1);
    assert_eq!(failed.updated_info, UpdatedInfo::InError);
    assert_eq!(failed.info_status, ErrorCode::TransferError);
    assert_eq!(faults.written(), vec![0]);

    let stored = fixture
        .beta
        .get(&fixture.receiver_key(&key))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.rank, 1);
    assert_eq!(stored.updated_info, UpdatedInfo::InError);

    assert!(handle.wait().await.is_err());
    handle.wait_closed().await;
    assert!(
        fixture
            .alpha_received()
            .iter()
            .any(|packet| matches!(packet, Packet::ErrorNotice { .. }))
    );
    // The sender only keeps the block the receiver committed
    let sender = fixture.alpha.get(&key).await.unwrap().unwrap();
    assert!(sender.updated_info.is_resubmittable());
    assert_eq!(sender.rank, 1);

    // Resubmit picks up at the failed block
    faults.clear_written();
    fixture.clear_received();
    let resumed = fixture.alpha.resubmit(&key).await.unwrap();
    assert_eq!(resumed.updated_info, UpdatedInfo::ToSubmit);

    let handle = fixture.alpha.run(&key).await.unwrap();
    let success = handle.wait().await.unwrap();
    handle.wait_closed().await;
    assert_eq!(success.record.rank, 3);
    assert_eq!(success.record.updated_info, UpdatedInfo::Done);
    assert_eq!(final_ack(&fixture.alpha_received()).unwrap().0, "3");

    let beta = fixture.beta_handle(&key).await;
    let received = beta.wait().await.unwrap();
    assert_eq!(received.record.updated_info, UpdatedInfo::Done);
    assert_eq!(faults.written(), vec![1, 2]);
    assert_eq!(std::fs::read(fixture.inbound_path("batch.csv")).unwrap(), data);
}

#[tokio::test]
async fn test_crashed_sender_resumes_after_restart() {
    init_tracing();
    let files = Arc::new(FaultyFileOpener::new());
    let faults = Arc::clone(files.state());
    let mut fixture = TwoNodeFixture::persistent(BLOCK, files).await;
    let data = pattern(4 * BLOCK as usize);
    fixture.write_outbound("journal.bin", &data);
    faults.fail_next_write_at(2);

    let handle = fixture
        .alpha
        .transfer(TransferRequest::send(BETA, "journal.bin"))
        .await
        .unwrap();
    let key = handle.key().clone();
    assert!(handle.wait().await.is_err());
    handle.wait_closed().await;
    let beta = fixture.beta_handle(&key).await;
    assert_eq!(beta.wait().await.unwrap_err().record.expect("record").rank, 2);
    beta.wait_closed().await;

    // The sender's process dies before it can record the failure
    let store = fixture.alpha_store().await;
    let mut record = store.get(&key).await.unwrap().unwrap();
    assert_eq!(record.rank, 2);
    record.updated_info = UpdatedInfo::Running;
    store.put(&record).await.unwrap();

    fixture.restart_alpha().await;
    assert!(fixture.alpha.run(&key).await.is_err());
    assert!(fixture.alpha.resubmit(&key).await.is_err());

    let recovered = fixture.alpha.recover().await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].updated_info, UpdatedInfo::Interrupted);
    assert_eq!(recovered[0].info_status, ErrorCode::StoppedTransfer);

    faults.clear_written();
    let resumed = fixture.alpha.resubmit(&key).await.unwrap();
    assert_eq!(resumed.rank, 2);
    let handle = fixture.alpha.run(&key).await.unwrap();
    let success = handle.wait().await.unwrap();
    handle.wait_closed().await;
    assert_eq!(success.record.rank, 4);
    assert_eq!(success.record.updated_info, UpdatedInfo::Done);

    let beta = fixture.beta_handle(&key).await;
    beta.wait().await.unwrap();
    assert_eq!(faults.written(), vec![2, 3]);
    assert_eq!(std::fs::read(fixture.inbound_path("journal.bin")).unwrap(), data);
    let stored = store.get(&key).await.unwrap().unwrap();
    assert_eq!(stored.updated_info, UpdatedInfo::Done);
}

#[tokio::test]
async fn test_done_transfer_cannot_run_again() {
    let fixture = TwoNodeFixture::new(BLOCK);
    fixture.write_outbound("once.bin", &pattern(100));

    let handle = fixture
        .alpha
        .transfer(TransferRequest::send(BETA, "once.bin"))
        .await
        .unwrap();
    handle.wait().await.unwrap();
    handle.wait_closed().await;

    let key = handle.key().clone();
    assert!(fixture.alpha.run(&key).await.is_err());
    assert!(fixture.alpha.resubmit(&key).await.is_err());
    let record = fixture.alpha.get(&key).await.unwrap().unwrap();
    assert_eq!(record.updated_info, UpdatedInfo::Done);
}

#[tokio::test(start_paused = true)]
async fn test_write_limit_paces_transfer() {
    let fixture = TwoNodeFixture::new(500);
    let data = pattern(5000);
    fixture.write_outbound("slow.bin", &data);
    fixture.limit_beta(Limit {
        write_session_limit: 1000,
        delay_limit: 100,
        ..Limit::UNLIMITED
    });

    let start = tokio::time::Instant::now();
    let handle = fixture
        .alpha
        .transfer(TransferRequest::send(BETA, "slow.bin"))
        .await
        .unwrap();
    let success = handle.wait().await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(success.record.rank, 10);
    assert!(
        elapsed >= Duration::from_millis(4500),
        "5000 bytes at 1000 B/s took {elapsed:?}"
    );
    assert_eq!(std::fs::read(fixture.inbound_path("slow.bin")).unwrap(), data);
    assert!(fixture.beta.limiter_stats().bytes_written >= 5000);
}

#[tokio::test]
async fn test_interrupt_then_resume() {
    let fixture = TwoNodeFixture::new(500);
    let data = pattern(5000);
    fixture.write_outbound("paced.bin", &data);
    fixture.limit_beta(Limit {
        write_session_limit: 1000,
        delay_limit: 100,
        ..Limit::UNLIMITED
    });

    let handle = fixture
        .alpha
        .transfer(TransferRequest::send(BETA, "paced.bin"))
        .await
        .unwrap();
    let key = handle.key().clone();
    let beta = fixture.beta_handle(&key).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    // The paced receiver stops; the sender learns it from the error notice
    assert!(fixture.beta.interrupt(&fixture.receiver_key(&key)));
    let stopped = beta.wait().await.unwrap_err().record.expect("record");
    beta.wait_closed().await;
    assert_eq!(stopped.updated_info, UpdatedInfo::Interrupted);
    assert_eq!(stopped.info_status, ErrorCode::StoppedTransfer);
    assert!(stopped.rank < 10);

    let failure = handle.wait().await.unwrap_err();
    handle.wait_closed().await;
    let sender = failure.record.expect("record");
    assert!(sender.updated_info.is_resubmittable());
    assert_eq!(sender.rank, stopped.rank);
    assert!(!fixture.beta.interrupt(&fixture.receiver_key(&key)));

    fixture.limit_beta(Limit::UNLIMITED);
    fixture.alpha.resubmit(&key).await.unwrap();
    let handle = fixture.alpha.run(&key).await.unwrap();
    let success = handle.wait().await.unwrap();
    assert_eq!(success.record.rank, 10);
    assert_eq!(std::fs::read(fixture.inbound_path("paced.bin")).unwrap(), data);
}

#[tokio::test]
async fn test_missing_source_reported_to_peer() {
    let fixture = TwoNodeFixture::new(BLOCK);

    let handle = fixture
        .alpha
        .transfer(TransferRequest::send(BETA, "absent.bin"))
        .await
        .unwrap();
    let failure = handle.wait().await.unwrap_err();
    let record = failure.record.expect("record");
    assert_eq!(record.updated_info, UpdatedInfo::InError);
    assert_eq!(record.info_status, ErrorCode::FileNotFound);
    assert!(!fixture.inbound_path("absent.bin").exists());
}

fn tcp_config(host: &str, dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::for_host(host);
    config.listen_addr = "127.0.0.1:0".parse().unwrap();
    config.in_dir = dir.path().join(host).join("in");
    config.out_dir = dir.path().join(host).join("out");
    config.transfer.block_size = BLOCK;
    config
}

#[tokio::test]
async fn test_tcp_send_and_fetch() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let beta = Engine::builder(tcp_config(BETA, &dir)).build().unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = {
        let beta = beta.clone();
        tokio::spawn(async move { beta.serve(listener).await })
    };

    let mut config = tcp_config(ALPHA, &dir);
    config.partners.insert(BETA.to_string(), addr);
    let alpha = Engine::builder(config).build().unwrap();

    let upload = pattern(2 * BLOCK as usize + 17);
    std::fs::create_dir_all(dir.path().join("alpha/out")).unwrap();
    std::fs::write(dir.path().join("alpha/out/up.bin"), &upload).unwrap();
    let handle = alpha
        .transfer(TransferRequest::send(BETA, "up.bin"))
        .await
        .unwrap();
    let success = handle.wait().await.unwrap();
    handle.wait_closed().await;
    assert_eq!(success.record.rank, 3);

    let download = pattern(BLOCK as usize * 4);
    std::fs::create_dir_all(dir.path().join("beta/out")).unwrap();
    std::fs::write(dir.path().join("beta/out/down.bin"), &download).unwrap();
    let handle = alpha
        .transfer(TransferRequest::receive(BETA, "down.bin"))
        .await
        .unwrap();
    let fetched = handle.wait().await.unwrap();
    handle.wait_closed().await;
    assert_eq!(fetched.record.rank, 4);
    assert_eq!(
        std::fs::read(dir.path().join("alpha/in/down.bin")).unwrap(),
        download
    );

    // The upload may still be settling on beta when alpha sees the ack
    let mut done = Vec::new();
    for _ in 0..50 {
        done = beta.list(Some(UpdatedInfo::Done)).await.unwrap();
        if done.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(done.len(), 2);
    assert_eq!(std::fs::read(dir.path().join("beta/in/up.bin")).unwrap(), upload);

    beta.shutdown(Duration::from_secs(1)).await;
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_blacklisted_requester_refused() {
    let dir = TempDir::new().unwrap();
    let mut beta_config = tcp_config(BETA, &dir);
    beta_config
        .registry
        .blacklist
        .insert("127.0.0.1".parse().unwrap());
    let beta = Engine::builder(beta_config).build().unwrap();

    let mut alpha_config = tcp_config(ALPHA, &dir);
    alpha_config
        .partners
        .insert(BETA.to_string(), "127.0.0.1:6666".parse().unwrap());
    let alpha = Engine::builder(alpha_config)
        .connector(Arc::new(LoopbackConnector::new(beta.clone())))
        .build()
        .unwrap();

    std::fs::create_dir_all(dir.path().join("alpha/out")).unwrap();
    std::fs::write(dir.path().join("alpha/out/x.bin"), pattern(10)).unwrap();
    let handle = alpha
        .transfer(TransferRequest::send(BETA, "x.bin"))
        .await
        .unwrap();
    let failure = handle.wait().await.unwrap_err();
    let record = failure.record.expect("record");
    assert!(record.updated_info.is_resubmittable());
    assert!(beta.list(None).await.unwrap().is_empty());
}
