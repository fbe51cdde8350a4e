// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end discovery engine scenarios, driven through the public API.

use hdds_discovery_engine::{
    AckState, Announcer, DiscoveryController, DiscoveryDriver, DiscoveryPersistence,
    EndpointData, EndpointHost, EndpointKind, EngineSettings, Guid, GuidPrefix, HostError,
    InboundMessage, NoopPersistence, OutboundMessage, ParticipantData, ParticipantRecord,
    ParticipantRole, ParticipantStatus, RemovalReason, SqlitePersistence, Subject,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct FakeHost {
    removed: Mutex<Vec<(GuidPrefix, RemovalReason)>>,
}

impl EndpointHost for FakeHost {
    fn create_discovery_endpoints(&self, _local: &ParticipantRecord) -> Result<(), HostError> {
        Ok(())
    }

    fn assign_remote_endpoints(&self, _participant: &ParticipantRecord) {}

    fn remove_remote_endpoints(&self, _participant: &ParticipantRecord) {}

    fn notify_above_remote_endpoints(&self, _participant: &ParticipantRecord) {}

    fn participant_removed(&self, participant: &ParticipantRecord, reason: RemovalReason) {
        self.removed.lock().push((participant.id(), reason));
    }
}

#[derive(Default)]
struct FakeAnnouncer {
    sent: Mutex<Vec<(GuidPrefix, OutboundMessage)>>,
}

impl Announcer for FakeAnnouncer {
    fn send(&self, peer: &GuidPrefix, message: OutboundMessage) -> bool {
        self.sent.lock().push((*peer, message));
        true
    }
}

fn prefix(id: u8) -> GuidPrefix {
    let mut gp = [0u8; 12];
    gp[0] = 0x44;
    gp[11] = id;
    gp
}

const LOCAL: u8 = 0xff;

fn participant(id: u8, role: ParticipantRole) -> ParticipantData {
    ParticipantData::new(prefix(id), role, Duration::from_secs(30))
}

fn endpoint(owner: u8, entity: u8, topic: &str) -> EndpointData {
    EndpointData {
        guid: Guid::new(prefix(owner), [0, 0, entity, 0x07]),
        topic_name: topic.into(),
        type_name: "Sample".into(),
        kind: EndpointKind::Reader,
        reliable: true,
        durability: 0,
        unicast_locators: vec!["10.0.0.4:7411".parse().unwrap()],
    }
}

fn start(
    backend: Arc<dyn DiscoveryPersistence>,
) -> (Arc<DiscoveryController>, Arc<FakeHost>, Arc<FakeAnnouncer>) {
    let host = Arc::new(FakeHost::default());
    let announcer = Arc::new(FakeAnnouncer::default());
    let settings = EngineSettings {
        announcement_period: Duration::from_secs(3600),
        trim_grace: Duration::ZERO,
        ..Default::default()
    };
    let controller = Arc::new(DiscoveryController::new(
        settings,
        host.clone(),
        announcer.clone(),
        backend,
    ));
    controller
        .init(participant(LOCAL, ParticipantRole::Server))
        .unwrap();
    (controller, host, announcer)
}

fn announce(id: u8, role: ParticipantRole, sequence: u64) -> InboundMessage {
    InboundMessage::ParticipantData {
        change: Some(sequence * 10),
        data: participant(id, role),
        sequence,
        writer: Guid::spdp_writer(prefix(id)),
    }
}

fn tick() -> Instant {
    Instant::now() + Duration::from_millis(1)
}

#[test]
fn test_out_of_order_updates_keep_freshest() {
    let (controller, _, _) = start(Arc::new(NoopPersistence));
    let driver = DiscoveryDriver::new(controller.clone());

    for sequence in [3, 1, 5, 2, 4] {
        let mut data = participant(1, ParticipantRole::Simple);
        data.name = Some(format!("rev-{}", sequence));
        driver.handle(InboundMessage::ParticipantData {
            change: None,
            data,
            sequence,
            writer: Guid::spdp_writer(prefix(1)),
        });
    }

    let record = controller.store().participant(&prefix(1)).unwrap();
    assert_eq!(record.sequence, 5);
    assert_eq!(record.data.name.as_deref(), Some("rev-5"));
}

#[test]
fn test_participant_lifecycle_until_trim() {
    let (controller, _, announcer) = start(Arc::new(NoopPersistence));
    let driver = DiscoveryDriver::new(controller.clone());
    driver.handle(announce(2, ParticipantRole::Server, 1));
    driver.handle(announce(3, ParticipantRole::Server, 1));

    // Participant A: id=1, seq=5
    let handled = driver.handle(announce(1, ParticipantRole::Simple, 5));
    assert!(handled.applied);
    let record = controller.store().participant(&prefix(1)).unwrap();
    assert_eq!(record.status, ParticipantStatus::Alive);

    // Stale seq=3 leaves the record untouched
    driver.handle(announce(1, ParticipantRole::Simple, 3));
    assert_eq!(controller.store().participant(&prefix(1)).unwrap().sequence, 5);

    // Disposal seq=6
    let handled = driver.handle(InboundMessage::ParticipantDisposed {
        change: Some(61),
        guid_prefix: prefix(1),
        sequence: 6,
    });
    assert_eq!(handled.ack, Some(61));
    assert_eq!(
        controller.store().participant(&prefix(1)).unwrap().status,
        ParticipantStatus::Removed
    );
    let dispose = controller
        .matrix()
        .latest(&Subject::Participant(prefix(1)))
        .unwrap();

    // Not trimmable until both peers ack
    assert_eq!(controller.sync(tick()).trimmed, 0);
    assert!(announcer
        .sent
        .lock()
        .iter()
        .any(|(peer, m)| *peer == prefix(2) && m.change() == Some(dispose)));

    driver.handle(InboundMessage::Ack {
        from: prefix(2),
        changes: vec![dispose],
    });
    assert_eq!(controller.sync(tick()).trimmed, 0);
    assert!(controller.store().participant(&prefix(1)).is_some());

    driver.handle(InboundMessage::Ack {
        from: prefix(3),
        changes: vec![dispose],
    });
    assert_eq!(controller.sync(tick()).trimmed, 1);
    assert!(controller.store().participant(&prefix(1)).is_none());
}

#[test]
fn test_dropped_peer_no_longer_blocks_trim() {
    let (controller, host, _) = start(Arc::new(NoopPersistence));
    let driver = DiscoveryDriver::new(controller.clone());
    driver.handle(announce(2, ParticipantRole::Server, 1));
    driver.handle(announce(3, ParticipantRole::Server, 1));
    driver.handle(announce(1, ParticipantRole::Simple, 1));
    driver.handle(InboundMessage::ParticipantDisposed {
        change: None,
        guid_prefix: prefix(1),
        sequence: 2,
    });
    let fact = controller
        .matrix()
        .latest(&Subject::Participant(prefix(1)))
        .unwrap();

    controller.acknowledge(&prefix(3), &[fact]);
    assert_eq!(
        controller.matrix().ack_state(fact, &prefix(2)),
        Some(AckState::Pending)
    );
    assert!(!controller.matrix().is_trimmable(fact));

    // P2 goes away without acking
    assert!(controller.remove_remote_participant(&prefix(2), RemovalReason::Dropped));
    assert!(!controller.matrix().is_peer(&prefix(2)));
    assert!(controller.matrix().is_trimmable(fact));
    assert!(host
        .removed
        .lock()
        .contains(&(prefix(2), RemovalReason::Dropped)));

    controller.sync(tick());
    assert!(controller.store().participant(&prefix(1)).is_none());
}

#[test]
fn test_owner_removal_removes_endpoints() {
    let (controller, _, _) = start(Arc::new(NoopPersistence));
    let driver = DiscoveryDriver::new(controller.clone());
    driver.handle(announce(1, ParticipantRole::Client, 1));
    for entity in 1..=3 {
        let handled = driver.handle(InboundMessage::EndpointData {
            change: None,
            data: endpoint(1, entity, "Chatter"),
            sequence: 1,
        });
        assert!(handled.applied);
    }
    assert_eq!(controller.store().endpoints_of(&prefix(1)).len(), 3);

    driver.handle(InboundMessage::ParticipantDisposed {
        change: None,
        guid_prefix: prefix(1),
        sequence: 2,
    });
    assert!(controller.store().endpoints_of(&prefix(1)).is_empty());
    assert!(controller.store().endpoint(&endpoint(1, 2, "Chatter").guid).is_none());
    assert!(controller.store().orphaned_endpoints().is_empty());

    // A late endpoint for the removed owner is refused
    let handled = driver.handle(InboundMessage::EndpointData {
        change: Some(99),
        data: endpoint(1, 4, "Chatter"),
        sequence: 1,
    });
    assert_eq!(handled.ack, None);
    assert_eq!(controller.store().endpoint_count(), 0);
}

#[tokio::test]
async fn test_restart_reproduces_store() {
    let dir = tempfile::tempdir().unwrap();
    let local = prefix(LOCAL);

    let (first, _, _) = start(Arc::new(
        SqlitePersistence::open_in(dir.path(), &local).unwrap(),
    ));
    let driver = DiscoveryDriver::new(first.clone());
    driver.handle(announce(1, ParticipantRole::Client, 4));
    driver.handle(announce(2, ParticipantRole::Simple, 7));
    driver.handle(InboundMessage::EndpointData {
        change: None,
        data: endpoint(1, 1, "Pose"),
        sequence: 2,
    });
    driver.handle(InboundMessage::EndpointData {
        change: None,
        data: endpoint(2, 1, "Scan"),
        sequence: 1,
    });
    let before = first.store().snapshot();
    first.close().await;
    drop(driver);
    drop(first);

    let (second, _, _) = start(Arc::new(
        SqlitePersistence::open_in(dir.path(), &local).unwrap(),
    ));
    let after = second.store().snapshot();

    let remote = |snapshot: &hdds_discovery_engine::StoreSnapshot| {
        snapshot
            .participants()
            .filter(|p| !p.is_local())
            .map(|p| (p.data.clone(), p.sequence, p.status, p.endpoints.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(remote(&before), remote(&after));

    let endpoints = |snapshot: &hdds_discovery_engine::StoreSnapshot| {
        snapshot
            .endpoints()
            .map(|e| (e.data.clone(), e.owner, e.sequence))
            .collect::<Vec<_>>()
    };
    assert_eq!(endpoints(&before), endpoints(&after));
    assert_eq!(after.endpoints().count(), 2);
    second.close().await;
}

#[tokio::test]
async fn test_restart_keeps_retired_records_until_peers_settle() {
    let dir = tempfile::tempdir().unwrap();
    let local = prefix(LOCAL);

    let (first, _, _) = start(Arc::new(
        SqlitePersistence::open_in(dir.path(), &local).unwrap(),
    ));
    let driver = DiscoveryDriver::new(first.clone());
    driver.handle(announce(2, ParticipantRole::Server, 1));
    driver.handle(announce(1, ParticipantRole::Simple, 5));
    driver.handle(announce(3, ParticipantRole::Simple, 2));
    driver.handle(InboundMessage::ParticipantDisposed {
        change: None,
        guid_prefix: prefix(1),
        sequence: 6,
    });
    assert!(first.remove_remote_participant(&prefix(3), RemovalReason::Dropped));
    // P2 never acks before the restart
    first.close().await;
    drop(driver);
    drop(first);

    let (second, _, announcer) = start(Arc::new(
        SqlitePersistence::open_in(dir.path(), &local).unwrap(),
    ));
    assert_eq!(
        second.store().participant(&prefix(1)).unwrap().status,
        ParticipantStatus::Removed
    );
    assert_eq!(
        second.store().participant(&prefix(3)).unwrap().status,
        ParticipantStatus::Dropped
    );
    assert!(second.matrix().is_peer(&prefix(2)));

    let report = second.sync(tick());
    assert_eq!(report.trimmed, 0);
    assert!(second.store().participant(&prefix(1)).is_some());
    assert!(second.store().participant(&prefix(3)).is_some());
    let dispose = second
        .matrix()
        .latest(&Subject::Participant(prefix(1)))
        .unwrap();
    assert!(announcer.sent.lock().iter().any(|(peer, m)| {
        *peer == prefix(2)
            && matches!(
                m,
                OutboundMessage::ParticipantDisposed { guid_prefix, sequence: 6, .. }
                    if *guid_prefix == prefix(1)
            )
            && m.change() == Some(dispose)
    }));

    // P2 catches up on the disposal and on the current local announcement
    let local_change = second
        .matrix()
        .latest(&Subject::Participant(local))
        .unwrap();
    assert_eq!(second.acknowledge(&prefix(2), &[dispose, local_change]), 2);
    assert_eq!(second.sync(tick()).trimmed, 2);
    assert!(second.store().participant(&prefix(1)).is_none());
    assert!(second.store().participant(&prefix(3)).is_none());
    second.close().await;
}
