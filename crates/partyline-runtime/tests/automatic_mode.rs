//! Integration Tests for Automatic Work Mode
//!
//! Both managers run their own worker threads against real time; the test
//! only publishes and returns state changes.

use std::time::Duration;

use partyline_core::{
    DeviceId, ManagerConfig, NetworkConfiguration, QueuingConfiguration, SendMessageOptions,
    StateChangePayload,
};
use partyline_harness::SimulatedRelay;
use partyline_runtime::{
    EntityId, InvitationConfiguration, InvitationId, PartyManager, StateChangeKind, ThreadId, WorkMode,
};
use tokio::time::{sleep, timeout};
use tokio_test::assert_ok;

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

const DEADLINE: Duration = Duration::from_secs(10);

fn automatic_manager(relay: &SimulatedRelay) -> PartyManager {
    let device_id = DeviceId::random();
    let mut manager = PartyManager::builder(relay.link(device_id))
        .with_config(ManagerConfig::testing())
        .with_device_id(device_id)
        .build()
        .unwrap();
    manager.initialize().unwrap();
    manager
}

/// Drain state changes until `pick` returns something
async fn until<T>(manager: &PartyManager, mut pick: impl FnMut(&StateChangeKind) -> Option<T>) -> T {
    let search = async {
        loop {
            let changes = manager.start_processing_state_changes().unwrap();
            let mut found = None;
            for change in &changes {
                if found.is_none() {
                    found = pick(change.payload());
                }
            }
            manager.finish_processing_state_changes(changes).unwrap();
            if let Some(value) = found {
                return value;
            }
            sleep(Duration::from_millis(5)).await;
        }
    };
    timeout(DEADLINE, search).await.expect("state change never arrived")
}

async fn completed(manager: &PartyManager, kind: &'static str) -> bool {
    until(manager, |change| {
        (change.kind_name() == kind).then(|| change.outcome().map_or(true, |o| o.is_success()))
    })
    .await
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_workers_drive_a_session_without_do_work() {
    let relay = SimulatedRelay::new();
    let mut host = automatic_manager(&relay);
    let mut guest = automatic_manager(&relay);

    let host_user = host.create_local_user(EntityId::new("host-player").unwrap(), "token").unwrap();
    let invitation = InvitationConfiguration {
        identifier: Some(InvitationId::new("lobby").unwrap()),
        ..Default::default()
    };
    let (descriptor, invitation_id) = host
        .create_new_network(host_user, NetworkConfiguration::default(), Vec::new(), &invitation)
        .unwrap();
    let host_net = host.connect_to_network(&descriptor).unwrap();
    assert!(completed(&host, "ConnectToNetworkCompleted").await);
    host.authenticate_local_user(host_net, host_user, invitation_id.clone())
        .unwrap();
    assert!(completed(&host, "AuthenticateLocalUserCompleted").await);

    let descriptor = host.network_descriptor(host_net).unwrap();
    let guest_user = guest.create_local_user(EntityId::new("guest-player").unwrap(), "token").unwrap();
    let guest_net = guest.connect_to_network(&descriptor).unwrap();
    assert!(completed(&guest, "ConnectToNetworkCompleted").await);
    guest.authenticate_local_user(guest_net, guest_user, invitation_id).unwrap();
    assert!(completed(&guest, "AuthenticateLocalUserCompleted").await);

    let endpoint = host.create_endpoint(host_net, Some(host_user), Vec::new()).unwrap();
    guest.create_endpoint(guest_net, Some(guest_user), Vec::new()).unwrap();
    until(&host, |change| match change {
        StateChangeKind::EndpointCreated { endpoint, .. } => {
            (!host.endpoint_is_local(*endpoint).unwrap_or(true)).then_some(())
        }
        _ => None,
    })
    .await;
    host.send_message(
        endpoint,
        &[],
        SendMessageOptions::reliable_ordered(),
        QueuingConfiguration::default(),
        &[b"hello from a worker"],
    )
    .unwrap();

    let data = until(&guest, |change| match change {
        StateChangeKind::EndpointMessageReceived { data, .. } => Some(data.clone()),
        _ => None,
    })
    .await;
    assert_eq!(data, b"hello from a worker".to_vec());

    assert_ok!(guest.cleanup());
    assert_ok!(host.cleanup());
}

#[tokio::test]
async fn test_mixed_work_modes() {
    let relay = SimulatedRelay::new();
    let device_id = DeviceId::random();
    let mut manager = PartyManager::builder(relay.link(device_id))
        .with_config(ManagerConfig::testing())
        .with_device_id(device_id)
        .with_work_mode(ThreadId::Networking, WorkMode::Manual)
        .build()
        .unwrap();
    manager.initialize().unwrap();

    assert_eq!(manager.work_mode(ThreadId::Audio), WorkMode::Automatic);
    assert_ok!(manager.do_work(ThreadId::Networking));
    assert!(manager.do_work(ThreadId::Audio).is_err());
    assert!(manager.set_work_mode(ThreadId::Audio, WorkMode::Manual).is_err());
    assert_ok!(manager.cleanup());
}
