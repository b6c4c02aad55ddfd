//! Integration Tests for Endpoints and Message Delivery
//!
//! Exercises the send pipeline end to end through the simulated relay:
//! guaranteed delivery under packet loss, fragmentation, broadcast, the
//! cooperative endpoint destroy and the escalation when a device stops
//! acknowledging.

mod common;

use common::*;
use partyline_core::{
    ManagerConfig, NetworkConfiguration, QueuingConfiguration, SendMessageOptions, StateChangeResult,
    TimeSource,
};
use partyline_harness::{process_changes, pump, DEFAULT_STEP};
use partyline_runtime::{
    Endpoint, EndpointDestroyedReason, Handle, NetworkDestroyedReason, PartyStateChange, StateChangeKind,
};

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

/// One received message as the guest saw it
#[derive(Debug)]
struct Received {
    device: usize,
    data: Vec<u8>,
    guaranteed: bool,
    sequential: bool,
    fragmented: bool,
}

fn collect_messages(party: &mut Party, expected: usize) -> Vec<Received> {
    let mut received = Vec::new();
    for _ in 0..MAX_ROUNDS {
        party
            .cluster
            .step_with(DEFAULT_STEP, |device, change| {
                if let StateChangeKind::EndpointMessageReceived { flags, data, .. } = change {
                    received.push(Received {
                        device,
                        data: data.clone(),
                        guaranteed: flags.guaranteed,
                        sequential: flags.sequential,
                        fragmented: flags.required_fragmentation,
                    });
                }
            })
            .unwrap();
        if received.len() >= expected {
            break;
        }
    }
    received
}

fn payload(index: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| index.wrapping_add(i as u8)).collect()
}

// ----------------------------------------------------------------------------
// Delivery
// ----------------------------------------------------------------------------

#[test]
fn test_guaranteed_sequential_messages_survive_loss_in_order() {
    let mut party = party();
    let endpoints = party.endpoints();
    party.cluster.relay.drop_every_nth_packet(Some(9));

    let messages: Vec<_> = (0..5u8).map(|i| payload(i * 10, 600)).collect();
    for message in &messages {
        party
            .host()
            .send_message(
                endpoints.host_local,
                &[endpoints.host_remote],
                SendMessageOptions::reliable_ordered(),
                QueuingConfiguration::default(),
                &[message.as_slice()],
            )
            .unwrap();
    }

    let received = collect_messages(&mut party, messages.len());
    assert_eq!(received.len(), messages.len());
    for (got, sent) in received.iter().zip(&messages) {
        assert_eq!(got.device, GUEST);
        assert_eq!(&got.data, sent);
        assert!(got.guaranteed && got.sequential && got.fragmented);
    }
    assert!(party.cluster.relay.statistics().packets_dropped > 0);

    let stats = party.host().network_statistics(party.host_net).unwrap();
    assert_eq!(stats.send.sent_messages, messages.len() as u64);
}

#[test]
fn test_small_best_effort_message_is_not_fragmented() {
    let mut party = party();
    let endpoints = party.endpoints();
    party
        .guest()
        .send_message(
            endpoints.guest_local,
            &[endpoints.guest_remote],
            SendMessageOptions::best_effort(),
            QueuingConfiguration::default(),
            &[b"ping ", b"pong"],
        )
        .unwrap();

    let received = collect_messages(&mut party, 1);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].device, HOST);
    assert_eq!(received[0].data, b"ping pong".to_vec());
    assert!(!received[0].guaranteed && !received[0].fragmented);
}

#[test]
fn test_broadcast_reaches_every_other_endpoint_and_counts_once() {
    let mut party = party();
    let endpoints = party.endpoints();
    let (third, third_user, third_net) = party.join("third", "third-player");
    party
        .manager(third)
        .create_endpoint(third_net, Some(third_user), Vec::new())
        .unwrap();
    for _ in 0..MAX_ROUNDS {
        party.cluster.settle(1).unwrap();
        if party.host().network_endpoints(party.host_net).unwrap().len() == 3
            && party.manager(third).network_endpoints(third_net).unwrap().len() == 3
        {
            break;
        }
    }

    party
        .host()
        .send_message(
            endpoints.host_local,
            &[],
            SendMessageOptions::reliable_ordered(),
            QueuingConfiguration::default(),
            &[b"round starts"],
        )
        .unwrap();

    let received = collect_messages(&mut party, 2);
    let mut devices: Vec<_> = received.iter().map(|r| r.device).collect();
    devices.sort_unstable();
    assert_eq!(devices, vec![GUEST, third]);

    let stats = party.host().endpoint_statistics(endpoints.host_local, &[]).unwrap();
    assert_eq!(stats.sent_messages, 1);
}

#[test]
fn test_unacknowledged_guaranteed_traffic_destroys_the_network() {
    let mut party = party();
    let endpoints = party.endpoints();
    let guest_id = party.cluster.device(GUEST).unwrap().device_id();
    party.cluster.relay.isolate(guest_id);

    party
        .host()
        .send_message(
            endpoints.host_local,
            &[endpoints.host_remote],
            SendMessageOptions::reliable_ordered(),
            QueuingConfiguration::default(),
            &[b"are you there"],
        )
        .unwrap();

    let mut reasons = [None, None];
    for _ in 0..MAX_ROUNDS {
        party
            .cluster
            .step_with(DEFAULT_STEP, |device, change| {
                if let StateChangeKind::NetworkDestroyed { reason, .. } = change {
                    reasons[device] = Some(*reason);
                }
            })
            .unwrap();
        if reasons.iter().all(Option::is_some) {
            break;
        }
    }
    assert_eq!(reasons[HOST], Some(NetworkDestroyedReason::DestinationFailure));
    assert!(party.cluster.relay.requests_seen("ReportUnresponsive") >= 1);

    // the relay dropped the silent device as well
    assert_eq!(reasons[GUEST], Some(NetworkDestroyedReason::DestinationFailure));
    assert!(party.guest().networks().unwrap().is_empty());
}

// ----------------------------------------------------------------------------
// Endpoint Lifecycle
// ----------------------------------------------------------------------------

#[test]
fn test_endpoint_ids_are_never_reused() {
    let mut party = party();
    let endpoints = party.endpoints();
    let first = party.host().endpoint_unique_id(endpoints.host_local).unwrap();

    party.host().destroy_endpoint(endpoints.host_local).unwrap();
    wait_for(&mut party.cluster, HOST, "DestroyEndpointCompleted");

    let replacement = party
        .host()
        .create_endpoint(party.host_net, Some(party.host_user), Vec::new())
        .unwrap();
    let created = wait_for(&mut party.cluster, HOST, "CreateEndpointCompleted");
    assert!(created.succeeded());
    let second = party.host().endpoint_unique_id(replacement).unwrap();
    assert_ne!(first, second);
    assert!(second.value() > first.value());
}

#[test]
fn test_sends_queued_before_creation_wait_for_the_endpoint() {
    let mut party = party();
    let endpoints = party.endpoints();
    let early = party.host().create_endpoint(party.host_net, None, Vec::new()).unwrap();
    party
        .host()
        .send_message(
            early,
            &[endpoints.host_remote],
            SendMessageOptions::reliable_ordered(),
            QueuingConfiguration::default(),
            &[b"queued early"],
        )
        .unwrap();
    assert!(party.host().endpoint_unique_id(early).is_err());

    let mut created_at = None;
    let mut received_at = None;
    for round in 0..MAX_ROUNDS {
        party
            .cluster
            .step_with(DEFAULT_STEP, |device, change| match (device, change) {
                (HOST, StateChangeKind::CreateEndpointCompleted { endpoint, .. }) if *endpoint == early => {
                    created_at.get_or_insert(round);
                }
                (GUEST, StateChangeKind::EndpointMessageReceived { data, .. }) if data == b"queued early" => {
                    received_at.get_or_insert(round);
                }
                _ => {}
            })
            .unwrap();
        if received_at.is_some() {
            break;
        }
    }
    let (created, received) = (created_at.unwrap(), received_at.unwrap());
    assert!(created <= received);
    assert!(party.host().endpoint_unique_id(early).is_ok());
}

#[test]
fn test_failed_creation_discards_queued_sends() {
    let mut party = party();
    let endpoints = party.endpoints();
    party
        .cluster
        .relay
        .fail_next("CreateEndpoint", StateChangeResult::PartyServiceError);

    let doomed = party.host().create_endpoint(party.host_net, None, Vec::new()).unwrap();
    party
        .host()
        .send_message(
            doomed,
            &[endpoints.host_remote],
            SendMessageOptions::best_effort(),
            QueuingConfiguration::default(),
            &[b"never sent"],
        )
        .unwrap();

    let mut reason = None;
    let mut result = None;
    let mut delivered = 0;
    for _ in 0..20 {
        party
            .cluster
            .step_with(DEFAULT_STEP, |device, change| match (device, change) {
                (HOST, StateChangeKind::CreateEndpointCompleted { outcome, .. }) => {
                    result = Some(outcome.result)
                }
                (HOST, StateChangeKind::EndpointDestroyed { reason: r, .. }) => reason = Some(*r),
                (GUEST, StateChangeKind::EndpointMessageReceived { .. }) => delivered += 1,
                _ => {}
            })
            .unwrap();
    }
    assert_eq!(result, Some(StateChangeResult::PartyServiceError));
    assert_eq!(reason, Some(EndpointDestroyedReason::CreationFailed));
    assert_eq!(delivered, 0);
}

#[test]
fn test_endpoint_limit_is_checked_synchronously() {
    let limits = NetworkConfiguration {
        max_endpoints_per_device: 1,
        ..Default::default()
    };
    let party = party_with(ManagerConfig::testing(), limits);
    party
        .host()
        .create_endpoint(party.host_net, Some(party.host_user), Vec::new())
        .unwrap();
    assert!(party
        .host()
        .create_endpoint(party.host_net, Some(party.host_user), Vec::new())
        .is_err());
}

// ----------------------------------------------------------------------------
// Cooperative Destroy
// ----------------------------------------------------------------------------

/// Drive both devices by hand: the host processes normally, the guest
/// holds back every `EndpointDestroyed` it is shown
struct HeldDestroy {
    held: Vec<PartyStateChange>,
    completed_after_ms: Option<u64>,
}

fn destroy_while_guest_holds(
    party: &mut Party,
    endpoint: Handle<Endpoint>,
    rounds: usize,
    advance: bool,
) -> HeldDestroy {
    let start = party.cluster.clock.now().as_millis();
    party.host().destroy_endpoint(endpoint).unwrap();
    let mut state = HeldDestroy {
        held: Vec::new(),
        completed_after_ms: None,
    };
    for _ in 0..rounds {
        let host = party.host();
        pump(host).unwrap();
        let mut completed = false;
        process_changes(host, |change| {
            if matches!(change, StateChangeKind::DestroyEndpointCompleted { .. }) {
                completed = true;
            }
        })
        .unwrap();

        let guest = party.guest();
        pump(guest).unwrap();
        let (held, rest): (Vec<_>, Vec<_>) = guest
            .start_processing_state_changes()
            .unwrap()
            .into_iter()
            .partition(|change| matches!(change.payload(), StateChangeKind::EndpointDestroyed { .. }));
        guest.finish_processing_state_changes(rest).unwrap();
        state.held.extend(held);

        if completed {
            state.completed_after_ms = Some(party.cluster.clock.now().as_millis() - start);
            break;
        }
        if advance {
            party.cluster.clock.advance(DEFAULT_STEP);
        }
    }
    state
}

#[test]
fn test_destroy_completes_only_after_remote_acknowledgment() {
    let mut party = party();
    let endpoints = party.endpoints();
    let network_id = party.host().network_descriptor(party.host_net).unwrap().network_id();
    let unique_id = party.guest().endpoint_unique_id(endpoints.guest_remote).unwrap();

    let state = destroy_while_guest_holds(&mut party, endpoints.host_local, 10, false);
    assert_eq!(state.completed_after_ms, None);
    assert_eq!(state.held.len(), 1);
    assert_eq!(party.cluster.relay.pending_destroys(network_id), 1);

    // the remote handle stays readable while the change is held
    assert_eq!(
        party.guest().endpoint_entity(endpoints.guest_remote).unwrap(),
        Some(entity("host-player"))
    );
    assert!(!party
        .guest()
        .network_endpoints(party.guest_net)
        .unwrap()
        .contains(&endpoints.guest_remote));
    assert_eq!(
        party.guest().find_endpoint_by_unique_id(party.guest_net, unique_id).unwrap(),
        endpoints.guest_remote
    );
    party.guest().finish_processing_state_changes(state.held).unwrap();
    assert!(party.guest().endpoint_entity(endpoints.guest_remote).is_err());
    assert!(party
        .guest()
        .find_endpoint_by_unique_id(party.guest_net, unique_id)
        .is_err());

    wait_for(&mut party.cluster, HOST, "DestroyEndpointCompleted");
}

#[test]
fn test_unfinished_remote_destroy_is_acknowledged_after_window() {
    let mut party = party();
    let endpoints = party.endpoints();
    let session = ManagerConfig::testing().session;

    let state = destroy_while_guest_holds(&mut party, endpoints.host_local, 200, true);
    let elapsed = state.completed_after_ms.expect("destroy never completed");
    assert!(elapsed >= session.endpoint_destroy_window_ms);
    assert!(elapsed < session.destroy_escalation().as_millis() as u64);
    assert_eq!(state.held.len(), 1);
    party.guest().finish_processing_state_changes(state.held).unwrap();
}

#[test]
fn test_destroy_escalates_when_a_device_goes_silent() {
    let mut party = party();
    let endpoints = party.endpoints();
    let session = ManagerConfig::testing().session;
    let guest_id = party.cluster.device(GUEST).unwrap().device_id();
    party.cluster.relay.pause(guest_id);

    let start = party.cluster.clock.now().as_millis();
    party.host().destroy_endpoint(endpoints.host_local).unwrap();
    let record = wait_for(&mut party.cluster, HOST, "DestroyEndpointCompleted");
    assert!(record.succeeded());
    let elapsed = party.cluster.clock.now().as_millis() - start;
    assert!(elapsed >= session.destroy_escalation().as_millis() as u64);
    assert!(party.host().endpoint_is_local(endpoints.host_local).is_err());
}
