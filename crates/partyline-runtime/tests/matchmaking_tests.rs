//! Integration Tests for Matchmaking
//!
//! Drives `MatchmakingManager`s against the simulated matchmaker, then
//! carries the match result into a party network.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use partyline_core::{ManagerConfig, MatchmakingConfig, NetworkConfiguration, Outcome, StateChangeResult};
use partyline_harness::{ManualClock, QueueRules, SimulatedMatchmaker};
use partyline_runtime::{
    Handle, MatchmakingChangeKind, MatchmakingManager, ServiceTicketStatus, Ticket, TicketConfiguration,
    TicketStatus,
};

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

fn manager(service: &SimulatedMatchmaker, clock: &Arc<ManualClock>) -> MatchmakingManager {
    MatchmakingManager::new(service.client(), MatchmakingConfig::default()).with_time_source(clock.clone())
}

fn queue(name: &str) -> TicketConfiguration {
    TicketConfiguration {
        queue_name: name.to_string(),
        timeout_secs: Some(30),
        ..Default::default()
    }
}

/// Work every manager until all `tickets` are terminal; returns the change
/// kinds each manager published, in order
fn drive(
    managers: &[&MatchmakingManager],
    tickets: &[Handle<Ticket>],
    clock: &ManualClock,
) -> Vec<Vec<MatchmakingChangeKind>> {
    let mut seen = vec![Vec::new(); managers.len()];
    for _ in 0..MAX_ROUNDS {
        for (index, manager) in managers.iter().enumerate() {
            manager.do_work();
            let changes = manager.start_processing();
            seen[index].extend(changes.iter().map(|change| change.payload().clone()));
            manager.finish_processing(changes).unwrap();
        }
        let done = managers
            .iter()
            .zip(tickets)
            .all(|(manager, ticket)| manager.ticket_status(*ticket).unwrap().is_terminal());
        if done {
            break;
        }
        clock.advance(Duration::from_millis(100));
    }
    seen
}

// ----------------------------------------------------------------------------
// Matching
// ----------------------------------------------------------------------------

#[test]
fn test_matched_players_meet_in_the_announced_network() {
    let (mut cluster, _host_user, host_net, invitation) =
        hosted(ManagerConfig::testing(), NetworkConfiguration::default());
    let descriptor = cluster.manager(HOST).unwrap().network_descriptor(host_net).unwrap();

    let service = SimulatedMatchmaker::new();
    service.set_queue_rules(
        "duel",
        QueueRules {
            network: Some(descriptor.clone()),
            ..Default::default()
        },
    );
    let clock = Arc::new(ManualClock::new());
    let host_mm = manager(&service, &clock);
    let guest_mm = manager(&service, &clock);
    let host_ticket = host_mm.create_ticket(entity("host-player"), queue("duel")).unwrap();
    let guest_ticket = guest_mm.create_ticket(entity("guest-player"), queue("duel")).unwrap();

    let seen = drive(&[&host_mm, &guest_mm], &[host_ticket, guest_ticket], &clock);
    assert_eq!(host_mm.ticket_status(host_ticket).unwrap(), TicketStatus::Matched);
    assert_eq!(guest_mm.ticket_status(guest_ticket).unwrap(), TicketStatus::Matched);
    assert_eq!(service.matches_formed(), 1);
    assert!(matches!(
        seen[1].last(),
        Some(MatchmakingChangeKind::TicketCompleted { outcome, .. }) if *outcome == Outcome::success()
    ));

    let details = guest_mm.match_details(guest_ticket).unwrap();
    assert_eq!(details, host_mm.match_details(host_ticket).unwrap());
    assert_eq!(details.members.len(), 2);
    let announced = details.network_descriptor.expect("queue announces a network");
    assert_eq!(announced, descriptor);

    let guest = cluster.add_device("guest").unwrap();
    let manager = cluster.manager(guest).unwrap();
    let user = manager.create_local_user(entity("guest-player"), "token").unwrap();
    let net = manager.connect_to_network(&announced).unwrap();
    wait_for(&mut cluster, guest, "ConnectToNetworkCompleted");
    cluster
        .manager(guest)
        .unwrap()
        .authenticate_local_user(net, user, invitation)
        .unwrap();
    assert!(wait_for(&mut cluster, guest, "AuthenticateLocalUserCompleted").succeeded());
}

#[test]
fn test_named_member_joins_by_ticket_id() {
    let service = SimulatedMatchmaker::new();
    let clock = Arc::new(ManualClock::new());
    let alice = manager(&service, &clock);
    let bob = manager(&service, &clock);

    let config = TicketConfiguration {
        members_to_match_with: vec![entity("bob")],
        ..queue("duo")
    };
    let alice_ticket = alice.create_ticket(entity("alice"), config).unwrap();
    for _ in 0..10 {
        alice.do_work();
        if alice.ticket_status(alice_ticket).unwrap() == TicketStatus::WaitingForPlayers {
            break;
        }
    }
    assert_eq!(alice.ticket_status(alice_ticket).unwrap(), TicketStatus::WaitingForPlayers);
    let ticket_id = alice.ticket_id(alice_ticket).unwrap().expect("accepted ticket has an id");

    let bob_ticket = bob.join_ticket(entity("bob"), &ticket_id, queue("duo")).unwrap();
    assert_eq!(bob.ticket_status(bob_ticket).unwrap(), TicketStatus::Joining);
    drive(&[&alice, &bob], &[alice_ticket, bob_ticket], &clock);

    assert_eq!(alice.ticket_status(alice_ticket).unwrap(), TicketStatus::Matched);
    assert_eq!(bob.ticket_status(bob_ticket).unwrap(), TicketStatus::Matched);
    let members: Vec<_> = alice
        .match_details(alice_ticket)
        .unwrap()
        .members
        .into_iter()
        .map(|member| member.entity)
        .collect();
    assert!(members.contains(&entity("alice")) && members.contains(&entity("bob")));
}

// ----------------------------------------------------------------------------
// Failures
// ----------------------------------------------------------------------------

#[test]
fn test_rejected_creation_fails_the_ticket() {
    let service = SimulatedMatchmaker::new();
    service.fail_next("CreateTicket", StateChangeResult::PartyServiceError);
    let clock = Arc::new(ManualClock::new());
    let mm = manager(&service, &clock);
    let ticket = mm.create_ticket(entity("alice"), queue("duel")).unwrap();

    drive(&[&mm], &[ticket], &clock);
    assert_eq!(mm.ticket_status(ticket).unwrap(), TicketStatus::Failed);
    assert_eq!(
        mm.ticket_outcome(ticket).unwrap().map(|outcome| outcome.result),
        Some(StateChangeResult::PartyServiceError)
    );
    assert!(mm.match_details(ticket).is_err());
}

#[test]
fn test_lonely_ticket_times_out_and_is_canceled_remotely() {
    let service = SimulatedMatchmaker::new();
    let clock = Arc::new(ManualClock::new());
    let mm = manager(&service, &clock);
    let config = TicketConfiguration {
        timeout_secs: Some(1),
        ..queue("duel")
    };
    let ticket = mm.create_ticket(entity("alice"), config).unwrap();

    drive(&[&mm], &[ticket], &clock);
    assert_eq!(mm.ticket_status(ticket).unwrap(), TicketStatus::Failed);
    assert_eq!(
        mm.ticket_outcome(ticket).unwrap().map(|outcome| outcome.result),
        Some(StateChangeResult::MatchmakingTimeout)
    );
    let ticket_id = mm.ticket_id(ticket).unwrap().expect("ticket was accepted");
    assert_eq!(service.ticket_status(&ticket_id), Some(ServiceTicketStatus::Canceled));
}

#[test]
fn test_destroyed_ticket_disappears_and_frees_the_queue() {
    let service = SimulatedMatchmaker::new();
    let clock = Arc::new(ManualClock::new());
    let mm = manager(&service, &clock);
    let ticket = mm.create_ticket(entity("alice"), queue("duel")).unwrap();
    assert!(mm.create_ticket(entity("alice"), queue("duel")).is_err());

    mm.destroy_ticket(ticket).unwrap();
    assert!(mm.tickets().is_empty());
    assert!(mm.ticket_status(ticket).is_err());
    let again = mm.create_ticket(entity("alice"), queue("duel")).unwrap();
    assert_ne!(again, ticket);
}
