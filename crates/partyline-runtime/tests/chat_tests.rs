//! Integration Tests for Chat Controls
//!
//! Text only reaches a chat control that granted the sender `receive_text`
//! and has not muted it.

mod common;

use common::*;
use partyline_core::config::MAX_CHAT_TEXT_LEN;
use partyline_harness::DEFAULT_STEP;
use partyline_runtime::{ChatControl, ChatPermissions, Handle, Network, PartyManager, StateChangeKind};

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

struct Chat {
    party: Party,
    host_local: Handle<ChatControl>,
    guest_local: Handle<ChatControl>,
    /// The guest's control as the host sees it
    host_remote: Handle<ChatControl>,
    /// The host's control as the guest sees it
    guest_remote: Handle<ChatControl>,
}

fn remote_control(manager: &PartyManager, network: Handle<Network>) -> Handle<ChatControl> {
    manager
        .network_chat_controls(network)
        .unwrap()
        .into_iter()
        .find(|cc| !manager.chat_control_is_local(*cc).unwrap())
        .expect("no remote chat control visible")
}

fn chat() -> Chat {
    let mut party = party();
    let host_local = party.host().create_chat_control(party.host_user, Some("en-US".into())).unwrap();
    let guest_local = party.guest().create_chat_control(party.guest_user, None).unwrap();
    party.host().connect_chat_control(host_local, party.host_net).unwrap();
    party.guest().connect_chat_control(guest_local, party.guest_net).unwrap();

    for _ in 0..MAX_ROUNDS {
        party.cluster.settle(1).unwrap();
        if party.host().network_chat_controls(party.host_net).unwrap().len() == 2
            && party.guest().network_chat_controls(party.guest_net).unwrap().len() == 2
        {
            break;
        }
    }
    let host_remote = remote_control(party.host(), party.host_net);
    let guest_remote = remote_control(party.guest(), party.guest_net);
    Chat {
        party,
        host_local,
        guest_local,
        host_remote,
        guest_remote,
    }
}

/// Step `rounds` times and return every text the guest received
fn guest_texts(chat: &mut Chat, rounds: usize) -> Vec<(Handle<ChatControl>, Vec<Handle<ChatControl>>, String)> {
    let mut texts = Vec::new();
    for _ in 0..rounds {
        chat.party
            .cluster
            .step_with(DEFAULT_STEP, |device, change| {
                if let (GUEST, StateChangeKind::ChatTextReceived { sender, receivers, text }) = (device, change) {
                    texts.push((*sender, receivers.clone(), text.clone()));
                }
            })
            .unwrap();
    }
    texts
}

// ----------------------------------------------------------------------------
// Delivery Rules
// ----------------------------------------------------------------------------

#[test]
fn test_text_needs_receive_permission() {
    let mut chat = chat();
    assert_eq!(
        chat.party.guest().chat_permissions(chat.guest_local, chat.guest_remote).unwrap(),
        ChatPermissions::none()
    );

    chat.party.host().send_text(chat.host_local, &[chat.host_remote], "anyone there?").unwrap();
    assert!(guest_texts(&mut chat, 30).is_empty());

    let text_only = ChatPermissions {
        receive_text: true,
        ..ChatPermissions::none()
    };
    chat.party
        .guest()
        .set_chat_permissions(chat.guest_local, chat.guest_remote, text_only)
        .unwrap();
    chat.party.host().send_text(chat.host_local, &[chat.host_remote], "glhf").unwrap();

    let texts = guest_texts(&mut chat, 30);
    assert_eq!(texts.len(), 1);
    let (sender, receivers, text) = &texts[0];
    assert_eq!(*sender, chat.guest_remote);
    assert_eq!(receivers, &vec![chat.guest_local]);
    assert_eq!(text, "glhf");
}

#[test]
fn test_muted_sender_is_not_heard() {
    let mut chat = chat();
    let guest = chat.party.guest();
    guest
        .set_chat_permissions(chat.guest_local, chat.guest_remote, ChatPermissions::all())
        .unwrap();
    guest.set_incoming_text_muted(chat.guest_local, chat.guest_remote, true).unwrap();
    assert!(guest.is_incoming_text_muted(chat.guest_local, chat.guest_remote).unwrap());

    chat.party.host().send_text(chat.host_local, &[chat.host_remote], "muted").unwrap();
    assert!(guest_texts(&mut chat, 30).is_empty());

    chat.party
        .guest()
        .set_incoming_text_muted(chat.guest_local, chat.guest_remote, false)
        .unwrap();
    chat.party.host().send_text(chat.host_local, &[chat.host_remote], "heard").unwrap();
    let texts = guest_texts(&mut chat, 30);
    assert_eq!(texts.len(), 1);
    assert_eq!(texts[0].2, "heard");
}

// ----------------------------------------------------------------------------
// Argument Checks
// ----------------------------------------------------------------------------

#[test]
fn test_send_text_rejects_bad_arguments() {
    let chat = chat();
    let host = chat.party.host();
    assert!(host.send_text(chat.host_local, &[], "no targets").is_err());
    assert!(host.send_text(chat.host_local, &[chat.host_remote], "").is_err());
    assert!(host.send_text(chat.host_local, &[chat.host_local], "to myself").is_err());
    let long = "x".repeat(MAX_CHAT_TEXT_LEN + 1);
    assert!(host.send_text(chat.host_local, &[chat.host_remote], &long).is_err());
    // remote controls cannot send
    assert!(host.send_text(chat.host_remote, &[chat.host_local], "spoofed").is_err());
}

#[test]
fn test_one_chat_control_per_user() {
    let chat = chat();
    assert!(chat.party.host().create_chat_control(chat.party.host_user, None).is_err());
    assert!(chat
        .party
        .host()
        .set_chat_permissions(chat.host_local, chat.host_local, ChatPermissions::all())
        .is_err());
    assert_eq!(
        chat.party.host().chat_control_language(chat.host_local).unwrap(),
        Some("en-US".to_string())
    );
    assert_eq!(
        chat.party.host().chat_control_entity(chat.host_remote).unwrap(),
        entity("guest-player")
    );
}

// ----------------------------------------------------------------------------
// Leaving
// ----------------------------------------------------------------------------

#[test]
fn test_disconnected_chat_control_leaves_every_view() {
    let mut chat = chat();
    let start = chat.party.cluster.history().len();
    chat.party
        .guest()
        .disconnect_chat_control(chat.guest_local, chat.party.guest_net)
        .unwrap();

    let done = wait_since(&mut chat.party.cluster, start, GUEST, "DisconnectChatControlCompleted");
    assert!(done.succeeded());
    wait_since(&mut chat.party.cluster, start, HOST, "ChatControlLeftNetwork");
    chat.party.cluster.settle(2).unwrap();

    assert_eq!(
        chat.party.host().network_chat_controls(chat.party.host_net).unwrap(),
        vec![chat.host_local]
    );
    assert!(chat
        .party
        .guest()
        .chat_control_networks(chat.guest_local)
        .unwrap()
        .is_empty());
}
