//! Shared setup for the multi-device integration tests

#![allow(dead_code)]

use partyline_core::{
    EntityId, Handle, InvitationConfiguration, InvitationId, ManagerConfig, NetworkConfiguration,
    PropertyUpdate,
};
use partyline_harness::{ChangeRecord, Cluster};
use partyline_runtime::{Endpoint, LocalUser, Network, PartyManager};

pub const HOST: usize = 0;
pub const GUEST: usize = 1;
pub const MAX_ROUNDS: usize = 400;

pub fn entity(name: &str) -> EntityId {
    EntityId::new(name).unwrap()
}

/// Step until `device` publishes `kind`
pub fn wait_for(cluster: &mut Cluster, device: usize, kind: &str) -> ChangeRecord {
    cluster
        .run_until(MAX_ROUNDS, |r| r.device == device && r.kind == kind)
        .unwrap_or_else(|err| panic!("device {device} never published {kind}: {err}"))
}

/// Like [`wait_for`], but also accepts a record already published at or
/// after history index `since`
pub fn wait_since(cluster: &mut Cluster, since: usize, device: usize, kind: &str) -> ChangeRecord {
    let seen = cluster.history()[since.min(cluster.history().len())..]
        .iter()
        .find(|r| r.device == device && r.kind == kind)
        .cloned();
    match seen {
        Some(record) => record,
        None => wait_for(cluster, device, kind),
    }
}

/// Two devices with one authenticated user each in the host's network
pub struct Party {
    pub cluster: Cluster,
    pub invitation: InvitationId,
    pub host_user: Handle<LocalUser>,
    pub guest_user: Handle<LocalUser>,
    pub host_net: Handle<Network>,
    pub guest_net: Handle<Network>,
}

impl Party {
    pub fn host(&self) -> &PartyManager {
        self.cluster.manager(HOST).unwrap()
    }

    pub fn guest(&self) -> &PartyManager {
        self.cluster.manager(GUEST).unwrap()
    }

    pub fn manager(&self, device: usize) -> &PartyManager {
        self.cluster.manager(device).unwrap()
    }

    /// Add another device and authenticate `name` on it
    pub fn join(&mut self, device_name: &str, name: &str) -> (usize, Handle<LocalUser>, Handle<Network>) {
        let device = self.cluster.add_device(device_name).unwrap();
        let descriptor = self.host().network_descriptor(self.host_net).unwrap();
        let manager = self.manager(device);
        let user = manager.create_local_user(entity(name), "token").unwrap();
        let network = manager.connect_to_network(&descriptor).unwrap();
        wait_for(&mut self.cluster, device, "ConnectToNetworkCompleted");
        self.manager(device)
            .authenticate_local_user(network, user, self.invitation.clone())
            .unwrap();
        let record = wait_for(&mut self.cluster, device, "AuthenticateLocalUserCompleted");
        assert!(record.succeeded(), "{name} failed to authenticate: {record:?}");
        (device, user, network)
    }

    /// Create one endpoint per side and wait until each side sees both
    pub fn endpoints(&mut self) -> Endpoints {
        let host_local = self
            .host()
            .create_endpoint(self.host_net, Some(self.host_user), vec![PropertyUpdate::set("role", "host")])
            .unwrap();
        let guest_local = self
            .guest()
            .create_endpoint(self.guest_net, Some(self.guest_user), vec![PropertyUpdate::set("role", "guest")])
            .unwrap();
        for _ in 0..MAX_ROUNDS {
            self.cluster.settle(1).unwrap();
            if self.host().network_endpoints(self.host_net).unwrap().len() == 2
                && self.guest().network_endpoints(self.guest_net).unwrap().len() == 2
            {
                break;
            }
        }
        let host_remote = remote_endpoint(self.host(), self.host_net);
        let guest_remote = remote_endpoint(self.guest(), self.guest_net);
        Endpoints {
            host_local,
            guest_local,
            host_remote,
            guest_remote,
        }
    }
}

/// `host_remote` is the guest's endpoint as the host sees it, and the
/// other way round
pub struct Endpoints {
    pub host_local: Handle<Endpoint>,
    pub guest_local: Handle<Endpoint>,
    pub host_remote: Handle<Endpoint>,
    pub guest_remote: Handle<Endpoint>,
}

pub fn remote_endpoint(manager: &PartyManager, network: Handle<Network>) -> Handle<Endpoint> {
    manager
        .network_endpoints(network)
        .unwrap()
        .into_iter()
        .find(|ep| !manager.endpoint_is_local(*ep).unwrap())
        .expect("no remote endpoint visible")
}

pub fn open_invitation(id: &str) -> InvitationConfiguration {
    InvitationConfiguration {
        identifier: Some(InvitationId::new(id).unwrap()),
        ..Default::default()
    }
}

/// Host creates and authenticates into a network; nothing else joins
pub fn hosted(config: ManagerConfig, network: NetworkConfiguration) -> (Cluster, Handle<LocalUser>, Handle<Network>, InvitationId) {
    let mut cluster = Cluster::new(config);
    cluster.add_device("host").unwrap();
    let host = cluster.manager(HOST).unwrap();
    let user = host.create_local_user(entity("host-player"), "token").unwrap();
    let (descriptor, invitation) = host
        .create_new_network(user, network, Vec::new(), &open_invitation("lobby"))
        .unwrap();
    let net = host.connect_to_network(&descriptor).unwrap();
    wait_for(&mut cluster, HOST, "ConnectToNetworkCompleted");
    cluster
        .manager(HOST)
        .unwrap()
        .authenticate_local_user(net, user, invitation.clone())
        .unwrap();
    let record = wait_for(&mut cluster, HOST, "AuthenticateLocalUserCompleted");
    assert!(record.succeeded());
    cluster.settle(2).unwrap();
    (cluster, user, net, invitation)
}

/// Host plus one guest, both authenticated
pub fn party_with(config: ManagerConfig, network: NetworkConfiguration) -> Party {
    let (cluster, host_user, host_net, invitation) = hosted(config, network);
    let mut party = Party {
        cluster,
        invitation,
        host_user,
        guest_user: host_user,
        host_net,
        guest_net: host_net,
    };
    let (_, guest_user, guest_net) = party.join("guest", "guest-player");
    party.guest_user = guest_user;
    party.guest_net = guest_net;
    party.cluster.settle(3).unwrap();
    party
}

pub fn party() -> Party {
    party_with(ManagerConfig::testing(), NetworkConfiguration::default())
}
