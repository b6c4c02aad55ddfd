//! Visibility effects applied at the publish point, and release of finished
//! state changes

use partyline_core::state_change::PendingRelease;
use tracing::{trace, warn};

use super::EngineState;
use crate::changes::{ReleaseAction, StateChangeKind};
use crate::network::NetworkState;
use crate::relay::RelayRequest;

impl EngineState {
    /// Make one published change visible to getters
    pub(crate) fn apply_published(&mut self, change: &StateChangeKind) {
        use StateChangeKind::*;
        let local_device = self.local_device;
        let tables = &mut self.tables;

        match change {
            ConnectToNetworkCompleted { outcome, network } if outcome.is_success() => {
                if !self.view_networks.contains(network) {
                    self.view_networks.push(*network);
                }
            }
            NetworkConfigurationMadeAvailable {
                network,
                configuration,
            } => {
                if let Ok(net) = tables.networks.resolve_mut(*network) {
                    net.view.configuration = Some(configuration.clone());
                }
            }
            NetworkDescriptorChanged {
                network,
                descriptor,
            } => {
                if let Ok(net) = tables.networks.resolve_mut(*network) {
                    net.view.descriptor = descriptor.clone();
                }
            }
            AuthenticateLocalUserCompleted {
                outcome,
                network,
                local_user,
                ..
            } if outcome.is_success() => {
                if let Ok(net) = tables.networks.resolve_mut(*network) {
                    if !net.view.local_users.contains(local_user) {
                        net.view.local_users.push(*local_user);
                    }
                    if !net.view.devices.contains(&local_device) {
                        net.view.devices.push(local_device);
                    }
                }
            }
            LocalUserRemoved {
                network,
                local_user,
                ..
            } => {
                if let Ok(net) = tables.networks.resolve_mut(*network) {
                    net.view.local_users.retain(|u| u != local_user);
                    if net.view.local_users.is_empty() {
                        net.view.devices.retain(|d| *d != local_device);
                    }
                }
            }
            NetworkDestroyed { network, .. } => {
                if let Ok(net) = tables.networks.resolve_mut(*network) {
                    net.view.state = NetworkState::Destroyed;
                }
                self.view_networks.retain(|n| n != network);
            }
            NetworkPropertiesChanged { network, updates } => {
                if let Ok(net) = tables.networks.resolve_mut(*network) {
                    net.view.properties.apply(updates);
                }
            }
            RemoteDeviceJoinedNetwork { network, device } => {
                if let Ok(net) = tables.networks.resolve_mut(*network) {
                    if !net.view.devices.contains(device) {
                        net.view.devices.push(*device);
                    }
                }
            }
            RemoteDeviceLeftNetwork { network, device } => {
                if let Ok(net) = tables.networks.resolve_mut(*network) {
                    net.view.devices.retain(|d| d != device);
                }
            }
            DevicePropertiesChanged {
                device, updates, ..
            } => {
                if let Ok(dev) = tables.devices.resolve_mut(*device) {
                    dev.properties.apply(updates);
                }
            }
            EndpointCreated { network, endpoint } => {
                if let Ok(ep) = tables.endpoints.resolve_mut(*endpoint) {
                    ep.published_id = ep.id;
                }
                if let Ok(net) = tables.networks.resolve_mut(*network) {
                    if !net.view.endpoints.contains(endpoint) {
                        net.view.endpoints.push(*endpoint);
                    }
                }
            }
            EndpointDestroyed {
                network, endpoint, ..
            } => {
                if let Ok(net) = tables.networks.resolve_mut(*network) {
                    net.view.endpoints.retain(|e| e != endpoint);
                }
            }
            EndpointPropertiesChanged {
                endpoint, updates, ..
            } => {
                if let Ok(ep) = tables.endpoints.resolve_mut(*endpoint) {
                    ep.properties.apply(updates);
                }
            }
            InvitationCreated {
                network,
                invitation,
            } => {
                if let Ok(net) = tables.networks.resolve_mut(*network) {
                    if !net.view.invitations.contains(invitation) {
                        net.view.invitations.push(*invitation);
                    }
                }
            }
            InvitationDestroyed {
                network,
                invitation,
                ..
            } => {
                if let Ok(net) = tables.networks.resolve_mut(*network) {
                    net.view.invitations.retain(|i| i != invitation);
                }
            }
            ChatControlCreated { chat_control } => {
                if !self.view_chat_controls.contains(chat_control) {
                    self.view_chat_controls.push(*chat_control);
                }
            }
            ChatControlDestroyed { chat_control, .. } => {
                self.view_chat_controls.retain(|c| c != chat_control);
            }
            ChatControlJoinedNetwork {
                network,
                chat_control,
            } => {
                if let Ok(net) = tables.networks.resolve_mut(*network) {
                    if !net.view.chat_controls.contains(chat_control) {
                        net.view.chat_controls.push(*chat_control);
                    }
                }
            }
            ChatControlLeftNetwork {
                network,
                chat_control,
                ..
            } => {
                if let Ok(net) = tables.networks.resolve_mut(*network) {
                    net.view.chat_controls.retain(|c| c != chat_control);
                }
            }
            _ => {}
        }
    }

    /// Catch the published session state up with the live one
    pub(crate) fn sync_view_states(&mut self) {
        for network in &self.networks {
            if let Ok(net) = self.tables.networks.resolve_mut(*network) {
                net.view.state = net.state;
            }
        }
    }

    /// Drop the references of a finished change and run its actions
    pub(crate) fn release(&mut self, release: PendingRelease<ReleaseAction>) {
        for raw in release.handles {
            match self.tables.release(raw) {
                Ok(Some(retired)) => {
                    trace!(kind = raw.kind().name(), "entity retired");
                    self.on_retired(retired);
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "releasing a dead handle"),
            }
        }
        for action in release.actions {
            self.run_release_action(action);
        }
    }

    fn run_release_action(&mut self, action: ReleaseAction) {
        match action {
            ReleaseAction::AckEndpointDestroyed { network, endpoint } => {
                let Ok(net) = self.tables.networks.resolve_mut(network) else {
                    return;
                };
                let before = net.remote_destroys.len();
                net.remote_destroys.retain(|pending| pending.endpoint != endpoint);
                if net.remote_destroys.len() < before && net.is_live() {
                    let id = net.id;
                    self.relay.submit(RelayRequest::AckEndpointDestroyed {
                        network: id,
                        endpoint,
                    });
                }
            }
        }
    }
}
