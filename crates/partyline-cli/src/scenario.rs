//! Scripted two-device scenario
//!
//! The host creates a network and invites the guest; both create an
//! endpoint, exchange messages over a lossy relay, chat, and leave. An
//! optional matchmaking phase first pairs the two players through the
//! simulated matchmaker.

use std::time::Duration;

use partyline_core::{
    EntityId, InvitationConfiguration, InvitationId, NetworkDescriptor,
    QueuingConfiguration, SendMessageOptions, StateChangePayload,
};
use partyline_harness::{ChangeRecord, Cluster, SimulatedMatchmaker};
use partyline_runtime::{
    ChatPermissions, Handle, MatchmakingManager, Network, NetworkStatistics, PartyManager,
    PropertyUpdate, TicketConfiguration, TicketStatus,
};
use serde::Serialize;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::ScenarioConfig;
use crate::error::{CliError, Result};

const HOST: usize = 0;
const GUEST: usize = 1;

// ----------------------------------------------------------------------------
// Report
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub match_id: Option<String>,
    pub descriptor: String,
    pub messages_sent: usize,
    pub messages_received: usize,
    pub chat_lines_received: usize,
    pub steps: u64,
    pub host_statistics: NetworkStatistics,
    pub packets_delivered: u64,
    pub packets_dropped: u64,
}

#[derive(Serialize)]
struct ChangeLine<'a> {
    step: u64,
    device: &'a str,
    kind: &'static str,
    result: Option<String>,
}

// ----------------------------------------------------------------------------
// Runner
// ----------------------------------------------------------------------------

pub struct ScenarioRunner {
    config: ScenarioConfig,
    cluster: Cluster,
    pacing: Option<Interval>,
    json: bool,
    steps: u64,
}

impl ScenarioRunner {
    pub fn new(config: ScenarioConfig, realtime: bool, json: bool) -> Result<Self> {
        let mut cluster = Cluster::new(config.manager.clone());
        cluster.add_device(config.scenario.host.clone())?;
        cluster.add_device(config.scenario.guest.clone())?;
        let pacing = realtime.then(|| {
            let mut pacing = interval(Duration::from_millis(config.scenario.step_ms));
            pacing.set_missed_tick_behavior(MissedTickBehavior::Delay);
            pacing
        });
        Ok(Self {
            config,
            cluster,
            pacing,
            json,
            steps: 0,
        })
    }

    fn tick(&self) -> Duration {
        Duration::from_millis(self.config.scenario.step_ms)
    }

    fn manager(&self, device: usize) -> Result<&PartyManager> {
        Ok(self.cluster.manager(device)?)
    }

    fn print(&self, record: &ChangeRecord) -> Result<()> {
        let device = self
            .cluster
            .device(record.device)
            .map(|d| d.name.as_str())
            .unwrap_or("?");
        let result = record.outcome.map(|outcome| format!("{:?}", outcome.result));
        if self.json {
            let line = ChangeLine {
                step: self.steps,
                device,
                kind: record.kind,
                result,
            };
            println!("{}", serde_json::to_string(&line)?);
        } else {
            match result {
                Some(result) => println!("[{:>5}] {:<14} {} ({})", self.steps, device, record.kind, result),
                None => println!("[{:>5}] {:<14} {}", self.steps, device, record.kind),
            }
        }
        Ok(())
    }

    async fn step(&mut self) -> Result<Vec<ChangeRecord>> {
        if let Some(pacing) = self.pacing.as_mut() {
            pacing.tick().await;
        }
        let records = self.cluster.step(self.tick())?;
        self.steps += 1;
        for record in &records {
            self.print(record)?;
        }
        Ok(records)
    }

    /// Step until every `(device, kind)` pair has been published, counting
    /// repeated pairs separately
    async fn wait_for_all(&mut self, phase: &'static str, wanted: &[(usize, &'static str)]) -> Result<()> {
        let mut pending: Vec<_> = wanted.to_vec();
        for _ in 0..self.config.scenario.max_rounds {
            for record in self.step().await? {
                let Some(index) = pending
                    .iter()
                    .position(|(device, kind)| *device == record.device && *kind == record.kind)
                else {
                    continue;
                };
                if !record.succeeded() {
                    return Err(CliError::Step {
                        step: phase,
                        reason: format!("{} failed with {:?}", record.kind, record.outcome),
                    });
                }
                pending.remove(index);
            }
            if pending.is_empty() {
                debug!(phase, steps = self.steps, "phase complete");
                return Ok(());
            }
        }
        Err(CliError::Step {
            step: phase,
            reason: format!("still waiting for {pending:?}"),
        })
    }

    fn entity(&self, name: &str) -> Result<EntityId> {
        Ok(EntityId::new(name)?)
    }

    // ------------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------------

    pub async fn run(mut self) -> Result<ScenarioReport> {
        info!(scenario = %self.config.scenario.name, "scenario starting");
        let match_id = if self.config.matchmaking.enabled {
            Some(self.matchmake().await?)
        } else {
            None
        };

        let (host_net, guest_net, descriptor) = self.assemble().await?;
        let (sent, received) = self.exchange_messages(host_net).await?;
        let chat_lines = self.chat(host_net, guest_net).await?;
        let host_statistics = self.manager(HOST)?.network_statistics(host_net)?;

        self.manager(HOST)?.leave_network(host_net)?;
        self.manager(GUEST)?.leave_network(guest_net)?;
        self.wait_for_all("leave", &[(HOST, "NetworkDestroyed"), (GUEST, "NetworkDestroyed")])
            .await?;
        self.cluster.shutdown_device(HOST)?;
        self.cluster.shutdown_device(GUEST)?;

        let relay = self.cluster.relay.statistics();
        info!(steps = self.steps, "scenario finished");
        Ok(ScenarioReport {
            name: self.config.scenario.name.clone(),
            match_id,
            descriptor,
            messages_sent: sent,
            messages_received: received,
            chat_lines_received: chat_lines,
            steps: self.steps,
            host_statistics,
            packets_delivered: relay.packets_delivered,
            packets_dropped: relay.packets_dropped,
        })
    }

    /// Pair host and guest in one queue
    async fn matchmake(&mut self) -> Result<String> {
        let settings = self.config.matchmaking.clone();
        let service = SimulatedMatchmaker::new();
        let players = [self.config.scenario.host.clone(), self.config.scenario.guest.clone()];
        let mut managers = Vec::new();
        let mut tickets = Vec::new();
        for player in &players {
            let manager = MatchmakingManager::new(service.client(), settings.service.clone())
                .with_time_source(self.cluster.clock.clone());
            let ticket = manager.create_ticket(
                self.entity(player)?,
                TicketConfiguration {
                    queue_name: settings.queue.clone(),
                    timeout_secs: Some(settings.timeout_secs),
                    ..Default::default()
                },
            )?;
            managers.push(manager);
            tickets.push(ticket);
        }

        for _ in 0..self.config.scenario.max_rounds {
            for (manager, player) in managers.iter().zip(&players) {
                manager.do_work();
                let changes = manager.start_processing();
                for change in &changes {
                    println!("[{:>5}] {:<14} {}", self.steps, player, change.payload().kind_name());
                }
                manager.finish_processing(changes)?;
            }
            let statuses = managers
                .iter()
                .zip(&tickets)
                .map(|(manager, ticket)| manager.ticket_status(*ticket))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            if statuses.iter().all(|status| status.is_terminal()) {
                if statuses.iter().any(|status| *status != TicketStatus::Matched) {
                    let outcome = managers[0].ticket_outcome(tickets[0])?;
                    return Err(CliError::Step {
                        step: "matchmaking",
                        reason: format!("tickets ended as {statuses:?} ({outcome:?})"),
                    });
                }
                let details = managers[0].match_details(tickets[0])?;
                info!(match_id = %details.match_id, members = details.members.len(), "players matched");
                for (manager, ticket) in managers.iter().zip(&tickets) {
                    manager.destroy_ticket(*ticket)?;
                }
                return Ok(details.match_id);
            }
            self.cluster.clock.advance(self.tick());
            self.steps += 1;
        }
        Err(CliError::Step {
            step: "matchmaking",
            reason: "tickets never completed".into(),
        })
    }

    /// Host creates and joins a network; the guest joins through the
    /// serialized descriptor
    async fn assemble(&mut self) -> Result<(Handle<Network>, Handle<Network>, String)> {
        let settings = self.config.scenario.clone();
        let host = self.manager(HOST)?;
        let host_user = host.create_local_user(self.entity(&settings.host)?, "host-token")?;
        let invitation = InvitationConfiguration {
            identifier: Some(InvitationId::new(settings.invitation.clone())?),
            ..Default::default()
        };
        let (descriptor, invitation_id) =
            host.create_new_network(host_user, self.config.network.clone(), Vec::new(), &invitation)?;
        let host_net = host.connect_to_network(&descriptor)?;
        self.wait_for_all(
            "create network",
            &[(HOST, "CreateNewNetworkCompleted"), (HOST, "ConnectToNetworkCompleted")],
        )
        .await?;

        self.manager(HOST)?
            .authenticate_local_user(host_net, host_user, invitation_id.clone())?;
        self.wait_for_all("host authentication", &[(HOST, "AuthenticateLocalUserCompleted")])
            .await?;

        let serialized = self.manager(HOST)?.network_descriptor(host_net)?.serialize()?;
        info!(descriptor = %serialized, "network descriptor published");
        let guest_descriptor = NetworkDescriptor::deserialize(&serialized)?;

        let guest = self.manager(GUEST)?;
        let guest_user = guest.create_local_user(self.entity(&settings.guest)?, "guest-token")?;
        let guest_net = guest.connect_to_network(&guest_descriptor)?;
        self.wait_for_all("guest connect", &[(GUEST, "ConnectToNetworkCompleted")])
            .await?;
        self.manager(GUEST)?
            .authenticate_local_user(guest_net, guest_user, invitation_id)?;
        self.wait_for_all(
            "guest authentication",
            &[(GUEST, "AuthenticateLocalUserCompleted"), (HOST, "RemoteDeviceJoinedNetwork")],
        )
        .await?;

        self.manager(HOST)?
            .create_endpoint(host_net, Some(host_user), vec![PropertyUpdate::set("role", "host")])?;
        self.manager(GUEST)?
            .create_endpoint(guest_net, Some(guest_user), vec![PropertyUpdate::set("role", "guest")])?;
        self.wait_for_all(
            "endpoints",
            &[
                (HOST, "CreateEndpointCompleted"),
                (GUEST, "CreateEndpointCompleted"),
                (HOST, "EndpointCreated"),
                (HOST, "EndpointCreated"),
                (GUEST, "EndpointCreated"),
                (GUEST, "EndpointCreated"),
            ],
        )
        .await?;
        Ok((host_net, guest_net, serialized))
    }

    async fn exchange_messages(&mut self, host_net: Handle<Network>) -> Result<(usize, usize)> {
        let settings = self.config.scenario.clone();
        let host = self.manager(HOST)?;
        let mut local = None;
        let mut remote = None;
        for endpoint in host.network_endpoints(host_net)? {
            if host.endpoint_is_local(endpoint)? {
                local = Some(endpoint);
            } else {
                remote = Some(endpoint);
            }
        }
        let (Some(local), Some(remote)) = (local, remote) else {
            return Err(CliError::Step {
                step: "messages",
                reason: "host does not see both endpoints".into(),
            });
        };

        self.cluster.relay.drop_every_nth_packet(settings.drop_every);
        let options = if settings.guaranteed {
            SendMessageOptions::reliable_ordered()
        } else {
            SendMessageOptions::best_effort()
        };
        for index in 0..settings.messages {
            let payload = vec![index as u8; settings.message_size];
            self.manager(HOST)?.send_message(
                local,
                &[remote],
                options,
                QueuingConfiguration::default(),
                &[payload.as_slice()],
            )?;
        }

        let mut received = 0;
        for _ in 0..settings.max_rounds {
            received += self
                .step()
                .await?
                .iter()
                .filter(|r| r.device == GUEST && r.kind == "EndpointMessageReceived")
                .count();
            if received >= settings.messages {
                break;
            }
        }
        self.cluster.relay.drop_every_nth_packet(None);
        if settings.guaranteed && received < settings.messages {
            return Err(CliError::Step {
                step: "messages",
                reason: format!("{received} of {} guaranteed messages arrived", settings.messages),
            });
        }
        info!(sent = settings.messages, received, "message exchange finished");
        Ok((settings.messages, received))
    }

    async fn chat(&mut self, host_net: Handle<Network>, guest_net: Handle<Network>) -> Result<usize> {
        let Some(text) = self.config.scenario.chat_text.clone() else {
            return Ok(0);
        };
        let host = self.manager(HOST)?;
        let host_user = host.network_local_users(host_net)?.into_iter().next();
        let guest = self.manager(GUEST)?;
        let guest_user = guest.network_local_users(guest_net)?.into_iter().next();
        let (Some(host_user), Some(guest_user)) = (host_user, guest_user) else {
            return Err(CliError::Step {
                step: "chat",
                reason: "a local user left before chat".into(),
            });
        };

        let host_chat = host.create_chat_control(host_user, Some("en-US".into()))?;
        host.connect_chat_control(host_chat, host_net)?;
        let guest_chat = guest.create_chat_control(guest_user, Some("en-US".into()))?;
        guest.connect_chat_control(guest_chat, guest_net)?;
        self.wait_for_all(
            "chat controls",
            &[
                (HOST, "ConnectChatControlCompleted"),
                (GUEST, "ConnectChatControlCompleted"),
                (HOST, "ChatControlJoinedNetwork"),
                (HOST, "ChatControlJoinedNetwork"),
                (GUEST, "ChatControlJoinedNetwork"),
                (GUEST, "ChatControlJoinedNetwork"),
            ],
        )
        .await?;

        // Text is only accepted from chat controls granted receive_text
        let guest = self.manager(GUEST)?;
        for control in guest.network_chat_controls(guest_net)? {
            if !guest.chat_control_is_local(control)? {
                guest.set_chat_permissions(guest_chat, control, ChatPermissions::all())?;
            }
        }

        let host = self.manager(HOST)?;
        let mut targets = Vec::new();
        for control in host.network_chat_controls(host_net)? {
            if !host.chat_control_is_local(control)? {
                targets.push(control);
            }
        }
        host.send_text(host_chat, &targets, &text)?;
        self.wait_for_all("chat text", &[(GUEST, "ChatTextReceived")]).await?;
        Ok(1)
    }
}
