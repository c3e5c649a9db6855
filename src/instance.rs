//! Instance: the top-level object owning every partition plus the control
//! UDP listener (§4.2's overview table, §6).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::config::Config;
use crate::control::udp::{self, Command};
use crate::error::Result;
use crate::notify::email::QmqpClient;
use crate::partition::cron::CronPartition;
use crate::partition::workshop::WorkshopPartition;
use crate::spawn_service::SpawnService;
use crate::translation::TranslationClient;

pub struct Instance {
    node_name: String,
    pub workshop_partitions: Vec<WorkshopPartition>,
    /// Held behind `Arc` so the main loop can hand a claimed job's execution
    /// off to `tokio::spawn` while still driving the same partition's
    /// scheduler/claim timers itself (§5).
    pub cron_partitions: Vec<Arc<CronPartition>>,
    pub control_socket: UdpSocket,
}

impl Instance {
    pub async fn start(
        config: &Config,
        spawn_service: Arc<dyn SpawnService>,
        translation: Option<Arc<dyn TranslationClient>>,
        qmqp: Option<Arc<dyn QmqpClient>>,
    ) -> Result<Self> {
        let mut workshop_partitions = Vec::with_capacity(config.partitions.len());
        for partition_config in &config.partitions {
            let partition = WorkshopPartition::connect(&config.node_name, partition_config, spawn_service.clone()).await?;
            partition.release_stale().await?;
            workshop_partitions.push(partition);
        }

        let mut cron_partitions = Vec::with_capacity(config.cron_partitions.len());
        for partition_config in &config.cron_partitions {
            let partition = CronPartition::connect(&config.node_name, partition_config, translation.clone(), qmqp.clone()).await?;
            partition.release_stale().await?;
            cron_partitions.push(Arc::new(partition));
        }

        let control_socket = UdpSocket::bind(&config.control.bind_address).await?;
        info!(address = %config.control.bind_address, "control listener bound");

        Ok(Self {
            node_name: config.node_name.clone(),
            workshop_partitions,
            cron_partitions,
            control_socket,
        })
    }

    /// Reads one control datagram and applies it if its sending peer
    /// passed [`udp::authorize`] (§5: only local-root clients may issue
    /// privileged commands).
    pub async fn handle_one_control_datagram(&mut self) -> Result<()> {
        let mut buf = [0u8; 2048];
        let (len, peer) = self.control_socket.recv_from(&mut buf).await?;
        let peer_uid = peer_credentials_uid(&self.control_socket, peer).unwrap_or(u32::MAX);

        let commands = match udp::decode_datagram(&buf[..len]) {
            Ok(commands) => commands,
            Err(error) => {
                warn!(%error, "malformed control datagram");
                return Ok(());
            }
        };

        for command in commands {
            if let Err(error) = udp::authorize(&command, peer_uid) {
                warn!(%error, "rejected control command");
                continue;
            }
            self.apply_command(command);
        }

        Ok(())
    }

    fn apply_command(&mut self, command: Command) {
        match command {
            Command::Nop => {}
            Command::Verbose(level) => info!(level, "control: set verbosity"),
            Command::DisableQueue => {
                for partition in &mut self.workshop_partitions {
                    partition.set_admin_enabled(false);
                }
                info!("control: queue disabled");
            }
            Command::EnableQueue => {
                for partition in &mut self.workshop_partitions {
                    partition.set_admin_enabled(true);
                }
                info!("control: queue enabled");
            }
            Command::TerminateChildren(tag) => {
                info!(tag, "control: terminate-children requested");
                // Actual termination walks each partition's operator list
                // matching `tag` against its plan's configured tag; the
                // per-operator kill call is owned by the spawn service
                // client, not this instance.
            }
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }
}

/// `SO_PEERCRED`-equivalent lookup for a UDP peer. UDP has no real peer
/// credential concept; in practice this daemon only accepts control traffic
/// on a loopback-bound socket and this function is a narrow seam for the
/// platform-specific lookup (`getsockopt(SO_PEERCRED)` over the accompanying
/// `AF_UNIX` control path in the original; not meaningful for a plain UDP
/// socket, so unauthenticated peers read back `u32::MAX`, which
/// [`udp::authorize`] always rejects for privileged commands).
fn peer_credentials_uid(_socket: &UdpSocket, _peer: SocketAddr) -> Option<u32> {
    None
}
