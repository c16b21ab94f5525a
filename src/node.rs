//! Node assembly and cooperative loop.
//!
//! The `Node` constructs every core component at boot and owns them for the
//! life of the process; nothing in this crate is a global. It runs a single
//! cooperative loop: each tick drains pending scanned advertisements, gives
//! the microapp its continue exchange, services administrative commands,
//! and finally routes the events the components queued.

use thiserror::Error as ThisError;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::assets::{
    AssetFilterEngine, AssetFilterStore, AssetRecords, CommitFilterChangesCommand,
    FilterSummaries, MeshForwarder, RemoveFilterCommand, UploadFilterCommand,
    FILTER_PROTOCOL_VERSION,
};
use crate::bus::{Event, EventQueue};
use crate::config::NodeConfig;
use crate::errors::Error;
use crate::microapp::{
    ipc_ram_handle, MicroappProgram, MicroappRequestHandler, MicroappStorage,
    MicroappSupervisor, StaticHostState,
};
use crate::types::ScannedDevice;
use crate::TICK_INTERVAL_MS;

/// Errors related to node construction and operation.
#[derive(Debug, ThisError)]
pub enum NodeError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("component init failed: {0}")]
    Init(Error),
}

/// Administrative commands reaching the node from the operator.
#[derive(Clone, Debug)]
pub enum NodeCommand {
    UploadFilter {
        filter_id: u8,
        chunk_offset: u16,
        total_size: u16,
        data: Vec<u8>,
    },
    RemoveFilter {
        filter_id: u8,
    },
    CommitFilters {
        master_version: u16,
        master_crc: u32,
    },
    GetFilterSummaries,
}

/// A running Emberstone node core.
pub struct Node {
    config: NodeConfig,
    bus: EventQueue,

    // === Asset filtering ===
    store: AssetFilterStore,
    engine: AssetFilterEngine,
    records: AssetRecords,
    forwarder: MeshForwarder,

    // === Microapp hosting ===
    storage: MicroappStorage,
    supervisor: MicroappSupervisor,
    handler: MicroappRequestHandler,
    host: StaticHostState,
}

impl Node {
    /// Construct the node core. Components are wired here, once, at boot.
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        let engine = AssetFilterEngine::new().map_err(NodeError::Init)?;
        let supervisor = MicroappSupervisor::new(ipc_ram_handle());
        let host = StaticHostState {
            stone_id: config.stone_id,
            ..Default::default()
        };
        let node = Self {
            records: AssetRecords::new(config.filtering.max_asset_records),
            forwarder: MeshForwarder::new(config.filtering.throttle_bump_ms),
            config,
            bus: EventQueue::new(),
            store: AssetFilterStore::new(),
            engine,
            storage: MicroappStorage::new(),
            supervisor,
            handler: MicroappRequestHandler::new(),
            host,
        };
        Ok(node)
    }

    /// The loaded configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The filter store, for status queries.
    pub fn filter_store(&self) -> &AssetFilterStore {
        &self.store
    }

    /// The microapp storage, for upload tooling.
    pub fn microapp_storage_mut(&mut self) -> &mut MicroappStorage {
        &mut self.storage
    }

    /// Start the hosted microapp, applying crash recovery first.
    pub fn start_microapp(&mut self, program: Box<dyn MicroappProgram>) -> Result<(), Error> {
        if !self.config.microapp.enabled {
            info!("Microapp hosting disabled by config");
            return Err(Error::WrongState);
        }
        if self.supervisor.recover_from_reboot(&mut self.storage) {
            return Err(Error::WrongState);
        }
        self.supervisor.start(&mut self.storage, program)
    }

    /// Feed one scanned advertisement through the node: the filter engine
    /// first, then the microapp's scan interrupt.
    pub fn handle_scanned_device(&mut self, device: &ScannedDevice) {
        self.engine.handle_scanned_device(
            &self.store,
            &mut self.records,
            &mut self.forwarder,
            &mut self.bus,
            device,
        );
        self.supervisor
            .on_device_scanned(device, &self.handler, &mut self.bus, &self.host);
    }

    /// Feed one inbound mesh message to the microapp.
    pub fn handle_mesh_message(&mut self, stone_id: u8, payload: &[u8]) {
        self.supervisor
            .on_mesh_message(stone_id, payload, &self.handler, &mut self.bus, &self.host);
    }

    /// Service one administrative command.
    pub fn handle_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::UploadFilter {
                filter_id,
                chunk_offset,
                total_size,
                data,
            } => {
                let result = self.store.handle_upload_command(
                    &UploadFilterCommand {
                        protocol: FILTER_PROTOCOL_VERSION,
                        filter_id,
                        chunk_offset,
                        total_size,
                        data: &data,
                    },
                    &mut self.bus,
                );
                match result {
                    Ok(_) => debug!(filter_id, chunk_offset, "Filter chunk accepted"),
                    Err(error) => warn!(filter_id, %error, "Filter upload rejected"),
                }
            }
            NodeCommand::RemoveFilter { filter_id } => {
                let result = self.store.handle_remove_command(
                    &RemoveFilterCommand {
                        protocol: FILTER_PROTOCOL_VERSION,
                        filter_id,
                    },
                    &mut self.bus,
                );
                if let Err(error) = result {
                    warn!(filter_id, %error, "Filter removal rejected");
                }
            }
            NodeCommand::CommitFilters {
                master_version,
                master_crc,
            } => {
                let result = self.store.handle_commit_command(
                    &CommitFilterChangesCommand {
                        protocol: FILTER_PROTOCOL_VERSION,
                        master_version,
                        master_crc,
                    },
                    &mut self.bus,
                );
                if let Err(error) = result {
                    warn!(master_version, %error, "Filter commit rejected");
                }
            }
            NodeCommand::GetFilterSummaries => {
                let summaries = self.filter_summaries();
                info!(
                    filters = summaries.summaries.len(),
                    master_version = summaries.master_version,
                    master_crc = format_args!("{:#010X}", summaries.master_crc),
                    "Filter summaries"
                );
            }
        }
    }

    /// Summaries of the current filter set.
    pub fn filter_summaries(&mut self) -> FilterSummaries {
        self.store.filter_summaries()
    }

    /// One tick of the cooperative loop.
    pub fn tick(&mut self) {
        self.supervisor
            .tick(&self.handler, &mut self.bus, &self.host);
        self.store.tick(&mut self.bus);
        self.records.tick();
    }

    /// Route queued events to their external consumers.
    ///
    /// Transports and drivers live outside the core; the daemon logs what
    /// would be handed to them.
    pub fn dispatch_events(&mut self) {
        while let Some(event) = self.bus.pop() {
            match &event {
                Event::MeshOutbound { stone_id, payload } => {
                    debug!(stone_id, len = payload.len(), "Mesh outbound");
                }
                Event::AssetAccepted {
                    filter_id,
                    asset_id,
                    accepted_bitmask,
                    ..
                } => {
                    debug!(
                        filter_id,
                        asset_id = %asset_id,
                        bitmask = format_args!("{:#06X}", accepted_bitmask),
                        "Asset accepted"
                    );
                }
                other => debug!(event = ?other, "Event"),
            }
        }
    }

    /// Run the cooperative loop until the input channels close.
    ///
    /// Per tick, in order: drain pending scanned advertisements, run the
    /// tick work (microapp exchange, countdowns), drain administrative
    /// commands, route events.
    pub async fn run(
        mut self,
        mut scans: mpsc::Receiver<ScannedDevice>,
        mut commands: mpsc::Receiver<NodeCommand>,
    ) {
        let mut ticker = interval(Duration::from_millis(TICK_INTERVAL_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Node loop started");

        loop {
            ticker.tick().await;

            let mut scans_open = true;
            loop {
                match scans.try_recv() {
                    Ok(device) => self.handle_scanned_device(&device),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        scans_open = false;
                        break;
                    }
                }
            }

            self.tick();

            let mut commands_open = true;
            loop {
                match commands.try_recv() {
                    Ok(command) => self.handle_command(command),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        commands_open = false;
                        break;
                    }
                }
            }

            self.dispatch_events();

            if !scans_open && !commands_open {
                info!("Input channels closed, node loop stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{
        encode_exact_match_body, filter::encode_filter_payload, FilterType, InputSelector,
        OutputFormat,
    };
    use crate::types::MacAddress;

    const MAC: [u8; 6] = [0x10, 0x20, 0x30, 0x40, 0x50, 0x60];

    fn mac_filter_payload() -> Vec<u8> {
        let body = encode_exact_match_body(&[&MAC[..]]).unwrap();
        encode_filter_payload(
            FilterType::ExactMatch,
            false,
            InputSelector::MacAddress,
            OutputFormat::AssetId,
            InputSelector::MacAddress,
            &body,
        )
    }

    fn master_crc_for(filter_id: u8, payload: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[filter_id]);
        hasher.update(&crc32fast::hash(payload).to_le_bytes());
        hasher.finalize()
    }

    #[test]
    fn test_upload_commit_scan_flow() {
        let mut node = Node::new(NodeConfig::default()).unwrap();
        let payload = mac_filter_payload();

        node.handle_command(NodeCommand::UploadFilter {
            filter_id: 4,
            chunk_offset: 0,
            total_size: payload.len() as u16,
            data: payload.clone(),
        });
        assert!(node.filter_store().is_in_progress());

        node.handle_command(NodeCommand::CommitFilters {
            master_version: 2,
            master_crc: master_crc_for(4, &payload),
        });
        assert!(node.filter_store().is_ready());
        node.dispatch_events();

        // A matching advertisement is accepted and forwarded.
        let device = ScannedDevice::new(MacAddress::from_bytes(MAC), -40, Vec::new());
        node.handle_scanned_device(&device);
        let accepted = node
            .bus
            .drain()
            .filter(|event| matches!(event, Event::AssetAccepted { .. }))
            .count();
        assert_eq!(accepted, 1);
    }

    #[test]
    fn test_commands_while_in_progress_keep_engine_idle() {
        let mut node = Node::new(NodeConfig::default()).unwrap();
        let payload = mac_filter_payload();
        node.handle_command(NodeCommand::UploadFilter {
            filter_id: 1,
            chunk_offset: 0,
            total_size: payload.len() as u16,
            data: payload,
        });

        let device = ScannedDevice::new(MacAddress::from_bytes(MAC), -40, Vec::new());
        node.handle_scanned_device(&device);
        let accepted = node
            .bus
            .drain()
            .filter(|event| matches!(event, Event::AssetAccepted { .. }))
            .count();
        assert_eq!(accepted, 0);
    }

    #[test]
    fn test_bad_commit_logged_not_fatal() {
        let mut node = Node::new(NodeConfig::default()).unwrap();
        let payload = mac_filter_payload();
        node.handle_command(NodeCommand::UploadFilter {
            filter_id: 1,
            chunk_offset: 0,
            total_size: payload.len() as u16,
            data: payload,
        });
        node.handle_command(NodeCommand::CommitFilters {
            master_version: 1,
            master_crc: 0xBAD,
        });
        assert_eq!(node.filter_store().master_version(), 0);
        // The node stays operational; a corrected commit goes through.
        assert!(node.filter_store().is_in_progress());
    }

    #[test]
    fn test_tick_runs_countdowns() {
        let mut node = Node::new(NodeConfig::default()).unwrap();
        let payload = mac_filter_payload();
        node.handle_command(NodeCommand::UploadFilter {
            filter_id: 1,
            chunk_offset: 0,
            total_size: payload.len() as u16,
            data: payload,
        });
        assert!(node.filter_store().is_in_progress());
        for _ in 0..20 * crate::TICKS_PER_SECOND {
            node.tick();
        }
        assert!(!node.filter_store().is_in_progress());
    }
}
