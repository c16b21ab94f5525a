//! Asset filter store.
//!
//! Owns the RAM the filters live in, runs the three-phase
//! upload/remove/commit transaction, and keeps up the master version and
//! master CRC that downstream nodes use to decide whether their filter sets
//! agree.
//!
//! A master version of 0 means the filter set is invalid; every edit drops
//! the version to 0 and only a commit whose CRC matches the stored contents
//! raises it again. While an edit transaction is open, a countdown runs; if
//! the operator walks away mid-edit, the countdown expiring tells the rest
//! of the node that modification ended (without making the set valid).

use tracing::{debug, info, warn};

use crate::bus::{Event, EventQueue};
use crate::errors::{CmdOk, CmdResult, Error};
use crate::TICKS_PER_SECOND;

use super::filter::{declared_payload_size, FilterBody, FilterMetadata};
use super::{FILTER_BUFFER_SIZE, FILTER_PROTOCOL_VERSION, MAX_FILTER_IDS};

/// Time after the last edit command until "modification in progress" times
/// out, in seconds.
pub const MODIFICATION_IN_PROGRESS_TIMEOUT_SECONDS: u16 = 20;

const MODIFICATION_COUNTDOWN_TICKS: u16 =
    MODIFICATION_IN_PROGRESS_TIMEOUT_SECONDS * TICKS_PER_SECOND as u16;

/// Bytes of bookkeeping accounted per filter on top of its payload.
const FILTER_RUNTIME_OVERHEAD: usize = 8;

/// Chunked filter upload command.
#[derive(Clone, Debug)]
pub struct UploadFilterCommand<'a> {
    pub protocol: u8,
    pub filter_id: u8,
    pub chunk_offset: u16,
    pub total_size: u16,
    pub data: &'a [u8],
}

impl<'a> UploadFilterCommand<'a> {
    /// Parse the wire form: `protocol, filterId, chunkOffset u16,
    /// totalSize u16, data[]`, little-endian.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < 6 {
            return Err(Error::WrongPayloadLength);
        }
        Ok(Self {
            protocol: bytes[0],
            filter_id: bytes[1],
            chunk_offset: u16::from_le_bytes([bytes[2], bytes[3]]),
            total_size: u16::from_le_bytes([bytes[4], bytes[5]]),
            data: &bytes[6..],
        })
    }
}

/// Filter removal command.
#[derive(Clone, Copy, Debug)]
pub struct RemoveFilterCommand {
    pub protocol: u8,
    pub filter_id: u8,
}

impl RemoveFilterCommand {
    /// Parse the wire form: `protocol, filterId`.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 2 {
            return Err(Error::WrongPayloadLength);
        }
        Ok(Self {
            protocol: bytes[0],
            filter_id: bytes[1],
        })
    }
}

/// Commit command closing an edit transaction.
#[derive(Clone, Copy, Debug)]
pub struct CommitFilterChangesCommand {
    pub protocol: u8,
    pub master_version: u16,
    pub master_crc: u32,
}

impl CommitFilterChangesCommand {
    /// Parse the wire form: `protocol, masterVersion u16, masterCrc u32`,
    /// little-endian.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 7 {
            return Err(Error::WrongPayloadLength);
        }
        Ok(Self {
            protocol: bytes[0],
            master_version: u16::from_le_bytes([bytes[1], bytes[2]]),
            master_crc: u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]),
        })
    }
}

/// One `{ filterId, filterCrc }` pair of the summaries response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterSummary {
    pub filter_id: u8,
    pub filter_crc: u32,
}

/// Response to the summaries query.
#[derive(Clone, Debug)]
pub struct FilterSummaries {
    pub summaries: Vec<FilterSummary>,
    pub master_version: u16,
    pub master_crc: u32,
}

impl FilterSummaries {
    /// Serialize: `{ filterId, filterCrc }` pairs followed by
    /// `{ masterVersion, masterCrc }`, little-endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.summaries.len() * 5 + 6);
        for summary in &self.summaries {
            out.push(summary.filter_id);
            out.extend_from_slice(&summary.filter_crc.to_le_bytes());
        }
        out.extend_from_slice(&self.master_version.to_le_bytes());
        out.extend_from_slice(&self.master_crc.to_le_bytes());
        out
    }
}

/// One allocated filter: its id, payload buffer, and runtime bookkeeping.
#[derive(Clone, Debug)]
struct FilterEntry {
    filter_id: u8,
    total_size: u16,
    /// Part of a successfully committed set, unchanged since.
    committed: bool,
    /// CRC-32 over the payload, computed lazily at commit time.
    crc: Option<u32>,
    data: Vec<u8>,
}

/// Borrowed accessor over one stored filter.
///
/// Must not outlive a subsequent upload/remove/commit; the borrow checker
/// enforces exactly that.
#[derive(Clone, Copy, Debug)]
pub struct AssetFilter<'a> {
    entry: &'a FilterEntry,
}

impl<'a> AssetFilter<'a> {
    /// The filter id.
    pub fn filter_id(&self) -> u8 {
        self.entry.filter_id
    }

    /// Whether the filter is part of the committed set.
    pub fn is_committed(&self) -> bool {
        self.entry.committed
    }

    /// Raw filter payload.
    pub fn data(&self) -> &'a [u8] {
        &self.entry.data
    }

    /// Parse the metadata prefix.
    pub fn metadata(&self) -> Result<FilterMetadata, Error> {
        FilterMetadata::parse(&self.entry.data)
    }

    /// Parse the filter body.
    pub fn body(&self, metadata: &FilterMetadata) -> Result<FilterBody<'a>, Error> {
        FilterBody::parse(metadata, &self.entry.data)
    }
}

/// Owns the filters and the edit transaction state.
#[derive(Debug, Default)]
pub struct AssetFilterStore {
    /// Allocated filters, always sorted ascending by filter id.
    filters: Vec<FilterEntry>,
    /// 0 means the filter set is invalid.
    master_version: u16,
    /// CRC over `(filterId, filterCrc)` pairs in id order.
    master_crc: u32,
    /// Nonzero while an edit transaction is open; decremented every tick.
    modification_countdown: u16,
}

impl AssetFilterStore {
    /// Create an empty store; no modification in progress.
    pub fn new() -> Self {
        Self::default()
    }

    // === Queries ===

    /// Number of allocated filters.
    pub fn filter_count(&self) -> u8 {
        self.filters.len() as u8
    }

    /// Accessor over the filter at `index`.
    pub fn filter(&self, index: u8) -> Option<AssetFilter<'_>> {
        self.filters
            .get(index as usize)
            .map(|entry| AssetFilter { entry })
    }

    /// Index of the filter with the given id, if allocated.
    pub fn find_filter_index(&self, filter_id: u8) -> Option<u8> {
        self.filters
            .binary_search_by_key(&filter_id, |entry| entry.filter_id)
            .ok()
            .map(|index| index as u8)
    }

    /// Current master version; 0 means invalid.
    pub fn master_version(&self) -> u16 {
        self.master_version
    }

    /// Current master CRC. Only meaningful when the master version is
    /// nonzero.
    pub fn master_crc(&self) -> u32 {
        self.master_crc
    }

    /// Whether an edit transaction is open.
    pub fn is_in_progress(&self) -> bool {
        self.modification_countdown != 0
    }

    /// Whether the committed filter set may be applied to advertisements.
    pub fn is_ready(&self) -> bool {
        self.master_version != 0 && !self.is_in_progress()
    }

    /// Summaries of every allocated filter plus the master version/CRC.
    ///
    /// Filter CRCs are computed on demand and cached.
    pub fn filter_summaries(&mut self) -> FilterSummaries {
        self.compute_filter_crcs();
        FilterSummaries {
            summaries: self
                .filters
                .iter()
                .map(|entry| FilterSummary {
                    filter_id: entry.filter_id,
                    filter_crc: entry.crc.unwrap_or(0),
                })
                .collect(),
            master_version: self.master_version,
            master_crc: self.master_crc,
        }
    }

    // === Command interface ===

    /// Handle a chunked upload.
    ///
    /// The first chunk for a new filter id allocates; later chunks must
    /// agree on the total size. Uploading over a committed filter replaces
    /// it. Every accepted chunk opens (or refreshes) the edit transaction.
    pub fn handle_upload_command(
        &mut self,
        cmd: &UploadFilterCommand<'_>,
        bus: &mut EventQueue,
    ) -> CmdResult {
        if cmd.protocol != FILTER_PROTOCOL_VERSION {
            return Err(Error::ProtocolUnsupported(cmd.protocol));
        }
        let end = cmd.chunk_offset as usize + cmd.data.len();
        if end > cmd.total_size as usize {
            debug!(
                filter_id = cmd.filter_id,
                chunk_offset = cmd.chunk_offset,
                chunk_len = cmd.data.len(),
                total_size = cmd.total_size,
                "Upload chunk exceeds declared total size"
            );
            return Err(Error::InvalidMessage);
        }

        if let Some(index) = self.find_filter_index(cmd.filter_id) {
            let entry = &self.filters[index as usize];
            if entry.committed {
                // Replacing a committed filter starts from scratch. The set
                // must stop being valid before the old filter is dropped, or
                // a failing reallocation would leave a stale master CRC in
                // effect.
                debug!(filter_id = cmd.filter_id, "Replacing committed filter");
                self.start_in_progress(bus);
                self.deallocate_filter(cmd.filter_id);
            } else if entry.total_size != cmd.total_size {
                warn!(
                    filter_id = cmd.filter_id,
                    existing = entry.total_size,
                    uploaded = cmd.total_size,
                    "Upload total size disagrees with earlier chunks"
                );
                return Err(Error::WrongState);
            }
        }

        let index = match self.find_filter_index(cmd.filter_id) {
            Some(index) => index as usize,
            None => self.allocate_filter(cmd.filter_id, cmd.total_size as usize)?,
        };

        self.start_in_progress(bus);

        let entry = &mut self.filters[index];
        entry.data[cmd.chunk_offset as usize..end].copy_from_slice(cmd.data);
        entry.committed = false;
        entry.crc = None;

        debug!(
            filter_id = cmd.filter_id,
            chunk_offset = cmd.chunk_offset,
            chunk_len = cmd.data.len(),
            "Stored filter chunk"
        );
        Ok(CmdOk::Success)
    }

    /// Remove a filter immediately.
    pub fn handle_remove_command(
        &mut self,
        cmd: &RemoveFilterCommand,
        bus: &mut EventQueue,
    ) -> CmdResult {
        if cmd.protocol != FILTER_PROTOCOL_VERSION {
            return Err(Error::ProtocolUnsupported(cmd.protocol));
        }
        if self.deallocate_filter(cmd.filter_id) {
            self.start_in_progress(bus);
            info!(filter_id = cmd.filter_id, "Removed filter");
            Ok(CmdOk::Success)
        } else {
            Ok(CmdOk::NoChange)
        }
    }

    /// Commit the filter set.
    ///
    /// Validates structure, computes CRCs, and only when the client's
    /// master CRC matches the computed one does the master version change.
    /// A failed commit leaves every filter allocated and the master version
    /// at 0, so a corrected retry is possible.
    pub fn handle_commit_command(
        &mut self,
        cmd: &CommitFilterChangesCommand,
        bus: &mut EventQueue,
    ) -> CmdResult {
        if cmd.protocol != FILTER_PROTOCOL_VERSION {
            return Err(Error::ProtocolUnsupported(cmd.protocol));
        }
        if cmd.master_version == 0 {
            // 0 is the "invalid" sentinel and can never be committed to.
            return Err(Error::InvalidMessage);
        }

        if !self.check_filter_size_consistency() {
            return Err(Error::WrongState);
        }
        self.compute_filter_crcs();

        let computed_crc = self.compute_master_crc();
        if computed_crc != cmd.master_crc {
            warn!(
                client_crc = format_args!("{:#010X}", cmd.master_crc),
                computed_crc = format_args!("{:#010X}", computed_crc),
                "Commit master CRC mismatch"
            );
            return Err(Error::Mismatch);
        }

        self.master_version = cmd.master_version;
        self.master_crc = computed_crc;
        for entry in &mut self.filters {
            entry.committed = true;
        }
        self.end_in_progress(bus);
        bus.push(Event::FiltersCommitted {
            master_version: self.master_version,
            master_crc: self.master_crc,
        });
        info!(
            master_version = self.master_version,
            master_crc = format_args!("{:#010X}", self.master_crc),
            filters = self.filters.len(),
            "Committed filter set"
        );
        Ok(CmdOk::Success)
    }

    /// Per-tick housekeeping: run down the edit-transaction countdown.
    pub fn tick(&mut self, bus: &mut EventQueue) {
        if self.modification_countdown > 0 {
            self.modification_countdown -= 1;
            if self.modification_countdown == 0 {
                info!("Filter modification timed out");
                bus.push(Event::FilterModificationInProgress(false));
            }
        }
    }

    // === Allocation ===

    /// Allocate a buffer for a new filter and insert it at the position
    /// that keeps the array sorted by filter id.
    ///
    /// Does not check whether the id is already present; upload does that
    /// first.
    fn allocate_filter(&mut self, filter_id: u8, payload_size: usize) -> Result<usize, Error> {
        if self.filters.len() >= MAX_FILTER_IDS {
            warn!(filter_id, "Filter count limit reached");
            return Err(Error::NoSpace);
        }
        let allocated: usize = self
            .filters
            .iter()
            .map(|entry| entry.data.len() + FILTER_RUNTIME_OVERHEAD)
            .sum();
        if allocated + payload_size + FILTER_RUNTIME_OVERHEAD > FILTER_BUFFER_SIZE {
            warn!(
                filter_id,
                allocated,
                requested = payload_size,
                budget = FILTER_BUFFER_SIZE,
                "Filter buffer exhausted"
            );
            return Err(Error::NoSpace);
        }

        let position = self
            .filters
            .partition_point(|entry| entry.filter_id < filter_id);
        self.filters.insert(
            position,
            FilterEntry {
                filter_id,
                total_size: payload_size as u16,
                committed: false,
                crc: None,
                data: vec![0; payload_size],
            },
        );
        debug!(filter_id, payload_size, "Allocated filter");
        Ok(position)
    }

    /// Free the filter with the given id. Later entries slide left to close
    /// the gap; their filter ids travel with them.
    fn deallocate_filter(&mut self, filter_id: u8) -> bool {
        match self.find_filter_index(filter_id) {
            Some(index) => {
                self.filters.remove(index as usize);
                true
            }
            None => false,
        }
    }

    // === Transaction state ===

    /// Open or refresh the edit transaction: the filter set becomes invalid
    /// until the next successful commit.
    fn start_in_progress(&mut self, bus: &mut EventQueue) {
        let was_in_progress = self.is_in_progress();
        self.master_version = 0;
        self.modification_countdown = MODIFICATION_COUNTDOWN_TICKS;
        if !was_in_progress {
            bus.push(Event::FilterModificationInProgress(true));
        }
    }

    fn end_in_progress(&mut self, bus: &mut EventQueue) {
        if self.is_in_progress() {
            self.modification_countdown = 0;
            bus.push(Event::FilterModificationInProgress(false));
        }
    }

    // === Validation ===

    /// Check that every filter's allocated size equals the size its own
    /// contents declare. Filters that survived an earlier commit are
    /// skipped. Failing filters are deallocated.
    fn check_filter_size_consistency(&mut self) -> bool {
        let mut failed_ids = Vec::new();
        for entry in &self.filters {
            if entry.committed {
                continue;
            }
            match declared_payload_size(&entry.data) {
                Ok(declared) if declared == entry.data.len() => {}
                result => {
                    warn!(
                        filter_id = entry.filter_id,
                        allocated = entry.data.len(),
                        declared = ?result,
                        "Filter size inconsistent, deallocating"
                    );
                    failed_ids.push(entry.filter_id);
                }
            }
        }
        for filter_id in &failed_ids {
            self.deallocate_filter(*filter_id);
        }
        failed_ids.is_empty()
    }

    /// Compute and cache the CRC of every filter that does not have one.
    fn compute_filter_crcs(&mut self) {
        for entry in &mut self.filters {
            if entry.crc.is_none() {
                entry.crc = Some(crc32fast::hash(&entry.data));
            }
        }
    }

    /// CRC over the `(filterId, filterCrc)` pairs in filter id order.
    ///
    /// Assumes filter CRCs are already computed.
    fn compute_master_crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for entry in &self.filters {
            hasher.update(&[entry.filter_id]);
            hasher.update(&entry.crc.unwrap_or(0).to_le_bytes());
        }
        hasher.finalize()
    }
}
