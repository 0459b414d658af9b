//! The multiverse: the preferred candidate chain and the state machine that
//! decides whether a new block extends it, replaces its tip, or needs a range
//! of history fetched first.
//!
//! Not internally synchronised. The owner must allow at most one evaluation
//! in flight, since each one reads and then moves the latest pointer.

use crate::multiverse_error::{MultiverseError, StructuralError};
use crate::reorg::{branch_window, extension_window, fetch_window, WindowSpan};
use crate::sequence_validator::validate_sequence;
use crate::structural::check_block;
use bc_common::child_headers::{height_sum, highest_per_chain, lowest_per_chain};
use bc_common::{
    Block, BlockKey, BlockSource, ChainId, ChainState, ChildHeader, ConsensusParams, Hash256,
    PutOptions, ReorgWindow, ScheduleEntry, Storage, SyncStatus, ValidationReport,
};
use bc_module_coinbase_gate::coinbase_error::CoinbaseError;
use bc_module_coinbase_gate::{CoinbaseGate, CoinbaseOutcome, Deferral};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Why a block was turned down, by decision tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    Missing,
    /// Already the latest block or part of the candidate chain
    Duplicate,
    Structural(StructuralError),
    /// Does not continue from the parent it shares with latest
    Sequence,
    Coinbase(CoinbaseError),
    HeightSum { new: u64, latest: u64 },
    Difficulty,
    TotalDistance,
    /// Latest moved while the block was being evaluated
    Stale,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Missing => f.write_str("no block"),
            RejectReason::Duplicate => f.write_str("duplicate"),
            RejectReason::Structural(e) => write!(f, "structure: {e}"),
            RejectReason::Sequence => f.write_str("extension: sequence invalid against parent"),
            RejectReason::Coinbase(e) => write!(f, "extension: {e}"),
            RejectReason::HeightSum { new, latest } => {
                write!(f, "height sum: {new} below latest {latest}")
            }
            RejectReason::Difficulty => f.write_str("difficulty: not above latest"),
            RejectReason::TotalDistance => f.write_str("total distance: not above latest"),
            RejectReason::Stale => f.write_str("stale: latest moved during evaluation"),
        }
    }
}

/// Why a block was set aside undecided. The caller resubmits later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferReason {
    /// A peer-driven range fetch is still running
    PeerSync { peer: String },
    /// The sync peer went away; a scan of local history was requested instead
    PeerExpired,
    Coinbase(Deferral),
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferReason::PeerSync { peer } => write!(f, "sync with {peer} in progress"),
            DeferReason::PeerExpired => f.write_str("sync peer expired"),
            DeferReason::Coinbase(d) => write!(f, "coinbase: {d}"),
        }
    }
}

/// What an `extend` evaluation decided
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendResult {
    /// Block became the canonical latest
    pub stored: bool,
    pub needs_resync: bool,
    pub range_request: Option<ReorgWindow>,
    pub schedules: Vec<ScheduleEntry>,
    pub sync_complete: bool,
    /// Accepted in place of a sibling rather than on top of the tip
    pub spliced: bool,
    pub rejected: Option<RejectReason>,
    pub deferred: Option<DeferReason>,
}

impl ExtendResult {
    fn rejected(block: &Block, reason: RejectReason) -> Self {
        info!(height = block.height, hash = %block.hash, "Rejected, {reason}");
        Self {
            rejected: Some(reason),
            ..Self::default()
        }
    }

    fn deferred(block: &Block, reason: DeferReason) -> Self {
        info!(height = block.height, hash = %block.hash, "Deferred, {reason}");
        Self {
            deferred: Some(reason),
            ..Self::default()
        }
    }

    fn resync(window: ReorgWindow, schedules: Vec<ScheduleEntry>) -> Self {
        Self {
            needs_resync: true,
            range_request: Some(window),
            schedules,
            ..Self::default()
        }
    }
}

/// Whether `candidate` on another branch beats `incumbent`: height sum first,
/// then difficulty, then total distance
pub fn prefer_branch(candidate: &Block, incumbent: &Block) -> Result<(), RejectReason> {
    let (new, latest) = (height_sum(candidate), height_sum(incumbent));
    match new.cmp(&latest) {
        Ordering::Greater => Ok(()),
        Ordering::Less => Err(RejectReason::HeightSum { new, latest }),
        Ordering::Equal => match candidate.difficulty.cmp(&incumbent.difficulty) {
            Ordering::Greater => Ok(()),
            Ordering::Less => Err(RejectReason::Difficulty),
            Ordering::Equal if candidate.total_distance > incumbent.total_distance => Ok(()),
            Ordering::Equal => Err(RejectReason::TotalDistance),
        },
    }
}

/// Saturates instead of truncating
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(millis).unwrap_or(0)
}

pub struct Multiverse {
    storage: Arc<dyn Storage>,
    chain_state: Arc<dyn ChainState>,
    gate: CoinbaseGate,
    params: ConsensusParams,
    /// Preferred chain, highest first
    candidate: Vec<Block>,
}

impl Multiverse {
    pub fn new(
        storage: Arc<dyn Storage>,
        chain_state: Arc<dyn ChainState>,
        gate: CoinbaseGate,
        params: ConsensusParams,
    ) -> Self {
        Self {
            storage,
            chain_state,
            gate,
            params,
            candidate: Vec::new(),
        }
    }

    pub fn candidate(&self) -> &[Block] {
        &self.candidate
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    /// Evaluate `new_block` against the canonical latest block.
    ///
    /// With `update_storage` false nothing is written: the coinbase gate is
    /// skipped, windows are computed but not opened, and `stored` reports that
    /// the block would have become latest.
    pub async fn extend(
        &mut self,
        new_block: Option<&Block>,
        source: BlockSource,
        update_storage: bool,
    ) -> Result<ExtendResult, MultiverseError> {
        let Some(block) = new_block else {
            info!(?source, "Rejected, {}", RejectReason::Missing);
            return Ok(ExtendResult {
                rejected: Some(RejectReason::Missing),
                ..ExtendResult::default()
            });
        };
        debug!(height = block.height, hash = %block.hash, ?source, "Evaluating block");

        let Some(latest) = self.storage.get(BlockKey::Latest).await? else {
            if block.height == 1 {
                return self.bootstrap(block, update_storage).await;
            }
            return Err(MultiverseError::NoLatestBlock);
        };

        // Fast rejects
        if latest.hash == block.hash || self.candidate.iter().any(|b| b.hash == block.hash) {
            return Ok(ExtendResult::rejected(block, RejectReason::Duplicate));
        }
        if let Err(e) = check_block(block) {
            return Ok(ExtendResult::rejected(block, RejectReason::Structural(e)));
        }

        // Sync phase gating
        let markers = self.chain_state.get_sync_markers().await?;
        if let Some(peer) = &markers.initial_peer {
            if peer.is_expired(now_ms()) {
                if update_storage {
                    self.chain_state.clear_initial_peer().await?;
                }
                if markers.initial_sync == SyncStatus::Pending {
                    let span = fetch_window(
                        latest.height.saturating_sub(self.params.reorg_fetch_span),
                        &self.params,
                    );
                    let window = self.open_scan(span, update_storage).await?;
                    return Ok(ExtendResult {
                        needs_resync: true,
                        range_request: Some(window),
                        ..ExtendResult::deferred(block, DeferReason::PeerExpired)
                    });
                }
            } else if self.chain_state.get_range_lowest_height(ChainId::Primary).await?.is_some() {
                let reason = DeferReason::PeerSync {
                    peer: peer.address.clone(),
                };
                return Ok(ExtendResult::deferred(block, reason));
            }
        }

        // Reorg already in progress: keep fetching from the checkpoint
        if markers.initial_sync == SyncStatus::Reorg && latest.height > self.params.reorg_min_depth
        {
            let checkpoint = self
                .chain_state
                .get_range_lowest_height(ChainId::Primary)
                .await?
                .unwrap_or(latest.height);
            let span = fetch_window(checkpoint, &self.params);
            let from = self.local_block_at(&latest, span.lowest).await?;
            let window = self.open_range(span, &from, block, update_storage).await?;
            return Ok(ExtendResult::resync(window, Vec::new()));
        }

        // Immediate extension
        let extends = block.previous_hash == latest.hash;
        let naive = self.params.naive_mode && block.total_distance > latest.total_distance;
        if extends || naive {
            let parent = if extends {
                Some(latest.clone())
            } else {
                self.storage.get_block_by_hash(&block.previous_hash, ChainId::Primary).await?
            };
            let report = match &parent {
                Some(parent) => self.validate_against(block, parent).await?,
                None => ValidationReport::invalid(),
            };
            if report.valid {
                return self.admit(block, &latest, !extends, update_storage).await;
            }

            let span = extension_window(block.height, latest.height);
            let from = self.local_block_at(&latest, span.lowest).await?;
            let window = self.open_range(span, &from, block, update_storage).await?;
            info!(
                height = block.height,
                schedules = report.schedules.len(),
                "Extension failed sequence validation"
            );
            return Ok(ExtendResult::resync(window, report.schedules));
        }

        // Another branch
        if let Err(reason) = prefer_branch(block, &latest) {
            return Ok(ExtendResult::rejected(block, reason));
        }
        info!(height = block.height, hash = %block.hash, "Stronger branch than latest");
        if update_storage {
            self.storage.put_block(block, PutOptions::default()).await?;
        }

        if latest.previous_hash == block.previous_hash {
            let parent =
                self.storage.get_block_by_hash(&block.previous_hash, ChainId::Primary).await?;
            let report = match &parent {
                Some(parent) => self.validate_against(block, parent).await?,
                None => ValidationReport::invalid(),
            };
            if !report.valid {
                return Ok(ExtendResult {
                    schedules: report.schedules,
                    ..ExtendResult::rejected(block, RejectReason::Sequence)
                });
            }
            return self.admit(block, &latest, true, update_storage).await;
        }

        let span = branch_window(block.height, latest.height, &self.params);
        let from = self.local_block_at(&latest, span.lowest).await?;
        let window = self.open_range(span, &from, block, update_storage).await?;
        Ok(ExtendResult::resync(window, Vec::new()))
    }

    /// Reconcile a rover header with the child header embedded in latest.
    ///
    /// Returns false while no confirming sequence is known yet.
    pub async fn compress(
        &mut self,
        header: &ChildHeader,
        pending: &[ChildHeader],
    ) -> Result<bool, MultiverseError> {
        let chain = header.chain;
        if !chain.is_child() {
            return Ok(false);
        }
        let latest = self.storage.get(BlockKey::Latest).await?.ok_or(MultiverseError::NoLatestBlock)?;
        let Some(local) = latest.headers(chain).iter().max_by_key(|h| h.height).cloned() else {
            return Ok(false);
        };

        if local.height + 1 != header.height {
            debug!(%chain, local = local.height, reported = header.height, "Header not adjacent");
            return Ok(false);
        }
        if header.previous_hash == local.hash {
            debug!(%chain, height = header.height, "Header already aligned");
            return Ok(true);
        }

        // An alternative at the same height that does follow the local header
        let alternatives = self.known_headers(chain, header.height, pending).await?;
        if let Some(alternative) = alternatives.into_iter().find(|h| h.previous_hash == local.hash) {
            if !self.gate.validate_coinbase(&latest).await? {
                return Ok(false);
            }
            if !self.latest_unchanged(&latest).await? {
                return Ok(false);
            }
            self.storage.put_latest_child_header(&alternative, PutOptions::default()).await?;
            info!(%chain, height = alternative.height, hash = %alternative.hash, "Rebased onto alternative header");
            return Ok(true);
        }

        // A root one lower that bridges to the reported header
        let below = self.known_headers(chain, header.height - 1, pending).await?;
        let Some(root) = below.into_iter().find(|h| h.hash == header.previous_hash) else {
            debug!(%chain, height = header.height, "Confirmative sequence pending");
            return Ok(false);
        };
        let Some(ancestor) = self.find_embedding(&latest, &root).await? else {
            debug!(%chain, root = %root.hash, "No primary block embeds the root header");
            return Ok(false);
        };
        if !self.latest_unchanged(&latest).await? {
            return Ok(false);
        }

        self.storage.put_latest_block(&ancestor, ChainId::Primary, PutOptions::default()).await?;
        self.chain_state.set_latest_block(ChainId::Primary, ancestor.height, ancestor.hash).await?;
        self.storage.put_latest_child_header(&root, PutOptions::default()).await?;
        self.candidate.retain(|b| b.height <= ancestor.height);
        if self.candidate.first().map(|b| b.hash) != Some(ancestor.hash) {
            self.candidate = vec![ancestor.clone()];
        }
        info!(%chain, height = ancestor.height, hash = %ancestor.hash, "Latest moved back to root");
        Ok(true)
    }

    /// Complete a branch switch once the requested range has been fetched.
    /// `branch` may come in any order.
    pub async fn accept_reorg(&mut self, branch: &[Block]) -> Result<bool, MultiverseError> {
        let mut blocks: Vec<&Block> = branch.iter().collect();
        blocks.sort_by(|a, b| b.height.cmp(&a.height));
        let (Some(tip), Some(base)) = (blocks.first().copied(), blocks.last().copied()) else {
            return Ok(false);
        };
        for block in &blocks {
            if let Err(e) = check_block(block) {
                warn!(height = block.height, "Reorg branch rejected, structure: {e}");
                return Ok(false);
            }
        }

        let mut fetched = self
            .storage
            .get_bulk(&[BlockKey::Latest, BlockKey::Hash(base.previous_hash)])
            .await?
            .into_iter();
        let latest = fetched.next().flatten().ok_or(MultiverseError::NoLatestBlock)?;
        let stored_root = fetched.next().flatten();
        if tip.hash == latest.hash {
            debug!(height = tip.height, "Reorg branch tip is already latest");
            return Ok(false);
        }

        let root = if base.height <= 1 {
            None
        } else {
            match stored_root {
                Some(root) => Some(root),
                None => {
                    info!(height = base.height, "Reorg branch does not link to a stored block");
                    return Ok(false);
                }
            }
        };

        let mut sequence = blocks.clone();
        let mut mount = None;
        if let Some(root) = &root {
            mount = self.find_mount(base, root).await?;
            sequence.push(root);
        }
        if sequence.len() >= 2 {
            let report = validate_sequence(&sequence, mount.as_ref(), &self.params);
            if !report.valid {
                info!(height = tip.height, "Reorg branch failed sequence validation");
                return Ok(false);
            }
        }

        if let Err(reason) = prefer_branch(tip, &latest) {
            info!(height = tip.height, "Reorg branch rejected, {reason}");
            return Ok(false);
        }

        for block in blocks.iter().rev() {
            self.storage.put_block(block, PutOptions::default()).await?;
        }
        match self.gate.check(tip).await? {
            CoinbaseOutcome::Valid => {}
            CoinbaseOutcome::Deferred(d) => {
                info!(height = tip.height, "Reorg branch deferred, coinbase: {d}");
                return Ok(false);
            }
            CoinbaseOutcome::Invalid(e) => {
                info!(height = tip.height, "Reorg branch rejected, {e}");
                return Ok(false);
            }
        }
        if !self.latest_unchanged(&latest).await? {
            return Ok(false);
        }

        self.storage.put_latest_block(tip, ChainId::Primary, PutOptions::default()).await?;
        self.chain_state.set_latest_block(ChainId::Primary, tip.height, tip.hash).await?;
        self.advance_rover_pointers(tip).await?;
        self.advance_sync_edge(tip).await?;
        self.chain_state.close_block_range_request(ChainId::Primary).await?;
        if self.chain_state.get_sync_markers().await?.initial_sync == SyncStatus::Reorg {
            self.chain_state.set_initial_sync(SyncStatus::Complete).await?;
        }

        self.candidate = blocks.into_iter().cloned().chain(root).collect();
        self.candidate.truncate(self.params.candidate_length.max(1));
        info!(height = tip.height, hash = %tip.hash, from = base.height, "Reorg completed");
        Ok(true)
    }

    /// First block on an empty store
    async fn bootstrap(
        &mut self,
        block: &Block,
        update_storage: bool,
    ) -> Result<ExtendResult, MultiverseError> {
        if let Err(e) = check_block(block) {
            return Ok(ExtendResult::rejected(block, RejectReason::Structural(e)));
        }
        if update_storage {
            self.storage.put_latest_block(block, ChainId::Primary, PutOptions::default()).await?;
            self.chain_state.set_latest_block(ChainId::Primary, block.height, block.hash).await?;
            self.advance_rover_pointers(block).await?;
            self.candidate = vec![block.clone()];
        }
        info!(hash = %block.hash, "Genesis stored");
        Ok(ExtendResult {
            stored: true,
            ..ExtendResult::default()
        })
    }

    /// Run the coinbase gate and move latest to `block`
    async fn admit(
        &mut self,
        block: &Block,
        latest: &Block,
        spliced: bool,
        update_storage: bool,
    ) -> Result<ExtendResult, MultiverseError> {
        if update_storage {
            match self.gate.check(block).await? {
                CoinbaseOutcome::Valid => {}
                CoinbaseOutcome::Deferred(d) => {
                    return Ok(ExtendResult::deferred(block, DeferReason::Coinbase(d)))
                }
                CoinbaseOutcome::Invalid(e) => {
                    return Ok(ExtendResult::rejected(block, RejectReason::Coinbase(e)))
                }
            }
        }

        if !self.latest_unchanged(latest).await? {
            return Ok(ExtendResult::rejected(block, RejectReason::Stale));
        }

        let mut result = ExtendResult {
            stored: true,
            spliced,
            ..ExtendResult::default()
        };
        if !update_storage {
            return Ok(result);
        }

        self.storage.put_latest_block(block, ChainId::Primary, PutOptions::default()).await?;
        self.chain_state.set_latest_block(ChainId::Primary, block.height, block.hash).await?;
        self.advance_rover_pointers(block).await?;
        result.sync_complete = self.advance_sync_edge(block).await?;
        self.push_candidate(block, latest);

        info!(height = block.height, hash = %block.hash, spliced, "Block accepted");
        Ok(result)
    }

    /// Sequence check of `block` on top of `parent`, with a mount block when
    /// a child chain restarts below what the parent already reported
    async fn validate_against(
        &self,
        block: &Block,
        parent: &Block,
    ) -> Result<ValidationReport, MultiverseError> {
        let mount = self.find_mount(block, parent).await?;
        if let Some(mount) = &mount {
            debug!(height = block.height, mount = mount.height, "Validating through mount block");
        }
        Ok(validate_sequence(&[block, parent], mount.as_ref(), &self.params))
    }

    async fn find_mount(&self, block: &Block, parent: &Block) -> Result<Option<Block>, MultiverseError> {
        let lowest = lowest_per_chain(block);
        let highest = highest_per_chain(parent);
        let wanted: Vec<Hash256> = ChainId::CHILDREN
            .iter()
            .filter_map(|chain| {
                let (new, local) = (lowest.get(chain)?, highest.get(chain)?);
                let behind = new.height <= local.height
                    && new.previous_hash != local.hash
                    && new.hash != local.hash
                    && new.previous_hash != local.previous_hash;
                behind.then_some(new.previous_hash)
            })
            .collect();
        if wanted.is_empty() {
            return Ok(None);
        }

        for depth in 1..=self.params.mount_search_depth {
            let Some(ancestor) = self.storage.get_block_at_depth_from(parent, depth).await? else {
                break;
            };
            if ancestor.child_headers.values().flatten().any(|h| wanted.contains(&h.hash)) {
                return Ok(Some(ancestor));
            }
        }
        debug!(height = block.height, "No mount block found");
        Ok(None)
    }

    /// Primary block at or behind latest that embeds `header`
    async fn find_embedding(
        &self,
        latest: &Block,
        header: &ChildHeader,
    ) -> Result<Option<Block>, MultiverseError> {
        for depth in 0..=self.params.mount_search_depth {
            let Some(block) = self.storage.get_block_at_depth_from(latest, depth).await? else {
                break;
            };
            if block.headers(header.chain).iter().any(|h| h.hash == header.hash) {
                return Ok(Some(block));
            }
        }
        Ok(None)
    }

    /// Stored and pending headers of `chain` at `height`
    async fn known_headers(
        &self,
        chain: ChainId,
        height: u64,
        pending: &[ChildHeader],
    ) -> Result<Vec<ChildHeader>, MultiverseError> {
        let mut known = self.storage.get_child_headers_at_height(chain, height).await?;
        for header in pending.iter().filter(|h| h.chain == chain && h.height == height) {
            if !known.iter().any(|k| k.hash == header.hash) {
                known.push(header.clone());
            }
        }
        Ok(known)
    }

    /// The local block at `height`, falling back to latest
    async fn local_block_at(&self, latest: &Block, height: u64) -> Result<Block, MultiverseError> {
        if height >= latest.height {
            return Ok(latest.clone());
        }
        Ok(self
            .storage
            .get_block_at_depth_from(latest, latest.height - height)
            .await?
            .unwrap_or_else(|| latest.clone()))
    }

    /// Store the provisional blocks and open a range request for `span`
    async fn open_range(
        &self,
        span: WindowSpan,
        from: &Block,
        to: &Block,
        update_storage: bool,
    ) -> Result<ReorgWindow, MultiverseError> {
        let lowest_hash = (from.height == span.lowest).then_some(from.hash);
        let highest_hash = (to.height == span.highest).then_some(to.hash);
        if !update_storage {
            return Ok(ReorgWindow {
                chain: ChainId::Primary,
                lowest_height: span.lowest,
                highest_height: span.highest,
                lowest_hash,
                highest_hash,
                notify_rover: true,
            });
        }

        if let Some(reorg) = self.storage.put_reorg_blocks(from, to, PutOptions::default()).await? {
            debug!(from = reorg.from, to = to.height, "Provisional reorg blocks stored");
        }
        let window = self
            .chain_state
            .open_block_range_request(
                ChainId::Primary,
                span.highest,
                span.lowest,
                highest_hash,
                lowest_hash,
                true,
            )
            .await?;
        info!(
            lowest = window.lowest_height,
            highest = window.highest_height,
            "Requesting block range"
        );
        Ok(window)
    }

    /// Range request over local history, without provisional blocks
    async fn open_scan(
        &self,
        span: WindowSpan,
        update_storage: bool,
    ) -> Result<ReorgWindow, MultiverseError> {
        if !update_storage {
            return Ok(ReorgWindow {
                chain: ChainId::Primary,
                lowest_height: span.lowest,
                highest_height: span.highest,
                lowest_hash: None,
                highest_hash: None,
                notify_rover: false,
            });
        }
        let window = self
            .chain_state
            .open_block_range_request(ChainId::Primary, span.highest, span.lowest, None, None, false)
            .await?;
        info!(
            lowest = window.lowest_height,
            highest = window.highest_height,
            "Requesting reorg scan"
        );
        Ok(window)
    }

    /// False when the pointer on disk no longer matches the latest we started from
    async fn latest_unchanged(&self, latest: &Block) -> Result<bool, MultiverseError> {
        let on_disk = self.chain_state.get_latest_block_hash(ChainId::Primary).await?;
        if on_disk != Some(latest.hash) {
            warn!(
                captured = %latest.hash,
                on_disk = ?on_disk,
                "Latest moved during evaluation, discarding"
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Move each rover's latest pointer up to the block's highest header.
    /// Never regresses; a different hash at the same height wins.
    async fn advance_rover_pointers(&self, block: &Block) -> Result<(), MultiverseError> {
        for (chain, header) in highest_per_chain(block) {
            if block.headers(chain).is_empty() {
                continue;
            }
            let advance = match self.storage.get_latest_child_header(chain).await? {
                None => true,
                Some(current) => {
                    header.height > current.height
                        || (header.height == current.height && header.hash != current.hash)
                }
            };
            if advance {
                self.storage.put_latest_child_header(&header, PutOptions::default()).await?;
                debug!(%chain, height = header.height, hash = %header.hash, "Rover pointer advanced");
            }
        }
        Ok(())
    }

    /// Returns true when this block completed initial sync
    async fn advance_sync_edge(&self, block: &Block) -> Result<bool, MultiverseError> {
        let markers = self.chain_state.get_sync_markers().await?;
        let mut complete = false;
        if let Some(edge) = markers.sync_edge {
            if markers.initial_sync == SyncStatus::Pending && block.height >= edge {
                self.chain_state.set_initial_sync(SyncStatus::Complete).await?;
                info!(height = block.height, "Initial sync complete");
                complete = true;
            }
        }
        if markers.sync_edge.map_or(true, |edge| block.height > edge) {
            self.chain_state.set_sync_edge(block.height).await?;
        }
        Ok(complete)
    }

    fn push_candidate(&mut self, block: &Block, latest: &Block) {
        if self.candidate.is_empty() {
            self.candidate.push(latest.clone());
        }
        self.candidate.retain(|b| b.height < block.height);
        if self.candidate.first().map(|b| b.hash) != Some(block.previous_hash) {
            self.candidate.clear();
        }
        self.candidate.insert(0, block.clone());
        self.candidate.truncate(self.params.candidate_length.max(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bc_common::difficulty::expected_difficulty;
    use bc_common::memory_store::MemoryStore;
    use bc_common::PeerMarker;
    use bc_test_utils::{child_header, header_run, reseal, ChainBuilder, FixedFeeTxHandler};
    use dashu_int::UBig;
    use test_case::test_case;

    fn gate_over(store: &Arc<MemoryStore>, params: &ConsensusParams) -> CoinbaseGate {
        CoinbaseGate::new(
            store.clone(),
            store.clone(),
            Arc::new(FixedFeeTxHandler::default()),
            params.clone(),
        )
    }

    /// Store `chain` with its last block as latest
    async fn setup(builder: &ChainBuilder, chain: &[Block]) -> (Arc<MemoryStore>, Multiverse) {
        let store = Arc::new(MemoryStore::new());
        for block in chain {
            store.put_block(block, PutOptions::default()).await.unwrap();
        }
        if let Some(tip) = chain.last() {
            store.put_latest_block(tip, ChainId::Primary, PutOptions::default()).await.unwrap();
        }
        let gate = gate_over(&store, &builder.params);
        let multiverse = Multiverse::new(store.clone(), store.clone(), gate, builder.params.clone());
        (store, multiverse)
    }

    async fn latest(store: &MemoryStore) -> Block {
        store.get(BlockKey::Latest).await.unwrap().unwrap()
    }

    async fn extend(multiverse: &mut Multiverse, block: &Block) -> ExtendResult {
        multiverse.extend(Some(block), BlockSource::Miner, true).await.unwrap()
    }

    #[tokio::test]
    async fn extension_moves_latest_and_rover_pointers() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(10);
        let (store, mut multiverse) = setup(&builder, &chain).await;

        let next = builder.child(&chain[9]).advance(ChainId::Eth, 2).build();
        let result = extend(&mut multiverse, &next).await;

        assert!(result.stored);
        assert!(!result.spliced);
        assert!(!result.needs_resync);
        assert_eq!(latest(&store).await.hash, next.hash);
        assert!(store.are_utxos_saved_for_block(next.height, &next.hash).await.unwrap());

        let eth = store.get_latest_child_header(ChainId::Eth).await.unwrap().unwrap();
        assert_eq!(eth.height, 12);
        let btc = store.get_latest_child_header(ChainId::Btc).await.unwrap().unwrap();
        assert_eq!(btc.height, 11);
    }

    #[tokio::test]
    async fn candidate_chain_stays_linked() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(4);
        let (_store, mut multiverse) = setup(&builder, &chain).await;

        let mut tip = chain[3].clone();
        for _ in 0..6 {
            let next = builder.child(&tip).build();
            assert!(extend(&mut multiverse, &next).await.stored);
            tip = next;
        }

        let candidate = multiverse.candidate();
        assert_eq!(candidate.len(), 7);
        assert_eq!(candidate[0].hash, tip.hash);
        for pair in candidate.windows(2) {
            assert_eq!(pair[0].previous_hash, pair[1].hash);
            assert_eq!(pair[0].total_distance, &pair[1].total_distance + &pair[0].distance);
            assert_eq!(pair[0].coinbase_txs().count(), 1);
        }
    }

    #[tokio::test]
    async fn candidate_is_bounded() {
        let builder = ChainBuilder::new(ConsensusParams {
            candidate_length: 3,
            ..bc_test_utils::test_params()
        });
        let chain = builder.chain(2);
        let (_store, mut multiverse) = setup(&builder, &chain).await;

        let mut tip = chain[1].clone();
        for _ in 0..5 {
            let next = builder.child(&tip).build();
            extend(&mut multiverse, &next).await;
            tip = next;
        }
        assert_eq!(multiverse.candidate().len(), 3);
        assert_eq!(multiverse.candidate()[0].hash, tip.hash);
    }

    #[tokio::test]
    async fn missing_block_is_rejected() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(3);
        let (_store, mut multiverse) = setup(&builder, &chain).await;

        let result = multiverse.extend(None, BlockSource::Miner, true).await.unwrap();
        assert_eq!(result.rejected, Some(RejectReason::Missing));
        assert!(!result.stored);
    }

    #[tokio::test]
    async fn second_extend_is_duplicate_without_writes() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(5);
        let (store, mut multiverse) = setup(&builder, &chain).await;
        let next = builder.child(&chain[4]).build();

        assert!(extend(&mut multiverse, &next).await.stored);
        let writes = store.write_count();

        let again = extend(&mut multiverse, &next).await;
        assert!(!again.stored);
        assert_eq!(again.rejected, Some(RejectReason::Duplicate));
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn structurally_bad_block_is_rejected() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(5);
        let (store, mut multiverse) = setup(&builder, &chain).await;
        let mut next = builder.child(&chain[4]).build();
        next.chain_root = Hash256::new([3; 32]);

        let result = extend(&mut multiverse, &next).await;
        assert!(matches!(
            result.rejected,
            Some(RejectReason::Structural(StructuralError::ChainRoot { .. }))
        ));
        assert_eq!(latest(&store).await.hash, chain[4].hash);
    }

    #[tokio::test]
    async fn higher_height_sum_wins_despite_lower_distance() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(10);
        let (store, mut multiverse) = setup(&builder, &chain).await;

        let first = builder.child(&chain[9]).build();
        let second = builder.child(&chain[9]).fork(1).advance(ChainId::Btc, 3).distance(1).build();
        assert_eq!(first.height, 11);
        assert_eq!(first.previous_hash, second.previous_hash);
        assert!(height_sum(&second) > height_sum(&first));
        assert!(second.total_distance < first.total_distance);

        assert!(extend(&mut multiverse, &first).await.stored);
        let result = extend(&mut multiverse, &second).await;

        assert!(result.stored);
        assert!(result.spliced);
        assert_eq!(latest(&store).await.hash, second.hash);
        assert_eq!(multiverse.candidate()[0].hash, second.hash);
        assert_eq!(multiverse.candidate()[1].hash, chain[9].hash);

        // Same height, different hash: last writer wins
        let eth = store.get_latest_child_header(ChainId::Eth).await.unwrap().unwrap();
        assert_eq!(eth.hash, second.headers(ChainId::Eth)[0].hash);
        let btc = store.get_latest_child_header(ChainId::Btc).await.unwrap().unwrap();
        assert_eq!(btc.height, 13);
    }

    #[tokio::test]
    async fn lower_height_sum_never_wins() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(10);
        let (store, mut multiverse) = setup(&builder, &chain).await;

        let first = builder.child(&chain[9]).build();
        // Quicker block with more difficulty, but Btc did not move
        let weaker = builder
            .child(&chain[9])
            .fork(2)
            .advance(ChainId::Btc, 0)
            .timestamp(chain[9].timestamp + 2)
            .distance(50_000)
            .build();
        assert!(weaker.difficulty > first.difficulty);

        extend(&mut multiverse, &first).await;
        let result = extend(&mut multiverse, &weaker).await;
        assert!(matches!(result.rejected, Some(RejectReason::HeightSum { .. })));
        assert_eq!(latest(&store).await.hash, first.hash);
    }

    #[tokio::test]
    async fn equal_sums_break_on_difficulty() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(10);
        let (store, mut multiverse) = setup(&builder, &chain).await;
        let parent = &chain[9];

        let first = builder.child(parent).build();
        let slower = builder.child(parent).fork(1).timestamp(parent.timestamp + 40).build();
        let quicker = builder.child(parent).fork(2).timestamp(parent.timestamp + 2).build();
        assert_eq!(height_sum(&first), height_sum(&quicker));
        assert!(slower.difficulty < first.difficulty);
        assert!(quicker.difficulty > first.difficulty);

        extend(&mut multiverse, &first).await;
        assert_eq!(
            extend(&mut multiverse, &slower).await.rejected,
            Some(RejectReason::Difficulty)
        );
        assert!(extend(&mut multiverse, &quicker).await.stored);
        assert_eq!(latest(&store).await.hash, quicker.hash);
    }

    #[tokio::test]
    async fn equal_difficulty_breaks_on_total_distance() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(10);
        let (store, mut multiverse) = setup(&builder, &chain).await;
        let parent = &chain[9];

        let first = builder.child(parent).build();
        let shorter = builder.child(parent).fork(1).distance(10).build();
        let further = builder.child(parent).fork(2).distance(5_000).build();
        assert_eq!(first.difficulty, further.difficulty);

        extend(&mut multiverse, &first).await;
        assert_eq!(
            extend(&mut multiverse, &shorter).await.rejected,
            Some(RejectReason::TotalDistance)
        );
        assert!(extend(&mut multiverse, &further).await.stored);
        assert_eq!(latest(&store).await.hash, further.hash);
    }

    fn with_btc(builder: &ChainBuilder, parent: &Block, fork: u8, advance: u64) -> Block {
        builder.child(parent).fork(fork).advance(ChainId::Btc, advance).build()
    }

    #[test_case(2, None, None => Ok(()) ; "greater height sum")]
    #[test_case(0, None, None => Err(RejectReason::HeightSum { new: 54, latest: 55 }) ; "lower height sum")]
    #[test_case(1, Some(1), None => Ok(()) ; "higher difficulty")]
    #[test_case(1, Some(-1), None => Err(RejectReason::Difficulty) ; "lower difficulty")]
    #[test_case(1, Some(0), Some(1) => Ok(()) ; "further total distance")]
    #[test_case(1, Some(0), Some(0) => Err(RejectReason::TotalDistance) ; "equal everything")]
    fn tie_break_order(
        btc_advance: u64,
        difficulty_delta: Option<i64>,
        distance_delta: Option<u64>,
    ) -> Result<(), RejectReason> {
        let builder = ChainBuilder::default();
        let chain = builder.chain(10);
        let incumbent = with_btc(&builder, &chain[9], 0, 1);
        let mut candidate = with_btc(&builder, &chain[9], 1, btc_advance);
        if let Some(delta) = difficulty_delta {
            candidate.difficulty = match delta {
                d if d > 0 => &incumbent.difficulty + UBig::ONE,
                d if d < 0 => &incumbent.difficulty - UBig::ONE,
                _ => incumbent.difficulty.clone(),
            };
        }
        if let Some(delta) = distance_delta {
            candidate.total_distance = &incumbent.total_distance + UBig::from(delta);
        }
        prefer_branch(&candidate, &incumbent)
    }

    #[tokio::test]
    async fn failed_extension_opens_window() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(10);
        let (store, mut multiverse) = setup(&builder, &chain).await;
        let bad = builder.child(&chain[9]).difficulty(1_234_567).build();

        let result = extend(&mut multiverse, &bad).await;
        assert!(!result.stored);
        assert!(result.needs_resync);
        let window = result.range_request.unwrap();
        assert_eq!((window.lowest_height, window.highest_height), (9, 11));
        assert_eq!(window.highest_hash, Some(bad.hash));
        assert_eq!(window.lowest_hash, Some(chain[8].hash));
        assert_eq!(store.range_request(ChainId::Primary), Some(window));
        assert_eq!(latest(&store).await.hash, chain[9].hash);
    }

    #[tokio::test]
    async fn header_gap_schedules_resync() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(10);
        let (_store, mut multiverse) = setup(&builder, &chain).await;
        let mut next = builder.child(&chain[9]).build();
        let mut orphan = child_header(ChainId::Lsk, 11, 9, Hash256::new([0x55; 32]));
        orphan.timestamp = next.timestamp * 1_000;
        next.child_headers.insert(ChainId::Lsk, vec![orphan]);
        reseal(&mut next);

        let result = extend(&mut multiverse, &next).await;
        assert!(result.needs_resync);
        assert_eq!(result.schedules.len(), 1);
        assert_eq!(result.schedules[0].target_chain, ChainId::Lsk);
        assert_eq!(result.schedules[0].height, 10);
        assert_eq!(result.schedules[0].reference_hash, next.hash);
    }

    /// Btc restarts from the header embedded two blocks below latest
    fn restarted(builder: &ChainBuilder, chain: &[Block]) -> Block {
        let parent = &chain[9];
        let btc8 = chain[7].headers(ChainId::Btc)[0].clone();
        let mut next = builder.child(parent).build();
        let mut restart = header_run(&btc8, 3, 5);
        for header in &mut restart {
            header.timestamp = next.timestamp * 1_000;
        }
        next.child_headers.insert(ChainId::Btc, restart);
        reseal(&mut next);
        next.difficulty = expected_difficulty(&builder.params, parent, &next);
        next
    }

    #[tokio::test]
    async fn mount_block_bridges_restarted_chain() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(10);
        let (store, mut multiverse) = setup(&builder, &chain).await;
        let next = restarted(&builder, &chain);

        let result = extend(&mut multiverse, &next).await;
        assert!(result.stored, "{result:?}");
        let btc = store.get_latest_child_header(ChainId::Btc).await.unwrap().unwrap();
        assert_eq!(btc.height, 11);
        assert_eq!(btc.hash, next.headers(ChainId::Btc)[2].hash);
    }

    #[tokio::test]
    async fn without_mount_restarted_chain_is_scheduled() {
        let builder = ChainBuilder::new(ConsensusParams {
            mount_search_depth: 1,
            ..bc_test_utils::test_params()
        });
        let chain = builder.chain(10);
        let (_store, mut multiverse) = setup(&builder, &chain).await;
        let next = restarted(&builder, &chain);

        let result = extend(&mut multiverse, &next).await;
        assert!(!result.stored);
        assert!(result.needs_resync);
        assert_eq!(result.schedules.len(), 1);
        assert_eq!(result.schedules[0].target_chain, ChainId::Btc);
    }

    /// Fork off `chain` after `from`, with Btc moving two headers per block
    fn fork_branch(builder: &ChainBuilder, chain: &[Block], from: usize, length: usize) -> Vec<Block> {
        let mut branch: Vec<Block> = Vec::new();
        for _ in 0..length {
            let parent = branch.last().unwrap_or(&chain[from]);
            let next = builder.child(parent).fork(1).advance(ChainId::Btc, 2).build();
            branch.push(next);
        }
        branch
    }

    #[tokio::test]
    async fn stronger_branch_requests_range_then_reorgs() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(10);
        let (store, mut multiverse) = setup(&builder, &chain).await;
        let branch = fork_branch(&builder, &chain, 7, 5);
        let tip = branch.last().unwrap().clone();
        assert_eq!(tip.height, 13);

        let result = extend(&mut multiverse, &tip).await;
        assert!(!result.stored);
        assert!(result.needs_resync);
        let window = result.range_request.unwrap();
        assert_eq!((window.lowest_height, window.highest_height), (9, 13));
        assert_eq!(window.lowest_hash, Some(chain[8].hash));
        assert!(store.range_request(ChainId::Primary).is_some());
        assert_eq!(latest(&store).await.hash, chain[9].hash);

        assert!(multiverse.accept_reorg(&branch).await.unwrap());
        assert_eq!(latest(&store).await.hash, tip.hash);
        assert!(store.range_request(ChainId::Primary).is_none());
        assert!(store.are_utxos_saved_for_block(tip.height, &tip.hash).await.unwrap());

        let candidate = multiverse.candidate();
        assert_eq!(candidate[0].hash, tip.hash);
        assert_eq!(candidate.last().map(|b| b.hash), Some(chain[7].hash));
        for pair in candidate.windows(2) {
            assert_eq!(pair[0].previous_hash, pair[1].hash);
        }
    }

    #[tokio::test]
    async fn reorg_needs_stored_root_and_stronger_tip() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(10);
        let (store, mut multiverse) = setup(&builder, &chain).await;
        let branch = fork_branch(&builder, &chain, 7, 5);

        // Root missing
        assert!(!multiverse.accept_reorg(&branch[1..]).await.unwrap());

        // Weaker than latest
        let weak: Vec<Block> = vec![builder.child(&chain[7]).fork(2).build()];
        assert!(!multiverse.accept_reorg(&weak).await.unwrap());

        assert!(!multiverse.accept_reorg(&[]).await.unwrap());
        assert_eq!(latest(&store).await.hash, chain[9].hash);
    }

    #[tokio::test]
    async fn naive_mode_accepts_by_total_distance() {
        let builder = ChainBuilder::new(ConsensusParams {
            naive_mode: true,
            ..bc_test_utils::test_params()
        });
        let chain = builder.chain(10);
        let (store, mut multiverse) = setup(&builder, &chain).await;
        let parent = &chain[9];

        let first = builder.child(parent).build();
        extend(&mut multiverse, &first).await;

        // Loses every tie-break tier except total distance
        let heavy = builder
            .child(parent)
            .fork(5)
            .timestamp(parent.timestamp + 40)
            .distance(100_000)
            .build();
        assert!(prefer_branch(&heavy, &first).is_err());

        let result = extend(&mut multiverse, &heavy).await;
        assert!(result.stored);
        assert!(result.spliced);
        assert_eq!(latest(&store).await.hash, heavy.hash);
    }

    #[tokio::test]
    async fn invalid_coinbase_is_rejected() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(5);
        let (store, mut multiverse) = setup(&builder, &chain).await;
        let bad = builder.child(&chain[4]).nrg_grant(7).build();

        let result = extend(&mut multiverse, &bad).await;
        assert!(matches!(
            result.rejected,
            Some(RejectReason::Coinbase(CoinbaseError::GrantMismatch { .. }))
        ));
        assert_eq!(latest(&store).await.hash, chain[4].hash);
    }

    #[tokio::test]
    async fn held_simplex_defers() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(5);
        let (store, mut multiverse) = setup(&builder, &chain).await;
        store.try_set_simplex("miner").await.unwrap();
        let next = builder.child(&chain[4]).build();

        let result = extend(&mut multiverse, &next).await;
        assert_eq!(result.deferred, Some(DeferReason::Coinbase(Deferral::SimplexHeld)));
        assert!(!result.stored);
        assert_eq!(latest(&store).await.hash, chain[4].hash);
    }

    #[tokio::test]
    async fn moved_latest_discards_evaluation() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(5);
        let (store, _) = setup(&builder, &chain).await;
        // Chain state whose latest pointer is somewhere else
        let elsewhere = Arc::new(MemoryStore::new());
        let gate = gate_over(&store, &builder.params);
        let mut multiverse =
            Multiverse::new(store.clone(), elsewhere, gate, builder.params.clone());
        let next = builder.child(&chain[4]).build();

        let result = extend(&mut multiverse, &next).await;
        assert_eq!(result.rejected, Some(RejectReason::Stale));
        assert_eq!(latest(&store).await.hash, chain[4].hash);
    }

    #[tokio::test]
    async fn rejected_sibling_leaves_latest_applied() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(10);
        let (store, mut multiverse) = setup(&builder, &chain).await;
        let first = builder.child(&chain[9]).build();
        assert!(extend(&mut multiverse, &first).await.stored);
        let minted = store.get_nrg_minted_so_far().await.unwrap();

        let sibling = builder
            .child(&chain[9])
            .fork(1)
            .advance(ChainId::Btc, 3)
            .nrg_grant(7)
            .build();
        let result = extend(&mut multiverse, &sibling).await;

        assert!(matches!(
            result.rejected,
            Some(RejectReason::Coinbase(CoinbaseError::GrantMismatch { .. }))
        ));
        assert_eq!(latest(&store).await.hash, first.hash);
        assert!(store.are_utxos_saved_for_block(first.height, &first.hash).await.unwrap());
        assert_eq!(store.get_nrg_minted_so_far().await.unwrap(), minted);
    }

    #[tokio::test]
    async fn rejected_reorg_tip_leaves_latest_applied() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(10);
        let (store, mut multiverse) = setup(&builder, &chain).await;
        let first = builder.child(&chain[9]).build();
        assert!(extend(&mut multiverse, &first).await.stored);
        let minted = store.get_nrg_minted_so_far().await.unwrap();

        let mut branch = fork_branch(&builder, &chain, 7, 4);
        let bad = builder
            .child(&branch[3])
            .fork(1)
            .advance(ChainId::Btc, 2)
            .nrg_grant(7)
            .build();
        branch.push(bad);

        assert!(!multiverse.accept_reorg(&branch).await.unwrap());
        assert_eq!(latest(&store).await.hash, first.hash);
        for block in [&chain[8], &chain[9], &first] {
            assert!(store.are_utxos_saved_for_block(block.height, &block.hash).await.unwrap());
        }
        assert!(!store.are_utxos_saved_for_block(9, &branch[0].hash).await.unwrap());
        assert_eq!(store.get_nrg_minted_so_far().await.unwrap(), minted);
    }

    #[tokio::test]
    async fn height_leap_is_not_accepted() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(10);
        let (store, mut multiverse) = setup(&builder, &chain).await;
        let mut leap = builder.child(&chain[9]).build();
        leap.height = 200_000_000;

        let result = extend(&mut multiverse, &leap).await;
        assert!(!result.stored);
        assert!(result.schedules.is_empty());
        assert_eq!(latest(&store).await.hash, chain[9].hash);
    }

    #[test]
    fn millis_saturate() {
        assert_eq!(millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn open_peer_sync_defers() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(5);
        let (store, mut multiverse) = setup(&builder, &chain).await;
        store
            .set_initial_peer(PeerMarker {
                address: "peer-a".to_string(),
                expires_at: u64::MAX,
            })
            .await;
        store.open_block_range_request(ChainId::Primary, 20, 12, None, None, false).await.unwrap();
        let writes = store.write_count();

        let next = builder.child(&chain[4]).build();
        let result = extend(&mut multiverse, &next).await;
        assert_eq!(
            result.deferred,
            Some(DeferReason::PeerSync {
                peer: "peer-a".to_string()
            })
        );
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn expired_peer_requests_scan() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(5);
        let (store, mut multiverse) = setup(&builder, &chain).await;
        store
            .set_initial_peer(PeerMarker {
                address: "peer-a".to_string(),
                expires_at: 0,
            })
            .await;

        let next = builder.child(&chain[4]).build();
        let result = extend(&mut multiverse, &next).await;
        assert_eq!(result.deferred, Some(DeferReason::PeerExpired));
        assert!(result.needs_resync);
        assert!(store.get_sync_markers().await.unwrap().initial_peer.is_none());
        assert!(store.range_request(ChainId::Primary).is_some());
        assert_eq!(latest(&store).await.hash, chain[4].hash);
    }

    #[tokio::test]
    async fn active_reorg_fetches_from_checkpoint() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(10);
        let (store, mut multiverse) = setup(&builder, &chain).await;
        store.set_initial_sync(SyncStatus::Reorg).await.unwrap();
        store.open_block_range_request(ChainId::Primary, 8, 6, None, None, true).await.unwrap();

        let next = builder.child(&chain[9]).build();
        let result = extend(&mut multiverse, &next).await;
        assert!(result.needs_resync);
        assert!(!result.stored);
        let window = result.range_request.unwrap();
        assert_eq!((window.lowest_height, window.highest_height), (6, 16));
        assert_eq!(window.lowest_hash, Some(chain[5].hash));
        assert_eq!(latest(&store).await.hash, chain[9].hash);
    }

    #[tokio::test]
    async fn reaching_sync_edge_completes_sync() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(10);
        let (store, mut multiverse) = setup(&builder, &chain).await;
        store.set_sync_edge(11).await.unwrap();

        let next = builder.child(&chain[9]).build();
        let result = extend(&mut multiverse, &next).await;
        assert!(result.stored);
        assert!(result.sync_complete);
        let markers = store.get_sync_markers().await.unwrap();
        assert_eq!(markers.initial_sync, SyncStatus::Complete);
        assert_eq!(markers.sync_edge, Some(11));

        let after = builder.child(&next).build();
        let result = extend(&mut multiverse, &after).await;
        assert!(!result.sync_complete);
        assert_eq!(store.get_sync_markers().await.unwrap().sync_edge, Some(12));
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(5);
        let (store, mut multiverse) = setup(&builder, &chain).await;
        let writes = store.write_count();
        let next = builder.child(&chain[4]).build();

        let result = multiverse.extend(Some(&next), BlockSource::Miner, false).await.unwrap();
        assert!(result.stored);
        assert_eq!(store.write_count(), writes);
        assert_eq!(latest(&store).await.hash, chain[4].hash);
        assert!(!store.are_utxos_saved_for_block(next.height, &next.hash).await.unwrap());
    }

    #[tokio::test]
    async fn empty_store_takes_genesis_only() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(2);
        let (store, mut multiverse) = setup(&builder, &[]).await;

        assert!(matches!(
            multiverse.extend(Some(&chain[1]), BlockSource::Miner, true).await,
            Err(MultiverseError::NoLatestBlock)
        ));

        let result = extend(&mut multiverse, &chain[0]).await;
        assert!(result.stored);
        assert_eq!(latest(&store).await.hash, chain[0].hash);
        assert!(extend(&mut multiverse, &chain[1]).await.stored);
    }

    #[tokio::test]
    async fn compress_aligned_header_is_a_no_op() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(10);
        let (store, mut multiverse) = setup(&builder, &chain).await;
        let local = chain[9].headers(ChainId::Btc)[0].clone();
        let writes = store.write_count();

        let header = child_header(ChainId::Btc, 11, 0, local.hash);
        assert!(multiverse.compress(&header, &[]).await.unwrap());
        assert_eq!(store.write_count(), writes);

        let far = child_header(ChainId::Btc, 13, 0, local.hash);
        assert!(!multiverse.compress(&far, &[]).await.unwrap());
    }

    #[tokio::test]
    async fn compress_rebases_onto_pending_alternative() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(10);
        let (store, mut multiverse) = setup(&builder, &chain).await;
        let local = chain[9].headers(ChainId::Btc)[0].clone();

        let reported = child_header(ChainId::Btc, 11, 3, Hash256::new([1; 32]));
        let alternative = child_header(ChainId::Btc, 11, 4, local.hash);
        let unrelated = child_header(ChainId::Eth, 11, 4, Hash256::new([2; 32]));

        assert!(multiverse
            .compress(&reported, &[unrelated, alternative.clone()])
            .await
            .unwrap());
        assert_eq!(store.get_latest_child_header(ChainId::Btc).await.unwrap(), Some(alternative));
        assert_eq!(latest(&store).await.hash, chain[9].hash);
        assert!(store.are_utxos_saved_for_block(10, &chain[9].hash).await.unwrap());
    }

    #[tokio::test]
    async fn compress_rebase_discarded_when_latest_moved() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(10);
        let (store, _) = setup(&builder, &chain).await;
        let elsewhere = Arc::new(MemoryStore::new());
        let gate = gate_over(&store, &builder.params);
        let mut multiverse =
            Multiverse::new(store.clone(), elsewhere, gate, builder.params.clone());
        let local = chain[9].headers(ChainId::Btc)[0].clone();
        let before = store.get_latest_child_header(ChainId::Btc).await.unwrap();

        let reported = child_header(ChainId::Btc, 11, 3, Hash256::new([1; 32]));
        let alternative = child_header(ChainId::Btc, 11, 4, local.hash);

        assert!(!multiverse.compress(&reported, &[alternative]).await.unwrap());
        assert_eq!(store.get_latest_child_header(ChainId::Btc).await.unwrap(), before);
    }

    #[tokio::test]
    async fn compress_moves_latest_back_to_root() {
        let builder = ChainBuilder::default();
        let mut chain = builder.chain(8);
        // Block 9 reports Btc 9 and 10; block 10 swaps in an uncle at 10
        let nine = builder.child(&chain[7]).advance(ChainId::Btc, 2).build();
        let btc9 = nine.headers(ChainId::Btc)[0].clone();
        let root = nine.headers(ChainId::Btc)[1].clone();
        let mut ten = builder.child(&nine).advance(ChainId::Btc, 0).build();
        let mut uncle = child_header(ChainId::Btc, 10, 8, btc9.hash);
        uncle.timestamp = ten.timestamp * 1_000;
        ten.child_headers.insert(ChainId::Btc, vec![uncle]);
        reseal(&mut ten);
        chain.push(nine.clone());
        chain.push(ten);
        let (store, mut multiverse) = setup(&builder, &chain).await;

        let reported = child_header(ChainId::Btc, 11, 0, root.hash);
        assert!(multiverse.compress(&reported, &[]).await.unwrap());
        assert_eq!(latest(&store).await.hash, nine.hash);
        assert_eq!(store.get_latest_child_header(ChainId::Btc).await.unwrap(), Some(root));
        assert_eq!(multiverse.candidate()[0].hash, nine.hash);
    }

    #[tokio::test]
    async fn compress_without_bridge_is_pending() {
        let builder = ChainBuilder::default();
        let chain = builder.chain(10);
        let (store, mut multiverse) = setup(&builder, &chain).await;
        let writes = store.write_count();

        let reported = child_header(ChainId::Neo, 11, 6, Hash256::new([9; 32]));
        assert!(!multiverse.compress(&reported, &[]).await.unwrap());
        assert_eq!(store.write_count(), writes);
        assert_eq!(latest(&store).await.hash, chain[9].hash);
    }
}
