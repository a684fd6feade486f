//! The engine: one worker that owns all gossip and reconciliation state.
//!
//! Each tick walks the same phases:
//!
//! ```text
//! REFRESH_FRIENDS → SELECT_PEER → POLL → DRAIN_CALLBACKS → PUBLISH_DUE → ADJUST_INTERVAL → SLEEP
//! ```
//!
//! DHT completions never touch engine state directly. They land on an
//! unbounded channel that the worker drains during `DRAIN_CALLBACKS`, so the
//! caches below need no locking.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use dhtchat_core::{
    Batch, BloomFilter, Canonical, DeviceId, FriendInfoList, GossipItem, GossipStatus, Keypair,
    Message, MessageEntry, MessageHash, MessageList, MutableDataWrapper, NewMsgSignal, PeerKey,
    Timestamp, WrapperPayload,
};
use dhtchat_store::{InsertResult, Repository, RepositoryExt};

use crate::channel::{self, build_batch, BatchLimits, PollTarget, PublishTarget};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{Result, SyncError};
use crate::events::{EventListener, MessageStatus};
use crate::gossip::{GossipBook, Observation, Origin, ReferralQueue, SeenSignals};
use crate::identity::IdentityProvider;
use crate::presence::PresenceTracker;
use crate::reconcile::{outbound_signal, reconcile, ReceiptTracker};
use crate::scheduler::{Candidates, IntervalController, PeerSelector, Selection, TickPhase};
use crate::transport::{Completion, DhtRequest, DhtResponse, Dht, GetTag, MutableItem, PutTag};

fn ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Work handed to the engine from outside its task.
#[derive(Debug, Clone)]
pub enum Command {
    /// A message we authored has been persisted and should go out.
    MessageStored { peer: PeerKey, message: Message },
}

/// Cloneable handle for submitting commands to a running engine.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<Command>,
    wake: Arc<Notify>,
}

impl CommandSender {
    /// Queue an outgoing message and wake the engine.
    ///
    /// Fails with [`SyncError::QueueFull`] instead of waiting when the engine
    /// is behind.
    pub fn message_stored(&self, peer: PeerKey, message: Message) -> Result<()> {
        self.tx
            .try_send(Command::MessageStored { peer, message })
            .map_err(|e| match e {
                TrySendError::Full(_) => SyncError::QueueFull,
                TrySendError::Closed(_) => SyncError::EngineStopped,
            })?;
        self.wake.notify_one();
        Ok(())
    }

    /// Cut the current sleep short.
    pub fn wake(&self) {
        self.wake.notify_one();
    }
}

/// Handle to a spawned engine task.
#[derive(Debug)]
pub struct EngineHandle {
    sender: CommandSender,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl EngineHandle {
    pub fn sender(&self) -> &CommandSender {
        &self.sender
    }

    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    /// Stop the engine, interrupting any sleep, and wait for the task to end.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.join.await.map_err(|_| SyncError::EngineStopped)
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub selection: Option<Selection>,
    /// DHT completions processed.
    pub responses: usize,
    /// Mutable items queued for publication.
    pub published: usize,
    /// How long to sleep before the next tick.
    pub next_interval: Duration,
}

/// A referenced message we still need to fetch.
#[derive(Debug, Clone, Copy)]
struct Demand {
    peer: PeerKey,
    retry_at: Timestamp,
    attempts: u32,
}

/// Everything derived from the current identity. Replaced wholesale on rotation.
#[derive(Debug)]
struct IdentityState {
    presence: PresenceTracker,
    gossip: GossipBook,
    referrals: ReferralQueue,
    seen: SeenSignals,
    receipts: ReceiptTracker,
    /// Latest hash-prefix array each peer published for us.
    remote_prefixes: HashMap<PeerKey, Vec<u8>>,
    /// Direct channels to republish at the next PUBLISH_DUE.
    pending: HashSet<PeerKey>,
    self_pending: bool,
    friend_info_pending: bool,
    /// Timestamp of the newest message we sent to each peer.
    last_sent: HashMap<PeerKey, Timestamp>,
    demanded: HashMap<MessageHash, Demand>,
    /// Referenced messages already re-put this session.
    republished: HashSet<MessageHash>,
    /// Peers whose next direct poll reads the previous epoch.
    fallback: HashSet<PeerKey>,
    known_devices: HashSet<DeviceId>,
    chatting: Option<(PeerKey, Timestamp)>,
    epoch: Option<u64>,
    last_gossip_publish: Option<Timestamp>,
}

impl IdentityState {
    fn new(seen_capacity: usize) -> Self {
        Self {
            presence: PresenceTracker::new(),
            gossip: GossipBook::new(),
            referrals: ReferralQueue::new(),
            seen: SeenSignals::new(seen_capacity),
            receipts: ReceiptTracker::new(),
            remote_prefixes: HashMap::new(),
            pending: HashSet::new(),
            self_pending: false,
            friend_info_pending: false,
            last_sent: HashMap::new(),
            demanded: HashMap::new(),
            republished: HashSet::new(),
            fallback: HashSet::new(),
            known_devices: HashSet::new(),
            chatting: None,
            epoch: None,
            last_gossip_publish: None,
        }
    }

    /// Purge all per-peer state for a removed friend.
    fn forget_peer(&mut self, peer: &PeerKey) {
        self.gossip.forget_peer(peer);
        self.referrals.remove(peer);
        self.receipts.forget(peer);
        self.remote_prefixes.remove(peer);
        self.pending.remove(peer);
        self.last_sent.remove(peer);
        self.fallback.remove(peer);
        self.demanded.retain(|_, d| &d.peer != peer);
        if self.chatting.map(|(p, _)| &p == peer).unwrap_or(false) {
            self.chatting = None;
        }
    }
}

/// The gossip and reconciliation engine.
pub struct Engine<R: Repository, D: Dht> {
    config: EngineConfig,
    repo: Arc<R>,
    dht: D,
    identity: watch::Receiver<Keypair>,
    keypair: Keypair,
    device_id: DeviceId,
    listener: Arc<dyn EventListener>,
    clock: Arc<dyn Clock>,
    commands_tx: mpsc::Sender<Command>,
    commands: mpsc::Receiver<Command>,
    wake: Arc<Notify>,
    responses_tx: mpsc::UnboundedSender<DhtResponse>,
    responses: mpsc::UnboundedReceiver<DhtResponse>,
    outbound: VecDeque<DhtRequest>,
    selector: PeerSelector,
    interval: IntervalController,
    state: IdentityState,
}

impl<R: Repository, D: Dht> Engine<R, D> {
    /// Create an engine. Nothing runs until [`Engine::tick`] or [`Engine::spawn`].
    pub fn new(
        config: EngineConfig,
        repo: Arc<R>,
        dht: D,
        identity: &dyn IdentityProvider,
        listener: Arc<dyn EventListener>,
        clock: Arc<dyn Clock>,
        device_id: DeviceId,
    ) -> Self {
        let (commands_tx, commands) = mpsc::channel(config.command_queue_capacity.max(1));
        let (responses_tx, responses) = mpsc::unbounded_channel();
        let selector = PeerSelector::new(config.weights, config.rng_seed);
        let interval = IntervalController::new(
            config.min_loop_interval,
            config.max_loop_interval,
            config.queue_threshold,
        );
        let state = IdentityState::new(config.seen_signal_capacity);

        Self {
            repo,
            dht,
            identity: identity.subscribe(),
            keypair: identity.current(),
            device_id,
            listener,
            clock,
            commands_tx,
            commands,
            wake: Arc::new(Notify::new()),
            responses_tx,
            responses,
            outbound: VecDeque::new(),
            selector,
            interval,
            state,
            config,
        }
    }

    pub fn public_key(&self) -> PeerKey {
        self.keypair.public_key()
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.state.presence
    }

    pub fn gossip(&self) -> &GossipBook {
        &self.state.gossip
    }

    pub fn referrals(&self) -> &ReferralQueue {
        &self.state.referrals
    }

    /// Requests waiting for the DHT queue to drain.
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn current_interval(&self) -> Duration {
        self.interval.current()
    }

    pub fn command_sender(&self) -> CommandSender {
        CommandSender {
            tx: self.commands_tx.clone(),
            wake: self.wake.clone(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tick
    // ─────────────────────────────────────────────────────────────────────────

    /// Run one full pass of the state machine.
    pub async fn tick(&mut self) -> Result<TickReport> {
        let now = self.clock.now_millis();
        let mut report = TickReport::default();
        self.check_identity();

        trace!(phase = %TickPhase::RefreshFriends);
        self.drain_commands();
        self.refresh_friends(now).await?;

        trace!(phase = %TickPhase::SelectPeer);
        report.selection = self.select_peer(now);

        trace!(phase = %TickPhase::Poll);
        if let Some(selection) = report.selection {
            self.poll(selection.target, now);
        }
        self.retry_demands(now);
        self.flush_outbound();

        trace!(phase = %TickPhase::DrainCallbacks);
        report.responses = self.drain_responses(now).await?;
        self.notify_presence();
        let pruned = self.state.gossip.prune(now, ms(self.config.gossip_horizon));
        if pruned > 0 {
            debug!(pruned, "aged out gossip pairs");
        }

        trace!(phase = %TickPhase::PublishDue);
        report.published = self.publish_due(now).await?;
        self.flush_outbound();

        trace!(phase = %TickPhase::AdjustInterval);
        report.next_interval = self.adjust_interval().await?;
        Ok(report)
    }

    /// Report a failed tick and drop back to the shortest interval.
    fn on_tick_error(&mut self, e: &SyncError) -> Duration {
        error!("tick failed: {}", e);
        self.listener.on_error(e);
        self.interval.reset()
    }

    /// Discard every per-identity cache if the key has rotated.
    fn check_identity(&mut self) {
        if !self.identity.has_changed().unwrap_or(false) {
            return;
        }
        let keypair = self.identity.borrow_and_update().clone();
        if keypair.public_key() == self.keypair.public_key() {
            return;
        }
        info!(
            old = %self.keypair.public_key(),
            new = %keypair.public_key(),
            "identity changed, clearing caches"
        );
        self.keypair = keypair;
        self.state = IdentityState::new(self.config.seen_signal_capacity);
        self.outbound.clear();
        while self.responses.try_recv().is_ok() {}
        self.interval.reset();
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::MessageStored { peer, message } => {
                    let hash = message.hash();
                    let value = message.to_canonical_bytes();
                    if value.len() > self.item_limit() {
                        warn!(%peer, %hash, size = value.len(), "message exceeds DHT item limit");
                        self.listener
                            .on_message_status(&peer, &hash, MessageStatus::Failed);
                        continue;
                    }
                    debug!(%peer, %hash, "publishing new message");
                    let sent = self.state.last_sent.entry(peer).or_insert(0);
                    *sent = (*sent).max(message.timestamp);
                    self.state.pending.insert(peer);
                    self.enqueue(DhtRequest::ImmutablePut {
                        value,
                        tag: PutTag::Message { peer, hash },
                    });
                }
            }
        }
    }

    async fn refresh_friends(&mut self, now: Timestamp) -> Result<()> {
        let friends = self.repo.list_friends().await?;
        let diff = self.state.presence.sync_friends(&friends);
        if !diff.is_empty() {
            debug!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                "friend list changed"
            );
            for peer in &diff.removed {
                self.state.forget_peer(peer);
            }
            self.state.pending.extend(diff.added.iter().copied());
            self.state.self_pending = true;
        }

        let chatting = self
            .repo
            .chatting_friend()
            .await?
            .filter(|p| self.state.presence.is_friend(p));
        let current = self.state.chatting.map(|(p, _)| p);
        if chatting != current {
            debug!(?chatting, "chatting friend changed");
            self.state.pending.extend(current);
            self.state.pending.extend(chatting);
            self.state.chatting = chatting.map(|p| (p, now));
        }

        let epoch = channel::epoch(now, self.config.time_slice_ms());
        if self.state.epoch != Some(epoch) {
            if self.state.epoch.is_some() {
                debug!(epoch, "channel epoch rolled over");
                for peer in self.state.presence.keys().to_vec() {
                    if self.state.last_sent.contains_key(&peer)
                        || !self.repo.latest_messages(&peer, 1).await?.is_empty()
                    {
                        self.state.pending.insert(peer);
                    }
                }
                self.state.self_pending = true;
                self.state.last_gossip_publish = None;
                self.state.fallback.clear();
            }
            self.state.epoch = Some(epoch);
        }
        Ok(())
    }

    fn select_peer(&mut self, now: Timestamp) -> Option<Selection> {
        let recently_active = self
            .state
            .presence
            .recently_active(now, ms(self.config.recently_active_window));
        let candidates = Candidates {
            chatting: self.state.chatting.map(|(p, _)| p),
            recently_active: &recently_active,
            friends: self.state.presence.keys(),
            include_self: self.config.self_sync,
        };
        let presence = &self.state.presence;
        self.selector
            .select(&candidates, &mut self.state.referrals, |peer| {
                !presence.is_cooling_down(peer, now)
            })
    }

    fn poll(&mut self, target: PollTarget, now: Timestamp) {
        let Some(current) = self.state.epoch else {
            return;
        };
        let epoch = match target {
            PollTarget::Direct(peer) if self.state.fallback.remove(&peer) => {
                current.saturating_sub(1)
            }
            _ => current,
        };
        let me = self.public_key();
        self.state
            .presence
            .mark_polled(target.peer().as_ref(), now + ms(self.config.poll_cooldown));
        trace!(?target, epoch, "polling channel");
        self.enqueue(DhtRequest::MutableGet {
            key: target.owner(&me),
            salt: target.salt(&me, epoch),
            tag: GetTag::Channel { target, epoch },
        });
    }

    fn retry_demands(&mut self, now: Timestamp) {
        let retry = ms(self.config.demand_retry_interval);
        let max_attempts = self.config.max_demand_attempts;
        // Exhausted demands stay recorded so later references do not restart them.
        let due: Vec<(MessageHash, PeerKey)> = self
            .state
            .demanded
            .iter_mut()
            .filter(|(_, d)| d.attempts < max_attempts && d.retry_at <= now)
            .map(|(hash, d)| {
                d.retry_at = now + retry;
                d.attempts += 1;
                if d.attempts == max_attempts {
                    warn!(peer = %d.peer, %hash, "last fetch of referenced message");
                }
                (*hash, d.peer)
            })
            .collect();
        for (hash, peer) in due {
            trace!(%hash, "retrying referenced message");
            self.enqueue(DhtRequest::ImmutableGet {
                hash,
                tag: GetTag::Message { peer, hash },
            });
        }
    }

    fn notify_presence(&mut self) {
        for (peer, timestamp) in self.state.presence.take_notifications() {
            self.listener.on_presence(&peer, timestamp);
        }
    }

    async fn adjust_interval(&mut self) -> Result<Duration> {
        let floor = self
            .repo
            .loop_interval_override()
            .await?
            .unwrap_or(self.config.min_loop_interval);
        self.interval.set_floor(floor);
        Ok(self
            .interval
            .adjust(self.dht.queue_occupation(), self.dht.queue_capacity()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Outbound queue
    // ─────────────────────────────────────────────────────────────────────────

    /// Largest encoded item we will hand to the DHT.
    fn item_limit(&self) -> usize {
        self.config.item_size_limit.min(self.dht.item_size_limit())
    }

    fn enqueue(&mut self, request: DhtRequest) {
        if self.outbound.len() >= self.config.outbound_queue_capacity {
            warn!(queued = self.outbound.len(), "outbound queue full, dropping request");
            if let DhtRequest::ImmutablePut {
                tag: PutTag::Message { peer, hash },
                ..
            } = &request
            {
                self.listener
                    .on_message_status(peer, hash, MessageStatus::Failed);
            }
            return;
        }
        self.outbound.push_back(request);
    }

    /// Hand queued requests to the DHT while its queue is below the threshold.
    fn flush_outbound(&mut self) {
        while !self.outbound.is_empty() {
            if !self
                .interval
                .admits(self.dht.queue_occupation(), self.dht.queue_capacity())
            {
                debug!(held = self.outbound.len(), "DHT queue saturated, holding requests");
                break;
            }
            if let Some(request) = self.outbound.pop_front() {
                self.dht
                    .submit(request, Completion::new(self.responses_tx.clone()));
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────────────────

    async fn drain_responses(&mut self, now: Timestamp) -> Result<usize> {
        let mut handled = 0;
        while let Ok(response) = self.responses.try_recv() {
            handled += 1;
            match response {
                DhtResponse::Mutable {
                    tag: GetTag::Channel { target, epoch },
                    item,
                } => self.on_channel_item(target, epoch, item, now).await?,
                DhtResponse::Immutable {
                    tag: GetTag::Message { peer, hash },
                    value,
                } => self.on_referenced_message(peer, hash, value).await?,
                DhtResponse::Put { tag, success } => self.on_put_complete(tag, success),
                other => warn!(?other, "response does not match its request kind"),
            }
        }
        Ok(handled)
    }

    async fn on_channel_item(
        &mut self,
        target: PollTarget,
        epoch: u64,
        item: Option<MutableItem>,
        now: Timestamp,
    ) -> Result<()> {
        let me = self.public_key();
        let Some(item) = item else {
            trace!(?target, epoch, "channel empty");
            if let PollTarget::Direct(peer) = target {
                if self.state.epoch == Some(epoch) {
                    self.state.fallback.insert(peer);
                }
            }
            return Ok(());
        };

        if item.key != target.owner(&me) || item.verify().is_err() {
            warn!(?target, "rejecting channel item with bad signature");
            return Ok(());
        }
        let batch = match Batch::from_canonical_bytes(&item.value) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(?target, "malformed batch: {}", e);
                return Ok(());
            }
        };

        match target {
            PollTarget::Direct(peer) => self.on_direct_batch(peer, batch, now).await,
            PollTarget::Gossip(peer) => {
                self.on_gossip_batch(peer, &batch);
                Ok(())
            }
            PollTarget::SelfSync => self.on_self_batch(&batch).await,
        }
    }

    async fn on_direct_batch(&mut self, peer: PeerKey, batch: Batch, now: Timestamp) -> Result<()> {
        if !self.state.presence.is_friend(&peer) {
            return Ok(());
        }
        for wrapper in &batch.wrappers {
            match &wrapper.payload {
                WrapperPayload::Signal(signal) => {
                    if self.state.seen.insert(wrapper.digest()) {
                        self.on_peer_signal(peer, wrapper.timestamp, signal, now)
                            .await?;
                    }
                }
                WrapperPayload::Messages(list) => self.on_message_list(peer, list, now).await?,
                WrapperPayload::FriendInfo(_) => {
                    debug!(%peer, "ignoring friend info on a direct channel")
                }
            }
        }
        Ok(())
    }

    async fn on_peer_signal(
        &mut self,
        peer: PeerKey,
        timestamp: Timestamp,
        signal: &NewMsgSignal,
        now: Timestamp,
    ) -> Result<()> {
        let me = self.public_key();
        self.state.presence.record_presence(&peer, timestamp);

        if signal
            .chatting_friend
            .map(|short| short.matches(&me))
            .unwrap_or(false)
        {
            self.state
                .presence
                .set_chatting(&peer, signal.chatting_timestamp);
            if now.saturating_sub(timestamp) <= ms(self.config.writing_window) {
                self.state.referrals.push(peer, true);
            }
        }

        self.absorb_gossip(&signal.gossip, peer);
        self.state
            .remote_prefixes
            .insert(peer, signal.hash_prefixes.clone());

        let window = self
            .repo
            .latest_messages(&peer, self.config.window_size)
            .await?;
        let result = reconcile(&window, &signal.hash_prefixes);
        if result.missing.iter().any(|m| m.sender == me) {
            self.state.pending.insert(peer);
        }

        let mine: HashSet<MessageHash> = window
            .iter()
            .filter(|m| m.sender == me)
            .map(Message::hash)
            .collect();
        let window_hashes: Vec<MessageHash> = window.iter().map(Message::hash).collect();
        let confirmed: Vec<MessageHash> = result
            .confirmed
            .into_iter()
            .filter(|h| mine.contains(h))
            .collect();
        for hash in self
            .state
            .receipts
            .record(&peer, &confirmed, &window_hashes)
        {
            self.listener.on_read_receipt(&peer, &hash, timestamp);
        }
        Ok(())
    }

    /// Absorb the gossip carried by a signal that `publisher` signed.
    fn absorb_gossip(&mut self, items: &[GossipItem], publisher: PeerKey) {
        let me = self.public_key();
        for item in items {
            let origin = Origin::of(item, &publisher);
            if let Observation::Referral { peer, writing } =
                self.state
                    .gossip
                    .observe(item, origin, &me, &self.state.presence)
            {
                trace!(%peer, writing, "gossip referral");
                self.state.referrals.push(peer, writing);
            }
        }
    }

    async fn on_message_list(
        &mut self,
        peer: PeerKey,
        list: &MessageList,
        now: Timestamp,
    ) -> Result<()> {
        for entry in &list.entries {
            match entry {
                MessageEntry::Inline(message) => {
                    self.accept_message(&peer, message).await?;
                }
                MessageEntry::Reference(hash) => {
                    if self.state.demanded.contains_key(hash)
                        || self.repo.has_message(hash).await?
                    {
                        continue;
                    }
                    debug!(%peer, %hash, "fetching referenced message");
                    self.state.demanded.insert(
                        *hash,
                        Demand {
                            peer,
                            retry_at: now + ms(self.config.demand_retry_interval),
                            attempts: 1,
                        },
                    );
                    self.enqueue(DhtRequest::ImmutableGet {
                        hash: *hash,
                        tag: GetTag::Message { peer, hash: *hash },
                    });
                }
            }
        }
        Ok(())
    }

    async fn on_referenced_message(
        &mut self,
        peer: PeerKey,
        hash: MessageHash,
        value: Option<Vec<u8>>,
    ) -> Result<()> {
        let Some(bytes) = value else {
            trace!(%hash, "referenced message not found yet");
            return Ok(());
        };
        if MessageHash::of(&bytes) != hash {
            warn!(%peer, %hash, "referenced message failed hash check");
            return Ok(());
        }
        self.state.demanded.remove(&hash);
        match Message::from_canonical_bytes(&bytes) {
            Ok(message) => {
                self.accept_message(&peer, &message).await?;
            }
            Err(e) => warn!(%peer, %hash, "malformed referenced message: {}", e),
        }
        Ok(())
    }

    /// Persist a message from `peer` after checking it is really addressed
    /// from them to us.
    async fn accept_message(&mut self, peer: &PeerKey, message: &Message) -> Result<bool> {
        let me = self.public_key();
        if message.sender != *peer || message.receiver != me {
            warn!(%peer, "dropping message with mismatched sender or receiver");
            return Ok(false);
        }
        if i64::try_from(message.timestamp).is_err() {
            warn!(
                %peer,
                timestamp = message.timestamp,
                "dropping message with unstorable timestamp"
            );
            return Ok(false);
        }
        match self.repo.save_message(peer, message).await? {
            InsertResult::Inserted => {
                debug!(%peer, hash = %message.hash(), "received message");
                self.listener.on_message(peer, message);
                self.state.pending.insert(*peer);
                Ok(true)
            }
            InsertResult::AlreadyExists => Ok(false),
        }
    }

    fn on_gossip_batch(&mut self, peer: PeerKey, batch: &Batch) {
        if !self.state.presence.is_friend(&peer) {
            return;
        }
        if let Some((wrapper, signal)) = batch.signal() {
            if self.state.seen.insert(wrapper.digest()) {
                self.state.presence.record_presence(&peer, wrapper.timestamp);
                self.absorb_gossip(&signal.gossip, peer);
            }
        }
    }

    async fn on_self_batch(&mut self, batch: &Batch) -> Result<()> {
        let me = self.public_key();
        if batch
            .signal()
            .map(|(_, signal)| signal.device_id == self.device_id)
            .unwrap_or(false)
        {
            return Ok(());
        }
        for wrapper in &batch.wrappers {
            match &wrapper.payload {
                WrapperPayload::Signal(signal) => {
                    if self.state.known_devices.insert(signal.device_id) {
                        info!(device = %signal.device_id, "new device detected");
                        self.listener.on_new_device(&signal.device_id);
                        // Announce ourselves back.
                        self.state.self_pending = true;
                    }
                    if let Some(digest) = &signal.friend_digest {
                        let lacking = self
                            .state
                            .presence
                            .keys()
                            .iter()
                            .any(|k| !digest.may_contain(k.as_bytes()));
                        if lacking {
                            debug!("other device lacks some friends, sharing friend list");
                            self.state.friend_info_pending = true;
                            self.state.self_pending = true;
                        }
                    }
                }
                WrapperPayload::FriendInfo(list) => {
                    for key in &list.friends {
                        if *key == me || self.state.presence.is_friend(key) {
                            continue;
                        }
                        if self.repo.add_friend(key).await? {
                            info!(friend = %key, "friend learned from another device");
                        }
                    }
                }
                WrapperPayload::Messages(_) => {}
            }
        }
        Ok(())
    }

    fn on_put_complete(&mut self, tag: PutTag, success: bool) {
        match tag {
            PutTag::Message { peer, hash } => {
                let status = if success {
                    MessageStatus::Published
                } else {
                    warn!(%peer, %hash, "message publish failed");
                    MessageStatus::Failed
                };
                self.listener.on_message_status(&peer, &hash, status);
            }
            PutTag::Channel(target) if !success => {
                warn!(?target, "channel publish failed, will retry");
                match target {
                    PublishTarget::Direct(peer) => {
                        if self.state.presence.is_friend(&peer) {
                            self.state.pending.insert(peer);
                        }
                    }
                    PublishTarget::SelfSync => self.state.self_pending = true,
                    PublishTarget::Gossip => self.state.last_gossip_publish = None,
                }
            }
            PutTag::Channel(target) => trace!(?target, "channel published"),
            PutTag::Reference(hash) => {
                if !success {
                    warn!(%hash, "referenced message publish failed");
                    self.state.republished.remove(&hash);
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Outbound
    // ─────────────────────────────────────────────────────────────────────────

    async fn publish_due(&mut self, now: Timestamp) -> Result<usize> {
        let mut published = 0;

        if self.config.self_sync && self.state.self_pending {
            self.state.self_pending = false;
            match self.publish_self(now) {
                Ok(()) => published += 1,
                Err(e) => warn!("self channel not published: {}", e),
            }
        }

        let mut due: Vec<PeerKey> = self.state.pending.drain().collect();
        due.sort_unstable_by(|a, b| b.cmp(a));
        while let Some(peer) = due.pop() {
            if !self.state.presence.is_friend(&peer) {
                continue;
            }
            match self.publish_direct(peer, now).await {
                Ok(()) => published += 1,
                Err(SyncError::PayloadTooLarge { size, limit }) => {
                    warn!(%peer, size, limit, "signal does not fit in one item");
                }
                Err(e) => {
                    self.state.pending.insert(peer);
                    self.state.pending.extend(due);
                    return Err(e);
                }
            }
        }

        let gossip_due = self
            .state
            .last_gossip_publish
            .map(|last| now.saturating_sub(last) >= ms(self.config.gossip_interval))
            .unwrap_or(true);
        if gossip_due {
            self.state.last_gossip_publish = Some(now);
            match self.publish_gossip(now) {
                Ok(()) => published += 1,
                Err(e) => warn!("gossip channel not published: {}", e),
            }
        }

        Ok(published)
    }

    /// Our own gossip item for `peer`: when we last wrote to them, and whether
    /// we are chatting with them now.
    fn own_gossip_item(&self, peer: &PeerKey) -> Option<GossipItem> {
        let chatting_since = self
            .state
            .chatting
            .filter(|(p, _)| p == peer)
            .map(|(_, since)| since);
        let timestamp = self.state.last_sent.get(peer).copied().or(chatting_since)?;
        let status = if chatting_since.is_some() {
            GossipStatus::OnWriting
        } else {
            GossipStatus::Unknown
        };
        Some(
            GossipItem::new(self.public_key().short_address(), peer.short_address(), timestamp)
                .with_status(status),
        )
    }

    async fn publish_direct(&mut self, peer: PeerKey, now: Timestamp) -> Result<()> {
        let me = self.public_key();
        let window = self
            .repo
            .latest_messages(&peer, self.config.window_size)
            .await?;

        let own = self.own_gossip_item(&peer);
        let gossip = self
            .state
            .gossip
            .for_peer(&peer, own, self.config.gossip_per_signal);
        let chatting = self
            .state
            .chatting
            .map(|(p, since)| (p.short_address(), since));
        let signal = outbound_signal(self.device_id, &window, chatting, gossip);

        let remote = self
            .state
            .remote_prefixes
            .get(&peer)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let missing: Vec<Message> = reconcile(&window, remote)
            .missing
            .into_iter()
            .filter(|m| m.sender == me)
            .collect();

        let mut wrappers = vec![MutableDataWrapper::signal(now, signal)];
        let list = self.message_list(missing);
        if !list.is_empty() {
            trace!(%peer, count = list.len(), "sending missing messages");
            wrappers.push(MutableDataWrapper::messages(now, list));
        }
        self.put_batch(PublishTarget::Direct(peer), wrappers, now)
    }

    /// Inline small messages; reference large ones and make sure they are in the DHT.
    ///
    /// Messages that could never be stored as one DHT item are left out.
    fn message_list(&mut self, messages: Vec<Message>) -> MessageList {
        let mut list = MessageList::new();
        let item_limit = self.item_limit();
        for message in messages {
            let size = message.encoded_len();
            if size <= self.config.inline_message_limit {
                list.push(MessageEntry::Inline(message));
                continue;
            }
            let hash = message.hash();
            if size > item_limit {
                debug!(%hash, size, "skipping message larger than the DHT item limit");
                continue;
            }
            if self.state.republished.insert(hash) {
                self.enqueue(DhtRequest::ImmutablePut {
                    value: message.to_canonical_bytes(),
                    tag: PutTag::Reference(hash),
                });
            }
            list.push(MessageEntry::Reference(hash));
        }
        list
    }

    fn publish_self(&mut self, now: Timestamp) -> Result<()> {
        let friends = self.state.presence.keys().to_vec();
        let digest = BloomFilter::from_items(
            self.config.bloom_bytes,
            self.config.bloom_hashes,
            friends.iter().map(|k| k.as_bytes().as_slice()),
        );
        let mut signal = NewMsgSignal::new(self.device_id);
        signal.friend_digest = Some(digest);

        let mut wrappers = vec![MutableDataWrapper::signal(now, signal)];
        if std::mem::take(&mut self.state.friend_info_pending) {
            wrappers.push(MutableDataWrapper::friend_info(
                now,
                FriendInfoList::new(friends),
            ));
        }
        self.put_batch(PublishTarget::SelfSync, wrappers, now)
    }

    fn publish_gossip(&mut self, now: Timestamp) -> Result<()> {
        let own: Vec<GossipItem> = self
            .state
            .presence
            .keys()
            .iter()
            .filter_map(|p| self.own_gossip_item(p))
            .collect();
        let mut signal = NewMsgSignal::new(self.device_id);
        signal.gossip = self
            .state
            .gossip
            .broadcast(own, self.config.gossip_per_signal);
        self.put_batch(
            PublishTarget::Gossip,
            vec![MutableDataWrapper::signal(now, signal)],
            now,
        )
    }

    fn put_batch(
        &mut self,
        target: PublishTarget,
        wrappers: Vec<MutableDataWrapper>,
        now: Timestamp,
    ) -> Result<()> {
        let limits = BatchLimits {
            max_wrappers: self.config.max_wrappers_per_put,
            max_bytes: self.item_limit(),
        };
        let batch = build_batch(wrappers, limits)?;
        let epoch = self
            .state
            .epoch
            .unwrap_or_else(|| channel::epoch(now, self.config.time_slice_ms()));
        let me = self.public_key();
        let item = MutableItem::sign(
            &self.keypair,
            target.salt(&me, epoch),
            now,
            batch.to_canonical_bytes(),
        );
        trace!(?target, epoch, bytes = item.value.len(), "publishing batch");
        self.enqueue(DhtRequest::MutablePut {
            item,
            tag: PutTag::Channel(target),
        });
        Ok(())
    }
}

impl<R, D> Engine<R, D>
where
    R: Repository + 'static,
    D: Dht + 'static,
{
    /// Run the engine on the tokio runtime until the handle is shut down.
    pub fn spawn(self) -> EngineHandle {
        let cancel = CancellationToken::new();
        let sender = self.command_sender();
        let join = tokio::spawn(self.run(cancel.clone()));
        EngineHandle {
            sender,
            cancel,
            join,
        }
    }

    /// Tick until `cancel` fires. Sleeps are cut short by commands.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(key = %self.public_key(), device = %self.device_id, "engine started");
        let wake = self.wake.clone();
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.tick() => outcome,
            };
            let delay = match outcome {
                Ok(report) => report.next_interval,
                Err(e) => self.on_tick_error(&e),
            };

            trace!(phase = %TickPhase::Sleep, ?delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = wake.notified() => {}
            }
        }
        info!("engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::{ChannelListener, Event};
    use crate::identity::KeyManager;
    use crate::transport::memory::MemoryDht;
    use dhtchat_store::MemoryRepository;

    const START: Timestamp = 1_700_000_000_000;

    struct Node {
        engine: Engine<MemoryRepository, Arc<MemoryDht>>,
        repo: Arc<MemoryRepository>,
        keys: KeyManager,
        events: mpsc::UnboundedReceiver<Event>,
    }

    fn node(seed: u8, dht: &Arc<MemoryDht>, clock: &Arc<ManualClock>, config: EngineConfig) -> Node {
        let keys = KeyManager::new(Keypair::from_seed(&[seed; 32]));
        let repo = Arc::new(MemoryRepository::new());
        let (listener, events) = ChannelListener::new();
        let engine = Engine::new(
            config,
            repo.clone(),
            dht.clone(),
            &keys,
            Arc::new(listener),
            clock.clone(),
            DeviceId::from_bytes([seed; 16]),
        );
        Node {
            engine,
            repo,
            keys,
            events,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn test_first_tick_publishes_channels() {
        let dht = MemoryDht::new();
        let clock = Arc::new(ManualClock::new(START));
        let mut a = node(1, &dht, &clock, EngineConfig::for_testing(1));
        let friend = Keypair::from_seed(&[2; 32]).public_key();
        a.repo.add_friend(&friend).await.unwrap();

        let report = a.engine.tick().await.unwrap();
        assert!(report.selection.is_some());
        // Direct channel for the new friend, self channel and gossip channel.
        assert_eq!(report.published, 3);

        let me = a.engine.public_key();
        let epoch = channel::epoch(START, 60_000);
        assert!(dht
            .get_mutable(&me, &PublishTarget::Direct(friend).salt(&me, epoch))
            .is_some());
        assert!(dht
            .get_mutable(&me, &PublishTarget::SelfSync.salt(&me, epoch))
            .is_some());
        assert!(dht
            .get_mutable(&me, &PublishTarget::Gossip.salt(&me, epoch))
            .is_some());
    }

    #[tokio::test]
    async fn test_presence_and_message_delivery() {
        let dht = MemoryDht::new();
        let clock = Arc::new(ManualClock::new(START));
        let mut config = EngineConfig::for_testing(7);
        config.weights.chatting = 1.0;
        let mut a = node(1, &dht, &clock, config.clone());
        let mut b = node(2, &dht, &clock, config);
        let ka = a.engine.public_key();
        let kb = b.engine.public_key();

        a.repo.add_friend(&kb).await.unwrap();
        b.repo.add_friend(&ka).await.unwrap();
        a.repo.set_chatting_friend(Some(&kb)).await.unwrap();
        b.repo.set_chatting_friend(Some(&ka)).await.unwrap();

        let message = Message::new(ka, kb, START, b"hello".to_vec());
        a.repo.save_message(&kb, &message).await.unwrap();
        a.engine
            .command_sender()
            .message_stored(kb, message.clone())
            .unwrap();

        for _ in 0..6 {
            a.engine.tick().await.unwrap();
            b.engine.tick().await.unwrap();
        }

        assert!(b.repo.has_message(&message.hash()).await.unwrap());
        let b_events = drain(&mut b.events);
        assert!(b_events.contains(&Event::Message {
            peer: ka,
            message: message.clone()
        }));
        assert!(b_events
            .iter()
            .any(|e| matches!(e, Event::Presence { peer, .. } if *peer == ka)));

        let a_events = drain(&mut a.events);
        assert!(a_events.contains(&Event::MessageStatus {
            peer: kb,
            hash: message.hash(),
            status: MessageStatus::Published
        }));
        assert!(a_events.contains(&Event::ReadReceipt {
            peer: kb,
            hash: message.hash(),
            timestamp: START
        }));
    }

    #[tokio::test]
    async fn test_spoofed_message_rejected() {
        let dht = MemoryDht::new();
        let clock = Arc::new(ManualClock::new(START));
        let mut a = node(1, &dht, &clock, EngineConfig::for_testing(1));
        let ka = a.engine.public_key();
        let kb = PeerKey::from_bytes([2; 32]);
        let kc = PeerKey::from_bytes([3; 32]);
        a.repo.add_friend(&kb).await.unwrap();
        a.engine.tick().await.unwrap();

        let forged = Message::new(kc, ka, START, b"not from b".to_vec());
        assert!(!a.engine.accept_message(&kb, &forged).await.unwrap());
        let misaddressed = Message::new(kb, kc, START, b"not for a".to_vec());
        assert!(!a.engine.accept_message(&kb, &misaddressed).await.unwrap());
        assert!(!a.repo.has_message(&forged.hash()).await.unwrap());
    }

    #[tokio::test]
    async fn test_backpressure_holds_requests_and_slows_down() {
        let dht = MemoryDht::with_limits(10, 1000);
        dht.set_occupation(9);
        let clock = Arc::new(ManualClock::new(START));
        let mut a = node(1, &dht, &clock, EngineConfig::for_testing(1));
        a.repo
            .add_friend(&PeerKey::from_bytes([2; 32]))
            .await
            .unwrap();

        let report = a.engine.tick().await.unwrap();
        assert_eq!(report.next_interval, Duration::from_millis(100));
        assert!(a.engine.outbound_len() > 0);
        assert_eq!(dht.request_count(), 0);

        dht.set_occupation(0);
        let report = a.engine.tick().await.unwrap();
        assert_eq!(report.next_interval, Duration::from_millis(50));
        assert_eq!(a.engine.outbound_len(), 0);
        assert!(dht.request_count() > 0);
    }

    #[tokio::test]
    async fn test_loop_interval_override() {
        let dht = MemoryDht::new();
        let clock = Arc::new(ManualClock::new(START));
        let mut a = node(1, &dht, &clock, EngineConfig::for_testing(1));
        a.repo
            .set_setting(dhtchat_store::settings::LOOP_INTERVAL_MS, "750")
            .await
            .unwrap();
        let report = a.engine.tick().await.unwrap();
        assert_eq!(report.next_interval, Duration::from_millis(750));
    }

    #[tokio::test]
    async fn test_key_rotation_clears_caches() {
        let dht = MemoryDht::new();
        let clock = Arc::new(ManualClock::new(START));
        let mut a = node(1, &dht, &clock, EngineConfig::for_testing(1));
        let friend = PeerKey::from_bytes([2; 32]);
        a.repo.add_friend(&friend).await.unwrap();
        a.engine.tick().await.unwrap();
        a.engine.state.referrals.push(friend, false);
        assert_eq!(a.engine.presence().len(), 1);

        let rotated = Keypair::from_seed(&[9; 32]);
        a.keys.rotate(rotated.clone());
        a.engine.check_identity();
        assert_eq!(a.engine.public_key(), rotated.public_key());
        assert!(a.engine.presence().is_empty());
        assert!(a.engine.referrals().is_empty());

        // The friend list is re-read from the repository on the next tick.
        a.engine.tick().await.unwrap();
        assert_eq!(a.engine.presence().len(), 1);
    }

    #[tokio::test]
    async fn test_command_queue_full() {
        let dht = MemoryDht::new();
        let clock = Arc::new(ManualClock::new(START));
        let mut config = EngineConfig::for_testing(1);
        config.command_queue_capacity = 1;
        let a = node(1, &dht, &clock, config);
        let sender = a.engine.command_sender();
        let peer = PeerKey::from_bytes([2; 32]);
        let msg = Message::new(a.engine.public_key(), peer, START, b"x".to_vec());

        sender.message_stored(peer, msg.clone()).unwrap();
        assert!(matches!(
            sender.message_stored(peer, msg),
            Err(SyncError::QueueFull)
        ));
    }

    /// A repository whose every call fails while `failing` is set.
    struct FailingRepository {
        inner: MemoryRepository,
        failing: std::sync::atomic::AtomicBool,
    }

    impl FailingRepository {
        fn new() -> Self {
            Self {
                inner: MemoryRepository::new(),
                failing: std::sync::atomic::AtomicBool::new(false),
            }
        }

        fn set_failing(&self, failing: bool) {
            self.failing
                .store(failing, std::sync::atomic::Ordering::SeqCst);
        }

        fn check(&self) -> dhtchat_store::Result<()> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                Err(dhtchat_store::StoreError::Io(std::io::Error::other(
                    "disk unavailable",
                )))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait::async_trait]
    impl Repository for FailingRepository {
        async fn list_friends(&self) -> dhtchat_store::Result<Vec<PeerKey>> {
            self.check()?;
            self.inner.list_friends().await
        }

        async fn add_friend(&self, key: &PeerKey) -> dhtchat_store::Result<bool> {
            self.check()?;
            self.inner.add_friend(key).await
        }

        async fn remove_friend(&self, key: &PeerKey) -> dhtchat_store::Result<bool> {
            self.check()?;
            self.inner.remove_friend(key).await
        }

        async fn save_message(
            &self,
            peer: &PeerKey,
            message: &Message,
        ) -> dhtchat_store::Result<InsertResult> {
            self.check()?;
            self.inner.save_message(peer, message).await
        }

        async fn get_message(&self, hash: &MessageHash) -> dhtchat_store::Result<Option<Message>> {
            self.check()?;
            self.inner.get_message(hash).await
        }

        async fn has_message(&self, hash: &MessageHash) -> dhtchat_store::Result<bool> {
            self.check()?;
            self.inner.has_message(hash).await
        }

        async fn latest_messages(
            &self,
            peer: &PeerKey,
            limit: usize,
        ) -> dhtchat_store::Result<Vec<Message>> {
            self.check()?;
            self.inner.latest_messages(peer, limit).await
        }

        async fn chatting_friend(&self) -> dhtchat_store::Result<Option<PeerKey>> {
            self.check()?;
            self.inner.chatting_friend().await
        }

        async fn set_chatting_friend(&self, peer: Option<&PeerKey>) -> dhtchat_store::Result<()> {
            self.check()?;
            self.inner.set_chatting_friend(peer).await
        }

        async fn get_setting(&self, key: &str) -> dhtchat_store::Result<Option<String>> {
            self.check()?;
            self.inner.get_setting(key).await
        }

        async fn set_setting(&self, key: &str, value: &str) -> dhtchat_store::Result<()> {
            self.check()?;
            self.inner.set_setting(key, value).await
        }
    }

    fn failing_engine(
        dht: &Arc<MemoryDht>,
        clock: &Arc<ManualClock>,
    ) -> (
        Engine<FailingRepository, Arc<MemoryDht>>,
        Arc<FailingRepository>,
        mpsc::UnboundedReceiver<Event>,
    ) {
        let keys = KeyManager::new(Keypair::from_seed(&[1; 32]));
        let repo = Arc::new(FailingRepository::new());
        let (listener, events) = ChannelListener::new();
        let engine = Engine::new(
            EngineConfig::for_testing(1),
            repo.clone(),
            dht.clone(),
            &keys,
            Arc::new(listener),
            clock.clone(),
            DeviceId::from_bytes([1; 16]),
        );
        (engine, repo, events)
    }

    /// Two friends where `a` always polls `b`'s direct channel.
    async fn chatting_pair(
        dht: &Arc<MemoryDht>,
        clock: &Arc<ManualClock>,
        config: EngineConfig,
    ) -> (Node, Node) {
        let mut config = config;
        config.weights.chatting = 1.0;
        let a = node(1, dht, clock, config.clone());
        let b = node(2, dht, clock, config);
        let ka = a.engine.public_key();
        let kb = b.engine.public_key();
        a.repo.add_friend(&kb).await.unwrap();
        b.repo.add_friend(&ka).await.unwrap();
        a.repo.set_chatting_friend(Some(&kb)).await.unwrap();
        b.repo.set_chatting_friend(Some(&ka)).await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_oversized_message_never_reaches_dht() {
        let dht = MemoryDht::new();
        let clock = Arc::new(ManualClock::new(START));
        let (mut a, mut b) = chatting_pair(&dht, &clock, EngineConfig::for_testing(1)).await;
        let ka = a.engine.public_key();
        let kb = b.engine.public_key();

        let big = Message::new(ka, kb, START, vec![1u8; 2000]);
        a.repo.save_message(&kb, &big).await.unwrap();
        a.engine
            .command_sender()
            .message_stored(kb, big.clone())
            .unwrap();

        for _ in 0..4 {
            a.engine.tick().await.unwrap();
            b.engine.tick().await.unwrap();
        }

        assert!(dht.get_immutable(&big.hash()).is_none());
        assert!(a.engine.state.republished.is_empty());
        assert!(b.engine.state.demanded.is_empty());
        assert!(drain(&mut a.events).contains(&Event::MessageStatus {
            peer: kb,
            hash: big.hash(),
            status: MessageStatus::Failed
        }));
        assert!(!b.repo.has_message(&big.hash()).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_reference_is_fetched_later_then_abandoned() {
        let dht = MemoryDht::new();
        let clock = Arc::new(ManualClock::new(START));
        let mut config = EngineConfig::for_testing(1);
        config.inline_message_limit = 64;
        config.max_demand_attempts = 3;
        let (mut a, mut b) = chatting_pair(&dht, &clock, config).await;
        let ka = a.engine.public_key();
        let kb = b.engine.public_key();

        let late = Message::new(ka, kb, START, vec![2u8; 300]);
        let lost = Message::new(ka, kb, START + 1, vec![3u8; 300]);
        a.repo.save_message(&kb, &late).await.unwrap();
        a.repo.save_message(&kb, &lost).await.unwrap();
        a.engine.tick().await.unwrap();
        assert!(dht.remove_immutable(&late.hash()));
        assert!(dht.remove_immutable(&lost.hash()));

        // The list is read, the first fetches miss.
        b.engine.tick().await.unwrap();
        b.engine.tick().await.unwrap();
        assert!(b.engine.state.demanded.contains_key(&late.hash()));
        assert!(!b.repo.has_message(&late.hash()).await.unwrap());

        // One of them reappears in the DHT and the retry picks it up.
        let (tx, _rx) = mpsc::unbounded_channel();
        dht.submit(
            DhtRequest::ImmutablePut {
                value: late.to_canonical_bytes(),
                tag: PutTag::Reference(late.hash()),
            },
            Completion::new(tx),
        );
        clock.advance(Duration::from_secs(5));
        b.engine.tick().await.unwrap();
        assert!(b.repo.has_message(&late.hash()).await.unwrap());
        assert!(!b.engine.state.demanded.contains_key(&late.hash()));

        // The other one runs out of attempts and stops being requested.
        for _ in 0..5 {
            clock.advance(Duration::from_secs(5));
            b.engine.tick().await.unwrap();
        }
        assert_eq!(b.engine.state.demanded[&lost.hash()].attempts, 3);
        assert!(!b.repo.has_message(&lost.hash()).await.unwrap());
        b.engine.retry_demands(clock.now_millis() + 60_000);
        assert_eq!(b.engine.outbound_len(), 0);
    }

    #[tokio::test]
    async fn test_malformed_batch_is_skipped() {
        let dht = MemoryDht::new();
        let clock = Arc::new(ManualClock::new(START));
        let (mut a, mut b) = chatting_pair(&dht, &clock, EngineConfig::for_testing(1)).await;
        let ka = a.engine.public_key();
        let kb = b.engine.public_key();
        let epoch = channel::epoch(START, 60_000);

        let garbage = MutableItem::sign(
            &Keypair::from_seed(&[2; 32]),
            PublishTarget::Direct(ka).salt(&kb, epoch),
            0,
            b"\xff\x00 not a batch".to_vec(),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        dht.submit(
            DhtRequest::MutablePut {
                item: garbage,
                tag: PutTag::Channel(PublishTarget::Direct(ka)),
            },
            Completion::new(tx),
        );

        let report = a.engine.tick().await.unwrap();
        assert!(report.responses > 0);
        assert!(report.published > 0);
        assert!(drain(&mut a.events)
            .iter()
            .all(|e| !matches!(e, Event::Message { .. })));

        // B's real batch replaces the garbage and gets through.
        let hello = Message::new(kb, ka, START, b"hello".to_vec());
        b.repo.save_message(&ka, &hello).await.unwrap();
        b.engine.tick().await.unwrap();
        a.engine.tick().await.unwrap();
        assert!(a.repo.has_message(&hello.hash()).await.unwrap());
    }

    #[tokio::test]
    async fn test_unstorable_timestamp_dropped_without_failing_tick() {
        let dht = MemoryDht::new();
        let clock = Arc::new(ManualClock::new(START));
        let (mut a, mut b) = chatting_pair(&dht, &clock, EngineConfig::for_testing(1)).await;
        let ka = a.engine.public_key();
        let kb = b.engine.public_key();

        let far = Message::new(ka, kb, u64::MAX, b"from the far future".to_vec());
        let hello = Message::new(ka, kb, START, b"hello".to_vec());
        a.repo.save_message(&kb, &far).await.unwrap();
        a.repo.save_message(&kb, &hello).await.unwrap();

        for _ in 0..2 {
            a.engine.tick().await.unwrap();
            b.engine.tick().await.unwrap();
        }
        assert!(b.repo.has_message(&hello.hash()).await.unwrap());
        assert!(!b.repo.has_message(&far.hash()).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_channel_put_is_retried() {
        let dht = MemoryDht::new();
        let clock = Arc::new(ManualClock::new(START));
        let mut a = node(1, &dht, &clock, EngineConfig::for_testing(1));
        let friend = PeerKey::from_bytes([2; 32]);
        a.repo.add_friend(&friend).await.unwrap();
        let me = a.engine.public_key();
        let salt = PublishTarget::Direct(friend).salt(&me, channel::epoch(START, 60_000));

        dht.set_fail_puts(true);
        a.engine.tick().await.unwrap();
        assert!(dht.get_mutable(&me, &salt).is_none());
        assert!(a.engine.state.pending.is_empty());

        dht.set_fail_puts(false);
        let report = a.engine.tick().await.unwrap();
        assert_eq!(report.published, 3);
        assert!(dht.get_mutable(&me, &salt).is_some());
    }

    #[tokio::test]
    async fn test_storage_failure_reported_and_interval_reset() {
        let dht = MemoryDht::with_limits(10, 1000);
        let clock = Arc::new(ManualClock::new(START));
        let (mut engine, repo, mut events) = failing_engine(&dht, &clock);

        dht.set_occupation(9);
        engine.tick().await.unwrap();
        assert_eq!(engine.current_interval(), Duration::from_millis(100));

        repo.set_failing(true);
        let err = engine.tick().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(engine.on_tick_error(&err), Duration::from_millis(50));
        assert_eq!(engine.current_interval(), Duration::from_millis(50));
        assert!(matches!(events.try_recv(), Ok(Event::Error(_))));

        repo.set_failing(false);
        dht.set_occupation(0);
        assert!(engine.tick().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_engine_survives_storage_failure() {
        let dht = MemoryDht::new();
        let clock = Arc::new(ManualClock::new(START));
        let (engine, repo, mut events) = failing_engine(&dht, &clock);
        repo.set_failing(true);

        let handle = engine.spawn();
        let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert!(matches!(first, Some(Event::Error(_))));
        let second = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert!(matches!(second, Some(Event::Error(_))));
        assert!(handle.is_running());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_engine_stops_promptly() {
        let dht = MemoryDht::new();
        let clock = Arc::new(ManualClock::new(START));
        let mut config = EngineConfig::for_testing(1);
        config.min_loop_interval = Duration::from_secs(3600);
        config.max_loop_interval = Duration::from_secs(3600);
        let a = node(1, &dht, &clock, config);

        let handle = a.engine.spawn();
        tokio::task::yield_now().await;
        assert!(handle.is_running());
        handle.shutdown().await.unwrap();
    }
}
