/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Event-driven implementation of chained HotStuff.
//!
//! Main type: [`HotStuff`].

use std::{
    collections::VecDeque,
    error::Error,
    fmt::{self, Display, Formatter},
    sync::mpsc::Sender,
    time::{Instant, SystemTime},
};

use crate::{
    events::{
        CollectQCEvent, Event, ExecuteRequestEvent, InsertNodeEvent, NewViewEvent, ProposeEvent,
        ReceiveProposalEvent, ReceiveRequestEvent, ReceiveVoteEvent, StartViewEvent,
        UpdateGenericQCEvent, UpdateLockedQCEvent, ViewTimeoutEvent, VoteEvent,
    },
    networking::{messages::Peer, network::Network, sending::SenderHandle},
    node_tree::NodeTree,
    pacemaker::implementation::{Pacemaker, PacemakerConfiguration, Timeout, TimeoutKind},
    replica::ReplicaInfo,
    types::{
        certificates::{CertificateVerifier, QuorumCertificate},
        crypto_primitives::Keypair,
        data_types::{max_faulty, NodeId, ReplicaId, ViewNumber},
        node::{ClientRequest, LogNode},
    },
};

use super::{
    invariants::{safe_node, walk_chain},
    messages::{Reply, VoteMessage},
    types::VoteCollector,
};

/// A single replica's view of the chained HotStuff protocol.
///
/// # Usage
///
/// `HotStuff` is driven entirely from the outside, under the replica lock. Its crate-public methods
/// are event handlers, to be called when something happens to the replica:
/// 1. [`start`](Self::start): once, when the replica starts. Enters view 1.
/// 2. [`on_receive_request`](Self::on_receive_request): a client request arrived.
/// 3. [`on_receive_msg`](Self::on_receive_msg): a proposal, vote, or new-view message arrived.
/// 4. [`tick`](Self::tick): periodically, to let the timers armed by the [`Pacemaker`] expire.
///
/// None of them block. Everything `HotStuff` sends goes through its [`SenderHandle`], which never
/// waits for the recipient.
pub(crate) struct HotStuff<N: Network> {
    config: HotStuffConfiguration,
    pacemaker: Pacemaker,
    node_tree: NodeTree,
    generic_qc: QuorumCertificate,
    locked_qc: QuorumCertificate,
    vote_collector: VoteCollector,
    last_voted_view: ViewNumber,
    last_proposed_view: ViewNumber,
    last_executed_view: ViewNumber,
    backlog: VecDeque<ClientRequest>,
    verifier: Box<dyn CertificateVerifier>,
    sender_handle: SenderHandle<N>,
    event_publisher: Option<Sender<Event>>,
}

impl<N: Network> HotStuff<N> {
    /// Create a replica sitting in the genesis view, with both watermarks at the genesis QC.
    pub(crate) fn new(
        config: HotStuffConfiguration,
        pacemaker_config: PacemakerConfiguration,
        verifier: Box<dyn CertificateVerifier>,
        sender_handle: SenderHandle<N>,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        Self {
            config,
            pacemaker: Pacemaker::new(pacemaker_config),
            node_tree: NodeTree::new(),
            generic_qc: QuorumCertificate::genesis_qc(),
            locked_qc: QuorumCertificate::genesis_qc(),
            vote_collector: VoteCollector::new(),
            last_voted_view: ViewNumber::init(),
            last_proposed_view: ViewNumber::init(),
            last_executed_view: ViewNumber::init(),
            backlog: VecDeque::new(),
            verifier,
            sender_handle,
            event_publisher,
        }
    }

    pub(crate) fn start(&mut self) {
        self.new_view(ViewNumber::new(1))
    }

    pub(crate) fn info(&self) -> ReplicaInfo {
        ReplicaInfo {
            id: self.config.me,
            n: self.config.num_replicas,
            f: self.f(),
            view: self.pacemaker.view(),
            generic_qc: self.generic_qc,
            locked_qc: self.locked_qc,
        }
    }

    pub(crate) fn recent_nodes(&self, k: usize) -> Vec<LogNode> {
        self.node_tree.recent(k)
    }

    fn f(&self) -> usize {
        max_faulty(self.config.num_replicas)
    }

    fn is_leader(&self) -> bool {
        self.pacemaker.leader(self.pacemaker.view()) == self.config.me
    }

    /// Handle a client request. Only the leader of the current view acts on it: it queues the request
    /// behind the requests it could not propose yet, and proposes the oldest queued request if it has
    /// not proposed in this view yet. Every other replica ignores it.
    pub(crate) fn on_receive_request(&mut self, origin: Peer, request: ClientRequest) {
        Event::ReceiveRequest(ReceiveRequestEvent {
            timestamp: SystemTime::now(),
            origin,
            request: request.clone(),
        })
        .publish(&self.event_publisher);

        if !self.is_leader() {
            return;
        }
        self.enqueue(request);
        if self.last_proposed_view < self.pacemaker.view() {
            if let Some(request) = self.backlog.pop_front() {
                self.propose(request)
            }
        }
    }

    /// Let the timers of the current view that have expired fire.
    pub(crate) fn tick(&mut self) {
        while let Some(timeout) = self.pacemaker.expired(Instant::now()) {
            self.on_timeout(timeout)
        }
    }

    /// Handle a proposal, a vote, or a new-view message.
    ///
    /// A message that is rejected leaves the replica's state untouched. The returned [`Rejection`]
    /// is informational only.
    pub(crate) fn on_receive_msg(&mut self, msg: VoteMessage) -> Result<(), Rejection> {
        if msg.node.as_ref().is_some_and(|node| !node.is_well_formed()) {
            return Err(Rejection::MalformedNode { sender: msg.sender });
        }

        if msg.is_vote() {
            self.on_receive_vote(msg)
        } else {
            self.on_receive_proposal(msg)
        }
    }

    /// Handle a timeout. A timer armed for a view the replica has already left is ignored.
    pub(crate) fn on_timeout(&mut self, timeout: Timeout) {
        if timeout.view != self.pacemaker.view() {
            return;
        }
        match timeout.kind {
            TimeoutKind::View => self.on_view_timeout(),
            TimeoutKind::Noop => self.on_noop_timeout(),
        }
    }

    fn on_receive_proposal(&mut self, proposal: VoteMessage) -> Result<(), Rejection> {
        let Some(node) = proposal.node.clone() else {
            return Err(Rejection::MalformedNode {
                sender: proposal.sender,
            });
        };
        if node.view != proposal.view {
            return Err(Rejection::MalformedNode {
                sender: proposal.sender,
            });
        }

        // 1. Check that the sender leads the view it claims to propose in, and that the view has a
        //    successor the replica's vote can be sent to.
        if proposal.view == ViewNumber::max() {
            return Err(Rejection::InvalidView {
                view: proposal.view,
                current: self.pacemaker.view(),
            });
        }
        if self.pacemaker.leader(proposal.view) != proposal.sender {
            return Err(Rejection::InvalidLeader {
                sender: proposal.sender,
                view: proposal.view,
            });
        }

        // 2. Catch up with a leader that is ahead, refuse one that is behind.
        if proposal.view > self.pacemaker.view() {
            self.new_view(proposal.view);
        }
        if proposal.view != self.pacemaker.view() {
            return Err(Rejection::InvalidView {
                view: proposal.view,
                current: self.pacemaker.view(),
            });
        }

        Event::ReceiveProposal(ReceiveProposalEvent {
            timestamp: SystemTime::now(),
            origin: proposal.sender,
            proposal,
        })
        .publish(&self.event_publisher);

        // 3. Store the node, together with any placeholders the leader chained before it.
        for placeholder in self.node_tree.restore_placeholders(&node) {
            self.publish_insert_node(placeholder);
        }
        self.insert_node(node.clone());
        self.node_tree.record_last(node.id);

        // 4. Vote, and advance the watermarks.
        self.update(&node);
        Ok(())
    }

    fn on_receive_vote(&mut self, vote: VoteMessage) -> Result<(), Rejection> {
        let view = self.pacemaker.view();
        if vote.view != view {
            return Err(Rejection::InvalidView {
                view: vote.view,
                current: view,
            });
        }
        if self.pacemaker.next_leader() != self.config.me {
            return Err(Rejection::NotNextLeader);
        }
        if !self.verifier.verify_vote(&vote) {
            return Err(Rejection::InadmissibleVote {
                sender: vote.sender,
            });
        }

        Event::ReceiveVote(ReceiveVoteEvent {
            timestamp: SystemTime::now(),
            origin: vote.sender,
            vote: vote.clone(),
        })
        .publish(&self.event_publisher);

        self.vote_collector.record(vote);
        let certified = self
            .vote_collector
            .try_aggregate(self.config.num_replicas, self.f(), self.verifier.as_ref())
            .map(|(qc, node)| (qc, node.clone()));

        if let Some((quorum_certificate, node)) = certified {
            Event::CollectQC(CollectQCEvent {
                timestamp: SystemTime::now(),
                quorum_certificate,
            })
            .publish(&self.event_publisher);

            if !self.node_tree.contains(&node.id) {
                self.insert_node(node);
            }
            self.update_generic_qc(quorum_certificate);
            self.new_view(view + 1);
        }
        Ok(())
    }

    /// Vote for `node` if it is safe and this replica has not voted in the current view yet, then
    /// apply the watermark updates and the commit that delivering `node` triggers.
    fn update(&mut self, node: &LogNode) {
        let view = self.pacemaker.view();
        if self.last_voted_view < view
            && safe_node(node, &node.justify, &self.locked_qc, &self.node_tree)
        {
            self.vote(node.clone());
        }

        let walk = walk_chain(node, &self.node_tree);
        let (generic_qc, locked_qc, decided) = (
            walk.generic_qc,
            walk.locked_qc,
            walk.decided.map(|decided| decided.id),
        );

        if let Some(generic_qc) = generic_qc {
            self.update_generic_qc(generic_qc);
        }
        if let Some(locked_qc) = locked_qc {
            self.update_locked_qc(locked_qc);
        }
        if let Some(decided) = decided {
            self.commit(decided);
        }
    }

    fn vote(&mut self, node: LogNode) {
        let view = self.pacemaker.view();
        let vote = self.sign(VoteMessage::vote(self.config.me, view, node));
        self.last_voted_view = view;
        self.sender_handle
            .send(Peer::Replica(self.pacemaker.next_leader()), vote.clone());

        Event::Vote(VoteEvent {
            timestamp: SystemTime::now(),
            vote,
        })
        .publish(&self.event_publisher);
    }

    fn update_generic_qc(&mut self, generic_qc: QuorumCertificate) {
        if generic_qc.view <= self.generic_qc.view {
            return;
        }
        self.generic_qc = generic_qc;
        Event::UpdateGenericQC(UpdateGenericQCEvent {
            timestamp: SystemTime::now(),
            generic_qc,
        })
        .publish(&self.event_publisher);
    }

    fn update_locked_qc(&mut self, locked_qc: QuorumCertificate) {
        if locked_qc.view <= self.locked_qc.view {
            return;
        }
        self.locked_qc = locked_qc;
        Event::UpdateLockedQC(UpdateLockedQCEvent {
            timestamp: SystemTime::now(),
            locked_qc,
        })
        .publish(&self.event_publisher);
    }

    /// Execute `decided` and every stored ancestor of it that has not been executed yet, oldest first.
    fn commit(&mut self, decided: NodeId) {
        let last_executed_view = self.last_executed_view;
        let mut branch: Vec<LogNode> = self
            .node_tree
            .branch(decided)
            .take_while(|node| node.view > last_executed_view)
            .cloned()
            .collect();
        branch.reverse();

        for node in branch {
            self.execute(node);
        }
    }

    fn execute(&mut self, node: LogNode) {
        self.last_executed_view = node.view;

        if node.request.expects_reply() {
            let reply = Reply {
                view: self.pacemaker.view(),
                timestamp: node.request.timestamp,
                replica_id: self.config.me,
                result: node.request.operation.clone(),
            };
            self.sender_handle
                .send(Peer::Client(node.request.client_id), reply);
        }

        Event::ExecuteRequest(ExecuteRequestEvent {
            timestamp: SystemTime::now(),
            node: node.id,
            view: node.view,
            request: node.request,
        })
        .publish(&self.event_publisher);
    }

    /// Move to `target` if it is ahead of the current view.
    ///
    /// The votes collected in the view being left are discarded. If this replica leads `target`, it
    /// first scans them for the highest stored node referenced by a carried QC, and adopts that node's
    /// justify as its generic QC if it is newer. Then it arms its no-op timer. Every replica arms its
    /// view timer.
    fn new_view(&mut self, target: ViewNumber) {
        if !self.pacemaker.enter_view(target) {
            return;
        }
        let saved_votes = self.vote_collector.take();
        let leader = self.pacemaker.leader(target);

        Event::StartView(StartViewEvent {
            timestamp: SystemTime::now(),
            leader,
            view: target,
        })
        .publish(&self.event_publisher);

        if leader == self.config.me {
            let recovered_qc = saved_votes
                .iter()
                .filter_map(|vote| vote.carried_qc.as_ref())
                .filter_map(|carried_qc| self.node_tree.get(&carried_qc.node_id))
                .max_by_key(|node| node.view)
                .map(|high_node| high_node.justify);
            if let Some(recovered_qc) = recovered_qc {
                self.update_generic_qc(recovered_qc);
            }
            self.pacemaker.arm_noop_timer();
        }
        self.pacemaker.arm_view_timer();
    }

    fn on_view_timeout(&mut self) {
        let view = self.pacemaker.view();
        Event::ViewTimeout(ViewTimeoutEvent {
            timestamp: SystemTime::now(),
            view,
            timeout: self.pacemaker.view_timeout(),
        })
        .publish(&self.event_publisher);

        let new_view = self.sign(VoteMessage::new_view(
            self.config.me,
            view,
            self.generic_qc,
        ));
        self.sender_handle
            .send(Peer::Replica(self.pacemaker.next_leader()), new_view.clone());

        Event::NewView(NewViewEvent {
            timestamp: SystemTime::now(),
            new_view,
        })
        .publish(&self.event_publisher);

        self.new_view(view + 1);
    }

    /// Append `request` to the backlog, unless the same request is already queued or the backlog is
    /// full.
    fn enqueue(&mut self, request: ClientRequest) {
        let queued = self.backlog.iter().any(|queued| {
            queued.client_id == request.client_id && queued.timestamp == request.timestamp
        });
        if queued {
            return;
        }
        if self.backlog.len() >= MAX_BACKLOG_LEN {
            log::warn!(
                "Backlog full, dropping request {} from client {}",
                request.timestamp,
                request.client_id
            );
            return;
        }
        self.backlog.push_back(request);
    }

    fn on_noop_timeout(&mut self) {
        if !self.is_leader() || self.last_proposed_view >= self.pacemaker.view() {
            return;
        }
        let request = self.backlog.pop_front().unwrap_or_else(ClientRequest::noop);
        self.propose(request);
    }

    /// Extend the node certified by the generic QC with a leaf carrying `request`, and broadcast it.
    fn propose(&mut self, request: ClientRequest) {
        let view = self.pacemaker.view();
        let (placeholders, leaf) = self.node_tree.create_leaf(
            view,
            self.generic_qc.node_id,
            request,
            self.generic_qc,
        );
        for placeholder in placeholders {
            self.publish_insert_node(placeholder);
        }
        self.publish_insert_node(leaf.clone());
        self.node_tree.record_last(leaf.id);

        self.last_proposed_view = view;
        self.pacemaker.cancel_noop_timer();

        let proposal = VoteMessage::proposal(self.config.me, view, leaf);
        self.sender_handle.broadcast(proposal.clone());

        Event::Propose(ProposeEvent {
            timestamp: SystemTime::now(),
            proposal,
        })
        .publish(&self.event_publisher);
    }

    /// Insert `node` unless the exact same node is already stored.
    fn insert_node(&mut self, node: LogNode) {
        if self.node_tree.get(&node.id) == Some(&node) {
            return;
        }
        self.node_tree.insert(node.clone());
        self.publish_insert_node(node);
    }

    fn publish_insert_node(&self, node: LogNode) {
        Event::InsertNode(InsertNodeEvent {
            timestamp: SystemTime::now(),
            node,
        })
        .publish(&self.event_publisher);
    }

    fn sign(&self, msg: VoteMessage) -> VoteMessage {
        match &self.config.keypair {
            Some(keypair) => msg.signed(keypair),
            None => msg,
        }
    }
}

/// Most client requests a leader queues while waiting for a view to propose them in.
pub(crate) const MAX_BACKLOG_LEN: usize = 1024;

/// Configuration parameters for the [`HotStuff`] struct.
#[derive(Clone)]
pub(crate) struct HotStuffConfiguration {
    pub(crate) me: ReplicaId,
    pub(crate) num_replicas: usize,

    /// The keypair to sign votes and new-view messages with. Messages are sent unsigned without one.
    pub(crate) keypair: Option<Keypair>,
}

/// Why a replica refused to act on a [`VoteMessage`].
///
/// Rejections are never sent back over the network. The poller logs them at debug level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// A proposal came from a replica that does not lead the view it was made in.
    InvalidLeader { sender: ReplicaId, view: ViewNumber },

    /// A proposal for an earlier view or for the last view, or a vote for any view but the current one.
    InvalidView { view: ViewNumber, current: ViewNumber },

    /// A vote reached a replica that does not lead the next view.
    NotNextLeader,

    /// The [`CertificateVerifier`] refused to count a vote.
    InadmissibleVote { sender: ReplicaId },

    /// A message carried a node whose id does not match its view and operation, or a proposal
    /// carried no node at all.
    MalformedNode { sender: ReplicaId },
}

impl Display for Rejection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::InvalidLeader { sender, view } => {
                write!(f, "generic msg from invalid leader {} in view {}", sender, view)
            }
            Rejection::InvalidView { view, current } => {
                write!(f, "msg from invalid view {} while in view {}", view, current)
            }
            Rejection::NotNextLeader => write!(f, "vote msg received by a replica that is not the next leader"),
            Rejection::InadmissibleVote { sender } => {
                write!(f, "inadmissible vote from replica {}", sender)
            }
            Rejection::MalformedNode { sender } => {
                write!(f, "malformed node from replica {}", sender)
            }
        }
    }
}

impl Error for Rejection {}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::*;
    use crate::{
        networking::messages::Message,
        types::{
            certificates::CountingVerifier,
            data_types::{ClientId, Operation, Timestamp},
        },
    };

    /// (origin, recipient, message)
    type Envelope = (Peer, Peer, Message);

    /// Appends every send to a queue shared by all replicas of a [`Cluster`].
    #[derive(Clone)]
    struct QueueNetwork {
        me: Peer,
        queue: Arc<Mutex<VecDeque<Envelope>>>,
    }

    impl Network for QueueNetwork {
        fn send(&mut self, peer: Peer, message: Message) {
            self.queue
                .lock()
                .unwrap()
                .push_back((self.me, peer, message))
        }

        fn recv(&mut self) -> Option<(Peer, Message)> {
            None
        }
    }

    /// Replicas that are never ticked, so their timers never expire, and whose messages are delivered
    /// one by one in send order.
    struct Cluster {
        engines: Vec<HotStuff<QueueNetwork>>,
        queue: Arc<Mutex<VecDeque<Envelope>>>,
        replies: Vec<Reply>,
        rejections: Vec<Rejection>,
    }

    impl Cluster {
        fn new(n: usize) -> Cluster {
            let queue = Arc::new(Mutex::new(VecDeque::new()));
            let engines = (0..n)
                .map(|i| {
                    let me = ReplicaId::new(i as u32);
                    let network = QueueNetwork {
                        me: Peer::Replica(me),
                        queue: queue.clone(),
                    };
                    HotStuff::new(
                        HotStuffConfiguration {
                            me,
                            num_replicas: n,
                            keypair: None,
                        },
                        PacemakerConfiguration {
                            num_replicas: n,
                            view_timeout: Duration::from_secs(10),
                            noop_delay: Duration::from_secs(2),
                        },
                        Box::new(CountingVerifier),
                        SenderHandle::new(network, n),
                        None,
                    )
                })
                .collect();

            let mut cluster = Cluster {
                engines,
                queue,
                replies: Vec::new(),
                rejections: Vec::new(),
            };
            cluster.engines.iter_mut().for_each(HotStuff::start);
            cluster
        }

        /// Send a request from client 0 to every replica.
        fn submit(&mut self, operation: &str, timestamp: u64) {
            let request = ClientRequest::new(operation, Timestamp::new(timestamp), ClientId::new(0));
            let mut queue = self.queue.lock().unwrap();
            for i in 0..self.engines.len() {
                queue.push_back((
                    Peer::Client(ClientId::new(0)),
                    Peer::Replica(ReplicaId::new(i as u32)),
                    request.clone().into(),
                ));
            }
        }

        /// Deliver queued messages, including those sent while delivering, until none are left.
        fn deliver_all(&mut self) {
            loop {
                let next = self.queue.lock().unwrap().pop_front();
                let Some((origin, recipient, message)) = next else {
                    return;
                };
                match (recipient, message) {
                    (Peer::Replica(id), Message::Request(request)) => {
                        self.engines[id.index()].on_receive_request(origin, request)
                    }
                    (Peer::Replica(id), Message::Msg(msg)) => {
                        if let Err(rejection) = self.engines[id.index()].on_receive_msg(msg) {
                            self.rejections.push(rejection)
                        }
                    }
                    (Peer::Client(_), Message::Reply(reply)) => self.replies.push(reply),
                    _ => (),
                }
            }
        }

        fn sent(&self) -> Vec<Envelope> {
            self.queue.lock().unwrap().iter().cloned().collect()
        }

        fn node(&self, replica: usize, op: &str) -> LogNode {
            self.engines[replica]
                .node_tree
                .recent(16)
                .into_iter()
                .find(|node| node.request.operation == Operation::from(op))
                .expect("node should be on the recent branch")
        }
    }

    fn qc_for(node: &LogNode) -> QuorumCertificate {
        QuorumCertificate::new(node.view, node.id)
    }

    fn request(op: &str, timestamp: u64) -> ClientRequest {
        ClientRequest::new(op, Timestamp::new(timestamp), ClientId::new(0))
    }

    /// Drive four replicas through views 1 to 4, one client request per view.
    fn four_views() -> Cluster {
        let mut cluster = Cluster::new(4);
        for (i, op) in ["op-A", "op-B", "op-C", "op-D"].into_iter().enumerate() {
            cluster.submit(op, i as u64 + 1);
            cluster.deliver_all();
        }
        cluster
    }

    #[test]
    fn four_views_commit_the_first_request() {
        let mut cluster = Cluster::new(4);

        // View 1: replica 1 proposes op-A on the genesis QC, replica 2 certifies it.
        cluster.submit("op-A", 1);
        cluster.deliver_all();
        let node_a = cluster.node(1, "op-A");
        assert_eq!(node_a.justify, QuorumCertificate::genesis_qc());
        assert_eq!(cluster.engines[2].info().view, ViewNumber::new(2));
        assert_eq!(cluster.engines[2].generic_qc, qc_for(&node_a));
        for engine in &cluster.engines {
            assert!(engine.locked_qc.is_genesis_qc());
        }

        // View 2: op-B, justified by the view 1 QC, moves op-A to pre-commit everywhere.
        cluster.submit("op-B", 2);
        cluster.deliver_all();
        let node_b = cluster.node(2, "op-B");
        assert_eq!(node_b.justify, qc_for(&node_a));
        for engine in &cluster.engines {
            assert!(engine.generic_qc.view >= node_a.view);
            assert!(engine.locked_qc.is_genesis_qc());
        }
        assert_eq!(cluster.engines[3].generic_qc, qc_for(&node_b));

        // View 3: op-C locks op-A. Nothing is executed yet.
        cluster.submit("op-C", 3);
        cluster.deliver_all();
        for engine in &cluster.engines {
            assert_eq!(engine.locked_qc, qc_for(&node_a));
        }
        assert!(cluster.replies.is_empty());

        // View 4: op-D decides op-A, and every replica replies to the client.
        cluster.submit("op-D", 4);
        cluster.deliver_all();
        for engine in &cluster.engines {
            assert_eq!(engine.locked_qc, qc_for(&node_b));
            assert_eq!(engine.last_executed_view, node_a.view);
        }
        assert_eq!(cluster.replies.len(), 4);
        for reply in &cluster.replies {
            assert_eq!(reply.timestamp, Timestamp::new(1));
            assert_eq!(reply.result, Operation::from("op-A"));
        }
        let mut repliers: Vec<u32> = cluster
            .replies
            .iter()
            .map(|reply| reply.replica_id.int())
            .collect();
        repliers.sort();
        assert_eq!(repliers, vec![0, 1, 2, 3]);

        // Late votes for an already certified view are refused, never counted.
        assert!(cluster
            .rejections
            .iter()
            .all(|rejection| matches!(rejection, Rejection::InvalidView { .. })));
    }

    #[test]
    fn lock_never_moves_backwards() {
        let mut cluster = four_views();
        let node_b = cluster.node(0, "op-B");
        let locked_before = cluster.engines[0].locked_qc;
        let generic_before = cluster.engines[0].generic_qc;

        // A legitimate proposal for view 5 whose chain only yields older QCs.
        let stale_chain = LogNode::new(
            ViewNumber::new(5),
            node_b.id,
            request("op-E", 5),
            qc_for(&node_b),
        );
        let proposal = VoteMessage::proposal(ReplicaId::new(1), ViewNumber::new(5), stale_chain);
        assert_eq!(cluster.engines[0].on_receive_msg(proposal), Ok(()));

        assert_eq!(cluster.engines[0].locked_qc, locked_before);
        assert_eq!(cluster.engines[0].generic_qc, generic_before);
        assert_eq!(cluster.engines[0].info().view, ViewNumber::new(5));
    }

    #[test]
    fn proposals_are_checked_against_leader_and_view() {
        let mut cluster = Cluster::new(4);
        let node = LogNode::new(
            ViewNumber::new(1),
            NodeId::genesis(),
            request("op-A", 1),
            QuorumCertificate::genesis_qc(),
        );

        let from_non_leader = VoteMessage::proposal(ReplicaId::new(0), ViewNumber::new(1), node.clone());
        assert_eq!(
            cluster.engines[2].on_receive_msg(from_non_leader),
            Err(Rejection::InvalidLeader {
                sender: ReplicaId::new(0),
                view: ViewNumber::new(1)
            })
        );

        let genesis_view_node = LogNode::new(
            ViewNumber::init(),
            NodeId::genesis(),
            request("op-A", 1),
            QuorumCertificate::genesis_qc(),
        );
        let stale = VoteMessage::proposal(ReplicaId::new(0), ViewNumber::init(), genesis_view_node);
        assert_eq!(
            cluster.engines[2].on_receive_msg(stale),
            Err(Rejection::InvalidView {
                view: ViewNumber::init(),
                current: ViewNumber::new(1)
            })
        );

        let mut tampered = node;
        tampered.request.operation = Operation::from("op-Z");
        let malformed = VoteMessage::proposal(ReplicaId::new(1), ViewNumber::new(1), tampered);
        assert_eq!(
            cluster.engines[2].on_receive_msg(malformed),
            Err(Rejection::MalformedNode {
                sender: ReplicaId::new(1)
            })
        );

        // Nothing was stored or sent.
        assert!(cluster.engines[2].node_tree.is_empty());
        assert!(cluster.sent().is_empty());
    }

    #[test]
    fn replica_votes_at_most_once_per_view() {
        let mut cluster = Cluster::new(4);
        let first = LogNode::new(
            ViewNumber::new(1),
            NodeId::genesis(),
            request("op-A", 1),
            QuorumCertificate::genesis_qc(),
        );
        let second = LogNode::new(
            ViewNumber::new(1),
            NodeId::genesis(),
            request("op-B", 2),
            QuorumCertificate::genesis_qc(),
        );
        for node in [first.clone(), first.clone(), second] {
            let proposal = VoteMessage::proposal(ReplicaId::new(1), ViewNumber::new(1), node);
            assert_eq!(cluster.engines[0].on_receive_msg(proposal), Ok(()));
        }

        let votes: Vec<Envelope> = cluster.sent();
        assert_eq!(votes.len(), 1);
        let (origin, recipient, Message::Msg(vote)) = &votes[0] else {
            panic!("expected a vote")
        };
        assert_eq!(*origin, Peer::Replica(ReplicaId::new(0)));
        assert_eq!(*recipient, Peer::Replica(ReplicaId::new(2)));
        assert!(vote.is_vote());
        assert_eq!(vote.node_id(), Some(first.id));
    }

    #[test]
    fn votes_are_only_collected_by_the_next_leader_in_the_current_view() {
        let mut cluster = Cluster::new(4);
        let node = LogNode::new(
            ViewNumber::new(1),
            NodeId::genesis(),
            request("op-A", 1),
            QuorumCertificate::genesis_qc(),
        );

        let vote = VoteMessage::vote(ReplicaId::new(3), ViewNumber::new(1), node.clone());
        assert_eq!(
            cluster.engines[0].on_receive_msg(vote.clone()),
            Err(Rejection::NotNextLeader)
        );
        assert_eq!(cluster.engines[2].on_receive_msg(vote), Ok(()));

        let future_vote = VoteMessage::vote(ReplicaId::new(3), ViewNumber::new(5), node);
        assert_eq!(
            cluster.engines[2].on_receive_msg(future_vote),
            Err(Rejection::InvalidView {
                view: ViewNumber::new(5),
                current: ViewNumber::new(1)
            })
        );
    }

    #[test]
    fn leader_proposes_once_per_view_and_backlogs_the_rest() {
        let mut cluster = Cluster::new(4);
        let client = Peer::Client(ClientId::new(0));

        cluster.engines[1].on_receive_request(client, request("op-A", 1));
        cluster.engines[1].on_receive_request(client, request("op-B", 2));
        // Not the leader of view 1.
        cluster.engines[2].on_receive_request(client, request("op-C", 3));

        let proposals = cluster.sent();
        assert_eq!(proposals.len(), 4);
        assert!(proposals.iter().all(|(_, _, message)| matches!(
            message,
            Message::Msg(proposal) if proposal.node.as_ref().unwrap().request.operation == Operation::from("op-A")
        )));
        assert_eq!(cluster.engines[1].backlog.len(), 1);

        // Already proposed in view 1: the no-op timer does nothing.
        cluster.engines[1].on_timeout(Timeout {
            view: ViewNumber::new(1),
            kind: TimeoutKind::Noop,
        });
        assert_eq!(cluster.sent().len(), 4);

        // In the next view replica 1 leads, the no-op timer proposes the backlog head.
        cluster.queue.lock().unwrap().clear();
        cluster.engines[1].new_view(ViewNumber::new(5));
        cluster.engines[1].on_timeout(Timeout {
            view: ViewNumber::new(5),
            kind: TimeoutKind::Noop,
        });
        assert_eq!(proposed_operations(&cluster), vec![Operation::from("op-B")]);
        let (_, _, Message::Msg(proposal)) = &cluster.sent()[0] else {
            panic!("expected a proposal")
        };
        assert_eq!(proposal.node.as_ref().unwrap().view, ViewNumber::new(5));
        assert!(cluster.engines[1].backlog.is_empty());
    }

    /// Operations of the proposals in the queue, one per broadcast.
    fn proposed_operations(cluster: &Cluster) -> Vec<Operation> {
        cluster
            .sent()
            .into_iter()
            .filter_map(|(_, recipient, message)| match message {
                Message::Msg(msg) if !msg.is_vote() && recipient == Peer::Replica(ReplicaId::new(0)) => {
                    msg.node.map(|node| node.request.operation)
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn backlogged_requests_are_proposed_before_newer_ones() {
        let mut cluster = Cluster::new(4);
        let client = Peer::Client(ClientId::new(0));

        cluster.engines[1].on_receive_request(client, request("op-A", 1));
        cluster.engines[1].on_receive_request(client, request("op-B", 2));
        // A resubmission of a queued request is not queued twice.
        cluster.engines[1].on_receive_request(client, request("op-B", 2));
        assert_eq!(cluster.engines[1].backlog.len(), 1);

        // The next view replica 1 leads starts with a fresh request arriving before the no-op timer.
        cluster.queue.lock().unwrap().clear();
        cluster.engines[1].new_view(ViewNumber::new(5));
        cluster.engines[1].on_receive_request(client, request("op-C", 3));
        assert_eq!(proposed_operations(&cluster), vec![Operation::from("op-B")]);
        assert_eq!(
            cluster.engines[1].backlog.front().map(|queued| queued.operation.clone()),
            Some(Operation::from("op-C"))
        );

        cluster.queue.lock().unwrap().clear();
        cluster.engines[1].new_view(ViewNumber::new(9));
        cluster.engines[1].on_timeout(Timeout {
            view: ViewNumber::new(9),
            kind: TimeoutKind::Noop,
        });
        assert_eq!(proposed_operations(&cluster), vec![Operation::from("op-C")]);
        assert!(cluster.engines[1].backlog.is_empty());
    }

    #[test]
    fn backlog_is_bounded() {
        let mut cluster = Cluster::new(4);
        let client = Peer::Client(ClientId::new(0));
        let leader = &mut cluster.engines[1];

        leader.on_receive_request(client, request("op-0", 1));
        for timestamp in 2..(MAX_BACKLOG_LEN as u64 + 10) {
            leader.on_receive_request(client, request(&format!("op-{}", timestamp), timestamp));
        }
        assert_eq!(leader.backlog.len(), MAX_BACKLOG_LEN);
        assert_eq!(
            leader.backlog.back().map(|queued| queued.timestamp),
            Some(Timestamp::new(MAX_BACKLOG_LEN as u64 + 1))
        );
    }

    #[test]
    fn noop_timer_proposes_a_noop_without_traffic() {
        let mut cluster = Cluster::new(4);
        cluster.engines[1].on_timeout(Timeout {
            view: ViewNumber::new(1),
            kind: TimeoutKind::Noop,
        });
        cluster.deliver_all();

        let noop = cluster.node(1, "noop");
        assert!(!noop.request.expects_reply());
        assert_eq!(cluster.engines[2].generic_qc, qc_for(&noop));
        assert_eq!(cluster.engines[2].info().view, ViewNumber::new(2));
    }

    #[test]
    fn view_timeout_sends_new_view_to_next_leader() {
        let mut cluster = Cluster::new(4);
        let timeout = Timeout {
            view: ViewNumber::new(1),
            kind: TimeoutKind::View,
        };
        cluster.engines[0].on_timeout(timeout);

        let sent = cluster.sent();
        assert_eq!(sent.len(), 1);
        let (_, recipient, Message::Msg(new_view)) = &sent[0] else {
            panic!("expected a new-view message")
        };
        assert_eq!(*recipient, Peer::Replica(ReplicaId::new(2)));
        assert!(new_view.is_vote());
        assert!(new_view.node.is_none());
        assert_eq!(new_view.carried_qc, Some(QuorumCertificate::genesis_qc()));
        assert_eq!(new_view.view, ViewNumber::new(1));
        assert_eq!(cluster.engines[0].info().view, ViewNumber::new(2));

        // The same timer firing late finds the replica in another view.
        cluster.engines[0].on_timeout(timeout);
        assert_eq!(cluster.sent().len(), 1);
        assert_eq!(cluster.engines[0].info().view, ViewNumber::new(2));
    }

    #[test]
    fn new_leader_recovers_justify_of_highest_carried_node() {
        let mut cluster = Cluster::new(4);
        let leader = &mut cluster.engines[2];
        let (_, node_a) = leader.node_tree.create_leaf(
            ViewNumber::new(1),
            NodeId::genesis(),
            request("op-A", 1),
            QuorumCertificate::genesis_qc(),
        );
        let (_, node_b) = leader.node_tree.create_leaf(
            ViewNumber::new(2),
            node_a.id,
            request("op-B", 2),
            qc_for(&node_a),
        );

        for (sender, carried) in [(0, &node_b), (1, &node_a)] {
            let new_view =
                VoteMessage::new_view(ReplicaId::new(sender), ViewNumber::new(1), qc_for(carried));
            assert_eq!(leader.on_receive_msg(new_view), Ok(()));
        }
        assert!(leader.generic_qc.is_genesis_qc());

        leader.on_timeout(Timeout {
            view: ViewNumber::new(1),
            kind: TimeoutKind::View,
        });
        assert_eq!(leader.info().view, ViewNumber::new(2));
        assert_eq!(leader.generic_qc, qc_for(&node_a));
        assert_eq!(leader.vote_collector.len(), 0);
    }

    #[test]
    fn commit_executes_unexecuted_ancestors_oldest_first() {
        let mut cluster = Cluster::new(4);
        let engine = &mut cluster.engines[0];
        let (_, node_a) = engine.node_tree.create_leaf(
            ViewNumber::new(1),
            NodeId::genesis(),
            request("op-A", 1),
            QuorumCertificate::genesis_qc(),
        );
        let (placeholders, node_c) = engine.node_tree.create_leaf(
            ViewNumber::new(3),
            node_a.id,
            request("op-C", 3),
            qc_for(&node_a),
        );
        assert_eq!(placeholders.len(), 1);

        engine.commit(node_c.id);
        assert_eq!(engine.last_executed_view, ViewNumber::new(3));
        // Committing again executes nothing.
        engine.commit(node_c.id);

        let replied: Vec<Timestamp> = cluster
            .sent()
            .into_iter()
            .filter_map(|(_, _, message)| match message {
                Message::Reply(reply) => Some(reply.timestamp),
                _ => None,
            })
            .collect();
        assert_eq!(replied, vec![Timestamp::new(1), Timestamp::new(3)]);
    }

    #[test]
    fn far_future_proposal_inserts_only_its_own_node() {
        let mut cluster = Cluster::new(4);
        let view = ViewNumber::new(2_000_000);
        let node = LogNode::new(
            view,
            NodeId::derive(ViewNumber::new(1_999_999), &"dummy".into()),
            request("op-A", 1),
            QuorumCertificate::genesis_qc(),
        );
        let proposal = VoteMessage::proposal(ReplicaId::new(0), view, node.clone());
        assert_eq!(cluster.engines[1].on_receive_msg(proposal), Ok(()));

        assert_eq!(cluster.engines[1].node_tree.len(), 1);
        assert!(cluster.engines[1].node_tree.contains(&node.id));
        assert_eq!(cluster.engines[1].info().view, view);

        // Leading a later view with the same gap behind it chains no placeholders either.
        let next_view = ViewNumber::new(2_000_001);
        cluster.engines[1].new_view(next_view);
        cluster.engines[1].on_receive_request(Peer::Client(ClientId::new(0)), request("op-B", 2));
        assert_eq!(cluster.engines[1].node_tree.len(), 2);
    }

    #[test]
    fn proposals_for_the_last_view_are_refused() {
        let mut cluster = Cluster::new(4);
        let view = ViewNumber::max();
        let leader = ReplicaId::new((u64::MAX % 4) as u32);
        let (_, parent) = cluster.engines[0].node_tree.create_leaf(
            ViewNumber::new(1),
            NodeId::genesis(),
            request("op-A", 1),
            QuorumCertificate::genesis_qc(),
        );
        let node = LogNode::new(view, parent.id, request("op-B", 2), qc_for(&parent));
        let proposal = VoteMessage::proposal(leader, view, node);

        assert_eq!(
            cluster.engines[0].on_receive_msg(proposal),
            Err(Rejection::InvalidView {
                view,
                current: ViewNumber::new(1)
            })
        );
        assert_eq!(cluster.engines[0].info().view, ViewNumber::new(1));
        assert!(cluster.sent().is_empty());

        // The view before it is still accepted, and the vote goes to the leader of the last view.
        let penultimate = ViewNumber::new(u64::MAX - 1);
        let node = LogNode::new(penultimate, parent.id, request("op-C", 3), qc_for(&parent));
        let sender = ReplicaId::new(((u64::MAX - 1) % 4) as u32);
        let proposal = VoteMessage::proposal(sender, penultimate, node);
        assert_eq!(cluster.engines[0].on_receive_msg(proposal), Ok(()));
        let sent = cluster.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, Peer::Replica(leader));
    }

    #[test]
    fn stale_new_view_changes_nothing() {
        let mut cluster = Cluster::new(4);
        let replica = &mut cluster.engines[2];
        // Replica 2 leads view 6, so it collects the votes sent in view 5.
        replica.new_view(ViewNumber::new(5));
        let (_, node_a) = replica.node_tree.create_leaf(
            ViewNumber::new(1),
            NodeId::genesis(),
            request("op-A", 1),
            QuorumCertificate::genesis_qc(),
        );
        let (_, node_b) = replica.node_tree.create_leaf(
            ViewNumber::new(2),
            node_a.id,
            request("op-B", 2),
            qc_for(&node_a),
        );
        for (sender, carried) in [(0, &node_b), (1, &node_a)] {
            let new_view =
                VoteMessage::new_view(ReplicaId::new(sender), ViewNumber::new(5), qc_for(carried));
            assert_eq!(replica.on_receive_msg(new_view), Ok(()));
        }
        let (generic_before, locked_before) = (replica.generic_qc, replica.locked_qc);

        // Views 2 and 6 are both led by replica 2, so only the view guard keeps the first one from
        // recovering a generic QC out of the saved votes.
        for stale in [ViewNumber::new(2), ViewNumber::new(5)] {
            replica.new_view(stale);
            assert_eq!(replica.info().view, ViewNumber::new(5));
            assert_eq!(replica.generic_qc, generic_before);
            assert_eq!(replica.locked_qc, locked_before);
            assert_eq!(replica.vote_collector.len(), 2);
        }

        replica.new_view(ViewNumber::new(6));
        assert_eq!(replica.generic_qc, qc_for(&node_a));
        assert_eq!(replica.vote_collector.len(), 0);
    }
}
