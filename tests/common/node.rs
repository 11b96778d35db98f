/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use chained_hotstuff::{
    client::{AcceptedResult, Client, ClientConfiguration, ClientSpec},
    events::{AcceptResultEvent, CollectQCEvent, ExecuteRequestEvent, ViewTimeoutEvent},
    networking::{faulty::FaultMode, messages::Peer},
    replica::{Configuration, Replica, ReplicaInfo, ReplicaSpec},
    types::{
        certificates::CertificateVerifier,
        crypto_primitives::SigningKey,
        data_types::{ClientId, NodeId, Operation, ReplicaId, ViewNumber},
    },
};

use super::{logging::log_with_context, network::NetworkStub};

/// Short enough for tests to finish in seconds, long enough for a healthy view to complete well
/// before its timer fires.
pub(crate) const VIEW_TIMEOUT: Duration = Duration::from_millis(500);
pub(crate) const NOOP_DELAY: Duration = Duration::from_millis(50);

/// How long a client waits for a result before submitting another request.
const RESUBMIT_INTERVAL: Duration = Duration::from_millis(250);

/// A node the replica executed, as reported through its `ExecuteRequest` events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Execution {
    pub(crate) view: ViewNumber,
    pub(crate) node: NodeId,
    pub(crate) operation: Operation,
}

/// A running replica, together with the log of everything it executed.
pub(crate) struct Node {
    id: ReplicaId,
    executions: Arc<Mutex<Vec<Execution>>>,
    replica: Replica<NetworkStub>,
}

impl Node {
    pub(crate) fn new(
        id: u32,
        num_replicas: usize,
        network: NetworkStub,
        fault_mode: FaultMode,
        signing_key: Option<SigningKey>,
        verifier: impl CertificateVerifier + 'static,
    ) -> Node {
        let id = ReplicaId::new(id);
        let peer = Peer::Replica(id);
        let executions = Arc::new(Mutex::new(Vec::new()));

        let configuration = Configuration {
            me: id,
            num_replicas,
            view_timeout: VIEW_TIMEOUT,
            noop_delay: NOOP_DELAY,
            signing_key,
            fault_mode,
            log_events: false,
        };

        let replica = ReplicaSpec::builder()
            .network(network)
            .configuration(configuration)
            .verifier(verifier)
            .on_execute_request(execute_request_handler(peer, executions.clone()))
            .on_collect_qc(collect_qc_handler(peer))
            .on_view_timeout(view_timeout_handler(peer))
            .build()
            .start()
            .unwrap();

        Node {
            id,
            executions,
            replica,
        }
    }

    pub(crate) fn id(&self) -> ReplicaId {
        self.id
    }

    pub(crate) fn info(&self) -> ReplicaInfo {
        self.replica.info()
    }

    pub(crate) fn set_fault_mode(&self, mode: FaultMode) {
        self.replica.set_fault_mode(mode)
    }

    pub(crate) fn executions(&self) -> Vec<Execution> {
        self.executions.lock().unwrap().clone()
    }

    pub(crate) fn has_executed(&self, operation: &Operation) -> bool {
        self.executions
            .lock()
            .unwrap()
            .iter()
            .any(|execution| &execution.operation == operation)
    }
}

fn execute_request_handler(
    peer: Peer,
    executions: Arc<Mutex<Vec<Execution>>>,
) -> impl Fn(&ExecuteRequestEvent) + Send + 'static {
    move |execute_request_event| {
        log_with_context(
            Some(peer),
            &format!(
                "Executed, view: {}, node: {}, operation: {}",
                execute_request_event.view,
                execute_request_event.node,
                execute_request_event.request.operation
            ),
        );
        executions.lock().unwrap().push(Execution {
            view: execute_request_event.view,
            node: execute_request_event.node,
            operation: execute_request_event.request.operation.clone(),
        });
    }
}

fn collect_qc_handler(peer: Peer) -> impl Fn(&CollectQCEvent) + Send + 'static {
    move |collect_qc_event| {
        log_with_context(
            Some(peer),
            &format!(
                "Collected QC, view: {}, node: {}",
                collect_qc_event.quorum_certificate.view,
                collect_qc_event.quorum_certificate.node_id
            ),
        );
    }
}

fn view_timeout_handler(peer: Peer) -> impl Fn(&ViewTimeoutEvent) + Send + 'static {
    move |view_timeout_event| {
        log_with_context(
            Some(peer),
            &format!("View {} timed out", view_timeout_event.view),
        );
    }
}

pub(crate) fn start_client(network: NetworkStub, num_replicas: usize) -> Client<NetworkStub> {
    let configuration = ClientConfiguration::builder()
        .me(ClientId::new(0))
        .num_replicas(num_replicas)
        .log_events(false)
        .build();

    ClientSpec::builder()
        .network(network)
        .configuration(configuration)
        .on_accept_result(|accept_result_event: &AcceptResultEvent| {
            log_with_context(
                Some(Peer::Client(ClientId::new(0))),
                &format!(
                    "Accepted, timestamp: {}, result: {}",
                    accept_result_event.accepted.timestamp, accept_result_event.accepted.result
                ),
            );
        })
        .build()
        .start()
        .unwrap()
}

/// Submit requests for `label-0`, `label-1`, ... until a result is accepted for one of them.
/// Results accepted late for requests submitted under other labels are skipped.
///
/// Requests can be lost for good when the leader that received them is faulty, so waiting on a single
/// submission is not enough.
pub(crate) fn submit_until_accepted(
    client: &mut Client<NetworkStub>,
    label: &str,
    timeout: Duration,
) -> AcceptedResult {
    let prefix = format!("{}-", label);
    let deadline = Instant::now() + timeout;
    let mut attempt = 0;
    loop {
        client.submit(format!("{}{}", prefix, attempt));
        attempt += 1;

        let resubmit_at = Instant::now() + RESUBMIT_INTERVAL;
        while let Some(wait) = resubmit_at.checked_duration_since(Instant::now()) {
            match client.results().recv_timeout(wait) {
                Ok(accepted) if accepted.operation.bytes().starts_with(prefix.as_bytes()) => {
                    return accepted
                }
                Ok(accepted) => log::debug!("Skipping late result for {}", accepted.operation),
                Err(_) => break,
            }
        }
        assert!(
            Instant::now() < deadline,
            "no result accepted for {} after {} submissions",
            label,
            attempt
        );
    }
}

/// Poll until every node in `nodes` has executed `operation`.
pub(crate) fn wait_until_executed(nodes: &[&Node], operation: &Operation, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !nodes.iter().all(|node| node.has_executed(operation)) {
        assert!(
            Instant::now() < deadline,
            "{} was not executed by every replica in time",
            operation
        );
        thread::sleep(Duration::from_millis(50));
    }
}

/// Check that no two of `nodes` executed different nodes in the same view.
pub(crate) fn assert_no_conflicting_executions(nodes: &[&Node]) {
    let mut executed_in_view: HashMap<ViewNumber, (ReplicaId, NodeId)> = HashMap::new();
    for node in nodes {
        for execution in node.executions() {
            let (first_replica, first_node) = *executed_in_view
                .entry(execution.view)
                .or_insert((node.id(), execution.node));
            assert_eq!(
                first_node, execution.node,
                "replicas {} and {} executed different nodes in view {}",
                first_replica,
                node.id(),
                execution.view
            );
        }
    }
}

/// Check that a replica executes every node at most once, in increasing view order.
pub(crate) fn assert_executions_are_ordered(node: &Node) {
    let views: Vec<ViewNumber> = node
        .executions()
        .iter()
        .map(|execution| execution.view)
        .collect();
    assert!(
        views.windows(2).all(|pair| pair[0] < pair[1]),
        "replica {} executed out of order: {:?}",
        node.id(),
        views
    );
}
