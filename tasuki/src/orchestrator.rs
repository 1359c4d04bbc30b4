//! Multi-agent orchestration.
//!
//! Coordinates a set of cooperating agents: a registry of agent states, a
//! message router with per-agent mailboxes, a hierarchical task forest with
//! cascading cancellation, consensus voting, and a shared context. Routing
//! failures (unknown recipients) are logged and dropped, never raised.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::observability::epoch_millis;

/// Types of messages exchanged between agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// A request expecting a response.
    Request,
    /// A response to a request.
    Response,
    /// A broadcast to many agents.
    Broadcast,
    /// A consensus proposal notification.
    ConsensusProposal,
    /// A cast consensus vote.
    ConsensusVote,
    /// A shared-context update notification.
    ContextUpdate,
    /// An error report.
    Error,
    /// A task cancellation notice.
    Cancel,
}

/// Roles agents play in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Executes assigned tasks.
    Worker,
    /// Assigns and supervises work.
    Coordinator,
    /// Resolves disputes and ties.
    Arbiter,
    /// Watches without acting.
    Observer,
}

/// Liveness status of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Available for work.
    Idle,
    /// Currently working a task.
    Working,
    /// In a failed state.
    Error,
}

/// Status of a node in the task forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, not yet started.
    Pending,
    /// In progress.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Error,
    /// Canceled, along with every descendant.
    Canceled,
}

/// A node in the hierarchical task forest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNode {
    /// Unique task identifier.
    pub task_id: String,
    /// Parent task, when nested.
    pub parent_id: Option<String>,
    /// Agents assigned to the task.
    pub assigned_agents: Vec<String>,
    /// Current status.
    pub status: TaskStatus,
    /// Child task identifiers.
    pub children: BTreeSet<String>,
}

/// An inter-agent message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Unique message identifier.
    pub message_id: String,
    /// Sending agent, or `system`.
    pub sender_id: String,
    /// Recipient agent identifiers.
    pub recipients: Vec<String>,
    /// Message type.
    pub message_type: MessageType,
    /// Structured content.
    pub content: Value,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Higher is more urgent.
    pub priority: i32,
}

impl AgentMessage {
    /// Create a message of the given type.
    #[must_use]
    pub fn new(
        sender_id: impl Into<String>,
        recipients: Vec<String>,
        message_type: MessageType,
        content: Value,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().simple().to_string(),
            sender_id: sender_id.into(),
            recipients,
            message_type,
            content,
            timestamp_ms: epoch_millis(),
            priority: 0,
        }
    }

    /// Create a request message.
    #[must_use]
    pub fn request(sender_id: impl Into<String>, recipients: Vec<String>, content: Value) -> Self {
        Self::new(sender_id, recipients, MessageType::Request, content)
    }

    /// Create a response message to one recipient.
    #[must_use]
    pub fn response(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        content: Value,
    ) -> Self {
        Self::new(
            sender_id,
            vec![recipient_id.into()],
            MessageType::Response,
            content,
        )
    }

    /// Set the priority (builder pattern).
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Routes messages to per-agent mailboxes and keeps an append-only history.
///
/// Per-sender insertion order into each mailbox is preserved. Unknown
/// recipients are logged and skipped.
#[derive(Debug, Default)]
pub struct MessageRouter {
    mailboxes: HashMap<String, Vec<AgentMessage>>,
    history: Vec<AgentMessage>,
}

impl MessageRouter {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent to receive messages.
    pub fn register_agent(&mut self, agent_id: impl Into<String>) {
        self.mailboxes.entry(agent_id.into()).or_default();
    }

    /// Route a message to its recipients and record it in history.
    pub fn send_message(&mut self, message: AgentMessage) {
        for recipient in &message.recipients {
            match self.mailboxes.get_mut(recipient) {
                Some(mailbox) => mailbox.push(message.clone()),
                None => warn!(recipient = %recipient, "recipient not found, dropping"),
            }
        }
        debug!(sender = %message.sender_id, recipients = ?message.recipients, "message routed");
        self.history.push(message);
    }

    /// Drain all pending messages for an agent.
    #[must_use]
    pub fn get_messages(&mut self, agent_id: &str) -> Vec<AgentMessage> {
        self.mailboxes
            .get_mut(agent_id)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Broadcast content to the recipients, optionally excluding the sender.
    pub fn broadcast_message(
        &mut self,
        sender_id: &str,
        recipients: &[String],
        content: Value,
        exclude_sender: bool,
    ) {
        let actual: Vec<String> = recipients
            .iter()
            .filter(|r| !(exclude_sender && r.as_str() == sender_id))
            .cloned()
            .collect();
        self.send_message(AgentMessage::new(
            sender_id,
            actual,
            MessageType::Broadcast,
            content,
        ));
    }

    /// The append-only message history.
    #[must_use]
    pub fn history(&self) -> &[AgentMessage] {
        &self.history
    }
}

/// Consensus algorithms for agent agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusAlgorithm {
    /// Yes votes exceed half the votes cast.
    Majority,
    /// Every vote cast is yes.
    Unanimous,
    /// Yes weight exceeds half the total weight.
    Weighted,
    /// At least half the affected agents voted, and yes votes exceed half.
    Quorum,
}

/// Tracks votes for one proposal.
#[derive(Debug, Clone)]
pub struct ConsensusVote {
    /// Proposal identifier.
    pub proposal_id: String,
    /// The algorithm deciding the result.
    pub algorithm: ConsensusAlgorithm,
    /// Agents expected to vote.
    pub affected_agents: Vec<String>,
    votes: HashMap<String, bool>,
    weights: HashMap<String, f64>,
}

impl ConsensusVote {
    /// Create an empty vote.
    #[must_use]
    pub fn new(
        proposal_id: impl Into<String>,
        algorithm: ConsensusAlgorithm,
        affected_agents: Vec<String>,
    ) -> Self {
        Self {
            proposal_id: proposal_id.into(),
            algorithm,
            affected_agents,
            votes: HashMap::new(),
            weights: HashMap::new(),
        }
    }

    /// Cast (or replace) a vote with weight 1.
    pub fn cast_vote(&mut self, agent_id: impl Into<String>, vote: bool) {
        self.cast_weighted_vote(agent_id, vote, 1.0);
    }

    /// Cast (or replace) a weighted vote.
    pub fn cast_weighted_vote(&mut self, agent_id: impl Into<String>, vote: bool, weight: f64) {
        let agent_id = agent_id.into();
        self.votes.insert(agent_id.clone(), vote);
        self.weights.insert(agent_id, weight);
    }

    /// Number of votes cast so far.
    #[must_use]
    pub fn vote_count(&self) -> usize {
        self.votes.len()
    }

    /// Number of yes votes cast so far.
    #[must_use]
    pub fn yes_count(&self) -> usize {
        self.votes.values().filter(|v| **v).count()
    }

    /// Evaluate the proposal under its algorithm.
    ///
    /// Below `min_participants` cast votes the result is `false` regardless
    /// of algorithm.
    #[must_use]
    pub fn result(&self, min_participants: usize) -> bool {
        if self.votes.len() < min_participants {
            return false;
        }

        match self.algorithm {
            ConsensusAlgorithm::Majority => {
                self.yes_count() as f64 > self.votes.len() as f64 / 2.0
            }
            ConsensusAlgorithm::Unanimous => {
                !self.votes.is_empty() && self.votes.values().all(|v| *v)
            }
            ConsensusAlgorithm::Weighted => {
                let yes_weight: f64 = self
                    .votes
                    .iter()
                    .filter(|(_, v)| **v)
                    .map(|(agent, _)| self.weights.get(agent).copied().unwrap_or(1.0))
                    .sum();
                let total_weight: f64 = self.weights.values().sum();
                yes_weight > total_weight / 2.0
            }
            ConsensusAlgorithm::Quorum => {
                let expected = self.affected_agents.len().max(1);
                let participation = self.votes.len() as f64 / expected as f64;
                participation >= 0.5 && self.yes_count() as f64 > self.votes.len() as f64 / 2.0
            }
        }
    }
}

/// One access-log entry on the shared context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextAccess {
    /// `get` or `set`.
    pub action: String,
    /// The key touched.
    pub key: String,
    /// Which agent touched it.
    pub agent_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

/// Shared state accessible to all agents in the system.
#[derive(Debug, Clone, Default)]
pub struct SharedContext {
    /// Unique context identifier.
    pub context_id: String,
    /// The overall system goal, if set.
    pub global_goal: Option<String>,
    shared_data: HashMap<String, Value>,
    access_log: Vec<ContextAccess>,
}

impl SharedContext {
    /// Create a context with an optional global goal.
    #[must_use]
    pub fn new(global_goal: Option<String>) -> Self {
        Self {
            context_id: Uuid::new_v4().simple().to_string(),
            global_goal,
            shared_data: HashMap::new(),
            access_log: Vec::new(),
        }
    }

    /// Set a value, attributing the write to an agent.
    pub fn set_data(&mut self, key: impl Into<String>, value: Value, agent_id: &str) {
        let key = key.into();
        self.shared_data.insert(key.clone(), value);
        self.access_log.push(ContextAccess {
            action: "set".to_owned(),
            key,
            agent_id: agent_id.to_owned(),
            timestamp_ms: epoch_millis(),
        });
    }

    /// Get a value, attributing the read to an agent.
    #[must_use]
    pub fn get_data(&mut self, key: &str, agent_id: &str) -> Option<Value> {
        self.access_log.push(ContextAccess {
            action: "get".to_owned(),
            key: key.to_owned(),
            agent_id: agent_id.to_owned(),
            timestamp_ms: epoch_millis(),
        });
        self.shared_data.get(key).cloned()
    }

    /// The access log, oldest first.
    #[must_use]
    pub fn access_log(&self) -> &[ContextAccess] {
        &self.access_log
    }
}

/// State of one registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// Unique agent identifier.
    pub agent_id: String,
    /// Human-readable name.
    pub name: String,
    /// Role in the system.
    pub role: AgentRole,
    /// Liveness status.
    pub status: AgentStatus,
    /// The task currently worked, if any.
    pub current_task: Option<String>,
    /// Last heartbeat, milliseconds since the Unix epoch.
    pub last_heartbeat_ms: u64,
    /// Rolling performance score.
    pub performance_score: f64,
    /// Messages sent by this agent.
    pub message_count: u64,
    /// Errors recorded for this agent.
    pub error_count: u64,
}

/// Aggregated system status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    /// System identifier.
    pub system_id: String,
    /// Milliseconds since the orchestrator was created.
    pub uptime_ms: u64,
    /// Registered agents.
    pub total_agents: usize,
    /// Agents currently working.
    pub working_agents: usize,
    /// Agents currently idle.
    pub idle_agents: usize,
    /// Agents in an error state.
    pub failed_agents: usize,
    /// Messages recorded in router history.
    pub message_history_size: usize,
    /// Consensus proposals still open.
    pub active_consensus: usize,
}

/// Orchestrates multiple agents working together.
#[derive(Debug)]
pub struct MultiAgentOrchestrator {
    /// System identifier used in logs and status reports.
    pub system_id: String,
    agents: HashMap<String, AgentState>,
    router: MessageRouter,
    shared_context: Option<SharedContext>,
    active_consensus: HashMap<String, ConsensusVote>,
    tasks: HashMap<String, TaskNode>,
    created_at_ms: u64,
}

impl Default for MultiAgentOrchestrator {
    fn default() -> Self {
        Self::new("multi-agent-system")
    }
}

impl MultiAgentOrchestrator {
    /// Create an orchestrator.
    #[must_use]
    pub fn new(system_id: impl Into<String>) -> Self {
        Self {
            system_id: system_id.into(),
            agents: HashMap::new(),
            router: MessageRouter::new(),
            shared_context: None,
            active_consensus: HashMap::new(),
            tasks: HashMap::new(),
            created_at_ms: epoch_millis(),
        }
    }

    /// Register a new agent, replacing any previous state under the id.
    pub fn register_agent(
        &mut self,
        agent_id: impl Into<String>,
        name: impl Into<String>,
        role: AgentRole,
    ) -> &AgentState {
        let agent_id = agent_id.into();
        let state = AgentState {
            agent_id: agent_id.clone(),
            name: name.into(),
            role,
            status: AgentStatus::Idle,
            current_task: None,
            last_heartbeat_ms: epoch_millis(),
            performance_score: 1.0,
            message_count: 0,
            error_count: 0,
        };
        info!(agent = %agent_id, name = %state.name, "registered agent");
        self.router.register_agent(&agent_id);
        match self.agents.entry(agent_id) {
            Entry::Occupied(mut occupied) => {
                occupied.insert(state);
                occupied.into_mut()
            }
            Entry::Vacant(vacant) => vacant.insert(state),
        }
    }

    /// A registered agent's state.
    #[must_use]
    pub fn agent(&self, agent_id: &str) -> Option<&AgentState> {
        self.agents.get(agent_id)
    }

    /// All registered agent states.
    #[must_use]
    pub fn agents(&self) -> &HashMap<String, AgentState> {
        &self.agents
    }

    /// Record a heartbeat for the agent.
    pub fn heartbeat(&mut self, agent_id: &str) {
        if let Some(state) = self.agents.get_mut(agent_id) {
            state.last_heartbeat_ms = epoch_millis();
        }
    }

    /// Update an agent's status and current task.
    pub fn set_agent_status(
        &mut self,
        agent_id: &str,
        status: AgentStatus,
        current_task: Option<String>,
    ) {
        if let Some(state) = self.agents.get_mut(agent_id) {
            state.status = status;
            state.current_task = current_task;
            if status == AgentStatus::Error {
                state.error_count += 1;
            }
        }
    }

    /// Create the shared context for all agents.
    pub fn create_shared_context(&mut self, global_goal: Option<String>) -> &mut SharedContext {
        let context = SharedContext::new(global_goal);
        info!(context = %context.context_id, "created shared context");
        self.shared_context.insert(context)
    }

    /// The shared context, if created.
    #[must_use]
    pub fn shared_context_mut(&mut self) -> Option<&mut SharedContext> {
        self.shared_context.as_mut()
    }

    /// Register a hierarchical task, linking it under its parent if any.
    pub fn create_task(
        &mut self,
        task_id: impl Into<String>,
        assigned_agents: Vec<String>,
        parent_id: Option<String>,
    ) -> &TaskNode {
        let task_id = task_id.into();
        if let Some(parent_id) = &parent_id
            && let Some(parent) = self.tasks.get_mut(parent_id)
        {
            parent.children.insert(task_id.clone());
        }

        let node = TaskNode {
            task_id: task_id.clone(),
            parent_id,
            assigned_agents,
            status: TaskStatus::Pending,
            children: BTreeSet::new(),
        };
        match self.tasks.entry(task_id) {
            Entry::Occupied(mut occupied) => {
                occupied.insert(node);
                occupied.into_mut()
            }
            Entry::Vacant(vacant) => vacant.insert(node),
        }
    }

    /// A task node by id.
    #[must_use]
    pub fn task(&self, task_id: &str) -> Option<&TaskNode> {
        self.tasks.get(task_id)
    }

    /// Set a task's status, if it exists.
    pub fn set_task_status(&mut self, task_id: &str, status: TaskStatus) {
        if let Some(node) = self.tasks.get_mut(task_id) {
            node.status = status;
        }
    }

    /// Cancel a task and every descendant.
    ///
    /// Each canceled node's assigned agents receive a `Cancel` message
    /// carrying the canceled task id and the reason. In-flight work is not
    /// pre-empted; agents discover cancellation by draining their mailbox.
    pub fn cancel_task(&mut self, task_id: &str, reason: &str) {
        let mut pending = vec![task_id.to_owned()];
        while let Some(current) = pending.pop() {
            let Some(node) = self.tasks.get_mut(&current) else {
                continue;
            };
            node.status = TaskStatus::Canceled;
            let assigned = node.assigned_agents.clone();
            pending.extend(node.children.iter().cloned());

            info!(task = %current, %reason, "canceled task");
            if !assigned.is_empty() {
                self.send_message(
                    "system",
                    assigned,
                    MessageType::Cancel,
                    json!({"task_id": current, "reason": reason}),
                );
            }
        }
    }

    /// Send a message between agents, counting it for the sender.
    pub fn send_message(
        &mut self,
        sender_id: &str,
        recipients: Vec<String>,
        message_type: MessageType,
        content: Value,
    ) {
        self.router
            .send_message(AgentMessage::new(sender_id, recipients, message_type, content));
        if let Some(sender) = self.agents.get_mut(sender_id) {
            sender.message_count += 1;
        }
    }

    /// Drain all pending messages for an agent.
    #[must_use]
    pub fn get_messages(&mut self, agent_id: &str) -> Vec<AgentMessage> {
        self.router.get_messages(agent_id)
    }

    /// The message router.
    #[must_use]
    pub const fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Propose a consensus decision, notifying the affected agents.
    pub fn propose_consensus(
        &mut self,
        proposal_id: impl Into<String>,
        algorithm: ConsensusAlgorithm,
        affected_agents: Vec<String>,
    ) {
        let proposal_id = proposal_id.into();
        info!(proposal = %proposal_id, ?algorithm, "proposed consensus");
        self.active_consensus.insert(
            proposal_id.clone(),
            ConsensusVote::new(&proposal_id, algorithm, affected_agents.clone()),
        );
        self.send_message(
            "system",
            affected_agents,
            MessageType::ConsensusProposal,
            json!({"proposal_id": proposal_id, "algorithm": algorithm}),
        );
    }

    /// Cast a vote on an open proposal.
    pub fn cast_vote(&mut self, proposal_id: &str, agent_id: &str, vote: bool, weight: f64) {
        match self.active_consensus.get_mut(proposal_id) {
            Some(consensus) => consensus.cast_weighted_vote(agent_id, vote, weight),
            None => warn!(proposal = %proposal_id, "vote on unknown proposal dropped"),
        }
    }

    /// Evaluate an open proposal, requiring at least one vote.
    #[must_use]
    pub fn consensus_result(&self, proposal_id: &str) -> Option<bool> {
        self.active_consensus
            .get(proposal_id)
            .map(|consensus| consensus.result(1))
    }

    /// An open proposal's vote state.
    #[must_use]
    pub fn consensus(&self, proposal_id: &str) -> Option<&ConsensusVote> {
        self.active_consensus.get(proposal_id)
    }

    /// Close a proposal, returning its final vote state.
    pub fn close_consensus(&mut self, proposal_id: &str) -> Option<ConsensusVote> {
        self.active_consensus.remove(proposal_id)
    }

    /// Aggregate status across the whole system.
    #[must_use]
    pub fn system_status(&self) -> SystemStatus {
        let statuses: Vec<AgentStatus> = self.agents.values().map(|a| a.status).collect();
        SystemStatus {
            system_id: self.system_id.clone(),
            uptime_ms: epoch_millis().saturating_sub(self.created_at_ms),
            total_agents: self.agents.len(),
            working_agents: statuses.iter().filter(|s| **s == AgentStatus::Working).count(),
            idle_agents: statuses.iter().filter(|s| **s == AgentStatus::Idle).count(),
            failed_agents: statuses.iter().filter(|s| **s == AgentStatus::Error).count(),
            message_history_size: self.router.history().len(),
            active_consensus: self.active_consensus.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator_with_agents(ids: &[&str]) -> MultiAgentOrchestrator {
        let mut orchestrator = MultiAgentOrchestrator::new("test-system");
        for id in ids {
            orchestrator.register_agent(*id, format!("Agent {id}"), AgentRole::Worker);
        }
        orchestrator
    }

    mod registry {
        use super::*;

        #[test]
        fn registration_initializes_state() {
            let orchestrator = orchestrator_with_agents(&["a1"]);
            let state = orchestrator.agent("a1").unwrap();
            assert_eq!(state.status, AgentStatus::Idle);
            assert_eq!(state.role, AgentRole::Worker);
            assert_eq!(state.performance_score, 1.0);
            assert_eq!(state.message_count, 0);
        }

        #[test]
        fn status_updates_track_errors() {
            let mut orchestrator = orchestrator_with_agents(&["a1"]);
            orchestrator.set_agent_status("a1", AgentStatus::Working, Some("t1".into()));
            assert_eq!(orchestrator.agent("a1").unwrap().current_task.as_deref(), Some("t1"));

            orchestrator.set_agent_status("a1", AgentStatus::Error, None);
            assert_eq!(orchestrator.agent("a1").unwrap().error_count, 1);
        }

        #[test]
        fn system_status_counts_by_state() {
            let mut orchestrator = orchestrator_with_agents(&["a1", "a2", "a3"]);
            orchestrator.set_agent_status("a1", AgentStatus::Working, None);
            orchestrator.set_agent_status("a2", AgentStatus::Error, None);

            let status = orchestrator.system_status();
            assert_eq!(status.total_agents, 3);
            assert_eq!(status.working_agents, 1);
            assert_eq!(status.idle_agents, 1);
            assert_eq!(status.failed_agents, 1);
        }
    }

    mod routing {
        use super::*;

        #[test]
        fn messages_reach_each_recipient_in_order() {
            let mut orchestrator = orchestrator_with_agents(&["a1", "a2"]);
            orchestrator.send_message(
                "a1",
                vec!["a2".into()],
                MessageType::Request,
                json!({"n": 1}),
            );
            orchestrator.send_message(
                "a1",
                vec!["a2".into()],
                MessageType::Request,
                json!({"n": 2}),
            );

            let inbox = orchestrator.get_messages("a2");
            assert_eq!(inbox.len(), 2);
            assert_eq!(inbox[0].content["n"], 1);
            assert_eq!(inbox[1].content["n"], 2);
            // Drained.
            assert!(orchestrator.get_messages("a2").is_empty());
        }

        #[test]
        fn sender_message_count_increments() {
            let mut orchestrator = orchestrator_with_agents(&["a1", "a2"]);
            orchestrator.send_message("a1", vec!["a2".into()], MessageType::Request, json!({}));
            assert_eq!(orchestrator.agent("a1").unwrap().message_count, 1);
        }

        #[test]
        fn unknown_recipient_is_dropped_not_raised() {
            let mut orchestrator = orchestrator_with_agents(&["a1"]);
            orchestrator.send_message("a1", vec!["ghost".into()], MessageType::Request, json!({}));
            // History still records the message.
            assert_eq!(orchestrator.router().history().len(), 1);
        }

        #[test]
        fn broadcast_can_exclude_sender() {
            let mut router = MessageRouter::new();
            router.register_agent("a1");
            router.register_agent("a2");

            router.broadcast_message(
                "a1",
                &["a1".to_owned(), "a2".to_owned()],
                json!({"hello": true}),
                true,
            );
            assert!(router.get_messages("a1").is_empty());
            assert_eq!(router.get_messages("a2").len(), 1);
        }
    }

    mod tasks {
        use super::*;

        #[test]
        fn create_task_links_children() {
            let mut orchestrator = orchestrator_with_agents(&["a1"]);
            orchestrator.create_task("parent", vec!["a1".into()], None);
            orchestrator.create_task("child", vec![], Some("parent".into()));

            let parent = orchestrator.task("parent").unwrap();
            assert!(parent.children.contains("child"));
            assert_eq!(
                orchestrator.task("child").unwrap().parent_id.as_deref(),
                Some("parent")
            );
        }

        #[test]
        fn cancel_cascades_to_all_descendants() {
            let mut orchestrator = orchestrator_with_agents(&["a1"]);
            orchestrator.create_task("root", vec![], None);
            orchestrator.create_task("child-a", vec![], Some("root".into()));
            orchestrator.create_task("child-b", vec![], Some("root".into()));
            orchestrator.create_task("grandchild", vec![], Some("child-a".into()));

            orchestrator.cancel_task("root", "shutdown");

            for task_id in ["root", "child-a", "child-b", "grandchild"] {
                assert_eq!(
                    orchestrator.task(task_id).unwrap().status,
                    TaskStatus::Canceled,
                    "{task_id} should be canceled"
                );
            }
        }

        #[test]
        fn cancel_notifies_assigned_agents() {
            // Scenario: parent and child both assigned to a1.
            let mut orchestrator = orchestrator_with_agents(&["a1"]);
            orchestrator.create_task("parent", vec!["a1".into()], None);
            orchestrator.create_task("child", vec!["a1".into()], Some("parent".into()));

            orchestrator.cancel_task("parent", "test");

            assert_eq!(orchestrator.task("parent").unwrap().status, TaskStatus::Canceled);
            assert_eq!(orchestrator.task("child").unwrap().status, TaskStatus::Canceled);

            let inbox = orchestrator.get_messages("a1");
            let cancel_messages: Vec<&AgentMessage> = inbox
                .iter()
                .filter(|m| m.message_type == MessageType::Cancel)
                .collect();
            assert!(!cancel_messages.is_empty());
            assert!(cancel_messages.iter().any(|m| {
                m.content["task_id"] == "parent" && m.content["reason"] == "test"
            }));
        }

        #[test]
        fn cancel_unknown_task_is_a_no_op() {
            let mut orchestrator = orchestrator_with_agents(&["a1"]);
            orchestrator.cancel_task("ghost", "reason");
            assert!(orchestrator.task("ghost").is_none());
        }
    }

    mod consensus {
        use super::*;

        fn proposal(
            orchestrator: &mut MultiAgentOrchestrator,
            algorithm: ConsensusAlgorithm,
        ) -> &'static str {
            orchestrator.propose_consensus(
                "prop-1",
                algorithm,
                vec!["a1".into(), "a2".into(), "a3".into()],
            );
            "prop-1"
        }

        #[test]
        fn majority_passes_two_of_three() {
            let mut orchestrator = orchestrator_with_agents(&["a1", "a2", "a3"]);
            let id = proposal(&mut orchestrator, ConsensusAlgorithm::Majority);

            orchestrator.cast_vote(id, "a1", true, 1.0);
            orchestrator.cast_vote(id, "a2", true, 1.0);
            orchestrator.cast_vote(id, "a3", false, 1.0);

            assert_eq!(orchestrator.consensus_result(id), Some(true));
        }

        #[test]
        fn majority_fails_on_even_split() {
            let mut vote = ConsensusVote::new("p", ConsensusAlgorithm::Majority, vec![]);
            vote.cast_vote("a1", true);
            vote.cast_vote("a2", false);
            assert!(!vote.result(1));
        }

        #[test]
        fn unanimous_requires_every_yes() {
            let mut vote = ConsensusVote::new("p", ConsensusAlgorithm::Unanimous, vec![]);
            vote.cast_vote("a1", true);
            vote.cast_vote("a2", true);
            assert!(vote.result(1));

            vote.cast_vote("a3", false);
            assert!(!vote.result(1));
        }

        #[test]
        fn weighted_follows_weight_not_count() {
            let mut vote = ConsensusVote::new("p", ConsensusAlgorithm::Weighted, vec![]);
            vote.cast_weighted_vote("heavy", true, 5.0);
            vote.cast_weighted_vote("light-a", false, 1.0);
            vote.cast_weighted_vote("light-b", false, 1.0);
            assert!(vote.result(1));
        }

        #[test]
        fn quorum_requires_half_participation() {
            let affected: Vec<String> =
                (1..=4).map(|n| format!("a{n}")).collect();
            let mut vote = ConsensusVote::new("p", ConsensusAlgorithm::Quorum, affected);

            vote.cast_vote("a1", true);
            // One of four voted: below the participation floor.
            assert!(!vote.result(1));

            vote.cast_vote("a2", true);
            // Two of four voted, both yes.
            assert!(vote.result(1));
        }

        #[test]
        fn below_min_participants_is_false() {
            let mut vote = ConsensusVote::new("p", ConsensusAlgorithm::Majority, vec![]);
            vote.cast_vote("a1", true);
            assert!(!vote.result(2));
        }

        #[test]
        fn proposal_notifies_affected_agents() {
            let mut orchestrator = orchestrator_with_agents(&["a1", "a2", "a3"]);
            proposal(&mut orchestrator, ConsensusAlgorithm::Majority);

            for agent in ["a1", "a2", "a3"] {
                let inbox = orchestrator.get_messages(agent);
                assert!(inbox
                    .iter()
                    .any(|m| m.message_type == MessageType::ConsensusProposal));
            }
        }

        #[test]
        fn close_removes_the_proposal() {
            let mut orchestrator = orchestrator_with_agents(&["a1"]);
            orchestrator.propose_consensus("p", ConsensusAlgorithm::Majority, vec!["a1".into()]);
            assert!(orchestrator.close_consensus("p").is_some());
            assert!(orchestrator.consensus_result("p").is_none());
            assert_eq!(orchestrator.system_status().active_consensus, 0);
        }
    }

    mod shared_context {
        use super::*;

        #[test]
        fn set_and_get_with_access_log() {
            let mut orchestrator = orchestrator_with_agents(&["a1"]);
            orchestrator.create_shared_context(Some("solve it".into()));

            let context = orchestrator.shared_context_mut().unwrap();
            context.set_data("findings", json!(["x"]), "a1");
            let value = context.get_data("findings", "a1").unwrap();
            assert_eq!(value, json!(["x"]));

            let log = context.access_log();
            assert_eq!(log.len(), 2);
            assert_eq!(log[0].action, "set");
            assert_eq!(log[1].action, "get");
            assert_eq!(context.global_goal.as_deref(), Some("solve it"));
        }

        #[test]
        fn missing_key_reads_are_logged_too() {
            let mut context = SharedContext::new(None);
            assert!(context.get_data("nothing", "a1").is_none());
            assert_eq!(context.access_log().len(), 1);
        }
    }
}
