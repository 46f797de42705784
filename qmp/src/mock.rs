//! In-memory stand-in for qemu-storage-daemon.
//!
//! [`MockTransport`] keeps a miniature block graph (nodes, exports, jobs),
//! answers commands the way the daemon does for the subset the storage layer
//! uses, and emits `JOB_STATUS_CHANGE` events for every job. Failures can be
//! scripted per command or per job.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    command::{BlockdevOptions, CreateOptions},
    query::{JobInfo, NamedBlockNode},
    Command, Event, EventStream, JobStatus, QmpError, ReplyError, Transport,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockNode {
    pub driver: String,
    pub filename: String,
    /// Protocol node under a format node.
    pub file_node: Option<String>,
    pub backing: Option<String>,
}

#[derive(Default)]
struct MockState {
    commands: Vec<Command>,
    nodes: BTreeMap<String, MockNode>,
    /// Export id to node-name.
    exports: BTreeMap<String, String>,
    jobs: BTreeMap<String, JobInfo>,
    scripted_failures: VecDeque<(String, ReplyError)>,
    failing_jobs: BTreeMap<String, String>,
    hold_jobs: bool,
    disconnected: bool,
}

pub struct MockTransport {
    state: Mutex<MockState>,
    events: broadcast::Sender<Event>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(MockState::default()),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Fail the next command named `command` (wire name) with `desc`.
    pub fn fail_next(&self, command: &str, desc: &str) {
        self.state().scripted_failures.push_back((
            command.to_string(),
            ReplyError {
                class: "GenericError".to_string(),
                desc: desc.to_string(),
            },
        ));
    }

    /// Let the job `job_id` conclude with `error`.
    pub fn fail_job(&self, job_id: &str, error: &str) {
        self.state()
            .failing_jobs
            .insert(job_id.to_string(), error.to_string());
    }

    /// Keep jobs running forever, so job waits run into their deadline.
    pub fn hold_jobs(&self, hold: bool) {
        self.state().hold_jobs = hold;
    }

    /// Fail every command with [`QmpError::Disconnected`].
    pub fn set_disconnected(&self, disconnected: bool) {
        self.state().disconnected = disconnected;
    }

    pub fn commands(&self) -> Vec<Command> {
        self.state().commands.clone()
    }

    pub fn command_names(&self) -> Vec<String> {
        self.state()
            .commands
            .iter()
            .map(|c| c.as_ref().to_string())
            .collect()
    }

    pub fn count(&self, command: &str) -> usize {
        self.state()
            .commands
            .iter()
            .filter(|c| c.as_ref() == command)
            .count()
    }

    pub fn clear_commands(&self) {
        self.state().commands.clear();
    }

    pub fn node(&self, node_name: &str) -> Option<MockNode> {
        self.state().nodes.get(node_name).cloned()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.state().nodes.keys().cloned().collect()
    }

    pub fn exports(&self) -> BTreeMap<String, String> {
        self.state().exports.clone()
    }

    pub fn jobs(&self) -> Vec<JobInfo> {
        self.state().jobs.values().cloned().collect()
    }

    /// Put a node in the graph without going through commands, e.g. to model
    /// state left behind by an earlier process.
    pub fn insert_node(&self, node_name: &str, node: MockNode) {
        self.state().nodes.insert(node_name.to_string(), node);
    }

    fn emit(&self, job_id: &str, status: JobStatus) {
        // Nobody listening is fine.
        let _ = self.events.send(Event::job_status_change(job_id, status));
    }

    fn start_job(&self, state: &mut MockState, job_id: &str, job_type: &str) -> Result<(), ReplyError> {
        if state.jobs.contains_key(job_id) {
            return Err(generic(format!("Job ID '{}' already in use", job_id)));
        }
        let error = state.failing_jobs.remove(job_id);
        let status = if state.hold_jobs {
            JobStatus::Running
        } else {
            JobStatus::Concluded
        };
        state.jobs.insert(
            job_id.to_string(),
            JobInfo {
                id: job_id.to_string(),
                job_type: job_type.to_string(),
                status,
                current_progress: 1,
                total_progress: 1,
                error,
            },
        );
        self.emit(job_id, JobStatus::Created);
        self.emit(job_id, JobStatus::Running);
        if status == JobStatus::Concluded {
            self.emit(job_id, JobStatus::Pending);
            self.emit(job_id, JobStatus::Concluded);
        }
        Ok(())
    }

    fn apply(&self, state: &mut MockState, command: &Command) -> Result<Value, ReplyError> {
        match command {
            Command::QmpCapabilities => Ok(json!({})),
            Command::BlockdevCreate { job_id, options } => {
                match options {
                    CreateOptions::File { filename, .. } => {
                        let _ = std::fs::write(filename, b"");
                    }
                    CreateOptions::Qcow2 { file, .. } => {
                        require_node(state, file)?;
                    }
                }
                self.start_job(state, job_id, "create")?;
                Ok(json!({}))
            }
            Command::BlockdevAdd(options) => {
                let (node_name, node) = match options {
                    BlockdevOptions::File {
                        node_name,
                        filename,
                    } => (
                        node_name,
                        MockNode {
                            driver: "file".to_string(),
                            filename: filename.clone(),
                            file_node: None,
                            backing: None,
                        },
                    ),
                    BlockdevOptions::Qcow2 {
                        node_name,
                        file,
                        backing,
                    } => {
                        let filename = require_node(state, file)?.filename.clone();
                        let backing = match backing {
                            Some(Some(backing)) => {
                                require_node(state, backing)?;
                                Some(backing.clone())
                            }
                            _ => None,
                        };
                        (
                            node_name,
                            MockNode {
                                driver: "qcow2".to_string(),
                                filename,
                                file_node: Some(file.clone()),
                                backing,
                            },
                        )
                    }
                };
                if state.nodes.contains_key(node_name) {
                    return Err(generic(format!("Duplicate nodes with node-name='{}'", node_name)));
                }
                state.nodes.insert(node_name.clone(), node);
                Ok(json!({}))
            }
            Command::BlockdevDel { node_name } => {
                require_node(state, node_name)?;
                let used_by_node = state.nodes.values().any(|n| {
                    n.backing.as_deref() == Some(node_name.as_str())
                        || n.file_node.as_deref() == Some(node_name.as_str())
                });
                let exported = state.exports.values().any(|n| n == node_name);
                if used_by_node || exported {
                    return Err(generic(format!(
                        "Node '{}' is busy: node is used as backing hd",
                        node_name
                    )));
                }
                state.nodes.remove(node_name);
                Ok(json!({}))
            }
            Command::BlockdevSnapshot { node, overlay } => {
                require_node(state, node)?;
                let overlay_node = require_node(state, overlay)?;
                if overlay_node.backing.is_some() {
                    return Err(generic(format!(
                        "The overlay '{}' already has a backing image",
                        overlay
                    )));
                }
                if let Some(o) = state.nodes.get_mut(overlay) {
                    o.backing = Some(node.clone());
                }
                // The overlay takes the node's place for every user of the node.
                for exported in state.exports.values_mut() {
                    if exported == node {
                        *exported = overlay.clone();
                    }
                }
                Ok(json!({}))
            }
            Command::BlockStream {
                job_id,
                device,
                base_node,
                ..
            } => {
                require_node(state, device)?;
                if let Some(base) = base_node {
                    require_node(state, base)?;
                }
                self.start_job(state, job_id, "stream")?;
                if let Some(d) = state.nodes.get_mut(device) {
                    d.backing = base_node.clone();
                }
                Ok(json!({}))
            }
            Command::BlockCommit { job_id, device, .. } => {
                require_node(state, device)?;
                self.start_job(state, job_id, "commit")?;
                Ok(json!({}))
            }
            Command::JobCancel { id } => {
                let job = state
                    .jobs
                    .get_mut(id)
                    .ok_or_else(|| generic(format!("Job not found: '{}'", id)))?;
                if job.status == JobStatus::Concluded {
                    return Err(generic(format!(
                        "Job '{}' in state 'concluded' cannot accept command verb 'cancel'",
                        id
                    )));
                }
                job.status = JobStatus::Concluded;
                job.error = Some("Operation cancelled".to_string());
                self.emit(id, JobStatus::Aborting);
                self.emit(id, JobStatus::Concluded);
                Ok(json!({}))
            }
            Command::JobDismiss { id } => {
                let job = state
                    .jobs
                    .get(id)
                    .ok_or_else(|| generic(format!("Job not found: '{}'", id)))?;
                if job.status != JobStatus::Concluded {
                    return Err(generic(format!(
                        "Job '{}' in state '{:?}' cannot accept command verb 'dismiss'",
                        id, job.status
                    )));
                }
                state.jobs.remove(id);
                Ok(json!({}))
            }
            Command::QueryJobs => Ok(serde_json::to_value(
                state.jobs.values().cloned().collect::<Vec<_>>(),
            )
            .unwrap_or_default()),
            Command::BlockExportAdd { id, node_name, .. } => {
                require_node(state, node_name)?;
                if state.exports.contains_key(id) {
                    return Err(generic(format!("Block export id '{}' is already in use", id)));
                }
                state.exports.insert(id.clone(), node_name.clone());
                Ok(json!({}))
            }
            Command::BlockExportDel { id } => {
                if state.exports.remove(id).is_none() {
                    return Err(generic(format!("Export '{}' is not found", id)));
                }
                Ok(json!({}))
            }
            Command::QueryNamedBlockNodes => {
                let nodes: Vec<NamedBlockNode> = state
                    .nodes
                    .iter()
                    .map(|(name, node)| NamedBlockNode {
                        node_name: name.clone(),
                        drv: node.driver.clone(),
                        file: node.filename.clone(),
                        ro: false,
                        backing_file_depth: backing_depth(state, name),
                        image: None,
                    })
                    .collect();
                Ok(serde_json::to_value(nodes).unwrap_or_default())
            }
        }
    }
}

fn generic(desc: String) -> ReplyError {
    ReplyError {
        class: "GenericError".to_string(),
        desc,
    }
}

fn require_node<'a>(state: &'a MockState, node_name: &str) -> Result<&'a MockNode, ReplyError> {
    state.nodes.get(node_name).ok_or_else(|| {
        generic(format!(
            "Failed to find node with node-name='{}'",
            node_name
        ))
    })
}

fn backing_depth(state: &MockState, node_name: &str) -> u32 {
    let mut depth = 0;
    let mut current = state.nodes.get(node_name).and_then(|n| n.backing.clone());
    while let Some(name) = current {
        depth += 1;
        current = state.nodes.get(&name).and_then(|n| n.backing.clone());
    }
    depth
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, command: &Command) -> Result<Value, QmpError> {
        let mut state = self.state();
        if state.disconnected {
            return Err(QmpError::Disconnected);
        }
        state.commands.push(command.clone());

        let scripted = state
            .scripted_failures
            .iter()
            .position(|(name, _)| name == command.as_ref());
        if let Some(pos) = scripted {
            if let Some((_, err)) = state.scripted_failures.remove(pos) {
                return Err(QmpError::command(command, err));
            }
        }

        self.apply(&mut state, command)
            .map_err(|err| QmpError::command(command, err))
    }

    async fn subscribe_events(&self) -> Result<EventStream, QmpError> {
        if self.state().disconnected {
            return Err(QmpError::Disconnected);
        }
        Ok(BroadcastStream::new(self.events.subscribe())
            .filter_map(|item| async move { item.ok() })
            .boxed())
    }
}
