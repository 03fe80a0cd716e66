use std::time::{Duration, Instant};

use crate::jobs::{JobManager, JobState};
use crate::liveness::{Liveness, LivenessEvent};
use crate::protocol::message::{Inbound, Outbound, ProtocolError};

/// Applies coordinator messages to the job table and liveness tracker and
/// decides what to send back.
///
/// | inbound | job | effect | reply |
/// |---|---|---|---|
/// | `START` | unknown | start worker | `START_OK` |
/// | `START` | running | - | `START_OK` |
/// | `START` | ended | - | `END(id, 0)` |
/// | `CANCEL` | running | cancel worker | `END(id, 0)` |
/// | `CANCEL` | ended | - | `END(id, 0)` |
/// | `CANCEL` | unknown | record ended job | `END(id, 0)` |
/// | `STATUS` | running | - | `START_OK` |
/// | `STATUS` | ended | - | `END(id, status)` |
/// | `STATUS` | unknown | record ended job | `END(id, 0)` |
/// | `END_OK` | any | forget job | - |
///
/// Every row except `END_OK` also counts as proof the coordinator is alive,
/// as does `PONG`.
pub struct ProtocolEngine {
    jobs: JobManager,
    liveness: Liveness,
}

impl ProtocolEngine {
    pub fn new(jobs: JobManager, now: Instant) -> Self {
        Self {
            jobs,
            liveness: Liveness::new(now),
        }
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Decode and apply one raw message. Malformed or unknown messages are
    /// logged and produce no reply.
    pub async fn handle(&mut self, frames: &[String], now: Instant) -> Vec<Outbound> {
        match Inbound::decode(frames) {
            Ok(message) => self.dispatch(message, now).await,
            Err(ProtocolError::UnknownAction(action)) => {
                tracing::warn!(action, "Unexpected message from coordinator, ignoring");
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed message");
                Vec::new()
            }
        }
    }

    pub async fn dispatch(&mut self, message: Inbound, now: Instant) -> Vec<Outbound> {
        tracing::debug!(action = message.action(), "Received message");
        match message {
            Inbound::HelloOk => {
                tracing::debug!("Ignoring late HELLO_OK");
                Vec::new()
            }
            Inbound::Pong => {
                self.mark_alive(now);
                Vec::new()
            }
            Inbound::Start(request) => {
                self.mark_alive(now);
                let id = request.id;
                match self.jobs.state(id) {
                    None => {
                        self.jobs.start(&request).await;
                        vec![Outbound::StartOk { id }]
                    }
                    Some(JobState::Ended) => {
                        tracing::info!(job_id = id, "START for a job that already ended");
                        vec![Outbound::End { id, status: 0 }]
                    }
                    Some(JobState::Starting | JobState::Running) => {
                        tracing::debug!(job_id = id, "Duplicate START");
                        vec![Outbound::StartOk { id }]
                    }
                }
            }
            Inbound::Cancel { id } => {
                self.mark_alive(now);
                match self.jobs.state(id) {
                    Some(JobState::Starting | JobState::Running) => {
                        self.jobs.cancel(id).await;
                    }
                    Some(JobState::Ended) => {
                        tracing::debug!(job_id = id, "CANCEL for a job that already ended");
                    }
                    None => {
                        tracing::info!(job_id = id, "CANCEL for an unknown job");
                        self.jobs.synthesize_ended(id);
                    }
                }
                vec![Outbound::End { id, status: 0 }]
            }
            Inbound::Status { id } => {
                self.mark_alive(now);
                let known = self.jobs.registry().get(id).map(|job| {
                    if job.is_running() {
                        Outbound::StartOk { id }
                    } else {
                        Outbound::End {
                            id,
                            status: job.reported_status(),
                        }
                    }
                });
                match known {
                    Some(reply) => vec![reply],
                    None => {
                        tracing::info!(job_id = id, "STATUS for an unknown job");
                        self.jobs.synthesize_ended(id);
                        vec![Outbound::End { id, status: 0 }]
                    }
                }
            }
            Inbound::EndOk { id } => {
                match self.jobs.remove(id) {
                    Some(_) => tracing::info!(job_id = id, "Coordinator acknowledged end of job"),
                    None => tracing::debug!(job_id = id, "END_OK for an unknown job"),
                }
                Vec::new()
            }
        }
    }

    /// Collect finished workers as `ERROR` (when the worker left errors) and `END` messages.
    pub fn reap(&mut self) -> Vec<Outbound> {
        let mut messages = Vec::new();
        for finished in self.jobs.reap_finished() {
            if let Some(message) = finished.error {
                tracing::warn!(job_id = finished.id, "Job reported errors");
                messages.push(Outbound::Error {
                    id: finished.id,
                    message,
                });
            }
            messages.push(Outbound::End {
                id: finished.id,
                status: finished.exit_status,
            });
        }
        messages
    }

    /// Record traffic from the coordinator.
    pub fn mark_alive(&mut self, now: Instant) {
        if let Some(event) = self.liveness.on_message(now) {
            log_event(event);
        }
    }

    /// Returns the `PING` to send if one is due.
    pub fn maybe_ping(&mut self, now: Instant, interval: Duration) -> Option<Outbound> {
        let decision = self.liveness.maybe_ping(now, interval);
        if let Some(event) = decision.event {
            log_event(event);
        }
        decision.send_ping.then_some(Outbound::Ping)
    }
}

fn log_event(event: LivenessEvent) {
    match event {
        LivenessEvent::Online => tracing::info!("Coordinator is online"),
        LivenessEvent::Offline => tracing::warn!("Coordinator is offline"),
    }
}
