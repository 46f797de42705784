use futures::StreamExt;
use qmp::{query::JobInfo, Command, EventStream, JobStatus, QmpError};
use tracing::{debug, warn};

use crate::{BlockCommands, BlockError};

impl BlockCommands {
    /// Start a job, wait until the daemon reports it concluded, then collect
    /// its result and dismiss it.
    ///
    /// The event subscription is taken before the job is started so a job
    /// that concludes immediately is not missed.
    pub(crate) async fn run_job(&self, command: Command, job_id: &str) -> Result<(), BlockError> {
        let mut events = self.transport.subscribe_events().await?;
        self.transport
            .execute(&command)
            .await
            .map_err(BlockError::wrap(format!("start job {}", job_id)))?;
        debug!(job_id, command = command.as_ref(), "block job started");

        match self.wait_for_job(&mut events, job_id).await {
            Ok(()) => self.finish_job(job_id).await,
            Err(err @ BlockError::JobTimeout { .. }) => {
                self.abandon_job(&mut events, job_id).await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Cancel a job that ran past its deadline and dismiss it once it
    /// concludes, so its id can be reused. Best effort.
    async fn abandon_job(&self, events: &mut EventStream, job_id: &str) {
        let cancel = Command::JobCancel {
            id: job_id.to_string(),
        };
        if let Err(err) = self.transport.execute(&cancel).await {
            // It may have concluded on its own in the meantime.
            warn!(job_id, error = %err, "failed to cancel block job");
        }
        if let Err(err) = self.wait_for_job(events, job_id).await {
            warn!(job_id, error = %err, "cancelled block job did not conclude");
            return;
        }
        let dismiss = Command::JobDismiss {
            id: job_id.to_string(),
        };
        match self.transport.execute(&dismiss).await {
            Ok(_) => debug!(job_id, "cancelled block job dismissed"),
            Err(err) => warn!(job_id, error = %err, "failed to dismiss cancelled block job"),
        }
    }

    async fn wait_for_job(&self, events: &mut EventStream, job_id: &str) -> Result<(), BlockError> {
        let wait = async {
            while let Some(event) = events.next().await {
                match event.job_status() {
                    Some((id, JobStatus::Concluded)) if id == job_id => return Ok(()),
                    Some((id, status)) if id == job_id => {
                        debug!(job_id, ?status, "block job status changed");
                    }
                    _ => {}
                }
            }
            Err(BlockError::Transport(QmpError::Disconnected))
        };
        match tokio::time::timeout(self.job_timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(job_id, timeout = ?self.job_timeout, "block job did not conclude in time");
                Err(BlockError::JobTimeout {
                    job_id: job_id.to_string(),
                    after: self.job_timeout,
                })
            }
        }
    }

    /// Read the concluded job's error, if any, and dismiss it.
    async fn finish_job(&self, job_id: &str) -> Result<(), BlockError> {
        let command = Command::QueryJobs;
        let reply = self
            .transport
            .execute(&command)
            .await
            .map_err(BlockError::wrap("query jobs"))?;
        let jobs: Vec<JobInfo> =
            serde_json::from_value(reply).map_err(|source| BlockError::Decode {
                command: command.as_ref().to_string(),
                source,
            })?;
        let error = jobs
            .into_iter()
            .find(|job| job.id == job_id)
            .and_then(|job| job.error);

        self.transport
            .execute(&Command::JobDismiss {
                id: job_id.to_string(),
            })
            .await
            .map_err(BlockError::wrap(format!("dismiss job {}", job_id)))?;

        match error {
            Some(error) => {
                warn!(job_id, error = %error, "block job failed");
                Err(BlockError::JobFailed {
                    job_id: job_id.to_string(),
                    error,
                })
            }
            None => {
                debug!(job_id, "block job concluded");
                Ok(())
            }
        }
    }
}
