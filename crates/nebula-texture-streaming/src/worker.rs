//! Long-lived background thread that runs planning jobs.
//!
//! One job at a time: the render thread submits a [`PlanningJob`] and later
//! blocks on [`PlanningWorker::wait`] to collect the [`PlanOutput`]. The
//! bounded channels hold at most one job and one result.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error};

use crate::error::StreamingError;
use crate::job::{PlanOutput, PlanningJob, execute};
use crate::state::StateCell;

const WORKER_NAME: &str = "texture-planner";

/// The planning thread and its channels.
pub struct PlanningWorker {
    job_sender: Option<Sender<PlanningJob>>,
    result_receiver: Receiver<PlanOutput>,
    handle: Option<JoinHandle<()>>,
}

impl PlanningWorker {
    /// Spawn the worker thread.
    pub fn spawn(state: Arc<StateCell>) -> Result<Self, StreamingError> {
        let (job_tx, job_rx) = crossbeam_channel::bounded::<PlanningJob>(1);
        let (result_tx, result_rx) = crossbeam_channel::bounded::<PlanOutput>(1);

        let handle = std::thread::Builder::new()
            .name(WORKER_NAME.to_string())
            .spawn(move || {
                while let Ok(job) = job_rx.recv() {
                    let output = execute(job, &state);
                    if result_tx.send(output).is_err() {
                        break;
                    }
                }
                debug!("Planning worker exiting");
            })
            .map_err(StreamingError::WorkerSpawn)?;

        Ok(Self {
            job_sender: Some(job_tx),
            result_receiver: result_rx,
            handle: Some(handle),
        })
    }

    /// Hand a job to the worker.
    pub fn submit(&self, job: PlanningJob) -> Result<(), StreamingError> {
        let sender = self
            .job_sender
            .as_ref()
            .ok_or(StreamingError::WorkerDisconnected)?;
        sender
            .send(job)
            .map_err(|_| StreamingError::WorkerDisconnected)
    }

    /// Block until the submitted job's output arrives.
    pub fn wait(&self) -> Result<PlanOutput, StreamingError> {
        self.result_receiver.recv().map_err(|_| {
            error!("Planning worker disconnected while a job was outstanding");
            StreamingError::WorkerDisconnected
        })
    }

    /// Close the job channel and join the thread.
    pub fn shutdown(&mut self) {
        self.job_sender.take();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("Planning worker panicked");
        }
    }
}

impl Drop for PlanningWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryState;
    use crate::state::PlannerState;
    use crate::texture::FrameInfo;

    fn empty_job() -> PlanningJob {
        PlanningJob {
            snapshots: Vec::new(),
            requests: Vec::new(),
            frame: FrameInfo::new(3, 0, 0),
            memory: MemoryState::default(),
            prev_bias: 0,
            min_mip_fp: 0,
        }
    }

    #[test]
    fn test_worker_runs_jobs_in_sequence() {
        let state = Arc::new(StateCell::new(PlannerState::Idle));
        let worker = PlanningWorker::spawn(Arc::clone(&state)).unwrap();
        for frame in 0..3 {
            state.set(PlannerState::QueuedForUpdate);
            let mut job = empty_job();
            job.frame.frame_id = frame;
            worker.submit(job).unwrap();
            let output = worker.wait().unwrap();
            assert_eq!(output.schedule.frame_id, frame);
            assert_eq!(state.get(), PlannerState::QueuedForSync);
        }
    }

    #[test]
    fn test_shutdown_joins_thread() {
        let state = Arc::new(StateCell::new(PlannerState::Idle));
        let mut worker = PlanningWorker::spawn(state).unwrap();
        worker.shutdown();
        assert!(worker.submit(empty_job()).is_err());
    }
}
