//! Tracking of submissions that may still be executing on the GPU

use std::collections::VecDeque;

use crate::backend::{RenderDevice, SubmissionId};
use crate::error::FrameResult;

/// A submission tagged with the offscreen target epoch it rendered into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    pub epoch: u64,
    pub submission: SubmissionId,
}

/// Fixed-depth ring of in-flight submissions
///
/// Holds at most `depth` entries. Pushing into a full ring blocks on the
/// oldest submission first.
#[derive(Debug)]
pub struct SubmissionRing {
    depth: usize,
    entries: VecDeque<InFlight>,
}

impl SubmissionRing {
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            depth,
            entries: VecDeque::with_capacity(depth),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &InFlight> {
        self.entries.iter()
    }

    /// Track a new submission, waiting for the oldest one if the ring is full.
    pub fn push<D: RenderDevice>(
        &mut self,
        device: &mut D,
        epoch: u64,
        submission: SubmissionId,
    ) -> FrameResult<()> {
        self.retire_completed(device)?;
        while self.entries.len() >= self.depth {
            if let Some(oldest) = self.entries.pop_front() {
                log::trace!("Submission ring full, waiting on {:?}", oldest.submission);
                device.wait_submission(oldest.submission)?;
            }
        }
        self.entries.push_back(InFlight { epoch, submission });
        Ok(())
    }

    /// Drop every entry the device reports as finished.
    pub fn retire_completed<D: RenderDevice>(&mut self, device: &mut D) -> FrameResult<()> {
        while let Some(oldest) = self.entries.front().copied() {
            if !device.is_submission_complete(oldest.submission)? {
                break;
            }
            self.entries.pop_front();
            // Releases the finished stream
            device.wait_submission(oldest.submission)?;
        }
        Ok(())
    }

    /// Wait for every submission tagged with `epoch` or an older one.
    pub fn retire_through<D: RenderDevice>(&mut self, device: &mut D, epoch: u64) -> FrameResult<()> {
        let mut kept = VecDeque::with_capacity(self.depth);
        for entry in self.entries.drain(..) {
            if entry.epoch <= epoch {
                device.wait_submission(entry.submission)?;
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        Ok(())
    }

    /// Wait for `submission` and everything submitted before it.
    ///
    /// Does nothing when `submission` has already left the ring.
    pub fn retire_until<D: RenderDevice>(
        &mut self,
        device: &mut D,
        submission: SubmissionId,
    ) -> FrameResult<()> {
        if !self.entries.iter().any(|e| e.submission == submission) {
            return Ok(());
        }
        while let Some(entry) = self.entries.pop_front() {
            device.wait_submission(entry.submission)?;
            if entry.submission == submission {
                break;
            }
        }
        Ok(())
    }

    /// Wait for everything in flight.
    pub fn drain<D: RenderDevice>(&mut self, device: &mut D) -> FrameResult<()> {
        while let Some(entry) = self.entries.pop_front() {
            device.wait_submission(entry.submission)?;
        }
        Ok(())
    }
}
