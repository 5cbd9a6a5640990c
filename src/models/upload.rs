use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ApiError, ApiResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Completed,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadEntry {
    pub id: ObjectId,
    pub status: UploadStatus,
    /// 0–100, monotonic while uploading.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

type Observer = Box<dyn Fn(&[UploadEntry]) + Send>;

/// Per-photo transfer tracker. Entries are keyed by photo id so concurrent
/// progress updates for different photos never touch each other; observers
/// receive the full ordered snapshot synchronously after every mutation.
#[derive(Default)]
pub struct UploadQueue {
    entries: Vec<UploadEntry>,
    observers: Vec<Observer>,
}

impl UploadQueue {
    pub fn new() -> Self {
        UploadQueue::default()
    }

    pub fn subscribe(&mut self, observer: impl Fn(&[UploadEntry]) + Send + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn snapshot(&self) -> Vec<UploadEntry> {
        self.entries.clone()
    }

    pub fn enqueue(&mut self, id: ObjectId) {
        self.entries.push(UploadEntry {
            id,
            status: UploadStatus::Pending,
            progress: 0,
            error: None,
        });
        self.notify();
    }

    pub fn start(&mut self, id: &ObjectId) -> ApiResult<()> {
        let entry = self.entry_mut(id)?;
        if entry.status != UploadStatus::Pending {
            return Err(ApiError::Upload(format!(
                "photo {id} is not pending, cannot start upload"
            )));
        }
        entry.status = UploadStatus::Uploading;
        self.notify();
        Ok(())
    }

    /// Progress events never change state and never move backwards. Events
    /// that change nothing (entry not uploading, percent not increasing) are
    /// dropped without notifying observers.
    pub fn progress(&mut self, id: &ObjectId, percent: u8) -> ApiResult<()> {
        let entry = self.entry_mut(id)?;
        let next = entry.progress.max(percent.min(100));
        if entry.status != UploadStatus::Uploading || next == entry.progress {
            return Ok(());
        }
        entry.progress = next;
        self.notify();
        Ok(())
    }

    pub fn complete(&mut self, id: &ObjectId) -> ApiResult<()> {
        let entry = self.entry_mut(id)?;
        if entry.status != UploadStatus::Uploading {
            return Err(ApiError::Upload(format!(
                "photo {id} is not uploading, cannot complete"
            )));
        }
        entry.status = UploadStatus::Completed;
        entry.progress = 100;
        entry.error = None;
        self.notify();
        Ok(())
    }

    pub fn fail(&mut self, id: &ObjectId, message: impl Into<String>) -> ApiResult<()> {
        let entry = self.entry_mut(id)?;
        entry.status = UploadStatus::Error;
        entry.error = Some(message.into());
        self.notify();
        Ok(())
    }

    /// Put every errored entry back to pending for another attempt. Nothing
    /// is retried automatically; returns how many entries were reset.
    pub fn retry_failed(&mut self) -> usize {
        let mut reset = 0;
        for entry in &mut self.entries {
            if entry.status == UploadStatus::Error {
                entry.status = UploadStatus::Pending;
                entry.progress = 0;
                entry.error = None;
                reset += 1;
            }
        }
        if reset > 0 {
            self.notify();
        }
        reset
    }

    /// Drop completed entries only; errored and in-flight entries stay.
    pub fn clear_completed(&mut self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|entry| entry.status != UploadStatus::Completed);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.notify();
        }
        removed
    }

    fn entry_mut(&mut self, id: &ObjectId) -> ApiResult<&mut UploadEntry> {
        self.entries
            .iter_mut()
            .find(|entry| &entry.id == id)
            .ok_or_else(|| ApiError::Upload(format!("photo {id} is not queued")))
    }

    fn notify(&self) {
        for observer in &self.observers {
            observer(&self.entries);
        }
    }
}

/// Upload queues keyed by report, so each report only ever sees its own
/// transfers. Queues are created lazily on first use.
#[derive(Default)]
pub struct UploadRegistry {
    queues: BTreeMap<ObjectId, UploadQueue>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        UploadRegistry::default()
    }

    pub fn for_report(&mut self, report_id: ObjectId) -> &mut UploadQueue {
        self.queues.entry(report_id).or_default()
    }

    pub fn snapshot(&self, report_id: &ObjectId) -> Vec<UploadEntry> {
        self.queues
            .get(report_id)
            .map(UploadQueue::snapshot)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn queue_with(n: usize) -> (UploadQueue, Vec<ObjectId>) {
        let mut queue = UploadQueue::new();
        let ids: Vec<ObjectId> = (0..n).map(|_| ObjectId::new()).collect();
        for id in &ids {
            queue.enqueue(*id);
        }
        (queue, ids)
    }

    #[test]
    fn lifecycle_reaches_completed() {
        let (mut queue, ids) = queue_with(1);
        queue.start(&ids[0]).unwrap();
        queue.progress(&ids[0], 40).unwrap();
        queue.progress(&ids[0], 80).unwrap();
        queue.complete(&ids[0]).unwrap();
        let snapshot = queue.snapshot();
        assert_eq!(snapshot[0].status, UploadStatus::Completed);
        assert_eq!(snapshot[0].progress, 100);
    }

    #[test]
    fn progress_is_monotonic() {
        let (mut queue, ids) = queue_with(1);
        queue.start(&ids[0]).unwrap();
        queue.progress(&ids[0], 60).unwrap();
        queue.progress(&ids[0], 30).unwrap();
        assert_eq!(queue.snapshot()[0].progress, 60);
    }

    #[test]
    fn retry_with_no_errors_is_a_noop() {
        let (mut queue, _) = queue_with(3);
        assert_eq!(queue.retry_failed(), 0);
        assert!(queue
            .snapshot()
            .iter()
            .all(|entry| entry.status == UploadStatus::Pending && entry.progress == 0));
    }

    #[test]
    fn retry_resets_only_errored_entries() {
        let (mut queue, ids) = queue_with(3);
        queue.start(&ids[0]).unwrap();
        queue.progress(&ids[0], 50).unwrap();
        queue.start(&ids[1]).unwrap();
        queue.fail(&ids[1], "connection reset").unwrap();

        assert_eq!(queue.retry_failed(), 1);
        let snapshot = queue.snapshot();
        assert_eq!(snapshot[0].status, UploadStatus::Uploading);
        assert_eq!(snapshot[0].progress, 50);
        assert_eq!(snapshot[1].status, UploadStatus::Pending);
        assert_eq!(snapshot[1].progress, 0);
        assert_eq!(snapshot[1].error, None);
        assert_eq!(snapshot[2].status, UploadStatus::Pending);
    }

    #[test]
    fn clear_removes_only_completed() {
        let (mut queue, ids) = queue_with(3);
        queue.start(&ids[0]).unwrap();
        queue.complete(&ids[0]).unwrap();
        queue.start(&ids[1]).unwrap();
        queue.fail(&ids[1], "timeout").unwrap();

        assert_eq!(queue.clear_completed(), 1);
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, ids[1]);
        assert_eq!(snapshot[0].status, UploadStatus::Error);
        assert_eq!(snapshot[1].id, ids[2]);
    }

    #[test]
    fn failures_keep_the_entry_with_a_message() {
        let (mut queue, ids) = queue_with(1);
        queue.start(&ids[0]).unwrap();
        queue.fail(&ids[0], "disk full").unwrap();
        let snapshot = queue.snapshot();
        assert_eq!(snapshot[0].status, UploadStatus::Error);
        assert_eq!(snapshot[0].error.as_deref(), Some("disk full"));
    }

    #[test]
    fn unknown_photo_is_an_upload_error() {
        let (mut queue, _) = queue_with(1);
        assert!(matches!(
            queue.start(&ObjectId::new()),
            Err(ApiError::Upload(_))
        ));
    }

    #[test]
    fn observers_see_every_mutation_synchronously() {
        let seen: Arc<Mutex<Vec<Vec<UploadEntry>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut queue = UploadQueue::new();
        queue.subscribe(move |snapshot| sink.lock().unwrap().push(snapshot.to_vec()));

        let id = ObjectId::new();
        queue.enqueue(id);
        queue.start(&id).unwrap();
        queue.progress(&id, 10).unwrap();
        queue.complete(&id).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0][0].status, UploadStatus::Pending);
        assert_eq!(seen[3][0].status, UploadStatus::Completed);
    }

    #[test]
    fn no_op_progress_events_do_not_notify() {
        let notifications = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&notifications);
        let mut queue = UploadQueue::new();
        queue.subscribe(move |_| *sink.lock().unwrap() += 1);

        let id = ObjectId::new();
        queue.enqueue(id);
        // still pending: the event changes nothing
        queue.progress(&id, 30).unwrap();
        assert_eq!(*notifications.lock().unwrap(), 1);

        queue.start(&id).unwrap();
        queue.progress(&id, 60).unwrap();
        // non-increasing: also silent
        queue.progress(&id, 60).unwrap();
        queue.progress(&id, 20).unwrap();
        assert_eq!(*notifications.lock().unwrap(), 3);
        assert_eq!(queue.snapshot()[0].progress, 60);
    }

    #[test]
    fn registry_keeps_reports_isolated() {
        let mut registry = UploadRegistry::new();
        let report_a = ObjectId::new();
        let report_b = ObjectId::new();
        let photo_a = ObjectId::new();
        let photo_b = ObjectId::new();

        registry.for_report(report_a).enqueue(photo_a);
        let queue_b = registry.for_report(report_b);
        queue_b.enqueue(photo_b);
        queue_b.start(&photo_b).unwrap();
        queue_b.fail(&photo_b, "connection reset").unwrap();

        assert_eq!(registry.snapshot(&report_a).len(), 1);
        assert_eq!(registry.snapshot(&report_b).len(), 1);
        assert_eq!(
            registry.snapshot(&report_a)[0].status,
            UploadStatus::Pending
        );

        // retrying one report's failures leaves the other untouched
        assert_eq!(registry.for_report(report_a).retry_failed(), 0);
        assert_eq!(registry.for_report(report_b).retry_failed(), 1);
        assert!(registry.snapshot(&ObjectId::new()).is_empty());
    }
}
