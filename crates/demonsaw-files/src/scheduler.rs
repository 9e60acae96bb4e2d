//! Admission of queued transfers into active slots.
//!
//! An idle pass promotes pending transfers up to the configured number of
//! concurrent downloads and uploads. Uploads may be prioritized: files at or
//! below a size threshold, or with an extension from a configured set, are
//! promoted before any other pending upload; the rest follow in arrival
//! order. Each pass scans the pending list twice under one lock hold.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

/// Separators accepted between priority extensions.
pub const EXTENSION_DELIMITERS: &[char] = &[' ', ',', '.', '|', ':', ';'];

/// What the scheduler needs to know about a queued transfer.
pub trait Queued {
    /// Stable id of the transfer.
    fn id(&self) -> &str;
    /// File name (extension is used for upload priority).
    fn file_name(&self) -> &str;
    /// File size in bytes.
    fn file_size(&self) -> u64;
    /// Whether this transfer sends data.
    fn is_upload(&self) -> bool;
}

/// Upload priority policy.
#[derive(Debug, Clone, Default)]
pub struct PriorityPolicy {
    size: u64,
    extensions: HashSet<String>,
}

impl PriorityPolicy {
    /// Build from a size threshold (0 disables) and a delimited extension list.
    #[must_use]
    pub fn new(size: u64, extensions: &str) -> Self {
        let extensions = extensions
            .split(EXTENSION_DELIMITERS)
            .filter(|ext| !ext.is_empty())
            .map(str::to_ascii_lowercase)
            .collect();
        Self { size, extensions }
    }

    /// Whether any priority rule is configured.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.size > 0 || !self.extensions.is_empty()
    }

    /// Whether `item` qualifies for the priority pass.
    #[must_use]
    pub fn matches<T: Queued>(&self, item: &T) -> bool {
        if self.size > 0 && item.file_size() <= self.size {
            return true;
        }
        std::path::Path::new(item.file_name())
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.contains(&ext.to_ascii_lowercase()))
    }
}

/// Indices of the first `remaining` downloads in arrival order.
#[must_use]
pub fn admit_downloads<T: Queued>(pending: &[T], remaining: usize) -> Vec<usize> {
    pending
        .iter()
        .enumerate()
        .filter(|(_, item)| !item.is_upload())
        .map(|(index, _)| index)
        .take(remaining)
        .collect()
}

/// Indices of up to `remaining` uploads, priority matches first.
#[must_use]
pub fn admit_uploads<T: Queued>(pending: &[T], remaining: usize, policy: &PriorityPolicy) -> Vec<usize> {
    let uploads = || {
        pending
            .iter()
            .enumerate()
            .filter(|(_, item)| item.is_upload())
    };

    let mut chosen: Vec<usize> = Vec::with_capacity(remaining);
    if policy.is_enabled() {
        chosen.extend(
            uploads()
                .filter(|(_, item)| policy.matches(*item))
                .map(|(index, _)| index)
                .take(remaining),
        );
    }

    let left = remaining.saturating_sub(chosen.len());
    let rest: Vec<usize> = uploads()
        .map(|(index, _)| index)
        .filter(|index| !chosen.contains(index))
        .take(left)
        .collect();
    chosen.extend(rest);
    chosen
}

/// Concurrency limits for one scheduling pass.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Maximum concurrent downloads
    pub downloads: usize,
    /// Maximum concurrent uploads
    pub uploads: usize,
}

fn lock<T>(list: &Mutex<Vec<T>>) -> MutexGuard<'_, Vec<T>> {
    list.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pending, active and finished transfer lists, each behind its own lock.
#[derive(Debug)]
pub struct TransferQueue<T> {
    pending: Mutex<Vec<T>>,
    active: Mutex<Vec<T>>,
    finished: Mutex<Vec<T>>,
}

impl<T> Default for TransferQueue<T> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            active: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Queued + Clone> TransferQueue<T> {
    /// Create empty lists.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a transfer.
    pub fn push(&self, item: T) {
        lock(&self.pending).push(item);
    }

    /// Promote pending transfers into free active slots, returning the
    /// promoted items in promotion order.
    pub fn promote(&self, limits: Limits, policy: &PriorityPolicy) -> Vec<T> {
        let (active_downloads, active_uploads) = {
            let active = lock(&self.active);
            let uploads = active.iter().filter(|item| item.is_upload()).count();
            (active.len() - uploads, uploads)
        };

        let mut pending = lock(&self.pending);
        let mut indices = admit_downloads(&pending, limits.downloads.saturating_sub(active_downloads));
        indices.extend(admit_uploads(
            &pending,
            limits.uploads.saturating_sub(active_uploads),
            policy,
        ));
        if indices.is_empty() {
            return Vec::new();
        }

        let promoted: Vec<T> = indices.iter().map(|&index| pending[index].clone()).collect();
        let mut sorted = indices;
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        for index in sorted {
            pending.remove(index);
        }
        drop(pending);

        debug!("Promoted {} transfer(s)", promoted.len());
        lock(&self.active).extend(promoted.iter().cloned());
        promoted
    }

    fn take(list: &Mutex<Vec<T>>, id: &str, upload: bool) -> Option<T> {
        let mut list = lock(list);
        let index = list
            .iter()
            .position(|item| item.id() == id && item.is_upload() == upload)?;
        Some(list.remove(index))
    }

    /// Move an active transfer back to the end of the pending list. An
    /// upload and a download may share an id, so `upload` picks the side.
    pub fn requeue(&self, id: &str, upload: bool) -> bool {
        match Self::take(&self.active, id, upload) {
            Some(item) => {
                lock(&self.pending).push(item);
                true
            }
            None => false,
        }
    }

    /// Move an active transfer to the finished list.
    pub fn finish(&self, id: &str, upload: bool) -> bool {
        match Self::take(&self.active, id, upload) {
            Some(item) => {
                lock(&self.finished).push(item);
                true
            }
            None => false,
        }
    }

    /// Remove a transfer from whichever list holds it.
    pub fn remove(&self, id: &str, upload: bool) -> Option<T> {
        Self::take(&self.pending, id, upload)
            .or_else(|| Self::take(&self.active, id, upload))
            .or_else(|| Self::take(&self.finished, id, upload))
    }

    /// Snapshot of the pending list.
    #[must_use]
    pub fn pending(&self) -> Vec<T> {
        lock(&self.pending).clone()
    }

    /// Snapshot of the active list.
    #[must_use]
    pub fn active(&self) -> Vec<T> {
        lock(&self.active).clone()
    }

    /// Snapshot of the finished list.
    #[must_use]
    pub fn finished(&self) -> Vec<T> {
        lock(&self.finished).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: String,
        name: String,
        size: u64,
        upload: bool,
    }

    fn item(id: &str, name: &str, size: u64, upload: bool) -> Item {
        Item {
            id: id.to_string(),
            name: name.to_string(),
            size,
            upload,
        }
    }

    impl Queued for Item {
        fn id(&self) -> &str {
            &self.id
        }
        fn file_name(&self) -> &str {
            &self.name
        }
        fn file_size(&self) -> u64 {
            self.size
        }
        fn is_upload(&self) -> bool {
            self.upload
        }
    }

    fn ids(items: &[Item]) -> Vec<&str> {
        items.iter().map(|i| i.id.as_str()).collect()
    }

    #[test]
    fn test_extension_tokenizing() {
        let policy = PriorityPolicy::new(0, "mp3, .FLAC|txt;;");
        assert!(policy.is_enabled());
        assert!(policy.matches(&item("a", "song.flac", 10, true)));
        assert!(policy.matches(&item("b", "notes.TXT", 10, true)));
        assert!(!policy.matches(&item("c", "movie.mkv", 10, true)));
        assert!(!PriorityPolicy::new(0, " , ").is_enabled());
    }

    #[test]
    fn test_priority_uploads_first() {
        let pending = vec![
            item("big1", "a.iso", 5_000, true),
            item("small", "b.iso", 10, true),
            item("big2", "c.iso", 6_000, true),
            item("mp3", "d.mp3", 9_000, true),
        ];
        let policy = PriorityPolicy::new(100, "mp3");
        assert_eq!(admit_uploads(&pending, 3, &policy), vec![1, 3, 0]);
        assert_eq!(admit_uploads(&pending, 3, &PriorityPolicy::default()), vec![0, 1, 2]);
    }

    #[test]
    fn test_downloads_in_arrival_order() {
        let pending = vec![
            item("d1", "a", 1, false),
            item("u1", "b", 1, true),
            item("d2", "c", 1, false),
            item("d3", "d", 1, false),
        ];
        assert_eq!(admit_downloads(&pending, 2), vec![0, 2]);
        assert!(admit_downloads(&pending, 0).is_empty());
    }

    #[test]
    fn test_promote_respects_limits() {
        let queue = TransferQueue::new();
        for i in 0..5 {
            queue.push(item(&format!("d{i}"), "f", 1, false));
        }
        queue.push(item("u0", "f", 1, true));

        let limits = Limits {
            downloads: 2,
            uploads: 1,
        };
        let promoted = queue.promote(limits, &PriorityPolicy::default());
        assert_eq!(ids(&promoted), vec!["d0", "d1", "u0"]);
        assert_eq!(queue.pending().len(), 3);

        // Slots are full: nothing more is admitted
        assert!(queue.promote(limits, &PriorityPolicy::default()).is_empty());

        assert!(!queue.finish("d0", true));
        assert!(queue.finish("d0", false));
        let promoted = queue.promote(limits, &PriorityPolicy::default());
        assert_eq!(ids(&promoted), vec!["d2"]);
    }

    #[test]
    fn test_requeue_and_remove() {
        let queue = TransferQueue::new();
        queue.push(item("a", "f", 1, false));
        queue.push(item("b", "f", 1, false));
        let limits = Limits {
            downloads: 1,
            uploads: 0,
        };
        queue.promote(limits, &PriorityPolicy::default());
        assert!(queue.requeue("a", false));
        assert_eq!(ids(&queue.pending()), vec!["b", "a"]);
        assert!(!queue.requeue("missing", false));
        assert!(queue.remove("a", false).is_some());
        assert!(queue.remove("a", false).is_none());
    }

    #[test]
    fn test_shared_id_keyed_by_direction() {
        let queue = TransferQueue::new();
        queue.push(item("slot", "f", 1, true));
        queue.push(item("slot", "f", 1, false));
        let limits = Limits {
            downloads: 1,
            uploads: 1,
        };
        assert_eq!(queue.promote(limits, &PriorityPolicy::default()).len(), 2);

        assert!(queue.finish("slot", false));
        let active = queue.active();
        assert_eq!(active.len(), 1);
        assert!(active[0].upload);
        assert!(!queue.finished()[0].upload);

        assert!(queue.requeue("slot", true));
        assert!(queue.pending()[0].upload);
        assert!(queue.remove("slot", false).is_some_and(|item| !item.upload));
        assert!(queue.remove("slot", true).is_some_and(|item| item.upload));
    }
}
