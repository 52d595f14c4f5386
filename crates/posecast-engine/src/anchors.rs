//! Body anchor lifecycle.
//!
//! The capture worker owns one [`AnchorLifecycleManager`]. It creates an
//! entry the first time a body is seen, keeps the entry's transform in step
//! with the tracker, attaches a character visual once the template has
//! loaded and retires bodies that stay untracked for too long.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use posecast_capture::{BodyId, Transform, Vec3};
use posecast_ipc::PipelineConfig;
use tracing::{debug, info};

/// Opaque handle to an instantiated character visual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VisualHandle(pub u64);

/// A character model that can be instantiated per body.
pub trait CharacterTemplate: Send + Sync {
    fn instantiate(&self, body: BodyId) -> VisualHandle;

    fn release(&self, handle: VisualHandle);
}

/// Slot a template is written into once it has finished loading.
///
/// Loading happens elsewhere; until the slot is filled bodies are tracked
/// without a visual and attachment is retried on every update.
#[derive(Clone, Default)]
pub struct TemplateSlot(Arc<RwLock<Option<Arc<dyn CharacterTemplate>>>>);

impl TemplateSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, template: Arc<dyn CharacterTemplate>) {
        *self.0.write() = Some(template);
    }

    pub fn get(&self) -> Option<Arc<dyn CharacterTemplate>> {
        self.0.read().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.0.read().is_some()
    }
}

/// Per-body entry. Only copies leave the manager.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorEntry {
    pub body_id: BodyId,

    /// Anchor transform with the configured offset applied.
    pub transform: Transform,

    pub visual: Option<VisualHandle>,

    pub is_tracked: bool,

    /// Consecutive updates without tracking.
    pub untracked_streak: u32,

    pub updates: u64,
}

/// Owns every anchor entry and the visuals attached to them.
pub struct AnchorLifecycleManager {
    entries: HashMap<BodyId, AnchorEntry>,
    template: TemplateSlot,
    offset: Vec3,
    retire_after: u32,
}

impl AnchorLifecycleManager {
    /// `retire_after` of 0 disables automatic retirement.
    pub fn new(template: TemplateSlot, offset: Vec3, retire_after: u32) -> Self {
        Self {
            entries: HashMap::new(),
            template,
            offset,
            retire_after,
        }
    }

    pub fn from_config(template: TemplateSlot, config: &PipelineConfig) -> Self {
        Self::new(
            template,
            Vec3::from(config.anchor_offset),
            config.retire_after_untracked,
        )
    }

    /// Create or update the entry for `body` and return a copy of it.
    pub fn upsert(&mut self, body: BodyId, anchor: &Transform, is_tracked: bool) -> AnchorEntry {
        let transform = Transform {
            translation: anchor.translation + self.offset,
            ..*anchor
        };

        let entry = self.entries.entry(body).or_insert_with(|| {
            info!(%body, "Body detected");
            AnchorEntry {
                body_id: body,
                transform,
                visual: None,
                is_tracked,
                untracked_streak: 0,
                updates: 0,
            }
        });

        entry.transform = transform;
        entry.is_tracked = is_tracked;
        entry.updates += 1;
        entry.untracked_streak = if is_tracked {
            0
        } else {
            entry.untracked_streak.saturating_add(1)
        };

        if entry.visual.is_none() {
            if let Some(template) = self.template.get() {
                let handle = template.instantiate(body);
                debug!(%body, ?handle, "Visual attached");
                entry.visual = Some(handle);
            }
        }

        entry.clone()
    }

    /// Remove `body`, releasing its visual.
    pub fn retire(&mut self, body: &BodyId) -> Option<AnchorEntry> {
        let entry = self.entries.remove(body)?;
        self.release_visual(&entry);
        info!(%body, updates = entry.updates, "Body retired");
        Some(entry)
    }

    /// Retire every body whose untracked streak reached the threshold.
    pub fn sweep(&mut self) -> Vec<BodyId> {
        if self.retire_after == 0 {
            return Vec::new();
        }

        let stale: Vec<BodyId> = self
            .entries
            .values()
            .filter(|entry| entry.untracked_streak >= self.retire_after)
            .map(|entry| entry.body_id)
            .collect();

        for body in &stale {
            self.retire(body);
        }
        stale
    }

    pub fn get(&self, body: &BodyId) -> Option<AnchorEntry> {
        self.entries.get(body).cloned()
    }

    pub fn bodies(&self) -> Vec<BodyId> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Retire every body.
    pub fn clear(&mut self) {
        for (_, entry) in self.entries.drain() {
            if let (Some(handle), Some(template)) = (entry.visual, self.template.get()) {
                template.release(handle);
            }
        }
    }

    fn release_visual(&self, entry: &AnchorEntry) {
        if let (Some(handle), Some(template)) = (entry.visual, self.template.get()) {
            template.release(handle);
            debug!(body = %entry.body_id, ?handle, "Visual released");
        }
    }
}

impl Drop for AnchorLifecycleManager {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct CountingTemplate {
        next: AtomicU64,
        released: Mutex<Vec<VisualHandle>>,
    }

    impl CharacterTemplate for CountingTemplate {
        fn instantiate(&self, _body: BodyId) -> VisualHandle {
            VisualHandle(self.next.fetch_add(1, Ordering::SeqCst))
        }

        fn release(&self, handle: VisualHandle) {
            self.released.lock().push(handle);
        }
    }

    #[test]
    fn test_upsert_applies_offset() {
        let mut anchors = AnchorLifecycleManager::new(TemplateSlot::new(), Vec3::new(0.0, 1.0, 0.0), 0);
        let body = Uuid::new_v4();

        let entry = anchors.upsert(body, &Transform::from_translation(Vec3::new(2.0, 0.0, 0.0)), true);

        assert_eq!(entry.transform.translation, Vec3::new(2.0, 1.0, 0.0));
        assert_eq!(entry.updates, 1);
        assert!(entry.visual.is_none());
    }

    #[test]
    fn test_visual_attaches_once_template_loads() {
        let slot = TemplateSlot::new();
        let mut anchors = AnchorLifecycleManager::new(slot.clone(), Vec3::ZERO, 0);
        let body = Uuid::new_v4();

        assert!(anchors.upsert(body, &Transform::IDENTITY, true).visual.is_none());

        slot.set(Arc::new(CountingTemplate::default()));
        let entry = anchors.upsert(body, &Transform::IDENTITY, true);
        assert_eq!(entry.visual, Some(VisualHandle(0)));

        // Already attached: no second instantiation.
        assert_eq!(anchors.upsert(body, &Transform::IDENTITY, true).visual, Some(VisualHandle(0)));
    }

    #[test]
    fn test_sweep_retires_after_untracked_streak() {
        let template = Arc::new(CountingTemplate::default());
        let slot = TemplateSlot::new();
        slot.set(template.clone());
        let mut anchors = AnchorLifecycleManager::new(slot, Vec3::ZERO, 3);
        let body = Uuid::new_v4();

        anchors.upsert(body, &Transform::IDENTITY, true);
        anchors.upsert(body, &Transform::IDENTITY, false);
        anchors.upsert(body, &Transform::IDENTITY, false);
        assert!(anchors.sweep().is_empty());

        // Tracking again resets the streak.
        anchors.upsert(body, &Transform::IDENTITY, true);
        for _ in 0..3 {
            anchors.upsert(body, &Transform::IDENTITY, false);
        }
        assert_eq!(anchors.sweep(), vec![body]);
        assert!(anchors.is_empty());
        assert_eq!(*template.released.lock(), vec![VisualHandle(0)]);
    }

    #[test]
    fn test_zero_threshold_never_retires() {
        let mut anchors = AnchorLifecycleManager::new(TemplateSlot::new(), Vec3::ZERO, 0);
        let body = Uuid::new_v4();
        for _ in 0..500 {
            anchors.upsert(body, &Transform::IDENTITY, false);
        }
        assert!(anchors.sweep().is_empty());
        assert_eq!(anchors.len(), 1);
    }

    #[test]
    fn test_retire_unknown_body() {
        let mut anchors = AnchorLifecycleManager::new(TemplateSlot::new(), Vec3::ZERO, 0);
        assert!(anchors.retire(&Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_drop_releases_visuals() {
        let template = Arc::new(CountingTemplate::default());
        let slot = TemplateSlot::new();
        slot.set(template.clone());
        {
            let mut anchors = AnchorLifecycleManager::new(slot, Vec3::ZERO, 0);
            anchors.upsert(Uuid::new_v4(), &Transform::IDENTITY, true);
            anchors.upsert(Uuid::new_v4(), &Transform::IDENTITY, true);
        }
        assert_eq!(template.released.lock().len(), 2);
    }
}
