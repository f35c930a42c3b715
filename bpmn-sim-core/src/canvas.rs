//! Canvas Marker Sync
//!
//! Visual highlighting is expressed as an `active` marker on every element
//! a token currently occupies and every flow it just traversed. The sync
//! keeps the canvas consistent by diffing against the previous set, so each
//! publish issues only the additions and removals that actually changed.

use crate::graph::ElementRegistry;
use std::collections::HashSet;
use std::sync::Mutex;

/// Marker applied to occupied elements and traversed flows.
pub const ACTIVE_MARKER: &str = "active";

/// Rendering surface the simulation decorates.
pub trait Canvas: Send + Sync {
    fn add_marker(&self, element_id: &str, marker: &str);
    fn remove_marker(&self, element_id: &str, marker: &str);
}

/// Canvas that ignores all markers, for headless runs.
#[derive(Default)]
pub struct NullCanvas;

impl Canvas for NullCanvas {
    fn add_marker(&self, _element_id: &str, _marker: &str) {}
    fn remove_marker(&self, _element_id: &str, _marker: &str) {}
}

/// Canvas that records every call, for assertions.
#[derive(Default)]
pub struct RecordingCanvas {
    pub added: Mutex<Vec<(String, String)>>,
    pub removed: Mutex<Vec<(String, String)>>,
}

impl RecordingCanvas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids currently carrying the `active` marker.
    pub fn active_ids(&self) -> HashSet<String> {
        let mut active: HashSet<String> = HashSet::new();
        for (id, marker) in self.added.lock().expect("canvas poisoned").iter() {
            if marker == ACTIVE_MARKER {
                active.insert(id.clone());
            }
        }
        for (id, marker) in self.removed.lock().expect("canvas poisoned").iter() {
            if marker == ACTIVE_MARKER {
                active.remove(id);
            }
        }
        active
    }
}

impl Canvas for RecordingCanvas {
    fn add_marker(&self, element_id: &str, marker: &str) {
        self.added
            .lock()
            .expect("canvas poisoned")
            .push((element_id.to_string(), marker.to_string()));
    }

    fn remove_marker(&self, element_id: &str, marker: &str) {
        self.removed
            .lock()
            .expect("canvas poisoned")
            .push((element_id.to_string(), marker.to_string()));
    }
}

/// Differ from one published token set to the next.
#[derive(Default)]
pub(crate) struct MarkerSync {
    previous: HashSet<String>,
}

impl MarkerSync {
    /// Reconcile markers to `current`. Removals are only issued for ids the
    /// registry still knows about, so a swapped-out diagram never sees stale
    /// removal calls.
    pub(crate) fn update(
        &mut self,
        registry: &dyn ElementRegistry,
        canvas: &dyn Canvas,
        current: HashSet<String>,
    ) {
        for id in self.previous.difference(&current) {
            if registry.contains(id) {
                canvas.remove_marker(id, ACTIVE_MARKER);
            }
        }
        for id in current.difference(&self.previous) {
            canvas.add_marker(id, ACTIVE_MARKER);
        }
        self.previous = current;
    }

    /// Remove every marker currently shown.
    pub(crate) fn clear(&mut self, registry: &dyn ElementRegistry, canvas: &dyn Canvas) {
        self.update(registry, canvas, HashSet::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DiagramBuilder, ElementKind};

    fn two_task_registry() -> crate::graph::DiagramRegistry {
        DiagramBuilder::new()
            .element("a", ElementKind::Task)
            .element("b", ElementKind::Task)
            .flow("f", "a", "b")
            .build()
    }

    #[test]
    fn update_adds_and_removes_only_the_diff() {
        let reg = two_task_registry();
        let canvas = RecordingCanvas::new();
        let mut sync = MarkerSync::default();

        sync.update(&reg, &canvas, HashSet::from(["a".to_string()]));
        sync.update(
            &reg,
            &canvas,
            HashSet::from(["b".to_string(), "f".to_string()]),
        );

        assert_eq!(canvas.active_ids(), HashSet::from(["b".into(), "f".into()]));
        let removed = canvas.removed.lock().unwrap();
        assert_eq!(removed.as_slice(), [("a".to_string(), "active".to_string())]);
    }

    #[test]
    fn stale_ids_outside_the_registry_are_not_removed() {
        let reg = two_task_registry();
        let canvas = RecordingCanvas::new();
        let mut sync = MarkerSync::default();

        sync.update(&reg, &canvas, HashSet::from(["ghost".to_string()]));
        sync.update(&reg, &canvas, HashSet::new());

        assert!(canvas.removed.lock().unwrap().is_empty());
    }

    #[test]
    fn clear_removes_all_markers() {
        let reg = two_task_registry();
        let canvas = RecordingCanvas::new();
        let mut sync = MarkerSync::default();

        sync.update(
            &reg,
            &canvas,
            HashSet::from(["a".to_string(), "b".to_string()]),
        );
        sync.clear(&reg, &canvas);

        assert!(canvas.active_ids().is_empty());
    }
}
