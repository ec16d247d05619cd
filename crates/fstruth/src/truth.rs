//! The ground truth recorder.
//!
//! [`GroundTruth`] accumulates the expected facts produced by construction
//! steps.  It performs no I/O of its own: the builder reads facts back from
//! the live filesystem and hands them over.
//!
//! Records are stored in slots.  Every change is appended to a revision log
//! tagged with the index of the step that made it, which is what allows
//! [`GroundTruth::snapshot_view`] to reconstruct the state at any earlier
//! point in the sequence.

use std::collections::HashMap;

use log::trace;

use crate::{
    error::{Error, Result},
    object::{DeleteIntent, GroundTruthObject, ObjectKey, ParentRef, TruthStatus},
    util::{is_within, parent_path},
};

/// One entry of the revision log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub step: usize,
    pub slot: usize,
    pub object: GroundTruthObject,
}

#[derive(Debug, Clone)]
pub struct GroundTruth {
    root: ObjectKey,
    revisions: Vec<Revision>,
    current: Vec<GroundTruthObject>,
    live_paths: HashMap<String, usize>,
}

fn invalid(message: String) -> Error {
    Error::InvalidGroundTruth(message)
}

impl GroundTruth {
    /// Starts an empty record for a filesystem whose root has identity `root`.
    pub fn new(root: ObjectKey) -> Self {
        GroundTruth {
            root,
            revisions: vec![],
            current: vec![],
            live_paths: HashMap::new(),
        }
    }

    /// Identity of the filesystem root.
    pub fn root(&self) -> ObjectKey {
        self.root
    }

    /// Records a new object.
    ///
    /// Fails with [`Error::InvalidGroundTruth`] if the object's parent does
    /// not resolve to the root or to a live directory or subvolume root, or if
    /// another live object already occupies its path.
    pub fn record(&mut self, step: usize, object: GroundTruthObject) -> Result<usize> {
        let path = object
            .facts
            .path
            .clone()
            .ok_or_else(|| invalid(format!("object {} recorded without a path", object.key)))?;

        if self.live_paths.contains_key(&path) {
            return Err(invalid(format!("{path} recorded twice")));
        }
        if object.is_live() {
            self.check_parent(&path, object.facts.parent)?;
        }

        let slot = self.current.len();
        trace!("record slot {slot} at step {step}: {path} {}", object.key);
        if object.is_live() {
            self.live_paths.insert(path, slot);
        }
        self.current.push(object.clone());
        self.revisions.push(Revision { step, slot, object });
        Ok(slot)
    }

    fn check_parent(&self, path: &str, parent: Option<ParentRef>) -> Result<()> {
        match parent {
            None => Err(invalid(format!("{path} recorded without a parent"))),
            Some(ParentRef::Root) => {
                if parent_path(path) != "/" {
                    return Err(invalid(format!(
                        "{path} claims the root as parent but lives in {}",
                        parent_path(path)
                    )));
                }
                Ok(())
            }
            Some(ParentRef::Object(key)) => {
                let resolved = self
                    .lookup(parent_path(path))
                    .filter(|(_, obj)| obj.key == key)
                    .is_some_and(|(_, obj)| obj.kind().is_some_and(|k| k.is_container()));
                if resolved {
                    Ok(())
                } else {
                    Err(invalid(format!(
                        "{path} claims parent {key}, which is not a live directory at {}",
                        parent_path(path)
                    )))
                }
            }
        }
    }

    /// Finds the parent reference for a new object at `path`.
    pub fn resolve_parent(&self, path: &str) -> Result<ParentRef> {
        let parent = parent_path(path);
        if parent == "/" {
            return Ok(ParentRef::Root);
        }
        match self.lookup(parent) {
            Some((_, obj)) if obj.kind().is_some_and(|k| k.is_container()) => {
                Ok(ParentRef::Object(obj.key))
            }
            Some(_) => Err(invalid(format!("parent of {path} is not a directory"))),
            None => Err(invalid(format!("parent of {path} was never recorded"))),
        }
    }

    /// The live object at `path`.
    pub fn lookup(&self, path: &str) -> Option<(usize, &GroundTruthObject)> {
        let slot = *self.live_paths.get(path)?;
        Some((slot, &self.current[slot]))
    }

    pub fn get(&self, slot: usize) -> Option<&GroundTruthObject> {
        self.current.get(slot)
    }

    /// Live objects at or below `path`, in path order (parents first).
    pub fn live_under(&self, path: &str) -> Vec<(usize, &GroundTruthObject)> {
        let mut found: Vec<_> = self
            .live_paths
            .iter()
            .filter(|(p, _)| is_within(p, path))
            .map(|(_, &slot)| (slot, &self.current[slot]))
            .collect();
        found.sort_by(|a, b| a.1.path().cmp(b.1.path()));
        found
    }

    /// Live slots sharing the identity `key` (hard links).
    pub fn live_with_key(&self, key: ObjectKey) -> Vec<usize> {
        let mut slots: Vec<usize> = self
            .live_paths
            .values()
            .copied()
            .filter(|&slot| self.current[slot].key == key)
            .collect();
        slots.sort_unstable();
        slots
    }

    /// Applies `change` to the record in `slot`.
    ///
    /// The path, status and identity must not be changed this way; use
    /// [`GroundTruth::mark_deleted`] and [`GroundTruth::rekey`] instead.
    pub fn update(
        &mut self,
        step: usize,
        slot: usize,
        change: impl FnOnce(&mut GroundTruthObject),
    ) -> Result<()> {
        let Some(object) = self.current.get(slot) else {
            return Err(invalid(format!("no ground truth slot {slot}")));
        };
        let mut object = object.clone();
        let (key, path, status) = (object.key, object.facts.path.clone(), object.status);
        change(&mut object);
        if object.key != key || object.facts.path != path || object.status != status {
            return Err(invalid(format!(
                "update of {} changed its identity",
                path.as_deref().unwrap_or("?")
            )));
        }
        self.store(step, slot, object);
        Ok(())
    }

    fn store(&mut self, step: usize, slot: usize, object: GroundTruthObject) {
        self.current[slot] = object.clone();
        self.revisions.push(Revision { step, slot, object });
    }

    /// Marks the object at `path`, and everything below it, as deleted.
    ///
    /// Returns the affected slots.  The records stay in the set so the
    /// comparator can check how the parser treats them.
    pub fn mark_deleted(
        &mut self,
        step: usize,
        path: &str,
        intent: DeleteIntent,
    ) -> Result<Vec<usize>> {
        if self.lookup(path).is_none() {
            return Err(invalid(format!("cannot delete {path}: not live")));
        }

        let slots: Vec<usize> = self.live_under(path).into_iter().map(|(s, _)| s).collect();
        for &slot in &slots {
            let mut object = self.current[slot].clone();
            object.status = TruthStatus::Deleted {
                intent,
                at_step: step,
            };
            self.live_paths.remove(object.path());
            self.store(step, slot, object);
        }
        Ok(slots)
    }

    /// Replaces the identity of live objects after the filesystem renumbered
    /// them (for example after an in-place conversion), and re-derives every
    /// parent reference from the paths.
    pub fn rekey(
        &mut self,
        step: usize,
        root: ObjectKey,
        mut identify: impl FnMut(&str) -> anyhow::Result<ObjectKey>,
    ) -> anyhow::Result<()> {
        self.root = root;

        let live: Vec<usize> = self.live_under("/").into_iter().map(|(s, _)| s).collect();
        let mut keys = HashMap::new();
        for &slot in &live {
            let path = self.current[slot].path().to_string();
            keys.insert(path.clone(), identify(&path)?);
        }

        let key_of = |path: &str| {
            keys.get(path)
                .copied()
                .ok_or_else(|| invalid(format!("{path} has no live record")))
        };
        for slot in live {
            let mut object = self.current[slot].clone();
            object.key = key_of(object.path())?;
            object.facts.parent = Some(match parent_path(object.path()) {
                "/" => ParentRef::Root,
                parent => ParentRef::Object(key_of(parent)?),
            });
            self.store(step, slot, object);
        }
        Ok(())
    }

    /// The ground truth as it stood before step `as_of` was applied.
    ///
    /// Deleted records are included with the status they had at that point.
    /// `snapshot_view(n)` for the number of steps `n` is the state before the
    /// final read-back refresh.
    pub fn snapshot_view(&self, as_of: usize) -> Vec<GroundTruthObject> {
        let mut slots: Vec<Option<&GroundTruthObject>> = vec![None; self.current.len()];
        for revision in self.revisions.iter().filter(|r| r.step < as_of) {
            slots[revision.slot] = Some(&revision.object);
        }
        slots.into_iter().flatten().cloned().collect()
    }

    /// Every record in its current state.
    pub fn current(&self) -> &[GroundTruthObject] {
        &self.current
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    pub fn revisions(&self) -> &[Revision] {
        &self.revisions
    }

    /// The current records with everything that depends on wall-clock time
    /// removed: ctime and crtime always, mtime and atime unless pinned.
    ///
    /// Two builds of the same scenario produce equal views.
    pub fn deterministic_view(&self) -> Vec<GroundTruthObject> {
        self.current
            .iter()
            .cloned()
            .map(|mut object| {
                object.facts.ctime = None;
                object.facts.crtime = None;
                if !object.timestamps_pinned {
                    object.facts.mtime = None;
                    object.facts.atime = None;
                }
                object
            })
            .collect()
    }

    /// Consumes the recorder, returning the final record set.
    pub fn into_objects(self) -> Vec<GroundTruthObject> {
        self.current
    }
}
