//! Ordered stage slots and the routing rules between them.
//!
//! A slot holds one stage. While a stage is executing, its slot is *busy*:
//! the stage has been taken out and the slot holds `None`. Removal is
//! two-phase. First the slot is marked removed and a tombstone records where
//! events fired from the removed stage's context must go. The slot is
//! unlinked once the stage is no longer executing.
//!
//! ```text
//!   head ─ [http-decoder] ─ [http-encoder] ─ [handshake] ─ [user] ─ tail
//!
//!   replace(handshake, responder):
//!   head ─ [http-decoder] ─ [http-encoder] ─ [handshake✗] ─ [responder] ─ [user] ─ tail
//!                                               └─ tombstone: Replaced(responder)
//! ```
//!
//! Events fired from a replaced stage's context are delivered to its
//! replacement (inclusive) in both directions. Events fired from a plainly
//! removed stage continue from the neighbours it had at removal time.

use crate::pipeline::{PipelineError, Stage};
use crate::types::StageId;
use std::collections::HashMap;

pub(crate) struct Slot {
    pub(crate) id: StageId,
    pub(crate) name: String,
    pub(crate) stage: Option<Box<dyn Stage>>,
    pub(crate) inbound: bool,
    pub(crate) outbound: bool,
    pub(crate) removed: bool,
}

impl Slot {
    fn is_live(&self) -> bool {
        !self.removed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tombstone {
    Replaced(StageId),
    Removed { prev: StageId, next: StageId },
}

/// Where a new stage goes.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Position {
    Last,
    Before(StageId),
    After(StageId),
}

pub(crate) struct Pipeline {
    pub(crate) slots: Vec<Slot>,
    next_id: u64,
    tombstones: HashMap<StageId, Tombstone>,
}

impl Pipeline {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            next_id: 1,
            tombstones: HashMap::new(),
        }
    }

    pub(crate) fn index_of(&self, id: StageId) -> Option<usize> {
        self.slots.iter().position(|s| s.id == id)
    }

    pub(crate) fn live_by_name(&self, name: &str) -> Option<StageId> {
        self.slots
            .iter()
            .find(|s| s.is_live() && s.name == name)
            .map(|s| s.id)
    }

    pub(crate) fn name_of(&self, id: StageId) -> Option<&str> {
        self.slots
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.name.as_str())
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|s| s.is_live())
            .map(|s| s.name.clone())
            .collect()
    }

    /// True once `id` has been marked removed or unlinked.
    pub(crate) fn is_removed(&self, id: StageId) -> bool {
        if id.is_head() || id.is_tail() {
            return false;
        }
        self.tombstones.contains_key(&id) || self.index_of(id).is_none()
    }

    pub(crate) fn is_busy(&self, id: StageId) -> bool {
        self.index_of(id)
            .is_some_and(|i| self.slots[i].stage.is_none())
    }

    fn check_unique(&self, name: &str, except: Option<StageId>) -> Result<(), PipelineError> {
        let clash = self
            .slots
            .iter()
            .any(|s| s.is_live() && s.name == name && Some(s.id) != except);
        if clash {
            Err(PipelineError::DuplicateName(name.to_string()))
        } else {
            Ok(())
        }
    }

    fn alloc_id(&mut self) -> StageId {
        let id = StageId(self.next_id);
        self.next_id += 1;
        id
    }

    fn live_index(&self, id: StageId) -> Result<usize, PipelineError> {
        self.index_of(id)
            .filter(|&i| self.slots[i].is_live())
            .ok_or_else(|| PipelineError::NoSuchStage(format!("{id}")))
    }

    /// Links a busy slot for `stage`; the caller installs the stage after
    /// running its `on_added` hook.
    pub(crate) fn insert(
        &mut self,
        position: Position,
        name: &str,
        stage: &dyn Stage,
    ) -> Result<StageId, PipelineError> {
        self.check_unique(name, None)?;
        let index = match position {
            Position::Last => self.slots.len(),
            Position::Before(base) => self.live_index(base)?,
            Position::After(base) => self.live_index(base)? + 1,
        };
        let id = self.alloc_id();
        self.slots.insert(index, Self::busy_slot(id, name, stage));
        Ok(id)
    }

    /// Marks `old` removed and links a busy slot for its replacement
    /// directly after it.
    pub(crate) fn replace(
        &mut self,
        old: StageId,
        name: &str,
        stage: &dyn Stage,
    ) -> Result<StageId, PipelineError> {
        let index = self.live_index(old)?;
        self.check_unique(name, Some(old))?;
        let id = self.alloc_id();
        self.slots[index].removed = true;
        self.slots.insert(index + 1, Self::busy_slot(id, name, stage));
        self.tombstones.insert(old, Tombstone::Replaced(id));
        Ok(id)
    }

    /// Marks `id` removed, remembering its current live neighbours.
    pub(crate) fn mark_removed(&mut self, id: StageId) -> Result<(), PipelineError> {
        let index = self.live_index(id)?;
        let prev = self.slots[..index]
            .iter()
            .rev()
            .find(|s| s.is_live())
            .map_or(StageId::HEAD, |s| s.id);
        let next = self.slots[index + 1..]
            .iter()
            .find(|s| s.is_live())
            .map_or(StageId::TAIL, |s| s.id);
        self.slots[index].removed = true;
        self.tombstones.insert(id, Tombstone::Removed { prev, next });
        Ok(())
    }

    pub(crate) fn unlink(&mut self, id: StageId) {
        if let Some(index) = self.index_of(id) {
            self.slots.remove(index);
        }
    }

    /// Index from which an inbound event fired by `from` starts its scan.
    pub(crate) fn inbound_start(&self, from: StageId, inclusive: bool) -> usize {
        if from.is_head() {
            return 0;
        }
        if from.is_tail() {
            return self.slots.len();
        }
        match self.tombstones.get(&from) {
            Some(Tombstone::Replaced(next) | Tombstone::Removed { next, .. }) => {
                self.inbound_start(*next, true)
            }
            None => match self.index_of(from) {
                Some(i) if inclusive => i,
                Some(i) => i + 1,
                None => self.slots.len(),
            },
        }
    }

    /// Index from which an outbound event fired by `from` starts its
    /// (descending) scan; `None` means straight to the head.
    pub(crate) fn outbound_start(&self, from: StageId, inclusive: bool) -> Option<usize> {
        if from.is_head() {
            return None;
        }
        if from.is_tail() {
            return self.slots.len().checked_sub(1);
        }
        match self.tombstones.get(&from) {
            Some(Tombstone::Replaced(next)) => self.outbound_start(*next, true),
            Some(Tombstone::Removed { prev, .. }) => self.outbound_start(*prev, true),
            None => match self.index_of(from) {
                Some(i) if inclusive => Some(i),
                Some(i) => i.checked_sub(1),
                None => None,
            },
        }
    }

    /// First live inbound slot at or after `start`.
    pub(crate) fn next_inbound(&self, start: usize) -> Option<usize> {
        (start..self.slots.len()).find(|&i| self.slots[i].inbound && self.slots[i].is_live())
    }

    /// First live outbound slot at or before `start`.
    pub(crate) fn prev_outbound(&self, start: usize) -> Option<usize> {
        (0..=start)
            .rev()
            .find(|&i| self.slots[i].outbound && self.slots[i].is_live())
    }

    fn busy_slot(id: StageId, name: &str, stage: &dyn Stage) -> Slot {
        Slot {
            id,
            name: name.to_string(),
            stage: None,
            inbound: stage.handles_inbound(),
            outbound: stage.handles_outbound(),
            removed: false,
        }
    }
}
