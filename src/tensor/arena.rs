//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::rc::Rc;

use super::flags::{TensorFlags, TraceInfo};
use crate::channel::SharedHandle;
use crate::define_index_type;
use crate::graph::GraphVar;
use crate::util::index_vec::IndexVec;

//--------------------------------------------------------------------------------------------------

define_index_type!(EntitySlot);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityId {
	slot: EntitySlot,
	generation: u32,
}

impl EntityId {
	pub fn slot(&self) -> usize {
		self.slot.raw
	}
}

#[derive(Default)]
pub(crate) struct EntityData {
	pub handle: Option<SharedHandle>,
	pub graph_ref: Option<Rc<dyn GraphVar>>,
	pub flags: TensorFlags,
	pub trace_info: TraceInfo,
}

struct Slot {
	generation: u32,
	refcount: usize,
	data: Option<EntityData>,
}

/// Storage for tensor entities.
///
/// A slot is kept alive by strong references only. Weak references check the generation,
/// so they never resolve to an entity that reuses a freed slot.
#[derive(Default)]
pub(crate) struct EntityArena {
	slots: IndexVec<EntitySlot, Slot>,
	free: Vec<EntitySlot>,
	live: usize,
}

impl EntityArena {
	pub fn alloc(&mut self, data: EntityData) -> EntityId {
		self.live += 1;
		if let Some(slot) = self.free.pop() {
			let s = &mut self.slots[slot];
			s.refcount = 1;
			s.data = Some(data);
			return EntityId { slot, generation: s.generation };
		}
		let slot = self.slots.push(Slot { generation: 0, refcount: 1, data: Some(data) });
		EntityId { slot, generation: 0 }
	}

	fn slot_mut(&mut self, id: EntityId) -> Option<&mut Slot> {
		self.slots
			.get_mut(id.slot)
			.filter(|s| s.generation == id.generation && s.data.is_some())
	}

	pub fn retain(&mut self, id: EntityId) {
		if let Some(slot) = self.slot_mut(id) {
			slot.refcount += 1;
		}
	}

	/// Takes a new strong reference if the entity is still alive.
	pub fn try_retain(&mut self, id: EntityId) -> bool {
		self.slot_mut(id).map(|slot| slot.refcount += 1).is_some()
	}

	/// Drops one strong reference. The data is handed back once the last one is gone so
	/// the caller can destroy it outside of any arena borrow.
	pub fn release(&mut self, id: EntityId) -> Option<EntityData> {
		let slot = self.slot_mut(id)?;
		slot.refcount -= 1;
		if slot.refcount > 0 {
			return None;
		}
		let data = slot.data.take();
		slot.generation = slot.generation.wrapping_add(1);
		self.free.push(id.slot);
		self.live -= 1;
		data
	}

	pub fn get(&self, id: EntityId) -> Option<&EntityData> {
		let slot = self.slots.get(id.slot)?;
		if slot.generation != id.generation {
			return None;
		}
		slot.data.as_ref()
	}

	pub fn get_mut(&mut self, id: EntityId) -> Option<&mut EntityData> {
		self.slot_mut(id)?.data.as_mut()
	}

	pub fn refcount(&self, id: EntityId) -> usize {
		match self.slots.get(id.slot) {
			Some(slot) if slot.generation == id.generation => slot.refcount,
			_ => 0,
		}
	}

	pub fn live_count(&self) -> usize {
		self.live
	}
}

//--------------------------------------------------------------------------------------------------
