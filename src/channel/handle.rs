//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::fmt;
use std::sync::Arc;

use bit_set::BitSet;
use thin_vec::ThinVec;

use crate::define_index_type;
use crate::device::Device;
use crate::dtype::DType;
use crate::error::RuntimeError;
use crate::op::Kernel;
use crate::shape::Shape;
use crate::util::index_vec::{IndexTrait, IndexVec};
use crate::value::TensorValue;
use crate::{ErrPack, cold_path};

//--------------------------------------------------------------------------------------------------

define_index_type!(HandleSlot);

/// Opaque reference to a value owned by the channel.
///
/// The generation is bumped every time a slot is freed, so a stale handle never aliases
/// the value that later reuses its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
	slot: HandleSlot,
	generation: u32,
}

impl Handle {
	pub fn slot(&self) -> usize {
		self.slot.raw
	}

	pub fn generation(&self) -> u32 {
		self.generation
	}
}

impl fmt::Display for Handle {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "Handle({}@{})", self.slot.raw, self.generation)
	}
}

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
	Device,
	Host,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
	pub dtype: DType,
	pub shape: Shape,
	pub device: Device,
}

impl Layout {
	pub fn of(value: &TensorValue) -> Self {
		Self {
			dtype: value.dtype(),
			shape: value.shape().clone(),
			device: value.device(),
		}
	}
}

pub(crate) enum EntryState {
	Pending,
	Ready { value: Arc<TensorValue>, tier: Tier },
	Dropped,
	/// Dropped, with a rebuild queued for a reader.
	Regenerating,
	Poisoned(Arc<ErrPack<RuntimeError>>),
}

/// How a value can be brought back after it was dropped.
pub(crate) enum Origin {
	Put { no_cache: bool },
	Computed(Producer),
	Unknown,
}

pub(crate) struct Producer {
	pub kernel: Arc<dyn Kernel>,
	pub inputs: ThinVec<Handle>,
	pub output_index: usize,
}

pub(crate) struct Entry {
	pub state: EntryState,
	/// Known as soon as the value is; survives `drop` so layout queries never block on
	/// regeneration.
	pub layout: Option<Layout>,
	pub origin: Origin,
}

impl Entry {
	pub fn pending() -> Self {
		Self {
			state: EntryState::Pending,
			layout: None,
			origin: Origin::Unknown,
		}
	}

	pub fn pending_put(layout: Layout, no_cache: bool) -> Self {
		Self {
			state: EntryState::Pending,
			layout: Some(layout),
			origin: Origin::Put { no_cache },
		}
	}

	pub fn ready_put(value: TensorValue, no_cache: bool) -> Self {
		let layout = Layout::of(&value);
		Self {
			state: EntryState::Ready { value: Arc::new(value), tier: Tier::Device },
			layout: Some(layout),
			origin: Origin::Put { no_cache },
		}
	}

	pub fn poisoned(&self) -> Option<&Arc<ErrPack<RuntimeError>>> {
		match &self.state {
			EntryState::Poisoned(err) => Some(err),
			_ => None,
		}
	}
}

//--------------------------------------------------------------------------------------------------

struct Slot {
	generation: u32,
	entry: Option<Entry>,
}

/// Slot arena mapping live handles to their entries.
#[derive(Default)]
pub(crate) struct HandleTable {
	slots: IndexVec<HandleSlot, Slot>,
	free: Vec<HandleSlot>,
	live: BitSet,
}

impl HandleTable {
	pub fn alloc(&mut self, entry: Entry) -> Handle {
		let slot = if let Some(slot) = self.free.pop() {
			self.slots[slot].entry = Some(entry);
			slot
		} else {
			self.slots.push(Slot { generation: 0, entry: Some(entry) })
		};
		self.live.insert(slot.to_raw());
		Handle { slot, generation: self.slots[slot].generation }
	}

	pub fn free(&mut self, handle: Handle) -> Option<Entry> {
		let slot = self.slots.get_mut(handle.slot)?;
		if slot.generation != handle.generation || slot.entry.is_none() {
			cold_path();
			return None;
		}
		let entry = slot.entry.take();
		slot.generation = slot.generation.wrapping_add(1);
		self.live.remove(handle.slot.to_raw());
		self.free.push(handle.slot);
		entry
	}

	pub fn get(&self, handle: Handle) -> Option<&Entry> {
		let slot = self.slots.get(handle.slot)?;
		if slot.generation != handle.generation {
			return None;
		}
		slot.entry.as_ref()
	}

	pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Entry> {
		let slot = self.slots.get_mut(handle.slot)?;
		if slot.generation != handle.generation {
			return None;
		}
		slot.entry.as_mut()
	}

	pub fn contains(&self, handle: Handle) -> bool {
		self.live.contains(handle.slot.to_raw()) && self.get(handle).is_some()
	}

	pub fn live_count(&self) -> usize {
		self.live.len()
	}
}

//--------------------------------------------------------------------------------------------------
