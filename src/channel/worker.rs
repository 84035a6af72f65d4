//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::Receiver;

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use thin_vec::ThinVec;

use super::handle::{Entry, EntryState, Handle, HandleTable, Layout, Origin, Producer, Tier};
use crate::error::{InvalidHandleError, RuntimeError};
use crate::op::Kernel;
use crate::value::TensorValue;
use crate::{ErrPack, cold_path};

//--------------------------------------------------------------------------------------------------

/// Regeneration replays producers recursively. Chains longer than this are reported as
/// unavailable instead of recursing further.
pub const MAX_REGEN_DEPTH: usize = 64;

pub(crate) type SharedErr = Arc<ErrPack<RuntimeError>>;

pub(crate) enum Command {
	Put {
		handle: Handle,
		value: TensorValue,
	},
	ApplyOp {
		kernel: Arc<dyn Kernel>,
		inputs: ThinVec<Handle>,
		outputs: ThinVec<Handle>,
	},
	SwapOut(Handle),
	SwapIn(Handle),
	Drop(Handle),
	/// Rebuilds a dropped value for a waiting reader.
	Regenerate(Handle),
	Del(Handle),
}

#[derive(Default)]
pub(crate) struct ChannelState {
	pub table: HandleTable,
	/// Commands sent but not yet finished by the worker.
	pub in_flight: usize,
	/// Failures not yet reported by `sync` or observed through `get_value`.
	pub unseen_errors: Vec<(Handle, SharedErr)>,
	pub closed: bool,
}

pub(crate) struct Shared {
	pub state: Mutex<ChannelState>,
	/// Notified whenever the worker finishes a command or resolves an entry.
	pub progress: Condvar,
}

//--------------------------------------------------------------------------------------------------

fn unavailable(handle: Handle) -> SharedErr {
	Arc::new(ErrPack::new(
		RuntimeError::ValueUnavailable,
		format!("value of {handle} was dropped and cannot be regenerated"),
	))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		(*s).to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"kernel panicked".to_string()
	}
}

/// Runs a kernel, turning a panic into an `ExecutionFailed` error.
pub(crate) fn run_kernel(
	kernel: &dyn Kernel,
	inputs: &[&TensorValue],
) -> Result<Vec<TensorValue>, ErrPack<RuntimeError>> {
	match catch_unwind(AssertUnwindSafe(|| kernel.execute(inputs))) {
		Ok(result) => result,
		Err(payload) => {
			cold_path();
			let msg = panic_message(payload.as_ref());
			Err(ErrPack::new(
				RuntimeError::ExecutionFailed,
				format!("{} panicked: {msg}", kernel.name()),
			))
		},
	}
}

impl ChannelState {
	pub fn poison_of(&self, handle: Handle) -> Option<SharedErr> {
		self.table.get(handle).and_then(Entry::poisoned).cloned()
	}

	/// Marks `outputs` as failed. Only a fresh failure is remembered for `sync`; errors
	/// inherited from a poisoned input were already recorded where they originated.
	pub fn poison(&mut self, outputs: &[Handle], err: &SharedErr, fresh: bool) {
		for &h in outputs {
			if let Some(entry) = self.table.get_mut(h) {
				entry.state = EntryState::Poisoned(err.clone());
			}
		}
		if fresh {
			if let Some(&first) = outputs.first() {
				self.unseen_errors.push((first, err.clone()));
			}
		}
	}

	pub fn mark_seen(&mut self, err: &SharedErr) {
		self.unseen_errors.retain(|(_, e)| !Arc::ptr_eq(e, err));
	}

	/// Returns the value behind `handle`, regenerating it from its producer if it was dropped.
	///
	/// Values in the host tier are brought back to the device tier.
	pub fn materialize(&mut self, handle: Handle, depth: usize) -> Result<Arc<TensorValue>, SharedErr> {
		let Some(entry) = self.table.get_mut(handle) else {
			cold_path();
			return Err(Arc::new(InvalidHandleError.into()));
		};
		match &mut entry.state {
			EntryState::Ready { value, tier } => {
				if *tier == Tier::Host {
					debug!("{handle} implicitly swapped in");
					*tier = Tier::Device;
				}
				return Ok(value.clone());
			},
			EntryState::Poisoned(err) => return Err(err.clone()),
			EntryState::Pending => {
				cold_path();
				return Err(Arc::new(ErrPack::new(
					RuntimeError::InvalidHandle,
					format!("{handle} is not resolved yet"),
				)));
			},
			EntryState::Dropped | EntryState::Regenerating => {},
		}

		let Origin::Computed(producer) = &entry.origin else {
			return Err(unavailable(handle));
		};
		if depth >= MAX_REGEN_DEPTH {
			cold_path();
			warn!("regeneration of {handle} exceeds depth {MAX_REGEN_DEPTH}");
			return Err(unavailable(handle));
		}
		let kernel = producer.kernel.clone();
		let inputs = producer.inputs.clone();
		let output_index = producer.output_index;

		let mut values: SmallVec<[Arc<TensorValue>; 4]> = SmallVec::with_capacity(inputs.len());
		for &input in &inputs {
			match self.materialize(input, depth + 1) {
				Ok(v) => values.push(v),
				Err(err) => {
					if matches!(err.code, RuntimeError::InvalidHandle | RuntimeError::ValueUnavailable) {
						return Err(unavailable(handle));
					}
					return Err(err);
				},
			}
		}
		let refs: SmallVec<[&TensorValue; 4]> = values.iter().map(AsRef::as_ref).collect();
		let mut outputs = run_kernel(kernel.as_ref(), &refs).map_err(Arc::new)?;
		if output_index >= outputs.len() {
			cold_path();
			return Err(unavailable(handle));
		}
		let value = Arc::new(outputs.swap_remove(output_index));
		debug!("regenerated {handle} with {}", kernel.name());

		if let Some(entry) = self.table.get_mut(handle) {
			entry.state = EntryState::Ready { value: value.clone(), tier: Tier::Device };
		}
		Ok(value)
	}
}

//--------------------------------------------------------------------------------------------------

pub(crate) fn run(shared: &Shared, rx: &Receiver<Command>) {
	debug!("channel worker started");
	while let Ok(cmd) = rx.recv() {
		execute(shared, cmd);
		let mut st = shared.state.lock();
		st.in_flight = st.in_flight.saturating_sub(1);
		drop(st);
		shared.progress.notify_all();
	}
	let mut st = shared.state.lock();
	st.closed = true;
	drop(st);
	shared.progress.notify_all();
	debug!("channel worker stopped");
}

fn execute(shared: &Shared, cmd: Command) {
	match cmd {
		Command::Put { handle, value } => {
			trace!("worker: put {handle}");
			let mut st = shared.state.lock();
			if let Some(entry) = st.table.get_mut(handle) {
				entry.state = EntryState::Ready { value: Arc::new(value), tier: Tier::Device };
			}
		},
		Command::ApplyOp { kernel, inputs, outputs } => {
			apply(shared, kernel, inputs, &outputs);
		},
		Command::SwapOut(handle) => swap(shared, handle, Tier::Device, Tier::Host),
		Command::SwapIn(handle) => swap(shared, handle, Tier::Host, Tier::Device),
		Command::Drop(handle) => {
			let mut st = shared.state.lock();
			let Some(entry) = st.table.get_mut(handle) else {
				warn!("worker: drop of dead {handle}");
				return;
			};
			if !matches!(entry.state, EntryState::Ready { .. }) {
				return;
			}
			if let Origin::Put { no_cache: false } = entry.origin {
				debug!("worker: {handle} is an admitted value, keeping it");
				return;
			}
			entry.state = EntryState::Dropped;
			debug!("worker: dropped {handle}");
		},
		Command::Regenerate(handle) => regenerate(shared, handle),
		Command::Del(handle) => {
			let mut st = shared.state.lock();
			if st.table.free(handle).is_none() {
				warn!("worker: del of dead {handle}");
			}
		},
	}
}

/// A failure poisons the entry itself. The reader that asked for the value observes it
/// directly, so it is not remembered for `sync`.
fn regenerate(shared: &Shared, handle: Handle) {
	let mut st = shared.state.lock();
	match st.table.get_mut(handle) {
		Some(entry) if matches!(entry.state, EntryState::Regenerating) => {
			entry.state = EntryState::Dropped;
		},
		Some(_) => {
			// already rebuilt as the input of an earlier command
			trace!("worker: {handle} needs no regeneration");
			return;
		},
		None => {
			warn!("worker: regeneration of dead {handle}");
			return;
		},
	}
	if let Err(err) = st.materialize(handle, 0) {
		debug!("worker: regeneration of {handle} failed: {err}");
		st.poison(&[handle], &err, false);
	}
}

fn swap(shared: &Shared, handle: Handle, from: Tier, to: Tier) {
	let mut st = shared.state.lock();
	match st.table.get_mut(handle).map(|e| &mut e.state) {
		Some(EntryState::Ready { tier, .. }) if *tier == from => {
			*tier = to;
			debug!("worker: {handle} moved to {to:?} tier");
		},
		Some(EntryState::Ready { tier, .. }) => {
			debug!("worker: {handle} already in {tier:?} tier");
		},
		Some(_) => {
			warn!("worker: {handle} is not resident, swap ignored");
		},
		None => {
			warn!("worker: swap of dead {handle}");
		},
	}
}

fn apply(shared: &Shared, kernel: Arc<dyn Kernel>, inputs: ThinVec<Handle>, outputs: &[Handle]) {
	let values = {
		let mut st = shared.state.lock();
		if let Some(err) = inputs.iter().find_map(|&h| st.poison_of(h)) {
			trace!("worker: {} skipped, input poisoned", kernel.name());
			st.poison(outputs, &err, false);
			return;
		}
		let mut values: SmallVec<[Arc<TensorValue>; 4]> = SmallVec::with_capacity(inputs.len());
		for &h in &inputs {
			match st.materialize(h, 0) {
				Ok(v) => values.push(v),
				Err(err) => {
					cold_path();
					st.poison(outputs, &err, true);
					return;
				},
			}
		}
		values
	};

	let refs: SmallVec<[&TensorValue; 4]> = values.iter().map(AsRef::as_ref).collect();
	let result = run_kernel(kernel.as_ref(), &refs).and_then(|results| {
		if results.len() == outputs.len() {
			Ok(results)
		} else {
			cold_path();
			Err(ErrPack::new(
				RuntimeError::ExecutionFailed,
				format!(
					"{} produced {} outputs, expected {}",
					kernel.name(),
					results.len(),
					outputs.len()
				),
			))
		}
	});
	drop(refs);
	drop(values);

	let mut st = shared.state.lock();
	match result {
		Ok(results) => {
			for (output_index, (&h, value)) in outputs.iter().zip(results).enumerate() {
				let Some(entry) = st.table.get_mut(h) else {
					continue;
				};
				entry.layout = Some(Layout::of(&value));
				entry.state = EntryState::Ready { value: Arc::new(value), tier: Tier::Device };
				entry.origin = Origin::Computed(Producer {
					kernel: kernel.clone(),
					inputs: inputs.clone(),
					output_index,
				});
			}
			trace!("worker: {} done", kernel.name());
		},
		Err(err) => {
			debug!("worker: {} failed: {err}", kernel.name());
			st.poison(outputs, &Arc::new(err), true);
		},
	}
}
