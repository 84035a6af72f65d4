//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use smallvec::SmallVec;

use crate::config::{MAX_ASYNC_LEVEL, RuntimeConfig};
use crate::device::{Device, DeviceQueue};
use crate::dtype::DType;
use crate::error::{ChannelClosedError, InvalidHandleError, RtResult, RuntimeError};
use crate::op::{Kernel, OpDef};
use crate::shape::{MAX_NDIM, Shape};
use crate::value::TensorValue;
use crate::{ErrExtra, ErrPack, cold_path};

pub mod handle;
pub(crate) mod worker;

pub use handle::{Handle, Layout, Tier};

use handle::{Entry, EntryState};
use worker::{ChannelState, Command, Shared, SharedErr};

//--------------------------------------------------------------------------------------------------

/// Asynchronous execution channel.
///
/// Requests are executed by a single worker thread in submission order. Every request
/// returns as soon as it is queued; results are read back through `get_*` calls that
/// block until the handle is resolved.
pub struct Channel {
	shared: Arc<Shared>,
	sender: Option<Sender<Command>>,
	worker: Option<JoinHandle<()>>,
	async_level: Cell<u32>,
	queue_depth_per_level: usize,
	/// Read when a swap or drop is requested, not when the worker reaches it.
	swap_enabled: Cell<bool>,
	drop_enabled: Cell<bool>,
	device_queues: RefCell<Vec<Arc<dyn DeviceQueue>>>,
}

impl Channel {
	pub fn new(config: &RuntimeConfig) -> RtResult<Self> {
		if config.async_level > MAX_ASYNC_LEVEL {
			cold_path();
			return Err(async_level_error(config.async_level));
		}
		let shared = Arc::new(Shared {
			state: Mutex::new(ChannelState::default()),
			progress: Condvar::new(),
		});
		let (sender, receiver) = mpsc::channel();
		let worker_shared = shared.clone();
		let worker = std::thread::Builder::new()
			.name("imperative-worker".into())
			.spawn(move || worker::run(&worker_shared, &receiver))
			.map_err(|e| ErrPack {
				code: RuntimeError::ChannelClosed,
				extra: Some(Box::new(ErrExtra {
					message: "failed to start the channel worker".into(),
					nested: Some(Box::new(e)),
				})),
			})?;
		debug!(
			"channel created: async_level={}, swap={}, drop={}",
			config.async_level, config.swap_enabled, config.drop_enabled
		);
		Ok(Self {
			shared,
			sender: Some(sender),
			worker: Some(worker),
			async_level: Cell::new(config.async_level),
			queue_depth_per_level: config.queue_depth_per_level.max(1),
			swap_enabled: Cell::new(config.swap_enabled),
			drop_enabled: Cell::new(config.drop_enabled),
			device_queues: RefCell::new(Vec::new()),
		})
	}

	fn lock(&self) -> MutexGuard<'_, ChannelState> {
		self.shared.state.lock()
	}

	/// Enqueues a command, honouring the async level.
	fn submit(&self, cmd: Command) -> RtResult<()> {
		let Some(sender) = &self.sender else {
			cold_path();
			return Err(ChannelClosedError.into());
		};
		let level = self.async_level.get();
		{
			let mut st = self.lock();
			if level > 0 {
				let bound = level as usize * self.queue_depth_per_level;
				while st.in_flight >= bound && !st.closed {
					self.shared.progress.wait(&mut st);
				}
			}
			if st.closed {
				cold_path();
				return Err(ChannelClosedError.into());
			}
			st.in_flight += 1;
		}
		if sender.send(cmd).is_err() {
			cold_path();
			let mut st = self.lock();
			st.in_flight = st.in_flight.saturating_sub(1);
			return Err(ChannelClosedError.into());
		}
		if level == 0 {
			drop(self.wait_until_empty());
		}
		Ok(())
	}

	fn wait_until_empty(&self) -> MutexGuard<'_, ChannelState> {
		let mut st = self.lock();
		while st.in_flight > 0 && !st.closed {
			self.shared.progress.wait(&mut st);
		}
		st
	}

	//----------------------------------------------------------------------------------------------

	/// Admits a host value and returns its handle.
	///
	/// Small values are resolved immediately. Larger ones become ready once the worker
	/// reaches them, but their layout is known right away.
	pub fn put(&self, value: TensorValue, no_cache: bool) -> RtResult<Handle> {
		if value.elems() <= MAX_NDIM {
			let handle = self.lock().table.alloc(Entry::ready_put(value, no_cache));
			trace!("put {handle} (resolved)");
			return Ok(handle);
		}
		let layout = Layout::of(&value);
		let handle = self.lock().table.alloc(Entry::pending_put(layout, no_cache));
		trace!("put {handle} (queued)");
		if let Err(err) = self.submit(Command::Put { handle, value }) {
			self.lock().table.free(handle);
			return Err(err);
		}
		Ok(handle)
	}

	pub fn apply_op(&self, op: &OpDef, inputs: &[Handle]) -> RtResult<SmallVec<[Handle; 2]>> {
		let Some(kernel) = op.kernel_impl() else {
			cold_path();
			return Err(ErrPack::new(
				RuntimeError::InvalidArgument,
				format!("operator {} cannot be executed by the channel", op.name()),
			));
		};
		self.apply_kernel(kernel.clone(), inputs)
	}

	/// Queues `kernel` on `inputs`. Output handles are valid immediately.
	pub fn apply_kernel(
		&self,
		kernel: Arc<dyn Kernel>,
		inputs: &[Handle],
	) -> RtResult<SmallVec<[Handle; 2]>> {
		let output_count = kernel.output_count(inputs.len());
		let outputs: SmallVec<[Handle; 2]> = {
			let mut st = self.lock();
			if let Some(dead) = inputs.iter().find(|&&h| !st.table.contains(h)) {
				cold_path();
				return Err(ErrPack::new(
					RuntimeError::InvalidHandle,
					format!("{}: input {dead} is not a live handle", kernel.name()),
				));
			}
			(0..output_count).map(|_| st.table.alloc(Entry::pending())).collect()
		};
		trace!("apply_op {}: {inputs:?} -> {outputs:?}", kernel.name());
		let cmd = Command::ApplyOp {
			kernel,
			inputs: inputs.iter().copied().collect(),
			outputs: outputs.iter().copied().collect(),
		};
		if let Err(err) = self.submit(cmd) {
			let mut st = self.lock();
			for &h in &outputs {
				st.table.free(h);
			}
			return Err(err);
		}
		Ok(outputs)
	}

	//----------------------------------------------------------------------------------------------

	/// Blocks until `handle` is resolved and returns its value.
	///
	/// A poisoned handle fails with the error that poisoned it; observing it this way
	/// removes it from what the next `sync` reports. A dropped value is rebuilt by the
	/// worker, after the requests queued before this call.
	fn wait_value(&self, handle: Handle, to_device: bool) -> RtResult<Arc<TensorValue>> {
		let mut st = self.lock();
		loop {
			let Some(entry) = st.table.get_mut(handle) else {
				cold_path();
				return Err(InvalidHandleError.into());
			};
			match &mut entry.state {
				EntryState::Pending | EntryState::Regenerating => {},
				EntryState::Ready { value, tier } => {
					if to_device && *tier == Tier::Host {
						debug!("{handle} swapped in for device access");
						*tier = Tier::Device;
					}
					return Ok(value.clone());
				},
				EntryState::Poisoned(err) => {
					let err = err.clone();
					st.mark_seen(&err);
					return Err(ErrPack::reraise(&err));
				},
				EntryState::Dropped => {
					entry.state = EntryState::Regenerating;
					drop(st);
					trace!("{handle} was dropped, queueing regeneration");
					self.submit(Command::Regenerate(handle))?;
					st = self.lock();
					continue;
				},
			}
			if st.closed {
				cold_path();
				return Err(ChannelClosedError.into());
			}
			self.shared.progress.wait(&mut st);
		}
	}

	fn wait_layout(&self, handle: Handle) -> RtResult<Layout> {
		let mut st = self.lock();
		loop {
			let Some(entry) = st.table.get(handle) else {
				cold_path();
				return Err(InvalidHandleError.into());
			};
			if let Some(layout) = &entry.layout {
				return Ok(layout.clone());
			}
			if let Some(err) = entry.poisoned() {
				let err = err.clone();
				st.mark_seen(&err);
				return Err(ErrPack::reraise(&err));
			}
			if st.closed {
				cold_path();
				return Err(ChannelClosedError.into());
			}
			self.shared.progress.wait(&mut st);
		}
	}

	pub fn get_value(&self, handle: Handle) -> RtResult<TensorValue> {
		let value = self.wait_value(handle, false)?;
		Ok(TensorValue::clone(&value))
	}

	/// Device-tier value. A swapped out value is swapped back in.
	pub fn get_dev_tensor(&self, handle: Handle) -> RtResult<TensorValue> {
		let value = self.wait_value(handle, true)?;
		Ok(TensorValue::clone(&value))
	}

	pub fn get_dtype(&self, handle: Handle) -> RtResult<DType> {
		Ok(self.wait_layout(handle)?.dtype)
	}

	pub fn get_shape(&self, handle: Handle) -> RtResult<Shape> {
		Ok(self.wait_layout(handle)?.shape)
	}

	pub fn get_device(&self, handle: Handle) -> RtResult<Device> {
		Ok(self.wait_layout(handle)?.device)
	}

	/// Current storage tier, without waiting. `None` while unresolved, dropped or poisoned.
	pub fn tier_of(&self, handle: Handle) -> Option<Tier> {
		match self.lock().table.get(handle)?.state {
			EntryState::Ready { tier, .. } => Some(tier),
			_ => None,
		}
	}

	/// `true` if the value is currently held, as opposed to pending, dropped or poisoned.
	pub fn is_resident(&self, handle: Handle) -> bool {
		self.tier_of(handle).is_some()
	}

	//----------------------------------------------------------------------------------------------

	fn check_live(&self, handle: Handle) -> RtResult<()> {
		if self.lock().table.contains(handle) {
			Ok(())
		} else {
			cold_path();
			Err(InvalidHandleError.into())
		}
	}

	/// Moves the value to the host tier once earlier requests are done.
	/// Ignored unless swapping is enabled at the time of the call.
	pub fn swap_out(&self, handle: Handle) -> RtResult<()> {
		self.check_live(handle)?;
		if !self.swap_enabled.get() {
			trace!("swap_out {handle} ignored, swap is disabled");
			return Ok(());
		}
		self.submit(Command::SwapOut(handle))
	}

	pub fn swap_in(&self, handle: Handle) -> RtResult<()> {
		self.check_live(handle)?;
		if !self.swap_enabled.get() {
			trace!("swap_in {handle} ignored, swap is disabled");
			return Ok(());
		}
		self.submit(Command::SwapIn(handle))
	}

	/// Lets the worker discard the value once earlier requests are done. A later read
	/// regenerates it from its producer when possible. Ignored unless dropping is enabled
	/// at the time of the call.
	pub fn drop(&self, handle: Handle) -> RtResult<()> {
		self.check_live(handle)?;
		if !self.drop_enabled.get() {
			trace!("drop {handle} ignored, drop is disabled");
			return Ok(());
		}
		self.submit(Command::Drop(handle))
	}

	/// Releases the handle. Requests already queued for it still run.
	pub fn del(&self, handle: Handle) {
		if let Err(err) = self.submit(Command::Del(handle)) {
			debug!("del {handle}: {err}");
		}
	}

	//----------------------------------------------------------------------------------------------

	/// Waits for every queued request and reports the first execution failure since the
	/// last `sync` that was not already reported by `get_value`.
	pub fn sync(&self) -> RtResult<()> {
		let mut st = self.wait_until_empty();
		if st.unseen_errors.is_empty() {
			return Ok(());
		}
		let errors = std::mem::take(&mut st.unseen_errors);
		drop(st);
		let (handle, err) = &errors[0];
		debug!("sync: {} unseen error(s), first at {handle}", errors.len());
		Err(ErrPack::reraise(err))
	}

	/// `sync`, then waits for every attached device queue.
	pub fn full_sync(&self) -> RtResult<()> {
		let result = self.sync();
		let queues: Vec<Arc<dyn DeviceQueue>> = self.device_queues.borrow().clone();
		let mut queue_result = Ok(());
		for queue in queues {
			if let Err(err) = queue.wait_idle() {
				cold_path();
				warn!("full_sync: device queue {} failed: {err}", queue.device());
				if queue_result.is_ok() {
					queue_result = Err(err);
				}
			}
		}
		result.and(queue_result)
	}

	pub fn attach_device_queue(&self, queue: Arc<dyn DeviceQueue>) {
		debug!("attached device queue for {}", queue.device());
		self.device_queues.borrow_mut().push(queue);
	}

	//----------------------------------------------------------------------------------------------

	pub fn set_swap_flag(&self, enabled: bool) {
		self.swap_enabled.set(enabled);
	}

	pub fn set_drop_flag(&self, enabled: bool) {
		self.drop_enabled.set(enabled);
	}

	pub fn swap_enabled(&self) -> bool {
		self.swap_enabled.get()
	}

	pub fn drop_enabled(&self) -> bool {
		self.drop_enabled.get()
	}

	pub fn config_async_level(&self, level: u32) -> RtResult<()> {
		if level > MAX_ASYNC_LEVEL {
			cold_path();
			return Err(async_level_error(level));
		}
		debug!("async level {} -> {level}", self.async_level.get());
		self.async_level.set(level);
		if level == 0 {
			drop(self.wait_until_empty());
		}
		Ok(())
	}

	pub fn get_async_level(&self) -> u32 {
		self.async_level.get()
	}

	/// Number of handles not yet released by the worker.
	pub fn live_handle_count(&self) -> usize {
		self.lock().table.live_count()
	}

	pub fn in_flight(&self) -> usize {
		self.lock().in_flight
	}
}

fn async_level_error(level: u32) -> ErrPack<RuntimeError> {
	ErrPack::new(
		RuntimeError::InvalidArgument,
		format!("async level must be between 0 and {MAX_ASYNC_LEVEL}, got {level}"),
	)
}

impl Drop for Channel {
	fn drop(&mut self) {
		// closing the sender stops the worker once the queue is drained
		self.sender = None;
		if let Some(worker) = self.worker.take() {
			if worker.join().is_err() {
				warn!("channel worker terminated abnormally");
			}
		}
		let st = self.lock();
		if !st.unseen_errors.is_empty() {
			let errors: Vec<&SharedErr> = st.unseen_errors.iter().map(|(_, e)| e).collect();
			warn!("channel closed with {} unreported error(s): {}", errors.len(), errors[0]);
		}
	}
}

//--------------------------------------------------------------------------------------------------

/// Shared owner of a channel handle.
///
/// Clones refer to the same handle; the handle is released when the last one goes away.
#[derive(Clone)]
pub struct SharedHandle(Rc<HandleOwner>);

struct HandleOwner {
	handle: Handle,
	channel: Rc<Channel>,
}

impl Drop for HandleOwner {
	fn drop(&mut self) {
		self.channel.del(self.handle);
	}
}

impl SharedHandle {
	pub fn new(handle: Handle, channel: Rc<Channel>) -> Self {
		Self(Rc::new(HandleOwner { handle, channel }))
	}

	pub fn get(&self) -> Handle {
		self.0.handle
	}

	pub fn channel(&self) -> &Rc<Channel> {
		&self.0.channel
	}

	pub fn owners(&self) -> usize {
		Rc::strong_count(&self.0)
	}

	pub fn ptr_eq(a: &Self, b: &Self) -> bool {
		Rc::ptr_eq(&a.0, &b.0)
	}
}

impl std::fmt::Debug for SharedHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "SharedHandle({})", self.0.handle)
	}
}
