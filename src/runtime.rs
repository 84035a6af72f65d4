//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::debug;

use crate::channel::{Channel, Handle, SharedHandle};
use crate::config::{RuntimeConfig, init_logging};
use crate::error::{RtResult, RuntimeError};
use crate::graph::GraphVar;
use crate::strategy::{ConstArgs, GradTape, TraceMode, TraceRecorder};
use crate::tensor::arena::{EntityArena, EntityData};
use crate::tensor::{Tensor, TensorFlags};
use crate::value::TensorValue;
use crate::{ErrPack, cold_path};

pub mod task_queue;

pub use task_queue::TaskQueue;

//--------------------------------------------------------------------------------------------------

pub(crate) struct RuntimeInner {
	pub config: RuntimeConfig,
	pub channel: Rc<Channel>,
	pub entities: RefCell<EntityArena>,

	pub tracing: Cell<bool>,
	pub symbolic: Cell<bool>,
	pub compiled: Cell<bool>,
	pub skip_tracing: Cell<bool>,
	pub global_disable: Cell<TensorFlags>,

	pub grad_tape: RefCell<Option<Rc<dyn GradTape>>>,
	pub trace_recorder: RefCell<Option<Rc<dyn TraceRecorder>>>,
	pub tasks: TaskQueue,
}

/// Execution context: the channel, the tensor entities, and the mode state the router
/// consults on every operation.
///
/// Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Runtime(pub(crate) Rc<RuntimeInner>);

impl Runtime {
	pub fn new(config: RuntimeConfig) -> RtResult<Self> {
		init_logging(config.log_verbosity);
		let channel = Rc::new(Channel::new(&config)?);
		Ok(Self(Rc::new(RuntimeInner {
			config,
			channel,
			entities: RefCell::new(EntityArena::default()),
			tracing: Cell::new(false),
			symbolic: Cell::new(false),
			compiled: Cell::new(false),
			skip_tracing: Cell::new(false),
			global_disable: Cell::new(TensorFlags::NONE),
			grad_tape: RefCell::new(None),
			trace_recorder: RefCell::new(None),
			tasks: TaskQueue::default(),
		})))
	}

	pub fn from_env() -> RtResult<Self> {
		Self::new(RuntimeConfig::from_env())
	}

	pub fn config(&self) -> &RuntimeConfig {
		&self.0.config
	}

	pub fn channel(&self) -> &Rc<Channel> {
		&self.0.channel
	}

	pub fn tasks(&self) -> &TaskQueue {
		&self.0.tasks
	}

	/// Number of tensor entities alive.
	pub fn live_tensor_count(&self) -> usize {
		self.0.entities.borrow().live_count()
	}

	//----------------------------------------------------------------------------------------------

	pub fn set_grad_tape(&self, tape: Option<Rc<dyn GradTape>>) {
		*self.0.grad_tape.borrow_mut() = tape;
	}

	pub fn set_trace_recorder(&self, recorder: Option<Rc<dyn TraceRecorder>>) {
		*self.0.trace_recorder.borrow_mut() = recorder;
	}

	pub(crate) fn grad_tape(&self) -> Option<Rc<dyn GradTape>> {
		self.0.grad_tape.borrow().clone()
	}

	pub(crate) fn trace_recorder(&self) -> Option<Rc<dyn TraceRecorder>> {
		self.0.trace_recorder.borrow().clone()
	}

	pub fn set_tracing(&self) {
		self.0.tracing.set(true);
	}

	pub fn unset_tracing(&self) {
		self.0.tracing.set(false);
	}

	pub fn is_tracing(&self) -> bool {
		self.0.tracing.get()
	}

	pub fn set_symbolic(&self) {
		self.0.symbolic.set(true);
	}

	pub fn unset_symbolic(&self) {
		self.0.symbolic.set(false);
	}

	pub fn set_compiled(&self) {
		self.0.compiled.set(true);
	}

	pub fn unset_compiled(&self) {
		self.0.compiled.set(false);
	}

	pub fn set_skip_tracing(&self, skip: bool) {
		self.0.skip_tracing.set(skip);
	}

	pub fn skip_tracing(&self) -> bool {
		self.0.skip_tracing.get()
	}

	/// Flags in `mask` are ignored by the router.
	pub fn set_global_disable(&self, mask: TensorFlags) {
		self.0.global_disable.set(mask);
	}

	pub fn global_disable(&self) -> TensorFlags {
		self.0.global_disable.get()
	}

	pub fn reset_modes(&self) {
		self.0.tracing.set(false);
		self.0.symbolic.set(false);
		self.0.compiled.set(false);
		self.0.skip_tracing.set(false);
		self.0.global_disable.set(TensorFlags::NONE);
	}

	/// Compiled takes precedence over symbolic.
	pub fn trace_mode(&self) -> TraceMode {
		if self.0.compiled.get() {
			TraceMode::Compiled
		} else if self.0.symbolic.get() {
			TraceMode::Symbolic
		} else {
			TraceMode::Traced
		}
	}

	//----------------------------------------------------------------------------------------------

	pub(crate) fn new_tensor(&self, data: EntityData) -> Tensor {
		let id = self.0.entities.borrow_mut().alloc(data);
		Tensor::from_id(id, self.0.clone())
	}

	pub fn share_handle(&self, handle: Handle) -> SharedHandle {
		SharedHandle::new(handle, self.0.channel.clone())
	}

	/// Creates a tensor from a host value.
	///
	/// A constant created while tracing is handed to the trace recorder instead of the
	/// channel.
	pub fn tensor_from_value(&self, value: TensorValue, is_const: bool, no_cache: bool) -> RtResult<Tensor> {
		if is_const && self.is_tracing() {
			if let Some(recorder) = self.trace_recorder() {
				let mode = if self.0.compiled.get() { TraceMode::Compiled } else { TraceMode::Traced };
				let args = ConstArgs { value, no_cache };
				let outputs = recorder.apply_const(self, &args, mode)?;
				let Some(first) = outputs.into_iter().next() else {
					cold_path();
					return Err(ErrPack::new(
						RuntimeError::InvalidArgument,
						"trace recorder returned no tensor for a constant",
					));
				};
				return Ok(first);
			}
			debug!("tracing without a trace recorder, constant goes to the channel");
		}
		let scalar = value.ndim() == 0;
		let handle = self.0.channel.put(value, no_cache)?;
		let flags = if scalar { TensorFlags::SCALAR } else { TensorFlags::NONE };
		Ok(self.tensor_from_shared(self.share_handle(handle), flags))
	}

	/// Takes ownership of a channel handle.
	pub fn tensor_from_handle(&self, handle: Handle) -> Tensor {
		self.tensor_from_shared(self.share_handle(handle), TensorFlags::NONE)
	}

	pub fn tensor_from_shared(&self, handle: SharedHandle, flags: TensorFlags) -> Tensor {
		self.new_tensor(EntityData {
			handle: Some(handle),
			flags,
			..EntityData::default()
		})
	}

	pub fn tensor_from_var(&self, var: Rc<dyn GraphVar>) -> Tensor {
		self.new_tensor(EntityData {
			graph_ref: Some(var),
			..EntityData::default()
		})
	}

	/// A tensor with neither a handle nor a graph node.
	pub fn empty_tensor(&self) -> Tensor {
		self.new_tensor(EntityData::default())
	}

	//----------------------------------------------------------------------------------------------

	/// Waits for the channel and runs the deferred tasks.
	pub fn sync(&self) -> RtResult<()> {
		let result = self.0.channel.sync();
		let tasks = self.0.tasks.run_all();
		result.and(tasks)
	}

	pub fn full_sync(&self) -> RtResult<()> {
		let result = self.0.channel.full_sync();
		let tasks = self.0.tasks.run_all();
		result.and(tasks)
	}
}
