//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::cell::{Ref, RefMut};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::channel::{Channel, SharedHandle};
use crate::device::Device;
use crate::dtype::DType;
use crate::error::{RtResult, RuntimeError};
use crate::graph::GraphVar;
use crate::runtime::{Runtime, RuntimeInner};
use crate::shape::Shape;
use crate::value::TensorValue;
use crate::{ErrPack, cold_path};

pub mod arena;
pub mod flags;

pub use arena::EntityId;
pub use flags::{TensorFlags, TraceInfo};

use arena::EntityData;

//--------------------------------------------------------------------------------------------------

#[cold]
#[inline(never)]
fn invalid_tensor() -> ErrPack<RuntimeError> {
	ErrPack::new(RuntimeError::InvalidTensor, "tensor invalid")
}

#[cold]
#[inline(never)]
#[allow(clippy::panic)]
fn dangling(id: EntityId) -> ! {
	panic!("tensor entity {} is not alive", id.slot());
}

/// Strong reference to a tensor entity.
///
/// Clones refer to the same entity, so a handle set through one clone is seen by all.
/// The entity, and with it the channel handle, is released when the last clone is dropped.
pub struct Tensor {
	id: EntityId,
	rt: Rc<RuntimeInner>,
}

impl Tensor {
	pub(crate) fn from_id(id: EntityId, rt: Rc<RuntimeInner>) -> Self {
		Self { id, rt }
	}

	pub fn id(&self) -> EntityId {
		self.id
	}

	pub fn runtime(&self) -> Runtime {
		Runtime(self.rt.clone())
	}

	fn data(&self) -> Ref<'_, EntityData> {
		Ref::map(self.rt.entities.borrow(), |arena| match arena.get(self.id) {
			Some(data) => data,
			None => dangling(self.id),
		})
	}

	fn data_mut(&self) -> RefMut<'_, EntityData> {
		RefMut::map(self.rt.entities.borrow_mut(), |arena| match arena.get_mut(self.id) {
			Some(data) => data,
			None => dangling(self.id),
		})
	}

	pub fn downgrade(&self) -> TensorWeakRef {
		TensorWeakRef { id: self.id, rt: Rc::downgrade(&self.rt) }
	}

	pub fn ptr_eq(a: &Self, b: &Self) -> bool {
		a.id == b.id && Rc::ptr_eq(&a.rt, &b.rt)
	}

	/// Rebinds this reference to the entity of `other`.
	pub fn reset(&mut self, other: &Self) {
		*self = other.clone();
	}

	//----------------------------------------------------------------------------------------------

	pub fn handle(&self) -> Option<SharedHandle> {
		self.data().handle.clone()
	}

	pub fn set_handle(&self, handle: Option<SharedHandle>) {
		let old = std::mem::replace(&mut self.data_mut().handle, handle);
		drop(old);
	}

	pub fn varnode(&self) -> Option<Rc<dyn GraphVar>> {
		self.data().graph_ref.clone()
	}

	pub fn set_varnode(&self, var: Option<Rc<dyn GraphVar>>) {
		let old = std::mem::replace(&mut self.data_mut().graph_ref, var);
		drop(old);
	}

	pub fn reset_varnode(&self) {
		self.set_varnode(None);
	}

	pub fn flags(&self) -> TensorFlags {
		self.data().flags
	}

	pub fn set_flags(&self, flags: TensorFlags) {
		self.data_mut().flags = flags;
	}

	pub fn is_scalar(&self) -> bool {
		self.flags().contains(TensorFlags::SCALAR)
	}

	pub fn set_scalar(&self, scalar: bool) {
		let mut data = self.data_mut();
		data.flags = data.flags.with(TensorFlags::SCALAR, scalar);
	}

	//----------------------------------------------------------------------------------------------

	pub fn trace_info(&self) -> TraceInfo {
		self.data().trace_info
	}

	pub fn set_trace_info(&self, info: TraceInfo) {
		self.data_mut().trace_info = info;
	}

	pub fn data_read(&self) -> bool {
		self.data().trace_info.data_read
	}

	pub fn set_data_read(&self, v: bool) {
		self.data_mut().trace_info.data_read = v;
	}

	pub fn value_read(&self) -> bool {
		self.data().trace_info.value_read
	}

	pub fn set_value_read(&self, v: bool) {
		self.data_mut().trace_info.value_read = v;
	}

	pub fn shape_read(&self) -> bool {
		self.data().trace_info.shape_read
	}

	pub fn set_shape_read(&self, v: bool) {
		self.data_mut().trace_info.shape_read = v;
	}

	pub fn mixin_handle(&self) -> i64 {
		self.data().trace_info.mixin_handle
	}

	pub fn set_mixin_handle(&self, v: i64) {
		self.data_mut().trace_info.mixin_handle = v;
	}

	fn note_read(&self, mark: impl FnOnce(&mut TraceInfo)) {
		if !self.rt.skip_tracing.get() {
			mark(&mut self.data_mut().trace_info);
		}
	}

	fn require_handle(&self) -> RtResult<SharedHandle> {
		self.handle().ok_or_else(invalid_tensor)
	}

	//----------------------------------------------------------------------------------------------

	/// `None` if the shape is not known: the graph node has not inferred it, or a
	/// non-SCALAR tensor reports zero dimensions.
	pub fn shape(&self) -> RtResult<Option<Shape>> {
		self.note_read(|info| info.shape_read = true);
		let (flags, var, handle) = {
			let data = self.data();
			(data.flags, data.graph_ref.clone(), data.handle.clone())
		};
		if flags.contains(TensorFlags::SCALAR) {
			return Ok(Some(Shape::scalar()));
		}
		let shape = if let Some(var) = var {
			var.shape()
		} else if let Some(handle) = handle {
			Some(handle.channel().get_shape(handle.get())?)
		} else {
			cold_path();
			return Err(invalid_tensor());
		};
		Ok(shape.filter(|s| !s.is_scalar()))
	}

	pub fn dtype(&self) -> RtResult<DType> {
		if let Some(var) = self.varnode() {
			return Ok(var.dtype());
		}
		let handle = self.require_handle()?;
		handle.channel().get_dtype(handle.get())
	}

	pub fn device(&self) -> RtResult<Device> {
		if let Some(var) = self.varnode() {
			return Ok(var.device());
		}
		let handle = self.require_handle()?;
		handle.channel().get_device(handle.get())
	}

	/// Host copy of the value. A SCALAR tensor yields a zero-rank value.
	///
	/// A tensor bound only to a graph node is read through the node's value inference.
	pub fn value(&self) -> RtResult<TensorValue> {
		self.note_read(|info| info.value_read = true);
		let (flags, var, handle) = {
			let data = self.data();
			(data.flags, data.graph_ref.clone(), data.handle.clone())
		};
		let value = match (handle, var) {
			(Some(handle), _) => handle.channel().get_value(handle.get())?,
			(None, Some(var)) => {
				if !var.infer_type().is_inferable() {
					cold_path();
					return Err(invalid_tensor());
				}
				var.infer_value_fallible().ok_or_else(invalid_tensor)?
			},
			(None, None) => {
				cold_path();
				return Err(invalid_tensor());
			},
		};
		if flags.contains(TensorFlags::SCALAR) { value.squeeze() } else { Ok(value) }
	}

	/// Device-side value.
	pub fn dev_tensor(&self) -> RtResult<TensorValue> {
		self.note_read(|info| info.data_read = true);
		let handle = self.require_handle()?;
		handle.channel().get_dev_tensor(handle.get())
	}

	pub fn swap_out(&self) -> RtResult<()> {
		let handle = self.require_handle()?;
		handle.channel().swap_out(handle.get())
	}

	pub fn swap_in(&self) -> RtResult<()> {
		let handle = self.require_handle()?;
		handle.channel().swap_in(handle.get())
	}

	pub fn drop_value(&self) -> RtResult<()> {
		let handle = self.require_handle()?;
		Channel::drop(handle.channel(), handle.get())
	}

	/// New entity sharing this tensor's handle, graph node and trace info, with no flags.
	pub fn detach(&self) -> Self {
		let (handle, graph_ref, trace_info) = {
			let data = self.data();
			(data.handle.clone(), data.graph_ref.clone(), data.trace_info)
		};
		self.runtime().new_tensor(EntityData {
			handle,
			graph_ref,
			trace_info,
			..EntityData::default()
		})
	}
}

impl Clone for Tensor {
	fn clone(&self) -> Self {
		self.rt.entities.borrow_mut().retain(self.id);
		Self { id: self.id, rt: self.rt.clone() }
	}
}

impl Drop for Tensor {
	fn drop(&mut self) {
		let released = self.rt.entities.borrow_mut().release(self.id);
		// the handle and the graph node may own other tensors
		drop(released);
	}
}

impl fmt::Debug for Tensor {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		let data = self.data();
		write!(f, "Tensor(#{}, {:?}", self.id.slot(), data.flags)?;
		if let Some(handle) = &data.handle {
			write!(f, ", {}", handle.get())?;
		}
		write!(f, ")")
	}
}

//--------------------------------------------------------------------------------------------------

/// Non-owning reference to a tensor entity.
#[derive(Clone)]
pub struct TensorWeakRef {
	id: EntityId,
	rt: Weak<RuntimeInner>,
}

impl TensorWeakRef {
	/// The tensor, if it is still alive.
	pub fn upgrade(&self) -> Option<Tensor> {
		let rt = self.rt.upgrade()?;
		if !rt.entities.borrow_mut().try_retain(self.id) {
			return None;
		}
		Some(Tensor { id: self.id, rt })
	}

	pub fn is_alive(&self) -> bool {
		self.rt
			.upgrade()
			.is_some_and(|rt| rt.entities.borrow().get(self.id).is_some())
	}
}
