//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use crate::device::Device;
use crate::dtype::DType;
use crate::shape::Shape;
use crate::value::TensorValue;

//--------------------------------------------------------------------------------------------------

/// What the static graph knows about a node's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferType {
	/// Known at graph build time.
	Const,
	/// Known once the graph runs, without depending on inputs.
	RtStatic,
	Other,
}

impl InferType {
	pub fn is_inferable(self) -> bool {
		matches!(self, Self::Const | Self::RtStatic)
	}
}

/// A node of a static computation graph that a tensor can be bound to while tracing.
pub trait GraphVar {
	/// `None` while the shape is not inferred.
	fn shape(&self) -> Option<Shape>;

	fn dtype(&self) -> DType;

	fn device(&self) -> Device;

	fn infer_type(&self) -> InferType;

	fn infer_value_fallible(&self) -> Option<TensorValue>;
}

//--------------------------------------------------------------------------------------------------

/// Graph node with a value known upfront.
pub struct ConstVar {
	value: TensorValue,
	infer_type: InferType,
	shape_known: bool,
}

impl ConstVar {
	pub fn new(value: TensorValue) -> Self {
		Self { value, infer_type: InferType::Const, shape_known: true }
	}

	pub fn with_infer_type(self, infer_type: InferType) -> Self {
		Self { infer_type, ..self }
	}

	/// Makes `shape()` report the shape as not yet inferred.
	pub fn with_unknown_shape(self) -> Self {
		Self { shape_known: false, ..self }
	}
}

impl GraphVar for ConstVar {
	fn shape(&self) -> Option<Shape> {
		self.shape_known.then(|| self.value.shape().clone())
	}

	fn dtype(&self) -> DType {
		self.value.dtype()
	}

	fn device(&self) -> Device {
		self.value.device()
	}

	fn infer_type(&self) -> InferType {
		self.infer_type
	}

	fn infer_value_fallible(&self) -> Option<TensorValue> {
		self.infer_type.is_inferable().then(|| self.value.clone())
	}
}
