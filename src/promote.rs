//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use smallvec::SmallVec;

use crate::device::Device;
use crate::dtype::{Category, DType, promote_types};
use crate::error::{RtResult, RuntimeError};
use crate::tensor::Tensor;
use crate::{ErrPack, cold_path};

//--------------------------------------------------------------------------------------------------

/// An argument as seen by dtype and device resolution.
#[derive(Clone)]
pub enum Operand<'a> {
	Tensor(&'a Tensor),
	/// Array-like host value that will become a tensor.
	Array(DType, Device),
	Bool,
	Int,
	Float,
	/// Something that has no dtype, such as a string.
	Opaque,
	None,
	Seq(Vec<Operand<'a>>),
}

impl Operand<'_> {
	fn is_tensor_sourced(&self) -> bool {
		matches!(self, Self::Tensor(_) | Self::Array(..))
	}
}

/// A single sequence argument stands for its elements.
fn flatten<'o, 'a>(operands: &'o [Operand<'a>]) -> &'o [Operand<'a>] {
	match operands {
		[Operand::Seq(items)] => items,
		_ => operands,
	}
}

#[derive(Default)]
struct Group {
	top: Option<Category>,
	members: SmallVec<[DType; 4]>,
}

impl Group {
	fn add(&mut self, dtype: DType) {
		self.members.push(dtype);
		let c = dtype.category();
		if self.top.is_none_or(|top| c > top) {
			self.top = Some(c);
		}
	}

	fn top(&self) -> Category {
		self.top.unwrap_or(Category::Other)
	}

	/// Pairwise promotion of the members in the top category, left to right.
	fn widest(&self) -> Option<DType> {
		let top = self.top?;
		self.members
			.iter()
			.copied()
			.filter(|d| d.category() == top)
			.reduce(promote_types)
	}
}

/// Result dtype of an operation on `operands`.
///
/// A scalar literal only decides the result when its category is strictly higher than the
/// category of every tensor, so `int32 tensor + 1.5` is floating but `float32 tensor + 1`
/// stays `float32`.
pub fn resolve_dtype(operands: &[Operand]) -> RtResult<DType> {
	let mut tensors = Group::default();
	let mut scalars = Group::default();
	for operand in flatten(operands) {
		match operand {
			Operand::Tensor(t) => tensors.add(t.dtype()?),
			Operand::Array(dtype, _) => tensors.add(*dtype),
			Operand::Bool => scalars.add(DType::BOOL),
			Operand::Int => scalars.add(DType::I32),
			Operand::Float => scalars.add(DType::F32),
			Operand::Opaque | Operand::None | Operand::Seq(_) => {},
		}
	}
	let (scalar_top, tensor_top) = (scalars.top(), tensors.top());
	let winner = if scalar_top > tensor_top { &scalars } else { &tensors };
	if scalar_top == Category::Other && tensor_top == Category::Other {
		cold_path();
		return Err(ErrPack::new(RuntimeError::NoDTypeAvailable, "no dtype available"));
	}
	winner
		.widest()
		.ok_or_else(|| ErrPack::new(RuntimeError::NoDTypeAvailable, "no dtype available"))
}

/// Device shared by every tensor-sourced operand.
///
/// Panics when there is no tensor-sourced operand.
#[allow(clippy::panic)]
pub fn resolve_device(operands: &[Operand]) -> RtResult<Device> {
	let mut result: Option<Device> = None;
	for operand in flatten(operands) {
		let device = match operand {
			Operand::Tensor(t) => t.device()?,
			Operand::Array(_, device) => *device,
			_ => continue,
		};
		match result {
			None => result = Some(device),
			Some(first) if first != device => {
				cold_path();
				return Err(ErrPack::new(
					RuntimeError::AmbiguousDevice,
					format!("ambiguous device: {first} vs {device}"),
				));
			},
			Some(_) => {},
		}
	}
	match result {
		Some(device) => Ok(device),
		None => panic!("device resolution needs at least one tensor operand"),
	}
}

//--------------------------------------------------------------------------------------------------

#[cold]
#[inline(never)]
fn empty_input() -> ErrPack<RuntimeError> {
	ErrPack::new(RuntimeError::InvalidArgument, "empty input is not allowed")
}

/// Entry for callers that pass operands straight from user input.
pub fn dtype_promotion(operands: &[Operand]) -> RtResult<DType> {
	if flatten(operands).is_empty() {
		return Err(empty_input());
	}
	resolve_dtype(operands)
}

/// Like `resolve_device`, but rejects empty input and input without any tensor instead
/// of treating it as a bug.
pub fn common_device(operands: &[Operand]) -> RtResult<Device> {
	let flat = flatten(operands);
	if flat.is_empty() {
		return Err(empty_input());
	}
	if !flat.iter().any(Operand::is_tensor_sourced) {
		cold_path();
		return Err(ErrPack::new(RuntimeError::InvalidArgument, "no tensor operand"));
	}
	resolve_device(operands)
}

//--------------------------------------------------------------------------------------------------
