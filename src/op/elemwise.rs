//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use ndarray::{ArrayD, IxDyn, Zip};

use crate::device::Device;
use crate::dtype::{DType, promote_types};
use crate::error::{RtResult, RuntimeError};
use crate::op::Kernel;
use crate::value::{Element, TensorValue, ValueData};
use crate::{ErrPack, cold_path};

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemwiseMode {
	Add,
	Sub,
	Mul,
	Div,
	Neg,
	Relu,
}

impl ElemwiseMode {
	pub fn arity(self) -> usize {
		match self {
			Self::Add | Self::Sub | Self::Mul | Self::Div => 2,
			Self::Neg | Self::Relu => 1,
		}
	}
}

trait Arith: Element {
	fn add(self, other: Self) -> Self;
	fn sub(self, other: Self) -> Self;
	fn mul(self, other: Self) -> Self;
	fn div(self, other: Self) -> Result<Self, &'static str>;
	fn neg(self) -> Self;
	fn relu(self) -> Self;
}

macro_rules! impl_int_arith {
	($($t:ty),*) => {$(
		impl Arith for $t {
			fn add(self, other: Self) -> Self {
				self.wrapping_add(other)
			}
			fn sub(self, other: Self) -> Self {
				self.wrapping_sub(other)
			}
			fn mul(self, other: Self) -> Self {
				self.wrapping_mul(other)
			}
			fn div(self, other: Self) -> Result<Self, &'static str> {
				if other == 0 {
					return Err("integer division by zero");
				}
				self.checked_div(other).ok_or("integer overflow in division")
			}
			fn neg(self) -> Self {
				self.wrapping_neg()
			}
			fn relu(self) -> Self {
				self.max(0)
			}
		}
	)*};
}

macro_rules! impl_float_arith {
	($($t:ty),*) => {$(
		impl Arith for $t {
			fn add(self, other: Self) -> Self {
				self + other
			}
			fn sub(self, other: Self) -> Self {
				self - other
			}
			fn mul(self, other: Self) -> Self {
				self * other
			}
			fn div(self, other: Self) -> Result<Self, &'static str> {
				Ok(self / other)
			}
			fn neg(self) -> Self {
				-self
			}
			fn relu(self) -> Self {
				if self > 0.0 { self } else { 0.0 }
			}
		}
	)*};
}

impl_int_arith!(u8, i8, i16, i32, i64);
impl_float_arith!(f32, f64);

//--------------------------------------------------------------------------------------------------

fn dim_from_end(dims: &[usize], k: usize) -> usize {
	if k < dims.len() { dims[dims.len() - 1 - k] } else { 1 }
}

/// Numpy-style broadcast of two shapes.
pub fn broadcast_dims(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
	let ndim = a.len().max(b.len());
	let mut dims = vec![0; ndim];
	for k in 0..ndim {
		let da = dim_from_end(a, k);
		let db = dim_from_end(b, k);
		let d = if da == db || db == 1 {
			da
		} else if da == 1 {
			db
		} else {
			cold_path();
			return None;
		};
		dims[ndim - 1 - k] = d;
	}
	Some(dims)
}

fn binary<T: Arith>(
	a: &ArrayD<T>,
	b: &ArrayD<T>,
	mode: ElemwiseMode,
) -> RtResult<ArrayD<T>> {
	let shape_error = || {
		ErrPack::new(
			RuntimeError::ShapeMismatch,
			format!("cannot broadcast {:?} with {:?}", a.shape(), b.shape()),
		)
	};
	let dims = broadcast_dims(a.shape(), b.shape()).ok_or_else(shape_error)?;
	let (Some(a), Some(b)) = (a.broadcast(IxDyn(&dims)), b.broadcast(IxDyn(&dims))) else {
		cold_path();
		return Err(shape_error());
	};
	// first failing element wins
	let mut failure: Option<&'static str> = None;
	let out = Zip::from(&a).and(&b).map_collect(|&x, &y| match mode {
		ElemwiseMode::Add => x.add(y),
		ElemwiseMode::Sub => x.sub(y),
		ElemwiseMode::Mul => x.mul(y),
		_ => x.div(y).unwrap_or_else(|msg| {
			failure.get_or_insert(msg);
			x
		}),
	});
	if let Some(msg) = failure {
		cold_path();
		return Err(ErrPack::new(RuntimeError::ExecutionFailed, msg));
	}
	Ok(out)
}

fn unary<T: Arith>(a: &ArrayD<T>, mode: ElemwiseMode) -> ArrayD<T> {
	match mode {
		ElemwiseMode::Neg => a.mapv(T::neg),
		_ => a.mapv(T::relu),
	}
}

//--------------------------------------------------------------------------------------------------

pub struct Elemwise {
	pub mode: ElemwiseMode,
}

impl Elemwise {
	pub fn new(mode: ElemwiseMode) -> Self {
		Self { mode }
	}

	fn common_device(inputs: &[&TensorValue]) -> RtResult<Device> {
		let mut device = None;
		for inp in inputs {
			match device {
				None => device = Some(inp.device()),
				Some(d) if d != inp.device() => {
					cold_path();
					return Err(ErrPack::new(
						RuntimeError::AmbiguousDevice,
						format!("ambiguous device: {d} vs {}", inp.device()),
					));
				},
				Some(_) => {},
			}
		}
		Ok(device.unwrap_or_default())
	}
}

impl Kernel for Elemwise {
	fn name(&self) -> &str {
		match self.mode {
			ElemwiseMode::Add => "Elemwise(ADD)",
			ElemwiseMode::Sub => "Elemwise(SUB)",
			ElemwiseMode::Mul => "Elemwise(MUL)",
			ElemwiseMode::Div => "Elemwise(TRUE_DIV)",
			ElemwiseMode::Neg => "Elemwise(NEGATE)",
			ElemwiseMode::Relu => "Elemwise(RELU)",
		}
	}

	fn execute(&self, inputs: &[&TensorValue]) -> RtResult<Vec<TensorValue>> {
		let arity = self.mode.arity();
		if inputs.len() != arity {
			cold_path();
			return Err(ErrPack::new(
				RuntimeError::InvalidArgument,
				format!("{} expects {arity} inputs, got {}", self.name(), inputs.len()),
			));
		}
		let device = Self::common_device(inputs)?;
		let dtype = inputs.iter().map(|v| v.dtype()).fold(DType::BOOL, promote_types);
		if dtype == DType::BOOL {
			cold_path();
			return Err(ErrPack::new(
				RuntimeError::UnsupportedDType,
				format!("{} is not defined for bool", self.name()),
			));
		}
		let cast: Vec<ValueData> = inputs.iter().map(|v| v.data().cast(dtype)).collect();
		let data = match cast.as_slice() {
			[a] => match a {
				ValueData::U8(a) => ValueData::U8(unary(a, self.mode)),
				ValueData::I8(a) => ValueData::I8(unary(a, self.mode)),
				ValueData::I16(a) => ValueData::I16(unary(a, self.mode)),
				ValueData::I32(a) => ValueData::I32(unary(a, self.mode)),
				ValueData::I64(a) => ValueData::I64(unary(a, self.mode)),
				ValueData::F32(a) => ValueData::F32(unary(a, self.mode)),
				ValueData::F64(a) => ValueData::F64(unary(a, self.mode)),
				ValueData::Bool(_) => return Err(crate::error::UnsupportedDTypeError.into()),
			},
			[a, b] => match (a, b) {
				(ValueData::U8(a), ValueData::U8(b)) => ValueData::U8(binary(a, b, self.mode)?),
				(ValueData::I8(a), ValueData::I8(b)) => ValueData::I8(binary(a, b, self.mode)?),
				(ValueData::I16(a), ValueData::I16(b)) => ValueData::I16(binary(a, b, self.mode)?),
				(ValueData::I32(a), ValueData::I32(b)) => ValueData::I32(binary(a, b, self.mode)?),
				(ValueData::I64(a), ValueData::I64(b)) => ValueData::I64(binary(a, b, self.mode)?),
				(ValueData::F32(a), ValueData::F32(b)) => ValueData::F32(binary(a, b, self.mode)?),
				(ValueData::F64(a), ValueData::F64(b)) => ValueData::F64(binary(a, b, self.mode)?),
				_ => return Err(crate::error::UnsupportedDTypeError.into()),
			},
			_ => {
				cold_path();
				return Err(ErrPack::new(RuntimeError::InvalidArgument, "bad elemwise arity"));
			},
		};
		Ok(vec![TensorValue::new(data, device)?])
	}
}

//--------------------------------------------------------------------------------------------------

pub struct TypeCvt {
	pub dtype: DType,
}

impl Kernel for TypeCvt {
	fn name(&self) -> &str {
		"TypeCvt"
	}

	fn execute(&self, inputs: &[&TensorValue]) -> RtResult<Vec<TensorValue>> {
		let [inp] = inputs else {
			cold_path();
			return Err(ErrPack::new(RuntimeError::InvalidArgument, "TypeCvt expects 1 input"));
		};
		Ok(vec![inp.cast(self.dtype)])
	}
}

/// Copies the input to another device.
pub struct CopyTo {
	pub device: Device,
}

impl Kernel for CopyTo {
	fn name(&self) -> &str {
		"Copy"
	}

	fn execute(&self, inputs: &[&TensorValue]) -> RtResult<Vec<TensorValue>> {
		let [inp] = inputs else {
			cold_path();
			return Err(ErrPack::new(RuntimeError::InvalidArgument, "Copy expects 1 input"));
		};
		Ok(vec![inp.to_device(self.device)])
	}
}

//--------------------------------------------------------------------------------------------------
