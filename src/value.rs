//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use ndarray::{ArrayD, IxDyn};

use crate::device::Device;
use crate::dtype::{DType, DTypeId};
use crate::error::{RtResult, RuntimeError, ShapeMismatchError, TooManyDimsError};
use crate::shape::{MAX_NDIM, Shape};
use crate::{ErrPack, cold_path};

//--------------------------------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub enum ValueData {
	Bool(ArrayD<bool>),
	U8(ArrayD<u8>),
	I8(ArrayD<i8>),
	I16(ArrayD<i16>),
	I32(ArrayD<i32>),
	I64(ArrayD<i64>),
	F32(ArrayD<f32>),
	F64(ArrayD<f64>),
}

/// Applies `$body` to the array inside `$data`, whatever its element type is.
/// The body must evaluate to the same type for every variant.
macro_rules! with_array {
	($data:expr, $arr:ident => $body:expr) => {
		match $data {
			ValueData::Bool($arr) => $body,
			ValueData::U8($arr) => $body,
			ValueData::I8($arr) => $body,
			ValueData::I16($arr) => $body,
			ValueData::I32($arr) => $body,
			ValueData::I64($arr) => $body,
			ValueData::F32($arr) => $body,
			ValueData::F64($arr) => $body,
		}
	};
}

pub(crate) use with_array;

impl ValueData {
	pub fn dtype(&self) -> DType {
		match self {
			Self::Bool(_) => DType::BOOL,
			Self::U8(_) => DType::U8,
			Self::I8(_) => DType::I8,
			Self::I16(_) => DType::I16,
			Self::I32(_) => DType::I32,
			Self::I64(_) => DType::I64,
			Self::F32(_) => DType::F32,
			Self::F64(_) => DType::F64,
		}
	}

	pub fn dims(&self) -> &[usize] {
		with_array!(self, a => a.shape())
	}

	fn reshaped(&self, dims: &[usize]) -> Result<Self, ShapeMismatchError> {
		fn go<T: Element>(a: &ArrayD<T>, dims: &[usize]) -> Result<ValueData, ShapeMismatchError> {
			let items = a.iter().copied().collect();
			ArrayD::from_shape_vec(IxDyn(dims), items)
				.map(T::wrap)
				.map_err(|_| ShapeMismatchError)
		}
		with_array!(self, a => go(a, dims))
	}

	pub fn cast(&self, dtype: DType) -> Self {
		if self.dtype() == dtype {
			return self.clone();
		}
		let via_float = self.dtype().is_float() || dtype.is_float();
		with_array!(self, a => convert(a, dtype, via_float))
	}
}

//--------------------------------------------------------------------------------------------------

pub trait Element: Copy + Send + Sync + PartialEq + std::fmt::Debug + 'static {
	const DTYPE: DType;

	fn wrap(array: ArrayD<Self>) -> ValueData;
	fn unwrap(data: &ValueData) -> Option<&ArrayD<Self>>;

	fn to_f64(self) -> f64;
	fn from_f64(v: f64) -> Self;
	fn to_i64(self) -> i64;
	fn from_i64(v: i64) -> Self;
}

macro_rules! impl_element {
	($t:ty, $variant:ident) => {
		#[allow(clippy::cast_possible_truncation)]
		#[allow(clippy::cast_precision_loss)]
		#[allow(clippy::cast_sign_loss)]
		#[allow(clippy::cast_possible_wrap)]
		#[allow(clippy::cast_lossless)]
		impl Element for $t {
			const DTYPE: DType = DType::$variant;

			fn wrap(array: ArrayD<Self>) -> ValueData {
				ValueData::$variant(array)
			}

			fn unwrap(data: &ValueData) -> Option<&ArrayD<Self>> {
				match data {
					ValueData::$variant(a) => Some(a),
					_ => None,
				}
			}

			fn to_f64(self) -> f64 {
				self as f64
			}

			fn from_f64(v: f64) -> Self {
				v as $t
			}

			fn to_i64(self) -> i64 {
				self as i64
			}

			fn from_i64(v: i64) -> Self {
				v as $t
			}
		}
	};
}

impl_element!(u8, U8);
impl_element!(i8, I8);
impl_element!(i16, I16);
impl_element!(i32, I32);
impl_element!(i64, I64);
impl_element!(f32, F32);
impl_element!(f64, F64);

impl Element for bool {
	const DTYPE: DType = DType::BOOL;

	fn wrap(array: ArrayD<Self>) -> ValueData {
		ValueData::Bool(array)
	}

	fn unwrap(data: &ValueData) -> Option<&ArrayD<Self>> {
		match data {
			ValueData::Bool(a) => Some(a),
			_ => None,
		}
	}

	fn to_f64(self) -> f64 {
		if self { 1.0 } else { 0.0 }
	}

	fn from_f64(v: f64) -> Self {
		v != 0.0
	}

	fn to_i64(self) -> i64 {
		i64::from(self)
	}

	fn from_i64(v: i64) -> Self {
		v != 0
	}
}

fn convert_elem<S: Element, D: Element>(x: S, via_float: bool) -> D {
	if via_float { D::from_f64(x.to_f64()) } else { D::from_i64(x.to_i64()) }
}

fn convert<S: Element>(a: &ArrayD<S>, dtype: DType, via_float: bool) -> ValueData {
	match dtype.id() {
		DTypeId::Bool => ValueData::Bool(a.mapv(|x| convert_elem(x, via_float))),
		DTypeId::U8 => ValueData::U8(a.mapv(|x| convert_elem(x, via_float))),
		DTypeId::I8 => ValueData::I8(a.mapv(|x| convert_elem(x, via_float))),
		DTypeId::I16 => ValueData::I16(a.mapv(|x| convert_elem(x, via_float))),
		DTypeId::I32 => ValueData::I32(a.mapv(|x| convert_elem(x, via_float))),
		DTypeId::I64 => ValueData::I64(a.mapv(|x| convert_elem(x, via_float))),
		DTypeId::F32 => ValueData::F32(a.mapv(|x| convert_elem(x, via_float))),
		DTypeId::F64 => ValueData::F64(a.mapv(|x| convert_elem(x, via_float))),
	}
}

//--------------------------------------------------------------------------------------------------

/// A resolved tensor value: host-side data, its layout, and the device it belongs to.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorValue {
	data: ValueData,
	shape: Shape,
	device: Device,
}

impl TensorValue {
	pub fn new(data: ValueData, device: Device) -> RtResult<Self> {
		let Ok(shape) = Shape::new(data.dims()) else {
			cold_path();
			return Err(TooManyDimsError.into());
		};
		Ok(Self { data, shape, device })
	}

	pub fn from_vec<T: Element>(dims: &[usize], items: Vec<T>, device: Device) -> RtResult<Self> {
		if dims.len() > MAX_NDIM {
			cold_path();
			return Err(TooManyDimsError.into());
		}
		let elems: usize = dims.iter().product();
		if elems != items.len() {
			cold_path();
			return Err(ErrPack::new(
				RuntimeError::ShapeMismatch,
				format!("shape {dims:?} needs {elems} elements, got {}", items.len()),
			));
		}
		let array = ArrayD::from_shape_vec(IxDyn(dims), items).map_err(|_| ShapeMismatchError)?;
		Self::new(T::wrap(array), device)
	}

	pub fn scalar<T: Element>(value: T, device: Device) -> Self {
		Self {
			data: T::wrap(ArrayD::from_elem(IxDyn(&[]), value)),
			shape: Shape::scalar(),
			device,
		}
	}

	pub fn dtype(&self) -> DType {
		self.data.dtype()
	}

	pub fn shape(&self) -> &Shape {
		&self.shape
	}

	pub fn ndim(&self) -> usize {
		self.shape.ndim()
	}

	pub fn elems(&self) -> usize {
		self.shape.elems()
	}

	pub fn device(&self) -> Device {
		self.device
	}

	pub fn data(&self) -> &ValueData {
		&self.data
	}

	pub fn as_array<T: Element>(&self) -> Option<&ArrayD<T>> {
		T::unwrap(&self.data)
	}

	/// Elements in row-major order, if the dtype is `T`.
	pub fn to_vec<T: Element>(&self) -> Option<Vec<T>> {
		self.as_array::<T>().map(|a| a.iter().copied().collect())
	}

	pub fn item<T: Element>(&self) -> Option<T> {
		let a = self.as_array::<T>()?;
		if a.len() == 1 { a.iter().next().copied() } else { None }
	}

	pub fn cast(&self, dtype: DType) -> Self {
		Self {
			data: self.data.cast(dtype),
			shape: self.shape.clone(),
			device: self.device,
		}
	}

	pub fn to_device(&self, device: Device) -> Self {
		Self { device, ..self.clone() }
	}

	/// Removes every dimension of size one.
	pub fn squeeze(&self) -> RtResult<Self> {
		let dims: Vec<usize> = self.shape.dims().iter().copied().filter(|&d| d != 1).collect();
		if dims.len() == self.ndim() {
			return Ok(self.clone());
		}
		let data = self.data.reshaped(&dims)?;
		Self::new(data, self.device)
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use assert_approx_eq::assert_approx_eq;

	use super::*;

	#[test]
	fn test_from_vec() -> RtResult<()> {
		let v = TensorValue::from_vec(&[2, 2], vec![1.0_f32, 2.0, 3.0, 4.0], Device::CPU0)?;
		assert_eq!(v.dtype(), DType::F32);
		assert_eq!(v.shape().dims(), &[2, 2]);
		assert_eq!(v.to_vec::<f32>(), Some(vec![1.0, 2.0, 3.0, 4.0]));
		assert_eq!(v.to_vec::<i32>(), None);

		let err = TensorValue::from_vec(&[3], vec![1_i32, 2], Device::CPU0);
		assert_eq!(err.err().map(|e| e.code), Some(RuntimeError::ShapeMismatch));
		Ok(())
	}

	#[test]
	fn test_cast() -> RtResult<()> {
		let v = TensorValue::from_vec(&[3], vec![1.7_f64, -2.2, 0.0], Device::CPU0)?;
		let i = v.cast(DType::I32);
		assert_eq!(i.to_vec::<i32>(), Some(vec![1, -2, 0]));
		let b = v.cast(DType::BOOL);
		assert_eq!(b.to_vec::<bool>(), Some(vec![true, true, false]));
		let f = i.cast(DType::F32);
		let f = f.to_vec::<f32>().unwrap();
		assert_approx_eq!(f[0], 1.0, 1e-6);
		assert_approx_eq!(f[1], -2.0, 1e-6);
		let big = TensorValue::scalar(300_i32, Device::CPU0).cast(DType::I64);
		assert_eq!(big.item::<i64>(), Some(300));
		Ok(())
	}

	#[test]
	fn test_squeeze() -> RtResult<()> {
		let v = TensorValue::from_vec(&[1, 3, 1], vec![1_u8, 2, 3], Device::CPU0)?;
		let s = v.squeeze()?;
		assert_eq!(s.shape().dims(), &[3]);
		assert_eq!(s.to_vec::<u8>(), Some(vec![1, 2, 3]));
		let one = TensorValue::from_vec(&[1, 1], vec![7_i16], Device::CPU0)?;
		let s = one.squeeze()?;
		assert!(s.shape().is_scalar());
		assert_eq!(s.item::<i16>(), Some(7));
		Ok(())
	}
}
