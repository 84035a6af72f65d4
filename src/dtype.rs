//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::fmt;
use std::num::NonZeroU8;

use crate::cold_path;

//--------------------------------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct DType {
	kind: DTypeKind,
	bits: NonZeroU8,
	id: DTypeId,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum DTypeKind {
	Bool,
	Int,
	Uint,
	Float,
}

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum DTypeId {
	Bool = 1,
	U8 = 2,
	I8 = 3,
	I16 = 4,
	I32 = 5,
	I64 = 6,
	F32 = 7,
	F64 = 8,
}

/// Promotion category. Higher wins.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum Category {
	Other = 0,
	Bool = 1,
	Integer = 2,
	Floating = 3,
}

const fn make(kind: DTypeKind, bits: u8, id: DTypeId) -> DType {
	match NonZeroU8::new(bits) {
		Some(bits) => DType { kind, bits, id },
		None => panic!("dtype with zero bits"),
	}
}

impl DType {
	pub const BOOL: Self = make(DTypeKind::Bool, 8, DTypeId::Bool);
	pub const U8: Self = make(DTypeKind::Uint, 8, DTypeId::U8);
	pub const I8: Self = make(DTypeKind::Int, 8, DTypeId::I8);
	pub const I16: Self = make(DTypeKind::Int, 16, DTypeId::I16);
	pub const I32: Self = make(DTypeKind::Int, 32, DTypeId::I32);
	pub const I64: Self = make(DTypeKind::Int, 64, DTypeId::I64);
	pub const F32: Self = make(DTypeKind::Float, 32, DTypeId::F32);
	pub const F64: Self = make(DTypeKind::Float, 64, DTypeId::F64);

	pub const ALL: [Self; 8] = [
		Self::BOOL,
		Self::U8,
		Self::I8,
		Self::I16,
		Self::I32,
		Self::I64,
		Self::F32,
		Self::F64,
	];

	pub fn id(self) -> DTypeId {
		self.id
	}

	pub fn kind(self) -> DTypeKind {
		self.kind
	}

	pub fn bits(self) -> usize {
		usize::from(self.bits.get())
	}

	pub fn bytes(self) -> usize {
		self.bits() / 8
	}

	pub fn is_float(self) -> bool {
		self.kind == DTypeKind::Float
	}

	pub fn category(self) -> Category {
		match self.kind {
			DTypeKind::Float => Category::Floating,
			DTypeKind::Int | DTypeKind::Uint => Category::Integer,
			DTypeKind::Bool => Category::Bool,
		}
	}

	fn signed_with_bits(bits: usize) -> Option<Self> {
		Self::ALL.into_iter().find(|d| d.kind == DTypeKind::Int && d.bits() >= bits)
	}
}

/// Smallest dtype that can represent every value of both `a` and `b`.
///
/// Follows the usual host numeric rules:
/// - same kind: the wider one
/// - signed vs unsigned: a signed type wide enough for the unsigned one, falling back to `f64`
/// - anything vs bool: the other one
/// - int vs float: the float, widened to `f64` if it cannot represent the int exactly
pub fn promote_types(a: DType, b: DType) -> DType {
	if a == b {
		return a;
	}
	match (a.kind, b.kind) {
		(x, y) if x == y => {
			if a.bits >= b.bits {
				a
			} else {
				b
			}
		},
		(DTypeKind::Bool, _) => b,
		(_, DTypeKind::Bool) => a,
		(DTypeKind::Int, DTypeKind::Uint) => promote_mixed_sign(a, b),
		(DTypeKind::Uint, DTypeKind::Int) => promote_mixed_sign(b, a),
		(DTypeKind::Float, _) => promote_float_int(a, b),
		(_, DTypeKind::Float) => promote_float_int(b, a),
		_ => {
			cold_path();
			DType::F64
		},
	}
}

fn promote_mixed_sign(signed: DType, unsigned: DType) -> DType {
	if signed.bits() > unsigned.bits() {
		return signed;
	}
	DType::signed_with_bits(unsigned.bits() * 2).unwrap_or(DType::F64)
}

fn promote_float_int(float: DType, int: DType) -> DType {
	// f32 holds integers up to 16 bits exactly
	if float.bits() >= 64 || int.bits() <= 16 { float } else { DType::F64 }
}

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct UnknownDTypeError;

impl std::str::FromStr for DType {
	type Err = UnknownDTypeError;

	fn from_str(s: &str) -> Result<Self, UnknownDTypeError> {
		match s {
			"bool" => Ok(Self::BOOL),
			"uint8" | "u8" => Ok(Self::U8),
			"int8" | "i8" => Ok(Self::I8),
			"int16" | "i16" => Ok(Self::I16),
			"int32" | "i32" => Ok(Self::I32),
			"int64" | "i64" => Ok(Self::I64),
			"float32" | "f32" => Ok(Self::F32),
			"float64" | "f64" => Ok(Self::F64),
			_ => {
				cold_path();
				Err(UnknownDTypeError)
			},
		}
	}
}

impl fmt::Display for DType {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		let kind = match self.kind {
			DTypeKind::Bool => return write!(f, "bool"),
			DTypeKind::Float => "float",
			DTypeKind::Int => "int",
			DTypeKind::Uint => "uint",
		};
		write!(f, "{}{}", kind, self.bits)
	}
}

//--------------------------------------------------------------------------------------------------
