//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

//--------------------------------------------------------------------------------------------------

/// Mode bits of a tensor. They select how the router handles operations on it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TensorFlags(u8);

impl TensorFlags {
	pub const NONE: Self = Self(0);
	/// Zero-rank value that was created from a host scalar.
	pub const SCALAR: Self = Self(1);
	/// Participates in gradient recording.
	pub const GRAD: Self = Self(1 << 1);
	/// Participates in trace recording.
	pub const TRACE: Self = Self(1 << 2);

	pub const ALL: Self = Self(Self::SCALAR.0 | Self::GRAD.0 | Self::TRACE.0);

	pub const fn bits(self) -> u8 {
		self.0
	}

	pub const fn from_bits_truncate(bits: u8) -> Self {
		Self(bits & Self::ALL.0)
	}

	pub const fn contains(self, other: Self) -> bool {
		self.0 & other.0 == other.0
	}

	pub const fn intersects(self, other: Self) -> bool {
		self.0 & other.0 != 0
	}

	pub const fn is_empty(self) -> bool {
		self.0 == 0
	}

	pub const fn with(self, other: Self, on: bool) -> Self {
		if on { Self(self.0 | other.0) } else { Self(self.0 & !other.0) }
	}
}

impl BitOr for TensorFlags {
	type Output = Self;

	fn bitor(self, rhs: Self) -> Self {
		Self(self.0 | rhs.0)
	}
}

impl BitOrAssign for TensorFlags {
	fn bitor_assign(&mut self, rhs: Self) {
		self.0 |= rhs.0;
	}
}

impl BitAnd for TensorFlags {
	type Output = Self;

	fn bitand(self, rhs: Self) -> Self {
		Self(self.0 & rhs.0)
	}
}

impl Not for TensorFlags {
	type Output = Self;

	fn not(self) -> Self {
		Self(!self.0 & Self::ALL.0)
	}
}

impl fmt::Debug for TensorFlags {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		if self.is_empty() {
			return write!(f, "NONE");
		}
		let names = [(Self::SCALAR, "SCALAR"), (Self::GRAD, "GRAD"), (Self::TRACE, "TRACE")];
		let mut first = true;
		for (flag, name) in names {
			if self.contains(flag) {
				if !first {
					write!(f, " | ")?;
				}
				write!(f, "{name}")?;
				first = false;
			}
		}
		Ok(())
	}
}

//--------------------------------------------------------------------------------------------------

/// Record of how a tensor was read, kept for the trace recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceInfo {
	pub data_read: bool,
	pub value_read: bool,
	pub shape_read: bool,
	/// Slot assigned by the trace recorder, or -1.
	pub mixin_handle: i64,
}

impl Default for TraceInfo {
	fn default() -> Self {
		Self {
			data_read: false,
			value_read: false,
			shape_read: false,
			mixin_handle: -1,
		}
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_flag_ops() {
		let f = TensorFlags::GRAD | TensorFlags::TRACE;
		assert!(f.contains(TensorFlags::GRAD));
		assert!(!f.contains(TensorFlags::SCALAR));
		assert_eq!(f & !TensorFlags::GRAD, TensorFlags::TRACE);
		assert_eq!(!TensorFlags::NONE, TensorFlags::ALL);
		assert_eq!(f.with(TensorFlags::TRACE, false), TensorFlags::GRAD);
		assert_eq!(format!("{f:?}"), "GRAD | TRACE");
		assert_eq!(format!("{:?}", TensorFlags::NONE), "NONE");
	}
}
