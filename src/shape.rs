//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::fmt;

use arrayvec::ArrayVec;

use crate::cold_path;
use crate::error::TooManyDimsError;

//--------------------------------------------------------------------------------------------------

/// Maximum supported rank.
///
/// Also used by `Channel::put` as the small/large cutover for admitted values.
pub const MAX_NDIM: usize = 7;

#[derive(Clone, PartialEq, Eq, Hash, Default, Debug)]
pub struct Shape {
	dims: ArrayVec<usize, MAX_NDIM>,
}

impl Shape {
	pub fn new(dims: &[usize]) -> Result<Self, TooManyDimsError> {
		let Ok(dims) = ArrayVec::try_from(dims) else {
			cold_path();
			return Err(TooManyDimsError);
		};
		Ok(Self { dims })
	}

	/// The shape of a zero-dimensional value.
	pub fn scalar() -> Self {
		Self { dims: ArrayVec::new() }
	}

	pub fn ndim(&self) -> usize {
		self.dims.len()
	}

	pub fn elems(&self) -> usize {
		self.dims.iter().product()
	}

	pub fn dims(&self) -> &[usize] {
		&self.dims
	}

	pub fn is_scalar(&self) -> bool {
		self.dims.is_empty()
	}
}

impl std::ops::Index<usize> for Shape {
	type Output = usize;

	#[allow(clippy::indexing_slicing)]
	fn index(&self, index: usize) -> &usize {
		&self.dims[index]
	}
}

impl fmt::Display for Shape {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "(")?;
		for (i, dim) in self.dims.iter().enumerate() {
			if i > 0 {
				write!(f, ", ")?;
			}
			write!(f, "{dim}")?;
		}
		if self.dims.len() == 1 {
			write!(f, ",")?;
		}
		write!(f, ")")
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_shape() -> Result<(), TooManyDimsError> {
		let shape = Shape::new(&[2, 3, 4])?;
		assert_eq!(shape.ndim(), 3);
		assert_eq!(shape.elems(), 24);
		assert_eq!(shape[1], 3);
		assert_eq!(shape.to_string(), "(2, 3, 4)");
		assert_eq!(Shape::new(&[5])?.to_string(), "(5,)");
		assert_eq!(Shape::scalar().elems(), 1);
		assert!(Shape::scalar().is_scalar());
		assert_eq!(Shape::new(&[1; MAX_NDIM + 1]), Err(TooManyDimsError));
		Ok(())
	}
}
