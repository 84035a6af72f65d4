//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::borrow::Cow;
use std::sync::Arc;

use crate::{ErrExtra, ErrPack};

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RuntimeError {
	/// Wrong arity, wrong kind of argument, wrong return value of a rule.
	InvalidArgument,
	NoDTypeAvailable,
	AmbiguousDevice,
	/// The tensor has neither a live handle nor an inferable graph value.
	InvalidTensor,
	/// The value was discarded by `drop` and cannot be regenerated.
	ValueUnavailable,
	InvalidHandle,
	ExecutionFailed,
	UnsupportedDType,
	ShapeMismatch,
	TooManyDims,
	StrategyMissing,
	ChannelClosed,
}

pub type RtResult<T> = Result<T, ErrPack<RuntimeError>>;

impl ErrPack<RuntimeError> {
	#[cold]
	#[inline(never)]
	pub fn new(code: RuntimeError, message: impl Into<Cow<'static, str>>) -> Self {
		Self {
			code,
			extra: Some(Box::new(ErrExtra { message: message.into(), nested: None })),
		}
	}

	pub fn message(&self) -> &str {
		match &self.extra {
			Some(extra) => extra.message.as_ref(),
			None => "",
		}
	}

	/// Builds a fresh error carrying the code and message of `original`.
	///
	/// The original is kept as the nested error, so every consumer of a poisoned handle
	/// sees the same root cause.
	#[cold]
	#[inline(never)]
	pub fn reraise(original: &Arc<Self>) -> Self {
		Self {
			code: original.code,
			extra: Some(Box::new(ErrExtra {
				message: Cow::Owned(original.message().to_string()),
				nested: Some(Box::new(original.clone())),
			})),
		}
	}
}

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct InvalidHandleError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ShapeMismatchError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct UnsupportedDTypeError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct TooManyDimsError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ChannelClosedError;

impl From<InvalidHandleError> for ErrPack<RuntimeError> {
	fn from(_: InvalidHandleError) -> Self {
		Self::new(RuntimeError::InvalidHandle, "handle does not refer to a live channel entry")
	}
}

impl From<ShapeMismatchError> for ErrPack<RuntimeError> {
	fn from(_: ShapeMismatchError) -> Self {
		Self {
			code: RuntimeError::ShapeMismatch,
			extra: None,
		}
	}
}

impl From<UnsupportedDTypeError> for ErrPack<RuntimeError> {
	fn from(_: UnsupportedDTypeError) -> Self {
		Self {
			code: RuntimeError::UnsupportedDType,
			extra: None,
		}
	}
}

impl From<TooManyDimsError> for ErrPack<RuntimeError> {
	fn from(_: TooManyDimsError) -> Self {
		Self {
			code: RuntimeError::TooManyDims,
			extra: None,
		}
	}
}

impl From<ChannelClosedError> for ErrPack<RuntimeError> {
	fn from(_: ChannelClosedError) -> Self {
		Self::new(RuntimeError::ChannelClosed, "the channel worker is no longer running")
	}
}

//--------------------------------------------------------------------------------------------------
