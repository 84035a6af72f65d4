//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use smallvec::SmallVec;

use crate::error::RtResult;
use crate::router::ApplyContext;
use crate::runtime::Runtime;
use crate::tensor::Tensor;
use crate::value::TensorValue;

//--------------------------------------------------------------------------------------------------

/// Which kind of trace is being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMode {
	/// Eager execution with recording.
	Traced,
	/// Building a symbolic graph.
	Symbolic,
	/// Replaying a compiled trace.
	Compiled,
}

pub type Outputs = SmallVec<[Tensor; 2]>;

/// Gradient recording. Receives every operation that touches a tensor with the GRAD flag.
pub trait GradTape {
	fn apply_grad(&self, rt: &Runtime, ctx: &ApplyContext) -> RtResult<Outputs>;
}

pub struct ConstArgs {
	pub value: TensorValue,
	pub no_cache: bool,
}

/// Trace recording. Receives operations on TRACE tensors and constants created while
/// tracing is on.
pub trait TraceRecorder {
	fn apply_trace(&self, rt: &Runtime, ctx: &ApplyContext, mode: TraceMode) -> RtResult<Outputs>;

	fn apply_const(&self, rt: &Runtime, args: &ConstArgs, mode: TraceMode) -> RtResult<Outputs>;
}
