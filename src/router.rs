//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use log::trace;
use smallvec::SmallVec;

use crate::channel::Handle;
use crate::error::{RtResult, RuntimeError};
use crate::op::{Op, RuleValue};
use crate::runtime::Runtime;
use crate::strategy::Outputs;
use crate::tensor::{Tensor, TensorFlags};
use crate::{ErrPack, cold_path};

//--------------------------------------------------------------------------------------------------

/// One operation as the router sees it.
#[derive(Clone)]
pub struct ApplyContext {
	pub op: Op,
	pub args: SmallVec<[Tensor; 4]>,
	/// Union of the operands' flags.
	pub flags: TensorFlags,
	/// The op comes from a backward graph.
	pub backward: bool,
}

impl ApplyContext {
	pub fn new(op: Op, args: impl IntoIterator<Item = Tensor>) -> Self {
		let args: SmallVec<[Tensor; 4]> = args.into_iter().collect();
		let flags = args.iter().fold(TensorFlags::NONE, |acc, t| acc | t.flags());
		let backward = op.is_backward();
		Self { op, args, flags, backward }
	}
}

#[cold]
#[inline(never)]
fn rule_type_error(op: &Op) -> ErrPack<RuntimeError> {
	ErrPack::new(
		RuntimeError::InvalidArgument,
		format!("{}: default rule must return a tensor or a sequence of tensors", op.name()),
	)
}

fn unwrap_rule_value(op: &Op, value: RuleValue) -> RtResult<Outputs> {
	match value {
		RuleValue::Tensor(t) => Ok(smallvec::smallvec![t]),
		RuleValue::Seq(items) => items
			.into_iter()
			.map(|item| match item {
				RuleValue::Tensor(t) => Ok(t),
				_ => Err(rule_type_error(op)),
			})
			.collect(),
		RuleValue::Scalar(_) | RuleValue::None => {
			cold_path();
			Err(rule_type_error(op))
		},
	}
}

#[allow(clippy::panic)]
fn operand_handles(ctx: &ApplyContext) -> SmallVec<[Handle; 4]> {
	ctx.args
		.iter()
		.map(|t| match t.handle() {
			Some(h) => h.get(),
			None => panic!("{}: eager operand {t:?} has no channel handle", ctx.op.name()),
		})
		.collect()
}

impl Runtime {
	/// Routes one operation to the strategy selected by its flags.
	///
	/// In order: the gradient tape for GRAD, the default rule of a generic op, the trace
	/// recorder for TRACE, and finally eager execution on the channel.
	pub fn apply(&self, ctx: &ApplyContext) -> RtResult<Outputs> {
		let flags = ctx.flags & !self.global_disable();

		// SCALAR needs no routing of its own

		if flags.contains(TensorFlags::GRAD) {
			let Some(tape) = self.grad_tape() else {
				cold_path();
				return Err(ErrPack::new(
					RuntimeError::StrategyMissing,
					format!("{}: GRAD operand but no gradient tape is installed", ctx.op.name()),
				));
			};
			trace!("apply {}: grad", ctx.op.name());
			return tape.apply_grad(self, ctx);
		}

		if let Some(rule) = ctx.op.default_rule() {
			trace!("apply {}: default rule", ctx.op.name());
			let args: SmallVec<[Tensor; 4]> = ctx.args.clone();
			let value = rule.clone().call(self, &args)?;
			return unwrap_rule_value(&ctx.op, value);
		}

		if flags.contains(TensorFlags::TRACE) {
			let Some(recorder) = self.trace_recorder() else {
				cold_path();
				return Err(ErrPack::new(
					RuntimeError::StrategyMissing,
					format!("{}: TRACE operand but no trace recorder is installed", ctx.op.name()),
				));
			};
			let mode = self.trace_mode();
			trace!("apply {}: trace ({mode:?})", ctx.op.name());
			return recorder.apply_trace(self, ctx, mode);
		}

		let handles = operand_handles(ctx);
		trace!("apply {}: eager", ctx.op.name());
		let outputs = self.channel().apply_op(&ctx.op, &handles)?;
		Ok(outputs.into_iter().map(|h| self.tensor_from_handle(h)).collect())
	}

	/// Builds the context for `op` on `args` and routes it.
	///
	/// TRACE is added to the operand flags while tracing is on.
	pub fn apply_op(&self, op: &Op, args: &[&Tensor]) -> RtResult<Outputs> {
		if args.is_empty() {
			cold_path();
			return Err(ErrPack::new(
				RuntimeError::InvalidArgument,
				"apply expects one Op and at least one tensor",
			));
		}
		let mut ctx = ApplyContext::new(op.clone(), args.iter().map(|&t| t.clone()));
		if self.is_tracing() {
			ctx.flags |= TensorFlags::TRACE;
		}
		self.apply(&ctx)
	}
}
