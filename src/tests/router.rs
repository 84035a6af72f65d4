//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

#![allow(clippy::unwrap_used)]

use std::rc::Rc;

use assert_approx_eq::assert_approx_eq;

use super::fakes::{EmptyRecorder, Journal, big_f32, runtime, value};
use crate::error::{RtResult, RuntimeError};
use crate::op::{DefaultRule, Elemwise, ElemwiseMode, Op, OpDef, RuleValue};
use crate::router::ApplyContext;
use crate::runtime::Runtime;
use crate::strategy::{GradTape, TraceRecorder};
use crate::tensor::{Tensor, TensorFlags};

//--------------------------------------------------------------------------------------------------

fn add() -> Op {
	OpDef::kernel(Elemwise::new(ElemwiseMode::Add))
}

fn neg() -> Op {
	OpDef::kernel(Elemwise::new(ElemwiseMode::Neg))
}

fn with_journal(rt: &Runtime) -> Rc<Journal> {
	let journal = Rc::new(Journal::default());
	rt.set_grad_tape(Some(journal.clone() as Rc<dyn GradTape>));
	rt.set_trace_recorder(Some(journal.clone() as Rc<dyn TraceRecorder>));
	journal
}

struct FnRule<F>(F);

impl<F: Fn(&Runtime, &[Tensor]) -> RtResult<RuleValue>> DefaultRule for FnRule<F> {
	fn call(&self, rt: &Runtime, args: &[Tensor]) -> RtResult<RuleValue> {
		(self.0)(rt, args)
	}
}

fn generic(f: impl Fn(&Runtime, &[Tensor]) -> RtResult<RuleValue> + 'static) -> Op {
	OpDef::generic("generic", FnRule(f))
}

fn negate_first(rt: &Runtime, args: &[Tensor]) -> RtResult<RuleValue> {
	let out = rt.apply_op(&neg(), &[&args[0]])?;
	Ok(RuleValue::Tensor(out[0].clone()))
}

fn code<T>(r: RtResult<T>) -> Option<RuntimeError> {
	r.err().map(|e| e.code)
}

//--------------------------------------------------------------------------------------------------

#[test]
fn test_eager_apply() -> RtResult<()> {
	let rt = runtime();
	let journal = with_journal(&rt);
	let a = rt.tensor_from_value(big_f32(1.0), false, false)?;
	let out = rt.apply_op(&add(), &[&a, &a])?;
	assert_eq!(out.len(), 1);
	assert_eq!(out[0].flags(), TensorFlags::NONE);
	let v = out[0].value()?.to_vec::<f32>().unwrap();
	assert_approx_eq!(v[0], 2.0, 1e-6);
	assert_approx_eq!(v[15], 32.0, 1e-6);
	assert!(journal.take().is_empty());
	rt.sync()
}

#[test]
fn test_grad_takes_precedence_over_trace() -> RtResult<()> {
	let rt = runtime();
	let journal = with_journal(&rt);
	let a = rt.tensor_from_value(big_f32(0.0), false, false)?;
	a.set_flags(TensorFlags::GRAD | TensorFlags::TRACE);
	let b = rt.tensor_from_value(big_f32(0.0), false, false)?;
	rt.apply_op(&add(), &[&b, &a])?;
	assert_eq!(journal.take(), vec!["grad:Elemwise(ADD)".to_string()]);
	Ok(())
}

#[test]
fn test_trace_mode_follows_runtime_modes() -> RtResult<()> {
	let rt = runtime();
	let journal = with_journal(&rt);
	let a = rt.tensor_from_value(big_f32(0.0), false, false)?;
	a.set_flags(TensorFlags::TRACE);

	rt.apply_op(&neg(), &[&a])?;
	rt.set_symbolic();
	rt.apply_op(&neg(), &[&a])?;
	rt.set_compiled();
	rt.apply_op(&neg(), &[&a])?;
	rt.unset_compiled();
	rt.unset_symbolic();
	rt.apply_op(&neg(), &[&a])?;
	assert_eq!(
		journal.take(),
		vec![
			"trace:Elemwise(NEGATE):Traced".to_string(),
			"trace:Elemwise(NEGATE):Symbolic".to_string(),
			"trace:Elemwise(NEGATE):Compiled".to_string(),
			"trace:Elemwise(NEGATE):Traced".to_string(),
		]
	);
	Ok(())
}

#[test]
fn test_tracing_marks_operands() -> RtResult<()> {
	let rt = runtime();
	let journal = with_journal(&rt);
	let a = rt.tensor_from_value(big_f32(0.0), false, false)?;

	// a context built by hand keeps its own flags
	rt.set_tracing();
	let ctx = ApplyContext::new(neg(), [a.clone()]);
	assert_eq!(ctx.flags, TensorFlags::NONE);
	rt.apply(&ctx)?;
	assert!(journal.take().is_empty());

	rt.apply_op(&neg(), &[&a])?;
	assert_eq!(journal.take(), vec!["trace:Elemwise(NEGATE):Traced".to_string()]);

	rt.reset_modes();
	assert!(!rt.is_tracing());
	rt.apply_op(&neg(), &[&a])?;
	assert!(journal.take().is_empty());
	Ok(())
}

#[test]
fn test_global_disable_masks_flags() -> RtResult<()> {
	let rt = runtime();
	let journal = with_journal(&rt);
	let a = rt.tensor_from_value(big_f32(0.0), false, false)?;
	a.set_flags(TensorFlags::GRAD | TensorFlags::TRACE);

	rt.set_global_disable(TensorFlags::GRAD);
	rt.apply_op(&neg(), &[&a])?;
	rt.set_global_disable(TensorFlags::GRAD | TensorFlags::TRACE);
	let out = rt.apply_op(&neg(), &[&a])?;
	assert_eq!(journal.take(), vec!["trace:Elemwise(NEGATE):Traced".to_string()]);
	assert_approx_eq!(out[0].value()?.to_vec::<f32>().unwrap()[3], -3.0, 1e-6);

	rt.reset_modes();
	assert_eq!(rt.global_disable(), TensorFlags::NONE);
	Ok(())
}

#[test]
fn test_missing_strategy() -> RtResult<()> {
	let rt = runtime();
	let a = rt.tensor_from_value(big_f32(0.0), false, false)?;
	a.set_flags(TensorFlags::GRAD);
	assert_eq!(code(rt.apply_op(&neg(), &[&a])), Some(RuntimeError::StrategyMissing));
	a.set_flags(TensorFlags::TRACE);
	assert_eq!(code(rt.apply_op(&neg(), &[&a])), Some(RuntimeError::StrategyMissing));
	Ok(())
}

//--------------------------------------------------------------------------------------------------

#[test]
fn test_generic_rule() -> RtResult<()> {
	let rt = runtime();
	let journal = with_journal(&rt);
	let a = rt.tensor_from_value(value(&[2], vec![1_i32, -2]), false, false)?;

	let out = rt.apply_op(&generic(negate_first), &[&a])?;
	assert_eq!(out[0].value()?.to_vec::<i32>(), Some(vec![-1, 2]));

	let pair = generic(|_rt, args| {
		Ok(RuleValue::Seq(vec![RuleValue::Tensor(args[0].clone()), RuleValue::Tensor(args[0].clone())]))
	});
	let out = rt.apply_op(&pair, &[&a])?;
	assert_eq!(out.len(), 2);
	assert!(Tensor::ptr_eq(&out[0], &a));
	assert!(journal.take().is_empty());
	Ok(())
}

#[test]
fn test_generic_rule_comes_before_trace() -> RtResult<()> {
	let rt = runtime();
	let journal = with_journal(&rt);
	let a = rt.tensor_from_value(value(&[2], vec![1_i32, 2]), false, false)?;
	let b = rt.tensor_from_value(value(&[2], vec![3_i32, 4]), false, false)?;
	a.set_flags(TensorFlags::TRACE);

	let first = generic(|_rt, args| Ok(RuleValue::Tensor(args[1].clone())));
	let out = rt.apply_op(&first, &[&a, &b])?;
	assert!(Tensor::ptr_eq(&out[0], &b));
	assert!(journal.take().is_empty());

	a.set_flags(TensorFlags::GRAD | TensorFlags::TRACE);
	rt.apply_op(&first, &[&a, &b])?;
	assert_eq!(journal.take(), vec!["grad:generic".to_string()]);
	Ok(())
}

#[test]
fn test_generic_rule_bad_return_is_type_error() -> RtResult<()> {
	let rt = runtime();
	let a = rt.tensor_from_value(value(&[1], vec![1.0_f32]), false, false)?;
	let scalar = generic(|_rt, _args| Ok(RuleValue::Scalar(1.0)));
	let err = rt.apply_op(&scalar, &[&a]).err().unwrap();
	assert_eq!(err.code, RuntimeError::InvalidArgument);
	assert!(err.message().contains("tensor or a sequence of tensors"));

	let nothing = generic(|_rt, _args| Ok(RuleValue::None));
	assert_eq!(code(rt.apply_op(&nothing, &[&a])), Some(RuntimeError::InvalidArgument));

	let mixed = generic(|_rt, args| Ok(RuleValue::Seq(vec![RuleValue::Tensor(args[0].clone()), RuleValue::None])));
	assert_eq!(code(rt.apply_op(&mixed, &[&a])), Some(RuntimeError::InvalidArgument));
	Ok(())
}

//--------------------------------------------------------------------------------------------------

#[test]
fn test_apply_op_needs_a_tensor() {
	let rt = runtime();
	let err = rt.apply_op(&neg(), &[]).err().unwrap();
	assert_eq!(err.code, RuntimeError::InvalidArgument);
	assert!(err.message().contains("at least one tensor"));
}

#[test]
fn test_backward_graph_op() -> RtResult<()> {
	let rt = runtime();
	let op = OpDef::backward_graph(Elemwise::new(ElemwiseMode::Neg));
	assert!(op.is_backward());
	let a = rt.tensor_from_value(value(&[3], vec![1_i16, 2, 3]), false, false)?;
	let ctx = ApplyContext::new(op, [a]);
	assert!(ctx.backward);
	let out = rt.apply(&ctx)?;
	assert_eq!(out[0].value()?.to_vec::<i16>(), Some(vec![-1, -2, -3]));
	Ok(())
}

#[test]
fn test_scalar_flag_is_inert() -> RtResult<()> {
	let rt = runtime();
	let journal = with_journal(&rt);
	let s = rt.tensor_from_value(crate::TensorValue::scalar(2.5_f32, crate::Device::CPU0), false, false)?;
	assert!(s.is_scalar());
	let out = rt.apply_op(&neg(), &[&s])?;
	assert!(!out[0].is_scalar());
	assert_eq!(out[0].value()?.item::<f32>(), Some(-2.5));
	assert!(journal.take().is_empty());
	Ok(())
}

#[test]
#[should_panic(expected = "has no channel handle")]
fn test_eager_operand_without_handle_panics() {
	let rt = runtime();
	let empty = rt.empty_tensor();
	let _ = rt.apply_op(&neg(), &[&empty]);
}

//--------------------------------------------------------------------------------------------------

#[test]
fn test_const_under_tracing_goes_to_recorder() -> RtResult<()> {
	let rt = runtime();
	let journal = with_journal(&rt);

	let plain = rt.tensor_from_value(value(&[2], vec![1_u8, 2]), true, false)?;
	assert!(journal.take().is_empty());

	rt.set_tracing();
	let traced = rt.tensor_from_value(value(&[2], vec![1_u8, 2]), true, false)?;
	rt.set_compiled();
	let _compiled = rt.tensor_from_value(value(&[2], vec![1_u8, 2]), true, false)?;
	let _not_const = rt.tensor_from_value(value(&[2], vec![1_u8, 2]), false, false)?;
	assert_eq!(journal.take(), vec!["const:Traced".to_string(), "const:Compiled".to_string()]);
	assert_eq!(traced.value()?, plain.value()?);

	rt.set_trace_recorder(Some(Rc::new(EmptyRecorder)));
	let err = rt.tensor_from_value(value(&[1], vec![1_u8]), true, false).err().unwrap();
	assert_eq!(err.code, RuntimeError::InvalidArgument);
	Ok(())
}
