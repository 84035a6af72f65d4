//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::borrow::Cow;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use crate::error::RtResult;
use crate::runtime::Runtime;
use crate::tensor::Tensor;
use crate::value::TensorValue;

pub mod elemwise;

pub use elemwise::{CopyTo, Elemwise, ElemwiseMode, TypeCvt};

//--------------------------------------------------------------------------------------------------

/// Computation executed by the channel worker.
///
/// Kernels travel to the worker thread and may be re-run to regenerate a dropped value,
/// so `execute` must be deterministic and free of side effects.
pub trait Kernel: Send + Sync {
	fn name(&self) -> &str;

	/// Number of outputs produced for `input_count` inputs.
	///
	/// Output handles are allocated before the kernel runs, so this has to be known upfront.
	fn output_count(&self, input_count: usize) -> usize {
		let _ = input_count;
		1
	}

	fn execute(&self, inputs: &[&TensorValue]) -> RtResult<Vec<TensorValue>>;
}

/// What a default rule hands back. Only `Tensor` and sequences of `Tensor` are accepted
/// by the router; anything else is a type error.
pub enum RuleValue {
	Tensor(Tensor),
	Seq(Vec<RuleValue>),
	Scalar(f64),
	None,
}

/// Execution rule attached to a generic operator that has no channel kernel.
pub trait DefaultRule {
	fn call(&self, rt: &Runtime, args: &[Tensor]) -> RtResult<RuleValue>;
}

//--------------------------------------------------------------------------------------------------

pub enum OpClass {
	/// Dispatched to the channel.
	Kernel(Arc<dyn Kernel>),
	/// A kernel that was generated from a backward graph.
	BackwardGraph(Arc<dyn Kernel>),
	/// Executed by its own default rule.
	Generic(Rc<dyn DefaultRule>),
}

pub struct OpDef {
	name: Cow<'static, str>,
	class: OpClass,
}

pub type Op = Rc<OpDef>;

impl OpDef {
	pub fn kernel(kernel: impl Kernel + 'static) -> Op {
		Self::from_kernel(Arc::new(kernel))
	}

	pub fn from_kernel(kernel: Arc<dyn Kernel>) -> Op {
		let name = Cow::Owned(kernel.name().to_string());
		Rc::new(Self { name, class: OpClass::Kernel(kernel) })
	}

	pub fn backward_graph(kernel: impl Kernel + 'static) -> Op {
		let name = Cow::Owned(format!("BackwardGraph({})", kernel.name()));
		Rc::new(Self {
			name,
			class: OpClass::BackwardGraph(Arc::new(kernel)),
		})
	}

	pub fn generic(name: impl Into<Cow<'static, str>>, rule: impl DefaultRule + 'static) -> Op {
		Rc::new(Self {
			name: name.into(),
			class: OpClass::Generic(Rc::new(rule)),
		})
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn class(&self) -> &OpClass {
		&self.class
	}

	pub fn is_backward(&self) -> bool {
		matches!(self.class, OpClass::BackwardGraph(_))
	}

	pub fn default_rule(&self) -> Option<&Rc<dyn DefaultRule>> {
		match &self.class {
			OpClass::Generic(rule) => Some(rule),
			_ => None,
		}
	}

	pub fn kernel_impl(&self) -> Option<&Arc<dyn Kernel>> {
		match &self.class {
			OpClass::Kernel(kernel) | OpClass::BackwardGraph(kernel) => Some(kernel),
			OpClass::Generic(_) => None,
		}
	}
}

impl fmt::Debug for OpDef {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		let class = match self.class {
			OpClass::Kernel(_) => "kernel",
			OpClass::BackwardGraph(_) => "backward",
			OpClass::Generic(_) => "generic",
		};
		write!(f, "OpDef({}, {class})", self.name)
	}
}
