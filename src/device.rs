//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::fmt;

use crate::cold_path;
use crate::error::RtResult;

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
	Cpu,
	Gpu,
}

/// Descriptor of a compute location: kind, device index and stream.
///
/// Displayed as `cpu0`, `gpu1` or `gpu1:2` when a non-default stream is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device {
	pub kind: DeviceKind,
	pub index: u16,
	pub stream: u16,
}

impl Device {
	pub const CPU0: Self = Self::cpu(0);

	pub const fn cpu(index: u16) -> Self {
		Self { kind: DeviceKind::Cpu, index, stream: 0 }
	}

	pub const fn gpu(index: u16) -> Self {
		Self { kind: DeviceKind::Gpu, index, stream: 0 }
	}

	pub const fn with_stream(self, stream: u16) -> Self {
		Self { stream, ..self }
	}

	pub fn is_cpu(&self) -> bool {
		self.kind == DeviceKind::Cpu
	}
}

impl Default for Device {
	fn default() -> Self {
		Self::CPU0
	}
}

impl fmt::Display for Device {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		let kind = match self.kind {
			DeviceKind::Cpu => "cpu",
			DeviceKind::Gpu => "gpu",
		};
		write!(f, "{kind}{}", self.index)?;
		if self.stream != 0 {
			write!(f, ":{}", self.stream)?;
		}
		Ok(())
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct InvalidDeviceError;

impl std::str::FromStr for Device {
	type Err = InvalidDeviceError;

	fn from_str(s: &str) -> Result<Self, InvalidDeviceError> {
		let (kind, rest) = if let Some(rest) = s.strip_prefix("cpu") {
			(DeviceKind::Cpu, rest)
		} else if let Some(rest) = s.strip_prefix("gpu") {
			(DeviceKind::Gpu, rest)
		} else {
			cold_path();
			return Err(InvalidDeviceError);
		};
		let (index, stream) = match rest.split_once(':') {
			Some((index, stream)) => (index, stream.parse().map_err(|_| InvalidDeviceError)?),
			None => (rest, 0),
		};
		let index = index.parse().map_err(|_| InvalidDeviceError)?;
		Ok(Self { kind, index, stream })
	}
}

//--------------------------------------------------------------------------------------------------

/// An execution queue owned by a device, independent of the channel's own queue.
///
/// `Channel::full_sync` waits on every attached queue after the channel itself is drained.
pub trait DeviceQueue: Send + Sync {
	fn device(&self) -> Device;

	fn wait_idle(&self) -> RtResult<()>;
}

//--------------------------------------------------------------------------------------------------
