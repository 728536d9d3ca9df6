//! Parallel groups: the ordered set of devices a tensor or operator is
//! distributed over, and their serialized `ParallelConf` form.
//!
//! A conf names devices as `"machine:device"` or as an inclusive range
//! `"machine:first-last"`, so `("gpu", ["0:0-3"])` is four GPUs on machine 0.

use std::collections::HashSet;
use std::fmt;

use crate::error::{Result, TensorError};

/// Kind of device a parallel group runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

impl DeviceKind {
    /// Lower-case tag used in parallel confs, `"cpu"` or `"gpu"`.
    pub fn tag(&self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Gpu => "gpu",
        }
    }

    pub fn from_tag(tag: &str) -> Result<DeviceKind> {
        match tag {
            "cpu" => Ok(DeviceKind::Cpu),
            "gpu" => Ok(DeviceKind::Gpu),
            other => Err(TensorError::InvalidParallelConf(format!(
                "unknown device tag '{}'",
                other
            ))),
        }
    }
}

/// A device, identified by machine and local device index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    pub machine: u32,
    pub device: u32,
}

impl DeviceId {
    pub fn new(machine: u32, device: u32) -> Self {
        DeviceId { machine, device }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.machine, self.device)
    }
}

/// Serialized form of a [`ParallelGroup`] handed to the execution layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParallelConf {
    pub device_tag: String,
    pub device_names: Vec<String>,
}

impl fmt::Display for ParallelConf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.device_tag, self.device_names.join(", "))
    }
}

/// An ordered, non-empty set of unique devices.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParallelGroup {
    kind: DeviceKind,
    devices: Vec<DeviceId>,
}

impl ParallelGroup {
    /// Create a group, rejecting empty device lists and repeated devices.
    pub fn new(kind: DeviceKind, devices: Vec<DeviceId>) -> Result<Self> {
        if devices.is_empty() {
            return Err(TensorError::InvalidParallelGroup(
                "group must contain at least one device".to_string(),
            ));
        }
        let mut seen = HashSet::with_capacity(devices.len());
        for d in &devices {
            if !seen.insert(*d) {
                return Err(TensorError::InvalidParallelGroup(format!(
                    "device {} listed more than once",
                    d
                )));
            }
        }
        Ok(ParallelGroup { kind, devices })
    }

    /// Devices `0..n` on machine 0.
    pub fn local(kind: DeviceKind, n: u32) -> Result<Self> {
        Self::new(kind, (0..n).map(|d| DeviceId::new(0, d)).collect())
    }

    /// Device 0 on machine 0.
    pub fn single(kind: DeviceKind) -> Self {
        ParallelGroup {
            kind,
            devices: vec![DeviceId::new(0, 0)],
        }
    }

    /// Parse a group from a device tag and device names such as `"0:0-3"`.
    pub fn parse(device_tag: &str, device_names: &[&str]) -> Result<Self> {
        let kind = DeviceKind::from_tag(device_tag)?;
        let mut devices = Vec::new();
        for name in device_names {
            devices.extend(parse_device_name(name)?);
        }
        Self::new(kind, devices)
    }

    /// Rebuild a group from its serialized form, see [`ParallelGroup::parse`].
    pub fn from_conf(conf: &ParallelConf) -> Result<Self> {
        let names: Vec<&str> = conf.device_names.iter().map(String::as_str).collect();
        Self::parse(&conf.device_tag, &names)
    }

    /// Serialize, compressing runs of consecutive devices on one machine into
    /// ranges.
    pub fn to_conf(&self) -> ParallelConf {
        let mut device_names = Vec::new();
        let mut run: Option<(u32, u32, u32)> = None;
        for d in &self.devices {
            run = match run {
                Some((m, first, last)) if m == d.machine && d.device == last + 1 => {
                    Some((m, first, d.device))
                }
                Some(prev) => {
                    device_names.push(format_run(prev));
                    Some((d.machine, d.device, d.device))
                }
                None => Some((d.machine, d.device, d.device)),
            };
        }
        if let Some(prev) = run {
            device_names.push(format_run(prev));
        }
        ParallelConf {
            device_tag: self.kind.tag().to_string(),
            device_names,
        }
    }

    /// Device kind shared by every member.
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Members in group order. A device's position is its shard index.
    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    /// Number of devices in the group.
    pub fn parallel_num(&self) -> usize {
        self.devices.len()
    }

    pub fn device(&self, index: usize) -> Option<DeviceId> {
        self.devices.get(index).copied()
    }

    pub fn index_of(&self, device: DeviceId) -> Option<usize> {
        self.devices.iter().position(|d| *d == device)
    }

    pub fn contains(&self, device: DeviceId) -> bool {
        self.devices.contains(&device)
    }

    /// True if every device of `self` is in `other` and both share a kind.
    pub fn is_subset_of(&self, other: &ParallelGroup) -> bool {
        self.kind == other.kind && self.devices.iter().all(|d| other.contains(*d))
    }
}

fn format_run((machine, first, last): (u32, u32, u32)) -> String {
    if first == last {
        format!("{}:{}", machine, first)
    } else {
        format!("{}:{}-{}", machine, first, last)
    }
}

fn parse_device_name(name: &str) -> Result<Vec<DeviceId>> {
    let bad = || TensorError::InvalidParallelConf(format!("bad device name '{}'", name));
    let (machine, devices) = name.split_once(':').ok_or_else(bad)?;
    let machine: u32 = machine.trim().parse().map_err(|_| bad())?;
    let (first, last) = match devices.split_once('-') {
        Some((a, b)) => (
            a.trim().parse::<u32>().map_err(|_| bad())?,
            b.trim().parse::<u32>().map_err(|_| bad())?,
        ),
        None => {
            let d = devices.trim().parse::<u32>().map_err(|_| bad())?;
            (d, d)
        }
    };
    if first > last {
        return Err(bad());
    }
    Ok((first..=last).map(|d| DeviceId::new(machine, d)).collect())
}
