//! Machine classes and the machine catalog.
//!
//! A [`MachineClass`] names a hardware profile. The [`MachineCatalog`] is the
//! immutable registry of known classes with their cost and fleet-capacity
//! attributes; it is built once and shared read-only (typically behind an
//! `Arc`) by every component that needs to validate a class.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Identifier of a hardware profile, e.g. `CPU-4` or `A10G`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineClass(Cow<'static, str>);

impl MachineClass {
    /// 4 vCPU, no accelerator. The baseline class for a fresh studio.
    pub const CPU_4: Self = Self(Cow::Borrowed("CPU-4"));
    /// 8 vCPU, no accelerator.
    pub const CPU_8: Self = Self(Cow::Borrowed("CPU-8"));
    /// High-memory CPU machine for data preparation.
    pub const DATA_PREP: Self = Self(Cow::Borrowed("DATA_PREP"));
    /// Single NVIDIA T4.
    pub const T4: Self = Self(Cow::Borrowed("T4"));
    /// Four NVIDIA T4.
    pub const T4_X_4: Self = Self(Cow::Borrowed("T4_X_4"));
    /// Single NVIDIA L4.
    pub const L4: Self = Self(Cow::Borrowed("L4"));
    /// Single NVIDIA A10G.
    pub const A10G: Self = Self(Cow::Borrowed("A10G"));
    /// Four NVIDIA A10G.
    pub const A10G_X_4: Self = Self(Cow::Borrowed("A10G_X_4"));
    /// Eight NVIDIA A100.
    pub const A100_X_8: Self = Self(Cow::Borrowed("A100_X_8"));
    /// Eight NVIDIA H100.
    pub const H100_X_8: Self = Self(Cow::Borrowed("H100_X_8"));

    /// Build a class from an arbitrary name (e.g. one reported by the backend).
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// The class name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MachineClass {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Hardware, cost and availability attributes of a machine class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    /// The class this spec describes.
    pub class: MachineClass,
    /// Virtual CPUs.
    pub cpus: u32,
    /// Memory in gigabytes.
    pub memory_gb: u32,
    /// Number of accelerators.
    pub gpus: u32,
    /// Accelerator model, if any.
    pub gpu_model: Option<String>,
    /// Cost per machine-hour in US cents.
    pub cost_cents_per_hour: u32,
    /// Number of machines of this class the fleet can hold at once.
    pub capacity: u32,
}

impl MachineSpec {
    /// True if the class carries accelerators.
    #[must_use]
    pub const fn is_gpu(&self) -> bool {
        self.gpus > 0
    }
}

/// Immutable registry of machine classes.
#[derive(Debug, Clone, Default)]
pub struct MachineCatalog {
    specs: BTreeMap<MachineClass, MachineSpec>,
}

impl MachineCatalog {
    /// Build a catalog from a list of specs. Later duplicates replace earlier ones.
    #[must_use]
    pub fn new(specs: impl IntoIterator<Item = MachineSpec>) -> Self {
        Self {
            specs: specs
                .into_iter()
                .map(|spec| (spec.class.clone(), spec))
                .collect(),
        }
    }

    /// The catalog of classes offered by the hosted platform.
    #[must_use]
    pub fn builtin() -> Self {
        let spec = |class: MachineClass,
                    cpus,
                    memory_gb,
                    gpus,
                    gpu_model: Option<&str>,
                    cost_cents_per_hour,
                    capacity| MachineSpec {
            class,
            cpus,
            memory_gb,
            gpus,
            gpu_model: gpu_model.map(str::to_string),
            cost_cents_per_hour,
            capacity,
        };

        Self::new([
            spec(MachineClass::CPU_4, 4, 16, 0, None, 0, 512),
            spec(MachineClass::CPU_8, 8, 32, 0, None, 40, 256),
            spec(MachineClass::DATA_PREP, 32, 128, 0, None, 160, 64),
            spec(MachineClass::T4, 4, 16, 1, Some("T4"), 68, 128),
            spec(MachineClass::T4_X_4, 48, 192, 4, Some("T4"), 436, 32),
            spec(MachineClass::L4, 4, 16, 1, Some("L4"), 98, 128),
            spec(MachineClass::A10G, 4, 16, 1, Some("A10G"), 180, 64),
            spec(MachineClass::A10G_X_4, 48, 192, 4, Some("A10G"), 816, 16),
            spec(MachineClass::A100_X_8, 96, 1152, 8, Some("A100"), 3277, 8),
            spec(MachineClass::H100_X_8, 192, 2048, 8, Some("H100"), 9828, 8),
        ])
    }

    /// Look up a class.
    #[must_use]
    pub fn get(&self, class: &MachineClass) -> Option<&MachineSpec> {
        self.specs.get(class)
    }

    /// Look up a class that must exist.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::UnknownMachine` if the class is not in the catalog.
    pub fn require(&self, class: &MachineClass) -> Result<&MachineSpec, CoreError> {
        self.get(class)
            .ok_or_else(|| CoreError::UnknownMachine(class.clone()))
    }

    /// True if the class is known.
    #[must_use]
    pub fn contains(&self, class: &MachineClass) -> bool {
        self.specs.contains_key(class)
    }

    /// Fleet capacity for a class, or 0 if unknown.
    #[must_use]
    pub fn capacity(&self, class: &MachineClass) -> u32 {
        self.get(class).map_or(0, |s| s.capacity)
    }

    /// Iterate over all specs in class-name order.
    pub fn iter(&self) -> impl Iterator<Item = &MachineSpec> {
        self.specs.values()
    }

    /// Number of known classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// True if the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
