//! Binding pools and the tables allocated from them
//!
//! A pool tracks its remaining capacity per descriptor kind itself, so
//! exhaustion is reported deterministically before the device is asked
//! for anything.

use crate::backend::{
    BindingPoolHandle, DescriptorKind, RenderDevice, TableHandle, TableLayoutEntry,
    TableLayoutHandle,
};
use crate::error::{FrameError, FrameResult, PoolLimit};

/// Declared capacity of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCapacities {
    counts: [u32; 6],
    /// Maximum number of tables outstanding at once
    pub max_tables: u32,
}

impl Default for PoolCapacities {
    fn default() -> Self {
        Self::uniform(10, 1000)
    }
}

impl PoolCapacities {
    /// Empty capacities; add kinds with [`PoolCapacities::with`].
    pub fn new(max_tables: u32) -> Self {
        Self {
            counts: [0; 6],
            max_tables,
        }
    }

    /// The same count for every kind
    pub fn uniform(count: u32, max_tables: u32) -> Self {
        Self {
            counts: [count; 6],
            max_tables,
        }
    }

    pub fn with(mut self, kind: DescriptorKind, count: u32) -> Self {
        self.counts[kind.index()] = count;
        self
    }

    pub fn get(&self, kind: DescriptorKind) -> u32 {
        self.counts[kind.index()]
    }

    /// Non-zero per-kind sizes, in the form the device expects
    pub fn sizes(&self) -> Vec<(DescriptorKind, u32)> {
        DescriptorKind::ALL
            .iter()
            .map(|&kind| (kind, self.get(kind)))
            .filter(|&(_, count)| count > 0)
            .collect()
    }
}

/// Layout of one table: the bindings of a single set index
#[derive(Debug, Clone)]
pub struct TableLayout {
    pub(crate) set: u32,
    pub(crate) handle: TableLayoutHandle,
    pub(crate) entries: Vec<TableLayoutEntry>,
}

impl TableLayout {
    /// Create the device layout for `entries` at set index `set`.
    pub fn new<D: RenderDevice>(
        device: &mut D,
        set: u32,
        entries: Vec<TableLayoutEntry>,
    ) -> FrameResult<Self> {
        let handle = device.create_table_layout(&entries)?;
        Ok(Self {
            set,
            handle,
            entries,
        })
    }

    pub fn set(&self) -> u32 {
        self.set
    }

    pub fn handle(&self) -> TableLayoutHandle {
        self.handle
    }

    pub fn entries(&self) -> &[TableLayoutEntry] {
        &self.entries
    }

    /// How many descriptors of `kind` a table with this layout consumes
    pub fn count(&self, kind: DescriptorKind) -> u32 {
        self.entries.iter().filter(|e| e.kind == kind).count() as u32
    }

    pub fn destroy<D: RenderDevice>(self, device: &mut D) {
        device.destroy_table_layout(self.handle);
    }
}

/// An allocated binding table
///
/// The identity is fixed for the lifetime of the pool; what each slot
/// points at changes through write batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingTable {
    handle: TableHandle,
    set: u32,
    pool: BindingPoolHandle,
}

impl BindingTable {
    pub fn handle(&self) -> TableHandle {
        self.handle
    }

    /// Set index this table binds to
    pub fn set(&self) -> u32 {
        self.set
    }

    pub fn pool(&self) -> BindingPoolHandle {
        self.pool
    }
}

/// A pool of descriptor capacity that hands out binding tables
pub struct BindingPool {
    label: String,
    handle: BindingPoolHandle,
    capacities: PoolCapacities,
    remaining: [u32; 6],
    outstanding: u32,
}

impl BindingPool {
    pub fn new<D: RenderDevice>(
        device: &mut D,
        label: &str,
        capacities: PoolCapacities,
    ) -> FrameResult<Self> {
        let handle = device.create_binding_pool(&capacities.sizes(), capacities.max_tables)?;
        log::debug!(
            "Created binding pool '{}' ({:?}, {} tables)",
            label,
            capacities.sizes(),
            capacities.max_tables
        );
        Ok(Self {
            label: label.to_string(),
            handle,
            capacities,
            remaining: capacities.counts,
            outstanding: 0,
        })
    }

    /// Allocate a table for `layout`.
    ///
    /// Fails with `ExhaustedPool` when any kind the layout needs has less
    /// remaining capacity than requested, or when the table limit is
    /// reached. A failed allocation leaves the pool unchanged.
    pub fn allocate<D: RenderDevice>(
        &mut self,
        device: &mut D,
        layout: &TableLayout,
    ) -> FrameResult<BindingTable> {
        if self.outstanding >= self.capacities.max_tables {
            log::debug!(
                "Binding pool '{}' exhausted: all {} tables allocated",
                self.label,
                self.capacities.max_tables
            );
            return Err(FrameError::ExhaustedPool {
                limit: PoolLimit::Tables,
                requested: 1,
                remaining: 0,
            });
        }

        for kind in DescriptorKind::ALL {
            let requested = layout.count(kind);
            let remaining = self.remaining[kind.index()];
            if requested > remaining {
                log::debug!(
                    "Binding pool '{}' exhausted: {:?} needs {}, {} remaining",
                    self.label,
                    kind,
                    requested,
                    remaining
                );
                return Err(FrameError::ExhaustedPool {
                    limit: PoolLimit::Kind(kind),
                    requested,
                    remaining,
                });
            }
        }

        let handle = device.allocate_table(self.handle, layout.handle)?;
        for kind in DescriptorKind::ALL {
            self.remaining[kind.index()] -= layout.count(kind);
        }
        self.outstanding += 1;

        log::trace!(
            "Binding pool '{}': allocated table for set {} ({} outstanding)",
            self.label,
            layout.set,
            self.outstanding
        );

        Ok(BindingTable {
            handle,
            set: layout.set,
            pool: self.handle,
        })
    }

    /// Invalidate every table from this pool and restore its capacity.
    ///
    /// Waits for the device to go idle first, so no in-flight work can
    /// still be reading one of the invalidated tables.
    pub fn reset<D: RenderDevice>(&mut self, device: &mut D) -> FrameResult<()> {
        device.wait_idle()?;
        device.reset_binding_pool(self.handle)?;
        self.remaining = self.capacities.counts;
        self.outstanding = 0;
        log::debug!("Reset binding pool '{}'", self.label);
        Ok(())
    }

    pub fn remaining(&self, kind: DescriptorKind) -> u32 {
        self.remaining[kind.index()]
    }

    pub fn outstanding_tables(&self) -> u32 {
        self.outstanding
    }

    pub fn capacities(&self) -> PoolCapacities {
        self.capacities
    }

    pub fn handle(&self) -> BindingPoolHandle {
        self.handle
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn destroy<D: RenderDevice>(self, device: &mut D) {
        device.destroy_binding_pool(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{RecordingDevice, ShaderStages};

    fn layout(device: &mut RecordingDevice, kinds: &[DescriptorKind]) -> TableLayout {
        let entries = kinds
            .iter()
            .enumerate()
            .map(|(binding, &kind)| TableLayoutEntry {
                binding: binding as u32,
                kind,
                stages: ShaderStages::FRAGMENT,
            })
            .collect();
        TableLayout::new(device, 0, entries).unwrap()
    }

    #[test]
    fn test_sampler_and_uniform_scenario() {
        let mut device = RecordingDevice::new();
        let capacities = PoolCapacities::new(1000)
            .with(DescriptorKind::CombinedImageSampler, 10)
            .with(DescriptorKind::UniformBuffer, 10);
        let mut pool = BindingPool::new(&mut device, "scenario", capacities).unwrap();

        let small = layout(
            &mut device,
            &[DescriptorKind::CombinedImageSampler, DescriptorKind::UniformBuffer],
        );
        for _ in 0..3 {
            pool.allocate(&mut device, &small).unwrap();
        }
        assert_eq!(pool.remaining(DescriptorKind::CombinedImageSampler), 7);
        assert_eq!(pool.remaining(DescriptorKind::UniformBuffer), 7);

        let greedy = layout(&mut device, &[DescriptorKind::CombinedImageSampler; 8]);
        let err = pool.allocate(&mut device, &greedy).unwrap_err();
        assert!(matches!(
            err,
            FrameError::ExhaustedPool {
                limit: PoolLimit::Kind(DescriptorKind::CombinedImageSampler),
                requested: 8,
                remaining: 7,
            }
        ));
        // A failed allocation consumes nothing
        assert_eq!(pool.remaining(DescriptorKind::CombinedImageSampler), 7);
        assert_eq!(pool.outstanding_tables(), 3);
    }

    #[test]
    fn test_exactly_the_crossing_allocation_fails() {
        let mut device = RecordingDevice::new();
        let capacities = PoolCapacities::new(100).with(DescriptorKind::Sampler, 10);
        let mut pool = BindingPool::new(&mut device, "samplers", capacities).unwrap();
        let three = layout(&mut device, &[DescriptorKind::Sampler; 3]);

        let mut results = Vec::new();
        for _ in 0..5 {
            results.push(pool.allocate(&mut device, &three).is_ok());
        }
        assert_eq!(results, vec![true, true, true, false, false]);
        assert_eq!(pool.remaining(DescriptorKind::Sampler), 1);
    }

    #[test]
    fn test_table_limit() {
        let mut device = RecordingDevice::new();
        let mut pool =
            BindingPool::new(&mut device, "tables", PoolCapacities::uniform(10, 2)).unwrap();
        let one = layout(&mut device, &[DescriptorKind::UniformBuffer]);

        pool.allocate(&mut device, &one).unwrap();
        pool.allocate(&mut device, &one).unwrap();
        assert!(matches!(
            pool.allocate(&mut device, &one),
            Err(FrameError::ExhaustedPool {
                limit: PoolLimit::Tables,
                requested: 1,
                remaining: 0,
            })
        ));
        assert_eq!(pool.outstanding_tables(), 2);
    }

    #[test]
    fn test_kind_without_capacity_is_exhausted() {
        let mut device = RecordingDevice::new();
        let capacities = PoolCapacities::new(10).with(DescriptorKind::UniformBuffer, 4);
        let mut pool = BindingPool::new(&mut device, "ubo-only", capacities).unwrap();
        let storage = layout(&mut device, &[DescriptorKind::StorageImage]);

        assert!(matches!(
            pool.allocate(&mut device, &storage),
            Err(FrameError::ExhaustedPool {
                limit: PoolLimit::Kind(DescriptorKind::StorageImage),
                requested: 1,
                remaining: 0,
            })
        ));
    }

    #[test]
    fn test_reset_waits_and_restores_capacity() {
        let mut device = RecordingDevice::new();
        let mut pool =
            BindingPool::new(&mut device, "reset", PoolCapacities::uniform(2, 10)).unwrap();
        let two = layout(&mut device, &[DescriptorKind::SampledImage; 2]);
        let table = pool.allocate(&mut device, &two).unwrap();
        assert!(pool.allocate(&mut device, &two).is_err());

        pool.reset(&mut device).unwrap();

        assert_eq!(device.wait_idle_calls(), 1);
        assert!(!device.is_table_valid(table.handle()));
        assert_eq!(pool.remaining(DescriptorKind::SampledImage), 2);
        assert_eq!(pool.outstanding_tables(), 0);
        assert!(pool.allocate(&mut device, &two).is_ok());
    }

    #[test]
    fn test_default_capacities() {
        let capacities = PoolCapacities::default();
        assert_eq!(capacities.max_tables, 1000);
        for kind in DescriptorKind::ALL {
            assert_eq!(capacities.get(kind), 10);
        }
        assert_eq!(capacities.sizes().len(), DescriptorKind::ALL.len());
    }
}
