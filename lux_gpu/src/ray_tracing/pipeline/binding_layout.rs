use crate::{
    error::LayoutViolation,
    ray_tracing::{DescriptorKind, DescriptorTableLayout},
};
use ash::vk;

/// A run of descriptor table slots visible to a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorRange {
    pub kind: DescriptorKind,
    /// First slot of the table covered by the range.
    pub slot: u32,
    pub count: u32,
}

impl DescriptorRange {
    pub fn new(kind: DescriptorKind, slot: u32, count: u32) -> Self {
        Self { kind, slot, count }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingSlot {
    /// Filled with a descriptor table handle.
    DescriptorTable(Vec<DescriptorRange>),
    /// Filled with the device address of a read-only buffer.
    ShaderResource,
    /// Filled with the device address of a constant buffer.
    ConstantBuffer,
}

/// One 8 byte value of a shader binding table record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootArgument {
    DescriptorTable(u64),
    DeviceAddress(vk::DeviceAddress),
}

impl RootArgument {
    pub const SIZE: u64 = 8;

    pub fn to_bytes(self) -> [u8; 8] {
        match self {
            RootArgument::DescriptorTable(handle) => handle.to_le_bytes(),
            RootArgument::DeviceAddress(address) => address.to_le_bytes(),
        }
    }

    pub fn fits(&self, slot: &BindingSlot) -> bool {
        matches!(
            (self, slot),
            (RootArgument::DescriptorTable(_), BindingSlot::DescriptorTable(_))
                | (RootArgument::DeviceAddress(_), BindingSlot::ShaderResource)
                | (RootArgument::DeviceAddress(_), BindingSlot::ConstantBuffer)
        )
    }
}

/// The ordered root arguments a program expects in its shader binding
/// table record. Shared by every program with the same needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingLayout {
    name: String,
    slots: Vec<BindingSlot>,
}

impl BindingLayout {
    pub fn new(name: impl Into<String>, slots: Vec<BindingSlot>) -> Self {
        Self {
            name: name.into(),
            slots,
        }
    }

    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, vec![])
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slots(&self) -> &[BindingSlot] {
        &self.slots
    }

    /// Bytes of root arguments in a record using every slot.
    pub fn arguments_size(&self) -> u64 {
        self.slots.len() as u64 * RootArgument::SIZE
    }

    /// Arguments fill slots in order. Trailing slots may be left out and
    /// read as zero.
    pub fn check_arguments(
        &self,
        program: &str,
        arguments: &[RootArgument],
    ) -> Result<(), LayoutViolation> {
        if arguments.len() > self.slots.len() {
            return Err(LayoutViolation::TooManyArguments {
                program: program.to_string(),
                expected: self.slots.len(),
                actual: arguments.len(),
            });
        }

        for (slot, (argument, binding)) in arguments.iter().zip(&self.slots).enumerate() {
            if !argument.fits(binding) {
                return Err(LayoutViolation::ArgumentKind {
                    program: program.to_string(),
                    slot,
                });
            }
        }

        Ok(())
    }

    /// Every descriptor range must land on table slots of its kind.
    pub fn check_table(&self, table: &DescriptorTableLayout) -> Result<(), LayoutViolation> {
        let ranges = self
            .slots
            .iter()
            .filter_map(|slot| match slot {
                BindingSlot::DescriptorTable(ranges) => Some(ranges),
                _ => None,
            })
            .flatten();

        for range in ranges {
            let end = range.slot.checked_add(range.count).ok_or(
                LayoutViolation::DescriptorRangeOverflow {
                    slot: range.slot,
                    count: range.count,
                },
            )?;
            for slot in range.slot..end {
                table.check(slot, range.kind)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit_layout() -> BindingLayout {
        BindingLayout::new(
            "hit",
            vec![
                BindingSlot::ShaderResource,
                BindingSlot::ShaderResource,
                BindingSlot::DescriptorTable(vec![DescriptorRange::new(
                    DescriptorKind::AccelerationStructure,
                    DescriptorTableLayout::SCENE,
                    1,
                )]),
            ],
        )
    }

    #[test]
    fn test_trailing_arguments_may_be_omitted() {
        let layout = hit_layout();

        assert_eq!(layout.check_arguments("CubeHitGroup", &[]), Ok(()));
        assert_eq!(
            layout.check_arguments("CubeHitGroup", &[RootArgument::DeviceAddress(0x1000)]),
            Ok(())
        );
        assert_eq!(layout.arguments_size(), 24);
    }

    #[test]
    fn test_argument_kind_mismatch() {
        let layout = hit_layout();

        assert_eq!(
            layout.check_arguments("PlaneHitGroup", &[RootArgument::DescriptorTable(1)]),
            Err(LayoutViolation::ArgumentKind {
                program: "PlaneHitGroup".to_string(),
                slot: 0
            })
        );
    }

    #[test]
    fn test_too_many_arguments() {
        let layout = BindingLayout::empty("miss");

        assert!(matches!(
            layout.check_arguments("Miss", &[RootArgument::DeviceAddress(0)]),
            Err(LayoutViolation::TooManyArguments {
                expected: 0,
                actual: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_check_table() {
        let table = DescriptorTableLayout::ray_generation();
        assert_eq!(hit_layout().check_table(&table), Ok(()));

        let overflowing = BindingLayout::new(
            "raygen",
            vec![BindingSlot::DescriptorTable(vec![DescriptorRange::new(
                DescriptorKind::UniformBuffer,
                DescriptorTableLayout::CAMERA,
                2,
            )])],
        );
        assert_eq!(
            overflowing.check_table(&table),
            Err(LayoutViolation::DescriptorSlotOutOfRange {
                slot: 3,
                capacity: 3
            })
        );
    }

    #[test]
    fn test_check_table_range_overflow() {
        let table = DescriptorTableLayout::ray_generation();
        let wrapping = BindingLayout::new(
            "raygen",
            vec![BindingSlot::DescriptorTable(vec![DescriptorRange::new(
                DescriptorKind::StorageImage,
                u32::MAX,
                2,
            )])],
        );

        assert_eq!(
            wrapping.check_table(&table),
            Err(LayoutViolation::DescriptorRangeOverflow {
                slot: u32::MAX,
                count: 2
            })
        );
    }
}
