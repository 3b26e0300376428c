use ash::vk;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Device {0} does not support ray tracing")]
    UnsupportedDevice(String),

    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("Out of device memory allocating {name:?} ({size} bytes)")]
    OutOfMemory { name: String, size: u64 },

    #[error("Allocation of {name:?} failed: {reason}")]
    Allocation { name: String, reason: String },

    #[error("Acceleration structure {0:?} has no geometry")]
    EmptyGeometry(String),

    #[error("Geometry in {name:?} is invalid: {reason}")]
    InvalidGeometry { name: String, reason: String },

    #[error("Top level acceleration structure {0:?} has no instances")]
    EmptyInstances(String),

    #[error("Instance {index} is out of range for {count} instances")]
    InstanceOutOfRange { index: usize, count: usize },

    #[error("Layout contract violated: {0}")]
    LayoutContract(#[from] LayoutViolation),

    #[error("Buffer {name:?} is not host visible")]
    NotHostVisible { name: String },

    #[error("Access of {len} bytes at offset {offset} overflows buffer {name:?} of {size} bytes")]
    BufferOverflow {
        name: String,
        offset: u64,
        len: u64,
        size: u64,
    },

    #[error("Unknown {kind} {id}")]
    UnknownResource { kind: &'static str, id: u64 },

    #[error("Invalid command in {list:?}: {reason}")]
    InvalidCommand { list: String, reason: String },

    #[error("Invalid shader library {name:?}: {reason}")]
    InvalidShader { name: String, reason: String },

    #[error("Invalid argument for {name:?}: {reason}")]
    InvalidArgument { name: String, reason: String },
}

/// A mismatch between what a pipeline declares and what is bound or written
/// for it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutViolation {
    #[error("unknown program {0:?}")]
    UnknownProgram(String),

    #[error("program {0:?} is declared more than once")]
    DuplicateProgram(String),

    #[error("program {program:?} refers to missing entry point {entry_point:?}")]
    UnknownEntryPoint {
        program: String,
        entry_point: String,
    },

    #[error("program {0:?} has no binding layout")]
    MissingBindingLayout(String),

    #[error("program {0:?} has more than one binding layout")]
    DuplicateBindingLayout(String),

    #[error("no ray generation program declared")]
    MissingRayGeneration,

    #[error("ray generation record {0:?} added but one already exists")]
    DuplicateRayGeneration(String),

    #[error("program {program:?} is not a {expected} program")]
    WrongSection {
        program: String,
        expected: &'static str,
    },

    #[error("program {program:?} takes {expected} root arguments, got {actual}")]
    TooManyArguments {
        program: String,
        expected: usize,
        actual: usize,
    },

    #[error("root argument {slot} of program {program:?} does not match its binding slot")]
    ArgumentKind { program: String, slot: usize },

    #[error("descriptor slot {slot} is outside a table of {capacity} slots")]
    DescriptorSlotOutOfRange { slot: u32, capacity: u32 },

    #[error("descriptor range of {count} slots at {slot} overflows the slot index")]
    DescriptorRangeOverflow { slot: u32, count: u32 },

    #[error("descriptor slot {slot} holds {expected} but {actual} was written")]
    DescriptorKind {
        slot: u32,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("record for {program:?} holds an identifier from another pipeline")]
    StaleProgramIdentifier { program: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_violation_messages() {
        let violation = LayoutViolation::TooManyArguments {
            program: "Miss".to_string(),
            expected: 0,
            actual: 1,
        };
        assert_eq!(
            violation.to_string(),
            "program \"Miss\" takes 0 root arguments, got 1"
        );

        let error: Error = violation.into();
        assert_eq!(
            error.to_string(),
            "Layout contract violated: program \"Miss\" takes 0 root arguments, got 1"
        );
        let source = std::error::Error::source(&error).map(|source| source.to_string());
        assert_eq!(
            source.as_deref(),
            Some("program \"Miss\" takes 0 root arguments, got 1")
        );
    }
}
