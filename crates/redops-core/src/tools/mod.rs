//! Tool layer: manifests, the local subprocess runtime, builtin meta-tools,
//! execution records, and the unified registry.

pub mod command;
pub mod manifest;
pub mod meta;
pub mod record;
pub mod registry;

pub use manifest::{load_manifests_from_dir, ParamFormat, ParamType, ParameterSpec, ToolManifest};
pub use record::{ExecutionFilter, ExecutionLog, ExecutionRecord, ExecutionStatus, ToolStats};
pub use registry::{CallOutcome, ToolDefinition, ToolOrigin, ToolRegistry};
