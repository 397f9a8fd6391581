//! Tool Executor: registers named filesystem, memory, and stub browser/vnc/
//! vision operations, validates calls against their JSON Schema, and runs
//! them. Real automation backends for `browser_*`/`vnc_*`/`vision_*` are out
//! of scope; those operations still validate arguments and report a
//! structured "no backend configured" error under their real output tag.

pub mod fs;
pub mod memory;
pub mod registry;
pub mod stub;

pub use registry::{dispatch_tool, tool_definitions, ToolContext};
