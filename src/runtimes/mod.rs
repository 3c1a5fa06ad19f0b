pub mod container;
pub mod docker;
pub mod script;

pub use container::{CapturedOutput, ContainerExecutor, ContainerRuntime, ContainerSpec, RuntimeError};
pub use docker::DockerRuntime;
pub use script::ScriptExecutor;
