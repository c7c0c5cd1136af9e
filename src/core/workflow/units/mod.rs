pub mod command;
pub mod echo;
pub mod noop;
pub mod set_context;

pub use command::{CommandExecutionOutput, CommandExecutionRequest, CommandRunner, CommandUnit};
pub use echo::EchoUnit;
pub use noop::NoOpUnit;
pub use set_context::SetContextUnit;
