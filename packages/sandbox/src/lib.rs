// ABOUTME: Sandbox orchestration core: mount mapping, image build, container run, log framing
// ABOUTME: Client of the Docker engine through bollard; implements no engine itself

pub mod blockquote;
pub mod error;
pub mod image;
pub mod mounts;
pub mod runner;

pub use blockquote::{BlockquoteWriter, LineState, StreamIndenter};
pub use error::{Result, SandboxError};
pub use image::{BuildContext, ImageBuildRequest, ImageBuilder};
pub use mounts::{BindMode, DeviceMap, DeviceMode, MountMap, VolumeMap, VolumeMode};
pub use runner::{ContainerRunner, RunOptions, RunOutcome, RunRequest, EXIT_CODE_UNKNOWN};
