mod image;
mod profile;
mod runner;

pub use image::{ensure_image, image_exists, remove_image};
pub use profile::profile_tar;
pub use runner::{run_session_sandbox, SandboxIo, SandboxRequest};
