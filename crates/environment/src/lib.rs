mod access;
pub mod ports;
mod resources;
mod status;

pub use access::{AccessInfo, render_access_info};
pub use resources::{NetworkUsage, ResourceUsage};
pub use status::Status;
