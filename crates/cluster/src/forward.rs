use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

/// TCP forwarding tool. One process per published VM port.
const FORWARD_TOOL: &str = "socat";

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("failed to spawn port forwarder: {0}")]
    Spawn(String),
}

/// Handle on a running forwarder process.
#[async_trait]
pub trait ForwardHandle: Send + Sync {
    async fn terminate(&mut self);
}

/// Spawns user-space TCP forwarders from a host port to a guest address.
///
/// Only VM environments need this; containers publish ports natively
/// through the container runtime.
#[async_trait]
pub trait PortForwarder: Send + Sync {
    async fn forward(
        &self,
        dest_ip: &str,
        dest_port: u16,
        host_port: u16,
    ) -> Result<Box<dyn ForwardHandle>, ForwardError>;
}

/// Production forwarder spawning `socat` listen/fork processes.
pub struct Socat;

struct SocatHandle {
    child: tokio::process::Child,
    descr: String,
}

#[async_trait]
impl ForwardHandle for SocatHandle {
    async fn terminate(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
        debug!(forward = %self.descr, "terminated port forwarder");
    }
}

#[async_trait]
impl PortForwarder for Socat {
    async fn forward(
        &self,
        dest_ip: &str,
        dest_port: u16,
        host_port: u16,
    ) -> Result<Box<dyn ForwardHandle>, ForwardError> {
        let listen = format!("TCP-LISTEN:{host_port},fork,reuseaddr");
        let connect = format!("TCP:{dest_ip}:{dest_port}");
        let descr = format!("{host_port} -> {dest_ip}:{dest_port}");

        let child = Command::new(FORWARD_TOOL)
            .arg(&listen)
            .arg(&connect)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ForwardError::Spawn(format!("{FORWARD_TOOL} {listen} {connect}: {e}")))?;

        info!(forward = %descr, "started port forwarder");
        Ok(Box::new(SocatHandle { child, descr }))
    }
}
