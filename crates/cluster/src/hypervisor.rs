use async_trait::async_trait;

use crate::command::{CommandError, exec, exec_ignore_errors, exec_stdin};

#[derive(Debug, thiserror::Error)]
pub enum HypervisorError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("unparseable hypervisor output: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, HypervisorError>;

/// Libvirt domain run state, as reported by `virsh domstate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    NoState,
    Running,
    /// Idle (blocked on resources).
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
}

impl DomainState {
    /// Parse the one-line `virsh domstate` output. Unrecognized strings
    /// collapse to [`DomainState::NoState`].
    pub fn parse(output: &str) -> Self {
        match output.trim() {
            "running" => Self::Running,
            "idle" => Self::Blocked,
            "paused" => Self::Paused,
            "in shutdown" => Self::Shutdown,
            "shut off" => Self::Shutoff,
            "crashed" => Self::Crashed,
            "pmsuspended" => Self::PmSuspended,
            _ => Self::NoState,
        }
    }
}

/// Guest memory counters from `virsh dommemstat`, in KiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomainMemoryStats {
    pub rss_kib: Option<u64>,
    pub actual_kib: Option<u64>,
}

/// Byte counters of one guest interface from `virsh domifstat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Facade over the host hypervisor.
///
/// Domain and network teardown methods are best-effort by contract so
/// repeated cleanup is always safe; everything else surfaces the tool
/// failure to the caller.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn define_domain(&self, xml: &str) -> Result<()>;
    async fn start_domain(&self, name: &str) -> Result<()>;
    async fn reboot_domain(&self, name: &str) -> Result<()>;
    async fn destroy_domain(&self, name: &str);
    async fn undefine_domain(&self, name: &str);
    async fn domain_state(&self, name: &str) -> Result<DomainState>;
    async fn domain_xml(&self, name: &str) -> Result<String>;
    async fn domain_memory_stats(&self, name: &str) -> Result<DomainMemoryStats>;
    /// "Used memory" from `virsh dominfo`, in KiB.
    async fn domain_used_memory_kib(&self, name: &str) -> Result<u64>;
    async fn interface_stats(&self, name: &str, device: &str) -> Result<InterfaceStats>;

    async fn define_network(&self, xml: &str) -> Result<()>;
    async fn start_network(&self, name: &str) -> Result<()>;
    async fn autostart_network(&self, name: &str) -> Result<()>;
    async fn destroy_network(&self, name: &str);
    async fn undefine_network(&self, name: &str);
}

/// Production hypervisor driving the `virsh` CLI, optionally against an
/// explicit connection URI (`LIBVIRT_CLIENT`).
pub struct Virsh {
    uri: Option<String>,
}

impl Virsh {
    pub fn new(uri: Option<String>) -> Self {
        Self { uri }
    }

    fn args<'a>(&'a self, rest: &[&'a str]) -> Vec<&'a str> {
        let mut args = Vec::with_capacity(rest.len() + 2);
        if let Some(uri) = &self.uri {
            args.push("-c");
            args.push(uri.as_str());
        }
        args.extend_from_slice(rest);
        args
    }

    async fn run(&self, rest: &[&str]) -> Result<String> {
        Ok(exec("virsh", &self.args(rest)).await?)
    }

    async fn run_ignore_errors(&self, rest: &[&str]) {
        exec_ignore_errors("virsh", &self.args(rest)).await;
    }
}

#[async_trait]
impl Hypervisor for Virsh {
    async fn define_domain(&self, xml: &str) -> Result<()> {
        exec_stdin("virsh", &self.args(&["define", "/dev/stdin"]), xml).await?;
        Ok(())
    }

    async fn start_domain(&self, name: &str) -> Result<()> {
        self.run(&["start", name]).await.map(|_| ())
    }

    async fn reboot_domain(&self, name: &str) -> Result<()> {
        self.run(&["reboot", name]).await.map(|_| ())
    }

    async fn destroy_domain(&self, name: &str) {
        self.run_ignore_errors(&["destroy", name]).await;
    }

    async fn undefine_domain(&self, name: &str) {
        self.run_ignore_errors(&["undefine", name]).await;
    }

    async fn domain_state(&self, name: &str) -> Result<DomainState> {
        let output = self.run(&["domstate", name]).await?;
        Ok(DomainState::parse(&output))
    }

    async fn domain_xml(&self, name: &str) -> Result<String> {
        self.run(&["dumpxml", name]).await
    }

    async fn domain_memory_stats(&self, name: &str) -> Result<DomainMemoryStats> {
        let output = self.run(&["dommemstat", name]).await?;
        Ok(parse_memory_stats(&output))
    }

    async fn domain_used_memory_kib(&self, name: &str) -> Result<u64> {
        let output = self.run(&["dominfo", name]).await?;
        parse_used_memory(&output)
            .ok_or_else(|| HypervisorError::Parse(format!("no used memory in dominfo: {output}")))
    }

    async fn interface_stats(&self, name: &str, device: &str) -> Result<InterfaceStats> {
        let output = self.run(&["domifstat", name, device]).await?;
        Ok(parse_interface_stats(&output))
    }

    async fn define_network(&self, xml: &str) -> Result<()> {
        exec_stdin("virsh", &self.args(&["net-define", "/dev/stdin"]), xml).await?;
        Ok(())
    }

    async fn start_network(&self, name: &str) -> Result<()> {
        self.run(&["net-start", name]).await.map(|_| ())
    }

    async fn autostart_network(&self, name: &str) -> Result<()> {
        self.run(&["net-autostart", name]).await.map(|_| ())
    }

    async fn destroy_network(&self, name: &str) {
        self.run_ignore_errors(&["net-destroy", name]).await;
    }

    async fn undefine_network(&self, name: &str) {
        self.run_ignore_errors(&["net-undefine", name]).await;
    }
}

/// Parse `virsh dommemstat` output: one `<key> <value>` pair per line.
fn parse_memory_stats(output: &str) -> DomainMemoryStats {
    let mut stats = DomainMemoryStats::default();
    for line in output.lines() {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("rss"), Some(value)) => stats.rss_kib = value.parse().ok(),
            (Some("actual"), Some(value)) => stats.actual_kib = value.parse().ok(),
            _ => {}
        }
    }
    stats
}

/// Extract the "Used memory" KiB value from `virsh dominfo` output.
fn parse_used_memory(output: &str) -> Option<u64> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("Used memory:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

/// Parse `virsh domifstat` output: `<dev> <counter> <value>` per line.
fn parse_interface_stats(output: &str) -> InterfaceStats {
    let mut stats = InterfaceStats::default();
    for line in output.lines() {
        let mut parts = line.split_whitespace();
        let (_dev, counter, value) = (parts.next(), parts.next(), parts.next());
        match (counter, value.and_then(|v| v.parse::<u64>().ok())) {
            (Some("rx_bytes"), Some(v)) => stats.rx_bytes = v,
            (Some("tx_bytes"), Some(v)) => stats.tx_bytes = v,
            _ => {}
        }
    }
    stats
}
